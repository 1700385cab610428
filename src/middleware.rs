use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::limiter::{Admission, AdmissionFilter};
use crate::transport::{ConnectionHandle, PeerConnection, ResponseHandle};

// Admission control as an axum middleware:
// `middleware::from_fn_with_state(filter, admission_control)`.
//
// Requests served through a `TrackedListener` are attributed to their real
// connection. Without one, each request counts as a connection of its own
// that closes as soon as the response is ready. Routers served without any
// connect info put their clients in the `unknown` bucket.
pub async fn admission_control(
    State(filter): State<Arc<AdmissionFilter>>,
    request: Request,
    next: Next,
) -> Response {
    let (connection, ephemeral) = match request.extensions().get::<ConnectInfo<PeerConnection>>() {
        Some(ConnectInfo(peer)) => (peer.connection.clone(), false),
        None => {
            let connection = match request.extensions().get::<ConnectInfo<SocketAddr>>() {
                Some(ConnectInfo(addr)) => ConnectionHandle::new(*addr),
                None => ConnectionHandle::unattributed(),
            };
            (connection, true)
        }
    };

    let completion = ResponseHandle::new();
    let response = match filter.check(&request, &connection, &completion) {
        Admission::Admit => next.run(request).await,
        Admission::Reject(reason) => filter.reject(reason, &request),
    };
    completion.complete(response.status());

    if ephemeral {
        connection.close();
    }
    response
}
