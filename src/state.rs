use std::sync::Arc;
use crate::limiter::AdmissionFilter;
// app's shared state

pub struct AppState {
    pub client: reqwest::Client,
    pub upstream: String,               // base url admitted requests go to
    pub filter: Arc<AdmissionFilter>,
}

impl AppState {
    pub fn new(upstream: impl Into<String>, filter: Arc<AdmissionFilter>) -> Self {
        let upstream = upstream.into();
        // add http:// if not present
        let upstream = if upstream.starts_with("http") {
            upstream
        } else {
            format!("http://{}", upstream)
        };

        Self {
            client: reqwest::Client::new(),
            upstream: upstream.trim_end_matches('/').to_string(),
            filter,
        }
    }
}
