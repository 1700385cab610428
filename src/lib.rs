//! Per-address admission control for axum services.
//!
//! An [`AdmissionFilter`] keeps one [`ClientRecord`] per client address and
//! rejects requests that exceed the request-rate, connection, refresh or
//! failure limits of its [`LimiterConfig`].

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod state;
pub mod transport;

pub use address::AddressKey;
pub use client::ClientRecord;
pub use config::{Args, LimiterConfig, RejectHandler};
pub use error::{Error, Result};
pub use limiter::{Admission, AdmissionFilter, RejectReason};
pub use middleware::admission_control;
pub use transport::{ConnectionHandle, PeerConnection, ResponseHandle, TrackedListener};
