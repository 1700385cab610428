//! Per-address state and the four limit checks.
//!
//! A [`ClientRecord`] keeps every counter for one client behind a single
//! mutex, so each check is atomic with respect to concurrent requests from
//! the same address. Close and completion observers only hold a weak
//! reference back to the record.

use axum::http::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::Instant;
use tracing::debug;

use crate::address::AddressKey;
use crate::config::LimiterConfig;
use crate::limiter::AddressTable;
use crate::transport::{ConnectionHandle, ConnectionId, ResponseHandle, lock};

struct ClientState {
    // connections seen and not yet closed; its size is the active count
    connections: HashSet<ConnectionId>,
    request_count: u64,
    window_start: Instant,
    failure_count: u64,
    last_seen_at: Instant,
    path_last_visited: HashMap<String, Instant>,
}

pub struct ClientRecord {
    key: AddressKey,
    address: String,
    state: Mutex<ClientState>,
    table: Weak<AddressTable>,
}

impl ClientRecord {
    pub(crate) fn new(key: AddressKey, table: Weak<AddressTable>) -> Self {
        let now = Instant::now();
        debug!(address = %key, "new client");

        Self {
            key,
            address: key.to_string(),
            state: Mutex::new(ClientState {
                connections: HashSet::new(),
                request_count: 0,
                window_start: now,
                failure_count: 0,
                last_seen_at: now,
                path_last_visited: HashMap::new(),
            }),
            table,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    pub fn key(&self) -> AddressKey {
        self.key
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn active_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn request_count(&self) -> u64 {
        self.lock().request_count
    }

    pub fn failure_count(&self) -> u64 {
        self.lock().failure_count
    }

    pub fn last_seen_at(&self) -> Instant {
        self.lock().last_seen_at
    }

    /// Stamps the arrival of a request. Every check below measures time
    /// from this stamp.
    pub fn on_request_received(&self) {
        self.lock().last_seen_at = Instant::now();
    }

    /// Counts the request in the current window. A request that opens a new
    /// window is never over the limit.
    pub fn check_request_limit(&self, config: &LimiterConfig) -> bool {
        let mut state = self.lock();
        let now = state.last_seen_at;

        state.request_count += 1;

        if now.duration_since(state.window_start) > config.interval {
            state.window_start = now;
            state.request_count = 1;
            state.failure_count = 0;
            debug!(address = %self.address, "reset counters");
            return false;
        }

        state.request_count > config.limit
    }

    /// Counts `connection` the first time this record sees it and releases
    /// it again when the connection closes.
    pub fn check_connection_limit(
        self: &Arc<Self>,
        config: &LimiterConfig,
        connection: &ConnectionHandle,
    ) -> bool {
        let id = connection.id();
        let (first_seen, active) = {
            let mut state = self.lock();
            let first_seen = state.connections.insert(id);
            (first_seen, state.connections.len())
        };

        if first_seen {
            debug!(address = %self.address, total = active, "new connection");
            // registered without the record lock: a closed connection runs
            // the observer right here
            let record = Arc::downgrade(self);
            connection.on_close(move || {
                if let Some(record) = record.upgrade() {
                    record.release_connection(id);
                }
            });
        }

        active as u64 > config.connections
    }

    fn release_connection(&self, id: ConnectionId) {
        let remaining = {
            let mut state = self.lock();
            if !state.connections.remove(&id) {
                return;
            }
            state.connections.len()
        };

        debug!(address = %self.address, total = remaining, "connection closed");
        if remaining == 0 {
            self.remove();
        }
    }

    // Queues this address for the next eviction sweep
    fn remove(&self) {
        if let Some(table) = self.table.upgrade() {
            table.queue_removal(self.key);
        }
    }

    /// Flags rapid repeated hits on the same path.
    pub fn check_refresh_limit(&self, config: &LimiterConfig, path: &str) -> bool {
        let mut state = self.lock();
        let now = state.last_seen_at;

        match state.path_last_visited.insert(path.to_string(), now) {
            Some(last) => now.duration_since(last) <= config.refresh_interval,
            None => false,
        }
    }

    /// Compares failures counted so far with the limit, then arranges for
    /// this request's own outcome to be counted once its response completes.
    pub fn check_failure_limit(self: &Arc<Self>, config: &LimiterConfig, response: &ResponseHandle) -> bool {
        // read before subscribing so a request never trips on its own failure
        let over = self.failure_count() >= config.failure_limit;

        let record = Arc::downgrade(self);
        response.on_complete(move |status| {
            if let Some(record) = record.upgrade() {
                record.record_outcome(status);
            }
        });

        over
    }

    fn record_outcome(&self, status: StatusCode) {
        if status == StatusCode::OK || status == StatusCode::NOT_MODIFIED {
            return;
        }

        let mut state = self.lock();
        state.failure_count += 1;
        debug!(address = %self.address, %status, total = state.failure_count, "failed response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;

    fn record() -> Arc<ClientRecord> {
        Arc::new(ClientRecord::new(AddressKey::parse("127.0.0.1"), Weak::new()))
    }

    fn connection() -> ConnectionHandle {
        ConnectionHandle::new("127.0.0.1:50000".parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_limit_within_window() {
        let config = LimiterConfig {
            limit: 2,
            interval: Duration::from_millis(1000),
            ..Default::default()
        };
        let client = record();

        for expected in [false, false, true, true] {
            client.on_request_received();
            assert_eq!(client.check_request_limit(&config), expected);
        }
        assert_eq!(client.request_count(), 4);

        // the window boundary itself still belongs to the old window
        advance(Duration::from_millis(1000)).await;
        client.on_request_received();
        assert!(client.check_request_limit(&config));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_limit_resets_after_window() {
        let config = LimiterConfig {
            limit: 1,
            interval: Duration::from_millis(1000),
            ..Default::default()
        };
        let client = record();

        client.on_request_received();
        assert!(!client.check_request_limit(&config));
        client.on_request_received();
        assert!(client.check_request_limit(&config));

        let response = ResponseHandle::new();
        client.check_failure_limit(&config, &response);
        response.complete(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(client.failure_count(), 1);

        advance(Duration::from_millis(1001)).await;
        client.on_request_received();
        assert!(!client.check_request_limit(&config));
        assert_eq!(client.request_count(), 1);
        assert_eq!(client.failure_count(), 0);

        client.on_request_received();
        assert!(client.check_request_limit(&config));
    }

    #[tokio::test]
    async fn test_connection_counted_once() {
        let config = LimiterConfig {
            connections: 1,
            ..Default::default()
        };
        let client = record();
        let first = connection();

        assert!(!client.check_connection_limit(&config, &first));
        assert!(!client.check_connection_limit(&config, &first));
        assert_eq!(client.active_connections(), 1);

        let second = connection();
        assert!(client.check_connection_limit(&config, &second));
        assert_eq!(client.active_connections(), 2);

        first.close();
        assert_eq!(client.active_connections(), 1);
        second.close();
        second.close();
        assert_eq!(client.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_released_immediately() {
        let client = record();
        let conn = connection();
        conn.close();

        assert!(!client.check_connection_limit(&LimiterConfig::default(), &conn));
        assert_eq!(client.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_limit() {
        let config = LimiterConfig {
            refresh_interval: Duration::from_millis(500),
            ..Default::default()
        };
        let client = record();

        client.on_request_received();
        assert!(!client.check_refresh_limit(&config, "/"));

        advance(Duration::from_millis(100)).await;
        client.on_request_received();
        assert!(client.check_refresh_limit(&config, "/"));
        // other paths are tracked separately
        assert!(!client.check_refresh_limit(&config, "/other"));

        advance(Duration::from_millis(600)).await;
        client.on_request_received();
        assert!(!client.check_refresh_limit(&config, "/"));

        // exactly the interval is still too soon
        advance(Duration::from_millis(500)).await;
        client.on_request_received();
        assert!(client.check_refresh_limit(&config, "/"));
    }

    #[tokio::test]
    async fn test_failure_limit_counts_after_completion() {
        let config = LimiterConfig {
            failure_limit: 2,
            ..Default::default()
        };
        let client = record();

        for status in [StatusCode::NOT_FOUND, StatusCode::OK, StatusCode::NOT_MODIFIED, StatusCode::BAD_GATEWAY] {
            let response = ResponseHandle::new();
            assert!(!client.check_failure_limit(&config, &response));
            response.complete(status);
        }
        assert_eq!(client.failure_count(), 2);

        let response = ResponseHandle::new();
        assert!(client.check_failure_limit(&config, &response));
    }

    #[tokio::test]
    async fn test_already_completed_response_is_not_its_own_failure() {
        let config = LimiterConfig {
            failure_limit: 1,
            ..Default::default()
        };
        let client = record();
        let response = ResponseHandle::new();
        response.complete(StatusCode::NOT_FOUND);

        assert!(!client.check_failure_limit(&config, &response));
        assert_eq!(client.failure_count(), 1);
    }
}
