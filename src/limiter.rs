//! The admission filter: address table, request evaluation and eviction.
//!
//! Records whose last connection closed are queued for removal rather than
//! dropped on the spot. A repeating sweep, one window apart, removes each
//! queued address whose record still has no open connection, so a client
//! that reconnects between queueing and sweeping keeps its counters.

use axum::extract::Request;
use axum::http;
use axum::response::Response;
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use prometheus::IntGauge;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::address::{self, AddressKey};
use crate::client::ClientRecord;
use crate::config::LimiterConfig;
use crate::error::{Error, Result};
use crate::metrics::{ADMITTED_TOTAL, EVICTED_TOTAL, REJECTED_TOTAL, TRACKED_CLIENTS};
use crate::transport::{ConnectionHandle, ResponseHandle, lock};

// tokio intervals can't tick every 0ms
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a request was turned away. The numeric codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    RequestLimit = 1,
    ConnectionLimit = 2,
    RefreshLimit = 3,
    FailureLimit = 4,
}

impl RejectReason {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::RequestLimit => "request_limit",
            RejectReason::ConnectionLimit => "connection_limit",
            RejectReason::RefreshLimit => "refresh_limit",
            RejectReason::FailureLimit => "failure_limit",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(RejectReason),
}

// Address table shared between the filter, its records and the sweep task
pub(crate) struct AddressTable {
    clients: DashMap<AddressKey, Arc<ClientRecord>>,
    removals: Mutex<Vec<AddressKey>>,
    // this filter's series of TRACKED_CLIENTS
    tracked: IntGauge,
}

impl AddressTable {
    fn new(tracked: IntGauge) -> Self {
        Self {
            clients: DashMap::new(),
            removals: Mutex::new(Vec::new()),
            tracked,
        }
    }

    pub(crate) fn queue_removal(&self, key: AddressKey) {
        lock(&self.removals).push(key);
    }

    fn sweep(&self) -> usize {
        // drain first: close observers push while holding no table lock
        let queued = std::mem::take(&mut *lock(&self.removals));
        let mut removed = 0;

        for key in queued {
            if self
                .clients
                .remove_if(&key, |_, record| record.active_connections() == 0)
                .is_some()
            {
                debug!(address = %key, "remove client");
                removed += 1;
            }
        }

        if removed > 0 {
            EVICTED_TOTAL.inc_by(removed as u64);
            self.tracked.sub(removed as i64);
        }
        removed
    }
}

/// Per-address admission control. See the module docs for the eviction policy.
///
/// Must be created inside a tokio runtime; the sweep task stops on
/// [`AdmissionFilter::shutdown`] or when the filter is dropped. A filter
/// that has been shut down admits every request without tracking it.
pub struct AdmissionFilter {
    id: String,
    config: LimiterConfig,
    table: Arc<AddressTable>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl AdmissionFilter {
    pub fn new(config: LimiterConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("admission filter needs a tokio runtime: {}", e)))?;

        let id = NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed).to_string();
        let tracked = TRACKED_CLIENTS.with_label_values(&[id.as_str()]);
        let table = Arc::new(AddressTable::new(tracked));
        let period = config.interval.max(MIN_SWEEP_PERIOD);
        let sweeper = runtime.spawn(sweep_loop(Arc::downgrade(&table), period));

        info!(filter = %id, ?config, "created admission filter");

        Ok(Self {
            id,
            config,
            table,
            sweeper: Mutex::new(Some(sweeper)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Process-unique id, also the `filter` label of this filter's metrics.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn entry(&self, key: AddressKey) -> RefMut<'_, AddressKey, Arc<ClientRecord>> {
        self.table.clients.entry(key).or_insert_with(|| {
            self.table.tracked.inc();
            Arc::new(ClientRecord::new(key, Arc::downgrade(&self.table)))
        })
    }

    /// Returns the record for `address`, creating it on first sight.
    /// Unparseable addresses share the `unknown` record.
    pub fn lookup_or_create(&self, address: &str) -> Arc<ClientRecord> {
        Arc::clone(self.entry(AddressKey::parse(address)).value())
    }

    pub fn get(&self, address: &str) -> Option<Arc<ClientRecord>> {
        self.table
            .clients
            .get(&AddressKey::parse(address))
            .map(|record| Arc::clone(record.value()))
    }

    pub fn contains(&self, address: &str) -> bool {
        self.table.clients.contains_key(&AddressKey::parse(address))
    }

    pub fn client_count(&self) -> usize {
        self.table.clients.len()
    }

    /// Runs one eviction pass now and returns how many records it removed.
    pub fn sweep(&self) -> usize {
        self.table.sweep()
    }

    /// Decides whether `request`, arriving over `connection`, is admitted.
    ///
    /// Checks run in a fixed order and stop at the first violation:
    /// connections, request rate, refresh, failures. `response` must be
    /// completed with the final status once one exists.
    pub fn check<B>(
        &self,
        request: &http::Request<B>,
        connection: &ConnectionHandle,
        response: &ResponseHandle,
    ) -> Admission {
        if self.is_shut_down() {
            return Admission::Admit;
        }

        let key = address::resolve(request, connection.peer_addr(), &self.config);
        let path = request.uri().path();

        // registering the connection under the entry lock keeps the sweep
        // from removing the record between lookup and registration
        let (client, over_connections) = {
            let entry = self.entry(key);
            let client = Arc::clone(entry.value());
            client.on_request_received();
            let over = client.check_connection_limit(&self.config, connection);
            (client, over)
        };

        debug!(address = %key, path, "new request");

        if over_connections {
            return rejected(&client, RejectReason::ConnectionLimit);
        }

        if client.check_request_limit(&self.config) {
            return rejected(&client, RejectReason::RequestLimit);
        }

        if !self.config.refresh_interval.is_zero() && client.check_refresh_limit(&self.config, path) {
            return rejected(&client, RejectReason::RefreshLimit);
        }

        if self.config.failure_limit > 0 && client.check_failure_limit(&self.config, response) {
            return rejected(&client, RejectReason::FailureLimit);
        }

        ADMITTED_TOTAL.inc();
        Admission::Admit
    }

    /// Builds the rejection response through the configured handler.
    pub fn reject(&self, reason: RejectReason, request: &Request) -> Response {
        (self.config.reject_handler)(reason, request)
    }

    /// Stops the sweep task and forgets every client. Later requests are
    /// admitted untracked.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_sweeper();

        let mut removed = 0;
        self.table.clients.retain(|_, _| {
            removed += 1;
            false
        });
        lock(&self.table.removals).clear();
        self.table.tracked.sub(removed);

        info!(filter = %self.id, "admission filter shut down");
    }

    fn stop_sweeper(&self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            sweeper.abort();
        }
    }
}

impl Drop for AdmissionFilter {
    fn drop(&mut self) {
        self.stop_sweeper();
        // the series goes away with the filter; a missing one is fine
        let _ = TRACKED_CLIENTS.remove_label_values(&[self.id.as_str()]);
    }
}

fn rejected(client: &ClientRecord, reason: RejectReason) -> Admission {
    debug!(address = client.address(), %reason, "over limit");
    REJECTED_TOTAL.with_label_values(&[reason.as_str()]).inc();
    Admission::Reject(reason)
}

async fn sweep_loop(table: Weak<AddressTable>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(table) = table.upgrade() else {
            break;
        };
        let removed = table.sweep();
        if removed > 0 {
            info!(removed, remaining = table.clients.len(), "swept idle clients");
        }
    }
}
