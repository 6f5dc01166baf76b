//! Audit records for safelist, blocklist, throttle and track matches.
//!
//! Recording never blocks the request path: events go onto a bounded queue
//! and a background task enriches and logs them.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::users::{UserDirectory, UserId};

/// Message of every match record.
pub const MATCH_MESSAGE: &str = "Request matched";

/// Default capacity of the audit queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// What kind of rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Throttle,
    Blocklist,
    Safelist,
    Track,
}

impl MatchType {
    /// Lower-case name as logged in the `env` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Throttle => "throttle",
            MatchType::Blocklist => "blocklist",
            MatchType::Safelist => "safelist",
            MatchType::Track => "track",
        }
    }

    /// Whether events of this kind get a username lookup.
    fn wants_username(&self) -> bool {
        !matches!(self, MatchType::Safelist)
    }
}

/// One classification decision worth recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchEvent {
    pub rule_name: String,
    pub match_type: MatchType,
    pub requester_ip: IpAddr,
    pub http_method: String,
    pub path: String,
    pub user_id: Option<UserId>,
    pub correlation_id: String,
}

/// An event after best-effort enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: MatchEvent,
    pub username: Option<String>,
}

/// Receiver of match events.
pub trait AuditSink: Send + Sync {
    /// Record an event without blocking or failing.
    fn record(&self, event: MatchEvent);
}

/// Audit sink that hands events to a background logging task.
pub struct ChannelAuditSink {
    sender: mpsc::Sender<MatchEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    /// Start the background task and return the sink feeding it.
    ///
    /// The task ends once the sink is dropped and the queue is empty, and
    /// returns how many events it logged.
    pub fn spawn(users: Arc<dyn UserDirectory>, capacity: usize) -> (Self, JoinHandle<u64>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(receiver, users));

        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// Events dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait up to `timeout` for queued events to be
    /// logged. Returns the number logged, or `None` when the wait timed out.
    pub async fn shutdown(self, handle: JoinHandle<u64>, timeout: Duration) -> Option<u64> {
        let dropped = self.dropped();
        drop(self);

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(logged)) => {
                debug!(logged, dropped, "Audit queue drained");
                Some(logged)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Audit task failed");
                None
            }
            Err(_) => {
                warn!(?timeout, "Audit queue not drained before shutdown");
                None
            }
        }
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: MatchEvent) {
        if let Err(e) = self.sender.try_send(event) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(error = %e, dropped, "Audit queue full, event dropped");
        }
    }
}

async fn drain(mut receiver: mpsc::Receiver<MatchEvent>, users: Arc<dyn UserDirectory>) -> u64 {
    let mut logged = 0;
    while let Some(event) = receiver.recv().await {
        let record = enrich(event, users.as_ref()).await;
        emit(&record);
        logged += 1;
    }
    debug!(logged, "Audit queue closed");
    logged
}

/// Attach the username when one can be found; never drops the event.
pub async fn enrich(event: MatchEvent, users: &dyn UserDirectory) -> AuditRecord {
    let username = match event.user_id {
        Some(id) if event.match_type.wants_username() => match users.username(id).await {
            Ok(name) => name,
            Err(e) => {
                debug!(user_id = %id, error = %e, "Username lookup failed");
                None
            }
        },
        _ => None,
    };

    AuditRecord { event, username }
}

fn emit(record: &AuditRecord) {
    let event = &record.event;
    info!(
        message = MATCH_MESSAGE,
        env = event.match_type.as_str(),
        remote_ip = %event.requester_ip,
        request_method = %event.http_method,
        path = %event.path,
        matched = %event.rule_name,
        user_id = event.user_id.map(|id| id.0),
        username = record.username.as_deref(),
        correlation_id = %event.correlation_id
    );
}

/// Sink that keeps events in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingAuditSink {
    events: parking_lot::Mutex<Vec<MatchEvent>>,
}

#[cfg(test)]
impl RecordingAuditSink {
    pub(crate) fn events(&self) -> Vec<MatchEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn of_type(&self, match_type: MatchType) -> Vec<MatchEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.match_type == match_type)
            .collect()
    }
}

#[cfg(test)]
impl AuditSink for RecordingAuditSink {
    fn record(&self, event: MatchEvent) {
        self.events.lock().push(event);
    }
}
