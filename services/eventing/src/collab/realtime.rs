//! Realtime module boundary.
//!
//! Realtime subscriptions need to know which collections have triggers, so
//! every rules reload is pushed here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use sgw_events::EventingRule;
use tokio::sync::watch;

pub trait RealtimeSink: Send + Sync {
    fn set_realtime_triggers(&self, project: &str, rules: &[EventingRule]);
}

/// Rules per project, as last published.
pub type TriggerTable = BTreeMap<String, Vec<EventingRule>>;

/// Publishes trigger tables through a watch channel the in-process realtime
/// module subscribes to.
pub struct WatchRealtimeSink {
    tx: watch::Sender<Arc<TriggerTable>>,
}

impl WatchRealtimeSink {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TriggerTable::new()));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TriggerTable>> {
        self.tx.subscribe()
    }
}

impl Default for WatchRealtimeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeSink for WatchRealtimeSink {
    fn set_realtime_triggers(&self, project: &str, rules: &[EventingRule]) {
        // send_modify updates the value even when nobody is subscribed yet.
        self.tx.send_modify(|table| {
            let mut next = TriggerTable::clone(table);
            next.insert(project.to_string(), rules.to_vec());
            *table = Arc::new(next);
        });
    }
}

/// Records every call.
#[derive(Default)]
pub struct RecordingRealtimeSink {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingRealtimeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(project, rule ids)` per call, oldest first.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

impl RealtimeSink for RecordingRealtimeSink {
    fn set_realtime_triggers(&self, project: &str, rules: &[EventingRule]) {
        let ids = rules.iter().map(|r| r.id.clone()).collect();
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((project.to_string(), ids));
    }
}
