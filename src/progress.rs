//! Progress side channel. Publishing is advisory: reporters never fail and
//! the processor does not depend on anyone listening.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::domain::{RunStatus, SourceName};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub source_name: SourceName,
    pub current_page: u32,
    pub total_pages: Option<u32>,
    pub items_processed: u64,
    pub status: RunStatus,
    pub last_error: Option<String>,
}

impl ProgressEvent {
    pub fn queued(source_name: SourceName) -> Self {
        Self {
            source_name,
            current_page: 0,
            total_pages: None,
            items_processed: 0,
            status: RunStatus::Queued,
            last_error: None,
        }
    }

    /// Human-readable progress, e.g. `1200/5000 pages`.
    pub fn describe(&self) -> String {
        match self.total_pages {
            Some(total) => format!(
                "{} {}/{} pages, {} items",
                self.status, self.current_page, total, self.items_processed
            ),
            None => format!(
                "{} page {}, {} items",
                self.status, self.current_page, self.items_processed
            ),
        }
    }
}

pub trait ProgressReporter: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn publish(&self, _event: ProgressEvent) {}
}

pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn publish(&self, event: ProgressEvent) {
        info!(
            source = %event.source_name,
            page = event.current_page,
            total_pages = ?event.total_pages,
            items = event.items_processed,
            status = %event.status,
            error = ?event.last_error,
            "progress"
        );
    }
}

/// Forwards events to a channel; a dropped receiver is ignored.
pub struct ChannelReporter {
    sender: Mutex<Sender<ProgressEvent>>,
}

impl ChannelReporter {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressReporter for ChannelReporter {
    fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.lock().send(event);
    }
}

/// Latest event per source, for callers that poll.
#[derive(Default)]
pub struct ProgressBoard {
    latest: Mutex<BTreeMap<SourceName, ProgressEvent>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.latest.lock().values().cloned().collect()
    }

    pub fn get(&self, source: &SourceName) -> Option<ProgressEvent> {
        self.latest.lock().get(source).cloned()
    }
}

impl ProgressReporter for ProgressBoard {
    fn publish(&self, event: ProgressEvent) {
        self.latest.lock().insert(event.source_name.clone(), event);
    }
}

/// Fans one event out to several reporters.
pub struct FanoutReporter {
    reporters: Vec<std::sync::Arc<dyn ProgressReporter>>,
}

impl FanoutReporter {
    pub fn new(reporters: Vec<std::sync::Arc<dyn ProgressReporter>>) -> Self {
        Self { reporters }
    }
}

impl ProgressReporter for FanoutReporter {
    fn publish(&self, event: ProgressEvent) {
        for reporter in &self.reporters {
            reporter.publish(event.clone());
        }
    }
}
