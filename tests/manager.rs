mod common;

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;

use genevidence::adapter::{Page, SourceAdapter};
use genevidence::checkpoint::PageCursor;
use genevidence::domain::{IngestionMode, RunStatus, SourceName};
use genevidence::error::IngestError;
use genevidence::manager::{AdapterFactory, IngestionManager, StartOutcome};
use genevidence::processor::{ProcessorConfig, StopReason, StreamingProcessor};
use genevidence::progress::NoopReporter;

use common::{StaticGenes, publication, temp_store};

const PAGES: u32 = 3;

/// Each page waits for a ticket, after announcing that it was reached.
struct GatedAdapter {
    reached: Sender<u32>,
    tickets: Arc<Mutex<Receiver<()>>>,
}

impl SourceAdapter for GatedAdapter {
    fn source(&self) -> SourceName {
        SourceName::Hpo
    }

    fn query_fingerprint(&self) -> String {
        "HP:0010935".to_string()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Page(1)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let PageCursor::Page(page) = cursor else {
            return Err(IngestError::InvalidRequest(cursor.to_string()));
        };
        let _ = self.reached.send(*page);
        self.tickets
            .lock()
            .recv_timeout(Duration::from_secs(10))
            .map_err(|err| IngestError::InvalidRequest(err.to_string()))?;
        let done = *page >= PAGES;
        Ok(Page {
            facts: vec![publication("PKD1", &page.to_string(), 0.5)],
            next_cursor: (!done).then(|| PageCursor::Page(page + 1)),
            done,
            total_pages: Some(PAGES),
        })
    }
}

struct GatedFactory {
    reached: Mutex<Sender<u32>>,
    tickets: Arc<Mutex<Receiver<()>>>,
}

impl AdapterFactory for GatedFactory {
    fn build(&self, source: &SourceName) -> Result<Box<dyn SourceAdapter>, IngestError> {
        if source != &SourceName::Hpo {
            return Err(IngestError::UnknownSource(source.to_string()));
        }
        Ok(Box::new(GatedAdapter {
            reached: self.reached.lock().clone(),
            tickets: self.tickets.clone(),
        }))
    }
}

struct Harness {
    manager: IngestionManager,
    reached: Receiver<u32>,
    tickets: Sender<()>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let (dir, store) = temp_store();
    let (reached_tx, reached_rx) = mpsc::channel();
    let (ticket_tx, ticket_rx) = mpsc::channel();
    let processor = StreamingProcessor::new(
        store.clone(),
        Arc::new(StaticGenes::new(&[("HGNC:9008", "PKD1")])),
        Arc::new(NoopReporter),
        ProcessorConfig::default(),
    );
    let factory = GatedFactory {
        reached: Mutex::new(reached_tx),
        tickets: Arc::new(Mutex::new(ticket_rx)),
    };
    Harness {
        manager: IngestionManager::new(Arc::new(processor), Arc::new(factory), store),
        reached: reached_rx,
        tickets: ticket_tx,
        _dir: dir,
    }
}

fn wait_for_page(harness: &Harness, page: u32) {
    let reached = harness
        .reached
        .recv_timeout(Duration::from_secs(10))
        .unwrap();
    assert_eq!(reached, page);
}

#[test]
fn second_start_while_running_is_a_no_op() {
    let harness = harness();
    let hpo = SourceName::Hpo;

    assert_eq!(
        harness.manager.start(&hpo, IngestionMode::Full).unwrap(),
        StartOutcome::Started
    );
    wait_for_page(&harness, 1);
    assert!(harness.manager.is_running(&hpo));
    assert_eq!(
        harness.manager.start(&hpo, IngestionMode::Full).unwrap(),
        StartOutcome::AlreadyRunning
    );

    for _ in 0..PAGES {
        harness.tickets.send(()).unwrap();
    }
    let summary = harness.manager.wait(&hpo).unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.pages, PAGES);
    assert!(!harness.manager.is_running(&hpo));
    assert!(harness.manager.wait(&hpo).is_none());
}

#[test]
fn pause_then_resume_continues_from_checkpoint() {
    let harness = harness();
    let hpo = SourceName::Hpo;

    harness.manager.start(&hpo, IngestionMode::Smart).unwrap();
    wait_for_page(&harness, 1);
    assert!(harness.manager.pause(&hpo));
    assert!(harness.manager.status(&hpo).unwrap().pause_requested);
    harness.tickets.send(()).unwrap();

    let paused = harness.manager.wait(&hpo).unwrap().unwrap();
    assert_eq!(paused.stop_reason, StopReason::Paused);
    assert_eq!(paused.pages, 1);
    let status = harness.manager.status(&hpo).unwrap();
    assert!(!status.running);
    let checkpoint = status.checkpoint.unwrap();
    assert_eq!(checkpoint.status, RunStatus::Paused);
    assert_eq!(checkpoint.cursor, Some(PageCursor::Page(2)));

    assert_eq!(harness.manager.resume(&hpo).unwrap(), StartOutcome::Started);
    wait_for_page(&harness, 2);
    harness.tickets.send(()).unwrap();
    wait_for_page(&harness, 3);
    harness.tickets.send(()).unwrap();

    let resumed = harness.manager.wait(&hpo).unwrap().unwrap();
    assert_eq!(resumed.resumed_from, Some(PageCursor::Page(2)));
    assert_eq!(resumed.mode, IngestionMode::Smart);
    assert_eq!(resumed.status, RunStatus::Completed);
}

#[test]
fn cancelled_run_keeps_its_last_chunk() {
    let harness = harness();
    let hpo = SourceName::Hpo;

    harness.manager.start(&hpo, IngestionMode::Full).unwrap();
    wait_for_page(&harness, 1);
    harness.tickets.send(()).unwrap();
    wait_for_page(&harness, 2);
    assert!(harness.manager.cancel(&hpo));
    harness.tickets.send(()).unwrap();

    let cancelled = harness.manager.wait(&hpo).unwrap().unwrap();
    assert_eq!(cancelled.stop_reason, StopReason::Cancelled);
    assert_eq!(cancelled.pages, 2);
    let checkpoint = harness.manager.status(&hpo).unwrap().checkpoint.unwrap();
    assert_eq!(checkpoint.cursor, Some(PageCursor::Page(3)));
    assert!(!harness.manager.cancel(&hpo));
}

#[test]
fn unknown_source_fails_to_start() {
    let harness = harness();
    let err = harness
        .manager
        .start(&SourceName::PanelApp, IngestionMode::Smart)
        .unwrap_err();
    assert_matches!(err, IngestError::UnknownSource(_));
    assert!(!harness.manager.is_running(&SourceName::PanelApp));
}
