//! Trigger interface: one background thread per running source.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::adapter::SourceAdapter;
use crate::checkpoint::Checkpoint;
use crate::config::SourceSettings;
use crate::domain::{IngestionMode, SourceName};
use crate::error::IngestError;
use crate::gene::GeneRegistry;
use crate::http::FetchClient;
use crate::processor::{RunControl, RunSummary, StreamingProcessor};
use crate::providers::build_adapter;
use crate::store::EvidenceRepository;

pub trait AdapterFactory: Send + Sync {
    fn build(&self, source: &SourceName) -> Result<Box<dyn SourceAdapter>, IngestError>;
}

/// Builds adapters from the configured sources.
pub struct ConfiguredAdapters {
    sources: Vec<SourceSettings>,
    client: Arc<FetchClient>,
    registry: Arc<GeneRegistry>,
}

impl ConfiguredAdapters {
    pub fn new(
        sources: Vec<SourceSettings>,
        client: Arc<FetchClient>,
        registry: Arc<GeneRegistry>,
    ) -> Self {
        Self {
            sources,
            client,
            registry,
        }
    }
}

impl AdapterFactory for ConfiguredAdapters {
    fn build(&self, source: &SourceName) -> Result<Box<dyn SourceAdapter>, IngestError> {
        let settings = self
            .sources
            .iter()
            .find(|settings| &settings.name == source)
            .ok_or_else(|| IngestError::UnknownSource(source.to_string()))?;
        let known_genes = self.registry.symbols();
        build_adapter(settings, self.client.clone(), &known_genes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceName,
    pub running: bool,
    pub pause_requested: bool,
    pub checkpoint: Option<Checkpoint>,
}

struct ActiveRun {
    mode: IngestionMode,
    control: Arc<RunControl>,
    handle: JoinHandle<Result<RunSummary, IngestError>>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

pub struct IngestionManager {
    processor: Arc<StreamingProcessor>,
    factory: Arc<dyn AdapterFactory>,
    repo: Arc<dyn EvidenceRepository>,
    runs: Mutex<HashMap<SourceName, ActiveRun>>,
}

impl IngestionManager {
    pub fn new(
        processor: Arc<StreamingProcessor>,
        factory: Arc<dyn AdapterFactory>,
        repo: Arc<dyn EvidenceRepository>,
    ) -> Self {
        Self {
            processor,
            factory,
            repo,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a run unless one is already active for the source.
    pub fn start(
        &self,
        source: &SourceName,
        mode: IngestionMode,
    ) -> Result<StartOutcome, IngestError> {
        let mut runs = self.runs.lock();
        if let Some(active) = runs.get(source) {
            if active.is_running() {
                info!(source = %source, "run already active; start ignored");
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        // A finished run's result is dropped here; `wait` collects it first
        // when the caller needs it.
        runs.remove(source);

        let adapter = self.factory.build(source)?;
        let control = Arc::new(RunControl::new());
        let processor = self.processor.clone();
        let worker_control = control.clone();
        let handle = thread::Builder::new()
            .name(format!("ingest-{source}"))
            .spawn(move || processor.run(adapter.as_ref(), mode, &worker_control))?;
        runs.insert(
            source.clone(),
            ActiveRun {
                mode,
                control,
                handle,
            },
        );
        info!(source = %source, mode = %mode, "run started");
        Ok(StartOutcome::Started)
    }

    /// Requests a stop at the next page boundary. Returns whether a run was
    /// active.
    pub fn pause(&self, source: &SourceName) -> bool {
        let runs = self.runs.lock();
        match runs.get(source) {
            Some(active) if active.is_running() => {
                active.control.pause();
                true
            }
            _ => false,
        }
    }

    /// Abandons the run at the next page boundary. The last flushed chunk
    /// stays checkpointed, so a later `start` resumes from it.
    pub fn cancel(&self, source: &SourceName) -> bool {
        let runs = self.runs.lock();
        match runs.get(source) {
            Some(active) if active.is_running() => {
                active.control.cancel();
                true
            }
            _ => false,
        }
    }

    /// Continues a paused source from its checkpoint, in the mode it last
    /// ran with. Resuming an active run is a no-op.
    pub fn resume(&self, source: &SourceName) -> Result<StartOutcome, IngestError> {
        let previous_mode = {
            let runs = self.runs.lock();
            match runs.get(source) {
                Some(active) if active.is_running() && !active.control.is_paused() => {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                Some(active) => Some(active.mode),
                None => None,
            }
        };
        if previous_mode.is_some() {
            // Let a pausing run write its final checkpoint first.
            if let Some(Err(err)) = self.wait(source) {
                warn!(source = %source, error = %err, "previous run ended with an error");
            }
        }
        let mode = match previous_mode {
            Some(mode) => mode,
            None => self
                .repo
                .load_checkpoint(source)?
                .map(|checkpoint| checkpoint.mode)
                .unwrap_or(IngestionMode::Smart),
        };
        self.start(source, mode)
    }

    /// Blocks until the source's current run ends. `None` when nothing was
    /// started since the last `wait`.
    pub fn wait(&self, source: &SourceName) -> Option<Result<RunSummary, IngestError>> {
        let active = self.runs.lock().remove(source)?;
        Some(
            active
                .handle
                .join()
                .unwrap_or_else(|_| Err(IngestError::WorkerPanicked(source.to_string()))),
        )
    }

    pub fn is_running(&self, source: &SourceName) -> bool {
        self.runs
            .lock()
            .get(source)
            .is_some_and(|active| active.is_running())
    }

    pub fn status(&self, source: &SourceName) -> Result<SourceStatus, IngestError> {
        let (running, pause_requested) = {
            let runs = self.runs.lock();
            match runs.get(source) {
                Some(active) => (active.is_running(), active.control.is_paused()),
                None => (false, false),
            }
        };
        Ok(SourceStatus {
            source: source.clone(),
            running,
            pause_requested,
            checkpoint: self.repo.load_checkpoint(source)?,
        })
    }
}
