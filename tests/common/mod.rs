#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tempfile::TempDir;

use genevidence::adapter::{Page, SourceAdapter};
use genevidence::checkpoint::{Checkpoint, PageCursor};
use genevidence::domain::{Gene, GeneId, SourceName};
use genevidence::error::IngestError;
use genevidence::evidence::{Evidence, FactPayload, PublicationFact, RawFact};
use genevidence::gene::GeneNormalizer;
use genevidence::store::{EvidenceRepository, StagedFact, Store};

pub fn temp_store() -> (TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = Store::new_with_paths(root.join("data"), root.join("cache"));
    (dir, Arc::new(store))
}

pub fn gene(id: &str, symbol: &str) -> Gene {
    Gene {
        id: id.parse().unwrap(),
        symbol: symbol.parse().unwrap(),
        aliases: Default::default(),
    }
}

pub fn publication(subject: &str, pmid: &str, score: f64) -> RawFact {
    RawFact::new(
        subject,
        FactPayload::Publication(PublicationFact {
            pmid: pmid.to_string(),
            score,
            title: None,
            year: None,
        }),
    )
}

/// Resolves a fixed set of symbols; everything else fails normalization.
pub struct StaticGenes {
    genes: HashMap<String, Gene>,
}

impl StaticGenes {
    pub fn new(genes: &[(&str, &str)]) -> Self {
        Self {
            genes: genes
                .iter()
                .map(|(id, symbol)| (symbol.to_string(), gene(id, symbol)))
                .collect(),
        }
    }
}

impl GeneNormalizer for StaticGenes {
    fn normalize(&self, subject: &str) -> Result<Gene, IngestError> {
        self.genes
            .get(subject)
            .cloned()
            .ok_or_else(|| IngestError::Normalization {
                subject: subject.to_string(),
                reason: "unknown symbol".to_string(),
            })
    }
}

/// Serves pre-built pages `1..=pages.len()` and records every fetch.
pub struct ScriptedAdapter {
    source: SourceName,
    fingerprint: String,
    pages: Vec<Vec<RawFact>>,
    fail_on: Option<u32>,
    fetched: Mutex<Vec<u32>>,
}

impl ScriptedAdapter {
    pub fn new(pages: Vec<Vec<RawFact>>) -> Self {
        Self {
            source: SourceName::PubTator,
            fingerprint: "kidney".to_string(),
            pages,
            fail_on: None,
            fetched: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_on(mut self, page: u32) -> Self {
        self.fail_on = Some(page);
        self
    }

    pub fn fetched(&self) -> Vec<u32> {
        self.fetched.lock().clone()
    }
}

impl SourceAdapter for ScriptedAdapter {
    fn source(&self) -> SourceName {
        self.source.clone()
    }

    fn query_fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Page(1)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let PageCursor::Page(page) = cursor else {
            return Err(IngestError::InvalidRequest(format!("unexpected cursor {cursor}")));
        };
        self.fetched.lock().push(*page);
        if self.fail_on == Some(*page) {
            return Err(IngestError::FatalFetch {
                host: "example.org".to_string(),
                status: 400,
                message: "bad request".to_string(),
            });
        }
        let facts = self
            .pages
            .get(*page as usize - 1)
            .cloned()
            .unwrap_or_default();
        let done = *page as usize >= self.pages.len();
        Ok(Page {
            facts,
            next_cursor: (!done).then(|| PageCursor::Page(page + 1)),
            done,
            total_pages: Some(self.pages.len() as u32),
        })
    }
}

/// Store wrapper that records checkpoint writes and can fail one of them.
pub struct ObservedRepo {
    inner: Arc<Store>,
    fail_on_save: Option<usize>,
    saves: Mutex<Vec<Checkpoint>>,
    attempts: Mutex<usize>,
    on_gene_read: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ObservedRepo {
    pub fn new(inner: Arc<Store>) -> Self {
        Self {
            inner,
            fail_on_save: None,
            saves: Mutex::new(Vec::new()),
            attempts: Mutex::new(0),
            on_gene_read: None,
        }
    }

    /// Runs `hook` whenever a gene's evidence is listed, standing in for a
    /// write that lands while a read is being computed.
    pub fn on_gene_read(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_gene_read = Some(Box::new(hook));
        self
    }

    /// Fails the `n`-th checkpoint write (1-based).
    pub fn failing_save(mut self, n: usize) -> Self {
        self.fail_on_save = Some(n);
        self
    }

    pub fn saves(&self) -> Vec<Checkpoint> {
        self.saves.lock().clone()
    }
}

impl EvidenceRepository for ObservedRepo {
    fn load_evidence(
        &self,
        gene: &GeneId,
        source: &SourceName,
    ) -> Result<Option<Evidence>, IngestError> {
        self.inner.load_evidence(gene, source)
    }

    fn list_evidence(&self, source: &SourceName) -> Result<Vec<Evidence>, IngestError> {
        self.inner.list_evidence(source)
    }

    fn list_gene_evidence(&self, gene: &GeneId) -> Result<Vec<Evidence>, IngestError> {
        let evidence = self.inner.list_gene_evidence(gene)?;
        if let Some(hook) = &self.on_gene_read {
            hook();
        }
        Ok(evidence)
    }

    fn write_evidence(&self, evidence: &[Evidence]) -> Result<(), IngestError> {
        self.inner.write_evidence(evidence)
    }

    fn load_checkpoint(&self, source: &SourceName) -> Result<Option<Checkpoint>, IngestError> {
        self.inner.load_checkpoint(source)
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        let attempt = {
            let mut attempts = self.attempts.lock();
            *attempts += 1;
            *attempts
        };
        if self.fail_on_save == Some(attempt) {
            return Err(IngestError::Filesystem("disk full".to_string()));
        }
        self.saves.lock().push(checkpoint.clone());
        self.inner.save_checkpoint(checkpoint)
    }

    fn stage_for_review(&self, staged: &StagedFact) -> Result<(), IngestError> {
        self.inner.stage_for_review(staged)
    }

    fn list_staged(&self, source: &SourceName) -> Result<Vec<StagedFact>, IngestError> {
        self.inner.list_staged(source)
    }

    fn sources(&self) -> Result<Vec<SourceName>, IngestError> {
        self.inner.sources()
    }
}
