//! Percentile normalization of per-source evidence scores.
//!
//! Ranks are always computed against the full evidence population of a
//! source, never against the genes of one flushed chunk.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheService, namespace};
use crate::domain::{GeneId, GeneSymbol, SourceName};
use crate::error::IngestError;
use crate::evidence::Evidence;
use crate::store::EvidenceRepository;

/// Percentiles are undefined below this population size.
pub const MIN_POPULATION: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringSettings {
    /// Minimum time between two recomputations of the same source.
    pub min_interval: Duration,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoreLookup {
    Ranked { percentile: f64, value: f64 },
    /// Too few genes with evidence for a rank to mean anything.
    Insufficient { genes: usize },
    NoEvidence,
}

impl ScoreLookup {
    pub fn percentile(&self) -> Option<f64> {
        match self {
            ScoreLookup::Ranked { percentile, .. } => Some(*percentile),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub gene_symbol: GeneSymbol,
    pub value: f64,
    pub percentile: Option<f64>,
}

/// Scores of every gene with evidence from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreTable {
    pub source: SourceName,
    pub population: usize,
    pub computed_at: DateTime<Utc>,
    pub entries: BTreeMap<GeneId, ScoreEntry>,
}

impl ScoreTable {
    pub fn compute(source: SourceName, evidence: &[Evidence], now: DateTime<Utc>) -> Self {
        let population = evidence.len();
        let mut sorted: Vec<f64> = evidence.iter().map(|item| item.score).collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let entries = evidence
            .iter()
            .map(|item| {
                let percentile = (population >= MIN_POPULATION).then(|| {
                    let at_or_below = sorted.partition_point(|value| *value <= item.score);
                    at_or_below as f64 / population as f64 * 100.0
                });
                (
                    item.gene_id.clone(),
                    ScoreEntry {
                        gene_symbol: item.gene_symbol.clone(),
                        value: item.score,
                        percentile,
                    },
                )
            })
            .collect();

        Self {
            source,
            population,
            computed_at: now,
            entries,
        }
    }

    pub fn lookup(&self, gene: &GeneId) -> ScoreLookup {
        let Some(entry) = self.entries.get(gene) else {
            return ScoreLookup::NoEvidence;
        };
        match entry.percentile {
            Some(percentile) => ScoreLookup::Ranked {
                percentile,
                value: entry.value,
            },
            None => ScoreLookup::Insufficient {
                genes: self.population,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceScore {
    pub source: SourceName,
    pub evidence_count: usize,
    pub lookup: ScoreLookup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneSummary {
    pub gene_id: GeneId,
    pub gene_symbol: Option<GeneSymbol>,
    pub sources: Vec<SourceScore>,
    /// Mean of the ranked per-source percentiles.
    pub overall: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGene {
    pub gene_id: GeneId,
    pub gene_symbol: GeneSymbol,
    pub value: f64,
    pub percentile: Option<f64>,
}

#[derive(Default)]
struct SourceState {
    table: Option<Arc<ScoreTable>>,
    last_recompute: Option<Instant>,
    dirty: bool,
}

pub struct ScoringEngine {
    repo: Arc<dyn EvidenceRepository>,
    cache: Option<Arc<CacheService>>,
    settings: ScoringSettings,
    sources: Mutex<HashMap<SourceName, SourceState>>,
}

impl ScoringEngine {
    pub fn new(
        repo: Arc<dyn EvidenceRepository>,
        cache: Option<Arc<CacheService>>,
        settings: ScoringSettings,
    ) -> Self {
        Self {
            repo,
            cache,
            settings,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn recompute(&self, source: &SourceName) -> Result<Arc<ScoreTable>, IngestError> {
        let evidence = self.repo.list_evidence(source)?;
        let table = Arc::new(ScoreTable::compute(source.clone(), &evidence, Utc::now()));
        {
            let mut sources = self.sources.lock();
            let state = sources.entry(source.clone()).or_default();
            state.table = Some(table.clone());
            state.last_recompute = Some(Instant::now());
            state.dirty = false;
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_namespace(namespace::SCORES)?;
        }
        if table.population < MIN_POPULATION {
            info!(source = %source, genes = table.population, "too few genes to rank");
        } else {
            debug!(source = %source, genes = table.population, "scores recomputed");
        }
        Ok(table)
    }

    /// Marks the source stale and recomputes unless the last recompute is
    /// more recent than the minimum interval. Returns whether it recomputed.
    pub fn notify_evidence_changed(&self, source: &SourceName) -> Result<bool, IngestError> {
        let due = {
            let mut sources = self.sources.lock();
            let state = sources.entry(source.clone()).or_default();
            state.dirty = true;
            state
                .last_recompute
                .is_none_or(|at| at.elapsed() >= self.settings.min_interval)
        };
        if due {
            self.recompute(source)?;
        }
        Ok(due)
    }

    /// Recomputes a source that changed since its last recompute.
    pub fn flush_pending(&self, source: &SourceName) -> Result<bool, IngestError> {
        let dirty = self
            .sources
            .lock()
            .get(source)
            .is_some_and(|state| state.dirty);
        if dirty {
            self.recompute(source)?;
        }
        Ok(dirty)
    }

    pub fn get_score(&self, gene: &GeneId, source: &SourceName) -> Result<ScoreLookup, IngestError> {
        Ok(self.table(source)?.lookup(gene))
    }

    pub fn gene_summary(&self, gene: &GeneId) -> Result<GeneSummary, IngestError> {
        let key = format!("gene:{gene}");
        if let Some(summary) = self.cached::<GeneSummary>(&key)? {
            return Ok(summary);
        }

        let generation = self.generation(namespace::SCORES);
        let evidence = self.gene_evidence(gene)?;
        let mut sources = Vec::with_capacity(evidence.len());
        for item in &evidence {
            sources.push(SourceScore {
                source: item.source.clone(),
                evidence_count: item.evidence_count,
                lookup: self.get_score(gene, &item.source)?,
            });
        }
        let ranked: Vec<f64> = sources
            .iter()
            .filter_map(|score| score.lookup.percentile())
            .collect();
        let overall =
            (!ranked.is_empty()).then(|| ranked.iter().sum::<f64>() / ranked.len() as f64);
        let summary = GeneSummary {
            gene_id: gene.clone(),
            gene_symbol: evidence.first().map(|item| item.gene_symbol.clone()),
            sources,
            overall,
        };

        self.fill(namespace::SCORES, &key, &summary, generation)?;
        Ok(summary)
    }

    pub fn top_genes(&self, source: &SourceName, limit: usize) -> Result<Vec<RankedGene>, IngestError> {
        let key = format!("top:{source}:{limit}");
        if let Some(top) = self.cached::<Vec<RankedGene>>(&key)? {
            return Ok(top);
        }

        let generation = self.generation(namespace::SCORES);
        let table = self.table(source)?;
        let mut ranked: Vec<RankedGene> = table
            .entries
            .iter()
            .map(|(gene_id, entry)| RankedGene {
                gene_id: gene_id.clone(),
                gene_symbol: entry.gene_symbol.clone(),
                value: entry.value,
                percentile: entry.percentile,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.value
                .total_cmp(&a.value)
                .then_with(|| a.gene_symbol.cmp(&b.gene_symbol))
        });
        ranked.truncate(limit);

        self.fill(namespace::SCORES, &key, &ranked, generation)?;
        Ok(ranked)
    }

    /// All stored evidence for one gene, read through the `evidence` namespace.
    pub fn gene_evidence(&self, gene: &GeneId) -> Result<Vec<Evidence>, IngestError> {
        if let Some(cache) = &self.cache {
            if let Some(items) = cache.get_json::<Vec<Evidence>>(namespace::EVIDENCE, gene.as_str())? {
                return Ok(items);
            }
        }
        let generation = self.generation(namespace::EVIDENCE);
        let items = self.repo.list_gene_evidence(gene)?;
        self.fill(namespace::EVIDENCE, gene.as_str(), &items, generation)?;
        Ok(items)
    }

    /// Current table for the source, computed on first use.
    fn table(&self, source: &SourceName) -> Result<Arc<ScoreTable>, IngestError> {
        let existing = self
            .sources
            .lock()
            .get(source)
            .and_then(|state| state.table.clone());
        match existing {
            Some(table) => Ok(table),
            None => self.recompute(source),
        }
    }

    fn generation(&self, ns: &str) -> u64 {
        self.cache.as_ref().map_or(0, |cache| cache.generation(ns))
    }

    /// Caches a computed read unless a write invalidated `ns` meanwhile.
    fn fill<T: Serialize>(
        &self,
        ns: &str,
        key: &str,
        value: &T,
        generation: u64,
    ) -> Result<(), IngestError> {
        if let Some(cache) = &self.cache {
            cache.set_json_if_current(ns, key, value, None, generation)?;
        }
        Ok(())
    }

    fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, IngestError> {
        match &self.cache {
            Some(cache) => cache.get_json(namespace::SCORES, key),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{EvidencePayload, GenericEvidence};

    fn evidence(id: &str, symbol: &str, score: f64) -> Evidence {
        Evidence {
            gene_id: id.parse().unwrap(),
            gene_symbol: symbol.parse().unwrap(),
            source: SourceName::PubTator,
            payload: EvidencePayload::Generic(GenericEvidence {
                items: BTreeMap::new(),
                item_count: 0,
                mean_score: 0.0,
                top_items: Vec::new(),
            }),
            evidence_count: score as usize,
            score,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ties_count_as_at_or_below() {
        let items = vec![
            evidence("HGNC:1", "A1", 1.0),
            evidence("HGNC:2", "A2", 3.0),
            evidence("HGNC:3", "A3", 3.0),
            evidence("HGNC:4", "A4", 10.0),
        ];
        let table = ScoreTable::compute(SourceName::PubTator, &items, Utc::now());
        let id = |raw: &str| raw.parse::<GeneId>().unwrap();
        assert_eq!(table.lookup(&id("HGNC:1")).percentile(), Some(25.0));
        assert_eq!(table.lookup(&id("HGNC:2")).percentile(), Some(75.0));
        assert_eq!(table.lookup(&id("HGNC:3")).percentile(), Some(75.0));
        assert_eq!(table.lookup(&id("HGNC:4")).percentile(), Some(100.0));
        assert_eq!(table.lookup(&id("HGNC:5")), ScoreLookup::NoEvidence);
    }

    #[test]
    fn single_gene_is_not_ranked() {
        let items = vec![evidence("HGNC:1", "A1", 5.0)];
        let table = ScoreTable::compute(SourceName::PubTator, &items, Utc::now());
        let lookup = table.lookup(&"HGNC:1".parse().unwrap());
        assert_eq!(lookup, ScoreLookup::Insufficient { genes: 1 });
        assert_eq!(lookup.percentile(), None);
    }
}
