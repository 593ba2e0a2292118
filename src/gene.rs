//! Mapping of source subjects onto canonical genes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use camino::Utf8PathBuf;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::cache::{CacheService, namespace};
use crate::domain::{Gene, GeneId, GeneSymbol};
use crate::error::IngestError;
use crate::http::{FetchClient, FetchRequest};
use crate::store::Store;

pub trait GeneNormalizer: Send + Sync {
    fn normalize(&self, subject: &str) -> Result<Gene, IngestError>;

    /// Persists genes created since the last call.
    fn persist(&self) -> Result<(), IngestError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRecord {
    pub hgnc_id: String,
    pub symbol: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// External nomenclature authority.
pub trait NomenclatureAuthority: Send + Sync {
    fn lookup(&self, symbol: &GeneSymbol) -> Result<Option<AuthorityRecord>, IngestError>;
}

pub struct HgncClient {
    client: Arc<FetchClient>,
    cache: Option<Arc<CacheService>>,
    base_url: String,
}

impl HgncClient {
    pub fn new(client: Arc<FetchClient>, cache: Option<Arc<CacheService>>) -> Self {
        Self {
            client,
            cache,
            base_url: "https://rest.genenames.org".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn fetch_field(&self, field: &str, symbol: &str) -> Result<Vec<AuthorityRecord>, IngestError> {
        let url = format!("{}/fetch/{field}/{symbol}", self.base_url.trim_end_matches('/'));
        let request = FetchRequest::get(url).header("Accept", "application/json");
        let raw: Value = self.client.fetch_json(&request)?;
        Ok(parse_hgnc_docs(&raw))
    }
}

impl NomenclatureAuthority for HgncClient {
    fn lookup(&self, symbol: &GeneSymbol) -> Result<Option<AuthorityRecord>, IngestError> {
        if let Some(cache) = &self.cache {
            if let Some(cached) =
                cache.get_json::<Option<AuthorityRecord>>(namespace::HGNC, symbol.as_str())?
            {
                return Ok(cached);
            }
        }

        let mut found = None;
        for field in ["symbol", "prev_symbol", "alias_symbol"] {
            let docs = self.fetch_field(field, symbol.as_str())?;
            // An alias shared by several genes cannot be resolved automatically.
            if docs.len() == 1 {
                found = docs.into_iter().next();
                break;
            }
            if docs.len() > 1 {
                debug!(symbol = %symbol, field, matches = docs.len(), "ambiguous HGNC match");
                break;
            }
        }

        if let Some(cache) = &self.cache {
            cache.set_json(namespace::HGNC, symbol.as_str(), &found, None)?;
        }
        Ok(found)
    }
}

pub fn parse_hgnc_docs(raw: &Value) -> Vec<AuthorityRecord> {
    let docs = raw
        .get("response")
        .and_then(|response| response.get("docs"))
        .and_then(|docs| docs.as_array())
        .cloned()
        .unwrap_or_default();
    docs.iter()
        .filter_map(|doc| {
            let hgnc_id = doc.get("hgnc_id")?.as_str()?.to_string();
            let symbol = doc.get("symbol")?.as_str()?.to_string();
            let mut aliases = Vec::new();
            for field in ["alias_symbol", "prev_symbol"] {
                if let Some(values) = doc.get(field).and_then(|v| v.as_array()) {
                    aliases.extend(values.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            }
            Some(AuthorityRecord {
                hgnc_id,
                symbol,
                aliases,
            })
        })
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    genes: Vec<Gene>,
}

#[derive(Debug, Default)]
struct RegistryState {
    genes: BTreeMap<GeneId, Gene>,
    by_symbol: HashMap<GeneSymbol, GeneId>,
    by_alias: HashMap<GeneSymbol, BTreeSet<GeneId>>,
    dirty: bool,
}

impl RegistryState {
    fn index(&mut self, gene: &Gene) {
        self.by_symbol.insert(gene.symbol.clone(), gene.id.clone());
        for alias in &gene.aliases {
            if let Ok(alias) = alias.parse::<GeneSymbol>() {
                self.by_alias
                    .entry(alias)
                    .or_default()
                    .insert(gene.id.clone());
            }
        }
    }
}

/// Persisted set of canonical genes, indexed by symbol and alias.
pub struct GeneRegistry {
    path: Utf8PathBuf,
    state: RwLock<RegistryState>,
    write_lock: Mutex<()>,
}

impl GeneRegistry {
    pub fn open(store: &Store) -> Result<Self, IngestError> {
        let path = store.genes_path();
        let file: RegistryFile = Store::read_json(&path)?.unwrap_or_default();
        let mut state = RegistryState::default();
        for gene in file.genes {
            state.index(&gene);
            state.genes.insert(gene.id.clone(), gene);
        }
        Ok(Self {
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &GeneId) -> Option<Gene> {
        self.state.read().genes.get(id).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.state
            .read()
            .genes
            .values()
            .map(|gene| gene.symbol.to_string())
            .collect()
    }

    /// Resolves by identifier, approved symbol, then unambiguous alias.
    pub fn find(&self, subject: &str) -> Option<Gene> {
        let state = self.state.read();
        if let Ok(id) = subject.parse::<GeneId>() {
            return state.genes.get(&id).cloned();
        }
        let symbol = subject.parse::<GeneSymbol>().ok()?;
        if let Some(id) = state.by_symbol.get(&symbol) {
            return state.genes.get(id).cloned();
        }
        match state.by_alias.get(&symbol) {
            Some(ids) if ids.len() == 1 => ids
                .iter()
                .next()
                .and_then(|id| state.genes.get(id))
                .cloned(),
            _ => None,
        }
    }

    /// Adds a gene. A symbol may only ever map to one identifier.
    pub fn register(&self, gene: Gene) -> Result<Gene, IngestError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some(existing) = state.by_symbol.get(&gene.symbol) {
            if existing != &gene.id {
                return Err(IngestError::Normalization {
                    subject: gene.symbol.to_string(),
                    reason: format!("symbol already assigned to {existing}"),
                });
            }
        }
        let merged = match state.genes.get(&gene.id) {
            Some(current) => {
                let mut merged = current.clone();
                merged.aliases.extend(gene.aliases.iter().cloned());
                if current.symbol != gene.symbol {
                    // Symbol was renamed by the authority; the old one stays an alias.
                    merged.aliases.insert(current.symbol.to_string());
                    state.by_symbol.remove(&current.symbol);
                    merged.symbol = gene.symbol.clone();
                }
                merged
            }
            None => gene,
        };
        state.index(&merged);
        state.genes.insert(merged.id.clone(), merged.clone());
        state.dirty = true;
        Ok(merged)
    }

    pub fn persist(&self) -> Result<(), IngestError> {
        let _guard = self.write_lock.lock();
        let file = {
            let mut state = self.state.write();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            RegistryFile {
                genes: state.genes.values().cloned().collect(),
            }
        };
        if let Err(err) = Store::write_json_atomic(&self.path, &file) {
            self.state.write().dirty = true;
            return Err(err);
        }
        Ok(())
    }
}

/// Registry lookup first, nomenclature authority second.
pub struct GeneResolver {
    registry: Arc<GeneRegistry>,
    authority: Option<Arc<dyn NomenclatureAuthority>>,
}

impl GeneResolver {
    pub fn new(
        registry: Arc<GeneRegistry>,
        authority: Option<Arc<dyn NomenclatureAuthority>>,
    ) -> Self {
        Self {
            registry,
            authority,
        }
    }

    pub fn registry(&self) -> &GeneRegistry {
        &self.registry
    }
}

impl GeneNormalizer for GeneResolver {
    fn normalize(&self, subject: &str) -> Result<Gene, IngestError> {
        if let Some(gene) = self.registry.find(subject) {
            return Ok(gene);
        }
        let symbol: GeneSymbol = subject.parse().map_err(|_| IngestError::Normalization {
            subject: subject.to_string(),
            reason: "not a gene symbol".to_string(),
        })?;
        let Some(authority) = &self.authority else {
            return Err(IngestError::Normalization {
                subject: subject.to_string(),
                reason: "unknown symbol".to_string(),
            });
        };
        let record = authority
            .lookup(&symbol)?
            .ok_or_else(|| IngestError::Normalization {
                subject: subject.to_string(),
                reason: "no unambiguous match at the nomenclature authority".to_string(),
            })?;
        let gene = Gene {
            id: record.hgnc_id.parse()?,
            symbol: record.symbol.parse()?,
            aliases: record.aliases.into_iter().collect(),
        };
        self.registry.register(gene)
    }

    fn persist(&self) -> Result<(), IngestError> {
        self.registry.persist()
    }
}
