use std::fs;
use std::io::{BufRead, BufReader, Write};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::domain::{GeneId, SourceName};
use crate::error::IngestError;
use crate::evidence::{Evidence, RawFact};

/// A fact whose subject could not be mapped to a canonical gene, kept for
/// manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedFact {
    pub source: SourceName,
    pub fact: RawFact,
    pub reason: String,
    pub staged_at: DateTime<Utc>,
}

/// Evidence and checkpoint writes of one flushed chunk.
#[derive(Debug, Clone)]
pub struct ChunkCommit {
    pub evidence: Vec<Evidence>,
    pub checkpoint: Checkpoint,
}

/// Durable storage for evidence, checkpoints and the review staging area.
pub trait EvidenceRepository: Send + Sync {
    fn load_evidence(
        &self,
        gene: &GeneId,
        source: &SourceName,
    ) -> Result<Option<Evidence>, IngestError>;

    fn list_evidence(&self, source: &SourceName) -> Result<Vec<Evidence>, IngestError>;

    fn list_gene_evidence(&self, gene: &GeneId) -> Result<Vec<Evidence>, IngestError>;

    fn write_evidence(&self, evidence: &[Evidence]) -> Result<(), IngestError>;

    fn load_checkpoint(&self, source: &SourceName) -> Result<Option<Checkpoint>, IngestError>;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError>;

    fn stage_for_review(&self, staged: &StagedFact) -> Result<(), IngestError>;

    fn list_staged(&self, source: &SourceName) -> Result<Vec<StagedFact>, IngestError>;

    fn sources(&self) -> Result<Vec<SourceName>, IngestError>;

    /// Evidence first, checkpoint second: the checkpoint never points past
    /// evidence that is not on disk.
    fn commit_chunk(&self, chunk: &ChunkCommit) -> Result<(), IngestError> {
        self.write_evidence(&chunk.evidence)?;
        self.save_checkpoint(&chunk.checkpoint)
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, IngestError> {
        let dirs = BaseDirs::new().ok_or_else(|| {
            IngestError::Filesystem("unable to resolve home directory".to_string())
        })?;

        let data_root = match std::env::var("GENEVIDENCE_DATA_DIR") {
            Ok(value) if !value.trim().is_empty() => Utf8PathBuf::from(value.trim()),
            _ => Utf8PathBuf::from_path_buf(dirs.data_dir().join("genevidence"))
                .map_err(|_| IngestError::Filesystem("invalid data path".to_string()))?,
        };
        let cache_root = Utf8PathBuf::from_path_buf(dirs.cache_dir().join("genevidence"))
            .map_err(|_| IngestError::Filesystem("invalid cache path".to_string()))?;

        Ok(Self {
            data_root,
            cache_root,
        })
    }

    pub fn new_with_paths(data_root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self {
            data_root,
            cache_root,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn cache_root(&self) -> &Utf8Path {
        &self.cache_root
    }

    pub fn evidence_dir(&self, source: &SourceName) -> Utf8PathBuf {
        self.data_root.join("evidence").join(source.as_str())
    }

    pub fn evidence_path(&self, source: &SourceName, gene: &GeneId) -> Utf8PathBuf {
        self.evidence_dir(source)
            .join(format!("{}.json", gene.file_stem()))
    }

    pub fn checkpoint_path(&self, source: &SourceName) -> Utf8PathBuf {
        self.data_root
            .join("checkpoints")
            .join(format!("{}.json", source.as_str()))
    }

    pub fn genes_path(&self) -> Utf8PathBuf {
        self.data_root.join("genes.json")
    }

    pub fn staging_path(&self, source: &SourceName) -> Utf8PathBuf {
        self.data_root
            .join("staging")
            .join(format!("{}.jsonl", source.as_str()))
    }

    pub fn ensure_data_root(&self) -> Result<(), IngestError> {
        fs::create_dir_all(self.data_root.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    pub fn ensure_cache_root(&self) -> Result<(), IngestError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), IngestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| IngestError::Serialization(err.to_string()))?;
        let mut file = fs::File::create(tmp_path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        file.write_all(&content)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        file.sync_all()
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, IngestError> {
        let content = match fs::read(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(IngestError::Filesystem(format!("read {path}: {err}"))),
        };
        let value = serde_json::from_slice(&content)
            .map_err(|err| IngestError::Serialization(format!("{path}: {err}")))?;
        Ok(Some(value))
    }

    fn json_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, IngestError> {
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in
            fs::read_dir(dir.as_std_path()).map_err(|err| IngestError::Filesystem(err.to_string()))?
        {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_file() && path.extension() == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl EvidenceRepository for Store {
    fn load_evidence(
        &self,
        gene: &GeneId,
        source: &SourceName,
    ) -> Result<Option<Evidence>, IngestError> {
        Self::read_json(&self.evidence_path(source, gene))
    }

    fn list_evidence(&self, source: &SourceName) -> Result<Vec<Evidence>, IngestError> {
        let mut items = Vec::new();
        for path in Self::json_files(&self.evidence_dir(source))? {
            if let Some(evidence) = Self::read_json::<Evidence>(&path)? {
                items.push(evidence);
            }
        }
        Ok(items)
    }

    fn list_gene_evidence(&self, gene: &GeneId) -> Result<Vec<Evidence>, IngestError> {
        let mut items = Vec::new();
        for source in self.sources()? {
            if let Some(evidence) = self.load_evidence(gene, &source)? {
                items.push(evidence);
            }
        }
        Ok(items)
    }

    fn write_evidence(&self, evidence: &[Evidence]) -> Result<(), IngestError> {
        for item in evidence {
            Self::write_json_atomic(&self.evidence_path(&item.source, &item.gene_id), item)?;
        }
        Ok(())
    }

    fn load_checkpoint(&self, source: &SourceName) -> Result<Option<Checkpoint>, IngestError> {
        Self::read_json(&self.checkpoint_path(source))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), IngestError> {
        Self::write_json_atomic(&self.checkpoint_path(&checkpoint.source), checkpoint)
    }

    fn stage_for_review(&self, staged: &StagedFact) -> Result<(), IngestError> {
        let path = self.staging_path(&staged.source);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut line = serde_json::to_vec(staged)
            .map_err(|err| IngestError::Serialization(err.to_string()))?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        file.write_all(&line)
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn list_staged(&self, source: &SourceName) -> Result<Vec<StagedFact>, IngestError> {
        let path = self.staging_path(source);
        let file = match fs::File::open(path.as_std_path()) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(IngestError::Filesystem(err.to_string())),
        };
        let mut staged = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            staged.push(
                serde_json::from_str(&line)
                    .map_err(|err| IngestError::Serialization(err.to_string()))?,
            );
        }
        Ok(staged)
    }

    fn sources(&self) -> Result<Vec<SourceName>, IngestError> {
        let root = self.data_root.join("evidence");
        if !root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut sources = Vec::new();
        for entry in
            fs::read_dir(root.as_std_path()).map_err(|err| IngestError::Filesystem(err.to_string()))?
        {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(source) = name.parse() {
                    sources.push(source);
                }
            }
        }
        sources.sort();
        Ok(sources)
    }
}
