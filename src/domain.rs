use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

static SYMBOL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-._@/]{0,31}$").expect("valid regex"));
static ORF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(C(?:\d+|X|Y))ORF(\d+)$").expect("valid regex"));
static HGNC_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HGNC:\d+$").expect("valid regex"));

/// Gene symbol in the shape the nomenclature authority publishes it.
///
/// Symbols are upper-cased, except for the open-reading-frame infix
/// (`C1orf112`), which HGNC keeps lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneSymbol(String);

impl GeneSymbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeneSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeneSymbol {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !SYMBOL_RE.is_match(trimmed) {
            return Err(IngestError::InvalidGeneSymbol(value.to_string()));
        }
        let upper = trimmed.to_uppercase();
        let normalized = ORF_RE.replace(&upper, "${1}orf${2}").into_owned();
        Ok(Self(normalized))
    }
}

/// Stable gene identifier, e.g. `HGNC:11998`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GeneId(String);

impl GeneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Form used for file names in the durable store.
    pub fn file_stem(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for GeneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GeneId {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if !HGNC_ID_RE.is_match(&normalized) {
            return Err(IngestError::InvalidGeneSymbol(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gene {
    pub id: GeneId,
    pub symbol: GeneSymbol,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
}

/// External evidence source. Unmodelled sources keep their configured name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SourceName {
    PubTator,
    Hpo,
    PanelApp,
    StringPpi,
    Other(String),
}

impl SourceName {
    pub fn as_str(&self) -> &str {
        match self {
            SourceName::PubTator => "pubtator",
            SourceName::Hpo => "hpo",
            SourceName::PanelApp => "panelapp",
            SourceName::StringPpi => "string_ppi",
            SourceName::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceName {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let source = match normalized.as_str() {
            "pubtator" => SourceName::PubTator,
            "hpo" => SourceName::Hpo,
            "panelapp" => SourceName::PanelApp,
            "string_ppi" | "string" => SourceName::StringPpi,
            other => {
                let is_valid = !other.is_empty()
                    && other
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
                if !is_valid {
                    return Err(IngestError::InvalidSource(value.to_string()));
                }
                SourceName::Other(other.to_string())
            }
        };
        Ok(source)
    }
}

impl TryFrom<String> for SourceName {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SourceName> for String {
    fn from(value: SourceName) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IngestionMode {
    /// Skip facts that are already stored and stop once duplicates dominate.
    Smart,
    /// Reprocess the source from the first page.
    Full,
}

impl fmt::Display for IngestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionMode::Smart => write!(f, "smart"),
            IngestionMode::Full => write!(f, "full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn symbol_keeps_orf_infix_lowercase() {
        let symbol: GeneSymbol = " c1orf112 ".parse().unwrap();
        assert_eq!(symbol.as_str(), "C1orf112");
        let symbol: GeneSymbol = "pkd1".parse().unwrap();
        assert_eq!(symbol.as_str(), "PKD1");
    }

    #[test]
    fn symbol_rejects_whitespace() {
        let err = "PKD 1".parse::<GeneSymbol>().unwrap_err();
        assert_matches!(err, IngestError::InvalidGeneSymbol(_));
    }

    #[test]
    fn gene_id_requires_hgnc_prefix() {
        let id: GeneId = "hgnc:9008".parse().unwrap();
        assert_eq!(id.as_str(), "HGNC:9008");
        assert_eq!(id.file_stem(), "HGNC_9008");
        assert!("9008".parse::<GeneId>().is_err());
    }

    #[test]
    fn source_name_round_trips_through_string() {
        let source: SourceName = "PubTator".parse().unwrap();
        assert_eq!(source, SourceName::PubTator);
        let custom: SourceName = "clingen".parse().unwrap();
        assert_eq!(custom, SourceName::Other("clingen".to_string()));
        let json = serde_json::to_string(&SourceName::StringPpi).unwrap();
        assert_eq!(json, "\"string_ppi\"");
        assert!("bad name!".parse::<SourceName>().is_err());
    }
}
