//! Canonical facts and the per-source evidence documents they are merged into.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GeneId, GeneSymbol, SourceName};

/// A fact as produced by a source adapter, before gene normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFact {
    pub subject: String,
    pub payload: FactPayload,
}

impl RawFact {
    pub fn new(subject: impl Into<String>, payload: FactPayload) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }

    /// Rough in-memory footprint, used for buffer backpressure.
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.subject.len() + self.payload.heap_size()
    }
}

/// Identity and ranking of an item inside an evidence document.
pub trait EvidenceItem {
    fn key(&self) -> &str;
    fn confidence(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationFact {
    pub pmid: String,
    pub score: f64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

impl EvidenceItem for PublicationFact {
    fn key(&self) -> &str {
        &self.pmid
    }

    fn confidence(&self) -> f64 {
        self.score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhenotypeFact {
    pub hpo_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub diseases: BTreeSet<String>,
}

impl EvidenceItem for PhenotypeFact {
    fn key(&self) -> &str {
        &self.hpo_id
    }

    fn confidence(&self) -> f64 {
        self.diseases.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelFact {
    pub panel_id: String,
    pub panel_name: String,
    /// 1 = red, 2 = amber, 3 = green.
    pub confidence_level: u8,
    #[serde(default)]
    pub mode_of_inheritance: Option<String>,
}

impl EvidenceItem for PanelFact {
    fn key(&self) -> &str {
        &self.panel_id
    }

    fn confidence(&self) -> f64 {
        f64::from(self.confidence_level)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionFact {
    pub partner: String,
    /// STRING combined score, 0..=1000.
    pub combined_score: f64,
}

impl EvidenceItem for InteractionFact {
    fn key(&self) -> &str {
        &self.partner
    }

    fn confidence(&self) -> f64 {
        self.combined_score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericFact {
    pub key: String,
    pub score: f64,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl EvidenceItem for GenericFact {
    fn key(&self) -> &str {
        &self.key
    }

    fn confidence(&self) -> f64 {
        self.score
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactPayload {
    Publication(PublicationFact),
    Phenotype(PhenotypeFact),
    Panel(PanelFact),
    Interaction(InteractionFact),
    Generic(GenericFact),
}

impl FactPayload {
    pub fn key(&self) -> &str {
        match self {
            FactPayload::Publication(fact) => fact.key(),
            FactPayload::Phenotype(fact) => fact.key(),
            FactPayload::Panel(fact) => fact.key(),
            FactPayload::Interaction(fact) => fact.key(),
            FactPayload::Generic(fact) => fact.key(),
        }
    }

    pub fn kind(&self) -> EvidenceKind {
        match self {
            FactPayload::Publication(_) => EvidenceKind::Literature,
            FactPayload::Phenotype(_) => EvidenceKind::Phenotype,
            FactPayload::Panel(_) => EvidenceKind::Panel,
            FactPayload::Interaction(_) => EvidenceKind::Interaction,
            FactPayload::Generic(_) => EvidenceKind::Generic,
        }
    }

    fn heap_size(&self) -> usize {
        match self {
            FactPayload::Publication(fact) => {
                fact.pmid.len() + fact.title.as_ref().map(String::len).unwrap_or(0)
            }
            FactPayload::Phenotype(fact) => {
                fact.hpo_id.len()
                    + fact.name.as_ref().map(String::len).unwrap_or(0)
                    + fact.diseases.iter().map(String::len).sum::<usize>()
            }
            FactPayload::Panel(fact) => {
                fact.panel_id.len()
                    + fact.panel_name.len()
                    + fact.mode_of_inheritance.as_ref().map(String::len).unwrap_or(0)
            }
            FactPayload::Interaction(fact) => fact.partner.len(),
            FactPayload::Generic(fact) => fact.key.len() + fact.attributes.to_string().len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Literature,
    Phenotype,
    Panel,
    Interaction,
    Generic,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::Literature => "literature",
            EvidenceKind::Phenotype => "phenotype",
            EvidenceKind::Panel => "panel",
            EvidenceKind::Interaction => "interaction",
            EvidenceKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteratureEvidence {
    pub publications: BTreeMap<String, PublicationFact>,
    pub publication_count: usize,
    pub mean_score: f64,
    pub top_publications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhenotypeEvidence {
    pub terms: BTreeMap<String, PhenotypeFact>,
    pub term_count: usize,
    pub disease_count: usize,
    pub top_terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelEvidence {
    pub panels: BTreeMap<String, PanelFact>,
    pub panel_count: usize,
    pub max_confidence: u8,
    pub confidence_sum: u32,
    pub inheritance_modes: BTreeSet<String>,
    pub top_panels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvidence {
    pub partners: BTreeMap<String, InteractionFact>,
    pub partner_count: usize,
    pub weighted_score: f64,
    pub mean_score: f64,
    pub top_partners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericEvidence {
    pub items: BTreeMap<String, GenericFact>,
    pub item_count: usize,
    pub mean_score: f64,
    pub top_items: Vec<String>,
}

/// Source-specific evidence document; exactly one per (gene, source).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvidencePayload {
    Literature(LiteratureEvidence),
    Phenotype(PhenotypeEvidence),
    Panel(PanelEvidence),
    Interaction(InteractionEvidence),
    Generic(GenericEvidence),
}

impl EvidencePayload {
    pub fn kind(&self) -> EvidenceKind {
        match self {
            EvidencePayload::Literature(_) => EvidenceKind::Literature,
            EvidencePayload::Phenotype(_) => EvidenceKind::Phenotype,
            EvidencePayload::Panel(_) => EvidenceKind::Panel,
            EvidencePayload::Interaction(_) => EvidenceKind::Interaction,
            EvidencePayload::Generic(_) => EvidenceKind::Generic,
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        match self {
            EvidencePayload::Literature(ev) => ev.publications.keys().cloned().collect(),
            EvidencePayload::Phenotype(ev) => ev.terms.keys().cloned().collect(),
            EvidencePayload::Panel(ev) => ev.panels.keys().cloned().collect(),
            EvidencePayload::Interaction(ev) => ev.partners.keys().cloned().collect(),
            EvidencePayload::Generic(ev) => ev.items.keys().cloned().collect(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        match self {
            EvidencePayload::Literature(ev) => ev.publications.contains_key(key),
            EvidencePayload::Phenotype(ev) => ev.terms.contains_key(key),
            EvidencePayload::Panel(ev) => ev.panels.contains_key(key),
            EvidencePayload::Interaction(ev) => ev.partners.contains_key(key),
            EvidencePayload::Generic(ev) => ev.items.contains_key(key),
        }
    }

    pub fn item_count(&self) -> usize {
        match self {
            EvidencePayload::Literature(ev) => ev.publication_count,
            EvidencePayload::Phenotype(ev) => ev.term_count,
            EvidencePayload::Panel(ev) => ev.panel_count,
            EvidencePayload::Interaction(ev) => ev.partner_count,
            EvidencePayload::Generic(ev) => ev.item_count,
        }
    }

    /// Scalar that the scoring engine ranks genes by.
    pub fn score(&self) -> f64 {
        match self {
            EvidencePayload::Literature(ev) => ev.publication_count as f64,
            EvidencePayload::Phenotype(ev) => ev.term_count as f64,
            EvidencePayload::Panel(ev) => f64::from(ev.confidence_sum),
            EvidencePayload::Interaction(ev) => ev.weighted_score,
            EvidencePayload::Generic(ev) => ev.item_count as f64,
        }
    }
}

/// Stored evidence record with denormalized filter fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub gene_id: GeneId,
    pub gene_symbol: GeneSymbol,
    pub source: SourceName,
    pub payload: EvidencePayload,
    pub evidence_count: usize,
    pub score: f64,
    pub updated_at: DateTime<Utc>,
}
