//! Evidence merge: union of identifying keys, higher confidence wins on
//! collision, aggregates recomputed from the merged set.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::domain::{Gene, SourceName};
use crate::error::IngestError;
use crate::evidence::{
    Evidence, EvidenceItem, EvidenceKind, EvidencePayload, FactPayload, GenericEvidence,
    GenericFact, InteractionEvidence, InteractionFact, LiteratureEvidence, PanelEvidence,
    PanelFact, PhenotypeEvidence, PhenotypeFact, PublicationFact,
};

/// Number of items kept in the display subset of each document.
pub const TOP_K: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub conflicts: Vec<MergeConflict>,
}

/// Two facts with the same identifying key disagreed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub key: String,
    pub kept_confidence: f64,
    pub discarded_confidence: f64,
}

pub fn merge(
    existing: Option<&EvidencePayload>,
    incoming: &[FactPayload],
) -> Result<(EvidencePayload, MergeReport), IngestError> {
    let kind = match (existing, incoming.first()) {
        (Some(payload), _) => payload.kind(),
        (None, Some(fact)) => fact.kind(),
        (None, None) => {
            return Err(IngestError::MergeMismatch {
                existing: "absent".to_string(),
                incoming: "empty".to_string(),
            });
        }
    };
    if let Some(fact) = incoming.iter().find(|fact| fact.kind() != kind) {
        return Err(IngestError::MergeMismatch {
            existing: kind.as_str().to_string(),
            incoming: fact.kind().as_str().to_string(),
        });
    }

    let mut report = MergeReport::default();
    let payload = match kind {
        EvidenceKind::Literature => {
            let mut items = match existing {
                Some(EvidencePayload::Literature(ev)) => ev.publications.clone(),
                _ => BTreeMap::new(),
            };
            for fact in incoming {
                if let FactPayload::Publication(fact) = fact {
                    upsert(&mut items, fact.clone(), &mut report);
                }
            }
            EvidencePayload::Literature(literature(items))
        }
        EvidenceKind::Phenotype => {
            let mut items = match existing {
                Some(EvidencePayload::Phenotype(ev)) => ev.terms.clone(),
                _ => BTreeMap::new(),
            };
            for fact in incoming {
                if let FactPayload::Phenotype(fact) = fact {
                    upsert(&mut items, fact.clone(), &mut report);
                }
            }
            EvidencePayload::Phenotype(phenotype(items))
        }
        EvidenceKind::Panel => {
            let mut items = match existing {
                Some(EvidencePayload::Panel(ev)) => ev.panels.clone(),
                _ => BTreeMap::new(),
            };
            for fact in incoming {
                if let FactPayload::Panel(fact) = fact {
                    upsert(&mut items, fact.clone(), &mut report);
                }
            }
            EvidencePayload::Panel(panel(items))
        }
        EvidenceKind::Interaction => {
            let mut items = match existing {
                Some(EvidencePayload::Interaction(ev)) => ev.partners.clone(),
                _ => BTreeMap::new(),
            };
            for fact in incoming {
                if let FactPayload::Interaction(fact) = fact {
                    upsert(&mut items, fact.clone(), &mut report);
                }
            }
            EvidencePayload::Interaction(interaction(items))
        }
        EvidenceKind::Generic => {
            let mut items = match existing {
                Some(EvidencePayload::Generic(ev)) => ev.items.clone(),
                _ => BTreeMap::new(),
            };
            for fact in incoming {
                if let FactPayload::Generic(fact) = fact {
                    upsert(&mut items, fact.clone(), &mut report);
                }
            }
            EvidencePayload::Generic(generic(items))
        }
    };
    Ok((payload, report))
}

/// Merges `incoming` into the stored record for `(gene, source)`.
pub fn merge_evidence(
    existing: Option<&Evidence>,
    gene: &Gene,
    source: &SourceName,
    incoming: &[FactPayload],
    now: DateTime<Utc>,
) -> Result<(Evidence, MergeReport), IngestError> {
    if let Some(existing) = existing {
        if existing.gene_id != gene.id || &existing.source != source {
            return Err(IngestError::MergeMismatch {
                existing: format!("{}/{}", existing.gene_id, existing.source),
                incoming: format!("{}/{}", gene.id, source),
            });
        }
    }
    let (payload, report) = merge(existing.map(|evidence| &evidence.payload), incoming)?;
    for conflict in &report.conflicts {
        warn!(
            gene = %gene.symbol,
            source = %source,
            key = %conflict.key,
            kept = conflict.kept_confidence,
            discarded = conflict.discarded_confidence,
            "conflicting facts for the same key"
        );
    }
    let evidence = Evidence {
        gene_id: gene.id.clone(),
        gene_symbol: gene.symbol.clone(),
        source: source.clone(),
        evidence_count: payload.item_count(),
        score: payload.score(),
        payload,
        updated_at: now,
    };
    Ok((evidence, report))
}

fn upsert<T>(items: &mut BTreeMap<String, T>, fact: T, report: &mut MergeReport)
where
    T: EvidenceItem + PartialEq + Serialize,
{
    let Some(current) = items.get(fact.key()) else {
        report.added += 1;
        items.insert(fact.key().to_string(), fact);
        return;
    };
    if current == &fact {
        report.unchanged += 1;
        return;
    }
    let incoming_wins = prefer_incoming(current, &fact);
    let (kept, discarded) = if incoming_wins {
        (fact.confidence(), current.confidence())
    } else {
        (current.confidence(), fact.confidence())
    };
    report.conflicts.push(MergeConflict {
        key: fact.key().to_string(),
        kept_confidence: kept,
        discarded_confidence: discarded,
    });
    if incoming_wins {
        report.replaced += 1;
        items.insert(fact.key().to_string(), fact);
    } else {
        report.unchanged += 1;
    }
}

// Ties fall back to the canonical JSON so the winner does not depend on
// arrival order.
fn prefer_incoming<T: EvidenceItem + Serialize>(current: &T, incoming: &T) -> bool {
    match incoming.confidence().total_cmp(&current.confidence()) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => {
            let current = serde_json::to_string(current).unwrap_or_default();
            let incoming = serde_json::to_string(incoming).unwrap_or_default();
            incoming > current
        }
    }
}

fn top_keys<T: EvidenceItem>(items: &BTreeMap<String, T>) -> Vec<String> {
    let mut ranked: Vec<&T> = items.values().collect();
    ranked.sort_by(|a, b| {
        b.confidence()
            .total_cmp(&a.confidence())
            .then_with(|| a.key().cmp(b.key()))
    });
    ranked
        .into_iter()
        .take(TOP_K)
        .map(|item| item.key().to_string())
        .collect()
}

fn mean<T: EvidenceItem>(items: &BTreeMap<String, T>) -> f64 {
    if items.is_empty() {
        return 0.0;
    }
    items.values().map(EvidenceItem::confidence).sum::<f64>() / items.len() as f64
}

fn literature(publications: BTreeMap<String, PublicationFact>) -> LiteratureEvidence {
    LiteratureEvidence {
        publication_count: publications.len(),
        mean_score: mean(&publications),
        top_publications: top_keys(&publications),
        publications,
    }
}

fn phenotype(terms: BTreeMap<String, PhenotypeFact>) -> PhenotypeEvidence {
    let diseases: BTreeSet<&String> = terms.values().flat_map(|term| &term.diseases).collect();
    PhenotypeEvidence {
        term_count: terms.len(),
        disease_count: diseases.len(),
        top_terms: top_keys(&terms),
        terms,
    }
}

fn panel(panels: BTreeMap<String, PanelFact>) -> PanelEvidence {
    PanelEvidence {
        panel_count: panels.len(),
        max_confidence: panels
            .values()
            .map(|panel| panel.confidence_level)
            .max()
            .unwrap_or(0),
        confidence_sum: panels
            .values()
            .map(|panel| u32::from(panel.confidence_level))
            .sum(),
        inheritance_modes: panels
            .values()
            .filter_map(|panel| panel.mode_of_inheritance.clone())
            .collect(),
        top_panels: top_keys(&panels),
        panels,
    }
}

fn interaction(partners: BTreeMap<String, InteractionFact>) -> InteractionEvidence {
    InteractionEvidence {
        partner_count: partners.len(),
        weighted_score: partners
            .values()
            .map(|partner| partner.combined_score / 1000.0)
            .sum(),
        mean_score: mean(&partners),
        top_partners: top_keys(&partners),
        partners,
    }
}

fn generic(items: BTreeMap<String, GenericFact>) -> GenericEvidence {
    GenericEvidence {
        item_count: items.len(),
        mean_score: mean(&items),
        top_items: top_keys(&items),
        items,
    }
}
