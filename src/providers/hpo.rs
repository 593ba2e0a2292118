use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::adapter::{Page, SourceAdapter, expect_offset, malformed};
use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::{FactPayload, PhenotypeFact, RawFact};
use crate::http::{FetchClient, FetchRequest};

pub const DEFAULT_BASE_URL: &str = "https://ontology.jax.org/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpoTerm {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermAnnotations {
    pub genes: Vec<String>,
    pub diseases: BTreeSet<String>,
}

/// Phenotype annotations for the descendants of one or more root terms.
/// The offset indexes into the sorted term list; each page covers
/// `page_size` terms.
pub struct HpoAdapter {
    client: Arc<FetchClient>,
    base_url: String,
    roots: Vec<String>,
    page_size: u32,
}

impl HpoAdapter {
    pub fn new(client: Arc<FetchClient>, roots: Vec<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            roots,
            page_size: 25,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Root terms plus every descendant. Served from the HTTP cache after
    /// the first page, so the term order is stable across pages.
    fn terms(&self) -> Result<Vec<HpoTerm>, IngestError> {
        let mut terms: Vec<HpoTerm> = self
            .roots
            .iter()
            .map(|id| HpoTerm {
                id: id.clone(),
                name: None,
            })
            .collect();
        for root in &self.roots {
            let request = FetchRequest::get(format!(
                "{}/hp/terms/{root}/descendants",
                self.base_url.trim_end_matches('/')
            ));
            let raw: Value = self.client.fetch_json(&request)?;
            terms.extend(parse_terms(&raw));
        }
        terms.sort_by(|a, b| a.id.cmp(&b.id));
        terms.dedup_by(|a, b| {
            if a.id == b.id {
                if b.name.is_none() {
                    b.name = a.name.take();
                }
                true
            } else {
                false
            }
        });
        Ok(terms)
    }

    fn annotations(&self, term: &str) -> Result<TermAnnotations, IngestError> {
        let request = FetchRequest::get(format!(
            "{}/network/annotation/{term}",
            self.base_url.trim_end_matches('/')
        ));
        let raw: Value = self.client.fetch_json(&request)?;
        parse_annotations(&raw)
            .ok_or_else(|| malformed(&SourceName::Hpo, format!("annotation for {term} has no genes")))
    }
}

impl SourceAdapter for HpoAdapter {
    fn source(&self) -> SourceName {
        SourceName::Hpo
    }

    fn query_fingerprint(&self) -> String {
        format!("hpo|{}|{}|{}", self.base_url, self.roots.join(","), self.page_size)
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Offset(0)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let offset = expect_offset(&SourceName::Hpo, cursor)?;
        let terms = self.terms()?;
        let page_size = u64::from(self.page_size);
        let total = terms.len() as u64;
        let total_pages = total.div_ceil(page_size) as u32;

        let start = offset.min(total) as usize;
        let end = (offset + page_size).min(total) as usize;
        let mut facts = Vec::new();
        for term in &terms[start..end] {
            let annotations = self.annotations(&term.id)?;
            for gene in &annotations.genes {
                facts.push(RawFact::new(
                    gene.clone(),
                    FactPayload::Phenotype(PhenotypeFact {
                        hpo_id: term.id.clone(),
                        name: term.name.clone(),
                        diseases: annotations.diseases.clone(),
                    }),
                ));
            }
        }
        debug!(offset, terms = end - start, facts = facts.len(), "hpo page mapped");

        let done = end as u64 >= total;
        Ok(Page {
            facts,
            next_cursor: (!done).then(|| PageCursor::Offset(end as u64)),
            done,
            total_pages: Some(total_pages),
        })
    }
}

pub fn parse_terms(raw: &Value) -> Vec<HpoTerm> {
    raw.as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(|v| v.as_str())?.to_string();
            let name = item
                .get("name")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            Some(HpoTerm { id, name })
        })
        .collect()
}

pub fn parse_annotations(raw: &Value) -> Option<TermAnnotations> {
    let genes = raw.get("genes").and_then(|v| v.as_array())?;
    let mut symbols: Vec<String> = genes
        .iter()
        .filter_map(|gene| gene.get("name").and_then(|v| v.as_str()))
        .map(|name| name.to_string())
        .collect();
    symbols.sort();
    symbols.dedup();
    let diseases = raw
        .get("diseases")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("id").and_then(|v| v.as_str()))
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default();
    Some(TermAnnotations {
        genes: symbols,
        diseases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_term_annotations() {
        let raw = serde_json::json!({
            "genes": [
                {"id": "NCBIGene:5310", "name": "PKD1"},
                {"id": "NCBIGene:5311", "name": "PKD2"},
                {"id": "NCBIGene:5310", "name": "PKD1"}
            ],
            "diseases": [{"id": "OMIM:173900", "name": "Polycystic kidney disease 1"}]
        });
        let annotations = parse_annotations(&raw).unwrap();
        assert_eq!(annotations.genes, vec!["PKD1".to_string(), "PKD2".to_string()]);
        assert!(annotations.diseases.contains("OMIM:173900"));
    }

    #[test]
    fn missing_gene_list_is_malformed() {
        assert!(parse_annotations(&serde_json::json!({"diseases": []})).is_none());
    }

    #[test]
    fn parses_descendants() {
        let raw = serde_json::json!([
            {"id": "HP:0000107", "name": "Renal cyst"},
            {"id": "HP:0000113"}
        ]);
        let terms = parse_terms(&raw);
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].name, None);
    }
}
