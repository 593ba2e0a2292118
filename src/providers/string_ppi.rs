use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::adapter::{Page, SourceAdapter, expect_page, malformed};
use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::{FactPayload, InteractionFact, RawFact};
use crate::http::{FetchClient, FetchRequest};

pub const DEFAULT_BASE_URL: &str = "https://string-db.org/api";
const HUMAN_TAXON: u32 = 9606;

/// Protein interaction partners for a fixed list of query genes. Page `n`
/// covers the `n`-th batch of `page_size` genes.
pub struct StringAdapter {
    client: Arc<FetchClient>,
    base_url: String,
    genes: Vec<String>,
    page_size: u32,
    required_score: u32,
    partner_limit: u32,
}

impl StringAdapter {
    pub fn new(client: Arc<FetchClient>, genes: Vec<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            genes,
            page_size: 20,
            required_score: 400,
            partner_limit: 50,
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

    pub fn with_required_score(mut self, required_score: u32) -> Self {
        self.required_score = required_score.min(1000);
        self
    }

    fn total_pages(&self) -> u32 {
        (self.genes.len() as u32).div_ceil(self.page_size)
    }
}

impl SourceAdapter for StringAdapter {
    fn source(&self) -> SourceName {
        SourceName::StringPpi
    }

    fn query_fingerprint(&self) -> String {
        format!(
            "string|{}|{}|{}|{}|{}",
            self.base_url,
            self.genes.join(","),
            self.page_size,
            self.required_score,
            self.partner_limit
        )
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Page(1)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let page = expect_page(&SourceName::StringPpi, cursor)?.max(1);
        let total_pages = self.total_pages();
        let start = ((page - 1) * self.page_size) as usize;
        let batch: Vec<&String> = self
            .genes
            .iter()
            .skip(start)
            .take(self.page_size as usize)
            .collect();

        let mut facts = Vec::new();
        if !batch.is_empty() {
            let identifiers = batch
                .iter()
                .map(|gene| gene.as_str())
                .collect::<Vec<_>>()
                .join("\r");
            let request = FetchRequest::get(format!(
                "{}/json/interaction_partners",
                self.base_url.trim_end_matches('/')
            ))
            .param("identifiers", identifiers)
            .param("species", HUMAN_TAXON)
            .param("required_score", self.required_score)
            .param("limit", self.partner_limit);
            let raw: Value = self.client.fetch_json(&request)?;
            let pairs = parse_partners(&raw).ok_or_else(|| {
                malformed(&SourceName::StringPpi, "interaction response is not a list")
            })?;
            facts.extend(
                pairs
                    .into_iter()
                    .map(|(gene, fact)| RawFact::new(gene, FactPayload::Interaction(fact))),
            );
        }
        debug!(page, genes = batch.len(), facts = facts.len(), "string page mapped");

        let done = page >= total_pages;
        Ok(Page {
            facts,
            next_cursor: (!done).then(|| PageCursor::Page(page + 1)),
            done,
            total_pages: Some(total_pages),
        })
    }
}

/// `(query gene, partner)` pairs with the score rescaled to 0..=1000.
pub fn parse_partners(raw: &Value) -> Option<Vec<(String, InteractionFact)>> {
    let items = raw.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| {
                let gene = item.get("preferredName_A").and_then(|v| v.as_str())?;
                let partner = item.get("preferredName_B").and_then(|v| v.as_str())?;
                let score = item.get("score").and_then(|v| v.as_f64())?;
                let combined_score = if score <= 1.0 { score * 1000.0 } else { score };
                Some((
                    gene.to_string(),
                    InteractionFact {
                        partner: partner.to_string(),
                        combined_score: combined_score.clamp(0.0, 1000.0),
                    },
                ))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescales_scores() {
        let raw = serde_json::json!([
            {"preferredName_A": "PKD1", "preferredName_B": "PKD2", "score": 0.999},
            {"preferredName_A": "PKD1", "preferredName_B": "TSC2", "score": 0.71},
            {"preferredName_A": "PKD1"}
        ]);
        let pairs = parse_partners(&raw).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, "PKD1");
        assert_eq!(pairs[0].1.partner, "PKD2");
        assert!((pairs[0].1.combined_score - 999.0).abs() < 1e-9);
    }

    #[test]
    fn object_response_is_rejected() {
        assert!(parse_partners(&serde_json::json!({"error": "bad"})).is_none());
    }
}
