use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::adapter::{Page, SourceAdapter, malformed};
use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::{FactPayload, PanelFact, RawFact};
use crate::http::{FetchClient, FetchRequest};

pub const DEFAULT_BASE_URL: &str = "https://panelapp.genomicsengland.co.uk/api/v1";

/// Expert-curated panel memberships. Pages follow the API's `next` link,
/// which becomes the cursor token.
pub struct PanelAppAdapter {
    client: Arc<FetchClient>,
    base_url: String,
    keywords: Vec<String>,
    page_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelGenePage {
    pub entries: Vec<(String, PanelFact)>,
    pub next: Option<String>,
    pub count: Option<u64>,
}

impl PanelAppAdapter {
    pub fn new(client: Arc<FetchClient>, keywords: Vec<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            page_size: 100,
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

    fn matches_keywords(&self, panel_name: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let name = panel_name.to_lowercase();
        self.keywords.iter().any(|keyword| name.contains(keyword))
    }
}

impl SourceAdapter for PanelAppAdapter {
    fn source(&self) -> SourceName {
        SourceName::PanelApp
    }

    fn query_fingerprint(&self) -> String {
        format!(
            "panelapp|{}|{}|{}",
            self.base_url,
            self.keywords.join(","),
            self.page_size
        )
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Token(format!(
            "{}/genes/?page_size={}",
            self.base_url.trim_end_matches('/'),
            self.page_size
        ))
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let PageCursor::Token(url) = cursor else {
            return Err(IngestError::InvalidRequest(format!(
                "panelapp expects a link cursor, got {cursor}"
            )));
        };
        let raw: Value = self.client.fetch_json(&FetchRequest::get(url.clone()))?;
        let page = parse_gene_page(&raw)
            .ok_or_else(|| malformed(&SourceName::PanelApp, "gene page without results"))?;

        let facts: Vec<RawFact> = page
            .entries
            .into_iter()
            .filter(|(_, fact)| self.matches_keywords(&fact.panel_name))
            .map(|(subject, fact)| RawFact::new(subject, FactPayload::Panel(fact)))
            .collect();
        debug!(url = %url, facts = facts.len(), "panelapp page mapped");

        let total_pages = page
            .count
            .map(|count| count.div_ceil(u64::from(self.page_size)) as u32);
        let done = page.next.is_none();
        Ok(Page {
            facts,
            next_cursor: page.next.map(PageCursor::Token),
            done,
            total_pages,
        })
    }
}

/// Maps one page of the genes endpoint to `(subject, fact)` pairs.
pub fn parse_gene_page(raw: &Value) -> Option<PanelGenePage> {
    let results = raw.get("results").and_then(|v| v.as_array())?;
    let mut entries = Vec::new();
    for item in results {
        let gene_data = item.get("gene_data");
        let subject = gene_data
            .and_then(|v| v.get("hgnc_symbol"))
            .and_then(|v| v.as_str())
            .or_else(|| item.get("entity_name").and_then(|v| v.as_str()))
            .or_else(|| {
                gene_data
                    .and_then(|v| v.get("hgnc_id"))
                    .and_then(|v| v.as_str())
            });
        let Some(subject) = subject else {
            continue;
        };
        let Some(panel) = item.get("panel") else {
            continue;
        };
        let panel_id = match panel.get("id") {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => continue,
        };
        let panel_name = panel
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("unnamed panel")
            .to_string();
        let confidence_level = match item.get("confidence_level") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
        .min(3) as u8;
        let mode_of_inheritance = item
            .get("mode_of_inheritance")
            .and_then(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.to_string());
        entries.push((
            subject.to_string(),
            PanelFact {
                panel_id,
                panel_name,
                confidence_level,
                mode_of_inheritance,
            },
        ));
    }
    let next = raw
        .get("next")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    let count = raw.get("count").and_then(|v| v.as_u64());
    Some(PanelGenePage {
        entries,
        next,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gene_entries() {
        let raw = serde_json::json!({
            "count": 250,
            "next": "https://panelapp.example/api/v1/genes/?page=2",
            "results": [
                {
                    "entity_name": "PKD1",
                    "gene_data": {"hgnc_id": "HGNC:9008", "hgnc_symbol": "PKD1"},
                    "confidence_level": "3",
                    "mode_of_inheritance": "MONOALLELIC, autosomal or pseudoautosomal",
                    "panel": {"id": 283, "name": "Cystic kidney disease"}
                },
                {
                    "entity_name": "NPHS1",
                    "gene_data": {"hgnc_symbol": "NPHS1"},
                    "confidence_level": 2,
                    "mode_of_inheritance": "",
                    "panel": {"id": "75", "name": "Proteinuric renal disease"}
                }
            ]
        });
        let page = parse_gene_page(&raw).unwrap();
        assert_eq!(page.count, Some(250));
        assert!(page.next.is_some());
        assert_eq!(page.entries[0].0, "PKD1");
        assert_eq!(page.entries[0].1.confidence_level, 3);
        assert_eq!(page.entries[1].0, "NPHS1");
        assert_eq!(page.entries[1].1.panel_id, "75");
        assert_eq!(page.entries[1].1.mode_of_inheritance, None);
    }
}
