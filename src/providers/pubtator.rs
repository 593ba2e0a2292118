use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::adapter::{Page, SourceAdapter, expect_page, malformed};
use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::{FactPayload, PublicationFact, RawFact};
use crate::http::{FetchClient, FetchRequest};

pub const DEFAULT_BASE_URL: &str = "https://www.ncbi.nlm.nih.gov/research/pubtator3-api";

/// Literature mining: search hits newest first, then gene annotations for
/// the PMIDs on each page.
pub struct PubTatorAdapter {
    client: Arc<FetchClient>,
    base_url: String,
    query: String,
    page_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub pmid: String,
    pub score: f64,
    pub title: Option<String>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total_pages: Option<u32>,
}

impl PubTatorAdapter {
    pub fn new(client: Arc<FetchClient>, query: impl Into<String>) -> Self {
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            query: query.into(),
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

    fn search(&self, page: u32) -> Result<SearchPage, IngestError> {
        let request = FetchRequest::get(format!("{}/search/", self.base_url.trim_end_matches('/')))
            .param("text", &self.query)
            .param("sort", "date desc")
            .param("page", page)
            .param("page_size", self.page_size);
        let raw: Value = self.client.fetch_json(&request)?;
        parse_search(&raw).ok_or_else(|| malformed(&SourceName::PubTator, "search response without results"))
    }

    fn annotations(&self, pmids: &[String]) -> Result<BTreeMap<String, BTreeSet<String>>, IngestError> {
        let request = FetchRequest::get(format!(
            "{}/publications/export/biocjson",
            self.base_url.trim_end_matches('/')
        ))
        .param("pmids", pmids.join(","));
        let raw: Value = self.client.fetch_json(&request)?;
        Ok(parse_gene_annotations(&raw))
    }
}

impl SourceAdapter for PubTatorAdapter {
    fn source(&self) -> SourceName {
        SourceName::PubTator
    }

    fn query_fingerprint(&self) -> String {
        format!("pubtator|{}|{}|{}", self.base_url, self.query, self.page_size)
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Page(1)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let page = expect_page(&SourceName::PubTator, cursor)?;
        let search = self.search(page)?;
        if search.hits.is_empty() {
            return Ok(Page {
                facts: Vec::new(),
                next_cursor: None,
                done: true,
                total_pages: search.total_pages,
            });
        }

        let pmids: Vec<String> = search.hits.iter().map(|hit| hit.pmid.clone()).collect();
        let genes_by_pmid = self.annotations(&pmids)?;
        let mut facts = Vec::new();
        for hit in &search.hits {
            let Some(genes) = genes_by_pmid.get(&hit.pmid) else {
                continue;
            };
            for gene in genes {
                facts.push(RawFact::new(
                    gene.clone(),
                    FactPayload::Publication(PublicationFact {
                        pmid: hit.pmid.clone(),
                        score: hit.score,
                        title: hit.title.clone(),
                        year: hit.year,
                    }),
                ));
            }
        }
        debug!(page, hits = search.hits.len(), facts = facts.len(), "pubtator page mapped");

        let done = search.total_pages.is_some_and(|total| page >= total);
        Ok(Page {
            facts,
            next_cursor: (!done).then(|| PageCursor::Page(page + 1)),
            done,
            total_pages: search.total_pages,
        })
    }
}

pub fn parse_search(raw: &Value) -> Option<SearchPage> {
    let results = raw.get("results").and_then(|v| v.as_array())?;
    let hits = results
        .iter()
        .filter_map(|item| {
            let pmid = match item.get("pmid") {
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::String(s)) => s.clone(),
                _ => return None,
            };
            let score = item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let title = item
                .get("title")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            let year = item
                .get("date")
                .and_then(|v| v.as_str())
                .and_then(|date| date.get(..4))
                .and_then(|year| year.parse().ok());
            Some(SearchHit {
                pmid,
                score,
                title,
                year,
            })
        })
        .collect();
    let total_pages = raw
        .get("total_pages")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32);
    Some(SearchPage { hits, total_pages })
}

/// Gene mentions per PMID from a BioC JSON export.
pub fn parse_gene_annotations(raw: &Value) -> BTreeMap<String, BTreeSet<String>> {
    let documents = raw
        .get("PubTator3")
        .and_then(|v| v.as_array())
        .or_else(|| raw.as_array())
        .cloned()
        .unwrap_or_default();

    let mut genes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for doc in &documents {
        let pmid = match doc.get("pmid").or_else(|| doc.get("id")) {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) => s.clone(),
            _ => continue,
        };
        let Some(passages) = doc.get("passages").and_then(|v| v.as_array()) else {
            continue;
        };
        for passage in passages {
            let Some(annotations) = passage.get("annotations").and_then(|v| v.as_array()) else {
                continue;
            };
            for annotation in annotations {
                let infons = annotation.get("infons");
                let is_gene = infons
                    .and_then(|v| v.get("type"))
                    .and_then(|v| v.as_str())
                    == Some("Gene");
                if !is_gene {
                    continue;
                }
                if let Some(text) = annotation.get("text").and_then(|v| v.as_str()) {
                    genes.entry(pmid.clone()).or_default().insert(text.trim().to_string());
                }
            }
        }
    }
    genes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_hits() {
        let raw = serde_json::json!({
            "results": [
                {"pmid": 38000001, "title": "PKD1 variants", "date": "2024-01-05T00:00:00Z", "score": 312.5},
                {"pmid": "38000002", "date": "2023-11-01"}
            ],
            "total_pages": 7
        });
        let page = parse_search(&raw).unwrap();
        assert_eq!(page.total_pages, Some(7));
        assert_eq!(page.hits[0].pmid, "38000001");
        assert_eq!(page.hits[0].year, Some(2024));
        assert_eq!(page.hits[1].score, 0.0);
    }

    #[test]
    fn keeps_only_gene_annotations() {
        let raw = serde_json::json!({
            "PubTator3": [{
                "id": "38000001",
                "passages": [{
                    "annotations": [
                        {"text": "PKD1", "infons": {"type": "Gene", "identifier": "5310"}},
                        {"text": "cysts", "infons": {"type": "Disease"}},
                        {"text": "PKD2", "infons": {"type": "Gene", "identifier": "5311"}},
                        {"text": "PKD1", "infons": {"type": "Gene", "identifier": "5310"}}
                    ]
                }]
            }]
        });
        let genes = parse_gene_annotations(&raw);
        let pkd: Vec<_> = genes["38000001"].iter().cloned().collect();
        assert_eq!(pkd, vec!["PKD1".to_string(), "PKD2".to_string()]);
    }
}
