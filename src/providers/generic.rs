use std::sync::Arc;

use serde_json::{Map, Value};

use crate::adapter::{Page, SourceAdapter, expect_offset, malformed};
use crate::checkpoint::PageCursor;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::evidence::{FactPayload, GenericFact, RawFact};
use crate::http::{FetchClient, FetchRequest};

/// Offset-paginated JSON feed for sources without a dedicated schema.
///
/// Each record needs a `gene` (or `symbol`) and an `id` (or `key`); `score`
/// is optional and every other field is kept as an attribute.
pub struct GenericJsonAdapter {
    client: Arc<FetchClient>,
    source: SourceName,
    url: String,
    query: Vec<String>,
    page_size: u32,
}

impl GenericJsonAdapter {
    pub fn new(client: Arc<FetchClient>, source: SourceName, url: impl Into<String>) -> Self {
        Self {
            client,
            source,
            url: url.into(),
            query: Vec::new(),
            page_size: 100,
        }
    }

    pub fn with_query(mut self, query: Vec<String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

impl SourceAdapter for GenericJsonAdapter {
    fn source(&self) -> SourceName {
        self.source.clone()
    }

    fn query_fingerprint(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.source,
            self.url,
            self.query.join(","),
            self.page_size
        )
    }

    fn first_cursor(&self) -> PageCursor {
        PageCursor::Offset(0)
    }

    fn next_page(&self, cursor: &PageCursor) -> Result<Page, IngestError> {
        let offset = expect_offset(&self.source, cursor)?;
        let mut request = FetchRequest::get(self.url.clone())
            .param("offset", offset)
            .param("limit", self.page_size);
        if !self.query.is_empty() {
            request = request.param("q", self.query.join(" "));
        }
        let raw: Value = self.client.fetch_json(&request)?;
        let records = raw
            .as_array()
            .or_else(|| raw.get("items").and_then(|v| v.as_array()))
            .ok_or_else(|| malformed(&self.source, "expected a list of records"))?;

        let facts: Vec<RawFact> = records.iter().filter_map(parse_record).collect();
        let fetched = records.len() as u64;
        let done = fetched < u64::from(self.page_size);
        let total_pages = raw
            .get("total")
            .and_then(|v| v.as_u64())
            .map(|total| total.div_ceil(u64::from(self.page_size)) as u32);
        Ok(Page {
            facts,
            next_cursor: (!done).then(|| PageCursor::Offset(offset + fetched)),
            done,
            total_pages,
        })
    }
}

pub fn parse_record(record: &Value) -> Option<RawFact> {
    let object = record.as_object()?;
    let gene = object
        .get("gene")
        .or_else(|| object.get("symbol"))
        .and_then(|v| v.as_str())?;
    let key = match object.get("id").or_else(|| object.get("key"))? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let score = object.get("score").and_then(|v| v.as_f64()).unwrap_or(1.0);
    let attributes: Map<String, Value> = object
        .iter()
        .filter(|(name, _)| !matches!(name.as_str(), "gene" | "symbol" | "id" | "key" | "score"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Some(RawFact::new(
        gene,
        FactPayload::Generic(GenericFact {
            key,
            score,
            attributes: Value::Object(attributes),
        }),
    ))
}
