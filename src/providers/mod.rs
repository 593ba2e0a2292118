pub mod generic;
pub mod hpo;
pub mod panelapp;
pub mod pubtator;
pub mod string_ppi;

use std::sync::Arc;

use crate::adapter::SourceAdapter;
use crate::config::SourceSettings;
use crate::domain::SourceName;
use crate::error::IngestError;
use crate::http::FetchClient;

/// Builds the adapter for a configured source. `known_genes` seeds sources
/// that query by gene (STRING) when no explicit gene list is configured.
pub fn build_adapter(
    settings: &SourceSettings,
    client: Arc<FetchClient>,
    known_genes: &[String],
) -> Result<Box<dyn SourceAdapter>, IngestError> {
    let adapter: Box<dyn SourceAdapter> = match &settings.name {
        SourceName::PubTator => {
            let query = settings.query.join(" ");
            if query.trim().is_empty() {
                return Err(IngestError::ConfigParse(
                    "pubtator needs a search query".to_string(),
                ));
            }
            let mut adapter = pubtator::PubTatorAdapter::new(client, query);
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url.clone());
            }
            if let Some(size) = settings.page_size {
                adapter = adapter.with_page_size(size);
            }
            Box::new(adapter)
        }
        SourceName::Hpo => {
            let mut adapter = hpo::HpoAdapter::new(client, settings.query.clone());
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url.clone());
            }
            if let Some(size) = settings.page_size {
                adapter = adapter.with_page_size(size);
            }
            Box::new(adapter)
        }
        SourceName::PanelApp => {
            let mut adapter = panelapp::PanelAppAdapter::new(client, settings.query.clone());
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url.clone());
            }
            if let Some(size) = settings.page_size {
                adapter = adapter.with_page_size(size);
            }
            Box::new(adapter)
        }
        SourceName::StringPpi => {
            let genes = if settings.query.is_empty() {
                known_genes.to_vec()
            } else {
                settings.query.clone()
            };
            let mut adapter = string_ppi::StringAdapter::new(client, genes);
            if let Some(url) = &settings.base_url {
                adapter = adapter.with_base_url(url.clone());
            }
            if let Some(size) = settings.page_size {
                adapter = adapter.with_page_size(size);
            }
            Box::new(adapter)
        }
        SourceName::Other(_) => {
            let url = settings.base_url.clone().ok_or_else(|| {
                IngestError::ConfigParse(format!("source {} needs a base_url", settings.name))
            })?;
            let mut adapter = generic::GenericJsonAdapter::new(client, settings.name.clone(), url)
                .with_query(settings.query.clone());
            if let Some(size) = settings.page_size {
                adapter = adapter.with_page_size(size);
            }
            Box::new(adapter)
        }
    };
    Ok(adapter)
}
