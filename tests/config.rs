use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use genevidence::config::{
    Config, ConfigLoader, SourceEntry, SourceEntryObject, default_query,
};
use genevidence::domain::SourceName;
use genevidence::error::IngestError;

#[test]
fn parse_config_with_detailed_sources() {
    let config = Config {
        sources: vec![
            SourceEntry::Shorthand("pubtator".to_string()),
            SourceEntry::Detailed(SourceEntryObject {
                name: "panelapp".to_string(),
                base_url: Some("https://panelapp.example.org/api/v1".to_string()),
                query: Some(vec!["cystic".to_string()]),
                page_size: Some(50),
            }),
        ],
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.sources.len(), 2);
    assert_eq!(resolved.sources[0].name, SourceName::PubTator);
    assert_eq!(resolved.sources[0].query, default_query(&SourceName::PubTator));
    let panelapp = resolved.source(&SourceName::PanelApp).unwrap();
    assert_eq!(panelapp.query, vec!["cystic".to_string()]);
    assert_eq!(panelapp.page_size, Some(50));
    assert_matches!(
        resolved.source(&SourceName::Hpo),
        Err(IngestError::UnknownSource(_))
    );
}

#[test]
fn custom_source_requires_base_url() {
    let config = Config {
        sources: vec![SourceEntry::Shorthand("clingen".to_string())],
        ..Config::default()
    };
    let err = ConfigLoader::resolve_config(config).unwrap_err();
    assert_matches!(err, IngestError::ConfigParse(_));
}

#[test]
fn loads_sections_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("genevidence.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "data_dir": "/tmp/genevidence-data",
            "http": { "max_attempts": 2, "breaker_cooldown_secs": 5 },
            "cache": { "tier1_capacity": 64, "ttl_secs": { "scores": 60 } },
            "processor": { "chunk_size": 50, "max_pages": 10 },
            "scoring": { "min_recompute_interval_secs": 1 },
            "sources": ["hpo", { "name": "string", "query": ["PKD1", "PKD2"] }]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.http.retry.max_attempts, 2);
    assert_eq!(resolved.http.breaker.cooldown, Duration::from_secs(5));
    assert_eq!(resolved.http.breaker.failure_threshold, 10);
    assert_eq!(resolved.cache.tier1_capacity, 64);
    assert_eq!(
        resolved.cache.namespace_ttls.get("scores"),
        Some(&Duration::from_secs(60))
    );
    assert_eq!(resolved.processor.chunk_size, 50);
    assert_eq!(resolved.processor.max_pages, Some(10));
    assert_eq!(resolved.scoring.min_interval, Duration::from_secs(1));
    assert_eq!(resolved.sources[1].name, SourceName::StringPpi);
    assert_eq!(resolved.sources[1].query.len(), 2);
    assert_eq!(
        resolved.data_dir.as_ref().map(|dir| dir.as_str()),
        Some("/tmp/genevidence-data")
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("genevidence.json");
    fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, IngestError::ConfigParse(_));
}

#[test]
fn missing_explicit_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, IngestError::ConfigRead(_));
}
