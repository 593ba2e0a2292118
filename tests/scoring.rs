mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;

use genevidence::cache::{CacheService, CacheSettings, namespace};
use genevidence::domain::{GeneId, SourceName};
use genevidence::evidence::Evidence;
use genevidence::merge::merge_evidence;
use genevidence::scoring::{GeneSummary, ScoreLookup, ScoringEngine, ScoringSettings};
use genevidence::store::{EvidenceRepository, Store};

use common::{ObservedRepo, gene, publication, temp_store};

/// Literature evidence with `count` distinct publications.
fn literature(id: &str, symbol: &str, count: usize) -> Evidence {
    let facts: Vec<_> = (0..count)
        .map(|i| publication(symbol, &format!("{symbol}-{i}"), 0.5).payload)
        .collect();
    let (evidence, _) = merge_evidence(
        None,
        &gene(id, symbol),
        &SourceName::PubTator,
        &facts,
        Utc::now(),
    )
    .unwrap();
    evidence
}

fn engine(store: Arc<Store>, interval: Duration) -> ScoringEngine {
    let root = store.cache_root().to_owned();
    let cache = Arc::new(CacheService::new(CacheSettings::new(root)).unwrap());
    ScoringEngine::new(
        store,
        Some(cache),
        ScoringSettings {
            min_interval: interval,
        },
    )
}

fn id(raw: &str) -> GeneId {
    raw.parse().unwrap()
}

#[test]
fn single_gene_is_never_reported_as_top_percentile() {
    let (_dir, store) = temp_store();
    store
        .write_evidence(&[literature("HGNC:9008", "PKD1", 3)])
        .unwrap();
    let scoring = engine(store, Duration::ZERO);

    let lookup = scoring.get_score(&id("HGNC:9008"), &SourceName::PubTator).unwrap();
    assert_eq!(lookup, ScoreLookup::Insufficient { genes: 1 });

    let summary = scoring.gene_summary(&id("HGNC:9008")).unwrap();
    assert_eq!(summary.overall, None);
    assert_eq!(summary.sources.len(), 1);
}

#[test]
fn percentiles_use_the_whole_source_population() {
    let (_dir, store) = temp_store();
    store
        .write_evidence(&[
            literature("HGNC:9008", "PKD1", 8),
            literature("HGNC:9009", "PKD2", 4),
            literature("HGNC:9016", "PKHD1", 2),
            literature("HGNC:19", "ACE", 1),
        ])
        .unwrap();
    let scoring = engine(store.clone(), Duration::ZERO);

    assert_matches!(
        scoring.get_score(&id("HGNC:9008"), &SourceName::PubTator).unwrap(),
        ScoreLookup::Ranked { percentile, value } if percentile == 100.0 && value == 8.0
    );
    assert_eq!(
        scoring
            .get_score(&id("HGNC:19"), &SourceName::PubTator)
            .unwrap()
            .percentile(),
        Some(25.0)
    );
    assert_eq!(
        scoring.get_score(&id("HGNC:1"), &SourceName::PubTator).unwrap(),
        ScoreLookup::NoEvidence
    );

    let top = scoring.top_genes(&SourceName::PubTator, 2).unwrap();
    let symbols: Vec<_> = top.iter().map(|gene| gene.gene_symbol.to_string()).collect();
    assert_eq!(symbols, vec!["PKD1", "PKD2"]);
}

#[test]
fn recompute_is_rate_limited_until_flushed() {
    let (_dir, store) = temp_store();
    store
        .write_evidence(&[
            literature("HGNC:9008", "PKD1", 2),
            literature("HGNC:9009", "PKD2", 1),
        ])
        .unwrap();
    let scoring = engine(store.clone(), Duration::from_secs(3600));

    assert!(scoring.notify_evidence_changed(&SourceName::PubTator).unwrap());
    store
        .write_evidence(&[literature("HGNC:9016", "PKHD1", 5)])
        .unwrap();
    assert!(!scoring.notify_evidence_changed(&SourceName::PubTator).unwrap());
    assert_eq!(
        scoring.get_score(&id("HGNC:9016"), &SourceName::PubTator).unwrap(),
        ScoreLookup::NoEvidence
    );

    assert!(scoring.flush_pending(&SourceName::PubTator).unwrap());
    assert_eq!(
        scoring
            .get_score(&id("HGNC:9016"), &SourceName::PubTator)
            .unwrap()
            .percentile(),
        Some(100.0)
    );
    assert!(!scoring.flush_pending(&SourceName::PubTator).unwrap());
}

#[test]
fn cached_summary_is_dropped_on_recompute() {
    let (_dir, store) = temp_store();
    store
        .write_evidence(&[
            literature("HGNC:9008", "PKD1", 1),
            literature("HGNC:9009", "PKD2", 3),
        ])
        .unwrap();
    let scoring = engine(store.clone(), Duration::ZERO);

    let before = scoring.gene_summary(&id("HGNC:9008")).unwrap();
    assert_eq!(before.overall, Some(50.0));

    store
        .write_evidence(&[literature("HGNC:9008", "PKD1", 6)])
        .unwrap();
    scoring.recompute(&SourceName::PubTator).unwrap();
    let after = scoring.gene_summary(&id("HGNC:9008")).unwrap();
    assert_eq!(after.overall, Some(100.0));
}

#[test]
fn summary_computed_across_an_invalidation_is_not_cached() {
    let (_dir, store) = temp_store();
    store
        .write_evidence(&[
            literature("HGNC:9008", "PKD1", 1),
            literature("HGNC:9009", "PKD2", 3),
        ])
        .unwrap();
    let root = store.cache_root().to_owned();
    let cache = Arc::new(CacheService::new(CacheSettings::new(root)).unwrap());
    let writer = cache.clone();
    let repo = ObservedRepo::new(store.clone()).on_gene_read(move || {
        writer.invalidate_namespace(namespace::SCORES).unwrap();
    });
    let scoring = ScoringEngine::new(
        Arc::new(repo),
        Some(cache.clone()),
        ScoringSettings {
            min_interval: Duration::ZERO,
        },
    );
    scoring.recompute(&SourceName::PubTator).unwrap();

    let summary = scoring.gene_summary(&id("HGNC:9008")).unwrap();
    assert_eq!(summary.overall, Some(50.0));
    assert_eq!(
        cache
            .get_json::<GeneSummary>(namespace::SCORES, "gene:HGNC:9008")
            .unwrap(),
        None
    );
}
