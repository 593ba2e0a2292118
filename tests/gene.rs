mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_matches::assert_matches;

use genevidence::domain::GeneSymbol;
use genevidence::error::IngestError;
use genevidence::gene::{
    AuthorityRecord, GeneNormalizer, GeneRegistry, GeneResolver, NomenclatureAuthority,
};

use common::temp_store;

struct FakeHgnc {
    lookups: AtomicUsize,
}

impl NomenclatureAuthority for FakeHgnc {
    fn lookup(&self, symbol: &GeneSymbol) -> Result<Option<AuthorityRecord>, IngestError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let record = match symbol.as_str() {
            "PKD1" | "PBP" => Some(AuthorityRecord {
                hgnc_id: "HGNC:9008".to_string(),
                symbol: "PKD1".to_string(),
                aliases: vec!["PBP".to_string()],
            }),
            _ => None,
        };
        Ok(record)
    }
}

#[test]
fn alias_resolves_to_approved_gene_and_is_remembered() {
    let (_dir, store) = temp_store();
    let registry = Arc::new(GeneRegistry::open(&store).unwrap());
    let authority = Arc::new(FakeHgnc {
        lookups: AtomicUsize::new(0),
    });
    let resolver = GeneResolver::new(registry.clone(), Some(authority.clone()));

    let gene = resolver.normalize("pbp").unwrap();
    assert_eq!(gene.id.as_str(), "HGNC:9008");
    assert_eq!(gene.symbol.as_str(), "PKD1");

    // Both spellings now resolve from the registry.
    assert_eq!(resolver.normalize("PKD1").unwrap().id, gene.id);
    assert_eq!(resolver.normalize("PBP").unwrap().id, gene.id);
    assert_eq!(authority.lookups.load(Ordering::SeqCst), 1);

    resolver.persist().unwrap();
    let reopened = GeneRegistry::open(&store).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.find("HGNC:9008").unwrap().symbol.as_str(), "PKD1");
}

#[test]
fn unknown_and_malformed_subjects_fail_normalization() {
    let (_dir, store) = temp_store();
    let registry = Arc::new(GeneRegistry::open(&store).unwrap());
    let resolver = GeneResolver::new(
        registry,
        Some(Arc::new(FakeHgnc {
            lookups: AtomicUsize::new(0),
        })),
    );

    assert_matches!(
        resolver.normalize("NOTAGENE"),
        Err(IngestError::Normalization { .. })
    );
    assert_matches!(
        resolver.normalize("two words"),
        Err(IngestError::Normalization { .. })
    );
}

#[test]
fn registry_rejects_symbol_reassignment() {
    let (_dir, store) = temp_store();
    let registry = GeneRegistry::open(&store).unwrap();
    registry.register(common::gene("HGNC:9008", "PKD1")).unwrap();
    let err = registry
        .register(common::gene("HGNC:1", "PKD1"))
        .unwrap_err();
    assert_matches!(err, IngestError::Normalization { .. });
}
