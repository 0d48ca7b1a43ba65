//! Properties of formula fingerprints.

use proptest::prelude::*;

use cabin_engine::{DatasetDefinition, ExternalSource, FormulaHasher, Registry};
use cabin_store::DatasetKind;

fn registry(root: &str, versions: &[String; 3]) -> Registry {
    Registry::builder()
        .dataset(
            DatasetDefinition::new("A", DatasetKind::External, versions[0].clone(), ExternalSource::new())
                .root(root),
        )
        .dataset(
            DatasetDefinition::new("B", DatasetKind::File, versions[1].clone(), ExternalSource::new())
                .input("A"),
        )
        .dataset(
            DatasetDefinition::new("C", DatasetKind::Table, versions[2].clone(), ExternalSource::new())
                .input("B"),
        )
        .build()
        .unwrap()
}

fn version() -> impl Strategy<Value = String> {
    "[0-9]{1,3}"
}

proptest! {
    #[test]
    fn test_fingerprints_are_reproducible(root in "[0-9]{4}", v in [version(), version(), version()]) {
        let first = registry(&root, &v);
        let second = registry(&root, &v);
        let mut h1 = FormulaHasher::new(&first);
        let mut h2 = FormulaHasher::new(&second);
        for name in ["A", "B", "C"] {
            prop_assert_eq!(h1.key(name).unwrap(), h2.key(name).unwrap());
        }
    }

    #[test]
    fn test_upstream_change_reaches_every_descendant(
        root in "[0-9]{4}",
        v in [version(), version(), version()],
        changed in 0usize..3,
    ) {
        let mut w = v.clone();
        w[changed] = format!("{}-next", w[changed]);

        let before = registry(&root, &v);
        let after = registry(&root, &w);
        let mut h1 = FormulaHasher::new(&before);
        let mut h2 = FormulaHasher::new(&after);

        for (i, name) in ["A", "B", "C"].iter().enumerate() {
            let same = h1.fingerprint(name).unwrap() == h2.fingerprint(name).unwrap();
            prop_assert_eq!(same, i < changed, "{} after changing index {}", name, changed);
        }
    }
}
