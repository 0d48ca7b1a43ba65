//! Built-in dataset definitions and the transformations they use.

mod csv_import;
mod download;
pub mod storm_details;

use std::sync::Arc;

use cabin_engine::{EngineError, Registry};
use cabin_store::TableStore;

pub use csv_import::CsvTableImport;
pub use download::HttpDownload;

/// Root values for the built-in chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roots {
    pub storm_year: String,
}

impl Default for Roots {
    fn default() -> Self {
        Self {
            storm_year: storm_details::DEFAULT_YEAR.to_string(),
        }
    }
}

/// The registry of every built-in dataset.
pub fn registry(tables: Arc<TableStore>, roots: &Roots) -> Result<Registry, EngineError> {
    Registry::builder()
        .datasets(storm_details::definitions(tables, &roots.storm_year))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_engine::FormulaHasher;
    use cabin_store::DatasetKind;
    use pretty_assertions::assert_eq;

    fn tables() -> Arc<TableStore> {
        Arc::new(TableStore::open_in_memory().unwrap())
    }

    #[test]
    fn test_builtin_registry_is_valid() {
        let registry = registry(tables(), &Roots::default()).unwrap();

        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![storm_details::OFFICIAL, storm_details::FILE, storm_details::TABLE]
        );
        assert_eq!(registry.get(storm_details::TABLE).unwrap().kind(), DatasetKind::Table);
        assert_eq!(
            registry.get(storm_details::OFFICIAL).unwrap().root_source(),
            Some("2011")
        );
    }

    #[test]
    fn test_storm_year_is_the_root() {
        let registry = registry(
            tables(),
            &Roots {
                storm_year: "2012".to_string(),
            },
        )
        .unwrap();
        let mut hasher = FormulaHasher::new(&registry);

        let key = hasher.key(storm_details::TABLE).unwrap();
        assert_eq!(key.root, "2012");
    }

    #[test]
    fn test_changing_year_outdates_every_dataset() {
        let a = registry(tables(), &Roots::default()).unwrap();
        let b = registry(
            tables(),
            &Roots {
                storm_year: "2013".to_string(),
            },
        )
        .unwrap();
        let mut ha = FormulaHasher::new(&a);
        let mut hb = FormulaHasher::new(&b);

        for name in a.names() {
            assert_ne!(ha.key(name).unwrap(), hb.key(name).unwrap(), "{}", name);
        }
    }

    #[test]
    fn test_table_names_fit_identifier_limit() {
        let registry = registry(tables(), &Roots::default()).unwrap();
        let key = FormulaHasher::new(&registry).key(storm_details::TABLE).unwrap();
        TableStore::validate_name(&key.display_name()).unwrap();
    }
}
