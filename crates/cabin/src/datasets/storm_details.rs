//! NOAA storm event details.
//!
//! The yearly details release is downloaded as a CSV file and imported into a
//! table. The release year is the root of the chain, so pointing cabin at
//! another year produces a fresh set of versions and leaves the old ones
//! outdated.

use std::sync::Arc;

use cabin_engine::{DatasetDefinition, ExternalSource};
use cabin_store::{DatasetKind, TableStore};

use super::csv_import::CsvTableImport;
use super::download::HttpDownload;

/// Release year used when none is configured.
pub const DEFAULT_YEAR: &str = "2011";

/// Yearly releases up to 2013 share one creation date in the file name.
pub const DETAILS_URL: &str = "https://www.ncei.noaa.gov/data/storm-events/access/original/{root}/StormEvents_details_s{root}0101_e{root}1231_c20160115";

pub const OFFICIAL: &str = "StormDetailsOfficial";
pub const FILE: &str = "StormDetailsFile";
pub const TABLE: &str = "StormDetailsTable";

/// Columns kept from the release, in table order.
pub const COLUMNS: &[&str] = &[
    "state",
    "state_fips",
    "year",
    "month_name",
    "event_type",
    "begin_date_time",
    "cz_timezone",
    "end_date_time",
    "injuries_direct",
    "injuries_indirect",
    "deaths_direct",
    "deaths_indirect",
    "damage_property",
    "damage_crops",
    "source",
    "magnitude",
    "magnitude_type",
    "flood_cause",
    "category",
    "tor_f_scale",
    "tor_length",
    "tor_width",
    "episode_title",
    "episode_narrative",
    "event_narrative",
];

/// The three storm detail datasets, rooted at `year`.
pub fn definitions(tables: Arc<TableStore>, year: &str) -> Vec<DatasetDefinition> {
    definitions_from(tables, year, DETAILS_URL)
}

/// Like [`definitions`], downloading from another URL template.
pub fn definitions_from(tables: Arc<TableStore>, year: &str, url_template: &str) -> Vec<DatasetDefinition> {
    vec![
        DatasetDefinition::new(OFFICIAL, DatasetKind::External, "1", ExternalSource::at(url_template))
            .root(year)
            .description("NCEI storm events details release")
            .tag("noaa"),
        DatasetDefinition::new(FILE, DatasetKind::File, "1", HttpDownload::new(url_template))
            .input(OFFICIAL)
            .description("Local copy of the details release")
            .tag("noaa"),
        DatasetDefinition::new(TABLE, DatasetKind::Table, "1", CsvTableImport::new(tables, COLUMNS))
            .input(FILE)
            .description("Storm event details, one row per event")
            .tag("noaa"),
    ]
}
