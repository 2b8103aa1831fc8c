use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;

use geo::Point;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rusqlite::Connection;
use serde_json::{Value, json};
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::db_setup::{count_rows, open_store};
use super::error::{CancelFlag, PipelineError};
use super::fetch::{FetchConfig, Fetcher, SourceLocation};
use super::geometry::{DecodedBoundaries, decode_boundaries};
use super::indicators::{IndicatorLoad, load_indicator_facts, synthesize_regional_values};
use super::infrastructure::{
    FALLBACK_PROJECT_NAME, ImportDefaults, decode_point_features, import_points,
    synthesize_demo_points,
};
use super::pipeline::{
    IndicatorSourceConfig, PipelineConfig, PipelineRun, PointSource, run_pipeline,
};
use super::regions::{RegionCatalog, load_regions};
use super::tabular::{EntryPredicate, TableSchema, YearValue, extract_year_values};
use crate::cli::{Cli, Commands, IndicatorMode};
use crate::model::{ErrorKind, StageName, StageStatus};

const DATA_ENTRY: &str = "API_NY.GDP.MKTP.CD_DS2_en_csv_v2_1.csv";

fn square(lon: f64, lat: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [lon, lat],
            [lon + 1.0, lat],
            [lon + 1.0, lat + 1.0],
            [lon, lat + 1.0],
            [lon, lat]
        ]]
    })
}

fn grid_cell(index: usize) -> (f64, f64) {
    ((index % 10) as f64, 20.0 + (index / 10) as f64)
}

fn labelled_feature(index: usize) -> Value {
    let (lon, lat) = grid_cell(index);
    json!({
        "type": "Feature",
        "properties": {
            "admin1Name_en": format!("Wilaya {}", index + 1),
            "admin1Pcode": format!("DZ{:02}", index + 1)
        },
        "geometry": square(lon, lat)
    })
}

fn collection(features: Vec<Value>) -> Value {
    json!({ "type": "FeatureCollection", "features": features })
}

fn boundary_collection(count: usize) -> Value {
    collection((0..count).map(labelled_feature).collect())
}

fn to_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn series_csv(first_year: i32, years: i32) -> String {
    let mut csv = String::from("Country Name,Year,Value\n");
    for offset in 0..years {
        let year = first_year + offset;
        csv.push_str(&format!("Algeria,{year},{}\n", 1.5e11 + f64::from(offset) * 1e9));
    }
    csv
}

fn indicator_archive(csv: &str) -> Vec<u8> {
    zip_bytes(&[
        (
            "Metadata_Indicator_API_NY.GDP.MKTP.CD_DS2_en_csv_v2_1.csv",
            b"INDICATOR_CODE,INDICATOR_NAME\nNY.GDP.MKTP.CD,GDP (current US$)\n",
        ),
        ("API_NY.GDP.MKTP.CD_Metadata_Country.csv", b"Year,Value\n1999,1\n"),
        (DATA_ENTRY, csv.as_bytes()),
    ])
}

fn decode_layer(bytes: &[u8], layer_hint: Option<&str>) -> Result<DecodedBoundaries, PipelineError> {
    decode_boundaries(bytes, layer_hint, &std::env::temp_dir())
}

fn scratch_store() -> (TempDir, Connection) {
    let dir = TempDir::new().unwrap();
    let connection = open_store(&dir.path().join("geoconsole.sqlite")).unwrap();
    (dir, connection)
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> SourceLocation {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    SourceLocation::File(path)
}

fn quick_fetcher() -> Fetcher {
    Fetcher::new(FetchConfig {
        timeout: Duration::from_secs(2),
        max_attempts: 2,
        initial_backoff: Duration::ZERO,
    })
    .unwrap()
}

fn default_predicate() -> EntryPredicate {
    EntryPredicate::new(r"^API_.*\.csv$", Some("Metadata")).unwrap()
}

fn seeded(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

fn loaded_catalog(connection: &mut Connection, count: usize) -> RegionCatalog {
    let decoded = decode_layer(&to_bytes(&boundary_collection(count)), None).unwrap();
    load_regions(connection, &decoded.features).unwrap().catalog
}

fn rows(connection: &Connection, table: &str) -> i64 {
    count_rows(connection, &format!("SELECT COUNT(*) FROM {table}")).unwrap()
}

#[test]
fn decode_boundaries_preserves_order_and_fills_placeholders() {
    let mut features = vec![labelled_feature(0), labelled_feature(1), labelled_feature(2)];
    features[1]["properties"] = json!({});

    let decoded = decode_layer(&to_bytes(&collection(features)), None).unwrap();

    let names = decoded
        .features
        .iter()
        .map(|feature| feature.name.as_str())
        .collect::<Vec<_>>();
    let codes = decoded
        .features
        .iter()
        .map(|feature| feature.code.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Wilaya 1", "Region 2", "Wilaya 3"]);
    assert_eq!(codes, vec!["DZ01", "R002", "DZ03"]);
    assert_eq!(decoded.placeholder_labels, 1);
    assert_eq!(decoded.skipped_features, 0);
}

#[test]
fn decode_boundaries_skips_unusable_geometries() {
    let features = vec![
        labelled_feature(0),
        json!({ "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [1.0, 2.0] } }),
        json!({ "type": "Feature", "properties": {}, "geometry": null }),
        json!({ "type": "Feature", "properties": {}, "geometry": square(500.0, 20.0) }),
        json!({ "type": "Feature", "properties": {}, "geometry": { "type": "Polygon", "coordinates": "broken" } }),
        json!({
            "type": "Feature",
            "properties": {},
            "geometry": { "type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]] }
        }),
        labelled_feature(1),
    ];

    let decoded = decode_layer(&to_bytes(&collection(features)), None).unwrap();

    assert_eq!(decoded.features.len(), 2);
    assert_eq!(decoded.skipped_features, 5);
    assert_eq!(decoded.features[0].code, "DZ01");
    assert_eq!(decoded.features[1].code, "DZ02");
}

#[test]
fn decode_boundaries_fails_when_no_feature_is_usable() {
    let features = vec![
        json!({ "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [1.0, 2.0] } }),
        json!({ "type": "Feature", "properties": {}, "geometry": null }),
    ];

    let err = decode_layer(&to_bytes(&collection(features)), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
}

#[test]
fn decode_boundaries_rejects_projected_crs() {
    let mut document = boundary_collection(2);
    document["crs"] = json!({
        "type": "name",
        "properties": { "name": "urn:ogc:def:crs:EPSG::3857" }
    });

    let err = decode_layer(&to_bytes(&document), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);

    document["crs"]["properties"]["name"] = json!("urn:ogc:def:crs:OGC:1.3:CRS84");
    let decoded = decode_layer(&to_bytes(&document), None).unwrap();
    assert_eq!(decoded.features.len(), 2);
}

#[test]
fn decode_boundaries_reads_geojson_layer_from_archive() {
    let layer = to_bytes(&boundary_collection(4));
    let archive = zip_bytes(&[
        ("dza_adm1/readme.txt", b"boundaries"),
        ("dza_adm1/dza_admbnda_adm1.geojson", &layer),
    ]);

    let decoded = decode_layer(&archive, Some("adm1")).unwrap();
    assert_eq!(decoded.features.len(), 4);
    assert_eq!(decoded.features[3].name, "Wilaya 4");
}

#[test]
fn decode_boundaries_archive_without_vector_layer_is_malformed() {
    let archive = zip_bytes(&[("readme.txt", b"no layers here")]);

    let err = decode_layer(&archive, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
}

#[test]
fn decode_boundaries_corrupt_archive_is_unavailable() {
    let err = decode_layer(b"PK\x03\x04definitely not a zip archive", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}

#[test]
fn entry_predicate_matches_file_name_and_excludes_metadata() {
    let predicate = default_predicate();

    assert!(predicate.matches(DATA_ENTRY));
    assert!(predicate.matches("nested/API_NY.GDP.MKTP.CD.csv"));
    assert!(!predicate.matches("API_NY.GDP.MKTP.CD_Metadata_Country.csv"));
    assert!(!predicate.matches("Metadata_Indicator_API_NY.GDP.MKTP.CD.csv"));
    assert!(!predicate.matches("API_NY.GDP.MKTP.CD.xml"));
}

#[test]
fn extract_year_values_drops_non_numeric_rows() {
    let csv = "\
Year,Value
2000,54790245600.5
2001,54744714396.9
2002,56760288974.5
2003,..
2004,85324998959.0
2005,
2006,117027307540.9
";
    let table =
        extract_year_values(&indicator_archive(csv), &default_predicate(), &TableSchema::default())
            .unwrap();

    assert_eq!(table.entry_name, DATA_ENTRY);
    assert_eq!(table.rows.len(), 5);
    assert_eq!(table.dropped_rows, 2);
    assert_eq!(
        table.rows.iter().map(|row| row.year).collect::<Vec<_>>(),
        vec![2000, 2001, 2002, 2004, 2006]
    );
}

#[test]
fn extract_year_values_keeps_duplicates_in_file_order() {
    let csv = "year,value\n2001,2.0\n2000,1.0\n2001,3.0\n";
    let table =
        extract_year_values(&indicator_archive(csv), &default_predicate(), &TableSchema::default())
            .unwrap();

    assert_eq!(
        table.rows,
        vec![
            YearValue { year: 2001, value: 2.0 },
            YearValue { year: 2000, value: 1.0 },
            YearValue { year: 2001, value: 3.0 },
        ]
    );
}

#[test]
fn extract_year_values_without_matching_entry_is_unavailable() {
    let archive = zip_bytes(&[("Metadata_Country.csv", b"Year,Value\n2000,1\n")]);

    let err = extract_year_values(&archive, &default_predicate(), &TableSchema::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}

#[test]
fn extract_year_values_without_parseable_rows_is_malformed() {
    let csv = "Year,Value\nn/a,1\n2001,..\n";
    let err =
        extract_year_values(&indicator_archive(csv), &default_predicate(), &TableSchema::default())
            .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);

    let missing_column = "Year,Amount\n2001,1\n";
    let err = extract_year_values(
        &indicator_archive(missing_column),
        &default_predicate(),
        &TableSchema::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
}

#[test]
fn load_regions_persists_one_row_per_code() {
    let (_dir, mut connection) = scratch_store();

    let catalog = loaded_catalog(&mut connection, 12);

    assert_eq!(catalog.len(), 12);
    assert_eq!(rows(&connection, "regions"), 12);
    assert_eq!(
        count_rows(&connection, "SELECT COUNT(DISTINCT code) FROM regions").unwrap(),
        12
    );
    assert_eq!(rows(&connection, "regions_rtree"), 12);
}

#[test]
fn load_regions_twice_upserts_by_code() {
    let (_dir, mut connection) = scratch_store();
    let decoded = decode_layer(&to_bytes(&boundary_collection(6)), None).unwrap();

    let first = load_regions(&mut connection, &decoded.features).unwrap();
    let second = load_regions(&mut connection, &decoded.features).unwrap();

    assert_eq!(first.counts.inserted, 6);
    assert_eq!(second.counts.inserted, 0);
    assert_eq!(second.counts.updated, 6);
    assert_eq!(rows(&connection, "regions"), 6);
    assert_eq!(
        first.catalog.ids().collect::<Vec<_>>(),
        second.catalog.ids().collect::<Vec<_>>()
    );
}

#[test]
fn region_catalog_resolves_points_by_containment() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 12);

    let region = catalog.resolve(Point::new(1.5, 21.5)).unwrap();
    assert_eq!(region.code, "DZ12");
    assert_eq!(catalog.by_code("DZ12").map(|entry| entry.id), Some(region.id));

    assert!(catalog.resolve(Point::new(-45.0, -10.0)).is_none());
}

#[test]
fn synthesized_values_stay_within_ten_percent() {
    let national = 1.7e11;
    let regions = 58;
    let values = synthesize_regional_values(national, regions, &mut seeded(7));

    let per_region = national / regions as f64;
    assert_eq!(values.len(), regions);
    for value in &values {
        assert!(*value >= per_region * 0.9 - 1e-6);
        assert!(*value <= per_region * 1.1 + 1e-6);
    }
    let total = values.iter().sum::<f64>();
    assert!((total - national).abs() <= national * 0.1);

    assert!(synthesize_regional_values(national, 0, &mut seeded(7)).is_empty());
}

#[test]
fn same_seed_reproduces_distribution() {
    let first = synthesize_regional_values(1_000.0, 5, &mut seeded(42));
    let second = synthesize_regional_values(1_000.0, 5, &mut seeded(42));
    assert_eq!(first, second);
}

#[test]
fn load_indicator_facts_writes_one_fact_per_region_and_year() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 5);
    let series = vec![
        YearValue { year: 2010, value: 1.0e9 },
        YearValue { year: 2011, value: 1.2e9 },
        YearValue { year: 2012, value: 1.4e9 },
    ];
    let load = IndicatorLoad {
        indicator: "NY.GDP.MKTP.CD",
        rows: &series,
        mode: IndicatorMode::Append,
    };

    let report =
        load_indicator_facts(&mut connection, &catalog, &load, &mut seeded(1), &CancelFlag::new())
            .unwrap();

    assert_eq!(report.counts.inserted, 15);
    assert_eq!(report.years_loaded, 3);
    assert_eq!(rows(&connection, "indicator_facts"), 15);

    let mut statement = connection
        .prepare("SELECT year, COUNT(*), SUM(value) FROM indicator_facts GROUP BY year ORDER BY year")
        .unwrap();
    let per_year = statement
        .query_map([], |row| {
            Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(per_year.len(), 3);
    for ((year, count, sum), expected) in per_year.into_iter().zip(&series) {
        assert_eq!(year, expected.year);
        assert_eq!(count, 5);
        assert!((sum - expected.value).abs() <= expected.value * 0.1);
    }
}

#[test]
fn replace_mode_keeps_a_single_generation_of_facts() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 4);
    let series = vec![
        YearValue { year: 2020, value: 400.0 },
        YearValue { year: 2021, value: 800.0 },
    ];
    let cancel = CancelFlag::new();
    let mut rng = seeded(3);

    let replace = IndicatorLoad {
        indicator: "NY.GDP.MKTP.CD",
        rows: &series,
        mode: IndicatorMode::Replace,
    };
    load_indicator_facts(&mut connection, &catalog, &replace, &mut rng, &cancel).unwrap();
    let second = load_indicator_facts(&mut connection, &catalog, &replace, &mut rng, &cancel).unwrap();
    assert_eq!(second.replaced_facts, 8);
    assert_eq!(rows(&connection, "indicator_facts"), 8);

    let append = IndicatorLoad {
        mode: IndicatorMode::Append,
        ..replace
    };
    load_indicator_facts(&mut connection, &catalog, &append, &mut rng, &cancel).unwrap();
    assert_eq!(rows(&connection, "indicator_facts"), 16);
}

#[test]
fn indicator_distribution_skips_empty_catalog() {
    let (_dir, mut connection) = scratch_store();
    let series = vec![YearValue { year: 2020, value: 10.0 }];
    let load = IndicatorLoad {
        indicator: "NY.GDP.MKTP.CD",
        rows: &series,
        mode: IndicatorMode::Replace,
    };

    let report = load_indicator_facts(
        &mut connection,
        &RegionCatalog::default(),
        &load,
        &mut seeded(1),
        &CancelFlag::new(),
    )
    .unwrap();

    assert_eq!(report.counts.inserted, 0);
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(rows(&connection, "indicator_facts"), 0);
}

#[test]
fn cancelled_distribution_rolls_back() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 3);
    let series = vec![YearValue { year: 2020, value: 10.0 }];
    let load = IndicatorLoad {
        indicator: "NY.GDP.MKTP.CD",
        rows: &series,
        mode: IndicatorMode::Append,
    };
    let cancel = CancelFlag::new();
    cancel.cancel();

    let err = load_indicator_facts(&mut connection, &catalog, &load, &mut seeded(1), &cancel)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(rows(&connection, "indicator_facts"), 0);
}

#[test]
fn demo_points_are_assigned_to_catalog_regions() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 10);
    let mut rng = seeded(11);

    let features = synthesize_demo_points(&catalog, &mut rng).unwrap();
    let defaults = ImportDefaults {
        project_type: "health",
        status: "active",
    };
    let report = import_points(&mut connection, &catalog, &features, &defaults, &mut rng).unwrap();

    assert_eq!(features.len(), 3);
    assert_eq!(report.counts.inserted, 3);
    assert_eq!(report.unassigned, 0);
    assert_eq!(rows(&connection, "infrastructure_projects"), 3);
    assert_eq!(
        count_rows(
            &connection,
            "SELECT COUNT(*) FROM infrastructure_projects WHERE region_id IS NULL"
        )
        .unwrap(),
        0
    );
    assert_eq!(
        count_rows(
            &connection,
            "SELECT COUNT(DISTINCT type) FROM infrastructure_projects"
        )
        .unwrap(),
        3
    );
}

#[test]
fn demo_points_need_a_catalog() {
    let err = synthesize_demo_points(&RegionCatalog::default(), &mut seeded(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);
}

#[test]
fn remote_points_are_sampled_and_unmatched_points_stay_unassigned() {
    let (_dir, mut connection) = scratch_store();
    let catalog = loaded_catalog(&mut connection, 4);

    let mut features = (0..12)
        .map(|index| {
            json!({
                "type": "Feature",
                "properties": { "name": format!("Clinic {index}"), "cost": 2500.0 },
                "geometry": { "type": "Point", "coordinates": [0.5 + index as f64, 20.5] }
            })
        })
        .collect::<Vec<_>>();
    features[1]["properties"] = json!({});
    features[2]["geometry"] = square(0.0, 20.0);
    let document = collection(features);

    let decoded = decode_point_features(&to_bytes(&document), 10).unwrap();
    assert_eq!(decoded.features.len(), 9);
    assert_eq!(decoded.skipped_features, 1);
    assert_eq!(decoded.features[1].name, FALLBACK_PROJECT_NAME);
    assert_eq!(decoded.features[0].cost, Some(2500.0));
    assert_eq!(decoded.features[1].cost, None);

    let defaults = ImportDefaults {
        project_type: "health",
        status: "active",
    };
    let report =
        import_points(&mut connection, &catalog, &decoded.features, &defaults, &mut seeded(5))
            .unwrap();

    // Grid cells 0..4 cover lon 0..4 on the first row; the rest fall outside.
    assert_eq!(report.counts.inserted, 9);
    assert_eq!(report.unassigned, 6);
    let synthetic_cost: f64 = connection
        .query_row(
            "SELECT cost FROM infrastructure_projects WHERE name = ?1",
            [FALLBACK_PROJECT_NAME],
            |row| row.get(0),
        )
        .unwrap();
    assert!((0.0..1_000_000.0).contains(&synthetic_cost));
}

fn pipeline_config(dir: &Path, boundaries: SourceLocation) -> PipelineConfig {
    let indicator_archive = indicator_archive(&series_csv(2005, 16));
    PipelineConfig {
        boundary_source: boundaries,
        boundary_layer_hint: Some("adm1".to_string()),
        scratch_root: std::env::temp_dir(),
        indicator: Some(IndicatorSourceConfig {
            location: write_file(dir, "gdp.zip", &indicator_archive),
            indicator_code: "NY.GDP.MKTP.CD".to_string(),
            entry: default_predicate(),
            schema: TableSchema::default(),
            mode: IndicatorMode::Replace,
        }),
        points: Some(PointSource::Demo),
        project_type: "health".to_string(),
        project_status: "active".to_string(),
    }
}

fn stage_status(run: &PipelineRun, stage: StageName) -> StageStatus {
    run.stage(stage).map(|outcome| outcome.status).unwrap()
}

#[test]
fn full_run_loads_regions_facts_and_projects() {
    let dir = TempDir::new().unwrap();
    let mut connection = open_store(&dir.path().join("geoconsole.sqlite")).unwrap();
    let boundaries = write_file(
        dir.path(),
        "dza_admbnda_adm1.geojson",
        &to_bytes(&boundary_collection(58)),
    );
    let config = pipeline_config(dir.path(), boundaries);

    let run = run_pipeline(
        &mut connection,
        &quick_fetcher(),
        &config,
        &mut seeded(2025),
        &CancelFlag::new(),
    );

    assert!(run.succeeded());
    assert_eq!(run.exit_code(), 0);
    assert_eq!(rows(&connection, "regions"), 58);
    assert_eq!(rows(&connection, "indicator_facts"), 58 * 16);
    assert_eq!(rows(&connection, "infrastructure_projects"), 3);
    assert_eq!(
        count_rows(
            &connection,
            "SELECT COUNT(*) FROM infrastructure_projects WHERE region_id IS NULL"
        )
        .unwrap(),
        0
    );
    assert_eq!(run.sources.len(), 2);
    assert!(
        run.stages
            .iter()
            .all(|stage| stage.status == StageStatus::Succeeded)
    );
}

#[test]
fn boundary_fetch_failure_skips_dependent_stages() {
    let dir = TempDir::new().unwrap();
    let mut connection = open_store(&dir.path().join("geoconsole.sqlite")).unwrap();
    let config = pipeline_config(
        dir.path(),
        SourceLocation::File(dir.path().join("missing_boundaries.zip")),
    );

    let run = run_pipeline(
        &mut connection,
        &quick_fetcher(),
        &config,
        &mut seeded(1),
        &CancelFlag::new(),
    );

    assert_ne!(run.exit_code(), 0);
    let boundaries = run.stage(StageName::Boundaries).unwrap();
    assert_eq!(boundaries.status, StageStatus::Failed);
    assert_eq!(boundaries.error_kind, Some(ErrorKind::SourceUnavailable));
    assert_eq!(stage_status(&run, StageName::Indicator), StageStatus::Skipped);
    assert_eq!(stage_status(&run, StageName::Points), StageStatus::Skipped);
    assert_eq!(rows(&connection, "regions"), 0);
    assert_eq!(rows(&connection, "indicator_facts"), 0);
    assert_eq!(rows(&connection, "infrastructure_projects"), 0);
}

#[test]
fn indicator_failure_still_imports_points() {
    let dir = TempDir::new().unwrap();
    let mut connection = open_store(&dir.path().join("geoconsole.sqlite")).unwrap();
    let boundaries = write_file(dir.path(), "adm1.geojson", &to_bytes(&boundary_collection(8)));
    let mut config = pipeline_config(dir.path(), boundaries);
    if let Some(indicator) = config.indicator.as_mut() {
        indicator.location = write_file(dir.path(), "gdp_broken.zip", &zip_bytes(&[("notes.txt", b"x")]));
    }

    let run = run_pipeline(
        &mut connection,
        &quick_fetcher(),
        &config,
        &mut seeded(9),
        &CancelFlag::new(),
    );

    assert_eq!(run.exit_code(), 1);
    assert_eq!(stage_status(&run, StageName::Boundaries), StageStatus::Succeeded);
    assert_eq!(
        run.stage(StageName::Indicator).and_then(|stage| stage.error_kind),
        Some(ErrorKind::SourceUnavailable)
    );
    assert_eq!(stage_status(&run, StageName::Points), StageStatus::Succeeded);
    assert_eq!(rows(&connection, "regions"), 8);
    assert_eq!(rows(&connection, "infrastructure_projects"), 3);
}

#[test]
fn cancelled_run_stops_before_first_stage() {
    let dir = TempDir::new().unwrap();
    let mut connection = open_store(&dir.path().join("geoconsole.sqlite")).unwrap();
    let boundaries = write_file(dir.path(), "adm1.geojson", &to_bytes(&boundary_collection(3)));
    let config = pipeline_config(dir.path(), boundaries);
    let cancel = CancelFlag::new();
    cancel.cancel();

    let run = run_pipeline(&mut connection, &quick_fetcher(), &config, &mut seeded(1), &cancel);

    assert_eq!(run.exit_code(), 1);
    assert_eq!(
        run.stage(StageName::Boundaries).and_then(|stage| stage.error_kind),
        Some(ErrorKind::Cancelled)
    );
    assert_eq!(stage_status(&run, StageName::Indicator), StageStatus::Skipped);
    assert_eq!(stage_status(&run, StageName::Points), StageStatus::Skipped);
    assert_eq!(rows(&connection, "regions"), 0);
}

#[test]
fn unreachable_url_is_reported_as_source_unavailable() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let location = SourceLocation::parse(&format!("http://127.0.0.1:{port}/boundaries.zip"));

    let err = quick_fetcher().fetch(&location, &CancelFlag::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
}

#[test]
fn source_location_parses_urls_and_paths() {
    assert_eq!(
        SourceLocation::parse("https://example.org/a.zip"),
        SourceLocation::Url("https://example.org/a.zip".to_string())
    );
    assert_eq!(
        SourceLocation::parse("file:///tmp/a.zip"),
        SourceLocation::File("/tmp/a.zip".into())
    );
    assert_eq!(
        SourceLocation::parse("data/a.zip"),
        SourceLocation::File("data/a.zip".into())
    );
}

fn retrying_fetcher(max_attempts: u32) -> Fetcher {
    Fetcher::new(FetchConfig {
        timeout: Duration::from_secs(5),
        max_attempts,
        initial_backoff: Duration::ZERO,
    })
    .unwrap()
}

/// Serves `status_line` with an empty body to every request and counts hits.
fn status_server(status_line: &'static str) -> (SourceLocation, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/source.zip", listener.local_addr().unwrap());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let mut request = Vec::new();
            let mut buffer = [0_u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                match stream.read(&mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(read) => request.extend_from_slice(&buffer[..read]),
                }
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    (SourceLocation::parse(&url), hits)
}

#[test]
fn server_errors_are_retried_until_attempts_run_out() {
    let (location, hits) = status_server("503 Service Unavailable");

    let err = retrying_fetcher(3)
        .fetch(&location, &CancelFlag::new())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn rate_limited_responses_are_retried() {
    let (location, hits) = status_server("429 Too Many Requests");

    let err = retrying_fetcher(2)
        .fetch(&location, &CancelFlag::new())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn client_errors_fail_without_retry() {
    let (location, hits) = status_server("404 Not Found");

    let err = retrying_fetcher(3)
        .fetch(&location, &CancelFlag::new())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SourceUnavailable);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelled_fetch_sends_no_request() {
    let (location, hits) = status_server("503 Service Unavailable");
    let cancel = CancelFlag::new();
    cancel.cancel();

    let err = retrying_fetcher(3).fetch(&location, &cancel).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn boundary_archive_scratch_is_removed_on_success_and_failure() {
    let scratch = TempDir::new().unwrap();
    let layer = to_bytes(&boundary_collection(2));
    let good = zip_bytes(&[("adm1/regions.geojson", &layer)]);
    let bad = zip_bytes(&[("adm1/regions.geojson", b"{ \"type\": ")]);

    let decoded = decode_boundaries(&good, None, scratch.path()).unwrap();
    assert_eq!(decoded.features.len(), 2);
    let err = decode_boundaries(&bad, None, scratch.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedInput);

    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn extract_year_values_reads_wide_world_bank_layout() {
    let body = r#""Data Source","World Development Indicators",

"Last Updated Date","2024-06-28",

"Country Name","Country Code","Indicator Name","Indicator Code","2000","2001","2002","2003",
"Algeria","DZA","GDP (current US$)","NY.GDP.MKTP.CD","54790245600.5","54744714396.9","","67863829880.9",
"#;
    let csv = format!("\u{feff}{body}");

    let table =
        extract_year_values(&indicator_archive(&csv), &default_predicate(), &TableSchema::default())
            .unwrap();

    assert_eq!(
        table.rows,
        vec![
            YearValue { year: 2000, value: 54790245600.5 },
            YearValue { year: 2001, value: 54744714396.9 },
            YearValue { year: 2003, value: 67863829880.9 },
        ]
    );
    assert_eq!(table.dropped_rows, 1);
}

#[test]
fn load_regions_skips_repeated_codes_within_one_input() {
    let (_dir, mut connection) = scratch_store();
    let mut duplicate = labelled_feature(1);
    duplicate["properties"]["admin1Pcode"] = json!("DZ01");
    let document = collection(vec![labelled_feature(0), duplicate, labelled_feature(2)]);
    let decoded = decode_layer(&to_bytes(&document), None).unwrap();

    let report = load_regions(&mut connection, &decoded.features).unwrap();

    assert_eq!(report.counts.inserted, 2);
    assert_eq!(report.counts.updated, 0);
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(rows(&connection, "regions"), 2);
    assert_eq!(
        report.catalog.by_code("DZ01").map(|entry| entry.name.as_str()),
        Some("Wilaya 1")
    );
}

#[test]
fn unopenable_store_still_writes_failed_manifest() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let manifest_path = dir.path().join("manifest.json");
    let boundaries = write_file(dir.path(), "adm1.geojson", &to_bytes(&boundary_collection(2)));

    let cli = Cli::try_parse_from([
        "geoconsole".to_string(),
        "ingest".to_string(),
        "--cache-root".to_string(),
        dir.path().join("cache").display().to_string(),
        "--db-path".to_string(),
        blocker.join("geoconsole.sqlite").display().to_string(),
        "--run-manifest-path".to_string(),
        manifest_path.display().to_string(),
        "--boundary-source".to_string(),
        boundaries.to_string(),
        "--demo-points".to_string(),
    ])
    .unwrap();
    let Commands::Ingest(args) = cli.command else {
        panic!("expected the ingest subcommand");
    };

    assert!(super::run(args).is_err());

    let manifest: Value = serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["status"], "failed");
    assert_eq!(manifest["stages"][0]["stage"], "boundaries");
    assert_eq!(manifest["stages"][0]["error_kind"], "store_unavailable");
    assert_eq!(manifest["stages"][1]["status"], "skipped");
    assert_eq!(manifest["stages"][2]["status"], "skipped");
}
