use anyhow::Context;
use geo::{Coord, InteriorPoint, Point};
use rand::Rng;
use rusqlite::{Connection, params};
use serde_json::Value;
use tracing::{info, warn};

use super::error::{PipelineError, StageResultExt};
use super::geometry::{ensure_wgs84, feature_array, first_text_property, is_wgs84_coord};
use super::regions::RegionCatalog;
use crate::model::StageCounts;

pub const FALLBACK_PROJECT_NAME: &str = "Sample Project";
pub const MAX_SYNTHETIC_COST: f64 = 1_000_000.0;

const DEMO_PROJECTS: &[(&str, &str, &str)] = &[
    ("Centre hospitalo-universitaire", "health", "planned"),
    ("Rocade autoroutière", "road", "active"),
    ("Centrale solaire photovoltaïque", "energy", "completed"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct PointFeature {
    pub name: String,
    pub project_type: Option<String>,
    pub status: Option<String>,
    pub cost: Option<f64>,
    pub location: Point<f64>,
}

#[derive(Debug, Default)]
pub struct DecodedPoints {
    pub features: Vec<PointFeature>,
    pub skipped_features: usize,
}

/// Reads the first `sample_size` features of a point FeatureCollection.
pub fn decode_point_features(
    bytes: &[u8],
    sample_size: usize,
) -> Result<DecodedPoints, PipelineError> {
    let document: Value = serde_json::from_slice(bytes)
        .context("point source is not a JSON document")
        .or_malformed()?;
    ensure_wgs84(&document)?;
    let features = feature_array(&document)?;

    let mut decoded = DecodedPoints::default();
    for (index, feature) in features.iter().take(sample_size).enumerate() {
        let Some(location) = point_location(feature) else {
            warn!(feature = index + 1, "skipping feature without a usable point geometry");
            decoded.skipped_features += 1;
            continue;
        };

        let properties = feature.get("properties").and_then(Value::as_object);
        let cost = properties
            .and_then(|properties| properties.get("cost"))
            .and_then(Value::as_f64)
            .filter(|cost| cost.is_finite() && *cost >= 0.0);

        decoded.features.push(PointFeature {
            name: first_text_property(properties, &["name", "name_en", "name:en"])
                .unwrap_or_else(|| FALLBACK_PROJECT_NAME.to_string()),
            project_type: None,
            status: first_text_property(properties, &["status"]),
            cost,
            location,
        });
    }

    info!(
        available = features.len(),
        sampled = decoded.features.len(),
        skipped = decoded.skipped_features,
        "decoded point features"
    );

    Ok(decoded)
}

fn point_location(feature: &Value) -> Option<Point<f64>> {
    let geometry = feature.get("geometry")?;
    if geometry.get("type").and_then(Value::as_str) != Some("Point") {
        return None;
    }
    let coordinates = geometry.get("coordinates")?.as_array()?;
    let coord = Coord {
        x: coordinates.first()?.as_f64()?,
        y: coordinates.get(1)?.as_f64()?,
    };
    is_wgs84_coord(&coord).then(|| Point::from(coord))
}

/// Synthesizes the fixed demonstration projects. Each one is placed at an
/// interior point of a catalog region picked by `rng`, with a synthetic cost.
pub fn synthesize_demo_points<R: Rng + ?Sized>(
    catalog: &RegionCatalog,
    rng: &mut R,
) -> Result<Vec<PointFeature>, PipelineError> {
    if catalog.is_empty() {
        return Err(PipelineError::malformed(
            "cannot place demo projects without any catalog region",
        ));
    }

    let mut features = Vec::with_capacity(DEMO_PROJECTS.len());
    for (name, project_type, status) in DEMO_PROJECTS {
        let region = &catalog.entries()[rng.gen_range(0..catalog.len())];
        let location = region.geometry.interior_point().ok_or_else(|| {
            PipelineError::malformed(format!("region {} has no interior point", region.code))
        })?;

        features.push(PointFeature {
            name: format!("{name} ({})", region.name),
            project_type: Some((*project_type).to_string()),
            status: Some((*status).to_string()),
            cost: Some(synthesize_cost(rng)),
            location,
        });
    }

    Ok(features)
}

/// Sources carry no cost figure; stand in a uniform value in `[0, 1e6)`.
pub fn synthesize_cost<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.gen_range(0.0..MAX_SYNTHETIC_COST)
}

#[derive(Debug, Clone)]
pub struct ImportDefaults<'a> {
    pub project_type: &'a str,
    pub status: &'a str,
}

#[derive(Debug, Default)]
pub struct PointImportReport {
    pub counts: StageCounts,
    pub unassigned: usize,
}

pub fn import_points<R: Rng + ?Sized>(
    connection: &mut Connection,
    catalog: &RegionCatalog,
    features: &[PointFeature],
    defaults: &ImportDefaults<'_>,
    rng: &mut R,
) -> Result<PointImportReport, PipelineError> {
    let mut report = PointImportReport::default();
    let tx = connection
        .transaction()
        .context("failed to begin infrastructure transaction")
        .or_store_unavailable()?;

    {
        let mut insert_statement = tx
            .prepare(
                "
                INSERT INTO infrastructure_projects(name, type, status, cost, lon, lat, location_geojson, region_id)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )
            .or_store_unavailable()?;

        for feature in features {
            let region_id = catalog.resolve(feature.location).map(|region| region.id);
            if region_id.is_none() {
                warn!(
                    name = %feature.name,
                    lon = feature.location.x(),
                    lat = feature.location.y(),
                    "point falls outside every catalog region"
                );
                report.unassigned += 1;
            }

            let cost = feature.cost.unwrap_or_else(|| synthesize_cost(rng));
            let location_geojson = serde_json::json!({
                "type": "Point",
                "coordinates": [feature.location.x(), feature.location.y()],
            })
            .to_string();

            insert_statement
                .execute(params![
                    &feature.name,
                    feature.project_type.as_deref().unwrap_or(defaults.project_type),
                    feature.status.as_deref().unwrap_or(defaults.status),
                    cost,
                    feature.location.x(),
                    feature.location.y(),
                    location_geojson,
                    region_id,
                ])
                .with_context(|| format!("failed to insert project {}", feature.name))
                .or_store_unavailable()?;
            report.counts.inserted += 1;
        }
    }

    tx.commit()
        .context("failed to commit infrastructure transaction")
        .or_store_unavailable()?;

    info!(
        inserted = report.counts.inserted,
        unassigned = report.unassigned,
        "infrastructure projects inserted"
    );

    Ok(report)
}
