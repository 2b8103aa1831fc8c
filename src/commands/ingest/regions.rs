use std::collections::HashSet;

use anyhow::{Context, anyhow};
use geo::{BoundingRect, Contains, MultiPolygon, Point, Rect};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, warn};

use super::error::{PipelineError, StageResultExt};
use super::geometry::{BoundaryFeature, validate_multi_polygon};
use crate::model::StageCounts;

#[derive(Debug, Clone)]
pub struct RegionEntry {
    pub id: i64,
    pub code: String,
    pub name: String,
    pub geometry: MultiPolygon<f64>,
    pub bbox: Rect<f64>,
}

/// Snapshot of every region known to the store, in id order.
#[derive(Debug, Clone, Default)]
pub struct RegionCatalog {
    entries: Vec<RegionEntry>,
}

impl RegionCatalog {
    pub fn load(connection: &Connection) -> Result<Self, PipelineError> {
        let mut statement = connection
            .prepare("SELECT id, code, name, geom_geojson FROM regions ORDER BY id")
            .context("failed to prepare region catalog query")
            .or_store_unavailable()?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("failed to query region catalog")
            .or_store_unavailable()?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, code, name, geom_geojson) = row
                .context("failed to read region row")
                .or_store_unavailable()?;
            match parse_stored_geometry(&geom_geojson) {
                Ok(geometry) => {
                    let Some(bbox) = geometry.bounding_rect() else {
                        warn!(region_id = id, code = %code, "region geometry has no extent");
                        continue;
                    };
                    entries.push(RegionEntry {
                        id,
                        code,
                        name,
                        geometry,
                        bbox,
                    });
                }
                Err(err) => {
                    warn!(region_id = id, code = %code, error = %err, "unreadable region geometry");
                }
            }
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RegionEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    pub fn by_code(&self, code: &str) -> Option<&RegionEntry> {
        self.entries.iter().find(|entry| entry.code == code)
    }

    /// First region (in catalog order) whose polygon contains the point.
    pub fn resolve(&self, point: Point<f64>) -> Option<&RegionEntry> {
        self.entries.iter().find(|entry| {
            rect_contains(&entry.bbox, point) && entry.geometry.contains(&point)
        })
    }
}

fn rect_contains(rect: &Rect<f64>, point: Point<f64>) -> bool {
    let (min, max) = (rect.min(), rect.max());
    point.x() >= min.x && point.x() <= max.x && point.y() >= min.y && point.y() <= max.y
}

fn parse_stored_geometry(raw: &str) -> anyhow::Result<MultiPolygon<f64>> {
    let geometry: geojson::Geometry =
        serde_json::from_str(raw).context("stored geometry is not GeoJSON")?;
    match geo::Geometry::<f64>::try_from(geometry)? {
        geo::Geometry::MultiPolygon(multi_polygon) => Ok(multi_polygon),
        geo::Geometry::Polygon(polygon) => Ok(MultiPolygon::new(vec![polygon])),
        _ => Err(anyhow!("stored geometry is not a multipolygon")),
    }
}

pub(crate) fn geometry_to_geojson(multi_polygon: &MultiPolygon<f64>) -> anyhow::Result<String> {
    let geometry = geojson::Geometry::new(geojson::Value::from(multi_polygon));
    serde_json::to_string(&geometry).context("failed to serialize region geometry")
}

#[derive(Debug)]
pub struct RegionLoadReport {
    pub catalog: RegionCatalog,
    pub counts: StageCounts,
}

/// Upserts boundary features by code inside one transaction, then reloads the
/// catalog so later stages see every region in the store.
pub fn load_regions(
    connection: &mut Connection,
    features: &[BoundaryFeature],
) -> Result<RegionLoadReport, PipelineError> {
    let tx = connection
        .transaction()
        .context("failed to begin region transaction")
        .or_store_unavailable()?;
    let mut counts = StageCounts::default();
    let mut seen_codes = HashSet::new();

    {
        let mut select_statement = tx
            .prepare("SELECT id FROM regions WHERE code = ?1")
            .or_store_unavailable()?;
        let mut insert_statement = tx
            .prepare(
                "
                INSERT INTO regions(name, code, geom_geojson, srid, min_x, min_y, max_x, max_y)
                VALUES(?1, ?2, ?3, 4326, ?4, ?5, ?6, ?7)
                ",
            )
            .or_store_unavailable()?;
        let mut update_statement = tx
            .prepare(
                "
                UPDATE regions SET
                  name=?2, geom_geojson=?3, srid=4326, min_x=?4, min_y=?5, max_x=?6, max_y=?7
                WHERE id=?1
                ",
            )
            .or_store_unavailable()?;
        let mut rtree_delete = tx
            .prepare("DELETE FROM regions_rtree WHERE id = ?1")
            .or_store_unavailable()?;
        let mut rtree_insert = tx
            .prepare(
                "INSERT INTO regions_rtree(id, min_x, max_x, min_y, max_y) VALUES(?1, ?2, ?3, ?4, ?5)",
            )
            .or_store_unavailable()?;

        for feature in features {
            if let Err(reason) = validate_multi_polygon(&feature.geometry) {
                warn!(code = %feature.code, reason = %reason, "skipping invalid region geometry");
                counts.skipped += 1;
                continue;
            }
            let Some(bbox) = feature.geometry.bounding_rect() else {
                warn!(code = %feature.code, "skipping region without extent");
                counts.skipped += 1;
                continue;
            };
            if !seen_codes.insert(feature.code.as_str()) {
                warn!(
                    code = %feature.code,
                    name = %feature.name,
                    "skipping boundary feature with a code already seen in this input"
                );
                counts.skipped += 1;
                continue;
            }
            let geom_geojson = geometry_to_geojson(&feature.geometry).or_malformed()?;
            let (min, max) = (bbox.min(), bbox.max());

            let existing: Option<i64> = select_statement
                .query_row([&feature.code], |row| row.get(0))
                .optional()
                .with_context(|| format!("failed to look up region {}", feature.code))
                .or_store_unavailable()?;

            let region_id = match existing {
                Some(region_id) => {
                    update_statement
                        .execute(params![
                            region_id,
                            &feature.name,
                            geom_geojson,
                            min.x,
                            min.y,
                            max.x,
                            max.y
                        ])
                        .with_context(|| format!("failed to update region {}", feature.code))
                        .or_store_unavailable()?;
                    counts.updated += 1;
                    region_id
                }
                None => {
                    insert_statement
                        .execute(params![
                            &feature.name,
                            &feature.code,
                            geom_geojson,
                            min.x,
                            min.y,
                            max.x,
                            max.y
                        ])
                        .with_context(|| format!("failed to insert region {}", feature.code))
                        .or_store_unavailable()?;
                    counts.inserted += 1;
                    tx.last_insert_rowid()
                }
            };

            rtree_delete
                .execute([region_id])
                .or_store_unavailable()?;
            rtree_insert
                .execute(params![region_id, min.x, max.x, min.y, max.y])
                .with_context(|| format!("failed to index region {}", feature.code))
                .or_store_unavailable()?;
        }
    }

    tx.commit()
        .context("failed to commit region transaction")
        .or_store_unavailable()?;

    let catalog = RegionCatalog::load(connection)?;
    info!(
        inserted = counts.inserted,
        updated = counts.updated,
        skipped = counts.skipped,
        catalog = catalog.len(),
        "region catalog loaded"
    );

    Ok(RegionLoadReport { catalog, counts })
}
