use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, anyhow};
use geo::{Coord, MultiPolygon, Polygon};
use serde_json::{Map, Value};
use tempfile::Builder;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::error::{PipelineError, StageResultExt};

const NAME_KEYS: &[&str] = &["admin1Name_en", "name", "NAME_1", "ADM1_EN"];
const CODE_KEYS: &[&str] = &["admin1Pcode", "code", "ADM1_PCODE", "HASC_1"];

#[derive(Debug, Clone)]
pub struct BoundaryFeature {
    pub name: String,
    pub code: String,
    pub geometry: MultiPolygon<f64>,
}

#[derive(Debug, Default)]
pub struct DecodedBoundaries {
    pub features: Vec<BoundaryFeature>,
    pub skipped_features: usize,
    pub placeholder_labels: usize,
}

/// Decodes a boundary layer. Archives are unpacked below `scratch_root` into
/// a private directory that is removed on every return path.
pub fn decode_boundaries(
    bytes: &[u8],
    layer_hint: Option<&str>,
    scratch_root: &Path,
) -> Result<DecodedBoundaries, PipelineError> {
    if is_zip_archive(bytes) {
        return decode_boundary_archive(bytes, layer_hint, scratch_root);
    }

    let document: Value = serde_json::from_slice(bytes)
        .context("boundary source is neither a zip archive nor a JSON document")
        .or_malformed()?;
    decode_feature_collection(&document)
}

pub(crate) fn is_zip_archive(bytes: &[u8]) -> bool {
    bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06")
}

fn decode_boundary_archive(
    bytes: &[u8],
    layer_hint: Option<&str>,
    scratch_root: &Path,
) -> Result<DecodedBoundaries, PipelineError> {
    // Dropping the scratch dir removes every extracted and converted file.
    let scratch = Builder::new()
        .prefix("boundaries-")
        .tempdir_in(scratch_root)
        .with_context(|| {
            format!(
                "failed to create scratch directory under {}",
                scratch_root.display()
            )
        })
        .or_source_unavailable()?;

    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .context("failed to open boundary archive")
        .or_source_unavailable()?;
    archive
        .extract(scratch.path())
        .context("failed to extract boundary archive")
        .or_source_unavailable()?;
    debug!(path = %scratch.path().display(), entries = archive.len(), "extracted boundary archive");

    let mut files = Vec::new();
    collect_files(scratch.path(), &mut files)
        .context("failed to list extracted boundary archive")
        .or_source_unavailable()?;
    files.sort();

    let layer_path = match select_geojson_layer(&files) {
        Some(path) => path.clone(),
        None => {
            let shapefile = select_shapefile(&files, layer_hint).ok_or_else(|| {
                PipelineError::malformed("boundary archive contains no GeoJSON or shapefile layer")
            })?;
            convert_with_ogr2ogr(shapefile, scratch.path())?
        }
    };
    info!(layer = %layer_path.display(), "decoding boundary layer");

    let raw = fs::read(&layer_path)
        .with_context(|| format!("failed to read {}", layer_path.display()))
        .or_malformed()?;
    let document: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", layer_path.display()))
        .or_malformed()?;

    decode_feature_collection(&document)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

fn select_geojson_layer(files: &[PathBuf]) -> Option<&PathBuf> {
    files
        .iter()
        .find(|path| has_extension(path, "geojson") || has_extension(path, "json"))
}

fn select_shapefile<'a>(files: &'a [PathBuf], layer_hint: Option<&str>) -> Option<&'a PathBuf> {
    let mut shapefiles = files.iter().filter(|path| has_extension(path, "shp"));
    let hint = layer_hint
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match hint {
        Some(hint) => {
            let candidates = shapefiles.collect::<Vec<_>>();
            candidates
                .iter()
                .find(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .map(|name| name.to_ascii_lowercase().contains(&hint))
                        .unwrap_or(false)
                })
                .or_else(|| candidates.first())
                .copied()
        }
        None => shapefiles.next(),
    }
}

fn convert_with_ogr2ogr(shapefile: &Path, scratch: &Path) -> Result<PathBuf, PipelineError> {
    let output_path = scratch.join("converted_boundaries.geojson");

    let output = Command::new("ogr2ogr")
        .arg("-f")
        .arg("GeoJSON")
        .arg("-t_srs")
        .arg("EPSG:4326")
        .arg("-nlt")
        .arg("PROMOTE_TO_MULTI")
        .arg(&output_path)
        .arg(shapefile)
        .output()
        .with_context(|| format!("failed to execute ogr2ogr for {}", shapefile.display()))
        .or_malformed()?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(PipelineError::MalformedInput(anyhow!(
            "ogr2ogr returned non-zero exit status for {}: {}",
            shapefile.display(),
            stderr.trim()
        )));
    }
    for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
        warn!(tool = "ogr2ogr", detail = line.trim(), "conversion warning");
    }

    if !output_path.exists() {
        return Err(PipelineError::MalformedInput(anyhow!(
            "ogr2ogr did not produce expected output for {}",
            shapefile.display()
        )));
    }

    Ok(output_path)
}

pub(crate) fn decode_feature_collection(
    document: &Value,
) -> Result<DecodedBoundaries, PipelineError> {
    ensure_wgs84(document)?;
    let features = feature_array(document)?;

    let mut decoded = DecodedBoundaries::default();
    for (index, feature) in features.iter().enumerate() {
        let position = index + 1;
        let geometry = match feature_multi_polygon(feature) {
            Ok(geometry) => geometry,
            Err(reason) => {
                warn!(feature = position, reason = %reason, "skipping boundary feature");
                decoded.skipped_features += 1;
                continue;
            }
        };

        let properties = feature.get("properties").and_then(Value::as_object);
        let name = first_text_property(properties, NAME_KEYS);
        let code = first_text_property(properties, CODE_KEYS);
        if name.is_none() || code.is_none() {
            decoded.placeholder_labels += 1;
        }

        decoded.features.push(BoundaryFeature {
            name: name.unwrap_or_else(|| format!("Region {position}")),
            code: code.unwrap_or_else(|| format!("R{position:03}")),
            geometry,
        });
    }

    if decoded.features.is_empty() {
        return Err(PipelineError::malformed(format!(
            "boundary layer has no usable polygon features ({} skipped)",
            decoded.skipped_features
        )));
    }

    info!(
        features = decoded.features.len(),
        skipped = decoded.skipped_features,
        placeholders = decoded.placeholder_labels,
        "decoded boundary features"
    );

    Ok(decoded)
}

pub(crate) fn feature_array(document: &Value) -> Result<&Vec<Value>, PipelineError> {
    match document.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => {}
        Some(other) => {
            return Err(PipelineError::malformed(format!(
                "expected a FeatureCollection, found {other}"
            )));
        }
        None => return Err(PipelineError::malformed("document has no GeoJSON type")),
    }

    document
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| PipelineError::malformed("FeatureCollection has no features array"))
}

/// Rejects documents that declare a legacy `crs` other than WGS 84 lon/lat.
pub(crate) fn ensure_wgs84(document: &Value) -> Result<(), PipelineError> {
    let Some(crs) = document.get("crs") else {
        return Ok(());
    };
    let name = crs
        .get("properties")
        .and_then(|properties| properties.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    if name.contains("4326") || name.contains("CRS84") {
        return Ok(());
    }
    Err(PipelineError::malformed(format!(
        "unsupported coordinate reference system {name:?}; expected EPSG:4326"
    )))
}

fn feature_multi_polygon(feature: &Value) -> Result<MultiPolygon<f64>, String> {
    let raw = match feature.get("geometry") {
        Some(Value::Null) | None => return Err("feature has no geometry".to_string()),
        Some(raw) => raw.clone(),
    };
    let geometry: geojson::Geometry =
        serde_json::from_value(raw).map_err(|err| format!("invalid geometry: {err}"))?;
    let geometry = geo::Geometry::<f64>::try_from(geometry)
        .map_err(|err| format!("unconvertible geometry: {err}"))?;

    let multi_polygon = match geometry {
        geo::Geometry::Polygon(polygon) => MultiPolygon::new(vec![polygon]),
        geo::Geometry::MultiPolygon(multi_polygon) => multi_polygon,
        other => return Err(format!("unsupported geometry type {}", geometry_type(&other))),
    };

    validate_multi_polygon(&multi_polygon)?;
    Ok(multi_polygon)
}

pub(crate) fn validate_multi_polygon(multi_polygon: &MultiPolygon<f64>) -> Result<(), String> {
    if multi_polygon.0.is_empty() {
        return Err("empty multipolygon".to_string());
    }
    for polygon in &multi_polygon.0 {
        validate_polygon(polygon)?;
    }
    Ok(())
}

fn validate_polygon(polygon: &Polygon<f64>) -> Result<(), String> {
    let exterior = polygon.exterior();
    if exterior.0.len() < 4 {
        return Err(format!(
            "exterior ring has {} positions, need at least 4",
            exterior.0.len()
        ));
    }
    for ring in std::iter::once(exterior).chain(polygon.interiors()) {
        if let Some(coord) = ring.0.iter().find(|coord| !is_wgs84_coord(coord)) {
            return Err(format!(
                "coordinate ({}, {}) is outside EPSG:4326 bounds",
                coord.x, coord.y
            ));
        }
    }
    Ok(())
}

pub(crate) fn is_wgs84_coord(coord: &Coord<f64>) -> bool {
    coord.x.is_finite()
        && coord.y.is_finite()
        && (-180.0..=180.0).contains(&coord.x)
        && (-90.0..=90.0).contains(&coord.y)
}

fn geometry_type(geometry: &geo::Geometry<f64>) -> &'static str {
    match geometry {
        geo::Geometry::Point(_) => "Point",
        geo::Geometry::Line(_) => "Line",
        geo::Geometry::LineString(_) => "LineString",
        geo::Geometry::Polygon(_) => "Polygon",
        geo::Geometry::MultiPoint(_) => "MultiPoint",
        geo::Geometry::MultiLineString(_) => "MultiLineString",
        geo::Geometry::MultiPolygon(_) => "MultiPolygon",
        geo::Geometry::GeometryCollection(_) => "GeometryCollection",
        geo::Geometry::Rect(_) => "Rect",
        geo::Geometry::Triangle(_) => "Triangle",
    }
}

pub(crate) fn first_text_property(
    properties: Option<&Map<String, Value>>,
    keys: &[&str],
) -> Option<String> {
    let properties = properties?;
    keys.iter().find_map(|key| match properties.get(*key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}
