use std::path::PathBuf;

use chrono::Utc;
use rand::Rng;
use rusqlite::Connection;
use tracing::{error, info, warn};

use super::error::{CancelFlag, PipelineError};
use super::fetch::{Fetcher, SourceLocation};
use super::geometry::decode_boundaries;
use super::indicators::{IndicatorLoad, load_indicator_facts};
use super::infrastructure::{
    ImportDefaults, decode_point_features, import_points, synthesize_demo_points,
};
use super::regions::{RegionCatalog, load_regions};
use super::tabular::{EntryPredicate, TableSchema, extract_year_values};
use crate::cli::IndicatorMode;
use crate::model::{ErrorKind, SourceEntry, StageCounts, StageName, StageOutcome, StageStatus};
use crate::util::{now_utc_string, utc_compact_string};

#[derive(Debug, Clone)]
pub struct IndicatorSourceConfig {
    pub location: SourceLocation,
    pub indicator_code: String,
    pub entry: EntryPredicate,
    pub schema: TableSchema,
    pub mode: IndicatorMode,
}

#[derive(Debug, Clone)]
pub enum PointSource {
    Demo,
    Remote {
        location: SourceLocation,
        sample_size: usize,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub boundary_source: SourceLocation,
    pub boundary_layer_hint: Option<String>,
    pub scratch_root: PathBuf,
    pub indicator: Option<IndicatorSourceConfig>,
    pub points: Option<PointSource>,
    pub project_type: String,
    pub project_status: String,
}

#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<StageOutcome>,
    pub sources: Vec<SourceEntry>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.stages
            .iter()
            .all(|stage| stage.status != StageStatus::Failed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    pub fn status_label(&self) -> &'static str {
        if self.succeeded() {
            "completed"
        } else {
            "failed"
        }
    }

    pub fn stage(&self, name: StageName) -> Option<&StageOutcome> {
        self.stages.iter().find(|stage| stage.stage == name)
    }
}

struct StageContext<'a, R: Rng + ?Sized> {
    connection: &'a mut Connection,
    fetcher: &'a Fetcher,
    rng: &'a mut R,
    cancel: &'a CancelFlag,
    sources: Vec<SourceEntry>,
}

impl<R: Rng + ?Sized> StageContext<'_, R> {
    fn fetch(&mut self, stage: StageName, location: &SourceLocation) -> Result<Vec<u8>, PipelineError> {
        let fetched = self.fetcher.fetch(location, self.cancel)?;
        self.sources.push(SourceEntry {
            stage,
            location: location.to_string(),
            bytes: fetched.bytes.len(),
            sha256: fetched.sha256,
        });
        Ok(fetched.bytes)
    }
}

/// Runs boundaries first; the indicator and point stages both need the
/// resulting catalog and are skipped when it is unavailable.
pub fn run_pipeline<R: Rng + ?Sized>(
    connection: &mut Connection,
    fetcher: &Fetcher,
    config: &PipelineConfig,
    rng: &mut R,
    cancel: &CancelFlag,
) -> PipelineRun {
    let (run_id, started_at) = new_run_id();
    info!(run_id = %run_id, "starting ingestion pipeline");

    let mut ctx = StageContext {
        connection,
        fetcher,
        rng,
        cancel,
        sources: Vec::new(),
    };
    let mut stages = Vec::new();

    let catalog = match guarded(cancel, || run_boundaries(&mut ctx, config)) {
        Ok((catalog, counts)) => {
            stages.push(StageOutcome::succeeded(StageName::Boundaries, counts));
            Some(catalog)
        }
        Err(err) => {
            stages.push(failed_outcome(StageName::Boundaries, &err));
            None
        }
    };

    match (&config.indicator, &catalog) {
        (None, _) => stages.push(StageOutcome::skipped(StageName::Indicator, "disabled")),
        (Some(_), None) => stages.push(skipped_for_dependency(StageName::Indicator)),
        (Some(_), Some(_)) if cancel_recorded(&stages) => {
            stages.push(StageOutcome::skipped(StageName::Indicator, "run cancelled"))
        }
        (Some(indicator), Some(catalog)) => {
            let outcome = match guarded(cancel, || run_indicator(&mut ctx, indicator, catalog)) {
                Ok(counts) if counts.inserted == 0 && catalog.is_empty() => {
                    StageOutcome::skipped(StageName::Indicator, "region catalog is empty")
                }
                Ok(counts) => StageOutcome::succeeded(StageName::Indicator, counts),
                Err(err) => failed_outcome(StageName::Indicator, &err),
            };
            stages.push(outcome);
        }
    }

    match (&config.points, &catalog) {
        (None, _) => stages.push(StageOutcome::skipped(StageName::Points, "disabled")),
        (Some(_), None) => stages.push(skipped_for_dependency(StageName::Points)),
        (Some(_), Some(_)) if cancel_recorded(&stages) => {
            stages.push(StageOutcome::skipped(StageName::Points, "run cancelled"))
        }
        (Some(points), Some(catalog)) => {
            let outcome = match guarded(cancel, || run_points(&mut ctx, config, points, catalog)) {
                Ok(counts) => StageOutcome::succeeded(StageName::Points, counts),
                Err(err) => failed_outcome(StageName::Points, &err),
            };
            stages.push(outcome);
        }
    }

    let run = PipelineRun {
        run_id,
        started_at,
        finished_at: now_utc_string(),
        stages,
        sources: ctx.sources,
    };

    for stage in &run.stages {
        info!(
            stage = stage.stage.as_str(),
            status = ?stage.status,
            inserted = stage.counts.inserted,
            updated = stage.counts.updated,
            skipped = stage.counts.skipped,
            dropped_rows = stage.counts.dropped_rows,
            "stage summary"
        );
    }
    info!(run_id = %run.run_id, status = run.status_label(), "ingestion pipeline finished");

    run
}

fn new_run_id() -> (String, String) {
    (
        format!("run-{}", utc_compact_string(Utc::now())),
        now_utc_string(),
    )
}

/// Run report for an ingest whose store could not be opened: boundaries fail
/// with `err` and every enabled dependent stage is skipped.
pub fn store_unavailable_run(config: &PipelineConfig, err: PipelineError) -> PipelineRun {
    let (run_id, started_at) = new_run_id();
    let mut stages = vec![failed_outcome(StageName::Boundaries, &err)];
    for (stage, enabled) in [
        (StageName::Indicator, config.indicator.is_some()),
        (StageName::Points, config.points.is_some()),
    ] {
        stages.push(if enabled {
            skipped_for_dependency(stage)
        } else {
            StageOutcome::skipped(stage, "disabled")
        });
    }

    PipelineRun {
        run_id,
        started_at,
        finished_at: now_utc_string(),
        stages,
        sources: Vec::new(),
    }
}

fn guarded<T>(
    cancel: &CancelFlag,
    stage: impl FnOnce() -> Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    cancel.check()?;
    stage()
}

// Only the stage that observed the interrupt is failed; later ones are skipped.
fn cancel_recorded(stages: &[StageOutcome]) -> bool {
    stages
        .iter()
        .any(|stage| stage.error_kind == Some(ErrorKind::Cancelled))
}

fn failed_outcome(stage: StageName, err: &PipelineError) -> StageOutcome {
    error!(
        stage = stage.as_str(),
        kind = err.kind().as_str(),
        error = %err,
        "stage failed"
    );
    StageOutcome::failed(stage, err.kind(), err.to_string())
}

fn skipped_for_dependency(stage: StageName) -> StageOutcome {
    warn!(stage = stage.as_str(), "skipping stage, region catalog unavailable");
    StageOutcome::skipped(stage, "region catalog unavailable")
}

fn run_boundaries<R: Rng + ?Sized>(
    ctx: &mut StageContext<'_, R>,
    config: &PipelineConfig,
) -> Result<(RegionCatalog, StageCounts), PipelineError> {
    let bytes = ctx.fetch(StageName::Boundaries, &config.boundary_source)?;
    let decoded = decode_boundaries(
        &bytes,
        config.boundary_layer_hint.as_deref(),
        &config.scratch_root,
    )?;
    ctx.cancel.check()?;

    let report = load_regions(ctx.connection, &decoded.features)?;
    let mut counts = report.counts;
    counts.skipped += decoded.skipped_features;
    Ok((report.catalog, counts))
}

fn run_indicator<R: Rng + ?Sized>(
    ctx: &mut StageContext<'_, R>,
    indicator: &IndicatorSourceConfig,
    catalog: &RegionCatalog,
) -> Result<StageCounts, PipelineError> {
    let bytes = ctx.fetch(StageName::Indicator, &indicator.location)?;
    let table = extract_year_values(&bytes, &indicator.entry, &indicator.schema)?;
    ctx.cancel.check()?;

    let load = IndicatorLoad {
        indicator: &indicator.indicator_code,
        rows: &table.rows,
        mode: indicator.mode,
    };
    let report = load_indicator_facts(ctx.connection, catalog, &load, ctx.rng, ctx.cancel)?;
    let mut counts = report.counts;
    counts.dropped_rows = table.dropped_rows;
    Ok(counts)
}

fn run_points<R: Rng + ?Sized>(
    ctx: &mut StageContext<'_, R>,
    config: &PipelineConfig,
    source: &PointSource,
    catalog: &RegionCatalog,
) -> Result<StageCounts, PipelineError> {
    let (features, skipped) = match source {
        PointSource::Demo => (synthesize_demo_points(catalog, ctx.rng)?, 0),
        PointSource::Remote {
            location,
            sample_size,
        } => {
            let bytes = ctx.fetch(StageName::Points, location)?;
            let decoded = decode_point_features(&bytes, *sample_size)?;
            (decoded.features, decoded.skipped_features)
        }
    };
    ctx.cancel.check()?;

    let defaults = ImportDefaults {
        project_type: &config.project_type,
        status: &config.project_status,
    };
    let report = import_points(ctx.connection, catalog, &features, &defaults, ctx.rng)?;
    let mut counts = report.counts;
    counts.skipped += skipped;
    Ok(counts)
}
