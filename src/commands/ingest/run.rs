use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rusqlite::Connection;
use tracing::{info, warn};

use super::db_setup::{DB_SCHEMA_VERSION, open_store, set_metadata};
use super::error::{CancelFlag, PipelineError};
use super::fetch::{FetchConfig, Fetcher, SourceLocation};
use super::pipeline::{
    IndicatorSourceConfig, PipelineConfig, PipelineRun, PointSource, run_pipeline,
    store_unavailable_run,
};
use super::tabular::{EntryPredicate, TableSchema};
use crate::cli::IngestArgs;
use crate::model::{IngestPaths, IngestRunManifest, StageStatus};
use crate::util::{ensure_directory, write_json_pretty};

pub fn run(args: IngestArgs) -> Result<()> {
    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join("geoconsole.sqlite"));

    let config = pipeline_config(&args)?;
    ensure_directory(&config.scratch_root)?;
    let fetcher = Fetcher::new(FetchConfig {
        timeout: Duration::from_secs(args.fetch_timeout_secs),
        max_attempts: args.fetch_attempts,
        initial_backoff: Duration::from_millis(args.fetch_backoff_ms),
    })?;

    let seed = args.seed.unwrap_or_else(rand::random);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        warn!("interrupt received, stopping after the current row");
        handler_flag.cancel();
    }) {
        warn!(error = %err, "failed to install interrupt handler");
    }

    info!(
        cache_root = %cache_root.display(),
        db_path = %db_path.display(),
        seed,
        "starting ingest"
    );

    let pipeline_run = match open_store(&db_path) {
        Ok(mut connection) => {
            let pipeline_run =
                run_pipeline(&mut connection, &fetcher, &config, &mut rng, &cancel);
            if let Err(err) = record_last_run(&connection, &pipeline_run) {
                warn!(error = %err, "failed to record last run in metadata");
            }
            pipeline_run
        }
        Err(err) => store_unavailable_run(&config, PipelineError::StoreUnavailable(err)),
    };

    let manifest_path = args.run_manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!("ingest_{}.json", pipeline_run.run_id))
    });
    let manifest = build_manifest(&args, &pipeline_run, &cache_root, &manifest_dir, &db_path, seed);
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote ingest run manifest");

    if pipeline_run.exit_code() != 0 {
        let failed = pipeline_run
            .stages
            .iter()
            .filter(|stage| stage.status == StageStatus::Failed)
            .map(|stage| stage.stage.as_str())
            .collect::<Vec<_>>();
        bail!(
            "ingest run {} failed in stage(s): {}",
            pipeline_run.run_id,
            failed.join(", ")
        );
    }

    info!(run_id = %pipeline_run.run_id, "ingest completed");
    Ok(())
}

fn pipeline_config(args: &IngestArgs) -> Result<PipelineConfig> {
    let indicator = if args.skip_indicator {
        None
    } else {
        Some(IndicatorSourceConfig {
            location: SourceLocation::parse(&args.indicator_source),
            indicator_code: args.indicator_code.clone(),
            entry: EntryPredicate::new(
                &args.indicator_entry_pattern,
                Some(&args.indicator_entry_exclude),
            )
            .context("invalid --indicator-entry-pattern")?,
            schema: TableSchema {
                year_column: args.year_column.clone(),
                value_column: args.value_column.clone(),
            },
            mode: args.indicator_mode,
        })
    };

    let points = if args.skip_points {
        None
    } else if args.demo_points {
        Some(PointSource::Demo)
    } else {
        Some(PointSource::Remote {
            location: SourceLocation::parse(&args.point_source),
            sample_size: args.sample_size,
        })
    };

    let layer_hint = args.boundary_layer.trim();
    Ok(PipelineConfig {
        boundary_source: SourceLocation::parse(&args.boundary_source),
        boundary_layer_hint: (!layer_hint.is_empty()).then(|| layer_hint.to_string()),
        scratch_root: args.cache_root.join("scratch"),
        indicator,
        points,
        project_type: args.project_type.clone(),
        project_status: args.project_status.clone(),
    })
}

fn record_last_run(connection: &Connection, pipeline_run: &PipelineRun) -> Result<()> {
    set_metadata(connection, "last_run_id", &pipeline_run.run_id)?;
    set_metadata(connection, "last_run_status", pipeline_run.status_label())
}

fn build_manifest(
    args: &IngestArgs,
    pipeline_run: &PipelineRun,
    cache_root: &Path,
    manifest_dir: &Path,
    db_path: &Path,
    seed: u64,
) -> IngestRunManifest {
    IngestRunManifest {
        manifest_version: 1,
        run_id: pipeline_run.run_id.clone(),
        db_schema_version: DB_SCHEMA_VERSION.to_string(),
        status: pipeline_run.status_label().to_string(),
        started_at: pipeline_run.started_at.clone(),
        finished_at: pipeline_run.finished_at.clone(),
        command: render_ingest_command(args),
        paths: IngestPaths {
            cache_root: cache_root.display().to_string(),
            manifest_dir: manifest_dir.display().to_string(),
            db_path: db_path.display().to_string(),
        },
        stages: pipeline_run.stages.clone(),
        sources: pipeline_run.sources.clone(),
        notes: vec![
            format!("Synthetic values drawn from ChaCha8 seed {seed}."),
            "Regional indicator values split the national total evenly with up to ±10% perturbation; they are not measured regional data."
                .to_string(),
        ],
    }
}

fn render_ingest_command(args: &IngestArgs) -> String {
    let mut command = vec![
        "geoconsole ingest".to_string(),
        format!("--cache-root {}", args.cache_root.display()),
        format!("--boundary-source {}", args.boundary_source),
        format!("--indicator-mode {}", args.indicator_mode.as_str()),
    ];
    if let Some(db_path) = &args.db_path {
        command.push(format!("--db-path {}", db_path.display()));
    }
    if args.skip_indicator {
        command.push("--skip-indicator".to_string());
    } else {
        command.push(format!("--indicator-source {}", args.indicator_source));
    }
    if args.skip_points {
        command.push("--skip-points".to_string());
    } else if args.demo_points {
        command.push("--demo-points".to_string());
    } else {
        command.push(format!("--point-source {}", args.point_source));
        command.push(format!("--sample-size {}", args.sample_size));
    }
    if let Some(seed) = args.seed {
        command.push(format!("--seed {seed}"));
    }
    command.join(" ")
}
