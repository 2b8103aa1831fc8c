//! Sub-national indicator facts.
//!
//! The source only publishes a national yearly total. Per-region values are
//! synthesized by splitting the total evenly across the catalog and adding a
//! uniform perturbation of up to ±10% of the even share. They are an
//! approximation for the map layer, not measured regional data.

use std::collections::BTreeSet;

use anyhow::Context;
use rand::Rng;
use rusqlite::{Connection, params};
use tracing::{info, warn};

use super::error::{CancelFlag, PipelineError, StageResultExt};
use super::regions::RegionCatalog;
use super::tabular::YearValue;
use crate::cli::IndicatorMode;
use crate::model::StageCounts;
use crate::util::now_utc_string;

pub const PERTURBATION_RATIO: f64 = 0.1;

/// Splits `national` evenly over `region_count` regions, perturbing each share
/// by a uniform offset in `[-10%, +10%]` of the even share.
pub fn synthesize_regional_values<R: Rng + ?Sized>(
    national: f64,
    region_count: usize,
    rng: &mut R,
) -> Vec<f64> {
    if region_count == 0 {
        return Vec::new();
    }

    let per_region = national / region_count as f64;
    (0..region_count)
        .map(|_| {
            let offset = rng.gen_range(-PERTURBATION_RATIO..=PERTURBATION_RATIO) * per_region;
            (per_region + offset).max(0.0)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct IndicatorLoad<'a> {
    pub indicator: &'a str,
    pub rows: &'a [YearValue],
    pub mode: IndicatorMode,
}

#[derive(Debug, Default)]
pub struct IndicatorReport {
    pub counts: StageCounts,
    pub years_loaded: usize,
    pub replaced_facts: usize,
}

pub fn load_indicator_facts<R: Rng + ?Sized>(
    connection: &mut Connection,
    catalog: &RegionCatalog,
    load: &IndicatorLoad<'_>,
    rng: &mut R,
    cancel: &CancelFlag,
) -> Result<IndicatorReport, PipelineError> {
    let mut report = IndicatorReport::default();
    if catalog.is_empty() {
        warn!(indicator = load.indicator, "no regions in catalog, skipping indicator distribution");
        report.counts.skipped = load.rows.len();
        return Ok(report);
    }

    let region_ids = catalog.ids().collect::<Vec<_>>();
    let captured_at = now_utc_string();
    let tx = connection
        .transaction()
        .context("failed to begin indicator transaction")
        .or_store_unavailable()?;

    {
        if load.mode == IndicatorMode::Replace {
            let years = load.rows.iter().map(|row| row.year).collect::<BTreeSet<_>>();
            let mut delete_statement = tx
                .prepare("DELETE FROM indicator_facts WHERE indicator = ?1 AND year = ?2")
                .or_store_unavailable()?;
            for year in years {
                report.replaced_facts += delete_statement
                    .execute(params![load.indicator, year])
                    .with_context(|| format!("failed to clear facts for {year}"))
                    .or_store_unavailable()?;
            }
        }

        let mut insert_statement = tx
            .prepare(
                "
                INSERT INTO indicator_facts(region_id, indicator, year, value, captured_at)
                VALUES(?1, ?2, ?3, ?4, ?5)
                ",
            )
            .or_store_unavailable()?;

        for row in load.rows {
            if row.value < 0.0 {
                warn!(year = row.year, value = row.value, "skipping negative national value");
                report.counts.skipped += 1;
                continue;
            }

            let values = synthesize_regional_values(row.value, region_ids.len(), rng);
            for (region_id, value) in region_ids.iter().zip(values) {
                // Dropping the uncommitted transaction rolls the stage back.
                cancel.check()?;
                insert_statement
                    .execute(params![region_id, load.indicator, row.year, value, captured_at])
                    .with_context(|| {
                        format!("failed to insert fact for region {region_id} year {}", row.year)
                    })
                    .or_store_unavailable()?;
                report.counts.inserted += 1;
            }
            report.years_loaded += 1;
        }
    }

    tx.commit()
        .context("failed to commit indicator transaction")
        .or_store_unavailable()?;

    info!(
        indicator = load.indicator,
        mode = load.mode.as_str(),
        years = report.years_loaded,
        regions = region_ids.len(),
        inserted = report.counts.inserted,
        replaced = report.replaced_facts,
        "indicator facts loaded"
    );

    Ok(report)
}
