use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::ingest::{count_rows, get_metadata};

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("geoconsole.sqlite"));

    info!(cache_root = %args.cache_root.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    let regions = count_rows(&conn, "SELECT COUNT(*) FROM regions").unwrap_or(0);
    let facts = count_rows(&conn, "SELECT COUNT(*) FROM indicator_facts").unwrap_or(0);
    let fact_years =
        count_rows(&conn, "SELECT COUNT(DISTINCT year) FROM indicator_facts").unwrap_or(0);
    let projects = count_rows(&conn, "SELECT COUNT(*) FROM infrastructure_projects").unwrap_or(0);
    let unassigned = count_rows(
        &conn,
        "SELECT COUNT(*) FROM infrastructure_projects WHERE region_id IS NULL",
    )
    .unwrap_or(0);

    info!(
        path = %db_path.display(),
        regions,
        indicator_facts = facts,
        indicator_years = fact_years,
        projects,
        unassigned_projects = unassigned,
        "database status"
    );

    let schema_version = get_metadata(&conn, "db_schema_version").unwrap_or_default();
    let last_run_id = get_metadata(&conn, "last_run_id").unwrap_or_default();
    let last_run_status = get_metadata(&conn, "last_run_status").unwrap_or_default();
    match last_run_id {
        Some(run_id) => info!(
            schema_version = %schema_version.unwrap_or_default(),
            run_id = %run_id,
            status = %last_run_status.unwrap_or_default(),
            "last ingest run"
        ),
        None => warn!("no ingest run recorded"),
    }

    Ok(())
}
