use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "0.1.0";

pub fn open_store(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection)?;
    ensure_schema(&connection)?;
    Ok(connection)
}

pub fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS regions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              code TEXT NOT NULL UNIQUE,
              geom_geojson TEXT NOT NULL,
              srid INTEGER NOT NULL DEFAULT 4326,
              min_x REAL NOT NULL,
              min_y REAL NOT NULL,
              max_x REAL NOT NULL,
              max_y REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS indicator_facts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              region_id INTEGER NOT NULL,
              indicator TEXT NOT NULL,
              year INTEGER NOT NULL,
              value REAL NOT NULL CHECK (value >= 0),
              captured_at TEXT NOT NULL,
              FOREIGN KEY(region_id) REFERENCES regions(id)
            );

            CREATE TABLE IF NOT EXISTS infrastructure_projects (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              type TEXT NOT NULL,
              status TEXT NOT NULL,
              cost REAL NOT NULL CHECK (cost >= 0),
              lon REAL NOT NULL,
              lat REAL NOT NULL,
              location_geojson TEXT NOT NULL,
              region_id INTEGER,
              FOREIGN KEY(region_id) REFERENCES regions(id)
            );
            ",
        )
        .context("failed to create core tables")?;

    connection
        .execute(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS regions_rtree
            USING rtree(id, min_x, max_x, min_y, max_y)
            ",
            [],
        )
        .context("failed to initialize R*Tree table regions_rtree")?;

    connection.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_indicator_facts_lookup ON indicator_facts(indicator, year, region_id);
        CREATE INDEX IF NOT EXISTS idx_indicator_facts_region ON indicator_facts(region_id);
        CREATE INDEX IF NOT EXISTS idx_infrastructure_region ON infrastructure_projects(region_id);
        CREATE INDEX IF NOT EXISTS idx_infrastructure_type ON infrastructure_projects(type);
        ",
    )?;

    set_metadata(connection, "db_schema_version", DB_SCHEMA_VERSION)?;
    set_metadata(connection, "db_updated_at", &now_utc_string())?;

    Ok(())
}

pub fn set_metadata(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            [key, value],
        )
        .with_context(|| format!("failed to write metadata key {key}"))?;
    Ok(())
}

pub fn get_metadata(connection: &Connection, key: &str) -> Result<Option<String>> {
    let value = connection
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("failed to read metadata key {key}"))?;
    Ok(value)
}

pub fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to count rows: {sql}"))?;
    Ok(count)
}
