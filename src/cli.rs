use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

pub const DEFAULT_BOUNDARY_SOURCE: &str = "https://data.humdata.org/dataset/3d17274d-0812-4b21-b87a-4854af4eb244/resource/34f317e5-7de9-4e1b-a457-91ab786dc952/download/dza_admbnda_unhcr2020_shp.zip";
pub const DEFAULT_INDICATOR_SOURCE: &str =
    "https://api.worldbank.org/v2/country/DZ/indicator/NY.GDP.MKTP.CD?downloadformat=csv";
pub const DEFAULT_POINT_SOURCE: &str = "https://data.humdata.org/dataset/1acd7dfd-d797-4922-b0f5-82db92440e30/resource/46e3367d-53f5-41a6-9aa4-4e5df3c5ce40/download/algeria.geojson";

#[derive(Parser, Debug)]
#[command(
    name = "geoconsole",
    version,
    about = "Open geodata ingestion for the strategic console store"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Ingest(IngestArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    #[arg(long, env = "GEOCONSOLE_CACHE_ROOT", default_value = ".cache/geoconsole")]
    pub cache_root: PathBuf,

    #[arg(long, env = "GEOCONSOLE_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub run_manifest_path: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_BOUNDARY_SOURCE)]
    pub boundary_source: String,

    #[arg(long, default_value = "adm1")]
    pub boundary_layer: String,

    #[arg(long, default_value = DEFAULT_INDICATOR_SOURCE)]
    pub indicator_source: String,

    #[arg(long, default_value = "NY.GDP.MKTP.CD")]
    pub indicator_code: String,

    #[arg(long, default_value = r"^API_.*\.csv$")]
    pub indicator_entry_pattern: String,

    #[arg(long, default_value = "Metadata")]
    pub indicator_entry_exclude: String,

    #[arg(long, default_value = "Year")]
    pub year_column: String,

    #[arg(long, default_value = "Value")]
    pub value_column: String,

    #[arg(long, value_enum, default_value_t = IndicatorMode::Replace)]
    pub indicator_mode: IndicatorMode,

    #[arg(long, default_value = DEFAULT_POINT_SOURCE)]
    pub point_source: String,

    #[arg(long, default_value_t = false)]
    pub demo_points: bool,

    #[arg(long, default_value_t = 10)]
    pub sample_size: usize,

    #[arg(long, default_value = "health")]
    pub project_type: String,

    #[arg(long, default_value = "active")]
    pub project_status: String,

    #[arg(long, default_value_t = false)]
    pub skip_indicator: bool,

    #[arg(long, default_value_t = false)]
    pub skip_points: bool,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, default_value_t = 60)]
    pub fetch_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub fetch_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub fetch_backoff_ms: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum IndicatorMode {
    Append,
    Replace,
}

impl IndicatorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Replace => "replace",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, env = "GEOCONSOLE_CACHE_ROOT", default_value = ".cache/geoconsole")]
    pub cache_root: PathBuf,

    #[arg(long, env = "GEOCONSOLE_DB_PATH")]
    pub db_path: Option<PathBuf>,
}
