use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    MalformedInput,
    StoreUnavailable,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::MalformedInput => "malformed_input",
            Self::StoreUnavailable => "store_unavailable",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Boundaries,
    Indicator,
    Points,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boundaries => "boundaries",
            Self::Indicator => "indicator",
            Self::Points => "points",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageName,
    pub status: StageStatus,
    pub error_kind: Option<ErrorKind>,
    pub reason: Option<String>,
    pub counts: StageCounts,
}

impl StageOutcome {
    pub fn succeeded(stage: StageName, counts: StageCounts) -> Self {
        Self {
            stage,
            status: StageStatus::Succeeded,
            error_kind: None,
            reason: None,
            counts,
        }
    }

    pub fn skipped(stage: StageName, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            error_kind: None,
            reason: Some(reason.into()),
            counts: StageCounts::default(),
        }
    }

    pub fn failed(stage: StageName, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            error_kind: Some(kind),
            reason: Some(reason.into()),
            counts: StageCounts::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub stage: StageName,
    pub location: String,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestPaths {
    pub cache_root: String,
    pub manifest_dir: String,
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub command: String,
    pub paths: IngestPaths,
    pub stages: Vec<StageOutcome>,
    pub sources: Vec<SourceEntry>,
    pub notes: Vec<String>,
}
