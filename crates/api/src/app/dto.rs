use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use locate_inference::{LocationPrediction, PredictionOutcome};
use locate_infra::jobs::{BatchImport, JobView, RejectedPath};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub file_path: PathBuf,
    pub filename: Option<String>,
    pub top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BatchJobsRequest {
    pub paths: Vec<PathBuf>,
    pub top_k: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct InferItem {
    pub path: PathBuf,
    pub md5: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InferRequest {
    pub items: Vec<InferItem>,
    pub top_k: Option<u32>,
    #[serde(default)]
    pub skip_missing: bool,
    #[serde(default)]
    pub fail_fast: bool,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct BatchJobsResponse {
    pub created: Vec<JobView>,
    pub rejected: Vec<RejectedPath>,
}

impl From<BatchImport> for BatchJobsResponse {
    fn from(import: BatchImport) -> Self {
        Self {
            created: import.created.iter().map(|j| j.view()).collect(),
            rejected: import.rejected,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InferItemResult {
    pub index: usize,
    pub path: PathBuf,
    pub md5: Option<String>,
    pub status: &'static str,
    pub predictions: Vec<LocationPrediction>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl From<PredictionOutcome> for InferItemResult {
    fn from(outcome: PredictionOutcome) -> Self {
        let record = outcome.record().clone();
        let mut result = Self {
            index: record.index,
            path: record.path,
            md5: record.md5,
            status: "success",
            predictions: Vec::new(),
            warnings: Vec::new(),
            error: None,
        };
        match outcome {
            PredictionOutcome::Success { predictions, .. } => result.predictions = predictions,
            PredictionOutcome::Skipped { warning, .. } => {
                result.status = "skipped";
                result.warnings.push(warning);
            }
            PredictionOutcome::Failed { error, .. } => {
                result.status = "failed";
                result.error = Some(error.public_message());
            }
        }
        result
    }
}

#[derive(Debug, Serialize)]
pub struct InferResponse {
    pub device: String,
    pub results: Vec<InferItemResult>,
}
