use crate::converter::Strategy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderReport {
    pub render_id: String,
    pub name: String,
    pub started: String,
    pub finished: String,
    /// Strategy that produced the document; `None` means passthrough.
    pub producer: Option<Strategy>,
    pub attempts: Vec<AttemptReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Ineligible,
    Unavailable,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptReport {
    pub strategy: Strategy,
    pub status: AttemptStatus,
    pub reason: Option<String>,
    pub elapsed_ms: u64,
}
