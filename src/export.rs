//! Plain structured view of a run for presentation layers.
//!
//! Renderers (text, Markdown, HTML) consume [`RunExport`]; nothing here
//! produces markup.

use crate::model::{ParamMode, Run, RunStatus};
use serde::Serialize;
use time::OffsetDateTime;

const STDERR_HEADING: &str = "Errors/Warnings:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunExport {
    pub id: String,
    pub script_name: String,
    pub mode: ParamMode,
    pub parameters: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: i64,
    pub status: RunStatus,
    pub status_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    /// stdout followed by stderr under a heading, or a placeholder when the
    /// run produced no output at all.
    pub text: String,
}

pub fn export(run: &Run) -> RunExport {
    RunExport {
        id: run.id.clone(),
        script_name: run.script_name.clone(),
        mode: run.mode,
        parameters: run.parameters.clone(),
        started_at: run.started_at,
        finished_at: run.finished_at,
        duration_ms: run.duration_ms,
        status: run.status,
        status_label: status_label(run),
        exit_code: run.exit_code,
        stdout: run.stdout.clone(),
        stderr: run.stderr.clone(),
        truncated: run.stdout_truncated || run.stderr_truncated,
        text: combined_output(run),
    }
}

pub fn status_label(run: &Run) -> String {
    match (run.status, run.exit_code) {
        (RunStatus::Succeeded, _) => "Succeeded".to_string(),
        (RunStatus::Failed, Some(code)) => format!("Failed (exit code {code})"),
        (RunStatus::Failed, None) => "Failed".to_string(),
        (RunStatus::TimedOut, _) => "Timed out".to_string(),
        (RunStatus::Cancelled, _) => "Cancelled".to_string(),
    }
}

pub fn combined_output(run: &Run) -> String {
    let stdout = run.stdout.trim_end();
    let stderr = run.stderr.trim_end();

    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => format!("(no output; {})", status_label(run).to_lowercase()),
        (false, true) => stdout.to_string(),
        (true, false) => format!("{STDERR_HEADING}\n{stderr}"),
        (false, false) => format!("{stdout}\n\n{STDERR_HEADING}\n{stderr}"),
    }
}
