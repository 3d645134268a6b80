//! Bootstrap report: per-step outcomes, completion marker, status table

use crate::config::{Config, FailurePolicy};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use hostboot_common::{Step, StepStatus};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: Step,
    pub status: StepStatus,
    pub message: String,
    pub duration_ms: u64,
}

/// Everything an operator needs to judge a bootstrap after the fact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub image: String,
    pub container_name: String,
    pub proxy_enabled: bool,
    pub failure_policy: FailurePolicy,
    pub steps: Vec<StepOutcome>,
    /// Error that aborted the run, if any
    pub error: Option<String>,
}

impl BootstrapReport {
    pub fn new(config: &Config, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            image: config.image_reference(),
            container_name: config.container_name.clone(),
            proxy_enabled: config.enable_proxy,
            failure_policy: config.failure_policy,
            steps: Vec::new(),
            error: None,
        }
    }

    pub fn record(&mut self, step: Step, status: StepStatus, message: impl Into<String>, duration: Duration) {
        self.steps.push(StepOutcome {
            step,
            status,
            message: message.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
    }

    pub fn outcome(&self, step: Step) -> Option<&StepOutcome> {
        self.steps.iter().find(|o| o.step == step)
    }

    pub fn status_of(&self, step: Step) -> Option<StepStatus> {
        self.outcome(step).map(|o| o.status)
    }

    /// Fatal-class steps that failed
    pub fn fatal_failures(&self) -> Vec<Step> {
        self.steps
            .iter()
            .filter(|o| o.status.is_failed() && o.step.is_fatal())
            .map(|o| o.step)
            .collect()
    }

    /// True if no fatal-class step failed and the run was not aborted
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.fatal_failures().is_empty()
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, error: Option<String>) {
        self.finished_at = Some(finished_at);
        self.error = error;
    }

    /// Human-readable completion marker
    pub fn completion_marker(&self) -> String {
        let mut out = String::new();
        let verdict = if self.succeeded() {
            "Bootstrap completed successfully"
        } else {
            "Bootstrap completed with failures"
        };
        let _ = writeln!(out, "{verdict}");
        let _ = writeln!(out, "Started:   {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "Finished:  {}", finished.to_rfc3339());
        }
        let _ = writeln!(out, "Image:     {}", self.image);
        let _ = writeln!(out, "Container: {}", self.container_name);
        let _ = writeln!(out, "Policy:    {}", self.failure_policy);
        let _ = writeln!(out);
        for outcome in &self.steps {
            let _ = writeln!(
                out,
                "[{:>7}] {:<15} {}",
                outcome.status.to_string(),
                outcome.step.to_string(),
                outcome.message
            );
        }
        if let Some(error) = &self.error {
            let _ = writeln!(out);
            let _ = writeln!(out, "Aborted: {error}");
        }
        out
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize bootstrap report")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read report: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse report: {}", path.display()))
    }

    /// Per-step status table
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Step", "Status", "Duration", "Message"]);

        for outcome in &self.steps {
            let color = match outcome.status {
                StepStatus::Ok => Color::Green,
                StepStatus::Failed => Color::Red,
                StepStatus::Skipped => Color::DarkGrey,
            };
            table.add_row(vec![
                Cell::new(outcome.step),
                Cell::new(outcome.status).fg(color),
                Cell::new(format!("{:.1}s", outcome.duration_ms as f64 / 1000.0)),
                Cell::new(&outcome.message),
            ]);
        }
        table
    }
}
