//! Bead source adapters.
//!
//! The bead tracker itself is external; the daemon only polls for ready
//! beads and pushes status transitions back. [`CliBeadSource`] shells out
//! to the configured tracker CLI; [`StaticBeadSource`] backs tests and
//! offline runs.

use coven_core::{Bead, BeadStatus};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BeadSourceError {
    #[error("failed to run bead command: {0}")]
    Exec(#[from] std::io::Error),
    #[error("bead command failed: {0}")]
    CommandFailed(String),
    #[error("bead list output is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BeadSourceError>;

/// Contract with the external bead tracker.
pub trait BeadSource: Send + Sync {
    /// Beads ready for a workflow (status `open`).
    fn list_ready(&self) -> Result<Vec<Bead>>;

    /// Push a status transition back to the tracker.
    fn update_status(&self, bead_id: &str, status: BeadStatus) -> Result<()>;
}

/// Bead source backed by a tracker CLI.
///
/// Expects `<cmd> list --ready --json` to print a JSON array of beads
/// (or `{"beads": [...]}`), and `<cmd> update <id> --status <status>`.
#[derive(Debug)]
pub struct CliBeadSource {
    command: String,
    cwd: PathBuf,
}

impl CliBeadSource {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.command)
            .args(args)
            .current_dir(&self.cwd)
            .output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BeadSourceError::CommandFailed(format!(
                "{} {}: {}",
                self.command,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl BeadSource for CliBeadSource {
    fn list_ready(&self) -> Result<Vec<Bead>> {
        let stdout = self.run(&["list", "--ready", "--json"])?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }

        // Either a bare array or an object with a `beads` field.
        let value: serde_json::Value = serde_json::from_str(trimmed)?;
        let beads_value = match value {
            serde_json::Value::Array(_) => value,
            serde_json::Value::Object(mut obj) => {
                obj.remove("beads").unwrap_or(serde_json::Value::Array(Vec::new()))
            }
            _ => serde_json::Value::Array(Vec::new()),
        };
        let beads: Vec<Bead> = serde_json::from_value(beads_value)?;
        debug!(count = beads.len(), "bead source poll");
        Ok(beads)
    }

    fn update_status(&self, bead_id: &str, status: BeadStatus) -> Result<()> {
        self.run(&["update", bead_id, "--status", status.as_str()])?;
        Ok(())
    }
}

/// In-memory bead source for tests and detached operation.
#[derive(Debug, Default)]
pub struct StaticBeadSource {
    beads: Mutex<Vec<Bead>>,
}

impl StaticBeadSource {
    pub fn new(beads: Vec<Bead>) -> Self {
        Self {
            beads: Mutex::new(beads),
        }
    }

    pub fn set_beads(&self, beads: Vec<Bead>) {
        *self.lock() = beads;
    }

    pub fn all(&self) -> Vec<Bead> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Bead>> {
        match self.beads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BeadSource for StaticBeadSource {
    fn list_ready(&self) -> Result<Vec<Bead>> {
        Ok(self
            .lock()
            .iter()
            .filter(|b| b.status == BeadStatus::Open)
            .cloned()
            .collect())
    }

    fn update_status(&self, bead_id: &str, status: BeadStatus) -> Result<()> {
        let mut beads = self.lock();
        if let Some(bead) = beads.iter_mut().find(|b| b.id == bead_id) {
            bead.status = status;
        }
        Ok(())
    }
}
