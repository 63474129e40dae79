//! Session recorder: in-memory buffers flushed to delimited text at the end
//! of a session.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::command::{CommandVector, COMMAND_LEN};

/// Trailing calibration columns: maneuver, period, amplitude, instance, time
pub const CALIBRATION_TAIL_COLUMNS: usize = 5;

/// Positions of the trailing calibration columns, counted from the row end
pub const MANEUVER_FROM_END: usize = CALIBRATION_TAIL_COLUMNS;
pub const PERIOD_FROM_END: usize = CALIBRATION_TAIL_COLUMNS - 1;
pub const AMPLITUDE_FROM_END: usize = CALIBRATION_TAIL_COLUMNS - 2;
pub const INSTANCE_FROM_END: usize = CALIBRATION_TAIL_COLUMNS - 3;

/// Simulator maneuver codes, by index
pub const MANEUVERS: [&str; 29] = [
    "forward",
    "backward",
    "yaw_right",
    "yaw_left",
    "up",
    "down",
    "left_tilt",
    "right_tilt",
    "just_rest",
    "right",
    "left",
    "roll_up",
    "roll_down",
    "pitch_up",
    "pitch_down",
    "yaw_up",
    "yaw_down",
    "no_input",
    "just_right",
    "just_left",
    "just_up",
    "just_down",
    "up_right",
    "up_left",
    "down_right",
    "down_left",
    "fast",
    "slow",
    "straight",
];

pub const TIMESTAMP_FORMAT: &str = "%Y_%b_%d_%I_%M_%S%p";

pub const DIAGNOSTICS_FILE: &str = "control_debug.pkl";

pub fn timestamp(now: &DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Table name for a maneuver code; codes outside the table keep their number
pub fn maneuver_label(code: f64) -> String {
    if !code.is_finite() {
        return "unknown".to_string();
    }
    let idx = code as i64;
    usize::try_from(idx)
        .ok()
        .and_then(|i| MANEUVERS.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("maneuver_{idx}"))
}

/// Write through a sibling temp file so readers never see a partial file
fn write_atomically(path: &Path, header: &[String], rows: &[Vec<f64>]) -> Result<()> {
    let tmp = path.with_extension("txt.tmp");
    {
        let file = File::create(&tmp).context(format!("Failed to create {}", tmp.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "{}", header.join(","))?;
        for row in rows {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(out, "{}", line.join(","))?;
        }
        out.flush()
            .context(format!("Failed to write {}", tmp.display()))?;
    }
    fs::rename(&tmp, path).context(format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Value `from_end` columns before the end of `row`
fn tail(row: &[f64], from_end: usize) -> Option<f64> {
    row.len().checked_sub(from_end).map(|i| row[i])
}

/// One accepted acquisition frame
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionRecord {
    pub index: u64,
    pub input: Vec<f64>,
    pub calibration: Vec<f64>,
}

/// Raw input rows paired with simulator calibration rows
#[derive(Debug, Clone)]
pub struct AcquisitionRecorder {
    input_columns: Vec<String>,
    calibration_columns: Vec<String>,
    records: Vec<AcquisitionRecord>,
}

impl AcquisitionRecorder {
    pub fn new(input_columns: Vec<String>, calibration_columns: Vec<String>) -> Self {
        Self {
            input_columns,
            calibration_columns,
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, index: u64, input: Vec<f64>, calibration: Vec<f64>) {
        self.records.push(AcquisitionRecord {
            index,
            input,
            calibration,
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `<maneuver>_period_<p>_amplitude_<a>_inst_<i>`, from the last
    /// calibration row; `mixed` when the session saw several maneuvers
    pub fn file_label(&self) -> Option<String> {
        let last = &self.records.last()?.calibration;
        if last.len() < CALIBRATION_TAIL_COLUMNS {
            return None;
        }

        let maneuvers: BTreeSet<String> = self
            .records
            .iter()
            .filter_map(|r| tail(&r.calibration, MANEUVER_FROM_END))
            .map(maneuver_label)
            .collect();
        let maneuver = if maneuvers.len() == 1 {
            maneuver_label(tail(last, MANEUVER_FROM_END)?)
        } else {
            "mixed".to_string()
        };
        let period = tail(last, PERIOD_FROM_END)? as i64;
        let amplitude = (tail(last, AMPLITUDE_FROM_END)? * 100.0) as i64;
        let instance = tail(last, INSTANCE_FROM_END)? as i64;
        Some(format!(
            "{maneuver}_period_{period}_amplitude_{amplitude}_inst_{instance}"
        ))
    }

    /// Persist into `folder`; returns the written path, or `None` when nothing was acquired
    pub fn flush(&self, folder: &Path, now: &DateTime<Local>) -> Result<Option<PathBuf>> {
        let Some(label) = self.file_label() else {
            warn!("No data acquired, nothing to store");
            return Ok(None);
        };
        fs::create_dir_all(folder).context(format!("Failed to create {}", folder.display()))?;

        let header: Vec<String> = self
            .input_columns
            .iter()
            .chain(&self.calibration_columns)
            .cloned()
            .collect();
        let rows: Vec<Vec<f64>> = self
            .records
            .iter()
            .map(|r| r.input.iter().chain(&r.calibration).copied().collect())
            .collect();

        let path = folder.join(format!("{}_{}.txt", label, timestamp(now)));
        write_atomically(&path, &header, &rows)?;
        info!("✓ Stored {} acquisition rows in {}", rows.len(), path.display());
        Ok(Some(path))
    }
}

/// Command vectors sent during a control session
#[derive(Debug, Clone)]
pub struct ControlRecorder {
    header: Vec<String>,
    history: Vec<(u64, CommandVector)>,
}

impl ControlRecorder {
    /// Columns are the output channels, then `slot_<n>` for unused slots
    pub fn new(outputs: &[String]) -> Self {
        let header = (0..COMMAND_LEN)
            .map(|i| {
                outputs
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("slot_{i}"))
            })
            .collect();
        Self {
            header,
            history: Vec::new(),
        }
    }

    pub fn push(&mut self, index: u64, command: CommandVector) {
        self.history.push((index, command));
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// `<stem>_control_history_<timestamp>.txt` in `folder`
    pub fn flush(&self, folder: &Path, stem: &str, now: &DateTime<Local>) -> Result<PathBuf> {
        fs::create_dir_all(folder).context(format!("Failed to create {}", folder.display()))?;
        let rows: Vec<Vec<f64>> = self.history.iter().map(|(_, c)| c.to_row()).collect();
        let path = folder.join(format!("{}_control_history_{}.txt", stem, timestamp(now)));
        write_atomically(&path, &self.header, &rows)?;
        info!("✓ Stored {} commands in {}", rows.len(), path.display());
        Ok(path)
    }
}

/// Acquisition files already stored for `instance` in the subject folder
pub fn existing_acquisitions(subject_folder: &Path, instance: u32) -> Result<Vec<PathBuf>> {
    if !subject_folder.exists() {
        return Ok(Vec::new());
    }
    let marker = format!("_inst_{instance}_");
    let mut found = Vec::new();
    for entry in fs::read_dir(subject_folder)
        .context(format!("Failed to list {}", subject_folder.display()))?
    {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(&marker) && n.ends_with(".txt"))
            .unwrap_or(false);
        if matches {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

/// Remove the subject folder and everything in it; true when something was deleted
pub fn delete_subject_data(subject_folder: &Path) -> Result<bool> {
    if !subject_folder.exists() {
        return Ok(false);
    }
    fs::remove_dir_all(subject_folder)
        .context(format!("Failed to delete {}", subject_folder.display()))?;
    info!("Deleted folder {}", subject_folder.display());
    Ok(true)
}

/// Pickle diagnostic snapshots for offline inspection
pub fn dump_diagnostics<T: Serialize>(folder: &Path, snapshots: &T) -> Result<PathBuf> {
    fs::create_dir_all(folder).context(format!("Failed to create {}", folder.display()))?;
    let path = folder.join(DIAGNOSTICS_FILE);
    let mut file = File::create(&path)
        .context(format!("Failed to create diagnostics file: {}", path.display()))?;
    serde_pickle::to_writer(&mut file, snapshots, Default::default())
        .context("Failed to serialize diagnostics to pickle format")?;
    Ok(path)
}
