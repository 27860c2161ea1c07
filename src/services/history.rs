use crate::core::execute::{ExecutionReport, OperationKind};
use crate::core::placement::PlacementRole;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const HISTORY_FILE: &str = ".history.jsonl";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub source: PathBuf,
    pub target: PathBuf,
    pub role: PlacementRole,
    /// Set when it differs from the record's operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
    /// The file was moved and a symlink left at `source`
    #[serde(default)]
    pub backlink: bool,
}

/// One real run, appended as a single JSON line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub timestamp: String,
    pub operation: OperationKind,
    pub entries: Vec<HistoryEntry>,
}

impl HistoryRecord {
    pub fn from_report(report: &ExecutionReport, operation: OperationKind) -> Self {
        let entries = report
            .completed
            .iter()
            .map(|e| HistoryEntry {
                source: e.source.clone(),
                target: e.target.clone(),
                role: e.role,
                operation: (e.operation != operation).then_some(e.operation),
                backlink: e.operation == OperationKind::Move && report.backlinks.contains(&e.source),
            })
            .collect();
        Self {
            timestamp: Utc::now().to_rfc3339(),
            operation,
            entries,
        }
    }

    pub fn is_restorable(&self) -> bool {
        self.moved().next().is_some()
    }

    /// Entries whose file left its source and can be put back.
    pub fn moved(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter().filter(move |e| {
            e.operation.unwrap_or(self.operation) == OperationKind::Move
                && e.role != PlacementRole::Collected
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelection {
    /// Most recent move record
    Latest,
    Record(usize),
    All,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub records: usize,
    pub restored: usize,
    pub skipped: usize,
}

/// Run log stored under the output directory.
pub struct HistoryService {
    file: PathBuf,
}

impl HistoryService {
    pub fn new(output_root: &Path) -> Self {
        Self {
            file: output_root.join(HISTORY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    pub fn append(&self, record: &HistoryRecord) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)
            .with_context(|| format!("Failed to open history file {:?}", self.file))?;
        writeln!(out, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Raw lines with their parsed record; malformed lines are kept so a
    /// rewrite does not lose them.
    fn read_lines(&self) -> Result<Vec<(Option<HistoryRecord>, String)>> {
        if !self.file.exists() {
            return Ok(Vec::new());
        }
        let f = File::open(&self.file)
            .with_context(|| format!("Could not open history file {:?}", self.file))?;
        let mut lines = Vec::new();
        for (i, line) in BufReader::new(f).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(rec) => lines.push((Some(rec), line)),
                Err(err) => {
                    log::warn!("Skipping malformed history entry {}: {}", i, err);
                    lines.push((None, line));
                }
            }
        }
        Ok(lines)
    }

    pub fn load(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .read_lines()?
            .into_iter()
            .filter_map(|(rec, _)| rec)
            .collect())
    }

    /// Every target a previous run wrote; `force` may replace these.
    pub fn prior_targets(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .load()?
            .into_iter()
            .flat_map(|r| r.entries.into_iter().map(|e| e.target))
            .collect())
    }

    /// Move files of the selected move records back to their sources,
    /// removing backlinks first, then drop those records from the log.
    /// Record indices count every parsed record, as `load` returns them.
    pub fn restore(&self, selection: RestoreSelection) -> Result<RestoreSummary> {
        let lines = self.read_lines()?;
        let records: Vec<(usize, &HistoryRecord)> = lines
            .iter()
            .enumerate()
            .filter_map(|(line, (rec, _))| rec.as_ref().map(|r| (line, r)))
            .collect();
        let selected: Vec<usize> = match selection {
            RestoreSelection::All => records
                .iter()
                .filter(|(_, r)| r.is_restorable())
                .map(|(line, _)| *line)
                .collect(),
            RestoreSelection::Latest => records
                .iter()
                .rev()
                .find(|(_, r)| r.is_restorable())
                .map(|(line, _)| vec![*line])
                .unwrap_or_default(),
            RestoreSelection::Record(idx) => {
                let Some((line, rec)) = records.get(idx) else {
                    anyhow::bail!(
                        "Invalid history index {}; there are {} record(s)",
                        idx,
                        records.len()
                    );
                };
                if !rec.is_restorable() {
                    anyhow::bail!("Record {} moved no files; only moves can be restored", idx);
                }
                vec![*line]
            }
        };
        if selected.is_empty() {
            anyhow::bail!("No 'move' history records to restore");
        }

        let mut summary = RestoreSummary::default();
        for &line in &selected {
            let Some(rec) = lines[line].0.as_ref() else {
                continue;
            };
            log::info!("Restoring record {}", rec.timestamp);
            summary.records += 1;
            for entry in rec.moved() {
                if entry.backlink && fs::symlink_metadata(&entry.source).is_ok_and(|m| m.file_type().is_symlink()) {
                    fs::remove_file(&entry.source)
                        .with_context(|| format!("Failed to remove backlink {:?}", entry.source))?;
                }
                if !entry.target.exists() {
                    log::warn!("{:?} no longer exists; skipping", entry.target);
                    summary.skipped += 1;
                    continue;
                }
                if fs::symlink_metadata(&entry.source).is_ok() {
                    log::warn!("{:?} is occupied; skipping", entry.source);
                    summary.skipped += 1;
                    continue;
                }
                if let Some(parent) = entry.source.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&entry.target, &entry.source).with_context(|| {
                    format!("Failed to restore {:?} → {:?}", entry.target, entry.source)
                })?;
                summary.restored += 1;
            }
        }

        let remaining: Vec<&str> = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !selected.contains(i))
            .map(|(_, (_, line))| line.as_str())
            .collect();
        let new_content = if remaining.is_empty() {
            String::new()
        } else {
            remaining.join("\n") + "\n"
        };
        fs::write(&self.file, new_content)
            .with_context(|| format!("Failed to update history file {:?}", self.file))?;
        Ok(summary)
    }
}
