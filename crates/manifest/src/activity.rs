//! Activity records describing a committed manifest change.

use serde::{Deserialize, Serialize};

use crate::entry::ManifestEntry;

/// What happened to one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Create,
    Edit,
    Delete,
}

/// One path in an activity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDetail {
    pub action: ActivityAction,
    pub path: String,
    pub num_bytes: u64,
    pub is_directory: bool,
}

/// File-level summary of one committed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Human-readable summary.
    pub message: String,
    /// Revision the change was made on top of.
    pub parent_revision: String,
    /// ISO-8601 time the record was built.
    pub timestamp: String,
    pub num_created: usize,
    pub num_modified: usize,
    pub num_deleted: usize,
    pub details: Vec<ActivityDetail>,
}

/// Entries touched by an update, grouped by what happened to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub created: Vec<ManifestEntry>,
    pub modified: Vec<ManifestEntry>,
    pub deleted: Vec<ManifestEntry>,
}

impl UpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

impl ActivityRecord {
    /// Build a record for an applied update.
    ///
    /// An entry whose size does not parse is logged and left out of the
    /// details; the rest of the record is still produced.
    ///
    /// # Arguments
    /// * `summary` - Entries created, modified and deleted
    /// * `parent_revision` - Revision the update was applied to
    /// * `message` - Summary line; a count-based one is generated if `None`
    pub fn from_summary(
        summary: &UpdateSummary,
        parent_revision: &str,
        message: Option<&str>,
    ) -> Self {
        let groups: [(ActivityAction, &Vec<ManifestEntry>); 3] = [
            (ActivityAction::Create, &summary.created),
            (ActivityAction::Edit, &summary.modified),
            (ActivityAction::Delete, &summary.deleted),
        ];

        let mut details: Vec<ActivityDetail> = Vec::new();
        for (action, entries) in groups {
            for entry in entries {
                match build_detail(action, entry) {
                    Ok(detail) => details.push(detail),
                    Err(reason) => log::warn!(
                        "Skipping activity detail for {}: {}",
                        entry.relative_path,
                        reason
                    ),
                }
            }
        }

        let message: String = match message {
            Some(m) => m.to_string(),
            None => default_message(summary),
        };

        Self {
            message,
            parent_revision: parent_revision.to_string(),
            timestamp: dataset_sync_common::now_iso_string(),
            num_created: summary.created.len(),
            num_modified: summary.modified.len(),
            num_deleted: summary.deleted.len(),
            details,
        }
    }
}

fn build_detail(action: ActivityAction, entry: &ManifestEntry) -> Result<ActivityDetail, String> {
    let num_bytes: u64 = entry
        .size()
        .ok_or_else(|| format!("num_bytes '{}' is not an integer", entry.num_bytes))?;
    Ok(ActivityDetail {
        action,
        path: entry.relative_path.clone(),
        num_bytes,
        is_directory: entry.is_dir(),
    })
}

fn default_message(summary: &UpdateSummary) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !summary.created.is_empty() {
        parts.push(format!("{} new", summary.created.len()));
    }
    if !summary.modified.is_empty() {
        parts.push(format!("{} modified", summary.modified.len()));
    }
    if !summary.deleted.is_empty() {
        parts.push(format!("{} deleted", summary.deleted.len()));
    }
    if parts.is_empty() {
        "No changes".to_string()
    } else {
        format!("{} file(s)", parts.join(", "))
    }
}
