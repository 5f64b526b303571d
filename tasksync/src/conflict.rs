//! Record matching and last-write-wins field diffing.
//!
//! An inbound task is matched to a local row by its record id. Payloads without
//! one (older clients, rows created through the legacy API) fall back to the
//! `(title, device_id)` pair. Two devices can create same-titled tasks, so the
//! fallback only ever runs when no record id is available.
//!
//! Once matched, the inbound payload wins field by field: [`TaskDiff::between`]
//! collects exactly the fields that differ, and only those are written.

use chrono::{DateTime, Utc};
use sea_orm::ActiveValue::Set;

use crate::dates::parse_date;
use crate::entity::{Category, clamp_priority, task};
use crate::messages::TaskPayload;

/// How an inbound task is located in the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKey {
    RecordId(String),
    TitleDevice { title: String, device_id: String },
}

impl MatchKey {
    pub fn for_payload(payload: &TaskPayload) -> Self {
        match payload.record_id() {
            Some(id) => MatchKey::RecordId(id.to_string()),
            None => MatchKey::TitleDevice {
                title: payload.title.clone(),
                device_id: payload.device_id.clone(),
            },
        }
    }
}

/// Treat empty strings as absent so `""` from the relay and `None` locally
/// compare equal.
pub(crate) fn normalize_text(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

pub(crate) fn clamp_progress(progress: f64) -> f64 {
    progress.clamp(0.0, 100.0)
}

/// The fields of a local task that an inbound payload would change.
///
/// `None` means "leave as is". For nullable columns the inner `Option` is the
/// new value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDiff {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub is_completed: Option<bool>,
    pub category: Option<String>,
    pub priority: Option<i32>,
    pub due_date: Option<DateTime<Utc>>,
    pub work_progress: Option<f64>,
    pub time_spent: Option<f64>,
    pub progress_notes: Option<Option<String>>,
}

impl TaskDiff {
    pub fn between(local: &task::Model, remote: &TaskPayload) -> Self {
        let mut diff = TaskDiff::default();

        if local.title != remote.title {
            diff.title = Some(remote.title.clone());
        }

        let description = normalize_text(remote.description.as_deref());
        if normalize_text(local.description.as_deref()) != description {
            diff.description = Some(description);
        }

        if local.is_completed != remote.is_completed {
            diff.is_completed = Some(remote.is_completed);
        }

        let category = remote
            .category
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(Category::from_label)
            .unwrap_or_default();
        if local.category != category.label() {
            diff.category = Some(category.label().to_string());
        }

        let priority = clamp_priority(remote.priority.unwrap_or(1));
        if local.priority != priority {
            diff.priority = Some(priority);
        }

        // An unparsable due date never clears the local one.
        if let Some(due) = remote.due_date.as_deref().and_then(parse_date) {
            if local.due_date != Some(due) {
                diff.due_date = Some(due);
            }
        }

        if let Some(progress) = remote.work_progress.map(clamp_progress) {
            if local.work_progress != progress {
                diff.work_progress = Some(progress);
            }
        }

        if let Some(hours) = remote.time_spent {
            if local.time_spent != hours {
                diff.time_spent = Some(hours);
            }
        }

        let notes = normalize_text(remote.progress_notes.as_deref());
        if normalize_text(local.progress_notes.as_deref()) != notes {
            diff.progress_notes = Some(notes);
        }

        diff
    }

    pub fn is_empty(&self) -> bool {
        self == &TaskDiff::default()
    }

    /// Whether any work-tracking field changes.
    pub fn touches_progress(&self) -> bool {
        self.work_progress.is_some() || self.time_spent.is_some() || self.progress_notes.is_some()
    }

    /// Names of the changed fields, for logging.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.is_completed.is_some() {
            fields.push("is_completed");
        }
        if self.category.is_some() {
            fields.push("category");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.due_date.is_some() {
            fields.push("due_date");
        }
        if self.work_progress.is_some() {
            fields.push("work_progress");
        }
        if self.time_spent.is_some() {
            fields.push("time_spent");
        }
        if self.progress_notes.is_some() {
            fields.push("progress_notes");
        }
        fields
    }

    /// Turn `local` into an active model carrying only the changed columns.
    ///
    /// The row is marked as settled (`needs_sync = false`) because the change
    /// came from the relay and must not be echoed back.
    pub fn into_active_model(self, local: task::Model, now: DateTime<Utc>) -> task::ActiveModel {
        let touches_progress = self.touches_progress();
        let mut active: task::ActiveModel = local.into();

        if let Some(title) = self.title {
            active.title = Set(title);
        }
        if let Some(description) = self.description {
            active.description = Set(description);
        }
        if let Some(done) = self.is_completed {
            active.is_completed = Set(done);
        }
        if let Some(category) = self.category {
            active.category = Set(category);
        }
        if let Some(priority) = self.priority {
            active.priority = Set(priority);
        }
        if let Some(due) = self.due_date {
            active.due_date = Set(Some(due));
        }
        if let Some(progress) = self.work_progress {
            active.work_progress = Set(progress);
        }
        if let Some(hours) = self.time_spent {
            active.time_spent = Set(hours);
        }
        if let Some(notes) = self.progress_notes {
            active.progress_notes = Set(notes);
        }
        if touches_progress {
            active.last_progress_update = Set(Some(now));
        }

        active.needs_sync = Set(false);
        active.updated_at = Set(now);
        active
    }
}
