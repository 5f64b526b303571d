//! Applies relay events to the local store.
//!
//! The relay is authoritative for every record it sends. A `tasks_sync`
//! snapshot upserts each entry, `task_created` inserts unless the record is
//! already present, `task_updated` diff-writes onto an existing row and
//! `task_deleted` removes it. Rows written here are marked settled so they are
//! not pushed back to the relay.

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::conflict::{MatchKey, TaskDiff, clamp_progress, normalize_text};
use crate::dates::parse_date;
use crate::entity::{Category, clamp_priority, task};
use crate::messages::TaskPayload;
use crate::status::SyncStatus;
use crate::store::{StoreError, TaskStore};

/// What applying one inbound task did to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Created(task::Model),
    Updated(task::Model),
    /// Matched a local row that already had the same field values.
    Unchanged,
    Deleted(String),
    /// `task_created` for a record that already exists locally.
    Duplicate,
    /// Update or delete for a record this device does not have.
    Missing,
}

/// Counts for one `tasks_sync` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Build a fresh local row from an inbound payload.
fn model_from_payload(payload: &TaskPayload, now: DateTime<Utc>) -> task::Model {
    let category = payload
        .category
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(Category::from_label)
        .unwrap_or_default();

    task::Model {
        record_id: payload
            .record_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        title: payload.title.clone(),
        description: normalize_text(payload.description.as_deref()),
        category: category.label().to_string(),
        priority: clamp_priority(payload.priority.unwrap_or(1)),
        due_date: payload.due_date.as_deref().and_then(parse_date),
        is_completed: payload.is_completed,
        created_at: payload
            .created_at
            .as_deref()
            .and_then(parse_date)
            .unwrap_or(now),
        updated_at: now,
        device_id: payload.device_id.clone(),
        work_progress: payload.work_progress.map(clamp_progress).unwrap_or(0.0),
        time_spent: payload.time_spent.unwrap_or(0.0),
        progress_notes: normalize_text(payload.progress_notes.as_deref()),
        last_progress_update: Some(now),
        needs_sync: false,
    }
}

/// Applies inbound events to a [`TaskStore`] and tracks snapshot progress.
#[derive(Debug)]
pub struct Reconciler {
    store: TaskStore,
    status_tx: watch::Sender<SyncStatus>,
}

impl Reconciler {
    pub fn new(store: TaskStore) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Idle);
        Self { store, status_tx }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Watch the status of snapshot reconciliation.
    pub fn sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Upsert every task of a `tasks_sync` snapshot.
    ///
    /// A failure on one entry is logged and counted; the rest of the snapshot
    /// is still applied.
    pub async fn apply_snapshot(&self, tasks: &[TaskPayload]) -> SnapshotSummary {
        self.apply_snapshot_with_skipped(tasks, 0).await
    }

    /// Like [`apply_snapshot`](Self::apply_snapshot), for a snapshot that lost
    /// `skipped` entries during decoding. Those count as failed.
    pub async fn apply_snapshot_with_skipped(
        &self,
        tasks: &[TaskPayload],
        skipped: usize,
    ) -> SnapshotSummary {
        self.status_tx.send_replace(SyncStatus::Syncing);
        let total = tasks.len() + skipped;
        log::info!("Reconciling snapshot of {total} tasks");

        let mut summary = SnapshotSummary {
            failed: skipped,
            ..SnapshotSummary::default()
        };
        for payload in tasks {
            match self.upsert(payload).await {
                Ok(ApplyOutcome::Created(_)) => summary.created += 1,
                Ok(ApplyOutcome::Updated(_)) => summary.updated += 1,
                Ok(_) => summary.unchanged += 1,
                Err(e) => {
                    log::error!("Failed to reconcile task {:?}: {e}", payload.title);
                    summary.failed += 1;
                }
            }
        }

        let status = if summary.failed == 0 {
            SyncStatus::Success
        } else {
            SyncStatus::Failed(format!("{} of {total} tasks failed", summary.failed))
        };
        self.status_tx.send_replace(status);

        log::info!(
            "Snapshot reconciled: {} created, {} updated, {} unchanged, {} failed",
            summary.created,
            summary.updated,
            summary.unchanged,
            summary.failed
        );
        summary
    }

    /// Insert the task, or diff-write it onto its local match.
    pub async fn upsert(&self, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let key = MatchKey::for_payload(payload);
        match self.store.find_match(&key).await? {
            Some(local) => self.write_diff(local, payload).await,
            None => self.insert(payload).await,
        }
    }

    pub async fn apply_created(&self, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let key = MatchKey::for_payload(payload);
        if self.store.find_match(&key).await?.is_some() {
            log::info!("Task {:?} already exists, skipping create", payload.title);
            return Ok(ApplyOutcome::Duplicate);
        }
        self.insert(payload).await
    }

    pub async fn apply_updated(&self, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let key = MatchKey::for_payload(payload);
        match self.store.find_match(&key).await? {
            Some(local) => self.write_diff(local, payload).await,
            None => {
                log::warn!("No local task matches update for {:?}", payload.title);
                Ok(ApplyOutcome::Missing)
            }
        }
    }

    pub async fn apply_deleted(&self, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let key = MatchKey::for_payload(payload);
        let Some(local) = self.store.find_match(&key).await? else {
            log::warn!("No local task matches delete for {:?}", payload.title);
            return Ok(ApplyOutcome::Missing);
        };

        if self.store.delete_remote(&local.record_id).await? {
            log::info!("Deleted task {} ({})", local.record_id, local.title);
            Ok(ApplyOutcome::Deleted(local.record_id))
        } else {
            Ok(ApplyOutcome::Missing)
        }
    }

    async fn insert(&self, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let model = model_from_payload(payload, Utc::now());
        let model = self.store.insert_remote(model).await?;
        log::info!("Created task {} ({})", model.record_id, model.title);
        Ok(ApplyOutcome::Created(model))
    }

    async fn write_diff(&self, local: task::Model, payload: &TaskPayload) -> Result<ApplyOutcome, StoreError> {
        let diff = TaskDiff::between(&local, payload);
        if diff.is_empty() {
            log::debug!("Task {} unchanged", local.record_id);
            return Ok(ApplyOutcome::Unchanged);
        }

        log::info!(
            "Updating task {} fields {:?}",
            local.record_id,
            diff.changed_fields()
        );
        let model = self.store.apply_remote_diff(local, diff, Utc::now()).await?;
        Ok(ApplyOutcome::Updated(model))
    }
}
