//! The local task store.
//!
//! [`TaskStore`] owns the SeaORM connection for the `tasks` and
//! `pomodoro_sessions` tables. It is the single writer for both: UI-facing
//! operations (`create_task`, `edit_task`, ...) mark rows as needing sync, while
//! the crate-internal `*_remote` writes used by the reconciler leave them
//! settled. Every successful write broadcasts a [`ChangeNotification`] so views
//! can refresh.

use chrono::{DateTime, SubsecRound, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, Schema, sea_query::SqliteQueryBuilder,
    ActiveValue::Set,
};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::conflict::{MatchKey, TaskDiff, normalize_text};
use crate::entity::{Category, MAX_PRIORITY, MIN_PRIORITY, pomodoro_session, task};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Record {0} not found")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Where a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Lightweight event emitted after every committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub table: String,
    pub kind: ChangeKind,
    pub primary_key: String,
    pub origin: ChangeOrigin,
}

/// Fields for a task created on this device.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub category: Category,
    pub priority: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub device_id: String,
}

impl NewTask {
    pub fn new(title: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            category: Category::default(),
            priority: MIN_PRIORITY,
            due_date: None,
            device_id: device_id.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }
}

/// A partial edit of an existing task. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct TaskEdit {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<Category>,
    pub priority: Option<i32>,
    pub due_date: Option<Option<DateTime<Utc>>>,
    pub is_completed: Option<bool>,
}

fn validate_title(title: &str) -> Result<(), StoreError> {
    if title.trim().is_empty() {
        return Err(StoreError::Validation("title must not be empty".into()));
    }
    Ok(())
}

fn validate_priority(priority: i32) -> Result<(), StoreError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(StoreError::Validation(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(())
}

/// Handle to the local store. Cheap to clone; clones share the connection pool
/// and the notification channel.
#[derive(Debug, Clone)]
pub struct TaskStore {
    inner: DatabaseConnection,
    change_tx: broadcast::Sender<ChangeNotification>,
}

impl TaskStore {
    /// Connect to `url` (e.g. `sqlite::memory:` or `sqlite:./tasks.db?mode=rwc`)
    /// and create the tables if they do not exist yet.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let opts = ConnectOptions::new(url);
        let inner = Database::connect(opts).await?;
        Self::from_connection(inner).await
    }

    /// Wrap an existing connection, creating the tables if needed.
    pub async fn from_connection(inner: DatabaseConnection) -> Result<Self, StoreError> {
        create_tables(&inner).await?;
        let (change_tx, _) = broadcast::channel(256);
        Ok(Self { inner, change_tx })
    }

    /// Get a reference to the underlying SeaORM connection.
    pub fn inner(&self) -> &DatabaseConnection {
        &self.inner
    }

    /// Subscribe to change notifications.
    pub fn change_rx(&self) -> broadcast::Receiver<ChangeNotification> {
        self.change_tx.subscribe()
    }

    pub(crate) fn notify(&self, table: &str, kind: ChangeKind, primary_key: &str, origin: ChangeOrigin) {
        // No subscribers is fine.
        let _ = self.change_tx.send(ChangeNotification {
            table: table.to_string(),
            kind,
            primary_key: primary_key.to_string(),
            origin,
        });
    }

    // -- tasks -------------------------------------------------------------

    /// Create a task authored on this device. A fresh record id is assigned.
    pub async fn create_task(&self, new: NewTask) -> Result<task::Model, StoreError> {
        validate_title(&new.title)?;
        validate_priority(new.priority)?;

        let now = Utc::now();
        let model = task::ActiveModel {
            record_id: Set(Uuid::new_v4().to_string()),
            title: Set(new.title),
            description: Set(normalize_text(new.description.as_deref())),
            category: Set(new.category.label().to_string()),
            priority: Set(new.priority),
            // Payloads carry whole seconds; keep local rows comparable with the echo.
            due_date: Set(new.due_date.map(|due| due.trunc_subsecs(0))),
            is_completed: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            device_id: Set(new.device_id),
            work_progress: Set(0.0),
            time_spent: Set(0.0),
            progress_notes: Set(None),
            last_progress_update: Set(None),
            needs_sync: Set(true),
        }
        .insert(&self.inner)
        .await?;

        log::debug!("Created task {} ({})", model.record_id, model.title);
        self.notify("tasks", ChangeKind::Insert, &model.record_id, ChangeOrigin::Local);
        Ok(model)
    }

    pub async fn get_task(&self, record_id: &str) -> Result<Option<task::Model>, StoreError> {
        Ok(task::Entity::find_by_id(record_id.to_string())
            .one(&self.inner)
            .await?)
    }

    /// All tasks, oldest first.
    pub async fn tasks(&self) -> Result<Vec<task::Model>, StoreError> {
        Ok(task::Entity::find()
            .order_by_asc(task::Column::CreatedAt)
            .order_by_asc(task::Column::RecordId)
            .all(&self.inner)
            .await?)
    }

    /// Tasks edited locally that have not been settled by the relay.
    pub async fn pending_sync(&self) -> Result<Vec<task::Model>, StoreError> {
        Ok(task::Entity::find()
            .filter(task::Column::NeedsSync.eq(true))
            .order_by_asc(task::Column::UpdatedAt)
            .all(&self.inner)
            .await?)
    }

    /// Locate the local row an inbound task refers to.
    pub async fn find_match(&self, key: &MatchKey) -> Result<Option<task::Model>, StoreError> {
        let found = match key {
            MatchKey::RecordId(id) => task::Entity::find_by_id(id.clone()).one(&self.inner).await?,
            MatchKey::TitleDevice { title, device_id } => {
                task::Entity::find()
                    .filter(task::Column::Title.eq(title.as_str()))
                    .filter(task::Column::DeviceId.eq(device_id.as_str()))
                    .order_by_asc(task::Column::CreatedAt)
                    .one(&self.inner)
                    .await?
            }
        };
        Ok(found)
    }

    /// Apply a local edit. The row is marked as needing sync.
    pub async fn edit_task(&self, record_id: &str, edit: TaskEdit) -> Result<task::Model, StoreError> {
        let existing = self
            .get_task(record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;

        let mut active: task::ActiveModel = existing.into();
        if let Some(title) = edit.title {
            validate_title(&title)?;
            active.title = Set(title);
        }
        if let Some(description) = edit.description {
            active.description = Set(normalize_text(description.as_deref()));
        }
        if let Some(category) = edit.category {
            active.category = Set(category.label().to_string());
        }
        if let Some(priority) = edit.priority {
            validate_priority(priority)?;
            active.priority = Set(priority);
        }
        if let Some(due) = edit.due_date {
            active.due_date = Set(due.map(|due| due.trunc_subsecs(0)));
        }
        if let Some(done) = edit.is_completed {
            active.is_completed = Set(done);
        }
        active.updated_at = Set(Utc::now());
        active.needs_sync = Set(true);

        let model = active.update(&self.inner).await?;
        self.notify("tasks", ChangeKind::Update, &model.record_id, ChangeOrigin::Local);
        Ok(model)
    }

    pub async fn set_completed(&self, record_id: &str, done: bool) -> Result<task::Model, StoreError> {
        self.edit_task(
            record_id,
            TaskEdit {
                is_completed: Some(done),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a task authored or edited locally. Returns whether a row was removed.
    pub async fn delete_task(&self, record_id: &str) -> Result<bool, StoreError> {
        self.delete_with_origin(record_id, ChangeOrigin::Local).await
    }

    /// Remove every task from the local store. Returns the number of rows removed.
    pub async fn clear_tasks(&self) -> Result<u64, StoreError> {
        let result = task::Entity::delete_many().exec(&self.inner).await?;
        log::info!("Cleared {} local tasks", result.rows_affected);
        self.notify("tasks", ChangeKind::Delete, "*", ChangeOrigin::Local);
        Ok(result.rows_affected)
    }

    /// Clear the needs-sync flag once a local edit has been handed to the relay.
    pub async fn mark_synced(&self, record_id: &str) -> Result<(), StoreError> {
        let existing = self
            .get_task(record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        if !existing.needs_sync {
            return Ok(());
        }
        let mut active: task::ActiveModel = existing.into();
        active.needs_sync = Set(false);
        active.update(&self.inner).await?;
        Ok(())
    }

    pub(crate) async fn insert_remote(&self, model: task::Model) -> Result<task::Model, StoreError> {
        let active: task::ActiveModel = model.into();
        // `From<Model>` yields unchanged values; insert needs them set.
        let model = active.reset_all().insert(&self.inner).await?;
        self.notify("tasks", ChangeKind::Insert, &model.record_id, ChangeOrigin::Remote);
        Ok(model)
    }

    pub(crate) async fn apply_remote_diff(
        &self,
        local: task::Model,
        diff: TaskDiff,
        now: DateTime<Utc>,
    ) -> Result<task::Model, StoreError> {
        let model = diff.into_active_model(local, now).update(&self.inner).await?;
        self.notify("tasks", ChangeKind::Update, &model.record_id, ChangeOrigin::Remote);
        Ok(model)
    }

    pub(crate) async fn delete_remote(&self, record_id: &str) -> Result<bool, StoreError> {
        self.delete_with_origin(record_id, ChangeOrigin::Remote).await
    }

    async fn delete_with_origin(&self, record_id: &str, origin: ChangeOrigin) -> Result<bool, StoreError> {
        let result = task::Entity::delete_by_id(record_id.to_string())
            .exec(&self.inner)
            .await?;
        let removed = result.rows_affected > 0;
        if removed {
            self.notify("tasks", ChangeKind::Delete, record_id, origin);
        }
        Ok(removed)
    }

    // -- pomodoro sessions ---------------------------------------------------

    /// Start a focus session of `minutes`, optionally attached to a task.
    pub async fn start_session(
        &self,
        task_record_id: Option<&str>,
        minutes: i32,
    ) -> Result<pomodoro_session::Model, StoreError> {
        if minutes <= 0 {
            return Err(StoreError::Validation(format!(
                "session length must be positive, got {minutes}"
            )));
        }

        let model = pomodoro_session::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            task_record_id: Set(task_record_id.map(str::to_string)),
            start_time: Set(Utc::now()),
            end_time: Set(None),
            total_duration: Set(minutes),
            is_active: Set(true),
            needs_sync: Set(true),
        }
        .insert(&self.inner)
        .await?;

        self.notify("pomodoro_sessions", ChangeKind::Insert, &model.id, ChangeOrigin::Local);
        Ok(model)
    }

    /// Stop a running session.
    pub async fn finish_session(&self, id: &str) -> Result<pomodoro_session::Model, StoreError> {
        let existing = pomodoro_session::Entity::find_by_id(id.to_string())
            .one(&self.inner)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut active: pomodoro_session::ActiveModel = existing.into();
        active.end_time = Set(Some(Utc::now()));
        active.is_active = Set(false);
        let model = active.update(&self.inner).await?;

        self.notify("pomodoro_sessions", ChangeKind::Update, &model.id, ChangeOrigin::Local);
        Ok(model)
    }

    /// All sessions, newest first.
    pub async fn sessions(&self) -> Result<Vec<pomodoro_session::Model>, StoreError> {
        Ok(pomodoro_session::Entity::find()
            .order_by_desc(pomodoro_session::Column::StartTime)
            .all(&self.inner)
            .await?)
    }
}

async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(db.get_database_backend());

    let tasks = schema
        .create_table_from_entity(task::Entity)
        .if_not_exists()
        .to_owned();
    db.execute_unprepared(&tasks.to_string(SqliteQueryBuilder)).await?;

    let sessions = schema
        .create_table_from_entity(pomodoro_session::Entity)
        .if_not_exists()
        .to_owned();
    db.execute_unprepared(&sessions.to_string(SqliteQueryBuilder)).await?;

    Ok(())
}
