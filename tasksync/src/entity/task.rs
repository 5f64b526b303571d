use sea_orm::entity::prelude::*;

use super::Category;

/// A task row in the local store.
///
/// `record_id` is the cross-device identity of the task: it is assigned once at
/// creation and travels on every sync payload.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub record_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub priority: i32,
    pub due_date: Option<DateTimeUtc>,
    pub is_completed: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub device_id: String,
    /// Percentage in `0.0..=100.0`.
    pub work_progress: f64,
    /// Hours.
    pub time_spent: f64,
    pub progress_notes: Option<String>,
    pub last_progress_update: Option<DateTimeUtc>,
    /// Set by local edits, cleared when the row was written from the relay.
    pub needs_sync: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn category(&self) -> Category {
        Category::from_label(&self.category)
    }

    pub fn is_work(&self) -> bool {
        self.category() == Category::Work
    }
}
