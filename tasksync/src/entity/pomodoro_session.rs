use sea_orm::entity::prelude::*;

/// A focus session recorded by the pomodoro timer. Sessions never leave the
/// device they were recorded on.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "pomodoro_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub task_record_id: Option<String>,
    pub start_time: DateTimeUtc,
    pub end_time: Option<DateTimeUtc>,
    /// Minutes.
    pub total_duration: i32,
    pub is_active: bool,
    pub needs_sync: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
