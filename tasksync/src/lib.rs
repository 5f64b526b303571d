//! # tasksync
//!
//! A local task store plus a real-time sync client for small multi-device
//! to-do lists.
//!
//! [`TaskStore`] wraps a SeaORM [`DatabaseConnection`](sea_orm::DatabaseConnection)
//! holding tasks and pomodoro sessions. [`SyncClient`] keeps that store
//! convergent with a relay server that broadcasts every task mutation to all
//! connected devices over a WebSocket. Reconciliation is record-id keyed with a
//! `(title, device_id)` fallback, and conflicts are settled by last write wins,
//! one field at a time.
//!
//! ## Quick start
//!
//! ```ignore
//! use tasksync::{NewTask, SyncClientBuilder, TaskStore};
//!
//! let store = TaskStore::open("sqlite:./tasks.db?mode=rwc").await?;
//! let handle = SyncClientBuilder::new("ws://localhost:8082/ws", store.clone())
//!     .with_device_id("kitchen-ipad")
//!     .build()
//!     .start();
//!
//! let task = store.create_task(NewTask::new("Piano practice", "kitchen-ipad")).await?;
//! handle.create_task(&task).await?;
//! ```
//!
//! ## Key types
//!
//! - [`TaskStore`]: local store; every write emits a [`ChangeNotification`]
//! - [`Reconciler`]: applies inbound relay events to the store
//! - [`SyncClient`] / [`SyncHandle`]: connection loop and its control handle
//! - [`ClientMessage`] / [`ServerMessage`]: the JSON envelopes on the wire

pub mod client;
pub mod config;
pub mod conflict;
pub mod dates;
pub mod entity;
pub mod messages;
pub mod reconcile;
pub mod status;
pub mod store;
pub mod work;

pub use client::{SyncClient, SyncClientBuilder, SyncError, SyncHandle};
pub use config::ClientConfig;
pub use conflict::{MatchKey, TaskDiff};
pub use entity::{Category, pomodoro_session, task};
pub use messages::{ClientMessage, ProtocolError, RemoteId, ServerMessage, TaskPayload};
pub use reconcile::{ApplyOutcome, Reconciler, SnapshotSummary};
pub use status::{ConnectionStatus, SyncStatus};
pub use store::{
    ChangeKind, ChangeNotification, ChangeOrigin, NewTask, StoreError, TaskEdit, TaskStore,
};
pub use work::{
    CategoryData, DailyReport, Insight, ProgressLevel, Rating, Recommendation, TREND_WEEKS,
    WeeklyData, WeeklyOverview, WorkAnalytics, format_time_spent,
};

// Re-export sea-orm for users of the library
pub use sea_orm;

/// User id sent on every outbound payload when none is configured.
pub const DEFAULT_USER_ID: &str = "default_user";
