//! Wire types for the relay protocol.
//!
//! Every frame is a JSON text message of the form `{"type": ..., "data": ...}`.
//! Clients send [`ClientMessage`]s (`ping`, `create_task`, `update_task`,
//! `delete_task`) and receive [`ServerMessage`]s (`pong`, `tasks_sync`,
//! `task_created`, `task_updated`, `task_deleted`). The `data` shape depends on
//! the tag: a single [`TaskPayload`], an array of them, or nothing at all.
//!
//! Decoding is lenient the same way the relay is: missing or `null` task fields
//! fall back to defaults, a `priority` may arrive as an integer, a float or a
//! numeric string, an `id` of any unexpected shape is ignored, and one
//! malformed entry in a `tasks_sync` array is skipped (and counted) instead of
//! discarding the whole snapshot.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::dates::format_date;
use crate::entity::task;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {kind}: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// The relay's own row id. Depending on the relay build this is an integer or a
/// generated string; clients never key on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteId {
    Number(i64),
    Text(String),
}

/// A task as it travels over the wire. Field names are snake_case.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPayload {
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_remote_id")]
    pub id: Option<RemoteId>,
    #[serde(deserialize_with = "null_as_default")]
    pub user_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub is_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", deserialize_with = "lenient_priority")]
    pub priority: Option<i32>,
    #[serde(deserialize_with = "null_as_default")]
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_notes: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Integers pass through, floats are truncated and numeric strings are parsed.
/// Anything else reads as no priority at all.
fn lenient_priority<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let number = match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(number.and_then(|n| i32::try_from(n).ok()))
}

fn lenient_remote_id<'de, D>(deserializer: D) -> Result<Option<RemoteId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .map(RemoteId::Number),
        Value::String(s) => Some(RemoteId::Text(s)),
        _ => None,
    })
}

impl TaskPayload {
    /// Build an outbound payload from a local task. The relay assigns its own
    /// row id, so `id` is always sent as `0`.
    pub fn from_task(task: &task::Model, user_id: &str) -> Self {
        Self {
            id: Some(RemoteId::Number(0)),
            user_id: user_id.to_string(),
            title: task.title.clone(),
            description: Some(task.description.clone().unwrap_or_default()),
            due_date: Some(task.due_date.as_ref().map(format_date).unwrap_or_default()),
            is_completed: task.is_completed,
            category: Some(task.category.clone()),
            priority: Some(task.priority),
            device_id: task.device_id.clone(),
            record_id: Some(task.record_id.clone()),
            created_at: Some(format_date(&task.created_at)),
            updated_at: Some(format_date(&task.updated_at)),
            work_progress: Some(task.work_progress),
            time_spent: Some(task.time_spent),
            progress_notes: task.progress_notes.clone(),
        }
    }

    /// The record id, treating an empty string the same as an absent one.
    pub fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

impl Envelope {
    fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }

    fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn task_data(payload: &TaskPayload) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(payload)?)
}

fn decode_task(kind: &str, data: Value) -> Result<TaskPayload, ProtocolError> {
    if !data.is_object() {
        return Err(ProtocolError::InvalidPayload {
            kind: kind.to_string(),
            reason: "expected a task object".into(),
        });
    }
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a task array, returning the usable entries and how many were dropped.
fn decode_task_list(kind: &str, data: Value) -> Result<(Vec<TaskPayload>, usize), ProtocolError> {
    let entries = match data {
        // An empty relay table serializes as `null`.
        Value::Null => return Ok((Vec::new(), 0)),
        Value::Array(entries) => entries,
        _ => {
            return Err(ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                reason: "expected an array of tasks".into(),
            });
        }
    };

    let mut tasks = Vec::with_capacity(entries.len());
    let mut skipped = 0;
    for (index, entry) in entries.into_iter().enumerate() {
        match decode_task(kind, entry) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                log::warn!("Skipping {kind} entry {index}: {e}");
                skipped += 1;
            }
        }
    }
    Ok((tasks, skipped))
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Ping,
    CreateTask(TaskPayload),
    UpdateTask(TaskPayload),
    DeleteTask(TaskPayload),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Ping => "ping",
            ClientMessage::CreateTask(_) => "create_task",
            ClientMessage::UpdateTask(_) => "update_task",
            ClientMessage::DeleteTask(_) => "delete_task",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ClientMessage::Ping => Value::Null,
            ClientMessage::CreateTask(task)
            | ClientMessage::UpdateTask(task)
            | ClientMessage::DeleteTask(task) => task_data(task)?,
        };
        Envelope::new(self.kind(), data).encode()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, data } = serde_json::from_str(text)?;
        match kind.as_str() {
            "ping" => Ok(ClientMessage::Ping),
            "create_task" => Ok(ClientMessage::CreateTask(decode_task(&kind, data)?)),
            "update_task" => Ok(ClientMessage::UpdateTask(decode_task(&kind, data)?)),
            "delete_task" => Ok(ClientMessage::DeleteTask(decode_task(&kind, data)?)),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

/// Messages the relay sends to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Pong,
    /// A full snapshot. `skipped` counts entries that could not be decoded and
    /// is never sent.
    TasksSync {
        tasks: Vec<TaskPayload>,
        skipped: usize,
    },
    TaskCreated(TaskPayload),
    TaskUpdated(TaskPayload),
    TaskDeleted(TaskPayload),
}

impl ServerMessage {
    pub fn tasks_sync(tasks: Vec<TaskPayload>) -> Self {
        ServerMessage::TasksSync { tasks, skipped: 0 }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Pong => "pong",
            ServerMessage::TasksSync { .. } => "tasks_sync",
            ServerMessage::TaskCreated(_) => "task_created",
            ServerMessage::TaskUpdated(_) => "task_updated",
            ServerMessage::TaskDeleted(_) => "task_deleted",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let data = match self {
            ServerMessage::Pong => Value::String("ok".into()),
            ServerMessage::TasksSync { tasks, .. } => serde_json::to_value(tasks)?,
            ServerMessage::TaskCreated(task)
            | ServerMessage::TaskUpdated(task)
            | ServerMessage::TaskDeleted(task) => task_data(task)?,
        };
        Envelope::new(self.kind(), data).encode()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { kind, data } = serde_json::from_str(text)?;
        match kind.as_str() {
            "pong" => Ok(ServerMessage::Pong),
            "tasks_sync" => {
                let (tasks, skipped) = decode_task_list(&kind, data)?;
                Ok(ServerMessage::TasksSync { tasks, skipped })
            }
            "task_created" => Ok(ServerMessage::TaskCreated(decode_task(&kind, data)?)),
            "task_updated" => Ok(ServerMessage::TaskUpdated(decode_task(&kind, data)?)),
            "task_deleted" => Ok(ServerMessage::TaskDeleted(decode_task(&kind, data)?)),
            _ => Err(ProtocolError::UnknownType(kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_has_no_data() {
        let encoded = ClientMessage::Ping.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, json!({"type": "ping"}));
    }

    #[test]
    fn test_pong_with_ok_data() {
        let msg = ServerMessage::decode(r#"{"type":"pong","data":"ok"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Pong);
        let msg = ServerMessage::decode(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Pong);
    }

    #[test]
    fn test_task_created_decodes_snake_case_fields() {
        let text = json!({
            "type": "task_created",
            "data": {
                "id": "task_1717000000",
                "user_id": "default_user",
                "title": "Piano practice",
                "description": "",
                "due_date": "2024-05-01T10:00:00Z",
                "is_completed": false,
                "category": "学习",
                "priority": 2,
                "device_id": "ipad",
                "record_id": "rec-1",
                "created_at": "2024-05-01 08:00:00",
                "updated_at": "2024-05-01 08:00:00"
            }
        })
        .to_string();

        let ServerMessage::TaskCreated(task) = ServerMessage::decode(&text).unwrap() else {
            panic!("expected task_created");
        };
        assert_eq!(task.id, Some(RemoteId::Text("task_1717000000".into())));
        assert_eq!(task.title, "Piano practice");
        assert_eq!(task.priority, Some(2));
        assert_eq!(task.record_id(), Some("rec-1"));
        assert_eq!(task.work_progress, None);
    }

    #[test]
    fn test_nulls_fall_back_to_defaults() {
        let text = r#"{"type":"task_updated","data":{"title":null,"is_completed":null,"device_id":"ipad","record_id":""}}"#;
        let ServerMessage::TaskUpdated(task) = ServerMessage::decode(text).unwrap() else {
            panic!("expected task_updated");
        };
        assert_eq!(task.title, "");
        assert!(!task.is_completed);
        assert_eq!(task.record_id(), None);
    }

    #[test]
    fn test_tasks_sync_skips_bad_entries() {
        let text = json!({
            "type": "tasks_sync",
            "data": [
                {"title": "a", "device_id": "d1", "record_id": "r1"},
                "not a task",
                {"title": "b", "device_id": "d1", "is_completed": "yes"},
                {"title": "c", "device_id": "d2", "record_id": "r3"}
            ]
        })
        .to_string();

        let ServerMessage::TasksSync { tasks, skipped } = ServerMessage::decode(&text).unwrap() else {
            panic!("expected tasks_sync");
        };
        let titles: Vec<_> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "c"]);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_tasks_sync_null_is_empty() {
        let msg = ServerMessage::decode(r#"{"type":"tasks_sync","data":null}"#).unwrap();
        assert_eq!(msg, ServerMessage::tasks_sync(Vec::new()));
    }

    fn decode_created(data: Value) -> TaskPayload {
        let text = json!({"type": "task_created", "data": data}).to_string();
        let ServerMessage::TaskCreated(task) = ServerMessage::decode(&text).unwrap() else {
            panic!("expected task_created");
        };
        task
    }

    #[test]
    fn test_priority_accepts_numbers_and_numeric_strings() {
        let cases = [
            (json!(2), Some(2)),
            (json!("2"), Some(2)),
            (json!(" 3 "), Some(3)),
            (json!(2.0), Some(2)),
            (json!(2.9), Some(2)),
            (json!("high"), None),
            (json!("2.5"), None),
            (json!([2]), None),
            (json!(true), None),
            (json!(null), None),
            (json!(1e12), None),
        ];
        for (priority, expected) in cases {
            let task = decode_created(json!({"title": "t", "priority": priority.clone()}));
            assert_eq!(task.priority, expected, "priority {priority}");
        }
    }

    #[test]
    fn test_remote_id_accepts_any_number_or_string() {
        let cases = [
            (json!(7), Some(RemoteId::Number(7))),
            (json!(1.5), Some(RemoteId::Number(1))),
            (json!("task_1"), Some(RemoteId::Text("task_1".into()))),
            (json!({"oid": 1}), None),
            (json!(false), None),
        ];
        for (id, expected) in cases {
            let task = decode_created(json!({"title": "t", "id": id.clone()}));
            assert_eq!(task.id, expected, "id {id}");
        }
    }

    #[test]
    fn test_mistyped_priority_keeps_snapshot_entry() {
        let text = json!({
            "type": "tasks_sync",
            "data": [{"title": "a", "device_id": "d1", "record_id": "r1", "priority": "2"}]
        })
        .to_string();

        let ServerMessage::TasksSync { tasks, skipped } = ServerMessage::decode(&text).unwrap() else {
            panic!("expected tasks_sync");
        };
        assert_eq!(skipped, 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, Some(2));
    }

    #[test]
    fn test_unknown_and_malformed() {
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"reboot"}"#),
            Err(ProtocolError::UnknownType(kind)) if kind == "reboot"
        ));
        assert!(matches!(
            ServerMessage::decode("{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"data":[]}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"task_deleted","data":[1,2]}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_client_messages_are_not_server_messages() {
        let encoded = ClientMessage::Ping.encode().unwrap();
        assert!(matches!(
            ServerMessage::decode(&encoded),
            Err(ProtocolError::UnknownType(_))
        ));
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), ClientMessage::Ping);
    }
}
