// Stream event types for the tandem-events.v1 push protocol.
//
// Every event is persisted as one `StreamEvent` row and pushed to clients as one
// named SSE frame whose name is the event type tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::{Lock, PresenceEntry};

pub const PROTOCOL_VERSION: &str = "tandem-events.v1";

/// Typed payload of a stream event, keyed by its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    JobUpdate(JobUpdate),
    OrganizationUpdate(EntityUpdate),
    FolderUpdate(EntityUpdate),
    UsecaseUpdate(EntityUpdate),
    LockUpdate(LockUpdate),
    PresenceUpdate(PresenceUpdate),
    Status(StatusUpdate),
    ReasoningDelta(TextDelta),
    ToolCallStart(ToolCallStart),
    ToolCallDelta(ToolCallDelta),
    ToolCallResult(ToolCallResult),
    ContentDelta(TextDelta),
    Error(StreamFailure),
    Done(Done),
    Ping(Heartbeat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    JobUpdate,
    OrganizationUpdate,
    FolderUpdate,
    UsecaseUpdate,
    LockUpdate,
    PresenceUpdate,
    Status,
    ReasoningDelta,
    ToolCallStart,
    ToolCallDelta,
    ToolCallResult,
    ContentDelta,
    Error,
    Done,
    Ping,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        Self::JobUpdate,
        Self::OrganizationUpdate,
        Self::FolderUpdate,
        Self::UsecaseUpdate,
        Self::LockUpdate,
        Self::PresenceUpdate,
        Self::Status,
        Self::ReasoningDelta,
        Self::ToolCallStart,
        Self::ToolCallDelta,
        Self::ToolCallResult,
        Self::ContentDelta,
        Self::Error,
        Self::Done,
        Self::Ping,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JobUpdate => "job_update",
            Self::OrganizationUpdate => "organization_update",
            Self::FolderUpdate => "folder_update",
            Self::UsecaseUpdate => "usecase_update",
            Self::LockUpdate => "lock_update",
            Self::PresenceUpdate => "presence_update",
            Self::Status => "status",
            Self::ReasoningDelta => "reasoning_delta",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallDelta => "tool_call_delta",
            Self::ToolCallResult => "tool_call_result",
            Self::ContentDelta => "content_delta",
            Self::Error => "error",
            Self::Done => "done",
            Self::Ping => "ping",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event_type| event_type.as_str() == value)
    }

    /// Types whose latest value is kept as a per-entity snapshot by clients.
    pub const fn is_snapshot(self) -> bool {
        matches!(
            self,
            Self::JobUpdate
                | Self::OrganizationUpdate
                | Self::FolderUpdate
                | Self::UsecaseUpdate
                | Self::LockUpdate
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::JobUpdate(_) => EventType::JobUpdate,
            Self::OrganizationUpdate(_) => EventType::OrganizationUpdate,
            Self::FolderUpdate(_) => EventType::FolderUpdate,
            Self::UsecaseUpdate(_) => EventType::UsecaseUpdate,
            Self::LockUpdate(_) => EventType::LockUpdate,
            Self::PresenceUpdate(_) => EventType::PresenceUpdate,
            Self::Status(_) => EventType::Status,
            Self::ReasoningDelta(_) => EventType::ReasoningDelta,
            Self::ToolCallStart(_) => EventType::ToolCallStart,
            Self::ToolCallDelta(_) => EventType::ToolCallDelta,
            Self::ToolCallResult(_) => EventType::ToolCallResult,
            Self::ContentDelta(_) => EventType::ContentDelta,
            Self::Error(_) => EventType::Error,
            Self::Done(_) => EventType::Done,
            Self::Ping(_) => EventType::Ping,
        }
    }

    /// Rebuilds a payload from its tag and the JSON found in `data`.
    pub fn from_parts(event_type: &str, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(json!({ "type": event_type, "data": data }))
    }

    /// The `data` half of the tagged representation.
    pub fn data(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate {
    pub id: String,
    pub action: EntityAction,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Acquired,
    Refreshed,
    Released,
    UnlockRequested,
    Transferred,
    ForceUnlocked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockUpdate {
    pub object_type: String,
    pub object_id: String,
    pub action: LockAction,
    /// Lock state after the transition; `None` once the object is unlocked.
    pub lock: Option<Lock>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub object_type: String,
    pub object_id: String,
    pub users: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextDelta {
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallStart {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDelta {
    pub tool_call_id: String,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_call_id: String,
    #[serde(default)]
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Done {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

/// One immutable, sequenced record of the stream event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stream_id: String,
    pub sequence: i64,
    pub workspace_id: Uuid,
    pub event: EventPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Splits the record into an SSE event name and its JSON frame.
    pub fn to_frame(&self) -> Result<(EventType, SseFrame), serde_json::Error> {
        Ok((
            self.event_type(),
            SseFrame {
                stream_id: self.stream_id.clone(),
                sequence: self.sequence,
                workspace_id: self.workspace_id,
                message_id: self.message_id.clone(),
                created_at: self.created_at,
                data: self.event.data()?,
            },
        ))
    }

    /// Reassembles a record from a named SSE frame's `event:` and `data:` lines.
    pub fn from_frame(event_name: &str, frame_json: &str) -> Result<Self, FrameError> {
        if EventType::parse(event_name).is_none() {
            return Err(FrameError::UnknownEvent(event_name.to_owned()));
        }

        let frame: SseFrame = serde_json::from_str(frame_json).map_err(FrameError::Frame)?;
        let event = EventPayload::from_parts(event_name, frame.data).map_err(FrameError::Payload)?;

        Ok(Self {
            stream_id: frame.stream_id,
            sequence: frame.sequence,
            workspace_id: frame.workspace_id,
            event,
            message_id: frame.message_id,
            created_at: frame.created_at,
        })
    }
}

/// JSON body of a pushed SSE frame; the event type travels as the SSE event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SseFrame {
    pub stream_id: String,
    pub sequence: i64,
    pub workspace_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown event type '{0}'")]
    UnknownEvent(String),
    #[error("malformed frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("payload does not match its event type: {0}")]
    Payload(#[source] serde_json::Error),
}
