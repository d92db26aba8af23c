// Deterministic stream id derivation.
//
// Independent processes must agree on the stream a producer writes to without
// coordinating, so every id is a pure function of the producing context.

use uuid::Uuid;

pub const MAX_STREAM_ID_LEN: usize = 255;

/// Prefix of the per-object lock and presence streams.
pub const OBJECT_STREAM_PREFIX: &str = "lock_";

/// Business entities whose updates are published on a per-entity stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Organization,
    Folder,
    Usecase,
}

impl EntityKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Folder => "folder",
            Self::Usecase => "usecase",
        }
    }
}

/// A stream that carries the generation of one assistant message.
pub fn for_message(message_id: &str) -> String {
    message_id.to_owned()
}

pub fn for_job(job_id: &str) -> String {
    format!("job_{job_id}")
}

pub fn for_entity(kind: EntityKind, entity_id: &str) -> String {
    format!("{}_{entity_id}", kind.as_str())
}

/// Lock and presence notifications for one object share a stream.
pub fn for_object(workspace_id: Uuid, object_type: &str, object_id: &str) -> String {
    format!("{OBJECT_STREAM_PREFIX}{workspace_id}_{object_type}_{object_id}")
}

pub fn is_object_stream(stream_id: &str) -> bool {
    stream_id.starts_with(OBJECT_STREAM_PREFIX)
}

pub fn fresh() -> String {
    Uuid::new_v4().to_string()
}

/// Picks the message stream, then the job stream, then a fresh id.
pub fn derive(message_id: Option<&str>, job_id: Option<&str>) -> String {
    match (non_empty(message_id), non_empty(job_id)) {
        (Some(message_id), _) => for_message(message_id),
        (None, Some(job_id)) => for_job(job_id),
        (None, None) => fresh(),
    }
}

pub fn validate(stream_id: &str) -> Result<(), StreamIdError> {
    if stream_id.is_empty() {
        return Err(StreamIdError::Empty);
    }
    if stream_id.len() > MAX_STREAM_ID_LEN {
        return Err(StreamIdError::TooLong(stream_id.len()));
    }
    if stream_id.chars().any(|ch| ch.is_whitespace() || ch.is_control()) {
        return Err(StreamIdError::InvalidCharacter);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamIdError {
    #[error("stream id must not be empty")]
    Empty,
    #[error("stream id is {0} bytes; the limit is 255")]
    TooLong(usize),
    #[error("stream id must not contain whitespace or control characters")]
    InvalidCharacter,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
