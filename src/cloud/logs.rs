//! Log service: groups of append-only streams with time-window filtering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LogError;

/// What to do when a group or stream being created already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CreateMode {
    /// Swallow "already exists".
    #[default]
    IgnoreExisting,
    /// Surface "already exists" as [`LogError::AlreadyExists`].
    FailIfExists,
}

/// An event to append. `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLogEvent {
    pub timestamp: i64,
    pub message: String,
}

/// An event as returned by filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: i64,
    pub event_id: String,
    pub stream_name: String,
    pub message: String,
}

/// One page of filtered events.
#[derive(Debug, Clone, Default)]
pub struct LogPage {
    pub events: Vec<LogEvent>,
    /// Present while more of the requested window remains.
    pub next_token: Option<String>,
}

#[async_trait]
pub trait LogService: Send + Sync {
    async fn create_group(
        &self,
        group: &str,
        retention_days: u32,
        mode: CreateMode,
    ) -> Result<(), LogError>;

    async fn delete_group(&self, group: &str) -> Result<(), LogError>;

    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, LogError>;

    async fn create_stream(&self, group: &str, stream: &str, mode: CreateMode)
        -> Result<(), LogError>;

    /// Append one event. `sequence_token` must be absent for a stream's first
    /// event and equal to the last returned token afterwards. Returns the
    /// token for the next append.
    async fn put_event(
        &self,
        group: &str,
        stream: &str,
        event: InputLogEvent,
        sequence_token: Option<&str>,
    ) -> Result<String, LogError>;

    /// Events across all streams of `group` with `timestamp >= start_time`.
    async fn filter_events(
        &self,
        group: &str,
        start_time: i64,
        next_token: Option<&str>,
    ) -> Result<LogPage, LogError>;
}
