//! Append-only logger for one worker's stream.
//!
//! The log service hands back a sequence token with every append and wants
//! it on the next one. A second writer on the same stream (or a restarted
//! worker) holds a stale token; the service rejects the append and says
//! which token it expected, and the append is retried with that token.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::cloud::{CreateMode, InputLogEvent, LogService};
use crate::error::LogError;

/// Retries after the first attempt when the sequence token is stale.
const MAX_RETRIES: u32 = 2;

/// Retention applied to groups created by a logger.
pub const RETENTION_DAYS: u32 = 1;

pub struct StreamLogger {
    service: Arc<dyn LogService>,
    group: String,
    stream: String,
    sequence: Option<String>,
}

impl StreamLogger {
    /// Create the group and stream if needed and return a logger for them.
    pub async fn open(
        service: Arc<dyn LogService>,
        group: impl Into<String>,
        stream: impl Into<String>,
    ) -> Result<Self, LogError> {
        let group = group.into();
        let stream = stream.into();
        service
            .create_group(&group, RETENTION_DAYS, CreateMode::IgnoreExisting)
            .await?;
        service
            .create_stream(&group, &stream, CreateMode::IgnoreExisting)
            .await?;
        Ok(Self {
            service,
            group,
            stream,
            sequence: None,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append one message stamped with the current time.
    pub async fn info(&mut self, message: impl Into<String>) -> Result<(), LogError> {
        let event = InputLogEvent {
            timestamp: Utc::now().timestamp_millis(),
            message: message.into(),
        };

        let mut attempts = 0;
        while attempts <= MAX_RETRIES {
            attempts += 1;
            let result = self
                .service
                .put_event(&self.group, &self.stream, event.clone(), self.sequence.as_deref())
                .await;
            match result {
                Ok(next) => {
                    self.sequence = Some(next);
                    return Ok(());
                }
                Err(LogError::InvalidSequenceToken { expected }) => {
                    debug!(stream = %self.stream, "Stale sequence token, retrying");
                    self.sequence = expected;
                }
                Err(e) => return Err(e),
            }
        }

        warn!(stream = %self.stream, attempts, "Giving up on log append");
        Err(LogError::RetriesExhausted {
            stream: self.stream.clone(),
            attempts,
        })
    }
}
