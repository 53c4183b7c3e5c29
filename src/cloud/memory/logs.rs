use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cloud::logs::{CreateMode, InputLogEvent, LogEvent, LogPage, LogService};
use crate::error::LogError;

/// Default number of events per filtered page.
const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Default)]
struct Stream {
    events: Vec<(u64, LogEvent)>,
    sequence: Option<String>,
}

#[derive(Default)]
struct Group {
    streams: BTreeMap<String, Stream>,
}

#[derive(Default)]
struct State {
    groups: HashMap<String, Group>,
    /// Global arrival counter, used to order events sharing a timestamp.
    arrivals: u64,
}

/// In-memory log service with sequence tokens and paginated filtering.
pub struct MemoryLogService {
    state: Mutex<State>,
    page_size: usize,
}

impl Default for MemoryLogService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogService {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: page_size.max(1),
        }
    }

    /// Every message in a group, in arrival order.
    pub async fn messages(&self, group: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(g) = state.groups.get(group) else {
            return Vec::new();
        };
        let mut all: Vec<&(u64, LogEvent)> =
            g.streams.values().flat_map(|s| s.events.iter()).collect();
        all.sort_by_key(|(arrival, _)| *arrival);
        all.into_iter().map(|(_, e)| e.message.clone()).collect()
    }
}

#[async_trait]
impl LogService for MemoryLogService {
    async fn create_group(
        &self,
        group: &str,
        _retention_days: u32,
        mode: CreateMode,
    ) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        if state.groups.contains_key(group) {
            return match mode {
                CreateMode::IgnoreExisting => Ok(()),
                CreateMode::FailIfExists => Err(LogError::AlreadyExists {
                    name: group.to_string(),
                }),
            };
        }
        state.groups.insert(group.to_string(), Group::default());
        Ok(())
    }

    async fn delete_group(&self, group: &str) -> Result<(), LogError> {
        self.state
            .lock()
            .await
            .groups
            .remove(group)
            .map(|_| ())
            .ok_or_else(|| LogError::NotFound {
                name: group.to_string(),
            })
    }

    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, LogError> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .groups
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_stream(
        &self,
        group: &str,
        stream: &str,
        mode: CreateMode,
    ) -> Result<(), LogError> {
        let mut state = self.state.lock().await;
        let g = state.groups.get_mut(group).ok_or_else(|| LogError::NotFound {
            name: group.to_string(),
        })?;
        if g.streams.contains_key(stream) {
            return match mode {
                CreateMode::IgnoreExisting => Ok(()),
                CreateMode::FailIfExists => Err(LogError::AlreadyExists {
                    name: format!("{group}/{stream}"),
                }),
            };
        }
        g.streams.insert(stream.to_string(), Stream::default());
        Ok(())
    }

    async fn put_event(
        &self,
        group: &str,
        stream: &str,
        event: InputLogEvent,
        sequence_token: Option<&str>,
    ) -> Result<String, LogError> {
        let mut state = self.state.lock().await;
        state.arrivals += 1;
        let arrival = state.arrivals;

        let s = state
            .groups
            .get_mut(group)
            .and_then(|g| g.streams.get_mut(stream))
            .ok_or_else(|| LogError::NotFound {
                name: format!("{group}/{stream}"),
            })?;

        if s.sequence.as_deref() != sequence_token {
            return Err(LogError::InvalidSequenceToken {
                expected: s.sequence.clone(),
            });
        }

        s.events.push((
            arrival,
            LogEvent {
                timestamp: event.timestamp,
                event_id: Uuid::new_v4().to_string(),
                stream_name: stream.to_string(),
                message: event.message,
            },
        ));
        let next = Uuid::new_v4().simple().to_string();
        s.sequence = Some(next.clone());
        Ok(next)
    }

    async fn filter_events(
        &self,
        group: &str,
        start_time: i64,
        next_token: Option<&str>,
    ) -> Result<LogPage, LogError> {
        let state = self.state.lock().await;
        let g = state.groups.get(group).ok_or_else(|| LogError::NotFound {
            name: group.to_string(),
        })?;

        // Pages follow arrival order and the token is the last arrival handed
        // out. Each page is then sorted by timestamp.
        let after = match next_token {
            Some(token) => Some(
                token
                    .parse::<u64>()
                    .map_err(|_| LogError::Service(format!("malformed next token {token}")))?,
            ),
            None => None,
        };

        let mut window: Vec<&(u64, LogEvent)> = g
            .streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|(arrival, e)| e.timestamp >= start_time && after.is_none_or(|a| *arrival > a))
            .collect();
        window.sort_by_key(|(arrival, _)| *arrival);

        let mut page: Vec<&(u64, LogEvent)> = window.iter().take(self.page_size).copied().collect();
        let next_token = match page.last() {
            Some((arrival, _)) if page.len() < window.len() => Some(arrival.to_string()),
            _ => None,
        };
        page.sort_by_key(|(arrival, e)| (e.timestamp, *arrival));
        let events: Vec<LogEvent> = page.into_iter().map(|(_, e)| e.clone()).collect();

        Ok(LogPage { events, next_token })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::logs::LogTail;

    fn event(timestamp: i64, message: &str) -> InputLogEvent {
        InputLogEvent {
            timestamp,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn sequence_tokens_are_enforced() {
        let logs = MemoryLogService::new();
        logs.create_group("g", 1, CreateMode::IgnoreExisting).await.unwrap();
        logs.create_stream("g", "s", CreateMode::IgnoreExisting).await.unwrap();

        let token = logs.put_event("g", "s", event(1, "a"), None).await.unwrap();
        let err = logs.put_event("g", "s", event(2, "b"), None).await.unwrap_err();
        match err {
            LogError::InvalidSequenceToken { expected } => assert_eq!(expected, Some(token.clone())),
            other => panic!("unexpected {other:?}"),
        }
        logs.put_event("g", "s", event(2, "b"), Some(&token)).await.unwrap();
        assert_eq!(logs.messages("g").await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn create_modes() {
        let logs = MemoryLogService::new();
        logs.create_group("g", 1, CreateMode::IgnoreExisting).await.unwrap();
        logs.create_group("g", 1, CreateMode::IgnoreExisting).await.unwrap();
        assert!(matches!(
            logs.create_group("g", 1, CreateMode::FailIfExists).await,
            Err(LogError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn filter_paginates() {
        let logs = MemoryLogService::with_page_size(2);
        logs.create_group("g", 1, CreateMode::IgnoreExisting).await.unwrap();
        logs.create_stream("g", "s", CreateMode::IgnoreExisting).await.unwrap();
        let mut token = None;
        for (ts, msg) in [(10, "a"), (20, "b"), (30, "c")] {
            token = Some(logs.put_event("g", "s", event(ts, msg), token.as_deref()).await.unwrap());
        }

        let first = logs.filter_events("g", 15, None).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert!(first.next_token.is_none());

        let first = logs.filter_events("g", 0, None).await.unwrap();
        assert_eq!(first.events.len(), 2);
        let second = logs
            .filter_events("g", 0, first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].message, "c");
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn events_arriving_between_pages_are_not_skipped() {
        let logs = Arc::new(MemoryLogService::with_page_size(2));
        logs.create_group("g", 1, CreateMode::IgnoreExisting).await.unwrap();
        for stream in ["a", "b"] {
            logs.create_stream("g", stream, CreateMode::IgnoreExisting).await.unwrap();
        }
        let mut token = None;
        for ts in [10, 20, 30] {
            token = Some(
                logs.put_event("g", "a", event(ts, &format!("a{ts}")), token.as_deref())
                    .await
                    .unwrap(),
            );
        }

        let mut tail = LogTail::starting_at(logs.clone(), "g", 0);
        let mut got: Vec<String> = tail.poll().await.unwrap().into_iter().map(|e| e.message).collect();
        assert!(tail.continuation_token().is_some());

        logs.put_event("g", "b", event(12, "b12"), None).await.unwrap();
        for _ in 0..4 {
            got.extend(tail.poll().await.unwrap().into_iter().map(|e| e.message));
        }

        got.sort();
        assert_eq!(got, vec!["a10", "a20", "a30", "b12"]);
    }
}
