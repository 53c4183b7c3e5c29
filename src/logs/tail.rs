//! Deduplicating tail over a log group.
//!
//! The log service may return the same event more than once: a new poll
//! restarts at the newest timestamp already seen, so everything stamped with
//! that millisecond comes back again. Event ids are remembered for the newest
//! timestamp only. Anything older is behind the cursor and cannot reappear.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::cloud::{LogEvent, LogService};
use crate::error::LogError;

/// How far back the first poll looks, to cover clock and propagation skew.
pub const DEFAULT_LOOKBACK: Duration = Duration::from_secs(60);

/// Cursor over one log group.
pub struct LogTail {
    service: Arc<dyn LogService>,
    group: String,
    start_time: i64,
    next_token: Option<String>,
    seen: HashMap<i64, HashSet<String>>,
}

impl LogTail {
    pub fn new(service: Arc<dyn LogService>, group: impl Into<String>) -> Self {
        Self::with_lookback(service, group, DEFAULT_LOOKBACK)
    }

    pub fn with_lookback(
        service: Arc<dyn LogService>,
        group: impl Into<String>,
        lookback: Duration,
    ) -> Self {
        let start_time = Utc::now().timestamp_millis() - lookback.as_millis() as i64;
        Self::starting_at(service, group, start_time)
    }

    /// Start from an explicit timestamp (milliseconds since the epoch).
    pub fn starting_at(
        service: Arc<dyn LogService>,
        group: impl Into<String>,
        start_time: i64,
    ) -> Self {
        Self {
            service,
            group: group.into(),
            start_time,
            next_token: None,
            seen: HashMap::new(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    /// Number of event ids currently remembered for deduplication.
    pub fn tracked_ids(&self) -> usize {
        self.seen.values().map(HashSet::len).sum()
    }

    /// Fetch one page and return the events not returned before, in the
    /// order the service delivered them.
    pub async fn poll(&mut self) -> Result<Vec<LogEvent>, LogError> {
        let page = self
            .service
            .filter_events(&self.group, self.start_time, self.next_token.as_deref())
            .await?;

        let mut fresh = Vec::new();
        for event in page.events {
            let ids = self.seen.entry(event.timestamp).or_default();
            if ids.insert(event.event_id.clone()) {
                fresh.push(event);
            }
        }

        let newest = self.seen.keys().max().copied();
        if let Some(newest) = newest {
            self.seen.retain(|timestamp, _| *timestamp == newest);
        }

        match page.next_token {
            Some(token) => self.next_token = Some(token),
            None => {
                if let Some(newest) = newest {
                    self.start_time = newest;
                }
                self.next_token = None;
            }
        }

        debug!(
            group = %self.group,
            fresh = fresh.len(),
            start_time = self.start_time,
            paged = self.next_token.is_some(),
            "Polled log events"
        );
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::cloud::{CreateMode, InputLogEvent, LogPage};

    /// Replays scripted pages and records the requests made.
    #[derive(Default)]
    struct ScriptedLogs {
        pages: Mutex<VecDeque<LogPage>>,
        requests: Mutex<Vec<(i64, Option<String>)>>,
    }

    impl ScriptedLogs {
        fn new(pages: Vec<LogPage>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                requests: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl LogService for ScriptedLogs {
        async fn create_group(&self, _: &str, _: u32, _: CreateMode) -> Result<(), LogError> {
            Ok(())
        }
        async fn delete_group(&self, _: &str) -> Result<(), LogError> {
            Ok(())
        }
        async fn list_groups(&self, _: &str) -> Result<Vec<String>, LogError> {
            Ok(Vec::new())
        }
        async fn create_stream(&self, _: &str, _: &str, _: CreateMode) -> Result<(), LogError> {
            Ok(())
        }
        async fn put_event(
            &self,
            _: &str,
            _: &str,
            _: InputLogEvent,
            _: Option<&str>,
        ) -> Result<String, LogError> {
            Ok(String::new())
        }
        async fn filter_events(
            &self,
            _group: &str,
            start_time: i64,
            next_token: Option<&str>,
        ) -> Result<LogPage, LogError> {
            self.requests
                .lock()
                .await
                .push((start_time, next_token.map(str::to_string)));
            Ok(self.pages.lock().await.pop_front().unwrap_or_default())
        }
    }

    fn event(timestamp: i64, id: &str) -> LogEvent {
        LogEvent {
            timestamp,
            event_id: id.to_string(),
            stream_name: "i-1".to_string(),
            message: format!("message {id}"),
        }
    }

    fn page(events: Vec<LogEvent>, next_token: Option<&str>) -> LogPage {
        LogPage {
            events,
            next_token: next_token.map(str::to_string),
        }
    }

    fn ids(events: &[LogEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_id.as_str()).collect()
    }

    #[tokio::test]
    async fn replayed_page_yields_each_event_once() {
        let same = vec![event(100, "a"), event(100, "b"), event(105, "c")];
        let logs = ScriptedLogs::new(vec![page(same.clone(), None), page(same, None)]);
        let mut tail = LogTail::starting_at(logs, "g", 0);

        let first = tail.poll().await.unwrap();
        let second = tail.poll().await.unwrap();
        assert_eq!(ids(&first), vec!["a", "b", "c"]);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn cursor_advances_to_newest_timestamp() {
        let logs = ScriptedLogs::new(vec![page(vec![event(120, "a"), event(250, "b")], None)]);
        let mut tail = LogTail::starting_at(logs.clone(), "g", 50);

        tail.poll().await.unwrap();
        assert_eq!(tail.start_time(), 250);
        assert_eq!(tail.continuation_token(), None);

        tail.poll().await.unwrap();
        let requests = logs.requests.lock().await.clone();
        assert_eq!(requests, vec![(50, None), (250, None)]);
    }

    #[tokio::test]
    async fn continuation_keeps_start_time() {
        let logs = ScriptedLogs::new(vec![
            page(vec![event(120, "a")], Some("more")),
            page(vec![event(130, "b")], None),
        ]);
        let mut tail = LogTail::starting_at(logs.clone(), "g", 50);

        tail.poll().await.unwrap();
        assert_eq!(tail.start_time(), 50);
        assert_eq!(tail.continuation_token(), Some("more"));

        tail.poll().await.unwrap();
        assert_eq!(tail.start_time(), 130);
        assert_eq!(tail.continuation_token(), None);

        let requests = logs.requests.lock().await.clone();
        assert_eq!(requests, vec![(50, None), (50, Some("more".to_string()))]);
    }

    #[tokio::test]
    async fn only_newest_timestamp_is_remembered() {
        let logs = ScriptedLogs::new(vec![
            page(vec![event(1, "a"), event(2, "b"), event(3, "c"), event(3, "d")], None),
            // Restarting at 3 returns c and d again along with a newcomer.
            page(vec![event(3, "c"), event(3, "d"), event(3, "e")], None),
        ]);
        let mut tail = LogTail::starting_at(logs, "g", 0);

        tail.poll().await.unwrap();
        assert_eq!(tail.tracked_ids(), 2);

        let second = tail.poll().await.unwrap();
        assert_eq!(ids(&second), vec!["e"]);
        assert_eq!(tail.tracked_ids(), 3);
    }

    #[tokio::test]
    async fn empty_page_leaves_cursor_alone() {
        let logs = ScriptedLogs::new(vec![]);
        let mut tail = LogTail::starting_at(logs, "g", 77);
        assert!(tail.poll().await.unwrap().is_empty());
        assert_eq!(tail.start_time(), 77);
    }

    #[tokio::test]
    async fn lookback_sets_initial_start() {
        let logs = ScriptedLogs::new(vec![]);
        let before = Utc::now().timestamp_millis();
        let tail = LogTail::new(logs, "g");
        let after = Utc::now().timestamp_millis();
        let lookback = DEFAULT_LOOKBACK.as_millis() as i64;
        assert!(tail.start_time() >= before - lookback);
        assert!(tail.start_time() <= after - lookback);
    }
}
