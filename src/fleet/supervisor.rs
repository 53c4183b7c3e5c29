//! Fleet supervisor: the control loop from launch to full termination.
//!
//! Each iteration, in this order:
//! 1. pull new worker log events and publish them,
//! 2. describe the fleet and publish a summary when the states changed,
//!    stopping once every instance is terminated,
//! 3. until it first succeeds, check whether the frame queue is empty and, if
//!    so, terminate the instances still running (they can only be working on
//!    frames somebody else already finished),
//! 4. sleep.
//!
//! Logs go out first so remote timestamps are not interleaved with local
//! status lines. Service failures abort the loop; re-running it later picks
//! up whatever state the fleet and queue were left in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cloud::{ComputeProvider, InstanceFilter, InstanceState, LogEvent};
use crate::error::Result;
use crate::fleet::state::{FleetSnapshot, summarize};
use crate::logs::LogTail;
use crate::queue::FrameQueue;

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the progress channel.
pub const EVENT_CAPACITY: usize = 1024;

/// Progress published by the supervisor.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// A worker log line not seen before.
    Log(LogEvent),
    /// The set of instance states differs from the previous poll.
    StatesChanged {
        at: DateTime<Utc>,
        counts: BTreeMap<InstanceState, usize>,
    },
    /// The queue drained; these running instances are being terminated.
    FramesComplete { terminating: Vec<String> },
    /// Every instance is terminated and the loop is exiting.
    AllTerminated,
}

/// What the loop observed by the time it exited.
#[derive(Debug, Clone)]
pub struct FleetOutcome {
    pub finished_at: DateTime<Utc>,
    pub polls: u64,
    /// Whether the queue was seen empty.
    pub frames_complete: bool,
    /// Instances terminated because the queue drained under them.
    pub terminated_early: Vec<String>,
}

pub struct FleetSupervisor {
    compute: Arc<dyn ComputeProvider>,
    queue: FrameQueue,
    tail: LogTail,
    instance_ids: Vec<String>,
    poll_interval: Duration,
    events: broadcast::Sender<FleetEvent>,
}

impl FleetSupervisor {
    pub fn new(
        compute: Arc<dyn ComputeProvider>,
        queue: FrameQueue,
        tail: LogTail,
        instance_ids: Vec<String>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
        Self {
            compute,
            queue,
            tail,
            instance_ids,
            poll_interval: DEFAULT_POLL_INTERVAL,
            events,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publish on an existing channel instead of a private one.
    pub fn with_events(mut self, events: broadcast::Sender<FleetEvent>) -> Self {
        self.events = events;
        self
    }

    /// Subscribe to progress events. Subscribe before calling [`run`](Self::run).
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: FleetEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run until every tracked instance is terminated.
    pub async fn run(mut self) -> Result<FleetOutcome> {
        if self.instance_ids.is_empty() {
            warn!("No instances to supervise");
            return Ok(FleetOutcome {
                finished_at: Utc::now(),
                polls: 0,
                frames_complete: false,
                terminated_early: Vec::new(),
            });
        }

        info!(
            instances = self.instance_ids.len(),
            interval_secs = self.poll_interval.as_secs_f64(),
            "Supervising fleet"
        );

        let filter = InstanceFilter::Ids(self.instance_ids.clone());
        let mut previous = FleetSnapshot::default();
        let mut awaiting_completion = true;
        let mut terminated_early = Vec::new();
        let mut polls = 0;

        loop {
            polls += 1;

            for event in self.tail.poll().await? {
                self.publish(FleetEvent::Log(event));
            }

            let instances = self.compute.describe(&filter).await?;
            let snapshot = FleetSnapshot::from_instances(&instances);
            if snapshot != previous {
                let counts = snapshot.counts();
                info!(instances = %summarize(&counts), "Fleet state changed");
                self.publish(FleetEvent::StatesChanged {
                    at: Utc::now(),
                    counts,
                });

                if snapshot.all_terminated(self.instance_ids.len()) {
                    info!("All instances have been terminated");
                    self.publish(FleetEvent::AllTerminated);
                    break;
                }
                previous = snapshot;
            }

            if awaiting_completion && self.queue.remaining_count().await? == 0 {
                awaiting_completion = false;
                let running = previous.ids_in(InstanceState::Running);
                info!(
                    running = running.len(),
                    "All frames rendered, terminating instances still running"
                );
                self.publish(FleetEvent::FramesComplete {
                    terminating: running.clone(),
                });
                if !running.is_empty() {
                    self.compute.terminate(&running).await?;
                }
                terminated_early = running;
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(FleetOutcome {
            finished_at: Utc::now(),
            polls,
            frames_complete: !awaiting_completion,
            terminated_early,
        })
    }
}
