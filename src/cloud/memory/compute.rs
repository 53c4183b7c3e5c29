use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cloud::compute::{
    ComputeProvider, Instance, InstanceFilter, InstanceState, LaunchRequest, MachineImage,
    SpotPrice,
};
use crate::error::ComputeError;

const DEFAULT_ZONE: &str = "local-1a";
const WAIT_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct State {
    instances: BTreeMap<String, Instance>,
    images: Vec<MachineImage>,
    spot_prices: Vec<(String, SpotPrice)>,
    terminate_calls: Vec<Vec<String>>,
}

/// In-memory compute provider.
///
/// Launched instances start `pending` and only move when driven with
/// [`MemoryCompute::set_state`]. Terminating a live instance moves it to
/// `shutting-down`; the next describe reports it `terminated`.
#[derive(Default)]
pub struct MemoryCompute {
    state: Mutex<State>,
}

impl MemoryCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_image(&self, image: MachineImage) {
        self.state.lock().await.images.push(image);
    }

    pub async fn add_spot_price(&self, instance_type: &str, price: SpotPrice) {
        self.state
            .lock()
            .await
            .spot_prices
            .push((instance_type.to_string(), price));
    }

    /// Force an instance into a state.
    pub async fn set_state(&self, id: &str, state: InstanceState) -> Result<(), ComputeError> {
        let mut guard = self.state.lock().await;
        let instance = guard
            .instances
            .get_mut(id)
            .ok_or_else(|| ComputeError::InstanceNotFound { id: id.to_string() })?;
        debug!(instance = %id, from = %instance.state, to = %state, "Instance state forced");
        instance.state = state;
        Ok(())
    }

    pub async fn state_of(&self, id: &str) -> Option<InstanceState> {
        self.state.lock().await.instances.get(id).map(|i| i.state)
    }

    /// All instances, in id order.
    pub async fn instances(&self) -> Vec<Instance> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    /// Id lists passed to `terminate`, one entry per call.
    pub async fn terminate_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().await.terminate_calls.clone()
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() || !name.ends_with(last)
    {
        return false;
    }
    let mut rest = &name[first.len()..name.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    true
}

#[async_trait]
impl ComputeProvider for MemoryCompute {
    async fn latest_image(&self, name_pattern: &str) -> Result<MachineImage, ComputeError> {
        self.state
            .lock()
            .await
            .images
            .iter()
            .filter(|image| matches_pattern(name_pattern, &image.name))
            .max_by_key(|image| image.created)
            .cloned()
            .ok_or_else(|| ComputeError::NoImage {
                pattern: name_pattern.to_string(),
            })
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<Vec<Instance>, ComputeError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let mut launched = Vec::with_capacity(request.count);
        for _ in 0..request.count {
            let id = loop {
                let candidate = format!("i-{:017x}", rng.r#gen::<u64>() >> 4);
                if !state.instances.contains_key(&candidate) {
                    break candidate;
                }
            };
            let instance = Instance {
                id: id.clone(),
                state: InstanceState::Pending,
                instance_type: request.instance_type.clone(),
                availability_zone: DEFAULT_ZONE.to_string(),
                launch_time: now,
                user_data: request.user_data.clone(),
            };
            state.instances.insert(id, instance.clone());
            launched.push(instance);
        }
        Ok(launched)
    }

    async fn wait_until_exist(
        &self,
        ids: &[String],
        timeout: Duration,
    ) -> Result<(), ComputeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                if ids.iter().all(|id| state.instances.contains_key(id)) {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ComputeError::WaitTimedOut { timeout });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn describe(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, ComputeError> {
        let mut state = self.state.lock().await;
        let selected: Vec<String> = match filter {
            InstanceFilter::Ids(ids) => {
                if let Some(id) = ids.iter().find(|id| !state.instances.contains_key(*id)) {
                    return Err(ComputeError::InstanceNotFound { id: id.clone() });
                }
                ids.clone()
            }
            InstanceFilter::States(_) => state.instances.keys().cloned().collect(),
        };

        let mut described = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(instance) = state.instances.get_mut(&id) {
                let observed = instance.clone();
                // Shutdown completes once it has been observed.
                if instance.state == InstanceState::ShuttingDown {
                    instance.state = InstanceState::Terminated;
                }
                described.push(observed);
            }
        }

        if let InstanceFilter::States(states) = filter {
            described.retain(|i| states.contains(&i.state));
        }
        Ok(described)
    }

    async fn terminate(&self, ids: &[String]) -> Result<(), ComputeError> {
        let mut state = self.state.lock().await;
        if let Some(id) = ids.iter().find(|id| !state.instances.contains_key(*id)) {
            return Err(ComputeError::InstanceNotFound { id: id.clone() });
        }
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                if !matches!(
                    instance.state,
                    InstanceState::ShuttingDown | InstanceState::Terminated
                ) {
                    instance.state = InstanceState::ShuttingDown;
                }
            }
        }
        state.terminate_calls.push(ids.to_vec());
        Ok(())
    }

    async fn spot_price_history(
        &self,
        instance_type: &str,
        availability_zone: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SpotPrice>, ComputeError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&SpotPrice> = state
            .spot_prices
            .iter()
            .filter(|(ty, p)| {
                ty == instance_type
                    && availability_zone.is_none_or(|zone| zone == p.availability_zone)
                    && p.timestamp <= end
            })
            .map(|(_, p)| p)
            .collect();
        matching.sort_by_key(|p| p.timestamp);

        // Keep the sample in effect at `start` plus everything inside the window.
        let in_effect = matching.iter().rposition(|p| p.timestamp <= start).unwrap_or(0);
        Ok(matching[in_effect..].iter().map(|p| (*p).clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(count: usize) -> LaunchRequest {
        LaunchRequest {
            name: "worker".into(),
            image_id: "ami-1".into(),
            instance_type: "g4dn.xlarge".into(),
            security_group: "sg".into(),
            iam_instance_profile: None,
            key_name: None,
            user_data: None,
            count,
            market: Default::default(),
            terminate_on_shutdown: true,
        }
    }

    #[test]
    fn wildcard_patterns() {
        assert!(matches_pattern("amzn2-ami-graphics-hvm-*", "amzn2-ami-graphics-hvm-2.0.2023"));
        assert!(matches_pattern("a*b*c", "a-x-b-y-c"));
        assert!(!matches_pattern("a*b*c", "a-x-c"));
        assert!(matches_pattern("exact", "exact"));
        assert!(!matches_pattern("exact", "exactly"));
    }

    #[tokio::test]
    async fn terminate_passes_through_shutting_down() {
        let compute = MemoryCompute::new();
        let ids: Vec<String> = compute
            .launch(&request(2))
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        compute.set_state(&ids[0], InstanceState::Running).await.unwrap();
        compute.terminate(&ids[..1]).await.unwrap();

        let filter = InstanceFilter::Ids(ids.clone());
        let first = compute.describe(&filter).await.unwrap();
        assert_eq!(first[0].state, InstanceState::ShuttingDown);
        let second = compute.describe(&filter).await.unwrap();
        assert_eq!(second[0].state, InstanceState::Terminated);
        assert_eq!(second[1].state, InstanceState::Pending);
    }

    #[tokio::test]
    async fn waiting_for_unknown_instances_times_out() {
        let compute = MemoryCompute::new();
        let launched = compute.launch(&request(1)).await.unwrap();
        compute
            .wait_until_exist(&[launched[0].id.clone()], Duration::from_millis(10))
            .await
            .unwrap();

        let err = compute
            .wait_until_exist(&["i-missing".to_string()], Duration::from_millis(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ComputeError::WaitTimedOut { .. }));
    }

    #[tokio::test]
    async fn describe_by_state() {
        let compute = MemoryCompute::new();
        let launched = compute.launch(&request(3)).await.unwrap();
        compute
            .set_state(&launched[1].id, InstanceState::Terminated)
            .await
            .unwrap();
        let live = compute
            .describe(&InstanceFilter::States(vec![InstanceState::Pending]))
            .await
            .unwrap();
        assert_eq!(live.len(), 2);
    }

    #[tokio::test]
    async fn price_history_includes_sample_in_effect() {
        let compute = MemoryCompute::new();
        let start = Utc::now();
        for (offset, price) in [(-120, dec!(0.30)), (-60, dec!(0.25)), (30, dec!(0.27))] {
            compute
                .add_spot_price(
                    "g4dn.xlarge",
                    SpotPrice {
                        timestamp: start + chrono::Duration::seconds(offset),
                        price,
                        availability_zone: DEFAULT_ZONE.into(),
                    },
                )
                .await;
        }
        let history = compute
            .spot_price_history("g4dn.xlarge", None, start, start + chrono::Duration::hours(1))
            .await
            .unwrap();
        let prices: Vec<_> = history.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![dec!(0.25), dec!(0.27)]);
    }
}
