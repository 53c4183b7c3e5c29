//! Launching the worker fleet.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cloud::{ComputeProvider, LaunchRequest, MachineImage, MarketType};
use crate::error::ComputeError;

/// How long to wait for launched instances to become visible.
const EXIST_TIMEOUT: Duration = Duration::from_secs(300);

/// What to launch. The image is resolved from `image_pattern` at launch time.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    pub name: String,
    pub image_pattern: String,
    pub instance_type: String,
    pub security_group: String,
    pub iam_instance_profile: Option<String>,
    pub key_name: Option<String>,
    pub user_data: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct LaunchedFleet {
    pub instance_ids: Vec<String>,
    pub launched_at: DateTime<Utc>,
    pub image: MachineImage,
    /// Zone of the first instance, used for price lookups.
    pub availability_zone: Option<String>,
}

/// Launch `spec.count` spot instances from the newest matching image and
/// wait until all of them exist.
///
/// Instances terminate rather than stop when they shut themselves down.
pub async fn launch_fleet(
    compute: &dyn ComputeProvider,
    spec: &FleetSpec,
) -> Result<LaunchedFleet, ComputeError> {
    let image = compute.latest_image(&spec.image_pattern).await?;
    let age_days = (Utc::now() - image.created).num_days();
    info!(
        image = %image.name,
        description = %image.description,
        created = %image.created,
        age_days,
        "Using image"
    );

    let request = LaunchRequest {
        name: spec.name.clone(),
        image_id: image.id.clone(),
        instance_type: spec.instance_type.clone(),
        security_group: spec.security_group.clone(),
        iam_instance_profile: spec.iam_instance_profile.clone(),
        key_name: spec.key_name.clone(),
        user_data: Some(spec.user_data.clone()),
        count: spec.count,
        market: MarketType::Spot,
        terminate_on_shutdown: true,
    };
    let launched_at = Utc::now();
    let instances = compute.launch(&request).await?;
    let instance_ids: Vec<String> = instances.iter().map(|i| i.id.clone()).collect();
    compute.wait_until_exist(&instance_ids, EXIST_TIMEOUT).await?;

    info!(
        count = instance_ids.len(),
        instance_type = %spec.instance_type,
        "Launched spot instances"
    );

    Ok(LaunchedFleet {
        availability_zone: instances.first().map(|i| i.availability_zone.clone()),
        instance_ids,
        launched_at,
        image,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::cloud::InstanceState;
    use crate::cloud::memory::MemoryCompute;

    fn spec(count: usize) -> FleetSpec {
        FleetSpec {
            name: "render-job-worker-1".into(),
            image_pattern: "graphics-*".into(),
            instance_type: "g4dn.xlarge".into(),
            security_group: "sg".into(),
            iam_instance_profile: None,
            key_name: None,
            user_data: "BUCKET=b\n".into(),
            count,
        }
    }

    fn image(id: &str, name: &str, days_old: i64) -> MachineImage {
        MachineImage {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            created: Utc::now() - ChronoDuration::days(days_old),
        }
    }

    #[tokio::test]
    async fn launches_from_newest_matching_image() {
        let compute = MemoryCompute::new();
        compute.add_image(image("ami-old", "graphics-1", 30)).await;
        compute.add_image(image("ami-new", "graphics-2", 2)).await;
        compute.add_image(image("ami-other", "kernel-9", 0)).await;

        let fleet = launch_fleet(&compute, &spec(3)).await.unwrap();
        assert_eq!(fleet.image.id, "ami-new");
        assert_eq!(fleet.instance_ids.len(), 3);

        for instance in compute.instances().await {
            assert_eq!(instance.state, InstanceState::Pending);
            assert_eq!(instance.user_data.as_deref(), Some("BUCKET=b\n"));
        }
    }

    #[tokio::test]
    async fn no_matching_image() {
        let compute = MemoryCompute::new();
        assert!(matches!(
            launch_fleet(&compute, &spec(1)).await,
            Err(ComputeError::NoImage { .. })
        ));
        assert!(compute.instances().await.is_empty());
    }
}
