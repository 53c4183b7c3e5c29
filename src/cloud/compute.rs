//! Compute provisioning: launch, describe and terminate instances.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Stopped,
    Stopping,
    Terminated,
}

impl InstanceState {
    pub const ALL: [InstanceState; 6] = [
        Self::Pending,
        Self::Running,
        Self::ShuttingDown,
        Self::Stopped,
        Self::Stopping,
        Self::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Stopped => "stopped",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown instance state: {s}"))
    }
}

/// Pricing model for launched instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarketType {
    OnDemand,
    #[default]
    Spot,
}

/// Parameters for launching a batch of identical instances.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Value of the human-readable name tag.
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub security_group: String,
    pub iam_instance_profile: Option<String>,
    pub key_name: Option<String>,
    pub user_data: Option<String>,
    pub count: usize,
    pub market: MarketType,
    /// Instances terminate rather than stop when they shut themselves down.
    pub terminate_on_shutdown: bool,
}

/// A described instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub instance_type: String,
    pub availability_zone: String,
    pub launch_time: DateTime<Utc>,
    pub user_data: Option<String>,
}

/// Which instances to describe.
#[derive(Debug, Clone)]
pub enum InstanceFilter {
    Ids(Vec<String>),
    States(Vec<InstanceState>),
}

/// A bootable machine image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineImage {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: DateTime<Utc>,
}

/// One spot price sample (price per instance-hour).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotPrice {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub availability_zone: String,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Most recently created image whose name matches `name_pattern`
    /// (`*` wildcards).
    async fn latest_image(&self, name_pattern: &str) -> Result<MachineImage, ComputeError>;

    async fn launch(&self, request: &LaunchRequest) -> Result<Vec<Instance>, ComputeError>;

    /// Wait until the given instances can be described.
    async fn wait_until_exist(&self, ids: &[String], timeout: Duration)
        -> Result<(), ComputeError>;

    async fn describe(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, ComputeError>;

    async fn terminate(&self, ids: &[String]) -> Result<(), ComputeError>;

    /// Price samples for the window, including the sample in effect at `start`.
    async fn spot_price_history(
        &self,
        instance_type: &str,
        availability_zone: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SpotPrice>, ComputeError>;
}
