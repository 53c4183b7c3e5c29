//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::queue::MAX_TIER;

const PREFIX: &str = "RENDER_FLEET_";

/// Fleet and job configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    /// Instances launched per job.
    pub instance_count: usize,
    pub instance_type: String,
    /// Name pattern of the machine image; the newest match is used.
    pub image_pattern: String,
    pub security_group: String,
    pub key_name: Option<String>,
    pub iam_instance_profile: Option<String>,
    /// Root of the local Blender installation.
    pub blender_home: PathBuf,
    /// `s3://` URI of the store holding the Blender archive.
    pub file_store: String,
    /// Key of the Blender archive within the file store.
    pub blender_archive: String,
    /// Zone for spot price lookups. Defaults to the first instance's zone.
    pub availability_zone: Option<String>,
    pub poll_interval: Duration,
    pub log_lookback: Duration,
    pub max_tier: i64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            instance_count: 1,
            instance_type: "g4dn.xlarge".to_string(),
            image_pattern: "amzn2-ami-graphics-hvm-*".to_string(),
            security_group: "RenderJobWorkerSecurityGroup".to_string(),
            key_name: None,
            iam_instance_profile: Some("RenderJobWorkerProfile".to_string()),
            blender_home: PathBuf::from("blender"),
            file_store: "s3://render-fleet-store".to_string(),
            blender_archive: "blender.tar.xz".to_string(),
            availability_zone: None,
            poll_interval: Duration::from_secs(10),
            log_lookback: Duration::from_secs(60),
            max_tier: MAX_TIER,
        }
    }
}

impl FleetConfig {
    /// Read `RENDER_FLEET_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(&format!("{PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let config = Self {
            instance_count: parse(&var, "INSTANCE_COUNT", defaults.instance_count)?,
            instance_type: var("INSTANCE_TYPE").unwrap_or(defaults.instance_type),
            image_pattern: var("IMAGE_PATTERN").unwrap_or(defaults.image_pattern),
            security_group: var("SECURITY_GROUP").unwrap_or(defaults.security_group),
            key_name: var("KEY_NAME").or(defaults.key_name),
            iam_instance_profile: var("IAM_INSTANCE_PROFILE").or(defaults.iam_instance_profile),
            blender_home: var("BLENDER_HOME")
                .map(PathBuf::from)
                .unwrap_or(defaults.blender_home),
            file_store: var("FILE_STORE").unwrap_or(defaults.file_store),
            blender_archive: var("BLENDER_ARCHIVE").unwrap_or(defaults.blender_archive),
            availability_zone: var("AVAILABILITY_ZONE").or(defaults.availability_zone),
            poll_interval: Duration::from_secs(parse(
                &var,
                "POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            log_lookback: Duration::from_secs(parse(
                &var,
                "LOG_LOOKBACK_SECS",
                defaults.log_lookback.as_secs(),
            )?),
            max_tier: parse(&var, "MAX_TIER", defaults.max_tier)?,
        };

        if config.instance_count == 0 {
            return Err(invalid("INSTANCE_COUNT", "must be at least 1"));
        }
        if config.max_tier < 1 {
            return Err(invalid("MAX_TIER", "must be at least 1"));
        }
        Ok(config)
    }
}

fn invalid(name: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{PREFIX}{name}"),
        message: message.into(),
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| invalid(name, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}
