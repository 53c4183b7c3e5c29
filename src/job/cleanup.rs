//! Sweep away resources left behind by jobs that did not finish.

use tracing::{error, info, warn};

use crate::cloud::Backends;
use crate::cloud::objects::empty_and_delete;
use crate::error::{Error, Result};
use crate::job::names::RESOURCE_PREFIX;

/// Names of what the sweep deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub log_groups: Vec<String>,
    pub buckets: Vec<String>,
    pub tables: Vec<String>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.log_groups.is_empty() && self.buckets.is_empty() && self.tables.is_empty()
    }
}

/// Delete every log group, bucket and table whose name starts with the job
/// resource prefix, whichever job created it.
pub async fn clean_up(backends: &Backends) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    for group in backends.logs.list_groups(RESOURCE_PREFIX).await? {
        backends.logs.delete_group(&group).await?;
        info!(group = %group, "Deleted log group");
        report.log_groups.push(group);
    }

    for bucket in backends.objects.list_containers(RESOURCE_PREFIX).await? {
        empty_and_delete(backends.objects.as_ref(), &bucket).await?;
        info!(bucket = %bucket, "Deleted bucket");
        report.buckets.push(bucket);
    }

    for table in backends.kv.list_tables(RESOURCE_PREFIX).await? {
        backends.kv.delete_table(&table).await?;
        info!(table = %table, "Deleted table");
        report.tables.push(table);
    }

    Ok(report)
}

/// Handle a failed job. The failure is logged first. Resources, including the
/// queue with its unfinished frames, stay in place unless `sweep` is set so a
/// rerun can pick up where the job stopped. A failing sweep is logged and
/// never replaces the job's own error.
pub async fn after_failure(backends: &Backends, failure: &Error, sweep: bool) -> Option<CleanupReport> {
    error!(error = %failure, "Render job failed");
    if !sweep {
        info!("Leaving job resources in place");
        return None;
    }
    match clean_up(backends).await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!(error = %e, "Clean-up sweep failed");
            None
        }
    }
}
