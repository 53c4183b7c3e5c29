use uuid::Uuid;

/// Prefix shared by every resource a job creates; the clean-up sweep
/// deletes anything carrying it.
pub const RESOURCE_PREFIX: &str = "render-job-";

/// Names of the per-job cloud resources, all `render-job-<kind>-<job id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub job_id: Uuid,
    pub log_group: String,
    pub bucket: String,
    pub table: String,
    /// Name tag given to every worker instance.
    pub worker: String,
}

impl ResourceNames {
    pub fn new(job_id: Uuid) -> Self {
        let name = |kind: &str| format!("{RESOURCE_PREFIX}{kind}-{job_id}");
        Self {
            job_id,
            log_group: name("log-group"),
            bucket: name("bucket"),
            table: name("table"),
            worker: name("worker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_prefix_kind_and_id() {
        let id = Uuid::parse_str("bb9138ab-8e5b-4a84-94f5-132de68a010d").unwrap();
        let names = ResourceNames::new(id);
        assert_eq!(names.bucket, "render-job-bucket-bb9138ab-8e5b-4a84-94f5-132de68a010d");
        assert_eq!(names.log_group, "render-job-log-group-bb9138ab-8e5b-4a84-94f5-132de68a010d");
        assert!(names.table.starts_with(RESOURCE_PREFIX));
        assert!(names.worker.ends_with(&id.to_string()));
    }
}
