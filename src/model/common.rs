/// Row identity for versions, stages and association entries.
pub type Id = u64;

/// Physical database instance identity.
pub type InstanceId = u64;

/// External identity of a SQL change workflow (e.g. "1735689600123456").
pub type WorkflowId = String;

/// Identity of the project that owns versions and workflows.
pub type ProjectId = String;
