//! Domain types for the scheduler: cycling, configuration, and the
//! task proxy / job record pair that get persisted through `wfstore`.

pub mod broadcast_record;
pub mod cycle;
pub mod job;
pub mod proxy;
pub mod workflow_config;

pub use broadcast_record::BroadcastRecord;
pub use cycle::{CalendarMismatch, CycleDuration, CyclePoint, Recurrence};
pub use job::JobRecord;
pub use proxy::{
    OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUBMITTED, OUTPUT_SUCCEEDED, Outputs, PrereqGroup,
    PrereqTriple, Prerequisites, ProxyError, TaskProxy, TaskState, Timers, proxy_key,
};
pub use workflow_config::{
    ConfigError, CyclingMode, JobConfig, NamespaceConfig, NamespaceResolver, RecurrenceGraph, RemoteConfig,
    ResolvedNamespace, SchedulerSection, SchedulingSection, WorkflowConfig,
};
