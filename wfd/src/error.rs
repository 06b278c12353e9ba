//! Top-level error types, aggregated per-module the way `taskdaemon`
//! splits `LlmError`/`ToolError`/`StateError`/`WorktreeError` and joins
//! them at the CLI boundary through `eyre`.

use thiserror::Error;

use crate::domain::cycle::CalendarMismatch;
use crate::domain::proxy::ProxyError;
use crate::domain::workflow_config::ConfigError;
use crate::executor::ExecutorError;
use crate::ingress::IngressError;
use crate::resolver::ResolverError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("calendar mismatch: {0}")]
    Calendar(#[from] CalendarMismatch),

    #[error("store error: {0}")]
    Store(#[from] wfstore::StoreError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("ingress error: {0}")]
    Ingress(#[from] IngressError),

    #[error("proxy state error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
