//! Dispatches configured handler command templates through the Remote
//! Executor, with its own retry-delay list per handler invocation.

use std::time::Duration;

use tracing::warn;

use crate::executor::Executor;

use super::types::{TemplateContext, TemplateError, expand_template};

#[derive(Debug, Clone)]
pub struct HandlerSpec {
    pub command_template: String,
    pub retry_delays: Vec<Duration>,
}

/// Expands `spec.command_template` against `ctx`, shell-splits it on
/// whitespace (handler templates are plain argv, not shell strings),
/// and runs it through `executor`, retrying per `spec.retry_delays` on
/// non-zero exit.
pub async fn dispatch_handler(executor: &Executor, spec: &HandlerSpec, ctx: &TemplateContext, timeout: Duration) -> Result<(), TemplateError> {
    let expanded = expand_template(&spec.command_template, ctx)?;
    let argv: Vec<String> = expanded.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Ok(());
    }

    let mut attempt = 0;
    loop {
        match executor.run(&argv, None, timeout).await {
            Ok(output) if output.exit_status == 0 => return Ok(()),
            Ok(output) => {
                warn!(handler = %expanded, exit_status = output.exit_status, "event handler exited non-zero");
            }
            Err(e) => {
                warn!(handler = %expanded, error = %e, "event handler invocation failed");
            }
        }
        let Some(delay) = spec.retry_delays.get(attempt) else { return Ok(()) };
        tokio::time::sleep(*delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;

    #[tokio::test]
    async fn dispatch_succeeds_on_first_try_with_zero_exit() {
        let executor = Executor::new(ExecutorConfig::default());
        let spec = HandlerSpec { command_template: "true".to_string(), retry_delays: vec![] };
        let ctx = TemplateContext::default();
        dispatch_handler(&executor, &spec, &ctx, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_gives_up_after_retry_delays_exhausted() {
        let executor = Executor::new(ExecutorConfig::default());
        let spec = HandlerSpec { command_template: "false".to_string(), retry_delays: vec![Duration::from_millis(1)] };
        let ctx = TemplateContext::default();
        dispatch_handler(&executor, &spec, &ctx, Duration::from_secs(5)).await.unwrap();
    }
}
