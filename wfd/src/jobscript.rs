//! Job submission script rendering: inlines the configured
//! init/env/pre/main/post/err/exit sections plus the standard exported
//! variables every job script carries.

use crate::domain::workflow_config::NamespaceConfig;

#[derive(Debug, Clone)]
pub struct JobScriptContext {
    pub workflow_name: String,
    pub namespace: String,
    pub cycle_point: String,
    pub submit_number: u32,
    pub try_number: u32,
    pub job_dir: String,
}

/// Renders a complete shell script: standard exports, then the job
/// status callback prelude (so `started` is recorded and the exit trap
/// is armed before anything can fail), then each declared section in
/// the fixed order `init -> env -> pre -> main (script) -> post -> err
/// (trap)`. Sections absent from the namespace's settings are simply
/// omitted, never stubbed out. `exit_script`, if present, runs inside
/// the same trap that records `succeeded`/`failed`, since both fire
/// exactly once at job exit.
pub fn render(ctx: &JobScriptContext, settings: &NamespaceConfig, environment_overlay: &[(String, String)]) -> String {
    let mut script = String::new();
    script.push_str("#!/bin/sh\nset -eu\n\n");

    for (key, value) in standard_exports(ctx) {
        script.push_str(&format!("export {key}={value}\n"));
    }
    for (key, value) in &settings.environment {
        script.push_str(&format!("export {key}={value}\n"));
    }
    for (key, value) in environment_overlay {
        script.push_str(&format!("export {key}={value}\n"));
    }
    script.push('\n');

    script.push_str(&job_status_prelude(settings.exit_script.as_deref()));

    if let Some(section) = &settings.init_script {
        script.push_str("# init-script\n");
        script.push_str(section);
        script.push_str("\n\n");
    }
    if let Some(section) = &settings.env_script {
        script.push_str("# env-script\n");
        script.push_str(section);
        script.push_str("\n\n");
    }
    if let Some(section) = &settings.pre_script {
        script.push_str("# pre-script\n");
        script.push_str(section);
        script.push_str("\n\n");
    }
    script.push_str("# script\n");
    script.push_str(settings.script.as_deref().unwrap_or(":"));
    script.push_str("\n\n");
    if let Some(section) = &settings.post_script {
        script.push_str("# post-script\n");
        script.push_str(section);
        script.push_str("\n\n");
    }
    if let Some(section) = &settings.err_script {
        script.push_str(&format!("trap '{section}' ERR\n"));
    }
    script
}

/// Job status lines land in `$CYLC_TASK_JOB/job.status`, line-oriented
/// `KEY=VALUE` plus appended `CYLC_MESSAGE` lines, the exact format
/// `ingress::parse_job_status_file` expects: this is the job's own half
/// of message ingress, used when nothing is listening on the network
/// path (or as a durable record alongside it).
fn job_status_prelude(exit_script: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("# job-status\n");
    out.push_str("__wfd_now() { date -u +%Y-%m-%dT%H:%M:%SZ; }\n");
    out.push_str("__wfd_job_status() { printf 'CYLC_MESSAGE=%s|NORMAL|%s\\n' \"$(__wfd_now)\" \"$1\" >> \"$CYLC_TASK_JOB/job.status\"; }\n");
    out.push_str("__wfd_on_exit() {\n");
    out.push_str("    __wfd_exit_code=$?\n");
    if let Some(exit_script) = exit_script {
        out.push_str(&format!("    {exit_script}\n"));
    }
    out.push_str("    printf 'CYLC_JOB_EXIT=%s\\n' \"$__wfd_exit_code\" >> \"$CYLC_TASK_JOB/job.status\"\n");
    out.push_str("    printf 'CYLC_JOB_EXIT_TIME=%s\\n' \"$(__wfd_now)\" >> \"$CYLC_TASK_JOB/job.status\"\n");
    out.push_str("    if [ \"$__wfd_exit_code\" -eq 0 ]; then __wfd_job_status succeeded; else __wfd_job_status failed; fi\n");
    out.push_str("}\n");
    out.push_str("trap '__wfd_on_exit' EXIT\n");
    out.push_str("printf 'CYLC_JOB_INIT_TIME=%s\\n' \"$(__wfd_now)\" >> \"$CYLC_TASK_JOB/job.status\"\n");
    out.push_str("__wfd_job_status started\n\n");
    out
}

fn standard_exports(ctx: &JobScriptContext) -> Vec<(String, String)> {
    vec![
        ("CYLC_WORKFLOW_NAME".to_string(), ctx.workflow_name.clone()),
        ("CYLC_TASK_NAME".to_string(), ctx.namespace.clone()),
        ("CYLC_TASK_CYCLE_POINT".to_string(), ctx.cycle_point.clone()),
        ("CYLC_TASK_SUBMIT_NUMBER".to_string(), ctx.submit_number.to_string()),
        ("CYLC_TASK_TRY_NUMBER".to_string(), ctx.try_number.to_string()),
        ("CYLC_TASK_JOB".to_string(), ctx.job_dir.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sections_in_order_and_omits_absent_ones() {
        let ctx = JobScriptContext {
            workflow_name: "wf".to_string(),
            namespace: "a".to_string(),
            cycle_point: "1".to_string(),
            submit_number: 1,
            try_number: 1,
            job_dir: "log/job/1/a/01".to_string(),
        };
        let mut settings = NamespaceConfig::default();
        settings.script = Some("echo hi".to_string());
        settings.pre_script = Some("echo pre".to_string());

        let rendered = render(&ctx, &settings, &[]);
        assert!(rendered.find("# pre-script").unwrap() < rendered.find("# script").unwrap());
        assert!(!rendered.contains("# post-script"));
        assert!(rendered.contains("CYLC_TASK_SUBMIT_NUMBER=1"));
    }

    #[test]
    fn environment_overlay_overrides_are_appended_last() {
        let ctx = JobScriptContext {
            workflow_name: "wf".to_string(),
            namespace: "a".to_string(),
            cycle_point: "1".to_string(),
            submit_number: 1,
            try_number: 1,
            job_dir: "job".to_string(),
        };
        let settings = NamespaceConfig::default();
        let overlay = vec![("X".to_string(), "42".to_string())];
        let rendered = render(&ctx, &settings, &overlay);
        assert!(rendered.contains("export X=42"));
    }
}
