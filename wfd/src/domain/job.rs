//! `JobRecord`: the append-only per-submit record in `task_jobs`.

use serde::{Deserialize, Serialize};
use wfstore::{IndexValue, Record};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub proxy_id: String,
    pub submit_number: u32,
    pub try_number: u32,
    pub host: Option<String>,
    pub user: Option<String>,
    pub runner_id: Option<String>,
    pub submit_time: Option<i64>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub exit_status: Option<i32>,
    pub outputs_emitted: Vec<String>,
    pub updated_at: i64,
}

impl JobRecord {
    pub fn new(proxy_id: impl Into<String>, submit_number: u32, try_number: u32, now: i64) -> Self {
        let proxy_id = proxy_id.into();
        Self {
            id: format!("{proxy_id}#{submit_number}"),
            proxy_id,
            submit_number,
            try_number,
            host: None,
            user: None,
            runner_id: None,
            submit_time: Some(now),
            start_time: None,
            finish_time: None,
            exit_status: None,
            outputs_emitted: Vec::new(),
            updated_at: now,
        }
    }
}

impl Record for JobRecord {
    fn id(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> i64 {
        self.updated_at
    }
    fn collection_name() -> &'static str {
        "task_jobs"
    }
    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        vec![
            ("proxy_id", IndexValue::Text(self.proxy_id.clone())),
            ("submit_number", IndexValue::Int(self.submit_number as i64)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_record_id_includes_submit_number() {
        let job = JobRecord::new("a/1", 2, 0, 100);
        assert_eq!(job.id, "a/1#2");
        assert_eq!(job.submit_time, Some(100));
    }
}
