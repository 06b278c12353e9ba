//! Batched mail: pending task-event mails accumulate until the batch
//! interval elapses or shutdown, then one message per severity is sent.

use std::time::Duration;

use super::types::{TaskEventKind, WorkflowEvent};

#[derive(Debug, Clone)]
pub struct PendingMail {
    pub proxy_id: String,
    pub kind: TaskEventKind,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
pub struct MailBatcher {
    pending: Vec<PendingMail>,
}

impl MailBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &WorkflowEvent) {
        if let WorkflowEvent::Task { kind, proxy_id, message, .. } = event {
            if kind.is_mail_eligible() {
                self.pending.push(PendingMail { proxy_id: proxy_id.clone(), kind: *kind, message: message.clone() });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drains the pending mails into a single rendered message body and
    /// subject line, `[N events]` when plural, `[proxy-id event]` when
    /// exactly one.
    pub fn drain_digest(&mut self) -> Option<(String, String)> {
        if self.pending.is_empty() {
            return None;
        }
        let mails = std::mem::take(&mut self.pending);
        let subject = if mails.len() == 1 {
            format!("[{} {:?}]", mails[0].proxy_id, mails[0].kind)
        } else {
            format!("[{} events]", mails.len())
        };
        let body = mails
            .iter()
            .map(|m| format!("{} {:?}{}", m.proxy_id, m.kind, m.message.as_deref().map(|t| format!(": {t}")).unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n");
        Some((subject, body))
    }
}

/// Tracks when the next batch flush is due.
#[derive(Debug, Clone, Copy)]
pub struct BatchClock {
    pub interval: Duration,
    pub next_due: i64,
}

impl BatchClock {
    pub fn new(interval: Duration, now: i64) -> Self {
        Self { interval, next_due: now + interval.as_secs() as i64 }
    }

    pub fn is_due(&self, now: i64) -> bool {
        now >= self.next_due
    }

    pub fn advance(&mut self, now: i64) {
        self.next_due = now + self.interval.as_secs() as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_pending_mail_gets_singular_subject() {
        let mut batcher = MailBatcher::new();
        batcher.push(&WorkflowEvent::Task {
            kind: TaskEventKind::Failed,
            proxy_id: "a/1".to_string(),
            cycle: "1".to_string(),
            submit_number: 1,
            try_number: 1,
            runner_name: None,
            runner_id: None,
            message: None,
        });
        let (subject, _) = batcher.drain_digest().unwrap();
        assert_eq!(subject, "[a/1 Failed]");
    }

    #[test]
    fn multiple_pending_mails_get_count_subject() {
        let mut batcher = MailBatcher::new();
        for proxy in ["a/1", "a/2"] {
            batcher.push(&WorkflowEvent::Task {
                kind: TaskEventKind::Retry,
                proxy_id: proxy.to_string(),
                cycle: "1".to_string(),
                submit_number: 1,
                try_number: 1,
                runner_name: None,
                runner_id: None,
                message: None,
            });
        }
        let (subject, _) = batcher.drain_digest().unwrap();
        assert_eq!(subject, "[2 events]");
    }

    #[test]
    fn non_mail_eligible_events_are_ignored() {
        let mut batcher = MailBatcher::new();
        batcher.push(&WorkflowEvent::Task {
            kind: TaskEventKind::Succeeded,
            proxy_id: "a/1".to_string(),
            cycle: "1".to_string(),
            submit_number: 1,
            try_number: 1,
            runner_name: None,
            runner_id: None,
            message: None,
        });
        assert!(batcher.is_empty());
    }

    #[test]
    fn batch_clock_is_due_after_interval_elapses() {
        let clock = BatchClock::new(Duration::from_secs(300), 0);
        assert!(!clock.is_due(100));
        assert!(clock.is_due(300));
    }
}
