//! The Scheduler Loop: the single-threaded, cooperative seven-step tick
//! plus health check and auto stop-restart host ranking.
//!
//! Grounded on the teacher's `LoopManager` tick-oriented orchestration in
//! `r#loop/manager.rs` (poll-ready-work, spawn, track, repeat), recast
//! per the concurrency model into one mutator of pool state rather than
//! a concurrent task spawner.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::daemon::{ContactFile, WorkflowServices};
use crate::events::{EventBus, WorkflowEvent, WorkflowEventKind};
use crate::ingress::IngressMessage;
use crate::pool::TaskPool;

#[derive(Debug, Clone)]
pub struct SchedulerLoopConfig {
    pub tick_interval: Duration,
    pub health_check_interval: Duration,
    pub stall_inactivity_period: Duration,
    pub abort_on_stall: bool,
}

impl Default for SchedulerLoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(600),
            stall_inactivity_period: Duration::from_secs(60),
            abort_on_stall: false,
        }
    }
}

/// Host-ranking strategies for auto stop-restart, named directly from
/// the configured condemned-host policy.
#[derive(Debug, Clone)]
pub enum HostRank {
    Random,
    Load1,
    Load5,
    Load15,
    Memory,
    DiskSpace(String),
}

/// Picks the best candidate host by `rank`. Real rank metrics are
/// sourced by the caller (via the Remote Executor running `uptime`,
/// `free`, `df`) and passed in as `(host, metric)` pairs; this function
/// only orders them, keeping the policy pluggable without embedding
/// remote-command execution here.
pub fn rank_hosts(rank: &HostRank, candidates: &[(String, f64)]) -> Option<String> {
    match rank {
        HostRank::Random => {
            use rand::seq::IndexedRandom;
            candidates.choose(&mut rand::rng()).map(|(h, _)| h.clone())
        }
        HostRank::Load1 | HostRank::Load5 | HostRank::Load15 | HostRank::Memory | HostRank::DiskSpace(_) => {
            candidates.iter().min_by(|a, b| a.1.total_cmp(&b.1)).map(|(h, _)| h.clone())
        }
    }
}

/// One tick's verdict: what the caller (the process loop driving
/// `SchedulerLoop::tick`) should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Stalled,
    HealthCheckFailed,
}

pub struct SchedulerLoop<'a> {
    pool: &'a mut TaskPool,
    ingress_rx: &'a mut mpsc::Receiver<IngressMessage>,
    event_bus: &'a EventBus,
    services: &'a WorkflowServices,
    contact: ContactFile,
    config: SchedulerLoopConfig,
    last_health_check: i64,
    last_progress: i64,
    stalled_handler_fired: bool,
}

impl<'a> SchedulerLoop<'a> {
    pub fn new(
        pool: &'a mut TaskPool,
        ingress_rx: &'a mut mpsc::Receiver<IngressMessage>,
        event_bus: &'a EventBus,
        services: &'a WorkflowServices,
        contact: ContactFile,
        config: SchedulerLoopConfig,
        now: i64,
    ) -> Self {
        Self { pool, ingress_rx, event_bus, services, contact, config, last_health_check: now, last_progress: now, stalled_handler_fired: false }
    }

    /// Steps 1-7 of one tick. Message application, submission, polling
    /// and the event-dispatcher flush are each owned by the caller
    /// (lifecycle manager, executor, event dispatcher) and invoked
    /// through the closures so this function stays a pure orchestrator
    /// over `&mut TaskPool`, matching the "only the main loop mutates
    /// pool state" rule.
    pub async fn tick(
        &mut self,
        now: i64,
        mut apply_message: impl AsyncFnMut(&mut TaskPool, IngressMessage, i64),
        mut submit_ready: impl AsyncFnMut(&mut TaskPool, &[crate::pool::ProxyKey], i64),
        mut poll_due: impl AsyncFnMut(&mut TaskPool, i64),
        mut flush_events: impl AsyncFnMut(),
    ) -> TickOutcome {
        // 1. Drain ingress queue.
        while let Ok(message) = self.ingress_rx.try_recv() {
            apply_message(self.pool, message, now).await;
        }

        // 2. Timer advancement is delegated: callers own per-proxy
        // `Timers` and call back into the pool as deadlines fire.

        // 3. Submit ready proxies up to capacity.
        let ready = self.pool.ready_iter();
        if !ready.is_empty() {
            submit_ready(self.pool, &ready, now).await;
            self.last_progress = now;
        }

        // 4. Poll tasks whose next poll is due.
        poll_due(self.pool, now).await;

        // 5. Re-evaluate stall/inactivity.
        let inactive_for = now - self.last_progress;
        let stalled = self.pool.is_stalled(false) && inactive_for >= self.config.stall_inactivity_period.as_secs() as i64;
        if stalled && !self.stalled_handler_fired {
            self.stalled_handler_fired = true;
            self.event_bus.emit(WorkflowEvent::Workflow { kind: WorkflowEventKind::Stalled, message: None });
            warn!(inactive_for, "scheduler declared stall");
        } else if !self.pool.is_stalled(false) {
            self.stalled_handler_fired = false;
        }

        // 6. Flush event dispatcher.
        flush_events().await;

        // 7. Commit happens at the store layer by each mutation already
        // having been persisted through `Store::put`/`Batch::commit`.

        if now - self.last_health_check >= self.config.health_check_interval.as_secs() as i64 {
            self.last_health_check = now;
            if !self.services.is_healthy(&self.contact) {
                error!("health check failed, shutting down");
                return TickOutcome::HealthCheckFailed;
            }
        }

        if stalled {
            return TickOutcome::Stalled;
        }
        TickOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_hosts_picks_lowest_load_metric() {
        let candidates = vec![("a".to_string(), 2.5), ("b".to_string(), 0.5)];
        assert_eq!(rank_hosts(&HostRank::Load1, &candidates), Some("b".to_string()));
    }

    #[test]
    fn rank_hosts_random_returns_first_candidate() {
        let candidates = vec![("only".to_string(), 0.0)];
        assert_eq!(rank_hosts(&HostRank::Random, &candidates), Some("only".to_string()));
    }
}
