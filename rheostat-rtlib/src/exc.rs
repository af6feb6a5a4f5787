// Copyright 2025 Rheostat Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-context client state: the working-mode negotiation counterpart,
//! cycle bookkeeping, CPS enforcement and the goal-gap feedback loop.

use crate::channel::{Channel, ServerCommand};
use crate::options::{DurationLimit, RtLibOptions};
use crate::stats::SlidingStats;
use crate::RtLibError;
use rheostat_common::protocol::{
    AwmConstraint, ConstraintKind, ResultCode, RpcBody, SyncEventKind, SystemAssignment,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

/// How long the library tries to reach a quiescent point before answering
/// `NotQuiescent` in the second sync phase.
const QUIESCENCE_WINDOW: Duration = Duration::from_millis(500);
/// No profile notifications for this long after a reconfiguration.
const PROFILE_REARM_MS: f64 = 500.0;
/// No further notifications for this long after one was sent.
const PROFILE_WAIT_FOR_SYNC_MS: f64 = 1000.0;
/// Goal gaps below this magnitude are noise.
const GOAL_GAP_TRIGGER: f64 = 0.01;
const GOAL_GAP_FLOOR: f64 = -0.33;
const GOAL_GAP_CEILING: f64 = 1.0;
/// Linux reports process times in USER_HZ ticks of 10 ms.
const CLOCK_TICK_MS: u64 = 10;

/// The working mode this context currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingModeAssignment {
    pub awm_id: u8,
    pub systems: Vec<SystemAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentStatus {
    Unassigned,
    Assigned(WorkingModeAssignment),
    Blocked,
    Disabled,
    SyncFailed,
    ChannelClosed,
}

#[derive(Debug)]
struct PendingAssignment {
    awm: i8,
    event: SyncEventKind,
    systems: Vec<SystemAssignment>,
    committed: bool,
}

#[derive(Debug, Default)]
struct SyncState {
    pending: Option<PendingAssignment>,
    in_cycle: bool,
}

struct CycleState {
    /// Includes the CPS-enforcement sleep; what `get_cps` reports.
    user: SlidingStats,
    /// Excludes the enforcement sleep; what the policy sees.
    system: SlidingStats,
    cpu_usage: SlidingStats,
    cycle_start: Option<Instant>,
    cpu_start_ms: u64,
    cycles: u64,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct CpsState {
    /// Cycle period enforced by sleeping, 0 disables the cap.
    expected_cycle_ms: f64,
    goal_min: f64,
    goal_max: f64,
    jobs_per_cycle: f64,
    explicit_gap_percent: Option<i32>,
}

#[derive(Debug)]
struct ProfileLimiter {
    waiting_for_sync: bool,
    wait_budget_ms: f64,
}

pub(crate) struct ExcInner {
    channel: Option<Arc<Channel>>,
    exc_id: u8,
    name: String,
    status: watch::Sender<AssignmentStatus>,
    sync: Mutex<SyncState>,
    cycle_end: Notify,
    cycle: Mutex<CycleState>,
    cps: Mutex<CpsState>,
    limiter: Mutex<ProfileLimiter>,
    enabled: AtomicBool,
    options: Arc<RtLibOptions>,
}

/// Handle to one registered execution context. Cheap to clone.
#[derive(Clone)]
pub struct ExcHandle {
    inner: Arc<ExcInner>,
}

impl ExcHandle {
    pub(crate) fn new_managed(
        channel: Arc<Channel>,
        exc_id: u8,
        name: String,
        options: Arc<RtLibOptions>,
        mailbox: mpsc::UnboundedReceiver<ServerCommand>,
    ) -> Self {
        let handle = Self {
            inner: Arc::new(ExcInner::new(Some(channel), exc_id, name, options)),
        };
        tokio::spawn(serve_sync_commands(Arc::clone(&handle.inner), mailbox));
        handle
    }

    pub(crate) fn new_unmanaged(
        exc_id: u8,
        name: String,
        forced_awm: u8,
        options: Arc<RtLibOptions>,
    ) -> Self {
        let handle = Self {
            inner: Arc::new(ExcInner::new(None, exc_id, name, options)),
        };
        handle.inner.enabled.store(true, Ordering::Relaxed);
        let _ = handle
            .inner
            .status
            .send_replace(AssignmentStatus::Assigned(WorkingModeAssignment {
                awm_id: forced_awm,
                systems: Vec::new(),
            }));
        handle
    }

    pub fn exc_id(&self) -> u8 {
        self.inner.exc_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn cycles(&self) -> u64 {
        self.inner.cycle.lock().unwrap().cycles
    }

    /// Makes the context eligible for scheduling.
    pub async fn enable(&self) -> Result<(), RtLibError> {
        if let Some(channel) = &self.inner.channel {
            let result = channel.request(self.inner.exc_id, RpcBody::ExcStart).await?;
            if result != ResultCode::Ok {
                return Err(RtLibError::Rejected(result));
            }
        }
        self.inner.enabled.store(true, Ordering::Relaxed);
        // Re-enabling after a disable starts a fresh negotiation.
        self.inner.status.send_if_modified(|status| {
            if *status == AssignmentStatus::Disabled {
                *status = AssignmentStatus::Unassigned;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Withdraws the context from scheduling; a pending
    /// `get_working_mode` resolves to `Disabled`.
    pub async fn disable(&self) -> Result<(), RtLibError> {
        self.inner.enabled.store(false, Ordering::Relaxed);
        let _ = self.inner.status.send_replace(AssignmentStatus::Disabled);
        if let Some(channel) = &self.inner.channel {
            let result = channel.request(self.inner.exc_id, RpcBody::ExcStop).await?;
            if result != ResultCode::Ok {
                return Err(RtLibError::Rejected(result));
            }
        }
        Ok(())
    }

    pub async fn unregister(&self) -> Result<(), RtLibError> {
        if let Some(channel) = &self.inner.channel {
            let result = channel
                .request(
                    self.inner.exc_id,
                    RpcBody::ExcUnregister {
                        exc_name: self.inner.name.clone(),
                    },
                )
                .await?;
            channel.drop_mailbox(self.inner.exc_id);
            if result != ResultCode::Ok {
                return Err(RtLibError::Rejected(result));
            }
        }
        Ok(())
    }

    /// Blocks until the scheduler has placed the context on a working
    /// mode. Returns `Blocked` when no placement was possible, `Disabled`
    /// when the context was disabled while waiting, `SyncFailed` after a
    /// failed actuation.
    pub async fn get_working_mode(&self) -> Result<WorkingModeAssignment, RtLibError> {
        if !self.inner.enabled.load(Ordering::Relaxed) {
            return Err(RtLibError::Disabled);
        }
        let mut status = self.inner.status.subscribe();
        // Nudge the scheduler if nothing is assigned yet.
        let current = status.borrow_and_update().clone();
        if matches!(
            current,
            AssignmentStatus::Unassigned | AssignmentStatus::Blocked
        ) {
            if let Some(channel) = &self.inner.channel {
                let _ = channel
                    .request(self.inner.exc_id, RpcBody::ExcSchedule)
                    .await;
            }
        }
        loop {
            let value = status.borrow_and_update().clone();
            match value {
                AssignmentStatus::Assigned(assignment) => return Ok(assignment),
                AssignmentStatus::Blocked => return Err(RtLibError::Blocked),
                AssignmentStatus::Disabled => return Err(RtLibError::Disabled),
                AssignmentStatus::SyncFailed => return Err(RtLibError::SyncFailed),
                AssignmentStatus::ChannelClosed => return Err(RtLibError::ChannelClosed),
                AssignmentStatus::Unassigned => {}
            }
            status
                .changed()
                .await
                .map_err(|_| RtLibError::ChannelClosed)?;
        }
    }

    pub async fn set_constraint(
        &self,
        kind: ConstraintKind,
        awm_id: u8,
    ) -> Result<(), RtLibError> {
        self.set_constraints(&[AwmConstraint { kind, awm_id }]).await
    }

    pub async fn set_constraints(
        &self,
        constraints: &[AwmConstraint],
    ) -> Result<(), RtLibError> {
        let Some(channel) = &self.inner.channel else {
            return Ok(());
        };
        let result = channel
            .request(
                self.inner.exc_id,
                RpcBody::ExcSetConstraints {
                    constraints: constraints.to_vec(),
                },
            )
            .await?;
        if result != ResultCode::Ok {
            return Err(RtLibError::Rejected(result));
        }
        Ok(())
    }

    pub async fn clear_constraints(&self) -> Result<(), RtLibError> {
        let Some(channel) = &self.inner.channel else {
            return Ok(());
        };
        let result = channel
            .request(self.inner.exc_id, RpcBody::ExcClearConstraints)
            .await?;
        if result != ResultCode::Ok {
            return Err(RtLibError::Rejected(result));
        }
        Ok(())
    }

    /// Asserts that the application needs `percent` more (positive) or
    /// less (negative) resources. Bounded before forwarding; sent with
    /// the next cycle's profile notification.
    pub fn set_explicit_goal_gap(&self, percent: i32) {
        let bounded = percent.clamp(-33, 100);
        self.inner.cps.lock().unwrap().explicit_gap_percent = Some(bounded);
    }

    /// Caps the observed cycle rate by sleeping at the end of each cycle.
    pub fn set_cps(&self, max_cps: f64) {
        let mut cps = self.inner.cps.lock().unwrap();
        cps.expected_cycle_ms = if max_cps > 0.0 { 1000.0 / max_cps } else { 0.0 };
    }

    /// Declares the cycles-per-second goal driving the goal-gap loop.
    /// A `max` of 0 means "at least min"; equal bounds mean an exact
    /// target. The cap is enforced at `max`.
    pub fn set_cps_goal(&self, min_cps: f64, max_cps: f64) {
        {
            let mut cps = self.inner.cps.lock().unwrap();
            cps.goal_min = min_cps;
            cps.goal_max = max_cps;
            cps.expected_cycle_ms = if max_cps > 0.0 { 1000.0 / max_cps } else { 0.0 };
        }
        // Stale history would pollute the first gap computations.
        let mut cycle = self.inner.cycle.lock().unwrap();
        cycle.user.clear();
        cycle.system.clear();
        cycle.cpu_usage.clear();
    }

    /// Jobs-per-second goal for applications batching several jobs per
    /// cycle.
    pub fn set_jps_goal(&self, min_jps: f64, max_jps: f64, jobs_per_cycle: f64) {
        let jpc = if jobs_per_cycle > 0.0 { jobs_per_cycle } else { 1.0 };
        self.inner.cps.lock().unwrap().jobs_per_cycle = jpc;
        self.set_cps_goal(min_jps / jpc, max_jps / jpc);
    }

    /// Adjusts the declared jobs-per-cycle factor, rescaling the goal.
    pub fn update_jpc(&self, jobs_per_cycle: f64) {
        if jobs_per_cycle <= 0.0 {
            return;
        }
        let (goal_min, goal_max, old_jpc) = {
            let cps = self.inner.cps.lock().unwrap();
            (cps.goal_min, cps.goal_max, cps.jobs_per_cycle)
        };
        if old_jpc <= 0.0 {
            return;
        }
        self.set_jps_goal(
            goal_min * old_jpc,
            goal_max * old_jpc,
            jobs_per_cycle,
        );
    }

    pub fn set_minimum_cycle_time_us(&self, cycle_time_us: u64) {
        if cycle_time_us > 0 {
            self.set_cps(1e6 / cycle_time_us as f64);
        }
    }

    /// Observed cycle rate, enforcement sleep included.
    pub fn get_cps(&self) -> f64 {
        let mean = self.inner.cycle.lock().unwrap().user.mean();
        if mean > 0.0 { 1000.0 / mean } else { 0.0 }
    }

    pub fn get_jps(&self) -> f64 {
        let jpc = self.inner.cps.lock().unwrap().jobs_per_cycle.max(1.0);
        self.get_cps() * jpc
    }

    /// Marks the start of a work cycle.
    pub fn pre_run(&self) {
        self.inner.sync.lock().unwrap().in_cycle = true;
        let mut cycle = self.inner.cycle.lock().unwrap();
        cycle.cycle_start = Some(Instant::now());
        cycle.cpu_start_ms = process_cpu_time_ms();
    }

    /// Closes the work cycle: records statistics, enforces the CPS cap,
    /// forwards the runtime profile and releases any sync phase waiting
    /// for quiescence. Returns `false` once a configured duration limit
    /// is reached (the context is disabled then).
    pub async fn post_run(&self) -> Result<bool, RtLibError> {
        let expected_ms = self.inner.cps.lock().unwrap().expected_cycle_ms;
        let cycle_time_ms = {
            let mut cycle = self.inner.cycle.lock().unwrap();
            let Some(start) = cycle.cycle_start.take() else {
                return Ok(true);
            };
            let cycle_time_ms = start.elapsed().as_secs_f64() * 1000.0;
            cycle.system.push(cycle_time_ms);

            let cpu_delta_ms = process_cpu_time_ms().saturating_sub(cycle.cpu_start_ms);
            if cycle_time_ms > 0.0 {
                cycle
                    .cpu_usage
                    .push(100.0 * cpu_delta_ms as f64 / cycle_time_ms);
            }
            cycle.cycles += 1;
            cycle_time_ms
        };

        // CPS enforcement: pad the cycle, booking the pad separately so
        // it does not contaminate the statistics shown to the policy.
        let mut slept_ms = 0.0;
        if expected_ms > 0.0 && cycle_time_ms < expected_ms {
            slept_ms = expected_ms - cycle_time_ms;
            tokio::time::sleep(Duration::from_secs_f64(slept_ms / 1000.0)).await;
        }
        self.inner
            .cycle
            .lock()
            .unwrap()
            .user
            .push(cycle_time_ms + slept_ms);

        // The cycle is over; a pending SyncChange may proceed.
        self.inner.sync.lock().unwrap().in_cycle = false;
        self.inner.cycle_end.notify_waiters();

        if self.duration_limit_reached() {
            debug!(exc = self.inner.exc_id, "duration limit reached, disabling");
            self.disable().await?;
            return Ok(false);
        }

        self.forward_runtime_profile();
        Ok(true)
    }

    fn duration_limit_reached(&self) -> bool {
        let cycle = self.inner.cycle.lock().unwrap();
        match self.inner.options.duration {
            Some(DurationLimit::Cycles(limit)) => cycle.cycles >= limit,
            Some(DurationLimit::Seconds(limit)) => {
                cycle.started_at.elapsed() >= Duration::from_secs(limit)
            }
            None => false,
        }
    }

    /// The goal-gap feedback loop, rate limited twice: a rearm window
    /// after each reconfiguration, and a wait-for-sync window after each
    /// notification.
    fn forward_runtime_profile(&self) {
        let Some(channel) = &self.inner.channel else {
            return;
        };

        let (ms_since_reconfig, last_user_ms, mean_system_ms, ci99, cpu_usage, samples) = {
            let cycle = self.inner.cycle.lock().unwrap();
            (
                cycle.user.sum(),
                cycle.user.last(),
                cycle.system.mean(),
                cycle.system.confidence_interval_99(),
                cycle.cpu_usage.mean(),
                cycle.system.count(),
            )
        };

        {
            let mut limiter = self.inner.limiter.lock().unwrap();
            if limiter.waiting_for_sync && ms_since_reconfig < PROFILE_REARM_MS {
                return;
            }
            limiter.waiting_for_sync = false;
            limiter.wait_budget_ms -= last_user_ms;
            if limiter.wait_budget_ms > 0.0 {
                return;
            }
        }

        let gap = {
            let mut cps = self.inner.cps.lock().unwrap();
            if let Some(percent) = cps.explicit_gap_percent.take() {
                Some(percent as f64 / 100.0)
            } else if cps.goal_min + cps.goal_max > 0.0 {
                if samples < 2 {
                    None
                } else {
                    compute_goal_gap(cps.goal_min, cps.goal_max, mean_system_ms, ci99)
                }
            } else {
                None
            }
        };
        let Some(gap) = gap else { return };
        if gap.abs() <= GOAL_GAP_TRIGGER {
            return;
        }

        let cycle_estimate_ms = mean_system_ms + ci99;
        debug!(
            exc = self.inner.exc_id,
            gap_percent = (100.0 * gap).round(),
            cpu_usage = cpu_usage.round(),
            cycle_ms = cycle_estimate_ms.round(),
            "forwarding runtime profile"
        );
        if channel
            .notify(
                self.inner.exc_id,
                RpcBody::ExcRuntimeNotify {
                    goal_gap: (100.0 * gap).round() as i32,
                    cpu_usage: cpu_usage.round() as i32,
                    cycle_time_ms: cycle_estimate_ms.round() as i32,
                },
            )
            .is_err()
        {
            warn!(exc = self.inner.exc_id, "profile notification failed");
            return;
        }

        let mut limiter = self.inner.limiter.lock().unwrap();
        limiter.wait_budget_ms = PROFILE_WAIT_FOR_SYNC_MS;
        limiter.waiting_for_sync = true;
    }
}

impl ExcInner {
    fn new(
        channel: Option<Arc<Channel>>,
        exc_id: u8,
        name: String,
        options: Arc<RtLibOptions>,
    ) -> Self {
        let (status, _) = watch::channel(AssignmentStatus::Unassigned);
        Self {
            channel,
            exc_id,
            name,
            status,
            sync: Mutex::new(SyncState::default()),
            cycle_end: Notify::new(),
            cycle: Mutex::new(CycleState {
                user: SlidingStats::default(),
                system: SlidingStats::default(),
                cpu_usage: SlidingStats::default(),
                cycle_start: None,
                cpu_start_ms: 0,
                cycles: 0,
                started_at: Instant::now(),
            }),
            cps: Mutex::new(CpsState::default()),
            limiter: Mutex::new(ProfileLimiter {
                waiting_for_sync: false,
                wait_budget_ms: 0.0,
            }),
            enabled: AtomicBool::new(false),
            options,
        }
    }
}

/// Services daemon-originated sync commands for one context.
async fn serve_sync_commands(
    inner: Arc<ExcInner>,
    mut mailbox: mpsc::UnboundedReceiver<ServerCommand>,
) {
    let channel = inner
        .channel
        .clone()
        .expect("managed contexts have a channel");
    while let Some(command) = mailbox.recv().await {
        match command.body {
            RpcBody::SyncPreChange {
                event,
                awm,
                systems,
            } => {
                inner.sync.lock().unwrap().pending = Some(PendingAssignment {
                    awm,
                    event,
                    systems,
                    committed: matches!(event, SyncEventKind::Quarantine),
                });
                // The latency estimate is the recent cycle time: that is
                // how long until the next natural quiescent point.
                let latency_ms = inner.cycle.lock().unwrap().system.mean().round() as u32;
                channel.reply(
                    command.token,
                    inner.exc_id,
                    RpcBody::PreChangeResponse {
                        sync_latency_ms: latency_ms,
                        result: ResultCode::Ok,
                    },
                );
            }
            RpcBody::SyncChange => {
                let quiescent = wait_for_quiescence(&inner).await;
                let result = if quiescent {
                    ResultCode::Ok
                } else {
                    // Dropped from this round; forget the proposal.
                    inner.sync.lock().unwrap().pending = None;
                    ResultCode::NotQuiescent
                };
                channel.reply(
                    command.token,
                    inner.exc_id,
                    RpcBody::SyncChangeResponse { result },
                );
            }
            RpcBody::SyncDoChange => {
                if let Some(pending) = inner.sync.lock().unwrap().pending.as_mut() {
                    pending.committed = true;
                }
            }
            RpcBody::SyncPostChange => {
                apply_post_change(&inner);
                channel.reply(
                    command.token,
                    inner.exc_id,
                    RpcBody::PostChangeResponse {
                        result: ResultCode::Ok,
                    },
                );
            }
            RpcBody::StopExecution { timeout_ms } => {
                debug!(
                    exc = inner.exc_id,
                    timeout_ms, "stop requested by the resource manager"
                );
                inner.enabled.store(false, Ordering::Relaxed);
                let _ = inner.status.send_replace(AssignmentStatus::Disabled);
            }
            RpcBody::GetProfile => {
                let exec_time_ms = inner.cycle.lock().unwrap().system.sum().round() as u32;
                channel.reply(
                    command.token,
                    inner.exc_id,
                    RpcBody::ProfileResponse {
                        exec_time_ms,
                        mem_time_ms: 0,
                    },
                );
            }
            other => debug!(exc = inner.exc_id, body = ?other.message_type(), "unexpected sync command"),
        }
    }
    // Mailbox gone: the channel died underneath us.
    let _ = inner.status.send_replace(AssignmentStatus::ChannelClosed);
}

/// Commits or discards the negotiated assignment. Without a preceding
/// DoChange the proposal is void and the context resumes on its current
/// working mode.
fn apply_post_change(inner: &Arc<ExcInner>) {
    let pending = inner.sync.lock().unwrap().pending.take();
    let Some(pending) = pending else {
        return;
    };
    if !pending.committed {
        return;
    }

    let new_status = match pending.event {
        SyncEventKind::Quarantine => AssignmentStatus::SyncFailed,
        SyncEventKind::Block => AssignmentStatus::Blocked,
        _ if pending.awm < 0 => AssignmentStatus::Blocked,
        _ => AssignmentStatus::Assigned(WorkingModeAssignment {
            awm_id: pending.awm as u8,
            systems: pending.systems,
        }),
    };

    if matches!(new_status, AssignmentStatus::Assigned(_)) {
        // New allocation: restart the statistics and rearm the profile
        // limiter so the feedback loop settles before speaking up.
        let mut cycle = inner.cycle.lock().unwrap();
        cycle.user.clear();
        cycle.system.clear();
        cycle.cpu_usage.clear();
        drop(cycle);
        let mut limiter = inner.limiter.lock().unwrap();
        limiter.waiting_for_sync = true;
        limiter.wait_budget_ms = 0.0;
    }
    let _ = inner.status.send_replace(new_status);
}

/// Waits until the context is outside a work cycle, up to the quiescence
/// window.
async fn wait_for_quiescence(inner: &Arc<ExcInner>) -> bool {
    tokio::time::timeout(QUIESCENCE_WINDOW, async {
        loop {
            let notified = inner.cycle_end.notified();
            if !inner.sync.lock().unwrap().in_cycle {
                return;
            }
            notified.await;
        }
    })
    .await
    .is_ok()
}

/// Performance gap between the declared cycles-per-second goal and the
/// measured rate, relative to the measured rate: positive means the
/// context is under-served and needs more resources.
fn compute_goal_gap(
    goal_min: f64,
    goal_max: f64,
    mean_cycle_ms: f64,
    ci99_ms: f64,
) -> Option<f64> {
    if mean_cycle_ms <= 0.0 {
        return None;
    }
    let pessimistic_ms = mean_cycle_ms + ci99_ms;
    let optimistic_ms = mean_cycle_ms - ci99_ms;
    let cps_avg = 1000.0 / mean_cycle_ms;
    let cps_min = 1000.0 / pessimistic_ms;
    let cps_max = if optimistic_ms > 0.0 {
        1000.0 / optimistic_ms
    } else {
        f64::INFINITY
    };

    let (target, current, bad_allocation) = if goal_min == goal_max {
        (goal_min, cps_min, cps_min < goal_min)
    } else if goal_min == 0.0 {
        (goal_max, cps_max, cps_max > goal_max)
    } else {
        let target = 0.5 * (goal_min + goal_max);
        (
            target,
            cps_avg,
            cps_avg < goal_min || cps_avg > goal_max,
        )
    };
    if !bad_allocation || current <= 0.0 || !current.is_finite() {
        return None;
    }
    Some(((target - current) / current).clamp(GOAL_GAP_FLOOR, GOAL_GAP_CEILING))
}

/// CPU time this process has consumed, in milliseconds, read from
/// `/proc/self/stat` (utime + stime).
fn process_cpu_time_ms() -> u64 {
    let Ok(stat) = std::fs::read_to_string("/proc/self/stat") else {
        return 0;
    };
    // The comm field may contain spaces; fields are counted after the
    // closing parenthesis.
    let Some(after_comm) = stat.rsplit_once(')').map(|(_, rest)| rest) else {
        return 0;
    };
    let mut fields = after_comm.split_whitespace();
    // utime and stime are kernel fields 14 and 15; 11 fields remain
    // between the comm and utime.
    let utime: u64 = fields.nth(11).and_then(|f| f.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    (utime + stime) * CLOCK_TICK_MS
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn an_underserved_context_reports_a_positive_gap() {
        // Goal 30..60 cps, measured 50 ms cycles = 20 cps.
        let gap = compute_goal_gap(30.0, 60.0, 50.0, 0.5).unwrap();
        assert_eq!(gap, GOAL_GAP_CEILING);
    }

    #[test]
    fn an_overserved_context_reports_a_bounded_negative_gap() {
        // Cap-only goal of 60 cps, measured 5 ms cycles = 200 cps.
        let gap = compute_goal_gap(0.0, 60.0, 5.0, 0.1).unwrap();
        assert!(gap < 0.0);
        assert!(gap >= GOAL_GAP_FLOOR);
    }

    #[test]
    fn a_satisfied_goal_reports_no_gap() {
        // Goal 30..60 cps, measured 25 ms cycles = 40 cps.
        assert!(compute_goal_gap(30.0, 60.0, 25.0, 0.5).is_none());
    }

    #[test]
    fn exact_goals_use_the_pessimistic_rate() {
        // Exact goal of 40 cps with high variance: the pessimistic rate
        // dips below the goal even though the mean meets it.
        let gap = compute_goal_gap(40.0, 40.0, 25.0, 10.0).unwrap();
        assert!(gap > 0.0);
    }

    #[test]
    fn cpu_time_is_monotonic() {
        let before = process_cpu_time_ms();
        // Burn a little CPU.
        let mut accumulator = 0u64;
        for value in 0..2_000_000u64 {
            accumulator = accumulator.wrapping_add(value ^ accumulator);
        }
        std::hint::black_box(accumulator);
        assert!(process_cpu_time_ms() >= before);
    }
}
