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

//! The four-phase synchronization protocol.
//!
//! A round moves the set of execution contexts whose working mode changes
//! through PreChange (announce), SyncChange (quiesce), DoChange (actuate)
//! and PostChange (confirm). Phase three is a barrier: nobody is actuated
//! before every responsive participant is quiescent, which is what keeps
//! two contexts from transiently owning the same processing element.
//! Participants that miss a deadline degrade individually; the round keeps
//! going for the rest.

use crate::metrics;
use crate::config::SyncConfig;
use crate::model::exc::{ExcDescriptor, ExcState};
use crate::model::resource::{group_by_system, AssignmentMap};
use crate::rpc::{ChannelError, ChannelRegistry};
use crate::services::accountant::{ResourceAccountant, ViewToken};
use crate::services::applications::ApplicationManager;
use crate::services::platform::AggregatePlatformProxy;
use futures::future::join_all;
use rheostat_common::model::{AwmId, ExcKey};
use rheostat_common::protocol::{ResultCode, RpcBody, SyncEventKind};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Accounting(#[from] crate::services::accountant::AccountingError),
}

/// One context taking part in a round.
pub struct SyncParticipant {
    pub descriptor: Arc<ExcDescriptor>,
    pub event: SyncEventKind,
    /// `None` parks the context (blocked verdict).
    pub next_awm: Option<AwmId>,
    pub assignment: AssignmentMap,
}

pub struct SyncRound {
    pub view: ViewToken,
    pub participants: Vec<SyncParticipant>,
}

/// Where a participant ended up within its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Announced,
    Unresponsive,
    Quiesced,
    NotQuiescent,
    Actuated,
    Quarantined,
    Confirmed,
    Overrun,
}

struct RoundEntry {
    participant: SyncParticipant,
    latency_estimate_ms: u32,
    verdict: Verdict,
}

#[derive(Debug, Default, Clone)]
pub struct RoundOutcome {
    /// Whether the scheduled view was promoted to active.
    pub committed: bool,
    pub completed: Vec<ExcKey>,
    /// Dropped in phase one or two; they resume on their current working
    /// mode and are retried on a later round.
    pub dropped: Vec<ExcKey>,
    /// Failed actuation in phase three; parked in silos.
    pub quarantined: Vec<ExcKey>,
    /// Missed the phase-four deadline but kept their new assignment.
    pub overrun: Vec<ExcKey>,
}

pub struct SyncManager {
    applications: Arc<ApplicationManager>,
    accountant: Arc<ResourceAccountant>,
    platform: Arc<AggregatePlatformProxy>,
    channels: Arc<ChannelRegistry>,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(
        applications: Arc<ApplicationManager>,
        accountant: Arc<ResourceAccountant>,
        platform: Arc<AggregatePlatformProxy>,
        channels: Arc<ChannelRegistry>,
        config: SyncConfig,
    ) -> Self {
        Self {
            applications,
            accountant,
            platform,
            channels,
            config,
        }
    }

    fn deadline_for(&self, participant: &SyncParticipant) -> Duration {
        let config_time = participant
            .next_awm
            .and_then(|awm| participant.descriptor.recipe().working_mode(awm))
            .map(|awm| awm.config_time)
            .unwrap_or(self.config.default_config_time);
        config_time + self.config.phase_slack
    }

    /// Runs a full round. Participants must already be in SYNC with their
    /// next working mode recorded.
    pub async fn synchronize(&self, round: SyncRound) -> Result<RoundOutcome, SyncError> {
        let mut entries: Vec<RoundEntry> = round
            .participants
            .into_iter()
            .map(|participant| RoundEntry {
                participant,
                latency_estimate_ms: 0,
                verdict: Verdict::Announced,
            })
            .collect();
        let view = round.view;

        self.pre_change(&mut entries).await;
        self.sync_change(&mut entries).await;

        let nr_quiesced = entries
            .iter()
            .filter(|entry| entry.verdict == Verdict::Quiesced)
            .count();
        if nr_quiesced == 0 {
            // Failure before phase three: the scheduled view is discarded
            // and everyone resumes on the current working mode.
            self.accountant.discard(view);
            let mut outcome = RoundOutcome::default();
            for entry in &entries {
                self.resume_on_current(entry);
                outcome.dropped.push(entry.participant.descriptor.key());
            }
            info!(
                participants = outcome.dropped.len(),
                "synchronization round aborted, no participant reached quiescence"
            );
            return Ok(outcome);
        }

        // Dropped participants keep running on their current assignment;
        // restore it in the scheduled view before the swap so accounting
        // matches reality after promotion.
        for index in 0..entries.len() {
            if matches!(
                entries[index].verdict,
                Verdict::Unresponsive | Verdict::NotQuiescent
            ) {
                self.restore_current_booking(view, index, &mut entries);
            }
        }

        self.do_change(view, &mut entries).await?;
        self.post_change(&mut entries).await;

        let mut outcome = RoundOutcome {
            committed: true,
            ..RoundOutcome::default()
        };
        for entry in &entries {
            let key = entry.participant.descriptor.key();
            match entry.verdict {
                Verdict::Confirmed => outcome.completed.push(key),
                Verdict::Overrun => outcome.overrun.push(key),
                Verdict::Quarantined => outcome.quarantined.push(key),
                _ => outcome.dropped.push(key),
            }
        }
        info!(
            completed = outcome.completed.len(),
            dropped = outcome.dropped.len(),
            quarantined = outcome.quarantined.len(),
            overrun = outcome.overrun.len(),
            "synchronization round finished"
        );
        Ok(outcome)
    }

    /// Phase 1: announce the proposed working mode and grant; collect
    /// non-binding latency estimates. Refusal is not possible here, only
    /// silence.
    async fn pre_change(&self, entries: &mut [RoundEntry]) {
        let futures = entries.iter().map(|entry| {
            let participant = &entry.participant;
            let deadline = self.deadline_for(participant);
            let key = participant.descriptor.key();
            let channel = self.channels.get(key.pid);
            let body = RpcBody::SyncPreChange {
                event: participant.event,
                awm: participant
                    .next_awm
                    .map(|awm| awm.0 as i8)
                    .unwrap_or(-1),
                systems: group_by_system(&participant.assignment)
                    .iter()
                    .map(|grant| grant.to_wire())
                    .collect(),
            };
            async move {
                let Some(channel) = channel else {
                    return None;
                };
                match channel.request(key.exc_id.0, body, deadline).await {
                    Ok(RpcBody::PreChangeResponse {
                        sync_latency_ms, ..
                    }) => Some(sync_latency_ms),
                    Ok(_) | Err(ChannelError::Closed) | Err(ChannelError::Timeout) => None,
                }
            }
        });
        let estimates = join_all(futures).await;

        for (entry, latency) in entries.iter_mut().zip(estimates) {
            match latency {
                Some(latency_ms) => {
                    entry.latency_estimate_ms = latency_ms;
                    metrics::record_sync_phase_outcome("pre_change", "announced");
                }
                None => {
                    entry.verdict = Verdict::Unresponsive;
                    metrics::record_sync_phase_outcome("pre_change", "unresponsive");
                    warn!(exc = %entry.participant.descriptor.key(), "participant unresponsive in pre-change");
                }
            }
        }
    }

    /// Phase 2: ask every responsive participant to reach a quiescent
    /// point. Participants answering `NotQuiescent`, or not at all, are
    /// dropped from the round and retried later.
    async fn sync_change(&self, entries: &mut [RoundEntry]) {
        let futures = entries.iter().map(|entry| {
            let eligible = entry.verdict == Verdict::Announced;
            let participant = &entry.participant;
            let deadline = self.deadline_for(participant)
                + Duration::from_millis(entry.latency_estimate_ms as u64);
            let key = participant.descriptor.key();
            let channel = self.channels.get(key.pid);
            async move {
                if !eligible {
                    return None;
                }
                let channel = channel?;
                match channel
                    .request(key.exc_id.0, RpcBody::SyncChange, deadline)
                    .await
                {
                    Ok(RpcBody::SyncChangeResponse {
                        result: ResultCode::Ok,
                    }) => Some(Verdict::Quiesced),
                    Ok(_) => Some(Verdict::NotQuiescent),
                    Err(_) => Some(Verdict::NotQuiescent),
                }
            }
        });
        let verdicts = join_all(futures).await;

        for (entry, verdict) in entries.iter_mut().zip(verdicts) {
            if let Some(verdict) = verdict {
                entry.verdict = verdict;
                let outcome = match verdict {
                    Verdict::Quiesced => "quiesced",
                    _ => "not_quiescent",
                };
                metrics::record_sync_phase_outcome("sync_change", outcome);
                if verdict == Verdict::NotQuiescent {
                    debug!(exc = %entry.participant.descriptor.key(), "participant not quiescent, dropped from round");
                }
            }
        }
    }

    /// Phase 3: the point of no return. The scheduled view becomes
    /// active in one swap, then control groups are rewritten. Individual
    /// actuation failures quarantine the context, not the round.
    async fn do_change(
        &self,
        view: ViewToken,
        entries: &mut [RoundEntry],
    ) -> Result<(), SyncError> {
        self.accountant.promote(view)?;

        for entry in entries.iter_mut() {
            if entry.verdict != Verdict::Quiesced {
                continue;
            }
            let descriptor = &entry.participant.descriptor;
            let key = descriptor.key();
            let binding = self.applications.binding(descriptor);

            let actuation = if entry.participant.next_awm.is_some() {
                match self.platform.setup(&binding).await {
                    Ok(()) => {
                        self.platform
                            .map_resources(&binding, &entry.participant.assignment, false)
                            .await
                    }
                    Err(error) => Err(error),
                }
            } else {
                self.platform.reclaim_resources(&binding).await
            };

            match actuation {
                Ok(()) => {
                    entry.verdict = Verdict::Actuated;
                    metrics::record_sync_phase_outcome("do_change", "actuated");
                    if let Some(channel) = self.channels.get(key.pid) {
                        let _ = channel.notify(key.exc_id.0, RpcBody::SyncDoChange);
                    }
                }
                Err(error) => {
                    warn!(exc = %key, %error, "actuation failed, quarantining");
                    entry.verdict = Verdict::Quarantined;
                    metrics::record_sync_phase_outcome("do_change", "quarantined");
                    self.accountant.release_exc(key);
                    let _ = self.platform.reclaim_resources(&binding).await;
                    let mut runtime = descriptor.runtime();
                    runtime.next_awm = None;
                    runtime.next_assignment = AssignmentMap::new();
                    runtime.current_awm = None;
                    runtime.current_assignment = AssignmentMap::new();
                    drop(runtime);
                    let _ = descriptor.transition(ExcState::Blocked);
                    self.notify_quarantine(key);
                }
            }
        }
        Ok(())
    }

    /// Phase 4: wait for every actuated participant to confirm it resumed
    /// on the new assignment. A timeout here is logged as an overrun but
    /// the new assignment stands.
    async fn post_change(&self, entries: &mut [RoundEntry]) {
        let futures = entries.iter().map(|entry| {
            let eligible = entry.verdict == Verdict::Actuated;
            let participant = &entry.participant;
            let deadline = self.deadline_for(participant);
            let key = participant.descriptor.key();
            let channel = self.channels.get(key.pid);
            async move {
                if !eligible {
                    return None;
                }
                let channel = channel?;
                match channel
                    .request(key.exc_id.0, RpcBody::SyncPostChange, deadline)
                    .await
                {
                    Ok(RpcBody::PostChangeResponse { .. }) => Some(Verdict::Confirmed),
                    Ok(_) | Err(_) => Some(Verdict::Overrun),
                }
            }
        });
        let confirmations = join_all(futures).await;

        for (entry, verdict) in entries.iter_mut().zip(confirmations) {
            let Some(verdict) = verdict else {
                if matches!(
                    entry.verdict,
                    Verdict::Unresponsive | Verdict::NotQuiescent
                ) {
                    self.resume_on_current(entry);
                }
                continue;
            };
            entry.verdict = verdict;
            self.commit_assignment(entry);
            match verdict {
                Verdict::Confirmed => {
                    metrics::record_sync_phase_outcome("post_change", "confirmed")
                }
                _ => {
                    metrics::record_sync_phase_outcome("post_change", "overrun");
                    warn!(
                        exc = %entry.participant.descriptor.key(),
                        "reconfiguration overrun, no confirmation within the deadline"
                    );
                }
            }
        }
    }

    /// Applies the negotiated working mode to the descriptor and settles
    /// its state.
    fn commit_assignment(&self, entry: &RoundEntry) {
        let descriptor = &entry.participant.descriptor;
        let mut runtime = descriptor.runtime();
        runtime.current_awm = entry.participant.next_awm;
        runtime.current_assignment = entry.participant.assignment.clone();
        runtime.next_awm = None;
        runtime.next_assignment = AssignmentMap::new();
        runtime.next_event = None;
        runtime.profile.valid = false;
        let target = if entry.participant.next_awm.is_some() {
            ExcState::Running
        } else {
            ExcState::Blocked
        };
        let _ = runtime.transition(descriptor.key(), target);
    }

    /// A dropped participant continues on its current assignment; the
    /// synthetic PostChange resets the application-side sync state.
    fn resume_on_current(&self, entry: &RoundEntry) {
        let descriptor = &entry.participant.descriptor;
        let key = descriptor.key();
        {
            let mut runtime = descriptor.runtime();
            runtime.next_awm = None;
            runtime.next_assignment = AssignmentMap::new();
            runtime.next_event = None;
            let target = if runtime.current_awm.is_some() {
                ExcState::Running
            } else {
                ExcState::Scheduling
            };
            let _ = runtime.transition(key, target);
        }
        if let Some(channel) = self.channels.get(key.pid) {
            let _ = channel.notify(key.exc_id.0, RpcBody::SyncPostChange);
        }
    }

    /// Re-books the current assignment of a dropped participant into the
    /// still-tentative view. If the policy gave its resources away the
    /// context cannot keep them; it is parked instead.
    fn restore_current_booking(
        &self,
        view: ViewToken,
        index: usize,
        entries: &mut [RoundEntry],
    ) {
        let (key, current) = {
            let descriptor = &entries[index].participant.descriptor;
            (descriptor.key(), descriptor.runtime().current_assignment.clone())
        };
        if current.is_empty() {
            let _ = self.accountant.unbook(view, key);
            return;
        }
        if let Err(error) = self.accountant.book(view, key, &current, false) {
            warn!(exc = %key, %error, "cannot keep current assignment, parking context");
            let _ = self.accountant.unbook(view, key);
            entries[index].verdict = Verdict::Quarantined;
            let descriptor = &entries[index].participant.descriptor;
            let mut runtime = descriptor.runtime();
            runtime.current_awm = None;
            runtime.current_assignment = AssignmentMap::new();
            drop(runtime);
            let _ = descriptor.transition(ExcState::Blocked);
            self.notify_quarantine(key);
        }
    }

    /// Tells the application it lost this round; a pending
    /// `GetWorkingMode` resolves to `SyncFailed`.
    fn notify_quarantine(&self, key: ExcKey) {
        if let Some(channel) = self.channels.get(key.pid) {
            let _ = channel.notify(
                key.exc_id.0,
                RpcBody::SyncPreChange {
                    event: SyncEventKind::Quarantine,
                    awm: -1,
                    systems: Vec::new(),
                },
            );
            let _ = channel.notify(key.exc_id.0, RpcBody::SyncDoChange);
            let _ = channel.notify(key.exc_id.0, RpcBody::SyncPostChange);
        }
    }
}
