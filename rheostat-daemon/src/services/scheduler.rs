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

//! The scheduler invoker: a single event loop that coalesces scheduling
//! triggers into serialized rounds. Per round it freezes a snapshot of
//! the registered contexts, runs the policy on a tentative view, computes
//! the set of contexts whose working mode changes and hands that set to
//! the synchronization manager. Constraint changes arriving mid-round take
//! effect in the next round.

use crate::metrics;
use crate::config::SchedulerConfig;
use crate::model::exc::{ExcDescriptor, ExcState};
use crate::model::resource::AssignmentMap;
use crate::services::accountant::{ResourceAccountant, ViewHandle};
use crate::services::applications::ApplicationManager;
use crate::services::platform::AggregatePlatformProxy;
use crate::services::policy::{AwmOption, Policy, PolicyExc, PolicyInput};
use crate::services::sync::{SyncManager, SyncParticipant, SyncRound};
use rheostat_common::model::ExcKey;
use rheostat_common::protocol::SyncEventKind;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Register(ExcKey),
    Unregister(ExcKey),
    Refresh,
    ConstraintChanged(ExcKey),
    RuntimeNotify(ExcKey),
    ScheduleRequest(ExcKey),
    Timer,
}

/// Cheap clonable handle for raising scheduler events from RPC handlers
/// and services.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SchedulerHandle {
    pub fn send(&self, event: SchedulerEvent) {
        // A dropped receiver means the daemon is shutting down.
        let _ = self.sender.send(event);
    }
}

pub struct SchedulerInvoker {
    receiver: mpsc::UnboundedReceiver<SchedulerEvent>,
    applications: Arc<ApplicationManager>,
    accountant: Arc<ResourceAccountant>,
    platform: Arc<AggregatePlatformProxy>,
    sync: Arc<SyncManager>,
    policy: Arc<dyn Policy>,
    config: SchedulerConfig,
    cancellation: CancellationToken,
    round_needed: bool,
    refresh_needed: bool,
}

impl SchedulerInvoker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        applications: Arc<ApplicationManager>,
        accountant: Arc<ResourceAccountant>,
        platform: Arc<AggregatePlatformProxy>,
        sync: Arc<SyncManager>,
        policy: Arc<dyn Policy>,
        config: SchedulerConfig,
        cancellation: CancellationToken,
    ) -> (SchedulerHandle, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            SchedulerHandle { sender },
            Self {
                receiver,
                applications,
                accountant,
                platform,
                sync,
                policy,
                config,
                cancellation,
                round_needed: false,
                refresh_needed: false,
            },
        )
    }

    pub async fn run(mut self) {
        info!(policy = self.policy.name(), "scheduler invoker started");
        loop {
            let pending = self.round_needed || self.has_pending_work();
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                event = self.receiver.recv() => match event {
                    Some(event) => self.absorb(event),
                    None => break,
                },
                _ = tokio::time::sleep(self.config.tick_period), if pending => {
                    self.absorb(SchedulerEvent::Timer);
                }
            }
            // Coalesce everything that arrived in the meantime into this
            // round.
            while let Ok(event) = self.receiver.try_recv() {
                self.absorb(event);
            }
            if self.refresh_needed {
                self.refresh_needed = false;
                self.refresh_platform().await;
            }
            if self.round_needed {
                self.round_needed = false;
                self.run_round().await;
            }
        }
        info!("scheduler invoker stopped");
    }

    fn absorb(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Refresh => {
                self.refresh_needed = true;
                self.round_needed = true;
            }
            SchedulerEvent::Register(key)
            | SchedulerEvent::Unregister(key)
            | SchedulerEvent::ConstraintChanged(key)
            | SchedulerEvent::RuntimeNotify(key)
            | SchedulerEvent::ScheduleRequest(key) => {
                debug!(exc = %key, ?event, "scheduling event");
                self.round_needed = true;
            }
            SchedulerEvent::Timer => {
                self.round_needed = true;
            }
        }
    }

    fn has_pending_work(&self) -> bool {
        self.applications.list().iter().any(|descriptor| {
            let runtime = descriptor.runtime();
            runtime.eligible
                && matches!(
                    runtime.state(),
                    ExcState::Ready | ExcState::Scheduling | ExcState::Blocked
                )
        })
    }

    /// Freezes the ledger, re-runs actuation-substrate validation and
    /// thaws it again. Bookings fail while the refresh is in flight.
    async fn refresh_platform(&self) {
        self.accountant.set_platform_not_ready();
        if let Err(platform_error) = self.platform.refresh().await {
            error!(error = %platform_error, "platform refresh failed");
        }
        self.accountant.set_platform_ready();
    }

    async fn run_round(&mut self) {
        let started = Instant::now();

        // Freeze the policy input.
        let descriptors = self.applications.list();
        let mut snapshot: Vec<(Arc<ExcDescriptor>, PolicyExc)> = Vec::new();
        let mut forced_out: Vec<Arc<ExcDescriptor>> = Vec::new();
        for descriptor in descriptors {
            let runtime = descriptor.runtime();
            match runtime.state() {
                ExcState::New | ExcState::Finished | ExcState::Sync => continue,
                _ => {}
            }
            if !runtime.eligible {
                // A disabled context still running is forced out on this
                // round.
                if runtime.state() == ExcState::Running {
                    drop(runtime);
                    forced_out.push(descriptor);
                }
                continue;
            }
            let options: Vec<AwmOption> = descriptor
                .recipe()
                .working_modes
                .iter()
                .filter(|awm| runtime.is_awm_enabled(awm.id))
                .map(|awm| AwmOption {
                    id: awm.id,
                    value: awm.value,
                    resources: awm.resources.clone(),
                })
                .collect();
            let input = PolicyExc {
                key: descriptor.key(),
                priority: descriptor.recipe().priority,
                state: runtime.state(),
                current_awm: runtime.current_awm,
                goal_gap: if runtime.profile.valid {
                    runtime.profile.goal_gap
                } else {
                    0
                },
                options,
            };
            drop(runtime);
            snapshot.push((descriptor, input));
        }

        if snapshot.is_empty() && forced_out.is_empty() {
            return;
        }

        let token = self.accountant.make_view("scheduled");
        let mut view = ViewHandle::new(&self.accountant, token);

        // The policy never sees forced-out contexts; free their bookings
        // up front so the capacity is redistributable.
        for descriptor in &forced_out {
            let _ = view.unbook(descriptor.key());
        }

        let input = PolicyInput {
            excs: snapshot.iter().map(|(_, input)| input.clone()).collect(),
        };
        let output = match self.policy.schedule(&input, &mut view) {
            Ok(output) => output,
            Err(policy_error) => {
                // The round is aborted; the active view stays untouched.
                warn!(error = %policy_error, "policy failed, aborting round");
                self.accountant.discard(token);
                return;
            }
        };

        // Compute the set of contexts whose assignment actually changes.
        let mut participants: Vec<SyncParticipant> = Vec::new();
        for assignment in output.assignments {
            let Some((descriptor, _)) = snapshot
                .iter()
                .find(|(descriptor, _)| descriptor.key() == assignment.key)
            else {
                warn!(exc = %assignment.key, "policy assigned an unknown context, ignoring");
                continue;
            };
            let (state, current_awm) = {
                let runtime = descriptor.runtime();
                (runtime.state(), runtime.current_awm)
            };
            let event = match (current_awm, assignment.awm) {
                (None, Some(_)) if state == ExcState::Blocked => SyncEventKind::Resume,
                (None, Some(_)) => SyncEventKind::Start,
                (Some(current), Some(next)) if current != next => SyncEventKind::Reconfigure,
                (Some(_), Some(_)) => {
                    // Same working mode; a different resource binding is
                    // still a change the context must synchronize on.
                    let rebound =
                        descriptor.runtime().current_assignment != assignment.resources;
                    if !rebound {
                        continue;
                    }
                    SyncEventKind::Migrate
                }
                (Some(_), None) => SyncEventKind::Block,
                (None, None) => {
                    if state == ExcState::Blocked {
                        continue;
                    }
                    SyncEventKind::Block
                }
            };
            participants.push(SyncParticipant {
                descriptor: Arc::clone(descriptor),
                event,
                next_awm: assignment.awm,
                assignment: assignment.resources,
            });
        }
        for descriptor in forced_out {
            participants.push(SyncParticipant {
                descriptor,
                event: SyncEventKind::Block,
                next_awm: None,
                assignment: AssignmentMap::new(),
            });
        }

        if participants.is_empty() {
            self.accountant.discard(token);
            debug!("round converged, no working mode changes");
            return;
        }

        // Move every participant into SYNC and record its proposal.
        participants.retain(|participant| {
            let descriptor = &participant.descriptor;
            let mut runtime = descriptor.runtime();
            let via_scheduling = matches!(
                runtime.state(),
                ExcState::Ready | ExcState::Running | ExcState::Blocked
            );
            if via_scheduling {
                if runtime
                    .transition(descriptor.key(), ExcState::Scheduling)
                    .is_err()
                {
                    return false;
                }
                runtime.counters.schedule_runs += 1;
            }
            if runtime
                .transition(descriptor.key(), ExcState::Sync)
                .is_err()
            {
                return false;
            }
            runtime.next_awm = participant.next_awm;
            runtime.next_assignment = participant.assignment.clone();
            runtime.next_event = Some(participant.event);
            true
        });

        if participants.is_empty() {
            self.accountant.discard(token);
            return;
        }

        info!(
            participants = participants.len(),
            policy = self.policy.name(),
            "synchronizing scheduling round"
        );
        match self
            .sync
            .synchronize(SyncRound {
                view: token,
                participants,
            })
            .await
        {
            Ok(outcome) => {
                if !outcome.dropped.is_empty() {
                    self.round_needed = true;
                }
                if let Err(inconsistency) = self.accountant.check_consistency() {
                    error!(error = %inconsistency, "ledger inconsistency after round");
                }
            }
            Err(sync_error) => {
                error!(error = %sync_error, "synchronization failed, discarding round");
                self.accountant.discard(token);
            }
        }
        metrics::record_scheduling_round(started.elapsed());
    }
}
