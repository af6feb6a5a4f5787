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

//! Execution context descriptor and its lifecycle state machine.

use crate::model::recipe::Recipe;
use crate::model::resource::AssignmentMap;
use rheostat_common::model::{AwmId, ExcKey, ProgrammingLanguage};
use rheostat_common::protocol::{AwmConstraint, ConstraintKind, SyncEventKind};
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcState {
    New,
    Ready,
    Scheduling,
    Sync,
    Running,
    Blocked,
    Finished,
}

impl ExcState {
    /// Allowed lifecycle edges. `Finished` is reachable from anywhere and
    /// terminal.
    pub fn can_transition(self, to: ExcState) -> bool {
        if to == ExcState::Finished {
            return true;
        }
        matches!(
            (self, to),
            (ExcState::New, ExcState::Ready)
                | (ExcState::Ready, ExcState::Scheduling)
                | (ExcState::Scheduling, ExcState::Sync)
                | (ExcState::Sync, ExcState::Running)
                | (ExcState::Sync, ExcState::Blocked)
                // A dropped sync participant resumes where it was.
                | (ExcState::Sync, ExcState::Scheduling)
                | (ExcState::Running, ExcState::Scheduling)
                | (ExcState::Blocked, ExcState::Scheduling)
        )
    }
}

impl Display for ExcState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Ready => "READY",
            Self::Scheduling => "SCHEDULING",
            Self::Sync => "SYNC",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Finished => "FINISHED",
        };
        write!(f, "{name}")
    }
}

/// Most recent runtime feedback received from the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub valid: bool,
    /// Percent; positive means under-served.
    pub goal_gap: i32,
    pub cpu_usage: i32,
    pub cycle_time_ms: i32,
}

/// Lifetime accounting for one execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExcCounters {
    pub schedule_runs: u64,
    pub reconfigurations: u64,
    pub time_configuring: Duration,
    pub time_blocked: Duration,
    pub time_running: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConstraintOutcome {
    pub mask_changed: bool,
    pub current_invalidated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("invalid transition {from} -> {to} for {key}")]
    InvalidTransition {
        key: ExcKey,
        from: ExcState,
        to: ExcState,
    },
    #[error("recipe {recipe} has no working mode {awm}")]
    UnknownWorkingMode { recipe: String, awm: AwmId },
}

/// Mutable half of an execution context, guarded by the descriptor's lock.
#[derive(Debug)]
pub struct ExcRuntime {
    state: ExcState,
    state_entered: Instant,
    /// Enable/Disable toggle; a disabled context is skipped by the policy
    /// and forced out at the next round.
    pub eligible: bool,
    enabled_mask: u64,
    lower_bound: Option<u8>,
    upper_bound: Option<u8>,
    exact_mask: u64,
    pub current_awm: Option<AwmId>,
    pub current_assignment: AssignmentMap,
    /// Set while a synchronization round is in flight for this context.
    pub next_awm: Option<AwmId>,
    pub next_assignment: AssignmentMap,
    pub next_event: Option<SyncEventKind>,
    pub profile: RuntimeProfile,
    pub counters: ExcCounters,
}

/// A schedulable unit owned by an application. Identity and recipe are
/// fixed at registration; everything else lives behind the runtime lock.
#[derive(Debug)]
pub struct Exc {
    pub key: ExcKey,
    pub name: String,
    pub language: ProgrammingLanguage,
    pub recipe: Arc<Recipe>,
}

#[derive(Debug)]
pub struct ExcDescriptor {
    pub exc: Exc,
    runtime: Mutex<ExcRuntime>,
}

impl ExcDescriptor {
    pub fn new(
        key: ExcKey,
        name: String,
        language: ProgrammingLanguage,
        recipe: Arc<Recipe>,
    ) -> Self {
        let enabled_mask = recipe.statically_enabled_mask();
        Self {
            exc: Exc {
                key,
                name,
                language,
                recipe,
            },
            runtime: Mutex::new(ExcRuntime {
                state: ExcState::New,
                state_entered: Instant::now(),
                eligible: false,
                enabled_mask,
                lower_bound: None,
                upper_bound: None,
                exact_mask: 0,
                current_awm: None,
                current_assignment: AssignmentMap::new(),
                next_awm: None,
                next_assignment: AssignmentMap::new(),
                next_event: None,
                profile: RuntimeProfile::default(),
                counters: ExcCounters::default(),
            }),
        }
    }

    pub fn key(&self) -> ExcKey {
        self.exc.key
    }

    pub fn recipe(&self) -> &Arc<Recipe> {
        &self.exc.recipe
    }

    pub fn runtime(&self) -> MutexGuard<'_, ExcRuntime> {
        self.runtime.lock().unwrap()
    }

    pub fn state(&self) -> ExcState {
        self.runtime().state
    }

    pub fn transition(&self, to: ExcState) -> Result<(), StateError> {
        self.runtime().transition(self.exc.key, to)
    }
}

impl ExcRuntime {
    pub fn state(&self) -> ExcState {
        self.state
    }

    pub fn enabled_mask(&self) -> u64 {
        self.enabled_mask
    }

    pub fn transition(&mut self, key: ExcKey, to: ExcState) -> Result<(), StateError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition(to) {
            return Err(StateError::InvalidTransition {
                key,
                from: self.state,
                to,
            });
        }
        let elapsed = self.state_entered.elapsed();
        match self.state {
            ExcState::Sync => self.counters.time_configuring += elapsed,
            ExcState::Blocked => self.counters.time_blocked += elapsed,
            ExcState::Running => self.counters.time_running += elapsed,
            _ => {}
        }
        if to == ExcState::Running && self.state == ExcState::Sync {
            self.counters.reconfigurations += 1;
        }
        self.state = to;
        self.state_entered = Instant::now();
        Ok(())
    }

    pub fn is_awm_enabled(&self, awm: AwmId) -> bool {
        self.enabled_mask & (1u64 << awm.0) != 0
    }

    /// Applies working-mode constraints. A lower bound disables every mode
    /// with a smaller id, an upper bound every mode with a greater id; an
    /// exact assertion re-adds a single mode to the allowed range. A new
    /// bound of the same kind replaces the previous one. Idempotent under
    /// replay.
    pub fn apply_constraints(
        &mut self,
        recipe: &Recipe,
        constraints: &[AwmConstraint],
    ) -> Result<ConstraintOutcome, StateError> {
        for constraint in constraints {
            if recipe.working_mode(AwmId(constraint.awm_id)).is_none() {
                return Err(StateError::UnknownWorkingMode {
                    recipe: recipe.name.clone(),
                    awm: AwmId(constraint.awm_id),
                });
            }
        }
        for constraint in constraints {
            match constraint.kind {
                ConstraintKind::Lower => self.lower_bound = Some(constraint.awm_id),
                ConstraintKind::Upper => self.upper_bound = Some(constraint.awm_id),
                ConstraintKind::Exact => self.exact_mask |= 1u64 << constraint.awm_id,
            }
        }
        Ok(self.rebuild_enabled_mask(recipe))
    }

    pub fn clear_constraints(&mut self, recipe: &Recipe) -> ConstraintOutcome {
        self.lower_bound = None;
        self.upper_bound = None;
        self.exact_mask = 0;
        self.rebuild_enabled_mask(recipe)
    }

    fn rebuild_enabled_mask(&mut self, recipe: &Recipe) -> ConstraintOutcome {
        let base = recipe.statically_enabled_mask();
        let low = self.lower_bound.unwrap_or(0) as u32;
        let high = self.upper_bound.unwrap_or(recipe.max_awm_id()) as u32;
        let range_mask = if low > high {
            0
        } else {
            let upper_bits = if high + 1 >= 64 {
                u64::MAX
            } else {
                (1u64 << (high + 1)) - 1
            };
            let lower_bits = (1u64 << low) - 1;
            upper_bits & !lower_bits
        };
        let new_mask = base & (range_mask | self.exact_mask);

        let mask_changed = new_mask != self.enabled_mask;
        self.enabled_mask = new_mask;
        let current_invalidated = self
            .current_awm
            .is_some_and(|awm| !self.is_awm_enabled(awm));
        ConstraintOutcome {
            mask_changed,
            current_invalidated,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::recipe::WorkingMode;
    use rheostat_common::model::{AppPid, ExcId};

    fn recipe(nr_modes: u8) -> Arc<Recipe> {
        Arc::new(Recipe {
            name: "test".to_string(),
            version: 1,
            priority: 1,
            working_modes: (0..nr_modes)
                .map(|id| WorkingMode {
                    id: AwmId(id),
                    name: format!("awm{id}"),
                    value: (id as u32 + 1) * 10,
                    config_time: Duration::from_millis(10),
                    resources: AssignmentMap::new(),
                })
                .collect(),
            static_constraints: vec![],
        })
    }

    fn descriptor() -> ExcDescriptor {
        ExcDescriptor::new(
            ExcKey::new(AppPid(100), ExcId(0)),
            "worker".to_string(),
            ProgrammingLanguage::Rust,
            recipe(4),
        )
    }

    #[test]
    fn lifecycle_follows_the_allowed_edges() {
        let exc = descriptor();
        exc.transition(ExcState::Ready).unwrap();
        exc.transition(ExcState::Scheduling).unwrap();
        exc.transition(ExcState::Sync).unwrap();
        exc.transition(ExcState::Running).unwrap();
        assert!(exc.transition(ExcState::Sync).is_err());
        exc.transition(ExcState::Scheduling).unwrap();
        exc.transition(ExcState::Finished).unwrap();
        // Terminal: nothing leaves FINISHED.
        assert!(exc.transition(ExcState::Ready).is_err());
    }

    #[test]
    fn upper_bound_disables_higher_modes() {
        let exc = descriptor();
        let mut runtime = exc.runtime();
        runtime.current_awm = Some(AwmId(2));
        let outcome = runtime
            .apply_constraints(
                exc.recipe(),
                &[AwmConstraint {
                    kind: ConstraintKind::Upper,
                    awm_id: 1,
                }],
            )
            .unwrap();
        assert!(outcome.mask_changed);
        assert!(outcome.current_invalidated);
        assert_eq!(runtime.enabled_mask(), 0b0011);
    }

    #[test]
    fn exact_assertion_extends_the_range() {
        let exc = descriptor();
        let mut runtime = exc.runtime();
        runtime
            .apply_constraints(
                exc.recipe(),
                &[
                    AwmConstraint {
                        kind: ConstraintKind::Upper,
                        awm_id: 1,
                    },
                    AwmConstraint {
                        kind: ConstraintKind::Exact,
                        awm_id: 3,
                    },
                ],
            )
            .unwrap();
        assert_eq!(runtime.enabled_mask(), 0b1011);
    }

    #[test]
    fn clearing_restores_the_recipe_mask_bit_for_bit() {
        let exc = descriptor();
        let mut runtime = exc.runtime();
        let original = runtime.enabled_mask();
        runtime
            .apply_constraints(
                exc.recipe(),
                &[AwmConstraint {
                    kind: ConstraintKind::Lower,
                    awm_id: 2,
                }],
            )
            .unwrap();
        assert_ne!(runtime.enabled_mask(), original);
        runtime.clear_constraints(exc.recipe());
        assert_eq!(runtime.enabled_mask(), original);
    }

    #[test]
    fn same_kind_bound_replaces_the_previous_one() {
        let exc = descriptor();
        let mut runtime = exc.runtime();
        runtime
            .apply_constraints(
                exc.recipe(),
                &[AwmConstraint {
                    kind: ConstraintKind::Upper,
                    awm_id: 0,
                }],
            )
            .unwrap();
        runtime
            .apply_constraints(
                exc.recipe(),
                &[AwmConstraint {
                    kind: ConstraintKind::Upper,
                    awm_id: 2,
                }],
            )
            .unwrap();
        assert_eq!(runtime.enabled_mask(), 0b0111);
    }
}
