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

//! The scheduling-policy contract and the built-in value-first policy.
//!
//! A policy consumes a frozen snapshot of the registered execution
//! contexts and mutates a tentative accounting view through a handle that
//! enforces the ledger invariants on every write. It never talks to
//! applications and never sees control groups; the scheduler invoker and
//! the synchronization manager own those.

use crate::model::exc::ExcState;
use crate::model::path::ResourcePath;
use crate::model::resource::AssignmentMap;
use crate::services::accountant::ViewHandle;
use rheostat_common::model::{AwmId, ExcKey};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy produced an inconsistent assignment: {0}")]
    Inconsistent(String),
    #[error("policy aborted: {0}")]
    Aborted(String),
}

/// One selectable working mode, demand included.
#[derive(Debug, Clone)]
pub struct AwmOption {
    pub id: AwmId,
    pub value: u32,
    pub resources: AssignmentMap,
}

/// Frozen per-context policy input.
#[derive(Debug, Clone)]
pub struct PolicyExc {
    pub key: ExcKey,
    /// Lower numbers are more important.
    pub priority: u8,
    pub state: ExcState,
    pub current_awm: Option<AwmId>,
    /// Percent; positive means the application asked for more.
    pub goal_gap: i32,
    /// Enabled working modes only, in recipe order.
    pub options: Vec<AwmOption>,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyInput {
    pub excs: Vec<PolicyExc>,
}

/// One placement decision: the chosen working mode (or none, parking the
/// context) and the concrete resources bound to it.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub key: ExcKey,
    pub awm: Option<AwmId>,
    pub resources: AssignmentMap,
}

#[derive(Debug, Clone, Default)]
pub struct PolicyOutput {
    pub assignments: Vec<Assignment>,
}

pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    fn schedule(
        &self,
        input: &PolicyInput,
        view: &mut ViewHandle<'_>,
    ) -> Result<PolicyOutput, PolicyError>;
}

/// Default policy: contexts in priority order (goal gap breaks ties),
/// each placed on its highest-value working mode that fits the tentative
/// view, falling back through lower-value modes, parking the context when
/// nothing fits.
pub struct ValueFirstPolicy;

impl Policy for ValueFirstPolicy {
    fn name(&self) -> &'static str {
        "value-first"
    }

    fn schedule(
        &self,
        input: &PolicyInput,
        view: &mut ViewHandle<'_>,
    ) -> Result<PolicyOutput, PolicyError> {
        let mut ordered: Vec<&PolicyExc> = input.excs.iter().collect();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.goal_gap.cmp(&a.goal_gap))
                .then(a.key.cmp(&b.key))
        });

        let mut output = PolicyOutput::default();
        for exc in ordered {
            // Start from a clean slate so a context competes for its own
            // currently held resources like everyone else.
            view.unbook(exc.key)
                .map_err(|error| PolicyError::Aborted(error.to_string()))?;

            let mut options: Vec<&AwmOption> = exc.options.iter().collect();
            options.sort_by(|a, b| b.value.cmp(&a.value).then(a.id.cmp(&b.id)));

            let mut placed = None;
            for option in options {
                match bind_demand(view, &option.resources) {
                    Some(bound) => {
                        if view.book(exc.key, &bound, false).is_ok() {
                            placed = Some((option.id, bound));
                            break;
                        }
                    }
                    None => continue,
                }
            }

            match placed {
                Some((awm, resources)) => {
                    debug!(exc = %exc.key, %awm, "placed");
                    output.assignments.push(Assignment {
                        key: exc.key,
                        awm: Some(awm),
                        resources,
                    });
                }
                None => {
                    debug!(exc = %exc.key, "no working mode fits, parking");
                    output.assignments.push(Assignment {
                        key: exc.key,
                        awm: None,
                        resources: AssignmentMap::new(),
                    });
                }
            }
        }
        Ok(output)
    }
}

/// Resolves a recipe demand into concrete resources as the view currently
/// stands. Concrete entries pass through; a wildcard entry is spread over
/// the matching resources with free capacity. Returns `None` when the
/// demand cannot be satisfied.
pub fn bind_demand(
    view: &ViewHandle<'_>,
    demand: &AssignmentMap,
) -> Option<AssignmentMap> {
    let mut bound = AssignmentMap::new();
    for (path, quantity) in demand {
        if path.is_concrete() {
            *bound.entry(path.clone()).or_insert(0) += quantity;
            continue;
        }
        let mut remaining = *quantity;
        let candidates = view.resources_matching(path).ok()?;
        for descriptor in candidates {
            if remaining == 0 {
                break;
            }
            let already = bound.get(&descriptor.path).copied().unwrap_or(0);
            let free = descriptor.available().saturating_sub(already);
            if free == 0 {
                continue;
            }
            let take = free.min(remaining);
            *bound.entry(descriptor.path).or_insert(0) += take;
            remaining -= take;
        }
        if remaining > 0 {
            return None;
        }
    }
    Some(bound)
}

/// Smoke test for the built-in policy, reachable from the daemon's
/// `--self-test` flag.
pub fn self_test() -> anyhow::Result<()> {
    use crate::services::accountant::ResourceAccountant;

    let accountant = ResourceAccountant::new();
    for pe in 0..4 {
        accountant.register(ResourcePath::processing_element(0, 0, pe), 100)?;
    }
    accountant.set_platform_ready();

    let demand = |bandwidth: u64| {
        let mut map = AssignmentMap::new();
        map.insert("sys0.cpu0.pe".parse::<ResourcePath>().unwrap(), bandwidth);
        map
    };
    let exc = |pid: u32, priority: u8| PolicyExc {
        key: ExcKey::new(
            rheostat_common::model::AppPid(pid),
            rheostat_common::model::ExcId(0),
        ),
        priority,
        state: ExcState::Scheduling,
        current_awm: None,
        goal_gap: 0,
        options: vec![
            AwmOption {
                id: AwmId(0),
                value: 10,
                resources: demand(100),
            },
            AwmOption {
                id: AwmId(1),
                value: 30,
                resources: demand(300),
            },
        ],
    };

    let input = PolicyInput {
        excs: vec![exc(1, 0), exc(2, 1)],
    };
    let token = accountant.make_view("self-test");
    let mut view = ViewHandle::new(&accountant, token);
    let output = ValueFirstPolicy.schedule(&input, &mut view)?;

    let placed: Vec<Option<AwmId>> = output
        .assignments
        .iter()
        .map(|assignment| assignment.awm)
        .collect();
    anyhow::ensure!(
        placed == vec![Some(AwmId(1)), Some(AwmId(0))],
        "unexpected placement {placed:?}"
    );
    accountant.discard(token);
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::services::accountant::ResourceAccountant;
    use rheostat_common::model::{AppPid, ExcId};

    fn accountant_with_pes(count: u16) -> ResourceAccountant {
        let accountant = ResourceAccountant::new();
        for pe in 0..count {
            accountant
                .register(ResourcePath::processing_element(0, 0, pe), 100)
                .unwrap();
        }
        accountant
            .register(ResourcePath::memory_node(0, 0), 1024 * 1024 * 1024)
            .unwrap();
        accountant.set_platform_ready();
        accountant
    }

    fn demand(bandwidth: u64, memory: u64) -> AssignmentMap {
        let mut map = AssignmentMap::new();
        map.insert("sys0.cpu0.pe".parse::<ResourcePath>().unwrap(), bandwidth);
        if memory > 0 {
            map.insert(ResourcePath::memory_node(0, 0), memory);
        }
        map
    }

    fn exc(pid: u32, priority: u8, demands: &[(u8, u32, u64)]) -> PolicyExc {
        PolicyExc {
            key: ExcKey::new(AppPid(pid), ExcId(0)),
            priority,
            state: ExcState::Scheduling,
            current_awm: None,
            goal_gap: 0,
            options: demands
                .iter()
                .map(|(id, value, bandwidth)| AwmOption {
                    id: AwmId(*id),
                    value: *value,
                    resources: demand(*bandwidth, 0),
                })
                .collect(),
        }
    }

    #[test]
    fn the_highest_value_mode_wins_when_it_fits() {
        let accountant = accountant_with_pes(4);
        let token = accountant.make_view("scheduled");
        let mut view = ViewHandle::new(&accountant, token);
        let input = PolicyInput {
            excs: vec![exc(1, 0, &[(0, 10, 100), (1, 20, 200), (2, 30, 200)])],
        };
        let output = ValueFirstPolicy.schedule(&input, &mut view).unwrap();
        assert_eq!(output.assignments[0].awm, Some(AwmId(2)));
    }

    #[test]
    fn lower_priority_contexts_fall_back_to_smaller_modes() {
        // Four processing elements; both contexts want three of them.
        let accountant = accountant_with_pes(4);
        let token = accountant.make_view("scheduled");
        let mut view = ViewHandle::new(&accountant, token);
        let input = PolicyInput {
            excs: vec![
                exc(1, 0, &[(0, 10, 100), (1, 30, 300)]),
                exc(2, 1, &[(0, 10, 100), (1, 30, 300)]),
            ],
        };
        let output = ValueFirstPolicy.schedule(&input, &mut view).unwrap();
        assert_eq!(output.assignments[0].awm, Some(AwmId(1)));
        assert_eq!(output.assignments[1].awm, Some(AwmId(0)));

        // Every processing element is granted at most once.
        let total_bound: u64 = output
            .assignments
            .iter()
            .flat_map(|assignment| assignment.resources.values())
            .sum();
        assert_eq!(total_bound, 400);
    }

    #[test]
    fn an_unplaceable_context_is_parked() {
        let accountant = accountant_with_pes(1);
        let token = accountant.make_view("scheduled");
        let mut view = ViewHandle::new(&accountant, token);
        let input = PolicyInput {
            excs: vec![
                exc(1, 0, &[(0, 10, 100)]),
                exc(2, 1, &[(0, 10, 100)]),
            ],
        };
        let output = ValueFirstPolicy.schedule(&input, &mut view).unwrap();
        assert_eq!(output.assignments[0].awm, Some(AwmId(0)));
        assert_eq!(output.assignments[1].awm, None);
    }

    #[test]
    fn binding_spreads_a_wildcard_demand_over_free_elements() {
        let accountant = accountant_with_pes(4);
        let token = accountant.make_view("scheduled");
        let view = ViewHandle::new(&accountant, token);
        let bound = bind_demand(&view, &demand(250, 0)).unwrap();
        let per_pe: Vec<u64> = bound.values().copied().collect();
        assert_eq!(per_pe, vec![100, 100, 50]);
        assert!(bind_demand(&view, &demand(500, 0)).is_none());
    }

    #[test]
    fn self_test_passes() {
        self_test().unwrap();
    }
}
