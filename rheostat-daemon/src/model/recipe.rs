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

use crate::model::resource::AssignmentMap;
use crate::model::path::ResourcePath;
use rheostat_common::model::AwmId;
use std::time::Duration;

/// Upper bound on working modes per recipe; the enabled set is a 64-bit
/// mask.
pub const MAX_WORKING_MODES: usize = 64;

/// One operating point declared by a recipe: a resource demand and a
/// scheduler value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingMode {
    pub id: AwmId,
    pub name: String,
    /// Recipe-author score; the scheduler prefers higher values.
    pub value: u32,
    /// Declared estimate of how long the application takes to reconfigure
    /// into this mode.
    pub config_time: Duration,
    pub resources: AssignmentMap,
}

/// Static bound on a resource; working modes whose demand falls outside are
/// disabled for the lifetime of the registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticResourceConstraint {
    pub path: ResourcePath,
    pub lower: Option<u64>,
    pub upper: Option<u64>,
}

/// Immutable, offline-authored description of an application's working
/// modes. Shared by every execution context registered against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub name: String,
    pub version: u32,
    pub priority: u8,
    /// Indexed by working-mode id.
    pub working_modes: Vec<WorkingMode>,
    pub static_constraints: Vec<StaticResourceConstraint>,
}

impl Recipe {
    pub fn working_mode(&self, id: AwmId) -> Option<&WorkingMode> {
        self.working_modes.iter().find(|awm| awm.id == id)
    }

    pub fn max_awm_id(&self) -> u8 {
        self.working_modes
            .iter()
            .map(|awm| awm.id.0)
            .max()
            .unwrap_or(0)
    }

    /// Working modes ordered by descending scheduler value.
    pub fn by_value_desc(&self) -> Vec<&WorkingMode> {
        let mut modes: Vec<&WorkingMode> = self.working_modes.iter().collect();
        modes.sort_by(|a, b| b.value.cmp(&a.value).then(a.id.cmp(&b.id)));
        modes
    }

    /// Bitmask of working modes whose demand respects every static
    /// resource constraint.
    pub fn statically_enabled_mask(&self) -> u64 {
        let mut mask = 0u64;
        for awm in &self.working_modes {
            if self.respects_static_constraints(awm) {
                mask |= 1u64 << awm.id.0;
            }
        }
        mask
    }

    fn respects_static_constraints(&self, awm: &WorkingMode) -> bool {
        self.static_constraints.iter().all(|constraint| {
            let demanded: u64 = awm
                .resources
                .iter()
                .filter(|(path, _)| path.matches(&constraint.path))
                .map(|(_, quantity)| *quantity)
                .sum();
            constraint.lower.is_none_or(|lower| demanded >= lower)
                && constraint.upper.is_none_or(|upper| demanded <= upper)
        })
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::model::path::ResourcePath;

    fn recipe_with_three_modes() -> Recipe {
        let demand = |bandwidth: u64| {
            let mut map = AssignmentMap::new();
            map.insert("sys0.cpu0.pe".parse::<ResourcePath>().unwrap(), bandwidth);
            map
        };
        Recipe {
            name: "three-modes".to_string(),
            version: 1,
            priority: 1,
            working_modes: vec![
                WorkingMode {
                    id: AwmId(0),
                    name: "low".to_string(),
                    value: 10,
                    config_time: Duration::from_millis(50),
                    resources: demand(100),
                },
                WorkingMode {
                    id: AwmId(1),
                    name: "mid".to_string(),
                    value: 20,
                    config_time: Duration::from_millis(50),
                    resources: demand(200),
                },
                WorkingMode {
                    id: AwmId(2),
                    name: "high".to_string(),
                    value: 30,
                    config_time: Duration::from_millis(50),
                    resources: demand(300),
                },
            ],
            static_constraints: vec![],
        }
    }

    #[test]
    fn modes_are_ordered_by_value() {
        let recipe = recipe_with_three_modes();
        let ordered: Vec<u8> = recipe.by_value_desc().iter().map(|awm| awm.id.0).collect();
        assert_eq!(ordered, vec![2, 1, 0]);
    }

    #[test]
    fn static_constraints_disable_violating_modes() {
        let mut recipe = recipe_with_three_modes();
        recipe.static_constraints.push(StaticResourceConstraint {
            path: "sys0.cpu0.pe".parse().unwrap(),
            lower: None,
            upper: Some(250),
        });
        // The 300-bandwidth mode exceeds the upper bound.
        assert_eq!(recipe.statically_enabled_mask(), 0b011);
    }
}
