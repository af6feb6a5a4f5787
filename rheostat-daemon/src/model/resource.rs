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

use crate::model::path::{ResourcePath, ResourceType};
use rheostat_common::protocol::SystemAssignment;
use std::collections::{BTreeMap, BTreeSet};

/// Bandwidth units one fully granted processing element contributes.
pub const PE_BANDWIDTH: u64 = 100;

/// Requested or granted quantity per resource path. Quantities are
/// bandwidth units for processing elements and bytes for memory nodes.
pub type AssignmentMap = BTreeMap<ResourcePath, u64>;

/// A single accountable resource as seen through a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub path: ResourcePath,
    pub total: u64,
    pub reserved: u64,
    pub used: u64,
}

impl ResourceDescriptor {
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.reserved + self.used)
    }
}

/// Per-system summary of an assignment map, in the shape the sync protocol
/// and the platform proxy consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemGrant {
    pub sys_id: u16,
    pub processing_elements: BTreeSet<u16>,
    pub cpus: BTreeSet<u16>,
    pub cpu_bandwidth: u64,
    pub memory_nodes: BTreeSet<u16>,
    pub memory_bytes: u64,
}

impl SystemGrant {
    pub fn to_wire(&self) -> SystemAssignment {
        SystemAssignment {
            sys_id: self.sys_id as i16,
            nr_cpus: self.cpus.len() as u16,
            nr_processing_elements: self.processing_elements.len() as u16,
            cpu_bandwidth: self.cpu_bandwidth as u32,
            memory_bytes: self.memory_bytes,
        }
    }
}

/// Groups an assignment map by system. Entries with a non-compute,
/// non-memory leaf are ignored.
pub fn group_by_system(assignment: &AssignmentMap) -> Vec<SystemGrant> {
    let mut grants: BTreeMap<u16, SystemGrant> = BTreeMap::new();
    for (path, quantity) in assignment {
        let Some(sys_id) = path.system_id() else {
            continue;
        };
        let grant = grants.entry(sys_id).or_insert_with(|| SystemGrant {
            sys_id,
            ..SystemGrant::default()
        });
        match path.leaf_type() {
            Some(ResourceType::ProcessingElement) => {
                if let Some(pe) = path.index_of(ResourceType::ProcessingElement) {
                    grant.processing_elements.insert(pe);
                }
                if let Some(cpu) = path.index_of(ResourceType::Cpu) {
                    grant.cpus.insert(cpu);
                }
                grant.cpu_bandwidth += quantity;
            }
            Some(ResourceType::Memory) => {
                if let Some(node) = path.index_of(ResourceType::Memory) {
                    grant.memory_nodes.insert(node);
                }
                grant.memory_bytes += quantity;
            }
            _ => {}
        }
    }
    grants.into_values().collect()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn grouping_sums_bandwidth_and_memory_per_system() {
        let mut assignment = AssignmentMap::new();
        assignment.insert(ResourcePath::processing_element(0, 0, 0), 100);
        assignment.insert(ResourcePath::processing_element(0, 0, 1), 50);
        assignment.insert(ResourcePath::memory_node(0, 0), 100 * 1024 * 1024);
        assignment.insert(ResourcePath::processing_element(1, 0, 0), 100);

        let grants = group_by_system(&assignment);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].sys_id, 0);
        assert_eq!(grants[0].cpu_bandwidth, 150);
        assert_eq!(
            grants[0].processing_elements,
            BTreeSet::from([0, 1]),
        );
        assert_eq!(grants[0].memory_bytes, 100 * 1024 * 1024);
        assert_eq!(grants[1].sys_id, 1);
        assert_eq!(grants[1].memory_bytes, 0);
    }
}
