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

//! One-shot platform enumeration: turns the configured inventory into
//! ledger entries and marks the platform ready.

use crate::config::PlatformConfig;
use crate::model::path::ResourcePath;
use crate::model::resource::PE_BANDWIDTH;
use crate::services::accountant::{AccountingError, ResourceAccountant};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformSummary {
    pub systems: usize,
    pub processing_elements: usize,
    pub memory_nodes: usize,
}

/// Registers every leaf resource of the configured platform with the
/// accountant and opens the ledger for booking.
pub fn enumerate(
    accountant: &ResourceAccountant,
    config: &PlatformConfig,
) -> Result<PlatformSummary, AccountingError> {
    let mut summary = PlatformSummary {
        systems: config.systems.len(),
        ..PlatformSummary::default()
    };

    for system in &config.systems {
        for cpu in &system.cpus {
            for pe in 0..cpu.processing_elements {
                accountant.register(
                    ResourcePath::processing_element(system.id, cpu.id, pe),
                    PE_BANDWIDTH,
                )?;
                summary.processing_elements += 1;
            }
        }
        for node in &system.memory_nodes {
            accountant.register(
                ResourcePath::memory_node(system.id, node.id),
                node.capacity_bytes,
            )?;
            summary.memory_nodes += 1;
        }
    }

    accountant.set_platform_ready();
    info!(
        systems = summary.systems,
        processing_elements = summary.processing_elements,
        memory_nodes = summary.memory_nodes,
        "platform enumeration complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::PlatformConfig;

    #[test]
    fn default_platform_enumerates_four_processing_elements() {
        let accountant = ResourceAccountant::new();
        let summary = enumerate(&accountant, &PlatformConfig::default()).unwrap();
        assert_eq!(summary.processing_elements, 4);
        assert_eq!(summary.memory_nodes, 1);
        assert!(accountant.is_ready());

        let pattern: ResourcePath = "sys0.cpu0.pe".parse().unwrap();
        assert_eq!(accountant.resources_matching(&pattern).len(), 4);
    }
}
