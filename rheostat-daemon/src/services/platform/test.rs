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

//! In-memory proxy for tests: records every call and mirrors the control
//! group state a host proxy would have produced, without touching the
//! filesystem. Mapping failures can be injected per context to exercise
//! the quarantine path.

use crate::services::platform::{ExcBinding, PlatformError, PlatformProxy};
use crate::model::resource::{group_by_system, AssignmentMap};
use async_trait::async_trait;
use rheostat_common::model::ExcKey;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCall {
    Setup(ExcKey),
    Map(ExcKey),
    Reclaim(ExcKey),
    Release(ExcKey),
    Refresh,
    Exit,
}

/// The control-group shape the host proxy would have written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedCgroup {
    pub cpus: Vec<u16>,
    pub mems: Vec<u16>,
    pub cfs_period_us: u64,
    pub cfs_quota_us: u64,
    pub memory_limit_bytes: Option<u64>,
    pub exclusive: bool,
}

#[derive(Default)]
pub struct TestPlatformProxy {
    journal: Mutex<Vec<PlatformCall>>,
    cgroups: Mutex<HashMap<ExcKey, RecordedCgroup>>,
    quarantined: Mutex<HashSet<ExcKey>>,
    failing: Mutex<HashSet<ExcKey>>,
}

impl TestPlatformProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next and all further `map_resources` calls for the
    /// context fail, to drive phase-3 quarantine tests.
    pub fn fail_mapping_for(&self, exc: ExcKey) {
        self.failing.lock().unwrap().insert(exc);
    }

    pub fn heal_mapping_for(&self, exc: ExcKey) {
        self.failing.lock().unwrap().remove(&exc);
    }

    pub fn cgroup_of(&self, exc: ExcKey) -> Option<RecordedCgroup> {
        self.cgroups.lock().unwrap().get(&exc).cloned()
    }

    pub fn exists(&self, exc: ExcKey) -> bool {
        self.cgroups.lock().unwrap().contains_key(&exc)
    }

    pub fn is_quarantined(&self, exc: ExcKey) -> bool {
        self.quarantined.lock().unwrap().contains(&exc)
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.journal.lock().unwrap().clone()
    }

    fn record(&self, call: PlatformCall) {
        self.journal.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PlatformProxy for TestPlatformProxy {
    fn id(&self) -> &'static str {
        "test"
    }

    async fn setup(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        self.record(PlatformCall::Setup(exc.key));
        self.cgroups
            .lock()
            .unwrap()
            .entry(exc.key)
            .or_default();
        Ok(())
    }

    async fn map_resources(
        &self,
        exc: &ExcBinding,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::Map(exc.key));
        if self.failing.lock().unwrap().contains(&exc.key) {
            return Err(PlatformError::MappingFailed {
                proxy: self.id(),
                exc: exc.key,
                reason: "injected failure".to_string(),
            });
        }

        let grants = group_by_system(assignment);
        let bandwidth: u64 = grants.iter().map(|grant| grant.cpu_bandwidth).sum();
        let memory_bytes: u64 = grants.iter().map(|grant| grant.memory_bytes).sum();
        let period = exc.cfs_period_us();

        let recorded = RecordedCgroup {
            cpus: grants
                .iter()
                .flat_map(|grant| grant.processing_elements.iter().copied())
                .collect(),
            mems: grants
                .iter()
                .flat_map(|grant| grant.memory_nodes.iter().copied())
                .collect(),
            cfs_period_us: period,
            cfs_quota_us: period * bandwidth / 100,
            memory_limit_bytes: (memory_bytes > 0).then_some(memory_bytes),
            exclusive,
        };
        self.cgroups.lock().unwrap().insert(exc.key, recorded);
        self.quarantined.lock().unwrap().remove(&exc.key);
        Ok(())
    }

    async fn reclaim_resources(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        self.record(PlatformCall::Reclaim(exc.key));
        self.quarantined.lock().unwrap().insert(exc.key);
        if let Some(cgroup) = self.cgroups.lock().unwrap().get_mut(&exc.key) {
            *cgroup = RecordedCgroup {
                cfs_period_us: cgroup.cfs_period_us,
                ..RecordedCgroup::default()
            };
        }
        Ok(())
    }

    async fn release(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        self.record(PlatformCall::Release(exc.key));
        self.cgroups.lock().unwrap().remove(&exc.key);
        self.quarantined.lock().unwrap().remove(&exc.key);
        Ok(())
    }

    async fn refresh(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::Refresh);
        Ok(())
    }

    async fn exit(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::Exit);
        self.cgroups.lock().unwrap().clear();
        Ok(())
    }
}
