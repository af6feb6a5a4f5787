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

//! Host actuation through the control-group filesystem.
//!
//! Per-context groups live under `<root>/<slice>/res/`; the `silos` group
//! next to them is a present-but-starved destination for contexts whose
//! scheduling is pending or which have been quarantined.

use crate::services::platform::{ExcBinding, PlatformError, PlatformProxy};
use crate::config::CgroupConfig;
use crate::model::resource::{group_by_system, AssignmentMap};
use async_trait::async_trait;
use itertools::Itertools;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CPUS_FILE: &str = "cpuset.cpus";
const MEMS_FILE: &str = "cpuset.mems";
const CPU_PERIOD_FILE: &str = "cpu.cfs_period_us";
const CPU_QUOTA_FILE: &str = "cpu.cfs_quota_us";
const MEMORY_LIMIT_FILE: &str = "memory.limit_in_bytes";
const CPU_EXCLUSIVE_FILE: &str = "cpuset.cpu_exclusive";
const PROCS_FILE: &str = "cgroup.procs";
const SILOS_GROUP: &str = "silos";

pub struct HostPlatformProxy {
    res_root: PathBuf,
}

impl HostPlatformProxy {
    pub fn new(config: &CgroupConfig) -> Self {
        Self {
            res_root: config.root.join(&config.slice).join("res"),
        }
    }

    fn exc_dir(&self, exc: &ExcBinding) -> PathBuf {
        self.res_root.join(exc.cgroup_name())
    }

    fn silos_dir(&self) -> PathBuf {
        self.res_root.join(SILOS_GROUP)
    }

    fn write_attribute(path: &Path, value: &str) -> Result<(), PlatformError> {
        fs::write(path, value).map_err(|source| PlatformError::CgroupIo {
            path: path.to_path_buf(),
            source,
        })
    }

    fn create_group(path: &Path) -> Result<(), PlatformError> {
        fs::create_dir_all(path).map_err(|source| PlatformError::CgroupIo {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
impl PlatformProxy for HostPlatformProxy {
    fn id(&self) -> &'static str {
        "host"
    }

    async fn setup(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        Self::create_group(&self.exc_dir(exc))?;
        debug!(exc = %exc.key, group = %exc.cgroup_name(), "control group created");
        Ok(())
    }

    async fn map_resources(
        &self,
        exc: &ExcBinding,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), PlatformError> {
        let grants = group_by_system(assignment);
        let dir = self.exc_dir(exc);

        let cpus = grants
            .iter()
            .flat_map(|grant| grant.processing_elements.iter())
            .join(",");
        let mems = grants
            .iter()
            .flat_map(|grant| grant.memory_nodes.iter())
            .join(",");
        let bandwidth: u64 = grants.iter().map(|grant| grant.cpu_bandwidth).sum();
        let memory_bytes: u64 = grants.iter().map(|grant| grant.memory_bytes).sum();

        let period = exc.cfs_period_us();
        let quota = period * bandwidth / 100;

        Self::write_attribute(&dir.join(CPUS_FILE), &cpus)?;
        if !mems.is_empty() {
            Self::write_attribute(&dir.join(MEMS_FILE), &mems)?;
        }
        Self::write_attribute(&dir.join(CPU_PERIOD_FILE), &period.to_string())?;
        Self::write_attribute(&dir.join(CPU_QUOTA_FILE), &quota.to_string())?;
        if memory_bytes > 0 {
            Self::write_attribute(&dir.join(MEMORY_LIMIT_FILE), &memory_bytes.to_string())?;
        }
        if exclusive {
            Self::write_attribute(&dir.join(CPU_EXCLUSIVE_FILE), "1")?;
        }

        debug!(
            exc = %exc.key,
            cpus = %cpus,
            quota,
            period,
            memory_bytes,
            "control group updated"
        );
        Ok(())
    }

    async fn reclaim_resources(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        // Park the application in silos; its dedicated group keeps
        // existing but no longer carries an allocation.
        Self::write_attribute(&self.silos_dir().join(PROCS_FILE), &exc.key.pid.to_string())?;
        let dir = self.exc_dir(exc);
        Self::write_attribute(&dir.join(CPU_QUOTA_FILE), &MIN_QUOTA.to_string())?;
        debug!(exc = %exc.key, "resources reclaimed, application parked in silos");
        Ok(())
    }

    async fn release(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        let dir = self.exc_dir(exc);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PlatformError::CgroupIo { path: dir, source }),
        }
    }

    async fn refresh(&self) -> Result<(), PlatformError> {
        // The res group is cloned from its parent by creating it in
        // place; the silos group is starved down to a single hardware
        // thread.
        Self::create_group(&self.res_root)?;
        let silos = self.silos_dir();
        Self::create_group(&silos)?;
        Self::write_attribute(&silos.join(CPUS_FILE), "0")?;
        Self::write_attribute(&silos.join(MEMS_FILE), "0")?;
        info!(root = %self.res_root.display(), "control group tree ready");
        Ok(())
    }

    async fn exit(&self) -> Result<(), PlatformError> {
        if let Err(error) = fs::remove_dir_all(&self.res_root) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    root = %self.res_root.display(),
                    %error,
                    "leaving control groups behind, remove the res directory manually"
                );
            }
        }
        Ok(())
    }
}

/// Quota floor handed to reclaimed contexts; enough to service the
/// runtime library, not enough to make progress.
const MIN_QUOTA: u64 = 1_000;
