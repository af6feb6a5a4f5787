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

use rheostat_common::config::ConfigLoader;
use rheostat_common::tracing::TracingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the well-known server socket inside the runtime directory.
pub const SERVER_SOCKET_NAME: &str = "rheostat.sock";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub tracing: TracingConfig,
    /// Directory holding the server socket; applications must be able to
    /// reach it.
    pub runtime_dir: PathBuf,
    pub recipes: RecipeConfig,
    pub platform: PlatformConfig,
    pub cgroups: CgroupConfig,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
}

impl DaemonConfig {
    pub fn server_socket_path(&self) -> PathBuf {
        self.runtime_dir.join(SERVER_SOCKET_NAME)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            runtime_dir: PathBuf::from("/var/run/rheostat"),
            recipes: RecipeConfig::default(),
            platform: PlatformConfig::default(),
            cgroups: CgroupConfig::default(),
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecipeConfig {
    pub directory: PathBuf,
    /// Recipes declaring a version below this are refused at registration.
    pub min_version: u32,
}

impl Default for RecipeConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/etc/rheostat/recipes"),
            min_version: 1,
        }
    }
}

/// Static inventory the daemon manages. Production deployments describe the
/// host here; the defaults describe a small single-socket machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub systems: Vec<SystemConfig>,
    /// Period of the platform monitor's health pass.
    #[serde(with = "humantime_serde")]
    pub monitor_period: Duration,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            systems: vec![SystemConfig::default()],
            monitor_period: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SystemConfig {
    pub id: u16,
    pub cpus: Vec<CpuConfig>,
    pub memory_nodes: Vec<MemoryNodeConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            id: 0,
            cpus: vec![CpuConfig {
                id: 0,
                processing_elements: 4,
            }],
            memory_nodes: vec![MemoryNodeConfig {
                id: 0,
                capacity_bytes: 8 * 1024 * 1024 * 1024,
            }],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CpuConfig {
    pub id: u16,
    /// Hardware threads exposed by this CPU; each contributes 100 bandwidth
    /// units to the ledger.
    pub processing_elements: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryNodeConfig {
    pub id: u16,
    pub capacity_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Mount point of the control-group hierarchy.
    pub root: PathBuf,
    /// Slice under the root that the daemon owns.
    pub slice: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            slice: "rheostat".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Periodic re-evaluation while there is pending work.
    #[serde(with = "humantime_serde")]
    pub tick_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Added to each participant's recipe-declared configuration time to
    /// form its per-phase deadline.
    #[serde(with = "humantime_serde")]
    pub phase_slack: Duration,
    /// Deadline component used when the recipe declares no configuration
    /// time estimate.
    #[serde(with = "humantime_serde")]
    pub default_config_time: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            phase_slack: Duration::from_millis(250),
            default_config_time: Duration::from_millis(100),
        }
    }
}

pub fn make_config_loader(config_file_path: &Path) -> ConfigLoader<DaemonConfig> {
    ConfigLoader::new(config_file_path)
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn config_is_loadable() {
        make_config_loader(Path::new("config/rheostat.toml"))
            .load()
            .expect("Failed to load config");
    }
}
