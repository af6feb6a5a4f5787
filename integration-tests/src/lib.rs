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

//! Fixtures for the end-to-end scenarios: a daemon wired with the test
//! platform proxy on a temp-dir socket, plus recipe scaffolding.

#[cfg(test)]
test_r::enable!();

use rheostat_common::model::{AppPid, ExcId, ExcKey};
use rheostat_daemon::config::{
    CpuConfig, DaemonConfig, MemoryNodeConfig, PlatformConfig, RecipeConfig, SystemConfig,
};
use rheostat_daemon::services::platform::test::TestPlatformProxy;
use rheostat_daemon::services::platform::PlatformProxy;
use rheostat_daemon::{Daemon, DaemonBuilder, Services};
use rheostat_rtlib::RuntimeLibrary;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One megabyte of memory demand, matching the recipes below.
pub const MB: u64 = 1024 * 1024;

pub struct TestEnvironment {
    pub daemon: Daemon,
    pub proxy: Arc<TestPlatformProxy>,
    pub socket: PathBuf,
    _runtime_dir: TempDir,
    _recipe_dir: TempDir,
}

impl TestEnvironment {
    /// Starts a daemon over a four-element, one-memory-node platform and
    /// the given recipe files.
    pub async fn start(recipes: &[(&str, &str)]) -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();

        let runtime_dir = tempfile::tempdir()?;
        let recipe_dir = tempfile::tempdir()?;
        for (name, body) in recipes {
            std::fs::write(recipe_dir.path().join(format!("{name}.toml")), body)?;
        }

        let mut config = DaemonConfig {
            runtime_dir: runtime_dir.path().to_path_buf(),
            recipes: RecipeConfig {
                directory: recipe_dir.path().to_path_buf(),
                min_version: 1,
            },
            platform: PlatformConfig {
                systems: vec![SystemConfig {
                    id: 0,
                    cpus: vec![CpuConfig {
                        id: 0,
                        processing_elements: 4,
                    }],
                    memory_nodes: vec![MemoryNodeConfig {
                        id: 0,
                        capacity_bytes: 1024 * MB,
                    }],
                }],
                monitor_period: Duration::from_secs(3600),
            },
            ..DaemonConfig::default()
        };
        config.scheduler.tick_period = Duration::from_millis(50);

        let proxy = Arc::new(TestPlatformProxy::new());
        let daemon = DaemonBuilder::new(config)
            .with_local_proxy(Arc::clone(&proxy) as Arc<dyn PlatformProxy>)
            .start()
            .await?;
        let socket = daemon.socket_path.clone();

        Ok(Self {
            daemon,
            proxy,
            socket,
            _runtime_dir: runtime_dir,
            _recipe_dir: recipe_dir,
        })
    }

    pub fn services(&self) -> &Services {
        &self.daemon.services
    }

    /// Connects a logical application under an explicit pid, so several
    /// applications can live in one test process.
    pub async fn connect(&self, app_name: &str, pid: u32) -> anyhow::Result<RuntimeLibrary> {
        Ok(RuntimeLibrary::connect_with_pid(app_name, &self.socket, pid).await?)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.daemon.shutdown().await
    }
}

pub fn exc_key(pid: u32, exc_id: u8) -> ExcKey {
    ExcKey::new(AppPid(pid), ExcId(exc_id))
}

/// Polls the condition until it holds or the timeout expires.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Three working modes with values 10/20/30; the highest demands two
/// processing elements and 100 MB.
pub const THREE_MODES_RECIPE: &str = r#"
version = 1
priority = 1

[[working_mode]]
id = 0
name = "low"
value = 10
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 50

[[working_mode]]
id = 1
name = "mid"
value = 20
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 100
"sys0.mem0" = 52428800

[[working_mode]]
id = 2
name = "high"
value = 30
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 200
"sys0.mem0" = 104857600
"#;

/// Highest mode wants three of the four processing elements.
pub fn contender_recipe(priority: u8) -> String {
    format!(
        r#"
version = 1
priority = {priority}

[[working_mode]]
id = 0
name = "small"
value = 10
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 100

[[working_mode]]
id = 1
name = "wide"
value = 30
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 300
"#
    )
}
