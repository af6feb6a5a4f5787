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

//! The rheostat daemon: multiplexes the host's compute and memory among
//! registered applications, each of which declares alternative working
//! modes in a recipe and negotiates at run time which one it runs in.

#[cfg(test)]
test_r::enable!();

pub mod config;
pub mod metrics;
pub mod model;
pub mod recipes;
pub mod rpc;
pub mod services;

use crate::config::DaemonConfig;
use crate::rpc::server::RpcContext;
use crate::rpc::ChannelRegistry;
use crate::recipes::RecipeRegistry;
use crate::services::accountant::ResourceAccountant;
use crate::services::applications::ApplicationManager;
use crate::services::platform::description;
use crate::services::platform::host::HostPlatformProxy;
use crate::services::platform::{AggregatePlatformProxy, PlatformProxy};
use crate::services::policy::{Policy, ValueFirstPolicy};
use crate::services::scheduler::{SchedulerHandle, SchedulerInvoker};
use crate::services::sync::SyncManager;
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// The daemon's explicitly constructed service graph.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<DaemonConfig>,
    pub accountant: Arc<ResourceAccountant>,
    pub platform: Arc<AggregatePlatformProxy>,
    pub recipes: Arc<RecipeRegistry>,
    pub applications: Arc<ApplicationManager>,
    pub channels: Arc<ChannelRegistry>,
    pub sync: Arc<SyncManager>,
    pub scheduler: SchedulerHandle,
}

pub struct DaemonBuilder {
    config: DaemonConfig,
    policy: Arc<dyn Policy>,
    local_proxy: Option<Arc<dyn PlatformProxy>>,
}

impl DaemonBuilder {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            policy: Arc::new(ValueFirstPolicy),
            local_proxy: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the host control-group proxy, e.g. with the test proxy.
    pub fn with_local_proxy(mut self, proxy: Arc<dyn PlatformProxy>) -> Self {
        self.local_proxy = proxy.into();
        self
    }

    /// Wires the services, enumerates the platform and spawns the server
    /// tasks.
    pub async fn start(self) -> anyhow::Result<Daemon> {
        let config = Arc::new(self.config);
        std::fs::create_dir_all(&config.runtime_dir)
            .with_context(|| format!("creating runtime dir {}", config.runtime_dir.display()))?;

        let local_proxy = self
            .local_proxy
            .unwrap_or_else(|| Arc::new(HostPlatformProxy::new(&config.cgroups)));
        let platform = Arc::new(AggregatePlatformProxy::new(local_proxy));
        platform
            .refresh()
            .await
            .context("preparing the actuation substrate")?;

        let accountant = Arc::new(ResourceAccountant::new());
        description::enumerate(&accountant, &config.platform)
            .context("platform enumeration")?;

        let recipes = Arc::new(RecipeRegistry::new(&config.recipes));
        let applications = Arc::new(ApplicationManager::new(Arc::clone(&recipes)));
        let channels = Arc::new(ChannelRegistry::new());
        let sync = Arc::new(SyncManager::new(
            Arc::clone(&applications),
            Arc::clone(&accountant),
            Arc::clone(&platform),
            Arc::clone(&channels),
            config.sync.clone(),
        ));

        let cancellation = CancellationToken::new();
        let (scheduler, invoker) = SchedulerInvoker::new(
            Arc::clone(&applications),
            Arc::clone(&accountant),
            Arc::clone(&platform),
            Arc::clone(&sync),
            self.policy,
            config.scheduler.clone(),
            cancellation.clone(),
        );

        let services = Services {
            config: Arc::clone(&config),
            accountant,
            platform: Arc::clone(&platform),
            recipes,
            applications: Arc::clone(&applications),
            channels: Arc::clone(&channels),
            sync,
            scheduler: scheduler.clone(),
        };

        let mut join_set: JoinSet<anyhow::Result<()>> = JoinSet::new();

        join_set.spawn(async move {
            invoker.run().await;
            Ok(())
        });

        let rpc_context = Arc::new(RpcContext {
            applications,
            accountant: Arc::clone(&services.accountant),
            platform: Arc::clone(&platform),
            channels,
            scheduler,
        });
        let socket_path = config.server_socket_path();
        {
            let cancellation = cancellation.clone();
            let socket_path = socket_path.clone();
            join_set
                .spawn(async move { rpc::server::serve(&socket_path, rpc_context, cancellation).await });
        }

        // Platform monitor: periodic health pass over the actuation
        // substrate, plus collection of runtime profiles that have gone
        // stale.
        {
            let cancellation = cancellation.clone();
            let platform = Arc::clone(&platform);
            let applications = Arc::clone(&services.applications);
            let channels = Arc::clone(&services.channels);
            let period = config.platform.monitor_period;
            join_set.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(platform_error) = platform.refresh().await {
                                error!(error = %platform_error, "platform monitor pass failed");
                            }
                            collect_stale_profiles(&applications, &channels).await;
                        }
                    }
                }
                Ok(())
            });
        }

        info!(socket = %socket_path.display(), "daemon started");
        Ok(Daemon {
            services,
            socket_path,
            cancellation,
            join_set,
        })
    }
}

pub struct Daemon {
    pub services: Services,
    pub socket_path: PathBuf,
    cancellation: CancellationToken,
    join_set: JoinSet<anyhow::Result<()>>,
}

impl Daemon {
    /// Runs until a server task fails or the daemon is cancelled.
    pub async fn wait(&mut self) -> anyhow::Result<()> {
        while let Some(result) = self.join_set.join_next().await {
            result.context("server task panicked")??;
        }
        Ok(())
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Orderly shutdown: asks every paired application to stop, tears the
    /// server tasks down and removes every control group the daemon
    /// created.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        for channel in self.services.channels.all() {
            for descriptor in self.services.applications.excs_of(channel.pid()) {
                let _ = channel.notify(
                    descriptor.key().exc_id.0,
                    rheostat_common::protocol::RpcBody::StopExecution { timeout_ms: 1_000 },
                );
            }
        }
        self.cancellation.cancel();
        while let Some(result) = self.join_set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(task_error)) => error!(error = %task_error, "server task failed during shutdown"),
                Err(join_error) if join_error.is_cancelled() => {}
                Err(join_error) => error!(error = %join_error, "server task panicked"),
            }
        }
        self.services.platform.exit().await.ok();
        info!("daemon stopped");
        Ok(())
    }
}

/// Asks every running context with an invalid profile for fresh numbers.
async fn collect_stale_profiles(applications: &ApplicationManager, channels: &ChannelRegistry) {
    use crate::model::exc::ExcState;
    use rheostat_common::protocol::RpcBody;

    for descriptor in applications.list() {
        let key = descriptor.key();
        let stale = {
            let runtime = descriptor.runtime();
            runtime.state() == ExcState::Running && !runtime.profile.valid
        };
        if !stale {
            continue;
        }
        let Some(channel) = channels.get(key.pid) else {
            continue;
        };
        match channel
            .request(
                key.exc_id.0,
                RpcBody::GetProfile,
                std::time::Duration::from_millis(500),
            )
            .await
        {
            Ok(RpcBody::ProfileResponse {
                exec_time_ms,
                mem_time_ms,
            }) => {
                tracing::debug!(exc = %key, exec_time_ms, mem_time_ms, "runtime profile collected");
            }
            _ => {}
        }
    }
}

/// Entry point used by the binary: runs until interrupted, then shuts
/// down cleanly.
pub async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let mut daemon = DaemonBuilder::new(config).start().await?;
    let cancellation = daemon.cancellation();

    tokio::select! {
        result = daemon.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            cancellation.cancel();
        }
    }
    daemon.shutdown().await
}
