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

//! Actuation boundary between the ledger and the operating system.
//!
//! A proxy is a plain capability record with the operations `setup`,
//! `map_resources`, `reclaim_resources`, `release`, `refresh` and `exit`.
//! The aggregate proxy composes a mandatory local proxy with an optional
//! list of auxiliary proxies; every call fans out local-first and the
//! first error aborts the fan-out.

pub mod description;
pub mod host;
pub mod test;

use crate::model::resource::AssignmentMap;
use async_trait::async_trait;
use rheostat_common::model::ExcKey;
use std::path::PathBuf;
use std::sync::Arc;

/// Default CFS period when no cycle-time measurement is available yet.
pub const DEFAULT_CFS_PERIOD_US: u64 = 100_000;
pub const MIN_CFS_PERIOD_US: u64 = 1_000;
pub const MAX_CFS_PERIOD_US: u64 = 1_000_000;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("control group operation on {path} failed: {source}")]
    CgroupIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy {proxy} could not map resources for {exc}: {reason}")]
    MappingFailed {
        proxy: &'static str,
        exc: ExcKey,
        reason: String,
    },
}

/// The slice of an execution context a proxy needs for actuation.
#[derive(Debug, Clone)]
pub struct ExcBinding {
    pub key: ExcKey,
    pub name: String,
    /// Recent mean cycle time, if the application has reported any.
    pub cycle_time_us: Option<u64>,
}

impl ExcBinding {
    /// Control-group directory name: zero-padded pid, name truncated to
    /// six characters, zero-padded context id.
    pub fn cgroup_name(&self) -> String {
        format!(
            "{:05}:{:.6}:{:02}",
            self.key.pid.0, self.name, self.key.exc_id.0
        )
    }

    /// CFS period derived from the measured cycle time, clamped to the
    /// kernel's accepted range.
    pub fn cfs_period_us(&self) -> u64 {
        self.cycle_time_us
            .map(|us| us.clamp(MIN_CFS_PERIOD_US, MAX_CFS_PERIOD_US))
            .unwrap_or(DEFAULT_CFS_PERIOD_US)
    }
}

#[async_trait]
pub trait PlatformProxy: Send + Sync {
    fn id(&self) -> &'static str;

    /// Prepares the per-context actuation state (the control group
    /// directory for the host proxy).
    async fn setup(&self, exc: &ExcBinding) -> Result<(), PlatformError>;

    /// Commits a granted assignment into the actuation state.
    async fn map_resources(
        &self,
        exc: &ExcBinding,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), PlatformError>;

    /// Takes the context's resources back without tearing it down; the
    /// context is parked in the resource-starved quarantine group.
    async fn reclaim_resources(&self, exc: &ExcBinding) -> Result<(), PlatformError>;

    /// Tears down the per-context actuation state.
    async fn release(&self, exc: &ExcBinding) -> Result<(), PlatformError>;

    /// Re-validates the actuation substrate after a topology change.
    async fn refresh(&self) -> Result<(), PlatformError>;

    /// Daemon shutdown: removes everything this proxy created.
    async fn exit(&self) -> Result<(), PlatformError>;
}

/// Local proxy plus auxiliaries; composition is a list, not a hierarchy.
pub struct AggregatePlatformProxy {
    local: Arc<dyn PlatformProxy>,
    auxiliary: Vec<Arc<dyn PlatformProxy>>,
}

impl AggregatePlatformProxy {
    pub fn new(local: Arc<dyn PlatformProxy>) -> Self {
        Self {
            local,
            auxiliary: Vec::new(),
        }
    }

    pub fn with_auxiliary(mut self, proxy: Arc<dyn PlatformProxy>) -> Self {
        self.auxiliary.push(proxy);
        self
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn PlatformProxy>> {
        std::iter::once(&self.local).chain(self.auxiliary.iter())
    }

    pub async fn setup(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.setup(exc).await?;
        }
        Ok(())
    }

    pub async fn map_resources(
        &self,
        exc: &ExcBinding,
        assignment: &AssignmentMap,
        exclusive: bool,
    ) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.map_resources(exc, assignment, exclusive).await?;
        }
        Ok(())
    }

    pub async fn reclaim_resources(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.reclaim_resources(exc).await?;
        }
        Ok(())
    }

    pub async fn release(&self, exc: &ExcBinding) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.release(exc).await?;
        }
        Ok(())
    }

    pub async fn refresh(&self) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.refresh().await?;
        }
        Ok(())
    }

    pub async fn exit(&self) -> Result<(), PlatformError> {
        for proxy in self.all() {
            proxy.exit().await?;
        }
        Ok(())
    }
}
