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

//! Registry of live execution contexts. The manager owns each context's
//! descriptor and state machine; everyone else addresses contexts by key.
//! Per-context runtime statistics live in an arena next to the registry
//! rather than inside the descriptors.

use crate::metrics;
use crate::model::exc::{ConstraintOutcome, ExcDescriptor, ExcState, StateError};
use crate::recipes::{RecipeError, RecipeRegistry};
use crate::services::platform::ExcBinding;
use rheostat_common::model::{AppPid, ExcKey, ProgrammingLanguage};
use rheostat_common::protocol::AwmConstraint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ApplicationError {
    #[error("execution context {0} is already registered")]
    AlreadyRegistered(ExcKey),
    #[error("execution context {0} is not registered")]
    NotRegistered(ExcKey),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
}

/// Runtime feedback accumulated per execution context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExcStatistics {
    pub mean_cycle_time_ms: Option<f64>,
    pub last_cpu_usage: Option<i32>,
    pub notifications: u64,
}

pub struct ApplicationManager {
    excs: RwLock<HashMap<ExcKey, Arc<ExcDescriptor>>>,
    recipes: Arc<RecipeRegistry>,
    statistics: Mutex<HashMap<ExcKey, ExcStatistics>>,
}

impl ApplicationManager {
    pub fn new(recipes: Arc<RecipeRegistry>) -> Self {
        Self {
            excs: RwLock::new(HashMap::new()),
            recipes,
            statistics: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new execution context: loads (or reuses) its recipe,
    /// derives the enabled working modes and moves it to READY.
    pub fn register(
        &self,
        key: ExcKey,
        name: &str,
        recipe_name: &str,
        language: ProgrammingLanguage,
    ) -> Result<Arc<ExcDescriptor>, ApplicationError> {
        {
            let excs = self.excs.read().unwrap();
            if excs.contains_key(&key) {
                return Err(ApplicationError::AlreadyRegistered(key));
            }
        }
        let recipe = self.recipes.load(recipe_name)?;
        let descriptor = Arc::new(ExcDescriptor::new(key, name.to_string(), language, recipe));
        descriptor.transition(ExcState::Ready)?;

        let mut excs = self.excs.write().unwrap();
        if excs.contains_key(&key) {
            return Err(ApplicationError::AlreadyRegistered(key));
        }
        excs.insert(key, Arc::clone(&descriptor));
        self.statistics
            .lock()
            .unwrap()
            .insert(key, ExcStatistics::default());
        metrics::record_exc_registered();
        info!(exc = %key, name, recipe = recipe_name, "execution context registered");
        Ok(descriptor)
    }

    pub fn get(&self, key: ExcKey) -> Result<Arc<ExcDescriptor>, ApplicationError> {
        self.excs
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(ApplicationError::NotRegistered(key))
    }

    pub fn list(&self) -> Vec<Arc<ExcDescriptor>> {
        self.excs.read().unwrap().values().cloned().collect()
    }

    pub fn excs_of(&self, pid: AppPid) -> Vec<Arc<ExcDescriptor>> {
        self.excs
            .read()
            .unwrap()
            .values()
            .filter(|descriptor| descriptor.key().pid == pid)
            .cloned()
            .collect()
    }

    pub fn enable(&self, key: ExcKey) -> Result<Arc<ExcDescriptor>, ApplicationError> {
        let descriptor = self.get(key)?;
        descriptor.runtime().eligible = true;
        debug!(exc = %key, "execution context enabled");
        Ok(descriptor)
    }

    pub fn disable(&self, key: ExcKey) -> Result<Arc<ExcDescriptor>, ApplicationError> {
        let descriptor = self.get(key)?;
        descriptor.runtime().eligible = false;
        debug!(exc = %key, "execution context disabled");
        Ok(descriptor)
    }

    /// Tears an execution context down. The caller is responsible for
    /// releasing its resources with the accountant and the platform proxy.
    pub fn unregister(&self, key: ExcKey) -> Result<Arc<ExcDescriptor>, ApplicationError> {
        let descriptor = self
            .excs
            .write()
            .unwrap()
            .remove(&key)
            .ok_or(ApplicationError::NotRegistered(key))?;
        descriptor.transition(ExcState::Finished)?;
        self.statistics.lock().unwrap().remove(&key);
        self.recipes.release_unused();
        metrics::record_exc_finished();
        info!(exc = %key, "execution context unregistered");
        Ok(descriptor)
    }

    /// Channel-death handling: finishes every context owned by the
    /// application and returns them for resource release.
    pub fn on_application_death(&self, pid: AppPid) -> Vec<Arc<ExcDescriptor>> {
        let mut excs = self.excs.write().unwrap();
        let keys: Vec<ExcKey> = excs
            .keys()
            .filter(|key| key.pid == pid)
            .copied()
            .collect();
        let mut finished = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(descriptor) = excs.remove(&key) {
                // `Finished` is reachable from every state.
                let _ = descriptor.transition(ExcState::Finished);
                self.statistics.lock().unwrap().remove(&key);
                metrics::record_exc_finished();
                finished.push(descriptor);
            }
        }
        drop(excs);
        if !finished.is_empty() {
            self.recipes.release_unused();
            info!(%pid, contexts = finished.len(), "application departed");
        }
        finished
    }

    /// Applies working-mode constraints; if the current working mode got
    /// disabled the context goes back to SCHEDULING.
    pub fn set_constraints(
        &self,
        key: ExcKey,
        constraints: &[AwmConstraint],
    ) -> Result<ConstraintOutcome, ApplicationError> {
        let descriptor = self.get(key)?;
        let outcome = {
            let mut runtime = descriptor.runtime();
            runtime.apply_constraints(descriptor.recipe(), constraints)?
        };
        if outcome.current_invalidated {
            descriptor.transition(ExcState::Scheduling)?;
            debug!(exc = %key, "current working mode invalidated by constraint");
        }
        Ok(outcome)
    }

    pub fn clear_constraints(&self, key: ExcKey) -> Result<ConstraintOutcome, ApplicationError> {
        let descriptor = self.get(key)?;
        let outcome = {
            let mut runtime = descriptor.runtime();
            runtime.clear_constraints(descriptor.recipe())
        };
        Ok(outcome)
    }

    /// Stores application-reported runtime feedback for the policy and
    /// the actuation layer.
    pub fn record_runtime_profile(
        &self,
        key: ExcKey,
        goal_gap: i32,
        cpu_usage: i32,
        cycle_time_ms: i32,
    ) -> Result<(), ApplicationError> {
        let descriptor = self.get(key)?;
        {
            let mut runtime = descriptor.runtime();
            runtime.profile.valid = true;
            runtime.profile.goal_gap = goal_gap;
            runtime.profile.cpu_usage = cpu_usage;
            runtime.profile.cycle_time_ms = cycle_time_ms;
        }
        let mut statistics = self.statistics.lock().unwrap();
        let entry = statistics.entry(key).or_default();
        entry.notifications += 1;
        entry.last_cpu_usage = Some(cpu_usage);
        entry.mean_cycle_time_ms = Some(match entry.mean_cycle_time_ms {
            // Exponential smoothing keeps the period estimate stable.
            Some(mean) => 0.5 * mean + 0.5 * cycle_time_ms as f64,
            None => cycle_time_ms as f64,
        });
        Ok(())
    }

    pub fn statistics(&self, key: ExcKey) -> Option<ExcStatistics> {
        self.statistics.lock().unwrap().get(&key).copied()
    }

    /// Actuation view of a context, including the measured cycle time the
    /// platform proxy derives the CFS period from.
    pub fn binding(&self, descriptor: &ExcDescriptor) -> ExcBinding {
        let cycle_time_us = self
            .statistics(descriptor.key())
            .and_then(|statistics| statistics.mean_cycle_time_ms)
            .map(|ms| (ms * 1000.0) as u64);
        ExcBinding {
            key: descriptor.key(),
            name: descriptor.exc.name.clone(),
            cycle_time_us,
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::RecipeConfig;
    use rheostat_common::model::ExcId;
    use std::io::Write;

    const RECIPE: &str = r#"
version = 1

[[working_mode]]
id = 0
name = "low"
value = 10

[working_mode.resources]
"sys0.cpu0.pe" = 100

[[working_mode]]
id = 1
name = "high"
value = 20

[working_mode.resources]
"sys0.cpu0.pe" = 200
"#;

    fn manager() -> (ApplicationManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("demo.toml")).unwrap();
        file.write_all(RECIPE.as_bytes()).unwrap();
        let registry = Arc::new(RecipeRegistry::new(&RecipeConfig {
            directory: dir.path().to_path_buf(),
            min_version: 1,
        }));
        (ApplicationManager::new(registry), dir)
    }

    fn key(pid: u32, exc: u8) -> ExcKey {
        ExcKey::new(AppPid(pid), ExcId(exc))
    }

    #[test]
    fn registration_is_unique_per_key() {
        let (manager, _dir) = manager();
        manager
            .register(key(10, 0), "worker", "demo", ProgrammingLanguage::Rust)
            .unwrap();
        assert!(matches!(
            manager.register(key(10, 0), "worker", "demo", ProgrammingLanguage::Rust),
            Err(ApplicationError::AlreadyRegistered(_))
        ));
        // A second context of the same application is fine.
        manager
            .register(key(10, 1), "helper", "demo", ProgrammingLanguage::Rust)
            .unwrap();
    }

    #[test]
    fn registration_failure_leaves_no_trace() {
        let (manager, _dir) = manager();
        assert!(matches!(
            manager.register(key(10, 0), "worker", "absent", ProgrammingLanguage::Rust),
            Err(ApplicationError::Recipe(RecipeError::NotFound(_)))
        ));
        assert!(manager.list().is_empty());
        assert!(manager.statistics(key(10, 0)).is_none());
    }

    #[test]
    fn application_death_finishes_every_owned_context() {
        let (manager, _dir) = manager();
        manager
            .register(key(10, 0), "worker", "demo", ProgrammingLanguage::Rust)
            .unwrap();
        manager
            .register(key(10, 1), "helper", "demo", ProgrammingLanguage::Rust)
            .unwrap();
        manager
            .register(key(11, 0), "other", "demo", ProgrammingLanguage::Rust)
            .unwrap();

        let finished = manager.on_application_death(AppPid(10));
        assert_eq!(finished.len(), 2);
        assert!(finished
            .iter()
            .all(|descriptor| descriptor.state() == ExcState::Finished));
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn profile_feedback_feeds_the_statistics_arena() {
        let (manager, _dir) = manager();
        manager
            .register(key(10, 0), "worker", "demo", ProgrammingLanguage::Rust)
            .unwrap();
        manager
            .record_runtime_profile(key(10, 0), 50, 90, 20)
            .unwrap();
        manager
            .record_runtime_profile(key(10, 0), 10, 95, 40)
            .unwrap();
        let statistics = manager.statistics(key(10, 0)).unwrap();
        assert_eq!(statistics.notifications, 2);
        assert_eq!(statistics.mean_cycle_time_ms, Some(30.0));
    }
}
