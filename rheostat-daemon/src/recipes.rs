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

//! Structural recipe loading. A recipe file is TOML named
//! `<recipe>.toml` in the configured directory; unknown attributes are
//! ignored, missing mandatory attributes are a format error. Loaded
//! recipes are cached and shared by every execution context registered
//! against them.

use crate::config::RecipeConfig;
use crate::model::recipe::{Recipe, StaticResourceConstraint, WorkingMode, MAX_WORKING_MODES};
use crate::model::resource::AssignmentMap;
use rheostat_common::model::AwmId;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("recipe {0} not found")]
    NotFound(String),
    #[error("recipe {name} declares version {found}, the minimum supported version is {minimum}")]
    VersionMismatch {
        name: String,
        found: u32,
        minimum: u32,
    },
    #[error("recipe {name} is malformed: {reason}")]
    Format { name: String, reason: String },
}

#[derive(Debug, Deserialize)]
struct RecipeFile {
    version: u32,
    #[serde(default)]
    priority: u8,
    #[serde(rename = "working_mode")]
    working_modes: Vec<WorkingModeFile>,
    #[serde(rename = "constraint", default)]
    constraints: Vec<ConstraintFile>,
}

#[derive(Debug, Deserialize)]
struct WorkingModeFile {
    id: u8,
    name: String,
    value: u32,
    #[serde(default = "default_config_time_ms")]
    config_time_ms: u64,
    resources: BTreeMap<String, u64>,
}

fn default_config_time_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize)]
struct ConstraintFile {
    resource: String,
    lower: Option<u64>,
    upper: Option<u64>,
}

pub struct RecipeRegistry {
    directory: PathBuf,
    min_version: u32,
    cache: Mutex<HashMap<String, Arc<Recipe>>>,
}

impl RecipeRegistry {
    pub fn new(config: &RecipeConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            min_version: config.min_version,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Loads a recipe by name, serving repeated registrations from the
    /// cache.
    pub fn load(&self, name: &str) -> Result<Arc<Recipe>, RecipeError> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(RecipeError::NotFound(name.to_string()));
        }
        if let Some(recipe) = self.cache.lock().unwrap().get(name) {
            return Ok(Arc::clone(recipe));
        }

        let path = self.directory.join(format!("{name}.toml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|_| RecipeError::NotFound(name.to_string()))?;
        let file: RecipeFile = toml::from_str(&raw).map_err(|error| RecipeError::Format {
            name: name.to_string(),
            reason: error.to_string(),
        })?;

        if file.version < self.min_version {
            return Err(RecipeError::VersionMismatch {
                name: name.to_string(),
                found: file.version,
                minimum: self.min_version,
            });
        }

        let recipe = Arc::new(convert(name, file)?);
        info!(
            recipe = name,
            version = recipe.version,
            working_modes = recipe.working_modes.len(),
            "recipe loaded"
        );
        self.cache
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&recipe));
        Ok(recipe)
    }

    /// Drops cached recipes no execution context references anymore.
    pub fn release_unused(&self) {
        let mut cache = self.cache.lock().unwrap();
        cache.retain(|name, recipe| {
            let still_used = Arc::strong_count(recipe) > 1;
            if !still_used {
                debug!(recipe = name, "recipe released");
            }
            still_used
        });
    }

    #[cfg(test)]
    pub fn cached_count(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

fn convert(name: &str, file: RecipeFile) -> Result<Recipe, RecipeError> {
    let format_error = |reason: String| RecipeError::Format {
        name: name.to_string(),
        reason,
    };

    if file.working_modes.is_empty() {
        return Err(format_error("no working modes declared".to_string()));
    }
    if file.working_modes.len() > MAX_WORKING_MODES {
        return Err(format_error(format!(
            "{} working modes exceed the supported maximum of {MAX_WORKING_MODES}",
            file.working_modes.len()
        )));
    }

    let mut working_modes = Vec::with_capacity(file.working_modes.len());
    let mut seen_ids = 0u64;
    for awm in file.working_modes {
        if awm.id as usize >= MAX_WORKING_MODES {
            return Err(format_error(format!("working mode id {} out of range", awm.id)));
        }
        if seen_ids & (1u64 << awm.id) != 0 {
            return Err(format_error(format!("duplicate working mode id {}", awm.id)));
        }
        seen_ids |= 1u64 << awm.id;

        let mut resources = AssignmentMap::new();
        for (raw_path, quantity) in awm.resources {
            let path = raw_path
                .parse()
                .map_err(|error| format_error(format!("resource path {raw_path:?}: {error}")))?;
            resources.insert(path, quantity);
        }
        working_modes.push(WorkingMode {
            id: AwmId(awm.id),
            name: awm.name,
            value: awm.value,
            config_time: Duration::from_millis(awm.config_time_ms),
            resources,
        });
    }
    working_modes.sort_by_key(|awm| awm.id);

    let mut static_constraints = Vec::with_capacity(file.constraints.len());
    for constraint in file.constraints {
        let path = constraint.resource.parse().map_err(|error| {
            format_error(format!("constraint path {:?}: {error}", constraint.resource))
        })?;
        static_constraints.push(StaticResourceConstraint {
            path,
            lower: constraint.lower,
            upper: constraint.upper,
        });
    }

    Ok(Recipe {
        name: name.to_string(),
        version: file.version,
        priority: file.priority,
        working_modes,
        static_constraints,
    })
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::io::Write;

    fn registry_with(recipes: &[(&str, &str)]) -> (RecipeRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in recipes {
            let mut file = std::fs::File::create(dir.path().join(format!("{name}.toml"))).unwrap();
            file.write_all(body.as_bytes()).unwrap();
        }
        let registry = RecipeRegistry::new(&RecipeConfig {
            directory: dir.path().to_path_buf(),
            min_version: 1,
        });
        (registry, dir)
    }

    const VALID: &str = r#"
version = 1
priority = 2

[[working_mode]]
id = 0
name = "low"
value = 10
config_time_ms = 50

[working_mode.resources]
"sys0.cpu0.pe" = 100

[[working_mode]]
id = 1
name = "high"
value = 30

[working_mode.resources]
"sys0.cpu0.pe" = 200
"sys0.mem0" = 104857600
"#;

    #[test]
    fn a_valid_recipe_loads_and_is_cached() {
        let (registry, _dir) = registry_with(&[("video", VALID)]);
        let first = registry.load("video").unwrap();
        let second = registry.load("video").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.priority, 2);
        assert_eq!(first.working_modes.len(), 2);
        assert_eq!(
            first.working_mode(AwmId(1)).unwrap().resources.len(),
            2
        );
    }

    #[test]
    fn missing_recipes_and_old_versions_are_refused() {
        let (registry, _dir) = registry_with(&[("old", "version = 0\n[[working_mode]]\nid = 0\nname = \"x\"\nvalue = 1\n[working_mode.resources]\n")]);
        assert!(matches!(
            registry.load("absent"),
            Err(RecipeError::NotFound(_))
        ));
        assert!(matches!(
            registry.load("old"),
            Err(RecipeError::VersionMismatch { found: 0, .. })
        ));
    }

    #[test]
    fn structural_defects_are_format_errors() {
        let (registry, _dir) = registry_with(&[
            ("empty", "version = 1\n"),
            (
                "dup",
                r#"
version = 1
[[working_mode]]
id = 0
name = "a"
value = 1
[working_mode.resources]
[[working_mode]]
id = 0
name = "b"
value = 2
[working_mode.resources]
"#,
            ),
        ]);
        assert!(matches!(registry.load("empty"), Err(RecipeError::Format { .. })));
        assert!(matches!(registry.load("dup"), Err(RecipeError::Format { .. })));
    }

    #[test]
    fn unused_recipes_are_dropped_from_the_cache() {
        let (registry, _dir) = registry_with(&[("video", VALID)]);
        let recipe = registry.load("video").unwrap();
        registry.release_unused();
        assert_eq!(registry.cached_count(), 1);
        drop(recipe);
        registry.release_unused();
        assert_eq!(registry.cached_count(), 0);
    }
}
