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

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Layered configuration loader: compiled-in defaults, overridden by an
/// optional TOML file, overridden by `RHEOSTAT_`-prefixed environment
/// variables (`__` separates nesting levels).
pub struct ConfigLoader<T> {
    pub config_file_path: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: DeserializeOwned + Serialize + Default> ConfigLoader<T> {
    pub fn new(config_file_path: &Path) -> Self {
        Self {
            config_file_path: config_file_path.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(self.config_file_path.clone()))
            .merge(Env::prefixed("RHEOSTAT_").split("__"))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    /// Prints the effective default configuration as TOML, for seeding a
    /// config file.
    pub fn dump_default() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&T::default())
    }
}
