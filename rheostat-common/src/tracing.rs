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

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Emit log lines to the console.
    pub console: bool,
    /// Emit JSON instead of the human-readable format.
    pub json: bool,
    /// Directive used when `RUST_LOG` is not set, e.g. `"info"` or
    /// `"rheostat_daemon=debug,info"`.
    pub default_directive: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            console: true,
            json: false,
            default_directive: "info".to_string(),
        }
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the
/// configured default directive. Safe to call once per process; later calls
/// are ignored so tests can share a subscriber.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    if !config.console {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A previously installed subscriber wins.
    let _ = result;
}
