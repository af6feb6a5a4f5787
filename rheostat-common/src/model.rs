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
use std::fmt::{self, Display, Formatter};

/// RPC protocol version spoken by this build. A major mismatch between an
/// application and the daemon terminates pairing with `ProtocolMismatch`.
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

/// Maximum length of an execution context name on the wire, including the
/// terminating NUL.
pub const EXC_NAME_LENGTH: usize = 16;
/// Maximum length of an application name on the wire.
pub const APP_NAME_LENGTH: usize = 32;
/// Maximum length of a recipe name on the wire.
pub const RECIPE_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppPid(pub u32);

impl Display for AppPid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an execution context within its owning application,
/// assigned by the application at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExcId(pub u8);

impl Display for ExcId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique execution context address: the owning application's PID
/// plus the application-local context id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExcKey {
    pub pid: AppPid,
    pub exc_id: ExcId,
}

impl ExcKey {
    pub fn new(pid: AppPid, exc_id: ExcId) -> Self {
        Self { pid, exc_id }
    }
}

impl Display for ExcKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.exc_id)
    }
}

/// Identifier of a working mode within a recipe. Working modes are ordered
/// by their scheduler value, not by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AwmId(pub u8);

impl Display for AwmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Language class declared by the registering application; carried for
/// policy and diagnostics, never interpreted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProgrammingLanguage {
    Undefined = 0,
    Rust = 1,
    Cpp = 2,
    Python = 3,
}

impl From<u8> for ProgrammingLanguage {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Rust,
            2 => Self::Cpp,
            3 => Self::Python,
            _ => Self::Undefined,
        }
    }
}
