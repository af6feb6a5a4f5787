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

//! Application-side runtime library: registers execution contexts with
//! the rheostat daemon, blocks in `get_working_mode` until placed,
//! answers the synchronization protocol, and drives the CPS / goal-gap
//! feedback loop.
//!
//! ```no_run
//! # async fn example() -> Result<(), rheostat_rtlib::RtLibError> {
//! use rheostat_rtlib::RuntimeLibrary;
//! use std::path::Path;
//!
//! let runtime = RuntimeLibrary::connect("encoder", Path::new("/var/run/rheostat/rheostat.sock")).await?;
//! let exc = runtime.register("main", "encoder-recipe").await?;
//! exc.enable().await?;
//! loop {
//!     let awm = exc.get_working_mode().await?;
//!     exc.pre_run();
//!     // ... one work cycle under `awm` ...
//!     # let _ = awm;
//!     if !exc.post_run().await? {
//!         break;
//!     }
//! }
//! exc.unregister().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
test_r::enable!();

pub mod channel;
pub mod exc;
pub mod options;
pub mod stats;

pub use exc::{AssignmentStatus, ExcHandle, WorkingModeAssignment};
pub use options::RtLibOptions;
pub use rheostat_common::protocol::{AwmConstraint, ConstraintKind, ResultCode};

use crate::channel::Channel;
use rheostat_common::protocol::{ProtocolError, RpcBody};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum RtLibError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("channel to the resource manager is closed")]
    ChannelClosed,
    #[error("request to the resource manager timed out")]
    Timeout,
    #[error("the resource manager rejected the request: {0:?}")]
    Rejected(ResultCode),
    #[error("no working mode could be assigned")]
    Blocked,
    #[error("execution context is disabled")]
    Disabled,
    #[error("synchronization failed, the context lost its resources")]
    SyncFailed,
    #[error("all execution context ids are in use")]
    OutOfContextIds,
}

enum Mode {
    Managed(Arc<Channel>),
    /// Test hook: no daemon, a forced working mode. Selected by the
    /// `U<id>` environment flag.
    Unmanaged { forced_awm: u8 },
}

/// Per-application entry point; one per paired channel.
pub struct RuntimeLibrary {
    mode: Mode,
    options: Arc<RtLibOptions>,
    app_name: String,
    next_exc_id: AtomicU8,
}

impl RuntimeLibrary {
    /// Connects to the daemon at the given socket, pairing under this
    /// process's pid. Tuning flags are read from the environment.
    pub async fn connect(app_name: &str, socket_path: &Path) -> Result<Self, RtLibError> {
        Self::connect_with_pid(app_name, socket_path, std::process::id()).await
    }

    /// Pairs under an explicit pid. Meant for containers hosting several
    /// logical applications in one process.
    pub async fn connect_with_pid(
        app_name: &str,
        socket_path: &Path,
        pid: u32,
    ) -> Result<Self, RtLibError> {
        let options = Arc::new(RtLibOptions::from_env());
        if let Some(forced_awm) = options.unmanaged_awm {
            info!(app = app_name, forced_awm, "running unmanaged");
            return Ok(Self {
                mode: Mode::Unmanaged { forced_awm },
                options,
                app_name: app_name.to_string(),
                next_exc_id: AtomicU8::new(0),
            });
        }

        let channel = Channel::connect(socket_path, app_name, pid).await?;
        info!(app = app_name, pid, "paired with the resource manager");
        Ok(Self {
            mode: Mode::Managed(channel),
            options,
            app_name: app_name.to_string(),
            next_exc_id: AtomicU8::new(0),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Registers an execution context against a recipe and returns its
    /// handle.
    pub async fn register(
        &self,
        exc_name: &str,
        recipe_name: &str,
    ) -> Result<ExcHandle, RtLibError> {
        let exc_id = self.next_exc_id.fetch_add(1, Ordering::Relaxed);
        if exc_id == u8::MAX {
            return Err(RtLibError::OutOfContextIds);
        }

        match &self.mode {
            Mode::Unmanaged { forced_awm } => Ok(ExcHandle::new_unmanaged(
                exc_id,
                exc_name.to_string(),
                *forced_awm,
                Arc::clone(&self.options),
            )),
            Mode::Managed(channel) => {
                let mailbox = channel.register_mailbox(exc_id);
                let result = channel
                    .request(
                        exc_id,
                        RpcBody::ExcRegister {
                            exc_name: exc_name.to_string(),
                            recipe_name: recipe_name.to_string(),
                            language: rheostat_common::model::ProgrammingLanguage::Rust as u8,
                        },
                    )
                    .await;
                match result {
                    Ok(ResultCode::Ok) => Ok(ExcHandle::new_managed(
                        Arc::clone(channel),
                        exc_id,
                        exc_name.to_string(),
                        Arc::clone(&self.options),
                        mailbox,
                    )),
                    Ok(code) => {
                        channel.drop_mailbox(exc_id);
                        Err(RtLibError::Rejected(code))
                    }
                    Err(error) => {
                        channel.drop_mailbox(exc_id);
                        Err(error)
                    }
                }
            }
        }
    }

    /// Clean unpairing; the daemon releases everything this application
    /// still holds.
    pub async fn exit(self) -> Result<(), RtLibError> {
        if let Mode::Managed(channel) = &self.mode {
            let _ = channel.request(0, RpcBody::AppExit).await;
            channel.close();
        }
        Ok(())
    }
}

impl Drop for RuntimeLibrary {
    fn drop(&mut self) {
        // An abandoned runtime closes its stream; from the daemon's side
        // that is an application death.
        if let Mode::Managed(channel) = &self.mode {
            channel.close();
        }
    }
}
