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

//! Manager side of the RPC channel: one paired channel per application,
//! with a writer queue, a monotonic token counter for manager-originated
//! commands and a pending-response table keyed by token.

pub mod server;

use rheostat_common::model::AppPid;
use rheostat_common::protocol::{RpcBody, RpcMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("application channel is closed")]
    Closed,
    #[error("deadline expired waiting for the application")]
    Timeout,
}

/// What travels through an application's writer queue.
#[derive(Debug)]
pub enum Outbound {
    Frame(RpcMessage),
    /// Flush marker: the writer drains everything queued before it, then
    /// closes the stream.
    Shutdown,
}

/// A paired application channel: the writer queue plus the bookkeeping
/// for manager-originated commands.
pub struct AppChannel {
    pid: AppPid,
    app_name: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<HashMap<u32, oneshot::Sender<RpcBody>>>,
    next_token: AtomicU32,
}

impl AppChannel {
    pub fn new(
        pid: AppPid,
        app_name: String,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            pid,
            app_name,
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
        }
    }

    pub fn pid(&self) -> AppPid {
        self.pid
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Sends a manager-originated command and awaits the matching
    /// response until the deadline.
    pub async fn request(
        &self,
        exc_id: u8,
        body: RpcBody,
        deadline: Duration,
    ) -> Result<RpcBody, ChannelError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().insert(token, sender);

        let message = RpcMessage {
            token,
            app_pid: self.pid.0,
            exc_id,
            body,
        };
        if self.outbound.send(Outbound::Frame(message)).is_err() {
            self.pending.lock().unwrap().remove(&token);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&token);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Sends a one-way manager-originated notification.
    pub fn notify(&self, exc_id: u8, body: RpcBody) -> Result<(), ChannelError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.outbound
            .send(Outbound::Frame(RpcMessage {
                token,
                app_pid: self.pid.0,
                exc_id,
                body,
            }))
            .map_err(|_| ChannelError::Closed)
    }

    /// Sends the response to an application-originated request, echoing
    /// its token.
    pub fn reply(&self, token: u32, exc_id: u8, body: RpcBody) {
        let _ = self.outbound.send(Outbound::Frame(RpcMessage {
            token,
            app_pid: self.pid.0,
            exc_id,
            body,
        }));
    }

    /// Asks the writer to flush everything queued so far and close the
    /// stream.
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Shutdown);
    }

    /// Routes an application response to its waiting request. Responses
    /// with unknown tokens are dropped.
    pub fn complete(&self, token: u32, body: RpcBody) {
        match self.pending.lock().unwrap().remove(&token) {
            Some(sender) => {
                let _ = sender.send(body);
            }
            None => debug!(pid = %self.pid, token, "dropping response with unknown token"),
        }
    }

    /// Fails every in-flight request; used when the stream dies.
    pub fn abort_pending(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<AppPid, Arc<AppChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, channel: Arc<AppChannel>) -> bool {
        let mut channels = self.channels.write().unwrap();
        if channels.contains_key(&channel.pid()) {
            return false;
        }
        channels.insert(channel.pid(), channel);
        true
    }

    pub fn remove(&self, pid: AppPid) -> Option<Arc<AppChannel>> {
        self.channels.write().unwrap().remove(&pid)
    }

    pub fn get(&self, pid: AppPid) -> Option<Arc<AppChannel>> {
        self.channels.read().unwrap().get(&pid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<AppChannel>> {
        self.channels.read().unwrap().values().cloned().collect()
    }
}
