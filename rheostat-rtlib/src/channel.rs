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

//! Application side of the RPC channel: connects to the daemon's server
//! socket, performs the pairing handshake and demultiplexes the stream
//! into request responses (by token) and per-context sync command
//! mailboxes.

use crate::RtLibError;
use rheostat_common::model::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use rheostat_common::protocol::{
    read_frame, write_frame, MessageType, ResultCode, RpcBody, RpcMessage,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Upper bound on how long the library waits for the daemon to answer a
/// request; well above any sane scheduling latency.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A daemon-originated command delivered to a context mailbox, with the
/// token its reply must echo.
#[derive(Debug)]
pub struct ServerCommand {
    pub token: u32,
    pub body: RpcBody,
}

pub struct Channel {
    pid: u32,
    outbound: mpsc::UnboundedSender<RpcMessage>,
    pending: Mutex<HashMap<u32, oneshot::Sender<RpcBody>>>,
    mailboxes: Mutex<HashMap<u8, mpsc::UnboundedSender<ServerCommand>>>,
    next_token: AtomicU32,
    alive: AtomicBool,
    shutdown: Arc<tokio::sync::Notify>,
}

impl Channel {
    /// Connects and pairs with the daemon.
    pub async fn connect(
        socket_path: &Path,
        app_name: &str,
        pid: u32,
    ) -> Result<Arc<Self>, RtLibError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(rheostat_common::protocol::ProtocolError::from)?;
        let (mut reader, mut writer) = stream.into_split();

        let pair = RpcMessage {
            token: 0,
            app_pid: pid,
            exc_id: 0,
            body: RpcBody::AppPair {
                major: PROTOCOL_VERSION_MAJOR,
                minor: PROTOCOL_VERSION_MINOR,
                app_name: app_name.to_string(),
            },
        };
        write_frame(&mut writer, &pair).await?;
        match read_frame(&mut reader).await? {
            Some(RpcMessage {
                body: RpcBody::Response {
                    result: ResultCode::Ok,
                },
                ..
            }) => {}
            Some(RpcMessage {
                body: RpcBody::Response { result },
                ..
            }) => return Err(RtLibError::Rejected(result)),
            _ => return Err(RtLibError::ChannelClosed),
        }

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<RpcMessage>();
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let channel = Arc::new(Self {
            pid,
            outbound,
            pending: Mutex::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            alive: AtomicBool::new(true),
            shutdown: Arc::clone(&shutdown),
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            if let Err(error) = write_frame(&mut writer, &message).await {
                                debug!(%error, "outbound stream failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            // Dropping the write half closes the stream; the daemon sees
            // end-of-file and treats the application as departed.
        });

        let reader_channel = Arc::clone(&channel);
        tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some(message)) => reader_channel.route(message),
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%error, "channel to the resource manager failed");
                        break;
                    }
                }
            }
            reader_channel.on_closed();
        });

        Ok(channel)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Tears the stream down without a goodbye; the daemon observes
    /// end-of-file.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }

    fn route(&self, message: RpcMessage) {
        match message.message_type() {
            MessageType::SyncPreChange
            | MessageType::SyncChange
            | MessageType::SyncDoChange
            | MessageType::SyncPostChange
            | MessageType::StopExecution
            | MessageType::GetProfile => {
                let mailboxes = self.mailboxes.lock().unwrap();
                match mailboxes.get(&message.exc_id) {
                    Some(mailbox) => {
                        let _ = mailbox.send(ServerCommand {
                            token: message.token,
                            body: message.body,
                        });
                    }
                    None => debug!(
                        exc_id = message.exc_id,
                        "sync command for unknown context, dropped"
                    ),
                }
            }
            _ => {
                match self.pending.lock().unwrap().remove(&message.token) {
                    Some(sender) => {
                        let _ = sender.send(message.body);
                    }
                    None => debug!(token = message.token, "response with unknown token, dropped"),
                }
            }
        }
    }

    fn on_closed(&self) {
        self.alive.store(false, Ordering::Relaxed);
        self.pending.lock().unwrap().clear();
        self.mailboxes.lock().unwrap().clear();
    }

    /// Creates the command mailbox for a context. Must happen before the
    /// registration request so no sync command can race past it.
    pub fn register_mailbox(&self, exc_id: u8) -> mpsc::UnboundedReceiver<ServerCommand> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.mailboxes.lock().unwrap().insert(exc_id, sender);
        receiver
    }

    pub fn drop_mailbox(&self, exc_id: u8) {
        self.mailboxes.lock().unwrap().remove(&exc_id);
    }

    /// Application-originated request; resolves with the daemon's result
    /// code.
    pub async fn request(&self, exc_id: u8, body: RpcBody) -> Result<ResultCode, RtLibError> {
        if !self.is_alive() {
            return Err(RtLibError::ChannelClosed);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().unwrap().insert(token, sender);

        let message = RpcMessage {
            token,
            app_pid: self.pid,
            exc_id,
            body,
        };
        if self.outbound.send(message).is_err() {
            self.pending.lock().unwrap().remove(&token);
            return Err(RtLibError::ChannelClosed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, receiver).await {
            Ok(Ok(RpcBody::Response { result })) => Ok(result),
            Ok(Ok(_)) => Err(RtLibError::ChannelClosed),
            Ok(Err(_)) => Err(RtLibError::ChannelClosed),
            Err(_) => {
                self.pending.lock().unwrap().remove(&token);
                Err(RtLibError::Timeout)
            }
        }
    }

    /// Fire-and-forget application-originated message.
    pub fn notify(&self, exc_id: u8, body: RpcBody) -> Result<(), RtLibError> {
        if !self.is_alive() {
            return Err(RtLibError::ChannelClosed);
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.outbound
            .send(RpcMessage {
                token,
                app_pid: self.pid,
                exc_id,
                body,
            })
            .map_err(|_| RtLibError::ChannelClosed)
    }

    /// Reply to a daemon-originated command, echoing its token.
    pub fn reply(&self, token: u32, exc_id: u8, body: RpcBody) {
        let _ = self.outbound.send(RpcMessage {
            token,
            app_pid: self.pid,
            exc_id,
            body,
        });
    }
}
