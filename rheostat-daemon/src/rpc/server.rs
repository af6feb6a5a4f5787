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

//! The well-known server socket and the per-application connection tasks.
//!
//! An application pairs by sending `AppPair` as its first frame; from then
//! on the connection is its private channel. Frames are processed in
//! arrival order on the connection task; closing the stream is the
//! application-death signal.

use crate::metrics;
use crate::rpc::{AppChannel, ChannelRegistry, Outbound};
use crate::services::applications::{ApplicationError, ApplicationManager};
use crate::services::accountant::ResourceAccountant;
use crate::services::platform::AggregatePlatformProxy;
use crate::services::scheduler::{SchedulerEvent, SchedulerHandle};
use crate::recipes::RecipeError;
use anyhow::Context;
use rheostat_common::model::{AppPid, ExcId, ExcKey, PROTOCOL_VERSION_MAJOR};
use rheostat_common::protocol::{read_frame, write_frame, ResultCode, RpcBody, RpcMessage};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct RpcContext {
    pub applications: Arc<ApplicationManager>,
    pub accountant: Arc<ResourceAccountant>,
    pub platform: Arc<AggregatePlatformProxy>,
    pub channels: Arc<ChannelRegistry>,
    pub scheduler: SchedulerHandle,
}

/// Binds the server socket and accepts application connections until
/// cancelled.
pub async fn serve(
    socket_path: &Path,
    context: Arc<RpcContext>,
    cancellation: CancellationToken,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding server socket {}", socket_path.display()))?;
    info!(socket = %socket_path.display(), "RPC channel listening");

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("accepting application connection")?;
                let context = Arc::clone(&context);
                let cancellation = cancellation.clone();
                tokio::spawn(async move {
                    handle_connection(stream, context, cancellation).await;
                });
            }
        }
    }
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    context: Arc<RpcContext>,
    cancellation: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();

    // Pairing: the first frame must introduce the application.
    let pair = match read_frame(&mut reader).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(error) => {
            warn!(%error, "dropping connection before pairing");
            return;
        }
    };
    let (token, pid, app_name) = match &pair.body {
        RpcBody::AppPair {
            major,
            minor,
            app_name,
        } => {
            if *major != PROTOCOL_VERSION_MAJOR {
                warn!(
                    app = app_name,
                    app_version = format!("{major}.{minor}"),
                    "protocol version mismatch"
                );
                let _ = write_frame(
                    &mut writer,
                    &RpcMessage {
                        token: pair.token,
                        app_pid: pair.app_pid,
                        exc_id: 0,
                        body: RpcBody::Response {
                            result: ResultCode::ProtocolMismatch,
                        },
                    },
                )
                .await;
                return;
            }
            (pair.token, AppPid(pair.app_pid), app_name.clone())
        }
        _ => {
            warn!("first frame is not a pairing request, dropping connection");
            return;
        }
    };

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let channel = Arc::new(AppChannel::new(pid, app_name.clone(), outbound));
    if !context.channels.insert(Arc::clone(&channel)) {
        warn!(%pid, "pid already paired, refusing second channel");
        let _ = write_frame(
            &mut writer,
            &RpcMessage {
                token,
                app_pid: pid.0,
                exc_id: 0,
                body: RpcBody::Response {
                    result: ResultCode::AlreadyRegistered,
                },
            },
        )
        .await;
        return;
    }

    // Writer task: drains the outbound queue onto the stream.
    let writer_task = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(message) => {
                    if let Err(error) = write_frame(&mut writer, &message).await {
                        debug!(%error, "outbound stream failed");
                        break;
                    }
                }
                Outbound::Shutdown => break,
            }
        }
    });

    channel.reply(
        token,
        0,
        RpcBody::Response {
            result: ResultCode::Ok,
        },
    );
    metrics::record_application_paired();
    info!(%pid, app = %app_name, "application paired");

    // Reader loop; handlers run here, in arrival order.
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(message)) => {
                    if dispatch(&context, &channel, message).await.is_break() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(%pid, %error, "protocol error, terminating stream");
                    break;
                }
            }
        }
    }

    // Stream gone: the application is dead as far as the manager is
    // concerned. The writer flushes queued replies first.
    context.channels.remove(pid);
    channel.abort_pending();
    channel.close();
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer_task)
        .await
        .is_err()
    {
        debug!(%pid, "writer did not drain in time");
    }
    release_application(&context, pid).await;
    metrics::record_application_departed();
}

/// Finishes every context of a departed application and returns its
/// resources.
async fn release_application(context: &RpcContext, pid: AppPid) {
    let finished = context.applications.on_application_death(pid);
    for descriptor in finished {
        let key = descriptor.key();
        context.accountant.release_exc(key);
        let binding = context.applications.binding(&descriptor);
        if let Err(error) = context.platform.release(&binding).await {
            warn!(exc = %key, %error, "control group release failed");
        }
        context
            .scheduler
            .send(SchedulerEvent::Unregister(key));
    }
}

fn result_code_for(error: &ApplicationError) -> ResultCode {
    match error {
        ApplicationError::AlreadyRegistered(_) => ResultCode::AlreadyRegistered,
        ApplicationError::NotRegistered(_) => ResultCode::NotRegistered,
        ApplicationError::State(_) => ResultCode::InternalError,
        ApplicationError::Recipe(RecipeError::NotFound(_)) => ResultCode::RecipeNotFound,
        ApplicationError::Recipe(RecipeError::VersionMismatch { .. }) => {
            ResultCode::RecipeVersionMismatch
        }
        ApplicationError::Recipe(RecipeError::Format { .. }) => ResultCode::RecipeFormatError,
    }
}

/// Handles one application-originated frame. `Break` ends the stream.
async fn dispatch(
    context: &RpcContext,
    channel: &AppChannel,
    message: RpcMessage,
) -> std::ops::ControlFlow<()> {
    use std::ops::ControlFlow;

    let pid = channel.pid();
    let exc_id = message.exc_id;
    let key = ExcKey::new(pid, ExcId(exc_id));
    let token = message.token;
    let body = message.body;
    let message_type = body.message_type();

    let reply = |result: ResultCode| {
        channel.reply(token, exc_id, RpcBody::Response { result });
    };

    match body {
        RpcBody::ExcRegister {
            exc_name,
            recipe_name,
            language,
        } => {
            let result = match context.applications.register(
                key,
                &exc_name,
                &recipe_name,
                language.into(),
            ) {
                Ok(_) => {
                    context.scheduler.send(SchedulerEvent::Register(key));
                    ResultCode::Ok
                }
                Err(error) => {
                    warn!(exc = %key, %error, "registration refused");
                    result_code_for(&error)
                }
            };
            reply(result);
        }
        RpcBody::ExcUnregister { .. } => {
            let result = match context.applications.unregister(key) {
                Ok(descriptor) => {
                    context.accountant.release_exc(key);
                    let binding = context.applications.binding(&descriptor);
                    if let Err(error) = context.platform.release(&binding).await {
                        warn!(exc = %key, %error, "control group release failed");
                    }
                    context.scheduler.send(SchedulerEvent::Unregister(key));
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcStart => {
            let result = match context.applications.enable(key) {
                Ok(_) => {
                    context
                        .scheduler
                        .send(SchedulerEvent::ScheduleRequest(key));
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcStop => {
            let result = match context.applications.disable(key) {
                Ok(_) => {
                    context
                        .scheduler
                        .send(SchedulerEvent::ScheduleRequest(key));
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcSchedule => {
            let result = match context.applications.get(key) {
                Ok(_) => {
                    context
                        .scheduler
                        .send(SchedulerEvent::ScheduleRequest(key));
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcSetConstraints { constraints } => {
            let result = match context.applications.set_constraints(key, &constraints) {
                Ok(outcome) => {
                    if outcome.mask_changed || outcome.current_invalidated {
                        context
                            .scheduler
                            .send(SchedulerEvent::ConstraintChanged(key));
                    }
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcClearConstraints => {
            let result = match context.applications.clear_constraints(key) {
                Ok(outcome) => {
                    if outcome.mask_changed {
                        context
                            .scheduler
                            .send(SchedulerEvent::ConstraintChanged(key));
                    }
                    ResultCode::Ok
                }
                Err(error) => result_code_for(&error),
            };
            reply(result);
        }
        RpcBody::ExcRuntimeNotify {
            goal_gap,
            cpu_usage,
            cycle_time_ms,
        } => {
            // Fire-and-forget from the application's point of view.
            match context
                .applications
                .record_runtime_profile(key, goal_gap, cpu_usage, cycle_time_ms)
            {
                Ok(()) => context.scheduler.send(SchedulerEvent::RuntimeNotify(key)),
                Err(error) => debug!(exc = %key, %error, "runtime notify for unknown context"),
            }
        }
        RpcBody::AppExit => {
            reply(ResultCode::Ok);
            debug!(%pid, "application announced exit");
            return ControlFlow::Break(());
        }
        body @ (RpcBody::Response { .. }
        | RpcBody::PreChangeResponse { .. }
        | RpcBody::SyncChangeResponse { .. }
        | RpcBody::PostChangeResponse { .. }
        | RpcBody::ProfileResponse { .. }) => {
            channel.complete(token, body);
        }
        RpcBody::AppPair { .. } => {
            warn!(%pid, "duplicate pairing request, terminating stream");
            return ControlFlow::Break(());
        }
        RpcBody::SyncPreChange { .. }
        | RpcBody::SyncChange
        | RpcBody::SyncDoChange
        | RpcBody::SyncPostChange
        | RpcBody::StopExecution { .. }
        | RpcBody::GetProfile => {
            warn!(%pid, ?message_type, "manager-originated message from application, terminating stream");
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}
