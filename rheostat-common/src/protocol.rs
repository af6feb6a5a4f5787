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

//! Framed RPC protocol spoken between applications and the daemon.
//!
//! Every message is one frame: a fixed prelude (`frame_size`,
//! `payload_offset`, `message_type`, all `u16`), then the RPC header
//! (`type`, `token`, `app_pid`, `exc_id`), then a type-specific body.
//! Integers are host-endian; both endpoints live on the same host. Strings
//! are NUL-terminated and length-bounded. Delivery is in-order and
//! at-most-once per stream; a malformed frame is fatal to its stream.

use crate::model::{APP_NAME_LENGTH, EXC_NAME_LENGTH, RECIPE_NAME_LENGTH};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes occupied by the frame prelude; also the `payload_offset` value
/// written by this implementation.
pub const FRAME_PRELUDE_SIZE: usize = 6;
/// Bytes occupied by the RPC header at the start of every payload.
pub const RPC_HEADER_SIZE: usize = 10;

const MAX_FRAME_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o failure on RPC stream: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("truncated frame while reading {0}")]
    Truncated(&'static str),
    #[error("frame message type {frame} does not match header type {header}")]
    HeaderMismatch { frame: u16, header: u8 },
    #[error("{0} exceeds its wire length bound")]
    NameTooLong(&'static str),
    #[error("protocol version mismatch: daemon speaks {daemon_major}.{daemon_minor}, application speaks {app_major}.{app_minor}")]
    VersionMismatch {
        daemon_major: u8,
        daemon_minor: u8,
        app_major: u8,
        app_minor: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // Application originated
    AppPair = 0,
    AppExit = 1,
    Response = 2,
    ExcRegister = 3,
    ExcUnregister = 4,
    ExcStart = 5,
    ExcStop = 6,
    ExcSchedule = 7,
    ExcSetConstraints = 8,
    ExcClearConstraints = 9,
    ExcRuntimeNotify = 10,
    // Manager originated
    SyncPreChange = 16,
    SyncChange = 17,
    SyncDoChange = 18,
    SyncPostChange = 19,
    StopExecution = 20,
    GetProfile = 21,
    // Responses to manager commands
    PreChangeResponse = 24,
    SyncChangeResponse = 25,
    PostChangeResponse = 26,
    ProfileResponse = 27,
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AppPair),
            1 => Ok(Self::AppExit),
            2 => Ok(Self::Response),
            3 => Ok(Self::ExcRegister),
            4 => Ok(Self::ExcUnregister),
            5 => Ok(Self::ExcStart),
            6 => Ok(Self::ExcStop),
            7 => Ok(Self::ExcSchedule),
            8 => Ok(Self::ExcSetConstraints),
            9 => Ok(Self::ExcClearConstraints),
            10 => Ok(Self::ExcRuntimeNotify),
            16 => Ok(Self::SyncPreChange),
            17 => Ok(Self::SyncChange),
            18 => Ok(Self::SyncDoChange),
            19 => Ok(Self::SyncPostChange),
            20 => Ok(Self::StopExecution),
            21 => Ok(Self::GetProfile),
            24 => Ok(Self::PreChangeResponse),
            25 => Ok(Self::SyncChangeResponse),
            26 => Ok(Self::PostChangeResponse),
            27 => Ok(Self::ProfileResponse),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Outcome code carried in response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Blocked = 1,
    Disabled = 2,
    SyncFailed = 3,
    NotQuiescent = 4,
    RecipeNotFound = 5,
    RecipeVersionMismatch = 6,
    RecipeFormatError = 7,
    AlreadyRegistered = 8,
    NotRegistered = 9,
    ProtocolMismatch = 10,
    PlatformNotReady = 11,
    InternalError = 12,
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Blocked,
            2 => Self::Disabled,
            3 => Self::SyncFailed,
            4 => Self::NotQuiescent,
            5 => Self::RecipeNotFound,
            6 => Self::RecipeVersionMismatch,
            7 => Self::RecipeFormatError,
            8 => Self::AlreadyRegistered,
            9 => Self::NotRegistered,
            10 => Self::ProtocolMismatch,
            11 => Self::PlatformNotReady,
            _ => Self::InternalError,
        }
    }
}

/// Why a synchronization round is touching this execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncEventKind {
    /// First assignment after registration.
    Start = 0,
    /// Working mode change while running.
    Reconfigure = 1,
    /// Same working mode, different resource binding.
    Migrate = 2,
    /// No placement was possible; the context is being parked.
    Block = 3,
    /// Placement restored after a blocked period.
    Resume = 4,
    /// Actuation failed mid-round; the context lost its resources and is
    /// parked in the quarantine group.
    Quarantine = 5,
}

impl From<u8> for SyncEventKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Reconfigure,
            2 => Self::Migrate,
            3 => Self::Block,
            4 => Self::Resume,
            5 => Self::Quarantine,
            _ => Self::Start,
        }
    }
}

/// Working-mode constraint kinds, mirroring the registration-time API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConstraintKind {
    Lower = 0,
    Upper = 1,
    Exact = 2,
}

impl From<u8> for ConstraintKind {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Upper,
            2 => Self::Exact,
            _ => Self::Lower,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwmConstraint {
    pub kind: ConstraintKind,
    pub awm_id: u8,
}

/// Per-system slice of a resource grant, carried in PreChange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemAssignment {
    pub sys_id: i16,
    pub nr_cpus: u16,
    pub nr_processing_elements: u16,
    /// Granted CPU bandwidth as a percentage sum over processing elements
    /// (one fully granted element contributes 100).
    pub cpu_bandwidth: u32,
    pub memory_bytes: u64,
}

const SYSTEM_ASSIGNMENT_SIZE: usize = 2 + 2 + 2 + 4 + 8;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcBody {
    AppPair {
        major: u8,
        minor: u8,
        app_name: String,
    },
    AppExit,
    Response {
        result: ResultCode,
    },
    ExcRegister {
        exc_name: String,
        recipe_name: String,
        language: u8,
    },
    ExcUnregister {
        exc_name: String,
    },
    ExcStart,
    ExcStop,
    ExcSchedule,
    ExcSetConstraints {
        constraints: Vec<AwmConstraint>,
    },
    ExcClearConstraints,
    ExcRuntimeNotify {
        goal_gap: i32,
        cpu_usage: i32,
        cycle_time_ms: i32,
    },
    SyncPreChange {
        event: SyncEventKind,
        awm: i8,
        systems: Vec<SystemAssignment>,
    },
    SyncChange,
    SyncDoChange,
    SyncPostChange,
    StopExecution {
        timeout_ms: u32,
    },
    GetProfile,
    PreChangeResponse {
        sync_latency_ms: u32,
        result: ResultCode,
    },
    SyncChangeResponse {
        result: ResultCode,
    },
    PostChangeResponse {
        result: ResultCode,
    },
    ProfileResponse {
        exec_time_ms: u32,
        mem_time_ms: u32,
    },
}

impl RpcBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            RpcBody::AppPair { .. } => MessageType::AppPair,
            RpcBody::AppExit => MessageType::AppExit,
            RpcBody::Response { .. } => MessageType::Response,
            RpcBody::ExcRegister { .. } => MessageType::ExcRegister,
            RpcBody::ExcUnregister { .. } => MessageType::ExcUnregister,
            RpcBody::ExcStart => MessageType::ExcStart,
            RpcBody::ExcStop => MessageType::ExcStop,
            RpcBody::ExcSchedule => MessageType::ExcSchedule,
            RpcBody::ExcSetConstraints { .. } => MessageType::ExcSetConstraints,
            RpcBody::ExcClearConstraints => MessageType::ExcClearConstraints,
            RpcBody::ExcRuntimeNotify { .. } => MessageType::ExcRuntimeNotify,
            RpcBody::SyncPreChange { .. } => MessageType::SyncPreChange,
            RpcBody::SyncChange => MessageType::SyncChange,
            RpcBody::SyncDoChange => MessageType::SyncDoChange,
            RpcBody::SyncPostChange => MessageType::SyncPostChange,
            RpcBody::StopExecution { .. } => MessageType::StopExecution,
            RpcBody::GetProfile => MessageType::GetProfile,
            RpcBody::PreChangeResponse { .. } => MessageType::PreChangeResponse,
            RpcBody::SyncChangeResponse { .. } => MessageType::SyncChangeResponse,
            RpcBody::PostChangeResponse { .. } => MessageType::PostChangeResponse,
            RpcBody::ProfileResponse { .. } => MessageType::ProfileResponse,
        }
    }
}

/// One decoded RPC message: header fields plus the typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub token: u32,
    pub app_pid: u32,
    pub exc_id: u8,
    pub body: RpcBody,
}

impl RpcMessage {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let message_type = self.message_type() as u16;

        let mut buf = BytesMut::with_capacity(64);
        // Prelude; frame_size is patched once the payload is known.
        buf.put_u16_ne(0);
        buf.put_u16_ne(FRAME_PRELUDE_SIZE as u16);
        buf.put_u16_ne(message_type);
        // RPC header
        buf.put_u8(message_type as u8);
        buf.put_u32_ne(self.token);
        buf.put_u32_ne(self.app_pid);
        buf.put_u8(self.exc_id);

        encode_body(&mut buf, &self.body)?;

        let frame_size = buf.len();
        if frame_size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(frame_size));
        }
        let size_bytes = (frame_size as u16).to_ne_bytes();
        buf[0] = size_bytes[0];
        buf[1] = size_bytes[1];
        Ok(buf.freeze())
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = frame;
        if buf.remaining() < FRAME_PRELUDE_SIZE {
            return Err(ProtocolError::Truncated("frame prelude"));
        }
        let _frame_size = buf.get_u16_ne();
        let payload_offset = buf.get_u16_ne() as usize;
        let raw_type = buf.get_u16_ne();
        let message_type = MessageType::try_from(raw_type)?;

        if payload_offset < FRAME_PRELUDE_SIZE || payload_offset > frame.len() {
            return Err(ProtocolError::Truncated("payload offset"));
        }
        let mut payload = &frame[payload_offset..];
        if payload.remaining() < RPC_HEADER_SIZE {
            return Err(ProtocolError::Truncated("rpc header"));
        }
        let header_type = payload.get_u8();
        if header_type != raw_type as u8 {
            return Err(ProtocolError::HeaderMismatch {
                frame: raw_type,
                header: header_type,
            });
        }
        let token = payload.get_u32_ne();
        let app_pid = payload.get_u32_ne();
        let exc_id = payload.get_u8();

        let body = decode_body(message_type, &mut payload)?;

        Ok(Self {
            token,
            app_pid,
            exc_id,
            body,
        })
    }
}

fn encode_body(buf: &mut BytesMut, body: &RpcBody) -> Result<(), ProtocolError> {
    match body {
        RpcBody::AppPair {
            major,
            minor,
            app_name,
        } => {
            buf.put_u8(*major);
            buf.put_u8(*minor);
            put_name(buf, app_name, APP_NAME_LENGTH, "application name")?;
        }
        RpcBody::AppExit
        | RpcBody::ExcStart
        | RpcBody::ExcStop
        | RpcBody::ExcSchedule
        | RpcBody::ExcClearConstraints
        | RpcBody::SyncChange
        | RpcBody::SyncDoChange
        | RpcBody::SyncPostChange
        | RpcBody::GetProfile => {}
        RpcBody::Response { result } => buf.put_u8(*result as u8),
        RpcBody::ExcRegister {
            exc_name,
            recipe_name,
            language,
        } => {
            put_name(buf, exc_name, EXC_NAME_LENGTH, "execution context name")?;
            put_name(buf, recipe_name, RECIPE_NAME_LENGTH, "recipe name")?;
            buf.put_u8(*language);
        }
        RpcBody::ExcUnregister { exc_name } => {
            put_name(buf, exc_name, EXC_NAME_LENGTH, "execution context name")?;
        }
        RpcBody::ExcSetConstraints { constraints } => {
            buf.put_u8(constraints.len() as u8);
            for constraint in constraints {
                buf.put_u8(constraint.kind as u8);
                buf.put_u8(constraint.awm_id);
            }
        }
        RpcBody::ExcRuntimeNotify {
            goal_gap,
            cpu_usage,
            cycle_time_ms,
        } => {
            buf.put_i32_ne(*goal_gap);
            buf.put_i32_ne(*cpu_usage);
            buf.put_i32_ne(*cycle_time_ms);
        }
        RpcBody::SyncPreChange {
            event,
            awm,
            systems,
        } => {
            buf.put_u8(*event as u8);
            buf.put_i8(*awm);
            buf.put_u16_ne(systems.len() as u16);
            for system in systems {
                buf.put_i16_ne(system.sys_id);
                buf.put_u16_ne(system.nr_cpus);
                buf.put_u16_ne(system.nr_processing_elements);
                buf.put_u32_ne(system.cpu_bandwidth);
                buf.put_u64_ne(system.memory_bytes);
            }
        }
        RpcBody::StopExecution { timeout_ms } => buf.put_u32_ne(*timeout_ms),
        RpcBody::PreChangeResponse {
            sync_latency_ms,
            result,
        } => {
            buf.put_u32_ne(*sync_latency_ms);
            buf.put_u8(*result as u8);
        }
        RpcBody::SyncChangeResponse { result } | RpcBody::PostChangeResponse { result } => {
            buf.put_u8(*result as u8);
        }
        RpcBody::ProfileResponse {
            exec_time_ms,
            mem_time_ms,
        } => {
            buf.put_u32_ne(*exec_time_ms);
            buf.put_u32_ne(*mem_time_ms);
        }
    }
    Ok(())
}

fn decode_body(message_type: MessageType, buf: &mut &[u8]) -> Result<RpcBody, ProtocolError> {
    let body = match message_type {
        MessageType::AppPair => {
            ensure(buf, 2, "app pair body")?;
            let major = buf.get_u8();
            let minor = buf.get_u8();
            let app_name = get_name(buf, APP_NAME_LENGTH, "application name")?;
            RpcBody::AppPair {
                major,
                minor,
                app_name,
            }
        }
        MessageType::AppExit => RpcBody::AppExit,
        MessageType::Response => {
            ensure(buf, 1, "response body")?;
            RpcBody::Response {
                result: buf.get_u8().into(),
            }
        }
        MessageType::ExcRegister => {
            let exc_name = get_name(buf, EXC_NAME_LENGTH, "execution context name")?;
            let recipe_name = get_name(buf, RECIPE_NAME_LENGTH, "recipe name")?;
            ensure(buf, 1, "register body")?;
            let language = buf.get_u8();
            RpcBody::ExcRegister {
                exc_name,
                recipe_name,
                language,
            }
        }
        MessageType::ExcUnregister => RpcBody::ExcUnregister {
            exc_name: get_name(buf, EXC_NAME_LENGTH, "execution context name")?,
        },
        MessageType::ExcStart => RpcBody::ExcStart,
        MessageType::ExcStop => RpcBody::ExcStop,
        MessageType::ExcSchedule => RpcBody::ExcSchedule,
        MessageType::ExcSetConstraints => {
            ensure(buf, 1, "constraint count")?;
            let count = buf.get_u8() as usize;
            ensure(buf, count * 2, "constraint entries")?;
            let mut constraints = Vec::with_capacity(count);
            for _ in 0..count {
                let kind = ConstraintKind::from(buf.get_u8());
                let awm_id = buf.get_u8();
                constraints.push(AwmConstraint { kind, awm_id });
            }
            RpcBody::ExcSetConstraints { constraints }
        }
        MessageType::ExcClearConstraints => RpcBody::ExcClearConstraints,
        MessageType::ExcRuntimeNotify => {
            ensure(buf, 12, "runtime notify body")?;
            RpcBody::ExcRuntimeNotify {
                goal_gap: buf.get_i32_ne(),
                cpu_usage: buf.get_i32_ne(),
                cycle_time_ms: buf.get_i32_ne(),
            }
        }
        MessageType::SyncPreChange => {
            ensure(buf, 4, "pre-change body")?;
            let event = SyncEventKind::from(buf.get_u8());
            let awm = buf.get_i8();
            let nr_sys = buf.get_u16_ne() as usize;
            ensure(buf, nr_sys * SYSTEM_ASSIGNMENT_SIZE, "pre-change systems")?;
            let mut systems = Vec::with_capacity(nr_sys);
            for _ in 0..nr_sys {
                systems.push(SystemAssignment {
                    sys_id: buf.get_i16_ne(),
                    nr_cpus: buf.get_u16_ne(),
                    nr_processing_elements: buf.get_u16_ne(),
                    cpu_bandwidth: buf.get_u32_ne(),
                    memory_bytes: buf.get_u64_ne(),
                });
            }
            RpcBody::SyncPreChange {
                event,
                awm,
                systems,
            }
        }
        MessageType::SyncChange => RpcBody::SyncChange,
        MessageType::SyncDoChange => RpcBody::SyncDoChange,
        MessageType::SyncPostChange => RpcBody::SyncPostChange,
        MessageType::StopExecution => {
            ensure(buf, 4, "stop execution body")?;
            RpcBody::StopExecution {
                timeout_ms: buf.get_u32_ne(),
            }
        }
        MessageType::GetProfile => RpcBody::GetProfile,
        MessageType::PreChangeResponse => {
            ensure(buf, 5, "pre-change response body")?;
            RpcBody::PreChangeResponse {
                sync_latency_ms: buf.get_u32_ne(),
                result: buf.get_u8().into(),
            }
        }
        MessageType::SyncChangeResponse => {
            ensure(buf, 1, "sync-change response body")?;
            RpcBody::SyncChangeResponse {
                result: buf.get_u8().into(),
            }
        }
        MessageType::PostChangeResponse => {
            ensure(buf, 1, "post-change response body")?;
            RpcBody::PostChangeResponse {
                result: buf.get_u8().into(),
            }
        }
        MessageType::ProfileResponse => {
            ensure(buf, 8, "profile response body")?;
            RpcBody::ProfileResponse {
                exec_time_ms: buf.get_u32_ne(),
                mem_time_ms: buf.get_u32_ne(),
            }
        }
    };
    Ok(body)
}

fn ensure(buf: &&[u8], needed: usize, what: &'static str) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        Err(ProtocolError::Truncated(what))
    } else {
        Ok(())
    }
}

fn put_name(
    buf: &mut BytesMut,
    name: &str,
    bound: usize,
    what: &'static str,
) -> Result<(), ProtocolError> {
    let bytes = name.as_bytes();
    // Room for the terminating NUL is part of the bound.
    if bytes.len() >= bound {
        return Err(ProtocolError::NameTooLong(what));
    }
    buf.put_slice(bytes);
    buf.put_bytes(0, bound - bytes.len());
    Ok(())
}

fn get_name(buf: &mut &[u8], bound: usize, what: &'static str) -> Result<String, ProtocolError> {
    ensure(buf, bound, what)?;
    let raw = &buf[..bound];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(bound);
    let name = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(bound);
    Ok(name)
}

/// Reads one frame from the stream. Returns `None` on a clean end of
/// stream at a frame boundary; EOF inside a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<RpcMessage>, ProtocolError> {
    let mut size_bytes = [0u8; 2];
    match reader.read_exact(&mut size_bytes).await {
        Ok(_) => {}
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error.into()),
    }
    let frame_size = u16::from_ne_bytes(size_bytes) as usize;
    if frame_size < FRAME_PRELUDE_SIZE + RPC_HEADER_SIZE {
        return Err(ProtocolError::Truncated("frame size"));
    }
    if frame_size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(frame_size));
    }

    let mut frame = vec![0u8; frame_size];
    frame[..2].copy_from_slice(&size_bytes);
    reader.read_exact(&mut frame[2..]).await?;
    RpcMessage::decode(&frame).map(Some)
}

/// Writes one frame to the stream and flushes it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &RpcMessage,
) -> Result<(), ProtocolError> {
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn pre_change_survives_encoding() {
        let message = RpcMessage {
            token: 42,
            app_pid: 1234,
            exc_id: 1,
            body: RpcBody::SyncPreChange {
                event: SyncEventKind::Reconfigure,
                awm: 2,
                systems: vec![SystemAssignment {
                    sys_id: 0,
                    nr_cpus: 1,
                    nr_processing_elements: 2,
                    cpu_bandwidth: 200,
                    memory_bytes: 100 * 1024 * 1024,
                }],
            },
        };
        let bytes = message.encode().unwrap();
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn register_rejects_overlong_names() {
        let message = RpcMessage {
            token: 1,
            app_pid: 1,
            exc_id: 0,
            body: RpcBody::ExcRegister {
                exc_name: "a-name-that-goes-on-and-on".to_string(),
                recipe_name: "recipe".to_string(),
                language: 1,
            },
        };
        assert!(matches!(
            message.encode(),
            Err(ProtocolError::NameTooLong("execution context name"))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let message = RpcMessage {
            token: 7,
            app_pid: 7,
            exc_id: 0,
            body: RpcBody::ExcRuntimeNotify {
                goal_gap: 100,
                cpu_usage: 95,
                cycle_time_ms: 12,
            },
        };
        let bytes = message.encode().unwrap();
        let cut = &bytes[..bytes.len() - 2];
        assert!(RpcMessage::decode(cut).is_err());
    }

    #[test]
    fn header_and_frame_types_must_agree() {
        let message = RpcMessage {
            token: 9,
            app_pid: 9,
            exc_id: 0,
            body: RpcBody::AppExit,
        };
        let mut bytes = message.encode().unwrap().to_vec();
        // Corrupt the header's copy of the message type.
        bytes[FRAME_PRELUDE_SIZE] = 99;
        assert!(matches!(
            RpcMessage::decode(&bytes),
            Err(ProtocolError::HeaderMismatch { .. })
        ));
    }
}
