// Copyright 2025 jonefeewang@gmail.com
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

//! Message envelope carried inside reassembled frames.
//!
//! ```text
//! Push      | 0 | body
//! Request   | 1 | serial u16 | body
//! Response  | 2 | serial u16 | error_code u16 | body
//! Ping/Pong | 3/4 | serial u8
//! Sub/Unsub | 5/6 | subject \0
//! Pub       | 7 | subject \0 | data
//! ```
//! All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Pattern {
    Push = 0,
    Request = 1,
    Response = 2,
    Ping = 3,
    Pong = 4,
    Sub = 5,
    Unsub = 6,
    Pub = 7,
}

impl TryFrom<u8> for Pattern {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Pattern::Push,
            1 => Pattern::Request,
            2 => Pattern::Response,
            3 => Pattern::Ping,
            4 => Pattern::Pong,
            5 => Pattern::Sub,
            6 => Pattern::Unsub,
            7 => Pattern::Pub,
            other => {
                return Err(AppError::MalformedProtocol(format!(
                    "unknown message pattern {}",
                    other
                )))
            }
        })
    }
}

/// Result codes carried in a Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[repr(u16)]
pub enum NetError {
    #[error("success")]
    Success = 0,
    #[error("exception caught in handler")]
    ExceptionCatched = 1,
    #[error("write error")]
    Write = 2,
    #[error("read error")]
    Read = 3,
    #[error("request data is empty")]
    RequestDataIsEmpty = 4,
    #[error("serial conflict")]
    SerialConflict = 5,
    #[error("no handler")]
    NoHandler = 6,
    #[error("response without error code")]
    ReadErrorNo = 7,
    #[error("session closed")]
    SessionClosed = 8,
    #[error("subscription overflow")]
    SubOverflow = 9,
    #[error("request timed out")]
    Timeout = 10,
}

impl NetError {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<NetError> {
        Some(match code {
            0 => NetError::Success,
            1 => NetError::ExceptionCatched,
            2 => NetError::Write,
            3 => NetError::Read,
            4 => NetError::RequestDataIsEmpty,
            5 => NetError::SerialConflict,
            6 => NetError::NoHandler,
            7 => NetError::ReadErrorNo,
            8 => NetError::SessionClosed,
            9 => NetError::SubOverflow,
            10 => NetError::Timeout,
            _ => return None,
        })
    }
}

/// Outcome of a request as seen by both ends. Application handlers may use
/// error codes beyond the ones [`NetError`] names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResult {
    pub error_code: u16,
    pub data: Bytes,
}

impl RpcResult {
    pub fn ok(data: impl Into<Bytes>) -> Self {
        RpcResult {
            error_code: NetError::Success.code(),
            data: data.into(),
        }
    }

    pub fn error(error: NetError) -> Self {
        RpcResult {
            error_code: error.code(),
            data: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == NetError::Success.code()
    }

    pub fn net_error(&self) -> Option<NetError> {
        NetError::from_code(self.error_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Push { data: Bytes },
    Request { serial: u16, data: Bytes },
    Response { serial: u16, error_code: u16, data: Bytes },
    Ping { serial: u8 },
    Pong { serial: u8 },
    Sub { subject: String },
    Unsub { subject: String },
    Pub { subject: String, data: Bytes },
}

impl Message {
    pub fn pattern(&self) -> Pattern {
        match self {
            Message::Push { .. } => Pattern::Push,
            Message::Request { .. } => Pattern::Request,
            Message::Response { .. } => Pattern::Response,
            Message::Ping { .. } => Pattern::Ping,
            Message::Pong { .. } => Pattern::Pong,
            Message::Sub { .. } => Pattern::Sub,
            Message::Unsub { .. } => Pattern::Unsub,
            Message::Pub { .. } => Pattern::Pub,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.pattern() as u8);
        match self {
            Message::Push { data } => buf.put_slice(data),
            Message::Request { serial, data } => {
                buf.put_u16_le(*serial);
                buf.put_slice(data);
            }
            Message::Response {
                serial,
                error_code,
                data,
            } => {
                buf.put_u16_le(*serial);
                buf.put_u16_le(*error_code);
                buf.put_slice(data);
            }
            Message::Ping { serial } | Message::Pong { serial } => buf.put_u8(*serial),
            Message::Sub { subject } | Message::Unsub { subject } => put_subject(&mut buf, subject),
            Message::Pub { subject, data } => {
                put_subject(&mut buf, subject);
                buf.put_slice(data);
            }
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Message::Push { data } => data.len(),
            Message::Request { data, .. } => 2 + data.len(),
            Message::Response { data, .. } => 4 + data.len(),
            Message::Ping { .. } | Message::Pong { .. } => 1,
            Message::Sub { subject } | Message::Unsub { subject } => subject.len() + 1,
            Message::Pub { subject, data } => subject.len() + 1 + data.len(),
        }
    }

    pub fn decode(mut buf: Bytes) -> AppResult<Message> {
        if buf.is_empty() {
            return Err(AppError::MalformedProtocol("empty message".to_string()));
        }
        let pattern = Pattern::try_from(buf.get_u8())?;
        let message = match pattern {
            Pattern::Push => Message::Push { data: buf },
            Pattern::Request => {
                ensure_remaining(&buf, 2, pattern)?;
                let serial = buf.get_u16_le();
                Message::Request { serial, data: buf }
            }
            Pattern::Response => {
                ensure_remaining(&buf, 4, pattern)?;
                let serial = buf.get_u16_le();
                let error_code = buf.get_u16_le();
                Message::Response {
                    serial,
                    error_code,
                    data: buf,
                }
            }
            Pattern::Ping => {
                ensure_remaining(&buf, 1, pattern)?;
                Message::Ping {
                    serial: buf.get_u8(),
                }
            }
            Pattern::Pong => {
                ensure_remaining(&buf, 1, pattern)?;
                Message::Pong {
                    serial: buf.get_u8(),
                }
            }
            Pattern::Sub => Message::Sub {
                subject: take_subject(&mut buf)?,
            },
            Pattern::Unsub => Message::Unsub {
                subject: take_subject(&mut buf)?,
            },
            Pattern::Pub => {
                let subject = take_subject(&mut buf)?;
                Message::Pub { subject, data: buf }
            }
        };
        Ok(message)
    }
}

fn ensure_remaining(buf: &Bytes, n: usize, pattern: Pattern) -> AppResult<()> {
    if buf.remaining() < n {
        return Err(AppError::MalformedProtocol(format!(
            "{:?} message truncated, {} bytes left, {} needed",
            pattern,
            buf.remaining(),
            n
        )));
    }
    Ok(())
}

fn put_subject(buf: &mut BytesMut, subject: &str) {
    buf.put_slice(subject.as_bytes());
    buf.put_u8(0);
}

fn take_subject(buf: &mut Bytes) -> AppResult<String> {
    let (end, skip) = match buf.iter().position(|b| *b == 0) {
        Some(end) => (end, 1),
        // the terminator may be missing at the very end
        None => (buf.len(), 0),
    };
    if end == 0 {
        return Err(AppError::MalformedProtocol("empty subject".to_string()));
    }
    let raw = buf.split_to(end);
    buf.advance(skip);
    String::from_utf8(raw.to_vec())
        .map_err(|e| AppError::MalformedProtocol(format!("subject is not utf-8: {}", e)))
}
