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

use crate::network::{NetError, SessionId};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("Accept error = {0}")]
    Accept(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingSetup(String),

    /// wire protocol errors
    #[error("frame of length {len} is larger than the maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("message of {len} bytes needs {segments} segments, more than a frame can count")]
    TooManySegments { len: usize, segments: usize },

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    /// session errors
    #[error("session {0} already closed")]
    SessionClosed(SessionId),

    #[error("request data is empty")]
    RequestDataIsEmpty,

    #[error("serial {0} already has a request in flight")]
    SerialConflict(u16),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

impl AppError {
    /// The result code carried back to a requester for this error.
    pub fn net_error(&self) -> NetError {
        match self {
            AppError::SessionClosed(_) => NetError::SessionClosed,
            AppError::RequestDataIsEmpty => NetError::RequestDataIsEmpty,
            AppError::SerialConflict(_) => NetError::SerialConflict,
            AppError::IoError(_) | AppError::DetailedIoError(_) => NetError::Write,
            _ => NetError::ExceptionCatched,
        }
    }
}

impl From<tracing::subscriber::SetGlobalDefaultError> for AppError {
    fn from(value: tracing::subscriber::SetGlobalDefaultError) -> Self {
        AppError::TracingSetup(value.to_string())
    }
}
