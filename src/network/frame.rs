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

//! Wire framing.
//!
//! ```text
//! +----------------+--------------------+------------------------+
//! | length: u16 LE | segments_left: u8  | payload (length - 1)   |
//! +----------------+--------------------+------------------------+
//! ```
//!
//! `length` counts everything after itself. A logical message longer than
//! `max_frame_size - 1` is split into several frames whose `segments_left`
//! counts down to 1 on the last one.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::ring_buffer::ByteRing;
use crate::{AppError, AppResult};

/// Size of the length field.
pub const HEADER_SIZE: usize = 2;

/// A frame can count at most this many segments.
pub const MAX_SEGMENTS: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub segments_remaining: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_last(&self) -> bool {
        self.segments_remaining == 1
    }
}

#[derive(Debug)]
enum DecodeState {
    HeaderPending,
    BodyPending { length: usize, body: BytesMut },
}

/// Incremental decoder, one per connection.
///
/// Partial headers stay in the ring buffer; a partial body is copied out so the
/// ring buffer can be refilled while the frame is still incomplete.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    state: DecodeState,
    frames: VecDeque<Frame>,
}

impl FrameDecoder {
    pub fn new(max_frame_size: u16) -> Self {
        FrameDecoder {
            max_frame_size: max_frame_size as usize,
            state: DecodeState::HeaderPending,
            frames: VecDeque::new(),
        }
    }

    /// Consumes whatever complete or partial frames `ring` holds and returns the
    /// number of frames completed by this call. An error leaves the decoder
    /// unusable; the connection must be closed.
    pub fn process<R: ByteRing + ?Sized>(&mut self, ring: &mut R) -> AppResult<usize> {
        let mut completed = 0;
        loop {
            match &mut self.state {
                DecodeState::HeaderPending => {
                    if ring.readable_size() < HEADER_SIZE {
                        return Ok(completed);
                    }
                    let header = ring.readable();
                    let length = u16::from_le_bytes([header[0], header[1]]) as usize;
                    if length == 0 {
                        return Err(AppError::MalformedProtocol(
                            "frame length is 0, a frame carries at least its segment count"
                                .to_string(),
                        ));
                    }
                    if length > self.max_frame_size {
                        return Err(AppError::FrameTooLarge {
                            len: length,
                            max: self.max_frame_size,
                        });
                    }
                    ring.move_by_read(HEADER_SIZE);
                    self.state = DecodeState::BodyPending {
                        length,
                        body: BytesMut::with_capacity(length),
                    };
                }
                DecodeState::BodyPending { length, body } => {
                    let wanted = *length - body.len();
                    let available = ring.readable_size().min(wanted);
                    if available > 0 {
                        body.extend_from_slice(&ring.readable()[..available]);
                        ring.move_by_read(available);
                    }
                    if body.len() < *length {
                        return Ok(completed);
                    }

                    let mut body = std::mem::take(body).freeze();
                    self.state = DecodeState::HeaderPending;
                    let segments_remaining = body[0];
                    if segments_remaining == 0 {
                        return Err(AppError::MalformedProtocol(
                            "frame segment count is 0".to_string(),
                        ));
                    }
                    let payload = body.split_off(1);
                    trace!(
                        "decoded frame of {} bytes, {} segments left",
                        payload.len(),
                        segments_remaining
                    );
                    self.frames.push_back(Frame {
                        segments_remaining,
                        payload,
                    });
                    completed += 1;
                }
            }
        }
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    pub fn drain(&mut self) -> Vec<Frame> {
        self.frames.drain(..).collect()
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }
}

/// Appends one physical frame to `dst`.
pub fn encode_frame(segments_remaining: u8, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE + 1 + payload.len());
    dst.put_u16_le((payload.len() + 1) as u16);
    dst.put_u8(segments_remaining);
    dst.put_slice(payload);
}

/// Splits a logical message into encoded frames of at most `max_frame_size`
/// (length field excluded).
pub fn fragment(message: &[u8], max_frame_size: u16) -> AppResult<Vec<Bytes>> {
    if max_frame_size < 2 {
        return Err(AppError::InvalidValue(format!(
            "max frame size {} leaves no room for payload",
            max_frame_size
        )));
    }
    if message.is_empty() {
        return Err(AppError::InvalidValue(
            "cannot frame an empty message".to_string(),
        ));
    }
    let limit = max_frame_size as usize - 1;
    let segments = message.len().div_ceil(limit);
    if segments > MAX_SEGMENTS {
        return Err(AppError::TooManySegments {
            len: message.len(),
            segments,
        });
    }

    let mut frames = Vec::with_capacity(segments);
    for (i, chunk) in message.chunks(limit).enumerate() {
        let mut dst = BytesMut::with_capacity(HEADER_SIZE + 1 + chunk.len());
        encode_frame((segments - i) as u8, chunk, &mut dst);
        frames.push(dst.freeze());
    }
    Ok(frames)
}
