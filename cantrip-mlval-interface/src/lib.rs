// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Remote-validation wire protocol.
//!
//! A host pushes a model, streams input tensors, triggers inference and
//! pulls back outputs and counter statistics over a transport that moves
//! one bounded request/response byte block at a time. Requests are
//! postcard-encoded DataBlocks; replies are postcard-encoded
//! ResponseBlocks whose payload is at most MAX_TRANSPORT_UNIT bytes.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
mod error;
mod stats;

pub use config::{ConfigBlock, SessionConfig, TensorDescriptor, TensorDescriptors};
pub use error::{ValidatorError, ValidatorStatus};
pub use stats::{PmuRow, PmuRowBuf, ValidationStats};

use log::trace;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Max input or output tensors per session.
pub const MAX_TENSORS: usize = 10;

/// Max payload bytes carried by one response block.
pub const MAX_TRANSPORT_UNIT: usize = 4000;

/// Fixed part of the configure payload (5 x u32).
pub const CONFIG_HEADER_SIZE: usize = 20;

// Worst-case postcard framing around a response payload: status and
// length varints, the tag string and the payload length prefix.
const RESPONSE_FRAMING: usize = 32;

/// Size of the reply buffer a transport must provide.
pub const REPLY_DATA_SIZE: usize = 4096;

const_assert!(CONFIG_HEADER_SIZE == 5 * core::mem::size_of::<u32>());
const_assert!(MAX_TRANSPORT_UNIT + RESPONSE_FRAMING <= REPLY_DATA_SIZE);
const_assert!(CONFIG_HEADER_SIZE + 8 * MAX_TENSORS <= MAX_TRANSPORT_UNIT);

/// Command tag embedded in every request block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Send: configure payload.
    Configure,
    /// Send: piece of a model image; DataBlock.length is the image size.
    ModelChunk,
    /// Send: piece of the (oversized) input tensors.
    InputChunk,
    /// Compute: run inference, optionally carrying the whole input.
    Invoke,
    /// Compute: next piece of a pending output stream.
    NextOutputChunk,
    /// Fetch: statistics, or the next statistics/counter piece.
    FetchStats,
}

/// Request block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DataBlock<'a> {
    /// Total size of the logical transfer this block belongs to.
    pub length: u32,
    pub cmd: Command,
    pub description: &'a str,
    pub buffer: &'a [u8],
}

impl<'a> DataBlock<'a> {
    pub fn new(cmd: Command, buffer: &'a [u8]) -> Self {
        DataBlock {
            length: buffer.len() as u32,
            cmd,
            description: "",
            buffer,
        }
    }

    pub fn decode(request: &'a [u8]) -> Result<Self, ValidatorError> {
        postcard::from_bytes(request).or(Err(ValidatorError::DeserializeFailed))
    }

    /// Encodes into |buf|, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ValidatorError> {
        Ok(postcard::to_slice(self, buf)?.len())
    }
}

/// Annotation on each response block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseTag {
    FullTensor,
    PartTensor,
    LastTensor,
    FullStats,
    PartStats,
    LastStats,
    FullPmuStats,
    Error,
}

impl ResponseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseTag::FullTensor => "FullTensor",
            ResponseTag::PartTensor => "PartTensor",
            ResponseTag::LastTensor => "LastTensor",
            ResponseTag::FullStats => "FullStats",
            ResponseTag::PartStats => "PartStats",
            ResponseTag::LastStats => "LastStats",
            ResponseTag::FullPmuStats => "FullPMUStats",
            ResponseTag::Error => "Error",
        }
    }

    pub fn parse(tag: &str) -> Option<ResponseTag> {
        [
            ResponseTag::FullTensor,
            ResponseTag::PartTensor,
            ResponseTag::LastTensor,
            ResponseTag::FullStats,
            ResponseTag::PartStats,
            ResponseTag::LastStats,
            ResponseTag::FullPmuStats,
            ResponseTag::Error,
        ]
        .into_iter()
        .find(|t| t.as_str() == tag)
    }
}

/// Reply block.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResponseBlock<'a> {
    /// ValidatorStatus as u32.
    pub status: u32,
    pub tag: &'a str,
    /// Total size of the logical transfer this piece belongs to.
    pub length: u32,
    pub buffer: &'a [u8],
}

impl<'a> ResponseBlock<'a> {
    pub fn new(tag: ResponseTag, length: usize, buffer: &'a [u8]) -> Self {
        ResponseBlock {
            status: ValidatorStatus::Success.into(),
            tag: tag.as_str(),
            length: length as u32,
            buffer,
        }
    }

    /// Failure reply; the payload is the error description.
    pub fn error(err: ValidatorError) -> ResponseBlock<'static> {
        let description = err.as_str().as_bytes();
        ResponseBlock {
            status: ValidatorStatus::from(err).into(),
            tag: ResponseTag::Error.as_str(),
            length: description.len() as u32,
            buffer: description,
        }
    }

    pub fn status(&self) -> Result<(), ValidatorError> { ValidatorStatus::from(self.status).into() }

    pub fn decode(reply: &'a [u8]) -> Result<Self, ValidatorError> {
        postcard::from_bytes(reply).or(Err(ValidatorError::DeserializeFailed))
    }

    /// Encodes into |buf|, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, ValidatorError> {
        trace!("reply {} {}/{}", self.tag, self.buffer.len(), self.length);
        Ok(postcard::to_slice(self, buf)?.len())
    }
}

/// Transport-facing entry points. Each takes an encoded DataBlock; fetch
/// and compute write an encoded ResponseBlock into |reply| and return
/// its length.
pub trait ValidatorInterface {
    /// Configure, model chunk or input chunk.
    fn send(&mut self, request: &[u8]) -> Result<(), ValidatorError>;
    /// Next statistics/counter piece, or a fresh capture.
    fn fetch(&mut self, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError>;
    /// Inference, or the next output piece.
    fn compute(&mut self, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError>;
}
