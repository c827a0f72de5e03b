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

//! Configure payload: a fixed little-endian header followed by the input
//! and output byte-size arrays.

use crate::error::ValidatorError;
use crate::{CONFIG_HEADER_SIZE, MAX_TENSORS};
use alloc::vec::Vec;
use arrayvec::ArrayVec;

/// Per-run settings carried by a configure block. Immutable until the
/// next configure.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionConfig {
    pub profiling: bool,
    pub warmup_runs: u32,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub full_capture: bool,
}

/// Byte length of one input or output tensor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TensorDescriptor {
    pub bytes: usize,
}

pub type TensorDescriptors = ArrayVec<TensorDescriptor, MAX_TENSORS>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigBlock {
    pub config: SessionConfig,
    pub inputs: TensorDescriptors,
    pub outputs: TensorDescriptors,
}

fn word(block: &[u8], index: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[4 * index..4 * index + 4]);
    u32::from_le_bytes(raw)
}

fn descriptors(block: &[u8], first: usize, count: usize) -> TensorDescriptors {
    (first..first + count)
        .map(|i| TensorDescriptor {
            bytes: word(block, i) as usize,
        })
        .collect()
}

// Sum of |count| size words; None if it does not fit a u32.
fn checked_total(block: &[u8], first: usize, count: usize) -> Option<u32> {
    (first..first + count).try_fold(0u32, |sum, i| sum.checked_add(word(block, i)))
}

impl ConfigBlock {
    /// Decodes a configure payload. The block length must be exactly the
    /// header plus both size arrays, and each array must total at most
    /// u32::MAX bytes.
    pub fn parse(block: &[u8]) -> Result<ConfigBlock, ValidatorError> {
        if block.len() < CONFIG_HEADER_SIZE {
            return Err(ValidatorError::ConfigSizeMismatch);
        }
        let num_inputs = word(block, 2) as usize;
        let num_outputs = word(block, 3) as usize;
        if num_inputs > MAX_TENSORS || num_outputs > MAX_TENSORS {
            return Err(ValidatorError::TooManyTensors);
        }
        if block.len() != CONFIG_HEADER_SIZE + 4 * (num_inputs + num_outputs) {
            return Err(ValidatorError::ConfigSizeMismatch);
        }
        let first = CONFIG_HEADER_SIZE / 4;
        if checked_total(block, first, num_inputs).is_none()
            || checked_total(block, first + num_inputs, num_outputs).is_none()
        {
            return Err(ValidatorError::ConfigSizeMismatch);
        }
        Ok(ConfigBlock {
            config: SessionConfig {
                profiling: word(block, 0) != 0,
                warmup_runs: word(block, 1),
                num_inputs,
                num_outputs,
                full_capture: word(block, 4) != 0,
            },
            inputs: descriptors(block, first, num_inputs),
            outputs: descriptors(block, first + num_inputs, num_outputs),
        })
    }

    /// Encodes the block as a host would send it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = [
            self.config.profiling as u32,
            self.config.warmup_runs,
            self.inputs.len() as u32,
            self.outputs.len() as u32,
            self.config.full_capture as u32,
        ];
        header
            .iter()
            .copied()
            .chain(self.inputs.iter().map(|d| d.bytes as u32))
            .chain(self.outputs.iter().map(|d| d.bytes as u32))
            .flat_map(u32::to_le_bytes)
            .collect()
    }

    pub fn input_bytes(&self) -> usize { self.inputs.iter().map(|d| d.bytes).sum() }

    pub fn output_bytes(&self) -> usize { self.outputs.iter().map(|d| d.bytes).sum() }
}
