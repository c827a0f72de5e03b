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

use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive};

/// Rust Error enum used throughout the validator. Converted to a
/// ValidatorStatus when it crosses the transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidatorError {
    DeserializeFailed,
    SerializeFailed,
    UnknownCommand,
    NoRuntimeBinding,
    NotConfigured,
    ConfigSizeMismatch,
    TooManyTensors,
    RuntimeInitFailed,
    UnexpectedInputChunk,
    NoWritableInput,
    InputOverflow,
    InputSizeMismatch,
    SetInputFailed,
    InvokeFailed,
    GetOutputFailed,
    OutputTooLarge,
    StatsTooLarge,
    ModelTooLarge,
    ModelOverflow,
    CharacterizationFailed,
}

impl ValidatorError {
    /// Short description carried in error replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidatorError::DeserializeFailed => "request decode failed",
            ValidatorError::SerializeFailed => "reply encode failed",
            ValidatorError::UnknownCommand => "unknown command",
            ValidatorError::NoRuntimeBinding => "no runtime bound",
            ValidatorError::NotConfigured => "session not configured",
            ValidatorError::ConfigSizeMismatch => "configuration size mismatch",
            ValidatorError::TooManyTensors => "too many tensors",
            ValidatorError::RuntimeInitFailed => "runtime init failed",
            ValidatorError::UnexpectedInputChunk => "input fits one block; chunk unexpected",
            ValidatorError::NoWritableInput => "runtime has no writable input",
            ValidatorError::InputOverflow => "input chunk overflows tensor",
            ValidatorError::InputSizeMismatch => "input size mismatch",
            ValidatorError::SetInputFailed => "set input failed",
            ValidatorError::InvokeFailed => "invoke failed",
            ValidatorError::GetOutputFailed => "get output failed",
            ValidatorError::OutputTooLarge => "output exceeds holding buffer",
            ValidatorError::StatsTooLarge => "statistics exceed holding buffer",
            ValidatorError::ModelTooLarge => "model exceeds staging buffer",
            ValidatorError::ModelOverflow => "model chunk past declared size",
            ValidatorError::CharacterizationFailed => "counter characterization failed",
        }
    }
}

impl fmt::Display for ValidatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str(self.as_str()) }
}

impl From<postcard::Error> for ValidatorError {
    fn from(_err: postcard::Error) -> ValidatorError { ValidatorError::SerializeFailed }
}

/// Status presented over the transport.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum ValidatorStatus {
    Success = 0,
    DeserializeFailed,
    SerializeFailed,
    UnknownCommand,
    NoRuntimeBinding,
    NotConfigured,
    ConfigSizeMismatch,
    TooManyTensors,
    RuntimeInitFailed,
    UnexpectedInputChunk,
    NoWritableInput,
    InputOverflow,
    InputSizeMismatch,
    SetInputFailed,
    InvokeFailed,
    GetOutputFailed,
    OutputTooLarge,
    StatsTooLarge,
    ModelTooLarge,
    ModelOverflow,
    CharacterizationFailed,
    #[default]
    UnknownError,
}

/// Mapping function from Rust -> wire.
impl From<ValidatorError> for ValidatorStatus {
    fn from(err: ValidatorError) -> ValidatorStatus {
        match err {
            ValidatorError::DeserializeFailed => ValidatorStatus::DeserializeFailed,
            ValidatorError::SerializeFailed => ValidatorStatus::SerializeFailed,
            ValidatorError::UnknownCommand => ValidatorStatus::UnknownCommand,
            ValidatorError::NoRuntimeBinding => ValidatorStatus::NoRuntimeBinding,
            ValidatorError::NotConfigured => ValidatorStatus::NotConfigured,
            ValidatorError::ConfigSizeMismatch => ValidatorStatus::ConfigSizeMismatch,
            ValidatorError::TooManyTensors => ValidatorStatus::TooManyTensors,
            ValidatorError::RuntimeInitFailed => ValidatorStatus::RuntimeInitFailed,
            ValidatorError::UnexpectedInputChunk => ValidatorStatus::UnexpectedInputChunk,
            ValidatorError::NoWritableInput => ValidatorStatus::NoWritableInput,
            ValidatorError::InputOverflow => ValidatorStatus::InputOverflow,
            ValidatorError::InputSizeMismatch => ValidatorStatus::InputSizeMismatch,
            ValidatorError::SetInputFailed => ValidatorStatus::SetInputFailed,
            ValidatorError::InvokeFailed => ValidatorStatus::InvokeFailed,
            ValidatorError::GetOutputFailed => ValidatorStatus::GetOutputFailed,
            ValidatorError::OutputTooLarge => ValidatorStatus::OutputTooLarge,
            ValidatorError::StatsTooLarge => ValidatorStatus::StatsTooLarge,
            ValidatorError::ModelTooLarge => ValidatorStatus::ModelTooLarge,
            ValidatorError::ModelOverflow => ValidatorStatus::ModelOverflow,
            ValidatorError::CharacterizationFailed => ValidatorStatus::CharacterizationFailed,
        }
    }
}

/// Helper to map from a Result to the wire status.
impl From<Result<(), ValidatorError>> for ValidatorStatus {
    fn from(result: Result<(), ValidatorError>) -> ValidatorStatus {
        result.map_or_else(ValidatorStatus::from, |_| ValidatorStatus::Success)
    }
}

/// Inverse mapping function from wire -> Rust Result.
impl From<ValidatorStatus> for Result<(), ValidatorError> {
    fn from(status: ValidatorStatus) -> Result<(), ValidatorError> {
        match status {
            ValidatorStatus::Success => Ok(()),
            ValidatorStatus::DeserializeFailed => Err(ValidatorError::DeserializeFailed),
            ValidatorStatus::SerializeFailed => Err(ValidatorError::SerializeFailed),
            ValidatorStatus::UnknownCommand => Err(ValidatorError::UnknownCommand),
            ValidatorStatus::NoRuntimeBinding => Err(ValidatorError::NoRuntimeBinding),
            ValidatorStatus::NotConfigured => Err(ValidatorError::NotConfigured),
            ValidatorStatus::ConfigSizeMismatch => Err(ValidatorError::ConfigSizeMismatch),
            ValidatorStatus::TooManyTensors => Err(ValidatorError::TooManyTensors),
            ValidatorStatus::RuntimeInitFailed => Err(ValidatorError::RuntimeInitFailed),
            ValidatorStatus::UnexpectedInputChunk => Err(ValidatorError::UnexpectedInputChunk),
            ValidatorStatus::NoWritableInput => Err(ValidatorError::NoWritableInput),
            ValidatorStatus::InputOverflow => Err(ValidatorError::InputOverflow),
            ValidatorStatus::InputSizeMismatch => Err(ValidatorError::InputSizeMismatch),
            ValidatorStatus::SetInputFailed => Err(ValidatorError::SetInputFailed),
            ValidatorStatus::InvokeFailed => Err(ValidatorError::InvokeFailed),
            ValidatorStatus::GetOutputFailed => Err(ValidatorError::GetOutputFailed),
            ValidatorStatus::OutputTooLarge => Err(ValidatorError::OutputTooLarge),
            ValidatorStatus::StatsTooLarge => Err(ValidatorError::StatsTooLarge),
            ValidatorStatus::ModelTooLarge => Err(ValidatorError::ModelTooLarge),
            ValidatorStatus::ModelOverflow => Err(ValidatorError::ModelOverflow),
            ValidatorStatus::CharacterizationFailed => Err(ValidatorError::CharacterizationFailed),
            // NB: an unrecognized status most likely means a version skew
            //     with the host; treat as a decode failure.
            ValidatorStatus::UnknownError => Err(ValidatorError::DeserializeFailed),
        }
    }
}
