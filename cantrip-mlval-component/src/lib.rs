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

//! Remote-validation service.
//!
//! Owns the single ValidationSession behind a spin::Mutex so it can live
//! in a static, and adapts the transport's raw request/reply buffers to
//! session operations.

#![cfg_attr(not(test), no_std)]

use cantrip_mlval_interface::*;
use cantrip_mlval_session::{InferenceRuntime, ValidationSession};
use cantrip_pmu_interface::CounterBank;
use log::{info, trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::Mutex;
use spin::MutexGuard;

/// Transport-level operation selector.
#[repr(u32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Operation {
    Send = 0,
    Fetch,
    Compute,
}

pub struct CantripValidatorService<R, B> {
    session: Mutex<Option<ValidationSession<R, B>>>,
}

impl<R: InferenceRuntime, B: CounterBank> CantripValidatorService<R, B> {
    pub const fn empty() -> CantripValidatorService<R, B> {
        CantripValidatorService {
            session: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Guard<'_, R, B> {
        Guard {
            session: self.session.lock(),
        }
    }

    /// Request callback: runs operation |op| (raw selector from the
    /// transport) on |request|, returning the number of |reply| bytes
    /// written. Send writes no reply.
    pub fn dispatch(&self, op: u32, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError> {
        let op = Operation::try_from(op).or(Err(ValidatorError::UnknownCommand))?;
        trace!("dispatch {:?} {} bytes", op, request.len());
        let mut guard = self.get();
        match op {
            Operation::Send => guard.send(request).map(|_| 0),
            Operation::Fetch => guard.fetch(request, reply),
            Operation::Compute => guard.compute(request, reply),
        }
    }
}

pub struct Guard<'a, R, B> {
    session: MutexGuard<'a, Option<ValidationSession<R, B>>>,
}

impl<'a, R: InferenceRuntime, B: CounterBank> Guard<'a, R, B> {
    pub fn is_empty(&self) -> bool { self.session.is_none() }

    pub fn init(&mut self, session: ValidationSession<R, B>) {
        assert!(self.session.is_none());
        *self.session = Some(session);
    }

    pub fn session(&mut self) -> Option<&mut ValidationSession<R, B>> { self.session.as_mut() }

    pub fn debug_state(&self) {
        match self.session.as_ref() {
            Some(session) => session.debug_state(),
            None => info!(target: "", "No session."),
        }
    }

    fn bound(&mut self) -> Result<&mut ValidationSession<R, B>, ValidatorError> {
        self.session.as_mut().ok_or(ValidatorError::NoRuntimeBinding)
    }

    fn try_compute(&mut self, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError> {
        let block = DataBlock::decode(request)?;
        let response = self.bound()?.invoke(block.cmd, block.buffer)?;
        response.block().encode(reply)
    }
}

impl<'a, R: InferenceRuntime, B: CounterBank> ValidatorInterface for Guard<'a, R, B> {
    fn send(&mut self, request: &[u8]) -> Result<(), ValidatorError> {
        let block = DataBlock::decode(request)?;
        let session = self.bound()?;
        match block.cmd {
            Command::Configure => session.configure(block.buffer),
            Command::ModelChunk => session.load_model_chunk(block.length as usize, block.buffer),
            Command::InputChunk => session.accept_input_chunk(block.buffer),
            cmd => {
                warn!("send: unexpected {:?}", cmd);
                Err(ValidatorError::UnknownCommand)
            }
        }
    }

    fn fetch(&mut self, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError> {
        let block = DataBlock::decode(request)?;
        if block.cmd != Command::FetchStats {
            warn!("fetch: unexpected {:?}", block.cmd);
            return Err(ValidatorError::UnknownCommand);
        }
        let response = self.bound()?.fetch_stats()?;
        response.block().encode(reply)
    }

    // Always answers with a ResponseBlock so the host is never left
    // waiting; failures carry the status and a description.
    fn compute(&mut self, request: &[u8], reply: &mut [u8]) -> Result<usize, ValidatorError> {
        match self.try_compute(request, reply) {
            Ok(len) => Ok(len),
            Err(err) => {
                warn!("compute failed: {}", err);
                ResponseBlock::error(err).encode(reply)
            }
        }
    }
}
