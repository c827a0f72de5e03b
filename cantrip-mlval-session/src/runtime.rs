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

//! Capability table of the inference runtime the session drives. The
//! firmware supplies one implementation; the session only calls through
//! it.

use cantrip_pmu_matrix::OperatorProbe;

/// Opaque failure code reported by the runtime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RuntimeError(pub i32);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RuntimeInitParams {
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub profiling: bool,
    pub warmup_runs: u32,
}

pub trait InferenceRuntime {
    /// Takes a complete model image staged by the host. Runtimes with a
    /// built-in model ignore it.
    fn load_model(&mut self, _image: &[u8]) -> Result<(), RuntimeError> { Ok(()) }

    fn init(&mut self, params: &RuntimeInitParams) -> Result<(), RuntimeError>;

    /// Copies |data| into input tensor |index|.
    fn set_input(&mut self, index: usize, data: &[u8]) -> Result<(), RuntimeError>;

    fn invoke(&mut self) -> Result<(), RuntimeError>;

    /// Runs the workload reporting each operator to |probe|. Runtimes
    /// without per-operator hooks run uninstrumented.
    fn invoke_profiled(&mut self, _probe: &mut dyn OperatorProbe) -> Result<(), RuntimeError> {
        self.invoke()
    }

    /// Copies output tensor |index| into |dst|.
    fn get_output(&mut self, index: usize, dst: &mut [u8]) -> Result<(), RuntimeError>;

    /// Writable view of input tensor |index|.
    fn input_mut(&mut self, index: usize) -> Option<&mut [u8]>;

    /// Read-only view of output tensor |index|.
    fn output(&self, index: usize) -> Option<&[u8]>;

    fn arena_used_bytes(&self) -> u32;

    /// Post-invoke statistics hook.
    fn capture_stats(&mut self) -> Option<&[u8]> { None }

    /// Number of operators in the loaded workload.
    fn operator_count(&self) -> usize;
}
