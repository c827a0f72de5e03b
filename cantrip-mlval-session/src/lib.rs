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

//! Remote-validation session controller.
//!
//! Translates inbound commands into runtime actions and produces the
//! (possibly chunked) responses. One session serves one host at a time;
//! every operation runs to completion in the caller's context. At most
//! one logical transfer (input, output, statistics or counter rows) is in
//! flight, tracked by the single ChunkTracker and Stream.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod runtime;

pub use runtime::{InferenceRuntime, RuntimeError, RuntimeInitParams};

use alloc::vec;
use alloc::vec::Vec;
use cantrip_mlval_interface::*;
use cantrip_pmu_interface::{CounterBank, CHARACTERIZATION_EVENTS, EVENTS_PER_RUN, MAX_EVENTS};
use cantrip_pmu_matrix::{CounterMatrixPool, MatrixHandle, MAX_OPERATORS};
use chunk_tracker::ChunkTracker;
use core::cmp;
use log::{error, info, trace, warn};
use static_assertions::const_assert;

pub const DEFAULT_HOLDING_CAPACITY: usize = 64 * 1024;
pub const DEFAULT_MODEL_CAPACITY: usize = 512 * 1024;

const_assert!(DEFAULT_HOLDING_CAPACITY >= MAX_TRANSPORT_UNIT);

/// Buffer sizing for a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionParams {
    /// Max payload bytes per response (clamped to MAX_TRANSPORT_UNIT).
    pub max_unit: usize,
    /// Largest output or statistics payload that can be streamed.
    pub holding_capacity: usize,
    /// Largest model image that can be staged.
    pub model_capacity: usize,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_unit: MAX_TRANSPORT_UNIT,
            holding_capacity: DEFAULT_HOLDING_CAPACITY,
            model_capacity: DEFAULT_MODEL_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Unconfigured,
    /// Configured; nothing invoked since.
    Configured,
    InputStreaming,
    /// Results of the last invoke are available; no stream in flight.
    Invoked,
    OutputStreaming,
    StatsStreaming,
    PmuStreaming,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Stream {
    Idle,
    Input,
    Output,
    Stats,
    Pmu { layer: usize },
}

/// Statistics on non-happy-path events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    pub invoke_failures: u32,
    pub protocol_fallthroughs: u32,
    pub abandoned_streams: u32,
}

/// One response piece. |total| is the size of the logical transfer the
/// piece belongs to.
#[derive(Debug, Eq, PartialEq)]
pub struct Response<'a> {
    pub tag: ResponseTag,
    pub payload: &'a [u8],
    pub total: usize,
}

impl<'a> Response<'a> {
    pub fn block(&self) -> ResponseBlock<'a> { ResponseBlock::new(self.tag, self.total, self.payload) }
}

// Part of an input chunk landing in one tensor. Offsets are absolute
// within the concatenated inputs.
struct Span {
    index: usize,
    base: usize,
    from: usize,
    to: usize,
}

fn spans(
    inputs: &[TensorDescriptor],
    start: usize,
    end: usize,
) -> impl Iterator<Item = Span> + '_ {
    inputs
        .iter()
        .enumerate()
        .scan(0usize, |base, (index, desc)| {
            let lo = *base;
            *base += desc.bytes;
            Some((index, lo, *base))
        })
        .map(move |(index, lo, hi)| Span {
            index,
            base: lo,
            from: cmp::max(lo, start),
            to: cmp::min(hi, end),
        })
        .filter(|span| span.from < span.to)
}

fn total_bytes(tensors: &[TensorDescriptor]) -> usize { tensors.iter().map(|d| d.bytes).sum() }

// Longest varint postcard emits for a u32.
const MAX_VARINT_LEN: usize = 5;

// Worst-case encoded PmuRow: layer, counter count, then the counters.
const fn max_row_len(events: usize) -> usize { MAX_VARINT_LEN * (2 + events) }

pub struct ValidationSession<R, B> {
    runtime: R,
    counter_bank: Option<B>,
    params: SessionParams,
    setup: Option<ConfigBlock>,
    chunk: ChunkTracker,
    stream: Stream,
    // A complete input was streamed and awaits the next invoke.
    input_streamed: bool,
    invocations: u32,
    arena_used_bytes: u32,
    characterized: bool,
    model: Vec<u8>,
    model_total: usize,
    holding: Vec<u8>,
    scratch: Vec<u8>,
    runtime_stats: Vec<u8>,
    // Row-major pmu_layers x pmu_events.
    pmu_matrix: Vec<u32>,
    pmu_layers: usize,
    pmu_events: usize,
    statistics: Statistics,
}

impl<R: InferenceRuntime, B: CounterBank> ValidationSession<R, B> {
    /// Creates a session over |runtime|. |counter_bank| is None on targets
    /// without a PMU; characterization is then skipped.
    pub fn new(runtime: R, counter_bank: Option<B>, params: SessionParams) -> Self {
        let max_unit = params.max_unit.clamp(1, MAX_TRANSPORT_UNIT);
        ValidationSession {
            runtime,
            counter_bank,
            params: SessionParams { max_unit, ..params },
            setup: None,
            chunk: ChunkTracker::new(),
            stream: Stream::Idle,
            input_streamed: false,
            invocations: 0,
            arena_used_bytes: 0,
            characterized: false,
            model: Vec::new(),
            model_total: 0,
            holding: Vec::new(),
            scratch: vec![0u8; max_unit],
            runtime_stats: Vec::new(),
            pmu_matrix: Vec::new(),
            pmu_layers: 0,
            pmu_events: 0,
            statistics: Statistics::default(),
        }
    }

    pub fn runtime(&self) -> &R { &self.runtime }

    pub fn runtime_mut(&mut self) -> &mut R { &mut self.runtime }

    pub fn counter_bank(&self) -> Option<&B> { self.counter_bank.as_ref() }

    pub fn params(&self) -> &SessionParams { &self.params }

    pub fn config(&self) -> Option<&SessionConfig> { self.setup.as_ref().map(|s| &s.config) }

    pub fn statistics(&self) -> &Statistics { &self.statistics }

    pub fn invocations(&self) -> u32 { self.invocations }

    pub fn state(&self) -> SessionState {
        match (self.setup.is_some(), self.stream) {
            (false, _) => SessionState::Unconfigured,
            (true, Stream::Input) => SessionState::InputStreaming,
            (true, Stream::Output) => SessionState::OutputStreaming,
            (true, Stream::Stats) => SessionState::StatsStreaming,
            (true, Stream::Pmu { .. }) => SessionState::PmuStreaming,
            (true, Stream::Idle) if self.invocations > 0 => SessionState::Invoked,
            (true, Stream::Idle) => SessionState::Configured,
        }
    }

    fn abandon_stream(&mut self, cause: &str) {
        if self.stream != Stream::Idle {
            warn!(
                "{}: abandoning {:?} stream at {}/{}",
                cause,
                self.stream,
                self.chunk.progressed(),
                self.chunk.total()
            );
            self.statistics.abandoned_streams += 1;
        }
        self.chunk.reset();
        self.stream = Stream::Idle;
    }

    fn model_ready(&self) -> bool { self.model_total != 0 && self.model.len() == self.model_total }

    /// Applies a configure payload. A malformed payload leaves the session
    /// untouched and the runtime is not initialised.
    pub fn configure(&mut self, block: &[u8]) -> Result<(), ValidatorError> {
        let setup = ConfigBlock::parse(block).map_err(|err| {
            warn!("configure rejected: {}", err);
            err
        })?;
        self.abandon_stream("configure");
        self.setup = None;

        if self.model_ready() {
            let image = core::mem::take(&mut self.model);
            self.model_total = 0;
            trace!("loading staged model ({} bytes)", image.len());
            self.runtime.load_model(&image).map_err(|err| {
                error!("load_model failed: {:?}", err);
                ValidatorError::RuntimeInitFailed
            })?;
        }

        let config = setup.config;
        self.runtime
            .init(&RuntimeInitParams {
                num_inputs: config.num_inputs,
                num_outputs: config.num_outputs,
                profiling: config.profiling,
                warmup_runs: config.warmup_runs,
            })
            .map_err(|err| {
                error!("runtime init failed: {:?}", err);
                ValidatorError::RuntimeInitFailed
            })?;

        self.input_streamed = false;
        self.invocations = 0;
        self.characterized = false;
        self.runtime_stats.clear();
        self.pmu_matrix = Vec::new();
        self.pmu_layers = 0;
        self.pmu_events = 0;
        self.arena_used_bytes = self.runtime.arena_used_bytes();
        info!(
            "configured {} inputs ({} bytes) {} outputs ({} bytes) profiling {} warmup {} full capture {} arena {}",
            config.num_inputs,
            setup.input_bytes(),
            config.num_outputs,
            setup.output_bytes(),
            config.profiling,
            config.warmup_runs,
            config.full_capture,
            self.arena_used_bytes
        );
        self.setup = Some(setup);
        Ok(())
    }

    /// Appends a piece of a model image of |total| bytes. A piece that
    /// follows a complete image, or names a different total, starts a new
    /// image. The image is handed to the runtime on the next configure.
    pub fn load_model_chunk(&mut self, total: usize, data: &[u8]) -> Result<(), ValidatorError> {
        if total > self.params.model_capacity {
            self.model = Vec::new();
            self.model_total = 0;
            return Err(ValidatorError::ModelTooLarge);
        }
        if self.model_total != total || self.model_ready() {
            self.model.clear();
            self.model_total = total;
        }
        if self.model.len() + data.len() > total {
            return Err(ValidatorError::ModelOverflow);
        }
        self.model.extend_from_slice(data);
        trace!("model chunk {} bytes, {}/{}", data.len(), self.model.len(), total);
        Ok(())
    }

    /// Staged model bytes and the declared image size.
    pub fn staged_model(&self) -> (usize, usize) { (self.model.len(), self.model_total) }

    /// Copies the next piece of an oversized input into the runtime's
    /// writable input views. Inputs are treated as one concatenated
    /// payload in tensor order.
    pub fn accept_input_chunk(&mut self, data: &[u8]) -> Result<(), ValidatorError> {
        let inputs = self.setup.as_ref().ok_or(ValidatorError::NotConfigured)?.inputs.clone();
        let total = total_bytes(&inputs);
        if total <= self.params.max_unit {
            return Err(ValidatorError::UnexpectedInputChunk);
        }
        let continuing = self.stream == Stream::Input;
        let start = if continuing { self.chunk.progressed() } else { 0 };
        let end = start + data.len();
        if end > total {
            return Err(ValidatorError::InputOverflow);
        }
        // Check every view first so a failure changes nothing.
        for span in spans(&inputs, start, end) {
            let view = self
                .runtime
                .input_mut(span.index)
                .ok_or(ValidatorError::NoWritableInput)?;
            if span.to - span.base > view.len() {
                return Err(ValidatorError::InputOverflow);
            }
        }
        if !continuing {
            self.abandon_stream("input chunk");
            let started = self.chunk.begin(total, self.params.max_unit);
            debug_assert!(started);
            self.stream = Stream::Input;
            self.input_streamed = false;
        }

        for span in spans(&inputs, start, end) {
            if let Some(view) = self.runtime.input_mut(span.index) {
                view[span.from - span.base..span.to - span.base]
                    .copy_from_slice(&data[span.from - start..span.to - start]);
            }
        }

        self.chunk.advance(data.len());
        trace!("input chunk {} bytes, {}/{}", data.len(), self.chunk.progressed(), total);
        if self.chunk.done() {
            self.stream = Stream::Idle;
            self.input_streamed = true;
        }
        Ok(())
    }

    /// Compute. NextOutputChunk with an output stream in flight returns the
    /// next piece; anything else runs inference. An empty payload with no
    /// streamed input re-runs on the inputs already in the runtime.
    pub fn invoke(&mut self, cmd: Command, data: &[u8]) -> Result<Response<'_>, ValidatorError> {
        match cmd {
            Command::NextOutputChunk if self.stream == Stream::Output => {
                return Ok(self.next_piece(ResponseTag::PartTensor, ResponseTag::LastTensor));
            }
            Command::NextOutputChunk => {
                warn!("no output stream in flight; running inference");
                self.statistics.protocol_fallthroughs += 1;
            }
            Command::Invoke => {}
            _ => return Err(ValidatorError::UnknownCommand),
        }
        self.run_inference(data)?;
        self.assemble_output()
    }

    fn run_inference(&mut self, data: &[u8]) -> Result<(), ValidatorError> {
        let setup = self.setup.as_ref().ok_or(ValidatorError::NotConfigured)?;
        let config = setup.config;
        let inputs = setup.inputs.clone();
        let use_payload = !self.input_streamed && !data.is_empty();
        if use_payload && data.len() != total_bytes(&inputs) {
            return Err(ValidatorError::InputSizeMismatch);
        }
        self.abandon_stream("invoke");

        if self.input_streamed {
            self.input_streamed = false;
        } else if use_payload {
            let mut offset = 0;
            for (index, desc) in inputs.iter().enumerate() {
                self.runtime
                    .set_input(index, &data[offset..offset + desc.bytes])
                    .map_err(|err| {
                        error!("set_input {} failed: {:?}", index, err);
                        ValidatorError::SetInputFailed
                    })?;
                offset += desc.bytes;
            }
        }

        if let Err(err) = self.runtime.invoke() {
            self.statistics.invoke_failures += 1;
            error!("invoke failed: {:?}", err);
            return Err(ValidatorError::InvokeFailed);
        }
        self.invocations += 1;
        trace!("invocation {} done", self.invocations);

        if config.profiling && self.invocations > config.warmup_runs {
            self.runtime_stats.clear();
            if let Some(stats) = self.runtime.capture_stats() {
                self.runtime_stats.extend_from_slice(stats);
            }
            if !self.characterized && self.counter_bank.is_some() {
                self.characterized = true;
                self.characterize()?;
            }
        }
        Ok(())
    }

    // One full counter characterization pass: the workload is re-run until
    // every catalog event has been sampled for every operator.
    fn characterize(&mut self) -> Result<(), ValidatorError> {
        let bank = match self.counter_bank.take() {
            Some(bank) => bank,
            None => return Ok(()),
        };
        let operators = cmp::min(self.runtime.operator_count(), MAX_OPERATORS);
        if operators == 0 {
            warn!("runtime reports no operators; characterization skipped");
            self.counter_bank = Some(bank);
            return Ok(());
        }

        let mut matrix = vec![0u32; operators * MAX_EVENTS];
        let mut pool = CounterMatrixPool::new(bank);
        let result = characterize_with(&mut self.runtime, &mut pool, operators, &mut matrix);
        self.counter_bank = Some(pool.into_bank());

        match result {
            Ok(runs) => {
                info!(
                    "characterized {} operators x {} events in {} runs",
                    operators, MAX_EVENTS, runs
                );
                self.pmu_matrix = matrix;
                self.pmu_layers = operators;
                self.pmu_events = MAX_EVENTS;
                Ok(())
            }
            Err(err) => {
                if err == ValidatorError::InvokeFailed {
                    self.statistics.invoke_failures += 1;
                }
                error!("characterization failed: {}", err);
                Err(err)
            }
        }
    }

    fn assemble_output(&mut self) -> Result<Response<'_>, ValidatorError> {
        let outputs = self.setup.as_ref().ok_or(ValidatorError::NotConfigured)?.outputs.clone();
        let total = total_bytes(&outputs);

        if total <= self.params.max_unit {
            let mut offset = 0;
            for (index, desc) in outputs.iter().enumerate() {
                self.runtime
                    .get_output(index, &mut self.scratch[offset..offset + desc.bytes])
                    .map_err(|err| {
                        error!("get_output {} failed: {:?}", index, err);
                        ValidatorError::GetOutputFailed
                    })?;
                offset += desc.bytes;
            }
            return Ok(Response {
                tag: ResponseTag::FullTensor,
                payload: &self.scratch[..total],
                total,
            });
        }

        if total > self.params.holding_capacity {
            return Err(ValidatorError::OutputTooLarge);
        }
        self.holding.clear();
        for (index, desc) in outputs.iter().enumerate() {
            let view = self
                .runtime
                .output(index)
                .filter(|view| view.len() >= desc.bytes)
                .ok_or(ValidatorError::GetOutputFailed)?;
            self.holding.extend_from_slice(&view[..desc.bytes]);
        }
        let started = self.chunk.begin(total, self.params.max_unit);
        debug_assert!(started);
        self.stream = Stream::Output;
        Ok(self.next_piece(ResponseTag::PartTensor, ResponseTag::LastTensor))
    }

    // Serves the next piece of the holding buffer.
    fn next_piece(&mut self, part: ResponseTag, last: ResponseTag) -> Response<'_> {
        let offset = self.chunk.progressed();
        let total = self.chunk.total();
        let n = self.chunk.next();
        self.chunk.advance(n);
        let tag = if self.chunk.done() {
            self.stream = Stream::Idle;
            last
        } else {
            part
        };
        trace!("{} {}+{}/{}", tag.as_str(), offset, n, total);
        Response {
            tag,
            payload: &self.holding[offset..offset + n],
            total,
        }
    }

    /// Fetch. Serves the next statistics piece or counter row if one is
    /// pending; otherwise captures fresh statistics. A whole-unit capture
    /// with full counter capture configured arms per-layer row streaming.
    pub fn fetch_stats(&mut self) -> Result<Response<'_>, ValidatorError> {
        match self.stream {
            Stream::Stats => return Ok(self.next_piece(ResponseTag::PartStats, ResponseTag::LastStats)),
            Stream::Pmu { layer } => return self.pmu_row(layer),
            Stream::Idle | Stream::Input | Stream::Output => {}
        }
        let config = self.setup.as_ref().ok_or(ValidatorError::NotConfigured)?.config;
        self.abandon_stream("statistics capture");

        let stats = ValidationStats {
            arena_used_bytes: self.arena_used_bytes,
            invocations: self.invocations,
            pmu_layers: self.pmu_layers as u32,
            pmu_events: self.pmu_events as u32,
            events_per_run: EVENTS_PER_RUN as u32,
            event_ids: CHARACTERIZATION_EVENTS[..self.pmu_events]
                .iter()
                .map(|event| event.code())
                .collect(),
            runtime_stats: &self.runtime_stats,
        };
        let encoded = postcard::to_allocvec(&stats)?;
        let total = encoded.len();
        if total > self.params.holding_capacity {
            return Err(ValidatorError::StatsTooLarge);
        }

        if total <= self.params.max_unit {
            self.scratch[..total].copy_from_slice(&encoded);
            if config.full_capture && self.pmu_layers > 0 {
                if max_row_len(self.pmu_events) <= self.params.max_unit {
                    trace!("arming counter rows for {} layers", self.pmu_layers);
                    self.stream = Stream::Pmu { layer: 0 };
                } else {
                    warn!(
                        "counter rows of {} events exceed {} byte unit; not streamed",
                        self.pmu_events, self.params.max_unit
                    );
                }
            }
            return Ok(Response {
                tag: ResponseTag::FullStats,
                payload: &self.scratch[..total],
                total,
            });
        }

        self.holding = encoded;
        let started = self.chunk.begin(total, self.params.max_unit);
        debug_assert!(started);
        self.stream = Stream::Stats;
        Ok(self.next_piece(ResponseTag::PartStats, ResponseTag::LastStats))
    }

    fn pmu_row(&mut self, layer: usize) -> Result<Response<'_>, ValidatorError> {
        let events = self.pmu_events;
        let row = PmuRow {
            layer: layer as u32,
            counters: &self.pmu_matrix[layer * events..(layer + 1) * events],
        };
        let len = match postcard::to_slice(&row, &mut self.scratch) {
            Ok(encoded) => encoded.len(),
            Err(_) => {
                self.stream = Stream::Idle;
                return Err(ValidatorError::StatsTooLarge);
            }
        };
        let next = layer + 1;
        self.stream = if next < self.pmu_layers {
            Stream::Pmu { layer: next }
        } else {
            Stream::Idle
        };
        trace!("counter row {}/{}", layer, self.pmu_layers);
        Ok(Response {
            tag: ResponseTag::FullPmuStats,
            payload: &self.scratch[..len],
            total: len,
        })
    }

    pub fn debug_state(&self) {
        info!(target: "", "Session: {:?}", self.state());
        match &self.setup {
            Some(setup) => {
                info!(target: "", "  {:?}", setup.config);
                info!(target: "", "  inputs {:?}", setup.inputs);
                info!(target: "", "  outputs {:?}", setup.outputs);
            }
            None => info!(target: "", "  Not configured."),
        }
        info!(
            target: "",
            "  Chunk {}/{} active {}",
            self.chunk.progressed(),
            self.chunk.total(),
            self.chunk.is_active()
        );
        info!(
            target: "",
            "  Invocations {} arena {} bytes",
            self.invocations,
            self.arena_used_bytes
        );
        if self.model_total != 0 {
            info!(target: "", "  Staged model {}/{} bytes", self.model.len(), self.model_total);
        }
        if self.pmu_layers != 0 {
            info!(target: "", "  Counter matrix {} x {}", self.pmu_layers, self.pmu_events);
        }
        info!(target: "", "  {:?}", self.statistics);
    }
}

fn characterize_with<'s, R: InferenceRuntime, B: CounterBank>(
    runtime: &mut R,
    pool: &mut CounterMatrixPool<'s, B>,
    operators: usize,
    storage: &'s mut [u32],
) -> Result<usize, ValidatorError> {
    let handle = pool.create(operators, MAX_EVENTS, storage).map_err(|err| {
        error!("counter matrix create failed: {:?}", err);
        ValidatorError::CharacterizationFailed
    })?;
    let result = drive_runs(runtime, pool, handle);
    let runs = pool.runs(handle).unwrap_or(0);
    if pool.destroy(handle).is_err() {
        warn!("counter matrix already released");
    }
    result.map(|_| runs)
}

fn drive_runs<R: InferenceRuntime, B: CounterBank>(
    runtime: &mut R,
    pool: &mut CounterMatrixPool<'_, B>,
    handle: MatrixHandle,
) -> Result<(), ValidatorError> {
    while !pool.complete(handle) {
        pool.inference_begin(handle)
            .or(Err(ValidatorError::CharacterizationFailed))?;
        runtime.invoke_profiled(&mut pool.probe(handle)).map_err(|err| {
            error!("profiled invoke failed: {:?}", err);
            ValidatorError::InvokeFailed
        })?;
        pool.inference_end(handle)
            .or(Err(ValidatorError::CharacterizationFailed))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantrip_pmu_interface::PmuEvent;
    use cantrip_pmu_matrix::{runs_required, OperatorProbe};
    use fake_pmu_core::FakeCounterBank;

    // Output byte k is one more than input byte k (inputs repeat to cover
    // larger outputs).
    #[derive(Default)]
    struct FakeRuntime {
        inputs: Vec<Vec<u8>>,
        outputs: Vec<Vec<u8>>,
        operators: usize,
        model: Vec<u8>,
        stats: Vec<u8>,
        init_calls: usize,
        invokes: usize,
        profiled_invokes: usize,
        fail_invoke: bool,
        no_input_views: bool,
    }

    impl FakeRuntime {
        fn new(inputs: &[usize], outputs: &[usize]) -> Self {
            FakeRuntime {
                inputs: inputs.iter().map(|n| vec![0u8; *n]).collect(),
                outputs: outputs.iter().map(|n| vec![0u8; *n]).collect(),
                operators: 3,
                stats: b"ticks".to_vec(),
                ..Default::default()
            }
        }

        fn compute(&mut self) {
            let flat = self.inputs.concat();
            let mut k = 0;
            for out in self.outputs.iter_mut() {
                for byte in out.iter_mut() {
                    *byte = if flat.is_empty() { k as u8 } else { flat[k % flat.len()].wrapping_add(1) };
                    k += 1;
                }
            }
        }
    }

    impl InferenceRuntime for FakeRuntime {
        fn load_model(&mut self, image: &[u8]) -> Result<(), RuntimeError> {
            self.model = image.to_vec();
            Ok(())
        }
        fn init(&mut self, _params: &RuntimeInitParams) -> Result<(), RuntimeError> {
            self.init_calls += 1;
            Ok(())
        }
        fn set_input(&mut self, index: usize, data: &[u8]) -> Result<(), RuntimeError> {
            let dst = self.inputs.get_mut(index).ok_or(RuntimeError(-1))?;
            if dst.len() != data.len() {
                return Err(RuntimeError(-1));
            }
            dst.copy_from_slice(data);
            Ok(())
        }
        fn invoke(&mut self) -> Result<(), RuntimeError> {
            if self.fail_invoke {
                return Err(RuntimeError(-2));
            }
            self.invokes += 1;
            self.compute();
            Ok(())
        }
        fn invoke_profiled(&mut self, probe: &mut dyn OperatorProbe) -> Result<(), RuntimeError> {
            if self.fail_invoke {
                return Err(RuntimeError(-2));
            }
            self.profiled_invokes += 1;
            for op in 0..self.operators {
                probe.op_begin(op);
                probe.op_end(op);
            }
            self.compute();
            Ok(())
        }
        fn get_output(&mut self, index: usize, dst: &mut [u8]) -> Result<(), RuntimeError> {
            let src = self.outputs.get(index).ok_or(RuntimeError(-3))?;
            if src.len() != dst.len() {
                return Err(RuntimeError(-3));
            }
            dst.copy_from_slice(src);
            Ok(())
        }
        fn input_mut(&mut self, index: usize) -> Option<&mut [u8]> {
            if self.no_input_views {
                return None;
            }
            self.inputs.get_mut(index).map(|v| v.as_mut_slice())
        }
        fn output(&self, index: usize) -> Option<&[u8]> { self.outputs.get(index).map(|v| v.as_slice()) }
        fn arena_used_bytes(&self) -> u32 { 4096 }
        fn capture_stats(&mut self) -> Option<&[u8]> { Some(&self.stats) }
        fn operator_count(&self) -> usize { self.operators }
    }

    type TestSession = ValidationSession<FakeRuntime, FakeCounterBank>;

    fn profile(op: usize, event: PmuEvent) -> u32 { 0x1_0000 * (op as u32 + 1) + event.code() as u32 }

    fn session(inputs: &[usize], outputs: &[usize], max_unit: usize) -> TestSession {
        ValidationSession::new(
            FakeRuntime::new(inputs, outputs),
            None,
            SessionParams {
                max_unit,
                ..Default::default()
            },
        )
    }

    fn descriptors(sizes: &[usize]) -> TensorDescriptors {
        sizes.iter().map(|bytes| TensorDescriptor { bytes: *bytes }).collect()
    }

    fn config_block(
        profiling: bool,
        warmup_runs: u32,
        inputs: &[usize],
        outputs: &[usize],
        full_capture: bool,
    ) -> Vec<u8> {
        ConfigBlock {
            config: SessionConfig {
                profiling,
                warmup_runs,
                num_inputs: inputs.len(),
                num_outputs: outputs.len(),
                full_capture,
            },
            inputs: descriptors(inputs),
            outputs: descriptors(outputs),
        }
        .to_bytes()
    }

    fn plain_config(inputs: &[usize], outputs: &[usize]) -> Vec<u8> {
        config_block(false, 0, inputs, outputs, false)
    }

    #[test]
    fn small_round_trip() {
        let mut s = session(&[64], &[64], MAX_TRANSPORT_UNIT);
        assert_eq!(s.state(), SessionState::Unconfigured);
        s.configure(&plain_config(&[64], &[64])).unwrap();
        assert_eq!(s.state(), SessionState::Configured);

        let response = s.invoke(Command::Invoke, &[7u8; 64]).unwrap();
        assert_eq!(response.tag, ResponseTag::FullTensor);
        assert_eq!(response.payload, &[8u8; 64][..]);
        assert_eq!(response.total, 64);
        assert_eq!(s.state(), SessionState::Invoked);
        assert_eq!(s.runtime().invokes, 1);
        assert_eq!(*s.statistics(), Statistics::default());
    }

    #[test]
    fn oversized_output_streams() {
        const UNIT: usize = 32;
        let mut s = session(&[16], &[3 * UNIT], UNIT);
        s.configure(&plain_config(&[16], &[3 * UNIT])).unwrap();
        let input: Vec<u8> = (0..16).collect();
        let expected: Vec<u8> = (0..3 * UNIT).map(|k| input[k % 16] + 1).collect();

        let mut received = Vec::new();
        let first = s.invoke(Command::Invoke, &input).unwrap();
        assert_eq!((first.tag, first.payload.len(), first.total), (ResponseTag::PartTensor, UNIT, 3 * UNIT));
        received.extend_from_slice(first.payload);
        assert_eq!(s.state(), SessionState::OutputStreaming);

        let second = s.invoke(Command::NextOutputChunk, &[]).unwrap();
        assert_eq!((second.tag, second.payload.len()), (ResponseTag::PartTensor, UNIT));
        received.extend_from_slice(second.payload);

        let third = s.invoke(Command::NextOutputChunk, &[]).unwrap();
        assert_eq!((third.tag, third.payload.len()), (ResponseTag::LastTensor, UNIT));
        received.extend_from_slice(third.payload);

        assert_eq!(received, expected);
        assert_eq!(s.state(), SessionState::Invoked);
        assert_eq!(s.runtime().invokes, 1);
        assert_eq!(s.statistics().protocol_fallthroughs, 0);
    }

    #[test]
    fn config_size_mismatch_skips_init() {
        let mut s = session(&[64], &[64], MAX_TRANSPORT_UNIT);
        let mut block = plain_config(&[64], &[64]);
        block.extend_from_slice(&[0u8; 4]);
        assert_eq!(s.configure(&block), Err(ValidatorError::ConfigSizeMismatch));
        block.truncate(block.len() - 8);
        assert_eq!(s.configure(&block), Err(ValidatorError::ConfigSizeMismatch));
        assert_eq!(s.runtime().init_calls, 0);
        assert_eq!(s.state(), SessionState::Unconfigured);
    }

    #[test]
    fn too_many_tensors_rejected() {
        let mut s = session(&[4], &[4], MAX_TRANSPORT_UNIT);
        let sizes = [4usize; MAX_TENSORS + 1];
        let mut block: Vec<u8> = [0u32, 0, sizes.len() as u32, 0, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        for size in sizes {
            block.extend_from_slice(&(size as u32).to_le_bytes());
        }
        assert_eq!(s.configure(&block), Err(ValidatorError::TooManyTensors));
        assert_eq!(s.runtime().init_calls, 0);
    }

    #[test]
    fn operations_need_configure() {
        let mut s = session(&[64], &[64], 16);
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 64]), Err(ValidatorError::NotConfigured));
        assert_eq!(s.accept_input_chunk(&[0u8; 16]), Err(ValidatorError::NotConfigured));
        assert_eq!(s.fetch_stats(), Err(ValidatorError::NotConfigured));
    }

    #[test]
    fn input_chunks_fill_views() {
        let mut s = session(&[20, 20], &[8], 16);
        s.configure(&plain_config(&[20, 20], &[8])).unwrap();
        let input: Vec<u8> = (0..40).collect();

        let mut pieces = input.chunks(16);
        s.accept_input_chunk(pieces.next().unwrap()).unwrap();
        assert_eq!(s.state(), SessionState::InputStreaming);
        for piece in pieces {
            s.accept_input_chunk(piece).unwrap();
        }
        assert_eq!(s.state(), SessionState::Configured);
        assert_eq!(s.runtime().inputs[0], input[..20]);
        assert_eq!(s.runtime().inputs[1], input[20..]);

        // Streamed input is used as-is.
        let response = s.invoke(Command::Invoke, &[]).unwrap();
        assert_eq!(response.tag, ResponseTag::FullTensor);
        assert_eq!(response.payload, &[1, 2, 3, 4, 5, 6, 7, 8][..]);
    }

    #[test]
    fn input_chunk_needs_oversized_input() {
        let mut s = session(&[16], &[8], 16);
        s.configure(&plain_config(&[16], &[8])).unwrap();
        assert_eq!(s.accept_input_chunk(&[0u8; 8]), Err(ValidatorError::UnexpectedInputChunk));
        assert_eq!(s.state(), SessionState::Configured);
    }

    #[test]
    fn input_overflow_writes_nothing() {
        let mut s = session(&[20, 20], &[8], 16);
        s.configure(&plain_config(&[20, 20], &[8])).unwrap();
        s.accept_input_chunk(&[1u8; 16]).unwrap();
        assert_eq!(s.accept_input_chunk(&[2u8; 30]), Err(ValidatorError::InputOverflow));
        assert_eq!(s.state(), SessionState::InputStreaming);
        assert!(s.runtime().inputs[1].iter().all(|b| *b == 0));
        // The stream is still usable after the rejected piece.
        s.accept_input_chunk(&[2u8; 24]).unwrap();
        assert_eq!(s.state(), SessionState::Configured);
    }

    #[test]
    fn input_view_too_small() {
        // Runtime tensor is smaller than the configured size.
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[10, 30], &[8]),
            None,
            SessionParams {
                max_unit: 16,
                ..Default::default()
            },
        );
        s.configure(&plain_config(&[20, 20], &[8])).unwrap();
        assert_eq!(s.accept_input_chunk(&[1u8; 16]), Err(ValidatorError::InputOverflow));
        assert!(s.runtime().inputs[0].iter().all(|b| *b == 0));
        assert_eq!(s.state(), SessionState::Configured);
    }

    #[test]
    fn rejected_first_input_chunk_keeps_output_stream() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[10, 30], &[32]),
            None,
            SessionParams {
                max_unit: 16,
                ..Default::default()
            },
        );
        s.configure(&plain_config(&[20, 20], &[32])).unwrap();
        assert_eq!(s.invoke(Command::Invoke, &[]).unwrap().tag, ResponseTag::PartTensor);
        assert_eq!(s.state(), SessionState::OutputStreaming);

        assert_eq!(s.accept_input_chunk(&[1u8; 16]), Err(ValidatorError::InputOverflow));
        assert_eq!(s.state(), SessionState::OutputStreaming);
        assert_eq!(s.statistics().abandoned_streams, 0);
        assert_eq!(s.invoke(Command::NextOutputChunk, &[]).unwrap().tag, ResponseTag::LastTensor);
        assert_eq!(s.statistics().protocol_fallthroughs, 0);
    }

    #[test]
    fn no_writable_input() {
        let mut s = session(&[20, 20], &[8], 16);
        s.configure(&plain_config(&[20, 20], &[8])).unwrap();
        s.runtime_mut().no_input_views = true;
        assert_eq!(s.accept_input_chunk(&[1u8; 16]), Err(ValidatorError::NoWritableInput));
    }

    #[test]
    fn input_size_mismatch() {
        let mut s = session(&[64], &[64], MAX_TRANSPORT_UNIT);
        s.configure(&plain_config(&[64], &[64])).unwrap();
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 10]), Err(ValidatorError::InputSizeMismatch));
        assert_eq!(s.runtime().invokes, 0);
    }

    #[test]
    fn wrong_sized_invoke_keeps_output_stream() {
        let mut s = session(&[4], &[64], 16);
        s.configure(&plain_config(&[4], &[64])).unwrap();
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 4]).unwrap().tag, ResponseTag::PartTensor);
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 5]), Err(ValidatorError::InputSizeMismatch));
        assert_eq!(s.state(), SessionState::OutputStreaming);
        assert_eq!(s.statistics().abandoned_streams, 0);
        assert_eq!(s.runtime().invokes, 1);
        assert_eq!(s.invoke(Command::NextOutputChunk, &[]).unwrap().tag, ResponseTag::PartTensor);
    }

    #[test]
    fn invoke_failure_counted() {
        let mut s = session(&[4], &[4], MAX_TRANSPORT_UNIT);
        s.configure(&plain_config(&[4], &[4])).unwrap();
        s.runtime_mut().fail_invoke = true;
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 4]), Err(ValidatorError::InvokeFailed));
        assert_eq!(s.statistics().invoke_failures, 1);
        assert_eq!(s.state(), SessionState::Configured);
        assert_eq!(s.invocations(), 0);
    }

    #[test]
    fn unknown_compute_command() {
        let mut s = session(&[4], &[4], MAX_TRANSPORT_UNIT);
        s.configure(&plain_config(&[4], &[4])).unwrap();
        assert_eq!(s.invoke(Command::FetchStats, &[]), Err(ValidatorError::UnknownCommand));
    }

    // A continuation with nothing in flight is served as a normal invoke.
    #[test]
    fn continuation_without_stream_falls_through() {
        let mut s = session(&[4], &[4], MAX_TRANSPORT_UNIT);
        s.configure(&plain_config(&[4], &[4])).unwrap();
        let response = s.invoke(Command::NextOutputChunk, &[1, 2, 3, 4]).unwrap();
        assert_eq!(response.tag, ResponseTag::FullTensor);
        assert_eq!(response.payload, &[2, 3, 4, 5][..]);
        assert_eq!(s.statistics().protocol_fallthroughs, 1);
        assert_eq!(s.runtime().invokes, 1);
    }

    #[test]
    fn configure_abandons_stream() {
        let mut s = session(&[4], &[64], 16);
        s.configure(&plain_config(&[4], &[64])).unwrap();
        assert_eq!(s.invoke(Command::Invoke, &[0u8; 4]).unwrap().tag, ResponseTag::PartTensor);
        s.configure(&plain_config(&[4], &[64])).unwrap();
        assert_eq!(s.state(), SessionState::Configured);
        assert_eq!(s.statistics().abandoned_streams, 1);
        // The continuation now falls through to a fresh invoke.
        assert_eq!(s.invoke(Command::NextOutputChunk, &[]).unwrap().tag, ResponseTag::PartTensor);
        assert_eq!(s.statistics().protocol_fallthroughs, 1);
        assert_eq!(s.runtime().invokes, 2);
    }

    #[test]
    fn rejected_configure_keeps_stream() {
        let mut s = session(&[4], &[64], 16);
        s.configure(&plain_config(&[4], &[64])).unwrap();
        s.invoke(Command::Invoke, &[0u8; 4]).unwrap();
        assert!(s.configure(&[0u8; 3]).is_err());
        assert_eq!(s.state(), SessionState::OutputStreaming);
        assert_eq!(s.statistics().abandoned_streams, 0);
    }

    #[test]
    fn stats_capture_abandons_output_stream() {
        let mut s = session(&[4], &[64], 16);
        s.configure(&plain_config(&[4], &[64])).unwrap();
        s.invoke(Command::Invoke, &[0u8; 4]).unwrap();
        let tag = s.fetch_stats().unwrap().tag;
        assert!(tag == ResponseTag::FullStats || tag == ResponseTag::PartStats);
        assert_eq!(s.statistics().abandoned_streams, 1);
    }

    #[test]
    fn stats_stream_in_pieces() {
        let mut s = session(&[4], &[4], 16);
        s.configure(&config_block(true, 0, &[4], &[4], false)).unwrap();
        s.runtime_mut().stats = (0..40).collect();
        s.invoke(Command::Invoke, &[0u8; 4]).unwrap();

        let mut received = Vec::new();
        let mut pieces = 0;
        loop {
            let response = s.fetch_stats().unwrap();
            let tag = response.tag;
            pieces += 1;
            assert!(response.payload.len() <= 16);
            received.extend_from_slice(response.payload);
            match tag {
                ResponseTag::PartStats => assert_eq!(s.state(), SessionState::StatsStreaming),
                ResponseTag::LastStats => break,
                other => panic!("unexpected tag {:?}", other),
            }
        }
        assert!(pieces > 2);
        let stats: ValidationStats = postcard::from_bytes(&received).unwrap();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.arena_used_bytes, 4096);
        assert_eq!(stats.pmu_layers, 0);
        assert_eq!(stats.runtime_stats, &s.runtime().stats[..]);
        assert_eq!(s.state(), SessionState::Invoked);
    }

    #[test]
    fn characterization_runs_once_after_warmup() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            Some(FakeCounterBank::new(profile)),
            SessionParams::default(),
        );
        s.configure(&config_block(true, 1, &[4], &[4], true)).unwrap();

        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        assert_eq!(s.runtime().profiled_invokes, 0);
        assert_eq!(s.counter_bank().unwrap().arm_count(), 0);

        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        let runs = runs_required(MAX_EVENTS);
        assert_eq!(s.runtime().profiled_invokes, runs);

        let response = s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        assert_eq!(response.payload, &[2, 3, 4, 5][..]);
        assert_eq!(s.runtime().profiled_invokes, runs);
        assert_eq!(s.invocations(), 3);
        assert!(s.counter_bank().is_some());
    }

    #[test]
    fn counter_rows_follow_stats() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            Some(FakeCounterBank::new(profile)),
            SessionParams::default(),
        );
        s.configure(&config_block(true, 0, &[4], &[4], true)).unwrap();
        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();

        let (tag, encoded) = {
            let response = s.fetch_stats().unwrap();
            (response.tag, response.payload.to_vec())
        };
        assert_eq!(tag, ResponseTag::FullStats);
        let stats: ValidationStats = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(stats.pmu_layers, 3);
        assert_eq!(stats.pmu_events as usize, MAX_EVENTS);
        assert_eq!(stats.events_per_run as usize, EVENTS_PER_RUN);
        assert_eq!(stats.event_ids[0], PmuEvent::CpuCycles.code());
        assert_eq!(stats.runtime_stats, b"ticks");
        assert_eq!(s.state(), SessionState::PmuStreaming);

        for layer in 0..3 {
            let response = s.fetch_stats().unwrap();
            assert_eq!(response.tag, ResponseTag::FullPmuStats);
            let row: PmuRowBuf = postcard::from_bytes(response.payload).unwrap();
            assert_eq!(row.layer, layer as u32);
            let expected: Vec<u32> = CHARACTERIZATION_EVENTS
                .iter()
                .map(|event| profile(layer, *event))
                .collect();
            assert_eq!(row.counters, expected);
        }
        assert_eq!(s.state(), SessionState::Invoked);
        // The next fetch is a fresh capture.
        assert_eq!(s.fetch_stats().unwrap().tag, ResponseTag::FullStats);
    }

    // Statistics that fit one unit whose rows would not: the rows are
    // never armed and every fetch is a fresh capture.
    #[test]
    fn counter_rows_wider_than_unit_are_not_armed() {
        let stats_len = {
            let mut s: TestSession = ValidationSession::new(
                FakeRuntime::new(&[4], &[4]),
                Some(FakeCounterBank::new(profile)),
                SessionParams::default(),
            );
            s.configure(&config_block(true, 0, &[4], &[4], true)).unwrap();
            s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
            let len = s.fetch_stats().unwrap().payload.len();
            len
        };
        assert!(stats_len < max_row_len(MAX_EVENTS));

        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            Some(FakeCounterBank::new(profile)),
            SessionParams {
                max_unit: stats_len,
                ..Default::default()
            },
        );
        s.configure(&config_block(true, 0, &[4], &[4], true)).unwrap();
        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        for _ in 0..3 {
            assert_eq!(s.fetch_stats().unwrap().tag, ResponseTag::FullStats);
            assert_eq!(s.state(), SessionState::Invoked);
        }
    }

    #[test]
    fn counter_rows_fit_worst_case_unit() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            Some(FakeCounterBank::new(profile)),
            SessionParams {
                max_unit: max_row_len(MAX_EVENTS),
                ..Default::default()
            },
        );
        s.configure(&config_block(true, 0, &[4], &[4], true)).unwrap();
        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        assert_eq!(s.fetch_stats().unwrap().tag, ResponseTag::FullStats);
        for _ in 0..3 {
            assert_eq!(s.fetch_stats().unwrap().tag, ResponseTag::FullPmuStats);
        }
        assert_eq!(s.state(), SessionState::Invoked);
    }

    #[test]
    fn counter_rows_need_full_capture() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            Some(FakeCounterBank::new(profile)),
            SessionParams::default(),
        );
        s.configure(&config_block(true, 0, &[4], &[4], false)).unwrap();
        s.invoke(Command::Invoke, &[1, 2, 3, 4]).unwrap();
        assert_eq!(s.fetch_stats().unwrap().tag, ResponseTag::FullStats);
        assert_eq!(s.state(), SessionState::Invoked);
    }

    #[test]
    fn model_is_staged_until_configure() {
        let mut s = session(&[4], &[4], 16);
        let image: Vec<u8> = (0..100).collect();
        for piece in image.chunks(30) {
            s.load_model_chunk(image.len(), piece).unwrap();
        }
        assert_eq!(s.staged_model(), (100, 100));
        s.configure(&plain_config(&[4], &[4])).unwrap();
        assert_eq!(s.runtime().model, image);
        assert_eq!(s.staged_model(), (0, 0));
    }

    #[test]
    fn model_staging_limits() {
        let mut s: TestSession = ValidationSession::new(
            FakeRuntime::new(&[4], &[4]),
            None,
            SessionParams {
                model_capacity: 64,
                ..Default::default()
            },
        );
        assert_eq!(s.load_model_chunk(100, &[0u8; 10]), Err(ValidatorError::ModelTooLarge));
        s.load_model_chunk(10, &[0u8; 6]).unwrap();
        assert_eq!(s.load_model_chunk(10, &[0u8; 6]), Err(ValidatorError::ModelOverflow));
        assert_eq!(s.staged_model(), (6, 10));
        s.load_model_chunk(10, &[0u8; 4]).unwrap();
        // A piece after a complete image starts the next one.
        s.load_model_chunk(10, &[1u8; 3]).unwrap();
        assert_eq!(s.staged_model(), (3, 10));
    }

    #[test]
    fn max_unit_is_clamped() {
        let s = session(&[4], &[4], 0);
        assert_eq!(s.params().max_unit, 1);
        let s = session(&[4], &[4], usize::MAX);
        assert_eq!(s.params().max_unit, MAX_TRANSPORT_UNIT);
    }
}
