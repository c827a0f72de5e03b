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

//! Operator x event counter matrix built by re-running a workload.
//!
//! The counter bank samples only EVENTS_PER_RUN events at a time. To get a
//! full picture the workload is run once per slice of events; each run the
//! per-operator counts for the live slice are added into
//! |matrix[op][slice..slice + EVENTS_PER_RUN]|.
//!
//! This depends on every run executing the same operators in the same
//! order with the same instruction mix. A workload with a first-run-only
//! operator (e.g. lazy one-time setup) shifts rows on later runs and the
//! matrix is silently wrong; nothing here detects that.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod tag_map;

use cantrip_pmu_interface::*;
use log::{info, trace, warn};
use static_assertions::const_assert;
use tag_map::TagMap;

/// Hard ceiling on matrix rows.
pub const MAX_OPERATORS: usize = 256;

/// Number of accumulators that may be live at once.
pub const MAX_ACTIVE_MATRICES: usize = 1;

const_assert!(MAX_ACTIVE_MATRICES > 0 && MAX_ACTIVE_MATRICES <= u8::MAX as usize);

#[derive(Debug, Eq, PartialEq)]
pub enum MatrixError {
    InvalidCapacity,
    StorageTooSmall,
    NoFreeSlot,
    InvalidHandle,
}

/// Names an accumulator slot. Checked on every call; a handle outlives
/// its accumulator only as a stale value that every operation rejects.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MatrixHandle {
    slot: u8,
    generation: u16,
}

/// Start/finish notifications from an instrumented workload.
pub trait OperatorProbe {
    fn op_begin(&mut self, index: usize);
    fn op_end(&mut self, index: usize);
}

/// Number of workload runs needed to sample |events| events.
pub fn runs_required(events: usize) -> usize { (events + EVENTS_PER_RUN - 1) / EVENTS_PER_RUN }

struct Accumulator<'s> {
    generation: u16,
    operators: usize,
    events: usize,
    // First event (matrix column) of the live slice.
    cursor: usize,
    armed: CounterMask,
    runs: usize,
    complete: bool,
    matrix: &'s mut [u32],
    tags: TagMap,
}

impl<'s> Accumulator<'s> {
    fn slice(&self) -> &'static [PmuEvent] {
        let end = core::cmp::min(self.cursor + EVENTS_PER_RUN, self.events);
        &CHARACTERIZATION_EVENTS[self.cursor..end]
    }
}

/// Fixed table of accumulator slots sharing one counter bank.
pub struct CounterMatrixPool<'s, B> {
    bank: B,
    slots: [Option<Accumulator<'s>>; MAX_ACTIVE_MATRICES],
    next_generation: u16,
}

impl<'s, B: CounterBank> CounterMatrixPool<'s, B> {
    pub fn new(bank: B) -> Self {
        CounterMatrixPool {
            bank,
            slots: core::array::from_fn(|_| None),
            next_generation: 0,
        }
    }

    pub fn bank(&self) -> &B { &self.bank }

    pub fn bank_mut(&mut self) -> &mut B { &mut self.bank }

    /// Releases the counter bank (and the borrow of any storage).
    pub fn into_bank(self) -> B { self.bank }

    fn lookup<'a>(
        slots: &'a mut [Option<Accumulator<'s>>; MAX_ACTIVE_MATRICES],
        handle: MatrixHandle,
    ) -> Option<&'a mut Accumulator<'s>> {
        slots
            .get_mut(handle.slot as usize)?
            .as_mut()
            .filter(|acc| acc.generation == handle.generation)
    }

    fn lookup_ref(&self, handle: MatrixHandle) -> Option<&Accumulator<'s>> {
        self.slots
            .get(handle.slot as usize)?
            .as_ref()
            .filter(|acc| acc.generation == handle.generation)
    }

    /// Claims a slot for an |operators| x |events| matrix backed by
    /// |storage|. On success the matrix is zeroed and the bank is armed for
    /// events [0, EVENTS_PER_RUN). On failure |storage| is not touched.
    pub fn create(
        &mut self,
        operators: usize,
        events: usize,
        storage: &'s mut [u32],
    ) -> Result<MatrixHandle, MatrixError> {
        if operators == 0 || operators > MAX_OPERATORS || events == 0 || events > MAX_EVENTS {
            return Err(MatrixError::InvalidCapacity);
        }
        let cells = operators * events;
        if storage.len() < cells {
            return Err(MatrixError::StorageTooSmall);
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(MatrixError::NoFreeSlot)?;

        let matrix = &mut storage[..cells];
        matrix.fill(0);

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        let mut acc = Accumulator {
            generation,
            operators,
            events,
            cursor: 0,
            armed: CounterMask::empty(),
            runs: 0,
            complete: false,
            matrix,
            tags: TagMap::new(operators),
        };
        acc.armed = arm_events(&mut self.bank, acc.slice());
        trace!(
            "matrix {}: {} ops x {} events, {} runs",
            slot,
            operators,
            events,
            runs_required(events)
        );
        self.slots[slot] = Some(acc);

        Ok(MatrixHandle {
            slot: slot as u8,
            generation,
        })
    }

    /// Releases the slot. The storage keeps whatever was accumulated.
    pub fn destroy(&mut self, handle: MatrixHandle) -> Result<(), MatrixError> {
        Self::lookup(&mut self.slots, handle).ok_or(MatrixError::InvalidHandle)?;
        self.bank.disable(CounterMask::all());
        self.slots[handle.slot as usize] = None;
        Ok(())
    }

    /// Starts a run of the workload.
    pub fn inference_begin(&mut self, handle: MatrixHandle) -> Result<(), MatrixError> {
        let acc = Self::lookup(&mut self.slots, handle).ok_or(MatrixError::InvalidHandle)?;
        if acc.complete {
            warn!("matrix already complete; run ignored");
            return Ok(());
        }
        self.bank.enable(acc.armed);
        Ok(())
    }

    /// Finishes a run and re-arms the bank for the next event slice.
    pub fn inference_end(&mut self, handle: MatrixHandle) -> Result<(), MatrixError> {
        let acc = Self::lookup(&mut self.slots, handle).ok_or(MatrixError::InvalidHandle)?;
        if acc.complete {
            return Ok(());
        }
        self.bank.disable(acc.armed);
        acc.runs += 1;
        acc.cursor += EVENTS_PER_RUN;
        if acc.cursor >= acc.events {
            acc.complete = true;
            acc.armed = CounterMask::empty();
            info!("matrix complete after {} runs", acc.runs);
        } else {
            acc.armed = arm_events(&mut self.bank, acc.slice());
        }
        Ok(())
    }

    /// Zeroes the live counters at the start of operator |index|.
    /// Out-of-range indices and invalid handles are ignored.
    pub fn op_begin(&mut self, handle: MatrixHandle, index: usize) {
        let acc = match Self::lookup(&mut self.slots, handle) {
            Some(acc) => acc,
            None => return,
        };
        if index >= acc.operators || acc.complete {
            return;
        }
        self.bank.reset(acc.armed);
    }

    /// Adds the live counters into row |index| for the current slice.
    /// Out-of-range indices and invalid handles are ignored.
    pub fn op_end(&mut self, handle: MatrixHandle, index: usize) {
        let acc = match Self::lookup(&mut self.slots, handle) {
            Some(acc) => acc,
            None => return,
        };
        if index >= acc.operators || acc.complete {
            return;
        }
        let mut values = [0u32; EVENTS_PER_RUN];
        read_events(&self.bank, &mut values);
        let live = acc.slice().len();
        let row = index * acc.events + acc.cursor;
        for (cell, value) in acc.matrix[row..row + live].iter_mut().zip(values.iter()) {
            *cell = cell.saturating_add(*value);
        }
    }

    /// Finds or assigns the row for operator |name|. None once every row
    /// is taken or the handle is invalid.
    pub fn resolve_tag(&mut self, handle: MatrixHandle, name: &'static str) -> Option<usize> {
        Self::lookup(&mut self.slots, handle)?.tags.resolve(name)
    }

    /// Non-creating form of resolve_tag.
    pub fn find_tag(&self, handle: MatrixHandle, name: &str) -> Option<usize> {
        self.lookup_ref(handle)?.tags.find(name)
    }

    /// True once every event slice has been sampled.
    pub fn complete(&self, handle: MatrixHandle) -> bool {
        self.lookup_ref(handle).map_or(false, |acc| acc.complete)
    }

    /// Number of completed runs.
    pub fn runs(&self, handle: MatrixHandle) -> Option<usize> { self.lookup_ref(handle).map(|acc| acc.runs) }

    /// Row-major |operators x events| matrix.
    pub fn get(&self, handle: MatrixHandle) -> Option<&[u32]> {
        self.lookup_ref(handle).map(|acc| &*acc.matrix)
    }

    /// Returns a probe that routes operator notifications to |handle|.
    pub fn probe(&mut self, handle: MatrixHandle) -> MatrixProbe<'_, 's, B> {
        MatrixProbe { pool: self, handle }
    }
}

pub struct MatrixProbe<'p, 's, B> {
    pool: &'p mut CounterMatrixPool<'s, B>,
    handle: MatrixHandle,
}

impl<'p, 's, B: CounterBank> MatrixProbe<'p, 's, B> {
    /// Row for a tagged operator; see CounterMatrixPool::resolve_tag.
    pub fn resolve_tag(&mut self, name: &'static str) -> Option<usize> {
        self.pool.resolve_tag(self.handle, name)
    }
}

impl<'p, 's, B: CounterBank> OperatorProbe for MatrixProbe<'p, 's, B> {
    fn op_begin(&mut self, index: usize) { self.pool.op_begin(self.handle, index) }
    fn op_end(&mut self, index: usize) { self.pool.op_end(self.handle, index) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake_pmu_core::FakeCounterBank;

    const POISON: u32 = 0xa5a5_a5a5;

    fn profile(op: usize, event: PmuEvent) -> u32 { 0x1_0000 * (op as u32 + 1) + event.code() as u32 }

    fn pool<'s>() -> CounterMatrixPool<'s, FakeCounterBank> {
        CounterMatrixPool::new(FakeCounterBank::new(profile))
    }

    // One full run over |operators| operators.
    fn run_once(
        pool: &mut CounterMatrixPool<'_, FakeCounterBank>,
        handle: MatrixHandle,
        operators: usize,
    ) {
        pool.inference_begin(handle).unwrap();
        let mut probe = pool.probe(handle);
        for op in 0..operators {
            probe.op_begin(op);
            probe.op_end(op);
        }
        pool.inference_end(handle).unwrap();
    }

    #[test]
    fn invalid_capacity_leaves_storage_alone() {
        let mut storage = [POISON; 64];
        // Each create borrows the storage for the pool's lifetime, so use a
        // fresh pool per attempt.
        assert_eq!(pool().create(0, 4, &mut storage), Err(MatrixError::InvalidCapacity));
        assert_eq!(
            pool().create(MAX_OPERATORS + 1, 4, &mut storage),
            Err(MatrixError::InvalidCapacity)
        );
        assert_eq!(pool().create(4, 0, &mut storage), Err(MatrixError::InvalidCapacity));
        assert_eq!(
            pool().create(1, MAX_EVENTS + 1, &mut storage),
            Err(MatrixError::InvalidCapacity)
        );
        assert_eq!(pool().create(8, 9, &mut storage), Err(MatrixError::StorageTooSmall));
        assert!(storage.iter().all(|v| *v == POISON));
    }

    #[test]
    fn create_zeroes_and_arms_first_slice() {
        let mut storage = [POISON; 16];
        let mut pool = pool();
        let handle = pool.create(2, 6, &mut storage).unwrap();
        assert_eq!(pool.get(handle).unwrap(), &[0u32; 12][..]);
        assert_eq!(pool.bank().armed_events(), &CHARACTERIZATION_EVENTS[..EVENTS_PER_RUN]);
        assert!(!pool.complete(handle));
        drop(pool);
        // Cells past the matrix are not part of it.
        assert_eq!(storage[12..], [POISON; 4]);
    }

    #[test]
    fn coverage_matches_profile() {
        const OPS: usize = 3;
        const EVENTS: usize = 10;
        let mut storage = [0u32; OPS * EVENTS];
        let mut pool = pool();
        let handle = pool.create(OPS, EVENTS, &mut storage).unwrap();

        for _ in 0..runs_required(EVENTS) {
            assert!(!pool.complete(handle));
            run_once(&mut pool, handle, OPS);
        }
        assert!(pool.complete(handle));
        assert_eq!(pool.runs(handle), Some(3));

        let matrix = pool.get(handle).unwrap();
        for op in 0..OPS {
            for (e, event) in CHARACTERIZATION_EVENTS[..EVENTS].iter().enumerate() {
                assert_eq!(matrix[op * EVENTS + e], profile(op, *event), "op {} {:?}", op, event);
            }
        }
    }

    #[test]
    fn repeated_operator_accumulates() {
        let mut storage = [0u32; 4];
        let mut pool = pool();
        let handle = pool.create(1, 4, &mut storage).unwrap();
        pool.inference_begin(handle).unwrap();
        // Two workload operators land in row 0.
        pool.op_begin(handle, 0);
        pool.op_end(handle, 0);
        pool.op_begin(handle, 0);
        pool.op_end(handle, 0);
        pool.inference_end(handle).unwrap();
        assert!(pool.complete(handle));
        let matrix = pool.get(handle).unwrap();
        for (e, event) in CHARACTERIZATION_EVENTS[..4].iter().enumerate() {
            assert_eq!(matrix[e], profile(0, *event) + profile(1, *event));
        }
    }

    // Out-of-range operators are a profiling gap, not a fault.
    #[test]
    fn out_of_range_operator_is_skipped() {
        let mut storage = [0u32; 8];
        let mut pool = pool();
        let handle = pool.create(2, 4, &mut storage).unwrap();
        pool.inference_begin(handle).unwrap();
        pool.op_begin(handle, 2);
        pool.op_end(handle, 2);
        pool.op_begin(handle, usize::MAX);
        pool.op_end(handle, usize::MAX);
        pool.inference_end(handle).unwrap();
        assert!(pool.get(handle).unwrap().iter().all(|v| *v == 0));
    }

    #[test]
    fn single_active_matrix() {
        let mut first = [0u32; 4];
        let mut second = [0u32; 4];
        let mut third = [0u32; 4];
        let mut pool = pool();
        let handle = pool.create(1, 4, &mut first).unwrap();
        assert_eq!(pool.create(1, 4, &mut second), Err(MatrixError::NoFreeSlot));
        pool.destroy(handle).unwrap();
        let next = pool.create(1, 4, &mut third).unwrap();
        assert_ne!(handle, next);
    }

    #[test]
    fn stale_handle_rejected() {
        let mut storage = [0u32; 4];
        let mut pool = pool();
        let handle = pool.create(1, 4, &mut storage).unwrap();
        pool.destroy(handle).unwrap();
        assert_eq!(pool.destroy(handle), Err(MatrixError::InvalidHandle));
        assert_eq!(pool.inference_begin(handle), Err(MatrixError::InvalidHandle));
        assert_eq!(pool.inference_end(handle), Err(MatrixError::InvalidHandle));
        pool.op_begin(handle, 0);
        pool.op_end(handle, 0);
        assert!(!pool.complete(handle));
        assert!(pool.get(handle).is_none());
        assert_eq!(pool.resolve_tag(handle, "conv"), None);
    }

    #[test]
    fn tags_resolve_to_rows() {
        let mut storage = [0u32; 8];
        let mut pool = pool();
        let handle = pool.create(2, 4, &mut storage).unwrap();
        assert_eq!(pool.find_tag(handle, "unseen"), None);
        assert_eq!(pool.resolve_tag(handle, "conv"), Some(0));
        assert_eq!(pool.resolve_tag(handle, "conv"), Some(0));
        assert_eq!(pool.probe(handle).resolve_tag("softmax"), Some(1));
        // Only |operators| rows exist.
        assert_eq!(pool.resolve_tag(handle, "add"), None);
        assert_eq!(pool.find_tag(handle, "softmax"), Some(1));
    }

    #[test]
    fn runs_after_complete_are_ignored() {
        let mut storage = [0u32; 4];
        let mut pool = pool();
        let handle = pool.create(1, 4, &mut storage).unwrap();
        run_once(&mut pool, handle, 1);
        assert!(pool.complete(handle));
        let arms = pool.bank().arm_count();
        run_once(&mut pool, handle, 1);
        assert_eq!(pool.runs(handle), Some(1));
        assert_eq!(pool.bank().arm_count(), arms);
        assert!(pool.bank().enabled().is_empty());
    }
}
