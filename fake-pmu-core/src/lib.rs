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

//! Software stand-in for the PMU counter bank.
//!
//! The fake models a workload as a sequence of operators: every reset
//! issued while counters are enabled marks the start of the next operator,
//! and reads return |profile(op, event)| split across the chained 16-bit
//! halves. Reprogramming counter 0 starts a new run (operator 0 again).

#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::vec::Vec;
use cantrip_pmu_interface::*;
use log::trace;

/// Per-operator event counts of the modeled workload.
pub type OpProfile = fn(op: usize, event: PmuEvent) -> u32;

pub struct FakeCounterBank {
    types: [EventType; COUNTERS_PER_BANK],
    enabled: CounterMask,
    profile: OpProfile,
    ops_started: usize,
    arm_count: usize,
}

impl FakeCounterBank {
    pub fn new(profile: OpProfile) -> Self {
        Self {
            types: [EventType::new(); COUNTERS_PER_BANK],
            enabled: CounterMask::empty(),
            profile,
            ops_started: 0,
            arm_count: 0,
        }
    }

    /// Number of times the bank has been reprogrammed for a run.
    pub fn arm_count(&self) -> usize { self.arm_count }

    pub fn enabled(&self) -> CounterMask { self.enabled }

    /// Events currently programmed on chained pairs, in slot order.
    pub fn armed_events(&self) -> Vec<PmuEvent> {
        self.types
            .chunks(2)
            .filter(|pair| pair[1].event() == PmuEvent::Chain.code())
            .filter_map(|pair| PmuEvent::try_from(pair[0].event()).ok())
            .collect()
    }

    fn event_value(&self, counter: usize) -> u32 {
        if self.ops_started == 0 {
            return 0;
        }
        match PmuEvent::try_from(self.types[counter].event()) {
            Ok(event) => (self.profile)(self.ops_started - 1, event),
            Err(_) => 0,
        }
    }
}

impl CounterBank for FakeCounterBank {
    fn set_event_type(&mut self, counter: usize, config: EventType) {
        if counter == 0 {
            self.ops_started = 0;
            self.arm_count += 1;
        }
        self.types[counter] = config;
    }

    fn enable(&mut self, mask: CounterMask) { self.enabled |= mask; }

    fn disable(&mut self, mask: CounterMask) { self.enabled &= !mask; }

    fn reset(&mut self, _mask: CounterMask) {
        if !self.enabled.is_empty() {
            self.ops_started += 1;
            trace!("fake pmu: op {} starts", self.ops_started - 1);
        }
    }

    fn read(&self, counter: usize) -> u32 {
        if self.types[counter].event() == PmuEvent::Chain.code() && counter > 0 {
            self.event_value(counter - 1) >> 16
        } else {
            self.event_value(counter) & 0xffff
        }
    }
}
