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

//! Interface to a hardware performance-counter bank.
//!
//! The bank exposes COUNTERS_PER_BANK 16-bit event counters. Adjacent
//! counters may be chained (odd counter programmed with CHAIN) to form a
//! 32-bit counter; every sampled event uses such a pair so at most
//! EVENTS_PER_RUN events are live at once.

#![cfg_attr(not(test), no_std)]

mod events;
mod regs;

pub use events::{PmuEvent, CHARACTERIZATION_EVENTS};
pub use regs::{CounterMask, EventType};

use log::trace;
use static_assertions::const_assert;

/// Number of hardware event counters.
pub const COUNTERS_PER_BANK: usize = 8;

/// Number of 32-bit (chained) events sampled per workload run.
pub const EVENTS_PER_RUN: usize = COUNTERS_PER_BANK / 2;

/// Upper bound on events a characterization pass may sample.
pub const MAX_EVENTS: usize = CHARACTERIZATION_EVENTS.len();

const_assert!(COUNTERS_PER_BANK % 2 == 0);
const_assert!(COUNTERS_PER_BANK <= 31);

/// Low-level counter-bank primitives. Implementations talk to the PMU
/// registers (or a fake in tests).
pub trait CounterBank {
    /// Programs |counter| to count the event in |config|.
    fn set_event_type(&mut self, counter: usize, config: EventType);
    /// Starts counting on the counters in |mask|.
    fn enable(&mut self, mask: CounterMask);
    /// Stops counting on the counters in |mask|; values are retained.
    fn disable(&mut self, mask: CounterMask);
    /// Zeroes the counters in |mask|.
    fn reset(&mut self, mask: CounterMask);
    /// Returns the raw (16-bit) value of |counter|.
    fn read(&self, counter: usize) -> u32;
}

/// Programs the bank to sample |events| (at most EVENTS_PER_RUN) using
/// chained counter pairs. Unused pairs are disabled. Returns the mask of
/// counters in use.
pub fn arm_events<B: CounterBank + ?Sized>(bank: &mut B, events: &[PmuEvent]) -> CounterMask {
    let mut in_use = CounterMask::empty();
    bank.disable(CounterMask::all());
    for slot in 0..EVENTS_PER_RUN {
        match events.get(slot) {
            Some(event) => {
                trace!("arm slot {} -> {:?}", slot, event);
                bank.set_event_type(2 * slot, EventType::for_event(*event));
                bank.set_event_type(2 * slot + 1, EventType::for_event(PmuEvent::Chain));
                in_use |= CounterMask::pair(slot);
            }
            None => {
                bank.set_event_type(2 * slot, EventType::new());
                bank.set_event_type(2 * slot + 1, EventType::new());
            }
        }
    }
    bank.reset(CounterMask::all());
    in_use
}

/// Reads the chained pairs armed by arm_events into |values|; slots beyond
/// |values.len()| are ignored.
pub fn read_events<B: CounterBank + ?Sized>(bank: &B, values: &mut [u32]) {
    for (slot, value) in values.iter_mut().take(EVENTS_PER_RUN).enumerate() {
        let low = bank.read(2 * slot) & 0xffff;
        let high = bank.read(2 * slot + 1) & 0xffff;
        *value = low | (high << 16);
    }
}
