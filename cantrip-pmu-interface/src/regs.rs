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

//! PMU register layouts.

use crate::PmuEvent;
use crate::COUNTERS_PER_BANK;
use modular_bitfield::prelude::*;

/// PMU_EVTYPERn: selects the event counted by counter n.
#[bitfield]
#[derive(Clone, Copy, Debug)]
pub struct EventType {
    pub event: B16,
    #[skip]
    _unused: B16,
}

impl EventType {
    pub fn for_event(event: PmuEvent) -> Self { EventType::new().with_event(event.code()) }

    /// Register word as written to hardware.
    pub fn raw(&self) -> u32 { u32::from_le_bytes(self.into_bytes()) }

    pub fn from_raw(word: u32) -> Self { EventType::from_bytes(word.to_le_bytes()) }
}

bitflags::bitflags! {
    /// PMU_CNTENSET / PMU_CNTENCLR / reset bit layout for event counters.
    pub struct CounterMask: u32 {
        const C0 = 1 << 0;
        const C1 = 1 << 1;
        const C2 = 1 << 2;
        const C3 = 1 << 3;
        const C4 = 1 << 4;
        const C5 = 1 << 5;
        const C6 = 1 << 6;
        const C7 = 1 << 7;
    }
}

impl CounterMask {
    /// Mask for the chained pair backing event |slot|.
    pub fn pair(slot: usize) -> CounterMask {
        if 2 * slot + 1 >= COUNTERS_PER_BANK {
            return CounterMask::empty();
        }
        CounterMask::from_bits_truncate(0b11 << (2 * slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_hex::assert_eq_hex;

    #[test]
    fn event_type_layout() {
        let config = EventType::for_event(PmuEvent::MveIntMacRetired);
        assert_eq_hex!(config.raw(), 0x0228);
        assert_eq!(EventType::from_raw(0xdead_0011).event(), 0x0011);
    }

    #[test]
    fn pair_masks() {
        assert_eq_hex!(CounterMask::pair(0).bits(), 0x03);
        assert_eq_hex!(CounterMask::pair(3).bits(), 0xc0);
        assert!(CounterMask::pair(4).is_empty());
    }
}
