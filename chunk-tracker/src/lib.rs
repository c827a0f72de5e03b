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

//! Progress tracking for a single payload moved across a transport with a
//! fixed maximum unit size.
//!
//! The tracker never touches payload bytes; callers use it to size each
//! copy. Misuse (next/advance while inactive, advancing past the end) is
//! treated as a saturating no-op rather than a fault since the tracker sits
//! on request paths driven by a remote host.

#![cfg_attr(not(test), no_std)]

#[derive(Debug, Default, Eq, PartialEq)]
pub struct ChunkTracker {
    total: usize,
    progressed: usize,
    max_unit: usize,
    active: bool,
}

impl ChunkTracker {
    pub const fn new() -> ChunkTracker {
        Self {
            total: 0,
            progressed: 0,
            max_unit: 0,
            active: false,
        }
    }

    /// Starts tracking a transfer of |total| bytes moved in pieces of at
    /// most |max_unit| bytes.
    ///
    /// Returns false (and leaves the in-flight transfer untouched) if a
    /// transfer is already active or |max_unit| is zero. A zero-length
    /// transfer completes immediately and never becomes active.
    #[must_use]
    pub fn begin(&mut self, total: usize, max_unit: usize) -> bool {
        if self.active || max_unit == 0 {
            return false;
        }
        self.total = total;
        self.progressed = 0;
        self.max_unit = max_unit;
        self.active = total != 0;
        true
    }

    /// Returns the size of the next piece; 0 if no transfer is active.
    pub fn next(&self) -> usize {
        if !self.active {
            return 0;
        }
        core::cmp::min(self.max_unit, self.total - self.progressed)
    }

    /// Records |n| bytes as transferred. Clamped to the bytes remaining;
    /// ignored when inactive.
    pub fn advance(&mut self, n: usize) {
        if !self.active {
            return;
        }
        self.progressed += core::cmp::min(n, self.total - self.progressed);
        if self.progressed == self.total {
            self.active = false;
        }
    }

    /// Returns true once every byte of the transfer has been accounted for.
    pub fn done(&self) -> bool { self.progressed == self.total }

    pub fn is_active(&self) -> bool { self.active }

    /// Bytes transferred so far; doubles as the offset of the next piece.
    pub fn progressed(&self) -> usize { self.progressed }

    pub fn total(&self) -> usize { self.total }

    /// Abandons any in-flight transfer.
    pub fn reset(&mut self) { *self = ChunkTracker::new(); }
}
