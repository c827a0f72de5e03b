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

//! Statistics payloads returned by Fetch.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// Session statistics. |runtime_stats| is whatever the runtime's
/// post-invoke hook exposed (empty when there is none).
#[derive(Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ValidationStats<'a> {
    pub arena_used_bytes: u32,
    pub invocations: u32,
    /// Rows (operators) available for per-layer streaming; 0 if no
    /// characterization pass has run.
    pub pmu_layers: u32,
    pub pmu_events: u32,
    pub events_per_run: u32,
    /// Event codes, in matrix column order.
    pub event_ids: Vec<u16>,
    pub runtime_stats: &'a [u8],
}

/// One operator's row of the counter matrix.
#[derive(Debug, Serialize)]
pub struct PmuRow<'a> {
    pub layer: u32,
    pub counters: &'a [u32],
}

/// Host-side (owning) decode of a PmuRow.
#[derive(Debug, Eq, PartialEq, Deserialize)]
pub struct PmuRowBuf {
    pub layer: u32,
    pub counters: Vec<u32>,
}
