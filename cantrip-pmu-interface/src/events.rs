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

//! ARMv8.1-M PMU event numbers (architectural, micro-architectural and MVE).

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[repr(u16)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum PmuEvent {
    SwIncr = 0x0000,
    L1iCacheRefill = 0x0001,
    L1dCacheRefill = 0x0003,
    L1dCache = 0x0004,
    LdRetired = 0x0006,
    StRetired = 0x0007,
    InstRetired = 0x0008,
    ExcTaken = 0x0009,
    ExcReturn = 0x000A,
    PcWriteRetired = 0x000C,
    BrImmedRetired = 0x000D,
    BrReturnRetired = 0x000E,
    UnalignedLdstRetired = 0x000F,
    BrMisPred = 0x0010,
    CpuCycles = 0x0011,
    BrPred = 0x0012,
    MemAccess = 0x0013,
    L1iCache = 0x0014,
    L1dCacheWb = 0x0015,
    BusAccess = 0x0019,
    MemoryError = 0x001A,
    BusCycles = 0x001D,
    Chain = 0x001E,
    BrRetired = 0x0021,
    BrMisPredRetired = 0x0022,
    StallFrontend = 0x0023,
    StallBackend = 0x0024,
    LlCacheRd = 0x0036,
    LlCacheMissRd = 0x0037,
    L1dCacheMissRd = 0x0039,
    Stall = 0x003C,
    L1dCacheRd = 0x0040,
    LeRetired = 0x0100,
    LeCancel = 0x0108,
    SeCallS = 0x0114,
    SeCallNs = 0x0115,
    MveInstRetired = 0x0200,
    MveFpRetired = 0x0204,
    MveFpHpRetired = 0x0208,
    MveFpSpRetired = 0x020C,
    MveFpMacRetired = 0x0214,
    MveIntRetired = 0x0224,
    MveIntMacRetired = 0x0228,
    MveLdstRetired = 0x0238,
    MveLdRetired = 0x023C,
    MveStRetired = 0x0240,
    MveLdstContigRetired = 0x0244,
    MveVreduceRetired = 0x025C,
    MveStall = 0x02CC,
    MveStallResource = 0x02CD,
    MveStallBreak = 0x02D3,
    MveStallDependency = 0x02D4,
}

impl PmuEvent {
    pub fn code(self) -> u16 { self.into() }
}

/// Events sampled during a characterization pass, in matrix column order.
/// SW_INCR and CHAIN carry no workload information and are excluded.
pub const CHARACTERIZATION_EVENTS: &[PmuEvent] = &[
    PmuEvent::CpuCycles,
    PmuEvent::InstRetired,
    PmuEvent::LdRetired,
    PmuEvent::StRetired,
    PmuEvent::MemAccess,
    PmuEvent::BusAccess,
    PmuEvent::BusCycles,
    PmuEvent::Stall,
    PmuEvent::StallFrontend,
    PmuEvent::StallBackend,
    PmuEvent::L1iCache,
    PmuEvent::L1iCacheRefill,
    PmuEvent::L1dCache,
    PmuEvent::L1dCacheRefill,
    PmuEvent::L1dCacheRd,
    PmuEvent::L1dCacheMissRd,
    PmuEvent::L1dCacheWb,
    PmuEvent::LlCacheRd,
    PmuEvent::LlCacheMissRd,
    PmuEvent::ExcTaken,
    PmuEvent::ExcReturn,
    PmuEvent::PcWriteRetired,
    PmuEvent::BrImmedRetired,
    PmuEvent::BrReturnRetired,
    PmuEvent::BrRetired,
    PmuEvent::BrPred,
    PmuEvent::BrMisPred,
    PmuEvent::BrMisPredRetired,
    PmuEvent::UnalignedLdstRetired,
    PmuEvent::MemoryError,
    PmuEvent::LeRetired,
    PmuEvent::LeCancel,
    PmuEvent::SeCallS,
    PmuEvent::SeCallNs,
    PmuEvent::MveInstRetired,
    PmuEvent::MveFpRetired,
    PmuEvent::MveFpHpRetired,
    PmuEvent::MveFpSpRetired,
    PmuEvent::MveFpMacRetired,
    PmuEvent::MveIntRetired,
    PmuEvent::MveIntMacRetired,
    PmuEvent::MveLdstRetired,
    PmuEvent::MveLdRetired,
    PmuEvent::MveStRetired,
    PmuEvent::MveLdstContigRetired,
    PmuEvent::MveVreduceRetired,
    PmuEvent::MveStall,
    PmuEvent::MveStallResource,
    PmuEvent::MveStallBreak,
    PmuEvent::MveStallDependency,
];
