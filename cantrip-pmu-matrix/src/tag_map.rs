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

// Maps operator tags to matrix rows. Rows are handed out in first-seen
// order and never reused while the map lives. Tags are static strings
// (operator names from the runtime's registration tables) so the first
// pass compares by address; duplicated literals fall back to a string
// compare.

use alloc::vec::Vec;

pub struct TagMap {
    entries: Vec<&'static str>,
    capacity: usize,
}

impl TagMap {
    pub fn new(capacity: usize) -> Self {
        TagMap {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| core::ptr::eq(*e, name))
            .or_else(|| self.entries.iter().position(|e| *e == name))
    }

    pub fn resolve(&mut self, name: &'static str) -> Option<usize> {
        if let Some(row) = self.find(name) {
            return Some(row);
        }
        if self.entries.len() >= self.capacity {
            return None;
        }
        self.entries.push(name);
        Some(self.entries.len() - 1)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize { self.entries.len() }
}
