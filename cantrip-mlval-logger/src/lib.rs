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

//! log::Log backend for the validation firmware. Records are formatted as
//! "<target>::<msg>" into a fixed buffer and handed to a LogSink (UART,
//! debug console, ...).

#![cfg_attr(not(test), no_std)]

use arrayvec::ArrayString;
use core::fmt::{self, Write};
use log::{Level, Metadata, Record};

/// Max bytes of a formatted log line.
pub const MAX_MSG_LEN: usize = 256;

const OVERFLOW_MARK: &str = "...";

/// Destination for formatted log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, line: &str);
}

pub struct ValidatorLogger<S> {
    sink: S,
}

impl<S: LogSink> ValidatorLogger<S> {
    pub const fn new(sink: S) -> Self { ValidatorLogger { sink } }

    pub fn sink(&self) -> &S { &self.sink }
}

// Appends whole characters until the line is full.
struct LineWriter<'a> {
    line: &'a mut ArrayString<MAX_MSG_LEN>,
}

impl fmt::Write for LineWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            self.line.try_push(c).or(Err(fmt::Error))?;
        }
        Ok(())
    }
}

/// Formats |record| the way ValidatorLogger hands it to the sink.
pub fn format_record(record: &Record) -> ArrayString<MAX_MSG_LEN> {
    let mut line = ArrayString::new();
    let mut writer = LineWriter { line: &mut line };
    if write!(&mut writer, "{}::{}", record.target(), record.args()).is_err() {
        // Too big, indicate overflow with a trailing "...".
        while line.len() > MAX_MSG_LEN - OVERFLOW_MARK.len() {
            line.pop();
        }
        let _ = line.try_push_str(OVERFLOW_MARK);
    }
    line
}

impl<S: LogSink> log::Log for ValidatorLogger<S> {
    // Filtering is done with log::set_max_level.
    fn enabled(&self, _metadata: &Metadata) -> bool { true }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.sink.write(record.level(), &format_record(record));
        }
    }

    fn flush(&self) {}
}
