//! File-backed trace log
//!
//! The engine's optional instruction-trace facility writes one line per
//! instruction here. The log is line-buffered so a crashed guest still
//! leaves a usable tail.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::Path;

#[derive(Debug)]
pub struct TraceLog {
    writer: LineWriter<File>,
}

impl TraceLog {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            writer: LineWriter::new(File::create(path)?),
        })
    }

    pub fn line(&mut self, text: &str) {
        // a failed trace write must not take the engine down
        let _ = writeln!(self.writer, "{text}");
    }
}
