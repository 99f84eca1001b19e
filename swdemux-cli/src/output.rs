//! JSON-lines delivery records.

use std::fmt::Write as _;
use std::io::{self, Write};

use log::warn;
use serde::Serialize;

/// One delivery from the demux.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// Packet or payload from a TS feed.
    Ts { feed: usize, pid: u16, len: usize, data: String },
    /// Section that passed a filter.
    Section {
        filter: usize,
        pid: u16,
        table_id: u8,
        len: usize,
        data: String,
    },
    /// Frame, data field or user packet buffer from a base-band feed.
    BaseBand {
        feed: usize,
        isi: String,
        upl: usize,
        len: usize,
        data: String,
    },
}

impl Record {
    pub fn ts(feed: usize, pid: u16, data: &[u8]) -> Self {
        Record::Ts {
            feed,
            pid,
            len: data.len(),
            data: to_hex(data),
        }
    }

    pub fn section(filter: usize, pid: u16, data: &[u8]) -> Self {
        Record::Section {
            filter,
            pid,
            table_id: data.first().copied().unwrap_or_default(),
            len: data.len(),
            data: to_hex(data),
        }
    }

    pub fn base_band(feed: usize, isi: String, upl: usize, data: &[u8]) -> Self {
        Record::BaseBand {
            feed,
            isi,
            upl,
            len: data.len(),
            data: to_hex(data),
        }
    }
}

fn to_hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Record writer shared by all feed callbacks.
pub struct RecordSink {
    writer: Box<dyn Write + Send>,
    records: u64,
    write_errors: u64,
}

impl RecordSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            records: 0,
            write_errors: 0,
        }
    }

    /// Write one record. Failures are counted; the first one is logged.
    pub fn emit(&mut self, record: &Record) {
        let result = serde_json::to_writer(&mut self.writer, record)
            .map_err(io::Error::from)
            .and_then(|()| self.writer.write_all(b"\n"));
        match result {
            Ok(()) => self.records += 1,
            Err(e) => {
                self.write_errors += 1;
                if self.write_errors == 1 {
                    warn!("Failed to write record: {}", e);
                }
            }
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }
}
