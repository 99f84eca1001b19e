//! Configuration file and feed specifications.

use std::path::Path;
use std::str::FromStr;

use clap_num::maybe_hex;
use serde::Deserialize;
use swdemux::{BbIsi, DemuxConfig, MAX_PID, PID_WILDCARD};

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConfigFile {
    pub demux: DemuxConfig,
    pub logging: LoggingSection,
    #[serde(rename = "section")]
    pub sections: Vec<SectionSpec>,
    #[serde(rename = "pid")]
    pub pids: Vec<PidSpec>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// A raw PID feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PidSpec {
    pub pid: u16,
    #[serde(default)]
    pub payload_only: bool,
}

/// A section feed: PID plus an optional table id filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SectionSpec {
    pub pid: u16,
    #[serde(default)]
    pub table_id: Option<u8>,
    #[serde(default)]
    pub check_crc: bool,
}

impl FromStr for SectionSpec {
    type Err = String;

    /// `PID[:TABLE_ID]`, both decimal or `0x` hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pid, table_id) = match s.split_once(':') {
            Some((pid, table_id)) => (pid, Some(maybe_hex::<u8>(table_id)?)),
            None => (s, None),
        };
        let pid = maybe_hex::<u16>(pid)?;
        if pid > MAX_PID {
            return Err(format!("section PID 0x{:X} out of range", pid));
        }
        Ok(Self {
            pid,
            table_id,
            check_crc: false,
        })
    }
}

/// Parse a raw feed PID. `0x2000` selects every PID.
pub fn parse_pid(s: &str) -> Result<u16, String> {
    let pid = maybe_hex::<u16>(s)?;
    if pid > PID_WILDCARD {
        return Err(format!("PID 0x{:X} out of range", pid));
    }
    Ok(pid)
}

/// Parse an input stream selector: `sis`, `all` or a stream number.
pub fn parse_isi(s: &str) -> Result<BbIsi, String> {
    match s.to_ascii_lowercase().as_str() {
        "sis" => Ok(BbIsi::Sis),
        "all" => Ok(BbIsi::All),
        other => maybe_hex::<u8>(other).map(BbIsi::Stream),
    }
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}
