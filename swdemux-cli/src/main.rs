//! swdemux: demultiplex a transport stream or base-band frame capture into
//! JSON lines.

use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use parking_lot::Mutex;
use swdemux::{
    BbFeedHandle, BbFeedParams, BbIsi, BbMode, Demux, DmxStatus, FilterHandle, SectionFilter, SoftwareHooks,
    TsFeedHandle, TsFeedParams, TsType,
};

mod config;
mod logging;
mod output;

use config::{load_config, parse_isi, parse_pid, ConfigFile, PidSpec, SectionSpec};
use output::{Record, RecordSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InputFormat {
    /// 188-byte transport packets
    Ts,
    /// 204-byte transport packets with parity
    Ts204,
    /// Continuous DVB-S2 base-band frames
    Bb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BbModeArg {
    Frame,
    Continuous,
    Packetized,
    Transport,
}

impl From<BbModeArg> for BbMode {
    fn from(mode: BbModeArg) -> Self {
        match mode {
            BbModeArg::Frame => BbMode::Frame,
            BbModeArg::Continuous => BbMode::ContinuousGs,
            BbModeArg::Packetized => BbMode::PacketizedGs,
            BbModeArg::Transport => BbMode::Transport,
        }
    }
}

/// swdemux - software demultiplexer for MPEG-TS and DVB-S2 base-band streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input file ("-" or omitted for stdin)
    input: Option<PathBuf>,

    /// Input framing
    #[arg(short = 'F', long, value_enum, default_value = "ts")]
    format: InputFormat,

    /// Deliver raw packets of a PID (0x2000 for every PID)
    #[arg(short, long, value_parser = parse_pid)]
    pid: Vec<u16>,

    /// Deliver payloads instead of whole packets for --pid feeds
    #[arg(long)]
    payload_only: bool,

    /// Deliver sections of PID[:TABLE_ID]
    #[arg(short, long)]
    section: Vec<SectionSpec>,

    /// Drop sections whose CRC-32 does not verify
    #[arg(long)]
    check_crc: bool,

    /// Base-band input stream: sis, all or a stream number
    #[arg(long, value_parser = parse_isi)]
    bb_isi: Option<BbIsi>,

    /// Base-band delivery mode
    #[arg(long, value_enum, default_value = "frame")]
    bb_mode: BbModeArg,

    /// Re-inject transport packets carried in base-band frames
    #[arg(long)]
    ts_compat: bool,

    /// Check continuity counters
    #[arg(long)]
    ts_check: bool,

    /// Report the input rate periodically
    #[arg(long)]
    speed_check: bool,

    /// Write records to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Read size in bytes
    #[arg(long, default_value = "65536", value_parser = clap::value_parser!(u64).range(1..=16 * 1024 * 1024))]
    chunk_size: u64,

    /// Show a progress bar (file input only)
    #[arg(long)]
    progress: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored [default: logs]
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files [default: 7]
    #[arg(long)]
    log_retention_days: Option<u64>,
}

type SharedSink = Arc<Mutex<RecordSink>>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match load_config(path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };

    let (log_dir, log_retention_days) = log_settings(&args, &file_config);
    logging::init_logging(&log_dir, log_retention_days, args.verbose, file_config.logging.level.as_deref())?;

    let mut demux_config = file_config.demux.clone();
    demux_config.ts_check |= args.ts_check;
    demux_config.speed_check |= args.speed_check;

    let demux = Demux::with_hooks(demux_config, Arc::new(SoftwareHooks));

    let writer: Box<dyn io::Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let sink: SharedSink = Arc::new(Mutex::new(RecordSink::new(writer)));

    register_feeds(&demux, &args, &file_config, &sink)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .map_err(|e| format!("signal handler setup failed: {}", e))?;
    }

    let (mut reader, total): (Box<dyn Read>, Option<u64>) = match &args.input {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::open(path)?;
            let len = file.metadata().ok().map(|m| m.len());
            info!("Reading {}", path.display());
            (Box::new(file), len)
        }
        _ => (Box::new(io::stdin().lock()), None),
    };

    let progress = match (args.progress, total) {
        (true, Some(len)) => {
            let bar = ProgressBar::new(len);
            bar.set_style(
                ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})")?
                    .progress_chars("#>-"),
            );
            Some(bar)
        }
        _ => None,
    };

    let mut buf = vec![0u8; args.chunk_size as usize];
    let mut total_read = 0u64;
    while running.load(Ordering::SeqCst) {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Read failed: {}", e);
                return Err(e.into());
            }
        };

        match args.format {
            InputFormat::Ts => demux.swfilter(&buf[..n]),
            InputFormat::Ts204 => demux.swfilter_204(&buf[..n]),
            InputFormat::Bb => demux.swfilter_bb_stream(&buf[..n]),
        }

        total_read += n as u64;
        if let Some(bar) = &progress {
            bar.inc(n as u64);
        }
    }
    if !running.load(Ordering::SeqCst) {
        info!("Interrupted");
    }
    if let Some(bar) = &progress {
        bar.finish_and_clear();
    }

    let mut sink = sink.lock();
    sink.flush()?;
    info!("Read {} bytes, wrote {} records", total_read, sink.records());
    if sink.write_errors() > 0 {
        warn!("{} records could not be written", sink.write_errors());
    }
    demux.stats().print_report();

    Ok(())
}

/// Log directory and retention; the command line takes precedence over the
/// configuration file.
fn log_settings(args: &Args, file_config: &ConfigFile) -> (PathBuf, u64) {
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_deref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(7);
    (log_dir, retention_days)
}

/// Register and start every feed requested on the command line and in the
/// configuration file.
fn register_feeds(
    demux: &Demux,
    args: &Args,
    file_config: &ConfigFile,
    sink: &SharedSink,
) -> Result<(), Box<dyn std::error::Error>> {
    let pids = args
        .pid
        .iter()
        .map(|&pid| PidSpec {
            pid,
            payload_only: args.payload_only,
        })
        .chain(file_config.pids.iter().copied());
    for spec in pids {
        let out = sink.clone();
        let pid = spec.pid;
        let feed = demux.allocate_ts_feed(Box::new(move |data: &[u8], handle: TsFeedHandle, _: DmxStatus| {
            out.lock().emit(&Record::ts(handle.index(), pid, data));
        }))?;

        let mut ts_type = TsType::PACKET;
        if spec.payload_only {
            ts_type |= TsType::PAYLOAD_ONLY;
        }
        demux.set_ts_feed(feed, TsFeedParams::new(pid, ts_type))?;
        demux.start_filtering(feed)?;
        info!("PID feed 0x{:04X} started ({:?})", pid, ts_type);
    }

    let sections = args
        .section
        .iter()
        .map(|spec| SectionSpec {
            check_crc: args.check_crc,
            ..*spec
        })
        .chain(file_config.sections.iter().copied());
    for spec in sections {
        let out = sink.clone();
        let pid = spec.pid;
        let feed = demux.allocate_section_feed(Box::new(move |data: &[u8], filter: FilterHandle, _: DmxStatus| {
            out.lock().emit(&Record::section(filter.index(), pid, data));
        }))?;

        demux.set_section_feed(feed, pid, swdemux::MAX_SECTION_SIZE, spec.check_crc)?;
        let rule = spec.table_id.map_or_else(SectionFilter::any, SectionFilter::table_id);
        demux.allocate_filter(feed, rule)?;
        demux.start_filtering(feed)?;
        info!("Section feed 0x{:04X} started (table_id={:?})", pid, spec.table_id);
    }

    if let Some(isi) = args.bb_isi {
        let out = sink.clone();
        let label = format!("{:?}", isi);
        let feed = demux.allocate_bb_feed(Box::new(
            move |data: &[u8], upl: usize, handle: BbFeedHandle, _: DmxStatus| {
                out.lock().emit(&Record::base_band(handle.index(), label.clone(), upl, data));
            },
        ))?;

        let mode = BbMode::from(args.bb_mode);
        let buffer_size = if mode.is_packetized() { swdemux::BB_MAX_FRAME_LEN } else { 0 };
        demux.set_bb_feed(feed, BbFeedParams::new(isi, mode, buffer_size))?;
        demux.start_filtering(feed)?;
        info!("Base-band feed started ({:?}, {:?})", isi, mode);
    }

    if args.ts_compat {
        let isi = args.bb_isi.unwrap_or(BbIsi::Sis);
        if let Err(e) = demux.set_ts_compat(isi, true) {
            error!("Failed to enable TS compatibility mode: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
