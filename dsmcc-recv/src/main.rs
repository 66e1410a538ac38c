//! dsmcc-recv: DSM-CC carousel receiver.
//!
//! Reads an MPEG transport stream from a file or stdin and writes the
//! carousel found on one PID to a directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

mod bridge;
mod config;
mod demux;
mod logging;

use bridge::{ReportingListener, SoftwareDvb};
use config::{find_config, load_config, parse_number, parse_pid, ConfigFile};
use demux::Demux;
use dsmcc_carousel::{CarouselStatus, Engine, EngineConfig, TS_PACKET_SIZE};
use dsmcc_protocol::TRANSACTION_ID_ANY;

/// Packets read per chunk.
const READ_PACKETS: usize = 512;

/// dsmcc-recv - DSM-CC object/data carousel receiver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Transport stream file (stdin when omitted or "-")
    input: Option<PathBuf>,

    /// PID carrying the carousel DSI (decimal or 0x-prefixed)
    #[arg(short, long, value_parser = parse_pid)]
    pid: Option<u16>,

    /// Transaction id of the wanted DSI (any when omitted)
    #[arg(short, long, value_parser = parse_number)]
    transaction_id: Option<u32>,

    /// Only follow this program's PMT for association tags
    #[arg(long, value_parser = parse_number)]
    program: Option<u32>,

    /// Directory the carousel is written to
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Engine cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Keep downloaded modules across runs
    #[arg(long)]
    keep_cache: bool,

    /// Stop reading once the carousel is complete
    #[arg(long)]
    exit_on_done: bool,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let file_config = match find_config(args.config.clone()) {
        Some(path) => match load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let log_level = if args.verbose {
        None
    } else {
        file_config.logging.level.as_deref()
    };
    logging::init_logging(&log_dir, log_retention_days, args.verbose, log_level)?;

    let mut engine_config = file_config.engine.unwrap_or_else(EngineConfig::default);
    if let Some(cache_dir) = args.cache_dir {
        engine_config.cache_dir = cache_dir;
    }
    engine_config.keep_cache |= args.keep_cache;
    let max_section_size = engine_config.max_section_size;

    let pid = args
        .pid
        .or(file_config.carousel.pid)
        .ok_or("No carousel PID given (--pid or [carousel] pid)")?;
    let transaction_id = args
        .transaction_id
        .or(file_config.carousel.transaction_id)
        .unwrap_or(TRANSACTION_ID_ANY);
    let program = match args.program {
        Some(p) => Some(u16::try_from(p).map_err(|_| format!("Program {} out of range", p))?),
        None => file_config.carousel.program,
    };
    let output = args
        .output
        .or_else(|| file_config.carousel.output.map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(format!("carousel-{:04x}", pid)));

    let dvb = Arc::new(SoftwareDvb::new());
    let engine = match Engine::open(engine_config, dvb.clone()) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to open carousel engine: {}", e);
            return Err(e.into());
        }
    };
    let (listener, mut status) = ReportingListener::new();
    let listener = Arc::new(listener);
    let subscription = engine.queue_carousel(pid, transaction_id, output.clone(), listener.clone())?;
    info!(
        "Receiving PID 0x{:04X} (transaction 0x{:08X}) into {:?} as {}",
        pid, transaction_id, output, subscription
    );

    let mut reader: Box<dyn AsyncRead + Unpin> = match &args.input {
        Some(path) if path.as_os_str() != "-" => {
            info!("Reading {:?}", path);
            Box::new(tokio::fs::File::open(path).await?)
        }
        _ => {
            info!("Reading stdin");
            Box::new(tokio::io::stdin())
        }
    };

    let mut demux = Demux::new(max_section_size, dvb, program);
    let mut buf = vec![0u8; TS_PACKET_SIZE * READ_PACKETS];
    let mut sections = 0u64;
    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }

            _ = status.changed(), if args.exit_on_done => {
                if *status.borrow() == CarouselStatus::Done {
                    info!("Carousel complete");
                    break;
                }
            }

            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    info!("End of input");
                    break;
                }
                for (section_pid, section) in demux.push(&buf[..n]) {
                    engine.add_section(section_pid, section)?;
                    sections += 1;
                }
            }
        }
    }

    engine.dequeue_carousel(subscription)?;
    engine.close().await?;

    let final_status = *status.borrow();
    info!(
        "{} packets, {} sections, {} files written, carousel {}",
        demux.packets(),
        sections,
        listener.files(),
        final_status
    );
    if final_status != CarouselStatus::Done {
        warn!("Carousel incomplete");
    }
    Ok(())
}
