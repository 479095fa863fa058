use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn, LevelFilter};
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use homelog::storage::commit_log::FrameReader;
use homelog::{BincodeCodec, Codec, Config, Log, Record};

#[derive(Subcommand)]
enum CMD {
    /// Append every value as one record
    APPEND { values: Vec<String> },
    /// Print the record at an offset
    READ { offset: u64 },
    /// Print the lowest and highest offsets
    RANGE,
    /// Remove segments lying entirely below an offset
    TRUNCATE { lowest: u64 },
    /// Write the raw framed store bytes
    EXPORT {
        #[clap(short, long)]
        out: Option<PathBuf>,
    },
    /// Decode every record from the raw store bytes
    SCAN,
    /// Follow the log, printing records as they arrive
    TAIL {
        #[clap(long)]
        from: Option<u64>,
        #[clap(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Print segment and offset statistics
    STATS,
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Log directory
    #[clap(short, long)]
    dir: PathBuf,

    /// Config file, overridden by HOMELOG_* env vars and the flags below
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(long)]
    max_store_bytes: Option<u64>,

    #[clap(long)]
    max_index_bytes: Option<u64>,

    #[clap(long)]
    initial_offset: Option<u64>,

    /// More logging, repeat for more
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: CMD,
}

impl Args {
    fn config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(Some(path.as_path()))
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load(None).context("Failed to load config from environment")?,
        };
        if let Some(max_store_bytes) = self.max_store_bytes {
            config.segment.max_store_bytes = max_store_bytes;
        }
        if let Some(max_index_bytes) = self.max_index_bytes {
            config.segment.max_index_bytes = max_index_bytes;
        }
        if let Some(initial_offset) = self.initial_offset {
            config.segment.initial_offset = initial_offset;
        }
        Ok(config)
    }
}

fn print_record(record: &Record) {
    println!(
        "offset={}, value={}",
        record.offset,
        String::from_utf8_lossy(&record.value)
    );
}

async fn tail(commit_log: &Log, from: Option<u64>, interval: Duration) -> anyhow::Result<()> {
    let mut next = match from {
        Some(off) => off,
        None => commit_log.lowest_offset()?,
    };
    loop {
        match commit_log.read(next) {
            Ok(record) => {
                print_record(&record);
                next += 1;
                continue;
            }
            Err(err) if err.is_out_of_range() => {
                // Truncated away underneath us.
                let lowest = commit_log.lowest_offset()?;
                if next < lowest {
                    warn!("offset {} no longer retained, skipping to {}", next, lowest);
                    next = lowest;
                    continue;
                }
            }
            Err(err) => return Err(err.into()),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn run(commit_log: &Log, cmd: CMD) -> anyhow::Result<()> {
    match cmd {
        CMD::APPEND { values } => {
            if values.is_empty() {
                bail!("append needs at least one value");
            }
            for value in values {
                let off = commit_log.append(Record::new(value))?;
                println!("offset={}", off);
            }
        }
        CMD::READ { offset } => {
            let record = commit_log.read(offset)?;
            print_record(&record);
        }
        CMD::RANGE => {
            println!(
                "lowest={}, highest={}",
                commit_log.lowest_offset()?,
                commit_log.highest_offset()?
            );
        }
        CMD::TRUNCATE { lowest } => {
            commit_log.truncate(lowest)?;
            println!("lowest={}", commit_log.lowest_offset()?);
        }
        CMD::EXPORT { out } => {
            let mut reader = commit_log.reader()?;
            let written = match out {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("Failed to create {}", path.display()))?;
                    let n = io::copy(&mut reader, &mut file)?;
                    file.sync_all()?;
                    n
                }
                None => {
                    let stdout = io::stdout();
                    let mut handle = stdout.lock();
                    let n = io::copy(&mut reader, &mut handle)?;
                    handle.flush()?;
                    n
                }
            };
            info!("exported {} bytes", written);
        }
        CMD::SCAN => {
            let codec = BincodeCodec::new();
            for frame in FrameReader::new(commit_log.reader()?) {
                print_record(&codec.decode(&frame?)?);
            }
        }
        CMD::TAIL { from, interval_ms } => {
            tail(commit_log, from, Duration::from_millis(interval_ms)).await?;
        }
        CMD::STATS => {
            let stats = commit_log.stats()?;
            println!("Stats: {:?}", stats);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let config = args.config()?;
    std::fs::create_dir_all(&args.dir)
        .with_context(|| format!("Failed to create {}", args.dir.display()))?;
    let commit_log = Log::new(&args.dir, config)
        .with_context(|| format!("Failed to open log in {}", args.dir.display()))?;

    let result = run(&commit_log, args.cmd).await;
    commit_log.close().context("Failed to close log")?;
    result
}
