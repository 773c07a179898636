use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reiserpack::{
    Bitmap, ImageDevice, PackOptions, Packer, StreamUnpacker, Superblock, UnpackOptions,
};
use serde::Serialize;
use std::env::VarError;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// First four bytes of every zstd frame.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

// ── Logging ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    const ENV_KEY: &'static str = "REISERPACK_LOG_FORMAT";

    fn from_env() -> Result<Option<Self>> {
        match std::env::var(Self::ENV_KEY) {
            Ok(value) => <Self as ValueEnum>::from_str(value.trim(), true)
                .map(Some)
                .map_err(|_| anyhow::anyhow!("invalid {}={value:?}; expected human or json", Self::ENV_KEY)),
            Err(VarError::NotPresent) => Ok(None),
            Err(VarError::NotUnicode(_)) => bail!("{} contains non-UTF-8 bytes", Self::ENV_KEY),
        }
    }
}

fn init_logging(format_override: Option<LogFormat>) -> Result<()> {
    let format = format_override.or(LogFormat::from_env()?).unwrap_or(LogFormat::Human);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // logs go to stderr so a stream written to stdout stays clean
    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    }
    .map_err(|err| anyhow::anyhow!("failed to initialise logging: {err}"))
}

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "reiserpack", about = "Capture and replay reiserfs metadata")]
struct Cli {
    /// Log format; defaults to $REISERPACK_LOG_FORMAT, then human
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack the metadata of a reiserfs device or image into a stream
    Pack {
        device: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Device holding a journal that is not on DEVICE
        #[arg(short, long)]
        journal: Option<PathBuf>,
        /// Pack even though the separate journal device is not given
        #[arg(long)]
        allow_missing_journal: bool,
        /// Blocks to consider (saved bitmap); default is every block
        #[arg(short, long)]
        blocks: Option<PathBuf>,
        /// Send unclassifiable blocks whole instead of leaving them out
        #[arg(long)]
        pack_unknown: bool,
        /// Append the bitmap of blocks referenced by extent items
        #[arg(long)]
        unformatted_bitmap: bool,
        /// Refuse leaves whose extents point past the end of the filesystem
        #[arg(long)]
        check_ranges: bool,
        /// Compress the stream with zstd at this level
        #[arg(short = 'z', long = "zstd", value_name = "LEVEL")]
        zstd_level: Option<i32>,
        /// Write the pass statistics as JSON
        #[arg(long)]
        stats_json: Option<PathBuf>,
    },
    /// Replay a stream onto a device or image
    Unpack {
        input: PathBuf,
        device: PathBuf,
        /// Destination for a journal packed from a separate device
        #[arg(short, long)]
        journal: Option<PathBuf>,
        /// Save the bitmap of restored blocks here
        #[arg(long)]
        bitmap_out: Option<PathBuf>,
        /// Skip the check that DEVICE is not mounted
        #[arg(short, long)]
        force: bool,
        #[arg(long)]
        stats_json: Option<PathBuf>,
    },
    /// Show superblock geometry
    Info {
        device: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack {
            device, output, journal, allow_missing_journal, blocks,
            pack_unknown, unformatted_bitmap, check_ranges, zstd_level, stats_json,
        } => {
            let opts = PackOptions {
                pack_unknown,
                allow_missing_journal,
                emit_unformatted_bitmap: unformatted_bitmap,
                check_ranges,
                journal_name: journal.as_ref().map(|p| p.display().to_string()),
            };
            let mut dev = ImageDevice::new(
                File::open(&device).with_context(|| format!("opening {}", device.display()))?,
            );
            let mut jdev = match &journal {
                Some(p) => Some(ImageDevice::new(
                    File::open(p).with_context(|| format!("opening journal {}", p.display()))?,
                )),
                None => None,
            };
            let out = BufWriter::new(
                File::create(&output).with_context(|| format!("creating {}", output.display()))?,
            );

            let stats = match zstd_level {
                Some(level) => {
                    let enc = zstd::stream::write::Encoder::new(out, level)?;
                    let (stats, enc) = run_pack(&mut dev, jdev.as_mut(), enc, opts, blocks.as_deref())?;
                    enc.finish()?.flush()?;
                    stats
                }
                None => run_pack(&mut dev, jdev.as_mut(), out, opts, blocks.as_deref())?.0,
            };
            println!("{}", stats.summary());
            write_stats(stats_json.as_deref(), &stats)?;
        }

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, device, journal, bitmap_out, force, stats_json } => {
            if !force {
                ensure_not_mounted(&device)?;
            }
            let stream = open_stream(&input)?;
            let mut dev = ImageDevice::new(open_target(&device)?);
            let mut jdev = match &journal {
                Some(p) => Some(ImageDevice::new(open_target(p)?)),
                None => None,
            };

            let mut unpacker = StreamUnpacker::new(stream, &mut dev, UnpackOptions { bitmap_out });
            if let Some(j) = jdev.as_mut() {
                unpacker = unpacker.with_journal(j);
            }
            let report = unpacker.run().with_context(|| format!("replaying {}", input.display()))?;
            println!("{}", report.stats.summary());
            write_stats(stats_json.as_deref(), &report.stats)?;
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { device } => {
            let mut dev = ImageDevice::new(File::open(&device)?);
            let sb = Superblock::read(&mut dev)
                .with_context(|| format!("reading superblock of {}", device.display()))?;

            println!("── reiserfs ─────────────────────────────────────────────");
            println!("  Path           {}", device.display());
            println!("  Magic          {}", sb.magic_str());
            println!("  Block size     {}", sb.block_size);
            println!("  Blocks         {} ({} free)", sb.block_count, sb.free_blocks);
            println!("  Superblock at  block {}", sb.location);
            println!("  Root           block {} (height {})", sb.root_block, sb.tree_height);
            println!("  Bitmaps        {} ({})", sb.bitmap_count(),
                     if sb.spread_bitmaps() { "spread" } else { "contiguous" });
            println!("  Hash           {}", sb.hash().map_or("unknown", |h| h.name()));
            if let Some(uuid) = sb.uuid {
                println!("  UUID           {uuid}");
            }
            if let Some(label) = &sb.label {
                println!("  Label          {label}");
            }
            let j = sb.journal_blocks();
            println!("  Journal        blocks {}..={}{}", j.start(), j.end(),
                     if sb.journal_on_separate_device() {
                         format!(" on device {:#x}", sb.journal.dev)
                     } else {
                         String::new()
                     });
        }
    }
    Ok(())
}

fn run_pack<W: Write>(
    dev:     &mut ImageDevice<File>,
    journal: Option<&mut ImageDevice<File>>,
    out:     W,
    opts:    PackOptions,
    blocks:  Option<&Path>,
) -> Result<(reiserpack::PackStats, W)> {
    let mut packer = Packer::new(dev, out, opts)?;
    if let Some(j) = journal {
        packer = packer.with_journal(j);
    }
    let total = packer.superblock.block_count;
    let to_pack = match blocks {
        Some(p) => {
            let bm = Bitmap::load(BufReader::new(File::open(p)?))
                .with_context(|| format!("loading block bitmap {}", p.display()))?;
            if bm.len() != total {
                warn!(bitmap = bm.len(), filesystem = total, "block bitmap size differs from filesystem");
            }
            bm
        }
        None => Bitmap::full(total),
    };

    let mut last_tenth = 0;
    packer = packer.with_progress(move |done, all| {
        let tenth = if all == 0 { 10 } else { done * 10 / all };
        if tenth > last_tenth {
            last_tenth = tenth;
            info!(done, total = all, "{}%", tenth * 10);
        }
    });
    Ok(packer.pack(to_pack)?)
}

/// Open a stream, decompressing it when it starts with a zstd frame.
fn open_stream(path: &Path) -> Result<Box<dyn Read>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    let head = reader.fill_buf()?;
    if head.starts_with(&ZSTD_MAGIC) {
        info!("stream is zstd-compressed");
        return Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?));
    }
    Ok(Box::new(reader))
}

fn open_target(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} for writing", path.display()))
}

/// Refuse to write to a device listed in /proc/mounts.
fn ensure_not_mounted(device: &Path) -> Result<()> {
    let Ok(mounts) = std::fs::read_to_string("/proc/mounts") else {
        return Ok(());
    };
    let target = device.canonicalize().unwrap_or_else(|_| device.to_path_buf());
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mountpoint)) = (fields.next(), fields.next()) else { continue };
        let source = Path::new(source);
        if source.canonicalize().map_or(source == target, |s| s == target) {
            bail!("{} is mounted on {mountpoint}; unmount it or pass --force", device.display());
        }
    }
    Ok(())
}

fn write_stats<T: Serialize>(path: Option<&Path>, stats: &T) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), stats)?;
    Ok(())
}
