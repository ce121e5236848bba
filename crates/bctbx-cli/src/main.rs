//! bctbx: encrypted VFS file tool
//!
//! Commands:
//!   inspect <file>        - decode the header of a file without any key
//!   cat <file>            - write the decrypted content to stdout
//!   check <file>          - authenticate every chunk, optionally repairing the size
//!   migrate <file>        - encrypt a plaintext file in place
//!   import <src> <dst>    - copy a plaintext file into a new encrypted file
//!
//! Secret material is read base64-encoded from `--key-file` or `BCTBX_EVFS_KEY`.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

use bctbx_core::config::{BctbxConfig, VfsConfig};
use bctbx_core::{EncryptionSuite, EvfsResult, OpenFlags};
use bctbx_crypto::{chunk_header_size, module_file_header_size};
use bctbx_vfs::header::BASE_HEADER_SIZE;
use bctbx_vfs::layout::ChunkLayout;
use bctbx_vfs::{
    BackingFile, EncryptedVfs, EncryptionSettings, FileHeader, OpenPolicy, StdBackingFile,
    VfsFile, VfsRegistry, ENCRYPTED_VFS_NAME,
};

/// Plaintext bytes moved per read or write
const COPY_BLOCK: usize = 64 * 1024;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "bctbx",
    version,
    about = "bctoolbox encrypted VFS tool",
    long_about = "bctbx: inspect, read, verify, and create files stored through the encrypted VFS"
)]
struct Cli {
    /// Path to bctbx.toml configuration file
    #[arg(long, short = 'c', env = "BCTBX_CONFIG", default_value = "/etc/bctbx/config.toml")]
    config: PathBuf,

    /// File holding the base64-encoded secret material
    #[arg(long, env = "BCTBX_EVFS_KEY_FILE")]
    key_file: Option<PathBuf>,

    /// Base64-encoded secret material (prefer --key-file)
    #[arg(long, env = "BCTBX_EVFS_KEY", hide_env_values = true)]
    key: Option<String>,

    /// Log level (overrides log.level from the config)
    #[arg(long, env = "BCTBX_LOG")]
    log: Option<String>,

    /// Log output format (overrides log.format from the config)
    #[arg(long, env = "BCTBX_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the header of a file; no secret needed
    Inspect {
        file: PathBuf,
    },

    /// Print the decrypted content of a file
    Cat {
        file: PathBuf,
    },

    /// Authenticate every chunk of a file
    ///
    /// A file whose recorded size disagrees with its chunks is recovered to
    /// the last authentic chunk. Without --repair the recovered size is only
    /// reported; with it the file is truncated and its header rewritten.
    Check {
        file: PathBuf,
        /// Persist the recovered size
        #[arg(long)]
        repair: bool,
    },

    /// Encrypt a plaintext file in place
    Migrate {
        file: PathBuf,
        /// Suite to encrypt with (default: vfs.default_suite)
        #[arg(long, short = 's')]
        suite: Option<EncryptionSuite>,
        /// Plaintext bytes per chunk (default: vfs.chunk_size)
        #[arg(long)]
        chunk_size: Option<u32>,
    },

    /// Copy a plaintext file into a new encrypted file
    Import {
        src: PathBuf,
        dst: PathBuf,
        /// Suite to encrypt with (default: vfs.default_suite)
        #[arg(long, short = 's')]
        suite: Option<EncryptionSuite>,
        /// Plaintext bytes per chunk (default: vfs.chunk_size)
        #[arg(long)]
        chunk_size: Option<u32>,
        /// Replace `dst` if it exists
        #[arg(long, short = 'f')]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(format: &str) -> Self {
        match format {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

// ── Entry point ────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BctbxConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .unwrap_or_else(|| LogFormat::from_config(&config.log.format));
    init_logging(&level, format);

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        config_found = cli.config.exists(),
        "bctbx starting"
    );

    match &cli.command {
        Commands::Inspect { file } => cmd_inspect(file),
        Commands::Cat { file } => {
            let secret = load_secret(&cli)?;
            cmd_cat(&config.vfs, secret, file)
        }
        Commands::Check { file, repair } => {
            let secret = load_secret(&cli)?;
            cmd_check(&config.vfs, secret, file, *repair)
        }
        Commands::Migrate {
            file,
            suite,
            chunk_size,
        } => {
            let secret = load_secret(&cli)?;
            let vfs = override_vfs(&config.vfs, *suite, *chunk_size)?;
            cmd_migrate(&vfs, secret, file)
        }
        Commands::Import {
            src,
            dst,
            suite,
            chunk_size,
            force,
        } => {
            let secret = load_secret(&cli)?;
            let vfs = override_vfs(&config.vfs, *suite, *chunk_size)?;
            cmd_import(&vfs, secret, src, dst, *force)
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries file content for `cat`
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Secrets and policy ─────────────────────────────────────────────────────────

fn load_secret(cli: &Cli) -> Result<Option<Zeroizing<Vec<u8>>>> {
    let encoded = match (&cli.key_file, &cli.key) {
        (Some(path), _) => Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?,
        ),
        (None, Some(key)) => Zeroizing::new(key.clone()),
        (None, None) => return Ok(None),
    };
    decode_secret(&encoded).map(Some)
}

fn decode_secret(encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = BASE64
        .decode(encoded.trim())
        .context("secret material is not valid base64")?;
    Ok(Zeroizing::new(bytes))
}

fn override_vfs(
    base: &VfsConfig,
    suite: Option<EncryptionSuite>,
    chunk_size: Option<u32>,
) -> Result<VfsConfig> {
    let mut vfs = base.clone();
    if let Some(suite) = suite {
        if suite == EncryptionSuite::Unset {
            bail!("--suite must name a suite");
        }
        vfs.default_suite = suite;
    }
    if let Some(size) = chunk_size {
        bctbx_vfs::header::validate_chunk_size(size)?;
        vfs.chunk_size = size;
    }
    Ok(vfs)
}

/// Policy that applies the `[vfs]` config and hands the secret to whatever
/// suite ends up selected.
fn open_policy(vfs: VfsConfig, secret: Option<Zeroizing<Vec<u8>>>) -> impl OpenPolicy {
    move |settings: &mut EncryptionSettings| -> EvfsResult<()> {
        settings.apply_config(&vfs)?;
        if let Some(secret) = secret.as_ref() {
            if settings.suite().is_encrypting() {
                settings.set_secret_material(secret)?;
            }
        }
        Ok(())
    }
}

fn encrypted_registry(vfs: VfsConfig, secret: Option<Zeroizing<Vec<u8>>>) -> Result<VfsRegistry> {
    let mut registry = VfsRegistry::new();
    registry.register(std::sync::Arc::new(EncryptedVfs::new(open_policy(vfs, secret))));
    registry.set_default(ENCRYPTED_VFS_NAME)?;
    Ok(registry)
}

fn open_file(registry: &VfsRegistry, path: &Path, mode: &str, has_secret: bool) -> Result<VfsFile> {
    registry.open(path, mode).with_context(|| {
        if has_secret {
            format!("opening {}", path.display())
        } else {
            format!(
                "opening {} (no secret given: use --key-file or BCTBX_EVFS_KEY)",
                path.display()
            )
        }
    })
}

// ── Commands ───────────────────────────────────────────────────────────────────

fn cmd_inspect(path: &Path) -> Result<()> {
    let (raw_size, header) = read_header(path)?;
    let Some(header) = header else {
        println!("{}: plaintext, {}", path.display(), fmt_bytes(raw_size));
        return Ok(());
    };

    let trailer = module_file_header_size(header.suite)?;
    let layout = ChunkLayout::new(
        header.chunk_size,
        chunk_header_size(header.suite)?,
        header.module_header_offset() + trailer as u64,
    );
    let expected = layout.raw_file_size(header.file_size);

    println!("File:        {}", path.display());
    println!(
        "Version:     {}.{}",
        header.version >> 8,
        header.version & 0xff
    );
    println!("Suite:       {} ({:#06x})", header.suite, header.suite.id());
    println!("Chunk size:  {} B", header.chunk_size);
    println!("Extension:   {} B", header.extension_size);
    println!("Header:      {} B", layout.header_size());
    println!(
        "Plaintext:   {} ({} chunks)",
        fmt_bytes(header.file_size),
        layout.chunk_count(header.file_size)
    );
    println!("On disk:     {}", fmt_bytes(raw_size));
    if raw_size == expected {
        println!("Layout:      consistent");
    } else {
        println!(
            "Layout:      size mismatch, header implies {expected} B on disk; run `bctbx check --repair`"
        );
    }
    Ok(())
}

fn cmd_cat(vfs: &VfsConfig, secret: Option<Zeroizing<Vec<u8>>>, path: &Path) -> Result<()> {
    let has_secret = secret.is_some();
    let registry = encrypted_registry(vfs.clone(), secret)?;
    let mut file = open_file(&registry, path, "r", has_secret)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    loop {
        let block = Zeroizing::new(file.read(COPY_BLOCK)?);
        if block.is_empty() {
            break;
        }
        out.write_all(&block)?;
    }
    out.flush()?;
    file.close()?;
    Ok(())
}

fn cmd_check(
    vfs: &VfsConfig,
    secret: Option<Zeroizing<Vec<u8>>>,
    path: &Path,
    repair: bool,
) -> Result<()> {
    let (raw_size, header) = read_header(path)?;
    let Some(header) = header else {
        println!("{}: plaintext, nothing to authenticate", path.display());
        return Ok(());
    };

    // never migrate from a check
    let mut vfs = vfs.clone();
    vfs.migrate_plain_files = false;
    let has_secret = secret.is_some();
    let registry = encrypted_registry(vfs, secret)?;
    let mode = if repair { "r+" } else { "r" };
    let mut file = open_file(&registry, path, mode, has_secret)?;

    let size = file.size()?;
    let pb = make_progress_bar(size, "check")?;
    pb.set_message(path.display().to_string());
    let mut verified = 0u64;
    loop {
        let block = Zeroizing::new(
            file.read(COPY_BLOCK)
                .with_context(|| format!("authenticating {} at byte {verified}", path.display()))?,
        );
        if block.is_empty() {
            break;
        }
        verified += block.len() as u64;
        pb.set_position(verified);
    }
    pb.finish_and_clear();
    file.close()?;

    if size == header.file_size {
        println!(
            "{}: ok, {} in {}-byte chunks ({})",
            path.display(),
            fmt_bytes(size),
            header.chunk_size,
            header.suite
        );
    } else if repair {
        println!(
            "{}: repaired, size {} -> {} ({} on disk before)",
            path.display(),
            header.file_size,
            size,
            fmt_bytes(raw_size)
        );
    } else {
        println!(
            "{}: header records {} B but only {} B authenticate; run with --repair to fix",
            path.display(),
            header.file_size,
            size
        );
    }
    Ok(())
}

fn cmd_migrate(vfs: &VfsConfig, secret: Option<Zeroizing<Vec<u8>>>, path: &Path) -> Result<()> {
    let (_, header) = read_header(path)?;
    if let Some(header) = header {
        println!(
            "{}: already encrypted with {}",
            path.display(),
            header.suite
        );
        return Ok(());
    }
    if !vfs.default_suite.is_encrypting() {
        bail!("suite {} does not encrypt, nothing to migrate to", vfs.default_suite);
    }

    let mut vfs = vfs.clone();
    vfs.migrate_plain_files = true;
    let suite = vfs.default_suite;
    let has_secret = secret.is_some();
    let registry = encrypted_registry(vfs, secret)?;
    let mut file = open_file(&registry, path, "r+", has_secret)?;
    if !file.is_encrypted() {
        bail!("{} was left as plaintext", path.display());
    }
    let size = file.size()?;
    file.close()?;

    info!(path = %path.display(), suite = %suite, size, "migrated");
    println!(
        "{}: encrypted with {suite} ({})",
        path.display(),
        fmt_bytes(size)
    );
    Ok(())
}

fn cmd_import(
    vfs: &VfsConfig,
    secret: Option<Zeroizing<Vec<u8>>>,
    src: &Path,
    dst: &Path,
    force: bool,
) -> Result<()> {
    if dst.exists() && !force {
        bail!("{} exists (use --force to replace it)", dst.display());
    }
    let mut input = std::fs::File::open(src)
        .with_context(|| format!("opening {}", src.display()))?;
    let total = input.metadata()?.len();

    let suite = vfs.default_suite;
    let has_secret = secret.is_some();
    let registry = encrypted_registry(vfs.clone(), secret)?;
    let mut output = open_file(&registry, dst, "w", has_secret)?;

    let pb = make_progress_bar(total, "import")?;
    pb.set_message(src.display().to_string());
    let mut buf = Zeroizing::new(vec![0u8; COPY_BLOCK]);
    let mut copied = 0u64;
    loop {
        let n = input
            .read(&mut buf[..])
            .with_context(|| format!("reading {}", src.display()))?;
        if n == 0 {
            break;
        }
        output
            .write(&buf[..n])
            .with_context(|| format!("writing {}", dst.display()))?;
        copied += n as u64;
        pb.set_position(copied);
    }
    output.sync()?;
    output.close()?;
    pb.finish_and_clear();

    info!(src = %src.display(), dst = %dst.display(), suite = %suite, bytes = copied, "imported");
    println!(
        "{} -> {}: {} ({suite})",
        src.display(),
        dst.display(),
        fmt_bytes(copied)
    );
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Raw size of `path` and its encrypted header, if it has one.
fn read_header(path: &Path) -> Result<(u64, Option<FileHeader>)> {
    let mut backing = StdBackingFile::open(path, OpenFlags::read_only())
        .with_context(|| format!("opening {}", path.display()))?;
    let raw_size = backing.size()?;
    let base = backing.read_at(0, BASE_HEADER_SIZE)?;
    let header = FileHeader::decode(&base)
        .with_context(|| format!("decoding header of {}", path.display()))?;
    Ok((raw_size, header))
}

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

/// Human-readable size in binary units, exact byte count below 1 KiB.
fn fmt_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
