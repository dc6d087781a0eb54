// ============================================
// Converter - main.rs
// ============================================
// This is the entry point of the application.
//
// The program flow is:
// 1. Parse the command line (clap)
// 2. Load ~/.converter/config.toml and set up logging
// 3. Startup housekeeping (leftover update files, version tracking)
// 4. Run the requested command: archive, convert, update or version
//
// Every command prints progress as "[ 42.0%] message" lines and exits
// with status 1 when it fails.
// ============================================

// Our modules
mod archive;   // Create / extract / add / list for every archive format
mod config;    // config.toml settings and the ~/.converter layout
mod convert;   // Image conversion and ICNS creation
mod download;  // Downloading, staging and applying updates
mod progress;  // Progress events shared by archive and convert
mod tools;     // External helpers (7z, rar, unrar, iconutil)
mod updater;   // GitHub release checks
mod version;   // Version parsing and ordering

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::archive::ArchiveFormat;
use crate::config::{Paths, Settings};
use crate::convert::ImageTarget;
use crate::progress::{Progress, Reporter};
use crate::updater::{UpdateManager, UpdateSource};
use crate::version::{Channel, Version};

// ============================================
// COMMAND LINE
// ============================================

#[derive(Parser, Debug)]
#[command(name = "converter", version, about = "Archive manager, image converter and self-updater")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Also write the log to ~/.converter/log/converter.log
    #[arg(long, global = true)]
    log_file: bool,

    /// Use another config file instead of ~/.converter/config.toml
    #[arg(long, global = true, env = config::CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, extract, add to and list archives
    #[command(subcommand)]
    Archive(ArchiveCommand),

    /// Convert an image to another format (icns, png, jpg, webp, bmp, gif, tiff, ico)
    Convert(ConvertArgs),

    /// Check for and install updates from GitHub releases
    #[command(subcommand)]
    Update(UpdateCommand),

    /// Show the version this binary was built as
    Version,
}

#[derive(Subcommand, Debug)]
enum ArchiveCommand {
    /// Create a new archive from files and directories
    Create {
        /// Archive to write
        output: PathBuf,

        /// Files and directories to pack
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Archive format (default: from the output file name)
        #[arg(short, long)]
        format: Option<ArchiveFormat>,
    },

    /// Extract an archive
    Extract {
        archive: PathBuf,

        /// Destination directory (default: archive name without extension)
        dest: Option<PathBuf>,

        /// Password for encrypted zip, 7z and rar archives
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Add a file to an existing archive
    Add { archive: PathBuf, file: PathBuf },

    /// List the contents of an archive
    List { archive: PathBuf },

    /// Show every supported format and what can be done with it
    Formats,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    input: PathBuf,
    output: PathBuf,

    /// Output format (default: from the output file name)
    #[arg(short, long)]
    format: Option<ImageTarget>,

    /// Smallest icon size put into an ICNS file
    #[arg(long, default_value_t = 16)]
    min_size: u32,

    /// Largest icon size put into an ICNS file (default: the source size)
    #[arg(long)]
    max_size: Option<u32>,

    /// Only print the input image's dimensions
    #[arg(long)]
    info: bool,
}

#[derive(Subcommand, Debug)]
enum UpdateCommand {
    /// Ask GitHub whether a newer release exists
    Check {
        #[command(flatten)]
        filter: FilterArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download and stage the newest release
    Download {
        #[command(flatten)]
        filter: FilterArgs,

        /// Run the apply script right away (the program exits afterwards)
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Consider pre-releases
    #[arg(long)]
    pre_release: bool,

    /// Lowest accepted channel (alpha, deepdev, beta, rc, stable); implies --pre-release
    #[arg(long)]
    channel: Option<Channel>,
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("[ERROR] {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    let paths = Paths::discover().context("Failed to locate the data directory")?;
    init_logging(&settings, &paths, cli.verbose, cli.log_file);

    log::info!("Converter v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Data directory: {}", paths.root().display());
    log::debug!("App directory: {}", tools::get_app_directory().display());

    // Clean up after an update that was applied since the last run
    if download::run_startup_maintenance(&paths, &Version::current()) {
        log::info!("First start of this version");
    }

    match cli.command {
        Command::Archive(cmd) => run_archive(cmd),
        Command::Convert(args) => run_convert(args),
        Command::Update(cmd) => run_update(cmd, &settings, paths),
        Command::Version => {
            let current = Version::current();
            println!("Converter v{}", current);
            println!("Channel: {}", current.channel);
            Ok(())
        }
    }
}

// ============================================
// LOGGING
// ============================================

/// env_logger with the level from config.toml (or -v), overridden by
/// RUST_LOG. With --log-file (or log.to_file) output goes to the log file.
fn init_logging(settings: &Settings, paths: &Paths, verbose: u8, log_file: bool) {
    let level = match verbose {
        0 => settings.log.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().default_filter_or(level);
    let mut builder = env_logger::Builder::from_env(env);

    if log_file || settings.log.to_file {
        let path = paths.log_file();
        let opened = std::fs::create_dir_all(paths.log_dir())
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path));
        match opened {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Could not open log file {}: {}", path.display(), e),
        }
    }

    // A second init (tests) is harmless
    let _ = builder.try_init();
}

// ============================================
// PROGRESS OUTPUT
// ============================================

fn print_progress(event: Progress) {
    match event {
        Progress::Step { message, percent } => println!("[{:>5.1}%] {}", percent, message),
        Progress::Failed { message } => eprintln!("[ERROR] {}", message),
    }
}

// ============================================
// ARCHIVE COMMANDS
// ============================================

fn run_archive(cmd: ArchiveCommand) -> Result<()> {
    let mut print = print_progress;

    match cmd {
        ArchiveCommand::Create {
            output,
            sources,
            format,
        } => {
            let format = match format {
                Some(f) => f,
                None => ArchiveFormat::from_path(&output).with_context(|| {
                    format!(
                        "Cannot tell the archive format from '{}', use --format",
                        output.display()
                    )
                })?,
            };
            archive::create_archive(&output, &sources, format, &mut Reporter::new(&mut print))
                .context("Archive creation failed")?;
        }

        ArchiveCommand::Extract {
            archive,
            dest,
            password,
        } => {
            let dest = dest.unwrap_or_else(|| default_extract_dir(&archive));
            archive::extract_archive(
                &archive,
                &dest,
                password.as_deref(),
                &mut Reporter::new(&mut print),
            )
            .context("Extraction failed")?;
        }

        ArchiveCommand::Add { archive, file } => {
            archive::add_to_archive(&archive, &file, &mut Reporter::new(&mut print))
                .context("Adding the file failed")?;
        }

        ArchiveCommand::List { archive } => {
            let entries = archive::list_archive_contents(&archive)
                .with_context(|| format!("Could not list {}", archive.display()))?;
            println!("Contents of {} ({} entries):", archive.display(), entries.len());
            for line in archive::format_listing(&entries) {
                println!("  {}", line);
            }
        }

        ArchiveCommand::Formats => {
            println!("{:<10} {:>7} {:>7} {:>7}", "FORMAT", "EXTRACT", "CREATE", "ADD");
            for format in ArchiveFormat::ALL {
                let mark = |b: bool| if b { "yes" } else { "-" };
                println!(
                    "{:<10} {:>7} {:>7} {:>7}",
                    format.as_str(),
                    "yes",
                    mark(format.can_create()),
                    mark(format.can_add())
                );
            }
        }
    }
    Ok(())
}

/// "photos.tar.gz" -> "photos" next to the archive
fn default_extract_dir(archive: &Path) -> PathBuf {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_lowercase();
    let stem_len = [".tar.gz", ".tar.bz2", ".tar.xz"]
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| name.len() - suffix.len())
        .or_else(|| name.rfind('.'))
        .unwrap_or(name.len());
    let stem = if stem_len == 0 { "extracted" } else { &name[..stem_len] };
    archive.with_file_name(stem)
}

// ============================================
// CONVERT COMMAND
// ============================================

fn run_convert(args: ConvertArgs) -> Result<()> {
    if args.info {
        let (w, h) = convert::image_info(&args.input)
            .with_context(|| format!("Could not read {}", args.input.display()))?;
        println!("{}: {}x{}", args.input.display(), w, h);
        return Ok(());
    }

    let target = match args.format {
        Some(t) => t,
        None => {
            let ext = args
                .output
                .extension()
                .map(|e| e.to_string_lossy().into_owned())
                .with_context(|| {
                    format!(
                        "Cannot tell the image format from '{}', use --format",
                        args.output.display()
                    )
                })?;
            ext.parse()?
        }
    };

    let mut print = print_progress;
    convert::convert_image(
        &args.input,
        &args.output,
        target,
        args.min_size,
        args.max_size,
        &mut Reporter::new(&mut print),
    )
    .context("Image conversion failed")?;
    Ok(())
}

// ============================================
// UPDATE COMMANDS
// ============================================

fn check(settings: &Settings, filter: &FilterArgs) -> (UpdateManager, updater::UpdateResult) {
    let manager = UpdateManager::new(Version::current(), UpdateSource::from_settings(settings));

    let result = match filter.channel {
        Some(channel) => manager.check_for_channel(channel),
        None if filter.pre_release || settings.update.include_prerelease => {
            manager.check_for_channel(settings.lowest_channel())
        }
        None => manager.check_for_updates(false),
    };
    (manager, result)
}

/// A flag that Ctrl-C sets instead of killing the process, so a running
/// download can stop and remove its temp dir
fn cancel_on_ctrl_c() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        log::warn!("Ctrl-C will not cancel the download: {}", e);
    }
    cancel
}

fn run_update(cmd: UpdateCommand, settings: &Settings, paths: Paths) -> Result<()> {
    match cmd {
        UpdateCommand::Check { filter, json } => {
            let (_, result) = check(settings, &filter);
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.message);
                if let Some(url) = &result.download_url {
                    println!("Download: {}", url);
                }
                let body = result.release_body.as_deref().filter(|b| !b.trim().is_empty());
                if let Some(body) = body {
                    println!();
                    println!("{}", body.trim());
                }
            }
            if result.status == updater::UpdateStatus::Error {
                bail!("{}", result.message);
            }
            Ok(())
        }

        UpdateCommand::Download { filter, apply } => {
            let (manager, result) = check(settings, &filter);
            println!("{}", result.message);
            if result.status == updater::UpdateStatus::Error {
                bail!("{}", result.message);
            }
            if !result.is_update_available() {
                return Ok(());
            }

            let mut last_printed = -1i32;
            let mut on_progress = |p: download::DownloadProgress| {
                // One line per whole percent
                let whole = p.percent as i32;
                if p.total > 0 && whole != last_printed {
                    last_printed = whole;
                    print!(
                        "\r[{:>5.1}%] Downloading... {} / {}",
                        p.percent,
                        updater::format_size(p.downloaded),
                        updater::format_size(p.total)
                    );
                    let _ = std::io::stdout().flush();
                }
            };

            let staged = match download::download_and_apply_update(
                &result,
                manager.source().clone(),
                paths,
                &settings.network,
                cancel_on_ctrl_c(),
                &mut on_progress,
            ) {
                Ok(staged) => staged,
                Err(updater::UpdateError::Cancelled) => {
                    println!();
                    println!("Download cancelled.");
                    return Ok(());
                }
                Err(e) => return Err(e).context("Update download failed"),
            };
            println!();
            println!("Update {} ready in {}", staged.version, staged.payload_dir.display());

            if apply {
                let install_dir = settings.install_dir();
                println!("Installing to {}...", install_dir.display());
                if let Err(e) = download::apply_staged_update(&staged, &install_dir) {
                    staged.cleanup();
                    return Err(e).context("Could not start the update");
                }
                println!("The update is being applied. Converter will now exit.");
            } else {
                println!(
                    "Run with --apply to install, or run: {} {} {} <pid>",
                    staged.script_path.display(),
                    staged.payload_dir.display(),
                    settings.install_dir().display()
                );
            }
            Ok(())
        }
    }
}
