//! prewarm — read required files in advance.
//!
//! Without a pack file for the target filesystem (or with `--force-trace`),
//! a trace is run to generate one for the next boot; with a pack present,
//! it is replayed (or dumped with `--dump`).

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use pw_pack::{SortOrder, codec, naming};
use pw_trace::{PathPrefix, TraceConfig};
use pw_tracefs::Tracefs;
use pw_types::Dev;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_BAD_ARGS: i32 = 1;
const EXIT_NO_PACK_NAME: i32 = 2;
const EXIT_REPLAY_ERROR: i32 = 3;
const EXIT_PACK_READ_ERROR: i32 = 4;
const EXIT_TRACE_ERROR: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum SortArg {
    #[default]
    Open,
    Path,
    Disk,
    Size,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Open => SortOrder::Open,
            SortArg::Path => SortOrder::Path,
            SortArg::Disk => SortOrder::Disk,
            SortArg::Size => SortOrder::Size,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "prewarm",
    about = "Read required files in advance",
    long_about = "PATH should be the location of a mounted filesystem for which files\n\
                  should be read. If not given, the root filesystem is assumed.\n\
                  \n\
                  If no readahead pack exists for the filesystem, tracing is performed\n\
                  instead to generate the pack for the next boot."
)]
struct Cli {
    /// Detach and run in the background.
    #[arg(long)]
    daemon: bool,

    /// Ignore existing pack and force retracing.
    #[arg(long)]
    force_trace: bool,

    /// Maximum time to trace [default: until terminated].
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Dump the current pack file.
    #[arg(long)]
    dump: bool,

    /// How to sort the pack file when dumping.
    #[arg(long, value_enum, default_value = "open")]
    sort: SortArg,

    /// Dump as JSON instead of text.
    #[arg(long, requires = "dump")]
    json: bool,

    /// Pathname to prepend for files on the device.
    #[arg(long, value_name = "PREFIX")]
    path_prefix: Option<PathBuf>,

    /// Path prefix that retained files during tracing must start with.
    #[arg(long, value_name = "PREFIX_FILTER")]
    path_prefix_filter: Option<String>,

    /// Path of the pack file to use.
    #[arg(long, value_name = "PACK_FILE")]
    pack_file: Option<PathBuf>,

    /// Do not enable or disable trace events.
    #[arg(long)]
    use_existing_trace_events: bool,

    /// Force ssd setting in pack file during tracing.
    #[arg(long)]
    force_ssd_mode: bool,

    /// Mounted filesystem to read files for [default: /].
    path: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(if err.use_stderr() { EXIT_BAD_ARGS } else { 0 });
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let path_prefix = match cli.path_prefix.as_deref().map(parse_path_prefix).transpose() {
        Ok(prefix) => prefix,
        Err(err) => {
            eprintln!("prewarm: illegal argument: {err:#}");
            return EXIT_BAD_ARGS;
        }
    };

    let mount = cli
        .path
        .as_deref()
        .map_or("/".to_owned(), |p| p.to_string_lossy().into_owned());
    let filename = match &cli.pack_file {
        Some(explicit) => Ok(explicit.clone()),
        None => naming::pack_file_name(&mount),
    };

    if !cli.force_trace {
        let filename = match &filename {
            Ok(filename) => filename.clone(),
            Err(err) => {
                error!(mount, %err, "unable to determine pack file name");
                return EXIT_NO_PACK_NAME;
            }
        };

        match codec::read_pack(&filename) {
            Ok(pack) => {
                if cli.dump {
                    return dump_pack(&pack, cli);
                }
                return match pw_replay::replay(&pack, cli.daemon) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!(%err, "error while reading");
                        EXIT_REPLAY_ERROR
                    }
                };
            }
            Err(err) => {
                // A missing or bad pack means retracing, unless a PATH or
                // --dump was given explicitly.
                if cli.path.is_some() || cli.dump {
                    error!(path = %filename.display(), %err, "cannot read pack");
                    return EXIT_PACK_READ_ERROR;
                }
                info!(path = %filename.display(), %err, "no usable pack, tracing");
            }
        }
    }

    let config = TraceConfig {
        daemonise: cli.daemon,
        timeout: cli.timeout.filter(|&t| t > 0).map(Duration::from_secs),
        filename_to_replace: filename.ok(),
        pack_file: cli.pack_file.clone(),
        path_prefix_filter: cli.path_prefix_filter.clone(),
        path_prefix,
        use_existing_trace_events: cli.use_existing_trace_events,
        force_ssd_mode: cli.force_ssd_mode,
    };

    let transport = match Tracefs::mount() {
        Ok(transport) => transport,
        Err(err) => {
            error!(%err, "error while tracing");
            return EXIT_TRACE_ERROR;
        }
    };

    match pw_trace::trace(&transport, &config) {
        Ok(written) => {
            info!(packs = written.len(), "tracing complete");
            0
        }
        Err(err) => {
            error!(%err, "error while tracing");
            EXIT_TRACE_ERROR
        }
    }
}

fn dump_pack(pack: &pw_pack::PackFile, cli: &Cli) -> i32 {
    if cli.json {
        match serde_json::to_string_pretty(pack) {
            Ok(json) => println!("{json}"),
            Err(err) => {
                error!(%err, "cannot serialise pack");
                return EXIT_PACK_READ_ERROR;
            }
        }
    } else {
        let stdout = std::io::stdout();
        if let Err(err) = pw_pack::dump::dump(pack, cli.sort.into(), &mut stdout.lock()) {
            error!(%err, "cannot dump pack");
            return EXIT_PACK_READ_ERROR;
        }
    }
    0
}

fn parse_path_prefix(prefix: &Path) -> anyhow::Result<PathPrefix> {
    let meta = std::fs::symlink_metadata(prefix)
        .with_context(|| format!("{}", prefix.display()))?;
    if !meta.is_dir() {
        bail!("{}: not a directory", prefix.display());
    }

    let prefix = prefix
        .to_str()
        .context("path prefix is not valid UTF-8")?
        .trim_end_matches('/')
        .to_owned();
    Ok(PathPrefix {
        dev: Dev::from_raw(meta.dev()),
        prefix,
    })
}
