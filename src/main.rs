mod fits;
mod rewrite;
mod stats;

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use fits::{HeaderError, ValueType};
use log::{error, info, warn, LevelFilter};
use rewrite::{rewrite_file, RewriteOptions};
use stats::StatsTable;
use std::path::{Path, PathBuf};

/// Help was printed instead of doing any work.
const EXIT_USAGE: i32 = 1;
/// Bad arguments, missing input file or unusable stats file.
const EXIT_ARGS: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "fitsheader-rewrite",
    about = "Rewrite FITS headers: drop non-essential cards and add the cards from a stats file",
    override_usage = "fitsheader-rewrite -s <stats file name> <FITS file>",
    disable_help_flag = true,
    disable_version_flag = true,
    arg_required_else_help = true
)]
struct Args {
    /// Stats file with one `<KEY> <VALUE>` pair per line
    #[arg(short = 's', value_name = "STATS")]
    stats: Option<PathBuf>,

    /// FITS file to rewrite in place
    #[arg(value_name = "FITS")]
    files: Vec<PathBuf>,

    /// More output
    #[arg(short = 'v', short_alias = 'V', action = ArgAction::SetTrue)]
    verbose: bool,

    /// Print help
    #[arg(short = 'h', short_aliases = ['H', '?'], action = ArgAction::Help)]
    help: Option<bool>,

    /// Numeric type of the cards written from the stats file
    #[arg(long, value_enum, default_value_t = ValueType::Double)]
    value_type: ValueType,

    /// Do not copy TRIMSEC/DATASEC to HDUs that lack them
    #[arg(long)]
    no_geometry: bool,

    /// Remove CHECKSUM and DATASUM along with the other non-essential cards
    #[arg(long)]
    drop_checksums: bool,

    /// Carry on with no stats cards if the stats file is missing or malformed
    #[arg(long)]
    allow_bad_stats: bool,
}

impl Args {
    /// Returns the stats file and the single FITS file.
    fn inputs(&self) -> Result<(&Path, &Path)> {
        let Some(stats) = self.stats.as_deref() else {
            bail!("stats filename missing");
        };
        let [fits] = self.files.as_slice() else {
            bail!("expected exactly one FITS file, got {}", self.files.len());
        };
        if !fits.is_file() {
            bail!("input file {} does not exist", fits.display());
        }
        Ok((stats, fits))
    }

    fn options(&self) -> RewriteOptions {
        RewriteOptions {
            value_type: self.value_type,
            reconcile_geometry: !self.no_geometry,
            keep_checksums: !self.drop_checksums,
            verbose: self.verbose,
        }
    }
}

/// Parse the command line, printing help or the clap error on failure.
fn parse_args<I, T>(argv: I) -> Result<Args, i32>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Args::try_parse_from(argv).map_err(|e| {
        let _ = e.print();
        usage_exit_code(e.kind())
    })
}

fn usage_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        | ErrorKind::UnknownArgument => EXIT_USAGE,
        _ => EXIT_ARGS,
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .parse_default_env()
        .init();
}

/// Load the stats table. With `allow_bad`, a malformed file keeps the entries
/// read before the bad line and a missing file gives an empty table.
fn load_stats(path: &Path, allow_bad: bool) -> Result<StatsTable> {
    if !allow_bad {
        return StatsTable::from_path(path)
            .with_context(|| format!("loading {}", path.display()));
    }
    match StatsTable::from_path_prefix(path) {
        Ok((table, None)) => Ok(table),
        Ok((table, Some(e))) => {
            warn!(
                "stats file {}: {e}, using the {} entries before it",
                path.display(),
                table.len()
            );
            Ok(table)
        }
        Err(e) => {
            warn!("ignoring stats file {}: {e}", path.display());
            Ok(StatsTable::default())
        }
    }
}

fn execute(args: &Args) -> Result<()> {
    let (stats_path, fits_path) = args.inputs()?;
    let stats = load_stats(stats_path, args.allow_bad_stats)?;
    if stats.is_empty() {
        warn!("no stats cards to add");
    } else if !stats.warnings().is_empty() {
        info!(
            "{} stats entries were trimmed or skipped",
            stats.warnings().len()
        );
    }

    let report = rewrite_file(fits_path, &stats, &args.options())
        .with_context(|| format!("rewriting {}", fits_path.display()))?;
    for fill in &report.geometry {
        info!(
            "{} copied to {} of {} HDUs: {}",
            fill.key,
            fill.added_to.len(),
            report.hdus,
            fill.card.trim_end()
        );
    }
    Ok(())
}

/// cfitsio status for library failures, [`EXIT_ARGS`] for everything else.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<HeaderError>()
        .map_or(EXIT_ARGS, HeaderError::status)
}

fn main() {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(code) => std::process::exit(code),
    };
    init_logging(args.verbose);

    if let Err(e) = execute(&args) {
        error!("{e:#}");
        std::process::exit(exit_code(&e));
    }
}
