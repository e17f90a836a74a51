use clap::{CommandFactory, FromArgMatches, Parser};
use hoyoassets::config::{KeyFile, DEFAULT_KEY_FILE};
use hoyoassets::format::{get_format, Direction, Format, FORMATS};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "hoyoassets",
    version,
    about = "Decrypt, re-pack and extract game asset containers",
    override_usage = "hoyoassets [OPTIONS] <FORMAT> [e] <INPUT> <OUTPUT>"
)]
struct Cli {
    /// JSON key file (hex-encoded key material)
    #[arg(short, long, default_value = DEFAULT_KEY_FILE)]
    keys: PathBuf,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
    /// Format name, optional `e` (encrypt; decrypt is the default), then
    /// input and output paths
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

struct Operands {
    format: String,
    direction: Direction,
    input: PathBuf,
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Cli::command().after_help(formats_help()).get_matches();
    let cli = Cli::from_arg_matches(&matches)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "hoyoassets=debug" } else { "hoyoassets=info" })
    });
    fmt().with_env_filter(filter).with_target(false).init();

    let Some(Operands { format, direction, input, output }) = parse_operands(&cli.args) else {
        Cli::command().after_help(formats_help()).print_help()?;
        return Ok(());
    };

    let format = get_format(&format)?;
    let paths = format.collect_paths(&input, &output, direction)?;
    let keys = if format.kind.needs_keys() {
        Some(KeyFile::load(&cli.keys)?)
    } else {
        None
    };

    let count = paths.len();
    info!("Found {count} file(s).");

    let failed = run_batch(format, &paths, direction, keys.as_ref());
    if failed > 0 {
        return Err(format!("{failed} of {count} file(s) failed").into());
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn formats_help() -> String {
    let list: Vec<String> = FORMATS.iter().map(|f| format!("    {f}")).collect();
    format!(
        "Available formats:\n{}\n\nDecrypt is the default; pass 'e' before the paths to encrypt.",
        list.join("\n")
    )
}

/// `<format> [e] <input> <output>`; a second operand other than `e` still
/// means decrypt.
fn parse_operands(args: &[String]) -> Option<Operands> {
    let (format, direction, input, output) = match args {
        [format, input, output] => (format, Direction::Decrypt, input, output),
        [format, flag, input, output] => {
            let direction = if flag == "e" { Direction::Encrypt } else { Direction::Decrypt };
            (format, direction, input, output)
        }
        _ => return None,
    };
    Some(Operands {
        format: format.clone(),
        direction,
        input: input.into(),
        output: output.into(),
    })
}

fn process_one(
    format: &Format,
    (input, output): &(PathBuf, PathBuf),
    direction: Direction,
    keys: Option<&KeyFile>,
    done: &AtomicUsize,
    count: usize,
) -> bool {
    match format.process_file(input, output, direction, keys) {
        Ok(()) => {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            info!("Processed [{n}/{count}] file(s).");
            true
        }
        Err(e) => {
            error!(input = %input.display(), "{e}");
            false
        }
    }
}

/// Returns the number of files that failed.
#[cfg(feature = "parallel")]
fn run_batch(format: &Format, paths: &[(PathBuf, PathBuf)], direction: Direction, keys: Option<&KeyFile>) -> usize {
    use rayon::prelude::*;
    let done = AtomicUsize::new(0);
    paths
        .par_iter()
        .filter(|pair| !process_one(format, pair, direction, keys, &done, paths.len()))
        .count()
}

/// Returns the number of files that failed.
#[cfg(not(feature = "parallel"))]
fn run_batch(format: &Format, paths: &[(PathBuf, PathBuf)], direction: Direction, keys: Option<&KeyFile>) -> usize {
    let done = AtomicUsize::new(0);
    paths
        .iter()
        .filter(|pair| !process_one(format, pair, direction, keys, &done, paths.len()))
        .count()
}
