#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e2r_core::{DirListing, Ext2Fs, OpenOptions, normalize_path};
use e2r_error::E2rError;
use std::env;
use std::io::{self, Write};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (`tracing` directives).
const LOG_ENV: &str = "EXT2READER_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListFormat {
    Names,
    Long,
    Json,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Help,
    List {
        image: String,
        path: String,
        format: ListFormat,
        options: OpenOptions,
    },
    Dump {
        image: String,
        path: String,
        options: OpenOptions,
    },
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(err) => {
            eprint_usage();
            return Err(err);
        }
    };
    debug!(?command, "parsed arguments");

    match command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::List {
            image,
            path,
            format,
            options,
        } => list(&image, &path, format, &options),
        Command::Dump {
            image,
            path,
            options,
        } => dump(&image, &path, &options),
    }
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut dump_mode = false;
    let mut format = ListFormat::Names;
    let mut options = OpenOptions::default();
    let mut positional = Vec::new();

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-l" => dump_mode = true,
            "--long" => format = ListFormat::Long,
            "--json" => format = ListFormat::Json,
            "--no-validate" => options.skip_validation = true,
            other if other.starts_with('-') && other.len() > 1 => {
                bail!("unknown option: {other}")
            }
            other => positional.push(other.to_owned()),
        }
    }

    if dump_mode {
        let [image, path] = positional.as_slice() else {
            bail!("-l requires <image.ext2> <file_to_dump>");
        };
        return Ok(Command::Dump {
            image: image.clone(),
            path: path.clone(),
            options,
        });
    }

    match positional.as_slice() {
        [image] => Ok(Command::List {
            image: image.clone(),
            path: "/".to_owned(),
            format,
            options,
        }),
        [image, path] => Ok(Command::List {
            image: image.clone(),
            path: path.clone(),
            format,
            options,
        }),
        [] => bail!("missing <image.ext2>"),
        _ => bail!("too many arguments"),
    }
}

/// Path errors already name the offending path; everything else gets the
/// operation as context.
fn report(err: E2rError, action: impl FnOnce() -> String) -> anyhow::Error {
    if err.is_user_error() {
        anyhow::Error::new(err)
    } else {
        anyhow::Error::new(err).context(action())
    }
}

fn open(image: &str, options: &OpenOptions) -> Result<Ext2Fs> {
    Ext2Fs::open_with_options(image, options)
        .map_err(|err| report(err, || format!("failed to open {image}")))
}

fn list(image: &str, path: &str, format: ListFormat, options: &OpenOptions) -> Result<()> {
    let fs = open(image, options)?;
    let failed = |err| report(err, || format!("failed to list {}", normalize_path(path)));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match format {
        ListFormat::Names => {
            let entries = fs.read_dir(path).map_err(failed)?;
            write_names(&mut out, entries.iter().map(|e| e.name.as_slice()))?;
        }
        ListFormat::Long => write_long(&mut out, &fs.list_dir(path).map_err(failed)?)?,
        ListFormat::Json => {
            let rows = fs.list_dir(path).map_err(failed)?;
            let json = serde_json::to_string_pretty(&rows).context("serialize listing")?;
            writeln!(out, "{json}")?;
        }
    }
    out.flush()?;
    Ok(())
}

/// One name per line, exactly as stored on disk.
fn write_names<'a>(
    out: &mut impl Write,
    names: impl IntoIterator<Item = &'a [u8]>,
) -> io::Result<()> {
    for name in names {
        out.write_all(name)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

fn write_long(out: &mut impl Write, rows: &[DirListing]) -> io::Result<()> {
    writeln!(out, "{:>20} {:>20} {:>20}", "filename", "type", "size")?;
    for row in rows {
        writeln!(
            out,
            "{:>20} {:>20} {:>20}",
            row.name,
            row.kind.code(),
            row.size
        )?;
    }
    Ok(())
}

fn dump(image: &str, path: &str, options: &OpenOptions) -> Result<()> {
    let fs = open(image, options)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    fs.dump_to(path, &mut out)
        .map_err(|err| report(err, || format!("failed to dump {}", normalize_path(path))))?;
    out.flush()?;
    Ok(())
}

const USAGE: &str = "\
Usage: ext2reader [--long|--json] [--no-validate] <image.ext2> [path]
       ext2reader -l [--no-validate] <image.ext2> <file_to_dump>

If [path] is not specified, '/' is listed.
  -l             write the contents of <file_to_dump> to standard output
  --long         list as a table of filename, type (d/f/u) and size
  --json         list as a JSON array
  --no-validate  skip superblock geometry checks
  -h, --help     show this help
All paths not prefixed with '/' are relative to the root directory.
Set EXT2READER_LOG (e.g. debug) for diagnostics on stderr.";

fn print_usage() {
    println!("{USAGE}");
}

fn eprint_usage() {
    eprintln!("{USAGE}");
}
