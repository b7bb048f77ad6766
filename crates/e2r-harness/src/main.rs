#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e2r_harness::sample_image;
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("generate-fixture") => generate_fixture(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn generate_fixture(args: &[String]) -> Result<()> {
    let Some(out) = args.first() else {
        bail!("usage: e2r-harness generate-fixture <out.img> [--block-size 1024|2048|4096]");
    };

    let mut block_size = 1024_u32;
    let mut index = 1_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--block-size" => {
                let raw = args.get(index + 1).context("--block-size requires a value")?;
                block_size = raw.parse().context("invalid --block-size value")?;
                index += 2;
            }
            other => bail!("unknown generate-fixture option: {other}"),
        }
    }

    let image = sample_image(block_size)?;
    let path = Path::new(out);
    fs::write(path, &image.bytes).with_context(|| format!("failed to write {}", path.display()))?;
    println!(
        "wrote {} ({} bytes, block size {block_size})",
        path.display(),
        image.bytes.len()
    );
    Ok(())
}

fn print_usage() {
    println!("e2r-harness: ext2 fixture tooling");
    println!();
    println!("USAGE:");
    println!("  e2r-harness generate-fixture <out.img> [--block-size 1024|2048|4096]");
}
