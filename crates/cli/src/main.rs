//! # CLI - ShoalKV Interactive Shell
//!
//! A REPL-style command-line interface for the ShoalKV storage engine.
//! Reads commands from stdin, executes them against the store, and prints
//! results to stdout. Designed for both interactive use and scripted
//! testing (pipe commands via stdin).
//!
//! ## Commands
//!
//! ```text
//! SET key value      Insert or update a key-value pair
//! GET key            Look up a key (prints value or "(nil)")
//! DEL key            Delete a key (writes a tombstone)
//! FLUSH              Persist the index snapshot and superblock
//! STATS              Print store debug info
//! EXIT / QUIT        Shut down gracefully (flushes on drop)
//! ```
//!
//! ## Configuration
//!
//! All settings are controlled via environment variables:
//!
//! ```text
//! SHOAL_DEV_PATH          Device file path              (default: "shoal.img")
//! SHOAL_CAPACITY_OBJECTS  Index capacity in keys        (default: 1024)
//! SHOAL_SEGMENT_KB        Segment size in KiB           (default: 1024)
//! SHOAL_SEGMENT_COUNT     Number of segments            (default: 64)
//! ```
//!
//! An existing device file is opened (and must carry a valid superblock);
//! a missing one is created with the configured geometry.
//!
//! ## Example
//!
//! ```text
//! $ cargo run -p cli
//! ShoalKV started (dev=shoal.img, entries=0, buckets=1024, segments=64x1024KiB)
//! > SET name Alice
//! OK
//! > GET name
//! Alice
//! > DEL name
//! OK
//! > GET name
//! (nil)
//! > EXIT
//! bye
//! ```

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use device::FileDevice;
use engine::{Store, StoreOptions};
use tracing_subscriber::EnvFilter;

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dev_path = env_or("SHOAL_DEV_PATH", "shoal.img");
    let num_objects: u32 = env_or("SHOAL_CAPACITY_OBJECTS", "1024")
        .parse()
        .context("SHOAL_CAPACITY_OBJECTS must be a number")?;
    let segment_kb: u32 = env_or("SHOAL_SEGMENT_KB", "1024")
        .parse()
        .context("SHOAL_SEGMENT_KB must be a number")?;
    let segment_count: u32 = env_or("SHOAL_SEGMENT_COUNT", "64")
        .parse()
        .context("SHOAL_SEGMENT_COUNT must be a number")?;

    let opts = StoreOptions {
        num_objects,
        segment_size: segment_kb * 1024,
        segment_count,
    };

    let mut store = if Path::new(&dev_path).exists() {
        Store::open(FileDevice::open(&dev_path)?)
            .with_context(|| format!("opening existing store at {dev_path}"))?
    } else {
        let dev = FileDevice::create(&dev_path, opts.required_capacity())?;
        Store::create(dev, &opts).with_context(|| format!("creating store at {dev_path}"))?
    };

    println!(
        "ShoalKV started (dev={dev_path}, entries={}, buckets={}, segments={}x{}KiB)",
        store.element_count(),
        store.bucket_count(),
        segment_count,
        segment_kb
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            continue;
        };

        match cmd.to_ascii_uppercase().as_str() {
            "SET" => match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => {
                    match store.put(key.as_bytes(), value.as_bytes()) {
                        Ok(()) => println!("OK"),
                        Err(e) => println!("ERR {e:#}"),
                    }
                }
                _ => println!("ERR usage: SET key value"),
            },
            "GET" => match parts.next() {
                Some(key) => match store.get(key.as_bytes()) {
                    Ok(Some(value)) => println!("{}", String::from_utf8_lossy(&value)),
                    Ok(None) => println!("(nil)"),
                    Err(e) => println!("ERR {e:#}"),
                },
                None => println!("ERR usage: GET key"),
            },
            "DEL" => match parts.next() {
                Some(key) => match store.delete(key.as_bytes()) {
                    Ok(()) => println!("OK"),
                    Err(e) => println!("ERR {e:#}"),
                },
                None => println!("ERR usage: DEL key"),
            },
            "FLUSH" => match store.flush() {
                Ok(()) => println!("OK"),
                Err(e) => println!("ERR {e:#}"),
            },
            "STATS" => println!("{store:?}"),
            "EXIT" | "QUIT" => {
                println!("bye");
                break;
            }
            other => println!("ERR unknown command: {other}"),
        }
        stdout.flush()?;
    }

    Ok(())
}
