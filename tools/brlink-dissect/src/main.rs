//! Decode captured braille display traffic.
//!
//! ```text
//! brlink-dissect --model fx capture.txt
//! ```

mod dissect;

use anyhow::Context;
use clap::Parser;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use brlink::model::ModelRegistry;
use brlink::tracing::{self, prelude::*};
use dissect::{parse_line, Dissector};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Display model whose grammar the capture uses.
    #[arg(short, long, default_value = "fx")]
    model: String,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,

    /// Print the registered models and exit.
    #[arg(long)]
    list_models: bool,

    /// Capture file; standard input when omitted.
    capture: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing::init_stderr(tracing::LevelFilter::WARN);
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    if args.list_models {
        for desc in ModelRegistry::all() {
            println!("{:<6} {}", desc.name, desc.description);
        }
        return Ok(());
    }

    let desc = ModelRegistry::find(&args.model)
        .with_context(|| format!("unknown model {:?}", args.model))?;
    let mut dissector = Dissector::new((desc.create)());

    let input: Box<dyn BufRead> = match &args.capture {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut packets = 0usize;
    for (number, line) in input.lines().enumerate() {
        let line = line?;
        let chunk = match parse_line(&line) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping capture line");
                continue;
            }
        };
        for packet in dissector.feed(&chunk) {
            println!("{packet}");
            packets += 1;
        }
    }

    if dissector.pending() > 0 {
        warn!(bytes = dissector.pending(), "Capture ends inside a packet");
    }
    debug!(packets, "Done");
    Ok(())
}
