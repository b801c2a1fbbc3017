//! Conformance test harness.
//!
//! Runs the end-to-end scenarios and exits with the count of failures
//! (0 on success, 1 on usage error).

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ldm7-sim", about = "LDM-7 core conformance scenarios")]
struct Args {
    /// Log at info level.
    #[arg(short = 'v')]
    verbose: bool,

    /// Log at debug level.
    #[arg(short = 'x')]
    debug: bool,

    /// Log destination: a file path, or "-" for standard error.
    #[arg(short = 'l', default_value = "-")]
    log_dest: String,

    /// Run only scenarios whose name contains this substring.
    filter: Option<String>,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if args.log_dest == "-" || args.log_dest.is_empty() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        match std::fs::File::create(&args.log_dest) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::sync::Arc::new(file))
                    .with_ansi(false)
                    .init();
            }
            Err(e) => {
                eprintln!("cannot open log destination {}: {e}", args.log_dest);
                return ExitCode::from(1);
            }
        }
    }

    let mut failures: u8 = 0;
    for scenario in ldm7_sim::all() {
        if let Some(filter) = &args.filter {
            if !scenario.name.contains(filter.as_str()) {
                continue;
            }
        }
        print!("{:<32} ", scenario.name);
        match (scenario.run)() {
            Ok(()) => println!("PASS"),
            Err(why) => {
                println!("FAIL: {why}");
                failures = failures.saturating_add(1);
            }
        }
    }
    ExitCode::from(failures)
}
