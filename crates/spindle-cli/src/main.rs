// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! spindle CLI: boot kernels and run their self-tests.

mod commands;
mod help;
mod output;
mod suites;

use std::env;
use std::process;

use spindle_threads::KernelConfig;
use tracing::Level;

struct Options {
    kernel_tick: Option<u64>,
    timer_interval: Option<u64>,
    detect_deadlock: Option<bool>,
    log_level: Level,
    rest: Vec<String>,
}

fn main() {
    output::init();

    let opts = match parse_options(env::args().skip(1)) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}: {}", output::error_label(), msg);
            help::print_usage();
            process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_max_level(opts.log_level)
        .init();

    let mut config = KernelConfig::from_env();
    if let Some(ticks) = opts.kernel_tick {
        config.machine.kernel_tick = ticks;
    }
    if let Some(ticks) = opts.timer_interval {
        config.machine.timer_interval = ticks;
    }
    if let Some(on) = opts.detect_deadlock {
        config.detect_deadlock = on;
    }

    let Some(cmd) = opts.rest.first() else {
        help::print_usage();
        return;
    };

    match cmd.as_str() {
        "selftest" | "test" => {
            let ok = commands::selftest::cmd_selftest(&opts.rest[1..], config);
            if !ok {
                process::exit(1);
            }
        }
        "list" => commands::selftest::cmd_list(),
        "help" | "--help" | "-h" => help::print_usage(),
        "version" | "--version" | "-V" => {
            println!("spindle {}", env!("CARGO_PKG_VERSION"));
        }
        other => {
            eprintln!("{}: unknown command: {}", output::error_label(), other);
            help::print_usage();
            process::exit(1);
        }
    }
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut opts = Options {
        kernel_tick: None,
        timer_interval: None,
        detect_deadlock: None,
        log_level: Level::WARN,
        rest: Vec::new(),
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--kernel-tick" => opts.kernel_tick = Some(ticks_value(&arg, args.next())?),
            "--timer-interval" => opts.timer_interval = Some(ticks_value(&arg, args.next())?),
            "--no-deadlock" => opts.detect_deadlock = Some(false),
            "--debug" | "-d" => opts.log_level = Level::DEBUG,
            "--trace" => opts.log_level = Level::TRACE,
            _ => opts.rest.push(arg),
        }
    }
    Ok(opts)
}

fn ticks_value(flag: &str, value: Option<String>) -> Result<u64, String> {
    let value = value.ok_or_else(|| format!("{flag} needs a value"))?;
    match value.parse::<u64>() {
        Ok(0) | Err(_) => Err(format!("{flag} expects a positive number of ticks, got `{value}`")),
        Ok(n) => Ok(n),
    }
}
