// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Help text.

use crate::output;

pub fn print_usage() {
    println!(
        "{} {} - cooperative threads on a simulated single CPU",
        output::title("spindle"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!(
        "{}: {} {} {} {}",
        output::section_header("Usage"),
        output::command("spindle"),
        output::arg("[options]"),
        output::arg("<command>"),
        output::arg("[args]")
    );
    println!();
    println!("{}", output::section_header("Commands:"));
    println!("  {} {} Run kernel self-tests (all suites by default)", output::command("selftest"), output::arg("[suite..]"));
    println!("  {}               List self-test suites and cases", output::command("list"));
    println!("  {}               Show this help", output::command("help"));
    println!("  {}            Show version", output::command("version"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {} {}  Ticks added per interrupt enable (default 10)", output::arg("--kernel-tick"), output::arg("<n>"));
    println!("  {} {} Ticks between timer interrupts (default 500)", output::arg("--timer-interval"), output::arg("<n>"));
    println!("  {}     Idle forever instead of reporting deadlock", output::arg("--no-deadlock"));
    println!("  {}                Trace kernel events to stderr", output::arg("--debug"));
    println!("  {}                Also trace context switches and interrupts", output::arg("--trace"));
    println!();
    println!("{}", output::section_header("Environment:"));
    println!("  SPINDLE_KERNEL_TICK, SPINDLE_TIMER_INTERVAL, SPINDLE_DETECT_DEADLOCK");
    println!("  NO_COLOR, FORCE_COLOR");
}
