// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Self-test command.

use std::panic;

use colored::Colorize;
use spindle_threads::{Kernel, KernelConfig, KernelError};

use crate::output;
use crate::suites::{self, Case, Expect, Suite, SUITES};

/// Run the named suites, or all of them. Returns false if anything failed.
pub fn cmd_selftest(names: &[String], config: KernelConfig) -> bool {
    let selected: Vec<&Suite> = if names.is_empty() {
        SUITES.iter().collect()
    } else {
        let mut selected = Vec::new();
        for name in names {
            match suites::find(name) {
                Some(suite) => selected.push(suite),
                None => {
                    eprintln!("{}: no such suite: {}", output::error_label(), name);
                    return false;
                }
            }
        }
        selected
    };

    let mut passed = 0;
    let mut failed = Vec::new();

    for suite in selected {
        println!("{}", output::suite_name(suite.name));
        for case in suite.cases {
            match run_case(case, config) {
                Ok(detail) => {
                    passed += 1;
                    println!("  {} {} - {} {}", output::status_pass(), case.name, case.about, detail);
                }
                Err(why) => {
                    println!("  {} {} - {}", output::status_fail(), case.name, case.about);
                    println!("      {}", why.red());
                    failed.push(format!("{}::{}", suite.name, case.name));
                }
            }
        }
        println!();
    }

    println!("{}", output::separator(50));
    println!(
        "{}, {}",
        output::passed_count(passed),
        output::failed_count(failed.len())
    );
    for name in &failed {
        println!("  {} {}", output::status_fail(), name);
    }
    failed.is_empty()
}

/// Boot a kernel for one case and judge how it ended.
fn run_case(case: &Case, config: KernelConfig) -> Result<String, String> {
    let expected_panic = matches!(case.expect, Expect::Panic(_));
    if expected_panic {
        panic::set_hook(Box::new(|_| {}));
    }
    let outcome = Kernel::builder().config(config).run(|kernel| {
        let start = kernel.time();
        (case.run)(kernel);
        kernel.time() - start
    });
    if expected_panic {
        let _ = panic::take_hook();
    }

    match (case.expect, outcome) {
        (Expect::Pass, Ok(ticks)) => Ok(output::ticks(ticks).to_string()),
        (Expect::Pass, Err(err)) => Err(err.to_string()),
        (Expect::Panic(want), Err(KernelError::ThreadPanicked { thread, message }))
            if message.contains(want) =>
        {
            Ok(format!("({} asserted)", thread).dimmed().to_string())
        }
        (Expect::Panic(want), Err(err)) => Err(format!("expected an assertion containing `{want}`, got: {err}")),
        (Expect::Panic(want), Ok(_)) => Err(format!("expected an assertion containing `{want}`, but the case passed")),
    }
}

pub fn cmd_list() {
    for suite in SUITES {
        println!("{}", output::suite_name(suite.name));
        for case in suite.cases {
            let note = match case.expect {
                Expect::Pass => String::new(),
                Expect::Panic(_) => " (expects an assertion)".dimmed().to_string(),
            };
            println!("  {} - {}{}", output::command(case.name), case.about, note);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_case_behaves_as_expected() {
        for suite in SUITES {
            for case in suite.cases {
                if let Err(why) = run_case(case, KernelConfig::default()) {
                    panic!("{}::{} failed: {}", suite.name, case.name, why);
                }
            }
        }
    }

    #[test]
    fn unknown_suite_is_rejected() {
        assert!(!cmd_selftest(&["nope".to_string()], KernelConfig::default()));
    }

    #[test]
    fn suite_names_are_unique() {
        for (i, a) in SUITES.iter().enumerate() {
            assert!(SUITES[i + 1..].iter().all(|b| b.name != a.name));
            assert!(suites::find(a.name).is_some());
        }
    }
}
