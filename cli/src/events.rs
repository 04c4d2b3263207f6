// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::cell::RefCell;
use std::io::Stdout;

use edl::types::{FlashEvents, FlashPhase};
use owo_colors::OwoColorize;
use pbr::{ProgressBar, Units};

/// Renders the library's event stream on the terminal: phase banners,
/// a transfer bar for the active task, dimmed trace lines.
pub struct ConsoleEvents {
    bar: RefCell<Option<ProgressBar<Stdout>>>,
    quiet: bool,
}

impl ConsoleEvents {
    pub fn new(quiet: bool) -> Self {
        ConsoleEvents {
            bar: RefCell::new(None),
            quiet,
        }
    }

    fn drop_bar(&self) {
        if let Some(mut bar) = self.bar.borrow_mut().take() {
            bar.finish();
            println!();
        }
    }
}

impl FlashEvents for ConsoleEvents {
    fn phase(&self, phase: FlashPhase, msg: &str) {
        self.drop_bar();
        if msg.is_empty() {
            println!("{} {}", "==>".bright_blue(), phase.to_string().bright_white());
        } else {
            println!(
                "{} {}: {}",
                "==>".bright_blue(),
                phase.to_string().bright_white(),
                msg
            );
        }
    }

    fn progress(&self, current_bytes: u64, total_bytes: u64) {
        let mut slot = self.bar.borrow_mut();

        let stale = slot.as_ref().map(|b| b.total != total_bytes).unwrap_or(true);
        if stale {
            let mut bar = ProgressBar::new(total_bytes);
            bar.set_units(Units::Bytes);
            *slot = Some(bar);
        }

        if let Some(bar) = slot.as_mut() {
            bar.set(current_bytes);
            if current_bytes >= total_bytes {
                bar.finish();
                *slot = None;
                println!();
            }
        }
    }

    fn log(&self, line: &str) {
        if !self.quiet {
            println!("{}", line.bright_black());
        }
    }
}
