// Confirmation prompt shown before a procedure touches the eMMC

use crate::device::Device;
use crate::workflow::Confirmer;
use crate::Procedure;
use console::style;
use std::io::{self, BufRead, Write};

/// Asks on the terminal; `assume_yes` answers for the user (`--yes`)
pub struct TerminalConfirmer {
    assume_yes: bool,
}

impl TerminalConfirmer {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

/// The text shown above the prompt
pub fn confirmation_message(procedure: Procedure, device: &Device) -> String {
    format!(
        "Found target eMMC:\n\n  Path:  {}\n  Size:  {:.2} GB ({})\n  Model: {}\n\n{}",
        device.path,
        device.size_gb(),
        device.band.label(),
        device.model,
        procedure.confirmation_warning()
    )
}

pub(crate) fn accepts(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

impl Confirmer for TerminalConfirmer {
    fn confirm(&self, procedure: Procedure, device: &Device) -> bool {
        println!("\n{}", style(format!("=== Confirm {} ===", procedure.title())).bold());
        println!("{}", style(confirmation_message(procedure, device)).yellow());

        if self.assume_yes {
            println!("\nConfirmed by --yes");
            return true;
        }

        print!("\nType 'YES' to continue: ");
        if io::stdout().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(_) => accepts(&input),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read confirmation");
                false
            }
        }
    }
}
