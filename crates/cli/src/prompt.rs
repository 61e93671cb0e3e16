//! Interactive conflict prompt for the `ask` strategy.

use console::Term;
use dialoguer::Select;
use diffy::PatchFormatter;

use confsync_core::conflict::merger::ROOT_KEY;
use confsync_core::conflict::{Choice, ConflictPrompt};
use confsync_core::models::ConflictRecord;

use crate::style;

/// Shows a diff of both sides and asks which to keep.
pub struct TerminalPrompt;

impl TerminalPrompt {
    /// Whether stdin/stdout are attached to a terminal.
    pub fn available() -> bool {
        Term::stdout().is_term() && Term::stderr().is_term()
    }
}

impl ConflictPrompt for TerminalPrompt {
    fn choose(&self, record: &ConflictRecord, merged: Option<&[u8]>) -> Choice {
        println!();
        println!("{}", style::warn(&format!("Conflict in {}", record.path)));
        if !record.conflicting_keys.is_empty() && record.conflicting_keys != [ROOT_KEY] {
            println!("  {}", style::dim(&format!("conflicting keys: {}", record.conflicting_keys.join(", "))));
        }
        print_diff(&record.local_content, &record.remote_content);

        let mut options = vec![("Keep local", Choice::Local), ("Take remote", Choice::Remote)];
        if merged.is_some() {
            options.push(("Use merged", Choice::Merge));
        }
        options.push(("Skip", Choice::Skip));
        let labels: Vec<&str> = options.iter().map(|(label, _)| *label).collect();

        let picked = Select::new()
            .with_prompt(format!("Resolve {}", record.path))
            .items(&labels)
            .default(labels.len() - 1)
            .interact_on(&Term::stderr());

        match picked {
            Ok(index) => options[index].1,
            Err(e) => {
                eprintln!("{}", style::error(&format!("prompt failed ({e}), skipping")));
                Choice::Skip
            }
        }
    }
}

fn print_diff(local: &[u8], remote: &[u8]) {
    match (std::str::from_utf8(local), std::str::from_utf8(remote)) {
        (Ok(local), Ok(remote)) => {
            let patch = diffy::create_patch(local, remote);
            let formatter = PatchFormatter::new().with_color();
            println!("{}", style::dim("--- local / +++ remote"));
            println!("{}", formatter.fmt_patch(&patch));
        }
        _ => println!(
            "  {}",
            style::dim(&format!(
                "binary content: local {} bytes, remote {} bytes",
                local.len(),
                remote.len()
            ))
        ),
    }
}
