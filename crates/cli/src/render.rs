//! Tables and summaries printed by the CLI.

use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use confsync_core::backup::SnapshotInfo;
use confsync_core::git::{CommitInfo, TransportStatus};
use confsync_core::models::SyncResult;

use crate::style;

/// Print the outcome of a pull, push or sync.
pub fn sync_result(result: &SyncResult) {
    println!();
    let headline = if result.dry_run {
        format!("{} {}", style::dry_run(), result.message)
    } else {
        result.message.clone()
    };
    if result.success {
        println!("{}", style::success(&headline));
    } else {
        println!("{}", style::error(&headline));
    }

    println!("  Pulled     {}", result.pulled_count);
    println!("  Pushed     {}", result.pushed_count);

    if !result.conflicts.is_empty() {
        println!();
        println!("{}", style::header(&format!("Conflicts ({})", result.conflicts.len())));
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["File", "Keys", "Status"]);
        for c in &result.conflicts {
            let keys = if c.conflicting_keys.is_empty() {
                "-".to_string()
            } else {
                c.conflicting_keys.join(", ")
            };
            let status = if c.is_resolved() {
                Cell::new("✓ resolved").fg(Color::Green)
            } else {
                Cell::new("⧗ unresolved").fg(Color::Yellow)
            };
            table.add_row(vec![Cell::new(&c.path), Cell::new(keys), status]);
        }
        println!("{table}");
    }

    if !result.errors.is_empty() {
        println!();
        println!("{}", style::header(&format!("Errors ({})", result.errors.len())));
        for e in &result.errors {
            println!("  {}", style::error(e));
        }
    }
    println!();
}

pub fn snapshots(snapshots: &[SnapshotInfo]) {
    if snapshots.is_empty() {
        println!("No snapshots found.");
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Taken", "Files"]);
    for s in snapshots {
        table.add_row(vec![
            Cell::new(&s.id),
            Cell::new(s.timestamp.format("%Y-%m-%d %H:%M:%S UTC")),
            Cell::new(s.files.len()),
        ]);
    }
    println!("{table}");
}

pub fn commits(commits: &[CommitInfo]) {
    if commits.is_empty() {
        println!("No sync history found.");
        return;
    }
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Commit", "Date", "Author", "Message"]);
    for c in commits {
        let short = if c.hash.len() > 7 { &c.hash[..7] } else { &c.hash };
        table.add_row(vec![
            Cell::new(short),
            Cell::new(c.date.format("%Y-%m-%d %H:%M")),
            Cell::new(&c.author),
            Cell::new(c.summary()),
        ]);
    }
    println!("{table}");
}

pub fn transport_status(status: &TransportStatus) {
    println!("  Ahead      {}", status.ahead);
    println!("  Behind     {}", status.behind);
    println!("  Staged     {}", status.staged);
    println!("  Untracked  {}", status.untracked);
    if status.conflicted > 0 {
        println!("  {}", style::warn(&format!("{} conflicted path(s) in mirror", status.conflicted)));
    }
}
