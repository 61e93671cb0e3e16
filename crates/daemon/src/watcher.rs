//! Filesystem watcher feeding raw change events to the debouncer.

use std::path::Path;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Watch `root` recursively and send `()` on `tx` for every content change.
///
/// The returned watcher must be kept alive for events to keep flowing. A
/// full channel drops the event, which is harmless since the debouncer only
/// needs to know that something changed.
pub fn watch(root: &Path, tx: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if is_relevant(&event) => {
            debug!(paths = ?event.paths, kind = ?event.kind, "file change");
            let _ = tx.try_send(());
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "file watcher error"),
    })?;

    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn test_access_events_are_ignored() {
        let event = Event::new(EventKind::Access(AccessKind::Any));
        assert!(!is_relevant(&event));
        assert!(!is_relevant(&Event::new(EventKind::Other)));
    }

    #[test]
    fn test_content_events_are_relevant() {
        assert!(is_relevant(&Event::new(EventKind::Create(CreateKind::File))));
        assert!(is_relevant(&Event::new(EventKind::Modify(ModifyKind::Any))));
    }
}
