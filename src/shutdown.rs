// src/shutdown.rs

use std::time::Duration;
use tokio::sync::watch;

/// Sleep for `duration` unless shutdown is signalled first. Returns true
/// when the caller should exit. Long backoff sleeps go through here so a
/// blocked retry loop still reacts to process shutdown.
pub async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => match changed {
            Ok(()) => *shutdown.borrow(),
            // Sender dropped: the process is going away
            Err(_) => true,
        },
    }
}
