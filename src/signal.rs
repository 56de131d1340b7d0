//! Shutdown signal handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Install a SIGINT/SIGTERM handler.
///
/// The returned flag turns `true` on the first signal. A second signal
/// exits the process immediately.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, exiting");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal");
    })?;

    Ok(shutdown)
}
