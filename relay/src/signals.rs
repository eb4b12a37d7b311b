//! Turn interrupt and terminate signals into a stop flag.
//!
//! The first signal asks the agent loop to stop at its next poll, which drops
//! the lock guard normally. A second signal exits at once; the kernel still
//! releases the flock.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Exit status after a forced second signal.
const FORCED_EXIT: i32 = 130;

/// Watch for signals on a background thread and raise `stop` on the first.
pub fn stop_on_signal(stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("relay-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = next_signal().await {
                        warn!(err = %err, "signal handler unavailable");
                        return;
                    }
                    if stop.swap(true, Ordering::Relaxed) {
                        warn!("second signal, exiting now");
                        std::process::exit(FORCED_EXIT);
                    }
                    info!("stop requested, finishing the current round");
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
        _ = hangup.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
