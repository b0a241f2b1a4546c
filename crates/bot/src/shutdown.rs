//! Ctrl-C handling: the first signal requests a graceful stop (drain
//! in-flight work), a second one exits immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

pub fn spawn_signal_handler(stop: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!(
            "Stop requested — finishing in-flight work before exiting (press CTRL+C again to exit immediately)."
        );
        stop.store(true, Ordering::SeqCst);

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stop requested again — exiting immediately.");
            std::process::exit(130);
        }
    })
}
