//! Periodic maintenance threads: quota flush, deleted-file cleanup and the
//! compaction worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::Meta;
use crate::context::Context;
use crate::error::Result;

const TICK: Duration = Duration::from_millis(100);

/// Handles of the running maintenance threads.
pub struct BackgroundWorkers {
    meta: Arc<Meta>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Sleep for `period` in short ticks; false once shutdown was requested.
fn wait(shutdown: &AtomicBool, period: Duration) -> bool {
    let mut remaining = period;
    while remaining > Duration::ZERO {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(TICK);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !shutdown.load(Ordering::Relaxed)
}

fn spawn_periodic<F>(name: &str, period: Duration, shutdown: Arc<AtomicBool>, mut job: F) -> Result<JoinHandle<()>>
where
    F: FnMut() + Send + 'static,
{
    let label = name.to_string();
    let handle = std::thread::Builder::new().name(label.clone()).spawn(move || {
        debug!("{} thread started, period={:?}", label, period);
        while wait(&shutdown, period) {
            job();
        }
        debug!("{} thread shutting down", label);
    })?;
    Ok(handle)
}

impl Meta {
    /// Start the maintenance threads. Periodic jobs use the periods from the
    /// configuration; a zero period disables that job.
    pub fn start_background(self: &Arc<Self>) -> Result<BackgroundWorkers> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        let ctx = Context::background();

        if !self.config.read_only && self.config.quota_flush_period_ms > 0 {
            let meta = self.clone();
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "chunkmeta-quota",
                self.config.quota_flush_period(),
                shutdown.clone(),
                move || {
                    if let Err(e) = meta.flush_quotas(&ctx) {
                        warn!("Flush quotas: {}", e);
                    }
                    if let Err(e) = meta.load_quotas(&ctx) {
                        warn!("Load quotas: {}", e);
                    }
                },
            )?);
        }

        if !self.config.read_only && self.config.cleanup_period_ms > 0 {
            let meta = self.clone();
            let ctx = ctx.clone();
            handles.push(spawn_periodic(
                "chunkmeta-cleanup",
                self.config.cleanup_period(),
                shutdown.clone(),
                move || {
                    if let Err(e) = meta.cleanup_deleted_files(&ctx) {
                        warn!("Clean up deleted files: {}", e);
                    }
                },
            )?);
        }

        if !self.config.read_only {
            let (tx, rx) = mpsc::channel::<(u64, u32)>();
            let meta = self.clone();
            let stop = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name("chunkmeta-compact".to_string())
                .spawn(move || {
                    debug!("Compaction worker started");
                    while !stop.load(Ordering::Relaxed) {
                        match rx.recv_timeout(TICK) {
                            Ok((ino, indx)) => {
                                if let Err(e) = meta.compact_chunk(&ctx, ino, indx, false) {
                                    warn!("compact {}:{}: {}", ino, indx, e);
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    debug!("Compaction worker shutting down");
                })?;
            handles.push(handle);
            *self.compact_queue.lock() = Some(tx);
        }

        Ok(BackgroundWorkers {
            meta: self.clone(),
            shutdown,
            handles,
        })
    }
}

impl BackgroundWorkers {
    /// Signal every thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.meta.compact_queue.lock().take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}
