//! The idle sweeper: a background thread that periodically removes idle pages from the buffer
//! pools.

use crossbeam_channel::{Receiver, Sender};
use std::{sync::Arc, thread::JoinHandle, time::Duration};

use crate::pool::Pool;

pub struct Sweeper {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start sweeping every `interval`, evicting clean unpinned pages idle for longer than `ttl`.
    pub fn start(pool: Arc<Pool>, interval: Duration, ttl: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let handle = std::thread::Builder::new()
            .name("pagestore-sweeper".into())
            .spawn(move || run(pool, shutdown_rx, interval, ttl))?;
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop the sweeper and wait for its thread to exit.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the shutdown channel.
        self.shutdown_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("idle sweeper panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(pool: Arc<Pool>, shutdown_rx: Receiver<()>, interval: Duration, ttl: Duration) {
    let ticker = crossbeam_channel::tick(interval);
    loop {
        crossbeam_channel::select! {
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> _ => {
                let evicted = pool.evict_idle(ttl);
                if evicted > 0 {
                    tracing::debug!(evicted, "idle sweep");
                }
            },
        }
    }
}
