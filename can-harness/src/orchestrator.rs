//! Multi-worker channel orchestration
//!
//! Splits a channel-configuration set into fixed-size chunks and hands each
//! chunk to an independently running worker. Every worker privately builds
//! its own controllers, connects, starts recording, and runs its own
//! [`ChannelSupervisor`] loop; controller objects wrap live hardware handles
//! and never cross the worker boundary. Cross-worker coordination is limited
//! to a shared stop flag and an informational connected-channel counter.

use crate::config::{ChannelConfig, RecordingConfig};
use crate::controller::{BusConnector, CanController};
use crate::db::Database;
use crate::supervisor::ChannelSupervisor;
use crate::types::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Default number of channels per worker.
///
/// Bounds how many hardware channels one worker manages, limiting the blast
/// radius of a crashed worker.
pub const DEFAULT_CHUNK_SIZE: usize = 4;

/// Split items into consecutive chunks of at most `chunk_size` elements.
///
/// Every item lands in exactly one chunk; the chunks concatenated reproduce
/// the input order.
pub fn split_into_chunks<T>(items: Vec<T>, chunk_size: usize) -> Vec<Vec<T>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(chunk_size));
    let mut current = Vec::with_capacity(chunk_size);
    for item in items {
        current.push(item);
        if current.len() == chunk_size {
            chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Handle to a running set of recording workers
pub struct Orchestrator {
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicUsize>,
    workers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Partition `configs` into chunks and start one worker per chunk.
    ///
    /// Each worker connects its channels, starts recording under
    /// `recording`, and supervises them until [`Orchestrator::stop`].
    pub fn start(
        configs: Vec<ChannelConfig>,
        chunk_size: usize,
        connector: BusConnector,
        recording: RecordingConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicUsize::new(0));
        let chunks = split_into_chunks(configs, chunk_size);

        let mut workers = Vec::with_capacity(chunks.len());
        for (worker_idx, chunk) in chunks.into_iter().enumerate() {
            let names: Vec<&str> = chunk.iter().map(|c| c.name.as_str()).collect();
            log::info!("Starting worker {} for channels {:?}", worker_idx, names);

            let stop = Arc::clone(&stop);
            let connected = Arc::clone(&connected);
            let connector = Arc::clone(&connector);
            let recording = recording.clone();
            let handle = std::thread::Builder::new()
                .name(format!("can-harness.worker-{}", worker_idx))
                .spawn(move || run_worker(chunk, connector, recording, &stop, &connected))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        log::info!("Started {} worker(s)", workers.len());
        Ok(Self {
            stop,
            connected,
            workers,
        })
    }

    /// How many channels are currently connected across all workers.
    /// Informational only; workers update it as channels come and go.
    pub fn connected_channels(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of workers started
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker to stop and wait for them to wind down.
    ///
    /// Cancellation is cooperative: workers observe the flag once per poll
    /// interval, so shutdown can take up to one interval per worker.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// One worker: private controllers, private supervisor, shared flags only
fn run_worker(
    configs: Vec<ChannelConfig>,
    connector: BusConnector,
    recording: RecordingConfig,
    stop: &AtomicBool,
    connected: &AtomicUsize,
) {
    let mut supervisor = ChannelSupervisor::new(recording);

    for config in configs {
        let controller = if config.db_path.is_some() {
            match CanController::new(config.clone(), Arc::clone(&connector)) {
                Ok(controller) => controller,
                Err(e) => {
                    log::error!("Channel '{}': {}", config.name, e);
                    continue;
                }
            }
        } else if config.is_fd.is_some() {
            // No database: raw-frame operations only
            CanController::with_database(config, Arc::new(Database::new()), Arc::clone(&connector))
        } else {
            log::error!(
                "Channel '{}': either 'db_path' or 'is_fd' must be set",
                config.name
            );
            continue;
        };
        supervisor.add_channel(controller);
    }

    let count = supervisor.connect_all();
    connected.fetch_add(count, Ordering::SeqCst);
    supervisor.start_recording_all();

    supervisor.run(stop);

    connected.fetch_sub(supervisor.connected_count(), Ordering::SeqCst);
    supervisor.stop_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_every_item_once() {
        let items: Vec<u32> = (0..10).collect();
        let chunks = split_into_chunks(items, 4);

        assert_eq!(chunks.len(), 3); // ceil(10 / 4)
        assert!(chunks.iter().all(|c| c.len() <= 4));

        let flattened: Vec<u32> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_chunks_exact_multiple() {
        let chunks = split_into_chunks((0..8).collect::<Vec<u32>>(), 4);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4);
        assert_eq!(chunks[1].len(), 4);
    }

    #[test]
    fn test_chunks_smaller_than_one() {
        let chunks = split_into_chunks(vec![1, 2, 3], 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_empty_input_no_chunks() {
        let chunks = split_into_chunks(Vec::<u32>::new(), 4);
        assert!(chunks.is_empty());
    }
}
