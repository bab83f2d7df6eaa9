//! Bus transport seam
//!
//! The harness talks to hardware through the [`CanBus`] trait: send, frame
//! reception, periodic-task management, filters, and channel identity. A
//! [`Notifier`] drains received frames from a bus on a background thread and
//! fans them out to any number of buffered [`Listener`]s, so receive-side
//! consumers never block the transport's own receive path.

use crate::types::{CanFrame, HarnessError, Result, Timestamp};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the notifier thread blocks per receive attempt
const NOTIFIER_POLL: Duration = Duration::from_millis(100);

/// A frame filter installed on a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFilter {
    /// CAN id to match
    pub can_id: u32,
    /// Mask applied to both sides before comparison
    pub can_mask: u32,
    /// True for 29-bit extended ids
    pub extended: bool,
}

impl FrameFilter {
    /// Match-all mask filter for one id
    pub fn for_id(can_id: u32) -> Self {
        Self {
            can_id,
            can_mask: 0x1FFF_FFFF,
            extended: can_id > 0x7FF,
        }
    }

    /// Check a frame against this filter
    pub fn matches(&self, frame: &CanFrame) -> bool {
        frame.can_id & self.can_mask == self.can_id & self.can_mask
    }
}

/// A transport-level fault surfaced after connect
///
/// Faults are data, not `Err` returns: the notifier accumulates them and the
/// channel supervisor drains the record on its poll cycle.
#[derive(Debug, Clone)]
pub struct BusFault {
    /// When the fault was observed
    pub at: Timestamp,
    /// Transport-provided description
    pub description: String,
}

/// A transport-managed repeating transmission
///
/// Owns an ordered list of fully-encoded frames replayed on a fixed timer
/// without host intervention. The frame list is replaced wholesale via
/// [`PeriodicTask::modify_data`]; the timer never observes a partial update.
#[derive(Debug)]
pub struct PeriodicTask {
    arbitration_id: u32,
    period: Duration,
    frames: Mutex<Vec<CanFrame>>,
    fault: Mutex<Option<BusFault>>,
    stopped: AtomicBool,
}

impl PeriodicTask {
    /// Create a task for a frame rotation at a fixed period
    pub fn new(arbitration_id: u32, period: Duration, frames: Vec<CanFrame>) -> Self {
        Self {
            arbitration_id,
            period,
            frames: Mutex::new(frames),
            fault: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Arbitration id this task transmits under
    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    /// Replay period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Snapshot of the queued frames
    pub fn frames(&self) -> Vec<CanFrame> {
        self.frames.lock().expect("periodic task lock poisoned").clone()
    }

    /// Atomically replace the queued frames
    pub fn modify_data(&self, frames: Vec<CanFrame>) {
        *self.frames.lock().expect("periodic task lock poisoned") = frames;
    }

    /// Record a transport fault on this task
    pub fn set_fault(&self, fault: BusFault) {
        *self.fault.lock().expect("periodic task lock poisoned") = Some(fault);
    }

    /// Take the recorded fault, if any
    pub fn take_fault(&self) -> Option<BusFault> {
        self.fault.lock().expect("periodic task lock poisoned").take()
    }

    /// Stop replaying
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// True once stopped
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// The hardware transport seam
///
/// Implementations wrap one hardware channel. All methods take `&self`;
/// implementations are internally synchronized so a bus handle can be shared
/// between a controller and its notifier thread.
pub trait CanBus: Send + Sync {
    /// Send a single frame, blocking until the transport accepts it
    fn send(&self, frame: &CanFrame) -> Result<()>;

    /// Install a repeating transmission of a frame rotation
    fn send_periodic(&self, frames: Vec<CanFrame>, period: Duration) -> Result<Arc<PeriodicTask>>;

    /// Currently installed periodic tasks
    fn periodic_tasks(&self) -> Vec<Arc<PeriodicTask>>;

    /// Cancel every periodic send
    fn stop_all_periodic_tasks(&self);

    /// Install receive-side frame filters (empty slice clears them)
    fn set_filters(&self, filters: &[FrameFilter]);

    /// Receive one frame, blocking up to `timeout`. `Ok(None)` on timeout;
    /// `Err` surfaces a transport fault.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>>;

    /// Channel identity string (e.g. "sim:1")
    fn channel_info(&self) -> String;

    /// True if the channel is CAN-FD capable
    fn supports_fd(&self) -> bool;

    /// Release the hardware channel
    fn shutdown(&self);
}

struct ListenerEntry {
    id: u64,
    sender: Sender<CanFrame>,
}

struct NotifierShared {
    listeners: Mutex<Vec<ListenerEntry>>,
    faults: Mutex<Vec<BusFault>>,
    stop: AtomicBool,
    next_id: AtomicU64,
}

/// Push-based frame delivery
///
/// Owns a background thread that drains the bus and dispatches each received
/// frame to every registered listener. Errors from the transport are
/// recorded as [`BusFault`]s for the supervisor to drain.
pub struct Notifier {
    shared: Arc<NotifierShared>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    /// Start a notifier thread for a bus
    pub fn new(bus: Arc<dyn CanBus>) -> Self {
        let shared = Arc::new(NotifierShared {
            listeners: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let channel = bus.channel_info();
        let handle = std::thread::Builder::new()
            .name(format!("can-harness.notifier '{}'", channel))
            .spawn(move || notifier_loop(bus, thread_shared))
            .expect("failed to spawn notifier thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Register a new buffered listener
    pub fn add_listener(&self) -> Listener {
        let (sender, receiver) = mpsc::channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .push(ListenerEntry { id, sender });
        Listener { id, receiver }
    }

    /// Unregister a listener
    pub fn remove_listener(&self, listener: &Listener) {
        self.shared
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|entry| entry.id != listener.id);
    }

    /// Drain the accumulated transport fault record
    pub fn take_faults(&self) -> Vec<BusFault> {
        std::mem::take(&mut *self.shared.faults.lock().expect("fault lock poisoned"))
    }

    /// Stop the notifier thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn notifier_loop(bus: Arc<dyn CanBus>, shared: Arc<NotifierShared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        match bus.recv(NOTIFIER_POLL) {
            Ok(Some(frame)) => {
                let mut listeners = shared.listeners.lock().expect("listener lock poisoned");
                // A failed send means the listener was dropped; prune it.
                listeners.retain(|entry| entry.sender.send(frame.clone()).is_ok());
            }
            Ok(None) => {}
            Err(e) => {
                log::debug!("Notifier on '{}': transport fault: {}", bus.channel_info(), e);
                shared
                    .faults
                    .lock()
                    .expect("fault lock poisoned")
                    .push(BusFault {
                        at: Utc::now(),
                        description: e.to_string(),
                    });
                std::thread::sleep(NOTIFIER_POLL);
            }
        }
    }
}

/// A buffered receive endpoint fed by a [`Notifier`]
pub struct Listener {
    id: u64,
    receiver: Receiver<CanFrame>,
}

impl Listener {
    /// Receive one frame, blocking up to `timeout`
    pub fn recv(&self, timeout: Duration) -> Option<CanFrame> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take whatever is buffered right now without blocking
    pub fn drain(&self) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Current time in nanoseconds since epoch, for frame receive stamps
pub fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
}

/// Convenience constructor for a transport error
pub fn transport_error(reason: impl Into<String>) -> HarnessError {
    HarnessError::Transport(reason.into())
}
