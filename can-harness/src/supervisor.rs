//! Channel supervision and self-healing
//!
//! A polling loop over a group of channels: every second, each channel's
//! accumulated transport faults are drained; a faulted channel gets its
//! fault persisted to an error log, its recording stopped, the bus torn
//! down, reconnected from the original configuration, and recording resumed
//! under the same naming scheme. Recovery is channel-scoped — a fault on one
//! channel never interrupts another channel's recording. Reconnecting can
//! lose up to one poll interval of traffic on the affected channel; that
//! window is accepted.

use crate::config::RecordingConfig;
use crate::controller::CanController;
use crate::recorder::Recorder;
use crate::transport::BusFault;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Fixed supervisor poll period
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct SupervisedChannel {
    controller: CanController,
    recorder: Option<Recorder>,
    /// Set once recording was started; a disconnected channel with this flag
    /// is a failed recovery and gets retried on the next poll
    recording_wanted: bool,
}

/// Supervises a group of channels owned by one worker
pub struct ChannelSupervisor {
    channels: Vec<SupervisedChannel>,
    recording: RecordingConfig,
    error_log: PathBuf,
}

impl ChannelSupervisor {
    /// Create a supervisor recording under the given configuration
    pub fn new(recording: RecordingConfig) -> Self {
        let error_log = recording.root.join("can_harness_error.log");
        Self {
            channels: Vec::new(),
            recording,
            error_log,
        }
    }

    /// Take ownership of a channel's controller
    pub fn add_channel(&mut self, controller: CanController) {
        self.channels.push(SupervisedChannel {
            controller,
            recorder: None,
            recording_wanted: false,
        });
    }

    /// Number of supervised channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of currently connected channels
    pub fn connected_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.controller.is_connected())
            .count()
    }

    /// Connect every channel, returning how many succeeded.
    ///
    /// Per-channel connect failures are logged and the channel left for the
    /// poll loop to retry; they do not abort the others.
    pub fn connect_all(&mut self) -> usize {
        let mut connected = 0;
        for channel in &mut self.channels {
            match channel.controller.connect() {
                Ok(()) => connected += 1,
                Err(e) => {
                    log::error!(
                        "Channel '{}' failed to connect: {}",
                        channel.controller.name(),
                        e
                    );
                }
            }
        }
        connected
    }

    /// Start a recorder on every connected channel
    pub fn start_recording_all(&mut self) {
        for channel in &mut self.channels {
            if channel.recorder.is_some() {
                continue;
            }
            if let Some(notifier) = channel.controller.notifier() {
                match Recorder::start(notifier, channel.controller.name(), &self.recording) {
                    Ok(recorder) => {
                        log::info!(
                            "============ Bus '{}': recording started ============",
                            channel.controller.name()
                        );
                        channel.recorder = Some(recorder);
                        channel.recording_wanted = true;
                    }
                    Err(e) => {
                        log::error!(
                            "Bus '{}': failed to start recording: {}",
                            channel.controller.name(),
                            e
                        );
                    }
                }
            }
        }
    }

    /// Run the supervision loop until the shared stop flag is set.
    ///
    /// The flag is checked once per iteration, so shutdown latency is up to
    /// one poll interval.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            std::thread::sleep(POLL_INTERVAL);
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.poll_once();
        }
    }

    /// One supervision pass over every channel.
    ///
    /// Public so recovery can be exercised without waiting out the poll
    /// interval.
    pub fn poll_once(&mut self) {
        log::debug!("========== checking channel status ==========");
        for idx in 0..self.channels.len() {
            // A channel disconnected by a failed recovery retries here; a
            // connected channel is checked for fresh faults.
            if !self.channels[idx].controller.is_connected() {
                if self.channels[idx].recording_wanted {
                    self.recover(idx);
                }
                continue;
            }
            if self.channels[idx].controller.notifier().is_none() {
                continue;
            }
            let faults = self.channels[idx].controller.take_faults();
            if faults.is_empty() {
                continue;
            }
            log::error!(
                "Bus '{}': channel fault detected ==> connection abnormal",
                self.channels[idx].controller.name()
            );
            self.persist_fault_note(self.channels[idx].controller.name(), &faults);
            self.recover(idx);
        }
    }

    /// Stop recording and disconnect every channel
    pub fn stop_all(&mut self) {
        for channel in &mut self.channels {
            if let Some(recorder) = channel.recorder.take() {
                recorder.stop();
            }
            channel.controller.disconnect();
        }
    }

    /// Stop, reconnect and resume one channel. Failure leaves the channel
    /// disconnected; the next poll retries.
    fn recover(&mut self, idx: usize) {
        let channel = &mut self.channels[idx];
        let name = channel.controller.name().to_string();

        if let Some(recorder) = channel.recorder.take() {
            recorder.stop();
        }
        channel.controller.disconnect();

        match channel.controller.connect() {
            Ok(()) => {
                if let Some(notifier) = channel.controller.notifier() {
                    match Recorder::start(notifier, &name, &self.recording) {
                        Ok(recorder) => channel.recorder = Some(recorder),
                        Err(e) => log::error!("Bus '{}': failed to resume recording: {}", name, e),
                    }
                }
                log::info!("Bus '{}': connection re-established", name);
            }
            Err(e) => {
                log::error!("Bus '{}': failed to re-establish connection ==> {}", name, e);
            }
        }
    }

    /// Append a timestamped fault note to the error log, falling back to a
    /// second file when the first write fails
    fn persist_fault_note(&self, bus_name: &str, faults: &[BusFault]) {
        let log_time = Utc::now().format("%Y-%m-%d_%H:%M:%S");
        let mut note = String::new();
        for fault in faults {
            note.push_str(&format!("::: {}\n", fault.description));
        }
        note.push_str(&format!(
            "{} Bus '{}' ==> connection abnormal.\n",
            log_time, bus_name
        ));

        if let Err(e) = append_to(&self.error_log, &note) {
            log::error!("write {:?} exception: {}", self.error_log, e);
            let fallback = self
                .recording
                .root
                .join(format!("can_harness_error_{}.log", log_time));
            if let Err(e) = append_to(&fallback, &note) {
                log::error!("write {:?} exception: {}", fallback, e);
            }
        }
    }
}

fn append_to(path: &PathBuf, note: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(note.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::controller::BusConnector;
    use crate::db::Database;
    use crate::sim::SimulatedBus;
    use crate::transport::CanBus;
    use crate::types::CanFrame;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Connector that builds a fresh simulated bus per connect and remembers
    /// every bus it handed out, keyed by channel name
    fn tracking_connector() -> (BusConnector, Arc<Mutex<HashMap<String, Vec<Arc<SimulatedBus>>>>>) {
        let registry: Arc<Mutex<HashMap<String, Vec<Arc<SimulatedBus>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let connector: BusConnector = {
            let registry = Arc::clone(&registry);
            Arc::new(move |cfg: &ChannelConfig| {
                let bus = SimulatedBus::new(&cfg.name);
                registry
                    .lock()
                    .unwrap()
                    .entry(cfg.name.clone())
                    .or_default()
                    .push(Arc::clone(&bus));
                Ok(bus as Arc<dyn CanBus>)
            })
        };
        (connector, registry)
    }

    fn make_controller(name: &str, connector: &BusConnector) -> CanController {
        CanController::with_database(
            ChannelConfig::new(name, "sim", 1),
            Arc::new(Database::new()),
            Arc::clone(connector),
        )
    }

    #[test]
    fn test_self_heal_recovers_only_faulted_channel() {
        let tmp = tempfile::tempdir().unwrap();
        let (connector, registry) = tracking_connector();

        let mut supervisor = ChannelSupervisor::new(RecordingConfig::new(tmp.path()));
        supervisor.add_channel(make_controller("faulty", &connector));
        supervisor.add_channel(make_controller("healthy", &connector));

        assert_eq!(supervisor.connect_all(), 2);
        supervisor.start_recording_all();

        // Inject a fault on the first channel and give the notifier a moment
        // to record it
        {
            let reg = registry.lock().unwrap();
            reg["faulty"][0].inject_fault("bus heavy");
        }
        std::thread::sleep(Duration::from_millis(300));

        supervisor.poll_once();

        // Faulted channel reconnected on a fresh handle
        {
            let reg = registry.lock().unwrap();
            assert_eq!(reg["faulty"].len(), 2, "expected a reconnect");
            assert!(!reg["faulty"][0].is_open());
            assert!(reg["faulty"][1].is_open());
            // Healthy channel untouched: still on its first handle
            assert_eq!(reg["healthy"].len(), 1);
            assert!(reg["healthy"][0].is_open());
        }
        assert_eq!(supervisor.connected_count(), 2);

        // Both channels still record after recovery
        let healthy_dir = tmp
            .path()
            .join("can_bus_log")
            .join(Utc::now().format("%Y-%m-%d").to_string());
        {
            let reg = registry.lock().unwrap();
            reg["healthy"][0].inject_frame(CanFrame::new(0x7E0, vec![1]));
            reg["faulty"][1].inject_frame(CanFrame::new(0x7E1, vec![2]));
        }
        std::thread::sleep(Duration::from_millis(300));
        supervisor.stop_all();

        let read_dir_concat = |bus: &str| {
            let dir = healthy_dir.join(bus);
            let mut all = String::new();
            for entry in std::fs::read_dir(dir).unwrap() {
                all.push_str(&std::fs::read_to_string(entry.unwrap().path()).unwrap_or_default());
            }
            all
        };
        assert!(read_dir_concat("healthy").contains("0x7E0"));
        assert!(read_dir_concat("faulty").contains("0x7E1"));

        // Fault note persisted
        let error_log = tmp.path().join("can_harness_error.log");
        let note = std::fs::read_to_string(error_log).unwrap();
        assert!(note.contains("bus heavy"));
        assert!(note.contains("faulty"));
    }

    #[test]
    fn test_healthy_channels_are_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let (connector, registry) = tracking_connector();

        let mut supervisor = ChannelSupervisor::new(RecordingConfig::new(tmp.path()));
        supervisor.add_channel(make_controller("quiet", &connector));
        supervisor.connect_all();
        supervisor.start_recording_all();

        supervisor.poll_once();
        supervisor.poll_once();

        let reg = registry.lock().unwrap();
        assert_eq!(reg["quiet"].len(), 1, "no reconnect expected");
        drop(reg);
        supervisor.stop_all();
    }

    #[test]
    fn test_recording_resumes_into_same_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        let (connector, registry) = tracking_connector();

        let mut supervisor = ChannelSupervisor::new(RecordingConfig::new(tmp.path()));
        supervisor.add_channel(make_controller("resume", &connector));
        supervisor.connect_all();
        supervisor.start_recording_all();

        {
            registry.lock().unwrap()["resume"][0].inject_fault("controller off bus");
        }
        std::thread::sleep(Duration::from_millis(300));
        supervisor.poll_once();

        // Post-recovery frames land in the same <date>/<bus> directory
        {
            registry.lock().unwrap()["resume"][1].inject_frame(CanFrame::new(0x55, vec![9]));
        }
        let dir = tmp
            .path()
            .join("can_bus_log")
            .join(Utc::now().format("%Y-%m-%d").to_string())
            .join("resume");
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut found = false;
        while Instant::now() < deadline && !found {
            if let Ok(entries) = std::fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    if std::fs::read_to_string(entry.path())
                        .unwrap_or_default()
                        .contains("0x55")
                    {
                        found = true;
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        supervisor.stop_all();
        assert!(found);
    }
}
