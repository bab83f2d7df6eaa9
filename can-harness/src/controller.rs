//! Channel controller
//!
//! One `CanController` owns one logical CAN channel: the database describing
//! its traffic, the bus handle once connected, the notifier draining received
//! frames, and the rolling-counter state for every protected signal group it
//! transmits. All send paths run the same pipeline: group the request per
//! message, complete the signal set, apply E2E protection, encode, transmit.

use crate::config::ChannelConfig;
use crate::db::{self, Database, MessageSpec};
use crate::protect::{self, CounterState};
use crate::resolve;
use crate::transport::{BusFault, CanBus, FrameFilter, Listener, Notifier};
use crate::types::{CanFrame, HarnessError, Result, SignalSet, SignalValue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Fallback period for periodic sends of non-cyclic messages
const DEFAULT_PERIOD: Duration = Duration::from_millis(100);

/// Granularity of bounded receive loops
const RECV_POLL: Duration = Duration::from_millis(100);

/// Opens a bus for a channel configuration.
///
/// Injected so the controller stays independent of concrete hardware
/// drivers; an unsupported interface or unavailable device surfaces as a
/// fatal [`HarnessError::Transport`] at connect time.
pub type BusConnector = Arc<dyn Fn(&ChannelConfig) -> Result<Arc<dyn CanBus>> + Send + Sync>;

/// A record drained from a retained listener, decoded when possible
#[derive(Debug, Clone)]
pub struct ReceivedRecord {
    /// The raw frame as received
    pub frame: CanFrame,
    /// Owning message name, when the database knows the frame id
    pub message: Option<String>,
    /// Decoded signal set, when decoding succeeded
    pub signals: Option<SignalSet>,
}

/// Controller for one logical CAN channel
pub struct CanController {
    name: String,
    config: ChannelConfig,
    db: Arc<Database>,
    connector: BusConnector,
    bus: Option<Arc<dyn CanBus>>,
    notifier: Option<Notifier>,
    listener: Option<Listener>,
    counters: Mutex<CounterState>,
    connected: bool,
}

impl CanController {
    /// Create a controller, loading the database from the config's path.
    ///
    /// Fails with [`HarnessError::Configuration`] when the config names no
    /// database — use [`CanController::with_bus`] to supply a pre-built
    /// transport handle instead.
    pub fn new(config: ChannelConfig, connector: BusConnector) -> Result<Self> {
        let db_path = config.db_path.clone().ok_or_else(|| {
            HarnessError::Configuration(
                "Arguments 'db_path' or 'bus' can't all be None".to_string(),
            )
        })?;
        let database = db::load_dbc_file(&db_path)?;
        Ok(Self::assemble(config, Arc::new(database), connector, None))
    }

    /// Create a controller around an already-built database
    pub fn with_database(config: ChannelConfig, db: Arc<Database>, connector: BusConnector) -> Self {
        Self::assemble(config, db, connector, None)
    }

    /// Create a controller around a pre-built transport handle
    pub fn with_bus(
        config: ChannelConfig,
        db: Arc<Database>,
        bus: Arc<dyn CanBus>,
        connector: BusConnector,
    ) -> Self {
        Self::assemble(config, db, connector, Some(bus))
    }

    fn assemble(
        config: ChannelConfig,
        db: Arc<Database>,
        connector: BusConnector,
        bus: Option<Arc<dyn CanBus>>,
    ) -> Self {
        Self {
            name: config.name.to_lowercase(),
            config,
            db,
            connector,
            bus,
            notifier: None,
            listener: None,
            counters: Mutex::new(CounterState::new()),
            connected: false,
        }
    }

    /// Logical channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel configuration this controller was built from
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The database describing this channel's traffic
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The bus handle, once connected
    pub fn bus(&self) -> Option<&Arc<dyn CanBus>> {
        self.bus.as_ref()
    }

    /// True while connected
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True once [`CanController::listen`] installed a retained listener
    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// The background receive consumer, while connected
    pub fn notifier(&self) -> Option<&Notifier> {
        self.notifier.as_ref()
    }

    /// Connect the channel and start the background receive consumer.
    ///
    /// Bus declarations in the database are matched against the channel name;
    /// a mismatch is logged but not fatal (the first declaration wins, as the
    /// channel may be named differently in the bench config).
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        if let Some(bus_spec) = self.db.buses().first() {
            if !bus_spec.name.eq_ignore_ascii_case(&self.name) {
                log::warn!(
                    "Found bus name '{}' in {}, not expected '{}'",
                    bus_spec.name.to_lowercase(),
                    self.db.source(),
                    self.name
                );
            }
            log::debug!("CAN Controller: bus_name = {}", self.name);
            log::debug!("CAN Controller: bus_fd = {}", bus_spec.is_fd);
            log::debug!("CAN Controller: bus_bitrate = {}", bus_spec.bitrate);
        }

        if self.bus.is_none() {
            let bus = (self.connector)(&self.config)?;
            self.bus = Some(bus);
        }

        let bus = self.bus.as_ref().expect("bus just installed");
        self.notifier = Some(Notifier::new(Arc::clone(bus)));
        self.connected = true;
        log::info!("Channel '{}' is connected", bus.channel_info());
        Ok(())
    }

    /// Disconnect the channel, stopping the notifier and releasing the bus.
    ///
    /// A later [`CanController::connect`] opens a fresh handle; the logical
    /// channel identity and configuration are preserved.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if let Some(notifier) = self.notifier.take() {
            notifier.stop();
        }
        self.listener = None;
        if let Some(bus) = self.bus.take() {
            log::debug!("Disconnecting '{}' ......", bus.channel_info());
            bus.shutdown();
            log::info!("Successfully disconnected '{}' from device", bus.channel_info());
        }
        self.connected = false;
    }

    /// Drain the transport fault record accumulated since the last call
    pub fn take_faults(&self) -> Vec<BusFault> {
        self.notifier
            .as_ref()
            .map(|n| n.take_faults())
            .unwrap_or_default()
    }

    fn require_bus(&self) -> Result<&Arc<dyn CanBus>> {
        self.bus.as_ref().ok_or_else(|| {
            HarnessError::Transport(
                "The BUS is not instantiated. Please call the 'connect' method \
                 to instantiate the BUS and try again"
                    .to_string(),
            )
        })
    }

    fn require_notifier(&self) -> Result<&Notifier> {
        self.notifier.as_ref().ok_or_else(|| {
            HarnessError::Transport(
                "The BUS is not instantiated. Please call the 'connect' method \
                 to instantiate the BUS and try again"
                    .to_string(),
            )
        })
    }

    fn build_frame(&self, message: &MessageSpec, data: Vec<u8>, channel: String) -> CanFrame {
        CanFrame {
            timestamp_ns: 0,
            channel,
            can_id: message.frame_id,
            data,
            is_extended: message.is_extended,
            is_fd: message.is_fd,
            is_remote: false,
        }
    }

    fn message_period(&self, message: &MessageSpec) -> Duration {
        match (message.send_type, message.cycle_time_ms) {
            (db::SendType::Cyclic, Some(ms)) => Duration::from_millis(ms as u64),
            _ => DEFAULT_PERIOD,
        }
    }

    /// Send each requested signal exactly once.
    ///
    /// The request may span several messages; one frame is built and sent
    /// per resolved message. Per-message failures are logged, never fatal to
    /// the caller.
    pub fn send_signals_once(&self, request: &SignalSet) -> Result<()> {
        let bus = self.require_bus()?;
        if request.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one signal name-value pair should be passed in".to_string(),
            ));
        }

        for (msg_name, bucket) in resolve::group_by_message(&self.db, request) {
            let message = match self.db.message_by_name(&msg_name) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("{}", e);
                    continue;
                }
            };
            let mut signals = resolve::complete_signal_set(message, &bucket);
            {
                let mut counters = self.counters.lock().expect("counter lock poisoned");
                protect::apply_protection(message, &mut signals, &mut counters);
            }
            let data = match message.encode(&signals) {
                Ok(data) => data,
                Err(e) => {
                    let e = e.with_bus_context(&bus.channel_info(), self.db.source());
                    log::error!("{}", e);
                    continue;
                }
            };
            let frame = self.build_frame(message, data, bus.channel_info());
            log::info!("Sending raw message: {}", frame);
            if let Err(e) = bus.send(&frame) {
                log::error!("{}", e);
            }
        }
        Ok(())
    }

    /// Start sending the requested signals periodically.
    ///
    /// The transport replays an identical frame list on a fixed timer, so
    /// one full counter rotation is precomputed per message: exactly 15
    /// frames, counters 0..14 ascending (cold start applies only to the
    /// first). Installed at the message's cycle time, or a 100 ms fallback
    /// for non-cyclic messages.
    pub fn send_signals(&self, request: &SignalSet) -> Result<()> {
        let bus = self.require_bus()?;
        if request.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one signal name-value pair should be passed in".to_string(),
            ));
        }

        for (msg_name, bucket) in resolve::group_by_message(&self.db, request) {
            let message = match self.db.message_by_name(&msg_name) {
                Ok(message) => message,
                Err(e) => {
                    log::error!("{}", e);
                    continue;
                }
            };
            let period = self.message_period(message);
            let mut signals = resolve::complete_signal_set(message, &bucket);

            let mut frames = Vec::with_capacity(protect::FRAME_ROTATION);
            {
                let mut counters = self.counters.lock().expect("counter lock poisoned");
                // The rotation always begins at counter 0
                protect::reset_counters(message, &mut counters);
                for _ in 0..protect::FRAME_ROTATION {
                    protect::apply_protection(message, &mut signals, &mut counters);
                    match message.encode(&signals) {
                        Ok(data) => {
                            let frame = self.build_frame(message, data, bus.channel_info());
                            log::info!("Sending raw message: {}", frame);
                            frames.push(frame);
                        }
                        Err(e) => {
                            let e = e.with_bus_context(&bus.channel_info(), self.db.source());
                            log::error!("{}", e);
                        }
                    }
                }
            }

            if let Err(e) = bus.send_periodic(frames, period) {
                log::error!("Because {}, send message failed, please try again", e);
            }
        }
        Ok(())
    }

    /// Send raw payloads once, one frame per (can id, payload) pair
    pub fn send_messages_once(
        &self,
        payloads: &[(u32, Vec<u8>)],
        is_fd: bool,
        is_extended: bool,
        is_remote: bool,
    ) -> Result<()> {
        let bus = self.require_bus()?;
        if payloads.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one can_id-data pair should be passed in".to_string(),
            ));
        }
        for (can_id, data) in payloads {
            let frame = CanFrame {
                timestamp_ns: 0,
                channel: bus.channel_info(),
                can_id: *can_id,
                data: data.clone(),
                is_extended,
                is_fd: bus.supports_fd() && is_fd,
                is_remote,
            };
            log::info!("Sending raw message: {}", frame);
            bus.send(&frame)?;
        }
        Ok(())
    }

    /// Send raw payloads periodically.
    ///
    /// With no explicit cycle time, the database's declaration for the frame
    /// id is used, falling back to 100 ms when the id is unknown or the
    /// message is not cyclic.
    pub fn send_messages(
        &self,
        payloads: &[(u32, Vec<u8>)],
        is_fd: bool,
        is_extended: bool,
        is_remote: bool,
        cycle_time: Option<Duration>,
    ) -> Result<()> {
        let bus = self.require_bus()?;
        if payloads.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one can_id-data pair should be passed in".to_string(),
            ));
        }
        for (can_id, data) in payloads {
            let period = cycle_time.unwrap_or_else(|| {
                self.db
                    .message_by_frame_id(*can_id)
                    .map(|message| self.message_period(message))
                    .unwrap_or(DEFAULT_PERIOD)
            });
            let frame = CanFrame {
                timestamp_ns: 0,
                channel: bus.channel_info(),
                can_id: *can_id,
                data: data.clone(),
                is_extended,
                is_fd: bus.supports_fd() && is_fd,
                is_remote,
            };
            log::info!("Sending raw message: {}", frame);
            if let Err(e) = bus.send_periodic(vec![frame], period) {
                log::error!("Send message failed, please try again: {}", e);
            }
        }
        Ok(())
    }

    /// Stop every periodic transmission on this channel
    pub fn stop_sending(&self) {
        match self.bus.as_ref() {
            Some(bus) => {
                bus.stop_all_periodic_tasks();
                log::info!("Stop sending data");
            }
            None => log::error!("CAN bus is not connected"),
        }
    }

    /// Modify signals inside running periodic transmissions.
    ///
    /// For every periodic task whose arbitration id matches a message
    /// targeted by the request: decode each queued frame, overlay only the
    /// requested updates, re-encode, and atomically replace the task's frame
    /// list. Untouched signals round-trip unchanged; the timer is not
    /// restarted.
    pub fn modify_sending_signals(&self, request: &SignalSet) -> Result<()> {
        let bus = self.require_bus()?;
        if request.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one signal name-value pair should be passed in".to_string(),
            ));
        }

        let buckets = resolve::group_by_message(&self.db, request);
        for task in bus.periodic_tasks() {
            for (msg_name, bucket) in &buckets {
                let message = match self.db.message_by_name(msg_name) {
                    Ok(message) => message,
                    Err(e) => {
                        log::error!("{}", e);
                        continue;
                    }
                };
                if message.frame_id != task.arbitration_id() {
                    continue;
                }
                let new_frames = self.overlay_frames(message, &task.frames(), bucket, bus);
                for frame in &new_frames {
                    log::info!("Modify sending raw message: {}", frame);
                }
                task.modify_data(new_frames);
            }
        }
        Ok(())
    }

    /// Decode each frame, overlay the caller's updates, re-encode. Frames
    /// that fail either step are kept as they were.
    fn overlay_frames(
        &self,
        message: &MessageSpec,
        frames: &[CanFrame],
        updates: &SignalSet,
        bus: &Arc<dyn CanBus>,
    ) -> Vec<CanFrame> {
        frames
            .iter()
            .map(|frame| {
                match overlay_frame(message, frame, updates) {
                    Ok(new_frame) => new_frame,
                    Err(e) => {
                        let e = e.with_bus_context(&bus.channel_info(), self.db.source());
                        log::error!("Unable to modify frame {}: {}", frame, e);
                        frame.clone()
                    }
                }
            })
            .collect()
    }

    /// Intercept traffic another node is sending and override chosen signals.
    ///
    /// A background task attaches a listener to this channel; every observed
    /// inbound frame is forwarded on `send_bus` (defaulting to this
    /// channel's own bus), with frames of targeted messages decoded, the
    /// requested updates overlaid, and re-encoded first. Returns the owning
    /// task handle; the interception runs until [`OverrideTask::stop`].
    pub fn modify_ecu_sending_signals(
        &self,
        request: &SignalSet,
        send_bus: Option<Arc<dyn CanBus>>,
    ) -> Result<OverrideTask> {
        let own_bus = self.require_bus()?;
        let notifier = self.require_notifier()?;
        if request.is_empty() {
            return Err(HarnessError::Configuration(
                "At least one signal name-value pair should be passed in".to_string(),
            ));
        }

        let buckets = resolve::group_by_message(&self.db, request);
        let listener = notifier.add_listener();
        let out_bus = send_bus.unwrap_or_else(|| Arc::clone(own_bus));
        let db = Arc::clone(&self.db);
        let db_source = self.db.source().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let task_name = format!("can-harness.override '{}'", out_bus.channel_info());

        log::info!("Start modifying signal data ......");
        let handle = std::thread::Builder::new()
            .name(task_name.clone())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    let frame = match listener.recv(RECV_POLL) {
                        Some(frame) => frame,
                        None => continue,
                    };
                    let mut outgoing = frame.clone();
                    outgoing.channel = out_bus.channel_info();

                    if let Ok(message) = db.message_by_frame_id(frame.can_id) {
                        if let Some(updates) = buckets.get(&message.name) {
                            match overlay_frame(message, &frame, updates) {
                                Ok(mut modified) => {
                                    modified.channel = out_bus.channel_info();
                                    log::info!("Modify ecu sending raw message: {}", modified);
                                    outgoing = modified;
                                }
                                Err(e) => {
                                    let e = e
                                        .with_bus_context(&frame.channel, &db_source);
                                    log::error!("Unable to parse message {}: {}", frame, e);
                                }
                            }
                        }
                    }
                    if let Err(e) = out_bus.send(&outgoing) {
                        log::error!("{}", e);
                    }
                }
            })
            .expect("failed to spawn override thread");

        Ok(OverrideTask {
            name: task_name,
            stop,
            handle: Some(handle),
        })
    }

    /// Receive the requested signals once.
    ///
    /// All signals must belong to one message; the first matching frame is
    /// decoded and the requested subset returned. `None` when the names are
    /// invalid or nothing matched within the timeout.
    pub fn receive_signals_once(
        &self,
        signal_names: &[&str],
        timeout: Option<Duration>,
    ) -> Result<Option<SignalSet>> {
        self.require_bus()?;
        let notifier = self.require_notifier()?;

        let mut target: Option<&MessageSpec> = None;
        for name in signal_names {
            let message = match self.db.message_by_signal(name) {
                Ok(message) => message,
                Err(_) => {
                    log::error!(
                        "Can't find the message of signal '{}' in database {}, stop receiving",
                        name,
                        self.db.source()
                    );
                    return Ok(None);
                }
            };
            match target {
                None => target = Some(message),
                Some(existing) if existing.frame_id == message.frame_id => {}
                Some(_) => {
                    log::error!("Signals should be in same message");
                    return Ok(None);
                }
            }
        }
        let message = match target {
            Some(message) => message,
            None => return Ok(None),
        };

        log::info!("Expected signals: {:?}", signal_names);
        log::info!("Start receiving signals...");
        let listener = notifier.add_listener();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut received = SignalSet::new();

        loop {
            if let Some(frame) = listener.recv(RECV_POLL) {
                if frame.can_id == message.frame_id {
                    match message.decode(&frame.data) {
                        Ok(decoded) => {
                            log::debug!("Received message dict: {:?}", decoded);
                            received = self.pick_signals(message, &decoded, signal_names);
                            break;
                        }
                        Err(e) => {
                            let e = e.with_bus_context(&frame.channel, self.db.source());
                            log::error!("{}", e);
                        }
                    }
                }
            }
            if deadline.is_some_and(|d| Instant::now() > d) {
                break;
            }
        }
        notifier.remove_listener(&listener);
        log::info!("Received signals: {:?}", received);
        Ok(if received.is_empty() { None } else { Some(received) })
    }

    /// Receive the requested signals continuously for `duration`.
    ///
    /// Returns each distinct decoded subset in arrival order; stops early
    /// after `max_count` frames when given.
    pub fn receive_signals(
        &self,
        signal_names: &[&str],
        duration: Duration,
        max_count: Option<usize>,
    ) -> Result<Vec<SignalSet>> {
        self.require_bus()?;
        let notifier = self.require_notifier()?;

        let mut messages: Vec<&MessageSpec> = Vec::new();
        let mut expected: Vec<&str> = Vec::new();
        for &name in signal_names {
            match self.db.message_by_signal(name) {
                Ok(message) => {
                    if !messages.iter().any(|m| m.frame_id == message.frame_id) {
                        messages.push(message);
                    }
                    expected.push(name);
                }
                Err(_) => {
                    log::error!(
                        "Can't find the message of signal '{}' in database {}",
                        name,
                        self.db.source()
                    );
                }
            }
        }
        if messages.is_empty() {
            log::error!("None of your signal names is valid, stop receiving");
            return Ok(Vec::new());
        }

        log::info!("Expected signals: {:?}", expected);
        log::info!("Start receiving signals...");
        let listener = notifier.add_listener();
        let deadline = Instant::now() + duration;
        let mut collected: Vec<SignalSet> = Vec::new();
        let mut count = 0usize;

        while Instant::now() < deadline {
            let frame = match listener.recv(RECV_POLL) {
                Some(frame) => frame,
                None => continue,
            };
            count += 1;
            for message in &messages {
                if message.frame_id != frame.can_id {
                    continue;
                }
                match message.decode(&frame.data) {
                    Ok(decoded) => {
                        let subset = self.pick_signals(message, &decoded, &expected);
                        if !subset.is_empty() && !collected.contains(&subset) {
                            collected.push(subset);
                        }
                    }
                    Err(e) => {
                        let e = e.with_bus_context(&frame.channel, self.db.source());
                        log::error!("{}", e);
                    }
                }
            }
            if max_count.is_some_and(|max| count >= max) {
                break;
            }
        }
        notifier.remove_listener(&listener);
        log::info!("Received signals: {:?}", collected);
        Ok(collected)
    }

    /// Receive one frame, optionally matching a specific CAN id
    pub fn receive_message_once(
        &self,
        can_id: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<Option<CanFrame>> {
        self.require_bus()?;
        let notifier = self.require_notifier()?;

        let listener = notifier.add_listener();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut received = None;

        loop {
            if let Some(frame) = listener.recv(RECV_POLL) {
                if can_id.is_none() || can_id == Some(frame.can_id) {
                    received = Some(frame);
                    break;
                }
            }
            if deadline.is_some_and(|d| Instant::now() > d) {
                break;
            }
        }
        notifier.remove_listener(&listener);
        log::info!("Received raw message: {:?}", received);
        Ok(received)
    }

    /// Receive frames continuously for `duration`, optionally filtered to a
    /// set of CAN ids; stops early after `max_count` frames when given.
    pub fn receive_messages(
        &self,
        can_ids: &[u32],
        duration: Duration,
        max_count: Option<usize>,
    ) -> Result<Vec<CanFrame>> {
        self.require_bus()?;
        let notifier = self.require_notifier()?;

        let listener = notifier.add_listener();
        let deadline = Instant::now() + duration;
        let mut collected: Vec<CanFrame> = Vec::new();
        let mut count = 0usize;

        while Instant::now() < deadline {
            let frame = match listener.recv(RECV_POLL) {
                Some(frame) => frame,
                None => continue,
            };
            count += 1;
            if can_ids.is_empty() || can_ids.contains(&frame.can_id) {
                log::info!("Received raw message: {}", frame);
                collected.push(frame);
            }
            if max_count.is_some_and(|max| count >= max) {
                break;
            }
        }
        notifier.remove_listener(&listener);
        Ok(collected)
    }

    /// Install frame filters and a retained listener for continuous capture.
    ///
    /// Targets may be CAN ids or signal names (resolved to their owning
    /// message's id); unresolvable names are logged and skipped. With no
    /// targets, everything is captured.
    pub fn listen(&mut self, can_ids: &[u32], signal_names: &[&str]) -> Result<()> {
        let mut filters: Vec<FrameFilter> = can_ids.iter().map(|&id| FrameFilter::for_id(id)).collect();
        for name in signal_names {
            match self.db.message_by_signal(name) {
                Ok(message) => filters.push(FrameFilter::for_id(message.frame_id)),
                Err(_) => {
                    log::warn!(
                        "Can't find the message of signal '{}' in database {}",
                        name,
                        self.db.source()
                    );
                }
            }
        }

        let listener = {
            let bus = self.require_bus()?;
            bus.set_filters(&filters);
            self.require_notifier()?.add_listener()
        };
        self.listener = Some(listener);
        Ok(())
    }

    /// Drain up to `num` buffered frames from the retained listener (0 = all)
    pub fn drain_frames(&self, num: usize) -> Vec<CanFrame> {
        let listener = match self.listener.as_ref() {
            Some(listener) => listener,
            None => return Vec::new(),
        };
        let mut frames = listener.drain();
        if num != 0 && frames.len() > num {
            frames.truncate(num);
        } else if num != 0 && frames.len() < num {
            log::warn!(
                "Received raw messages total is {}, but expected num is {}, \
                 this time return num is {}",
                frames.len(),
                num,
                frames.len()
            );
        }
        frames
    }

    /// Drain buffered frames and decode what the database recognizes
    pub fn drain_signals(&self, num: usize) -> Vec<ReceivedRecord> {
        self.drain_frames(num)
            .into_iter()
            .map(|frame| match self.db.message_by_frame_id(frame.can_id) {
                Ok(message) => match message.decode(&frame.data) {
                    Ok(signals) => ReceivedRecord {
                        message: Some(message.name.clone()),
                        signals: Some(signals),
                        frame,
                    },
                    Err(e) => {
                        let e = e.with_bus_context(&frame.channel, self.db.source());
                        log::error!("Unable to parse message {}: {}", frame, e);
                        ReceivedRecord {
                            message: Some(message.name.clone()),
                            signals: None,
                            frame,
                        }
                    }
                },
                Err(_) => ReceivedRecord {
                    message: None,
                    signals: None,
                    frame,
                },
            })
            .collect()
    }

    /// Reduce a decoded set to the requested names, mapping symbolic values
    /// back to their numeric form for the caller
    fn pick_signals(
        &self,
        message: &MessageSpec,
        decoded: &SignalSet,
        names: &[&str],
    ) -> SignalSet {
        let mut subset = SignalSet::new();
        for (name, value) in decoded {
            if !names.contains(&name.as_str()) {
                continue;
            }
            let value = match (message.signal(name), value) {
                (Some(spec), SignalValue::Sym(label)) => match spec.choice_to_number(label) {
                    Ok(number) => SignalValue::Num(number as f64),
                    Err(_) => value.clone(),
                },
                _ => value.clone(),
            };
            subset.insert(name.clone(), value);
        }
        subset
    }
}

impl Drop for CanController {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Decode a frame, overlay updates (caller numerics are raw units), and
/// re-encode into a new frame carrying the same metadata
fn overlay_frame(message: &MessageSpec, frame: &CanFrame, updates: &SignalSet) -> Result<CanFrame> {
    let mut decoded = message.decode(&frame.data)?;
    for (name, value) in updates {
        let value = match (message.signal(name), value) {
            (Some(spec), SignalValue::Num(raw)) => {
                SignalValue::Num(raw * spec.scale + spec.offset)
            }
            _ => value.clone(),
        };
        decoded.insert(name.clone(), value);
    }
    let data = message.encode(&decoded)?;
    let mut new_frame = frame.clone();
    new_frame.data = data;
    Ok(new_frame)
}

/// A named, owned background interception task
///
/// Created by [`CanController::modify_ecu_sending_signals`]; the thread runs
/// until stopped (or until the task is dropped).
pub struct OverrideTask {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl OverrideTask {
    /// The task's thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the interception and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OverrideTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SendType, SignalGroupSpec, SignalSpec};
    use crate::sim::SimulatedBus;

    fn test_database() -> Database {
        let mut chks = SignalSpec::plain("SafeChks", 24, 8);
        chks.data_id = Some(1084);
        let mut db = Database::new();
        db.add_message(MessageSpec {
            frame_id: 0x1A0,
            name: "SafeFrame".to_string(),
            size: 8,
            cycle_time_ms: Some(50),
            send_type: SendType::Cyclic,
            is_fd: false,
            is_extended: false,
            signals: vec![
                SignalSpec::plain("DataA", 0, 3),
                SignalSpec::plain("DataB", 3, 3),
                SignalSpec::plain("SafeCntr", 16, 4),
                chks,
            ],
            signal_groups: vec![SignalGroupSpec {
                name: "Safe".to_string(),
                signal_names: vec![
                    "DataA".to_string(),
                    "DataB".to_string(),
                    "SafeCntr".to_string(),
                    "SafeChks".to_string(),
                ],
            }],
            sender: None,
        });
        db.add_message(MessageSpec {
            frame_id: 0x2B0,
            name: "PlainFrame".to_string(),
            size: 8,
            cycle_time_ms: None,
            send_type: SendType::Event,
            is_fd: false,
            is_extended: false,
            signals: vec![SignalSpec::plain("PlainSig", 0, 8)],
            signal_groups: vec![],
            sender: None,
        });
        db
    }

    fn sim_controller(name: &str) -> (CanController, Arc<SimulatedBus>) {
        let bus = SimulatedBus::new(name);
        let connector: BusConnector = {
            let bus = Arc::clone(&bus);
            Arc::new(move |_cfg: &ChannelConfig| Ok(Arc::clone(&bus) as Arc<dyn CanBus>))
        };
        let controller = CanController::with_database(
            ChannelConfig::new(name, "sim", 1),
            Arc::new(test_database()),
            connector,
        );
        (controller, bus)
    }

    #[test]
    fn test_send_requires_connect() {
        let (controller, _bus) = sim_controller("sim:0");
        let mut request = SignalSet::new();
        request.insert("DataA".to_string(), SignalValue::Num(1.0));
        assert!(matches!(
            controller.send_signals_once(&request),
            Err(HarnessError::Transport(_))
        ));
    }

    #[test]
    fn test_send_signals_once_builds_one_frame() {
        let (mut controller, bus) = sim_controller("sim:0");
        controller.connect().unwrap();

        let mut request = SignalSet::new();
        request.insert("DataA".to_string(), SignalValue::Num(4.0));
        controller.send_signals_once(&request).unwrap();

        let sent = bus.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].can_id, 0x1A0);
        assert_eq!(sent[0].data.len(), 8);

        // Cold start: counter nibble is 0
        let message = controller.database().message_by_name("SafeFrame").unwrap();
        let decoded = message.decode(&sent[0].data).unwrap();
        assert_eq!(decoded["SafeCntr"], SignalValue::Num(0.0));
    }

    #[test]
    fn test_periodic_rotation_has_fifteen_frames() {
        let (mut controller, bus) = sim_controller("sim:0");
        controller.connect().unwrap();

        let mut request = SignalSet::new();
        request.insert("DataA".to_string(), SignalValue::Num(4.0));
        controller.send_signals(&request).unwrap();

        let tasks = bus.periodic_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].period(), Duration::from_millis(50));

        let frames = tasks[0].frames();
        assert_eq!(frames.len(), 15);
        let message = controller.database().message_by_name("SafeFrame").unwrap();
        for (i, frame) in frames.iter().enumerate() {
            let decoded = message.decode(&frame.data).unwrap();
            assert_eq!(decoded["SafeCntr"], SignalValue::Num(i as f64));
        }
    }

    #[test]
    fn test_modify_running_transmission() {
        let (mut controller, bus) = sim_controller("sim:0");
        controller.connect().unwrap();

        let mut request = SignalSet::new();
        request.insert("DataA".to_string(), SignalValue::Num(4.0));
        request.insert("DataB".to_string(), SignalValue::Num(2.0));
        controller.send_signals(&request).unwrap();

        let mut update = SignalSet::new();
        update.insert("DataB".to_string(), SignalValue::Num(5.0));
        controller.modify_sending_signals(&update).unwrap();

        let message = controller.database().message_by_name("SafeFrame").unwrap();
        let frames = bus.periodic_tasks()[0].frames();
        assert_eq!(frames.len(), 15);
        for (i, frame) in frames.iter().enumerate() {
            let decoded = message.decode(&frame.data).unwrap();
            // Modified signal took the new value, untouched ones kept theirs
            assert_eq!(decoded["DataB"], SignalValue::Num(5.0));
            assert_eq!(decoded["DataA"], SignalValue::Num(4.0));
            assert_eq!(decoded["SafeCntr"], SignalValue::Num(i as f64));
        }
    }

    #[test]
    fn test_receive_signals_once() {
        let (mut controller, bus) = sim_controller("sim:0");
        controller.connect().unwrap();

        let message = controller.database().message_by_name("PlainFrame").unwrap();
        let mut signals = SignalSet::new();
        signals.insert("PlainSig".to_string(), SignalValue::Num(42.0));
        let data = message.encode(&signals).unwrap();

        // Inject after the receive call has registered its listener
        let injector = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                bus.inject_frame(CanFrame::new(0x2B0, data));
            })
        };

        let received = controller
            .receive_signals_once(&["PlainSig"], Some(Duration::from_secs(2)))
            .unwrap()
            .expect("expected a signal set");
        injector.join().unwrap();
        assert_eq!(received["PlainSig"], SignalValue::Num(42.0));
    }

    #[test]
    fn test_receive_signals_rejects_mixed_messages() {
        let (mut controller, _bus) = sim_controller("sim:0");
        controller.connect().unwrap();

        let received = controller
            .receive_signals_once(&["PlainSig", "DataA"], Some(Duration::from_millis(50)))
            .unwrap();
        assert!(received.is_none());
    }

    #[test]
    fn test_override_task_forwards_and_modifies() {
        let (a, b) = SimulatedBus::pair("sim:a", "sim:b");
        let connector: BusConnector = {
            let a = Arc::clone(&a);
            Arc::new(move |_cfg: &ChannelConfig| Ok(Arc::clone(&a) as Arc<dyn CanBus>))
        };
        let mut controller = CanController::with_database(
            ChannelConfig::new("sim:a", "sim", 1),
            Arc::new(test_database()),
            connector,
        );
        controller.connect().unwrap();

        let mut overrides = SignalSet::new();
        overrides.insert("PlainSig".to_string(), SignalValue::Num(99.0));
        let task = controller
            .modify_ecu_sending_signals(&overrides, Some(Arc::clone(&b) as Arc<dyn CanBus>))
            .unwrap();

        // A frame "from the ECU" arrives on channel a
        let message = controller.database().message_by_name("PlainFrame").unwrap();
        let mut signals = SignalSet::new();
        signals.insert("PlainSig".to_string(), SignalValue::Num(1.0));
        let data = message.encode(&signals).unwrap();
        a.inject_frame(CanFrame::new(0x2B0, data));

        // Wait for the interception thread to forward it on channel b
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut forwarded = Vec::new();
        while Instant::now() < deadline {
            forwarded = b.sent_frames();
            if !forwarded.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        task.stop();

        assert_eq!(forwarded.len(), 1);
        let decoded = message.decode(&forwarded[0].data).unwrap();
        assert_eq!(decoded["PlainSig"], SignalValue::Num(99.0));
    }

    #[test]
    fn test_disconnect_then_reconnect_fresh_handle() {
        let (mut controller, bus) = sim_controller("sim:0");
        controller.connect().unwrap();
        assert!(controller.is_connected());

        controller.disconnect();
        assert!(!controller.is_connected());
        assert!(!bus.is_open());
    }
}
