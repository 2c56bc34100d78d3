//! Sender driver
//!
//! Waits for an interest beacon on the multicast group, then broadcasts
//! settings and the local aircraft handed in through a [`SenderHandle`]
//! until interest times out.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{Transport, TransportError, MAX_TRANSPORT_ERRORS};
use crate::config::Config;
use crate::delta::{AircraftState, DeltaEncoder, Outgoing};
use crate::protocol::{
    decode, AircraftDetail, AircraftId, CodecError, Encoder, Message, MessageBatch, PositionUpdate,
    SettingsRecord,
};
use crate::session::{Session, SessionStatus, SessionTimeouts, Transition};

/// Sender errors
#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Sender already running")]
    AlreadyRunning,

    #[error("Sender not running")]
    NotRunning,

    #[error("Sender stopped")]
    Closed,
}

pub type SenderResult<T> = Result<T, SenderError>;

/// Configuration of the sender driver
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Multicast destination
    pub group: SocketAddr,
    pub sender_id: u16,
    /// Maximum datagram size
    pub buffer_size: usize,
    /// Broadcast while sending
    pub settings: SettingsRecord,
    pub settings_interval: Duration,
    pub interest_timeout: Duration,
    pub full_detail_interval_secs: u32,
    pub transmit_hz: u32,
}

impl SenderConfig {
    pub fn from_config(config: &Config, sender_id: u16) -> Self {
        Self {
            group: super::MulticastConfig::from(config).group_addr(),
            sender_id,
            buffer_size: config.network.buffer_size,
            settings: config.settings_record(),
            settings_interval: config.timing.settings_interval(),
            interest_timeout: config.timing.interest_timeout(),
            full_detail_interval_secs: config.timing.full_detail_interval_secs,
            transmit_hz: config.network.transmit_hz,
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(1).min(self.interest_timeout)
    }
}

/// What one aircraft update produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub details: usize,
    pub positions: usize,
    pub removals: usize,
    pub datagrams: usize,
}

/// Events emitted by the sender
#[derive(Debug, Clone)]
pub enum SenderEvent {
    Started { local_addr: SocketAddr },
    StatusChanged(Transition),
    SettingsSent,
    Sent(TickStats),
    Stopped { reason: String },
}

/// Commands accepted by a running sender
#[derive(Debug, Clone)]
pub enum SenderCommand {
    /// Current state of all local aircraft, once per simulator frame
    Update(Vec<AircraftState>),
    Remove(Vec<AircraftId>),
    /// Remove every aircraft
    ClearAll,
}

/// Handle for feeding aircraft into a running sender
#[derive(Debug, Clone)]
pub struct SenderHandle {
    tx: mpsc::Sender<SenderCommand>,
}

impl SenderHandle {
    pub async fn update(&self, aircraft: Vec<AircraftState>) -> SenderResult<()> {
        self.send(SenderCommand::Update(aircraft)).await
    }

    pub async fn remove(&self, ids: Vec<AircraftId>) -> SenderResult<()> {
        self.send(SenderCommand::Remove(ids)).await
    }

    pub async fn clear(&self) -> SenderResult<()> {
        self.send(SenderCommand::ClearAll).await
    }

    pub async fn send(&self, command: SenderCommand) -> SenderResult<()> {
        self.tx.send(command).await.map_err(|_| SenderError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sender role driver
pub struct Sender<T: Transport + 'static> {
    config: SenderConfig,
    transport: Arc<T>,
    session: Arc<RwLock<Session>>,
    command_tx: Option<mpsc::Sender<SenderCommand>>,
    event_tx: mpsc::Sender<SenderEvent>,
    event_rx: Option<mpsc::Receiver<SenderEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static> Sender<T> {
    /// Create a new sender
    pub fn new(config: SenderConfig, transport: Arc<T>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let timeouts = SessionTimeouts {
            interest_timeout: config.interest_timeout,
            ..Default::default()
        };

        Self {
            config,
            transport,
            session: Arc::new(RwLock::new(Session::new(timeouts))),
            command_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            task: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<SenderEvent>> {
        self.event_rx.take()
    }

    /// Handle for the running sender
    pub fn handle(&self) -> Option<SenderHandle> {
        self.command_tx.clone().map(|tx| SenderHandle { tx })
    }

    /// Start waiting for interest
    pub async fn start(&mut self) -> SenderResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(SenderError::AlreadyRunning);
            }
        }

        let encoder = Encoder::with_max_size(self.config.sender_id, self.config.buffer_size);
        let settings = encoder.to_datagram(&Message::Settings(self.config.settings))?;
        let details = encoder.batch()?;
        let positions = encoder.batch()?;
        let removals = encoder.batch()?;
        let local_addr = self.transport.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel(64);
        self.command_tx = Some(command_tx);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let transition = self.session.write().await.start_sending();
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        info!(
            "Sender {:#06x} waiting for interest on {}",
            self.config.sender_id, self.config.group
        );
        let _ = self.event_tx.try_send(SenderEvent::Started { local_addr });
        if let Some(transition) = transition {
            let _ = self.event_tx.try_send(SenderEvent::StatusChanged(transition));
        }

        let send_loop = SendLoop {
            encoder: DeltaEncoder::new(
                self.config.full_detail_interval_secs,
                self.config.transmit_hz,
            ),
            config: self.config.clone(),
            transport: self.transport.clone(),
            session: self.session.clone(),
            event_tx: self.event_tx.clone(),
            running: self.running.clone(),
            settings,
            details,
            positions,
            removals,
            epoch: Instant::now(),
            errors: 0,
        };
        self.task = Some(tokio::spawn(send_loop.run(command_rx, shutdown_rx)));

        Ok(())
    }

    /// Stop sending and wait for the driver to wind down
    pub async fn stop(&mut self) -> SenderResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(SenderError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.command_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.read().await.status()
    }

    /// Check if the sender is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// State owned by the spawned sender task
struct SendLoop<T: Transport> {
    config: SenderConfig,
    transport: Arc<T>,
    session: Arc<RwLock<Session>>,
    event_tx: mpsc::Sender<SenderEvent>,
    running: Arc<RwLock<bool>>,
    encoder: DeltaEncoder,
    settings: Bytes,
    details: MessageBatch<AircraftDetail>,
    positions: MessageBatch<PositionUpdate>,
    removals: MessageBatch<AircraftId>,
    /// Origin of the encoder clock
    epoch: Instant,
    errors: u32,
}

impl<T: Transport> SendLoop<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SenderCommand>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let transport = self.transport.clone();
        let mut buf = vec![0u8; self.config.buffer_size];

        let period = self.config.settings_interval;
        let mut settings_tick = time::interval_at(time::Instant::now() + period, period);
        settings_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poll = self.config.poll_interval();
        let mut poll_tick = time::interval_at(time::Instant::now() + poll, poll);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            if self.errors >= MAX_TRANSPORT_ERRORS {
                break format!("{} consecutive transport errors", self.errors);
            }

            tokio::select! {
                result = transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            self.errors = 0;
                            self.on_datagram(&buf[..len], from, &mut settings_tick).await;
                        }
                        Err(e) => self.transport_error(e),
                    }
                }
                _ = settings_tick.tick() => {
                    if self.is_sending().await {
                        self.send_settings().await;
                    }
                }
                _ = poll_tick.tick() => {
                    let transition = self.session.write().await.poll(Instant::now());
                    if let Some(transition) = transition {
                        // receivers drop aircraft of silent senders, start over with full details
                        self.encoder.clear();
                        self.emit(SenderEvent::StatusChanged(transition));
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => break "command channel closed".to_string(),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Sender shutdown requested");
                    break "shutdown requested".to_string();
                }
            }
        };

        if let Some(transition) = self.session.write().await.stop() {
            self.emit(SenderEvent::StatusChanged(transition));
        }
        self.encoder.clear();
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        info!("Sender stopped: {}", reason);
        self.emit(SenderEvent::Stopped { reason });
    }

    async fn on_datagram(&mut self, data: &[u8], from: SocketAddr, settings_tick: &mut Interval) {
        match decode(data) {
            Ok(frame) if frame.message == Message::Beacon => {
                debug!("Interest beacon from {}", from);
                let transition = self.session.write().await.on_interest(Instant::now());
                if let Some(transition) = transition {
                    info!("Receiver at {} is interested, start sending", from);
                    self.emit(SenderEvent::StatusChanged(transition));
                    self.send_settings().await;
                    settings_tick.reset();
                }
            }
            Ok(frame) => {
                trace!(
                    "Ignoring {:?} from {}",
                    frame.message.message_type(),
                    from
                );
            }
            Err(e) => debug!("Dropping datagram from {}: {}", from, e),
        }
    }

    async fn on_command(&mut self, command: SenderCommand) {
        if !self.is_sending().await {
            return;
        }

        let mut stats = TickStats::default();
        let mut datagrams = Vec::new();
        match command {
            SenderCommand::Update(aircraft) => {
                let now = self.epoch.elapsed().as_secs_f64();
                if !self.encoder.begin_tick(now) {
                    return;
                }
                for state in &aircraft {
                    match self.encoder.encode(state) {
                        Outgoing::Detail { detail, .. } => {
                            stats.details += 1;
                            datagrams.extend(self.details.push(&detail));
                        }
                        Outgoing::Position(update) => {
                            stats.positions += 1;
                            datagrams.extend(self.positions.push(&update));
                        }
                    }
                }
            }
            SenderCommand::Remove(ids) => {
                for id in ids {
                    if self.encoder.remove(id) {
                        stats.removals += 1;
                        datagrams.extend(self.removals.push(&id));
                    }
                }
            }
            SenderCommand::ClearAll => {
                let ids: Vec<AircraftId> = self.encoder.ids().collect();
                for id in ids {
                    stats.removals += 1;
                    datagrams.extend(self.removals.push(&id));
                }
                self.encoder.clear();
            }
        }

        datagrams.extend(self.details.flush());
        datagrams.extend(self.positions.flush());
        datagrams.extend(self.removals.flush());
        for datagram in datagrams {
            if self.send(&datagram).await {
                stats.datagrams += 1;
            }
        }
        self.emit(SenderEvent::Sent(stats));
    }

    async fn is_sending(&self) -> bool {
        self.session.read().await.status() == SessionStatus::Sending
    }

    async fn send_settings(&mut self) {
        let settings = self.settings.clone();
        if self.send(&settings).await {
            debug!("Settings sent to {}", self.config.group);
            self.emit(SenderEvent::SettingsSent);
        }
    }

    async fn send(&mut self, datagram: &[u8]) -> bool {
        match self.transport.send_to(datagram, self.config.group).await {
            Ok(_) => {
                self.errors = 0;
                true
            }
            Err(e) => {
                self.transport_error(e);
                false
            }
        }
    }

    fn transport_error(&mut self, e: TransportError) {
        self.errors += 1;
        warn!("Sender transport error ({}): {}", self.errors, e);
    }

    fn emit(&self, event: SenderEvent) {
        if self.event_tx.try_send(event).is_err() {
            trace!("Sender event dropped");
        }
    }
}
