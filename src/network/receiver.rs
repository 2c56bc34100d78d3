//! Receiver driver
//!
//! Broadcasts interest beacons, decodes incoming datagrams and hands them
//! to a [`RemoteHandler`]. Datagrams already queued when the driver wakes
//! up are processed as one batch between the handler's
//! `before_first_aircraft` and `after_last_aircraft` hooks.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{
    dispatch, MessageContext, RemoteHandler, Transport, TransportError, MAX_TRANSPORT_ERRORS,
};
use crate::config::Config;
use crate::protocol::{decode, CodecError, Encoder, Message};
use crate::session::{Session, SessionStatus, SessionTimeouts, Transition};

/// Malformed datagram warnings are repeated at most this often
const MALFORMED_WARN_INTERVAL: Duration = Duration::from_secs(600);

/// Upper bound of datagrams handled per wake-up
const MAX_BATCH: usize = 256;

/// Receiver errors
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Receiver already running")]
    AlreadyRunning,

    #[error("Receiver not running")]
    NotRunning,
}

pub type ReceiverResult<T> = Result<T, ReceiverError>;

/// Configuration of the receiver driver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Multicast destination of beacons
    pub group: SocketAddr,
    /// Sender id put into beacon headers
    pub sender_id: u16,
    pub buffer_size: usize,
    pub beacon_interval: Duration,
    pub sender_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl ReceiverConfig {
    pub fn from_config(config: &Config, sender_id: u16) -> Self {
        Self {
            group: super::MulticastConfig::from(config).group_addr(),
            sender_id,
            buffer_size: config.network.buffer_size,
            beacon_interval: config.timing.beacon_interval(),
            sender_timeout: config.timing.sender_timeout(),
            cleanup_interval: config.timing.sender_cleanup(),
        }
    }
}

/// Events emitted by the receiver
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    Started { local_addr: SocketAddr },
    StatusChanged(Transition),
    BeaconSent,
    Stopped { reason: String },
}

/// Receiver role driver
pub struct Receiver<T: Transport + 'static, H: RemoteHandler + 'static> {
    config: ReceiverConfig,
    transport: Arc<T>,
    handler: Arc<Mutex<H>>,
    session: Arc<RwLock<Session>>,
    event_tx: mpsc::Sender<ReceiverEvent>,
    event_rx: Option<mpsc::Receiver<ReceiverEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    running: Arc<RwLock<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport + 'static, H: RemoteHandler + 'static> Receiver<T, H> {
    /// Create a new receiver
    pub fn new(config: ReceiverConfig, transport: Arc<T>, handler: H) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let timeouts = SessionTimeouts {
            sender_timeout: config.sender_timeout,
            ..Default::default()
        };

        Self {
            config,
            transport,
            handler: Arc::new(Mutex::new(handler)),
            session: Arc::new(RwLock::new(Session::new(timeouts))),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
            task: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ReceiverEvent>> {
        self.event_rx.take()
    }

    /// Shared access to the handler
    pub fn handler(&self) -> Arc<Mutex<H>> {
        self.handler.clone()
    }

    /// Start receiving
    pub async fn start(&mut self) -> ReceiverResult<()> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ReceiverError::AlreadyRunning);
            }
        }

        let encoder = Encoder::with_max_size(self.config.sender_id, self.config.buffer_size);
        let beacon = encoder.to_datagram(&Message::Beacon)?;
        let local_addr = self.transport.local_addr()?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let transition = self.session.write().await.start_receiving();
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        info!("Receiver listening on {}", self.config.group);
        let _ = self.event_tx.try_send(ReceiverEvent::Started { local_addr });
        if let Some(transition) = transition {
            let _ = self.event_tx.try_send(ReceiverEvent::StatusChanged(transition));
        }

        let recv_loop = RecvLoop {
            config: self.config.clone(),
            transport: self.transport.clone(),
            handler: self.handler.clone(),
            session: self.session.clone(),
            event_tx: self.event_tx.clone(),
            running: self.running.clone(),
            beacon,
            last_warning: None,
            errors: 0,
        };
        self.task = Some(tokio::spawn(recv_loop.run(shutdown_rx)));

        Ok(())
    }

    /// Stop receiving; all remote aircraft are dropped
    pub async fn stop(&mut self) -> ReceiverResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ReceiverError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.read().await.status()
    }

    /// Check if the receiver is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// State owned by the spawned receiver task
struct RecvLoop<T: Transport, H: RemoteHandler> {
    config: ReceiverConfig,
    transport: Arc<T>,
    handler: Arc<Mutex<H>>,
    session: Arc<RwLock<Session>>,
    event_tx: mpsc::Sender<ReceiverEvent>,
    running: Arc<RwLock<bool>>,
    beacon: Bytes,
    last_warning: Option<Instant>,
    errors: u32,
}

impl<T: Transport, H: RemoteHandler> RecvLoop<T, H> {
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let transport = self.transport.clone();
        // one spare byte exposes datagrams the sender built larger than ours
        let mut buf = vec![0u8; self.config.buffer_size + 1];

        // first tick fires right away
        let mut beacon_tick = time::interval(self.config.beacon_interval);
        beacon_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cleanup = self.config.cleanup_interval;
        let mut cleanup_tick = time::interval_at(time::Instant::now() + cleanup, cleanup);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            if self.errors >= MAX_TRANSPORT_ERRORS {
                break format!("{} consecutive transport errors", self.errors);
            }

            tokio::select! {
                result = transport.recv_from(&mut buf) => {
                    match result {
                        Ok((len, from)) => {
                            self.errors = 0;
                            self.process_batch(&mut buf, len, from).await;
                        }
                        Err(e) => self.transport_error(e),
                    }
                }
                _ = beacon_tick.tick() => self.send_beacon().await,
                _ = cleanup_tick.tick() => self.housekeeping().await,
                _ = shutdown_rx.recv() => {
                    info!("Receiver shutdown requested");
                    break "shutdown requested".to_string();
                }
            }
        };

        self.handler.lock().await.on_stop();
        if let Some(transition) = self.session.write().await.stop() {
            self.emit(ReceiverEvent::StatusChanged(transition));
        }
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        info!("Receiver stopped: {}", reason);
        self.emit(ReceiverEvent::Stopped { reason });
    }

    /// Handle the datagram in `buf` and everything queued behind it
    async fn process_batch(&mut self, buf: &mut [u8], len: usize, from: SocketAddr) {
        let now = Instant::now();
        let handler = self.handler.clone();
        let mut handler = handler.lock().await;

        handler.before_first_aircraft();
        let mut payload = self.process(&mut *handler, &buf[..len], from, now);
        for _ in 1..MAX_BATCH {
            match self.transport.try_recv_from(buf) {
                Ok(Some((len, from))) => {
                    payload |= self.process(&mut *handler, &buf[..len], from, Instant::now());
                }
                Ok(None) => break,
                Err(e) => {
                    self.transport_error(e);
                    break;
                }
            }
        }
        handler.after_last_aircraft();
        drop(handler);

        if payload {
            let transition = self.session.write().await.on_payload(now);
            if let Some(transition) = transition {
                info!("Receiving data from {}", from);
                self.emit(ReceiverEvent::StatusChanged(transition));
            }
        }
    }

    /// Decode and dispatch one datagram, returns whether it carried payload
    fn process(&mut self, handler: &mut H, data: &[u8], from: SocketAddr, now: Instant) -> bool {
        if data.len() > self.config.buffer_size {
            let error = CodecError::MessageTooLarge(data.len(), self.config.buffer_size);
            self.malformed(from, error, now);
            return false;
        }

        match decode(data) {
            Ok(frame) => {
                let ctx = MessageContext {
                    from,
                    sender_id: frame.sender_id(),
                    len: data.len(),
                    received_at: now,
                };
                trace!(
                    "{:?} ({} bytes) from {:#06x}@{}",
                    frame.message.message_type(),
                    data.len(),
                    ctx.sender_id,
                    from
                );
                dispatch(handler, &ctx, &frame.message)
            }
            Err(e) => {
                self.malformed(from, e, now);
                false
            }
        }
    }

    fn malformed(&mut self, from: SocketAddr, error: CodecError, now: Instant) {
        match self.last_warning {
            Some(last) if now.saturating_duration_since(last) < MALFORMED_WARN_INTERVAL => {
                debug!("Dropping datagram from {}: {}", from, error);
            }
            _ => {
                self.last_warning = Some(now);
                warn!("Dropping datagram from {}: {}", from, error);
            }
        }
    }

    async fn send_beacon(&mut self) {
        match self.transport.send_to(&self.beacon, self.config.group).await {
            Ok(_) => {
                debug!("Interest beacon sent to {}", self.config.group);
                self.emit(ReceiverEvent::BeaconSent);
            }
            Err(e) => self.transport_error(e),
        }
    }

    async fn housekeeping(&mut self) {
        let now = Instant::now();
        self.handler.lock().await.on_housekeeping(now);
        let transition = self.session.write().await.poll(now);
        if let Some(transition) = transition {
            info!("No data for {:?}, waiting for senders", self.config.sender_timeout);
            self.emit(ReceiverEvent::StatusChanged(transition));
        }
    }

    fn transport_error(&mut self, e: TransportError) {
        self.errors += 1;
        warn!("Receiver transport error ({}): {}", self.errors, e);
    }

    fn emit(&self, event: ReceiverEvent) {
        if self.event_tx.try_send(event).is_err() {
            trace!("Receiver event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{Fleet, FleetEvent};
    use crate::model::ModelRegistry;
    use crate::network::{FleetHandler, MemoryHub, MemoryTransport};
    use crate::protocol::{AircraftDetail, PositionUpdate, SettingsRecord};

    const WAIT: Duration = Duration::from_secs(2);

    type TestReceiver = Receiver<MemoryTransport, FleetHandler<ModelRegistry<u32>>>;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            group: "239.255.1.1:49788".parse().unwrap(),
            sender_id: 0x0100,
            buffer_size: 8192,
            beacon_interval: Duration::from_secs(15),
            sender_timeout: Duration::from_secs(40),
            cleanup_interval: Duration::from_secs(10),
        }
    }

    async fn started(
        config: ReceiverConfig,
    ) -> (TestReceiver, MemoryTransport, mpsc::Receiver<FleetEvent>) {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.endpoint().await);
        let peer = hub.endpoint().await;

        let mut registry = ModelRegistry::new();
        registry.register("Pkg", "C172", 17u32);
        let (fleet_tx, fleet_rx) = mpsc::channel(64);
        let fleet = Fleet::new(registry, config.sender_timeout);
        let handler = FleetHandler::new(fleet, fleet_tx);

        let mut receiver = Receiver::new(config, transport, handler);
        receiver.start().await.unwrap();
        (receiver, peer, fleet_rx)
    }

    async fn expect_beacon(peer: &MemoryTransport) {
        let mut buf = [0u8; 64];
        let (len, _) = time::timeout(WAIT, peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let frame = decode(&buf[..len]).unwrap();
        assert_eq!(frame.message, Message::Beacon);
        assert_eq!(frame.sender_id(), 0x0100);
    }

    async fn send(peer: &MemoryTransport, message: Message) {
        let datagram = Encoder::new(0x0009).to_datagram(&message).unwrap();
        peer.send_to(&datagram, peer.addr()).await.unwrap();
    }

    async fn next_event(events: &mut mpsc::Receiver<FleetEvent>) -> FleetEvent {
        time::timeout(WAIT, events.recv()).await.unwrap().unwrap()
    }

    fn detail(id: u32) -> AircraftDetail {
        AircraftDetail {
            id,
            short_id: "C172".into(),
            lat: 47.0,
            lon: 8.0,
            valid: true,
            visible: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_receives_fleet() {
        let (mut receiver, peer, mut events) = started(config()).await;
        expect_beacon(&peer).await;
        assert_eq!(receiver.status().await, SessionStatus::RecvWaiting);

        send(
            &peer,
            Message::Settings(SettingsRecord {
                name: "Remote".into(),
                ..Default::default()
            }),
        )
        .await;
        send(&peer, Message::AircraftDetails(vec![detail(1), detail(2), detail(3)])).await;

        assert!(matches!(
            next_event(&mut events).await,
            FleetEvent::SenderAdded { ref name, .. } if name == "Remote"
        ));
        for id in 1..=3 {
            assert!(matches!(
                next_event(&mut events).await,
                FleetEvent::AircraftAdded { id: got, .. } if got == id
            ));
        }
        assert_eq!(receiver.status().await, SessionStatus::Receiving);

        send(
            &peer,
            Message::PositionUpdates(vec![PositionUpdate {
                id: 2,
                d_lat: 100,
                ..Default::default()
            }]),
        )
        .await;
        send(&peer, Message::Removals(vec![1, 3])).await;
        assert!(matches!(
            next_event(&mut events).await,
            FleetEvent::AircraftRemoved { id: 1, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            FleetEvent::AircraftRemoved { id: 3, .. }
        ));

        {
            let handler = receiver.handler();
            let handler = handler.lock().await;
            let fleet = handler.fleet();
            assert_eq!(fleet.aircraft_count(), 1);
            let sender = fleet.senders().next().unwrap();
            assert_eq!(sender.key.addr, peer.addr().ip());
            let tracked = sender.aircraft(2).unwrap();
            assert!((tracked.lat - 47.000001).abs() < 1e-9);
        }

        tokio_test::assert_ok!(receiver.stop().await);
        assert_eq!(receiver.status().await, SessionStatus::Off);
        assert_eq!(receiver.handler().lock().await.fleet().sender_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_dropped() {
        let (mut receiver, peer, mut events) = started(config()).await;
        expect_beacon(&peer).await;

        peer.send_to(&[0x03, 0, 9, 0], peer.addr()).await.unwrap();
        peer.send_to(&[0x05, 0, 9, 0, 0, 0, 0, 0], peer.addr())
            .await
            .unwrap();
        let mut bad_length = Encoder::new(9)
            .to_datagram(&Message::Settings(SettingsRecord::default()))
            .unwrap()
            .to_vec();
        bad_length.push(0);
        peer.send_to(&bad_length, peer.addr()).await.unwrap();
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(receiver.status().await, SessionStatus::RecvWaiting);

        send(&peer, Message::Settings(SettingsRecord::default())).await;
        assert!(matches!(
            next_event(&mut events).await,
            FleetEvent::SenderAdded { .. }
        ));
        assert!(receiver.is_running().await);

        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_datagram_is_dropped_whole() {
        let mut config = config();
        config.buffer_size = 144;
        let (mut receiver, peer, mut events) = started(config).await;
        expect_beacon(&peer).await;

        send(&peer, Message::Settings(SettingsRecord::default())).await;
        assert!(matches!(next_event(&mut events).await, FleetEvent::SenderAdded { .. }));
        for id in 1..=3 {
            send(&peer, Message::AircraftDetails(vec![detail(id)])).await;
            assert!(matches!(next_event(&mut events).await, FleetEvent::AircraftAdded { .. }));
        }

        // 8 + 40 * 4 bytes, a whole number of ids both before and after a cut at 144
        send(&peer, Message::Removals((1..=40).collect())).await;
        send(&peer, Message::Removals(vec![2])).await;
        assert!(matches!(
            next_event(&mut events).await,
            FleetEvent::AircraftRemoved { id: 2, .. }
        ));

        {
            let handler = receiver.handler();
            let handler = handler.lock().await;
            assert_eq!(handler.fleet().aircraft_count(), 2);
        }

        receiver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_sender_expires() {
        let mut config = config();
        config.sender_timeout = Duration::from_millis(60);
        config.cleanup_interval = Duration::from_millis(20);
        let (mut receiver, peer, mut events) = started(config).await;
        let mut receiver_events = receiver.take_event_receiver().unwrap();
        expect_beacon(&peer).await;

        send(&peer, Message::Settings(SettingsRecord::default())).await;
        send(&peer, Message::AircraftDetails(vec![detail(5)])).await;
        assert!(matches!(next_event(&mut events).await, FleetEvent::SenderAdded { .. }));
        assert!(matches!(next_event(&mut events).await, FleetEvent::AircraftAdded { .. }));

        match next_event(&mut events).await {
            FleetEvent::SenderExpired { aircraft, .. } => assert_eq!(aircraft, vec![5]),
            other => panic!("expected expiry, got {:?}", other),
        }
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(receiver.status().await, SessionStatus::RecvWaiting);

        let mut transitions = Vec::new();
        while let Ok(event) = receiver_events.try_recv() {
            if let ReceiverEvent::StatusChanged(t) = event {
                transitions.push(t.to);
            }
        }
        assert_eq!(
            transitions,
            vec![
                SessionStatus::RecvWaiting,
                SessionStatus::Receiving,
                SessionStatus::RecvWaiting
            ]
        );

        receiver.stop().await.unwrap();
        assert!(matches!(receiver.stop().await, Err(ReceiverError::NotRunning)));
    }
}
