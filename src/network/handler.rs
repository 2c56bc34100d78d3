//! Dispatch of received messages
//!
//! The receiver driver decodes each datagram and hands the typed payload
//! to a [`RemoteHandler`]. All handler methods default to doing nothing,
//! so an implementation only overrides the message kinds it cares about.

use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

use crate::fleet::{Fleet, FleetEvent, SenderKey};
use crate::model::ModelResolver;
use crate::protocol::{AircraftDetail, AircraftId, Message, PositionUpdate, SettingsRecord};

/// Where a received message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Source address of the datagram
    pub from: SocketAddr,
    /// Sender id from the message header
    pub sender_id: u16,
    /// Datagram length including the header
    pub len: usize,
    pub received_at: Instant,
}

impl MessageContext {
    pub fn sender_key(&self) -> SenderKey {
        SenderKey::new(self.sender_id, self.from.ip())
    }
}

/// Receives decoded messages from the receiver driver
pub trait RemoteHandler: Send {
    /// Called before the first message of a batch drained in one wake-up
    fn before_first_aircraft(&mut self) {}

    /// Called after the last message of a batch
    fn after_last_aircraft(&mut self) {}

    fn on_settings(&mut self, _ctx: &MessageContext, _settings: &SettingsRecord) {}

    fn on_aircraft_details(&mut self, _ctx: &MessageContext, _details: &[AircraftDetail]) {}

    fn on_position_updates(&mut self, _ctx: &MessageContext, _updates: &[PositionUpdate]) {}

    fn on_removals(&mut self, _ctx: &MessageContext, _ids: &[AircraftId]) {}

    /// Periodic cleanup tick of the receiver driver
    fn on_housekeeping(&mut self, _now: Instant) {}

    /// Receiving stopped, drop all remote state
    fn on_stop(&mut self) {}
}

/// Route a message to the matching handler method.
///
/// Returns `true` for payload messages, `false` for interest beacons,
/// which receivers ignore.
pub fn dispatch<H: RemoteHandler + ?Sized>(
    handler: &mut H,
    ctx: &MessageContext,
    message: &Message,
) -> bool {
    match message {
        Message::Beacon => return false,
        Message::Settings(settings) => handler.on_settings(ctx, settings),
        Message::AircraftDetails(details) => handler.on_aircraft_details(ctx, details),
        Message::PositionUpdates(updates) => handler.on_position_updates(ctx, updates),
        Message::Removals(ids) => handler.on_removals(ctx, ids),
    }
    true
}

/// Handler feeding received messages into a [`Fleet`]
pub struct FleetHandler<R: ModelResolver> {
    fleet: Fleet<R>,
    event_tx: mpsc::Sender<FleetEvent>,
    batch_events: usize,
}

impl<R: ModelResolver> FleetHandler<R> {
    /// Create a handler, fleet changes are reported on `event_tx`
    pub fn new(fleet: Fleet<R>, event_tx: mpsc::Sender<FleetEvent>) -> Self {
        Self {
            fleet,
            event_tx,
            batch_events: 0,
        }
    }

    pub fn fleet(&self) -> &Fleet<R> {
        &self.fleet
    }

    pub fn fleet_mut(&mut self) -> &mut Fleet<R> {
        &mut self.fleet
    }

    fn emit(&mut self, events: Vec<FleetEvent>) {
        for event in events {
            self.batch_events += 1;
            if self.event_tx.try_send(event).is_err() {
                debug!("Fleet event dropped, no consumer keeping up");
            }
        }
    }
}

impl<R> RemoteHandler for FleetHandler<R>
where
    R: ModelResolver + Send,
    R::Handle: Send,
{
    fn before_first_aircraft(&mut self) {
        self.batch_events = 0;
    }

    fn after_last_aircraft(&mut self) {
        if self.batch_events > 0 {
            debug!(
                "Batch done: {} fleet events, {} senders, {} aircraft",
                self.batch_events,
                self.fleet.sender_count(),
                self.fleet.aircraft_count()
            );
        }
    }

    fn on_settings(&mut self, ctx: &MessageContext, settings: &SettingsRecord) {
        let events = self
            .fleet
            .apply_settings(ctx.sender_key(), *settings, ctx.received_at);
        self.emit(events);
    }

    fn on_aircraft_details(&mut self, ctx: &MessageContext, details: &[AircraftDetail]) {
        let events = self
            .fleet
            .apply_details(ctx.sender_key(), details, ctx.received_at);
        self.emit(events);
    }

    fn on_position_updates(&mut self, ctx: &MessageContext, updates: &[PositionUpdate]) {
        let events = self
            .fleet
            .apply_updates(ctx.sender_key(), updates, ctx.received_at);
        self.emit(events);
    }

    fn on_removals(&mut self, ctx: &MessageContext, ids: &[AircraftId]) {
        let events = self
            .fleet
            .apply_removals(ctx.sender_key(), ids, ctx.received_at);
        self.emit(events);
    }

    fn on_housekeeping(&mut self, now: Instant) {
        let events = self.fleet.expire_senders(now);
        self.emit(events);
    }

    fn on_stop(&mut self) {
        self.fleet.clear();
    }
}
