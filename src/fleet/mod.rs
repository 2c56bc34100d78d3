//! Fleet module - Receiver-side view of all remote senders and aircraft
//!
//! Senders are keyed by their 16-bit id together with their IP address, as
//! two instances on different hosts may pick the same id. A sender becomes
//! known through its settings message; aircraft data from unknown senders
//! is ignored until the next settings broadcast.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::delta::{DeltaDecoder, DeltaError, DetailOutcome, TrackedAircraft};
use crate::model::{MatchKind, ModelResolver};
use crate::protocol::{
    AircraftDetail, AircraftId, PositionUpdate, SettingsFlags, SettingsRecord,
};

/// Identifies a remote sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderKey {
    pub sender_id: u16,
    pub addr: IpAddr,
}

impl SenderKey {
    pub fn new(sender_id: u16, addr: IpAddr) -> Self {
        Self { sender_id, addr }
    }
}

impl fmt::Display for SenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}@{}", self.sender_id, self.addr)
    }
}

/// Settings of all senders combined into one effective value
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSettings {
    /// Name of the first registered sender
    pub name: String,
    pub max_label_dist: f32,
    pub default_icao: String,
    pub car_icao: String,
    pub flags: SettingsFlags,
}

impl MergedSettings {
    fn from_first(settings: &SettingsRecord) -> Self {
        Self {
            name: settings.name.as_str().into_owned(),
            max_label_dist: settings.max_label_dist,
            default_icao: settings.default_icao.as_str().into_owned(),
            car_icao: settings.car_icao.as_str().into_owned(),
            flags: settings.flags,
        }
    }

    /// Fold another sender's flags into the merged value
    fn merge(&mut self, other: &SettingsFlags) {
        let merged = &mut self.flags;
        merged.log_level = merged.log_level.min(other.log_level);
        merged.log_model_match |= other.log_model_match;
        merged.replace_obj_datarefs |= other.replace_obj_datarefs;
        merged.replace_obj_textures |= other.replace_obj_textures;
        merged.label_cutoff_at_visibility &= other.label_cutoff_at_visibility;
        merged.map_enabled |= other.map_enabled;
        merged.map_labels |= other.map_labels;
        merged.have_tcas_control |= other.have_tcas_control;
    }
}

/// Model resolved for one remote aircraft
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel<H> {
    pub handle: Option<H>,
    pub kind: Option<MatchKind>,
}

/// One remote sender and its aircraft
#[derive(Debug)]
pub struct RemoteSender<H> {
    pub key: SenderKey,
    pub settings: SettingsRecord,
    pub last_seen: Instant,
    decoder: DeltaDecoder,
    models: HashMap<AircraftId, ResolvedModel<H>>,
}

impl<H: Clone> RemoteSender<H> {
    fn new(key: SenderKey, settings: SettingsRecord, now: Instant) -> Self {
        Self {
            key,
            settings,
            last_seen: now,
            decoder: DeltaDecoder::new(),
            models: HashMap::new(),
        }
    }

    pub fn name(&self) -> String {
        self.settings.name.as_str().into_owned()
    }

    pub fn aircraft(&self, id: AircraftId) -> Option<&TrackedAircraft> {
        self.decoder.get(id)
    }

    pub fn model(&self, id: AircraftId) -> Option<&ResolvedModel<H>> {
        self.models.get(&id)
    }

    pub fn aircraft_count(&self) -> usize {
        self.decoder.len()
    }

    pub fn iter_aircraft(&self) -> impl Iterator<Item = &TrackedAircraft> {
        self.decoder.iter()
    }

    pub fn is_pending_resync(&self, id: AircraftId) -> bool {
        self.decoder.is_pending_resync(id)
    }
}

/// Changes to the fleet worth reporting
#[derive(Debug, Clone, PartialEq)]
pub enum FleetEvent {
    SenderAdded {
        sender: SenderKey,
        name: String,
    },
    SettingsChanged {
        sender: SenderKey,
    },
    /// Sender went silent, its aircraft are gone
    SenderExpired {
        sender: SenderKey,
        aircraft: Vec<AircraftId>,
    },
    AircraftAdded {
        sender: SenderKey,
        id: AircraftId,
        model: Option<MatchKind>,
    },
    ModelChanged {
        sender: SenderKey,
        id: AircraftId,
        model: Option<MatchKind>,
    },
    AircraftRemoved {
        sender: SenderKey,
        id: AircraftId,
    },
    /// Position update for an aircraft without detail record
    AwaitingResync {
        sender: SenderKey,
        id: AircraftId,
    },
}

/// Receiver-side cache of every sender's aircraft
pub struct Fleet<R: ModelResolver> {
    resolver: R,
    senders: HashMap<SenderKey, RemoteSender<R::Handle>>,
    /// Registration order, the first sender dominates merged settings
    order: Vec<SenderKey>,
    merged: Option<MergedSettings>,
    sender_timeout: Duration,
}

impl<R: ModelResolver> Fleet<R> {
    pub fn new(resolver: R, sender_timeout: Duration) -> Self {
        Self {
            resolver,
            senders: HashMap::new(),
            order: Vec::new(),
            merged: None,
            sender_timeout,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Register a sender or replace its settings
    pub fn apply_settings(
        &mut self,
        key: SenderKey,
        settings: SettingsRecord,
        now: Instant,
    ) -> Vec<FleetEvent> {
        let event = match self.senders.get_mut(&key) {
            Some(sender) => {
                sender.last_seen = now;
                if sender.settings == settings {
                    None
                } else {
                    sender.settings = settings;
                    Some(FleetEvent::SettingsChanged { sender: key })
                }
            }
            None => {
                let sender = RemoteSender::new(key, settings, now);
                info!("New sender {} '{}'", key, sender.name());
                let name = sender.name();
                self.senders.insert(key, sender);
                self.order.push(key);
                Some(FleetEvent::SenderAdded { sender: key, name })
            }
        };

        if event.is_some() {
            self.merge_settings();
        }
        event.into_iter().collect()
    }

    /// Replace or add aircraft from full detail records
    pub fn apply_details(
        &mut self,
        key: SenderKey,
        details: &[AircraftDetail],
        now: Instant,
    ) -> Vec<FleetEvent> {
        let resolver = &self.resolver;
        let Some(sender) = touch(&mut self.senders, key, now) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for detail in details {
            let id = detail.id;
            let (pkg_hash, short_id) = (detail.pkg_hash, detail.short_id);
            let outcome = sender.decoder.apply_detail(detail.clone());
            let needs_model = match outcome {
                DetailOutcome::Added => true,
                DetailOutcome::Replaced { model_changed } => model_changed,
            };
            if !needs_model {
                continue;
            }

            let resolved = match resolver.resolve_match(pkg_hash, &short_id.as_str()) {
                Some((handle, kind)) => ResolvedModel {
                    handle: Some(handle),
                    kind: Some(kind),
                },
                None => {
                    debug!("No model for {} {:#06x}/{}", key, pkg_hash, short_id);
                    ResolvedModel {
                        handle: None,
                        kind: None,
                    }
                }
            };
            let model = resolved.kind;
            sender.models.insert(id, resolved);
            events.push(match outcome {
                DetailOutcome::Added => FleetEvent::AircraftAdded {
                    sender: key,
                    id,
                    model,
                },
                DetailOutcome::Replaced { .. } => FleetEvent::ModelChanged {
                    sender: key,
                    id,
                    model,
                },
            });
        }
        events
    }

    /// Apply incremental position updates
    pub fn apply_updates(
        &mut self,
        key: SenderKey,
        updates: &[PositionUpdate],
        now: Instant,
    ) -> Vec<FleetEvent> {
        let Some(sender) = touch(&mut self.senders, key, now) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for update in updates {
            let already_pending = sender.decoder.is_pending_resync(update.id);
            if let Err(DeltaError::UnknownAircraft(id)) = sender.decoder.apply_update(update) {
                if already_pending {
                    trace!("Skipping update for {:#x} from {}, awaiting detail", id, key);
                } else {
                    debug!("Position update for unknown aircraft {:#x} from {}", id, key);
                    events.push(FleetEvent::AwaitingResync { sender: key, id });
                }
            }
        }
        events
    }

    /// Drop aircraft by id
    pub fn apply_removals(
        &mut self,
        key: SenderKey,
        ids: &[AircraftId],
        now: Instant,
    ) -> Vec<FleetEvent> {
        let Some(sender) = touch(&mut self.senders, key, now) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|&id| {
                sender.models.remove(&id);
                sender
                    .decoder
                    .remove(id)
                    .map(|_| FleetEvent::AircraftRemoved { sender: key, id })
            })
            .collect()
    }

    /// Remove senders that were silent for longer than the sender timeout
    pub fn expire_senders(&mut self, now: Instant) -> Vec<FleetEvent> {
        let timeout = self.sender_timeout;
        let expired: Vec<SenderKey> = self
            .senders
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > timeout)
            .map(|s| s.key)
            .collect();

        let events: Vec<FleetEvent> = expired
            .into_iter()
            .filter_map(|key| self.remove_sender(key))
            .collect();
        if !events.is_empty() {
            self.merge_settings();
        }
        events
    }

    fn remove_sender(&mut self, key: SenderKey) -> Option<FleetEvent> {
        let sender = self.senders.remove(&key)?;
        self.order.retain(|k| *k != key);
        info!("Sender {} '{}' lost", key, sender.name());
        let mut aircraft: Vec<AircraftId> = sender.decoder.ids().collect();
        aircraft.sort_unstable();
        Some(FleetEvent::SenderExpired {
            sender: key,
            aircraft,
        })
    }

    fn merge_settings(&mut self) {
        let mut ordered = self.order.iter().filter_map(|k| self.senders.get(k));
        self.merged = ordered.next().map(|first| {
            let mut merged = MergedSettings::from_first(&first.settings);
            for other in ordered {
                merged.merge(&other.settings.flags);
            }
            merged
        });
    }

    pub fn merged_settings(&self) -> Option<&MergedSettings> {
        self.merged.as_ref()
    }

    pub fn sender(&self, key: &SenderKey) -> Option<&RemoteSender<R::Handle>> {
        self.senders.get(key)
    }

    pub fn senders(&self) -> impl Iterator<Item = &RemoteSender<R::Handle>> {
        self.order.iter().filter_map(|k| self.senders.get(k))
    }

    pub fn aircraft(&self, key: &SenderKey, id: AircraftId) -> Option<&TrackedAircraft> {
        self.senders.get(key).and_then(|s| s.aircraft(id))
    }

    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    /// Aircraft over all senders
    pub fn aircraft_count(&self) -> usize {
        self.senders.values().map(|s| s.aircraft_count()).sum()
    }

    /// Drop everything, as when receiving stops
    pub fn clear(&mut self) {
        self.senders.clear();
        self.order.clear();
        self.merged = None;
    }
}

/// Look up a sender and refresh its last-seen instant
fn touch<H>(
    senders: &mut HashMap<SenderKey, RemoteSender<H>>,
    key: SenderKey,
    now: Instant,
) -> Option<&mut RemoteSender<H>> {
    match senders.get_mut(&key) {
        Some(sender) => {
            sender.last_seen = now;
            Some(sender)
        }
        None => {
            debug!("Ignoring aircraft data from unregistered sender {}", key);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use crate::protocol::package_hash;
    use std::net::Ipv4Addr;

    fn key(id: u16, last_octet: u8) -> SenderKey {
        SenderKey::new(id, IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)))
    }

    fn settings(name: &str, flags: SettingsFlags) -> SettingsRecord {
        SettingsRecord {
            name: name.into(),
            max_label_dist: 3000.0,
            default_icao: "A320".into(),
            car_icao: "ZZZC".into(),
            flags,
        }
    }

    fn detail(id: AircraftId, short_id: &str, pkg: &str) -> AircraftDetail {
        AircraftDetail {
            id,
            short_id: short_id.into(),
            pkg_hash: package_hash(pkg),
            lat: 10.0,
            lon: 20.0,
            alt_ft: 5000.0,
            valid: true,
            visible: true,
            ..Default::default()
        }
    }

    fn fleet() -> Fleet<ModelRegistry<&'static str>> {
        let mut registry = ModelRegistry::new();
        registry.register("XCSL", "B738_DLH", "xcsl-b738");
        registry.register("XCSL", "A320_AFR", "xcsl-a320");
        Fleet::new(registry, Duration::from_secs(40))
    }

    #[test]
    fn test_unregistered_sender_ignored() {
        let mut fleet = fleet();
        let now = Instant::now();
        let events = fleet.apply_details(key(1, 10), &[detail(1, "B738_DLH", "XCSL")], now);
        assert!(events.is_empty());
        assert_eq!(fleet.aircraft_count(), 0);
    }

    #[test]
    fn test_senders_keyed_by_id_and_address() {
        let mut fleet = fleet();
        let now = Instant::now();
        fleet.apply_settings(key(1, 10), settings("A", SettingsFlags::default()), now);
        fleet.apply_settings(key(1, 11), settings("B", SettingsFlags::default()), now);
        assert_eq!(fleet.sender_count(), 2);

        // same settings again is not a change
        let events = fleet.apply_settings(key(1, 10), settings("A", SettingsFlags::default()), now);
        assert!(events.is_empty());
    }

    #[test]
    fn test_settings_merge() {
        let mut fleet = fleet();
        let now = Instant::now();
        let first = SettingsFlags {
            log_level: 3,
            label_cutoff_at_visibility: true,
            ..Default::default()
        };
        let second = SettingsFlags {
            log_level: 1,
            map_enabled: true,
            have_tcas_control: true,
            label_cutoff_at_visibility: false,
            ..Default::default()
        };
        let events = fleet.apply_settings(key(1, 10), settings("First", first), now);
        assert_eq!(
            events,
            vec![FleetEvent::SenderAdded {
                sender: key(1, 10),
                name: "First".to_string()
            }]
        );
        fleet.apply_settings(key(2, 10), settings("Second", second), now);

        let merged = fleet.merged_settings().unwrap();
        assert_eq!(merged.name, "First");
        assert_eq!(merged.default_icao, "A320");
        assert_eq!(merged.flags.log_level, 1);
        assert!(merged.flags.map_enabled);
        assert!(merged.flags.have_tcas_control);
        assert!(!merged.flags.label_cutoff_at_visibility);
        assert!(!merged.flags.replace_obj_textures);
    }

    #[test]
    fn test_details_resolve_models() {
        let mut fleet = fleet();
        let now = Instant::now();
        let k = key(7, 20);
        fleet.apply_settings(k, settings("S", SettingsFlags::default()), now);

        let events = fleet.apply_details(
            k,
            &[
                detail(1, "B738_DLH", "XCSL"),
                detail(2, "A320_AFR", "Bluebell"),
                detail(3, "C172", "XCSL"),
            ],
            now,
        );
        assert_eq!(
            events,
            vec![
                FleetEvent::AircraftAdded {
                    sender: k,
                    id: 1,
                    model: Some(MatchKind::Exact)
                },
                FleetEvent::AircraftAdded {
                    sender: k,
                    id: 2,
                    model: Some(MatchKind::ShortIdOnly)
                },
                FleetEvent::AircraftAdded {
                    sender: k,
                    id: 3,
                    model: None
                },
            ]
        );
        let sender = fleet.sender(&k).unwrap();
        assert_eq!(sender.model(2).unwrap().handle, Some("xcsl-a320"));

        // same model again: no event; changed model: re-resolved
        assert!(fleet
            .apply_details(k, &[detail(1, "B738_DLH", "XCSL")], now)
            .is_empty());
        let events = fleet.apply_details(k, &[detail(1, "A320_AFR", "XCSL")], now);
        assert_eq!(
            events,
            vec![FleetEvent::ModelChanged {
                sender: k,
                id: 1,
                model: Some(MatchKind::Exact)
            }]
        );
    }

    #[test]
    fn test_update_for_unknown_aircraft() {
        let mut fleet = fleet();
        let now = Instant::now();
        let k = key(7, 20);
        fleet.apply_settings(k, settings("S", SettingsFlags::default()), now);

        let update = PositionUpdate {
            id: 99,
            d_lat: 5,
            ..Default::default()
        };
        let events = fleet.apply_updates(k, &[update], now);
        assert_eq!(events, vec![FleetEvent::AwaitingResync { sender: k, id: 99 }]);
        assert!(fleet.sender(&k).unwrap().is_pending_resync(99));
        assert!(fleet.aircraft(&k, 99).is_none());

        // reported once until the detail arrives
        assert!(fleet.apply_updates(k, &[update, update], now).is_empty());
        assert!(fleet.sender(&k).unwrap().is_pending_resync(99));

        fleet.apply_details(k, &[detail(99, "C172", "XCSL")], now);
        assert!(!fleet.sender(&k).unwrap().is_pending_resync(99));
        assert!(fleet.apply_updates(k, &[update], now).is_empty());
        let tracked = fleet.aircraft(&k, 99).unwrap();
        assert!((tracked.lat - 10.000_000_05).abs() < 1e-9);
    }

    #[test]
    fn test_removal_of_three() {
        let mut fleet = fleet();
        let now = Instant::now();
        let k = key(7, 20);
        fleet.apply_settings(k, settings("S", SettingsFlags::default()), now);
        let details: Vec<AircraftDetail> =
            (1..=6).map(|id| detail(id, "B738_DLH", "XCSL")).collect();
        fleet.apply_details(k, &details, now);

        let events = fleet.apply_removals(k, &[2, 4, 6], now);
        assert_eq!(events.len(), 3);
        let sender = fleet.sender(&k).unwrap();
        let mut left: Vec<AircraftId> = sender.iter_aircraft().map(|a| a.id()).collect();
        left.sort_unstable();
        assert_eq!(left, vec![1, 3, 5]);
        assert!(sender.model(2).is_none());
    }

    #[test]
    fn test_sender_timeout() {
        let mut fleet = fleet();
        let t0 = Instant::now();
        let quiet = key(1, 10);
        let chatty = key(2, 10);
        fleet.apply_settings(quiet, settings("Quiet", SettingsFlags::default()), t0);
        fleet.apply_settings(chatty, settings("Chatty", SettingsFlags::default()), t0);
        fleet.apply_details(quiet, &[detail(2, "C172", "XCSL"), detail(1, "C172", "XCSL")], t0);

        let t1 = t0 + Duration::from_secs(30);
        fleet.apply_updates(chatty, &[], t1);
        assert!(fleet.expire_senders(t1).is_empty());

        let events = fleet.expire_senders(t0 + Duration::from_secs(41));
        assert_eq!(
            events,
            vec![FleetEvent::SenderExpired {
                sender: quiet,
                aircraft: vec![1, 2]
            }]
        );
        assert_eq!(fleet.sender_count(), 1);
        assert_eq!(fleet.merged_settings().unwrap().name, "Chatty");
    }
}
