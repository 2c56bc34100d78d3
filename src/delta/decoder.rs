//! Receiver-side reconstruction of absolute aircraft state

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::model::ModelKey;
use crate::protocol::{
    unpack_alt_delta, unpack_anim_values, unpack_degree_delta, AircraftDetail, AircraftId,
    PositionUpdate, ANIM_CHANNEL_COUNT,
};

/// Delta application errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaError {
    #[error("Position update for unknown aircraft {0:#x}")]
    UnknownAircraft(AircraftId),
}

pub type DeltaResult<T> = Result<T, DeltaError>;

/// Last known absolute state of one remote aircraft
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedAircraft {
    /// Most recent detail record, attitude kept current by updates
    pub detail: AircraftDetail,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: f64,
    /// Time delta of the last applied record [s]
    pub d_time: f64,
    /// Position updates applied since the last detail record
    pub updates_since_detail: u32,
}

impl TrackedAircraft {
    pub fn from_detail(detail: AircraftDetail) -> Self {
        Self {
            lat: detail.lat,
            lon: detail.lon,
            alt_ft: f64::from(detail.alt_ft),
            d_time: detail.d_time_secs(),
            updates_since_detail: 0,
            detail,
        }
    }

    pub fn id(&self) -> AircraftId {
        self.detail.id
    }

    pub fn model_key(&self) -> ModelKey {
        ModelKey {
            pkg_hash: self.detail.pkg_hash,
            short_id: self.detail.short_id,
        }
    }

    pub fn pitch(&self) -> f32 {
        self.detail.pitch_deg()
    }

    pub fn heading(&self) -> f32 {
        self.detail.heading_deg()
    }

    pub fn roll(&self) -> f32 {
        self.detail.roll_deg()
    }

    pub fn anim_values(&self) -> [f32; ANIM_CHANNEL_COUNT] {
        unpack_anim_values(&self.detail.anim)
    }

    /// Add the update's deltas to the current position
    pub fn apply_update(&mut self, update: &PositionUpdate) {
        self.lat += unpack_degree_delta(update.d_lat);
        self.lon += unpack_degree_delta(update.d_lon);
        self.alt_ft += unpack_alt_delta(update.d_alt);
        self.d_time = update.d_time_secs();
        self.detail.pitch = update.pitch;
        self.detail.heading = update.heading;
        self.detail.roll = update.roll;
        self.updates_since_detail += 1;
    }
}

/// Result of applying a detail record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailOutcome {
    Added,
    Replaced { model_changed: bool },
}

/// Per-sender cache of remote aircraft
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    aircraft: HashMap<AircraftId, TrackedAircraft>,
    /// Aircraft that sent an update before any detail
    pending_resync: HashSet<AircraftId>,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached state with a full record
    pub fn apply_detail(&mut self, detail: AircraftDetail) -> DetailOutcome {
        self.pending_resync.remove(&detail.id);
        let id = detail.id;
        let tracked = TrackedAircraft::from_detail(detail);
        match self.aircraft.insert(id, tracked) {
            Some(previous) => DetailOutcome::Replaced {
                model_changed: previous.model_key() != self.aircraft[&id].model_key(),
            },
            None => DetailOutcome::Added,
        }
    }

    /// Apply a position update.
    ///
    /// Updates for unknown aircraft cannot be applied; the id is marked
    /// as pending a full resync instead.
    pub fn apply_update(&mut self, update: &PositionUpdate) -> DeltaResult<&TrackedAircraft> {
        match self.aircraft.get_mut(&update.id) {
            Some(tracked) => {
                tracked.apply_update(update);
                Ok(tracked)
            }
            None => {
                self.pending_resync.insert(update.id);
                Err(DeltaError::UnknownAircraft(update.id))
            }
        }
    }

    pub fn remove(&mut self, id: AircraftId) -> Option<TrackedAircraft> {
        self.pending_resync.remove(&id);
        self.aircraft.remove(&id)
    }

    pub fn clear(&mut self) {
        self.aircraft.clear();
        self.pending_resync.clear();
    }

    pub fn get(&self, id: AircraftId) -> Option<&TrackedAircraft> {
        self.aircraft.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedAircraft> {
        self.aircraft.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = AircraftId> + '_ {
        self.aircraft.keys().copied()
    }

    pub fn is_pending_resync(&self, id: AircraftId) -> bool {
        self.pending_resync.contains(&id)
    }

    pub fn pending_resync_count(&self) -> usize {
        self.pending_resync.len()
    }

    pub fn len(&self) -> usize {
        self.aircraft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aircraft.is_empty()
    }
}
