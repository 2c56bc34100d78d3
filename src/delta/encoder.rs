//! Sender-side delta encoder

use std::collections::HashMap;

use tracing::trace;

use crate::model::ModelKey;
use crate::protocol::{
    pack_alt_delta, pack_angle, pack_anim_values, pack_color, pack_degree_delta, pack_heading,
    pack_time_delta, pack_time_delta_saturating, unpack_alt_delta, unpack_degree_delta,
    unpack_time_delta, AircraftDetail, AircraftId, FixedStr, PositionUpdate, ANIM_CHANNEL_COUNT,
};

/// Snapshot of one local aircraft, as supplied by the simulator side
#[derive(Debug, Clone, PartialEq)]
pub struct AircraftState {
    pub id: AircraftId,
    pub icao_type: String,
    pub icao_op: String,
    pub model: ModelKey,
    pub label: String,
    /// RGBA, channels in `[0, 1]`
    pub label_color: [f32; 4],
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: f64,
    pub pitch: f32,
    pub heading: f32,
    pub roll: f32,
    pub ai_prio: i16,
    pub valid: bool,
    pub visible: bool,
    /// Animation values in natural units, indexed by `AnimChannel`
    pub anim: [f32; ANIM_CHANNEL_COUNT],
}

impl AircraftState {
    pub fn new(id: AircraftId) -> Self {
        Self {
            id,
            icao_type: String::new(),
            icao_op: String::new(),
            model: ModelKey::default(),
            label: String::new(),
            label_color: [1.0, 1.0, 0.0, 1.0],
            lat: 0.0,
            lon: 0.0,
            alt_ft: 0.0,
            pitch: 0.0,
            heading: 0.0,
            roll: 0.0,
            ai_prio: 0,
            valid: true,
            visible: true,
            anim: [0.0; ANIM_CHANNEL_COUNT],
        }
    }

    /// Build the full detail record
    pub fn to_detail(&self, d_time: u16) -> AircraftDetail {
        AircraftDetail {
            id: self.id,
            icao_type: FixedStr::new(&self.icao_type),
            icao_op: FixedStr::new(&self.icao_op),
            short_id: self.model.short_id,
            pkg_hash: self.model.pkg_hash,
            label: FixedStr::new(&self.label),
            label_color: pack_color(self.label_color),
            alt_ft: self.alt_ft as f32,
            lat: self.lat,
            lon: self.lon,
            pitch: pack_angle(self.pitch),
            heading: pack_heading(self.heading),
            roll: pack_angle(self.roll),
            ai_prio: self.ai_prio,
            d_time,
            valid: self.valid,
            visible: self.visible,
            anim: pack_anim_values(&self.anim),
        }
    }
}

/// Why a full detail record was chosen over a position update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullReason {
    /// First time this aircraft is sent
    New,
    /// Periodic resync of the aircraft's group
    ResyncGroup,
    /// Validity or visibility changed
    StatusChanged,
    ModelChanged,
    /// A lat/lon/alt delta does not fit 16 bits
    OutOfRange,
    /// Too much time passed for the time delta field
    TimeExceeded,
}

/// Encoded record for one aircraft
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Detail {
        detail: AircraftDetail,
        reason: FullReason,
    },
    Position(PositionUpdate),
}

/// What the receivers know about one aircraft
#[derive(Debug, Clone)]
struct Baseline {
    lat: f64,
    lon: f64,
    alt_ft: f64,
    timestamp: f64,
    valid: bool,
    visible: bool,
    model: ModelKey,
    group: u32,
}

impl Baseline {
    fn from_detail(detail: &AircraftDetail, model: ModelKey, now: f64, group: u32) -> Self {
        Self {
            lat: detail.lat,
            lon: detail.lon,
            // receivers only see the f32 altitude of the detail record
            alt_ft: f64::from(detail.alt_ft),
            timestamp: now,
            valid: detail.valid,
            visible: detail.visible,
            model,
            group,
        }
    }

    /// Try to express `state` as a position update and advance the
    /// baseline by exactly what the update carries
    fn delta_to(
        &mut self,
        state: &AircraftState,
        now: f64,
        due_group: Option<u32>,
    ) -> Result<PositionUpdate, FullReason> {
        if due_group == Some(self.group) {
            return Err(FullReason::ResyncGroup);
        }
        if self.valid != state.valid || self.visible != state.visible {
            return Err(FullReason::StatusChanged);
        }
        if self.model != state.model {
            return Err(FullReason::ModelChanged);
        }

        let (d_lat, d_lon, d_alt) = match (
            pack_degree_delta(state.lat - self.lat),
            pack_degree_delta(state.lon - self.lon),
            pack_alt_delta(state.alt_ft - self.alt_ft),
        ) {
            (Some(d_lat), Some(d_lon), Some(d_alt)) => (d_lat, d_lon, d_alt),
            _ => return Err(FullReason::OutOfRange),
        };
        let d_time = pack_time_delta(now - self.timestamp).ok_or(FullReason::TimeExceeded)?;

        self.lat += unpack_degree_delta(d_lat);
        self.lon += unpack_degree_delta(d_lon);
        self.alt_ft += unpack_alt_delta(d_alt);
        self.timestamp += unpack_time_delta(d_time);

        Ok(PositionUpdate {
            id: state.id,
            d_lat,
            d_lon,
            d_alt,
            d_time,
            pitch: pack_angle(state.pitch),
            heading: pack_heading(state.heading),
            roll: pack_angle(state.roll),
        })
    }
}

/// Chooses between full detail and position update per aircraft.
///
/// Drive it with [`begin_tick`](DeltaEncoder::begin_tick) once per
/// simulator frame, then [`encode`](DeltaEncoder::encode) every aircraft.
#[derive(Debug)]
pub struct DeltaEncoder {
    baselines: HashMap<AircraftId, Baseline>,
    /// Number of resync groups, one group per second
    full_detail_interval: u32,
    /// Minimum time between transmitting ticks [s]
    transmit_period: f64,
    next_transmit: f64,
    next_group: u32,
    current_group: Option<u32>,
    due_group: Option<u32>,
    now: f64,
}

impl DeltaEncoder {
    pub fn new(full_detail_interval_secs: u32, transmit_hz: u32) -> Self {
        Self {
            baselines: HashMap::new(),
            full_detail_interval: full_detail_interval_secs.max(1),
            transmit_period: 1.0 / f64::from(transmit_hz.max(1)),
            next_transmit: f64::NEG_INFINITY,
            next_group: 1,
            current_group: None,
            due_group: None,
            now: 0.0,
        }
    }

    /// Start a frame at `now` seconds on a monotonic clock.
    ///
    /// Returns `false` if the frame falls inside the transmit throttle, in
    /// which case no aircraft should be encoded.
    pub fn begin_tick(&mut self, now: f64) -> bool {
        if now < self.next_transmit {
            return false;
        }
        self.now = now;
        self.next_transmit = now + self.transmit_period;

        let interval = f64::from(self.full_detail_interval);
        let group = now.rem_euclid(interval) as u32 + 1;
        if self.current_group == Some(group) {
            self.due_group = None;
        } else {
            self.current_group = Some(group);
            self.due_group = Some(group);
        }
        true
    }

    /// Group due for a full resync in the current tick
    pub fn due_group(&self) -> Option<u32> {
        self.due_group
    }

    /// Encode one aircraft for the current tick
    pub fn encode(&mut self, state: &AircraftState) -> Outgoing {
        let now = self.now;
        let due_group = self.due_group;
        let delta = match self.baselines.get_mut(&state.id) {
            Some(baseline) => baseline.delta_to(state, now, due_group),
            None => Err(FullReason::New),
        };

        match delta {
            Ok(update) => Outgoing::Position(update),
            Err(reason) => {
                trace!("Full detail for aircraft {:#x}: {:?}", state.id, reason);
                self.full_detail(state, reason)
            }
        }
    }

    fn full_detail(&mut self, state: &AircraftState, reason: FullReason) -> Outgoing {
        let now = self.now;
        let (d_time, group) = match self.baselines.get(&state.id) {
            Some(baseline) => (
                pack_time_delta_saturating(now - baseline.timestamp),
                baseline.group,
            ),
            None => (0, self.assign_group()),
        };

        let detail = state.to_detail(d_time);
        self.baselines.insert(
            state.id,
            Baseline::from_detail(&detail, state.model, now, group),
        );
        Outgoing::Detail { detail, reason }
    }

    fn assign_group(&mut self) -> u32 {
        let group = self.next_group;
        self.next_group = self.next_group % self.full_detail_interval + 1;
        group
    }

    /// Forget an aircraft; returns whether it was known
    pub fn remove(&mut self, id: AircraftId) -> bool {
        self.baselines.remove(&id).is_some()
    }

    /// Forget all aircraft
    pub fn clear(&mut self) {
        self.baselines.clear();
    }

    pub fn contains(&self, id: AircraftId) -> bool {
        self.baselines.contains_key(&id)
    }

    /// Aircraft receivers currently know about
    pub fn ids(&self) -> impl Iterator<Item = AircraftId> + '_ {
        self.baselines.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaDecoder;
    use crate::protocol::DEGREE_RES;

    fn aircraft(id: AircraftId) -> AircraftState {
        let mut state = AircraftState::new(id);
        state.icao_type = "B738".to_string();
        state.model = ModelKey::new("XCSL", "B738_DLH");
        state.lat = 47.123456;
        state.lon = 8.123456;
        state.alt_ft = 2500.0;
        state
    }

    fn expect_position(out: Outgoing) -> PositionUpdate {
        match out {
            Outgoing::Position(update) => update,
            other => panic!("Expected position update, got {:?}", other),
        }
    }

    fn expect_detail(out: Outgoing) -> (AircraftDetail, FullReason) {
        match out {
            Outgoing::Detail { detail, reason } => (detail, reason),
            other => panic!("Expected detail, got {:?}", other),
        }
    }

    #[test]
    fn test_small_move_is_position_update() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let mut state = aircraft(1);

        assert!(encoder.begin_tick(0.0));
        let (detail, reason) = expect_detail(encoder.encode(&state));
        assert_eq!(reason, FullReason::New);
        assert_eq!(detail.d_time, 0);

        state.lat = 47.1234565;
        state.lon = 8.1234560;
        state.alt_ft = 2500.50;
        assert!(encoder.begin_tick(0.25));
        let update = expect_position(encoder.encode(&state));
        // 5e-7 degree in 1e-8 units
        assert_eq!(update.d_lat, 50);
        assert_eq!(update.d_lon, 0);
        assert_eq!(update.d_alt, 50);
        assert_eq!(update.d_time, 2500);

        let mut decoder = DeltaDecoder::new();
        decoder.apply_detail(detail);
        let tracked = decoder.apply_update(&update).unwrap();
        assert!((tracked.lat - 47.1234565).abs() < DEGREE_RES);
        assert!((tracked.lon - 8.1234560).abs() < DEGREE_RES);
        assert!((tracked.alt_ft - 2500.50).abs() < 0.01);
    }

    #[test]
    fn test_out_of_range_forces_detail() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let mut state = aircraft(1);
        encoder.begin_tick(0.0);
        encoder.encode(&state);

        // 0.001 degree is far beyond 32767e-8
        state.lat += 0.001;
        encoder.begin_tick(0.25);
        let (detail, reason) = expect_detail(encoder.encode(&state));
        assert_eq!(reason, FullReason::OutOfRange);
        assert_eq!(detail.lat, state.lat);
        assert_eq!(detail.d_time, 2500);

        // the baseline was reset, so a small step is a delta again
        state.alt_ft += 300.0;
        encoder.begin_tick(0.5);
        let update = expect_position(encoder.encode(&state));
        assert_eq!(update.d_alt, 30000);

        state.alt_ft += 400.0;
        encoder.begin_tick(0.75);
        assert_eq!(expect_detail(encoder.encode(&state)).1, FullReason::OutOfRange);
    }

    #[test]
    fn test_lon_out_of_range_forces_detail() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let mut state = aircraft(1);
        encoder.begin_tick(0.0);
        encoder.encode(&state);

        // -40000e-8 does not fit i16
        state.lon -= 0.0004;
        encoder.begin_tick(0.25);
        let (detail, reason) = expect_detail(encoder.encode(&state));
        assert_eq!(reason, FullReason::OutOfRange);
        assert_eq!(detail.lon, state.lon);

        state.lon -= 0.0003;
        encoder.begin_tick(0.5);
        let update = expect_position(encoder.encode(&state));
        assert_eq!(update.d_lon, -30000);
        assert_eq!(update.d_lat, 0);
    }

    #[test]
    fn test_time_exceeded_forces_detail() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let state = aircraft(1);
        encoder.begin_tick(0.0);
        encoder.encode(&state);

        encoder.begin_tick(7.0);
        let (detail, reason) = expect_detail(encoder.encode(&state));
        assert_eq!(reason, FullReason::TimeExceeded);
        assert_eq!(detail.d_time, u16::MAX);
    }

    #[test]
    fn test_status_and_model_changes() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let mut state = aircraft(1);
        encoder.begin_tick(0.0);
        encoder.encode(&state);

        state.visible = false;
        encoder.begin_tick(0.25);
        assert_eq!(expect_detail(encoder.encode(&state)).1, FullReason::StatusChanged);

        state.model = ModelKey::new("XCSL", "B738_AFR");
        encoder.begin_tick(0.5);
        assert_eq!(expect_detail(encoder.encode(&state)).1, FullReason::ModelChanged);

        encoder.begin_tick(0.75);
        expect_position(encoder.encode(&state));
    }

    #[test]
    fn test_transmit_throttle() {
        let mut encoder = DeltaEncoder::new(10, 5);
        assert!(encoder.begin_tick(0.0));
        assert!(!encoder.begin_tick(0.1));
        assert!(encoder.begin_tick(0.2));
        assert!(!encoder.begin_tick(0.3));
    }

    #[test]
    fn test_resync_group_cadence() {
        let mut encoder = DeltaEncoder::new(10, 5);
        let a = aircraft(1);
        let b = aircraft(2);

        encoder.begin_tick(0.0);
        assert_eq!(encoder.due_group(), Some(1));
        encoder.encode(&a); // group 1
        encoder.encode(&b); // group 2

        let mut resyncs = Vec::new();
        for step in 1..=48 {
            let now = f64::from(step) * 0.25;
            assert!(encoder.begin_tick(now));
            for state in [&a, &b] {
                if let Outgoing::Detail { reason, .. } = encoder.encode(state) {
                    assert_eq!(reason, FullReason::ResyncGroup);
                    resyncs.push((now, state.id));
                }
            }
        }
        // group 2 is due at 1 s and 11 s, group 1 again at 10 s
        assert_eq!(resyncs, vec![(1.0, 2), (10.0, 1), (11.0, 2)]);
    }

    #[test]
    fn test_rounding_does_not_accumulate() {
        let mut encoder = DeltaEncoder::new(1000, 5);
        let mut decoder = DeltaDecoder::new();
        let mut state = aircraft(9);

        encoder.begin_tick(0.0);
        decoder.apply_detail(expect_detail(encoder.encode(&state)).0);

        // each step is below half a resolution unit and rounds to zero alone
        for step in 1..=40 {
            state.lat += 0.4 * DEGREE_RES;
            state.lon -= 0.4 * DEGREE_RES;
            encoder.begin_tick(f64::from(step) * 0.25);
            let update = expect_position(encoder.encode(&state));
            let tracked = decoder.apply_update(&update).unwrap();
            assert!((tracked.lat - state.lat).abs() <= 0.5 * DEGREE_RES + 1e-12);
            assert!((tracked.lon - state.lon).abs() <= 0.5 * DEGREE_RES + 1e-12);
        }
    }

    #[test]
    fn test_remove_and_clear() {
        let mut encoder = DeltaEncoder::new(10, 5);
        encoder.begin_tick(0.0);
        encoder.encode(&aircraft(1));
        encoder.encode(&aircraft(2));
        assert_eq!(encoder.len(), 2);

        assert!(encoder.remove(1));
        assert!(!encoder.remove(1));
        assert!(!encoder.contains(1));

        encoder.begin_tick(0.25);
        assert_eq!(expect_detail(encoder.encode(&aircraft(1))).1, FullReason::New);

        encoder.clear();
        assert!(encoder.is_empty());
    }

    #[test]
    fn test_detail_fields() {
        let mut state = aircraft(0xABCDEF);
        state.label = "DLH 4KL".to_string();
        state.heading = -90.0;
        state.pitch = 2.5;
        state.anim[0] = 1.0;

        let detail = state.to_detail(0);
        assert_eq!(detail.short_id.as_str(), "B738_DLH");
        assert_eq!(detail.pkg_hash, crate::protocol::package_hash("XCSL"));
        assert_eq!(detail.heading, 27000);
        assert_eq!(detail.pitch, 250);
        assert_eq!(detail.anim[0], 255);
        assert_eq!(detail.label_color, [255, 255, 0]);
    }
}
