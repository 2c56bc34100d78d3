//! Value quantization
//!
//! Converts floating point quantities to and from the fixed-width integers
//! carried on the wire. Every conversion is lossy by a bounded amount: the
//! round trip error stays below one resolution unit inside the valid domain.

use thiserror::Error;

/// Resolution of pitch, heading and roll [degree]
pub const ANGLE_RES: f32 = 0.01;

/// Resolution of latitude/longitude deltas [degree]
pub const DEGREE_RES: f64 = 0.000_000_01;

/// Largest latitude/longitude delta a position update can carry [degree]
pub const MAX_DIFF_DEGREE: f64 = DEGREE_RES * i16::MAX as f64;

/// Resolution of altitude deltas [ft]
pub const ALT_FT_RES: f64 = 0.01;

/// Largest altitude delta a position update can carry [ft]
pub const MAX_DIFF_ALT_FT: f64 = ALT_FT_RES * i16::MAX as f64;

/// Resolution of time deltas [s]
pub const TIME_RES: f64 = 0.0001;

/// Largest time delta a record can carry [s]
pub const MAX_DIFF_TIME: f64 = TIME_RES * u16::MAX as f64;

/// Number of animation channels carried in an aircraft detail record
pub const ANIM_CHANNEL_COUNT: usize = 42;

/// Value conversion errors
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ValueError {
    #[error("Packing range must not be zero (min: {min}, max: {max})")]
    ZeroRange { min: f32, max: f32 },
}

/// Normalize a heading into `[0, 360)`
pub fn normalize_heading(heading: f32) -> f32 {
    let h = heading.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if h >= 360.0 {
        0.0
    } else {
        h
    }
}

/// Pack pitch or roll into hundredths of a degree, saturating at the i16 range
pub fn pack_angle(degrees: f32) -> i16 {
    (degrees / ANGLE_RES).round() as i16
}

/// Unpack pitch or roll
pub fn unpack_angle(packed: i16) -> f32 {
    f32::from(packed) * ANGLE_RES
}

/// Pack a heading into hundredths of a degree.
///
/// Any finite input is normalized into `[0, 360)` first, so headings from
/// a maneuver that crossed north (`-5.0`, `365.0`) wrap instead of
/// saturating. NaN packs as 0.
pub fn pack_heading(degrees: f32) -> u16 {
    let centi = (normalize_heading(degrees) / ANGLE_RES).round() as u32;
    (centi % 36_000) as u16
}

/// Unpack a heading
pub fn unpack_heading(packed: u16) -> f32 {
    f32::from(packed) * ANGLE_RES
}

/// Pack an elapsed time into 1/10000 s, `None` if it exceeds [`MAX_DIFF_TIME`]
/// or is negative
pub fn pack_time_delta(secs: f64) -> Option<u16> {
    let ticks = (secs / TIME_RES).round();
    if (0.0..=f64::from(u16::MAX)).contains(&ticks) {
        Some(ticks as u16)
    } else {
        None
    }
}

/// Pack an elapsed time, clamping to the representable range
pub fn pack_time_delta_saturating(secs: f64) -> u16 {
    (secs / TIME_RES).round() as u16
}

/// Unpack an elapsed time into seconds
pub fn unpack_time_delta(packed: u16) -> f64 {
    f64::from(packed) * TIME_RES
}

/// Pack a latitude/longitude difference, `None` if out of range
pub fn pack_degree_delta(diff: f64) -> Option<i16> {
    quantize_i16(diff, DEGREE_RES)
}

/// Unpack a latitude/longitude difference
pub fn unpack_degree_delta(packed: i16) -> f64 {
    f64::from(packed) * DEGREE_RES
}

/// Pack an altitude difference in feet, `None` if out of range
pub fn pack_alt_delta(diff_ft: f64) -> Option<i16> {
    quantize_i16(diff_ft, ALT_FT_RES)
}

/// Unpack an altitude difference in feet
pub fn unpack_alt_delta(packed: i16) -> f64 {
    f64::from(packed) * ALT_FT_RES
}

fn quantize_i16(value: f64, res: f64) -> Option<i16> {
    let steps = (value / res).round();
    if (f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&steps) {
        Some(steps as i16)
    } else {
        None
    }
}

/// Pack an RGB(A) color with channels in `[0, 1]`; alpha is not transmitted
pub fn pack_color(rgba: [f32; 4]) -> [u8; 3] {
    [
        (rgba[0].clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgba[1].clamp(0.0, 1.0) * 255.0).round() as u8,
        (rgba[2].clamp(0.0, 1.0) * 255.0).round() as u8,
    ]
}

/// Unpack an RGB color, alpha is always 1
pub fn unpack_color(rgb: [u8; 3]) -> [f32; 4] {
    [
        f32::from(rgb[0]) / 255.0,
        f32::from(rgb[1]) / 255.0,
        f32::from(rgb[2]) / 255.0,
        1.0,
    ]
}

/// Maps one animation value onto a byte.
///
/// Values are clamped into `[min, min + range]` and spread over `0..=255`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataRefPack {
    min: f32,
    range: f32,
}

impl DataRefPack {
    /// Create a packing definition covering `min..=max`
    pub fn new(min: f32, max: f32) -> Result<Self, ValueError> {
        let range = max - min;
        if range == 0.0 || !range.is_finite() {
            return Err(ValueError::ZeroRange { min, max });
        }
        Ok(Self { min, range })
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    /// Smallest step between two packed values
    pub fn resolution(&self) -> f32 {
        self.range / 255.0
    }

    pub fn pack(&self, value: f32) -> u8 {
        let offset = (value - self.min).clamp(0.0, self.range);
        (offset * 255.0 / self.range).round() as u8
    }

    pub fn unpack(&self, packed: u8) -> f32 {
        self.min + self.range * f32::from(packed) / 255.0
    }
}

const fn dr(min: f32, range: f32) -> DataRefPack {
    DataRefPack { min, range }
}

/// Animation channels, in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum AnimChannel {
    GearRatio = 0,
    NoseWheelSteering,
    FlapRatio,
    SpoilerRatio,
    SpeedBrakeRatio,
    SlatRatio,
    WingSweepRatio,
    ThrustRatio,
    YokePitchRatio,
    YokeHeadingRatio,
    YokeRollRatio,
    ThrustReverse,
    TaxiLights,
    LandingLights,
    BeaconLights,
    StrobeLights,
    NavLights,
    NoseGearDeflection,
    TireVerticalDeflection,
    TireRotationAngle,
    TireRotationRpm,
    TireRotationRadSec,
    EngineRotationAngle,
    EngineRotationRpm,
    EngineRotationRadSec,
    PropRotationAngle,
    PropRotationRpm,
    PropRotationRadSec,
    ReverserDeployRatio,
    EngineRotationAngle1,
    EngineRotationAngle2,
    EngineRotationAngle3,
    EngineRotationAngle4,
    EngineRotationRpm1,
    EngineRotationRpm2,
    EngineRotationRpm3,
    EngineRotationRpm4,
    EngineRotationRadSec1,
    EngineRotationRadSec2,
    EngineRotationRadSec3,
    EngineRotationRadSec4,
    TouchDown,
}

impl AnimChannel {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn packing(self) -> DataRefPack {
        ANIM_PACKING[self.index()]
    }
}

/// Value range per animation channel, indexed by [`AnimChannel`]
pub const ANIM_PACKING: [DataRefPack; ANIM_CHANNEL_COUNT] = [
    dr(0.0, 1.0),      // gear ratio
    dr(-127.0, 128.0), // nose wheel steering, degrees
    dr(0.0, 1.0),      // flaps
    dr(0.0, 1.0),      // spoilers
    dr(0.0, 1.0),      // speed brake
    dr(0.0, 1.0),      // slats
    dr(0.0, 1.0),      // wing sweep
    dr(0.0, 1.0),      // thrust
    dr(0.0, 1.0),      // yoke pitch
    dr(0.0, 1.0),      // yoke heading
    dr(0.0, 1.0),      // yoke roll
    dr(0.0, 1.0),      // thrust reverse
    dr(0.0, 1.0),      // taxi lights
    dr(0.0, 1.0),      // landing lights
    dr(0.0, 1.0),      // beacon lights
    dr(0.0, 1.0),      // strobe lights
    dr(0.0, 1.0),      // nav lights
    dr(0.0, 10.0),     // nose gear deflection, m
    dr(0.0, 10.0),     // tire vertical deflection, m
    dr(0.0, 360.0),    // tire rotation angle
    dr(0.0, 1000.0),   // tire rpm
    dr(0.0, 100.0),    // tire rad/s
    dr(0.0, 360.0),    // engine rotation angle
    dr(0.0, 15000.0),  // engine rpm
    dr(0.0, 1500.0),   // engine rad/s
    dr(0.0, 260.0),    // prop rotation angle
    dr(0.0, 3000.0),   // prop rpm
    dr(0.0, 300.0),    // prop rad/s
    dr(0.0, 1.0),      // reverser deploy ratio
    dr(0.0, 360.0),    // engine 1 angle
    dr(0.0, 360.0),    // engine 2 angle
    dr(0.0, 360.0),    // engine 3 angle
    dr(0.0, 360.0),    // engine 4 angle
    dr(0.0, 15000.0),  // engine 1 rpm
    dr(0.0, 15000.0),  // engine 2 rpm
    dr(0.0, 15000.0),  // engine 3 rpm
    dr(0.0, 15000.0),  // engine 4 rpm
    dr(0.0, 1500.0),   // engine 1 rad/s
    dr(0.0, 1500.0),   // engine 2 rad/s
    dr(0.0, 1500.0),   // engine 3 rad/s
    dr(0.0, 1500.0),   // engine 4 rad/s
    dr(0.0, 1.0),      // touch down
];

/// Pack all animation channels
pub fn pack_anim_values(values: &[f32; ANIM_CHANNEL_COUNT]) -> [u8; ANIM_CHANNEL_COUNT] {
    let mut packed = [0u8; ANIM_CHANNEL_COUNT];
    for (i, out) in packed.iter_mut().enumerate() {
        *out = ANIM_PACKING[i].pack(values[i]);
    }
    packed
}

/// Unpack all animation channels
pub fn unpack_anim_values(packed: &[u8; ANIM_CHANNEL_COUNT]) -> [f32; ANIM_CHANNEL_COUNT] {
    let mut values = [0f32; ANIM_CHANNEL_COUNT];
    for (i, out) in values.iter_mut().enumerate() {
        *out = ANIM_PACKING[i].unpack(packed[i]);
    }
    values
}
