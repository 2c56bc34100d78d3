//! Protocol message definitions
//!
//! Defines the header and the fixed-size records carried after it. Layout
//! is written field by field at fixed offsets, never taken from Rust's
//! in-memory struct layout.

use std::borrow::Cow;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::values::{
    pack_angle, pack_color, pack_heading, unpack_angle, unpack_color, unpack_heading,
    unpack_time_delta, ANIM_CHANNEL_COUNT,
};

/// Header size shared by all messages
pub const HEADER_SIZE: usize = 8;

/// Sender-local aircraft identifier
pub type AircraftId = u32;

/// Message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sent by a would-be receiver to wake up senders
    InterestBeacon = 0,
    /// Internal flush marker of the sender queue, never valid on the wire
    SendTrigger = 1,
    Settings = 2,
    AircraftDetail = 3,
    PositionUpdate = 4,
    /// Reserved for animation-only updates
    AnimationValues = 5,
    Removal = 6,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::InterestBeacon),
            1 => Some(Self::SendTrigger),
            2 => Some(Self::Settings),
            3 => Some(Self::AircraftDetail),
            4 => Some(Self::PositionUpdate),
            5 => Some(Self::AnimationValues),
            6 => Some(Self::Removal),
            _ => None,
        }
    }

    /// The payload version this implementation speaks for the type,
    /// `None` for types that are never accepted from the wire
    pub fn supported_version(self) -> Option<u8> {
        match self {
            Self::InterestBeacon => Some(VERSION_BEACON),
            Self::Settings => Some(VERSION_SETTINGS),
            Self::AircraftDetail => Some(VERSION_AIRCRAFT_DETAIL),
            Self::PositionUpdate => Some(VERSION_POSITION_UPDATE),
            Self::Removal => Some(VERSION_REMOVAL),
            Self::SendTrigger | Self::AnimationValues => None,
        }
    }
}

pub const VERSION_BEACON: u8 = 0;
pub const VERSION_SETTINGS: u8 = 0;
pub const VERSION_AIRCRAFT_DETAIL: u8 = 0;
pub const VERSION_POSITION_UPDATE: u8 = 0;
pub const VERSION_REMOVAL: u8 = 0;

/// Message header, identical for all message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw message type (4 bits)
    pub msg_type: u8,
    /// Message version (4 bits)
    pub version: u8,
    /// Lower 16 bits of the sending instance's id
    pub sender_id: u16,
}

impl MessageHeader {
    /// Header for a message type at the version this implementation speaks
    pub fn new(msg_type: MessageType, sender_id: u16) -> Self {
        Self {
            msg_type: msg_type as u8,
            version: msg_type.supported_version().unwrap_or(0),
            sender_id,
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8((self.msg_type & 0x0F) | ((self.version & 0x0F) << 4));
        buf.put_u8(0);
        buf.put_u16_le(self.sender_id);
        buf.put_u32_le(0);
    }

    /// Read a header; the caller guarantees at least [`HEADER_SIZE`] bytes
    pub fn read_from<B: Buf>(buf: &mut B) -> Self {
        let ty_ver = buf.get_u8();
        let _reserved = buf.get_u8();
        let sender_id = buf.get_u16_le();
        let _reserved = buf.get_u32_le();
        Self {
            msg_type: ty_ver & 0x0F,
            version: ty_ver >> 4,
            sender_id,
        }
    }
}

/// A fixed-size element of an array message
pub trait WireRecord: Sized {
    /// Encoded size in bytes
    const SIZE: usize;

    fn write_to<B: BufMut>(&self, buf: &mut B);

    /// Read one record; the caller guarantees at least `SIZE` bytes
    fn read_from<B: Buf>(buf: &mut B) -> Self;
}

/// Fixed-width text field, zero padded, not necessarily zero terminated
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize>([u8; N]);

impl<const N: usize> FixedStr<N> {
    /// Copy `s`, truncated to `N` bytes at a character boundary
    pub fn new(s: &str) -> Self {
        let mut len = s.len().min(N);
        while !s.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; N];
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// Content up to the first zero byte
    pub fn content(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        &self.0[..end]
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let mut bytes = [0u8; N];
        buf.copy_to_slice(&mut bytes);
        Self(bytes)
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> From<&str> for FixedStr<N> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Feature flags of a sender, packed into 10 bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsFlags {
    /// Logging level, 0..=7
    pub log_level: u8,
    pub log_model_match: bool,
    pub replace_obj_datarefs: bool,
    pub replace_obj_textures: bool,
    pub label_cutoff_at_visibility: bool,
    pub map_enabled: bool,
    pub map_labels: bool,
    pub have_tcas_control: bool,
}

impl SettingsFlags {
    pub fn to_bits(&self) -> u16 {
        let mut bits = u16::from(self.log_level & 0x07);
        if self.log_model_match { bits |= 1 << 3; }
        if self.replace_obj_datarefs { bits |= 1 << 4; }
        if self.replace_obj_textures { bits |= 1 << 5; }
        if self.label_cutoff_at_visibility { bits |= 1 << 6; }
        if self.map_enabled { bits |= 1 << 7; }
        if self.map_labels { bits |= 1 << 8; }
        if self.have_tcas_control { bits |= 1 << 9; }
        bits
    }

    pub fn from_bits(bits: u16) -> Self {
        Self {
            log_level: (bits & 0x07) as u8,
            log_model_match: bits & (1 << 3) != 0,
            replace_obj_datarefs: bits & (1 << 4) != 0,
            replace_obj_textures: bits & (1 << 5) != 0,
            label_cutoff_at_visibility: bits & (1 << 6) != 0,
            map_enabled: bits & (1 << 7) != 0,
            map_labels: bits & (1 << 8) != 0,
            have_tcas_control: bits & (1 << 9) != 0,
        }
    }
}

/// Identity and settings of a sending instance
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SettingsRecord {
    /// Sender's display name
    pub name: FixedStr<16>,
    /// Maximum label draw distance [m]
    pub max_label_dist: f32,
    /// Default ICAO aircraft type if no model matches
    pub default_icao: FixedStr<4>,
    /// Ground vehicle type designator
    pub car_icao: FixedStr<4>,
    pub flags: SettingsFlags,
}

const SETTINGS_RESERVED: usize = 10;

impl WireRecord for SettingsRecord {
    const SIZE: usize = 16 + 4 + 4 + 4 + 2 + SETTINGS_RESERVED;

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        self.name.write_to(buf);
        buf.put_f32_le(self.max_label_dist);
        self.default_icao.write_to(buf);
        self.car_icao.write_to(buf);
        buf.put_u16_le(self.flags.to_bits());
        buf.put_bytes(0, SETTINGS_RESERVED);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let name = FixedStr::read_from(buf);
        let max_label_dist = buf.get_f32_le();
        let default_icao = FixedStr::read_from(buf);
        let car_icao = FixedStr::read_from(buf);
        let flags = SettingsFlags::from_bits(buf.get_u16_le());
        buf.advance(SETTINGS_RESERVED);
        Self {
            name,
            max_label_dist,
            default_icao,
            car_icao,
            flags,
        }
    }
}

/// Byte offsets inside an [`AircraftDetail`] record
pub mod detail_offsets {
    pub const ID: usize = 0;
    pub const ICAO_TYPE: usize = 4;
    pub const ICAO_OP: usize = 8;
    pub const SHORT_ID: usize = 12;
    pub const PKG_HASH: usize = 32;
    pub const LABEL: usize = 34;
    pub const LABEL_COLOR: usize = 57;
    pub const ALT_FT: usize = 60;
    /// 8-byte aligned
    pub const LAT: usize = 64;
    pub const LON: usize = 72;
    pub const PITCH: usize = 80;
    pub const HEADING: usize = 82;
    pub const ROLL: usize = 84;
    pub const AI_PRIO: usize = 86;
    pub const D_TIME: usize = 88;
    pub const FLAGS: usize = 90;
    pub const ANIM: usize = 94;
}

const DETAIL_FLAG_VALID: u8 = 0x01;
const DETAIL_FLAG_VISIBLE: u8 = 0x02;

/// Full state of one aircraft
#[derive(Debug, Clone, PartialEq)]
pub struct AircraftDetail {
    pub id: AircraftId,
    /// ICAO aircraft type
    pub icao_type: FixedStr<4>,
    /// ICAO operator code
    pub icao_op: FixedStr<4>,
    /// Model short id
    pub short_id: FixedStr<20>,
    /// Hash of the model's package name
    pub pkg_hash: u16,
    pub label: FixedStr<23>,
    pub label_color: [u8; 3],
    pub alt_ft: f32,
    pub lat: f64,
    pub lon: f64,
    /// [0.01°]
    pub pitch: i16,
    /// [0.01°]
    pub heading: u16,
    /// [0.01°]
    pub roll: i16,
    /// Priority for limited display slots, negative means "never"
    pub ai_prio: i16,
    /// [0.0001 s] time since the previous position
    pub d_time: u16,
    pub valid: bool,
    pub visible: bool,
    /// Packed animation values, one byte per channel
    pub anim: [u8; ANIM_CHANNEL_COUNT],
}

impl Default for AircraftDetail {
    fn default() -> Self {
        Self {
            id: 0,
            icao_type: FixedStr::default(),
            icao_op: FixedStr::default(),
            short_id: FixedStr::default(),
            pkg_hash: 0,
            label: FixedStr::default(),
            label_color: [0; 3],
            alt_ft: 0.0,
            lat: 0.0,
            lon: 0.0,
            pitch: 0,
            heading: 0,
            roll: 0,
            ai_prio: 0,
            d_time: 0,
            valid: false,
            visible: false,
            anim: [0; ANIM_CHANNEL_COUNT],
        }
    }
}

impl AircraftDetail {
    pub fn set_pitch(&mut self, degrees: f32) {
        self.pitch = pack_angle(degrees);
    }

    pub fn pitch_deg(&self) -> f32 {
        unpack_angle(self.pitch)
    }

    pub fn set_heading(&mut self, degrees: f32) {
        self.heading = pack_heading(degrees);
    }

    pub fn heading_deg(&self) -> f32 {
        unpack_heading(self.heading)
    }

    pub fn set_roll(&mut self, degrees: f32) {
        self.roll = pack_angle(degrees);
    }

    pub fn roll_deg(&self) -> f32 {
        unpack_angle(self.roll)
    }

    pub fn set_label_color(&mut self, rgba: [f32; 4]) {
        self.label_color = pack_color(rgba);
    }

    pub fn label_color_rgba(&self) -> [f32; 4] {
        unpack_color(self.label_color)
    }

    pub fn d_time_secs(&self) -> f64 {
        unpack_time_delta(self.d_time)
    }
}

impl WireRecord for AircraftDetail {
    const SIZE: usize = detail_offsets::ANIM + ANIM_CHANNEL_COUNT;

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.id);
        self.icao_type.write_to(buf);
        self.icao_op.write_to(buf);
        self.short_id.write_to(buf);
        buf.put_u16_le(self.pkg_hash);
        self.label.write_to(buf);
        buf.put_slice(&self.label_color);
        buf.put_f32_le(self.alt_ft);
        buf.put_f64_le(self.lat);
        buf.put_f64_le(self.lon);
        buf.put_i16_le(self.pitch);
        buf.put_u16_le(self.heading);
        buf.put_i16_le(self.roll);
        buf.put_i16_le(self.ai_prio);
        buf.put_u16_le(self.d_time);
        let mut flags = 0u8;
        if self.valid { flags |= DETAIL_FLAG_VALID; }
        if self.visible { flags |= DETAIL_FLAG_VISIBLE; }
        buf.put_u8(flags);
        buf.put_bytes(0, 3);
        buf.put_slice(&self.anim);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let id = buf.get_u32_le();
        let icao_type = FixedStr::read_from(buf);
        let icao_op = FixedStr::read_from(buf);
        let short_id = FixedStr::read_from(buf);
        let pkg_hash = buf.get_u16_le();
        let label = FixedStr::read_from(buf);
        let mut label_color = [0u8; 3];
        buf.copy_to_slice(&mut label_color);
        let alt_ft = buf.get_f32_le();
        let lat = buf.get_f64_le();
        let lon = buf.get_f64_le();
        let pitch = buf.get_i16_le();
        let heading = buf.get_u16_le();
        let roll = buf.get_i16_le();
        let ai_prio = buf.get_i16_le();
        let d_time = buf.get_u16_le();
        let flags = buf.get_u8();
        buf.advance(3);
        let mut anim = [0u8; ANIM_CHANNEL_COUNT];
        buf.copy_to_slice(&mut anim);
        Self {
            id,
            icao_type,
            icao_op,
            short_id,
            pkg_hash,
            label,
            label_color,
            alt_ft,
            lat,
            lon,
            pitch,
            heading,
            roll,
            ai_prio,
            d_time,
            valid: flags & DETAIL_FLAG_VALID != 0,
            visible: flags & DETAIL_FLAG_VISIBLE != 0,
            anim,
        }
    }
}

/// Incremental position of one aircraft relative to the previous record.
///
/// Latitude, longitude and altitude are deltas; attitude is absolute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionUpdate {
    pub id: AircraftId,
    /// [1e-8°]
    pub d_lat: i16,
    /// [1e-8°]
    pub d_lon: i16,
    /// [0.01 ft]
    pub d_alt: i16,
    /// [0.0001 s]
    pub d_time: u16,
    /// [0.01°]
    pub pitch: i16,
    /// [0.01°]
    pub heading: u16,
    /// [0.01°]
    pub roll: i16,
}

impl PositionUpdate {
    pub fn pitch_deg(&self) -> f32 {
        unpack_angle(self.pitch)
    }

    pub fn heading_deg(&self) -> f32 {
        unpack_heading(self.heading)
    }

    pub fn roll_deg(&self) -> f32 {
        unpack_angle(self.roll)
    }

    pub fn d_time_secs(&self) -> f64 {
        unpack_time_delta(self.d_time)
    }
}

impl WireRecord for PositionUpdate {
    const SIZE: usize = 20;

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.id);
        buf.put_i16_le(self.d_lat);
        buf.put_i16_le(self.d_lon);
        buf.put_i16_le(self.d_alt);
        buf.put_u16_le(self.d_time);
        buf.put_i16_le(self.pitch);
        buf.put_u16_le(self.heading);
        buf.put_i16_le(self.roll);
        buf.put_u16_le(0);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        let update = Self {
            id: buf.get_u32_le(),
            d_lat: buf.get_i16_le(),
            d_lon: buf.get_i16_le(),
            d_alt: buf.get_i16_le(),
            d_time: buf.get_u16_le(),
            pitch: buf.get_i16_le(),
            heading: buf.get_u16_le(),
            roll: buf.get_i16_le(),
        };
        buf.advance(2);
        update
    }
}

/// Removal messages carry bare aircraft ids
impl WireRecord for AircraftId {
    const SIZE: usize = 4;

    fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(*self);
    }

    fn read_from<B: Buf>(buf: &mut B) -> Self {
        buf.get_u32_le()
    }
}

// Record sizes are part of the protocol; each is a multiple of 8 (except
// removal ids) so arrays of them stay aligned behind the 8 byte header.
const _: () = assert!(HEADER_SIZE == 8);
const _: () = assert!(<SettingsRecord as WireRecord>::SIZE == 40);
const _: () = assert!(<AircraftDetail as WireRecord>::SIZE == 94 + 42);
const _: () = assert!(<AircraftDetail as WireRecord>::SIZE % 8 == 0);
const _: () = assert!(<PositionUpdate as WireRecord>::SIZE == 20);
const _: () = assert!(<AircraftId as WireRecord>::SIZE == 4);

/// All messages that can travel on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Interest beacon, header only
    Beacon,
    Settings(SettingsRecord),
    AircraftDetails(Vec<AircraftDetail>),
    PositionUpdates(Vec<PositionUpdate>),
    Removals(Vec<AircraftId>),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Beacon => MessageType::InterestBeacon,
            Message::Settings(_) => MessageType::Settings,
            Message::AircraftDetails(_) => MessageType::AircraftDetail,
            Message::PositionUpdates(_) => MessageType::PositionUpdate,
            Message::Removals(_) => MessageType::Removal,
        }
    }

    /// Encoded size including the header
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE
            + match self {
                Message::Beacon => 0,
                Message::Settings(_) => SettingsRecord::SIZE,
                Message::AircraftDetails(v) => v.len() * AircraftDetail::SIZE,
                Message::PositionUpdates(v) => v.len() * PositionUpdate::SIZE,
                Message::Removals(v) => v.len() * AircraftId::SIZE,
            }
    }

    /// Check if this message carries aircraft data
    pub fn is_aircraft_data(&self) -> bool {
        matches!(
            self,
            Message::AircraftDetails(_) | Message::PositionUpdates(_) | Message::Removals(_)
        )
    }
}
