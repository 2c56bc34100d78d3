//! Protocol codec for encoding/decoding datagrams
//!
//! One datagram carries exactly one message. Array messages are filled up
//! to the configured buffer size by [`MessageBatch`].

use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::{
    AircraftDetail, AircraftId, Message, MessageHeader, MessageType, PositionUpdate,
    SettingsRecord, WireRecord, DEFAULT_BUFFER_SIZE, HEADER_SIZE,
};

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Message type {0:?} is not valid on the wire")]
    NotOnWire(MessageType),

    #[error("Unsupported version {version} for {msg_type:?}")]
    UnsupportedVersion { msg_type: MessageType, version: u8 },

    #[error("Invalid length {len} for {msg_type:?}")]
    BadLength { msg_type: MessageType, len: usize },

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Decoded datagram with its header
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: MessageHeader,
    pub message: Message,
}

impl Frame {
    pub fn new(header: MessageHeader, message: Message) -> Self {
        Self { header, message }
    }

    pub fn sender_id(&self) -> u16 {
        self.header.sender_id
    }
}

/// Encodes messages into the wire format
#[derive(Debug, Clone)]
pub struct Encoder {
    sender_id: u16,
    max_size: usize,
}

impl Encoder {
    pub fn new(sender_id: u16) -> Self {
        Self::with_max_size(sender_id, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_max_size(sender_id: u16, max_size: usize) -> Self {
        Self {
            sender_id,
            max_size,
        }
    }

    pub fn sender_id(&self) -> u16 {
        self.sender_id
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Encode a message into a buffer
    pub fn encode(&self, message: &Message, buf: &mut BytesMut) -> CodecResult<()> {
        let size = message.wire_size();
        if size > self.max_size {
            return Err(CodecError::MessageTooLarge(size, self.max_size));
        }

        buf.reserve(size);
        MessageHeader::new(message.message_type(), self.sender_id).write_to(buf);
        match message {
            Message::Beacon => {}
            Message::Settings(s) => s.write_to(buf),
            Message::AircraftDetails(v) => v.iter().for_each(|r| r.write_to(buf)),
            Message::PositionUpdates(v) => v.iter().for_each(|r| r.write_to(buf)),
            Message::Removals(v) => v.iter().for_each(|r| r.write_to(buf)),
        }
        Ok(())
    }

    /// Encode a message into a standalone datagram
    pub fn to_datagram(&self, message: &Message) -> CodecResult<Bytes> {
        let mut buf = BytesMut::with_capacity(message.wire_size());
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Start a batch of records sharing one header
    pub fn batch<R: BatchRecord>(&self) -> CodecResult<MessageBatch<R>> {
        MessageBatch::new(self.sender_id, self.max_size)
    }
}

/// Decodes one datagram
pub fn decode(datagram: &[u8]) -> CodecResult<Frame> {
    if datagram.len() < HEADER_SIZE {
        return Err(CodecError::TooShort(datagram.len()));
    }

    let mut buf = datagram;
    let header = MessageHeader::read_from(&mut buf);
    let msg_type =
        MessageType::from_u8(header.msg_type).ok_or(CodecError::UnknownType(header.msg_type))?;
    let supported = msg_type
        .supported_version()
        .ok_or(CodecError::NotOnWire(msg_type))?;
    if header.version != supported {
        return Err(CodecError::UnsupportedVersion {
            msg_type,
            version: header.version,
        });
    }

    let bad_length = || CodecError::BadLength {
        msg_type,
        len: datagram.len(),
    };

    let message = match msg_type {
        MessageType::InterestBeacon => {
            if !buf.is_empty() {
                return Err(bad_length());
            }
            Message::Beacon
        }
        MessageType::Settings => {
            if buf.len() != SettingsRecord::SIZE {
                return Err(bad_length());
            }
            Message::Settings(SettingsRecord::read_from(&mut buf))
        }
        MessageType::AircraftDetail => {
            Message::AircraftDetails(read_array(&mut buf).ok_or_else(bad_length)?)
        }
        MessageType::PositionUpdate => {
            Message::PositionUpdates(read_array(&mut buf).ok_or_else(bad_length)?)
        }
        MessageType::Removal => Message::Removals(read_array(&mut buf).ok_or_else(bad_length)?),
        MessageType::SendTrigger | MessageType::AnimationValues => {
            return Err(CodecError::NotOnWire(msg_type))
        }
    };

    Ok(Frame::new(header, message))
}

/// Read `len / R::SIZE` records, `None` if the length is not a multiple
fn read_array<R: WireRecord>(buf: &mut &[u8]) -> Option<Vec<R>> {
    if buf.len() % R::SIZE != 0 {
        return None;
    }
    let count = buf.len() / R::SIZE;
    Some((0..count).map(|_| R::read_from(buf)).collect())
}

/// Records that travel in array messages
pub trait BatchRecord: WireRecord {
    const MESSAGE_TYPE: MessageType;
}

impl BatchRecord for AircraftDetail {
    const MESSAGE_TYPE: MessageType = MessageType::AircraftDetail;
}

impl BatchRecord for PositionUpdate {
    const MESSAGE_TYPE: MessageType = MessageType::PositionUpdate;
}

impl BatchRecord for AircraftId {
    const MESSAGE_TYPE: MessageType = MessageType::Removal;
}

/// Accumulates records of one kind into datagrams of bounded size.
///
/// [`push`](MessageBatch::push) hands back the pending datagram when the
/// next record would not fit; [`flush`](MessageBatch::flush) hands back
/// whatever is left.
#[derive(Debug)]
pub struct MessageBatch<R: BatchRecord> {
    header: MessageHeader,
    capacity: usize,
    buf: BytesMut,
    count: usize,
    _record: PhantomData<R>,
}

impl<R: BatchRecord> MessageBatch<R> {
    /// Fails if not even a single record fits into `max_size`
    pub fn new(sender_id: u16, max_size: usize) -> CodecResult<Self> {
        let elements = max_size.saturating_sub(HEADER_SIZE) / R::SIZE;
        if elements == 0 {
            return Err(CodecError::MessageTooLarge(HEADER_SIZE + R::SIZE, max_size));
        }
        Ok(Self {
            header: MessageHeader::new(R::MESSAGE_TYPE, sender_id),
            capacity: HEADER_SIZE + elements * R::SIZE,
            buf: BytesMut::new(),
            count: 0,
            _record: PhantomData,
        })
    }

    /// Number of records fitting into one datagram
    pub fn records_per_datagram(&self) -> usize {
        (self.capacity - HEADER_SIZE) / R::SIZE
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append a record, returning a full datagram if one had to be emitted
    pub fn push(&mut self, record: &R) -> Option<Bytes> {
        let flushed = if self.buf.len() + R::SIZE > self.capacity {
            self.flush()
        } else {
            None
        };
        if self.buf.is_empty() {
            self.buf.reserve(self.capacity);
            self.header.write_to(&mut self.buf);
        }
        record.write_to(&mut self.buf);
        self.count += 1;
        flushed
    }

    /// Emit the pending datagram, if any records are pending
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.count == 0 {
            return None;
        }
        self.count = 0;
        Some(self.buf.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SettingsFlags;

    fn detail(id: AircraftId) -> AircraftDetail {
        AircraftDetail {
            id,
            icao_type: "A320".into(),
            valid: true,
            visible: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let encoder = Encoder::new(0x1234);
        let original = Message::PositionUpdates(vec![
            PositionUpdate {
                id: 1,
                d_lat: 100,
                d_lon: -50,
                ..Default::default()
            },
            PositionUpdate {
                id: 2,
                d_alt: 7,
                ..Default::default()
            },
        ]);
        let bytes = encoder.to_datagram(&original).unwrap();
        assert_eq!(bytes.len(), 8 + 2 * 20);

        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.sender_id(), 0x1234);
        assert_eq!(frame.header.msg_type, MessageType::PositionUpdate as u8);
        assert_eq!(frame.message, original);
    }

    #[test]
    fn test_beacon_is_header_only() {
        let bytes = Encoder::new(9).to_datagram(&Message::Beacon).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 9, 0, 0, 0, 0, 0]);
        assert_eq!(decode(&bytes).unwrap().message, Message::Beacon);

        let mut longer = bytes.to_vec();
        longer.push(0);
        assert!(matches!(decode(&longer), Err(CodecError::BadLength { .. })));
    }

    #[test]
    fn test_settings_exact_length() {
        let settings = SettingsRecord {
            name: "Tower".into(),
            max_label_dist: 5556.0,
            default_icao: "A320".into(),
            car_icao: "ZZZC".into(),
            flags: SettingsFlags {
                log_level: 2,
                map_enabled: true,
                ..Default::default()
            },
        };
        let bytes = Encoder::new(1)
            .to_datagram(&Message::Settings(settings))
            .unwrap();
        assert_eq!(bytes.len(), 48);
        assert_eq!(decode(&bytes).unwrap().message, Message::Settings(settings));

        assert!(matches!(
            decode(&bytes[..47]),
            Err(CodecError::BadLength {
                msg_type: MessageType::Settings,
                len: 47
            })
        ));
    }

    #[test]
    fn test_empty_array_is_valid() {
        let header_only = Encoder::new(1)
            .to_datagram(&Message::AircraftDetails(vec![]))
            .unwrap();
        assert_eq!(header_only.len(), HEADER_SIZE);
        assert_eq!(
            decode(&header_only).unwrap().message,
            Message::AircraftDetails(vec![])
        );
    }

    #[test]
    fn test_reject_malformed() {
        assert_eq!(decode(&[0u8; 7]), Err(CodecError::TooShort(7)));

        // removal ids are 4 bytes, 8 + 6 is not a whole number of them
        let mut bytes = vec![MessageType::Removal as u8, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(&[0; 6]);
        assert!(matches!(decode(&bytes), Err(CodecError::BadLength { .. })));

        bytes[0] = 0x0F;
        assert_eq!(decode(&bytes), Err(CodecError::UnknownType(15)));

        // one byte short of a whole detail record
        let mut details = vec![MessageType::AircraftDetail as u8, 0, 0, 0, 0, 0, 0, 0];
        details.extend_from_slice(&[0; 135]);
        assert_eq!(
            decode(&details),
            Err(CodecError::BadLength {
                msg_type: MessageType::AircraftDetail,
                len: 143
            })
        );

        // one byte over two position records
        let mut updates = vec![MessageType::PositionUpdate as u8, 0, 0, 0, 0, 0, 0, 0];
        updates.extend_from_slice(&[0; 41]);
        assert_eq!(
            decode(&updates),
            Err(CodecError::BadLength {
                msg_type: MessageType::PositionUpdate,
                len: 49
            })
        );
        updates.pop();
        assert!(matches!(
            decode(&updates).map(|frame| frame.message),
            Ok(Message::PositionUpdates(ref list)) if list.len() == 2
        ));

        let trigger = [MessageType::SendTrigger as u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&trigger),
            Err(CodecError::NotOnWire(MessageType::SendTrigger))
        );
        let anim = [MessageType::AnimationValues as u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&anim),
            Err(CodecError::NotOnWire(MessageType::AnimationValues))
        );

        let future = [0x10 | MessageType::Removal as u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&future),
            Err(CodecError::UnsupportedVersion {
                msg_type: MessageType::Removal,
                version: 1
            })
        );
    }

    #[test]
    fn test_encode_too_large() {
        let encoder = Encoder::with_max_size(1, 100);
        let msg = Message::AircraftDetails(vec![detail(1)]);
        assert_eq!(
            encoder.to_datagram(&msg),
            Err(CodecError::MessageTooLarge(144, 100))
        );
    }

    #[test]
    fn test_batch_splits_at_capacity() {
        // room for exactly 3 details
        let max = HEADER_SIZE + 3 * AircraftDetail::SIZE + 10;
        let encoder = Encoder::with_max_size(5, max);
        let mut batch = encoder.batch::<AircraftDetail>().unwrap();
        assert_eq!(batch.records_per_datagram(), 3);

        let mut datagrams = Vec::new();
        for id in 1..=7 {
            datagrams.extend(batch.push(&detail(id)));
        }
        datagrams.extend(batch.flush());
        assert!(batch.flush().is_none());

        let sizes: Vec<usize> = datagrams.iter().map(|d| d.len()).collect();
        assert_eq!(
            sizes,
            vec![
                HEADER_SIZE + 3 * AircraftDetail::SIZE,
                HEADER_SIZE + 3 * AircraftDetail::SIZE,
                HEADER_SIZE + AircraftDetail::SIZE
            ]
        );

        let ids: Vec<AircraftId> = datagrams
            .iter()
            .flat_map(|d| match decode(d).unwrap().message {
                Message::AircraftDetails(v) => v.into_iter().map(|a| a.id).collect::<Vec<_>>(),
                other => panic!("Wrong message type: {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_batch_single_record_capacity() {
        let mut batch: MessageBatch<PositionUpdate> = MessageBatch::new(1, 28).unwrap();
        assert_eq!(batch.records_per_datagram(), 1);
        assert!(batch.push(&PositionUpdate::default()).is_none());
        assert!(batch.push(&PositionUpdate::default()).is_some());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_batch_rejects_buffer_below_one_record() {
        let err = MessageBatch::<AircraftDetail>::new(1, 100).unwrap_err();
        assert_eq!(err, CodecError::MessageTooLarge(144, 100));
    }
}
