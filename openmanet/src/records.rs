//! The gossip record types shared over the mesh, and their wire codec.
//!
//! Every record is published through Alfred under a one byte data type tag and a one byte payload
//! version. The payload itself is a compact tagged-field binary encoding: each field is prefixed
//! with a key carrying its field number and wire kind, strings are length delimited and integers
//! are varint encoded. Unknown fields are skipped on decode so payloads can grow without breaking
//! older nodes. The exact bit level layout is load bearing, existing consumers on deployed meshes
//! read these payloads.

use core::fmt;

use bytes::{Buf, BufMut};

/// Payload version shared by all record kinds.
pub const RECORD_VERSION: u8 = 1;

/// Wire kind for varint encoded fields.
const WIRE_VARINT: u8 = 0;
/// Wire kind for 64 bit fixed width fields. Never produced, skipped on decode.
const WIRE_FIXED64: u8 = 1;
/// Wire kind for length delimited fields.
const WIRE_LEN: u8 = 2;
/// Wire kind for 32 bit fixed width fields. Never produced, skipped on decode.
const WIRE_FIXED32: u8 = 5;

/// The record kinds recognized on the gossip channel.
///
/// The tag values are fixed for interop with deployed meshes and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Gateway,
    Node,
    /// Reserved for position reports, no payload is defined yet.
    Position,
    AddressReservation,
}

impl DataType {
    /// The Alfred data type tag for this record kind.
    pub fn tag(self) -> u8 {
        match self {
            DataType::Gateway => 100,
            DataType::Node => 102,
            DataType::Position => 103,
            DataType::AddressReservation => 104,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Gateway => f.write_str("gateway"),
            DataType::Node => f.write_str("node"),
            DataType::Position => f.write_str("position"),
            DataType::AddressReservation => f.write_str("address-reservation"),
        }
    }
}

/// An error while decoding a record payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended in the middle of a field.
    Truncated,
    /// A varint ran over its maximum width.
    VarintOverflow,
    /// A field key carried a wire kind we can't process.
    UnsupportedWireKind(u8),
    /// A string field held invalid UTF-8.
    InvalidString,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated => f.write_str("payload truncated mid field"),
            DecodeError::VarintOverflow => f.write_str("varint exceeds maximum width"),
            DecodeError::UnsupportedWireKind(k) => {
                f.write_fmt(format_args!("unsupported wire kind {k}"))
            }
            DecodeError::InvalidString => f.write_str("string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A gateway announcement.
///
/// `mac` is the mesh interface hardware address of the announcer, since that is the identity
/// batman-adv reports for gateway originators. `ipaddr` is the layer 3 address on the bridge
/// interface, which clients route towards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayRecord {
    pub mac: String,
    pub ipaddr: String,
    pub hostname: String,
}

impl GatewayRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, 1, &self.mac);
        put_string(&mut buf, 2, &self.ipaddr);
        put_string(&mut buf, 3, &self.hostname);
        buf
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, DecodeError> {
        let mut record = GatewayRecord::default();
        while data.has_remaining() {
            match get_field(&mut data)? {
                (1, Field::Bytes(v)) => record.mac = into_string(v)?,
                (2, Field::Bytes(v)) => record.ipaddr = into_string(v)?,
                (3, Field::Bytes(v)) => record.hostname = into_string(v)?,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A node presence announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub mac: String,
    pub hostname: String,
    pub ipaddr: String,
}

impl NodeRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, 1, &self.mac);
        put_string(&mut buf, 2, &self.hostname);
        put_string(&mut buf, 3, &self.ipaddr);
        buf
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, DecodeError> {
        let mut record = NodeRecord::default();
        while data.has_remaining() {
            match get_field(&mut data)? {
                (1, Field::Bytes(v)) => record.mac = into_string(v)?,
                (2, Field::Bytes(v)) => record.hostname = into_string(v)?,
                (3, Field::Bytes(v)) => record.ipaddr = into_string(v)?,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// An address reservation, either a request (`requesting_reservation` set) from a node which still
/// needs addressing, or the settled allocation of a configured node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressReservation {
    pub mac: String,
    pub static_ip: String,
    pub reservation_cidr: String,
    pub uci_dhcp_start: String,
    pub uci_dhcp_limit: String,
    pub requesting_reservation: bool,
}

impl AddressReservation {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, 1, &self.mac);
        put_string(&mut buf, 2, &self.static_ip);
        put_string(&mut buf, 3, &self.reservation_cidr);
        put_string(&mut buf, 4, &self.uci_dhcp_start);
        put_string(&mut buf, 5, &self.uci_dhcp_limit);
        put_bool(&mut buf, 6, self.requesting_reservation);
        buf
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self, DecodeError> {
        let mut record = AddressReservation::default();
        while data.has_remaining() {
            match get_field(&mut data)? {
                (1, Field::Bytes(v)) => record.mac = into_string(v)?,
                (2, Field::Bytes(v)) => record.static_ip = into_string(v)?,
                (3, Field::Bytes(v)) => record.reservation_cidr = into_string(v)?,
                (4, Field::Bytes(v)) => record.uci_dhcp_start = into_string(v)?,
                (5, Field::Bytes(v)) => record.uci_dhcp_limit = into_string(v)?,
                (6, Field::Varint(v)) => record.requesting_reservation = v != 0,
                _ => {}
            }
        }
        Ok(record)
    }
}

/// A single decoded field: either a varint or the raw bytes of a length delimited value.
enum Field {
    Varint(u64),
    Bytes(Vec<u8>),
}

fn into_string(raw: Vec<u8>) -> Result<String, DecodeError> {
    String::from_utf8(raw).map_err(|_| DecodeError::InvalidString)
}

/// Write a length delimited string field. Empty values are omitted, decoders fall back to the
/// default.
fn put_string(buf: &mut Vec<u8>, field: u32, value: &str) {
    if value.is_empty() {
        return;
    }
    put_varint(buf, ((field << 3) | WIRE_LEN as u32) as u64);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value.as_bytes());
}

/// Write a varint bool field. False is omitted, decoders fall back to the default.
fn put_bool(buf: &mut Vec<u8>, field: u32, value: bool) {
    if !value {
        return;
    }
    put_varint(buf, ((field << 3) | WIRE_VARINT as u32) as u64);
    put_varint(buf, 1);
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(data: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value = 0u64;
    for shift in 0..10 {
        if !data.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        let byte = data.get_u8();
        value |= ((byte & 0x7f) as u64) << (shift * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(DecodeError::VarintOverflow)
}

/// Decode the next field. Fixed width fields are consumed and surfaced as varints so callers can
/// skip them by field number.
fn get_field(data: &mut &[u8]) -> Result<(u32, Field), DecodeError> {
    let key = get_varint(data)?;
    let field = (key >> 3) as u32;
    let kind = (key & 0x7) as u8;
    let value = match kind {
        WIRE_VARINT => Field::Varint(get_varint(data)?),
        WIRE_FIXED64 => {
            if data.remaining() < 8 {
                return Err(DecodeError::Truncated);
            }
            Field::Varint(data.get_u64_le())
        }
        WIRE_LEN => {
            let len = get_varint(data)? as usize;
            if data.remaining() < len {
                return Err(DecodeError::Truncated);
            }
            let mut raw = vec![0; len];
            data.copy_to_slice(&mut raw);
            Field::Bytes(raw)
        }
        WIRE_FIXED32 => {
            if data.remaining() < 4 {
                return Err(DecodeError::Truncated);
            }
            Field::Varint(data.get_u32_le() as u64)
        }
        kind => return Err(DecodeError::UnsupportedWireKind(kind)),
    };
    Ok((field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_codec() {
        let record = GatewayRecord {
            mac: "02:ba:de:af:fe:01".to_string(),
            ipaddr: "10.41.0.10".to_string(),
            hostname: "gw1".to_string(),
        };

        let decoded = GatewayRecord::from_bytes(&record.to_bytes()).expect("payload decodes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn node_codec() {
        let record = NodeRecord {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            hostname: "node-7".to_string(),
            ipaddr: "10.41.3.7".to_string(),
        };

        let decoded = NodeRecord::from_bytes(&record.to_bytes()).expect("payload decodes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn reservation_codec() {
        let record = AddressReservation {
            mac: "aa:bb:cc:dd:ee:01".to_string(),
            static_ip: "10.41.0.5".to_string(),
            reservation_cidr: "10.41.0.5/16".to_string(),
            uci_dhcp_start: "100".to_string(),
            uci_dhcp_limit: "150".to_string(),
            requesting_reservation: false,
        };

        let decoded = AddressReservation::from_bytes(&record.to_bytes()).expect("payload decodes");
        assert_eq!(decoded, record);
    }

    #[test]
    fn reservation_request_flag() {
        let record = AddressReservation {
            mac: "aa:bb:cc:dd:ee:02".to_string(),
            static_ip: "10.41.1.9".to_string(),
            requesting_reservation: true,
            ..Default::default()
        };

        let bytes = record.to_bytes();
        let decoded = AddressReservation::from_bytes(&bytes).expect("payload decodes");
        assert!(decoded.requesting_reservation);
        assert!(decoded.uci_dhcp_start.is_empty());
    }

    #[test]
    fn empty_payload_is_default() {
        let decoded = AddressReservation::from_bytes(&[]).expect("empty payload decodes");
        assert_eq!(decoded, AddressReservation::default());
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut buf = GatewayRecord {
            mac: "02:00:00:00:00:01".to_string(),
            ipaddr: "10.41.0.1".to_string(),
            hostname: "gw".to_string(),
        }
        .to_bytes();
        // Field 9, varint kind, value 7.
        put_varint(&mut buf, (9 << 3) as u64);
        put_varint(&mut buf, 7);
        // Field 10, length delimited, 3 opaque bytes.
        put_varint(&mut buf, ((10 << 3) | 2) as u64);
        put_varint(&mut buf, 3);
        buf.extend_from_slice(&[1, 2, 3]);

        let decoded = GatewayRecord::from_bytes(&buf).expect("unknown fields skipped");
        assert_eq!(decoded.mac, "02:00:00:00:00:01");
        assert_eq!(decoded.hostname, "gw");
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let record = GatewayRecord {
            mac: "02:00:00:00:00:01".to_string(),
            ..Default::default()
        };
        let bytes = record.to_bytes();

        assert_eq!(
            GatewayRecord::from_bytes(&bytes[..bytes.len() - 3]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn garbage_payload_is_rejected() {
        // A length delimited field claiming far more bytes than present.
        let garbage = [0x0a, 0xff, 0x01, 0x00];
        assert!(GatewayRecord::from_bytes(&garbage).is_err());
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let overlong = [0x08, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(
            AddressReservation::from_bytes(&overlong),
            Err(DecodeError::VarintOverflow)
        );
    }

    #[test]
    fn tags_are_stable() {
        // These values are shared with deployed consumers, they may never drift.
        assert_eq!(DataType::Gateway.tag(), 100);
        assert_eq!(DataType::Node.tag(), 102);
        assert_eq!(DataType::Position.tag(), 103);
        assert_eq!(DataType::AddressReservation.tag(), 104);
    }
}
