//! BACnet/IP frame codec
//!
//! Covers the subset the pollers use: BVLC/NPDU envelopes, Who-Is, I-Am,
//! ReadProperty and the Complex-ACK / Error / Reject / Abort replies.

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

pub const BVLC_TYPE_BIP: u8 = 0x81;
pub const BVLC_FORWARDED_NPDU: u8 = 0x04;
pub const BVLC_ORIGINAL_UNICAST: u8 = 0x0A;
pub const BVLC_ORIGINAL_BROADCAST: u8 = 0x0B;
pub const NPDU_VERSION: u8 = 0x01;

pub const SERVICE_I_AM: u8 = 0x00;
pub const SERVICE_WHO_IS: u8 = 0x08;
pub const SERVICE_READ_PROPERTY: u8 = 0x0C;

pub const PROPERTY_PRESENT_VALUE: u32 = 85;

/// Standard object types a fire panel gateway exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    AnalogInput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    MultiStateInput,
}

impl ObjectType {
    pub fn code(self) -> u16 {
        match self {
            ObjectType::AnalogInput => 0,
            ObjectType::AnalogValue => 2,
            ObjectType::BinaryInput => 3,
            ObjectType::BinaryOutput => 4,
            ObjectType::BinaryValue => 5,
            ObjectType::Device => 8,
            ObjectType::MultiStateInput => 13,
        }
    }
}

/// Object identifier: 10-bit type, 22-bit instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId {
    pub object_type: u16,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type: object_type.code(),
            instance,
        }
    }

    pub fn encode(self) -> u32 {
        (u32::from(self.object_type & 0x3FF) << 22) | (self.instance & 0x3F_FFFF)
    }

    pub fn decode(raw: u32) -> Self {
        Self {
            object_type: (raw >> 22) as u16,
            instance: raw & 0x3F_FFFF,
        }
    }
}

/// Application-tagged property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    Enumerated(u32),
    ObjectId(ObjectId),
    Other(u8),
}

impl PropertyValue {
    /// Binary interpretation: inactive(0) is false, anything else true
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Boolean(b) => Some(*b),
            PropertyValue::Unsigned(v) | PropertyValue::Enumerated(v) => Some(*v != 0),
            PropertyValue::Signed(v) => Some(*v != 0),
            PropertyValue::Real(v) => Some(*v != 0.0),
            PropertyValue::Double(v) => Some(*v != 0.0),
            _ => None,
        }
    }
}

/// I-Am announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAm {
    pub device: ObjectId,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

/// Decoded application layer PDU
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    IAm(IAm),
    WhoIs,
    SimpleAck { invoke_id: u8, service: u8 },
    ComplexAck { invoke_id: u8, service: u8, payload: Vec<u8> },
    Error { invoke_id: u8, service: u8, class: u32, code: u32 },
    Reject { invoke_id: u8, reason: u8 },
    Abort { invoke_id: u8, reason: u8 },
    ConfirmedRequest { invoke_id: u8, service: u8, payload: Vec<u8> },
    /// Network-layer messages and services this client ignores
    Ignored,
}

impl Apdu {
    /// Invoke id of a reply to a confirmed request
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            _ => None,
        }
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn wrap_bvlc(function: u8, npdu_apdu: &[u8]) -> Vec<u8> {
    let len = (npdu_apdu.len() + 4) as u16;
    let mut frame = Vec::with_capacity(len as usize);
    frame.push(BVLC_TYPE_BIP);
    frame.push(function);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(npdu_apdu);
    frame
}

/// Unsigned integer in the fewest big-endian bytes
fn unsigned_bytes(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take(3).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn push_context_unsigned(buf: &mut Vec<u8>, tag: u8, value: u32) {
    let bytes = unsigned_bytes(value);
    buf.push((tag << 4) | 0x08 | bytes.len() as u8);
    buf.extend_from_slice(&bytes);
}

/// Global broadcast Who-Is without a range
pub fn encode_who_is() -> Vec<u8> {
    // NPDU: DNET=0xFFFF, DLEN=0, hop count 255
    let body = [
        NPDU_VERSION,
        0x20,
        0xFF,
        0xFF,
        0x00,
        0xFF,
        0x10,
        SERVICE_WHO_IS,
    ];
    wrap_bvlc(BVLC_ORIGINAL_BROADCAST, &body)
}

/// Confirmed ReadProperty request
pub fn encode_read_property(invoke_id: u8, object: ObjectId, property: u32) -> Vec<u8> {
    let mut body = vec![
        NPDU_VERSION,
        0x04, // expecting reply
        0x00, // confirmed request, unsegmented
        0x05, // up to 1476 octets accepted
        invoke_id,
        SERVICE_READ_PROPERTY,
    ];
    body.push(0x0C); // context 0, length 4
    body.extend_from_slice(&object.encode().to_be_bytes());
    push_context_unsigned(&mut body, 1, property);
    wrap_bvlc(BVLC_ORIGINAL_UNICAST, &body)
}

/// I-Am announcement (used by device simulators and tests)
pub fn encode_i_am(iam: &IAm) -> Vec<u8> {
    let mut body = vec![NPDU_VERSION, 0x00, 0x10, SERVICE_I_AM, 0xC4];
    body.extend_from_slice(&iam.device.encode().to_be_bytes());
    for (tag, value) in [(2u8, iam.max_apdu), (9, iam.segmentation), (2, iam.vendor_id)] {
        let bytes = unsigned_bytes(value);
        body.push((tag << 4) | bytes.len() as u8);
        body.extend_from_slice(&bytes);
    }
    wrap_bvlc(BVLC_ORIGINAL_BROADCAST, &body)
}

/// Complex-ACK carrying one application-tagged present value
pub fn encode_read_property_ack(
    invoke_id: u8,
    object: ObjectId,
    property: u32,
    value: &PropertyValue,
) -> Vec<u8> {
    let mut body = vec![NPDU_VERSION, 0x00, 0x30, invoke_id, SERVICE_READ_PROPERTY, 0x0C];
    body.extend_from_slice(&object.encode().to_be_bytes());
    push_context_unsigned(&mut body, 1, property);
    body.push(0x3E);
    match value {
        PropertyValue::Null => body.push(0x00),
        PropertyValue::Boolean(b) => body.push(0x10 | u8::from(*b)),
        PropertyValue::Unsigned(v) => {
            let bytes = unsigned_bytes(*v);
            body.push(0x20 | bytes.len() as u8);
            body.extend_from_slice(&bytes);
        },
        PropertyValue::Enumerated(v) => {
            let bytes = unsigned_bytes(*v);
            body.push(0x90 | bytes.len() as u8);
            body.extend_from_slice(&bytes);
        },
        PropertyValue::Real(v) => {
            body.push(0x44);
            body.extend_from_slice(&v.to_be_bytes());
        },
        _ => body.push(0x00),
    }
    body.push(0x3F);
    wrap_bvlc(BVLC_ORIGINAL_UNICAST, &body)
}

// ============================================================================
// Decoding
// ============================================================================

/// Tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    number: u8,
    context: bool,
    /// Length, or the boolean value for application tag 1
    len_value: u32,
    opening: bool,
    closing: bool,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| LinkError::protocol("Truncated BACnet frame"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(LinkError::protocol("Truncated BACnet frame"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    fn tag(&mut self) -> Result<Tag> {
        let first = self.u8()?;
        let mut number = first >> 4;
        if number == 0x0F {
            number = self.u8()?;
        }
        let context = first & 0x08 != 0;
        let lvt = first & 0x07;
        if context && lvt == 6 {
            return Ok(Tag {
                number,
                context,
                len_value: 0,
                opening: true,
                closing: false,
            });
        }
        if context && lvt == 7 {
            return Ok(Tag {
                number,
                context,
                len_value: 0,
                opening: false,
                closing: true,
            });
        }
        let len_value = if lvt == 5 {
            match self.u8()? {
                254 => u32::from(self.u16()?),
                255 => {
                    let b = self.take(4)?;
                    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
                },
                n => u32::from(n),
            }
        } else {
            u32::from(lvt)
        };
        Ok(Tag {
            number,
            context,
            len_value,
            opening: false,
            closing: false,
        })
    }

    fn unsigned(&mut self, len: u32) -> Result<u32> {
        if len == 0 || len > 4 {
            return Err(LinkError::protocol(format!("Bad unsigned length {len}")));
        }
        Ok(self
            .take(len as usize)?
            .iter()
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
    }

    fn application_value(&mut self, tag: Tag) -> Result<PropertyValue> {
        let len = tag.len_value;
        Ok(match tag.number {
            0 => PropertyValue::Null,
            1 => PropertyValue::Boolean(len != 0),
            2 => PropertyValue::Unsigned(self.unsigned(len)?),
            3 => {
                let raw = self.unsigned(len)?;
                let shift = 32 - 8 * len;
                PropertyValue::Signed(((raw << shift) as i32) >> shift)
            },
            4 => {
                let b = self.take(4)?;
                PropertyValue::Real(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            },
            5 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                PropertyValue::Double(f64::from_be_bytes(raw))
            },
            9 => PropertyValue::Enumerated(self.unsigned(len)?),
            12 => PropertyValue::ObjectId(ObjectId::decode(self.unsigned(4)?)),
            other => {
                self.take(len as usize)?;
                PropertyValue::Other(other)
            },
        })
    }
}

/// Decode one BACnet/IP datagram down to its APDU
pub fn decode_frame(frame: &[u8]) -> Result<Apdu> {
    let mut r = Reader::new(frame);
    if r.u8()? != BVLC_TYPE_BIP {
        return Err(LinkError::protocol("Not a BACnet/IP frame"));
    }
    let function = r.u8()?;
    let length = r.u16()? as usize;
    if length != frame.len() {
        return Err(LinkError::protocol(format!(
            "BVLC length {} != datagram {}",
            length,
            frame.len()
        )));
    }
    match function {
        BVLC_ORIGINAL_UNICAST | BVLC_ORIGINAL_BROADCAST => {},
        BVLC_FORWARDED_NPDU => {
            r.take(6)?;
        },
        _ => return Ok(Apdu::Ignored),
    }

    if r.u8()? != NPDU_VERSION {
        return Err(LinkError::protocol("Unsupported NPDU version"));
    }
    let control = r.u8()?;
    let has_dnet = control & 0x20 != 0;
    if has_dnet {
        r.u16()?;
        let dlen = r.u8()? as usize;
        r.take(dlen)?;
    }
    if control & 0x08 != 0 {
        r.u16()?;
        let slen = r.u8()? as usize;
        r.take(slen)?;
    }
    if has_dnet {
        r.u8()?; // hop count
    }
    if control & 0x80 != 0 {
        return Ok(Apdu::Ignored);
    }

    decode_apdu(r.rest())
}

fn decode_apdu(apdu: &[u8]) -> Result<Apdu> {
    let mut r = Reader::new(apdu);
    let first = r.u8()?;
    match first >> 4 {
        0x0 => {
            if first & 0x08 != 0 {
                return Ok(Apdu::Ignored); // segmented request
            }
            r.u8()?; // max segments / max APDU
            let invoke_id = r.u8()?;
            let service = r.u8()?;
            Ok(Apdu::ConfirmedRequest {
                invoke_id,
                service,
                payload: r.rest().to_vec(),
            })
        },
        0x1 => match r.u8()? {
            SERVICE_I_AM => decode_i_am(&mut r).map(Apdu::IAm),
            SERVICE_WHO_IS => Ok(Apdu::WhoIs),
            _ => Ok(Apdu::Ignored),
        },
        0x2 => Ok(Apdu::SimpleAck {
            invoke_id: r.u8()?,
            service: r.u8()?,
        }),
        0x3 => {
            if first & 0x08 != 0 {
                return Err(LinkError::protocol("Segmented Complex-ACK not supported"));
            }
            let invoke_id = r.u8()?;
            let service = r.u8()?;
            Ok(Apdu::ComplexAck {
                invoke_id,
                service,
                payload: r.rest().to_vec(),
            })
        },
        0x5 => {
            let invoke_id = r.u8()?;
            let service = r.u8()?;
            let class_tag = r.tag()?;
            let class = r.unsigned(class_tag.len_value)?;
            let code_tag = r.tag()?;
            let code = r.unsigned(code_tag.len_value)?;
            Ok(Apdu::Error {
                invoke_id,
                service,
                class,
                code,
            })
        },
        0x6 => Ok(Apdu::Reject {
            invoke_id: r.u8()?,
            reason: r.u8()?,
        }),
        0x7 => Ok(Apdu::Abort {
            invoke_id: r.u8()?,
            reason: r.u8()?,
        }),
        _ => Ok(Apdu::Ignored),
    }
}

fn decode_i_am(r: &mut Reader<'_>) -> Result<IAm> {
    let tag = r.tag()?;
    if tag.context || tag.number != 12 || tag.len_value != 4 {
        return Err(LinkError::protocol("I-Am without device identifier"));
    }
    let device = ObjectId::decode(r.unsigned(4)?);
    let mut fields = [0u32; 3];
    for field in &mut fields {
        let tag = r.tag()?;
        *field = r.unsigned(tag.len_value)?;
    }
    Ok(IAm {
        device,
        max_apdu: fields[0],
        segmentation: fields[1],
        vendor_id: fields[2],
    })
}

/// Extract the value from a ReadProperty Complex-ACK payload
pub fn decode_read_property_ack(payload: &[u8]) -> Result<(ObjectId, u32, PropertyValue)> {
    let mut r = Reader::new(payload);

    let tag = r.tag()?;
    if !tag.context || tag.number != 0 {
        return Err(LinkError::protocol("ReadProperty-ACK: missing object id"));
    }
    let object = ObjectId::decode(r.unsigned(tag.len_value)?);

    let tag = r.tag()?;
    if !tag.context || tag.number != 1 {
        return Err(LinkError::protocol("ReadProperty-ACK: missing property id"));
    }
    let property = r.unsigned(tag.len_value)?;

    let mut tag = r.tag()?;
    if tag.context && tag.number == 2 && !tag.opening {
        r.unsigned(tag.len_value)?; // array index
        tag = r.tag()?;
    }
    if !(tag.opening && tag.number == 3) {
        return Err(LinkError::protocol("ReadProperty-ACK: missing value"));
    }

    let value_tag = r.tag()?;
    if value_tag.context {
        return Err(LinkError::protocol("ReadProperty-ACK: context-tagged value"));
    }
    let value = r.application_value(value_tag)?;
    Ok((object, property, value))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_who_is_bytes() {
        assert_eq!(
            encode_who_is(),
            vec![0x81, 0x0B, 0x00, 0x0C, 0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF, 0x10, 0x08]
        );
    }

    #[test]
    fn test_read_property_bytes() {
        let frame = encode_read_property(
            7,
            ObjectId::new(ObjectType::BinaryInput, 1),
            PROPERTY_PRESENT_VALUE,
        );
        assert_eq!(
            frame,
            vec![
                0x81, 0x0A, 0x00, 0x11, 0x01, 0x04, 0x00, 0x05, 0x07, 0x0C, 0x0C, 0x00, 0xC0,
                0x00, 0x01, 0x19, 0x55
            ]
        );
    }

    #[test]
    fn test_object_id_packing() {
        let id = ObjectId::new(ObjectType::Device, 260_001);
        assert_eq!(ObjectId::decode(id.encode()), id);
        assert_eq!(id.encode() >> 22, 8);
    }

    #[test]
    fn test_decode_i_am() {
        let iam = IAm {
            device: ObjectId::new(ObjectType::Device, 1234),
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 260,
        };
        let apdu = decode_frame(&encode_i_am(&iam)).unwrap();
        assert_eq!(apdu, Apdu::IAm(iam));
    }

    #[test]
    fn test_decode_read_property_ack() {
        let object = ObjectId::new(ObjectType::BinaryInput, 3);
        let frame = encode_read_property_ack(
            9,
            object,
            PROPERTY_PRESENT_VALUE,
            &PropertyValue::Enumerated(1),
        );
        let Apdu::ComplexAck {
            invoke_id,
            service,
            payload,
        } = decode_frame(&frame).unwrap()
        else {
            panic!("expected Complex-ACK");
        };
        assert_eq!(invoke_id, 9);
        assert_eq!(service, SERVICE_READ_PROPERTY);

        let (decoded_object, property, value) = decode_read_property_ack(&payload).unwrap();
        assert_eq!(decoded_object, object);
        assert_eq!(property, PROPERTY_PRESENT_VALUE);
        assert_eq!(value.as_bool(), Some(true));
    }

    #[test]
    fn test_decode_error_pdu() {
        // Error: object(1) / unknown-object(31)
        let frame = [0x81, 0x0A, 0x00, 0x0D, 0x01, 0x00, 0x50, 0x04, 0x0C, 0x91, 0x01, 0x91, 0x1F];
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Apdu::Error {
                invoke_id: 4,
                service: SERVICE_READ_PROPERTY,
                class: 1,
                code: 31
            }
        );
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut frame = encode_who_is();
        frame.push(0x00);
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_property_value_as_bool() {
        assert_eq!(PropertyValue::Enumerated(0).as_bool(), Some(false));
        assert_eq!(PropertyValue::Real(0.5).as_bool(), Some(true));
        assert_eq!(PropertyValue::Boolean(true).as_bool(), Some(true));
        assert_eq!(PropertyValue::Null.as_bool(), None);
    }
}
