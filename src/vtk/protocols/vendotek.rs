//! Vendotek protocol for VTK payment terminals.
//!
//! Frames are a big-endian `u16` length, a big-endian `u16` protocol id and a
//! run of TLV parameters with varint ids and lengths. The length counts
//! everything after itself. Parameter values are ASCII text.

use tracing::debug;

use crate::error::CodecError;
use crate::vtk::protocol::*;

// ---------------------------------------------------------------------------
// Vendotek constants
// ---------------------------------------------------------------------------

/// Protocol id of frames sent by the cash register / vending side.
const PROTO_VMC: u16 = 0x96FB;
/// Protocol id of frames sent by the payment terminal.
const PROTO_POS: u16 = 0x97FB;

const LEN_FIELD: usize = 2;
const HEADER_LEN: usize = 4;
const MAX_BODY_LEN: usize = 0xFFFF;

const VARINT_ONE_BYTE: u8 = 0x81;
const VARINT_TWO_BYTES: u8 = 0x82;

/// Largest response frame accepted by default.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Which side of the link a frame originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Driver to terminal.
    ToTerminal,
    /// Terminal to driver.
    FromTerminal,
}

impl Direction {
    fn proto_id(self) -> u16 {
        match self {
            Direction::ToTerminal => PROTO_VMC,
            Direction::FromTerminal => PROTO_POS,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame encoding / decoding
// ---------------------------------------------------------------------------

fn push_varint(out: &mut Vec<u8>, value: u16) {
    if value <= 127 {
        out.push(value as u8);
    } else if value <= 255 {
        out.push(VARINT_ONE_BYTE);
        out.push(value as u8);
    } else {
        out.push(VARINT_TWO_BYTES);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Read a varint at `*pos`, advancing it. `None` if the bytes run out or the
/// lead byte is not a known form.
fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u16> {
    let lead = *buf.get(*pos)?;
    let (value, width) = match lead {
        0..=127 => (u16::from(lead), 1),
        VARINT_ONE_BYTE => (u16::from(*buf.get(*pos + 1)?), 2),
        VARINT_TWO_BYTES => {
            let hi = *buf.get(*pos + 1)?;
            let lo = *buf.get(*pos + 2)?;
            (u16::from_be_bytes([hi, lo]), 3)
        }
        _ => return None,
    };
    *pos += width;
    Some(value)
}

/// Serialize a message into one frame.
pub fn encode_frame(message: &Message, direction: Direction) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::with_capacity(64);
    body.extend_from_slice(&direction.proto_id().to_be_bytes());
    for p in message.params() {
        let value_len =
            u16::try_from(p.value.len()).map_err(|_| CodecError::TooLong(p.value.len()))?;
        push_varint(&mut body, p.id);
        push_varint(&mut body, value_len);
        body.extend_from_slice(&p.value);
    }
    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::TooLong(body.len()));
    }

    let mut frame = Vec::with_capacity(body.len() + LEN_FIELD);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Try to decode one frame sent by `direction` from the start of `buf`.
///
/// Every strict prefix of a valid frame yields `Incomplete`; the header is
/// checked as soon as it is visible so garbage is rejected early.
pub fn decode_frame(buf: &[u8], direction: Direction, max_frame_len: usize) -> Decoded {
    if buf.len() < LEN_FIELD {
        return Decoded::Incomplete;
    }
    let body_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if body_len < HEADER_LEN - LEN_FIELD {
        return Decoded::Invalid {
            reason: format!("frame length {body_len} shorter than protocol id"),
        };
    }
    let total = LEN_FIELD + body_len;
    if total > max_frame_len {
        return Decoded::Invalid {
            reason: format!("frame of {total} bytes exceeds limit of {max_frame_len}"),
        };
    }
    if buf.len() >= HEADER_LEN {
        let proto = u16::from_be_bytes([buf[2], buf[3]]);
        if proto != direction.proto_id() {
            return Decoded::Invalid {
                reason: format!("unexpected protocol id 0x{proto:04X}"),
            };
        }
    }
    if buf.len() < total {
        return Decoded::Incomplete;
    }

    let body = &buf[HEADER_LEN..total];
    let mut message = Message::default();
    let mut pos = 0;
    while pos < body.len() {
        let (Some(id), Some(len)) = (read_varint(body, &mut pos), read_varint(body, &mut pos))
        else {
            return Decoded::Invalid {
                reason: format!("bad parameter header at offset {}", HEADER_LEN + pos),
            };
        };
        let end = pos + len as usize;
        if end > body.len() {
            return Decoded::Invalid {
                reason: format!("parameter 0x{id:02X} overruns frame"),
            };
        }
        message.push(id, body[pos..end].to_vec());
        pos = end;
    }

    Decoded::Frame {
        message,
        consumed: total,
    }
}

// ---------------------------------------------------------------------------
// Codec implementation
// ---------------------------------------------------------------------------

/// Vendotek codec adapter.
pub struct VendotekCodec {
    max_frame_len: usize,
}

impl VendotekCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Build the `VRP` message for a charge.
    fn vend_message(request: &MoneyRequest) -> Message {
        let mut msg = Message::named(MSG_VEND)
            .with_number(param::OPERATION, u64::from(request.operation()));
        if let Some(product) = request.product() {
            msg = msg
                .with_number(param::PRODUCT_ID, product.id)
                .with_text(param::PRODUCT_NAME, &product.name);
        }
        msg.with_number(param::AMOUNT, request.amount_minor())
    }

    /// `IDL` opening a charge: shows the product and price before the card
    /// is presented.
    fn announce_message(request: &MoneyRequest) -> Message {
        let mut msg = Message::named(MSG_IDLE);
        if let Some(product) = request.product() {
            msg = msg
                .with_number(param::PRODUCT_ID, product.id)
                .with_text(param::PRODUCT_NAME, &product.name);
        }
        msg.with_number(param::AMOUNT, request.amount_minor())
    }

    /// `FIN` confirming the vend of an approved charge.
    fn finish_message(request: &MoneyRequest) -> Message {
        let mut msg = Message::named(MSG_FINISH)
            .with_number(param::OPERATION, u64::from(request.operation()));
        if let Some(product) = request.product() {
            msg = msg.with_number(param::PRODUCT_ID, product.id);
        }
        msg.with_number(param::AMOUNT, request.amount_minor())
    }

    fn encode_logged(name: &str, message: &Message) -> Result<Vec<u8>, CodecError> {
        let frame = encode_frame(message, Direction::ToTerminal)?;
        debug!("Vendotek {name} ({} bytes):\n{}", frame.len(), message.dump());
        Ok(frame)
    }
}

impl Default for VendotekCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for VendotekCodec {
    fn name(&self) -> &str {
        "Vendotek"
    }

    fn encode_request(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError> {
        Self::encode_logged(MSG_VEND, &Self::vend_message(request))
    }

    fn encode_announce(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError> {
        Self::encode_logged(MSG_IDLE, &Self::announce_message(request))
    }

    fn encode_finish(&self, request: &MoneyRequest) -> Result<Vec<u8>, CodecError> {
        Self::encode_logged(MSG_FINISH, &Self::finish_message(request))
    }

    fn encode_ping(&self) -> Result<Vec<u8>, CodecError> {
        encode_frame(&Message::named(MSG_IDLE), Direction::ToTerminal)
    }

    fn try_decode_response(&self, buf: &[u8]) -> Decoded {
        decode_frame(buf, Direction::FromTerminal, self.max_frame_len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn terminal_frame(msg: &Message) -> Vec<u8> {
        encode_frame(msg, Direction::FromTerminal).unwrap()
    }

    #[test]
    fn test_encode_ping_bytes() {
        let frame = VendotekCodec::new().encode_ping().unwrap();
        assert_eq!(
            frame,
            vec![0x00, 0x07, 0x96, 0xFB, 0x01, 0x03, b'I', b'D', b'L']
        );
    }

    #[test]
    fn test_encode_request_layout() {
        let req = MoneyRequest::new(643, 10, 50, 3, Instant::now()).unwrap();
        let frame = VendotekCodec::new().encode_request(&req).unwrap();
        let mut expected = vec![0x96, 0xFB];
        expected.extend_from_slice(&[0x01, 0x03, b'V', b'R', b'P']);
        expected.extend_from_slice(&[0x03, 0x01, b'3']);
        expected.extend_from_slice(&[0x04, 0x04, b'1', b'0', b'5', b'0']);
        assert_eq!(&frame[..2], &(expected.len() as u16).to_be_bytes());
        assert_eq!(&frame[2..], expected.as_slice());
    }

    fn sent(frame: &[u8]) -> Message {
        match decode_frame(frame, Direction::ToTerminal, DEFAULT_MAX_FRAME_LEN) {
            Decoded::Frame { message, .. } => message,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_announce_carries_price_and_product_without_operation() {
        let req = MoneyRequest::new(643, 10, 50, 3, Instant::now())
            .unwrap()
            .with_product(Product {
                id: 9,
                name: "Tea".into(),
            });
        let msg = sent(&VendotekCodec::new().encode_announce(&req).unwrap());
        assert_eq!(msg.name().as_deref(), Some(MSG_IDLE));
        assert_eq!(msg.number(param::AMOUNT), Some(1050));
        assert_eq!(msg.number(param::PRODUCT_ID), Some(9));
        assert_eq!(msg.text(param::PRODUCT_NAME).as_deref(), Some("Tea"));
        assert_eq!(msg.get(param::OPERATION), None);
    }

    #[test]
    fn test_finish_confirms_operation_and_amount() {
        let req = MoneyRequest::new(643, 10, 50, 3, Instant::now())
            .unwrap()
            .with_operation(44);
        let msg = sent(&VendotekCodec::new().encode_finish(&req).unwrap());
        assert_eq!(msg.name().as_deref(), Some(MSG_FINISH));
        assert_eq!(msg.number(param::OPERATION), Some(44));
        assert_eq!(msg.number(param::AMOUNT), Some(1050));
        assert_eq!(msg.get(param::PRODUCT_NAME), None);
    }

    #[test]
    fn test_encode_request_is_deterministic() {
        let codec = VendotekCodec::new();
        let req = MoneyRequest::new(840, 19, 99, 42, Instant::now())
            .unwrap()
            .with_product(Product {
                id: 5,
                name: "Espresso".into(),
            });
        assert_eq!(
            codec.encode_request(&req).unwrap(),
            codec.encode_request(&req).unwrap()
        );
    }

    #[test]
    fn test_varint_forms() {
        let mut out = Vec::new();
        push_varint(&mut out, 5);
        push_varint(&mut out, 200);
        push_varint(&mut out, 300);
        assert_eq!(out, vec![0x05, 0x81, 200, 0x82, 0x01, 0x2C]);

        let mut pos = 0;
        assert_eq!(read_varint(&out, &mut pos), Some(5));
        assert_eq!(read_varint(&out, &mut pos), Some(200));
        assert_eq!(read_varint(&out, &mut pos), Some(300));
        assert_eq!(pos, out.len());
        assert_eq!(read_varint(&[0x83, 0, 0, 0], &mut 0), None);
    }

    #[test]
    fn test_long_value_uses_wide_length() {
        let receipt = "x".repeat(300);
        let msg = Message::named(MSG_FINISH).with_text(param::BANKING_RECEIPT, &receipt);
        let frame = terminal_frame(&msg);
        match VendotekCodec::new().try_decode_response(&frame) {
            Decoded::Frame { message, consumed } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(message.text(param::BANKING_RECEIPT), Some(receipt));
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_every_strict_prefix_is_incomplete() {
        let codec = VendotekCodec::new();
        let msg = Message::named(MSG_VEND)
            .with_number(param::OPERATION, 12)
            .with_number(param::AMOUNT, 2000)
            .with_text(param::EVENT_NAME, "approved");
        let frame = terminal_frame(&msg);

        for cut in 0..frame.len() {
            assert_eq!(
                codec.try_decode_response(&frame[..cut]),
                Decoded::Incomplete,
                "prefix of {cut} bytes"
            );
        }
        assert_eq!(
            codec.try_decode_response(&frame),
            Decoded::Frame {
                message: msg,
                consumed: frame.len()
            }
        );
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let frame = terminal_frame(&Message::named(MSG_IDLE));
        let mut buf = frame.clone();
        buf.extend_from_slice(&[0x00, 0x09]);
        match VendotekCodec::new().try_decode_response(&buf) {
            Decoded::Frame { consumed, .. } => assert_eq!(consumed, frame.len()),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_protocol_id_is_invalid() {
        // A frame in the driver's own direction is not a terminal response
        let frame = encode_frame(&Message::named(MSG_IDLE), Direction::ToTerminal).unwrap();
        assert!(matches!(
            VendotekCodec::new().try_decode_response(&frame[..4]),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_short_length_is_invalid() {
        assert!(matches!(
            VendotekCodec::new().try_decode_response(&[0x00, 0x01, 0x97]),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_oversized_frame_is_invalid_from_header() {
        let codec = VendotekCodec::with_max_frame_len(16);
        assert!(matches!(
            codec.try_decode_response(&[0x00, 0x20]),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_parameter_overrun_is_invalid() {
        // Declares a 5-byte value but the frame ends after 2
        let buf = [0x00, 0x06, 0x97, 0xFB, 0x01, 0x05, b'I', b'D'];
        assert!(matches!(
            VendotekCodec::new().try_decode_response(&buf),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_bad_varint_lead_is_invalid() {
        let buf = [0x00, 0x05, 0x97, 0xFB, 0x85, 0x00, 0x00];
        assert!(matches!(
            VendotekCodec::new().try_decode_response(&buf),
            Decoded::Invalid { .. }
        ));
    }

    #[test]
    fn test_unknown_parameter_ids_are_preserved() {
        let mut msg = Message::named(MSG_IDLE);
        msg.push(0x42, b"opaque".to_vec());
        let frame = terminal_frame(&msg);
        match VendotekCodec::new().try_decode_response(&frame) {
            Decoded::Frame { message, .. } => assert_eq!(message.get(0x42), Some(&b"opaque"[..])),
            other => panic!("expected frame, got {other:?}"),
        }
    }
}
