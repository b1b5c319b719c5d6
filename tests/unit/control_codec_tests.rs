//! Unit tests for control-socket framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use term_supervisor::control::{Category, ControlCodec, ControlMessage};
use term_supervisor::errors::ProtocolError;
use term_supervisor::AppError;

/// Frames carry a 4-byte big-endian length prefix.
#[test]
fn encode_writes_length_prefix() {
    let message = ControlMessage::event(Category::System, "ready", None);
    let body = message.encode().expect("encode");

    let mut codec = ControlCodec::new();
    let mut buf = BytesMut::new();
    codec.encode(message, &mut buf).expect("frame");

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    assert_eq!(len, body.len());
    assert_eq!(&buf[4..], body.as_slice());
}

/// A frame is only yielded once all of it has arrived.
#[test]
fn decode_waits_for_full_frame() {
    let message = ControlMessage::request(Category::System, "ping", None);
    let mut codec = ControlCodec::new();
    let mut full = BytesMut::new();
    codec.encode(message.clone(), &mut full).expect("frame");

    let mut partial = full.split_to(full.len() - 3);
    assert!(codec.decode(&mut partial).expect("partial").is_none());

    partial.unsplit(full);
    let frame = codec.decode(&mut partial).expect("decode").expect("frame");
    assert_eq!(ControlMessage::decode(&frame).expect("json"), message);
}

/// Frames over the limit are rejected as malformed.
#[test]
fn oversized_frame_is_rejected() {
    let mut codec = ControlCodec::with_max_frame(16);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&64_u32.to_be_bytes());
    buf.extend_from_slice(&[b'x'; 64]);

    let err = codec.decode(&mut buf).expect_err("too large");
    assert!(matches!(
        err,
        AppError::Protocol(ProtocolError::MalformedMessage(_))
    ));
}
