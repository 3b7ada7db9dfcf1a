//! Frame encoding/decoding: header escaping, content-length handling,
//! partial input and malformed input.

use bytes::BytesMut;
use osmium_stomp::codec::{CodecError, StompCodec, StompItem};
use osmium_stomp::{Command, Frame};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio_util::codec::{Decoder, Encoder};

fn encode(frame: Frame) -> BytesMut {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    codec
        .encode(StompItem::Frame(frame), &mut buf)
        .expect("encode failed");
    buf
}

fn decode_one(bytes: &[u8]) -> Result<Option<StompItem>, CodecError> {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(bytes);
    codec.decode(&mut buf)
}

fn decode_frame(bytes: &[u8]) -> Frame {
    match decode_one(bytes).expect("decode failed") {
        Some(StompItem::Frame(f)) => f,
        other => panic!("expected frame, got {:?}", other),
    }
}

// ============================================================================
// Header escaping
// ============================================================================

#[test]
fn unescapes_every_defined_sequence() {
    let cases: &[(&[u8], &str)] = &[
        (b"MESSAGE\nh:value\\\\with\\\\backslashes\n\n\0", "value\\with\\backslashes"),
        (b"MESSAGE\nh:line1\\nline2\n\n\0", "line1\nline2"),
        (b"MESSAGE\nh:before\\rafter\n\n\0", "before\rafter"),
        (b"MESSAGE\nh:key\\cvalue\n\n\0", "key:value"),
        (b"MESSAGE\nh:a\\nb\\rc\\\\d\\ce\n\n\0", "a\nb\rc\\d:e"),
    ];
    for (raw, expected) in cases {
        let frame = decode_frame(raw);
        assert_eq!(frame.get_header("h"), Some(*expected), "raw: {:?}", raw);
    }
}

#[test]
fn unescapes_header_names() {
    let frame = decode_frame(b"MESSAGE\nkey\\cname:value\n\n\0");
    assert_eq!(frame.get_header("key:name"), Some("value"));
}

#[test]
fn invalid_escape_is_malformed() {
    for raw in [
        &b"MESSAGE\nheader:bad\\xescape\n\n\0"[..],
        &b"MESSAGE\nheader:trailing\\\n\n\0"[..],
    ] {
        match decode_one(raw) {
            Err(CodecError::Malformed(msg)) => assert!(msg.contains("escape"), "{}", msg),
            other => panic!("expected malformed, got {:?}", other),
        }
    }
}

#[test]
fn encoder_escapes_special_characters() {
    let frame = Frame::new(Command::Send)
        .header("destination", "/queue/test")
        .header("custom", "a\nb\rc\\d:e");
    let encoded = encode(frame);
    let text = String::from_utf8_lossy(&encoded);
    assert!(text.contains("custom:a\\nb\\rc\\\\d\\ce\n"), "{}", text);
}

#[test]
fn connect_headers_are_written_verbatim() {
    let frame = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("passcode", "pa:ss");
    let encoded = encode(frame);
    assert!(String::from_utf8_lossy(&encoded).contains("passcode:pa:ss\n"));
}

#[test]
fn escaped_headers_survive_roundtrip() {
    let values = [
        "C:\\Users\\test\\file.txt",
        "first\nsecond\nthird",
        "line1\r\nline2",
        "http://example.com:8080/path",
        "",
        "\\\n\r:",
        "\n\n\n\\\\\\",
    ];
    for value in values {
        let original = Frame::new(Command::Send)
            .header("destination", "/queue/test")
            .header("x", value);
        let mut buf = encode(original.clone());
        let mut codec = StompCodec::new();
        match codec.decode(&mut buf).expect("decode failed") {
            Some(StompItem::Frame(f)) => assert_eq!(f, original),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(buf.is_empty());
    }
}

// ============================================================================
// Bodies and content-length
// ============================================================================

#[test]
fn text_body_is_encoded_without_content_length() {
    let frame = Frame::new(Command::Send)
        .header("destination", "/queue/b")
        .set_body(br#"{"x":1}"#.to_vec());
    let encoded = encode(frame);
    assert_eq!(&encoded[..], b"SEND\ndestination:/queue/b\n\n{\"x\":1}\0");
}

#[test]
fn body_with_nul_gets_content_length() {
    let body = vec![b'a', 0, b'b', 0];
    let frame = Frame::new(Command::Send)
        .header("destination", "/queue/bin")
        .set_body(body.clone());
    let encoded = encode(frame);
    assert!(String::from_utf8_lossy(&encoded).contains("content-length:4\n"));

    let decoded = decode_frame(&encoded);
    assert_eq!(decoded.body(), &body[..]);
}

#[test]
fn existing_content_length_is_not_duplicated() {
    let frame = Frame::new(Command::Send)
        .header("content-length", "3")
        .set_body(vec![1, 0, 2]);
    let encoded = encode(frame);
    let text = String::from_utf8_lossy(&encoded);
    assert_eq!(text.matches("content-length").count(), 1);
}

#[test]
fn content_length_body_may_contain_nul() {
    let frame = decode_frame(b"MESSAGE\ncontent-length:5\n\nab\0cd\0");
    assert_eq!(frame.body(), b"ab\0cd");
}

#[test]
fn missing_nul_after_content_length_body_is_malformed() {
    assert!(matches!(
        decode_one(b"MESSAGE\ncontent-length:2\n\nabc\0"),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn non_numeric_content_length_is_malformed() {
    assert!(matches!(
        decode_one(b"SEND\ncontent-length:xyz\n\nhello\0"),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn short_content_length_input_is_incomplete() {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::from(&b"MESSAGE\ncontent-length:10\n\nabc"[..]);
    assert!(codec.decode(&mut buf).expect("decode failed").is_none());
    assert_eq!(buf.len(), 30, "incomplete input must stay buffered");

    buf.extend_from_slice(b"defghij\0");
    match codec.decode(&mut buf).expect("decode failed") {
        Some(StompItem::Frame(f)) => assert_eq!(f.body(), b"abcdefghij"),
        other => panic!("expected frame, got {:?}", other),
    }
}

// ============================================================================
// Malformed input
// ============================================================================

#[test]
fn unknown_command_is_malformed() {
    assert!(matches!(
        decode_one(b"FROB\n\n\0"),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn header_without_colon_is_malformed() {
    assert!(matches!(
        decode_one(b"MESSAGE\nno-colon-here\n\nbody\0"),
        Err(CodecError::Malformed(_))
    ));
}

#[test]
fn invalid_utf8_header_is_malformed() {
    assert!(matches!(
        decode_one(b"MESSAGE\nh:\xff\xfe\n\n\0"),
        Err(CodecError::Malformed(_))
    ));
}

// ============================================================================
// Partial input
// ============================================================================

#[test]
fn byte_by_byte_feed_yields_same_frame() {
    let original = Frame::new(Command::Message)
        .header("destination", "/queue/a")
        .header("message-id", "m-1")
        .header("subscription", "sub-1")
        .set_body(b"hello world".to_vec());
    let wire = encode(original.clone());

    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    let mut decoded = None;
    for (i, b) in wire.iter().enumerate() {
        buf.extend_from_slice(&[*b]);
        if let Some(item) = codec.decode(&mut buf).expect("decode failed") {
            assert_eq!(i, wire.len() - 1, "frame completed early");
            decoded = Some(item);
        }
    }
    assert_eq!(decoded, Some(StompItem::Frame(original)));
}

#[test]
fn random_chunking_decodes_every_frame() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut frames = Vec::new();
    let mut wire = BytesMut::new();
    let mut codec = StompCodec::new();

    for i in 0..50 {
        let len = rng.gen_range(0..64);
        let mut body: Vec<u8> = (0..len).map(|_| rng.r#gen::<u8>()).collect();
        let mut frame = Frame::new(Command::Message)
            .header("subscription", format!("sub-{}", i % 4))
            .header("message-id", format!("m-{}", i))
            .header("note", "colon:and\\slash");
        if i % 3 == 0 {
            // NUL-terminated text body
            body.retain(|b| *b != 0 && b.is_ascii());
        } else {
            frame = frame.header("content-length", body.len().to_string());
        }
        let frame = frame.set_body(body);
        codec
            .encode(StompItem::Frame(frame.clone()), &mut wire)
            .expect("encode failed");
        if i % 5 == 0 {
            codec
                .encode(StompItem::Heartbeat, &mut wire)
                .expect("encode failed");
        }
        frames.push(frame);
    }

    let mut buf = BytesMut::new();
    let mut out = Vec::new();
    let mut rest = &wire[..];
    while !rest.is_empty() {
        let n = rng.gen_range(1..=rest.len().min(40));
        buf.extend_from_slice(&rest[..n]);
        rest = &rest[n..];
        while let Some(item) = codec.decode(&mut buf).expect("decode failed") {
            if let StompItem::Frame(f) = item {
                out.push(f);
            }
        }
    }

    assert_eq!(out, frames);
    assert!(buf.is_empty());
}
