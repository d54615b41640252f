use bytes::BytesMut;
use h3mux::error::Error;
use h3mux::frame::{
    decode_varint, encode_varint, varint_len, write_frame, FrameReader, FrameType,
};

fn encoded(value: u64) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_varint(&mut buf, value);
    buf.to_vec()
}

#[test]
fn varint_roundtrip_at_boundaries() {
    let cases = [
        0u64,
        1,
        63,
        64,
        16_383,
        16_384,
        0x3FFF_FFFF,
        0x4000_0000,
        0x3FFF_FFFF_FFFF_FFFF,
    ];
    for value in cases {
        let bytes = encoded(value);
        assert_eq!(bytes.len(), varint_len(value), "length for {}", value);
        let (decoded, consumed) = decode_varint(&bytes).expect("decodes");
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }
}

#[test]
fn varint_lengths_follow_two_bit_prefix() {
    assert_eq!(encoded(63).len(), 1);
    assert_eq!(encoded(64).len(), 2);
    assert_eq!(encoded(16_384).len(), 4);
    assert_eq!(encoded(0x4000_0000).len(), 8);
}

#[test]
fn varint_truncated_input() {
    assert!(decode_varint(&[]).is_none());
    // Two-byte varint with only one byte present.
    assert!(decode_varint(&[0x40]).is_none());
    // Eight-byte varint cut short.
    assert!(decode_varint(&[0xC0, 0, 0, 0]).is_none());
}

#[test]
fn frame_wire_format_is_type_len_payload() {
    let mut buf = BytesMut::new();
    write_frame(&mut buf, FrameType::HEADERS, b"abc");
    assert_eq!(&buf[..], &[0x01, 0x03, b'a', b'b', b'c']);

    let mut buf = BytesMut::new();
    write_frame(&mut buf, FrameType::DATA, &[]);
    assert_eq!(&buf[..], &[0x00, 0x00]);
}

#[test]
fn grease_frame_types() {
    assert!(FrameType(0x21).is_grease());
    assert!(FrameType(0x21 + 0x1f).is_grease());
    assert!(FrameType(0x21 + 31 * 0x1f).is_grease());
    assert!(!FrameType::DATA.is_grease());
    assert!(!FrameType::HEADERS.is_grease());
    assert!(!FrameType(0x22).is_grease());
}

#[tokio::test]
async fn reader_walks_frames() {
    let mut wire = BytesMut::new();
    write_frame(&mut wire, FrameType::HEADERS, b"hdrs");
    write_frame(&mut wire, FrameType::DATA, b"payload");
    let wire = wire.freeze();

    let mut fr = FrameReader::new(&wire[..]);
    let (ty, len) = fr.next().await.unwrap().expect("first frame");
    assert_eq!(ty, FrameType::HEADERS);
    assert_eq!(len, 4);
    let payload = fr.read_payload(1024).await.unwrap();
    assert_eq!(&payload[..], b"hdrs");

    let (ty, len) = fr.next().await.unwrap().expect("second frame");
    assert_eq!(ty, FrameType::DATA);
    assert_eq!(len, 7);
    let mut buf = [0u8; 4];
    assert_eq!(fr.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"payl");
    let mut rest = [0u8; 16];
    assert_eq!(fr.read(&mut rest).await.unwrap(), 3);
    assert_eq!(&rest[..3], b"oad");
    assert_eq!(fr.read(&mut rest).await.unwrap(), 0);

    assert!(fr.next().await.unwrap().is_none());
}

#[tokio::test]
async fn reader_skips_unread_payload_on_next() {
    let mut wire = BytesMut::new();
    write_frame(&mut wire, FrameType::DATA, b"ignored");
    write_frame(&mut wire, FrameType::HEADERS, b"x");
    let wire = wire.freeze();

    let mut fr = FrameReader::new(&wire[..]);
    fr.next().await.unwrap();
    // Payload untouched; next() discards it.
    let (ty, len) = fr.next().await.unwrap().expect("second frame");
    assert_eq!(ty, FrameType::HEADERS);
    assert_eq!(len, 1);
}

#[tokio::test]
async fn oversized_payload_is_a_structured_error() {
    let mut wire = BytesMut::new();
    write_frame(&mut wire, FrameType::HEADERS, &[0u8; 32]);
    let wire = wire.freeze();

    let mut fr = FrameReader::new(&wire[..]);
    fr.next().await.unwrap();
    match fr.read_payload(16).await {
        Err(Error::FrameLength(err)) => {
            assert_eq!(err.frame_type, FrameType::HEADERS);
            assert_eq!(err.len, 32);
            assert_eq!(err.max, 16);
        }
        other => panic!("expected FrameLength error, got {:?}", other),
    }
}

#[tokio::test]
async fn expect_skips_grease_and_reports_type_mismatch() {
    // grease frame, then DATA where HEADERS is required
    let mut wire = BytesMut::new();
    write_frame(&mut wire, FrameType(0x21), b"grease");
    write_frame(&mut wire, FrameType::DATA, b"body");
    let wire = wire.freeze();

    let mut fr = FrameReader::new(&wire[..]);
    match fr.expect(FrameType::HEADERS).await {
        Err(Error::FrameType(err)) => {
            assert_eq!(err.want, FrameType::HEADERS);
            assert_eq!(err.got, FrameType::DATA);
        }
        other => panic!("expected FrameType error, got {:?}", other),
    }
}

#[tokio::test]
async fn truncated_frame_header_is_an_error() {
    // Frame type present, length varint missing.
    let wire = [0x01u8];
    let mut fr = FrameReader::new(&wire[..]);
    assert!(fr.next().await.is_err());
}

#[tokio::test]
async fn resume_positions_on_a_frame() {
    let mut wire = BytesMut::new();
    wire.extend_from_slice(b"hdrs");
    let wire = wire.freeze();

    let mut fr = FrameReader::resume(&wire[..], FrameType::HEADERS, 4);
    assert!(fr.at_frame_start());
    assert_eq!(fr.current(), Some((FrameType::HEADERS, 4)));
    let payload = fr.read_payload(1024).await.unwrap();
    assert_eq!(&payload[..], b"hdrs");
}
