use serde_json::json;

use super::compression::{self, Inflated, StreamInflater};
use super::framer::{DEFAULT_MAX_PACKET_SIZE, Frame, FramerConfig, SerialFramer};
use super::{XorCipher, extract_json_frames, extract_sealed_json_frames, reassemble, split_packets};
use crate::utils::error::FramingError;

fn framer(key: Option<&str>, compression: bool, json_mode: bool) -> SerialFramer {
    SerialFramer::new(FramerConfig {
        encryption_key: key.map(str::to_string),
        compression,
        json_mode,
        ..FramerConfig::default()
    })
    .unwrap()
}

fn sample_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_xor_cipher_is_its_own_inverse() {
    let cipher = XorCipher::new("telescope");
    let data = b"slew to M31".to_vec();
    let sealed = cipher.apply(&data, 0);
    assert_ne!(sealed, data);
    assert_eq!(cipher.apply(&sealed, 0), data);
}

#[test]
fn test_xor_cipher_offset_matches_whole_payload() {
    let cipher = XorCipher::new("k");
    let data = sample_payload(100);
    let whole = cipher.apply(&data, 0);
    let mut pieces = cipher.apply(&data[..40], 0);
    pieces.extend(cipher.apply(&data[40..], 40));
    assert_eq!(whole, pieces);
}

#[test]
fn test_seal_open_roundtrip_all_modes() {
    let sizes = [0, 1, DEFAULT_MAX_PACKET_SIZE + 1, 5 * DEFAULT_MAX_PACKET_SIZE];
    for (key, compress) in [
        (None, false),
        (Some("secret"), false),
        (None, true),
        (Some("secret"), true),
    ] {
        let f = framer(key, compress, true);
        for len in sizes {
            let payload = sample_payload(len);
            let wire = f.seal(&payload).unwrap();
            assert_eq!(
                f.open(&wire).unwrap(),
                payload,
                "key={key:?} compress={compress} len={len}"
            );
        }
    }
}

#[test]
fn test_compress_decompress_empty() {
    let packed = compression::compress(&[]).unwrap();
    assert!(!packed.is_empty());
    assert!(compression::decompress(&packed).unwrap().is_empty());
}

#[test]
fn test_split_and_reassemble_boundaries() {
    let max = 64;
    for n in [0, 1, max, max + 1, 10 * max] {
        let payload = sample_payload(n);
        let packets = split_packets(&payload, max);
        assert!(packets.iter().all(|p| p.len() <= max && !p.is_empty()));
        assert_eq!(packets.len(), n.div_ceil(max));
        assert_eq!(reassemble(&packets), payload);
    }
}

#[test]
fn test_zero_packet_size_rejected() {
    let err = SerialFramer::new(FramerConfig {
        max_packet_size: 0,
        ..FramerConfig::default()
    })
    .unwrap_err();
    assert!(matches!(err, FramingError::Capacity(_)));
}

#[test]
fn test_json_frame_split_across_reads() {
    let mut f = framer(None, false, true);
    let text = br#"{"channel":"focuser","data":{"position":1200}}"#;
    let (a, b) = text.split_at(10);

    assert!(f.feed(a).unwrap().is_empty());
    let frames = f.feed(b).unwrap();
    assert_eq!(
        frames,
        vec![Frame::Json(
            json!({"channel": "focuser", "data": {"position": 1200}})
        )]
    );
    assert_eq!(f.buffered(), 0);
}

#[test]
fn test_noise_before_frame_is_skipped() {
    let mut buffer = b"\x00\x13garbage{\"a\":1}".to_vec();
    let frames = extract_json_frames(&mut buffer);
    assert_eq!(frames, vec![json!({"a": 1})]);
    assert!(buffer.is_empty());
}

#[test]
fn test_invalid_span_drops_only_opening_brace() {
    // first '{' never closes; the scan drops it and finds the inner object
    let mut buffer = br#"{"broken": {"ok":true}"#.to_vec();
    let frames = extract_json_frames(&mut buffer);
    assert_eq!(frames, vec![json!({"ok": true})]);
}

#[test]
fn test_two_objects_in_one_read_yield_the_last() {
    let mut buffer = br#"{"n":1}{"n":2}"#.to_vec();
    let frames = extract_json_frames(&mut buffer);
    assert_eq!(frames, vec![json!({"n": 2})]);
    assert!(buffer.is_empty());
}

#[test]
fn test_partial_frame_waits_for_more() {
    let mut buffer = br#"{"n":"#.to_vec();
    assert!(extract_json_frames(&mut buffer).is_empty());
    assert_eq!(buffer, br#"{"n":"#.to_vec());
}

#[test]
fn test_encrypted_json_stream_over_packets() {
    let sender = SerialFramer::new(FramerConfig {
        max_packet_size: 8,
        encryption_key: Some("guider".to_string()),
        ..FramerConfig::default()
    })
    .unwrap();
    let mut receiver = framer(Some("guider"), false, true);

    let payload = serde_json::to_vec(&json!({"channel": "guider", "data": [1, 2, 3]})).unwrap();
    let packets = sender.encode(&payload).unwrap();
    assert!(packets.len() > 1);

    let mut frames = Vec::new();
    for packet in &packets {
        frames.extend(receiver.feed(packet).unwrap());
    }
    assert_eq!(
        frames,
        vec![Frame::Json(json!({"channel": "guider", "data": [1, 2, 3]}))]
    );
}

#[test]
fn test_truncated_frame_then_good_frames_recovers() {
    for key in [None, Some("guider")] {
        let sender = framer(key, false, true);
        let mut receiver = framer(key, false, true);

        let lost = sender
            .seal(br#"{"channel":"guider","data":"lost"}"#)
            .unwrap();
        let mut frames = receiver.feed(&lost[..5]).unwrap();
        for n in 0..10 {
            let text = serde_json::to_vec(&json!({"channel": "guider", "data": n})).unwrap();
            frames.extend(receiver.feed(&sender.seal(&text).unwrap()).unwrap());
        }

        let expected: Vec<Frame> = (0..10)
            .map(|n| Frame::Json(json!({"channel": "guider", "data": n})))
            .collect();
        assert_eq!(frames, expected, "key {key:?}");
        assert_eq!(receiver.buffered(), 0, "key {key:?}");
    }
}

#[test]
fn test_sealed_payloads_in_one_read_each_decode() {
    let cipher = XorCipher::new("focuser");
    let mut buffer = b"\x07\x07".to_vec();
    buffer.extend(cipher.apply(br#"{"n":1}"#, 0));
    buffer.extend(cipher.apply(br#"{"n":2}"#, 0));
    buffer.extend(cipher.apply(br#"{"n":"#, 0));

    let frames = extract_sealed_json_frames(&mut buffer, &cipher);
    assert_eq!(frames, vec![json!({"n": 1}), json!({"n": 2})]);
    assert_eq!(buffer, cipher.apply(br#"{"n":"#, 0));
}

#[test]
fn test_compressed_encrypted_payloads_back_to_back() {
    let sender = framer(Some("camera"), true, true);
    let mut receiver = framer(Some("camera"), true, true);

    let first = sender.seal(br#"{"exposure":30}"#).unwrap();
    let second = sender.seal(br#"{"exposure":60}"#).unwrap();
    let mut stream = first.clone();
    stream.extend_from_slice(&second);

    // arrive in awkward chunk sizes
    let mut frames = Vec::new();
    for chunk in stream.chunks(5) {
        frames.extend(receiver.feed(chunk).unwrap());
    }
    assert_eq!(
        frames,
        vec![
            Frame::Json(json!({"exposure": 30})),
            Frame::Json(json!({"exposure": 60})),
        ]
    );
}

#[test]
fn test_raw_mode_passes_bytes_through() {
    let mut f = framer(None, false, false);
    let frames = f.feed(b"\x01\x02\x03").unwrap();
    assert_eq!(frames, vec![Frame::Raw(vec![1, 2, 3])]);
}

#[test]
fn test_raw_mode_with_compression_emits_whole_payloads() {
    let sender = framer(None, true, false);
    let mut receiver = framer(None, true, false);
    let payload = sample_payload(3000);
    let packets = sender.encode(&payload).unwrap();

    let mut frames = Vec::new();
    for packet in &packets {
        frames.extend(receiver.feed(packet).unwrap());
    }
    assert_eq!(frames, vec![Frame::Raw(payload)]);
}

#[test]
fn test_buffer_capacity_exceeded() {
    let mut f = SerialFramer::new(FramerConfig {
        max_buffer_size: 16,
        ..FramerConfig::default()
    })
    .unwrap();
    let err = f.feed(b"{\"this frame is far too long\"").unwrap_err();
    assert!(matches!(err, FramingError::Capacity(_)));
    assert_eq!(f.buffered(), 0);
}

#[test]
fn test_stream_inflater_reports_consumed_bytes() {
    let mut packed = compression::compress(b"hello").unwrap();
    let len = packed.len();
    packed.extend_from_slice(b"tail");

    let mut inflater = StreamInflater::new();
    match inflater.feed(&packed).unwrap() {
        Inflated::Complete { consumed, payload } => {
            assert_eq!(consumed, len);
            assert_eq!(payload, b"hello");
        }
        Inflated::NeedMore => panic!("expected a complete payload"),
    }
}

#[test]
fn test_corrupt_compressed_stream_errors() {
    let mut f = framer(None, true, true);
    let err = f.feed(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap_err();
    assert!(matches!(err, FramingError::Compression(_)));
}
