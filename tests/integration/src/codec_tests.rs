//! Codec Tests - Marshalling Laws at Scale
//!
//! These tests exercise the wire codec beyond the unit level:
//! - Round-trips for every type code and both byte orders
//! - Large arrays in linear time
//! - Message frame re-encoding fidelity
//! - Decoder failure modes on corrupted frames

mod common;

use common::init_logging;
use dbus_wire::{
    marshal, unmarshal, Endianness, Message, Signature, Type, Value, WireError,
};
use std::time::Instant;

fn roundtrip(values: &[Value]) {
    let sig: Signature = values.iter().map(Value::ty).collect();
    for order in [Endianness::Little, Endianness::Big] {
        let (bytes, fds) = marshal(values, order).expect("marshal");
        let decoded = unmarshal(&sig, &bytes, order, &fds).expect("unmarshal");
        assert_eq!(decoded, values, "round-trip under {:?}", order);
    }
}

#[test]
fn test_roundtrip_every_type_code() {
    init_logging();
    roundtrip(&[
        Value::Byte(255),
        Value::Boolean(false),
        Value::Int16(-32768),
        Value::UInt16(65535),
        Value::Int32(-1),
        Value::UInt32(u32::MAX),
        Value::Int64(i64::MAX),
        Value::UInt64(u64::MAX),
        Value::Double(f64::MIN_POSITIVE),
        Value::from("☂ unicode and spaces"),
        Value::ObjectPath("/a/b/_c".into()),
        Value::Signature(Signature::parse("a{s(ui)}").unwrap()),
        Value::Array(Type::Int64, vec![Value::Int64(1), Value::Int64(-2)]),
        Value::Struct(vec![
            Value::Byte(1),
            Value::Struct(vec![Value::from("nested"), Value::Double(2.5)]),
        ]),
        Value::string_variant_dict(vec![
            ("k1".to_string(), Value::from(1u32)),
            ("k2".to_string(), Value::Array(Type::Byte, vec![])),
        ]),
        Value::Variant(Box::new(Value::Variant(Box::new(Value::Boolean(true))))),
    ]);
}

/// 100k `(us)` structs decode element-for-element in bounded time
#[test]
fn test_large_struct_array() {
    init_logging();
    const COUNT: u32 = 100_000;

    let items: Vec<Value> = (0..COUNT)
        .map(|i| Value::Struct(vec![Value::UInt32(i), Value::Str(format!("entry-{}", i))]))
        .collect();
    let array = Value::Array(Type::Struct(vec![Type::UInt32, Type::String]), items);
    let sig: Signature = [array.ty()].into_iter().collect();

    let start = Instant::now();
    let (bytes, fds) = marshal(std::slice::from_ref(&array), Endianness::Little).expect("marshal");
    let decoded = unmarshal(&sig, &bytes, Endianness::Little, &fds).expect("unmarshal");
    let elapsed = start.elapsed();

    match &decoded[0] {
        Value::Array(_, items) => {
            assert_eq!(items.len(), COUNT as usize);
            for (i, item) in items.iter().enumerate() {
                match item {
                    Value::Struct(fields) => {
                        assert_eq!(fields[0], Value::UInt32(i as u32));
                        assert_eq!(fields[1], Value::Str(format!("entry-{}", i)));
                    }
                    other => panic!("expected struct, got {:?}", other),
                }
            }
        }
        other => panic!("expected array, got {:?}", other),
    }

    println!(
        "large array: {} entries, {} bytes, {:?}",
        COUNT,
        bytes.len(),
        elapsed
    );
    assert!(
        elapsed.as_secs() < 10,
        "encode+decode of {} entries took {:?}",
        COUNT,
        elapsed
    );
}

#[test]
fn test_message_reencoding_is_identical() {
    init_logging();
    let mut messages = Vec::new();

    let mut call = Message::method_call("/org/test/obj", "Echo")
        .unwrap()
        .with_interface("org.test.iface")
        .unwrap()
        .with_destination(":1.42")
        .unwrap()
        .with_body(&[Value::from("payload"), Value::UInt32(7)])
        .unwrap();
    call.serial = 11;
    messages.push(call.clone());

    let mut ret = Message::method_return(&call).with_body(&[Value::from("pong")]).unwrap();
    ret.serial = 12;
    messages.push(ret);

    let mut err = Message::error(&call, "org.test.Error.Nope", "not today").unwrap();
    err.serial = 13;
    messages.push(err);

    let mut sig = Message::signal("/org/test/obj", "org.test.iface", "Changed")
        .unwrap()
        .with_body(&[Value::string_variant_dict(vec![(
            "key".to_string(),
            Value::from(5u32),
        )])])
        .unwrap();
    sig.serial = 14;
    messages.push(sig);

    for msg in messages {
        let encoded = msg.encode().expect("encode");
        let (decoded, consumed) = Message::decode(&encoded).expect("decode");
        let decoded = decoded.expect("known type");
        assert_eq!(consumed, encoded.len());
        // Re-encoding a decoded frame reproduces it byte for byte
        assert_eq!(decoded.encode().expect("re-encode"), encoded);
    }
}

#[test]
fn test_decode_across_concatenated_frames() {
    init_logging();
    let mut buf = Vec::new();
    let mut serials = Vec::new();
    for i in 1..=3u32 {
        let mut msg = Message::signal("/org/test/obj", "org.test.iface", "Tick")
            .unwrap()
            .with_body(&[Value::UInt32(i)])
            .unwrap();
        msg.serial = i;
        serials.push(i);
        buf.extend_from_slice(&msg.encode().unwrap());
    }

    let mut seen = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let (msg, consumed) = Message::decode(&buf[offset..]).expect("decode");
        seen.push(msg.expect("known type").serial);
        offset += consumed;
    }
    assert_eq!(seen, serials);
}

#[test]
fn test_corrupted_frames_rejected() {
    init_logging();
    let mut msg = Message::signal("/org/test/obj", "org.test.iface", "Tick").unwrap();
    msg.serial = 1;
    let good = msg.encode().unwrap();

    // Bad endian tag
    let mut bad = good.to_vec();
    bad[0] = b'x';
    assert!(matches!(
        Message::decode(&bad),
        Err(WireError::InvalidHeader(_))
    ));

    // Bad protocol version
    let mut bad = good.to_vec();
    bad[3] = 2;
    assert!(matches!(
        Message::decode(&bad),
        Err(WireError::InvalidHeader(_))
    ));

    // Zero serial
    let mut bad = good.to_vec();
    bad[8..12].copy_from_slice(&[0, 0, 0, 0]);
    assert!(matches!(
        Message::decode(&bad),
        Err(WireError::InvalidHeader(_))
    ));

    // Truncation at every prefix length fails with Incomplete
    for len in 0..good.len() {
        assert!(
            matches!(
                Message::decode(&good[..len]),
                Err(WireError::Incomplete { .. })
            ),
            "prefix of {} bytes",
            len
        );
    }
}

#[test]
fn test_signature_depth_and_validation() {
    init_logging();
    // Within limits
    assert!(Signature::parse(&("a".repeat(32) + "y")).is_ok());
    // Array depth over 32
    assert!(Signature::parse(&("a".repeat(33) + "y")).is_err());
    // Mixed nesting at the 32/32 boundary is the deepest legal shape
    let deepest = "a(".repeat(32) + "i" + &")".repeat(32);
    assert!(Signature::parse(&deepest).is_ok());
    let too_deep = "a(".repeat(33) + "i" + &")".repeat(33);
    assert!(Signature::parse(&too_deep).is_err());
}
