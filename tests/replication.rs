use bufrkit::{Decoder, Encoder, Error, Value};
use serde_json::json;

mod common;
use common::{assert_roundtrip, encode, message_values, test_config};

#[test]
fn test_nested_delayed_replication() {
    // An outer fixed replication of two passes over a delayed replication
    // of (cloud amount, temperature) pairs.
    let ids = [104002, 102000, 31001, 20011, 12001];
    let values = message_values(
        1,
        false,
        &ids,
        json!([[
            2, 3, 285.2, 1, 290.0, //
            3, 8, 275.6, 0, 281.1, 9, 263.4
        ]]),
    );
    let message = assert_roundtrip(&values);

    let td = message.template_data.as_ref().unwrap();
    let ids: Vec<u32> = td.decoded_descriptors_all_subsets[0]
        .iter()
        .map(|d| d.id())
        .collect();
    assert_eq!(
        ids,
        vec![31001, 20011, 12001, 20011, 12001, 31001, 20011, 12001, 20011, 12001, 20011, 12001]
    );
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(2));
    assert_eq!(td.decoded_values_all_subsets[0][5], Value::Int(3));
    // The unexpanded list is retained for re-encoding.
    assert_eq!(
        message.unexpanded_descriptors.as_deref(),
        Some(&[104002, 102000, 31001, 20011, 12001][..])
    );
}

#[test]
fn test_delayed_replication_factor_zero() {
    let values = message_values(1, false, &[101000, 31001, 12001], json!([[0]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    let descriptors = &td.decoded_descriptors_all_subsets[0];
    assert_eq!(descriptors.len(), 1);
    assert_eq!(descriptors[0].id(), 31001);
    assert_eq!(td.decoded_values_all_subsets[0], vec![Value::Int(0)]);
}

#[test]
fn test_fixed_replication_expansion_count() {
    let values = message_values(
        1,
        false,
        &[103002, 20011, 12001, 13003],
        json!([[3, 285.2, 67, 8, 283.9, 82]]),
    );
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    // A factor of k yields exactly k * len(members) expanded descriptors.
    assert_eq!(td.decoded_descriptors_all_subsets[0].len(), 6);
}

#[test]
fn test_missing_delayed_replication_factor_is_fatal() {
    let values = message_values(1, false, &[101000, 31001, 12001], json!([[0]]));
    let mut bytes = encode(&values);
    // Overwrite the 8-bit factor, the first data byte of section 4,
    // with the all-ones missing pattern. Section 4 is the 5 bytes right
    // before the end section.
    let at = bytes.len() - 5;
    bytes[at] = 0xff;

    let err = Decoder::new(test_config()).process(&bytes).unwrap_err();
    match err {
        Error::ProtocolViolation(reason) => {
            assert!(reason.contains("delayed replication factor must be >= 0"))
        }
        other => panic!("expected a protocol violation, got {other}"),
    }
}

#[test]
fn test_delayed_repetition_is_not_implemented() {
    let values = message_values(1, false, &[101000, 31011, 12001], json!([[0]]));
    let err = Encoder::new(test_config()).process(&values).unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
}

#[test]
fn test_compressed_delayed_replication() {
    let values = message_values(
        2,
        true,
        &[101000, 31001, 12001],
        json!([[2, 285.2, 285.4], [2, 283.9, 284.1]]),
    );
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(2));
    assert_eq!(td.decoded_values_all_subsets[1][0], Value::Int(2));
    assert_eq!(td.decoded_descriptors_all_subsets[0].len(), 3);
}
