use bufrkit::{BitReader, Decoder, Value};
use serde_json::json;

mod common;
use common::{assert_roundtrip, encode, message_values, test_config};

/// Byte offset of the section 4 data (past its 4-byte header) for an
/// edition 4 message with the given number of unexpanded descriptors.
fn section4_data_offset(n_ids: usize) -> usize {
    8 + 22 + (7 + 2 * n_ids) + 4
}

#[test]
fn test_min_diff_transmission() {
    // Three subsets of a 7-bit field: min 100, two extra bits per subset,
    // deltas 0, 2, 1.
    let values = message_values(3, true, &[13003], json!([[100], [102], [101]]));
    let bytes = encode(&values);

    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_uint(7).unwrap(), 100);
    assert_eq!(reader.read_uint(6).unwrap(), 2);
    assert_eq!(reader.read_uint(2).unwrap(), 0b00);
    assert_eq!(reader.read_uint(2).unwrap(), 0b10);
    assert_eq!(reader.read_uint(2).unwrap(), 0b01);

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(100));
    assert_eq!(td.decoded_values_all_subsets[1][0], Value::Int(102));
    assert_eq!(td.decoded_values_all_subsets[2][0], Value::Int(101));
}

#[test]
fn test_all_equal_field() {
    let values = message_values(3, true, &[13003], json!([[55], [55], [55]]));
    let bytes = encode(&values);

    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_uint(7).unwrap(), 55);
    assert_eq!(reader.read_uint(6).unwrap(), 0);

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    for subset in &td.decoded_values_all_subsets {
        assert_eq!(subset[0], Value::Int(55));
    }
}

#[test]
fn test_all_missing_field() {
    let values = message_values(3, true, &[13003], json!([[null], [null], [null]]));
    let bytes = encode(&values);

    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_uint(7).unwrap(), 0x7f);
    assert_eq!(reader.read_uint(6).unwrap(), 0);

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    for subset in &td.decoded_values_all_subsets {
        assert_eq!(subset[0], Value::Missing);
    }
}

#[test]
fn test_equal_values_with_missing_among_them() {
    // Not all-equal and not all-missing: a one-bit delta distinguishes
    // the present values from the missing sentinel.
    let values = message_values(3, true, &[13003], json!([[5], [null], [5]]));
    let bytes = encode(&values);

    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_uint(7).unwrap(), 5);
    assert_eq!(reader.read_uint(6).unwrap(), 1);
    assert_eq!(reader.read_uint(1).unwrap(), 0);
    assert_eq!(reader.read_uint(1).unwrap(), 1);
    assert_eq!(reader.read_uint(1).unwrap(), 0);

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[1][0], Value::Missing);
}

#[test]
fn test_scaled_numeric_compression() {
    let values = message_values(2, true, &[12001], json!([[285.2], [283.9]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    match td.decoded_values_all_subsets[1][0] {
        Value::Float(v) => assert!((v - 283.9).abs() < 1e-9),
        ref other => panic!("expected a float, got {other:?}"),
    }
}

#[test]
fn test_codeflag_sum_landing_on_missing_pattern() {
    // Cloud amount is 4 bits wide; a decoded sum of 15 is the base
    // width's missing pattern and must come back as missing.
    let values = message_values(2, true, &[20011], json!([[10], [15]]));
    let bytes = encode(&values);
    let message = Decoder::new(test_config()).process(&bytes).unwrap();
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(10));
    assert_eq!(td.decoded_values_all_subsets[1][0], Value::Missing);
}

#[test]
fn test_string_compression() {
    let values = message_values(
        2,
        true,
        &[1015, 12001],
        json!([
            ["OSLO                ", 285.2],
            ["BERGEN              ", 283.9]
        ]),
    );
    let bytes = encode(&values);

    // Differing strings: a 20-byte all-zero minimum, then 20 bytes per
    // subset.
    let mut reader = BitReader::new(&bytes[section4_data_offset(2)..]);
    assert_eq!(reader.read_bytes(20).unwrap(), vec![0u8; 20]);
    assert_eq!(reader.read_uint(6).unwrap(), 20);
    assert_eq!(reader.read_bytes(20).unwrap(), b"OSLO                ");
    assert_eq!(reader.read_bytes(20).unwrap(), b"BERGEN              ");

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(
        td.decoded_values_all_subsets[1][0],
        Value::Bytes(b"BERGEN              ".to_vec())
    );
}

#[test]
fn test_equal_string_compression() {
    let values = message_values(
        2,
        true,
        &[1015],
        json!([["TROMSO              "], ["TROMSO              "]]),
    );
    let bytes = encode(&values);
    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_bytes(20).unwrap(), b"TROMSO              ");
    assert_eq!(reader.read_uint(6).unwrap(), 0);
    assert_roundtrip(&values);
}

#[test]
fn test_missing_string_compression() {
    let values = message_values(2, true, &[1015], json!([[null], [null]]));
    let bytes = encode(&values);
    let mut reader = BitReader::new(&bytes[section4_data_offset(1)..]);
    assert_eq!(reader.read_bytes(20).unwrap(), vec![0xffu8; 20]);
    assert_eq!(reader.read_uint(6).unwrap(), 0);

    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Missing);
}
