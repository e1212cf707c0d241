use bufrkit::{DecodedDescriptor, Decoder, Encoder, Error, Value};
use serde_json::json;

mod common;
use common::{assert_roundtrip, encode, message_values, test_config};

#[test]
fn test_width_and_scale_offsets() {
    let ids = [201132, 202129, 12001, 201000, 202000, 12001];
    let values = message_values(1, false, &ids, json!([[285.12, 285.2]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    match td.decoded_values_all_subsets[0][0] {
        Value::Float(v) => assert!((v - 285.12).abs() < 1e-9),
        ref other => panic!("expected a float, got {other:?}"),
    }
    match td.decoded_values_all_subsets[0][1] {
        Value::Float(v) => assert!((v - 285.2).abs() < 1e-9),
        ref other => panic!("expected a float, got {other:?}"),
    }
}

#[test]
fn test_207_increases_width_scale_and_refval() {
    // 207002 on a 12-bit, scale-1 element: width grows to 20, scale to 3.
    let ids = [207002, 11002, 207000, 11002];
    let values = message_values(1, false, &ids, json!([[12.345, 12.3]]));
    let message = assert_roundtrip(&values);

    let td = message.template_data.as_ref().unwrap();
    match td.decoded_values_all_subsets[0][0] {
        Value::Float(v) => assert!((v - 12.345).abs() < 1e-9),
        ref other => panic!("expected a float, got {other:?}"),
    }

    // 20 + 12 bits of data behind the 4-byte section header.
    let s4 = message.sections[3].get("section_length").unwrap().as_uint();
    assert_eq!(s4, Some(8));
}

#[test]
fn test_new_reference_value_definition() {
    // 203012 captures a sign-magnitude reference value for 012001, then
    // 203255 concludes the definition block.
    let ids = [203012, 12001, 203255, 12001];
    let values = message_values(1, false, &ids, json!([[-1000, 250.0]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(-1000));
    match td.decoded_values_all_subsets[0][1] {
        Value::Float(v) => assert!((v - 250.0).abs() < 1e-9),
        ref other => panic!("expected a float, got {other:?}"),
    }
}

#[test]
fn test_new_reference_value_for_string_is_rejected() {
    let ids = [203012, 1015];
    let values = message_values(1, false, &ids, json!([[0]]));
    let err = Encoder::new(test_config()).process(&values).unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation(_)));
}

#[test]
fn test_associated_field() {
    // Two bits of associated data ride in front of the temperature; the
    // class 31 significance element itself is exempt.
    let ids = [204002, 31021, 12001, 204000];
    let values = message_values(1, false, &ids, json!([[1, 2, 285.2]]));
    let message = assert_roundtrip(&values);

    let td = message.template_data.as_ref().unwrap();
    let descriptors = &td.decoded_descriptors_all_subsets[0];
    assert_eq!(descriptors.len(), 3);
    assert_eq!(descriptors[0].id(), 31021);
    assert!(matches!(
        descriptors[1],
        DecodedDescriptor::Associated { id: 12001, nbits: 2 }
    ));
    assert_eq!(td.decoded_values_all_subsets[0][1], Value::Int(2));
}

#[test]
fn test_205_inserts_character_data() {
    let ids = [205004, 12001];
    let values = message_values(1, false, &ids, json!([["NOTE", 285.2]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    let descriptors = &td.decoded_descriptors_all_subsets[0];
    assert!(matches!(descriptors[0], DecodedDescriptor::Operator(205004)));
    assert_eq!(
        td.decoded_values_all_subsets[0][0],
        Value::Bytes(b"NOTE".to_vec())
    );
}

#[test]
fn test_206_skips_unknown_local_descriptor() {
    // 063250 has no Table B entry; 206010 supplies its width so the
    // message still decodes.
    let ids = [206010, 63250];
    let values = message_values(1, false, &ids, json!([[517]]));
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert!(matches!(
        td.decoded_descriptors_all_subsets[0][0],
        DecodedDescriptor::SkippedLocal { id: 63250, nbits: 10 }
    ));
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Int(517));
}

#[test]
fn test_unknown_descriptor_without_206_is_fatal() {
    let values = message_values(1, false, &[63250], json!([[0]]));
    let err = Encoder::new(test_config()).process(&values).unwrap_err();
    assert!(matches!(err, Error::UnknownDescriptor(63250)));
}

#[test]
fn test_208_overrides_string_width() {
    let ids = [208004, 1015, 208000, 1015];
    let values = message_values(
        1,
        false,
        &ids,
        json!([["OSLO", "BERGEN              "]]),
    );
    let message = assert_roundtrip(&values);
    let td = message.template_data.as_ref().unwrap();
    assert_eq!(
        td.decoded_values_all_subsets[0][0],
        Value::Bytes(b"OSLO".to_vec())
    );
    assert_eq!(
        td.decoded_values_all_subsets[0][1],
        Value::Bytes(b"BERGEN              ".to_vec())
    );
}

#[test]
fn test_221_data_not_present() {
    let ids = [221002, 12001, 13003, 12001];
    let values = message_values(1, false, &ids, json!([[null, null, 285.2]]));
    let message = assert_roundtrip(&values);

    let td = message.template_data.as_ref().unwrap();
    let descriptors = &td.decoded_descriptors_all_subsets[0];
    assert!(matches!(descriptors[0], DecodedDescriptor::NotPresent(_)));
    assert!(matches!(descriptors[1], DecodedDescriptor::NotPresent(_)));
    assert!(matches!(descriptors[2], DecodedDescriptor::Element(_)));
    assert_eq!(td.decoded_values_all_subsets[0][0], Value::Missing);

    // Only the third element occupies bits: 12 data bits in section 4.
    let s4 = message.sections[3].get("section_length").unwrap().as_uint();
    assert_eq!(s4, Some(6));
}

#[test]
fn test_unsupported_operator_is_not_implemented() {
    let values = message_values(1, false, &[241000], json!([[]]));
    let err = Encoder::new(test_config()).process(&values).unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
}

#[test]
fn test_stop_signature_expectation() {
    let values = message_values(1, false, &[12001], json!([[285.2]]));
    let mut bytes = encode(&values);
    let at = bytes.len() - 1;
    bytes[at] = b'8';

    let err = Decoder::new(test_config()).process(&bytes).unwrap_err();
    assert!(matches!(err, Error::UnexpectedValue { .. }));

    let config = bufrkit::Config {
        ignore_value_expectation: true,
        ..test_config()
    };
    assert!(Decoder::new(config).process(&bytes).is_ok());
}
