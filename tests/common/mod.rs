use std::path::PathBuf;

use bufrkit::Config;
use serde_json::{Value as Json, json};

pub fn tables_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/testdata/tables")
}

pub fn test_config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();
    Config {
        tables_root_dir: tables_root(),
        normalize: false,
        ..Config::default()
    }
}

/// The encoder's values tree for an edition 4 message, with deferred
/// (zero) section and total lengths.
pub fn message_values(
    n_subsets: u64,
    is_compressed: bool,
    ids: &[u32],
    subsets: Json,
) -> Json {
    json!([
        ["BUFR", 0, 4],
        [0, 0, 0, 0, 0, false, "0000000", 2, 4, 0, 18, 0, 2016, 2, 18, 23, 0, 0],
        [0, "00000000", n_subsets, true, is_compressed, "000000", ids],
        [0, "00000000", subsets],
        ["7777"]
    ])
}

/// The same message shape for edition 3 (year of century, narrow centre
/// fields, even-byte section padding).
pub fn message_values_ed3(n_subsets: u64, ids: &[u32], subsets: Json) -> Json {
    json!([
        ["BUFR", 0, 3],
        [0, 0, 0, 0, 0, false, "0000000", 2, 4, 18, 0, 96, 2, 18, 23, 0],
        [0, "00000000", n_subsets, true, false, "000000", ids],
        [0, "00000000", subsets],
        ["7777"]
    ])
}

/// Encode a values tree and hand back the wire bytes.
pub fn encode(values: &Json) -> Vec<u8> {
    bufrkit::Encoder::new(test_config())
        .process(values)
        .unwrap()
        .serialized_bytes
        .unwrap()
}

/// Encode, decode and re-encode; both byte buffers must be identical.
pub fn assert_roundtrip(values: &Json) -> bufrkit::BufrMessage {
    let bytes = encode(values);
    let decoder = bufrkit::Decoder::new(test_config());
    let message = decoder.process(&bytes).unwrap();
    let n_subsets = message.n_subsets.unwrap() as usize;
    let reencoded = encode(&message.subset(&(0..n_subsets).collect::<Vec<_>>()).unwrap());
    assert_eq!(reencoded, bytes, "re-encoded bytes differ");
    message
}
