//! A toolkit for encoding and decoding WMO BUFR meteorological messages.

use std::path::PathBuf;

mod bitops;
mod coder;
mod compiler;
mod decoder;
mod descriptors;
mod encoder;
mod message;
mod sections;
pub mod tables;

pub use bitops::{BitReader, BitWriter};
pub use coder::{BitmapPhase, BsrModifier, CoderState, QaInfoStatus};
pub use compiler::{
    CompiledDescriptor, CompiledTemplate, CompiledTemplateManager, StateSnapshot, Statement,
};
pub use decoder::{Decoder, MessageSplitter, split_messages};
pub use descriptors::{
    BufrTemplate, DecodedDescriptor, DelayedReplication, Descriptor, ElementDescriptor,
    FixedReplication, MarkerDescriptor, SequenceDescriptor, f_of, x_of, y_of,
};
pub use encoder::Encoder;
pub use message::{BufrMessage, TemplateData};
pub use sections::{BufrSection, Expected, ParamKind, ParamSpec, ParameterValue, SectionParameter};
pub use tables::{TableGroup, TableGroupKey, get_table_group};

/// The error type used by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown descriptor {0:06}")]
    UnknownDescriptor(u32),
    #[error("bit read error: {0}")]
    BitRead(String),
    #[error("unexpected value for {name}: expected {expected}, got {actual}")]
    UnexpectedValue {
        name: String,
        expected: String,
        actual: String,
    },
    #[error("length mismatch for {name}: declared {declared} bytes, actual {actual} bytes")]
    LengthMismatch {
        name: String,
        declared: u64,
        actual: u64,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("table load error: {0}")]
    TableLoad(String),
}

/// Primitive value carried by one decoded descriptor.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Missing value
    Missing,
    /// Integer value (numerics with an effective scale of zero, code/flag
    /// values, replication factors, bitmap bits)
    Int(i64),
    /// Scaled numeric value
    Float(f64),
    /// Character string, kept as raw octets
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    /// The value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Missing => write!(f, "Missing"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
        }
    }
}

/// Options accepted by both [`Decoder`] and [`Encoder`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory under which the versioned table JSON files live.
    pub tables_root_dir: PathBuf,
    /// On decode, do not assert section parameter `expected` values.
    pub ignore_value_expectation: bool,
    /// On encode, always recompute section and total lengths.
    pub ignore_declared_length: bool,
    /// Capacity of the compiled-template cache; 0 disables compilation.
    pub compiled_template_cache_max: usize,
    /// Override for the section 1 master table version on encode.
    pub master_table_version: Option<u64>,
    /// Table fallback policy: apply defaults when the exact version is absent.
    pub normalize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tables_root_dir: PathBuf::from("tables"),
            ignore_value_expectation: false,
            ignore_declared_length: false,
            compiled_template_cache_max: 0,
            master_table_version: None,
            normalize: true,
        }
    }
}

pub(crate) const NBITS_PER_BYTE: u32 = 8;

pub(crate) const MESSAGE_START_SIGNATURE: &[u8] = b"BUFR";
pub(crate) const MESSAGE_STOP_SIGNATURE: &[u8] = b"7777";

/// Number of bits used to transmit the per-field delta width of
/// compressed data.
pub(crate) const NBITS_FOR_NBITS_DIFF: u32 = 6;

pub(crate) const UNITS_STRING: &str = "CCITT IA5";
pub(crate) const UNITS_FLAG_TABLE: &str = "FLAG TABLE";
pub(crate) const UNITS_CODE_TABLE: &str = "CODE TABLE";
pub(crate) const UNITS_COMMON_CODE_TABLE_C1: &str = "Common CODE TABLE C-1";

/// The all-ones pattern that stands for a missing value at the given width.
pub(crate) fn numeric_missing_value(nbits: u32) -> u64 {
    if nbits >= 64 { u64::MAX } else { (1u64 << nbits) - 1 }
}

/// Whether a transport value decodes as missing. The all-ones pattern of a
/// single-bit field is a legal value, not a missing marker.
pub(crate) fn is_missing_uint(value: u64, nbits: u32) -> bool {
    nbits > 1 && value == numeric_missing_value(nbits)
}
