//! Decoding of BUFR messages: section framing driven by the parameter
//! schemas, then the template walker consuming the data section.

use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;

use crate::bitops::BitReader;
use crate::coder::{self, CoderOps, CoderState};
use crate::compiler::CompiledTemplateManager;
use crate::descriptors::DecodedDescriptor;
use crate::message::{BufrMessage, TemplateData};
use crate::sections::{
    BufrSection, Expected, ParamKind, ParameterValue, SectionParameter, SectionSchema,
    schema_for_section,
};
use crate::{
    Config, Error, MESSAGE_START_SIGNATURE, NBITS_FOR_NBITS_DIFF, Value, is_missing_uint, tables,
};

/// Decodes BUFR messages against the configured tables.
pub struct Decoder {
    config: Config,
    compiled_templates: CompiledTemplateManager,
}

impl Decoder {
    pub fn new(config: Config) -> Self {
        let compiled_templates = CompiledTemplateManager::new(config.compiled_template_cache_max);
        Self {
            config,
            compiled_templates,
        }
    }

    /// Decode one whole message from a byte buffer.
    pub fn process(&self, input: &[u8]) -> Result<BufrMessage, Error> {
        self.decode_message(input, false)
    }

    /// Decode only the header sections, stopping right before the
    /// template data.
    pub fn process_info(&self, input: &[u8]) -> Result<BufrMessage, Error> {
        self.decode_message(input, true)
    }

    /// Decode every message found in a buffer. A malformed message yields
    /// one error and decoding continues at the next `BUFR` signature.
    pub fn process_stream<'a>(
        &'a self,
        input: &'a [u8],
    ) -> impl Iterator<Item = Result<BufrMessage, Error>> + 'a {
        split_messages(input).map(|message| message.and_then(|bytes| self.process(bytes)))
    }

    fn decode_message(&self, input: &[u8], info_only: bool) -> Result<BufrMessage, Error> {
        let mut reader = BitReader::new(input);
        let mut message = BufrMessage::default();
        for index in 0..=5u8 {
            if index == 2 && !message.is_section2_presents.unwrap_or(false) {
                debug!("section 2 is not present");
                continue;
            }
            let schema = schema_for_section(index, message.edition_or_default());
            let stop = self.decode_section(&mut reader, &mut message, schema, info_only)?;
            if stop {
                break;
            }
        }
        Ok(message)
    }

    /// Decode one section. Returns `true` when decoding should stop
    /// early (info mode reaching the template data).
    fn decode_section(
        &self,
        reader: &mut BitReader<'_>,
        message: &mut BufrMessage,
        schema: &'static SectionSchema,
        info_only: bool,
    ) -> Result<bool, Error> {
        debug!("decoding section {} of edition {}", schema.index, message.edition_or_default());
        let bitpos_start = reader.bit_position();
        let mut section = BufrSection::new(schema);
        let mut section_end: Option<u64> = None;

        for spec in schema.params {
            if info_only && spec.kind == ParamKind::TemplateData {
                message.sections.push(section);
                return Ok(true);
            }
            let nbits = if spec.nbits > 0 {
                spec.nbits as u64
            } else {
                let end = section_end.ok_or_else(|| {
                    Error::ProtocolViolation(format!(
                        "parameter {} requires a known section length",
                        spec.name
                    ))
                })?;
                end.saturating_sub(reader.bit_position())
            };

            let value = match spec.kind {
                ParamKind::Uint => ParameterValue::Uint(reader.read_uint(nbits as u32)?),
                ParamKind::Int => ParameterValue::Int(reader.read_int(nbits as u32)?),
                ParamKind::Bool => ParameterValue::Bool(reader.read_bool()?),
                ParamKind::Bytes => ParameterValue::Bytes(reader.read_bytes((nbits / 8) as usize)?),
                ParamKind::Bin => ParameterValue::Bin(reader.read_bin(nbits as u32)?),
                ParamKind::UnexpandedDescriptors => {
                    ParameterValue::UnexpandedDescriptors(read_descriptor_ids(reader, nbits)?)
                }
                ParamKind::TemplateData => {
                    let td = self.decode_template_data(reader, message)?;
                    ParameterValue::TemplateData(Arc::new(td))
                }
            };

            if !self.config.ignore_value_expectation {
                check_expected(spec.name, spec.expected, &value)?;
            }
            if spec.as_property {
                message.set_property(spec.name, &value);
            }
            if spec.name == "section_length" {
                if let ParameterValue::Uint(nbytes) = value {
                    section_end = Some(bitpos_start + nbytes * 8);
                }
            }
            section.parameters.push(SectionParameter { spec, value });
        }

        // The cursor must land within the declared length; the remaining
        // padding bits (byte alignment, and even-byte alignment for
        // edition 3 and lower) are skipped.
        if let Some(end) = section_end {
            let pos = reader.bit_position();
            if pos > end {
                return Err(Error::ProtocolViolation(format!(
                    "section {} data runs {} bits past its declared length",
                    schema.index,
                    pos - end
                )));
            }
            reader.seek(end)?;
        }
        message.sections.push(section);
        Ok(false)
    }

    fn decode_template_data(
        &self,
        reader: &mut BitReader<'_>,
        message: &mut BufrMessage,
    ) -> Result<TemplateData, Error> {
        let n_subsets = message.n_subsets_or_zero();
        let is_compressed = message.is_compressed_or_false();
        let ids = message.unexpanded_descriptors.clone().unwrap_or_default();

        let table_group = tables::get_table_group(
            &self.config.tables_root_dir,
            message.master_table_number.unwrap_or(0),
            message.originating_centre.unwrap_or(0),
            message.originating_subcentre.unwrap_or(0),
            message.master_table_version.unwrap_or(0),
            message.local_table_version.unwrap_or(0),
            self.config.normalize,
        )?;
        message.table_group_key = Some(table_group.key.clone());
        let template = table_group.template_from_ids(&ids)?;

        let mut state = CoderState::new(is_compressed, n_subsets, None);
        let mut ops = DecodeOps { reader };
        let compiled = self
            .compiled_templates
            .get_or_compile(&ids, &table_group, &template)?;
        match compiled {
            Some(compiled) => {
                if is_compressed {
                    compiled.replay(&mut ops, &mut state, &table_group)?;
                } else {
                    for idx_subset in 0..n_subsets {
                        state.switch_subset_context(idx_subset);
                        compiled.replay(&mut ops, &mut state, &table_group)?;
                    }
                }
            }
            None => {
                if is_compressed {
                    coder::process_template(&mut ops, &mut state, &template)?;
                } else {
                    for idx_subset in 0..n_subsets {
                        state.switch_subset_context(idx_subset);
                        coder::process_template(&mut ops, &mut state, &template)?;
                    }
                }
            }
        }
        Ok(state.into_template_data(template))
    }
}

fn read_descriptor_ids(reader: &mut BitReader<'_>, nbits: u64) -> Result<Vec<u32>, Error> {
    // Two bytes per descriptor: F(2) X(6) Y(8). A trailing odd padding
    // byte (edition 3) is left to the section-end skip.
    let count = (nbits / 16) as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let packed = reader.read_uint(16)? as u32;
        let f = (packed >> 14) & 0x3;
        let x = (packed >> 8) & 0x3f;
        let y = packed & 0xff;
        ids.push(f * 100_000 + x * 1000 + y);
    }
    Ok(ids)
}

fn check_expected(
    name: &str,
    expected: Option<Expected>,
    value: &ParameterValue,
) -> Result<(), Error> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let matches = match (&expected, value) {
        (Expected::Bytes(b), ParameterValue::Bytes(v)) => v == b,
        (Expected::Uint(u), ParameterValue::Uint(v)) => v == u,
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(Error::UnexpectedValue {
            name: name.to_string(),
            expected: format!("{expected:?}"),
            actual: format!("{value:?}"),
        })
    }
}

pub(crate) struct DecodeOps<'a, 'b> {
    pub(crate) reader: &'a mut BitReader<'b>,
}

impl DecodeOps<'_, '_> {
    fn apply_numeric(&self, value: u64, scale: i32, refval: i64) -> Value {
        let value = value as i64 + refval;
        match scale {
            0 => Value::Int(value),
            s if s > 0 => Value::Float(value as f64 / 10f64.powi(s)),
            s => Value::Float(value as f64 * 10f64.powi(-s)),
        }
    }
}

impl CoderOps for DecodeOps<'_, '_> {
    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            let min_bytes = self.reader.read_bytes(nbytes)?;
            let all_missing = !min_bytes.is_empty() && min_bytes.iter().all(|&b| b == 0xff);
            let nbytes_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as usize;
            if nbytes_diff == 0 {
                let value = if all_missing {
                    Value::Missing
                } else {
                    Value::Bytes(min_bytes)
                };
                state.push_value_all_subsets(value);
            } else {
                for idx_subset in 0..state.n_subsets {
                    let bytes = self.reader.read_bytes(nbytes_diff)?;
                    let value = if bytes.iter().all(|&b| b == 0xff) {
                        Value::Missing
                    } else {
                        Value::Bytes(bytes)
                    };
                    state.values_all[idx_subset].push(value);
                }
            }
        } else {
            let bytes = self.reader.read_bytes(nbytes)?;
            let value = if !bytes.is_empty() && bytes.iter().all(|&b| b == 0xff) {
                Value::Missing
            } else {
                Value::Bytes(bytes)
            };
            state.push_value(value);
        }
        Ok(())
    }

    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error> {
        let base_nbits = descriptor.base_nbits().unwrap_or(nbits);
        state.push_descriptor(descriptor);
        if state.is_compressed {
            let min = self.reader.read_uint_or_missing(nbits)?;
            let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as u32;
            match min {
                None if nbits_diff != 0 => {
                    return Err(Error::ProtocolViolation(
                        "nbits_diff must be zero for compressed values that are all missing"
                            .to_string(),
                    ));
                }
                None => state.push_value_all_subsets(Value::Missing),
                Some(min) if nbits_diff == 0 => {
                    state.push_value_all_subsets(Value::Int(min as i64));
                }
                Some(min) => {
                    for idx_subset in 0..state.n_subsets {
                        let value = match self.reader.read_uint_or_missing(nbits_diff)? {
                            None => Value::Missing,
                            Some(diff) => {
                                // A small code/flag sum can still land on
                                // the base width's missing pattern.
                                let value = min + diff;
                                if is_missing_uint(value, base_nbits) {
                                    Value::Missing
                                } else {
                                    Value::Int(value as i64)
                                }
                            }
                        };
                        state.values_all[idx_subset].push(value);
                    }
                }
            }
        } else {
            let value = match self.reader.read_uint_or_missing(nbits)? {
                None => Value::Missing,
                Some(v) => Value::Int(v as i64),
            };
            state.push_value(value);
        }
        Ok(())
    }

    fn process_numeric(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
        scale: i32,
        refval: i64,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            let min = self.reader.read_uint_or_missing(nbits)?;
            let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as u32;
            match min {
                None if nbits_diff != 0 => {
                    return Err(Error::ProtocolViolation(
                        "nbits_diff must be zero for compressed values that are all missing"
                            .to_string(),
                    ));
                }
                None => state.push_value_all_subsets(Value::Missing),
                Some(min) if nbits_diff == 0 => {
                    let value = self.apply_numeric(min, scale, refval);
                    state.push_value_all_subsets(value);
                }
                Some(min) => {
                    for idx_subset in 0..state.n_subsets {
                        let value = match self.reader.read_uint_or_missing(nbits_diff)? {
                            None => Value::Missing,
                            Some(diff) => self.apply_numeric(min + diff, scale, refval),
                        };
                        state.values_all[idx_subset].push(value);
                    }
                }
            }
        } else {
            let value = match self.reader.read_uint_or_missing(nbits)? {
                None => Value::Missing,
                Some(v) => self.apply_numeric(v, scale, refval),
            };
            state.push_value(value);
        }
        Ok(())
    }

    fn process_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error> {
        let id = descriptor.id();
        state.push_descriptor(descriptor);
        // Sign-magnitude, unlike standard numerics.
        let value = self.reader.read_int(nbits)?;
        if state.is_compressed {
            let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)?;
            if nbits_diff != 0 {
                return Err(Error::ProtocolViolation(
                    "new reference values must be identical for all subsets".to_string(),
                ));
            }
            state.push_value_all_subsets(Value::Int(value));
        } else {
            state.push_value(Value::Int(value));
        }
        state.new_refvals.insert(id, value);
        Ok(())
    }

    fn process_constant(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        value: i64,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            state.push_value_all_subsets(Value::Int(value));
        } else {
            state.push_value(Value::Int(value));
        }
        Ok(())
    }

    fn process_not_present(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            state.push_value_all_subsets(Value::Missing);
        } else {
            state.push_value(Value::Missing);
        }
        Ok(())
    }

    fn bitmap_values(&self, state: &CoderState, n: usize) -> Result<Vec<i64>, Error> {
        let values = state.values();
        if values.len() < n {
            return Err(Error::ProtocolViolation(format!(
                "bitmap of {n} bits exceeds the {} decoded values",
                values.len()
            )));
        }
        values[values.len() - n..]
            .iter()
            .map(|value| {
                value.as_int().ok_or_else(|| {
                    Error::ProtocolViolation(format!("bitmap bit is not an integer: {value:?}"))
                })
            })
            .collect()
    }

    fn delayed_factor_index(&self, state: &CoderState) -> usize {
        state.values().len() - 1
    }
}

/// Iterator over the messages of a byte buffer, each sliced out by the
/// 24-bit total length following its `BUFR` signature.
pub struct MessageSplitter<'a> {
    input: &'a [u8],
    pos: usize,
}

/// Split a buffer into one byte slice per BUFR message.
pub fn split_messages(input: &[u8]) -> MessageSplitter<'_> {
    MessageSplitter { input, pos: 0 }
}

impl<'a> Iterator for MessageSplitter<'a> {
    type Item = Result<&'a [u8], Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos + 8 <= self.input.len() {
            if &self.input[self.pos..self.pos + 4] != MESSAGE_START_SIGNATURE {
                self.pos += 1;
                continue;
            }
            let mut cursor = std::io::Cursor::new(&self.input[self.pos + 4..]);
            let length = cursor.read_u24::<BigEndian>().unwrap_or(0) as usize;
            if length < 8 || self.pos + length > self.input.len() {
                let error = Error::ProtocolViolation(format!(
                    "message at byte {} declares {length} bytes, {} available",
                    self.pos,
                    self.input.len() - self.pos
                ));
                self.pos += 4;
                return Some(Err(error));
            }
            let message = &self.input[self.pos..self.pos + length];
            self.pos += length;
            return Some(Ok(message));
        }
        None
    }
}
