//! Encoding of BUFR messages from a values tree, reversing the decoder's
//! data flow. Section lengths declared as zero (or overridden by
//! configuration) are back-patched once the body has been serialized.

use std::sync::Arc;

use log::debug;
use serde_json::Value as Json;

use crate::bitops::BitWriter;
use crate::coder::{self, CoderOps, CoderState};
use crate::compiler::CompiledTemplateManager;
use crate::descriptors::DecodedDescriptor;
use crate::message::{BufrMessage, TemplateData, string_to_latin1};
use crate::sections::{
    BufrSection, ParamKind, ParameterValue, SectionParameter, SectionSchema, schema_for_section,
};
use crate::{
    Config, Error, NBITS_FOR_NBITS_DIFF, NBITS_PER_BYTE, Value, numeric_missing_value, tables,
};

/// Encodes a values tree (the shape produced by [`BufrMessage::subset`])
/// back into BUFR bytes.
pub struct Encoder {
    config: Config,
    compiled_templates: CompiledTemplateManager,
}

impl Encoder {
    pub fn new(config: Config) -> Self {
        let compiled_templates = CompiledTemplateManager::new(config.compiled_template_cache_max);
        Self {
            config,
            compiled_templates,
        }
    }

    /// Encode one message. The input is an array with one entry per
    /// section, each an array of parameter values in schema order.
    pub fn process(&self, data: &Json) -> Result<BufrMessage, Error> {
        let sections_values = data.as_array().ok_or_else(|| {
            Error::ProtocolViolation("encoder input must be an array of sections".to_string())
        })?;

        let mut writer = BitWriter::new();
        let mut message = BufrMessage::default();
        let mut total_length: Option<(u64, u64)> = None;

        let mut data_idx = 0;
        for index in 0..=5u8 {
            if index == 2 && !message.is_section2_presents.unwrap_or(false) {
                continue;
            }
            let schema = schema_for_section(index, message.edition_or_default());
            let values = sections_values
                .get(data_idx)
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    Error::ProtocolViolation(format!("missing values for section {index}"))
                })?;
            data_idx += 1;
            self.encode_section(&mut writer, &mut message, schema, values, &mut total_length)?;
        }

        let total_bytes = writer.bit_position() / NBITS_PER_BYTE as u64;
        if let Some((bitpos, declared)) = total_length {
            if declared == 0 || self.config.ignore_declared_length {
                writer.set_uint(total_bytes, 24, bitpos)?;
            } else if declared != total_bytes {
                return Err(Error::LengthMismatch {
                    name: "length".to_string(),
                    declared,
                    actual: total_bytes,
                });
            }
        }
        message.length = Some(total_bytes);
        if let Some(section0) = message.sections.first_mut() {
            if let Some(p) = section0
                .parameters
                .iter_mut()
                .find(|p| p.spec.name == "length")
            {
                p.value = ParameterValue::Uint(total_bytes);
            }
        }

        message.serialized_bytes = Some(writer.to_bytes());
        Ok(message)
    }

    fn encode_section(
        &self,
        writer: &mut BitWriter,
        message: &mut BufrMessage,
        schema: &'static SectionSchema,
        values: &[Json],
        total_length: &mut Option<(u64, u64)>,
    ) -> Result<(), Error> {
        debug!("encoding section {}", schema.index);
        if values.len() != schema.params.len() {
            return Err(Error::ProtocolViolation(format!(
                "section {} expects {} parameter values, got {}",
                schema.index,
                schema.params.len(),
                values.len()
            )));
        }

        let bitpos_start = writer.bit_position();
        let mut section = BufrSection::new(schema);
        let mut section_length: Option<(u64, u64)> = None;

        for (spec, json) in schema.params.iter().zip(values) {
            let value = match spec.kind {
                ParamKind::Uint => {
                    let mut v = json.as_u64().ok_or_else(|| expected(spec.name, "an unsigned integer", json))?;
                    if schema.index == 1 && spec.name == "master_table_version" {
                        if let Some(version) = self.config.master_table_version {
                            v = version;
                        }
                    }
                    if spec.name == "section_length" {
                        section_length = Some((writer.bit_position(), v));
                    } else if schema.index == 0 && spec.name == "length" {
                        *total_length = Some((writer.bit_position(), v));
                    }
                    writer.write_uint(v, spec.nbits)?;
                    ParameterValue::Uint(v)
                }
                ParamKind::Int => {
                    let v = json.as_i64().ok_or_else(|| expected(spec.name, "an integer", json))?;
                    writer.write_int(v, spec.nbits)?;
                    ParameterValue::Int(v)
                }
                ParamKind::Bool => {
                    let v = json.as_bool().ok_or_else(|| expected(spec.name, "a boolean", json))?;
                    writer.write_bool(v)?;
                    ParameterValue::Bool(v)
                }
                ParamKind::Bytes => {
                    let s = json.as_str().ok_or_else(|| expected(spec.name, "a string", json))?;
                    let mut bytes = string_to_latin1(s)?;
                    let nbytes = if spec.nbits > 0 {
                        (spec.nbits / NBITS_PER_BYTE) as usize
                    } else {
                        bytes.len()
                    };
                    writer.write_bytes(&bytes, nbytes)?;
                    bytes.resize(nbytes, b' ');
                    ParameterValue::Bytes(bytes)
                }
                ParamKind::Bin => {
                    let s = json.as_str().ok_or_else(|| expected(spec.name, "a bit-string", json))?;
                    if spec.nbits > 0 && s.len() != spec.nbits as usize {
                        return Err(Error::ProtocolViolation(format!(
                            "bit-string for {} must have {} bits, got {}",
                            spec.name,
                            spec.nbits,
                            s.len()
                        )));
                    }
                    writer.write_bin(s)?;
                    ParameterValue::Bin(s.to_string())
                }
                ParamKind::UnexpandedDescriptors => {
                    let ids = parse_descriptor_ids(json)?;
                    for id in &ids {
                        let packed =
                            ((id / 100_000) << 14) | ((id / 1000 % 100) << 8) | (id % 1000);
                        writer.write_uint(packed as u64, 16)?;
                    }
                    ParameterValue::UnexpandedDescriptors(ids)
                }
                ParamKind::TemplateData => {
                    let td = self.encode_template_data(writer, message, json)?;
                    ParameterValue::TemplateData(Arc::new(td))
                }
            };
            if spec.as_property {
                message.set_property(spec.name, &value);
            }
            section.parameters.push(SectionParameter { spec, value });
        }

        // Pad to a byte boundary; editions up to 3 pad each section to an
        // even byte count.
        let used = writer.bit_position() - bitpos_start;
        if used % NBITS_PER_BYTE as u64 != 0 {
            writer.skip(NBITS_PER_BYTE as u64 - used % NBITS_PER_BYTE as u64)?;
        }
        if message.edition_or_default() <= 3 {
            let nbytes = (writer.bit_position() - bitpos_start) / NBITS_PER_BYTE as u64;
            if nbytes % 2 == 1 {
                writer.skip(NBITS_PER_BYTE as u64)?;
            }
        }

        let actual = (writer.bit_position() - bitpos_start) / NBITS_PER_BYTE as u64;
        if let Some((bitpos, declared)) = section_length {
            if declared == 0 || self.config.ignore_declared_length {
                writer.set_uint(actual, 24, bitpos)?;
                if let Some(p) = section
                    .parameters
                    .iter_mut()
                    .find(|p| p.spec.name == "section_length")
                {
                    p.value = ParameterValue::Uint(actual);
                }
            } else if actual > declared {
                return Err(Error::LengthMismatch {
                    name: format!("section {}", schema.index),
                    declared,
                    actual,
                });
            } else if actual < declared {
                // Undershoot is padded with zeros up to the declared length.
                writer.skip((declared - actual) * NBITS_PER_BYTE as u64)?;
            }
        }
        message.sections.push(section);
        Ok(())
    }

    fn encode_template_data(
        &self,
        writer: &mut BitWriter,
        message: &mut BufrMessage,
        json: &Json,
    ) -> Result<TemplateData, Error> {
        let n_subsets = message.n_subsets_or_zero();
        let is_compressed = message.is_compressed_or_false();
        let subsets = json.as_array().ok_or_else(|| {
            Error::ProtocolViolation("template data must be an array of subsets".to_string())
        })?;
        if subsets.len() != n_subsets {
            return Err(Error::ProtocolViolation(format!(
                "template data carries {} subsets, section 3 declares {n_subsets}",
                subsets.len()
            )));
        }
        let values_all = subsets
            .iter()
            .map(|subset| {
                subset
                    .as_array()
                    .ok_or_else(|| {
                        Error::ProtocolViolation("subset values must be an array".to_string())
                    })?
                    .iter()
                    .map(json_to_value)
                    .collect::<Result<Vec<Value>, Error>>()
            })
            .collect::<Result<Vec<Vec<Value>>, Error>>()?;

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

        let mut state = CoderState::new(is_compressed, n_subsets, Some(values_all));
        let mut ops = EncodeOps { writer };
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

fn expected(name: &str, what: &str, got: &Json) -> Error {
    Error::ProtocolViolation(format!("parameter {name} expects {what}, got {got}"))
}

fn parse_descriptor_ids(json: &Json) -> Result<Vec<u32>, Error> {
    json.as_array()
        .ok_or_else(|| {
            Error::ProtocolViolation("unexpanded descriptors must be an array".to_string())
        })?
        .iter()
        .map(|v| match v {
            Json::String(s) => s.parse::<u32>().map_err(|_| {
                Error::ProtocolViolation(format!("bad descriptor id {s:?}"))
            }),
            _ => v
                .as_u64()
                .map(|id| id as u32)
                .ok_or_else(|| Error::ProtocolViolation(format!("bad descriptor id {v}"))),
        })
        .collect()
}

fn json_to_value(json: &Json) -> Result<Value, Error> {
    Ok(match json {
        Json::Null => Value::Missing,
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().ok_or_else(|| {
                Error::ProtocolViolation(format!("unrepresentable number {n}"))
            })?),
        },
        Json::String(s) => Value::Bytes(string_to_latin1(s)?),
        Json::Bool(b) => Value::Int(*b as i64),
        other => {
            return Err(Error::ProtocolViolation(format!(
                "unsupported value in template data: {other}"
            )));
        }
    })
}

/// Round half away from zero, the rounding applied after scaling.
fn round_away_from_zero(v: f64) -> i64 {
    (v.abs() + 0.5).floor() as i64 * v.signum() as i64
}

/// The delta width for compressed fields: the smallest width that holds
/// every delta and still leaves the all-ones pattern free for missing.
fn nbits_for_diff(max_minus_min: u64) -> u32 {
    64 - (max_minus_min + 1).leading_zeros()
}

pub(crate) struct EncodeOps<'a> {
    pub(crate) writer: &'a mut BitWriter,
}

impl EncodeOps<'_> {
    /// Scale, round and reference-shift one value into its transport form.
    fn to_transport(&self, value: &Value, scale: i32, refval: i64) -> Result<Option<i64>, Error> {
        match value {
            Value::Missing => Ok(None),
            Value::Int(v) => {
                let scaled = match scale {
                    0 => *v,
                    s if s > 0 => round_away_from_zero(*v as f64 * 10f64.powi(s)),
                    s => round_away_from_zero(*v as f64 / 10f64.powi(-s)),
                };
                Ok(Some(scaled - refval))
            }
            Value::Float(v) => {
                let scaled = if scale >= 0 {
                    round_away_from_zero(v * 10f64.powi(scale))
                } else {
                    round_away_from_zero(v / 10f64.powi(-scale))
                };
                Ok(Some(scaled - refval))
            }
            Value::Bytes(_) => Err(Error::ProtocolViolation(
                "expected a numeric value, got a string".to_string(),
            )),
        }
    }

    fn int_transport(&self, value: &Value) -> Result<Option<i64>, Error> {
        match value {
            Value::Missing => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            Value::Float(v) if v.fract() == 0.0 => Ok(Some(*v as i64)),
            other => Err(Error::ProtocolViolation(format!(
                "expected an integer value, got {other:?}"
            ))),
        }
    }

    fn write_transport(&mut self, transport: Option<i64>, nbits: u32) -> Result<(), Error> {
        match transport {
            None => self.writer.write_uint(numeric_missing_value(nbits), nbits),
            Some(v) if v < 0 => Err(Error::ProtocolViolation(format!(
                "transport value {v} is below the reference value"
            ))),
            Some(v) => self.writer.write_uint(v as u64, nbits),
        }
    }

    /// The shared min/diff emission for numeric and code/flag fields.
    fn write_compressed(&mut self, transports: &[Option<i64>], nbits: u32) -> Result<(), Error> {
        let present: Vec<i64> = transports.iter().flatten().copied().collect();
        if present.is_empty() {
            self.writer.write_uint(numeric_missing_value(nbits), nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }
        let min = *present.iter().min().unwrap();
        let max = *present.iter().max().unwrap();
        if min < 0 {
            return Err(Error::ProtocolViolation(format!(
                "transport value {min} is below the reference value"
            )));
        }
        if present.len() == transports.len() && min == max {
            self.writer.write_uint(min as u64, nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }
        let nbits_diff = nbits_for_diff((max - min) as u64);
        self.writer.write_uint(min as u64, nbits)?;
        self.writer.write_uint(nbits_diff as u64, NBITS_FOR_NBITS_DIFF)?;
        for transport in transports {
            match transport {
                None => self
                    .writer
                    .write_uint(numeric_missing_value(nbits_diff), nbits_diff)?,
                Some(v) => self.writer.write_uint((v - min) as u64, nbits_diff)?,
            }
        }
        Ok(())
    }

    fn write_missing_bytes(&mut self, nbytes: usize) -> Result<(), Error> {
        for _ in 0..nbytes {
            self.writer.write_uint(0xff, NBITS_PER_BYTE)?;
        }
        Ok(())
    }
}

impl CoderOps for EncodeOps<'_> {
    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            let values = state.next_values_all_subsets()?;
            let all_missing = values.iter().all(Value::is_missing);
            let all_equal = values.iter().all(|v| v == &values[0]);
            if all_missing {
                self.write_missing_bytes(nbytes)?;
                self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            } else if all_equal {
                let Value::Bytes(bytes) = &values[0] else {
                    return Err(Error::ProtocolViolation(
                        "expected a string value".to_string(),
                    ));
                };
                self.writer.write_bytes(bytes, nbytes)?;
                self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            } else {
                // Differing strings ride on an all-zero minimum, one full
                // width field per subset.
                for _ in 0..nbytes {
                    self.writer.write_uint(0, NBITS_PER_BYTE)?;
                }
                self.writer.write_uint(nbytes as u64, NBITS_FOR_NBITS_DIFF)?;
                for value in &values {
                    match value {
                        Value::Missing => self.write_missing_bytes(nbytes)?,
                        Value::Bytes(bytes) => self.writer.write_bytes(bytes, nbytes)?,
                        other => {
                            return Err(Error::ProtocolViolation(format!(
                                "expected a string value, got {other:?}"
                            )));
                        }
                    }
                }
            }
        } else {
            match state.next_value()? {
                Value::Missing => self.write_missing_bytes(nbytes)?,
                Value::Bytes(bytes) => self.writer.write_bytes(&bytes, nbytes)?,
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "expected a string value, got {other:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            let values = state.next_values_all_subsets()?;
            let transports = values
                .iter()
                .map(|v| self.int_transport(v))
                .collect::<Result<Vec<_>, Error>>()?;
            self.write_compressed(&transports, nbits)
        } else {
            let value = state.next_value()?;
            let transport = self.int_transport(&value)?;
            self.write_transport(transport, nbits)
        }
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
            let values = state.next_values_all_subsets()?;
            let transports = values
                .iter()
                .map(|v| self.to_transport(v, scale, refval))
                .collect::<Result<Vec<_>, Error>>()?;
            self.write_compressed(&transports, nbits)
        } else {
            let value = state.next_value()?;
            let transport = self.to_transport(&value, scale, refval)?;
            self.write_transport(transport, nbits)
        }
    }

    fn process_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error> {
        let id = descriptor.id();
        state.push_descriptor(descriptor);
        let value = if state.is_compressed {
            let values = state.next_values_all_subsets()?;
            if !values.iter().all(|v| v == &values[0]) {
                return Err(Error::ProtocolViolation(
                    "new reference values must be identical for all subsets".to_string(),
                ));
            }
            values.into_iter().next().unwrap()
        } else {
            state.next_value()?
        };
        let Some(value) = value.as_int() else {
            return Err(Error::ProtocolViolation(format!(
                "new reference value for {id:06} cannot be missing"
            )));
        };
        // Sign-magnitude, unlike standard numerics.
        self.writer.write_int(value, nbits)?;
        if state.is_compressed {
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
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
        let id = descriptor.id();
        state.push_descriptor(descriptor);
        let check = |v: &Value| -> Result<(), Error> {
            if v.as_int() == Some(value) {
                Ok(())
            } else {
                Err(Error::ProtocolViolation(format!(
                    "value for {id:06} must be {value}, got {v:?}"
                )))
            }
        };
        if state.is_compressed {
            for v in state.next_values_all_subsets()? {
                check(&v)?;
            }
        } else {
            check(&state.next_value()?)?;
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
            state.next_values_all_subsets()?;
        } else {
            state.next_value()?;
        }
        Ok(())
    }

    fn bitmap_values(&self, state: &CoderState, n: usize) -> Result<Vec<i64>, Error> {
        let end = state.idx_value;
        if end < n {
            return Err(Error::ProtocolViolation(format!(
                "bitmap of {n} bits exceeds the {end} consumed values"
            )));
        }
        state.values()[end - n..end]
            .iter()
            .map(|value| {
                value.as_int().ok_or_else(|| {
                    Error::ProtocolViolation(format!("bitmap bit is not an integer: {value:?}"))
                })
            })
            .collect()
    }

    fn delayed_factor_index(&self, state: &CoderState) -> usize {
        state.idx_value - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_away_from_zero(2.5), 3);
        assert_eq!(round_away_from_zero(-2.5), -3);
        assert_eq!(round_away_from_zero(2.4), 2);
        assert_eq!(round_away_from_zero(-2.4), -2);
        assert_eq!(round_away_from_zero(0.0), 0);
    }

    #[test]
    fn test_nbits_for_diff() {
        // Smallest width whose all-ones sentinel exceeds the largest delta.
        assert_eq!(nbits_for_diff(0), 1);
        assert_eq!(nbits_for_diff(1), 1);
        assert_eq!(nbits_for_diff(2), 2);
        assert_eq!(nbits_for_diff(3), 3);
        assert_eq!(nbits_for_diff(6), 3);
        assert_eq!(nbits_for_diff(7), 4);
        for d in 1..=1000u64 {
            let w = nbits_for_diff(d);
            assert!(numeric_missing_value(w) > d, "sentinel collides at {d}");
            assert!(d < (1 << w));
        }
    }

    #[test]
    fn test_write_compressed_all_equal_and_all_missing() {
        use crate::bitops::BitReader;

        let mut writer = BitWriter::new();
        let mut ops = EncodeOps {
            writer: &mut writer,
        };
        ops.write_compressed(&[Some(100), Some(100), Some(100)], 8)
            .unwrap();
        ops.write_compressed(&[None, None, None], 8).unwrap();
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_uint(8).unwrap(), 100);
        assert_eq!(reader.read_uint(6).unwrap(), 0);
        assert_eq!(reader.read_uint(8).unwrap(), 0xff);
        assert_eq!(reader.read_uint(6).unwrap(), 0);
    }

    #[test]
    fn test_write_compressed_min_diff() {
        use crate::bitops::BitReader;

        let mut writer = BitWriter::new();
        let mut ops = EncodeOps {
            writer: &mut writer,
        };
        ops.write_compressed(&[Some(100), Some(102), None], 8).unwrap();
        let bytes = writer.to_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_uint(8).unwrap(), 100);
        assert_eq!(reader.read_uint(6).unwrap(), 2);
        assert_eq!(reader.read_uint(2).unwrap(), 0b00);
        assert_eq!(reader.read_uint(2).unwrap(), 0b10);
        assert_eq!(reader.read_uint(2).unwrap(), 0b11); // missing sentinel
    }
}
