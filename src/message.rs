//! The BUFR message model: an ordered collection of decoded sections with
//! selected parameters hoisted into message-level properties so later
//! sections can refer to them.

use std::sync::Arc;

use hashbrown::HashMap;
use serde_json::{Value as Json, json};

use crate::descriptors::{BufrTemplate, DecodedDescriptor};
use crate::sections::{BufrSection, ParamKind, ParameterValue};
use crate::tables::TableGroupKey;
use crate::{Error, Value};

/// Everything the template walker produced for section 4: the template
/// itself plus the per-subset descriptor, value and bitmap-link vectors.
///
/// For compressed data every subset shares the identical expanded
/// descriptor sequence, so all entries of
/// `decoded_descriptors_all_subsets` point at the same vector.
#[derive(Debug, Clone)]
pub struct TemplateData {
    pub template: BufrTemplate,
    pub is_compressed: bool,
    pub n_subsets: usize,
    pub decoded_descriptors_all_subsets: Vec<Arc<Vec<DecodedDescriptor>>>,
    pub decoded_values_all_subsets: Vec<Vec<Value>>,
    pub bitmap_links_all_subsets: Vec<Arc<HashMap<usize, usize>>>,
}

/// A single BUFR message comprised of its sections.
///
/// Properties of this struct are hoisted from parameters of the sections
/// as they are processed, so that sections stay loosely coupled: a later
/// section refers to `n_subsets` or `edition` without knowing where the
/// value came from.
#[derive(Debug, Default)]
pub struct BufrMessage {
    pub sections: Vec<BufrSection>,

    pub length: Option<u64>,
    pub edition: Option<u64>,
    pub master_table_number: Option<u64>,
    pub originating_centre: Option<u64>,
    pub originating_subcentre: Option<u64>,
    pub master_table_version: Option<u64>,
    pub local_table_version: Option<u64>,
    pub year: Option<u64>,
    pub month: Option<u64>,
    pub day: Option<u64>,
    pub hour: Option<u64>,
    pub minute: Option<u64>,
    pub second: Option<u64>,
    pub is_section2_presents: Option<bool>,
    pub n_subsets: Option<u64>,
    pub is_observation: Option<bool>,
    pub is_compressed: Option<bool>,
    pub unexpanded_descriptors: Option<Vec<u32>>,
    pub template_data: Option<Arc<TemplateData>>,

    /// Key of the table group the template was built against.
    pub table_group_key: Option<TableGroupKey>,
    /// The wire form, available after encoding.
    pub serialized_bytes: Option<Vec<u8>>,
}

impl BufrMessage {
    /// Record a parameter marked `as_property` under its name.
    pub(crate) fn set_property(&mut self, name: &str, value: &ParameterValue) {
        match (name, value) {
            ("length", ParameterValue::Uint(v)) => self.length = Some(*v),
            ("edition", ParameterValue::Uint(v)) => self.edition = Some(*v),
            ("master_table_number", ParameterValue::Uint(v)) => {
                self.master_table_number = Some(*v)
            }
            ("originating_centre", ParameterValue::Uint(v)) => self.originating_centre = Some(*v),
            ("originating_subcentre", ParameterValue::Uint(v)) => {
                self.originating_subcentre = Some(*v)
            }
            ("master_table_version", ParameterValue::Uint(v)) => {
                self.master_table_version = Some(*v)
            }
            ("local_table_version", ParameterValue::Uint(v)) => self.local_table_version = Some(*v),
            ("year", ParameterValue::Uint(v)) => self.year = Some(*v),
            ("month", ParameterValue::Uint(v)) => self.month = Some(*v),
            ("day", ParameterValue::Uint(v)) => self.day = Some(*v),
            ("hour", ParameterValue::Uint(v)) => self.hour = Some(*v),
            ("minute", ParameterValue::Uint(v)) => self.minute = Some(*v),
            ("second", ParameterValue::Uint(v)) => self.second = Some(*v),
            ("is_section2_presents", ParameterValue::Bool(v)) => {
                self.is_section2_presents = Some(*v)
            }
            ("n_subsets", ParameterValue::Uint(v)) => self.n_subsets = Some(*v),
            ("is_observation", ParameterValue::Bool(v)) => self.is_observation = Some(*v),
            ("is_compressed", ParameterValue::Bool(v)) => self.is_compressed = Some(*v),
            ("unexpanded_descriptors", ParameterValue::UnexpandedDescriptors(ids)) => {
                self.unexpanded_descriptors = Some(ids.clone())
            }
            ("template_data", ParameterValue::TemplateData(td)) => {
                self.template_data = Some(td.clone())
            }
            _ => {}
        }
    }

    /// The edition, defaulting to 4 before section 0 has been processed.
    pub fn edition_or_default(&self) -> u64 {
        self.edition.unwrap_or(4)
    }

    pub fn n_subsets_or_zero(&self) -> usize {
        self.n_subsets.unwrap_or(0) as usize
    }

    pub fn is_compressed_or_false(&self) -> bool {
        self.is_compressed.unwrap_or(false)
    }

    /// Project the message onto the encoder's values-tree, keeping only
    /// the given subsets. `n_subsets` is rewritten accordingly; passing
    /// every index yields the identity projection.
    pub fn subset(&self, subset_indices: &[usize]) -> Result<Json, Error> {
        let n_subsets = self.n_subsets_or_zero();
        if subset_indices.is_empty() {
            return Err(Error::ProtocolViolation(
                "no subset indices given".to_string(),
            ));
        }
        if let Some(max) = subset_indices.iter().max() {
            if *max >= n_subsets {
                return Err(Error::ProtocolViolation(format!(
                    "subset index {max} out of range for {n_subsets} subsets"
                )));
            }
        }

        let mut sections_json = Vec::new();
        for section in &self.sections {
            let mut section_json = Vec::new();
            for parameter in &section.parameters {
                let value = match (&parameter.spec.kind, &parameter.value) {
                    (ParamKind::TemplateData, ParameterValue::TemplateData(td)) => {
                        let subsets: Vec<Json> = subset_indices
                            .iter()
                            .map(|&i| {
                                Json::Array(
                                    td.decoded_values_all_subsets[i]
                                        .iter()
                                        .map(value_to_json)
                                        .collect(),
                                )
                            })
                            .collect();
                        Json::Array(subsets)
                    }
                    _ if parameter.spec.name == "n_subsets" => {
                        json!(subset_indices.len())
                    }
                    (_, value) => parameter_to_json(value),
                };
                section_json.push(value);
            }
            sections_json.push(Json::Array(section_json));
        }
        Ok(Json::Array(sections_json))
    }
}

/// Render one decoded value as JSON. Strings map through latin-1 so that
/// arbitrary octets survive the round trip.
pub(crate) fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Missing => Json::Null,
        Value::Int(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Bytes(b) => Json::String(latin1_to_string(b)),
    }
}

pub(crate) fn parameter_to_json(value: &ParameterValue) -> Json {
    match value {
        ParameterValue::Uint(v) => json!(v),
        ParameterValue::Int(v) => json!(v),
        ParameterValue::Bool(v) => json!(v),
        ParameterValue::Bytes(b) => Json::String(latin1_to_string(b)),
        ParameterValue::Bin(bits) => Json::String(bits.clone()),
        ParameterValue::UnexpandedDescriptors(ids) => {
            Json::Array(ids.iter().map(|id| json!(id)).collect())
        }
        ParameterValue::TemplateData(_) => Json::Null,
    }
}

pub(crate) fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub(crate) fn string_to_latin1(s: &str) -> Result<Vec<u8>, Error> {
    s.chars()
        .map(|ch| {
            let code = ch as u32;
            if code < 256 {
                Ok(code as u8)
            } else {
                Err(Error::ProtocolViolation(format!(
                    "character {ch:?} is not representable in a BUFR string"
                )))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_roundtrip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let s = latin1_to_string(&bytes);
        assert_eq!(string_to_latin1(&s).unwrap(), bytes);
        assert!(string_to_latin1("\u{0394}").is_err());
    }

    #[test]
    fn test_value_to_json() {
        assert_eq!(value_to_json(&Value::Missing), Json::Null);
        assert_eq!(value_to_json(&Value::Int(5)), json!(5));
        assert_eq!(value_to_json(&Value::Bytes(b"OK".to_vec())), json!("OK"));
    }
}
