//! Per-section parameter schemas and the decoded section model.
//!
//! Each BUFR section is described by a static list of parameter
//! descriptors: name, bit width, data kind, an optional expected value and
//! whether the decoded value is hoisted onto the message. A width of zero
//! means "the remainder of the section". The same schemas drive both the
//! decoder and the encoder.

use std::sync::Arc;

use crate::message::TemplateData;

/// How a section parameter is read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Uint,
    Int,
    Bool,
    Bytes,
    Bin,
    /// The packed descriptor list of section 3, two bytes per descriptor.
    UnexpandedDescriptors,
    /// The bit-packed template data of section 4.
    TemplateData,
}

/// An expected value asserted on decode unless suppressed by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Bytes(&'static [u8]),
    Uint(u64),
}

/// Static description of one section parameter.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub nbits: u32,
    pub kind: ParamKind,
    pub expected: Option<Expected>,
    pub as_property: bool,
}

const fn param(name: &'static str, nbits: u32, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        nbits,
        kind,
        expected: None,
        as_property: false,
    }
}

const fn property(name: &'static str, nbits: u32, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name,
        nbits,
        kind,
        expected: None,
        as_property: true,
    }
}

/// Static description of one section.
#[derive(Debug, Clone, Copy)]
pub struct SectionSchema {
    pub index: u8,
    pub description: &'static str,
    pub optional: bool,
    pub end_of_message: bool,
    pub params: &'static [ParamSpec],
}

static SECTION0: SectionSchema = SectionSchema {
    index: 0,
    description: "Indicator section",
    optional: false,
    end_of_message: false,
    params: &[
        ParamSpec {
            name: "start_signature",
            nbits: 32,
            kind: ParamKind::Bytes,
            expected: Some(Expected::Bytes(b"BUFR")),
            as_property: false,
        },
        property("length", 24, ParamKind::Uint),
        property("edition", 8, ParamKind::Uint),
    ],
};

static SECTION1_V3: SectionSchema = SectionSchema {
    index: 1,
    description: "Identification section",
    optional: false,
    end_of_message: false,
    params: &[
        param("section_length", 24, ParamKind::Uint),
        property("master_table_number", 8, ParamKind::Uint),
        property("originating_subcentre", 8, ParamKind::Uint),
        property("originating_centre", 8, ParamKind::Uint),
        param("update_sequence_number", 8, ParamKind::Uint),
        property("is_section2_presents", 1, ParamKind::Bool),
        param("flag_bits", 7, ParamKind::Bin),
        param("data_category", 8, ParamKind::Uint),
        param("data_sub_category", 8, ParamKind::Uint),
        property("master_table_version", 8, ParamKind::Uint),
        property("local_table_version", 8, ParamKind::Uint),
        property("year", 8, ParamKind::Uint),
        property("month", 8, ParamKind::Uint),
        property("day", 8, ParamKind::Uint),
        property("hour", 8, ParamKind::Uint),
        property("minute", 8, ParamKind::Uint),
    ],
};

static SECTION1_V4: SectionSchema = SectionSchema {
    index: 1,
    description: "Identification section",
    optional: false,
    end_of_message: false,
    params: &[
        param("section_length", 24, ParamKind::Uint),
        property("master_table_number", 8, ParamKind::Uint),
        property("originating_centre", 16, ParamKind::Uint),
        property("originating_subcentre", 16, ParamKind::Uint),
        param("update_sequence_number", 8, ParamKind::Uint),
        property("is_section2_presents", 1, ParamKind::Bool),
        param("flag_bits", 7, ParamKind::Bin),
        param("data_category", 8, ParamKind::Uint),
        param("international_data_sub_category", 8, ParamKind::Uint),
        param("local_data_sub_category", 8, ParamKind::Uint),
        property("master_table_version", 8, ParamKind::Uint),
        property("local_table_version", 8, ParamKind::Uint),
        property("year", 16, ParamKind::Uint),
        property("month", 8, ParamKind::Uint),
        property("day", 8, ParamKind::Uint),
        property("hour", 8, ParamKind::Uint),
        property("minute", 8, ParamKind::Uint),
        property("second", 8, ParamKind::Uint),
    ],
};

static SECTION2: SectionSchema = SectionSchema {
    index: 2,
    description: "Optional section",
    optional: true,
    end_of_message: false,
    params: &[
        param("section_length", 24, ParamKind::Uint),
        param("reserved_bits", 8, ParamKind::Bin),
        param("data", 0, ParamKind::Bytes),
    ],
};

static SECTION3: SectionSchema = SectionSchema {
    index: 3,
    description: "Data description section",
    optional: false,
    end_of_message: false,
    params: &[
        param("section_length", 24, ParamKind::Uint),
        param("reserved_bits", 8, ParamKind::Bin),
        property("n_subsets", 16, ParamKind::Uint),
        property("is_observation", 1, ParamKind::Bool),
        property("is_compressed", 1, ParamKind::Bool),
        param("flag_bits", 6, ParamKind::Bin),
        property("unexpanded_descriptors", 0, ParamKind::UnexpandedDescriptors),
    ],
};

static SECTION4: SectionSchema = SectionSchema {
    index: 4,
    description: "Data section",
    optional: false,
    end_of_message: false,
    params: &[
        param("section_length", 24, ParamKind::Uint),
        param("reserved_bits", 8, ParamKind::Bin),
        property("template_data", 0, ParamKind::TemplateData),
    ],
};

static SECTION5: SectionSchema = SectionSchema {
    index: 5,
    description: "End section",
    optional: false,
    end_of_message: true,
    params: &[ParamSpec {
        name: "stop_signature",
        nbits: 32,
        kind: ParamKind::Bytes,
        expected: Some(Expected::Bytes(b"7777")),
        as_property: false,
    }],
};

/// The schema for a section, selected by the already-decoded edition.
pub(crate) fn schema_for_section(index: u8, edition: u64) -> &'static SectionSchema {
    match index {
        0 => &SECTION0,
        1 if edition <= 3 => &SECTION1_V3,
        1 => &SECTION1_V4,
        2 => &SECTION2,
        3 => &SECTION3,
        4 => &SECTION4,
        _ => &SECTION5,
    }
}

/// A decoded or encoded parameter value.
#[derive(Debug, Clone)]
pub enum ParameterValue {
    Uint(u64),
    Int(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Raw bits as a '0'/'1' string, preserving leading zeros.
    Bin(String),
    UnexpandedDescriptors(Vec<u32>),
    TemplateData(Arc<TemplateData>),
}

impl ParameterValue {
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            ParameterValue::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// A section parameter together with its decoded value.
#[derive(Debug, Clone)]
pub struct SectionParameter {
    pub spec: &'static ParamSpec,
    pub value: ParameterValue,
}

/// One section of a BUFR message: an ordered list of named parameters.
#[derive(Debug, Clone)]
pub struct BufrSection {
    pub schema: &'static SectionSchema,
    pub parameters: Vec<SectionParameter>,
}

impl BufrSection {
    pub(crate) fn new(schema: &'static SectionSchema) -> Self {
        Self {
            schema,
            parameters: Vec::with_capacity(schema.params.len()),
        }
    }

    pub fn index(&self) -> u8 {
        self.schema.index
    }

    /// The value of the named parameter, if present.
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|p| p.spec.name == name)
            .map(|p| &p.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_selection_by_edition() {
        assert_eq!(schema_for_section(1, 3).params.len(), 16);
        assert_eq!(schema_for_section(1, 4).params.len(), 18);
        assert_eq!(schema_for_section(1, 2).params.len(), 16);
        assert!(schema_for_section(2, 4).optional);
        assert!(schema_for_section(5, 4).end_of_message);
    }

    #[test]
    fn test_section1_v4_is_22_bytes() {
        let nbits: u32 = schema_for_section(1, 4)
            .params
            .iter()
            .map(|p| p.nbits)
            .sum();
        assert_eq!(nbits, 22 * 8);
        let nbits: u32 = schema_for_section(1, 3)
            .params
            .iter()
            .map(|p| p.nbits)
            .sum();
        assert_eq!(nbits, 17 * 8);
    }
}
