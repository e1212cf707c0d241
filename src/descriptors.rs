//! BUFR descriptors and the template model.
//!
//! Descriptors are normally instantiated by the table group, which caches
//! one instance per unique ID. The synthetic kinds (associated fields,
//! skipped local descriptors, markers) are created by the coder while
//! walking a template.

use std::fmt;
use std::sync::Arc;

use crate::{UNITS_CODE_TABLE, UNITS_COMMON_CODE_TABLE_C1, UNITS_FLAG_TABLE, UNITS_STRING};

/// The F value (0..=3) of a 6-digit descriptor ID.
pub const fn f_of(id: u32) -> u32 {
    id / 100_000
}

/// The X value (class) of a 6-digit descriptor ID.
pub const fn x_of(id: u32) -> u32 {
    id / 1000 % 100
}

/// The Y value of a 6-digit descriptor ID.
pub const fn y_of(id: u32) -> u32 {
    id % 1000
}

/// Element descriptor 0XXYYY: a leaf carrying a value.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDescriptor {
    pub id: u32,
    pub name: String,
    pub unit: String,
    pub scale: i32,
    pub refval: i64,
    pub nbits: u32,
    pub crex_unit: String,
    pub crex_scale: i32,
    pub crex_nchars: i32,
}

impl ElementDescriptor {
    pub fn x(&self) -> u32 {
        x_of(self.id)
    }

    /// Character string elements take the byte-string decoding path.
    pub fn is_string(&self) -> bool {
        self.unit == UNITS_STRING
    }

    /// Code and flag table elements are plain unsigned transport values.
    pub fn is_codeflag(&self) -> bool {
        self.unit == UNITS_CODE_TABLE
            || self.unit == UNITS_FLAG_TABLE
            || self.unit == UNITS_COMMON_CODE_TABLE_C1
    }
}

impl fmt::Display for ElementDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.id)
    }
}

/// Fixed replication descriptor 1XXYYY with Y > 0.
#[derive(Debug, Clone)]
pub struct FixedReplication {
    pub id: u32,
    pub members: Vec<Descriptor>,
}

impl FixedReplication {
    /// Number of times to perform the replication, decoded from the ID.
    pub fn n_repeats(&self) -> u32 {
        y_of(self.id)
    }

    /// Number of directly following descriptors covered by the replication.
    pub fn n_items(&self) -> u32 {
        x_of(self.id)
    }
}

/// Delayed replication descriptor 1XX000. The repeat count is read at
/// runtime from the factor element.
#[derive(Debug, Clone)]
pub struct DelayedReplication {
    pub id: u32,
    pub members: Vec<Descriptor>,
    pub factor: Arc<ElementDescriptor>,
}

impl DelayedReplication {
    pub fn n_items(&self) -> u32 {
        x_of(self.id)
    }
}

/// Sequence descriptor 3XXYYY, inlined at walk time.
#[derive(Debug, Clone)]
pub struct SequenceDescriptor {
    pub id: u32,
    pub name: String,
    pub members: Vec<Descriptor>,
}

/// A BUFR descriptor of any kind.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Element(Arc<ElementDescriptor>),
    FixedReplication(FixedReplication),
    DelayedReplication(DelayedReplication),
    /// Operator descriptor 2XXYYY; carries no stored value.
    Operator(u32),
    Sequence(Arc<SequenceDescriptor>),
    /// Placeholder for an ID with no table entry. Tolerated at table-load
    /// time, fatal if it reaches the template walker.
    Undefined(u32),
}

impl Descriptor {
    pub fn id(&self) -> u32 {
        match self {
            Descriptor::Element(ed) => ed.id,
            Descriptor::FixedReplication(r) => r.id,
            Descriptor::DelayedReplication(r) => r.id,
            Descriptor::Operator(id) => *id,
            Descriptor::Sequence(s) => s.id,
            Descriptor::Undefined(id) => *id,
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Undefined(id) => write!(f, "UNDEFINED ({:06})", id),
            _ => write!(f, "{:06}", self.id()),
        }
    }
}

/// The operator code of a 2XXYYY descriptor ID, e.g. 201 for 201YYY.
pub(crate) fn operator_code(id: u32) -> u32 {
    id / 1000
}

/// The operand (Y) of an operator descriptor ID.
pub(crate) fn operand_value(id: u32) -> u32 {
    id % 1000
}

/// An element clone tagged with the marker operator that produced it.
/// Marker 225255 carries difference statistics with a sign bit: the
/// reference becomes `-2^nbits` and the width grows by one.
#[derive(Debug, Clone)]
pub struct MarkerDescriptor {
    pub element: Arc<ElementDescriptor>,
    pub marker_id: u32,
    pub scale: i32,
    pub refval: i64,
    pub nbits: u32,
}

impl MarkerDescriptor {
    pub fn from_element(element: &Arc<ElementDescriptor>, marker_id: u32) -> Self {
        let (refval, nbits) = if marker_id == 225_255 {
            (-(1i64 << element.nbits), element.nbits + 1)
        } else {
            (element.refval, element.nbits)
        };
        Self {
            element: element.clone(),
            marker_id,
            scale: element.scale,
            refval,
            nbits,
        }
    }
}

impl fmt::Display for MarkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.marker_id {
            223_255 => 'T',
            224_255 => 'F',
            225_255 => 'D',
            232_255 => 'R',
            _ => 'M',
        };
        write!(f, "{}{:05}", prefix, self.element.id)
    }
}

/// One entry of a per-subset decoded descriptor list, aligned 1-to-1 with
/// the decoded value list.
#[derive(Debug, Clone)]
pub enum DecodedDescriptor {
    Element(Arc<ElementDescriptor>),
    /// Extra field emitted before an element while a 204 modifier is active.
    Associated { id: u32, nbits: u32 },
    /// Local descriptor replaced by a fixed-width field via operator 206.
    SkippedLocal { id: u32, nbits: u32 },
    Marker(MarkerDescriptor),
    /// An operator that emits an in-stream or constant value, e.g. 205YYY
    /// or the zero constant of 222000.
    Operator(u32),
    /// An element suppressed by operator 221; carries no transmitted value.
    NotPresent(Arc<ElementDescriptor>),
}

impl DecodedDescriptor {
    pub fn id(&self) -> u32 {
        match self {
            DecodedDescriptor::Element(ed) => ed.id,
            DecodedDescriptor::Associated { id, .. } => *id,
            DecodedDescriptor::SkippedLocal { id, .. } => *id,
            DecodedDescriptor::Marker(md) => md.element.id,
            DecodedDescriptor::Operator(id) => *id,
            DecodedDescriptor::NotPresent(ed) => ed.id,
        }
    }

    /// The transport width used for the missing-value re-check of
    /// compressed code/flag fields.
    pub fn base_nbits(&self) -> Option<u32> {
        match self {
            DecodedDescriptor::Element(ed) => Some(ed.nbits),
            DecodedDescriptor::Associated { nbits, .. } => Some(*nbits),
            DecodedDescriptor::SkippedLocal { nbits, .. } => Some(*nbits),
            DecodedDescriptor::Marker(md) => Some(md.nbits),
            _ => None,
        }
    }
}

impl fmt::Display for DecodedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedDescriptor::Element(ed) => write!(f, "{:06}", ed.id),
            DecodedDescriptor::Associated { id, .. } => write!(f, "A{:05}", id),
            DecodedDescriptor::SkippedLocal { id, .. } => write!(f, "S{:05}", id),
            DecodedDescriptor::Marker(md) => write!(f, "{md}"),
            DecodedDescriptor::Operator(id) => write!(f, "{:06}", id),
            DecodedDescriptor::NotPresent(ed) => write!(f, "N{:05}", ed.id),
        }
    }
}

/// The root sequence of descriptors governing one message's data section.
/// The unexpanded ID list is retained because it is needed at re-encode.
#[derive(Debug, Clone)]
pub struct BufrTemplate {
    pub members: Vec<Descriptor>,
    pub original_ids: Vec<u32>,
}

impl BufrTemplate {
    pub fn new(members: Vec<Descriptor>, original_ids: Vec<u32>) -> Self {
        Self {
            members,
            original_ids,
        }
    }

    /// Flatten the template back into the list of IDs that instantiates it.
    pub fn original_descriptor_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        flatten_ids(&self.members, &mut ids);
        ids
    }
}

fn flatten_ids(members: &[Descriptor], out: &mut Vec<u32>) {
    for member in members {
        out.push(member.id());
        match member {
            Descriptor::FixedReplication(r) => flatten_ids(&r.members, out),
            Descriptor::DelayedReplication(r) => {
                out.push(r.factor.id);
                flatten_ids(&r.members, out);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: u32, unit: &str, nbits: u32) -> Arc<ElementDescriptor> {
        Arc::new(ElementDescriptor {
            id,
            name: String::new(),
            unit: unit.to_string(),
            scale: 0,
            refval: 0,
            nbits,
            crex_unit: String::new(),
            crex_scale: 0,
            crex_nchars: 0,
        })
    }

    #[test]
    fn test_id_decomposition() {
        assert_eq!(f_of(105_002), 1);
        assert_eq!(x_of(105_002), 5);
        assert_eq!(y_of(105_002), 2);
        assert_eq!(operator_code(207_003), 207);
        assert_eq!(operand_value(207_003), 3);
    }

    #[test]
    fn test_unit_dispatch() {
        assert!(element(1015, "CCITT IA5", 160).is_string());
        assert!(element(20011, "CODE TABLE", 4).is_codeflag());
        assert!(element(2002, "FLAG TABLE", 4).is_codeflag());
        assert!(!element(12001, "K", 12).is_codeflag());
    }

    #[test]
    fn test_marker_difference_statistics() {
        let ed = element(12001, "K", 12);
        let md = MarkerDescriptor::from_element(&ed, 225_255);
        assert_eq!(md.nbits, 13);
        assert_eq!(md.refval, -(1 << 12));
        let md = MarkerDescriptor::from_element(&ed, 224_255);
        assert_eq!(md.nbits, 12);
        assert_eq!(md.refval, 0);
    }

    #[test]
    fn test_original_descriptor_ids() {
        let members = vec![
            Descriptor::FixedReplication(FixedReplication {
                id: 102_002,
                members: vec![
                    Descriptor::Element(element(12001, "K", 12)),
                    Descriptor::DelayedReplication(DelayedReplication {
                        id: 101_000,
                        members: vec![Descriptor::Element(element(20011, "CODE TABLE", 4))],
                        factor: element(31001, "Numeric", 8),
                    }),
                ],
            }),
            Descriptor::Operator(201_132),
        ];
        let template = BufrTemplate::new(members, vec![]);
        assert_eq!(
            template.original_descriptor_ids(),
            vec![102_002, 12001, 101_000, 31001, 20011, 201_132]
        );
    }
}
