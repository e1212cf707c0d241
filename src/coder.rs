//! The coder state machine shared by the decoder and the encoder.
//!
//! A single recursive walker drives both directions over a template. The
//! direction-specific work (reading or writing bits, where values come
//! from) sits behind the [`CoderOps`] seam; everything else - operator
//! modifiers, replication, bitmaps, markers - lives here.

use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::descriptors::{
    DecodedDescriptor, DelayedReplication, Descriptor, ElementDescriptor, MarkerDescriptor,
    operand_value, operator_code,
};
use crate::message::TemplateData;
use crate::{BufrTemplate, Error, Value};

/// Stage of the bitmap definition state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitmapPhase {
    #[default]
    Na,
    /// Directly after 222000, 223000 etc.
    Indicator,
    WaitingForBit,
    /// Consuming consecutive 031031 descriptors.
    BitCounting,
}

/// Status of the "QA info follows" handling started by 222000.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QaInfoStatus {
    #[default]
    Na,
    Waiting,
    Processing,
}

/// The `(nbits, scale, reference value)` modifier installed by 207 YYY.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BsrModifier {
    pub nbits_increment: i32,
    pub scale_increment: i32,
    pub refval_factor: i64,
}

impl Default for BsrModifier {
    fn default() -> Self {
        Self {
            nbits_increment: 0,
            scale_increment: 0,
            refval_factor: 1,
        }
    }
}

/// Per-message mutable state of one coding run. A fresh state is created
/// for every message so a single coder can run any number of them.
pub struct CoderState {
    pub is_compressed: bool,
    pub n_subsets: usize,
    pub idx_subset: usize,
    /// Write cursor into the current subset's value list; encoder only.
    pub idx_value: usize,

    /// One list for compressed data (each subset decodes to the identical
    /// descriptor sequence), one per subset otherwise.
    descriptors_all: Vec<Vec<DecodedDescriptor>>,
    /// Decoded (or to-be-encoded) values, always one list per subset.
    pub values_all: Vec<Vec<Value>>,
    /// Maps the index of an attribute descriptor (QA info, statistics) to
    /// the index of the descriptor it is attached to.
    bitmap_links_all: Vec<HashMap<usize, usize>>,

    pub nbits_offset: i32,                         // 201
    pub scale_offset: i32,                         // 202
    pub nbits_of_new_refval: u32,                  // 203; 203255 concludes
    pub new_refvals: HashMap<u32, i64>,
    pub nbits_of_associated: SmallVec<[u32; 4]>,   // 204, nested
    pub nbits_of_skipped_local: u32,               // 206, next descriptor only
    pub bsr_modifier: BsrModifier,                 // 207
    pub new_nbytes: usize,                         // 208
    pub data_not_present_count: u32,               // 221
    pub qa_info_status: QaInfoStatus,              // 222

    pub bitmap_phase: BitmapPhase,
    pub most_recent_bitmap_is_for_reuse: bool,
    pub n_031031: usize,
    /// The most recent bitmap defined for reuse, if any.
    pub bitmap: Option<Vec<i64>>,
    /// Index at which the backward search for bitmapped descriptors
    /// starts; set by 222000-style operators, cleared by 235000.
    pub back_reference_boundary: usize,
    back_referenced_descriptors: Option<Vec<(usize, Arc<ElementDescriptor>)>>,
    bitmapped_descriptors: Vec<(usize, Arc<ElementDescriptor>)>,
    next_bitmapped: usize,
}

impl CoderState {
    /// `values_all_subsets` is provided by the encoder; the decoder starts
    /// from empty value lists.
    pub fn new(
        is_compressed: bool,
        n_subsets: usize,
        values_all_subsets: Option<Vec<Vec<Value>>>,
    ) -> Self {
        let n_descriptor_lists = if is_compressed { 1 } else { n_subsets };
        Self {
            is_compressed,
            n_subsets,
            idx_subset: 0,
            idx_value: 0,
            descriptors_all: vec![Vec::new(); n_descriptor_lists],
            values_all: values_all_subsets.unwrap_or_else(|| vec![Vec::new(); n_subsets]),
            bitmap_links_all: vec![HashMap::new(); n_descriptor_lists],
            nbits_offset: 0,
            scale_offset: 0,
            nbits_of_new_refval: 0,
            new_refvals: HashMap::new(),
            nbits_of_associated: SmallVec::new(),
            nbits_of_skipped_local: 0,
            bsr_modifier: BsrModifier::default(),
            new_nbytes: 0,
            data_not_present_count: 0,
            qa_info_status: QaInfoStatus::Na,
            bitmap_phase: BitmapPhase::Na,
            most_recent_bitmap_is_for_reuse: false,
            n_031031: 0,
            bitmap: None,
            back_reference_boundary: 0,
            back_referenced_descriptors: None,
            bitmapped_descriptors: Vec::new(),
            next_bitmapped: 0,
        }
    }

    fn cur(&self) -> usize {
        if self.is_compressed { 0 } else { self.idx_subset }
    }

    /// Rebind the per-subset vectors; uncompressed data only. Reference
    /// values defined in a previous subset must not leak into this one.
    pub fn switch_subset_context(&mut self, idx_subset: usize) {
        self.idx_subset = idx_subset;
        self.new_refvals.clear();
        self.idx_value = 0;
    }

    pub fn descriptors(&self) -> &[DecodedDescriptor] {
        &self.descriptors_all[self.cur()]
    }

    pub fn descriptors_len(&self) -> usize {
        self.descriptors_all[self.cur()].len()
    }

    pub fn push_descriptor(&mut self, descriptor: DecodedDescriptor) {
        let cur = self.cur();
        self.descriptors_all[cur].push(descriptor);
    }

    /// Append a value to the current subset.
    pub fn push_value(&mut self, value: Value) {
        let cur = self.idx_subset;
        self.values_all[cur].push(value);
    }

    /// Append the same value to every subset; compressed data only.
    pub fn push_value_all_subsets(&mut self, value: Value) {
        for values in &mut self.values_all {
            values.push(value.clone());
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values_all[if self.is_compressed { 0 } else { self.idx_subset }]
    }

    /// Consume the next input value of the current subset; encoder only.
    pub fn next_value(&mut self) -> Result<Value, Error> {
        let value = self
            .values_all
            .get(self.idx_subset)
            .and_then(|values| values.get(self.idx_value))
            .cloned()
            .ok_or_else(|| {
                Error::ProtocolViolation(format!(
                    "no value at index {} of subset {}",
                    self.idx_value, self.idx_subset
                ))
            })?;
        self.idx_value += 1;
        Ok(value)
    }

    /// Consume the next input value of every subset; compressed encoding.
    pub fn next_values_all_subsets(&mut self) -> Result<Vec<Value>, Error> {
        let idx = self.idx_value;
        let values = self
            .values_all
            .iter()
            .enumerate()
            .map(|(s, values)| {
                values.get(idx).cloned().ok_or_else(|| {
                    Error::ProtocolViolation(format!("no value at index {idx} of subset {s}"))
                })
            })
            .collect::<Result<Vec<Value>, Error>>()?;
        self.idx_value += 1;
        Ok(values)
    }

    /// The delayed replication factor recorded at the given value index.
    /// For compressed data the factor must agree across every subset.
    pub fn delayed_replication_factor_at(&self, idx: usize) -> Result<i64, Error> {
        if self.is_compressed {
            let mut seen: Option<i64> = None;
            for values in &self.values_all {
                if let Some(v) = values[idx].as_int() {
                    if let Some(prev) = seen {
                        if prev != v {
                            return Err(Error::ProtocolViolation(
                                "delayed replication factors differ across subsets".to_string(),
                            ));
                        }
                    }
                    seen = Some(v);
                }
            }
        }
        let value = &self.values_all[self.cur()][idx];
        match value {
            Value::Int(v) if *v >= 0 => Ok(*v),
            other => Err(Error::ProtocolViolation(format!(
                "delayed replication factor must be >= 0: got {other:?}"
            ))),
        }
    }

    pub fn mark_back_reference_boundary(&mut self) {
        self.back_reference_boundary = self.descriptors_len();
    }

    /// Build the bitmapped descriptor list for the given bitmap, first
    /// collecting the back-referenced element descriptors when they are
    /// not already defined. The type has to be an exact element, not a
    /// marker or associated field.
    pub fn build_bitmapped_descriptors(&mut self, bitmap: Vec<i64>) -> Result<(), Error> {
        if self.back_referenced_descriptors.is_none() {
            let descriptors = &self.descriptors_all[self.cur()];
            let mut back = Vec::new();
            for idx in (0..self.back_reference_boundary).rev() {
                if let DecodedDescriptor::Element(ed) = &descriptors[idx] {
                    back.push((idx, ed.clone()));
                    if back.len() == bitmap.len() {
                        break;
                    }
                }
            }
            back.reverse();
            self.back_referenced_descriptors = Some(back);
        }
        let back = self.back_referenced_descriptors.as_ref().unwrap();
        if back.len() != bitmap.len() {
            return Err(Error::ProtocolViolation(
                "back referenced descriptors not matching defined bitmap".to_string(),
            ));
        }
        self.bitmapped_descriptors = bitmap
            .iter()
            .zip(back.iter())
            .filter(|(bit, _)| **bit == 0)
            .map(|(_, entry)| entry.clone())
            .collect();
        self.next_bitmapped = 0;
        Ok(())
    }

    /// The next back-referenced descriptor whose bitmap bit was zero.
    pub fn next_bitmapped_descriptor(&mut self) -> Result<(usize, Arc<ElementDescriptor>), Error> {
        let entry = self
            .bitmapped_descriptors
            .get(self.next_bitmapped)
            .cloned()
            .ok_or_else(|| {
                Error::ProtocolViolation("no bitmapped descriptor left to attach".to_string())
            })?;
        self.next_bitmapped += 1;
        Ok(entry)
    }

    /// Link the descriptor about to be appended to a back-referenced one.
    /// Must be called before the descriptor is processed.
    pub fn add_bitmap_link(&mut self) -> Result<(), Error> {
        let (idx_descriptor, _) = self.next_bitmapped_descriptor()?;
        self.insert_bitmap_link(idx_descriptor);
        Ok(())
    }

    pub(crate) fn insert_bitmap_link(&mut self, idx_descriptor: usize) {
        let cur = self.cur();
        let at = self.descriptors_all[cur].len();
        self.bitmap_links_all[cur].insert(at, idx_descriptor);
    }

    /// Rewind the bitmapped descriptor iterator; operator 237000.
    pub fn recall_bitmap(&mut self) {
        self.next_bitmapped = 0;
    }

    /// Drop the reusable bitmap; operator 237255.
    pub fn cancel_bitmap(&mut self) {
        self.bitmap = None;
    }

    /// Clear all back-reference state; operator 235000.
    pub fn cancel_all_back_references(&mut self) {
        self.back_referenced_descriptors = None;
        self.bitmap = None;
        self.bitmapped_descriptors.clear();
        self.next_bitmapped = 0;
        self.back_reference_boundary = 0;
    }

    pub fn bitmap_links(&self) -> &HashMap<usize, usize> {
        &self.bitmap_links_all[self.cur()]
    }

    pub fn into_template_data(self, template: BufrTemplate) -> TemplateData {
        let n_subsets = self.n_subsets;
        let (descriptors, links) = if self.is_compressed {
            let descriptors = Arc::new(self.descriptors_all.into_iter().next().unwrap_or_default());
            let links = Arc::new(self.bitmap_links_all.into_iter().next().unwrap_or_default());
            (vec![descriptors; n_subsets], vec![links; n_subsets])
        } else {
            (
                self.descriptors_all.into_iter().map(Arc::new).collect(),
                self.bitmap_links_all.into_iter().map(Arc::new).collect(),
            )
        };
        TemplateData {
            template,
            is_compressed: self.is_compressed,
            n_subsets,
            decoded_descriptors_all_subsets: descriptors,
            decoded_values_all_subsets: self.values_all,
            bitmap_links_all_subsets: links,
        }
    }
}

/// The direction-specific operations of one coding run. The walker calls
/// these; the decoder reads bits and appends values, the encoder consumes
/// values and writes bits.
pub(crate) trait CoderOps {
    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), Error>;

    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error>;

    fn process_numeric(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
        scale: i32,
        refval: i64,
    ) -> Result<(), Error>;

    /// Sign-magnitude reference value definition under operator 203.
    fn process_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
    ) -> Result<(), Error>;

    /// A constant with no bit operations, e.g. the zero of 222000.
    fn process_constant(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        value: i64,
    ) -> Result<(), Error>;

    /// A descriptor suppressed by operator 221; no transmitted value.
    fn process_not_present(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
    ) -> Result<(), Error>;

    /// The last `n` values of the bitmap being defined, as bits.
    fn bitmap_values(&self, state: &CoderState, n: usize) -> Result<Vec<i64>, Error>;

    /// Value index of the delayed replication factor just processed.
    fn delayed_factor_index(&self, state: &CoderState) -> usize;

    /// A numeric whose reference value was overridden by 203; resolved at
    /// runtime from the captured values.
    fn process_numeric_of_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: u32,
        scale: i32,
        refval_factor: i64,
    ) -> Result<(), Error> {
        let id = descriptor.id();
        let new_refval = *state.new_refvals.get(&id).ok_or_else(|| {
            Error::ProtocolViolation(format!("no new reference value defined for {id:06}"))
        })?;
        self.process_numeric(state, descriptor, nbits, scale, new_refval * refval_factor)
    }

    fn define_bitmap(&mut self, state: &mut CoderState, reuse: bool) -> Result<(), Error> {
        let bits = self.bitmap_values(state, state.n_031031)?;
        debug!("bitmap defined with {} bits", bits.len());
        if reuse {
            state.bitmap = Some(bits.clone());
        }
        state.build_bitmapped_descriptors(bits)
    }
}

pub(crate) fn process_template<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    template: &BufrTemplate,
) -> Result<(), Error> {
    process_members(coder, state, &template.members)
}

/// Process a list of descriptors that are members of a composite
/// descriptor, applying the pending-state guards in order: data not
/// present, new reference value capture, skipped local width, bitmap
/// definition, then normal dispatch.
pub(crate) fn process_members<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    members: &[Descriptor],
) -> Result<(), Error> {
    for member in members {
        debug!("processing {member}");

        // 221 YYY: data not present for the following YYY descriptors
        // except classes 1-9 and 31.
        if state.data_not_present_count > 0 {
            state.data_not_present_count -= 1;
            if let Descriptor::Element(ed) = member {
                let x = ed.x();
                if !(1..=9).contains(&x) && x != 31 {
                    coder.process_not_present(state, DecodedDescriptor::NotPresent(ed.clone()))?;
                    continue;
                }
            }
        }

        // Currently defining new reference values; element descriptors
        // only.
        if state.nbits_of_new_refval > 0 {
            if let Descriptor::Element(ed) = member {
                if ed.is_string() {
                    return Err(Error::ProtocolViolation(format!(
                        "cannot define a new reference value for string descriptor {:06}",
                        ed.id
                    )));
                }
                let nbits = state.nbits_of_new_refval;
                coder.process_new_refval(state, DecodedDescriptor::Element(ed.clone()), nbits)?;
                continue;
            }
        }

        // 206 YYY: data width signified for the single next descriptor.
        if state.nbits_of_skipped_local > 0 {
            let nbits = state.nbits_of_skipped_local;
            state.nbits_of_skipped_local = 0;
            coder.process_codeflag(
                state,
                DecodedDescriptor::SkippedLocal {
                    id: member.id(),
                    nbits,
                },
                nbits,
            )?;
            continue;
        }

        if state.bitmap_phase != BitmapPhase::Na {
            advance_bitmap_phase(coder, state, member)?;
        }

        match member {
            Descriptor::Element(ed) => process_element(coder, state, ed)?,
            Descriptor::FixedReplication(r) => {
                for _ in 0..r.n_repeats() {
                    process_members(coder, state, &r.members)?;
                }
            }
            Descriptor::DelayedReplication(r) => process_delayed_replication(coder, state, r)?,
            Descriptor::Operator(id) => process_operator(coder, state, *id)?,
            Descriptor::Sequence(s) => process_members(coder, state, &s.members)?,
            Descriptor::Undefined(id) => return Err(Error::UnknownDescriptor(*id)),
        }
    }
    Ok(())
}

/// Advance the bitmap definition machine for one member. The first member
/// that is not 031031 after the counting stage completes the bitmap.
fn advance_bitmap_phase<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    member: &Descriptor,
) -> Result<(), Error> {
    match state.bitmap_phase {
        BitmapPhase::Indicator => match member.id() {
            236_000 => {
                state.most_recent_bitmap_is_for_reuse = true;
                state.bitmap_phase = BitmapPhase::WaitingForBit;
                state.n_031031 = 0;
            }
            237_000 => {
                state.bitmap_phase = BitmapPhase::Na;
            }
            _ => {
                state.most_recent_bitmap_is_for_reuse = false;
                state.bitmap_phase = BitmapPhase::WaitingForBit;
                state.n_031031 = 0;
            }
        },
        BitmapPhase::WaitingForBit => {
            if member.id() == 31031 {
                state.bitmap_phase = BitmapPhase::BitCounting;
                state.n_031031 = 1;
            }
        }
        BitmapPhase::BitCounting => {
            if member.id() == 31031 {
                state.n_031031 += 1;
            } else {
                let reuse = state.most_recent_bitmap_is_for_reuse;
                coder.define_bitmap(state, reuse)?;
                state.bitmap_phase = BitmapPhase::Na;
            }
        }
        BitmapPhase::Na => {}
    }
    Ok(())
}

pub(crate) fn process_element<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    ed: &Arc<ElementDescriptor>,
) -> Result<(), Error> {
    process_element_like(
        coder,
        state,
        ed,
        ed.scale,
        ed.refval,
        ed.nbits,
        DecodedDescriptor::Element(ed.clone()),
        None,
    )
}

/// The element path, shared between plain elements and resolved markers.
/// Emits the associated field, maintains the QA-info links, then
/// dispatches on the unit with all active modifiers applied.
#[allow(clippy::too_many_arguments)]
fn process_element_like<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    ed: &Arc<ElementDescriptor>,
    base_scale: i32,
    base_refval: i64,
    base_nbits: u32,
    decoded: DecodedDescriptor,
    back_reference: Option<usize>,
) -> Result<(), Error> {
    let x = ed.x();

    // Operators do not apply to class 31 element descriptors.
    if !state.nbits_of_associated.is_empty() && x != 31 {
        let nbits: u32 = state.nbits_of_associated.iter().sum();
        coder.process_codeflag(
            state,
            DecodedDescriptor::Associated { id: ed.id, nbits },
            nbits,
        )?;
    }

    // Class 33 codes attach QA information to back-referenced descriptors
    // while a 222000 block is active.
    if x == 33 {
        if state.qa_info_status == QaInfoStatus::Waiting {
            state.qa_info_status = QaInfoStatus::Processing;
        }
        if state.qa_info_status == QaInfoStatus::Processing {
            state.add_bitmap_link()?;
        }
    } else if state.qa_info_status == QaInfoStatus::Processing {
        state.qa_info_status = QaInfoStatus::Na;
    }

    if let Some(idx_descriptor) = back_reference {
        state.insert_bitmap_link(idx_descriptor);
    }

    if ed.is_string() {
        let nbytes = if state.new_nbytes > 0 {
            state.new_nbytes
        } else {
            (base_nbits / 8) as usize
        };
        coder.process_string(state, decoded, nbytes)
    } else if ed.is_codeflag() {
        coder.process_codeflag(state, decoded, base_nbits)
    } else {
        let nbits =
            base_nbits as i32 + state.nbits_offset + state.bsr_modifier.nbits_increment;
        if !(1..=64).contains(&nbits) {
            return Err(Error::ProtocolViolation(format!(
                "effective width {nbits} out of range for descriptor {:06}",
                ed.id
            )));
        }
        let scale = base_scale + state.scale_offset + state.bsr_modifier.scale_increment;
        let refval_factor = state.bsr_modifier.refval_factor;
        if !state.new_refvals.contains_key(&ed.id) {
            let refval = base_refval * refval_factor;
            coder.process_numeric(state, decoded, nbits as u32, scale, refval)
        } else {
            coder.process_numeric_of_new_refval(state, decoded, nbits as u32, scale, refval_factor)
        }
    }
}

fn process_delayed_replication<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    r: &DelayedReplication,
) -> Result<(), Error> {
    if r.factor.id == 31011 || r.factor.id == 31012 {
        return Err(Error::NotImplemented(
            "delayed repetition descriptor".to_string(),
        ));
    }
    process_element(coder, state, &r.factor)?;
    let idx = coder.delayed_factor_index(state);
    let n_repeats = state.delayed_replication_factor_at(idx)?;
    for _ in 0..n_repeats {
        process_members(coder, state, &r.members)?;
    }
    Ok(())
}

fn process_operator<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    id: u32,
) -> Result<(), Error> {
    let code = operator_code(id);
    let y = operand_value(id);

    match code {
        201 => state.nbits_offset = if y > 0 { y as i32 - 128 } else { 0 },
        202 => state.scale_offset = if y > 0 { y as i32 - 128 } else { 0 },
        203 => {
            if y == 255 {
                // Conclude the definition block; captured values remain.
                state.nbits_of_new_refval = 0;
            } else {
                state.nbits_of_new_refval = y;
                if y == 0 {
                    state.new_refvals.clear();
                }
            }
        }
        204 => {
            if y == 0 {
                state.nbits_of_associated.pop().ok_or_else(|| {
                    Error::ProtocolViolation(
                        "204000 without an active associated field".to_string(),
                    )
                })?;
            } else {
                state.nbits_of_associated.push(y);
            }
        }
        // In-stream character data of Y bytes; not affected by 208.
        205 => coder.process_string(state, DecodedDescriptor::Operator(id), y as usize)?,
        206 => state.nbits_of_skipped_local = y,
        207 => {
            state.bsr_modifier = if y == 0 {
                BsrModifier::default()
            } else {
                BsrModifier {
                    nbits_increment: (10 * y + 2).div_ceil(3) as i32,
                    scale_increment: y as i32,
                    refval_factor: 10i64.checked_pow(y).ok_or_else(|| {
                        Error::ProtocolViolation(format!("207{y:03} reference factor overflows"))
                    })?,
                }
            };
        }
        208 => state.new_nbytes = y as usize,
        221 => state.data_not_present_count = y,
        // Quality info, substituted, 1st order stats, difference stats,
        // replaced/retained.
        222 | 223 | 224 | 225 | 232 => {
            if y == 0 {
                state.bitmap_phase = BitmapPhase::Indicator;
                state.mark_back_reference_boundary();
                coder.process_constant(state, DecodedDescriptor::Operator(id), 0)?;
                if code == 222 {
                    state.qa_info_status = QaInfoStatus::Waiting;
                }
            } else {
                process_marker_operator(coder, state, id)?;
            }
        }
        235 => state.cancel_all_back_references(),
        236 => coder.process_constant(state, DecodedDescriptor::Operator(id), 0)?,
        237 => {
            if y == 0 {
                state.recall_bitmap();
            } else if state.most_recent_bitmap_is_for_reuse {
                state.cancel_bitmap();
            }
            coder.process_constant(state, DecodedDescriptor::Operator(id), 0)?;
        }
        _ => {
            return Err(Error::NotImplemented(format!("operator descriptor {id:06}")));
        }
    }
    Ok(())
}

/// Resolve a marker operator (223255 etc.) against the current bitmap and
/// process the back-referenced element under the marker's parameters.
pub(crate) fn process_marker_operator<C: CoderOps>(
    coder: &mut C,
    state: &mut CoderState,
    marker_id: u32,
) -> Result<(), Error> {
    let (idx_descriptor, element) = state.next_bitmapped_descriptor()?;
    let md = MarkerDescriptor::from_element(&element, marker_id);
    process_element_like(
        coder,
        state,
        &element,
        md.scale,
        md.refval,
        md.nbits,
        DecodedDescriptor::Marker(md),
        Some(idx_descriptor),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bsr_modifier_arithmetic() {
        // 207 YYY: nbits ceil((10Y+2)/3), scale Y, refval 10^Y
        let cases = [(1u32, 4i32), (2, 8), (3, 11), (7, 24), (10, 34)];
        for (y, nbits) in cases {
            assert_eq!((10 * y + 2).div_ceil(3) as i32, nbits);
        }
    }

    #[test]
    fn test_back_reference_collection_is_type_exact() {
        let element = |id: u32| {
            Arc::new(ElementDescriptor {
                id,
                name: String::new(),
                unit: "CODE TABLE".to_string(),
                scale: 0,
                refval: 0,
                nbits: 6,
                crex_unit: String::new(),
                crex_scale: 0,
                crex_nchars: 0,
            })
        };
        let mut state = CoderState::new(false, 1, None);
        for id in [8002, 8002, 8002] {
            state.push_descriptor(DecodedDescriptor::Element(element(id)));
        }
        // A marker and an associated record must not be collected.
        state.push_descriptor(DecodedDescriptor::Marker(MarkerDescriptor::from_element(
            &element(8002),
            224_255,
        )));
        state.push_descriptor(DecodedDescriptor::Associated { id: 8002, nbits: 4 });
        state.mark_back_reference_boundary();

        state.build_bitmapped_descriptors(vec![1, 0, 0]).unwrap();
        let (idx, _) = state.next_bitmapped_descriptor().unwrap();
        assert_eq!(idx, 1);
        let (idx, _) = state.next_bitmapped_descriptor().unwrap();
        assert_eq!(idx, 2);
        assert!(state.next_bitmapped_descriptor().is_err());

        // Insufficient back references for a longer bitmap.
        let mut state2 = CoderState::new(false, 1, None);
        state2.push_descriptor(DecodedDescriptor::Element(element(8002)));
        state2.mark_back_reference_boundary();
        assert!(state2.build_bitmapped_descriptors(vec![0, 0]).is_err());
    }

    #[test]
    fn test_delayed_factor_validation() {
        let mut state = CoderState::new(false, 1, None);
        state.push_value(Value::Int(3));
        assert_eq!(state.delayed_replication_factor_at(0).unwrap(), 3);

        let mut state = CoderState::new(false, 1, None);
        state.push_value(Value::Missing);
        let err = state.delayed_replication_factor_at(0).unwrap_err();
        assert!(err.to_string().contains("must be >= 0"));

        // Compressed factors must agree across subsets.
        let mut state = CoderState::new(true, 2, None);
        state.push_value_all_subsets(Value::Int(2));
        state.values_all[1][0] = Value::Int(5);
        assert!(state.delayed_replication_factor_at(0).is_err());
    }

    #[test]
    fn test_subset_context_switch_clears_refvals() {
        let mut state = CoderState::new(false, 2, None);
        state.new_refvals.insert(12001, -55);
        state.idx_value = 7;
        state.switch_subset_context(1);
        assert!(state.new_refvals.is_empty());
        assert_eq!(state.idx_value, 0);
        assert_eq!(state.idx_subset, 1);
    }
}
