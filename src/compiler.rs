//! Compiled templates: a template can be lowered into a linear list of
//! statements with the operator modifiers baked into their arguments.
//! Replaying the statements produces bit-identical output to direct
//! interpretation, and the statement list serializes losslessly to JSON.
//!
//! Runtime-dependent constructs stay dynamic: delayed replication becomes
//! a loop bounded by the factor read at replay time, bitmap definitions
//! count their 031031 bits through explicit counter statements, and
//! marker operators resolve their back-referenced element at replay time
//! with the modifier state restored from a snapshot.

use std::sync::{Arc, Mutex};

use hashbrown::HashSet;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::coder::{
    BitmapPhase, BsrModifier, CoderOps, CoderState, QaInfoStatus, process_marker_operator,
};
use crate::descriptors::{
    BufrTemplate, DecodedDescriptor, Descriptor, ElementDescriptor, operand_value, operator_code,
    x_of,
};
use crate::tables::{TableGroup, TableGroupKey};
use crate::Error;

/// A descriptor reference inside a compiled statement; elements are
/// resolved against the table group at replay time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompiledDescriptor {
    Element { id: u32 },
    Associated { id: u32, nbits: u32 },
    SkippedLocal { id: u32, nbits: u32 },
    Operator { id: u32 },
    NotPresent { id: u32 },
}

impl CompiledDescriptor {
    fn resolve(&self, table_group: &TableGroup) -> Result<DecodedDescriptor, Error> {
        Ok(match self {
            CompiledDescriptor::Element { id } => {
                DecodedDescriptor::Element(resolve_element(table_group, *id)?)
            }
            CompiledDescriptor::Associated { id, nbits } => DecodedDescriptor::Associated {
                id: *id,
                nbits: *nbits,
            },
            CompiledDescriptor::SkippedLocal { id, nbits } => DecodedDescriptor::SkippedLocal {
                id: *id,
                nbits: *nbits,
            },
            CompiledDescriptor::Operator { id } => DecodedDescriptor::Operator(*id),
            CompiledDescriptor::NotPresent { id } => {
                DecodedDescriptor::NotPresent(resolve_element(table_group, *id)?)
            }
        })
    }
}

fn resolve_element(table_group: &TableGroup, id: u32) -> Result<Arc<ElementDescriptor>, Error> {
    match table_group.lookup(id) {
        Descriptor::Element(ed) => Ok(ed),
        _ => Err(Error::UnknownDescriptor(id)),
    }
}

/// The modifier state captured when a marker operator was compiled,
/// restored before the marker resolves at replay time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub nbits_offset: i32,
    pub scale_offset: i32,
    pub bsr_modifier: BsrModifier,
    pub new_nbytes: usize,
    pub nbits_of_associated: Vec<u32>,
    pub qa_info_status: QaInfoStatus,
}

impl StateSnapshot {
    fn apply(&self, state: &mut CoderState) {
        state.nbits_offset = self.nbits_offset;
        state.scale_offset = self.scale_offset;
        state.bsr_modifier = self.bsr_modifier;
        state.new_nbytes = self.new_nbytes;
        state.nbits_of_associated = SmallVec::from_slice(&self.nbits_of_associated);
        state.qa_info_status = self.qa_info_status;
    }
}

/// One step of a compiled template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    ProcessString {
        descriptor: CompiledDescriptor,
        nbytes: usize,
    },
    ProcessCodeflag {
        descriptor: CompiledDescriptor,
        nbits: u32,
    },
    ProcessNumeric {
        descriptor: CompiledDescriptor,
        nbits: u32,
        scale: i32,
        refval: i64,
    },
    ProcessNumericOfNewRefval {
        descriptor: CompiledDescriptor,
        nbits: u32,
        scale: i32,
        refval_factor: i64,
    },
    ProcessNewRefval {
        descriptor: CompiledDescriptor,
        nbits: u32,
    },
    ProcessConstant {
        descriptor: CompiledDescriptor,
        value: i64,
    },
    ProcessNotPresent {
        descriptor: CompiledDescriptor,
    },
    ProcessMarker {
        marker_id: u32,
        snapshot: StateSnapshot,
    },
    FixedLoop {
        n_repeats: u32,
        body: Vec<Statement>,
    },
    DelayedLoop {
        factor: Box<Statement>,
        body: Vec<Statement>,
    },
    MarkBackReferenceBoundary,
    AddBitmapLink,
    Reset031031,
    Increment031031,
    DefineBitmap {
        reuse: bool,
    },
    RecallBitmap,
    CancelBitmap,
    CancelBackReferences,
}

/// A template lowered to statements, cached by
/// `(descriptor ids, table group key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledTemplate {
    pub statements: Vec<Statement>,
}

impl CompiledTemplate {
    pub fn compile(template: &BufrTemplate) -> Result<Self, Error> {
        let mut state = CompileState::default();
        let mut statements = Vec::new();
        compile_members(&mut state, &mut statements, &template.members)?;
        Ok(Self { statements })
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("compiled templates are plain data")
    }

    pub fn from_json(json: &serde_json::Value) -> Result<Self, Error> {
        serde_json::from_value(json.clone())
            .map_err(|e| Error::ProtocolViolation(format!("bad compiled template: {e}")))
    }

    pub(crate) fn replay<C: CoderOps>(
        &self,
        coder: &mut C,
        state: &mut CoderState,
        table_group: &TableGroup,
    ) -> Result<(), Error> {
        run_statements(&self.statements, coder, state, table_group)
    }
}

fn run_statements<C: CoderOps>(
    statements: &[Statement],
    coder: &mut C,
    state: &mut CoderState,
    table_group: &TableGroup,
) -> Result<(), Error> {
    for statement in statements {
        run_statement(statement, coder, state, table_group)?;
    }
    Ok(())
}

fn run_statement<C: CoderOps>(
    statement: &Statement,
    coder: &mut C,
    state: &mut CoderState,
    table_group: &TableGroup,
) -> Result<(), Error> {
    match statement {
        Statement::ProcessString { descriptor, nbytes } => {
            coder.process_string(state, descriptor.resolve(table_group)?, *nbytes)
        }
        Statement::ProcessCodeflag { descriptor, nbits } => {
            coder.process_codeflag(state, descriptor.resolve(table_group)?, *nbits)
        }
        Statement::ProcessNumeric {
            descriptor,
            nbits,
            scale,
            refval,
        } => coder.process_numeric(state, descriptor.resolve(table_group)?, *nbits, *scale, *refval),
        Statement::ProcessNumericOfNewRefval {
            descriptor,
            nbits,
            scale,
            refval_factor,
        } => coder.process_numeric_of_new_refval(
            state,
            descriptor.resolve(table_group)?,
            *nbits,
            *scale,
            *refval_factor,
        ),
        Statement::ProcessNewRefval { descriptor, nbits } => {
            coder.process_new_refval(state, descriptor.resolve(table_group)?, *nbits)
        }
        Statement::ProcessConstant { descriptor, value } => {
            coder.process_constant(state, descriptor.resolve(table_group)?, *value)
        }
        Statement::ProcessNotPresent { descriptor } => {
            coder.process_not_present(state, descriptor.resolve(table_group)?)
        }
        Statement::ProcessMarker {
            marker_id,
            snapshot,
        } => {
            snapshot.apply(state);
            process_marker_operator(coder, state, *marker_id)
        }
        Statement::FixedLoop { n_repeats, body } => {
            for _ in 0..*n_repeats {
                run_statements(body, coder, state, table_group)?;
            }
            Ok(())
        }
        Statement::DelayedLoop { factor, body } => {
            run_statement(factor, coder, state, table_group)?;
            let idx = coder.delayed_factor_index(state);
            let n_repeats = state.delayed_replication_factor_at(idx)?;
            for _ in 0..n_repeats {
                run_statements(body, coder, state, table_group)?;
            }
            Ok(())
        }
        Statement::MarkBackReferenceBoundary => {
            state.mark_back_reference_boundary();
            Ok(())
        }
        Statement::AddBitmapLink => state.add_bitmap_link(),
        Statement::Reset031031 => {
            state.n_031031 = 0;
            Ok(())
        }
        Statement::Increment031031 => {
            state.n_031031 += 1;
            Ok(())
        }
        Statement::DefineBitmap { reuse } => coder.define_bitmap(state, *reuse),
        Statement::RecallBitmap => {
            state.recall_bitmap();
            Ok(())
        }
        Statement::CancelBitmap => {
            state.cancel_bitmap();
            Ok(())
        }
        Statement::CancelBackReferences => {
            state.cancel_all_back_references();
            Ok(())
        }
    }
}

/// The compiler's own walk state: the operator modifiers tracked while
/// lowering, mirroring the runtime coder state.
#[derive(Default)]
struct CompileState {
    nbits_offset: i32,
    scale_offset: i32,
    nbits_of_new_refval: u32,
    new_refval_ids: HashSet<u32>,
    nbits_of_associated: SmallVec<[u32; 4]>,
    nbits_of_skipped_local: u32,
    bsr_modifier: BsrModifier,
    new_nbytes: usize,
    data_not_present_count: u32,
    qa_info_status: QaInfoStatus,
    bitmap_phase: BitmapPhase,
    reuse: bool,
}

impl CompileState {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            nbits_offset: self.nbits_offset,
            scale_offset: self.scale_offset,
            bsr_modifier: self.bsr_modifier,
            new_nbytes: self.new_nbytes,
            nbits_of_associated: self.nbits_of_associated.to_vec(),
            qa_info_status: self.qa_info_status,
        }
    }
}

fn compile_members(
    cs: &mut CompileState,
    out: &mut Vec<Statement>,
    members: &[Descriptor],
) -> Result<(), Error> {
    for member in members {
        if cs.data_not_present_count > 0 {
            cs.data_not_present_count -= 1;
            if let Descriptor::Element(ed) = member {
                let x = ed.x();
                if !(1..=9).contains(&x) && x != 31 {
                    out.push(Statement::ProcessNotPresent {
                        descriptor: CompiledDescriptor::NotPresent { id: ed.id },
                    });
                    continue;
                }
            }
        }

        if cs.nbits_of_new_refval > 0 {
            if let Descriptor::Element(ed) = member {
                if ed.is_string() {
                    return Err(Error::ProtocolViolation(format!(
                        "cannot define a new reference value for string descriptor {:06}",
                        ed.id
                    )));
                }
                out.push(Statement::ProcessNewRefval {
                    descriptor: CompiledDescriptor::Element { id: ed.id },
                    nbits: cs.nbits_of_new_refval,
                });
                cs.new_refval_ids.insert(ed.id);
                continue;
            }
        }

        if cs.nbits_of_skipped_local > 0 {
            let nbits = cs.nbits_of_skipped_local;
            cs.nbits_of_skipped_local = 0;
            out.push(Statement::ProcessCodeflag {
                descriptor: CompiledDescriptor::SkippedLocal {
                    id: member.id(),
                    nbits,
                },
                nbits,
            });
            continue;
        }

        if cs.bitmap_phase != BitmapPhase::Na {
            compile_bitmap_phase(cs, out, member);
        }

        match member {
            Descriptor::Element(ed) => compile_element(cs, out, ed)?,
            Descriptor::FixedReplication(r) => {
                if cs.data_not_present_count > 0 || cs.nbits_of_new_refval > 0 {
                    // The per-member countdown changes which branch each
                    // iteration takes; unroll so the static walk stays in
                    // step with the runtime one.
                    for _ in 0..r.n_repeats() {
                        compile_members(cs, out, &r.members)?;
                    }
                } else {
                    let mut body = Vec::new();
                    compile_members(cs, &mut body, &r.members)?;
                    out.push(Statement::FixedLoop {
                        n_repeats: r.n_repeats(),
                        body,
                    });
                }
            }
            Descriptor::DelayedReplication(r) => {
                if r.factor.id == 31011 || r.factor.id == 31012 {
                    return Err(Error::NotImplemented(
                        "delayed repetition descriptor".to_string(),
                    ));
                }
                if cs.data_not_present_count > 0 || cs.nbits_of_new_refval > 0 {
                    return Err(Error::NotImplemented(
                        "operator mode spanning a delayed replication in a compiled template"
                            .to_string(),
                    ));
                }
                let mut factor = Vec::new();
                compile_element(cs, &mut factor, &r.factor)?;
                let factor = factor.pop().ok_or_else(|| {
                    Error::ProtocolViolation(format!(
                        "replication factor {:06} compiled to no statement",
                        r.factor.id
                    ))
                })?;
                let mut body = Vec::new();
                compile_members(cs, &mut body, &r.members)?;
                out.push(Statement::DelayedLoop {
                    factor: Box::new(factor),
                    body,
                });
            }
            Descriptor::Operator(id) => compile_operator(cs, out, *id)?,
            Descriptor::Sequence(s) => compile_members(cs, out, &s.members)?,
            Descriptor::Undefined(id) => return Err(Error::UnknownDescriptor(*id)),
        }
    }
    Ok(())
}

fn compile_bitmap_phase(cs: &mut CompileState, out: &mut Vec<Statement>, member: &Descriptor) {
    match cs.bitmap_phase {
        BitmapPhase::Indicator => match member.id() {
            236_000 => {
                cs.reuse = true;
                cs.bitmap_phase = BitmapPhase::WaitingForBit;
                out.push(Statement::Reset031031);
            }
            237_000 => {
                cs.bitmap_phase = BitmapPhase::Na;
            }
            _ => {
                cs.reuse = false;
                cs.bitmap_phase = BitmapPhase::WaitingForBit;
                out.push(Statement::Reset031031);
            }
        },
        BitmapPhase::WaitingForBit => {
            if member.id() == 31031 {
                cs.bitmap_phase = BitmapPhase::BitCounting;
                out.push(Statement::Increment031031);
            }
        }
        BitmapPhase::BitCounting => {
            if member.id() == 31031 {
                out.push(Statement::Increment031031);
            } else {
                out.push(Statement::DefineBitmap { reuse: cs.reuse });
                cs.bitmap_phase = BitmapPhase::Na;
            }
        }
        BitmapPhase::Na => {}
    }
}

fn compile_element(
    cs: &mut CompileState,
    out: &mut Vec<Statement>,
    ed: &Arc<ElementDescriptor>,
) -> Result<(), Error> {
    let x = x_of(ed.id);
    if !cs.nbits_of_associated.is_empty() && x != 31 {
        let nbits: u32 = cs.nbits_of_associated.iter().sum();
        out.push(Statement::ProcessCodeflag {
            descriptor: CompiledDescriptor::Associated { id: ed.id, nbits },
            nbits,
        });
    }

    if x == 33 {
        if cs.qa_info_status == QaInfoStatus::Waiting {
            cs.qa_info_status = QaInfoStatus::Processing;
        }
        if cs.qa_info_status == QaInfoStatus::Processing {
            out.push(Statement::AddBitmapLink);
        }
    } else if cs.qa_info_status == QaInfoStatus::Processing {
        cs.qa_info_status = QaInfoStatus::Na;
    }

    let descriptor = CompiledDescriptor::Element { id: ed.id };
    if ed.is_string() {
        let nbytes = if cs.new_nbytes > 0 {
            cs.new_nbytes
        } else {
            (ed.nbits / 8) as usize
        };
        out.push(Statement::ProcessString { descriptor, nbytes });
    } else if ed.is_codeflag() {
        out.push(Statement::ProcessCodeflag {
            descriptor,
            nbits: ed.nbits,
        });
    } else {
        let nbits = ed.nbits as i32 + cs.nbits_offset + cs.bsr_modifier.nbits_increment;
        if !(1..=64).contains(&nbits) {
            return Err(Error::ProtocolViolation(format!(
                "effective width {nbits} out of range for descriptor {:06}",
                ed.id
            )));
        }
        let scale = ed.scale + cs.scale_offset + cs.bsr_modifier.scale_increment;
        if cs.new_refval_ids.contains(&ed.id) {
            out.push(Statement::ProcessNumericOfNewRefval {
                descriptor,
                nbits: nbits as u32,
                scale,
                refval_factor: cs.bsr_modifier.refval_factor,
            });
        } else {
            out.push(Statement::ProcessNumeric {
                descriptor,
                nbits: nbits as u32,
                scale,
                refval: ed.refval * cs.bsr_modifier.refval_factor,
            });
        }
    }
    Ok(())
}

fn compile_operator(
    cs: &mut CompileState,
    out: &mut Vec<Statement>,
    id: u32,
) -> Result<(), Error> {
    let code = operator_code(id);
    let y = operand_value(id);
    match code {
        201 => cs.nbits_offset = if y > 0 { y as i32 - 128 } else { 0 },
        202 => cs.scale_offset = if y > 0 { y as i32 - 128 } else { 0 },
        203 => {
            if y == 255 {
                cs.nbits_of_new_refval = 0;
            } else {
                cs.nbits_of_new_refval = y;
                if y == 0 {
                    cs.new_refval_ids.clear();
                }
            }
        }
        204 => {
            if y == 0 {
                cs.nbits_of_associated.pop().ok_or_else(|| {
                    Error::ProtocolViolation(
                        "204000 without an active associated field".to_string(),
                    )
                })?;
            } else {
                cs.nbits_of_associated.push(y);
            }
        }
        205 => out.push(Statement::ProcessString {
            descriptor: CompiledDescriptor::Operator { id },
            nbytes: y as usize,
        }),
        206 => cs.nbits_of_skipped_local = y,
        207 => {
            cs.bsr_modifier = if y == 0 {
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
        208 => cs.new_nbytes = y as usize,
        221 => cs.data_not_present_count = y,
        222 | 223 | 224 | 225 | 232 => {
            if y == 0 {
                cs.bitmap_phase = BitmapPhase::Indicator;
                out.push(Statement::MarkBackReferenceBoundary);
                out.push(Statement::ProcessConstant {
                    descriptor: CompiledDescriptor::Operator { id },
                    value: 0,
                });
                if code == 222 {
                    cs.qa_info_status = QaInfoStatus::Waiting;
                }
            } else {
                out.push(Statement::ProcessMarker {
                    marker_id: id,
                    snapshot: cs.snapshot(),
                });
            }
        }
        235 => out.push(Statement::CancelBackReferences),
        236 => out.push(Statement::ProcessConstant {
            descriptor: CompiledDescriptor::Operator { id },
            value: 0,
        }),
        237 => {
            if y == 0 {
                out.push(Statement::RecallBitmap);
            } else if cs.reuse {
                out.push(Statement::CancelBitmap);
            }
            out.push(Statement::ProcessConstant {
                descriptor: CompiledDescriptor::Operator { id },
                value: 0,
            });
        }
        _ => {
            return Err(Error::NotImplemented(format!("operator descriptor {id:06}")));
        }
    }
    Ok(())
}

/// Bounded cache of compiled templates, evicted in insertion order. A
/// capacity of zero disables compilation entirely.
pub struct CompiledTemplateManager {
    max: usize,
    cache: Mutex<IndexMap<(Vec<u32>, TableGroupKey), Arc<CompiledTemplate>>>,
}

impl CompiledTemplateManager {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            cache: Mutex::new(IndexMap::new()),
        }
    }

    pub(crate) fn get_or_compile(
        &self,
        ids: &[u32],
        table_group: &TableGroup,
        template: &BufrTemplate,
    ) -> Result<Option<Arc<CompiledTemplate>>, Error> {
        if self.max == 0 {
            return Ok(None);
        }
        let key = (ids.to_vec(), table_group.key.clone());
        let mut cache = self.cache.lock().unwrap();
        if let Some(compiled) = cache.get(&key) {
            return Ok(Some(compiled.clone()));
        }
        let compiled = match CompiledTemplate::compile(template) {
            Ok(compiled) => Arc::new(compiled),
            // A construct the compiler cannot lower; direct
            // interpretation still can.
            Err(Error::NotImplemented(reason)) => {
                log::debug!("template not compiled: {reason}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        while cache.len() >= self.max {
            cache.shift_remove_index(0);
        }
        cache.insert(key, compiled.clone());
        Ok(Some(compiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptors::{DelayedReplication, FixedReplication};

    fn element(id: u32, unit: &str, scale: i32, refval: i64, nbits: u32) -> Arc<ElementDescriptor> {
        Arc::new(ElementDescriptor {
            id,
            name: String::new(),
            unit: unit.to_string(),
            scale,
            refval,
            nbits,
            crex_unit: String::new(),
            crex_scale: 0,
            crex_nchars: 0,
        })
    }

    #[test]
    fn test_modifiers_are_baked_into_arguments() {
        let template = BufrTemplate::new(
            vec![
                Descriptor::Operator(202_129), // scale +1
                Descriptor::Operator(201_130), // width +2
                Descriptor::Element(element(12001, "K", 1, 0, 12)),
                Descriptor::Operator(201_000),
                Descriptor::Operator(202_000),
                Descriptor::Element(element(12001, "K", 1, 0, 12)),
            ],
            vec![],
        );
        let compiled = CompiledTemplate::compile(&template).unwrap();
        assert_eq!(
            compiled.statements,
            vec![
                Statement::ProcessNumeric {
                    descriptor: CompiledDescriptor::Element { id: 12001 },
                    nbits: 14,
                    scale: 2,
                    refval: 0,
                },
                Statement::ProcessNumeric {
                    descriptor: CompiledDescriptor::Element { id: 12001 },
                    nbits: 12,
                    scale: 1,
                    refval: 0,
                },
            ]
        );
    }

    #[test]
    fn test_delayed_replication_compiles_to_loop() {
        let template = BufrTemplate::new(
            vec![Descriptor::DelayedReplication(DelayedReplication {
                id: 101_000,
                members: vec![Descriptor::Element(element(20011, "CODE TABLE", 0, 0, 4))],
                factor: element(31001, "Numeric", 0, 0, 8),
            })],
            vec![],
        );
        let compiled = CompiledTemplate::compile(&template).unwrap();
        let Statement::DelayedLoop { factor, body } = &compiled.statements[0] else {
            panic!("expected a delayed loop")
        };
        assert!(matches!(**factor, Statement::ProcessNumeric { nbits: 8, .. }));
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_fixed_loop_and_json_roundtrip() {
        let template = BufrTemplate::new(
            vec![Descriptor::FixedReplication(FixedReplication {
                id: 102_003,
                members: vec![
                    Descriptor::Element(element(12001, "K", 1, 0, 12)),
                    Descriptor::Element(element(20011, "CODE TABLE", 0, 0, 4)),
                ],
            })],
            vec![],
        );
        let compiled = CompiledTemplate::compile(&template).unwrap();
        assert!(matches!(
            compiled.statements[0],
            Statement::FixedLoop { n_repeats: 3, .. }
        ));

        let json = compiled.to_json();
        let restored = CompiledTemplate::from_json(&json).unwrap();
        assert_eq!(restored, compiled);
    }

    #[test]
    fn test_bitmap_statements() {
        let members = vec![
            Descriptor::Element(element(12001, "K", 1, 0, 12)),
            Descriptor::Element(element(12001, "K", 1, 0, 12)),
            Descriptor::Operator(224_000),
            Descriptor::FixedReplication(FixedReplication {
                id: 101_002,
                members: vec![Descriptor::Element(element(
                    31031,
                    "FLAG TABLE",
                    0,
                    0,
                    1,
                ))],
            }),
            Descriptor::Operator(224_255),
            Descriptor::Operator(224_255),
        ];
        let template = BufrTemplate::new(members, vec![]);
        let compiled = CompiledTemplate::compile(&template).unwrap();
        let kinds: Vec<_> = compiled
            .statements
            .iter()
            .map(std::mem::discriminant)
            .collect();
        // Two numerics, boundary, constant, reset, loop of bits, define,
        // then the two markers.
        assert_eq!(kinds.len(), 9);
        assert!(matches!(
            compiled.statements[2],
            Statement::MarkBackReferenceBoundary
        ));
        assert!(matches!(compiled.statements[4], Statement::Reset031031));
        assert!(matches!(compiled.statements[6], Statement::DefineBitmap { reuse: false }));
        assert!(matches!(
            compiled.statements[7],
            Statement::ProcessMarker {
                marker_id: 224_255,
                ..
            }
        ));
    }
}
