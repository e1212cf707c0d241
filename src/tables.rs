//! Versioned BUFR table loading and lookup.
//!
//! A table group bundles the tables that belong to one
//! `(master table, centre, subcentre, master version, local version)`
//! tuple. Table B (elements) and Table D (sequences) are loaded from JSON
//! files under `tables_root/<master>/<centre>_<subcentre>/<version>/`;
//! Table C (operators) and Table R (replications) are synthetic and
//! construct their descriptors on demand. Groups of the same key are only
//! loaded from disk once and then served from a process-wide cache.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use hashbrown::HashMap;
use indexmap::IndexMap;
use log::{debug, warn};
use serde_json::Value as Json;

use crate::descriptors::{
    BufrTemplate, DelayedReplication, Descriptor, ElementDescriptor, FixedReplication,
    SequenceDescriptor, f_of, x_of, y_of,
};
use crate::Error;

/// The maximum number of table groups kept in the process-wide cache.
const MAX_CACHED_TABLE_GROUPS: usize = 50;

const DEFAULT_MASTER_TABLE_NUMBER: u64 = 0;
const DEFAULT_ORIGINATING_CENTRE: u64 = 0;
const DEFAULT_ORIGINATING_SUBCENTRE: u64 = 0;
const DEFAULT_MASTER_TABLE_VERSION: u64 = 33;

/// Identity of one set of loaded tables: the root directory plus the
/// WMO and (optional) local `<master>/<centre>_<subcentre>/<version>`
/// sub-paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableGroupKey {
    pub tables_root_dir: PathBuf,
    pub wmo_tables_sn: (String, String, String),
    pub local_tables_sn: Option<(String, String, String)>,
}

impl TableGroupKey {
    fn wmo_dir(&self) -> PathBuf {
        let (a, b, c) = &self.wmo_tables_sn;
        self.tables_root_dir.join(a).join(b).join(c)
    }

    fn local_dir(&self) -> Option<PathBuf> {
        self.local_tables_sn
            .as_ref()
            .map(|(a, b, c)| self.tables_root_dir.join(a).join(b).join(c))
    }
}

impl std::fmt::Display for TableGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {:?} - {:?}",
            self.tables_root_dir.display(),
            self.wmo_tables_sn,
            self.local_tables_sn
        )
    }
}

fn tables_sn_strict(
    master_table_number: u64,
    originating_centre: u64,
    originating_subcentre: u64,
    master_table_version: u64,
    local_table_version: u64,
) -> ((String, String, String), Option<(String, String, String)>) {
    let wmo = (
        master_table_number.to_string(),
        "0_0".to_string(),
        master_table_version.to_string(),
    );
    let local = if local_table_version != 0 {
        Some((
            master_table_number.to_string(),
            format!("{originating_centre}_{originating_subcentre}"),
            local_table_version.to_string(),
        ))
    } else {
        None
    };
    (wmo, local)
}

/// Check that the requested tables actually exist on disk and fall back
/// step by step when they do not: master table number to 0, master table
/// version to the latest known default, local subcentre to 0, and finally
/// no local tables at all.
fn tables_sn_normalized(
    tables_root_dir: &Path,
    master_table_number: u64,
    originating_centre: u64,
    originating_subcentre: u64,
    master_table_version: u64,
    local_table_version: u64,
) -> ((String, String, String), Option<(String, String, String)>) {
    let mut master = master_table_number.to_string();
    if !tables_root_dir.join(&master).is_dir() {
        warn!(
            "fallback to default master table number {DEFAULT_MASTER_TABLE_NUMBER} ({master} not found)"
        );
        master = DEFAULT_MASTER_TABLE_NUMBER.to_string();
    }

    let centres = "0_0".to_string();
    let version = master_table_version.to_string();
    let wmo = if tables_root_dir.join(&master).join(&centres).join(&version).is_dir() {
        (master.clone(), centres, version)
    } else {
        warn!(
            "fallback to default master table version {DEFAULT_MASTER_TABLE_VERSION} ({version} not found)"
        );
        (
            master.clone(),
            "0_0".to_string(),
            DEFAULT_MASTER_TABLE_VERSION.to_string(),
        )
    };

    let local = if local_table_version != 0 {
        let version = local_table_version.to_string();
        let candidates = [
            format!("{originating_centre}_{originating_subcentre}"),
            format!("{originating_centre}_{DEFAULT_ORIGINATING_SUBCENTRE}"),
        ];
        let mut found = None;
        for (idx, centres) in candidates.iter().enumerate() {
            if tables_root_dir.join(&master).join(centres).join(&version).is_dir() {
                if idx != 0 {
                    warn!(
                        "fallback to default local sub-centre {DEFAULT_ORIGINATING_SUBCENTRE} ({originating_subcentre} not found)"
                    );
                }
                found = Some((master.clone(), centres.clone(), version.clone()));
                break;
            }
        }
        if found.is_none() {
            warn!(
                "cannot find sub-centre {originating_subcentre} nor valid default; local tables not in use"
            );
        }
        found
    } else {
        None
    };

    (wmo, local)
}

fn read_json_file(path: &Path) -> Result<Json, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::TableLoad(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| Error::TableLoad(format!("{}: {e}", path.display())))
}

fn json_str(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_i64(value: &Json) -> Result<i64, Error> {
    value
        .as_i64()
        .ok_or_else(|| Error::TableLoad(format!("expected an integer, got {value}")))
}

/// Table B: element descriptors, keyed by ID.
struct TableB {
    descriptors: HashMap<u32, Arc<ElementDescriptor>>,
}

impl TableB {
    fn load(dirs: &[PathBuf]) -> Result<Self, Error> {
        let mut descriptors = HashMap::new();
        for dir in dirs {
            let data = read_json_file(&dir.join("TableB.json"))?;
            let Json::Object(entries) = data else {
                return Err(Error::TableLoad(format!(
                    "TableB.json in {} is not an object",
                    dir.display()
                )));
            };
            for (id_string, fields) in &entries {
                let id: u32 = id_string
                    .parse()
                    .map_err(|_| Error::TableLoad(format!("bad Table B id: {id_string}")))?;
                let fields = fields.as_array().ok_or_else(|| {
                    Error::TableLoad(format!("Table B entry {id_string} is not an array"))
                })?;
                if fields.len() < 8 {
                    return Err(Error::TableLoad(format!(
                        "Table B entry {id_string} has {} fields, expected 8",
                        fields.len()
                    )));
                }
                descriptors.insert(
                    id,
                    Arc::new(ElementDescriptor {
                        id,
                        name: json_str(&fields[0]),
                        unit: json_str(&fields[1]),
                        scale: json_i64(&fields[2])? as i32,
                        refval: json_i64(&fields[3])?,
                        nbits: json_i64(&fields[4])? as u32,
                        crex_unit: json_str(&fields[5]),
                        crex_scale: fields[6].as_i64().unwrap_or(0) as i32,
                        crex_nchars: fields[7].as_i64().unwrap_or(0) as i32,
                    }),
                );
            }
        }
        Ok(Self { descriptors })
    }

    fn lookup(&self, id: u32) -> Descriptor {
        match self.descriptors.get(&id) {
            Some(ed) => Descriptor::Element(ed.clone()),
            None => Descriptor::Undefined(id),
        }
    }
}

/// Table D: sequence descriptors, keyed by ID. Loading happens in two
/// passes over the raw member ID lists so that sequences can reference
/// each other regardless of file order.
struct TableD {
    descriptors: HashMap<u32, Arc<SequenceDescriptor>>,
}

impl TableD {
    fn load(b: &TableB, dirs: &[PathBuf]) -> Result<Self, Error> {
        let mut raw: HashMap<u32, (String, Vec<u32>)> = HashMap::new();
        for dir in dirs {
            let data = read_json_file(&dir.join("TableD.json"))?;
            let Json::Object(entries) = data else {
                return Err(Error::TableLoad(format!(
                    "TableD.json in {} is not an object",
                    dir.display()
                )));
            };
            for (id_string, fields) in &entries {
                let id: u32 = id_string
                    .parse()
                    .map_err(|_| Error::TableLoad(format!("bad Table D id: {id_string}")))?;
                let fields = fields.as_array().ok_or_else(|| {
                    Error::TableLoad(format!("Table D entry {id_string} is not an array"))
                })?;
                if fields.len() < 2 {
                    return Err(Error::TableLoad(format!(
                        "Table D entry {id_string} has {} fields, expected 2",
                        fields.len()
                    )));
                }
                let member_ids = fields[1]
                    .as_array()
                    .ok_or_else(|| {
                        Error::TableLoad(format!("Table D entry {id_string} members not an array"))
                    })?
                    .iter()
                    .map(|v| match v {
                        Json::String(s) => s
                            .parse::<u32>()
                            .map_err(|_| Error::TableLoad(format!("bad member id {s}"))),
                        _ => Ok(json_i64(v)? as u32),
                    })
                    .collect::<Result<Vec<u32>, Error>>()?;
                raw.insert(id, (json_str(&fields[0]), member_ids));
            }
        }

        let mut table = Self {
            descriptors: HashMap::new(),
        };
        let mut ids: Vec<u32> = raw.keys().copied().collect();
        ids.sort_unstable();
        let mut visiting = Vec::new();
        for id in ids {
            table.build_sequence(id, b, &raw, &mut visiting)?;
        }
        Ok(table)
    }

    fn build_sequence(
        &mut self,
        id: u32,
        b: &TableB,
        raw: &HashMap<u32, (String, Vec<u32>)>,
        visiting: &mut Vec<u32>,
    ) -> Result<(), Error> {
        if self.descriptors.contains_key(&id) {
            return Ok(());
        }
        if visiting.contains(&id) {
            return Err(Error::TableLoad(format!(
                "circular Table D reference through {id:06}"
            )));
        }
        let (name, member_ids) = &raw[&id];
        visiting.push(id);
        // Build every referenced sequence first so the member expansion
        // below can look it up.
        for member_id in member_ids {
            if f_of(*member_id) == 3 && raw.contains_key(member_id) {
                self.build_sequence(*member_id, b, raw, visiting)?;
            }
        }
        visiting.pop();
        let members = parse_descriptors(b, self, member_ids)?;
        self.descriptors.insert(
            id,
            Arc::new(SequenceDescriptor {
                id,
                name: name.clone(),
                members,
            }),
        );
        Ok(())
    }

    fn lookup(&self, id: u32) -> Descriptor {
        match self.descriptors.get(&id) {
            Some(s) => Descriptor::Sequence(s.clone()),
            None => Descriptor::Undefined(id),
        }
    }
}

struct IdStream<'a> {
    ids: &'a [u32],
    pos: usize,
}

impl IdStream<'_> {
    fn next(&mut self) -> Option<u32> {
        let id = self.ids.get(self.pos).copied();
        if id.is_some() {
            self.pos += 1;
        }
        id
    }
}

/// Recursive-descent consumer of an ID stream. A replication consumes its
/// factor (when delayed) and then its next `n_items` raw IDs as members,
/// with nested replications drawing from the same budget.
fn parse_descriptors(b: &TableB, d: &TableD, ids: &[u32]) -> Result<Vec<Descriptor>, Error> {
    let mut stream = IdStream { ids, pos: 0 };
    parse_members(b, d, &mut stream, ids.len())
}

fn parse_members(
    b: &TableB,
    d: &TableD,
    stream: &mut IdStream<'_>,
    limit: usize,
) -> Result<Vec<Descriptor>, Error> {
    let mut members = Vec::new();
    while stream.pos < limit {
        let Some(id) = stream.next() else { break };
        members.push(parse_one(b, d, id, stream, limit)?);
    }
    Ok(members)
}

fn parse_one(
    b: &TableB,
    d: &TableD,
    id: u32,
    stream: &mut IdStream<'_>,
    limit: usize,
) -> Result<Descriptor, Error> {
    match f_of(id) {
        0 => Ok(b.lookup(id)),
        1 => {
            let factor = if y_of(id) == 0 {
                if stream.pos >= limit {
                    return Err(Error::ProtocolViolation(format!(
                        "replication {id:06} has no replication factor descriptor"
                    )));
                }
                let factor_id = stream.next().unwrap();
                match b.lookup(factor_id) {
                    Descriptor::Element(ed) => Some(ed),
                    _ => return Err(Error::UnknownDescriptor(factor_id)),
                }
            } else {
                None
            };
            let inner_limit = (stream.pos + x_of(id) as usize).min(limit);
            let members = parse_members(b, d, stream, inner_limit)?;
            Ok(match factor {
                Some(factor) => Descriptor::DelayedReplication(DelayedReplication {
                    id,
                    members,
                    factor,
                }),
                None => Descriptor::FixedReplication(FixedReplication { id, members }),
            })
        }
        2 => Ok(Descriptor::Operator(id)),
        3 => Ok(d.lookup(id)),
        _ => Err(Error::UnknownDescriptor(id)),
    }
}

/// Rewrite ill-formed sequence descriptors, as found in some NCEP local
/// tables, whose sole member is a replication with zero declared items:
/// the replication is hoisted out of the sequence and the descriptor
/// following the sequence becomes its single replicated member.
fn fix_ill_formed_sequences(descriptors: Vec<Descriptor>) -> Result<Vec<Descriptor>, Error> {
    let mut queue: std::collections::VecDeque<Descriptor> = descriptors.into();
    let mut fixed = Vec::new();
    while let Some(descriptor) = queue.pop_front() {
        match descriptor {
            Descriptor::Sequence(seq) => {
                let hoists = match seq.members.as_slice() {
                    [Descriptor::FixedReplication(r)] if r.members.is_empty() => {
                        Some(Descriptor::FixedReplication(r.clone()))
                    }
                    [Descriptor::DelayedReplication(r)] if r.members.is_empty() => {
                        Some(Descriptor::DelayedReplication(r.clone()))
                    }
                    _ => None,
                };
                if let Some(replication) = hoists {
                    queue.push_front(replication);
                } else {
                    fixed.push(Descriptor::Sequence(Arc::new(SequenceDescriptor {
                        id: seq.id,
                        name: seq.name.clone(),
                        members: fix_ill_formed_sequences(seq.members.clone())?,
                    })));
                }
            }
            Descriptor::FixedReplication(mut r) => {
                if r.members.is_empty() {
                    if r.n_items() != 1 {
                        return Err(Error::ProtocolViolation(format!(
                            "replication {:06} without members expects 1 item",
                            r.id
                        )));
                    }
                    let member = queue.pop_front().ok_or_else(|| {
                        Error::ProtocolViolation(format!(
                            "no descriptor follows hoisted replication {:06}",
                            r.id
                        ))
                    })?;
                    r.members = vec![member];
                }
                r.members = fix_ill_formed_sequences(r.members)?;
                fixed.push(Descriptor::FixedReplication(r));
            }
            Descriptor::DelayedReplication(mut r) => {
                if r.members.is_empty() {
                    if r.n_items() != 1 {
                        return Err(Error::ProtocolViolation(format!(
                            "replication {:06} without members expects 1 item",
                            r.id
                        )));
                    }
                    let member = queue.pop_front().ok_or_else(|| {
                        Error::ProtocolViolation(format!(
                            "no descriptor follows hoisted replication {:06}",
                            r.id
                        ))
                    })?;
                    r.members = vec![member];
                }
                r.members = fix_ill_formed_sequences(r.members)?;
                fixed.push(Descriptor::DelayedReplication(r));
            }
            other => fixed.push(other),
        }
    }
    Ok(fixed)
}

type CodeAndFlag = HashMap<u32, Vec<(u64, String)>>;

/// A group of tables belonging to one table group key. Shared immutably
/// by any number of messages.
pub struct TableGroup {
    pub key: TableGroupKey,
    b: TableB,
    d: TableD,
    code_and_flag: Mutex<Option<Arc<CodeAndFlag>>>,
}

impl TableGroup {
    fn load(key: TableGroupKey) -> Result<Self, Error> {
        let mut dirs = vec![key.wmo_dir()];
        if let Some(local) = key.local_dir() {
            dirs.push(local);
        }
        let b = TableB::load(&dirs)?;
        let d = TableD::load(&b, &dirs)?;
        Ok(Self {
            key,
            b,
            d,
            code_and_flag: Mutex::new(None),
        })
    }

    /// Look up a single descriptor by ID without consuming replication
    /// members or factors. Operator and replication descriptors are
    /// synthesized on demand.
    pub fn lookup(&self, id: u32) -> Descriptor {
        match f_of(id) {
            0 => self.b.lookup(id),
            1 => {
                if y_of(id) == 0 {
                    // The factor is unknown without the surrounding ID
                    // stream; expose the bare replication shape.
                    Descriptor::Undefined(id)
                } else {
                    Descriptor::FixedReplication(FixedReplication {
                        id,
                        members: Vec::new(),
                    })
                }
            }
            2 => Descriptor::Operator(id),
            3 => self.d.lookup(id),
            _ => Descriptor::Undefined(id),
        }
    }

    /// Build descriptors for a list of raw IDs, consuming replication
    /// factors and members along the way.
    pub fn descriptors_from_ids(&self, ids: &[u32]) -> Result<Vec<Descriptor>, Error> {
        parse_descriptors(&self.b, &self.d, ids)
    }

    /// Build a template from a list of unexpanded IDs.
    pub fn template_from_ids(&self, ids: &[u32]) -> Result<BufrTemplate, Error> {
        let members = fix_ill_formed_sequences(self.descriptors_from_ids(ids)?)?;
        Ok(BufrTemplate::new(members, ids.to_vec()))
    }

    /// The code/flag meanings for an element descriptor, if any. The
    /// `code_and_flag.json` files are loaded on first use.
    pub fn code_and_flag_for(&self, id: u32) -> Result<Option<Vec<(u64, String)>>, Error> {
        let mut guard = self.code_and_flag.lock().unwrap();
        if guard.is_none() {
            let mut table: CodeAndFlag = HashMap::new();
            let mut dirs = vec![self.key.wmo_dir()];
            if let Some(local) = self.key.local_dir() {
                dirs.push(local);
            }
            for dir in dirs {
                let path = dir.join("code_and_flag.json");
                if !path.is_file() {
                    continue;
                }
                let data = read_json_file(&path)?;
                let Json::Object(entries) = data else {
                    continue;
                };
                for (id_string, pairs) in &entries {
                    let Ok(id) = id_string.parse::<u32>() else {
                        continue;
                    };
                    let pairs = pairs
                        .as_array()
                        .map(|rows| {
                            rows.iter()
                                .filter_map(|row| {
                                    let row = row.as_array()?;
                                    Some((row.first()?.as_u64()?, json_str(row.get(1)?)))
                                })
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default();
                    table.insert(id, pairs);
                }
            }
            *guard = Some(Arc::new(table));
        }
        Ok(guard.as_ref().unwrap().get(&id).cloned())
    }
}

fn table_group_cache() -> &'static Mutex<IndexMap<TableGroupKey, Arc<TableGroup>>> {
    static CACHE: OnceLock<Mutex<IndexMap<TableGroupKey, Arc<TableGroup>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(IndexMap::new()))
}

/// Retrieve a table group, loading it from disk when not cached yet.
///
/// With `normalize` set, missing directories fall back step by step to
/// the default master table, version and subcentre; without it the exact
/// requested tables must exist.
#[allow(clippy::too_many_arguments)]
pub fn get_table_group(
    tables_root_dir: &Path,
    master_table_number: u64,
    originating_centre: u64,
    originating_subcentre: u64,
    master_table_version: u64,
    local_table_version: u64,
    normalize: bool,
) -> Result<Arc<TableGroup>, Error> {
    let (wmo, local) = if normalize {
        tables_sn_normalized(
            tables_root_dir,
            master_table_number,
            originating_centre,
            originating_subcentre,
            master_table_version,
            local_table_version,
        )
    } else {
        tables_sn_strict(
            master_table_number,
            originating_centre,
            originating_subcentre,
            master_table_version,
            local_table_version,
        )
    };
    let key = TableGroupKey {
        tables_root_dir: tables_root_dir.to_path_buf(),
        wmo_tables_sn: wmo,
        local_tables_sn: local,
    };
    get_table_group_by_key(&key)
}

/// Retrieve a table group for an exact key, via the process-wide cache.
pub fn get_table_group_by_key(key: &TableGroupKey) -> Result<Arc<TableGroup>, Error> {
    let mut cache = table_group_cache().lock().unwrap();
    if let Some(group) = cache.get(key) {
        return Ok(group.clone());
    }
    debug!("loading table group: {key}");
    let group = Arc::new(TableGroup::load(key.clone())?);
    while cache.len() >= MAX_CACHED_TABLE_GROUPS {
        cache.shift_remove_index(0);
    }
    cache.insert(key.clone(), group.clone());
    Ok(group)
}
