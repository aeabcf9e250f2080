//! Reflective lookup over the device schema and protocol-message builders.
//!
//! The schema is loaded once per controller lifetime from a JSON document
//! with the same shape as a P4Info document minus the protobuf dependency:
//! tables, match fields, actions, action params, digests, counters and
//! registers, each with a stable name/id and (where relevant) bit width
//! and match kind.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, MatchKind, SchemaError};

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDoc {
    pub tables: Vec<TableDoc>,
    #[serde(default)]
    pub digests: Vec<NamedId>,
    #[serde(default)]
    pub counters: Vec<NamedId>,
    #[serde(default)]
    pub registers: Vec<NamedId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableDoc {
    pub id: u32,
    pub name: String,
    pub match_fields: Vec<MatchFieldDoc>,
    pub actions: Vec<ActionDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchFieldDoc {
    pub id: u32,
    pub name: String,
    pub bit_width: u32,
    pub match_kind: MatchKindDoc,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchKindDoc {
    Exact,
    Lpm,
    Ternary,
    Range,
}

impl From<MatchKindDoc> for MatchKind {
    fn from(v: MatchKindDoc) -> Self {
        match v {
            MatchKindDoc::Exact => MatchKind::Exact,
            MatchKindDoc::Lpm => MatchKind::Lpm,
            MatchKindDoc::Ternary => MatchKind::Ternary,
            MatchKindDoc::Range => MatchKind::Range,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionDoc {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub params: Vec<ActionParamDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionParamDoc {
    pub id: u32,
    pub name: String,
    pub bit_width: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedId {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MatchFieldDef {
    pub id: u32,
    pub name: String,
    pub bit_width: u32,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone)]
pub struct ActionParamDef {
    pub id: u32,
    pub name: String,
    pub bit_width: u32,
}

#[derive(Debug, Clone)]
pub struct ActionDef {
    pub id: u32,
    pub name: String,
    pub params: Vec<ActionParamDef>,
}

#[derive(Debug, Clone)]
pub struct TableDef {
    pub id: u32,
    pub name: String,
    pub match_fields: Vec<MatchFieldDef>,
    pub actions: Vec<ActionDef>,
}

/// Something a caller can look a table/field/action up by.
#[derive(Debug, Clone)]
pub enum NameOrId<'a> {
    Name(&'a str),
    Id(u32),
}

/// Opaque registry of tables, match fields, actions, action params,
/// digests, counters and registers.
#[derive(Debug, Clone)]
pub struct Schema {
    tables_by_name: HashMap<String, TableDef>,
    tables_by_id: HashMap<u32, String>,
    digests: HashMap<String, u32>,
    counters: HashMap<String, u32>,
    registers: HashMap<String, u32>,
}

impl Schema {
    pub fn from_doc(doc: SchemaDoc) -> Self {
        let mut tables_by_name = HashMap::new();
        let mut tables_by_id = HashMap::new();

        for t in doc.tables {
            let match_fields = t
                .match_fields
                .into_iter()
                .map(|f| MatchFieldDef {
                    id: f.id,
                    name: f.name,
                    bit_width: f.bit_width,
                    match_kind: f.match_kind.into(),
                })
                .collect();
            let actions = t
                .actions
                .into_iter()
                .map(|a| ActionDef {
                    id: a.id,
                    name: a.name,
                    params: a
                        .params
                        .into_iter()
                        .map(|p| ActionParamDef {
                            id: p.id,
                            name: p.name,
                            bit_width: p.bit_width,
                        })
                        .collect(),
                })
                .collect();

            tables_by_id.insert(t.id, t.name.clone());
            tables_by_name.insert(
                t.name.clone(),
                TableDef {
                    id: t.id,
                    name: t.name,
                    match_fields,
                    actions,
                },
            );
        }

        let digests = doc.digests.into_iter().map(|d| (d.name, d.id)).collect();
        let counters = doc.counters.into_iter().map(|c| (c.name, c.id)).collect();
        let registers = doc.registers.into_iter().map(|r| (r.name, r.id)).collect();

        Self {
            tables_by_name,
            tables_by_id,
            digests,
            counters,
            registers,
        }
    }

    pub fn table(&self, name_or_id: NameOrId<'_>) -> Result<&TableDef, SchemaError> {
        match name_or_id {
            NameOrId::Name(name) => {
                self.tables_by_name
                    .get(name)
                    .ok_or_else(|| SchemaError::Unknown {
                        kind: EntityKind::Table,
                        name: name.to_string(),
                    })
            }
            NameOrId::Id(id) => {
                let name = self.tables_by_id.get(&id).ok_or_else(|| SchemaError::Unknown {
                    kind: EntityKind::Table,
                    name: id.to_string(),
                })?;
                self.tables_by_name.get(name).ok_or_else(|| SchemaError::Unknown {
                    kind: EntityKind::Table,
                    name: name.clone(),
                })
            }
        }
    }

    /// `field(table, name) -> {id, bit-width, match-kind}`.
    pub fn field(&self, table: &str, name: &str) -> Result<&MatchFieldDef, SchemaError> {
        let table = self.table(NameOrId::Name(table))?;
        table
            .match_fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| SchemaError::Unknown {
                kind: EntityKind::MatchField,
                name: format!("{table}.{name}", table = table.name),
            })
    }

    pub fn action(&self, table: &str, name: &str) -> Result<&ActionDef, SchemaError> {
        let table = self.table(NameOrId::Name(table))?;
        table
            .actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| SchemaError::Unknown {
                kind: EntityKind::Action,
                name: name.to_string(),
            })
    }

    pub fn digest_id(&self, name: &str) -> Result<u32, SchemaError> {
        self.digests.get(name).copied().ok_or_else(|| SchemaError::Unknown {
            kind: EntityKind::Digest,
            name: name.to_string(),
        })
    }

    pub fn counter_id(&self, name: &str) -> Result<u32, SchemaError> {
        self.counters.get(name).copied().ok_or_else(|| SchemaError::Unknown {
            kind: EntityKind::Counter,
            name: name.to_string(),
        })
    }

    pub fn register_id(&self, name: &str) -> Result<u32, SchemaError> {
        self.registers.get(name).copied().ok_or_else(|| SchemaError::Unknown {
            kind: EntityKind::Register,
            name: name.to_string(),
        })
    }
}

/// A tagged match value: a closed enum instead of dynamic-typed dispatch
/// over raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    Exact(Vec<u8>),
    Lpm { addr: Vec<u8>, prefix_len: u8 },
    Ternary { value: Vec<u8>, mask: Vec<u8> },
    Range { low: Vec<u8>, high: Vec<u8> },
}

impl MatchValue {
    fn kind(&self) -> MatchKind {
        match self {
            MatchValue::Exact(_) => MatchKind::Exact,
            MatchValue::Lpm { .. } => MatchKind::Lpm,
            MatchValue::Ternary { .. } => MatchKind::Ternary,
            MatchValue::Range { .. } => MatchKind::Range,
        }
    }
}

/// Big-endian, minimum-length encoding sized to `bit_width`.
pub fn encode_be(value: u128, bit_width: u32) -> Result<Vec<u8>, SchemaError> {
    let max_bytes = bit_width.div_ceil(8) as usize;
    let max_value: u128 = if bit_width >= 128 {
        u128::MAX
    } else {
        (1u128 << bit_width) - 1
    };
    if value > max_value {
        return Err(SchemaError::Encode {
            field: String::new(),
            bit_width,
        });
    }
    let full = value.to_be_bytes();
    Ok(full[full.len() - max_bytes..].to_vec())
}

/// Validate a [`MatchValue`] against a field's declared match kind and bit
/// width.
pub fn validate_match_value(field: &MatchFieldDef, value: &MatchValue) -> Result<(), SchemaError> {
    if value.kind() != field.match_kind {
        return Err(SchemaError::MatchKindMismatch {
            field: field.name.clone(),
            expected: field.match_kind,
            actual: value.kind(),
        });
    }

    let max_bytes = field.bit_width.div_ceil(8) as usize;
    let check = |bytes: &[u8]| -> Result<(), SchemaError> {
        if bytes.len() > max_bytes {
            return Err(SchemaError::Encode {
                field: field.name.clone(),
                bit_width: field.bit_width,
            });
        }
        Ok(())
    };

    match value {
        MatchValue::Exact(v) => check(v)?,
        MatchValue::Lpm { addr, .. } => check(addr)?,
        MatchValue::Ternary { value, mask } => {
            check(value)?;
            check(mask)?;
        }
        MatchValue::Range { low, high } => {
            check(low)?;
            check(high)?;
        }
    }

    Ok(())
}

/// Canonical, comparison-ready form of a match value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CanonicalValue {
    Ip(Ipv4Addr),
    Mac([u8; 6]),
    Int(u128),
    Str(String),
}

const IPV4_NAME_HINTS: &[&str] = &[
    "ipv4", "dstaddr", "srcaddr", "dst_ip", "src_ip", "ip", "addr",
];

fn looks_like_ipv4_field(field_name: &str) -> bool {
    let lower = field_name.to_ascii_lowercase();
    IPV4_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

fn bytes_to_uint(bytes: &[u8]) -> u128 {
    let mut acc: u128 = 0;
    for b in bytes {
        acc = (acc << 8) | *b as u128;
    }
    acc
}

/// Canonicalize a raw byte string: 4 bytes under an IPv4-named field
/// become a dotted quad, 6 bytes become a colon-separated lowercase MAC,
/// anything else becomes an unsigned integer.
pub fn canonicalize_bytes(field_name: &str, bytes: &[u8]) -> CanonicalValue {
    if bytes.len() == 4 && looks_like_ipv4_field(field_name) {
        return CanonicalValue::Ip(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
    }
    if bytes.len() == 6 {
        let mac = [
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
        ];
        return CanonicalValue::Mac(mac);
    }
    CanonicalValue::Int(bytes_to_uint(bytes))
}

/// Canonicalize a [`MatchValue`]; LPM canonicalizes on the address part,
/// tuples (ternary/range) are reduced to their first byte string for
/// equality purposes per the upsert-comparison use.
pub fn canonicalize(field: &MatchFieldDef, value: &MatchValue) -> CanonicalValue {
    match value {
        MatchValue::Exact(bytes) => canonicalize_bytes(&field.name, bytes),
        MatchValue::Lpm { addr, .. } => canonicalize_bytes(&field.name, addr),
        MatchValue::Ternary { value, .. } => canonicalize_bytes(&field.name, value),
        MatchValue::Range { low, .. } => canonicalize_bytes(&field.name, low),
    }
}

pub fn canonicalize_str(s: &str) -> CanonicalValue {
    CanonicalValue::Str(s.to_ascii_lowercase())
}

/// A fully populated table-entry value.
#[derive(Debug, Clone, PartialEq)]
pub struct TableEntry {
    pub table_id: u32,
    pub table_name: String,
    pub matches: Vec<(u32, MatchValue)>,
    pub action: Option<ActionInvocation>,
    pub priority: Option<i32>,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionInvocation {
    pub action_id: u32,
    pub params: Vec<(u32, Vec<u8>)>,
}

pub struct BuildTableEntry<'a> {
    pub table: &'a str,
    pub matches: Vec<(&'a str, MatchValue)>,
    pub action: Option<&'a str>,
    pub action_params: Vec<(&'a str, u128)>,
    pub priority: Option<i32>,
    pub is_default: bool,
}

impl Schema {
    /// `buildTableEntry(...)`: every match key must be a declared field of
    /// the table, every value must fit its bit width, and ternary/range
    /// entries require a priority.
    pub fn build_table_entry(&self, spec: BuildTableEntry<'_>) -> Result<TableEntry, SchemaError> {
        let table = self.table(NameOrId::Name(spec.table))?;

        let mut matches = Vec::with_capacity(spec.matches.len());
        for (name, value) in spec.matches {
            let field = self.field(spec.table, name)?;
            validate_match_value(field, &value)?;
            if matches!(field.match_kind, MatchKind::Ternary | MatchKind::Range) && spec.priority.is_none() {
                return Err(SchemaError::MissingPriority {
                    field: field.name.clone(),
                });
            }
            matches.push((field.id, value));
        }

        let action = match spec.action {
            None => None,
            Some(action_name) => {
                let action_def = self.action(spec.table, action_name)?;
                let mut params = Vec::with_capacity(spec.action_params.len());
                for (pname, pvalue) in &spec.action_params {
                    let param = action_def
                        .params
                        .iter()
                        .find(|p| &p.name == pname)
                        .ok_or_else(|| SchemaError::Unknown {
                            kind: EntityKind::ActionParam,
                            name: (*pname).to_string(),
                        })?;
                    let encoded = encode_be(*pvalue, param.bit_width).map_err(|_| SchemaError::Encode {
                        field: param.name.clone(),
                        bit_width: param.bit_width,
                    })?;
                    params.push((param.id, encoded));
                }
                Some(ActionInvocation {
                    action_id: action_def.id,
                    params,
                })
            }
        };

        Ok(TableEntry {
            table_id: table.id,
            table_name: table.name.clone(),
            matches,
            action,
            priority: spec.priority,
            is_default: spec.is_default,
        })
    }
}

/// `buildPacketOut(payload, metadata-map)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketOut {
    pub payload: Vec<u8>,
    pub metadata: Vec<(u32, Vec<u8>)>,
}

impl Schema {
    pub fn build_packet_out(&self, payload: Vec<u8>, metadata: Vec<(u32, Vec<u8>)>) -> PacketOut {
        PacketOut { payload, metadata }
    }
}

/// `buildDigestEntry(digest-name)` with the fixed digest configuration.
pub const DIGEST_MAX_TIMEOUT_NS: u64 = 100_000_000;
pub const DIGEST_MAX_LIST_SIZE: u32 = 10;
pub const DIGEST_ACK_TIMEOUT_NS: u64 = 500_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct DigestEntry {
    pub digest_id: u32,
    pub max_timeout_ns: u64,
    pub max_list_size: u32,
    pub ack_timeout_ns: u64,
}

impl Schema {
    pub fn build_digest_entry(&self, digest_name: &str) -> Result<DigestEntry, SchemaError> {
        Ok(DigestEntry {
            digest_id: self.digest_id(digest_name)?,
            max_timeout_ns: DIGEST_MAX_TIMEOUT_NS,
            max_list_size: DIGEST_MAX_LIST_SIZE,
            ack_timeout_ns: DIGEST_ACK_TIMEOUT_NS,
        })
    }
}

/// `buildMulticastEntry(group-id, replicas)`.
#[derive(Debug, Clone, PartialEq)]
pub struct MulticastReplica {
    pub port: u32,
    pub instance: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MulticastEntry {
    pub group_id: u32,
    pub replicas: Vec<MulticastReplica>,
}

pub fn build_multicast_entry(group_id: u32, replicas: Vec<MulticastReplica>) -> MulticastEntry {
    MulticastEntry { group_id, replicas }
}

/// Decoded counter or register read: a byte/packet count pair, the return
/// shape of `SwitchSession::read_counters`/`read_registers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub byte_count: u64,
    pub packet_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        let doc = SchemaDoc {
            tables: vec![TableDoc {
                id: 1,
                name: "ipv4_lpm".into(),
                match_fields: vec![MatchFieldDoc {
                    id: 1,
                    name: "hdr.ipv4.dstAddr".into(),
                    bit_width: 32,
                    match_kind: MatchKindDoc::Lpm,
                }],
                actions: vec![ActionDoc {
                    id: 1,
                    name: "ipv4_forward".into(),
                    params: vec![
                        ActionParamDoc {
                            id: 1,
                            name: "dstAddr".into(),
                            bit_width: 48,
                        },
                        ActionParamDoc {
                            id: 2,
                            name: "port".into(),
                            bit_width: 9,
                        },
                    ],
                }],
            }],
            digests: vec![NamedId {
                id: 1,
                name: "congestion_digest_t".into(),
            }],
            counters: vec![],
            registers: vec![],
        };
        Schema::from_doc(doc)
    }

    #[test]
    fn resolves_table_by_name_and_id() {
        let schema = sample_schema();
        let by_name = schema.table(NameOrId::Name("ipv4_lpm")).unwrap();
        let by_id = schema.table(NameOrId::Id(1)).unwrap();
        assert_eq!(by_name.id, by_id.id);
    }

    #[test]
    fn unknown_table_errors() {
        let schema = sample_schema();
        let err = schema.table(NameOrId::Name("nope")).unwrap_err();
        assert!(matches!(err, SchemaError::Unknown { .. }));
    }

    #[test]
    fn lpm_entry_requires_priority_only_for_ternary_and_range() {
        let schema = sample_schema();
        let entry = schema
            .build_table_entry(BuildTableEntry {
                table: "ipv4_lpm",
                matches: vec![(
                    "hdr.ipv4.dstAddr",
                    MatchValue::Lpm {
                        addr: vec![10, 0, 1, 2],
                        prefix_len: 32,
                    },
                )],
                action: Some("ipv4_forward"),
                action_params: vec![("dstAddr", 0xaabbccddeeff), ("port", 3)],
                priority: None,
                is_default: false,
            })
            .unwrap();
        assert_eq!(entry.action.unwrap().params[1].1, encode_be(3, 9).unwrap());
    }

    #[test]
    fn encode_out_of_range_is_encode_error() {
        assert!(encode_be(1 << 9, 9).is_err());
    }

    #[test]
    fn canonicalize_round_trip_ipv4_and_mac() {
        assert_eq!(
            canonicalize_bytes("hdr.ipv4.dstAddr", &[10, 0, 1, 2]),
            CanonicalValue::Ip(Ipv4Addr::new(10, 0, 1, 2))
        );
        assert_eq!(
            canonicalize_bytes("eth_dst", &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            CanonicalValue::Mac([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
    }

    #[test]
    fn non_ipv4_named_four_byte_field_is_integer() {
        // Invariant 5 only promises the IPv4/MAC shortcuts for name-matched
        // fields; an unrelated 4-byte field stays a plain integer.
        assert_eq!(
            canonicalize_bytes("meta.counter", &[0, 0, 1, 0]),
            CanonicalValue::Int(256)
        );
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Invariant 5: canonicalizing a 4-byte value on an IPv4-named field
        /// always yields the dotted-quad interpretation of those bytes.
        #[test]
        fn four_byte_ipv4_named_field_canonicalizes_to_dotted_quad(bytes in prop::array::uniform4(any::<u8>())) {
            let canon = canonicalize_bytes("hdr.ipv4.dstAddr", &bytes);
            prop_assert_eq!(
                canon,
                CanonicalValue::Ip(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            );
        }

        /// Invariant 5: canonicalizing any 6-byte value always yields the MAC
        /// interpretation of those exact bytes, field name notwithstanding.
        #[test]
        fn six_byte_field_canonicalizes_to_mac(bytes in prop::array::uniform6(any::<u8>())) {
            let canon = canonicalize_bytes("whatever", &bytes);
            prop_assert_eq!(canon, CanonicalValue::Mac(bytes));
        }

        /// `encode_be` round-trips: decoding the minimum-length big-endian
        /// bytes it produces reconstructs the original value.
        #[test]
        fn encode_be_round_trips(value in 0u128..=0xffff_ffffu128, bit_width in 32u32..64u32) {
            let bytes = encode_be(value, bit_width).unwrap();
            prop_assert_eq!(bytes_to_uint(&bytes), value);
        }
    }
}
