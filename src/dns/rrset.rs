//! RRSet storage for a single zone node
//!
//! Records are grouped by type into RRSets that keep the invariants the
//! rest of the engine relies on: one TTL per set, no duplicate rdata, and
//! singleton SOA/CNAME sets. Every mutating operation returns the records
//! it displaced so the committer can write history rows for them.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::{DnsRecord, QueryType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RRSetError {
    /// Records in one set must share a TTL.
    TtlMismatch,
    /// Records in one set must be of the keyed type.
    TypeMismatch,
    /// Two records in one set carry identical rdata.
    DuplicateRdata,
    /// SOA and CNAME sets hold exactly one record.
    SingletonViolated(QueryType),
}

impl fmt::Display for RRSetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRSetError::TtlMismatch => write!(f, "records in an RRSet must share one TTL"),
            RRSetError::TypeMismatch => write!(f, "record type does not match the RRSet"),
            RRSetError::DuplicateRdata => write!(f, "duplicate rdata in RRSet"),
            RRSetError::SingletonViolated(qtype) => {
                write!(f, "{:?} RRSet must contain exactly one record", qtype)
            }
        }
    }
}

impl Error for RRSetError {}

type Result<T> = std::result::Result<T, RRSetError>;

/// A record plus its side-channel info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub record: DnsRecord,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ZoneRecord {
    pub fn new(record: DnsRecord) -> ZoneRecord {
        ZoneRecord {
            record,
            disabled: false,
            comment: None,
        }
    }
}

impl From<DnsRecord> for ZoneRecord {
    fn from(record: DnsRecord) -> ZoneRecord {
        ZoneRecord::new(record)
    }
}

/// The ordered set of records sharing (owner, type).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRSet {
    records: Vec<ZoneRecord>,
}

impl RRSet {
    pub fn records(&self) -> impl Iterator<Item = &DnsRecord> {
        self.records.iter().map(|zr| &zr.record)
    }

    pub fn zone_records(&self) -> &[ZoneRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ttl(&self) -> u32 {
        self.records.first().map(|zr| zr.record.get_ttl()).unwrap_or(0)
    }

    pub fn to_records(&self) -> Vec<DnsRecord> {
        self.records().cloned().collect()
    }

    fn validate(qtype: QueryType, records: &[ZoneRecord]) -> Result<()> {
        if matches!(qtype, QueryType::Soa | QueryType::Cname) && records.len() > 1 {
            return Err(RRSetError::SingletonViolated(qtype));
        }

        let mut ttl = None;
        for (i, zr) in records.iter().enumerate() {
            if zr.record.get_querytype() != qtype {
                return Err(RRSetError::TypeMismatch);
            }
            match ttl {
                None => ttl = Some(zr.record.get_ttl()),
                Some(t) if t != zr.record.get_ttl() => return Err(RRSetError::TtlMismatch),
                _ => {}
            }
            // Equality here ignores TTL, so this is an rdata comparison.
            if records[..i].iter().any(|prev| prev.record == zr.record) {
                return Err(RRSetError::DuplicateRdata);
            }
        }

        Ok(())
    }
}

/// The per-node map from record type to RRSet.
///
/// All operations are performed under the zone tree's write lock, so a
/// reader observes either the previous or the new RRSet, never a partially
/// mutated one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneEntries {
    entries: BTreeMap<QueryType, RRSet>,
}

impl ZoneEntries {
    pub fn new() -> ZoneEntries {
        ZoneEntries::default()
    }

    pub fn get(&self, qtype: QueryType) -> Option<&RRSet> {
        self.entries.get(&qtype)
    }

    pub fn types(&self) -> impl Iterator<Item = QueryType> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueryType, &RRSet)> {
        self.entries.iter().map(|(t, set)| (*t, set))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing but denial records and their signatures remain.
    pub fn has_only_dnssec_records(&self) -> bool {
        self.entries
            .keys()
            .all(|t| matches!(t, QueryType::Nsec | QueryType::Nsec3 | QueryType::Rrsig))
    }

    /// Replace the RRSet of `qtype`, returning the prior records.
    pub fn set(&mut self, qtype: QueryType, records: Vec<ZoneRecord>) -> Result<Vec<DnsRecord>> {
        RRSet::validate(qtype, &records)?;

        let prior = if records.is_empty() {
            self.entries.remove(&qtype)
        } else {
            self.entries.insert(qtype, RRSet { records })
        };

        Ok(prior.map(|set| set.to_records()).unwrap_or_default())
    }

    /// Append one record to its RRSet; returns false when the rdata is
    /// already present. The incoming TTL is coerced to the set's TTL.
    pub fn add(&mut self, record: ZoneRecord) -> Result<bool> {
        let qtype = record.record.get_querytype();
        let set = self.entries.entry(qtype).or_default();

        if set.records.iter().any(|zr| zr.record == record.record) {
            return Ok(false);
        }
        if matches!(qtype, QueryType::Soa | QueryType::Cname) && !set.records.is_empty() {
            return Err(RRSetError::SingletonViolated(qtype));
        }

        let mut record = record;
        if let Some(ttl) = set.records.first().map(|zr| zr.record.get_ttl()) {
            record.record.set_ttl(ttl);
        }
        set.records.push(record);
        Ok(true)
    }

    /// Remove the whole RRSet of `qtype`.
    pub fn delete(&mut self, qtype: QueryType) -> Vec<DnsRecord> {
        self.entries
            .remove(&qtype)
            .map(|set| set.to_records())
            .unwrap_or_default()
    }

    /// Remove the record with matching rdata from the RRSet of its type.
    pub fn delete_record(&mut self, record: &DnsRecord) -> Option<DnsRecord> {
        let qtype = record.get_querytype();
        let set = self.entries.get_mut(&qtype)?;

        let idx = set.records.iter().position(|zr| zr.record == *record)?;
        let removed = set.records.remove(idx).record;
        if set.records.is_empty() {
            self.entries.remove(&qtype);
        }
        Some(removed)
    }

    /// Install signatures, replacing any existing RRSIG covering the same
    /// types. Returns the replaced signatures.
    pub fn add_or_update_rrsigs(&mut self, rrsigs: Vec<DnsRecord>) -> Vec<DnsRecord> {
        let covered: Vec<QueryType> = rrsigs
            .iter()
            .filter_map(|r| match r {
                DnsRecord::Rrsig { type_covered, .. } => Some(*type_covered),
                _ => None,
            })
            .collect();

        let mut replaced = Vec::new();
        if let Some(set) = self.entries.get_mut(&QueryType::Rrsig) {
            let mut kept = Vec::new();
            for zr in set.records.drain(..) {
                match &zr.record {
                    DnsRecord::Rrsig { type_covered, .. } if covered.contains(type_covered) => {
                        replaced.push(zr.record);
                    }
                    _ => kept.push(zr),
                }
            }
            set.records = kept;
        }

        let set = self.entries.entry(QueryType::Rrsig).or_default();
        for rrsig in rrsigs {
            set.records.push(ZoneRecord::new(rrsig));
        }
        if set.records.is_empty() {
            self.entries.remove(&QueryType::Rrsig);
        }

        replaced
    }

    /// Drop every RRSIG whose covered type matches; returns them.
    pub fn delete_rrsigs_covering(&mut self, qtype: QueryType) -> Vec<DnsRecord> {
        self.take_rrsigs(|type_covered, _| type_covered == qtype)
    }

    /// Drop every RRSIG produced by the given key tag; returns them.
    pub fn delete_rrsigs_by_key_tag(&mut self, tag: u16) -> Vec<DnsRecord> {
        self.take_rrsigs(|_, key_tag| key_tag == tag)
    }

    fn take_rrsigs<F>(&mut self, matches: F) -> Vec<DnsRecord>
    where
        F: Fn(QueryType, u16) -> bool,
    {
        let mut taken = Vec::new();
        if let Some(set) = self.entries.get_mut(&QueryType::Rrsig) {
            let mut kept = Vec::new();
            for zr in set.records.drain(..) {
                match &zr.record {
                    DnsRecord::Rrsig {
                        type_covered,
                        key_tag,
                        ..
                    } if matches(*type_covered, *key_tag) => taken.push(zr.record),
                    _ => kept.push(zr),
                }
            }
            set.records = kept;
            if set.records.is_empty() {
                self.entries.remove(&QueryType::Rrsig);
            }
        }
        taken
    }

    /// The types present at this node, as a denial-chain bitmap wants them:
    /// every stored type including RRSIG and the denial records themselves.
    pub fn present_types(&self) -> Vec<QueryType> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::TransientTtl;
    use std::net::Ipv4Addr;

    fn a_record(domain: &str, last_octet: u8, ttl: u32) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr: Ipv4Addr::new(192, 0, 2, last_octet),
            ttl: TransientTtl(ttl),
        }
    }

    #[test]
    fn test_set_returns_prior_records() {
        let mut entries = ZoneEntries::new();

        let prior = entries
            .set(QueryType::A, vec![a_record("www.example.com", 1, 300).into()])
            .unwrap();
        assert!(prior.is_empty());

        let prior = entries
            .set(QueryType::A, vec![a_record("www.example.com", 2, 300).into()])
            .unwrap();
        assert_eq!(prior, vec![a_record("www.example.com", 1, 300)]);
    }

    #[test]
    fn test_set_rejects_mixed_ttl() {
        let mut entries = ZoneEntries::new();
        let result = entries.set(
            QueryType::A,
            vec![
                a_record("www.example.com", 1, 300).into(),
                a_record("www.example.com", 2, 600).into(),
            ],
        );
        assert_eq!(result, Err(RRSetError::TtlMismatch));
    }

    #[test]
    fn test_set_rejects_duplicate_rdata() {
        let mut entries = ZoneEntries::new();
        let result = entries.set(
            QueryType::A,
            vec![
                a_record("www.example.com", 1, 300).into(),
                // Same rdata, different TTL: still a duplicate because TTL is
                // transparent to record equality.
                a_record("www.example.com", 1, 300).into(),
            ],
        );
        assert_eq!(result, Err(RRSetError::DuplicateRdata));
    }

    #[test]
    fn test_cname_is_singleton() {
        let mut entries = ZoneEntries::new();
        let cname = |host: &str| DnsRecord::Cname {
            domain: "alias.example.com".to_string(),
            host: host.to_string(),
            ttl: TransientTtl(300),
        };

        entries.add(cname("a.example.com").into()).unwrap();
        let result = entries.add(cname("b.example.com").into());
        assert_eq!(result, Err(RRSetError::SingletonViolated(QueryType::Cname)));
    }

    #[test]
    fn test_add_coerces_ttl_and_detects_duplicates() {
        let mut entries = ZoneEntries::new();
        entries.add(a_record("www.example.com", 1, 300).into()).unwrap();

        let appended = entries.add(a_record("www.example.com", 2, 999).into()).unwrap();
        assert!(appended);
        let set = entries.get(QueryType::A).unwrap();
        assert!(set.records().all(|r| r.get_ttl() == 300));

        let appended = entries.add(a_record("www.example.com", 1, 300).into()).unwrap();
        assert!(!appended);
    }

    #[test]
    fn test_delete_record_drops_empty_set() {
        let mut entries = ZoneEntries::new();
        let rec = a_record("www.example.com", 1, 300);
        entries.add(rec.clone().into()).unwrap();

        let removed = entries.delete_record(&rec);
        assert_eq!(removed, Some(rec));
        assert!(entries.get(QueryType::A).is_none());
    }

    #[test]
    fn test_has_only_dnssec_records() {
        let mut entries = ZoneEntries::new();
        entries
            .add(
                DnsRecord::Nsec {
                    domain: "www.example.com".to_string(),
                    next_name: "example.com".to_string(),
                    types: vec![QueryType::A],
                    ttl: TransientTtl(900),
                }
                .into(),
            )
            .unwrap();
        assert!(entries.has_only_dnssec_records());

        entries.add(a_record("www.example.com", 1, 300).into()).unwrap();
        assert!(!entries.has_only_dnssec_records());
    }

    #[test]
    fn test_rrsig_replacement_by_covered_type() {
        let mut entries = ZoneEntries::new();
        let rrsig = |covered: QueryType, tag: u16| DnsRecord::Rrsig {
            domain: "example.com".to_string(),
            type_covered: covered,
            algorithm: 13,
            labels: 2,
            original_ttl: 300,
            expiration: 100,
            inception: 0,
            key_tag: tag,
            signer_name: "example.com".to_string(),
            signature: vec![1, 2, 3],
            ttl: TransientTtl(300),
        };

        entries.add_or_update_rrsigs(vec![rrsig(QueryType::A, 1), rrsig(QueryType::Mx, 1)]);
        let replaced = entries.add_or_update_rrsigs(vec![rrsig(QueryType::A, 2)]);

        assert_eq!(replaced, vec![rrsig(QueryType::A, 1)]);
        let remaining: Vec<DnsRecord> = entries.get(QueryType::Rrsig).unwrap().to_records();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&rrsig(QueryType::Mx, 1)));
        assert!(remaining.contains(&rrsig(QueryType::A, 2)));
    }
}
