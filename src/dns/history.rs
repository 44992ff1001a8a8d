//! IXFR change history for primary zones
//!
//! Every commit appends one run of rows in IXFR canonical order: the old
//! SOA stamped with its deletion time, the deleted records (NS rows are
//! followed by their glue), the deleted signatures, then the new SOA and
//! the additions in the same shape. A secondary replaying the rows in
//! order reconstructs the zone; `changes_since` feeds the zone-transfer
//! collaborator.

use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::DnsRecord;

/// One record of change history. Deleted rows carry the deletion time;
/// added rows carry none and are dated by their commit's old-SOA row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub record: DnsRecord,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The record-level outcome of one mutation, accumulated by the engine
/// and turned into history rows at commit time.
#[derive(Debug, Default, Clone)]
pub struct CommitBatch {
    pub deleted: Vec<DnsRecord>,
    pub deleted_rrsigs: Vec<DnsRecord>,
    pub added: Vec<DnsRecord>,
    pub added_rrsigs: Vec<DnsRecord>,
}

impl CommitBatch {
    pub fn new() -> CommitBatch {
        CommitBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.deleted_rrsigs.is_empty()
            && self.added.is_empty()
            && self.added_rrsigs.is_empty()
    }

    pub fn merge(&mut self, other: CommitBatch) {
        self.deleted.extend(other.deleted);
        self.deleted_rrsigs.extend(other.deleted_rrsigs);
        self.added.extend(other.added);
        self.added_rrsigs.extend(other.added_rrsigs);
    }

    /// Drop add/delete pairs that cancel out, so a record that was removed
    /// and re-added inside one batch produces no history churn.
    pub fn normalize(&mut self) {
        let added = std::mem::take(&mut self.added);
        let mut deleted = std::mem::take(&mut self.deleted);

        let mut kept_added = Vec::with_capacity(added.len());
        for rec in added {
            if let Some(idx) = deleted.iter().position(|d| *d == rec) {
                deleted.remove(idx);
            } else {
                kept_added.push(rec);
            }
        }

        self.added = kept_added;
        self.deleted = deleted;
    }
}

/// The ordered change log of one zone.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct History {
    rows: Vec<HistoryRow>,
    /// Largest TTL that ever passed through this zone; part of the
    /// retention bound so caches have expired the pruned data.
    largest_ttl_seen: u32,
}

impl History {
    pub fn new() -> History {
        History::default()
    }

    pub fn rows(&self) -> &[HistoryRow] {
        &self.rows
    }

    pub fn clear(&mut self) {
        self.rows.clear();
    }

    /// Append one commit in IXFR order. `deleted` and `added` arrive with
    /// NS glue already expanded in place.
    #[allow(clippy::too_many_arguments)]
    pub fn append_commit(
        &mut self,
        old_soa: DnsRecord,
        deleted: Vec<DnsRecord>,
        deleted_rrsigs: Vec<DnsRecord>,
        new_soa: DnsRecord,
        added: Vec<DnsRecord>,
        added_rrsigs: Vec<DnsRecord>,
        now: DateTime<Utc>,
    ) {
        let mut largest = self
            .largest_ttl_seen
            .max(old_soa.get_ttl())
            .max(new_soa.get_ttl());

        self.rows.push(HistoryRow {
            record: old_soa,
            deleted_at: Some(now),
        });
        for record in deleted.into_iter().chain(deleted_rrsigs) {
            largest = largest.max(record.get_ttl());
            self.rows.push(HistoryRow {
                record,
                deleted_at: Some(now),
            });
        }

        self.rows.push(HistoryRow {
            record: new_soa,
            deleted_at: None,
        });
        for record in added.into_iter().chain(added_rrsigs) {
            largest = largest.max(record.get_ttl());
            self.rows.push(HistoryRow {
                record,
                deleted_at: None,
            });
        }

        self.largest_ttl_seen = largest;
    }

    /// Drop whole commits older than `2 * SOA.expire + largest TTL seen`.
    pub fn prune(&mut self, soa_expire: u32, now: DateTime<Utc>) {
        let retention = Duration::seconds(2 * i64::from(soa_expire))
            + Duration::seconds(i64::from(self.largest_ttl_seen));
        let cutoff = now - retention;

        // Commits are delimited by their old-SOA rows; keep from the first
        // commit that is still inside the retention window.
        let mut keep_from = self.rows.len();
        for (idx, row) in self.rows.iter().enumerate() {
            if let DnsRecord::Soa { .. } = row.record {
                if let Some(stamp) = row.deleted_at {
                    if stamp >= cutoff {
                        keep_from = idx;
                        break;
                    }
                }
            }
        }

        if keep_from > 0 {
            self.rows.drain(..keep_from);
        }
    }

    /// Rows a secondary at `client_serial` needs, or None when the history
    /// no longer reaches back that far (caller falls back to full transfer).
    pub fn changes_since(&self, client_serial: u32) -> Option<Vec<HistoryRow>> {
        for (idx, row) in self.rows.iter().enumerate() {
            if let DnsRecord::Soa { serial, .. } = &row.record {
                if row.deleted_at.is_some() && *serial == client_serial {
                    return Some(self.rows[idx..].to_vec());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::TransientTtl;
    use std::net::Ipv4Addr;

    fn soa(serial: u32) -> DnsRecord {
        DnsRecord::Soa {
            domain: "example.com".to_string(),
            m_name: "ns1.example.com".to_string(),
            r_name: "admin.example.com".to_string(),
            serial,
            refresh: 900,
            retry: 300,
            expire: 604800,
            minimum: 900,
            ttl: TransientTtl(900),
        }
    }

    fn a_record(domain: &str, last_octet: u8) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr: Ipv4Addr::new(192, 0, 2, last_octet),
            ttl: TransientTtl(300),
        }
    }

    #[test]
    fn test_commit_row_order() {
        let mut history = History::new();
        let now = Utc::now();

        history.append_commit(
            soa(1),
            vec![a_record("old.example.com", 1)],
            Vec::new(),
            soa(2),
            vec![a_record("new.example.com", 2)],
            Vec::new(),
            now,
        );

        let rows = history.rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].record, soa(1));
        assert!(rows[0].deleted_at.is_some());
        assert_eq!(rows[1].record, a_record("old.example.com", 1));
        assert!(rows[1].deleted_at.is_some());
        assert_eq!(rows[2].record, soa(2));
        assert!(rows[2].deleted_at.is_none());
        assert_eq!(rows[3].record, a_record("new.example.com", 2));
        assert!(rows[3].deleted_at.is_none());
    }

    #[test]
    fn test_changes_since() {
        let mut history = History::new();
        let now = Utc::now();

        history.append_commit(soa(1), vec![], vec![], soa(2), vec![a_record("a", 1)], vec![], now);
        history.append_commit(soa(2), vec![], vec![], soa(3), vec![a_record("b", 2)], vec![], now);

        let rows = history.changes_since(2).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].record, soa(2));

        let rows = history.changes_since(1).unwrap();
        assert_eq!(rows.len(), 6);

        assert!(history.changes_since(99).is_none());
    }

    #[test]
    fn test_prune_drops_expired_commits() {
        let mut history = History::new();
        let old = Utc::now() - Duration::days(60);
        let recent = Utc::now();

        history.append_commit(soa(1), vec![], vec![], soa(2), vec![a_record("a", 1)], vec![], old);
        history.append_commit(
            soa(2),
            vec![],
            vec![],
            soa(3),
            vec![a_record("b", 2)],
            vec![],
            recent,
        );

        // Retention with expire=604800 and ttl<=900 is just under 14 days.
        history.prune(604800, Utc::now());

        assert!(history.changes_since(1).is_none());
        assert!(history.changes_since(2).is_some());
    }

    #[test]
    fn test_batch_normalize_cancels_pairs() {
        let mut batch = CommitBatch::new();
        batch.deleted.push(a_record("www.example.com", 1));
        batch.deleted.push(a_record("www.example.com", 2));
        batch.added.push(a_record("www.example.com", 1));

        batch.normalize();
        assert!(batch.added.is_empty());
        assert_eq!(batch.deleted, vec![a_record("www.example.com", 2)]);
    }
}
