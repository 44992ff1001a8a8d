//! Primary zone engine
//!
//! `PrimaryZone` is the single entry point for mutating an authoritative
//! zone: record set/add/update/delete, whole-zone signing and unsigning,
//! denial-chain conversion, and the key verbs. Every successful mutation
//! runs through one committer that bumps the SOA serial, re-signs the SOA,
//! appends IXFR history, persists through the save callback and arms the
//! NOTIFY dispatcher. Readers of the shared zone tree observe commits
//! atomically.
//!
//! Lock order, outermost first: DNSSEC-update, zone tree, key registry,
//! history, notify in-flight set. No lock is held across network IO; the
//! parent-DS probe and NOTIFY sends run on their own threads.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::dns::authority::{Authority, ZoneTree};
use crate::dns::client::DnsNetworkClient;
use crate::dns::denial::{
    disable_nsec, disable_nsec3, enable_nsec, enable_nsec3, relink_nsec, relink_nsec3,
    validate_nsec3_params, MAX_NSEC3_SALT_LEN,
};
use crate::dns::dnssec::{
    sign_rrset, DnssecAlgorithm, DnssecKey, KeyState, KeyType, SigningContext,
};
use crate::dns::errors::{ZoneError, ZoneResult};
use crate::dns::history::{CommitBatch, History, HistoryRow};
use crate::dns::key_lifecycle::{
    due_actions, retire_is_safe, KeyRegistry, LifecycleAction, LifecycleTimer,
    TAG_COLLISION_RETRIES,
};
use crate::dns::notify::{NotifyDispatcher, NotifyJob, NotifyPolicy};
use crate::dns::protocol::{DnsPacket, DnsRecord, DomainName, QueryType, ResultCode};
use crate::dns::rrset::ZoneRecord;

/// DNSSEC posture of a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnssecStatus {
    Unsigned,
    SignedWithNsec,
    SignedWithNsec3,
}

/// Which secondaries may transfer the zone. The engine only stores this;
/// enforcement lives with the query-serving collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneTransferPolicy {
    Deny,
    AllowZoneNameServers,
    AllowAny,
}

/// Requested denial-of-existence flavor for `sign_zone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NxProof {
    Nsec,
    Nsec3 { iterations: u16, salt_length: usize },
}

/// Operator-facing zone settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Internal zones keep no history and never bump their serial.
    pub internal: bool,
    pub disabled: bool,
    pub transfer_policy: ZoneTransferPolicy,
    pub notify_policy: NotifyPolicy,
    /// Targets for the SpecifiedNameServers notify policy.
    pub notify_name_servers: Vec<SocketAddr>,
    /// Parent-zone servers asked for the DS RRSet during KSK activation.
    pub parent_servers: Vec<SocketAddr>,
    /// TSIG key names allowed to transfer this zone.
    pub tsig_key_names: Vec<String>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        ZoneConfig {
            internal: false,
            disabled: false,
            transfer_policy: ZoneTransferPolicy::Deny,
            notify_policy: NotifyPolicy::ZoneNameServers,
            notify_name_servers: Vec::new(),
            parent_servers: Vec::new(),
            tsig_key_names: Vec::new(),
        }
    }
}

/// DNSSEC parameters while the zone is signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DnssecParams {
    status: DnssecStatus,
    dnskey_ttl: u32,
    zsk_rollover_days: u32,
    nsec3_iterations: u16,
    nsec3_salt: Vec<u8>,
    last_refresh_check: DateTime<Utc>,
}

impl Default for DnssecParams {
    fn default() -> Self {
        DnssecParams {
            status: DnssecStatus::Unsigned,
            dnskey_ttl: 86400,
            zsk_rollover_days: 90,
            nsec3_iterations: 0,
            nsec3_salt: Vec::new(),
            last_refresh_check: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Snapshot of one key for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyProperties {
    pub key_tag: u16,
    pub key_type: KeyType,
    pub algorithm: DnssecAlgorithm,
    pub state: KeyState,
    pub state_changed_at: DateTime<Utc>,
    pub is_retiring: bool,
}

/// Snapshot of the zone for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneProperties {
    pub apex: String,
    pub status: DnssecStatus,
    pub serial: u32,
    pub internal: bool,
    pub disabled: bool,
    pub keys: Vec<KeyProperties>,
}

type SaveZoneFn = Box<dyn Fn(&DomainName) + Send + Sync>;

/// An authoritative primary zone and its DNSSEC machinery.
pub struct PrimaryZone {
    apex: DomainName,
    authority: Arc<Authority>,
    config: RwLock<ZoneConfig>,
    dnssec: RwLock<DnssecParams>,
    keys: Mutex<KeyRegistry>,
    history: Mutex<History>,
    notify: NotifyDispatcher,
    /// Serializes whole-zone DNSSEC work and, with it, commits.
    dnssec_update_lock: Mutex<()>,
    timer: Mutex<Option<LifecycleTimer>>,
    save_zone: RwLock<Option<SaveZoneFn>>,
}

impl PrimaryZone {
    /// Create a primary zone seeded with its SOA record.
    pub fn new(
        authority: &Arc<Authority>,
        apex: &str,
        soa: DnsRecord,
        config: ZoneConfig,
    ) -> ZoneResult<Arc<PrimaryZone>> {
        let apex = DomainName::new(apex);
        match &soa {
            DnsRecord::Soa { domain, .. } if DomainName::new(domain) == apex => {}
            _ => {
                return Err(ZoneError::InvalidOperation {
                    zone: apex.as_str().to_string(),
                    detail: "zone must be created with an SOA at its apex".to_string(),
                })
            }
        }

        {
            let mut tree = authority.write();
            let node = tree.get_or_create(&apex);
            node.entries
                .set(QueryType::Soa, vec![ZoneRecord::new(soa)])
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
        }

        log::info!("created primary zone {}", apex);
        Ok(Arc::new(PrimaryZone {
            notify: NotifyDispatcher::new(apex.as_str()),
            apex,
            authority: Arc::clone(authority),
            config: RwLock::new(config),
            dnssec: RwLock::new(DnssecParams::default()),
            keys: Mutex::new(KeyRegistry::new()),
            history: Mutex::new(History::new()),
            dnssec_update_lock: Mutex::new(()),
            timer: Mutex::new(None),
            save_zone: RwLock::new(None),
        }))
    }

    pub fn apex(&self) -> &DomainName {
        &self.apex
    }

    pub fn status(&self) -> DnssecStatus {
        self.dnssec.read().status
    }

    pub fn config(&self) -> ZoneConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ZoneConfig) {
        let was_enabled = !self.config.read().disabled;
        if was_enabled && config.disabled {
            // Disabling the zone freezes NOTIFYs.
            self.notify.cancel_pending();
        }
        *self.config.write() = config;
    }

    /// Install the persistence callback invoked after every commit.
    pub fn set_save_callback<F>(&self, callback: F)
    where
        F: Fn(&DomainName) + Send + Sync + 'static,
    {
        *self.save_zone.write() = Some(Box::new(callback));
    }

    pub fn serial(&self) -> u32 {
        let tree = self.authority.read();
        match self.soa_record(&tree) {
            Ok(DnsRecord::Soa { serial, .. }) => serial,
            _ => 0,
        }
    }

    /// Stop timers and freeze pending NOTIFYs. In-flight sends drain on
    /// their own timeout.
    pub fn dispose(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        self.notify.cancel_pending();
        log::info!("disposed zone {}", self.apex);
    }

    // -----------------------------------------------------------------
    // Public mutation API
    // -----------------------------------------------------------------

    /// Replace the RRSet of (owner, type).
    pub fn set_records(&self, records: Vec<ZoneRecord>) -> ZoneResult<()> {
        let first = records.first().ok_or_else(|| ZoneError::InvalidRRSet {
            zone: self.apex.as_str().to_string(),
            detail: "empty record set".to_string(),
        })?;
        let owner = first.record.name();
        let qtype = first.record.get_querytype();

        let _update = self.dnssec_update_lock.lock();
        let mut tree = self.authority.write();
        self.validate_mutation(&tree, &owner, qtype, &records)?;

        if qtype == QueryType::Soa {
            return self.set_soa_locked(tree, records);
        }

        let mut batch = CommitBatch::new();
        {
            let node = tree.get_or_create(&owner);
            let prior = node
                .entries
                .set(qtype, records.clone())
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            batch.deleted.extend(prior);
            batch
                .added
                .extend(records.iter().map(|zr| zr.record.clone()));
        }

        self.after_store_mutation(&mut tree, &owner, qtype, &mut batch)?;
        self.commit_and_publish(tree, batch)
    }

    /// Append one record to its RRSet.
    pub fn add_record(&self, record: ZoneRecord) -> ZoneResult<()> {
        let owner = record.record.name();
        let qtype = record.record.get_querytype();

        let _update = self.dnssec_update_lock.lock();
        let mut tree = self.authority.write();
        self.validate_mutation(&tree, &owner, qtype, std::slice::from_ref(&record))?;

        if qtype == QueryType::Soa {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "SOA can only be replaced, not appended".to_string(),
            });
        }

        let mut batch = CommitBatch::new();
        let appended = {
            let node = tree.get_or_create(&owner);
            node.entries
                .add(record.clone())
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?
        };
        if !appended {
            return Err(ZoneError::InvalidRRSet {
                zone: self.apex.as_str().to_string(),
                detail: "record already present".to_string(),
            });
        }
        batch.added.push(record.record);

        self.after_store_mutation(&mut tree, &owner, qtype, &mut batch)?;
        self.commit_and_publish(tree, batch)
    }

    /// Replace one record's rdata in place.
    pub fn update_record(&self, old: DnsRecord, new: ZoneRecord) -> ZoneResult<()> {
        let owner = old.name();
        let new_owner = new.record.name();
        let qtype = old.get_querytype();

        if qtype != new.record.get_querytype() {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "update cannot change the record type".to_string(),
            });
        }

        let _update = self.dnssec_update_lock.lock();
        let mut tree = self.authority.write();
        self.validate_mutation(&tree, &new_owner, qtype, std::slice::from_ref(&new))?;

        let mut batch = CommitBatch::new();
        {
            let node = tree
                .find_exact_mut(&owner)
                .ok_or_else(|| ZoneError::InvalidOperation {
                    zone: self.apex.as_str().to_string(),
                    detail: format!("no records at {}", owner),
                })?;
            let removed =
                node.entries
                    .delete_record(&old)
                    .ok_or_else(|| ZoneError::InvalidOperation {
                        zone: self.apex.as_str().to_string(),
                        detail: format!("record to update not found at {}", owner),
                    })?;
            batch.deleted.push(removed);
        }
        {
            let node = tree.get_or_create(&new_owner);
            node.entries
                .add(new.clone())
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            batch.added.push(new.record);
        }

        self.after_store_mutation(&mut tree, &owner, qtype, &mut batch)?;
        if new_owner != owner {
            self.after_store_mutation(&mut tree, &new_owner, qtype, &mut batch)?;
        }
        self.commit_and_publish(tree, batch)
    }

    /// Delete one record by rdata.
    pub fn delete_record(&self, record: &DnsRecord) -> ZoneResult<()> {
        let owner = record.name();
        let qtype = record.get_querytype();

        let _update = self.dnssec_update_lock.lock();
        let mut tree = self.authority.write();
        self.validate_deletion(&owner, qtype)?;

        let mut batch = CommitBatch::new();
        let removed = tree
            .find_exact_mut(&owner)
            .and_then(|node| node.entries.delete_record(record));
        match removed {
            Some(removed) => batch.deleted.push(removed),
            None => {
                return Err(ZoneError::InvalidOperation {
                    zone: self.apex.as_str().to_string(),
                    detail: format!("record not found at {}", owner),
                })
            }
        }

        self.after_store_mutation(&mut tree, &owner, qtype, &mut batch)?;
        self.commit_and_publish(tree, batch)
    }

    /// Delete the whole RRSet of (owner, type).
    pub fn delete_records(&self, owner: &str, qtype: QueryType) -> ZoneResult<()> {
        let owner = DomainName::new(owner);

        let _update = self.dnssec_update_lock.lock();
        let mut tree = self.authority.write();
        self.validate_deletion(&owner, qtype)?;

        let mut batch = CommitBatch::new();
        if let Some(node) = tree.find_exact_mut(&owner) {
            batch.deleted.extend(node.entries.delete(qtype));
            batch
                .deleted_rrsigs
                .extend(node.entries.delete_rrsigs_covering(qtype));
        }
        if batch.is_empty() {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: format!("no {:?} RRSet at {}", qtype, owner),
            });
        }

        self.after_store_mutation(&mut tree, &owner, qtype, &mut batch)?;
        self.commit_and_publish(tree, batch)
    }

    fn validate_deletion(&self, owner: &DomainName, qtype: QueryType) -> ZoneResult<()> {
        let zone = self.apex.as_str().to_string();
        if qtype.is_dnssec_managed() {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: format!("{:?} records are managed by the DNSSEC engine", qtype),
            });
        }
        if qtype == QueryType::Soa {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: "the apex SOA cannot be deleted".to_string(),
            });
        }
        if !owner.is_subdomain_of(&self.apex) {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: format!("{} is outside the zone", owner),
            });
        }
        Ok(())
    }

    fn validate_mutation(
        &self,
        tree: &ZoneTree,
        owner: &DomainName,
        qtype: QueryType,
        records: &[ZoneRecord],
    ) -> ZoneResult<()> {
        let zone = self.apex.as_str().to_string();
        let signed = self.status() != DnssecStatus::Unsigned;

        if qtype.is_dnssec_managed() {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: format!("{:?} records are managed by the DNSSEC engine", qtype),
            });
        }
        if !owner.is_subdomain_of(&self.apex) {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: format!("{} is outside the zone", owner),
            });
        }
        if *owner == self.apex && matches!(qtype, QueryType::Cname | QueryType::Ds) {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: format!("{:?} cannot exist at the zone apex", qtype),
            });
        }
        if signed && matches!(qtype, QueryType::Aname | QueryType::App) {
            return Err(ZoneError::UnsupportedInSignedZone {
                zone,
                qtype: format!("{:?}", qtype),
            });
        }
        if signed && records.iter().any(|zr| zr.disabled) {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: "disabled records cannot be added to a signed zone".to_string(),
            });
        }

        // Every record TTL stays at or below the SOA expire interval.
        let expire = match qtype {
            QueryType::Soa => match &records[0].record {
                DnsRecord::Soa { expire, .. } => *expire,
                _ => 0,
            },
            _ => self.soa_expire(tree)?,
        };
        for zr in records {
            if zr.record.get_ttl() > expire {
                return Err(ZoneError::InvalidParameter {
                    zone: self.apex.as_str().to_string(),
                    detail: format!(
                        "TTL {} of {} record exceeds SOA expire {}",
                        zr.record.get_ttl(),
                        owner,
                        expire
                    ),
                });
            }
        }

        if qtype == QueryType::Soa {
            if records.len() != 1 {
                return Err(ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: "SOA RRSet must contain exactly one record".to_string(),
                });
            }
            if *owner != self.apex {
                return Err(ZoneError::InvalidOperation {
                    zone: self.apex.as_str().to_string(),
                    detail: "SOA owner must be the zone apex".to_string(),
                });
            }
        }

        Ok(())
    }

    /// SOA replacement: serial is overridden by the committer; a minimum
    /// TTL change rebuilds the denial chain with the new TTL.
    fn set_soa_locked(
        &self,
        mut tree: RwLockWriteGuard<'_, ZoneTree>,
        records: Vec<ZoneRecord>,
    ) -> ZoneResult<()> {
        let old_minimum = match self.soa_record(&tree)? {
            DnsRecord::Soa { minimum, .. } => minimum,
            _ => 0,
        };
        let new_minimum = match &records[0].record {
            DnsRecord::Soa { minimum, .. } => *minimum,
            _ => 0,
        };

        let mut batch = CommitBatch::new();
        {
            let node = tree.get_or_create(&self.apex);
            node.entries
                .set(QueryType::Soa, records)
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            // The old SOA becomes the commit's old-SOA row rather than an
            // ordinary deletion; the committer handles both rows.
        }

        if old_minimum != new_minimum && self.status() != DnssecStatus::Unsigned {
            log::info!(
                "SOA minimum changed {} -> {}, rebuilding denial chain for {}",
                old_minimum,
                new_minimum,
                self.apex
            );
            self.rebuild_denial_locked(&mut tree, &mut batch, new_minimum)?;
        }

        self.commit_and_publish(tree, batch)
    }

    /// Post-mutation work in a signed zone: re-link the denial chain at
    /// the touched owner and refresh the RRSet's signatures.
    fn after_store_mutation(
        &self,
        tree: &mut ZoneTree,
        owner: &DomainName,
        qtype: QueryType,
        batch: &mut CommitBatch,
    ) -> ZoneResult<()> {
        let status = self.status();
        if status == DnssecStatus::Unsigned {
            return Ok(());
        }

        let keys = self.keys.lock().snapshot();
        let validity = SigningContext::validity_for(self.soa_expire(tree)?);
        let ttl = self.soa_minimum(tree)?;
        let ctx = SigningContext {
            apex: &self.apex,
            keys: &keys,
            validity,
            now: Utc::now(),
        };

        // Refresh the mutated RRSet's signatures first.
        let records = tree
            .find_exact(owner)
            .and_then(|node| node.entries.get(qtype))
            .map(|set| set.to_records());
        match records {
            Some(records) if !records.is_empty() => {
                let rrsigs = sign_rrset(&ctx, owner, &records)?;
                if !rrsigs.is_empty() {
                    let node = tree.get_or_create(owner);
                    batch.added_rrsigs.extend(rrsigs.clone());
                    batch
                        .deleted_rrsigs
                        .extend(node.entries.add_or_update_rrsigs(rrsigs));
                }
            }
            _ => {
                if let Some(node) = tree.find_exact_mut(owner) {
                    batch
                        .deleted_rrsigs
                        .extend(node.entries.delete_rrsigs_covering(qtype));
                }
            }
        }

        match status {
            DnssecStatus::SignedWithNsec => {
                relink_nsec(tree, &self.apex, owner, &ctx, ttl, batch)?;
            }
            DnssecStatus::SignedWithNsec3 => {
                let (iterations, salt) = {
                    let params = self.dnssec.read();
                    (params.nsec3_iterations, params.nsec3_salt.clone())
                };
                relink_nsec3(tree, &self.apex, owner, &ctx, ttl, iterations, &salt, batch)?;
            }
            DnssecStatus::Unsigned => {}
        }

        // A node left with no RRSets at all has no reason to stay.
        if *owner != self.apex {
            let empty = tree
                .find_exact(owner)
                .map(|node| node.entries.is_empty())
                .unwrap_or(false);
            if empty {
                tree.remove(owner);
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Committer
    // -----------------------------------------------------------------

    fn next_serial(serial: u32) -> u32 {
        if serial == u32::MAX {
            1
        } else {
            serial + 1
        }
    }

    fn soa_record(&self, tree: &ZoneTree) -> ZoneResult<DnsRecord> {
        tree.find_exact(&self.apex)
            .and_then(|node| node.entries.get(QueryType::Soa))
            .and_then(|set| set.records().next().cloned())
            .ok_or_else(|| ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "zone has no SOA record".to_string(),
            })
    }

    fn soa_expire(&self, tree: &ZoneTree) -> ZoneResult<u32> {
        match self.soa_record(tree)? {
            DnsRecord::Soa { expire, .. } => Ok(expire),
            _ => Ok(0),
        }
    }

    fn soa_minimum(&self, tree: &ZoneTree) -> ZoneResult<u32> {
        match self.soa_record(tree)? {
            DnsRecord::Soa { minimum, .. } => Ok(minimum),
            _ => Ok(0),
        }
    }

    /// Finish a mutation batch: bump the serial, re-sign the SOA, write
    /// history, prune, then (with the tree lock released) persist and arm
    /// the NOTIFY dispatcher.
    fn commit_and_publish(
        &self,
        mut tree: RwLockWriteGuard<'_, ZoneTree>,
        batch: CommitBatch,
    ) -> ZoneResult<()> {
        self.commit_locked(&mut tree, batch, Utc::now())?;
        drop(tree);

        if let Some(callback) = self.save_zone.read().as_ref() {
            callback(&self.apex);
        }
        self.trigger_notify();
        Ok(())
    }

    fn commit_locked(
        &self,
        tree: &mut ZoneTree,
        mut batch: CommitBatch,
        now: DateTime<Utc>,
    ) -> ZoneResult<u32> {
        batch.normalize();

        let old_soa = self.soa_record(tree)?;
        let (old_serial, expire) = match &old_soa {
            DnsRecord::Soa { serial, expire, .. } => (*serial, *expire),
            _ => (0, 0),
        };

        if self.config.read().internal {
            // Internal zones: no serial bump, no history.
            return Ok(old_serial);
        }

        let mut new_soa = old_soa.clone();
        if let DnsRecord::Soa { ref mut serial, .. } = new_soa {
            *serial = Self::next_serial(old_serial);
        }
        let new_serial = Self::next_serial(old_serial);

        {
            let node = tree.get_or_create(&self.apex);
            node.entries
                .set(QueryType::Soa, vec![ZoneRecord::new(new_soa.clone())])
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
        }

        if self.status() != DnssecStatus::Unsigned {
            let keys = self.keys.lock().snapshot();
            let ctx = SigningContext {
                apex: &self.apex,
                keys: &keys,
                validity: SigningContext::validity_for(expire),
                now,
            };
            let rrsigs = sign_rrset(&ctx, &self.apex, &[new_soa.clone()])?;
            let node = tree.get_or_create(&self.apex);
            batch.added_rrsigs.extend(rrsigs.clone());
            batch
                .deleted_rrsigs
                .extend(node.entries.add_or_update_rrsigs(rrsigs));
        }

        let deleted = Self::expand_glue(tree, batch.deleted);
        let added = Self::expand_glue(tree, batch.added);

        {
            let mut history = self.history.lock();
            history.append_commit(
                old_soa,
                deleted,
                batch.deleted_rrsigs,
                new_soa,
                added,
                batch.added_rrsigs,
                now,
            );
            history.prune(expire, now);
        }

        log::info!("committed zone {} at serial {}", self.apex, new_serial);
        Ok(new_serial)
    }

    /// Interleave NS glue (in-zone A/AAAA of the name server host) behind
    /// each NS row, the order IXFR consumers expect.
    fn expand_glue(tree: &ZoneTree, records: Vec<DnsRecord>) -> Vec<DnsRecord> {
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let host = match &record {
                DnsRecord::Ns { host, .. } => Some(DomainName::new(host)),
                _ => None,
            };
            out.push(record);
            if let Some(host) = host {
                if let Some(node) = tree.find_exact(&host) {
                    for qtype in [QueryType::A, QueryType::Aaaa] {
                        if let Some(set) = node.entries.get(qtype) {
                            out.extend(set.records().cloned());
                        }
                    }
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------
    // NOTIFY
    // -----------------------------------------------------------------

    fn trigger_notify(&self) {
        let config = self.config.read();
        if config.disabled || config.notify_policy == NotifyPolicy::None {
            return;
        }
        drop(config);

        let authority = Arc::clone(&self.authority);
        let apex = self.apex.clone();
        let config = self.config.read().clone();

        self.notify.trigger(move || {
            let tree = authority.read();
            let soa = tree
                .find_exact(&apex)
                .and_then(|node| node.entries.get(QueryType::Soa))
                .and_then(|set| set.records().next().cloned())?;

            let targets = match config.notify_policy {
                NotifyPolicy::None => return None,
                NotifyPolicy::SpecifiedNameServers => config.notify_name_servers.clone(),
                NotifyPolicy::ZoneNameServers => {
                    let primary = match &soa {
                        DnsRecord::Soa { m_name, .. } => DomainName::new(m_name),
                        _ => DomainName::root(),
                    };
                    let mut targets = Vec::new();
                    if let Some(ns_set) = tree
                        .find_exact(&apex)
                        .and_then(|node| node.entries.get(QueryType::Ns))
                    {
                        for record in ns_set.records() {
                            let host = match record {
                                DnsRecord::Ns { host, .. } => DomainName::new(host),
                                _ => continue,
                            };
                            if host == primary {
                                continue;
                            }
                            if let Some(node) = tree.find_exact(&host) {
                                if let Some(a_set) = node.entries.get(QueryType::A) {
                                    for rec in a_set.records() {
                                        if let DnsRecord::A { addr, .. } = rec {
                                            targets
                                                .push(SocketAddr::new(IpAddr::V4(*addr), 53));
                                        }
                                    }
                                }
                                if let Some(aaaa_set) = node.entries.get(QueryType::Aaaa) {
                                    for rec in aaaa_set.records() {
                                        if let DnsRecord::Aaaa { addr, .. } = rec {
                                            targets
                                                .push(SocketAddr::new(IpAddr::V6(*addr), 53));
                                        }
                                    }
                                }
                            }
                        }
                    }
                    targets
                }
            };

            if targets.is_empty() {
                return None;
            }
            Some(NotifyJob {
                zone: apex.as_str().to_string(),
                soa,
                targets,
            })
        });
    }

    // -----------------------------------------------------------------
    // Signing operations
    // -----------------------------------------------------------------

    /// Sign the zone: generate a KSK and a ZSK, publish the DNSKEY RRSet,
    /// sign every RRSet, build the denial chain, activate the ZSK and
    /// start the lifecycle timer.
    pub fn sign_zone(
        self: &Arc<Self>,
        algorithm: DnssecAlgorithm,
        nx_proof: NxProof,
        dnskey_ttl: u32,
        zsk_rollover_days: u32,
    ) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();

        if self.status() != DnssecStatus::Unsigned {
            return Err(ZoneError::ZoneAlreadySigned {
                zone: self.apex.as_str().to_string(),
            });
        }
        if let NxProof::Nsec3 {
            iterations,
            salt_length,
        } = nx_proof
        {
            if salt_length > MAX_NSEC3_SALT_LEN {
                return Err(ZoneError::InvalidParameter {
                    zone: self.apex.as_str().to_string(),
                    detail: format!(
                        "NSEC3 salt length {} above maximum {}",
                        salt_length, MAX_NSEC3_SALT_LEN
                    ),
                });
            }
            validate_nsec3_params(self.apex.as_str(), iterations, &[])?;
        }

        log::info!("signing zone {} with {:?}", self.apex, algorithm);

        let now = Utc::now();
        let ksk = self.generate_key_locked(KeyType::KSK, algorithm, 0, now)?;
        let zsk = self.generate_key_locked(KeyType::ZSK, algorithm, zsk_rollover_days, now)?;

        {
            let mut params = self.dnssec.write();
            params.dnskey_ttl = dnskey_ttl;
            params.zsk_rollover_days = zsk_rollover_days;
            params.last_refresh_check = now;
            match nx_proof {
                NxProof::Nsec => {
                    params.status = DnssecStatus::SignedWithNsec;
                }
                NxProof::Nsec3 {
                    iterations,
                    salt_length,
                } => {
                    params.status = DnssecStatus::SignedWithNsec3;
                    params.nsec3_iterations = iterations;
                    params.nsec3_salt = random_salt(salt_length);
                }
            }
        }

        let result = self.sign_zone_inner(ksk, zsk, dnskey_ttl, now);
        if let Err(e) = result {
            log::error!("signing zone {} failed, rolling back: {}", self.apex, e);
            self.rollback_signing();
            return Err(e);
        }

        // Lifecycle timer: first tick 30 s out, then every 15 minutes.
        let weak = Arc::downgrade(self);
        let timer = LifecycleTimer::start(self.apex.as_str(), move || {
            if let Some(zone) = weak.upgrade() {
                zone.dnssec_tick();
            }
        });
        if let Some(old) = self.timer.lock().replace(timer) {
            old.cancel();
        }

        Ok(())
    }

    fn sign_zone_inner(
        &self,
        mut ksk: DnssecKey,
        mut zsk: DnssecKey,
        dnskey_ttl: u32,
        now: DateTime<Utc>,
    ) -> ZoneResult<()> {
        // Both keys start Ready: the zone is new to DNSSEC, so there are
        // no caches holding an older DNSKEY RRSet to wait out.
        ksk.transition(KeyState::Ready, now);
        zsk.transition(KeyState::Ready, now);

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();

        // Publish the DNSKEY RRSet.
        let dnskey_records = vec![
            ZoneRecord::new(ksk.dnskey_record(&self.apex, dnskey_ttl)?),
            ZoneRecord::new(zsk.dnskey_record(&self.apex, dnskey_ttl)?),
        ];
        {
            let node = tree.get_or_create(&self.apex);
            let prior = node
                .entries
                .set(QueryType::Dnskey, dnskey_records.clone())
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            batch.deleted.extend(prior);
            batch
                .added
                .extend(dnskey_records.iter().map(|zr| zr.record.clone()));
        }

        {
            let mut registry = self.keys.lock();
            registry.insert(self.apex.as_str(), ksk)?;
            registry.insert(self.apex.as_str(), zsk)?;
        }

        // Sign every RRSet, then build the denial chain.
        let keys = self.keys.lock().snapshot();
        let validity = SigningContext::validity_for(self.soa_expire(&tree)?);
        let ttl = self.soa_minimum(&tree)?;
        let ctx = SigningContext {
            apex: &self.apex,
            keys: &keys,
            validity,
            now,
        };

        self.sign_all_rrsets(&mut tree, &ctx, &mut batch)?;

        let (status, iterations, salt) = {
            let params = self.dnssec.read();
            (
                params.status,
                params.nsec3_iterations,
                params.nsec3_salt.clone(),
            )
        };
        match status {
            DnssecStatus::SignedWithNsec => {
                enable_nsec(&mut tree, &self.apex, &ctx, ttl, &mut batch)?;
            }
            DnssecStatus::SignedWithNsec3 => {
                enable_nsec3(
                    &mut tree, &self.apex, &ctx, ttl, iterations, &salt, &mut batch,
                )?;
            }
            DnssecStatus::Unsigned => {}
        }

        // The ZSK may sign from the start; the KSK waits for the parent DS.
        {
            let mut registry = self.keys.lock();
            for key in registry.keys_mut() {
                if key.key_type == KeyType::ZSK {
                    key.transition(KeyState::Active, now);
                }
            }
        }

        self.commit_and_publish(tree, batch)
    }

    /// Undo a failed whole-zone signing: drop DNSSEC records, clear the
    /// registry, return to Unsigned. No commit happens; readers never saw
    /// the partial state because the tree lock was held throughout.
    fn rollback_signing(&self) {
        let mut tree = self.authority.write();
        let mut scrap = CommitBatch::new();
        disable_nsec(&mut tree, &self.apex, &mut scrap);
        disable_nsec3(&mut tree, &self.apex, &mut scrap);

        let names = tree.names_under(&self.apex);
        for name in names {
            if let Some(node) = tree.find_exact_mut(&name) {
                node.entries.delete(QueryType::Dnskey);
                node.entries.delete(QueryType::Rrsig);
                if node.entries.is_empty() && name != self.apex {
                    tree.remove(&name);
                }
            }
        }

        self.keys.lock().clear();
        *self.dnssec.write() = DnssecParams::default();
    }

    fn sign_all_rrsets(
        &self,
        tree: &mut ZoneTree,
        ctx: &SigningContext<'_>,
        batch: &mut CommitBatch,
    ) -> ZoneResult<()> {
        let names = tree.names_under(&self.apex);

        for name in names {
            let rrsets: Vec<(QueryType, Vec<DnsRecord>)> = {
                let node = match tree.find_exact(&name) {
                    Some(node) => node,
                    None => continue,
                };
                node.entries
                    .iter()
                    .filter(|(qtype, _)| *qtype != QueryType::Rrsig)
                    .map(|(qtype, set)| (qtype, set.to_records()))
                    .collect()
            };

            for (_, records) in rrsets {
                let rrsigs = sign_rrset(ctx, &name, &records)?;
                if rrsigs.is_empty() {
                    continue;
                }
                let node = tree.get_or_create(&name);
                batch.added_rrsigs.extend(rrsigs.clone());
                batch
                    .deleted_rrsigs
                    .extend(node.entries.add_or_update_rrsigs(rrsigs));
            }
        }

        Ok(())
    }

    /// Remove all DNSSEC state: DNSKEY, RRSIG, NSEC, NSEC3, NSEC3PARAM,
    /// keys and timer. The zone data itself is untouched.
    pub fn unsign_zone(&self) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();

        if self.status() == DnssecStatus::Unsigned {
            return Err(ZoneError::ZoneNotSigned {
                zone: self.apex.as_str().to_string(),
            });
        }
        log::info!("unsigning zone {}", self.apex);

        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();
        disable_nsec(&mut tree, &self.apex, &mut batch);
        disable_nsec3(&mut tree, &self.apex, &mut batch);

        let names = tree.names_under(&self.apex);
        for name in names {
            if let Some(node) = tree.find_exact_mut(&name) {
                batch.deleted.extend(node.entries.delete(QueryType::Dnskey));
                batch
                    .deleted_rrsigs
                    .extend(node.entries.delete(QueryType::Rrsig));
                if node.entries.is_empty() && name != self.apex {
                    tree.remove(&name);
                }
            }
        }

        self.keys.lock().clear();
        *self.dnssec.write() = DnssecParams::default();

        self.commit_and_publish(tree, batch)
    }

    /// Switch a SignedWithNsec3 zone to NSEC.
    pub fn convert_to_nsec(&self) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();
        if self.status() != DnssecStatus::SignedWithNsec3 {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "zone is not signed with NSEC3".to_string(),
            });
        }
        log::info!("converting zone {} to NSEC", self.apex);

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();
        {
            let mut params = self.dnssec.write();
            params.status = DnssecStatus::SignedWithNsec;
            params.nsec3_iterations = 0;
            params.nsec3_salt = Vec::new();
        }
        let minimum = self.soa_minimum(&tree)?;
        self.rebuild_denial_locked(&mut tree, &mut batch, minimum)?;
        self.commit_and_publish(tree, batch)
    }

    /// Switch a SignedWithNsec zone to NSEC3 with a fresh random salt.
    pub fn convert_to_nsec3(&self, iterations: u16, salt_length: usize) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();
        if self.status() != DnssecStatus::SignedWithNsec {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "zone is not signed with NSEC".to_string(),
            });
        }
        if salt_length > MAX_NSEC3_SALT_LEN {
            return Err(ZoneError::InvalidParameter {
                zone: self.apex.as_str().to_string(),
                detail: format!(
                    "NSEC3 salt length {} above maximum {}",
                    salt_length, MAX_NSEC3_SALT_LEN
                ),
            });
        }
        validate_nsec3_params(self.apex.as_str(), iterations, &[])?;
        log::info!("converting zone {} to NSEC3", self.apex);

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();
        {
            let mut params = self.dnssec.write();
            params.status = DnssecStatus::SignedWithNsec3;
            params.nsec3_iterations = iterations;
            params.nsec3_salt = random_salt(salt_length);
        }
        let minimum = self.soa_minimum(&tree)?;
        self.rebuild_denial_locked(&mut tree, &mut batch, minimum)?;
        self.commit_and_publish(tree, batch)
    }

    /// Replace the NSEC3 parameters: disable the current chain, then build
    /// a new one with the supplied iterations and salt.
    pub fn update_nsec3_params(&self, iterations: u16, salt: &[u8]) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();
        if self.status() != DnssecStatus::SignedWithNsec3 {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "zone is not signed with NSEC3".to_string(),
            });
        }
        validate_nsec3_params(self.apex.as_str(), iterations, salt)?;

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();
        {
            let mut params = self.dnssec.write();
            params.nsec3_iterations = iterations;
            params.nsec3_salt = salt.to_vec();
        }
        let minimum = self.soa_minimum(&tree)?;
        self.rebuild_denial_locked(&mut tree, &mut batch, minimum)?;
        self.commit_and_publish(tree, batch)
    }

    /// Tear down and rebuild the denial chain for the current status.
    fn rebuild_denial_locked(
        &self,
        tree: &mut ZoneTree,
        batch: &mut CommitBatch,
        ttl: u32,
    ) -> ZoneResult<()> {
        disable_nsec(tree, &self.apex, batch);
        disable_nsec3(tree, &self.apex, batch);

        let keys = self.keys.lock().snapshot();
        let validity = SigningContext::validity_for(self.soa_expire(tree)?);
        let ctx = SigningContext {
            apex: &self.apex,
            keys: &keys,
            validity,
            now: Utc::now(),
        };

        let (status, iterations, salt) = {
            let params = self.dnssec.read();
            (
                params.status,
                params.nsec3_iterations,
                params.nsec3_salt.clone(),
            )
        };
        match status {
            DnssecStatus::SignedWithNsec => enable_nsec(tree, &self.apex, &ctx, ttl, batch),
            DnssecStatus::SignedWithNsec3 => {
                enable_nsec3(tree, &self.apex, &ctx, ttl, iterations, &salt, batch)
            }
            DnssecStatus::Unsigned => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Key verbs
    // -----------------------------------------------------------------

    fn generate_key_locked(
        &self,
        key_type: KeyType,
        algorithm: DnssecAlgorithm,
        rollover_days: u32,
        now: DateTime<Utc>,
    ) -> ZoneResult<DnssecKey> {
        for _ in 0..TAG_COLLISION_RETRIES {
            let key = DnssecKey::generate(key_type, algorithm, rollover_days, now)?;
            if !self.keys.lock().contains_tag(key.key_tag) {
                return Ok(key);
            }
            log::debug!(
                "key tag {} collides in zone {}, regenerating",
                key.key_tag,
                self.apex
            );
        }
        Err(ZoneError::TagCollision {
            zone: self.apex.as_str().to_string(),
        })
    }

    /// Generate a successor for `key_tag` and mark the old key retiring.
    /// Allowed only while the old key is Ready or Active.
    pub fn rollover_key(&self, key_tag: u16) -> ZoneResult<u16> {
        let _update = self.dnssec_update_lock.lock();
        self.rollover_key_locked(key_tag, Utc::now())
    }

    fn rollover_key_locked(&self, key_tag: u16, now: DateTime<Utc>) -> ZoneResult<u16> {
        let (key_type, algorithm, rollover_days, state) = {
            let registry = self.keys.lock();
            let key = registry
                .get(key_tag)
                .ok_or_else(|| ZoneError::KeyNotFound {
                    zone: self.apex.as_str().to_string(),
                    key_tag,
                })?;
            (key.key_type, key.algorithm, key.rollover_days, key.state)
        };

        if !matches!(state, KeyState::Ready | KeyState::Active) {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: format!("key {} is not Ready or Active", key_tag),
            });
        }
        log::info!("rolling over key {} in zone {}", key_tag, self.apex);

        let successor = self.generate_key_locked(key_type, algorithm, rollover_days, now)?;
        let successor_tag = successor.key_tag;
        self.keys.lock().insert(self.apex.as_str(), successor)?;

        self.publish_all_generated_locked()?;

        if let Some(key) = self.keys.lock().get_mut(key_tag) {
            key.is_retiring = true;
        }

        Ok(successor_tag)
    }

    /// Publish the DNSKEY of every Generated key and move it to Published.
    pub fn publish_all_generated(&self) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();
        self.publish_all_generated_locked()
    }

    fn publish_all_generated_locked(&self) -> ZoneResult<()> {
        let now = Utc::now();
        let dnskey_ttl = self.dnssec.read().dnskey_ttl;

        let pending: Vec<u16> = self
            .keys
            .lock()
            .keys()
            .iter()
            .filter(|k| k.state == KeyState::Generated)
            .map(|k| k.key_tag)
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();

        for tag in pending {
            let record = {
                let registry = self.keys.lock();
                let key = registry.get(tag).ok_or_else(|| ZoneError::KeyNotFound {
                    zone: self.apex.as_str().to_string(),
                    key_tag: tag,
                })?;
                key.dnskey_record(&self.apex, dnskey_ttl)?
            };

            let node = tree.get_or_create(&self.apex);
            let appended = node
                .entries
                .add(ZoneRecord::new(record.clone()))
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            if !appended {
                return Err(ZoneError::DuplicateKey {
                    zone: self.apex.as_str().to_string(),
                    key_tag: tag,
                });
            }
            batch.added.push(record);

            if let Some(key) = self.keys.lock().get_mut(tag) {
                key.transition(KeyState::Published, now);
            }
            log::info!("published DNSKEY {} in zone {}", tag, self.apex);
        }

        self.resign_dnskey_rrset(&mut tree, &mut batch, now)?;
        self.commit_and_publish(tree, batch)
    }

    /// Flag a key for retirement; takes effect once a successor is safe.
    pub fn retire_key(&self, key_tag: u16) -> ZoneResult<()> {
        let _update = self.dnssec_update_lock.lock();
        let mut registry = self.keys.lock();

        let safe = {
            let key = registry
                .get(key_tag)
                .ok_or_else(|| ZoneError::KeyNotFound {
                    zone: self.apex.as_str().to_string(),
                    key_tag,
                })?;
            if !matches!(key.state, KeyState::Ready | KeyState::Active) {
                return Err(ZoneError::InvalidOperation {
                    zone: self.apex.as_str().to_string(),
                    detail: format!("key {} is not Ready or Active", key_tag),
                });
            }
            retire_is_safe(&registry, key)
        };
        if !safe {
            return Err(ZoneError::SuccessorMissing {
                zone: self.apex.as_str().to_string(),
                key_tag,
            });
        }

        if let Some(key) = registry.get_mut(key_tag) {
            key.is_retiring = true;
        }
        log::info!("key {} in zone {} flagged for retirement", key_tag, self.apex);
        Ok(())
    }

    /// Delete a key that was generated but never published.
    pub fn delete_key(&self, key_tag: u16) -> ZoneResult<()> {
        let mut registry = self.keys.lock();
        let state = registry
            .get(key_tag)
            .map(|k| k.state)
            .ok_or_else(|| ZoneError::KeyNotFound {
                zone: self.apex.as_str().to_string(),
                key_tag,
            })?;
        if state != KeyState::Generated {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: format!("key {} has been published and cannot be deleted", key_tag),
            });
        }
        registry.remove(key_tag);
        Ok(())
    }

    /// Change the DNSKEY TTL used for newly published keys.
    pub fn update_dnskey_ttl(&self, ttl: u32) -> ZoneResult<()> {
        let expire = {
            let tree = self.authority.read();
            self.soa_expire(&tree)?
        };
        if ttl > expire {
            return Err(ZoneError::InvalidParameter {
                zone: self.apex.as_str().to_string(),
                detail: format!("DNSKEY TTL {} exceeds SOA expire {}", ttl, expire),
            });
        }
        self.dnssec.write().dnskey_ttl = ttl;
        Ok(())
    }

    /// DS records for the zone's usable KSKs, for the parent operator.
    pub fn ds_records(&self) -> ZoneResult<Vec<DnsRecord>> {
        let ttl = self.dnssec.read().dnskey_ttl;
        let registry = self.keys.lock();
        registry
            .keys()
            .iter()
            .filter(|k| {
                k.key_type == KeyType::KSK
                    && matches!(
                        k.state,
                        KeyState::Published | KeyState::Ready | KeyState::Active
                    )
            })
            .map(|k| k.ds_record(&self.apex, ttl))
            .collect()
    }

    pub fn properties(&self) -> ZoneProperties {
        let config = self.config.read();
        ZoneProperties {
            apex: self.apex.as_str().to_string(),
            status: self.status(),
            serial: self.serial(),
            internal: config.internal,
            disabled: config.disabled,
            keys: self
                .keys
                .lock()
                .keys()
                .iter()
                .map(|k| KeyProperties {
                    key_tag: k.key_tag,
                    key_type: k.key_type,
                    algorithm: k.algorithm,
                    state: k.state,
                    state_changed_at: k.state_changed_at,
                    is_retiring: k.is_retiring,
                })
                .collect(),
        }
    }

    /// IXFR feed for the zone-transfer collaborator.
    pub fn history_changes_since(&self, client_serial: u32) -> Option<Vec<HistoryRow>> {
        self.history.lock().changes_since(client_serial)
    }

    #[cfg(test)]
    pub(crate) fn history_rows(&self) -> Vec<HistoryRow> {
        self.history.lock().rows().to_vec()
    }

    // -----------------------------------------------------------------
    // Lifecycle timer
    // -----------------------------------------------------------------

    /// One timer tick: probe the parent for DS (outside all locks), then
    /// advance key states and refresh aging signatures. Errors are logged;
    /// the timer always re-arms.
    fn dnssec_tick(self: Arc<Self>) {
        if self.status() == DnssecStatus::Unsigned {
            return;
        }

        let observed = self.probe_parent_ds();
        if let Err(e) = self.tick(Utc::now(), observed.as_deref()) {
            log::error!("dnssec tick for zone {} failed: {}", self.apex, e);
        }
    }

    /// Query the configured parent servers for this zone's DS RRSet.
    /// Runs on the timer thread with no engine lock held.
    fn probe_parent_ds(&self) -> Option<Vec<u16>> {
        let needs_probe = self
            .keys
            .lock()
            .keys()
            .iter()
            .any(|k| k.key_type == KeyType::KSK && k.state == KeyState::Ready);
        if !needs_probe {
            return None;
        }

        let parents = self.config.read().parent_servers.clone();
        let client = DnsNetworkClient::new(StdDuration::from_secs(10), 2);
        for server in parents {
            match client.send_query(self.apex.as_str(), QueryType::Ds, server) {
                Ok(response) if response.header.rescode == ResultCode::NOERROR => {
                    let tags: Vec<u16> = response
                        .answers
                        .iter()
                        .filter_map(|rec| match rec {
                            DnsRecord::Ds { key_tag, .. } => Some(*key_tag),
                            _ => None,
                        })
                        .collect();
                    return Some(tags);
                }
                Ok(response) => {
                    log::warn!(
                        "DS query for {} to {} answered {:?}",
                        self.apex,
                        server,
                        response.header.rescode
                    );
                }
                Err(e) => {
                    log::warn!("DS query for {} to {} failed: {}", self.apex, server, e);
                }
            }
        }
        None
    }

    /// Advance the key lifecycle at `now` with the given parent-DS
    /// observation, then run the signature-refresh sweep. Exposed with an
    /// explicit clock so tests can drive time.
    pub fn tick(&self, now: DateTime<Utc>, observed_ds: Option<&[u16]>) -> ZoneResult<()> {
        // The timer thread must never block behind a whole-zone DNSSEC
        // operation: that operation may be waiting to cancel this very
        // timer. Skipping a tick is harmless, the next one re-checks.
        let _update = match self.dnssec_update_lock.try_lock() {
            Some(guard) => guard,
            None => {
                log::debug!("zone {} busy, skipping lifecycle tick", self.apex);
                return Ok(());
            }
        };
        if self.status() == DnssecStatus::Unsigned {
            return Ok(());
        }

        let dnskey_ttl = self.dnssec.read().dnskey_ttl;
        // Decide under the registry lock, apply after releasing it.
        let actions = {
            let registry = self.keys.lock();
            due_actions(&registry, now, dnskey_ttl, observed_ds)
        };

        for action in actions {
            log::info!("zone {} lifecycle action {:?}", self.apex, action);
            if let Err(e) = self.apply_action(&action, now) {
                log::error!(
                    "lifecycle action {:?} for zone {} failed: {}",
                    action,
                    self.apex,
                    e
                );
            }
        }

        self.refresh_signatures(now)?;
        Ok(())
    }

    fn apply_action(&self, action: &LifecycleAction, now: DateTime<Utc>) -> ZoneResult<()> {
        match *action {
            LifecycleAction::MakeReady(tag) => {
                if let Some(key) = self.keys.lock().get_mut(tag) {
                    key.transition(KeyState::Ready, now);
                }
                self.commit_state_change(now)
            }
            LifecycleAction::Activate(tag) => {
                let key_type = {
                    let mut registry = self.keys.lock();
                    match registry.get_mut(tag) {
                        Some(key) => {
                            key.transition(KeyState::Active, now);
                            key.key_type
                        }
                        None => return Ok(()),
                    }
                };
                // A newly active key signs immediately: ZSKs re-sign the
                // zone data, KSKs re-sign the DNSKEY RRSet.
                let mut tree = self.authority.write();
                let mut batch = CommitBatch::new();
                match key_type {
                    KeyType::ZSK => {
                        let keys = self.keys.lock().snapshot();
                        let ctx = SigningContext {
                            apex: &self.apex,
                            keys: &keys,
                            validity: SigningContext::validity_for(self.soa_expire(&tree)?),
                            now,
                        };
                        self.sign_all_rrsets(&mut tree, &ctx, &mut batch)?;
                    }
                    KeyType::KSK => {
                        self.resign_dnskey_rrset(&mut tree, &mut batch, now)?;
                    }
                }
                self.commit_and_publish(tree, batch)
            }
            LifecycleAction::Retire(tag) => {
                if let Some(key) = self.keys.lock().get_mut(tag) {
                    key.transition(KeyState::Retired, now);
                    key.is_retiring = false;
                }
                self.commit_state_change(now)
            }
            LifecycleAction::Revoke(tag) => self.revoke_key_locked(tag, now),
            LifecycleAction::Remove(tag) => self.remove_key_locked(tag, now),
            LifecycleAction::Rollover(tag) => {
                self.rollover_key_locked(tag, now).map(|_| ())
            }
        }
    }

    /// Commit with an empty batch: pure key-state transitions still bump
    /// the serial so secondaries observe the change.
    fn commit_state_change(&self, now: DateTime<Utc>) -> ZoneResult<()> {
        let mut tree = self.authority.write();
        self.commit_locked(&mut tree, CommitBatch::new(), now)?;
        drop(tree);

        if let Some(callback) = self.save_zone.read().as_ref() {
            callback(&self.apex);
        }
        self.trigger_notify();
        Ok(())
    }

    /// RFC 5011 revocation: the revoke bit changes the key tag, so the old
    /// DNSKEY record is replaced and the RRSet re-signed (now also by the
    /// revoked key itself).
    fn revoke_key_locked(&self, tag: u16, now: DateTime<Utc>) -> ZoneResult<()> {
        let dnskey_ttl = self.dnssec.read().dnskey_ttl;
        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();

        let (old_record, new_record) = {
            let mut registry = self.keys.lock();
            let key = registry.get_mut(tag).ok_or_else(|| ZoneError::KeyNotFound {
                zone: self.apex.as_str().to_string(),
                key_tag: tag,
            })?;
            let old_record = key.dnskey_record(&self.apex, dnskey_ttl)?;
            let new_tag = key.revoke(now)?;
            log::info!(
                "revoked KSK {} in zone {}, re-tagged as {}",
                tag,
                self.apex,
                new_tag
            );
            let new_record = key.dnskey_record(&self.apex, dnskey_ttl)?;
            (old_record, new_record)
        };

        if let Some(node) = tree.find_exact_mut(&self.apex) {
            if let Some(removed) = node.entries.delete_record(&old_record) {
                batch.deleted.push(removed);
            }
            // Signatures made by the pre-revocation key are gone with it.
            batch
                .deleted_rrsigs
                .extend(node.entries.delete_rrsigs_by_key_tag(tag));
            node.entries
                .add(ZoneRecord::new(new_record.clone()))
                .map_err(|e| ZoneError::InvalidRRSet {
                    zone: self.apex.as_str().to_string(),
                    detail: e.to_string(),
                })?;
            batch.added.push(new_record);
        }

        self.resign_dnskey_rrset(&mut tree, &mut batch, now)?;
        self.commit_and_publish(tree, batch)
    }

    /// Remove a key from the zone: a ZSK takes its signatures along, a
    /// KSK leaves the DNSKEY RRSet (at least one DNSKEY must remain).
    fn remove_key_locked(&self, tag: u16, now: DateTime<Utc>) -> ZoneResult<()> {
        let dnskey_ttl = self.dnssec.read().dnskey_ttl;
        let mut tree = self.authority.write();
        let mut batch = CommitBatch::new();

        let (key_type, dnskey_record) = {
            let registry = self.keys.lock();
            let key = registry.get(tag).ok_or_else(|| ZoneError::KeyNotFound {
                zone: self.apex.as_str().to_string(),
                key_tag: tag,
            })?;
            (key.key_type, key.dnskey_record(&self.apex, dnskey_ttl)?)
        };

        let remaining_dnskeys = tree
            .find_exact(&self.apex)
            .and_then(|node| node.entries.get(QueryType::Dnskey))
            .map(|set| set.len())
            .unwrap_or(0);
        if remaining_dnskeys <= 1 {
            return Err(ZoneError::InvalidOperation {
                zone: self.apex.as_str().to_string(),
                detail: "cannot unpublish the last DNSKEY".to_string(),
            });
        }

        if let Some(node) = tree.find_exact_mut(&self.apex) {
            if let Some(removed) = node.entries.delete_record(&dnskey_record) {
                batch.deleted.push(removed);
            }
        }

        if key_type == KeyType::ZSK {
            // Sweep this key's signatures out of the whole zone.
            let names = tree.names_under(&self.apex);
            for name in names {
                if let Some(node) = tree.find_exact_mut(&name) {
                    batch
                        .deleted_rrsigs
                        .extend(node.entries.delete_rrsigs_by_key_tag(tag));
                }
            }
        } else if let Some(node) = tree.find_exact_mut(&self.apex) {
            batch
                .deleted_rrsigs
                .extend(node.entries.delete_rrsigs_by_key_tag(tag));
        }

        {
            let mut registry = self.keys.lock();
            if let Some(key) = registry.get_mut(tag) {
                key.transition(KeyState::Removed, now);
            }
            registry.remove(tag);
        }
        log::info!("removed key {} from zone {}", tag, self.apex);

        self.resign_dnskey_rrset(&mut tree, &mut batch, now)?;
        self.commit_and_publish(tree, batch)
    }

    fn resign_dnskey_rrset(
        &self,
        tree: &mut ZoneTree,
        batch: &mut CommitBatch,
        now: DateTime<Utc>,
    ) -> ZoneResult<()> {
        let records = tree
            .find_exact(&self.apex)
            .and_then(|node| node.entries.get(QueryType::Dnskey))
            .map(|set| set.to_records())
            .unwrap_or_default();
        if records.is_empty() {
            return Ok(());
        }

        let keys = self.keys.lock().snapshot();
        let ctx = SigningContext {
            apex: &self.apex,
            keys: &keys,
            validity: SigningContext::validity_for(self.soa_expire(tree)?),
            now,
        };
        let rrsigs = sign_rrset(&ctx, &self.apex, &records)?;
        let node = tree.get_or_create(&self.apex);
        batch.added_rrsigs.extend(rrsigs.clone());
        batch
            .deleted_rrsigs
            .extend(node.entries.add_or_update_rrsigs(rrsigs));
        Ok(())
    }

    /// Re-sign every RRSIG past half of its validity window. Runs at most
    /// once per validity/10.
    fn refresh_signatures(&self, now: DateTime<Utc>) -> ZoneResult<()> {
        let mut tree = self.authority.write();
        let expire = self.soa_expire(&tree)?;
        let validity = SigningContext::validity_for(expire);

        {
            let mut params = self.dnssec.write();
            let check_period = validity / 10;
            if now - params.last_refresh_check <= check_period {
                return Ok(());
            }
            params.last_refresh_check = now;
        }

        let keys = self.keys.lock().snapshot();
        let ctx = SigningContext {
            apex: &self.apex,
            keys: &keys,
            validity,
            now,
        };

        let mut batch = CommitBatch::new();
        let names = tree.names_under(&self.apex);

        let mut refreshed = 0usize;
        for name in names {
            let stale_types: Vec<QueryType> = {
                let node = match tree.find_exact(&name) {
                    Some(node) => node,
                    None => continue,
                };
                let rrsig_set = match node.entries.get(QueryType::Rrsig) {
                    Some(set) => set,
                    None => continue,
                };
                rrsig_set
                    .records()
                    .filter_map(|rec| match rec {
                        DnsRecord::Rrsig {
                            type_covered,
                            inception,
                            expiration,
                            ..
                        } if crate::dns::key_lifecycle::rrsig_needs_refresh(
                            *inception,
                            *expiration,
                            now,
                        ) =>
                        {
                            Some(*type_covered)
                        }
                        _ => None,
                    })
                    .collect()
            };

            for qtype in stale_types {
                let records = tree
                    .find_exact(&name)
                    .and_then(|node| node.entries.get(qtype))
                    .map(|set| set.to_records())
                    .unwrap_or_default();
                if records.is_empty() {
                    continue;
                }
                let rrsigs = sign_rrset(&ctx, &name, &records)?;
                if rrsigs.is_empty() {
                    continue;
                }
                refreshed += rrsigs.len();
                let node = tree.get_or_create(&name);
                batch.added_rrsigs.extend(rrsigs.clone());
                batch
                    .deleted_rrsigs
                    .extend(node.entries.add_or_update_rrsigs(rrsigs));
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        log::info!("refreshed {} signatures in zone {}", refreshed, self.apex);
        self.commit_and_publish(tree, batch)
    }

    // -----------------------------------------------------------------
    // Query surface
    // -----------------------------------------------------------------

    /// Authoritative answer for (qname, qtype). With `dnssec_ok` the
    /// answer carries its RRSIGs; negative answers from a signed zone
    /// carry denial records.
    pub fn authoritative_response(
        &self,
        qname: &str,
        qtype: QueryType,
        dnssec_ok: bool,
    ) -> DnsPacket {
        let qname = DomainName::new(qname);
        let tree = self.authority.read();
        let signed = self.status() != DnssecStatus::Unsigned;

        let mut packet = DnsPacket::new();
        packet.header.response = true;
        packet.header.authoritative_answer = true;

        let node = tree.find_exact(&qname);
        let records: Vec<DnsRecord> = node
            .and_then(|node| node.entries.get(qtype))
            .map(|set| {
                set.zone_records()
                    .iter()
                    .filter(|zr| !zr.disabled)
                    .map(|zr| zr.record.clone())
                    .collect()
            })
            .unwrap_or_default();

        if !records.is_empty() {
            packet.answers = records;
            if dnssec_ok && signed {
                if let Some(rrsig_set) = node.and_then(|n| n.entries.get(QueryType::Rrsig)) {
                    for rec in rrsig_set.records() {
                        if let DnsRecord::Rrsig { type_covered, .. } = rec {
                            if *type_covered == qtype {
                                packet.answers.push(rec.clone());
                            }
                        }
                    }
                }
            }
            return packet;
        }

        // Negative answer: NODATA when the name exists, NXDOMAIN otherwise.
        if node.is_none() {
            packet.header.rescode = ResultCode::NXDOMAIN;
        }
        if let Ok(soa) = self.soa_record(&tree) {
            packet.authorities.push(soa);
        }
        if dnssec_ok && signed {
            if let Some(apex_node) = tree.find_exact(&self.apex) {
                if let Some(rrsig_set) = apex_node.entries.get(QueryType::Rrsig) {
                    for rec in rrsig_set.records() {
                        if let DnsRecord::Rrsig { type_covered, .. } = rec {
                            if *type_covered == QueryType::Soa {
                                packet.authorities.push(rec.clone());
                            }
                        }
                    }
                }
            }
            self.add_denial_proofs(&tree, &qname, &mut packet);
        }

        packet
    }

    /// Attach the NSEC/NSEC3 records proving the negative answer.
    fn add_denial_proofs(&self, tree: &ZoneTree, qname: &DomainName, packet: &mut DnsPacket) {
        match self.status() {
            DnssecStatus::SignedWithNsec => {
                // The covering NSEC is at the closest preceding covered name.
                let covering = if tree.find_exact(qname).is_some() {
                    Some(qname.clone())
                } else {
                    tree.previous_subdomain(&self.apex, qname)
                        .map(|node| node.name.clone())
                        .or_else(|| Some(self.apex.clone()))
                };
                if let Some(owner) = covering {
                    self.push_denial_rrset(tree, &owner, QueryType::Nsec, packet);
                }
            }
            DnssecStatus::SignedWithNsec3 => {
                let (iterations, salt) = {
                    let params = self.dnssec.read();
                    (params.nsec3_iterations, params.nsec3_salt.clone())
                };
                if let Ok(digest) = crate::dns::denial::nsec3_hash(qname, &salt, iterations) {
                    let hashed = crate::dns::denial::hashed_owner_name(&digest, &self.apex);
                    // Exact match or the covering record preceding the hash.
                    let owner = if tree.find_exact(&hashed).is_some() {
                        Some(hashed)
                    } else {
                        tree.previous_subdomain(&self.apex, &hashed)
                            .filter(|node| node.entries.get(QueryType::Nsec3).is_some())
                            .map(|node| node.name.clone())
                    };
                    if let Some(owner) = owner {
                        self.push_denial_rrset(tree, &owner, QueryType::Nsec3, packet);
                    }
                }
            }
            DnssecStatus::Unsigned => {}
        }
    }

    fn push_denial_rrset(
        &self,
        tree: &ZoneTree,
        owner: &DomainName,
        qtype: QueryType,
        packet: &mut DnsPacket,
    ) {
        if let Some(node) = tree.find_exact(owner) {
            if let Some(set) = node.entries.get(qtype) {
                packet.authorities.extend(set.records().cloned());
            }
            if let Some(rrsig_set) = node.entries.get(QueryType::Rrsig) {
                for rec in rrsig_set.records() {
                    if let DnsRecord::Rrsig { type_covered, .. } = rec {
                        if *type_covered == qtype {
                            packet.authorities.push(rec.clone());
                        }
                    }
                }
            }
        }
    }
}

impl Drop for PrimaryZone {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }
}

fn random_salt(length: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen::<u8>()).collect()
}
