//! Authenticated denial of existence
//!
//! Builds and maintains the NSEC and NSEC3 chains of a signed zone. The
//! ring is never stored as pointers: denial records live as ordinary
//! RRSets at their owner (or hashed-owner) names, and "previous/next" is
//! resolved through canonical zone tree order. base32hex preserves byte
//! order, so the hashed-owner nodes sort in hash order and NSEC3
//! predecessor lookups are the same tree scan NSEC uses.

use data_encoding::BASE32_DNSSEC;
use openssl::hash::{hash, MessageDigest};

use crate::dns::authority::ZoneTree;
use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::dnssec::{sign_rrset, SigningContext};
use crate::dns::errors::{ZoneError, ZoneResult};
use crate::dns::history::CommitBatch;
use crate::dns::protocol::{DnsRecord, DomainName, QueryType, TransientTtl};
use crate::dns::rrset::ZoneRecord;

/// NSEC3 iteration ceiling; anything above it only burns CPU on both
/// sides (RFC 9276 wants 0).
pub const MAX_NSEC3_ITERATIONS: u16 = 50;
/// NSEC3 salt length ceiling (RFC 5155 caps the field at 255; the engine
/// follows the stricter operational bound).
pub const MAX_NSEC3_SALT_LEN: usize = 32;

const SHA1_HASH_ALGORITHM: u8 = 1;

/// Validate NSEC3 parameters before any chain work starts.
pub fn validate_nsec3_params(zone: &str, iterations: u16, salt: &[u8]) -> ZoneResult<()> {
    if iterations > MAX_NSEC3_ITERATIONS {
        return Err(ZoneError::InvalidParameter {
            zone: zone.to_string(),
            detail: format!(
                "NSEC3 iterations {} above maximum {}",
                iterations, MAX_NSEC3_ITERATIONS
            ),
        });
    }
    if salt.len() > MAX_NSEC3_SALT_LEN {
        return Err(ZoneError::InvalidParameter {
            zone: zone.to_string(),
            detail: format!(
                "NSEC3 salt length {} above maximum {}",
                salt.len(),
                MAX_NSEC3_SALT_LEN
            ),
        });
    }
    Ok(())
}

/// The iterated SHA-1 of RFC 5155 section 5 over the canonical owner name.
pub fn nsec3_hash(owner: &DomainName, salt: &[u8], iterations: u16) -> ZoneResult<Vec<u8>> {
    let mut buffer = VectorPacketBuffer::new();
    buffer
        .write_qname_canonical(owner.as_str())
        .map_err(|e| ZoneError::Protocol {
            zone: owner.as_str().to_string(),
            detail: e.to_string(),
        })?;

    let mut input = buffer.into_bytes();
    input.extend_from_slice(salt);
    let mut digest = sha1(&input)?;

    for _ in 0..iterations {
        let mut next = digest;
        next.extend_from_slice(salt);
        digest = sha1(&next)?;
    }

    Ok(digest)
}

fn sha1(data: &[u8]) -> ZoneResult<Vec<u8>> {
    hash(MessageDigest::sha1(), data)
        .map(|d| d.to_vec())
        .map_err(|e| ZoneError::Crypto {
            zone: String::new(),
            detail: e.to_string(),
        })
}

/// The tree node name an NSEC3 record lives at: base32hex(hash).apex
pub fn hashed_owner_name(hash: &[u8], apex: &DomainName) -> DomainName {
    apex.prepend(&BASE32_DNSSEC.encode(hash))
}

/// True when the node holds something besides denial records and
/// signatures; only such names are covered by the chains directly.
fn has_authoritative_content(tree: &ZoneTree, name: &DomainName) -> bool {
    tree.find_exact(name)
        .map(|node| !node.entries.has_only_dnssec_records())
        .unwrap_or(false)
}

/// True when any name strictly below `name` carries authoritative content.
fn subtree_has_content(tree: &ZoneTree, name: &DomainName) -> bool {
    tree.zone_with_subdomains(name)
        .iter()
        .any(|node| node.name != *name && !node.entries.has_only_dnssec_records())
}

/// Names with content at or under the apex, in canonical order.
fn content_names(tree: &ZoneTree, apex: &DomainName) -> Vec<DomainName> {
    tree.zone_with_subdomains(apex)
        .iter()
        .filter(|node| has_authoritative_content(tree, &node.name))
        .map(|node| node.name.clone())
        .collect()
}

/// The ancestors of `name` strictly between it and the apex.
fn ancestors_below_apex(name: &DomainName, apex: &DomainName) -> Vec<DomainName> {
    let mut out = Vec::new();
    let mut cursor = name.parent();
    while let Some(candidate) = cursor {
        if candidate == *apex || !candidate.is_subdomain_of(apex) {
            break;
        }
        cursor = candidate.parent();
        out.push(candidate);
    }
    out
}

/// Install `rrsigs` for the denial record at `name`, tracking history.
fn install_denial_rrsigs(
    tree: &mut ZoneTree,
    name: &DomainName,
    rrsigs: Vec<DnsRecord>,
    batch: &mut CommitBatch,
) {
    let node = tree.get_or_create(name);
    batch.added_rrsigs.extend(rrsigs.clone());
    let replaced = node.entries.add_or_update_rrsigs(rrsigs);
    batch.deleted_rrsigs.extend(replaced);
}

// ---------------------------------------------------------------------------
// NSEC
// ---------------------------------------------------------------------------

/// Build the NSEC chain for the whole zone.
///
/// Covered names are iterated in canonical order; each NSEC points at the
/// next one and the last wraps to the apex. Every NSEC is signed.
pub fn enable_nsec(
    tree: &mut ZoneTree,
    apex: &DomainName,
    ctx: &SigningContext<'_>,
    ttl: u32,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let names = content_names(tree, apex);
    if names.is_empty() {
        return Ok(());
    }
    log::debug!("building NSEC chain for {} names under {}", names.len(), apex);

    for (idx, name) in names.iter().enumerate() {
        let next_name = &names[(idx + 1) % names.len()];
        let record = build_nsec(tree, name, next_name, ttl);

        let node = tree.get_or_create(name);
        let prior = node
            .entries
            .set(QueryType::Nsec, vec![ZoneRecord::new(record.clone())])
            .map_err(|e| ZoneError::InvalidRRSet {
                zone: apex.as_str().to_string(),
                detail: e.to_string(),
            })?;
        batch.deleted.extend(prior);
        batch.added.push(record.clone());

        let rrsigs = sign_rrset(ctx, name, &[record])?;
        install_denial_rrsigs(tree, name, rrsigs, batch);
    }

    Ok(())
}

/// Remove every NSEC and its signatures.
pub fn disable_nsec(tree: &mut ZoneTree, apex: &DomainName, batch: &mut CommitBatch) {
    let names = tree.names_under(apex);

    for name in names {
        if let Some(node) = tree.find_exact_mut(&name) {
            batch.deleted.extend(node.entries.delete(QueryType::Nsec));
            batch
                .deleted_rrsigs
                .extend(node.entries.delete_rrsigs_covering(QueryType::Nsec));
            if node.entries.is_empty() && name != *apex {
                tree.remove(&name);
            }
        }
    }
}

fn build_nsec(tree: &ZoneTree, name: &DomainName, next_name: &DomainName, ttl: u32) -> DnsRecord {
    let mut types = tree
        .find_exact(name)
        .map(|node| node.entries.present_types())
        .unwrap_or_default();
    if !types.contains(&QueryType::Nsec) {
        types.push(QueryType::Nsec);
    }
    if !types.contains(&QueryType::Rrsig) {
        types.push(QueryType::Rrsig);
    }

    DnsRecord::Nsec {
        domain: name.as_str().to_string(),
        next_name: next_name.as_str().to_string(),
        types,
        ttl: TransientTtl(ttl),
    }
}

/// Re-link the NSEC chain around `owner` after its RRSets changed.
///
/// A node that gained content is spliced in behind its canonical
/// predecessor; a node that lost all content is removed and the
/// predecessor re-pointed at its successor; otherwise only the type
/// bitmap is refreshed. Touched NSEC records are re-signed.
pub fn relink_nsec(
    tree: &mut ZoneTree,
    apex: &DomainName,
    owner: &DomainName,
    ctx: &SigningContext<'_>,
    ttl: u32,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let covered = has_authoritative_content(tree, owner);
    let existing = tree
        .find_exact(owner)
        .and_then(|node| node.entries.get(QueryType::Nsec))
        .map(|set| set.to_records());

    match (covered, existing) {
        // Bitmap refresh on a node that stays covered.
        (true, Some(existing)) => {
            let next_name = nsec_next_name(&existing[0]);
            let record = build_nsec(tree, owner, &next_name, ttl);
            if existing[0] != record || nsec_types(&existing[0]) != nsec_types(&record) {
                replace_nsec(tree, apex, owner, record, ctx, batch)?;
            } else {
                // rdata unchanged; refresh the signature anyway since the
                // covered set's RRSIG was replaced by this mutation.
                let rrsigs = sign_rrset(ctx, owner, &existing)?;
                install_denial_rrsigs(tree, owner, rrsigs, batch);
            }
        }
        // Splice a new name into the ring.
        (true, None) => {
            let prev_name = previous_nsec_owner(tree, apex, owner);
            let prev_nsec = tree
                .find_exact(&prev_name)
                .and_then(|node| node.entries.get(QueryType::Nsec))
                .map(|set| set.to_records());

            let next_name = match &prev_nsec {
                Some(records) => nsec_next_name(&records[0]),
                None => apex.clone(),
            };

            let record = build_nsec(tree, owner, &next_name, ttl);
            replace_nsec(tree, apex, owner, record, ctx, batch)?;

            if prev_nsec.is_some() && prev_name != *owner {
                let repointed = build_nsec(tree, &prev_name, owner, ttl);
                replace_nsec(tree, apex, &prev_name, repointed, ctx, batch)?;
            }
        }
        // Unsplice a name that lost its content.
        (false, Some(existing)) => {
            let successor = nsec_next_name(&existing[0]);

            if let Some(node) = tree.find_exact_mut(owner) {
                batch.deleted.extend(node.entries.delete(QueryType::Nsec));
                batch
                    .deleted_rrsigs
                    .extend(node.entries.delete_rrsigs_covering(QueryType::Nsec));
                if node.entries.is_empty() {
                    tree.remove(owner);
                }
            }

            let prev_name = previous_nsec_owner(tree, apex, owner);
            if prev_name != *owner {
                let repointed = build_nsec(tree, &prev_name, &successor, ttl);
                replace_nsec(tree, apex, &prev_name, repointed, ctx, batch)?;
            }
        }
        (false, None) => {}
    }

    Ok(())
}

fn nsec_next_name(record: &DnsRecord) -> DomainName {
    match record {
        DnsRecord::Nsec { next_name, .. } => DomainName::new(next_name),
        _ => DomainName::root(),
    }
}

fn nsec_types(record: &DnsRecord) -> Vec<QueryType> {
    match record {
        DnsRecord::Nsec { types, .. } => {
            let mut sorted: Vec<QueryType> = types.clone();
            sorted.sort_by_key(|t| t.to_num());
            sorted
        }
        _ => Vec::new(),
    }
}

fn replace_nsec(
    tree: &mut ZoneTree,
    apex: &DomainName,
    owner: &DomainName,
    record: DnsRecord,
    ctx: &SigningContext<'_>,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let node = tree.get_or_create(owner);
    let prior = node
        .entries
        .set(QueryType::Nsec, vec![ZoneRecord::new(record.clone())])
        .map_err(|e| ZoneError::InvalidRRSet {
            zone: apex.as_str().to_string(),
            detail: e.to_string(),
        })?;
    batch.deleted.extend(prior);
    batch.added.push(record.clone());

    let rrsigs = sign_rrset(ctx, owner, &[record])?;
    install_denial_rrsigs(tree, owner, rrsigs, batch);
    Ok(())
}

/// The canonical predecessor of `owner` among NSEC-covered names,
/// wrapping to the last covered name of the zone.
fn previous_nsec_owner(tree: &ZoneTree, apex: &DomainName, owner: &DomainName) -> DomainName {
    let mut before = owner.clone();
    loop {
        match tree.previous_subdomain(apex, &before) {
            Some(node) => {
                if node.entries.get(QueryType::Nsec).is_some() {
                    return node.name.clone();
                }
                before = node.name.clone();
            }
            None => break,
        }
    }

    // Nothing before us: wrap to the last covered name in the zone.
    tree.zone_with_subdomains(apex)
        .iter()
        .rev()
        .find(|node| node.entries.get(QueryType::Nsec).is_some() && node.name != *owner)
        .map(|node| node.name.clone())
        .unwrap_or_else(|| apex.clone())
}

// ---------------------------------------------------------------------------
// NSEC3
// ---------------------------------------------------------------------------

/// Build the NSEC3 chain plus the apex NSEC3PARAM.
///
/// Covered names are the content names plus every empty non-terminal
/// between them and the apex. Entries are hashed, sorted, deduplicated by
/// type-bitmap union, and linked into a ring of next-hashed-owner fields.
pub fn enable_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    ctx: &SigningContext<'_>,
    ttl: u32,
    iterations: u16,
    salt: &[u8],
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    validate_nsec3_params(apex.as_str(), iterations, salt)?;

    // Publish the parameters first so the apex bitmap carries NSEC3PARAM.
    let param = DnsRecord::Nsec3Param {
        domain: apex.as_str().to_string(),
        hash_algorithm: SHA1_HASH_ALGORITHM,
        flags: 0,
        iterations,
        salt: salt.to_vec(),
        ttl: TransientTtl(ttl),
    };
    let node = tree.get_or_create(apex);
    let prior = node
        .entries
        .set(QueryType::Nsec3Param, vec![ZoneRecord::new(param.clone())])
        .map_err(|e| ZoneError::InvalidRRSet {
            zone: apex.as_str().to_string(),
            detail: e.to_string(),
        })?;
    batch.deleted.extend(prior);
    batch.added.push(param.clone());
    let rrsigs = sign_rrset(ctx, apex, &[param])?;
    install_denial_rrsigs(tree, apex, rrsigs, batch);

    // Collect covered names: content plus empty non-terminals.
    let names = content_names(tree, apex);
    let mut covered: Vec<(DomainName, Vec<QueryType>)> = Vec::new();
    let mut ents: Vec<DomainName> = Vec::new();

    for name in &names {
        let mut types = tree
            .find_exact(name)
            .map(|node| node.entries.present_types())
            .unwrap_or_default();
        types.retain(|t| !matches!(t, QueryType::Nsec | QueryType::Nsec3));
        if !types.contains(&QueryType::Rrsig) {
            types.push(QueryType::Rrsig);
        }
        covered.push((name.clone(), types));

        for ancestor in ancestors_below_apex(name, apex) {
            if !names.contains(&ancestor) && !ents.contains(&ancestor) {
                log::debug!("found empty non-terminal at {}", ancestor);
                ents.push(ancestor);
            }
        }
    }
    for ent in ents {
        // An ENT owns no RRSets, so its bitmap is empty.
        covered.push((ent, Vec::new()));
    }

    // Hash, sort by hashed owner, merge duplicates by bitmap union.
    let mut entries: Vec<(Vec<u8>, Vec<QueryType>)> = Vec::with_capacity(covered.len());
    for (name, types) in covered {
        let digest = nsec3_hash(&name, salt, iterations)?;
        entries.push((digest, types));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut merged: Vec<(Vec<u8>, Vec<QueryType>)> = Vec::with_capacity(entries.len());
    for (digest, types) in entries {
        // Hash collisions merge by union of their type bitmaps.
        if let Some(last) = merged.last_mut() {
            if last.0 == digest {
                for t in types {
                    if !last.1.contains(&t) {
                        last.1.push(t);
                    }
                }
                continue;
            }
        }
        merged.push((digest, types));
    }

    // Form the ring and store each record at its hashed owner.
    for (idx, (digest, types)) in merged.iter().enumerate() {
        let next_hashed = merged[(idx + 1) % merged.len()].0.clone();
        let record = DnsRecord::Nsec3 {
            domain: hashed_owner_name(digest, apex).as_str().to_string(),
            hash_algorithm: SHA1_HASH_ALGORITHM,
            flags: 0,
            iterations,
            salt: salt.to_vec(),
            next_hashed,
            types: types.clone(),
            ttl: TransientTtl(ttl),
        };
        store_nsec3(tree, apex, record, ctx, batch)?;
    }

    Ok(())
}

/// Remove every NSEC3, the NSEC3PARAM, their signatures, and the
/// now-empty hashed-owner nodes.
pub fn disable_nsec3(tree: &mut ZoneTree, apex: &DomainName, batch: &mut CommitBatch) {
    if let Some(node) = tree.find_exact_mut(apex) {
        batch.deleted.extend(node.entries.delete(QueryType::Nsec3Param));
        batch
            .deleted_rrsigs
            .extend(node.entries.delete_rrsigs_covering(QueryType::Nsec3Param));
    }

    let names = tree.names_under(apex);

    for name in names {
        if let Some(node) = tree.find_exact_mut(&name) {
            batch.deleted.extend(node.entries.delete(QueryType::Nsec3));
            batch
                .deleted_rrsigs
                .extend(node.entries.delete_rrsigs_covering(QueryType::Nsec3));
            if node.entries.is_empty() && name != *apex {
                tree.remove(&name);
            }
        }
    }
}

/// Re-link the NSEC3 ring around `owner` after its RRSets changed.
///
/// Covers the owner itself and the empty non-terminals on its path to the
/// apex: names that gained coverage are spliced into the ring, names whose
/// subtree emptied are unspliced and garbage-collected.
pub fn relink_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    owner: &DomainName,
    ctx: &SigningContext<'_>,
    ttl: u32,
    iterations: u16,
    salt: &[u8],
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let mut affected = vec![owner.clone()];
    affected.extend(ancestors_below_apex(owner, apex));

    for name in affected {
        let is_content = has_authoritative_content(tree, &name);
        let is_live_ent = !is_content && name != *apex && subtree_has_content(tree, &name);
        let should_cover = is_content || is_live_ent;

        let mut types = if is_content {
            let mut t = tree
                .find_exact(&name)
                .map(|node| node.entries.present_types())
                .unwrap_or_default();
            t.retain(|qt| !matches!(qt, QueryType::Nsec | QueryType::Nsec3));
            if !t.contains(&QueryType::Rrsig) {
                t.push(QueryType::Rrsig);
            }
            t
        } else {
            Vec::new()
        };
        types.sort_by_key(|t| t.to_num());

        let digest = nsec3_hash(&name, salt, iterations)?;
        let node_name = hashed_owner_name(&digest, apex);
        let existing = tree
            .find_exact(&node_name)
            .and_then(|node| node.entries.get(QueryType::Nsec3))
            .map(|set| set.to_records());

        match (should_cover, existing) {
            (true, Some(existing)) => {
                if let DnsRecord::Nsec3 {
                    next_hashed,
                    types: old_types,
                    ..
                } = &existing[0]
                {
                    let mut old_sorted = old_types.clone();
                    old_sorted.sort_by_key(|t| t.to_num());
                    if old_sorted != types {
                        let record = DnsRecord::Nsec3 {
                            domain: node_name.as_str().to_string(),
                            hash_algorithm: SHA1_HASH_ALGORITHM,
                            flags: 0,
                            iterations,
                            salt: salt.to_vec(),
                            next_hashed: next_hashed.clone(),
                            types,
                            ttl: TransientTtl(ttl),
                        };
                        store_nsec3(tree, apex, record, ctx, batch)?;
                    }
                }
            }
            (true, None) => {
                splice_nsec3(
                    tree, apex, &digest, &node_name, types, ctx, ttl, iterations, salt, batch,
                )?;
            }
            (false, Some(existing)) => {
                unsplice_nsec3(tree, apex, &node_name, &existing[0], ctx, ttl, batch)?;
            }
            (false, None) => {}
        }
    }

    Ok(())
}

/// Hashed-owner node names carrying NSEC3, in hash order.
fn nsec3_node_names(tree: &ZoneTree, apex: &DomainName) -> Vec<DomainName> {
    tree.zone_with_subdomains(apex)
        .iter()
        .filter(|node| node.entries.get(QueryType::Nsec3).is_some())
        .map(|node| node.name.clone())
        .collect()
}

fn store_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    record: DnsRecord,
    ctx: &SigningContext<'_>,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let owner = record.name();
    let node = tree.get_or_create(&owner);
    let prior = node
        .entries
        .set(QueryType::Nsec3, vec![ZoneRecord::new(record.clone())])
        .map_err(|e| ZoneError::InvalidRRSet {
            zone: apex.as_str().to_string(),
            detail: e.to_string(),
        })?;
    batch.deleted.extend(prior);
    batch.added.push(record.clone());

    let rrsigs = sign_rrset(ctx, &owner, &[record])?;
    install_denial_rrsigs(tree, &owner, rrsigs, batch);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn splice_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    digest: &[u8],
    node_name: &DomainName,
    types: Vec<QueryType>,
    ctx: &SigningContext<'_>,
    ttl: u32,
    iterations: u16,
    salt: &[u8],
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let ring = nsec3_node_names(tree, apex);

    let (next_hashed, predecessor) = if ring.is_empty() {
        // First entry points at itself.
        (digest.to_vec(), None)
    } else {
        let pred_name = ring
            .iter()
            .rev()
            .find(|name| **name < *node_name)
            .cloned()
            .unwrap_or_else(|| ring.last().cloned().unwrap());
        let pred_next = tree
            .find_exact(&pred_name)
            .and_then(|node| node.entries.get(QueryType::Nsec3))
            .and_then(|set| set.records().next().cloned())
            .and_then(|rec| match rec {
                DnsRecord::Nsec3 { next_hashed, .. } => Some(next_hashed),
                _ => None,
            })
            .unwrap_or_else(|| digest.to_vec());
        (pred_next, Some(pred_name))
    };

    let record = DnsRecord::Nsec3 {
        domain: node_name.as_str().to_string(),
        hash_algorithm: SHA1_HASH_ALGORITHM,
        flags: 0,
        iterations,
        salt: salt.to_vec(),
        next_hashed,
        types,
        ttl: TransientTtl(ttl),
    };
    store_nsec3(tree, apex, record, ctx, batch)?;

    if let Some(pred_name) = predecessor {
        repoint_nsec3(tree, apex, &pred_name, digest.to_vec(), ctx, ttl, batch)?;
    }

    Ok(())
}

fn unsplice_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    node_name: &DomainName,
    removed: &DnsRecord,
    ctx: &SigningContext<'_>,
    ttl: u32,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let successor_hash = match removed {
        DnsRecord::Nsec3 { next_hashed, .. } => next_hashed.clone(),
        _ => return Ok(()),
    };

    if let Some(node) = tree.find_exact_mut(node_name) {
        batch.deleted.extend(node.entries.delete(QueryType::Nsec3));
        batch
            .deleted_rrsigs
            .extend(node.entries.delete_rrsigs_covering(QueryType::Nsec3));
        if node.entries.is_empty() {
            tree.remove(node_name);
        }
    }

    let ring = nsec3_node_names(tree, apex);
    if ring.is_empty() {
        return Ok(());
    }

    let pred_name = ring
        .iter()
        .rev()
        .find(|name| **name < *node_name)
        .cloned()
        .unwrap_or_else(|| ring.last().cloned().unwrap());
    repoint_nsec3(tree, apex, &pred_name, successor_hash, ctx, ttl, batch)?;

    Ok(())
}

fn repoint_nsec3(
    tree: &mut ZoneTree,
    apex: &DomainName,
    pred_name: &DomainName,
    next_hashed: Vec<u8>,
    ctx: &SigningContext<'_>,
    ttl: u32,
    batch: &mut CommitBatch,
) -> ZoneResult<()> {
    let existing = tree
        .find_exact(pred_name)
        .and_then(|node| node.entries.get(QueryType::Nsec3))
        .and_then(|set| set.records().next().cloned());

    if let Some(DnsRecord::Nsec3 {
        hash_algorithm,
        flags,
        iterations,
        salt,
        types,
        next_hashed: old_next,
        ..
    }) = existing
    {
        if old_next == next_hashed {
            return Ok(());
        }
        let record = DnsRecord::Nsec3 {
            domain: pred_name.as_str().to_string(),
            hash_algorithm,
            flags,
            iterations,
            salt,
            next_hashed,
            types,
            ttl: TransientTtl(ttl),
        };
        store_nsec3(tree, apex, record, ctx, batch)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::dnssec::{DnssecAlgorithm, DnssecKey, KeyState, KeyType};
    use chrono::{DateTime, Utc};
    use std::net::Ipv4Addr;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn test_keys() -> Vec<DnssecKey> {
        let mut ksk =
            DnssecKey::generate(KeyType::KSK, DnssecAlgorithm::EcdsaP256Sha256, 0, now()).unwrap();
        let mut zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        ksk.transition(KeyState::Ready, now());
        zsk.transition(KeyState::Active, now());
        vec![ksk, zsk]
    }

    fn seed_tree(names: &[(&str, u8)]) -> ZoneTree {
        let mut tree = ZoneTree::new();
        for (name, octet) in names {
            let domain = DomainName::new(name);
            let node = tree.get_or_create(&domain);
            node.entries
                .add(
                    DnsRecord::A {
                        domain: name.to_string(),
                        addr: Ipv4Addr::new(192, 0, 2, *octet),
                        ttl: TransientTtl(300),
                    }
                    .into(),
                )
                .unwrap();
        }
        tree
    }

    fn nsec_at(tree: &ZoneTree, name: &str) -> Option<DnsRecord> {
        tree.find_exact(&DomainName::new(name))
            .and_then(|node| node.entries.get(QueryType::Nsec))
            .and_then(|set| set.records().next().cloned())
    }

    fn assert_nsec_ring(tree: &ZoneTree, apex: &DomainName) {
        let covered: Vec<DomainName> = tree
            .zone_with_subdomains(apex)
            .iter()
            .filter(|node| node.entries.get(QueryType::Nsec).is_some())
            .map(|node| node.name.clone())
            .collect();
        assert!(!covered.is_empty());

        for (idx, name) in covered.iter().enumerate() {
            let expected_next = &covered[(idx + 1) % covered.len()];
            let nsec = nsec_at(tree, name.as_str()).unwrap();
            match nsec {
                DnsRecord::Nsec { next_name, .. } => {
                    assert_eq!(
                        DomainName::new(&next_name),
                        *expected_next,
                        "NSEC at {} should point to {}",
                        name,
                        expected_next
                    );
                }
                _ => panic!("expected NSEC"),
            }
        }
    }

    fn assert_nsec3_ring(tree: &ZoneTree, apex: &DomainName) -> usize {
        let nodes = nsec3_node_names(tree, apex);
        assert!(!nodes.is_empty());

        for (idx, name) in nodes.iter().enumerate() {
            let next_node = &nodes[(idx + 1) % nodes.len()];
            let record = tree
                .find_exact(name)
                .and_then(|node| node.entries.get(QueryType::Nsec3))
                .and_then(|set| set.records().next().cloned())
                .unwrap();
            match record {
                DnsRecord::Nsec3 { next_hashed, .. } => {
                    assert_eq!(&hashed_owner_name(&next_hashed, apex), next_node);
                }
                _ => panic!("expected NSEC3"),
            }
        }
        nodes.len()
    }

    #[test]
    fn test_nsec3_hash_matches_rfc_vector() {
        // RFC 5155 Appendix A: H(example) with salt aabbccdd, 12 extra
        // iterations is 0p9mhaveqvm6t7vbl5lop2u3t2rp3tom.
        let digest = nsec3_hash(
            &DomainName::new("example"),
            &[0xaa, 0xbb, 0xcc, 0xdd],
            12,
        )
        .unwrap();
        assert_eq!(
            BASE32_DNSSEC.encode(&digest),
            "0p9mhaveqvm6t7vbl5lop2u3t2rp3tom"
        );
    }

    #[test]
    fn test_param_validation_boundaries() {
        assert!(validate_nsec3_params("example.com", 0, &[]).is_ok());
        assert!(validate_nsec3_params("example.com", 50, &[0u8; 32]).is_ok());
        assert!(validate_nsec3_params("example.com", 51, &[]).is_err());
        assert!(validate_nsec3_params("example.com", 10, &[0u8; 33]).is_err());
    }

    #[test]
    fn test_enable_nsec_builds_ring() {
        let apex = DomainName::new("example.com");
        let mut tree = seed_tree(&[
            ("example.com", 1),
            ("www.example.com", 2),
            ("mail.example.com", 3),
        ]);
        let keys = test_keys();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };
        let mut batch = CommitBatch::new();

        enable_nsec(&mut tree, &apex, &ctx, 900, &mut batch).unwrap();

        assert_nsec_ring(&tree, &apex);
        // Last NSEC wraps to the apex.
        let last = nsec_at(&tree, "www.example.com").unwrap();
        match last {
            DnsRecord::Nsec {
                next_name, types, ..
            } => {
                assert_eq!(next_name, "example.com");
                assert!(types.contains(&QueryType::A));
                assert!(types.contains(&QueryType::Nsec));
                assert!(types.contains(&QueryType::Rrsig));
            }
            _ => panic!("expected NSEC"),
        }
    }

    #[test]
    fn test_relink_nsec_splice_and_unsplice() {
        let apex = DomainName::new("example.com");
        let mut tree = seed_tree(&[("example.com", 1), ("www.example.com", 2)]);
        let keys = test_keys();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };
        let mut batch = CommitBatch::new();
        enable_nsec(&mut tree, &apex, &ctx, 900, &mut batch).unwrap();

        // Add mail.example.com and splice it in.
        let mail = DomainName::new("mail.example.com");
        tree.get_or_create(&mail)
            .entries
            .add(
                DnsRecord::A {
                    domain: "mail.example.com".to_string(),
                    addr: Ipv4Addr::new(192, 0, 2, 3),
                    ttl: TransientTtl(300),
                }
                .into(),
            )
            .unwrap();
        let mut batch = CommitBatch::new();
        relink_nsec(&mut tree, &apex, &mail, &ctx, 900, &mut batch).unwrap();
        assert_nsec_ring(&tree, &apex);

        // Remove it again and verify the ring heals.
        tree.find_exact_mut(&mail)
            .unwrap()
            .entries
            .delete(QueryType::A);
        let mut batch = CommitBatch::new();
        relink_nsec(&mut tree, &apex, &mail, &ctx, 900, &mut batch).unwrap();

        assert!(tree.find_exact(&mail).is_none());
        assert_nsec_ring(&tree, &apex);
        match nsec_at(&tree, "example.com").unwrap() {
            DnsRecord::Nsec { next_name, .. } => assert_eq!(next_name, "www.example.com"),
            _ => panic!("expected NSEC"),
        }
    }

    #[test]
    fn test_enable_nsec3_materializes_ents() {
        let apex = DomainName::new("example.com");
        // a.b.c.example.com with no explicit b.c / c nodes: two ENTs.
        let mut tree = seed_tree(&[("example.com", 1), ("a.b.c.example.com", 2)]);
        let keys = test_keys();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };
        let mut batch = CommitBatch::new();

        enable_nsec3(&mut tree, &apex, &ctx, 900, 10, &[0xab, 0xcd, 0xef, 0x01], &mut batch)
            .unwrap();

        // apex, a.b.c, ENT b.c, ENT c: one ring of four records.
        assert_eq!(assert_nsec3_ring(&tree, &apex), 4);

        // The NSEC3PARAM is published and signed at the apex.
        let apex_node = tree.find_exact(&apex).unwrap();
        assert!(apex_node.entries.get(QueryType::Nsec3Param).is_some());

        // ENT records carry an empty bitmap.
        let ent_hash = nsec3_hash(
            &DomainName::new("b.c.example.com"),
            &[0xab, 0xcd, 0xef, 0x01],
            10,
        )
        .unwrap();
        let ent_node = tree
            .find_exact(&hashed_owner_name(&ent_hash, &apex))
            .unwrap();
        let rrset = ent_node.entries.get(QueryType::Nsec3).unwrap();
        let record = rrset.records().next().unwrap();
        match record {
            DnsRecord::Nsec3 { types, .. } => assert!(types.is_empty()),
            _ => panic!("expected NSEC3"),
        }
    }

    #[test]
    fn test_relink_nsec3_handles_ents() {
        let apex = DomainName::new("example.com");
        let mut tree = seed_tree(&[("example.com", 1)]);
        let keys = test_keys();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };
        let salt = [0x01, 0x02];
        let mut batch = CommitBatch::new();
        enable_nsec3(&mut tree, &apex, &ctx, 900, 5, &salt, &mut batch).unwrap();
        assert_eq!(assert_nsec3_ring(&tree, &apex), 1);

        // Adding a deep name creates its NSEC3 and the ENT's.
        let deep = DomainName::new("x.y.example.com");
        tree.get_or_create(&deep)
            .entries
            .add(
                DnsRecord::A {
                    domain: "x.y.example.com".to_string(),
                    addr: Ipv4Addr::new(192, 0, 2, 9),
                    ttl: TransientTtl(300),
                }
                .into(),
            )
            .unwrap();
        let mut batch = CommitBatch::new();
        relink_nsec3(&mut tree, &apex, &deep, &ctx, 900, 5, &salt, &mut batch).unwrap();
        assert_eq!(assert_nsec3_ring(&tree, &apex), 3);

        // Deleting it collapses the ring back to the apex alone.
        tree.find_exact_mut(&deep)
            .unwrap()
            .entries
            .delete(QueryType::A);
        let mut batch = CommitBatch::new();
        relink_nsec3(&mut tree, &apex, &deep, &ctx, 900, 5, &salt, &mut batch).unwrap();
        assert_eq!(assert_nsec3_ring(&tree, &apex), 1);
    }

    #[test]
    fn test_disable_removes_all_denial_state() {
        let apex = DomainName::new("example.com");
        let mut tree = seed_tree(&[("example.com", 1), ("a.b.example.com", 2)]);
        let keys = test_keys();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };
        let mut batch = CommitBatch::new();
        enable_nsec3(&mut tree, &apex, &ctx, 900, 3, &[0xaa], &mut batch).unwrap();

        let mut batch = CommitBatch::new();
        disable_nsec3(&mut tree, &apex, &mut batch);

        assert!(nsec3_node_names(&tree, &apex).is_empty());
        assert!(tree
            .find_exact(&apex)
            .unwrap()
            .entries
            .get(QueryType::Nsec3Param)
            .is_none());
        // The hashed-owner nodes are gone; only the two content nodes remain.
        assert_eq!(tree.zone_with_subdomains(&apex).len(), 2);
    }
}
