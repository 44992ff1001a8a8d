//! implements the DNS protocol in a transport agnostic fashion
//!
//! Alongside the packet structures this module carries the canonical name
//! ordering of RFC 4034 section 6.1, which the zone tree and the denial
//! chains are built on.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde_derive::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// DNS class; the engine is IN-only.
pub const CLASS_IN: u16 = 1;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown takes an integer parameter in order to retain
/// the id of an unknown query when compiling the reply. An integer can be
/// converted to a querytype using the `from_num` function, and back to an
/// integer using the `to_num` method.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,          // 1
    Ns,         // 2
    Cname,      // 5
    Soa,        // 6
    Mx,         // 15
    Txt,        // 16
    Aaaa,       // 28
    Srv,        // 33
    Ds,         // 43
    Rrsig,      // 46
    Nsec,       // 47
    Dnskey,     // 48
    Nsec3,      // 50
    Nsec3Param, // 51
    Ixfr,       // 251
    Axfr,       // 252
    App,        // 65282 (private use: application records)
    Aname,      // 65305 (draft; the number other servers use)
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Ds => 43,
            QueryType::Rrsig => 46,
            QueryType::Nsec => 47,
            QueryType::Dnskey => 48,
            QueryType::Nsec3 => 50,
            QueryType::Nsec3Param => 51,
            QueryType::Ixfr => 251,
            QueryType::Axfr => 252,
            QueryType::App => 65282,
            QueryType::Aname => 65305,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            43 => QueryType::Ds,
            46 => QueryType::Rrsig,
            47 => QueryType::Nsec,
            48 => QueryType::Dnskey,
            50 => QueryType::Nsec3,
            51 => QueryType::Nsec3Param,
            251 => QueryType::Ixfr,
            252 => QueryType::Axfr,
            65282 => QueryType::App,
            65305 => QueryType::Aname,
            _ => QueryType::Unknown(num),
        }
    }

    /// Types the DNSSEC machinery owns; the public mutation API refuses them.
    pub fn is_dnssec_managed(&self) -> bool {
        matches!(
            self,
            QueryType::Dnskey
                | QueryType::Rrsig
                | QueryType::Nsec
                | QueryType::Nsec3
                | QueryType::Nsec3Param
        )
    }
}

/// `ResultCode` represents the RCODE field of a response header
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    #[default]
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// A TTL that is transparent to equality, ordering and hashing.
///
/// Records compare by (name, type, rdata); two records differing only in
/// their TTL are the same record as far as the zone store is concerned.
#[derive(Copy, Clone, Debug, Eq, Serialize, Deserialize)]
pub struct TransientTtl(pub u32);

impl PartialEq<TransientTtl> for TransientTtl {
    fn eq(&self, _: &TransientTtl) -> bool {
        true
    }
}

impl PartialOrd<TransientTtl> for TransientTtl {
    fn partial_cmp(&self, other: &TransientTtl) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TransientTtl {
    fn cmp(&self, _: &TransientTtl) -> Ordering {
        Ordering::Equal
    }
}

impl Hash for TransientTtl {
    fn hash<H>(&self, _: &mut H)
    where
        H: Hasher,
    {
        // purposely left empty
    }
}

/// A normalized domain name: lowercase, no trailing dot, root is "".
///
/// Ordering follows RFC 4034 section 6.1: names sort by their label
/// sequence read from the rightmost label, each label compared as unsigned
/// lowercase octets. Denial chains and zone tree iteration rely on it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(name: &str) -> DomainName {
        DomainName(name.trim_end_matches('.').to_ascii_lowercase())
    }

    pub fn root() -> DomainName {
        DomainName(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn labels(&self) -> Vec<&str> {
        if self.0.is_empty() {
            Vec::new()
        } else {
            self.0.split('.').collect()
        }
    }

    pub fn label_count(&self) -> usize {
        self.labels().len()
    }

    /// The label count RRSIG carries: root excluded, a leading wildcard
    /// label excluded.
    pub fn rrsig_label_count(&self) -> u8 {
        let labels = self.labels();
        let count = if labels.first() == Some(&"*") {
            labels.len() - 1
        } else {
            labels.len()
        };
        count as u8
    }

    pub fn is_subdomain_of(&self, apex: &DomainName) -> bool {
        if apex.0.is_empty() {
            return true;
        }
        self.0 == apex.0 || self.0.ends_with(&format!(".{}", apex.0))
    }

    /// The name one label shorter, or None at the root.
    pub fn parent(&self) -> Option<DomainName> {
        if self.0.is_empty() {
            return None;
        }
        match self.0.split_once('.') {
            Some((_, rest)) => Some(DomainName(rest.to_string())),
            None => Some(DomainName::root()),
        }
    }

    /// Prepend a label to this name.
    pub fn prepend(&self, label: &str) -> DomainName {
        if self.0.is_empty() {
            DomainName(label.to_ascii_lowercase())
        } else {
            DomainName(format!("{}.{}", label.to_ascii_lowercase(), self.0))
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, ".")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Ord for DomainName {
    fn cmp(&self, other: &DomainName) -> Ordering {
        let mine = self.labels();
        let theirs = other.labels();

        for (a, b) in mine.iter().rev().zip(theirs.iter().rev()) {
            match a.as_bytes().cmp(b.as_bytes()) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }

        mine.len().cmp(&theirs.len())
    }
}

impl PartialOrd for DomainName {
    fn partial_cmp(&self, other: &DomainName) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `DnsRecord` is the primary representation of a DNS record
///
/// This enumeration is used for reading as well as writing records, from
/// network and from disk (for storage of authority data).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data: Vec<u8>,
        ttl: TransientTtl,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: TransientTtl,
    }, // 1
    Ns {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 2
    Cname {
        domain: String,
        host: String,
        ttl: TransientTtl,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: TransientTtl,
    }, // 6
    Mx {
        domain: String,
        priority: u16,
        host: String,
        ttl: TransientTtl,
    }, // 15
    Txt {
        domain: String,
        data: String,
        ttl: TransientTtl,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: TransientTtl,
    }, // 28
    Srv {
        domain: String,
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
        ttl: TransientTtl,
    }, // 33
    Ds {
        domain: String,
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Vec<u8>,
        ttl: TransientTtl,
    }, // 43
    Rrsig {
        domain: String,
        type_covered: QueryType,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer_name: String,
        signature: Vec<u8>,
        ttl: TransientTtl,
    }, // 46
    Nsec {
        domain: String,
        next_name: String,
        types: Vec<QueryType>,
        ttl: TransientTtl,
    }, // 47
    Dnskey {
        domain: String,
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
        ttl: TransientTtl,
    }, // 48
    Nsec3 {
        domain: String,
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        next_hashed: Vec<u8>,
        types: Vec<QueryType>,
        ttl: TransientTtl,
    }, // 50
    Nsec3Param {
        domain: String,
        hash_algorithm: u8,
        flags: u8,
        iterations: u16,
        salt: Vec<u8>,
        ttl: TransientTtl,
    }, // 51
    App {
        domain: String,
        data: String,
        ttl: TransientTtl,
    }, // 65282
    Aname {
        domain: String,
        target: String,
        ttl: TransientTtl,
    }, // 65305
}

/// Encode a type list as an RFC 4034 section 4.1.2 bitmap.
fn write_type_bitmap(types: &[QueryType], out: &mut Vec<u8>) {
    let mut nums: Vec<u16> = types.iter().map(|t| t.to_num()).collect();
    nums.sort_unstable();
    nums.dedup();

    let mut idx = 0;
    while idx < nums.len() {
        let window = (nums[idx] >> 8) as u8;
        let mut bitmap = [0u8; 32];
        let mut max_octet = 0usize;

        while idx < nums.len() && (nums[idx] >> 8) as u8 == window {
            let low = (nums[idx] & 0xFF) as usize;
            bitmap[low / 8] |= 0x80 >> (low % 8);
            max_octet = low / 8;
            idx += 1;
        }

        out.push(window);
        out.push((max_octet + 1) as u8);
        out.extend_from_slice(&bitmap[..=max_octet]);
    }
}

/// Decode an RFC 4034 section 4.1.2 bitmap into a type list.
fn read_type_bitmap<T: PacketBuffer>(buffer: &mut T, rdata_end: usize) -> Result<Vec<QueryType>> {
    let mut types = Vec::new();
    while buffer.pos() < rdata_end {
        let window = buffer.read()? as u16;
        let len = buffer.read()? as usize;
        for octet in 0..len {
            let byte = buffer.read()?;
            for bit in 0..8u16 {
                if byte & (0x80 >> bit) != 0 {
                    let num = (window << 8) | ((octet as u16) * 8 + bit);
                    types.push(QueryType::from_num(num));
                }
            }
        }
    }
    Ok(types)
}

/// Write a string as DNS <character-string> chunks.
fn write_character_strings(data: &str, out: &mut Vec<u8>) {
    let bytes = data.as_bytes();
    if bytes.is_empty() {
        out.push(0);
        return;
    }
    for chunk in bytes.chunks(255) {
        out.push(chunk.len() as u8);
        out.extend_from_slice(chunk);
    }
}

/// Read DNS <character-string> chunks spanning `data_len` octets.
fn read_character_strings<T: PacketBuffer>(buffer: &mut T, data_len: usize) -> Result<String> {
    let mut data = String::new();
    let mut remaining = data_len;
    while remaining > 0 {
        let chunk_len = (buffer.read()? as usize).min(remaining - 1);
        remaining -= 1;
        let chunk = buffer.read_bytes(chunk_len)?;
        data.push_str(&String::from_utf8_lossy(&chunk));
        remaining -= chunk_len;
    }
    Ok(data)
}

fn canonical_name_bytes(name: &str) -> Result<Vec<u8>> {
    let mut buffer = VectorPacketBuffer::new();
    buffer.write_qname_canonical(name)?;
    Ok(buffer.into_bytes())
}

impl DnsRecord {
    pub fn get_domain(&self) -> Option<String> {
        match *self {
            DnsRecord::Unknown { ref domain, .. }
            | DnsRecord::A { ref domain, .. }
            | DnsRecord::Ns { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Mx { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Srv { ref domain, .. }
            | DnsRecord::Ds { ref domain, .. }
            | DnsRecord::Rrsig { ref domain, .. }
            | DnsRecord::Nsec { ref domain, .. }
            | DnsRecord::Dnskey { ref domain, .. }
            | DnsRecord::Nsec3 { ref domain, .. }
            | DnsRecord::Nsec3Param { ref domain, .. }
            | DnsRecord::App { ref domain, .. }
            | DnsRecord::Aname { ref domain, .. } => Some(domain.clone()),
        }
    }

    pub fn set_domain(&mut self, new_domain: String) {
        match *self {
            DnsRecord::Unknown { ref mut domain, .. }
            | DnsRecord::A { ref mut domain, .. }
            | DnsRecord::Ns { ref mut domain, .. }
            | DnsRecord::Cname { ref mut domain, .. }
            | DnsRecord::Soa { ref mut domain, .. }
            | DnsRecord::Mx { ref mut domain, .. }
            | DnsRecord::Txt { ref mut domain, .. }
            | DnsRecord::Aaaa { ref mut domain, .. }
            | DnsRecord::Srv { ref mut domain, .. }
            | DnsRecord::Ds { ref mut domain, .. }
            | DnsRecord::Rrsig { ref mut domain, .. }
            | DnsRecord::Nsec { ref mut domain, .. }
            | DnsRecord::Dnskey { ref mut domain, .. }
            | DnsRecord::Nsec3 { ref mut domain, .. }
            | DnsRecord::Nsec3Param { ref mut domain, .. }
            | DnsRecord::App { ref mut domain, .. }
            | DnsRecord::Aname { ref mut domain, .. } => *domain = new_domain,
        }
    }

    pub fn name(&self) -> DomainName {
        DomainName::new(&self.get_domain().unwrap_or_default())
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::Unknown { qtype, .. } => QueryType::Unknown(qtype),
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Ns { .. } => QueryType::Ns,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Mx { .. } => QueryType::Mx,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Srv { .. } => QueryType::Srv,
            DnsRecord::Ds { .. } => QueryType::Ds,
            DnsRecord::Rrsig { .. } => QueryType::Rrsig,
            DnsRecord::Nsec { .. } => QueryType::Nsec,
            DnsRecord::Dnskey { .. } => QueryType::Dnskey,
            DnsRecord::Nsec3 { .. } => QueryType::Nsec3,
            DnsRecord::Nsec3Param { .. } => QueryType::Nsec3Param,
            DnsRecord::App { .. } => QueryType::App,
            DnsRecord::Aname { .. } => QueryType::Aname,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::Unknown { ttl, .. }
            | DnsRecord::A { ttl, .. }
            | DnsRecord::Ns { ttl, .. }
            | DnsRecord::Cname { ttl, .. }
            | DnsRecord::Soa { ttl, .. }
            | DnsRecord::Mx { ttl, .. }
            | DnsRecord::Txt { ttl, .. }
            | DnsRecord::Aaaa { ttl, .. }
            | DnsRecord::Srv { ttl, .. }
            | DnsRecord::Ds { ttl, .. }
            | DnsRecord::Rrsig { ttl, .. }
            | DnsRecord::Nsec { ttl, .. }
            | DnsRecord::Dnskey { ttl, .. }
            | DnsRecord::Nsec3 { ttl, .. }
            | DnsRecord::Nsec3Param { ttl, .. }
            | DnsRecord::App { ttl, .. }
            | DnsRecord::Aname { ttl, .. } => ttl.0,
        }
    }

    pub fn set_ttl(&mut self, new_ttl: u32) {
        match *self {
            DnsRecord::Unknown { ref mut ttl, .. }
            | DnsRecord::A { ref mut ttl, .. }
            | DnsRecord::Ns { ref mut ttl, .. }
            | DnsRecord::Cname { ref mut ttl, .. }
            | DnsRecord::Soa { ref mut ttl, .. }
            | DnsRecord::Mx { ref mut ttl, .. }
            | DnsRecord::Txt { ref mut ttl, .. }
            | DnsRecord::Aaaa { ref mut ttl, .. }
            | DnsRecord::Srv { ref mut ttl, .. }
            | DnsRecord::Ds { ref mut ttl, .. }
            | DnsRecord::Rrsig { ref mut ttl, .. }
            | DnsRecord::Nsec { ref mut ttl, .. }
            | DnsRecord::Dnskey { ref mut ttl, .. }
            | DnsRecord::Nsec3 { ref mut ttl, .. }
            | DnsRecord::Nsec3Param { ref mut ttl, .. }
            | DnsRecord::App { ref mut ttl, .. }
            | DnsRecord::Aname { ref mut ttl, .. } => *ttl = TransientTtl(new_ttl),
        }
    }

    /// The rdata in canonical wire form: names uncompressed and lowercase.
    ///
    /// This is both the signing input encoding and the on-the-wire encoding;
    /// the engine never compresses names inside rdata.
    pub fn rdata_wire(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        match *self {
            DnsRecord::Unknown { ref data, .. } => {
                out.extend_from_slice(data);
            }
            DnsRecord::A { addr, .. } => {
                out.extend_from_slice(&addr.octets());
            }
            DnsRecord::Ns { ref host, .. } | DnsRecord::Cname { ref host, .. } => {
                out.extend_from_slice(&canonical_name_bytes(host)?);
            }
            DnsRecord::Soa {
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                out.extend_from_slice(&canonical_name_bytes(m_name)?);
                out.extend_from_slice(&canonical_name_bytes(r_name)?);
                for val in [serial, refresh, retry, expire, minimum] {
                    out.extend_from_slice(&val.to_be_bytes());
                }
            }
            DnsRecord::Mx {
                priority, ref host, ..
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&canonical_name_bytes(host)?);
            }
            DnsRecord::Txt { ref data, .. } => {
                write_character_strings(data, &mut out);
            }
            DnsRecord::Aaaa { addr, .. } => {
                out.extend_from_slice(&addr.octets());
            }
            DnsRecord::Srv {
                priority,
                weight,
                port,
                ref host,
                ..
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(&canonical_name_bytes(host)?);
            }
            DnsRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                ref digest,
                ..
            } => {
                out.extend_from_slice(&key_tag.to_be_bytes());
                out.push(algorithm);
                out.push(digest_type);
                out.extend_from_slice(digest);
            }
            DnsRecord::Rrsig {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                ref signer_name,
                ref signature,
                ..
            } => {
                out.extend_from_slice(&type_covered.to_num().to_be_bytes());
                out.push(algorithm);
                out.push(labels);
                out.extend_from_slice(&original_ttl.to_be_bytes());
                out.extend_from_slice(&expiration.to_be_bytes());
                out.extend_from_slice(&inception.to_be_bytes());
                out.extend_from_slice(&key_tag.to_be_bytes());
                out.extend_from_slice(&canonical_name_bytes(signer_name)?);
                out.extend_from_slice(signature);
            }
            DnsRecord::Nsec {
                ref next_name,
                ref types,
                ..
            } => {
                out.extend_from_slice(&canonical_name_bytes(next_name)?);
                write_type_bitmap(types, &mut out);
            }
            DnsRecord::Dnskey {
                flags,
                protocol,
                algorithm,
                ref public_key,
                ..
            } => {
                out.extend_from_slice(&flags.to_be_bytes());
                out.push(protocol);
                out.push(algorithm);
                out.extend_from_slice(public_key);
            }
            DnsRecord::Nsec3 {
                hash_algorithm,
                flags,
                iterations,
                ref salt,
                ref next_hashed,
                ref types,
                ..
            } => {
                out.push(hash_algorithm);
                out.push(flags);
                out.extend_from_slice(&iterations.to_be_bytes());
                out.push(salt.len() as u8);
                out.extend_from_slice(salt);
                out.push(next_hashed.len() as u8);
                out.extend_from_slice(next_hashed);
                write_type_bitmap(types, &mut out);
            }
            DnsRecord::Nsec3Param {
                hash_algorithm,
                flags,
                iterations,
                ref salt,
                ..
            } => {
                out.push(hash_algorithm);
                out.push(flags);
                out.extend_from_slice(&iterations.to_be_bytes());
                out.push(salt.len() as u8);
                out.extend_from_slice(salt);
            }
            DnsRecord::App { ref data, .. } => {
                write_character_strings(data, &mut out);
            }
            DnsRecord::Aname { ref target, .. } => {
                out.extend_from_slice(&canonical_name_bytes(target)?);
            }
        }

        Ok(out)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        buffer.write_qname(&self.get_domain().unwrap_or_default())?;
        buffer.write_u16(self.get_querytype().to_num())?;
        buffer.write_u16(CLASS_IN)?;
        buffer.write_u32(self.get_ttl())?;

        let rdata = self.rdata_wire()?;
        buffer.write_u16(rdata.len() as u16)?;
        buffer.write_bytes(&rdata)?;

        Ok(buffer.pos() - start_pos)
    }

    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let _class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;
        // Where this record's rdata ends; variable-length tails (bitmaps,
        // signatures) consume up to here.
        let rdata_end = buffer.pos() + data_len as usize;

        match qtype {
            QueryType::A => {
                let raw = buffer.read_u32()?;
                Ok(DnsRecord::A {
                    domain,
                    addr: Ipv4Addr::from(raw),
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Aaaa => {
                let mut octets = [0u8; 16];
                for octet in octets.iter_mut() {
                    *octet = buffer.read()?;
                }
                Ok(DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(octets),
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Ns => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::Ns {
                    domain,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Cname => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::Cname {
                    domain,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;
                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                Ok(DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial: buffer.read_u32()?,
                    refresh: buffer.read_u32()?,
                    retry: buffer.read_u32()?,
                    expire: buffer.read_u32()?,
                    minimum: buffer.read_u32()?,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Mx => {
                let priority = buffer.read_u16()?;
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::Mx {
                    domain,
                    priority,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Srv => {
                let priority = buffer.read_u16()?;
                let weight = buffer.read_u16()?;
                let port = buffer.read_u16()?;
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                Ok(DnsRecord::Srv {
                    domain,
                    priority,
                    weight,
                    port,
                    host,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Txt => {
                let data = read_character_strings(buffer, data_len as usize)?;
                Ok(DnsRecord::Txt {
                    domain,
                    data,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Ds => {
                let key_tag = buffer.read_u16()?;
                let algorithm = buffer.read()?;
                let digest_type = buffer.read()?;
                let digest = buffer.read_bytes((data_len as usize).saturating_sub(4))?;
                Ok(DnsRecord::Ds {
                    domain,
                    key_tag,
                    algorithm,
                    digest_type,
                    digest,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Dnskey => {
                let flags = buffer.read_u16()?;
                let protocol = buffer.read()?;
                let algorithm = buffer.read()?;
                let public_key = buffer.read_bytes((data_len as usize).saturating_sub(4))?;
                Ok(DnsRecord::Dnskey {
                    domain,
                    flags,
                    protocol,
                    algorithm,
                    public_key,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Rrsig => {
                let type_covered = QueryType::from_num(buffer.read_u16()?);
                let algorithm = buffer.read()?;
                let labels = buffer.read()?;
                let original_ttl = buffer.read_u32()?;
                let expiration = buffer.read_u32()?;
                let inception = buffer.read_u32()?;
                let key_tag = buffer.read_u16()?;
                let mut signer_name = String::new();
                buffer.read_qname(&mut signer_name)?;
                let signature = buffer.read_bytes(rdata_end.saturating_sub(buffer.pos()))?;
                Ok(DnsRecord::Rrsig {
                    domain,
                    type_covered,
                    algorithm,
                    labels,
                    original_ttl,
                    expiration,
                    inception,
                    key_tag,
                    signer_name,
                    signature,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Nsec => {
                let mut next_name = String::new();
                buffer.read_qname(&mut next_name)?;
                let types = read_type_bitmap(buffer, rdata_end)?;
                Ok(DnsRecord::Nsec {
                    domain,
                    next_name,
                    types,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Nsec3 => {
                let hash_algorithm = buffer.read()?;
                let flags = buffer.read()?;
                let iterations = buffer.read_u16()?;
                let salt_len = buffer.read()? as usize;
                let salt = buffer.read_bytes(salt_len)?;
                let hash_len = buffer.read()? as usize;
                let next_hashed = buffer.read_bytes(hash_len)?;
                let types = read_type_bitmap(buffer, rdata_end)?;
                Ok(DnsRecord::Nsec3 {
                    domain,
                    hash_algorithm,
                    flags,
                    iterations,
                    salt,
                    next_hashed,
                    types,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Nsec3Param => {
                let hash_algorithm = buffer.read()?;
                let flags = buffer.read()?;
                let iterations = buffer.read_u16()?;
                let salt_len = buffer.read()? as usize;
                let salt = buffer.read_bytes(salt_len)?;
                Ok(DnsRecord::Nsec3Param {
                    domain,
                    hash_algorithm,
                    flags,
                    iterations,
                    salt,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::App => {
                let data = read_character_strings(buffer, data_len as usize)?;
                Ok(DnsRecord::App {
                    domain,
                    data,
                    ttl: TransientTtl(ttl),
                })
            }
            QueryType::Aname => {
                let mut target = String::new();
                buffer.read_qname(&mut target)?;
                Ok(DnsRecord::Aname {
                    domain,
                    target,
                    ttl: TransientTtl(ttl),
                })
            }
            _ => {
                let data = buffer.read_bytes(data_len as usize)?;
                Ok(DnsRecord::Unknown {
                    domain,
                    qtype: qtype_num,
                    data,
                    ttl: TransientTtl(ttl),
                })
            }
        }
    }
}

/// Opcode used by a primary to signal a zone change (RFC 1996).
pub const OPCODE_NOTIFY: u8 = 4;

/// `DnsHeader` represents the first twelve bytes of a DNS message
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16,

    pub response: bool,
    pub opcode: u8,
    pub authoritative_answer: bool,
    pub truncated_message: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub z: bool,
    pub authed_data: bool,
    pub checking_disabled: bool,
    pub rescode: ResultCode,

    pub questions: u16,
    pub answers: u16,
    pub authoritative_entries: u16,
    pub resource_entries: u16,
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & 1) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// `DnsQuestion` represents a single question entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion { name, qtype }
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(CLASS_IN)?;
        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        let _class = buffer.read_u16()?;
        Ok(())
    }
}

/// `DnsPacket` represents a complete DNS message
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(buffer)?);
        }

        Ok(result)
    }

    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.header.questions = self.questions.len() as u16;
        self.header.answers = self.answers.len() as u16;
        self.header.authoritative_entries = self.authorities.len() as u16;
        self.header.resource_entries = self.resources.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }
        for rec in &self.answers {
            rec.write(buffer)?;
        }
        for rec in &self.authorities {
            rec.write(buffer)?;
        }
        for rec in &self.resources {
            rec.write(buffer)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::buffer::VectorPacketBuffer;

    #[test]
    fn test_canonical_name_order() {
        // The example ordering from RFC 4034 section 6.1.
        let mut names = vec![
            DomainName::new("example"),
            DomainName::new("z.example"),
            DomainName::new("yljkjljk.a.example"),
            DomainName::new("a.example"),
            DomainName::new("*.z.example"),
            DomainName::new("Z.a.example"),
            DomainName::new("zABC.a.EXAMPLE"),
            DomainName::new("zz.example"),
        ];
        names.sort();

        let sorted: Vec<&str> = names.iter().map(|n| n.as_str()).collect();
        assert_eq!(
            sorted,
            vec![
                "example",
                "a.example",
                "yljkjljk.a.example",
                "z.a.example",
                "zabc.a.example",
                "z.example",
                "*.z.example",
                "zz.example",
            ]
        );
    }

    #[test]
    fn test_subdomain_and_parent() {
        let apex = DomainName::new("example.com");
        assert!(DomainName::new("www.example.com").is_subdomain_of(&apex));
        assert!(DomainName::new("example.com").is_subdomain_of(&apex));
        assert!(!DomainName::new("notexample.com").is_subdomain_of(&apex));

        assert_eq!(
            DomainName::new("a.b.example.com").parent(),
            Some(DomainName::new("b.example.com"))
        );
        assert_eq!(DomainName::new("com").parent(), Some(DomainName::root()));
        assert_eq!(DomainName::root().parent(), None);
    }

    #[test]
    fn test_rrsig_label_count_skips_wildcard() {
        assert_eq!(DomainName::new("www.example.com").rrsig_label_count(), 3);
        assert_eq!(DomainName::new("*.example.com").rrsig_label_count(), 2);
        assert_eq!(DomainName::root().rrsig_label_count(), 0);
    }

    #[test]
    fn test_type_bitmap_encoding() {
        // A + MX + RRSIG + NSEC; RFC 4034 section 4.3's worked example gives
        // the bitmap 0x00 0x06 0x40 0x01 0x00 0x00 0x00 0x03.
        let mut out = Vec::new();
        write_type_bitmap(
            &[QueryType::A, QueryType::Mx, QueryType::Rrsig, QueryType::Nsec],
            &mut out,
        );
        assert_eq!(out, vec![0x00, 0x06, 0x40, 0x01, 0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_record_wire_roundtrip() {
        let record = DnsRecord::Soa {
            domain: "example.com".to_string(),
            m_name: "ns1.example.com".to_string(),
            r_name: "admin.example.com".to_string(),
            serial: 2024,
            refresh: 900,
            retry: 300,
            expire: 604800,
            minimum: 900,
            ttl: TransientTtl(3600),
        };

        let mut buffer = VectorPacketBuffer::new();
        record.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();
        let parsed = DnsRecord::read(&mut buffer).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_dnssec_record_wire_roundtrips() {
        // One record per DNSSEC-managed (and engine-specific) type; type
        // bitmaps are written sorted and deduplicated, so the lists here
        // are in ascending type order.
        let records = vec![
            DnsRecord::Rrsig {
                domain: "www.example.com".to_string(),
                type_covered: QueryType::A,
                algorithm: 13,
                labels: 3,
                original_ttl: 300,
                expiration: 1717340400,
                inception: 1716735600,
                key_tag: 34217,
                signer_name: "example.com".to_string(),
                signature: vec![0xab; 64],
                ttl: TransientTtl(300),
            },
            DnsRecord::Nsec {
                domain: "example.com".to_string(),
                next_name: "a.example.com".to_string(),
                types: vec![QueryType::A, QueryType::Mx, QueryType::Rrsig, QueryType::Nsec],
                ttl: TransientTtl(900),
            },
            DnsRecord::Nsec3 {
                domain: "0p9mhaveqvm6t7vbl5lop2u3t2rp3tom.example.com".to_string(),
                hash_algorithm: 1,
                flags: 0,
                iterations: 10,
                salt: vec![0xaa, 0xbb, 0xcc, 0xdd],
                next_hashed: vec![0x11; 20],
                types: vec![QueryType::A, QueryType::Rrsig],
                ttl: TransientTtl(900),
            },
            DnsRecord::Nsec3Param {
                domain: "example.com".to_string(),
                hash_algorithm: 1,
                flags: 0,
                iterations: 10,
                salt: vec![0xaa, 0xbb, 0xcc, 0xdd],
                ttl: TransientTtl(900),
            },
            DnsRecord::App {
                domain: "app.example.com".to_string(),
                data: "split-horizon".to_string(),
                ttl: TransientTtl(300),
            },
            DnsRecord::Aname {
                domain: "example.com".to_string(),
                target: "cdn.example.net".to_string(),
                ttl: TransientTtl(300),
            },
        ];

        for record in records {
            let mut buffer = VectorPacketBuffer::new();
            record.write(&mut buffer).unwrap();
            buffer.seek(0).unwrap();
            let parsed = DnsRecord::read(&mut buffer).unwrap();
            assert_eq!(parsed, record);
        }
    }

    #[test]
    fn test_packet_roundtrip() {
        let mut packet = DnsPacket::new();
        packet.header.id = 77;
        packet.header.opcode = OPCODE_NOTIFY;
        packet.header.authoritative_answer = true;
        packet
            .questions
            .push(DnsQuestion::new("example.com".to_string(), QueryType::Soa));
        packet.answers.push(DnsRecord::A {
            domain: "example.com".to_string(),
            addr: "192.0.2.1".parse().unwrap(),
            ttl: TransientTtl(3600),
        });

        let mut buffer = VectorPacketBuffer::new();
        packet.write(&mut buffer).unwrap();
        buffer.seek(0).unwrap();

        let parsed = DnsPacket::from_buffer(&mut buffer).unwrap();
        assert_eq!(parsed.header.id, 77);
        assert_eq!(parsed.header.opcode, OPCODE_NOTIFY);
        assert!(parsed.header.authoritative_answer);
        assert_eq!(parsed.questions, packet.questions);
        assert_eq!(parsed.answers, packet.answers);
    }
}
