//! DNSSEC key material and RRSet signing
//!
//! Provides zone signing with ECDSA P-256/P-384 and RSA key support.
//!
//! # Features
//!
//! * **Key Generation** - ECDSA and RSA key pairs via openssl
//! * **DNSKEY/DS rdata** - wire-format public keys and delegation digests
//! * **Key Tags** - RFC 4034 Appendix B calculation
//! * **RRSet Signing** - RFC 4034 canonical to-be-signed assembly
//! * **Revocation** - RFC 5011 revoke bit handling
//!
//! The key state machine that drives publish/retire/revoke lives in
//! `key_lifecycle`; this module only knows how to produce and check bytes.

use chrono::{DateTime, Duration, Utc};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::errors::{ZoneError, ZoneResult};
use crate::dns::protocol::{DnsRecord, DomainName, QueryType, TransientTtl, CLASS_IN};

/// DNSSEC algorithm numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnssecAlgorithm {
    /// RSA/MD5 (Algorithm 1) - legacy, refused for new keys
    RsaMd5 = 1,
    /// RSA/SHA-256 (Algorithm 8)
    RsaSha256 = 8,
    /// RSA/SHA-512 (Algorithm 10)
    RsaSha512 = 10,
    /// ECDSA P-256 with SHA-256 (Algorithm 13)
    EcdsaP256Sha256 = 13,
    /// ECDSA P-384 with SHA-384 (Algorithm 14)
    EcdsaP384Sha384 = 14,
}

impl DnssecAlgorithm {
    pub fn to_num(&self) -> u8 {
        *self as u8
    }

    pub fn from_num(num: u8) -> Option<DnssecAlgorithm> {
        match num {
            1 => Some(DnssecAlgorithm::RsaMd5),
            8 => Some(DnssecAlgorithm::RsaSha256),
            10 => Some(DnssecAlgorithm::RsaSha512),
            13 => Some(DnssecAlgorithm::EcdsaP256Sha256),
            14 => Some(DnssecAlgorithm::EcdsaP384Sha384),
            _ => None,
        }
    }
}

/// DNSSEC digest types for DS records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestType {
    /// SHA-1 (Digest Type 1) - deprecated
    Sha1 = 1,
    /// SHA-256 (Digest Type 2)
    Sha256 = 2,
}

/// DNSSEC key type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Zone Signing Key (ZSK)
    ZSK,
    /// Key Signing Key (KSK)
    KSK,
}

/// Lifecycle state of a private key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyState {
    Generated,
    Published,
    Ready,
    Active,
    Retired,
    Revoked,
    Removed,
}

/// The DNSKEY revoke bit of RFC 5011.
pub const REVOKE_FLAG: u16 = 0x0080;
/// The zone-key bit; set on every DNSKEY the engine produces.
const ZONE_KEY_FLAG: u16 = 0x0100;
/// The secure-entry-point bit carried by KSKs.
const SEP_FLAG: u16 = 0x0001;
/// DNSKEY protocol field (RFC 4034 section 2.1.2).
const DNSKEY_PROTOCOL: u8 = 3;

/// The private key, tagged by algorithm family.
///
/// New algorithm families slot in as further variants without touching the
/// lifecycle engine, which only sees the common capability surface
/// (generate, sign, verify, public rdata).
#[derive(Clone)]
pub enum KeyPair {
    Rsa { key: Rsa<Private> },
    Ecdsa { key: EcKey<Private> },
}

impl KeyPair {
    pub fn generate(algorithm: DnssecAlgorithm, key_type: KeyType) -> ZoneResult<KeyPair> {
        match algorithm {
            DnssecAlgorithm::EcdsaP256Sha256 | DnssecAlgorithm::EcdsaP384Sha384 => {
                let group = ec_group(algorithm)?;
                let key = EcKey::generate(&group).map_err(crypto_err)?;
                Ok(KeyPair::Ecdsa { key })
            }
            DnssecAlgorithm::RsaSha256 | DnssecAlgorithm::RsaSha512 => {
                let bits = if key_type == KeyType::KSK { 2048 } else { 1024 };
                let key = Rsa::generate(bits).map_err(crypto_err)?;
                Ok(KeyPair::Rsa { key })
            }
            DnssecAlgorithm::RsaMd5 => Err(ZoneError::UnsupportedAlgorithm {
                zone: String::new(),
                algorithm: "RSAMD5".to_string(),
            }),
        }
    }

    /// The public key field of the DNSKEY rdata.
    pub fn public_key_rdata(&self, algorithm: DnssecAlgorithm) -> ZoneResult<Vec<u8>> {
        match self {
            KeyPair::Rsa { key } => {
                // RFC 3110: exponent length, exponent, modulus.
                let e = key.e().to_vec();
                let n = key.n().to_vec();
                let mut out = Vec::with_capacity(3 + e.len() + n.len());
                if e.len() < 256 {
                    out.push(e.len() as u8);
                } else {
                    out.push(0);
                    out.extend_from_slice(&(e.len() as u16).to_be_bytes());
                }
                out.extend_from_slice(&e);
                out.extend_from_slice(&n);
                Ok(out)
            }
            KeyPair::Ecdsa { key } => {
                // RFC 6605: x || y, fixed width, no point prefix.
                let group = ec_group(algorithm)?;
                let mut ctx = BigNumContext::new().map_err(crypto_err)?;
                let encoded = key
                    .public_key()
                    .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
                    .map_err(crypto_err)?;
                // Strip the 0x04 uncompressed-point marker.
                Ok(encoded[1..].to_vec())
            }
        }
    }

    /// Sign `data`, producing the signature field of an RRSIG.
    pub fn sign(&self, algorithm: DnssecAlgorithm, data: &[u8]) -> ZoneResult<Vec<u8>> {
        match self {
            KeyPair::Rsa { key } => {
                let digest = match algorithm {
                    DnssecAlgorithm::RsaSha256 => MessageDigest::sha256(),
                    DnssecAlgorithm::RsaSha512 => MessageDigest::sha512(),
                    _ => {
                        return Err(ZoneError::UnsupportedAlgorithm {
                            zone: String::new(),
                            algorithm: format!("{:?}", algorithm),
                        })
                    }
                };
                let pkey = PKey::from_rsa(key.clone()).map_err(crypto_err)?;
                let mut signer = Signer::new(digest, &pkey).map_err(crypto_err)?;
                signer.update(data).map_err(crypto_err)?;
                signer.sign_to_vec().map_err(crypto_err)
            }
            KeyPair::Ecdsa { key } => {
                let (hash, coord_len) = ecdsa_params(algorithm)?;
                let sig = EcdsaSig::sign(&hash(data), key).map_err(crypto_err)?;
                // DNSSEC wants raw r || s, fixed width.
                let mut out = sig.r().to_vec_padded(coord_len).map_err(crypto_err)?;
                out.extend(sig.s().to_vec_padded(coord_len).map_err(crypto_err)?);
                Ok(out)
            }
        }
    }

    /// Check a signature produced by `sign`.
    pub fn verify(
        &self,
        algorithm: DnssecAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> ZoneResult<bool> {
        match self {
            KeyPair::Rsa { key } => {
                let digest = match algorithm {
                    DnssecAlgorithm::RsaSha256 => MessageDigest::sha256(),
                    DnssecAlgorithm::RsaSha512 => MessageDigest::sha512(),
                    _ => return Ok(false),
                };
                let pkey = PKey::from_rsa(key.clone()).map_err(crypto_err)?;
                let mut verifier = Verifier::new(digest, &pkey).map_err(crypto_err)?;
                verifier.update(data).map_err(crypto_err)?;
                verifier.verify(signature).map_err(crypto_err)
            }
            KeyPair::Ecdsa { key } => {
                let (hash, coord_len) = ecdsa_params(algorithm)?;
                let coord_len = coord_len as usize;
                if signature.len() != coord_len * 2 {
                    return Ok(false);
                }
                let r = BigNum::from_slice(&signature[..coord_len]).map_err(crypto_err)?;
                let s = BigNum::from_slice(&signature[coord_len..]).map_err(crypto_err)?;
                let sig = EcdsaSig::from_private_components(r, s).map_err(crypto_err)?;
                sig.verify(&hash(data), key).map_err(crypto_err)
            }
        }
    }

    fn to_der(&self) -> ZoneResult<Vec<u8>> {
        match self {
            KeyPair::Rsa { key } => key.private_key_to_der().map_err(crypto_err),
            KeyPair::Ecdsa { key } => key.private_key_to_der().map_err(crypto_err),
        }
    }

    fn from_der(algorithm: DnssecAlgorithm, der: &[u8]) -> ZoneResult<KeyPair> {
        match algorithm {
            DnssecAlgorithm::EcdsaP256Sha256 | DnssecAlgorithm::EcdsaP384Sha384 => {
                let key = EcKey::private_key_from_der(der).map_err(crypto_err)?;
                Ok(KeyPair::Ecdsa { key })
            }
            _ => {
                let key = Rsa::private_key_from_der(der).map_err(crypto_err)?;
                Ok(KeyPair::Rsa { key })
            }
        }
    }
}

fn ec_group(algorithm: DnssecAlgorithm) -> ZoneResult<EcGroup> {
    let nid = match algorithm {
        DnssecAlgorithm::EcdsaP256Sha256 => Nid::X9_62_PRIME256V1,
        DnssecAlgorithm::EcdsaP384Sha384 => Nid::SECP384R1,
        _ => {
            return Err(ZoneError::UnsupportedAlgorithm {
                zone: String::new(),
                algorithm: format!("{:?}", algorithm),
            })
        }
    };
    EcGroup::from_curve_name(nid).map_err(crypto_err)
}

type HashFn = fn(&[u8]) -> Vec<u8>;

fn ecdsa_params(algorithm: DnssecAlgorithm) -> ZoneResult<(HashFn, i32)> {
    match algorithm {
        DnssecAlgorithm::EcdsaP256Sha256 => Ok((sha256_digest, 32)),
        DnssecAlgorithm::EcdsaP384Sha384 => Ok((sha384_digest, 48)),
        _ => Err(ZoneError::UnsupportedAlgorithm {
            zone: String::new(),
            algorithm: format!("{:?}", algorithm),
        }),
    }
}

fn sha256_digest(data: &[u8]) -> Vec<u8> {
    openssl::hash::hash(MessageDigest::sha256(), data)
        .map(|d| d.to_vec())
        .unwrap_or_default()
}

fn sha384_digest(data: &[u8]) -> Vec<u8> {
    openssl::hash::hash(MessageDigest::sha384(), data)
        .map(|d| d.to_vec())
        .unwrap_or_default()
}

fn crypto_err(err: openssl::error::ErrorStack) -> ZoneError {
    ZoneError::Crypto {
        zone: String::new(),
        detail: err.to_string(),
    }
}

/// Calculate the key tag of a DNSKEY rdata (RFC 4034 Appendix B).
pub fn calculate_key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(DNSKEY_PROTOCOL);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    let mut sum: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            sum += (*byte as u32) << 8;
        } else {
            sum += *byte as u32;
        }
    }
    sum += (sum >> 16) & 0xFFFF;
    (sum & 0xFFFF) as u16
}

/// A private key and its lifecycle bookkeeping.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "PersistedKey", into = "PersistedKey")]
pub struct DnssecKey {
    pub key_tag: u16,
    pub key_type: KeyType,
    pub algorithm: DnssecAlgorithm,
    pub state: KeyState,
    pub state_changed_at: DateTime<Utc>,
    pub is_retiring: bool,
    /// Automatic-rollover age for ZSKs; 0 disables it.
    pub rollover_days: u32,
    pub revoked: bool,
    key_pair: KeyPair,
}

/// On-disk form of a key: the pair travels as base64 DER.
#[derive(Serialize, Deserialize)]
struct PersistedKey {
    key_tag: u16,
    key_type: KeyType,
    algorithm: DnssecAlgorithm,
    state: KeyState,
    state_changed_at: DateTime<Utc>,
    is_retiring: bool,
    rollover_days: u32,
    revoked: bool,
    private_key: String,
}

impl From<DnssecKey> for PersistedKey {
    fn from(key: DnssecKey) -> PersistedKey {
        PersistedKey {
            key_tag: key.key_tag,
            key_type: key.key_type,
            algorithm: key.algorithm,
            state: key.state,
            state_changed_at: key.state_changed_at,
            is_retiring: key.is_retiring,
            rollover_days: key.rollover_days,
            revoked: key.revoked,
            private_key: base64::encode(key.key_pair.to_der().unwrap_or_default()),
        }
    }
}

impl TryFrom<PersistedKey> for DnssecKey {
    type Error = String;

    fn try_from(persisted: PersistedKey) -> Result<DnssecKey, String> {
        let der = base64::decode(&persisted.private_key).map_err(|e| e.to_string())?;
        let key_pair = KeyPair::from_der(persisted.algorithm, &der).map_err(|e| e.to_string())?;
        Ok(DnssecKey {
            key_tag: persisted.key_tag,
            key_type: persisted.key_type,
            algorithm: persisted.algorithm,
            state: persisted.state,
            state_changed_at: persisted.state_changed_at,
            is_retiring: persisted.is_retiring,
            rollover_days: persisted.rollover_days,
            revoked: persisted.revoked,
            key_pair,
        })
    }
}

impl DnssecKey {
    /// Generate a fresh key in state Generated.
    pub fn generate(
        key_type: KeyType,
        algorithm: DnssecAlgorithm,
        rollover_days: u32,
        now: DateTime<Utc>,
    ) -> ZoneResult<DnssecKey> {
        let key_pair = KeyPair::generate(algorithm, key_type)?;
        let mut key = DnssecKey {
            key_tag: 0,
            key_type,
            algorithm,
            state: KeyState::Generated,
            state_changed_at: now,
            is_retiring: false,
            rollover_days,
            revoked: false,
            key_pair,
        };
        key.key_tag = calculate_key_tag(
            key.dnskey_flags(),
            algorithm.to_num(),
            &key.key_pair.public_key_rdata(algorithm)?,
        );
        Ok(key)
    }

    pub fn dnskey_flags(&self) -> u16 {
        let mut flags = ZONE_KEY_FLAG;
        if self.key_type == KeyType::KSK {
            flags |= SEP_FLAG;
        }
        if self.revoked {
            flags |= REVOKE_FLAG;
        }
        flags
    }

    /// The DNSKEY record for this key.
    pub fn dnskey_record(&self, apex: &DomainName, ttl: u32) -> ZoneResult<DnsRecord> {
        Ok(DnsRecord::Dnskey {
            domain: apex.as_str().to_string(),
            flags: self.dnskey_flags(),
            protocol: DNSKEY_PROTOCOL,
            algorithm: self.algorithm.to_num(),
            public_key: self.key_pair.public_key_rdata(self.algorithm)?,
            ttl: TransientTtl(ttl),
        })
    }

    /// The DS record a parent zone would publish for this key.
    pub fn ds_record(&self, apex: &DomainName, ttl: u32) -> ZoneResult<DnsRecord> {
        let public_key = self.key_pair.public_key_rdata(self.algorithm)?;

        let mut buffer = VectorPacketBuffer::new();
        buffer
            .write_qname_canonical(apex.as_str())
            .map_err(|e| ZoneError::Protocol {
                zone: apex.as_str().to_string(),
                detail: e.to_string(),
            })?;
        let mut data = buffer.into_bytes();
        data.extend_from_slice(&self.dnskey_flags().to_be_bytes());
        data.push(DNSKEY_PROTOCOL);
        data.push(self.algorithm.to_num());
        data.extend_from_slice(&public_key);

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let digest = hasher.finalize().to_vec();

        Ok(DnsRecord::Ds {
            domain: apex.as_str().to_string(),
            key_tag: self.key_tag,
            algorithm: self.algorithm.to_num(),
            digest_type: DigestType::Sha256 as u8,
            digest,
            ttl: TransientTtl(ttl),
        })
    }

    /// Set the RFC 5011 revoke bit. The flags change re-derives the tag.
    pub fn revoke(&mut self, now: DateTime<Utc>) -> ZoneResult<u16> {
        self.revoked = true;
        self.state = KeyState::Revoked;
        self.state_changed_at = now;
        self.key_tag = calculate_key_tag(
            self.dnskey_flags(),
            self.algorithm.to_num(),
            &self.key_pair.public_key_rdata(self.algorithm)?,
        );
        Ok(self.key_tag)
    }

    pub fn transition(&mut self, state: KeyState, now: DateTime<Utc>) {
        self.state = state;
        self.state_changed_at = now;
    }

    pub fn sign_data(&self, data: &[u8]) -> ZoneResult<Vec<u8>> {
        self.key_pair.sign(self.algorithm, data)
    }

    pub fn verify_data(&self, data: &[u8], signature: &[u8]) -> ZoneResult<bool> {
        self.key_pair.verify(self.algorithm, data, signature)
    }
}

impl std::fmt::Debug for DnssecKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnssecKey")
            .field("key_tag", &self.key_tag)
            .field("key_type", &self.key_type)
            .field("algorithm", &self.algorithm)
            .field("state", &self.state)
            .field("is_retiring", &self.is_retiring)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Everything `sign_rrset` needs to know about the zone.
pub struct SigningContext<'a> {
    pub apex: &'a DomainName,
    pub keys: &'a [DnssecKey],
    /// Signature validity: SOA expire + 3 days.
    pub validity: Duration,
    pub now: DateTime<Utc>,
}

impl SigningContext<'_> {
    /// Validity period derived from the zone's SOA expire field.
    pub fn validity_for(soa_expire: u32) -> Duration {
        Duration::seconds(i64::from(soa_expire)) + Duration::days(3)
    }
}

/// Key states whose KSKs sign the DNSKEY RRSet.
fn ksk_signs(state: KeyState) -> bool {
    matches!(
        state,
        KeyState::Generated
            | KeyState::Published
            | KeyState::Ready
            | KeyState::Active
            | KeyState::Revoked
    )
}

/// Key states whose ZSKs sign everything else.
fn zsk_signs(state: KeyState) -> bool {
    matches!(state, KeyState::Ready | KeyState::Active)
}

/// Produce one RRSIG per eligible key over the RRSet at `owner`.
///
/// Delegation NS RRSets (owner strictly below the apex) yield no
/// signatures; RRSIG itself refuses to be signed; ANAME and APP cannot
/// exist in a signed zone at all.
pub fn sign_rrset(
    ctx: &SigningContext<'_>,
    owner: &DomainName,
    records: &[DnsRecord],
) -> ZoneResult<Vec<DnsRecord>> {
    let zone = ctx.apex.as_str().to_string();
    let qtype = match records.first() {
        Some(rec) => rec.get_querytype(),
        None => return Ok(Vec::new()),
    };

    match qtype {
        QueryType::Rrsig => {
            return Err(ZoneError::InvalidOperation {
                zone,
                detail: "RRSIG RRSets cannot be signed".to_string(),
            })
        }
        QueryType::Aname | QueryType::App => {
            return Err(ZoneError::UnsupportedInSignedZone {
                zone,
                qtype: format!("{:?}", qtype),
            })
        }
        QueryType::Ns if owner != ctx.apex => return Ok(Vec::new()),
        _ => {}
    }

    let eligible: Vec<&DnssecKey> = ctx
        .keys
        .iter()
        .filter(|key| match qtype {
            QueryType::Dnskey => key.key_type == KeyType::KSK && ksk_signs(key.state),
            _ => key.key_type == KeyType::ZSK && zsk_signs(key.state),
        })
        .collect();

    if eligible.is_empty() {
        return Err(ZoneError::NoSigningKey {
            zone,
            qtype: format!("{:?}", qtype),
        });
    }

    let original_ttl = records.first().map(|r| r.get_ttl()).unwrap_or(0);
    let inception = (ctx.now - Duration::minutes(60)).timestamp() as u32;
    let expiration = (ctx.now + ctx.validity).timestamp() as u32;
    let labels = owner.rrsig_label_count();

    let mut rrsigs = Vec::with_capacity(eligible.len());
    for key in eligible {
        log::debug!(
            "signing {} {:?} RRSet with key {}",
            owner,
            qtype,
            key.key_tag
        );

        let tbs = rrsig_tbs(
            owner,
            qtype,
            key.algorithm.to_num(),
            labels,
            original_ttl,
            expiration,
            inception,
            key.key_tag,
            ctx.apex,
            records,
        )
        .map_err(|e| ZoneError::Protocol {
            zone: ctx.apex.as_str().to_string(),
            detail: e.to_string(),
        })?;

        let signature = key.sign_data(&tbs).map_err(|e| match e {
            ZoneError::Crypto { detail, .. } => ZoneError::Crypto {
                zone: ctx.apex.as_str().to_string(),
                detail,
            },
            other => other,
        })?;

        rrsigs.push(DnsRecord::Rrsig {
            domain: owner.as_str().to_string(),
            type_covered: qtype,
            algorithm: key.algorithm.to_num(),
            labels,
            original_ttl,
            expiration,
            inception,
            key_tag: key.key_tag,
            signer_name: ctx.apex.as_str().to_string(),
            signature,
            ttl: TransientTtl(original_ttl),
        });
    }

    Ok(rrsigs)
}

/// The RFC 4034 section 3.1.8.1 signing input: RRSIG rdata minus the
/// signature, then the RRs in canonical form and canonical rdata order.
#[allow(clippy::too_many_arguments)]
fn rrsig_tbs(
    owner: &DomainName,
    qtype: QueryType,
    algorithm: u8,
    labels: u8,
    original_ttl: u32,
    expiration: u32,
    inception: u32,
    key_tag: u16,
    signer: &DomainName,
    records: &[DnsRecord],
) -> Result<Vec<u8>, crate::dns::protocol::ProtocolError> {
    let mut out = Vec::new();
    out.extend_from_slice(&qtype.to_num().to_be_bytes());
    out.push(algorithm);
    out.push(labels);
    out.extend_from_slice(&original_ttl.to_be_bytes());
    out.extend_from_slice(&expiration.to_be_bytes());
    out.extend_from_slice(&inception.to_be_bytes());
    out.extend_from_slice(&key_tag.to_be_bytes());

    let mut name_buf = VectorPacketBuffer::new();
    name_buf.write_qname_canonical(signer.as_str())?;
    out.extend_from_slice(&name_buf.into_bytes());

    let mut owner_buf = VectorPacketBuffer::new();
    owner_buf.write_qname_canonical(owner.as_str())?;
    let owner_wire = owner_buf.into_bytes();

    let mut rdatas: Vec<Vec<u8>> = Vec::with_capacity(records.len());
    for record in records {
        rdatas.push(record.rdata_wire()?);
    }
    rdatas.sort();

    for rdata in rdatas {
        out.extend_from_slice(&owner_wire);
        out.extend_from_slice(&qtype.to_num().to_be_bytes());
        out.extend_from_slice(&CLASS_IN.to_be_bytes());
        out.extend_from_slice(&original_ttl.to_be_bytes());
        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }

    Ok(out)
}

/// Verify an engine-produced RRSIG against its covered records.
pub fn verify_rrsig(rrsig: &DnsRecord, records: &[DnsRecord], key: &DnssecKey) -> ZoneResult<bool> {
    let (owner, qtype, labels, original_ttl, expiration, inception, key_tag, signer, signature) =
        match rrsig {
            DnsRecord::Rrsig {
                domain,
                type_covered,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer_name,
                signature,
                ..
            } => (
                DomainName::new(domain),
                *type_covered,
                *labels,
                *original_ttl,
                *expiration,
                *inception,
                *key_tag,
                DomainName::new(signer_name),
                signature,
            ),
            _ => return Ok(false),
        };

    if key_tag != key.key_tag {
        return Ok(false);
    }

    let tbs = rrsig_tbs(
        &owner,
        qtype,
        key.algorithm.to_num(),
        labels,
        original_ttl,
        expiration,
        inception,
        key_tag,
        &signer,
        records,
    )
    .map_err(|e| ZoneError::Protocol {
        zone: signer.as_str().to_string(),
        detail: e.to_string(),
    })?;

    key.verify_data(&tbs, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_key_generation() {
        let zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        assert_eq!(zsk.key_type, KeyType::ZSK);
        assert_eq!(zsk.state, KeyState::Generated);
        assert_eq!(zsk.dnskey_flags(), 256);

        let ksk =
            DnssecKey::generate(KeyType::KSK, DnssecAlgorithm::EcdsaP256Sha256, 0, now()).unwrap();
        assert_eq!(ksk.dnskey_flags(), 257);

        let rsa = DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::RsaSha256, 90, now()).unwrap();
        assert_eq!(rsa.algorithm, DnssecAlgorithm::RsaSha256);
    }

    #[test]
    fn test_rsamd5_is_refused() {
        let result = DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::RsaMd5, 90, now());
        assert!(matches!(result, Err(ZoneError::UnsupportedAlgorithm { .. })));
    }

    #[test]
    fn test_ecdsa_public_key_is_fixed_width() {
        let key =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        let record = key
            .dnskey_record(&DomainName::new("example.com"), 86400)
            .unwrap();
        match record {
            DnsRecord::Dnskey { public_key, .. } => assert_eq!(public_key.len(), 64),
            _ => panic!("expected DNSKEY"),
        }
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        for algorithm in [
            DnssecAlgorithm::EcdsaP256Sha256,
            DnssecAlgorithm::EcdsaP384Sha384,
            DnssecAlgorithm::RsaSha256,
        ] {
            let key = DnssecKey::generate(KeyType::ZSK, algorithm, 90, now()).unwrap();
            let data = b"www.example.com. 300 IN A 192.0.2.1";
            let sig = key.sign_data(data).unwrap();
            assert!(key.verify_data(data, &sig).unwrap());
            assert!(!key.verify_data(b"tampered", &sig).unwrap());
        }
    }

    #[test]
    fn test_revoke_changes_tag_and_flags() {
        let mut key =
            DnssecKey::generate(KeyType::KSK, DnssecAlgorithm::EcdsaP256Sha256, 0, now()).unwrap();
        let old_tag = key.key_tag;

        let new_tag = key.revoke(now()).unwrap();
        assert_ne!(old_tag, new_tag);
        assert_eq!(key.dnskey_flags(), 257 | REVOKE_FLAG);
        assert_eq!(key.state, KeyState::Revoked);
    }

    #[test]
    fn test_sign_rrset_eligibility() {
        let apex = DomainName::new("example.com");
        let mut ksk =
            DnssecKey::generate(KeyType::KSK, DnssecAlgorithm::EcdsaP256Sha256, 0, now()).unwrap();
        let mut zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        ksk.transition(KeyState::Ready, now());
        zsk.transition(KeyState::Active, now());
        let keys = vec![ksk.clone(), zsk.clone()];

        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };

        let a_set = vec![DnsRecord::A {
            domain: "www.example.com".to_string(),
            addr: "192.0.2.1".parse().unwrap(),
            ttl: TransientTtl(300),
        }];
        let sigs = sign_rrset(&ctx, &DomainName::new("www.example.com"), &a_set).unwrap();
        assert_eq!(sigs.len(), 1);
        match &sigs[0] {
            DnsRecord::Rrsig {
                key_tag,
                type_covered,
                labels,
                signer_name,
                ..
            } => {
                assert_eq!(*key_tag, zsk.key_tag);
                assert_eq!(*type_covered, QueryType::A);
                assert_eq!(*labels, 3);
                assert_eq!(signer_name, "example.com");
            }
            _ => panic!("expected RRSIG"),
        }
        assert!(verify_rrsig(&sigs[0], &a_set, &zsk).unwrap());

        // DNSKEY RRSets go to the KSK.
        let dnskey_set = vec![
            ksk.dnskey_record(&apex, 86400).unwrap(),
            zsk.dnskey_record(&apex, 86400).unwrap(),
        ];
        let sigs = sign_rrset(&ctx, &apex, &dnskey_set).unwrap();
        assert_eq!(sigs.len(), 1);
        match &sigs[0] {
            DnsRecord::Rrsig { key_tag, .. } => assert_eq!(*key_tag, ksk.key_tag),
            _ => panic!("expected RRSIG"),
        }
        assert!(verify_rrsig(&sigs[0], &dnskey_set, &ksk).unwrap());
    }

    #[test]
    fn test_sign_rrset_skips_delegation_ns() {
        let apex = DomainName::new("example.com");
        let mut zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        zsk.transition(KeyState::Active, now());
        let keys = vec![zsk];

        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };

        let delegation = vec![DnsRecord::Ns {
            domain: "child.example.com".to_string(),
            host: "ns1.child.example.com".to_string(),
            ttl: TransientTtl(3600),
        }];
        let sigs = sign_rrset(&ctx, &DomainName::new("child.example.com"), &delegation).unwrap();
        assert!(sigs.is_empty());
    }

    #[test]
    fn test_sign_rrset_refusals() {
        let apex = DomainName::new("example.com");
        let mut zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        zsk.transition(KeyState::Active, now());
        let keys = vec![zsk];

        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };

        let rrsig_set = vec![DnsRecord::Rrsig {
            domain: "example.com".to_string(),
            type_covered: QueryType::A,
            algorithm: 13,
            labels: 2,
            original_ttl: 300,
            expiration: 1,
            inception: 0,
            key_tag: 1,
            signer_name: "example.com".to_string(),
            signature: vec![0],
            ttl: TransientTtl(300),
        }];
        assert!(matches!(
            sign_rrset(&ctx, &apex, &rrsig_set),
            Err(ZoneError::InvalidOperation { .. })
        ));

        let aname_set = vec![DnsRecord::Aname {
            domain: "www.example.com".to_string(),
            target: "cdn.example.net".to_string(),
            ttl: TransientTtl(300),
        }];
        assert!(matches!(
            sign_rrset(&ctx, &DomainName::new("www.example.com"), &aname_set),
            Err(ZoneError::UnsupportedInSignedZone { .. })
        ));
    }

    #[test]
    fn test_no_signing_key() {
        let apex = DomainName::new("example.com");
        let keys: Vec<DnssecKey> = Vec::new();
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(604800),
            now: now(),
        };

        let a_set = vec![DnsRecord::A {
            domain: "example.com".to_string(),
            addr: "192.0.2.1".parse().unwrap(),
            ttl: TransientTtl(300),
        }];
        assert!(matches!(
            sign_rrset(&ctx, &apex, &a_set),
            Err(ZoneError::NoSigningKey { .. })
        ));
    }

    #[test]
    fn test_signature_window() {
        let apex = DomainName::new("example.com");
        let mut zsk =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        zsk.transition(KeyState::Active, now());
        let keys = vec![zsk];

        let soa_expire = 604800u32;
        let ctx = SigningContext {
            apex: &apex,
            keys: &keys,
            validity: SigningContext::validity_for(soa_expire),
            now: now(),
        };

        let a_set = vec![DnsRecord::A {
            domain: "example.com".to_string(),
            addr: "192.0.2.1".parse().unwrap(),
            ttl: TransientTtl(300),
        }];
        let sigs = sign_rrset(&ctx, &apex, &a_set).unwrap();
        match &sigs[0] {
            DnsRecord::Rrsig {
                inception,
                expiration,
                ..
            } => {
                let now_ts = now().timestamp() as u32;
                assert_eq!(*inception, now_ts - 3600);
                assert_eq!(*expiration, now_ts + soa_expire + 3 * 86400);
            }
            _ => panic!("expected RRSIG"),
        }
    }

    #[test]
    fn test_persisted_key_roundtrip() {
        let key =
            DnssecKey::generate(KeyType::ZSK, DnssecAlgorithm::EcdsaP256Sha256, 90, now()).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        let restored: DnssecKey = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.key_tag, key.key_tag);
        assert_eq!(restored.state, key.state);

        let data = b"payload";
        let sig = key.sign_data(data).unwrap();
        assert!(restored.verify_data(data, &sig).unwrap());
    }
}
