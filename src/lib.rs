//! Meridian DNS
//!
//! The authoritative primary-zone engine of a recursive/authoritative DNS
//! server, with integrated DNSSEC key management.
//!
//! # Features
//!
//! * Authoritative zone storage in canonical order
//! * Record mutation API with atomic commits and IXFR history
//! * DNSSEC signing (ECDSA P-256/P-384, RSA/SHA-256, RSA/SHA-512)
//! * Automatic key rollover, retirement and RFC 5011 revocation
//! * NSEC and NSEC3 authenticated denial of existence
//! * DNS NOTIFY dispatch to secondary servers
//!
//! # Architecture
//!
//! Everything lives under the `dns` module; `dns::primary::PrimaryZone`
//! is the entry point for hosting and mutating a zone. Query serving,
//! transports and the management surface are left to the embedding
//! server, which shares the zone tree through `dns::authority::Authority`.

/// DNS engine and protocol handling
pub mod dns;
