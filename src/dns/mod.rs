//! Authoritative DNS engine
//!
//! This module provides the primary-zone side of a DNS server:
//! * DNS packet parsing and serialization
//! * Canonical-order zone tree shared with the query path
//! * DNSSEC signing with automatic key lifecycle management
//! * NSEC/NSEC3 authenticated denial of existence
//! * IXFR change history with SOA serial management
//! * Outbound NOTIFY dispatch to secondary servers
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `authority` - the shared zone tree
//! * `primary` - primary zone mutation API and committer
//! * `dnssec` - key material and RRSet signing
//! * `denial` - NSEC/NSEC3 chain construction and maintenance
//! * `key_lifecycle` - key state machine and periodic timer
//! * `history` - IXFR change history
//! * `notify` - outbound NOTIFY dispatcher
//! * `client` - DNS client for outgoing queries
//! * `buffer` - low-level packet buffer operations

/// Authoritative zone tree shared between queries and mutation
pub mod authority;

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// DNS client for making outgoing queries
pub mod client;

/// NSEC and NSEC3 denial-of-existence chains
pub mod denial;

/// DNSSEC key material and RRSet signing
pub mod dnssec;

/// Enhanced error types for zone operations
pub mod errors;

/// IXFR change history
pub mod history;

/// Key lifecycle state machine and timer
pub mod key_lifecycle;

/// Outbound NOTIFY dispatch
pub mod notify;

/// Primary zone engine and public mutation API
pub mod primary;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// RRSet storage for zone nodes
pub mod rrset;
