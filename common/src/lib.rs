#![no_std]

//! Tollgate Common Types
//!
//! Proxy configuration objects shared between the reconciliation engine and
//! configuration-API implementations, plus the content hash used to derive
//! stable rule identities. All types are no_std compatible (alloc only).

extern crate alloc;

pub mod models;

pub use models::{
    Backend, BackendSwitchingRule, Bind, Defaults, Frontend, Global, LogTarget, Mode, RuntimeApi,
    Server, StickTable,
};

/// Address the HTTPS frontend binds to (IPv4) while SSL passthrough chains into it
pub const LOOPBACK_V4: &str = "127.0.0.1";

/// Address the HTTPS frontend binds to (IPv6) while SSL passthrough chains into it
pub const LOOPBACK_V6: &str = "::1";

/// FNV-1a hash function for consistent hashing
pub const fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_hash_consistency() {
        let rule1 = b"redirect scheme https code 302";
        let rule2 = b"redirect scheme https code 302";
        let rule3 = b"redirect scheme https code 301";

        // Same content should produce same hash
        assert_eq!(fnv1a_hash(rule1), fnv1a_hash(rule2));

        // Different content should produce different hashes
        assert_ne!(fnv1a_hash(rule1), fnv1a_hash(rule3));
    }

    #[test]
    fn test_fnv1a_hash_empty_input() {
        // Empty input hashes to the FNV offset basis
        assert_eq!(fnv1a_hash(b""), 0xcbf29ce484222325);
    }
}
