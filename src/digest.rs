//! Stable content hashing.
//!
//! Content hashes, ruleset checksums, input hashes and default idempotency
//! keys are all blake3 digests over a domain tag followed by the canonical
//! JSON encoding of the value. Canonical here means: struct fields in
//! declaration order, maps as `BTreeMap`, decimals as strings.

use blake3::Hasher;
use serde::Serialize;

use crate::error::CalcError;

/// Domain tag for rule content hashes.
pub const RULE_DOMAIN: &str = "factforge/rule/v1";
/// Domain tag for ruleset checksums.
pub const RULESET_DOMAIN: &str = "factforge/ruleset/v1";
/// Domain tag for client data hashes.
pub const INPUTS_DOMAIN: &str = "factforge/inputs/v1";
/// Domain tag for request fingerprints.
pub const REQUEST_DOMAIN: &str = "factforge/request/v1";

/// Hex blake3 digest of `bytes` under a domain tag.
#[must_use]
pub fn digest_bytes(domain: &str, bytes: &[u8]) -> String {
    let mut h = Hasher::new();
    h.update(domain.as_bytes());
    h.update(&[0]);
    h.update(bytes);
    h.finalize().to_hex().to_string()
}

/// Hex blake3 digest of the canonical JSON encoding of `value`.
///
/// # Errors
///
/// Returns `CalcError::Internal` if the value cannot be serialized.
pub fn digest_json<T: Serialize + ?Sized>(domain: &str, value: &T) -> Result<String, CalcError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(digest_bytes(domain, &bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    #[test]
    fn digest_is_stable_and_domain_separated() {
        let a = digest_bytes(RULE_DOMAIN, b"payload");
        let b = digest_bytes(RULE_DOMAIN, b"payload");
        let c = digest_bytes(RULESET_DOMAIN, b"payload");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert_eq!(hex::decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let mut first = BTreeMap::new();
        first.insert("salary", "100000");
        first.insert("deductions", "2500");
        let mut second = BTreeMap::new();
        second.insert("deductions", "2500");
        second.insert("salary", "100000");
        assert_eq!(
            digest_json(INPUTS_DOMAIN, &first).unwrap(),
            digest_json(INPUTS_DOMAIN, &second).unwrap()
        );
    }
}
