//! Common types for netfence: CRDs, the networking backend object model, and errors

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod model;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Tag scope carrying the name of the Kubernetes cluster that owns an object
pub const TAG_SCOPE_CLUSTER: &str = "netfence/cluster";

/// Tag scope carrying the namespace of the owning SecurityPolicy
pub const TAG_SCOPE_NAMESPACE: &str = "netfence/namespace";

/// Tag scope carrying the name of the owning SecurityPolicy
pub const TAG_SCOPE_SECURITY_POLICY_NAME: &str = "netfence/security_policy_name";

/// Tag scope carrying the UID of the owning SecurityPolicy.
///
/// This is the owner tag: the only join key between the policy, rule and
/// group stores.
pub const TAG_SCOPE_SECURITY_POLICY_UID: &str = "netfence/security_policy_uid";

/// Value written to `marked_for_delete` on objects the backend should remove
pub const MARKED_FOR_DELETE: bool = true;

/// Revision checking on hierarchical patches (last writer wins)
pub const ENFORCE_REVISION_CHECK: bool = false;

/// Finalizer placed on SecurityPolicy resources while backend objects exist
pub const SECURITY_POLICY_FINALIZER: &str = "netfence.dev/security-policy";

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, and
/// fingerprints are compared against objects listed from the backend after
/// a restart.
pub fn deterministic_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(input.as_bytes());
    hash[..8].iter().fold(String::with_capacity(16), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}
