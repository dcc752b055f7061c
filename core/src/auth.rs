use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a credential string. Credentials are stored and
/// looked up by digest only; the raw value never touches the database.
pub fn hash_credential(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the bearer credential from an `Authorization` header value.
pub fn bearer_credential(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
