use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Cache envelope carrying a SHA-256 checksum of its payload.
///
/// External billing rows are cached as serialized envelopes; an entry whose
/// checksum no longer matches is treated as a miss and refetched.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    /// Cached payload (JSON string).
    pub data: String,
    /// Hex SHA-256 of `data`.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }

    /// Serializes `value` and wraps it; `None` if it cannot be serialized.
    pub fn seal<T: Serialize>(value: &T) -> Option<String> {
        let data = serde_json::to_string(value).ok()?;
        serde_json::to_string(&Self::new(data)).ok()
    }

    /// Unwraps and deserializes a sealed entry. Returns `None` when the
    /// envelope is malformed or its checksum does not match.
    pub fn open<T: DeserializeOwned>(serialized: &str) -> Option<T> {
        let entry: ValidatedCacheEntry = serde_json::from_str(serialized).ok()?;
        if !entry.is_valid() {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            return None;
        }
        serde_json::from_str(&entry.data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_value_opens() {
        let rows = vec![("eq".to_string(), 12_u32), ("tu".to_string(), 9)];
        let sealed = ValidatedCacheEntry::seal(&rows).unwrap();
        let opened: Option<Vec<(String, u32)>> = ValidatedCacheEntry::open(&sealed);
        assert_eq!(opened, Some(rows));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let sealed = ValidatedCacheEntry::seal(&vec!["42.50"]).unwrap();
        let tampered = sealed.replace("42.50", "0.01");
        let opened: Option<Vec<String>> = ValidatedCacheEntry::open(&tampered);
        assert_eq!(opened, None);
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = ValidatedCacheEntry::new("rows".to_string());
        let b = ValidatedCacheEntry::new("rows".to_string());
        assert_eq!(a.checksum, b.checksum);
        assert!(a.is_valid());
    }
}
