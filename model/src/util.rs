use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // writing into a String never fails
        let _ = write!(s, "{:02x}", b);
    }
    s
}

pub(crate) fn dashed(parts: &[String]) -> String {
    parts.join("-")
}

pub(crate) fn timestamp_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Digest of this process instance: machine id, process id and a random nonce drawn once.
///
/// Two processes on one host, or one process restarted on the same host, get different digests.
pub(crate) fn process_digest() -> u64 {
    static DIGEST: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *DIGEST.get_or_init(|| {
        let mach = machine_uid::get()
            .unwrap_or_else(|_| std::env::var("MACHINE_ID").unwrap_or_default());
        let mut hasher = std::hash::DefaultHasher::new();
        std::hash::Hash::hash(&mach, &mut hasher);
        std::hash::Hash::hash(&std::process::id(), &mut hasher);
        std::hash::Hash::hash(&rand::random::<u64>(), &mut hasher);
        std::hash::Hasher::finish(&hasher)
    })
}

/// Bytes that are written as base64 text in human readable formats and as raw bytes otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MaybeBase64Bytes(pub Bytes);

impl MaybeBase64Bytes {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }
    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl From<Bytes> for MaybeBase64Bytes {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl std::ops::Deref for MaybeBase64Bytes {
    type Target = Bytes;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for MaybeBase64Bytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            use base64::Engine;
            serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for MaybeBase64Bytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            use base64::Engine;
            use serde::de::Error;
            let s = String::deserialize(deserializer)?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(D::Error::custom)?;
            Ok(Self(Bytes::from(bytes)))
        } else {
            Ok(Self(Bytes::deserialize(deserializer)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_and_dashed() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
        assert_eq!(dashed(&["ab".to_string(), "cd".to_string()]), "ab-cd");
    }

    #[test]
    fn test_base64_in_json() {
        let bytes = MaybeBase64Bytes::new(Bytes::from_static(b"hello"));
        let json = serde_json::to_string(&bytes).unwrap();
        assert_eq!(json, "\"aGVsbG8=\"");
        let back: MaybeBase64Bytes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bytes);
    }
}
