// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Object exchange between the device agent and the issuance pipeline.

use std::collections::BTreeMap;

use spin::RwLock;

use crate::Result;

const CSR_PREFIX: &str = "csr/";

/// Key of the uploaded CSR slot.
pub fn csr_key(device_id: &str) -> String {
    format!("{CSR_PREFIX}{device_id}.csr")
}

/// Key of the issued certificate slot.
pub fn certificate_key(device_id: &str) -> String {
    format!("{CSR_PREFIX}{device_id}.crt")
}

/// Key of the issuance metadata slot.
pub fn metadata_key(device_id: &str) -> String {
    format!("{CSR_PREFIX}{device_id}.json")
}

/// Recovers the device id from a CSR slot key.
pub fn device_id_from_csr_key(key: &str) -> Option<&str> {
    key.strip_prefix(CSR_PREFIX)?
        .strip_suffix(".csr")
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Blob storage.
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `key`, replacing any previous object.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Fetches the object under `key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.objects.write().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.read().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keys() {
        assert_eq!(csr_key("dev-1"), "csr/dev-1.csr");
        assert_eq!(certificate_key("dev-1"), "csr/dev-1.crt");
        assert_eq!(metadata_key("dev-1"), "csr/dev-1.json");
    }

    #[test]
    fn device_id_is_recovered_from_csr_keys_only() {
        assert_eq!(device_id_from_csr_key("csr/dev-1.csr"), Some("dev-1"));
        assert_eq!(device_id_from_csr_key("csr/dev-1.crt"), None);
        assert_eq!(device_id_from_csr_key("other/dev-1.csr"), None);
        assert_eq!(device_id_from_csr_key("csr/.csr"), None);
        assert_eq!(device_id_from_csr_key("csr/a/b.csr"), None);
    }

    #[test]
    fn put_replaces() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(store.keys(), vec!["k".to_owned()]);
    }
}
