use k8s_openapi::jiff::Timestamp;
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};

use std::collections::BTreeMap;

/// Annotation key for tracking the last time a secret was synchronized.
pub const SYNCED_AT_ANNOTATION: &str = "orkestra.io/synced-at";

/// Annotation key for the checksum of the data a secret was synchronized with.
pub const CHECKSUM_ANNOTATION: &str = "orkestra.io/checksum";

/// SHA-256 over the sorted key/value pairs of a secret payload, hex encoded.
///
/// Keys are length-prefixed so that moving bytes between a key and its value changes the
/// checksum.
pub fn checksum(fields: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in fields {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    format!("{:x}", hasher.finalize())
}

/// Add sync annotations to a secret's metadata.
///
/// This function should be called every time a secret is (re)created from local state.
pub fn add_sync_annotations(annotations: &mut BTreeMap<String, String>, checksum: &str) {
    annotations.insert(
        SYNCED_AT_ANNOTATION.to_string(),
        Timestamp::now().to_string(),
    );
    annotations.insert(CHECKSUM_ANNOTATION.to_string(), checksum.to_string());
}

/// Check if an object was synchronized with the given payload checksum.
pub fn is_in_sync(metadata: &ObjectMeta, checksum: &str) -> bool {
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CHECKSUM_ANNOTATION))
        .is_some_and(|c| c == checksum)
}

/// Last synchronization time recorded on an object, if any and parseable.
pub fn synced_at(metadata: &ObjectMeta) -> Option<Timestamp> {
    metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SYNCED_AT_ANNOTATION))
        .and_then(|t| t.parse::<Timestamp>().ok())
}
