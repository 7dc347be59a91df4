//! Declared-set hashing for change detection.
//!
//! The hash covers project identity and every declared descriptor, sorted by
//! logical name, using the canonical attribute fingerprints. Reordering
//! resources in the file or the elements of an unordered set does not change
//! it; any change in meaning does.

use sha2::{Digest, Sha256};

use crate::resource::ResourceDescriptor;

/// Hasher for computing declared-set hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole declared set for a project.
    #[must_use]
    pub fn hash_declared(&self, project: &str, environment: &str, descriptors: &[ResourceDescriptor]) -> String {
        let mut hasher = Sha256::new();

        hasher.update(project.as_bytes());
        hasher.update([0u8]);
        hasher.update(environment.as_bytes());
        hasher.update([0u8]);

        let mut sorted: Vec<&ResourceDescriptor> = descriptors.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for descriptor in sorted {
            hasher.update(self.hash_descriptor(descriptor).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single descriptor.
    #[must_use]
    pub fn hash_descriptor(&self, descriptor: &ResourceDescriptor) -> String {
        let mut hasher = Sha256::new();

        hasher.update(descriptor.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(descriptor.name.as_bytes());
        hasher.update([0u8]);

        // AttributeMap is a BTreeMap, so keys arrive sorted
        for (key, value) in &descriptor.attributes {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.fingerprint().as_bytes());
        }

        for dependency in descriptor.dependencies() {
            hasher.update(dependency.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
