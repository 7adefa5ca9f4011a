use sha2::{Digest, Sha256};

/// 32-byte rendezvous topic derived from a bridge id (spec.md §3 "Topic").
///
/// `SHA-256("NAT-bridge:" || bridgeId)`. Two endpoints configured with the
/// same `bridgeId` derive the same topic and are therefore discoverable to
/// one another; this is the entirety of the "shared secret" property the
/// bridge id provides.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; 32]);

impl Topic {
    pub fn derive(bridge_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"NAT-bridge:");
        hasher.update(bridge_id.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Topic({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bridge_id_derives_same_topic() {
        let a = Topic::derive("alpha123");
        let b = Topic::derive("alpha123");
        assert_eq!(a, b);
    }

    #[test]
    fn different_bridge_ids_derive_different_topics() {
        let a = Topic::derive("alpha123");
        let b = Topic::derive("beta456");
        assert_ne!(a, b);
    }

    #[test]
    fn matches_known_vector() {
        // SHA-256("NAT-bridge:alpha123")
        let topic = Topic::derive("alpha123");
        let mut hasher = Sha256::new();
        hasher.update(b"NAT-bridge:alpha123");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(topic.as_bytes(), &expected);
    }
}
