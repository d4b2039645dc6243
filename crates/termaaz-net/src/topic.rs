//! Room identity and transport topic derivation.

use sha2::{Digest, Sha256};

use termaaz_shared::constants::{TOPIC_PREFIX, TOPIC_SUFFIX};

/// The fixed-length binary key a room advertises under. Derived
/// deterministically from the room id, so any two nodes that agree on
/// the id converge on the same topic without negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// SHA-256 of `termaaz:<trimmed room id>:termaazation`.
    pub fn for_room(room_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(TOPIC_PREFIX.as_bytes());
        hasher.update(room_id.trim().as_bytes());
        hasher.update(TOPIC_SUFFIX.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Generate a 4-digit room code in 1000..=9999.
pub fn generate_room_code() -> String {
    let code = 1000 + rand::random::<u32>() % 9000;
    code.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_is_stable_across_runs() {
        // SHA-256("termaaz:1234:termaazation"), fixed for all nodes.
        let topic = Topic::for_room("1234");
        assert_eq!(
            topic.to_string(),
            "06471a17e41f7faf7a18166c3357d4ebcdef0bc0e03fa843ce3a28fabdcbb509"
        );
    }

    #[test]
    fn test_room_id_is_trimmed() {
        assert_eq!(Topic::for_room(" 1234 "), Topic::for_room("1234"));
        assert_ne!(Topic::for_room("1234"), Topic::for_room("1235"));
    }

    #[test]
    fn test_room_code_shape() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert_eq!(code.len(), 4);
            let n: u32 = code.parse().unwrap();
            assert!((1000..=9999).contains(&n));
        }
    }
}
