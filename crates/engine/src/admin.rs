use crate::error::{EngineError, Result};
use sha2::{Digest, Sha256};

/// Holds the digest of the configured admin secret. With no secret configured
/// every admin operation is refused.
#[derive(Clone, Default)]
pub struct AdminGate {
    digest: Option<[u8; 32]>,
}

impl std::fmt::Debug for AdminGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminGate")
            .field("configured", &self.digest.is_some())
            .finish()
    }
}

impl AdminGate {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            digest: secret.filter(|s| !s.is_empty()).map(digest),
        }
    }

    pub fn check(&self, presented: &str) -> Result<()> {
        let Some(expected) = self.digest else {
            tracing::warn!("admin operation refused: no admin key configured");
            return Err(EngineError::Unauthorized);
        };
        // Comparing fixed-length digests keeps timing independent of both inputs.
        let got = digest(presented);
        let diff = expected
            .iter()
            .zip(got.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            tracing::warn!("admin operation refused: admin key mismatch");
            Err(EngineError::Unauthorized)
        }
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}
