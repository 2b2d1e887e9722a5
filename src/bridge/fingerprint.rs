//! Config fingerprints for the restart policy.

use sha2::{Digest, Sha256};

use crate::config::ToolServerConfig;

/// Digest of everything that affects how a tool server is launched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// Hash the canonical form of `config`.
    ///
    /// Every field is length-prefixed so adjacent values cannot run
    /// together, and `env` is already key-ordered.
    pub fn of(config: &ToolServerConfig) -> Self {
        let mut hasher = Sha256::new();

        feed(&mut hasher, b"command", config.command.as_bytes());
        hasher.update((config.args.len() as u64).to_le_bytes());
        for arg in &config.args {
            feed(&mut hasher, b"arg", arg.as_bytes());
        }
        hasher.update((config.env.len() as u64).to_le_bytes());
        for (key, value) in &config.env {
            feed(&mut hasher, b"env.key", key.as_bytes());
            feed(&mut hasher, b"env.value", value.as_bytes());
        }
        if let Some(cwd) = &config.cwd {
            feed(&mut hasher, b"cwd", cwd.to_string_lossy().as_bytes());
        }

        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn feed(hasher: &mut Sha256, tag: &[u8], bytes: &[u8]) {
    hasher.update(tag);
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl std::fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..12])
    }
}
