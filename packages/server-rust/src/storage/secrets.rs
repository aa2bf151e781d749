//! Secrets read from environment variables.

use async_trait::async_trait;

use crate::traits::SecretStore;

/// Resolves secret `name` from `{PREFIX}_{NAME}`, upper-cased with `-` and
/// `.` mapped to `_`.
#[derive(Debug, Clone)]
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn variable(&self, name: &str) -> String {
        let name: String = name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        if self.prefix.is_empty() {
            name
        } else {
            format!("{}_{name}", self.prefix.to_ascii_uppercase())
        }
    }
}

impl Default for EnvSecrets {
    fn default() -> Self {
        Self::new("TRIAGE")
    }
}

#[async_trait]
impl SecretStore for EnvSecrets {
    async fn get(&self, name: &str) -> anyhow::Result<String> {
        let variable = self.variable(name);
        std::env::var(&variable)
            .map_err(|_| anyhow::anyhow!("secret `{name}` is not set (expected ${variable})"))
    }
}
