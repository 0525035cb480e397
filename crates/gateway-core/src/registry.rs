//! Key Registry (component E): an immutable, ordered set of credentials.
//!
//! Construction lives outside the core (credential-file parsing is out of
//! scope per the spec); this module only models the registry once built.

use std::fmt;

/// One API credential. Constructed at load time, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Credential {
    pub label: String,
    secret: String,
    pub secret_hash: String,
    pub base_url_override: Option<String>,
    pub priority: i32,
    pub disabled: bool,
}

impl Credential {
    pub fn new(
        label: impl Into<String>,
        secret: impl Into<String>,
        base_url_override: Option<String>,
        priority: i32,
        disabled: bool,
    ) -> Self {
        let secret = secret.into();
        let secret_hash = short_hash(&secret);
        Credential {
            label: label.into(),
            secret,
            secret_hash,
            base_url_override,
            priority,
            disabled,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn masked(&self) -> String {
        mask_key(&self.secret)
    }
}

/// A short, non-reversible hex tag for a secret, safe to place in traces.
fn short_hash(secret: &str) -> String {
    // FNV-1a 64-bit — stable, dependency-free, not security sensitive (the
    // hash is a trace tag, never used to recover or verify the secret).
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in secret.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)[..10].to_string()
}

/// Renders `secret` as `"sk-xx***yyyy"`: first 5 and last 4 characters
/// separated by three asterisks. Secrets too short for that yield `"***"`.
pub fn mask_key(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() < 10 {
        return "***".to_string();
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}

#[derive(Debug)]
pub enum RegistryError {
    DuplicateLabel(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateLabel(label) => {
                write!(f, "duplicate credential label: {label}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Ordered sequence of credentials plus an `active_index`.
///
/// Order is the stable sort order: priority descending, then label
/// ascending. Labels are unique within a registry.
#[derive(Debug, Clone)]
pub struct Registry {
    credentials: Vec<Credential>,
    active_index: usize,
}

impl Registry {
    pub fn new(mut credentials: Vec<Credential>) -> Result<Self, RegistryError> {
        credentials.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.label.cmp(&b.label)));
        let mut seen = std::collections::HashSet::new();
        for c in &credentials {
            if !seen.insert(c.label.clone()) {
                return Err(RegistryError::DuplicateLabel(c.label.clone()));
            }
        }
        Ok(Registry {
            credentials,
            active_index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn set_active_index(&mut self, index: usize) {
        if index < self.credentials.len() {
            self.active_index = index;
        }
    }

    pub fn get(&self, index: usize) -> Option<&Credential> {
        self.credentials.get(index)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.label == label)
    }

    pub fn lookup(&self, label: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.label == label)
    }

    pub fn active_key(&self) -> Option<&Credential> {
        self.credentials.get(self.active_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_by_priority_desc_then_label_asc() {
        let reg = Registry::new(vec![
            Credential::new("b", "sk-bbbbbbbbbbbbbbbb", None, 1, false),
            Credential::new("a", "sk-aaaaaaaaaaaaaaaa", None, 5, false),
            Credential::new("c", "sk-cccccccccccccccc", None, 5, false),
        ])
        .unwrap();
        let labels: Vec<&str> = reg.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "c", "b"]);
    }

    #[test]
    fn duplicate_labels_rejected() {
        let err = Registry::new(vec![
            Credential::new("a", "sk-aaaaaaaaaaaaaaaa", None, 0, false),
            Credential::new("a", "sk-bbbbbbbbbbbbbbbb", None, 0, false),
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn mask_key_shapes_long_secret() {
        let masked = mask_key("sk-abcdefghijklmnop");
        assert!(masked.starts_with("sk-ab"));
        assert!(masked.ends_with("mnop"));
        assert!(masked.contains("***"));
    }

    #[test]
    fn mask_key_short_secret_is_fully_redacted() {
        assert_eq!(mask_key("short"), "***");
    }

    #[test]
    fn active_key_defaults_to_first() {
        let reg = Registry::new(vec![Credential::new(
            "a",
            "sk-aaaaaaaaaaaaaaaa",
            None,
            0,
            false,
        )])
        .unwrap();
        assert_eq!(reg.active_key().unwrap().label, "a");
    }
}
