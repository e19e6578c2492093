//! Authentication domain models.

use serde::{Deserialize, Serialize};

/// `aud` claim: a single audience or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(a) => a == audience,
            Audience::Many(list) => list.iter().any(|a| a == audience),
        }
    }
}

/// Claims extracted from a verified bearer token. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaim {
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: Audience,
    /// Subject (standard JWT `sub` claim).
    pub sub: String,
    /// Entra ID object id of the caller, when the issuer provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oid: Option<String>,
    /// Expiry (unix timestamp).
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
}

impl AuthClaim {
    /// The principal id the token speaks for: `oid` when present, else `sub`.
    pub fn subject(&self) -> &str {
        self.oid.as_deref().unwrap_or(&self.sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_prefers_object_id() {
        let claim: AuthClaim = serde_json::from_value(serde_json::json!({
            "iss": "https://issuer",
            "aud": "api://actlabs",
            "sub": "pairwise-sub",
            "oid": "uid1",
            "exp": 0
        }))
        .unwrap();
        assert_eq!(claim.subject(), "uid1");
    }

    #[test]
    fn subject_falls_back_to_sub() {
        let claim: AuthClaim = serde_json::from_value(serde_json::json!({
            "iss": "https://issuer",
            "aud": ["a", "b"],
            "sub": "uid2",
            "exp": 0
        }))
        .unwrap();
        assert_eq!(claim.subject(), "uid2");
        assert!(claim.aud.contains("b"));
        assert!(!claim.aud.contains("c"));
    }
}
