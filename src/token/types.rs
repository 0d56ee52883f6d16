// Token lifecycle types

use serde::Deserialize;

/// Where a cached token was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Memory,
    Persisted,
}

/// Last-known credential value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub token: String,
    pub source: CacheSource,
}

/// The credential being watched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialTarget {
    /// Registrable domain, e.g. `instagram.com`
    pub domain: String,
    /// Exact credential name, e.g. `sessionid`
    pub name: String,
}

impl CredentialTarget {
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
        }
    }

    /// Whether a host-reported domain falls under the target domain
    ///
    /// Accepts the bare domain, the leading-dot wildcard form and any
    /// subdomain. Comparison is case-insensitive.
    pub fn matches_domain(&self, domain: &str) -> bool {
        let target = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let domain = domain.to_ascii_lowercase();
        let bare = domain.strip_prefix('.').unwrap_or(&domain);

        bare == target || bare.ends_with(&format!(".{}", target))
    }
}

/// Change notification from the host environment
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialEvent {
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    /// The credential was deleted rather than written
    #[serde(default)]
    pub removed: bool,
}

/// What produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    HostEvent,
    Poll,
    Startup,
    Acquisition,
}

impl std::fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CandidateOrigin::HostEvent => "host_event",
            CandidateOrigin::Poll => "poll",
            CandidateOrigin::Startup => "startup",
            CandidateOrigin::Acquisition => "acquisition",
        };
        f.write_str(name)
    }
}

/// A possibly-new token value, always evaluated through the guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub token: String,
    pub origin: CandidateOrigin,
}

/// Token with empty or whitespace-only values mapped to `None`
pub fn non_empty(token: Option<String>) -> Option<String> {
    token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Short prefix safe to put in logs
pub fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_domain_accepts_bare_and_subdomains() {
        let target = CredentialTarget::new("instagram.com", "sessionid");
        assert!(target.matches_domain("instagram.com"));
        assert!(target.matches_domain(".instagram.com"));
        assert!(target.matches_domain("sub.instagram.com"));
        assert!(target.matches_domain("WWW.Instagram.com"));
    }

    #[test]
    fn test_matches_domain_rejects_lookalikes() {
        let target = CredentialTarget::new("instagram.com", "sessionid");
        assert!(!target.matches_domain("notinstagram.com"));
        assert!(!target.matches_domain("instagram.com.evil.test"));
        assert!(!target.matches_domain("com"));
        assert!(!target.matches_domain(""));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(Some(" SID1\n".to_string())), Some("SID1".to_string()));
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn test_mask_never_reveals_full_token() {
        assert_eq!(mask("abcdefghijkl"), "abcdef...");
        assert_eq!(mask("abc"), "abc...");
    }

    #[test]
    fn test_event_deserializes_with_defaults() {
        let event: CredentialEvent =
            serde_json::from_str(r#"{"domain":".instagram.com","name":"sessionid"}"#).unwrap();
        assert_eq!(event.value, None);
        assert!(!event.removed);
    }
}
