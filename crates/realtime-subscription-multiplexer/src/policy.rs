//! Channel protection, eviction choice and auth fingerprints.

use sha2::{Digest, Sha256};

/// Fingerprint recorded for channels opened without a token.
pub const ANONYMOUS_FINGERPRINT: &str = "anonymous";

/// Hex characters of the token digest kept in a fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Whether `channel` starts with any of the protected prefixes.
pub fn is_protected(channel: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|prefix| !prefix.is_empty() && channel.starts_with(prefix.as_str()))
}

/// Short, non-reversible identity of an access token.
///
/// Missing and blank tokens share [`ANONYMOUS_FINGERPRINT`].
pub fn auth_fingerprint(token: Option<&str>) -> String {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        None => ANONYMOUS_FINGERPRINT.to_string(),
        Some(token) => {
            let digest = Sha256::digest(token.as_bytes());
            let mut hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            hex.truncate(FINGERPRINT_LEN);
            hex
        }
    }
}

/// Candidate for eviction: name, protection flag, open sequence.
#[derive(Debug, Clone, Copy)]
pub struct EvictionCandidate<'a> {
    pub name: &'a str,
    pub protected: bool,
    pub sequence: u64,
}

/// Picks the channel to close when at capacity: the oldest unprotected
/// channel, or the oldest protected one when every channel is protected.
pub fn choose_victim<'a, I>(candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = EvictionCandidate<'a>>,
{
    candidates
        .into_iter()
        .min_by_key(|c| (c.protected, c.sequence))
        .map(|c| c.name)
}
