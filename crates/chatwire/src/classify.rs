//! Service-restriction classification.
//!
//! The chat service reports restrictions as free-text English phrases. The
//! matcher is deliberately a value the caller can swap out — the invariant
//! downstream is the TempBlocked/blocked state transition, not these words.

/// What a refusal reason amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockVerdict {
    /// No recognized restriction; treat as a transient failure.
    None,
    /// Temporary restriction; pause the session for the block window.
    Temporary,
    /// Account-level restriction; stop using the identity.
    Permanent,
}

/// Substring matcher over refusal texts. Permanent phrases win over
/// temporary ones when both match.
#[derive(Debug, Clone)]
pub struct BlockClassifier {
    temporary: Vec<String>,
    permanent: Vec<String>,
}

impl Default for BlockClassifier {
    fn default() -> Self {
        Self {
            temporary: ["restricted", "try again later", "too many", "spam"]
                .map(String::from)
                .to_vec(),
            permanent: ["banned", "suspended", "not authorized", "unusual activity"]
                .map(String::from)
                .to_vec(),
        }
    }
}

impl BlockClassifier {
    pub fn new(temporary: Vec<String>, permanent: Vec<String>) -> Self {
        Self {
            temporary: temporary.into_iter().map(|p| p.to_lowercase()).collect(),
            permanent: permanent.into_iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn classify(&self, reason: &str) -> BlockVerdict {
        let lower = reason.to_lowercase();
        if self.permanent.iter().any(|p| lower.contains(p.as_str())) {
            BlockVerdict::Permanent
        } else if self.temporary.iter().any(|p| lower.contains(p.as_str())) {
            BlockVerdict::Temporary
        } else {
            BlockVerdict::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_phrases() {
        let c = BlockClassifier::default();
        assert_eq!(c.classify("Please try again later"), BlockVerdict::Temporary);
        assert_eq!(c.classify("too many messages"), BlockVerdict::Temporary);
        assert_eq!(c.classify("account BANNED"), BlockVerdict::Permanent);
        assert_eq!(
            c.classify("unusual activity detected"),
            BlockVerdict::Permanent
        );
        assert_eq!(c.classify("connection reset"), BlockVerdict::None);
    }

    #[test]
    fn permanent_wins_over_temporary() {
        let c = BlockClassifier::default();
        assert_eq!(
            c.classify("suspended for spam"),
            BlockVerdict::Permanent
        );
    }

    #[test]
    fn custom_phrase_lists() {
        let c = BlockClassifier::new(vec!["cooldown".into()], vec!["terminated".into()]);
        assert_eq!(c.classify("in Cooldown"), BlockVerdict::Temporary);
        assert_eq!(c.classify("terminated"), BlockVerdict::Permanent);
        assert_eq!(c.classify("try again later"), BlockVerdict::None);
    }
}
