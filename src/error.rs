use thiserror::Error;

/// Failures while navigating or fetching from a third-party source.
///
/// All of these are per-strategy: the chain logs them and moves on to the
/// next configured source. None of them aborts a run.
#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("navigation timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("challenge/captcha page served instead of content")]
    ChallengeDetected,

    #[error("non-content response: {0}")]
    NonContent(String),
}

/// Why a raw candidate was rejected by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("undecodable image bytes: {0}")]
    Undecodable(String),

    #[error("image {width}x{height} below minimum {min}px")]
    TooSmall { width: u32, height: u32, min: u32 },

    #[error("re-encode failed: {0}")]
    EncodeFailed(String),
}

/// One failed strategy attempt, with a human-readable reason.
#[derive(Debug, Clone)]
pub struct StrategyFailure {
    pub strategy: String,
    pub reason: String,
}

impl std::fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.strategy, self.reason)
    }
}

/// Every configured strategy failed for a target. Carries exactly one
/// reason per attempted strategy, which bounds run time instead of
/// retrying indefinitely.
#[derive(Debug)]
pub struct ChainExhausted {
    pub target: String,
    pub reasons: Vec<StrategyFailure>,
}

impl std::error::Error for ChainExhausted {}

impl std::fmt::Display for ChainExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let detail = self
            .reasons
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        write!(
            f,
            "{}: all {} sources exhausted [{}]",
            self.target,
            self.reasons.len(),
            detail
        )
    }
}
