use async_trait::async_trait;
use tracing::{info, warn};

use crate::catalog::AcquisitionTarget;
use crate::error::{ChainExhausted, NavigationError, StrategyFailure};
use crate::strategy::SourceStrategy;
use crate::validate::{Normalizer, ValidatedImage};

/// Raw bytes pulled from a page, with provenance. Scoped to one attempt.
#[derive(Debug, Clone)]
pub struct ImageCandidate {
    pub bytes: Vec<u8>,
    pub strategy: String,
    pub source_url: String,
}

/// Seam between the executor and the browser. The live implementation is
/// `BrowserSession`; tests substitute a mock and count calls.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn collect(
        &self,
        strategy: &SourceStrategy,
        target: &AcquisitionTarget,
    ) -> Result<Vec<ImageCandidate>, NavigationError>;
}

/// Tries an ordered list of acquisition strategies until one yields a
/// validated image. The first candidate to pass validation short-circuits
/// the whole chain; later strategies and candidates are never attempted.
pub struct SourceChain {
    strategies: Vec<SourceStrategy>,
    normalizer: Normalizer,
}

impl SourceChain {
    pub fn new(strategies: Vec<SourceStrategy>, normalizer: Normalizer) -> Self {
        Self {
            strategies,
            normalizer,
        }
    }

    pub fn strategy_count(&self) -> usize {
        self.strategies.len()
    }

    /// Exhaustion returns one reason per strategy, which bounds work per
    /// item to the configured chain length.
    pub async fn acquire(
        &self,
        source: &dyn CandidateSource,
        target: &AcquisitionTarget,
    ) -> Result<ValidatedImage, ChainExhausted> {
        let mut reasons = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            match self.try_strategy(source, strategy, target).await {
                Ok(image) => {
                    info!(
                        item = %target.label(),
                        strategy = strategy.name(),
                        width = image.width,
                        height = image.height,
                        "image acquired"
                    );
                    return Ok(image);
                }
                Err(reason) => {
                    warn!(
                        item = %target.label(),
                        strategy = strategy.name(),
                        "strategy failed: {}", reason
                    );
                    reasons.push(StrategyFailure {
                        strategy: strategy.name().to_string(),
                        reason,
                    });
                }
            }
        }
        Err(ChainExhausted {
            target: target.label(),
            reasons,
        })
    }

    async fn try_strategy(
        &self,
        source: &dyn CandidateSource,
        strategy: &SourceStrategy,
        target: &AcquisitionTarget,
    ) -> Result<ValidatedImage, String> {
        let candidates = source
            .collect(strategy, target)
            .await
            .map_err(|e| e.to_string())?;
        if candidates.is_empty() {
            return Err("no candidates extracted".to_string());
        }

        let total = candidates.len();
        let mut rejections = Vec::new();
        for candidate in candidates {
            match self.normalizer.process(&candidate.bytes) {
                Ok(image) => return Ok(image),
                Err(reason) => {
                    rejections.push(format!("{}: {}", candidate.source_url, reason));
                }
            }
        }
        Err(format!(
            "all {} candidates rejected ({})",
            total,
            rejections.join("; ")
        ))
    }
}
