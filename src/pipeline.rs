use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::browser::BrowserSession;
use crate::catalog::{self, AcquisitionTarget};
use crate::chain::{CandidateSource, SourceChain};
use crate::config::Config;
use crate::storage::{CatalogPersister, ImageSink, PersistedImageRecord, StorageManager};
use crate::strategy;
use crate::validate::Normalizer;

#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_id: i64,
    pub label: String,
    pub reason: String,
}

/// Aggregated counters for one invocation, finalized at run end.
#[derive(Debug)]
pub struct RunStatistics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

impl RunStatistics {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> String {
        format!(
            "run {}: processed {}, succeeded {}, failed {}",
            self.run_id, self.processed, self.succeeded, self.failed
        )
    }
}

/// One full acquisition run: select targets, launch the run-scoped
/// browser, walk items strictly sequentially, tear everything down.
pub async fn run(config: &Config, pool: &PgPool, storage: &StorageManager) -> Result<RunStatistics> {
    let items = catalog::list_items_missing_image(pool, config.limit).await?;
    info!(count = items.len(), limit = config.limit, "selected items missing images");

    let targets: Vec<AcquisitionTarget> = items.iter().map(AcquisitionTarget::from).collect();
    if targets.is_empty() {
        let mut stats = RunStatistics::new();
        stats.finish();
        return Ok(stats);
    }

    let chain = SourceChain::new(
        strategy::load_chain(config.strategy_file.as_deref())?,
        Normalizer::new(config.min_image_size, config.target_size),
    );
    info!(strategies = chain.strategy_count(), "strategy chain loaded");

    // Launch failure is fatal; teardown is guaranteed because the session
    // (and the Chrome process it owns) drops on every exit path.
    let session = BrowserSession::launch(config)?;
    let sink = CatalogPersister::new(storage.clone(), pool.clone());

    Ok(execute(&chain, &session, &sink, &targets, config.delay_between_items).await)
}

/// Sequential item loop with a fixed politeness delay. A per-item failure
/// is recorded and the loop moves on; nothing here aborts the run.
pub async fn execute(
    chain: &SourceChain,
    source: &dyn CandidateSource,
    sink: &dyn ImageSink,
    targets: &[AcquisitionTarget],
    delay: Duration,
) -> RunStatistics {
    let mut stats = RunStatistics::new();

    for (idx, target) in targets.iter().enumerate() {
        if idx > 0 {
            sleep(delay).await;
        }
        info!(item = %target.label(), "processing ({}/{})", idx + 1, targets.len());
        stats.processed += 1;

        match process_item(chain, source, sink, target).await {
            Ok(record) => {
                stats.succeeded += 1;
                info!(item = target.item_id, url = %record.public_url, "item done");
            }
            Err(reason) => {
                stats.failed += 1;
                warn!(item = target.item_id, "item failed: {}", reason);
                stats.failures.push(ItemFailure {
                    item_id: target.item_id,
                    label: target.label(),
                    reason,
                });
            }
        }
    }

    stats.finish();
    stats
}

async fn process_item(
    chain: &SourceChain,
    source: &dyn CandidateSource,
    sink: &dyn ImageSink,
    target: &AcquisitionTarget,
) -> Result<PersistedImageRecord, String> {
    let image = chain
        .acquire(source, target)
        .await
        .map_err(|e| e.to_string())?;
    // No in-run retry on persistence errors: the item still lacks an
    // image, so it stays eligible for a future run.
    sink.persist(target, &image)
        .await
        .map_err(|e| format!("persistence failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ImageCandidate;
    use crate::error::NavigationError;
    use crate::strategy::SourceStrategy;
    use crate::validate::ValidatedImage;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::Mutex;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([50, 90, 130]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn targets(n: i64) -> Vec<AcquisitionTarget> {
        (1..=n)
            .map(|i| AcquisitionTarget {
                item_id: i,
                brand: "Acme".into(),
                model: format!("X{}", i),
                category: "driver".into(),
                existing_image_url: None,
            })
            .collect()
    }

    fn test_chain() -> SourceChain {
        SourceChain::new(
            vec![SourceStrategy::GenericImageSearch {
                name: "bing-images".into(),
                search_template: "https://www.bing.com/images/search?q={query}".into(),
            }],
            Normalizer::new(400, 1000),
        )
    }

    /// Serves a good candidate for every item except the ones listed,
    /// which error out at extraction time.
    struct FlakySource {
        broken_items: Vec<i64>,
    }

    #[async_trait]
    impl CandidateSource for FlakySource {
        async fn collect(
            &self,
            strategy: &SourceStrategy,
            target: &AcquisitionTarget,
        ) -> Result<Vec<ImageCandidate>, NavigationError> {
            if self.broken_items.contains(&target.item_id) {
                return Err(NavigationError::Network("renderer crashed".into()));
            }
            Ok(vec![ImageCandidate {
                bytes: png_bytes(900, 900),
                strategy: strategy.name().to_string(),
                source_url: "https://images.example/x.png".into(),
            }])
        }
    }

    struct RecordingSink {
        persisted: Mutex<Vec<i64>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new(fail: bool) -> Self {
            Self {
                persisted: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl ImageSink for RecordingSink {
        async fn persist(
            &self,
            target: &AcquisitionTarget,
            image: &ValidatedImage,
        ) -> Result<PersistedImageRecord> {
            if self.fail {
                anyhow::bail!("upload refused");
            }
            self.persisted.lock().unwrap().push(target.item_id);
            Ok(PersistedImageRecord {
                key: format!("acme/x{}-mock", target.item_id),
                public_url: format!("http://blob.local/acme/x{}-mock", target.item_id),
                item_id: target.item_id,
            })
        }
    }

    #[tokio::test]
    async fn one_broken_item_never_stops_the_others() {
        let source = FlakySource {
            broken_items: vec![3],
        };
        let sink = RecordingSink::new(false);
        let stats = execute(
            &test_chain(),
            &source,
            &sink,
            &targets(5),
            Duration::ZERO,
        )
        .await;

        assert_eq!(stats.processed, 5);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failures[0].item_id, 3);
        assert_eq!(*sink.persisted.lock().unwrap(), vec![1, 2, 4, 5]);
        assert!(stats.finished_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_items_touch_neither_storage_nor_catalog() {
        let source = FlakySource {
            broken_items: vec![1],
        };
        let sink = RecordingSink::new(false);
        let stats = execute(
            &test_chain(),
            &source,
            &sink,
            &targets(1),
            Duration::ZERO,
        )
        .await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
        assert!(sink.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistence_errors_are_item_failures_not_run_failures() {
        let source = FlakySource {
            broken_items: vec![],
        };
        let sink = RecordingSink::new(true);
        let stats = execute(
            &test_chain(),
            &source,
            &sink,
            &targets(2),
            Duration::ZERO,
        )
        .await;

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 2);
        assert!(stats.failures[0].reason.contains("persistence failed"));
    }
}
