use std::env;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment
/// (`.env` is loaded by main before this runs).
#[derive(Debug, Clone)]
pub struct Config {
    /// Max catalog items per run.
    pub limit: i64,
    /// Bound for every navigation/extraction step.
    pub nav_timeout: Duration,
    /// Candidates below this edge length (either axis) are rejected.
    pub min_image_size: u32,
    /// Normalized images fit within this square.
    pub target_size: u32,
    /// Politeness delay between items, applied regardless of outcome.
    pub delay_between_items: Duration,
    /// Toggle for local debugging against a visible browser.
    pub headless: bool,
    /// Optional JSON file overriding the built-in strategy chain.
    pub strategy_file: Option<String>,
    /// When set, dump rendered HTML of zero-candidate pages here.
    pub debug_dir: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            limit: env_parse("CRAWL_LIMIT", 25),
            nav_timeout: Duration::from_millis(env_parse("NAV_TIMEOUT_MS", 20_000)),
            min_image_size: env_parse("MIN_IMAGE_SIZE", 400),
            target_size: env_parse("TARGET_SIZE", 1000),
            delay_between_items: Duration::from_millis(env_parse("DELAY_BETWEEN_ITEMS_MS", 2_500)),
            headless: env_parse("HEADLESS", true),
            strategy_file: env::var("STRATEGY_FILE").ok(),
            debug_dir: env::var("DEBUG_DIR").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_on_garbage() {
        env::set_var("CATALOG_IMAGER_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_parse("CATALOG_IMAGER_TEST_GARBAGE", 42u32), 42);
        env::remove_var("CATALOG_IMAGER_TEST_GARBAGE");
    }
}
