use std::ffi::OsStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::catalog::AcquisitionTarget;
use crate::chain::{CandidateSource, ImageCandidate};
use crate::config::Config;
use crate::error::NavigationError;
use crate::extractor::{self, PageImage};
use crate::strategy::SourceStrategy;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Edge/123.0.0.0 Safari/537.36",
    ]
});

pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36")
}

/// Runs before any page script: removes the automation fingerprints that
/// trigger bot walls on retailer sites.
const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'hardwareConcurrency', { get: () => 4 });
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
    ['RTCPeerConnection', 'webkitRTCPeerConnection', 'mozRTCPeerConnection', 'msRTCPeerConnection'].forEach(className => {
         if (window[className]) window[className] = undefined;
    });
"#;

const CHALLENGE_PATTERNS: &[&str] = &[
    "prove you're not a robot",
    "unusual traffic",
    "automated requests",
    "hcaptcha",
    "recaptcha",
    "turnstile",
    "security check",
    "one last step",
];

/// Pages smaller than this are interstitials or error shells, not content.
const MIN_CONTENT_BYTES: usize = 500;

/// Post-load settle for lazy-loaded media.
const SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Per-strategy cap on candidate downloads.
const MAX_CANDIDATES_PER_STRATEGY: usize = 5;

/// Single oversized-response guard for candidate downloads.
const MAX_DOWNLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn is_challenge(html: &str) -> bool {
    let lower = html.to_lowercase();
    CHALLENGE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Owns one headless browser for the whole run. Tabs are scoped per
/// navigation via `with_page`; the browser process itself is killed when
/// this value drops, on every exit path.
pub struct BrowserSession {
    browser: Browser,
    http: reqwest::Client,
    nav_timeout: Duration,
    debug_dir: Option<String>,
}

impl BrowserSession {
    pub fn launch(config: &Config) -> Result<Self> {
        let user_agent = random_user_agent();
        info!(user_agent, headless = config.headless, "launching browser");

        let ua_arg = format!("--user-agent={}", user_agent);
        let args = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--window-position=0,0"),
            OsStr::new("--ignore-certificate-errors"),
            OsStr::new("--ignore-certificate-errors-spki-list"),
            OsStr::new(&ua_arg),
        ];

        let browser = Browser::new(LaunchOptions {
            headless: config.headless,
            window_size: Some((1920, 1080)),
            args,
            ..Default::default()
        })?;

        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(config.nav_timeout)
            .build()?;

        Ok(Self {
            browser,
            http,
            nav_timeout: config.nav_timeout,
            debug_dir: config.debug_dir.clone(),
        })
    }

    /// Scoped page acquisition: opens a tab, applies stealth, runs `f`, and
    /// closes the tab on every exit path.
    pub fn with_page<T>(
        &self,
        f: impl FnOnce(&Tab) -> Result<T, NavigationError>,
    ) -> Result<T, NavigationError> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| NavigationError::Network(format!("failed to open tab: {}", e)))?;
        let result = self.apply_stealth(&tab).and_then(|_| f(&tab));
        // cleanup must not shadow the work result
        if let Err(e) = tab.close(true) {
            warn!("tab close error (non-fatal): {}", e);
        }
        result
    }

    fn apply_stealth(&self, tab: &Tab) -> Result<(), NavigationError> {
        tab.enable_debugger()
            .map_err(|e| NavigationError::Network(e.to_string()))?;
        tab.call_method(
            headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
                source: STEALTH_SCRIPT.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            },
        )
        .map_err(|e| NavigationError::Network(e.to_string()))?;
        Ok(())
    }

    /// Timeout-bounded navigation. Timeouts, network errors, undersized
    /// responses and challenge interstitials all surface as typed errors.
    pub fn navigate(&self, tab: &Tab, url: &str) -> Result<(), NavigationError> {
        tab.set_default_timeout(self.nav_timeout);
        tab.navigate_to(url)
            .map_err(|e| NavigationError::Network(e.to_string()))?;
        tab.wait_until_navigated().map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("timed out") {
                NavigationError::Timeout(self.nav_timeout.as_millis() as u64)
            } else {
                NavigationError::Network(msg)
            }
        })?;

        // nudge lazy-loaded media, then let the page settle
        let _ = tab.evaluate("window.scrollTo(0, document.body.scrollHeight);", false);
        std::thread::sleep(SETTLE_DELAY);

        let html = tab
            .get_content()
            .map_err(|e| NavigationError::Network(e.to_string()))?;
        if html.len() < MIN_CONTENT_BYTES {
            return Err(NavigationError::NonContent(format!(
                "page too small ({} bytes)",
                html.len()
            )));
        }
        if is_challenge(&html) {
            return Err(NavigationError::ChallengeDetected);
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, String> {
        let resp = self
            .http
            .get(url)
            .header("Accept", "image/avif,image/webp,image/*,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        if let Some(ct) = resp.headers().get(reqwest::header::CONTENT_TYPE) {
            let ct = ct.to_str().unwrap_or_default();
            if ct.starts_with("text/") {
                return Err(format!("non-image content type {}", ct));
            }
        }
        let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
        if bytes.len() > MAX_DOWNLOAD_BYTES {
            return Err(format!("response too large ({} bytes)", bytes.len()));
        }
        Ok(bytes.to_vec())
    }

    fn dump_debug(&self, strategy: &SourceStrategy, target: &AcquisitionTarget, tab: &Tab) {
        if let Some(dir) = &self.debug_dir {
            let _ = std::fs::create_dir_all(dir);
            let path = format!("{}/no_candidates_{}_{}.html", dir, strategy.name(), target.item_id);
            let _ = std::fs::write(&path, tab.get_content().unwrap_or_default());
        }
    }
}

#[async_trait]
impl CandidateSource for BrowserSession {
    async fn collect(
        &self,
        strategy: &SourceStrategy,
        target: &AcquisitionTarget,
    ) -> Result<Vec<ImageCandidate>, NavigationError> {
        let Some(url) = strategy.navigation_url(target) else {
            // no entry for this item, e.g. a direct-URL table miss
            return Ok(Vec::new());
        };

        let page_images: Vec<PageImage> = match strategy {
            // a known direct URL needs no navigation, the URL is the candidate
            SourceStrategy::DirectUrl { .. } => vec![PageImage {
                url: url.clone(),
                area: 0.0,
            }],
            _ => {
                info!(strategy = strategy.name(), url = %url, "navigating");
                self.with_page(|tab| {
                    self.navigate(tab, &url)?;
                    let found = extractor::extract(tab, strategy, target).map_err(|e| {
                        NavigationError::NonContent(format!("extraction failed: {}", e))
                    })?;
                    if found.is_empty() {
                        self.dump_debug(strategy, target, tab);
                    }
                    Ok(found)
                })?
            }
        };

        let mut candidates = Vec::new();
        for img in page_images.into_iter().take(MAX_CANDIDATES_PER_STRATEGY) {
            match self.download(&img.url).await {
                Ok(bytes) => candidates.push(ImageCandidate {
                    bytes,
                    strategy: strategy.name().to_string(),
                    source_url: img.url,
                }),
                Err(e) => warn!(url = %img.url, "candidate download failed: {}", e),
            }
        }
        Ok(candidates)
    }
}
