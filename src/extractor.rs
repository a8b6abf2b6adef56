use anyhow::Result;
use base64::Engine;
use headless_chrome::Tab;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::AcquisitionTarget;
use crate::strategy::{ExtractionRule, SourceStrategy};

/// Rendered areas below this (icons, logos, tracking pixels) are dropped.
const MIN_RENDERED_AREA: f64 = 10_000.0;

/// Sources matching any of these are never product shots.
static DENYLIST: &[&str] = &["logo", "icon", "placeholder", "sprite", "pixel", "badge"];

/// An image reference found on a rendered page, before download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    pub url: String,
    #[serde(default)]
    pub area: f64,
}

/// Find plausible product-image regions on a rendered page.
///
/// Two tiers: precise per-strategy selector rules first, then the generic
/// largest-visible-image heuristic. The heuristic carries a weaker
/// guarantee, so it stays a separate branch that is visible in logs.
pub fn extract(
    tab: &Tab,
    strategy: &SourceStrategy,
    target: &AcquisitionTarget,
) -> Result<Vec<PageImage>> {
    let found = match strategy {
        SourceStrategy::RetailerSearch { rules, .. } => {
            let precise = selector_tier(tab, rules)?;
            if !precise.is_empty() {
                debug!(item = %target.label(), count = precise.len(), "selector rules matched");
                precise
            } else {
                debug!(item = %target.label(), "no selector match, falling back to heuristic");
                let mut generic = heuristic_tier(tab)?;
                generic.extend(og_image(&tab.get_content().unwrap_or_default()));
                generic
            }
        }
        SourceStrategy::GenericImageSearch { .. } => {
            let mut tiles = bing_image_tiles(&tab.get_content().unwrap_or_default());
            if tiles.is_empty() {
                tiles = heuristic_tier(tab)?;
            }
            tiles
        }
        // Direct URLs never open a page; nothing to extract.
        SourceStrategy::DirectUrl { .. } => Vec::new(),
    };

    let base = tab.get_url();
    Ok(found
        .into_iter()
        .filter_map(|img| {
            resolve_url(&base, &decode_search_url(&img.url)).map(|url| PageImage { url, ..img })
        })
        .collect())
}

/// Tier 1: ordered selector rules. The first rule with any match wins;
/// matches keep document order. Area filtering happens on the Rust side.
fn selector_tier(tab: &Tab, rules: &[ExtractionRule]) -> Result<Vec<PageImage>> {
    let rules_json = serde_json::to_string(rules)?;
    let script = format!(
        r#"
        (() => {{
            const rules = {rules_json};
            for (const rule of rules) {{
                const found = [];
                document.querySelectorAll(rule.selector).forEach((el) => {{
                    const r = el.getBoundingClientRect();
                    const url = el.getAttribute(rule.attr) || el.currentSrc || el.src || '';
                    if (url) found.push({{ url: url, area: r.width * r.height }});
                }});
                if (found.length > 0) return JSON.stringify(found);
            }}
            return JSON.stringify([]);
        }})()
        "#
    );
    let images = evaluate_image_list(tab, &script)?;
    Ok(images
        .into_iter()
        .filter(|i| i.area >= MIN_RENDERED_AREA)
        .collect())
}

/// Tier 2: every image on the page, denylist-filtered and ranked by
/// displayed area. No markup convention survives across sources, so this
/// is the explicit last resort.
fn heuristic_tier(tab: &Tab) -> Result<Vec<PageImage>> {
    let script = r#"
        (() => {
            const found = [];
            document.querySelectorAll('img').forEach((el) => {
                const r = el.getBoundingClientRect();
                const url = el.currentSrc || el.src || el.getAttribute('data-src') || '';
                if (url) found.push({ url: url, area: r.width * r.height });
            });
            return JSON.stringify(found);
        })()
    "#;
    Ok(rank_candidates(evaluate_image_list(tab, script)?, MIN_RENDERED_AREA))
}

fn evaluate_image_list(tab: &Tab, script: &str) -> Result<Vec<PageImage>> {
    let result = tab
        .evaluate(script, false)
        .map_err(|e| anyhow::anyhow!("in-page extraction failed: {}", e))?;
    Ok(match result.value {
        Some(serde_json::Value::String(s)) => serde_json::from_str(&s).unwrap_or_default(),
        _ => Vec::new(),
    })
}

/// Denylist filter + descending-area ranking for heuristic candidates.
pub fn rank_candidates(images: Vec<PageImage>, min_area: f64) -> Vec<PageImage> {
    let mut kept: Vec<PageImage> = images
        .into_iter()
        .filter(|i| i.area >= min_area)
        .filter(|i| !i.url.starts_with("data:"))
        .filter(|i| i.url.len() >= 10)
        .filter(|i| !is_denylisted(&i.url))
        .collect();
    kept.sort_by(|a, b| b.area.partial_cmp(&a.area).unwrap_or(std::cmp::Ordering::Equal));
    kept
}

pub fn is_denylisted(url: &str) -> bool {
    let lower = url.to_lowercase();
    DENYLIST.iter().any(|d| lower.contains(d))
}

/// `og:image` metadata, appended as a final fallback candidate. Area is
/// unknown until download, so it ranks last.
pub fn og_image(html: &str) -> Option<PageImage> {
    let selector = Selector::parse("meta[property='og:image']").unwrap();
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .filter(|url| !is_denylisted(url))
        .map(|url| PageImage {
            url: url.to_string(),
            area: 0.0,
        })
}

/// Bing image tiles carry the full-resolution URL in a JSON blob on the
/// anchor (`a.iusc`, attribute `m`, field `murl`). Thumbnails in `img.mimg`
/// are too small to survive validation, so parse the blob instead.
pub fn bing_image_tiles(html: &str) -> Vec<PageImage> {
    let selector = Selector::parse("a.iusc").unwrap();
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("m"))
        .filter_map(|m| serde_json::from_str::<serde_json::Value>(m).ok())
        .filter_map(|v| v["murl"].as_str().map(|s| s.to_string()))
        .filter(|url| !is_denylisted(url))
        .map(|url| PageImage { url, area: 0.0 })
        .collect()
}

/// Resolve a possibly-relative image URL against the final page URL.
pub fn resolve_url(base: &str, candidate: &str) -> Option<String> {
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Some(candidate.to_string());
    }
    reqwest::Url::parse(base)
        .ok()?
        .join(candidate)
        .ok()
        .map(|u| u.to_string())
}

/// Decode Bing/Google redirect URLs to their actual destination.
pub fn decode_search_url(url: &str) -> String {
    // Bing: https://www.bing.com/ck/a?...&u=a1aHR0c...
    if url.contains("bing.com/ck/a") {
        if let Some(u_param) = url.split("&u=").nth(1) {
            let encoded = u_param.split('&').next().unwrap_or(u_param);
            let b64 = encoded.strip_prefix("a1").unwrap_or(encoded);
            let b64 = b64.trim_end_matches('=');
            for engine in [
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                &base64::engine::general_purpose::STANDARD_NO_PAD,
            ] {
                if let Ok(decoded) = engine.decode(b64) {
                    if let Ok(s) = String::from_utf8(decoded) {
                        return s;
                    }
                }
            }
        }
    }
    // Google: https://www.google.com/url?...&url=https...
    if url.contains("google.com/url") {
        if let Some(url_param) = url.split("&url=").nth(1).or_else(|| url.split("?url=").nth(1)) {
            let raw = url_param.split('&').next().unwrap_or(url_param);
            return urlencoding::decode(raw)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| raw.to_string());
        }
    }
    url.to_string()
}
