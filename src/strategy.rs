use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::AcquisitionTarget;

/// One selector rule for precise extraction: which elements to look at and
/// which attribute carries the image URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub selector: String,
    #[serde(default = "default_attr")]
    pub attr: String,
}

fn default_attr() -> String {
    "src".to_string()
}

/// One configured acquisition method. The chain is data, not executor code:
/// adding or removing a source means editing the strategy file, nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceStrategy {
    /// Known direct image URLs keyed by lowercased "brand model".
    DirectUrl {
        name: String,
        table: HashMap<String, String>,
    },
    /// Retailer search page with site-specific extraction rules.
    RetailerSearch {
        name: String,
        search_template: String,
        rules: Vec<ExtractionRule>,
    },
    /// Generic image search, extracted by the largest-visible-image
    /// heuristic only. Weakest guarantee, so it goes last in the chain.
    GenericImageSearch {
        name: String,
        search_template: String,
    },
}

impl SourceStrategy {
    pub fn name(&self) -> &str {
        match self {
            SourceStrategy::DirectUrl { name, .. } => name,
            SourceStrategy::RetailerSearch { name, .. } => name,
            SourceStrategy::GenericImageSearch { name, .. } => name,
        }
    }

    /// Build the navigation URL for a target. `None` means this strategy
    /// has nothing to try for the item (e.g. no direct-table entry).
    pub fn navigation_url(&self, target: &AcquisitionTarget) -> Option<String> {
        match self {
            SourceStrategy::DirectUrl { table, .. } => table.get(&target.lookup_key()).cloned(),
            SourceStrategy::RetailerSearch {
                search_template, ..
            }
            | SourceStrategy::GenericImageSearch {
                search_template, ..
            } => Some(
                search_template.replace("{query}", &urlencoding::encode(&target.query())),
            ),
        }
    }
}

/// Built-in chain: direct table (empty by default), retailer search, then
/// generic image search as the last resort.
pub fn default_chain() -> Vec<SourceStrategy> {
    vec![
        SourceStrategy::DirectUrl {
            name: "direct-url".to_string(),
            table: HashMap::new(),
        },
        SourceStrategy::RetailerSearch {
            name: "2nd-swing".to_string(),
            search_template: "https://www.2ndswing.com/search/?query={query}".to_string(),
            rules: vec![
                ExtractionRule {
                    selector: ".product-image-photo".to_string(),
                    attr: "src".to_string(),
                },
                ExtractionRule {
                    selector: ".product-item-photo img".to_string(),
                    attr: "src".to_string(),
                },
            ],
        },
        SourceStrategy::GenericImageSearch {
            name: "bing-images".to_string(),
            search_template: "https://www.bing.com/images/search?q={query}".to_string(),
        },
    ]
}

/// Load the chain from a JSON file when configured, else the built-in one.
pub fn load_chain(path: Option<&str>) -> Result<Vec<SourceStrategy>> {
    match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read strategy file {}", p))?;
            parse_chain(&raw).with_context(|| format!("invalid strategy file {}", p))
        }
        None => Ok(default_chain()),
    }
}

pub fn parse_chain(raw: &str) -> Result<Vec<SourceStrategy>> {
    let chain: Vec<SourceStrategy> = serde_json::from_str(raw)?;
    anyhow::ensure!(!chain.is_empty(), "strategy chain is empty");
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AcquisitionTarget;

    fn target() -> AcquisitionTarget {
        AcquisitionTarget {
            item_id: 1,
            brand: "Acme".into(),
            model: "X1".into(),
            category: "driver".into(),
            existing_image_url: None,
        }
    }

    #[test]
    fn search_template_is_percent_encoded() {
        let strategy = SourceStrategy::GenericImageSearch {
            name: "bing-images".into(),
            search_template: "https://www.bing.com/images/search?q={query}".into(),
        };
        assert_eq!(
            strategy.navigation_url(&target()).unwrap(),
            "https://www.bing.com/images/search?q=Acme%20X1%20driver"
        );
    }

    #[test]
    fn direct_table_miss_yields_none() {
        let strategy = SourceStrategy::DirectUrl {
            name: "direct-url".into(),
            table: HashMap::new(),
        };
        assert!(strategy.navigation_url(&target()).is_none());
    }

    #[test]
    fn direct_table_hit_returns_configured_url() {
        let mut table = HashMap::new();
        table.insert("acme x1".to_string(), "https://cdn.acme.com/x1.jpg".to_string());
        let strategy = SourceStrategy::DirectUrl {
            name: "direct-url".into(),
            table,
        };
        assert_eq!(
            strategy.navigation_url(&target()).unwrap(),
            "https://cdn.acme.com/x1.jpg"
        );
    }

    #[test]
    fn chain_round_trips_through_json() {
        let json = r#"[
            {"kind": "direct_url", "name": "direct-url", "table": {"acme x1": "https://cdn.acme.com/x1.jpg"}},
            {"kind": "retailer_search", "name": "shop", "search_template": "https://shop.example/search?q={query}",
             "rules": [{"selector": ".product img"}]},
            {"kind": "generic_image_search", "name": "bing-images", "search_template": "https://www.bing.com/images/search?q={query}"}
        ]"#;
        let chain = parse_chain(json).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[1].name(), "shop");
        // defaulted attr
        match &chain[1] {
            SourceStrategy::RetailerSearch { rules, .. } => assert_eq!(rules[0].attr, "src"),
            _ => panic!("expected retailer search"),
        }
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(parse_chain("[]").is_err());
    }
}
