use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One shoppable product returned by the search fan-out.
///
/// `image_path` is filled in once the thumbnail has been downloaded; a
/// product only reaches the composite builder after that happens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProductResult {
    pub name: String,
    pub url: String,
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub reviews: Option<u64>,
    pub retailer: String,
    pub thumbnail: Option<String>,
    pub image_path: Option<PathBuf>,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub area: String,
}

/// Pixel rectangle a product thumbnail occupies in the composite grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub index: usize,
    pub name: String,
    pub product_type: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// A finished composite plus the placement table used to build it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeLayout {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub placements: Vec<Placement>,
}

/// Parse a shopping-result price string (`"$1,299.00"`) into a number.
/// Anything unparseable becomes `None`, never an error.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(['$', ','], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Filesystem-safe stem derived from a product name: alphanumerics plus
/// space/dash/underscore, spaces collapsed to underscores, capped at 30.
pub fn safe_file_stem(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, ' ' | '-' | '_'))
        .collect();
    kept.trim().replace(' ', "_").chars().take(30).collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_price, safe_file_stem, ProductResult};

    #[test]
    fn price_parsing_strips_currency_formatting() {
        assert_eq!(parse_price("$1,299.00"), Some(1299.0));
        assert_eq!(parse_price("49.95"), Some(49.95));
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("Call for price"), None);
    }

    #[test]
    fn file_stem_drops_unsafe_characters() {
        assert_eq!(
            safe_file_stem("Macramé Wall Hanging / 24\"x36\""),
            "Macramé_Wall_Hanging__24x36"
        );
        assert!(safe_file_stem(&"x".repeat(80)).len() <= 30);
    }

    #[test]
    fn product_round_trips_through_json() -> anyhow::Result<()> {
        let product = ProductResult {
            name: "Rattan Floor Lamp".to_string(),
            url: "https://example.com/p/1".to_string(),
            price: Some(89.0),
            rating: Some(4.6),
            reviews: Some(212),
            retailer: "Example Home".to_string(),
            thumbnail: Some("https://example.com/t/1.jpg".to_string()),
            image_path: None,
            product_type: "floor lamp".to_string(),
            area: "Lighting".to_string(),
        };
        let raw = serde_json::to_string(&product)?;
        let parsed: ProductResult = serde_json::from_str(&raw)?;
        assert_eq!(parsed, product);
        Ok(())
    }
}
