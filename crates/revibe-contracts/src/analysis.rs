use serde::de::Deserializer;
use serde::{Deserialize, Serialize};

use crate::error::RevibeError;

/// Recommendation urgency. Used for ordering and truncation only; an
/// unrecognized value falls back to `Medium` rather than failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    /// Sort key: high first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Priority::parse(&raw))
    }
}

/// One shoppable recommendation from the vision analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(default)]
    pub area: String,
    #[serde(rename = "type", default)]
    pub product_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_cost: Option<String>,
    #[serde(default)]
    pub placement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ColorPalette {
    #[serde(default)]
    pub primary: Vec<String>,
    #[serde(default)]
    pub accent: Vec<String>,
    #[serde(default)]
    pub neutral: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoomAnalysis {
    #[serde(default)]
    pub room_type: String,
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub style_details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesignConcept {
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub color_palette: Vec<String>,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub overall_assessment: String,
    #[serde(default)]
    pub transformation_concept: String,
}

/// Parsed output of one vision-analysis call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DesignAnalysis {
    #[serde(default)]
    pub design_concept: DesignConcept,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    #[serde(default)]
    pub color_palette: ColorPalette,
    #[serde(default)]
    pub materials: Vec<String>,
    #[serde(default)]
    pub lighting: Option<String>,
    #[serde(default)]
    pub styling: Option<String>,
    #[serde(default)]
    pub room_analysis: Option<RoomAnalysis>,
}

impl DesignAnalysis {
    /// Recover the analysis from free-form model text. Three strategies in
    /// order: fenced ```json block, whole body if it starts with `{`, then
    /// the substring between the first `{` and the last `}`.
    pub fn from_response_text(content: &str) -> Result<Self, RevibeError> {
        let payload = extract_json_payload(content)
            .ok_or_else(|| RevibeError::AnalysisParse("no JSON object in response".to_string()))?;
        serde_json::from_str(payload).map_err(|err| RevibeError::AnalysisParse(err.to_string()))
    }

    pub fn style(&self) -> &str {
        let style = self.design_concept.style.trim();
        if style.is_empty() {
            "modern"
        } else {
            style
        }
    }

    pub fn primary_colors(&self) -> &[String] {
        &self.color_palette.primary
    }

    /// Synthetic stand-in used by the standard pathway when the model reply
    /// cannot be parsed. The real-products pathway never substitutes one.
    pub fn placeholder(design_style: &str) -> Self {
        let style = if design_style.trim().is_empty() {
            "modern"
        } else {
            design_style.trim()
        };
        let recommendation = |area: &str, product_type: &str, description: &str, priority| {
            Recommendation {
                area: area.to_string(),
                product_type: product_type.to_string(),
                description: description.to_string(),
                priority,
                estimated_cost: None,
                placement: None,
            }
        };
        DesignAnalysis {
            design_concept: DesignConcept {
                style: style.to_string(),
                color_palette: vec!["warm neutrals".to_string()],
                materials: vec!["wood".to_string(), "textile".to_string()],
                overall_assessment: "Analysis unavailable; using a generic styling plan."
                    .to_string(),
                transformation_concept: format!("Refresh the space with {style} accents."),
            },
            recommendations: vec![
                recommendation(
                    "Seating Area",
                    "throw pillows",
                    &format!("{style} accent pillows in coordinating tones"),
                    Priority::High,
                ),
                recommendation(
                    "Lighting",
                    "floor lamp",
                    &format!("{style} floor lamp with a soft shade"),
                    Priority::Medium,
                ),
                recommendation(
                    "Wall Decor",
                    "wall art",
                    &format!("{style} wall art sized to the main wall"),
                    Priority::Low,
                ),
            ],
            color_palette: ColorPalette {
                primary: vec!["warm neutrals".to_string()],
                accent: Vec::new(),
                neutral: vec!["white".to_string()],
            },
            materials: vec!["wood".to_string(), "textile".to_string()],
            lighting: None,
            styling: None,
            room_analysis: None,
        }
    }
}

fn extract_json_payload(content: &str) -> Option<&str> {
    if let Some(fence) = content.find("```json") {
        let start = fence + "```json".len();
        let rest = &content[start..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim());
        }
    }
    let trimmed = content.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&content[start..=end])
}

#[cfg(test)]
mod tests {
    use super::{extract_json_payload, DesignAnalysis, Priority};
    use crate::error::RevibeError;

    const SAMPLE: &str = r#"{
        "designConcept": {"style": "bohemian", "colorPalette": ["terracotta"], "materials": ["rattan"]},
        "recommendations": [
            {"area": "Seating Area", "type": "throw pillows", "description": "18x18 terracotta linen", "priority": "High", "estimatedCost": "$40-60"},
            {"area": "Lighting", "type": "floor lamp", "description": "rattan shade", "priority": "low"}
        ],
        "colorPalette": {"primary": ["terracotta", "teal"], "accent": ["brass"], "neutral": ["cream"]},
        "materials": ["rattan", "linen"],
        "roomAnalysis": {"roomType": "living room", "mood": "cozy", "styleDetails": ["layered textiles"]}
    }"#;

    #[test]
    fn parses_fenced_json_block_ignoring_prose() -> anyhow::Result<()> {
        let content = format!("Here is the plan you asked for:\n```json\n{SAMPLE}\n```\nLet me know!");
        let analysis = DesignAnalysis::from_response_text(&content)?;
        assert_eq!(analysis.style(), "bohemian");
        assert_eq!(analysis.recommendations.len(), 2);
        assert_eq!(analysis.recommendations[0].product_type, "throw pillows");
        assert_eq!(analysis.recommendations[0].priority, Priority::High);
        assert_eq!(analysis.recommendations[1].priority, Priority::Low);
        assert_eq!(analysis.primary_colors(), ["terracotta", "teal"]);
        Ok(())
    }

    #[test]
    fn parses_bare_object() -> anyhow::Result<()> {
        let analysis = DesignAnalysis::from_response_text(SAMPLE)?;
        assert_eq!(
            analysis.room_analysis.as_ref().map(|room| room.mood.as_str()),
            Some("cozy")
        );
        Ok(())
    }

    #[test]
    fn parses_object_embedded_in_prose() -> anyhow::Result<()> {
        let content = format!("The plan: {SAMPLE} -- hope that helps.");
        let analysis = DesignAnalysis::from_response_text(&content)?;
        assert_eq!(analysis.materials, ["rattan", "linen"]);
        Ok(())
    }

    #[test]
    fn rejects_text_without_json() {
        let err = DesignAnalysis::from_response_text("I could not analyze this image.")
            .expect_err("should not parse");
        assert!(matches!(err, RevibeError::AnalysisParse(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = DesignAnalysis::from_response_text("{\"recommendations\": [")
            .expect_err("should not parse");
        assert!(matches!(err, RevibeError::AnalysisParse(_)));
    }

    #[test]
    fn fence_extraction_prefers_fenced_block() {
        let content = "```json\n{\"a\": 1}\n```\ntrailing {\"b\": 2}";
        assert_eq!(extract_json_payload(content), Some("{\"a\": 1}"));
    }

    #[test]
    fn unknown_priority_defaults_to_medium() {
        assert_eq!(Priority::parse("Essential"), Priority::Medium);
        assert_eq!(Priority::parse(" HIGH "), Priority::High);
    }

    #[test]
    fn placeholder_carries_requested_style() {
        let analysis = DesignAnalysis::placeholder("scandinavian");
        assert_eq!(analysis.style(), "scandinavian");
        assert!(!analysis.recommendations.is_empty());
        assert!(analysis.recommendations[0]
            .description
            .contains("scandinavian"));
    }

    #[test]
    fn missing_fields_default() -> anyhow::Result<()> {
        let analysis = DesignAnalysis::from_response_text("{\"recommendations\": []}")?;
        assert_eq!(analysis.style(), "modern");
        assert!(analysis.room_analysis.is_none());
        Ok(())
    }
}
