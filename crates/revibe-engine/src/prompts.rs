//! Prompt templates for the vision and image-edit calls.

use revibe_contracts::analysis::DesignAnalysis;

/// Instruction sent with the room photo to the vision model. Asks for a
/// fixed JSON schema so the reply can be parsed into a `DesignAnalysis`.
pub fn analysis_prompt(design_style: &str, custom_instructions: &str, design_type: &str) -> String {
    let custom = if custom_instructions.trim().is_empty() {
        "Create an appealing and functional design"
    } else {
        custom_instructions.trim()
    };
    format!(
        r#"As a professional design expert, analyze the provided image and create a detailed design transformation plan. Here are the requirements:

Design Style: {design_style}
Design Type: {design_type}
Custom Instructions: {custom}

IMPORTANT: I have uploaded an image of the current space. Carefully analyze it to understand the layout, existing furniture, colors, materials, lighting conditions and architectural features.

DESIGN PHILOSOPHY: Enhance the existing space through strategic additions rather than complete furniture replacement. Emphasize decorative elements, accessories, lighting and textiles that work with the existing pieces.

RECOMMENDATION PRIORITIES:
- HIGH: essential changes for immediate impact (lighting, key decor pieces, color accents)
- MEDIUM: important enhancements (textiles, additional accessories)
- LOW: finishing touches (artwork, plants, small decorative objects)

Suggest VERY SPECIFIC shoppable products. For each recommendation include exact specifications (sizes, materials, colors, patterns), specific style descriptors, quantity and placement. Examples:
- "2-3 square throw pillows, 18x18 inches, terracotta linen texture and teal velvet with tassel trim"
- "Rattan floor lamp, 60-65 inches tall, natural woven shade, black metal base, bohemian style"
- "Jute area rug, 5x8 feet, natural fiber with geometric border pattern in rust/teal"

Only suggest furniture replacement as a last resort.

Format the response as JSON with this exact structure:
{{
    "designConcept": {{
        "style": "string",
        "colorPalette": ["array", "of", "colors"],
        "materials": ["array", "of", "materials"],
        "overallAssessment": "detailed assessment of current state",
        "transformationConcept": "comprehensive design transformation concept"
    }},
    "recommendations": [
        {{
            "area": "specific area (e.g. 'Seating Area', 'Lighting', 'Wall Decor')",
            "type": "product type (e.g. 'throw pillows', 'floor lamp', 'wall art')",
            "description": "detailed product description with exact specifications",
            "priority": "High/Medium/Low",
            "estimatedCost": "cost range",
            "placement": "specific placement instructions"
        }}
    ],
    "colorPalette": {{
        "primary": ["main colors"],
        "accent": ["accent colors"],
        "neutral": ["neutral colors"]
    }},
    "materials": ["list", "of", "materials"],
    "roomAnalysis": {{
        "roomType": "string",
        "mood": "string",
        "styleDetails": ["array", "of", "style", "notes"]
    }},
    "lighting": "lighting recommendations",
    "styling": "styling and decor recommendations"
}}"#
    )
}

/// Fixed instruction for the composite overlay edit: products on the right
/// half get placed into the room on the left half, nothing else changes.
pub fn overlay_prompt() -> &'static str {
    "Overlay the product images from the right side into the room on the left side.\n\n\
     Rules:\n\
     - Keep the original room (left part of image) EXACTLY as is.\n\
     - Don't change dimensions, furniture, or camera position.\n\
     - Place products exactly as they appear in the product images.\n\
     - Do NOT alter products: do not change colors, shapes, or textures of products or the original room.\n\
     - Choose a few products - as many as you think look good together.\n\
     - Place them in logical locations within the room."
}

/// Transformation instruction for the standard (AI-imagined) pathway,
/// assembled from the analysis with priority ordering and a cap of eight
/// recommendations.
pub fn standard_prompt(analysis: &DesignAnalysis, design_style: &str) -> String {
    let colors = if analysis.primary_colors().is_empty() {
        "appropriate".to_string()
    } else {
        analysis.primary_colors().join(", ")
    };
    let materials = if analysis.materials.is_empty() {
        "quality".to_string()
    } else {
        analysis.materials.join(", ")
    };

    let mut ranked: Vec<_> = analysis.recommendations.iter().collect();
    ranked.sort_by_key(|rec| rec.priority.rank());
    let mut lines = Vec::new();
    for rec in ranked.into_iter().take(8) {
        let marker = match rec.priority.rank() {
            0 => "[HIGH PRIORITY]",
            1 => "[MEDIUM]",
            _ => "[LOW]",
        };
        lines.push(format!("- {marker} {}", rec.description));
    }

    format!(
        "Transform this interior design to {design_style} style with comprehensive improvements.\n\n\
         STYLE REQUIREMENTS:\n\
         - Use a {colors} color palette\n\
         - Incorporate {materials} materials\n\
         - Maintain professional interior design quality\n\
         - Keep the same room layout and camera perspective\n\n\
         TRANSFORMATION REQUIREMENTS:\n\
         {}\n\
         - Implement the recommendations above with visible changes\n\
         - Allow furniture repositioning, replacement, and restyling as needed\n\
         - Create a cohesive {design_style} aesthetic",
        lines.join("\n")
    )
}
