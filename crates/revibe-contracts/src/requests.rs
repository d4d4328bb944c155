use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::analysis::DesignAnalysis;
use crate::products::ProductResult;

/// Caller input for one design-generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRequest {
    pub image_path: PathBuf,
    #[serde(default = "default_style")]
    pub design_style: String,
    #[serde(default)]
    pub custom_instructions: String,
    #[serde(default = "default_design_type")]
    pub design_type: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl DesignRequest {
    pub fn new(image_path: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image_path.into(),
            design_style: default_style(),
            custom_instructions: String::new(),
            design_type: default_design_type(),
            session_id: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_style() -> String {
    "modern".to_string()
}

fn default_design_type() -> String {
    "interior redesign".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Result of a completed pipeline run. A run that found nothing never
/// produces one of these; it fails instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignOutcome {
    pub session_id: String,
    pub session_path: PathBuf,
    pub original_image: PathBuf,
    pub final_design: PathBuf,
    pub products: Vec<ProductResult>,
    pub products_used: usize,
    pub design_style: String,
    pub analysis: DesignAnalysis,
}

/// The `success/message/data/error` envelope the REST facade and CLI share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiEnvelope {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}
