use thiserror::Error;

/// Policy-relevant failures of the design pipeline.
///
/// Most engine code propagates `anyhow::Error`; these variants exist so
/// callers can match on the failures that have distinct handling policies
/// (placeholder substitution, empty-result escalation, missing credentials).
#[derive(Error, Debug)]
pub enum RevibeError {
    /// The vision model replied, but no JSON object could be recovered
    /// from its text.
    #[error("analysis response could not be parsed as JSON: {0}")]
    AnalysisParse(String),

    /// The analysis parsed but carried no usable product recommendations.
    #[error("analysis returned no product recommendations")]
    NoRecommendations,

    /// The product search fan-out finished with an empty accumulated list.
    #[error("no products with images found for design composition")]
    NoProductsFound,

    /// A required credential was absent from the environment.
    #[error("{0} is not set")]
    MissingApiKey(&'static str),
}
