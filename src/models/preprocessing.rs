//! Preprocessing configuration rows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of `imports_preprocessing`, referenced by any number of order
/// event rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PreprocessingSpec {
    pub id: i64,
    /// Container image reference; bare references get a `docker.io/` prefix
    /// at command-build time.
    pub container: String,
    /// Input template; the literal `{Files}` token is substituted per file
    /// at dispatch time.
    pub input_file: String,
    /// Path inside the container mapped to shared storage.
    pub output_folder: String,
    /// Path inside the container mapped to fast-local staging.
    pub alt_output_folder: Option<String>,
    /// Free-form option map, translated to `--key value` pairs.
    pub extra_params: Option<sqlx::types::Json<serde_json::Map<String, serde_json::Value>>>,
}

impl PreprocessingSpec {
    /// Extra params as owned key/value strings, in map order. Non-string
    /// JSON values are rendered compactly.
    pub fn extra_params_vec(&self) -> Vec<(String, String)> {
        let Some(params) = &self.extra_params else {
            return Vec::new();
        };
        params
            .0
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Payload for inserting a preprocessing row alongside a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPreprocessing {
    pub container: String,
    pub input_file: String,
    pub output_folder: String,
    pub alt_output_folder: Option<String>,
    pub extra_params: Option<serde_json::Map<String, serde_json::Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_params_render_as_strings() {
        let mut map = serde_json::Map::new();
        map.insert("saveoption".into(), serde_json::Value::String("single".into()));
        map.insert("level".into(), serde_json::json!(3));

        let spec = PreprocessingSpec {
            id: 1,
            container: "conv:latest".into(),
            input_file: "{Files}".into(),
            output_folder: "/data".into(),
            alt_output_folder: Some("/out".into()),
            extra_params: Some(sqlx::types::Json(map)),
        };

        let params = spec.extra_params_vec();
        assert!(params.contains(&("saveoption".to_string(), "single".to_string())));
        assert!(params.contains(&("level".to_string(), "3".to_string())));
    }
}
