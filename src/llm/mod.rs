//! Semantic market matcher.
//!
//! An external LLM clusters markets that describe the same underlying
//! event at different expiries, and verifies cross-venue equivalence. The
//! wire contract is strict JSON, but responses are recovered defensively:
//! direct parse, then fence-stripped, then the first `{…}` span. Anything
//! unparseable yields zero clusters — a bad model response must never
//! fail a scan.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),
}

pub type MatcherResult<T> = std::result::Result<T, MatcherError>;

/// One (early, late) market pair proposed by the matcher, 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPair {
    pub early_index: usize,
    pub late_index: usize,
    pub reasoning: String,
}

/// Wire shape of a clustering response. Indices are 1-based on the wire.
#[derive(Debug, Deserialize)]
struct ClustersResponse {
    #[serde(default)]
    clusters: Vec<RawCluster>,
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    #[serde(default)]
    early_market_index: Option<i64>,
    #[serde(default)]
    late_market_index: Option<i64>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

pub struct SemanticMatcher {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl SemanticMatcher {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        info!("🤖 Semantic matcher initialized | model: {}", model);
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn build_clustering_prompt(markets: &[(String, Option<String>)]) -> String {
        let lines: Vec<String> = markets
            .iter()
            .enumerate()
            .map(|(idx, (question, expiry))| {
                format!(
                    "{}. \"{}\" (expires: {})",
                    idx + 1,
                    question,
                    expiry.as_deref().unwrap_or("Unknown")
                )
            })
            .collect();

        format!(
            "You are an expert in prediction market arbitrage.\n\
             Identify pairs of markets that describe the SAME underlying event but with DIFFERENT expiries.\n\
             The early expiry must be a logical SUBSET of the late expiry.\n\n\
             Markets:\n{}\n\n\
             Return ONLY valid JSON in this exact format:\n\
             {{\n  \"clusters\": [\n    {{\n      \"event_description\": \"short description\",\n      \
             \"early_market_index\": 1,\n      \"late_market_index\": 3,\n      \"reasoning\": \"why\"\n    }}\n  ]\n}}",
            lines.join("\n")
        )
    }

    async fn generate(&self, prompt: &str) -> MatcherResult<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );

        let request = GenerateRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 1024,
                response_mime_type: "application/json".to_string(),
            },
        };

        // The key rides as a query param; log lines must never include it.
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MatcherError::ApiError(format!(
                "HTTP {} @ {}?key=***: {}",
                status, url, text
            )));
        }

        let body: Value = response.json().await?;
        Ok(extract_text(&body))
    }

    /// Submits numbered markets and returns proposed (early, late) pairs.
    /// Any failure — HTTP, empty text, unparseable JSON — yields an empty
    /// list, logged but never propagated.
    pub async fn cluster_markets(
        &self,
        markets: &[(String, Option<String>)],
        max_clusters: usize,
    ) -> Vec<ClusterPair> {
        if markets.is_empty() {
            return Vec::new();
        }

        let prompt = Self::build_clustering_prompt(markets);

        let text = match self.generate(&prompt).await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                error!("❌ Matcher returned empty text");
                return Vec::new();
            }
            Err(e) => {
                error!("❌ Matcher error: {}", e);
                return Vec::new();
            }
        };

        let Some(parsed) = try_parse_json(&text) else {
            let sample: String = text.chars().take(500).collect();
            error!("❌ Matcher JSON parse failed. Raw text: {}", sample);
            return Vec::new();
        };

        let response: ClustersResponse = match serde_json::from_value(parsed) {
            Ok(r) => r,
            Err(e) => {
                error!("❌ Matcher schema mismatch: {}", e);
                return Vec::new();
            }
        };

        let pairs: Vec<ClusterPair> = response
            .clusters
            .into_iter()
            .take(max_clusters)
            .filter_map(|c| {
                // 1-based on the wire; anything non-positive or out of
                // range is discarded.
                let early = c.early_market_index?;
                let late = c.late_market_index?;
                if early < 1 || late < 1 {
                    return None;
                }
                let (early, late) = ((early - 1) as usize, (late - 1) as usize);
                if early >= markets.len() || late >= markets.len() || early == late {
                    return None;
                }
                Some(ClusterPair {
                    early_index: early,
                    late_index: late,
                    reasoning: c.reasoning.unwrap_or_default(),
                })
            })
            .collect();

        info!("🤖 Matcher found {} potential arbitrage pairs", pairs.len());
        pairs
    }

    /// Asks whether two questions describe the same real-world event.
    /// Used for cross-venue matching after the keyword prefilter.
    pub async fn verify_equivalence(&self, question_a: &str, question_b: &str) -> bool {
        let prompt = format!(
            "Do these two prediction markets describe the SAME real-world event \
             with the SAME resolution criteria?\n\
             A: \"{}\"\nB: \"{}\"\n\n\
             Return ONLY valid JSON: {{\"equivalent\": true}} or {{\"equivalent\": false}}",
            question_a, question_b
        );

        let text = match self.generate(&prompt).await {
            Ok(text) => text,
            Err(e) => {
                debug!("Equivalence check failed: {}", e);
                return false;
            }
        };

        try_parse_json(&text)
            .and_then(|v| v.get("equivalent").and_then(Value::as_bool))
            .unwrap_or(false)
    }
}

/// Pulls candidates[0].content.parts[0].text out of a generateContent
/// response, tolerating any missing level.
fn extract_text(body: &Value) -> String {
    body.get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .and_then(|p| p.first())
        .and_then(|p| p.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed;
    }
    let Some(after_open) = trimmed.split_once("```").map(|(_, rest)| rest) else {
        return trimmed;
    };
    let inner = after_open
        .split_once("```")
        .map(|(block, _)| block)
        .unwrap_or(after_open)
        .trim();
    inner.strip_prefix("json").map(str::trim).unwrap_or(inner)
}

/// Recovery ladder: direct parse → fence-stripped → first `{…}` span.
fn try_parse_json(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(text) {
        return Some(value);
    }

    let stripped = strip_markdown_fences(text);
    if stripped != text {
        if let Ok(value) = serde_json::from_str(stripped) {
            return Some(value);
        }
    }

    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end > start {
        serde_json::from_str(&stripped[start..=end]).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_json() {
        let parsed = try_parse_json(r#"{"clusters":[]}"#).unwrap();
        assert!(parsed.get("clusters").is_some());
    }

    #[test]
    fn parses_fenced_json() {
        let text = "Here you go:\n```json\n{\"clusters\": []}\n```\nHope that helps!";
        let parsed = try_parse_json(text).unwrap();
        assert!(parsed.get("clusters").is_some());
    }

    #[test]
    fn parses_embedded_span() {
        let text = "The answer is {\"equivalent\": true} as requested.";
        let parsed = try_parse_json(text).unwrap();
        assert_eq!(parsed.get("equivalent"), Some(&Value::Bool(true)));
    }

    #[test]
    fn garbage_yields_none() {
        assert!(try_parse_json("no json here at all").is_none());
        assert!(try_parse_json("{broken").is_none());
    }

    #[test]
    fn extracts_candidate_text() {
        let body: Value = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"  hello  "}]}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(&body), "hello");
        assert_eq!(extract_text(&Value::Null), "");
    }

    #[test]
    fn one_based_indices_convert_and_validate() {
        let raw = r#"{"clusters":[
            {"early_market_index":1,"late_market_index":3,"reasoning":"subset"},
            {"early_market_index":0,"late_market_index":2,"reasoning":"bad zero"},
            {"early_market_index":2,"late_market_index":9,"reasoning":"out of range"},
            {"early_market_index":2,"late_market_index":2,"reasoning":"self pair"}
        ]}"#;
        let parsed = try_parse_json(raw).unwrap();
        let response: ClustersResponse = serde_json::from_value(parsed).unwrap();

        let markets_len = 3;
        let pairs: Vec<_> = response
            .clusters
            .into_iter()
            .filter_map(|c| {
                let early = c.early_market_index?;
                let late = c.late_market_index?;
                if early < 1 || late < 1 {
                    return None;
                }
                let (early, late) = ((early - 1) as usize, (late - 1) as usize);
                (early < markets_len && late < markets_len && early != late)
                    .then_some((early, late))
            })
            .collect();

        assert_eq!(pairs, vec![(0, 2)]);
    }
}
