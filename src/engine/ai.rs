//! # engine::ai
//!
//! [`JudgmentService`] backed by Claude or OpenAI, selected by `AI_PROVIDER`.
//! The model is asked for a bare JSON verdict
//! `{"approved": bool, "confidence": 0-1, "reason": "..."}`.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{AiProvider, DecisionConfig};
use crate::engine::decision::{JudgmentRequest, JudgmentService, Verdict};
use crate::error::DecisionError;
use crate::models::Trend;

// ─── Prompt ───────────────────────────────────────────────────────────────────

pub fn build_prompt(req: &JudgmentRequest) -> String {
    let side = req.side.map(|s| s.as_str()).unwrap_or("UNSPECIFIED");
    let trend = match req.context.trend {
        Trend::Bullish => "bullish",
        Trend::Bearish => "bearish",
        Trend::Neutral => "neutral",
    };

    format!(r#"You are the risk gate of a copy-trading service. A signal is about to be
executed on many subscriber accounts. Approve it only if the market context
supports it.

## Signal
- Symbol: {symbol}
- Action text: {action}
- Side: {side}
- Strength: {strength:?}
- Reference price: {price:.4}
- Routed to review because: {reason}

## Market context (refreshed {refreshed})
- Sentiment index (0 = extreme fear, 100 = extreme greed): {sentiment:.1}
- Broad-market trend: {trend}
- Dominant-asset share of total market cap: {dominance:.2}%

Respond with JSON only, no markdown:
{{"approved": true|false, "confidence": 0.0-1.0, "reason": "<one sentence>"}}"#,
        symbol    = req.symbol,
        action    = req.action,
        strength  = req.strength,
        price     = req.reference_price,
        reason    = req.reason_code,
        refreshed = req.context.refreshed_at.to_rfc3339(),
        sentiment = req.context.sentiment_index,
        dominance = req.context.dominant_share_pct,
    )
}

fn strip_markdown(text: &str) -> &str {
    let text = text.trim();
    if let Some(inner) = text.strip_prefix("```json") {
        inner.trim_end_matches("```").trim()
    } else if let Some(inner) = text.strip_prefix("```") {
        inner.trim_end_matches("```").trim()
    } else {
        text
    }
}

/// Parse the model's reply. Percent-style confidence (e.g. `80`) is scaled.
pub fn parse_verdict(text: &str) -> Result<Verdict, DecisionError> {
    let mut verdict: Verdict = serde_json::from_str(strip_markdown(text))
        .map_err(|e| DecisionError::Malformed(format!("{e}: {text}")))?;
    if !verdict.confidence.is_finite() {
        return Err(DecisionError::Malformed(format!("confidence {}", verdict.confidence)));
    }
    if verdict.confidence > 1.0 {
        verdict.confidence /= 100.0;
    }
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    Ok(verdict)
}

// ─── Service ──────────────────────────────────────────────────────────────────

pub struct LlmJudgmentService {
    client:   reqwest::Client,
    provider: AiProvider,
    api_key:  String,
    model:    String,
}

impl LlmJudgmentService {
    pub fn new(client: reqwest::Client, config: &DecisionConfig, api_key: String) -> Self {
        Self {
            client,
            provider: config.provider,
            api_key,
            model: config.model.clone(),
        }
    }

    async fn call(&self, prompt: &str) -> anyhow::Result<String> {
        match self.provider {
            AiProvider::Claude => self.call_claude(prompt).await,
            AiProvider::OpenAi => self.call_openai(prompt).await,
        }
    }

    async fn call_claude(&self, prompt: &str) -> anyhow::Result<String> {
        let body = ClaudeRequest {
            model:      &self.model,
            max_tokens: 256,
            messages:   vec![ChatMessage { role: "user", content: prompt }],
        };

        debug!(model = %self.model, "Calling Claude API...");

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("Claude API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {text}");
        }

        let data: ClaudeResponse = resp.json().await.context("Claude response parse error")?;
        data.content
            .into_iter()
            .next()
            .map(|c| c.text)
            .context("Claude returned empty content")
    }

    async fn call_openai(&self, prompt: &str) -> anyhow::Result<String> {
        let body = OpenAiRequest {
            model:    &self.model,
            messages: vec![
                ChatMessage { role: "system", content: "You are a trading risk gate. Always respond with valid JSON only." },
                ChatMessage { role: "user",   content: prompt },
            ],
        };

        debug!(model = %self.model, "Calling OpenAI API...");

        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("OpenAI API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {text}");
        }

        let data: OpenAiResponse = resp.json().await.context("OpenAI response parse error")?;
        data.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("OpenAI returned empty content")
    }
}

#[async_trait]
impl JudgmentService for LlmJudgmentService {
    async fn judge(&self, request: &JudgmentRequest) -> Result<Verdict, DecisionError> {
        let prompt = build_prompt(request);
        let reply = self
            .call(&prompt)
            .await
            .map_err(|e| DecisionError::Unavailable(format!("{e:#}")))?;
        parse_verdict(&reply)
    }
}

/// Used when no API key is configured: every judgment fails closed.
pub struct UnavailableJudgmentService;

#[async_trait]
impl JudgmentService for UnavailableJudgmentService {
    async fn judge(&self, _request: &JudgmentRequest) -> Result<Verdict, DecisionError> {
        Err(DecisionError::Unavailable("no reasoning service configured (AI_API_KEY)".into()))
    }
}

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatMessage<'a> {
    role:    &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ClaudeRequest<'a> {
    model:      &'a str,
    max_tokens: u32,
    messages:   Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Deserialize)]
struct ClaudeContent {
    text: String,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model:    &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMsg,
}

#[derive(Deserialize)]
struct OpenAiChoiceMsg {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketContext, Side, Strength};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn fenced_json_is_accepted() {
        let v = parse_verdict("```json\n{\"approved\": true, \"confidence\": 0.7, \"reason\": \"ok\"}\n```").unwrap();
        assert!(v.approved);
        assert_eq!(v.confidence, 0.7);
    }

    #[test]
    fn percent_confidence_is_scaled() {
        let v = parse_verdict(r#"{"approved": false, "confidence": 85}"#).unwrap();
        assert!((v.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn prose_is_malformed() {
        assert!(matches!(parse_verdict("Sure! I approve."), Err(DecisionError::Malformed(_))));
    }

    #[test]
    fn prompt_carries_signal_and_context() {
        let req = JudgmentRequest {
            signal_id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            action: "SINAL LONG FORTE".into(),
            side: Some(Side::Long),
            strength: Strength::Strong,
            reference_price: 45000.0,
            reason_code: "strong_signal".into(),
            context: MarketContext {
                sentiment_index: 25.0,
                trend: Trend::Bearish,
                dominant_share_pct: 55.0,
                refreshed_at: Utc::now(),
            },
        };
        let prompt = build_prompt(&req);
        assert!(prompt.contains("BTCUSDT"));
        assert!(prompt.contains("bearish"));
        assert!(prompt.contains("strong_signal"));
    }

    #[tokio::test]
    async fn unconfigured_service_is_unavailable() {
        let req = JudgmentRequest {
            signal_id: Uuid::new_v4(),
            symbol: "X".into(),
            action: "LONG".into(),
            side: None,
            strength: Strength::Unknown,
            reference_price: 1.0,
            reason_code: "unknown_strength".into(),
            context: MarketContext {
                sentiment_index: 50.0,
                trend: Trend::Neutral,
                dominant_share_pct: 50.0,
                refreshed_at: Utc::now(),
            },
        };
        assert!(matches!(
            UnavailableJudgmentService.judge(&req).await,
            Err(DecisionError::Unavailable(_))
        ));
    }
}
