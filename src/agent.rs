//! Analysis agent: relevance gate, grounded synthesis, fallback protocol.
//!
//! The agent is a pure function of `(query, retrieved evidence)` — it owns no
//! state. The probabilistic step is isolated behind [`GenerationProvider`],
//! so the deterministic retrieval path stays testable with a scripted
//! implementation.
//!
//! Three stages per query:
//!
//! 1. **Relevance gate** — the provider judges evidence sufficiency; a
//!    negative judgment (or empty evidence) short-circuits to the fallback.
//! 2. **Multimodal synthesis** — on sufficiency, the provider's answer is
//!    paired with citations built only from the evidence items it actually
//!    cited, deduplicated by page and sorted. Image paths are surfaced only
//!    for cited image chunks and only when the provider judged the image
//!    modality relevant.
//! 3. **Fallback protocol** — a fixed refusal shape with zero citations and
//!    zero images. Never a fabricated answer.
//!
//! A generation failure is retried once with backoff for transient classes,
//! then surfaced as an error — it never degrades into an ungrounded answer.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GenerationConfig;
use crate::error::{AgentError, GenerationError};
use crate::models::{Answer, BlockKind, Citation, RetrievedChunk};

/// Boundary to the text-generation backend.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Run one generation call and return the raw model output.
    async fn generate(&self, system: &str, user: &str) -> Result<String, GenerationError>;

    fn model_name(&self) -> &str;
}

/// Instantiate the provider named by the configuration.
pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Box<dyn GenerationProvider>, GenerationError> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiGenerator::new(config)?)),
        "disabled" => Err(GenerationError::Config(
            "generation provider is disabled; set [generation] provider in config".to_string(),
        )),
        other => Err(GenerationError::Config(format!(
            "unknown generation provider: {}",
            other
        ))),
    }
}

const SYSTEM_PROMPT: &str = "\
You are a document analysis agent. You answer questions using ONLY the numbered \
evidence provided, and you refuse when the evidence is insufficient.

Protocol:
1. Evaluate each evidence item for relevance to the query.
2. Decide which modalities (text/table/image) contain the answer.
3. Construct an answer using only claims supported by the evidence.
4. Verify every claim can cite a specific evidence number; if not, refuse.

Respond with exactly this JSON object:
{
    \"evidence_sufficient\": true or false,
    \"relevant_modalities\": [\"text\", \"table\", \"image\"],
    \"reasoning\": \"your analysis of the evidence\",
    \"answer\": \"your grounded answer, or why you cannot answer\",
    \"cited_evidence_ids\": [1, 2]
}

Rules:
- NEVER invent information not present in the evidence.
- Cite only evidence numbers you actually used.
- If the evidence is insufficient or irrelevant, set evidence_sufficient to false.
- Prioritize accuracy over helpfulness.";

/// The structured judgment returned by the generation provider.
#[derive(Debug, Deserialize)]
pub struct Verdict {
    pub evidence_sufficient: bool,
    #[serde(default)]
    pub relevant_modalities: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub cited_evidence_ids: Vec<usize>,
}

/// Analyze retrieved evidence and produce a grounded [`Answer`] or the
/// fallback response.
pub async fn analyze(
    query: &str,
    evidence: &[RetrievedChunk],
    provider: &dyn GenerationProvider,
) -> Result<Answer, AgentError> {
    if evidence.is_empty() {
        debug!("no evidence retrieved, taking fallback");
        return Ok(Answer::fallback());
    }

    let user_prompt = format!(
        "QUERY: {}\n\nRETRIEVED EVIDENCE:\n{}\n\nAnalyze this evidence and respond with the JSON object.",
        query,
        format_evidence(evidence)
    );

    let raw = provider.generate(SYSTEM_PROMPT, &user_prompt).await?;
    let verdict = parse_verdict(&raw)?;

    debug!(
        sufficient = verdict.evidence_sufficient,
        cited = verdict.cited_evidence_ids.len(),
        reasoning = %verdict.reasoning,
        "agent verdict"
    );

    if !verdict.evidence_sufficient {
        return Ok(Answer::fallback());
    }

    let citations = extract_citations(evidence, &verdict.cited_evidence_ids);
    if citations.is_empty() {
        // Sufficient but nothing validly cited: ungrounded by definition.
        warn!("verdict claimed sufficiency without valid citations, taking fallback");
        return Ok(Answer::fallback());
    }

    let images = extract_images(
        evidence,
        &verdict.cited_evidence_ids,
        &verdict.relevant_modalities,
    );

    Ok(Answer {
        text: verdict.answer,
        citations,
        images,
        grounded: true,
    })
}

/// Number the evidence for the prompt, 1-based, with provenance metadata.
fn format_evidence(evidence: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for (i, item) in evidence.iter().enumerate() {
        out.push_str(&format!(
            "[Evidence {}]\nType: {}\nPage: {}\nRelevance Score: {:.2}\nContent: {}\n",
            i + 1,
            item.chunk.kind.as_str(),
            item.chunk.page,
            item.score,
            item.chunk.content
        ));
        if item.chunk.kind == BlockKind::Image {
            if let Some(path) = &item.chunk.image_path {
                out.push_str(&format!("Image Available: yes (path: {})\n", path));
            }
        }
        out.push('\n');
    }
    out
}

/// Parse the provider output into a [`Verdict`], tolerating markdown fences.
fn parse_verdict(raw: &str) -> Result<Verdict, AgentError> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| {
        AgentError::MalformedVerdict(format!("{} in output: {}", e, truncate(raw, 200)))
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

/// Citations for validly cited evidence ids, deduplicated by page, sorted
/// by page. Retrieved-but-uncited chunks never appear here.
fn extract_citations(evidence: &[RetrievedChunk], cited_ids: &[usize]) -> Vec<Citation> {
    let mut citations = Vec::new();
    let mut seen_pages = HashSet::new();

    for &id in cited_ids {
        if id == 0 || id > evidence.len() {
            continue;
        }
        let chunk = &evidence[id - 1].chunk;
        if seen_pages.insert(chunk.page) {
            citations.push(Citation {
                page: chunk.page,
                content_type: chunk.kind,
            });
        }
    }

    citations.sort_by_key(|c| c.page);
    citations
}

/// Image paths for cited image chunks, but only when the provider judged
/// the image modality relevant. The same relevance gate governs every kind.
fn extract_images(
    evidence: &[RetrievedChunk],
    cited_ids: &[usize],
    relevant_modalities: &[String],
) -> Vec<String> {
    if !relevant_modalities.iter().any(|m| m == "image") {
        return Vec::new();
    }

    let mut images = Vec::new();
    let mut seen = HashSet::new();

    for &id in cited_ids {
        if id == 0 || id > evidence.len() {
            continue;
        }
        let chunk = &evidence[id - 1].chunk;
        if chunk.kind == BlockKind::Image {
            if let Some(path) = &chunk.image_path {
                if seen.insert(path.clone()) {
                    images.push(path.clone());
                }
            }
        }
    }

    images
}

// ============ OpenAI Provider ============

/// Generation provider backed by `POST /v1/chat/completions`.
///
/// Low temperature and JSON response format for deterministic reasoning;
/// one retry with backoff on transient failures.
pub struct OpenAiGenerator {
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
    api_key: String,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| GenerationError::Config("OPENAI_API_KEY not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::Config(e.to_string()))?;

        Ok(Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            client,
            api_key,
        })
    }

    async fn call_once(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user}
            ],
            "temperature": 0.1,
            "max_tokens": self.max_tokens,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerationError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(GenerationError::Transient(format!(
                    "chat API error {}: {}",
                    status, text
                )));
            }
            return Err(GenerationError::Permanent(format!(
                "chat API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Transient(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                GenerationError::Permanent("chat response missing message content".to_string())
            })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiGenerator {
    async fn generate(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        match self.call_once(system, user).await {
            Ok(out) => Ok(out),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "generation failed, retrying once");
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.call_once(system, user).await
            }
            Err(e) => Err(e),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
