use async_trait::async_trait;
use serde_json::Value;

use crate::assembly::gap_filler::{GenerationError, GenerationSeed, QuestionGenerator};
use crate::services::llm_provider::{LLMError, LLMProvider};

const SYSTEM_PROMPT: &str = "You write certification exam questions. \
Reply with a single JSON object of the form {\"questions\": [...]} and nothing else.";

/// Builds variant questions from seed questions through the chat provider.
#[derive(Clone)]
pub struct LlmQuestionGenerator {
    provider: LLMProvider,
}

impl LlmQuestionGenerator {
    pub fn new(provider: LLMProvider) -> Self {
        Self { provider }
    }

    /// `None` when the provider has no credentials.
    pub fn from_env() -> Option<Self> {
        let provider = LLMProvider::from_env();
        provider.is_available().then(|| Self::new(provider))
    }
}

#[async_trait]
impl QuestionGenerator for LlmQuestionGenerator {
    async fn generate_variants(&self, seeds: &[GenerationSeed]) -> Result<Vec<Value>, GenerationError> {
        let prompt = build_prompt(seeds);
        tracing::debug!(model = self.provider.model(), seeds = seeds.len(), "requesting question variants");
        let reply = self
            .provider
            .complete_json(SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|err| match err {
                LLMError::Json(e) => GenerationError::Malformed(e.to_string()),
                other => GenerationError::Provider(other.to_string()),
            })?;
        parse_variants(&reply)
    }
}

pub fn build_prompt(seeds: &[GenerationSeed]) -> String {
    let mut prompt = String::from(
        "Write one new multiple-choice variant for every seed question below. \
Each variant must test the same topic with a different scenario, numbers or wording, \
at the same difficulty. Never reference images; describe any figure in words.\n\n\
Options are a list like [\"A. ...\", \"B. ...\", \"C. ...\", \"D. ...\"] and the answer is the letter. \
For questions with several blanks, options is a list of such lists and the answer joins the letters with commas, e.g. \"A,C\".\n\n\
Seed questions:\n",
    );

    for seed in seeds {
        prompt.push_str(&format!(
            "ID: {}\nTopic: {}\nContent: {}\nOptions: {}\nAnswer: {}\nExplanation: {}\n\n",
            seed.id, seed.topic, seed.content, seed.options, seed.answer, seed.explanation
        ));
    }

    prompt.push_str(
        "Return {\"questions\": [{\"based_on_id\": <seed ID>, \"content\": \"...\", \
\"options\": [...], \"answer\": \"...\", \"explanation\": \"...\"}]}",
    );
    prompt
}

/// Accepts a bare array or an object with a `questions` array, optionally
/// wrapped in a markdown code fence.
pub fn parse_variants(reply: &str) -> Result<Vec<Value>, GenerationError> {
    let body = strip_code_fence(reply);
    let value: Value =
        serde_json::from_str(body).map_err(|e| GenerationError::Malformed(e.to_string()))?;

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(GenerationError::Malformed("missing questions array".to_string())),
        },
        _ => Err(GenerationError::Malformed("unexpected JSON shape".to_string())),
    }
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
