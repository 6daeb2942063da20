use cp_base::Provider;

/// A chat message for the overhead-aware counting path
pub struct ChatMessage<'a> {
    pub role: &'a str,
    pub content: &'a [ContentPart<'a>],
}

pub enum ContentPart<'a> {
    Text(&'a str),
    /// A fixed per-image token cost regardless of resolution.
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenCount {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

const IMAGE_TOKEN_COST: u64 = 85;
const REPLY_PRIMING_TOKENS: u64 = 3;

fn chars_per_token(provider: Provider) -> f64 {
    match provider {
        Provider::Anthropic => 3.5,
        _ => 4.0,
    }
}

fn tokens_per_message_overhead(provider: Provider) -> u64 {
    match provider {
        Provider::Anthropic => 3,
        _ => 4,
    }
}

/// Provider-aware token counting.
///
/// Providers with an accurate tokenizer library plug in via
/// [`TokenCounter::with_exact_encoder`]; everything else falls back to
/// the `chars_per_token` approximation. No concrete tokenizer library is
/// vendored here (LLM inference itself is out of scope), so
/// the default counter always uses the approximation — callers running
/// against a provider with a real tokenizer supply their own encoder.
pub struct TokenCounter {
    exact_encoder: Option<Box<dyn Fn(&str) -> u64 + Send + Sync>>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self {
            exact_encoder: None,
        }
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an exact encoder (e.g. a `tiktoken`-style `encode(text)`)
    /// used instead of the character-ratio approximation.
    pub fn with_exact_encoder(encoder: impl Fn(&str) -> u64 + Send + Sync + 'static) -> Self {
        Self {
            exact_encoder: Some(Box::new(encoder)),
        }
    }

    pub fn count_text(&self, text: &str, provider: Provider) -> u64 {
        if text.is_empty() {
            return 0;
        }
        if let Some(encoder) = &self.exact_encoder {
            return encoder(text);
        }
        ((text.chars().count() as f64) / chars_per_token(provider)).ceil() as u64
    }

    /// Fixed per-message overhead, role tokens, content tokens (image
    /// parts add a flat 85), plus a trailing priming constant.
    pub fn count_messages(&self, messages: &[ChatMessage<'_>], provider: Provider) -> u64 {
        if messages.is_empty() {
            return 0;
        }
        let overhead = tokens_per_message_overhead(provider);
        let mut total = 0u64;
        for message in messages {
            total += overhead;
            total += self.count_text(message.role, provider);
            for part in message.content {
                total += match part {
                    ContentPart::Text(text) => self.count_text(text, provider),
                    ContentPart::Image => IMAGE_TOKEN_COST,
                };
            }
        }
        total + REPLY_PRIMING_TOKENS
    }

    /// Estimates output tokens as `min(max_tokens, 0.5 * input)`, a
    /// conservative pre-call estimate.
    pub fn estimate_output_tokens(input_tokens: u64, max_tokens: Option<u64>) -> u64 {
        let typical = (input_tokens as f64 * 0.5).floor() as u64;
        match max_tokens {
            Some(cap) => typical.min(cap),
            None => typical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_estimate_uses_provider_specific_ratio() {
        let counter = TokenCounter::new();
        let text = "a".repeat(14);
        assert_eq!(counter.count_text(&text, Provider::OpenAi), 4);
        assert_eq!(counter.count_text(&text, Provider::Anthropic), 4);
    }

    #[test]
    fn exact_encoder_overrides_the_approximation() {
        let counter = TokenCounter::with_exact_encoder(|text| text.split_whitespace().count() as u64);
        assert_eq!(counter.count_text("a b c", Provider::OpenAi), 3);
    }

    #[test]
    fn message_overhead_differs_by_provider() {
        let counter = TokenCounter::new();
        let messages = [ChatMessage {
            role: "user",
            content: &[ContentPart::Text("hi")],
        }];
        let openai = counter.count_messages(&messages, Provider::OpenAi);
        let anthropic = counter.count_messages(&messages, Provider::Anthropic);
        assert!(openai > anthropic);
    }

    #[test]
    fn image_parts_add_a_flat_cost() {
        let counter = TokenCounter::new();
        let messages = [ChatMessage {
            role: "user",
            content: &[ContentPart::Image],
        }];
        let total = counter.count_messages(&messages, Provider::OpenAi);
        // overhead(4) + role("user" ~1 token) + image(85) + priming(3)
        assert!(total >= 4 + 85 + 3);
    }

    #[test]
    fn output_estimate_respects_max_tokens_cap() {
        assert_eq!(TokenCounter::estimate_output_tokens(1000, Some(100)), 100);
        assert_eq!(TokenCounter::estimate_output_tokens(1000, None), 500);
        assert_eq!(TokenCounter::estimate_output_tokens(1000, Some(10_000)), 500);
    }
}
