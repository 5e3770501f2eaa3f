//! Intent classification for incoming statements.
//!
//! A compiled regex gate catches command-verb phrasing; plain statements
//! never pay for an LLM call. When the gate fires, a deterministic LLM call
//! (temperature 0, JSON object response) picks the precise intent. Every
//! failure path falls open to [`Intent::Store`]: a misclassified command is
//! recoverable, a dropped fact is not.

use lazy_static::lazy_static;
use regex::RegexSet;
use serde_json::Value;

use crate::llm::{LlmClient, LlmMessage, LlmRequest};

use super::types::Intent;

lazy_static! {
    /// Command-verb phrases that warrant precise classification.
    static ref COMMAND_GATE: RegexSet = RegexSet::new([
        r"(?i)\b(forget|remove|delete|erase|drop|purge|clear)\b.{0,40}\b(memor|about|that)",
        r"(?i)stop\s+tracking",
        r"(?i)don'?t\s+remember",
        r"(?i)no\s+longer\s+relevant",
        r"(?i)mark\s+as\s+(outdated|irrelevant|deleted|removed)",
        r"(?i)\binvalidate\b",
        r"(?i)still\s+(relevant|unfixed|open|valid|pending|applies|true)",
        r"(?i)\b(confirmed|reconfirm)\b",
        r"(?i)refresh\s+memor",
        r"(?i)touch\s+memor",
        r"(?i)\bresolved\b",
        r"(?i)mark\s+as\s+(resolved|fixed|done|complete|closed)",
        r"(?i)has\s+been\s+(fixed|resolved|addressed|completed)",
        r"(?i)\buntrack\b",
        r"(?i)\b(remove|delete)\s+entity\b",
    ])
    .expect("static regex set");
}

const CLASSIFY_SYSTEM_PROMPT: &str = r#"You classify a user statement addressed to a memory system into exactly one intent.

Intents:
- STORE: a fact to remember (the default).
- INVALIDATE: the user wants an existing memory marked as no longer true. Include "target": a description of that memory.
- DELETE_ENTITY: the user wants a tracked entity (person, project, thing) removed. Include "entityName": the entity's name.
- TOUCH: the user reconfirms an existing memory is still true. Include "target".
- RESOLVE: the user reports a tracked issue as fixed/closed. Include "target".

Respond with a single JSON object: {"intent": "...", "target": "..."} or {"intent": "DELETE_ENTITY", "entityName": "..."}. No other text."#;

/// Regex fast-path + LLM fallback intent classifier.
pub struct IntentClassifier {
    llm: LlmClient,
}

impl IntentClassifier {
    /// Create a classifier over the shared LLM client.
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Classify a statement. Never fails; anything ambiguous is a STORE.
    pub async fn classify(&self, text: &str) -> Intent {
        if !Self::looks_like_command(text) {
            return Intent::Store;
        }

        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(CLASSIFY_SYSTEM_PROMPT),
            LlmMessage::user(text),
        ])
        .with_temperature(0.0)
        .with_max_tokens(100);

        match self.llm.complete_json(request).await {
            Ok(value) => Self::parse_intent(&value),
            Err(err) => {
                tracing::warn!(%err, "intent classification failed, storing as fact");
                Intent::Store
            }
        }
    }

    /// Whether the regex gate fires for this text.
    pub fn looks_like_command(text: &str) -> bool {
        COMMAND_GATE.is_match(text)
    }

    /// Strict parse of the LLM verdict; anything malformed is a STORE.
    fn parse_intent(value: &Value) -> Intent {
        match serde_json::from_value::<Intent>(value.clone()) {
            Ok(intent) if Self::companion_present(&intent) => intent,
            _ => Intent::Store,
        }
    }

    /// The non-STORE variants require a non-empty companion field.
    fn companion_present(intent: &Intent) -> bool {
        match intent {
            Intent::Store => true,
            Intent::Invalidate { target }
            | Intent::Touch { target }
            | Intent::Resolve { target } => !target.trim().is_empty(),
            Intent::DeleteEntity { entity_name } => !entity_name.trim().is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_statements_skip_the_gate() {
        for text in [
            "My blood type is O positive.",
            "I moved to London last week",
            "Alice prefers tea over coffee",
        ] {
            assert!(!IntentClassifier::looks_like_command(text), "{text}");
        }
    }

    #[test]
    fn test_command_phrases_fire_the_gate() {
        for text in [
            "forget about my old phone number",
            "please delete that memory",
            "stop tracking Bob",
            "this is no longer relevant",
            "mark as outdated",
            "the login bug is still unfixed",
            "the deploy issue has been fixed",
            "mark as resolved",
            "remove entity Acme Corp",
            "reconfirm my address",
        ] {
            assert!(IntentClassifier::looks_like_command(text), "{text}");
        }
    }

    #[test]
    fn test_parse_intent_valid() {
        let intent = IntentClassifier::parse_intent(&json!({
            "intent": "INVALIDATE",
            "target": "old phone number"
        }));
        assert_eq!(
            intent,
            Intent::Invalidate {
                target: "old phone number".to_string()
            }
        );

        let intent = IntentClassifier::parse_intent(&json!({
            "intent": "DELETE_ENTITY",
            "entityName": "Bob"
        }));
        assert_eq!(
            intent,
            Intent::DeleteEntity {
                entity_name: "Bob".to_string()
            }
        );
    }

    #[test]
    fn test_parse_intent_falls_open() {
        // Unknown intent name.
        assert_eq!(
            IntentClassifier::parse_intent(&json!({"intent": "EXPLODE", "target": "x"})),
            Intent::Store
        );
        // Missing companion.
        assert_eq!(
            IntentClassifier::parse_intent(&json!({"intent": "INVALIDATE"})),
            Intent::Store
        );
        // Empty companion.
        assert_eq!(
            IntentClassifier::parse_intent(&json!({"intent": "TOUCH", "target": "  "})),
            Intent::Store
        );
        // Not an object at all.
        assert_eq!(IntentClassifier::parse_intent(&json!("STORE")), Intent::Store);
    }
}
