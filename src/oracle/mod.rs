//! Request/response access to the language/vision model.

pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::OracleError;
use crate::snapshot::Screenshot;
use crate::types::ChatMessage;

pub use openai::OpenAiOracle;

/// Which component is asking; lets backends and fakes tell calls apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Interpret,
    Vision,
    Plan,
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub purpose: Purpose,
    pub messages: Vec<ChatMessage>,
    /// Attached to the final user message when present.
    pub image: Option<Screenshot>,
}

impl OracleRequest {
    pub fn new(purpose: Purpose, system: &str, user: String) -> Self {
        Self {
            purpose,
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            image: None,
        }
    }

    pub fn with_image(mut self, image: Screenshot) -> Self {
        if !image.is_empty() {
            self.image = Some(image);
        }
        self
    }

    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, request: OracleRequest) -> Result<String, OracleError>;
}

/// One oracle call under a deadline. Empty replies count as failures.
pub async fn complete_within(
    oracle: &dyn Oracle,
    request: OracleRequest,
    limit: Duration,
) -> Result<String, OracleError> {
    match tokio::time::timeout(limit, oracle.complete(request)).await {
        Ok(Ok(text)) if text.trim().is_empty() => Err(OracleError::EmptyResponse),
        Ok(result) => result,
        Err(_) => Err(OracleError::Timeout(limit.as_millis() as u64)),
    }
}

/// Appends the session's recent activity to a prompt. Nothing is added when
/// there is none.
pub fn push_activity(prompt: &mut String, recent: &[String]) {
    if recent.is_empty() {
        return;
    }
    prompt.push_str("Recent activity in this session:\n");
    for line in recent {
        prompt.push_str("- ");
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push('\n');
}

/// Strips the markdown fences models like to wrap JSON in.
pub fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Parses a JSON reply, falling back to the outermost `{...}` when the model
/// wrapped it in prose.
pub fn parse_json<T: DeserializeOwned>(content: &str) -> Result<T, String> {
    let cleaned = strip_fences(content);
    match serde_json::from_str(cleaned) {
        Ok(value) => Ok(value),
        Err(first) => {
            let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) else {
                return Err(format!("not JSON: {first}"));
            };
            if end <= start {
                return Err(format!("not JSON: {first}"));
            }
            serde_json::from_str(&cleaned[start..=end]).map_err(|e| format!("bad JSON: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        answer: String,
    }

    #[test]
    fn parses_fenced_and_embedded_json() {
        let fenced = "```json\n{\"answer\":\"yes\"}\n```";
        assert_eq!(parse_json::<Reply>(fenced).unwrap().answer, "yes");

        let chatty = "Sure! Here you go: {\"answer\":\"no\"} Hope that helps.";
        assert_eq!(parse_json::<Reply>(chatty).unwrap().answer, "no");

        assert!(parse_json::<Reply>("no braces at all").is_err());
    }

    #[test]
    fn activity_is_listed_only_when_present() {
        let mut prompt = String::from("Task: t\n\n");
        push_activity(&mut prompt, &[]);
        assert_eq!(prompt, "Task: t\n\n");

        push_activity(&mut prompt, &["Succeeded: navigate to https://a.test".to_string()]);
        assert!(prompt.contains("Recent activity in this session:\n- Succeeded: navigate to https://a.test\n"));
    }

    struct Slow;

    #[async_trait]
    impl Oracle for Slow {
        async fn complete(&self, _request: OracleRequest) -> Result<String, OracleError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    struct Blank;

    #[async_trait]
    impl Oracle for Blank {
        async fn complete(&self, _request: OracleRequest) -> Result<String, OracleError> {
            Ok("   ".into())
        }
    }

    #[tokio::test]
    async fn deadline_and_empty_replies_are_failures() {
        let req = OracleRequest::new(Purpose::Plan, "sys", "hi".into());
        let err = complete_within(&Slow, req.clone(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Timeout(10)));

        let err = complete_within(&Blank, req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::EmptyResponse));
    }
}
