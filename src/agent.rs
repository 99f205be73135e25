//! High level language model interface for the assistant.
//!
//! This module wraps the [`ollama-rs`](https://crates.io/crates/ollama-rs)
//! client. Each spoken command is rendered into a single prompt made of
//! the configured system prompt, the bounded conversation history, the
//! command itself and a JSON context blob (timestamp, activity flag, OS
//! snapshot). The raw model output is cleaned before it is spoken:
//! `<think>` blocks are captured to `~/.jarvis/jarvis.think`, Markdown
//! fences and backticks are stripped, and over-long or empty answers
//! are replaced with fixed clarification messages so the TTS stage
//! always has something sensible to say.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::models::ModelOptions;
use ollama_rs::Ollama;
use serde::Serialize;

use crate::config::AiConfig;
use crate::system::SystemSnapshot;

/// Fallback when the model cannot be reached or errors mid-request.
const ERROR_FALLBACK: &str =
    "I apologize, but I encountered an error while processing your command. Please try again.";
/// Fallback when the request exceeds the model timeout.
const TIMEOUT_FALLBACK: &str = "The request to the language model timed out. Please try again.";

/// How long to wait for the model before giving up on the turn.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Context attached to every command so the model can ground its
/// answers in the machine it runs on.
#[derive(Debug, Clone, Serialize)]
pub struct CommandContext {
    pub timestamp: String,
    pub is_active: bool,
    pub system: SystemSnapshot,
}

#[derive(Debug, Clone)]
struct Exchange {
    role: &'static str,
    content: String,
}

/// Client for the local language model with a bounded per-process
/// conversation history.
pub struct Agent {
    client: Ollama,
    config: AiConfig,
    history: VecDeque<Exchange>,
}

impl Agent {
    /// Construct an agent and verify the Ollama server is reachable.
    /// The client connects to the default endpoint; set `OLLAMA_HOST`
    /// and `OLLAMA_PORT` to change it.
    pub async fn new(config: &AiConfig) -> Result<Self> {
        log::info!("Initializing AI agent with model '{}'", config.model);
        let client = Ollama::default();
        client
            .list_local_models()
            .await
            .context("failed to reach the Ollama server; is it running?")?;
        Ok(Self {
            client,
            config: config.clone(),
            history: VecDeque::new(),
        })
    }

    /// Send the user's spoken command to the language model and return
    /// a cleaned textual response. Model failures never propagate: they
    /// are logged and collapsed into a spoken fallback message.
    pub async fn process_command(&mut self, command: &str, context: &CommandContext) -> String {
        let prompt = self.render_prompt(command, context);
        log::debug!("LLM prompt: {}", prompt);

        let options = ModelOptions::default()
            .temperature(self.config.temperature)
            .num_predict(self.config.max_tokens as i32);
        let request = GenerationRequest::new(self.config.model.clone(), prompt).options(options);

        let response =
            match tokio::time::timeout(REQUEST_TIMEOUT, self.client.generate(request)).await {
                Ok(Ok(res)) => res.response,
                Ok(Err(e)) => {
                    log::error!("Language model request failed: {e}");
                    return ERROR_FALLBACK.to_string();
                }
                Err(_) => {
                    log::warn!("Language model request timed out after {:?}", REQUEST_TIMEOUT);
                    return TIMEOUT_FALLBACK.to_string();
                }
            };
        log::debug!("Raw LLM response: {}", response);

        let answer = self.clean_response(response.trim());
        self.remember(command, &answer);
        answer
    }

    fn render_prompt(&self, command: &str, context: &CommandContext) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.config.system_prompt);
        prompt.push_str("\n\n");
        if self.config.enable_memory {
            for exchange in &self.history {
                let speaker = if exchange.role == "user" {
                    "User"
                } else {
                    "Assistant"
                };
                prompt.push_str(&format!("{}: {}\n", speaker, exchange.content));
            }
        }
        prompt.push_str(&format!("User: {}\n", command));
        let context_json =
            serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string());
        prompt.push_str(&format!("Context: {}\n", context_json));
        prompt.push_str("Assistant:");
        prompt
    }

    fn clean_response(&self, raw: &str) -> String {
        let mut answer = strip_think_block(raw, |think| {
            log::debug!("Captured think block: {}", think);
            if let Some(home) = dirs::home_dir() {
                let jarvis_dir = home.join(".jarvis");
                let _ = std::fs::create_dir_all(&jarvis_dir);
                let _ = std::fs::write(jarvis_dir.join("jarvis.think"), think);
            }
        });
        answer = strip_markdown(&answer);

        // A verbose model is usually an uncertain one; a spoken answer
        // long past the configured cap is worse than asking again.
        if answer.chars().count() > self.config.max_response_length {
            return "I'm sorry, I didn't quite understand. Please try again with a simpler command."
                .to_string();
        }
        // An empty answer can hang some TTS backends.
        if answer.trim().is_empty() {
            return "I didn't catch that. Could you repeat your command?".to_string();
        }
        answer
    }

    fn remember(&mut self, command: &str, answer: &str) {
        if !self.config.enable_memory {
            return;
        }
        self.history.push_back(Exchange {
            role: "user",
            content: command.to_string(),
        });
        self.history.push_back(Exchange {
            role: "assistant",
            content: answer.to_string(),
        });
        // One retained exchange is a user/assistant pair.
        let max_entries = self.config.memory_retention.saturating_mul(2);
        while self.history.len() > max_entries {
            self.history.pop_front();
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        log::info!("Conversation history cleared");
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Remove a leading `<think>...</think>` block, handing its contents to
/// `on_think`. Text before the opening tag is preserved only when no
/// complete block exists.
fn strip_think_block(answer: &str, on_think: impl FnOnce(&str)) -> String {
    if let (Some(start), Some(end)) = (answer.find("<think>"), answer.find("</think>")) {
        let think_start = start + "<think>".len();
        if think_start <= end {
            on_think(answer[think_start..end].trim());
            return answer[end + "</think>".len()..].trim_start().to_string();
        }
    }
    answer.to_string()
}

/// Drop fenced code blocks and inline backticks so the spoken response
/// reads as plain sentences.
fn strip_markdown(answer: &str) -> String {
    let mut answer = answer.to_string();
    if answer.contains("```") {
        let mut cleaned = String::new();
        let mut in_code = false;
        for line in answer.lines() {
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                continue;
            }
            if !in_code {
                cleaned.push_str(line);
                cleaned.push('\n');
            }
        }
        answer = cleaned.trim().to_string();
    }
    if answer.contains('`') {
        answer = answer.replace('`', "");
    }
    answer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_think_block_and_keeps_answer() {
        let raw = "<think>the user wants the time</think>It is noon.";
        let mut captured = String::new();
        let cleaned = strip_think_block(raw, |t| captured = t.to_string());
        assert_eq!(cleaned, "It is noon.");
        assert_eq!(captured, "the user wants the time");
    }

    #[test]
    fn text_without_think_block_is_unchanged() {
        let raw = "It is noon.";
        let cleaned = strip_think_block(raw, |_| panic!("no think block here"));
        assert_eq!(cleaned, "It is noon.");
    }

    #[test]
    fn strips_code_fences_and_backticks() {
        let raw = "Run this:\n```sh\ndate\n```\nor use `uptime` instead.";
        let cleaned = strip_markdown(raw);
        assert!(!cleaned.contains("```"));
        assert!(!cleaned.contains('`'));
        assert!(!cleaned.contains("date"));
        assert!(cleaned.contains("uptime"));
    }

    fn test_agent(retention: usize) -> Agent {
        let config = AiConfig {
            memory_retention: retention,
            ..AiConfig::default()
        };
        Agent {
            client: Ollama::default(),
            config,
            history: VecDeque::new(),
        }
    }

    #[test]
    fn history_is_bounded_by_retention() {
        let mut agent = test_agent(2);
        for i in 0..10 {
            agent.remember(&format!("question {i}"), &format!("answer {i}"));
        }
        // Two exchanges retained, two entries each.
        assert_eq!(agent.history_len(), 4);
        // The oldest entries were evicted from the front.
        assert_eq!(agent.history[0].content, "question 8");
        assert_eq!(agent.history[3].content, "answer 9");
    }

    #[test]
    fn memory_disabled_keeps_no_history() {
        let mut agent = test_agent(5);
        agent.config.enable_memory = false;
        agent.remember("hello", "hi");
        assert_eq!(agent.history_len(), 0);
    }

    #[test]
    fn long_answers_collapse_to_clarification() {
        let agent = test_agent(1);
        let long = "word ".repeat(200);
        let cleaned = agent.clean_response(&long);
        assert!(cleaned.starts_with("I'm sorry"));
    }

    #[test]
    fn empty_answers_collapse_to_clarification() {
        let agent = test_agent(1);
        assert!(agent.clean_response("   ").starts_with("I didn't catch that"));
    }
}
