use std::path::Path;
use tracing::{info, warn};

/// Fallback instruction text used when no prompt file is configured.
const DEFAULT_PROMPT: &str = "You are a poet. Write a haiku inspired by the image you are given: \
three lines of five, seven and five syllables, present tense, built from concrete details that \
are actually visible in the image. Return only the poem text.";

const USER_INSTRUCTION: &str = "Please write a poem inspired by this image.";

/// The fixed style instruction sent with every generation request.
/// Loaded once at process start and read-only afterwards.
#[derive(Debug, Clone)]
pub struct StyleDirective {
    prompt: String,
}

impl StyleDirective {
    /// Read the prompt file, falling back to the built-in default when
    /// the file is missing, unreadable or empty.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let trimmed = contents.trim();
                if trimmed.is_empty() {
                    warn!(path = %path.display(), "style prompt file is empty, using default");
                    Self::default()
                } else {
                    info!(path = %path.display(), "style directive loaded");
                    Self {
                        prompt: trimmed.to_string(),
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read style prompt file, using default");
                Self::default()
            }
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn user_instruction(&self) -> &'static str {
        USER_INSTRUCTION
    }
}

impl Default for StyleDirective {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}
