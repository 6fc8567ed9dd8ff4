use serde::{Deserialize, Serialize};

pub const INPUT_PLACEHOLDER: &str = "{input}";

/// Where the formatted template lands in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// The formatted template is the whole system prompt.
    SystemPrompt,
    /// The formatted template is sent as user content.
    UserPrompt,
    /// The formatted template is appended to the base system prompt.
    AppendSystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPolicy {
    pub input_type: InputType,
    #[serde(default = "default_template")]
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_system_prompt: Option<String>,
}

fn default_template() -> String {
    INPUT_PLACEHOLDER.to_string()
}

/// Output of [`PromptPolicy::build`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuiltPrompt {
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
}

impl PromptPolicy {
    pub fn new(input_type: InputType, template: impl Into<String>) -> Self {
        Self {
            input_type,
            template: template.into(),
            base_system_prompt: None,
        }
    }

    /// Raw input as user content.
    pub fn user() -> Self {
        Self::new(InputType::UserPrompt, INPUT_PLACEHOLDER)
    }

    pub fn with_base_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_system_prompt = Some(prompt.into());
        self
    }

    pub fn format(&self, input: &str) -> String {
        self.template.replace(INPUT_PLACEHOLDER, input)
    }

    /// Apply the policy to `input`, then append routing `additions` to the
    /// system prompt in order.
    pub fn build(&self, input: &str, additions: &[String]) -> BuiltPrompt {
        let formatted = self.format(input);
        let base = self.base_system_prompt.as_deref().unwrap_or_default();

        let (system, user) = match self.input_type {
            InputType::SystemPrompt => (formatted, None),
            InputType::AppendSystem => (join_lines(base, &formatted), None),
            InputType::UserPrompt => (base.to_string(), Some(formatted)),
        };

        let system = if additions.is_empty() {
            system
        } else {
            join_lines(&system, &additions.join(" "))
        };

        BuiltPrompt {
            system_prompt: (!system.is_empty()).then_some(system),
            user_prompt: user.filter(|u| !u.is_empty()),
        }
    }
}

fn join_lines(head: &str, tail: &str) -> String {
    match (head.is_empty(), tail.is_empty()) {
        (true, _) => tail.to_string(),
        (_, true) => head.to_string(),
        _ => format!("{head}\n{tail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_prompt_mode() {
        let policy = PromptPolicy::new(InputType::UserPrompt, "Explain: {input}").with_base_system_prompt("Be concise.");
        let prompt = policy.build("gravity", &[]);

        assert_eq!(prompt.system_prompt.as_deref(), Some("Be concise."));
        assert_eq!(prompt.user_prompt.as_deref(), Some("Explain: gravity"));
    }

    #[test]
    fn test_system_prompt_mode_queues_no_user_content() {
        let policy = PromptPolicy::new(InputType::SystemPrompt, "You are an expert in {input}.");
        let prompt = policy.build("law", &[]);

        assert_eq!(prompt.system_prompt.as_deref(), Some("You are an expert in law."));
        assert_eq!(prompt.user_prompt, None);
    }

    #[test]
    fn test_append_system_mode() {
        let policy = PromptPolicy::new(InputType::AppendSystem, "Topic: {input}").with_base_system_prompt("You teach physics.");
        let prompt = policy.build("optics", &[]);

        assert_eq!(prompt.system_prompt.as_deref(), Some("You teach physics.\nTopic: optics"));
        assert_eq!(prompt.user_prompt, None);
    }

    #[test]
    fn test_additions_appended_in_order() {
        let policy = PromptPolicy::user().with_base_system_prompt("Base.");
        let additions = vec!["Be formal.".to_string(), "Cite sources.".to_string()];
        let prompt = policy.build("hi", &additions);

        assert_eq!(prompt.system_prompt.as_deref(), Some("Base.\nBe formal. Cite sources."));
    }

    #[test]
    fn test_user_mode_without_base_has_no_system_prompt() {
        let prompt = PromptPolicy::user().build("hello", &[]);
        assert_eq!(prompt.system_prompt, None);
        assert_eq!(prompt.user_prompt.as_deref(), Some("hello"));
    }
}
