//! Prompt templates and persona loading for the admin agent's free-text
//! path.

use std::path::Path;

pub const SYSTEM_PROMPT_TEMPLATE: &str = "\
You are a personal reflection assistant.

Persona:
{persona}

User profile:
{user_profile}

Context:
{context}
";

pub const USER_PROMPT_TEMPLATE: &str = "{text}";

pub const EXTRACTION_PROMPT_TEMPLATE: &str = "\
Extract any tasks or events mentioned in the following text. Respond with
JSON only, in the shape:
{{\"tasks\": [{{\"title\": string, \"due_date\": string | null}}],
  \"events\": [{{\"title\": string, \"start_time\": string, \"end_time\": string | null, \"frequency\": string | null}}]}}
If nothing is found, respond with {{\"tasks\": [], \"events\": []}}.

Text:
{text}
";

const DEFAULT_PERSONA: &str =
    "You are MIST, a calm and direct personal knowledge assistant. Keep replies concise.";

pub fn load_persona(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|_| DEFAULT_PERSONA.to_string())
}

pub fn system_prompt(persona: &str, user_profile: &str, context: &str) -> String {
    SYSTEM_PROMPT_TEMPLATE
        .replace("{persona}", persona)
        .replace("{user_profile}", user_profile)
        .replace("{context}", context)
}

pub fn user_prompt(text: &str) -> String {
    USER_PROMPT_TEMPLATE.replace("{text}", text)
}

pub fn extraction_prompt(text: &str) -> String {
    EXTRACTION_PROMPT_TEMPLATE.replace("{text}", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_persona_falls_back_when_missing() {
        let persona = load_persona(Path::new("/nonexistent/persona.md"));
        assert_eq!(persona, DEFAULT_PERSONA);
    }

    #[test]
    fn system_prompt_substitutes_placeholders() {
        let prompt = system_prompt("calm", "profile", "context");
        assert!(prompt.contains("calm"));
        assert!(prompt.contains("profile"));
        assert!(prompt.contains("context"));
    }
}
