use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use super::{CompletedPrompt, Prompt, UnifiedConfig};

const SEQUENCE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// `len` random lowercase alphanumerics.
pub fn random_sequence(len: usize) -> String {
    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in uuid::Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(SEQUENCE_ALPHABET[*byte as usize % SEQUENCE_ALPHABET.len()] as char);
        }
    }
    out
}

/// `eval-<3 random chars>-<ISO-8601 timestamp truncated to seconds>`.
pub fn create_eval_id(created_at: DateTime<Utc>) -> String {
    format!(
        "eval-{}-{}",
        random_sequence(3),
        created_at.format("%Y-%m-%dT%H:%M:%S")
    )
}

fn prompt_id(explicit: Option<&str>, label: &str, raw: &str) -> String {
    match explicit.filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => {
            let label = if label.is_empty() { raw } else { label };
            sha256_hex(&format!("{}:{}", label, raw))
        }
    }
}

/// Prompt ids are the explicit id when one is set, otherwise a hash of the label and raw text.
pub fn hash_prompt(prompt: &Prompt) -> String {
    prompt_id(prompt.id.as_deref(), prompt.display_label(), &prompt.raw)
}

/// Same id rule for a prompt that has already been run.
pub fn hash_completed_prompt(prompt: &CompletedPrompt) -> String {
    prompt_id(prompt.id.as_deref(), &prompt.label, &prompt.raw)
}

/// Content hash of the serialized test-case array.
pub fn dataset_id(config: &UnifiedConfig) -> String {
    let tests = config
        .tests
        .clone()
        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
    sha256_hex(&tests.to_string())
}

pub fn tag_id(key: &str, value: &str) -> String {
    sha256_hex(&format!("{}:{}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_eval_id_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let id = create_eval_id(at);
        assert!(id.starts_with("eval-"));
        assert!(id.ends_with("-2024-03-05T14:07:09"));
        let random = &id[5..8];
        assert_eq!(random.len(), 3);
        assert!(random.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_dataset_id_is_content_hash() {
        let a = UnifiedConfig {
            tests: Some(json!([{"vars": {"x": 1}}])),
            ..Default::default()
        };
        let b = a.clone();
        let empty = UnifiedConfig::default();
        assert_eq!(dataset_id(&a), dataset_id(&b));
        assert_ne!(dataset_id(&a), dataset_id(&empty));
        assert_eq!(dataset_id(&empty), sha256_hex("[]"));
    }

    #[test]
    fn test_prompt_hash_prefers_explicit_id() {
        let mut prompt = Prompt::new("Hello {{name}}", "greeting");
        let hashed = hash_prompt(&prompt);
        assert_eq!(hashed.len(), 64);
        prompt.id = Some("custom".to_string());
        assert_eq!(hash_prompt(&prompt), "custom");
    }

    #[test]
    fn test_prompt_id_survives_the_run() {
        let mut prompt = Prompt::new("Hello {{name}}", "");
        let mut completed = CompletedPrompt::from_prompt(&prompt, "echo");
        completed.id = None;
        assert_eq!(hash_completed_prompt(&completed), hash_prompt(&prompt));

        prompt.label = "greeting".to_string();
        let mut completed = CompletedPrompt::from_prompt(&prompt, "echo");
        completed.id = Some(String::new());
        assert_eq!(hash_completed_prompt(&completed), hash_prompt(&prompt));
    }

    #[test]
    fn test_tag_id() {
        assert_eq!(tag_id("env", "prod"), sha256_hex("env:prod"));
    }
}
