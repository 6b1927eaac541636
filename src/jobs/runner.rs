use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Instant;

use crate::evaluation::{EvaluateResult, FailureReason, Outcome, Prompt, TokenUsage};

/// One (test case, prompt) pairing to execute.
#[derive(Debug, Clone)]
pub struct RunCase {
    pub prompt: Prompt,
    pub prompt_idx: usize,
    pub provider: String,
    pub test_case: Value,
    pub test_idx: usize,
}

impl RunCase {
    pub fn vars(&self) -> Map<String, Value> {
        self.test_case
            .get("vars")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// A result shell carrying this case's coordinates.
    pub fn result(&self, outcome: Outcome) -> EvaluateResult {
        let mut result = EvaluateResult::with_outcome(self.prompt_idx, self.test_idx, outcome);
        result.test_case = self.test_case.clone();
        result.prompt = json!({ "raw": self.prompt.raw, "label": self.prompt.display_label() });
        result.provider = json!({ "id": self.provider });
        result
    }

    /// An error-outcome result for a case the runner could not execute.
    pub fn error_result(&self, message: String) -> EvaluateResult {
        let mut result = self.result(Outcome::Error);
        result.error = Some(message);
        result
    }
}

/// Executes a single case against a provider.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, case: &RunCase) -> anyhow::Result<EvaluateResult>;
}

/// Substitutes `{{name}}` placeholders. Unknown names render empty.
pub fn render_template(template: &str, vars: &Map<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        match vars.get(after[..end].trim()) {
            Some(Value::String(s)) => out.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Runner for the built-in `echo` provider: the output is the rendered prompt.
/// `equals`, `contains` and `icontains` assertions on the test case are graded.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

pub const ECHO_PROVIDER: &str = "echo";

fn grade(assertion: &Value, output: &str) -> (bool, String) {
    let kind = assertion.get("type").and_then(Value::as_str).unwrap_or("");
    let expected = match assertion.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let pass = match kind {
        "equals" => output == expected,
        "contains" => output.contains(&expected),
        "icontains" => output.to_lowercase().contains(&expected.to_lowercase()),
        other => {
            return (false, format!("Unsupported assertion type: {}", other));
        }
    };
    let reason = if pass {
        "Assertion passed".to_string()
    } else {
        format!("Expected output to {} {:?}", kind, expected)
    };
    (pass, reason)
}

#[async_trait]
impl TestRunner for EchoRunner {
    async fn run(&self, case: &RunCase) -> anyhow::Result<EvaluateResult> {
        if case.provider != ECHO_PROVIDER {
            anyhow::bail!("No runner for provider {}", case.provider);
        }
        let started = Instant::now();
        let output = render_template(&case.prompt.raw, &case.vars());

        let assertions = case
            .test_case
            .get("assert")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let components: Vec<Value> = assertions
            .iter()
            .map(|a| {
                let (pass, reason) = grade(a, &output);
                json!({ "pass": pass, "score": if pass { 1.0 } else { 0.0 }, "reason": reason, "assertion": a })
            })
            .collect();
        let passed = components
            .iter()
            .filter(|c| c["pass"].as_bool().unwrap_or(false))
            .count();
        let success = passed == components.len();

        let mut result = case.result(if success { Outcome::Pass } else { Outcome::Fail });
        let score = if components.is_empty() {
            1.0
        } else {
            passed as f64 / components.len() as f64
        };
        result.score = score;
        if !success {
            result.failure_reason = FailureReason::Assert;
        }
        result.grading_result = (!components.is_empty()).then(|| {
            json!({
                "pass": success,
                "score": score,
                "componentResults": components,
            })
        });
        let tokens = output.split_whitespace().count() as u64;
        result.token_usage = TokenUsage {
            prompt: tokens,
            completion: tokens,
            total: tokens * 2,
            num_requests: 1,
            ..Default::default()
        };
        result.response = Some(json!({ "output": output }));
        result.latency_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}
