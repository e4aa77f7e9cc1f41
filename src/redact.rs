use std::collections::BTreeMap;

use serde_json::Value;

/// Literal token substituted for every configured secret.
pub const REDACTED: &str = "REDACTED";

/// Comma-separated list of secret literals to scrub from recordings.
pub const SECRETS_ENV_VAR: &str = "TEST_SERVER_SECRETS";

/// Replaces configured secret literals with [`REDACTED`] across every
/// surface that reaches a recording artifact.
///
/// Matching is case-sensitive and literal (no regex). Secrets apply in
/// list order; later secrets operate on the already-rewritten value.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Empty secrets are dropped; a stray `,,` in the environment list
    /// must not corrupt every recorded value.
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        Self {
            secrets: secrets
                .into_iter()
                .filter(|secret| !secret.is_empty())
                .collect(),
        }
    }

    /// Builds a redactor from the `TEST_SERVER_SECRETS` environment variable.
    pub fn from_env() -> Self {
        let secrets = std::env::var(SECRETS_ENV_VAR).unwrap_or_default();
        Self::new(secrets.split(',').map(str::to_owned))
    }

    pub fn redact_str(&self, s: &str) -> String {
        let mut redacted = s.to_owned();
        for secret in &self.secrets {
            redacted = redacted.replace(secret, REDACTED);
        }
        redacted
    }

    pub fn redact_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        let mut redacted = bytes.to_vec();
        for secret in &self.secrets {
            redacted = replace_bytes(&redacted, secret.as_bytes(), REDACTED.as_bytes());
        }
        redacted
    }

    /// Redacts every header value in place. Header names are untouched.
    pub fn redact_header_values(&self, headers: &mut BTreeMap<String, Vec<String>>) {
        for values in headers.values_mut() {
            for value in values {
                *value = self.redact_str(value);
            }
        }
    }

    /// Redacts every string leaf of a JSON value, recursing into objects
    /// and arrays. Non-string leaves are preserved.
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.redact_str(s),
            Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            Value::Object(map) => self.redact_map(map),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    pub fn redact_map(&self, map: &mut serde_json::Map<String, Value>) {
        for (_, nested) in map.iter_mut() {
            self.redact_value(nested);
        }
    }
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut idx = 0;
    while idx < haystack.len() {
        if haystack[idx..].starts_with(needle) {
            out.extend_from_slice(replacement);
            idx += needle.len();
        } else {
            out.push(haystack[idx]);
            idx += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{Value, json};

    use super::{REDACTED, Redactor};

    fn redactor(secrets: &[&str]) -> Redactor {
        Redactor::new(secrets.iter().map(|secret| (*secret).to_owned()))
    }

    #[test]
    fn redacts_every_occurrence_in_a_string() {
        let redactor = redactor(&["abc", "123"]);
        assert_eq!(
            redactor.redact_str("GET /path/abc?token=123&again=abc HTTP/1.1"),
            "GET /path/REDACTED?token=REDACTED&again=REDACTED HTTP/1.1"
        );
    }

    #[test]
    fn matching_is_case_sensitive() {
        let redactor = redactor(&["secret"]);
        assert_eq!(redactor.redact_str("Secret secret SECRET"), "Secret REDACTED SECRET");
    }

    #[test]
    fn empty_secret_list_is_a_noop() {
        let redactor = redactor(&[]);
        assert_eq!(redactor.redact_str("user=test"), "user=test");
        assert_eq!(redactor.redact_bytes(b"user=test"), b"user=test".to_vec());
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let redactor = redactor(&["", "abc"]);
        assert_eq!(redactor.redact_str("/path/abc"), "/path/REDACTED");
    }

    #[test]
    fn secrets_apply_in_list_order() {
        // The second secret matches text produced by the first rewrite.
        let redactor = redactor(&["pass", "REDACTEDword"]);
        assert_eq!(redactor.redact_str("password"), "REDACTED");
    }

    #[test]
    fn redaction_is_idempotent() {
        let redactor = redactor(&["abc", "123"]);
        let once = redactor.redact_str("key=abc&token=123");
        assert_eq!(redactor.redact_str(&once), once);

        let bytes_once = redactor.redact_bytes(b"key=abc&token=123");
        assert_eq!(redactor.redact_bytes(&bytes_once), bytes_once);
    }

    #[test]
    fn redacts_bytes_including_non_utf8_payloads() {
        let redactor = redactor(&["secret"]);
        let mut payload = vec![0x80, 0xff];
        payload.extend_from_slice(b"secret");
        payload.push(0x00);
        let mut expected = vec![0x80, 0xff];
        expected.extend_from_slice(b"REDACTED");
        expected.push(0x00);
        assert_eq!(redactor.redact_bytes(&payload), expected);
    }

    #[test]
    fn redacts_header_values_but_not_names() {
        let redactor = redactor(&["token-abc"]);
        let mut headers = BTreeMap::from([
            (
                "Authorization".to_owned(),
                vec!["Bearer token-abc".to_owned()],
            ),
            (
                "X-token-abc".to_owned(),
                vec!["safe".to_owned(), "token-abc".to_owned()],
            ),
        ]);
        redactor.redact_header_values(&mut headers);
        assert_eq!(headers["Authorization"], vec!["Bearer REDACTED"]);
        assert_eq!(headers["X-token-abc"], vec!["safe", "REDACTED"]);
    }

    #[test]
    fn redacts_string_leaves_of_nested_json() {
        let redactor = redactor(&["s3cr3t"]);
        let mut value = json!({
            "password": "s3cr3t",
            "count": 3,
            "flag": true,
            "nested": {"token": "prefix-s3cr3t"},
            "items": ["s3cr3t", 42, {"inner": "s3cr3t"}],
        });
        redactor.redact_value(&mut value);
        assert_eq!(
            value,
            json!({
                "password": REDACTED,
                "count": 3,
                "flag": true,
                "nested": {"token": format!("prefix-{REDACTED}")},
                "items": [REDACTED, 42, {"inner": REDACTED}],
            })
        );
    }

    #[test]
    fn non_string_leaves_are_preserved() {
        let redactor = redactor(&["42"]);
        let mut value = json!({"answer": 42, "text": "42"});
        redactor.redact_value(&mut value);
        assert_eq!(value, json!({"answer": 42, "text": REDACTED}));
        assert_eq!(value["answer"], Value::Number(42.into()));
    }
}
