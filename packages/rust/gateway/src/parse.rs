//! Turning raw model text into a JSON document.

use serde_json::Value;

/// Remove a surrounding Markdown code fence (```json ... ```), if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }

    // Drop the opening fence line (which may carry a language tag).
    let body = match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => return "",
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse model text as JSON after fence stripping. `None` when it is not JSON.
pub fn parse_json_document(text: &str) -> Option<Value> {
    serde_json::from_str(strip_code_fence(text)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_passes_through() {
        assert_eq!(parse_json_document(" {\"a\": 1} \n"), Some(json!({"a": 1})));
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let text = "```json\n{\"materials\": [\"steel\"]}\n```";
        assert_eq!(
            parse_json_document(text),
            Some(json!({"materials": ["steel"]}))
        );
        assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
    }

    #[test]
    fn unterminated_fence_still_parses() {
        assert_eq!(parse_json_document("```json\n{\"a\": true}"), Some(json!({"a": true})));
    }

    #[test]
    fn prose_is_not_json() {
        assert_eq!(parse_json_document("Sure! Here is the profile:"), None);
        assert_eq!(parse_json_document("```"), None);
    }
}
