//! Extraction of a JSON object from raw model output.

use once_cell::sync::Lazy;
use regex::Regex;

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^\s*```(?:json)?\s*(.*?)\s*```\s*$").expect("valid fence regex")
});

/// Best-effort extraction of the JSON body from a model reply:
/// 1. unwrap a ```json fenced block when the whole reply is one;
/// 2. otherwise brace-match from the first `{`, honoring string literals
///    and escapes, and return the balanced object;
/// 3. fall back to the trimmed input (the caller's parse will fail and
///    trigger repair).
pub fn extract_json(raw: &str) -> String {
    let s = raw.trim();

    if let Some(captures) = CODE_FENCE.captures(s) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim().to_string();
        }
    }

    let Some(start) = s.find('{') else {
        return s.to_string();
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in s[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + ch.len_utf8();
                    return s[start..end].trim().to_string();
                }
            }
            _ => {}
        }
    }

    // No balanced close; hand back what we have.
    s[start..].trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object_passes_through() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn markdown_fence_is_unwrapped() {
        let raw = "```json\n{\"text\": \"你好\"}\n```";
        assert_eq!(extract_json(raw), "{\"text\": \"你好\"}");
    }

    #[test]
    fn leading_and_trailing_noise_is_stripped() {
        let raw = "好的，以下是结果：{\"a\": {\"b\": 2}} 希望有帮助";
        assert_eq!(extract_json(raw), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_matching() {
        let raw = r#"noise {"text": "一个 } 括号 \" 和 { 引号", "n": 1} tail"#;
        let extracted = extract_json(raw);
        let value: serde_json::Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn unbalanced_input_returns_tail() {
        assert_eq!(extract_json("prefix {\"a\": 1"), "{\"a\": 1");
        assert_eq!(extract_json("no json here"), "no json here");
    }
}
