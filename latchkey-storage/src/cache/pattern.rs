//! Glob-style key patterns with Redis `KEYS` semantics.
//!
//! Supported syntax: `*` (any run), `?` (one character), `[abc]`, `[^abc]`,
//! `[a-z]` and `\` to escape the next character.

use latchkey_core::CacheError;
use regex::Regex;

/// A compiled key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    /// `None` for the match-everything pattern
    regex: Option<Regex>,
}

impl KeyPattern {
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        if pattern == "*" {
            return Ok(Self::any());
        }
        let translated = translate(pattern)?;
        let regex = Regex::new(&translated).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex: Some(regex),
        })
    }

    /// Pattern that matches every key.
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            regex: None,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.as_ref().map_or(true, |re| re.is_match(key))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> Result<String, CacheError> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("^(?s:");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                None => out.push_str(&regex::escape("\\")),
            },
            '[' => {
                let mut class = String::from("[");
                if chars.peek() == Some(&'^') {
                    chars.next();
                    class.push('^');
                }
                let mut closed = false;
                let mut first = true;
                while let Some(inner) = chars.next() {
                    match inner {
                        ']' if !first => {
                            closed = true;
                            break;
                        }
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                class.push_str(&regex::escape(&escaped.to_string()));
                            }
                        }
                        '[' | '&' | '~' | '-' if first => {
                            class.push('\\');
                            class.push(inner);
                        }
                        '[' | '&' | '~' | ']' => {
                            class.push('\\');
                            class.push(inner);
                        }
                        other => class.push(other),
                    }
                    first = false;
                }
                if !closed {
                    return Err(CacheError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "unterminated character class".to_string(),
                    });
                }
                class.push(']');
                out.push_str(&class);
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push_str(")$");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn matches(pattern: &str, key: &str) -> bool {
        KeyPattern::new(pattern).unwrap().matches(key)
    }

    #[test]
    fn test_star_and_question() {
        assert!(matches("user:*", "user:42"));
        assert!(matches("user:*", "user:"));
        assert!(!matches("user:*", "users:42"));
        assert!(matches("h?llo", "hello"));
        assert!(!matches("h?llo", "heello"));
    }

    #[test]
    fn test_character_classes() {
        assert!(matches("grade:[0-9]", "grade:7"));
        assert!(!matches("grade:[0-9]", "grade:x"));
        assert!(matches("grade:[^0-9]", "grade:x"));
        assert!(matches("h[ae]llo", "hallo"));
        assert!(!matches("h[ae]llo", "hillo"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("cost$(*)", "cost$(12)"));
        assert!(matches(r"lit\*", "lit*"));
        assert!(!matches(r"lit\*", "litx"));
    }

    #[test]
    fn test_unterminated_class_is_rejected() {
        assert!(matches!(
            KeyPattern::new("bad[abc"),
            Err(CacheError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_any_matches_everything() {
        let any = KeyPattern::any();
        assert!(any.matches(""));
        assert!(any.matches("line\nbreak"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_literal_keys_match_themselves(key in "[a-zA-Z0-9:._-]{0,24}") {
            prop_assert!(matches(&key, &key));
        }

        #[test]
        fn prop_prefix_star_matches_extensions(prefix in "[a-z:]{1,12}", rest in "[a-z0-9]{0,12}") {
            let pattern = format!("{}*", prefix);
            let key = format!("{}{}", prefix, rest);
            prop_assert!(matches(&pattern, &key));
        }
    }
}
