use std::sync::OnceLock;

use regex::{Captures, Regex};

fn weight_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // `1.5::cat::`; the text part is non-greedy so adjacent tokens stay separate.
        Regex::new(r"(?s)([0-9]+(?:\.[0-9]*)?|\.[0-9]+)::(.*?)::").expect("weight token pattern")
    })
}

/// Rewrites `weight::text::` tokens into natural-language emphasis for models
/// without a weighting primitive. Text outside tokens is copied through in
/// order; a token whose weight does not parse is left verbatim.
pub fn compile(prompt: &str) -> String {
    weight_token_pattern()
        .replace_all(prompt, |caps: &Captures<'_>| {
            let raw_weight = &caps[1];
            let text = &caps[2];
            match raw_weight.parse::<f64>() {
                Ok(weight) if weight.is_finite() => describe(weight, text),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Weight → descriptor table, first match wins.
pub fn describe(weight: f64, text: &str) -> String {
    if weight >= 2.0 {
        format!("extremely detailed, emphasized {text}")
    } else if weight >= 1.5 {
        format!("highly detailed, {text}")
    } else if weight >= 1.2 {
        format!("detailed, {text}")
    } else if weight >= 0.9 {
        text.to_string()
    } else if weight >= 0.8 {
        format!("subtle {text}")
    } else {
        format!("faint, slightly visible {text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let prompts = [
            "",
            "a fox in the snow",
            "silver hair, red eyes, 1girl",
            "ratio 16:9 and a::b",
            "no tokens :: here",
        ];
        for prompt in prompts {
            assert_eq!(compile(prompt), prompt);
        }
    }

    #[test]
    fn table_rows() {
        assert!(compile("1.5::cat::").contains("highly detailed, cat"));
        assert_eq!(
            compile("2.5::dragon::"),
            "extremely detailed, emphasized dragon"
        );
        assert_eq!(compile("2.0::dragon::"), "extremely detailed, emphasized dragon");
        assert_eq!(compile("1.2::moon::"), "detailed, moon");
        assert_eq!(compile("0.95::leaf::"), "leaf");
        assert_eq!(compile("1.0::leaf::"), "leaf");
        assert_eq!(compile("0.8::mist::"), "subtle mist");
        assert_eq!(compile("0.3::shadow::"), "faint, slightly visible shadow");
    }

    #[test]
    fn surrounding_text_is_kept_in_order() {
        let compiled = compile("portrait, 1.5::silver hair::, 0.5::background::, night");
        assert_eq!(
            compiled,
            "portrait, highly detailed, silver hair, faint, slightly visible background, night"
        );
    }

    #[test]
    fn malformed_weight_is_inert() {
        assert_eq!(compile("abc::thing::"), "abc::thing::");
        assert_eq!(
            compile("start abc::thing:: end 1.5::cat::"),
            "start abc::thing:: end highly detailed, cat"
        );
    }

    #[test]
    fn braced_tokens_keep_their_braces() {
        assert_eq!(compile("{1.50::tag::}"), "{highly detailed, tag}");
    }

    #[test]
    fn compile_is_stable_on_its_output() {
        let once = compile("2.5::dragon::, 0.3::shadow::");
        assert_eq!(compile(&once), once);
        assert!(!once.contains("::"));
    }
}
