use super::weights::compile;

pub const STYLE_POSITIVE: &str =
    "masterpiece, best quality, highly detailed, sharp focus, cinematic lighting, coherent composition";
pub const STYLE_NEGATIVE: &str =
    "blurry, low quality, distorted anatomy, extra limbs, watermark, text artifacts, jpeg artifacts";

/// Weight attached to the critique fixes.
pub const CRITIQUE_WEIGHT: f64 = 1.5;
/// Weight attached to the suggested style tags.
pub const STYLE_TAG_WEIGHT: f64 = 1.2;

/// Composes the refinement prompt (still in weight syntax).
///
/// Advisory text is stripped of `::` so it cannot open or close a weight
/// token of its own.
pub fn compose_refined_prompt(original: &str, critique: &str, style_tags: &str) -> String {
    let mut sections = vec![original.trim().to_string(), STYLE_POSITIVE.to_string()];
    let critique = sanitize_advisory(critique);
    if !critique.is_empty() {
        sections.push(format!("{CRITIQUE_WEIGHT:.1}::{critique}::"));
    }
    let style_tags = sanitize_advisory(style_tags);
    if !style_tags.is_empty() {
        sections.push(format!("{STYLE_TAG_WEIGHT:.1}::{style_tags}::"));
    }
    let positive = sections
        .into_iter()
        .filter(|section| !section.is_empty())
        .collect::<Vec<String>>()
        .join(", ");
    format!("{positive}. Avoid: {STYLE_NEGATIVE}")
}

/// [`compose_refined_prompt`] passed through the weight compiler.
pub fn compile_refined_prompt(original: &str, critique: &str, style_tags: &str) -> String {
    compile(&compose_refined_prompt(original, critique, style_tags))
}

fn sanitize_advisory(text: &str) -> String {
    text.replace("::", " ")
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .trim_matches(|ch: char| ch == ',' || ch == '.' || ch.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_prompt_carries_all_fragments_in_order() {
        let composed = compose_refined_prompt(
            "a fox",
            "fix the paws, brighten the eyes, add rim light",
            "ukiyo-e, hokusai, woodblock, muted palette, grain",
        );
        let fox = composed.find("a fox").unwrap_or(usize::MAX);
        let positive = composed.find(STYLE_POSITIVE).unwrap_or(usize::MAX);
        let critique = composed.find("1.5::fix the paws").unwrap_or(usize::MAX);
        let tags = composed.find("1.2::ukiyo-e").unwrap_or(usize::MAX);
        let avoid = composed.find("Avoid: blurry").unwrap_or(usize::MAX);
        assert!(fox < positive);
        assert!(positive < critique);
        assert!(critique < tags);
        assert!(tags < avoid);
        assert!(avoid < composed.len());
    }

    #[test]
    fn compiled_prompt_uses_descriptors() {
        let compiled = compile_refined_prompt("a fox", "fix the paws", "ukiyo-e");
        assert!(compiled.contains("highly detailed, fix the paws"));
        assert!(compiled.contains("detailed, ukiyo-e"));
        assert!(!compiled.contains("::"));
    }

    #[test]
    fn advisory_delimiters_are_neutralised() {
        let composed = compose_refined_prompt("a fox", "2.0::shout:: louder", "");
        assert!(composed.contains("1.5::2.0 shout louder::"));
        assert!(!composed.contains("1.2::"));
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let a = compose_refined_prompt("a fox", "x, y, z", "a, b");
        let b = compose_refined_prompt("a fox", "x, y, z", "a, b");
        assert_eq!(a, b);
    }
}
