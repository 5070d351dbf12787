//! Stage B — metadata rule.
//!
//! Cheap, deterministic classification from window/process metadata
//! alone, with no image data required. Runs before any ML stage and is
//! pure compute (§5).

use super::types::{clamp_confidence, DetectionClass, DetectionResult, StageSource};

/// Fixed keyword → class table. A keyword match with no entry here
/// collapses to [`DetectionClass::UnknownAi`].
fn class_for_keyword(keyword: &str) -> Option<DetectionClass> {
    match keyword {
        "chatgpt" | "openai" | "chat.openai.com" | "gpt" => Some(DetectionClass::ChatGpt),
        "claude" | "claude.ai" | "anthropic" => Some(DetectionClass::Claude),
        "bard" | "gemini" | "gemini.google.com" => Some(DetectionClass::Gemini),
        "copilot" | "github copilot" | "copilot.microsoft.com" => Some(DetectionClass::Copilot),
        "perplexity" | "perplexity.ai" => Some(DetectionClass::Perplexity),
        "deepseek" => Some(DetectionClass::DeepSeek),
        "poe" | "poe.com" => Some(DetectionClass::Poe),
        "grok" => Some(DetectionClass::Grok),
        "qwen" => Some(DetectionClass::Qwen),
        "mistral" | "mistral.ai" => Some(DetectionClass::Mistral),
        "meta.ai" | "meta ai" => Some(DetectionClass::MetaAi),
        _ => None,
    }
}

/// Evaluate the metadata rule against one observation's process/window/
/// URL hints.
///
/// `keywords` and `whitelist_keywords` come from the active
/// [`super::policy::DetectionPolicy`]. Matching is case-insensitive
/// substring search over the lower-cased concatenation of the three
/// optional fields.
pub fn evaluate(
    active_process_name: Option<&str>,
    active_window_title: Option<&str>,
    browser_hint_url: Option<&str>,
    keywords: &[String],
    whitelist_keywords: &[String],
) -> DetectionResult {
    let haystack = [active_process_name, active_window_title, browser_hint_url]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if whitelist_keywords
        .iter()
        .any(|term| haystack.contains(&term.to_lowercase()))
    {
        return DetectionResult::negative("Whitelist match");
    }

    let matches: Vec<&String> = keywords
        .iter()
        .filter(|k| haystack.contains(&k.to_lowercase()))
        .collect();

    if matches.is_empty() {
        return DetectionResult::negative("No keyword match");
    }

    let class = matches
        .iter()
        .find_map(|k| class_for_keyword(&k.to_lowercase()))
        .unwrap_or(DetectionClass::UnknownAi);

    let mut confidence = clamp_confidence((0.62 + 0.08 * matches.len() as f32).min(0.98));
    if browser_hint_url.is_some() {
        confidence = clamp_confidence(confidence + 0.08);
    }

    DetectionResult {
        is_ai_ui_detected: true,
        confidence,
        class,
        stage_source: StageSource::MetadataRule,
        reason: format!("Keyword match: {}", matches.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")),
        model_version: None,
        triggered_keywords: matches.into_iter().cloned().collect(),
        is_stable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_keywords() -> Vec<String> {
        vec!["chatgpt".into(), "bard".into(), "meta.ai".into()]
    }

    /// Seed scenario 5 (first half): keyword "ChatGPT" in title →
    /// class=ChatGpt, stage=MetadataRule, isAiUiDetected=true.
    #[test]
    fn test_seed_scenario_chatgpt_title_match() {
        let result = evaluate(
            None,
            Some("ChatGPT - New conversation"),
            None,
            &default_keywords(),
            &[],
        );
        assert!(result.is_ai_ui_detected);
        assert_eq!(result.class, DetectionClass::ChatGpt);
        assert_eq!(result.stage_source, StageSource::MetadataRule);
    }

    /// Seed scenario 5 (second half): whitelist term matching
    /// browserHintUrl → isAiUiDetected=false.
    #[test]
    fn test_seed_scenario_whitelist_suppresses() {
        let result = evaluate(
            None,
            Some("ChatGPT - New conversation"),
            Some("https://internal-helpdesk.local/chat"),
            &default_keywords(),
            &["internal-helpdesk.local".into()],
        );
        assert!(!result.is_ai_ui_detected);
        assert_eq!(result.reason, "Whitelist match");
    }

    #[test]
    fn test_no_match_is_negative() {
        let result = evaluate(
            Some("notepad.exe"),
            Some("Untitled - Notepad"),
            None,
            &default_keywords(),
            &[],
        );
        assert!(!result.is_ai_ui_detected);
    }

    #[test]
    fn test_unmapped_keyword_collapses_to_unknown_ai() {
        let result = evaluate(
            None,
            Some("some-ai-tool window"),
            None,
            &["some-ai-tool".into()],
            &[],
        );
        assert!(result.is_ai_ui_detected);
        assert_eq!(result.class, DetectionClass::UnknownAi);
    }

    #[test]
    fn test_url_hint_boosts_confidence() {
        let without_url = evaluate(None, Some("ChatGPT"), None, &default_keywords(), &[]);
        let with_url = evaluate(
            None,
            Some("ChatGPT"),
            Some("https://chat.openai.com"),
            &default_keywords(),
            &[],
        );
        assert!(with_url.confidence > without_url.confidence);
    }

    #[test]
    fn test_confidence_caps_at_0_98_without_url_hint() {
        let many_keywords: Vec<String> = (0..20).map(|i| format!("kw{i}")).collect();
        let title = many_keywords.join(" ");
        let result = evaluate(None, Some(&title), None, &many_keywords, &[]);
        assert!(result.confidence <= 0.98);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        let result = evaluate(None, Some("using CHATGPT now"), None, &default_keywords(), &[]);
        assert!(result.is_ai_ui_detected);
    }
}
