//! Builds the instruction text sent to the model for each processing mode.
//! Everything here is pure and deterministic.

use std::fmt;

use thiserror::Error;

use crate::utils::{contains_cjk, contains_cyrillic, contains_hangul, contains_kana};

const OUTPUT_DIRECTIVE: &str = "Important:\n\
- Output only the result.\n\
- Do not use markdown.\n\
- Do not add titles or headings.\n\
- Do not add explanations or a preamble.\n\
- Keep the same format as the input.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingMode {
    Translation,
    Correction,
    CustomPreset(usize),
    /// An instruction applied to the captured selection.
    OnDemand(String),
    /// An instruction answered without any selection.
    FreeGeneration(String),
}

impl ProcessingMode {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingMode::Translation => "translation",
            ProcessingMode::Correction => "correction",
            ProcessingMode::CustomPreset(_) => "preset",
            ProcessingMode::OnDemand(_) => "on_demand",
            ProcessingMode::FreeGeneration(_) => "free_generation",
        }
    }
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::CustomPreset(index) => write!(f, "preset #{}", index + 1),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptConfig {
    pub language1: String,
    pub language2: String,
    /// Preset instruction bodies by index; `None` marks a disabled slot.
    pub presets: Vec<Option<String>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("preset #{} is not configured", .0 + 1)]
    UnknownPreset(usize),
    #[error("preset #{} is disabled", .0 + 1)]
    DisabledPreset(usize),
    #[error("instruction is empty")]
    EmptyInstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Script {
    Japanese,
    Chinese,
    Korean,
    Cyrillic,
    Latin,
}

fn detect_script(text: &str) -> Script {
    if contains_kana(text) {
        Script::Japanese
    } else if contains_hangul(text) {
        Script::Korean
    } else if contains_cjk(text) {
        Script::Chinese
    } else if contains_cyrillic(text) {
        Script::Cyrillic
    } else {
        Script::Latin
    }
}

fn script_of(code: &str) -> Script {
    match code.to_ascii_lowercase().as_str() {
        "ja" => Script::Japanese,
        "zh" => Script::Chinese,
        "ko" => Script::Korean,
        "ru" => Script::Cyrillic,
        _ => Script::Latin,
    }
}

/// Display name for an ISO-639-1 code; unknown codes pass through.
pub fn language_name(code: &str) -> String {
    let name = match code.to_ascii_lowercase().as_str() {
        "ja" => "Japanese",
        "en" => "English",
        "zh" => "Chinese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "it" => "Italian",
        "pt" => "Portuguese",
        "ru" => "Russian",
        _ => return code.to_string(),
    };
    name.to_string()
}

/// Picks `(source, target)` when the text's script identifies exactly one of
/// the configured languages. Kanji-only text counts as Japanese when the pair
/// has no Chinese entry.
fn resolve_direction<'a>(text: &str, language1: &'a str, language2: &'a str) -> Option<(&'a str, &'a str)> {
    let detected = detect_script(text);
    let (script1, script2) = (script_of(language1), script_of(language2));

    let matches = |script: Script| {
        script == detected
            || (detected == Script::Chinese
                && script == Script::Japanese
                && script1 != Script::Chinese
                && script2 != Script::Chinese)
    };

    match (matches(script1), matches(script2)) {
        (true, false) => Some((language1, language2)),
        (false, true) => Some((language2, language1)),
        _ => None,
    }
}

fn translation_prompt(text: &str, config: &PromptConfig) -> String {
    match resolve_direction(text, &config.language1, &config.language2) {
        Some((source, target)) => {
            let source = language_name(source);
            let target = language_name(target);
            format!(
                "Translate the following {source} text into {target}.\n\
                 Use natural, fluent {target} that keeps the meaning and tone of the original.\n\
                 Output only the {target} translation, without explanations.\n\n\
                 Text:\n{text}"
            )
        }
        None => {
            let first = language_name(&config.language1);
            let second = language_name(&config.language2);
            format!(
                "You are a skilled translator. Identify the language of the text below and translate it.\n\
                 - Configured languages: {first} <-> {second}\n\
                 - If the text is in {first}, translate it into {second}.\n\
                 - If the text is in {second}, translate it into {first}.\n\
                 - Keep the meaning and tone of the original.\n\
                 - Output only the translation, without explanations.\n\n\
                 Text:\n{text}"
            )
        }
    }
}

fn correction_prompt(text: &str) -> String {
    format!(
        "Proofread the following text. Fix grammar, spelling, wrong kanji conversions and awkward phrasing \
         while preserving the original meaning and language.\n\
         If the text needs no changes, output it exactly as it is.\n\
         Output only the corrected text, without explanations.\n\n\
         Text:\n{text}"
    )
}

fn instruction_prompt(instruction: &str, text: Option<&str>) -> Result<String, PromptError> {
    let instruction = instruction.trim();
    if instruction.is_empty() {
        return Err(PromptError::EmptyInstruction);
    }

    Ok(match text {
        Some(text) => format!("{instruction}\n\nText:\n{text}\n\n{OUTPUT_DIRECTIVE}"),
        None => format!("{instruction}\n\n{OUTPUT_DIRECTIVE}"),
    })
}

pub fn build_prompt(mode: &ProcessingMode, text: &str, config: &PromptConfig) -> Result<String, PromptError> {
    match mode {
        ProcessingMode::Translation => Ok(translation_prompt(text, config)),
        ProcessingMode::Correction => Ok(correction_prompt(text)),
        ProcessingMode::CustomPreset(index) => {
            let preset = config
                .presets
                .get(*index)
                .ok_or(PromptError::UnknownPreset(*index))?
                .as_deref()
                .ok_or(PromptError::DisabledPreset(*index))?;
            instruction_prompt(preset, Some(text))
        }
        ProcessingMode::OnDemand(instruction) => instruction_prompt(instruction, Some(text)),
        ProcessingMode::FreeGeneration(instruction) => instruction_prompt(instruction, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(language1: &str, language2: &str) -> PromptConfig {
        PromptConfig {
            language1: language1.to_string(),
            language2: language2.to_string(),
            presets: vec![Some("Summarize in one sentence.".to_string()), None],
        }
    }

    #[test]
    fn latin_text_translates_into_the_other_language() {
        let prompt = build_prompt(&ProcessingMode::Translation, "Good morning", &config("ja", "en")).unwrap();
        assert!(prompt.contains("into Japanese"));
        assert!(!prompt.contains("into English"));
        assert!(prompt.ends_with("Good morning"));
    }

    #[test]
    fn japanese_text_translates_into_english() {
        let prompt = build_prompt(&ProcessingMode::Translation, "おはようございます", &config("ja", "en")).unwrap();
        assert!(prompt.contains("Translate the following Japanese text into English."));
    }

    #[test]
    fn kanji_only_text_counts_as_japanese_without_chinese_configured() {
        let prompt = build_prompt(&ProcessingMode::Translation, "東京都", &config("en", "ja")).unwrap();
        assert!(prompt.contains("into English"));

        let prompt = build_prompt(&ProcessingMode::Translation, "东京", &config("zh", "ja")).unwrap();
        assert!(prompt.contains("Translate the following Chinese text into Japanese."));
    }

    #[test]
    fn latin_text_with_corner_brackets_stays_latin() {
        let prompt = build_prompt(&ProcessingMode::Translation, "Hello「world」", &config("ja", "en")).unwrap();
        assert!(prompt.contains("Translate the following English text into Japanese."));
    }

    #[test]
    fn undecidable_pairs_fall_back_to_bidirectional_prompt() {
        let prompt = build_prompt(&ProcessingMode::Translation, "Bonjour", &config("fr", "de")).unwrap();
        assert!(prompt.contains("Configured languages: French <-> German"));
        assert!(prompt.contains("If the text is in German, translate it into French."));
    }

    #[test]
    fn unknown_language_codes_are_used_verbatim() {
        assert_eq!(language_name("EN"), "English");
        assert_eq!(language_name("nl"), "nl");
    }

    #[test]
    fn correction_allows_unchanged_output() {
        let prompt = build_prompt(&ProcessingMode::Correction, "teh cat", &config("ja", "en")).unwrap();
        assert!(prompt.contains("output it exactly as it is"));
        assert!(prompt.ends_with("teh cat"));
    }

    #[test]
    fn presets_embed_instruction_text_and_directive() {
        let prompt = build_prompt(&ProcessingMode::CustomPreset(0), "long text", &config("ja", "en")).unwrap();
        assert!(prompt.starts_with("Summarize in one sentence."));
        assert!(prompt.contains("Text:\nlong text"));
        assert!(prompt.ends_with("Keep the same format as the input."));
    }

    #[test]
    fn preset_lookup_errors() {
        let cfg = config("ja", "en");
        assert_eq!(
            build_prompt(&ProcessingMode::CustomPreset(1), "x", &cfg),
            Err(PromptError::DisabledPreset(1))
        );
        assert_eq!(
            build_prompt(&ProcessingMode::CustomPreset(5), "x", &cfg),
            Err(PromptError::UnknownPreset(5))
        );
    }

    #[test]
    fn free_generation_omits_input_section() {
        let prompt = build_prompt(
            &ProcessingMode::FreeGeneration("Write a haiku about rain".to_string()),
            "",
            &config("ja", "en"),
        )
        .unwrap();
        assert!(!prompt.contains("Text:"));
        assert!(prompt.contains("Do not use markdown."));

        assert_eq!(
            build_prompt(&ProcessingMode::OnDemand("   ".to_string()), "x", &config("ja", "en")),
            Err(PromptError::EmptyInstruction)
        );
    }
}
