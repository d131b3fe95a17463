//! Normalizes raw model output into plain text that can be pasted back as if it
//! had been typed by hand.
//!
//! The pipeline is an ordered table of [`CleanStep`]s. One pass applies every
//! step in order; [`clean`] repeats passes until the text stops changing. Every
//! replacement removes characters (the only exception rewrites a lone `\r` to
//! `\n`), so the loop terminates, and the returned text is a fixed point:
//! `clean(clean(x)) == clean(x)`.

use once_cell::sync::Lazy;
use regex::Regex;

pub enum CleanStep {
    Replace {
        name: &'static str,
        pattern: Regex,
        replacement: &'static str,
    },
    Trim,
}

impl CleanStep {
    fn apply(&self, text: &str) -> String {
        match self {
            CleanStep::Replace {
                pattern,
                replacement,
                ..
            } => pattern.replace_all(text, *replacement).into_owned(),
            CleanStep::Trim => text.trim().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CleanStep::Replace { name, .. } => *name,
            CleanStep::Trim => "trim",
        }
    }
}

fn replace(name: &'static str, pattern: &str, replacement: &'static str) -> CleanStep {
    CleanStep::Replace {
        name,
        // Patterns are compile-time literals covered by the tests below.
        pattern: Regex::new(pattern).unwrap_or_else(|err| panic!("invalid clean rule {name}: {err}")),
        replacement,
    }
}

/// Boilerplate openers, matched case-insensitively at the very start.
const PREAMBLES: &[(&str, &str)] = &[
    ("preamble_here_is", r"(?i)^(?:here is|here's|here are)\b[^\n]*?[:：]\s*"),
    (
        "preamble_this_is_the",
        r"(?i)^this is the (?:translation|translated text|result|corrected text|correction|revised text|revised version|corrected version)[^\n]*?[:：]\s*",
    ),
    (
        "preamble_label",
        r"(?i)^(?:the )?(?:result|translation|correction|revision|output|answer)(?: is)?\s*[:：]\s*",
    ),
    (
        "preamble_text_label",
        r"(?i)^(?:translated|corrected|modified|revised|processed) (?:text|version)\s*[:：]\s*",
    ),
    ("preamble_short_label", r"(?i)^(?:revised|modified|corrected)\s*[:：]\s*"),
    (
        "preamble_ja_label",
        r"^(?:処理結果|翻訳結果|修正結果|校正結果|変換結果|結果|回答|翻訳|修正版|校正版|出力)\s*[:：]\s*",
    ),
    (
        "preamble_ja_text_label",
        r"^(?:修正|校正|翻訳|変換|処理)されたテキスト\s*[:：]\s*",
    ),
    ("preamble_ja_intro", r"^(?:以下が|以下は|これが)[^\n]*?(?:[:：]|です。)\s*"),
    ("preamble_ja_manner", r"^(?:以下のように|次のように|このように)[^\n]*?[:：]\s*"),
];

/// Boilerplate closers, matched case-insensitively on their own final line.
const POSTAMBLES: &[(&str, &str)] = &[
    (
        "postamble_en",
        r"(?i)(?:^|\n)[^\S\n]*(?:that's all|that's it|hope this helps|i hope this helps|let me know if you need (?:anything else|any further changes|more help))[.!]?\s*$",
    ),
    (
        "postamble_ja",
        r"(?:^|\n)[^\S\n]*(?:以上です|以上となります|以上になります|以上)[。.!！]?\s*$",
    ),
];

/// Opening/closing pairs unwrapped when they enclose the whole text.
const QUOTE_PAIRS: &[(char, char)] = &[
    ('"', '"'),
    ('“', '”'),
    ('「', '」'),
    ('『', '』'),
    ('\'', '\''),
    ('‘', '’'),
];

pub static PIPELINE: Lazy<Vec<CleanStep>> = Lazy::new(|| {
    let mut steps = vec![
        CleanStep::Trim,
        replace("heading_markers", r"(?m)^[^\S\n]*#{1,6}(?:[^\S\n]+|$)", ""),
        replace("code_fence", r"```[^`]*```", ""),
        replace("inline_code", r"`([^`\n]+)`", "${1}"),
        replace("bold_asterisk", r"\*\*([^*\n]+)\*\*", "${1}"),
        replace(
            "bold_underscore",
            r"(^|[^\p{L}\p{N}_])__([^_\n]+)__($|[^\p{L}\p{N}_])",
            "${1}${2}${3}",
        ),
        replace("italic_asterisk", r"\*([^*\s](?:[^*\n]*[^*\s])?)\*", "${1}"),
        replace(
            "italic_underscore",
            r"(^|[^\p{L}\p{N}_])_([^_\s](?:[^_\n]*[^_\s])?)_($|[^\p{L}\p{N}_])",
            "${1}${2}${3}",
        ),
        CleanStep::Trim,
    ];

    steps.extend(
        PREAMBLES
            .iter()
            .map(|(name, pattern)| replace(name, pattern, "")),
    );
    steps.extend(
        POSTAMBLES
            .iter()
            .map(|(name, pattern)| replace(name, pattern, "")),
    );
    steps.push(CleanStep::Trim);

    steps.extend(QUOTE_PAIRS.iter().map(|(open, close)| {
        let open = regex::escape(&open.to_string());
        let close = regex::escape(&close.to_string());
        replace("surrounding_quotes", &format!(r"(?s)^{open}([^{close}]*){close}$"), "${1}")
    }));

    steps.extend([
        replace("line_glyphs", r"(?m)^[^\S\n]*[→⇒➤▶►•・‣][^\S\n]*", ""),
        replace("carriage_returns", r"\r\n?", "\n"),
        replace("blank_lines", r"(?m)^[^\S\n]+$", ""),
        replace("repeated_newlines", r"\n{2,}", "\n"),
        CleanStep::Trim,
    ]);

    steps
});

fn apply_pass(text: &str) -> String {
    PIPELINE
        .iter()
        .fold(text.to_string(), |current, step| step.apply(&current))
}

/// Cleans raw LLM output. Deterministic and idempotent.
pub fn clean(raw: &str) -> String {
    let mut current = apply_pass(raw);
    loop {
        let next = apply_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str) -> &'static CleanStep {
        PIPELINE
            .iter()
            .find(|step| step.name() == name)
            .unwrap_or_else(|| panic!("missing step {name}"))
    }

    #[test]
    fn every_rule_compiles() {
        assert!(PIPELINE.len() > 20);
    }

    #[test]
    fn strips_translation_label() {
        assert_eq!(clean("Translation: Hello, world!"), "Hello, world!");
    }

    #[test]
    fn unwraps_emphasis() {
        assert_eq!(clean("**Hello** *world*"), "Hello world");
        assert_eq!(clean("__Hello__ _world_"), "Hello world");
    }

    #[test]
    fn unwraps_japanese_brackets() {
        assert_eq!(clean("「こんにちは」"), "こんにちは");
        assert_eq!(clean("『本』"), "本");
    }

    #[test]
    fn collapses_blank_lines_after_label() {
        assert_eq!(clean("Result:\n\nFoo\n\nBar\n"), "Foo\nBar");
    }

    #[test]
    fn heading_markers_need_a_space() {
        let rule = step("heading_markers");
        assert_eq!(rule.apply("## Title\nbody"), "Title\nbody");
        assert_eq!(rule.apply("#hashtag"), "#hashtag");
    }

    #[test]
    fn code_fences_are_removed_and_inline_code_unwrapped() {
        assert_eq!(clean("Use `cargo` here.\n```\nlet x = 1;\n```"), "Use cargo here.");
    }

    #[test]
    fn snake_case_is_not_treated_as_emphasis() {
        assert_eq!(clean("rename my_var_name please"), "rename my_var_name please");
        assert_eq!(clean("2 * 3 * 4"), "2 * 3 * 4");
    }

    #[test]
    fn preamble_catalogue_covers_japanese_labels() {
        assert_eq!(clean("翻訳結果：今日は晴れです。"), "今日は晴れです。");
        assert_eq!(clean("修正されたテキスト: 明日は雨になります。"), "明日は雨になります。");
        assert_eq!(clean("以下が翻訳です：\nGood morning"), "Good morning");
    }

    #[test]
    fn here_is_requires_a_colon() {
        assert_eq!(clean("Here is the corrected text:\nI went home."), "I went home.");
        assert_eq!(clean("Here is my house."), "Here is my house.");
    }

    #[test]
    fn postambles_only_match_their_own_line() {
        assert_eq!(clean("Bonjour\n\nHope this helps!"), "Bonjour");
        assert_eq!(clean("翻訳です\n以上です。"), "翻訳です");
        assert_eq!(clean("明日は雨になります"), "明日は雨になります");
    }

    #[test]
    fn quotes_unwrap_only_when_they_enclose_everything() {
        assert_eq!(clean("\"Hello\""), "Hello");
        assert_eq!(clean("“Hello”"), "Hello");
        assert_eq!(clean("\"a\" and \"b\""), "\"a\" and \"b\"");
        assert_eq!(clean("「a」と「b」"), "「a」と「b」");
    }

    #[test]
    fn line_glyphs_are_stripped() {
        assert_eq!(clean("→ first\n• second\n▶ third"), "first\nsecond\nthird");
    }

    #[test]
    fn carriage_returns_are_normalized() {
        assert_eq!(clean("one\r\n\r\ntwo\rthree"), "one\ntwo\nthree");
    }

    #[test]
    fn clean_is_idempotent() {
        let samples = [
            "Translation: Hello, world!",
            "**a *b* c**",
            "\"「nested」\"",
            "Result:\n\n  Foo  \n\n\nBar\n",
            "Here is the translation:\n\n> \"**Bonjour**\"\n\nHope this helps!",
            "***x***",
            "_a_ _b_ _c_",
            "```rust\nfn main() {}\n```",
            "以下が結果です。\n「テスト」\n以上です。",
            "   ",
        ];
        for sample in samples {
            let once = clean(sample);
            assert_eq!(clean(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn already_clean_text_is_untouched() {
        let text = "The quick brown fox jumps over the lazy dog.\nSecond line.";
        assert_eq!(clean(text), text);
    }
}
