use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since Unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Checks if a character is a CJK (Chinese, Japanese, Korean) ideograph.
/// CJK punctuation (U+3000..U+303F) is left out: corner brackets and
/// ideographic full stops turn up in Latin text too.
pub fn is_cjk(ch: char) -> bool {
    matches!(
        ch as u32,
        0x3400..=0x4DBF
            | 0x4E00..=0x9FFF
            | 0xF900..=0xFAFF
            | 0x20000..=0x2A6DF
            | 0x2A700..=0x2B73F
            | 0x2B740..=0x2B81F
            | 0x2B820..=0x2CEAF
            | 0x2CEB0..=0x2EBEF
    )
}

/// Hiragana or katakana.
pub fn is_kana(ch: char) -> bool {
    matches!(ch as u32, 0x3040..=0x309F | 0x30A0..=0x30FF | 0x31F0..=0x31FF | 0xFF66..=0xFF9F)
}

pub fn is_hangul(ch: char) -> bool {
    matches!(ch as u32, 0x1100..=0x11FF | 0x3130..=0x318F | 0xAC00..=0xD7AF)
}

pub fn is_cyrillic(ch: char) -> bool {
    matches!(ch as u32, 0x0400..=0x04FF | 0x0500..=0x052F)
}

/// Checks if text contains any CJK characters.
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

pub fn contains_kana(text: &str) -> bool {
    text.chars().any(is_kana)
}

pub fn contains_hangul(text: &str) -> bool {
    text.chars().any(is_hangul)
}

pub fn contains_cyrillic(text: &str) -> bool {
    text.chars().any(is_cyrillic)
}

/// Runs `attempt` for each candidate in order and returns the first success.
/// When every candidate fails (or there are none) `fallback` runs once and its
/// result is returned. Candidate errors are handed to `on_failure` so callers
/// can log them without aborting the chain.
pub async fn try_in_order<C, T, E, A, AFut, G, GFut>(
    candidates: impl IntoIterator<Item = C>,
    mut attempt: A,
    mut on_failure: impl FnMut(&C, &E),
    fallback: G,
) -> Result<(Option<C>, T), E>
where
    C: Clone,
    A: FnMut(C) -> AFut,
    AFut: Future<Output = Result<T, E>>,
    G: FnOnce() -> GFut,
    GFut: Future<Output = Result<T, E>>,
{
    for candidate in candidates {
        match attempt(candidate.clone()).await {
            Ok(value) => return Ok((Some(candidate), value)),
            Err(err) => on_failure(&candidate, &err),
        }
    }

    fallback().await.map(|value| (None, value))
}

/// Shortens `text` to at most `max_chars` characters for log previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_detection_distinguishes_kana_from_han() {
        assert!(contains_kana("これはテスト"));
        assert!(!contains_kana("这是测试"));
        assert!(contains_cjk("这是测试"));
        assert!(contains_hangul("안녕하세요"));
        assert!(contains_cyrillic("Привет"));
        assert!(!contains_cjk("plain latin text"));
    }

    #[test]
    fn cjk_punctuation_alone_is_not_cjk_text() {
        assert!(!contains_cjk("Hello「world」。"));
        assert!(contains_cjk("「世界」"));
    }

    #[test]
    fn preview_truncates_on_char_boundaries() {
        assert_eq!(preview("こんにちは世界", 5), "こんにちは...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn try_in_order_stops_at_first_success() {
        let mut attempted = Vec::new();
        let mut failures = Vec::new();
        let result: Result<(Option<u8>, &str), String> = try_in_order(
            [1_u8, 2, 3],
            |candidate| {
                attempted.push(candidate);
                async move {
                    if candidate == 2 {
                        Ok("second")
                    } else {
                        Err(format!("candidate {candidate} failed"))
                    }
                }
            },
            |candidate, err| failures.push((*candidate, err.clone())),
            || async { Ok("fallback") },
        )
        .await;

        assert_eq!(result, Ok((Some(2), "second")));
        assert_eq!(attempted, vec![1, 2]);
        assert_eq!(failures, vec![(1, "candidate 1 failed".to_string())]);
    }

    #[tokio::test]
    async fn try_in_order_runs_fallback_when_exhausted() {
        let result: Result<(Option<u8>, &str), String> = try_in_order(
            [1_u8, 2],
            |_| async { Err("nope".to_string()) },
            |_, _| {},
            || async { Ok("fallback") },
        )
        .await;

        assert_eq!(result, Ok((None, "fallback")));

        let empty: Result<(Option<u8>, &str), String> = try_in_order(
            Vec::<u8>::new(),
            |_| async { Ok("unreachable") },
            |_, _| {},
            || async { Err("generic failed".to_string()) },
        )
        .await;
        assert_eq!(empty, Err("generic failed".to_string()));
    }
}
