//! OCR text cleanup and tokenization.

use jieba_rs::Jieba;
use once_cell::sync::Lazy;

/// Cleaned text is cut to this many characters.
pub const MAX_CLEAN_CHARS: usize = 2000;

const MIN_WORD_CHARS: usize = 2;
const MAX_WORD_CHARS: usize = 25;
const MAX_DIGIT_RUN: usize = 10;

static JIEBA: Lazy<Jieba> = Lazy::new(Jieba::new);

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_kept_char(c: char) -> bool {
    is_word_char(c) || c.is_whitespace() || "-.,!?;:()\"'/".contains(c)
}

/// Strip OCR artifacts: stray symbols, stuttered characters and tokens that
/// are too short, too long or contain no letters.
pub fn clean_ocr_text(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }

    let replaced: String = raw
        .chars()
        .map(|c| if is_kept_char(c) { c } else { ' ' })
        .collect();

    let mut cleaned_words: Vec<String> = Vec::new();
    for word in replaced.split_whitespace() {
        let word = squeeze_repeats(word);
        let len = word.chars().count();
        if !(MIN_WORD_CHARS..=MAX_WORD_CHARS).contains(&len) {
            continue;
        }
        if len > MAX_DIGIT_RUN && word.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if !word.chars().any(char::is_alphabetic) {
            continue;
        }
        cleaned_words.push(word);
    }

    cleaned_words.join(" ").chars().take(MAX_CLEAN_CHARS).collect()
}

/// Runs of four or more identical word characters shrink to two.
fn squeeze_repeats(word: &str) -> String {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let keep = if is_word_char(c) && run >= 4 { 2 } else { run };
        out.extend(std::iter::repeat(c).take(keep));
        i += run;
    }
    out
}

pub(crate) fn is_cjk(ch: char) -> bool {
    let code = ch as u32;
    matches!(
        code,
        0x4E00..=0x9FFF        // CJK Unified Ideographs
        | 0x3400..=0x4DBF      // Extension A
        | 0x20000..=0x2A6DF    // Extension B
        | 0x2A700..=0x2B73F    // Extension C
        | 0x2B740..=0x2B81F    // Extension D
        | 0x2B820..=0x2CEAF    // Extension E/F
        | 0xF900..=0xFAFF      // Compatibility Ideographs
        | 0x2F800..=0x2FA1F    // Compatibility Ideographs Supplement
    )
}

/// Lowercased word tokens (jieba segmentation), repeats preserved.
/// Single ASCII characters and pure punctuation are dropped; single CJK
/// characters are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    JIEBA
        .cut(text, false)
        .into_iter()
        .filter_map(|token| {
            let normalized = token
                .trim_matches(|c: char| !c.is_alphanumeric() && !is_cjk(c))
                .to_lowercase();
            if normalized.is_empty() {
                return None;
            }
            if !normalized.chars().any(|c| c.is_alphanumeric() || is_cjk(c)) {
                return None;
            }
            let mut chars = normalized.chars();
            if let (Some(only), None) = (chars.next(), chars.next()) {
                if only.is_ascii() {
                    return None;
                }
            }
            Some(normalized)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_drops_artifacts() {
        assert_eq!(clean_ocr_text(""), "");
        assert_eq!(clean_ocr_text("   \n "), "");
        assert_eq!(
            clean_ocr_text("Invoice  #2024 ©©© total: $40"),
            "Invoice total:"
        );
    }

    #[test]
    fn test_clean_squeezes_repeats() {
        assert_eq!(clean_ocr_text("Heeeeello wooorld"), "Heello wooorld");
    }

    #[test]
    fn test_clean_filters_word_lengths() {
        let long = "a".repeat(30);
        let text = format!("x ok {} 123456789012345 abc123", long);
        // the 30-char run squeezes to "aa", which then passes the length check
        assert_eq!(clean_ocr_text(&text), "ok aa abc123");
    }

    #[test]
    fn test_clean_truncates() {
        let text = "word ".repeat(1000);
        assert_eq!(clean_ocr_text(&text).chars().count(), MAX_CLEAN_CHARS);
    }

    #[test]
    fn test_tokenize_mixed_text() {
        let tokens = tokenize("Open the Invoice, 发票 a");
        assert!(tokens.contains(&"invoice".to_string()));
        assert!(tokens.contains(&"open".to_string()));
        assert!(tokens.iter().any(|t| t.contains('发')));
        assert!(!tokens.contains(&"a".to_string()));
        assert!(!tokens.iter().any(|t| t == ","));
    }
}
