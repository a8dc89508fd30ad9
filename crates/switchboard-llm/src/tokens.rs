//! Offline token estimation, one strategy per provider.

use regex::Regex;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

use switchboard_types::PlatformKey;

/// Fixed per-request overhead added to the BPE count.
const BPE_OVERHEAD: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCounter {
    /// cl100k_base byte-pair encoding plus a fixed overhead.
    Bpe,
    /// Word / CJK character / digit / other-character classification.
    CharClass,
    /// `single_byte * 1.3 + cjk` weighted estimate.
    Weighted,
}

impl TokenCounter {
    /// The estimator each provider's adapter reports through `count_tokens`.
    pub fn for_platform(key: PlatformKey) -> Self {
        match key {
            PlatformKey::OpenAi => TokenCounter::Bpe,
            PlatformKey::Qwen => TokenCounter::CharClass,
            PlatformKey::Wenxin => TokenCounter::Weighted,
        }
    }

    pub fn count(self, text: &str) -> usize {
        match self {
            TokenCounter::Bpe => bpe_count(text),
            TokenCounter::CharClass => char_class_count(text),
            TokenCounter::Weighted => weighted_count(text),
        }
    }
}

fn cl100k() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "cl100k_base unavailable, using length estimate");
                None
            }
        })
        .as_ref()
}

fn bpe_count(text: &str) -> usize {
    match cl100k() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() + BPE_OVERHEAD,
        None => text.chars().count(),
    }
}

fn char_class_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([a-zA-Z]+)|([\x{4e00}-\x{9fa5}])|([0-9])|(.)")
            .expect("static token regex is valid")
    })
}

fn char_class_count(text: &str) -> usize {
    char_class_regex()
        .captures_iter(text)
        .map(|caps| match caps.get(4) {
            // Characters outside the BMP count once per UTF-16 unit.
            Some(other) => {
                if other.as_str().trim().is_empty() {
                    0
                } else {
                    other.as_str().chars().map(char::len_utf16).sum()
                }
            }
            None => 1,
        })
        .sum()
}

fn is_cjk_unit(unit: u16) -> bool {
    (0x4e00..=0x9fa5).contains(&unit)
}

fn weighted_count(text: &str) -> usize {
    let (mut single_byte, mut chinese) = (0usize, 0usize);
    for unit in text.encode_utf16() {
        if is_cjk_unit(unit) {
            chinese += 1;
        } else {
            single_byte += 1;
        }
    }
    let estimate = single_byte as f64 * 1.3 + chinese as f64;
    estimate.round() as usize
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
