//! Comparison keys for OCR text.
//!
//! Keys are only used for matching; the original line text is what
//! downstream consumers see.

use std::collections::BTreeSet;

use unicode_normalization::UnicodeNormalization;

/// Thai sara am written as nikhahit + sara aa, a common OCR split.
const SPLIT_SARA_AM: &str = "\u{0E4D}\u{0E32}";
const SARA_AM: &str = "\u{0E33}";

/// Marks OCR drops or invents: Thai maitaikhu, the four tone marks and
/// thanthakhat, Latin combining diacritics, and zero-width characters.
pub(crate) fn is_folded_mark(c: char) -> bool {
    matches!(
        c,
        '\u{0E47}'..='\u{0E4C}' | '\u{0300}'..='\u{036F}' | '\u{200B}'..='\u{200D}' | '\u{FEFF}'
    )
}

/// Remove tone marks and diacritics, keeping everything else byte-for-byte
/// in canonical composed form.
///
/// Applied to regex sources too, which is only sound when no mark carries a
/// quantifier: `ข้?` would fold to `ข?`. Pattern compilation rejects those.
pub fn fold_marks(text: &str) -> String {
    let folded: String = text
        .nfd()
        .filter(|c| !is_folded_mark(*c))
        .nfc()
        .collect();
    if folded.contains(SPLIT_SARA_AM) {
        folded.replace(SPLIT_SARA_AM, SARA_AM)
    } else {
        folded
    }
}

/// Canonical comparison key: lowercased, mark-folded, whitespace runs
/// collapsed to one space, trimmed. Idempotent.
pub fn normalize(raw: &str) -> String {
    let folded = fold_marks(&raw.to_lowercase());
    let mut key = String::with_capacity(folded.len());
    for word in folded.split_whitespace() {
        if !key.is_empty() {
            key.push(' ');
        }
        key.push_str(word);
    }
    key
}

/// Key with all whitespace removed, for text where OCR spacing drifts
/// inside words.
pub fn compact(raw: &str) -> String {
    normalize(raw).chars().filter(|c| *c != ' ').collect()
}

/// Distinct whitespace-separated tokens of the normalized text.
pub fn token_set(raw: &str) -> BTreeSet<String> {
    normalize(raw)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_whitespace() {
        assert_eq!(normalize("  หน้า \t 1\n\nข้อมูล  "), "หนา 1 ขอมูล");
    }

    #[test]
    fn drops_missing_tone_marks_on_both_sides() {
        assert_eq!(normalize("ข้อมูลส่วนบุคคล"), normalize("ขอมูลสวนบุคคล"));
    }

    #[test]
    fn folds_latin_diacritics() {
        assert_eq!(normalize("Résumé"), "resume");
    }

    #[test]
    fn rejoins_split_sara_am() {
        assert_eq!(normalize("ตำแหน่ง"), normalize("ต\u{0E4D}\u{0E32}แหน่ง"));
    }

    #[test]
    fn compact_ignores_spacing_drift() {
        assert_eq!(compact("ในพระ บรมราชูปถัมภ์"), compact("ในพระบรมราชูปถัมภ์"));
    }
}
