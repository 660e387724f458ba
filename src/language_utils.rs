use anyhow::{Result, anyhow};
use isolang::Language;

/// Language utilities for ISO language code handling
///
/// Codes arrive from configuration, from book metadata and from the language
/// detector's model reply. They are normalised to ISO 639-2/T internally and
/// rendered as English names inside prompts.

/// ISO 639-2/B codes that differ from their 639-2/T counterpart
const BIBLIOGRAPHIC_CODES: &[(&str, &str)] = &[
    ("fre", "fra"),
    ("ger", "deu"),
    ("dut", "nld"),
    ("gre", "ell"),
    ("chi", "zho"),
    ("cze", "ces"),
    ("ice", "isl"),
    ("alb", "sqi"),
    ("arm", "hye"),
    ("baq", "eus"),
    ("bur", "mya"),
    ("per", "fas"),
    ("geo", "kat"),
    ("may", "msa"),
    ("mac", "mkd"),
    ("rum", "ron"),
    ("slo", "slk"),
    ("wel", "cym"),
];

fn lookup(code: &str) -> Option<Language> {
    let code = code.trim().to_lowercase();
    match code.len() {
        2 => Language::from_639_1(&code),
        3 => {
            let terminological = BIBLIOGRAPHIC_CODES
                .iter()
                .find(|(b, _)| *b == code)
                .map(|(_, t)| *t)
                .unwrap_or(code.as_str());
            Language::from_639_3(terminological)
        }
        _ => None,
    }
}

/// Normalize a language code to ISO 639-2/T (3-letter) format
pub fn normalize_to_part2t(code: &str) -> Result<String> {
    lookup(code)
        .map(|lang| lang.to_639_3().to_string())
        .ok_or_else(|| anyhow!("Cannot normalize invalid language code: {}", code))
}

/// Normalize a language code to ISO 639-1 (2-letter) format if possible
/// Falls back to ISO 639-2/T if no ISO 639-1 code exists
pub fn normalize_to_part1_or_part2t(code: &str) -> Result<String> {
    let lang = lookup(code).ok_or_else(|| anyhow!("Cannot normalize invalid language code: {}", code))?;
    Ok(lang
        .to_639_1()
        .map(str::to_string)
        .unwrap_or_else(|| lang.to_639_3().to_string()))
}

/// Check if two language codes match (represent the same language)
pub fn language_codes_match(code1: &str, code2: &str) -> bool {
    match (lookup(code1), lookup(code2)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Get the English language name from a code
pub fn get_language_name(code: &str) -> Result<String> {
    lookup(code)
        .map(|lang| lang.to_name().to_string())
        .ok_or_else(|| anyhow!("Invalid language code: {}", code))
}

/// Name used inside prompts; unknown codes are passed through verbatim
pub fn prompt_language_name(code: &str) -> String {
    get_language_name(code).unwrap_or_else(|_| code.trim().to_string())
}

/// Pull a language code out of a model reply such as `"en"`, `"Language: fr."`
/// or `"The text is in German (de)"`. Returns the ISO 639-1 code when one exists.
pub fn parse_detected_language(reply: &str) -> Option<String> {
    let bare = reply.trim().trim_matches(|c: char| !c.is_alphanumeric());
    if let Ok(code) = normalize_to_part1_or_part2t(bare) {
        return Some(code);
    }

    // English names are less ambiguous than short tokens inside a sentence
    let by_name = reply
        .split(|c: char| !c.is_alphabetic())
        .filter(|t| t.len() > 3)
        .find_map(|word| {
            let mut name = word.to_lowercase();
            if let Some(first) = name.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            Language::from_name(&name)
        });
    if let Some(lang) = by_name {
        return Some(
            lang.to_639_1()
                .map(str::to_string)
                .unwrap_or_else(|| lang.to_639_3().to_string()),
        );
    }

    reply
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|t| t.len() == 2)
        .filter_map(|t| normalize_to_part1_or_part2t(t).ok())
        .last()
}
