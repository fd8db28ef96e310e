//! Language code normalization.
//!
//! Track languages are stored as ISO 639-2/B codes. Probe output can carry
//! two-letter 639-1 codes, terminological 639-2/T codes, or nothing at all;
//! everything funnels through [`normalize_language`] before comparison.

/// (639-1, 639-2/T) pairs that map onto a bibliographic 639-2/B code.
/// Only the codes where B and T differ, plus the common two-letter forms.
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("de", "ger"),
    ("deu", "ger"),
    ("fr", "fre"),
    ("fra", "fre"),
    ("nl", "dut"),
    ("nld", "dut"),
    ("cs", "cze"),
    ("ces", "cze"),
    ("el", "gre"),
    ("ell", "gre"),
    ("zh", "chi"),
    ("zho", "chi"),
    ("is", "ice"),
    ("isl", "ice"),
    ("mk", "mac"),
    ("mkd", "mac"),
    ("ro", "rum"),
    ("ron", "rum"),
    ("sk", "slo"),
    ("slk", "slo"),
    ("sq", "alb"),
    ("sqi", "alb"),
    ("hy", "arm"),
    ("hye", "arm"),
    ("eu", "baq"),
    ("eus", "baq"),
    ("my", "bur"),
    ("mya", "bur"),
    ("ka", "geo"),
    ("kat", "geo"),
    ("ms", "may"),
    ("msa", "may"),
    ("mi", "mao"),
    ("mri", "mao"),
    ("fa", "per"),
    ("fas", "per"),
    ("bo", "tib"),
    ("bod", "tib"),
    ("cy", "wel"),
    ("cym", "wel"),
    // Two-letter forms whose three-letter code is already bibliographic.
    ("en", "eng"),
    ("es", "spa"),
    ("it", "ita"),
    ("ja", "jpn"),
    ("ko", "kor"),
    ("pt", "por"),
    ("ru", "rus"),
    ("sv", "swe"),
    ("no", "nor"),
    ("da", "dan"),
    ("fi", "fin"),
    ("pl", "pol"),
    ("tr", "tur"),
    ("ar", "ara"),
    ("he", "heb"),
    ("hi", "hin"),
    ("th", "tha"),
    ("vi", "vie"),
    ("uk", "ukr"),
    ("hu", "hun"),
    ("id", "ind"),
];

/// Normalize a language tag to an ISO 639-2/B code.
///
/// Unknown, empty, or unmappable values become `"und"`.
pub fn normalize_language(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "und".to_string();
    };
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() || lowered == "unknown" || lowered == "undefined" {
        return "und".to_string();
    }
    for (alias, canonical) in LANGUAGE_ALIASES {
        if lowered == *alias {
            return (*canonical).to_string();
        }
    }
    // Already a three-letter code (or something we pass through verbatim).
    if lowered.len() == 3 && lowered.chars().all(|c| c.is_ascii_lowercase()) {
        return lowered;
    }
    "und".to_string()
}

/// Compare two language tags after normalization.
pub fn languages_match(a: &str, b: &str) -> bool {
    normalize_language(Some(a)) == normalize_language(Some(b))
}
