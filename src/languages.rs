//! # Language Registry
//!
//! Whisper language codes and names, plus the default alignment model for
//! each language that has one.

use std::collections::BTreeSet;

/// (code, name) pairs for languages Whisper transcribes.
const LANGUAGES: &[(&str, &str)] = &[
    ("en", "english"),
    ("zh", "chinese"),
    ("de", "german"),
    ("es", "spanish"),
    ("ru", "russian"),
    ("ko", "korean"),
    ("fr", "french"),
    ("ja", "japanese"),
    ("pt", "portuguese"),
    ("tr", "turkish"),
    ("pl", "polish"),
    ("ca", "catalan"),
    ("nl", "dutch"),
    ("ar", "arabic"),
    ("sv", "swedish"),
    ("it", "italian"),
    ("id", "indonesian"),
    ("hi", "hindi"),
    ("fi", "finnish"),
    ("vi", "vietnamese"),
    ("he", "hebrew"),
    ("uk", "ukrainian"),
    ("el", "greek"),
    ("ms", "malay"),
    ("cs", "czech"),
    ("ro", "romanian"),
    ("da", "danish"),
    ("hu", "hungarian"),
    ("ta", "tamil"),
    ("no", "norwegian"),
    ("th", "thai"),
    ("ur", "urdu"),
    ("hr", "croatian"),
    ("bg", "bulgarian"),
    ("lt", "lithuanian"),
    ("la", "latin"),
    ("ml", "malayalam"),
    ("cy", "welsh"),
    ("sk", "slovak"),
    ("te", "telugu"),
    ("fa", "persian"),
    ("lv", "latvian"),
    ("bn", "bengali"),
    ("sr", "serbian"),
    ("az", "azerbaijani"),
    ("sl", "slovenian"),
    ("et", "estonian"),
    ("mk", "macedonian"),
    ("eu", "basque"),
    ("is", "icelandic"),
    ("hy", "armenian"),
    ("ne", "nepali"),
    ("mn", "mongolian"),
    ("bs", "bosnian"),
    ("kk", "kazakh"),
    ("sq", "albanian"),
    ("sw", "swahili"),
    ("gl", "galician"),
    ("mr", "marathi"),
    ("pa", "punjabi"),
    ("si", "sinhala"),
    ("km", "khmer"),
    ("af", "afrikaans"),
    ("ka", "georgian"),
    ("be", "belarusian"),
    ("gu", "gujarati"),
    ("am", "amharic"),
    ("yi", "yiddish"),
    ("lo", "lao"),
    ("uz", "uzbek"),
    ("fo", "faroese"),
    ("nn", "nynorsk"),
    ("tl", "tagalog"),
];

/// Default alignment model per language code.
const DEFAULT_ALIGN_MODELS: &[(&str, &str)] = &[
    ("en", "WAV2VEC2_ASR_BASE_960H"),
    ("fr", "VOXPOPULI_ASR_BASE_10K_FR"),
    ("de", "VOXPOPULI_ASR_BASE_10K_DE"),
    ("es", "VOXPOPULI_ASR_BASE_10K_ES"),
    ("it", "VOXPOPULI_ASR_BASE_10K_IT"),
    ("ja", "jonatasgrosman/wav2vec2-large-xlsr-53-japanese"),
    ("zh", "jonatasgrosman/wav2vec2-large-xlsr-53-chinese-zh-cn"),
    ("nl", "jonatasgrosman/wav2vec2-large-xlsr-53-dutch"),
    ("uk", "Yehor/wav2vec2-xls-r-300m-uk-with-small-lm"),
    ("pt", "jonatasgrosman/wav2vec2-large-xlsr-53-portuguese"),
    ("ar", "jonatasgrosman/wav2vec2-large-xlsr-53-arabic"),
    ("cs", "comodoro/wav2vec2-xls-r-300m-cs-250"),
    ("ru", "jonatasgrosman/wav2vec2-large-xlsr-53-russian"),
    ("pl", "jonatasgrosman/wav2vec2-large-xlsr-53-polish"),
    ("hu", "jonatasgrosman/wav2vec2-large-xlsr-53-hungarian"),
    ("fi", "jonatasgrosman/wav2vec2-large-xlsr-53-finnish"),
    ("fa", "jonatasgrosman/wav2vec2-large-xlsr-53-persian"),
    ("el", "jonatasgrosman/wav2vec2-large-xlsr-53-greek"),
    ("tr", "mpoyraz/wav2vec2-xls-r-300m-cv7-turkish"),
    ("da", "saattrupdan/wav2vec2-xls-r-300m-ftspeech"),
    ("he", "imvladikon/wav2vec2-xls-r-300m-hebrew"),
    ("vi", "nguyenvulebinh/wav2vec2-base-vi"),
    ("ko", "kresnik/wav2vec2-large-xlsr-korean"),
    ("ur", "kingabzpro/wav2vec2-large-xls-r-300m-Urdu"),
    ("te", "anuragshas/wav2vec2-large-xlsr-53-telugu"),
    ("hi", "theainerd/Wav2Vec2-large-xlsr-hindi"),
    ("ca", "softcatala/wav2vec2-large-xlsr-catala"),
    ("ml", "gvs/wav2vec2-large-xlsr-malayalam"),
    ("no", "NbAiLab/nb-wav2vec2-1b-bokmaal"),
    ("nn", "NbAiLab/nb-wav2vec2-300m-nynorsk"),
];

/// Languages whose text has no spaces between words; each character is
/// aligned as its own word.
const CHARACTER_LANGUAGES: &[&str] = &["ja", "zh", "th", "lo", "km"];

/// All registered language names, sorted.
pub fn names() -> BTreeSet<&'static str> {
    LANGUAGES.iter().map(|(_, name)| *name).collect()
}

/// Resolve a language name ("english") or code ("en") to its code.
pub fn code_for(name_or_code: &str) -> Option<&'static str> {
    let wanted = name_or_code.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(code, name)| *code == wanted || *name == wanted)
        .map(|(code, _)| *code)
}

/// Default alignment model for a language code.
pub fn default_align_model(code: &str) -> Option<&'static str> {
    DEFAULT_ALIGN_MODELS
        .iter()
        .find(|(lang, _)| *lang == code)
        .map(|(_, model)| *model)
}

pub fn splits_on_characters(code: &str) -> bool {
    CHARACTER_LANGUAGES.contains(&code)
}
