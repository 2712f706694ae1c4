//! Static synthesis voice catalogue.
//!
//! The catalogue ships with the TTS engine and never changes at runtime.
//! Voice ids are `<accent-prefix><gender>_<name>` (e.g. `am_eric` is an
//! American-English male voice named "eric"). Assignment policies in the
//! voice and session registries work over this table.

use serde::Serialize;

/// Voice gender tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// One catalogue entry
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VoiceInfo {
    pub id: &'static str,
    pub gender: Gender,
    pub accent: &'static str,
}

const fn v(id: &'static str, gender: Gender, accent: &'static str) -> VoiceInfo {
    VoiceInfo { id, gender, accent }
}

use Gender::{Female, Male};

/// All shipped voices
pub const VOICES: &[VoiceInfo] = &[
    // American English - Female
    v("af_alloy", Female, "american"),
    v("af_aoede", Female, "american"),
    v("af_bella", Female, "american"),
    v("af_heart", Female, "american"),
    v("af_jessica", Female, "american"),
    v("af_kore", Female, "american"),
    v("af_nicole", Female, "american"),
    v("af_nova", Female, "american"),
    v("af_river", Female, "american"),
    v("af_sarah", Female, "american"),
    v("af_sky", Female, "american"),
    // American English - Male
    v("am_adam", Male, "american"),
    v("am_echo", Male, "american"),
    v("am_eric", Male, "american"),
    v("am_fenrir", Male, "american"),
    v("am_liam", Male, "american"),
    v("am_michael", Male, "american"),
    v("am_onyx", Male, "american"),
    v("am_puck", Male, "american"),
    v("am_santa", Male, "american"),
    // British English - Female
    v("bf_alice", Female, "british"),
    v("bf_emma", Female, "british"),
    v("bf_isabella", Female, "british"),
    v("bf_lily", Female, "british"),
    // British English - Male
    v("bm_daniel", Male, "british"),
    v("bm_fable", Male, "british"),
    v("bm_george", Male, "british"),
    v("bm_lewis", Male, "british"),
    // Spanish
    v("ef_dora", Female, "spanish"),
    v("em_alex", Male, "spanish"),
    v("em_santa", Male, "spanish"),
    // French
    v("ff_siwis", Female, "french"),
    // Hindi
    v("hf_alpha", Female, "hindi"),
    v("hf_beta", Female, "hindi"),
    v("hm_omega", Male, "hindi"),
    v("hm_psi", Male, "hindi"),
    // Italian
    v("if_sara", Female, "italian"),
    v("im_nicola", Male, "italian"),
    // Japanese
    v("jf_alpha", Female, "japanese"),
    v("jf_gongitsune", Female, "japanese"),
    v("jf_nezumi", Female, "japanese"),
    v("jf_tebukuro", Female, "japanese"),
    v("jm_kumo", Male, "japanese"),
    // Portuguese
    v("pf_dora", Female, "portuguese"),
    v("pm_alex", Male, "portuguese"),
    v("pm_santa", Male, "portuguese"),
    // Mandarin
    v("zf_xiaobei", Female, "mandarin"),
    v("zf_xiaoni", Female, "mandarin"),
    v("zf_xiaoxiao", Female, "mandarin"),
    v("zf_xiaoyi", Female, "mandarin"),
    v("zm_yunjian", Male, "mandarin"),
    v("zm_yunxi", Male, "mandarin"),
    v("zm_yunxia", Male, "mandarin"),
    v("zm_yunyang", Male, "mandarin"),
];

/// Session naming order: American English first (male then female), then
/// British English, then the remaining locales. Within each group the order
/// is curated, not alphabetical. Santa last (novelty).
pub const NAME_PRIORITY: &[(&str, &str)] = &[
    // American English - Male
    ("adam", "am_adam"),
    ("echo", "am_echo"),
    ("eric", "am_eric"),
    ("fenrir", "am_fenrir"),
    ("liam", "am_liam"),
    ("michael", "am_michael"),
    ("onyx", "am_onyx"),
    ("puck", "am_puck"),
    // American English - Female
    ("nova", "af_nova"),
    ("bella", "af_bella"),
    ("heart", "af_heart"),
    ("jessica", "af_jessica"),
    ("nicole", "af_nicole"),
    ("river", "af_river"),
    ("sarah", "af_sarah"),
    ("sky", "af_sky"),
    ("alloy", "af_alloy"),
    ("aoede", "af_aoede"),
    ("kore", "af_kore"),
    // British English - Male
    ("daniel", "bm_daniel"),
    ("fable", "bm_fable"),
    ("george", "bm_george"),
    ("lewis", "bm_lewis"),
    // British English - Female
    ("alice", "bf_alice"),
    ("emma", "bf_emma"),
    ("isabella", "bf_isabella"),
    ("lily", "bf_lily"),
    // Everything else
    ("alex", "em_alex"),
    ("dora", "ef_dora"),
    ("siwis", "ff_siwis"),
    ("alpha", "hf_alpha"),
    ("beta", "hf_beta"),
    ("omega", "hm_omega"),
    ("psi", "hm_psi"),
    ("sara", "if_sara"),
    ("nicola", "im_nicola"),
    ("gongitsune", "jf_gongitsune"),
    ("nezumi", "jf_nezumi"),
    ("tebukuro", "jf_tebukuro"),
    ("kumo", "jm_kumo"),
    ("xiaobei", "zf_xiaobei"),
    ("xiaoni", "zf_xiaoni"),
    ("xiaoxiao", "zf_xiaoxiao"),
    ("xiaoyi", "zf_xiaoyi"),
    ("yunjian", "zm_yunjian"),
    ("yunxi", "zm_yunxi"),
    ("yunxia", "zm_yunxia"),
    ("yunyang", "zm_yunyang"),
    ("santa", "am_santa"),
];

/// Check whether a voice id belongs to the catalogue
#[must_use]
pub fn is_valid(voice_id: &str) -> bool {
    VOICES.iter().any(|v| v.id == voice_id)
}

/// Look up a voice whose name suffix matches the given agent name
/// (case-insensitive). `"Eric"` matches `am_eric`. First catalogue entry
/// wins for names that appear under several accents.
#[must_use]
pub fn voice_for_name(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    VOICES
        .iter()
        .find(|v| v.id.split_once('_').is_some_and(|(_, n)| n == lower))
        .map(|v| v.id)
}

/// Assignment tier for the auto-assignment policy: lower is preferred.
/// 0 = American male, 1 = American female, 2 = British, 3 = other locales.
#[must_use]
pub fn tier(voice_id: &str) -> u8 {
    match VOICES.iter().find(|v| v.id == voice_id) {
        Some(v) if v.accent == "american" && v.gender == Male => 0,
        Some(v) if v.accent == "american" => 1,
        Some(v) if v.accent == "british" => 2,
        Some(_) => 3,
        None => u8::MAX,
    }
}

/// Stable FNV-1a hash, used to pick deterministically from voice pools.
/// `DefaultHasher` is not guaranteed stable across releases, and assignments
/// must survive restarts.
#[must_use]
pub fn stable_hash(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_ids_are_unique() {
        let mut ids: Vec<&str> = VOICES.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), VOICES.len());
    }

    #[test]
    fn priority_list_voices_are_in_catalogue() {
        for (_, voice) in NAME_PRIORITY {
            assert!(is_valid(voice), "{voice} missing from catalogue");
        }
    }

    #[test]
    fn name_lookup_matches_suffix() {
        assert_eq!(voice_for_name("Eric"), Some("am_eric"));
        assert_eq!(voice_for_name("NOVA"), Some("af_nova"));
        assert_eq!(voice_for_name("nobody"), None);
    }

    #[test]
    fn santa_resolves_to_american_first_match() {
        // "santa" appears under three accents; catalogue order decides.
        assert_eq!(voice_for_name("santa"), Some("am_santa"));
    }

    #[test]
    fn tiers_cover_policy_order() {
        assert_eq!(tier("am_eric"), 0);
        assert_eq!(tier("af_nova"), 1);
        assert_eq!(tier("bm_daniel"), 2);
        assert_eq!(tier("bf_alice"), 2);
        assert_eq!(tier("jf_nezumi"), 3);
        assert_eq!(tier("not_a_voice"), u8::MAX);
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash("Eric"), stable_hash("Eric"));
        assert_ne!(stable_hash("Eric"), stable_hash("Nova"));
    }
}
