//! Agent-name → voice-id registry with auto-assignment.
//!
//! Assignment order on first use of a name:
//! 1. suffix match against the catalogue (`"Eric"` → `am_eric`) when that
//!    voice is still free,
//! 2. a deterministic pick from the unassigned pool, preferring American
//!    male, then American female, then British, then other locales,
//! 3. on pool exhaustion, a deterministic pick from the full catalogue
//!    (which may alias an existing agent).
//!
//! Picks hash the agent name so the same name lands on the same voice
//! across restarts.

use std::collections::BTreeMap;
use std::path::Path;

use crate::catalog;
use crate::{Error, Result};

/// Agent-name → voice-id map
#[derive(Debug, Default, Clone)]
pub struct VoiceRegistry {
    map: BTreeMap<String, String>,
}

impl VoiceRegistry {
    /// Build from a pre-seeded map (typically `config.voice_registry`),
    /// dropping entries whose voice is not in the catalogue.
    #[must_use]
    pub fn new(preseed: &BTreeMap<String, String>) -> Self {
        let mut map = BTreeMap::new();
        for (name, voice) in preseed {
            if catalog::is_valid(voice) {
                map.insert(name.clone(), voice.clone());
            } else {
                tracing::warn!(name = %name, voice = %voice, "dropping unknown voice from seed");
            }
        }
        Self { map }
    }

    /// Return the registered voice for `name`, assigning one if needed.
    /// The flag is true when this call created the binding.
    pub fn resolve(&mut self, name: &str) -> (String, bool) {
        if let Some(voice) = self.map.get(name) {
            return (voice.clone(), false);
        }

        // Suffix match, when the matching voice is still free.
        if let Some(candidate) = catalog::voice_for_name(name) {
            if !self.is_assigned(candidate) {
                self.map.insert(name.to_string(), candidate.to_string());
                tracing::info!(name = %name, voice = %candidate, "auto-assigned voice (name match)");
                return (candidate.to_string(), true);
            }
        }

        // Tiered pick from the unassigned pool.
        let pool = self.available_pool();
        if !pool.is_empty() {
            let best_tier = pool.iter().map(|v| catalog::tier(v)).min().unwrap_or(u8::MAX);
            let tier_pool: Vec<&String> =
                pool.iter().filter(|v| catalog::tier(v) == best_tier).collect();
            #[allow(clippy::cast_possible_truncation)]
            let index = (catalog::stable_hash(name) % tier_pool.len() as u64) as usize;
            let voice = tier_pool[index].clone();
            self.map.insert(name.to_string(), voice.clone());
            tracing::info!(name = %name, voice = %voice, "auto-assigned voice (pool)");
            return (voice, true);
        }

        // Pool exhausted: alias over the full catalogue.
        tracing::warn!("all voices assigned, reusing voices");
        let mut all: Vec<&str> = catalog::VOICES.iter().map(|v| v.id).collect();
        all.sort_unstable();
        #[allow(clippy::cast_possible_truncation)]
        let index = (catalog::stable_hash(name) % all.len() as u64) as usize;
        let voice = all[index].to_string();
        self.map.insert(name.to_string(), voice.clone());
        tracing::info!(name = %name, voice = %voice, "auto-assigned voice (exhausted pool)");
        (voice, true)
    }

    /// Bind a specific voice to a name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidVoice` when the id is not in the catalogue.
    pub fn set(&mut self, name: &str, voice_id: &str) -> Result<()> {
        if !catalog::is_valid(voice_id) {
            return Err(Error::InvalidVoice(voice_id.to_string()));
        }
        self.map.insert(name.to_string(), voice_id.to_string());
        tracing::info!(name = %name, voice = %voice_id, "voice set");
        Ok(())
    }

    /// Atomically move a binding from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns `NameOccupied` when `new` is already bound to a different
    /// voice.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let voice = self.map.get(old).cloned();
        if let Some(existing) = self.map.get(new) {
            if Some(existing) != voice.as_ref() {
                return Err(Error::NameOccupied {
                    name: new.to_string(),
                    holder: new.to_string(),
                });
            }
        }
        if let Some(voice) = self.map.remove(old) {
            self.map.insert(new.to_string(), voice);
        }
        Ok(())
    }

    /// Drop a binding, returning its voice to the pool
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.map.remove(name)
    }

    /// Current bindings and the sorted unassigned pool
    #[must_use]
    pub fn snapshot(&self) -> (BTreeMap<String, String>, Vec<String>) {
        (self.map.clone(), self.available_pool())
    }

    /// Sorted voice ids not currently bound to any agent
    #[must_use]
    pub fn available_pool(&self) -> Vec<String> {
        let mut pool: Vec<String> = catalog::VOICES
            .iter()
            .map(|v| v.id.to_string())
            .filter(|id| !self.is_assigned(id))
            .collect();
        pool.sort_unstable();
        pool
    }

    fn is_assigned(&self, voice_id: &str) -> bool {
        self.map.values().any(|v| v == voice_id)
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Merge the registry into the config file's `voice_registry` key,
    /// leaving unrelated keys untouched. Best effort: a malformed existing
    /// file is replaced.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save_into(&self, config_path: &Path) -> Result<()> {
        let mut root: serde_json::Value = std::fs::read_to_string(config_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        root["voice_registry"] = serde_json::to_value(&self.map)?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, serde_json::to_string_pretty(&root)?)?;
        tracing::debug!(entries = self.map.len(), "voice registry saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> VoiceRegistry {
        VoiceRegistry::default()
    }

    #[test]
    fn resolve_is_idempotent() {
        let mut registry = empty();
        let (voice, assigned) = registry.resolve("Eric");
        assert_eq!(voice, "am_eric");
        assert!(assigned);

        let (again, assigned) = registry.resolve("Eric");
        assert_eq!(again, voice);
        assert!(!assigned);
    }

    #[test]
    fn resolve_prefers_american_male_pool() {
        let mut registry = empty();
        // A name with no suffix match lands in the American-male tier.
        let (voice, assigned) = registry.resolve("Zaphod");
        assert!(assigned);
        assert_eq!(crate::catalog::tier(&voice), 0, "picked {voice}");
    }

    #[test]
    fn resolve_is_deterministic_across_instances() {
        let mut a = empty();
        let mut b = empty();
        assert_eq!(a.resolve("Zaphod").0, b.resolve("Zaphod").0);
        assert_eq!(a.resolve("Trillian").0, b.resolve("Trillian").0);
    }

    #[test]
    fn suffix_match_skipped_when_voice_taken() {
        let mut registry = empty();
        registry.set("Someone", "am_eric").unwrap();
        let (voice, _) = registry.resolve("Eric");
        assert_ne!(voice, "am_eric");
    }

    #[test]
    fn set_rejects_unknown_voice() {
        let mut registry = empty();
        let err = registry.set("Eric", "xx_nope").unwrap_err();
        assert_eq!(err.kind(), Some("invalid_voice"));
    }

    #[test]
    fn rename_moves_binding() {
        let mut registry = empty();
        registry.set("Eric", "am_eric").unwrap();
        registry.rename("Eric", "Captain").unwrap();

        let (map, _) = registry.snapshot();
        assert!(!map.contains_key("Eric"));
        assert_eq!(map.get("Captain").map(String::as_str), Some("am_eric"));
    }

    #[test]
    fn rename_rejects_taken_name() {
        let mut registry = empty();
        registry.set("Eric", "am_eric").unwrap();
        registry.set("Nova", "af_nova").unwrap();
        let err = registry.rename("Eric", "Nova").unwrap_err();
        assert_eq!(err.kind(), Some("name_occupied"));
    }

    #[test]
    fn pool_exhaustion_still_assigns() {
        let mut registry = empty();
        for (i, voice) in crate::catalog::VOICES.iter().enumerate() {
            registry.set(&format!("agent-{i}"), voice.id).unwrap();
        }
        assert!(registry.available_pool().is_empty());

        let (voice, assigned) = registry.resolve("one-more");
        assert!(assigned);
        assert!(crate::catalog::is_valid(&voice));
    }

    #[test]
    fn save_merges_into_existing_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"main_agent":"Eric","http_port":7865}"#).unwrap();

        let mut registry = empty();
        registry.set("Nova", "af_nova").unwrap();
        registry.save_into(&path).unwrap();

        let root: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(root["main_agent"], "Eric");
        assert_eq!(root["voice_registry"]["Nova"], "af_nova");
    }

    #[test]
    fn preseed_drops_invalid_voices() {
        let mut seed = BTreeMap::new();
        seed.insert("Good".to_string(), "am_adam".to_string());
        seed.insert("Bad".to_string(), "not_a_voice".to_string());
        let registry = VoiceRegistry::new(&seed);
        assert_eq!(registry.len(), 1);
    }
}
