use crate::core::config::SpeakerConfig;
use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};

/// Maps the speaker names an attribution pass emits onto stable speaker IDs.
#[derive(Debug, Clone)]
pub struct AliasResolver {
    aliases: HashMap<String, String>,
    narrator: String,
    system: String,
    narrator_names: HashSet<String>,
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

impl AliasResolver {
    pub fn new(config: &SpeakerConfig) -> Result<Self> {
        let aliases: HashMap<String, String> = config
            .aliases
            .iter()
            .map(|(from, to)| (fold(from), to.trim().to_string()))
            .filter(|(from, to)| !from.is_empty() && !to.is_empty())
            .collect();

        for start in aliases.keys() {
            let mut seen = HashSet::new();
            let mut current = start.clone();
            while let Some(next) = aliases.get(&current) {
                if !seen.insert(current.clone()) {
                    bail!("Speaker alias cycle involving '{}'", start);
                }
                let next = fold(next);
                if next == current {
                    break;
                }
                current = next;
            }
        }

        let mut narrator_names: HashSet<String> =
            config.narrator_names.iter().map(|n| fold(n)).collect();
        narrator_names.insert(fold(&config.narrator));

        Ok(Self {
            aliases,
            narrator: config.narrator.clone(),
            system: config.system.clone(),
            narrator_names,
        })
    }

    pub fn narrator(&self) -> &str {
        &self.narrator
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Canonical speaker ID for `name`. Unknown names map to themselves
    /// (trimmed); an empty name means the narrator.
    pub fn resolve(&self, name: &str) -> String {
        let mut current = name.trim().to_string();
        if current.is_empty() {
            return self.narrator.clone();
        }
        // Chains are acyclic (checked in `new`), so this terminates; the
        // bound only guards against a table edited after construction.
        for _ in 0..=self.aliases.len() {
            let key = fold(&current);
            if self.narrator_names.contains(&key) {
                return self.narrator.clone();
            }
            match self.aliases.get(&key) {
                Some(next) if fold(next) != key => current = next.clone(),
                // Same name, different spelling: the configured form wins.
                Some(next) => {
                    current = next.clone();
                    break;
                }
                None => break,
            }
        }
        current
    }
}
