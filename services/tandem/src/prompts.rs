//! System prompts for both agents.
//!
//! Prompts are read from `<dir>/speech.md` and `<dir>/action.md`. A missing file falls
//! back to the built-in prompt for that agent.

use anyhow::{Context, Result};
use std::{collections::HashMap, fs, path::Path};
use tandem_core::AgentRole;
use tracing::{info, warn};

pub const DEFAULT_SPEECH_PROMPT: &str = "\
You are the speech agent in a game world. You talk to the user; a separate action agent moves and acts in the world.

You receive world updates as assistant tool calls named act_in_world with matching tool results.
Treat those as your own recent actions and observations. The first update is a full snapshot; later ones only contain what changed.
If you don't observe anything important, say nothing.

Use <speak>...</speak> (or the short form <s>...</s>) for text that should be spoken out loud. Keep it short.
Use <intent>...</intent> to tell the action agent what it should do next, in plain words.
Anything outside these tags is private and never shown to the action agent or spoken.";

pub const DEFAULT_ACTION_PROMPT: &str = "\
You are the action agent in a game world. You act through the act_in_world tool; a separate speech agent talks to the user.

Each call takes an action object such as {\"type\":\"Move\",\"data\":{\"x\":1,\"z\":0}} and returns what changed in the world since your previous call.
Instructions from the speech agent arrive as user messages. Follow them unless the world makes that impossible.

After each meaningful step, report it as
<activity><action>what you did</action><observation>what happened</observation></activity>
so the speech agent can describe it. Do not narrate outside these tags.";

/// Loads every `*.md` file in `prompts_path`, keyed by file stem.
pub fn load_prompts(prompts_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemPrompts {
    pub speech: String,
    pub action: String,
}

impl Default for SystemPrompts {
    fn default() -> Self {
        Self {
            speech: DEFAULT_SPEECH_PROMPT.to_string(),
            action: DEFAULT_ACTION_PROMPT.to_string(),
        }
    }
}

impl SystemPrompts {
    /// Reads prompts from `dir`, falling back to the defaults per agent.
    pub fn load(dir: &Path) -> Self {
        let mut prompts = match load_prompts(dir) {
            Ok(prompts) => prompts,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "Prompts directory unreadable; using built-in prompts");
                HashMap::new()
            }
        };
        let mut pick = |role: AgentRole, fallback: &str| {
            match prompts.remove(role.as_str()).filter(|p| !p.trim().is_empty()) {
                Some(prompt) => {
                    info!(agent = %role, "Loaded system prompt from file");
                    prompt
                }
                None => fallback.to_string(),
            }
        };
        Self {
            speech: pick(AgentRole::Speech, DEFAULT_SPEECH_PROMPT),
            action: pick(AgentRole::Action, DEFAULT_ACTION_PROMPT),
        }
    }

    pub fn get(&self, role: AgentRole) -> &str {
        match role {
            AgentRole::Speech => &self.speech,
            AgentRole::Action => &self.action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_directory_uses_defaults() {
        let prompts = SystemPrompts::load(Path::new("/definitely/not/here"));
        assert_eq!(prompts, SystemPrompts::default());
        assert!(prompts.get(AgentRole::Speech).contains("<speak>"));
        assert!(prompts.get(AgentRole::Action).contains("<activity>"));
    }

    #[test]
    fn test_files_override_per_agent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("speech.md"), "Custom speech").unwrap();
        fs::write(dir.path().join("action.md"), "   ").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let prompts = SystemPrompts::load(dir.path());
        assert_eq!(prompts.speech, "Custom speech");
        assert_eq!(prompts.action, DEFAULT_ACTION_PROMPT);
    }

    #[test]
    fn test_load_prompts_keys_by_stem() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("speech.md"), "a").unwrap();
        fs::write(dir.path().join("other.md"), "b").unwrap();
        fs::write(dir.path().join("readme.txt"), "c").unwrap();

        let prompts = load_prompts(dir.path()).unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts["other"], "b");
    }
}
