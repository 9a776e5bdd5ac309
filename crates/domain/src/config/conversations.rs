use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where conversation bundles live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsConfig {
    /// Directory holding one `<id>.json` bundle per conversation. Created on
    /// startup if missing.
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
        }
    }
}

fn d_state_dir() -> PathBuf {
    PathBuf::from("./data/conversations")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_dir() {
        let cfg = ConversationsConfig::default();
        assert_eq!(cfg.state_dir, PathBuf::from("./data/conversations"));
    }

    #[test]
    fn deserializes_override() {
        let cfg: ConversationsConfig =
            toml::from_str(r#"state_dir = "/var/lib/verdant/conversations""#).unwrap();
        assert_eq!(
            cfg.state_dir,
            PathBuf::from("/var/lib/verdant/conversations")
        );
    }
}
