//! Root configuration loading. Secrets (`SLACK_BOT_TOKEN`, `DUO_*`) come
//! from the process environment, never from this file, so the config never
//! carries credentials.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::commands::CommandTable;
use crate::error::ConfigError;

const REQUIRED_MESSAGE_KEYS: &[&str] = &[
    "greeting",
    "alert",
    "action_prompt",
    "bad_command",
    "hi",
    "2fa",
    "sending_push",
    "good_auth",
    "bad_auth",
    "escalated",
    "no_2fa",
    "no_response",
    "bwtm",
    "bye",
    "ignore_time",
    "ignore_no_time",
    "help_header",
    "help_usage",
    "help_footer",
    "report",
];

#[derive(Debug, Clone, Deserialize)]
struct RootConfigFile {
    messages_path: PathBuf,
    commands_path: PathBuf,
    icon_url: Option<String>,
    reporting_channel: Option<String>,
    #[serde(default = "default_db_path")]
    database_path: PathBuf,
    #[serde(default = "default_timezone")]
    timezone: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("triagebot.db")
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

#[derive(Debug)]
pub struct Config {
    pub messages: BTreeMap<String, String>,
    pub commands: CommandTable,
    pub icon_url: Option<String>,
    pub reporting_channel: Option<String>,
    pub database_path: PathBuf,
    pub timezone: chrono_tz::Tz,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let root = read_yaml::<RootConfigFile>(path)?;
        let messages: BTreeMap<String, String> = read_yaml(&root.messages_path)?;
        let commands: CommandTable = read_yaml(&root.commands_path)?;

        for key in REQUIRED_MESSAGE_KEYS {
            if !messages.contains_key(*key) {
                return Err(ConfigError::MissingMessageKey((*key).to_string()));
            }
        }

        let timezone = root
            .timezone
            .parse()
            .map_err(|_| ConfigError::MissingMessageKey(format!("invalid timezone: {}", root.timezone)))?;

        Ok(Self {
            messages,
            commands,
            icon_url: root.icon_url,
            reporting_channel: root.reporting_channel,
            database_path: root.database_path,
            timezone,
        })
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("triagebot_test_{}_{name}", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_required_message_key_is_rejected() {
        let messages_path = write_temp("messages.yaml", "greeting: hi\n");
        let commands_path = write_temp("commands.yaml", "hi:\n  handler: hi\n  info: greets you\n");
        let root_path = write_temp(
            "root.yaml",
            &format!(
                "messages_path: {}\ncommands_path: {}\n",
                messages_path.display(),
                commands_path.display()
            ),
        );

        let err = Config::load(&root_path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMessageKey(_)));

        for p in [messages_path, commands_path, root_path] {
            let _ = std::fs::remove_file(p);
        }
    }

    #[test]
    fn loads_a_complete_config() {
        let message_lines = REQUIRED_MESSAGE_KEYS
            .iter()
            .map(|k| format!("{k}: \"{k} template\""))
            .collect::<Vec<_>>()
            .join("\n");
        let messages_path = write_temp("messages.yaml", &message_lines);
        let commands_path = write_temp("commands.yaml", "hi:\n  handler: hi\n  info: greets you\n");
        let root_path = write_temp(
            "root.yaml",
            &format!(
                "messages_path: {}\ncommands_path: {}\n",
                messages_path.display(),
                commands_path.display()
            ),
        );

        let config = Config::load(&root_path).unwrap();
        assert_eq!(config.messages.len(), REQUIRED_MESSAGE_KEYS.len());
        assert!(config.commands.get("hi").is_some());

        for p in [messages_path, commands_path, root_path] {
            let _ = std::fs::remove_file(p);
        }
    }
}
