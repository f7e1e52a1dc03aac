use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;

use crate::ai::LlmConfig;
use crate::email::EmailConfig;

const DEFAULT_LOOKBACK_DAYS: i64 = 7;
const DEFAULT_PROMPT_PATH: &str = "prompt.txt";

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub token: String,
    pub database_id: String,
}

/// Everything the run needs, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub email: EmailConfig,
    pub notion: NotionConfig,
    pub llm: LlmConfig,
    pub lookback_days: i64,
    pub prompt_path: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // .env is optional; real environment wins
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |name: &str| required(name, var(name));

        let mut email = EmailConfig::gmail(&require("GMAIL_USER")?, &require("GMAIL_APP_PASSWORD")?);
        if let Some(server) = var("IMAP_SERVER") {
            email.server = server;
        }
        if let Some(port) = var("IMAP_PORT") {
            email.port = port.parse().context("IMAP_PORT must be a valid port number")?;
        }

        let notion = NotionConfig {
            token: require("NOTION_TOKEN")?,
            database_id: require("NOTION_DB_ID")?,
        };

        let llm = if var("USE_GEMINI").is_some_and(|v| v == "true") {
            LlmConfig::Gemini {
                api_key: require("GEMINI_API_KEY")?,
            }
        } else {
            LlmConfig::OpenAi {
                api_key: require("OPENAI_API_KEY")?,
            }
        };

        let lookback_days = match var("LOOKBACK_DAYS") {
            Some(days) => days
                .parse()
                .context("LOOKBACK_DAYS must be a whole number of days")?,
            None => DEFAULT_LOOKBACK_DAYS,
        };

        let prompt_path = var("PROMPT_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_PATH));

        Ok(Self {
            email,
            notion,
            llm,
            lookback_days,
            prompt_path,
        })
    }
}

fn required(name: &str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{} environment variable not set", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("GMAIL_USER", "me@gmail.com".to_string()),
            ("GMAIL_APP_PASSWORD", "abcd efgh ijkl mnop ".to_string()),
            ("NOTION_TOKEN", "secret_notion".to_string()),
            ("NOTION_DB_ID", "db-123".to_string()),
            ("OPENAI_API_KEY", "sk-openai".to_string()),
        ])
    }

    fn load(vars: &HashMap<&'static str, String>) -> Result<Config> {
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_required_rejects_missing_and_blank() {
        let err = required("GMAIL_USER", None).unwrap_err().to_string();
        assert!(err.contains("GMAIL_USER"));
        assert!(required("GMAIL_USER", Some("   ".into())).is_err());
        assert_eq!(required("GMAIL_USER", Some("value".into())).unwrap(), "value");
    }

    #[test]
    fn test_defaults() {
        let config = load(&base_vars()).unwrap();
        assert_eq!(config.email.server, "imap.gmail.com");
        assert_eq!(config.email.port, 993);
        assert_eq!(config.email.username, "me@gmail.com");
        assert_eq!(config.email.password, "abcd efgh ijkl mnop");
        assert_eq!(config.notion.token, "secret_notion");
        assert_eq!(config.notion.database_id, "db-123");
        assert_eq!(config.lookback_days, 7);
        assert_eq!(config.prompt_path, PathBuf::from("prompt.txt"));
        assert!(matches!(config.llm, LlmConfig::OpenAi { ref api_key } if api_key == "sk-openai"));
    }

    #[test]
    fn test_overrides() {
        let mut vars = base_vars();
        vars.insert("IMAP_SERVER", "imap.example.com".into());
        vars.insert("IMAP_PORT", "1993".into());
        vars.insert("LOOKBACK_DAYS", "14".into());
        vars.insert("PROMPT_PATH", "/etc/apptrack/prompt.txt".into());

        let config = load(&vars).unwrap();
        assert_eq!(config.email.server, "imap.example.com");
        assert_eq!(config.email.port, 1993);
        assert_eq!(config.lookback_days, 14);
        assert_eq!(config.prompt_path, PathBuf::from("/etc/apptrack/prompt.txt"));
    }

    #[test]
    fn test_use_gemini_requires_gemini_key() {
        let mut vars = base_vars();
        vars.insert("USE_GEMINI", "true".into());

        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("GEMINI_API_KEY"));

        vars.insert("GEMINI_API_KEY", "g-key".into());
        let config = load(&vars).unwrap();
        assert!(matches!(config.llm, LlmConfig::Gemini { ref api_key } if api_key == "g-key"));
    }

    #[test]
    fn test_use_gemini_other_values_select_openai() {
        for value in ["TRUE", "1", "yes", "false", ""] {
            let mut vars = base_vars();
            vars.insert("USE_GEMINI", value.into());
            vars.insert("GEMINI_API_KEY", "g-key".into());
            let config = load(&vars).unwrap();
            assert!(matches!(config.llm, LlmConfig::OpenAi { .. }), "USE_GEMINI={:?}", value);
        }
    }

    #[test]
    fn test_openai_key_required_without_gemini() {
        let mut vars = base_vars();
        vars.remove("OPENAI_API_KEY");
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        let mut vars = base_vars();
        vars.insert("LOOKBACK_DAYS", "abc".into());
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("LOOKBACK_DAYS"));

        let mut vars = base_vars();
        vars.insert("IMAP_PORT", "99999".into());
        let err = load(&vars).unwrap_err().to_string();
        assert!(err.contains("IMAP_PORT"));
    }

    #[test]
    fn test_missing_required_var_is_error() {
        for name in ["GMAIL_USER", "GMAIL_APP_PASSWORD", "NOTION_TOKEN", "NOTION_DB_ID"] {
            let mut vars = base_vars();
            vars.remove(name);
            let err = load(&vars).unwrap_err().to_string();
            assert!(err.contains(name), "{}", err);
        }
    }
}
