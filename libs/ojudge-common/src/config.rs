// Process configuration read from the environment, plus the runtime descriptor schema
// shared by the worker and the CLI

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@127.0.0.1:5432/oj";
pub const DEFAULT_JUDGE_MYSQL_URL: &str = "mysql://judge@127.0.0.1:3306/judge";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub redis_url: String,
    /// Store holding problems, test cases and submission status
    pub database_url: String,
    /// Database that SQL submissions are executed against
    pub judge_mysql_url: String,
    /// Directory for staged source files, mounted into sandboxes
    pub code_dir: PathBuf,
    pub languages_config: PathBuf,
    pub code_workers: usize,
    pub sql_workers: usize,
    /// Extra wall time granted on top of the in-sandbox limit before the host kills the container
    pub sandbox_grace_ms: u64,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            redis_url: string("REDIS_URL", DEFAULT_REDIS_URL),
            database_url: string("DATABASE_URL", DEFAULT_DATABASE_URL),
            judge_mysql_url: string("JUDGE_MYSQL_URL", DEFAULT_JUDGE_MYSQL_URL),
            code_dir: PathBuf::from(string("CODE_DIR", "codes")),
            languages_config: PathBuf::from(string("LANGUAGES_CONFIG", "config/languages.json")),
            code_workers: number("CODE_WORKERS", 5).max(1) as usize,
            sql_workers: number("SQL_WORKERS", 4).max(1) as usize,
            sandbox_grace_ms: number("SANDBOX_GRACE_MS", 1000),
            db_max_connections: number("DB_MAX_CONNECTIONS", 10).max(1) as u32,
        }
    }
}

/// Sandbox runtime for one language tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageRuntime {
    /// Language tag as sent by clients; also the staged file extension
    pub name: String,
    /// Pre-built sandbox image
    pub image: String,
    /// Base of the per-test container name
    pub container_name: String,
    /// Interpreter invoked on the mounted source file
    pub command: String,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
}

fn default_memory_limit_mb() -> u32 {
    256
}

fn default_cpu_limit() -> f32 {
    1.0
}

impl LanguageRuntime {
    /// Image reference with an explicit tag
    pub fn image_ref(&self) -> String {
        let has_tag = self
            .image
            .rsplit('/')
            .next()
            .map(|last| last.contains(':'))
            .unwrap_or(false);
        if has_tag {
            self.image.clone()
        } else {
            format!("{}:latest", self.image)
        }
    }
}

/// On-disk shape of `languages.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageRuntime>,
}

/// Runtimes used when no languages file is present
pub fn default_runtimes() -> Vec<LanguageRuntime> {
    vec![
        LanguageRuntime {
            name: "js".to_string(),
            image: "online_javascript".to_string(),
            container_name: "javascript_oj".to_string(),
            command: "node".to_string(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
        },
        LanguageRuntime {
            name: "py".to_string(),
            image: "online_python".to_string(),
            container_name: "python_oj".to_string(),
            command: "python3".to_string(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_image_ref_adds_latest() {
        let mut runtime = default_runtimes().remove(1);
        assert_eq!(runtime.image_ref(), "online_python:latest");
        runtime.image = "registry:5000/judge/python:3.12".to_string();
        assert_eq!(runtime.image_ref(), "registry:5000/judge/python:3.12");
        runtime.image = "registry:5000/judge/python".to_string();
        assert_eq!(runtime.image_ref(), "registry:5000/judge/python:latest");
    }

    #[test]
    fn test_languages_file_defaults_limits() {
        let raw = r#"{"languages":[{"name":"py","image":"online_python","container_name":"python_oj","command":"python3"}]}"#;
        let file: LanguagesFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.languages[0].memory_limit_mb, 256);
        assert_eq!(file.languages[0].cpu_limit, 1.0);
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.code_dir, PathBuf::from("codes"));
        assert_eq!(config.code_workers, 5);
        assert_eq!(config.sql_workers, 4);
        assert_eq!(config.sandbox_grace_ms, 1000);
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let env: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://cache:6379"),
            ("CODE_WORKERS", "8"),
            ("SQL_WORKERS", "lots"),
            ("DB_MAX_CONNECTIONS", "0"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.code_workers, 8);
        assert_eq!(config.sql_workers, 4);
        assert_eq!(config.db_max_connections, 1);
    }
}
