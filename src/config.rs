//! Configuration file parsing.
//!
//! The format is `key value` per line, not TOML/YAML. Blank lines and lines
//! starting with `#` are ignored. Unknown keys are rejected rather than
//! silently dropped, since a misspelled key silently falling back to a
//! default is exactly the kind of footgun this format exists to avoid.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Standalone,
    Raft,
    Bulkload,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl TraceLevel {
    /// `notice` maps onto `info`; the wire format has no level between them.
    pub fn as_filter(&self) -> &'static str {
        match self {
            TraceLevel::Debug => "debug",
            TraceLevel::Info => "info",
            TraceLevel::Warning => "warn",
            TraceLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub database: PathBuf,
    pub myself: Option<String>,
    pub trace: TraceLevel,
    pub write_ahead_log: bool,
    pub password: Option<String>,
    pub certificate_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

impl Config {
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_str(&contents)
    }

    pub fn parse_str(contents: &str) -> Result<Self, ConfigError> {
        let mut raw = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or("").trim();
            let value = parts.next().unwrap_or("").trim();
            raw.insert(key.to_string(), value.to_string());
        }

        let mode = match raw.get("mode").map(String::as_str) {
            Some("standalone") => Mode::Standalone,
            Some("raft") => Mode::Raft,
            Some("bulkload") => Mode::Bulkload,
            Some(other) => {
                return Err(ConfigError::InvalidValue { key: "mode", value: other.to_string() })
            }
            None => return Err(ConfigError::MissingKey("mode")),
        };

        let database = raw
            .get("database")
            .ok_or(ConfigError::MissingKey("database"))
            .and_then(|v| {
                if v.ends_with('/') {
                    Err(ConfigError::InvalidValue { key: "database", value: v.clone() })
                } else {
                    Ok(PathBuf::from(v))
                }
            })?;

        let myself = raw.get("myself").cloned();
        if mode == Mode::Raft && myself.is_none() {
            return Err(ConfigError::MissingKey("myself"));
        }

        let trace = match raw.get("trace").map(String::as_str) {
            None | Some("notice") | Some("info") => TraceLevel::Info,
            Some("debug") => TraceLevel::Debug,
            Some("warning") => TraceLevel::Warning,
            Some("error") => TraceLevel::Error,
            Some(other) => {
                return Err(ConfigError::InvalidValue { key: "trace", value: other.to_string() })
            }
        };

        let write_ahead_log = match raw.get("write_ahead_log").map(String::as_str) {
            None => true,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "write_ahead_log",
                    value: other.to_string(),
                })
            }
        };

        let password = match (raw.get("password"), raw.get("password_file")) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingPasswordOptions),
            (Some(p), None) => Some(p.clone()),
            (None, Some(path)) => {
                let meta = fs::metadata(path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let mode = meta.permissions().mode() & 0o777;
                    if mode != 0o400 {
                        return Err(ConfigError::InvalidValue {
                            key: "password_file",
                            value: format!("{path} must be mode 0400, found {mode:o}"),
                        });
                    }
                }
                let _ = &meta;
                Some(
                    fs::read_to_string(path)
                        .map_err(|source| ConfigError::Io { path: path.clone(), source })?
                        .trim_end()
                        .to_string(),
                )
            }
            (None, None) => None,
        };

        let certificate_path = raw.get("certificate_path").map(PathBuf::from);
        let key_path = raw.get("key_path").map(PathBuf::from);
        if certificate_path.is_some() != key_path.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "certificate_path",
                value: "certificate_path and key_path must be set together".to_string(),
            });
        }

        Ok(Config {
            mode,
            database,
            myself,
            trace,
            write_ahead_log,
            password,
            certificate_path,
            key_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_standalone_config() {
        let cfg = Config::parse_str("mode standalone\ndatabase /var/lib/quarkraft\n").unwrap();
        assert_eq!(cfg.mode, Mode::Standalone);
        assert_eq!(cfg.database, PathBuf::from("/var/lib/quarkraft"));
        assert_eq!(cfg.trace, TraceLevel::Info);
        assert!(cfg.write_ahead_log);
    }

    #[test]
    fn raft_mode_requires_myself() {
        let err = Config::parse_str("mode raft\ndatabase /var/lib/quarkraft\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey("myself")));
    }

    #[test]
    fn rejects_trailing_slash_on_database() {
        let err = Config::parse_str("mode standalone\ndatabase /var/lib/quarkraft/\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "database", .. }));
    }

    #[test]
    fn rejects_password_and_password_file_together() {
        let err = Config::parse_str(
            "mode standalone\ndatabase /d\npassword hunter2\npassword_file /etc/quarkraft/pw\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingPasswordOptions));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let cfg = Config::parse_str(
            "# a comment\n\nmode standalone\ndatabase /d\n\n# trailing comment\n",
        )
        .unwrap();
        assert_eq!(cfg.mode, Mode::Standalone);
    }
}
