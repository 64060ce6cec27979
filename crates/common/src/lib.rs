//! Types shared by every service crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream trading environment. Selects which venue host the
/// connection dials; demo and live are mutually exclusive per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Demo,
    Live,
}

impl Environment {
    /// Stable lowercase name, used in KV keys and headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Demo => "demo",
            Environment::Live => "live",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid environment '{0}', expected 'demo' or 'live'")]
pub struct ParseEnvironmentError(String);

impl FromStr for Environment {
    type Err = ParseEnvironmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "demo" => Ok(Environment::Demo),
            "live" => Ok(Environment::Live),
            other => Err(ParseEnvironmentError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!("demo".parse::<Environment>().unwrap(), Environment::Demo);
        assert_eq!("LIVE".parse::<Environment>().unwrap(), Environment::Live);
        assert!(" bogus ".parse::<Environment>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Environment::Live).unwrap(), "\"live\"");
        let e: Environment = serde_json::from_str("\"demo\"").unwrap();
        assert_eq!(e, Environment::Demo);
    }

    #[test]
    fn test_default_is_demo() {
        assert_eq!(Environment::default(), Environment::Demo);
    }
}
