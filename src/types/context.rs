use crate::{Error, ErrorContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a client runs.
///
/// Rendering passes have no persistent session: they get a fresh client each
/// time and never open a persistent stream. Interactive sessions share one
/// long-lived client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Rendering,
    Interactive,
}

impl ExecutionContext {
    pub fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rendering => "rendering",
            Self::Interactive => "interactive",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionContext {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rendering" | "server" | "ssr" => Ok(Self::Rendering),
            "interactive" | "browser" => Ok(Self::Interactive),
            other => Err(Error::configuration_with_context(
                format!("unknown execution context '{}'", other),
                ErrorContext::new().with_source("execution_context"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases() {
        assert_eq!("SSR".parse::<ExecutionContext>().unwrap(), ExecutionContext::Rendering);
        assert_eq!(
            " browser ".parse::<ExecutionContext>().unwrap(),
            ExecutionContext::Interactive
        );
        assert!("desktop".parse::<ExecutionContext>().is_err());
    }
}
