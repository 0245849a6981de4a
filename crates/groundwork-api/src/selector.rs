//! Selector tags: the `<kind>:<implementation>` names builders and runners answer to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which registry a selector is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Builder,
    Runner,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentKind::Builder => write!(f, "builder"),
            ComponentKind::Runner => write!(f, "runner"),
        }
    }
}

/// Errors produced when parsing a selector string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorParseError {
    #[error("selector must not be empty")]
    Empty,

    #[error("selector {0:?} is missing the ':' separator; expected <kind>:<implementation>")]
    MissingSeparator(String),

    #[error("selector {0:?} has more than one ':' separator")]
    TooManySeparators(String),

    #[error("selector {0:?} has an empty kind or implementation")]
    EmptyPart(String),

    #[error("selector {0:?} contains whitespace")]
    Whitespace(String),
}

/// A two-part component name, e.g. `exec:go` or `local:docker`.
///
/// For builders the kind names the artifact family (`exec`, `docker`); runners
/// list the builder kinds they can consume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    kind: String,
    implementation: String,
}

impl Selector {
    /// Build a selector from its parts, applying the same rules as parsing.
    pub fn new(kind: &str, implementation: &str) -> Result<Self, SelectorParseError> {
        format!("{kind}:{implementation}").parse()
    }

    /// Selector for a built-in backend's id. The parts are not validated, so
    /// only use it with literals.
    pub fn from_static(kind: &'static str, implementation: &'static str) -> Self {
        debug_assert!(Self::new(kind, implementation).is_ok());
        Selector {
            kind: kind.to_string(),
            implementation: implementation.to_string(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn implementation(&self) -> &str {
        &self.implementation
    }
}

impl FromStr for Selector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SelectorParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(SelectorParseError::Whitespace(s.to_string()));
        }

        let mut parts = s.split(':');
        let (kind, implementation) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(i), None) => (k, i),
            (Some(_), None, _) => return Err(SelectorParseError::MissingSeparator(s.to_string())),
            _ => return Err(SelectorParseError::TooManySeparators(s.to_string())),
        };

        if kind.is_empty() || implementation.is_empty() {
            return Err(SelectorParseError::EmptyPart(s.to_string()));
        }

        Ok(Selector {
            kind: kind.to_string(),
            implementation: implementation.to_string(),
        })
    }
}

impl TryFrom<String> for Selector {
    type Error = SelectorParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Selector> for String {
    fn from(s: Selector) -> Self {
        s.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.implementation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed() {
        let s: Selector = "exec:go".parse().unwrap();
        assert_eq!(s.kind(), "exec");
        assert_eq!(s.implementation(), "go");
        assert_eq!(s.to_string(), "exec:go");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!("".parse::<Selector>(), Err(SelectorParseError::Empty));
        assert!(matches!(
            "docker".parse::<Selector>(),
            Err(SelectorParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "a:b:c".parse::<Selector>(),
            Err(SelectorParseError::TooManySeparators(_))
        ));
        assert!(matches!(
            ":go".parse::<Selector>(),
            Err(SelectorParseError::EmptyPart(_))
        ));
        assert!(matches!(
            "local: exec".parse::<Selector>(),
            Err(SelectorParseError::Whitespace(_))
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let s = Selector::new("local", "exec").unwrap();
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"local:exec\"");

        let back: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);

        assert!(serde_json::from_str::<Selector>("\"nope\"").is_err());
    }
}
