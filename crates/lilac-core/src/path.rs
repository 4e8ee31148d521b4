//! Path parts, normalization, and leaf-ordering helpers (§3 "Paths", §4.1).

use std::fmt;

/// One step of a [`Path`]: descend into a named struct field, descend into
/// a repeated field's items, or descend from a struct-wrapped leaf into its
/// underlying primitive value (the `__value__` sentinel, §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathPart {
    Name(String),
    Wildcard,
    ValueKey,
}

pub const VALUE_KEY: &str = "__value__";
pub const WILDCARD: &str = "*";

impl fmt::Display for PathPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPart::Name(n) => write!(f, "{n}"),
            PathPart::Wildcard => write!(f, "{WILDCARD}"),
            PathPart::ValueKey => write!(f, "{VALUE_KEY}"),
        }
    }
}

impl From<&str> for PathPart {
    fn from(s: &str) -> Self {
        match s {
            WILDCARD => PathPart::Wildcard,
            VALUE_KEY => PathPart::ValueKey,
            other => PathPart::Name(other.to_string()),
        }
    }
}

/// An ordered sequence of path parts addressing a position in a [`crate::schema::Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Path(Vec<PathPart>);

impl Path {
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn parts(&self) -> &[PathPart] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> Option<&PathPart> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&PathPart> {
        self.0.last()
    }

    /// Returns a new path with `part` appended.
    pub fn child(&self, part: impl Into<PathPart>) -> Path {
        let mut parts = self.0.clone();
        parts.push(part.into());
        Path(parts)
    }

    /// Returns a new path with every part of `suffix` appended in order.
    pub fn extend(&self, suffix: &Path) -> Path {
        let mut parts = self.0.clone();
        parts.extend(suffix.0.iter().cloned());
        Path(parts)
    }

    /// The path with its trailing `__value__` part removed, if present.
    pub fn without_value_key(&self) -> Path {
        match self.0.last() {
            Some(PathPart::ValueKey) => Path(self.0[..self.0.len() - 1].to_vec()),
            _ => self.clone(),
        }
    }

    /// The path with any trailing wildcard/value-key parts stripped, used to
    /// build a signal's `parquet_id` (§4.3).
    pub fn without_trailing_value_or_wildcard(&self) -> Path {
        let mut parts = self.0.clone();
        while matches!(parts.last(), Some(PathPart::ValueKey) | Some(PathPart::Wildcard)) {
            parts.pop();
        }
        Path(parts)
    }

    /// Parses a dotted path string, splitting on unquoted `.`. A part quoted
    /// with backticks (`` `a.b` ``) is kept intact even if it contains a dot.
    pub fn normalize(input: &str) -> Path {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        for c in input.chars() {
            match c {
                '`' => in_quotes = !in_quotes,
                '.' if !in_quotes => {
                    parts.push(PathPart::from(current.as_str()));
                    current.clear();
                }
                other => current.push(other),
            }
        }
        if !current.is_empty() || parts.is_empty() {
            parts.push(PathPart::from(current.as_str()));
        }
        Path(parts)
    }
}

impl<const N: usize> From<[&str; N]> for Path {
    fn from(parts: [&str; N]) -> Self {
        Path(parts.iter().map(|p| PathPart::from(*p)).collect())
    }
}

impl From<Vec<PathPart>> for Path {
    fn from(parts: Vec<PathPart>) -> Self {
        Path(parts)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", rendered.join("."))
    }
}
