//! String and header matchers shared by routes and RBAC policies.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Regex;

/// Match a string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringMatcher {
    pub pattern: StringPattern,

    /// Compare case-insensitively. Ignored for regex matches.
    #[serde(default)]
    pub ignore_case: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StringPattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Regex(Regex),
}

impl StringMatcher {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            pattern: StringPattern::Exact(value.into()),
            ignore_case: false,
        }
    }

    pub fn prefix(value: impl Into<String>) -> Self {
        Self {
            pattern: StringPattern::Prefix(value.into()),
            ignore_case: false,
        }
    }

    pub fn is_match(&self, value: &str) -> bool {
        let folded = self.fold_case(value);
        match &self.pattern {
            StringPattern::Exact(s) => *folded == *self.fold_case(s),
            StringPattern::Prefix(s) => folded.starts_with(&*self.fold_case(s)),
            StringPattern::Suffix(s) => folded.ends_with(&*self.fold_case(s)),
            StringPattern::Contains(s) => folded.contains(&*self.fold_case(s)),
            StringPattern::Regex(regex) => regex.is_full_match(value),
        }
    }

    fn fold_case<'a>(&self, s: &'a str) -> Cow<'a, str> {
        match self.ignore_case {
            true => Cow::Owned(s.to_ascii_lowercase()),
            false => Cow::Borrowed(s),
        }
    }
}

/// Match a request header by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderMatcher {
    pub name: String,

    #[serde(flatten)]
    pub kind: HeaderMatchKind,

    /// Invert the result of the match. A missing header with an inverted
    /// `Present(true)` match is a match.
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum HeaderMatchKind {
    /// Match if the header is present (`true`) or absent (`false`).
    Present(bool),

    /// Match a header value parsed as an integer against `[start, end)`.
    Range { start: i64, end: i64 },

    /// Match the header value as a string.
    String(StringMatcher),
}

impl HeaderMatcher {
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: HeaderMatchKind::Present(true),
            invert: false,
        }
    }

    pub fn exact(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: HeaderMatchKind::String(StringMatcher::exact(value)),
            invert: false,
        }
    }

    /// Match against a header value. Multiple values for the same header
    /// should already be joined with `,`.
    pub fn is_match(&self, value: Option<&str>) -> bool {
        let matched = match (&self.kind, value) {
            (HeaderMatchKind::Present(present), v) => v.is_some() == *present,
            (_, None) => return false,
            (HeaderMatchKind::Range { start, end }, Some(v)) => v
                .parse::<i64>()
                .is_ok_and(|v| *start <= v && v < *end),
            (HeaderMatchKind::String(m), Some(v)) => m.is_match(v),
        };

        matched != self.invert
    }

    /// Match against a full set of request headers.
    ///
    /// Binary (`-bin`) headers are treated as absent, and repeated headers
    /// are matched as a single comma-joined value.
    pub fn is_match_headers(&self, headers: &http::HeaderMap) -> bool {
        if self.name.ends_with("-bin") {
            return self.is_match(None);
        }

        let value = header_value(headers, &self.name);
        self.is_match(value.as_deref())
    }
}

/// Get a header's value, joining repeated values with `,`.
///
/// Returns `None` if the header is missing or any value is not valid UTF-8.
pub fn header_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    let mut values = headers.get_all(name).iter();
    let first = values.next()?.to_str().ok()?;

    let mut joined = first.to_string();
    for value in values {
        joined.push(',');
        joined.push_str(value.to_str().ok()?);
    }
    Some(joined)
}
