use std::{borrow::Cow, fmt::Write as _};

/// An error validating or converting configuration.
///
/// Errors are opaque. They carry a message and the path to the field that
/// failed validation, formatted like `virtual_hosts[1].routes[0].match: bad`.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
pub struct Error {
    message: Cow<'static, str>,

    // reversed: the leaf field is path[0], the root is last. context gets
    // pushed on as an error bubbles up through conversion functions.
    path: Vec<PathEntry>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.path.is_empty() {
            write!(f, "{}: ", self.path())?;
        }

        f.write_str(&self.message)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Error")
            .field("message", &self.message)
            .field("path", &self.path())
            .finish()
    }
}

impl Error {
    /// The path to the field that caused this error.
    pub fn path(&self) -> String {
        let mut buf = String::with_capacity(16);

        for (i, entry) in self.path.iter().rev().enumerate() {
            if i > 0 && matches!(entry, PathEntry::Field(_)) {
                buf.push('.');
            }
            let _ = write!(&mut buf, "{entry}");
        }

        buf
    }

    /// The error message without any path context.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn new(message: String) -> Self {
        Self {
            message: Cow::Owned(message),
            path: vec![],
        }
    }

    pub(crate) fn new_static(message: &'static str) -> Self {
        Self {
            message: Cow::Borrowed(message),
            path: vec![],
        }
    }

    pub(crate) fn with_field(mut self, field: &'static str) -> Self {
        self.path.push(PathEntry::Field(field));
        self
    }

    pub(crate) fn with_index(mut self, index: usize) -> Self {
        self.path.push(PathEntry::Index(index));
        self
    }
}

/// Add field-path context to a `Result`. Context is added at the callsite, so
/// a conversion function adds its own fields and the final path reads from
/// root to leaf.
#[allow(unused)]
pub(crate) trait ErrorContext<T>: Sized {
    fn with_field(self, field: &'static str) -> Result<T, Error>;
    fn with_index(self, index: usize) -> Result<T, Error>;

    /// Shorthand for `with_field(b).with_field(a)`.
    fn with_fields(self, a: &'static str, b: &'static str) -> Result<T, Error> {
        self.with_field(b).with_field(a)
    }

    /// Shorthand for `with_index(idx).with_field(name)`.
    fn with_field_index(self, field: &'static str, index: usize) -> Result<T, Error> {
        self.with_index(index).with_field(field)
    }
}

impl<T> ErrorContext<T> for Result<T, Error> {
    fn with_field(self, field: &'static str) -> Result<T, Error> {
        self.map_err(|e| e.with_field(field))
    }

    fn with_index(self, index: usize) -> Result<T, Error> {
        self.map_err(|e| e.with_index(index))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathEntry {
    Field(&'static str),
    Index(usize),
}

impl std::fmt::Display for PathEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathEntry::Field(field) => f.write_str(field),
            PathEntry::Index(idx) => write!(f, "[{idx}]"),
        }
    }
}
