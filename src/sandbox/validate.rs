use super::CompileOptions;

/// Substrings that are refused anywhere in a submitted source
const FORBIDDEN_CONSTRUCTS: &[&str] = &[
    "#include <windows.h>",
    "#include <unistd.h>",
    "#include <sys/socket.h>",
    "#include <sys/syscall.h>",
    "#include <netinet/in.h>",
    "system(",
    "exec(",
    "popen(",
    "fork(",
    "__asm__",
    "asm volatile",
];

const ENTRY_POINTS: &[&str] = &["int main", "void main"];

const DEFAULT_MAX_SOURCE_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("source code is too large ({size} bytes, limit {limit} bytes)")]
    TooLarge { size: usize, limit: usize },

    #[error("`{0}` is not allowed for security reasons")]
    ForbiddenConstruct(&'static str),

    #[error("no entry point found: define `int main()`")]
    NoEntryPoint,

    #[error("invalid {kind} `{value}`")]
    InvalidOption { kind: &'static str, value: String },
}

/// Cheap textual filter run before any file or process is created
///
/// This is not a parser and not a security boundary on its own; it only
/// rejects the obvious cases early.
#[derive(Debug, Clone)]
pub struct SourceValidator {
    max_source_bytes: usize,
}

impl Default for SourceValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOURCE_BYTES)
    }
}

impl SourceValidator {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    pub fn validate(&self, source: &str) -> Result<(), ValidationError> {
        if source.len() > self.max_source_bytes {
            return Err(ValidationError::TooLarge {
                size: source.len(),
                limit: self.max_source_bytes,
            });
        }

        if let Some(found) = FORBIDDEN_CONSTRUCTS
            .iter()
            .copied()
            .find(|c| source.contains(c))
        {
            return Err(ValidationError::ForbiddenConstruct(found));
        }

        if !ENTRY_POINTS.iter().any(|e| source.contains(e)) {
            return Err(ValidationError::NoEntryPoint);
        }

        Ok(())
    }

    /// Rejects include paths and library names that could smuggle flags
    pub fn validate_options(&self, options: &CompileOptions) -> Result<(), ValidationError> {
        let lists = [
            ("include path", options.includes.as_deref()),
            ("library name", options.libraries.as_deref()),
        ];
        for (kind, values) in lists {
            for value in values.unwrap_or_default() {
                let bad = value.is_empty()
                    || value.starts_with('-')
                    || value.chars().any(|c| c == '\0' || c.is_whitespace());
                if bad {
                    return Err(ValidationError::InvalidOption {
                        kind,
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
