use std::fs;
use std::io;
use std::path::Path;

/// A loaded source unit: the full text plus an eagerly-built line index.
///
/// The text is preserved verbatim so diagnostics can echo the exact line;
/// the index strips the trailing `\r` of Windows line endings.
pub struct SourceFile {
    filename: String,
    text: String,
    lines: Vec<String>,
}

impl SourceFile {
    /// Load a source file from disk. Bytes that are not valid UTF-8 are
    /// replaced rather than rejected so the lexer can still diagnose them.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Self::from_string(text, &path.display().to_string()))
    }

    /// Load source from an in-memory string (used by hosts and tests).
    pub fn from_string(text: impl Into<String>, filename: &str) -> Self {
        let text = text.into();
        let lines = text.lines().map(String::from).collect();
        Self {
            filename: filename.to_string(),
            text,
            lines,
        }
    }

    /// Source line by 1-based number; the empty string out of range.
    pub fn line(&self, n: usize) -> &str {
        if n == 0 {
            return "";
        }
        self.lines.get(n - 1).map_or("", String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
