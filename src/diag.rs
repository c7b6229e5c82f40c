use std::io::{self, IsTerminal, Write};

use colored::Colorize;
use serde::Serialize;

use crate::source::SourceFile;
use crate::token::Token;

/// Severity of a diagnostic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagLevel {
    Error,
    Warning,
    Note,
}

/// A single diagnostic against a source position.
///
/// `length` drives the `^~~~` underline; both `column` and `length` are in
/// character units.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub level: DiagLevel,
    pub message: String,
    pub line: usize,
    pub column: usize,
    pub length: usize,
}

/// Collects diagnostics during a compilation pass and renders them in
/// Clang style. Records are retained so hosts can also consume them
/// structurally instead of as text.
pub struct Diagnostics {
    records: Vec<Diagnostic>,
    error_count: usize,
    warning_count: usize,
    max_errors: usize,
    use_color: bool,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            error_count: 0,
            warning_count: 0,
            max_errors: 100,
            use_color: io::stdout().is_terminal(),
        }
    }

    pub fn error(&mut self, message: impl Into<String>, line: usize, column: usize, length: usize) {
        self.error_count += 1;
        self.records.push(Diagnostic {
            level: DiagLevel::Error,
            message: message.into(),
            line,
            column,
            length,
        });
    }

    pub fn error_at(&mut self, message: impl Into<String>, tok: &Token) {
        self.error(message, tok.line, tok.column, tok.length.max(1));
    }

    pub fn warning(&mut self, message: impl Into<String>, line: usize, column: usize, length: usize) {
        self.warning_count += 1;
        self.records.push(Diagnostic {
            level: DiagLevel::Warning,
            message: message.into(),
            line,
            column,
            length,
        });
    }

    pub fn note(&mut self, message: impl Into<String>, line: usize, column: usize, length: usize) {
        self.records.push(Diagnostic {
            level: DiagLevel::Note,
            message: message.into(),
            line,
            column,
            length,
        });
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    /// Compilation stops gathering once the error cap is reached.
    pub fn set_max_errors(&mut self, max: usize) {
        self.max_errors = max;
    }

    pub fn should_abort(&self) -> bool {
        self.error_count >= self.max_errors
    }

    pub fn set_use_color(&mut self, use_color: bool) {
        self.use_color = use_color;
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.records
    }

    /// Render every record against the given source:
    ///
    /// ```text
    /// <filename>:<line>:<col>: <level>: <message>
    ///     <source line>
    ///     <spaces to col>^<length-1 tildes>
    /// ```
    pub fn render(&self, src: &SourceFile, out: &mut impl Write) -> io::Result<()> {
        for diag in &self.records {
            self.render_one(diag, src, out)?;
        }
        Ok(())
    }

    fn render_one(&self, diag: &Diagnostic, src: &SourceFile, out: &mut impl Write) -> io::Result<()> {
        let heading = format!("{}:{}:{}:", src.filename(), diag.line, diag.column);
        let level = match diag.level {
            DiagLevel::Error => "error:",
            DiagLevel::Warning => "warning:",
            DiagLevel::Note => "note:",
        };

        if self.use_color {
            let colored_level = match diag.level {
                DiagLevel::Error => level.red().bold(),
                DiagLevel::Warning => level.yellow().bold(),
                DiagLevel::Note => level.cyan().bold(),
            };
            writeln!(
                out,
                "{} {} {}",
                heading.white().bold(),
                colored_level,
                diag.message.white().bold()
            )?;
        } else {
            writeln!(out, "{heading} {level} {}", diag.message)?;
        }

        let line = src.line(diag.line);
        if !line.is_empty() {
            writeln!(out, "    {line}")?;
            let caret = Self::caret(diag.column, diag.length);
            if self.use_color {
                writeln!(out, "    {}", caret.green())?;
            } else {
                writeln!(out, "    {caret}")?;
            }
        }
        Ok(())
    }

    fn caret(column: usize, length: usize) -> String {
        let mut s = " ".repeat(column.saturating_sub(1));
        s.push('^');
        for _ in 1..length.max(1) {
            s.push('~');
        }
        s
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
