//! Compiler and virtual machine for an extended PL/0 dialect: nested
//! procedures with lexical scoping, integer arithmetic, fixed-size arrays,
//! explicit pointers, and heap allocation. Source is translated to P-Code
//! by a single-pass recursive-descent parser and executed by a stack
//! machine with interactive debugging support.

#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod source;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod diag;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod token;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod symbols;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod code;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod parser;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod optimize;
#[allow(
    clippy::indexing_slicing,
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions
)]
pub mod vm;

use diag::Diagnostics;
use lexer::Lexer;
use parser::Parser;
use source::SourceFile;

/// Knobs for a compilation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    /// Run the basic-block optimizer over the generated code.
    pub optimize: bool,
    /// Capture the parser's AST echo for visualization hosts.
    pub ast_echo: bool,
}

/// Artifacts of a compilation run, produced even when errors were found so
/// hosts can still dump partial symbol tables and code.
pub struct Compilation {
    pub code: code::CodeGen,
    pub symbols: symbols::SymbolTable,
    pub ast: Option<String>,
    /// True only when the diagnostics engine saw no errors.
    pub ok: bool,
}

/// Compile a source unit into P-Code.
///
/// This is the primary entry point for the pipeline:
/// source → lex → parse / generate → (optimize) → `Compilation`.
/// Diagnostics accumulate in `diag`; the pass never bails early on an
/// error, it synchronizes and keeps gathering.
pub fn compile_source(src: &SourceFile, diag: &mut Diagnostics, opts: CompileOptions) -> Compilation {
    let lexer = Lexer::new(src.text());
    let mut parser = Parser::new(lexer, diag);
    if opts.ast_echo {
        parser.enable_ast_echo();
    }
    let parsed = parser.parse();

    let mut compilation = Compilation {
        code: parsed.code,
        symbols: parsed.symbols,
        ast: parsed.ast,
        ok: parsed.ok,
    };

    if opts.optimize && compilation.ok {
        let optimized = optimize::optimize(compilation.code.code());
        compilation.code.set_code(optimized);
    }

    compilation
}
