// CLI binary — panicking on unrecoverable errors is standard for CLI tools.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::{ArgAction, Parser};
use colored::Colorize;
use tracing::Level;

use pl0c::diag::Diagnostics;
use pl0c::lexer::Lexer;
use pl0c::source::SourceFile;
use pl0c::token::Token;
use pl0c::vm::{DebugState, Vm};
use pl0c::{compile_source, CompileOptions, Compilation};

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "pl0c",
    about = "Extended PL/0 compiler and P-Code virtual machine",
    version,
    disable_version_flag = true
)]
struct Cli {
    /// Source file to compile (searched in test directories too)
    source: Option<String>,

    /// Print lexer token sequence
    #[arg(long)]
    tokens: bool,

    /// Print abstract syntax tree
    #[arg(long)]
    ast: bool,

    /// Print symbol table
    #[arg(long)]
    sym: bool,

    /// Print generated P-Code instructions
    #[arg(long)]
    code: bool,

    /// Enable all debug outputs (tokens, ast, sym, code)
    #[arg(long)]
    all: bool,

    /// Trace P-Code execution step by step
    #[arg(long)]
    trace: bool,

    /// Compile only, do not execute
    #[arg(long)]
    no_run: bool,

    /// Enable optimizations (constant folding, dead code)
    #[arg(short = 'O', long)]
    optimize: bool,

    /// Enter interactive debug mode
    #[arg(short = 'd', long)]
    debug: bool,

    /// Run batch tests on a directory
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = "test")]
    test: Option<String>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Display version information and exit
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

const EXIT_OK: i32 = 0;
const EXIT_COMPILE_ERROR: i32 = 1;
const EXIT_RUNTIME_ERROR: i32 = 2;
const EXIT_FILE_NOT_FOUND: i32 = 3;
const EXIT_BAD_ARGUMENTS: i32 = 4;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version render through the normal path; anything
            // else is an argument error.
            let code = if e.use_stderr() { EXIT_BAD_ARGUMENTS } else { EXIT_OK };
            let _ = e.print();
            process::exit(code);
        }
    };

    if cli.no_color || !io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    tracing_subscriber::fmt()
        .with_max_level(Level::WARN)
        .with_target(false)
        .init();

    if let Some(dir) = &cli.test {
        process::exit(run_test_mode(dir));
    }

    let Some(input) = &cli.source else {
        // No input file: show usage, like --help.
        let _ = Cli::parse_from(["pl0c", "--help"]);
        return;
    };

    let resolved = resolve_file(input);
    if !resolved.is_file() {
        eprintln!("{} File not found: {input}", "Error:".red().bold());
        suggest_alternatives(input);
        process::exit(EXIT_FILE_NOT_FOUND);
    }

    println!("{}", "Extended PL/0 Compiler".cyan().bold());
    println!("Input file: {}", resolved.display().to_string().bold());
    println!("{}", "=".repeat(50));

    match run_file(&resolved, &cli) {
        Ok(outcome) => {
            if outcome.error_count > 0 {
                process::exit(EXIT_COMPILE_ERROR);
            }
            if outcome.runtime_failed {
                process::exit(EXIT_RUNTIME_ERROR);
            }
            process::exit(EXIT_OK);
        }
        Err(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            process::exit(EXIT_FILE_NOT_FOUND);
        }
    }
}

// ── File resolution ──────────────────────────────────────────────

/// Search for a source file in the current directory, test directories,
/// and their module subdirectories, with or without the `.pl0` extension.
fn resolve_file(filename: &str) -> PathBuf {
    const SEARCH_DIRS: &[&str] = &[".", "test", "../test", "tests", "../tests"];
    const MODULES: &[&str] = &[
        "lexer",
        "parser",
        "semantic",
        "codegen",
        "heap",
        "integration",
        "procedure",
        "array",
        "diagnostics",
        "interpreter",
        "unit",
    ];
    const SUB_DIRS: &[&str] = &["correct", "error", ""];

    let mut candidates = Vec::new();
    let mut add = |base: PathBuf| {
        candidates.push(base.clone());
        if base.extension().is_none() {
            candidates.push(base.with_extension("pl0"));
        }
    };

    add(PathBuf::from(filename));
    for dir in SEARCH_DIRS {
        add(Path::new(dir).join(filename));
        for module in MODULES {
            for sub in SUB_DIRS {
                let mut path = Path::new(dir).join(module);
                if !sub.is_empty() {
                    path = path.join(sub);
                }
                add(path.join(filename));
            }
        }
    }

    candidates
        .into_iter()
        .find(|c| c.is_file())
        .unwrap_or_else(|| PathBuf::from(filename))
}

fn suggest_alternatives(input: &str) {
    let dir = Path::new(input)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let base = Path::new(input)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut suggestions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "pl0") {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stem.contains(&base) || base.contains(&stem) {
                suggestions.push(path.file_name().unwrap().to_string_lossy().into_owned());
            }
        }
    }
    if !suggestions.is_empty() {
        eprintln!("\nDid you mean:");
        for s in suggestions {
            eprintln!("  {}", s.cyan());
        }
    }
}

// ── Compilation driver ───────────────────────────────────────────

struct Outcome {
    error_count: usize,
    runtime_failed: bool,
}

fn run_file(path: &Path, cli: &Cli) -> io::Result<Outcome> {
    let src = SourceFile::from_path(path)?;
    let use_color = !cli.no_color && io::stdout().is_terminal();

    let mut diag = Diagnostics::new();
    diag.set_use_color(use_color);

    if cli.tokens || cli.all {
        let tokens = Lexer::new(src.text()).tokenize(&mut diag);
        print_tokens(&tokens);
    }

    let opts = CompileOptions {
        optimize: cli.optimize,
        ast_echo: cli.ast || cli.all,
    };
    let compilation = compile_source(&src, &mut diag, opts);

    if let Some(ast) = &compilation.ast {
        println!("\n{} Parse Productions:", "[Parser]".cyan().bold());
        println!("{}", "-".repeat(60));
        print!("{ast}");
        println!("{}", "-".repeat(60));
    }

    diag.render(&src, &mut io::stderr())?;

    if cli.sym || cli.all {
        println!();
        compilation.symbols.dump(&mut io::stdout())?;
    }

    if cli.code || cli.all {
        println!();
        compilation.code.dump(&mut io::stdout())?;
    }

    let error_count = diag.error_count();
    let warning_count = diag.warning_count();

    println!("\n{}", "=".repeat(50));
    if error_count == 0 {
        print!("{}", "Compilation successful".green().bold());
    } else {
        print!("{}", "Compilation failed".red().bold());
    }
    println!(" (errors: {error_count}, warnings: {warning_count})");

    let mut outcome = Outcome {
        error_count,
        runtime_failed: false,
    };

    if error_count == 0 && !cli.no_run {
        println!("\n{}", "========== Program Execution ==========".cyan().bold());
        outcome.runtime_failed = execute(compilation, cli);
        println!("{}", "========== Execution Complete ==========".cyan().bold());
    }

    Ok(outcome)
}

/// Run the compiled program; returns true when it ended in a runtime error.
fn execute(compilation: Compilation, cli: &Cli) -> bool {
    let Compilation { code, symbols, .. } = compilation;
    let mut vm = Vm::new(code.into_code());
    vm.set_symbols(symbols);

    if cli.debug {
        println!("{}", "Entering Debug Mode...".yellow());
        println!("Commands: b <line> (break), r (run), s (step), n (next), p <var> (print), q (quit)");
        vm.set_debug_mode(true);
        vm.start();
        debug_repl(&mut vm);
    } else if cli.trace {
        run_with_trace(&mut vm);
    } else {
        vm.run();
    }

    if let Some(err) = vm.error() {
        eprintln!("{} {err}", "Runtime Error:".red().bold());
        return true;
    }
    false
}

/// Step the whole program, printing each instruction with the register
/// file before it executes.
fn run_with_trace(vm: &mut Vm) {
    println!("\n{}", "[Interpreter Trace]".cyan());
    println!("{}", "-".repeat(60));
    vm.start();
    loop {
        if matches!(vm.state(), DebugState::Halted | DebugState::Error) {
            break;
        }
        let (p, b, t, h) = vm.registers();
        if let Some(instr) = vm.code().get(p) {
            println!(
                "{p:4}: L{:3} {:>4} {:2}, {:4}  | B={b:4} T={t:4} H={h:4}",
                instr.line,
                instr.op.name(),
                instr.l,
                instr.a
            );
        }
        vm.step();
    }
}

// ── Interactive debugger ─────────────────────────────────────────

fn debug_repl(vm: &mut Vm) {
    let stdin = io::stdin();

    loop {
        match vm.state() {
            DebugState::Halted | DebugState::Error => {
                println!("Program terminated.");
                return;
            }
            DebugState::WaitingInput => {
                print!("? ");
                let _ = io::stdout().flush();
                let mut line = String::new();
                if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                    vm.stop();
                    continue;
                }
                vm.provide_input(line.trim().parse().unwrap_or(0));
                continue;
            }
            _ => {}
        }

        let line_no = vm.current_line().unwrap_or(0);
        print!("{}", format!("(debug L{line_no})> ").blue().bold());
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };

        match cmd {
            "b" => match words.next().and_then(|w| w.parse().ok()) {
                Some(n) => {
                    vm.set_breakpoint(n);
                    println!("Breakpoint set at line {n}");
                }
                None => println!("Usage: b <line_number>"),
            },
            "r" | "c" => {
                vm.resume();
                if vm.state() == DebugState::Paused {
                    println!("Breakpoint hit at line {}", vm.current_line().unwrap_or(0));
                }
            }
            "s" => vm.step(),
            "n" => vm.step_over(),
            "p" => match words.next() {
                Some(name) => match vm.value_of(name) {
                    Some(value) => println!("{name} = {value}"),
                    None => println!("no such variable: {name}"),
                },
                None => println!("Usage: p <variable_name>"),
            },
            "q" => return,
            _ => println!("Unknown command."),
        }
    }
}

// ── Dumps ────────────────────────────────────────────────────────

fn print_tokens(tokens: &[Token]) {
    println!("\n{} Token Sequence:", "[Lexer]".cyan().bold());
    println!("{}", "-".repeat(76));
    println!(
        "{}",
        format!("| {:<6}| {:<6}| {:<15}| {:<40}|", "Line", "Col", "Type", "Value").bold()
    );
    println!("{}", "-".repeat(76));

    for tok in tokens {
        println!(
            "| {:<6}| {:<6}| {:<15}| {:<40}|",
            tok.line,
            tok.column,
            tok.kind.name(),
            tok.literal
        );
    }

    println!("{}", "-".repeat(76));
    println!("Total tokens: {}", tokens.len().to_string().bold());
}

// ── Batch test runner ────────────────────────────────────────────

struct TestResult {
    name: String,
    dir: String,
    passed: bool,
    message: String,
    duration_ms: f64,
}

fn run_test_mode(dir: &str) -> i32 {
    println!("{} {dir}", "Running tests in:".bold());

    // A missing directory yields no results, which counts as success,
    // matching the original runner.
    if !Path::new(dir).exists() {
        eprintln!("{} Test directory not found: {dir}", "Error:".red());
        return EXIT_OK;
    }

    let mut files = Vec::new();
    collect_test_files(Path::new(dir), &mut files);
    if files.is_empty() {
        eprintln!("{} No test files found in {dir}", "Warning:".yellow());
        return EXIT_OK;
    }
    files.sort();

    let results: Vec<TestResult> = files.iter().map(|path| run_single_test(path)).collect();
    print_test_results(&results);

    if results.iter().any(|r| !r.passed) {
        EXIT_COMPILE_ERROR
    } else {
        EXIT_OK
    }
}

fn collect_test_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_test_files(&path, files);
        } else if path.extension().is_some_and(|e| e == "pl0") {
            files.push(path);
        }
    }
}

fn is_error_test(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == "error" || c.as_os_str() == "errors")
}

/// Only tests that exercise the interpreter get executed; the rest are
/// compile-only.
fn should_run(path: &Path) -> bool {
    let text = path.to_string_lossy();
    text.contains("interpreter") || text.contains("integration")
}

fn run_single_test(path: &Path) -> TestResult {
    let expect_error = is_error_test(path);
    let start = Instant::now();

    let mut failed = false;
    match SourceFile::from_path(path) {
        Ok(src) => {
            let mut diag = Diagnostics::new();
            diag.set_use_color(false);
            let compilation = compile_source(&src, &mut diag, CompileOptions::default());

            if diag.has_errors() {
                failed = true;
            } else if should_run(path) {
                let mut vm = Vm::new(compilation.code.into_code());
                vm.set_symbols(compilation.symbols);
                vm.set_output(|_| {});
                vm.set_input(|| 0);
                vm.run();
                failed = vm.has_error();
            }
        }
        Err(_) => failed = true,
    }

    let passed = if expect_error { failed } else { !failed };
    let message = match (passed, expect_error) {
        (false, true) => "Expected error but compiled and ran successfully".to_string(),
        (false, false) => "Unexpected failure".to_string(),
        _ => String::new(),
    };

    TestResult {
        name: path.file_name().unwrap().to_string_lossy().into_owned(),
        dir: path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .to_string_lossy()
            .into_owned(),
        passed,
        message,
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

fn print_test_results(results: &[TestResult]) {
    println!("\n{}", "TEST RESULTS".cyan().bold());
    println!("{}", "=".repeat(60));

    let mut passed = 0;
    let mut failed = 0;
    let mut total_ms = 0.0;
    let mut current_dir = String::new();

    for r in results {
        if r.dir != current_dir {
            if !current_dir.is_empty() {
                println!();
            }
            current_dir = r.dir.clone();
            println!("  {}", format!("{current_dir}/").bold());
        }

        let tag = if r.passed {
            passed += 1;
            "[PASS]".green().bold()
        } else {
            failed += 1;
            "[FAIL]".red().bold()
        };
        print!("    {tag} {:<35}{:>8.2} ms", r.name, r.duration_ms);
        if !r.passed && !r.message.is_empty() {
            print!("  {}", r.message.yellow());
        }
        println!();
        total_ms += r.duration_ms;
    }

    println!("\n{}", "-".repeat(60));
    println!("{}", "SUMMARY:".bold());
    println!("  Total:  {} tests", (passed + failed).to_string().bold());
    println!("  Passed: {}", passed.to_string().green().bold());
    println!("  Failed: {}", failed.to_string().red().bold());
    println!("  Time:   {total_ms:.2} ms");
    println!("{}", "-".repeat(60));

    if failed == 0 {
        println!("\n{}", "All tests passed!".green().bold());
    } else {
        println!("\n{}", format!("{failed} test(s) failed!").red().bold());
    }
}
