use std::collections::HashMap;
use std::io::{self, Write};

use serde::Serialize;

/// What an identifier denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    Constant,
    Variable,
    Procedure,
    Array,
    Pointer,
}

impl SymbolKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Constant => "CONST",
            Self::Variable => "VAR",
            Self::Procedure => "PROC",
            Self::Array => "ARRAY",
            Self::Pointer => "POINTER",
        }
    }
}

/// A symbol table entry.
///
/// `address` is a frame offset for variables and pointers (always ≥ 3, the
/// first three slots hold the activation-record header), the offset of the
/// two-word descriptor for arrays, and the entry program counter for
/// procedures. Constants keep their evaluated value in `value` instead.
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Block nesting depth at the declaration; 0 is the main program.
    pub level: usize,
    pub address: i64,
    pub value: i64,
    pub size: i64,
    pub param_count: usize,
    /// Index in the live symbol stack.
    pub table_index: usize,
    /// Index in the never-popped history, kept in sync for dumps.
    pub history_index: usize,
}

/// Lexically-scoped name resolution: a stack of symbols, a hash map from
/// name to the stack indices currently bound to it (innermost last), a
/// scope-start stack, and a full history that survives `leave_scope` so
/// post-compilation dumps can show every symbol ever declared.
pub struct SymbolTable {
    stack: Vec<Symbol>,
    history: Vec<Symbol>,
    names: HashMap<String, Vec<usize>>,
    scope_starts: Vec<usize>,
    level: usize,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            history: Vec::new(),
            names: HashMap::new(),
            scope_starts: vec![0],
            level: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn enter_scope(&mut self) {
        self.level += 1;
        self.scope_starts.push(self.stack.len());
    }

    /// Pop every symbol declared in the current scope and unlink each from
    /// its name list. The history keeps them.
    pub fn leave_scope(&mut self) {
        if self.level == 0 {
            return;
        }
        let scope_start = self.scope_starts.pop().unwrap_or(0);

        while self.stack.len() > scope_start {
            if let Some(sym) = self.stack.pop() {
                self.unlink_name(&sym.name, sym.table_index);
            }
        }
        self.level -= 1;
    }

    /// Register a symbol in the current scope. Fails (returns `None`) only
    /// when the name is already bound *in this scope*; shadowing an outer
    /// scope is fine.
    pub fn register(&mut self, name: &str, kind: SymbolKind, address: i64) -> Option<usize> {
        if self.lookup_current_scope(name).is_some() {
            return None;
        }

        let table_index = self.stack.len();
        let history_index = self.history.len();
        let sym = Symbol {
            name: name.to_string(),
            kind,
            level: self.level,
            address,
            value: 0,
            size: 0,
            param_count: 0,
            table_index,
            history_index,
        };

        self.stack.push(sym.clone());
        self.history.push(sym);
        self.names.entry(name.to_string()).or_default().push(table_index);

        Some(table_index)
    }

    /// Innermost visible binding for a name, O(1) expected.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.names.get(name).and_then(|indices| indices.last().copied())
    }

    /// Like `lookup` but only hits if the innermost binding belongs to the
    /// current scope (used to detect duplicate declarations).
    pub fn lookup_current_scope(&self, name: &str) -> Option<usize> {
        let index = self.lookup(name)?;
        (self.stack[index].level == self.level).then_some(index)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn symbol(&self, index: usize) -> &Symbol {
        &self.stack[index]
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Every symbol ever registered, in registration order.
    pub fn all_symbols(&self) -> &[Symbol] {
        &self.history
    }

    // Field mutators update both the live entry and its historical copy so
    // dumps taken after compilation show final values.

    pub fn set_address(&mut self, index: usize, address: i64) {
        self.stack[index].address = address;
        let h = self.stack[index].history_index;
        if let Some(hist) = self.history.get_mut(h) {
            hist.address = address;
        }
    }

    pub fn set_param_count(&mut self, index: usize, param_count: usize) {
        self.stack[index].param_count = param_count;
        let h = self.stack[index].history_index;
        if let Some(hist) = self.history.get_mut(h) {
            hist.param_count = param_count;
        }
    }

    pub fn set_size(&mut self, index: usize, size: i64) {
        self.stack[index].size = size;
        let h = self.stack[index].history_index;
        if let Some(hist) = self.history.get_mut(h) {
            hist.size = size;
        }
    }

    pub fn set_value(&mut self, index: usize, value: i64) {
        self.stack[index].value = value;
        let h = self.stack[index].history_index;
        if let Some(hist) = self.history.get_mut(h) {
            hist.value = value;
        }
    }

    fn unlink_name(&mut self, name: &str, index: usize) {
        let emptied = if let Some(indices) = self.names.get_mut(name) {
            if let Some(pos) = indices.iter().rposition(|&i| i == index) {
                indices.remove(pos);
            }
            indices.is_empty()
        } else {
            false
        };
        if emptied {
            self.names.remove(name);
        }
    }

    /// Render the complete symbol history as a table.
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "[Symbol Table]")?;
        writeln!(out, "{}", "-".repeat(76))?;
        writeln!(
            out,
            "| {:<5}| {:<15}| {:<8}| {:<6}| {:<12}| {:<12}|",
            "Index", "Name", "Kind", "Level", "Addr/Val", "Size/Params"
        )?;
        writeln!(out, "{}", "-".repeat(76))?;

        for (i, sym) in self.history.iter().enumerate() {
            let (a, b) = match sym.kind {
                SymbolKind::Constant => (sym.value.to_string(), "-".to_string()),
                SymbolKind::Variable | SymbolKind::Pointer => (sym.address.to_string(), "-".to_string()),
                SymbolKind::Array => (sym.address.to_string(), sym.size.to_string()),
                SymbolKind::Procedure => (sym.address.to_string(), sym.param_count.to_string()),
            };
            writeln!(
                out,
                "| {:<5}| {:<15}| {:<8}| {:<6}| {:<12}| {:<12}|",
                i,
                sym.name,
                sym.kind.name(),
                sym.level,
                a,
                b
            )?;
        }

        writeln!(out, "{}", "-".repeat(76))?;
        writeln!(out, "Total symbols: {}", self.history.len())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
