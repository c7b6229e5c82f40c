use crate::code::{CodeGen, OpCode, Opr};
use crate::diag::Diagnostics;
use crate::lexer::Lexer;
use crate::symbols::{SymbolKind, SymbolTable};
use crate::token::{Token, TokenKind};

/// Everything the parse pass produces. `ok` is true only when the
/// diagnostics engine saw no errors.
pub struct ParseOutput {
    pub code: CodeGen,
    pub symbols: SymbolTable,
    pub ast: Option<String>,
    pub ok: bool,
}

/// Single-pass recursive-descent parser that drives the symbol table and
/// code generator together, emitting P-Code on the fly with backpatched
/// forward jumps.
pub struct Parser<'src, 'd> {
    lexer: Lexer<'src>,
    diag: &'d mut Diagnostics,
    symbols: SymbolTable,
    code: CodeGen,

    current: Token,
    previous: Token,

    ast_echo: Option<String>,
    ast_indent: usize,

    /// Frame slot reserved for bounds-check spills in the current block.
    temp_offset: i64,
}

impl<'src, 'd> Parser<'src, 'd> {
    pub fn new(lexer: Lexer<'src>, diag: &'d mut Diagnostics) -> Self {
        let mut parser = Self {
            lexer,
            diag,
            symbols: SymbolTable::new(),
            code: CodeGen::new(),
            current: Token::default(),
            previous: Token::default(),
            ast_echo: None,
            ast_indent: 0,
            temp_offset: 3,
        };
        parser.advance();
        parser
    }

    /// Capture an indented `+ node` line per grammar production entered.
    pub fn enable_ast_echo(&mut self) {
        self.ast_echo = Some(String::new());
    }

    pub fn parse(mut self) -> ParseOutput {
        self.parse_program();

        if self.check(TokenKind::Period) {
            self.error_here("unexpected '.' after end of program");
        } else if !self.check(TokenKind::Eof) {
            self.error_here("expected end of file");
        }

        let ok = !self.diag.has_errors();
        ParseOutput {
            code: self.code,
            symbols: self.symbols,
            ast: self.ast_echo,
            ok,
        }
    }

    // ── Token plumbing ─────────────────────────────────────────────

    fn advance(&mut self) {
        self.previous = std::mem::take(&mut self.current);
        self.current = self.lexer.next_token(self.diag);

        // Unknown tokens were already diagnosed by the lexer.
        while self.current.kind == TokenKind::Unknown {
            self.current = self.lexer.next_token(self.diag);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, msg: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_here(msg);
    }

    fn error_here(&mut self, msg: impl Into<String>) {
        self.diag.error_at(msg, &self.current);
    }

    fn error_at_prev(&mut self, msg: impl Into<String>) {
        self.diag.error_at(msg, &self.previous);
    }

    fn emit(&mut self, op: OpCode, l: usize, a: i64) -> usize {
        self.code.emit(op, l, a, self.previous.line)
    }

    fn emit_opr(&mut self, opr: Opr) -> usize {
        self.emit(OpCode::Opr, 0, opr as i64)
    }

    /// Skip tokens to the next statement boundary after an error. Stops at
    /// the separating `;` (without consuming it) or at a keyword that can
    /// begin a statement, so the enclosing body keeps parsing.
    fn synchronize(&mut self) {
        while !self.check(TokenKind::Eof) {
            match self.current.kind {
                TokenKind::Semicolon
                | TokenKind::Begin
                | TokenKind::End
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Call
                | TokenKind::Read
                | TokenKind::Write
                | TokenKind::Const
                | TokenKind::Var
                | TokenKind::Procedure => return,
                _ => self.advance(),
            }
        }
    }

    // ── AST echo ───────────────────────────────────────────────────

    fn ast_enter(&mut self, label: &str) {
        if let Some(out) = &mut self.ast_echo {
            for _ in 0..self.ast_indent {
                out.push_str("  ");
            }
            out.push_str("+ ");
            out.push_str(label);
            out.push('\n');
            self.ast_indent += 1;
        }
    }

    fn ast_leave(&mut self) {
        if self.ast_echo.is_some() {
            self.ast_indent = self.ast_indent.saturating_sub(1);
        }
    }

    // ── Declarations ───────────────────────────────────────────────

    fn parse_program(&mut self) {
        self.ast_enter("Program");
        self.expect(TokenKind::Program, "expected 'program'");
        self.expect(TokenKind::Ident, "expected program name");
        self.expect(TokenKind::Semicolon, "expected ';'");

        self.parse_main_block();

        if self.check(TokenKind::Period) {
            self.error_here("unexpected '.' at end of program");
            self.advance();
        } else if !self.check(TokenKind::Eof) {
            self.error_here("expected end of file");
        }
        self.ast_leave();
    }

    /// The main program block. Slot 3 is the bounds-check temp; variables
    /// start at offset 4.
    fn parse_main_block(&mut self) {
        self.ast_enter("Block");

        let mut data_offset: i64 = 4;
        let old_temp = self.temp_offset;
        self.temp_offset = 3;

        let jmp_addr = self.emit(OpCode::Jmp, 0, 0);
        self.symbols.enter_scope();

        if self.check(TokenKind::Const) {
            self.parse_const_decl();
        }

        let mut array_indices = Vec::new();
        if self.check(TokenKind::Var) {
            self.parse_var_decl(&mut data_offset, &mut array_indices);
        }

        while self.check(TokenKind::Procedure) {
            self.parse_proc_decl();
            if self.check(TokenKind::Semicolon) {
                self.advance();
            }
        }

        self.code.backpatch(jmp_addr, self.code.next_addr());

        self.emit(OpCode::Int, 0, data_offset);
        self.emit_array_initializers(&array_indices);

        self.parse_body();
        self.emit_opr(Opr::Ret);

        self.symbols.leave_scope();
        self.ast_leave();
        self.temp_offset = old_temp;
    }

    /// Heap-allocate each locally declared array and fill in its two-word
    /// descriptor `(heap-address, size)`.
    fn emit_array_initializers(&mut self, array_indices: &[usize]) {
        for &idx in array_indices {
            let (size, address) = {
                let sym = self.symbols.symbol(idx);
                (sym.size, sym.address)
            };
            self.emit(OpCode::Lit, 0, size);
            self.emit(OpCode::New, 0, 0);
            self.emit(OpCode::Sto, 0, address);
            self.emit(OpCode::Lit, 0, size);
            self.emit(OpCode::Sto, 0, address + 1);
        }
    }

    fn parse_const_decl(&mut self) {
        self.ast_enter("ConstDecl");
        self.advance(); // consume 'const'

        loop {
            self.expect(TokenKind::Ident, "expected constant name");
            let name = self.previous.literal.clone();
            let name_tok = self.previous.clone();

            self.expect(TokenKind::Assign, "expected ':='");

            let mut sign = 1;
            if self.match_tok(TokenKind::Plus) {
                sign = 1;
            } else if self.match_tok(TokenKind::Minus) {
                sign = -1;
            }

            self.expect(TokenKind::Number, "expected integer");
            let value = sign * self.previous.value;

            match self.symbols.register(&name, SymbolKind::Constant, 0) {
                Some(idx) => self.symbols.set_value(idx, value),
                None => self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok),
            }

            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::Semicolon, "expected ';'");
        self.ast_leave();
    }

    fn parse_var_decl(&mut self, data_offset: &mut i64, array_indices: &mut Vec<usize>) {
        self.ast_enter("VarDecl");
        self.advance(); // consume 'var'

        loop {
            self.expect(TokenKind::Ident, "expected variable name");
            let name = self.previous.literal.clone();
            let name_tok = self.previous.clone();

            if self.match_tok(TokenKind::Colon) {
                // Typed form: `p: pointer` or `i: integer`.
                if self.check(TokenKind::Ident) && self.current.literal == "pointer" {
                    self.advance();
                    if self.symbols.register(&name, SymbolKind::Pointer, *data_offset).is_none() {
                        self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok);
                    }
                    *data_offset += 1;
                } else if self.check(TokenKind::Ident) && self.current.literal == "integer" {
                    self.advance();
                    if self.symbols.register(&name, SymbolKind::Variable, *data_offset).is_none() {
                        self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok);
                    }
                    *data_offset += 1;
                } else {
                    self.error_here("expected type 'pointer' or 'integer'");
                }
            } else if self.match_tok(TokenKind::LBracket) {
                // Array declaration: `id[size]`.
                self.expect(TokenKind::Number, "expected array size");
                let mut size = self.previous.value;

                if size <= 0 {
                    self.error_at_prev("array size must be positive");
                    size = 1;
                }

                self.expect(TokenKind::RBracket, "expected ']'");

                match self.symbols.register(&name, SymbolKind::Array, *data_offset) {
                    Some(idx) => {
                        self.symbols.set_size(idx, size);
                        array_indices.push(idx);
                    }
                    None => self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok),
                }

                // Descriptor takes two words.
                *data_offset += 2;
            } else {
                if self.symbols.register(&name, SymbolKind::Variable, *data_offset).is_none() {
                    self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok);
                }
                *data_offset += 1;
            }

            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::Semicolon, "expected ';'");
        self.ast_leave();
    }

    fn parse_proc_decl(&mut self) {
        self.ast_enter("ProcDecl");
        self.advance(); // consume 'procedure'

        self.expect(TokenKind::Ident, "expected procedure name");
        let name = self.previous.literal.clone();
        let name_tok = self.previous.clone();

        // Entry address is patched once the body starts.
        let proc_idx = match self.symbols.register(&name, SymbolKind::Procedure, 0) {
            Some(idx) => Some(idx),
            None => {
                self.diag.error_at(format!("duplicate identifier: {name}"), &name_tok);
                self.symbols.len().checked_sub(1)
            }
        };

        self.expect(TokenKind::LParen, "expected '('");

        let mut param_names = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                self.expect(TokenKind::Ident, "expected parameter name");
                param_names.push(self.previous.literal.clone());
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        let param_count = param_names.len();

        self.expect(TokenKind::RParen, "expected ')'");

        if let Some(idx) = proc_idx {
            self.symbols.set_param_count(idx, param_count);
        }

        self.expect(TokenKind::Semicolon, "expected ';'");

        // Jump over the nested body; control falls through the enclosing
        // scope's declarations.
        let jmp_addr = self.emit(OpCode::Jmp, 0, 0);

        self.symbols.enter_scope();

        // Parameters live at offsets 3, 4, 5, … right after the frame header.
        for (i, param) in param_names.iter().enumerate() {
            if self.symbols.register(param, SymbolKind::Variable, 3 + i as i64).is_none() {
                self.diag.error_at(format!("duplicate parameter: {param}"), &name_tok);
            }
        }

        // One reserved temp slot after the parameters, then locals.
        let old_temp = self.temp_offset;
        self.temp_offset = 3 + param_count as i64;
        let mut data_offset = self.temp_offset + 1;

        if self.check(TokenKind::Const) {
            self.parse_const_decl();
        }

        let mut array_indices = Vec::new();
        if self.check(TokenKind::Var) {
            self.parse_var_decl(&mut data_offset, &mut array_indices);
        }

        while self.check(TokenKind::Procedure) {
            self.parse_proc_decl();
            if self.check(TokenKind::Semicolon) {
                self.advance();
            }
        }

        if let Some(idx) = proc_idx {
            self.symbols.set_address(idx, self.code.next_addr() as i64);
        }
        self.code.backpatch(jmp_addr, self.code.next_addr());

        self.emit(OpCode::Int, 0, data_offset);
        self.emit_array_initializers(&array_indices);

        self.parse_body();
        self.emit_opr(Opr::Ret);

        self.symbols.leave_scope();
        self.ast_leave();
        self.temp_offset = old_temp;
    }

    fn parse_body(&mut self) {
        self.ast_enter("Body");
        self.expect(TokenKind::Begin, "expected 'begin'");

        self.parse_statement();
        while self.match_tok(TokenKind::Semicolon) {
            if self.diag.should_abort() {
                break;
            }
            self.parse_statement();
        }

        self.expect(TokenKind::End, "expected 'end'");
        self.ast_leave();
    }

    // ── Statements ─────────────────────────────────────────────────

    fn parse_statement(&mut self) {
        self.ast_enter("Statement");

        if self.check(TokenKind::Ident) {
            self.advance();
            self.parse_assign_or_array_assign();
        } else if self.check(TokenKind::If) {
            self.parse_if_statement();
        } else if self.check(TokenKind::While) {
            self.parse_while_statement();
        } else if self.check(TokenKind::For) {
            self.parse_for_statement();
        } else if self.check(TokenKind::Call) {
            self.parse_call_statement();
        } else if self.check(TokenKind::Read) {
            self.parse_read_statement();
        } else if self.check(TokenKind::Write) {
            self.parse_write_statement();
        } else if self.check(TokenKind::New) {
            self.parse_new_statement();
        } else if self.check(TokenKind::Delete) {
            self.parse_delete_statement();
        } else if self.check(TokenKind::Star) {
            // Pointer assignment: `*target := value`.
            self.advance();
            self.parse_expression();
            self.expect(TokenKind::Assign, "expected ':='");
            self.parse_expression();
            self.emit(OpCode::Sto, 0, 0);
        } else if self.check(TokenKind::Begin) {
            self.parse_body();
        }
        // Empty statement is valid.

        self.ast_leave();
    }

    fn parse_if_statement(&mut self) {
        self.ast_enter("IfStatement");
        self.advance(); // consume 'if'

        self.parse_condition();
        self.expect(TokenKind::Then, "expected 'then'");

        let jpc_addr = self.emit(OpCode::Jpc, 0, 0);
        self.parse_statement();

        if self.match_tok(TokenKind::Else) {
            let jmp_addr = self.emit(OpCode::Jmp, 0, 0);
            self.code.backpatch(jpc_addr, self.code.next_addr());
            self.parse_statement();
            self.code.backpatch(jmp_addr, self.code.next_addr());
        } else {
            self.code.backpatch(jpc_addr, self.code.next_addr());
        }

        self.ast_leave();
    }

    fn parse_while_statement(&mut self) {
        self.ast_enter("WhileStatement");
        self.advance(); // consume 'while'

        let loop_start = self.code.next_addr();
        self.parse_condition();
        self.expect(TokenKind::Do, "expected 'do'");

        let jpc_addr = self.emit(OpCode::Jpc, 0, 0);
        self.parse_statement();
        self.emit(OpCode::Jmp, 0, loop_start as i64);
        self.code.backpatch(jpc_addr, self.code.next_addr());

        self.ast_leave();
    }

    fn parse_for_statement(&mut self) {
        self.ast_enter("ForStatement");
        self.advance(); // consume 'for'

        self.expect(TokenKind::Ident, "expected loop variable");
        let var_name = self.previous.literal.clone();
        let var_tok = self.previous.clone();

        let Some(var_idx) = self.symbols.lookup(&var_name) else {
            self.diag.error_at(format!("undefined identifier: {var_name}"), &var_tok);
            self.synchronize();
            self.ast_leave();
            return;
        };

        let var_sym = self.symbols.symbol(var_idx).clone();
        if var_sym.kind != SymbolKind::Variable {
            self.diag.error_at("loop variable must be a variable", &var_tok);
        }

        self.expect(TokenKind::Assign, "expected ':='");

        self.parse_expression();
        let level_diff = self.symbols.level() - var_sym.level;
        self.emit(OpCode::Sto, level_diff, var_sym.address);

        let is_downto = if self.match_tok(TokenKind::To) {
            false
        } else if self.match_tok(TokenKind::Downto) {
            true
        } else {
            self.error_here("expected 'to' or 'downto'");
            self.synchronize();
            self.ast_leave();
            return;
        };

        let loop_start = self.code.next_addr();

        // The bound is re-evaluated every iteration on purpose.
        self.emit(OpCode::Lod, level_diff, var_sym.address);
        self.parse_expression();
        self.emit_opr(if is_downto { Opr::Geq } else { Opr::Leq });

        let exit_jpc = self.emit(OpCode::Jpc, 0, 0);

        self.expect(TokenKind::Do, "expected 'do'");
        self.parse_statement();

        // Step the loop variable by ±1 and go round again.
        self.emit(OpCode::Lod, level_diff, var_sym.address);
        self.emit(OpCode::Lit, 0, 1);
        self.emit_opr(if is_downto { Opr::Sub } else { Opr::Add });
        self.emit(OpCode::Sto, level_diff, var_sym.address);
        self.emit(OpCode::Jmp, 0, loop_start as i64);

        self.code.backpatch(exit_jpc, self.code.next_addr());
        self.ast_leave();
    }

    fn parse_call_statement(&mut self) {
        self.ast_enter("CallStatement");
        self.advance(); // consume 'call'

        self.expect(TokenKind::Ident, "expected procedure name");
        let proc_name = self.previous.literal.clone();
        let proc_tok = self.previous.clone();

        let Some(idx) = self.symbols.lookup(&proc_name) else {
            self.diag.error_at(format!("undefined procedure: {proc_name}"), &proc_tok);
            self.synchronize();
            self.ast_leave();
            return;
        };

        let proc_sym = self.symbols.symbol(idx).clone();
        if proc_sym.kind != SymbolKind::Procedure {
            self.diag.error_at(format!("'{proc_name}' is not a procedure"), &proc_tok);
            self.synchronize();
            self.ast_leave();
            return;
        }

        self.expect(TokenKind::LParen, "expected '('");

        // Reserve the SL/DL/RA header slots before the arguments.
        self.emit(OpCode::Int, 0, 3);

        let mut arg_count = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.parse_expression();
                arg_count += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(TokenKind::RParen, "expected ')'");

        if arg_count != proc_sym.param_count {
            self.diag.error_at(
                format!(
                    "argument count mismatch: expected {}, got {arg_count}",
                    proc_sym.param_count
                ),
                &proc_tok,
            );
        }

        // The callee consumes the argument count to find its new base.
        self.emit(OpCode::Lit, 0, arg_count as i64);
        let level_diff = self.symbols.level() - proc_sym.level;
        self.emit(OpCode::Cal, level_diff, proc_sym.address);

        self.ast_leave();
    }

    fn parse_read_statement(&mut self) {
        self.ast_enter("ReadStatement");
        self.advance(); // consume 'read'

        self.expect(TokenKind::LParen, "expected '('");

        loop {
            self.expect(TokenKind::Ident, "expected variable name");
            let name = self.previous.literal.clone();
            let name_tok = self.previous.clone();

            let Some(idx) = self.symbols.lookup(&name) else {
                self.diag.error_at(format!("undefined identifier: {name}"), &name_tok);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
                continue;
            };

            let sym = self.symbols.symbol(idx).clone();
            let level_diff = self.symbols.level() - sym.level;

            if self.check(TokenKind::LBracket) {
                if sym.kind != SymbolKind::Array {
                    self.diag.error_at(format!("'{name}' is not an array"), &name_tok);
                }
                self.parse_array_element_address(&sym);
                self.emit(OpCode::Red, 0, 0); // indirect read
            } else {
                if sym.kind != SymbolKind::Variable && sym.kind != SymbolKind::Pointer {
                    self.diag.error_at(format!("'{name}' is not a variable"), &name_tok);
                    if !self.match_tok(TokenKind::Comma) {
                        break;
                    }
                    continue;
                }
                self.emit(OpCode::Red, level_diff, sym.address);
            }

            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RParen, "expected ')'");
        self.ast_leave();
    }

    fn parse_write_statement(&mut self) {
        self.ast_enter("WriteStatement");
        self.advance(); // consume 'write'

        self.expect(TokenKind::LParen, "expected '('");

        loop {
            self.parse_expression();
            self.emit(OpCode::Wrt, 0, 0);
            if !self.match_tok(TokenKind::Comma) {
                break;
            }
        }

        self.expect(TokenKind::RParen, "expected ')'");
        self.ast_leave();
    }

    fn parse_new_statement(&mut self) {
        self.ast_enter("NewStatement");
        self.advance(); // consume 'new'

        self.expect(TokenKind::LParen, "expected '('");

        self.expect(TokenKind::Ident, "expected variable name");
        let name = self.previous.literal.clone();
        let name_tok = self.previous.clone();

        let idx = self.symbols.lookup(&name);
        if idx.is_none() {
            self.diag.error_at(format!("undefined identifier: {name}"), &name_tok);
        }

        self.expect(TokenKind::Comma, "expected ','");

        self.parse_expression();

        self.expect(TokenKind::RParen, "expected ')'");

        self.emit(OpCode::New, 0, 0);

        // Store the allocated address into the target.
        if let Some(idx) = idx {
            let sym = self.symbols.symbol(idx).clone();
            if sym.kind != SymbolKind::Variable && sym.kind != SymbolKind::Pointer {
                self.diag.error_at(format!("'{name}' is not a variable or pointer"), &name_tok);
            } else {
                let level_diff = self.symbols.level() - sym.level;
                self.emit(OpCode::Sto, level_diff, sym.address);
            }
        }

        self.ast_leave();
    }

    fn parse_delete_statement(&mut self) {
        self.ast_enter("DeleteStatement");
        self.advance(); // consume 'delete'

        self.expect(TokenKind::LParen, "expected '('");

        self.expect(TokenKind::Ident, "expected variable name");
        let name = self.previous.literal.clone();
        let name_tok = self.previous.clone();

        if let Some(idx) = self.symbols.lookup(&name) {
            let sym = self.symbols.symbol(idx).clone();
            if sym.kind != SymbolKind::Variable && sym.kind != SymbolKind::Pointer {
                self.diag.error_at(format!("'{name}' is not a variable or pointer"), &name_tok);
            } else {
                let level_diff = self.symbols.level() - sym.level;
                self.emit(OpCode::Lod, level_diff, sym.address);
                self.emit(OpCode::Del, 0, 0);
            }
        } else {
            self.diag.error_at(format!("undefined identifier: {name}"), &name_tok);
        }

        self.expect(TokenKind::RParen, "expected ')'");
        self.ast_leave();
    }

    fn parse_assign_or_array_assign(&mut self) {
        self.ast_enter("AssignStatement");

        let name = self.previous.literal.clone();
        let id_tok = self.previous.clone();

        let Some(idx) = self.symbols.lookup(&name) else {
            self.diag.error_at(format!("undefined identifier: {name}"), &id_tok);
            self.synchronize();
            self.ast_leave();
            return;
        };

        let sym = self.symbols.symbol(idx).clone();
        let level_diff = self.symbols.level() - sym.level;

        if self.check(TokenKind::LBracket) {
            // Array assignment: `arr[i] := expr` through the absolute
            // element address.
            self.parse_array_element_address(&sym);

            self.expect(TokenKind::Assign, "expected ':='");
            self.parse_expression();

            self.emit(OpCode::Sto, 0, 0);
        } else {
            if sym.kind != SymbolKind::Variable && sym.kind != SymbolKind::Pointer {
                self.diag.error_at(
                    "cannot assign to constant, procedure, or array (without index)",
                    &id_tok,
                );
            }

            self.expect(TokenKind::Assign, "expected ':='");
            self.parse_expression();

            self.emit(OpCode::Sto, level_diff, sym.address);
        }

        self.ast_leave();
    }

    /// Emit code that leaves the absolute address of `sym[index]` on the
    /// stack. Declared arrays get the inline bounds check; a failing check
    /// lands in an error block that forces a division-by-zero trap. Pointer
    /// indexing skips the check.
    fn parse_array_element_address(&mut self, sym: &crate::symbols::Symbol) {
        if sym.kind != SymbolKind::Array
            && sym.kind != SymbolKind::Pointer
            && sym.kind != SymbolKind::Variable
        {
            self.error_here("identifier cannot be indexed");
        }

        let level_diff = self.symbols.level() - sym.level;

        // Heap base: descriptor word 0 for arrays, the value itself for
        // pointers and plain variables.
        self.emit(OpCode::Lod, level_diff, sym.address);

        self.expect(TokenKind::LBracket, "expected '['");
        self.parse_expression();
        self.expect(TokenKind::RBracket, "expected ']'");

        if sym.kind == SymbolKind::Array {
            let temp = self.temp_offset;

            // Spill the index so both checks can reload it.
            self.emit(OpCode::Sto, 0, temp);

            // index >= 0
            self.emit(OpCode::Lod, 0, temp);
            self.emit(OpCode::Lit, 0, 0);
            self.emit_opr(Opr::Geq);
            let jpc_fail1 = self.emit(OpCode::Jpc, 0, 0);

            // index < size (descriptor word 1)
            self.emit(OpCode::Lod, 0, temp);
            self.emit(OpCode::Lod, level_diff, sym.address + 1);
            self.emit_opr(Opr::Lss);
            let jpc_fail2 = self.emit(OpCode::Jpc, 0, 0);

            // Reload the index and form the absolute address.
            self.emit(OpCode::Lod, 0, temp);
            self.emit_opr(Opr::Add);

            let jump_over_error = self.emit(OpCode::Jmp, 0, 0);

            let error_addr = self.code.next_addr();
            self.code.backpatch(jpc_fail1, error_addr);
            self.code.backpatch(jpc_fail2, error_addr);

            // Out-of-bounds trap: a forced division by zero.
            self.emit(OpCode::Lit, 0, 0);
            self.emit(OpCode::Lit, 0, 0);
            self.emit_opr(Opr::Div);

            let after = self.code.next_addr();
            self.code.backpatch(jump_over_error, after);
        } else {
            self.emit_opr(Opr::Add);
        }
    }

    // ── Conditions and expressions ─────────────────────────────────

    fn parse_condition(&mut self) {
        self.ast_enter("Condition");

        if self.match_tok(TokenKind::Odd) {
            self.parse_expression();
            self.emit_opr(Opr::Odd);
        } else {
            self.parse_expression();

            let opr = if self.match_tok(TokenKind::Eq) {
                Opr::Eql
            } else if self.match_tok(TokenKind::Ne) {
                Opr::Neq
            } else if self.match_tok(TokenKind::Lt) {
                Opr::Lss
            } else if self.match_tok(TokenKind::Le) {
                Opr::Leq
            } else if self.match_tok(TokenKind::Gt) {
                Opr::Gtr
            } else if self.match_tok(TokenKind::Ge) {
                Opr::Geq
            } else {
                self.error_here("expected relational operator");
                self.ast_leave();
                return;
            };

            self.parse_expression();
            self.emit_opr(opr);
        }

        self.ast_leave();
    }

    fn parse_expression(&mut self) {
        self.ast_enter("Expression");

        let mut negate = false;
        if self.match_tok(TokenKind::Plus) {
            // Leading plus is a no-op.
        } else if self.match_tok(TokenKind::Minus) {
            negate = true;
        }

        self.parse_term();
        if negate {
            self.emit_opr(Opr::Neg);
        }

        while self.check(TokenKind::Plus) || self.check(TokenKind::Minus) {
            let op = self.current.kind;
            self.advance();
            self.parse_term();
            self.emit_opr(if op == TokenKind::Plus { Opr::Add } else { Opr::Sub });
        }

        self.ast_leave();
    }

    fn parse_term(&mut self) {
        self.ast_enter("Term");

        self.parse_factor();

        while self.check(TokenKind::Star)
            || self.check(TokenKind::Slash)
            || self.check(TokenKind::Mod)
        {
            let op = self.current.kind;
            self.advance();
            self.parse_factor();
            self.emit_opr(match op {
                TokenKind::Star => Opr::Mul,
                TokenKind::Slash => Opr::Div,
                _ => Opr::Mod,
            });
        }

        self.ast_leave();
    }

    fn parse_factor(&mut self) {
        self.ast_enter("Factor");

        if self.check(TokenKind::Star) {
            // Dereference: `*p`.
            self.advance();
            self.parse_factor();
            self.emit(OpCode::Lod, 0, 0);
        } else if self.check(TokenKind::Amp) {
            // Address-of: `&x`, `&arr`, `&arr[i]`.
            self.advance();
            self.expect(TokenKind::Ident, "expected identifier after '&'");
            let name = self.previous.literal.clone();
            let name_tok = self.previous.clone();

            let Some(idx) = self.symbols.lookup(&name) else {
                self.diag.error_at(format!("undefined identifier: {name}"), &name_tok);
                self.ast_leave();
                return;
            };
            let sym = self.symbols.symbol(idx).clone();
            let level_diff = self.symbols.level() - sym.level;

            if self.check(TokenKind::LBracket) {
                // `&arr[i]` leaves the element address on the stack.
                self.parse_array_element_address(&sym);
            } else {
                match sym.kind {
                    SymbolKind::Variable | SymbolKind::Pointer => {
                        self.emit(OpCode::Lad, level_diff, sym.address);
                    }
                    SymbolKind::Array => {
                        // Array name decays to its heap address.
                        self.emit(OpCode::Lod, level_diff, sym.address);
                    }
                    _ => {
                        self.diag.error_at("cannot take address of this symbol", &name_tok);
                    }
                }
            }
        } else if self.match_tok(TokenKind::Ident) {
            let name = self.previous.literal.clone();
            let id_tok = self.previous.clone();

            let Some(idx) = self.symbols.lookup(&name) else {
                self.diag.error_at(format!("undefined identifier: {name}"), &id_tok);
                self.ast_leave();
                return;
            };

            let sym = self.symbols.symbol(idx).clone();
            let level_diff = self.symbols.level() - sym.level;

            if self.check(TokenKind::LBracket) {
                self.parse_array_element_address(&sym);
                self.emit(OpCode::Lod, 0, 0);
            } else {
                match sym.kind {
                    SymbolKind::Constant => {
                        self.emit(OpCode::Lit, 0, sym.value);
                    }
                    SymbolKind::Variable | SymbolKind::Pointer => {
                        self.emit(OpCode::Lod, level_diff, sym.address);
                    }
                    SymbolKind::Array => {
                        self.diag.error_at(
                            format!("cannot use array '{name}' without subscript"),
                            &id_tok,
                        );
                    }
                    SymbolKind::Procedure => {
                        self.diag.error_at("invalid identifier type", &id_tok);
                    }
                }
            }
        } else if self.match_tok(TokenKind::Number) {
            let value = self.previous.value;
            self.emit(OpCode::Lit, 0, value);
        } else if self.match_tok(TokenKind::LParen) {
            self.parse_expression();
            self.expect(TokenKind::RParen, "expected ')'");
        } else {
            self.error_here("unexpected token in expression");
            self.advance();
        }

        self.ast_leave();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse_src(src: &str) -> (ParseOutput, Diagnostics) {
        let mut diag = Diagnostics::new();
        diag.set_use_color(false);
        let lexer = Lexer::new(src);
        let out = Parser::new(lexer, &mut diag).parse();
        (out, diag)
    }

    fn assert_clean(src: &str) -> ParseOutput {
        let (out, diag) = parse_src(src);
        assert!(
            out.ok,
            "expected clean parse, got: {:?}",
            diag.records().iter().map(|r| r.message.clone()).collect::<Vec<_>>()
        );
        out
    }

    #[test]
    fn minimal_program() {
        let out = assert_clean("program p; begin end");
        // JMP over decls, INT, RET.
        let code = out.code.code();
        assert_eq!(code[0].op, OpCode::Jmp);
        assert_eq!(code[1].op, OpCode::Int);
        assert!(code.last().unwrap().is_return());
    }

    #[test]
    fn jump_targets_in_range() {
        let out = assert_clean(
            "program p; var x;\nbegin\n  x := 0;\n  while x < 10 do\n    if odd x then x := x + 3 else x := x + 1\nend",
        );
        let code = out.code.code();
        for instr in code {
            if matches!(instr.op, OpCode::Jmp | OpCode::Jpc) {
                let a = instr.a;
                assert!(a >= 0 && (a as usize) < code.len(), "dangling jump {instr:?}");
            }
        }
    }

    #[test]
    fn call_targets_procedure_entries() {
        let out = assert_clean(
            "program p; var x;\nprocedure f();\nbegin x := 1 end;\nprocedure g(a, b);\nbegin x := a + b end;\nbegin call f(); call g(1, 2) end",
        );
        let entries: Vec<i64> = out
            .symbols
            .all_symbols()
            .iter()
            .filter(|s| s.kind == SymbolKind::Procedure)
            .map(|s| s.address)
            .collect();
        for instr in out.code.code() {
            if instr.op == OpCode::Cal {
                assert!(entries.contains(&instr.a), "CAL to unknown entry {instr:?}");
            }
        }
    }

    #[test]
    fn direct_slots_skip_frame_header() {
        let out = assert_clean(
            "program p; var x, y, a[2];\nprocedure f(n);\nvar m;\nbegin m := n end;\nbegin x := 1; y := x; a[0] := y; call f(x) end",
        );
        for instr in out.code.code() {
            if matches!(instr.op, OpCode::Sto | OpCode::Lod) && instr.a != 0 {
                assert!(instr.a >= 3, "frame slot below header: {instr:?}");
            }
        }
    }

    #[test]
    fn const_decl_registers_values() {
        let out = assert_clean("program p; const a := 5, b := -3; begin write(a + b) end");
        let syms = out.symbols.all_symbols();
        let a = syms.iter().find(|s| s.name == "a").unwrap();
        let b = syms.iter().find(|s| s.name == "b").unwrap();
        assert_eq!(a.value, 5);
        assert_eq!(b.value, -3);
        assert_eq!(a.kind, SymbolKind::Constant);
    }

    #[test]
    fn array_descriptor_gets_two_words() {
        let out = assert_clean("program p; var a[4], x; begin x := a[0] end");
        let syms = out.symbols.all_symbols();
        let a = syms.iter().find(|s| s.name == "a").unwrap();
        let x = syms.iter().find(|s| s.name == "x").unwrap();
        assert_eq!(a.address, 4);
        assert_eq!(a.size, 4);
        assert_eq!(x.address, 6); // descriptor occupies 4 and 5
    }

    #[test]
    fn array_init_emitted_at_block_entry() {
        let out = assert_clean("program p; var a[3]; begin a[0] := 1 end");
        let code = out.code.code();
        // After INT: LIT size, NEW, STO desc0, LIT size, STO desc1.
        let int_at = code.iter().position(|i| i.op == OpCode::Int).unwrap();
        assert_eq!(code[int_at + 1].op, OpCode::Lit);
        assert_eq!(code[int_at + 1].a, 3);
        assert_eq!(code[int_at + 2].op, OpCode::New);
        assert_eq!(code[int_at + 3].op, OpCode::Sto);
        assert_eq!(code[int_at + 5].op, OpCode::Sto);
    }

    #[test]
    fn bounds_check_contains_divide_trap() {
        let out = assert_clean("program p; var a[3], i; begin i := a[1] end");
        let code = out.code.code();
        // The error block is LIT 0, LIT 0, OPR DIV.
        let has_trap = code.windows(3).any(|w| {
            w[0].op == OpCode::Lit
                && w[0].a == 0
                && w[1].op == OpCode::Lit
                && w[1].a == 0
                && w[2].op == OpCode::Opr
                && w[2].a == Opr::Div as i64
        });
        assert!(has_trap, "missing bounds trap");
    }

    #[test]
    fn pointer_index_skips_bounds_check() {
        let out = assert_clean("program p; var q: pointer; begin q[1] := 5 end");
        let code = out.code.code();
        let jpc_count = code.iter().filter(|i| i.op == OpCode::Jpc).count();
        assert_eq!(jpc_count, 0, "pointer indexing must not emit checks");
    }

    #[test]
    fn call_convention_sequence() {
        let out = assert_clean(
            "program p; var x; procedure f(a); begin x := a end; begin call f(7) end",
        );
        let code = out.code.code();
        let cal_at = code.iter().position(|i| i.op == OpCode::Cal).unwrap();
        // … INT 0,3; LIT 7; LIT 1 (argc); CAL.
        assert_eq!(code[cal_at - 1].op, OpCode::Lit);
        assert_eq!(code[cal_at - 1].a, 1);
        assert_eq!(code[cal_at - 2].a, 7);
        let int3 = &code[cal_at - 3];
        assert_eq!((int3.op, int3.a), (OpCode::Int, 3));
    }

    #[test]
    fn duplicate_identifier_reported() {
        let (_, diag) = parse_src("program p; var x, x; begin end");
        assert!(diag.records().iter().any(|r| r.message.contains("duplicate identifier: x")));
    }

    #[test]
    fn undefined_identifier_reported() {
        let (_, diag) = parse_src("program p; begin y := 1 end");
        assert!(diag.records().iter().any(|r| r.message.contains("undefined identifier: y")));
    }

    #[test]
    fn calling_a_variable_is_a_kind_error() {
        let (_, diag) = parse_src("program p; var x; begin call x() end");
        assert!(diag.records().iter().any(|r| r.message.contains("'x' is not a procedure")));
    }

    #[test]
    fn bare_array_in_expression_rejected() {
        let (_, diag) = parse_src("program p; var a[3], x; begin x := a end");
        assert!(diag
            .records()
            .iter()
            .any(|r| r.message.contains("cannot use array 'a' without subscript")));
    }

    #[test]
    fn nonpositive_array_size_rejected() {
        let (_, diag) = parse_src("program p; var a[0]; begin end");
        assert!(diag.records().iter().any(|r| r.message.contains("array size must be positive")));
    }

    #[test]
    fn argument_count_mismatch_reported() {
        let (_, diag) = parse_src(
            "program p; var x; procedure f(a, b); begin x := a end; begin call f(1) end",
        );
        assert!(diag
            .records()
            .iter()
            .any(|r| r.message.contains("argument count mismatch: expected 2, got 1")));
    }

    #[test]
    fn trailing_period_is_an_error() {
        let (_, diag) = parse_src("program p; begin end.");
        assert!(diag.records().iter().any(|r| r.message.contains("unexpected '.'")));
    }

    #[test]
    fn recovery_gathers_multiple_errors() {
        let (_, diag) = parse_src("program p; var x; begin y := 1; z := 2; x := 3 end");
        let undefined: Vec<_> = diag
            .records()
            .iter()
            .filter(|r| r.message.contains("undefined identifier"))
            .collect();
        assert_eq!(undefined.len(), 2, "parser should keep going after an error");
    }

    #[test]
    fn shadowing_resolves_to_inner_symbol() {
        let out = assert_clean(
            "program p; var x;\nprocedure f();\nvar x;\nbegin x := 1 end;\nbegin x := 2; call f() end",
        );
        // The store inside f must target the local (level diff 0), the one
        // in the main body the global.
        let stores: Vec<_> = out
            .code
            .code()
            .iter()
            .filter(|i| i.op == OpCode::Sto && i.a != 0)
            .collect();
        assert!(stores.iter().any(|i| i.l == 0));
    }

    #[test]
    fn ast_echo_captures_productions() {
        let mut diag = Diagnostics::new();
        diag.set_use_color(false);
        let lexer = Lexer::new("program p; begin write(1) end");
        let mut parser = Parser::new(lexer, &mut diag);
        parser.enable_ast_echo();
        let out = parser.parse();
        let ast = out.ast.unwrap();
        assert!(ast.starts_with("+ Program\n"));
        assert!(ast.contains("  + Block\n"));
        assert!(ast.contains("+ WriteStatement"));
        assert!(ast.contains("+ Expression"));
    }

    #[test]
    fn for_loop_reevaluates_bound() {
        let out = assert_clean("program p; var i, n; begin n := 3; for i := 1 to n do write(i) end");
        // The bound load (LOD of n) must sit inside the loop, i.e. between
        // the loop-start and the back JMP.
        let code = out.code.code();
        let back_jmp = code
            .iter()
            .enumerate()
            .rev()
            .find(|(_, i)| i.op == OpCode::Jmp)
            .map(|(at, i)| (at, i.a as usize))
            .unwrap();
        let n_addr = out
            .symbols
            .all_symbols()
            .iter()
            .find(|s| s.name == "n")
            .unwrap()
            .address;
        let bound_load_inside = code[back_jmp.1..back_jmp.0]
            .iter()
            .any(|i| i.op == OpCode::Lod && i.a == n_addr);
        assert!(bound_load_inside, "bound must be re-evaluated each iteration");
    }

    #[test]
    fn address_of_variable_uses_lad() {
        let out = assert_clean("program p; var x, q: pointer; begin q := &x end");
        assert!(out.code.code().iter().any(|i| i.op == OpCode::Lad));
    }

    #[test]
    fn nested_procedures_and_static_levels() {
        let out = assert_clean(
            "program p; var x;\nprocedure outer();\n  procedure inner();\n  begin x := x + 1 end;\nbegin call inner() end;\nbegin call outer() end",
        );
        // inner writes the global through two static links.
        assert!(out.code.code().iter().any(|i| i.op == OpCode::Sto && i.l == 2));
    }
}
