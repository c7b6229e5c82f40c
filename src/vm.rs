use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::io::{self, Write};

use serde::Serialize;
use thiserror::Error;
use tracing::trace;

use crate::code::{Instruction, OpCode, Opr};
use crate::symbols::{SymbolKind, SymbolTable};

/// Default capacity of the unified stack/heap store, in words.
pub const DEFAULT_STORE_SIZE: usize = 10_000;

/// Dynamic-link hop cap for call-stack walks over a corrupted stack.
const CALL_STACK_HOP_CAP: usize = 1_000;

/// Errors raised during execution; each carries the address of the
/// offending instruction.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RuntimeError {
    #[error("division by zero (PC={pc})")]
    DivisionByZero { pc: usize },
    #[error("modulo by zero (PC={pc})")]
    ModuloByZero { pc: usize },
    #[error("access violation: invalid address {address} (PC={pc})")]
    InvalidAddress { address: i64, pc: usize },
    #[error("stack overflow (stack/heap collision) (PC={pc})")]
    StackHeapCollision { pc: usize },
    #[error("stack underflow during call (PC={pc})")]
    CallUnderflow { pc: usize },
    #[error("invalid allocation size (PC={pc})")]
    InvalidAllocationSize { pc: usize },
    #[error("out of memory (heap exhausted) (PC={pc})")]
    OutOfMemory { pc: usize },
    #[error("unknown operation {operand} (PC={pc})")]
    UnknownOperation { operand: i64, pc: usize },
}

/// Debugger state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DebugState {
    Running,
    Paused,
    Halted,
    WaitingInput,
    Error,
}

/// One entry of a call-stack walk.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StackFrame {
    pub base: usize,
    pub static_link: i64,
    pub dynamic_link: i64,
    pub return_address: i64,
}

type OutputFn = Box<dyn FnMut(i64)>;
type InputFn = Box<dyn FnMut() -> i64>;

/// Reads whitespace-separated integers from standard input for batch-mode
/// `RED`. A malformed token is consumed and yields 0.
struct StdinScanner {
    pending: VecDeque<String>,
}

impl StdinScanner {
    fn new() -> Self {
        Self { pending: VecDeque::new() }
    }

    fn next_int(&mut self) -> i64 {
        loop {
            if let Some(tok) = self.pending.pop_front() {
                return tok.parse().unwrap_or(0);
            }
            let mut line = String::new();
            match io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => return 0,
                Ok(_) => self.pending.extend(line.split_whitespace().map(String::from)),
            }
        }
    }
}

/// The P-Code interpreter: a stack machine over a single integer store
/// shared between the stack (growing up from 0) and the heap (growing down
/// from the capacity), with a first-fit coalescing free list and a debugger
/// state machine layered over the fetch-decode-execute loop.
pub struct Vm {
    code: Vec<Instruction>,
    store: Vec<i64>,

    /// Program counter.
    p: usize,
    /// Base of the current frame.
    b: usize,
    /// Stack top (index of the highest occupied slot).
    t: usize,
    /// Heap boundary; every address ≥ `h` is heap. Invariant: `t < h`.
    h: usize,
    /// Head of the address-sorted free list, −1 when empty.
    free_head: i64,

    store_size: usize,
    running: bool,
    error: Option<RuntimeError>,

    debug_mode: bool,
    state: DebugState,
    breakpoints: BTreeSet<usize>,
    symbols: Option<SymbolTable>,

    /// Target address of a `RED` parked for asynchronous input.
    pending_input: Option<usize>,

    output_cb: Option<OutputFn>,
    input_cb: Option<InputFn>,
    stdin: StdinScanner,
}

impl Vm {
    pub fn new(code: Vec<Instruction>) -> Self {
        Self {
            code,
            store: Vec::new(),
            p: 0,
            b: 0,
            t: 0,
            h: 0,
            free_head: -1,
            store_size: DEFAULT_STORE_SIZE,
            running: false,
            error: None,
            debug_mode: false,
            state: DebugState::Halted,
            breakpoints: BTreeSet::new(),
            symbols: None,
            pending_input: None,
            output_cb: None,
            input_cb: None,
            stdin: StdinScanner::new(),
        }
    }

    // ── Configuration ──────────────────────────────────────────────

    pub fn set_store_size(&mut self, size: usize) {
        self.store_size = size;
    }

    pub fn set_debug_mode(&mut self, debug: bool) {
        self.debug_mode = debug;
    }

    /// Attach the compiled symbol table for variable-watch queries.
    pub fn set_symbols(&mut self, symbols: SymbolTable) {
        self.symbols = Some(symbols);
    }

    /// Route `WRT` into the host instead of standard output.
    pub fn set_output(&mut self, cb: impl FnMut(i64) + 'static) {
        self.output_cb = Some(Box::new(cb));
    }

    /// Route `RED` from the host instead of standard input.
    pub fn set_input(&mut self, cb: impl FnMut() -> i64 + 'static) {
        self.input_cb = Some(Box::new(cb));
    }

    pub fn set_breakpoint(&mut self, line: usize) {
        self.breakpoints.insert(line);
    }

    pub fn remove_breakpoint(&mut self, line: usize) {
        self.breakpoints.remove(&line);
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn state(&self) -> DebugState {
        self.state
    }

    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn pc(&self) -> usize {
        self.p
    }

    /// Source line of the next instruction to execute.
    pub fn current_line(&self) -> Option<usize> {
        self.code.get(self.p).map(|i| i.line)
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    /// Registers snapshot `(P, B, T, H)` for tracing hosts.
    pub fn registers(&self) -> (usize, usize, usize, usize) {
        (self.p, self.b, self.t, self.h)
    }

    /// Walk the dynamic links from the current frame outwards, capped so a
    /// corrupted stack cannot loop forever.
    pub fn call_stack(&self) -> Vec<StackFrame> {
        let mut frames = Vec::new();
        let mut base = self.b;
        let mut hops = 0;

        while base > 0 && hops < CALL_STACK_HOP_CAP {
            hops += 1;
            if base + 2 >= self.store.len() {
                break;
            }
            let frame = StackFrame {
                base,
                static_link: self.store[base],
                dynamic_link: self.store[base + 1],
                return_address: self.store[base + 2],
            };
            frames.push(frame);
            match usize::try_from(frame.dynamic_link) {
                Ok(next) => base = next,
                Err(_) => break,
            }
        }
        frames
    }

    /// Watch helper: the value of the innermost variable or pointer with
    /// this name. Resolves `B + offset` against the current frame only;
    /// symbols of enclosing frames read the wrong slot, like the original
    /// debugger this mirrors.
    pub fn value_of(&self, name: &str) -> Option<i64> {
        let symbols = self.symbols.as_ref()?;
        let sym = symbols
            .all_symbols()
            .iter()
            .rev()
            .find(|s| s.name == name && matches!(s.kind, SymbolKind::Variable | SymbolKind::Pointer))?;
        let addr = usize::try_from(self.b as i64 + sym.address).ok()?;
        self.store.get(addr).copied()
    }

    pub fn value_at(&self, address: usize) -> Option<i64> {
        self.store.get(address).copied()
    }

    // ── Execution control ──────────────────────────────────────────

    /// Batch execution: reset, then run to a halt, error, or parked read.
    pub fn run(&mut self) {
        self.start();
        self.resume();
    }

    /// Initialize registers and the store; the machine comes up paused at
    /// `P = 0`, ready for `resume` or `step`.
    pub fn start(&mut self) {
        self.store.clear();
        self.store.resize(self.store_size, 0);
        self.p = 0;
        self.b = 0;
        self.t = 0;
        self.h = self.store_size;
        self.free_head = -1;
        self.running = true;
        self.error = None;
        self.pending_input = None;
        self.state = DebugState::Paused;
    }

    /// Run until a breakpoint, halt, error, or parked read. The breakpoint
    /// set is consulted on the *next* instruction's source line before it
    /// executes.
    pub fn resume(&mut self) {
        if self.is_stopped() {
            return;
        }
        self.state = DebugState::Running;

        while self.running && self.p < self.code.len() {
            let line = self.code[self.p].line;
            if self.breakpoints.contains(&line) {
                self.state = DebugState::Paused;
                return;
            }
            if !self.execute_one() {
                return;
            }
        }

        if self.running {
            self.running = false;
            self.state = DebugState::Halted;
        }
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self) {
        if self.is_stopped() {
            return;
        }
        if self.running && self.p < self.code.len() {
            self.state = DebugState::Running;
            if self.execute_one() {
                self.state = DebugState::Paused;
            }
        } else if self.running {
            self.running = false;
            self.state = DebugState::Halted;
        }
    }

    /// Execute until the source line changes; instructions with line 0
    /// (synthesized code) do not count as a change.
    pub fn step_over(&mut self) {
        if self.is_stopped() {
            return;
        }
        let initial_line = self.current_line().unwrap_or(0);
        self.state = DebugState::Running;

        while self.running && self.p < self.code.len() {
            if !self.execute_one() {
                return;
            }
            match self.current_line() {
                Some(line) if line != initial_line && line != 0 => break,
                Some(_) => {}
                None => break,
            }
        }

        if self.running {
            self.state = DebugState::Paused;
        }
    }

    /// Halt immediately; pending input is discarded.
    pub fn stop(&mut self) {
        self.running = false;
        self.pending_input = None;
        self.state = DebugState::Halted;
    }

    /// Complete a `RED` that parked the machine in `WaitingInput`: the
    /// value lands at the stashed address and the rewound instruction is
    /// stepped past, so the read finishes atomically.
    pub fn provide_input(&mut self, value: i64) {
        let Some(addr) = self.pending_input.take() else {
            return;
        };
        if let Some(slot) = self.store.get_mut(addr) {
            *slot = value;
        }
        self.p += 1;
        self.state = DebugState::Paused;
    }

    fn is_stopped(&self) -> bool {
        matches!(
            self.state,
            DebugState::Halted | DebugState::Error | DebugState::WaitingInput
        )
    }

    // ── Fetch / decode / execute ───────────────────────────────────

    /// Returns false when execution cannot continue (pause, halt, error).
    #[allow(clippy::too_many_lines)]
    fn execute_one(&mut self) -> bool {
        let Some(instr) = self.code.get(self.p).copied() else {
            self.running = false;
            self.state = DebugState::Halted;
            return false;
        };
        self.p += 1;
        let pc = self.p - 1;

        match instr.op {
            OpCode::Lit => {
                if !self.push(instr.a, pc) {
                    return false;
                }
            }

            OpCode::Lod => {
                if instr.a == 0 {
                    // Indirect: pop an absolute address.
                    let addr = self.pop();
                    let Some(addr) = self.checked_addr(addr, pc) else {
                        return false;
                    };
                    let value = self.store[addr];
                    if !self.push(value, pc) {
                        return false;
                    }
                } else {
                    let Some(addr) = self.slot_addr(instr.l, instr.a, pc) else {
                        return false;
                    };
                    let value = self.store[addr];
                    if !self.push(value, pc) {
                        return false;
                    }
                }
            }

            OpCode::Sto => {
                if instr.a == 0 {
                    // Indirect: value on top, address beneath it.
                    let value = self.pop();
                    let addr = self.pop();
                    let Some(addr) = self.checked_addr(addr, pc) else {
                        return false;
                    };
                    self.store[addr] = value;
                } else {
                    let Some(addr) = self.slot_addr(instr.l, instr.a, pc) else {
                        return false;
                    };
                    self.store[addr] = self.pop();
                }
            }

            OpCode::Cal => {
                let param_count = self.pop();
                let new_base = self.t as i64 - param_count - 2;
                let Ok(nb) = usize::try_from(new_base) else {
                    return self.fail(RuntimeError::CallUnderflow { pc });
                };
                if nb + 2 >= self.h {
                    return self.fail(RuntimeError::StackHeapCollision { pc });
                }
                let Some(static_link) = self.base(instr.l, pc) else {
                    return false;
                };
                self.store[nb] = static_link as i64;
                self.store[nb + 1] = self.b as i64;
                self.store[nb + 2] = self.p as i64; // return address
                self.b = nb;
                self.p = jump_target(instr.a);
            }

            OpCode::Int => {
                let new_top = self.t as i64 + instr.a;
                if new_top < 0 || new_top as usize >= self.h {
                    return self.fail(RuntimeError::StackHeapCollision { pc });
                }
                self.t = new_top as usize;
            }

            OpCode::Jmp => {
                self.p = jump_target(instr.a);
            }

            OpCode::Jpc => {
                if self.pop() == 0 {
                    self.p = jump_target(instr.a);
                }
            }

            OpCode::Opr => {
                if !self.execute_opr(instr.a, pc) {
                    return false;
                }
            }

            OpCode::Red => {
                let target = if instr.a == 0 {
                    let addr = self.pop();
                    match self.checked_addr(addr, pc) {
                        Some(addr) => addr,
                        None => return false,
                    }
                } else {
                    match self.slot_addr(instr.l, instr.a, pc) {
                        Some(addr) => addr,
                        None => return false,
                    }
                };

                if let Some(cb) = self.input_cb.as_mut() {
                    self.store[target] = cb();
                } else if self.debug_mode && self.pending_input.is_none() {
                    // Park until the host provides a value; rewind so the
                    // read completes once input arrives.
                    self.pending_input = Some(target);
                    self.state = DebugState::WaitingInput;
                    self.p -= 1;
                    return false;
                } else {
                    print!("? ");
                    let _ = io::stdout().flush();
                    self.store[target] = self.stdin.next_int();
                }
            }

            OpCode::Wrt => {
                let value = self.pop();
                match self.output_cb.as_mut() {
                    Some(cb) => cb(value),
                    None => println!("{value}"),
                }
            }

            OpCode::New => {
                let size = self.pop();
                if size <= 0 {
                    return self.fail(RuntimeError::InvalidAllocationSize { pc });
                }
                let addr = self.allocate(size);
                if addr == -1 {
                    return self.fail(RuntimeError::OutOfMemory { pc });
                }
                if !self.push(addr, pc) {
                    return false;
                }
            }

            OpCode::Del => {
                let addr = self.pop();
                self.deallocate(addr);
            }

            OpCode::Lad => {
                let Some(addr) = self.slot_addr(instr.l, instr.a, pc) else {
                    return false;
                };
                if !self.push(addr as i64, pc) {
                    return false;
                }
            }
        }

        if !self.running {
            self.state = DebugState::Halted;
            return false;
        }
        true
    }

    fn execute_opr(&mut self, operand: i64, pc: usize) -> bool {
        let Some(opr) = Opr::from_operand(operand) else {
            return self.fail(RuntimeError::UnknownOperation { operand, pc });
        };

        match opr {
            Opr::Ret => {
                if self.b == 0 {
                    // Main program frame: normal termination.
                    self.running = false;
                    return true;
                }
                if self.b + 2 >= self.store.len() {
                    return self.fail(RuntimeError::InvalidAddress { address: self.b as i64, pc });
                }
                let return_address = self.store[self.b + 2];
                let dynamic_link = self.store[self.b + 1];
                self.t = self.b - 1;
                self.p = jump_target(return_address);
                match usize::try_from(dynamic_link) {
                    Ok(base) => self.b = base,
                    Err(_) => {
                        return self.fail(RuntimeError::InvalidAddress { address: dynamic_link, pc })
                    }
                }
            }

            Opr::Neg => {
                self.store[self.t] = self.store[self.t].wrapping_neg();
            }
            Opr::Odd => {
                self.store[self.t] %= 2;
            }

            Opr::Add => self.binop(|a, b| a.wrapping_add(b)),
            Opr::Sub => self.binop(|a, b| a.wrapping_sub(b)),
            Opr::Mul => self.binop(|a, b| a.wrapping_mul(b)),

            Opr::Div => {
                self.t = self.t.saturating_sub(1);
                let divisor = self.store[self.t + 1];
                if divisor == 0 {
                    return self.fail(RuntimeError::DivisionByZero { pc });
                }
                self.store[self.t] = self.store[self.t].wrapping_div(divisor);
            }
            Opr::Mod => {
                self.t = self.t.saturating_sub(1);
                let divisor = self.store[self.t + 1];
                if divisor == 0 {
                    return self.fail(RuntimeError::ModuloByZero { pc });
                }
                self.store[self.t] = self.store[self.t].wrapping_rem(divisor);
            }

            Opr::Eql => self.binop(|a, b| i64::from(a == b)),
            Opr::Neq => self.binop(|a, b| i64::from(a != b)),
            Opr::Lss => self.binop(|a, b| i64::from(a < b)),
            Opr::Geq => self.binop(|a, b| i64::from(a >= b)),
            Opr::Gtr => self.binop(|a, b| i64::from(a > b)),
            Opr::Leq => self.binop(|a, b| i64::from(a <= b)),
        }
        true
    }

    // ── Stack primitives ───────────────────────────────────────────

    fn push(&mut self, value: i64, pc: usize) -> bool {
        if self.t + 1 >= self.h {
            return self.fail(RuntimeError::StackHeapCollision { pc });
        }
        self.t += 1;
        self.store[self.t] = value;
        true
    }

    fn pop(&mut self) -> i64 {
        let value = self.store[self.t];
        self.t = self.t.saturating_sub(1);
        value
    }

    fn binop(&mut self, f: impl FnOnce(i64, i64) -> i64) {
        self.t = self.t.saturating_sub(1);
        self.store[self.t] = f(self.store[self.t], self.store[self.t + 1]);
    }

    /// Walk the static link `l` times from the current base.
    fn base(&mut self, l: usize, pc: usize) -> Option<usize> {
        let mut base = self.b;
        for _ in 0..l {
            let link = self.store[base];
            match usize::try_from(link).ok().filter(|&a| a < self.store_size) {
                Some(next) => base = next,
                None => {
                    self.fail(RuntimeError::InvalidAddress { address: link, pc });
                    return None;
                }
            }
        }
        Some(base)
    }

    /// Absolute address of frame slot `(l, a)` with bounds checking.
    fn slot_addr(&mut self, l: usize, a: i64, pc: usize) -> Option<usize> {
        let base = self.base(l, pc)?;
        let addr = base as i64 + a;
        self.checked_addr(addr, pc)
    }

    fn checked_addr(&mut self, addr: i64, pc: usize) -> Option<usize> {
        match usize::try_from(addr).ok().filter(|&a| a < self.store_size) {
            Some(a) => Some(a),
            None => {
                self.fail(RuntimeError::InvalidAddress { address: addr, pc });
                None
            }
        }
    }

    fn fail(&mut self, error: RuntimeError) -> bool {
        self.error = Some(error);
        self.running = false;
        self.state = DebugState::Error;
        false
    }

    // ── Heap: first-fit free list with coalescing ──────────────────

    /// Allocate `size` data words plus one header word. Returns the address
    /// of the first data word, or −1 when the heap is exhausted. Free-list
    /// blocks store their *total* size in the header; allocated blocks
    /// store the user-requested size.
    fn allocate(&mut self, size: i64) -> i64 {
        let total = size + 1;

        let mut prev: i64 = -1;
        let mut curr = self.free_head;
        while curr != -1 {
            let cu = curr as usize;
            let block_size = self.store[cu];

            if block_size >= total {
                let remaining = block_size - total;
                let next_free = self.store[cu + 1];

                if remaining >= 2 {
                    // Split: carve the low end, the remainder becomes a new
                    // free block.
                    let new_node = curr + total;
                    let nn = new_node as usize;
                    self.store[nn] = remaining;
                    self.store[nn + 1] = next_free;
                    if prev == -1 {
                        self.free_head = new_node;
                    } else {
                        self.store[prev as usize + 1] = new_node;
                    }
                } else {
                    // Exact fit, or a remainder too small to host a free
                    // block header: hand out the whole block.
                    if prev == -1 {
                        self.free_head = next_free;
                    } else {
                        self.store[prev as usize + 1] = next_free;
                    }
                }

                self.store[cu] = size;
                trace!(address = curr + 1, size, "heap allocation from free list");
                return curr + 1;
            }

            prev = curr;
            curr = self.store[cu + 1];
        }

        // Nothing fits: grow the heap downward.
        let total_u = total as usize;
        if self.h < total_u || self.h - total_u <= self.t {
            return -1;
        }
        self.h -= total_u;
        self.store[self.h] = size;
        trace!(address = self.h + 1, size, "heap allocation by growth");
        self.h as i64 + 1
    }

    /// Return a block to the free pool, inserting by ascending address and
    /// coalescing with adjacent free neighbors.
    fn deallocate(&mut self, address: i64) {
        if address <= 0 || address as usize >= self.store_size {
            return;
        }
        let block_header = (address - 1) as usize;
        let size = self.store[block_header];
        let mut total = size + 1;

        // Find the insertion point in the sorted list.
        let mut prev: i64 = -1;
        let mut curr = self.free_head;
        while curr != -1 && (curr as usize) < block_header {
            prev = curr;
            curr = self.store[curr as usize + 1];
        }

        // Absorb the successor when physically adjacent.
        if curr != -1 && block_header as i64 + total == curr {
            total += self.store[curr as usize];
            let next_next = self.store[curr as usize + 1];
            self.store[block_header] = total;
            self.store[block_header + 1] = next_next;
        } else {
            self.store[block_header] = total;
            self.store[block_header + 1] = curr;
        }

        // Absorb into the predecessor when physically adjacent.
        if prev != -1 {
            let pu = prev as usize;
            let prev_size = self.store[pu];
            if pu as i64 + prev_size == block_header as i64 {
                self.store[pu] = prev_size + total;
                self.store[pu + 1] = self.store[block_header + 1];
            } else {
                self.store[pu + 1] = block_header as i64;
            }
        } else {
            self.free_head = block_header as i64;
        }
        trace!(address, "heap free");
    }
}

fn jump_target(a: i64) -> usize {
    usize::try_from(a).unwrap_or(usize::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::diag::Diagnostics;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn compile(src: &str) -> (Vec<Instruction>, SymbolTable) {
        let mut diag = Diagnostics::new();
        diag.set_use_color(false);
        let lexer = Lexer::new(src);
        let out = Parser::new(lexer, &mut diag).parse();
        assert!(
            out.ok,
            "compile failed: {:?}",
            diag.records().iter().map(|r| r.message.clone()).collect::<Vec<_>>()
        );
        (out.code.into_code(), out.symbols)
    }

    fn vm_for(src: &str, optimize: bool) -> (Vm, Rc<RefCell<Vec<i64>>>) {
        let (code, symbols) = compile(src);
        let code = if optimize { crate::optimize::optimize(&code) } else { code };
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outputs);
        let mut vm = Vm::new(code);
        vm.set_symbols(symbols);
        vm.set_output(move |v| sink.borrow_mut().push(v));
        (vm, outputs)
    }

    fn run_src(src: &str) -> Vec<i64> {
        let (mut vm, outputs) = vm_for(src, false);
        vm.run();
        assert_eq!(vm.state(), DebugState::Halted, "error: {:?}", vm.error());
        assert!(!vm.has_error());
        let result = outputs.borrow().clone();
        result
    }

    // ── End-to-end scenarios ───────────────────────────────────────

    #[test]
    fn hello_arithmetic() {
        assert_eq!(run_src("program p; begin write(3+4*2) end"), vec![11]);
    }

    #[test]
    fn branching_on_odd() {
        assert_eq!(
            run_src("program p; var x; begin x:=5; if odd x then write(1) else write(0) end"),
            vec![1]
        );
        assert_eq!(
            run_src("program p; var x; begin x:=4; if odd x then write(1) else write(0) end"),
            vec![0]
        );
    }

    #[test]
    fn for_loop_ascending() {
        assert_eq!(
            run_src("program p; var i; begin for i:=1 to 3 do write(i) end"),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn for_loop_descending() {
        assert_eq!(
            run_src("program p; var i; begin for i:=3 downto 1 do write(i) end"),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn procedure_updates_global_through_static_link() {
        assert_eq!(
            run_src(
                "program p; var x; procedure f(); begin x:=x+1 end; begin x:=10; call f(); call f(); write(x) end"
            ),
            vec![12]
        );
    }

    #[test]
    fn procedure_parameters() {
        assert_eq!(
            run_src(
                "program p; var x; procedure add(a, b); begin x := a + b end; begin call add(30, 12); write(x) end"
            ),
            vec![42]
        );
    }

    #[test]
    fn recursion() {
        // factorial(5) via a global accumulator
        assert_eq!(
            run_src(
                "program p; var acc;\nprocedure fact(n);\nbegin\n  if n > 1 then\n  begin\n    acc := acc * n;\n    call fact(n - 1)\n  end\nend;\nbegin acc := 1; call fact(5); write(acc) end"
            ),
            vec![120]
        );
    }

    #[test]
    fn array_with_bounds() {
        assert_eq!(
            run_src("program p; var a[3], i; begin for i:=0 to 2 do a[i]:=i*i; write(a[2]) end"),
            vec![4]
        );
    }

    #[test]
    fn array_out_of_bounds_traps() {
        let (mut vm, _) = vm_for("program p; var a[3]; begin a[3] := 1 end", false);
        vm.run();
        assert_eq!(vm.state(), DebugState::Error);
        assert!(matches!(vm.error(), Some(RuntimeError::DivisionByZero { .. })));
    }

    #[test]
    fn negative_index_traps() {
        let (mut vm, _) = vm_for("program p; var a[3], i; begin i := -1; a[i] := 1 end", false);
        vm.run();
        assert!(matches!(vm.error(), Some(RuntimeError::DivisionByZero { .. })));
    }

    #[test]
    fn heap_allocate_and_free() {
        let src = "program p; var q: pointer; begin new(q, 4); *q := 42; write(*q); delete(q) end";
        let (mut vm, outputs) = vm_for(src, false);
        vm.run();
        assert_eq!(vm.state(), DebugState::Halted, "error: {:?}", vm.error());
        assert_eq!(*outputs.borrow(), vec![42]);

        // The free list holds exactly one block covering the allocation:
        // header word at the old H boundary, total size 5.
        let head = vm.free_head;
        assert_eq!(head, (DEFAULT_STORE_SIZE - 5) as i64);
        assert_eq!(vm.store[head as usize], 5);
        assert_eq!(vm.store[head as usize + 1], -1);
    }

    #[test]
    fn pointer_indexing_reads_heap() {
        assert_eq!(
            run_src(
                "program p; var q: pointer, i;\nbegin\n  new(q, 3);\n  for i := 0 to 2 do q[i] := i + 10;\n  write(q[0] + q[1] + q[2]);\n  delete(q)\nend"
            ),
            vec![33]
        );
    }

    #[test]
    fn address_of_and_dereference() {
        assert_eq!(
            run_src("program p; var x, q: pointer; begin x := 7; q := &x; *q := *q + 1; write(x) end"),
            vec![8]
        );
    }

    #[test]
    fn read_uses_input_callback() {
        let src = "program p; var x, y; begin read(x, y); write(x + y) end";
        let (code, symbols) = compile(src);
        let outputs = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&outputs);
        let inputs = Rc::new(RefCell::new(VecDeque::from(vec![40, 2])));
        let feed = Rc::clone(&inputs);

        let mut vm = Vm::new(code);
        vm.set_symbols(symbols);
        vm.set_output(move |v| sink.borrow_mut().push(v));
        vm.set_input(move || feed.borrow_mut().pop_front().unwrap_or(0));
        vm.run();

        assert_eq!(vm.state(), DebugState::Halted);
        assert_eq!(*outputs.borrow(), vec![42]);
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let (mut vm, _) = vm_for("program p; var x; begin x := 0; write(1 / x) end", false);
        vm.run();
        assert_eq!(vm.state(), DebugState::Error);
        assert!(matches!(vm.error(), Some(RuntimeError::DivisionByZero { .. })));
    }

    #[test]
    fn modulo_by_zero_is_a_runtime_error() {
        let (mut vm, _) = vm_for("program p; var x; begin x := 0; write(1 mod x) end", false);
        vm.run();
        assert!(matches!(vm.error(), Some(RuntimeError::ModuloByZero { .. })));
    }

    #[test]
    fn error_carries_offending_pc() {
        let (mut vm, _) = vm_for("program p; begin write(1 / 0) end", false);
        vm.run();
        let Some(RuntimeError::DivisionByZero { pc }) = vm.error() else {
            panic!("expected division error, got {:?}", vm.error());
        };
        assert_eq!(vm.code()[*pc].op, OpCode::Opr);
    }

    #[test]
    fn out_of_memory_reported() {
        let (mut vm, _) = vm_for("program p; var q: pointer; begin new(q, 100000) end", false);
        vm.run();
        assert!(matches!(vm.error(), Some(RuntimeError::OutOfMemory { .. })));
    }

    #[test]
    fn invalid_allocation_size_reported() {
        let (mut vm, _) = vm_for("program p; var q: pointer; begin new(q, 0) end", false);
        vm.run();
        assert!(matches!(vm.error(), Some(RuntimeError::InvalidAllocationSize { .. })));
    }

    #[test]
    fn stack_heap_collision_reported() {
        // Unbounded recursion exhausts the store.
        let (mut vm, _) = vm_for(
            "program p; procedure f(); begin call f() end; begin call f() end",
            false,
        );
        vm.run();
        assert_eq!(vm.state(), DebugState::Error);
        assert!(matches!(vm.error(), Some(RuntimeError::StackHeapCollision { .. })));
    }

    #[test]
    fn registers_hold_invariants_throughout() {
        let src = "program p; var a[4], i; begin for i := 0 to 3 do a[i] := i; write(a[3]) end";
        let (mut vm, _) = vm_for(src, false);
        vm.start();
        while vm.state() != DebugState::Halted && vm.state() != DebugState::Error {
            let (_, b, t, h) = vm.registers();
            assert!(t < h, "stack ran into heap: T={t} H={h}");
            assert!(h <= DEFAULT_STORE_SIZE);
            assert!(b < DEFAULT_STORE_SIZE);
            vm.step();
        }
        assert_eq!(vm.state(), DebugState::Halted);
    }

    // ── Optimizer equivalence on real programs ─────────────────────

    #[test]
    fn optimized_programs_behave_identically() {
        let programs = [
            "program p; begin write(3+4*2) end",
            "program p; var x; begin x:=5; if odd x then write(1) else write(0) end",
            "program p; var i; begin for i:=1 to 3 do write(i) end",
            "program p; var x; procedure f(); begin x:=x+1 end; begin x:=10; call f(); call f(); write(x) end",
            "program p; var a[3], i; begin for i:=0 to 2 do a[i]:=i*i; write(a[2]) end",
            "program p; var x; begin x := 2 + 3 * 4; if 1 = 1 then write(x + 0) else write(0); write(x * 1) end",
        ];
        for src in programs {
            let (mut plain, plain_out) = vm_for(src, false);
            plain.run();
            let (mut opt, opt_out) = vm_for(src, true);
            opt.run();
            assert_eq!(plain.state(), opt.state(), "halt status diverged for {src}");
            assert_eq!(*plain_out.borrow(), *opt_out.borrow(), "output diverged for {src}");
        }
    }

    #[test]
    fn optimized_bounds_trap_still_fires() {
        let (mut vm, _) = vm_for("program p; var a[3]; begin a[3] := 1 end", true);
        vm.run();
        assert!(matches!(vm.error(), Some(RuntimeError::DivisionByZero { .. })));
    }

    // ── Debugger state machine ─────────────────────────────────────

    #[test]
    fn start_leaves_machine_paused_at_zero() {
        let (mut vm, _) = vm_for("program p; begin write(1) end", false);
        vm.start();
        assert_eq!(vm.state(), DebugState::Paused);
        assert_eq!(vm.pc(), 0);
    }

    #[test]
    fn breakpoint_pauses_before_line_executes() {
        let src = "program p; var x;\nbegin\n  x := 1;\n  x := 2;\n  write(x)\nend";
        let (mut vm, outputs) = vm_for(src, false);
        vm.set_breakpoint(4); // x := 2
        vm.start();
        vm.resume();
        assert_eq!(vm.state(), DebugState::Paused);
        assert_eq!(vm.current_line(), Some(4));
        assert_eq!(vm.value_of("x"), Some(1), "line 4 must not have run yet");
        assert!(outputs.borrow().is_empty());
    }

    #[test]
    fn breakpoint_on_blank_line_never_fires() {
        let src = "program p;\nvar x;\nbegin\n  x := 1;\n\n  x := 2\nend";
        let (mut vm, _) = vm_for(src, false);
        vm.set_breakpoint(5); // blank line: no instruction carries it
        vm.run();
        assert_eq!(vm.state(), DebugState::Halted);
    }

    #[test]
    fn removed_breakpoint_does_not_fire() {
        let src = "program p; var x;\nbegin\n  x := 1;\n  x := 2\nend";
        let (mut vm, _) = vm_for(src, false);
        vm.set_breakpoint(4);
        vm.remove_breakpoint(4);
        vm.run();
        assert_eq!(vm.state(), DebugState::Halted);
    }

    #[test]
    fn step_executes_exactly_one_instruction() {
        let (mut vm, _) = vm_for("program p; var x; begin x := 1 end", false);
        vm.start();
        // First instruction is the block-entry JMP; stepping lands exactly
        // on its target.
        let target = vm.code()[0].a as usize;
        vm.step();
        assert_eq!(vm.state(), DebugState::Paused);
        assert_eq!(vm.pc(), target);
        // Next step executes the INT only.
        vm.step();
        assert_eq!(vm.pc(), target + 1);
    }

    #[test]
    fn step_over_stops_at_next_source_line() {
        let src = "program p; var x, y;\nbegin\n  x := 1 + 2 + 3;\n  y := x;\n  write(y)\nend";
        let (mut vm, _) = vm_for(src, false);
        vm.start();
        // Reach line 3 first.
        while vm.current_line() != Some(3) {
            vm.step();
        }
        vm.step_over();
        assert_eq!(vm.state(), DebugState::Paused);
        assert_eq!(vm.current_line(), Some(4));
        assert_eq!(vm.value_of("x"), Some(6), "whole line must have executed");
    }

    #[test]
    fn waiting_input_round_trip() {
        let src = "program p; var x;\nbegin\n  read(x);\n  write(x + 1)\nend";
        let (mut vm, outputs) = vm_for(src, false);
        vm.set_debug_mode(true);
        vm.start();
        vm.resume();
        assert_eq!(vm.state(), DebugState::WaitingInput);
        assert!(outputs.borrow().is_empty());

        vm.provide_input(41);
        assert_eq!(vm.state(), DebugState::Paused);
        vm.resume();
        assert_eq!(vm.state(), DebugState::Halted);
        assert_eq!(*outputs.borrow(), vec![42]);
    }

    #[test]
    fn resume_while_waiting_is_a_no_op() {
        let src = "program p; var x; begin read(x); write(x) end";
        let (mut vm, _) = vm_for(src, false);
        vm.set_debug_mode(true);
        vm.run();
        assert_eq!(vm.state(), DebugState::WaitingInput);
        vm.resume();
        assert_eq!(vm.state(), DebugState::WaitingInput);
        vm.step();
        assert_eq!(vm.state(), DebugState::WaitingInput);
    }

    #[test]
    fn stop_discards_pending_input() {
        let src = "program p; var x; begin read(x); write(x) end";
        let (mut vm, outputs) = vm_for(src, false);
        vm.set_debug_mode(true);
        vm.run();
        assert_eq!(vm.state(), DebugState::WaitingInput);
        vm.stop();
        assert_eq!(vm.state(), DebugState::Halted);
        vm.provide_input(7);
        assert_eq!(vm.state(), DebugState::Halted);
        assert!(outputs.borrow().is_empty());
    }

    #[test]
    fn call_stack_walk_inside_procedure() {
        let src = "program p; var x;\nprocedure f();\nbegin\n  x := 1\nend;\nbegin\n  call f()\nend";
        let (mut vm, _) = vm_for(src, false);
        vm.set_breakpoint(4); // inside f
        vm.start();
        vm.resume();
        assert_eq!(vm.state(), DebugState::Paused);
        let frames = vm.call_stack();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dynamic_link, 0);
        // The return address points back into main's code.
        let ra = frames[0].return_address as usize;
        assert!(ra < vm.code().len());
    }

    #[test]
    fn value_watch_reads_current_frame() {
        let src = "program p; var x, y;\nbegin\n  x := 11;\n  y := 22;\n  write(x)\nend";
        let (mut vm, _) = vm_for(src, false);
        vm.set_breakpoint(5);
        vm.start();
        vm.resume();
        assert_eq!(vm.value_of("x"), Some(11));
        assert_eq!(vm.value_of("y"), Some(22));
        assert_eq!(vm.value_of("nope"), None);
    }

    #[test]
    fn restart_after_halt_reruns_cleanly() {
        let (mut vm, outputs) = vm_for("program p; var i; begin for i:=1 to 2 do write(i) end", false);
        vm.run();
        vm.run();
        assert_eq!(*outputs.borrow(), vec![1, 2, 1, 2]);
    }

    // ── Allocator unit tests ───────────────────────────────────────

    fn blank_vm() -> Vm {
        let mut vm = Vm::new(Vec::new());
        vm.start();
        vm
    }

    fn free_list_of(vm: &Vm) -> Vec<(i64, i64)> {
        let mut blocks = Vec::new();
        let mut curr = vm.free_head;
        let mut hops = 0;
        while curr != -1 && hops < 100 {
            hops += 1;
            blocks.push((curr, vm.store[curr as usize]));
            curr = vm.store[curr as usize + 1];
        }
        blocks
    }

    #[test]
    fn alloc_free_realloc_reuses_block() {
        let mut vm = blank_vm();
        let a = vm.allocate(4);
        assert!(a > 0);
        vm.deallocate(a);
        let b = vm.allocate(4);
        assert_eq!(a, b, "freed block of identical size must be reused");
    }

    #[test]
    fn free_list_is_sorted_and_coalesced() {
        let mut vm = blank_vm();
        let a = vm.allocate(4);
        let b = vm.allocate(4);
        let c = vm.allocate(4);

        vm.deallocate(a);
        vm.deallocate(c);
        let list = free_list_of(&vm);
        assert_eq!(list.len(), 2);
        assert!(list[0].0 < list[1].0, "free list must be address-sorted");

        // Freeing the middle block bridges both neighbors into one.
        vm.deallocate(b);
        let list = free_list_of(&vm);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].1, 15, "three blocks of total size 5 each");
    }

    #[test]
    fn split_leaves_usable_remainder() {
        let mut vm = blank_vm();
        let a = vm.allocate(10);
        vm.deallocate(a);
        // Carving 4+1 words out of an 11-word block leaves a 6-word block.
        let b = vm.allocate(4);
        assert_eq!(b, a, "first fit carves from the low end");
        let list = free_list_of(&vm);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].1, 6);
        // The remainder is immediately allocatable.
        let c = vm.allocate(5);
        assert!(c > 0);
        assert!(free_list_of(&vm).is_empty());
    }

    #[test]
    fn tiny_remainder_is_not_split() {
        let mut vm = blank_vm();
        let a = vm.allocate(5);
        vm.deallocate(a);
        // A 6-word block serving a size-4 request leaves remainder 1,
        // which cannot host a free-block header: hand out the whole block.
        let b = vm.allocate(4);
        assert_eq!(b, a);
        assert!(free_list_of(&vm).is_empty());
    }

    #[test]
    fn exhaustion_returns_sentinel() {
        let mut vm = blank_vm();
        assert_eq!(vm.allocate((DEFAULT_STORE_SIZE + 10) as i64), -1);
    }

    #[test]
    fn free_blocks_never_overlap() {
        let mut vm = blank_vm();
        let mut addrs = Vec::new();
        for size in [3, 7, 2, 9, 4] {
            addrs.push(vm.allocate(size));
        }
        // Free in a scrambled order.
        for &i in &[1usize, 3, 0, 4, 2] {
            vm.deallocate(addrs[i]);
        }
        let list = free_list_of(&vm);
        for pair in list.windows(2) {
            let (addr, total) = pair[0];
            assert!(addr + total <= pair[1].0, "overlapping free blocks: {list:?}");
            assert!(
                addr + total < pair[1].0 || total == 0,
                "adjacent blocks must have been coalesced: {list:?}"
            );
        }
        // Everything coalesces back into a single block at the bottom.
        assert_eq!(list.len(), 1);
    }
}
