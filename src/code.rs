use std::io::{self, Write};

use serde::Serialize;

/// P-Code operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpCode {
    /// Push the immediate operand.
    Lit,
    /// Load: direct `(L, A)` slot, or indirect through a popped address when `A == 0`.
    Lod,
    /// Store: direct `(L, A)` slot, or indirect when `A == 0`.
    Sto,
    /// Call: `A` is the entry address; pops the argument count first.
    Cal,
    /// Grow the stack top by `A` frame slots.
    Int,
    /// Unconditional jump to `A`.
    Jmp,
    /// Pop; jump to `A` when the value is zero.
    Jpc,
    /// Arithmetic / comparison / return sub-operation selected by `A`.
    Opr,
    /// Read an integer into `(L, A)`, or indirectly when `A == 0`.
    Red,
    /// Pop and write an integer.
    Wrt,
    /// Pop a size, push the allocated heap address.
    New,
    /// Pop an address and free it.
    Del,
    /// Push the absolute address of slot `(L, A)`.
    Lad,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Lit => "LIT",
            Self::Lod => "LOD",
            Self::Sto => "STO",
            Self::Cal => "CAL",
            Self::Int => "INT",
            Self::Jmp => "JMP",
            Self::Jpc => "JPC",
            Self::Opr => "OPR",
            Self::Red => "RED",
            Self::Wrt => "WRT",
            Self::New => "NEW",
            Self::Del => "DEL",
            Self::Lad => "LAD",
        }
    }
}

/// `OPR` sub-operations, stored in the instruction's `A` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Opr {
    Ret = 0,
    Neg = 1,
    Add = 2,
    Sub = 3,
    Mul = 4,
    Div = 5,
    Odd = 6,
    Mod = 7,
    Eql = 8,
    Neq = 9,
    Lss = 10,
    Geq = 11,
    Gtr = 12,
    Leq = 13,
}

impl Opr {
    pub fn from_operand(a: i64) -> Option<Self> {
        Some(match a {
            0 => Self::Ret,
            1 => Self::Neg,
            2 => Self::Add,
            3 => Self::Sub,
            4 => Self::Mul,
            5 => Self::Div,
            6 => Self::Odd,
            7 => Self::Mod,
            8 => Self::Eql,
            9 => Self::Neq,
            10 => Self::Lss,
            11 => Self::Geq,
            12 => Self::Gtr,
            13 => Self::Leq,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ret => "return",
            Self::Neg => "negate",
            Self::Add => "add",
            Self::Sub => "subtract",
            Self::Mul => "multiply",
            Self::Div => "divide",
            Self::Odd => "odd",
            Self::Mod => "modulo",
            Self::Eql => "equal",
            Self::Neq => "not equal",
            Self::Lss => "less than",
            Self::Geq => "greater or equal",
            Self::Gtr => "greater than",
            Self::Leq => "less or equal",
        }
    }
}

/// One P-Code instruction. `l` is the static-link hop count (0 = local);
/// `a` is an immediate whose meaning depends on `op`; `line` is the 1-based
/// source line that produced the instruction, or 0 for synthesized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Instruction {
    pub op: OpCode,
    pub l: usize,
    pub a: i64,
    pub line: usize,
}

impl Instruction {
    pub fn new(op: OpCode, l: usize, a: i64, line: usize) -> Self {
        Self { op, l, a, line }
    }

    /// True for `OPR RET`.
    pub fn is_return(&self) -> bool {
        self.op == OpCode::Opr && self.a == Opr::Ret as i64
    }
}

/// The in-memory instruction vector plus the emit/backpatch interface the
/// parser drives. Forward jumps are emitted with a placeholder operand and
/// patched once the target address is known.
pub struct CodeGen {
    code: Vec<Instruction>,
}

impl CodeGen {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Append an instruction, returning its address.
    pub fn emit(&mut self, op: OpCode, l: usize, a: i64, line: usize) -> usize {
        let addr = self.code.len();
        self.code.push(Instruction::new(op, l, a, line));
        addr
    }

    /// Rewrite the operand of a previously emitted jump.
    pub fn backpatch(&mut self, instr_addr: usize, target_addr: usize) {
        if let Some(instr) = self.code.get_mut(instr_addr) {
            instr.a = target_addr as i64;
        }
    }

    /// Address the next emitted instruction will get.
    pub fn next_addr(&self) -> usize {
        self.code.len()
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    /// Replace the instruction stream (used after optimization).
    pub fn set_code(&mut self, code: Vec<Instruction>) {
        self.code = code;
    }

    pub fn into_code(self) -> Vec<Instruction> {
        self.code
    }

    /// Render an annotated listing.
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "[P-Code] Generated Instructions:")?;
        writeln!(out, "{}", "-".repeat(60))?;

        for (i, instr) in self.code.iter().enumerate() {
            let comment = Self::describe(instr);
            writeln!(
                out,
                "{i:4}: L{:3} {:>4} {:3}, {:5}    ; {comment}",
                instr.line,
                instr.op.name(),
                instr.l,
                instr.a
            )?;
        }

        writeln!(out, "{}", "-".repeat(60))?;
        writeln!(out, "Total instructions: {}", self.code.len())
    }

    fn describe(instr: &Instruction) -> String {
        match instr.op {
            OpCode::Int => format!("allocate {} units", instr.a),
            OpCode::Lit => format!("push constant {}", instr.a),
            OpCode::Lod => {
                if instr.a == 0 {
                    "indirect load".to_string()
                } else {
                    format!("load [{}, {}]", instr.l, instr.a)
                }
            }
            OpCode::Sto => {
                if instr.a == 0 {
                    "indirect store".to_string()
                } else {
                    format!("store to [{}, {}]", instr.l, instr.a)
                }
            }
            OpCode::Cal => format!("call @{}", instr.a),
            OpCode::Jmp => format!("jump to {}", instr.a),
            OpCode::Jpc => format!("jump if zero to {}", instr.a),
            OpCode::Opr => Opr::from_operand(instr.a)
                .map_or_else(|| format!("opr {}", instr.a), |o| o.name().to_string()),
            OpCode::Red => {
                if instr.a == 0 {
                    "read indirect".to_string()
                } else {
                    format!("read to [{}, {}]", instr.l, instr.a)
                }
            }
            OpCode::Wrt => "write".to_string(),
            OpCode::New => "heap alloc".to_string(),
            OpCode::Del => "heap free".to_string(),
            OpCode::Lad => "load address".to_string(),
        }
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_returns_consecutive_addresses() {
        let mut cg = CodeGen::new();
        assert_eq!(cg.emit(OpCode::Lit, 0, 1, 1), 0);
        assert_eq!(cg.emit(OpCode::Lit, 0, 2, 1), 1);
        assert_eq!(cg.next_addr(), 2);
    }

    #[test]
    fn backpatch_rewrites_operand() {
        let mut cg = CodeGen::new();
        let jmp = cg.emit(OpCode::Jmp, 0, 0, 1);
        cg.emit(OpCode::Lit, 0, 5, 1);
        cg.backpatch(jmp, cg.next_addr());
        assert_eq!(cg.code()[jmp].a, 2);
    }

    #[test]
    fn backpatch_out_of_range_is_ignored() {
        let mut cg = CodeGen::new();
        cg.backpatch(3, 7);
        assert!(cg.code().is_empty());
    }

    #[test]
    fn opr_operand_round_trip() {
        for a in 0..=13 {
            let opr = Opr::from_operand(a).unwrap();
            assert_eq!(opr as i64, a);
        }
        assert!(Opr::from_operand(14).is_none());
        assert!(Opr::from_operand(-1).is_none());
    }

    #[test]
    fn return_detection() {
        let ret = Instruction::new(OpCode::Opr, 0, Opr::Ret as i64, 0);
        let add = Instruction::new(OpCode::Opr, 0, Opr::Add as i64, 0);
        assert!(ret.is_return());
        assert!(!add.is_return());
    }

    #[test]
    fn dump_annotates_instructions() {
        let mut cg = CodeGen::new();
        cg.emit(OpCode::Int, 0, 4, 1);
        cg.emit(OpCode::Lit, 0, 42, 2);
        cg.emit(OpCode::Opr, 0, Opr::Ret as i64, 2);
        let mut out = Vec::new();
        cg.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("allocate 4 units"));
        assert!(text.contains("push constant 42"));
        assert!(text.contains("; return"));
        assert!(text.contains("Total instructions: 3"));
    }
}
