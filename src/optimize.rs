use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::code::{Instruction, OpCode, Opr};

/// A maximal straight-line instruction run with a single entry and exit.
struct BasicBlock {
    id: usize,
    /// Leader address in the input stream, used for target remapping.
    original_start: usize,
    instructions: Vec<Instruction>,
    successors: Vec<usize>,
    reachable: bool,
}

/// Optimize an instruction sequence: intra-block constant folding,
/// identity/branch strength reduction, and unreachable-block elimination,
/// with surviving jump targets remapped.
///
/// The CFG does not model inter-procedural flow (`CAL` is fall-through),
/// so procedure entries are treated as extra reachability roots, and the
/// `CAL` operand, which is always a block leader, goes through the same
/// remap table as the jumps. Return addresses are runtime values and need
/// no rewriting.
pub fn optimize(input: &[Instruction]) -> Vec<Instruction> {
    if input.is_empty() {
        return Vec::new();
    }

    let (targets, call_entries) = jump_targets(input);
    let mut blocks = build_basic_blocks(input, &targets);

    for block in &mut blocks {
        constant_folding(block);
        strength_reduction(block);
    }

    build_cfg(&mut blocks);
    mark_reachable(&mut blocks, 0);
    for entry in &call_entries {
        if let Some(id) = blocks.iter().position(|b| b.original_start == *entry) {
            mark_reachable(&mut blocks, id);
        }
    }

    let dropped = blocks.iter().filter(|b| !b.reachable).count();
    if dropped > 0 {
        debug!(blocks = blocks.len(), dropped, "removed unreachable basic blocks");
    }

    flatten_and_remap(&blocks)
}

/// Leader set (every explicit jump or call target) plus the call entries on
/// their own, which double as reachability roots.
fn jump_targets(code: &[Instruction]) -> (BTreeSet<usize>, BTreeSet<usize>) {
    let mut targets = BTreeSet::new();
    let mut call_entries = BTreeSet::new();
    for instr in code {
        match instr.op {
            OpCode::Jmp | OpCode::Jpc => {
                if let Ok(a) = usize::try_from(instr.a) {
                    targets.insert(a);
                }
            }
            OpCode::Cal => {
                if let Ok(a) = usize::try_from(instr.a) {
                    targets.insert(a);
                    call_entries.insert(a);
                }
            }
            _ => {}
        }
    }
    (targets, call_entries)
}

fn is_terminator(instr: &Instruction) -> bool {
    matches!(instr.op, OpCode::Jmp | OpCode::Jpc) || instr.is_return()
}

/// Partition into contiguous ranges between leaders (jump targets and the
/// instructions following a terminator).
fn build_basic_blocks(code: &[Instruction], targets: &BTreeSet<usize>) -> Vec<BasicBlock> {
    let mut blocks = Vec::new();
    let mut current = BasicBlock {
        id: 0,
        original_start: 0,
        instructions: Vec::new(),
        successors: Vec::new(),
        reachable: false,
    };

    for (i, instr) in code.iter().enumerate() {
        let split = i > 0 && (targets.contains(&i) || is_terminator(&code[i - 1]));

        if split {
            let id = blocks.len() + 1;
            blocks.push(std::mem::replace(
                &mut current,
                BasicBlock {
                    id,
                    original_start: i,
                    instructions: Vec::new(),
                    successors: Vec::new(),
                    reachable: false,
                },
            ));
        }

        current.instructions.push(*instr);
    }

    blocks.push(current);
    blocks
}

/// Fold `LIT v1; LIT v2; OPR op` triples to a single `LIT`, repeating until
/// a pass makes no change. Division by zero is left in place to trap at run
/// time.
fn constant_folding(block: &mut BasicBlock) {
    loop {
        if block.instructions.len() < 3 {
            return;
        }

        let insts = &block.instructions;
        let mut folded = Vec::with_capacity(insts.len());
        let mut changed = false;
        let mut i = 0;

        while i < insts.len() {
            if i + 2 < insts.len()
                && insts[i].op == OpCode::Lit
                && insts[i + 1].op == OpCode::Lit
                && insts[i + 2].op == OpCode::Opr
            {
                if let Some(result) = fold_opr(insts[i].a, insts[i + 1].a, insts[i + 2].a) {
                    folded.push(Instruction::new(OpCode::Lit, 0, result, insts[i].line));
                    i += 3;
                    changed = true;
                    continue;
                }
            }
            folded.push(insts[i]);
            i += 1;
        }

        block.instructions = folded;
        if !changed {
            return;
        }
    }
}

fn fold_opr(v1: i64, v2: i64, opr: i64) -> Option<i64> {
    Some(match Opr::from_operand(opr)? {
        Opr::Add => v1.wrapping_add(v2),
        Opr::Sub => v1.wrapping_sub(v2),
        Opr::Mul => v1.wrapping_mul(v2),
        Opr::Div => {
            if v2 == 0 {
                return None;
            }
            v1.wrapping_div(v2)
        }
        Opr::Eql => i64::from(v1 == v2),
        Opr::Neq => i64::from(v1 != v2),
        Opr::Lss => i64::from(v1 < v2),
        Opr::Geq => i64::from(v1 >= v2),
        Opr::Gtr => i64::from(v1 > v2),
        Opr::Leq => i64::from(v1 <= v2),
        _ => return None,
    })
}

/// Algebraic identities and statically-decided branches:
/// `LIT 0; OPR ADD|SUB` and `LIT 1; OPR MUL|DIV` vanish, `LIT 0; JPC t`
/// becomes `JMP t`, and `LIT k; JPC t` with `k ≠ 0` falls through.
fn strength_reduction(block: &mut BasicBlock) {
    let insts = &block.instructions;
    let mut reduced = Vec::with_capacity(insts.len());
    let mut i = 0;

    while i < insts.len() {
        if i + 1 < insts.len() && insts[i].op == OpCode::Lit {
            let lit = insts[i].a;
            let next = &insts[i + 1];

            if next.op == OpCode::Opr {
                let identity = match Opr::from_operand(next.a) {
                    Some(Opr::Add | Opr::Sub) => lit == 0,
                    Some(Opr::Mul | Opr::Div) => lit == 1,
                    _ => false,
                };
                if identity {
                    i += 2;
                    continue;
                }
            } else if next.op == OpCode::Jpc {
                if lit == 0 {
                    // Always false: the conditional jump is unconditional.
                    reduced.push(Instruction::new(OpCode::Jmp, next.l, next.a, next.line));
                } // else always true: never jumps, drop both.
                i += 2;
                continue;
            }
        }

        reduced.push(insts[i]);
        i += 1;
    }

    block.instructions = reduced;
}

/// Successor edges over original block order. `CAL` is deliberately treated
/// as fall-through; inter-procedural flow is not modeled.
fn build_cfg(blocks: &mut [BasicBlock]) {
    let addr_to_block: BTreeMap<usize, usize> =
        blocks.iter().map(|b| (b.original_start, b.id)).collect();
    let block_count = blocks.len();

    for block in blocks.iter_mut() {
        block.successors.clear();

        let mut falls_through = true;
        if let Some(last) = block.instructions.last() {
            if last.op == OpCode::Jmp {
                falls_through = false;
                if let Some(&succ) = usize::try_from(last.a).ok().and_then(|a| addr_to_block.get(&a)) {
                    block.successors.push(succ);
                }
            } else if last.op == OpCode::Jpc {
                if let Some(&succ) = usize::try_from(last.a).ok().and_then(|a| addr_to_block.get(&a)) {
                    block.successors.push(succ);
                }
            } else if last.is_return() {
                falls_through = false;
            }
        }
        // A block emptied by reduction simply falls through.

        if falls_through && block.id + 1 < block_count {
            block.successors.push(block.id + 1);
        }
    }
}

/// Breadth-first reachability from the entry block.
fn mark_reachable(blocks: &mut [BasicBlock], start: usize) {
    if start >= blocks.len() {
        return;
    }

    let mut queue = vec![start];
    blocks[start].reachable = true;

    let mut head = 0;
    while head < queue.len() {
        let current = queue[head];
        head += 1;
        let successors = blocks[current].successors.clone();
        for succ in successors {
            if succ < blocks.len() && !blocks[succ].reachable {
                blocks[succ].reachable = true;
                queue.push(succ);
            }
        }
    }
}

/// Emit reachable blocks in original order and rewrite surviving `JMP`,
/// `JPC`, and `CAL` operands through the leader address map.
fn flatten_and_remap(blocks: &[BasicBlock]) -> Vec<Instruction> {
    let mut address_map = BTreeMap::new();
    let mut current_addr = 0;
    for block in blocks.iter().filter(|b| b.reachable) {
        address_map.insert(block.original_start, current_addr);
        current_addr += block.instructions.len();
    }

    let mut result = Vec::with_capacity(current_addr);
    for block in blocks.iter().filter(|b| b.reachable) {
        for instr in &block.instructions {
            let mut instr = *instr;
            if matches!(instr.op, OpCode::Jmp | OpCode::Jpc | OpCode::Cal) {
                if let Some(&new_a) = usize::try_from(instr.a).ok().and_then(|a| address_map.get(&a))
                {
                    instr.a = new_a as i64;
                }
            }
            result.push(instr);
        }
    }
    result
}
