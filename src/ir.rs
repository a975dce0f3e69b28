use anyhow::bail;

/// The intermediate representation: a closed, flat opcode set.
///
/// `off` fields are cell offsets relative to the data pointer at the time
/// the instruction executes; all arithmetic on the tape itself wraps at 8
/// bits, but offsets/multipliers are ordinary 64-bit signed integers.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Ir {
    /// `tape[DP+off] += n` mod 256
    Add { off: i64, n: i64 },
    /// `tape[DP+off] = v` mod 256
    Set { off: i64, v: i64 },
    /// `DP += delta`
    Move { delta: i64 },
    /// `tape[DP+dst] += tape[DP+src] * k` mod 256
    MulCopy { src: i64, dst: i64, k: i64 },
    /// while `tape[DP] != 0`: `DP += stride`
    Scan { stride: i64 },
    /// while `tape[DP] != 0`: ...
    Loop,
    EndLoop,
    /// executes body iff `tape[DP+off] != 0`
    If { off: i64 },
    EndIf,
    /// reads `n` byte(s) into `tape[DP]`
    Input { n: u32 },
    /// appends `(tape[DP+off] + add) mod 256` to the pending output buffer
    LoadOut { off: i64, add: i64 },
    /// appends constant byte `v` to the pending output buffer
    LoadOutSet { v: i64 },
    /// flushes the pending output buffer and empties it
    Output,
}

use Ir::*;

/// lower brainf*ck source into a flat, unoptimized IR stream
///
/// purely syntactic: every character outside `+-<>.,[]` is discarded, and
/// no balancing or optimization happens here.
pub fn parse(code: &str) -> Vec<Ir> {
    let mut ir = Vec::new();

    for inst in code.chars() {
        match inst {
            '+' => ir.push(Add { off: 0, n: 1 }),
            '-' => ir.push(Add { off: 0, n: -1 }),
            '>' => ir.push(Move { delta: 1 }),
            '<' => ir.push(Move { delta: -1 }),
            '[' => ir.push(Loop),
            ']' => ir.push(EndLoop),
            ',' => ir.push(Input { n: 1 }),
            '.' => {
                ir.push(LoadOut { off: 0, add: 0 });
                ir.push(Output);
            }
            _comment => {}
        }
    }

    ir
}

/// check that `[`/`]` balance in the raw source, before any IR is built
///
/// the optimizer and code generator do not diagnose mismatched brackets
/// themselves (malformed source yields malformed assembly) -- this is the
/// CLI's one friendly check before committing to a compile.
pub fn verify(source: impl AsRef<str>) -> anyhow::Result<()> {
    let mut balance = 0isize;

    for c in source.as_ref().chars() {
        match c {
            '[' => balance += 1,
            ']' => balance -= 1,
            _ => {}
        }
    }

    if balance > 0 {
        bail!("{} unmatched opening bracket(s) (`[`)", balance);
    } else if balance < 0 {
        bail!("{} unmatched closing bracket(s) (`]`)", balance.abs());
    }

    Ok(())
}

/// matches `Loop`/`EndLoop` and `If`/`EndIf` into a jump table
///
/// the IR carries no jump-target payload on these opcodes (see the
/// opcode table), so any consumer that needs to jump -- namely the
/// interpreter -- precomputes this once rather than threading indices
/// through the enum itself.
///
/// `jump[i]` is only meaningful when `ir[i]` is `Loop`, `EndLoop`, `If`,
/// or `EndIf`, in which case it holds the matching partner's index.
pub fn match_brackets(ir: &[Ir]) -> Vec<usize> {
    let mut jump = vec![0usize; ir.len()];
    let mut loop_stack = Vec::new();
    let mut if_stack = Vec::new();

    for (idx, inst) in ir.iter().enumerate() {
        match inst {
            Loop => loop_stack.push(idx),
            EndLoop => {
                let start = loop_stack
                    .pop()
                    .unwrap_or_else(|| unreachable!("EndLoop with no matching Loop at index {idx}"));
                jump[start] = idx;
                jump[idx] = start;
            }
            If { .. } => if_stack.push(idx),
            EndIf => {
                let start = if_stack
                    .pop()
                    .unwrap_or_else(|| unreachable!("EndIf with no matching If at index {idx}"));
                jump[start] = idx;
                jump[idx] = start;
            }
            _ => {}
        }
    }

    jump
}
