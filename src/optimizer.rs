//! The fixed-point rewrite engine.
//!
//! Each full pass rebuilds the stream from scratch in three stages and
//! compares the result to its input by structural equality; while they
//! differ, the whole pipeline runs again. No stage ever mutates a stream
//! in place or keeps state that outlives one pass.

use crate::ir::Ir::{self, *};

/// an insertion-order-preserving map from cell offset to an accumulated
/// value.
///
/// several rules below fold adjacent writes to the same offset within a
/// straight-line run. The fixed point only converges if those folds are
/// flushed back out in the order the offsets were first seen -- hash
/// iteration order is unspecified, so a `HashMap` alone would make the
/// optimizer's result (and thus whether it has reached a fixed point)
/// depend on hash seed.
struct OffsetMap<V> {
    order: Vec<i64>,
    values: std::collections::HashMap<i64, V>,
}

impl<V: Copy> OffsetMap<V> {
    fn new() -> Self {
        Self {
            order: Vec::new(),
            values: std::collections::HashMap::new(),
        }
    }

    fn contains(&self, off: i64) -> bool {
        self.values.contains_key(&off)
    }

    fn get(&self, off: i64) -> Option<V> {
        self.values.get(&off).copied()
    }

    fn insert(&mut self, off: i64, v: V) {
        if !self.values.contains_key(&off) {
            self.order.push(off);
        }
        self.values.insert(off, v);
    }

    fn remove(&mut self, off: i64) {
        if self.values.remove(&off).is_some() {
            self.order.retain(|&o| o != off);
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn iter(&self) -> impl Iterator<Item = (i64, V)> + '_ {
        self.order.iter().map(move |&off| (off, self.values[&off]))
    }

    /// consume the map in insertion order, leaving it empty
    fn drain(&mut self) -> Vec<(i64, V)> {
        self.order
            .drain(..)
            .map(|off| (off, self.values.remove(&off).unwrap()))
            .collect()
    }
}

impl OffsetMap<i64> {
    fn add(&mut self, off: i64, delta: i64) {
        let v = self.get(off).unwrap_or(0) + delta;
        self.insert(off, v);
    }
}

/// apply the full rewrite pipeline until it reaches a fixed point
///
/// `warn` surfaces a diagnostic for loops recognized as non-terminating
/// (their counter cell is never touched, so they are left untouched too).
pub fn optimize(ir: Vec<Ir>, warn: bool) -> Vec<Ir> {
    let cap = ir.len() * 4 + 256;
    let mut current = ir;

    for pass in 0.. {
        let stage1 = specialize_initial_zero(&current);
        let stage2 = recognize_loop_patterns(&stage1, warn);
        let stage3 = sink_shifts_and_batch_output(&stage2);

        if stage3 == current {
            return stage3;
        }

        if pass > cap {
            unreachable!(
                "optimizer failed to converge after {pass} passes over {} instructions -- a rewrite rule is not monotone",
                current.len()
            );
        }

        current = stage3;
    }

    unreachable!()
}

/// R1 (run-length coalescing) + R2 (initial-zero specialization)
fn specialize_initial_zero(tokens: &[Ir]) -> Vec<Ir> {
    let mut out = Vec::new();
    let mut add_acc: i64 = 0;
    let mut move_acc: i64 = 0;
    let mut all_zero = true;

    for &inst in tokens {
        if add_acc != 0 && !matches!(inst, Add { .. }) {
            out.push(Add { off: 0, n: add_acc });
            add_acc = 0;
        } else if move_acc != 0 && !matches!(inst, Move { .. }) {
            out.push(Move { delta: move_acc });
            move_acc = 0;
        }

        match inst {
            Add { off: 0, n } => {
                if all_zero {
                    out.push(Set { off: 0, v: n });
                } else {
                    add_acc += n;
                }
            }
            Add { off, n } if all_zero => out.push(Set { off, v: n }),
            LoadOut { add, .. } if all_zero => out.push(LoadOutSet { v: add }),
            Move { delta } => move_acc += delta,
            other => out.push(other),
        }

        if matches!(inst, Add { .. } | Set { .. } | Input { .. }) {
            all_zero = false;
        }
    }

    if add_acc != 0 {
        out.push(Add { off: 0, n: add_acc });
    } else if move_acc != 0 {
        out.push(Move { delta: move_acc });
    }

    out
}

#[derive(Clone, Copy)]
enum PendingLoad {
    Offset { off: i64, add: i64 },
    Const(i64),
}

/// R3 (clear-loop), R4 (multiply-move loop), R5 (scan-loop), R7
/// (SET-then-MULCOPY strength reduction), R9 (IF-guarding), and both
/// halves of R10 (output coalescing)
fn recognize_loop_patterns(tokens: &[Ir], warn: bool) -> Vec<Ir> {
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < tokens.len() {
        let mut optimized = false;

        // R5: a loop whose entire body is one MOVE seeks the next zero cell
        if i + 2 < tokens.len() {
            if let (Loop, Move { delta }, EndLoop) = (tokens[i], tokens[i + 1], tokens[i + 2]) {
                out.push(Scan { stride: delta });
                optimized = true;
                i += 2;
            }
        }

        // R3/R4/R9: a loop whose body is only ADD/SET, decrementing its
        // counter cell (offset 0) to zero
        if !optimized && matches!(tokens[i], Loop) {
            let mut j = i + 1;
            let mut adds = OffsetMap::<i64>::new();
            let mut sets = OffsetMap::<i64>::new();
            let mut hit_break = false;

            while j < tokens.len() && !matches!(tokens[j], EndLoop) {
                match tokens[j] {
                    Add { off, n } => {
                        if sets.contains(off) {
                            sets.add(off, n);
                        } else {
                            adds.add(off, n);
                        }
                    }
                    Set { off, v } if off != 0 => {
                        adds.remove(off);
                        sets.insert(off, v);
                    }
                    _ => {
                        hit_break = true;
                        break;
                    }
                }
                j += 1;
            }

            if !hit_break {
                if !adds.contains(0) {
                    if warn {
                        eprintln!(
                            "! possible infinite loop at ir index {i}: counter cell is never touched"
                        );
                    }
                } else if adds.len() == 1 && adds.get(0) != Some(0) {
                    // clear loop: body touches only the counter cell
                    if !sets.is_empty() {
                        out.push(If { off: 0 });
                        for (off, v) in sets.iter() {
                            out.push(Set { off, v });
                        }
                    }
                    out.push(Set { off: 0, v: 0 });
                    if !sets.is_empty() {
                        out.push(EndIf);
                    }
                    i = j;
                    optimized = true;
                } else if adds.get(0) == Some(-1) {
                    // multiply-move loop: counter decrements once per iteration
                    if !sets.is_empty() {
                        out.push(If { off: 0 });
                        for (off, v) in sets.iter() {
                            out.push(Set { off, v });
                        }
                    }
                    for (off, k) in adds.iter() {
                        if off != 0 {
                            out.push(MulCopy { src: 0, dst: off, k });
                        }
                    }
                    if !sets.is_empty() {
                        out.push(EndIf);
                    }
                    out.push(Set { off: 0, v: 0 });
                    i = j;
                    optimized = true;
                }
            }
        }

        // R7: SET(off, v) followed by MULCOPY(off, ...) becomes SET + ADD
        if !optimized && i + 1 < tokens.len() {
            if let (Set { off, v }, MulCopy { src, .. }) = (tokens[i], tokens[i + 1]) {
                if off == src {
                    let mut j = i + 1;
                    while j < tokens.len() {
                        let Ir::MulCopy { src: s, dst, k } = tokens[j] else {
                            break;
                        };
                        if s != off {
                            break;
                        }
                        out.push(Add { off: dst, n: v * k });
                        j += 1;
                    }
                    out.push(Set { off, v });
                    i = j - 1;
                    optimized = true;
                }
            }
        }

        // R10 (half): two loaders separated only by an OUTPUT share one buffer
        if !optimized
            && i + 2 < tokens.len()
            && matches!(tokens[i], LoadOut { .. } | LoadOutSet { .. })
            && matches!(tokens[i + 1], Output)
            && matches!(tokens[i + 2], LoadOut { .. } | LoadOutSet { .. })
        {
            out.push(tokens[i]);
            out.push(tokens[i + 2]);
            i += 2;
            optimized = true;
        }

        // R8 (restricted to output-bearing runs) + the rest of R10: sink
        // shifts and fold writes across a run up to and including at least
        // one OUTPUT, so the batch can be emitted as a single syscall.
        if !optimized && i + 2 < tokens.len() && matches!(tokens[i], Add { .. } | Move { .. } | Set { .. })
        {
            let mut j = i;
            let mut outputs = Vec::new();
            let mut adds = OffsetMap::<i64>::new();
            let mut sets = OffsetMap::<i64>::new();
            let mut shift: i64 = 0;
            let mut shifted = false;

            loop {
                if j >= tokens.len() {
                    break;
                }
                match tokens[j] {
                    Add { off, n } => {
                        adds.add(off + shift, n);
                        j += 1;
                    }
                    Set { off, v } => {
                        let off = off + shift;
                        adds.insert(off, 0);
                        sets.insert(off, v);
                        j += 1;
                    }
                    LoadOut { off, add } => {
                        let off = off + shift;
                        if let Some(sv) = sets.get(off) {
                            outputs.push(PendingLoad::Const(sv + adds.get(off).unwrap_or(0) + add));
                        } else {
                            outputs.push(PendingLoad::Offset {
                                off,
                                add: adds.get(off).unwrap_or(0) + add,
                            });
                        }
                        j += 1;
                    }
                    LoadOutSet { v } => {
                        outputs.push(PendingLoad::Const(v));
                        j += 1;
                    }
                    Move { delta } => {
                        shift += delta;
                        shifted = true;
                        j += 1;
                    }
                    Output => j += 1,
                    _ => {
                        j = j.saturating_sub(1);
                        break;
                    }
                }
            }

            if (!adds.is_empty() || shifted || !sets.is_empty()) && !outputs.is_empty() {
                for load in &outputs {
                    match *load {
                        PendingLoad::Const(v) => out.push(LoadOutSet { v }),
                        PendingLoad::Offset { off, add } => out.push(LoadOut { off, add }),
                    }
                }
                out.push(Output);
                for (off, v) in sets.iter() {
                    out.push(Set { off, v: v + adds.get(off).unwrap_or(0) });
                }
                for (off, add) in adds.iter() {
                    if add != 0 && sets.get(off).is_none() {
                        out.push(Add { off, n: add });
                    }
                }
                if shift != 0 {
                    out.push(Move { delta: shift });
                }
                i = j;
                optimized = true;
            }
        }

        if !optimized {
            out.push(tokens[i]);
        }

        i += 1;
    }

    out
}

#[derive(Clone, Copy)]
enum Op {
    Set,
    Add,
}

/// R8 (shift-sinking, general case) + R6 (SET-then-ADD fusion falls out
/// of the same per-offset accumulator)
fn sink_shifts_and_batch_output(tokens: &[Ir]) -> Vec<Ir> {
    let mut out = Vec::new();
    let mut shift: i64 = 0;
    let mut acc: OffsetMap<(Op, i64)> = OffsetMap::new();

    for &inst in tokens {
        if !matches!(inst, Add { .. } | Set { .. }) {
            for (off, (op, val)) in acc.drain() {
                out.push(match op {
                    Op::Set => Set { off, v: val },
                    Op::Add => Add { off, n: val },
                });
            }
        }

        match inst {
            Add { off, n } => {
                let off = off + shift;
                match acc.get(off) {
                    Some((op, val)) => acc.insert(off, (op, val + n)),
                    None => acc.insert(off, (Op::Add, n)),
                }
            }
            Set { off, v } => {
                let off = off + shift;
                acc.remove(off);
                acc.insert(off, (Op::Set, v));
            }
            MulCopy { src, dst, k } => out.push(MulCopy {
                src: src + shift,
                dst: dst + shift,
                k,
            }),
            If { off } => out.push(If { off: off + shift }),
            EndIf => out.push(EndIf),
            Move { delta } => shift += delta,
            Output => out.push(Output),
            Loop | EndLoop | Input { .. } | Scan { .. } | LoadOut { .. } | LoadOutSet { .. } => {
                if shift != 0 {
                    out.push(Move { delta: shift });
                    shift = 0;
                }
                out.push(inst);
            }
        }
    }

    // any remaining accumulated add/set/shift at program end is dead on exit

    out
}
