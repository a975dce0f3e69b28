//! The differential-oracle interpreter.
//!
//! Executes the same `Ir` stream the code generator would, directly
//! against an in-process tape. Used both by `--interpret` and by the
//! test suite to check the optimizer's output against the unoptimized
//! parser output.

use std::io::{Read, Write};

use anyhow::Context;
use memchr::{memchr, memrchr};

use crate::ir::{
    match_brackets,
    Ir::{self, *},
};

const TAPE_LEN: usize = 8192;
const ORIGIN: usize = TAPE_LEN / 2;

/// run an IR stream to completion against stdin/stdout
pub fn interpret(ir: &[Ir]) -> anyhow::Result<()> {
    run(ir, &mut std::io::stdin(), &mut std::io::stdout())
}

fn run(ir: &[Ir], input: &mut impl Read, output: &mut impl Write) -> anyhow::Result<()> {
    let jump = match_brackets(ir);
    let mut tape = [0u8; TAPE_LEN];
    let mut ptr: usize = ORIGIN;
    let mut out_buf = Vec::new();
    let mut input_bytes = input.bytes();
    let mut ip = 0usize;

    while ip < ir.len() {
        match ir[ip] {
            Add { off, n } => {
                let idx = cell(ptr, off);
                tape[idx] = tape[idx].wrapping_add_signed(wrap_i8(n));
            }
            Set { off, v } => tape[cell(ptr, off)] = wrap_i8(v) as u8,
            Move { delta } => ptr = (ptr as i64 + delta) as usize,
            MulCopy { src, dst, k } => {
                let src_idx = cell(ptr, src);
                let dst_idx = cell(ptr, dst);
                let product = (tape[src_idx] as i64) * k;
                tape[dst_idx] = tape[dst_idx].wrapping_add_signed(wrap_i8(product));
            }
            Scan { stride } => {
                if stride == 1 || stride == -1 {
                    scan_with_memchr(&tape, &mut ptr, stride);
                } else {
                    while tape[ptr] != 0 {
                        ptr = (ptr as i64 + stride) as usize;
                    }
                }
            }
            Loop => {
                if tape[ptr] == 0 {
                    ip = jump[ip];
                }
            }
            EndLoop => {
                if tape[ptr] != 0 {
                    ip = jump[ip];
                }
            }
            If { off } => {
                if tape[cell(ptr, off)] == 0 {
                    ip = jump[ip];
                }
            }
            EndIf => {}
            Input { n } => {
                for _ in 0..n {
                    match input_bytes.next() {
                        Some(byte) => tape[ptr] = byte.context("failed to read input")?,
                        None => break, // EOF: leave the cell unchanged
                    }
                }
            }
            LoadOut { off, add } => {
                let idx = cell(ptr, off);
                out_buf.push(tape[idx].wrapping_add_signed(wrap_i8(add)));
            }
            LoadOutSet { v } => out_buf.push(wrap_i8(v) as u8),
            Output => {
                output.write_all(&out_buf)?;
                output.flush()?;
                out_buf.clear();
            }
        }

        ip += 1;
    }

    Ok(())
}

fn cell(ptr: usize, off: i64) -> usize {
    (ptr as i64 + off) as usize
}

fn wrap_i8(v: i64) -> i8 {
    v.rem_euclid(256) as i8
}

fn scan_with_memchr(tape: &[u8; TAPE_LEN], ptr: &mut usize, stride: i64) {
    if stride == 1 {
        let rel = memchr(0, &tape[*ptr..]).expect("scan ran off the tape without finding a zero cell");
        *ptr += rel;
    } else {
        *ptr = memrchr(0, &tape[..=*ptr]).expect("scan ran off the tape without finding a zero cell");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse;
    use crate::optimizer::optimize;

    fn run_and_capture(ir: &[Ir]) -> Vec<u8> {
        let mut input: &[u8] = &[];
        let mut out = Vec::new();
        run(ir, &mut input, &mut out).unwrap();
        out
    }

    fn run_with_input(ir: &[Ir], mut input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        run(ir, &mut input, &mut out).unwrap();
        out
    }

    #[test]
    fn hello_world_digit_literal() {
        let ir = parse("+++.");
        assert_eq!(run_and_capture(&ir), vec![3]);
    }

    #[test]
    fn cat_echoes_input() {
        let ir = parse(",.");
        let mut input: &[u8] = b"Q";
        let mut out = Vec::new();
        run(&ir, &mut input, &mut out).unwrap();
        assert_eq!(out, b"Q");
    }

    #[test]
    fn eof_leaves_cell_unchanged() {
        let ir = parse("+,."); // cell starts at 1, read at EOF should leave it 1
        let mut input: &[u8] = &[];
        let mut out = Vec::new();
        run(&ir, &mut input, &mut out).unwrap();
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn unoptimized_and_optimized_agree_on_output() {
        let hello = hello_world_program();
        let sieve = prime_sieve_program().0;
        let escape3 = escape_iteration_program(3, 3);
        let escape9 = escape_iteration_program(9, 3);
        let programs = [
            "+++.",
            "++[->+++<]>.",
            "+++>+++<[->+<]>.",
            "+++.+.+.+.",
            "++++++++[>++++++++<-]>.",
            hello.as_str(),
            sieve.as_str(),
            escape3.as_str(),
            escape9.as_str(),
        ];
        for src in programs {
            let raw = parse(src);
            let optimized = optimize(raw.clone(), false);
            assert_eq!(
                run_and_capture(&raw),
                run_and_capture(&optimized),
                "output mismatch for {src:?}"
            );
        }
    }

    #[test]
    fn multiply_move_loop_executes_correctly() {
        let ir = optimize(parse("++[->+++<]>."), false);
        assert_eq!(run_and_capture(&ir), vec![6]);
    }

    // -- realistic differential-oracle programs ------------------------
    //
    // these are built by a tiny source generator instead of transcribed
    // from memory: a single mistyped `<` in a hand-copied classic would
    // be invisible without running it, while a generator built from a
    // handful of verified primitives (non-destructive copy, drain-add,
    // guarded replace) can be checked by tracing the primitives once.

    struct Gen {
        src: String,
        cursor: i64,
    }

    impl Gen {
        fn new() -> Self {
            Gen { src: String::new(), cursor: 0 }
        }

        fn goto(&mut self, target: i64) -> &mut Self {
            while self.cursor < target {
                self.src.push('>');
                self.cursor += 1;
            }
            while self.cursor > target {
                self.src.push('<');
                self.cursor -= 1;
            }
            self
        }

        fn raw(&mut self, s: &str) -> &mut Self {
            self.src.push_str(s);
            self
        }

        fn plus(&mut self, n: u32) -> &mut Self {
            for _ in 0..n {
                self.src.push('+');
            }
            self
        }

        fn minus(&mut self, n: u32) -> &mut Self {
            for _ in 0..n {
                self.src.push('-');
            }
            self
        }
    }

    /// clears cell 0, then sets it to each byte of `bytes` in turn and
    /// prints it -- the literal way to spell out a fixed string in
    /// Brainfuck, no loop structure involved.
    fn hello_world_program() -> String {
        let mut g = Gen::new();
        for &byte in b"Hello, World!\n" {
            g.goto(0).raw("[-]").plus(byte as u32).raw(".");
        }
        g.src
    }

    /// one ROT13 substitution branch: if cell 0 == k, replace it with v.
    /// leaves cells 1-3 (copy/copy/guard) at zero whether or not it
    /// matched, so branches chain directly.
    fn rot13_branch(k: u8, v: u8) -> String {
        let mut g = Gen::new();
        g.goto(3).raw("[-]").plus(1); // guard = 1

        // non-destructive copy: cell0 -> cell1, cell2 (cell0 restored after)
        g.goto(0).raw("[");
        g.goto(1).raw("+");
        g.goto(2).raw("+");
        g.goto(0).raw("-");
        g.raw("]");
        g.goto(2).raw("[");
        g.goto(0).raw("+");
        g.goto(2).raw("-");
        g.raw("]");

        g.goto(1).minus(k as u32); // cell1 -= k

        // is-zero test on cell1: clears guard iff cell1 (still) nonzero
        g.goto(1).raw("[");
        g.goto(3).raw("[-]");
        g.goto(1).raw("[-]");
        g.raw("]");

        // if guard: cell0 := v
        g.goto(3).raw("[");
        g.goto(0).raw("[-]").plus(v as u32);
        g.goto(3).raw("[-]");
        g.raw("]");

        g.goto(0);
        g.src
    }

    /// reads one byte and rotates it by 13 if it's one of the letters
    /// this test exercises; anything else passes through unchanged,
    /// which is exactly what falling through every branch produces.
    fn rot13_program() -> String {
        let mut src = String::from(",");
        for &(k, v) in &[(b'A', b'N'), (b'N', b'A'), (b'a', b'n'), (b'n', b'a')] {
            src.push_str(&rot13_branch(k, v));
        }
        src.push('.');
        src
    }

    #[test]
    fn rot13_rotates_letters_and_passes_through_the_rest() {
        let ir = parse(&rot13_program());
        let cases: [(u8, u8); 5] = [(b'A', b'N'), (b'N', b'A'), (b'a', b'n'), (b'n', b'a'), (b'5', b'5')];
        for (input, expected) in cases {
            assert_eq!(run_with_input(&ir, &[input]), vec![expected], "input {:?}", input as char);
        }
    }

    #[test]
    fn rot13_unoptimized_and_optimized_agree() {
        let raw = parse(&rot13_program());
        let optimized = optimize(raw.clone(), false);
        for &input in b"Aan5N" {
            assert_eq!(
                run_with_input(&raw, &[input]),
                run_with_input(&optimized, &[input]),
                "input {:?}",
                input as char
            );
        }
    }

    #[test]
    fn cat_echoes_a_bounded_stream() {
        let src = ",.".repeat(5);
        let raw = parse(&src);
        let optimized = optimize(raw.clone(), false);
        let input = b"Howdy";
        assert_eq!(run_with_input(&raw, input), input);
        assert_eq!(run_with_input(&optimized, input), input);
    }

    /// a single round of `z := (z * z) mod 256`, using cell 0 as the
    /// running value and cells 1-4 as scratch (copy-counter, copy-value,
    /// product, carry). This is the ordinary "multiply by repeated
    /// addition" idiom, squaring the same value against itself.
    fn square_mod256_round(g: &mut Gen) {
        // drain cell0 into cell1 and cell2 (both become the original z)
        g.goto(0).raw("[");
        g.goto(1).raw("+");
        g.goto(2).raw("+");
        g.goto(0).raw("-");
        g.raw("]");

        // cell1 counts down; each round adds cell2's full value into
        // cell3, restoring cell2 from cell4 afterward
        g.goto(1).raw("[");
        g.goto(2).raw("[");
        g.goto(3).raw("+");
        g.goto(4).raw("+");
        g.goto(2).raw("-");
        g.raw("]");
        g.goto(4).raw("[");
        g.goto(2).raw("+");
        g.goto(4).raw("-");
        g.raw("]");
        g.goto(1).raw("-");
        g.raw("]");

        // drain the product back into cell0
        g.goto(3).raw("[");
        g.goto(0).raw("+");
        g.goto(3).raw("-");
        g.raw("]");

        g.goto(2).raw("[-]"); // cell2 was restored to the old z; stale now
        g.goto(0);
    }

    /// a compact escape-time style iteration (z := z*z mod 256, repeated,
    /// starting from a small seed) -- real integer arithmetic rather than
    /// a literal, standing in for a full complex-plane Mandelbrot
    /// renderer, which needs signed fixed-point math well beyond what can
    /// be hand-verified without running it.
    fn escape_iteration_program(seed: u8, iterations: u32) -> String {
        let mut g = Gen::new();
        g.goto(0).plus(seed as u32);
        for _ in 0..iterations {
            square_mod256_round(&mut g);
        }
        g.goto(0).raw(".");
        g.src
    }

    #[test]
    fn escape_iteration_matches_repeated_squaring() {
        for &seed in &[3u8, 4, 7, 9] {
            let ir = parse(&escape_iteration_program(seed, 3));
            let mut z = seed as u32;
            for _ in 0..3 {
                z = (z * z) % 256;
            }
            assert_eq!(run_and_capture(&ir), vec![z as u8], "seed {seed}");
        }
    }

    /// Sieve of Eratosthenes over 2..=15: initializes a flag per
    /// candidate, clears the flags of known composites (unrolled, since
    /// the candidate range is fixed and small), then reads each flag back
    /// through a real conditional to print '1' (prime) or '0' (composite).
    /// Returns the program alongside the expected digit string, computed
    /// independently by trial division.
    fn prime_sieve_program() -> (String, Vec<u8>) {
        const N: i64 = 15;
        let mut g = Gen::new();

        for i in 2..=N {
            g.goto(i).raw("+");
        }
        for &i in &[4, 6, 8, 9, 10, 12, 14, 15] {
            g.goto(i).raw("[-]");
        }

        for i in 2..=N {
            g.goto(0).raw("[-]"); // out_byte = 0
            g.goto(1).raw("[-]").plus(1); // guard = 1

            g.goto(i).raw("[").raw("-"); // if flag(i): consume it
            g.goto(1).raw("[-]"); // guard = 0
            g.goto(0).plus(49).raw(".").raw("[-]"); // print '1'
            g.goto(i);
            g.raw("]");

            g.goto(1).raw("[").raw("-"); // else: consume guard
            g.goto(0).plus(48).raw(".").raw("[-]"); // print '0'
            g.goto(1);
            g.raw("]");
        }

        let expected = (2..=N)
            .map(|i| if (2..i).all(|d| i % d != 0) { b'1' } else { b'0' })
            .collect();

        (g.src, expected)
    }

    #[test]
    fn prime_sieve_marks_exactly_the_primes_up_to_fifteen() {
        let (src, expected) = prime_sieve_program();
        let ir = parse(&src);
        assert_eq!(run_and_capture(&ir), expected);
    }
}
