//! IR to GNU-syntax (AT&T) x86-64 assembly.

use std::fmt::Write as _;
use std::io::Write;

use anyhow::Result;
use indoc::indoc;

use crate::ir::Ir::{self, *};

const TAPE_BYTES: i64 = 8192;
const TAPE_ORIGIN: i64 = TAPE_BYTES / 2;

/// lower an optimized IR stream to assembly text and write it out
///
/// builds the whole program in memory first: the size of `strbuff`
/// depends on the largest batched output seen anywhere in the stream,
/// which isn't known until the final instruction has been lowered, so
/// the preamble is only formatted in after the body is complete.
pub fn to_asm(ir: &[Ir], writer: &mut impl Write) -> Result<()> {
    let mut body = String::new();
    let mut loop_stack = Vec::new();
    let mut if_stack = Vec::new();
    let mut label = 0u64;
    let mut out_pos: i64 = 0;
    let mut out_buf_size: i64 = 8;

    for (i, &inst) in ir.iter().enumerate() {
        match inst {
            Add { off, n } => emit_add(&mut body, off, n)?,

            Set { off, v } => {
                if off == 0 && v == 0 {
                    writeln!(body, "    xor %r12, %r12")?;
                } else if off == 0 {
                    writeln!(body, "    movq ${v}, %r12")?;
                } else {
                    writeln!(body, "    movq ${v}, {}(%rbx)", off * 8)?;
                }
            }

            Move { delta } => {
                if delta != 0 {
                    writeln!(body, "    movq %r12, (%rbx)")?;
                    if delta > 0 {
                        writeln!(body, "    addq ${}, %rbx", delta * 8)?;
                    } else {
                        writeln!(body, "    subq ${}, %rbx", -delta * 8)?;
                    }
                    let next_is_set_zero = matches!(ir.get(i + 1), Some(Set { off: 0, .. }));
                    if !next_is_set_zero {
                        writeln!(body, "    movq (%rbx), %r12")?;
                    }
                }
            }

            MulCopy { src, dst, k } => emit_mulcopy(&mut body, src, dst, k)?,

            Loop => {
                label += 1;
                loop_stack.push(label);
                writeln!(body, "    jmp endloop{label}")?;
                writeln!(body, "loop{label}:")?;
            }
            EndLoop => {
                let l = loop_stack
                    .pop()
                    .unwrap_or_else(|| unreachable!("EndLoop with no matching Loop"));
                writeln!(body, "endloop{l}:")?;
                writeln!(body, "    test %r12, %r12")?;
                writeln!(body, "    jnz loop{l}")?;
            }

            If { off } => {
                label += 1;
                if_stack.push(label);
                if off == 0 {
                    writeln!(body, "    test %r12, %r12")?;
                } else {
                    writeln!(body, "    cmpq $0, {}(%rbx)", off * 8)?;
                }
                writeln!(body, "    jz endif{label}")?;
            }
            EndIf => {
                let l = if_stack
                    .pop()
                    .unwrap_or_else(|| unreachable!("EndIf with no matching If"));
                writeln!(body, "endif{l}:")?;
            }

            Scan { stride } => {
                label += 1;
                writeln!(body, "    movq %r12, (%rbx)")?;
                writeln!(body, "    jmp endloop{label}")?;
                writeln!(body, "loop{label}:")?;
                if stride > 0 {
                    writeln!(body, "    addq ${}, %rbx", stride * 8)?;
                } else {
                    writeln!(body, "    subq ${}, %rbx", -stride * 8)?;
                }
                writeln!(body, "endloop{label}:")?;
                writeln!(body, "    cmp $0, (%rbx)")?;
                writeln!(body, "    jnz loop{label}")?;
                writeln!(body, "    movq (%rbx), %r12")?;
            }

            Input { n } => emit_input(&mut body, n, &mut label)?,

            LoadOut { off, add } => {
                let out_addr = format!("(strbuff+{out_pos})");
                if off == 0 {
                    writeln!(body, "    movq %r12, {out_addr}")?;
                } else {
                    writeln!(body, "    movq {}(%rbx), %rax", off * 8)?;
                    writeln!(body, "    movq %rax, {out_addr}")?;
                }
                if add > 0 {
                    writeln!(body, "    addb ${add}, {out_addr}")?;
                } else if add < 0 {
                    writeln!(body, "    subb ${}, {out_addr}", -add)?;
                }
                out_pos += 1;
            }
            LoadOutSet { v } => {
                writeln!(body, "    movq ${v}, (strbuff+{out_pos})")?;
                out_pos += 1;
            }
            Output => {
                writeln!(body)?;
                writeln!(body, "    movq $1, %rax")?;
                writeln!(body, "    movq $1, %rdi")?;
                writeln!(body, "    movq $strbuff, %rsi")?;
                writeln!(body, "    movq ${out_pos}, %rdx")?;
                writeln!(body, "    syscall")?;
                writeln!(body)?;
                out_buf_size = out_buf_size.max(out_pos + 8);
                out_pos = 0;
            }
        }
    }

    let preamble = format!(
        indoc! {"
            .section .bss
                .lcomm strbuff, {out_buf_size}
                .lcomm mem, {TAPE_BYTES}
                .set startidx, mem + {TAPE_ORIGIN}
            .section .text
            .global _start
            _start:
                xor %r12, %r12
                movq $startidx, %rbx
        "}
    );

    write!(writer, "{preamble}")?;
    write!(writer, "{body}")?;
    write!(
        writer,
        indoc! {"

            # exit(0)
                movq $60, %rax
                movq $0, %rdi
                syscall
        "}
    )?;

    Ok(())
}

fn emit_add(body: &mut String, off: i64, n: i64) -> Result<()> {
    let dest = if off == 0 {
        "%r12".to_string()
    } else {
        format!("{}(%rbx)", off * 8)
    };
    if n == 1 && off == 0 {
        writeln!(body, "    inc {dest}")?;
    } else if n >= 1 {
        writeln!(body, "    addq ${n}, {dest}")?;
    } else if n == -1 && off == 0 {
        writeln!(body, "    dec {dest}")?;
    } else if n <= -1 {
        writeln!(body, "    subq ${}, {dest}", -n)?;
    }
    Ok(())
}

fn emit_mulcopy(body: &mut String, src: i64, dst: i64, k: i64) -> Result<()> {
    let src_operand = if src == 0 {
        "%r12".to_string()
    } else {
        format!("{}(%rbx)", src * 8)
    };
    let dst_operand = if dst == 0 {
        "%r12".to_string()
    } else {
        format!("{}(%rbx)", dst * 8)
    };

    let source = if k != 1 && k != -1 {
        writeln!(body, "    movq {src_operand}, %rax")?;
        writeln!(body, "    movq ${}, %rdx", k.abs())?;
        writeln!(body, "    mulq %rdx")?;
        "%rax".to_string()
    } else if src_operand != "%r12" && dst_operand != "%r12" {
        // x86 has no memory-to-memory add/sub
        writeln!(body, "    movq {src_operand}, %rax")?;
        "%rax".to_string()
    } else {
        src_operand
    };

    if k > 0 {
        writeln!(body, "    addq {source}, {dst_operand}")?;
    } else {
        writeln!(body, "    subq {source}, {dst_operand}")?;
    }
    Ok(())
}

fn emit_input(body: &mut String, n: u32, label: &mut u64) -> Result<()> {
    if n == 1 {
        write!(
            body,
            indoc! {"
                    xor %rax, %rax
                    xor %rdi, %rdi
                    movq %rbx, %rsi
                    movq $1, %rdx
                    syscall
                    movq (%rbx), %r12
            "}
        )?;
    } else {
        *label += 1;
        let l = *label;
        writeln!(body, "    movq ${n}, %rcx")?;
        writeln!(body, "input{l}:")?;
        write!(
            body,
            indoc! {"
                    xor %rax, %rax
                    xor %rdi, %rdi
                    movq %rbx, %rsi
                    movq $1, %rdx
                    syscall
            "}
        )?;
        writeln!(body, "    loop input{l}")?;
        writeln!(body, "    movq (%rbx), %r12")?;
    }
    Ok(())
}
