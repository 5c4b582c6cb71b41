//! Final lowering to NASM text.
//!
//! The instruction stream is physical by now, so most of the work is
//! sections and the frame protocol: length-prefixed string blobs and
//! constant globals in `.data`, zeroed globals in `.bss`, a prologue that
//! keeps rsp 16-byte aligned at every call, callee-saved pushes only for
//! the registers the allocator actually handed out, and the `main` stub
//! that runs the global initializers before the source main.

use crate::common::*;
use crate::middle::ir;

use super::asm::{AluOp, Insn, Operand, Reg};
use super::regalloc::Allocation;

/// The label the source `main` was mangled to.
const SOURCE_MAIN: &str = "_f_main";

/// The implicit global-initializer function.
const INIT: &str = "__init";

pub fn translate(program: &ir::Program, allocs: &[Allocation]) -> String {
    let mut out = String::new();
    let mut push = |s: &str| {
        out.push_str(s);
        out.push('\n');
    };

    push("default rel");
    push("global main");
    for ext in externs(allocs) {
        push(&format!("extern {ext}"));
    }
    push("");

    // Length-prefixed string literals and constant-initialized globals.
    push("section .data");
    for (i, s) in program.strings.iter().enumerate() {
        push(&format!("_s_{i}:"));
        push(&format!("    dq {}", s.len()));
        push(&format!("    {}", data_bytes(s)));
    }
    for (_, label, init) in &program.globals {
        if let Some(c) = init {
            push(&format!("{label}:"));
            push(&format!("    dq {c}"));
        }
    }
    push("");

    push("section .bss");
    for (_, label, init) in &program.globals {
        if init.is_none() {
            push(&format!("{label}:"));
            push("    resq 1");
        }
    }
    push("");

    push("section .text");
    // Entry: run the global initializers, then the program; its exit status
    // is whatever the source main returns.
    push("main:");
    push("    push rbp");
    push("    mov rbp, rsp");
    push(&format!("    call {INIT}"));
    push(&format!("    call {SOURCE_MAIN}"));
    push("    leave");
    push("    ret");
    push("");

    for alloc in allocs {
        function(&mut out, alloc);
        out.push('\n');
    }
    out
}

/// Call targets that are not functions of this program.
fn externs(allocs: &[Allocation]) -> Vec<String> {
    let defined: Set<&str> = allocs.iter().map(|a| a.label.as_str()).collect();
    let mut ext = Set::new();
    for a in allocs {
        for insn in &a.insns {
            if let Insn::Call { target, .. } = insn {
                if !defined.contains(target.as_str()) {
                    ext.insert(target.clone());
                }
            }
        }
    }
    ext.into_iter().collect()
}

fn function(out: &mut String, alloc: &Allocation) {
    let mut push = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    // Keep every call site 16-byte aligned: after `push rbp` the stack is
    // aligned, so the frame plus the callee-saved pushes must stay a
    // multiple of 16.
    let saved = &alloc.used_callee_saved;
    let mut frame = 8 * alloc.spill_slots;
    if (frame + 8 * saved.len()) % 16 != 0 {
        frame += 8;
    }

    push(format!("{}:", alloc.label));
    push("    push rbp".to_string());
    push("    mov rbp, rsp".to_string());
    if frame > 0 {
        push(format!("    sub rsp, {frame}"));
    }
    for r in saved {
        push(format!("    push {r}"));
    }

    for (i, insn) in alloc.insns.iter().enumerate() {
        match insn {
            Insn::Label(l) => push(format!("{l}:")),
            Insn::Jmp(l) => {
                // Fallthrough elision: the block layout is final here.
                if !matches!(alloc.insns.get(i + 1), Some(Insn::Label(next)) if next == l) {
                    push(format!("    jmp {l}"));
                }
            }
            Insn::Set { cc, dst } => {
                let r = dst.phys().expect("setcc on an unallocated register");
                push(format!("    set{cc} {}", r.byte_name()));
                push(format!("    movzx {r}, {}", r.byte_name()));
            }
            // A variable shift count sits in rcx but is written `cl`.
            Insn::Alu {
                op: op @ (AluOp::Shl | AluOp::Shr | AluOp::Sar),
                dst,
                src: Operand::Reg(count),
            } => {
                let r = count.phys().expect("shift count on an unallocated register");
                push(format!("    {op} {dst}, {}", r.byte_name()));
            }
            Insn::Ret { .. } => {
                for r in saved.iter().rev() {
                    push(format!("    pop {r}"));
                }
                push("    leave".to_string());
                push("    ret".to_string());
            }
            insn => push(format!("    {insn}")),
        }
    }
}

/// Render a string literal as NASM `db` data: quoted runs for plain ASCII,
/// numeric bytes for everything else, and a trailing NUL.
fn data_bytes(s: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut run = String::new();
    for &b in s.as_bytes() {
        if (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' {
            run.push(b as char);
        } else {
            if !run.is_empty() {
                parts.push(format!("\"{run}\""));
                run.clear();
            }
            parts.push(b.to_string());
        }
    }
    if !run.is_empty() {
        parts.push(format!("\"{run}\""));
    }
    parts.push("0".to_string());
    format!("db {}", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_blobs_are_length_prefixed() {
        assert_eq!(data_bytes("hi"), "db \"hi\", 0");
        assert_eq!(data_bytes("a\nb"), "db \"a\", 10, \"b\", 0");
        assert_eq!(data_bytes(""), "db 0");
        assert_eq!(data_bytes("say \"hi\""), "db \"say \", 34, \"hi\", 34, 0");
    }

    #[test]
    fn empty_function_still_gets_a_frame() {
        let alloc = Allocation {
            label: "_f_empty".into(),
            insns: vec![
                Insn::Label(crate::middle::ir::Label(0)),
                Insn::Ret { value: false },
            ],
            spill_slots: 0,
            used_callee_saved: vec![],
        };
        let program = ir::Program {
            funs: vec![],
            strings: vec![],
            globals: vec![],
            next_label: 0,
        };
        let text = translate(&program, &[alloc]);
        let body: Vec<&str> = text
            .lines()
            .skip_while(|l| *l != "_f_empty:")
            .take_while(|l| !l.is_empty())
            .collect();
        assert_eq!(
            body,
            vec![
                "_f_empty:",
                "    push rbp",
                "    mov rbp, rsp",
                ".L0:",
                "    leave",
                "    ret",
            ]
        );
    }

    #[test]
    fn frame_stays_sixteen_byte_aligned() {
        let alloc = Allocation {
            label: "_f_x".into(),
            insns: vec![Insn::Ret { value: false }],
            spill_slots: 1,
            used_callee_saved: vec![Reg::Rbx],
        };
        let program = ir::Program {
            funs: vec![],
            strings: vec![],
            globals: vec![],
            next_label: 0,
        };
        let text = translate(&program, &[alloc]);
        // 1 slot (8) + 1 push (8) = 16: no padding needed.
        assert!(text.contains("sub rsp, 8\n"), "{text}");
        let alloc2 = Allocation {
            label: "_f_y".into(),
            insns: vec![Insn::Ret { value: false }],
            spill_slots: 1,
            used_callee_saved: vec![],
        };
        let text = translate(&program, &[alloc2]);
        // 1 slot alone must round up to 16.
        assert!(text.contains("sub rsp, 16\n"), "{text}");
    }

    #[test]
    fn entry_runs_init_before_source_main() {
        let program = ir::Program {
            funs: vec![],
            strings: vec![],
            globals: vec![],
            next_label: 0,
        };
        let text = translate(&program, &[]);
        let init = text.find("call __init").unwrap();
        let main = text.find("call _f_main").unwrap();
        assert!(init < main);
    }

    #[test]
    fn jump_to_next_label_is_elided() {
        let alloc = Allocation {
            label: "_f_j".into(),
            insns: vec![
                Insn::Label(crate::middle::ir::Label(0)),
                Insn::Jmp(crate::middle::ir::Label(1)),
                Insn::Label(crate::middle::ir::Label(1)),
                Insn::Ret { value: false },
            ],
            spill_slots: 0,
            used_callee_saved: vec![],
        };
        let program = ir::Program {
            funs: vec![],
            strings: vec![],
            globals: vec![],
            next_label: 0,
        };
        let text = translate(&program, &[alloc]);
        assert!(!text.contains("jmp"), "{text}");
    }
}
