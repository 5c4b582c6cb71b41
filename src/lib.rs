//! This is the compiler as a library.  See `src/bin` directory for the
//! executable program using it.
//!
//! The pipeline runs strictly forward: parse, check, eliminate
//! output-irrelevant code, lower to the three-address IR, select abstract
//! x86-64 instructions, optimize on the CFG, allocate registers, and
//! finally print NASM.  Every stage owns its structures and hands the next
//! stage what it needs; errors travel as [common::CompileError] values and
//! become a process exit only in the driver.

pub mod common;
pub mod front;
pub mod middle;
pub mod back;

use common::{Config, Result};

/// Everything a compilation produces, so the driver decides what to print
/// and where.
#[derive(Debug)]
pub struct Compiled {
    /// The NASM program text.
    pub asm: String,
    /// Abstract instructions before register allocation, one line each;
    /// populated only under `print_ins`.
    pub pre_alloc: Vec<String>,
    /// Output-irrelevant elimination decisions, for `print_remove`.
    pub removed: Vec<middle::elim::Removal>,
}

/// Compile one source file to assembly text.
pub fn compile(source: &str, config: &Config) -> Result<Compiled> {
    let mut ast = front::parse(source)?;
    let env = front::check(&ast)?;
    let removed = middle::elim::eliminate(&mut ast, &env);
    let ir = front::lower(&ast, &env)?;

    let mut next_label = ir.next_label;
    let funs = back::select(&ir, &env, &mut next_label)?;

    let mut pre_alloc = Vec::new();
    let mut allocs = Vec::new();
    for f in funs {
        let mut cfg = back::cfg::Cfg::build(f.insns, &mut next_label)?;
        back::dataflow::optimize(&mut cfg);
        let insns = cfg.linearize();
        if config.print_ins {
            pre_alloc.push(format!("{}:", f.label));
            pre_alloc.extend(insns.iter().map(|i| format!("    {i}")));
        }
        let f = back::asm::AsmFunction {
            label: f.label,
            insns,
            next_vreg: f.next_vreg,
            locals: f.locals,
        };
        allocs.push(back::regalloc::allocate(f, config, &mut next_label)?);
    }

    let asm = back::translate(&ir, &allocs);
    Ok(Compiled {
        asm,
        pre_alloc,
        removed,
    })
}
