//! Basic blocks and the control-flow graph.
//!
//! Blocks live in a vector and refer to each other by index, which keeps
//! the back edges plain integers.  A block starts at every label and after
//! every terminator; every block begins with its label and ends with
//! exactly one terminator (an unterminated block gets an explicit jump to
//! its fallthrough).

use crate::common::*;
use crate::middle::ir::Label;

use super::asm::{Insn, Vreg};

#[derive(Debug)]
pub struct Block {
    pub label: Label,
    pub insns: Vec<Insn>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
    /// Liveness sets, filled by the data-flow analyzer.
    pub live_in: Set<Vreg>,
    pub live_out: Set<Vreg>,
    /// Loop nesting depth, for the spill heuristic.
    pub loop_depth: u32,
}

#[derive(Debug)]
pub struct Cfg {
    pub blocks: Vec<Block>,
}

impl Cfg {
    /// Partition an instruction list into blocks and link the edges.
    pub fn build(insns: Vec<Insn>, next_label: &mut u32) -> Result<Cfg> {
        let mut blocks: Vec<Block> = Vec::new();
        let mut current: Option<Block> = None;

        let mut fresh = || {
            let l = Label(*next_label);
            *next_label += 1;
            l
        };

        for insn in insns {
            match insn {
                Insn::Label(l) => {
                    if let Some(mut b) = current.take() {
                        // Fallthrough into a label becomes an explicit jump
                        // so the block keeps a single terminator.
                        if !b.insns.last().map(Insn::is_terminator).unwrap_or(false) {
                            b.insns.push(Insn::Jmp(l));
                        }
                        blocks.push(b);
                    }
                    current = Some(Block {
                        label: l,
                        insns: vec![Insn::Label(l)],
                        succs: Vec::new(),
                        preds: Vec::new(),
                        live_in: Set::new(),
                        live_out: Set::new(),
                        loop_depth: 0,
                    });
                }
                insn => {
                    if current.is_none() {
                        // Instructions after a terminator with no label are
                        // unreachable; give them a block anyway so nothing
                        // is silently dropped.
                        let l = fresh();
                        current = Some(Block {
                            label: l,
                            insns: vec![Insn::Label(l)],
                            succs: Vec::new(),
                            preds: Vec::new(),
                            live_in: Set::new(),
                            live_out: Set::new(),
                            loop_depth: 0,
                        });
                    }
                    let b = current.as_mut().unwrap();
                    let terminator = insn.is_terminator();
                    b.insns.push(insn);
                    if terminator {
                        blocks.push(current.take().unwrap());
                    }
                }
            }
        }
        if let Some(mut b) = current.take() {
            if !b.insns.last().map(Insn::is_terminator).unwrap_or(false) {
                b.insns.push(Insn::Ret { value: false });
            }
            blocks.push(b);
        }
        if blocks.is_empty() {
            return Err(CompileError::internal("function with no instructions"));
        }

        let mut cfg = Cfg { blocks };
        cfg.link()?;
        cfg.mark_loops();
        Ok(cfg)
    }

    /// Recompute successor and predecessor edges from the terminators.
    pub fn link(&mut self) -> Result<()> {
        let index: Map<Label, usize> = self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.label, i))
            .collect();
        for b in &mut self.blocks {
            b.succs.clear();
            b.preds.clear();
        }
        let mut edges = Vec::new();
        for (i, b) in self.blocks.iter().enumerate() {
            let term = b.insns.last().ok_or_else(|| {
                CompileError::internal("empty basic block")
            })?;
            match term {
                Insn::Jmp(l) => edges.push((i, index[l])),
                Insn::Jcc { target, .. } => {
                    edges.push((i, index[target]));
                    // The jcc is always followed by an explicit jmp in the
                    // same original stream, which ended this block; a lone
                    // jcc terminator would fall through, which build() never
                    // produces.  Defensive: treat the next block as the
                    // other edge if it exists.
                    if i + 1 < self.blocks.len() {
                        edges.push((i, i + 1));
                    }
                }
                Insn::Ret { .. } => {}
                _ => {
                    return Err(CompileError::internal(
                        "basic block without a terminator",
                    ))
                }
            }
        }
        for (from, to) in edges {
            if !self.blocks[from].succs.contains(&to) {
                self.blocks[from].succs.push(to);
            }
            if !self.blocks[to].preds.contains(&from) {
                self.blocks[to].preds.push(from);
            }
        }
        Ok(())
    }

    /// Approximate loop depth: a branch backwards in layout order closes a
    /// loop over the spanned range.  Structured lowering always lays loop
    /// headers out before their bodies, so this matches the source nesting.
    fn mark_loops(&mut self) {
        let mut depth = vec![0u32; self.blocks.len()];
        for (i, b) in self.blocks.iter().enumerate() {
            for &s in &b.succs {
                if s <= i {
                    for d in depth.iter_mut().take(i + 1).skip(s) {
                        *d += 1;
                    }
                }
            }
        }
        for (b, d) in self.blocks.iter_mut().zip(depth) {
            b.loop_depth = d;
        }
    }

    /// Flatten back into a single instruction stream.
    pub fn linearize(self) -> Vec<Insn> {
        self.blocks.into_iter().flat_map(|b| b.insns).collect()
    }

    /// Blocks in reverse order, for backward analyses.
    pub fn postorder_hint(&self) -> impl Iterator<Item = usize> {
        (0..self.blocks.len()).rev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::asm::{Cond, Operand};

    fn label(n: u32) -> Label {
        Label(n)
    }

    fn jmp(n: u32) -> Insn {
        Insn::Jmp(label(n))
    }

    #[test]
    fn splits_at_labels_and_terminators() {
        let insns = vec![
            Insn::Label(label(0)),
            Insn::Mov {
                dst: Operand::Reg(Vreg(20)),
                src: Operand::Imm(1),
            },
            Insn::Jcc {
                cc: Cond::E,
                target: label(2),
            },
            jmp(1),
            Insn::Label(label(1)),
            jmp(2),
            Insn::Label(label(2)),
            Insn::Ret { value: false },
        ];
        let mut next = 100;
        let cfg = Cfg::build(insns, &mut next).unwrap();
        assert_eq!(cfg.blocks.len(), 4);
        // every block: leading label, single trailing terminator
        for b in &cfg.blocks {
            assert!(matches!(b.insns[0], Insn::Label(_)));
            assert!(b.insns.last().unwrap().is_terminator());
            let terminators = b.insns.iter().filter(|i| i.is_terminator()).count();
            assert_eq!(terminators, 1);
        }
        // jcc block reaches its target and its fallthrough continuation
        assert_eq!(cfg.blocks[0].succs.len(), 2);
        assert_eq!(cfg.blocks[3].preds.len(), 2);
    }

    #[test]
    fn fallthrough_into_label_gets_a_jump() {
        let insns = vec![
            Insn::Label(label(0)),
            Insn::Mov {
                dst: Operand::Reg(Vreg(20)),
                src: Operand::Imm(1),
            },
            Insn::Label(label(1)),
            Insn::Ret { value: false },
        ];
        let mut next = 100;
        let cfg = Cfg::build(insns, &mut next).unwrap();
        assert_eq!(cfg.blocks.len(), 2);
        assert!(matches!(cfg.blocks[0].insns.last(), Some(Insn::Jmp(l)) if *l == label(1)));
        assert_eq!(cfg.blocks[0].succs, vec![1]);
    }

    #[test]
    fn back_edge_marks_a_loop() {
        let insns = vec![
            Insn::Label(label(0)),
            jmp(1),
            Insn::Label(label(1)),
            Insn::Jcc {
                cc: Cond::L,
                target: label(2),
            },
            jmp(3),
            Insn::Label(label(2)),
            jmp(1),
            Insn::Label(label(3)),
            Insn::Ret { value: false },
        ];
        let mut next = 100;
        let cfg = Cfg::build(insns, &mut next).unwrap();
        assert!(cfg.blocks[2].loop_depth > 0);
        assert!(cfg.blocks[0].loop_depth == 0);
    }
}
