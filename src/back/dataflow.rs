//! Data-flow analyses over the CFG: liveness, constant propagation (a
//! forward reaching-values analysis), copy propagation, and dead-store
//! elimination.
//!
//! Each analysis runs to fixpoint on its own; the driver iterates the whole
//! pipeline until a full round changes nothing, recomputing liveness after
//! every mutation so later passes never read stale sets.

use crate::common::*;

use super::asm::{AluOp, Insn, Operand, Vreg};
use super::cfg::{Block, Cfg};

// ---- liveness ----

/// Block-local use/def sets: `use` is everything read before any write in
/// the block, `def` everything written.
fn use_def(block: &Block) -> (Set<Vreg>, Set<Vreg>) {
    let mut uses = Set::new();
    let mut defs = Set::new();
    for insn in &block.insns {
        for u in insn.uses() {
            if !defs.contains(&u) {
                uses.insert(u);
            }
        }
        for d in insn.defs() {
            defs.insert(d);
        }
    }
    (uses, defs)
}

/// Backward union-join liveness to fixpoint:
/// `in[b] = use[b] ∪ (out[b] \ def[b])`, `out[b] = ∪ in[s]`.
pub fn liveness(cfg: &mut Cfg) {
    let ud: Vec<(Set<Vreg>, Set<Vreg>)> = cfg.blocks.iter().map(use_def).collect();
    for b in &mut cfg.blocks {
        b.live_in.clear();
        b.live_out.clear();
    }
    let mut changed = true;
    while changed {
        changed = false;
        for i in cfg.postorder_hint() {
            let mut out = Set::new();
            for &s in &cfg.blocks[i].succs {
                out.extend(cfg.blocks[s].live_in.iter().copied());
            }
            let (uses, defs) = &ud[i];
            let mut inn = uses.clone();
            inn.extend(out.difference(defs).copied());
            if out != cfg.blocks[i].live_out || inn != cfg.blocks[i].live_in {
                changed = true;
                cfg.blocks[i].live_out = out;
                cfg.blocks[i].live_in = inn;
            }
        }
    }
}

/// Live-out set at each instruction of a block, from the block's own
/// live-out backwards.
pub fn live_out_per_insn(block: &Block) -> Vec<Set<Vreg>> {
    let mut live = block.live_out.clone();
    let mut per = vec![Set::new(); block.insns.len()];
    for (i, insn) in block.insns.iter().enumerate().rev() {
        per[i] = live.clone();
        for d in insn.defs() {
            live.remove(&d);
        }
        for u in insn.uses() {
            live.insert(u);
        }
    }
    per
}

// ---- constant propagation ----

/// The per-variable lattice: absent = not yet reached (top), `Const` =
/// single known value, `Bot` = conflicting or unknown.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Val {
    Const(i64),
    Bot,
}

type ConstState = Map<Vreg, Val>;

fn lookup(state: &ConstState, v: Vreg) -> Option<i64> {
    match state.get(&v) {
        Some(Val::Const(c)) => Some(*c),
        _ => None,
    }
}

fn meet_into(dst: &mut ConstState, src: &ConstState) -> bool {
    let mut changed = false;
    for (&v, &val) in src {
        match dst.get(&v) {
            None => {
                dst.insert(v, val);
                changed = true;
            }
            Some(&old) if old != val => {
                if old != Val::Bot {
                    dst.insert(v, Val::Bot);
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

fn alu_fold(op: AluOp, a: i64, b: i64) -> i64 {
    match op {
        AluOp::Add => a.wrapping_add(b),
        AluOp::Sub => a.wrapping_sub(b),
        AluOp::And => a & b,
        AluOp::Or => a | b,
        AluOp::Xor => a ^ b,
        AluOp::Shl => a.wrapping_shl(b as u32 & 63),
        AluOp::Shr => ((a as u64).wrapping_shr(b as u32 & 63)) as i64,
        AluOp::Sar => a.wrapping_shr(b as u32 & 63),
        AluOp::IMul => a.wrapping_mul(b),
    }
}

/// Transfer one instruction over the constant state.  Only virtual
/// registers are tracked; the physical ones are clobbered too often to be
/// worth modeling.
fn transfer(state: &mut ConstState, insn: &Insn) {
    let value_of = |state: &ConstState, op: &Operand| match op {
        Operand::Imm(c) => Some(*c),
        Operand::Reg(v) if !v.is_phys() => lookup(state, *v),
        _ => None,
    };
    match insn {
        Insn::Mov {
            dst: Operand::Reg(d),
            src,
        } if !d.is_phys() => {
            let val = value_of(state, src);
            state.insert(*d, val.map_or(Val::Bot, Val::Const));
        }
        Insn::Alu {
            op,
            dst: Operand::Reg(d),
            src,
        } if !d.is_phys() => {
            let val = match (lookup(state, *d), value_of(state, src)) {
                (Some(a), Some(b)) => Val::Const(alu_fold(*op, a, b)),
                _ => Val::Bot,
            };
            state.insert(*d, val);
        }
        Insn::Neg(Operand::Reg(d)) if !d.is_phys() => {
            let val = lookup(state, *d).map_or(Val::Bot, |a| Val::Const(a.wrapping_neg()));
            state.insert(*d, val);
        }
        Insn::Not(Operand::Reg(d)) if !d.is_phys() => {
            let val = lookup(state, *d).map_or(Val::Bot, |a| Val::Const(!a));
            state.insert(*d, val);
        }
        _ => {
            for d in insn.defs() {
                if !d.is_phys() {
                    state.insert(d, Val::Bot);
                }
            }
        }
    }
}

/// Forward reaching-values analysis: propagate each block's exit state into
/// its successors until nothing moves.
fn reaching_states(cfg: &Cfg) -> Vec<ConstState> {
    let n = cfg.blocks.len();
    let mut ins: Vec<ConstState> = vec![ConstState::new(); n];
    let mut changed = true;
    while changed {
        changed = false;
        for i in 0..n {
            let mut state = ins[i].clone();
            for insn in &cfg.blocks[i].insns {
                transfer(&mut state, insn);
            }
            for &s in &cfg.blocks[i].succs {
                changed |= meet_into(&mut ins[s], &state);
            }
        }
    }
    ins
}

fn fits_i32(c: i64) -> bool {
    i32::try_from(c).is_ok()
}

/// Replace constant operands and fold fully-constant operations.
pub fn const_prop(cfg: &mut Cfg) -> bool {
    let ins = reaching_states(cfg);
    let mut changed = false;
    for (i, block) in cfg.blocks.iter_mut().enumerate() {
        let mut state = ins[i].clone();
        for insn in &mut block.insns {
            // Values seen by this instruction use the state *before* it.
            let replaced = rewrite_insn(insn, &state);
            transfer(&mut state, insn);
            changed |= replaced;
        }
    }
    changed
}

/// Rewrite one instruction against the incoming constant state.  Immediates
/// must stay encodable: only `mov reg, imm` takes 64 bits.
fn rewrite_insn(insn: &mut Insn, state: &ConstState) -> bool {
    let const_of = |op: &Operand| match op {
        Operand::Reg(v) if !v.is_phys() => lookup(state, *v),
        _ => None,
    };
    match insn {
        Insn::Mov {
            dst: Operand::Reg(_),
            src,
        } => {
            if let Some(c) = const_of(src) {
                if !matches!(src, Operand::Imm(_)) {
                    *src = Operand::Imm(c);
                    return true;
                }
            }
            false
        }
        Insn::Alu {
            op,
            dst: Operand::Reg(d),
            src,
        } => {
            // Fold when both sides are known.
            let d = *d;
            let op = *op;
            let dval = if d.is_phys() { None } else { lookup(state, d) };
            let sval = match src {
                Operand::Imm(c) => Some(*c),
                _ => const_of(src),
            };
            if let (Some(a), Some(b)) = (dval, sval) {
                let folded = alu_fold(op, a, b);
                *insn = Insn::Mov {
                    dst: Operand::Reg(d),
                    src: Operand::Imm(folded),
                };
                return true;
            }
            if let Some(c) = sval {
                if !matches!(src, Operand::Imm(_)) && fits_i32(c) {
                    *src = Operand::Imm(c);
                    return true;
                }
            }
            false
        }
        Insn::Cmp { lhs, rhs } => {
            if let Some(c) = const_of(rhs) {
                if !matches!(rhs, Operand::Imm(_)) && fits_i32(c) && !lhs.is_imm() {
                    *rhs = Operand::Imm(c);
                    return true;
                }
            }
            false
        }
        Insn::Push(src) => {
            if let Some(c) = const_of(src) {
                if fits_i32(c) {
                    *src = Operand::Imm(c);
                    return true;
                }
            }
            false
        }
        Insn::Neg(Operand::Reg(d)) | Insn::Not(Operand::Reg(d)) => {
            let d = *d;
            if d.is_phys() {
                return false;
            }
            if let Some(a) = lookup(state, d) {
                let folded = match insn {
                    Insn::Neg(_) => a.wrapping_neg(),
                    _ => !a,
                };
                *insn = Insn::Mov {
                    dst: Operand::Reg(d),
                    src: Operand::Imm(folded),
                };
                return true;
            }
            false
        }
        _ => false,
    }
}

// ---- copy propagation ----

/// Block-local copy propagation: after `mov d, s` every read of `d`
/// becomes a read of `s`, until either side is redefined.
pub fn copy_prop(cfg: &mut Cfg) -> bool {
    let mut changed = false;
    for block in &mut cfg.blocks {
        let mut copies: Map<Vreg, Vreg> = Map::new();
        for insn in &mut block.insns {
            let resolve = |copies: &Map<Vreg, Vreg>, mut v: Vreg| {
                let mut hops = 0;
                while let Some(&s) = copies.get(&v) {
                    v = s;
                    hops += 1;
                    if hops > copies.len() {
                        break;
                    }
                }
                v
            };
            changed |= rewrite_uses(insn, |v| resolve(&copies, v));

            for d in insn.defs() {
                copies.remove(&d);
                copies.retain(|_, &mut s| s != d);
            }
            if let Some((d, s)) = insn.as_move() {
                if !d.is_phys() && !s.is_phys() && d != s {
                    copies.insert(d, s);
                }
            }
        }
    }
    changed
}

/// Apply a register substitution to use positions only; read-modify-write
/// destinations stay untouched.
fn rewrite_uses(insn: &mut Insn, f: impl Fn(Vreg) -> Vreg) -> bool {
    let mut changed = false;
    let mut map_op = |op: &mut Operand, uses_only_reg: bool| match op {
        Operand::Reg(v) if uses_only_reg => {
            let n = f(*v);
            if n != *v {
                *v = n;
                changed = true;
            }
        }
        Operand::Mem(m) => {
            if let Some(b) = m.base {
                let n = f(b);
                if n != b {
                    m.base = Some(n);
                    changed = true;
                }
            }
            if let Some(i) = m.index {
                let n = f(i);
                if n != i {
                    m.index = Some(n);
                    changed = true;
                }
            }
        }
        _ => {}
    };
    match insn {
        Insn::Mov { dst, src } => {
            map_op(src, true);
            // Only the address registers of a store are uses.
            if dst.is_mem() {
                map_op(dst, false);
            }
        }
        Insn::Alu { src, dst, .. } => {
            map_op(src, true);
            if dst.is_mem() {
                map_op(dst, false);
            }
        }
        Insn::Cmp { lhs, rhs } | Insn::Test { lhs, rhs } => {
            map_op(lhs, true);
            map_op(rhs, true);
        }
        Insn::Push(src) | Insn::Idiv(src) => map_op(src, true),
        Insn::Lea { addr, .. } => {
            if let Some(b) = addr.base {
                let n = f(b);
                if n != b {
                    addr.base = Some(n);
                    changed = true;
                }
            }
            if let Some(i) = addr.index {
                let n = f(i);
                if n != i {
                    addr.index = Some(n);
                    changed = true;
                }
            }
        }
        _ => {}
    }
    changed
}

// ---- dead-store elimination ----

/// Drop pure definitions of virtual registers that are dead at the point of
/// definition.  Requires fresh liveness.
pub fn dead_stores(cfg: &mut Cfg) -> bool {
    let mut changed = false;
    for block in &mut cfg.blocks {
        let per = live_out_per_insn(block);
        let mut keep = vec![true; block.insns.len()];
        for (i, insn) in block.insns.iter().enumerate() {
            if let Some(d) = pure_def(insn) {
                if !d.is_phys() && !per[i].contains(&d) {
                    keep[i] = false;
                    changed = true;
                }
            }
        }
        let mut it = keep.iter();
        block.insns.retain(|_| *it.next().unwrap());
    }
    changed
}

/// The register a side-effect-free instruction defines, if that is all it
/// does.
fn pure_def(insn: &Insn) -> Option<Vreg> {
    match insn {
        Insn::Mov {
            dst: Operand::Reg(d),
            ..
        }
        | Insn::Alu {
            dst: Operand::Reg(d),
            ..
        }
        | Insn::Neg(Operand::Reg(d))
        | Insn::Not(Operand::Reg(d))
        | Insn::Set { dst: d, .. }
        | Insn::Lea { dst: d, .. } => Some(*d),
        _ => None,
    }
}

// ---- driver ----

/// Run the fixed pipeline to a global fixpoint.  Every rewrite invalidates
/// the liveness sets, so they are recomputed between passes and left fresh
/// on exit.
pub fn optimize(cfg: &mut Cfg) {
    loop {
        let mut changed = false;
        changed |= const_prop(cfg);
        changed |= copy_prop(cfg);
        liveness(cfg);
        changed |= dead_stores(cfg);
        if !changed {
            break;
        }
    }
    liveness(cfg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::asm::Reg;
    use crate::middle::ir::Label;

    fn v(n: u32) -> Vreg {
        Vreg(16 + n)
    }

    fn reg(n: u32) -> Operand {
        Operand::Reg(v(n))
    }

    fn mov(dst: u32, src: Operand) -> Insn {
        Insn::Mov {
            dst: reg(dst),
            src,
        }
    }

    fn build(insns: Vec<Insn>) -> Cfg {
        let mut insns = insns;
        let mut all = vec![Insn::Label(Label(0))];
        all.append(&mut insns);
        let mut next = 1000;
        let mut cfg = Cfg::build(all, &mut next).unwrap();
        liveness(&mut cfg);
        cfg
    }

    #[test]
    fn liveness_reaches_fixpoint_and_stays() {
        let insns = vec![
            Insn::Label(Label(0)),
            mov(0, Operand::Imm(1)),
            Insn::Jmp(Label(1)),
            Insn::Label(Label(1)),
            Insn::Alu {
                op: AluOp::Add,
                dst: reg(0),
                src: Operand::Imm(1),
            },
            Insn::Jcc {
                cc: super::super::asm::Cond::L,
                target: Label(1),
            },
            Insn::Jmp(Label(2)),
            Insn::Label(Label(2)),
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: reg(0),
            },
            Insn::Ret { value: true },
        ];
        let mut next = 1000;
        let mut cfg = Cfg::build(insns, &mut next).unwrap();
        liveness(&mut cfg);
        // v0 is live around the loop
        assert!(cfg.blocks[1].live_in.contains(&v(0)));
        let snapshot: Vec<_> = cfg
            .blocks
            .iter()
            .map(|b| (b.live_in.clone(), b.live_out.clone()))
            .collect();
        // One extra run changes nothing.
        liveness(&mut cfg);
        let again: Vec<_> = cfg
            .blocks
            .iter()
            .map(|b| (b.live_in.clone(), b.live_out.clone()))
            .collect();
        assert_eq!(snapshot, again);
    }

    #[test]
    fn constants_fold_through_alu_chains() {
        let mut cfg = build(vec![
            mov(0, Operand::Imm(6)),
            mov(1, reg(0)),
            Insn::Alu {
                op: AluOp::IMul,
                dst: reg(1),
                src: Operand::Imm(7),
            },
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: reg(1),
            },
            Insn::Ret { value: true },
        ]);
        optimize(&mut cfg);
        let insns = cfg.linearize();
        // The multiply folded to 42 and the dead copies disappeared.
        assert!(insns.iter().any(|i| matches!(
            i,
            Insn::Mov {
                dst: Operand::Reg(d),
                src: Operand::Imm(42)
            } if d.phys() == Some(Reg::Rax) || !d.is_phys()
        )), "{insns:?}");
        assert!(!insns
            .iter()
            .any(|i| matches!(i, Insn::Alu { op: AluOp::IMul, .. })));
    }

    #[test]
    fn copies_propagate_and_die() {
        let mut cfg = build(vec![
            mov(0, Operand::Imm(5)),
            mov(1, reg(0)),
            mov(2, reg(1)),
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: reg(2),
            },
            Insn::Ret { value: true },
        ]);
        optimize(&mut cfg);
        let insns = cfg.linearize();
        let movs = insns
            .iter()
            .filter(|i| matches!(i, Insn::Mov { .. }))
            .count();
        // Only the final constant load into rax remains.
        assert_eq!(movs, 1, "{insns:?}");
    }

    #[test]
    fn stores_to_memory_survive() {
        use crate::back::asm::MemRef;
        let mut cfg = build(vec![
            mov(0, Operand::Imm(5)),
            Insn::Mov {
                dst: Operand::Mem(MemRef::sym("_g_x")),
                src: reg(0),
            },
            Insn::Ret { value: false },
        ]);
        optimize(&mut cfg);
        let insns = cfg.linearize();
        assert!(insns
            .iter()
            .any(|i| matches!(i, Insn::Mov { dst: Operand::Mem(_), .. })));
    }

    #[test]
    fn second_round_changes_nothing() {
        let mut cfg = build(vec![
            mov(0, Operand::Imm(2)),
            mov(1, reg(0)),
            Insn::Alu {
                op: AluOp::Shl,
                dst: reg(1),
                src: Operand::Imm(3),
            },
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: reg(1),
            },
            Insn::Ret { value: true },
        ]);
        optimize(&mut cfg);
        let snapshot: Vec<String> = cfg.blocks[0].insns.iter().map(|i| i.to_string()).collect();
        assert!(!const_prop(&mut cfg));
        assert!(!copy_prop(&mut cfg));
        liveness(&mut cfg);
        assert!(!dead_stores(&mut cfg));
        let again: Vec<String> = cfg.blocks[0].insns.iter().map(|i| i.to_string()).collect();
        assert_eq!(snapshot, again);
    }
}
