//! Graph-coloring register allocation, Chaitin-Briggs style with
//! conservative coalescing (Briggs and George criteria), freezing, and
//! spilling chosen by `use_count / degree` weighted against loop depth.
//!
//! Physical registers participate as precolored nodes: they never enter a
//! worklist, their degree is treated as infinite, and an edge from a
//! virtual to a precolored node simply forbids that color.  Because every
//! call defines the full caller-saved set, anything live across a call
//! interferes with all of it and naturally receives a callee-saved color.
//!
//! Functions with more declared locals than the configured threshold skip
//! all of this: every virtual gets a stack slot and operands are shuttled
//! through scratch registers around each instruction, which bounds compile
//! time on pathological inputs.

use crate::common::*;

use super::asm::*;
use super::cfg::Cfg;
use super::dataflow::{self, live_out_per_insn};

/// How many build/color/spill rounds before giving up; each round strictly
/// reduces live ranges, so hitting this means a bug.
const MAX_ROUNDS: usize = 16;

/// The allocator's result: a stream free of virtual registers.
#[derive(Debug)]
pub struct Allocation {
    pub label: String,
    pub insns: Vec<Insn>,
    /// Stack slots used for spills (and, in naive mode, for every virtual).
    pub spill_slots: usize,
    pub used_callee_saved: Vec<Reg>,
}

pub fn allocate(f: AsmFunction, config: &Config, next_label: &mut u32) -> Result<Allocation> {
    if f.locals > config.naive_threshold {
        return naive(f);
    }
    color(f, next_label)
}

// ---- graph coloring ----

fn color(f: AsmFunction, next_label: &mut u32) -> Result<Allocation> {
    let mut insns = f.insns;
    let mut next_vreg = f.next_vreg;
    let mut slots: usize = 0;
    let mut no_spill: Set<Vreg> = Set::new();

    for _ in 0..MAX_ROUNDS {
        let mut cfg = Cfg::build(std::mem::take(&mut insns), next_label)?;
        dataflow::liveness(&mut cfg);
        let mut alloc = Coloring::new(&no_spill);
        alloc.build(&cfg);
        alloc.make_worklists();
        alloc.run();
        alloc.assign_colors();

        insns = cfg.linearize();
        // Coalescing holds regardless of spilling: fold aliases first.
        for insn in &mut insns {
            insn.map_regs(|v| alloc.resolve(v));
        }
        insns.retain(|i| match i.as_move() {
            Some((d, s)) => d != s,
            None => true,
        });

        if alloc.spilled.is_empty() {
            let mut failed = None;
            for insn in &mut insns {
                insn.map_regs(|v| match v.phys() {
                    Some(_) => v,
                    None => match alloc.colors.get(&v) {
                        Some(r) => r.vreg(),
                        None => {
                            failed = Some(v);
                            v
                        }
                    },
                });
            }
            if let Some(v) = failed {
                return Err(CompileError::internal(format!(
                    "virtual register {v} left uncolored"
                )));
            }
            let used = used_callee_saved(&insns);
            return Ok(Allocation {
                label: f.label,
                insns,
                spill_slots: slots,
                used_callee_saved: used,
            });
        }

        // Actual spills: a unique slot each, loads before uses and stores
        // after defs through fresh short-lived virtuals, then start over.
        let mut slot_of: Map<Vreg, usize> = Map::new();
        for &v in &alloc.spilled {
            slot_of.insert(v, slots);
            slots += 1;
        }
        insns = rewrite_spills(insns, &slot_of, &mut next_vreg, &mut no_spill);
    }
    Err(CompileError::internal(
        "register allocation did not converge",
    ))
}

fn used_callee_saved(insns: &[Insn]) -> Vec<Reg> {
    let mut used = Set::new();
    for insn in insns {
        for v in insn.defs().into_iter().chain(insn.uses()) {
            if let Some(r) = v.phys() {
                if CALLEE_SAVED.contains(&r) {
                    used.insert(r);
                }
            }
        }
    }
    used.into_iter().collect()
}

fn spill_mem(slot: usize) -> Operand {
    Operand::Mem(MemRef::base(Reg::Rbp.vreg(), -8 * (slot as i64 + 1)))
}

fn rewrite_spills(
    insns: Vec<Insn>,
    slot_of: &Map<Vreg, usize>,
    next_vreg: &mut u32,
    no_spill: &mut Set<Vreg>,
) -> Vec<Insn> {
    let mut out = Vec::with_capacity(insns.len() * 2);
    for mut insn in insns {
        let uses = insn.uses();
        let defs = insn.defs();
        let mentioned: Vec<Vreg> = insn
            .virtuals()
            .into_iter()
            .filter(|v| slot_of.contains_key(v))
            .collect();
        if mentioned.is_empty() {
            out.push(insn);
            continue;
        }
        let mut fresh: Map<Vreg, Vreg> = Map::new();
        for &v in &mentioned {
            let t = Vreg(*next_vreg);
            *next_vreg += 1;
            no_spill.insert(t);
            fresh.insert(v, t);
        }
        insn.map_regs(|v| fresh.get(&v).copied().unwrap_or(v));
        for &v in &mentioned {
            if uses.contains(&v) {
                out.push(Insn::Mov {
                    dst: Operand::Reg(fresh[&v]),
                    src: spill_mem(slot_of[&v]),
                });
            }
        }
        let stores: Vec<Insn> = mentioned
            .iter()
            .filter(|&&v| defs.contains(&v))
            .map(|v| Insn::Mov {
                dst: spill_mem(slot_of[v]),
                src: Operand::Reg(fresh[v]),
            })
            .collect();
        out.push(insn);
        out.extend(stores);
    }
    out
}

/// One build-and-color attempt.
struct Coloring<'a> {
    k: usize,
    adj: Map<Vreg, Set<Vreg>>,
    adj_set: Set<(Vreg, Vreg)>,
    degree: Map<Vreg, usize>,
    /// All moves as (dst, src).
    moves: Vec<(Vreg, Vreg)>,
    move_list: Map<Vreg, Set<usize>>,
    wl_moves: Set<usize>,
    active_moves: Set<usize>,
    alias: Map<Vreg, Vreg>,
    coalesced: Set<Vreg>,
    simplify_wl: Set<Vreg>,
    freeze_wl: Set<Vreg>,
    spill_wl: Set<Vreg>,
    select_stack: Vec<Vreg>,
    on_stack: Set<Vreg>,
    spilled: Vec<Vreg>,
    colors: Map<Vreg, Reg>,
    /// Loop-weighted occurrence counts for the spill heuristic.
    weight: Map<Vreg, u64>,
    /// Spill shuttles from earlier rounds; avoid re-spilling them.
    no_spill: &'a Set<Vreg>,
    initial: Set<Vreg>,
}

impl<'a> Coloring<'a> {
    fn new(no_spill: &'a Set<Vreg>) -> Self {
        Coloring {
            k: ALLOCATABLE.len(),
            adj: Map::new(),
            adj_set: Set::new(),
            degree: Map::new(),
            moves: Vec::new(),
            move_list: Map::new(),
            wl_moves: Set::new(),
            active_moves: Set::new(),
            alias: Map::new(),
            coalesced: Set::new(),
            simplify_wl: Set::new(),
            freeze_wl: Set::new(),
            spill_wl: Set::new(),
            select_stack: Vec::new(),
            on_stack: Set::new(),
            spilled: Vec::new(),
            colors: Map::new(),
            weight: Map::new(),
            no_spill,
            initial: Set::new(),
        }
    }

    fn build(&mut self, cfg: &Cfg) {
        for block in &cfg.blocks {
            let factor = 10u64.saturating_pow(block.loop_depth.min(6));
            let per = live_out_per_insn(block);
            for (insn, live_out) in block.insns.iter().zip(per) {
                for v in insn.virtuals() {
                    self.initial.insert(v);
                    *self.weight.entry(v).or_insert(0) += factor;
                }
                let defs = insn.defs();
                let mut targets = live_out;
                if let Some((d, s)) = insn.as_move() {
                    // The move's source does not conflict with its target.
                    targets.remove(&s);
                    let idx = self.moves.len();
                    self.moves.push((d, s));
                    self.wl_moves.insert(idx);
                    self.move_list.entry(d).or_default().insert(idx);
                    self.move_list.entry(s).or_default().insert(idx);
                }
                for &d in &defs {
                    for &l in &targets {
                        self.add_edge(d, l);
                    }
                }
            }
        }
        for &v in &self.initial {
            self.degree.entry(v).or_insert(0);
        }
    }

    fn add_edge(&mut self, u: Vreg, v: Vreg) {
        if u == v || (u.is_phys() && v.is_phys()) {
            return;
        }
        let key = (u.min(v), u.max(v));
        if !self.adj_set.insert(key) {
            return;
        }
        if !u.is_phys() {
            self.adj.entry(u).or_default().insert(v);
            *self.degree.entry(u).or_insert(0) += 1;
        }
        if !v.is_phys() {
            self.adj.entry(v).or_default().insert(u);
            *self.degree.entry(v).or_insert(0) += 1;
        }
    }

    fn make_worklists(&mut self) {
        for &v in &self.initial.clone() {
            let d = self.degree.get(&v).copied().unwrap_or(0);
            if d >= self.k {
                self.spill_wl.insert(v);
            } else if self.move_related(v) {
                self.freeze_wl.insert(v);
            } else {
                self.simplify_wl.insert(v);
            }
        }
    }

    fn run(&mut self) {
        loop {
            if let Some(n) = self.simplify_wl.first().copied() {
                self.simplify(n);
            } else if let Some(m) = self.wl_moves.first().copied() {
                self.coalesce(m);
            } else if let Some(n) = self.freeze_wl.first().copied() {
                self.freeze(n);
            } else if !self.spill_wl.is_empty() {
                self.select_spill();
            } else {
                break;
            }
        }
    }

    fn adjacent(&self, n: Vreg) -> Vec<Vreg> {
        self.adj
            .get(&n)
            .map(|s| {
                s.iter()
                    .copied()
                    .filter(|v| !self.on_stack.contains(v) && !self.coalesced.contains(v))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn node_moves(&self, n: Vreg) -> Vec<usize> {
        self.move_list
            .get(&n)
            .map(|ms| {
                ms.iter()
                    .copied()
                    .filter(|m| self.active_moves.contains(m) || self.wl_moves.contains(m))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn move_related(&self, n: Vreg) -> bool {
        !self.node_moves(n).is_empty()
    }

    fn simplify(&mut self, n: Vreg) {
        self.simplify_wl.remove(&n);
        self.select_stack.push(n);
        self.on_stack.insert(n);
        for m in self.adjacent(n) {
            self.decrement_degree(m);
        }
    }

    fn decrement_degree(&mut self, m: Vreg) {
        if m.is_phys() {
            return;
        }
        let d = self.degree.entry(m).or_insert(0);
        let was = *d;
        *d = d.saturating_sub(1);
        if was == self.k {
            let mut nodes = self.adjacent(m);
            nodes.push(m);
            self.enable_moves(&nodes);
            self.spill_wl.remove(&m);
            if self.move_related(m) {
                self.freeze_wl.insert(m);
            } else {
                self.simplify_wl.insert(m);
            }
        }
    }

    fn enable_moves(&mut self, nodes: &[Vreg]) {
        for &n in nodes {
            for m in self.node_moves(n) {
                if self.active_moves.remove(&m) {
                    self.wl_moves.insert(m);
                }
            }
        }
    }

    fn resolve(&self, mut n: Vreg) -> Vreg {
        while self.coalesced.contains(&n) {
            n = self.alias[&n];
        }
        n
    }

    fn add_worklist(&mut self, u: Vreg) {
        if !u.is_phys()
            && !self.move_related(u)
            && self.degree.get(&u).copied().unwrap_or(0) < self.k
        {
            self.freeze_wl.remove(&u);
            self.simplify_wl.insert(u);
        }
    }

    /// George: every neighbor of `v` already interferes with `u`, is
    /// precolored, or is trivially colorable.
    fn george_ok(&self, u: Vreg, v: Vreg) -> bool {
        self.adjacent(v).into_iter().all(|t| {
            t.is_phys()
                || self.degree.get(&t).copied().unwrap_or(0) < self.k
                || self.adj_set.contains(&(t.min(u), t.max(u)))
        })
    }

    /// Briggs: the merged node has fewer than k significant neighbors.
    fn briggs_ok(&self, u: Vreg, v: Vreg) -> bool {
        let mut nodes: Set<Vreg> = self.adjacent(u).into_iter().collect();
        nodes.extend(self.adjacent(v));
        let significant = nodes
            .into_iter()
            .filter(|n| {
                n.is_phys() || self.degree.get(n).copied().unwrap_or(0) >= self.k
            })
            .count();
        significant < self.k
    }

    fn coalesce(&mut self, m: usize) {
        self.wl_moves.remove(&m);
        let (d, s) = self.moves[m];
        let x = self.resolve(d);
        let y = self.resolve(s);
        let (u, v) = if y.is_phys() { (y, x) } else { (x, y) };
        if u == v {
            self.add_worklist(u);
        } else if v.is_phys() || self.adj_set.contains(&(u.min(v), u.max(v))) {
            self.add_worklist(u);
            self.add_worklist(v);
        } else if (u.is_phys() && self.george_ok(u, v))
            || (!u.is_phys() && self.briggs_ok(u, v))
        {
            self.combine(u, v);
            self.add_worklist(u);
        } else {
            self.active_moves.insert(m);
        }
    }

    fn combine(&mut self, u: Vreg, v: Vreg) {
        self.freeze_wl.remove(&v);
        self.spill_wl.remove(&v);
        self.coalesced.insert(v);
        self.alias.insert(v, u);
        let vm = self.move_list.get(&v).cloned().unwrap_or_default();
        self.move_list.entry(u).or_default().extend(vm);
        self.enable_moves(&[v]);
        for t in self.adjacent(v) {
            self.add_edge(t, u);
            self.decrement_degree(t);
        }
        if self.degree.get(&u).copied().unwrap_or(0) >= self.k && self.freeze_wl.remove(&u) {
            self.spill_wl.insert(u);
        }
    }

    fn freeze(&mut self, u: Vreg) {
        self.freeze_wl.remove(&u);
        self.simplify_wl.insert(u);
        self.freeze_moves(u);
    }

    fn freeze_moves(&mut self, u: Vreg) {
        for m in self.node_moves(u) {
            let (d, s) = self.moves[m];
            self.active_moves.remove(&m);
            self.wl_moves.remove(&m);
            let x = self.resolve(d);
            let y = self.resolve(s);
            let v = if y == self.resolve(u) { x } else { y };
            if !v.is_phys()
                && !self.move_related(v)
                && self.degree.get(&v).copied().unwrap_or(0) < self.k
            {
                self.freeze_wl.remove(&v);
                self.simplify_wl.insert(v);
            }
        }
    }

    /// Cheapest-to-spill by weighted occurrences over current degree; spill
    /// shuttles from earlier rounds are taken only as a last resort.
    fn select_spill(&mut self) {
        let pick = |allow_shuttle: bool| {
            self.spill_wl
                .iter()
                .copied()
                .filter(|v| allow_shuttle || !self.no_spill.contains(v))
                .min_by(|&a, &b| {
                    let cost = |v: Vreg| {
                        let w = self.weight.get(&v).copied().unwrap_or(1) as f64;
                        let d = self.degree.get(&v).copied().unwrap_or(1).max(1) as f64;
                        w / d
                    };
                    cost(a).partial_cmp(&cost(b)).unwrap_or(std::cmp::Ordering::Equal)
                })
        };
        let m = pick(false).or_else(|| pick(true)).expect("spill worklist empty");
        self.spill_wl.remove(&m);
        self.simplify_wl.insert(m);
        self.freeze_moves(m);
    }

    fn assign_colors(&mut self) {
        while let Some(n) = self.select_stack.pop() {
            self.on_stack.remove(&n);
            let mut forbidden: Set<Reg> = Set::new();
            if let Some(neighbors) = self.adj.get(&n) {
                for &w in neighbors {
                    let w = self.resolve(w);
                    if let Some(r) = w.phys() {
                        forbidden.insert(r);
                    } else if let Some(&r) = self.colors.get(&w) {
                        forbidden.insert(r);
                    }
                }
            }
            match ALLOCATABLE.iter().find(|&&r| !forbidden.contains(&r)) {
                Some(&r) => {
                    self.colors.insert(n, r);
                }
                None => self.spilled.push(n),
            }
        }
        for &v in &self.coalesced.clone() {
            let root = self.resolve(v);
            if let Some(r) = root.phys().or_else(|| self.colors.get(&root).copied()) {
                self.colors.insert(v, r);
            }
        }
    }
}

// ---- naive fallback ----

/// Scratch registers for the all-on-stack mode.  r10/r11 are caller-saved
/// and never argument registers; rbx covers the rare three-register
/// instruction and is saved by the prologue when touched.
static SCRATCH: [Reg; 3] = [Reg::R10, Reg::R11, Reg::Rbx];

fn naive(f: AsmFunction) -> Result<Allocation> {
    let mut slot_of: Map<Vreg, usize> = Map::new();
    let mut out = Vec::with_capacity(f.insns.len() * 3);
    for mut insn in f.insns {
        let uses = insn.uses();
        let defs = insn.defs();
        let vs = insn.virtuals();
        if vs.len() > SCRATCH.len() {
            return Err(CompileError::internal(
                "instruction mentions more virtual registers than scratch registers",
            ));
        }
        let mut map: Map<Vreg, Reg> = Map::new();
        for (i, &v) in vs.iter().enumerate() {
            map.insert(v, SCRATCH[i]);
        }
        for &v in &vs {
            let next = slot_of.len();
            let slot = *slot_of.entry(v).or_insert(next);
            if uses.contains(&v) {
                out.push(Insn::Mov {
                    dst: Operand::Reg(map[&v].vreg()),
                    src: spill_mem(slot),
                });
            }
        }
        insn.map_regs(|v| map.get(&v).map(|r| r.vreg()).unwrap_or(v));
        let stores: Vec<Insn> = vs
            .iter()
            .filter(|&&v| defs.contains(&v))
            .map(|v| {
                let next = slot_of.len();
                let slot = *slot_of.entry(*v).or_insert(next);
                Insn::Mov {
                    dst: spill_mem(slot),
                    src: Operand::Reg(map[v].vreg()),
                }
            })
            .collect();
        out.push(insn);
        out.extend(stores);
    }
    let spill_slots = slot_of.len();
    let used = used_callee_saved(&out);
    Ok(Allocation {
        label: f.label,
        insns: out,
        spill_slots,
        used_callee_saved: used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ir::Label;

    fn assert_all_physical(insns: &[Insn]) {
        for insn in insns {
            assert!(
                insn.virtuals().is_empty(),
                "virtual register survived allocation in `{insn}`"
            );
        }
    }

    fn function(insns: Vec<Insn>, next_vreg: u32, locals: usize) -> AsmFunction {
        AsmFunction {
            label: "_f_t".into(),
            insns,
            next_vreg,
            locals,
        }
    }

    fn v(n: u32) -> Vreg {
        Vreg(NUM_REGS + n)
    }

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn colors_a_straight_line_function() {
        let insns = vec![
            Insn::Label(Label(0)),
            Insn::Mov {
                dst: Operand::Reg(v(0)),
                src: Operand::Imm(1),
            },
            Insn::Mov {
                dst: Operand::Reg(v(1)),
                src: Operand::Reg(v(0)),
            },
            Insn::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(v(1)),
                src: Operand::Reg(v(0)),
            },
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: Operand::Reg(v(1)),
            },
            Insn::Ret { value: true },
        ];
        let mut next_label = 100;
        let a = allocate(function(insns, 16 + 2, 0), &config(), &mut next_label).unwrap();
        assert_all_physical(&a.insns);
        assert_eq!(a.spill_slots, 0);
    }

    #[test]
    fn values_live_across_calls_get_callee_saved_colors() {
        let insns = vec![
            Insn::Label(Label(0)),
            Insn::Mov {
                dst: Operand::Reg(v(0)),
                src: Operand::Imm(7),
            },
            Insn::Call {
                target: "getInt".into(),
                reg_args: 0,
            },
            Insn::Mov {
                dst: Operand::Reg(v(1)),
                src: Operand::reg(Reg::Rax),
            },
            Insn::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(v(1)),
                src: Operand::Reg(v(0)),
            },
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: Operand::Reg(v(1)),
            },
            Insn::Ret { value: true },
        ];
        let mut next_label = 100;
        let a = allocate(function(insns, 16 + 2, 0), &config(), &mut next_label).unwrap();
        assert_all_physical(&a.insns);
        // v0 lives across the call, so its register must be callee-saved.
        let mut v0_color = None;
        for insn in &a.insns {
            if let Insn::Alu {
                src: Operand::Reg(r),
                ..
            } = insn
            {
                v0_color = r.phys();
            }
        }
        let r = v0_color.expect("the add survived");
        assert!(CALLEE_SAVED.contains(&r), "{r} is not callee-saved");
        assert!(a.used_callee_saved.contains(&r));
    }

    #[test]
    fn high_pressure_forces_spills_that_still_allocate() {
        // 20 simultaneously live values exceed the 12 colors.
        let n = 20u32;
        let mut insns = vec![Insn::Label(Label(0))];
        for i in 0..n {
            insns.push(Insn::Mov {
                dst: Operand::Reg(v(i)),
                src: Operand::Imm(i as i64),
            });
        }
        // Sum them all so every one is live until its use.
        insns.push(Insn::Mov {
            dst: Operand::Reg(v(n)),
            src: Operand::Imm(0),
        });
        for i in 0..n {
            insns.push(Insn::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(v(n)),
                src: Operand::Reg(v(i)),
            });
        }
        // Keep all sources live to the end by using them in reverse too.
        for i in (0..n).rev() {
            insns.push(Insn::Alu {
                op: AluOp::Xor,
                dst: Operand::Reg(v(n)),
                src: Operand::Reg(v(i)),
            });
        }
        insns.push(Insn::Mov {
            dst: Operand::reg(Reg::Rax),
            src: Operand::Reg(v(n)),
        });
        insns.push(Insn::Ret { value: true });
        let mut next_label = 100;
        let a = allocate(function(insns, 16 + n + 1, 0), &config(), &mut next_label).unwrap();
        assert_all_physical(&a.insns);
        assert!(a.spill_slots > 0, "expected at least one spill");
    }

    #[test]
    fn interference_covers_every_simultaneously_live_pair() {
        // v0 stays live across the call while v1 and v2 come and go.
        let insns = vec![
            Insn::Label(Label(0)),
            Insn::Mov {
                dst: Operand::Reg(v(0)),
                src: Operand::Imm(1),
            },
            Insn::Mov {
                dst: Operand::Reg(v(1)),
                src: Operand::Reg(v(0)),
            },
            Insn::Call {
                target: "getInt".into(),
                reg_args: 0,
            },
            Insn::Mov {
                dst: Operand::Reg(v(2)),
                src: Operand::reg(Reg::Rax),
            },
            Insn::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(v(2)),
                src: Operand::Reg(v(0)),
            },
            Insn::Alu {
                op: AluOp::Add,
                dst: Operand::Reg(v(2)),
                src: Operand::Reg(v(1)),
            },
            Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: Operand::Reg(v(2)),
            },
            Insn::Ret { value: true },
        ];
        let mut next_label = 100;
        let mut cfg = Cfg::build(insns, &mut next_label).unwrap();
        dataflow::liveness(&mut cfg);
        let empty = Set::new();
        let mut c = Coloring::new(&empty);
        c.build(&cfg);
        c.make_worklists();
        c.run();
        // Every pair simultaneously live at some instruction either carries
        // an interference edge or has been coalesced into one node.
        for block in &cfg.blocks {
            for live in live_out_per_insn(block) {
                let virts: Vec<Vreg> =
                    live.iter().copied().filter(|x| !x.is_phys()).collect();
                for (i, &a) in virts.iter().enumerate() {
                    for &b in &virts[i + 1..] {
                        let (ra, rb) = (c.resolve(a), c.resolve(b));
                        assert!(
                            ra == rb || c.adj_set.contains(&(ra.min(rb), ra.max(rb))),
                            "{a} and {b} are live together with no edge"
                        );
                    }
                }
            }
        }
        // And v0, live across the call, interferes with the caller-saved set.
        for r in CALLER_SAVED {
            let key = (v(0).min(r.vreg()), v(0).max(r.vreg()));
            assert!(c.adj_set.contains(&key), "missing edge to {r}");
        }
    }

    #[test]
    fn naive_mode_puts_everything_on_the_stack() {
        let insns = vec![
            Insn::Label(Label(0)),
            Insn::Mov {
                dst: Operand::Reg(v(0)),
                src: Operand::Imm(3),
            },
            Insn::Mov {
                dst: Operand::Mem(MemRef {
                    base: Some(v(1)),
                    index: Some(v(2)),
                    scale: 8,
                    disp: 8,
                    sym: None,
                }),
                src: Operand::Reg(v(0)),
            },
            Insn::Ret { value: false },
        ];
        let mut cfg_label = 100;
        let mut config = config();
        config.naive_threshold = 0;
        let a = allocate(function(insns, 16 + 3, 1), &config, &mut cfg_label).unwrap();
        assert_all_physical(&a.insns);
        assert_eq!(a.spill_slots, 3);
        // The three-virtual store used all three scratch registers.
        assert!(a.used_callee_saved.contains(&Reg::Rbx));
    }
}
