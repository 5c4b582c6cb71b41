//! The x86-64 machine model.
//!
//! Abstract instructions over *virtual registers*: operands name either a
//! physical register, a virtual one, an immediate, or a memory reference
//! `base + index*scale + disp`.  Physical registers are the low-numbered
//! virtual registers, so liveness and interference treat both uniformly and
//! the allocator sees them as precolored nodes.
//!
//! # Calling convention (System V AMD64)
//!
//! - Integer arguments 1..=6 in rdi, rsi, rdx, rcx, r8, r9; the rest on the
//!   stack, pushed right to left; the caller cleans up.
//! - Return value in rax.
//! - rax, rcx, rdx, rsi, rdi, r8-r11 are caller-saved; rbx, rbp, r12-r15 are
//!   callee-saved.
//! - rsp is 16-byte aligned at every `call` instruction.
//!
//! # Register roles here
//!
//! - rsp/rbp: stack and frame pointer, never allocated.
//! - rax/rdx: the idiv pair, reserved as instruction-level scratch and kept
//!   out of the allocatable set.
//! - everything else is allocatable.

use derive_more::Display;

use crate::common::*;
use crate::middle::ir::Label;

/// Physical registers, in encoding order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Display)]
pub enum Reg {
    #[display("rax")]
    Rax,
    #[display("rcx")]
    Rcx,
    #[display("rdx")]
    Rdx,
    #[display("rbx")]
    Rbx,
    #[display("rsp")]
    Rsp,
    #[display("rbp")]
    Rbp,
    #[display("rsi")]
    Rsi,
    #[display("rdi")]
    Rdi,
    #[display("r8")]
    R8,
    #[display("r9")]
    R9,
    #[display("r10")]
    R10,
    #[display("r11")]
    R11,
    #[display("r12")]
    R12,
    #[display("r13")]
    R13,
    #[display("r14")]
    R14,
    #[display("r15")]
    R15,
}

pub const NUM_REGS: u32 = 16;

/// Argument registers in call order.
pub static ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

/// Clobbered by every call.
pub static CALLER_SAVED: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Preserved across calls; the prologue saves the ones the allocator hands
/// out.
pub static CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

/// The colors the allocator may assign.  rsp/rbp frame the stack; rax/rdx
/// stay free for idiv and spill shuttling.
pub static ALLOCATABLE: [Reg; 12] = [
    Reg::Rbx,
    Reg::Rcx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

impl Reg {
    pub fn from_index(i: u32) -> Reg {
        use Reg::*;
        [
            Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15,
        ][i as usize]
    }

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn vreg(self) -> Vreg {
        Vreg(self as u32)
    }

    /// The low-byte register name, for `set<cc>`.
    pub fn byte_name(self) -> &'static str {
        use Reg::*;
        match self {
            Rax => "al",
            Rcx => "cl",
            Rdx => "dl",
            Rbx => "bl",
            Rsp => "spl",
            Rbp => "bpl",
            Rsi => "sil",
            Rdi => "dil",
            R8 => "r8b",
            R9 => "r9b",
            R10 => "r10b",
            R11 => "r11b",
            R12 => "r12b",
            R13 => "r13b",
            R14 => "r14b",
            R15 => "r15b",
        }
    }
}

/// A virtual register.  Ids below [NUM_REGS] are the physical registers
/// themselves (precolored); the rest are unbounded.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Vreg(pub u32);

impl Vreg {
    pub fn phys(self) -> Option<Reg> {
        (self.0 < NUM_REGS).then(|| Reg::from_index(self.0))
    }

    pub fn is_phys(self) -> bool {
        self.0 < NUM_REGS
    }
}

impl std::fmt::Display for Vreg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phys() {
            Some(r) => write!(f, "{r}"),
            None => write!(f, "v{}", self.0),
        }
    }
}

/// `[base + index*scale + disp]`, optionally rooted at a data-section label.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct MemRef {
    pub base: Option<Vreg>,
    pub index: Option<Vreg>,
    pub scale: u8,
    pub disp: i64,
    /// Symbolic root: a global variable or string literal label.
    pub sym: Option<String>,
}

impl MemRef {
    pub fn base(base: Vreg, disp: i64) -> MemRef {
        MemRef {
            base: Some(base),
            disp,
            scale: 1,
            ..MemRef::default()
        }
    }

    pub fn sym(label: impl Into<String>) -> MemRef {
        MemRef {
            sym: Some(label.into()),
            scale: 1,
            ..MemRef::default()
        }
    }

    pub fn regs(&self) -> impl Iterator<Item = Vreg> + '_ {
        self.base.iter().chain(self.index.iter()).copied()
    }

    fn map_regs(&mut self, f: &mut impl FnMut(Vreg) -> Vreg) {
        if let Some(b) = self.base {
            self.base = Some(f(b));
        }
        if let Some(i) = self.index {
            self.index = Some(f(i));
        }
    }
}

impl std::fmt::Display for MemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        if let Some(sym) = &self.sym {
            write!(f, "rel {sym}")?;
            first = false;
        }
        if let Some(b) = self.base {
            if !first {
                write!(f, " + ")?;
            }
            write!(f, "{b}")?;
            first = false;
        }
        if let Some(i) = self.index {
            if !first {
                write!(f, " + ")?;
            }
            write!(f, "{i}*{}", self.scale)?;
            first = false;
        }
        if self.disp != 0 || first {
            if first {
                write!(f, "{}", self.disp)?;
            } else if self.disp < 0 {
                write!(f, " - {}", -self.disp)?;
            } else {
                write!(f, " + {}", self.disp)?;
            }
        }
        write!(f, "]")
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Operand {
    #[display("{_0}")]
    Imm(i64),
    #[display("{_0}")]
    Reg(Vreg),
    #[display("qword {_0}")]
    Mem(MemRef),
}

impl Operand {
    pub fn reg(r: Reg) -> Operand {
        Operand::Reg(r.vreg())
    }

    pub fn regs(&self) -> Vec<Vreg> {
        match self {
            Operand::Imm(_) => vec![],
            Operand::Reg(v) => vec![*v],
            Operand::Mem(m) => m.regs().collect(),
        }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    fn map_regs(&mut self, f: &mut impl FnMut(Vreg) -> Vreg) {
        match self {
            Operand::Imm(_) => {}
            Operand::Reg(v) => *v = f(*v),
            Operand::Mem(m) => m.map_regs(f),
        }
    }
}

/// Two-operand ALU operations (`op dst, src`; dst is read and written).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum AluOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("and")]
    And,
    #[display("or")]
    Or,
    #[display("xor")]
    Xor,
    #[display("shl")]
    Shl,
    #[display("shr")]
    Shr,
    #[display("sar")]
    Sar,
    #[display("imul")]
    IMul,
}

/// Condition codes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Cond {
    #[display("e")]
    E,
    #[display("ne")]
    Ne,
    #[display("l")]
    L,
    #[display("le")]
    Le,
    #[display("g")]
    G,
    #[display("ge")]
    Ge,
}

impl Cond {
    pub fn negate(self) -> Cond {
        use Cond::*;
        match self {
            E => Ne,
            Ne => E,
            L => Ge,
            Le => G,
            G => Le,
            Ge => L,
        }
    }
}

/// Abstract instructions.  After register allocation every operand is an
/// immediate, a physical register, or a memory reference over physical
/// registers.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Insn {
    Label(Label),
    Mov {
        dst: Operand,
        src: Operand,
    },
    Alu {
        op: AluOp,
        dst: Operand,
        src: Operand,
    },
    Neg(Operand),
    Not(Operand),
    /// Sign-extend rax into rdx:rax.
    Cqo,
    /// Signed divide rdx:rax by the operand; quotient to rax, remainder to
    /// rdx.
    Idiv(Operand),
    Cmp {
        lhs: Operand,
        rhs: Operand,
    },
    Test {
        lhs: Operand,
        rhs: Operand,
    },
    Set {
        cc: Cond,
        dst: Vreg,
    },
    Jmp(Label),
    Jcc {
        cc: Cond,
        target: Label,
    },
    Call {
        target: String,
        /// How many arguments travel in registers (at most six); determines
        /// the use set.
        reg_args: usize,
    },
    Push(Operand),
    Pop(Operand),
    Lea {
        dst: Vreg,
        addr: MemRef,
    },
    /// Return; `value` records whether rax carries a result.
    Ret {
        value: bool,
    },
}

impl Insn {
    /// Is this a basic-block terminator?
    pub fn is_terminator(&self) -> bool {
        matches!(self, Insn::Jmp(_) | Insn::Jcc { .. } | Insn::Ret { .. })
    }

    /// Registers written by this instruction.
    pub fn defs(&self) -> Vec<Vreg> {
        use Insn::*;
        match self {
            Mov { dst, .. } | Alu { dst, .. } | Neg(dst) | Not(dst) => match dst {
                Operand::Reg(v) => vec![*v],
                _ => vec![],
            },
            Cqo => vec![Reg::Rdx.vreg()],
            Idiv(_) => vec![Reg::Rax.vreg(), Reg::Rdx.vreg()],
            Set { dst, .. } | Lea { dst, .. } => vec![*dst],
            Call { .. } => CALLER_SAVED.iter().map(|r| r.vreg()).collect(),
            Pop(dst) => match dst {
                Operand::Reg(v) => vec![*v],
                _ => vec![],
            },
            _ => vec![],
        }
    }

    /// Registers read by this instruction.
    pub fn uses(&self) -> Vec<Vreg> {
        use Insn::*;
        match self {
            Mov { dst, src } => {
                let mut u = src.regs();
                // A store reads the address registers.
                if let Operand::Mem(m) = dst {
                    u.extend(m.regs());
                }
                u
            }
            Alu { dst, src, .. } => {
                let mut u = dst.regs();
                u.extend(src.regs());
                u
            }
            Neg(dst) | Not(dst) => dst.regs(),
            Cqo => vec![Reg::Rax.vreg()],
            Idiv(src) => {
                let mut u = vec![Reg::Rax.vreg(), Reg::Rdx.vreg()];
                u.extend(src.regs());
                u
            }
            Cmp { lhs, rhs } | Test { lhs, rhs } => {
                let mut u = lhs.regs();
                u.extend(rhs.regs());
                u
            }
            Call { reg_args, .. } => ARG_REGS[..(*reg_args).min(6)]
                .iter()
                .map(|r| r.vreg())
                .collect(),
            Push(src) => src.regs(),
            Pop(dst) => match dst {
                Operand::Mem(m) => m.regs().collect(),
                _ => vec![],
            },
            Lea { addr, .. } => addr.regs().collect(),
            Ret { value } => {
                if *value {
                    vec![Reg::Rax.vreg()]
                } else {
                    vec![]
                }
            }
            Label(_) | Jmp(_) | Jcc { .. } | Set { .. } => vec![],
        }
    }

    /// A register-to-register move, the coalescing candidate shape.
    pub fn as_move(&self) -> Option<(Vreg, Vreg)> {
        match self {
            Insn::Mov {
                dst: Operand::Reg(d),
                src: Operand::Reg(s),
            } => Some((*d, *s)),
            _ => None,
        }
    }

    /// Rewrite every register operand.
    pub fn map_regs(&mut self, mut f: impl FnMut(Vreg) -> Vreg) {
        use Insn::*;
        match self {
            Mov { dst, src } | Alu { dst, src, .. } => {
                dst.map_regs(&mut f);
                src.map_regs(&mut f);
            }
            Neg(dst) | Not(dst) | Idiv(dst) | Push(dst) | Pop(dst) => dst.map_regs(&mut f),
            Cmp { lhs, rhs } | Test { lhs, rhs } => {
                lhs.map_regs(&mut f);
                rhs.map_regs(&mut f);
            }
            Set { dst, .. } => *dst = f(*dst),
            Lea { dst, addr } => {
                *dst = f(*dst);
                addr.map_regs(&mut f);
            }
            Label(_) | Cqo | Jmp(_) | Jcc { .. } | Call { .. } | Ret { .. } => {}
        }
    }

    /// Every virtual (non-physical) register this instruction mentions.
    pub fn virtuals(&self) -> Vec<Vreg> {
        let mut vs: Vec<Vreg> = self
            .defs()
            .into_iter()
            .chain(self.uses())
            .filter(|v| !v.is_phys())
            .collect();
        vs.sort();
        vs.dedup();
        vs
    }
}

impl std::fmt::Display for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Insn::*;
        match self {
            Label(l) => write!(f, "{l}:"),
            Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            Alu { op, dst, src } => write!(f, "{op} {dst}, {src}"),
            Neg(dst) => write!(f, "neg {dst}"),
            Not(dst) => write!(f, "not {dst}"),
            Cqo => write!(f, "cqo"),
            Idiv(src) => write!(f, "idiv {src}"),
            Cmp { lhs, rhs } => write!(f, "cmp {lhs}, {rhs}"),
            Test { lhs, rhs } => write!(f, "test {lhs}, {rhs}"),
            Set { cc, dst } => write!(f, "set{cc} {dst}"),
            Jmp(l) => write!(f, "jmp {l}"),
            Jcc { cc, target } => write!(f, "j{cc} {target}"),
            Call { target, .. } => write!(f, "call {target}"),
            Push(src) => write!(f, "push {src}"),
            Pop(dst) => write!(f, "pop {dst}"),
            Lea { dst, addr } => write!(f, "lea {dst}, {addr}"),
            Ret { .. } => write!(f, "ret"),
        }
    }
}

/// A function's instruction stream between selection and allocation.
#[derive(Debug)]
pub struct AsmFunction {
    pub label: String,
    pub insns: Vec<Insn>,
    /// First unused virtual register id.
    pub next_vreg: u32,
    /// Declared local count, carried from the IR for the allocator fallback
    /// decision.
    pub locals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_vregs_round_trip() {
        for i in 0..NUM_REGS {
            let r = Reg::from_index(i);
            assert_eq!(r.index(), i);
            assert_eq!(r.vreg().phys(), Some(r));
        }
        assert_eq!(Vreg(NUM_REGS).phys(), None);
    }

    #[test]
    fn division_models_its_fixed_registers() {
        let idiv = Insn::Idiv(Operand::Reg(Vreg(20)));
        assert!(idiv.defs().contains(&Reg::Rax.vreg()));
        assert!(idiv.defs().contains(&Reg::Rdx.vreg()));
        assert!(idiv.uses().contains(&Reg::Rax.vreg()));
        assert!(idiv.uses().contains(&Vreg(20)));
    }

    #[test]
    fn store_uses_address_registers_but_defines_nothing() {
        let store = Insn::Mov {
            dst: Operand::Mem(MemRef::base(Vreg(17), 8)),
            src: Operand::Reg(Vreg(18)),
        };
        assert!(store.defs().is_empty());
        assert_eq!(store.uses(), vec![Vreg(18), Vreg(17)]);
    }

    #[test]
    fn call_clobbers_caller_saved() {
        let call = Insn::Call {
            target: "f".into(),
            reg_args: 2,
        };
        assert_eq!(call.uses(), vec![Reg::Rdi.vreg(), Reg::Rsi.vreg()]);
        assert!(call.defs().contains(&Reg::R11.vreg()));
    }

    #[test]
    fn memory_reference_renders_nasm_syntax() {
        let m = MemRef {
            base: Some(Reg::Rbp.vreg()),
            index: Some(Vreg(17)),
            scale: 8,
            disp: -16,
            sym: None,
        };
        assert_eq!(m.to_string(), "[rbp + v17*8 - 16]");
        assert_eq!(MemRef::sym("_g_x").to_string(), "[rel _g_x]");
    }
}
