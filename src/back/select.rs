//! Instruction selection: three-address IR to abstract x86-64 instructions
//! over virtual registers.
//!
//! Selection is maximal-munch over the IR expression trees.  The address
//! matcher folds `base + index*8 + disp` shapes into single memory
//! references; multiplication and division by suitable constants strength-
//! reduce to shifts, LEA, and the signed power-of-two correction sequence;
//! everything else goes through the two-address `mov dst, a; op dst, b`
//! shape so the coalescer can clean the copies up.

use crate::common::*;
use crate::front::sema::{Env, Storage, VarId};
use crate::middle::ir::{self, BinOp, Callee, Label, UnOp};

use super::asm::*;

pub fn select(
    program: &ir::Program,
    env: &Env,
    next_label: &mut u32,
) -> Result<Vec<AsmFunction>> {
    let mut out = Vec::with_capacity(program.funs.len());
    for f in &program.funs {
        let mut sel = Selector {
            env,
            insns: Vec::new(),
            next_vreg: NUM_REGS + f.temps,
            temp_base: NUM_REGS,
            vars: Map::new(),
            next_label: &mut *next_label,
        };
        out.push(sel.function(f)?);
    }
    Ok(out)
}

struct Selector<'a> {
    env: &'a Env,
    insns: Vec<Insn>,
    next_vreg: u32,
    /// Temps map to vregs starting here.
    temp_base: u32,
    /// Locals and parameters.
    vars: Map<VarId, Vreg>,
    next_label: &'a mut u32,
}

impl<'a> Selector<'a> {
    fn emit(&mut self, insn: Insn) {
        self.insns.push(insn);
    }

    fn fresh(&mut self) -> Vreg {
        let v = Vreg(self.next_vreg);
        self.next_vreg += 1;
        v
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label(*self.next_label);
        *self.next_label += 1;
        l
    }

    fn temp(&self, t: ir::Temp) -> Vreg {
        Vreg(self.temp_base + t.0)
    }

    fn var(&mut self, v: VarId) -> Vreg {
        if let Some(&r) = self.vars.get(&v) {
            return r;
        }
        let r = self.fresh();
        self.vars.insert(v, r);
        r
    }

    fn global_label(&self, v: VarId) -> String {
        format!("_g_{}", self.env.var(v).name)
    }

    // ---- function shell ----

    fn function(&mut self, f: &ir::Function) -> Result<AsmFunction> {
        let entry = self.fresh_label();
        self.emit(Insn::Label(entry));

        // Materialize incoming arguments into their vregs.
        for (i, &p) in f.params.iter().enumerate() {
            let dst = self.var(p);
            if i < ARG_REGS.len() {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::reg(ARG_REGS[i]),
                });
            } else {
                let off = 16 + 8 * (i - ARG_REGS.len()) as i64;
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Mem(MemRef::base(Reg::Rbp.vreg(), off)),
                });
            }
        }

        for stmt in &f.body {
            self.stmt(stmt)?;
        }

        Ok(AsmFunction {
            label: f.label.clone(),
            insns: std::mem::take(&mut self.insns),
            next_vreg: self.next_vreg,
            locals: f.locals,
        })
    }

    // ---- statements ----

    fn stmt(&mut self, stmt: &ir::Stmt) -> Result<()> {
        match stmt {
            ir::Stmt::Label(l) => {
                self.emit(Insn::Label(*l));
                Ok(())
            }
            ir::Stmt::Jump(l) => {
                self.emit(Insn::Jmp(*l));
                Ok(())
            }
            ir::Stmt::CJump(cond, lt, lf) => self.cjump(cond, *lt, *lf),
            ir::Stmt::Return(value) => {
                if let Some(e) = value {
                    let v = self.eval(e)?;
                    self.emit(Insn::Mov {
                        dst: Operand::reg(Reg::Rax),
                        src: v,
                    });
                }
                self.emit(Insn::Ret {
                    value: value.is_some(),
                });
                Ok(())
            }
            ir::Stmt::Assign(lhs, rhs) => self.assign(lhs, rhs),
            ir::Stmt::Call { target, args, dst } => self.call(target, args, dst.as_ref()),
            ir::Stmt::ExprStmt(e) => {
                self.eval(e)?;
                Ok(())
            }
        }
    }

    /// Compare-and-branch fusion: a comparison at the top of a condition
    /// becomes `cmp; jcc; jmp`, anything else `test; jnz; jmp`.  The jump to
    /// a fallthrough label is elided later, once block order is final.
    fn cjump(&mut self, cond: &ir::Expr, lt: Label, lf: Label) -> Result<()> {
        if let ir::Expr::Binary(op, a, b) = cond {
            if op.is_comparison() {
                let cc = cond_code(*op);
                let lhs = self.eval_cmp_lhs(a)?;
                let rhs = self.eval(b)?;
                let rhs = self.legal_pair(&lhs, rhs);
                self.emit(Insn::Cmp { lhs, rhs });
                self.emit(Insn::Jcc { cc, target: lt });
                self.emit(Insn::Jmp(lf));
                return Ok(());
            }
        }
        match self.eval(cond)? {
            Operand::Imm(c) => {
                self.emit(Insn::Jmp(if c != 0 { lt } else { lf }));
            }
            v => {
                let v = self.force_reg(v);
                self.emit(Insn::Test {
                    lhs: Operand::Reg(v),
                    rhs: Operand::Reg(v),
                });
                self.emit(Insn::Jcc {
                    cc: Cond::Ne,
                    target: lt,
                });
                self.emit(Insn::Jmp(lf));
            }
        }
        Ok(())
    }

    fn assign(&mut self, lhs: &ir::Expr, rhs: &ir::Expr) -> Result<()> {
        match lhs {
            ir::Expr::Temp(t) => {
                let dst = self.temp(*t);
                self.eval_into(dst, rhs)
            }
            ir::Expr::Var(v) => match self.env.var(*v).storage {
                Storage::Global => {
                    let m = MemRef::sym(self.global_label(*v));
                    let src = self.eval(rhs)?;
                    let src = self.force_store_src(src);
                    self.emit(Insn::Mov {
                        dst: Operand::Mem(m),
                        src,
                    });
                    Ok(())
                }
                _ => {
                    let dst = self.var(*v);
                    self.eval_into(dst, rhs)
                }
            },
            ir::Expr::Mem(addr) => {
                let m = self.addr(addr)?;
                let src = self.eval(rhs)?;
                let src = self.force_store_src(src);
                self.emit(Insn::Mov {
                    dst: Operand::Mem(m),
                    src,
                });
                Ok(())
            }
            _ => Err(CompileError::internal("assignment to a non-place")),
        }
    }

    fn call(
        &mut self,
        target: &Callee,
        args: &[ir::Expr],
        dst: Option<&ir::Expr>,
    ) -> Result<()> {
        // Evaluate every argument into a fresh vreg first; the moves into
        // the fixed argument registers happen together, right before the
        // call, so nested evaluation cannot clobber them.
        let mut vals = Vec::new();
        for a in args {
            let v = self.eval(a)?;
            vals.push(self.force_reg(v));
        }

        let stack_args = args.len().saturating_sub(ARG_REGS.len());
        let pad = stack_args % 2;
        if pad != 0 {
            self.emit(Insn::Alu {
                op: AluOp::Sub,
                dst: Operand::reg(Reg::Rsp),
                src: Operand::Imm(8),
            });
        }
        for &v in vals.iter().skip(ARG_REGS.len()).rev() {
            self.emit(Insn::Push(Operand::Reg(v)));
        }
        for (i, &v) in vals.iter().take(ARG_REGS.len()).enumerate() {
            self.emit(Insn::Mov {
                dst: Operand::reg(ARG_REGS[i]),
                src: Operand::Reg(v),
            });
        }

        let (name, variadic) = match target {
            Callee::Fun(_, label) => (label.clone(), false),
            Callee::Runtime(r) => (r.to_string(), r.is_variadic()),
        };
        if variadic {
            // Zero vector-register count for the varargs ABI.
            self.emit(Insn::Mov {
                dst: Operand::reg(Reg::Rax),
                src: Operand::Imm(0),
            });
        }
        self.emit(Insn::Call {
            target: name,
            reg_args: args.len().min(ARG_REGS.len()),
        });
        if stack_args + pad > 0 {
            self.emit(Insn::Alu {
                op: AluOp::Add,
                dst: Operand::reg(Reg::Rsp),
                src: Operand::Imm(8 * (stack_args + pad) as i64),
            });
        }

        if let Some(dst) = dst {
            let dst = match dst {
                ir::Expr::Temp(t) => self.temp(*t),
                ir::Expr::Var(v) => self.var(*v),
                _ => return Err(CompileError::internal("call result into a non-register")),
            };
            self.emit(Insn::Mov {
                dst: Operand::Reg(dst),
                src: Operand::reg(Reg::Rax),
            });
        }
        Ok(())
    }

    // ---- expressions ----

    /// Evaluate into an operand: an immediate, a vreg, or a folded memory
    /// reference.
    fn eval(&mut self, e: &ir::Expr) -> Result<Operand> {
        match e {
            ir::Expr::Const(c) => Ok(Operand::Imm(*c)),
            ir::Expr::Temp(t) => Ok(Operand::Reg(self.temp(*t))),
            ir::Expr::Var(v) => match self.env.var(*v).storage {
                Storage::Global => Ok(Operand::Mem(MemRef::sym(self.global_label(*v)))),
                _ => Ok(Operand::Reg(self.var(*v))),
            },
            ir::Expr::Str(s) => {
                let dst = self.fresh();
                self.emit(Insn::Lea {
                    dst,
                    addr: MemRef::sym(s.to_string()),
                });
                Ok(Operand::Reg(dst))
            }
            ir::Expr::Mem(addr) => {
                let m = self.addr(addr)?;
                Ok(Operand::Mem(m))
            }
            ir::Expr::Unary(op, inner) => {
                let dst = self.fresh();
                self.eval_into_unary(dst, *op, inner)?;
                Ok(Operand::Reg(dst))
            }
            ir::Expr::Binary(op, a, b) => {
                let dst = self.fresh();
                self.eval_into_binary(dst, *op, a, b)?;
                Ok(Operand::Reg(dst))
            }
        }
    }

    /// Evaluate directly into a destination vreg.
    fn eval_into(&mut self, dst: Vreg, e: &ir::Expr) -> Result<()> {
        match e {
            ir::Expr::Binary(op, a, b) => self.eval_into_binary(dst, *op, a, b),
            ir::Expr::Unary(op, inner) => self.eval_into_unary(dst, *op, inner),
            _ => {
                let src = self.eval(e)?;
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src,
                });
                Ok(())
            }
        }
    }

    fn eval_into_unary(&mut self, dst: Vreg, op: UnOp, inner: &ir::Expr) -> Result<()> {
        let src = self.eval(inner)?;
        if let Operand::Imm(c) = src {
            let folded = match op {
                UnOp::Neg => c.wrapping_neg(),
                UnOp::BNot => !c,
                UnOp::Not => (c == 0) as i64,
            };
            self.emit(Insn::Mov {
                dst: Operand::Reg(dst),
                src: Operand::Imm(folded),
            });
            return Ok(());
        }
        self.emit(Insn::Mov {
            dst: Operand::Reg(dst),
            src,
        });
        match op {
            UnOp::Neg => self.emit(Insn::Neg(Operand::Reg(dst))),
            UnOp::BNot => self.emit(Insn::Not(Operand::Reg(dst))),
            // 0/1 flip.
            UnOp::Not => self.emit(Insn::Alu {
                op: AluOp::Xor,
                dst: Operand::Reg(dst),
                src: Operand::Imm(1),
            }),
        }
        Ok(())
    }

    fn eval_into_binary(
        &mut self,
        dst: Vreg,
        op: BinOp,
        a: &ir::Expr,
        b: &ir::Expr,
    ) -> Result<()> {
        use BinOp::*;
        match op {
            Lt | Le | Gt | Ge | Eq | Ne => {
                let cc = cond_code(op);
                let lhs = self.eval_cmp_lhs(a)?;
                let rhs = self.eval(b)?;
                let rhs = self.legal_pair(&lhs, rhs);
                self.emit(Insn::Cmp { lhs, rhs });
                self.emit(Insn::Set { cc, dst });
                Ok(())
            }
            Mul => self.mul(dst, a, b),
            Div | Rem => self.divide(dst, op, a, b),
            Shl | Shr => self.shift(dst, op, a, b),
            Add | Sub | And | Or | Xor => {
                let alu = match op {
                    Add => AluOp::Add,
                    Sub => AluOp::Sub,
                    And => AluOp::And,
                    Or => AluOp::Or,
                    Xor => AluOp::Xor,
                    _ => unreachable!(),
                };
                let av = self.eval(a)?;
                let bv = self.eval(b)?;
                if let (Operand::Imm(x), Operand::Imm(y)) = (&av, &bv) {
                    if let Some(c) = op.fold(*x, *y) {
                        self.emit(Insn::Mov {
                            dst: Operand::Reg(dst),
                            src: Operand::Imm(c),
                        });
                        return Ok(());
                    }
                }
                let bv = self.shield(dst, bv);
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: av,
                });
                let bv = self.legal_alu_src(bv);
                self.emit(Insn::Alu {
                    op: alu,
                    dst: Operand::Reg(dst),
                    src: bv,
                });
                Ok(())
            }
        }
    }

    /// Multiplication, with strength reduction for constant operands:
    /// powers of two shift, `3/5/9 * 2^k` go through LEA, two-set-bit
    /// constants become shift+add.
    fn mul(&mut self, dst: Vreg, a: &ir::Expr, b: &ir::Expr) -> Result<()> {
        let av = self.eval(a)?;
        let bv = self.eval(b)?;
        let (c, x) = match (&av, &bv) {
            (Operand::Imm(x), Operand::Imm(y)) => {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(x.wrapping_mul(*y)),
                });
                return Ok(());
            }
            (Operand::Imm(c), _) => (Some(*c), bv.clone()),
            (_, Operand::Imm(c)) => (Some(*c), av.clone()),
            _ => (None, av.clone()),
        };

        if let Some(c) = c {
            if c == 0 {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(0),
                });
                return Ok(());
            }
            if c == 1 {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: x,
                });
                return Ok(());
            }
            if c > 0 && (c & (c - 1)) == 0 {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: x,
                });
                self.emit(Insn::Alu {
                    op: AluOp::Shl,
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(c.trailing_zeros() as i64),
                });
                return Ok(());
            }
            if matches!(c, 3 | 5 | 9) {
                let xr = self.force_reg(x);
                self.emit(Insn::Lea {
                    dst,
                    addr: MemRef {
                        base: Some(xr),
                        index: Some(xr),
                        scale: (c - 1) as u8,
                        disp: 0,
                        sym: None,
                    },
                });
                return Ok(());
            }
            if c > 0 && c.count_ones() == 2 {
                let i = c.trailing_zeros() as i64;
                let j = 63 - c.leading_zeros() as i64;
                let xr = self.force_reg(x);
                let xr = match self.shield(dst, Operand::Reg(xr)) {
                    Operand::Reg(r) => r,
                    _ => unreachable!(),
                };
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Reg(xr),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Shl,
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(j - i),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Add,
                    dst: Operand::Reg(dst),
                    src: Operand::Reg(xr),
                });
                if i > 0 {
                    self.emit(Insn::Alu {
                        op: AluOp::Shl,
                        dst: Operand::Reg(dst),
                        src: Operand::Imm(i),
                    });
                }
                return Ok(());
            }
            // General constant: imul reg, imm only takes 32 bits, so go
            // through the two-operand form.
            self.emit(Insn::Mov {
                dst: Operand::Reg(dst),
                src: x,
            });
            let c = self.legal_alu_src(Operand::Imm(c));
            self.emit(Insn::Alu {
                op: AluOp::IMul,
                dst: Operand::Reg(dst),
                src: c,
            });
            return Ok(());
        }

        let bv = self.shield(dst, bv);
        self.emit(Insn::Mov {
            dst: Operand::Reg(dst),
            src: av,
        });
        self.emit(Insn::Alu {
            op: AluOp::IMul,
            dst: Operand::Reg(dst),
            src: bv,
        });
        Ok(())
    }

    /// Signed division and remainder.  A power-of-two divisor uses the
    /// shift-with-correction sequence; everything else goes through
    /// `cqo; idiv` with the dividend in rax.
    fn divide(&mut self, dst: Vreg, op: BinOp, a: &ir::Expr, b: &ir::Expr) -> Result<()> {
        let av = self.eval(a)?;
        let bv = self.eval(b)?;

        if let (Operand::Imm(x), Operand::Imm(y)) = (&av, &bv) {
            if let Some(c) = op.fold(*x, *y) {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(c),
                });
                return Ok(());
            }
        }

        if let Operand::Imm(c) = bv {
            if c > 1 && (c & (c - 1)) == 0 {
                let k = c.trailing_zeros() as i64;
                // bias = (a >> 63) >>u (64-k): 2^k-1 for negative dividends
                let bias = self.fresh();
                let ar = self.force_reg(av);
                self.emit(Insn::Mov {
                    dst: Operand::Reg(bias),
                    src: Operand::Reg(ar),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Sar,
                    dst: Operand::Reg(bias),
                    src: Operand::Imm(63),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Shr,
                    dst: Operand::Reg(bias),
                    src: Operand::Imm(64 - k),
                });
                let q = if op == BinOp::Div { dst } else { self.fresh() };
                self.emit(Insn::Mov {
                    dst: Operand::Reg(q),
                    src: Operand::Reg(ar),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Add,
                    dst: Operand::Reg(q),
                    src: Operand::Reg(bias),
                });
                self.emit(Insn::Alu {
                    op: AluOp::Sar,
                    dst: Operand::Reg(q),
                    src: Operand::Imm(k),
                });
                if op == BinOp::Rem {
                    // a - (a / 2^k) << k
                    self.emit(Insn::Alu {
                        op: AluOp::Shl,
                        dst: Operand::Reg(q),
                        src: Operand::Imm(k),
                    });
                    self.emit(Insn::Mov {
                        dst: Operand::Reg(dst),
                        src: Operand::Reg(ar),
                    });
                    self.emit(Insn::Alu {
                        op: AluOp::Sub,
                        dst: Operand::Reg(dst),
                        src: Operand::Reg(q),
                    });
                }
                return Ok(());
            }
        }

        let divisor = self.force_reg(bv);
        self.emit(Insn::Mov {
            dst: Operand::reg(Reg::Rax),
            src: av,
        });
        self.emit(Insn::Cqo);
        self.emit(Insn::Idiv(Operand::Reg(divisor)));
        let result = if op == BinOp::Div { Reg::Rax } else { Reg::Rdx };
        self.emit(Insn::Mov {
            dst: Operand::Reg(dst),
            src: Operand::reg(result),
        });
        Ok(())
    }

    /// Shifts: `>>` on a signed language is arithmetic.  A variable count
    /// travels through cl and is read before the destination is written, so
    /// the destination interferes with rcx and gets a different color.
    fn shift(&mut self, dst: Vreg, op: BinOp, a: &ir::Expr, b: &ir::Expr) -> Result<()> {
        let alu = if op == BinOp::Shl { AluOp::Shl } else { AluOp::Sar };
        let av = self.eval(a)?;
        let bv = self.eval(b)?;
        if let (Operand::Imm(x), Operand::Imm(y)) = (&av, &bv) {
            if let Some(c) = op.fold(*x, *y) {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(c),
                });
                return Ok(());
            }
        }
        match bv {
            Operand::Imm(c) => {
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: av,
                });
                self.emit(Insn::Alu {
                    op: alu,
                    dst: Operand::Reg(dst),
                    src: Operand::Imm(c & 63),
                });
            }
            bv => {
                // Count into rcx before dst is written, so the count is read
                // first and dst interferes with rcx.
                self.emit(Insn::Mov {
                    dst: Operand::reg(Reg::Rcx),
                    src: bv,
                });
                self.emit(Insn::Mov {
                    dst: Operand::Reg(dst),
                    src: av,
                });
                self.emit(Insn::Alu {
                    op: alu,
                    dst: Operand::Reg(dst),
                    src: Operand::reg(Reg::Rcx),
                });
            }
        }
        Ok(())
    }

    // ---- addressing ----

    /// Fold an address expression into one `base + index*scale + disp`
    /// memory reference.
    fn addr(&mut self, e: &ir::Expr) -> Result<MemRef> {
        let mut terms = Vec::new();
        flatten_add(e, &mut terms);

        let mut m = MemRef {
            scale: 1,
            ..MemRef::default()
        };
        let mut rest: Vec<Vreg> = Vec::new();
        for t in terms {
            match t {
                ir::Expr::Const(c) => m.disp += c,
                ir::Expr::Str(s) if m.sym.is_none() => m.sym = Some(s.to_string()),
                ir::Expr::Binary(BinOp::Mul, x, y) if m.index.is_none() => {
                    let (factor, operand) = match (x.as_ref(), y.as_ref()) {
                        (ir::Expr::Const(c), o) | (o, ir::Expr::Const(c)) => (Some(*c), o),
                        _ => (None, x.as_ref()),
                    };
                    match factor {
                        Some(c @ (1 | 2 | 4 | 8)) => {
                            let v = self.eval(operand)?;
                            m.index = Some(self.force_reg(v));
                            m.scale = c as u8;
                        }
                        _ => {
                            let whole =
                                ir::Expr::Binary(BinOp::Mul, x.clone(), y.clone());
                            let v = self.eval(&whole)?;
                            rest.push(self.force_reg(v));
                        }
                    }
                }
                other => {
                    let v = self.eval(other)?;
                    rest.push(self.force_reg(v));
                }
            }
        }

        if i32::try_from(m.disp).is_err() {
            let v = self.fresh();
            self.emit(Insn::Mov {
                dst: Operand::Reg(v),
                src: Operand::Imm(m.disp),
            });
            m.disp = 0;
            rest.push(v);
        }

        for v in rest {
            match (m.base, m.index) {
                (None, _) => m.base = Some(v),
                (Some(_), None) => {
                    m.index = Some(v);
                    m.scale = 1;
                }
                (Some(b), Some(_)) => {
                    // Too many terms for one reference: fold into a new base.
                    let merged = self.fresh();
                    self.emit(Insn::Mov {
                        dst: Operand::Reg(merged),
                        src: Operand::Reg(b),
                    });
                    self.emit(Insn::Alu {
                        op: AluOp::Add,
                        dst: Operand::Reg(merged),
                        src: Operand::Reg(v),
                    });
                    m.base = Some(merged);
                }
            }
        }

        if m.base.is_none() && m.index.is_none() && m.sym.is_none() {
            // A bare constant address; unreachable from well-typed sources
            // but keep it well-formed.
            let v = self.fresh();
            self.emit(Insn::Mov {
                dst: Operand::Reg(v),
                src: Operand::Imm(m.disp),
            });
            m.disp = 0;
            m.base = Some(v);
        }
        Ok(m)
    }

    // ---- operand legalization ----

    fn force_reg(&mut self, op: Operand) -> Vreg {
        match op {
            Operand::Reg(v) => v,
            op => {
                let v = self.fresh();
                self.emit(Insn::Mov {
                    dst: Operand::Reg(v),
                    src: op,
                });
                v
            }
        }
    }

    /// The two-address shape writes `dst` before reading the second operand;
    /// an operand that mentions `dst` must be copied out first.
    fn shield(&mut self, dst: Vreg, op: Operand) -> Operand {
        if op.regs().contains(&dst) {
            let t = self.fresh();
            self.emit(Insn::Mov {
                dst: Operand::Reg(t),
                src: op,
            });
            Operand::Reg(t)
        } else {
            op
        }
    }

    /// cmp's first operand must be a register or memory.
    fn eval_cmp_lhs(&mut self, e: &ir::Expr) -> Result<Operand> {
        let v = self.eval(e)?;
        Ok(match v {
            Operand::Imm(_) => Operand::Reg(self.force_reg(v)),
            v => v,
        })
    }

    /// No instruction takes two memory operands or a 64-bit immediate
    /// source.
    fn legal_pair(&mut self, lhs: &Operand, rhs: Operand) -> Operand {
        let rhs = self.legal_alu_src(rhs);
        if lhs.is_mem() && rhs.is_mem() {
            Operand::Reg(self.force_reg(rhs))
        } else {
            rhs
        }
    }

    fn legal_alu_src(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Imm(c) if i32::try_from(c).is_err() => {
                Operand::Reg(self.force_reg(Operand::Imm(c)))
            }
            op => op,
        }
    }

    /// Stores take a register or a 32-bit immediate.
    fn force_store_src(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Imm(c) if i32::try_from(c).is_ok() => Operand::Imm(c),
            Operand::Reg(v) => Operand::Reg(v),
            op => Operand::Reg(self.force_reg(op)),
        }
    }
}

fn cond_code(op: BinOp) -> Cond {
    match op {
        BinOp::Lt => Cond::L,
        BinOp::Le => Cond::Le,
        BinOp::Gt => Cond::G,
        BinOp::Ge => Cond::Ge,
        BinOp::Eq => Cond::E,
        BinOp::Ne => Cond::Ne,
        _ => unreachable!("not a comparison"),
    }
}

/// Flatten nested additions into a term list.
fn flatten_add<'e>(e: &'e ir::Expr, out: &mut Vec<&'e ir::Expr>) {
    match e {
        ir::Expr::Binary(BinOp::Add, a, b) => {
            flatten_add(a, out);
            flatten_add(b, out);
        }
        _ => out.push(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::front::sema::check;
    use crate::front::lower::lower;

    fn select_src(src: &str) -> Vec<AsmFunction> {
        let ast = parse(src).unwrap();
        let env = check(&ast).unwrap();
        let ir = lower(&ast, &env).unwrap();
        let mut next_label = ir.next_label;
        select(&ir, &env, &mut next_label).unwrap()
    }

    fn text_of(f: &AsmFunction) -> String {
        f.insns
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn main_text(src: &str) -> String {
        let funs = select_src(src);
        let f = funs.iter().find(|f| f.label == "_f_main").unwrap();
        text_of(f)
    }

    #[test]
    fn array_indexing_folds_into_one_reference() {
        let text = main_text(
            "int main() { int[] a = new int[4]; int i = 2; return a[i]; }",
        );
        assert!(text.contains("*8 + 8]"), "{text}");
    }

    #[test]
    fn power_of_two_multiply_becomes_shift() {
        let text = main_text("int main() { int a = getInt(); return a * 8; }");
        assert!(text.contains("shl"), "{text}");
        assert!(!text.contains("imul"), "{text}");
    }

    #[test]
    fn small_multiplier_uses_lea() {
        let text = main_text("int main() { int a = getInt(); return a * 5; }");
        assert!(text.contains("lea"), "{text}");
    }

    #[test]
    fn two_set_bit_multiplier_is_shift_add() {
        let text = main_text("int main() { int a = getInt(); return a * 6; }");
        assert!(text.contains("shl"), "{text}");
        assert!(text.contains("add"), "{text}");
        assert!(!text.contains("imul"), "{text}");
    }

    #[test]
    fn power_of_two_division_avoids_idiv() {
        let text = main_text("int main() { int a = getInt(); return a / 4; }");
        assert!(text.contains("sar"), "{text}");
        assert!(!text.contains("idiv"), "{text}");
        // the signed correction reads the sign bit
        assert!(text.contains("sar"));
        assert!(text.contains("shr"));
    }

    #[test]
    fn general_division_goes_through_rax_rdx() {
        let text = main_text(
            "int main() { int a = getInt(); int b = getInt(); return a % b; }",
        );
        assert!(text.contains("cqo"), "{text}");
        assert!(text.contains("idiv"), "{text}");
        assert!(text.contains("mov rax"), "{text}");
        // remainder comes back in rdx
        assert!(text.contains("rdx"), "{text}");
    }

    #[test]
    fn comparisons_fuse_with_branches() {
        let text = main_text(
            "int main() { int a = getInt(); if (a < 3) return 1; return 0; }",
        );
        assert!(text.contains("cmp"), "{text}");
        assert!(text.contains("jl"), "{text}");
        assert!(!text.contains("setl"), "{text}");
    }

    #[test]
    fn seventh_argument_goes_on_the_stack() {
        let text = main_text(
            "int f(int a, int b, int c, int d, int e, int g, int h) { return h; }
             int main() { return f(1, 2, 3, 4, 5, 6, 7); }",
        );
        assert!(text.contains("push"), "{text}");
        assert!(text.contains("add rsp"), "{text}");
        let funs = select_src(
            "int f(int a, int b, int c, int d, int e, int g, int h) { return h; }
             int main() { return f(1, 2, 3, 4, 5, 6, 7); }",
        );
        let f = funs.iter().find(|f| f.label == "_f_f").unwrap();
        assert!(text_of(f).contains("[rbp + 16]"), "{}", text_of(f));
    }

    #[test]
    fn variadic_print_zeroes_rax() {
        let text = main_text(r#"int main() { print("x"); return 0; }"#);
        assert!(text.contains("mov rax, 0\ncall printf"), "{text}");
    }

    #[test]
    fn globals_are_symbolic_memory() {
        let text = main_text("int g = 0; int main() { g = 5; return g; }");
        assert!(text.contains("[rel _g_g]"), "{text}");
    }
}
