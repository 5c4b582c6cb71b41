//! Lowering the checked AST into the three-address IR.
//!
//! The contracts that matter here:
//! - subexpressions are evaluated left to right; once anything later in the
//!   same expression can have a side effect, the value computed so far is
//!   hoisted into a temporary,
//! - short circuits become branches, with no temporary materialized when the
//!   parent is itself a branch,
//! - the address of an increment or assignment target is computed exactly
//!   once,
//! - `new` turns into runtime allocation calls, with a loop nest for
//!   multi-dimensional arrays,
//! - global initializers run in declaration order inside the implicit
//!   `__init` function.

use crate::common::*;
use crate::middle::ir::{self, BinOp, Callee, Label, RuntimeFn, StrId, Temp, UnOp};

use super::ast::{self, has_effects, BOp, ExprKind, UOp};
use super::sema::{Builtin, Env, FunId, FunSource, Symbol, Ty, VarId};

pub fn lower(program: &ast::Program, env: &Env) -> Result<ir::Program> {
    let mut lowerer = Lowerer {
        env,
        strings: Vec::new(),
        string_ids: Map::new(),
        global_consts: Map::new(),
        next_temp: 0,
        next_label: 0,
        body: Vec::new(),
        current_fun: None,
        loops: Vec::new(),
    };

    let mut funs = Vec::new();
    funs.push(lowerer.lower_init(program)?);
    for fid in (0..env.funs.len()).map(|i| FunId(i as u32)) {
        funs.push(lowerer.lower_fun(program, fid)?);
    }
    let globals = env
        .globals
        .iter()
        .map(|&v| {
            let label = format!("_g_{}", env.var(v).name);
            (v, label, lowerer.global_consts.get(&v).copied())
        })
        .collect();
    Ok(ir::Program {
        funs,
        strings: lowerer.strings,
        globals,
        next_label: lowerer.next_label,
    })
}

struct Lowerer<'a> {
    env: &'a Env,
    strings: Vec<String>,
    string_ids: Map<String, StrId>,
    /// Globals whose initializer is a compile-time constant; these skip
    /// `__init` and are emitted directly into `.data`.
    global_consts: Map<VarId, i64>,
    next_temp: u32,
    /// Labels are unique across the program, so the counter never resets.
    next_label: u32,
    body: Vec<ir::Stmt>,
    current_fun: Option<FunId>,
    /// Innermost loop last: (continue target, break target).
    loops: Vec<(Label, Label)>,
}

/// An assignment or increment target with its address already computed.
enum LValue {
    Var(VarId),
    Mem(ir::Expr),
}

impl LValue {
    fn read(&self) -> ir::Expr {
        match self {
            LValue::Var(v) => ir::Expr::Var(*v),
            LValue::Mem(addr) => ir::Expr::mem(addr.clone()),
        }
    }

    fn target(&self) -> ir::Expr {
        self.read()
    }
}

impl<'a> Lowerer<'a> {
    fn fresh_temp(&mut self) -> Temp {
        let t = Temp(self.next_temp);
        self.next_temp += 1;
        t
    }

    fn fresh_label(&mut self) -> Label {
        let l = Label(self.next_label);
        self.next_label += 1;
        l
    }

    fn emit(&mut self, stmt: ir::Stmt) {
        self.body.push(stmt);
    }

    fn string_id(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    /// Copy a value into a fresh temporary unless it is already immutable
    /// under later side effects.
    fn into_temp(&mut self, e: ir::Expr) -> ir::Expr {
        match e {
            ir::Expr::Const(_) | ir::Expr::Str(_) | ir::Expr::Temp(_) => e,
            _ => {
                let t = self.fresh_temp();
                self.emit(ir::Stmt::Assign(ir::Expr::Temp(t), e));
                ir::Expr::Temp(t)
            }
        }
    }

    fn this_var(&self) -> VarId {
        let fid = self.current_fun.expect("'this' outside a function");
        self.env.fun(fid).params[0]
    }

    // ---- functions ----

    fn lower_init(&mut self, program: &ast::Program) -> Result<ir::Function> {
        self.next_temp = 0;
        self.body = Vec::new();
        self.current_fun = None;
        let mut globals = self.env.globals.iter();
        for decl in &program.decls {
            if let ast::Decl::Var(v) = decl {
                let vid = *globals.next().expect("global arena out of sync");
                match &v.init {
                    Some(init) => match constant_of(init) {
                        Some(c) => {
                            self.global_consts.insert(vid, c);
                        }
                        None => {
                            let value = self.expr(init)?;
                            self.emit(ir::Stmt::Assign(ir::Expr::Var(vid), value));
                        }
                    },
                    None => {}
                }
            }
        }
        self.emit(ir::Stmt::Return(None));
        Ok(ir::Function {
            fun: None,
            label: "__init".to_string(),
            params: Vec::new(),
            locals: 0,
            body: std::mem::take(&mut self.body),
            temps: self.next_temp,
        })
    }

    fn lower_fun(&mut self, program: &ast::Program, fid: FunId) -> Result<ir::Function> {
        self.next_temp = 0;
        self.body = Vec::new();
        self.current_fun = Some(fid);
        let entity = self.env.fun(fid);
        let body = fun_body(program, entity.source);
        for stmt in body {
            self.stmt(stmt)?;
        }
        // Falling off the end: void functions (and constructors) return
        // nothing; for value functions the path is unreachable in a correct
        // program, but the block still needs a terminator.
        match self.body.last() {
            Some(ir::Stmt::Return(_)) => {}
            _ => {
                let value = if entity.ret == Ty::Void {
                    None
                } else {
                    Some(ir::Expr::Const(0))
                };
                self.emit(ir::Stmt::Return(value));
            }
        }
        let entity = self.env.fun(fid);
        Ok(ir::Function {
            fun: Some(fid),
            label: entity.label.clone(),
            params: entity.params.clone(),
            locals: entity.locals.len(),
            body: std::mem::take(&mut self.body),
            temps: self.next_temp,
        })
    }

    // ---- statements ----

    fn stmt(&mut self, stmt: &ast::Stmt) -> Result<()> {
        match stmt {
            ast::Stmt::Block(stmts) => {
                for s in stmts {
                    self.stmt(s)?;
                }
            }
            ast::Stmt::Decl(v) => {
                if let Some(init) = &v.init {
                    let vid = self.decl_var(v);
                    let value = self.expr(init)?;
                    self.emit(ir::Stmt::Assign(ir::Expr::Var(vid), value));
                }
            }
            ast::Stmt::If { guard, tt, ff } => {
                let lt = self.fresh_label();
                let lend = self.fresh_label();
                let lf = if ff.is_some() { self.fresh_label() } else { lend };
                self.cond(guard, lt, lf)?;
                self.emit(ir::Stmt::Label(lt));
                self.stmt(tt)?;
                self.emit(ir::Stmt::Jump(lend));
                if let Some(ff) = ff {
                    self.emit(ir::Stmt::Label(lf));
                    self.stmt(ff)?;
                    self.emit(ir::Stmt::Jump(lend));
                }
                self.emit(ir::Stmt::Label(lend));
            }
            ast::Stmt::While { guard, body } => {
                let lcond = self.fresh_label();
                let lbody = self.fresh_label();
                let lend = self.fresh_label();
                self.emit(ir::Stmt::Jump(lcond));
                self.emit(ir::Stmt::Label(lcond));
                self.cond(guard, lbody, lend)?;
                self.emit(ir::Stmt::Label(lbody));
                self.loops.push((lcond, lend));
                self.stmt(body)?;
                self.loops.pop();
                self.emit(ir::Stmt::Jump(lcond));
                self.emit(ir::Stmt::Label(lend));
            }
            ast::Stmt::For {
                init,
                guard,
                step,
                body,
            } => {
                let lcond = self.fresh_label();
                let lbody = self.fresh_label();
                let lstep = self.fresh_label();
                let lend = self.fresh_label();
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                self.emit(ir::Stmt::Jump(lcond));
                self.emit(ir::Stmt::Label(lcond));
                match guard {
                    Some(guard) => self.cond(guard, lbody, lend)?,
                    None => self.emit(ir::Stmt::Jump(lbody)),
                }
                self.emit(ir::Stmt::Label(lbody));
                self.loops.push((lstep, lend));
                self.stmt(body)?;
                self.loops.pop();
                self.emit(ir::Stmt::Jump(lstep));
                self.emit(ir::Stmt::Label(lstep));
                if let Some(step) = step {
                    self.expr_for_effect(step)?;
                }
                self.emit(ir::Stmt::Jump(lcond));
                self.emit(ir::Stmt::Label(lend));
            }
            ast::Stmt::Break(_) => {
                let (_, lend) = *self.loops.last().expect("break outside a loop");
                self.emit(ir::Stmt::Jump(lend));
            }
            ast::Stmt::Continue(_) => {
                let (lcont, _) = *self.loops.last().expect("continue outside a loop");
                self.emit(ir::Stmt::Jump(lcont));
            }
            ast::Stmt::Return(value, _) => {
                let value = match value {
                    Some(e) => Some(self.expr(e)?),
                    None => None,
                };
                self.emit(ir::Stmt::Return(value));
            }
            ast::Stmt::Expr(e) => {
                self.expr_for_effect(e)?;
            }
            ast::Stmt::Empty => {}
        }
        Ok(())
    }

    fn decl_var(&mut self, v: &ast::VarDecl) -> VarId {
        match self.env.symbol(v.id) {
            Symbol::Var(vid) => vid,
            _ => unreachable!("declaration resolved to a non-variable"),
        }
    }

    /// Lower an expression evaluated for its effect only.
    fn expr_for_effect(&mut self, e: &ast::Expr) -> Result<()> {
        match &e.kind {
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => {
                self.call(e, false)?;
            }
            ExprKind::Assign { .. }
            | ExprKind::PreIncDec { .. }
            | ExprKind::PostIncDec { .. } => {
                self.expr(e)?;
            }
            // A discarded pure expression can still trap (division), so it is
            // kept as a statement rather than dropped.
            ExprKind::BOp { op: BOp::Div | BOp::Rem, .. } => {
                let v = self.expr(e)?;
                self.emit(ir::Stmt::ExprStmt(v));
            }
            _ => {
                self.expr(e)?;
            }
        }
        Ok(())
    }

    // ---- conditions ----

    /// Lower a boolean expression directly into branches.
    fn cond(&mut self, e: &ast::Expr, lt: Label, lf: Label) -> Result<()> {
        match &e.kind {
            ExprKind::Bool(true) => self.emit(ir::Stmt::Jump(lt)),
            ExprKind::Bool(false) => self.emit(ir::Stmt::Jump(lf)),
            ExprKind::Unary(UOp::Not, inner) => self.cond(inner, lf, lt)?,
            ExprKind::BOp {
                op: BOp::LAnd,
                lhs,
                rhs,
            } => {
                let mid = self.fresh_label();
                self.cond(lhs, mid, lf)?;
                self.emit(ir::Stmt::Label(mid));
                self.cond(rhs, lt, lf)?;
            }
            ExprKind::BOp {
                op: BOp::LOr,
                lhs,
                rhs,
            } => {
                let mid = self.fresh_label();
                self.cond(lhs, lt, mid)?;
                self.emit(ir::Stmt::Label(mid));
                self.cond(rhs, lt, lf)?;
            }
            _ => {
                let v = self.expr(e)?;
                self.emit(ir::Stmt::CJump(v, lt, lf));
            }
        }
        Ok(())
    }

    // ---- lvalues ----

    /// Compute an assignment target.  With `reuse` set (increments, or an
    /// assignment whose right-hand side has effects) the address lands in a
    /// temporary, so a side-effecting receiver (`a.getSelf().ct++`) is
    /// evaluated exactly once, before both the read and the write.  A plain
    /// store keeps the address expression intact for the emitter to fold.
    fn lvalue(&mut self, e: &ast::Expr, reuse: bool) -> Result<LValue> {
        match &e.kind {
            ExprKind::Var(_) => match self.env.symbol(e.id) {
                Symbol::Var(v) => Ok(LValue::Var(v)),
                Symbol::ThisField(idx) => {
                    let this = ir::Expr::Var(self.this_var());
                    let addr = ir::Expr::add(this, ir::Expr::Const(8 * idx as i64));
                    let addr = if reuse { self.into_temp(addr) } else { addr };
                    Ok(LValue::Mem(addr))
                }
                _ => Err(CompileError::internal("variable resolved to a non-place")),
            },
            ExprKind::Member { recv, name: _ } => {
                let Symbol::Field(idx) = self.env.symbol(e.id) else {
                    return Err(CompileError::internal("member did not resolve to a field"));
                };
                let base = self.expr(recv)?;
                let addr = ir::Expr::add(base, ir::Expr::Const(8 * idx as i64));
                let addr = if reuse { self.into_temp(addr) } else { addr };
                Ok(LValue::Mem(addr))
            }
            ExprKind::Index { base, index } => {
                let base = self.expr(base)?;
                let base = if has_effects(index) {
                    self.into_temp(base)
                } else {
                    base
                };
                let index = self.expr(index)?;
                let addr = ir::Expr::add(
                    ir::Expr::add(base, ir::Expr::mul(index, ir::Expr::Const(8))),
                    ir::Expr::Const(8),
                );
                let addr = if reuse { self.into_temp(addr) } else { addr };
                Ok(LValue::Mem(addr))
            }
            _ => Err(CompileError::internal("lowering a non-lvalue target")),
        }
    }

    // ---- expressions ----

    fn expr(&mut self, e: &ast::Expr) -> Result<ir::Expr> {
        match &e.kind {
            ExprKind::Int(n) => Ok(ir::Expr::Const(*n)),
            ExprKind::Bool(b) => Ok(ir::Expr::Const(*b as i64)),
            ExprKind::Null => Ok(ir::Expr::Const(0)),
            ExprKind::Str(s) => {
                let id = self.string_id(s);
                Ok(ir::Expr::Str(id))
            }
            ExprKind::This => Ok(ir::Expr::Var(self.this_var())),
            ExprKind::Var(_) => match self.env.symbol(e.id) {
                Symbol::Var(v) => Ok(ir::Expr::Var(v)),
                Symbol::ThisField(idx) => {
                    let this = ir::Expr::Var(self.this_var());
                    Ok(ir::Expr::mem(ir::Expr::add(
                        this,
                        ir::Expr::Const(8 * idx as i64),
                    )))
                }
                _ => Err(CompileError::internal("variable resolved to a non-place")),
            },
            ExprKind::Member { recv, .. } => {
                let Symbol::Field(idx) = self.env.symbol(e.id) else {
                    return Err(CompileError::internal("member did not resolve to a field"));
                };
                let base = self.expr(recv)?;
                Ok(ir::Expr::mem(ir::Expr::add(
                    base,
                    ir::Expr::Const(8 * idx as i64),
                )))
            }
            ExprKind::Index { base, index } => {
                let base_v = self.expr(base)?;
                let base_v = if has_effects(index) {
                    self.into_temp(base_v)
                } else {
                    base_v
                };
                let index_v = self.expr(index)?;
                Ok(ir::Expr::mem(ir::Expr::add(
                    ir::Expr::add(base_v, ir::Expr::mul(index_v, ir::Expr::Const(8))),
                    ir::Expr::Const(8),
                )))
            }
            ExprKind::Unary(op, inner) => {
                let v = self.expr(inner)?;
                let op = match op {
                    UOp::Neg => UnOp::Neg,
                    UOp::BNot => UnOp::BNot,
                    UOp::Not => UnOp::Not,
                };
                Ok(ir::Expr::Unary(op, Box::new(v)))
            }
            ExprKind::PreIncDec { inc, target } => {
                let lv = self.lvalue(target, true)?;
                let op = if *inc { BinOp::Add } else { BinOp::Sub };
                let updated = ir::Expr::Binary(op, Box::new(lv.read()), Box::new(ir::Expr::Const(1)));
                let updated = self.into_temp(updated);
                self.emit(ir::Stmt::Assign(lv.target(), updated.clone()));
                Ok(updated)
            }
            ExprKind::PostIncDec { inc, target } => {
                let lv = self.lvalue(target, true)?;
                let old = self.into_temp(lv.read());
                let op = if *inc { BinOp::Add } else { BinOp::Sub };
                let updated =
                    ir::Expr::Binary(op, Box::new(old.clone()), Box::new(ir::Expr::Const(1)));
                self.emit(ir::Stmt::Assign(lv.target(), updated));
                Ok(old)
            }
            ExprKind::Assign { lhs, rhs } => {
                let lv = self.lvalue(lhs, has_effects(rhs))?;
                let value = self.expr(rhs)?;
                let value = self.into_temp(value);
                self.emit(ir::Stmt::Assign(lv.target(), value.clone()));
                Ok(value)
            }
            ExprKind::BOp { op, lhs, rhs } => self.binary(e, *op, lhs, rhs),
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } => self.call(e, true),
            ExprKind::NewObject { .. } => {
                let Ty::Class(cid) = self.env.ty(e.id).clone() else {
                    return Err(CompileError::internal("'new' of a non-class type"));
                };
                let size = self.env.class(cid).size_bytes();
                let dst = self.fresh_temp();
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::Malloc),
                    args: vec![ir::Expr::Const(size)],
                    dst: Some(ir::Expr::Temp(dst)),
                });
                if let Some(ctor) = self.env.class(cid).ctor {
                    let label = self.env.fun(ctor).label.clone();
                    self.emit(ir::Stmt::Call {
                        target: Callee::Fun(ctor, label),
                        args: vec![ir::Expr::Temp(dst)],
                        dst: None,
                    });
                }
                Ok(ir::Expr::Temp(dst))
            }
            ExprKind::NewArray { dims, .. } => {
                let sized: Vec<ir::Expr> = dims
                    .iter()
                    .flatten()
                    .map(|d| {
                        let v = self.expr(d)?;
                        Ok(self.into_temp(v))
                    })
                    .collect::<Result<_>>()?;
                self.new_array(&sized)
            }
        }
    }

    /// Allocate `new T[d0][d1]...`, recursing one dimension at a time: the
    /// block holds the element count in its first word, elements from byte 8.
    fn new_array(&mut self, dims: &[ir::Expr]) -> Result<ir::Expr> {
        let count = dims[0].clone();
        let bytes = ir::Expr::add(
            ir::Expr::mul(count.clone(), ir::Expr::Const(8)),
            ir::Expr::Const(8),
        );
        let arr = self.fresh_temp();
        self.emit(ir::Stmt::Call {
            target: Callee::Runtime(RuntimeFn::Malloc),
            args: vec![bytes],
            dst: Some(ir::Expr::Temp(arr)),
        });
        self.emit(ir::Stmt::Assign(
            ir::Expr::mem(ir::Expr::Temp(arr)),
            count.clone(),
        ));
        if dims.len() > 1 {
            let i = self.fresh_temp();
            let lcond = self.fresh_label();
            let lbody = self.fresh_label();
            let lend = self.fresh_label();
            self.emit(ir::Stmt::Assign(ir::Expr::Temp(i), ir::Expr::Const(0)));
            self.emit(ir::Stmt::Jump(lcond));
            self.emit(ir::Stmt::Label(lcond));
            self.emit(ir::Stmt::CJump(
                ir::Expr::Binary(
                    BinOp::Lt,
                    Box::new(ir::Expr::Temp(i)),
                    Box::new(count.clone()),
                ),
                lbody,
                lend,
            ));
            self.emit(ir::Stmt::Label(lbody));
            let elem = self.new_array(&dims[1..])?;
            let slot = ir::Expr::add(
                ir::Expr::add(
                    ir::Expr::Temp(arr),
                    ir::Expr::mul(ir::Expr::Temp(i), ir::Expr::Const(8)),
                ),
                ir::Expr::Const(8),
            );
            self.emit(ir::Stmt::Assign(ir::Expr::mem(slot), elem));
            self.emit(ir::Stmt::Assign(
                ir::Expr::Temp(i),
                ir::Expr::add(ir::Expr::Temp(i), ir::Expr::Const(1)),
            ));
            self.emit(ir::Stmt::Jump(lcond));
            self.emit(ir::Stmt::Label(lend));
        }
        Ok(ir::Expr::Temp(arr))
    }

    fn binary(
        &mut self,
        e: &ast::Expr,
        op: BOp,
        lhs: &ast::Expr,
        rhs: &ast::Expr,
    ) -> Result<ir::Expr> {
        // Short circuits in value position materialize into a temporary that
        // both arms write.
        if op.is_logical() {
            let t = self.fresh_temp();
            let v = self.expr(lhs)?;
            self.emit(ir::Stmt::Assign(ir::Expr::Temp(t), v));
            let ltake = self.fresh_label();
            let lend = self.fresh_label();
            match op {
                BOp::LAnd => self.emit(ir::Stmt::CJump(ir::Expr::Temp(t), ltake, lend)),
                BOp::LOr => self.emit(ir::Stmt::CJump(ir::Expr::Temp(t), lend, ltake)),
                _ => unreachable!(),
            }
            self.emit(ir::Stmt::Label(ltake));
            let v = self.expr(rhs)?;
            self.emit(ir::Stmt::Assign(ir::Expr::Temp(t), v));
            self.emit(ir::Stmt::Jump(lend));
            self.emit(ir::Stmt::Label(lend));
            return Ok(ir::Expr::Temp(t));
        }

        let strings = *self.env.ty(lhs.id) == Ty::Str && *self.env.ty(rhs.id) == Ty::Str;
        let lv = self.expr(lhs)?;
        let lv = if has_effects(rhs) { self.into_temp(lv) } else { lv };
        let rv = self.expr(rhs)?;

        if strings {
            return self.string_op(op, lv, rv);
        }

        let op = match op {
            BOp::Add => BinOp::Add,
            BOp::Sub => BinOp::Sub,
            BOp::Mul => BinOp::Mul,
            BOp::Div => BinOp::Div,
            BOp::Rem => BinOp::Rem,
            BOp::And => BinOp::And,
            BOp::Or => BinOp::Or,
            BOp::Xor => BinOp::Xor,
            BOp::Shl => BinOp::Shl,
            BOp::Shr => BinOp::Shr,
            BOp::Lt => BinOp::Lt,
            BOp::Le => BinOp::Le,
            BOp::Gt => BinOp::Gt,
            BOp::Ge => BinOp::Ge,
            BOp::Eq => BinOp::Eq,
            BOp::Ne => BinOp::Ne,
            BOp::LAnd | BOp::LOr => unreachable!(),
        };
        Ok(ir::Expr::Binary(op, Box::new(lv), Box::new(rv)))
    }

    /// String `+` concatenates; comparisons call the runtime and test the
    /// sign of the result.
    fn string_op(&mut self, op: BOp, lv: ir::Expr, rv: ir::Expr) -> Result<ir::Expr> {
        if op == BOp::Add {
            let dst = self.fresh_temp();
            self.emit(ir::Stmt::Call {
                target: Callee::Runtime(RuntimeFn::StrConcat),
                args: vec![lv, rv],
                dst: Some(ir::Expr::Temp(dst)),
            });
            return Ok(ir::Expr::Temp(dst));
        }
        let cmp = self.fresh_temp();
        self.emit(ir::Stmt::Call {
            target: Callee::Runtime(RuntimeFn::StrCmp),
            args: vec![lv, rv],
            dst: Some(ir::Expr::Temp(cmp)),
        });
        let rel = match op {
            BOp::Lt => BinOp::Lt,
            BOp::Le => BinOp::Le,
            BOp::Gt => BinOp::Gt,
            BOp::Ge => BinOp::Ge,
            BOp::Eq => BinOp::Eq,
            BOp::Ne => BinOp::Ne,
            _ => return Err(CompileError::internal("string operator has no lowering")),
        };
        Ok(ir::Expr::Binary(
            rel,
            Box::new(ir::Expr::Temp(cmp)),
            Box::new(ir::Expr::Const(0)),
        ))
    }

    /// Lower a call expression.  `want_value` is false in statement position,
    /// where a void result needs no destination.
    fn call(&mut self, e: &ast::Expr, want_value: bool) -> Result<ir::Expr> {
        let (recv, args, sym): (Option<&ast::Expr>, &[ast::Expr], Symbol) = match &e.kind {
            ExprKind::Call { args, .. } => (None, args, self.env.symbol(e.id)),
            ExprKind::MethodCall { recv, args, .. } => {
                (Some(recv), args, self.env.symbol(e.id))
            }
            _ => return Err(CompileError::internal("lowering a non-call as a call")),
        };

        match sym {
            Symbol::Builtin(b) => return self.builtin(b, recv, args),
            Symbol::Fun(_) | Symbol::Method(_) => {}
            _ => return Err(CompileError::internal("call resolved to a non-function")),
        }

        let mut lowered = Vec::new();
        match sym {
            Symbol::Method(_) => {
                let this = match recv {
                    Some(r) => self.expr(r)?,
                    None => ir::Expr::Var(self.this_var()),
                };
                lowered.push(if args.is_empty() { this } else { self.into_temp(this) });
            }
            _ => {}
        }
        self.lower_args(args, &mut lowered)?;

        let fid = match sym {
            Symbol::Fun(f) | Symbol::Method(f) => f,
            _ => unreachable!(),
        };
        let entity = self.env.fun(fid);
        let dst = if want_value && entity.ret != Ty::Void {
            Some(ir::Expr::Temp(self.fresh_temp()))
        } else {
            None
        };
        self.emit(ir::Stmt::Call {
            target: Callee::Fun(fid, entity.label.clone()),
            args: lowered,
            dst: dst.clone(),
        });
        Ok(dst.unwrap_or(ir::Expr::Const(0)))
    }

    /// Evaluate arguments left to right; anything before a side-effecting
    /// later argument goes through a temporary.
    fn lower_args(&mut self, args: &[ast::Expr], out: &mut Vec<ir::Expr>) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            let v = self.expr(arg)?;
            let later_effects = args[i + 1..].iter().any(has_effects);
            out.push(if later_effects { self.into_temp(v) } else { v });
        }
        Ok(())
    }

    fn builtin(
        &mut self,
        b: Builtin,
        recv: Option<&ast::Expr>,
        args: &[ast::Expr],
    ) -> Result<ir::Expr> {
        use Builtin::*;
        match b {
            // Strings carry their length at offset 0 and bytes from 8, so
            // the C side receives a pointer to the bytes.
            Print => {
                let s = self.expr(&args[0])?;
                let fmt = self.string_id("%s");
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::Printf),
                    args: vec![
                        ir::Expr::add(ir::Expr::Str(fmt), ir::Expr::Const(8)),
                        ir::Expr::add(s, ir::Expr::Const(8)),
                    ],
                    dst: None,
                });
                Ok(ir::Expr::Const(0))
            }
            Println => {
                let s = self.expr(&args[0])?;
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::Puts),
                    args: vec![ir::Expr::add(s, ir::Expr::Const(8))],
                    dst: None,
                });
                Ok(ir::Expr::Const(0))
            }
            PrintInt | PrintlnInt => {
                let v = self.expr(&args[0])?;
                let target = if b == PrintInt {
                    RuntimeFn::PrintInt
                } else {
                    RuntimeFn::PrintlnInt
                };
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(target),
                    args: vec![v],
                    dst: None,
                });
                Ok(ir::Expr::Const(0))
            }
            GetString | GetInt => {
                let target = if b == GetString {
                    RuntimeFn::GetString
                } else {
                    RuntimeFn::GetInt
                };
                let dst = self.fresh_temp();
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(target),
                    args: vec![],
                    dst: Some(ir::Expr::Temp(dst)),
                });
                Ok(ir::Expr::Temp(dst))
            }
            ToString => {
                let v = self.expr(&args[0])?;
                let dst = self.fresh_temp();
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::ToString),
                    args: vec![v],
                    dst: Some(ir::Expr::Temp(dst)),
                });
                Ok(ir::Expr::Temp(dst))
            }
            // Arrays and strings store their count/length in the first word.
            Size | Length => {
                let recv = recv.ok_or_else(|| {
                    CompileError::internal("length builtin without a receiver")
                })?;
                let base = self.expr(recv)?;
                Ok(ir::Expr::mem(base))
            }
            Ord => {
                let recv = recv.unwrap();
                let s = self.expr(recv)?;
                let s = if has_effects(&args[0]) { self.into_temp(s) } else { s };
                let i = self.expr(&args[0])?;
                let dst = self.fresh_temp();
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::Ord),
                    args: vec![s, i],
                    dst: Some(ir::Expr::Temp(dst)),
                });
                Ok(ir::Expr::Temp(dst))
            }
            ParseInt => {
                let recv = recv.unwrap();
                let s = self.expr(recv)?;
                let dst = self.fresh_temp();
                self.emit(ir::Stmt::Call {
                    target: Callee::Runtime(RuntimeFn::ParseInt),
                    args: vec![s],
                    dst: Some(ir::Expr::Temp(dst)),
                });
                Ok(ir::Expr::Temp(dst))
            }
        }
    }
}

/// A compile-time constant initializer, if the expression is one.
fn constant_of(e: &ast::Expr) -> Option<i64> {
    match &e.kind {
        ExprKind::Int(n) => Some(*n),
        ExprKind::Bool(b) => Some(*b as i64),
        ExprKind::Null => Some(0),
        ExprKind::Unary(UOp::Neg, inner) => constant_of(inner).map(i64::wrapping_neg),
        _ => None,
    }
}

fn fun_body(program: &ast::Program, source: FunSource) -> &[ast::Stmt] {
    match source {
        FunSource::Global { decl } => match &program.decls[decl] {
            ast::Decl::Fun(f) => &f.body,
            _ => unreachable!(),
        },
        FunSource::Method { decl, method } => match &program.decls[decl] {
            ast::Decl::Class(c) => &c.methods[method].body,
            _ => unreachable!(),
        },
        FunSource::Ctor { decl } => match &program.decls[decl] {
            ast::Decl::Class(c) => &c.ctor.as_ref().unwrap().body,
            _ => unreachable!(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::front::sema::check;
    use crate::middle::ir::dump;

    fn lower_src(src: &str) -> ir::Program {
        let ast = parse(src).unwrap();
        let env = check(&ast).unwrap();
        lower(&ast, &env).unwrap()
    }

    fn main_dump(src: &str) -> String {
        let prog = lower_src(src);
        let f = prog.funs.iter().find(|f| f.label == "_f_main").unwrap();
        dump(f)
    }

    #[test]
    fn constant_globals_bypass_init() {
        let prog = lower_src("int a = 1; int b = a + 1; int main() { return b; }");
        let init = &prog.funs[0];
        assert_eq!(init.label, "__init");
        // `a` is a compile-time constant and goes straight to .data; only
        // `b`'s initializer runs in __init.
        let assigns = init
            .body
            .iter()
            .filter(|s| matches!(s, ir::Stmt::Assign(..)))
            .count();
        assert_eq!(assigns, 1);
        assert_eq!(prog.globals[0].2, Some(1));
        assert_eq!(prog.globals[1].2, None);
    }

    #[test]
    fn short_circuit_in_value_position_uses_one_temp() {
        let text = main_dump(
            "bool f() { return true; } int main() { bool b = f() && f(); return 0; }",
        );
        // Two conditional arms assign the same temporary.
        assert!(text.contains("cjump"));
    }

    #[test]
    fn condition_context_branches_without_a_temp() {
        let text = main_dump("int main() { int a = 1; if (a < 2 && a > 0) return 1; return 0; }");
        // The fused comparison feeds the cjump directly.
        assert!(text.contains("cjump (v"), "{text}");
    }

    #[test]
    fn postfix_reads_before_writing() {
        let prog = lower_src("int main() { int a = 1; int b = a++; return b; }");
        let f = prog.funs.iter().find(|f| f.label == "_f_main").unwrap();
        // Find the increment's store and check a temp captured the old value
        // before it.
        let text = dump(f);
        let read_pos = text.find("= v").unwrap();
        let store_pos = text.rfind("+ 1)").unwrap();
        assert!(read_pos < store_pos);
    }

    #[test]
    fn new_array_allocates_count_word() {
        let text = main_dump("int main() { int[] a = new int[4]; return a.size(); }");
        assert!(text.contains("__malloc"));
        // count stored at offset 0, size read back from offset 0
        assert!(text.contains("mem[t"));
    }

    #[test]
    fn multi_dim_new_emits_a_loop() {
        let text = main_dump("int main() { int[][] a = new int[2][3]; return 0; }");
        let mallocs = text.matches("__malloc").count();
        assert_eq!(mallocs, 2, "outer allocation plus per-element allocation:\n{text}");
        assert!(text.contains("cjump"));
    }

    #[test]
    fn string_compare_goes_through_runtime() {
        let text = main_dump(r#"int main() { if ("a" < "b") return 1; return 0; }"#);
        assert!(text.contains("__strcmp"));
        assert!(text.contains("< 0"));
    }

    #[test]
    fn constructor_runs_after_allocation() {
        let text = main_dump(
            "class C { int x; C() { x = 7; } } int main() { C c = new C; return 0; }",
        );
        let malloc_pos = text.find("__malloc").unwrap();
        let ctor_pos = text.find("_c_C").unwrap();
        assert!(malloc_pos < ctor_pos);
    }

    #[test]
    fn side_effecting_rhs_hoists_lhs() {
        let text = main_dump(
            "int g = 0; int f() { g = g + 1; return g; } int main() { int a = 2; return a + f(); }",
        );
        // `a` must be copied into a temp before the call to f.
        let copy = text.find("= v").unwrap();
        let call = text.find("call _f_f").unwrap();
        assert!(copy < call, "{text}");
    }
}
