//! Name resolution and type checking.
//!
//! Entities live in arenas addressed by small integer handles ([FunId],
//! [VarId], [ClassId]); the scope tree and all cross references use handles,
//! never owning pointers.  The checker leaves behind an [Env]: the entity
//! arenas plus per-expression side tables (type and resolution keyed by
//! [NodeId]) that the IR builder consumes.

use crate::common::*;

use super::ast::*;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct FunId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct VarId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct ClassId(pub u32);

/// Checked types.  `Null` is the type of the `null` literal only; it is
/// assignable to any reference type.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Ty {
    Int,
    Bool,
    Str,
    Void,
    Null,
    Array(Box<Ty>),
    Class(ClassId),
}

impl Ty {
    pub fn is_reference(&self) -> bool {
        matches!(self, Ty::Str | Ty::Array(_) | Ty::Class(_))
    }

    /// Can a value of type `other` be stored into a slot of this type?
    pub fn accepts(&self, other: &Ty) -> bool {
        self == other || (self.is_reference() && *other == Ty::Null)
    }
}

/// Where a variable's storage lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Storage {
    Global,
    Local,
    /// Parameter with its position; `this` is parameter 0 of methods.
    Param(usize),
    /// Class member occupying the word at `8 * index`.
    Member(usize),
}

#[derive(Debug)]
pub struct VariableEntity {
    pub name: Id,
    pub ty: Ty,
    pub storage: Storage,
}

/// Which AST node holds a function's body.
#[derive(Clone, Copy, Debug)]
pub enum FunSource {
    Global { decl: usize },
    Method { decl: usize, method: usize },
    Ctor { decl: usize },
}

#[derive(Debug)]
pub struct FunctionEntity {
    pub name: Id,
    /// Assembly label; unique across the program.
    pub label: String,
    /// Parameter entities in call order; `this` first for methods and ctors.
    pub params: Vec<VarId>,
    pub ret: Ty,
    /// Declared locals, in declaration order (parameters excluded).
    pub locals: Vec<VarId>,
    pub source: FunSource,
    pub class: Option<ClassId>,
}

#[derive(Debug)]
pub struct ClassEntity {
    pub name: Id,
    /// Field entities in declaration order; byte offset is `8 * index`.
    pub fields: Vec<VarId>,
    pub methods: Map<Id, FunId>,
    pub ctor: Option<FunId>,
}

impl ClassEntity {
    pub fn size_bytes(&self) -> i64 {
        8 * self.fields.len().max(1) as i64
    }
}

/// What a name or member use resolved to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Symbol {
    Var(VarId),
    /// Bare name inside a method that resolved to a field of `this`.
    ThisField(usize),
    Fun(FunId),
    /// Method call target; the receiver is explicit or the implicit `this`.
    Method(FunId),
    Builtin(Builtin),
    /// `recv.f` with the field's slot index.
    Field(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Builtin {
    Print,
    Println,
    PrintInt,
    PrintlnInt,
    GetString,
    GetInt,
    ToString,
    /// `a.size()` on arrays.
    Size,
    /// `s.length()`.
    Length,
    /// `s.ord(i)`.
    Ord,
    /// `s.parseInt()`.
    ParseInt,
}

/// The symbol environment: entity arenas plus per-node side tables.  Built by
/// the front end, read-only afterwards.
#[derive(Debug)]
pub struct Env {
    pub funs: Vec<FunctionEntity>,
    pub vars: Vec<VariableEntity>,
    pub classes: Vec<ClassEntity>,
    /// Globals in declaration order; their initializers run in this order.
    pub globals: Vec<VarId>,
    pub types: Map<NodeId, Ty>,
    pub uses: Map<NodeId, Symbol>,
    pub main: FunId,
}

impl Env {
    pub fn fun(&self, f: FunId) -> &FunctionEntity {
        &self.funs[f.0 as usize]
    }

    pub fn var(&self, v: VarId) -> &VariableEntity {
        &self.vars[v.0 as usize]
    }

    pub fn class(&self, c: ClassId) -> &ClassEntity {
        &self.classes[c.0 as usize]
    }

    pub fn ty(&self, node: NodeId) -> &Ty {
        &self.types[&node]
    }

    pub fn symbol(&self, node: NodeId) -> Symbol {
        self.uses[&node]
    }
}

/// Check the program, producing the symbol environment the core consumes.
pub fn check(program: &Program) -> Result<Env> {
    let mut checker = Checker::new(program);
    checker.collect()?;
    checker.check_bodies()?;
    checker.finish()
}

struct Scope {
    names: Map<Id, VarId>,
    parent: Option<usize>,
}

struct Checker<'a> {
    program: &'a Program,
    funs: Vec<FunctionEntity>,
    vars: Vec<VariableEntity>,
    classes: Vec<ClassEntity>,
    globals: Vec<VarId>,
    types: Map<NodeId, Ty>,
    uses: Map<NodeId, Symbol>,
    class_names: Map<Id, ClassId>,
    fun_names: Map<Id, FunId>,
    global_names: Map<Id, VarId>,
    scopes: Vec<Scope>,
    current_scope: Option<usize>,
    current_fun: Option<FunId>,
    loop_depth: usize,
}

impl<'a> Checker<'a> {
    fn new(program: &'a Program) -> Self {
        Checker {
            program,
            funs: Vec::new(),
            vars: Vec::new(),
            classes: Vec::new(),
            globals: Vec::new(),
            types: Map::new(),
            uses: Map::new(),
            class_names: Map::new(),
            fun_names: Map::new(),
            global_names: Map::new(),
            scopes: Vec::new(),
            current_scope: None,
            current_fun: None,
            loop_depth: 0,
        }
    }

    fn add_var(&mut self, name: Id, ty: Ty, storage: Storage) -> VarId {
        let v = VarId(self.vars.len() as u32);
        self.vars.push(VariableEntity { name, ty, storage });
        v
    }

    /// Resolve a written type against the declared classes.
    fn resolve_ty(&self, ty: &TyExpr) -> Result<Ty> {
        let base = match &ty.base {
            BaseTy::Int => Ty::Int,
            BaseTy::Bool => Ty::Bool,
            BaseTy::Str => Ty::Str,
            BaseTy::Void => Ty::Void,
            BaseTy::Named(name) => match self.class_names.get(name) {
                Some(&c) => Ty::Class(c),
                None => {
                    return Err(CompileError::semantic(
                        ty.span,
                        format!("undeclared type '{name}'"),
                    ))
                }
            },
        };
        if ty.dims == 0 {
            return Ok(base);
        }
        if base == Ty::Void {
            return Err(CompileError::semantic(ty.span, "array of void"));
        }
        let mut t = base;
        for _ in 0..ty.dims {
            t = Ty::Array(Box::new(t));
        }
        Ok(t)
    }

    // ---- pass 1: signatures ----

    fn collect(&mut self) -> Result<()> {
        // Class names first so signatures can mention any class.
        for decl in &self.program.decls {
            if let Decl::Class(c) = decl {
                let cid = ClassId(self.classes.len() as u32);
                if self.class_names.insert(c.name, cid).is_some() {
                    return Err(CompileError::semantic(
                        c.span,
                        format!("duplicate class '{}'", c.name),
                    ));
                }
                self.classes.push(ClassEntity {
                    name: c.name,
                    fields: Vec::new(),
                    methods: Map::new(),
                    ctor: None,
                });
            }
        }

        for (decl_idx, decl) in self.program.decls.iter().enumerate() {
            match decl {
                Decl::Var(v) => {
                    let ty = self.resolve_ty(&v.ty)?;
                    if ty == Ty::Void {
                        return Err(CompileError::semantic(v.span, "variable of type void"));
                    }
                    let vid = self.add_var(v.name, ty, Storage::Global);
                    self.uses.insert(v.id, Symbol::Var(vid));
                    if self.global_names.insert(v.name, vid).is_some() {
                        return Err(CompileError::semantic(
                            v.span,
                            format!("duplicate global variable '{}'", v.name),
                        ));
                    }
                    self.globals.push(vid);
                }
                Decl::Fun(f) => {
                    let fid = self.declare_fun(
                        f,
                        format!("_f_{}", f.name),
                        None,
                        FunSource::Global { decl: decl_idx },
                    )?;
                    if self.fun_names.insert(f.name, fid).is_some() {
                        return Err(CompileError::semantic(
                            f.span,
                            format!("duplicate function '{}'", f.name),
                        ));
                    }
                }
                Decl::Class(c) => {
                    let cid = self.class_names[&c.name];
                    let mut fields = Vec::new();
                    let mut field_names = Set::new();
                    for field in &c.fields {
                        let ty = self.resolve_ty(&field.ty)?;
                        if ty == Ty::Void {
                            return Err(CompileError::semantic(field.span, "field of type void"));
                        }
                        if !field_names.insert(field.name) {
                            return Err(CompileError::semantic(
                                field.span,
                                format!("duplicate field '{}'", field.name),
                            ));
                        }
                        let idx = fields.len();
                        fields.push(self.add_var(field.name, ty, Storage::Member(idx)));
                    }
                    self.classes[cid.0 as usize].fields = fields;

                    for (m_idx, m) in c.methods.iter().enumerate() {
                        let fid = self.declare_fun(
                            m,
                            format!("_m_{}_{}", c.name, m.name),
                            Some(cid),
                            FunSource::Method {
                                decl: decl_idx,
                                method: m_idx,
                            },
                        )?;
                        if self.classes[cid.0 as usize]
                            .methods
                            .insert(m.name, fid)
                            .is_some()
                        {
                            return Err(CompileError::semantic(
                                m.span,
                                format!("duplicate method '{}'", m.name),
                            ));
                        }
                    }
                    if let Some(ctor) = &c.ctor {
                        let fid = self.declare_fun(
                            ctor,
                            format!("_c_{}", c.name),
                            Some(cid),
                            FunSource::Ctor { decl: decl_idx },
                        )?;
                        self.classes[cid.0 as usize].ctor = Some(fid);
                    }
                }
            }
        }

        match self.fun_names.get(&id("main")) {
            Some(&main) if self.funs[main.0 as usize].ret == Ty::Int => Ok(()),
            Some(&main) => {
                let span = match self.funs[main.0 as usize].source {
                    FunSource::Global { decl } => match &self.program.decls[decl] {
                        Decl::Fun(f) => f.span,
                        _ => Span::default(),
                    },
                    _ => Span::default(),
                };
                Err(CompileError::semantic(span, "'main' must return int"))
            }
            None => Err(CompileError::semantic(
                Span::default(),
                "missing function 'main'",
            )),
        }
    }

    fn declare_fun(
        &mut self,
        f: &FunDecl,
        label: String,
        class: Option<ClassId>,
        source: FunSource,
    ) -> Result<FunId> {
        let ret = self.resolve_ty(&f.ret)?;
        let mut params = Vec::new();
        if let Some(cid) = class {
            params.push(self.add_var(id("this"), Ty::Class(cid), Storage::Param(0)));
        }
        for p in &f.params {
            let ty = self.resolve_ty(&p.ty)?;
            if ty == Ty::Void {
                return Err(CompileError::semantic(p.span, "parameter of type void"));
            }
            let pos = params.len();
            params.push(self.add_var(p.name, ty, Storage::Param(pos)));
        }
        let fid = FunId(self.funs.len() as u32);
        self.funs.push(FunctionEntity {
            name: f.name,
            label,
            params,
            ret,
            locals: Vec::new(),
            source,
            class,
        });
        Ok(fid)
    }

    // ---- pass 2: bodies ----

    fn check_bodies(&mut self) -> Result<()> {
        // Global initializers are checked in the context of no function; they
        // may reference earlier globals and call functions.
        for decl in self.program.decls.iter() {
            if let Decl::Var(v) = decl {
                if let Some(init) = &v.init {
                    let want = self.resolve_ty(&v.ty)?;
                    let got = self.expr(init)?;
                    if !want.accepts(&got) {
                        return Err(CompileError::semantic(
                            init.span,
                            format!("initializer type mismatch for '{}'", v.name),
                        ));
                    }
                }
            }
        }

        for fid in (0..self.funs.len()).map(|i| FunId(i as u32)) {
            self.check_fun(fid)?;
        }
        Ok(())
    }

    fn fun_body(&self, fid: FunId) -> &'a FunDecl {
        match self.funs[fid.0 as usize].source {
            FunSource::Global { decl } => match &self.program.decls[decl] {
                Decl::Fun(f) => f,
                _ => unreachable!(),
            },
            FunSource::Method { decl, method } => match &self.program.decls[decl] {
                Decl::Class(c) => &c.methods[method],
                _ => unreachable!(),
            },
            FunSource::Ctor { decl } => match &self.program.decls[decl] {
                Decl::Class(c) => c.ctor.as_ref().unwrap(),
                _ => unreachable!(),
            },
        }
    }

    fn check_fun(&mut self, fid: FunId) -> Result<()> {
        let f = self.fun_body(fid);
        self.current_fun = Some(fid);
        self.scopes.clear();
        self.current_scope = None;
        self.push_scope();
        let params = self.funs[fid.0 as usize].params.clone();
        for p in params {
            let name = self.vars[p.0 as usize].name;
            self.declare(name, p, f.span)?;
        }
        self.push_scope();
        for stmt in &f.body {
            self.stmt(stmt)?;
        }
        self.pop_scope();
        self.pop_scope();
        self.current_fun = None;
        Ok(())
    }

    fn push_scope(&mut self) {
        let s = Scope {
            names: Map::new(),
            parent: self.current_scope,
        };
        self.scopes.push(s);
        self.current_scope = Some(self.scopes.len() - 1);
    }

    fn pop_scope(&mut self) {
        let cur = self.current_scope.expect("scope underflow");
        self.current_scope = self.scopes[cur].parent;
    }

    fn declare(&mut self, name: Id, v: VarId, span: Span) -> Result<()> {
        let cur = self.current_scope.expect("no open scope");
        if self.scopes[cur].names.insert(name, v).is_some() {
            return Err(CompileError::semantic(
                span,
                format!("duplicate declaration of '{name}'"),
            ));
        }
        Ok(())
    }

    /// Look a bare name up: lexical scopes, then fields of the enclosing
    /// class, then globals.
    fn lookup(&self, name: Id) -> Option<Symbol> {
        let mut scope = self.current_scope;
        while let Some(s) = scope {
            if let Some(&v) = self.scopes[s].names.get(&name) {
                return Some(Symbol::Var(v));
            }
            scope = self.scopes[s].parent;
        }
        if let Some(cid) = self.current_class() {
            let class = &self.classes[cid.0 as usize];
            for (idx, &field) in class.fields.iter().enumerate() {
                if self.vars[field.0 as usize].name == name {
                    return Some(Symbol::ThisField(idx));
                }
            }
        }
        self.global_names.get(&name).map(|&v| Symbol::Var(v))
    }

    fn current_class(&self) -> Option<ClassId> {
        self.current_fun
            .and_then(|f| self.funs[f.0 as usize].class)
    }

    // ---- statements ----

    fn stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(stmts) => {
                self.push_scope();
                for s in stmts {
                    self.stmt(s)?;
                }
                self.pop_scope();
            }
            Stmt::Decl(v) => {
                let ty = self.resolve_ty(&v.ty)?;
                if ty == Ty::Void {
                    return Err(CompileError::semantic(v.span, "variable of type void"));
                }
                if let Some(init) = &v.init {
                    let got = self.expr(init)?;
                    if !ty.accepts(&got) {
                        return Err(CompileError::semantic(
                            init.span,
                            format!("initializer type mismatch for '{}'", v.name),
                        ));
                    }
                }
                let vid = self.add_var(v.name, ty, Storage::Local);
                let fid = self.current_fun.expect("local outside a function");
                self.funs[fid.0 as usize].locals.push(vid);
                self.uses.insert(v.id, Symbol::Var(vid));
                self.declare(v.name, vid, v.span)?;
            }
            Stmt::If { guard, tt, ff } => {
                self.guard(guard)?;
                self.stmt(tt)?;
                if let Some(ff) = ff {
                    self.stmt(ff)?;
                }
            }
            Stmt::While { guard, body } => {
                self.guard(guard)?;
                self.loop_depth += 1;
                self.stmt(body)?;
                self.loop_depth -= 1;
            }
            Stmt::For {
                init,
                guard,
                step,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                if let Some(guard) = guard {
                    self.guard(guard)?;
                }
                if let Some(step) = step {
                    self.expr(step)?;
                }
                self.loop_depth += 1;
                self.stmt(body)?;
                self.loop_depth -= 1;
                self.pop_scope();
            }
            Stmt::Break(span) | Stmt::Continue(span) if self.loop_depth == 0 => {
                return Err(CompileError::semantic(*span, "not inside a loop"));
            }
            Stmt::Break(_) | Stmt::Continue(_) => {}
            Stmt::Return(value, span) => {
                let fid = self.current_fun.ok_or_else(|| {
                    CompileError::semantic(*span, "return outside a function")
                })?;
                let ret = self.funs[fid.0 as usize].ret.clone();
                match value {
                    None if ret == Ty::Void => {}
                    None => {
                        return Err(CompileError::semantic(*span, "missing return value"));
                    }
                    Some(e) => {
                        let got = self.expr(e)?;
                        if ret == Ty::Void {
                            return Err(CompileError::semantic(
                                *span,
                                "value returned from a void function",
                            ));
                        }
                        if !ret.accepts(&got) {
                            return Err(CompileError::semantic(*span, "return type mismatch"));
                        }
                    }
                }
            }
            Stmt::Expr(e) => {
                self.expr(e)?;
            }
            Stmt::Empty => {}
        }
        Ok(())
    }

    fn guard(&mut self, e: &Expr) -> Result<()> {
        if self.expr(e)? != Ty::Bool {
            return Err(CompileError::semantic(e.span, "condition must be bool"));
        }
        Ok(())
    }

    // ---- expressions ----

    fn is_lvalue(&self, e: &Expr) -> bool {
        match &e.kind {
            ExprKind::Var(_) => matches!(
                self.uses.get(&e.id),
                Some(Symbol::Var(_) | Symbol::ThisField(_))
            ),
            ExprKind::Member { .. } | ExprKind::Index { .. } => true,
            _ => false,
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<Ty> {
        let ty = self.expr_kind(e)?;
        self.types.insert(e.id, ty.clone());
        Ok(ty)
    }

    fn expr_kind(&mut self, e: &Expr) -> Result<Ty> {
        match &e.kind {
            ExprKind::Int(_) => Ok(Ty::Int),
            ExprKind::Str(_) => Ok(Ty::Str),
            ExprKind::Bool(_) => Ok(Ty::Bool),
            ExprKind::Null => Ok(Ty::Null),
            ExprKind::This => match self.current_class() {
                Some(c) => Ok(Ty::Class(c)),
                None => Err(CompileError::semantic(e.span, "'this' outside a method")),
            },
            ExprKind::Var(name) => match self.lookup(*name) {
                Some(sym) => {
                    self.uses.insert(e.id, sym);
                    match sym {
                        Symbol::Var(v) => Ok(self.vars[v.0 as usize].ty.clone()),
                        Symbol::ThisField(idx) => {
                            let cid = self.current_class().unwrap();
                            let field = self.classes[cid.0 as usize].fields[idx];
                            Ok(self.vars[field.0 as usize].ty.clone())
                        }
                        _ => unreachable!(),
                    }
                }
                None => Err(CompileError::semantic(
                    e.span,
                    format!("undeclared name '{name}'"),
                )),
            },
            ExprKind::Unary(op, operand) => {
                let ty = self.expr(operand)?;
                let (want, produce) = match op {
                    UOp::Neg | UOp::BNot => (Ty::Int, Ty::Int),
                    UOp::Not => (Ty::Bool, Ty::Bool),
                };
                if ty != want {
                    return Err(CompileError::semantic(e.span, "operand type mismatch"));
                }
                Ok(produce)
            }
            ExprKind::PreIncDec { target, .. } | ExprKind::PostIncDec { target, .. } => {
                let ty = self.expr(target)?;
                if !self.is_lvalue(target) {
                    return Err(CompileError::semantic(
                        e.span,
                        "increment target is not an lvalue",
                    ));
                }
                if ty != Ty::Int {
                    return Err(CompileError::semantic(e.span, "increment target must be int"));
                }
                Ok(Ty::Int)
            }
            ExprKind::BOp { op, lhs, rhs } => {
                let lt = self.expr(lhs)?;
                let rt = self.expr(rhs)?;
                self.binary_ty(*op, &lt, &rt, e.span)
            }
            ExprKind::Assign { lhs, rhs } => {
                let lt = self.expr(lhs)?;
                let rt = self.expr(rhs)?;
                if !self.is_lvalue(lhs) {
                    return Err(CompileError::semantic(
                        e.span,
                        "assignment target is not an lvalue",
                    ));
                }
                if !lt.accepts(&rt) {
                    return Err(CompileError::semantic(e.span, "assignment type mismatch"));
                }
                Ok(lt)
            }
            ExprKind::Call { name, args } => {
                // Inside a class, methods of the class shadow global functions.
                if let Some(cid) = self.current_class() {
                    if let Some(m) = self.classes[cid.0 as usize].methods.get(name).copied() {
                        self.uses.insert(e.id, Symbol::Method(m));
                        return self.check_call_args(m, args, true, e.span);
                    }
                }
                if let Some(b) = builtin_fun(*name) {
                    self.uses.insert(e.id, Symbol::Builtin(b));
                    return self.check_builtin(b, None, args, e.span);
                }
                match self.fun_names.get(name).copied() {
                    Some(f) => {
                        self.uses.insert(e.id, Symbol::Fun(f));
                        self.check_call_args(f, args, false, e.span)
                    }
                    None => Err(CompileError::semantic(
                        e.span,
                        format!("undeclared function '{name}'"),
                    )),
                }
            }
            ExprKind::MethodCall { recv, name, args } => {
                let recv_ty = self.expr(recv)?;
                match recv_ty {
                    Ty::Class(cid) => {
                        match self.classes[cid.0 as usize].methods.get(name).copied() {
                            Some(m) => {
                                self.uses.insert(e.id, Symbol::Method(m));
                                self.check_call_args(m, args, true, e.span)
                            }
                            None => Err(CompileError::semantic(
                                e.span,
                                format!("no method '{name}' on this class"),
                            )),
                        }
                    }
                    Ty::Array(_) if name.as_str() == "size" => {
                        self.uses.insert(e.id, Symbol::Builtin(Builtin::Size));
                        self.check_builtin(Builtin::Size, Some(&recv_ty), args, e.span)
                    }
                    Ty::Str => {
                        let b = match name.as_str() {
                            "length" => Builtin::Length,
                            "ord" => Builtin::Ord,
                            "parseInt" => Builtin::ParseInt,
                            _ => {
                                return Err(CompileError::semantic(
                                    e.span,
                                    format!("no method '{name}' on string"),
                                ))
                            }
                        };
                        self.uses.insert(e.id, Symbol::Builtin(b));
                        self.check_builtin(b, Some(&recv_ty), args, e.span)
                    }
                    _ => Err(CompileError::semantic(
                        e.span,
                        format!("no method '{name}' on this type"),
                    )),
                }
            }
            ExprKind::Member { recv, name } => {
                let recv_ty = self.expr(recv)?;
                let Ty::Class(cid) = recv_ty else {
                    return Err(CompileError::semantic(
                        e.span,
                        "member access on a non-class value",
                    ));
                };
                let class = &self.classes[cid.0 as usize];
                for (idx, &field) in class.fields.iter().enumerate() {
                    if self.vars[field.0 as usize].name == *name {
                        self.uses.insert(e.id, Symbol::Field(idx));
                        return Ok(self.vars[field.0 as usize].ty.clone());
                    }
                }
                Err(CompileError::semantic(
                    e.span,
                    format!("no field '{name}' on this class"),
                ))
            }
            ExprKind::Index { base, index } => {
                let base_ty = self.expr(base)?;
                let index_ty = self.expr(index)?;
                if index_ty != Ty::Int {
                    return Err(CompileError::semantic(e.span, "array index must be int"));
                }
                match base_ty {
                    Ty::Array(elem) => Ok(*elem),
                    _ => Err(CompileError::semantic(e.span, "indexing a non-array value")),
                }
            }
            ExprKind::NewObject { class } => match self.class_names.get(class).copied() {
                Some(c) => Ok(Ty::Class(c)),
                None => Err(CompileError::semantic(
                    e.span,
                    format!("undeclared class '{class}'"),
                )),
            },
            ExprKind::NewArray { base, dims } => {
                let base_ty = self.resolve_ty(&TyExpr {
                    base: base.clone(),
                    dims: 0,
                    span: e.span,
                })?;
                if base_ty == Ty::Void {
                    return Err(CompileError::semantic(e.span, "array of void"));
                }
                if dims.is_empty() || dims[0].is_none() {
                    return Err(CompileError::semantic(
                        e.span,
                        "first array dimension must be sized",
                    ));
                }
                for d in dims.iter().flatten() {
                    if self.expr(d)? != Ty::Int {
                        return Err(CompileError::semantic(
                            d.span,
                            "array dimension must be int",
                        ));
                    }
                }
                let mut t = base_ty;
                for _ in 0..dims.len() {
                    t = Ty::Array(Box::new(t));
                }
                Ok(t)
            }
        }
    }

    fn binary_ty(&self, op: BOp, lt: &Ty, rt: &Ty, span: Span) -> Result<Ty> {
        use BOp::*;
        let both = |t: &Ty| *lt == *t && *rt == *t;
        match op {
            Add => {
                if both(&Ty::Int) {
                    Ok(Ty::Int)
                } else if both(&Ty::Str) {
                    Ok(Ty::Str)
                } else {
                    Err(CompileError::semantic(span, "operands of '+' must both be int or both string"))
                }
            }
            Sub | Mul | Div | Rem | And | Or | Xor | Shl | Shr => {
                if both(&Ty::Int) {
                    Ok(Ty::Int)
                } else {
                    Err(CompileError::semantic(span, "operands must be int"))
                }
            }
            Lt | Le | Gt | Ge => {
                if both(&Ty::Int) || both(&Ty::Str) {
                    Ok(Ty::Bool)
                } else {
                    Err(CompileError::semantic(span, "operands must both be int or both string"))
                }
            }
            Eq | Ne => {
                let ok = lt == rt
                    || (lt.is_reference() && *rt == Ty::Null)
                    || (*lt == Ty::Null && rt.is_reference())
                    || (*lt == Ty::Null && *rt == Ty::Null);
                if ok && *lt != Ty::Void {
                    Ok(Ty::Bool)
                } else {
                    Err(CompileError::semantic(span, "equality operand type mismatch"))
                }
            }
            LAnd | LOr => {
                if both(&Ty::Bool) {
                    Ok(Ty::Bool)
                } else {
                    Err(CompileError::semantic(span, "operands must be bool"))
                }
            }
        }
    }

    fn check_call_args(
        &mut self,
        f: FunId,
        args: &[Expr],
        method: bool,
        span: Span,
    ) -> Result<Ty> {
        let skip = if method { 1 } else { 0 };
        let params: Vec<Ty> = self.funs[f.0 as usize]
            .params
            .iter()
            .skip(skip)
            .map(|&p| self.vars[p.0 as usize].ty.clone())
            .collect();
        if params.len() != args.len() {
            return Err(CompileError::semantic(
                span,
                format!("expected {} argument(s), found {}", params.len(), args.len()),
            ));
        }
        for (want, arg) in params.iter().zip(args) {
            let got = self.expr(arg)?;
            if !want.accepts(&got) {
                return Err(CompileError::semantic(arg.span, "argument type mismatch"));
            }
        }
        Ok(self.funs[f.0 as usize].ret.clone())
    }

    fn check_builtin(
        &mut self,
        b: Builtin,
        _recv: Option<&Ty>,
        args: &[Expr],
        span: Span,
    ) -> Result<Ty> {
        use Builtin::*;
        let (params, ret): (&[Ty], Ty) = match b {
            Print | Println => (&[Ty::Str], Ty::Void),
            PrintInt | PrintlnInt => (&[Ty::Int], Ty::Void),
            GetString => (&[], Ty::Str),
            GetInt => (&[], Ty::Int),
            ToString => (&[Ty::Int], Ty::Str),
            Size | Length | ParseInt => (&[], Ty::Int),
            Ord => (&[Ty::Int], Ty::Int),
        };
        if params.len() != args.len() {
            return Err(CompileError::semantic(
                span,
                format!("expected {} argument(s), found {}", params.len(), args.len()),
            ));
        }
        for (want, arg) in params.iter().zip(args) {
            let got = self.expr(arg)?;
            if !want.accepts(&got) {
                return Err(CompileError::semantic(arg.span, "argument type mismatch"));
            }
        }
        Ok(ret)
    }

    fn finish(self) -> Result<Env> {
        let main = self.fun_names[&id("main")];
        Ok(Env {
            funs: self.funs,
            vars: self.vars,
            classes: self.classes,
            globals: self.globals,
            types: self.types,
            uses: self.uses,
            main,
        })
    }
}

fn builtin_fun(name: Id) -> Option<Builtin> {
    use Builtin::*;
    Some(match name.as_str() {
        "print" => Print,
        "println" => Println,
        "printInt" => PrintInt,
        "printlnInt" => PrintlnInt,
        "getString" => GetString,
        "getInt" => GetInt,
        "toString" => ToString,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;

    fn check_src(src: &str) -> Result<Env> {
        check(&parse(src).unwrap())
    }

    fn err_msg(src: &str) -> String {
        check_src(src).unwrap_err().to_string()
    }

    #[test]
    fn accepts_a_small_program() {
        let env = check_src(
            "int g = 3;
             class Node { int v; Node next; int get() { return v; } }
             int main() { Node n = new Node; n.v = g; return n.get(); }",
        )
        .unwrap();
        assert_eq!(env.globals.len(), 1);
        assert_eq!(env.classes.len(), 1);
        // this + declared params
        assert_eq!(env.fun(env.class(ClassId(0)).methods[&id("get")]).params.len(), 1);
    }

    #[test]
    fn rejects_undeclared_and_duplicates() {
        assert!(err_msg("int main() { return x; }").contains("undeclared name"));
        assert!(err_msg("int main() { int a; int a; return 0; }").contains("duplicate"));
        assert!(err_msg("int f() { return 0; } int f() { return 1; } int main() { return 0; }")
            .contains("duplicate function"));
    }

    #[test]
    fn rejects_type_mismatches() {
        assert!(err_msg("int main() { int a = true; return 0; }").contains("mismatch"));
        assert!(err_msg("int main() { if (1) return 0; return 0; }").contains("bool"));
        assert!(err_msg("bool main() { return true; }").contains("main"));
        assert!(err_msg("int main() { return \"s\" - \"t\"; }").contains("int"));
    }

    #[test]
    fn rejects_non_lvalue_targets() {
        assert!(err_msg("int main() { 1 = 2; return 0; }").contains("lvalue"));
        assert!(err_msg("int main() { (1 + 2)++; return 0; }").contains("lvalue"));
    }

    #[test]
    fn null_is_assignable_to_references_only() {
        assert!(check_src("int main() { string s = null; return 0; }").is_ok());
        assert!(check_src("int main() { int a = null; return 0; }").is_err());
        assert!(check_src(
            "class C {} int main() { C c = null; if (c == null) return 1; return 0; }"
        )
        .is_ok());
    }

    #[test]
    fn loop_control_needs_a_loop() {
        assert!(err_msg("int main() { break; return 0; }").contains("loop"));
        assert!(check_src("int main() { while (true) break; return 0; }").is_ok());
    }

    #[test]
    fn resolves_implicit_this_field() {
        let env = check_src(
            "class C { int ct; int bump() { ct = ct + 1; return ct; } } int main() { return 0; }",
        )
        .unwrap();
        let uses: Vec<_> = env.uses.values().collect();
        assert!(uses.iter().any(|s| matches!(s, Symbol::ThisField(0))));
    }

    #[test]
    fn member_offsets_follow_declaration_order() {
        let env = check_src(
            "class P { int a; int b; bool c; } int main() { P p; return p.b; }",
        )
        .unwrap();
        let field_sym = env
            .uses
            .values()
            .find(|s| matches!(s, Symbol::Field(_)))
            .unwrap();
        assert_eq!(*field_sym, Symbol::Field(1));
    }
}
