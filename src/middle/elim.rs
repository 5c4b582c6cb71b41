//! Output-irrelevant elimination.
//!
//! An AST-level dead-code pass: an assignment to a local whose value can
//! never flow into an output call (nor any other observable effect) is
//! removed before lowering.  The analysis is a use-closure run to fixpoint:
//! every appearance of a variable outside the target slot of a removable
//! assignment counts as a use, so removing one assignment can expose the
//! next.  Memory writes, calls, and trapping arithmetic are always kept.

use crate::common::*;
use crate::front::ast::{self, has_effects, may_trap, ExprKind};
use crate::front::sema::{Env, Storage, Symbol, VarId};

/// One elimination decision, for `--print-remove` reporting.
#[derive(Debug, PartialEq, Eq)]
pub struct Removal {
    pub span: Span,
    pub name: Id,
}

impl std::fmt::Display for Removal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remove {}: assignment to '{}'", self.span, self.name)
    }
}

/// Run the pass over every function body, mutating the AST in place.
pub fn eliminate(program: &mut ast::Program, env: &Env) -> Vec<Removal> {
    let mut removed = Vec::new();
    for decl in &mut program.decls {
        match decl {
            ast::Decl::Fun(f) => eliminate_fun(&mut f.body, env, &mut removed),
            ast::Decl::Class(c) => {
                for m in &mut c.methods {
                    eliminate_fun(&mut m.body, env, &mut removed);
                }
                if let Some(ctor) = &mut c.ctor {
                    eliminate_fun(&mut ctor.body, env, &mut removed);
                }
            }
            ast::Decl::Var(_) => {}
        }
    }
    removed
}

fn eliminate_fun(body: &mut [ast::Stmt], env: &Env, removed: &mut Vec<Removal>) {
    loop {
        let mut used = Set::new();
        for stmt in body.iter() {
            collect_stmt(stmt, env, &mut used);
        }
        let mut changed = false;
        for stmt in body.iter_mut() {
            changed |= sweep(stmt, env, &used, removed);
        }
        if !changed {
            break;
        }
    }
}

/// The local a statement assigns, when the statement is a candidate for
/// removal: a plain `x = e;` or `T x = e;` with a pure, non-trapping
/// right-hand side.
fn removable_target(stmt: &ast::Stmt, env: &Env) -> Option<(VarId, Span, Id)> {
    match stmt {
        ast::Stmt::Expr(e) => {
            let ExprKind::Assign { lhs, rhs } = &e.kind else {
                return None;
            };
            if has_effects(rhs) || may_trap(rhs) {
                return None;
            }
            let ExprKind::Var(name) = &lhs.kind else {
                return None;
            };
            match env.symbol(lhs.id) {
                Symbol::Var(v) if env.var(v).storage == Storage::Local => {
                    Some((v, e.span, *name))
                }
                _ => None,
            }
        }
        ast::Stmt::Decl(v) => {
            let init = v.init.as_ref()?;
            if has_effects(init) || may_trap(init) {
                return None;
            }
            match env.symbol(v.id) {
                Symbol::Var(vid) => Some((vid, v.span, v.name)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Record every variable use that can reach an observable effect.  Targets
/// of removable assignments do not count; everything else does.
fn collect_stmt(stmt: &ast::Stmt, env: &Env, used: &mut Set<VarId>) {
    if removable_target(stmt, env).is_some() {
        // Only the right-hand side contributes uses; the write itself is
        // not a use of the target.
        let rhs = match stmt {
            ast::Stmt::Expr(e) => match &e.kind {
                ExprKind::Assign { rhs, .. } => rhs,
                _ => unreachable!(),
            },
            ast::Stmt::Decl(v) => v.init.as_ref().unwrap(),
            _ => unreachable!(),
        };
        collect_expr(rhs, env, used);
        return;
    }
    match stmt {
        ast::Stmt::Block(stmts) => {
            for s in stmts {
                collect_stmt(s, env, used);
            }
        }
        ast::Stmt::Decl(v) => {
            if let Some(init) = &v.init {
                collect_expr(init, env, used);
            }
        }
        ast::Stmt::If { guard, tt, ff } => {
            collect_expr(guard, env, used);
            collect_stmt(tt, env, used);
            if let Some(ff) = ff {
                collect_stmt(ff, env, used);
            }
        }
        ast::Stmt::While { guard, body } => {
            collect_expr(guard, env, used);
            collect_stmt(body, env, used);
        }
        ast::Stmt::For {
            init,
            guard,
            step,
            body,
        } => {
            if let Some(init) = init {
                collect_stmt(init, env, used);
            }
            if let Some(guard) = guard {
                collect_expr(guard, env, used);
            }
            if let Some(step) = step {
                collect_expr(step, env, used);
            }
            collect_stmt(body, env, used);
        }
        ast::Stmt::Return(Some(e), _) => collect_expr(e, env, used),
        ast::Stmt::Expr(e) => collect_expr(e, env, used),
        _ => {}
    }
}

fn collect_expr(e: &ast::Expr, env: &Env, used: &mut Set<VarId>) {
    match &e.kind {
        ExprKind::Var(_) => {
            if let Some(Symbol::Var(v)) = env.uses.get(&e.id) {
                used.insert(*v);
            }
        }
        ExprKind::Unary(_, inner) => collect_expr(inner, env, used),
        ExprKind::PreIncDec { target, .. } | ExprKind::PostIncDec { target, .. } => {
            collect_expr(target, env, used)
        }
        ExprKind::BOp { lhs, rhs, .. } | ExprKind::Assign { lhs, rhs } => {
            collect_expr(lhs, env, used);
            collect_expr(rhs, env, used);
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                collect_expr(a, env, used);
            }
        }
        ExprKind::MethodCall { recv, args, .. } => {
            collect_expr(recv, env, used);
            for a in args {
                collect_expr(a, env, used);
            }
        }
        ExprKind::Member { recv, .. } => collect_expr(recv, env, used),
        ExprKind::Index { base, index } => {
            collect_expr(base, env, used);
            collect_expr(index, env, used);
        }
        ExprKind::NewArray { dims, .. } => {
            for d in dims.iter().flatten() {
                collect_expr(d, env, used);
            }
        }
        _ => {}
    }
}

/// Replace dead assignments with empty statements, recursing into the
/// statement tree.  Returns whether anything was removed.
fn sweep(stmt: &mut ast::Stmt, env: &Env, used: &Set<VarId>, removed: &mut Vec<Removal>) -> bool {
    if let Some((target, span, name)) = removable_target(stmt, env) {
        if !used.contains(&target) {
            removed.push(Removal { span, name });
            *stmt = ast::Stmt::Empty;
            return true;
        }
        return false;
    }
    match stmt {
        ast::Stmt::Block(stmts) => {
            let mut changed = false;
            for s in stmts {
                changed |= sweep(s, env, used, removed);
            }
            changed
        }
        ast::Stmt::If { tt, ff, .. } => {
            let mut changed = sweep(tt, env, used, removed);
            if let Some(ff) = ff {
                changed |= sweep(ff, env, used, removed);
            }
            changed
        }
        ast::Stmt::While { body, .. } => sweep(body, env, used, removed),
        ast::Stmt::For { init, body, .. } => {
            let mut changed = false;
            if let Some(init) = init {
                changed |= sweep(init, env, used, removed);
            }
            changed |= sweep(body, env, used, removed);
            changed
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse::parse;
    use crate::front::sema::check;

    fn run(src: &str) -> (ast::Program, Vec<Removal>) {
        let mut program = parse(src).unwrap();
        let env = check(&program).unwrap();
        let removed = eliminate(&mut program, &env);
        (program, removed)
    }

    #[test]
    fn removes_chain_of_dead_assignments() {
        let (_, removed) = run(
            "int main() { int a = 1; int b = a + 2; int c = 3; printlnInt(c); return 0; }",
        );
        // b is dead, which makes a dead too; c flows into output.
        let names: Vec<String> = removed.iter().map(|r| r.name.to_string()).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(!names.contains(&"c".to_string()));
    }

    #[test]
    fn keeps_effectful_right_hand_sides() {
        let (_, removed) = run(
            "int g = 0;
             int bump() { g = g + 1; return g; }
             int main() { int dead = bump(); printlnInt(g); return 0; }",
        );
        assert!(removed.is_empty());
    }

    #[test]
    fn keeps_values_reaching_a_condition() {
        let (_, removed) = run(
            "int main() { int a = 1; if (a > 0) printlnInt(1); return 0; }",
        );
        assert!(removed.is_empty());
    }

    #[test]
    fn keeps_trapping_arithmetic() {
        let (_, removed) = run("int main() { int z = 0; int a = 5 / z; return 0; }");
        // `a` is dead but its initializer may trap; only statements with no
        // observable effect are dropped.
        assert!(removed.iter().all(|r| r.name.to_string() != "a"));
    }

    #[test]
    fn keeps_member_stores() {
        let (_, removed) = run(
            "class C { int x; }
             int main() { C c = new C; c.x = 5; return 0; }",
        );
        assert!(removed.is_empty());
    }
}
