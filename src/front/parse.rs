//! The parser: hand-written recursive descent with precedence climbing for
//! binary operators.

use crate::common::*;

use super::ast::*;
use super::lex::{tokenize, unescape, Token, TokenKind};

pub fn parse(input: &str) -> Result<Program> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        next_node: 0,
    };
    parser.program()
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
    next_node: NodeId,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos)
    }

    fn kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn kind_at(&self, off: usize) -> Option<TokenKind> {
        self.tokens.get(self.pos + off).map(|t| t.kind)
    }

    fn span(&self) -> Span {
        self.peek()
            .map(|t| t.span)
            .or_else(|| self.tokens.last().map(|t| t.span))
            .unwrap_or_default()
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Consume the next token if it has the given kind.
    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume the next token, which must have the given kind.
    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>> {
        match self.peek() {
            Some(&t) if t.kind == kind => {
                self.pos += 1;
                Ok(t)
            }
            Some(&t) => Err(CompileError::semantic(
                t.span,
                format!("expected '{kind}', found '{}'", t.text),
            )),
            None => Err(CompileError::semantic(
                self.span(),
                format!("expected '{kind}', found end of input"),
            )),
        }
    }

    fn ident(&mut self) -> Result<(Id, Span)> {
        let t = self.expect(TokenKind::Ident)?;
        Ok((id(t.text), t.span))
    }

    fn fresh(&mut self) -> NodeId {
        let n = self.next_node;
        self.next_node += 1;
        n
    }

    fn expr_node(&mut self, span: Span, kind: ExprKind) -> Expr {
        Expr {
            id: self.fresh(),
            span,
            kind,
        }
    }

    // ---- declarations ----

    fn program(&mut self) -> Result<Program> {
        let mut decls = Vec::new();
        while self.peek().is_some() {
            if self.at(TokenKind::Class) {
                decls.push(Decl::Class(self.class_decl()?));
            } else {
                decls.push(self.fun_or_var()?);
            }
        }
        Ok(Program { decls })
    }

    fn class_decl(&mut self) -> Result<ClassDecl> {
        let span = self.span();
        self.expect(TokenKind::Class)?;
        let (name, _) = self.ident()?;
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        let mut ctor = None;
        while !self.accept(TokenKind::RBrace) {
            // A constructor is `Name ( ... ) { ... }` with no return type.
            if self.at(TokenKind::Ident)
                && self.peek().map(|t| t.text) == Some(name.as_str())
                && self.kind_at(1) == Some(TokenKind::LParen)
            {
                let cspan = self.span();
                self.pos += 1;
                let params = self.params()?;
                let body = self.block()?;
                let decl = FunDecl {
                    ret: TyExpr {
                        base: BaseTy::Void,
                        dims: 0,
                        span: cspan,
                    },
                    name,
                    params,
                    body,
                    span: cspan,
                };
                if ctor.replace(decl).is_some() {
                    return Err(CompileError::semantic(
                        cspan,
                        format!("duplicate constructor for class '{name}'"),
                    ));
                }
                continue;
            }
            let ty = self.ty_expr()?;
            let (mname, mspan) = self.ident()?;
            if self.at(TokenKind::LParen) {
                let params = self.params()?;
                let body = self.block()?;
                methods.push(FunDecl {
                    ret: ty,
                    name: mname,
                    params,
                    body,
                    span: mspan,
                });
            } else {
                self.expect(TokenKind::Semi)?;
                let id = self.fresh();
                fields.push(VarDecl {
                    id,
                    ty,
                    name: mname,
                    init: None,
                    span: mspan,
                });
            }
        }
        self.accept(TokenKind::Semi);
        Ok(ClassDecl {
            name,
            fields,
            methods,
            ctor,
            span,
        })
    }

    fn fun_or_var(&mut self) -> Result<Decl> {
        let ty = self.ty_expr()?;
        let (name, span) = self.ident()?;
        if self.at(TokenKind::LParen) {
            let params = self.params()?;
            let body = self.block()?;
            Ok(Decl::Fun(FunDecl {
                ret: ty,
                name,
                params,
                body,
                span,
            }))
        } else {
            let init = if self.accept(TokenKind::Assign) {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect(TokenKind::Semi)?;
            let id = self.fresh();
            Ok(Decl::Var(VarDecl {
                id,
                ty,
                name,
                init,
                span,
            }))
        }
    }

    fn params(&mut self) -> Result<Vec<Param>> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if !self.accept(TokenKind::RParen) {
            loop {
                let ty = self.ty_expr()?;
                let (name, span) = self.ident()?;
                params.push(Param { ty, name, span });
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(params)
    }

    fn base_ty(&mut self) -> Result<BaseTy> {
        use TokenKind::*;
        let t = self.peek().copied().ok_or_else(|| {
            CompileError::semantic(self.span(), "expected a type, found end of input")
        })?;
        let base = match t.kind {
            Int => BaseTy::Int,
            Bool => BaseTy::Bool,
            StringTy => BaseTy::Str,
            Void => BaseTy::Void,
            Ident => BaseTy::Named(id(t.text)),
            _ => {
                return Err(CompileError::semantic(
                    t.span,
                    format!("expected a type, found '{}'", t.text),
                ))
            }
        };
        self.pos += 1;
        Ok(base)
    }

    fn ty_expr(&mut self) -> Result<TyExpr> {
        let span = self.span();
        let base = self.base_ty()?;
        let mut dims = 0;
        while self.kind() == Some(TokenKind::LBracket) && self.kind_at(1) == Some(TokenKind::RBracket)
        {
            self.pos += 2;
            dims += 1;
        }
        Ok(TyExpr { base, dims, span })
    }

    // ---- statements ----

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.accept(TokenKind::RBrace) {
            stmts.push(self.stmt()?);
        }
        Ok(stmts)
    }

    /// Does a declaration start at the current position?  A type keyword does;
    /// an identifier does when followed by another identifier, possibly with
    /// `[]` pairs in between (`T v`, `T[] v`).
    fn at_decl(&self) -> bool {
        use TokenKind::*;
        match self.kind() {
            Some(Int | Bool | StringTy) => true,
            Some(Ident) => {
                let mut off = 1;
                while self.kind_at(off) == Some(LBracket) && self.kind_at(off + 1) == Some(RBracket)
                {
                    off += 2;
                }
                self.kind_at(off) == Some(Ident)
            }
            _ => false,
        }
    }

    fn var_decl(&mut self) -> Result<VarDecl> {
        let ty = self.ty_expr()?;
        let (name, span) = self.ident()?;
        let init = if self.accept(TokenKind::Assign) {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semi)?;
        let id = self.fresh();
        Ok(VarDecl {
            id,
            ty,
            name,
            init,
            span,
        })
    }

    fn stmt(&mut self) -> Result<Stmt> {
        use TokenKind::*;
        match self.kind() {
            Some(LBrace) => Ok(Stmt::Block(self.block()?)),
            Some(If) => {
                self.pos += 1;
                self.expect(LParen)?;
                let guard = self.expr()?;
                self.expect(RParen)?;
                let tt = Box::new(self.stmt()?);
                let ff = if self.accept(Else) {
                    Some(Box::new(self.stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If { guard, tt, ff })
            }
            Some(While) => {
                self.pos += 1;
                self.expect(LParen)?;
                let guard = self.expr()?;
                self.expect(RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::While { guard, body })
            }
            Some(For) => {
                self.pos += 1;
                self.expect(LParen)?;
                let init = if self.accept(Semi) {
                    None
                } else if self.at_decl() {
                    Some(Box::new(Stmt::Decl(self.var_decl()?)))
                } else {
                    let e = self.expr()?;
                    self.expect(Semi)?;
                    Some(Box::new(Stmt::Expr(e)))
                };
                let guard = if self.at(Semi) { None } else { Some(self.expr()?) };
                self.expect(Semi)?;
                let step = if self.at(RParen) { None } else { Some(self.expr()?) };
                self.expect(RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::For {
                    init,
                    guard,
                    step,
                    body,
                })
            }
            Some(Break) => {
                let span = self.span();
                self.pos += 1;
                self.expect(Semi)?;
                Ok(Stmt::Break(span))
            }
            Some(Continue) => {
                let span = self.span();
                self.pos += 1;
                self.expect(Semi)?;
                Ok(Stmt::Continue(span))
            }
            Some(Return) => {
                let span = self.span();
                self.pos += 1;
                let value = if self.at(Semi) { None } else { Some(self.expr()?) };
                self.expect(Semi)?;
                Ok(Stmt::Return(value, span))
            }
            Some(Semi) => {
                self.pos += 1;
                Ok(Stmt::Empty)
            }
            _ if self.at_decl() => Ok(Stmt::Decl(self.var_decl()?)),
            _ => {
                let e = self.expr()?;
                self.expect(Semi)?;
                Ok(Stmt::Expr(e))
            }
        }
    }

    // ---- expressions ----

    fn expr(&mut self) -> Result<Expr> {
        self.assign()
    }

    fn assign(&mut self) -> Result<Expr> {
        let lhs = self.binary(1)?;
        if self.at(TokenKind::Assign) {
            let span = self.span();
            self.pos += 1;
            let rhs = self.assign()?;
            return Ok(self.expr_node(
                span,
                ExprKind::Assign {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            ));
        }
        Ok(lhs)
    }

    /// Left-associative binary operators by precedence climbing.
    fn binary(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = self.kind().and_then(bin_op) {
            if prec < min_prec {
                break;
            }
            let span = self.span();
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = self.expr_node(
                span,
                ExprKind::BOp {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        use TokenKind::*;
        let span = self.span();
        let kind = match self.kind() {
            Some(Minus) => {
                self.pos += 1;
                ExprKind::Unary(UOp::Neg, Box::new(self.unary()?))
            }
            Some(Bang) => {
                self.pos += 1;
                ExprKind::Unary(UOp::Not, Box::new(self.unary()?))
            }
            Some(Tilde) => {
                self.pos += 1;
                ExprKind::Unary(UOp::BNot, Box::new(self.unary()?))
            }
            Some(PlusPlus) => {
                self.pos += 1;
                ExprKind::PreIncDec {
                    inc: true,
                    target: Box::new(self.unary()?),
                }
            }
            Some(MinusMinus) => {
                self.pos += 1;
                ExprKind::PreIncDec {
                    inc: false,
                    target: Box::new(self.unary()?),
                }
            }
            _ => return self.postfix(),
        };
        Ok(self.expr_node(span, kind))
    }

    fn postfix(&mut self) -> Result<Expr> {
        use TokenKind::*;
        let mut e = self.primary()?;
        loop {
            let span = self.span();
            match self.kind() {
                Some(LBracket) => {
                    self.pos += 1;
                    let index = self.expr()?;
                    self.expect(RBracket)?;
                    e = self.expr_node(
                        span,
                        ExprKind::Index {
                            base: Box::new(e),
                            index: Box::new(index),
                        },
                    );
                }
                Some(Dot) => {
                    self.pos += 1;
                    let (name, _) = self.ident()?;
                    if self.at(LParen) {
                        let args = self.args()?;
                        e = self.expr_node(
                            span,
                            ExprKind::MethodCall {
                                recv: Box::new(e),
                                name,
                                args,
                            },
                        );
                    } else {
                        e = self.expr_node(
                            span,
                            ExprKind::Member {
                                recv: Box::new(e),
                                name,
                            },
                        );
                    }
                }
                Some(PlusPlus) => {
                    self.pos += 1;
                    e = self.expr_node(
                        span,
                        ExprKind::PostIncDec {
                            inc: true,
                            target: Box::new(e),
                        },
                    );
                }
                Some(MinusMinus) => {
                    self.pos += 1;
                    e = self.expr_node(
                        span,
                        ExprKind::PostIncDec {
                            inc: false,
                            target: Box::new(e),
                        },
                    );
                }
                _ => return Ok(e),
            }
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        if !self.accept(TokenKind::RParen) {
            loop {
                args.push(self.expr()?);
                if !self.accept(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        Ok(args)
    }

    fn new_expr(&mut self) -> Result<Expr> {
        let span = self.span();
        self.expect(TokenKind::New)?;
        let base = self.base_ty()?;
        if self.at(TokenKind::LBracket) {
            let mut dims = Vec::new();
            let mut seen_empty = false;
            while self.accept(TokenKind::LBracket) {
                if self.accept(TokenKind::RBracket) {
                    seen_empty = true;
                    dims.push(None);
                } else {
                    if seen_empty {
                        return Err(CompileError::semantic(
                            self.span(),
                            "sized array dimension after an empty one",
                        ));
                    }
                    let e = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    dims.push(Some(e));
                }
            }
            return Ok(self.expr_node(span, ExprKind::NewArray { base, dims }));
        }
        // `new T` or `new T()`: both run the constructor if one is declared.
        if self.accept(TokenKind::LParen) {
            self.expect(TokenKind::RParen)?;
        }
        match base {
            BaseTy::Named(class) => Ok(self.expr_node(span, ExprKind::NewObject { class })),
            _ => Err(CompileError::semantic(
                span,
                "only class types can be constructed with a plain 'new'",
            )),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        use TokenKind::*;
        let t = self.peek().copied().ok_or_else(|| {
            CompileError::semantic(self.span(), "expected an expression, found end of input")
        })?;
        let span = t.span;
        match t.kind {
            Num => {
                self.pos += 1;
                // Two's-complement wrap: 9223372036854775808 is i64::MIN when
                // negated, so out-of-range literals go through u64.
                let n = t
                    .text
                    .parse::<i64>()
                    .or_else(|_| t.text.parse::<u64>().map(|u| u as i64))
                    .map_err(|_| {
                        CompileError::semantic(span, format!("integer literal '{}' out of range", t.text))
                    })?;
                Ok(self.expr_node(span, ExprKind::Int(n)))
            }
            Str => {
                self.pos += 1;
                Ok(self.expr_node(span, ExprKind::Str(unescape(t.text))))
            }
            True => {
                self.pos += 1;
                Ok(self.expr_node(span, ExprKind::Bool(true)))
            }
            False => {
                self.pos += 1;
                Ok(self.expr_node(span, ExprKind::Bool(false)))
            }
            Null => {
                self.pos += 1;
                Ok(self.expr_node(span, ExprKind::Null))
            }
            This => {
                self.pos += 1;
                Ok(self.expr_node(span, ExprKind::This))
            }
            New => self.new_expr(),
            LParen => {
                self.pos += 1;
                let e = self.expr()?;
                self.expect(RParen)?;
                Ok(e)
            }
            Ident => {
                self.pos += 1;
                let name = id(t.text);
                if self.at(LParen) {
                    let args = self.args()?;
                    Ok(self.expr_node(span, ExprKind::Call { name, args }))
                } else {
                    Ok(self.expr_node(span, ExprKind::Var(name)))
                }
            }
            _ => Err(CompileError::semantic(
                span,
                format!("expected an expression, found '{}'", t.text),
            )),
        }
    }
}

fn bin_op(kind: TokenKind) -> Option<(BOp, u8)> {
    use TokenKind::*;
    Some(match kind {
        OrOr => (BOp::LOr, 1),
        AndAnd => (BOp::LAnd, 2),
        Pipe => (BOp::Or, 3),
        Caret => (BOp::Xor, 4),
        Amp => (BOp::And, 5),
        EqEq => (BOp::Eq, 6),
        Ne => (BOp::Ne, 6),
        Lt => (BOp::Lt, 7),
        Le => (BOp::Le, 7),
        Gt => (BOp::Gt, 7),
        Ge => (BOp::Ge, 7),
        Shl => (BOp::Shl, 8),
        Shr => (BOp::Shr, 8),
        Plus => (BOp::Add, 9),
        Minus => (BOp::Sub, 9),
        Star => (BOp::Mul, 10),
        Slash => (BOp::Div, 10),
        Percent => (BOp::Rem, 10),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr(src: &str) -> Expr {
        let program = parse(&format!("int main() {{ return {src}; }}")).unwrap();
        match program.decls.into_iter().next().unwrap() {
            Decl::Fun(f) => match f.body.into_iter().next().unwrap() {
                Stmt::Return(Some(e), _) => e,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn precedence() {
        let e = parse_expr("1 + 2 * 3");
        let ExprKind::BOp { op: BOp::Add, rhs, .. } = e.kind else { panic!() };
        assert!(matches!(rhs.kind, ExprKind::BOp { op: BOp::Mul, .. }));

        let e = parse_expr("1 << 2 + 3");
        assert!(matches!(e.kind, ExprKind::BOp { op: BOp::Shl, .. }));

        let e = parse_expr("a == b & c");
        let ExprKind::BOp { op: BOp::And, lhs, .. } = e.kind else { panic!() };
        assert!(matches!(lhs.kind, ExprKind::BOp { op: BOp::Eq, .. }));
    }

    #[test]
    fn assignment_is_right_associative() {
        let program = parse("int main() { a = b = 1; }").unwrap();
        let Decl::Fun(f) = &program.decls[0] else { panic!() };
        let Stmt::Expr(e) = &f.body[0] else { panic!() };
        let ExprKind::Assign { rhs, .. } = &e.kind else { panic!() };
        assert!(matches!(rhs.kind, ExprKind::Assign { .. }));
    }

    #[test]
    fn postfix_chains() {
        let e = parse_expr("a.b[1].c(2)++");
        let ExprKind::PostIncDec { inc: true, target } = e.kind else { panic!() };
        assert!(matches!(target.kind, ExprKind::MethodCall { .. }));
    }

    #[test]
    fn decl_vs_expr_lookahead() {
        // `Node n;` is a declaration, `n[0] = 1;` is an expression.
        let program = parse("int main() { Node n; n[0] = 1; Node[] m; }").unwrap();
        let Decl::Fun(f) = &program.decls[0] else { panic!() };
        assert!(matches!(f.body[0], Stmt::Decl(_)));
        assert!(matches!(f.body[1], Stmt::Expr(_)));
        assert!(matches!(f.body[2], Stmt::Decl(_)));
    }

    #[test]
    fn new_array_dimensions() {
        let e = parse_expr("new int[2][3][]");
        let ExprKind::NewArray { dims, .. } = e.kind else { panic!() };
        assert_eq!(dims.len(), 3);
        assert!(dims[0].is_some() && dims[1].is_some() && dims[2].is_none());
        // A sized dimension may not follow an empty one.
        assert!(parse("int main() { int a = new int[][3]; }").is_err());
    }

    #[test]
    fn class_with_ctor() {
        let program = parse(
            "class P { int x; P() { x = 1; } int get() { return x; } } int main() { return 0; }",
        )
        .unwrap();
        let Decl::Class(c) = &program.decls[0] else { panic!() };
        assert_eq!(c.fields.len(), 1);
        assert_eq!(c.methods.len(), 1);
        assert!(c.ctor.is_some());
    }
}
