//! The three-address IR.
//!
//! Statements are flat; expressions may nest but stay pure: anything with a
//! side effect (calls, allocation) is a statement that writes a temporary.
//! Addresses are ordinary expressions, so a load is `Mem(addr)` and a store
//! is an [Stmt::Assign] whose left-hand side is a `Mem`.

use derive_more::Display;

use crate::common::*;
use crate::front::sema::{FunId, VarId};

/// A compiler temporary.  Not strictly single-assignment, but every temp is
/// written before it is read on every path.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display("t{_0}")]
pub struct Temp(pub u32);

/// A jump target, unique across the whole program.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display(".L{_0}")]
pub struct Label(pub u32);

/// Index into the program string-literal table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
#[display("_s_{_0}")]
pub struct StrId(pub u32);

#[derive(Debug)]
pub struct Program {
    pub funs: Vec<Function>,
    /// Deduplicated string literals; emitted length-prefixed in `.data`.
    pub strings: Vec<String>,
    /// Globals with their data labels and compile-time constant initializers
    /// (those go to `.data`; the rest are zeroed in `.bss`).
    pub globals: Vec<(VarId, String, Option<i64>)>,
    /// First unused label id; later stages mint labels from here.
    pub next_label: u32,
}

#[derive(Debug)]
pub struct Function {
    /// The front-end entity, or `None` for the implicit global initializer.
    pub fun: Option<FunId>,
    /// Assembly label.
    pub label: String,
    pub params: Vec<VarId>,
    /// Declared local count; drives the naive-allocator fallback.
    pub locals: usize,
    pub body: Vec<Stmt>,
    /// Number of temporaries allocated while lowering this function.
    pub temps: u32,
}

#[derive(Debug, Display)]
pub enum Stmt {
    #[display("{_0} = {_1}")]
    Assign(Expr, Expr),
    /// Branch to the first label when the condition is non-zero.
    #[display("cjump {_0} ? {_1} : {_2}")]
    CJump(Expr, Label, Label),
    #[display("jump {_0}")]
    Jump(Label),
    #[display("{_0}:")]
    Label(Label),
    #[display("return{}", _0.as_ref().map(|e| format!(" {e}")).unwrap_or_default())]
    Return(Option<Expr>),
    #[display(
        "{}call {target}({})",
        dst.as_ref().map(|d| format!("{d} = ")).unwrap_or_default(),
        args.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
    )]
    Call {
        target: Callee,
        args: Vec<Expr>,
        dst: Option<Expr>,
    },
    /// Evaluate for nothing; kept so passes may drop operands of discarded
    /// expressions without special cases.
    #[display("discard {_0}")]
    ExprStmt(Expr),
}

#[derive(Debug, Display, Clone)]
pub enum Expr {
    #[display("{_0}")]
    Const(i64),
    /// Address of a string literal.
    #[display("&{_0}")]
    Str(StrId),
    #[display("{_0}")]
    Temp(Temp),
    /// A named variable: local, parameter, or global.
    #[display("v{}", _0.0)]
    Var(VarId),
    #[display("({_1} {_0} {_2})")]
    Binary(BinOp, Box<Expr>, Box<Expr>),
    #[display("({_0}{_1})")]
    Unary(UnOp, Box<Expr>),
    /// 64-bit load from the address.
    #[display("mem[{_0}]")]
    Mem(Box<Expr>),
}

impl Expr {
    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Add, Box::new(lhs), Box::new(rhs))
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(BinOp::Mul, Box::new(lhs), Box::new(rhs))
    }

    pub fn mem(addr: Expr) -> Expr {
        Expr::Mem(Box::new(addr))
    }

    /// Is this expression a legal assignment target?
    pub fn is_lvalue(&self) -> bool {
        matches!(self, Expr::Temp(_) | Expr::Var(_) | Expr::Mem(_))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum BinOp {
    #[display("+")]
    Add,
    #[display("-")]
    Sub,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("%")]
    Rem,
    #[display("&")]
    And,
    #[display("|")]
    Or,
    #[display("^")]
    Xor,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("==")]
    Eq,
    #[display("!=")]
    Ne,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        use BinOp::*;
        matches!(self, Lt | Le | Gt | Ge | Eq | Ne)
    }

    /// Constant-fold the operation; division by a zero constant stays
    /// unfolded so the runtime trap is preserved.
    pub fn fold(self, a: i64, b: i64) -> Option<i64> {
        use BinOp::*;
        Some(match self {
            Add => a.wrapping_add(b),
            Sub => a.wrapping_sub(b),
            Mul => a.wrapping_mul(b),
            Div if b != 0 => a.wrapping_div(b),
            Rem if b != 0 => a.wrapping_rem(b),
            Div | Rem => return None,
            And => a & b,
            Or => a | b,
            Xor => a ^ b,
            Shl => a.wrapping_shl(b as u32 & 63),
            Shr => a.wrapping_shr(b as u32 & 63),
            Lt => (a < b) as i64,
            Le => (a <= b) as i64,
            Gt => (a > b) as i64,
            Ge => (a >= b) as i64,
            Eq => (a == b) as i64,
            Ne => (a != b) as i64,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum UnOp {
    #[display("-")]
    Neg,
    #[display("~")]
    BNot,
    /// Logical negation of a 0/1 value.
    #[display("!")]
    Not,
}

/// Call targets: user functions or the runtime library.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
pub enum Callee {
    /// A user function with its assembly label.
    #[display("{_1}")]
    Fun(FunId, String),
    #[display("{_0}")]
    Runtime(RuntimeFn),
}

/// The externs the generated program links against.  `printf`/`puts` are
/// libc; the rest come with the runtime object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Display)]
pub enum RuntimeFn {
    #[display("__malloc")]
    Malloc,
    #[display("__printInt")]
    PrintInt,
    #[display("__printlnInt")]
    PrintlnInt,
    #[display("printf")]
    Printf,
    #[display("puts")]
    Puts,
    #[display("getString")]
    GetString,
    #[display("getInt")]
    GetInt,
    #[display("toString")]
    ToString,
    #[display("__strcat")]
    StrConcat,
    #[display("__strcmp")]
    StrCmp,
    #[display("__parseInt")]
    ParseInt,
    #[display("__ord")]
    Ord,
}

impl RuntimeFn {
    /// printf is variadic under the System V ABI: the caller must zero `al`.
    pub fn is_variadic(self) -> bool {
        matches!(self, RuntimeFn::Printf)
    }
}

/// Render a function body for `--print-ins` style dumps and tests.
pub fn dump(f: &Function) -> String {
    let mut out = format!("{}:\n", f.label);
    for stmt in &f.body {
        match stmt {
            Stmt::Label(_) => out.push_str(&format!("{stmt}\n")),
            _ => out.push_str(&format!("    {stmt}\n")),
        }
    }
    out
}
