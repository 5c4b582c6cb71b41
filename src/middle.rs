//! The middle-end: the three-address IR and the AST-level elimination pass.

pub mod elim;
pub mod ir;
