//! The lexer.

use derive_more::Display;
use regex::Regex;

use crate::common::*;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
    /// Where in the input this token starts.
    pub span: Span,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum TokenKind {
    #[display("id")]
    Ident,
    #[display("num")]
    Num,
    #[display("str")]
    Str,
    // keywords
    #[display("int")]
    Int,
    #[display("bool")]
    Bool,
    #[display("string")]
    StringTy,
    #[display("void")]
    Void,
    #[display("null")]
    Null,
    #[display("true")]
    True,
    #[display("false")]
    False,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("for")]
    For,
    #[display("break")]
    Break,
    #[display("continue")]
    Continue,
    #[display("return")]
    Return,
    #[display("new")]
    New,
    #[display("class")]
    Class,
    #[display("this")]
    This,
    // punctuation
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display(";")]
    Semi,
    #[display(",")]
    Comma,
    #[display(".")]
    Dot,
    // operators, longest first where a prefix is shared
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("<=")]
    Le,
    #[display(">=")]
    Ge,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("++")]
    PlusPlus,
    #[display("--")]
    MinusMinus,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("!")]
    Bang,
    #[display("~")]
    Tilde,
    #[display("=")]
    Assign,
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    col: u32,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;
        let m = |pat: &str, kind| (Regex::new(pat).unwrap(), kind);
        Lexer {
            input,
            pos: 0,
            line: 1,
            col: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n]|(?://[^\n]*)|(?s:/\*.*?\*/))*").unwrap(),
            matchers: vec![
                m(r"\A[0-9]+", Num),
                m(r#"\A"(?:[^"\\\n]|\\.)*""#, Str),
                m(r"\A[A-Za-z][A-Za-z0-9_]*", Ident),
                m(r"\A<<", Shl),
                m(r"\A>>", Shr),
                m(r"\A<=", Le),
                m(r"\A>=", Ge),
                m(r"\A==", EqEq),
                m(r"\A!=", Ne),
                m(r"\A&&", AndAnd),
                m(r"\A\|\|", OrOr),
                m(r"\A\+\+", PlusPlus),
                m(r"\A--", MinusMinus),
                m(r"\A<", Lt),
                m(r"\A>", Gt),
                m(r"\A\+", Plus),
                m(r"\A-", Minus),
                m(r"\A\*", Star),
                m(r"\A/", Slash),
                m(r"\A%", Percent),
                m(r"\A&", Amp),
                m(r"\A\|", Pipe),
                m(r"\A\^", Caret),
                m(r"\A!", Bang),
                m(r"\A~", Tilde),
                m(r"\A=", Assign),
                m(r"\A\(", LParen),
                m(r"\A\)", RParen),
                m(r"\A\{", LBrace),
                m(r"\A\}", RBrace),
                m(r"\A\[", LBracket),
                m(r"\A\]", RBracket),
                m(r"\A;", Semi),
                m(r"\A,", Comma),
                m(r"\A\.", Dot),
            ],
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    /// Consume `len` bytes, keeping the line:col position current.
    fn advance(&mut self, len: usize) {
        for b in self.input[self.pos..self.pos + len].bytes() {
            if b == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos += len;
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.advance(m.end());
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let span = self.span();
                let text = &rest[..m.end()];
                let kind = match *kind {
                    TokenKind::Ident => keyword(text).unwrap_or(TokenKind::Ident),
                    k => k,
                };
                self.advance(m.end());
                return Ok(Some(Token { kind, text, span }));
            }
        }
        let c = rest.chars().next().unwrap();
        Err(CompileError::semantic(
            self.span(),
            format!("unexpected character {c:?}"),
        ))
    }
}

fn keyword(text: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match text {
        "int" => Int,
        "bool" => Bool,
        "string" => StringTy,
        "void" => Void,
        "null" => Null,
        "true" => True,
        "false" => False,
        "if" => If,
        "else" => Else,
        "while" => While,
        "for" => For,
        "break" => Break,
        "continue" => Continue,
        "return" => Return,
        "new" => New,
        "class" => Class,
        "this" => This,
        _ => return None,
    })
}

/// Lex the whole input up front; the parser works over the token slice.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(t) = lexer.next()? {
        tokens.push(t);
    }
    Ok(tokens)
}

/// Decode the escapes of a string literal token (quotes included).
pub fn unescape(text: &str) -> String {
    let inner = &text[1..text.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
