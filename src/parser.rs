// File: src/parser.rs
//
// Recursive-descent parser building the `ast::Program` the compiler (§4.4)
// consumes. Lexing/parsing are out of scope for the core per §1 — this is
// one concrete front end; any other parser producing the same `ast` shapes
// plugs in identically.

use crate::ast::{
    Arg, ArrayPatternElement, BinOpKind, Expr, ExprKind, FuncDecl, ListElement, MapEntry, MapKey,
    ObjectPatternField, Param, Pattern, Program, Stmt, StmtKind, SwitchCase, UnaryOpKind,
};
use crate::errors::SourceLocation;
use crate::lexer::{Token, TokenKind};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub pos: SourceLocation,
}

type PResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    pub fn parse_program(&mut self) -> PResult<Program> {
        let mut body = Vec::new();
        self.skip_semicolons();
        while !self.at_eof() {
            body.push(self.parse_stmt()?);
            self.skip_semicolons();
        }
        Ok(Program { body })
    }

    // --- token stream helpers ------------------------------------------------

    fn at_eof(&self) -> bool {
        matches!(self.tokens[self.pos].kind, TokenKind::Eof)
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_pos(&self) -> SourceLocation {
        self.tokens[self.pos].pos
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn is_sym(&self, s: &str) -> bool {
        matches!(self.peek(), TokenKind::Symbol(sym) if sym == s)
    }

    fn is_kw(&self, k: &str) -> bool {
        matches!(self.peek(), TokenKind::Keyword(kw) if kw == k)
    }

    fn eat_sym(&mut self, s: &str) -> bool {
        if self.is_sym(s) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, k: &str) -> bool {
        if self.is_kw(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, s: &str) -> PResult<()> {
        if self.eat_sym(s) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", s)))
        }
    }

    fn expect_kw(&mut self, k: &str) -> PResult<()> {
        if self.eat_kw(k) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", k)))
        }
    }

    fn expect_ident(&mut self) -> PResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.err("expected identifier".to_string())),
        }
    }

    fn err(&self, message: String) -> ParseError {
        ParseError { message, pos: self.peek_pos() }
    }

    fn skip_semicolons(&mut self) {
        while self.eat_sym(";") {}
    }

    // --- statements ------------------------------------------------------------

    fn parse_block_stmts(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_sym("{")?;
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !self.is_sym("}") {
            if self.at_eof() {
                return Err(self.err("unterminated block, expected '}'".to_string()));
            }
            stmts.push(self.parse_stmt()?);
            self.skip_semicolons();
        }
        self.expect_sym("}")?;
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let pos = self.peek_pos();
        if self.is_kw("let") {
            return self.parse_let(pos);
        }
        if self.is_kw("const") {
            return self.parse_const(pos);
        }
        if self.is_kw("function") {
            return self.parse_func_decl(pos);
        }
        if self.is_kw("return") {
            self.advance();
            let expr = if self.is_sym(";") || self.is_sym("}") || self.at_eof() {
                None
            } else {
                Some(self.parse_expr()?)
            };
            return Ok(Stmt { kind: StmtKind::Return(expr), pos });
        }
        if self.is_kw("throw") {
            self.advance();
            let expr = self.parse_expr()?;
            return Ok(Stmt { kind: StmtKind::Throw(expr), pos });
        }
        if self.is_kw("while") {
            return self.parse_while(pos);
        }
        if self.is_kw("for") {
            return self.parse_for(pos);
        }
        if self.is_kw("break") {
            self.advance();
            return Ok(Stmt { kind: StmtKind::Break, pos });
        }
        if self.is_kw("continue") {
            self.advance();
            return Ok(Stmt { kind: StmtKind::Continue, pos });
        }
        if self.is_sym("{") {
            let body = self.parse_block_stmts()?;
            return Ok(Stmt { kind: StmtKind::Block(body), pos });
        }
        self.parse_expr_or_assign_stmt(pos)
    }

    fn parse_let(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        self.advance(); // let
        let pattern = self.parse_pattern()?;
        self.expect_sym("=")?;
        let value = self.parse_expr()?;
        Ok(Stmt { kind: StmtKind::Let { pattern, value }, pos })
    }

    fn parse_const(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        self.advance(); // const
        let name = self.expect_ident()?;
        self.expect_sym("=")?;
        let value = self.parse_expr()?;
        Ok(Stmt { kind: StmtKind::Const { name, value }, pos })
    }

    fn parse_while(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        self.advance(); // while
        self.expect_sym("(")?;
        let cond = self.parse_expr()?;
        self.expect_sym(")")?;
        let body = self.parse_block_stmts()?;
        Ok(Stmt { kind: StmtKind::While { cond, body }, pos })
    }

    fn parse_for(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        self.advance(); // for
        let has_parens = self.eat_sym("(");
        let binding = self.expect_ident()?;
        self.expect_kw("in")?;
        let iterable = self.parse_expr()?;
        if has_parens {
            self.expect_sym(")")?;
        }
        let body = self.parse_block_stmts()?;
        Ok(Stmt { kind: StmtKind::For { binding, iterable, body }, pos })
    }

    fn parse_func_decl(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        let decl = self.parse_func_literal(true)?;
        Ok(Stmt { kind: StmtKind::FuncDecl(decl), pos })
    }

    /// An expression statement, or — if the parsed expression is a valid
    /// assignment target followed by `=`/`op=` — an assignment (§4.4).
    fn parse_expr_or_assign_stmt(&mut self, pos: SourceLocation) -> PResult<Stmt> {
        let expr = self.parse_expr()?;
        let compound = ["+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>="];
        if self.is_sym("=") {
            self.advance();
            let value = self.parse_expr()?;
            return Ok(Stmt { kind: StmtKind::Assign { target: expr, op: None, value }, pos });
        }
        for sym in compound {
            if self.is_sym(sym) {
                self.advance();
                let value = self.parse_expr()?;
                let op = compound_op(sym);
                return Ok(Stmt { kind: StmtKind::Assign { target: expr, op: Some(op), value }, pos });
            }
        }
        Ok(Stmt { kind: StmtKind::Expr(expr), pos })
    }

    // --- patterns ----------------------------------------------------------------

    fn parse_pattern(&mut self) -> PResult<Pattern> {
        if self.is_sym("{") {
            return self.parse_object_pattern();
        }
        if self.is_sym("[") {
            return self.parse_array_pattern();
        }
        let name = self.expect_ident()?;
        if name == "_" {
            Ok(Pattern::Blank)
        } else {
            Ok(Pattern::Name(name))
        }
    }

    fn parse_object_pattern(&mut self) -> PResult<Pattern> {
        self.expect_sym("{")?;
        let mut fields = Vec::new();
        while !self.is_sym("}") {
            let key = self.expect_ident()?;
            let binding = if self.eat_sym(":") { self.parse_pattern()? } else { Pattern::Name(key.clone()) };
            let default = if self.eat_sym("=") { Some(self.parse_expr()?) } else { None };
            fields.push(ObjectPatternField { key, binding, default });
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym("}")?;
        Ok(Pattern::Object(fields))
    }

    fn parse_array_pattern(&mut self) -> PResult<Pattern> {
        self.expect_sym("[")?;
        let mut elements = Vec::new();
        while !self.is_sym("]") {
            let binding = self.parse_pattern()?;
            let default = if self.eat_sym("=") { Some(self.parse_expr()?) } else { None };
            elements.push(ArrayPatternElement { binding, default });
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym("]")?;
        Ok(Pattern::Array(elements))
    }

    // --- functions -----------------------------------------------------------------

    fn parse_func_literal(&mut self, named: bool) -> PResult<FuncDecl> {
        let pos = self.peek_pos();
        self.expect_kw("function")?;
        let name = if named { Some(self.expect_ident()?) } else if let TokenKind::Ident(_) = self.peek() {
            Some(self.expect_ident()?)
        } else {
            None
        };
        self.expect_sym("(")?;
        let mut params = Vec::new();
        let mut rest_param = None;
        while !self.is_sym(")") {
            if self.eat_sym("...") {
                rest_param = Some(self.expect_ident()?);
                break;
            }
            let pattern = self.parse_pattern()?;
            let default = if self.eat_sym("=") { Some(self.parse_expr()?) } else { None };
            params.push(Param { pattern, default });
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym(")")?;
        let body_start = self.peek_pos();
        let body = self.parse_block_stmts()?;
        let body_end = self.peek_pos();
        Ok(FuncDecl {
            name,
            params,
            rest_param,
            body,
            pos,
            body_span: (body_start.line as usize, body_end.line as usize),
        })
    }

    // --- expressions -------------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_pipe()
    }

    fn parse_pipe(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let first = self.parse_coalesce()?;
        if !self.is_sym("|") {
            return Ok(first);
        }
        let mut stages = vec![first];
        while self.eat_sym("|") {
            stages.push(self.parse_coalesce()?);
        }
        Ok(Expr { kind: ExprKind::Pipe(stages), pos })
    }

    fn parse_coalesce(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_or()?;
        while self.eat_sym("??") {
            let right = self.parse_or()?;
            left = Expr { kind: ExprKind::Coalesce(Box::new(left), Box::new(right)), pos };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_and()?;
        while self.eat_sym("||") {
            let right = self.parse_and()?;
            left = Expr { kind: ExprKind::Or(Box::new(left), Box::new(right)), pos };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_equality()?;
        while self.eat_sym("&&") {
            let right = self.parse_equality()?;
            left = Expr { kind: ExprKind::And(Box::new(left), Box::new(right)), pos };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.eat_sym("==") {
                BinOpKind::Eq
            } else if self.eat_sym("!=") {
                BinOpKind::Ne
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, pos };
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_shift()?;
        loop {
            let op = if self.eat_sym("<=") {
                BinOpKind::Le
            } else if self.eat_sym(">=") {
                BinOpKind::Ge
            } else if self.eat_sym("<") {
                BinOpKind::Lt
            } else if self.eat_sym(">") {
                BinOpKind::Gt
            } else if self.eat_kw("in") {
                BinOpKind::Contains
            } else {
                break;
            };
            let right = self.parse_shift()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, pos };
        }
        Ok(left)
    }

    fn parse_shift(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_bitxor()?;
        loop {
            let op = if self.eat_sym("<<") {
                BinOpKind::LShift
            } else if self.eat_sym(">>") {
                BinOpKind::RShift
            } else {
                break;
            };
            let right = self.parse_bitxor()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, pos };
        }
        Ok(left)
    }

    fn parse_bitxor(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_bitand()?;
        while self.eat_sym("^") {
            let right = self.parse_bitand()?;
            left = Expr {
                kind: ExprKind::Binary { op: BinOpKind::BitXor, left: Box::new(left), right: Box::new(right) },
                pos,
            };
        }
        Ok(left)
    }

    fn parse_bitand(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_additive()?;
        while self.eat_sym("&") {
            let right = self.parse_additive()?;
            left = Expr {
                kind: ExprKind::Binary { op: BinOpKind::BitAnd, left: Box::new(left), right: Box::new(right) },
                pos,
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = if self.eat_sym("+") {
                BinOpKind::Add
            } else if self.eat_sym("-") {
                BinOpKind::Sub
            } else {
                break;
            };
            let right = self.parse_multiplicative()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, pos };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let mut left = self.parse_power()?;
        loop {
            let op = if self.eat_sym("*") {
                BinOpKind::Mul
            } else if self.eat_sym("/") {
                BinOpKind::Div
            } else if self.eat_sym("%") {
                BinOpKind::Mod
            } else {
                break;
            };
            let right = self.parse_power()?;
            left = Expr { kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) }, pos };
        }
        Ok(left)
    }

    /// Right-associative: `2 ** 3 ** 2 == 2 ** (3 ** 2)`.
    fn parse_power(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        let base = self.parse_unary()?;
        if self.eat_sym("**") {
            let exp = self.parse_power()?;
            return Ok(Expr {
                kind: ExprKind::Binary { op: BinOpKind::Pow, left: Box::new(base), right: Box::new(exp) },
                pos,
            });
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        if self.eat_sym("!") {
            let expr = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnaryOpKind::Not, expr: Box::new(expr) }, pos });
        }
        if self.eat_sym("-") {
            let expr = self.parse_unary()?;
            return Ok(Expr { kind: ExprKind::Unary { op: UnaryOpKind::Negate, expr: Box::new(expr) }, pos });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let pos = self.peek_pos();
            if self.eat_sym("(") {
                let args = self.parse_args()?;
                expr = Expr { kind: ExprKind::Call { callee: Box::new(expr), args }, pos };
            } else if self.is_sym(".") || self.is_sym("?.") {
                let optional = self.is_sym("?.");
                self.advance();
                let name = self.expect_ident()?;
                if self.eat_sym("(") {
                    let args = self.parse_args()?;
                    expr = Expr {
                        kind: ExprKind::ObjectCall { target: Box::new(expr), optional, method: name, args },
                        pos,
                    };
                } else {
                    expr = Expr { kind: ExprKind::Attr { target: Box::new(expr), name, optional }, pos };
                }
            } else if self.eat_sym("[") {
                expr = self.parse_index_or_slice(expr, pos)?;
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_index_or_slice(&mut self, target: Expr, pos: SourceLocation) -> PResult<Expr> {
        if self.eat_sym(":") {
            let high = if self.is_sym("]") { None } else { Some(Box::new(self.parse_expr()?)) };
            self.expect_sym("]")?;
            return Ok(Expr { kind: ExprKind::Slice { target: Box::new(target), low: None, high }, pos });
        }
        let first = self.parse_expr()?;
        if self.eat_sym(":") {
            let high = if self.is_sym("]") { None } else { Some(Box::new(self.parse_expr()?)) };
            self.expect_sym("]")?;
            return Ok(Expr {
                kind: ExprKind::Slice { target: Box::new(target), low: Some(Box::new(first)), high },
                pos,
            });
        }
        self.expect_sym("]")?;
        Ok(Expr { kind: ExprKind::Index { target: Box::new(target), index: Box::new(first) }, pos })
    }

    fn parse_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.is_sym(")") {
            if self.eat_sym("...") {
                args.push(Arg::Spread(self.parse_expr()?));
            } else {
                args.push(Arg::Positional(self.parse_expr()?));
            }
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym(")")?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        match self.peek().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Int(n), pos })
            }
            TokenKind::Float(n) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Float(n), pos })
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr { kind: ExprKind::Str(s), pos })
            }
            TokenKind::Keyword(k) if k == "true" => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(true), pos })
            }
            TokenKind::Keyword(k) if k == "false" => {
                self.advance();
                Ok(Expr { kind: ExprKind::Bool(false), pos })
            }
            TokenKind::Keyword(k) if k == "nil" => {
                self.advance();
                Ok(Expr { kind: ExprKind::Nil, pos })
            }
            TokenKind::Keyword(k) if k == "function" => {
                let decl = self.parse_func_literal(false)?;
                Ok(Expr { kind: ExprKind::Func(decl), pos })
            }
            TokenKind::Keyword(k) if k == "if" => self.parse_if_expr(),
            TokenKind::Keyword(k) if k == "switch" => self.parse_switch_expr(),
            TokenKind::Keyword(k) if k == "try" => self.parse_try_expr(),
            TokenKind::Ident(name) => {
                self.advance();
                if name == "_" {
                    Ok(Expr { kind: ExprKind::Blank, pos })
                } else {
                    Ok(Expr { kind: ExprKind::Identifier(name), pos })
                }
            }
            TokenKind::Symbol(s) if s == "(" => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_sym(")")?;
                Ok(expr)
            }
            TokenKind::Symbol(s) if s == "[" => self.parse_list_lit(pos),
            TokenKind::Symbol(s) if s == "{" => self.parse_map_lit(pos),
            TokenKind::Symbol(s) if s == "..." => {
                self.advance();
                let inner = self.parse_expr()?;
                Ok(Expr { kind: ExprKind::Spread(Box::new(inner)), pos })
            }
            other => Err(self.err(format!("unexpected token {:?}", other))),
        }
    }

    fn parse_list_lit(&mut self, pos: SourceLocation) -> PResult<Expr> {
        self.expect_sym("[")?;
        let mut elements = Vec::new();
        while !self.is_sym("]") {
            if self.eat_sym("...") {
                elements.push(ListElement::Spread(self.parse_expr()?));
            } else {
                elements.push(ListElement::Item(self.parse_expr()?));
            }
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym("]")?;
        Ok(Expr { kind: ExprKind::ListLit(elements), pos })
    }

    fn parse_map_lit(&mut self, pos: SourceLocation) -> PResult<Expr> {
        self.expect_sym("{")?;
        let mut entries = Vec::new();
        while !self.is_sym("}") {
            if self.eat_sym("...") {
                entries.push(MapEntry::Spread(self.parse_expr()?));
            } else if self.eat_sym("[") {
                let key_expr = self.parse_expr()?;
                self.expect_sym("]")?;
                self.expect_sym(":")?;
                let value = self.parse_expr()?;
                entries.push(MapEntry::Pair(MapKey::Computed(key_expr), value));
            } else {
                let key = self.expect_ident()?;
                let value = if self.eat_sym(":") {
                    self.parse_expr()?
                } else {
                    Expr { kind: ExprKind::Identifier(key.clone()), pos: self.peek_pos() }
                };
                entries.push(MapEntry::Pair(MapKey::Name(key), value));
            }
            if !self.eat_sym(",") {
                break;
            }
        }
        self.expect_sym("}")?;
        Ok(Expr { kind: ExprKind::MapLit(entries), pos })
    }

    fn parse_if_expr(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        self.expect_kw("if")?;
        self.expect_sym("(")?;
        let cond = self.parse_expr()?;
        self.expect_sym(")")?;
        let then_branch = self.parse_block_stmts()?;
        let else_branch = if self.eat_kw("else") {
            if self.is_kw("if") {
                let pos2 = self.peek_pos();
                let inner = self.parse_if_expr()?;
                Some(vec![Stmt { kind: StmtKind::Expr(inner), pos: pos2 }])
            } else {
                Some(self.parse_block_stmts()?)
            }
        } else {
            None
        };
        Ok(Expr { kind: ExprKind::If { cond: Box::new(cond), then_branch, else_branch }, pos })
    }

    fn parse_switch_expr(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        self.expect_kw("switch")?;
        self.expect_sym("(")?;
        let value = self.parse_expr()?;
        self.expect_sym(")")?;
        self.expect_sym("{")?;
        let mut cases = Vec::new();
        let mut default = None;
        loop {
            if self.eat_kw("case") {
                let mut tests = vec![self.parse_expr()?];
                while self.eat_sym(",") {
                    tests.push(self.parse_expr()?);
                }
                self.expect_sym(":")?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase { tests, body });
            } else if self.eat_kw("default") {
                self.expect_sym(":")?;
                default = Some(self.parse_case_body()?);
            } else {
                break;
            }
        }
        self.expect_sym("}")?;
        Ok(Expr { kind: ExprKind::Switch { value: Box::new(value), cases, default }, pos })
    }

    /// A `case`/`default` body runs until the next `case`/`default`/`}` —
    /// there is no nested brace, unlike `if`/`while` bodies.
    fn parse_case_body(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        self.skip_semicolons();
        while !self.is_kw("case") && !self.is_kw("default") && !self.is_sym("}") {
            if self.at_eof() {
                return Err(self.err("unterminated switch, expected '}'".to_string()));
            }
            stmts.push(self.parse_stmt()?);
            self.skip_semicolons();
        }
        Ok(stmts)
    }

    fn parse_try_expr(&mut self) -> PResult<Expr> {
        let pos = self.peek_pos();
        self.expect_kw("try")?;
        let try_body = self.parse_block_stmts()?;
        let mut catch_var = None;
        let mut catch_body = None;
        if self.eat_kw("catch") {
            if self.eat_sym("(") {
                catch_var = Some(self.expect_ident()?);
                self.expect_sym(")")?;
            } else if let TokenKind::Ident(_) = self.peek() {
                catch_var = Some(self.expect_ident()?);
            }
            catch_body = Some(self.parse_block_stmts()?);
        }
        let finally_body = if self.eat_kw("finally") { Some(self.parse_block_stmts()?) } else { None };
        Ok(Expr { kind: ExprKind::Try { try_body, catch_var, catch_body, finally_body }, pos })
    }
}

fn compound_op(sym: &str) -> BinOpKind {
    match sym {
        "+=" => BinOpKind::Add,
        "-=" => BinOpKind::Sub,
        "*=" => BinOpKind::Mul,
        "/=" => BinOpKind::Div,
        "%=" => BinOpKind::Mod,
        "**=" => BinOpKind::Pow,
        "<<=" => BinOpKind::LShift,
        ">>=" => BinOpKind::RShift,
        _ => unreachable!("exhaustive over the `compound` list in parse_expr_or_assign_stmt"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;

    fn parse(src: &str) -> Program {
        let tokens = tokenize(src);
        Parser::new(tokens).parse_program().unwrap()
    }

    #[test]
    fn parses_arithmetic_precedence() {
        let prog = parse("1 + 2 * 3");
        assert_eq!(prog.body.len(), 1);
        match &prog.body[0].kind {
            StmtKind::Expr(Expr { kind: ExprKind::Binary { op: BinOpKind::Add, right, .. }, .. }) => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinOpKind::Mul, .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_let_and_function_and_call() {
        let prog = parse("function fact(n) { if (n <= 1) { return 1 } return n * fact(n - 1) } fact(5)");
        assert_eq!(prog.body.len(), 2);
        assert!(matches!(prog.body[0].kind, StmtKind::FuncDecl(_)));
    }

    #[test]
    fn parses_destructuring_let() {
        let prog = parse("let {a, b = 10} = {a: 1}");
        match &prog.body[0].kind {
            StmtKind::Let { pattern: Pattern::Object(fields), .. } => {
                assert_eq!(fields.len(), 2);
                assert!(fields[1].default.is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_pipe_into_partial_calls() {
        let prog = parse("[1, 2, 3] | len");
        assert!(matches!(&prog.body[0].kind, StmtKind::Expr(Expr { kind: ExprKind::Pipe(stages), .. }) if stages.len() == 2));
    }
}
