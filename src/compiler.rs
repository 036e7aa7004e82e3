// File: src/compiler.rs
//
// Two-pass bytecode compiler. Pass 1 forward-declares every top-level named
// function so mutual and forward recursion resolve; pass 2 walks the AST and
// lowers it into bytecode through `builder::CodeBuilder`, threading a
// `symbol::SymbolTable` for scope resolution and closure capture.
//
// The compiler's only input is an `ast::Program` plus a `CompilerConfig` —
// it knows nothing about source text beyond what it needs for diagnostics.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use crate::ast::{
    Arg, BinOpKind, Expr, ExprKind, FuncDecl, ListElement, MapEntry, MapKey, Pattern, Program,
    Stmt, StmtKind, UnaryOpKind,
};
use crate::builder::CodeBuilder;
use crate::bytecode::{Code, Constant, ExceptionHandler, FunctionTemplate};
use crate::errors::{render_diagnostic, SourceLocation};
use crate::opcode::{BinaryOpKind, CompareOpKind, Opcode, PLACEHOLDER};
use crate::symbol::{Resolution, Scope, ScopeKind, Symbol, SymbolTable};

/// Maximum positional parameters a single function may declare. Chosen so a
/// call's argument count always fits comfortably in the `Call` opcode's
/// `u16` operand; see `CompileError::ParameterLimitExceeded`.
const MAX_PARAMS: usize = 255;

/// Compile-time configuration: the host-provided global names (resolved as
/// ordinary global symbols ahead of compilation) plus the filename/source
/// text embedded in the produced `Code` and used for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    pub global_names: Vec<String>,
    pub filename: String,
    pub source: String,
}

impl CompilerConfig {
    pub fn new(filename: impl Into<String>, source: impl Into<String>) -> Self {
        Self { global_names: Vec::new(), filename: filename.into(), source: source.into() }
    }

    pub fn with_global_names(mut self, names: Vec<String>) -> Self {
        self.global_names = names;
        self
    }
}

#[derive(Debug, Clone)]
pub enum CompileErrorKind {
    SyntaxError { message: String },
    UndefinedName { name: String, suggestion: Option<String> },
    Redefinition { name: String },
    ConstantAssignment { name: String },
    InvalidDefault { param: String },
    ParameterLimitExceeded,
    ConstantLimitExceeded,
    JumpTooFar,
    NestedPipe,
    SpreadInPipe,
    ReturnOutsideFunction,
    BlankIdentifierRead,
}

/// A positioned compile failure, carrying enough context (filename, source
/// line) to render itself the same way `RuntimeError` does, via
/// `errors::render_diagnostic`.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub location: SourceLocation,
    pub filename: String,
    pub source_line: Option<String>,
}

impl CompileError {
    fn message(&self) -> String {
        match &self.kind {
            CompileErrorKind::SyntaxError { message } => message.clone(),
            CompileErrorKind::UndefinedName { name, .. } => format!("undefined name '{}'", name),
            CompileErrorKind::Redefinition { name } => {
                format!("'{}' is already declared in this scope", name)
            }
            CompileErrorKind::ConstantAssignment { name } => {
                format!("cannot assign to '{}': declared with const", name)
            }
            CompileErrorKind::InvalidDefault { param } => {
                format!("default value for parameter '{}' must be a literal", param)
            }
            CompileErrorKind::ParameterLimitExceeded => {
                format!("function declares more than {} parameters", MAX_PARAMS)
            }
            CompileErrorKind::ConstantLimitExceeded => {
                "too many constants in one code block".to_string()
            }
            CompileErrorKind::JumpTooFar => "jump target too far to encode".to_string(),
            CompileErrorKind::NestedPipe => "a pipe stage cannot itself be a pipe".to_string(),
            CompileErrorKind::SpreadInPipe => "spread arguments are not allowed in a pipe stage".to_string(),
            CompileErrorKind::ReturnOutsideFunction => "'return' outside a function".to_string(),
            CompileErrorKind::BlankIdentifierRead => "'_' cannot be read, only assigned".to_string(),
        }
    }

    fn suggestion(&self) -> Option<&str> {
        match &self.kind {
            CompileErrorKind::UndefinedName { suggestion, .. } => suggestion.as_deref(),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render_diagnostic(
            f,
            "compile error",
            &self.message(),
            &self.filename,
            self.location,
            self.source_line.as_deref(),
            self.suggestion(),
            None,
            None,
        )
    }
}

impl std::error::Error for CompileError {}

/// Per-loop bookkeeping: where `continue` jumps back to, and the positions of
/// `break`'s forward jumps still waiting to be patched to the loop's exit.
struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<usize>,
}

pub struct Compiler {
    config: CompilerConfig,
    builders: Vec<CodeBuilder>,
    tables: Vec<Rc<RefCell<SymbolTable>>>,
    next_function_id: u32,
    next_child_index: Vec<u32>,
    loop_stack: Vec<LoopCtx>,
    pass1_names: HashSet<String>,
}

/// Compiles a whole program: forward-declares top-level functions, then
/// lowers every statement into the root `Code`.
pub fn compile_program(program: &Program, config: CompilerConfig) -> Result<Rc<Code>, CompileError> {
    let mut compiler = Compiler::new(config);
    compiler.run(program)
}

impl Compiler {
    fn new(config: CompilerConfig) -> Self {
        let root_table = SymbolTable::new_root();
        for name in &config.global_names {
            // Host-supplied names are assumed unique; a colliding entry is a
            // host configuration bug, not a script error.
            let _ = SymbolTable::insert_variable(&root_table, name);
        }
        let mut root_builder =
            CodeBuilder::new("root".to_string(), 0, config.filename.clone(), config.source.clone());
        root_builder.set_env_keys(config.global_names.clone());

        Compiler {
            config,
            builders: vec![root_builder],
            tables: vec![root_table],
            next_function_id: 1,
            next_child_index: vec![0],
            loop_stack: Vec::new(),
            pass1_names: HashSet::new(),
        }
    }

    fn run(&mut self, program: &Program) -> Result<Rc<Code>, CompileError> {
        for stmt in &program.body {
            if let StmtKind::FuncDecl(decl) = &stmt.kind {
                let name = decl.name.as_ref().expect("a declaration-form function is always named");
                SymbolTable::insert_constant(&self.tables[0], name)
                    .map_err(|_| self.err(CompileErrorKind::Redefinition { name: name.clone() }, stmt.pos))?;
                self.pass1_names.insert(name.clone());
            }
        }

        self.compile_stmt_list(&program.body)?;

        let end_pos = program.body.last().map(|s| s.pos).unwrap_or_else(SourceLocation::zero);
        self.emit0(Opcode::ReturnValue, end_pos);

        let root_table = self.tables[0].clone();
        let global_count = SymbolTable::local_count(&root_table) as u16;
        self.builders[0].set_global_names(SymbolTable::own_names(&root_table));
        let root_builder = self.builders.pop().expect("root builder always present");
        Ok(root_builder.freeze(0, global_count))
    }

    // --- small accessors -------------------------------------------------

    fn current_builder(&mut self) -> &mut CodeBuilder {
        self.builders.last_mut().expect("at least the root builder is always on the stack")
    }

    fn position(&mut self) -> usize {
        self.current_builder().position()
    }

    fn current_table(&self) -> Rc<RefCell<SymbolTable>> {
        self.tables.last().expect("at least the root table is always on the stack").clone()
    }

    fn current_table_is_root(&self) -> bool {
        SymbolTable::owner_is_root(&self.current_table())
    }

    /// The nearest enclosing `Function`/`Root` table — where free-variable
    /// captures for an identifier used at the current point must be recorded.
    fn current_function_table(&self) -> Rc<RefCell<SymbolTable>> {
        for table in self.tables.iter().rev() {
            let kind = table.borrow().kind().clone();
            if matches!(kind, ScopeKind::Function | ScopeKind::Root) {
                return table.clone();
            }
        }
        unreachable!("the root table is always Root-kind")
    }

    fn in_function(&self) -> bool {
        self.tables.iter().any(|t| *t.borrow().kind() == ScopeKind::Function)
    }

    fn err(&self, kind: CompileErrorKind, location: SourceLocation) -> CompileError {
        CompileError {
            kind,
            location,
            filename: self.config.filename.clone(),
            source_line: self.config.source.lines().nth(location.line.saturating_sub(1) as usize).map(|s| s.to_string()),
        }
    }

    fn emit(&mut self, op: Opcode, operands: &[u16], pos: SourceLocation) -> usize {
        self.current_builder().emit(op, operands, pos)
    }

    fn emit0(&mut self, op: Opcode, pos: SourceLocation) -> usize {
        self.current_builder().emit0(op, pos)
    }

    fn emit1(&mut self, op: Opcode, operand: u16, pos: SourceLocation) -> usize {
        self.current_builder().emit1(op, operand, pos)
    }

    fn patch_jump(&mut self, jump_pos: usize, pos: SourceLocation) -> Result<(), CompileError> {
        self.current_builder().patch_jump(jump_pos, 0).map_err(|_| self.err(CompileErrorKind::JumpTooFar, pos))
    }

    fn add_name(&mut self, name: &str) -> u16 {
        self.current_builder().add_name(name)
    }

    fn add_constant(&mut self, constant: Constant) -> u16 {
        self.current_builder().add_constant(constant)
    }

    // --- statements --------------------------------------------------------

    fn stmt_leaves_value(stmt: &Stmt) -> bool {
        matches!(stmt.kind, StmtKind::Expr(_) | StmtKind::Block(_))
    }

    fn compile_stmt_list(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        if stmts.is_empty() {
            self.emit0(Opcode::Nil, SourceLocation::zero());
            return Ok(());
        }
        let last = stmts.len() - 1;
        for (i, stmt) in stmts.iter().enumerate() {
            let is_last = i == last;
            if Self::stmt_leaves_value(stmt) {
                self.compile_stmt_value(stmt)?;
                if !is_last {
                    self.emit0(Opcode::PopTop, stmt.pos);
                }
            } else {
                self.compile_stmt_effect(stmt)?;
                if is_last {
                    self.emit0(Opcode::Nil, stmt.pos);
                }
            }
        }
        Ok(())
    }

    fn compile_stmt_value(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Expr(e) => self.compile_expr(e),
            StmtKind::Block(body) => {
                let block_table = SymbolTable::new_child(&self.current_table(), ScopeKind::Block);
                self.tables.push(block_table);
                let result = self.compile_stmt_list(body);
                self.tables.pop();
                result
            }
            _ => unreachable!("stmt_leaves_value gates this match"),
        }
    }

    /// Compiles a statement list purely for effect, discarding whatever value
    /// it would otherwise leave (loop bodies).
    fn compile_block_discard(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        let block_table = SymbolTable::new_child(&self.current_table(), ScopeKind::Block);
        self.tables.push(block_table);
        let result = self.compile_stmt_list(body);
        self.tables.pop();
        result?;
        let pos = body.last().map(|s| s.pos).unwrap_or_else(SourceLocation::zero);
        self.emit0(Opcode::PopTop, pos);
        Ok(())
    }

    fn compile_stmt_effect(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Let { pattern, value } => {
                self.compile_expr(value)?;
                self.compile_pattern_binding(pattern, stmt.pos)
            }
            StmtKind::Const { name, value } => {
                self.compile_expr(value)?;
                let symbol = SymbolTable::insert_constant(&self.current_table(), name)
                    .map_err(|_| self.err(CompileErrorKind::Redefinition { name: name.clone() }, stmt.pos))?;
                self.compile_store_symbol(&symbol, stmt.pos);
                Ok(())
            }
            StmtKind::Assign { target, op, value } => self.compile_assign(target, *op, value, stmt.pos),
            StmtKind::FuncDecl(decl) => self.compile_func_decl_stmt(decl, stmt.pos),
            StmtKind::Return(expr) => {
                if !self.in_function() {
                    return Err(self.err(CompileErrorKind::ReturnOutsideFunction, stmt.pos));
                }
                match expr {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit0(Opcode::Nil, stmt.pos);
                    }
                }
                self.emit0(Opcode::ReturnValue, stmt.pos);
                Ok(())
            }
            StmtKind::Throw(e) => {
                self.compile_expr(e)?;
                self.emit0(Opcode::Throw, stmt.pos);
                Ok(())
            }
            StmtKind::While { cond, body } => self.compile_while(cond, body, stmt.pos),
            StmtKind::For { binding, iterable, body } => self.compile_for(binding, iterable, body, stmt.pos),
            StmtKind::Break => self.compile_break(stmt.pos),
            StmtKind::Continue => self.compile_continue(stmt.pos),
            StmtKind::Expr(_) | StmtKind::Block(_) => unreachable!("handled by compile_stmt_value"),
        }
    }

    fn compile_func_decl_stmt(&mut self, decl: &FuncDecl, pos: SourceLocation) -> Result<(), CompileError> {
        let name = decl.name.as_ref().expect("a declaration-form function is always named");
        let symbol = if self.current_table_is_root() && self.pass1_names.contains(name) {
            SymbolTable::resolve(&self.current_table(), name)
                .expect("pass 1 already declared this name")
                .symbol
        } else {
            SymbolTable::insert_constant(&self.current_table(), name)
                .map_err(|_| self.err(CompileErrorKind::Redefinition { name: name.clone() }, pos))?
        };
        self.compile_function_literal(decl, pos)?;
        self.compile_store_symbol(&symbol, pos);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &[Stmt], pos: SourceLocation) -> Result<(), CompileError> {
        let head = self.position();
        self.compile_expr(cond)?;
        let exit = self.emit1(Opcode::PopJumpForwardIfFalse, PLACEHOLDER, pos);

        self.loop_stack.push(LoopCtx { continue_target: head, break_jumps: Vec::new() });
        self.compile_block_discard(body)?;
        let ctx = self.loop_stack.pop().expect("pushed just above");

        let back_pos = self.position();
        let delta = self
            .current_builder()
            .backward_delta(back_pos, head)
            .map_err(|_| self.err(CompileErrorKind::JumpTooFar, pos))?;
        self.emit1(Opcode::JumpBackward, delta, pos);

        self.patch_jump(exit, pos)?;
        for bj in ctx.break_jumps {
            self.patch_jump(bj, pos)?;
        }
        Ok(())
    }

    /// Lowers `for x in xs { ... }` onto `MakeIterator`/`IteratorHasNext`/
    /// `IteratorNext`: the iterator value sits on the operand stack for the
    /// whole loop, `IteratorHasNext` peeks it to push a continuation flag,
    /// and `IteratorNext` pops-then-repushes it alongside the next item.
    fn compile_for(
        &mut self,
        binding: &str,
        iterable: &Expr,
        body: &[Stmt],
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        self.compile_expr(iterable)?;
        self.emit0(Opcode::MakeIterator, pos);

        let binding_table = SymbolTable::new_child(&self.current_table(), ScopeKind::Block);
        self.tables.push(binding_table);
        let sym = SymbolTable::insert_variable(&self.current_table(), binding)
            .map_err(|_| self.err(CompileErrorKind::Redefinition { name: binding.to_string() }, pos))?;

        let head = self.position();
        self.emit0(Opcode::IteratorHasNext, pos);
        let exit = self.emit1(Opcode::PopJumpForwardIfFalse, PLACEHOLDER, pos);
        self.emit0(Opcode::IteratorNext, pos);
        self.compile_store_symbol(&sym, pos);

        self.loop_stack.push(LoopCtx { continue_target: head, break_jumps: Vec::new() });
        self.compile_block_discard(body)?;
        let ctx = self.loop_stack.pop().expect("pushed just above");

        let back_pos = self.position();
        let delta = self
            .current_builder()
            .backward_delta(back_pos, head)
            .map_err(|_| self.err(CompileErrorKind::JumpTooFar, pos))?;
        self.emit1(Opcode::JumpBackward, delta, pos);

        self.patch_jump(exit, pos)?;
        self.emit0(Opcode::PopTop, pos); // drop the iterator
        for bj in ctx.break_jumps {
            self.patch_jump(bj, pos)?;
        }
        self.tables.pop();
        Ok(())
    }

    fn compile_break(&mut self, pos: SourceLocation) -> Result<(), CompileError> {
        if self.loop_stack.is_empty() {
            return Err(self.err(
                CompileErrorKind::SyntaxError { message: "'break' outside a loop".to_string() },
                pos,
            ));
        }
        let j = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);
        self.loop_stack.last_mut().unwrap().break_jumps.push(j);
        Ok(())
    }

    fn compile_continue(&mut self, pos: SourceLocation) -> Result<(), CompileError> {
        let target = match self.loop_stack.last() {
            Some(ctx) => ctx.continue_target,
            None => {
                return Err(self.err(
                    CompileErrorKind::SyntaxError { message: "'continue' outside a loop".to_string() },
                    pos,
                ))
            }
        };
        let cur = self.position();
        let delta = self
            .current_builder()
            .backward_delta(cur, target)
            .map_err(|_| self.err(CompileErrorKind::JumpTooFar, pos))?;
        self.emit1(Opcode::JumpBackward, delta, pos);
        Ok(())
    }

    // --- name resolution / storage ------------------------------------------

    fn compile_load_name(&mut self, name: &str, pos: SourceLocation) -> Result<(), CompileError> {
        match SymbolTable::resolve(&self.current_table(), name) {
            Some(res) => {
                self.emit_load_resolution(&res, pos);
                Ok(())
            }
            None => {
                let suggestion = SymbolTable::suggest(&self.current_table(), name);
                Err(self.err(CompileErrorKind::UndefinedName { name: name.to_string(), suggestion }, pos))
            }
        }
    }

    fn emit_load_resolution(&mut self, res: &Resolution, pos: SourceLocation) {
        match res.scope {
            Scope::Global => {
                self.emit1(Opcode::LoadGlobal, res.symbol.index as u16, pos);
            }
            Scope::Local => {
                self.emit1(Opcode::LoadFast, res.symbol.index as u16, pos);
            }
            Scope::Free => {
                let fi = SymbolTable::record_free_capture(
                    &self.current_function_table(),
                    &res.symbol.name,
                    res.symbol.index,
                    res.depth,
                );
                self.emit1(Opcode::LoadFree, fi as u16, pos);
            }
        }
    }

    fn compile_store_name(&mut self, name: &str, pos: SourceLocation) -> Result<(), CompileError> {
        match SymbolTable::resolve(&self.current_table(), name) {
            Some(res) => {
                if res.symbol.is_constant {
                    return Err(self.err(CompileErrorKind::ConstantAssignment { name: name.to_string() }, pos));
                }
                self.emit_store_resolution(&res, pos);
                Ok(())
            }
            None => {
                let suggestion = SymbolTable::suggest(&self.current_table(), name);
                Err(self.err(CompileErrorKind::UndefinedName { name: name.to_string(), suggestion }, pos))
            }
        }
    }

    fn emit_store_resolution(&mut self, res: &Resolution, pos: SourceLocation) {
        match res.scope {
            Scope::Global => {
                self.emit1(Opcode::StoreGlobal, res.symbol.index as u16, pos);
            }
            Scope::Local => {
                self.emit1(Opcode::StoreFast, res.symbol.index as u16, pos);
            }
            Scope::Free => {
                let fi = SymbolTable::record_free_capture(
                    &self.current_function_table(),
                    &res.symbol.name,
                    res.symbol.index,
                    res.depth,
                );
                self.emit1(Opcode::StoreFree, fi as u16, pos);
            }
        }
    }

    /// Stores into a symbol that was *just* inserted at the current scope
    /// (`let`/`const`/function-decl/destructuring), so the scope is always
    /// `Global` or `Local` relative to here, never `Free`.
    fn compile_store_symbol(&mut self, symbol: &Symbol, pos: SourceLocation) {
        if self.current_table_is_root() {
            self.emit1(Opcode::StoreGlobal, symbol.index as u16, pos);
        } else {
            self.emit1(Opcode::StoreFast, symbol.index as u16, pos);
        }
    }

    fn compile_pattern_binding(&mut self, pattern: &Pattern, pos: SourceLocation) -> Result<(), CompileError> {
        match pattern {
            Pattern::Name(name) => {
                let symbol = SymbolTable::insert_variable(&self.current_table(), name)
                    .map_err(|_| self.err(CompileErrorKind::Redefinition { name: name.clone() }, pos))?;
                self.compile_store_symbol(&symbol, pos);
                Ok(())
            }
            Pattern::Blank => {
                SymbolTable::insert_blank(&self.current_table());
                self.emit0(Opcode::PopTop, pos);
                Ok(())
            }
            Pattern::Object(fields) => {
                for field in fields {
                    self.emit1(Opcode::Copy, 0, pos);
                    let name_idx = self.add_name(&field.key);
                    if field.default.is_some() {
                        self.emit1(Opcode::LoadAttrOrNil, name_idx, pos);
                    } else {
                        self.emit1(Opcode::LoadAttr, name_idx, pos);
                    }
                    self.compile_default_expansion(&field.default, pos)?;
                    self.compile_pattern_binding(&field.binding, pos)?;
                }
                self.emit0(Opcode::PopTop, pos); // drop the source
                Ok(())
            }
            Pattern::Array(elements) => {
                self.emit1(Opcode::Unpack, elements.len() as u16, pos);
                for element in elements.iter().rev() {
                    self.compile_default_expansion(&element.default, pos)?;
                    self.compile_pattern_binding(&element.binding, pos)?;
                }
                Ok(())
            }
        }
    }

    /// `Copy 0; PopJumpForwardIfNotNil -> L; PopTop; compile(default); L:` —
    /// replaces a nil top-of-stack value with a freshly computed default.
    /// A no-op when there's no default to apply.
    fn compile_default_expansion(&mut self, default: &Option<Expr>, pos: SourceLocation) -> Result<(), CompileError> {
        let Some(default_expr) = default else { return Ok(()) };
        self.emit1(Opcode::Copy, 0, pos);
        let jnn = self.emit1(Opcode::PopJumpForwardIfNotNil, PLACEHOLDER, pos);
        self.emit0(Opcode::PopTop, pos);
        self.compile_expr(default_expr)?;
        self.patch_jump(jnn, pos)
    }

    fn compile_assign(
        &mut self,
        target: &Expr,
        op: Option<BinOpKind>,
        value: &Expr,
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                if let Some(bop) = op {
                    self.compile_load_name(name, target.pos)?;
                    self.compile_expr(value)?;
                    self.emit1(Opcode::BinaryOp, Self::binop_operand(bop), pos);
                } else {
                    self.compile_expr(value)?;
                }
                self.compile_store_name(name, pos)
            }
            ExprKind::Blank => {
                self.compile_expr(value)?;
                self.emit0(Opcode::PopTop, pos);
                Ok(())
            }
            ExprKind::Index { target: t, index } => {
                self.compile_expr(t)?;
                self.compile_expr(index)?;
                if let Some(bop) = op {
                    self.emit1(Opcode::Copy, 1, pos);
                    self.emit1(Opcode::Copy, 1, pos);
                    self.emit0(Opcode::BinarySubscr, pos);
                    self.compile_expr(value)?;
                    self.emit1(Opcode::BinaryOp, Self::binop_operand(bop), pos);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit0(Opcode::StoreSubscr, pos);
                Ok(())
            }
            ExprKind::Attr { target: t, name, .. } => {
                self.compile_expr(t)?;
                let name_idx = self.add_name(name);
                if let Some(bop) = op {
                    self.emit1(Opcode::Copy, 0, pos);
                    self.emit1(Opcode::LoadAttr, name_idx, pos);
                    self.compile_expr(value)?;
                    self.emit1(Opcode::BinaryOp, Self::binop_operand(bop), pos);
                } else {
                    self.compile_expr(value)?;
                }
                self.emit1(Opcode::StoreAttr, name_idx, pos);
                Ok(())
            }
            _ => Err(self.err(
                CompileErrorKind::SyntaxError { message: "invalid assignment target".to_string() },
                target.pos,
            )),
        }
    }

    // --- expressions ---------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let pos = expr.pos;
        match &expr.kind {
            ExprKind::Nil => {
                self.emit0(Opcode::Nil, pos);
            }
            ExprKind::Bool(true) => {
                self.emit0(Opcode::True, pos);
            }
            ExprKind::Bool(false) => {
                self.emit0(Opcode::False, pos);
            }
            ExprKind::Int(n) => {
                let idx = self.add_constant(Constant::Int(*n));
                self.emit1(Opcode::LoadConst, idx, pos);
            }
            ExprKind::Float(n) => {
                let idx = self.add_constant(Constant::Float(*n));
                self.emit1(Opcode::LoadConst, idx, pos);
            }
            ExprKind::Str(s) => {
                let idx = self.add_constant(Constant::Str(s.clone()));
                self.emit1(Opcode::LoadConst, idx, pos);
            }
            ExprKind::Identifier(name) => self.compile_load_name(name, pos)?,
            ExprKind::Blank => return Err(self.err(CompileErrorKind::BlankIdentifierRead, pos)),
            ExprKind::ListLit(elements) => self.compile_list_lit(elements, pos)?,
            ExprKind::MapLit(entries) => self.compile_map_lit(entries, pos)?,
            ExprKind::Func(decl) => self.compile_function_literal(decl, pos)?,
            ExprKind::Unary { op, expr: inner } => {
                self.compile_expr(inner)?;
                self.emit0(
                    match op {
                        UnaryOpKind::Not => Opcode::UnaryNot,
                        UnaryOpKind::Negate => Opcode::UnaryNegative,
                    },
                    pos,
                );
            }
            ExprKind::Binary { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_binop(*op, pos);
            }
            ExprKind::And(l, r) => self.compile_short_circuit(l, r, Opcode::PopJumpForwardIfFalse, pos)?,
            ExprKind::Or(l, r) => self.compile_short_circuit(l, r, Opcode::PopJumpForwardIfTrue, pos)?,
            ExprKind::Coalesce(l, r) => {
                self.compile_short_circuit(l, r, Opcode::PopJumpForwardIfNotNil, pos)?
            }
            ExprKind::If { cond, then_branch, else_branch } => {
                self.compile_expr(cond)?;
                let jf = self.emit1(Opcode::PopJumpForwardIfFalse, PLACEHOLDER, pos);
                self.compile_stmt_value(&block_stmt(then_branch, pos))?;
                let jend = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);
                self.patch_jump(jf, pos)?;
                match else_branch {
                    Some(stmts) => self.compile_stmt_value(&block_stmt(stmts, pos))?,
                    None => {
                        self.emit0(Opcode::Nil, pos);
                    }
                }
                self.patch_jump(jend, pos)?;
            }
            ExprKind::Switch { value, cases, default } => self.compile_switch(value, cases, default, pos)?,
            ExprKind::Try { try_body, catch_var, catch_body, finally_body } => {
                self.compile_try(try_body, catch_var, catch_body, finally_body, pos)?
            }
            ExprKind::Call { callee, args } => self.compile_call(callee, args, pos)?,
            ExprKind::ObjectCall { target, optional, method, args } => {
                self.compile_object_call(target, *optional, method, args, pos)?
            }
            ExprKind::Index { target, index } => {
                self.compile_expr(target)?;
                self.compile_expr(index)?;
                self.emit0(Opcode::BinarySubscr, pos);
            }
            ExprKind::Slice { target, low, high } => {
                self.compile_expr(target)?;
                match low {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit0(Opcode::Nil, pos);
                    }
                }
                match high {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit0(Opcode::Nil, pos);
                    }
                }
                self.emit0(Opcode::Slice, pos);
            }
            ExprKind::Attr { target, name, optional } => {
                self.compile_expr(target)?;
                let name_idx = self.add_name(name);
                self.emit1(if *optional { Opcode::LoadAttrOrNil } else { Opcode::LoadAttr }, name_idx, pos);
            }
            ExprKind::Pipe(stages) => self.compile_pipe(stages, pos)?,
            ExprKind::Spread(_) => {
                return Err(self.err(
                    CompileErrorKind::SyntaxError {
                        message: "'...' is only valid in a list literal or call argument list".to_string(),
                    },
                    pos,
                ))
            }
        }
        Ok(())
    }

    fn binop_operand(op: BinOpKind) -> u16 {
        use BinOpKind::*;
        match op {
            Add => BinaryOpKind::Add as u16,
            Sub => BinaryOpKind::Subtract as u16,
            Mul => BinaryOpKind::Multiply as u16,
            Div => BinaryOpKind::Divide as u16,
            Mod => BinaryOpKind::Modulo as u16,
            Pow => BinaryOpKind::Power as u16,
            LShift => BinaryOpKind::LShift as u16,
            RShift => BinaryOpKind::RShift as u16,
            BitAnd => BinaryOpKind::BitwiseAnd as u16,
            BitOr => BinaryOpKind::BitwiseOr as u16,
            BitXor => BinaryOpKind::Xor as u16,
            Eq | Ne | Lt | Gt | Le | Ge | Contains => {
                unreachable!("comparison/contains ops are dispatched through CompareOp/ContainsOp")
            }
        }
    }

    fn emit_binop(&mut self, op: BinOpKind, pos: SourceLocation) {
        use BinOpKind::*;
        match op {
            Eq => self.emit_compare(CompareOpKind::Equal, pos),
            Ne => self.emit_compare(CompareOpKind::NotEqual, pos),
            Lt => self.emit_compare(CompareOpKind::Less, pos),
            Gt => self.emit_compare(CompareOpKind::Greater, pos),
            Le => self.emit_compare(CompareOpKind::LessEqual, pos),
            Ge => self.emit_compare(CompareOpKind::GreaterEqual, pos),
            Contains => {
                self.emit0(Opcode::ContainsOp, pos);
            }
            _ => {
                self.emit1(Opcode::BinaryOp, Self::binop_operand(op), pos);
            }
        }
    }

    fn emit_compare(&mut self, kind: CompareOpKind, pos: SourceLocation) {
        self.emit1(Opcode::CompareOp, kind as u16, pos);
    }

    fn compile_short_circuit(
        &mut self,
        left: &Expr,
        right: &Expr,
        jump_if: Opcode,
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        self.compile_expr(left)?;
        self.emit1(Opcode::Copy, 0, pos);
        let j = self.emit1(jump_if, PLACEHOLDER, pos);
        self.emit0(Opcode::PopTop, pos);
        self.compile_expr(right)?;
        self.patch_jump(j, pos)
    }

    fn compile_list_lit(&mut self, elements: &[ListElement], pos: SourceLocation) -> Result<(), CompileError> {
        self.emit1(Opcode::BuildList, 0, pos);
        for element in elements {
            match element {
                ListElement::Item(e) => {
                    self.compile_expr(e)?;
                    self.emit0(Opcode::ListAppend, pos);
                }
                ListElement::Spread(e) => {
                    self.compile_expr(e)?;
                    self.emit0(Opcode::ListExtend, pos);
                }
            }
        }
        Ok(())
    }

    fn compile_map_lit(&mut self, entries: &[MapEntry], pos: SourceLocation) -> Result<(), CompileError> {
        self.emit1(Opcode::BuildMap, 0, pos);
        for entry in entries {
            match entry {
                MapEntry::Pair(key, value) => {
                    match key {
                        MapKey::Name(n) => {
                            let idx = self.add_constant(Constant::Str(n.clone()));
                            self.emit1(Opcode::LoadConst, idx, pos);
                        }
                        MapKey::Computed(e) => self.compile_expr(e)?,
                    }
                    self.compile_expr(value)?;
                    self.emit0(Opcode::MapSet, pos);
                }
                MapEntry::Spread(e) => {
                    self.compile_expr(e)?;
                    self.emit0(Opcode::MapMerge, pos);
                }
            }
        }
        Ok(())
    }

    fn compile_switch(
        &mut self,
        value: &Expr,
        cases: &[crate::ast::SwitchCase],
        default: &Option<Vec<Stmt>>,
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        self.compile_expr(value)?;
        let mut end_jumps = Vec::new();
        for case in cases {
            let mut match_jumps = Vec::new();
            for test in &case.tests {
                self.emit1(Opcode::Copy, 0, pos);
                self.compile_expr(test)?;
                self.emit_compare(CompareOpKind::Equal, pos);
                match_jumps.push(self.emit1(Opcode::PopJumpForwardIfTrue, PLACEHOLDER, pos));
            }
            let skip = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);
            for mj in match_jumps {
                self.patch_jump(mj, pos)?;
            }
            self.emit0(Opcode::PopTop, pos);
            self.compile_stmt_list(&case.body)?;
            end_jumps.push(self.emit1(Opcode::JumpForward, PLACEHOLDER, pos));
            self.patch_jump(skip, pos)?;
        }
        self.emit0(Opcode::PopTop, pos);
        match default {
            Some(stmts) => self.compile_stmt_list(stmts)?,
            None => {
                self.emit0(Opcode::Nil, pos);
            }
        }
        for ej in end_jumps {
            self.patch_jump(ej, pos)?;
        }
        Ok(())
    }

    /// Try/catch/finally lowering. A single shared tail (`finally_start`) is
    /// reached both from normal completion of `try`/`catch` and, for an
    /// uncaught exception, directly with the exception still pending — so
    /// `EndFinally` always runs, and only re-raises when nothing caught it.
    ///
    /// Known limitation: a `return`/`break`/`continue` lexically inside the
    /// protected region jumps straight out without running `finally` first
    /// (see DESIGN.md).
    fn compile_try(
        &mut self,
        try_body: &[Stmt],
        catch_var: &Option<String>,
        catch_body: &Option<Vec<Stmt>>,
        finally_body: &Option<Vec<Stmt>>,
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        let handler_idx = self.current_builder().handlers_len();
        self.current_builder().add_handler(ExceptionHandler {
            try_start: 0,
            try_end: 0,
            catch_start: 0,
            finally_start: 0,
            catch_var_idx: -1,
            has_catch: false,
        });
        self.emit(Opcode::PushExcept, &[handler_idx as u16, 0], pos);

        let try_start = self.position() as u32;
        self.compile_stmt_value(&block_stmt(try_body, pos))?;
        let try_end = self.position() as u32;
        self.emit0(Opcode::PopExcept, pos);
        let to_finally_normal = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);

        let catch_start = self.position() as u32;
        let mut catch_var_idx: i32 = -1;
        let block_table = SymbolTable::new_child(&self.current_table(), ScopeKind::Block);
        self.tables.push(block_table);
        if let Some(body) = catch_body {
            if let Some(name) = catch_var {
                let symbol = SymbolTable::insert_variable(&self.current_table(), name)
                    .map_err(|_| self.err(CompileErrorKind::Redefinition { name: name.clone() }, pos))?;
                catch_var_idx = symbol.index as i32;
                self.compile_store_symbol(&symbol, pos);
            } else {
                self.emit0(Opcode::PopTop, pos);
            }
            self.compile_stmt_list(body)?;
            let to_finally_caught = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);
            self.patch_jump(to_finally_normal, pos)?;
            self.patch_jump(to_finally_caught, pos)?;
        } else {
            self.patch_jump(to_finally_normal, pos)?;
        }
        self.tables.pop();

        let finally_start = if let Some(fbody) = finally_body {
            let start = self.position() as u32;
            self.compile_stmt_list(fbody)?;
            self.emit0(Opcode::PopTop, pos);
            self.emit0(Opcode::EndFinally, pos);
            start
        } else {
            0
        };

        self.current_builder().patch_handler(handler_idx, |h| {
            h.try_start = try_start;
            h.try_end = try_end;
            h.catch_start = if catch_body.is_some() { catch_start } else { finally_start };
            h.finally_start = finally_start;
            h.catch_var_idx = catch_var_idx;
            h.has_catch = catch_body.is_some();
        });
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Arg], pos: SourceLocation) -> Result<(), CompileError> {
        self.compile_expr(callee)?;
        if args.iter().any(|a| matches!(a, Arg::Spread(_))) {
            self.compile_list_lit(
                &args
                    .iter()
                    .map(|a| match a {
                        Arg::Positional(e) => ListElement::Item(e.clone()),
                        Arg::Spread(e) => ListElement::Spread(e.clone()),
                    })
                    .collect::<Vec<_>>(),
                pos,
            )?;
            self.emit0(Opcode::CallSpread, pos);
        } else {
            for arg in args {
                let Arg::Positional(e) = arg else { unreachable!("checked above") };
                self.compile_expr(e)?;
            }
            self.emit1(Opcode::Call, args.len() as u16, pos);
        }
        Ok(())
    }

    /// `target.method(args)` / `target?.method(args)`: the receiver is bound
    /// as a `Partial`'s single prefix argument (the same trick `compile_pipe`
    /// uses), then `args` are appended via an ordinary `Call`.
    fn compile_object_call(
        &mut self,
        target: &Expr,
        optional: bool,
        method: &str,
        args: &[Arg],
        pos: SourceLocation,
    ) -> Result<(), CompileError> {
        self.compile_expr(target)?;
        let end_jump = if optional {
            self.emit1(Opcode::Copy, 0, pos);
            let skip = self.emit1(Opcode::PopJumpForwardIfNotNil, PLACEHOLDER, pos);
            let end = self.emit1(Opcode::JumpForward, PLACEHOLDER, pos);
            self.patch_jump(skip, pos)?;
            Some(end)
        } else {
            None
        };

        let name_idx = self.add_name(method);
        self.emit1(Opcode::Copy, 0, pos);
        self.emit1(Opcode::LoadAttr, name_idx, pos);
        self.emit1(Opcode::Swap, 1, pos);
        self.emit1(Opcode::Partial, 1, pos);
        if args.iter().any(|a| matches!(a, Arg::Spread(_))) {
            return Err(self.err(
                CompileErrorKind::SyntaxError {
                    message: "spread arguments are not supported in method-call syntax".to_string(),
                },
                pos,
            ));
        }
        for arg in args {
            let Arg::Positional(e) = arg else { unreachable!("checked above") };
            self.compile_expr(e)?;
        }
        self.emit1(Opcode::Call, args.len() as u16, pos);

        if let Some(end) = end_jump {
            self.patch_jump(end, pos)?;
        }
        Ok(())
    }

    /// `a | f(x) | g` — each stage after the first is rewritten as a
    /// `Partial` application of its callee over the running value, then an
    /// ordinary `Call` over the stage's own arguments:
    /// `a | f(x)` becomes `f` partially applied over `a`, called with `x`.
    fn compile_pipe(&mut self, stages: &[Expr], pos: SourceLocation) -> Result<(), CompileError> {
        if stages.is_empty() {
            self.emit0(Opcode::Nil, pos);
            return Ok(());
        }
        self.compile_expr(&stages[0])?;
        for stage in &stages[1..] {
            if matches!(stage.kind, ExprKind::Pipe(_)) {
                return Err(self.err(CompileErrorKind::NestedPipe, stage.pos));
            }
            let (callee, extra_args): (&Expr, &[Arg]) = match &stage.kind {
                ExprKind::Call { callee, args } => (callee.as_ref(), args.as_slice()),
                _ => (stage, &[]),
            };
            for arg in extra_args {
                if let Arg::Spread(e) = arg {
                    return Err(self.err(CompileErrorKind::SpreadInPipe, e.pos));
                }
            }
            self.compile_expr(callee)?;
            self.emit1(Opcode::Swap, 1, pos);
            self.emit1(Opcode::Partial, 1, pos);
            for arg in extra_args {
                let Arg::Positional(e) = arg else { unreachable!("checked above") };
                self.compile_expr(e)?;
            }
            self.emit1(Opcode::Call, extra_args.len() as u16, pos);
        }
        Ok(())
    }

    // --- functions -----------------------------------------------------------

    fn literal_to_constant(&self, expr: &Expr, param: &str) -> Result<Constant, CompileError> {
        match &expr.kind {
            ExprKind::Nil => Ok(Constant::Nil),
            ExprKind::Bool(b) => Ok(Constant::Bool(*b)),
            ExprKind::Int(n) => Ok(Constant::Int(*n)),
            ExprKind::Float(n) => Ok(Constant::Float(*n)),
            ExprKind::Str(s) => Ok(Constant::Str(s.clone())),
            _ => Err(self.err(CompileErrorKind::InvalidDefault { param: param.to_string() }, expr.pos)),
        }
    }

    /// Builds the child `Code`, then materializes it in the *current*
    /// (enclosing) builder as either a bare closure (`LoadConst`) or, if it
    /// captures free variables, a sequence of `MakeCell`s feeding `LoadClosure`.
    fn compile_function_literal(&mut self, decl: &FuncDecl, pos: SourceLocation) -> Result<(), CompileError> {
        let parent_idx = *self.next_child_index.last().unwrap();
        *self.next_child_index.last_mut().unwrap() += 1;
        let child_id = format!("{}.{}", self.current_builder().id(), parent_idx);
        let function_id = self.next_function_id;
        self.next_function_id += 1;

        let child_table = SymbolTable::new_child(&self.current_table(), ScopeKind::Function);
        let child_builder =
            CodeBuilder::new(child_id, function_id, self.config.filename.clone(), self.config.source.clone());

        self.tables.push(child_table.clone());
        self.builders.push(child_builder);
        self.next_child_index.push(0);
        let saved_loops = std::mem::take(&mut self.loop_stack);

        let result = self.compile_function_body_inner(decl);

        self.loop_stack = saved_loops;
        self.next_child_index.pop();

        let local_count = SymbolTable::local_count(&child_table) as u16;
        let mut child_builder = self.builders.pop().expect("pushed just above");
        child_builder.set_local_names(SymbolTable::own_names(&child_table));
        child_builder.set_name(decl.name.clone(), decl.name.is_some());
        self.tables.pop();

        let (parameters, defaults, rest_param, self_slot) = result?;
        let child_code = child_builder.freeze(local_count, 0);
        let free_sites = SymbolTable::free_var_capture_sites(&child_table);
        let template = Rc::new(FunctionTemplate::new(
            function_id,
            decl.name.clone(),
            parameters,
            defaults,
            rest_param,
            free_sites.len() as u32,
            self_slot,
            child_code.clone(),
        ));

        self.current_builder().add_child(child_code);
        let const_idx = self.current_builder().add_function_constant(template);
        if free_sites.is_empty() {
            self.emit1(Opcode::LoadConst, const_idx, pos);
        } else {
            for (slot, depth) in &free_sites {
                self.emit(Opcode::MakeCell, &[*slot as u16, (*depth - 1) as u16], pos);
            }
            self.emit1(Opcode::LoadClosure, const_idx, pos);
        }
        Ok(())
    }

    /// Runs entirely inside the freshly-pushed child scope: allocates
    /// parameter/rest-param slots, emits the destructuring preamble for any
    /// pattern parameters, binds the function's own name for recursion, then
    /// compiles the body with its implicit `ReturnValue`.
    #[allow(clippy::type_complexity)]
    fn compile_function_body_inner(
        &mut self,
        decl: &FuncDecl,
    ) -> Result<(Vec<String>, Vec<Option<Constant>>, Option<String>, Option<u32>), CompileError> {
        let child_table = self.current_table();
        let mut parameters = Vec::with_capacity(decl.params.len());
        let mut defaults = Vec::with_capacity(decl.params.len());
        let mut destructure_preambles = Vec::new();

        if decl.params.len() > MAX_PARAMS {
            return Err(self.err(CompileErrorKind::ParameterLimitExceeded, decl.pos));
        }

        for (i, param) in decl.params.iter().enumerate() {
            let pname = match &param.pattern {
                Pattern::Name(n) => {
                    SymbolTable::insert_variable(&child_table, n)
                        .map_err(|_| self.err(CompileErrorKind::Redefinition { name: n.clone() }, decl.pos))?;
                    n.clone()
                }
                Pattern::Blank => {
                    let synthetic = format!("\0_param_{}", i);
                    SymbolTable::insert_variable(&child_table, &synthetic).expect("synthetic name is unique");
                    synthetic
                }
                Pattern::Object(_) | Pattern::Array(_) => {
                    let synthetic = format!("__destructure_{}", i);
                    SymbolTable::insert_variable(&child_table, &synthetic).expect("synthetic name is unique");
                    destructure_preambles.push((synthetic.clone(), param.pattern.clone()));
                    synthetic
                }
            };
            parameters.push(pname.clone());
            let default_const = match &param.default {
                None => None,
                Some(expr) => Some(self.literal_to_constant(expr, &pname)?),
            };
            defaults.push(default_const);
        }

        let rest_param = decl.rest_param.clone();
        if let Some(rp) = &rest_param {
            SymbolTable::insert_variable(&child_table, rp)
                .map_err(|_| self.err(CompileErrorKind::Redefinition { name: rp.clone() }, decl.pos))?;
        }

        for (synthetic, pattern) in &destructure_preambles {
            let sym = SymbolTable::resolve(&child_table, synthetic).expect("just inserted").symbol;
            self.emit1(Opcode::LoadFast, sym.index as u16, decl.pos);
            self.compile_pattern_binding(pattern, decl.pos)?;
        }

        // Best-effort: if a parameter already took this name, the parameter
        // shadows it and self-recursion by name is unavailable.
        let self_slot = match &decl.name {
            Some(name) => SymbolTable::insert_constant(&child_table, name).ok().map(|s| s.index),
            None => None,
        };

        self.compile_stmt_list(&decl.body)?;
        self.emit0(Opcode::ReturnValue, decl.pos);

        Ok((parameters, defaults, rest_param, self_slot))
    }
}

/// Wraps a statement list as a single `Block` statement so `If`/`Try`
/// branches can reuse `compile_stmt_value`'s nested-scope-plus-value logic.
fn block_stmt(body: &[Stmt], pos: SourceLocation) -> Stmt {
    Stmt { kind: StmtKind::Block(body.to_vec()), pos }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, ExprKind, Stmt, StmtKind};
    use crate::errors::SourceLocation;
    use crate::opcode::Opcode;

    fn pos() -> SourceLocation {
        SourceLocation::new(1, 1)
    }

    fn int_expr(n: i64) -> Expr {
        Expr { kind: ExprKind::Int(n), pos: pos() }
    }

    fn program(body: Vec<Stmt>) -> Program {
        Program { body }
    }

    #[test]
    fn compiles_simple_arithmetic_expression() {
        let expr = Expr {
            kind: ExprKind::Binary { op: BinOpKind::Add, left: Box::new(int_expr(1)), right: Box::new(int_expr(2)) },
            pos: pos(),
        };
        let prog = program(vec![Stmt { kind: StmtKind::Expr(expr), pos: pos() }]);
        let code = compile_program(&prog, CompilerConfig::new("<test>", "1 + 2")).unwrap();
        assert!(code.instructions().iter().any(|&w| w == Opcode::BinaryOp as u16));
    }

    #[test]
    fn undefined_identifier_is_reported() {
        let expr = Expr { kind: ExprKind::Identifier("nope".to_string()), pos: pos() };
        let prog = program(vec![Stmt { kind: StmtKind::Expr(expr), pos: pos() }]);
        let err = compile_program(&prog, CompilerConfig::new("<test>", "nope")).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::UndefinedName { .. }));
    }

    #[test]
    fn let_then_use_resolves_to_global() {
        let let_stmt = Stmt {
            kind: StmtKind::Let { pattern: Pattern::Name("x".to_string()), value: int_expr(5) },
            pos: pos(),
        };
        let use_stmt =
            Stmt { kind: StmtKind::Expr(Expr { kind: ExprKind::Identifier("x".to_string()), pos: pos() }), pos: pos() };
        let prog = program(vec![let_stmt, use_stmt]);
        let code = compile_program(&prog, CompilerConfig::new("<test>", "let x = 5\nx")).unwrap();
        assert!(code.instructions().iter().any(|&w| w == Opcode::LoadGlobal as u16));
    }

    #[test]
    fn assigning_to_const_is_rejected() {
        let const_stmt =
            Stmt { kind: StmtKind::Const { name: "x".to_string(), value: int_expr(1) }, pos: pos() };
        let assign_stmt = Stmt {
            kind: StmtKind::Assign {
                target: Expr { kind: ExprKind::Identifier("x".to_string()), pos: pos() },
                op: None,
                value: int_expr(2),
            },
            pos: pos(),
        };
        let prog = program(vec![const_stmt, assign_stmt]);
        let err = compile_program(&prog, CompilerConfig::new("<test>", "const x = 1\nx = 2")).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::ConstantAssignment { .. }));
    }

    #[test]
    fn return_outside_function_is_rejected() {
        let prog = program(vec![Stmt { kind: StmtKind::Return(None), pos: pos() }]);
        let err = compile_program(&prog, CompilerConfig::new("<test>", "return")).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::ReturnOutsideFunction));
    }

    #[test]
    fn duplicate_top_level_function_is_a_redefinition() {
        let f = FuncDecl {
            name: Some("f".to_string()),
            params: Vec::new(),
            rest_param: None,
            body: Vec::new(),
            pos: pos(),
            body_span: (0, 0),
        };
        let prog = program(vec![
            Stmt { kind: StmtKind::FuncDecl(f.clone()), pos: pos() },
            Stmt { kind: StmtKind::FuncDecl(f), pos: pos() },
        ]);
        let err =
            compile_program(&prog, CompilerConfig::new("<test>", "func f() {}\nfunc f() {}")).unwrap_err();
        assert!(matches!(err.kind, CompileErrorKind::Redefinition { .. }));
    }
}
