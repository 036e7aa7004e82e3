// File: src/lib.rs
//
// Library interface for the embeddable scripting core (§6 "External
// interfaces"). The crate is organized leaf-first, mirroring the teacher
// repo's module layout:
//
//   lexer + parser  -> ast            (collaborators; AST is the compiler's input, §1)
//   ast + symbol     -> compiler      (AST -> Code, §4.4)
//   opcode + errors  -> bytecode      (the immutable artifact, §4.2)
//   bytecode + value -> vm            (executes Code against an env, §4.6)
//   host             -> conversions + env validation (§4.7)
//   builtins         -> the host-ecosystem-free default env (§6)
//
// Lexing and parsing are out of scope for the core (§1); `lexer`/`parser`
// ship here only because no external parser was available to plug in, and
// `compile`/`eval` below use them as the one concrete front end.

pub mod ast;
pub mod builder;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod errors;
pub mod host;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod symbol;
pub mod value;
pub mod vm;

use std::rc::Rc;

use bytecode::Code;
use compiler::{CompileError, CompileErrorKind, CompilerConfig};
use errors::SourceLocation;
use host::HostValue;
use parser::Parser;
use vm::{RunOptions, RuntimeError, RuntimeErrorKind};

/// Either half of §6's two-stage pipeline can fail; `eval` needs a single
/// error type that covers both without forcing callers to match on which
/// stage produced it.
#[derive(Debug)]
pub enum Error {
    Compile(CompileError),
    Runtime(RuntimeError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Compile(e) => write!(f, "{}", e),
            Error::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        Error::Compile(e)
    }
}

impl From<RuntimeError> for Error {
    fn from(e: RuntimeError) -> Self {
        Error::Runtime(e)
    }
}

/// Compile-time options (§6): the filename to embed in diagnostics and the
/// host environment key set the compiler resolves names against. The actual
/// values for those keys are supplied later, to `run`/`eval`.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub filename: String,
    pub global_names: Vec<String>,
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_global_names(mut self, names: Vec<String>) -> Self {
        self.global_names = names;
        self
    }
}

/// §6 `compile(source, opts) -> Result<Code, CompileError>`. Lexes and
/// parses `source` with the bundled front end, then hands the resulting
/// `ast::Program` to the compiler (§4.4). A parse failure is reported as a
/// `CompileErrorKind::SyntaxError` so callers only ever see one error type
/// out of this function, matching the contract in §7 ("compile errors are
/// never raised at run time").
pub fn compile(source: &str, opts: CompileOptions) -> Result<Rc<Code>, CompileError> {
    let tokens = lexer::tokenize(source);
    let mut parser = Parser::new(tokens);
    let program = parser.parse_program().map_err(|err| CompileError {
        kind: CompileErrorKind::SyntaxError { message: err.message },
        location: err.pos,
        filename: opts.filename.clone(),
        source_line: source_line_at(source, err.pos),
    })?;

    let config = CompilerConfig::new(opts.filename, source.to_string())
        .with_global_names(opts.global_names);
    compiler::compile_program(&program, config)
}

/// §6 `run(code, opts) -> Result<Value, RuntimeError>`, re-exported at the
/// crate root next to `compile`/`eval` for symmetry; `vm::run` is the real
/// implementation.
pub fn run(code: &Rc<Code>, opts: RunOptions) -> Result<HostValue, RuntimeError> {
    vm::run(code, opts)
}

/// §6 `eval(source, opts) -> Result<Value, Error>` == `compile -> run`.
/// `opts.env`'s keys become the compiler's `global_names` so the single
/// call site never has to repeat the key list.
pub fn eval(source: &str, opts: RunOptions) -> Result<HostValue, Error> {
    let mut global_names: Vec<String> = opts.env.keys().cloned().collect();
    global_names.sort();
    let compile_opts = CompileOptions::new().with_global_names(global_names);
    let code = compile(source, compile_opts)?;
    run(&code, opts).map_err(Error::from)
}

/// §6 `builtins() -> EnvMap`, re-exported at the crate root.
pub fn builtins() -> std::collections::HashMap<String, HostValue> {
    builtins::builtins()
}

fn source_line_at(source: &str, loc: SourceLocation) -> Option<String> {
    if loc.line == 0 {
        return None;
    }
    source.lines().nth((loc.line - 1) as usize).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_without_env_evaluates_last_expression() {
        let result = eval("1 + 2 * 3", RunOptions::new()).expect("eval should succeed");
        assert_eq!(format!("{:?}", result), format!("{:?}", HostValue::Int(7)));
    }

    #[test]
    fn eval_with_missing_env_key_fails() {
        let mut env = std::collections::HashMap::new();
        env.insert("a".to_string(), HostValue::Int(1));
        env.insert("b".to_string(), HostValue::Int(2));
        let code = compile("a + b", CompileOptions::new().with_global_names(vec![
            "a".to_string(),
            "b".to_string(),
        ]))
        .expect("compile should succeed");

        let mut partial_env = std::collections::HashMap::new();
        partial_env.insert("a".to_string(), HostValue::Int(10));
        let err = run(&code, RunOptions::new().with_env(partial_env)).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::MissingGlobals { .. }));
    }
}
