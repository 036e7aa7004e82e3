// File: src/vm.rs
//
// The stack-based bytecode interpreter (§4.6 / C6). A `Vm` instance owns a
// single operand stack shared across every frame it ever pushes, a frame
// stack mirroring the lexical call chain, and per-frame exception-handler
// bookkeeping. Nothing here mutates a `Code`; everything here is the mutable
// state one *execution* of that immutable artifact needs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use colored::Colorize;

use crate::bytecode::{Code, Constant, ExceptionHandler};
use crate::errors::{render_diagnostic, SourceLocation};
use crate::host::{self, HostValue, TypeRegistry};
use crate::opcode::{BinaryOpKind, CompareOpKind, Opcode};
use crate::value::{Cell, Closure, ErrorValue, HostContext, OrderedMap, PartialCall, Value, ValueError};

// --- errors ------------------------------------------------------------------

/// Stable run-time failure sub-kinds (§7 "RuntimeError"). `Raised` carries the
/// arbitrary value an uncaught `throw` propagated; every other variant is
/// produced by a failing operation and turns into a first-class `Error`
/// value at the point a script-level `catch` binds it (see `as_value`).
#[derive(Debug, Clone)]
pub enum RuntimeErrorKind {
    TypeError { expected: String, got: String },
    IndexError(String),
    KeyError(String),
    AttributeError(String),
    ArgumentError { expected: String, got: usize },
    DivisionByZero,
    Overflow,
    Raised(Value),
    StepLimitExceeded,
    StackOverflow,
    Cancelled,
    DeadlineExceeded,
    MissingGlobals { names: Vec<String> },
}

impl RuntimeErrorKind {
    fn message(&self) -> String {
        match self {
            RuntimeErrorKind::TypeError { expected, got } => {
                format!("type error: expected {}, got {}", expected, got)
            }
            RuntimeErrorKind::IndexError(m) => format!("index error: {}", m),
            RuntimeErrorKind::KeyError(m) => format!("key error: {}", m),
            RuntimeErrorKind::AttributeError(m) => format!("attribute error: {}", m),
            RuntimeErrorKind::ArgumentError { expected, got } => {
                format!("argument error: expected {}, got {}", expected, got)
            }
            RuntimeErrorKind::DivisionByZero => "division by zero".to_string(),
            RuntimeErrorKind::Overflow => "arithmetic overflow".to_string(),
            RuntimeErrorKind::Raised(v) => format!("uncaught exception: {}", v.inspect()),
            RuntimeErrorKind::StepLimitExceeded => "step limit exceeded".to_string(),
            RuntimeErrorKind::StackOverflow => "stack overflow".to_string(),
            RuntimeErrorKind::Cancelled => "cancelled".to_string(),
            RuntimeErrorKind::DeadlineExceeded => "deadline exceeded".to_string(),
            RuntimeErrorKind::MissingGlobals { names } => {
                format!("missing required globals: {}", names.join(", "))
            }
        }
    }

    /// The value a script-level `catch` binding sees. `Raised` passes its
    /// payload through unwrapped (it may already be any script value, e.g.
    /// `throw "oops"`); everything else is surfaced as a first-class `Error`
    /// value so `catch e { e.message }` works uniformly.
    fn as_value(&self) -> Value {
        match self {
            RuntimeErrorKind::Raised(v) => v.clone(),
            other => Value::Error(Rc::new(ErrorValue { message: other.message(), cause: None })),
        }
    }
}

/// A positioned run-time failure, rendered the same way `CompileError` is
/// (`errors::render_diagnostic`), so host CLIs get one consistent look
/// across both error surfaces (§7).
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub location: SourceLocation,
    pub filename: String,
    pub source_line: Option<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        render_diagnostic(
            f,
            "runtime error",
            &self.kind.message(),
            &self.filename,
            self.location,
            self.source_line.as_deref(),
            None,
            None,
            None,
        )
    }
}

impl std::error::Error for RuntimeError {}

/// An in-flight exception: the richer kind plus the location it was raised
/// at, carried internally until either a handler binds it (`as_value`) or it
/// escapes the root frame and becomes a host-facing `RuntimeError`.
struct Exception {
    kind: RuntimeErrorKind,
    location: SourceLocation,
}

impl Exception {
    fn value(&self) -> Value {
        self.kind.as_value()
    }
}

impl From<ValueError> for RuntimeErrorKind {
    fn from(e: ValueError) -> Self {
        match e {
            ValueError::TypeError { expected, got } => RuntimeErrorKind::TypeError { expected, got },
            ValueError::DivisionByZero => RuntimeErrorKind::DivisionByZero,
            ValueError::Overflow => RuntimeErrorKind::Overflow,
            ValueError::IndexError(m) => RuntimeErrorKind::IndexError(m),
            ValueError::KeyError(m) => RuntimeErrorKind::KeyError(m),
            ValueError::AttributeError(m) => RuntimeErrorKind::AttributeError(m),
        }
    }
}

// --- observer ------------------------------------------------------------

/// Opt-in execution observer (§4.6 "Observer contract"). Invoked synchronously
/// on the executing thread; must not attempt to mutate VM state (there is no
/// handle back into it). Default methods are no-ops so callers only override
/// what they need.
pub trait Observer {
    fn on_step(&mut self, _code: &Code, _ip: usize) {}
    fn on_call(&mut self, _callee: &Value, _args: &[Value]) {}
    fn on_return(&mut self, _callee: &Value, _result: &Value) {}
}

// --- run options -----------------------------------------------------------

/// Per-run configuration (§4.6 "Resource limits" + §6's run-time options).
/// `env` travels alongside the rest so `crate::eval` can build one `Options`
/// value in `lib.rs` and hand the relevant pieces to `compile` and `run` in
/// turn.
pub struct RunOptions {
    pub env: HashMap<String, HostValue>,
    pub observer: Option<Box<dyn Observer>>,
    pub type_registry: Option<Box<dyn TypeRegistry>>,
    pub raw_result: bool,
    pub max_steps: Option<u64>,
    pub max_stack_depth: usize,
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            env: HashMap::new(),
            observer: None,
            type_registry: None,
            raw_result: false,
            max_steps: None,
            max_stack_depth: 1024,
            timeout: None,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, env: HashMap<String, HostValue>) -> Self {
        self.env = env;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_type_registry(mut self, registry: Box<dyn TypeRegistry>) -> Self {
        self.type_registry = Some(registry);
        self
    }

    pub fn with_raw_result(mut self) -> Self {
        self.raw_result = true;
        self
    }

    pub fn with_max_steps(mut self, n: u64) -> Self {
        self.max_steps = Some(n);
        self
    }

    pub fn with_max_stack_depth(mut self, n: usize) -> Self {
        self.max_stack_depth = n;
        self
    }

    pub fn with_timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }
}

// --- frames ------------------------------------------------------------------

/// Whether a `finally` block, when its `EndFinally` runs, should hand its
/// preserved value back to the enclosing expression (`Normal`) or re-raise it
/// as a fresh exception (`Reraise`). Pushed the instant the VM redirects `ip`
/// into a `finally_start` reached with nothing to catch (§9 "Exception
/// handler encoding"); every other `finally` entry is `Normal` by default.
enum FinallyEntry {
    Normal,
    Reraise(RuntimeErrorKind, SourceLocation),
}

/// One active, not-yet-resolved `try` registration in the current frame.
/// Pushed by `PushExcept`, popped either by `PopExcept` (normal completion of
/// the try body) or by exception dispatch (§4.6 "Unwinding").
#[derive(Clone, Copy)]
struct ActiveHandler {
    handler_idx: usize,
}

struct Frame {
    code: Rc<Code>,
    ip: usize,
    locals: Vec<Value>,
    closure_cells: Vec<Cell>,
    /// Lazily boxed cells for this frame's own locals, shared with whatever
    /// nested closures captured them (§9 "Shared closure cells"). Once a slot
    /// is boxed, `LoadFast`/`StoreFast` for that slot route through the cell
    /// too, so a capturing function and its enclosing frame always observe
    /// the same storage.
    cell_cache: HashMap<u32, Cell>,
    active_handlers: Vec<ActiveHandler>,
    finally_stack: Vec<FinallyEntry>,
    callee: Value,
}

impl Frame {
    fn new(code: Rc<Code>, locals: Vec<Value>, closure_cells: Vec<Cell>, callee: Value) -> Self {
        Frame {
            code,
            ip: 0,
            locals,
            closure_cells,
            cell_cache: HashMap::new(),
            active_handlers: Vec::new(),
            finally_stack: Vec::new(),
            callee,
        }
    }

    fn load_fast(&self, slot: u32) -> Value {
        match self.cell_cache.get(&slot) {
            Some(cell) => cell.borrow().clone(),
            None => self.locals[slot as usize].clone(),
        }
    }

    fn store_fast(&mut self, slot: u32, value: Value) {
        match self.cell_cache.get(&slot) {
            Some(cell) => *cell.borrow_mut() = value,
            None => self.locals[slot as usize] = value,
        }
    }

    /// Gets-or-creates the shared cell for one of this frame's own locals
    /// (`MakeCell` with `depth_minus_one == 0`, the common case of a function
    /// capturing a variable from its immediate enclosing scope).
    fn cell_for_own_slot(&mut self, slot: u32) -> Cell {
        if let Some(cell) = self.cell_cache.get(&slot) {
            return cell.clone();
        }
        let cell: Cell = Rc::new(RefCell::new(self.locals[slot as usize].clone()));
        self.cell_cache.insert(slot, cell.clone());
        cell
    }
}

enum Step {
    Continue,
    Halt(Value),
}

/// One VM instance: its own operand stack, frame stack and handler state,
/// executing a single immutable `Code` (§4.6 "State per VM instance"). Not
/// `Sync`/`Send` by construction — parallelism is across distinct `Vm`s over
/// the same shared `Code`, never within one (§5).
pub struct Vm {
    globals: Vec<Value>,
    operand_stack: Vec<Value>,
    frames: Vec<Frame>,
    cell_worklist: Vec<Cell>,
    step_count: u64,
    deadline: Option<Instant>,
    observer: Option<Box<dyn Observer>>,
    type_registry: Box<dyn TypeRegistry>,
    max_steps: Option<u64>,
    max_stack_depth: usize,
    filename: String,
}

/// Top-level `run`, mirroring §6's `run(code, opts) -> Result<Value, RuntimeError>`.
/// Validates the environment (testable property #8) before a single
/// instruction executes, then drives the dispatch loop to completion.
pub fn run(code: &Rc<Code>, opts: RunOptions) -> Result<HostValue, RuntimeError> {
    let missing = host::missing_globals(&opts.env, code.env_keys());
    if !missing.is_empty() {
        return Err(RuntimeError {
            kind: RuntimeErrorKind::MissingGlobals { names: missing },
            location: SourceLocation::zero(),
            filename: code.filename().to_string(),
            source_line: None,
        });
    }

    let registry = opts.type_registry.unwrap_or_else(|| Box::new(host::DefaultTypeRegistry));
    let mut globals = vec![Value::Nil; code.global_count() as usize];
    for (i, name) in code.env_keys().iter().enumerate() {
        let hv = opts.env.get(name).expect("checked by missing_globals above");
        globals[i] = host::to_internal(hv, registry.as_ref());
    }

    let mut vm = Vm {
        globals,
        operand_stack: Vec::new(),
        frames: Vec::new(),
        cell_worklist: Vec::new(),
        step_count: 0,
        deadline: opts.timeout.map(|d| Instant::now() + d),
        observer: opts.observer,
        type_registry: registry,
        max_steps: opts.max_steps,
        max_stack_depth: opts.max_stack_depth,
        filename: code.filename().to_string(),
    };

    let locals = vec![Value::Nil; code.local_count() as usize];
    vm.frames.push(Frame::new(code.clone(), locals, Vec::new(), Value::Nil));

    let result = vm.dispatch();
    match result {
        Ok(value) => Ok(host::to_host(&value, vm.type_registry.as_ref(), opts.raw_result)),
        Err(exc) => Err(vm.to_runtime_error(exc)),
    }
}

impl Vm {
    fn to_runtime_error(&self, exc: Exception) -> RuntimeError {
        let location = exc.location;
        let source_line = self.frames.last().and_then(|f| f.code.get_source_line(location.line));
        RuntimeError { kind: exc.kind, location, filename: self.filename.clone(), source_line }
    }

    fn current_location(&self) -> SourceLocation {
        let frame = self.frames.last().expect("dispatch always has a current frame");
        // `ip` has already advanced past the instruction being executed.
        let ip = frame.ip.saturating_sub(1);
        frame.code.location_at(ip)
    }

    fn err(&self, kind: RuntimeErrorKind) -> Exception {
        Exception { kind, location: self.current_location() }
    }

    fn push(&mut self, v: Value) {
        self.operand_stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.operand_stack.pop().expect("bytecode is stack-balanced by construction")
    }

    fn peek(&self) -> &Value {
        self.operand_stack.last().expect("bytecode is stack-balanced by construction")
    }

    // --- main loop -----------------------------------------------------------

    fn dispatch(&mut self) -> Result<Value, Exception> {
        loop {
            match self.step()? {
                Some(value) => return Ok(value),
                None => continue,
            }
        }
    }

    /// Executes exactly one instruction (one dispatch-loop iteration),
    /// returning `Some(value)` only when the root frame has just returned.
    fn step(&mut self) -> Result<Option<Value>, Exception> {
        if let Some(max) = self.max_steps {
            if self.step_count >= max {
                return Err(self.err(RuntimeErrorKind::StepLimitExceeded));
            }
        }
        self.step_count += 1;
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(self.err(RuntimeErrorKind::DeadlineExceeded));
            }
        }

        let code = self.frames.last().unwrap().code.clone();
        let ip = self.frames.last().unwrap().ip;
        let op = code.opcode_at(ip);
        let n = op.operand_count();
        let operands: Vec<u16> = code.instructions()[ip + 1..ip + 1 + n].to_vec();
        self.frames.last_mut().unwrap().ip = ip + 1 + n;

        if let Some(observer) = self.observer.as_deref_mut() {
            observer.on_step(&code, ip);
        }

        match self.execute(op, &operands, &code) {
            Ok(Step::Continue) => Ok(None),
            Ok(Step::Halt(value)) => Ok(Some(value)),
            Err(exc) => match self.unwind(exc) {
                Some(terminal) => Err(terminal),
                None => Ok(None),
            },
        }
    }

    /// Searches outward from the current frame for a handler willing to
    /// accept `exc` (§4.6 "Unwinding"). Returns `None` once one redirected
    /// execution; `Some(exc)` if it escaped every frame.
    fn unwind(&mut self, exc: Exception) -> Option<Exception> {
        loop {
            if self.frames.is_empty() {
                return Some(exc);
            }
            let active = self.frames.last_mut().unwrap().active_handlers.pop();
            match active {
                Some(active) => {
                    let handler: ExceptionHandler = self.frames.last().unwrap().code.handlers()[active.handler_idx];
                    if !handler.has_catch && !handler.has_finally() {
                        // A bare `try` with neither clause catches nothing.
                        continue;
                    }
                    let value = exc.value();
                    self.push(value);
                    let frame = self.frames.last_mut().unwrap();
                    frame.ip = handler.catch_start as usize;
                    if !handler.has_catch {
                        frame.finally_stack.push(FinallyEntry::Reraise(exc.kind.clone(), exc.location));
                    } else {
                        frame.finally_stack.push(FinallyEntry::Normal);
                    }
                    return None;
                }
                None => {
                    self.frames.pop();
                }
            }
        }
    }

    // --- calls -----------------------------------------------------------

    fn do_call(&mut self, callee: Value, args: Vec<Value>) -> Result<Step, Exception> {
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.on_call(&callee, &args);
        }
        match &callee {
            Value::Closure(closure) => self.call_closure(closure.clone(), args),
            Value::Native(native) => {
                let native = native.clone();
                let result = {
                    let mut ctx = VmHostContext { vm: &mut *self };
                    native.call(&mut ctx, &args)
                };
                match result {
                    Ok(v) => {
                        if let Some(observer) = self.observer.as_deref_mut() {
                            observer.on_return(&callee, &v);
                        }
                        self.push(v);
                        Ok(Step::Continue)
                    }
                    Err(v) => Err(self.err(RuntimeErrorKind::Raised(v))),
                }
            }
            Value::Partial(partial) => {
                let mut combined = partial.bound_args.clone();
                combined.extend(args);
                let callee = partial.callee.clone();
                self.do_call(callee, combined)
            }
            other => Err(self.err(RuntimeErrorKind::TypeError {
                expected: "callable".to_string(),
                got: other.type_name().to_string(),
            })),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, args: Vec<Value>) -> Result<Step, Exception> {
        if self.frames.len() >= self.max_stack_depth {
            return Err(self.err(RuntimeErrorKind::StackOverflow));
        }
        let template = &closure.template;
        let params_len = template.parameters.len();
        let argc = args.len();

        if argc < template.required_count as usize {
            return Err(self.err(RuntimeErrorKind::ArgumentError {
                expected: format!("at least {}", template.required_count),
                got: argc,
            }));
        }
        if argc > params_len && template.rest_param.is_none() {
            return Err(self.err(RuntimeErrorKind::ArgumentError {
                expected: format!("at most {}", params_len),
                got: argc,
            }));
        }

        let mut locals = vec![Value::Nil; template.code.local_count() as usize];
        let mut args = args.into_iter();
        for i in 0..params_len {
            let value = match args.next() {
                Some(v) => v,
                None => match template.defaults.get(i).and_then(|d| d.as_ref()) {
                    Some(constant) => Value::from_constant(constant),
                    None => Value::Nil,
                },
            };
            locals[i] = value;
        }
        if template.rest_param.is_some() {
            let rest: Vec<Value> = args.collect();
            locals[params_len] = Value::list(rest);
        }
        if let Some(slot) = template.self_slot {
            locals[slot as usize] = Value::Closure(closure.clone());
        }

        self.operand_stack.reserve(template.code.max_call_args() as usize);
        let callee_value = Value::Closure(closure.clone());
        let code = template.code.clone();
        let cells = closure.cells.clone();
        self.frames.push(Frame::new(code, locals, cells, callee_value));
        Ok(Step::Continue)
    }

    // --- opcode execution --------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, op: Opcode, operands: &[u16], code: &Rc<Code>) -> Result<Step, Exception> {
        use Opcode::*;
        match op {
            LoadConst => {
                let v = Value::from_constant(&code.constants()[operands[0] as usize]);
                self.push(v);
            }
            Nil => self.push(Value::Nil),
            True => self.push(Value::Bool(true)),
            False => self.push(Value::Bool(false)),

            PopTop => {
                self.pop();
            }
            Copy => {
                let n = operands[0] as usize;
                let idx = self.operand_stack.len() - 1 - n;
                let v = self.operand_stack[idx].clone();
                self.push(v);
            }
            Swap => {
                let n = operands[0] as usize;
                let len = self.operand_stack.len();
                self.operand_stack.swap(len - 1, len - 1 - n);
            }
            Nop => {}

            LoadGlobal => self.push(self.globals[operands[0] as usize].clone()),
            StoreGlobal => {
                let v = self.pop();
                self.globals[operands[0] as usize] = v;
            }
            LoadFast => {
                let v = self.frames.last().unwrap().load_fast(operands[0] as u32);
                self.push(v);
            }
            StoreFast => {
                let v = self.pop();
                self.frames.last_mut().unwrap().store_fast(operands[0] as u32, v);
            }
            LoadFree => {
                let v = self.frames.last().unwrap().closure_cells[operands[0] as usize].borrow().clone();
                self.push(v);
            }
            StoreFree => {
                let v = self.pop();
                let cell = self.frames.last().unwrap().closure_cells[operands[0] as usize].clone();
                *cell.borrow_mut() = v;
            }
            MakeCell => {
                let slot = operands[0] as u32;
                let depth_minus_one = operands[1] as usize;
                let owner_idx = self.frames.len() - 1 - depth_minus_one;
                let cell = self.frames[owner_idx].cell_for_own_slot(slot);
                self.cell_worklist.push(cell);
            }
            LoadClosure => {
                let const_idx = operands[0] as usize;
                let template = match &code.constants()[const_idx] {
                    Constant::Function(t) => t.clone(),
                    _ => unreachable!("LoadClosure always indexes a function constant"),
                };
                let n = template.free_count as usize;
                let start = self.cell_worklist.len() - n;
                let cells: Vec<Cell> = self.cell_worklist.split_off(start);
                self.push(Value::Closure(Rc::new(Closure { template, cells })));
            }

            BinaryOp => {
                let kind: BinaryOpKind = operands[0].into();
                let b = self.pop();
                let a = self.pop();
                let v = Value::binary_op(kind, &a, &b).map_err(|e| self.err(e.into()))?;
                self.push(v);
            }
            CompareOp => {
                let kind: CompareOpKind = operands[0].into();
                let b = self.pop();
                let a = self.pop();
                let v = Value::compare_op(kind, &a, &b).map_err(|e| self.err(e.into()))?;
                self.push(Value::Bool(v));
            }
            ContainsOp => {
                let container = self.pop();
                let item = self.pop();
                let v = container.contains(&item).map_err(|e| self.err(e.into()))?;
                self.push(Value::Bool(v));
            }
            UnaryNot => {
                let v = self.pop();
                self.push(Value::Bool(!v.truthy()));
            }
            UnaryNegative => {
                let v = self.pop();
                let out = match v {
                    Value::Int(i) => {
                        Value::Int(i.checked_neg().ok_or_else(|| self.err(RuntimeErrorKind::Overflow))?)
                    }
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "int or float".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                self.push(out);
            }
            Length => {
                let v = self.pop();
                let len = v.length().map_err(|e| self.err(e.into()))?;
                self.push(Value::Int(len));
            }

            BuildList => self.push(Value::list(Vec::new())),
            BuildMap => self.push(Value::map(OrderedMap::new())),
            BuildString => {
                let n = operands[0] as usize;
                let start = self.operand_stack.len() - n;
                let parts: Vec<String> = self
                    .operand_stack
                    .drain(start..)
                    .map(|v| match v {
                        Value::String(s) => s.to_string(),
                        other => other.inspect(),
                    })
                    .collect();
                self.push(Value::string(parts.concat()));
            }
            ListAppend => {
                let v = self.pop();
                match self.peek() {
                    Value::List(list) => list.borrow_mut().push(v),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "list".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                }
            }
            ListExtend => {
                let v = self.pop();
                let items = match &v {
                    Value::List(items) => items.borrow().clone(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "list".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                match self.peek() {
                    Value::List(list) => list.borrow_mut().extend(items),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "list".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                }
            }
            MapSet => {
                let value = self.pop();
                let key = self.pop();
                let key = match key {
                    Value::String(s) => s.to_string(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "string key".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                match self.peek() {
                    Value::Map(map) => map.borrow_mut().insert(key, value),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "map".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                }
            }
            MapMerge => {
                let other_map = self.pop();
                let other_map = match &other_map {
                    Value::Map(m) => m.borrow().clone(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "map".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                match self.peek() {
                    Value::Map(map) => map.borrow_mut().merge_from(&other_map),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "map".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                }
            }
            BinarySubscr => {
                let index = self.pop();
                let target = self.pop();
                let v = self.subscript(&target, &index)?;
                self.push(v);
            }
            StoreSubscr => {
                let value = self.pop();
                let index = self.pop();
                let target = self.pop();
                self.store_subscript(&target, &index, value)?;
            }
            Slice => {
                let high = self.pop();
                let low = self.pop();
                let target = self.pop();
                let v = self.slice(&target, &low, &high)?;
                self.push(v);
            }
            Unpack => {
                let n = operands[0] as usize;
                let source = self.pop();
                let items = match &source {
                    Value::List(items) => items.borrow().clone(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "list".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                for i in 0..n {
                    self.push(items.get(i).cloned().unwrap_or(Value::Nil));
                }
            }

            LoadAttr => {
                let name = code.names()[operands[0] as usize].clone();
                let target = self.pop();
                let v = self.load_attr(&target, &name, false)?;
                self.push(v);
            }
            LoadAttrOrNil => {
                let name = code.names()[operands[0] as usize].clone();
                let target = self.pop();
                let v = self.load_attr(&target, &name, true)?;
                self.push(v);
            }
            StoreAttr => {
                let name = code.names()[operands[0] as usize].clone();
                let value = self.pop();
                let target = self.pop();
                self.store_attr(&target, &name, value)?;
            }

            JumpForward => {
                self.frames.last_mut().unwrap().ip += operands[0] as usize;
            }
            JumpBackward => {
                self.frames.last_mut().unwrap().ip -= operands[0] as usize;
            }
            PopJumpForwardIfTrue => {
                let v = self.pop();
                if v.truthy() {
                    self.frames.last_mut().unwrap().ip += operands[0] as usize;
                }
            }
            PopJumpForwardIfFalse => {
                let v = self.pop();
                if !v.truthy() {
                    self.frames.last_mut().unwrap().ip += operands[0] as usize;
                }
            }
            PopJumpForwardIfNil => {
                let v = self.pop();
                if matches!(v, Value::Nil) {
                    self.frames.last_mut().unwrap().ip += operands[0] as usize;
                }
            }
            PopJumpForwardIfNotNil => {
                let v = self.pop();
                if !matches!(v, Value::Nil) {
                    self.frames.last_mut().unwrap().ip += operands[0] as usize;
                }
            }

            MakeIterator => {
                let v = self.pop();
                let iter = v.make_iterator().map_err(|e| self.err(e.into()))?;
                self.push(iter);
            }
            IteratorHasNext => {
                let has_next = match self.peek() {
                    Value::Iterator(it) => it.has_next(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "iterator".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                self.push(Value::Bool(has_next));
            }
            IteratorNext => {
                let v = match self.peek() {
                    Value::Iterator(it) => it.next(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "iterator".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                self.push(v);
            }

            Call => {
                let argc = operands[0] as usize;
                let start = self.operand_stack.len() - argc;
                let args: Vec<Value> = self.operand_stack.drain(start..).collect();
                let callee = self.pop();
                return self.do_call(callee, args);
            }
            CallSpread => {
                let args_list = self.pop();
                let args = match args_list {
                    Value::List(items) => items.borrow().clone(),
                    other => {
                        return Err(self.err(RuntimeErrorKind::TypeError {
                            expected: "list".to_string(),
                            got: other.type_name().to_string(),
                        }))
                    }
                };
                let callee = self.pop();
                return self.do_call(callee, args);
            }
            Partial => {
                let argc = operands[0] as usize;
                let start = self.operand_stack.len() - argc;
                let bound_args: Vec<Value> = self.operand_stack.drain(start..).collect();
                let callee = self.pop();
                self.push(Value::Partial(Rc::new(PartialCall { callee, bound_args })));
            }

            PushExcept => {
                let handler_idx = operands[0] as usize;
                self.frames.last_mut().unwrap().active_handlers.push(ActiveHandler { handler_idx });
            }
            PopExcept => {
                self.frames.last_mut().unwrap().active_handlers.pop();
            }
            Throw => {
                let v = self.pop();
                return Err(self.err(RuntimeErrorKind::Raised(v)));
            }
            EndFinally => {
                let saved = self.pop();
                let entry = self.frames.last_mut().unwrap().finally_stack.pop();
                match entry {
                    Some(FinallyEntry::Reraise(kind, location)) => {
                        let kind = if let RuntimeErrorKind::Raised(_) = kind {
                            RuntimeErrorKind::Raised(saved)
                        } else {
                            kind
                        };
                        return Err(Exception { kind, location });
                    }
                    _ => self.push(saved),
                }
            }

            ReturnValue => {
                let v = self.pop();
                let frame = self.frames.pop().expect("ReturnValue always has a current frame");
                if let Some(observer) = self.observer.as_deref_mut() {
                    observer.on_return(&frame.callee, &v);
                }
                if self.frames.is_empty() {
                    return Ok(Step::Halt(v));
                }
                self.push(v);
            }
        }
        Ok(Step::Continue)
    }

    // --- container/attribute helpers ----------------------------------------

    fn subscript(&self, target: &Value, index: &Value) -> Result<Value, Exception> {
        match target {
            Value::List(items) => {
                let items = items.borrow();
                let i = self.normalize_index(index, items.len())?;
                items.get(i).cloned().ok_or_else(|| {
                    self.err(RuntimeErrorKind::IndexError(format!("index {} out of range", index.inspect())))
                })
            }
            Value::Map(map) => match index {
                Value::String(key) => map
                    .borrow()
                    .get(key)
                    .cloned()
                    .ok_or_else(|| self.err(RuntimeErrorKind::KeyError(key.to_string()))),
                other => Err(self.err(RuntimeErrorKind::TypeError {
                    expected: "string key".to_string(),
                    got: other.type_name().to_string(),
                })),
            },
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let i = self.normalize_index(index, chars.len())?;
                chars.get(i).map(|c| Value::string(c.to_string())).ok_or_else(|| {
                    self.err(RuntimeErrorKind::IndexError(format!("index {} out of range", index.inspect())))
                })
            }
            Value::Bytes(b) => {
                let i = self.normalize_index(index, b.len())?;
                b.get(i).map(|&byte| Value::Int(byte as i64)).ok_or_else(|| {
                    self.err(RuntimeErrorKind::IndexError(format!("index {} out of range", index.inspect())))
                })
            }
            other => Err(self.err(RuntimeErrorKind::TypeError {
                expected: "list, map, string or bytes".to_string(),
                got: other.type_name().to_string(),
            })),
        }
    }

    fn store_subscript(&self, target: &Value, index: &Value, value: Value) -> Result<(), Exception> {
        match target {
            Value::List(items) => {
                let len = items.borrow().len();
                let i = self.normalize_index(index, len)?;
                let mut items = items.borrow_mut();
                if i >= items.len() {
                    return Err(self.err(RuntimeErrorKind::IndexError(format!(
                        "index {} out of range",
                        index.inspect()
                    ))));
                }
                items[i] = value;
                Ok(())
            }
            Value::Map(map) => match index {
                Value::String(key) => {
                    map.borrow_mut().insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(self.err(RuntimeErrorKind::TypeError {
                    expected: "string key".to_string(),
                    got: other.type_name().to_string(),
                })),
            },
            other => Err(self.err(RuntimeErrorKind::TypeError {
                expected: "list or map".to_string(),
                got: other.type_name().to_string(),
            })),
        }
    }

    /// Negative-from-end index normalization shared by subscript/slice.
    fn normalize_index(&self, index: &Value, len: usize) -> Result<usize, Exception> {
        let i = match index {
            Value::Int(i) => *i,
            other => {
                return Err(self.err(RuntimeErrorKind::TypeError {
                    expected: "int index".to_string(),
                    got: other.type_name().to_string(),
                }))
            }
        };
        let resolved = if i < 0 { i + len as i64 } else { i };
        if resolved < 0 {
            return Err(self.err(RuntimeErrorKind::IndexError(format!("index {} out of range", i))));
        }
        Ok(resolved as usize)
    }

    fn slice(&self, target: &Value, low: &Value, high: &Value) -> Result<Value, Exception> {
        let clamp = |v: &Value, len: usize, default: usize| -> Result<usize, Exception> {
            match v {
                Value::Nil => Ok(default),
                Value::Int(i) => {
                    let resolved = if *i < 0 { i + len as i64 } else { *i };
                    Ok(resolved.clamp(0, len as i64) as usize)
                }
                other => Err(self.err(RuntimeErrorKind::TypeError {
                    expected: "int bound".to_string(),
                    got: other.type_name().to_string(),
                })),
            }
        };
        match target {
            Value::List(items) => {
                let items = items.borrow();
                let lo = clamp(low, items.len(), 0)?;
                let hi = clamp(high, items.len(), items.len())?.max(lo);
                Ok(Value::list(items[lo..hi].to_vec()))
            }
            Value::String(s) => {
                let chars: Vec<char> = s.chars().collect();
                let lo = clamp(low, chars.len(), 0)?;
                let hi = clamp(high, chars.len(), chars.len())?.max(lo);
                Ok(Value::string(chars[lo..hi].iter().collect::<String>()))
            }
            other => Err(self.err(RuntimeErrorKind::TypeError {
                expected: "list or string".to_string(),
                got: other.type_name().to_string(),
            })),
        }
    }

    /// Attribute access is duck-typed over `Map`/`Module` entries (the
    /// language's objects are maps; a method is just a closure value stored
    /// under a key) plus a couple of hardcoded introspection fields on
    /// `Error` values. Any other receiver type has no attributes.
    fn load_attr(&self, target: &Value, name: &str, or_nil: bool) -> Result<Value, Exception> {
        let found = match target {
            Value::Map(map) => map.borrow().get(name).cloned(),
            Value::Module(map) => map.get(name).cloned(),
            Value::Error(e) => match name {
                "message" => Some(Value::string(e.message.clone())),
                "cause" => Some(e.cause.as_ref().map(|c| Value::Error(c.clone())).unwrap_or(Value::Nil)),
                _ => None,
            },
            Value::Nil if or_nil => return Ok(Value::Nil),
            _ => None,
        };
        match found {
            Some(v) => Ok(v),
            None if or_nil => Ok(Value::Nil),
            None => Err(self.err(RuntimeErrorKind::AttributeError(format!(
                "'{}' has no attribute '{}'",
                target.type_name(),
                name
            )))),
        }
    }

    fn store_attr(&self, target: &Value, name: &str, value: Value) -> Result<(), Exception> {
        match target {
            Value::Map(map) => {
                map.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            other => Err(self.err(RuntimeErrorKind::TypeError {
                expected: "map".to_string(),
                got: other.type_name().to_string(),
            })),
        }
    }
}

/// `value::HostContext` implementation handed to native callables while they
/// run, so a builtin like `map`/`filter` can call back into script-level
/// closures without reaching for VM internals directly.
struct VmHostContext<'a> {
    vm: &'a mut Vm,
}

impl<'a> HostContext for VmHostContext<'a> {
    fn steps_remaining(&self) -> Option<u64> {
        self.vm.max_steps.map(|max| max.saturating_sub(self.vm.step_count))
    }

    fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, Value> {
        match self.vm.do_call(callee.clone(), args.to_vec()) {
            Ok(Step::Halt(v)) => Ok(v),
            Ok(Step::Continue) => {
                // A script closure call pushed a frame; drive dispatch until
                // that frame (and only that frame) returns, then hand the
                // result straight back to the builtin that asked for it.
                let target_depth = self.vm.frames.len().saturating_sub(1);
                loop {
                    match self.vm.step() {
                        Ok(Some(v)) => return Ok(v),
                        Ok(None) => {
                            if self.vm.frames.len() <= target_depth {
                                return Ok(self.vm.pop());
                            }
                        }
                        Err(exc) => return Err(exc.value()),
                    }
                }
            }
            Err(exc) => Err(exc.value()),
        }
    }
}

/// Minimal disassembler used by tests and any future tooling: renders one
/// line per instruction as `mnemonic operand operand`.
pub fn disassemble(code: &Code) -> String {
    let mut out = String::new();
    for (pos, op, operands) in code.iter_instructions() {
        out.push_str(&format!("{:>4} {}", pos, op.mnemonic().blue()));
        for operand in operands {
            out.push_str(&format!(" {}", operand));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_program, CompilerConfig};
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn eval(src: &str) -> Value {
        let tokens = tokenize(src);
        let program = Parser::new(tokens).parse_program().expect("parse");
        let code = compile_program(&program, CompilerConfig::new("<test>", src)).expect("compile");
        let locals = vec![Value::Nil; code.local_count() as usize];
        let mut vm = Vm {
            globals: vec![Value::Nil; code.global_count() as usize],
            operand_stack: Vec::new(),
            frames: vec![Frame::new(code.clone(), locals, Vec::new(), Value::Nil)],
            cell_worklist: Vec::new(),
            step_count: 0,
            deadline: None,
            observer: None,
            type_registry: Box::new(host::DefaultTypeRegistry),
            max_steps: None,
            max_stack_depth: 1024,
            filename: "<test>".to_string(),
        };
        vm.dispatch().unwrap_or_else(|e| panic!("runtime error: {}", e.kind.message()))
    }

    #[test]
    fn arithmetic() {
        assert!(matches!(eval("1 + 2 * 3"), Value::Int(7)));
    }

    #[test]
    fn let_bindings() {
        assert!(matches!(eval("let x = 10; let y = 32; x + y"), Value::Int(42)));
    }

    #[test]
    fn recursion() {
        let src = "function fact(n) { if (n <= 1) { return 1 } return n * fact(n - 1) } fact(5)";
        assert!(matches!(eval(src), Value::Int(120)));
    }

    #[test]
    fn closures_share_mutable_cell() {
        let src =
            "function make() { let c = 0; return function() { c = c + 1; return c } } let f = make(); f(); f(); f()";
        assert!(matches!(eval(src), Value::Int(3)));
    }

    #[test]
    fn try_catch_binds_thrown_value() {
        let src = r#"try { throw "oops" } catch e { "caught: " + e }"#;
        match eval(src) {
            Value::String(s) => assert_eq!(&*s, "caught: oops"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn object_destructuring_with_default() {
        assert!(matches!(eval("let {a, b = 10} = {a: 1}; a + b"), Value::Int(11)));
    }

    #[test]
    fn array_destructuring() {
        assert!(matches!(eval("let [x, y, z] = [1, 2, 3]; x * 100 + y * 10 + z"), Value::Int(123)));
    }

    #[test]
    fn finally_runs_on_normal_and_exceptional_paths() {
        let normal = eval("let log = []; try { 1 } finally { log = log + [1] } log[0]");
        assert!(matches!(normal, Value::Int(1)));

        let exceptional =
            eval(r#"let log = []; try { try { throw "x" } finally { log = log + [1] } } catch e { log[0] }"#);
        assert!(matches!(exceptional, Value::Int(1)));
    }

    #[test]
    fn while_loop_accumulates() {
        assert!(matches!(
            eval("let i = 0; let sum = 0; while (i < 5) { sum = sum + i; i = i + 1 } sum"),
            Value::Int(10)
        ));
    }

    #[test]
    fn for_loop_over_list() {
        assert!(matches!(eval("let sum = 0; for (x in [1,2,3]) { sum = sum + x } sum"), Value::Int(6)));
    }

    #[test]
    fn break_and_continue() {
        let src =
            "let sum = 0; for (x in [1,2,3,4,5]) { if (x == 2) { continue } if (x == 4) { break } sum = sum + x } sum";
        assert!(matches!(eval(src), Value::Int(4)));
    }
}
