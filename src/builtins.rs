// File: src/builtins.rs
//
// The default host-ecosystem-free standard set (§6 `builtins()`): opaque
// `math`/`rand`/`regexp` modules plus always-on intrinsics (`len`, `type`,
// numeric coercions, `range`, `map`, `filter`). Everything here is a
// `HostValue::Raw(Value::Native(..))` or a namespace `Map`, exactly the shape
// a caller's own env map entries take — there is nothing VM-internal about
// this table beyond what any embedder could build themselves.

use std::fmt;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::host::HostValue;
use crate::value::{HostCallable, HostContext, OrderedMap, Value, ValueError};

fn describe_value_error(e: ValueError) -> String {
    match e {
        ValueError::TypeError { expected, got } => format!("type error: expected {}, got {}", expected, got),
        ValueError::DivisionByZero => "division by zero".to_string(),
        ValueError::Overflow => "arithmetic overflow".to_string(),
        ValueError::IndexError(m) => format!("index error: {}", m),
        ValueError::KeyError(m) => format!("key error: {}", m),
        ValueError::AttributeError(m) => format!("attribute error: {}", m),
    }
}

/// A native function wrapping a plain closure. Mirrors the teacher's
/// approach of keeping builtin bodies as ordinary Rust functions rather than
/// one large match — each builtin is its own small struct implementing
/// `HostCallable`.
struct NativeFn {
    name: &'static str,
    arity: Option<usize>,
    func: fn(&mut dyn HostContext, &[Value]) -> Result<Value, Value>,
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native {}>", self.name)
    }
}

impl HostCallable for NativeFn {
    fn name(&self) -> &str {
        self.name
    }

    fn call(&self, ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
        if let Some(arity) = self.arity {
            if args.len() != arity {
                return Err(Value::string(format!(
                    "{} expects {} argument(s), got {}",
                    self.name,
                    arity,
                    args.len()
                )));
            }
        }
        (self.func)(ctx, args)
    }
}

fn native(name: &'static str, arity: Option<usize>, func: fn(&mut dyn HostContext, &[Value]) -> Result<Value, Value>) -> Value {
    Value::Native(std::rc::Rc::new(NativeFn { name, arity, func }))
}

fn expect_float(v: &Value) -> Result<f64, Value> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(Value::string(format!("expected a number, got {}", other.type_name()))),
    }
}

fn expect_string(v: &Value) -> Result<String, Value> {
    match v {
        Value::String(s) => Ok(s.to_string()),
        other => Err(Value::string(format!("expected a string, got {}", other.type_name()))),
    }
}

fn expect_int(v: &Value) -> Result<i64, Value> {
    match v {
        Value::Int(i) => Ok(*i),
        other => Err(Value::string(format!("expected an int, got {}", other.type_name()))),
    }
}

// --- math ------------------------------------------------------------------

macro_rules! math_unary_fn {
    ($name:ident, $op:expr) => {
        fn $name(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
            let x = expect_float(&args[0])?;
            Ok(Value::Float(($op)(x)))
        }
    };
}

math_unary_fn!(math_abs, f64::abs);
math_unary_fn!(math_sqrt, f64::sqrt);
math_unary_fn!(math_floor, f64::floor);
math_unary_fn!(math_ceil, f64::ceil);
math_unary_fn!(math_round, f64::round);
math_unary_fn!(math_sin, f64::sin);
math_unary_fn!(math_cos, f64::cos);
math_unary_fn!(math_tan, f64::tan);
math_unary_fn!(math_log, f64::ln);
math_unary_fn!(math_exp, f64::exp);

fn math_pow(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let base = expect_float(&args[0])?;
    let exp = expect_float(&args[1])?;
    Ok(Value::Float(base.powf(exp)))
}

fn math_min(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let a = expect_float(&args[0])?;
    let b = expect_float(&args[1])?;
    Ok(Value::Float(a.min(b)))
}

fn math_max(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let a = expect_float(&args[0])?;
    let b = expect_float(&args[1])?;
    Ok(Value::Float(a.max(b)))
}

fn math_module() -> Value {
    let mut module = OrderedMap::new();
    module.insert("PI".to_string(), Value::Float(std::f64::consts::PI));
    module.insert("E".to_string(), Value::Float(std::f64::consts::E));
    module.insert("abs".to_string(), native("math.abs", Some(1), math_abs));
    module.insert("sqrt".to_string(), native("math.sqrt", Some(1), math_sqrt));
    module.insert("floor".to_string(), native("math.floor", Some(1), math_floor));
    module.insert("ceil".to_string(), native("math.ceil", Some(1), math_ceil));
    module.insert("round".to_string(), native("math.round", Some(1), math_round));
    module.insert("sin".to_string(), native("math.sin", Some(1), math_sin));
    module.insert("cos".to_string(), native("math.cos", Some(1), math_cos));
    module.insert("tan".to_string(), native("math.tan", Some(1), math_tan));
    module.insert("log".to_string(), native("math.log", Some(1), math_log));
    module.insert("exp".to_string(), native("math.exp", Some(1), math_exp));
    module.insert("pow".to_string(), native("math.pow", Some(2), math_pow));
    module.insert("min".to_string(), native("math.min", Some(2), math_min));
    module.insert("max".to_string(), native("math.max", Some(2), math_max));
    Value::Module(std::rc::Rc::new(module))
}

// --- rand --------------------------------------------------------------

fn rand_float(_ctx: &mut dyn HostContext, _args: &[Value]) -> Result<Value, Value> {
    Ok(Value::Float(rand::thread_rng().gen::<f64>()))
}

fn rand_int(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let lo = expect_int(&args[0])?;
    let hi = expect_int(&args[1])?;
    if lo >= hi {
        return Err(Value::string("rand.int requires low < high".to_string()));
    }
    Ok(Value::Int(rand::thread_rng().gen_range(lo..hi)))
}

fn rand_choice(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    match &args[0] {
        Value::List(items) => {
            let items = items.borrow();
            if items.is_empty() {
                return Err(Value::string("rand.choice requires a non-empty list".to_string()));
            }
            let idx = rand::thread_rng().gen_range(0..items.len());
            Ok(items[idx].clone())
        }
        other => Err(Value::string(format!("expected a list, got {}", other.type_name()))),
    }
}

fn rand_module() -> Value {
    let mut module = OrderedMap::new();
    module.insert("float".to_string(), native("rand.float", Some(0), rand_float));
    module.insert("int".to_string(), native("rand.int", Some(2), rand_int));
    module.insert("choice".to_string(), native("rand.choice", Some(1), rand_choice));
    Value::Module(std::rc::Rc::new(module))
}

// --- regexp ------------------------------------------------------------

fn compile_regex(pattern: &str) -> Result<Regex, Value> {
    Regex::new(pattern).map_err(|e| Value::string(format!("invalid pattern: {}", e)))
}

fn regexp_is_match(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let pattern = expect_string(&args[0])?;
    let text = expect_string(&args[1])?;
    let re = compile_regex(&pattern)?;
    Ok(Value::Bool(re.is_match(&text)))
}

fn regexp_find(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let pattern = expect_string(&args[0])?;
    let text = expect_string(&args[1])?;
    let re = compile_regex(&pattern)?;
    Ok(match re.find(&text) {
        Some(m) => Value::string(m.as_str().to_string()),
        None => Value::Nil,
    })
}

fn regexp_replace(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let pattern = expect_string(&args[0])?;
    let text = expect_string(&args[1])?;
    let replacement = expect_string(&args[2])?;
    let re = compile_regex(&pattern)?;
    Ok(Value::string(re.replace_all(&text, replacement.as_str()).into_owned()))
}

fn regexp_split(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let pattern = expect_string(&args[0])?;
    let text = expect_string(&args[1])?;
    let re = compile_regex(&pattern)?;
    let parts: Vec<Value> = re.split(&text).map(|s| Value::string(s.to_string())).collect();
    Ok(Value::list(parts))
}

fn regexp_module() -> Value {
    let mut module = OrderedMap::new();
    module.insert("is_match".to_string(), native("regexp.is_match", Some(2), regexp_is_match));
    module.insert("find".to_string(), native("regexp.find", Some(2), regexp_find));
    module.insert("replace".to_string(), native("regexp.replace", Some(3), regexp_replace));
    module.insert("split".to_string(), native("regexp.split", Some(2), regexp_split));
    Value::Module(std::rc::Rc::new(module))
}

// --- always-on intrinsics ------------------------------------------------

fn intrinsic_len(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    args[0].length().map(Value::Int).map_err(|e| Value::string(describe_value_error(e)))
}

fn intrinsic_type(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    Ok(Value::string(args[0].type_name().to_string()))
}

fn intrinsic_int(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    Ok(match &args[0] {
        Value::Int(i) => Value::Int(*i),
        Value::Float(f) => Value::Int(*f as i64),
        Value::String(s) => {
            Value::Int(s.trim().parse::<i64>().map_err(|_| Value::string(format!("cannot parse '{}' as int", s)))?)
        }
        Value::Bool(b) => Value::Int(*b as i64),
        other => return Err(Value::string(format!("cannot convert {} to int", other.type_name()))),
    })
}

fn intrinsic_float(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    Ok(match &args[0] {
        Value::Int(i) => Value::Float(*i as f64),
        Value::Float(f) => Value::Float(*f),
        Value::String(s) => Value::Float(
            s.trim().parse::<f64>().map_err(|_| Value::string(format!("cannot parse '{}' as float", s)))?,
        ),
        other => return Err(Value::string(format!("cannot convert {} to float", other.type_name()))),
    })
}

fn intrinsic_string(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    Ok(match &args[0] {
        Value::String(s) => Value::String(s.clone()),
        other => Value::string(other.inspect()),
    })
}

fn intrinsic_range(_ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let (start, end) = match args.len() {
        1 => (0, expect_int(&args[0])?),
        2 => (expect_int(&args[0])?, expect_int(&args[1])?),
        n => return Err(Value::string(format!("range expects 1 or 2 arguments, got {}", n))),
    };
    Ok(Value::list((start..end).map(Value::Int).collect()))
}

fn intrinsic_map(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let items = match &args[0] {
        Value::List(items) => items.borrow().clone(),
        other => return Err(Value::string(format!("expected a list, got {}", other.type_name()))),
    };
    let f = &args[1];
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(ctx.call(f, &[item])?);
    }
    Ok(Value::list(out))
}

fn intrinsic_filter(ctx: &mut dyn HostContext, args: &[Value]) -> Result<Value, Value> {
    let items = match &args[0] {
        Value::List(items) => items.borrow().clone(),
        other => return Err(Value::string(format!("expected a list, got {}", other.type_name()))),
    };
    let f = &args[1];
    let mut out = Vec::new();
    for item in items {
        if ctx.call(f, &[item.clone()])?.truthy() {
            out.push(item);
        }
    }
    Ok(Value::list(out))
}

/// Lazily-built default table, shared across `builtins()` calls the way the
/// teacher keeps its own static lookup tables behind `once_cell::Lazy`.
static DEFAULT_TABLE: Lazy<Vec<(&'static str, Value)>> = Lazy::new(|| {
    vec![
        ("math", math_module()),
        ("rand", rand_module()),
        ("regexp", regexp_module()),
        ("len", native("len", Some(1), intrinsic_len)),
        ("type", native("type", Some(1), intrinsic_type)),
        ("int", native("int", Some(1), intrinsic_int)),
        ("float", native("float", Some(1), intrinsic_float)),
        ("string", native("string", Some(1), intrinsic_string)),
        ("range", native("range", None, intrinsic_range)),
        ("map", native("map", Some(2), intrinsic_map)),
        ("filter", native("filter", Some(2), intrinsic_filter)),
    ]
});

/// §6 `builtins() -> EnvMap`: the default host-ecosystem-free standard set.
/// Returned as `HostValue::Raw` entries since every builtin is either a
/// namespace `Module` or a `Native` callable, neither of which the plain
/// `HostValue` conversion table can represent losslessly (§6's conversion
/// table degrades them to an `inspect()` string on egress, not on ingress).
pub fn builtins() -> std::collections::HashMap<String, HostValue> {
    DEFAULT_TABLE.iter().map(|(name, value)| (name.to_string(), HostValue::Raw(value.clone()))).collect()
}

#[cfg(feature = "time")]
pub mod time {
    use chrono::Utc;

    use crate::value::{HostContext, OrderedMap, Value};

    fn now(_ctx: &mut dyn HostContext, _args: &[Value]) -> Result<Value, Value> {
        Ok(Value::Int(Utc::now().timestamp()))
    }

    /// Opt-in `time` module (§9 open question: "treat `time` as an optional
    /// add-on module"), built by hand rather than folded into
    /// `DEFAULT_TABLE` so the default `builtins()` table stays free of any
    /// date/time dependency when the `time` feature is off.
    pub fn time_module() -> Value {
        let mut module = OrderedMap::new();
        module.insert(
            "now".to_string(),
            super::native("time.now", Some(0), now),
        );
        Value::Module(std::rc::Rc::new(module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HostContext as _;

    struct NullCtx;
    impl HostContext for NullCtx {
        fn steps_remaining(&self) -> Option<u64> {
            None
        }
        fn call(&mut self, _callee: &Value, _args: &[Value]) -> Result<Value, Value> {
            unreachable!("test builtins never call back into script code")
        }
    }

    #[test]
    fn builtins_exposes_math_rand_regexp_and_intrinsics() {
        let table = builtins();
        for name in ["math", "rand", "regexp", "len", "type", "range", "map", "filter"] {
            assert!(table.contains_key(name), "missing builtin {}", name);
        }
    }

    #[test]
    fn math_abs_negates_negative_input() {
        let result = math_abs(&mut NullCtx, &[Value::Float(-4.0)]).unwrap();
        assert!(matches!(result, Value::Float(f) if f == 4.0));
    }

    #[test]
    fn range_with_one_arg_starts_at_zero() {
        let result = intrinsic_range(&mut NullCtx, &[Value::Int(3)]).unwrap();
        match result {
            Value::List(items) => {
                let items = items.borrow();
                assert_eq!(items.len(), 3);
                assert!(matches!(items[0], Value::Int(0)));
            }
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn regexp_is_match_finds_simple_pattern() {
        let result =
            regexp_is_match(&mut NullCtx, &[Value::string("a+".to_string()), Value::string("baaab".to_string())])
                .unwrap();
        assert!(matches!(result, Value::Bool(true)));
    }
}
