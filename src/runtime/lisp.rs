//! A minimal lisp, the crate's reference [`Runtime`].
//!
//! Enough language to exercise every corner of the protocol: integers,
//! strings, symbols, arithmetic, `def`, `do`, `if`, `let`, `quote`,
//! `loop`/`recur`, `println`/`print`, `read-line`, `sleep`, `throw`, and
//! `in-ns`. The result-slot symbols `*1 *2 *3 *e` resolve against the
//! session environment. `recur` and `sleep` check the interrupt flag every
//! pass, so spin loops stay interruptible.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{EvalEnv, EvalIo, EvalStop, Exception, Runtime, RuntimeValue};

// -- Forms ----------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Form {
    Int(i64),
    Str(String),
    Sym(String),
    List(Vec<Form>),
    Vector(Vec<Form>),
}

impl Display for Form {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(int) => write!(f, "{int}"),
            Self::Str(text) => write!(f, "\"{}\"", escape(text)),
            Self::Sym(name) => f.write_str(name),
            Self::List(items) => write_seq(f, items, '(', ')'),
            Self::Vector(items) => write_seq(f, items, '[', ']'),
        }
    }
}

fn write_seq(f: &mut Formatter<'_>, items: &[Form], open: char, close: char) -> fmt::Result {
    write!(f, "{open}")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{item}")?;
    }
    write!(f, "{close}")
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

// -- Reader ---------------------------------------------------------------------------------------

struct Reader<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Reader<'a> {
    fn new(code: &'a str) -> Self {
        Self {
            chars: code.chars().peekable(),
        }
    }

    fn skip_blank(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || c == ',' {
                self.chars.next();
            } else if c == ';' {
                // Comment to end of line.
                for c in self.chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read_all(mut self) -> Result<Vec<Form>, Exception> {
        let mut forms = Vec::new();
        loop {
            self.skip_blank();
            if self.chars.peek().is_none() {
                return Ok(forms);
            }
            forms.push(self.read_form()?);
        }
    }

    fn read_form(&mut self) -> Result<Form, Exception> {
        self.skip_blank();
        match self.chars.peek() {
            None => Err(syntax("unexpected end of input")),
            Some('(') => self.read_seq(')').map(Form::List),
            Some('[') => self.read_seq(']').map(Form::Vector),
            Some(')') | Some(']') => Err(syntax("unmatched delimiter")),
            Some('"') => self.read_string(),
            Some('\'') => {
                self.chars.next();
                let quoted = self.read_form()?;
                Ok(Form::List(vec![Form::Sym("quote".into()), quoted]))
            }
            Some(_) => self.read_atom(),
        }
    }

    fn read_seq(&mut self, close: char) -> Result<Vec<Form>, Exception> {
        self.chars.next();
        let mut items = Vec::new();
        loop {
            self.skip_blank();
            match self.chars.peek() {
                None => return Err(syntax("unexpected end of input in a sequence")),
                Some(&c) if c == close => {
                    self.chars.next();
                    return Ok(items);
                }
                Some(_) => items.push(self.read_form()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Form, Exception> {
        self.chars.next();
        let mut text = String::new();
        loop {
            match self.chars.next() {
                None => return Err(syntax("unterminated string")),
                Some('"') => return Ok(Form::Str(text)),
                Some('\\') => match self.chars.next() {
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some(other) => return Err(syntax(format!("unknown escape \\{other}"))),
                    None => return Err(syntax("unterminated string")),
                },
                Some(other) => text.push(other),
            }
        }
    }

    fn read_atom(&mut self) -> Result<Form, Exception> {
        let mut atom = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || matches!(c, '(' | ')' | '[' | ']' | '"' | ';' | ',') {
                break;
            }
            atom.push(c);
            self.chars.next();
        }

        let is_int = {
            let digits = atom.strip_prefix('-').unwrap_or(&atom);
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        };
        if is_int {
            return atom
                .parse::<i64>()
                .map(Form::Int)
                .map_err(|_| syntax(format!("integer out of range: {atom}")));
        }
        Ok(Form::Sym(atom))
    }
}

// -- Values ---------------------------------------------------------------------------------------

/// A value of the reference runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    Sym(String),
    List(Vec<Value>),
}

impl Value {
    fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Bool(false))
    }
}

impl RuntimeValue for Value {
    fn display(&self) -> String {
        match self {
            Self::Nil => "nil".into(),
            Self::Bool(b) => b.to_string(),
            Self::Int(int) => int.to_string(),
            Self::Str(text) => text.clone(),
            Self::Sym(name) => name.clone(),
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(RuntimeValue::display).collect();
                format!("({})", rendered.join(" "))
            }
        }
    }

    fn readable(&self) -> String {
        match self {
            Self::Str(text) => format!("\"{}\"", escape(text)),
            Self::List(items) => {
                let rendered: Vec<String> = items.iter().map(RuntimeValue::readable).collect();
                format!("({})", rendered.join(" "))
            }
            other => other.display(),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

// -- Errors ---------------------------------------------------------------------------------------

fn syntax(detail: impl Into<String>) -> Exception {
    Exception::new("syntax-error", detail)
}

fn stop(kind: &str, detail: impl Into<String>) -> EvalStop {
    EvalStop::Exception(Exception::new(kind, detail))
}

// -- Evaluation -----------------------------------------------------------------------------------

/// Result of one form: a value, or `recur` unwinding to the nearest loop.
enum Flow {
    Value(Value),
    Recur(Vec<Value>),
}

type Scope = Vec<(String, Value)>;

/// The reference runtime.
///
/// Namespaces and their `def`'d vars are global to the runtime, shared by
/// every session, like any REPL'd image; only the dynamic environment
/// (`*1 *2 *3 *e`, current namespace) is per session.
#[derive(Debug, Default)]
pub struct Lisp {
    namespaces: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl Lisp {
    pub fn new() -> Self {
        let lisp = Self::default();
        lisp.namespaces
            .lock()
            .expect("namespace registry poisoned")
            .insert("user".into(), HashMap::new());
        lisp
    }

    fn lookup_global(&self, ns: &str, name: &str) -> Option<Value> {
        self.namespaces
            .lock()
            .expect("namespace registry poisoned")
            .get(ns)
            .and_then(|vars| vars.get(name))
            .cloned()
    }

    fn define_global(&self, ns: &str, name: String, value: Value) {
        self.namespaces
            .lock()
            .expect("namespace registry poisoned")
            .entry(ns.to_string())
            .or_default()
            .insert(name, value);
    }

    fn resolve(
        &self,
        name: &str,
        env: &EvalEnv,
        scope: &Scope,
    ) -> Result<Value, EvalStop> {
        match name {
            "nil" => return Ok(Value::Nil),
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "*1" | "*2" | "*3" => {
                let slot = (name.as_bytes()[1] - b'1') as usize;
                return Ok(match &env.results[slot] {
                    Some(value) => value
                        .as_any()
                        .downcast_ref::<Value>()
                        .cloned()
                        .unwrap_or_else(|| Value::Str(value.readable())),
                    None => Value::Nil,
                });
            }
            "*e" => {
                return Ok(match &env.last_exception {
                    Some(exception) => Value::Str(exception.detail.clone()),
                    None => Value::Nil,
                })
            }
            _ => {}
        }

        if let Some((_, value)) = scope.iter().rev().find(|(n, _)| n.as_str() == name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.lookup_global(&env.ns, name) {
            return Ok(value);
        }
        Err(stop(
            "undefined-symbol",
            format!("unable to resolve symbol: {name} in this context"),
        ))
    }

    fn eval_form(
        &self,
        form: &Form,
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
        scope: &mut Scope,
    ) -> Result<Flow, EvalStop> {
        if io.interrupt.is_interrupted() {
            return Err(EvalStop::Interrupted);
        }

        match form {
            Form::Int(int) => Ok(Flow::Value(Value::Int(*int))),
            Form::Str(text) => Ok(Flow::Value(Value::Str(text.clone()))),
            Form::Sym(name) => self.resolve(name, env, scope).map(Flow::Value),
            Form::Vector(items) => {
                let values = self.eval_args(items, env, io, scope)?;
                Ok(Flow::Value(Value::List(values)))
            }
            Form::List(items) => {
                let Some((head, args)) = items.split_first() else {
                    return Ok(Flow::Value(Value::List(Vec::new())));
                };
                let Form::Sym(name) = head else {
                    return Err(stop("type-error", format!("cannot call {head}")));
                };
                self.apply(name, args, env, io, scope)
            }
        }
    }

    fn eval_value(
        &self,
        form: &Form,
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
        scope: &mut Scope,
    ) -> Result<Value, EvalStop> {
        match self.eval_form(form, env, io, scope)? {
            Flow::Value(value) => Ok(value),
            Flow::Recur(_) => Err(stop(
                "syntax-error",
                "recur is only allowed in tail position of a loop",
            )),
        }
    }

    fn eval_args(
        &self,
        forms: &[Form],
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
        scope: &mut Scope,
    ) -> Result<Vec<Value>, EvalStop> {
        forms
            .iter()
            .map(|form| self.eval_value(form, env, io, scope))
            .collect()
    }

    /// Evaluate `forms` as an implicit `do`, passing `recur` through from
    /// the last form.
    fn eval_body(
        &self,
        forms: &[Form],
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
        scope: &mut Scope,
    ) -> Result<Flow, EvalStop> {
        let Some((last, rest)) = forms.split_last() else {
            return Ok(Flow::Value(Value::Nil));
        };
        for form in rest {
            self.eval_value(form, env, io, scope)?;
        }
        self.eval_form(last, env, io, scope)
    }

    fn apply(
        &self,
        name: &str,
        args: &[Form],
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
        scope: &mut Scope,
    ) -> Result<Flow, EvalStop> {
        match name {
            // -- Special forms --------------------------------------------
            "quote" => {
                let [arg] = args else {
                    return Err(stop("arity-error", "quote takes exactly one form"));
                };
                Ok(Flow::Value(form_to_value(arg)))
            }
            "def" => {
                let [Form::Sym(var), init] = args else {
                    return Err(stop("arity-error", "def takes a symbol and a value"));
                };
                let value = self.eval_value(init, env, io, scope)?;
                self.define_global(&env.ns, var.clone(), value);
                Ok(Flow::Value(Value::Sym(var.clone())))
            }
            "do" => self.eval_body(args, env, io, scope),
            "if" => {
                let (cond, branches) = args
                    .split_first()
                    .ok_or_else(|| stop("arity-error", "if takes a condition"))?;
                let test = self.eval_value(cond, env, io, scope)?;
                match (test.truthy(), branches) {
                    (true, [then, ..]) => self.eval_form(then, env, io, scope),
                    (false, [_, other, ..]) => self.eval_form(other, env, io, scope),
                    _ => Ok(Flow::Value(Value::Nil)),
                }
            }
            "let" => {
                let Some((Form::Vector(bindings), body)) = args.split_first() else {
                    return Err(stop("syntax-error", "let takes a binding vector"));
                };
                if bindings.len() % 2 != 0 {
                    return Err(stop("syntax-error", "odd number of binding forms"));
                }
                let depth = scope.len();
                for pair in bindings.chunks(2) {
                    let Form::Sym(binding) = &pair[0] else {
                        scope.truncate(depth);
                        return Err(stop("syntax-error", "binding name must be a symbol"));
                    };
                    match self.eval_value(&pair[1], env, io, scope) {
                        Ok(value) => scope.push((binding.clone(), value)),
                        Err(stopped) => {
                            scope.truncate(depth);
                            return Err(stopped);
                        }
                    }
                }
                let result = self.eval_body(body, env, io, scope);
                scope.truncate(depth);
                result
            }
            "loop" => {
                let Some((Form::Vector(bindings), body)) = args.split_first() else {
                    return Err(stop("syntax-error", "loop takes a binding vector"));
                };
                if bindings.len() % 2 != 0 {
                    return Err(stop("syntax-error", "odd number of binding forms"));
                }
                let depth = scope.len();
                let mut names = Vec::with_capacity(bindings.len() / 2);
                for pair in bindings.chunks(2) {
                    let Form::Sym(binding) = &pair[0] else {
                        scope.truncate(depth);
                        return Err(stop("syntax-error", "binding name must be a symbol"));
                    };
                    match self.eval_value(&pair[1], env, io, scope) {
                        Ok(value) => {
                            names.push(binding.clone());
                            scope.push((binding.clone(), value));
                        }
                        Err(stopped) => {
                            scope.truncate(depth);
                            return Err(stopped);
                        }
                    }
                }

                let result = loop {
                    match self.eval_body(body, env, io, scope) {
                        Ok(Flow::Recur(values)) => {
                            if values.len() != names.len() {
                                break Err(stop(
                                    "arity-error",
                                    format!(
                                        "recur expects {} values, got {}",
                                        names.len(),
                                        values.len()
                                    ),
                                ));
                            }
                            scope.truncate(depth);
                            for (binding, value) in names.iter().zip(values) {
                                scope.push((binding.clone(), value));
                            }
                        }
                        other => break other,
                    }
                };
                scope.truncate(depth);
                result
            }
            "recur" => {
                let values = self.eval_args(args, env, io, scope)?;
                Ok(Flow::Recur(values))
            }
            "in-ns" => {
                let [arg] = args else {
                    return Err(stop("arity-error", "in-ns takes a namespace name"));
                };
                let ns = match self.eval_value(arg, env, io, scope)? {
                    Value::Sym(name) | Value::Str(name) => name,
                    other => {
                        return Err(stop(
                            "type-error",
                            format!("in-ns expects a symbol, got {}", other.readable()),
                        ))
                    }
                };
                self.namespaces
                    .lock()
                    .expect("namespace registry poisoned")
                    .entry(ns.clone())
                    .or_default();
                env.ns = ns.clone();
                Ok(Flow::Value(Value::Sym(ns)))
            }

            // -- Functions ------------------------------------------------
            _ => {
                let values = self.eval_args(args, env, io, scope)?;
                self.call(name, values, env, io).map(Flow::Value)
            }
        }
    }

    fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
    ) -> Result<Value, EvalStop> {
        match name {
            "+" => fold_ints(&args, 0, i64::checked_add),
            "*" => fold_ints(&args, 1, i64::checked_mul),
            "-" => match ints(&args)?.split_first() {
                None => Err(stop("arity-error", "- takes at least one argument")),
                Some((first, [])) => first
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| stop("arithmetic-error", "integer overflow")),
                Some((first, rest)) => {
                    let mut acc = *first;
                    for int in rest {
                        acc = acc
                            .checked_sub(*int)
                            .ok_or_else(|| stop("arithmetic-error", "integer overflow"))?;
                    }
                    Ok(Value::Int(acc))
                }
            },
            "/" => match ints(&args)?.split_first() {
                None => Err(stop("arity-error", "/ takes at least one argument")),
                Some((first, rest)) => {
                    let mut acc = *first;
                    for int in rest {
                        acc = acc
                            .checked_div(*int)
                            .ok_or_else(|| stop("arithmetic-error", "divide by zero"))?;
                    }
                    Ok(Value::Int(acc))
                }
            },
            "=" => {
                let equal = args.windows(2).all(|pair| pair[0] == pair[1]);
                Ok(Value::Bool(equal))
            }
            "<" => compare_ints(&args, |a, b| a < b),
            ">" => compare_ints(&args, |a, b| a > b),
            "str" => {
                let mut out = String::new();
                for arg in &args {
                    if !matches!(arg, Value::Nil) {
                        out.push_str(&arg.display());
                    }
                }
                Ok(Value::Str(out))
            }
            "list" => Ok(Value::List(args)),
            "println" | "print" => {
                let rendered: Vec<String> = args.iter().map(RuntimeValue::display).collect();
                let mut text = rendered.join(" ");
                if name == "println" {
                    text.push('\n');
                }
                io.stdout
                    .write_all(text.as_bytes())
                    .and_then(|()| {
                        if name == "println" {
                            io.stdout.flush()
                        } else {
                            Ok(())
                        }
                    })
                    .map_err(|err| stop("io-error", err.to_string()))?;
                Ok(Value::Nil)
            }
            "read-line" => match io.stdin.read_line() {
                Ok(Some(line)) => Ok(Value::Str(line)),
                Ok(None) => Ok(Value::Nil),
                Err(err) if err.kind() == ErrorKind::Interrupted => Err(EvalStop::Interrupted),
                Err(err) => Err(stop("io-error", err.to_string())),
            },
            "sleep" => {
                let [Value::Int(millis)] = args.as_slice() else {
                    return Err(stop("arity-error", "sleep takes milliseconds"));
                };
                let mut remaining = u64::try_from(*millis).unwrap_or(0);
                while remaining > 0 {
                    if io.interrupt.is_interrupted() {
                        return Err(EvalStop::Interrupted);
                    }
                    let chunk = remaining.min(10);
                    std::thread::sleep(Duration::from_millis(chunk));
                    remaining -= chunk;
                }
                Ok(Value::Nil)
            }
            "throw" => {
                let detail = args
                    .first()
                    .map(RuntimeValue::display)
                    .unwrap_or_else(|| "thrown".into());
                Err(stop("user-error", detail))
            }
            _ => {
                // A defined var is still not callable; say which it is.
                match self.lookup_global(&env.ns, name) {
                    Some(value) => Err(stop(
                        "type-error",
                        format!("{} is not a function", value.readable()),
                    )),
                    None => Err(stop(
                        "undefined-symbol",
                        format!("unable to resolve symbol: {name} in this context"),
                    )),
                }
            }
        }
    }
}

fn ints(args: &[Value]) -> Result<Vec<i64>, EvalStop> {
    args.iter()
        .map(|arg| match arg {
            Value::Int(int) => Ok(*int),
            other => Err(stop(
                "type-error",
                format!("expected an integer, got {}", other.readable()),
            )),
        })
        .collect()
}

fn fold_ints(
    args: &[Value],
    init: i64,
    op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, EvalStop> {
    let mut acc = init;
    for int in ints(args)? {
        acc = op(acc, int).ok_or_else(|| stop("arithmetic-error", "integer overflow"))?;
    }
    Ok(Value::Int(acc))
}

fn compare_ints(args: &[Value], ordered: fn(i64, i64) -> bool) -> Result<Value, EvalStop> {
    let ints = ints(args)?;
    Ok(Value::Bool(
        ints.windows(2).all(|pair| ordered(pair[0], pair[1])),
    ))
}

fn form_to_value(form: &Form) -> Value {
    match form {
        Form::Int(int) => Value::Int(*int),
        Form::Str(text) => Value::Str(text.clone()),
        Form::Sym(name) => match name.as_str() {
            "nil" => Value::Nil,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Sym(name.clone()),
        },
        Form::List(items) | Form::Vector(items) => {
            Value::List(items.iter().map(form_to_value).collect())
        }
    }
}

// -------------------------------------------------------------------------------------------------

impl Runtime for Lisp {
    fn name(&self) -> &str {
        "mini-lisp"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn has_namespace(&self, ns: &str) -> bool {
        self.namespaces
            .lock()
            .expect("namespace registry poisoned")
            .contains_key(ns)
    }

    fn read(&self, code: &str) -> Result<Vec<String>, Exception> {
        let forms = Reader::new(code).read_all()?;
        Ok(forms.iter().map(ToString::to_string).collect())
    }

    fn eval(
        &self,
        form: &str,
        env: &mut EvalEnv,
        io: &mut EvalIo<'_>,
    ) -> Result<Arc<dyn RuntimeValue>, EvalStop> {
        let forms = Reader::new(form)
            .read_all()
            .map_err(EvalStop::Exception)?;
        let Some(form) = forms.first() else {
            return Ok(Arc::new(Value::Nil));
        };

        let mut scope = Scope::new();
        let value = self.eval_value(form, env, io, &mut scope)?;
        Ok(Arc::new(value))
    }
}
