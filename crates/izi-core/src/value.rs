//! The `Value` tagged union: the primitives and heap objects the language's
//! values are built from.

use std::fmt;
use std::rc::Rc;

use crate::object::{BoundMethod, Class, Closure, Function, Instance, Module, Native, Upvalue};
use std::cell::RefCell;

/// A language value.
///
/// Primitives (`Nil`, `Bool`, `Number`, `Str`) compare by value. Heap
/// objects compare by identity: two closures are equal only if they are the
/// *same* closure, never because they happen to wrap equal data. This
/// matches `OP_EQUAL`'s semantics in the virtual machine.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Function(Rc<Function>),
    Closure(Rc<Closure>),
    Native(Rc<Native>),
    Class(Rc<RefCell<Class>>),
    Instance(Rc<RefCell<Instance>>),
    BoundMethod(Rc<BoundMethod>),
    Upvalue(Rc<RefCell<Upvalue>>),
    Module(Rc<Module>),
}

impl Value {
    /// `nil` and `false` are falsey; everything else is truthy.
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Rc<str>> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// A short name for this value's type, used in runtime error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
            Value::Closure(_) => "function",
            Value::Native(_) => "native function",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::BoundMethod(_) => "bound method",
            Value::Upvalue(_) => "upvalue",
            Value::Module(_) => "module",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Upvalue(a), Value::Upvalue(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Function(func) => {
                if func.is_script() {
                    write!(f, "<script>")
                } else {
                    write!(f, "<fn {}>", func.name)
                }
            }
            Value::Closure(c) => {
                if c.function.is_script() {
                    write!(f, "<script>")
                } else {
                    write!(f, "<fn {}>", c.name())
                }
            }
            Value::Native(n) => write!(f, "<native fn {}>", n.name),
            Value::Class(c) => write!(f, "{}", c.borrow().name),
            Value::Instance(i) => write!(f, "{} instance", i.borrow().class.borrow().name),
            Value::BoundMethod(b) => write!(f, "<fn {}>", b.method.name()),
            Value::Upvalue(_) => write!(f, "<upvalue>"),
            Value::Module(m) => write!(f, "<module {}>", m.name),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Numbers print without a trailing `.0` for integral values, matching the
/// reference interpreter's `%g`-style formatting.
fn format_number(n: f64) -> String {
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsey_values() {
        assert!(Value::Nil.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Bool(true).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn number_formatting_drops_trailing_zero() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(7.5), "7.5");
    }

    #[test]
    fn strings_compare_by_value() {
        let a = Value::Str(Rc::from("abc"));
        let b = Value::Str(Rc::from("abc"));
        assert_eq!(a, b);
    }

    #[test]
    fn heap_objects_compare_by_identity() {
        let f = Rc::new(Function::new(Rc::from("")));
        let a = Value::Function(f.clone());
        let b = Value::Function(f.clone());
        assert_eq!(a, b);

        let other = Value::Function(Rc::new(Function::new(Rc::from(""))));
        assert_ne!(a, other);
    }
}
