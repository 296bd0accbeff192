//! Heap object representations.
//!
//! Every heap object here is shared via `Rc`: lifetime is "as long as the
//! longest live reference", and there are no back-edges (Instance -> Class,
//! Class -> method Closures, Closure -> Function; never the reverse), so
//! reference counting alone is sufficient without a cycle collector.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::value::Value;

/// A compiled function: its arity, how many upvalues it closes over, its
/// name (empty for the implicit top-level script), and the chunk the
/// compiler emitted for its body.
///
/// Immutable once the compiler finishes emitting into it.
#[derive(Debug)]
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Rc<str>,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Rc<str>) -> Self {
        Function {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }

    pub fn is_script(&self) -> bool {
        self.name.is_empty()
    }
}

/// A runtime closure: a shared `Function` plus the concrete upvalues it
/// captured at the point the `OP_CLOSURE` instruction ran.
#[derive(Debug)]
pub struct Closure {
    pub function: Rc<Function>,
    pub upvalues: Vec<Rc<RefCell<Upvalue>>>,
}

impl Closure {
    pub fn new(function: Rc<Function>) -> Self {
        let upvalue_count = function.upvalue_count;
        Closure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A captured free variable.
///
/// *Open* while the stack slot it refers to is still live: it stores the
/// slot's index into the VM's value stack. *Closed* once the owning frame
/// returns or the enclosing scope ends: it owns a copy of the value, and the
/// location it yields no longer depends on the stack at all.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A host-provided function exposed as a first-class `Value` at a global
/// name. Native functions run to completion synchronously, inline on the
/// VM's call stack.
pub struct Native {
    pub name: Rc<str>,
    pub arity: Option<u8>,
    pub function: NativeFn,
}

/// Signature for a native function: receives its arguments (not including
/// the callee slot) and returns a `Value` or a runtime error message.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Native").field("name", &self.name).finish()
    }
}

/// A class: a name and a mapping from method name to the method's closure.
/// Methods are added one at a time, after the class object is created, by
/// `OP_METHOD`; inheritance copies entries from a superclass by value via
/// `OP_INHERIT`.
#[derive(Debug)]
pub struct Class {
    pub name: Rc<str>,
    pub methods: HashMap<Rc<str>, Rc<Closure>>,
}

impl Class {
    pub fn new(name: Rc<str>) -> Self {
        Class {
            name,
            methods: HashMap::new(),
        }
    }
}

/// An instance of a class. Fields are added on first assignment; there is no
/// declared field list.
#[derive(Debug)]
pub struct Instance {
    pub class: Rc<RefCell<Class>>,
    pub fields: HashMap<Rc<str>, Value>,
}

impl Instance {
    pub fn new(class: Rc<RefCell<Class>>) -> Self {
        Instance {
            class,
            fields: HashMap::new(),
        }
    }
}

/// A method closure paired with the receiver it was looked up on. Created
/// by `OP_GET_PROPERTY`/`OP_GET_SUPER` when the accessed name resolves to a
/// method rather than a field; calling it behaves exactly like calling the
/// closure with the receiver already bound as slot 0.
#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Rc<Closure>,
}

/// A named, once-compiled-and-executed unit loaded via `import`, cached in
/// the VM's modules map so re-importing the same name is a no-op.
#[derive(Debug)]
pub struct Module {
    pub name: Rc<str>,
    pub closure: Rc<Closure>,
}
