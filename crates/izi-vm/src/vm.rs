//! The dispatch loop: a stack-based virtual machine that executes the
//! bytecode the compiler emits, one instruction at a time, with no
//! intermediate representation of its own.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use izi_core::{
    BoundMethod, Class, Closure, Function, Instance, Module, Native, NativeFn, OpCode, Upvalue,
    Value,
};

use crate::config::VmConfig;
use crate::error::RuntimeError;

/// One in-flight function activation. `slot_base` is the stack index
/// where this call's slot 0 (the callee itself, or a bound receiver)
/// lives; locals and temporaries grow above it.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    slot_base: usize,
}

/// What happened after dispatching a single instruction.
enum StepOutcome {
    Continue,
    FrameReturned,
    Halted,
}

/// The virtual machine. Holds the value stack, the call-frame stack,
/// globals, the list of still-open upvalues (sorted by decreasing stack
/// index, as in the reference implementation), and the module cache.
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    open_upvalues: Vec<Rc<RefCell<Upvalue>>>,
    modules: HashMap<String, Value>,
    modules_in_progress: HashSet<String>,
    module_dir: PathBuf,
    config: VmConfig,
    output: Box<dyn Write>,
}

impl Vm {
    const MAX_FRAMES: usize = 64;

    pub fn new(config: VmConfig) -> Self {
        let mut vm = Vm {
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            open_upvalues: Vec::new(),
            modules: HashMap::new(),
            modules_in_progress: HashSet::new(),
            module_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            config,
            output: Box::new(io::stdout()),
        };
        crate::native::register_builtins(&mut vm);
        vm
    }

    /// Directory `import`ed module names are resolved relative to.
    /// Defaults to the process's current directory; the CLI sets this to
    /// the directory of the script it is running.
    pub fn set_module_dir(&mut self, dir: PathBuf) {
        self.module_dir = dir;
    }

    /// Redirect `print` output somewhere other than stdout. Used by tests
    /// to capture program output without a subprocess.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Register a native function under `name` in the global namespace.
    /// `arity_hint` constrains the call-site argument count when
    /// `Some`; `None` accepts any arity.
    pub fn define_native(&mut self, name: &str, arity_hint: Option<u8>, f: NativeFn) {
        let name_rc: Rc<str> = Rc::from(name);
        let native = Rc::new(Native {
            name: name_rc.clone(),
            arity: arity_hint,
            function: f,
        });
        self.globals.insert(name_rc, Value::Native(native));
    }

    /// Run a freshly compiled top-level function to completion.
    ///
    /// On a runtime error the stack and frame list are reset so the `Vm`
    /// can keep serving further calls (the REPL reuses one `Vm` across
    /// lines; globals and classes defined so far must survive a failed
    /// line).
    pub fn interpret(&mut self, function: Rc<Function>) -> Result<(), RuntimeError> {
        let closure = Rc::new(Closure::new(function));
        self.stack.push(Value::Closure(closure.clone()));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: 0,
        });

        loop {
            match self.step() {
                Ok(StepOutcome::Continue) | Ok(StepOutcome::FrameReturned) => continue,
                Ok(StepOutcome::Halted) => return Ok(()),
                Err(e) => {
                    self.stack.clear();
                    self.frames.clear();
                    self.open_upvalues.clear();
                    return Err(e);
                }
            }
        }
    }

    // -- stack helpers --------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    // -- bytecode stream --------------------------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.read_byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let value = frame.closure.function.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.frames.last().unwrap().closure.function.chunk.constants[idx].clone()
    }

    fn read_string(&mut self) -> Rc<str> {
        match self.read_constant() {
            Value::Str(s) => s,
            other => unreachable!("name constant was not a string: {:?}", other),
        }
    }

    fn trace_instruction(&self) {
        let frame = self.frames.last().unwrap();
        let (line, _) =
            izi_compiler::disassemble_instruction(&frame.closure.function.chunk, frame.ip);
        tracing::trace!(stack = ?self.stack, "{}", line);
    }

    fn runtime_error(&self, message: &str) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = &frame.closure.function;
            let line = if frame.ip > 0 {
                function.chunk.line_at(frame.ip - 1)
            } else {
                0
            };
            let name = if function.is_script() {
                "script".to_string()
            } else {
                format!("{}()", function.name)
            };
            trace.push(format!("[line {}] in {}", line, name));
        }
        RuntimeError::new(message, trace)
    }

    // -- one instruction --------------------------------------------------------

    fn step(&mut self) -> Result<StepOutcome, RuntimeError> {
        if self.config.trace_execution {
            self.trace_instruction();
        }

        let byte = self.read_byte();
        let op = OpCode::from_u8(byte)
            .ok_or_else(|| self.runtime_error(&format!("Unknown opcode {}.", byte)))?;

        match op {
            OpCode::Constant => {
                let v = self.read_constant();
                self.push(v);
            }
            OpCode::Nil => self.push(Value::Nil),
            OpCode::True => self.push(Value::Bool(true)),
            OpCode::False => self.push(Value::Bool(false)),
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let v = self.peek(0).clone();
                self.push(v);
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slot_base;
                let v = self.stack[base + slot].clone();
                self.push(v);
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frames.last().unwrap().slot_base;
                self.stack[base + slot] = self.peek(0).clone();
            }
            OpCode::GetGlobal => {
                let name = self.read_string();
                match self.globals.get(&name).cloned() {
                    Some(v) => self.push(v),
                    None => {
                        return Err(
                            self.runtime_error(&format!("Undefined variable '{}'.", name))
                        )
                    }
                }
            }
            OpCode::DefineGlobal => {
                let name = self.read_string();
                let v = self.pop();
                self.globals.insert(name, v);
            }
            OpCode::SetGlobal => {
                let name = self.read_string();
                if !self.globals.contains_key(&name) {
                    return Err(self.runtime_error(&format!("Undefined variable '{}'.", name)));
                }
                let v = self.peek(0).clone();
                self.globals.insert(name, v);
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                let v = self.read_upvalue(&upvalue);
                self.push(v);
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.frames.last().unwrap().closure.upvalues[slot].clone();
                let v = self.peek(0).clone();
                self.write_upvalue(&upvalue, v);
            }
            OpCode::GetProperty => self.get_property()?,
            OpCode::SetProperty => self.set_property()?,
            OpCode::GetSuper => self.get_super()?,
            OpCode::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            OpCode::Greater => self.binary_compare(|a, b| a > b)?,
            OpCode::Less => self.binary_compare(|a, b| a < b)?,
            OpCode::Add => self.add()?,
            OpCode::Subtract => self.binary_arith(|a, b| a - b)?,
            OpCode::Multiply => self.binary_arith(|a, b| a * b)?,
            OpCode::Divide => self.binary_arith(|a, b| a / b)?,
            OpCode::Not => {
                let v = self.pop();
                self.push(Value::Bool(v.is_falsey()));
            }
            OpCode::Negate => {
                let v = self.pop();
                match v.as_number() {
                    Some(n) => self.push(Value::Number(-n)),
                    None => return Err(self.runtime_error("Operand must be a number.")),
                }
            }
            OpCode::Print => {
                let v = self.pop();
                let _ = writeln!(self.output, "{}", v);
            }
            OpCode::Jump => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip += offset as usize;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16();
                if self.peek(0).is_falsey() {
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16();
                self.frames.last_mut().unwrap().ip -= offset as usize;
            }
            OpCode::Call => {
                let arg_count = self.read_byte();
                let callee = self.peek(arg_count as usize).clone();
                self.call_value(callee, arg_count)?;
            }
            OpCode::Closure => self.closure()?,
            OpCode::CloseUpvalue => {
                let idx = self.stack.len() - 1;
                self.close_upvalues(idx);
                self.pop();
            }
            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.slot_base);
                self.stack.truncate(frame.slot_base);
                if self.frames.is_empty() {
                    return Ok(StepOutcome::Halted);
                }
                self.push(result);
                return Ok(StepOutcome::FrameReturned);
            }
            OpCode::Class => {
                let name = self.read_string();
                self.push(Value::Class(Rc::new(RefCell::new(Class::new(name)))));
            }
            OpCode::Method => self.method()?,
            OpCode::Inherit => self.inherit()?,
            OpCode::Import => self.import()?,
        }

        Ok(StepOutcome::Continue)
    }

    // -- calling ------------------------------------------------------------

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Closure(closure) => self.call_closure(closure, arg_count),
            Value::Native(native) => self.call_native(native, arg_count),
            Value::Class(class) => self.instantiate(class, arg_count),
            Value::BoundMethod(bound) => self.call_bound_method(bound, arg_count),
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, arg_count: u8) -> Result<(), RuntimeError> {
        if closure.function.arity != arg_count {
            return Err(self.runtime_error(&format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, arg_count
            )));
        }
        if self.frames.len() >= Self::MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - arg_count as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: Rc<Native>, arg_count: u8) -> Result<(), RuntimeError> {
        if let Some(expected) = native.arity {
            if expected != arg_count {
                return Err(self.runtime_error(&format!(
                    "Expected {} arguments but got {}.",
                    expected, arg_count
                )));
            }
        }
        let start = self.stack.len() - arg_count as usize;
        let args: Vec<Value> = self.stack[start..].to_vec();
        let result = match (native.function)(&args) {
            Ok(v) => v,
            Err(msg) => return Err(self.runtime_error(&msg)),
        };
        self.stack.truncate(start - 1);
        self.push(result);
        Ok(())
    }

    fn instantiate(&mut self, class: Rc<RefCell<Class>>, arg_count: u8) -> Result<(), RuntimeError> {
        let instance = Rc::new(RefCell::new(Instance::new(class.clone())));
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = Value::Instance(instance);

        let ctor = class.borrow().methods.get("new").cloned();
        match ctor {
            Some(ctor) => self.call_closure(ctor, arg_count),
            None if arg_count != 0 => Err(self.runtime_error(&format!(
                "Expected 0 arguments but got {}.",
                arg_count
            ))),
            None => Ok(()),
        }
    }

    fn call_bound_method(
        &mut self,
        bound: Rc<BoundMethod>,
        arg_count: u8,
    ) -> Result<(), RuntimeError> {
        let slot = self.stack.len() - arg_count as usize - 1;
        self.stack[slot] = bound.receiver.clone();
        self.call_closure(bound.method.clone(), arg_count)
    }

    // -- properties and classes -----------------------------------------------

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let receiver = self.peek(0).clone();
        let Value::Instance(instance) = receiver else {
            return Err(self.runtime_error("Only instances have properties."));
        };

        if let Some(value) = instance.borrow().fields.get(&name).cloned() {
            self.pop();
            self.push(value);
            return Ok(());
        }

        let method = instance.borrow().class.borrow().methods.get(&name).cloned();
        match method {
            Some(method) => {
                self.pop();
                self.push(Value::BoundMethod(Rc::new(BoundMethod {
                    receiver: Value::Instance(instance),
                    method,
                })));
                Ok(())
            }
            None => Err(self.runtime_error(&format!("Undefined property '{}'.", name))),
        }
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let value = self.pop();
        let receiver = self.pop();
        let Value::Instance(instance) = receiver else {
            return Err(self.runtime_error("Only instances have fields."));
        };
        instance.borrow_mut().fields.insert(name, value.clone());
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let superclass = self.pop();
        let Value::Class(superclass) = superclass else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        let receiver = self.pop();

        let method = superclass.borrow().methods.get(&name).cloned();
        match method {
            Some(method) => {
                self.push(Value::BoundMethod(Rc::new(BoundMethod { receiver, method })));
                Ok(())
            }
            None => Err(self.runtime_error(&format!("Undefined property '{}'.", name))),
        }
    }

    fn method(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();
        let closure = match self.pop() {
            Value::Closure(c) => c,
            other => unreachable!("OP_METHOD always follows a closure push, got {:?}", other),
        };
        if let Value::Class(class) = self.peek(0).clone() {
            class.borrow_mut().methods.insert(name, closure);
        }
        Ok(())
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass_val = self.peek(1).clone();
        let Value::Class(superclass) = superclass_val else {
            return Err(self.runtime_error("Superclass must be a class."));
        };
        if let Value::Class(subclass) = self.peek(0).clone() {
            let inherited = superclass.borrow().methods.clone();
            subclass.borrow_mut().methods.extend(inherited);
        }
        self.pop();
        Ok(())
    }

    // -- upvalues -----------------------------------------------------------

    fn closure(&mut self) -> Result<(), RuntimeError> {
        let function = match self.read_constant() {
            Value::Function(f) => f,
            other => unreachable!("OP_CLOSURE operand was not a function: {:?}", other),
        };
        let upvalue_count = function.upvalue_count;
        let mut closure = Closure::new(function);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte();
            let index = self.read_byte();
            let upvalue = if is_local == 1 {
                let base = self.frames.last().unwrap().slot_base;
                self.capture_upvalue(base + index as usize)
            } else {
                self.frames.last().unwrap().closure.upvalues[index as usize].clone()
            };
            closure.upvalues.push(upvalue);
        }
        self.push(Value::Closure(Rc::new(closure)));
        Ok(())
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> Rc<RefCell<Upvalue>> {
        if let Some(existing) = self.open_upvalues.iter().find(|uv| {
            matches!(*uv.borrow(), Upvalue::Open(idx) if idx == stack_index)
        }) {
            return existing.clone();
        }

        let upvalue = Rc::new(RefCell::new(Upvalue::Open(stack_index)));
        let pos = self
            .open_upvalues
            .iter()
            .position(|uv| match *uv.borrow() {
                Upvalue::Open(idx) => idx < stack_index,
                Upvalue::Closed(_) => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, upvalue.clone());
        upvalue
    }

    fn close_upvalues(&mut self, from: usize) {
        let stack = &self.stack;
        self.open_upvalues.retain(|uv| {
            let idx = match *uv.borrow() {
                Upvalue::Open(idx) => idx,
                Upvalue::Closed(_) => return false,
            };
            if idx >= from {
                let value = stack[idx].clone();
                *uv.borrow_mut() = Upvalue::Closed(value);
                false
            } else {
                true
            }
        });
    }

    fn read_upvalue(&self, upvalue: &Rc<RefCell<Upvalue>>) -> Value {
        match &*upvalue.borrow() {
            Upvalue::Open(idx) => self.stack[*idx].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, upvalue: &Rc<RefCell<Upvalue>>, value: Value) {
        let open_index = match &*upvalue.borrow() {
            Upvalue::Open(idx) => Some(*idx),
            Upvalue::Closed(_) => None,
        };
        match open_index {
            Some(idx) => self.stack[idx] = value,
            None => *upvalue.borrow_mut() = Upvalue::Closed(value),
        }
    }

    // -- arithmetic -----------------------------------------------------------

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0).clone();
        let a = self.peek(1).clone();
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::Number(x + y));
            return Ok(());
        }
        if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
            self.pop();
            self.pop();
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(x);
            s.push_str(y);
            self.push(Value::Str(Rc::from(s)));
            return Ok(());
        }
        Err(self.runtime_error("Operands must be two numbers or two strings."))
    }

    fn binary_arith(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    // -- modules --------------------------------------------------------------

    fn resolve_module_path(&self, name: &str) -> PathBuf {
        self.module_dir.join(format!("{}.izi", name))
    }

    /// `import name;` resolves `name` to `<module-dir>/name.izi`, compiles
    /// it as an independent top-level function, and runs it to
    /// completion before yielding a `Module` value. Re-imports are cache
    /// hits; an import still in progress further up the call stack is a
    /// runtime error rather than infinite recursion.
    fn import(&mut self) -> Result<(), RuntimeError> {
        let name = self.read_string();

        if let Some(module) = self.modules.get(name.as_ref()) {
            let module = module.clone();
            self.push(module);
            return Ok(());
        }
        if self.modules_in_progress.contains(name.as_ref()) {
            return Err(self.runtime_error(&format!("Circular import of module '{}'.", name)));
        }

        let path = self.resolve_module_path(&name);
        let source = std::fs::read_to_string(&path).map_err(|e| {
            self.runtime_error(&format!(
                "Can't read module '{}' at {}: {}",
                name,
                path.display(),
                e
            ))
        })?;
        let function = izi_compiler::compile(&source).map_err(|e| {
            self.runtime_error(&format!("Error compiling module '{}':\n{}", name, e))
        })?;

        self.modules_in_progress.insert(name.to_string());

        let closure = Rc::new(Closure::new(function));
        let base = self.stack.len();
        self.stack.push(Value::Closure(closure.clone()));
        self.frames.push(CallFrame {
            closure: closure.clone(),
            ip: 0,
            slot_base: base,
        });
        let target_depth = self.frames.len() - 1;

        loop {
            match self.step() {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::FrameReturned) if self.frames.len() == target_depth => break,
                Ok(StepOutcome::FrameReturned) => {}
                Ok(StepOutcome::Halted) => break,
                Err(e) => {
                    self.modules_in_progress.remove(name.as_ref());
                    return Err(e);
                }
            }
        }

        self.pop(); // discard the module's own implicit return value
        self.modules_in_progress.remove(name.as_ref());

        let module = Value::Module(Rc::new(Module {
            name: name.clone(),
            closure,
        }));
        self.modules.insert(name.to_string(), module.clone());
        self.push(module);
        Ok(())
    }
}
