//! izi-core: the value model and bytecode chunk format shared by the izi
//! compiler and virtual machine.
//!
//! This crate has no parsing or execution logic. It is the vocabulary the
//! other two pipeline stages share:
//!
//! - `value`: the `Value` tagged union (primitives + heap objects)
//! - `object`: heap object representations (`Function`, `Closure`, `Class`, ...)
//! - `chunk`: the append-only bytecode buffer, its line table, and constant pool
//! - `opcode`: the fixed opcode set and its one-byte wire encoding

pub mod chunk;
pub mod object;
pub mod opcode;
pub mod value;

pub use chunk::Chunk;
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, Module, Native, NativeFn, Upvalue,
};
pub use opcode::OpCode;
pub use value::Value;

/// Maximum number of local variable slots per function.
pub const MAX_LOCALS: usize = 256;

/// Maximum number of upvalues a single function may capture.
pub const MAX_UPVALUES: usize = 256;

/// Maximum number of constants in a single chunk's constant pool.
pub const MAX_CONSTANTS: usize = 256;
