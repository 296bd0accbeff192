//! End-to-end tests: compile a full program and run it through `Vm`,
//! asserting on captured `print` output.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use izi_vm::{Vm, VmConfig};

/// A `Write` sink over a reference-counted buffer, so tests can hold
/// their own handle to read captured output back after `interpret`
/// returns (the VM itself owns the `Box<dyn Write>` by that point).
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> String {
    let function = izi_compiler::compile(source).expect("compile failed");
    let mut vm = Vm::new(VmConfig::default());
    let buf = Rc::new(RefCell::new(Vec::new()));
    vm.set_output(Box::new(SharedBuf(buf.clone())));
    vm.interpret(function).expect("runtime error");
    let bytes = buf.borrow().clone();
    String::from_utf8(bytes).unwrap()
}

fn run_err(source: &str) -> String {
    let function = izi_compiler::compile(source).expect("compile failed");
    let mut vm = Vm::new(VmConfig::default());
    vm.set_output(Box::new(std::io::sink()));
    let err = vm.interpret(function).expect_err("expected a runtime error");
    err.message
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn for_loop_accumulates() {
    let out = run("var a = 0; for (var i = 0; i < 5; i = i + 1) a = a + i; print a;");
    assert_eq!(out, "10\n");
}

#[test]
fn closure_over_upvalue_survives_enclosing_return() {
    let src = "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
               var c = make(); print c(); print c(); print c();";
    assert_eq!(run(src), "1\n2\n3\n");
}

#[test]
fn single_inheritance_and_super_calls() {
    let src = "class A { new(n) { this.n = n; } get() { return this.n; } } \
               class B < A { get() { return super.get() + 1; } } \
               print B(41).get();";
    assert_eq!(run(src), "42\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run(r#"print "a" + "b" + "c";"#), "abc\n");
}

#[test]
fn adding_number_to_string_is_a_runtime_error() {
    let msg = run_err(r#"print 1 + "x";"#);
    assert_eq!(msg, "Operands must be two numbers or two strings.");
}

#[test]
fn top_level_assignment_to_declared_global_works() {
    assert_eq!(run("var x; x = 1; print x;"), "1\n");
}

#[test]
fn assignment_to_undeclared_global_is_a_runtime_error() {
    let msg = run_err("y = 1;");
    assert_eq!(msg, "Undefined variable 'y'.");
}

#[test]
fn switch_statement_falls_through_free() {
    let src = "var x = 2; switch (x) { case 1: print \"one\"; case 2: print \"two\"; default: print \"other\"; }";
    assert_eq!(run(src), "two\n");
}

#[test]
fn recursive_functions_work() {
    let src = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
    assert_eq!(run(src), "55\n");
}

#[test]
fn calling_a_number_is_a_runtime_error() {
    let msg = run_err("var x = 1; x();");
    assert_eq!(msg, "Can only call functions and classes.");
}

#[test]
fn clock_native_returns_a_number() {
    let src = "var t = clock(); print t >= 0;";
    assert_eq!(run(src), "true\n");
}
