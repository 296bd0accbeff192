//! Scanner, single-pass Pratt compiler, and disassembler for the izi
//! language. The compiler walks the token stream exactly once and emits
//! bytecode as it recognizes each production — there is no AST stage.

mod compiler;
mod disassembler;
mod error;
mod scanner;

pub use compiler::compile;
pub use disassembler::{disassemble_chunk, disassemble_instruction};
pub use error::{CompileError, Diagnostic};
pub use scanner::{Scanner, Token, TokenKind};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_program() {
        let function = compile("print 1 + 2;").expect("should compile");
        assert!(function.is_script());
        assert!(!function.chunk.is_empty());
    }

    #[test]
    fn reports_every_error_in_one_pass() {
        let err = compile("var = 1; var = 2;").unwrap_err();
        assert!(err.diagnostics.len() >= 2);
    }

    #[test]
    fn disassembly_is_available_for_a_compiled_chunk() {
        let function = compile("var x = 1 + 2;").expect("should compile");
        let text = disassemble_chunk(&function.chunk, "script");
        assert!(text.contains("OP_CONSTANT") || text.contains("OP_ADD"));
    }

    #[test]
    fn class_with_inheritance_compiles() {
        let src = r#"
            class Animal {
                speak() { print "..."; }
            }
            class Dog < Animal {
                speak() { print "woof"; }
            }
            var d = Dog();
            d.speak();
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn closures_over_locals_compile() {
        let src = r#"
            fun makeCounter() {
                var count = 0;
                fun increment() {
                    count = count + 1;
                    return count;
                }
                return increment;
            }
            var counter = makeCounter();
            print counter();
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn switch_with_fallthrough_free_cases_compiles() {
        let src = r#"
            var x = 2;
            switch (x) {
                case 1: print "one";
                case 2: print "two";
                default: print "other";
            }
        "#;
        assert!(compile(src).is_ok());
    }

    #[test]
    fn this_outside_class_is_an_error() {
        assert!(compile("print this;").is_err());
    }
}
