//! Native function registration and the small set of built-ins hosted
//! directly by the VM.

use std::sync::OnceLock;
use std::time::Instant;

use izi_core::Value;

use crate::vm::Vm;

/// Seconds elapsed since the native function table was first touched, as
/// an f64. Mirrors the reference interpreter's `clock()`, which reports
/// process uptime rather than wall-clock time.
fn clock_native(_args: &[Value]) -> Result<Value, String> {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

/// Install every built-in native into a freshly created VM's globals.
pub fn register_builtins(vm: &mut Vm) {
    vm.define_native("clock", Some(0), clock_native);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_returns_a_non_negative_number() {
        let result = clock_native(&[]).unwrap();
        assert!(matches!(result, Value::Number(n) if n >= 0.0));
    }
}
