use crate::bytecode::{Compiler, Op, Program, disassemble};
use crate::error::ScriptError;
use crate::lexer::Lexer;
use crate::runtime::memory::Memory;
use crate::runtime::native::{NativeCall, NativeFunction};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::value::Value;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Arena capacity in bytes.
    pub memory_size: u32,
    /// Abort with a runtime error after this many executed instructions.
    /// The only way to bound a runaway script; there is no other cancellation
    /// primitive.
    pub max_steps: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memory_size: 1024 * 1024,
            max_steps: None,
        }
    }
}

/// The scripting engine: compiles source text and executes it in one call.
///
/// Native functions registered before `run` become the lowest global slots,
/// pre-bound to callable values when execution starts. Everything is
/// single-threaded; a failure aborts the program, unloads it, and is returned
/// to the host.
pub struct Engine {
    config: EngineConfig,
    natives: Vec<NativeFunction>,
    ops: Vec<Op>,
    string_table: Vec<String>,
    ip: usize,
    locals_base: u32,
}

impl Engine {
    pub fn new() -> Self {
        Engine::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Engine {
            config,
            natives: Vec::new(),
            ops: Vec::new(),
            string_table: Vec::new(),
            ip: 0,
            locals_base: 0,
        }
    }

    /// Register a host function. Must happen before `run`; the name becomes a
    /// global identifier and collides with script globals of the same name.
    pub fn add_native_function(
        &mut self,
        name: &str,
        func: impl FnMut(&mut NativeCall<'_>) + 'static,
    ) {
        self.natives.push(NativeFunction {
            name: name.to_string(),
            func: Box::new(func),
        });
    }

    /// Tokenize, compile and execute `code`, all-or-nothing. A compile
    /// failure aborts before any execution; a run failure aborts at the
    /// failing instruction. Either way the engine ends up unloaded and the
    /// error is returned; every call recompiles from source.
    pub fn run(&mut self, code: &str) -> Result<(), ScriptError> {
        let result = self.compile_and_run(code);
        if result.is_err() {
            self.ops.clear();
            self.string_table.clear();
        }
        result
    }

    fn compile_and_run(&mut self, code: &str) -> Result<(), ScriptError> {
        self.ip = 0;
        self.locals_base = 0;

        let mut lexer = Lexer::new(code);
        let mut compiler = Compiler::new();
        compiler.set_native_functions(self.natives.iter().map(|n| n.name.as_str()));
        let program = compiler.compile(&mut lexer)?;
        log::debug!("{}", disassemble(&program));
        let Program { ops, string_table } = program;
        self.ops = ops;
        self.string_table = string_table;

        let mut memory = Memory::new(self.config.memory_size)?;
        for index in 0..self.natives.len() as u32 {
            memory.set_global(index, Value::NativeFunction(index))?;
        }

        let mut steps: usize = 0;
        while self.ip < self.ops.len() {
            if let Some(max) = self.config.max_steps {
                steps += 1;
                if steps > max {
                    return Err(RuntimeError::new(format!(
                        "execution step limit exceeded ({})",
                        max
                    ))
                    .into());
                }
            }
            self.step(&mut memory)?;
        }
        log::debug!("finished, free memory: {}", memory.free_memory());
        Ok(())
    }

    fn step(&mut self, memory: &mut Memory) -> Result<(), ScriptError> {
        let op = self.ops[self.ip];
        match op {
            Op::Nop => {}
            Op::PushNone => memory.push_stack(Value::None)?,
            Op::PushInt(v) => memory.push_stack(Value::Int(v))?,
            Op::PushFloat(v) => memory.push_stack(Value::Float(v))?,
            Op::PushEmptyList => {
                // Reserve the slot first; the allocation below may collect.
                memory.push_stack(Value::None)?;
                let list = memory.create_list(16)?;
                memory.stack_set(-1, Value::List(list))?;
            }
            Op::PushString(index) => {
                let Some(text) = self.string_table.get(index as usize) else {
                    return Err(
                        RuntimeError::new(format!("bad string table index: {}", index)).into(),
                    );
                };
                memory.push_stack(Value::None)?;
                let position = memory.create_string(text)?;
                memory.stack_set(-1, Value::Str(position))?;
            }
            Op::PushFunction(entry) => memory.push_stack(Value::ScriptFunction(entry))?,

            Op::Jump(target) => {
                self.ip = target as usize;
                return Ok(());
            }
            Op::JumpIfZero(target) => {
                let v = memory.stack_get(-1)?;
                memory.pop_stack()?;
                if v.is_zero() {
                    self.ip = target as usize;
                    return Ok(());
                }
            }
            Op::JumpIfNotZero(target) => {
                let v = memory.stack_get(-1)?;
                memory.pop_stack()?;
                if !v.is_zero() {
                    self.ip = target as usize;
                    return Ok(());
                }
            }
            Op::Pop => memory.pop_stack()?,

            Op::PushGlobal(index) => memory.push_global(index)?,
            Op::AssignGlobal(index) => memory.assign_global_from_stack(index)?,
            Op::PushLocal(index) => {
                memory.push_stack(Value::None)?;
                let v = memory.stack_get((self.locals_base + index) as i32)?;
                memory.stack_set(-1, v)?;
            }
            Op::AssignLocal(index) => {
                let v = memory.stack_get(-1)?;
                memory.stack_set((self.locals_base + index) as i32, v)?;
                memory.pop_stack()?;
            }

            Op::GetIndex => {
                let position = memory.stack_get(-1)?;
                let target = memory.stack_get(-2)?;
                let Value::List(list) = target else {
                    return Err(RuntimeError::new(format!(
                        "tried to index non-list type: {}",
                        target.type_name()
                    ))
                    .into());
                };
                let Value::Int(index) = position else {
                    return Err(RuntimeError::new(format!(
                        "tried to index with non-integer type: {}",
                        position.type_name()
                    ))
                    .into());
                };
                let offset = memory
                    .list_entry_offset(list, index)
                    .ok_or_else(|| RuntimeError::new(format!("index out of range: {}", index)))?;
                let v = memory.read_value(offset);
                memory.stack_set(-2, v)?;
                memory.pop_stack()?;
            }
            Op::SetIndex => {
                let value = memory.stack_get(-1)?;
                let position = memory.stack_get(-2)?;
                let target = memory.stack_get(-3)?;
                let Value::List(list) = target else {
                    return Err(RuntimeError::new(format!(
                        "tried to index non-list type: {}",
                        target.type_name()
                    ))
                    .into());
                };
                let Value::Int(index) = position else {
                    return Err(RuntimeError::new(format!(
                        "tried to index with non-integer type: {}",
                        position.type_name()
                    ))
                    .into());
                };
                let offset = memory
                    .list_entry_offset(list, index)
                    .ok_or_else(|| RuntimeError::new(format!("index out of range: {}", index)))?;
                memory.write_value(offset, value);
                memory.pop_stack()?;
                memory.pop_stack()?;
                memory.pop_stack()?;
            }
            Op::Append => {
                let target = memory.stack_get(-2)?;
                if !matches!(target, Value::List(_)) {
                    return Err(RuntimeError::new(format!(
                        "tried to append to non-list type: {}",
                        target.type_name()
                    ))
                    .into());
                }
                memory.append_from_stack()?;
            }
            Op::GetMember(_) | Op::SetMember(_) => {
                // Reserved: no dictionary type exists yet.
                return Err(
                    RuntimeError::new(format!("instruction not implemented: {}", op)).into(),
                );
            }

            Op::Call(argc) => {
                let callee_position = -(argc as i32) - 1;
                let callee = memory.stack_get(callee_position)?;
                match callee {
                    Value::ScriptFunction(entry) => {
                        let return_address = self.ip + 1;
                        if return_address >= u16::MAX as usize {
                            return Err(RuntimeError::new(
                                "stack overflow (instruction out of range on call)",
                            )
                            .into());
                        }
                        if self.locals_base >= u16::MAX as u32 {
                            return Err(RuntimeError::new(
                                "stack overflow (locals base out of range on call)",
                            )
                            .into());
                        }
                        memory.stack_set(
                            callee_position,
                            Value::CallFrame {
                                return_address: return_address as u16,
                                locals_base: self.locals_base as u16,
                            },
                        )?;
                        self.locals_base = memory.stack_size() - argc;
                        self.ip = entry as usize;
                        return Ok(());
                    }
                    Value::NativeFunction(index) => {
                        // The callee slot becomes the return value; none
                        // unless the callback sets one.
                        memory.stack_set(callee_position, Value::None)?;
                        let base = memory.stack_size() - argc;
                        let Some(native) = self.natives.get_mut(index as usize) else {
                            return Err(RuntimeError::new(format!(
                                "unknown native function index: {}",
                                index
                            ))
                            .into());
                        };
                        let mut call = NativeCall::new(memory, base, argc);
                        (native.func)(&mut call);
                        let error = call.take_error();
                        if let Some(e) = error {
                            return Err(e.into());
                        }
                        let new_size = memory.stack_size() - argc;
                        memory.truncate_stack(new_size)?;
                    }
                    other => {
                        return Err(RuntimeError::new(format!(
                            "tried to call non-function value: {}",
                            other.type_name()
                        ))
                        .into());
                    }
                }
            }
            Op::EnsureLocals(count) => {
                while memory.stack_size() < self.locals_base + count {
                    memory.push_stack(Value::None)?;
                }
            }
            Op::Return => {
                if self.locals_base == 0 {
                    return Err(RuntimeError::new("return while not inside a function").into());
                }
                let return_value = memory.stack_get(-1)?;
                let frame = memory.stack_get(self.locals_base as i32 - 1)?;
                let Value::CallFrame {
                    return_address,
                    locals_base,
                } = frame
                else {
                    return Err(RuntimeError::new(format!(
                        "corrupted call frame: {}",
                        frame.type_name()
                    ))
                    .into());
                };
                memory.truncate_stack(self.locals_base)?;
                self.ip = return_address as usize;
                self.locals_base = locals_base as u32;
                // The frame slot is now the top of the truncated stack, and
                // nothing can allocate between the truncation and this write.
                memory.stack_set(-1, return_value)?;
                return Ok(());
            }

            Op::Not => {
                let v = memory.stack_get(-1)?;
                memory.stack_set(-1, Value::Int(v.is_zero() as i32))?;
            }
            Op::BitNot => {
                let v = memory.stack_get(-1)?;
                let Value::Int(value) = v else {
                    return Err(RuntimeError::new(format!(
                        "bad operation '^' on type: {}",
                        v.type_name()
                    ))
                    .into());
                };
                memory.stack_set(-1, Value::Int(!value))?;
            }
            Op::Neg => {
                let v = memory.stack_get(-1)?;
                let negated = match v {
                    Value::Int(value) => Value::Int(value.wrapping_neg()),
                    Value::Float(value) => Value::Float(-value),
                    other => {
                        return Err(RuntimeError::new(format!(
                            "tried to negate non-number type: {}",
                            other.type_name()
                        ))
                        .into());
                    }
                };
                memory.stack_set(-1, negated)?;
            }

            Op::Or => logical(memory, |a, b| a || b)?,
            Op::And => logical(memory, |a, b| a && b)?,
            Op::BitOr => bitwise(memory, "|", |a, b| a | b)?,
            Op::BitXor => bitwise(memory, "^", |a, b| a ^ b)?,
            Op::BitAnd => bitwise(memory, "&", |a, b| a & b)?,
            Op::Shl => bitwise(memory, "<<", |a, b| a.wrapping_shl(b as u32))?,
            Op::Shr => bitwise(memory, ">>", |a, b| a.wrapping_shr(b as u32))?,
            Op::Eq => comparison(memory, "==", |a, b| a == b, |a, b| a == b)?,
            Op::Ne => comparison(memory, "!=", |a, b| a != b, |a, b| a != b)?,
            Op::Lt => comparison(memory, "<", |a, b| a < b, |a, b| a < b)?,
            Op::Le => comparison(memory, "<=", |a, b| a <= b, |a, b| a <= b)?,
            Op::Gt => comparison(memory, ">", |a, b| a > b, |a, b| a > b)?,
            Op::Ge => comparison(memory, ">=", |a, b| a >= b, |a, b| a >= b)?,
            Op::Add => add(memory)?,
            Op::Sub => arithmetic(memory, "-", |a, b| Ok(a.wrapping_sub(b)), |a, b| a - b)?,
            Op::Mul => arithmetic(memory, "*", |a, b| Ok(a.wrapping_mul(b)), |a, b| a * b)?,
            Op::Div => arithmetic(
                memory,
                "/",
                |a, b| {
                    if b == 0 {
                        Err(RuntimeError::new("division by zero"))
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                },
                |a, b| a / b,
            )?,
            Op::Rem => arithmetic(
                memory,
                "%",
                |a, b| {
                    if b == 0 {
                        Err(RuntimeError::new("modulo by zero"))
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                },
                |a, b| a % b,
            )?,
        }
        self.ip += 1;
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

/// `+` is the one operator with three shapes: integer addition, float
/// addition with promotion, and string concatenation.
fn add(memory: &mut Memory) -> Result<(), ScriptError> {
    let b = memory.stack_get(-1)?;
    let a = memory.stack_get(-2)?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            memory.stack_set(-2, Value::Int(x.wrapping_add(y)))?;
        }
        (Value::Str(x), Value::Str(y)) => {
            let joined = format!("{}{}", memory.get_string(x), memory.get_string(y));
            // The allocation may collect, which makes x and y stale; the
            // operand slots themselves were relocated with the stack.
            let position = memory.create_string(&joined)?;
            memory.stack_set(-2, Value::Str(position))?;
        }
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => memory.stack_set(-2, Value::Float(x + y))?,
            _ => return Err(RuntimeError::bad_operation("+", a, b).into()),
        },
    }
    memory.pop_stack()?;
    Ok(())
}

fn arithmetic(
    memory: &mut Memory,
    symbol: &str,
    int_op: impl Fn(i32, i32) -> Result<i32, RuntimeError>,
    float_op: impl Fn(f32, f32) -> f32,
) -> Result<(), ScriptError> {
    let b = memory.stack_get(-1)?;
    let a = memory.stack_get(-2)?;
    let result = match (a, b) {
        (Value::Int(x), Value::Int(y)) => Value::Int(int_op(x, y)?),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Value::Float(float_op(x, y)),
            _ => return Err(RuntimeError::bad_operation(symbol, a, b).into()),
        },
    };
    memory.stack_set(-2, result)?;
    memory.pop_stack()?;
    Ok(())
}

/// Comparisons accept any two numbers and yield integer 0/1. Two integers
/// compare exactly; any other numeric pairing compares as floats.
fn comparison(
    memory: &mut Memory,
    symbol: &str,
    int_cmp: impl Fn(i32, i32) -> bool,
    float_cmp: impl Fn(f32, f32) -> bool,
) -> Result<(), ScriptError> {
    let b = memory.stack_get(-1)?;
    let a = memory.stack_get(-2)?;
    let result = match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_cmp(x, y),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => float_cmp(x, y),
            _ => return Err(RuntimeError::bad_operation(symbol, a, b).into()),
        },
    };
    memory.stack_set(-2, Value::Int(result as i32))?;
    memory.pop_stack()?;
    Ok(())
}

/// `||` and `&&` work on the truthiness of any two operands. Both operands
/// are already on the stack, so there is no short-circuiting.
fn logical(memory: &mut Memory, f: impl Fn(bool, bool) -> bool) -> Result<(), ScriptError> {
    let b = memory.stack_get(-1)?;
    let a = memory.stack_get(-2)?;
    let result = f(!a.is_zero(), !b.is_zero());
    memory.stack_set(-2, Value::Int(result as i32))?;
    memory.pop_stack()?;
    Ok(())
}

fn bitwise(
    memory: &mut Memory,
    symbol: &str,
    f: impl Fn(i32, i32) -> i32,
) -> Result<(), ScriptError> {
    let b = memory.stack_get(-1)?;
    let a = memory.stack_get(-2)?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => memory.stack_set(-2, Value::Int(f(x, y)))?,
        _ => return Err(RuntimeError::bad_operation(symbol, a, b).into()),
    }
    memory.pop_stack()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Run a program with an `output(v)` native that records what it saw.
    fn run_collecting(source: &str) -> Result<Vec<String>, ScriptError> {
        run_collecting_with(EngineConfig::default(), source)
    }

    fn run_collecting_with(
        config: EngineConfig,
        source: &str,
    ) -> Result<Vec<String>, ScriptError> {
        let output = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&output);
        let mut engine = Engine::with_config(config);
        engine.add_native_function("output", move |call| {
            let text = if call.is_string(0) {
                call.get_string(0)
            } else if call.is_int(0) {
                call.get_int(0).to_string()
            } else if call.is_float(0) {
                call.get_float(0).to_string()
            } else {
                "none".to_string()
            };
            sink.borrow_mut().push(text);
        });
        engine.run(source)?;
        let recorded = output.borrow().clone();
        Ok(recorded)
    }

    fn run_err(source: &str) -> RuntimeError {
        match run_collecting(source) {
            Err(ScriptError::Runtime(e)) => e,
            Err(ScriptError::Memory(e)) => RuntimeError::new(e.message),
            other => panic!("expected runtime error, got: {:?}", other),
        }
    }

    // =========================================================================
    // Core scenarios
    // =========================================================================

    #[test]
    fn test_while_loop_counts_up() {
        let recorded = run_collecting("var x = 1\nwhile x < 5:\n  x = x + 1\noutput(x)\n").unwrap();
        assert_eq!(recorded, vec!["5"]);
    }

    #[test]
    fn test_string_concatenation() {
        let recorded = run_collecting("output(\"a\" + \"b\")\n").unwrap();
        assert_eq!(recorded, vec!["ab"]);
    }

    #[test]
    fn test_negative_list_index() {
        let recorded = run_collecting("var l = [1, 2, 3]\noutput(l[-1])\n").unwrap();
        assert_eq!(recorded, vec!["3"]);
    }

    #[test]
    fn test_recursive_factorial() {
        let source = "\
function fact(n):
  if n < 2:
    return 1
  return n * fact(n - 1)
output(fact(5))
";
        let recorded = run_collecting(source).unwrap();
        assert_eq!(recorded, vec!["120"]);
    }

    #[test]
    fn test_type_mismatch_names_both_types() {
        let output = Rc::new(RefCell::new(Vec::<String>::new()));
        let sink = Rc::clone(&output);
        let mut engine = Engine::new();
        engine.add_native_function("output", move |call| {
            sink.borrow_mut().push(call.get_string(0));
        });
        let err = engine.run("output(1 + \"a\")\n").unwrap_err();
        match err {
            ScriptError::Runtime(e) => {
                assert!(e.message.contains("integer"), "got: {}", e.message);
                assert!(e.message.contains("string"), "got: {}", e.message);
            }
            other => panic!("expected runtime error, got: {:?}", other),
        }
        // Nothing was recorded before the failure.
        assert!(output.borrow().is_empty());
    }

    #[test]
    fn test_gc_stress_preserves_live_list() {
        // A small arena so the churn below forces collections; the list made
        // before the loop must survive them with its contents intact.
        let config = EngineConfig {
            memory_size: 4096,
            max_steps: None,
        };
        let source = "\
var keep = [1, 2, 3]
var s = \"\"
var i = 0
for i = 0; i < 100; i = i + 1:
  s = \"abcdefgh\" + \"ijklmnop\"
output(keep[0])
output(keep[1])
output(keep[2])
";
        let recorded = run_collecting_with(config, source).unwrap();
        assert_eq!(recorded, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_determinism() {
        let source = "\
function f(n):
  return n * 2
var total = 0
var i = 0
while i < 10:
  total = total + f(i)
  i = i + 1
output(total)
";
        assert_eq!(
            run_collecting(source).unwrap(),
            run_collecting(source).unwrap()
        );
    }

    // =========================================================================
    // Calls and locals
    // =========================================================================

    #[test]
    fn test_recursion_keeps_locals_separate() {
        // Each frame's `a` lives at the same slot index but a different
        // locals-base; recursion must not alias them.
        let source = "\
function f(n):
  var a = n * 10
  if n < 2:
    return a
  var b = f(n - 1)
  return a + b
output(f(3))
";
        let recorded = run_collecting(source).unwrap();
        assert_eq!(recorded, vec!["60"]);
    }

    #[test]
    fn test_function_without_return_yields_none() {
        let recorded = run_collecting("function f():\n  var a = 1\noutput(f())\n").unwrap();
        assert_eq!(recorded, vec!["none"]);
    }

    #[test]
    fn test_native_return_value() {
        let mut engine = Engine::new();
        let result = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&result);
        engine.add_native_function("double", |call| {
            let v = call.get_int(0);
            call.return_int(v * 2);
        });
        engine.add_native_function("output", move |call| {
            *sink.borrow_mut() = call.get_int(0);
        });
        engine.run("output(double(21))\n").unwrap();
        assert_eq!(*result.borrow(), 42);
    }

    #[test]
    fn test_native_string_return_allocates() {
        let recorded = {
            let output = Rc::new(RefCell::new(Vec::new()));
            let sink = Rc::clone(&output);
            let mut engine = Engine::new();
            engine.add_native_function("greet", |call| {
                let name = call.get_string(0);
                call.return_string(&format!("hello {}", name));
            });
            engine.add_native_function("output", move |call| {
                sink.borrow_mut().push(call.get_string(0));
            });
            engine.run("output(greet(\"world\"))\n").unwrap();
            let recorded = output.borrow().clone();
            recorded
        };
        assert_eq!(recorded, vec!["hello world"]);
    }

    #[test]
    fn test_call_non_callable() {
        let err = run_err("var x = 1\nx(2)\n");
        assert!(err.message.contains("non-function"));
    }

    #[test]
    fn test_return_outside_function_at_runtime() {
        // The compiler refuses `return` at top level, so exercise the engine
        // check with a hand-built program.
        let mut engine = Engine::new();
        engine.ops = vec![Op::PushNone, Op::Return];
        let mut memory = Memory::new(4096).unwrap();
        engine.step(&mut memory).unwrap();
        let err = match engine.step(&mut memory) {
            Err(ScriptError::Runtime(e)) => e,
            other => panic!("expected runtime error, got: {:?}", other),
        };
        assert!(err.message.contains("return while not inside a function"));
    }

    #[test]
    fn test_deep_recursion_overflows() {
        let source = "\
function f(n):
  return f(n + 1)
output(f(0))
";
        let err = run_err(source);
        assert!(err.message.contains("stack overflow") || err.message.contains("out of memory"));
    }

    // =========================================================================
    // Operators
    // =========================================================================

    #[test]
    fn test_arithmetic_promotion() {
        let recorded = run_collecting("output(1 + 2)\noutput(1 + 2.5)\noutput(7 / 2)\n").unwrap();
        assert_eq!(recorded, vec!["3", "3.5", "3"]);
    }

    #[test]
    fn test_comparisons_yield_integers() {
        let recorded =
            run_collecting("output(1 < 2)\noutput(2 <= 1)\noutput(1.5 > 1)\noutput(3 == 3)\n")
                .unwrap();
        assert_eq!(recorded, vec!["1", "0", "1", "1"]);
    }

    #[test]
    fn test_logical_operators_use_truthiness() {
        let recorded =
            run_collecting("output(0 || 2)\noutput(0 && 2)\noutput(\"\" && 1)\n").unwrap();
        // Strings are unconditionally true, even empty ones.
        assert_eq!(recorded, vec!["1", "0", "1"]);
    }

    #[test]
    fn test_bitwise_operators() {
        let recorded =
            run_collecting("output(6 & 3)\noutput(6 | 3)\noutput(6 ^ 3)\noutput(1 << 4)\noutput(32 >> 2)\n")
                .unwrap();
        assert_eq!(recorded, vec!["2", "7", "5", "16", "8"]);
    }

    #[test]
    fn test_bitwise_rejects_floats() {
        let err = run_err("output(1.5 & 2)\n");
        assert!(err.message.contains("'&'"));
        assert!(err.message.contains("float"));
    }

    #[test]
    fn test_unary_operators() {
        let recorded =
            run_collecting("output(!0)\noutput(!3)\noutput(^0)\nvar x = 5\noutput(-x)\n").unwrap();
        assert_eq!(recorded, vec!["1", "0", "-1", "-5"]);
    }

    #[test]
    fn test_division_by_zero() {
        let err = run_err("output(1 / 0)\n");
        assert!(err.message.contains("division by zero"));
        let err = run_err("output(1 % 0)\n");
        assert!(err.message.contains("modulo by zero"));
    }

    #[test]
    fn test_truncating_integer_division() {
        let recorded = run_collecting("output(7 / 2)\noutput(-7 / 2)\noutput(7 % 3)\n").unwrap();
        assert_eq!(recorded, vec!["3", "-3", "1"]);
    }

    // =========================================================================
    // Lists
    // =========================================================================

    #[test]
    fn test_list_read_write_by_index() {
        let recorded =
            run_collecting("var l = [1, 2, 3]\nl[1] = 9\noutput(l[1])\noutput(l[0])\n").unwrap();
        assert_eq!(recorded, vec!["9", "1"]);
    }

    #[test]
    fn test_index_out_of_range() {
        let err = run_err("var l = [1]\noutput(l[3])\n");
        assert!(err.message.contains("index out of range"));
        let err = run_err("var l = [1]\noutput(l[-2])\n");
        assert!(err.message.contains("index out of range"));
    }

    #[test]
    fn test_index_type_errors() {
        let err = run_err("var x = 1\noutput(x[0])\n");
        assert!(err.message.contains("non-list"));
        let err = run_err("var l = [1]\noutput(l[\"a\"])\n");
        assert!(err.message.contains("non-integer"));
    }

    #[test]
    fn test_list_literal_grows_past_reserve() {
        // 20 elements overflow the 16-slot reserve during construction.
        let elements: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let source = format!(
            "var l = [{}]\noutput(l[19])\noutput(l[-20])\n",
            elements.join(", ")
        );
        let recorded = run_collecting(&source).unwrap();
        assert_eq!(recorded, vec!["19", "0"]);
    }

    // =========================================================================
    // Failure modes
    // =========================================================================

    #[test]
    fn test_member_access_is_unexecutable() {
        let err = run_err("var l = []\nl.size\n");
        assert!(err.message.contains("not implemented"));
        let err = run_err("var l = []\nl.size = 1\n");
        assert!(err.message.contains("not implemented"));
    }

    #[test]
    fn test_step_limit() {
        let config = EngineConfig {
            memory_size: 64 * 1024,
            max_steps: Some(1000),
        };
        let err = match run_collecting_with(config, "var x = 0\nwhile 1:\n  x = x + 1\n") {
            Err(ScriptError::Runtime(e)) => e,
            other => panic!("expected runtime error, got: {:?}", other),
        };
        assert!(err.message.contains("step limit"));
    }

    #[test]
    fn test_engine_unloads_after_failure_and_can_rerun() {
        let mut engine = Engine::new();
        engine.add_native_function("output", |_| {});
        assert!(engine.run("output(1 + \"a\")\n").is_err());
        // A fresh run after a failure works normally.
        assert!(engine.run("output(1)\n").is_ok());
    }

    #[test]
    fn test_empty_program() {
        assert!(run_collecting("").unwrap().is_empty());
        assert!(run_collecting("// comments only\n").unwrap().is_empty());
    }
}
