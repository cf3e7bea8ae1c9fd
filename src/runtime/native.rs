use crate::runtime::memory::{Memory, MemoryError};
use crate::runtime::value::Value;

/// A host function registered with the engine. The name becomes a global
/// identifier visible to script code; registration order fixes the global
/// slot.
pub struct NativeFunction {
    pub name: String,
    pub func: Box<dyn FnMut(&mut NativeCall<'_>)>,
}

/// The argument window handed to a native callback during a `call`.
///
/// Getters are total: an out-of-range index or a wrong type yields the type's
/// default (0, 0.0, the empty string) instead of failing. At most one of the
/// `return_*` setters should be invoked per call; if several are, the last
/// write wins. The callee's stack slot starts out as none, which is also the
/// return value when no setter runs.
pub struct NativeCall<'a> {
    memory: &'a mut Memory,
    base: u32,
    count: u32,
    error: Option<MemoryError>,
}

impl<'a> NativeCall<'a> {
    pub(crate) fn new(memory: &'a mut Memory, base: u32, count: u32) -> Self {
        NativeCall {
            memory,
            base,
            count,
            error: None,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.count as usize
    }

    fn parameter(&self, index: usize) -> Option<Value> {
        if index >= self.count as usize {
            return None;
        }
        self.memory.stack_get((self.base as usize + index) as i32).ok()
    }

    pub fn is_none(&self, index: usize) -> bool {
        matches!(self.parameter(index), None | Some(Value::None))
    }

    pub fn is_int(&self, index: usize) -> bool {
        matches!(self.parameter(index), Some(Value::Int(_)))
    }

    pub fn is_float(&self, index: usize) -> bool {
        matches!(self.parameter(index), Some(Value::Float(_)))
    }

    pub fn is_number(&self, index: usize) -> bool {
        self.is_int(index) || self.is_float(index)
    }

    pub fn is_string(&self, index: usize) -> bool {
        matches!(self.parameter(index), Some(Value::Str(_)))
    }

    pub fn get_int(&self, index: usize) -> i32 {
        match self.parameter(index) {
            Some(Value::Int(v)) => v,
            _ => 0,
        }
    }

    pub fn get_float(&self, index: usize) -> f32 {
        self.get_number(index)
    }

    pub fn get_number(&self, index: usize) -> f32 {
        match self.parameter(index) {
            Some(Value::Int(v)) => v as f32,
            Some(Value::Float(v)) => v,
            _ => 0.0,
        }
    }

    pub fn get_string(&self, index: usize) -> String {
        match self.parameter(index) {
            Some(Value::Str(offset)) => self.memory.get_string(offset),
            _ => String::new(),
        }
    }

    pub fn return_none(&mut self) {
        self.set_return(Value::None);
    }

    pub fn return_int(&mut self, value: i32) {
        self.set_return(Value::Int(value));
    }

    pub fn return_float(&mut self, value: f32) {
        self.set_return(Value::Float(value));
    }

    /// Allocates the string in the arena. If the allocation fails even after
    /// a collection, the return slot stays none and the failure is reported
    /// as the call's error once the callback finishes.
    pub fn return_string(&mut self, value: &str) {
        match self.memory.create_string(value) {
            Ok(offset) => self.set_return(Value::Str(offset)),
            Err(e) => self.error = Some(e),
        }
    }

    fn set_return(&mut self, value: Value) {
        // The callee slot sits directly below the argument window.
        if let Err(e) = self.memory.stack_set(self.base as i32 - 1, value) {
            self.error = Some(e);
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<MemoryError> {
        self.error.take()
    }
}
