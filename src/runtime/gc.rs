use std::collections::HashMap;

use crate::runtime::memory::{
    LIST_HEADER_SIZE, LIST_RESERVE_INCREMENT, ListHeader, Memory, read_list_at, read_u32_at,
    read_value_at,
};
use crate::runtime::value::{VALUE_SIZE, Value};

/// Stop-the-world copying collector.
///
/// A same-size replacement arena is filled by walking the two root lists (the
/// operand stack and the globals table) depth-first and copying everything
/// reachable. The relocation map sends every old offset to one new offset, so
/// aliased references converge on a single copy: two slots that shared a list
/// before a collection still share it afterwards.
pub(crate) struct Collector {
    old: Vec<u8>,
    relocated: HashMap<u32, u32>,
}

pub(crate) fn collect(memory: &mut Memory) {
    let old = std::mem::replace(&mut memory.data, vec![0; memory.size as usize]);
    let used = memory.alloc_point;
    memory.alloc_point = 0;
    let mut collector = Collector {
        old,
        relocated: HashMap::new(),
    };
    let stack = memory.stack_list;
    memory.stack_list = collector.copy_list(memory, stack);
    let globals = memory.globals_list;
    memory.globals_list = collector.copy_list(memory, globals);
    log::debug!(
        "collected: {} of {} bytes live",
        memory.alloc_point,
        used
    );
}

impl Collector {
    /// Copy a list and everything it reaches into the new arena, trimming
    /// its reserve to at most `len + 16` slots.
    fn copy_list(&mut self, memory: &mut Memory, old_position: u32) -> u32 {
        if let Some(&new_position) = self.relocated.get(&old_position) {
            return new_position;
        }
        let old = read_list_at(&self.old, old_position);
        let cap = (old.len + LIST_RESERVE_INCREMENT).min(old.cap);
        let new_position = memory.bump(LIST_HEADER_SIZE + VALUE_SIZE * cap);
        let new_items = new_position + LIST_HEADER_SIZE;
        memory.write_list(
            new_position,
            ListHeader {
                len: old.len,
                cap,
                items: new_items,
            },
        );
        // Map the list before copying its entries, so a list reachable from
        // its own contents converges instead of recursing forever.
        self.relocated.insert(old_position, new_position);
        for n in 0..old.len {
            let value = read_value_at(&self.old, old.items + VALUE_SIZE * n);
            let copied = self.copy_value(memory, value);
            memory.write_value(new_items + VALUE_SIZE * n, copied);
        }
        new_position
    }

    fn copy_value(&mut self, memory: &mut Memory, value: Value) -> Value {
        match value {
            Value::Str(offset) => Value::Str(self.copy_string(memory, offset)),
            Value::List(offset) => Value::List(self.copy_list(memory, offset)),
            // Everything else is payload-only and copies verbatim. A future
            // dictionary type must get its own copy routine here.
            other => other,
        }
    }

    fn copy_string(&mut self, memory: &mut Memory, old_position: u32) -> u32 {
        if let Some(&new_position) = self.relocated.get(&old_position) {
            return new_position;
        }
        let len = read_u32_at(&self.old, old_position);
        let new_position = memory.bump(4 + len);
        memory.write_u32(new_position, len);
        let from = old_position as usize + 4;
        let to = new_position as usize + 4;
        memory.data[to..to + len as usize].copy_from_slice(&self.old[from..from + len as usize]);
        self.relocated.insert(old_position, new_position);
        new_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_preserves_stack_contents() {
        let mut memory = Memory::new(4096).unwrap();
        memory.push_stack(Value::Int(1)).unwrap();
        memory.push_stack(Value::None).unwrap();
        let s = memory.create_string("keep me").unwrap();
        memory.stack_set(-1, Value::Str(s)).unwrap();

        memory.collect();

        assert_eq!(memory.stack_get(-2).unwrap(), Value::Int(1));
        let Value::Str(s) = memory.stack_get(-1).unwrap() else {
            panic!("expected string on stack");
        };
        assert_eq!(memory.get_string(s), "keep me");
    }

    #[test]
    fn test_collection_preserves_aliasing() {
        let mut memory = Memory::new(4096).unwrap();
        // One list referenced from two stack slots and a global slot.
        memory.push_stack(Value::None).unwrap();
        let list = memory.create_list(4).unwrap();
        memory.stack_set(-1, Value::List(list)).unwrap();
        memory.push_stack(Value::Int(42)).unwrap();
        memory.append_from_stack().unwrap();
        let list_value = memory.stack_get(-1).unwrap();
        memory.push_stack(Value::None).unwrap();
        memory.stack_set(-1, list_value).unwrap();
        memory.set_global(0, Value::None).unwrap();
        memory.push_stack(Value::None).unwrap();
        memory.stack_set(-1, list_value).unwrap();
        memory.assign_global_from_stack(0).unwrap();

        memory.collect();

        let a = memory.stack_get(-1).unwrap();
        let b = memory.stack_get(-2).unwrap();
        let g = memory.get_global(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, g);
        let Value::List(list) = a else {
            panic!("expected list");
        };
        assert_eq!(memory.list_len(list), 1);
        let offset = memory.list_entry_offset(list, 0).unwrap();
        assert_eq!(memory.read_value(offset), Value::Int(42));
    }

    #[test]
    fn test_collection_reclaims_garbage() {
        let mut memory = Memory::new(4096).unwrap();
        for _ in 0..16 {
            memory.push_stack(Value::None).unwrap();
            let s = memory.create_string("garbage garbage").unwrap();
            memory.stack_set(-1, Value::Str(s)).unwrap();
            memory.pop_stack().unwrap();
        }
        let before = memory.alloc_point;

        memory.collect();

        assert!(memory.alloc_point < before);
    }

    #[test]
    fn test_nested_lists_survive() {
        let mut memory = Memory::new(4096).unwrap();
        // stack: [outer]; outer: [inner]; inner: ["deep"]
        memory.push_stack(Value::None).unwrap();
        let inner = memory.create_list(2).unwrap();
        memory.stack_set(-1, Value::List(inner)).unwrap();
        memory.push_stack(Value::None).unwrap();
        let s = memory.create_string("deep").unwrap();
        memory.stack_set(-1, Value::Str(s)).unwrap();
        memory.append_from_stack().unwrap();

        memory.push_stack(Value::None).unwrap();
        let outer = memory.create_list(2).unwrap();
        memory.stack_set(-1, Value::List(outer)).unwrap();
        // stack is now [inner, outer]; swap so append sees [outer, inner]
        let inner_value = memory.stack_get(-2).unwrap();
        let outer_value = memory.stack_get(-1).unwrap();
        memory.stack_set(-2, outer_value).unwrap();
        memory.stack_set(-1, inner_value).unwrap();
        memory.append_from_stack().unwrap();

        memory.collect();

        let Value::List(outer) = memory.stack_get(-1).unwrap() else {
            panic!("expected outer list");
        };
        let entry = memory.list_entry_offset(outer, 0).unwrap();
        let Value::List(inner) = memory.read_value(entry) else {
            panic!("expected inner list");
        };
        let entry = memory.list_entry_offset(inner, 0).unwrap();
        let Value::Str(s) = memory.read_value(entry) else {
            panic!("expected string");
        };
        assert_eq!(memory.get_string(s), "deep");
    }

    #[test]
    fn test_self_referential_list_converges() {
        let mut memory = Memory::new(4096).unwrap();
        memory.push_stack(Value::None).unwrap();
        let list = memory.create_list(2).unwrap();
        memory.stack_set(-1, Value::List(list)).unwrap();
        // Append the list to itself: l[0] is l.
        let list_value = memory.stack_get(-1).unwrap();
        memory.push_stack(Value::None).unwrap();
        memory.stack_set(-1, list_value).unwrap();
        memory.append_from_stack().unwrap();

        memory.collect();

        let Value::List(list) = memory.stack_get(-1).unwrap() else {
            panic!("expected list");
        };
        let entry = memory.list_entry_offset(list, 0).unwrap();
        assert_eq!(memory.read_value(entry), Value::List(list));
    }
}
