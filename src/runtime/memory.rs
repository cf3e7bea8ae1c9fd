use thiserror::Error;

use crate::runtime::gc;
use crate::runtime::value::{VALUE_SIZE, Value};

pub(crate) const LIST_HEADER_SIZE: u32 = 12;
pub(crate) const LIST_RESERVE_INCREMENT: u32 = 16;

/// An allocation failed even after a collection pass, or a stack/list
/// operation was handed an impossible request. Aborts the running program.
#[derive(Debug, Clone, Error)]
#[error("memory error: {message}")]
pub struct MemoryError {
    pub message: String,
}

impl MemoryError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        MemoryError {
            message: message.into(),
        }
    }
}

/// An arena-resident growable list: current length, reserved capacity, and
/// the offset of its item storage. The operand stack and the globals table
/// are two distinguished lists of this shape.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListHeader {
    pub len: u32,
    pub cap: u32,
    pub items: u32,
}

/// One fixed-capacity byte arena with a bump allocator.
///
/// Everything dynamic lives here, addressed by 4-byte-aligned offsets: the
/// operand stack, the globals table, user lists and strings. When an
/// allocation does not fit, the copying collector rebuilds the arena and the
/// request is retried once.
///
/// The central invariant of this module: an offset fetched before an
/// allocating call is stale after it. Every operation that allocates re-reads
/// headers and slots afterwards, and callers must not pass in values holding
/// unrooted heap offsets across an allocation (push a placeholder first, then
/// store into it).
pub struct Memory {
    pub(crate) data: Vec<u8>,
    pub(crate) size: u32,
    pub(crate) alloc_point: u32,
    pub(crate) stack_list: u32,
    pub(crate) globals_list: u32,
}

impl Memory {
    pub fn new(size: u32) -> Result<Memory, MemoryError> {
        let mut memory = Memory {
            data: vec![0; size as usize],
            size,
            alloc_point: 0,
            stack_list: 0,
            globals_list: 0,
        };
        // The roots are allocated directly; the collector must not run before
        // both of them exist.
        memory.stack_list = memory.alloc_no_collect(LIST_HEADER_SIZE + VALUE_SIZE * 32)?;
        memory.write_list(
            memory.stack_list,
            ListHeader {
                len: 0,
                cap: 32,
                items: memory.stack_list + LIST_HEADER_SIZE,
            },
        );
        memory.globals_list = memory.alloc_no_collect(LIST_HEADER_SIZE + VALUE_SIZE * 32)?;
        memory.write_list(
            memory.globals_list,
            ListHeader {
                len: 0,
                cap: 32,
                items: memory.globals_list + LIST_HEADER_SIZE,
            },
        );
        Ok(memory)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    fn alloc_no_collect(&mut self, size: u32) -> Result<u32, MemoryError> {
        let size = align4(size);
        if self.size - self.alloc_point < size {
            return Err(MemoryError::new("out of memory"));
        }
        let position = self.alloc_point;
        self.alloc_point += size;
        Ok(position)
    }

    fn allocate(&mut self, size: u32) -> Result<u32, MemoryError> {
        let size = align4(size);
        if self.size - self.alloc_point < size {
            self.collect();
        }
        self.alloc_no_collect(size)
    }

    /// Bump allocation for the collector while it fills the replacement
    /// arena. Live data never exceeds the old arena, so this always fits.
    pub(crate) fn bump(&mut self, size: u32) -> u32 {
        let size = align4(size);
        debug_assert!(
            self.size - self.alloc_point >= size,
            "collector copy exceeded arena capacity"
        );
        let position = self.alloc_point;
        self.alloc_point += size;
        position
    }

    /// Run the copying collector now.
    pub fn collect(&mut self) {
        gc::collect(self);
    }

    /// Bytes left in the arena, measured after a collection pass.
    pub fn free_memory(&mut self) -> u32 {
        self.collect();
        self.size - self.alloc_point
    }

    // =========================================================================
    // Operand stack
    // =========================================================================

    pub fn stack_size(&self) -> u32 {
        self.read_list(self.stack_list).len
    }

    /// Append to the operand stack, growing its storage if full. Growth may
    /// collect: `value` must not hold an unrooted heap offset (push a
    /// placeholder and overwrite it via `stack_set` instead).
    pub fn push_stack(&mut self, value: Value) -> Result<(), MemoryError> {
        let header = self.read_list(self.stack_list);
        if header.len == header.cap {
            let new_cap = header.cap + LIST_RESERVE_INCREMENT;
            let new_items = self.allocate(VALUE_SIZE * new_cap)?;
            // The stack may have been relocated by the allocation.
            let header = self.read_list(self.stack_list);
            self.copy_items(header.items, new_items, header.len);
            self.write_list(
                self.stack_list,
                ListHeader {
                    len: header.len,
                    cap: new_cap,
                    items: new_items,
                },
            );
        }
        let header = self.read_list(self.stack_list);
        self.write_value(header.items + VALUE_SIZE * header.len, value);
        self.write_list(
            self.stack_list,
            ListHeader {
                len: header.len + 1,
                ..header
            },
        );
        Ok(())
    }

    pub fn pop_stack(&mut self) -> Result<(), MemoryError> {
        let header = self.read_list(self.stack_list);
        if header.len == 0 {
            return Err(MemoryError::new("stack underrun"));
        }
        self.write_list(
            self.stack_list,
            ListHeader {
                len: header.len - 1,
                ..header
            },
        );
        Ok(())
    }

    /// Shrink the stack to `len` slots. Shrinking never reallocates; growing
    /// through this entry point is refused.
    pub fn truncate_stack(&mut self, len: u32) -> Result<(), MemoryError> {
        let header = self.read_list(self.stack_list);
        if header.len < len {
            return Err(MemoryError::new("stack truncation can only shrink the stack"));
        }
        self.write_list(self.stack_list, ListHeader { len, ..header });
        Ok(())
    }

    fn stack_offset(&self, position: i32) -> Result<u32, MemoryError> {
        let header = self.read_list(self.stack_list);
        let index = if position < 0 {
            header.len as i64 + position as i64
        } else {
            position as i64
        };
        if index < 0 || index >= header.len as i64 {
            return Err(MemoryError::new("stack underrun"));
        }
        Ok(header.items + VALUE_SIZE * index as u32)
    }

    /// Read a stack slot; negative positions count from the top (-1 = top).
    pub fn stack_get(&self, position: i32) -> Result<Value, MemoryError> {
        Ok(self.read_value(self.stack_offset(position)?))
    }

    pub fn stack_set(&mut self, position: i32, value: Value) -> Result<(), MemoryError> {
        let offset = self.stack_offset(position)?;
        self.write_value(offset, value);
        Ok(())
    }

    // =========================================================================
    // Globals
    // =========================================================================

    /// Make sure global slot `index` exists, growing the table and filling
    /// fresh slots with none. May collect.
    fn ensure_global(&mut self, index: u32) -> Result<(), MemoryError> {
        let header = self.read_list(self.globals_list);
        if header.cap <= index {
            let new_cap = index + 1;
            let new_items = self.allocate(VALUE_SIZE * new_cap)?;
            let header = self.read_list(self.globals_list);
            self.copy_items(header.items, new_items, header.len);
            self.write_list(
                self.globals_list,
                ListHeader {
                    len: header.len,
                    cap: new_cap,
                    items: new_items,
                },
            );
        }
        let mut header = self.read_list(self.globals_list);
        while header.len <= index {
            self.write_value(header.items + VALUE_SIZE * header.len, Value::None);
            header.len += 1;
        }
        self.write_list(self.globals_list, header);
        Ok(())
    }

    pub fn get_global(&mut self, index: u32) -> Result<Value, MemoryError> {
        self.ensure_global(index)?;
        let header = self.read_list(self.globals_list);
        Ok(self.read_value(header.items + VALUE_SIZE * index))
    }

    /// Write a global slot directly. Growth may collect, so `value` must not
    /// hold an unrooted heap offset; the engine only uses this to pre-bind
    /// native-function values.
    pub fn set_global(&mut self, index: u32, value: Value) -> Result<(), MemoryError> {
        self.ensure_global(index)?;
        let header = self.read_list(self.globals_list);
        self.write_value(header.items + VALUE_SIZE * index, value);
        Ok(())
    }

    /// Pop the stack top into a global slot. The slot is created first so the
    /// value is only read after any growth collection has settled.
    pub fn assign_global_from_stack(&mut self, index: u32) -> Result<(), MemoryError> {
        self.ensure_global(index)?;
        let value = self.stack_get(-1)?;
        let header = self.read_list(self.globals_list);
        self.write_value(header.items + VALUE_SIZE * index, value);
        self.pop_stack()
    }

    /// Push a copy of a global slot onto the stack. The stack slot is
    /// reserved first, as both the push and the table growth can collect.
    pub fn push_global(&mut self, index: u32) -> Result<(), MemoryError> {
        self.push_stack(Value::None)?;
        self.ensure_global(index)?;
        let header = self.read_list(self.globals_list);
        let value = self.read_value(header.items + VALUE_SIZE * index);
        self.stack_set(-1, value)
    }

    // =========================================================================
    // Strings
    // =========================================================================

    /// Allocate an immutable length-prefixed string. May collect.
    pub fn create_string(&mut self, text: &str) -> Result<u32, MemoryError> {
        let bytes = text.as_bytes();
        let position = self.allocate(4 + bytes.len() as u32)?;
        self.write_u32(position, bytes.len() as u32);
        let start = position as usize + 4;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(position)
    }

    pub fn get_string(&self, position: u32) -> String {
        let len = self.read_u32(position) as usize;
        let start = position as usize + 4;
        String::from_utf8_lossy(&self.data[start..start + len]).into_owned()
    }

    // =========================================================================
    // Lists
    // =========================================================================

    /// Allocate an empty list with `cap` reserved slots. Header and item
    /// storage are one allocation, so a half-built list can never be torn
    /// apart by a collection.
    pub fn create_list(&mut self, cap: u32) -> Result<u32, MemoryError> {
        let position = self.allocate(LIST_HEADER_SIZE + VALUE_SIZE * cap)?;
        self.write_list(
            position,
            ListHeader {
                len: 0,
                cap,
                items: position + LIST_HEADER_SIZE,
            },
        );
        Ok(position)
    }

    pub fn list_len(&self, list: u32) -> u32 {
        self.read_list(list).len
    }

    /// Offset of one list entry; negative indices count from the end. None if
    /// out of range after normalization.
    pub(crate) fn list_entry_offset(&self, list: u32, index: i32) -> Option<u32> {
        let header = self.read_list(list);
        let index = if index < 0 {
            header.len as i64 + index as i64
        } else {
            index as i64
        };
        if index < 0 || index >= header.len as i64 {
            return None;
        }
        Some(header.items + VALUE_SIZE * index as u32)
    }

    /// Pop the value at the top of the stack and append it to the list in the
    /// slot beneath it. The value stays on the stack (rooted) until the list
    /// has room, so a growth collection cannot lose it.
    pub fn append_from_stack(&mut self) -> Result<(), MemoryError> {
        let Value::List(list) = self.stack_get(-2)? else {
            return Err(MemoryError::new("tried to append to non-list item"));
        };
        let header = self.read_list(list);
        if header.len == header.cap {
            let new_cap = header.cap + LIST_RESERVE_INCREMENT;
            let new_items = self.allocate(VALUE_SIZE * new_cap)?;
            // Both the list and its storage may have moved.
            let Value::List(list) = self.stack_get(-2)? else {
                return Err(MemoryError::new("tried to append to non-list item"));
            };
            let header = self.read_list(list);
            self.copy_items(header.items, new_items, header.len);
            self.write_list(
                list,
                ListHeader {
                    len: header.len,
                    cap: new_cap,
                    items: new_items,
                },
            );
        }
        let Value::List(list) = self.stack_get(-2)? else {
            return Err(MemoryError::new("tried to append to non-list item"));
        };
        let header = self.read_list(list);
        let value = self.stack_get(-1)?;
        self.write_value(header.items + VALUE_SIZE * header.len, value);
        self.write_list(
            list,
            ListHeader {
                len: header.len + 1,
                ..header
            },
        );
        self.pop_stack()
    }

    // =========================================================================
    // Raw access
    // =========================================================================

    pub(crate) fn read_value(&self, position: u32) -> Value {
        read_value_at(&self.data, position)
    }

    pub(crate) fn write_value(&mut self, position: u32, value: Value) {
        let start = position as usize;
        self.data[start..start + VALUE_SIZE as usize].copy_from_slice(&value.encode());
    }

    pub(crate) fn read_u32(&self, position: u32) -> u32 {
        read_u32_at(&self.data, position)
    }

    pub(crate) fn write_u32(&mut self, position: u32, value: u32) {
        let start = position as usize;
        self.data[start..start + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn read_list(&self, position: u32) -> ListHeader {
        read_list_at(&self.data, position)
    }

    pub(crate) fn write_list(&mut self, position: u32, header: ListHeader) {
        self.write_u32(position, header.len);
        self.write_u32(position + 4, header.cap);
        self.write_u32(position + 8, header.items);
    }

    fn copy_items(&mut self, from: u32, to: u32, count: u32) {
        let from = from as usize;
        let to = to as usize;
        let bytes = (count * VALUE_SIZE) as usize;
        self.data.copy_within(from..from + bytes, to);
    }
}

fn align4(size: u32) -> u32 {
    size.saturating_add(3) & !3
}

pub(crate) fn read_u32_at(data: &[u8], position: u32) -> u32 {
    let start = position as usize;
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&data[start..start + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_value_at(data: &[u8], position: u32) -> Value {
    let start = position as usize;
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[start..start + VALUE_SIZE as usize]);
    Value::decode(bytes)
}

pub(crate) fn read_list_at(data: &[u8], position: u32) -> ListHeader {
    ListHeader {
        len: read_u32_at(data, position),
        cap: read_u32_at(data, position + 4),
        items: read_u32_at(data, position + 8),
    }
}
