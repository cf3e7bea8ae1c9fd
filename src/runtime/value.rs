/// Size of one encoded value in the arena: a 4-byte tag and a 4-byte payload.
pub(crate) const VALUE_SIZE: u32 = 8;

/// A script value. Heap values (`Str`, `List`) carry an arena offset, never a
/// native reference, so the collector can relocate the whole heap without
/// rewriting anything outside the arena.
///
/// `CallFrame` never reaches script code: it only exists in the callee's
/// stack slot while a call is active. Packing the return address and the
/// caller's locals-base into two u16 halves of the payload cell is what bounds
/// both quantities (exceeding them is reported as a stack overflow).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    None,
    Int(i32),
    Float(f32),
    Str(u32),
    List(u32),
    ScriptFunction(u32),
    NativeFunction(u32),
    CallFrame {
        return_address: u16,
        locals_base: u16,
    },
}

impl Value {
    /// Truthiness for conditional jumps and `!`. Strings and lists are true
    /// regardless of content; empty ones are not falsy.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::None => true,
            Value::Int(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            _ => false,
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_number(&self) -> Option<f32> {
        match self {
            Value::Int(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::ScriptFunction(_) => "function",
            Value::NativeFunction(_) => "native function",
            Value::CallFrame { .. } => "call frame",
        }
    }

    pub(crate) fn encode(self) -> [u8; 8] {
        let (tag, payload): (u32, [u8; 4]) = match self {
            Value::None => (0, [0; 4]),
            Value::Int(v) => (1, v.to_le_bytes()),
            Value::Float(v) => (2, v.to_le_bytes()),
            Value::Str(offset) => (3, offset.to_le_bytes()),
            Value::List(offset) => (4, offset.to_le_bytes()),
            Value::ScriptFunction(entry) => (5, entry.to_le_bytes()),
            Value::NativeFunction(index) => (6, index.to_le_bytes()),
            Value::CallFrame {
                return_address,
                locals_base,
            } => {
                let mut payload = [0; 4];
                payload[..2].copy_from_slice(&return_address.to_le_bytes());
                payload[2..].copy_from_slice(&locals_base.to_le_bytes());
                (7, payload)
            }
        };
        let mut out = [0; 8];
        out[..4].copy_from_slice(&tag.to_le_bytes());
        out[4..].copy_from_slice(&payload);
        out
    }

    pub(crate) fn decode(bytes: [u8; 8]) -> Value {
        let mut tag = [0; 4];
        tag.copy_from_slice(&bytes[..4]);
        let mut payload = [0; 4];
        payload.copy_from_slice(&bytes[4..]);
        match u32::from_le_bytes(tag) {
            1 => Value::Int(i32::from_le_bytes(payload)),
            2 => Value::Float(f32::from_le_bytes(payload)),
            3 => Value::Str(u32::from_le_bytes(payload)),
            4 => Value::List(u32::from_le_bytes(payload)),
            5 => Value::ScriptFunction(u32::from_le_bytes(payload)),
            6 => Value::NativeFunction(u32::from_le_bytes(payload)),
            7 => {
                let mut low = [0; 2];
                low.copy_from_slice(&payload[..2]);
                let mut high = [0; 2];
                high.copy_from_slice(&payload[2..]);
                Value::CallFrame {
                    return_address: u16::from_le_bytes(low),
                    locals_base: u16::from_le_bytes(high),
                }
            }
            // Tag 0 and anything unrecognized reads as none; zeroed arena
            // bytes therefore decode to none.
            _ => Value::None,
        }
    }
}
