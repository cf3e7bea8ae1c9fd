use serde::{Deserialize, Serialize};

use crate::bytecode::Op;

/// A compiled program: the flat instruction vector plus the deduplicated
/// string-literal table it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub ops: Vec<Op>,
    pub string_table: Vec<String>,
}
