mod disasm;
mod op;
mod writer;

pub use disasm::{disassemble, disassemble_at};
pub use op::{Builtin, InvokeForm, Op};
pub use writer::{read_i32, BytecodeWriter, Label};
