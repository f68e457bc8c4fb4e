pub mod opcode;
pub mod object;
pub mod disasm;
pub mod machine;
pub mod writer;

pub use disasm::{disassemble, reassemble, Instruction, Patch};
pub use machine::{load, GlobalPolicy, MemoRead, PersistentRef, TrustAll, Unpickled, EXPANSION_LIMIT};
pub use object::Object;
pub use opcode::OpCode;
pub use writer::{encode_fragment, to_vec};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unexpected end of pickle data at byte {0}")]
    UnexpectedEof(usize),
    #[error("Unknown opcode 0x{byte:02x} at byte {pos}")]
    UnknownOpCode { byte: u8, pos: usize },
    #[error("Malformed argument for {op} at byte {pos}: {reason}")]
    MalformedArgument { op: OpCode, pos: usize, reason: String },
    #[error("Pickle data ended without a STOP opcode")]
    MissingStop,
    #[error("Stack underflow executing {op} at byte {pos}")]
    StackUnderflow { op: OpCode, pos: usize },
    #[error("No MARK on the stack for {op} at byte {pos}")]
    MissingMark { op: OpCode, pos: usize },
    #[error("Memo entry {0} is not defined")]
    MissingMemo(u32),
    #[error("Unsupported opcode {op} at byte {pos}")]
    UnsupportedOpCode { op: OpCode, pos: usize },
    #[error("Invalid stack state for {op} at byte {pos}: {reason}")]
    InvalidStack { op: OpCode, pos: usize, reason: String },
    #[error("Memo references expand the pickle past {0} objects")]
    ExpansionLimit(usize),
    #[error("Global {module}.{name} is not in the trusted type allow-list")]
    DisallowedGlobal { module: String, name: String },
}
