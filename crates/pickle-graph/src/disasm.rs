use std::collections::HashMap;
use crate::opcode::{ArgLayout, OpCode};
use crate::Error;

/// One decoded opcode together with the exact bytes it occupied in the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction<'a> {
    pub pos: usize,
    pub op: OpCode,
    raw: &'a [u8],
    arg_start: usize,
}

impl<'a> Instruction<'a> {
    /// Opcode byte plus argument, exactly as read.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    /// Argument payload: fixed-width bytes, the body of a length-prefixed
    /// value (prefix stripped), or the text lines including their newlines.
    pub fn arg(&self) -> &'a [u8] {
        &self.raw[self.arg_start..]
    }

    /// Newline-terminated text arguments, without the newlines.
    pub fn lines(&self) -> Vec<&'a [u8]> {
        let arg = self.arg();
        let arg = arg.strip_suffix(b"\n").unwrap_or(arg);
        arg.split(|b| *b == b'\n').collect()
    }

    pub fn malformed(&self, reason: impl Into<String>) -> Error {
        Error::MalformedArgument { op: self.op, pos: self.pos, reason: reason.into() }
    }
}

/// Splits a pickle stream into instructions, up to and including `STOP`.
pub fn disassemble(data: &[u8]) -> Result<Vec<Instruction<'_>>, Error> {
    let mut out = vec![];
    let mut pos = 0;
    while pos < data.len() {
        let byte = data[pos];
        let op = OpCode::from_byte(byte).ok_or(Error::UnknownOpCode { byte, pos })?;
        let arg_pos = pos + 1;
        let (arg_start, end) = match op.arg_layout() {
            ArgLayout::None => (arg_pos, arg_pos),
            ArgLayout::Fixed(n) => (arg_pos, arg_pos + n),
            ArgLayout::Prefixed(n) => {
                let prefix = data.get(arg_pos..arg_pos + n).ok_or(Error::UnexpectedEof(arg_pos))?;
                let mut len_bytes = [0u8; 8];
                len_bytes[..n].copy_from_slice(prefix);
                let len = u64::from_le_bytes(len_bytes);
                if op == OpCode::BinString && (len as u32 as i32) < 0 {
                    return Err(Error::MalformedArgument { op, pos, reason: "negative length".to_string() });
                }
                let len = usize::try_from(len).map_err(|_| Error::UnexpectedEof(arg_pos))?;
                let start = arg_pos + n;
                (start, start.checked_add(len).ok_or(Error::UnexpectedEof(start))?)
            }
            ArgLayout::Lines(count) => {
                let mut end = arg_pos;
                for _ in 0..count {
                    let newline = data[end.min(data.len())..].iter().position(|b| *b == b'\n')
                        .ok_or(Error::UnexpectedEof(end))?;
                    end += newline + 1;
                }
                (arg_pos, end)
            }
        };
        if end > data.len() {
            return Err(Error::UnexpectedEof(data.len()));
        }
        out.push(Instruction { pos, op, raw: &data[pos..end], arg_start: arg_start - pos });
        pos = end;
        if op == OpCode::Stop {
            return Ok(out);
        }
    }
    Err(Error::MissingStop)
}

/// Replacement bytes for the instruction at `index`.
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub index: usize,
    pub bytes: Vec<u8>,
}

/// Re-emits a disassembled stream with some instructions replaced.
///
/// Untouched instructions keep their original bytes. Once anything is
/// replaced, `FRAME` hints no longer describe the data and are left out;
/// framing is optional for readers.
pub fn reassemble(instructions: &[Instruction], patches: &[Patch]) -> Vec<u8> {
    let replaced: HashMap<usize, &[u8]> = patches.iter().map(|p| (p.index, p.bytes.as_slice())).collect();
    let drop_frames = !replaced.is_empty();
    let mut out = Vec::with_capacity(instructions.iter().map(|i| i.raw.len()).sum());
    for (index, instruction) in instructions.iter().enumerate() {
        if drop_frames && instruction.op == OpCode::Frame {
            continue;
        }
        out.extend_from_slice(replaced.get(&index).copied().unwrap_or(instruction.raw));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_arguments_by_layout() {
        // PROTO 2, GLOBAL torch FloatStorage, SHORT_BINUNICODE "ab", BININT1 7, STOP
        let data = b"\x80\x02ctorch\nFloatStorage\n\x8c\x02abK\x07.";
        let instrs = disassemble(data).unwrap();
        let ops: Vec<OpCode> = instrs.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![OpCode::Proto, OpCode::Global, OpCode::ShortBinUnicode, OpCode::BinInt1, OpCode::Stop]);
        assert_eq!(instrs[1].lines(), vec![&b"torch"[..], &b"FloatStorage"[..]]);
        assert_eq!(instrs[2].arg(), b"ab");
        assert_eq!(instrs[3].arg(), &[7]);
        assert_eq!(instrs[3].pos, 26);
    }

    #[test]
    fn reports_truncation_and_missing_stop() {
        assert!(matches!(disassemble(b"\x80\x02X\x05\x00\x00\x00ab"), Err(Error::UnexpectedEof(_))));
        assert!(matches!(disassemble(b"\x80\x02N"), Err(Error::MissingStop)));
        assert!(matches!(disassemble(b"\xff"), Err(Error::UnknownOpCode { byte: 0xff, pos: 0 })));
    }

    #[test]
    fn reassemble_without_patches_is_identity() {
        let data = b"\x80\x04\x95\x05\x00\x00\x00\x00\x00\x00\x00K\x01K\x02\x86.";
        let instrs = disassemble(data).unwrap();
        assert_eq!(reassemble(&instrs, &[]), data.to_vec());
    }

    #[test]
    fn patches_replace_their_instruction_and_frames_drop() {
        let data = b"\x80\x04\x95\x03\x00\x00\x00\x00\x00\x00\x00K\x01.";
        let instrs = disassemble(data).unwrap();
        let patched = reassemble(&instrs, &[Patch { index: 2, bytes: b"M\x00\x01".to_vec() }]);
        assert_eq!(patched, b"\x80\x04M\x00\x01.".to_vec());
    }
}
