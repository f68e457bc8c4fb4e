use strum_macros::{Display, FromRepr};

/// Every opcode understood by the pickle virtual machine, protocols 0 through 5.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, FromRepr)]
#[repr(u8)]
pub enum OpCode {
    Mark = b'(',
    Stop = b'.',
    Pop = b'0',
    PopMark = b'1',
    Dup = b'2',
    Float = b'F',
    Int = b'I',
    BinInt = b'J',
    BinInt1 = b'K',
    Long = b'L',
    BinInt2 = b'M',
    None = b'N',
    PersId = b'P',
    BinPersId = b'Q',
    Reduce = b'R',
    String = b'S',
    BinString = b'T',
    ShortBinString = b'U',
    Unicode = b'V',
    BinUnicode = b'X',
    Append = b'a',
    Build = b'b',
    Global = b'c',
    Dict = b'd',
    EmptyDict = b'}',
    Appends = b'e',
    Get = b'g',
    BinGet = b'h',
    Inst = b'i',
    LongBinGet = b'j',
    List = b'l',
    EmptyList = b']',
    Obj = b'o',
    Put = b'p',
    BinPut = b'q',
    LongBinPut = b'r',
    SetItem = b's',
    Tuple = b't',
    EmptyTuple = b')',
    SetItems = b'u',
    BinFloat = b'G',
    // protocol 2
    Proto = 0x80,
    NewObj = 0x81,
    Ext1 = 0x82,
    Ext2 = 0x83,
    Ext4 = 0x84,
    Tuple1 = 0x85,
    Tuple2 = 0x86,
    Tuple3 = 0x87,
    NewTrue = 0x88,
    NewFalse = 0x89,
    Long1 = 0x8a,
    Long4 = 0x8b,
    // protocol 3
    BinBytes = b'B',
    ShortBinBytes = b'C',
    // protocol 4
    ShortBinUnicode = 0x8c,
    BinUnicode8 = 0x8d,
    BinBytes8 = 0x8e,
    EmptySet = 0x8f,
    AddItems = 0x90,
    FrozenSet = 0x91,
    NewObjEx = 0x92,
    StackGlobal = 0x93,
    Memoize = 0x94,
    Frame = 0x95,
    // protocol 5
    ByteArray8 = 0x96,
    NextBuffer = 0x97,
    ReadOnlyBuffer = 0x98,
}

/// How the argument bytes following an opcode are laid out.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgLayout {
    None,
    Fixed(usize),
    /// Length-prefixed payload; the prefix is this many little-endian bytes.
    Prefixed(usize),
    /// Newline-terminated text lines.
    Lines(usize),
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn arg_layout(self) -> ArgLayout {
        match self {
            OpCode::Proto | OpCode::BinInt1 | OpCode::BinGet | OpCode::BinPut | OpCode::Ext1 => ArgLayout::Fixed(1),
            OpCode::BinInt2 | OpCode::Ext2 => ArgLayout::Fixed(2),
            OpCode::BinInt | OpCode::LongBinGet | OpCode::LongBinPut | OpCode::Ext4 => ArgLayout::Fixed(4),
            OpCode::BinFloat | OpCode::Frame => ArgLayout::Fixed(8),
            OpCode::ShortBinString | OpCode::ShortBinBytes | OpCode::ShortBinUnicode | OpCode::Long1 => ArgLayout::Prefixed(1),
            OpCode::BinString | OpCode::BinBytes | OpCode::BinUnicode | OpCode::Long4 => ArgLayout::Prefixed(4),
            OpCode::BinUnicode8 | OpCode::BinBytes8 | OpCode::ByteArray8 => ArgLayout::Prefixed(8),
            OpCode::Int | OpCode::Long | OpCode::Float | OpCode::Get | OpCode::Put
            | OpCode::PersId | OpCode::String | OpCode::Unicode => ArgLayout::Lines(1),
            OpCode::Global | OpCode::Inst => ArgLayout::Lines(2),
            _ => ArgLayout::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_through_from_byte() {
        for op in [OpCode::Mark, OpCode::BinPersId, OpCode::Proto, OpCode::Frame, OpCode::ReadOnlyBuffer] {
            assert_eq!(OpCode::from_byte(op.byte()), Some(op));
        }
        assert_eq!(OpCode::from_byte(0xff), None);
    }
}
