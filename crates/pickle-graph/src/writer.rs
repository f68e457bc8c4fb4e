use crate::object::Object;
use crate::opcode::OpCode;

const BATCH_SIZE: usize = 1000;

/// Serializes an object graph as a protocol 2 pickle.
///
/// Opcodes from later protocols are used only for values protocol 2 cannot
/// express directly (bytes, sets, keyword-argument construction).
pub fn to_vec(obj: &Object) -> Vec<u8> {
    let mut writer = Writer::default();
    writer.op(OpCode::Proto);
    writer.buf.push(2);
    writer.save(obj);
    writer.op(OpCode::Stop);
    writer.buf
}

/// Encodes the instructions that push `obj`, without header or `STOP`, for
/// splicing into an existing stream.
pub fn encode_fragment(obj: &Object) -> Vec<u8> {
    let mut writer = Writer::default();
    writer.save(obj);
    writer.buf
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn op(&mut self, op: OpCode) {
        self.buf.push(op.byte());
    }

    fn prefixed(&mut self, short: OpCode, long: OpCode, data: &[u8]) {
        if data.len() < 256 {
            self.op(short);
            self.buf.push(data.len() as u8);
        } else if data.len() <= u32::MAX as usize {
            self.op(long);
            self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        } else {
            self.op(OpCode::BinBytes8);
            self.buf.extend_from_slice(&(data.len() as u64).to_le_bytes());
        }
        self.buf.extend_from_slice(data);
    }

    fn int(&mut self, value: i64) {
        if (0..=0xff).contains(&value) {
            self.op(OpCode::BinInt1);
            self.buf.push(value as u8);
        } else if (0..=0xffff).contains(&value) {
            self.op(OpCode::BinInt2);
            self.buf.extend_from_slice(&(value as u16).to_le_bytes());
        } else if let Ok(v) = i32::try_from(value) {
            self.op(OpCode::BinInt);
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else {
            let bytes = value.to_le_bytes();
            let mut len = bytes.len();
            while len > 1 {
                let (last, prev) = (bytes[len - 1], bytes[len - 2]);
                if (last == 0 && prev & 0x80 == 0) || (last == 0xff && prev & 0x80 != 0) {
                    len -= 1;
                } else {
                    break;
                }
            }
            self.long(&bytes[..len]);
        }
    }

    fn long(&mut self, bytes: &[u8]) {
        if bytes.len() < 256 {
            self.op(OpCode::Long1);
            self.buf.push(bytes.len() as u8);
        } else {
            self.op(OpCode::Long4);
            self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }
        self.buf.extend_from_slice(bytes);
    }

    fn unicode(&mut self, s: &str) {
        let bytes = s.as_bytes();
        if bytes.len() <= u32::MAX as usize {
            self.op(OpCode::BinUnicode);
            self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        } else {
            self.op(OpCode::BinUnicode8);
            self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        }
        self.buf.extend_from_slice(bytes);
    }

    fn marked(&mut self, items: &[Object], close: OpCode) {
        self.op(OpCode::Mark);
        for item in items {
            self.save(item);
        }
        self.op(close);
    }

    fn batched_items(&mut self, items: &[Object], close: OpCode) {
        for chunk in items.chunks(BATCH_SIZE) {
            self.marked(chunk, close);
        }
    }

    fn batched_entries(&mut self, entries: &[(Object, Object)]) {
        for chunk in entries.chunks(BATCH_SIZE) {
            self.op(OpCode::Mark);
            for (k, v) in chunk {
                self.save(k);
                self.save(v);
            }
            self.op(OpCode::SetItems);
        }
    }

    fn save(&mut self, obj: &Object) {
        match obj {
            Object::None => self.op(OpCode::None),
            Object::Bool(true) => self.op(OpCode::NewTrue),
            Object::Bool(false) => self.op(OpCode::NewFalse),
            Object::Int(v) => self.int(*v),
            Object::BigInt(bytes) => self.long(bytes),
            Object::Float(v) => {
                self.op(OpCode::BinFloat);
                self.buf.extend_from_slice(&v.to_be_bytes());
            }
            Object::Unicode(s) => self.unicode(s),
            Object::Bytes(b) => self.prefixed(OpCode::ShortBinBytes, OpCode::BinBytes, b),
            Object::ByteArray(b) => {
                self.op(OpCode::ByteArray8);
                self.buf.extend_from_slice(&(b.len() as u64).to_le_bytes());
                self.buf.extend_from_slice(b);
            }
            Object::Tuple(items) => match items.as_slice() {
                [] => self.op(OpCode::EmptyTuple),
                [a] => {
                    self.save(a);
                    self.op(OpCode::Tuple1);
                }
                [a, b] => {
                    self.save(a);
                    self.save(b);
                    self.op(OpCode::Tuple2);
                }
                [a, b, c] => {
                    self.save(a);
                    self.save(b);
                    self.save(c);
                    self.op(OpCode::Tuple3);
                }
                _ => self.marked(items, OpCode::Tuple),
            },
            Object::List(items) => {
                self.op(OpCode::EmptyList);
                self.batched_items(items, OpCode::Appends);
            }
            Object::Dict(entries) => {
                self.op(OpCode::EmptyDict);
                self.batched_entries(entries);
            }
            Object::Set(items) => {
                self.op(OpCode::EmptySet);
                self.batched_items(items, OpCode::AddItems);
            }
            Object::FrozenSet(items) => self.marked(items, OpCode::FrozenSet),
            Object::Global { module, name } => {
                self.op(OpCode::Global);
                self.buf.extend_from_slice(module.as_bytes());
                self.buf.push(b'\n');
                self.buf.extend_from_slice(name.as_bytes());
                self.buf.push(b'\n');
            }
            Object::Reduce { callable, args } => {
                self.save(callable);
                self.save(args);
                self.op(OpCode::Reduce);
            }
            Object::NewObj { class, args, kwargs } => {
                self.save(class);
                self.save(args);
                match kwargs {
                    Some(kwargs) => {
                        self.save(kwargs);
                        self.op(OpCode::NewObjEx);
                    }
                    None => self.op(OpCode::NewObj),
                }
            }
            Object::Build { target, state } => {
                self.save(target);
                self.save(state);
                self.op(OpCode::Build);
            }
            Object::PersistentLoad(pid) => {
                self.save(pid);
                self.op(OpCode::BinPersId);
            }
            Object::Mapping { base, entries } => {
                self.save(base);
                self.batched_entries(entries);
            }
            Object::Sequence { base, items } => {
                self.save(base);
                self.batched_items(items, OpCode::Appends);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::disassemble;
    use crate::machine::{load, TrustAll};

    fn reload(obj: &Object) -> Object {
        let bytes = to_vec(obj);
        load(&disassemble(&bytes).unwrap(), &TrustAll).unwrap().root
    }

    #[test]
    fn torch_style_state_dict_survives() {
        let pid = Object::Tuple(vec![
            Object::unicode("storage"),
            Object::global("torch", "FloatStorage"),
            Object::unicode("0"),
            Object::unicode("cuda:0"),
            Object::Int(16),
        ]);
        let tensor = Object::reduce(
            Object::global("torch._utils", "_rebuild_tensor_v2"),
            Object::Tuple(vec![
                Object::PersistentLoad(Box::new(pid)),
                Object::Int(0),
                Object::Tuple(vec![Object::Int(4), Object::Int(4)]),
                Object::Tuple(vec![Object::Int(4), Object::Int(1)]),
                Object::Bool(false),
                Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![])),
            ]),
        );
        let state = Object::Mapping {
            base: Box::new(Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![]))),
            entries: vec![(Object::unicode("weight"), tensor)],
        };
        assert_eq!(reload(&state), state);
    }

    #[test]
    fn integer_encodings_pick_the_narrowest_opcode() {
        assert_eq!(encode_fragment(&Object::Int(7)), vec![b'K', 7]);
        assert_eq!(encode_fragment(&Object::Int(300)), vec![b'M', 0x2c, 0x01]);
        assert_eq!(encode_fragment(&Object::Int(-1)), vec![b'J', 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(encode_fragment(&Object::Int(1 << 40)), vec![0x8a, 6, 0, 0, 0, 0, 0, 1]);
        for v in [i64::MIN, i64::MAX, -(1 << 40), 1 << 31] {
            assert_eq!(reload(&Object::Int(v)), Object::Int(v));
        }
    }

    #[test]
    fn containers_and_scalars() {
        let obj = Object::Tuple(vec![
            Object::List((0..1500).map(Object::Int).collect()),
            Object::Set(vec![Object::unicode("a")]),
            Object::FrozenSet(vec![]),
            Object::Bytes(vec![0; 300]),
            Object::Float(-0.5),
            Object::None,
            Object::NewObj {
                class: Box::new(Object::global("mace.modules.blocks", "LinearNodeEmbeddingBlock")),
                args: Box::new(Object::Tuple(vec![])),
                kwargs: None,
            },
        ]);
        assert_eq!(reload(&obj), obj);
    }
}
