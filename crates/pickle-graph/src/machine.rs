use std::collections::HashMap;
use crate::disasm::Instruction;
use crate::object::Object;
use crate::opcode::OpCode;
use crate::Error;

/// Decides which `module.name` globals may be referenced by a pickle.
pub trait GlobalPolicy {
    fn permits(&self, module: &str, name: &str) -> bool;
}

/// Accepts every global.
pub struct TrustAll;

impl GlobalPolicy for TrustAll {
    fn permits(&self, _module: &str, _name: &str) -> bool {
        true
    }
}

/// Most object nodes that memo fetches may copy during one load.
pub const EXPANSION_LIMIT: usize = 1 << 20;

/// A persistent id seen while loading.
#[derive(Clone, Debug, PartialEq)]
pub struct PersistentRef {
    /// Instruction that consumed the id.
    pub index: usize,
    pub pid: Object,
    /// Instruction that pushed the id.
    pub origin: usize,
    /// When the id is a tuple assembled on the stack, the instruction that
    /// pushed each of its elements. Empty otherwise.
    pub parts: Vec<usize>,
}

/// A memo fetch and the instruction that originally pushed the fetched value.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoRead {
    pub index: usize,
    pub source: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Unpickled {
    pub root: Object,
    pub persistent: Vec<PersistentRef>,
    pub memo_reads: Vec<MemoRead>,
    pub protocol: u8,
}

struct Slot {
    obj: Object,
    memo_keys: Vec<u32>,
    origin: usize,
    parts: Vec<usize>,
}

struct Memoized {
    obj: Object,
    source: usize,
    nodes: usize,
}

struct Machine<'p, P: GlobalPolicy + ?Sized> {
    policy: &'p P,
    stack: Vec<Slot>,
    marks: Vec<usize>,
    memo: HashMap<u32, Memoized>,
    memo_reads: Vec<MemoRead>,
    expanded: usize,
    persistent: Vec<PersistentRef>,
    protocol: u8,
    index: usize,
}

/// Runs the instructions and rebuilds the object graph.
///
/// The memo holds copies: an object is refreshed in the memo whenever it is
/// mutated while on the stack, which covers everything a pickler emits except
/// self-referencing cycles. Copies made by memo fetches are capped at
/// [`EXPANSION_LIMIT`] nodes.
pub fn load<P: GlobalPolicy + ?Sized>(instructions: &[Instruction], policy: &P) -> Result<Unpickled, Error> {
    let mut machine = Machine {
        policy,
        stack: vec![],
        marks: vec![],
        memo: HashMap::new(),
        memo_reads: vec![],
        expanded: 0,
        persistent: vec![],
        protocol: 0,
        index: 0,
    };
    for (index, instruction) in instructions.iter().enumerate() {
        if let Some(root) = machine.step(index, instruction)? {
            return Ok(Unpickled {
                root,
                persistent: machine.persistent,
                memo_reads: machine.memo_reads,
                protocol: machine.protocol,
            });
        }
    }
    Err(Error::MissingStop)
}

fn map_legacy_module(module: &str) -> &str {
    match module {
        "__builtin__" => "builtins",
        "copy_reg" => "copyreg",
        _ => module,
    }
}

fn le_int(bytes: &[u8]) -> Object {
    if bytes.is_empty() {
        return Object::Int(0);
    }
    if bytes.len() > 8 {
        return Object::BigInt(bytes.to_vec());
    }
    let fill = if bytes[bytes.len() - 1] & 0x80 != 0 { 0xff } else { 0 };
    let mut buf = [fill; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Object::Int(i64::from_le_bytes(buf))
}

fn text<'a>(instruction: &Instruction<'a>) -> Result<&'a str, Error> {
    let line = instruction.lines().into_iter().next().unwrap_or_default();
    std::str::from_utf8(line).map_err(|_| instruction.malformed("non-ascii text argument"))
}

fn parse_text_int(instruction: &Instruction) -> Result<Object, Error> {
    let line = text(instruction)?;
    match line {
        "00" if instruction.op == OpCode::Int => return Ok(Object::Bool(false)),
        "01" if instruction.op == OpCode::Int => return Ok(Object::Bool(true)),
        _ => {}
    }
    let digits = line.strip_suffix('L').unwrap_or(line);
    let value: i128 = digits.parse().map_err(|_| instruction.malformed(format!("bad integer {line:?}")))?;
    Ok(match i64::try_from(value) {
        Ok(v) => Object::Int(v),
        Err(_) => {
            let bytes = value.to_le_bytes();
            // trim redundant sign bytes
            let mut len = bytes.len();
            while len > 1 {
                let (last, prev) = (bytes[len - 1], bytes[len - 2]);
                if (last == 0 && prev & 0x80 == 0) || (last == 0xff && prev & 0x80 != 0) {
                    len -= 1;
                } else {
                    break;
                }
            }
            Object::BigInt(bytes[..len].to_vec())
        }
    })
}

fn unescape_string(instruction: &Instruction) -> Result<Object, Error> {
    let line = instruction.lines().into_iter().next().unwrap_or_default();
    let inner = match line {
        [q, inner @ .., e] if (*q == b'\'' || *q == b'"') && q == e => inner,
        _ => return Err(instruction.malformed("STRING argument must be quoted")),
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut iter = inner.iter().copied();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'0') => out.push(0),
            Some(b'x') => {
                let hex: Vec<u8> = iter.by_ref().take(2).collect();
                let value = std::str::from_utf8(&hex).ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| instruction.malformed("bad \\x escape"))?;
                out.push(value);
            }
            Some(other) => out.push(other),
            None => return Err(instruction.malformed("dangling escape")),
        }
    }
    Ok(bytes_or_text(out))
}

fn raw_unicode_escape(instruction: &Instruction) -> Result<Object, Error> {
    let line = instruction.lines().into_iter().next().unwrap_or_default();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' && i + 1 < line.len() && (line[i + 1] == b'u' || line[i + 1] == b'U') {
            let width = if line[i + 1] == b'u' { 4 } else { 8 };
            let hex = line.get(i + 2..i + 2 + width).ok_or_else(|| instruction.malformed("short unicode escape"))?;
            let c = std::str::from_utf8(hex).ok()
                .and_then(|h| u32::from_str_radix(h, 16).ok())
                .and_then(char::from_u32)
                .ok_or_else(|| instruction.malformed("bad unicode escape"))?;
            out.push(c);
            i += 2 + width;
        } else {
            out.push(b as char);
            i += 1;
        }
    }
    Ok(Object::Unicode(out))
}

/// Python 2 `str` payloads decode to text when they can.
fn bytes_or_text(bytes: Vec<u8>) -> Object {
    match String::from_utf8(bytes) {
        Ok(s) => Object::Unicode(s),
        Err(e) => Object::Bytes(e.into_bytes()),
    }
}

impl<'p, P: GlobalPolicy + ?Sized> Machine<'p, P> {
    fn push(&mut self, obj: Object) {
        self.stack.push(Slot { obj, memo_keys: vec![], origin: self.index, parts: vec![] });
    }

    fn push_tuple(&mut self, slots: Vec<Slot>) {
        let parts = slots.iter().map(|s| s.origin).collect();
        let items = slots.into_iter().map(|s| s.obj).collect();
        self.stack.push(Slot { obj: Object::Tuple(items), memo_keys: vec![], origin: self.index, parts });
    }

    fn pop_slot(&mut self, instruction: &Instruction) -> Result<Slot, Error> {
        if self.marks.last() == Some(&self.stack.len()) {
            return Err(Error::StackUnderflow { op: instruction.op, pos: instruction.pos });
        }
        self.stack.pop().ok_or(Error::StackUnderflow { op: instruction.op, pos: instruction.pos })
    }

    fn pop(&mut self, instruction: &Instruction) -> Result<Object, Error> {
        self.pop_slot(instruction).map(|s| s.obj)
    }

    fn pop_mark_slots(&mut self, instruction: &Instruction) -> Result<Vec<Slot>, Error> {
        let mark = self.marks.pop().ok_or(Error::MissingMark { op: instruction.op, pos: instruction.pos })?;
        Ok(self.stack.split_off(mark))
    }

    fn pop_mark(&mut self, instruction: &Instruction) -> Result<Vec<Object>, Error> {
        Ok(self.pop_mark_slots(instruction)?.into_iter().map(|s| s.obj).collect())
    }

    fn top(&mut self, instruction: &Instruction) -> Result<&mut Slot, Error> {
        if self.marks.last() == Some(&self.stack.len()) {
            return Err(Error::StackUnderflow { op: instruction.op, pos: instruction.pos });
        }
        self.stack.last_mut().ok_or(Error::StackUnderflow { op: instruction.op, pos: instruction.pos })
    }

    /// Mutates the object on top of the stack and refreshes any memo copies of it.
    fn modify_top(&mut self, instruction: &Instruction, f: impl FnOnce(Object) -> Result<Object, Error>) -> Result<(), Error> {
        let slot = self.top(instruction)?;
        let obj = std::mem::replace(&mut slot.obj, Object::None);
        slot.obj = f(obj)?;
        if slot.memo_keys.is_empty() {
            return Ok(());
        }
        let refreshed = slot.obj.clone();
        let keys = slot.memo_keys.clone();
        let nodes = refreshed.node_count();
        for key in keys {
            if let Some(entry) = self.memo.get_mut(&key) {
                entry.obj = refreshed.clone();
                entry.nodes = nodes;
            }
        }
        Ok(())
    }

    fn memo_put(&mut self, instruction: &Instruction, key: u32) -> Result<(), Error> {
        let slot = self.top(instruction)?;
        slot.memo_keys.push(key);
        let entry = Memoized { obj: slot.obj.clone(), source: slot.origin, nodes: slot.obj.node_count() };
        self.memo.insert(key, entry);
        Ok(())
    }

    fn memo_get(&mut self, key: u32) -> Result<(), Error> {
        let entry = self.memo.get(&key).ok_or(Error::MissingMemo(key))?;
        self.expanded += entry.nodes;
        if self.expanded > EXPANSION_LIMIT {
            return Err(Error::ExpansionLimit(EXPANSION_LIMIT));
        }
        let (obj, source) = (entry.obj.clone(), entry.source);
        self.memo_reads.push(MemoRead { index: self.index, source });
        self.stack.push(Slot { obj, memo_keys: vec![key], origin: self.index, parts: vec![] });
        Ok(())
    }

    fn resolve_global(&self, module: &str, name: &str) -> Result<Object, Error> {
        let module = map_legacy_module(module);
        if !self.policy.permits(module, name) {
            return Err(Error::DisallowedGlobal { module: module.to_string(), name: name.to_string() });
        }
        Ok(Object::global(module, name))
    }

    fn global_lines(&self, instruction: &Instruction) -> Result<Object, Error> {
        let lines = instruction.lines();
        let [module, name] = lines.as_slice() else {
            return Err(instruction.malformed("expected module and name lines"));
        };
        let module = std::str::from_utf8(module).map_err(|_| instruction.malformed("module is not utf-8"))?;
        let name = std::str::from_utf8(name).map_err(|_| instruction.malformed("name is not utf-8"))?;
        self.resolve_global(module, name)
    }

    fn fixed<const N: usize>(instruction: &Instruction) -> Result<[u8; N], Error> {
        instruction.arg().try_into().map_err(|_| instruction.malformed("wrong argument width"))
    }

    fn step(&mut self, index: usize, instruction: &Instruction) -> Result<Option<Object>, Error> {
        self.index = index;
        let unsupported = || Error::UnsupportedOpCode { op: instruction.op, pos: instruction.pos };
        match instruction.op {
            OpCode::Proto => self.protocol = Self::fixed::<1>(instruction)?[0],
            OpCode::Frame => {}
            OpCode::Stop => {
                let root = self.pop(instruction)?;
                return Ok(Some(root));
            }
            OpCode::Mark => self.marks.push(self.stack.len()),
            OpCode::Pop => {
                if self.marks.last() == Some(&self.stack.len()) {
                    self.marks.pop();
                } else {
                    self.pop(instruction)?;
                }
            }
            OpCode::PopMark => {
                self.pop_mark(instruction)?;
            }
            OpCode::Dup => {
                let slot = self.top(instruction)?;
                let dup = Slot { obj: slot.obj.clone(), memo_keys: slot.memo_keys.clone(), origin: slot.origin, parts: slot.parts.clone() };
                self.stack.push(dup);
            }

            OpCode::None => self.push(Object::None),
            OpCode::NewTrue => self.push(Object::Bool(true)),
            OpCode::NewFalse => self.push(Object::Bool(false)),
            OpCode::Int | OpCode::Long => {
                let value = parse_text_int(instruction)?;
                self.push(value)
            }
            OpCode::BinInt => self.push(Object::Int(i32::from_le_bytes(Self::fixed::<4>(instruction)?) as i64)),
            OpCode::BinInt1 => self.push(Object::Int(Self::fixed::<1>(instruction)?[0] as i64)),
            OpCode::BinInt2 => self.push(Object::Int(u16::from_le_bytes(Self::fixed::<2>(instruction)?) as i64)),
            OpCode::Long1 | OpCode::Long4 => self.push(le_int(instruction.arg())),
            OpCode::Float => {
                let line = text(instruction)?;
                let value = line.parse::<f64>().map_err(|_| instruction.malformed(format!("bad float {line:?}")))?;
                self.push(Object::Float(value))
            }
            OpCode::BinFloat => self.push(Object::Float(f64::from_be_bytes(Self::fixed::<8>(instruction)?))),

            OpCode::String => {
                let value = unescape_string(instruction)?;
                self.push(value)
            }
            OpCode::BinString | OpCode::ShortBinString => self.push(bytes_or_text(instruction.arg().to_vec())),
            OpCode::Unicode => {
                let value = raw_unicode_escape(instruction)?;
                self.push(value)
            }
            OpCode::BinUnicode | OpCode::ShortBinUnicode | OpCode::BinUnicode8 => {
                let s = std::str::from_utf8(instruction.arg()).map_err(|_| instruction.malformed("invalid utf-8"))?;
                self.push(Object::Unicode(s.to_string()))
            }
            OpCode::BinBytes | OpCode::ShortBinBytes | OpCode::BinBytes8 => self.push(Object::Bytes(instruction.arg().to_vec())),
            OpCode::ByteArray8 => self.push(Object::ByteArray(instruction.arg().to_vec())),
            OpCode::NextBuffer | OpCode::ReadOnlyBuffer => return Err(unsupported()),

            OpCode::EmptyTuple => self.push(Object::Tuple(vec![])),
            OpCode::Tuple => {
                let slots = self.pop_mark_slots(instruction)?;
                self.push_tuple(slots)
            }
            OpCode::Tuple1 | OpCode::Tuple2 | OpCode::Tuple3 => {
                let n = (instruction.op.byte() - OpCode::Tuple1.byte() + 1) as usize;
                let mut slots = Vec::with_capacity(n);
                for _ in 0..n {
                    slots.push(self.pop_slot(instruction)?);
                }
                slots.reverse();
                self.push_tuple(slots)
            }
            OpCode::EmptyList => self.push(Object::List(vec![])),
            OpCode::List => {
                let items = self.pop_mark(instruction)?;
                self.push(Object::List(items))
            }
            OpCode::Append | OpCode::Appends => {
                let items = if instruction.op == OpCode::Append {
                    vec![self.pop(instruction)?]
                } else {
                    self.pop_mark(instruction)?
                };
                self.modify_top(instruction, |target| Ok(match target {
                    Object::List(mut list) => {
                        list.extend(items);
                        Object::List(list)
                    }
                    Object::Sequence { base, items: mut existing } => {
                        existing.extend(items);
                        Object::Sequence { base, items: existing }
                    }
                    other => Object::Sequence { base: Box::new(other), items },
                }))?
            }
            OpCode::EmptyDict => self.push(Object::Dict(vec![])),
            OpCode::Dict => {
                let items = self.pop_mark(instruction)?;
                let entries = pairs(instruction, items)?;
                self.push(Object::Dict(entries))
            }
            OpCode::SetItem | OpCode::SetItems => {
                let entries = if instruction.op == OpCode::SetItem {
                    let value = self.pop(instruction)?;
                    let key = self.pop(instruction)?;
                    vec![(key, value)]
                } else {
                    let items = self.pop_mark(instruction)?;
                    pairs(instruction, items)?
                };
                self.modify_top(instruction, |target| Ok(match target {
                    Object::Dict(mut dict) => {
                        dict.extend(entries);
                        Object::Dict(dict)
                    }
                    Object::Mapping { base, entries: mut existing } => {
                        existing.extend(entries);
                        Object::Mapping { base, entries: existing }
                    }
                    other => Object::Mapping { base: Box::new(other), entries },
                }))?
            }
            OpCode::EmptySet => self.push(Object::Set(vec![])),
            OpCode::AddItems => {
                let items = self.pop_mark(instruction)?;
                self.modify_top(instruction, |target| match target {
                    Object::Set(mut set) => {
                        set.extend(items);
                        Ok(Object::Set(set))
                    }
                    _ => Err(Error::InvalidStack { op: instruction.op, pos: instruction.pos, reason: "ADDITEMS target is not a set".to_string() }),
                })?
            }
            OpCode::FrozenSet => {
                let items = self.pop_mark(instruction)?;
                self.push(Object::FrozenSet(items))
            }

            OpCode::Global => {
                let global = self.global_lines(instruction)?;
                self.push(global)
            }
            OpCode::StackGlobal => {
                let name = self.pop(instruction)?;
                let module = self.pop(instruction)?;
                let (Some(module), Some(name)) = (module.as_str(), name.as_str()) else {
                    return Err(Error::InvalidStack { op: instruction.op, pos: instruction.pos, reason: "STACK_GLOBAL needs two strings".to_string() });
                };
                let global = self.resolve_global(module, name)?;
                self.push(global)
            }
            OpCode::Inst => {
                let class = self.global_lines(instruction)?;
                let args = self.pop_mark(instruction)?;
                self.push(Object::reduce(class, Object::Tuple(args)))
            }
            OpCode::Obj => {
                let mut items = self.pop_mark(instruction)?.into_iter();
                let class = items.next().ok_or(Error::StackUnderflow { op: instruction.op, pos: instruction.pos })?;
                self.push(Object::reduce(class, Object::Tuple(items.collect())))
            }
            OpCode::Reduce => {
                let args = self.pop(instruction)?;
                let callable = self.pop(instruction)?;
                self.push(Object::reduce(callable, args))
            }
            OpCode::NewObj => {
                let args = self.pop(instruction)?;
                let class = self.pop(instruction)?;
                self.push(Object::NewObj { class: Box::new(class), args: Box::new(args), kwargs: None })
            }
            OpCode::NewObjEx => {
                let kwargs = self.pop(instruction)?;
                let args = self.pop(instruction)?;
                let class = self.pop(instruction)?;
                self.push(Object::NewObj { class: Box::new(class), args: Box::new(args), kwargs: Some(Box::new(kwargs)) })
            }
            OpCode::Build => {
                let state = self.pop(instruction)?;
                self.modify_top(instruction, |target| Ok(Object::build(target, state)))?
            }
            OpCode::Ext1 | OpCode::Ext2 | OpCode::Ext4 => return Err(unsupported()),

            OpCode::PersId => {
                let pid = Object::Unicode(text(instruction)?.to_string());
                self.persistent.push(PersistentRef { index, pid: pid.clone(), origin: index, parts: vec![] });
                self.push(Object::PersistentLoad(Box::new(pid)))
            }
            OpCode::BinPersId => {
                let Slot { obj: pid, origin, parts, .. } = self.pop_slot(instruction)?;
                self.persistent.push(PersistentRef { index, pid: pid.clone(), origin, parts });
                self.push(Object::PersistentLoad(Box::new(pid)))
            }

            OpCode::Get => {
                let key = text(instruction)?.parse::<u32>().map_err(|_| instruction.malformed("bad memo key"))?;
                self.memo_get(key)?
            }
            OpCode::BinGet => self.memo_get(Self::fixed::<1>(instruction)?[0] as u32)?,
            OpCode::LongBinGet => self.memo_get(u32::from_le_bytes(Self::fixed::<4>(instruction)?))?,
            OpCode::Put => {
                let key = text(instruction)?.parse::<u32>().map_err(|_| instruction.malformed("bad memo key"))?;
                self.memo_put(instruction, key)?
            }
            OpCode::BinPut => self.memo_put(instruction, Self::fixed::<1>(instruction)?[0] as u32)?,
            OpCode::LongBinPut => self.memo_put(instruction, u32::from_le_bytes(Self::fixed::<4>(instruction)?))?,
            OpCode::Memoize => {
                let key = self.memo.len() as u32;
                self.memo_put(instruction, key)?
            }
        }
        Ok(None)
    }
}

fn pairs(instruction: &Instruction, items: Vec<Object>) -> Result<Vec<(Object, Object)>, Error> {
    if items.len() % 2 != 0 {
        return Err(Error::InvalidStack { op: instruction.op, pos: instruction.pos, reason: "odd number of dict items".to_string() });
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        out.push((k, v));
    }
    Ok(out)
}
