#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;
use pickle_graph::{to_vec, Object};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub fn ordered_dict() -> Object {
    Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![]))
}

pub fn state_dict(entries: Vec<(&str, Object)>) -> Object {
    Object::Mapping {
        base: Box::new(ordered_dict()),
        entries: entries.into_iter().map(|(k, v)| (Object::unicode(k), v)).collect(),
    }
}

fn contiguous_stride(shape: &[i64]) -> Vec<i64> {
    let mut stride = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        stride[i] = stride[i + 1] * shape[i + 1];
    }
    stride
}

/// A float32 tensor the way `torch.save` pickles it.
pub fn tensor(key: &str, location: &str, shape: &[i64]) -> Object {
    let numel: i64 = shape.iter().product();
    let pid = Object::Tuple(vec![
        Object::unicode("storage"),
        Object::global("torch", "FloatStorage"),
        Object::unicode(key),
        Object::unicode(location),
        Object::Int(numel),
    ]);
    Object::reduce(
        Object::global("torch._utils", "_rebuild_tensor_v2"),
        Object::Tuple(vec![
            Object::PersistentLoad(Box::new(pid)),
            Object::Int(0),
            Object::Tuple(shape.iter().map(|x| Object::Int(*x)).collect()),
            Object::Tuple(contiguous_stride(shape).into_iter().map(Object::Int).collect()),
            Object::Bool(false),
            ordered_dict(),
        ]),
    )
}

pub fn parameter(tensor: Object) -> Object {
    Object::reduce(
        Object::global("torch._utils", "_rebuild_parameter"),
        Object::Tuple(vec![tensor, Object::Bool(true), ordered_dict()]),
    )
}

/// An instance of `module.name` restored from `state` via `__setstate__`/`__dict__`.
pub fn instance(module: &str, name: &str, state: Vec<(&str, Object)>) -> Object {
    Object::build(
        Object::NewObj {
            class: Box::new(Object::global(module, name)),
            args: Box::new(Object::Tuple(vec![])),
            kwargs: None,
        },
        Object::Dict(state.into_iter().map(|(k, v)| (Object::unicode(k), v)).collect()),
    )
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn write_archive(path: &Path, pickle: &[u8], storages: &[(&str, Vec<u8>)]) {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .with_alignment(64);
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    writer.start_file("archive/data.pkl", options).unwrap();
    writer.write_all(pickle).unwrap();
    writer.start_file("archive/byteorder", options).unwrap();
    writer.write_all(b"little").unwrap();
    for (key, data) in storages {
        writer.start_file(format!("archive/data/{key}"), options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.start_file("archive/version", options).unwrap();
    writer.write_all(b"3\n").unwrap();
    writer.finish().unwrap();
}

pub fn write_checkpoint(path: &Path, root: &Object, storages: &[(&str, Vec<u8>)]) {
    write_archive(path, &to_vec(root), storages);
}

/// Writes pickle bytes by hand in the shape CPython's pickler gives a
/// `torch.save` state dict: every string, global and container memoized once
/// and fetched again by memo key afterwards.
pub struct TorchPickle {
    protocol: u8,
    body: Vec<u8>,
    next_memo: u8,
}

impl TorchPickle {
    pub fn new(protocol: u8) -> Self {
        Self { protocol, body: vec![], next_memo: 0 }
    }

    pub fn op(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend(bytes);
        self
    }

    pub fn put(&mut self) -> u8 {
        let key = self.next_memo;
        self.next_memo += 1;
        if self.protocol >= 4 {
            self.body.push(0x94);
        } else {
            self.body.extend([b'q', key]);
        }
        key
    }

    pub fn get(&mut self, key: u8) -> &mut Self {
        self.op(&[b'h', key])
    }

    fn raw_text(&mut self, s: &str) {
        if self.protocol >= 4 {
            self.body.extend([0x8c, s.len() as u8]);
        } else {
            self.body.push(b'X');
            self.body.extend((s.len() as u32).to_le_bytes());
        }
        self.body.extend(s.as_bytes());
    }

    pub fn text(&mut self, s: &str) -> u8 {
        self.raw_text(s);
        self.put()
    }

    pub fn global(&mut self, module: &str, name: &str) -> u8 {
        if self.protocol >= 4 {
            self.text(module);
            self.text(name);
            self.body.push(0x93);
        } else {
            self.body.push(b'c');
            self.body.extend(format!("{module}\n{name}\n").as_bytes());
        }
        self.put()
    }

    pub fn int(&mut self, v: u8) -> &mut Self {
        self.op(&[b'K', v])
    }

    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = vec![0x80, self.protocol];
        if self.protocol >= 4 {
            out.push(0x95);
            out.extend((self.body.len() as u64).to_le_bytes());
        }
        out.extend(&self.body);
        out
    }
}

/// A dict of three float32 tensors plus a plain `"device"` entry.
///
/// * `a` owns storage `"0"` (8 elements) on `cuda:0`, shape `[4]`, offset 0.
///   The location string and the id tuple are memoized.
/// * `b` is a view of `a`'s storage at offset 2, shape `[2]`. Its id is the
///   memoized tuple fetched again.
/// * `c` owns storage `"1"` (3 elements). Its location is the memoized
///   `"cuda:0"` fetched again.
/// * `"device"` is the memoized `"cuda:0"` once more, outside any id.
pub fn torch_style_pickle(protocol: u8) -> Vec<u8> {
    let mut p = TorchPickle::new(protocol);
    p.op(b"}");
    p.put();
    p.op(b"(");

    p.text("a");
    let rebuild = p.global("torch._utils", "_rebuild_tensor_v2");
    p.op(b"((");
    let storage_tag = p.text("storage");
    let class = p.global("torch", "FloatStorage");
    p.text("0");
    let cuda = p.text("cuda:0");
    p.int(8).op(b"t");
    let shared_pid = p.put();
    p.op(b"Q").int(0).int(4).op(&[0x85]);
    p.put();
    p.int(1).op(&[0x85]);
    p.put();
    p.op(&[0x89]);
    let ordered_dict = p.global("collections", "OrderedDict");
    p.op(b")R");
    p.put();
    p.op(b"t");
    p.put();
    p.op(b"R");
    p.put();

    p.text("b");
    p.get(rebuild).op(b"(").get(shared_pid).op(b"Q").int(2).int(2).op(&[0x85]);
    p.put();
    p.int(1).op(&[0x85]);
    p.put();
    p.op(&[0x89]).get(ordered_dict).op(b")R");
    p.put();
    p.op(b"t");
    p.put();
    p.op(b"R");
    p.put();

    p.text("c");
    p.get(rebuild).op(b"((").get(storage_tag).get(class);
    p.text("1");
    p.get(cuda).int(3).op(b"t");
    p.put();
    p.op(b"Q").int(0).int(3).op(&[0x85]);
    p.put();
    p.int(1).op(&[0x85]);
    p.put();
    p.op(&[0x89]).get(ordered_dict).op(b")R");
    p.put();
    p.op(b"t");
    p.put();
    p.op(b"R");
    p.put();

    p.text("device");
    p.get(cuda).op(b"u.");
    p.finish()
}
