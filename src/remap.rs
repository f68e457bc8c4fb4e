use std::collections::BTreeMap;
use pickle_graph::{disassemble, encode_fragment, reassemble, Object, OpCode, Patch};
use serde::Serialize;
use tracing::debug;
use crate::checkpoint::LoadError;
use crate::device::Device;
use crate::storage::StorageRef;
use crate::trust::TrustedTypes;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceChange {
    pub key: String,
    pub from: Device,
    pub to: Device,
}

fn pushes_string_or_memo(op: OpCode) -> bool {
    matches!(op,
        OpCode::BinUnicode | OpCode::ShortBinUnicode | OpCode::BinUnicode8 | OpCode::Unicode |
        OpCode::String | OpCode::BinString | OpCode::ShortBinString |
        OpCode::Get | OpCode::BinGet | OpCode::LongBinGet)
}

fn is_memo_get(op: OpCode) -> bool {
    matches!(op, OpCode::Get | OpCode::BinGet | OpCode::LongBinGet)
}

/// Rewrites every storage location in a `data.pkl` stream to `target`.
///
/// The instruction that pushes the location string of each id tuple is
/// replaced by one pushing the target location. An id fetched whole from the
/// memo has that fetch replaced by a fresh id tuple. Other memo fetches of a
/// replaced value get the original value back, so everything outside the ids
/// loads as before. A stream with nothing to move comes back unchanged.
///
/// `changes` has one entry per storage key, however many tensors view it.
pub fn remap_storages(data: &[u8], trusted: &TrustedTypes, target: &Device) -> Result<(Vec<u8>, Vec<DeviceChange>), LoadError> {
    let instructions = disassemble(data)?;
    let unpickled = pickle_graph::load(&instructions, trusted)?;
    // instruction index -> (value it pushed, value to push instead)
    let mut rewrites: BTreeMap<usize, (Object, Object)> = BTreeMap::new();
    let mut changes: Vec<DeviceChange> = vec![];
    for persistent in &unpickled.persistent {
        let storage = StorageRef::from_pid(&persistent.pid)?;
        if storage.device == *target {
            continue;
        }
        let unsupported = || LoadError::UnsupportedPersistentId(format!("{:?}", persistent.pid));
        if instructions[persistent.index].op != OpCode::BinPersId {
            return Err(unsupported());
        }
        match (persistent.parts.as_slice(), persistent.pid.as_tuple()) {
            ([_, _, _, at, _], Some([_, _, _, location, _])) if pushes_string_or_memo(instructions[*at].op) => {
                rewrites.insert(*at, (location.clone(), Object::Unicode(target.to_string())));
            }
            ([], _) if is_memo_get(instructions[persistent.origin].op) => {
                rewrites.insert(persistent.origin, (persistent.pid.clone(), storage.to_pid(target)));
            }
            _ => return Err(unsupported()),
        }
        debug!(key = %storage.key, dtype = %storage.dtype, from = %storage.device, to = %target, "remapping storage");
        if !changes.iter().any(|c| c.key == storage.key) {
            changes.push(DeviceChange { key: storage.key, from: storage.device, to: target.clone() });
        }
    }
    if rewrites.is_empty() {
        return Ok((data.to_vec(), changes));
    }

    let mut patches: Vec<Patch> = rewrites.iter()
        .map(|(index, (_, replacement))| Patch { index: *index, bytes: encode_fragment(replacement) })
        .collect();
    for read in &unpickled.memo_reads {
        if rewrites.contains_key(&read.index) {
            continue;
        }
        if let Some((original, _)) = rewrites.get(&read.source) {
            patches.push(Patch { index: read.index, bytes: encode_fragment(original) });
        }
    }
    Ok((reassemble(&instructions, &patches), changes))
}
