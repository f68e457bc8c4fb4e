use pickle_graph::Object;
use serde::Serialize;
use crate::device::Device;
use crate::dtype::DType;
use crate::storage::StorageRef;

/// A tensor rebuilt by one of torch's `_rebuild_*` helpers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TensorRecord {
    /// Dotted path from the root, in `state_dict` style for module pickles.
    pub path: String,
    pub storage_key: String,
    pub dtype: DType,
    pub device: Device,
    pub offset: u64,
    pub shape: Vec<u64>,
    pub stride: Vec<u64>,
    pub requires_grad: bool,
    pub parameter: bool,
}

// nn.Module bookkeeping attributes that state_dict keys leave out
const TRANSPARENT_ATTRIBUTES: &[&str] = &["_modules", "_parameters", "_buffers"];

pub fn find_tensors(root: &Object) -> Vec<TensorRecord> {
    let mut out = vec![];
    let mut path = vec![];
    visit(root, &mut path, &mut out);
    out
}

fn key_segment(key: &Object) -> Option<String> {
    match key {
        Object::Unicode(s) => Some(s.clone()),
        Object::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn visit(obj: &Object, path: &mut Vec<String>, out: &mut Vec<TensorRecord>) {
    if let Some(mut tensor) = as_tensor(obj) {
        tensor.path = path.join(".");
        out.push(tensor);
        return;
    }
    match obj {
        Object::Dict(entries) | Object::Mapping { entries, .. } => {
            for (key, value) in entries {
                match key_segment(key) {
                    Some(segment) if TRANSPARENT_ATTRIBUTES.contains(&segment.as_str()) => visit(value, path, out),
                    Some(segment) => {
                        path.push(segment);
                        visit(value, path, out);
                        path.pop();
                    }
                    None => visit(value, path, out),
                }
            }
        }
        Object::List(items) | Object::Tuple(items) | Object::Sequence { items, .. } => {
            for (i, item) in items.iter().enumerate() {
                path.push(i.to_string());
                visit(item, path, out);
                path.pop();
            }
        }
        Object::Build { target, state } => {
            visit(target, path, out);
            match state.as_ref() {
                // (state, slotstate)
                Object::Tuple(parts) => {
                    for part in parts {
                        visit(part, path, out);
                    }
                }
                state => visit(state, path, out),
            }
        }
        Object::Reduce { args, .. } | Object::NewObj { args, .. } => visit(args, path, out),
        _ => {}
    }
}

fn dims(obj: &Object) -> Option<Vec<u64>> {
    let items = match obj {
        Object::Tuple(items) | Object::List(items) => items,
        // torch.Size((...))
        Object::Reduce { args, .. } => return args.as_tuple().and_then(|a| a.first()).and_then(dims),
        _ => return None,
    };
    items.iter().map(|x| x.as_int().and_then(|v| u64::try_from(v).ok())).collect()
}

fn as_tensor(obj: &Object) -> Option<TensorRecord> {
    let Object::Reduce { callable, args } = obj else {
        return None;
    };
    let Object::Global { module, name } = callable.as_ref() else {
        return None;
    };
    let args = args.as_tuple()?;
    match (module.as_str(), name.as_str()) {
        ("torch._utils", "_rebuild_tensor" | "_rebuild_tensor_v2" | "_rebuild_tensor_v3") => {
            let [storage, offset, shape, stride, rest @ ..] = args else {
                return None;
            };
            let Object::PersistentLoad(pid) = storage else {
                return None;
            };
            let storage = StorageRef::from_pid(pid).ok()?;
            Some(TensorRecord {
                path: String::new(),
                storage_key: storage.key,
                dtype: storage.dtype,
                device: storage.device,
                offset: offset.as_int().and_then(|v| u64::try_from(v).ok())?,
                shape: dims(shape)?,
                stride: dims(stride)?,
                requires_grad: rest.first().and_then(|x| x.as_bool()).unwrap_or(false),
                parameter: false,
            })
        }
        ("torch._utils", "_rebuild_parameter" | "_rebuild_parameter_with_state") => {
            let mut tensor = as_tensor(args.first()?)?;
            tensor.parameter = true;
            tensor.requires_grad = args.get(1).and_then(|x| x.as_bool()).unwrap_or(tensor.requires_grad);
            Some(tensor)
        }
        // (func, new_type, args, state)
        ("torch._tensor", "_rebuild_from_type_v2") => {
            let inner = Object::reduce(args.first()?.clone(), args.get(2)?.clone());
            as_tensor(&inner)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuild(key: &str, shape: &[i64], requires_grad: bool) -> Object {
        let pid = Object::Tuple(vec![
            Object::unicode("storage"),
            Object::global("torch", "FloatStorage"),
            Object::unicode(key),
            Object::unicode("cuda:0"),
            Object::Int(shape.iter().product()),
        ]);
        let stride = {
            let mut stride = vec![1i64; shape.len()];
            for i in (0..shape.len().saturating_sub(1)).rev() {
                stride[i] = stride[i + 1] * shape[i + 1];
            }
            stride
        };
        Object::reduce(
            Object::global("torch._utils", "_rebuild_tensor_v2"),
            Object::Tuple(vec![
                Object::PersistentLoad(Box::new(pid)),
                Object::Int(0),
                Object::Tuple(shape.iter().map(|x| Object::Int(*x)).collect()),
                Object::Tuple(stride.into_iter().map(Object::Int).collect()),
                Object::Bool(requires_grad),
                Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![])),
            ]),
        )
    }

    fn ordered(entries: Vec<(&str, Object)>) -> Object {
        Object::Mapping {
            base: Box::new(Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![]))),
            entries: entries.into_iter().map(|(k, v)| (Object::unicode(k), v)).collect(),
        }
    }

    #[test]
    fn state_dict_paths_and_layouts() {
        let root = ordered(vec![("encoder.weight", rebuild("0", &[4, 4], false)), ("encoder.bias", rebuild("1", &[4], false))]);
        let tensors = find_tensors(&root);
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0].path, "encoder.weight");
        assert_eq!(tensors[0].shape, vec![4, 4]);
        assert_eq!(tensors[0].stride, vec![4, 1]);
        assert_eq!(tensors[1].storage_key, "1");
        assert_eq!(tensors[1].device.to_string(), "cuda:0");
    }

    #[test]
    fn module_pickles_flatten_to_state_dict_keys() {
        let parameter = Object::reduce(
            Object::global("torch._utils", "_rebuild_parameter"),
            Object::Tuple(vec![rebuild("0", &[8, 2], false), Object::Bool(true), Object::reduce(Object::global("collections", "OrderedDict"), Object::Tuple(vec![]))]),
        );
        let linear = Object::build(
            Object::NewObj {
                class: Box::new(Object::global("torch.nn.modules.linear", "Linear")),
                args: Box::new(Object::Tuple(vec![])),
                kwargs: None,
            },
            Object::Dict(vec![
                (Object::unicode("training"), Object::Bool(true)),
                (Object::unicode("_parameters"), ordered(vec![("weight", parameter)])),
            ]),
        );
        let model = Object::build(
            Object::NewObj {
                class: Box::new(Object::global("mace.modules.models", "ScaleShiftMACE")),
                args: Box::new(Object::Tuple(vec![])),
                kwargs: None,
            },
            Object::Dict(vec![(Object::unicode("_modules"), ordered(vec![("readout", linear)]))]),
        );
        let tensors = find_tensors(&model);
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors[0].path, "readout.weight");
        assert!(tensors[0].parameter);
        assert!(tensors[0].requires_grad);
    }

    #[test]
    fn lists_of_tensors_get_index_segments() {
        let root = Object::Dict(vec![(Object::unicode("buffers"), Object::List(vec![rebuild("0", &[2], false), rebuild("1", &[3], true)]))]);
        let paths: Vec<String> = find_tensors(&root).into_iter().map(|t| t.path).collect();
        assert_eq!(paths, vec!["buffers.0", "buffers.1"]);
    }
}
