/// A node of an unpickled object graph.
///
/// Nothing is ever instantiated: class references stay symbolic and calls are
/// recorded as `Reduce`/`NewObj`/`Build` nodes, so the graph can be inspected
/// and written back without a Python runtime.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    /// Little-endian two's complement, as carried by `LONG1`/`LONG4`.
    BigInt(Vec<u8>),
    Float(f64),
    Unicode(String),
    Bytes(Vec<u8>),
    ByteArray(Vec<u8>),
    Tuple(Vec<Object>),
    List(Vec<Object>),
    Dict(Vec<(Object, Object)>),
    Set(Vec<Object>),
    FrozenSet(Vec<Object>),
    Global { module: String, name: String },
    Reduce { callable: Box<Object>, args: Box<Object> },
    NewObj { class: Box<Object>, args: Box<Object>, kwargs: Option<Box<Object>> },
    Build { target: Box<Object>, state: Box<Object> },
    PersistentLoad(Box<Object>),
    /// Items assigned with `SETITEM(S)` onto something that isn't a plain dict.
    Mapping { base: Box<Object>, entries: Vec<(Object, Object)> },
    /// Items appended with `APPEND(S)` onto something that isn't a plain list.
    Sequence { base: Box<Object>, items: Vec<Object> },
}

impl Object {
    pub fn global(module: &str, name: &str) -> Self {
        Object::Global { module: module.to_string(), name: name.to_string() }
    }

    pub fn unicode(value: &str) -> Self {
        Object::Unicode(value.to_string())
    }

    pub fn reduce(callable: Object, args: Object) -> Self {
        Object::Reduce { callable: Box::new(callable), args: Box::new(args) }
    }

    pub fn build(target: Object, state: Object) -> Self {
        Object::Build { target: Box::new(target), state: Box::new(state) }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Object::Unicode(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Object::Int(i) => Some(*i),
            Object::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Object::Bool(b) => Some(*b),
            Object::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Object]> {
        match self {
            Object::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_global(&self, module: &str, name: &str) -> bool {
        matches!(self, Object::Global { module: m, name: n } if m == module && n == name)
    }

    /// Key/value pairs of anything dict-like: plain dicts and mappings built on
    /// top of a reduced object such as `collections.OrderedDict`.
    pub fn entries(&self) -> Option<&[(Object, Object)]> {
        match self {
            Object::Dict(entries) => Some(entries),
            Object::Mapping { entries, .. } => Some(entries),
            _ => None,
        }
    }

    /// Number of nodes in this subtree, counting this one.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// Visits this node and every node beneath it, depth first.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Object)) {
        visit(self);
        match self {
            Object::Tuple(items) | Object::List(items) | Object::Set(items) | Object::FrozenSet(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Object::Dict(entries) => {
                for (k, v) in entries {
                    k.walk(visit);
                    v.walk(visit);
                }
            }
            Object::Reduce { callable, args } => {
                callable.walk(visit);
                args.walk(visit);
            }
            Object::NewObj { class, args, kwargs } => {
                class.walk(visit);
                args.walk(visit);
                if let Some(kwargs) = kwargs {
                    kwargs.walk(visit);
                }
            }
            Object::Build { target, state } => {
                target.walk(visit);
                state.walk(visit);
            }
            Object::PersistentLoad(pid) => pid.walk(visit),
            Object::Mapping { base, entries } => {
                base.walk(visit);
                for (k, v) in entries {
                    k.walk(visit);
                    v.walk(visit);
                }
            }
            Object::Sequence { base, items } => {
                base.walk(visit);
                for item in items {
                    item.walk(visit);
                }
            }
            _ => {}
        }
    }
}
