//! object.rs — heap object variants.
//!
//! Grounded on `original_source/Olive-bci/object.h`'s `Obj`/`ObjString`
//! header layout and `spec.md` §3's fuller variant list (classes/instances/
//! bound methods are in the spec but not in the retrieved C snapshot of
//! object.h, which predates class support — the spec is authoritative here).
//!
//! Every variant owns only handles into the same `Heap`, never other `Obj`s
//! directly, so the GC can walk the graph uniformly without per-variant
//! pointer chasing logic beyond "list the handles I hold".

use std::rc::Rc;

use crate::bytecode::chunk::Chunk;
use crate::heap::ObjHandle;
use crate::table::Table;
use crate::value::Value;

#[derive(Debug)]
pub enum Obj {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Native(ObjNative),
}

impl Obj {
    pub fn type_name(&self) -> &'static str {
        match self {
            Obj::String(_) => "string",
            Obj::Function(_) => "function",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
            Obj::Native(_) => "native function",
        }
    }

    /// Every `ObjHandle` this object directly references. Used by the GC to
    /// blacken an object (mark its children gray) without a trait per
    /// variant — a flat match, per §9's "prefer tagged enums with
    /// variant-match".
    pub fn trace(&self) -> Vec<ObjHandle> {
        match self {
            Obj::String(_) | Obj::Native(_) => Vec::new(),
            Obj::Function(f) => {
                let mut out: Vec<ObjHandle> = f.chunk.consts().iter().filter_map(Value::as_obj).collect();
                if let Some(name) = f.name {
                    out.push(name);
                }
                out
            }
            Obj::Closure(c) => {
                let mut out = vec![c.function];
                out.extend(c.upvalues.iter().copied());
                out
            }
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Closed(v) => v.as_obj().into_iter().collect(),
                UpvalueState::Open(_) => Vec::new(),
            },
            Obj::Class(c) => {
                let mut out = vec![c.name];
                for (k, v) in c.methods.iter() {
                    out.extend(k.as_obj());
                    out.extend(v.as_obj());
                }
                if let Some(init) = c.initializer {
                    out.push(init);
                }
                out
            }
            Obj::Instance(i) => {
                let mut out = vec![i.class];
                for (k, v) in i.fields.iter() {
                    out.extend(k.as_obj());
                    out.extend(v.as_obj());
                }
                out
            }
            Obj::BoundMethod(b) => {
                let mut out = vec![b.closure];
                if let Some(h) = b.receiver.as_obj() {
                    out.push(h);
                }
                out
            }
        }
    }
}

/// An interned string. `Rc<str>` gives cheap clones for the intern table's
/// own bookkeeping without a second heap allocation per lookup.
#[derive(Debug, Clone)]
pub struct ObjString {
    pub chars: Rc<str>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: u16,
    /// `None` for the implicit top-level script function (printed as
    /// `<script>`, per `object.c`'s `printFunction`).
    pub name: Option<ObjHandle>,
    pub chunk: Chunk,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Points at a live VM stack slot, by absolute index.
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

pub struct ObjClass {
    pub name: ObjHandle,
    /// string (interned `Value::Obj`) -> closure (`Value::Obj`)
    pub methods: Table,
    pub initializer: Option<ObjHandle>,
}

impl std::fmt::Debug for ObjClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjClass").field("name", &self.name).finish()
    }
}

pub struct ObjInstance {
    pub class: ObjHandle,
    /// string (interned `Value::Obj`) -> field value
    pub fields: Table,
}

impl std::fmt::Debug for ObjInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjInstance").field("class", &self.class).finish()
    }
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub closure: ObjHandle,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct ObjNative {
    pub name: &'static str,
    pub arity: Option<u8>,
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjNative").field("name", &self.name).finish()
    }
}
