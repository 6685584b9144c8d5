use std::collections::HashMap;
use std::mem;

use super::heap::GcRef;
use super::{Chunk, Value};

/// A native function: receives the argument slice, returns the result.
pub type NativeFn = fn(args: &[Value]) -> Value;

/// A heap object. One tagged union instead of a class hierarchy; the
/// collector blackens an object by matching on the tag.
#[derive(Debug)]
pub enum Obj {
    Str(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
}

/// An interned string. Content never changes after creation, so identity
/// equality of references doubles as content equality.
#[derive(Debug)]
pub struct ObjString {
    pub text: String,
}

/// A compiled function: its bytecode plus the counts the VM validates
/// against at call and closure-creation time.
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: usize,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script.
    pub name: Option<GcRef>,
}

impl ObjFunction {
    pub fn new(name: Option<GcRef>) -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

/// A function plus the upvalue cells it captured. The upvalue vector is
/// filled once, while the `Closure` instruction executes.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: GcRef,
    pub upvalues: Vec<GcRef>,
}

impl ObjClosure {
    pub fn new(function: GcRef) -> Self {
        Self {
            function,
            upvalues: Vec::new(),
        }
    }
}

/// Where an upvalue's variable currently lives.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueSlot {
    /// Still on the VM stack, at this absolute slot index.
    Open(usize),
    /// Hoisted into the cell itself when the slot left the stack.
    Closed(Value),
}

/// A cell giving closures access to a variable from an enclosing scope.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub slot: UpvalueSlot,
    /// Next node in the VM's open-upvalue list (descending stack slots).
    pub next: Option<GcRef>,
}

#[derive(Debug)]
pub struct ObjNative {
    pub name: GcRef,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: GcRef,
    /// Method name (interned string) to closure.
    pub methods: HashMap<GcRef, GcRef>,
}

impl ObjClass {
    pub fn new(name: GcRef) -> Self {
        Self {
            name,
            methods: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: GcRef,
    /// Field name (interned string) to value.
    pub fields: HashMap<GcRef, Value>,
}

impl ObjInstance {
    pub fn new(class: GcRef) -> Self {
        Self {
            class,
            fields: HashMap::new(),
        }
    }
}

/// A method closure paired with the receiver it was read from.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: GcRef,
}

impl Obj {
    /// Collect every reference this object holds, for the mark phase.
    pub fn references(&self) -> Vec<GcRef> {
        match self {
            Obj::Str(_) => Vec::new(),
            Obj::Function(function) => {
                let mut refs: Vec<GcRef> = function
                    .chunk
                    .constants
                    .iter()
                    .filter_map(Value::as_obj)
                    .collect();
                if let Some(name) = function.name {
                    refs.push(name);
                }
                refs
            }
            Obj::Closure(closure) => {
                let mut refs = vec![closure.function];
                refs.extend(&closure.upvalues);
                refs
            }
            Obj::Upvalue(upvalue) => match upvalue.slot {
                UpvalueSlot::Closed(value) => value.as_obj().into_iter().collect(),
                UpvalueSlot::Open(_) => Vec::new(),
            },
            Obj::Native(native) => vec![native.name],
            Obj::Class(class) => {
                let mut refs = vec![class.name];
                for (&name, &method) in &class.methods {
                    refs.push(name);
                    refs.push(method);
                }
                refs
            }
            Obj::Instance(instance) => {
                let mut refs = vec![instance.class];
                for (&name, value) in &instance.fields {
                    refs.push(name);
                    refs.extend(value.as_obj());
                }
                refs
            }
            Obj::BoundMethod(bound) => {
                let mut refs = vec![bound.method];
                refs.extend(bound.receiver.as_obj());
                refs
            }
        }
    }

    /// Approximate retained size in bytes, for the collector's allocation
    /// accounting. Counts the tagged cell plus owned payloads.
    pub fn size_bytes(&self) -> usize {
        let payload = match self {
            Obj::Str(s) => s.text.len(),
            Obj::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * mem::size_of::<usize>()
                    + f.chunk.constants.len() * mem::size_of::<Value>()
            }
            Obj::Closure(c) => c.upvalues.len() * mem::size_of::<GcRef>(),
            Obj::Upvalue(_) => 0,
            Obj::Native(_) => 0,
            Obj::Class(c) => c.methods.len() * mem::size_of::<(GcRef, GcRef)>(),
            Obj::Instance(i) => i.fields.len() * mem::size_of::<(GcRef, Value)>(),
            Obj::BoundMethod(_) => 0,
        };
        mem::size_of::<Obj>() + payload
    }
}
