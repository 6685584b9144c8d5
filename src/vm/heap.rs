use std::collections::HashMap;

use super::object::{
    Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjString,
    ObjUpvalue,
};
use super::Value;

/// Collection starts once this many bytes are live, and the threshold never
/// drops below it.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// After a cycle the next threshold is `live_bytes * GROW_FACTOR`.
const GROW_FACTOR: usize = 2;

// =============================================================================
// GcRef - Reference to a heap object
// =============================================================================

/// A reference to a heap object: an index into the heap's cell slab.
///
/// References compare and hash by identity, which is also how Lox object
/// equality is defined. Because strings are interned, identity equality of
/// string references is equivalent to content equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    index: usize,
}

impl GcRef {
    #[cfg(test)]
    pub(crate) fn test_ref(index: usize) -> GcRef {
        GcRef { index }
    }
}

/// A slab cell: the mark bit and size live in the cell header, outside the
/// object payload.
#[derive(Debug)]
struct Cell {
    marked: bool,
    size: usize,
    obj: Obj,
}

// =============================================================================
// Heap - Slab arena with a mark-sweep collector
// =============================================================================

/// The garbage-collected heap.
///
/// Objects live in a slab of cells addressed by [`GcRef`]. Freed cells go on
/// a free list that the sweep phase rebuilds. The heap also owns the string
/// intern table, so the compiler and the VM deduplicate strings through the
/// same table.
///
/// The heap never starts a cycle on its own: callers check [`Heap::should_collect`]
/// before allocating, mark their roots, then run [`Heap::trace_references`]
/// and [`Heap::sweep`]. Whoever allocates knows its roots.
#[derive(Debug)]
pub struct Heap {
    cells: Vec<Option<Cell>>,
    free: Vec<usize>,
    /// String content to interned string object.
    strings: HashMap<String, GcRef>,
    /// Bytes currently held by live (or not-yet-collected) objects.
    bytes_allocated: usize,
    /// Collection threshold in bytes.
    next_gc: usize,
    /// Mark-phase worklist: marked but not yet traced.
    gray: Vec<GcRef>,
    /// Collect on every allocation.
    stress: bool,
    /// Log collection cycles to stderr.
    log: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(false, false)
    }

    /// Create a heap with collector debugging switches.
    ///
    /// # Arguments
    /// * `stress` - collect on every allocation instead of on threshold
    /// * `log` - log each cycle to stderr
    pub fn with_config(stress: bool, log: bool) -> Self {
        Self {
            cells: Vec::new(),
            free: Vec::new(),
            strings: HashMap::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            stress,
            log,
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a new object. Never collects; callers that might be over the
    /// threshold run a cycle first, while the object's parts are still
    /// reachable from their roots.
    pub fn alloc(&mut self, obj: Obj) -> GcRef {
        let size = obj.size_bytes();
        self.bytes_allocated += size;

        let cell = Cell {
            marked: false,
            size,
            obj,
        };

        match self.free.pop() {
            Some(index) => {
                debug_assert!(self.cells[index].is_none());
                self.cells[index] = Some(cell);
                GcRef { index }
            }
            None => {
                self.cells.push(Some(cell));
                GcRef {
                    index: self.cells.len() - 1,
                }
            }
        }
    }

    /// Look up an interned string without allocating.
    pub fn find_interned(&self, text: &str) -> Option<GcRef> {
        self.strings.get(text).copied()
    }

    /// Intern a string: returns the existing object for this content, or
    /// allocates one and records it in the table.
    pub fn intern(&mut self, text: &str) -> GcRef {
        if let Some(r) = self.strings.get(text) {
            return *r;
        }
        let r = self.alloc(Obj::Str(ObjString {
            text: text.to_string(),
        }));
        self.strings.insert(text.to_string(), r);
        r
    }

    /// Whether the caller should run a collection cycle before allocating.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn get(&self, r: GcRef) -> &Obj {
        &self.cells[r.index].as_ref().expect("freed object").obj
    }

    pub fn get_mut(&mut self, r: GcRef) -> &mut Obj {
        &mut self.cells[r.index].as_mut().expect("freed object").obj
    }

    pub fn as_str(&self, r: GcRef) -> &str {
        match self.get(r) {
            Obj::Str(s) => &s.text,
            _ => unreachable!("expected string object"),
        }
    }

    pub fn function(&self, r: GcRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn function_mut(&mut self, r: GcRef) -> &mut ObjFunction {
        match self.get_mut(r) {
            Obj::Function(f) => f,
            _ => unreachable!("expected function object"),
        }
    }

    pub fn closure(&self, r: GcRef) -> &ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: GcRef) -> &mut ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => unreachable!("expected closure object"),
        }
    }

    pub fn upvalue(&self, r: GcRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: GcRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => unreachable!("expected upvalue object"),
        }
    }

    pub fn class(&self, r: GcRef) -> &ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: GcRef) -> &mut ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => unreachable!("expected class object"),
        }
    }

    pub fn instance(&self, r: GcRef) -> &ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: GcRef) -> &mut ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => unreachable!("expected instance object"),
        }
    }

    pub fn bound_method(&self, r: GcRef) -> &ObjBoundMethod {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            _ => unreachable!("expected bound method object"),
        }
    }

    pub fn native(&self, r: GcRef) -> &ObjNative {
        match self.get(r) {
            Obj::Native(n) => n,
            _ => unreachable!("expected native object"),
        }
    }

    /// Render a value the way `print` shows it. Numbers use the host's
    /// default double formatting.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: GcRef) -> String {
        match self.get(r) {
            Obj::Str(s) => s.text.clone(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.as_str(name)),
                None => "<script>".to_string(),
            },
            Obj::Closure(c) => self.format_object(c.function),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Class(c) => self.as_str(c.name).to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.as_str(self.class(i.class).name))
            }
            Obj::BoundMethod(b) => self.format_object(b.method),
        }
    }

    /// Get the number of bytes currently allocated.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Count live objects.
    pub fn object_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_some()).count()
    }

    /// Check that every intern-table entry points at a live string object
    /// whose content matches its key.
    pub fn verify_intern_table(&self) -> bool {
        self.strings.iter().all(|(text, r)| {
            matches!(
                self.cells.get(r.index).and_then(|c| c.as_ref()),
                Some(cell) if matches!(&cell.obj, Obj::Str(s) if s.text == *text)
            )
        })
    }

    // =========================================================================
    // Mark phase
    // =========================================================================

    /// Mark a root value.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark a root object and queue it for tracing. Idempotent.
    pub fn mark_object(&mut self, r: GcRef) {
        let cell = self.cells[r.index].as_mut().expect("marked freed object");
        if cell.marked {
            return;
        }
        cell.marked = true;
        self.gray.push(r);
    }

    /// Drain the gray worklist, blackening each object by marking its
    /// outgoing references.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            let children = self
                .cells[r.index]
                .as_ref()
                .expect("traced freed object")
                .obj
                .references();
            for child in children {
                self.mark_object(child);
            }
        }
    }

    // =========================================================================
    // Sweep phase
    // =========================================================================

    /// Free every unmarked cell and clear the marks on the rest. Interned
    /// strings about to be freed are dropped from the table first so it
    /// never points at a dead cell. Returns the number of freed objects.
    pub fn sweep(&mut self) -> usize {
        debug_assert!(self.gray.is_empty());

        let before = self.bytes_allocated;
        self.strings
            .retain(|_, r| self.cells[r.index].as_ref().is_some_and(|c| c.marked));

        let mut live_bytes = 0;
        let mut freed = 0;
        for (index, slot) in self.cells.iter_mut().enumerate() {
            match slot {
                Some(cell) if cell.marked => {
                    cell.marked = false;
                    // Tables and upvalue vectors grow after allocation, so
                    // re-measure while we are here anyway.
                    cell.size = cell.obj.size_bytes();
                    live_bytes += cell.size;
                }
                Some(_) => {
                    *slot = None;
                    self.free.push(index);
                    freed += 1;
                }
                None => {}
            }
        }

        self.bytes_allocated = live_bytes;
        self.next_gc = (live_bytes * GROW_FACTOR).max(FIRST_GC_THRESHOLD);

        if self.log {
            eprintln!(
                "[GC] freed {} objects, {} -> {} bytes, next cycle at {}",
                freed, before, self.bytes_allocated, self.next_gc
            );
        }

        freed
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
