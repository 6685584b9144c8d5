use std::collections::HashMap;
use std::io::{self, Write};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::compiler;
use crate::config::RuntimeConfig;
use crate::error::{InterpretError, RuntimeError};

use super::debug;
use super::heap::{GcRef, Heap};
use super::object::{
    NativeFn, Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjNative, ObjUpvalue,
    UpvalueSlot,
};
use super::ops::Op;
use super::value::Value;

/// Maximum call depth; the next nested call reports "Stack overflow".
const FRAMES_MAX: usize = 64;
/// Value-stack capacity: one full window of 256 slots per frame.
const STACK_MAX: usize = FRAMES_MAX * 256;

/// A call record: the closure being run, its function (cached to save a
/// lookup per fetch), the instruction pointer, and the stack slot of the
/// callee. Locals index relative to `base`; slot 0 holds the callee itself,
/// or the receiver inside methods.
#[derive(Debug)]
struct CallFrame {
    closure: GcRef,
    function: GcRef,
    ip: usize,
    base: usize,
}

/// Collector statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles: usize,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
}

enum ControlFlow {
    Continue,
    Halt,
}

/// What a callee turned out to be, extracted up front so the heap borrow is
/// released before the call mutates the stack.
enum Callee {
    Closure,
    Class,
    Bound(GcRef, Value),
    Native(NativeFn),
}

/// The Lox virtual machine.
///
/// A `Vm` is reusable: every [`Vm::interpret`] call compiles and runs one
/// piece of source against the same globals and heap, which is what the
/// REPL leans on.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Global variables, keyed by interned name identity.
    globals: HashMap<GcRef, Value>,
    /// Head of the open-upvalue list, sorted by descending stack slot.
    open_upvalues: Option<GcRef>,
    /// The interned name looked up when a class is called.
    init_string: GcRef,
    config: RuntimeConfig,
    gc_stats: GcStats,
    /// Where `print` writes. Swappable so embedders and tests can capture it.
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_output(config, Box::new(io::stdout()))
    }

    /// Create a VM with a custom output stream for `print`.
    pub fn with_output(config: RuntimeConfig, output: Box<dyn Write>) -> Self {
        let mut heap = Heap::with_config(config.gc_stress, config.log_gc);
        let init_string = heap.intern("init");

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            open_upvalues: None,
            init_string,
            config,
            gc_stats: GcStats::default(),
            output,
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// Compile and run one piece of source text.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        // A collection during compilation sees the compiler's own roots;
        // the VM's persistent state has to ride along explicitly.
        let mut roots: Vec<Value> = Vec::with_capacity(self.globals.len() * 2 + 1);
        for (&name, &value) in &self.globals {
            roots.push(Value::Obj(name));
            roots.push(value);
        }
        roots.push(Value::Obj(self.init_string));

        let function =
            compiler::compile_with_roots(source, &mut self.heap, &self.config, &roots)?;

        // The function must survive the closure allocation right below.
        self.push(Value::Obj(function));
        let closure = self.alloc(Obj::Closure(ObjClosure::new(function)));
        self.pop();
        self.push(Value::Obj(closure));
        if let Err(message) = self.call_closure(closure, 0) {
            return Err(InterpretError::Runtime(self.runtime_error(message)));
        }

        self.run().map_err(InterpretError::Runtime)
    }

    /// Get immutable access to the heap.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Get collector statistics.
    pub fn gc_stats(&self) -> &GcStats {
        &self.gc_stats
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.config.trace {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let op = Op::decode(byte).expect("invalid opcode");
            match self.execute(op) {
                Ok(ControlFlow::Continue) => {}
                Ok(ControlFlow::Halt) => return Ok(()),
                Err(message) => return Err(self.runtime_error(message)),
            }
        }
    }

    fn execute(&mut self, op: Op) -> Result<ControlFlow, String> {
        match op {
            Op::Constant => {
                let value = self.read_constant();
                self.push(value);
            }
            Op::Nil => self.push(Value::Nil),
            Op::True => self.push(Value::Bool(true)),
            Op::False => self.push(Value::Bool(false)),
            Op::Pop => {
                self.pop();
            }
            Op::GetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().base;
                let value = self.stack[base + slot];
                self.push(value);
            }
            Op::SetLocal => {
                let slot = self.read_byte() as usize;
                let base = self.frame().base;
                let value = self.peek(0);
                self.stack[base + slot] = value;
            }
            Op::GetGlobal => {
                let name = self.read_string();
                match self.globals.get(&name).copied() {
                    Some(value) => self.push(value),
                    None => {
                        return Err(format!(
                            "Undefined variable '{}'",
                            self.heap.as_str(name)
                        ));
                    }
                }
            }
            Op::DefineGlobal => {
                let name = self.read_string();
                let value = self.peek(0);
                self.globals.insert(name, value);
                self.pop();
            }
            Op::SetGlobal => {
                let name = self.read_string();
                if !self.globals.contains_key(&name) {
                    return Err(format!(
                        "Undefined variable '{}'",
                        self.heap.as_str(name)
                    ));
                }
                // Assignment is an expression; the value stays on the stack.
                let value = self.peek(0);
                self.globals.insert(name, value);
            }
            Op::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = match self.heap.upvalue(upvalue).slot {
                    UpvalueSlot::Open(stack_slot) => self.stack[stack_slot],
                    UpvalueSlot::Closed(value) => value,
                };
                self.push(value);
            }
            Op::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                let value = self.peek(0);
                match self.heap.upvalue(upvalue).slot {
                    UpvalueSlot::Open(stack_slot) => self.stack[stack_slot] = value,
                    UpvalueSlot::Closed(_) => {
                        self.heap.upvalue_mut(upvalue).slot = UpvalueSlot::Closed(value);
                    }
                }
            }
            Op::GetProperty => {
                let name = self.read_string();
                let receiver = self.peek(0);
                let Some(instance) = self.as_instance(receiver) else {
                    return Err("Only instances have properties".to_string());
                };

                let field = self.heap.instance(instance).fields.get(&name).copied();
                if let Some(value) = field {
                    self.pop();
                    self.push(value);
                } else {
                    let class = self.heap.instance(instance).class;
                    self.bind_method(class, name)?;
                }
            }
            Op::SetProperty => {
                let name = self.read_string();
                let receiver = self.peek(1);
                let Some(instance) = self.as_instance(receiver) else {
                    return Err("Only instances have fields".to_string());
                };

                let value = self.peek(0);
                self.heap.instance_mut(instance).fields.insert(name, value);

                // Leave the assigned value, not the instance.
                let value = self.pop();
                self.pop();
                self.push(value);
            }
            Op::GetSuper => {
                let name = self.read_string();
                let superclass = self.pop().as_obj().expect("superclass slot");
                self.bind_method(superclass, name)?;
            }
            Op::Equal => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a == b));
            }
            Op::Add => {
                // Operands stay on the stack until the result exists, so a
                // collection triggered by the new string cannot free them.
                let b = self.peek(0);
                let a = self.peek(1);
                match (a, b) {
                    (Value::Number(a), Value::Number(b)) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    }
                    (Value::Obj(a), Value::Obj(b))
                        if self.is_string(a) && self.is_string(b) =>
                    {
                        let text =
                            format!("{}{}", self.heap.as_str(a), self.heap.as_str(b));
                        let result = self.intern(&text);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(result));
                    }
                    _ => return Err("Operands must be two numbers or two strings".to_string()),
                }
            }
            Op::Greater | Op::Less | Op::Subtract | Op::Multiply | Op::Divide => {
                self.numeric_binary(op)?;
            }
            Op::Not => {
                let value = self.pop();
                self.push(Value::Bool(value.is_falsey()));
            }
            Op::Negate => {
                let Some(n) = self.peek(0).as_number() else {
                    return Err("Operand must be a number".to_string());
                };
                self.pop();
                self.push(Value::Number(-n));
            }
            Op::Print => {
                let value = self.pop();
                let text = self.heap.format_value(value);
                writeln!(self.output, "{}", text).map_err(|e| format!("io error: {}", e))?;
            }
            Op::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip += offset;
            }
            Op::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if self.peek(0).is_falsey() {
                    self.frame_mut().ip += offset;
                }
            }
            Op::Loop => {
                let offset = self.read_u16() as usize;
                self.frame_mut().ip -= offset;
            }
            Op::Call => {
                let arg_count = self.read_byte() as usize;
                let callee = self.peek(arg_count);
                self.call_value(callee, arg_count)?;
            }
            Op::Invoke => {
                let name = self.read_string();
                let arg_count = self.read_byte() as usize;
                self.invoke(name, arg_count)?;
            }
            Op::SuperInvoke => {
                let name = self.read_string();
                let arg_count = self.read_byte() as usize;
                let superclass = self.pop().as_obj().expect("superclass slot");
                self.invoke_from_class(superclass, name, arg_count)?;
            }
            Op::Closure => {
                let function = self.read_constant().as_obj().expect("function constant");

                // Root the function, then the closure, across the upvalue
                // allocations below.
                self.push(Value::Obj(function));
                let closure = self.alloc(Obj::Closure(ObjClosure::new(function)));
                self.pop();
                self.push(Value::Obj(closure));

                let upvalue_count = self.heap.function(function).upvalue_count;
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() != 0;
                    let index = self.read_byte() as usize;
                    let upvalue = if is_local {
                        let base = self.frame().base;
                        self.capture_upvalue(base + index)
                    } else {
                        self.heap.closure(self.frame().closure).upvalues[index]
                    };
                    self.heap.closure_mut(closure).upvalues.push(upvalue);
                }
            }
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop();
            }
            Op::Return => {
                let result = self.pop();
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.base);

                if self.frames.is_empty() {
                    // Pop the script closure; the stack is now empty again.
                    self.pop();
                    return Ok(ControlFlow::Halt);
                }

                self.stack.truncate(frame.base);
                self.push(result);
            }
            Op::Class => {
                let name = self.read_string();
                let class = self.alloc(Obj::Class(ObjClass::new(name)));
                self.push(Value::Obj(class));
            }
            Op::Inherit => {
                let superclass = self.peek(1);
                let Some(superclass) = superclass
                    .as_obj()
                    .filter(|&r| matches!(self.heap.get(r), Obj::Class(_)))
                else {
                    return Err("Superclass must be a class".to_string());
                };

                // Methods are copied down once; later monkey-patching of the
                // superclass does not affect existing subclasses.
                let subclass = self.peek(0).as_obj().expect("subclass slot");
                let methods: Vec<(GcRef, GcRef)> = self
                    .heap
                    .class(superclass)
                    .methods
                    .iter()
                    .map(|(&name, &method)| (name, method))
                    .collect();
                self.heap.class_mut(subclass).methods.extend(methods);
                self.pop();
            }
            Op::Method => {
                let name = self.read_string();
                let method = self.peek(0).as_obj().expect("method slot");
                let class = self.peek(1).as_obj().expect("class slot");
                self.heap.class_mut(class).methods.insert(name, method);
                self.pop();
            }
        }

        Ok(ControlFlow::Continue)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), String> {
        let Some(r) = callee.as_obj() else {
            return Err("Can only call functions and classes".to_string());
        };

        let callee_kind = match self.heap.get(r) {
            Obj::Closure(_) => Callee::Closure,
            Obj::Class(_) => Callee::Class,
            Obj::BoundMethod(bound) => Callee::Bound(bound.method, bound.receiver),
            Obj::Native(native) => Callee::Native(native.function),
            _ => return Err("Can only call functions and classes".to_string()),
        };

        match callee_kind {
            Callee::Closure => self.call_closure(r, arg_count),
            Callee::Class => {
                // The class stays in the callee slot while the instance is
                // allocated, then the instance replaces it.
                let instance = self.alloc(Obj::Instance(ObjInstance::new(r)));
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = Value::Obj(instance);

                let init = self.heap.class(r).methods.get(&self.init_string).copied();
                match init {
                    Some(init) => self.call_closure(init, arg_count),
                    None if arg_count != 0 => {
                        Err(format!("Expected 0 arguments but got {}", arg_count))
                    }
                    None => Ok(()),
                }
            }
            Callee::Bound(method, receiver) => {
                let slot = self.stack.len() - arg_count - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Callee::Native(function) => {
                let first = self.stack.len() - arg_count;
                let result = function(&self.stack[first..]);
                self.stack.truncate(first - 1);
                self.push(result);
                Ok(())
            }
        }
    }

    fn call_closure(&mut self, closure: GcRef, arg_count: usize) -> Result<(), String> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            return Err(format!(
                "Expected {} arguments but got {}",
                arity, arg_count
            ));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err("Stack overflow".to_string());
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn invoke(&mut self, name: GcRef, arg_count: usize) -> Result<(), String> {
        let receiver = self.peek(arg_count);
        let Some(instance) = self.as_instance(receiver) else {
            return Err("Only instances have methods".to_string());
        };

        // A field shadowing the method name wins, exactly as it does for a
        // plain property access followed by a call.
        let field = self.heap.instance(instance).fields.get(&name).copied();
        if let Some(field) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef,
        name: GcRef,
        arg_count: usize,
    ) -> Result<(), String> {
        let Some(&method) = self.heap.class(class).methods.get(&name) else {
            return Err(format!("Undefined property '{}'", self.heap.as_str(name)));
        };
        self.call_closure(method, arg_count)
    }

    fn bind_method(&mut self, class: GcRef, name: GcRef) -> Result<(), String> {
        let Some(&method) = self.heap.class(class).methods.get(&name) else {
            return Err(format!("Undefined property '{}'", self.heap.as_str(name)));
        };

        let receiver = self.peek(0);
        let bound = self.alloc(Obj::BoundMethod(ObjBoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    /// Find the open upvalue for a stack slot, or splice a new one into the
    /// list at its sorted (descending) position.
    fn capture_upvalue(&mut self, stack_slot: usize) -> GcRef {
        let mut prev = None;
        let mut current = self.open_upvalues;
        while let Some(r) = current {
            let upvalue = self.heap.upvalue(r);
            match upvalue.slot {
                UpvalueSlot::Open(slot) if slot > stack_slot => {
                    prev = Some(r);
                    current = upvalue.next;
                }
                UpvalueSlot::Open(slot) if slot == stack_slot => return r,
                UpvalueSlot::Open(_) => break,
                UpvalueSlot::Closed(_) => unreachable!("closed upvalue in open list"),
            }
        }

        let created = self.alloc(Obj::Upvalue(ObjUpvalue {
            slot: UpvalueSlot::Open(stack_slot),
            next: current,
        }));
        match prev {
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `from`: copy the stack value
    /// into the cell and unlink it from the list.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(r) = self.open_upvalues {
            let upvalue = self.heap.upvalue(r);
            let UpvalueSlot::Open(slot) = upvalue.slot else {
                unreachable!("closed upvalue in open list");
            };
            if slot < from {
                break;
            }

            let next = upvalue.next;
            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.slot = UpvalueSlot::Closed(value);
            upvalue.next = None;
            self.open_upvalues = next;
        }
    }

    // =========================================================================
    // Allocation and collection
    // =========================================================================

    /// Every VM-side allocation funnels through here, so any allocation
    /// point can trigger a cycle.
    fn alloc(&mut self, obj: Obj) -> GcRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.alloc(obj)
    }

    fn intern(&mut self, text: &str) -> GcRef {
        if let Some(r) = self.heap.find_interned(text) {
            return r;
        }
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.intern(text)
    }

    fn collect_garbage(&mut self) {
        let start = Instant::now();

        for &value in &self.stack {
            self.heap.mark_value(value);
        }
        for frame in &self.frames {
            self.heap.mark_object(frame.closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next;
        }
        for (&name, &value) in &self.globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        self.heap.mark_object(self.init_string);

        self.heap.trace_references();
        self.heap.sweep();

        let pause = start.elapsed().as_micros() as u64;
        self.gc_stats.cycles += 1;
        self.gc_stats.total_pause_us += pause;
        self.gc_stats.max_pause_us = self.gc_stats.max_pause_us.max(pause);
    }

    // =========================================================================
    // Errors and helpers
    // =========================================================================

    /// Build the runtime error report: the message plus one line per frame,
    /// innermost first, then reset the stacks.
    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            // The IP sits one past the instruction that failed.
            let line = function.chunk.lines[frame.ip.saturating_sub(1)];
            let name = match function.name {
                Some(name) => format!("{}()", self.heap.as_str(name)),
                None => "script".to_string(),
            };
            trace.push(format!("[line {}] in {}", line, name));
        }

        self.reset_stack();
        RuntimeError { message, trace }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Obj::Native(ObjNative { name, function }));
        self.globals.insert(name, Value::Obj(native));
    }

    fn numeric_binary(&mut self, op: Op) -> Result<(), String> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err("Operands must be numbers".to_string());
        };
        self.pop();
        self.pop();
        let result = match op {
            Op::Greater => Value::Bool(a > b),
            Op::Less => Value::Bool(a < b),
            Op::Subtract => Value::Number(a - b),
            Op::Multiply => Value::Number(a * b),
            // Floating-point division: dividing by zero is inf or NaN, not
            // an error.
            Op::Divide => Value::Number(a / b),
            _ => unreachable!("non-numeric opcode"),
        };
        self.push(result);
        Ok(())
    }

    fn as_instance(&self, value: Value) -> Option<GcRef> {
        value
            .as_obj()
            .filter(|&r| matches!(self.heap.get(r), Obj::Instance(_)))
    }

    fn is_string(&self, r: GcRef) -> bool {
        matches!(self.heap.get(r), Obj::Str(_))
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    #[inline]
    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let ip = frame.ip;
        frame.ip += 1;
        let function = frame.function;
        self.heap.function(function).chunk.code[ip]
    }

    #[inline]
    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte() as u16;
        let low = self.read_byte() as u16;
        (high << 8) | low
    }

    #[inline]
    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().unwrap();
        self.heap.function(frame.function).chunk.constants[index]
    }

    /// Read a constant that the compiler guarantees is an interned string.
    fn read_string(&mut self) -> GcRef {
        self.read_constant().as_obj().expect("string constant")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn trace_instruction(&self) {
        let mut stack_text = String::from("          ");
        for &value in &self.stack {
            stack_text.push_str(&format!("[ {} ]", self.heap.format_value(value)));
        }
        eprintln!("{}", stack_text);

        let frame = self.frame();
        let chunk = &self.heap.function(frame.function).chunk;
        let (text, _) = debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        eprintln!("{}", text);
    }
}

fn native_clock(_args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Value::Number(seconds)
}
