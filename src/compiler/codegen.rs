//! The Lox compiler: a single-pass Pratt parser that emits bytecode as it
//! parses. There is no AST; expressions leave their value-producing code
//! behind as a side effect of being recognised, so an expression always has
//! a net stack effect of +1 and a statement of exactly 0.

use crate::config::RuntimeConfig;
use crate::error::CompileErrors;
use crate::vm::{debug, Chunk, GcRef, Heap, Obj, ObjFunction, Op, Value};

use super::scanner::{Scanner, Token, TokenKind};

/// Locals per function, including the reserved slot 0.
const MAX_LOCALS: usize = 256;
/// Captured upvalues per function.
const MAX_UPVALUES: usize = 256;

/// Local depth between declaration and the end of its initializer, so that
/// `var a = a;` is caught.
const UNINITIALIZED: i32 = -1;

/// Compile source text to a top-level script function. On any diagnostic
/// the whole compilation is rejected, but parsing continues past errors
/// (panic mode + resynchronisation) so one run can report several.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    config: &RuntimeConfig,
) -> Result<GcRef, CompileErrors> {
    compile_with_roots(source, heap, config, &[])
}

/// Compile, additionally treating `roots` as live across any collection a
/// compile-time allocation triggers. The VM passes its persistent state
/// (globals, interned sentinels) here so a cycle in the middle of
/// compilation cannot sweep it.
pub fn compile_with_roots(
    source: &str,
    heap: &mut Heap,
    config: &RuntimeConfig,
    roots: &[Value],
) -> Result<GcRef, CompileErrors> {
    let mut parser = Parser::new(source, heap, config, roots);

    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }

    let function = parser.end_compiler();
    if parser.had_error {
        Err(CompileErrors {
            diagnostics: parser.diagnostics,
        })
    } else {
        Ok(function)
    }
}

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// The next-higher level, used to make binary operators left-associative.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'ctx> = fn(&mut Parser<'src, 'ctx>, bool);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

/// The Pratt rule table, keyed by token kind.
fn rule<'src, 'ctx>(kind: TokenKind) -> ParseRule<'src, 'ctx> {
    fn make<'src, 'ctx>(
        prefix: Option<ParseFn<'src, 'ctx>>,
        infix: Option<ParseFn<'src, 'ctx>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'ctx> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        TokenKind::LeftParen => make(Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        TokenKind::Dot => make(None, Some(Parser::dot), Precedence::Call),
        TokenKind::Minus => make(Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        TokenKind::Plus => make(None, Some(Parser::binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => {
            make(None, Some(Parser::binary), Precedence::Factor)
        }
        TokenKind::Bang => make(Some(Parser::unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            make(None, Some(Parser::binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => make(None, Some(Parser::binary), Precedence::Comparison),
        TokenKind::Identifier => make(Some(Parser::variable), None, Precedence::None),
        TokenKind::Str => make(Some(Parser::string), None, Precedence::None),
        TokenKind::Number => make(Some(Parser::number), None, Precedence::None),
        TokenKind::And => make(None, Some(Parser::and_), Precedence::And),
        TokenKind::Or => make(None, Some(Parser::or_), Precedence::Or),
        TokenKind::False | TokenKind::True | TokenKind::Nil => {
            make(Some(Parser::literal), None, Precedence::None)
        }
        TokenKind::Super => make(Some(Parser::super_), None, Precedence::None),
        TokenKind::This => make(Some(Parser::this_), None, Precedence::None),
        _ => make(None, None, Precedence::None),
    }
}

/// What kind of function body is being compiled. Drives the reserved
/// slot-0 name and the implicit return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Nested function bodies push a new state;
/// the enclosing states stay live underneath for upvalue resolution.
struct FunctionState<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<GcRef>) -> Self {
        // Slot 0 holds the callee; methods expose it as `this`.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => "this",
                _ => "",
            },
            depth: 0,
            is_captured: false,
        };
        Self {
            function: ObjFunction::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// The parser-and-emitter context. Everything the original keeps in
/// process-wide variables is threaded through here explicitly.
struct Parser<'src, 'ctx> {
    scanner: Scanner<'src>,
    heap: &'ctx mut Heap,
    config: &'ctx RuntimeConfig,
    /// Caller-owned values to keep alive across compile-time collections.
    extra_roots: &'ctx [Value],
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,
    states: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

impl<'src, 'ctx> Parser<'src, 'ctx> {
    fn new(
        source: &'src str,
        heap: &'ctx mut Heap,
        config: &'ctx RuntimeConfig,
        extra_roots: &'ctx [Value],
    ) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            scanner: Scanner::new(source),
            heap,
            config,
            extra_roots,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            states: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // After the first error in a statement, stay quiet until the parser
        // resynchronises.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics
            .push(format!("[line {}] Error{}: {}", token.line, location, message));
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Skip tokens until a statement boundary so the next diagnostic is
    /// meaningful again.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn state(&self) -> &FunctionState<'src> {
        self.states.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FunctionState<'src> {
        self.states.last_mut().unwrap()
    }

    fn chunk(&self) -> &Chunk {
        &self.state().function.chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_pair(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        // Initializers hand the receiver back; everything else returns nil.
        if self.state().kind == FunctionKind::Initializer {
            self.emit_pair(Op::GetLocal, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    /// Emit a forward jump with a placeholder distance; returns the offset
    /// of the operand for [`Parser::patch_jump`].
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to step over the operand itself.
        let distance = self.chunk().code.len() - offset - 2;
        if distance > u16::MAX as usize {
            self.error("Too much code to jump over");
        }

        let code = &mut self.chunk_mut().code;
        code[offset] = ((distance >> 8) & 0xFF) as u8;
        code[offset + 1] = (distance & 0xFF) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);

        let distance = self.chunk().code.len() - loop_start + 2;
        if distance > u16::MAX as usize {
            self.error("Loop body too large");
        }

        self.emit_byte(((distance >> 8) & 0xFF) as u8);
        self.emit_byte((distance & 0xFF) as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_pair(Op::Constant, constant);
    }

    // =========================================================================
    // Heap access
    // =========================================================================

    /// Intern a string, running a collection first if one is due. The
    /// compiler's roots are the constants (and names) of every function
    /// still being compiled.
    fn intern(&mut self, text: &str) -> GcRef {
        if let Some(r) = self.heap.find_interned(text) {
            return r;
        }
        self.collect_if_needed();
        self.heap.intern(text)
    }

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        for &root in self.extra_roots {
            self.heap.mark_value(root);
        }
        for state in &self.states {
            if let Some(name) = state.function.name {
                self.heap.mark_object(name);
            }
            for &constant in &state.function.chunk.constants {
                self.heap.mark_value(constant);
            }
        }
        self.heap.trace_references();
        self.heap.sweep();
    }

    /// Finish the innermost function: emit the implicit return, move the
    /// built function to the heap, and hand back its upvalue layout for the
    /// `Closure` instruction. The collection (if due) runs before the state
    /// is popped so the function's constants are still rooted.
    fn finish_function(&mut self) -> (GcRef, Vec<CompilerUpvalue>) {
        self.emit_return();
        self.collect_if_needed();

        let state = self.states.pop().unwrap();
        let upvalues = state.upvalues;
        let function = self.heap.alloc(Obj::Function(state.function));

        if self.config.print_code && !self.had_error {
            eprint!("{}", debug::disassemble(self.heap, function));
        }

        (function, upvalues)
    }

    fn end_compiler(&mut self) -> GcRef {
        let (function, _) = self.finish_function();
        function
    }

    // =========================================================================
    // Variables and scopes
    // =========================================================================

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.intern(name);
        self.make_constant(Value::Obj(r))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: UNINITIALIZED,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let mut duplicate = false;
        {
            let state = self.state();
            for local in state.locals.iter().rev() {
                if local.depth != UNINITIALIZED && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("A variable with this name already exists in this scope");
        }

        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        // Locals need no code: the initializer's value is already sitting in
        // the right stack slot.
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(Op::DefineGlobal, global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }

        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut found = None;
        for (i, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                found = Some((i, local.depth == UNINITIALIZED));
                break;
            }
        }

        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer");
        }
        Some(slot as u8)
    }

    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(state_index - 1, name) {
            self.states[state_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(state_index - 1, name) {
            return Some(self.add_upvalue(state_index, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.states[state_index].upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }

        if self.states[state_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function");
            return 0;
        }

        let state = &mut self.states[state_index];
        state.upvalues.push(CompilerUpvalue { index, is_local });
        state.function.upvalue_count = state.upvalues.len();
        (state.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, name) {
            (Op::GetLocal, Op::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(top, name) {
            (Op::GetUpvalue, Op::SetUpvalue, slot)
        } else {
            let constant = self.identifier_constant(name);
            (Op::GetGlobal, Op::SetGlobal, constant)
        };

        // We may have parsed the left-hand side of an assignment as a get
        // expression, up to the point where the '=' shows it was a set.
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        loop {
            let doomed = {
                let state = self.state();
                match state.locals.last() {
                    Some(local) if local.depth > state.scope_depth => Some(local.is_captured),
                    _ => None,
                }
            };
            match doomed {
                // Captured locals move to the heap instead of vanishing.
                Some(true) => self.emit_op(Op::CloseUpvalue),
                Some(false) => self.emit_op(Op::Pop),
                None => break,
            }
            self.state_mut().locals.pop();
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// The heart of the Pratt parser: consume a prefix expression, then keep
    /// folding in infix operators of at least the given precedence.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expected expression");
            return;
        };

        // Assignment binds loosest, so a prefix expression may only be an
        // assignment target when nothing tighter encloses it.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while rule(self.current.kind).precedence >= precedence {
            self.advance();
            let infix = rule(self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("scanner produced an unparsable number");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        // Trim the surrounding quotes.
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let r = self.intern(text);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::Nil => self.emit_op(Op::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match op {
            TokenKind::Bang => self.emit_op(Op::Not),
            TokenKind::Minus => self.emit_op(Op::Negate),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;

        // One level up, because these are left-associative: we want
        // (((1 + 2) + 3) + 4), not (1 + (2 + (3 + 4))).
        let precedence = rule(op).precedence;
        self.parse_precedence(precedence.next());

        match op {
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    /// `and` short-circuits by leaving the falsey left operand on the stack,
    /// so the whole expression evaluates to its determining operand.
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);

        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);

        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_pair(Op::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_pair(Op::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            // obj.m(args) in one instruction, skipping the bound method.
            let arg_count = self.argument_list();
            self.emit_op(Op::Invoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.emit_pair(Op::GetProperty, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class"),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass");
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "Expected superclass method name");
        let lexeme = self.previous.lexeme;
        let name = self.identifier_constant(lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(Op::SuperInvoke);
            self.emit_byte(name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_pair(Op::GetSuper, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after arguments");
        count.min(255) as u8
    }

    // =========================================================================
    // Statements and declarations
    // =========================================================================

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        // The condition is popped on both paths; a statement must have zero
        // net stack effect.
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    /// `for` lowers straight to while-shaped bytecode: the increment clause
    /// is emitted before the body in the code array, so the body jumps back
    /// to the increment, which loops back to the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value");
            self.emit_op(Op::Return);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration",
        );

        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name");
        // A function may refer to itself; it is initialized as soon as its
        // name is known.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    /// Compile a function body. The resulting `Closure` instruction carries
    /// one `(is_local, index)` pair per upvalue so the VM can wire the
    /// closure at run time.
    fn function(&mut self, kind: FunctionKind) {
        self.push_state(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.state_mut().function.arity += 1;
                if self.state().function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters");
                }
                let constant = self.parse_variable("Expected parameter name");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body");
        self.block();

        // No end_scope: dropping the state discards its locals, and the VM
        // pops the whole frame window on return.
        let (function, upvalues) = self.finish_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_pair(Op::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn push_state(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Script => None,
            _ => {
                let lexeme = self.previous.lexeme;
                Some(self.intern(lexeme))
            }
        };
        self.states.push(FunctionState::new(kind, name));
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block");
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name");
        let lexeme = self.previous.lexeme;
        let constant = self.identifier_constant(lexeme);

        // `init` is only special as a class initializer; reading it back off
        // an instance later gives a perfectly ordinary bound method.
        let kind = if lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_pair(Op::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_pair(Op::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expected superclass name");
            self.variable(false);

            if class_name == self.previous.lexeme {
                self.error("A class can't inherit from itself");
            }

            // A scope for the synthetic `super` local, closed over by the
            // class's methods.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(Op::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body");
        self.emit_op(Op::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_source(source: &str) -> Result<(GcRef, Heap), Vec<String>> {
        let mut heap = Heap::new();
        let config = RuntimeConfig::default();
        match compile(source, &mut heap, &config) {
            Ok(function) => Ok((function, heap)),
            Err(e) => Err(e.diagnostics),
        }
    }

    fn code_of(heap: &Heap, function: GcRef) -> &[u8] {
        &heap.function(function).chunk.code
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let (function, heap) = compile_source("1 + 2;").unwrap();
        let expected = [
            Op::Constant as u8,
            0,
            Op::Constant as u8,
            1,
            Op::Add as u8,
            Op::Pop as u8,
            Op::Nil as u8,
            Op::Return as u8,
        ];
        assert_eq!(code_of(&heap, function), expected);

        let constants = &heap.function(function).chunk.constants;
        assert_eq!(constants[0], Value::Number(1.0));
        assert_eq!(constants[1], Value::Number(2.0));
    }

    #[test]
    fn test_print_statement_bytecode() {
        let (function, heap) = compile_source("print 7;").unwrap();
        let expected = [
            Op::Constant as u8,
            0,
            Op::Print as u8,
            Op::Nil as u8,
            Op::Return as u8,
        ];
        assert_eq!(code_of(&heap, function), expected);
    }

    #[test]
    fn test_precedence_orders_operands() {
        // 1 + 2 * 3 multiplies before adding.
        let (function, heap) = compile_source("1 + 2 * 3;").unwrap();
        let code = code_of(&heap, function);
        let mul = code.iter().position(|&b| b == Op::Multiply as u8).unwrap();
        let add = code.iter().position(|&b| b == Op::Add as u8).unwrap();
        assert!(mul < add);
    }

    #[test]
    fn test_string_literal_is_interned() {
        let (function, heap) = compile_source("\"abc\";").unwrap();
        let constant = heap.function(function).chunk.constants[0];
        let r = constant.as_obj().unwrap();
        assert_eq!(heap.as_str(r), "abc");
        assert_eq!(heap.find_interned("abc"), Some(r));
    }

    #[test]
    fn test_repeated_string_shares_one_object() {
        let (function, heap) = compile_source("\"dup\"; \"dup\";").unwrap();
        let constants = &heap.function(function).chunk.constants;
        assert_eq!(constants[0], constants[1]);
    }

    #[test]
    fn test_if_emits_conditional_jump() {
        let (function, heap) = compile_source("if (true) print 1;").unwrap();
        let code = code_of(&heap, function);
        assert!(code.contains(&(Op::JumpIfFalse as u8)));
        assert!(code.contains(&(Op::Jump as u8)));
    }

    #[test]
    fn test_while_emits_backwards_loop() {
        let (function, heap) = compile_source("while (false) print 1;").unwrap();
        assert!(code_of(&heap, function).contains(&(Op::Loop as u8)));
    }

    #[test]
    fn test_function_declaration() {
        let (script, heap) = compile_source("fun add(a, b) { return a + b; }").unwrap();
        assert!(code_of(&heap, script).contains(&(Op::Closure as u8)));

        // The function object lands in the script's constant pool.
        let function = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .filter_map(Value::as_obj)
            .find(|&r| matches!(heap.get(r), Obj::Function(_)))
            .unwrap();
        let function = heap.function(function);
        assert_eq!(function.arity, 2);
        assert_eq!(heap.as_str(function.name.unwrap()), "add");
    }

    #[test]
    fn test_closure_captures_upvalue() {
        let source = "fun outer() { var x = 1; fun inner() { return x; } return inner; }";
        let (script, heap) = compile_source(source).unwrap();

        let outer = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .filter_map(Value::as_obj)
            .find(|&r| matches!(heap.get(r), Obj::Function(_)))
            .unwrap();
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .filter_map(Value::as_obj)
            .find(|&r| matches!(heap.get(r), Obj::Function(_)))
            .unwrap();
        assert_eq!(heap.function(inner).upvalue_count, 1);
        // The captured local gets CloseUpvalue treatment on scope exit; here
        // the scope is the whole function so the frame teardown closes it.
        assert!(code_of(&heap, inner).contains(&(Op::GetUpvalue as u8)));
    }

    #[test]
    fn test_statement_boundary_recovery_reports_multiple_errors() {
        let diagnostics = compile_source("var 1; print;").unwrap_err();
        assert!(diagnostics.len() >= 2, "diagnostics: {:?}", diagnostics);
        assert!(diagnostics[0].contains("Expected variable name"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let diagnostics = compile_source("1 = 2;").unwrap_err();
        assert!(diagnostics[0].contains("Invalid assignment target"));
    }

    #[test]
    fn test_reading_local_in_own_initializer() {
        let diagnostics = compile_source("{ var a = a; }").unwrap_err();
        assert!(diagnostics[0].contains("Can't read local variable in its own initializer"));
    }

    #[test]
    fn test_duplicate_local_in_scope() {
        let diagnostics = compile_source("{ var a = 1; var a = 2; }").unwrap_err();
        assert!(diagnostics[0].contains("already exists in this scope"));
    }

    #[test]
    fn test_return_outside_function() {
        let diagnostics = compile_source("return 1;").unwrap_err();
        assert!(diagnostics[0].contains("Can't return from top-level code"));
    }

    #[test]
    fn test_this_outside_class() {
        let diagnostics = compile_source("print this;").unwrap_err();
        assert!(diagnostics[0].contains("Can't use 'this' outside of a class"));
    }

    #[test]
    fn test_super_without_superclass() {
        let diagnostics =
            compile_source("class A { m() { super.m(); } }").unwrap_err();
        assert!(diagnostics[0].contains("Can't use 'super' in a class with no superclass"));
    }

    #[test]
    fn test_class_cannot_inherit_itself() {
        let diagnostics = compile_source("class A < A {}").unwrap_err();
        assert!(diagnostics[0].contains("A class can't inherit from itself"));
    }

    #[test]
    fn test_initializer_cannot_return_value() {
        let diagnostics =
            compile_source("class A { init() { return 1; } }").unwrap_err();
        assert!(diagnostics[0].contains("Can't return a value from an initializer"));
    }

    #[test]
    fn test_error_at_end_location() {
        let diagnostics = compile_source("print 1").unwrap_err();
        assert!(diagnostics[0].contains("at end"));
    }

    #[test]
    fn test_scan_error_becomes_diagnostic() {
        let diagnostics = compile_source("var a = @;").unwrap_err();
        assert!(diagnostics[0].contains("Unexpected character"));
    }

    #[test]
    fn test_too_many_constants_in_chunk() {
        // 257 distinct number literals overflow the one-byte constant index.
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("{};\n", i));
        }
        let diagnostics = compile_source(&source).unwrap_err();
        assert!(diagnostics
            .iter()
            .any(|d| d.contains("Too many constants in one chunk")));
    }

    #[test]
    fn test_number_constant_round_trips() {
        let (function, heap) = compile_source("print 1234.5678;").unwrap();
        assert_eq!(
            heap.function(function).chunk.constants[0],
            Value::Number(1234.5678)
        );
    }

    #[test]
    fn test_lines_track_source() {
        let (function, heap) = compile_source("1;\n\n2;").unwrap();
        let chunk = &heap.function(function).chunk;
        assert_eq!(chunk.lines[0], 1);
        let second_constant = chunk
            .code
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == Op::Constant as u8)
            .nth(1)
            .unwrap()
            .0;
        assert_eq!(chunk.lines[second_constant], 3);
    }
}
