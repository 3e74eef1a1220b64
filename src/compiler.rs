use crate::chunk::{Chunk, JumpError, Opcode};
use crate::heap::{Heap, ObjFunction, ObjRef, Object};
use crate::scanner::{ScanError, Scanner, SourceIterator, Token, TokenContents};
use crate::value::Value;
use arrayvec::ArrayVec;
use log::{debug, log_enabled, Level};
use std::fmt::{Display, Formatter};
use std::mem;
use std::rc::Rc;
use thiserror::Error;

type ParseResult<A> = Result<A, CompileError>;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Ord, Eq)]
enum BindingPower {
    None,
    Assignment,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Power,
    Unary,
    Call,
    Primary,
}

impl BindingPower {
    /// One level tighter; the right operand of a left-associative operator
    /// is parsed at this power.
    fn next(self) -> Self {
        use BindingPower::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => BitOr,
            BitOr => BitXor,
            BitXor => BitAnd,
            BitAnd => Equality,
            Equality => Comparison,
            Comparison => Shift,
            Shift => Term,
            Term => Factor,
            Factor => Power,
            Power => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

/// Compiles `source` into the top-level script function.
///
/// `roots` are the values the caller keeps alive (its globals); they are
/// marked along with the compiler's own constants whenever a collection
/// runs mid-compile.
pub fn compile(source: &str, heap: &mut Heap, roots: &[Value]) -> Result<ObjRef, CompileErrors> {
    let mut compiler = Compiler::new(Scanner::new(source).iter(), heap, roots);
    compiler.advance();
    while !compiler.check(TokenContents::Eof) {
        compiler.declaration();
    }
    let (function, errors) = compiler.end_script();
    if errors.is_empty() {
        Ok(function)
    } else {
        Err(errors)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// `None` until the initializer has been compiled.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct UpvalueRef {
    is_local: bool,
    index: u8,
}

struct FunctionState<'src> {
    kind: FunctionKind,
    name: Option<ObjRef>,
    arity: usize,
    chunk: Chunk,
    locals: ArrayVec<Local<'src>, MAX_LOCALS>,
    upvalues: ArrayVec<UpvalueRef, MAX_UPVALUES>,
    scope_depth: usize,
}

impl<'src> FunctionState<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        let mut locals = ArrayVec::new();
        // Slot 0 holds the callee.
        locals.push(Local {
            name: "",
            depth: Some(0),
            is_captured: false,
        });
        Self {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: ArrayVec::new(),
            scope_depth: 0,
        }
    }

    fn resolve_local(&self, name: &str) -> Option<(u8, bool)> {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(idx, local)| (idx as u8, local.depth.is_some()))
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, ParseError> {
        let upvalue = UpvalueRef { is_local, index };
        if let Some(existing) = self.upvalues.iter().position(|u| *u == upvalue) {
            return Ok(existing as u8);
        }
        self.upvalues
            .try_push(upvalue)
            .map_err(|_| ParseError::TooManyUpvalues)?;
        Ok((self.upvalues.len() - 1) as u8)
    }
}

enum Resolved {
    Local(u8),
    Upvalue(u8),
    Global,
}

struct VariableOps {
    get: Opcode,
    set: Opcode,
    add_set: Opcode,
    sub_set: Opcode,
}

const LOCAL_OPS: VariableOps = VariableOps {
    get: Opcode::GetLocal,
    set: Opcode::SetLocal,
    add_set: Opcode::AddSetLocal,
    sub_set: Opcode::SubSetLocal,
};

const UPVALUE_OPS: VariableOps = VariableOps {
    get: Opcode::GetUpvalue,
    set: Opcode::SetUpvalue,
    add_set: Opcode::AddSetUpvalue,
    sub_set: Opcode::SubSetUpvalue,
};

const GLOBAL_OPS: VariableOps = VariableOps {
    get: Opcode::GetGlobal,
    set: Opcode::SetGlobal,
    add_set: Opcode::AddSetGlobal,
    sub_set: Opcode::SubSetGlobal,
};

struct Compiler<'src, 'h> {
    tokens: SourceIterator<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    heap: &'h mut Heap,
    roots: &'h [Value],
    state: FunctionState<'src>,
    enclosing: Vec<FunctionState<'src>>,
    errors: CompileErrors,
    panic_mode: bool,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(tokens: SourceIterator<'src>, heap: &'h mut Heap, roots: &'h [Value]) -> Self {
        Self {
            tokens,
            current: Token::eof(1),
            previous: Token::eof(1),
            heap,
            roots,
            state: FunctionState::new(FunctionKind::Script, None),
            enclosing: Vec::new(),
            errors: CompileErrors::new(),
            panic_mode: false,
        }
    }

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            match self.tokens.next() {
                Some(Ok(token)) => {
                    self.current = token;
                    return;
                }
                Some(Err(e)) => self.report(CompileError::Scan {
                    line: e.line(),
                    error: e,
                }),
                None => {
                    self.current = Token::eof(self.tokens.line());
                    return;
                }
            }
        }
    }

    fn check(&self, contents: TokenContents) -> bool {
        mem::discriminant(&self.current.contents) == mem::discriminant(&contents)
    }

    fn match_token(&mut self, contents: TokenContents) -> bool {
        if self.check(contents) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, contents: TokenContents, expected: &'static str) -> ParseResult<()> {
        if self.check(contents) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at(self.current, ParseError::Expect(expected)))
        }
    }

    fn consume_identifier(&mut self, expected: &'static str) -> ParseResult<&'src str> {
        match self.current.contents {
            TokenContents::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_at(self.current, ParseError::Expect(expected))),
        }
    }

    fn error_at(&self, token: Token, error: ParseError) -> CompileError {
        let location = match token.contents {
            TokenContents::Eof => ErrorLocation::End,
            _ => ErrorLocation::At(token.lexeme.to_string()),
        };
        CompileError::Parse {
            line: token.line,
            location,
            error,
        }
    }

    /// Records a non-fatal error at the previous token; parsing carries on.
    fn error(&mut self, error: ParseError) {
        let error = self.error_at(self.previous, error);
        self.report(error);
    }

    fn report(&mut self, error: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(error);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenContents::Eof) {
            if self.previous.contents == TokenContents::Semicolon {
                return;
            }
            match self.current.contents {
                TokenContents::Def
                | TokenContents::Let
                | TokenContents::For
                | TokenContents::If
                | TokenContents::While
                | TokenContents::Type
                | TokenContents::Return => return,
                _ => self.advance(),
            }
        }
    }

    fn emit(&mut self, opcode: Opcode) {
        let line = self.previous.line;
        self.state.chunk.add_opcode(opcode, line);
    }

    fn emit_with_operand(&mut self, opcode: Opcode, operand: u8) {
        let line = self.previous.line;
        self.state.chunk.add_opcode_and_operand(opcode, operand, line);
    }

    fn emit_at(&mut self, opcode: Opcode, line: usize) {
        self.state.chunk.add_opcode(opcode, line);
    }

    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        let line = self.previous.line;
        self.state.chunk.add_dummy_jump(opcode, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(e) = self.state.chunk.patch_jump(offset) {
            self.error(e.into());
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(e) = self.state.chunk.emit_loop(loop_start, line) {
            self.error(e.into());
        }
    }

    fn emit_return(&mut self) {
        self.emit(Opcode::Null);
        self.emit(Opcode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.state.chunk.add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error(ParseError::TooManyConstants);
                0
            }
        }
    }

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let states = self.enclosing.iter().chain([&self.state]);
        let roots = self.roots.iter().copied().chain(states.flat_map(|state| {
            state
                .chunk
                .constants()
                .iter()
                .copied()
                .chain(state.name.map(Value::Obj))
        }));
        self.heap.collect_garbage(roots);
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.collect_if_needed();
        self.heap.intern(s)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let name = self.intern(name);
        self.make_constant(Value::Obj(name))
    }

    fn state_mut(&mut self, depth: usize) -> &mut FunctionState<'src> {
        if depth == self.enclosing.len() {
            &mut self.state
        } else {
            &mut self.enclosing[depth]
        }
    }

    fn begin_function(&mut self, kind: FunctionKind, name: &str) {
        let name = self.intern(name);
        let state = FunctionState::new(kind, Some(name));
        let enclosing = mem::replace(&mut self.state, state);
        self.enclosing.push(enclosing);
    }

    /// Finishes the innermost function and hands back its object together
    /// with the upvalue descriptors the enclosing closure instruction needs.
    fn end_function(&mut self) -> (ObjRef, ArrayVec<UpvalueRef, MAX_UPVALUES>) {
        self.emit_return();
        // Collect while the finished state is still rooted.
        self.collect_if_needed();
        let parent = match self.enclosing.pop() {
            Some(parent) => parent,
            None => unreachable!("Ending a function without an enclosing state"),
        };
        let state = mem::replace(&mut self.state, parent);
        make_function(self.heap, state)
    }

    fn end_script(mut self) -> (ObjRef, CompileErrors) {
        self.emit_return();
        self.collect_if_needed();
        let (function, _) = make_function(self.heap, self.state);
        (function, self.errors)
    }

    fn scoped(&mut self, f: impl FnOnce(&mut Self) -> ParseResult<()>) -> ParseResult<()> {
        self.state.scope_depth += 1;
        let res = f(self);
        self.state.scope_depth -= 1;
        let line = self.previous.line;
        while let Some(local) = self.state.locals.last() {
            // Uninitialized locals (left behind by an error) belong to the
            // scope being closed too.
            if matches!(local.depth, Some(depth) if depth <= self.state.scope_depth) {
                break;
            }
            let opcode = if local.is_captured {
                Opcode::CloseUpvalue
            } else {
                Opcode::Pop
            };
            self.emit_at(opcode, line);
            self.state.locals.pop();
        }
        res
    }

    fn declaration(&mut self) {
        let result = if self.match_token(TokenContents::Def) {
            self.fun_declaration()
        } else if self.match_token(TokenContents::Let) {
            self.var_declaration()
        } else {
            self.statement()
        };
        if let Err(e) = result {
            self.report(e);
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) -> ParseResult<()> {
        let (global, name) = self.parse_variable("function name")?;
        self.mark_initialized();
        self.function(FunctionKind::Function, name)?;
        self.define_variable(global);
        Ok(())
    }

    fn function(&mut self, kind: FunctionKind, name: &str) -> ParseResult<()> {
        self.begin_function(kind, name);
        self.state.scope_depth += 1;
        let body = self.function_body();
        let (function, upvalues) = self.end_function();
        body?;

        let constant = self.make_constant(Value::Obj(function));
        self.emit_with_operand(Opcode::Closure, constant);
        let line = self.previous.line;
        for upvalue in upvalues {
            self.state.chunk.add_byte(upvalue.is_local as u8, line);
            self.state.chunk.add_byte(upvalue.index, line);
        }
        Ok(())
    }

    fn function_body(&mut self) -> ParseResult<()> {
        self.consume(TokenContents::LeftParen, "'(' after function name")?;
        if !self.check(TokenContents::RightParen) {
            loop {
                self.state.arity += 1;
                if self.state.arity > MAX_ARGS {
                    let error = self.error_at(self.current, ParseError::TooManyParameters);
                    self.report(error);
                }
                let (constant, _) = self.parse_variable("parameter name")?;
                self.define_variable(constant);
                if !self.match_token(TokenContents::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenContents::RightParen, "')' after parameters")?;
        self.consume(TokenContents::LeftBrace, "'{' before function body")?;
        self.block()
    }

    fn var_declaration(&mut self) -> ParseResult<()> {
        let (global, _) = self.parse_variable("variable name")?;
        if self.match_token(TokenContents::Equal) {
            self.expression()?;
        } else {
            self.emit(Opcode::Null);
        }
        self.consume(
            TokenContents::Semicolon,
            "';' after variable declaration",
        )?;
        self.define_variable(global);
        Ok(())
    }

    /// Declares the variable named by the next token. Returns the name's
    /// constant for globals (0 for locals) and the name itself.
    fn parse_variable(&mut self, expected: &'static str) -> ParseResult<(u8, &'src str)> {
        let name = self.consume_identifier(expected)?;
        self.declare_variable(name);
        if self.state.scope_depth > 0 {
            Ok((0, name))
        } else {
            Ok((self.identifier_constant(name), name))
        }
    }

    fn declare_variable(&mut self, name: &'src str) {
        let depth = self.state.scope_depth;
        if depth == 0 {
            return;
        }
        let duplicate = self
            .state
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= depth))
            .any(|local| local.name == name);
        if duplicate {
            self.error(ParseError::DuplicateLocal);
        }
        let local = Local {
            name,
            depth: None,
            is_captured: false,
        };
        if self.state.locals.try_push(local).is_err() {
            self.error(ParseError::TooManyLocals);
        }
    }

    fn mark_initialized(&mut self) {
        let depth = self.state.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.state.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.state.scope_depth > 0 {
            self.mark_initialized();
        } else {
            self.emit_with_operand(Opcode::DefineGlobal, global);
        }
    }

    fn statement(&mut self) -> ParseResult<()> {
        if self.match_token(TokenContents::Type) {
            self.type_statement()
        } else if self.match_token(TokenContents::If) {
            self.if_statement()
        } else if self.match_token(TokenContents::Return) {
            self.return_statement()
        } else if self.match_token(TokenContents::While) {
            self.while_statement()
        } else if self.match_token(TokenContents::For) {
            self.for_statement()
        } else if self.match_token(TokenContents::LeftBrace) {
            self.scoped(|s| s.block())
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> ParseResult<()> {
        while !self.check(TokenContents::RightBrace) && !self.check(TokenContents::Eof) {
            self.declaration();
        }
        self.consume(TokenContents::RightBrace, "'}' after block")
    }

    fn type_statement(&mut self) -> ParseResult<()> {
        self.expression()?;
        self.consume(TokenContents::Semicolon, "';' after value")?;
        self.emit(Opcode::Type);
        Ok(())
    }

    fn expression_statement(&mut self) -> ParseResult<()> {
        self.expression()?;
        self.consume(TokenContents::Semicolon, "';' after expression")?;
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn return_statement(&mut self) -> ParseResult<()> {
        if self.state.kind == FunctionKind::Script {
            self.error(ParseError::ReturnFromTopLevel);
        }
        if self.match_token(TokenContents::Semicolon) {
            self.emit_return();
        } else {
            self.expression()?;
            self.consume(TokenContents::Semicolon, "';' after return value")?;
            self.emit(Opcode::Return);
        }
        Ok(())
    }

    fn if_statement(&mut self) -> ParseResult<()> {
        self.consume(TokenContents::LeftParen, "'(' after 'if'")?;
        self.expression()?;
        self.consume(TokenContents::RightParen, "')' after condition")?;

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit(Opcode::Pop);
        if self.match_token(TokenContents::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> ParseResult<()> {
        let loop_start = self.state.chunk.get_loop_start();
        self.consume(TokenContents::LeftParen, "'(' after 'while'")?;
        self.expression()?;
        self.consume(TokenContents::RightParen, "')' after condition")?;

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement()?;
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> ParseResult<()> {
        self.scoped(|s| {
            s.consume(TokenContents::LeftParen, "'(' after 'for'")?;
            if s.match_token(TokenContents::Semicolon) {
                // No initializer.
            } else if s.match_token(TokenContents::Let) {
                s.var_declaration()?;
            } else {
                s.expression_statement()?;
            }

            let mut loop_start = s.state.chunk.get_loop_start();
            let mut exit_jump = None;
            if !s.match_token(TokenContents::Semicolon) {
                s.expression()?;
                s.consume(TokenContents::Semicolon, "';' after loop condition")?;
                exit_jump = Some(s.emit_jump(Opcode::JumpIfFalse));
                s.emit(Opcode::Pop);
            }

            if !s.match_token(TokenContents::RightParen) {
                let body_jump = s.emit_jump(Opcode::Jump);
                let increment_start = s.state.chunk.get_loop_start();
                s.expression()?;
                s.emit(Opcode::Pop);
                s.consume(TokenContents::RightParen, "')' after for clauses")?;
                s.emit_loop(loop_start);
                loop_start = increment_start;
                s.patch_jump(body_jump);
            }

            s.statement()?;
            s.emit_loop(loop_start);

            if let Some(exit_jump) = exit_jump {
                s.patch_jump(exit_jump);
                s.emit(Opcode::Pop);
            }
            Ok(())
        })
    }

    fn expression(&mut self) -> ParseResult<()> {
        self.expression_bp(BindingPower::Assignment)
    }

    fn expression_bp(&mut self, min_bp: BindingPower) -> ParseResult<()> {
        self.advance();
        let can_assign = min_bp <= BindingPower::Assignment;
        let Some((prefix_rule, _)) = get_parser(&self.previous.contents, OperatorType::Prefix)
        else {
            return Err(self.error_at(self.previous, ParseError::Expect("expression")));
        };
        prefix_rule(self, can_assign)?;

        while let Some((infix_rule, infix_bp)) =
            get_parser(&self.current.contents, OperatorType::Infix)
        {
            if infix_bp < min_bp {
                break;
            }
            self.advance();
            infix_rule(self, can_assign)?;
        }

        if can_assign
            && (self.match_token(TokenContents::Equal)
                || self.match_token(TokenContents::PlusEqual)
                || self.match_token(TokenContents::MinusEqual))
        {
            self.error(ParseError::InvalidAssignmentTarget);
        }
        Ok(())
    }

    fn parse_grouping(&mut self, _can_assign: bool) -> ParseResult<()> {
        self.expression()?;
        self.consume(TokenContents::RightParen, "')' after expression")
    }

    fn parse_number(&mut self, _can_assign: bool) -> ParseResult<()> {
        let token = self.previous;
        let number: f64 = match token.contents {
            TokenContents::Number(number) => number
                .parse()
                .map_err(|_| self.error_at(token, ParseError::InvalidNumber))?,
            _ => unreachable!("Expected number, got token {token:?}"),
        };
        let constant = self.make_constant(Value::Number(number));
        self.emit_with_operand(Opcode::Constant, constant);
        Ok(())
    }

    fn parse_string(&mut self, _can_assign: bool) -> ParseResult<()> {
        match self.previous.contents {
            TokenContents::String(s) => {
                let string = self.intern(s);
                let constant = self.make_constant(Value::Obj(string));
                self.emit_with_operand(Opcode::Constant, constant);
            }
            _ => unreachable!("Unexpected string token, got {:?}", self.previous),
        }
        Ok(())
    }

    fn parse_literal(&mut self, _can_assign: bool) -> ParseResult<()> {
        match self.previous.contents {
            TokenContents::True => self.emit(Opcode::True),
            TokenContents::False => self.emit(Opcode::False),
            TokenContents::Null => self.emit(Opcode::Null),
            _ => unreachable!("Unexpected literal token, got {:?}", self.previous),
        }
        Ok(())
    }

    fn parse_list(&mut self, _can_assign: bool) -> ParseResult<()> {
        let mut count = 0;
        if !self.check(TokenContents::RightBracket) {
            loop {
                self.expression()?;
                if count == MAX_ARGS {
                    self.error(ParseError::TooManyListItems);
                }
                count += 1;
                if !self.match_token(TokenContents::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenContents::RightBracket, "']' after list items")?;
        self.emit_with_operand(Opcode::BuildList, count.min(MAX_ARGS) as u8);
        Ok(())
    }

    fn parse_identifier(&mut self, can_assign: bool) -> ParseResult<()> {
        match self.previous.contents {
            TokenContents::Identifier(name) => self.named_variable(name, can_assign),
            _ => unreachable!("Unexpected identifier token, got {:?}", self.previous),
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) -> ParseResult<()> {
        let (ops, operand) = match self.resolve(name) {
            Resolved::Local(slot) => (LOCAL_OPS, slot),
            Resolved::Upvalue(index) => (UPVALUE_OPS, index),
            Resolved::Global => (GLOBAL_OPS, self.identifier_constant(name)),
        };
        let line = self.previous.line;
        let opcode = if can_assign && self.match_token(TokenContents::Equal) {
            self.expression()?;
            ops.set
        } else if can_assign && self.match_token(TokenContents::PlusEqual) {
            self.expression()?;
            ops.add_set
        } else if can_assign && self.match_token(TokenContents::MinusEqual) {
            self.expression()?;
            ops.sub_set
        } else {
            ops.get
        };
        self.state
            .chunk
            .add_opcode_and_operand(opcode, operand, line);
        Ok(())
    }

    fn resolve(&mut self, name: &str) -> Resolved {
        let depth = self.enclosing.len();
        if let Some(slot) = self.resolve_local(depth, name) {
            return Resolved::Local(slot);
        }
        match self.resolve_upvalue(depth, name) {
            Ok(Some(index)) => Resolved::Upvalue(index),
            Ok(None) => Resolved::Global,
            Err(e) => {
                self.error(e);
                Resolved::Upvalue(0)
            }
        }
    }

    fn resolve_local(&mut self, depth: usize, name: &str) -> Option<u8> {
        let (slot, initialized) = self.state_mut(depth).resolve_local(name)?;
        if !initialized {
            self.error(ParseError::LocalInOwnInitializer);
        }
        Some(slot)
    }

    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Result<Option<u8>, ParseError> {
        if depth == 0 {
            return Ok(None);
        }
        let parent = depth - 1;
        if let Some(slot) = self.resolve_local(parent, name) {
            self.state_mut(parent).locals[slot as usize].is_captured = true;
            return self.state_mut(depth).add_upvalue(slot, true).map(Some);
        }
        match self.resolve_upvalue(parent, name)? {
            Some(index) => self.state_mut(depth).add_upvalue(index, false).map(Some),
            None => Ok(None),
        }
    }

    fn parse_unary(&mut self, _can_assign: bool) -> ParseResult<()> {
        let token = self.previous;
        self.expression_bp(BindingPower::Unary)?;
        match token.contents {
            TokenContents::Minus => self.emit_at(Opcode::Negate, token.line),
            TokenContents::Bang => self.emit_at(Opcode::Not, token.line),
            _ => unreachable!("Unexpected unary token, got {token:?}"),
        }
        Ok(())
    }

    fn parse_binary(&mut self, _can_assign: bool) -> ParseResult<()> {
        let token = self.previous;
        let bp = get_parser(&token.contents, OperatorType::Infix)
            .map_or(BindingPower::None, |(_, bp)| bp);
        self.expression_bp(bp.next())?;
        let line = token.line;
        let opcode = match token.contents {
            TokenContents::Plus => Opcode::Add,
            TokenContents::Minus => Opcode::Subtract,
            TokenContents::Asterisk => Opcode::Multiply,
            TokenContents::Slash => Opcode::Divide,
            TokenContents::Percent => Opcode::Modulo,
            TokenContents::Ampersand => Opcode::BitAnd,
            TokenContents::Pipe => Opcode::BitOr,
            TokenContents::Caret => Opcode::BitXor,
            TokenContents::GreaterGreater => Opcode::ShiftRight,
            TokenContents::LessLess => Opcode::ShiftLeft,
            TokenContents::EqualEqual => Opcode::Equal,
            TokenContents::Greater => Opcode::Greater,
            TokenContents::Less => Opcode::Less,
            TokenContents::BangEqual => {
                self.emit_at(Opcode::Equal, line);
                Opcode::Not
            }
            TokenContents::GreaterEqual => {
                self.emit_at(Opcode::Less, line);
                Opcode::Not
            }
            TokenContents::LessEqual => {
                self.emit_at(Opcode::Greater, line);
                Opcode::Not
            }
            _ => unreachable!("Unexpected binary token, got {token:?}"),
        };
        self.emit_at(opcode, line);
        Ok(())
    }

    // Right associative: the right operand binds at the same power.
    fn parse_power(&mut self, _can_assign: bool) -> ParseResult<()> {
        let line = self.previous.line;
        self.expression_bp(BindingPower::Power)?;
        self.emit_at(Opcode::Power, line);
        Ok(())
    }

    fn parse_and(&mut self, _can_assign: bool) -> ParseResult<()> {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.expression_bp(BindingPower::And.next())?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn parse_or(&mut self, _can_assign: bool) -> ParseResult<()> {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit(Opcode::Pop);
        self.expression_bp(BindingPower::Or.next())?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn parse_call(&mut self, _can_assign: bool) -> ParseResult<()> {
        let mut count = 0;
        if !self.check(TokenContents::RightParen) {
            loop {
                self.expression()?;
                if count == MAX_ARGS {
                    self.error(ParseError::TooManyArguments);
                }
                count += 1;
                if !self.match_token(TokenContents::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenContents::RightParen, "')' after arguments")?;
        self.emit_with_operand(Opcode::Call, count.min(MAX_ARGS) as u8);
        Ok(())
    }

    fn parse_subscript(&mut self, can_assign: bool) -> ParseResult<()> {
        self.expression()?;
        self.consume(TokenContents::RightBracket, "']' after index")?;
        if can_assign && self.match_token(TokenContents::Equal) {
            self.expression()?;
            self.emit(Opcode::SetSubscript);
        } else {
            self.emit(Opcode::GetSubscript);
        }
        Ok(())
    }
}

fn make_function(
    heap: &mut Heap,
    state: FunctionState<'_>,
) -> (ObjRef, ArrayVec<UpvalueRef, MAX_UPVALUES>) {
    let FunctionState {
        name,
        arity,
        chunk,
        upvalues,
        ..
    } = state;
    if log_enabled!(Level::Debug) {
        let label = name.and_then(|n| heap.str(n)).unwrap_or("script");
        debug!("Emitting chunk:\n{}", chunk.disassemble(label, heap));
    }
    let function = heap.alloc(Object::Function(ObjFunction {
        arity: arity.min(MAX_ARGS) as u8,
        upvalue_count: upvalues.len(),
        chunk: Rc::new(chunk),
        name,
    }));
    (function, upvalues)
}

fn get_parser<'src, 'h>(
    contents: &TokenContents<'_>,
    operator_type: OperatorType,
) -> Option<(Parser<'src, 'h>, BindingPower)> {
    use TokenContents::*;
    match (contents, operator_type) {
        (LeftParen, OperatorType::Prefix) => Some((Compiler::parse_grouping, BindingPower::None)),
        (LeftBracket, OperatorType::Prefix) => Some((Compiler::parse_list, BindingPower::None)),
        (Minus | Bang, OperatorType::Prefix) => Some((Compiler::parse_unary, BindingPower::Unary)),
        (Number(_), OperatorType::Prefix) => Some((Compiler::parse_number, BindingPower::None)),
        (String(_), OperatorType::Prefix) => Some((Compiler::parse_string, BindingPower::None)),
        (Identifier(_), OperatorType::Prefix) => {
            Some((Compiler::parse_identifier, BindingPower::None))
        }
        (True | False | Null, OperatorType::Prefix) => {
            Some((Compiler::parse_literal, BindingPower::None))
        }
        (LeftParen, OperatorType::Infix) => Some((Compiler::parse_call, BindingPower::Call)),
        (LeftBracket, OperatorType::Infix) => {
            Some((Compiler::parse_subscript, BindingPower::Call))
        }
        (Plus | Minus, OperatorType::Infix) => Some((Compiler::parse_binary, BindingPower::Term)),
        (Asterisk | Slash | Percent, OperatorType::Infix) => {
            Some((Compiler::parse_binary, BindingPower::Factor))
        }
        (AsteriskAsterisk, OperatorType::Infix) => {
            Some((Compiler::parse_power, BindingPower::Power))
        }
        (EqualEqual | BangEqual, OperatorType::Infix) => {
            Some((Compiler::parse_binary, BindingPower::Equality))
        }
        (Greater | GreaterEqual | Less | LessEqual, OperatorType::Infix) => {
            Some((Compiler::parse_binary, BindingPower::Comparison))
        }
        (GreaterGreater | LessLess, OperatorType::Infix) => {
            Some((Compiler::parse_binary, BindingPower::Shift))
        }
        (Ampersand, OperatorType::Infix) => Some((Compiler::parse_binary, BindingPower::BitAnd)),
        (Caret, OperatorType::Infix) => Some((Compiler::parse_binary, BindingPower::BitXor)),
        (Pipe, OperatorType::Infix) => Some((Compiler::parse_binary, BindingPower::BitOr)),
        (And, OperatorType::Infix) => Some((Compiler::parse_and, BindingPower::And)),
        (Or, OperatorType::Infix) => Some((Compiler::parse_or, BindingPower::Or)),
        _ => None,
    }
}

#[derive(Debug, Copy, Clone)]
enum OperatorType {
    Prefix,
    Infix,
}

type Parser<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool) -> ParseResult<()>;

/// Every error reported while compiling one source, in source order.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct CompileErrors {
    errors: Vec<CompileError>,
}

impl Display for CompileErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl CompileErrors {
    pub fn new() -> Self {
        Self {
            errors: Vec::with_capacity(4),
        }
    }

    fn push(&mut self, e: CompileError) {
        self.errors.push(e)
    }

    pub fn errors(&self) -> &[CompileError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Default for CompileErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    At(String),
    End,
}

impl Display for ErrorLocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorLocation::At(lexeme) => write!(f, " at '{lexeme}'"),
            ErrorLocation::End => write!(f, " at end"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("[line {line}] Error: {error}")]
    Scan { line: usize, error: ScanError },
    #[error("[line {line}] Error{location}: {error}")]
    Parse {
        line: usize,
        location: ErrorLocation,
        error: ParseError,
    },
}

impl CompileError {
    pub fn line(&self) -> usize {
        match self {
            CompileError::Scan { line, .. } | CompileError::Parse { line, .. } => *line,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Expect {0}.")]
    Expect(&'static str),
    #[error("Invalid assignment target.")]
    InvalidAssignmentTarget,
    #[error("Invalid number literal.")]
    InvalidNumber,
    #[error("Can't read local variable in its own initializer.")]
    LocalInOwnInitializer,
    #[error("Already a variable with this name in this scope.")]
    DuplicateLocal,
    #[error("Too many local variables in function.")]
    TooManyLocals,
    #[error("Too many closure variables in function.")]
    TooManyUpvalues,
    #[error("Too many constants in one chunk.")]
    TooManyConstants,
    #[error("Can't have more than 255 parameters.")]
    TooManyParameters,
    #[error("Can't have more than 255 arguments.")]
    TooManyArguments,
    #[error("Can't have more than 255 items in a list.")]
    TooManyListItems,
    #[error("Can't return from top-level code.")]
    ReturnFromTopLevel,
    #[error(transparent)]
    Jump(#[from] JumpError),
}
