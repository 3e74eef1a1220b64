use crate::chunk::{Chunk, Opcode};
use crate::compiler::{compile, CompileErrors};
use crate::config::VmConfig;
use crate::heap::hash_table::{HashTable, TableKey};
use crate::heap::{Heap, ObjClosure, ObjList, ObjNative, ObjRef, ObjUpvalue, Object};
use crate::natives::{NativeContext, NativeFn, Rng, STANDARD_NATIVES};
use crate::value::{whole, Value};
use arrayvec::ArrayVec;
use log::{error, log_enabled, trace, Level};
use num_enum::TryFromPrimitiveError;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

type VmResult<A> = Result<A, VmError>;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

#[derive(Debug)]
struct CallFrame {
    closure: ObjRef,
    chunk: Rc<Chunk>,
    ip: usize,
    /// Stack index of the callee; its arguments follow.
    slots: usize,
}

/// Executes compiled scripts. Globals, interned strings and natives
/// survive from one [`Vm::run`] to the next.
pub struct Vm<W: Write> {
    write: W,
    diagnostics: Box<dyn Write>,
    stack: Box<ArrayVec<Value, STACK_MAX>>,
    frames: ArrayVec<CallFrame, FRAMES_MAX>,
    open_upvalues: BTreeMap<usize, ObjRef>,
    globals: HashTable,
    heap: Heap,
    rng: Rng,
    started: Instant,
}

impl<W: Write> Vm<W> {
    pub fn new(write: W) -> Self {
        Self::with_config(write, VmConfig::default())
    }

    pub fn with_config(write: W, config: VmConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => Rng::new(seed),
            None => Rng::from_time(),
        };
        let mut vm = Self {
            write,
            diagnostics: Box::new(io::stderr()),
            stack: Box::new(ArrayVec::new()),
            frames: ArrayVec::new(),
            open_upvalues: BTreeMap::new(),
            globals: HashTable::new(),
            heap: Heap::new(config.allocator()),
            rng,
            started: Instant::now(),
        };
        for (name, function) in STANDARD_NATIVES {
            vm.define_native(name, *function);
        }
        vm
    }

    /// Where compile and runtime diagnostics from [`Vm::interpret`] go.
    pub fn set_diagnostics(&mut self, diagnostics: impl Write + 'static) {
        self.diagnostics = Box::new(diagnostics);
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        self.collect_if_needed();
        let name = self.heap.intern(name);
        // Keep the name reachable while the native is allocated.
        self.stack.push(Value::Obj(name));
        self.collect_if_needed();
        let native = self.heap.alloc(Object::Native(ObjNative { name, function }));
        self.stack.pop();
        if let Some(key) = self.heap.key(name) {
            self.globals.insert(key, Value::Obj(native));
        }
    }

    /// Runs `source`, reporting any failure on the diagnostics writer.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let (result, message) = match self.run(source) {
            Ok(()) => return InterpretResult::Ok,
            Err(e @ InterpretError::Compile(_)) => (InterpretResult::CompileError, e),
            Err(e @ InterpretError::Runtime(_)) => (InterpretResult::RuntimeError, e),
        };
        if let Err(e) = writeln!(self.diagnostics, "{message}") {
            error!("Error writing diagnostics: {e}");
        }
        result
    }

    pub fn run(&mut self, source: &str) -> Result<(), InterpretError> {
        trace!("Got input string: {source}");
        let roots: Vec<Value> = self.global_roots().collect();
        let function = compile(source, &mut self.heap, &roots)?;

        let result = self.call_script(function).and_then(|()| self.execute());
        result.map_err(|error| {
            let failure = RuntimeFailure {
                error,
                trace: self.stack_trace(),
            };
            self.reset_stack();
            failure.into()
        })
    }

    fn call_script(&mut self, function: ObjRef) -> VmResult<()> {
        self.push(Value::Obj(function))?;
        self.collect_if_needed();
        let closure = self.heap.alloc(Object::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop()?;
        self.push(Value::Obj(closure))?;
        self.call(closure, 0)
    }

    fn execute(&mut self) -> VmResult<()> {
        loop {
            if log_enabled!(Level::Trace) {
                self.trace_instruction();
            }
            let opcode =
                Opcode::try_from(self.read_byte()?).map_err(IncorrectInvariantError::from)?;
            match opcode {
                Opcode::Constant => {
                    let constant = self.read_constant()?;
                    self.push(constant)?;
                }
                Opcode::Null => self.push(Value::Null)?,
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::GetLocal => {
                    let slot = self.read_slot()?;
                    let value = *self
                        .stack
                        .get(slot)
                        .ok_or(IncorrectInvariantError::InvalidSlot(slot))?;
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.read_slot()?;
                    let value = self.peek(0)?;
                    self.set_slot(slot, value)?;
                }
                Opcode::AddSetLocal | Opcode::SubSetLocal => {
                    let slot = self.read_slot()?;
                    let current = *self
                        .stack
                        .get(slot)
                        .ok_or(IncorrectInvariantError::InvalidSlot(slot))?;
                    let value = self.compound(opcode, current)?;
                    self.set_slot(slot, value)?;
                }
                Opcode::GetGlobal => {
                    let key = self.read_key()?;
                    match self.globals.get(key) {
                        Some(value) => self.push(value)?,
                        None => return Err(self.undefined_variable(key)),
                    }
                }
                Opcode::DefineGlobal => {
                    let key = self.read_key()?;
                    let value = self.peek(0)?;
                    self.globals.insert(key, value);
                    self.pop()?;
                }
                Opcode::SetGlobal => {
                    let key = self.read_key()?;
                    let value = self.peek(0)?;
                    if self.globals.insert(key, value) {
                        self.globals.delete(key);
                        return Err(self.undefined_variable(key));
                    }
                }
                Opcode::AddSetGlobal | Opcode::SubSetGlobal => {
                    let key = self.read_key()?;
                    let Some(current) = self.globals.get(key) else {
                        return Err(self.undefined_variable(key));
                    };
                    let value = self.compound(opcode, current)?;
                    self.globals.insert(key, value);
                }
                Opcode::GetUpvalue => {
                    let upvalue = self.read_upvalue_ref()?;
                    let value = self.upvalue_value(upvalue)?;
                    self.push(value)?;
                }
                Opcode::SetUpvalue => {
                    let upvalue = self.read_upvalue_ref()?;
                    let value = self.peek(0)?;
                    self.set_upvalue_value(upvalue, value)?;
                }
                Opcode::AddSetUpvalue | Opcode::SubSetUpvalue => {
                    let upvalue = self.read_upvalue_ref()?;
                    let current = self.upvalue_value(upvalue)?;
                    let value = self.compound(opcode, current)?;
                    self.set_upvalue_value(upvalue, value)?;
                }
                Opcode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Boolean(a == b))?;
                }
                Opcode::Greater => self.binary_op(|a, b| a > b, Value::Boolean)?,
                Opcode::Less => self.binary_op(|a, b| a < b, Value::Boolean)?,
                Opcode::Add => match (self.peek(1)?, self.peek(0)?) {
                    (Value::Number(_), Value::Number(_)) => {
                        self.binary_op(|a, b| a + b, Value::Number)?
                    }
                    (Value::Obj(a), Value::Obj(b)) => self.concatenate(a, b)?,
                    _ => return Err(RuntimeError::InvalidAddOperands.into()),
                },
                Opcode::Subtract => self.binary_op(|a, b| a - b, Value::Number)?,
                Opcode::Multiply => self.binary_op(|a, b| a * b, Value::Number)?,
                Opcode::Divide => self.binary_op(|a, b| a / b, Value::Number)?,
                Opcode::Power => self.binary_op(f64::powf, Value::Number)?,
                Opcode::Modulo => self.modulo()?,
                Opcode::BitAnd => self.bitwise_op(|a, b| a & b, |a, b| a & b)?,
                Opcode::BitOr => self.bitwise_op(|a, b| a | b, |a, b| a | b)?,
                Opcode::BitXor => self.bitwise_op(|a, b| a ^ b, |a, b| a ^ b)?,
                Opcode::ShiftRight => self.bitwise_op(
                    |a, b| (a as i64).wrapping_shr(b as u32) != 0,
                    |a, b| a.wrapping_shr(b as u32),
                )?,
                Opcode::ShiftLeft => self.bitwise_op(
                    |a, b| (a as i64).wrapping_shl(b as u32) != 0,
                    |a, b| a.wrapping_shl(b as u32),
                )?,
                Opcode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Boolean(value.is_falsey()))?
                }
                Opcode::Negate => {
                    let value = match self.pop()? {
                        Value::Number(num) => Value::Number(-num),
                        _ => return Err(RuntimeError::OperandNotNumber.into()),
                    };
                    self.push(value)?;
                }
                Opcode::Type => {
                    let value = self.pop()?;
                    self.print_value(value);
                }
                Opcode::Jump => {
                    let offset = self.read_short()?;
                    self.frame_mut()?.ip += offset as usize;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_short()?;
                    if self.peek(0)?.is_falsey() {
                        self.frame_mut()?.ip += offset as usize;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_short()?;
                    let frame = self.frame_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(offset as usize)
                        .ok_or(IncorrectInvariantError::InvalidJump)?;
                }
                Opcode::Call => {
                    let arg_count = self.read_byte()?;
                    let callee = self.peek(arg_count as usize)?;
                    self.call_value(callee, arg_count)?;
                }
                Opcode::Closure => self.make_closure()?,
                Opcode::CloseUpvalue => {
                    let top = self.stack.len().saturating_sub(1);
                    self.close_upvalues(top);
                    self.pop()?;
                }
                Opcode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or(IncorrectInvariantError::NoFrame)?;
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result)?;
                }
                Opcode::BuildList => self.build_list()?,
                Opcode::GetSubscript => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let (list, index) = self.list_index(target, index)?;
                    let value = self
                        .heap
                        .list(list)
                        .and_then(|l| l.items.get(index).copied())
                        .ok_or(RuntimeError::IndexOutOfRange)?;
                    self.push(value)?;
                }
                Opcode::SetSubscript => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let (list, index) = self.list_index(target, index)?;
                    let slot = self
                        .heap
                        .list_mut(list)
                        .and_then(|l| l.items.get_mut(index))
                        .ok_or(RuntimeError::IndexOutOfRange)?;
                    *slot = value;
                    self.push(value)?;
                }
            }
        }
    }

    fn trace_instruction(&self) {
        trace!("Stack: {:?}", self.stack);
        if let Some(frame) = self.frames.last() {
            match frame.chunk.disassemble_instruction_at(frame.ip, &self.heap) {
                Some(instruction) => trace!("{instruction}"),
                None => trace!("Instruction at {} not found, crash imminent", frame.ip),
            }
        }
    }

    fn print_value(&mut self, value: Value) {
        if let Err(e) = writeln!(self.write, "{}", self.heap.display(value)) {
            error!("Error writing output value: {e}")
        }
    }

    fn frame(&self) -> VmResult<&CallFrame> {
        self.frames
            .last()
            .ok_or_else(|| IncorrectInvariantError::NoFrame.into())
    }

    fn frame_mut(&mut self) -> VmResult<&mut CallFrame> {
        self.frames
            .last_mut()
            .ok_or_else(|| IncorrectInvariantError::NoFrame.into())
    }

    fn read_byte(&mut self) -> VmResult<u8> {
        let frame = self.frame_mut()?;
        let byte = frame.chunk.get(frame.ip).copied().ok_or(
            IncorrectInvariantError::InvalidInstructionPointer {
                pointer: frame.ip,
                chunk_length: frame.chunk.len(),
            },
        )?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_short(&mut self) -> VmResult<u16> {
        let hi = self.read_byte()?;
        let lo = self.read_byte()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_constant(&mut self) -> VmResult<Value> {
        let index = self.read_byte()?;
        let constant = self
            .frame()?
            .chunk
            .get_constant(index)
            .copied()
            .ok_or(IncorrectInvariantError::InvalidConstant { index })?;
        Ok(constant)
    }

    fn read_key(&mut self) -> VmResult<TableKey> {
        let constant = self.read_constant()?;
        constant
            .as_obj()
            .and_then(|obj| self.heap.key(obj))
            .ok_or_else(|| IncorrectInvariantError::InvalidTypes("global name").into())
    }

    /// Reads a local slot operand and makes it absolute.
    fn read_slot(&mut self) -> VmResult<usize> {
        let slot = self.read_byte()? as usize;
        Ok(self.frame()?.slots + slot)
    }

    fn set_slot(&mut self, slot: usize, value: Value) -> VmResult<()> {
        let target = self
            .stack
            .get_mut(slot)
            .ok_or(IncorrectInvariantError::InvalidSlot(slot))?;
        *target = value;
        Ok(())
    }

    fn read_upvalue_ref(&mut self) -> VmResult<ObjRef> {
        let index = self.read_byte()? as usize;
        let closure = self.frame()?.closure;
        self.heap
            .closure(closure)
            .and_then(|c| c.upvalues.get(index).copied())
            .ok_or_else(|| IncorrectInvariantError::InvalidUpvalue(index).into())
    }

    fn upvalue_value(&self, upvalue: ObjRef) -> VmResult<Value> {
        match self.heap.upvalue(upvalue) {
            Some(ObjUpvalue::Open(slot)) => self
                .stack
                .get(*slot)
                .copied()
                .ok_or_else(|| IncorrectInvariantError::InvalidSlot(*slot).into()),
            Some(ObjUpvalue::Closed(value)) => Ok(*value),
            None => Err(IncorrectInvariantError::InvalidTypes("upvalue").into()),
        }
    }

    fn set_upvalue_value(&mut self, upvalue: ObjRef, value: Value) -> VmResult<()> {
        match self.heap.upvalue_mut(upvalue) {
            Some(ObjUpvalue::Open(slot)) => {
                let slot = *slot;
                self.set_slot(slot, value)
            }
            Some(ObjUpvalue::Closed(closed)) => {
                *closed = value;
                Ok(())
            }
            None => Err(IncorrectInvariantError::InvalidTypes("upvalue").into()),
        }
    }

    /// Applies `+=`/`-=` to `current`, leaving the result on the stack in
    /// place of the operand.
    fn compound(&mut self, opcode: Opcode, current: Value) -> VmResult<Value> {
        let operand = self.pop()?;
        let adding = matches!(
            opcode,
            Opcode::AddSetLocal | Opcode::AddSetGlobal | Opcode::AddSetUpvalue
        );
        let value = match (current, operand) {
            (Value::Number(a), Value::Number(b)) if adding => Value::Number(a + b),
            (Value::Number(a), Value::Number(b)) => Value::Number(a - b),
            _ if adding => return Err(RuntimeError::AddAssignNotNumber.into()),
            _ => return Err(RuntimeError::SubtractAssignNotNumber.into()),
        };
        self.push(value)?;
        Ok(value)
    }

    fn undefined_variable(&self, key: TableKey) -> VmError {
        let name = self.heap.str(key.obj).unwrap_or_default().to_string();
        RuntimeError::UndefinedVariable(name).into()
    }

    fn push(&mut self, value: Value) -> VmResult<()> {
        self.stack
            .try_push(value)
            .map_err(|_| RuntimeError::StackOverflow.into())
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| IncorrectInvariantError::StackUnderflow.into())
    }

    fn peek(&self, distance: usize) -> VmResult<Value> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|idx| self.stack.get(idx))
            .copied()
            .ok_or_else(|| IncorrectInvariantError::StackUnderflow.into())
    }

    fn binary_op<T>(&mut self, f: impl Fn(f64, f64) -> T, v: fn(T) -> Value) -> VmResult<()> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1)?, self.peek(0)?) else {
            return Err(RuntimeError::OperandsNotNumbers.into());
        };
        self.pop()?;
        self.pop()?;
        self.push(v(f(a, b)))
    }

    fn modulo(&mut self) -> VmResult<()> {
        let (Value::Number(a), Value::Number(b)) = (self.peek(1)?, self.peek(0)?) else {
            return Err(RuntimeError::OperandsNotNumbers.into());
        };
        let (Some(a), Some(b)) = (whole(a), whole(b)) else {
            return Err(RuntimeError::ModuloNotIntegers.into());
        };
        if b == 0 {
            return Err(RuntimeError::ModuloByZero.into());
        }
        self.pop()?;
        self.pop()?;
        self.push(Value::Number(a.wrapping_rem(b) as f64))
    }

    fn bitwise_op(
        &mut self,
        on_bools: impl Fn(bool, bool) -> bool,
        on_ints: impl Fn(i64, i64) -> i64,
    ) -> VmResult<()> {
        let result = match (self.peek(1)?, self.peek(0)?) {
            (Value::Boolean(a), Value::Boolean(b)) => Value::Boolean(on_bools(a, b)),
            (Value::Number(a), Value::Number(b)) => match (whole(a), whole(b)) {
                (Some(a), Some(b)) => Value::Number(on_ints(a, b) as f64),
                _ => return Err(RuntimeError::BitwiseOnFloats.into()),
            },
            _ => return Err(RuntimeError::BitwiseOperands.into()),
        };
        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn concatenate(&mut self, a: ObjRef, b: ObjRef) -> VmResult<()> {
        let joined = match (self.heap.str(a), self.heap.str(b)) {
            (Some(a), Some(b)) => format!("{a}{b}"),
            _ => return Err(RuntimeError::InvalidAddOperands.into()),
        };
        // Both operands stay on the stack until the result exists.
        self.collect_if_needed();
        let value = Value::Obj(self.heap.intern_owned(joined));
        self.pop()?;
        self.pop()?;
        self.push(value)
    }

    fn list_index(&self, target: Value, index: Value) -> VmResult<(ObjRef, usize)> {
        let list = target
            .as_obj()
            .filter(|obj| self.heap.list(*obj).is_some())
            .ok_or(RuntimeError::NotAList)?;
        let index = index.as_integer().ok_or(RuntimeError::IndexNotInteger)?;
        let index = self
            .heap
            .list(list)
            .and_then(|l| l.resolve_index(index))
            .ok_or(RuntimeError::IndexOutOfRange)?;
        Ok((list, index))
    }

    fn build_list(&mut self) -> VmResult<()> {
        let count = self.read_byte()? as usize;
        let start = self
            .stack
            .len()
            .checked_sub(count)
            .ok_or(IncorrectInvariantError::StackUnderflow)?;
        let items = self.stack[start..].to_vec();
        // The items are still on the stack while the list is allocated.
        self.collect_if_needed();
        let list = self.heap.alloc(Object::List(ObjList { items }));
        self.stack.truncate(start);
        self.push(Value::Obj(list))
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> VmResult<()> {
        let Value::Obj(obj) = callee else {
            return Err(RuntimeError::NotCallable.into());
        };
        match self.heap.get(obj) {
            Some(Object::Closure(_)) => self.call(obj, arg_count),
            Some(Object::Native(native)) => {
                let function = native.function;
                self.call_native(function, arg_count)
            }
            _ => Err(RuntimeError::NotCallable.into()),
        }
    }

    fn call(&mut self, closure: ObjRef, arg_count: u8) -> VmResult<()> {
        let function = self
            .heap
            .closure(closure)
            .and_then(|c| self.heap.function(c.function))
            .ok_or(IncorrectInvariantError::InvalidTypes("closure"))?;
        if function.arity != arg_count {
            return Err(RuntimeError::ArityMismatch {
                expected: function.arity,
                got: arg_count,
            }
            .into());
        }
        let chunk = Rc::clone(&function.chunk);
        let slots = self
            .stack
            .len()
            .checked_sub(arg_count as usize + 1)
            .ok_or(IncorrectInvariantError::StackUnderflow)?;
        self.frames
            .try_push(CallFrame {
                closure,
                chunk,
                ip: 0,
                slots,
            })
            .map_err(|_| RuntimeError::StackOverflow.into())
    }

    fn call_native(&mut self, function: NativeFn, arg_count: u8) -> VmResult<()> {
        // Natives allocate without collecting; their arguments are rooted
        // on the stack until the call returns.
        self.collect_if_needed();
        let callee = self
            .stack
            .len()
            .checked_sub(arg_count as usize + 1)
            .ok_or(IncorrectInvariantError::StackUnderflow)?;
        let mut ctx = NativeContext {
            heap: &mut self.heap,
            rng: &mut self.rng,
            started: self.started,
        };
        let result = function(&mut ctx, &self.stack[callee + 1..])?;
        self.stack.truncate(callee);
        self.push(result)
    }

    fn make_closure(&mut self) -> VmResult<()> {
        let constant = self.read_constant()?;
        let (function, upvalue_count) = constant
            .as_obj()
            .and_then(|obj| Some((obj, self.heap.function(obj)?.upvalue_count)))
            .ok_or(IncorrectInvariantError::InvalidTypes("function"))?;
        self.collect_if_needed();
        let closure = self.heap.alloc(Object::Closure(ObjClosure {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        // On the stack before capturing, so collections see it.
        self.push(Value::Obj(closure))?;

        for _ in 0..upvalue_count {
            let is_local = self.read_byte()? == 1;
            let index = self.read_byte()? as usize;
            let upvalue = if is_local {
                let slot = self.frame()?.slots + index;
                self.capture_upvalue(slot)
            } else {
                let enclosing = self.frame()?.closure;
                self.heap
                    .closure(enclosing)
                    .and_then(|c| c.upvalues.get(index).copied())
                    .ok_or(IncorrectInvariantError::InvalidUpvalue(index))?
            };
            self.heap
                .closure_mut(closure)
                .ok_or(IncorrectInvariantError::InvalidTypes("closure"))?
                .upvalues
                .push(upvalue);
        }
        Ok(())
    }

    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        if let Some(upvalue) = self.open_upvalues.get(&slot) {
            return *upvalue;
        }
        self.collect_if_needed();
        let upvalue = self.heap.alloc(Object::Upvalue(ObjUpvalue::Open(slot)));
        self.open_upvalues.insert(slot, upvalue);
        upvalue
    }

    /// Closes every open upvalue pointing at `last` or above.
    fn close_upvalues(&mut self, last: usize) {
        let closing = self.open_upvalues.split_off(&last);
        for (slot, upvalue) in closing {
            let value = self.stack.get(slot).copied().unwrap_or(Value::Null);
            if let Some(upvalue) = self.heap.upvalue_mut(upvalue) {
                *upvalue = ObjUpvalue::Closed(value);
            }
        }
    }

    fn global_roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.globals
            .iter()
            .flat_map(|(key, value)| [Value::Obj(key.obj), value])
    }

    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = self
            .stack
            .iter()
            .copied()
            .chain(self.frames.iter().map(|frame| Value::Obj(frame.closure)))
            .chain(self.open_upvalues.values().map(|u| Value::Obj(*u)))
            .chain(
                self.globals
                    .iter()
                    .flat_map(|(key, value)| [Value::Obj(key.obj), value]),
            );
        self.heap.collect_garbage(roots);
    }

    fn stack_trace(&self) -> Vec<TraceLine> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let line = frame
                    .chunk
                    .line_at(frame.ip.saturating_sub(1))
                    .unwrap_or_default();
                let function = self
                    .heap
                    .closure(frame.closure)
                    .and_then(|c| self.heap.function(c.function))
                    .and_then(|f| f.name)
                    .and_then(|name| self.heap.str(name))
                    .map(str::to_string);
                TraceLine { line, function }
            })
            .collect()
    }

    fn reset_stack(&mut self) {
        // Closures that escaped the unwound frames keep their captured values.
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }
}

/// One active call at the time of a runtime error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub line: usize,
    /// `None` for the top-level script.
    pub function: Option<String>,
}

impl Display for TraceLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {name}()", self.line),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A runtime error together with the call stack it unwound, innermost
/// call first.
#[derive(Error, Debug, Clone)]
pub struct RuntimeFailure {
    pub error: VmError,
    pub trace: Vec<TraceLine>,
}

impl Display for RuntimeFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        for line in &self.trace {
            write!(f, "\n{line}")?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone)]
pub enum InterpretError {
    #[error(transparent)]
    Compile(#[from] CompileErrors),
    #[error(transparent)]
    Runtime(#[from] RuntimeFailure),
}

#[derive(Error, Debug, Clone)]
pub enum VmError {
    #[error("Internal error: {0}")]
    IncorrectInvariantError(#[from] IncorrectInvariantError),
    #[error(transparent)]
    RuntimeError(#[from] RuntimeError),
}

#[derive(Error, Debug, Clone)]
pub enum IncorrectInvariantError {
    #[error("invalid opcode? {0}")]
    InvalidOpcode(#[from] TryFromPrimitiveError<Opcode>),
    #[error("invalid constant? {index}")]
    InvalidConstant { index: u8 },
    #[error("invalid instruction pointer {pointer}, max length {chunk_length}")]
    InvalidInstructionPointer { pointer: usize, chunk_length: usize },
    #[error("jump before start of chunk")]
    InvalidJump,
    #[error("stack underflow?")]
    StackUnderflow,
    #[error("no stack slot {0}")]
    InvalidSlot(usize),
    #[error("no upvalue {0}")]
    InvalidUpvalue(usize),
    #[error("no active call frame")]
    NoFrame,
    #[error("invalid compile time types, expected {0}")]
    InvalidTypes(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Stack overflow.")]
    StackOverflow,
    #[error("Operand must be a number.")]
    OperandNotNumber,
    #[error("Operands must be numbers.")]
    OperandsNotNumbers,
    #[error("Operands must be two numbers or two strings.")]
    InvalidAddOperands,
    #[error("Operands of modulo must be integers.")]
    ModuloNotIntegers,
    #[error("Modulo by zero.")]
    ModuloByZero,
    #[error("Operands of bitwise operator must be integers not floats.")]
    BitwiseOnFloats,
    #[error("Operands of a bitwise operator must be an integer or a boolean.")]
    BitwiseOperands,
    #[error("Trying to add with '+=' to a variable which is not a number.")]
    AddAssignNotNumber,
    #[error("Trying to subtract with '-=' to a variable which is not a number.")]
    SubtractAssignNotNumber,
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch { expected: u8, got: u8 },
    #[error("Can only call functions.")]
    NotCallable,
    #[error("Can only index lists.")]
    NotAList,
    #[error("List index must be an integer.")]
    IndexNotInteger,
    #[error("List index out of range.")]
    IndexOutOfRange,
    #[error("{0}")]
    Native(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Vm<Vec<u8>> {
        Vm::with_config(
            Vec::new(),
            VmConfig {
                seed: Some(1),
                ..VmConfig::default()
            },
        )
    }

    fn output(vm: &mut Vm<Vec<u8>>) -> String {
        String::from_utf8(std::mem::take(&mut vm.write)).unwrap()
    }

    fn runtime_failure(vm: &mut Vm<Vec<u8>>, source: &str) -> RuntimeFailure {
        match vm.run(source) {
            Err(InterpretError::Runtime(failure)) => failure,
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut vm = vm();
        vm.run("let a = 1;").unwrap();
        vm.run("a += 2; type a;").unwrap();
        assert_eq!(output(&mut vm), "3\n");
    }

    #[test]
    fn stack_trace_lists_active_calls() {
        let mut vm = vm();
        let source = "def inner() {\n  return 1 - null;\n}\ndef outer() {\n  inner();\n}\nouter();";
        let failure = runtime_failure(&mut vm, source);
        assert_eq!(
            failure.to_string(),
            "Operands must be numbers.\n[line 2] in inner()\n[line 5] in outer()\n[line 7] in script"
        );
    }

    #[test]
    fn usable_after_runtime_error() {
        let mut vm = vm();
        let failure = runtime_failure(&mut vm, "let a = 1; type b;");
        assert_eq!(failure.to_string(), "Undefined variable 'b'.\n[line 1] in script");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
        vm.run("type a;").unwrap();
        assert_eq!(output(&mut vm), "1\n");
    }

    #[test]
    fn failed_assignment_does_not_define() {
        let mut vm = vm();
        runtime_failure(&mut vm, "b = 1;");
        let failure = runtime_failure(&mut vm, "type b;");
        assert!(matches!(
            failure.error,
            VmError::RuntimeError(RuntimeError::UndefinedVariable(_))
        ));
    }

    #[test]
    fn deep_recursion_overflows() {
        let mut vm = vm();
        let failure = runtime_failure(&mut vm, "def f() { return f(); } f();");
        assert!(matches!(
            failure.error,
            VmError::RuntimeError(RuntimeError::StackOverflow)
        ));
        assert_eq!(failure.trace.len(), FRAMES_MAX);
    }

    #[test]
    fn interpret_reports_result_kinds() {
        let mut vm = vm();
        vm.set_diagnostics(io::sink());
        assert_eq!(vm.interpret("type 1;"), InterpretResult::Ok);
        assert_eq!(vm.interpret("type ;"), InterpretResult::CompileError);
        assert_eq!(vm.interpret("type -null;"), InterpretResult::RuntimeError);
        assert_eq!(output(&mut vm), "1\n");
    }

    #[test]
    fn host_natives() {
        fn answer(_: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, RuntimeError> {
            Ok(Value::Number(42.0))
        }
        let mut vm = vm();
        vm.define_native("answer", answer);
        vm.run("type answer(); type answer;").unwrap();
        assert_eq!(output(&mut vm), "42\n<native fn>\n");
    }

    #[test]
    fn upvalues_close_over_loop_variables() {
        let mut vm = vm();
        let source = "
            let fns = [null, null];
            for (let i = 0; i < 2; i += 1) {
                let j = i;
                def f() { return j; }
                fns[i] = f;
            }
            type fns[0]();
            type fns[1]();";
        vm.run(source).unwrap();
        assert_eq!(output(&mut vm), "0\n1\n");
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn collection_under_stress_keeps_live_objects() {
        let config = VmConfig {
            gc_stress: true,
            seed: Some(1),
            ..VmConfig::default()
        };
        let mut vm = Vm::with_config(Vec::new(), config);
        let source = "
            def make(n) {
                let items = [];
                let s = \"\";
                for (let i = 0; i < n; i += 1) { s = s + \"x\"; }
                def get() { return s; }
                return get;
            }
            let g = make(5);
            for (let i = 0; i < 50; i += 1) { make(3); }
            type g();";
        vm.run(source).unwrap();
        assert_eq!(output(&mut vm), "xxxxx\n");
        // Only the natives, globals and their reachable objects remain.
        let before = vm.heap.object_count();
        vm.run("g = null;").unwrap();
        vm.collect_if_needed();
        assert!(vm.heap.object_count() < before);
    }
}
