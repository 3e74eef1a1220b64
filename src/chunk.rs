use crate::heap::{Heap, Object};
use crate::value::Value;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Deref;
use thiserror::Error;

pub const MAX_CONSTANTS: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Constant,
    Null,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    AddSetLocal,
    SubSetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    AddSetGlobal,
    SubSetGlobal,
    GetUpvalue,
    SetUpvalue,
    AddSetUpvalue,
    SubSetUpvalue,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Power,
    BitAnd,
    BitOr,
    BitXor,
    ShiftRight,
    ShiftLeft,
    Not,
    Negate,
    Type,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Closure,
    CloseUpvalue,
    Return,
    BuildList,
    GetSubscript,
    SetSubscript,
}

impl Opcode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JumpError {
    #[error("Too much code to jump over.")]
    TooFar,
    #[error("Loop body too large.")]
    LoopTooLarge,
}

#[derive(Default, Clone)]
pub struct Chunk {
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn add_opcode(&mut self, opcode: Opcode, line: usize) {
        self.add_byte(opcode.as_byte(), line)
    }

    pub fn add_opcode_and_operand(&mut self, opcode: Opcode, operand: u8, line: usize) {
        self.add_byte(opcode.as_byte(), line);
        self.add_byte(operand, line);
    }

    /// Returns the pool index of `value`, reusing an equal constant if one
    /// is already present. `None` once the pool is full.
    pub fn add_constant(&mut self, value: Value) -> Option<u8> {
        let existing_index = self
            .constants
            .iter()
            .enumerate()
            .find_map(|(idx, c)| (*c == value).then_some(idx));
        if let Some(idx) = existing_index {
            return Some(idx as u8);
        }
        if self.constants.len() < MAX_CONSTANTS {
            self.constants.push(value);
            Some((self.constants.len() - 1) as u8)
        } else {
            None
        }
    }

    pub fn get_constant(&self, index: u8) -> Option<&Value> {
        self.constants.get(index as usize)
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn line_at(&self, offset: usize) -> Option<usize> {
        self.lines.get(offset).copied()
    }

    pub fn get_loop_start(&self) -> usize {
        self.code.len()
    }

    /// Emits `opcode` with a placeholder operand, returning the operand's
    /// offset for [`Chunk::patch_jump`].
    pub fn add_dummy_jump(&mut self, opcode: Opcode, line: usize) -> usize {
        self.add_opcode(opcode, line);
        self.add_byte(0xff, line);
        self.add_byte(0xff, line);
        self.code.len() - 2
    }

    pub fn patch_jump(&mut self, offset: usize) -> Result<(), JumpError> {
        let jump = self.code.len() - offset - 2;
        let jump = u16::try_from(jump).map_err(|_| JumpError::TooFar)?;
        let [hi, lo] = jump.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize, line: usize) -> Result<(), JumpError> {
        self.add_opcode(Opcode::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        let offset = u16::try_from(offset).map_err(|_| JumpError::LoopTooLarge)?;
        let [hi, lo] = offset.to_be_bytes();
        self.add_byte(hi, line);
        self.add_byte(lo, line);
        Ok(())
    }

    pub fn read_short(&self, offset: usize) -> Option<u16> {
        let hi = *self.code.get(offset)?;
        let lo = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Approximate heap footprint, used for collection accounting.
    pub fn byte_size(&self) -> usize {
        self.code.capacity()
            + self.lines.capacity() * std::mem::size_of::<usize>()
            + self.constants.capacity() * std::mem::size_of::<Value>()
    }

    /// Width in bytes of the instruction at `offset`, operands included.
    pub fn instruction_len(&self, offset: usize, heap: &Heap) -> usize {
        let Some(opcode) = self.opcode_at(offset) else {
            return 1;
        };
        match opcode {
            Opcode::Constant
            | Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::AddSetLocal
            | Opcode::SubSetLocal
            | Opcode::GetGlobal
            | Opcode::DefineGlobal
            | Opcode::SetGlobal
            | Opcode::AddSetGlobal
            | Opcode::SubSetGlobal
            | Opcode::GetUpvalue
            | Opcode::SetUpvalue
            | Opcode::AddSetUpvalue
            | Opcode::SubSetUpvalue
            | Opcode::Call
            | Opcode::BuildList => 2,
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::Loop => 3,
            Opcode::Closure => 2 + 2 * self.closure_upvalue_count(offset, heap),
            _ => 1,
        }
    }

    fn opcode_at(&self, offset: usize) -> Option<Opcode> {
        Opcode::try_from(*self.code.get(offset)?).ok()
    }

    fn closure_upvalue_count(&self, offset: usize, heap: &Heap) -> usize {
        self.code
            .get(offset + 1)
            .and_then(|idx| self.get_constant(*idx))
            .and_then(Value::as_obj)
            .and_then(|obj| match heap.get(obj) {
                Some(Object::Function(function)) => Some(function.upvalue_count),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn disassemble<'c>(&'c self, name: &'c str, heap: &'c Heap) -> Disassembly<'c> {
        Disassembly {
            chunk: self,
            name,
            heap,
        }
    }

    pub fn disassemble_instruction_at<'c>(
        &'c self,
        offset: usize,
        heap: &'c Heap,
    ) -> Option<InstructionDisplay<'c>> {
        (offset < self.code.len()).then_some(InstructionDisplay {
            chunk: self,
            offset,
            heap,
        })
    }

    fn write_instruction(&self, f: &mut Formatter<'_>, offset: usize, heap: &Heap) -> fmt::Result {
        let byte = self.code[offset];
        let Ok(opcode) = Opcode::try_from(byte) else {
            return write!(f, "Unknown opcode 0x{byte:02x}");
        };
        let operand = self.code.get(offset + 1).copied();
        match opcode {
            Opcode::Constant
            | Opcode::GetGlobal
            | Opcode::DefineGlobal
            | Opcode::SetGlobal
            | Opcode::AddSetGlobal
            | Opcode::SubSetGlobal => self.write_constant(f, opcode, operand, heap),
            Opcode::GetLocal
            | Opcode::SetLocal
            | Opcode::AddSetLocal
            | Opcode::SubSetLocal
            | Opcode::GetUpvalue
            | Opcode::SetUpvalue
            | Opcode::AddSetUpvalue
            | Opcode::SubSetUpvalue
            | Opcode::Call
            | Opcode::BuildList => match operand {
                Some(idx) => write!(f, "{opcode:?} {idx}"),
                None => write!(f, "{opcode:?} (unknown)"),
            },
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::Loop => {
                match self.read_short(offset + 1) {
                    Some(jump) => {
                        let next = offset + 3;
                        let target = if opcode == Opcode::Loop {
                            next.wrapping_sub(jump as usize)
                        } else {
                            next + jump as usize
                        };
                        write!(f, "{opcode:?} 0x{offset:04x} -> 0x{target:04x}")
                    }
                    None => write!(f, "{opcode:?} (unknown)"),
                }
            }
            Opcode::Closure => {
                self.write_constant(f, opcode, operand, heap)?;
                let upvalues = self.closure_upvalue_count(offset, heap);
                for i in 0..upvalues {
                    let at = offset + 2 + 2 * i;
                    match (self.code.get(at), self.code.get(at + 1)) {
                        (Some(is_local), Some(index)) => write!(
                            f,
                            "\n            |   {} {index}",
                            if *is_local == 1 { "local" } else { "upvalue" }
                        )?,
                        _ => write!(f, "\n            |   (unknown)")?,
                    }
                }
                Ok(())
            }
            _ => write!(f, "{opcode:?}"),
        }
    }

    fn write_constant(
        &self,
        f: &mut Formatter<'_>,
        opcode: Opcode,
        operand: Option<u8>,
        heap: &Heap,
    ) -> fmt::Result {
        match operand {
            Some(idx) => match self.get_constant(idx) {
                Some(value) => write!(f, "{opcode:?} {idx} '{}'", heap.display(*value)),
                None => write!(f, "{opcode:?} (index 0x{idx:02x} unknown)"),
            },
            None => write!(f, "{opcode:?} (unknown)"),
        }
    }
}

pub struct Disassembly<'c> {
    chunk: &'c Chunk,
    name: &'c str,
    heap: &'c Heap,
}

impl Display for Disassembly<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.name)?;
        let mut previous_line: Option<usize> = None;
        let mut offset = 0;
        while offset < self.chunk.code.len() {
            let line = self.chunk.lines[offset];
            write!(f, "0x{offset:04x} ")?;
            if previous_line == Some(line) {
                write!(f, "   | ")?;
            } else {
                write!(f, "{line:04} ")?;
                previous_line = Some(line);
            }
            self.chunk.write_instruction(f, offset, self.heap)?;
            writeln!(f)?;
            offset += self.chunk.instruction_len(offset, self.heap);
        }
        Ok(())
    }
}

pub struct InstructionDisplay<'c> {
    chunk: &'c Chunk,
    offset: usize,
    heap: &'c Heap,
}

impl Display for InstructionDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let offset = self.offset;
        write!(f, "0x{offset:04x} {:04} ", self.chunk.lines[offset])?;
        self.chunk.write_instruction(f, offset, self.heap)
    }
}

impl Debug for Chunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("code", &self.code)
            .field("lines", &self.lines)
            .field("constants", &self.constants)
            .finish()
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.code
    }
}
