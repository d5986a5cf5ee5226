//! Instruction words and code blocks
//!
//! An instruction is a single tagged machine word: the low 4 bits carry the
//! instruction tag, the next 8 bits the opcode, and up to two small operands
//! are packed contiguously above bit 12 (10 bits each when both are present,
//! the whole high field when only one is). Code blocks are flat word
//! sequences where a word is either an instruction or a literal datum that
//! the preceding instruction consumes.

use gc_arena::{Collect, Gc, Mutation};

use crate::runtime::{value::Value, Arity};

/// Tag marking a word as an instruction rather than an object reference.
pub const INSN_TAG: u64 = 0x0e;

const TAG_MASK: u64 = 0x0f;
const CODE_SHIFT: u32 = 4;
const CODE_MASK: u64 = 0xff;
const ARG0_SHIFT: u32 = 12;
const ARG1_SHIFT: u32 = 22;

/// Largest value an operand may take when two operands share the word.
pub const MAX_OPERAND: u32 = 0x3ff;

/// One encoded instruction. Packing and unpacking are plain shifts and
/// masks; an operand too wide for its field is a compiler bug and asserts.
#[derive(Collect, Clone, Copy, Debug, PartialEq, Eq)]
#[collect(require_static)]
pub struct InsnWord(u64);

impl InsnWord {
    pub fn encode0(op: Opcode) -> Self {
        Self(((op as u64) << CODE_SHIFT) | INSN_TAG)
    }

    pub fn encode1(op: Opcode, arg: u32) -> Self {
        Self(((arg as u64) << ARG0_SHIFT) | ((op as u64) << CODE_SHIFT) | INSN_TAG)
    }

    pub fn encode2(op: Opcode, arg0: u32, arg1: u32) -> Self {
        assert!(
            arg0 <= MAX_OPERAND && arg1 <= MAX_OPERAND,
            "instruction operand out of range: {op:?} {arg0} {arg1}"
        );
        Self(
            ((arg1 as u64) << ARG1_SHIFT)
                | ((arg0 as u64) << ARG0_SHIFT)
                | ((op as u64) << CODE_SHIFT)
                | INSN_TAG,
        )
    }

    /// True if a raw word carries the instruction tag.
    pub fn is_insn_word(raw: u64) -> bool {
        raw & TAG_MASK == INSN_TAG
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn code(self) -> u8 {
        ((self.0 >> CODE_SHIFT) & CODE_MASK) as u8
    }

    /// The whole operand field, for single-operand instructions.
    pub fn arg(self) -> u32 {
        (self.0 >> ARG0_SHIFT) as u32
    }

    pub fn arg0(self) -> u32 {
        ((self.0 >> ARG0_SHIFT) as u32) & MAX_OPERAND
    }

    pub fn arg1(self) -> u32 {
        ((self.0 >> ARG1_SHIFT) as u32) & MAX_OPERAND
    }
}

/// The operations the execution core itself needs. Anything richer belongs
/// to the compiler that emits the stream, not to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    /// val0 = following datum
    Const = 1,
    /// push val0 onto the argument stack
    Push = 2,
    /// val0 = local at (depth, index)
    LRef = 3,
    /// local at (depth, index) = val0
    LSet = 4,
    /// val0 = global named by the following datum
    GRef = 5,
    /// global named by the following datum = val0
    GSet = 6,
    /// bind the following datum to val0 in the current module
    Define = 7,
    /// jump to the operand word index
    Branch = 8,
    /// jump if val0 is false
    BranchFalse = 9,
    /// push a continuation frame resuming at the operand word index
    PreCall = 10,
    /// call val0 with the top operand-many arguments
    Call = 11,
    /// like Call, but reusing the current frame; never pushes
    TailCall = 12,
    /// pop the current continuation frame
    Return = 13,
    /// val0 = closure over the following code datum and the current environment
    Close = 14,
}

impl Opcode {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Nop,
            1 => Self::Const,
            2 => Self::Push,
            3 => Self::LRef,
            4 => Self::LSet,
            5 => Self::GRef,
            6 => Self::GSet,
            7 => Self::Define,
            8 => Self::Branch,
            9 => Self::BranchFalse,
            10 => Self::PreCall,
            11 => Self::Call,
            12 => Self::TailCall,
            13 => Self::Return,
            14 => Self::Close,
            _ => return None,
        })
    }
}

/// One slot of a code block.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub enum Word<'gc> {
    Insn(InsnWord),
    Datum(Value<'gc>),
}

/// An immutable compiled unit. Blocks are produced by the compiler (or by
/// [`CodeBuilder`] in tests and embedders) and only ever read here.
#[derive(Collect, Debug)]
#[collect(no_drop)]
pub struct CodeBlock<'gc> {
    pub name: String,
    pub arity: Arity,
    pub words: Vec<Word<'gc>>,
}

/// A position in a code block: the resumption-point half of a continuation
/// frame.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub struct CodePos<'gc> {
    pub block: Gc<'gc, CodeBlock<'gc>>,
    pub index: usize,
}

impl<'gc> CodePos<'gc> {
    pub fn start(block: Gc<'gc, CodeBlock<'gc>>) -> Self {
        Self { block, index: 0 }
    }
}

/// Forward-reference label used while assembling a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Assembles code blocks word by word, resolving labels at the end.
pub struct CodeBuilder<'gc> {
    name: String,
    arity: Arity,
    words: Vec<Word<'gc>>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Opcode, Label)>,
}

impl<'gc> CodeBuilder<'gc> {
    pub fn new(name: impl Into<String>, arity: Arity) -> Self {
        Self {
            name: name.into(),
            arity,
            words: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted word.
    pub fn bind(&mut self, label: Label) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.words.len());
    }

    fn emit_jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        self.fixups.push((self.words.len(), op, label));
        self.words.push(Word::Insn(InsnWord::encode1(op, 0)));
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(Opcode::Nop)));
        self
    }

    pub fn constant(&mut self, value: Value<'gc>) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(Opcode::Const)));
        self.words.push(Word::Datum(value));
        self
    }

    pub fn push(&mut self) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(Opcode::Push)));
        self
    }

    pub fn lref(&mut self, depth: u32, index: u32) -> &mut Self {
        self.words
            .push(Word::Insn(InsnWord::encode2(Opcode::LRef, depth, index)));
        self
    }

    pub fn lset(&mut self, depth: u32, index: u32) -> &mut Self {
        self.words
            .push(Word::Insn(InsnWord::encode2(Opcode::LSet, depth, index)));
        self
    }

    fn named(&mut self, op: Opcode, name: Value<'gc>) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(op)));
        self.words.push(Word::Datum(name));
        self
    }

    pub fn gref(&mut self, name: Value<'gc>) -> &mut Self {
        self.named(Opcode::GRef, name)
    }

    pub fn gset(&mut self, name: Value<'gc>) -> &mut Self {
        self.named(Opcode::GSet, name)
    }

    pub fn define(&mut self, name: Value<'gc>) -> &mut Self {
        self.named(Opcode::Define, name)
    }

    pub fn branch(&mut self, label: Label) -> &mut Self {
        self.emit_jump(Opcode::Branch, label)
    }

    pub fn branch_false(&mut self, label: Label) -> &mut Self {
        self.emit_jump(Opcode::BranchFalse, label)
    }

    /// Saves the continuation resuming at `label`, for a non-tail call.
    pub fn pre_call(&mut self, label: Label) -> &mut Self {
        self.emit_jump(Opcode::PreCall, label)
    }

    pub fn call(&mut self, nargs: u32) -> &mut Self {
        self.words
            .push(Word::Insn(InsnWord::encode1(Opcode::Call, nargs)));
        self
    }

    pub fn tail_call(&mut self, nargs: u32) -> &mut Self {
        self.words
            .push(Word::Insn(InsnWord::encode1(Opcode::TailCall, nargs)));
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(Opcode::Return)));
        self
    }

    pub fn close(&mut self, code: Gc<'gc, CodeBlock<'gc>>) -> &mut Self {
        self.words.push(Word::Insn(InsnWord::encode0(Opcode::Close)));
        self.words.push(Word::Datum(Value::Code(code)));
        self
    }

    pub fn finish(mut self, mc: &Mutation<'gc>) -> Gc<'gc, CodeBlock<'gc>> {
        for (at, op, label) in self.fixups.drain(..) {
            let target = self.labels[label.0].expect("unbound label");
            self.words[at] = Word::Insn(InsnWord::encode1(op, target as u32));
        }
        Gc::new(
            mc,
            CodeBlock {
                name: self.name,
                arity: self.arity,
                words: self.words,
            },
        )
    }
}
