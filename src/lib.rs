pub mod insn;
pub mod runtime;
pub mod world;

pub use insn::{CodeBlock, CodeBuilder, CodePos, InsnWord, Label, Opcode, Word};
pub use runtime::{
    escape::{EscapePoint, WindFrame},
    frame::{ContFrame, ContRef, EnvFrame, EnvRef},
    value::{Pair, Str, Symbol, Value},
    vm::{Abort, Machine, MachineArena, MachineExit, SignalFlow, Vm, DEFAULT_SCRATCH_LIMIT},
    Arity, Closure, Condition, ContProc, NativeCtx, Procedure, Subr, SubrFn, SubrReturn,
};
pub use world::{Gloc, Module, World};
