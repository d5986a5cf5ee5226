//! Runtime representation of procedures and the native-call surface
//!
//! The execution machinery itself lives in the submodules: frames in
//! [`frame`], escape points in [`escape`], the register set and run loop in
//! [`vm`], and the native procedures the core ships with in [`base`].

use core::fmt;

use gc_arena::{Collect, Gc, Mutation};

use crate::{
    insn::CodeBlock,
    runtime::{
        escape::{EpPtr, HandlerChain},
        frame::{ContPtr, EnvPtr},
        value::{Str, Value},
        vm::{GuardId, MachineExit, Vm},
    },
    world::World,
};

pub mod base;
pub mod escape;
pub mod frame;
pub mod value;
pub mod vm;

// It is up to the surrounding runtime to decide what is callable; the core
// knows closures, native subrs, and captured continuations.
#[derive(Collect, Debug)]
#[collect(no_drop)]
pub enum Procedure<'gc> {
    Closure(Closure<'gc>),
    Subr(Subr),
    Continuation(ContProc<'gc>),
}

impl<'gc> Procedure<'gc> {
    // report the arity of a procedure
    pub fn arity(&self) -> Arity {
        match self {
            Self::Closure(c) => c.code.arity,
            Self::Subr(s) => s.arity,
            // a continuation takes the single value it resumes with
            Self::Continuation(_) => Arity::Min(0),
        }
    }
}

/// Compiled code together with the environment it closed over. The
/// environment is always heap-resident; closing over a frame is what forces
/// its promotion off the scratch stack.
#[derive(Collect, Clone, Debug)]
#[collect(no_drop)]
pub struct Closure<'gc> {
    pub code: Gc<'gc, CodeBlock<'gc>>,
    pub env: EnvPtr<'gc>,
}

/// A reified continuation: the captured frame chain plus everything needed
/// to re-enter it, any number of times.
#[derive(Collect, Clone, Debug)]
#[collect(no_drop)]
pub struct ContProc<'gc> {
    /// captured chain, down to the base sentinel
    pub cont: Option<ContPtr<'gc>>,
    /// dynamic-wind chain in effect at capture
    pub handlers: HandlerChain<'gc>,
    /// escape points in effect at capture
    pub escape: Option<EpPtr<'gc>>,
    pub xhandler: Value<'gc>,
    /// argument stack as it stood at capture; restored on every invocation
    pub saved_argp: Vec<Value<'gc>>,
    /// native boundary the capture happened under
    pub guard: Option<GuardId>,
}

/// A native procedure: a plain function over the machine state.
///
/// Natives that must run Scheme code either use [`Vm::apply`] or return a
/// [`SubrReturn::Tail`] directive for the running loop to pick up.
#[derive(Collect, Clone, Copy)]
#[collect(require_static)]
pub struct Subr {
    pub name: &'static str,
    pub arity: Arity,
    pub func: SubrFn,
}

impl fmt::Debug for Subr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<subr {}>", self.name)
    }
}

pub type SubrFn = for<'r, 'a, 'gc> fn(
    &'r mut NativeCtx<'a, 'gc>,
    &'r mut Vec<Value<'gc>>,
) -> Result<SubrReturn<'gc>, MachineExit<'gc>>;

/// What a native asks the running loop to do next.
pub enum SubrReturn<'gc> {
    /// Return the value to the caller
    Value(Value<'gc>),
    /// Tail-call a procedure with the given arguments
    Tail(Gc<'gc, Procedure<'gc>>, Vec<Value<'gc>>),
    /// The VM registers were already retargeted (a signal or continuation
    /// transferred control); just keep running
    Transferred,
}

/// Access a native gets to the machine: the mutation handle, the register
/// set, and the module world.
pub struct NativeCtx<'a, 'gc> {
    pub mc: &'a Mutation<'gc>,
    pub vm: &'a mut Vm<'gc>,
    pub world: &'a mut World<'gc>,
}

impl<'a, 'gc> NativeCtx<'a, 'gc> {
    /// Raises an error condition built from `message` and `irritants`,
    /// exactly like `raise` does: if a handler resumed the condition the
    /// resulting value becomes the native's return value.
    pub fn error(
        &mut self,
        message: &str,
        irritants: &[Value<'gc>],
    ) -> Result<SubrReturn<'gc>, MachineExit<'gc>> {
        let condition = self.condition(message, irritants);
        self.raise(condition)
    }

    pub fn condition(&mut self, message: &str, irritants: &[Value<'gc>]) -> Value<'gc> {
        let message = Str(self.world.intern_raw(message));
        Value::Condition(Gc::new(
            self.mc,
            Condition {
                message,
                irritants: irritants.to_vec(),
            },
        ))
    }

    pub fn raise(&mut self, condition: Value<'gc>) -> Result<SubrReturn<'gc>, MachineExit<'gc>> {
        match self.vm.signal(self.mc, self.world, condition)? {
            vm::SignalFlow::Resume(v) => Ok(SubrReturn::Value(v)),
            vm::SignalFlow::Transferred => Ok(SubrReturn::Transferred),
        }
    }
}

/// Procedure arity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Collect)]
#[collect(require_static)]
pub enum Arity {
    Exact(usize),
    Min(usize),
}

impl Arity {
    pub fn is_satisfied(&self, len: usize) -> bool {
        match self {
            Self::Exact(e) => *e == len,
            Self::Min(m) => *m <= len,
        }
    }
}

/// A raiseable error payload. Any value can be signalled; this is merely
/// the shape the core's own errors take.
#[derive(Collect, Clone, Debug)]
#[collect(no_drop)]
pub struct Condition<'gc> {
    pub message: Str,
    pub irritants: Vec<Value<'gc>>,
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::Arity;

    #[test]
    fn arity_satisfaction() {
        check!(Arity::Exact(2).is_satisfied(2));
        check!(!Arity::Exact(2).is_satisfied(3));
        check!(Arity::Min(1).is_satisfied(1));
        check!(Arity::Min(1).is_satisfied(4));
        check!(!Arity::Min(1).is_satisfied(0));
    }
}
