//! Environment and continuation frames
//!
//! Local variable access works the same regardless of where a frame lives:
//!
//! ```text
//! (define (foo x y)
//!    ;; here, x is slot 0 at depth 0, y is slot 1 at depth 0
//!    (let ((a ...) (b ...))
//!       ;; here, a is slot 0 at depth 0, x is slot 0 at depth 1
//!       (lambda (r s)
//!          ;; here, r is slot 0 at depth 0, a is slot 0 at depth 1,
//!          ;;       x is slot 0 at depth 2
//! ```
//!
//! Frames are allocated on a contiguous scratch stack first and copied to
//! individually-owned heap storage when a closure is created over them, when
//! a continuation is captured, or wholesale when the scratch region fills
//! up. Once copied, a frame stays on the heap until it is collected; the
//! slot it vacated keeps a forwarding pointer so every outstanding reference
//! can be rewritten to the new address.
//!
//! The toplevel frame is always a heap frame of size 1 holding the current
//! module, and it is the only frame whose `up` link is empty.

use gc_arena::{Collect, Gc, Mutation, RefLock};

use crate::{
    insn::CodePos,
    runtime::{value::Value, vm::Vm},
};

pub type EnvPtr<'gc> = Gc<'gc, RefLock<EnvFrame<'gc>>>;
// heap continuation frames are immutable snapshots, no lock needed
pub type ContPtr<'gc> = Gc<'gc, ContFrame<'gc>>;

/// One lexical scope's variable storage. `slots` never grows or shrinks
/// after creation: slot `i` names the same source variable for the life of
/// the frame.
#[derive(Collect, Clone, Debug)]
#[collect(no_drop)]
pub struct EnvFrame<'gc> {
    /// static link; empty only for the toplevel frame
    pub up: Option<EnvRef<'gc>>,
    /// opaque debug info
    pub info: Value<'gc>,
    pub slots: Vec<Value<'gc>>,
}

/// One pending non-tail call. Pushed by `PreCall`, popped by `Return`,
/// which restores `env` and `pc`. The argument stack is *not* restored by
/// a normal return; only continuation invocation restores it.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub struct ContFrame<'gc> {
    /// dynamic link, toward the caller; empty at the base sentinel
    pub prev: Option<ContRef<'gc>>,
    /// environment active at the call site
    pub env: EnvRef<'gc>,
    /// resumption point
    pub pc: CodePos<'gc>,
    /// argument-stack depth at the call site
    pub argp_mark: usize,
}

/// Reference to an environment frame, wherever it currently lives.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub enum EnvRef<'gc> {
    Scratch(usize),
    Heap(EnvPtr<'gc>),
}

/// Reference to a continuation frame, wherever it currently lives.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub enum ContRef<'gc> {
    Scratch(usize),
    Heap(ContPtr<'gc>),
}

/// A scratch-stack slot: either a live frame or the forwarding pointer a
/// promotion left behind.
#[derive(Collect, Clone, Debug)]
#[collect(no_drop)]
pub enum ScratchEnv<'gc> {
    Live(EnvFrame<'gc>),
    Moved(EnvPtr<'gc>),
}

#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub enum ScratchCont<'gc> {
    Live(ContFrame<'gc>),
    Moved(ContPtr<'gc>),
}

impl<'gc> Vm<'gc> {
    /// Allocates an environment frame on the scratch stack. May relocate
    /// every scratch-resident frame to the heap first if the region is
    /// full, so do not hold scratch indices across this call.
    pub fn alloc_env(
        &mut self,
        mc: &Mutation<'gc>,
        slots: Vec<Value<'gc>>,
        up: EnvRef<'gc>,
        info: Value<'gc>,
    ) -> EnvRef<'gc> {
        self.reserve_scratch(mc);
        self.scratch_env.push(ScratchEnv::Live(EnvFrame {
            up: Some(up),
            info,
            slots,
        }));
        EnvRef::Scratch(self.scratch_env.len() - 1)
    }

    /// Pushes a continuation frame for a pending non-tail call.
    pub fn push_cont(&mut self, mc: &Mutation<'gc>, pc: CodePos<'gc>) {
        self.reserve_scratch(mc);
        self.scratch_cont.push(ScratchCont::Live(ContFrame {
            prev: self.cont,
            env: self.env,
            pc,
            argp_mark: self.argp.len(),
        }));
        self.cont = Some(ContRef::Scratch(self.scratch_cont.len() - 1));
    }

    /// Reads a continuation frame through either storage class. A
    /// forwarded scratch slot here means a reference escaped the rewrite
    /// pass, which is a bug in this crate, not in user code.
    pub(crate) fn cont_frame(&self, cont: ContRef<'gc>) -> ContFrame<'gc> {
        match cont {
            ContRef::Scratch(i) => match &self.scratch_cont[i] {
                ScratchCont::Live(f) => *f,
                ScratchCont::Moved(_) => unreachable!("stale scratch continuation reference"),
            },
            ContRef::Heap(p) => *p,
        }
    }

    fn env_up(&self, env: EnvRef<'gc>) -> Option<EnvRef<'gc>> {
        match env {
            EnvRef::Scratch(i) => match &self.scratch_env[i] {
                ScratchEnv::Live(f) => f.up,
                ScratchEnv::Moved(_) => unreachable!("stale scratch environment reference"),
            },
            EnvRef::Heap(p) => p.borrow().up,
        }
    }

    fn env_at_depth(&self, env: EnvRef<'gc>, depth: u32) -> EnvRef<'gc> {
        let mut e = env;
        for _ in 0..depth {
            e = self
                .env_up(e)
                .expect("compiled code used a lexical depth past the toplevel");
        }
        e
    }

    /// Reads the local at `(depth, index)`. Out-of-range coordinates are a
    /// compiler bug and panic rather than degrade.
    pub fn env_lookup(&self, env: EnvRef<'gc>, depth: u32, index: u32) -> Value<'gc> {
        match self.env_at_depth(env, depth) {
            EnvRef::Scratch(i) => match &self.scratch_env[i] {
                ScratchEnv::Live(f) => f.slots[index as usize],
                ScratchEnv::Moved(_) => unreachable!("stale scratch environment reference"),
            },
            EnvRef::Heap(p) => p.borrow().slots[index as usize],
        }
    }

    /// Writes the local at `(depth, index)`.
    pub fn env_set(
        &mut self,
        mc: &Mutation<'gc>,
        env: EnvRef<'gc>,
        depth: u32,
        index: u32,
        value: Value<'gc>,
    ) {
        match self.env_at_depth(env, depth) {
            EnvRef::Scratch(i) => match &mut self.scratch_env[i] {
                ScratchEnv::Live(f) => f.slots[index as usize] = value,
                ScratchEnv::Moved(_) => unreachable!("stale scratch environment reference"),
            },
            EnvRef::Heap(p) => p.borrow_mut(mc).slots[index as usize] = value,
        }
    }

    /// Copies a frame (and transitively its whole static chain) to the
    /// heap, leaving forwarding pointers behind. Idempotent: heap frames
    /// and already-moved slots come back unchanged.
    ///
    /// Callers must follow up with [`Vm::rewrite_moved`] before any other
    /// operation can observe the frames involved.
    pub fn promote_env(&mut self, mc: &Mutation<'gc>, env: EnvRef<'gc>) -> EnvPtr<'gc> {
        match env {
            EnvRef::Heap(p) => p,
            EnvRef::Scratch(i) => {
                if let ScratchEnv::Moved(p) = &self.scratch_env[i] {
                    return *p;
                }
                let ScratchEnv::Live(frame) = self.scratch_env[i].clone() else {
                    unreachable!()
                };
                // the parent moves first so a heap frame never points back
                // into the scratch region
                let up = frame.up.map(|u| EnvRef::Heap(self.promote_env(mc, u)));
                let ptr = Gc::new(
                    mc,
                    RefLock::new(EnvFrame {
                        up,
                        info: frame.info,
                        slots: frame.slots,
                    }),
                );
                self.scratch_env[i] = ScratchEnv::Moved(ptr);
                ptr
            }
        }
    }

    /// Heap-copies a continuation frame chain, promoting each frame's
    /// environment along the way. Same forwarding discipline as
    /// [`Vm::promote_env`].
    pub fn promote_cont(&mut self, mc: &Mutation<'gc>, cont: ContRef<'gc>) -> ContPtr<'gc> {
        match cont {
            ContRef::Heap(p) => p,
            ContRef::Scratch(i) => {
                if let ScratchCont::Moved(p) = &self.scratch_cont[i] {
                    return *p;
                }
                let ScratchCont::Live(frame) = self.scratch_cont[i] else {
                    unreachable!()
                };
                let env = EnvRef::Heap(self.promote_env(mc, frame.env));
                let prev = frame.prev.map(|p| ContRef::Heap(self.promote_cont(mc, p)));
                let ptr = Gc::new(
                    mc,
                    ContFrame {
                        prev,
                        env,
                        pc: frame.pc,
                        argp_mark: frame.argp_mark,
                    },
                );
                self.scratch_cont[i] = ScratchCont::Moved(ptr);
                ptr
            }
        }
    }

    fn fwd_env(scratch: &[ScratchEnv<'gc>], env: EnvRef<'gc>) -> EnvRef<'gc> {
        match env {
            EnvRef::Scratch(i) => match &scratch[i] {
                ScratchEnv::Moved(p) => EnvRef::Heap(*p),
                ScratchEnv::Live(_) => env,
            },
            heap => heap,
        }
    }

    fn fwd_cont(scratch: &[ScratchCont<'gc>], cont: ContRef<'gc>) -> ContRef<'gc> {
        match cont {
            ContRef::Scratch(i) => match &scratch[i] {
                ScratchCont::Moved(p) => ContRef::Heap(*p),
                ScratchCont::Live(_) => cont,
            },
            heap => heap,
        }
    }

    /// Rewrites every outstanding reference to a moved frame: the VM
    /// registers, the scratch-resident frames themselves, the native guard
    /// records, and the saved continuation of every escape point reachable
    /// through the active chain *or* the floating chain. The floating walk
    /// is what keeps popped-but-running escape points valid across
    /// relocation.
    pub fn rewrite_moved(&mut self, mc: &Mutation<'gc>) {
        self.env = Self::fwd_env(&self.scratch_env, self.env);
        self.cont = match self.cont {
            Some(c) => Some(Self::fwd_cont(&self.scratch_cont, c)),
            None => None,
        };

        for i in 0..self.scratch_env.len() {
            let up = match &self.scratch_env[i] {
                ScratchEnv::Live(f) => f.up,
                ScratchEnv::Moved(_) => continue,
            };
            let up = up.map(|u| Self::fwd_env(&self.scratch_env, u));
            if let ScratchEnv::Live(f) = &mut self.scratch_env[i] {
                f.up = up;
            }
        }
        for i in 0..self.scratch_cont.len() {
            let (env, prev) = match &self.scratch_cont[i] {
                ScratchCont::Live(f) => (f.env, f.prev),
                ScratchCont::Moved(_) => continue,
            };
            let env = Self::fwd_env(&self.scratch_env, env);
            let prev = prev.map(|p| Self::fwd_cont(&self.scratch_cont, p));
            if let ScratchCont::Live(f) = &mut self.scratch_cont[i] {
                f.env = env;
                f.prev = prev;
            }
        }

        for i in 0..self.guards.len() {
            let g = self.guards[i];
            self.guards[i].env = Self::fwd_env(&self.scratch_env, g.env);
            self.guards[i].cont = g.cont.map(|c| Self::fwd_cont(&self.scratch_cont, c));
        }

        for ep in self.each_escape_point() {
            let cont = ep.borrow().cont;
            let cont = cont.map(|c| Self::fwd_cont(&self.scratch_cont, c));
            ep.borrow_mut(mc).cont = cont;
        }
    }

    /// Makes room on the scratch stack, relocating every live frame to the
    /// heap when the region is full.
    pub(crate) fn reserve_scratch(&mut self, mc: &Mutation<'gc>) {
        if self.scratch_env.len() < self.scratch_limit
            && self.scratch_cont.len() < self.scratch_limit
        {
            return;
        }
        self.relocate(mc);
    }

    /// Promotes everything reachable from the register set, the native
    /// guard records, and both escape-point chains, then resets the
    /// scratch region. Frames nothing points at any more die here.
    pub fn relocate(&mut self, mc: &Mutation<'gc>) {
        tracing::debug!(
            env_frames = self.scratch_env.len(),
            cont_frames = self.scratch_cont.len(),
            "relocating scratch frames to the heap"
        );
        let env = self.env;
        self.env = EnvRef::Heap(self.promote_env(mc, env));
        self.cont = match self.cont {
            Some(c) => Some(ContRef::Heap(self.promote_cont(mc, c))),
            None => None,
        };

        for i in 0..self.guards.len() {
            let g = self.guards[i];
            let env = EnvRef::Heap(self.promote_env(mc, g.env));
            let cont = match g.cont {
                Some(c) => Some(ContRef::Heap(self.promote_cont(mc, c))),
                None => None,
            };
            self.guards[i].env = env;
            self.guards[i].cont = cont;
        }

        for ep in self.each_escape_point() {
            let cont = match ep.borrow().cont {
                Some(c) => Some(ContRef::Heap(self.promote_cont(mc, c))),
                None => None,
            };
            ep.borrow_mut(mc).cont = cont;
        }

        self.scratch_env.clear();
        self.scratch_cont.clear();
    }
}
