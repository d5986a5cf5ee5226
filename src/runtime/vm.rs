//! The VM register set and its fetch-decode-execute loop
//!
//! One `Vm` owns one execution context: the current module, program
//! counter, environment, continuation, value register, argument stack,
//! dynamic-wind chain, both escape-point chains, the native guard stack,
//! and the scratch frame region. Nothing here suspends: a call completes,
//! tail-calls, or performs a full non-local transfer.
//!
//! Native code enters the machine through [`Vm::apply`], which establishes
//! a guard frame (the native boundary) and runs a nested loop over a fresh
//! continuation base. Abrupt transfers across such boundaries are not
//! panics or unwinding: they are [`MachineExit`] values carried up through
//! each level's `Result` until the level they target lands them.

use gc_arena::{Arena, Collect, Gc, Mutation, RefLock, Rootable};

use crate::{
    insn::{CodeBlock, CodePos, Opcode, Word},
    runtime::{
        base,
        escape::{EpPtr, HandlerChain},
        frame::{ContRef, EnvFrame, EnvPtr, EnvRef, ScratchCont, ScratchEnv},
        value::{Str, Value},
        Arity, Closure, Condition, ContProc, NativeCtx, Procedure, SubrReturn,
    },
    world::{ModulePtr, World},
};

/// How many frames the scratch region may hold before live frames are
/// relocated to the heap wholesale.
pub const DEFAULT_SCRATCH_LIMIT: usize = 512;

/// Identity of one native boundary (an `apply` or protected call).
#[derive(Collect, Clone, Copy, Debug, PartialEq, Eq)]
#[collect(require_static)]
pub struct GuardId(u64);

/// Registers saved at a native boundary, restored when the boundary is
/// left — normally or abruptly. Keeping these inside the machine (rather
/// than in native locals) lets frame relocation rewrite them like any
/// other reference.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub(crate) struct GuardFrame<'gc> {
    pub(crate) id: GuardId,
    pub(crate) pc: Option<CodePos<'gc>>,
    pub(crate) env: EnvRef<'gc>,
    pub(crate) cont: Option<ContRef<'gc>>,
    pub(crate) argp_mark: usize,
    pub(crate) handlers: HandlerChain<'gc>,
}

/// The register set of one execution context.
#[derive(Collect)]
#[collect(no_drop)]
pub struct Vm<'gc> {
    /// current global namespace
    pub(crate) module: ModulePtr<'gc>,
    pub(crate) pc: Option<CodePos<'gc>>,
    pub(crate) env: EnvRef<'gc>,
    pub(crate) cont: Option<ContRef<'gc>>,
    pub(crate) val0: Value<'gc>,
    /// argument stack; not restored by normal returns
    pub(crate) argp: Vec<Value<'gc>>,
    /// chain of active dynamic-wind handlers
    pub(crate) handlers: HandlerChain<'gc>,
    /// current escape point
    pub(crate) escape: Option<EpPtr<'gc>>,
    /// floating fallback, used while no escape point is installed
    pub(crate) escape_floating: Option<EpPtr<'gc>>,
    pub(crate) exception_handler: Value<'gc>,
    /// native boundaries, outermost first
    pub(crate) guards: Vec<GuardFrame<'gc>>,
    pub(crate) next_guard: u64,
    pub(crate) scratch_env: Vec<ScratchEnv<'gc>>,
    pub(crate) scratch_cont: Vec<ScratchCont<'gc>>,
    pub(crate) scratch_limit: usize,
    toplevel: EnvPtr<'gc>,
}

/// How the machine leaves a native boundary abnormally.
#[derive(Debug, thiserror::Error)]
pub enum MachineExit<'gc> {
    /// A transfer aimed at an enclosing native boundary; levels between
    /// the transfer site and the target pass it along.
    #[error("non-local transfer unwinding across native frames")]
    Unwind(Transfer<'gc>),
    #[error(transparent)]
    Abort(Abort<'gc>),
}

/// Unrecoverable ends of a computation. These terminate the computation,
/// not the process; the topmost protected call observes them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Abort<'gc> {
    #[error("unhandled condition raised with no escape point installed")]
    NoHandler(Value<'gc>),
    #[error("transfer into a native boundary that already returned")]
    DeadBoundary,
}

/// A pending non-local transfer: where to land and what to restore there.
#[derive(Debug)]
pub struct Transfer<'gc> {
    pub(crate) guard: Option<GuardId>,
    pub(crate) cont: Option<ContRef<'gc>>,
    pub(crate) argp: ArgpRestore<'gc>,
    pub(crate) value: Value<'gc>,
}

#[derive(Debug)]
pub(crate) enum ArgpRestore<'gc> {
    /// cut the argument stack back to a saved depth (escape-point transfer)
    Truncate(usize),
    /// replace it outright (continuation invocation)
    Replace(Vec<Value<'gc>>),
}

/// What `signal` did, from the raise site's point of view.
pub enum SignalFlow<'gc> {
    /// The handler finished and its value comes back to the signal site:
    /// either the point was marked reraised, or it had no saved
    /// continuation to transfer to.
    Resume(Value<'gc>),
    /// The registers were retargeted at the point's saved continuation;
    /// just keep running.
    Transferred,
}

impl<'gc> Vm<'gc> {
    pub(crate) fn new(mc: &Mutation<'gc>, world: &World<'gc>, scratch_limit: usize) -> Self {
        let module = world.user_module();
        // the toplevel frame: size 1, no static link, holding the module
        let toplevel = Gc::new(
            mc,
            RefLock::new(EnvFrame {
                up: None,
                info: Value::Void,
                slots: vec![Value::Module(module)],
            }),
        );
        Vm {
            module,
            pc: None,
            env: EnvRef::Heap(toplevel),
            cont: None,
            val0: Value::Void,
            argp: Vec::new(),
            handlers: None,
            escape: None,
            escape_floating: None,
            exception_handler: Value::Bool(false),
            guards: Vec::new(),
            next_guard: 0,
            scratch_env: Vec::new(),
            scratch_cont: Vec::new(),
            scratch_limit,
            toplevel,
        }
    }

    pub fn toplevel(&self) -> EnvPtr<'gc> {
        self.toplevel
    }

    pub fn current_module(&self) -> ModulePtr<'gc> {
        self.module
    }

    pub fn select_module(&mut self, module: ModulePtr<'gc>) {
        self.module = module;
    }

    pub fn current_cont(&self) -> Option<ContRef<'gc>> {
        self.cont
    }

    pub fn exception_handler(&self) -> Value<'gc> {
        self.exception_handler
    }

    pub(crate) fn set_exception_handler(&mut self, handler: Value<'gc>) {
        self.exception_handler = handler;
    }

    pub fn handler_chain(&self) -> HandlerChain<'gc> {
        self.handlers
    }

    /// Length of the live continuation chain. Diagnostic; a
    /// self-tail-recursive loop keeps this flat no matter how deep it
    /// recurses.
    pub fn continuation_depth(&self) -> usize {
        let mut depth = 0;
        let mut cur = self.cont;
        while let Some(cref) = cur {
            depth += 1;
            cur = self.cont_frame(cref).prev;
        }
        depth
    }

    pub(crate) fn current_guard(&self) -> Option<GuardId> {
        self.guards.last().map(|g| g.id)
    }

    pub(crate) fn guard_alive(&self, id: GuardId) -> bool {
        self.guards.iter().any(|g| g.id == id)
    }

    pub(crate) fn push_guard(&mut self) -> GuardId {
        let id = GuardId(self.next_guard);
        self.next_guard += 1;
        self.guards.push(GuardFrame {
            id,
            pc: self.pc,
            env: self.env,
            cont: self.cont,
            argp_mark: self.argp.len(),
            handlers: self.handlers,
        });
        id
    }

    pub(crate) fn pop_guard(&mut self, id: GuardId) {
        let g = self.guards.pop().expect("native guard stack underflow");
        assert!(g.id == id, "native guards must nest strictly");
        self.pc = g.pc;
        self.env = g.env;
        self.cont = g.cont;
        self.argp.truncate(g.argp_mark);
    }

    /// Pops the current continuation frame, restoring `env` and `pc`. At
    /// the base sentinel this halts the current loop instead.
    pub(crate) fn do_return(&mut self) {
        match self.cont {
            None => self.pc = None,
            Some(cref) => {
                let frame = self.cont_frame(cref);
                self.pc = Some(frame.pc);
                self.env = frame.env;
                self.cont = frame.prev;
            }
        }
    }

    fn land(&mut self, transfer: Transfer<'gc>) {
        self.cont = transfer.cont;
        match transfer.argp {
            ArgpRestore::Truncate(depth) => self.argp.truncate(depth),
            ArgpRestore::Replace(stack) => self.argp = stack,
        }
        self.val0 = transfer.value;
        self.do_return();
    }

    /// Redirects control at `transfer`. Lands immediately when the target
    /// boundary is the current one (or the transfer is boundary-free);
    /// otherwise the transfer propagates outward as an exit value.
    fn transfer_to(&mut self, transfer: Transfer<'gc>) -> Result<(), MachineExit<'gc>> {
        match transfer.guard {
            None => {
                self.land(transfer);
                Ok(())
            }
            Some(id) if self.current_guard() == Some(id) => {
                self.land(transfer);
                Ok(())
            }
            Some(id) if self.guard_alive(id) => Err(MachineExit::Unwind(transfer)),
            Some(_) => Err(MachineExit::Abort(Abort::DeadBoundary)),
        }
    }

    /// Runs `proc` over a fresh continuation base behind a new native
    /// boundary. This is how native code (and the machine's own handler
    /// and dynamic-wind plumbing) calls back into Scheme.
    pub fn apply(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        proc: Gc<'gc, Procedure<'gc>>,
        args: Vec<Value<'gc>>,
    ) -> Result<Value<'gc>, MachineExit<'gc>> {
        let gid = self.push_guard();
        self.pc = None;
        self.cont = None;
        let mut result = match self.invoke_tail(mc, world, proc, args) {
            Ok(()) => self.run_loop(mc, world),
            Err(exit) => Err(exit),
        };
        loop {
            match result {
                Err(MachineExit::Unwind(t)) if t.guard == Some(gid) => {
                    // a transfer aimed at this boundary: land and resume
                    self.land(t);
                    result = self.run_loop(mc, world);
                }
                other => {
                    self.pop_guard(gid);
                    return other;
                }
            }
        }
    }

    /// Transfers control to `proc` in tail position: no continuation frame
    /// is pushed, whatever the recursion depth.
    pub(crate) fn invoke_tail(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        proc: Gc<'gc, Procedure<'gc>>,
        mut args: Vec<Value<'gc>>,
    ) -> Result<(), MachineExit<'gc>> {
        enum Step<'gc> {
            Closure(Closure<'gc>),
            Subr(crate::runtime::Subr),
            Cont(ContProc<'gc>),
        }
        let mut proc = proc;
        loop {
            let step = match &*proc {
                Procedure::Closure(c) => Step::Closure(c.clone()),
                Procedure::Subr(s) => Step::Subr(*s),
                Procedure::Continuation(k) => Step::Cont(k.clone()),
            };
            match step {
                Step::Closure(closure) => {
                    let arity = closure.code.arity;
                    if !arity.is_satisfied(args.len()) {
                        let name = closure.code.name.clone();
                        return self.wrong_arity(mc, world, &name, args);
                    }
                    let slots = match arity {
                        Arity::Exact(_) => args,
                        Arity::Min(required) => {
                            let rest = args.split_off(required);
                            let mut slots = args;
                            slots.push(Value::list(mc, rest));
                            slots
                        }
                    };
                    let info = Value::Code(closure.code);
                    let env = self.alloc_env(mc, slots, EnvRef::Heap(closure.env), info);
                    self.env = env;
                    self.pc = Some(CodePos::start(closure.code));
                    return Ok(());
                }
                Step::Subr(subr) => {
                    if !subr.arity.is_satisfied(args.len()) {
                        return self.wrong_arity(mc, world, subr.name, args);
                    }
                    let ret = {
                        let mut ctx = NativeCtx {
                            mc,
                            vm: self,
                            world,
                        };
                        (subr.func)(&mut ctx, &mut args)?
                    };
                    match ret {
                        SubrReturn::Value(value) => {
                            self.val0 = value;
                            self.do_return();
                            return Ok(());
                        }
                        SubrReturn::Transferred => return Ok(()),
                        SubrReturn::Tail(next, next_args) => {
                            proc = next;
                            args = next_args;
                        }
                    }
                }
                Step::Cont(k) => {
                    let value = args.first().copied().unwrap_or(Value::Void);
                    return self.invoke_continuation(mc, world, &k, value);
                }
            }
        }
    }

    fn wrong_arity(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        name: &str,
        args: Vec<Value<'gc>>,
    ) -> Result<(), MachineExit<'gc>> {
        let message = format!("wrong number of arguments to {name}");
        let condition = make_condition(mc, world, &message, &args);
        match self.signal(mc, world, condition)? {
            SignalFlow::Resume(value) => {
                self.val0 = value;
                self.do_return();
                Ok(())
            }
            SignalFlow::Transferred => Ok(()),
        }
    }

    /// Reifies the current continuation as a multi-shot procedure. The
    /// whole live stack moves to the heap, not just the current chain:
    /// the snapshot also keeps the escape points alive, and their saved
    /// continuations must stay valid however long the snapshot outlives
    /// the scratch region they were born on.
    pub fn capture_continuation(&mut self, mc: &Mutation<'gc>) -> Gc<'gc, Procedure<'gc>> {
        self.relocate(mc);
        let cont = match self.cont {
            None => None,
            Some(ContRef::Heap(p)) => Some(p),
            Some(ContRef::Scratch(_)) => unreachable!("relocation left a scratch frame live"),
        };
        Gc::new(
            mc,
            Procedure::Continuation(ContProc {
                cont,
                handlers: self.handlers,
                escape: self.escape,
                xhandler: self.exception_handler,
                saved_argp: self.argp.clone(),
                guard: self.current_guard(),
            }),
        )
    }

    fn invoke_continuation(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        k: &ContProc<'gc>,
        value: Value<'gc>,
    ) -> Result<(), MachineExit<'gc>> {
        // leave the current dynamic extents and enter the target's before
        // any control moves
        self.unwind_rewind(mc, world, k.handlers)?;
        self.escape = k.escape;
        self.exception_handler = k.xhandler;
        let guard = match k.guard {
            Some(id) if !self.guard_alive(id) => {
                // the boundary the capture ran under has returned;
                // re-enter the chain at the current one
                tracing::trace!("captured boundary gone; re-entering continuation here");
                None
            }
            other => other,
        };
        self.transfer_to(Transfer {
            guard,
            cont: k.cont.map(ContRef::Heap),
            argp: ArgpRestore::Replace(k.saved_argp.clone()),
            value,
        })
    }

    /// Walks the active escape-point chain and dispatches `condition` to
    /// the innermost point.
    ///
    /// The point is popped before its handler runs, so a failure inside
    /// the handler reaches the enclosing point; the popped point stays
    /// reachable through the floating chain until the handler invocation
    /// completes. Depending on the point's protocol flag the dynamic-wind
    /// chain is rewound either before the handler or after it returns —
    /// and not at all if the handler marked the condition reraised, in
    /// which case the handler's value goes back to the signal site.
    pub fn signal(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        condition: Value<'gc>,
    ) -> Result<SignalFlow<'gc>, MachineExit<'gc>> {
        if self.escape.is_none() {
            tracing::error!("condition signalled with no escape point installed");
            return Err(MachineExit::Abort(Abort::NoHandler(condition)));
        }
        let ep = self.pop_for_handler_invocation(mc);
        let snap = *ep.borrow();
        if snap.rewind_before {
            self.unwind_rewind(mc, world, snap.handlers)?;
        }
        ep.borrow_mut(mc).reraised = false;
        tracing::debug!(rewind_before = snap.rewind_before, "dispatching condition");
        // the enclosing point is current while this runs; if the handler
        // transfers or dies the floating link goes with it
        let result = self.apply(mc, world, snap.handler, vec![condition])?;
        let reraised = ep.borrow().reraised;
        if reraised || snap.cont.is_none() {
            self.drop_floating(mc, ep);
            return Ok(SignalFlow::Resume(result));
        }
        if !snap.rewind_before {
            // the point stays on the floating chain while the after
            // thunks run, so a relocation inside one still finds it
            self.unwind_rewind(mc, world, snap.handlers)?;
        }
        self.exception_handler = snap.xhandler;
        // the saved continuation must be re-read from the point itself: a
        // relocation while the handler or the thunks ran rewrote it
        // through the floating chain, and the pre-handler snapshot would
        // be stale
        let cont = ep.borrow().cont;
        self.drop_floating(mc, ep);
        self.transfer_to(Transfer {
            guard: snap.guard,
            cont,
            argp: ArgpRestore::Truncate(snap.argp_mark),
            value: result,
        })?;
        Ok(SignalFlow::Transferred)
    }

    /// Runs the dynamic-wind "after" thunks of every extent being left
    /// (innermost first) and the "before" thunks of every extent being
    /// entered (innermost last), leaving `target` as the active chain.
    pub fn unwind_rewind(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
        target: HandlerChain<'gc>,
    ) -> Result<(), MachineExit<'gc>> {
        use crate::runtime::escape::wind_chain_vec;
        let current = wind_chain_vec(self.handlers);
        let wanted = wind_chain_vec(target);
        let mut shared = 0;
        while shared < current.len() && shared < wanted.len() {
            let a = current[current.len() - 1 - shared];
            let b = wanted[wanted.len() - 1 - shared];
            if Gc::ptr_eq(a, b) {
                shared += 1;
            } else {
                break;
            }
        }
        for frame in &current[..current.len() - shared] {
            // pop before running, so a capture inside the thunk sees the
            // extent as already left
            self.handlers = frame.prev;
            self.apply(mc, world, frame.after, Vec::new())?;
        }
        for frame in wanted[..wanted.len() - shared].iter().rev() {
            self.apply(mc, world, frame.before, Vec::new())?;
            self.handlers = Some(*frame);
        }
        Ok(())
    }

    fn datum(&self, pos: CodePos<'gc>) -> Value<'gc> {
        match pos.block.words[pos.index + 1] {
            Word::Datum(value) => value,
            Word::Insn(_) => unreachable!("instruction stream missing a datum operand"),
        }
    }

    fn advance(&mut self, pos: CodePos<'gc>, by: usize) {
        self.pc = Some(CodePos {
            block: pos.block,
            index: pos.index + by,
        });
    }

    fn jump(&mut self, pos: CodePos<'gc>, target: u32) {
        self.pc = Some(CodePos {
            block: pos.block,
            index: target as usize,
        });
    }

    fn run_loop(
        &mut self,
        mc: &Mutation<'gc>,
        world: &mut World<'gc>,
    ) -> Result<Value<'gc>, MachineExit<'gc>> {
        while let Some(pos) = self.pc {
            let iw = match pos.block.words[pos.index] {
                Word::Insn(iw) => iw,
                Word::Datum(_) => unreachable!("pc landed on a datum word"),
            };
            let op = Opcode::from_code(iw.code()).expect("unknown opcode in instruction stream");
            match op {
                Opcode::Nop => self.advance(pos, 1),
                Opcode::Const => {
                    self.val0 = self.datum(pos);
                    self.advance(pos, 2);
                }
                Opcode::Push => {
                    self.argp.push(self.val0);
                    self.advance(pos, 1);
                }
                Opcode::LRef => {
                    self.val0 = self.env_lookup(self.env, iw.arg0(), iw.arg1());
                    self.advance(pos, 1);
                }
                Opcode::LSet => {
                    let value = self.val0;
                    self.env_set(mc, self.env, iw.arg0(), iw.arg1(), value);
                    self.val0 = Value::Void;
                    self.advance(pos, 1);
                }
                Opcode::GRef => {
                    let name = self
                        .datum(pos)
                        .as_symbol()
                        .expect("global reference operand must be a symbol");
                    self.advance(pos, 2);
                    match world.find_binding(self.module, name, false) {
                        Some(gloc) => self.val0 = gloc.borrow().value,
                        None => {
                            let condition =
                                make_condition(mc, world, "unbound variable", &[Value::Symbol(name)]);
                            if let SignalFlow::Resume(value) = self.signal(mc, world, condition)? {
                                self.val0 = value;
                            }
                        }
                    }
                }
                Opcode::GSet => {
                    let name = self
                        .datum(pos)
                        .as_symbol()
                        .expect("global assignment operand must be a symbol");
                    self.advance(pos, 2);
                    match world.find_binding(self.module, name, false) {
                        Some(gloc) => {
                            gloc.borrow_mut(mc).value = self.val0;
                            self.val0 = Value::Void;
                        }
                        None => {
                            let condition =
                                make_condition(mc, world, "unbound variable", &[Value::Symbol(name)]);
                            if let SignalFlow::Resume(value) = self.signal(mc, world, condition)? {
                                self.val0 = value;
                            }
                        }
                    }
                }
                Opcode::Define => {
                    let name = self
                        .datum(pos)
                        .as_symbol()
                        .expect("definition operand must be a symbol");
                    let value = self.val0;
                    world.define(mc, self.module, name, value);
                    self.val0 = Value::Void;
                    self.advance(pos, 2);
                }
                Opcode::Branch => self.jump(pos, iw.arg()),
                Opcode::BranchFalse => {
                    if self.val0.is_false() {
                        self.jump(pos, iw.arg());
                    } else {
                        self.advance(pos, 1);
                    }
                }
                Opcode::PreCall => {
                    let resume = CodePos {
                        block: pos.block,
                        index: iw.arg() as usize,
                    };
                    self.push_cont(mc, resume);
                    self.advance(pos, 1);
                }
                Opcode::Call | Opcode::TailCall => {
                    let nargs = iw.arg() as usize;
                    assert!(self.argp.len() >= nargs, "argument stack underflow");
                    let args = self.argp.split_off(self.argp.len() - nargs);
                    match self.val0 {
                        Value::Procedure(proc) => self.invoke_tail(mc, world, proc, args)?,
                        other => {
                            let condition =
                                make_condition(mc, world, "call of a non-procedure", &[other]);
                            if let SignalFlow::Resume(value) = self.signal(mc, world, condition)? {
                                self.val0 = value;
                                self.do_return();
                            }
                        }
                    }
                }
                Opcode::Return => self.do_return(),
                Opcode::Close => {
                    let code = match self.datum(pos) {
                        Value::Code(code) => code,
                        _ => unreachable!("closure operand must be code"),
                    };
                    // closures only ever close over heap-stable frames
                    let env = self.promote_env(mc, self.env);
                    self.rewrite_moved(mc);
                    self.val0 =
                        Value::Procedure(Gc::new(mc, Procedure::Closure(Closure { code, env })));
                    self.advance(pos, 2);
                }
            }
        }
        Ok(self.val0)
    }
}

pub(crate) fn make_condition<'gc>(
    mc: &Mutation<'gc>,
    world: &mut World<'gc>,
    message: &str,
    irritants: &[Value<'gc>],
) -> Value<'gc> {
    Value::Condition(Gc::new(
        mc,
        Condition {
            message: Str(world.intern_raw(message)),
            irritants: irritants.to_vec(),
        },
    ))
}

/// One whole execution context: a register set plus the module world it
/// resolves globals in. This is the arena root.
#[derive(Collect)]
#[collect(no_drop)]
pub struct Machine<'gc> {
    pub vm: Vm<'gc>,
    pub world: World<'gc>,
}

pub type MachineArena = Arena<Rootable![Machine<'_>]>;

impl<'gc> Machine<'gc> {
    pub fn new(mc: &Mutation<'gc>) -> Self {
        Self::with_scratch_limit(mc, DEFAULT_SCRATCH_LIMIT)
    }

    pub fn with_scratch_limit(mc: &Mutation<'gc>, scratch_limit: usize) -> Self {
        let mut world = World::new(mc);
        base::install(mc, &mut world);
        let vm = Vm::new(mc, &world, scratch_limit);
        Machine { vm, world }
    }

    /// Runs a zero-argument code block at the toplevel.
    pub fn eval(
        &mut self,
        mc: &Mutation<'gc>,
        block: Gc<'gc, CodeBlock<'gc>>,
    ) -> Result<Value<'gc>, MachineExit<'gc>> {
        let proc = Gc::new(
            mc,
            Procedure::Closure(Closure {
                code: block,
                env: self.vm.toplevel(),
            }),
        );
        self.apply(mc, proc, Vec::new())
    }

    pub fn apply(
        &mut self,
        mc: &Mutation<'gc>,
        proc: Gc<'gc, Procedure<'gc>>,
        args: Vec<Value<'gc>>,
    ) -> Result<Value<'gc>, MachineExit<'gc>> {
        self.vm.apply(mc, &mut self.world, proc, args)
    }

    /// Establishes a recovery point for native code. The body runs behind
    /// a fresh guard frame; on normal completion the frame pops and the
    /// value comes back. An abrupt transfer reaching this frame pops it
    /// as part of the transfer, restores the saved registers, and hands
    /// the exit back to the native caller — transfers aimed at an
    /// enclosing, still-live boundary keep unwinding instead.
    ///
    /// This is strictly nested and synchronous: no capture, no re-entry.
    pub fn protected_call<T>(
        &mut self,
        mc: &Mutation<'gc>,
        body: impl FnOnce(&Mutation<'gc>, &mut Machine<'gc>) -> Result<T, MachineExit<'gc>>,
    ) -> Result<T, MachineExit<'gc>> {
        let gid = self.vm.push_guard();
        let handlers = self.vm.handlers;
        match body(mc, self) {
            Ok(value) => {
                self.vm.pop_guard(gid);
                Ok(value)
            }
            Err(MachineExit::Unwind(t))
                if t.guard.is_some_and(|g| g != gid && self.vm.guard_alive(g)) =>
            {
                self.vm.pop_guard(gid);
                Err(MachineExit::Unwind(t))
            }
            Err(exit) => {
                // recovered at this frame
                self.vm.pop_guard(gid);
                self.vm.handlers = handlers;
                Err(exit)
            }
        }
    }

    /// Renders an exit for diagnostics.
    pub fn describe_exit(&self, exit: &MachineExit<'gc>) -> String {
        match exit {
            MachineExit::Abort(Abort::NoHandler(condition)) => format!(
                "unhandled condition: {}",
                condition.describe(self.world.rodeo())
            ),
            MachineExit::Abort(Abort::DeadBoundary) => {
                "transfer into a native boundary that already returned".into()
            }
            MachineExit::Unwind(_) => "non-local transfer escaped the machine".into(),
        }
    }
}
