//! Escape points and the dynamic-wind handler chain
//!
//! An escape point keeps a place in the continuation chain where control
//! can be transferred: a saved continuation, or an error handler. Escape
//! points normally form a single list linked by `prev`, with the VM's
//! `escape` register naming the current one.
//!
//! That simple structure is not enough on its own. When a condition is
//! signalled the point is popped *before* its handler runs, so that an
//! error raised inside the handler is caught by the enclosing point.
//! Suppose the current point is E0:
//!
//! ```text
//! (with-error-handler     ; installs E1; E1's saved continuation is the
//!                         ; continuation of this whole expression
//!    (lambda (e) ...)     ; runs while E0 is current
//!    (lambda () ...))     ; runs while E1 is current
//! ```
//!
//! If the handler returns, its result goes to E1's saved continuation. But
//! if a scratch overflow relocates continuation frames to the heap while
//! the handler is running, E1 is outside the active chain and its saved
//! continuation would be missed by the relocation sweep.
//!
//! The floating pointer catches this. When a point is popped before its
//! handler runs, the new current point's floating field (or the VM's
//! fallback slot, if no point remains) is set to the popped point; a
//! freshly pushed point inherits the current floating value. Every
//! popped-but-running point therefore stays reachable by walking
//! `current → floating → floating → …`, and relocation rewrites each one's
//! saved continuation along with the live chain. The chain can be longer
//! than one when handlers nest and signal again.

use gc_arena::{Collect, Gc, Mutation, RefLock};

use crate::runtime::{
    frame::ContRef,
    value::Value,
    vm::{GuardId, Vm},
    Procedure,
};

pub type EpPtr<'gc> = Gc<'gc, RefLock<EscapePoint<'gc>>>;

/// One registered target for non-local control transfer.
#[derive(Collect, Clone, Copy, Debug)]
#[collect(no_drop)]
pub struct EscapePoint<'gc> {
    /// enclosing escape point; the active chain, innermost first
    pub prev: Option<EpPtr<'gc>>,
    /// reachability link for popped-but-running points
    pub floating: Option<EpPtr<'gc>>,
    /// handler to invoke on transfer into this point
    pub handler: Gc<'gc, Procedure<'gc>>,
    /// where to resume once the handler completes; empty is legal and
    /// means the point has no fixed resumption (the handler's value goes
    /// back to the signal site instead)
    pub cont: Option<ContRef<'gc>>,
    /// dynamic-wind chain in effect when the point was installed
    pub handlers: HandlerChain<'gc>,
    /// native boundary to unwind to; empty means reentrant from anywhere
    pub guard: Option<GuardId>,
    /// exception handler register to restore on transfer
    pub xhandler: Value<'gc>,
    /// argument-stack depth to restore on transfer
    pub argp_mark: usize,
    /// run dynamic-wind "after" thunks before the handler instead of
    /// after it returns; guard-style forms need the former, the legacy
    /// with-error-handler form the latter
    pub rewind_before: bool,
    /// set once the handler explicitly re-signals; lets the handler
    /// invocation return to its own caller instead of transferring
    pub reraised: bool,
}

/// The dynamic-wind chain: before/after thunk pairs for every dynamic
/// extent control is currently inside, innermost first.
pub type HandlerChain<'gc> = Option<Gc<'gc, WindFrame<'gc>>>;

#[derive(Collect, Debug)]
#[collect(no_drop)]
pub struct WindFrame<'gc> {
    pub before: Gc<'gc, Procedure<'gc>>,
    pub after: Gc<'gc, Procedure<'gc>>,
    pub prev: HandlerChain<'gc>,
}

pub(crate) fn wind_chain_vec<'gc>(chain: HandlerChain<'gc>) -> Vec<Gc<'gc, WindFrame<'gc>>> {
    let mut out = Vec::new();
    let mut cur = chain;
    while let Some(wf) = cur {
        out.push(wf);
        cur = wf.prev;
    }
    out
}

impl<'gc> Vm<'gc> {
    /// The current floating pointer: the top point's floating field, or
    /// the fallback slot when no point is installed.
    pub fn floating_ep(&self) -> Option<EpPtr<'gc>> {
        match self.escape {
            Some(top) => top.borrow().floating,
            None => self.escape_floating,
        }
    }

    pub(crate) fn set_floating_ep(&mut self, mc: &Mutation<'gc>, ep: Option<EpPtr<'gc>>) {
        match self.escape {
            Some(top) => top.borrow_mut(mc).floating = ep,
            None => self.escape_floating = ep,
        }
    }

    /// Installs a new escape point over the current one. The new point
    /// inherits the floating pointer and snapshots the dynamic-wind chain,
    /// the exception handler, the argument-stack depth, and the native
    /// boundary in effect right now.
    pub fn push_escape_point(
        &mut self,
        mc: &Mutation<'gc>,
        handler: Gc<'gc, Procedure<'gc>>,
        cont: Option<ContRef<'gc>>,
        rewind_before: bool,
    ) -> EpPtr<'gc> {
        let ep = Gc::new(
            mc,
            RefLock::new(EscapePoint {
                prev: self.escape,
                floating: self.floating_ep(),
                handler,
                cont,
                handlers: self.handlers,
                guard: self.current_guard(),
                xhandler: self.exception_handler,
                argp_mark: self.argp.len(),
                rewind_before,
                reraised: false,
            }),
        );
        self.escape = Some(ep);
        ep
    }

    /// Removes `ep` from the active chain if it is still the current
    /// point. Used when a guarded body completes without signalling.
    pub fn pop_escape_point(&mut self, ep: EpPtr<'gc>) {
        if self.escape.is_some_and(|top| Gc::ptr_eq(top, ep)) {
            self.escape = ep.borrow().prev;
            self.exception_handler = ep.borrow().xhandler;
        }
    }

    /// Pops the current point ahead of running its handler, keeping it
    /// reachable through the floating chain until the handler invocation
    /// fully completes. A failure inside the handler is then caught by
    /// the enclosing point, not by this one.
    pub fn pop_for_handler_invocation(&mut self, mc: &Mutation<'gc>) -> EpPtr<'gc> {
        let ep = self
            .escape
            .expect("no escape point to pop for handler invocation");
        self.escape = ep.borrow().prev;
        self.set_floating_ep(mc, Some(ep));
        tracing::trace!("escape point popped for handler invocation");
        ep
    }

    /// Undoes [`Vm::pop_for_handler_invocation`]'s floating link once the
    /// handler call has fully returned or transferred away.
    pub(crate) fn drop_floating(&mut self, mc: &Mutation<'gc>, ep: EpPtr<'gc>) {
        let inherited = ep.borrow().floating;
        self.set_floating_ep(mc, inherited);
    }

    /// Enters a dynamic extent: `frame` becomes the innermost wind frame.
    pub(crate) fn push_wind(&mut self, frame: Gc<'gc, WindFrame<'gc>>) {
        self.handlers = Some(frame);
    }

    /// Leaves a dynamic extent on the normal path. If a transfer already
    /// moved the chain elsewhere there is nothing to pop.
    pub(crate) fn pop_wind(&mut self, frame: Gc<'gc, WindFrame<'gc>>) {
        if self.handlers.is_some_and(|head| Gc::ptr_eq(head, frame)) {
            self.handlers = frame.prev;
        }
    }

    /// Every escape point that relocation must keep consistent: the
    /// active chain, then the floating chain (which may extend past the
    /// fallback slot when no point is installed).
    pub(crate) fn each_escape_point(&self) -> Vec<EpPtr<'gc>> {
        let mut out = Vec::new();
        let mut cur = self.escape;
        while let Some(ep) = cur {
            out.push(ep);
            cur = ep.borrow().prev;
        }
        let mut cur = self.floating_ep();
        while let Some(ep) = cur {
            out.push(ep);
            cur = ep.borrow().floating;
        }
        let mut cur = self.escape_floating;
        while let Some(ep) = cur {
            out.push(ep);
            cur = ep.borrow().floating;
        }
        out
    }
}
