//! Native procedures the core ships with
//!
//! These are the operations that cannot be expressed in bytecode because
//! they reach into the machine itself: raising and re-raising conditions,
//! capturing continuations, installing escape points, dynamic-wind, plus
//! the handful of list and number helpers the rest only makes sense with.
//! Everything installs into the core module and is visible from user
//! modules through the ancestor chain.

use gc_arena::{Gc, Mutation};

use crate::{
    runtime::{
        escape::WindFrame,
        value::{Str, Value},
        Arity, Condition, NativeCtx, Procedure, Subr, SubrFn, SubrReturn,
    },
    world::World,
};

type SubrResult<'gc> = Result<SubrReturn<'gc>, crate::runtime::vm::MachineExit<'gc>>;

fn subr_raise<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    ctx.raise(args[0])
}

fn subr_error<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    let message = match args[0] {
        Value::Str(s) => s,
        Value::Symbol(s) => Str(s.0),
        other => {
            return ctx.error("error message must be a string or symbol", &[other]);
        }
    };
    let condition = Value::Condition(Gc::new(
        ctx.mc,
        Condition {
            message,
            irritants: args[1..].to_vec(),
        },
    ));
    ctx.raise(condition)
}

// Marks the handler currently running (the newest floating escape point)
// as having re-signalled, so its return goes back to the raise site
// instead of the point's saved continuation.
fn subr_reraise<'gc>(ctx: &mut NativeCtx<'_, 'gc>, _args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match ctx.vm.floating_ep() {
        Some(ep) => {
            ep.borrow_mut(ctx.mc).reraised = true;
            Ok(SubrReturn::Value(Value::Void))
        }
        None => ctx.error("reraise outside an active handler", &[]),
    }
}

fn subr_callcc<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    let Some(receiver) = args[0].as_procedure() else {
        return ctx.error("call/cc requires a procedure", &[args[0]]);
    };
    let k = ctx.vm.capture_continuation(ctx.mc);
    Ok(SubrReturn::Tail(receiver, vec![Value::Procedure(k)]))
}

fn subr_dynamic_wind<'gc>(
    ctx: &mut NativeCtx<'_, 'gc>,
    args: &mut Vec<Value<'gc>>,
) -> SubrResult<'gc> {
    let (Some(before), Some(thunk), Some(after)) = (
        args[0].as_procedure(),
        args[1].as_procedure(),
        args[2].as_procedure(),
    ) else {
        return ctx.error("dynamic-wind requires three procedures", &args[..]);
    };
    ctx.vm.apply(ctx.mc, ctx.world, before, Vec::new())?;
    let frame = Gc::new(
        ctx.mc,
        WindFrame {
            before,
            after,
            prev: ctx.vm.handler_chain(),
        },
    );
    ctx.vm.push_wind(frame);
    // a transfer out of the thunk runs `after` through the unwind walk,
    // not here; only the normal path pops and runs it itself
    let result = ctx.vm.apply(ctx.mc, ctx.world, thunk, Vec::new())?;
    ctx.vm.pop_wind(frame);
    ctx.vm.apply(ctx.mc, ctx.world, after, Vec::new())?;
    Ok(SubrReturn::Value(result))
}

fn with_handler<'gc>(
    ctx: &mut NativeCtx<'_, 'gc>,
    args: &mut Vec<Value<'gc>>,
    rewind_before: bool,
) -> SubrResult<'gc> {
    let (Some(handler), Some(thunk)) = (args[0].as_procedure(), args[1].as_procedure()) else {
        return ctx.error("expected a handler and a thunk", &args[..]);
    };
    // the point's saved continuation is the continuation of this whole
    // call: where the handler's value resumes if the body signals
    let cont = ctx.vm.current_cont();
    let ep = ctx.vm.push_escape_point(ctx.mc, handler, cont, rewind_before);
    ctx.vm.set_exception_handler(Value::Procedure(handler));
    let result = ctx.vm.apply(ctx.mc, ctx.world, thunk, Vec::new())?;
    // retire the point; if a resumed signal already consumed it, this
    // only puts the saved exception handler back
    ctx.vm.pop_escape_point(ep);
    let saved = ep.borrow().xhandler;
    ctx.vm.set_exception_handler(saved);
    Ok(SubrReturn::Value(result))
}

// legacy model: the handler runs first, dynamic handlers rewind after it
// returns (and not at all on reraise)
fn subr_with_error_handler<'gc>(
    ctx: &mut NativeCtx<'_, 'gc>,
    args: &mut Vec<Value<'gc>>,
) -> SubrResult<'gc> {
    with_handler(ctx, args, false)
}

// guard model: dynamic handlers rewind before the handler is called
fn subr_with_guard_handler<'gc>(
    ctx: &mut NativeCtx<'_, 'gc>,
    args: &mut Vec<Value<'gc>>,
) -> SubrResult<'gc> {
    with_handler(ctx, args, true)
}

fn subr_add<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    let mut acc: i64 = 0;
    for v in args.iter() {
        match v.as_number() {
            Some(n) => acc = acc.saturating_add(n),
            None => return ctx.error("+ requires numbers", &[*v]),
        }
    }
    Ok(SubrReturn::Value(Value::Number(acc)))
}

fn subr_sub<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    let Some(first) = args[0].as_number() else {
        return ctx.error("- requires numbers", &[args[0]]);
    };
    if args.len() == 1 {
        return Ok(SubrReturn::Value(Value::Number(first.saturating_neg())));
    }
    let mut acc = first;
    for v in &args[1..] {
        match v.as_number() {
            Some(n) => acc = acc.saturating_sub(n),
            None => return ctx.error("- requires numbers", &[*v]),
        }
    }
    Ok(SubrReturn::Value(Value::Number(acc)))
}

fn subr_num_eq<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match (args[0].as_number(), args[1].as_number()) {
        (Some(a), Some(b)) => Ok(SubrReturn::Value(Value::Bool(a == b))),
        _ => ctx.error("= requires numbers", &args[..]),
    }
}

fn subr_num_lt<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match (args[0].as_number(), args[1].as_number()) {
        (Some(a), Some(b)) => Ok(SubrReturn::Value(Value::Bool(a < b))),
        _ => ctx.error("< requires numbers", &args[..]),
    }
}

fn subr_cons<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    Ok(SubrReturn::Value(Value::cons(ctx.mc, args[0], args[1])))
}

fn subr_car<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match args[0] {
        Value::Pair(p) => Ok(SubrReturn::Value(p.borrow().car)),
        other => ctx.error("car requires a pair", &[other]),
    }
}

fn subr_cdr<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match args[0] {
        Value::Pair(p) => Ok(SubrReturn::Value(p.borrow().cdr)),
        other => ctx.error("cdr requires a pair", &[other]),
    }
}

fn subr_set_car<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    match args[0] {
        Value::Pair(p) => {
            p.borrow_mut(ctx.mc).car = args[1];
            Ok(SubrReturn::Value(Value::Void))
        }
        other => ctx.error("set-car! requires a pair", &[other]),
    }
}

fn subr_list<'gc>(ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    Ok(SubrReturn::Value(Value::list(ctx.mc, args.iter().copied())))
}

fn subr_not<'gc>(_ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    Ok(SubrReturn::Value(Value::Bool(args[0].is_false())))
}

fn subr_eq<'gc>(_ctx: &mut NativeCtx<'_, 'gc>, args: &mut Vec<Value<'gc>>) -> SubrResult<'gc> {
    Ok(SubrReturn::Value(Value::Bool(args[0].identical(&args[1]))))
}

const SUBRS: &[(&str, Arity, SubrFn)] = &[
    ("raise", Arity::Exact(1), subr_raise),
    ("error", Arity::Min(1), subr_error),
    ("reraise", Arity::Exact(0), subr_reraise),
    ("call-with-current-continuation", Arity::Exact(1), subr_callcc),
    ("call/cc", Arity::Exact(1), subr_callcc),
    ("dynamic-wind", Arity::Exact(3), subr_dynamic_wind),
    ("with-error-handler", Arity::Exact(2), subr_with_error_handler),
    ("with-guard-handler", Arity::Exact(2), subr_with_guard_handler),
    ("+", Arity::Min(0), subr_add),
    ("-", Arity::Min(1), subr_sub),
    ("=", Arity::Exact(2), subr_num_eq),
    ("<", Arity::Exact(2), subr_num_lt),
    ("cons", Arity::Exact(2), subr_cons),
    ("car", Arity::Exact(1), subr_car),
    ("cdr", Arity::Exact(1), subr_cdr),
    ("set-car!", Arity::Exact(2), subr_set_car),
    ("list", Arity::Min(0), subr_list),
    ("not", Arity::Exact(1), subr_not),
    ("eq?", Arity::Exact(2), subr_eq),
];

/// Defines and exports every core native in the core module.
pub fn install<'gc>(mc: &Mutation<'gc>, world: &mut World<'gc>) {
    let module = world.core_module();
    let mut names = Vec::with_capacity(SUBRS.len());
    for &(name, arity, func) in SUBRS {
        let symbol = world.intern(name);
        let value = Value::Procedure(Gc::new(mc, Procedure::Subr(Subr { name, arity, func })));
        world.define(mc, module, symbol, value);
        names.push(symbol);
    }
    world.export_symbols(mc, module, &names);
}
