//! End-to-end tests driving assembled bytecode through a whole machine:
//! calls, tail calls, closures, continuations, escape points, dynamic-wind,
//! and the scratch-relocation machinery under deliberately tiny limits.

use assert2::check;
use gc_arena::{Gc, Mutation};
use magpie::{
    Abort, Arity, CodeBlock, CodeBuilder, Machine, MachineArena, MachineExit, NativeCtx,
    Procedure, Subr, SubrReturn, Value,
};

fn with_machine(limit: usize, body: impl for<'gc> FnOnce(&Mutation<'gc>, &mut Machine<'gc>)) {
    let mut arena = MachineArena::new(|mc| Machine::with_scratch_limit(mc, limit));
    arena.mutate_root(|mc, m| body(mc, m));
}

fn sym<'gc>(m: &mut Machine<'gc>, name: &str) -> Value<'gc> {
    Value::Symbol(m.world.intern(name))
}

#[test]
fn constants_come_back() {
    with_machine(512, |mc, m| {
        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.constant(Value::Number(42)).ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(42));
    });
}

#[test]
fn non_tail_call_of_a_native() {
    with_machine(512, |mc, m| {
        let plus = sym(m, "+");
        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(1)).push();
        b.constant(Value::Number(2)).push();
        b.gref(plus);
        b.call(2);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(3));
    });
}

#[test]
fn define_and_call_a_closure() {
    with_machine(512, |mc, m| {
        let plus = sym(m, "+");
        let inc = sym(m, "inc");

        let mut f = CodeBuilder::new("inc", Arity::Exact(1));
        f.lref(0, 0).push();
        f.constant(Value::Number(1)).push();
        f.gref(plus);
        f.tail_call(2);
        let inc_block = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.close(inc_block);
        b.define(inc);
        let l = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(41)).push();
        b.gref(inc);
        b.call(1);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(42));
    });
}

fn subr_cont_depth<'gc>(
    ctx: &mut NativeCtx<'_, 'gc>,
    _args: &mut Vec<Value<'gc>>,
) -> Result<SubrReturn<'gc>, MachineExit<'gc>> {
    Ok(SubrReturn::Value(Value::Number(
        ctx.vm.continuation_depth() as i64,
    )))
}

#[test]
fn tail_recursion_keeps_the_continuation_chain_flat() {
    // a tiny scratch region so the loop crosses many relocations too
    with_machine(64, |mc, m| {
        let depth_name = m.world.intern("cont-depth");
        let user = m.world.user_module();
        let probe = Value::Procedure(Gc::new(
            mc,
            Procedure::Subr(Subr {
                name: "cont-depth",
                arity: Arity::Exact(0),
                func: subr_cont_depth,
            }),
        ));
        m.world.define(mc, user, depth_name, probe);

        let eq = sym(m, "=");
        let minus = sym(m, "-");
        let depth = Value::Symbol(depth_name);
        let looper = sym(m, "loop");

        // (define (loop n) (if (= n 0) (cont-depth) (loop (- n 1))))
        let mut f = CodeBuilder::new("loop", Arity::Exact(1));
        let l1 = f.new_label();
        let l2 = f.new_label();
        let l3 = f.new_label();
        let lrec = f.new_label();
        f.pre_call(l1);
        f.lref(0, 0).push();
        f.constant(Value::Number(0)).push();
        f.gref(eq);
        f.call(2);
        f.bind(l1);
        f.branch_false(lrec);
        f.pre_call(l2);
        f.gref(depth);
        f.call(0);
        f.bind(l2);
        f.ret();
        f.bind(lrec);
        f.pre_call(l3);
        f.lref(0, 0).push();
        f.constant(Value::Number(1)).push();
        f.gref(minus);
        f.call(2);
        f.bind(l3);
        f.push();
        f.gref(looper);
        f.tail_call(1);
        let loop_block = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.close(loop_block);
        b.define(looper);
        let l = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(1_000_000)).push();
        b.gref(looper);
        b.call(1);
        b.bind(l);
        b.ret();

        let v = m.eval(mc, b.finish(mc)).unwrap();
        // a million self-tail-calls deep, the chain is still the two
        // frames the probe call itself needs
        check!(v.as_number().unwrap() <= 3);
    });
}

#[test]
fn continuations_are_multi_shot_even_after_the_capture_returns() {
    with_machine(512, |mc, m| {
        let saved = m.world.intern("saved");
        let user = m.world.user_module();
        m.world.define(mc, user, saved, Value::Bool(false));

        let plus = sym(m, "+");
        let callcc = sym(m, "call/cc");
        let saved_v = Value::Symbol(saved);

        // (lambda (k) (set! saved k) 1)
        let mut f = CodeBuilder::new("receiver", Arity::Exact(1));
        f.lref(0, 0);
        f.gset(saved_v);
        f.constant(Value::Number(1));
        f.ret();
        let receiver = f.finish(mc);

        // (+ 100 (call/cc receiver))
        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        let l2 = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(100)).push();
        b.pre_call(l2);
        b.close(receiver).push();
        b.gref(callcc);
        b.call(1);
        b.bind(l2);
        b.push();
        b.gref(plus);
        b.call(2);
        b.bind(l);
        b.ret();

        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(101));

        // the capturing eval has fully returned; resume it twice anyway
        let k = m
            .world
            .symbol_value(user, saved)
            .unwrap()
            .as_procedure()
            .unwrap();
        let first = m.apply(mc, k, vec![Value::Number(5)]).unwrap();
        check!(first.as_number() == Some(105));
        let second = m.apply(mc, k, vec![Value::Number(37)]).unwrap();
        check!(second.as_number() == Some(137));
        // and the first resumption's result is unaffected by the second
        check!(first.as_number() == Some(105));
    });
}

#[test]
fn a_point_installed_inside_a_handler_catches_the_handlers_raise() {
    with_machine(512, |mc, m| {
        let plus = sym(m, "+");
        let raise = sym(m, "raise");
        let weh = sym(m, "with-error-handler");

        // (lambda (e2) 42)
        let mut f = CodeBuilder::new("inner-handler", Arity::Exact(1));
        f.constant(Value::Number(42)).ret();
        let inner_handler = f.finish(mc);

        // (lambda () (raise 9))
        let mut f = CodeBuilder::new("inner-thunk", Arity::Exact(0));
        f.constant(Value::Number(9)).push();
        f.gref(raise);
        f.tail_call(1);
        let inner_thunk = f.finish(mc);

        // (lambda (e) (+ (with-error-handler inner-handler inner-thunk) e))
        let mut f = CodeBuilder::new("outer-handler", Arity::Exact(1));
        let l1 = f.new_label();
        f.pre_call(l1);
        f.close(inner_handler).push();
        f.close(inner_thunk).push();
        f.gref(weh);
        f.call(2);
        f.bind(l1);
        f.push();
        f.lref(0, 0).push();
        f.gref(plus);
        f.tail_call(2);
        let outer_handler = f.finish(mc);

        // (lambda () (raise 1))
        let mut f = CodeBuilder::new("main-thunk", Arity::Exact(0));
        f.constant(Value::Number(1)).push();
        f.gref(raise);
        f.tail_call(1);
        let main_thunk = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(outer_handler).push();
        b.close(main_thunk).push();
        b.gref(weh);
        b.call(2);
        b.bind(l);
        b.ret();

        // raise 1 pops the outer point and runs its handler; the raise 9
        // inside is caught by the freshly installed inner point, whose
        // handler's 42 resumes inside the outer handler
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(43));
    });
}

#[test]
fn a_raise_inside_a_handler_reaches_the_enclosing_point() {
    with_machine(512, |mc, m| {
        let plus = sym(m, "+");
        let raise = sym(m, "raise");
        let weh = sym(m, "with-error-handler");

        // (lambda (e) (+ e 100))
        let mut f = CodeBuilder::new("top-handler", Arity::Exact(1));
        f.lref(0, 0).push();
        f.constant(Value::Number(100)).push();
        f.gref(plus);
        f.tail_call(2);
        let top_handler = f.finish(mc);

        // (lambda (e) (raise (+ e 1)))
        let mut f = CodeBuilder::new("middle-handler", Arity::Exact(1));
        let a = f.new_label();
        f.pre_call(a);
        f.lref(0, 0).push();
        f.constant(Value::Number(1)).push();
        f.gref(plus);
        f.call(2);
        f.bind(a);
        f.push();
        f.gref(raise);
        f.tail_call(1);
        let middle_handler = f.finish(mc);

        // (lambda () (raise 5))
        let mut f = CodeBuilder::new("inner-thunk", Arity::Exact(0));
        f.constant(Value::Number(5)).push();
        f.gref(raise);
        f.tail_call(1);
        let inner_thunk = f.finish(mc);

        // (lambda () (with-error-handler middle-handler inner-thunk))
        let mut f = CodeBuilder::new("middle-thunk", Arity::Exact(0));
        f.close(middle_handler).push();
        f.close(inner_thunk).push();
        f.gref(weh);
        f.tail_call(2);
        let middle_thunk = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(top_handler).push();
        b.close(middle_thunk).push();
        b.gref(weh);
        b.call(2);
        b.bind(l);
        b.ret();

        // middle's handler raises 6 while running; its own point is
        // already popped, so the top point catches it: 6 + 100
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(106));
    });
}

#[test]
fn reraise_returns_to_the_signal_site() {
    with_machine(512, |mc, m| {
        let plus = sym(m, "+");
        let raise = sym(m, "raise");
        let reraise = sym(m, "reraise");
        let weh = sym(m, "with-error-handler");

        // (lambda (e) (reraise) 99)
        let mut f = CodeBuilder::new("handler", Arity::Exact(1));
        let r = f.new_label();
        f.pre_call(r);
        f.gref(reraise);
        f.call(0);
        f.bind(r);
        f.constant(Value::Number(99));
        f.ret();
        let handler = f.finish(mc);

        // (lambda () (+ 1 (raise 5)))
        let mut f = CodeBuilder::new("thunk", Arity::Exact(0));
        let t = f.new_label();
        let t2 = f.new_label();
        f.pre_call(t);
        f.constant(Value::Number(1)).push();
        f.pre_call(t2);
        f.constant(Value::Number(5)).push();
        f.gref(raise);
        f.call(1);
        f.bind(t2);
        f.push();
        f.gref(plus);
        f.call(2);
        f.bind(t);
        f.ret();
        let thunk = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(handler).push();
        b.close(thunk).push();
        b.gref(weh);
        b.call(2);
        b.bind(l);
        b.ret();

        // the handler's 99 resumes the raise itself, not the point's
        // saved continuation: (+ 1 99)
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(100));
    });
}

/// Builds `(lambda (x) (set! log (cons x log)))` and defines it as
/// `record`, with `log` starting out as the empty list.
fn install_recorder<'gc>(mc: &Mutation<'gc>, m: &mut Machine<'gc>) {
    let log = m.world.intern("log");
    let user = m.world.user_module();
    m.world.define(mc, user, log, Value::Null);

    let cons = sym(m, "cons");
    let log_v = Value::Symbol(log);
    let record = sym(m, "record");

    let mut f = CodeBuilder::new("record", Arity::Exact(1));
    let a = f.new_label();
    f.pre_call(a);
    f.lref(0, 0).push();
    f.gref(log_v).push();
    f.gref(cons);
    f.call(2);
    f.bind(a);
    f.gset(log_v);
    f.ret();
    let record_block = f.finish(mc);

    let mut b = CodeBuilder::new("install", Arity::Exact(0));
    b.close(record_block);
    b.define(record);
    b.ret();
    m.eval(mc, b.finish(mc)).unwrap();
}

fn recorded<'gc>(m: &Machine<'gc>) -> Vec<i64> {
    let log = m.world.rodeo().get("log").map(magpie::Symbol).unwrap();
    let user = m.world.user_module();
    m.world
        .symbol_value(user, log)
        .unwrap()
        .list_to_vec()
        .unwrap()
        .iter()
        .map(|v| v.as_number().unwrap())
        .collect()
}

/// `(lambda () (record n))`, in tail position.
fn recording_thunk<'gc>(
    mc: &Mutation<'gc>,
    m: &mut Machine<'gc>,
    n: i64,
) -> Gc<'gc, CodeBlock<'gc>> {
    let record = sym(m, "record");
    let mut f = CodeBuilder::new("recorder", Arity::Exact(0));
    f.constant(Value::Number(n)).push();
    f.gref(record);
    f.tail_call(1);
    f.finish(mc)
}

fn wind_order_program<'gc>(
    mc: &Mutation<'gc>,
    m: &mut Machine<'gc>,
    install_form: &str,
) -> Gc<'gc, CodeBlock<'gc>> {
    let raise = sym(m, "raise");
    let record = sym(m, "record");
    let dw = sym(m, "dynamic-wind");
    let installer = sym(m, install_form);

    let before = recording_thunk(mc, m, 1);
    let after = recording_thunk(mc, m, 3);

    // (lambda () (raise 7))
    let mut f = CodeBuilder::new("raiser", Arity::Exact(0));
    f.constant(Value::Number(7)).push();
    f.gref(raise);
    f.tail_call(1);
    let raiser = f.finish(mc);

    // (lambda () (dynamic-wind before raiser after))
    let mut f = CodeBuilder::new("body", Arity::Exact(0));
    f.close(before).push();
    f.close(raiser).push();
    f.close(after).push();
    f.gref(dw);
    f.tail_call(3);
    let body = f.finish(mc);

    // (lambda (e) (record 2) e)
    let mut f = CodeBuilder::new("handler", Arity::Exact(1));
    let a = f.new_label();
    f.pre_call(a);
    f.constant(Value::Number(2)).push();
    f.gref(record);
    f.call(1);
    f.bind(a);
    f.lref(0, 0);
    f.ret();
    let handler = f.finish(mc);

    let mut b = CodeBuilder::new("main", Arity::Exact(0));
    let l = b.new_label();
    b.pre_call(l);
    b.close(handler).push();
    b.close(body).push();
    b.gref(installer);
    b.call(2);
    b.bind(l);
    b.ret();
    b.finish(mc)
}

#[test]
fn legacy_handler_runs_before_the_after_thunks_rewind() {
    with_machine(512, |mc, m| {
        install_recorder(mc, m);
        let program = wind_order_program(mc, m, "with-error-handler");
        let v = m.eval(mc, program).unwrap();
        check!(v.as_number() == Some(7));
        // before(1), handler(2), after(3); the log conses onto the front
        check!(recorded(m) == vec![3, 2, 1]);
    });
}

#[test]
fn guard_style_rewinds_the_after_thunks_before_the_handler() {
    with_machine(512, |mc, m| {
        install_recorder(mc, m);
        let program = wind_order_program(mc, m, "with-guard-handler");
        let v = m.eval(mc, program).unwrap();
        check!(v.as_number() == Some(7));
        // before(1), after(3), handler(2)
        check!(recorded(m) == vec![2, 3, 1]);
    });
}

#[test]
fn dynamic_wind_runs_in_order_on_the_normal_path() {
    with_machine(512, |mc, m| {
        install_recorder(mc, m);
        let dw = sym(m, "dynamic-wind");
        let before = recording_thunk(mc, m, 1);
        let after = recording_thunk(mc, m, 3);
        let mut f = CodeBuilder::new("thunk", Arity::Exact(0));
        f.constant(Value::Number(8)).ret();
        let thunk = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(before).push();
        b.close(thunk).push();
        b.close(after).push();
        b.gref(dw);
        b.call(3);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(8));
        check!(recorded(m) == vec![3, 1]);
    });
}

#[test]
fn leaving_a_dynamic_extent_through_a_continuation_runs_the_after_thunk() {
    with_machine(512, |mc, m| {
        install_recorder(mc, m);
        let callcc = sym(m, "call/cc");
        let dw = sym(m, "dynamic-wind");
        let before = recording_thunk(mc, m, 1);
        let after = recording_thunk(mc, m, 3);

        // (lambda () (k 42)) — k lives one frame up, in the receiver
        let mut f = CodeBuilder::new("jumper", Arity::Exact(0));
        f.constant(Value::Number(42)).push();
        f.lref(1, 0);
        f.tail_call(1);
        let jumper = f.finish(mc);

        // (lambda (k) (dynamic-wind before jumper after))
        let mut f = CodeBuilder::new("receiver", Arity::Exact(1));
        f.close(before).push();
        f.close(jumper).push();
        f.close(after).push();
        f.gref(dw);
        f.tail_call(3);
        let receiver = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(receiver).push();
        b.gref(callcc);
        b.call(1);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(42));
        check!(recorded(m) == vec![3, 1]);
    });
}

#[test]
fn handler_survives_relocation_forced_while_it_runs() {
    // a scratch region this small relocates every few calls, including
    // in the middle of the escape-point handler below
    with_machine(16, |mc, m| {
        let plus = sym(m, "+");
        let minus = sym(m, "-");
        let eq = sym(m, "=");
        let raise = sym(m, "raise");
        let weh = sym(m, "with-error-handler");
        let churn = sym(m, "churn");

        // (define (churn n) (if (= n 0) 0 (+ (churn (- n 1)) 1)))
        let mut f = CodeBuilder::new("churn", Arity::Exact(1));
        let l1 = f.new_label();
        let l2 = f.new_label();
        let l3 = f.new_label();
        let l4 = f.new_label();
        let lrec = f.new_label();
        f.pre_call(l1);
        f.lref(0, 0).push();
        f.constant(Value::Number(0)).push();
        f.gref(eq);
        f.call(2);
        f.bind(l1);
        f.branch_false(lrec);
        f.constant(Value::Number(0));
        f.ret();
        f.bind(lrec);
        f.pre_call(l2);
        f.pre_call(l3);
        f.pre_call(l4);
        f.lref(0, 0).push();
        f.constant(Value::Number(1)).push();
        f.gref(minus);
        f.call(2);
        f.bind(l4);
        f.push();
        f.gref(churn);
        f.call(1);
        f.bind(l3);
        f.push();
        f.constant(Value::Number(1)).push();
        f.gref(plus);
        f.call(2);
        f.bind(l2);
        f.ret();
        let churn_block = f.finish(mc);

        // inner handler: (lambda (e) (churn 60) (+ e 10))
        let mut f = CodeBuilder::new("inner-handler", Arity::Exact(1));
        let c = f.new_label();
        let c2 = f.new_label();
        f.pre_call(c);
        f.constant(Value::Number(60)).push();
        f.gref(churn);
        f.call(1);
        f.bind(c);
        f.pre_call(c2);
        f.lref(0, 0).push();
        f.constant(Value::Number(10)).push();
        f.gref(plus);
        f.call(2);
        f.bind(c2);
        f.ret();
        let inner_handler = f.finish(mc);

        // (lambda () (raise 1))
        let mut f = CodeBuilder::new("inner-thunk", Arity::Exact(0));
        f.constant(Value::Number(1)).push();
        f.gref(raise);
        f.tail_call(1);
        let inner_thunk = f.finish(mc);

        // outer handler: (lambda (e) (+ e 1000))
        let mut f = CodeBuilder::new("outer-handler", Arity::Exact(1));
        f.lref(0, 0).push();
        f.constant(Value::Number(1000)).push();
        f.gref(plus);
        f.tail_call(2);
        let outer_handler = f.finish(mc);

        // outer body: (lambda () (raise (with-error-handler inner-handler inner-thunk)))
        let mut f = CodeBuilder::new("outer-body", Arity::Exact(0));
        let o = f.new_label();
        f.pre_call(o);
        f.close(inner_handler).push();
        f.close(inner_thunk).push();
        f.gref(weh);
        f.call(2);
        f.bind(o);
        f.push();
        f.gref(raise);
        f.tail_call(1);
        let outer_body = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.close(churn_block);
        b.define(churn);
        let l = b.new_label();
        b.pre_call(l);
        b.close(outer_handler).push();
        b.close(outer_body).push();
        b.gref(weh);
        b.call(2);
        b.bind(l);
        b.ret();

        // the inner handler's churn forces relocations while its point
        // floats; its saved continuation and the outer point's must both
        // come through: 1 + 10, raised again, + 1000
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(1011));
    });
}

#[test]
fn protected_calls_recover_aborts_at_the_topmost_frame() {
    with_machine(512, |mc, m| {
        let raise = sym(m, "raise");
        let mut b = CodeBuilder::new("raiser", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(5)).push();
        b.gref(raise);
        b.call(1);
        b.bind(l);
        b.ret();
        let raiser = b.finish(mc);

        let outer = m.protected_call(mc, |mc, m| {
            let inner = m.protected_call(mc, |mc, m| m.eval(mc, raiser));
            // the innermost protected frame recovered the abort
            check!(matches!(
                inner,
                Err(MachineExit::Abort(Abort::NoHandler(_)))
            ));
            Ok(Value::Number(1))
        });
        check!(matches!(outer, Ok(Value::Number(1))));

        // the machine is still healthy after the recovery
        let mut b = CodeBuilder::new("again", Arity::Exact(0));
        b.constant(Value::Number(9)).ret();
        check!(m.eval(mc, b.finish(mc)).unwrap().as_number() == Some(9));
    });
}

#[test]
fn unbound_variables_signal_a_catchable_condition() {
    with_machine(512, |mc, m| {
        let weh = sym(m, "with-error-handler");
        let nosuch = sym(m, "nosuch");

        let mut f = CodeBuilder::new("handler", Arity::Exact(1));
        f.constant(Value::Number(123)).ret();
        let handler = f.finish(mc);

        let mut f = CodeBuilder::new("thunk", Arity::Exact(0));
        f.gref(nosuch);
        f.ret();
        let thunk = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        let l = b.new_label();
        b.pre_call(l);
        b.close(handler).push();
        b.close(thunk).push();
        b.gref(weh);
        b.call(2);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(123));

        // uncaught, the same condition kills the computation with a
        // usable diagnostic
        let mut b = CodeBuilder::new("bare", Arity::Exact(0));
        b.gref(nosuch);
        b.ret();
        let exit = m.eval(mc, b.finish(mc)).unwrap_err();
        check!(m.describe_exit(&exit).contains("unbound variable"));
    });
}

#[test]
fn deep_non_tail_recursion_crosses_relocations() {
    with_machine(32, |mc, m| {
        let plus = sym(m, "+");
        let minus = sym(m, "-");
        let eq = sym(m, "=");
        let summer = sym(m, "sum");

        // (define (sum n) (if (= n 0) 0 (+ n (sum (- n 1)))))
        let mut f = CodeBuilder::new("sum", Arity::Exact(1));
        let l1 = f.new_label();
        let l2 = f.new_label();
        let l3 = f.new_label();
        let l4 = f.new_label();
        let lrec = f.new_label();
        f.pre_call(l1);
        f.lref(0, 0).push();
        f.constant(Value::Number(0)).push();
        f.gref(eq);
        f.call(2);
        f.bind(l1);
        f.branch_false(lrec);
        f.constant(Value::Number(0));
        f.ret();
        f.bind(lrec);
        f.pre_call(l2);
        f.lref(0, 0).push();
        f.pre_call(l3);
        f.pre_call(l4);
        f.lref(0, 0).push();
        f.constant(Value::Number(1)).push();
        f.gref(minus);
        f.call(2);
        f.bind(l4);
        f.push();
        f.gref(summer);
        f.call(1);
        f.bind(l3);
        f.push();
        f.gref(plus);
        f.call(2);
        f.bind(l2);
        f.ret();
        let sum_block = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.close(sum_block);
        b.define(summer);
        let l = b.new_label();
        b.pre_call(l);
        b.constant(Value::Number(200)).push();
        b.gref(summer);
        b.call(1);
        b.bind(l);
        b.ret();
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(20100));
    });
}

#[test]
fn closures_share_one_promoted_frame() {
    with_machine(8, |mc, m| {
        let list = sym(m, "list");
        let car = sym(m, "car");
        let cdr = sym(m, "cdr");
        let plus = sym(m, "+");
        let mk = sym(m, "mkcell");
        let cell = sym(m, "cell");
        let get = sym(m, "get");
        let set = sym(m, "set");

        // (lambda () x)
        let mut f = CodeBuilder::new("getter", Arity::Exact(0));
        f.lref(1, 0);
        f.ret();
        let getter = f.finish(mc);

        // (lambda (v) (set! x v))
        let mut f = CodeBuilder::new("setter", Arity::Exact(1));
        f.lref(0, 0);
        f.lset(1, 0);
        f.ret();
        let setter = f.finish(mc);

        // (lambda (x) (list getter setter)) — both close over this frame
        let mut f = CodeBuilder::new("mkcell", Arity::Exact(1));
        let a = f.new_label();
        f.pre_call(a);
        f.close(getter).push();
        f.close(setter).push();
        f.gref(list);
        f.call(2);
        f.bind(a);
        f.ret();
        let mkcell = f.finish(mc);

        let mut b = CodeBuilder::new("main", Arity::Exact(0));
        b.close(mkcell);
        b.define(mk);
        let l1 = b.new_label();
        b.pre_call(l1);
        b.constant(Value::Number(5)).push();
        b.gref(mk);
        b.call(1);
        b.bind(l1);
        b.define(cell);
        // get = (car cell), set = (car (cdr cell))
        let l2 = b.new_label();
        b.pre_call(l2);
        b.gref(cell).push();
        b.gref(car);
        b.call(1);
        b.bind(l2);
        b.define(get);
        let l3 = b.new_label();
        let l4 = b.new_label();
        b.pre_call(l3);
        b.pre_call(l4);
        b.gref(cell).push();
        b.gref(cdr);
        b.call(1);
        b.bind(l4);
        b.push();
        b.gref(car);
        b.call(1);
        b.bind(l3);
        b.define(set);
        // (+ (get) (begin (set 9) (get))) = 5 + 9
        let l8 = b.new_label();
        let l5 = b.new_label();
        let l6 = b.new_label();
        let l7 = b.new_label();
        b.pre_call(l8);
        b.pre_call(l5);
        b.gref(get);
        b.call(0);
        b.bind(l5);
        b.push();
        b.pre_call(l6);
        b.constant(Value::Number(9)).push();
        b.gref(set);
        b.call(1);
        b.bind(l6);
        b.pre_call(l7);
        b.gref(get);
        b.call(0);
        b.bind(l7);
        b.push();
        b.gref(plus);
        b.call(2);
        b.bind(l8);
        b.ret();

        // the setter writes through the same heap frame the getter reads
        let v = m.eval(mc, b.finish(mc)).unwrap();
        check!(v.as_number() == Some(14));
    });
}
