use std::sync::{Arc, Mutex};

use opstack::{Builder, BytecodeImage, Error, Label, Result, Value};
use pretty_assertions::assert_eq;

// ---------------------------------------------------------------------------
// Harness
//
// Every root built here takes a host `append` function as argument 0 and
// boolean flags as the remaining arguments. A run reports the values
// appended, in order, and whether the call ended with an uncaught throw.
// ---------------------------------------------------------------------------

fn build<F>(f: F) -> Arc<BytecodeImage>
where
    F: FnOnce(&mut Builder) -> Result<()>,
{
    let mut b = Builder::new();
    b.begin_root().unwrap();
    f(&mut b).unwrap();
    let root = b.end_root().unwrap();
    b.image(root).unwrap()
}

/// Like [`build`], followed by unrelated throwing roots on the same builder.
fn build_among_roots<F>(f: F) -> Arc<BytecodeImage>
where
    F: FnOnce(&mut Builder) -> Result<()>,
{
    let mut b = Builder::new();
    b.begin_root().unwrap();
    f(&mut b).unwrap();
    let root = b.end_root().unwrap();
    for _ in 0..20 {
        b.begin_root().unwrap();
        b.emit_throw(-456).unwrap();
        b.end_root().unwrap();
    }
    b.image(root).unwrap()
}

fn run_with(image: &Arc<BytecodeImage>, mut args: Vec<Value>) -> (Vec<i64>, bool) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let append = Value::host("append", move |args| {
        if let Some(v) = args.first().and_then(Value::as_int) {
            sink.lock().unwrap().push(v);
        }
        Value::Null
    });
    args.insert(0, append);

    let threw = match image.call(args) {
        Ok(_) => false,
        Err(Error::Thrown(_)) => true,
        Err(other) => panic!("unexpected error: {other}"),
    };
    let order = log.lock().unwrap().clone();
    (order, threw)
}

/// Run with one boolean argument per character of `flags` (`t` or `f`).
fn run(image: &Arc<BytecodeImage>, flags: &str) -> (Vec<i64>, bool) {
    let args = flags.chars().map(|c| Value::Bool(c == 't')).collect();
    run_with(image, args)
}

fn append(b: &mut Builder, value: i64) -> Result<()> {
    b.begin_invoke()?;
    b.emit_load_argument(0)?;
    b.emit_load_constant(value)?;
    b.end_invoke()
}

fn return_if(b: &mut Builder, arg: u32, value: i64) -> Result<()> {
    b.begin_if_then()?;
    b.emit_load_argument(arg)?;
    b.emit_return(value)?;
    b.end_if_then()
}

fn branch_if(b: &mut Builder, arg: u32, label: Label) -> Result<()> {
    b.begin_if_then()?;
    b.emit_load_argument(arg)?;
    b.emit_branch(label)?;
    b.end_if_then()
}

fn throw_if(b: &mut Builder, arg: u32, value: i64) -> Result<()> {
    b.begin_if_then()?;
    b.emit_load_argument(arg)?;
    b.emit_throw(value)?;
    b.end_if_then()
}

/// A body with every kind of exit: return on arg 1, branch to `exit` on
/// arg 2, throw on arg 3, otherwise fall through. Appends `first..first+3`.
fn exits_body(b: &mut Builder, first: i64, exit: Label) -> Result<()> {
    b.begin_block()?;
    append(b, first)?;
    return_if(b, 1, 0)?;
    append(b, first + 1)?;
    branch_if(b, 2, exit)?;
    append(b, first + 2)?;
    throw_if(b, 3, 123)?;
    append(b, first + 3)?;
    b.end_block()
}

fn done(order: &[i64]) -> (Vec<i64>, bool) {
    (order.to_vec(), false)
}

fn threw(order: &[i64]) -> (Vec<i64>, bool) {
    (order.to_vec(), true)
}

// ---------------------------------------------------------------------------
// Basic exits
// ---------------------------------------------------------------------------

#[test]
fn test_finally_runs_after_fallthrough() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 2))?;
        append(b, 1)?;
        b.end_finally_try()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), done(&[1, 2]));
}

#[test]
fn test_finally_runs_before_rethrow() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), threw(&[1, 3]));
}

#[test]
fn test_rethrow_preserves_thrown_value() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 1))?;
        b.emit_throw("boom")?;
        b.end_finally_try()
    });
    let err = image.call(vec![Value::host("noop", |_| Value::Null)]).unwrap_err();
    assert_eq!(err.thrown_value(), Some(&Value::from("boom")));
}

#[test]
fn test_finally_runs_before_return() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 1))?;
        b.begin_block()?;
        append(b, 2)?;
        b.emit_return(0)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 3)
    });
    assert_eq!(run(&image, ""), done(&[2, 1]));
}

#[test]
fn test_return_value_survives_handler() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 1)?;
            b.emit_load_constant(99)?;
            b.end_block()
        })?;
        b.emit_return(42)?;
        b.end_finally_try()
    });
    let out = image
        .call(vec![Value::host("noop", |_| Value::Null)])
        .unwrap()
        .into_returned();
    assert_eq!(out, Some(Value::Int(42)));
}

fn bind_handler(b: &mut Builder, ex: opstack::Local, bound: i64, unbound: i64) -> Result<()> {
    b.begin_if_then_else()?;
    b.begin_non_null()?;
    b.emit_load_local(ex)?;
    b.end_non_null()?;
    append(b, bound)?;
    append(b, unbound)?;
    b.end_if_then_else()
}

#[test]
fn test_bound_exception_is_null_on_fallthrough() {
    let image = build(|b| {
        let ex = b.create_local()?;
        b.begin_finally_try(Some(ex), move |b| bind_handler(b, ex, 3, 2))?;
        append(b, 1)?;
        b.end_finally_try()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), done(&[1, 2]));
}

#[test]
fn test_bound_exception_is_set_on_throw() {
    let image = build(|b| {
        let ex = b.create_local()?;
        b.begin_finally_try(Some(ex), move |b| bind_handler(b, ex, 3, 4))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), threw(&[1, 3]));
}

#[test]
fn test_bound_exception_is_null_on_return() {
    let image = build(|b| {
        let ex = b.create_local()?;
        b.begin_finally_try(Some(ex), move |b| bind_handler(b, ex, 4, 1))?;
        b.begin_block()?;
        append(b, 2)?;
        b.emit_return(0)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 3)
    });
    assert_eq!(run(&image, ""), done(&[2, 1]));
}

#[test]
fn test_finally_runs_before_branch_out() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_branch(lbl)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 4)?;
        b.emit_label(lbl)?;
        append(b, 5)?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), done(&[1, 3, 5]));
}

#[test]
fn test_branch_forward_out_of_handler() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try(None, move |b| {
            b.begin_block()?;
            append(b, 2)?;
            b.emit_branch(lbl)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 3)?;
        b.emit_label(lbl)?;
        append(b, 4)?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), done(&[1, 2, 4]));
}

#[test]
fn test_branch_out_of_handler_abandons_return() {
    // The return parks its value, so the branch leaves with a balanced stack.
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try(None, move |b| {
            b.begin_block()?;
            append(b, 2)?;
            b.emit_branch(lbl)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_return(0)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 3)?;
        b.emit_label(lbl)?;
        append(b, 4)?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), done(&[1, 2, 4]));
}

// ---------------------------------------------------------------------------
// Local control flow inside relocated handlers
// ---------------------------------------------------------------------------

#[test]
fn test_branch_within_handler() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            let lbl = b.create_label()?;
            append(b, 5)?;
            b.emit_branch(lbl)?;
            append(b, 6)?;
            b.emit_label(lbl)?;
            append(b, 7)?;
            b.end_block()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 8)?;
        b.end_block()
    });
    assert_eq!(run(&image, "fff"), done(&[1, 2, 3, 4, 5, 7, 8]));
    assert_eq!(run(&image, "tff"), done(&[1, 5, 7]));
    assert_eq!(run(&image, "ftf"), done(&[1, 2, 5, 7, 8]));
    assert_eq!(run(&image, "fft"), threw(&[1, 2, 3, 5, 7]));
}

#[test]
fn test_if_then_within_handler() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 5)?;
            b.begin_if_then()?;
            b.emit_load_argument(4)?;
            append(b, 6)?;
            b.end_if_then()?;
            append(b, 7)?;
            b.end_block()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 8)?;
        b.end_block()
    });
    assert_eq!(run(&image, "ffff"), done(&[1, 2, 3, 4, 5, 7, 8]));
    assert_eq!(run(&image, "ffft"), done(&[1, 2, 3, 4, 5, 6, 7, 8]));
    assert_eq!(run(&image, "tfff"), done(&[1, 5, 7]));
    assert_eq!(run(&image, "tfft"), done(&[1, 5, 6, 7]));
    assert_eq!(run(&image, "ftff"), done(&[1, 2, 5, 7, 8]));
    assert_eq!(run(&image, "ftft"), done(&[1, 2, 5, 6, 7, 8]));
    assert_eq!(run(&image, "fftf"), threw(&[1, 2, 3, 5, 7]));
    assert_eq!(run(&image, "fftt"), threw(&[1, 2, 3, 5, 6, 7]));
}

#[test]
fn test_if_then_else_within_handler() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 5)?;
            b.begin_if_then_else()?;
            b.emit_load_argument(4)?;
            append(b, 6)?;
            append(b, 7)?;
            b.end_if_then_else()?;
            append(b, 8)?;
            b.end_block()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 9)?;
        b.end_block()
    });
    assert_eq!(run(&image, "ffff"), done(&[1, 2, 3, 4, 5, 7, 8, 9]));
    assert_eq!(run(&image, "ffft"), done(&[1, 2, 3, 4, 5, 6, 8, 9]));
    assert_eq!(run(&image, "tfff"), done(&[1, 5, 7, 8]));
    assert_eq!(run(&image, "tfft"), done(&[1, 5, 6, 8]));
    assert_eq!(run(&image, "ftff"), done(&[1, 2, 5, 7, 8, 9]));
    assert_eq!(run(&image, "ftft"), done(&[1, 2, 5, 6, 8, 9]));
    assert_eq!(run(&image, "fftf"), threw(&[1, 2, 3, 5, 7, 8]));
    assert_eq!(run(&image, "fftt"), threw(&[1, 2, 3, 5, 6, 8]));
}

fn append_then_zero(b: &mut Builder, value: i64) -> Result<()> {
    b.begin_block()?;
    append(b, value)?;
    b.emit_load_constant(0)?;
    b.end_block()
}

#[test]
fn test_conditional_within_handler() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 5)?;
            b.begin_conditional()?;
            b.emit_load_argument(4)?;
            append_then_zero(b, 6)?;
            append_then_zero(b, 7)?;
            b.end_conditional()?;
            b.begin_conditional()?;
            b.emit_load_argument(5)?;
            append_then_zero(b, 8)?;
            append_then_zero(b, 9)?;
            b.end_conditional()?;
            append(b, 10)?;
            b.end_block()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 11)?;
        b.end_block()
    });
    assert_eq!(run(&image, "fffft"), done(&[1, 2, 3, 4, 5, 7, 8, 10, 11]));
    assert_eq!(run(&image, "ffftf"), done(&[1, 2, 3, 4, 5, 6, 9, 10, 11]));
    assert_eq!(run(&image, "tffft"), done(&[1, 5, 7, 8, 10]));
    assert_eq!(run(&image, "tfftf"), done(&[1, 5, 6, 9, 10]));
    assert_eq!(run(&image, "ftfft"), done(&[1, 2, 5, 7, 8, 10, 11]));
    assert_eq!(run(&image, "ftftf"), done(&[1, 2, 5, 6, 9, 10, 11]));
    assert_eq!(run(&image, "fftft"), threw(&[1, 2, 3, 5, 7, 8, 10]));
    assert_eq!(run(&image, "ffttf"), threw(&[1, 2, 3, 5, 6, 9, 10]));
}

#[test]
fn test_loop_within_handler() {
    let image = build(|b| {
        let i = b.create_local_named("i")?;
        b.begin_finally_try(None, move |b| {
            b.begin_block()?;
            append(b, 3)?;
            b.begin_tee_local(i)?;
            b.emit_load_constant(4)?;
            b.end_tee_local()?;
            b.begin_while()?;
            b.begin_less_than()?;
            b.emit_load_local(i)?;
            b.emit_load_constant(7)?;
            b.end_less_than()?;
            b.begin_block()?;
            b.begin_invoke()?;
            b.emit_load_argument(0)?;
            b.emit_load_local(i)?;
            b.end_invoke()?;
            b.begin_tee_local(i)?;
            b.begin_add()?;
            b.emit_load_local(i)?;
            b.emit_load_constant(1)?;
            b.end_add()?;
            b.end_tee_local()?;
            b.end_block()?;
            b.end_while()?;
            append(b, 8)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 9)
    });
    assert_eq!(run(&image, "t"), done(&[1, 3, 4, 5, 6, 8]));
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 4, 5, 6, 8, 9]));
}

fn append_then(b: &mut Builder, value: i64, result: bool) -> Result<()> {
    b.begin_block()?;
    append(b, value)?;
    b.emit_load_constant(result)?;
    b.end_block()
}

#[test]
fn test_short_circuit_within_handler() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 3)?;
            b.begin_sc_and()?;
            append_then(b, 4, true)?;
            append_then(b, 5, false)?;
            append_then(b, 6, true)?;
            b.end_sc_and()?;
            b.begin_sc_or()?;
            append_then(b, 7, false)?;
            append_then(b, 8, true)?;
            append_then(b, 9, false)?;
            b.end_sc_or()?;
            append(b, 10)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 11)
    });
    assert_eq!(run(&image, "t"), done(&[1, 3, 4, 5, 7, 8, 10]));
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 4, 5, 7, 8, 10, 11]));
}

#[test]
fn test_non_throwing_try_catch_within_handler() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 3)?;
            let ex = b.create_local()?;
            b.begin_try_catch(Some(ex))?;
            append(b, 4)?;
            append(b, 5)?;
            b.end_try_catch()?;
            append(b, 6)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 7)
    });
    assert_eq!(run(&image, "t"), done(&[1, 3, 4, 6]));
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 4, 6, 7]));
}

#[test]
fn test_throwing_try_catch_within_handler() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 3)?;
            let ex = b.create_local()?;
            b.begin_try_catch(Some(ex))?;
            b.begin_block()?;
            append(b, 4)?;
            b.emit_throw(0)?;
            append(b, 5)?;
            b.end_block()?;
            append(b, 6)?;
            b.end_try_catch()?;
            append(b, 7)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 8)
    });
    assert_eq!(run(&image, "t"), done(&[1, 3, 4, 6, 7]));
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 4, 6, 7, 8]));
}

// ---------------------------------------------------------------------------
// Nesting
// ---------------------------------------------------------------------------

#[test]
fn test_branch_into_outer_finally() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            let lbl = b.create_label()?;
            b.begin_finally_try(None, move |b| {
                b.begin_block()?;
                append(b, 6)?;
                b.emit_branch(lbl)?;
                append(b, 7)?;
                b.end_block()
            })?;
            append(b, 5)?;
            b.end_finally_try()?;
            append(b, 8)?;
            b.emit_label(lbl)?;
            append(b, 9)?;
            b.end_block()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 10)?;
        b.end_block()
    });
    assert_eq!(run(&image, "fff"), done(&[1, 2, 3, 4, 5, 6, 9, 10]));
    assert_eq!(run(&image, "tff"), done(&[1, 5, 6, 9]));
    assert_eq!(run(&image, "ftf"), done(&[1, 2, 5, 6, 9, 10]));
    assert_eq!(run(&image, "fft"), threw(&[1, 2, 3, 5, 6, 9]));
}

#[test]
fn test_branch_while_in_parent_handler() {
    let image = build(|b| {
        b.begin_block()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            append(b, 3)?;
            b.begin_finally_try(None, |b| append(b, 7))?;
            b.begin_block()?;
            let lbl = b.create_label()?;
            append(b, 4)?;
            b.emit_branch(lbl)?;
            append(b, 5)?;
            b.emit_label(lbl)?;
            append(b, 6)?;
            b.end_block()?;
            b.end_finally_try()?;
            append(b, 8)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 9)?;
        b.end_block()
    });
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 4, 6, 7, 8, 9]));
    assert_eq!(run(&image, "t"), done(&[1, 3, 4, 6, 7, 8]));
}

#[test]
fn test_finally_nested_in_handler() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_finally_try(None, |b| append(b, 5))?;
            b.begin_block()?;
            append(b, 3)?;
            return_if(b, 2, 0)?;
            append(b, 4)?;
            b.end_block()?;
            b.end_finally_try()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        return_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()
    });
    assert_eq!(run(&image, "ff"), done(&[1, 2, 3, 4, 5]));
    assert_eq!(run(&image, "tf"), done(&[1, 3, 4, 5]));
    assert_eq!(run(&image, "ft"), done(&[1, 2, 3, 5]));
    assert_eq!(run(&image, "tt"), done(&[1, 3, 5]));
}

#[test]
fn test_handlers_run_innermost_first() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, |b| append(b, 6))?;
        b.begin_finally_try(None, |b| append(b, 5))?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 7)?;
        b.end_block()
    });
    assert_eq!(run(&image, "fff"), done(&[1, 2, 3, 4, 5, 6, 7]));
    assert_eq!(run(&image, "tff"), done(&[1, 5, 6]));
    assert_eq!(run(&image, "ftf"), done(&[1, 2, 5, 6, 7]));
    assert_eq!(run(&image, "fft"), threw(&[1, 2, 3, 5, 6]));
}

#[test]
fn test_handler_with_every_exit() {
    let image = build(|b| {
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, move |b| {
            b.begin_finally_try(None, |b| append(b, 9))?;
            exits_body(b, 5, exit)?;
            b.end_finally_try()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 10)?;
        b.end_block()
    });
    assert_eq!(run(&image, "fff"), done(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
    assert_eq!(run(&image, "tff"), done(&[1, 5, 9]));
    assert_eq!(run(&image, "ftf"), done(&[1, 2, 5, 6, 9, 10]));
    assert_eq!(run(&image, "fft"), threw(&[1, 2, 3, 5, 6, 7, 9]));
}

#[test]
fn test_handler_with_every_exit_inside_another_finally() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 11))?;
        b.begin_block()?;
        let exit = b.create_label()?;
        b.begin_finally_try(None, move |b| {
            b.begin_finally_try(None, |b| append(b, 9))?;
            exits_body(b, 5, exit)?;
            b.end_finally_try()
        })?;
        exits_body(b, 1, exit)?;
        b.end_finally_try()?;
        b.emit_label(exit)?;
        append(b, 10)?;
        b.end_block()?;
        b.end_finally_try()
    });
    assert_eq!(run(&image, "fff"), done(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]));
    assert_eq!(run(&image, "tff"), done(&[1, 5, 9, 11]));
    assert_eq!(run(&image, "ftf"), done(&[1, 2, 5, 6, 9, 10, 11]));
    assert_eq!(run(&image, "fft"), threw(&[1, 2, 3, 5, 6, 7, 9, 11]));
}

#[test]
fn test_try_catch_takes_precedence_over_finally() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| append(b, 5))?;
        let ex = b.create_local()?;
        b.begin_try_catch(Some(ex))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        b.begin_block()?;
        append(b, 3)?;
        b.emit_return(0)?;
        append(b, 4)?;
        b.end_block()?;
        b.end_try_catch()?;
        b.end_finally_try()
    });
    assert_eq!(run(&image, ""), done(&[1, 3, 5]));
}

// ---------------------------------------------------------------------------
// Guarding
// ---------------------------------------------------------------------------

fn return_or_branch_body(b: &mut Builder, lbl: Label) -> Result<()> {
    b.begin_if_then()?;
    b.emit_load_argument(1)?;
    b.emit_return(0)?;
    b.end_if_then()?;
    append(b, 2)?;
    branch_if(b, 2, lbl)?;
    append(b, 3)
}

fn append_and_throw(b: &mut Builder, value: i64) -> Result<()> {
    b.begin_block()?;
    append(b, value)?;
    b.emit_throw(123)?;
    b.end_block()
}

#[test]
fn test_handler_not_guarded_by_itself() {
    let image = build(|b| {
        let ex = b.create_local()?;
        let lbl = b.create_label()?;
        b.begin_finally_try(Some(ex), |b| append_and_throw(b, 4))?;
        b.begin_block()?;
        append(b, 1)?;
        return_or_branch_body(b, lbl)?;
        b.end_block()?;
        b.end_finally_try()?;
        b.emit_label(lbl)
    });
    assert_eq!(run(&image, "ff"), threw(&[1, 2, 3, 4]));
    assert_eq!(run(&image, "tf"), threw(&[1, 4]));
    assert_eq!(run(&image, "ft"), threw(&[1, 2, 4]));
}

#[test]
fn test_outer_handler_not_guarded_by_inner_finally() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try(None, |b| append_and_throw(b, 5))?;
        b.begin_block()?;
        append(b, 1)?;
        b.begin_finally_try(None, |b| append(b, 4))?;
        b.begin_block()?;
        return_or_branch_body(b, lbl)?;
        b.end_block()?;
        b.end_finally_try()?;
        b.end_block()?;
        b.end_finally_try()?;
        b.emit_label(lbl)
    });
    assert_eq!(run(&image, "ff"), threw(&[1, 2, 3, 4, 5]));
    assert_eq!(run(&image, "tf"), threw(&[1, 4, 5]));
    assert_eq!(run(&image, "ft"), threw(&[1, 2, 4, 5]));
}

#[test]
fn test_outer_handler_not_guarded_by_try_catch() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try(None, |b| append_and_throw(b, 5))?;
        b.begin_block()?;
        append(b, 1)?;
        let ex = b.create_local()?;
        b.begin_try_catch(Some(ex))?;
        b.begin_block()?;
        return_or_branch_body(b, lbl)?;
        b.end_block()?;
        append(b, 4)?;
        b.end_try_catch()?;
        b.end_block()?;
        b.end_finally_try()?;
        b.emit_label(lbl)
    });
    assert_eq!(run(&image, "ff"), threw(&[1, 2, 3, 5]));
    assert_eq!(run(&image, "tf"), threw(&[1, 5]));
    assert_eq!(run(&image, "ft"), threw(&[1, 2, 5]));
}

// ---------------------------------------------------------------------------
// FinallyTryCatch
// ---------------------------------------------------------------------------

#[test]
fn test_finally_try_catch_fallthrough() {
    let image = build(|b| {
        let ex = b.create_local()?;
        b.begin_finally_try_catch(Some(ex), |b| append(b, 2))?;
        append(b, 1)?;
        append(b, 3)?;
        b.end_finally_try_catch()
    });
    assert_eq!(run(&image, ""), done(&[1, 2]));
}

#[test]
fn test_finally_try_catch_exception_runs_catch_only() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        append(b, 4)?;
        b.end_finally_try_catch()
    });
    assert_eq!(run(&image, ""), done(&[1, 4]));
}

#[test]
fn test_finally_try_catch_return() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| append(b, 2))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_return(0)?;
        b.end_block()?;
        append(b, 3)?;
        b.end_finally_try_catch()?;
        append(b, 4)
    });
    assert_eq!(run(&image, ""), done(&[1, 2]));
}

#[test]
fn test_finally_try_catch_binds_exception() {
    let image = build(|b| {
        let ex = b.create_local()?;
        b.begin_finally_try_catch(Some(ex), |b| append(b, 2))?;
        b.begin_block()?;
        append(b, 1)?;
        b.begin_if_then()?;
        b.emit_load_argument(1)?;
        b.begin_throw()?;
        b.emit_load_argument(2)?;
        b.end_throw()?;
        b.end_if_then()?;
        b.end_block()?;
        b.begin_invoke()?;
        b.emit_load_argument(0)?;
        b.emit_load_local(ex)?;
        b.end_invoke()?;
        b.end_finally_try_catch()
    });
    let args = |flag: bool, payload: i64| vec![Value::Bool(flag), Value::Int(payload)];
    assert_eq!(run_with(&image, args(false, 42)), done(&[1, 2]));
    assert_eq!(run_with(&image, args(true, 42)), done(&[1, 42]));
    assert_eq!(run_with(&image, args(false, 33)), done(&[1, 2]));
    assert_eq!(run_with(&image, args(true, 33)), done(&[1, 33]));
}

#[test]
fn test_finally_try_catch_branch_out() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try_catch(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_branch(lbl)?;
        append(b, 2)?;
        b.end_block()?;
        append(b, 4)?;
        b.end_finally_try_catch()?;
        append(b, 5)?;
        b.emit_label(lbl)?;
        append(b, 6)
    });
    assert_eq!(run(&image, ""), done(&[1, 3, 6]));
}

#[test]
fn test_finally_try_catch_branch_out_of_catch() {
    let image = build(|b| {
        let lbl = b.create_label()?;
        b.begin_finally_try_catch(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        throw_if(b, 1, 0)?;
        append(b, 2)?;
        b.end_block()?;
        b.begin_block()?;
        append(b, 4)?;
        b.emit_branch(lbl)?;
        append(b, 5)?;
        b.end_block()?;
        b.end_finally_try_catch()?;
        append(b, 6)?;
        b.emit_label(lbl)?;
        append(b, 7)?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, "f"), done(&[1, 2, 3, 6, 7]));
    assert_eq!(run(&image, "t"), done(&[1, 4, 7]));
}

#[test]
fn test_finally_try_catch_branch_within_handler() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| {
            b.begin_block()?;
            let lbl = b.create_label()?;
            append(b, 3)?;
            b.emit_branch(lbl)?;
            append(b, 4)?;
            b.emit_label(lbl)?;
            append(b, 5)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_return(0)?;
        append(b, 2)?;
        b.end_block()?;
        append(b, 6)?;
        b.end_finally_try_catch()?;
        append(b, 7)
    });
    assert_eq!(run(&image, ""), done(&[1, 3, 5]));
}

#[test]
fn test_finally_try_catch_branch_within_catch() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        b.begin_block()?;
        let lbl = b.create_label()?;
        append(b, 4)?;
        b.emit_branch(lbl)?;
        append(b, 5)?;
        b.emit_label(lbl)?;
        append(b, 6)?;
        b.end_block()?;
        b.end_finally_try_catch()?;
        append(b, 7)
    });
    assert_eq!(run(&image, ""), done(&[1, 4, 6, 7]));
}

#[test]
fn test_finally_try_catch_exception_in_catch() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| append(b, 3))?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_throw(0)?;
        append(b, 2)?;
        b.end_block()?;
        b.begin_block()?;
        append(b, 4)?;
        b.emit_throw(1)?;
        append(b, 5)?;
        b.end_block()?;
        b.end_finally_try_catch()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), threw(&[1, 4]));
}

#[test]
fn test_finally_try_catch_exception_in_handler() {
    let image = build(|b| {
        b.begin_finally_try_catch(None, |b| {
            b.begin_block()?;
            append(b, 3)?;
            b.emit_throw(0)?;
            append(b, 4)?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        b.emit_return(0)?;
        append(b, 2)?;
        b.end_block()?;
        append(b, 5)?;
        b.end_finally_try_catch()?;
        b.emit_return(0)
    });
    assert_eq!(run(&image, ""), threw(&[1, 3]));
}

// ---------------------------------------------------------------------------
// Roots built inside handlers
// ---------------------------------------------------------------------------

fn throwaway_roots(b: &mut Builder) -> Result<()> {
    for _ in 0..10 {
        b.begin_root()?;
        b.emit_throw(-123)?;
        b.end_root()?;
    }
    Ok(())
}

#[test]
fn test_function_built_inside_handler() {
    let image = build_among_roots(|b| {
        b.begin_block()?;
        let lbl = b.create_label()?;
        b.begin_finally_try(None, |b| {
            b.begin_block()?;
            throwaway_roots(b)?;
            b.begin_root()?;
            append(b, 5)?;
            let f = b.end_root()?;
            b.begin_root()?;
            append(b, 6)?;
            let g = b.end_root()?;
            b.begin_invoke()?;
            b.begin_conditional()?;
            b.emit_load_argument(4)?;
            b.emit_load_function(f)?;
            b.emit_load_function(g)?;
            b.end_conditional()?;
            b.emit_load_argument(0)?;
            b.end_invoke()?;
            b.end_block()
        })?;
        exits_body(b, 1, lbl)?;
        b.end_finally_try()?;
        append(b, 7)?;
        b.emit_label(lbl)?;
        append(b, 8)?;
        b.end_block()
    });
    assert_eq!(run(&image, "ffff"), done(&[1, 2, 3, 4, 6, 7, 8]));
    assert_eq!(run(&image, "ffft"), done(&[1, 2, 3, 4, 5, 7, 8]));
    assert_eq!(run(&image, "tfff"), done(&[1, 6]));
    assert_eq!(run(&image, "tfft"), done(&[1, 5]));
    assert_eq!(run(&image, "ftff"), done(&[1, 2, 6, 8]));
    assert_eq!(run(&image, "ftft"), done(&[1, 2, 5, 8]));
    assert_eq!(run(&image, "fftf"), threw(&[1, 2, 3, 6]));
    assert_eq!(run(&image, "fftt"), threw(&[1, 2, 3, 5]));
}

#[test]
fn test_function_built_inside_handler_escapes() {
    let image = build_among_roots(|b| {
        b.begin_block()?;
        let lbl = b.create_label()?;
        let x = b.create_local()?;
        b.begin_finally_try(None, move |b| {
            b.begin_block()?;
            throwaway_roots(b)?;
            b.begin_root()?;
            append(b, 4)?;
            let f = b.end_root()?;
            b.begin_root()?;
            append(b, 5)?;
            let g = b.end_root()?;
            b.begin_store_local(x)?;
            b.begin_conditional()?;
            b.emit_load_argument(2)?;
            b.emit_load_function(f)?;
            b.emit_load_function(g)?;
            b.end_conditional()?;
            b.end_store_local()?;
            b.end_block()
        })?;
        b.begin_block()?;
        append(b, 1)?;
        branch_if(b, 1, lbl)?;
        append(b, 2)?;
        b.end_block()?;
        b.end_finally_try()?;
        append(b, 3)?;
        b.emit_label(lbl)?;
        b.begin_invoke()?;
        b.emit_load_local(x)?;
        b.emit_load_argument(0)?;
        b.end_invoke()?;
        b.end_block()
    });
    assert_eq!(run(&image, "ff"), done(&[1, 2, 3, 5]));
    assert_eq!(run(&image, "ft"), done(&[1, 2, 3, 4]));
    assert_eq!(run(&image, "tf"), done(&[1, 5]));
    assert_eq!(run(&image, "tt"), done(&[1, 4]));
}

#[test]
fn test_handler_calls_outer_function() {
    let image = build_among_roots(|b| {
        b.begin_root()?;
        append(b, 2)?;
        let f = b.end_root()?;
        b.begin_root()?;
        append(b, 3)?;
        let g = b.end_root()?;
        b.begin_finally_try(None, move |b| {
            b.begin_block()?;
            throwaway_roots(b)?;
            b.begin_invoke()?;
            b.begin_conditional()?;
            b.emit_load_argument(1)?;
            b.emit_load_function(f)?;
            b.emit_load_function(g)?;
            b.end_conditional()?;
            b.emit_load_argument(0)?;
            b.end_invoke()?;
            b.end_block()
        })?;
        append(b, 1)?;
        b.end_finally_try()
    });
    assert_eq!(run(&image, "f"), done(&[1, 3]));
    assert_eq!(run(&image, "t"), done(&[1, 2]));
}

// ---------------------------------------------------------------------------
// Coroutines
// ---------------------------------------------------------------------------

#[test]
fn test_yield_from_finally() {
    let image = build(|b| {
        b.begin_finally_try(None, |b| {
            b.begin_yield()?;
            b.emit_load_constant(4)?;
            b.end_yield()
        })?;
        b.begin_block()?;
        b.begin_yield()?;
        b.emit_load_constant(1)?;
        b.end_yield()?;
        b.begin_if_then_else()?;
        b.emit_load_constant(false)?;
        b.emit_return(2)?;
        b.emit_return(3)?;
        b.end_if_then_else()?;
        b.end_block()?;
        b.end_finally_try()
    });

    let r1 = image.call(vec![]).unwrap().into_suspended().unwrap();
    assert_eq!(r1.result(), &Value::Int(1));

    let r2 = r1.continue_with(Value::Int(3)).unwrap().into_suspended().unwrap();
    assert_eq!(r2.result(), &Value::Int(4));

    let out = r2.continue_with(Value::Int(4)).unwrap().into_returned();
    assert_eq!(out, Some(Value::Int(3)));
}
