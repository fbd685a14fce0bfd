use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::Result;
use grad_rs::ops;
use grad_rs::{
    current_mode, CompiledGraph, ExecMode, GraphError, Shape, Tape, Tensor, Value,
};

fn traced_composition(counter: &Rc<Cell<usize>>) -> CompiledGraph {
    let counter = Rc::clone(counter);
    CompiledGraph::new(move |inputs| {
        counter.set(counter.get() + 1);
        let bumped = ops::exp(ops::square(&inputs[0])?)?;
        Ok(vec![ops::add(&bumped, &inputs[0])?])
    })
}

fn eager_composition(x: &Value) -> Result<Value, GraphError> {
    let bumped = ops::exp(ops::square(x)?)?;
    ops::add(&bumped, x)
}

#[test]
fn replay_never_reenters_the_function_body() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);

    let first = graph.call(std::slice::from_ref(&x))?;
    assert_eq!(counter.get(), 1);

    let second = graph.call(std::slice::from_ref(&x))?;
    assert_eq!(counter.get(), 1, "replay must not call the traced closure");
    assert_eq!(first[0].tensor()?, second[0].tensor()?);

    let eager = eager_composition(&x)?;
    assert_eq!(eager.tensor()?, second[0].tensor()?);
    Ok(())
}

#[test]
fn replay_accepts_different_shapes_with_fixed_topology() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);

    let small = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.1, 0.2])?);
    let large = Value::new(Tensor::from_vec(Shape::new([4]), vec![0.1, 0.2, 0.3, 0.4])?);
    let _ = graph.call(std::slice::from_ref(&small))?;
    let out = graph.call(std::slice::from_ref(&large))?;

    assert_eq!(out[0].shape()?.dims(), &[4]);
    assert_eq!(counter.get(), 1);
    Ok(())
}

#[test]
fn replay_arity_is_checked() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);
    let _ = graph.call(std::slice::from_ref(&x))?;

    let err = graph
        .call(&[x.clone(), x.clone()])
        .expect_err("arity is fixed after the build");
    assert!(matches!(err, GraphError::Arity { .. }));
    Ok(())
}

#[test]
fn captured_weights_are_hoisted_as_constants() -> Result<()> {
    let w = Value::new(Tensor::from_vec(Shape::new([2]), vec![10.0, 20.0])?).named("w");
    let w_inner = w.clone();
    let graph = CompiledGraph::new(move |inputs| Ok(vec![ops::mul(&inputs[0], &w_inner)?]));

    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0])?);
    let out = graph.call(std::slice::from_ref(&x))?;
    assert_eq!(out[0].tensor()?.data(), &[10.0, 40.0]);

    let constants = graph.constants();
    assert_eq!(constants.len(), 1);
    assert_eq!(constants[0].name().as_deref(), Some("w"));
    assert!(constants[0].has_payload(), "constants keep their buffers");
    Ok(())
}

#[test]
fn trace_buffers_are_released_after_the_build() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);
    let out = graph.call(std::slice::from_ref(&x))?;

    // Returned values are fresh leaves and keep their data.
    assert!(out[0].has_payload());

    // Internal trace outputs dropped their buffers but answer shape queries.
    let handles = graph.output_handles();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].shape().map(|s| s.dims().to_vec()), Some(vec![2]));
    let internal = handles[0].get().expect("trace outputs stay pinned");
    assert!(!internal.has_payload());
    assert!(internal.tensor().is_err());

    // The caller's input is untouched.
    assert!(x.has_payload());
    Ok(())
}

#[test]
fn structural_trace_with_undetermined_inputs() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);

    let traced = graph.call(&[Value::undetermined()])?;
    assert_eq!(counter.get(), 1);
    assert!(graph.is_built());
    assert!(traced[0].is_undetermined());

    // The pipeline built structurally replays against concrete data.
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);
    let out = graph.call(std::slice::from_ref(&x))?;
    assert_eq!(counter.get(), 1);
    assert_eq!(out[0].tensor()?, eager_composition(&x)?.tensor()?);
    Ok(())
}

#[test]
fn compiled_backward_matches_eager_backward() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);

    let (compiled_out, compiled_tape) = Tape::scoped(|| {
        let mut outputs = graph.call(std::slice::from_ref(&x))?;
        ops::sum(outputs.remove(0))
    })?;
    let compiled_grads = compiled_tape.gradient(&compiled_out, std::slice::from_ref(&x))?;

    let (eager_out, eager_tape) = Tape::scoped(|| ops::sum(eager_composition(&x)?))?;
    let eager_grads = eager_tape.gradient(&eager_out, std::slice::from_ref(&x))?;

    assert_eq!(compiled_out.tensor()?, eager_out.tensor()?);
    assert_eq!(compiled_grads[0], eager_grads[0]);
    Ok(())
}

#[test]
fn compiled_backward_after_replay_matches_eager() -> Result<()> {
    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let warmup = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.1, 0.9])?);
    let _ = graph.call(std::slice::from_ref(&warmup))?;

    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);
    let (out, tape) = Tape::scoped(|| {
        let mut outputs = graph.call(std::slice::from_ref(&x))?;
        ops::sum(outputs.remove(0))
    })?;
    let grads = tape.gradient(&out, std::slice::from_ref(&x))?;

    let (eager_out, eager_tape) = Tape::scoped(|| ops::sum(eager_composition(&x)?))?;
    let eager_grads = eager_tape.gradient(&eager_out, std::slice::from_ref(&x))?;
    assert_eq!(out.tensor()?, eager_out.tensor()?);
    assert_eq!(grads[0], eager_grads[0]);
    Ok(())
}

#[test]
fn nested_compiled_graphs_replay_transparently() -> Result<()> {
    let inner_counter = Rc::new(Cell::new(0));
    let inner_counter2 = Rc::clone(&inner_counter);
    let inner = CompiledGraph::new(move |inputs| {
        inner_counter2.set(inner_counter2.get() + 1);
        Ok(vec![ops::square(&inputs[0])?])
    });

    let outer_counter = Rc::new(Cell::new(0));
    let outer_counter2 = Rc::clone(&outer_counter);
    let inner_for_outer = inner.clone();
    let outer = CompiledGraph::new(move |inputs| {
        outer_counter2.set(outer_counter2.get() + 1);
        let mut squared = inner_for_outer.call(inputs)?;
        Ok(vec![ops::add(squared.remove(0), 1.0f32)?])
    });

    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![2.0, 3.0])?);
    let first = outer.call(std::slice::from_ref(&x))?;
    assert_eq!(first[0].tensor()?.data(), &[5.0, 10.0]);
    assert_eq!((outer_counter.get(), inner_counter.get()), (1, 1));

    let second = outer.call(std::slice::from_ref(&x))?;
    assert_eq!(second[0].tensor()?.data(), &[5.0, 10.0]);
    assert_eq!(
        (outer_counter.get(), inner_counter.get()),
        (1, 1),
        "neither closure may run again during replay"
    );
    Ok(())
}

#[test]
fn self_invocation_during_build_is_refused() -> Result<()> {
    let slot: Rc<RefCell<Option<CompiledGraph>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&slot);
    let graph = CompiledGraph::new(move |inputs| {
        match slot2.borrow().as_ref() {
            Some(this) => this.call(inputs),
            None => Ok(vec![inputs[0].clone()]),
        }
    });
    *slot.borrow_mut() = Some(graph.clone());

    let err = graph
        .call(&[Value::from(1.0f32)])
        .expect_err("self-recursive trace must fail");
    assert!(matches!(err, GraphError::Reentrancy { .. }));
    Ok(())
}

#[test]
fn trace_runs_under_construction_mode() -> Result<()> {
    assert_eq!(current_mode(), ExecMode::Eager);
    let seen = Rc::new(Cell::new(ExecMode::Eager));
    let seen2 = Rc::clone(&seen);
    let graph = CompiledGraph::new(move |inputs| {
        seen2.set(current_mode());
        Ok(vec![ops::square(&inputs[0])?])
    });

    let x = Value::from(2.0f32);
    let _ = graph.call(std::slice::from_ref(&x))?;
    assert_eq!(seen.get(), ExecMode::UnderConstruction);
    assert_eq!(current_mode(), ExecMode::Eager);
    Ok(())
}

#[test]
fn variables_pack_and_unpack_at_mode_boundaries() -> Result<()> {
    let tensors = vec![
        Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0])?,
        Tensor::scalar(3.0),
    ];
    let values = grad_rs::pack_variables(tensors.clone());
    assert!(values.iter().all(|v| v.creator().is_none()));
    let unpacked = grad_rs::unpack_variables(&values)?;
    assert_eq!(unpacked, tensors);
    Ok(())
}

#[test]
fn profiling_counters_observe_trace_and_replay() -> Result<()> {
    grad_rs::profiling::enable();
    grad_rs::profiling::reset();

    let counter = Rc::new(Cell::new(0));
    let graph = traced_composition(&counter);
    let x = Value::new(Tensor::from_vec(Shape::new([2]), vec![0.5, 1.0])?);
    let _ = graph.call(std::slice::from_ref(&x))?;
    let _ = graph.call(std::slice::from_ref(&x))?;

    let snapshot = grad_rs::profiling::snapshot();
    let calls = |name: &str| {
        snapshot
            .iter()
            .find(|line| line.name == name)
            .map(|line| line.calls)
            .unwrap_or(0)
    };
    assert!(calls("graph::trace") >= 1);
    assert!(calls("graph::replay") >= 1);
    grad_rs::profiling::disable();
    Ok(())
}
