use anyhow::Result;
use grad_rs::ops;
use grad_rs::{GraphError, Shape, Tape, Tensor, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn assert_close(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn chain_rule_through_unary_ops() -> Result<()> {
    let x = Value::from(0.5f32);
    let (y, tape) = Tape::scoped(|| ops::square(ops::exp(ops::square(&x)?)?))?;

    assert_close(y.tensor()?.item()?, 1.648_721_3);
    // dy/dx = 4x * exp(2x^2)
    let grads = tape.gradient(&y, std::slice::from_ref(&x))?;
    assert_close(grads[0].item()?, 3.297_442_5);
    Ok(())
}

#[test]
fn two_argument_sum_of_squares() -> Result<()> {
    let a = Value::from(2.0f32);
    let b = Value::from(3.0f32);
    let (c, tape) = Tape::scoped(|| ops::add(ops::square(&a)?, ops::square(&b)?))?;

    assert_close(c.tensor()?.item()?, 13.0);
    let grads = tape.gradient(&c, &[a.clone(), b.clone()])?;
    assert_close(grads[0].item()?, 4.0);
    assert_close(grads[1].item()?, 6.0);
    Ok(())
}

#[test]
fn shared_variable_fan_out_accumulates() -> Result<()> {
    let x = Value::from(3.0f32);
    let (y, tape) = Tape::scoped(|| ops::add(ops::add(&x, &x)?, &x))?;

    assert_close(y.tensor()?.item()?, 9.0);
    let grads = tape.gradient(&y, std::slice::from_ref(&x))?;
    assert_close(grads[0].item()?, 3.0);
    Ok(())
}

#[test]
fn broadcast_gradient_collapses_to_operand_rank() -> Result<()> {
    let x = Value::new(Tensor::from_vec(Shape::new([3]), vec![1.0, 2.0, 3.0])?);
    let y = Value::new(Tensor::from_vec(
        Shape::new([2, 3]),
        vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
    )?);
    let (z, tape) = Tape::scoped(|| ops::add(&x, &y))?;

    assert_eq!(z.shape()?.dims(), &[2, 3]);
    let grads = tape.gradient(&z, &[x.clone(), y.clone()])?;
    assert_eq!(grads[0].shape().dims(), &[3]);
    assert_eq!(grads[0].data(), &[2.0, 2.0, 2.0]);
    assert_eq!(grads[1].shape().dims(), &[2, 3]);
    assert_eq!(grads[1].data(), &[1.0; 6]);
    Ok(())
}

#[test]
fn stop_gradient_branch_acts_as_constant() -> Result<()> {
    let x = Value::from(3.0f32);
    // y = x * stop(x): forward sees 9, backward treats the wrapped branch
    // as a constant factor of 3.
    let (y, tape) = Tape::scoped(|| ops::mul(&x, ops::stop_gradient(&x)?))?;

    assert_close(y.tensor()?.item()?, 9.0);
    let grads = tape.gradient(&y, std::slice::from_ref(&x))?;
    assert_close(grads[0].item()?, 3.0);
    Ok(())
}

#[test]
fn relu_style_mask_with_stop_gradient() -> Result<()> {
    let x = Value::new(Tensor::from_vec(
        Shape::new([4]),
        vec![-2.0, -0.5, 0.5, 2.0],
    )?);
    let (y, tape) = Tape::scoped(|| {
        let mask = ops::stop_gradient(ops::to_float(ops::greater(&x, 0.0)?)?)?;
        ops::sum(ops::mul(&mask, &x)?)
    })?;

    assert_close(y.tensor()?.item()?, 2.5);
    let grads = tape.gradient(&y, std::slice::from_ref(&x))?;
    assert_eq!(grads[0].data(), &[0.0, 0.0, 1.0, 1.0]);
    Ok(())
}

#[test]
fn matmul_gradients_match_hand_computation() -> Result<()> {
    let x = Value::new(Tensor::from_vec(
        Shape::new([2, 2]),
        vec![1.0, 2.0, 3.0, 4.0],
    )?);
    let w = Value::new(Tensor::from_vec(
        Shape::new([2, 2]),
        vec![5.0, 6.0, 7.0, 8.0],
    )?);
    let (loss, tape) = Tape::scoped(|| ops::sum(ops::matmul(&x, &w)?))?;

    assert_close(loss.tensor()?.item()?, 134.0);
    let grads = tape.gradient(&loss, &[x.clone(), w.clone()])?;
    assert_eq!(grads[0].data(), &[11.0, 15.0, 11.0, 15.0]);
    assert_eq!(grads[1].data(), &[4.0, 4.0, 6.0, 6.0]);
    Ok(())
}

#[test]
fn shape_tuple_values_flow_through_reshape() -> Result<()> {
    let x = Value::new(Tensor::from_vec(
        Shape::new([2, 3]),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
    )?);
    let (loss, tape) = Tape::scoped(|| {
        let flat = ops::reshape(&x, [6usize])?;
        let dims = ops::shape_of(&x)?;
        let restored = ops::reshape(&flat, &dims)?;
        ops::sum(&restored)
    })?;

    assert_close(loss.tensor()?.item()?, 21.0);
    let grads = tape.gradient(&loss, std::slice::from_ref(&x))?;
    assert_eq!(grads[0].shape().dims(), &[2, 3]);
    assert_eq!(grads[0].data(), &[1.0; 6]);
    Ok(())
}

#[test]
fn quotient_and_difference_gradients() -> Result<()> {
    let a = Value::from(4.0f32);
    let b = Value::from(2.0f32);
    // y = -(a - b) / b
    let (y, tape) = Tape::scoped(|| ops::neg(ops::div(ops::sub(&a, &b)?, &b)?))?;

    assert_close(y.tensor()?.item()?, -1.0);
    let grads = tape.gradient(&y, &[a.clone(), b.clone()])?;
    assert_close(grads[0].item()?, -0.5);
    assert_close(grads[1].item()?, 1.0);
    Ok(())
}

#[test]
fn broadcast_helpers_round_trip_gradients() -> Result<()> {
    let x = Value::new(Tensor::from_vec(Shape::new([3]), vec![1.0, 2.0, 3.0])?);
    let (loss, tape) = Tape::scoped(|| {
        let expanded = ops::broadcast_to(&x, [2usize, 3])?;
        let collapsed = ops::sum_to(&expanded, [3usize])?;
        ops::sum(&collapsed)
    })?;

    assert_close(loss.tensor()?.item()?, 12.0);
    let grads = tape.gradient(&loss, std::slice::from_ref(&x))?;
    assert_eq!(grads[0].data(), &[2.0, 2.0, 2.0]);
    Ok(())
}

#[test]
fn incompatible_operands_surface_shape_mismatch() -> Result<()> {
    let a = Value::new(Tensor::from_vec(Shape::new([3]), vec![1.0, 2.0, 3.0])?);
    let b = Value::new(Tensor::from_vec(Shape::new([4]), vec![1.0; 4])?);
    let err = ops::add(&a, &b).expect_err("ranks cannot broadcast");
    assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    Ok(())
}

#[test]
fn autodiff_agrees_with_central_differences() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let base = Tensor::randn(Shape::new([5]), 0.4, &mut rng);
    let f = |t: &Tensor| -> Result<f32, GraphError> {
        let v = Value::new(t.clone());
        Ok(ops::sum(ops::square(ops::exp(&v)?)?)?.tensor()?.item()?)
    };

    let x = Value::new(base.clone());
    let (loss, tape) = Tape::scoped(|| ops::sum(ops::square(ops::exp(&x)?)?))?;
    let grads = tape.gradient(&loss, std::slice::from_ref(&x))?;

    let eps = 1e-3f32;
    for i in 0..base.len() {
        let mut plus = base.data().to_vec();
        let mut minus = plus.clone();
        plus[i] += eps;
        minus[i] -= eps;
        let hi = f(&Tensor::from_vec(Shape::new([5]), plus)?)?;
        let lo = f(&Tensor::from_vec(Shape::new([5]), minus)?)?;
        let numeric = (hi - lo) / (2.0 * eps);
        let analytic = grads[0].data()[i];
        assert!(
            (numeric - analytic).abs() <= 1e-2 * (1.0 + analytic.abs()),
            "component {i}: numeric {numeric} vs analytic {analytic}"
        );
    }
    Ok(())
}

#[test]
fn generations_count_topological_depth() -> Result<()> {
    let x = Value::from(1.0f32);
    let (y, _tape) = Tape::scoped(|| ops::exp(ops::square(&x)?))?;

    assert_eq!(x.generation(), 0);
    let outer = y.creator().expect("exp should be recorded");
    assert_eq!(y.generation(), outer.generation() + 1);

    let mid = outer.inputs()[0].clone();
    let inner = mid.creator().expect("square should be recorded");
    assert_eq!(mid.generation(), inner.generation() + 1);
    assert!(outer.generation() > inner.generation());
    Ok(())
}

#[test]
fn untaped_operations_stay_leaves() -> Result<()> {
    let x = Value::from(2.0f32);
    let y = ops::square(&x)?;
    assert!(y.creator().is_none());
    assert_eq!(y.generation(), 0);
    assert_close(y.tensor()?.item()?, 4.0);
    Ok(())
}

#[test]
fn value_handle_outlives_its_value() -> Result<()> {
    let handle = {
        let v = Value::new(Tensor::from_vec(Shape::new([2]), vec![1.0, 2.0])?);
        v.reference()
    };
    assert!(handle.get().is_none());
    assert_eq!(handle.shape().map(|s| s.dims().to_vec()), Some(vec![2]));
    assert_eq!(handle.dtype(), Some(grad_rs::DType::F32));
    Ok(())
}
