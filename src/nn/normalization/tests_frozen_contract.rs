// =========================================================================
// Frozen batch-norm contract
//
//   1. Output is finite for every running_var >= 0 and eps > 0, including
//      running_var == 0.
//   2. eps enters before the square root: scale = w / sqrt(var + eps).
//   3. A checkpoint carrying num_batches_tracked loads without error and the
//      four vectors come out exactly as stored.
//   4. The statistics never move, whatever the input or mode.
// =========================================================================

use super::*;
use crate::nn::serialize::{load_state_dict, StateDict};

fn checkpoint(prefix: &str, c: usize, with_counter: bool) -> StateDict {
    let mut state = StateDict::new();
    let vec_of = |base: f32| (0..c).map(|i| base + i as f32 * 0.25).collect::<Vec<_>>();
    state.insert(format!("{prefix}weight"), (vec_of(1.5), vec![c]));
    state.insert(format!("{prefix}bias"), (vec_of(-0.5), vec![c]));
    state.insert(format!("{prefix}running_mean"), (vec_of(0.1), vec![c]));
    state.insert(format!("{prefix}running_var"), (vec_of(0.0), vec![c]));
    if with_counter {
        state.insert(format!("{prefix}{NUM_BATCHES_TRACKED}"), (vec![1234.0], vec![]));
    }
    state
}

#[test]
fn frozen_bn_zero_variance_is_finite() {
    let bn = FrozenBatchNorm2d::from_params(&[1.0, 3.0], &[0.0, 1.0], &[0.5, 2.0], &[0.0, 0.0], 1e-5)
        .expect("valid params");
    let x = Tensor::new(&[1e3, -1e3, 0.0, 1.0], &[1, 2, 1, 2]);
    let y = bn.forward(&x);
    assert!(y.all_finite(), "non-finite output {:?}", y.data());
}

#[test]
fn frozen_bn_eps_added_before_sqrt() {
    let eps = 0.25;
    let bn = FrozenBatchNorm2d::from_params(&[1.0], &[0.0], &[0.0], &[0.0], eps)
        .expect("valid params");
    let (scale, shift) = bn.scale_and_shift();
    // 1 / sqrt(0 + 0.25) = 2, not 1 / (sqrt(0) + 0.25) = 4
    assert!((scale[0] - 2.0).abs() < 1e-6, "scale = {}", scale[0]);
    assert_eq!(shift[0], 0.0);
}

#[test]
fn frozen_bn_legacy_counter_is_ignored() {
    let state = checkpoint("", 3, true);
    let mut bn = FrozenBatchNorm2d::new(3);
    load_state_dict(&mut bn, &state, true).expect("counter key must not fail a strict load");

    assert_eq!(bn.weight().data(), state["weight"].0.as_slice());
    assert_eq!(bn.bias().data(), state["bias"].0.as_slice());
    assert_eq!(bn.running_mean().data(), state["running_mean"].0.as_slice());
    assert_eq!(bn.running_var().data(), state["running_var"].0.as_slice());
}

#[test]
fn frozen_bn_counter_absent_also_loads() {
    let state = checkpoint("bn1.", 2, false);
    let mut bn = FrozenBatchNorm2d::new(2);
    let mut loader = crate::nn::serialize::StateLoader::new(&state);
    bn.load_state(&mut loader, "bn1").expect("counter is optional");
    assert!(loader.unconsumed().is_empty());
}

#[test]
fn frozen_bn_statistics_never_move() {
    let mut bn = FrozenBatchNorm2d::from_params(&[1.0], &[0.0], &[2.0], &[3.0], 1e-5)
        .expect("valid params");
    bn.train();
    for scale in [1.0, 10.0, -5.0] {
        let _ = bn.forward(&Tensor::full(&[4, 1, 3, 3], scale));
    }
    assert_eq!(bn.running_mean().data(), &[2.0]);
    assert_eq!(bn.running_var().data(), &[3.0]);
}

mod frozen_bn_proptest {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Finite output for any non-negative variance, zero included.
        #[test]
        fn output_finite_for_nonnegative_variance(
            weight in -100.0f32..100.0,
            bias in -100.0f32..100.0,
            mean in -100.0f32..100.0,
            var in prop_oneof![Just(0.0f32), 0.0f32..1000.0],
            eps in 1e-8f32..1.0,
            x in proptest::collection::vec(-1000.0f32..1000.0, 4),
        ) {
            let bn = FrozenBatchNorm2d::from_params(&[weight], &[bias], &[mean], &[var], eps)
                .expect("valid params");
            let y = bn.forward(&Tensor::new(&x, &[1, 1, 2, 2]));
            prop_assert!(y.all_finite(), "non-finite output {:?}", y.data());
        }

        /// Output is the per-channel affine map of the input.
        #[test]
        fn output_matches_affine_formula(
            var in 0.0f32..10.0,
            x in -10.0f32..10.0,
        ) {
            let bn = FrozenBatchNorm2d::from_params(&[0.7], &[0.2], &[-1.0], &[var], DEFAULT_EPS)
                .expect("valid params");
            let y = bn.forward(&Tensor::new(&[x], &[1, 1, 1, 1])).data()[0];
            let scale = 0.7 / (var + DEFAULT_EPS).sqrt();
            let expected = x * scale + (0.2 + scale);
            prop_assert!((y - expected).abs() <= 1e-3 * expected.abs().max(1.0));
        }
    }
}
