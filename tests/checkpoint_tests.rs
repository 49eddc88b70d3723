//! Checkpoint loading through SafeTensors files.
//!
//! Exported detection checkpoints carry `torchvision` parameter names, the
//! legacy `num_batches_tracked` counters and a classifier head; all three
//! must load into a frozen trunk.

use masked_backbone::nn::serialize::{load_state_dict, load_state_dict_file, save_model, state_dict};
use masked_backbone::nn::{FrozenBatchNorm2d, NUM_BATCHES_TRACKED};
use masked_backbone::prelude::*;
use masked_backbone::serialization::safetensors::save_safetensors;

fn add_legacy_keys(state: &mut StateDict) {
    let bn_prefixes: Vec<String> = state
        .keys()
        .filter_map(|k| k.strip_suffix(".running_mean").map(str::to_string))
        .collect();
    for prefix in bn_prefixes {
        state.insert(format!("{prefix}.{NUM_BATCHES_TRACKED}"), (vec![1000.0], vec![]));
    }
    state.insert("fc.weight".to_string(), (vec![0.01; 1000 * 2048], vec![1000, 2048]));
    state.insert("fc.bias".to_string(), (vec![0.0; 1000], vec![1000]));
}

#[test]
fn test_pretrained_checkpoint_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("resnet50.safetensors");

    let source = ResNet::new(ResNetVariant::ResNet50, false, Some(11)).expect("valid trunk");
    let mut state = state_dict(&source, "");
    add_legacy_keys(&mut state);
    save_safetensors(&path, &state).expect("write checkpoint");

    let weights = load_state_dict_file(&path).expect("read checkpoint");
    let config = BackboneConfig {
        hidden_dim: 8,
        seed: Some(99),
        ..BackboneConfig::default()
    };
    let loaded = build_backbone(&config, Some(&weights)).expect("checkpoint matches trunk");
    let reference = build_backbone(
        &BackboneConfig {
            seed: Some(11),
            ..config.clone()
        },
        None,
    )
    .expect("valid config");

    let batch = NestedTensor::from_images(&[Tensor::full(&[3, 32, 24], 0.3)]).expect("one image");
    assert_eq!(
        loaded.forward(&batch).expect("mask present"),
        reference.forward(&batch).expect("mask present")
    );
}

#[test]
fn test_checkpoint_with_foreign_keys_rejected() {
    let source = ResNet::new(ResNetVariant::ResNet50, false, Some(1)).expect("valid trunk");
    let mut state = state_dict(&source, "");
    state.insert("transformer.weight".to_string(), (vec![0.0; 4], vec![4]));

    let err = build_backbone(&BackboneConfig::default(), Some(&state)).unwrap_err();
    assert!(matches!(err, BackboneError::UnexpectedParameters(ref keys) if keys == &["transformer.weight"]));
}

#[test]
fn test_checkpoint_missing_tensor_rejected() {
    let source = ResNet::new(ResNetVariant::ResNet50, false, Some(1)).expect("valid trunk");
    let mut state = state_dict(&source, "");
    state.remove("layer3.2.bn2.running_var");

    let err = build_backbone(&BackboneConfig::default(), Some(&state)).unwrap_err();
    assert!(matches!(err, BackboneError::MissingParameter(ref key) if key == "layer3.2.bn2.running_var"));
}

#[test]
fn test_frozen_norm_file_keeps_stored_statistics() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("bn.safetensors");

    let mut state = StateDict::new();
    state.insert("weight".to_string(), (vec![1.5, -2.0, 0.25], vec![3]));
    state.insert("bias".to_string(), (vec![0.1, 0.2, 0.3], vec![3]));
    state.insert("running_mean".to_string(), (vec![3.0, -1.0, 0.0], vec![3]));
    state.insert("running_var".to_string(), (vec![4.0, 0.0, 9.0], vec![3]));
    state.insert(NUM_BATCHES_TRACKED.to_string(), (vec![12345.0], vec![]));
    save_safetensors(&path, &state).expect("write");

    let mut bn = FrozenBatchNorm2d::new(3);
    let loaded = load_state_dict_file(&path).expect("read");
    load_state_dict(&mut bn, &loaded, true).expect("counter is accepted");

    assert_eq!(bn.weight().data(), &[1.5, -2.0, 0.25]);
    assert_eq!(bn.bias().data(), &[0.1, 0.2, 0.3]);
    assert_eq!(bn.running_mean().data(), &[3.0, -1.0, 0.0]);
    assert_eq!(bn.running_var().data(), &[4.0, 0.0, 9.0]);

    // the counter is not part of the saved state
    let resaved = dir.path().join("bn_resaved.safetensors");
    save_model(&bn, &resaved).expect("write");
    let reread = load_state_dict_file(&resaved).expect("read");
    assert!(!reread.contains_key(NUM_BATCHES_TRACKED));
    assert_eq!(reread.len(), 4);
}
