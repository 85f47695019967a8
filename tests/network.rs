use approx::assert_abs_diff_eq;
use ndarray::{ArrayD, IxDyn};
use pocket_train::activations::MaxoutKind;
use pocket_train::config::{
    ClassifierConfig, ConvPoolConfig, DotProductConfig, InputConfig, MergeConfig, MergeMode,
    NormSettings, ObjectiveConfig,
};
use pocket_train::data::InMemory;
use pocket_train::layers::Layer;
use pocket_train::{
    Activation, Backend, Batch, CompiledNetwork, Error, FiniteDifference, LayerSpec, Network,
    Param, Result, Sgd, Tensor,
};

/// Always fails, the way an unavailable device would.
struct FailingBackend;

impl Backend for FailingBackend {
    fn gradients(
        &self,
        _loss: &mut dyn FnMut() -> Result<f32>,
        _params: &[Param],
    ) -> Result<Vec<ArrayD<f32>>> {
        Err(Error::Backend("device unavailable".to_string()))
    }
}

/// Returns NaN for every gradient entry.
struct NanBackend;

impl Backend for NanBackend {
    fn gradients(
        &self,
        _loss: &mut dyn FnMut() -> Result<f32>,
        params: &[Param],
    ) -> Result<Vec<ArrayD<f32>>> {
        Ok(params
            .iter()
            .map(|p| ArrayD::from_elem(IxDyn(p.shape()), f32::NAN))
            .collect())
    }
}

fn separable_batch() -> Batch {
    Batch::new(
        Tensor::from_vec(
            vec![1.0, 0.0, 0.0, 1.0, 0.9, 0.1, 0.1, 0.9],
            &[4, 2],
        )
        .unwrap(),
        Tensor::from_vec(vec![0.0, 1.0, 0.0, 1.0], &[4]).unwrap(),
    )
}

fn logistic(seed: u64) -> Network {
    let mut net = Network::with_seed(seed);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("input"))
        .unwrap();
    net.add_layer(LayerSpec::new("nll", ObjectiveConfig::default()).origin("softmax"))
        .unwrap();
    net
}

fn normalized(seed: u64) -> CompiledNetwork {
    let mut net = Network::with_seed(seed);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    let fc = DotProductConfig {
        batch_norm: true,
        ..DotProductConfig::new(3)
    };
    net.add_layer(LayerSpec::new("fc", fc).origin("input")).unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("fc"))
        .unwrap();
    net.add_layer(LayerSpec::new("nll", ObjectiveConfig::default()).origin("softmax"))
        .unwrap();
    net.finalize("nll", "input").unwrap()
}

fn snapshot(net: &CompiledNetwork) -> Vec<ArrayD<f32>> {
    net.all_params().iter().map(Param::value).collect()
}

#[test]
fn test_mnist_graph_finalizes() {
    let mut net = Network::with_seed(0);
    net.add_layer_json(
        r#"{"type": "input", "id": "input", "origin": "none", "config": {"shape": [2, 1, 28, 28]}}"#,
    )
    .unwrap();
    net.add_layer_json(
        r#"{"type": "conv_pool", "id": "conv1", "origin": "input",
            "config": {"nkerns": 8, "filter_shape": [3, 3], "pool_size": [2, 2],
                       "pool_type": "max", "activation": "relu",
                       "border_mode": "valid", "stride": [1, 1]}}"#,
    )
    .unwrap();
    net.add_layer_json(
        r#"{"type": "classifier", "id": "softmax", "origin": "conv1", "config": {"num_classes": 10}}"#,
    )
    .unwrap();
    net.add_layer_json(
        r#"{"type": "objective", "id": "nll", "origin": "softmax", "config": {"objective": "nll"}}"#,
    )
    .unwrap();

    assert_eq!(net.layer("conv1").unwrap().output_shape(), &[2, 8, 13, 13]);

    let net = net.finalize("nll", "input").unwrap();
    assert_eq!(net.train_path(), vec!["input", "conv1", "softmax", "nll"]);
    assert_eq!(net.inference_path(), vec!["input", "conv1", "softmax"]);
    assert_eq!(net.all_params().len(), 4);
    assert_eq!(net.trainable_params().len(), 4);
    assert!(net.auxiliary_params().is_empty());
    assert!(net.all_update_rules().is_empty());

    let images = Tensor::zeros(&[2, 1, 28, 28]);
    let scores = net.inference_step(&images).unwrap();
    assert_eq!(scores.shape(), &[2, 10]);

    let summary = net.summary();
    assert!(summary.contains("conv1 (conv_pool)"));
    assert!(summary.contains("[2, 8, 13, 13]"));
}

#[test]
fn test_duplicate_id_and_unknown_origin() {
    let mut net = logistic(0);

    let err = net
        .add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("input"))
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateId(ref id) if id == "softmax"));

    let err = net
        .add_layer(LayerSpec::new("fc", DotProductConfig::new(2)).origin("nowhere"))
        .unwrap_err();
    match err {
        Error::UnknownOrigin { layer, origin } => {
            assert_eq!(layer, "fc");
            assert_eq!(origin, "nowhere");
        }
        other => panic!("unexpected error {:?}", other),
    }

    // failed additions leave the graph as it was
    assert_eq!(net.len(), 3);
    assert!(net.finalize("nll", "input").is_ok());
}

#[test]
fn test_finalize_incomplete_graph() {
    let mut net = Network::with_seed(0);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("input"))
        .unwrap();

    let err = net.finalize("nll", "input").unwrap_err();
    assert!(matches!(err, Error::IncompleteGraph(_)));
}

#[test]
fn test_objective_must_follow_classifier() {
    let mut net = Network::with_seed(0);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    net.add_layer(LayerSpec::new("fc", DotProductConfig::new(2)).origin("input"))
        .unwrap();
    net.add_layer(LayerSpec::new("nll", ObjectiveConfig::default()).origin("fc"))
        .unwrap();

    let err = net.finalize("nll", "input").unwrap_err();
    assert!(err.to_string().contains("classifier"));
}

fn image_input() -> Network {
    let mut net = Network::with_seed(0);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[2, 1, 8, 8])))
        .unwrap();
    net
}

#[test]
fn test_bad_activation_parameters_are_config_errors() {
    let mut net = image_input();

    let conv = ConvPoolConfig {
        activation: Activation::Maxout {
            kind: MaxoutKind::Max,
            size: 0,
        },
        ..ConvPoolConfig::new(4)
    };
    let err = net
        .add_layer(LayerSpec::new("conv", conv).origin("input"))
        .unwrap_err();
    assert!(matches!(err, Error::Config { ref layer, .. } if layer == "conv"));

    let softmax = ClassifierConfig {
        activation: Activation::Softmax { temperature: 0.0 },
        ..ClassifierConfig::new(2)
    };
    let err = net
        .add_layer(LayerSpec::new("softmax", softmax).origin("input"))
        .unwrap_err();
    assert!(matches!(err, Error::Config { ref layer, .. } if layer == "softmax"));

    assert_eq!(net.len(), 1);
}

#[test]
fn test_bad_norm_settings_are_config_errors() {
    let mut net = image_input();

    let err = net
        .add_layer_json(
            r#"{"type": "conv_pool", "id": "conv", "origin": "input",
                "config": {"nkerns": 2, "batch_norm": true, "activation": "linear",
                           "norm": {"epsilon": -5.0}}}"#,
        )
        .unwrap_err();
    assert!(matches!(err, Error::Config { ref layer, .. } if layer == "conv"));

    let fc = DotProductConfig {
        batch_norm: true,
        norm: NormSettings {
            running_average_factor: 7.0,
            ..NormSettings::default()
        },
        ..DotProductConfig::new(3)
    };
    let err = net
        .add_layer(LayerSpec::new("fc", fc).origin("input"))
        .unwrap_err();
    assert!(err.to_string().contains("running_average_factor"));

    // without batch norm the settings are unused
    let conv = ConvPoolConfig {
        norm: NormSettings {
            epsilon: -5.0,
            ..NormSettings::default()
        },
        ..ConvPoolConfig::new(2)
    };
    assert!(net
        .add_layer(LayerSpec::new("plain", conv).origin("input"))
        .is_ok());
}

#[test]
fn test_train_steps_reduce_loss() {
    let mut net = logistic(3).finalize("nll", "input").unwrap();
    let batch = separable_batch();
    let backend = FiniteDifference::default();
    let mut sgd = Sgd::new(1.0);

    let before = net.evaluate(&batch).unwrap();
    assert_abs_diff_eq!(before.objective, 2.0_f32.ln(), epsilon = 0.05);

    for _ in 0..30 {
        net.train_step(&batch, &backend, &mut sgd).unwrap();
    }

    let after = net.evaluate(&batch).unwrap();
    assert!(after.loss < before.loss);
    assert_eq!(after.error, 0.0);
    assert_eq!(net.steps(), 30);
    assert_eq!(net.predict(&batch.input).unwrap(), vec![0, 1, 0, 1]);
}

#[test]
fn test_failing_backend_changes_nothing() {
    let mut net = normalized(1);
    let batch = separable_batch();
    let before = snapshot(&net);
    let mut sgd = Sgd::new(0.5).with_momentum(0.9);

    let err = net.train_step(&batch, &FailingBackend, &mut sgd).unwrap_err();
    match err {
        Error::Backend(message) => assert_eq!(message, "device unavailable"),
        other => panic!("backend error was rewritten: {:?}", other),
    }

    assert_eq!(snapshot(&net), before);
    assert!(net
        .trainable_params()
        .iter()
        .all(|p| sgd.velocity(p).is_none()));
    assert_eq!(net.steps(), 0);
}

#[test]
fn test_non_finite_gradients_change_nothing() {
    let mut net = normalized(1);
    let batch = separable_batch();
    let before = snapshot(&net);
    let mut sgd = Sgd::new(0.5).with_momentum(0.9);

    let err = net.train_step(&batch, &NanBackend, &mut sgd).unwrap_err();
    assert!(matches!(err, Error::NonFinite(_)));
    assert_eq!(snapshot(&net), before);
    assert!(net
        .trainable_params()
        .iter()
        .all(|p| sgd.velocity(p).is_none()));
}

#[test]
fn test_running_statistics_move_after_train_step() {
    let mut net = normalized(2);
    let batch = separable_batch();

    assert_eq!(net.auxiliary_params().len(), 2);
    assert_eq!(net.all_update_rules().len(), 2);
    let mean = net.all_update_rules()[0].target.clone();
    let var = net.all_update_rules()[1].target.clone();
    assert_eq!(mean.name(), "fc.running_mean");
    assert_eq!(var.name(), "fc.running_var");

    let mean_before = mean.value();
    let var_before = var.value();

    // inference never writes
    net.inference_step(&batch.input).unwrap();
    net.evaluate(&batch).unwrap();
    assert_eq!(mean.value(), mean_before);

    net.train_step(&batch, &FiniteDifference::default(), &mut Sgd::new(0.1))
        .unwrap();
    assert_ne!(mean.value(), mean_before);
    assert_ne!(var.value(), var_before);
}

#[test]
fn test_regularization_in_loss() {
    let mut net = Network::with_seed(4);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("input"))
        .unwrap();
    let objective = ObjectiveConfig {
        regularization: Some((0.1, 0.01)),
        ..ObjectiveConfig::default()
    };
    net.add_layer(LayerSpec::new("nll", objective).origin("softmax"))
        .unwrap();
    let net = net.finalize("nll", "input").unwrap();

    let metrics = net.evaluate(&separable_batch()).unwrap();
    let penalty = 0.1 * net.l1() + 0.01 * net.l2();
    assert!(penalty > 0.0);
    assert_abs_diff_eq!(metrics.loss, metrics.objective + penalty, epsilon = 1e-6);
}

#[test]
fn test_shared_params_counted_once() {
    let mut net = Network::with_seed(5);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[4, 2])))
        .unwrap();
    net.add_layer(LayerSpec::new("fc1", DotProductConfig::new(3)).origin("input"))
        .unwrap();

    let shared = net.layer("fc1").unwrap().params().to_vec();
    let fc2 = DotProductConfig {
        input_params: Some(shared.clone()),
        ..DotProductConfig::new(3)
    };
    net.add_layer(LayerSpec::new("fc2", fc2).origin("input")).unwrap();
    net.add_layer(
        LayerSpec::new(
            "sum",
            MergeConfig {
                mode: MergeMode::Sum,
            },
        )
        .origin("fc1")
        .origin("fc2"),
    )
    .unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(2)).origin("sum"))
        .unwrap();
    net.add_layer(LayerSpec::new("nll", ObjectiveConfig::default()).origin("softmax"))
        .unwrap();

    let net = net.finalize("nll", "input").unwrap();
    assert_eq!(net.all_params().len(), 4);
    assert!(net.all_params()[0].ptr_eq(&shared[0]));
}

#[test]
fn test_unreachable_layers_are_left_out() {
    let mut net = logistic(6);
    net.add_layer(LayerSpec::new("spare", DotProductConfig::new(7)).origin("input"))
        .unwrap();

    let net = net.finalize("nll", "input").unwrap();
    assert!(!net.train_path().contains(&"spare"));
    assert_eq!(net.all_params().len(), 2);
    assert!(net.layer("spare").is_some());
}

#[test]
fn test_concatenate_branches() {
    let mut net = Network::with_seed(7);
    net.add_layer(LayerSpec::new("input", InputConfig::new(&[2, 1, 6, 6])))
        .unwrap();
    net.add_layer(LayerSpec::new("conv", ConvPoolConfig::new(2)).origin("input"))
        .unwrap();
    net.add_layer(LayerSpec::new("flat", pocket_train::config::FlattenConfig {}).origin("conv"))
        .unwrap();
    net.add_layer(
        LayerSpec::new("fc", DotProductConfig::new(5))
            .origin("input")
            .dropout(0.5),
    )
    .unwrap();
    net.add_layer(LayerSpec::new("cat", MergeConfig::default()).origin("flat").origin("fc"))
        .unwrap();
    net.add_layer(LayerSpec::new("softmax", ClassifierConfig::new(3)).origin("cat"))
        .unwrap();
    net.add_layer(LayerSpec::new("nll", ObjectiveConfig::default()).origin("softmax"))
        .unwrap();

    // conv: 2 x 2 x 2 flattened, plus 5 features
    assert_eq!(net.layer("cat").unwrap().output_shape(), &[2, 13]);

    let net = net.finalize("nll", "input").unwrap();
    let x = Tensor::from_vec((0..72).map(|v| v as f32 / 72.0).collect(), &[2, 1, 6, 6]).unwrap();
    let a = net.inference_step(&x).unwrap();
    let b = net.inference_step(&x).unwrap();
    assert_eq!(a.shape(), &[2, 3]);
    assert_eq!(a, b);
}

#[test]
fn test_save_and_load_params() {
    let source = logistic(8).finalize("nll", "input").unwrap();
    let target = logistic(9).finalize("nll", "input").unwrap();
    let x = separable_batch().input;
    assert_ne!(
        source.inference_step(&x).unwrap(),
        target.inference_step(&x).unwrap()
    );

    let mut buf = Vec::new();
    source.save_params(&mut buf).unwrap();
    target.load_params(buf.as_slice()).unwrap();

    assert_eq!(
        source.inference_step(&x).unwrap(),
        target.inference_step(&x).unwrap()
    );
}

#[test]
fn test_train_epoch() {
    let mut net = logistic(10).finalize("nll", "input").unwrap();
    let mut stream = InMemory::new(vec![separable_batch(), separable_batch()]);

    let first = net
        .train_epoch(&mut stream, &FiniteDifference::default(), &mut Sgd::new(1.0))
        .unwrap();
    let second = net
        .train_epoch(&mut stream, &FiniteDifference::default(), &mut Sgd::new(1.0))
        .unwrap();

    assert_eq!(net.steps(), 4);
    assert!(second.loss < first.loss);
}
