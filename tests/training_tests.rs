use std::sync::Arc;

use primitive_nn::gradient_check;
use primitive_nn::loss::CrossEntropy;
use primitive_nn::optimizers::Sgd;
use primitive_nn::regularization::{Composite, L1, L2};
use primitive_nn::schedulers::Constant;
use primitive_nn::{
    Activation, ComputationNode, DenseNode, Dropout, Euclidean, Layer, Network, NetworkConfig, PiecewiseLinear, Registry, Regularizer,
    Sigmoid, Tanh, Trainer,
};

fn assert_close(actual: f64, expected: f64, tol: f64) {
    assert!((actual - expected).abs() <= tol, "expected {expected}, got {actual}");
}

/// Three single-node layers with a two-slope activation (2 below zero, 3 above).
fn piecewise_chain() -> Network {
    let act: Arc<dyn Activation> = Arc::new(PiecewiseLinear::new(2.0, 3.0).unwrap());
    let mut net = Network::new(1).unwrap().with_default_activation(act);
    for (w, b) in [(3.0, 1.0), (1.0, -1.0), (-1.0, 2.0)] {
        let node = DenseNode::new(vec![w], b).unwrap();
        net.add_layer(Layer::standard(1, vec![node.into()]).unwrap()).unwrap();
    }
    net.build().unwrap();
    net
}

fn sgd(net: Network, rate: f64, regularizer: Option<Box<dyn Regularizer>>) -> Trainer {
    Trainer::new(
        net,
        Arc::new(Euclidean),
        regularizer,
        Box::new(Sgd),
        Box::new(Constant::new(rate).unwrap()),
    )
    .unwrap()
}

#[test]
fn piecewise_chain_backpropagates_exact_values() {
    let mut trainer = sgd(piecewise_chain(), 2.0, None);
    let loss = trainer.accumulate(&[1.0], &[1.0]).unwrap();
    assert_eq!(loss, 63.0 * 63.0 / 2.0);

    let trace = trainer.trace();
    let values: Vec<f64> = trace.layers.iter().map(|l| l.value[0]).collect();
    let derivatives: Vec<f64> = trace.layers.iter().map(|l| l.derivative[0]).collect();
    let errors: Vec<f64> = trace.layers.iter().map(|l| l.error[0]).collect();
    assert_eq!(values, vec![12.0, 33.0, -62.0]);
    assert_eq!(derivatives, vec![3.0, 3.0, 2.0]);
    assert_eq!(errors, vec![1134.0, 378.0, -126.0]);

    assert_eq!(trainer.gradients().node(2, 0), Some(&[-4158.0, -126.0][..]));
    assert_eq!(trainer.gradients().node(1, 0), Some(&[4536.0, 378.0][..]));
    assert_eq!(trainer.gradients().node(0, 0), Some(&[1134.0, 1134.0][..]));

    trainer.flush().unwrap();
    let last = &trainer.network().layers()[2].nodes()[0];
    assert_eq!(last.bias(), 254.0);
    assert_eq!(trainer.network().param(4).unwrap(), 8315.0);
    assert_eq!(trainer.network().param(5).unwrap(), 254.0);
}

fn tanh_network(dropout: Option<Dropout>) -> Network {
    let hidden = Layer::standard(
        3,
        vec![
            DenseNode::new(vec![0.2, -0.4, 0.1], 0.05).unwrap().into(),
            DenseNode::new(vec![-0.3, 0.6, 0.25], -0.1).unwrap().into(),
            DenseNode::new(vec![0.5, 0.1, -0.7], 0.2).unwrap().into(),
            DenseNode::new(vec![0.05, -0.2, 0.3], 0.0).unwrap().into(),
        ],
    )
    .unwrap()
    .with_activation(Arc::new(Tanh));
    let hidden = match dropout {
        Some(d) => hidden.with_dropout(d).unwrap(),
        None => hidden,
    };
    let output = Layer::standard(
        4,
        vec![
            DenseNode::new(vec![0.4, -0.3, 0.2, 0.1], 0.0).unwrap().into(),
            DenseNode::new(vec![-0.2, 0.5, 0.3, -0.6], 0.1).unwrap().into(),
        ],
    )
    .unwrap()
    .with_activation(Arc::new(Sigmoid));
    let mut net = Network::new(3).unwrap().layer(hidden).unwrap().layer(output).unwrap();
    net.build().unwrap();
    net
}

#[test]
fn gradients_match_finite_differences_without_dropout() {
    let net = tanh_network(None);
    let report = gradient_check::check(&net, &Euclidean, &[0.3, -0.8, 0.5], &[0.9, 0.1], 1e-5).unwrap();
    assert_eq!(report.analytic.len(), net.param_count());
    assert!(report.passes(1e-4), "{report:?}");

    let report = gradient_check::check(&net, &CrossEntropy, &[0.3, -0.8, 0.5], &[1.0, 0.0], 1e-5).unwrap();
    assert!(report.passes(1e-4), "{report:?}");
}

#[test]
fn gradients_match_finite_differences_under_dropout() {
    let mut net = tanh_network(Some(Dropout::new(0.5, 1234).unwrap()));
    net.set_training(true);
    let report = gradient_check::check(&net, &Euclidean, &[0.3, -0.8, 0.5], &[0.9, 0.1], 1e-5).unwrap();
    assert!(report.passes(1e-4), "{report:?}");

    // hidden rows are (3 weights, bias); dropped nodes receive no gradient
    for (n, keep) in net.layers()[0].retained_mask().into_iter().enumerate() {
        let row = &report.analytic[n * 4..n * 4 + 4];
        if !keep {
            assert!(row.iter().all(|&g| g == 0.0));
        }
    }
}

#[test]
fn dropped_nodes_keep_their_parameters() {
    let mut trainer = sgd(tanh_network(Some(Dropout::new(0.5, 99).unwrap())), 0.5, None);
    let before = trainer.network().params();
    let mask = trainer.network().layers()[0].retained_mask();
    trainer.run_iteration(&[0.3, -0.8, 0.5], &[0.9, 0.1]).unwrap();
    let after = trainer.network().params();
    for (n, keep) in mask.into_iter().enumerate() {
        if !keep {
            assert_eq!(before[n * 4..n * 4 + 4], after[n * 4..n * 4 + 4]);
        }
    }
}

const CONV_NET: &str = r#"{
    "input_dimension": 16,
    "default_activation": { "type": "tanh" },
    "seed": 7,
    "layers": [
        { "type": "convolution", "channels": 1, "height": 4, "width": 4, "filters": 2, "kernel": 2 },
        { "type": "pooling", "channels": 2, "height": 3, "width": 3, "size": 2, "stride": 1, "mode": "MODE" },
        { "type": "dense", "nodes": 2, "activation": { "type": "sigmoid" } }
    ]
}"#;

#[test]
fn convolution_and_pooling_gradients_check() {
    let input: Vec<f64> = (0..16).map(|i| (i as f64 * 0.37).sin()).collect();
    for mode in ["max", "average"] {
        let config = NetworkConfig::from_json(&CONV_NET.replace("MODE", mode)).unwrap();
        let net = config.build_network(&mut Registry::new()).unwrap();
        assert_eq!(net.layers()[1].output_dimension(), 8);
        let report = gradient_check::check(&net, &Euclidean, &input, &[0.2, 0.7], 1e-5).unwrap();
        assert!(report.passes(1e-4), "{mode}: {report:?}");
    }
}

fn l1() -> Box<dyn Regularizer> {
    Box::new(L1::new(0.01).unwrap())
}

fn l2() -> Box<dyn Regularizer> {
    Box::new(L2::new(0.2).unwrap())
}

#[test]
fn composite_regularizer_updates_are_additive() {
    let input = [0.3, -0.8, 0.5];
    let target = [0.9, 0.1];
    let step = |regularizer: Option<Box<dyn Regularizer>>| {
        let mut trainer = sgd(tanh_network(None), 0.1, regularizer);
        trainer.run_iteration(&input, &target).unwrap();
        trainer.network().params()
    };
    let plain = step(None);
    let only_l1 = step(Some(l1()));
    let only_l2 = step(Some(l2()));
    let both = step(Some(Box::new(Composite::new(vec![l1(), l2()]))));
    for i in 0..plain.len() {
        assert_close(both[i], only_l1[i] + only_l2[i] - plain[i], 1e-12);
    }

    let objective = |regularizer: Option<Box<dyn Regularizer>>| {
        sgd(tanh_network(None), 0.1, regularizer).objective(&input, &target).unwrap()
    };
    let base = objective(None);
    let combined = objective(Some(Box::new(Composite::new(vec![l1(), l2()]))));
    let separate = objective(Some(l1())) + objective(Some(l2())) - base;
    assert_close(combined, separate, 1e-12);
}

#[test]
fn identical_setups_train_identically() {
    let data: Vec<(Vec<f64>, Vec<f64>)> = (0..12)
        .map(|i| {
            let x = i as f64 / 6.0 - 1.0;
            (vec![x, x * x, -x], vec![(x > 0.0) as u8 as f64, (x <= 0.0) as u8 as f64])
        })
        .collect();
    let run = || {
        let mut trainer = sgd(tanh_network(Some(Dropout::new(0.25, 5).unwrap())), 0.2, None);
        let losses = trainer.fit(&data, 5, 4, 11).unwrap();
        (losses, trainer.into_network().params())
    };
    assert_eq!(run(), run());
}
