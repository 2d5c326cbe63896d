use std::sync::Arc;

use primitive_nn::{
    ActivationKind, ComputationNode, DenseNode, Dropout, Layer, LayerConfig, Linear, NetError, Network, NetworkConfig, Registry, ReLU,
};

fn mlp(seed: u64, dropout: Option<Dropout>) -> Network {
    let config = NetworkConfig {
        input_dimension: 5,
        default_activation: Some(ActivationKind::Tanh),
        seed,
        layers: vec![
            LayerConfig::Dense {
                nodes: 7,
                activation: None,
                dropout: dropout.map(|d| primitive_nn::config::DropoutConfig {
                    rate: d.rate(),
                    seed: d.seed(),
                }),
            },
            LayerConfig::Dense {
                nodes: 3,
                activation: Some(ActivationKind::Sigmoid),
                dropout: None,
            },
        ],
    };
    config.build_network(&mut Registry::new()).unwrap()
}

#[test]
fn output_length_matches_last_layer() {
    let net = mlp(1, None);
    assert_eq!(net.output_dimension(), 3);
    for i in 0..10 {
        let input: Vec<f64> = (0..5).map(|j| (i * 5 + j) as f64 * 0.1 - 2.0).collect();
        assert_eq!(net.calculate(&input).unwrap().len(), 3);
    }
    assert_eq!(net.param_count(), 7 * 6 + 3 * 8);
}

#[test]
fn wrong_input_length_is_a_shape_error() {
    let err = mlp(1, None).calculate(&[1.0, 2.0]).unwrap_err();
    assert!(matches!(err, NetError::Shape { expected: 5, actual: 2, .. }));
}

#[test]
fn lifecycle_is_enforced() {
    let layer = || Layer::standard(2, vec![DenseNode::new(vec![1.0, 1.0], 0.0).unwrap().into()]).unwrap();
    let mut net = Network::new(2)
        .unwrap()
        .with_default_activation(Arc::new(Linear))
        .layer(layer())
        .unwrap();
    assert!(matches!(net.calculate(&[1.0, 1.0]), Err(NetError::Sequencing(_))));
    net.build().unwrap();
    assert!(matches!(net.build(), Err(NetError::Sequencing(_))));
    assert!(matches!(net.add_layer(layer()), Err(NetError::Sequencing(_))));
    assert_eq!(net.calculate(&[1.0, 2.0]).unwrap(), vec![3.0]);
}

#[test]
fn unresolved_activation_fails_build() {
    let layer = Layer::standard(1, vec![DenseNode::new(vec![1.0], 0.0).unwrap().into()]).unwrap();
    let mut net = Network::new(1).unwrap().layer(layer).unwrap();
    assert!(matches!(net.build(), Err(NetError::Construction(_))));
}

#[test]
fn node_activation_overrides_layer_and_network() {
    let nodes = vec![
        DenseNode::new(vec![1.0], 0.0).unwrap().with_activation(Arc::new(ReLU)).into(),
        DenseNode::new(vec![1.0], 0.0).unwrap().into(),
    ];
    let mut net = Network::new(1)
        .unwrap()
        .with_default_activation(Arc::new(Linear))
        .layer(Layer::standard(1, nodes).unwrap())
        .unwrap();
    net.build().unwrap();
    assert_eq!(net.calculate(&[-2.0]).unwrap(), vec![0.0, -2.0]);
}

#[test]
fn chaining_mismatch_is_rejected_immediately() {
    let mut net = Network::new(3).unwrap();
    let layer = Layer::standard(2, vec![DenseNode::new(vec![1.0, 1.0], 0.0).unwrap().into()]).unwrap();
    assert!(matches!(net.add_layer(layer), Err(NetError::Construction(_))));
}

#[test]
fn calculation_is_deterministic() {
    let input = [0.5, -0.25, 1.0, 0.0, 2.0];
    let a = mlp(9, None);
    let b = mlp(9, None);
    assert_eq!(a.calculate(&input).unwrap(), b.calculate(&input).unwrap());
    assert_eq!(a.calculate(&input).unwrap(), a.calculate(&input).unwrap());
    assert_ne!(a.params(), mlp(10, None).params());

    let mut dropped = mlp(9, Some(Dropout::new(0.4, 21).unwrap()));
    dropped.set_training(true);
    assert_eq!(dropped.calculate(&input).unwrap(), dropped.calculate(&input).unwrap());
    dropped.set_training(false);
    assert_eq!(dropped.calculate(&input).unwrap(), a.calculate(&input).unwrap());
}

#[test]
fn flat_parameters_address_layers_then_nodes() {
    let mut net = mlp(2, None);
    let count = net.param_count();
    let values: Vec<f64> = (0..count).map(|i| i as f64).collect();
    net.set_params(&values).unwrap();
    assert_eq!(net.params(), values);
    // second node of the first layer starts after 5 weights and a bias
    assert_eq!(net.layers()[0].nodes()[1].weights()[0], 6.0);
    net.set_param(6, 0.5, true).unwrap();
    assert_eq!(net.param(6).unwrap(), 6.5);
    assert!(matches!(net.param(count), Err(NetError::ParameterIndex { .. })));
}

#[test]
fn display_summarises_structure() {
    let summary = mlp(1, None).to_string();
    assert!(summary.starts_with("Network"));
    assert!(summary.contains('7') && summary.contains('3'));
}
