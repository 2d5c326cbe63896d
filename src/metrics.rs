//! Classification metrics over network outputs.
use crate::error::{NetError, Result};
use crate::network::Network;

/// Index of the largest value; the first one wins ties.
pub fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

fn classes(network: &Network, input: &[f64], target: &[f64]) -> Result<(usize, usize)> {
    let pred = network.calculate(input)?;
    let predicted = argmax(&pred).ok_or(NetError::Shape {
        context: "network output",
        expected: network.output_dimension(),
        actual: 0,
    })?;
    let actual = argmax(target).ok_or(NetError::Shape {
        context: "target vector",
        expected: pred.len(),
        actual: 0,
    })?;
    Ok((predicted, actual))
}

/// Fraction of samples whose predicted class matches the target's class.
pub fn accuracy(dataset: &[(Vec<f64>, Vec<f64>)], network: &Network) -> Result<f64> {
    if dataset.is_empty() {
        return Ok(0.0);
    }
    let mut correct = 0;
    for (input, target) in dataset {
        let (predicted, actual) = classes(network, input, target)?;
        if predicted == actual {
            correct += 1;
        }
    }
    Ok(correct as f64 / dataset.len() as f64)
}

/// Counts indexed `[actual][predicted]`.
pub fn confusion_matrix(
    dataset: &[(Vec<f64>, Vec<f64>)],
    network: &Network,
    num_classes: usize,
) -> Result<Vec<Vec<usize>>> {
    let mut cm = vec![vec![0; num_classes]; num_classes];
    for (input, target) in dataset {
        let (predicted, actual) = classes(network, input, target)?;
        if predicted >= num_classes || actual >= num_classes {
            return Err(NetError::Shape {
                context: "class index",
                expected: num_classes,
                actual: predicted.max(actual) + 1,
            });
        }
        cm[actual][predicted] += 1;
    }
    Ok(cm)
}
