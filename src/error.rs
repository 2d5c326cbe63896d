//! Error taxonomy shared by every stage of assembly, training and persistence.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised by networks, trainers and the model format.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Invalid dimension or hyperparameter, raised when the object is constructed.
    #[error("Invalid construction: {0}")]
    Construction(String),

    /// Input or target vector of the wrong length.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A loss, activation or optimizer was evaluated outside its valid domain.
    #[error("Numerical range error in {operation}: offending values {values:?}")]
    NumericalRange {
        operation: &'static str,
        values: Vec<f64>,
    },

    /// Operation issued in the wrong lifecycle state.
    #[error("Sequencing error: {0}")]
    Sequencing(String),

    #[error("Parameter index {index} out of range for {count} parameters")]
    ParameterIndex { index: usize, count: usize },

    /// Persisted model text that does not follow the tagged block format.
    #[error("Format error: {0}")]
    Format(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NetError {
    pub(crate) fn construction(message: impl Into<String>) -> Self {
        NetError::Construction(message.into())
    }

    pub(crate) fn format(message: impl Into<String>) -> Self {
        NetError::Format(message.into())
    }

    pub(crate) fn range(operation: &'static str, values: &[f64]) -> Self {
        NetError::NumericalRange {
            operation,
            values: values.to_vec(),
        }
    }
}

/// Fails with a shape error unless `actual == expected`.
pub(crate) fn check_len(context: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(NetError::Shape {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}
