pub type Result<T> = std::result::Result<T, DapError>;

/// Errors produced by the dataset model and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("xml error: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("sequence row arity mismatch: expected {expected} columns, found {found}")]
    RowArity { expected: usize, found: usize },

    #[error("constraint error: {0}")]
    Constraint(String),

    #[error("evaluation error: {0}")]
    Eval(String),
}
