use crate::dataset::Dataset;
use crate::error::Result;

/// The constraint-evaluation seam.
///
/// Implementations parse a constraint expression against a dataset, marking
/// the selected variables to send, and evaluate any server-side function
/// calls into a new dataset. The function result carries exactly the
/// variables the constraint marked to send: the marked subset of the original
/// dataset and the evaluated result describe the same response, which is what
/// lets a cached copy of one stand in for the other on a later request.
pub trait ConstraintEvaluator {
    /// Parse `constraint` against `dataset`, marking variables to send.
    fn parse_constraint(&mut self, constraint: &str, dataset: &mut Dataset) -> Result<()>;

    /// Evaluate the function clauses of the parsed constraint, producing the
    /// dataset to return to the client.
    fn eval_functions(&mut self, dataset: &Dataset) -> Result<Dataset>;
}
