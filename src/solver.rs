mod cbs;
mod constraint_tree;

pub use cbs::{CbsSolver, DEFAULT_MAX_THREADS};
pub use constraint_tree::{Conflict, Constraint, ConstraintTreeNode};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SolverError {
    /// A constraint tree node carries a solution that is not dense in time.
    /// Fatal for the ongoing solve; nothing to recover locally.
    #[error("corrupt solution: {0}")]
    CorruptSolution(&'static str),
}
