//! Error types for observer construction and quiescence.

use std::fmt;

/// System-level engine errors.
///
/// These are distinct from user domain errors, which belong in the observed
/// value itself (e.g. an observer over `Result<T, MyError>`). A node whose
/// evaluator fails after its first successful evaluation keeps its prior
/// snapshot and retries on the next dirty trigger; subscribers are not
/// notified of failures. The variants here are the errors that do reach a
/// caller.
#[derive(Debug, Clone)]
pub enum Error {
    /// An evaluator terminated abnormally during a re-evaluation.
    ///
    /// The node retains its prior snapshot and dependents are not enqueued.
    EvaluationFailure {
        /// Panic message captured at the evaluation boundary.
        message: String,
    },

    /// A derived node's first evaluation failed, so construction failed.
    InitialEvaluationFailure {
        /// Panic message captured at the evaluation boundary.
        message: String,
    },

    /// An evaluator returned an empty value where one is required.
    NilResult,

    /// `wait_for_all_updates` was called from inside an evaluator, which
    /// would deadlock the worker pool.
    QuiescenceFromEvaluator,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EvaluationFailure { message } => {
                write!(f, "evaluation failed: {}", message)
            }
            Error::InitialEvaluationFailure { message } => {
                write!(f, "initial evaluation failed: {}", message)
            }
            Error::NilResult => write!(f, "evaluator returned no value"),
            Error::QuiescenceFromEvaluator => {
                write!(f, "wait_for_all_updates called from inside an evaluator")
            }
        }
    }
}

impl std::error::Error for Error {}
