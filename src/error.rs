//! Errors reported by the connectivity manager, the assembler and the sensitivity engine.
use crate::assembly::AssemblerState;
use crate::solver::SolveStatus;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssemblyError {
    /// The mesh topology is malformed. Detected when the connectivity is finalized.
    InvalidConnectivity { message: String },
    /// A structural change was attempted after finalization, or an operation was invoked before
    /// the assembler reached the state it requires.
    IllegalStateTransition {
        operation: &'static str,
        state: AssemblerState,
    },
    /// An element or constitutive kernel rejected its input on some worker.
    ///
    /// Every worker of the group reports the same error for the same call.
    ElementEvaluation {
        rank: usize,
        /// Global index of the failing element.
        element: usize,
        message: String,
    },
    /// A design vector is too short for the design variables referenced by the mesh.
    DesignVarIndexMismatch { required: usize, provided: usize },
    /// A functional was requested by a name that was never registered.
    UnknownFunction { name: String },
    /// The adjoint system of a functional was not solved to the requested tolerance, so its
    /// sensitivities would be inaccurate.
    AdjointSolve {
        function: String,
        status: SolveStatus,
        iterations: usize,
    },
}

impl AssemblyError {
    pub(crate) fn invalid_connectivity(message: impl Into<String>) -> Self {
        Self::InvalidConnectivity {
            message: message.into(),
        }
    }
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConnectivity { message } => write!(f, "Invalid connectivity: {}", message),
            Self::IllegalStateTransition { operation, state } => {
                write!(f, "Operation `{}` is not permitted in state {:?}", operation, state)
            }
            Self::ElementEvaluation { rank, element, message } => write!(
                f,
                "Evaluation of element {} failed on worker {}: {}",
                element, rank, message
            ),
            Self::DesignVarIndexMismatch { required, provided } => write!(
                f,
                "Design vector of length {} is too short, at least {} entries are required",
                provided, required
            ),
            Self::UnknownFunction { name } => write!(f, "No function named `{}` has been added", name),
            Self::AdjointSolve {
                function,
                status,
                iterations,
            } => write!(
                f,
                "Adjoint solve of function `{}` {} after {} iterations",
                function, status, iterations
            ),
        }
    }
}

impl Error for AssemblyError {}
