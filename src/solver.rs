//! Solution of the assembled linear systems.
//!
//! The assembler only depends on the [`LinearSolver`] and [`Preconditioner`] traits. A distributed
//! preconditioned conjugate gradient method is provided for symmetric positive definite systems.
use crate::matrix::DistMatrix;
use crate::vector::DistVector;
use crate::Real;
use log::{debug, warn};
use numeric_literals::replace_float_literals;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An approximate inverse of an assembled matrix.
pub trait Preconditioner<T: Real>: Send + Sync {
    /// Computes the preconditioner from the current matrix entries. Collective.
    fn factor(&mut self, matrix: &DistMatrix<T>);

    /// Computes `z = P r`. Collective.
    fn apply(&self, r: &DistVector<T>, z: &mut DistVector<T>);
}

#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityPreconditioner;

impl<T: Real> Preconditioner<T> for IdentityPreconditioner {
    fn factor(&mut self, _matrix: &DistMatrix<T>) {}

    fn apply(&self, r: &DistVector<T>, z: &mut DistVector<T>) {
        z.copy_from(r);
    }
}

/// Scales by the inverse of the matrix diagonal.
#[derive(Debug, Clone, Default)]
pub struct JacobiPreconditioner<T: Real> {
    inverse_diagonal: Option<DistVector<T>>,
}

impl<T: Real> JacobiPreconditioner<T> {
    pub fn new() -> Self {
        Self { inverse_diagonal: None }
    }
}

impl<T: Real> Preconditioner<T> for JacobiPreconditioner<T> {
    fn factor(&mut self, matrix: &DistMatrix<T>) {
        let mut diagonal = matrix.diagonal();
        for d in diagonal.as_mut_slice() {
            // Rows without a usable diagonal are left unscaled
            *d = if *d > T::zero() { T::one() / *d } else { T::one() };
        }
        self.inverse_diagonal = Some(diagonal);
    }

    fn apply(&self, r: &DistVector<T>, z: &mut DistVector<T>) {
        let inverse_diagonal = self
            .inverse_diagonal
            .as_ref()
            .expect("Jacobi preconditioner must be factored before it is applied");
        for ((z_i, &r_i), &d_i) in z
            .as_mut_slice()
            .iter_mut()
            .zip(r.as_slice())
            .zip(inverse_diagonal.as_slice())
        {
            *z_i = d_i * r_i;
        }
    }
}

/// Preconditioners that can be selected through configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreconditionerKind {
    Identity,
    #[default]
    Jacobi,
}

impl PreconditionerKind {
    pub fn build<T: Real>(&self) -> Box<dyn Preconditioner<T>> {
        match self {
            Self::Identity => Box::new(IdentityPreconditioner),
            Self::Jacobi => Box::new(JacobiPreconditioner::new()),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SolveStatus {
    Converged,
    /// The residual exceeded the divergence bound, became non-finite, or the operator or
    /// preconditioner turned out to be indefinite.
    Diverged,
    /// The iteration limit was reached before convergence.
    Stalled,
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Diverged => write!(f, "diverged"),
            Self::Stalled => write!(f, "stalled"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SolveOutcome<T> {
    pub status: SolveStatus,
    /// Norm of the (approximate) residual `b - A x` at termination.
    pub residual_norm: T,
    /// Number of updates made to the solution.
    pub iterations: usize,
}

impl<T> SolveOutcome<T> {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }
}

/// Solves `A x = b` for distributed systems.
pub trait LinearSolver<T: Real>: Send + Sync {
    /// Solves with `x` as the initial guess. Collective.
    fn solve(
        &mut self,
        matrix: &DistMatrix<T>,
        preconditioner: &dyn Preconditioner<T>,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
    ) -> SolveOutcome<T>;
}

/// Preconditioned conjugate gradient method for symmetric positive definite systems.
///
/// Converges when `||r|| <= max(atol, rtol * ||b||)`, where `r` is the approximate residual
/// maintained by the iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConjugateGradient<T> {
    pub rtol: T,
    pub atol: T,
    pub max_iter: usize,
    pub divergence_bound: T,
}

impl<T: Real> Default for ConjugateGradient<T> {
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn default() -> Self {
        Self {
            rtol: 1e-12,
            atol: 1e-12,
            max_iter: 1000,
            divergence_bound: 1e20,
        }
    }
}

impl<T: Real> ConjugateGradient<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rtol(self, rtol: T) -> Self {
        Self { rtol, ..self }
    }

    pub fn with_atol(self, atol: T) -> Self {
        Self { atol, ..self }
    }

    pub fn with_max_iter(self, max_iter: usize) -> Self {
        Self { max_iter, ..self }
    }

    pub fn with_divergence_bound(self, divergence_bound: T) -> Self {
        Self {
            divergence_bound,
            ..self
        }
    }
}

#[allow(non_snake_case)]
struct Buffers<T: Real> {
    r: DistVector<T>,
    z: DistVector<T>,
    p: DistVector<T>,
    Ap: DistVector<T>,
}

impl<T: Real> LinearSolver<T> for ConjugateGradient<T> {
    #[allow(non_snake_case)]
    fn solve(
        &mut self,
        matrix: &DistMatrix<T>,
        preconditioner: &dyn Preconditioner<T>,
        b: &DistVector<T>,
        x: &mut DistVector<T>,
    ) -> SolveOutcome<T> {
        let mut outcome = SolveOutcome {
            status: SolveStatus::Converged,
            residual_norm: T::zero(),
            iterations: 0,
        };

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.zero();
            return outcome;
        }
        let tolerance = self.atol.max(self.rtol * b_norm);

        let Buffers { mut r, mut z, mut p, mut Ap } = Buffers {
            r: b.clone(),
            z: b.clone(),
            p: b.clone(),
            Ap: b.clone(),
        };

        // r = b - Ax
        matrix.apply(x, &mut Ap);
        r.axpy(-T::one(), &Ap);

        // z = Pr
        preconditioner.apply(&r, &mut z);

        // p = z
        p.copy_from(&z);
        let mut zTr = z.dot(&r);

        loop {
            let r_norm = r.norm();
            outcome.residual_norm = r_norm;

            if r_norm <= tolerance {
                break;
            }
            if !r_norm.is_finite() || r_norm > self.divergence_bound {
                outcome.status = SolveStatus::Diverged;
                break;
            }
            if outcome.iterations >= self.max_iter {
                outcome.status = SolveStatus::Stalled;
                break;
            }

            // Ap = A * p
            matrix.apply(&p, &mut Ap);
            let pAp = p.dot(&Ap);
            if pAp <= T::zero() || zTr <= T::zero() {
                outcome.status = SolveStatus::Diverged;
                break;
            }

            let alpha = zTr / pAp;
            // x <- x + alpha * p
            x.axpy(alpha, &p);
            // r <- r - alpha * Ap
            r.axpy(-alpha, &Ap);

            // Number of iterations corresponds to number of updates to the x vector
            outcome.iterations += 1;

            // z <- P r
            preconditioner.apply(&r, &mut z);
            let zTr_next = z.dot(&r);
            let beta = zTr_next / zTr;

            // p <- z + beta * p
            p.axpby(T::one(), &z, beta);

            zTr = zTr_next;
        }

        match outcome.status {
            SolveStatus::Converged => debug!(
                "CG converged after {} iterations with residual norm {:?}",
                outcome.iterations, outcome.residual_norm
            ),
            status => warn!(
                "CG {} after {} iterations with residual norm {:?}",
                status, outcome.iterations, outcome.residual_norm
            ),
        }
        outcome
    }
}
