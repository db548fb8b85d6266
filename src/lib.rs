//! Parallel finite element assembly and design sensitivities for structural optimization.
//!
//! The crate is organized around a per-worker [`Assembler`](assembly::Assembler). Each worker owns a
//! contiguous range of global nodes and a subset of the elements of the mesh. Workers only communicate
//! through a [`Communicator`](comm::Communicator), which makes all exchange of contributions for shared
//! nodes explicit.
//!
//! Elements and constitutive models are supplied as trait objects. The same element kernels are used
//! to assemble residuals and Jacobians and to compute exact design-variable sensitivities through the
//! adjoint method.
use nalgebra::RealField;

pub mod assembly;
pub mod comm;
pub mod connectivity;
pub mod constitutive;
pub mod element;
pub mod error;
pub mod exchange;
pub mod functions;
pub mod matrix;
pub mod problem;
pub mod quadrature;
pub mod reorder;
pub mod sensitivity;
pub mod solver;
pub mod vector;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar types supported by the assembly and sensitivity machinery.
///
/// Values are sent between worker threads, so they must be `Send + Sync`.
pub trait Real: RealField + Copy + Send + Sync {}

impl<T> Real for T where T: RealField + Copy + Send + Sync {}
