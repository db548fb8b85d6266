//! Adjoint-based design sensitivities.
//!
//! For a functional `f(u(x), x)` subject to `R(u, x) = 0`, the total derivative is
//! `df/dx = ∂f/∂x - ψ^T ∂R/∂x` where the adjoint `ψ` solves `K^T ψ = ∂f/∂u`. The assembler
//! provides the product `ψ^T ∂R/∂x` by reusing the element kernels.
use crate::assembly::{Assembler, AssemblerState};
use crate::error::AssemblyError;
use crate::vector::DistVector;
use crate::Real;
use log::debug;

impl<T: Real> Assembler<T> {
    /// Adds `scale * ψ^T ∂R/∂x`, summed over all workers, to `dfdx`. Collective.
    ///
    /// Entries of `psi` belonging to constrained dofs are ignored, matching the zeroed residual
    /// rows.
    pub fn add_adjoint_res_product(&self, scale: T, psi: &DistVector<T>, dfdx: &mut [T]) -> Result<(), AssemblyError> {
        let data = self.data("add_adjoint_res_product", AssemblerState::Ready)?;
        let connectivity = &data.connectivity;
        let vpn = self.vars_per_node();
        assert_eq!(psi.block_size(), vpn);

        let mut local_psi = vec![T::zero(); connectivity.num_local_nodes() * vpn];
        local_psi[..psi.len()].copy_from_slice(psi.as_slice());
        for (p, &constrained) in local_psi.iter_mut().zip(connectivity.bc_mask()) {
            if constrained {
                *p = T::zero();
            }
        }
        connectivity
            .ghost_exchange()
            .forward(self.comm(), &mut local_psi, vpn);

        let elements = self.elements();
        self.accumulate_dv_sens(data, dfdx, |e, elem_index, state, dfdx| {
            let mut element_psi = vec![T::zero(); state.vars.len()];
            connectivity.gather_element_values(e, &local_psi, vpn, &mut element_psi);
            elements[e].add_adjoint_res_product(elem_index, state, scale, &element_psi, dfdx)
        })?;
        debug!("Worker {}: accumulated adjoint-residual product", self.comm().rank());
        Ok(())
    }
}

/// Combines explicit partial derivatives and adjoint-residual products into total derivatives.
///
/// Computes `dfdx[i] = partial[i] - adjoint_product[i]`.
pub fn total_derivative<T: Real>(partial: &[T], adjoint_product: &[T]) -> Vec<T> {
    assert_eq!(partial.len(), adjoint_product.len());
    partial
        .iter()
        .zip(adjoint_product)
        .map(|(&p, &a)| p - a)
        .collect()
}

/// Directional derivative `dfdx · direction`.
pub fn directional_derivative<T: Real>(dfdx: &[T], direction: &[T]) -> T {
    assert_eq!(dfdx.len(), direction.len());
    dfdx.iter()
        .zip(direction)
        .fold(T::zero(), |sum, (&d, &p)| sum + d * p)
}
