//! Structural functionals evaluated over all elements of all workers.
//!
//! Every functional is a reduction of an [`ElementQuantity`] over the quadrature points of the
//! elements in its [`ElementDomain`]. Evaluation and sensitivities are collective operations.
use crate::assembly::{Assembler, ElementDomain};
use crate::element::{ElementQuantity, PointQuantity};
use crate::error::AssemblyError;
use crate::vector::DistVector;
use crate::Real;
use numeric_literals::replace_float_literals;

/// A scalar functional of the state and the design variables.
pub trait Function<T: Real>: Send + Sync {
    fn name(&self) -> &str;

    /// The elements the functional is evaluated over.
    fn domain(&self) -> &ElementDomain;

    fn set_domain(&mut self, domain: ElementDomain);

    fn evaluate(&self, assembler: &Assembler<T>) -> Result<T, AssemblyError>;

    /// Adds `∂f/∂u` to `dfdu`.
    fn add_sv_sens(&self, assembler: &Assembler<T>, dfdu: &mut DistVector<T>) -> Result<(), AssemblyError>;

    /// Adds the explicit derivative `∂f/∂x`, summed over all workers, to `dfdx`.
    fn add_dv_sens(&self, assembler: &Assembler<T>, dfdx: &mut [T]) -> Result<(), AssemblyError>;
}

fn integrate<T: Real>(
    assembler: &Assembler<T>,
    quantity: ElementQuantity,
    domain: &ElementDomain,
) -> Result<T, AssemblyError> {
    let local = assembler
        .eval_point_quantities_in(quantity, domain)?
        .iter()
        .flatten()
        .fold(T::zero(), |sum, q| sum + q.weight * q.value);
    Ok(assembler.comm().all_reduce_scalar_sum(local))
}

/// Integration weights of the points of the elements in `domain`, which are the sensitivity scales
/// of an integral.
fn integration_weights<T: Real>(
    assembler: &Assembler<T>,
    quantity: ElementQuantity,
    domain: &ElementDomain,
) -> Result<Vec<Vec<T>>, AssemblyError> {
    Ok(assembler
        .eval_point_quantities_in(quantity, domain)?
        .iter()
        .map(|element: &Vec<PointQuantity<T>>| element.iter().map(|q| q.weight).collect())
        .collect())
}

macro_rules! impl_domain_accessors {
    () => {
        fn domain(&self) -> &ElementDomain {
            &self.domain
        }

        fn set_domain(&mut self, domain: ElementDomain) {
            self.domain = domain;
        }
    };
}

/// Total mass `∫ ρ`.
#[derive(Debug, Clone, Default)]
pub struct StructuralMass {
    domain: ElementDomain,
}

impl StructuralMass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(self, domain: ElementDomain) -> Self {
        Self { domain }
    }
}

impl<T: Real> Function<T> for StructuralMass {
    fn name(&self) -> &str {
        "mass"
    }

    impl_domain_accessors!();

    fn evaluate(&self, assembler: &Assembler<T>) -> Result<T, AssemblyError> {
        integrate(assembler, ElementQuantity::Density, &self.domain)
    }

    fn add_sv_sens(&self, _assembler: &Assembler<T>, _dfdu: &mut DistVector<T>) -> Result<(), AssemblyError> {
        Ok(())
    }

    fn add_dv_sens(&self, assembler: &Assembler<T>, dfdx: &mut [T]) -> Result<(), AssemblyError> {
        let quantity = ElementQuantity::Density;
        let scales = integration_weights(assembler, quantity, &self.domain)?;
        assembler.add_point_quantity_dv_sens(quantity, &scales, dfdx)
    }
}

/// Compliance `∫ ε · σ`.
#[derive(Debug, Clone, Default)]
pub struct Compliance {
    domain: ElementDomain,
}

impl Compliance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(self, domain: ElementDomain) -> Self {
        Self { domain }
    }
}

impl<T: Real> Function<T> for Compliance {
    fn name(&self) -> &str {
        "compliance"
    }

    impl_domain_accessors!();

    fn evaluate(&self, assembler: &Assembler<T>) -> Result<T, AssemblyError> {
        integrate(assembler, ElementQuantity::StrainEnergyDensity, &self.domain)
    }

    fn add_sv_sens(&self, assembler: &Assembler<T>, dfdu: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let quantity = ElementQuantity::StrainEnergyDensity;
        let scales = integration_weights(assembler, quantity, &self.domain)?;
        assembler.add_point_quantity_sv_sens(quantity, &scales, dfdu)
    }

    fn add_dv_sens(&self, assembler: &Assembler<T>, dfdx: &mut [T]) -> Result<(), AssemblyError> {
        let quantity = ElementQuantity::StrainEnergyDensity;
        let scales = integration_weights(assembler, quantity, &self.domain)?;
        assembler.add_point_quantity_dv_sens(quantity, &scales, dfdx)
    }
}

/// Discrete Kreisselmeier-Steinhauser aggregate of the failure index at all quadrature points.
///
/// `ks = max + ln(Σ exp(w (f_i - max))) / w` is a smooth upper bound of the maximum failure
/// index that approaches the maximum as the weight `w` grows.
#[derive(Debug, Clone)]
pub struct KsFailure<T> {
    ks_weight: T,
    domain: ElementDomain,
}

impl<T: Real> Default for KsFailure<T> {
    #[replace_float_literals(T::from_f64(literal).expect("literal must fit in T"))]
    fn default() -> Self {
        Self::new(100.0)
    }
}

impl<T: Real> KsFailure<T> {
    pub fn new(ks_weight: T) -> Self {
        assert!(ks_weight > T::zero(), "KS weight must be positive");
        Self {
            ks_weight,
            domain: ElementDomain::All,
        }
    }

    pub fn with_domain(self, domain: ElementDomain) -> Self {
        Self { domain, ..self }
    }

    pub fn ks_weight(&self) -> T {
        self.ks_weight
    }

    /// Aggregate value and the derivatives `d(ks)/d(f_i)` for the local points.
    fn aggregate(&self, assembler: &Assembler<T>) -> Result<(T, Vec<Vec<T>>), AssemblyError> {
        let points = assembler.eval_point_quantities_in(ElementQuantity::Failure, &self.domain)?;
        let comm = assembler.comm();
        let local_max = points
            .iter()
            .flatten()
            .map(|q| q.value)
            .reduce(|a, b| a.max(b));
        let max = comm.all_reduce_max(local_max).unwrap_or_else(T::zero);

        let exponentials: Vec<Vec<T>> = points
            .iter()
            .map(|element| {
                element
                    .iter()
                    .map(|q| (self.ks_weight * (q.value - max)).exp())
                    .collect()
            })
            .collect();
        let local_sum = exponentials.iter().flatten().fold(T::zero(), |sum, &e| sum + e);
        let sum = comm.all_reduce_scalar_sum(local_sum);
        if sum == T::zero() {
            return Ok((max, exponentials));
        }

        let ks = max + sum.ln() / self.ks_weight;
        let scales = exponentials
            .into_iter()
            .map(|element| element.into_iter().map(|e| e / sum).collect())
            .collect();
        Ok((ks, scales))
    }
}

impl<T: Real> Function<T> for KsFailure<T> {
    fn name(&self) -> &str {
        "ks_failure"
    }

    impl_domain_accessors!();

    fn evaluate(&self, assembler: &Assembler<T>) -> Result<T, AssemblyError> {
        Ok(self.aggregate(assembler)?.0)
    }

    fn add_sv_sens(&self, assembler: &Assembler<T>, dfdu: &mut DistVector<T>) -> Result<(), AssemblyError> {
        let (_, scales) = self.aggregate(assembler)?;
        assembler.add_point_quantity_sv_sens(ElementQuantity::Failure, &scales, dfdu)
    }

    fn add_dv_sens(&self, assembler: &Assembler<T>, dfdx: &mut [T]) -> Result<(), AssemblyError> {
        let (_, scales) = self.aggregate(assembler)?;
        assembler.add_point_quantity_dv_sens(ElementQuantity::Failure, &scales, dfdx)
    }
}
