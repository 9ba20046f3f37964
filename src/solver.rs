use std::collections::BTreeMap;

use crate::{
    datatypes::{
        DirichletConstraint, Element, Mesh, ProblemConfig, QuadratureRule, Reaction, SolveStats,
        SolverMethod, SolverSettings, Vertex,
    },
    error::{Result, TensileError},
};
use indicatif::ProgressBar;
use nalgebra::{matrix, DMatrix, DVector, Matrix2, Matrix3, SMatrix, Vector3};
use nalgebra_sparse::{
    coo::CooMatrix, csc::CscMatrix, csr::CsrMatrix, factorization::CscCholesky, SparseEntry,
};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, IterState, Operator, State, TerminationReason, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};

pub const DOF: usize = 2;

/// Gauss abscissa `1/sqrt(3)` of the two-point rule.
const GAUSS_2: f64 = 0.577_350_269_189_625_8;

static FULL_RULE: [(f64, f64, f64); 4] = [
    (-GAUSS_2, -GAUSS_2, 1.0),
    (GAUSS_2, -GAUSS_2, 1.0),
    (GAUSS_2, GAUSS_2, 1.0),
    (-GAUSS_2, GAUSS_2, 1.0),
];
static REDUCED_RULE: [(f64, f64, f64); 1] = [(0.0, 0.0, 4.0)];

/// Smallest accepted `L_ii^2 / K_ii` in the Cholesky factor.
const PIVOT_RATIO_LIMIT: f64 = 1e-12;

/// The true residual of an iterative solve may drift from the recursive one.
const RESIDUAL_SLACK: f64 = 100.0;

/// Smallest number of elements handed to one assembly worker.
const MIN_ASSEMBLY_CHUNK: usize = 64;

type CgState = IterState<Vec<f64>, (), (), (), Vec<f64>, f64>;

/// Sparse matrix-vector product `K x`
pub(crate) fn multiply(k: &CsrMatrix<f64>, x: &[f64]) -> Vec<f64> {
    k.row_iter()
        .map(|row| {
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(|(col, value)| value * x[*col])
                .sum()
        })
        .collect()
}

/// Runs multiplication for Conjugate Gradient Solver
struct StiffnessOperator<'a> {
    k: &'a CsrMatrix<f64>,
}

impl<'a> Operator for StiffnessOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        Ok(multiply(self.k, x))
    }
}

/// Observer bar for argmin solver
struct ConjugateGradientObserverBar {
    bar: ProgressBar,
}

impl ConjugateGradientObserverBar {
    fn new(max_iters: u64, visible: bool) -> ConjugateGradientObserverBar {
        ConjugateGradientObserverBar {
            bar: progress_bar(max_iters, visible),
        }
    }
}

impl Observe<CgState> for ConjugateGradientObserverBar {
    fn observe_iter(&mut self, state: &CgState, _kv: &KV) -> std::result::Result<(), Error> {
        // the solver reports |r.r| as its cost
        let residual = state.get_cost().sqrt();
        debug!(iter = state.get_iter(), residual, "conjugate gradient step");
        self.bar.set_position(state.get_iter());
        self.bar.set_message(format!("|r| = {residual:.3e}"));
        Ok(())
    }

    fn observe_final(&mut self, _state: &CgState) -> std::result::Result<(), Error> {
        self.bar.finish_and_clear();
        Ok(())
    }
}

fn progress_bar(len: u64, visible: bool) -> ProgressBar {
    if visible {
        ProgressBar::new(len)
    } else {
        ProgressBar::hidden()
    }
}

/// Solves a system of equations using the conjugate gradient method.
///
/// # Arguments
/// * `k` - A square positive definite matrix
/// * `f` - The right-hand side of the system
/// * `settings` - Tolerance and iteration budget
///
/// # Returns
/// `u` from `K u = f` and the number of iterations spent
fn run_conjugate_gradient(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<(DVector<f64>, u64)> {
    let b: Vec<f64> = f.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b);
    let initial_guess: Vec<f64> = vec![0.0; f.len()];
    let target_cost = (settings.tolerance * f.norm()).powi(2);

    let operator = StiffnessOperator { k };
    let observer = ConjugateGradientObserverBar::new(settings.max_iters, settings.show_progress);

    let res = match Executor::new(operator, solver)
        .configure(|state: CgState| {
            state
                .param(initial_guess)
                .max_iters(settings.max_iters)
                .target_cost(target_cost)
        })
        .add_observer(observer, ObserverMode::Always)
        .run()
    {
        Ok(r) => r,
        Err(err) => {
            return Err(TensileError::SingularSystem(format!(
                "Conjugate Gradient error: {err}"
            )))
        }
    };

    let state = res.state();
    match state.get_termination_reason() {
        Some(TerminationReason::TargetCostReached) => {}
        Some(reason) => {
            return Err(TensileError::SingularSystem(format!(
                "Conjugate Gradient stopped after {} iterations without converging: {reason:?}",
                state.get_iter()
            )))
        }
        None => {
            return Err(TensileError::SingularSystem(
                "Conjugate Gradient did not terminate".to_owned(),
            ))
        }
    }

    let solution = match state.get_param() {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(TensileError::SingularSystem(
                "Conjugate Gradient could not produce a solution".to_owned(),
            ))
        }
    };

    Ok((solution, state.get_iter()))
}

/// Solves a system of equations with a sparse Cholesky factorization.
///
/// # Arguments
/// * `k` - A symmetric positive definite matrix
/// * `f` - The right-hand side of the system
///
/// # Returns
/// `u` from `K u = f`
fn run_cholesky(k: &CsrMatrix<f64>, f: &DVector<f64>) -> Result<DVector<f64>> {
    let cholesky = factor_cholesky(k)?;

    let rhs = DMatrix::from_column_slice(f.len(), 1, f.as_slice());
    let solution = cholesky.solve(&rhs);

    Ok(DVector::from_column_slice(solution.as_slice()))
}

/// Factors `k`, failing on matrices that are not positive definite
fn factor_cholesky(k: &CsrMatrix<f64>) -> Result<CscCholesky<f64>> {
    let csc = CscMatrix::from(k);
    let cholesky = match CscCholesky::factor(&csc) {
        Ok(c) => c,
        Err(err) => {
            return Err(TensileError::SingularSystem(format!(
                "Cholesky factorization failed: {err}"
            )))
        }
    };

    check_pivots(&cholesky, k)?;

    Ok(cholesky)
}

/// Rejects factorizations whose pivots collapsed relative to the matrix
/// diagonal, which happens when `K` is singular up to round-off.
fn check_pivots(cholesky: &CscCholesky<f64>, k: &CsrMatrix<f64>) -> Result<()> {
    let mut diagonal = vec![0.0; k.nrows()];
    for (row, col, value) in k.triplet_iter() {
        if row == col {
            diagonal[row] = *value;
        }
    }

    for (row, col, pivot) in cholesky.l().triplet_iter() {
        if row != col {
            continue;
        }
        let ratio = pivot * pivot / diagonal[row];
        if !(ratio > PIVOT_RATIO_LIMIT) {
            return Err(TensileError::SingularSystem(format!(
                "near-zero pivot at dof {row} (pivot ratio {ratio:e})"
            )));
        }
    }

    Ok(())
}

/// Solves `K u = f`, checking the solution against the residual tolerance
///
/// # Arguments
/// * `k` - The constrained total stiffness matrix
/// * `f` - The load vector
/// * `settings` - Solver selection and tolerances
///
/// # Returns
/// The displacement vector and statistics about the solve
pub fn solve_linear_system(
    k: &CsrMatrix<f64>,
    f: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<(DVector<f64>, SolveStats)> {
    let n = k.nrows();
    if k.ncols() != n || f.len() != n {
        return Err(TensileError::ShapeMismatch {
            expected: n,
            actual: f.len(),
        });
    }

    let start = std::time::Instant::now();
    let rhs_norm = f.norm();

    if rhs_norm == 0.0 {
        // a singular K is an error even under zero load
        if settings.method == SolverMethod::Direct {
            factor_cholesky(k)?;
        }
        info!("load vector is zero, returning the trivial solution");
        return Ok((
            DVector::zeros(n),
            SolveStats {
                method: settings.method,
                iterations: 0,
                relative_residual: 0.0,
                elapsed_secs: start.elapsed().as_secs_f32(),
            },
        ));
    }
    if !rhs_norm.is_finite() {
        return Err(TensileError::SingularSystem(
            "load vector contains non-finite values".to_owned(),
        ));
    }

    info!(dofs = n, method = ?settings.method, "solving...");
    let (displacements, iterations) = match settings.method {
        SolverMethod::Direct => (run_cholesky(k, f)?, 1),
        SolverMethod::ConjugateGradient => run_conjugate_gradient(k, f, settings)?,
    };

    if let Some(dof) = displacements.iter().position(|u| !u.is_finite()) {
        return Err(TensileError::SingularSystem(format!(
            "solution is not finite at dof {dof}"
        )));
    }

    let residual = DVector::from_vec(multiply(k, displacements.as_slice())) - f;
    let relative_residual = residual.norm() / rhs_norm;
    if relative_residual > settings.tolerance * RESIDUAL_SLACK {
        return Err(TensileError::SingularSystem(format!(
            "relative residual {relative_residual:e} exceeds tolerance {:e}",
            settings.tolerance
        )));
    }

    let elapsed_secs = start.elapsed().as_secs_f32();
    info!(
        iterations,
        relative_residual, "solved system in {:.3} seconds", elapsed_secs
    );

    Ok((
        displacements,
        SolveStats {
            method: settings.method,
            iterations,
            relative_residual,
            elapsed_secs,
        },
    ))
}

/// Calculates the plane-stress stress-strain matrix
///
/// # Arguments
/// * `poisson_ratio` - The poisson ratio for the model
/// * `youngs_modulus` - The modulus of elasticity of the model
///
/// # Returns
/// A 3x3 stress-strain matrix relating `[exx, eyy, gxy]` to `[sxx, syy, sxy]`
pub fn compute_stress_strain_matrix(poisson_ratio: f64, youngs_modulus: f64) -> Result<Matrix3<f64>> {
    if !(youngs_modulus > 0.0 && youngs_modulus.is_finite()) {
        return Err(TensileError::InvalidMaterial(format!(
            "Young's modulus must be positive and finite, got {youngs_modulus}"
        )));
    }
    if !(poisson_ratio > -1.0 && poisson_ratio < 0.5) {
        return Err(TensileError::InvalidMaterial(format!(
            "Poisson ratio must lie in (-1, 0.5), got {poisson_ratio}"
        )));
    }

    let mut stress_strain_mat: Matrix3<f64> = matrix![
        1.0, poisson_ratio, 0.0;
        poisson_ratio, 1.0, 0.0;
        0.0, 0.0, (1.0 - poisson_ratio)/2.0;
    ];

    stress_strain_mat *= youngs_modulus / (1.0 - f64::powi(poisson_ratio, 2));

    Ok(stress_strain_mat)
}

/// Integration points `(xi, eta, weight)` on the reference square `[-1, 1]^2`.
pub fn integration_points(rule: QuadratureRule) -> &'static [(f64, f64, f64)] {
    match rule {
        QuadratureRule::Full => &FULL_RULE,
        QuadratureRule::Reduced => &REDUCED_RULE,
    }
}

/// Derivatives of the four bilinear shape functions with respect to the
/// reference coordinates. Row 0 holds `dN/dxi`, row 1 holds `dN/deta`.
fn shape_function_derivatives(xi: f64, eta: f64) -> SMatrix<f64, 2, 4> {
    matrix![
        -(1.0 - eta), 1.0 - eta, 1.0 + eta, -(1.0 + eta);
        -(1.0 - xi), -(1.0 + xi), 1.0 + xi, 1.0 - xi;
    ] * 0.25
}

/// Calculates the strain-displacement matrix of an element at a point of
/// the reference square
///
/// # Arguments
/// * `element_id` - Id of the element, reported on failure
/// * `vertices` - The element corners in connectivity order
/// * `xi` - First reference coordinate
/// * `eta` - Second reference coordinate
///
/// # Returns
/// The 3x8 strain-displacement matrix and the jacobian determinant
pub fn compute_strain_displacement_matrix(
    element_id: usize,
    vertices: &[Vertex; 4],
    xi: f64,
    eta: f64,
) -> Result<(SMatrix<f64, 3, 8>, f64)> {
    let d_reference = shape_function_derivatives(xi, eta);
    let coords = SMatrix::<f64, 4, 2>::from_fn(|a, axis| {
        if axis == 0 {
            vertices[a].x
        } else {
            vertices[a].y
        }
    });

    let jacobian: Matrix2<f64> = d_reference * coords;
    let det_j = jacobian.determinant();
    if !(det_j > 0.0 && det_j.is_finite()) {
        return Err(TensileError::DegenerateElement {
            element: element_id,
            det_j,
        });
    }
    let jacobian_inv = match jacobian.try_inverse() {
        Some(inv) => inv,
        None => {
            return Err(TensileError::DegenerateElement {
                element: element_id,
                det_j,
            })
        }
    };

    let d_physical: SMatrix<f64, 2, 4> = jacobian_inv * d_reference;

    let mut strain_displacement_mat = SMatrix::<f64, 3, 8>::zeros();
    for a in 0..4 {
        let dn_dx = d_physical[(0, a)];
        let dn_dy = d_physical[(1, a)];
        strain_displacement_mat[(0, DOF * a)] = dn_dx;
        strain_displacement_mat[(1, DOF * a + 1)] = dn_dy;
        strain_displacement_mat[(2, DOF * a)] = dn_dy;
        strain_displacement_mat[(2, DOF * a + 1)] = dn_dx;
    }

    Ok((strain_displacement_mat, det_j))
}

/// Computes the stiffness matrix for a given element
///
/// # Arguments
/// * `element_id` - Id of the element, reported on failure
/// * `vertices` - The element corners in connectivity order
/// * `stress_strain_mat` - The plane-stress material matrix
/// * `thickness` - The thickness of the plate
/// * `rule` - The integration rule
///
/// # Returns
/// An 8x8 stiffness matrix ordered `[u0, v0, u1, v1, u2, v2, u3, v3]`
pub fn compute_element_stiffness_matrix(
    element_id: usize,
    vertices: &[Vertex; 4],
    stress_strain_mat: &Matrix3<f64>,
    thickness: f64,
    rule: QuadratureRule,
) -> Result<SMatrix<f64, 8, 8>> {
    let mut stiffness_mat = SMatrix::<f64, 8, 8>::zeros();

    for &(xi, eta, weight) in integration_points(rule) {
        let (strain_displacement_mat, det_j) =
            compute_strain_displacement_matrix(element_id, vertices, xi, eta)?;
        stiffness_mat += strain_displacement_mat.transpose()
            * stress_strain_mat
            * strain_displacement_mat
            * (det_j * weight * thickness);
    }

    Ok(stiffness_mat)
}

/// Global DOFs of an element's corners, in local stiffness order.
pub fn element_dofs(element: &Element) -> [usize; 2 * 4] {
    let mut dofs = [0; 2 * 4];
    for (a, node) in element.nodes.iter().enumerate() {
        dofs[DOF * a] = DOF * node;
        dofs[DOF * a + 1] = DOF * node + 1;
    }
    dofs
}

/// Total stiffness matrix under construction. Entries pushed for the same
/// `(row, col)` accumulate and are summed by [`StiffnessBuilder::freeze`].
#[derive(Debug, Clone)]
pub struct StiffnessBuilder {
    coo: CooMatrix<f64>,
}

impl StiffnessBuilder {
    pub fn new(dof_count: usize) -> StiffnessBuilder {
        StiffnessBuilder {
            coo: CooMatrix::new(dof_count, dof_count),
        }
    }

    /// Scatter-adds an element matrix into the rows and columns of its DOFs
    pub fn add_element_matrix(&mut self, element: &Element, element_mat: &SMatrix<f64, 8, 8>) {
        let dofs = element_dofs(element);
        for (local_row, global_row) in dofs.iter().enumerate() {
            for (local_col, global_col) in dofs.iter().enumerate() {
                self.coo
                    .push(*global_row, *global_col, element_mat[(local_row, local_col)]);
            }
        }
    }

    /// Appends the contributions accumulated by another builder
    pub fn merge(&mut self, other: StiffnessBuilder) {
        for (row, col, value) in other.coo.triplet_iter() {
            self.coo.push(row, col, *value);
        }
    }

    /// Number of stored contributions, duplicates included.
    pub fn contribution_count(&self) -> usize {
        self.coo.nnz()
    }

    /// Sums duplicate contributions into a compressed matrix ready for
    /// constraint enforcement and solving
    pub fn freeze(self) -> CsrMatrix<f64> {
        CsrMatrix::from(&self.coo)
    }
}

/// Evaluates and scatters the stiffness of a contiguous run of elements
fn assemble_elements(
    mesh: &Mesh,
    first_element: usize,
    elements: &[Element],
    stress_strain_mat: &Matrix3<f64>,
    thickness: f64,
    rule: QuadratureRule,
    bar: &ProgressBar,
) -> Result<StiffnessBuilder> {
    let mut builder = StiffnessBuilder::new(mesh.dof_count());

    for (offset, element) in elements.iter().enumerate() {
        let vertices = mesh.element_vertices(element);
        let stiffness_mat = compute_element_stiffness_matrix(
            first_element + offset,
            &vertices,
            stress_strain_mat,
            thickness,
            rule,
        )?;
        builder.add_element_matrix(element, &stiffness_mat);
        bar.inc(1);
    }

    Ok(builder)
}

/// Compiles element stiffness matrices into a total stiffness matrix
///
/// With `settings.parallel_assembly` the elements are split into chunks that
/// rayon workers assemble into private builders. The builders are merged in
/// chunk order, so no two workers ever write to the same buffer.
///
/// # Arguments
/// * `mesh` - The mesh to assemble over
/// * `stress_strain_mat` - The plane-stress material matrix
/// * `thickness` - The thickness of the plate
/// * `rule` - The element integration rule
/// * `settings` - Parallelism and progress display
///
/// # Returns
/// The unconstrained total stiffness matrix
pub fn build_total_stiffness_matrix(
    mesh: &Mesh,
    stress_strain_mat: &Matrix3<f64>,
    thickness: f64,
    rule: QuadratureRule,
    settings: &SolverSettings,
) -> Result<CsrMatrix<f64>> {
    let bar = progress_bar(mesh.element_count() as u64, settings.show_progress);

    let builder = if settings.parallel_assembly {
        let chunk_size = usize::max(
            MIN_ASSEMBLY_CHUNK,
            mesh.element_count() / (4 * rayon::current_num_threads()),
        );

        let partials: Vec<Result<StiffnessBuilder>> = mesh
            .elements()
            .par_chunks(chunk_size)
            .enumerate()
            .map(|(chunk, elements)| {
                assemble_elements(
                    mesh,
                    chunk * chunk_size,
                    elements,
                    stress_strain_mat,
                    thickness,
                    rule,
                    &bar,
                )
            })
            .collect();

        let mut builder = StiffnessBuilder::new(mesh.dof_count());
        for partial in partials {
            builder.merge(partial?);
        }
        builder
    } else {
        assemble_elements(
            mesh,
            0,
            mesh.elements(),
            stress_strain_mat,
            thickness,
            rule,
            &bar,
        )?
    };
    bar.finish_and_clear();

    debug!(
        contributions = builder.contribution_count(),
        "accumulated element contributions"
    );
    let total_stiffness_matrix = builder.freeze();
    info!(
        dofs = total_stiffness_matrix.nrows(),
        nnz = total_stiffness_matrix.nnz(),
        "built total stiffness matrix"
    );

    Ok(total_stiffness_matrix)
}

/// Prescribed displacement values keyed by global DOF
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintSet {
    values: BTreeMap<usize, f64>,
}

impl ConstraintSet {
    pub fn new() -> ConstraintSet {
        ConstraintSet::default()
    }

    pub fn from_constraints<'a>(
        constraints: impl IntoIterator<Item = &'a DirichletConstraint>,
    ) -> Result<ConstraintSet> {
        let mut set = ConstraintSet::new();
        for constraint in constraints {
            set.insert(*constraint)?;
        }
        Ok(set)
    }

    /// Registers a constraint. Registering the value a DOF already carries
    /// is a no-op; a different value is a conflict.
    pub fn insert(&mut self, constraint: DirichletConstraint) -> Result<()> {
        if !constraint.value.is_finite() {
            return Err(TensileError::Input(format!(
                "prescribed value for dof {} is not finite",
                constraint.dof
            )));
        }

        match self.values.get(&constraint.dof) {
            Some(existing) if *existing == constraint.value => {
                debug!(dof = constraint.dof, "constraint registered twice");
                Ok(())
            }
            Some(existing) => Err(TensileError::ConflictingConstraint {
                dof: constraint.dof,
                existing: *existing,
                requested: constraint.value,
            }),
            None => {
                self.values.insert(constraint.dof, constraint.value);
                Ok(())
            }
        }
    }

    pub fn get(&self, dof: usize) -> Option<f64> {
        self.values.get(&dof).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `(dof, value)` pairs in ascending DOF order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values.iter().map(|(dof, value)| (*dof, *value))
    }

    fn to_dense(&self, dof_count: usize) -> Vec<Option<f64>> {
        let mut dense = vec![None; dof_count];
        for (dof, value) in self.iter() {
            dense[dof] = Some(value);
        }
        dense
    }
}

/// Imposes prescribed displacements by symmetric row/column elimination
///
/// Constrained rows and columns are zeroed with a unit diagonal, column
/// entries times the prescribed value move to the right-hand side, and the
/// load entry of a constrained DOF becomes its prescribed value. Applying
/// the same set twice leaves `k` and `f` unchanged.
///
/// # Arguments
/// * `k` - The total stiffness matrix, modified in place
/// * `f` - The load vector, modified in place
/// * `constraints` - The DOFs to pin
pub fn enforce_constraints(
    k: &mut CsrMatrix<f64>,
    f: &mut DVector<f64>,
    constraints: &ConstraintSet,
) -> Result<()> {
    let n = k.nrows();
    if f.len() != n {
        return Err(TensileError::ShapeMismatch {
            expected: n,
            actual: f.len(),
        });
    }

    for (dof, _) in constraints.iter() {
        if dof >= n {
            return Err(TensileError::Input(format!(
                "constraint on dof {dof} lies outside the {n}-dof system"
            )));
        }
        if !matches!(k.get_entry(dof, dof), Some(SparseEntry::NonZero(_))) {
            return Err(TensileError::SingularSystem(format!(
                "constrained dof {dof} has no diagonal entry"
            )));
        }
    }

    let prescribed = constraints.to_dense(n);
    for (row, col, value) in k.triplet_iter_mut() {
        if prescribed[row].is_some() {
            *value = if row == col { 1.0 } else { 0.0 };
        } else if let Some(g) = prescribed[col] {
            f[row] -= *value * g;
            *value = 0.0;
        }
    }

    for (dof, value) in constraints.iter() {
        f[dof] = value;
    }

    Ok(())
}

/// Checks that the constraints pin both in-plane translations and the
/// rotation about the plate centre
///
/// # Arguments
/// * `mesh` - The mesh the constraints refer to
/// * `constraints` - The prescribed DOFs
pub fn check_rigid_body_modes(mesh: &Mesh, constraints: &ConstraintSet) -> Result<()> {
    let cx = 0.5 * mesh.length_x();
    let cy = 0.5 * mesh.length_y();
    let scale = f64::max(mesh.length_x(), mesh.length_y());

    // Gram matrix of [x-translation, y-translation, rotation] restricted to
    // the constrained DOFs. Full rank iff no rigid-body motion survives.
    let mut gram = Matrix3::<f64>::zeros();
    for (dof, _) in constraints.iter() {
        let node = dof / DOF;
        if node >= mesh.node_count() {
            continue;
        }
        let vertex = mesh.vertices()[node];
        let mode = if dof % DOF == 0 {
            Vector3::new(1.0, 0.0, -(vertex.y - cy) / scale)
        } else {
            Vector3::new(0.0, 1.0, (vertex.x - cx) / scale)
        };
        gram += mode * mode.transpose();
    }

    let eigenvalues = gram.symmetric_eigenvalues();
    let largest = eigenvalues.max();
    let free_modes = eigenvalues
        .iter()
        .filter(|lambda| **lambda <= 1e-10 * largest)
        .count();

    if free_modes > 0 {
        return Err(TensileError::SingularSystem(format!(
            "boundary conditions leave {free_modes} rigid-body mode(s) unconstrained"
        )));
    }

    Ok(())
}

/// Calculates the reaction forces at the constrained DOFs
///
/// # Arguments
/// * `free_stiffness` - The total stiffness matrix before constraints
/// * `displacements` - The solved displacement vector
/// * `constraints` - The prescribed DOFs
///
/// # Returns
/// One reaction per constrained DOF, in ascending DOF order
pub fn compute_reactions(
    free_stiffness: &CsrMatrix<f64>,
    displacements: &DVector<f64>,
    constraints: &ConstraintSet,
) -> Vec<Reaction> {
    constraints
        .iter()
        .map(|(dof, _)| {
            let row = free_stiffness.row(dof);
            let force = row
                .col_indices()
                .iter()
                .zip(row.values())
                .map(|(col, value)| value * displacements[*col])
                .sum();
            Reaction { dof, force }
        })
        .collect()
}

/// Output of the solver stage
#[derive(Debug, Clone)]
pub struct SolverOutput {
    pub stress_strain_mat: Matrix3<f64>,
    pub displacements: DVector<f64>,
    pub reactions: Vec<Reaction>,
    pub stats: SolveStats,
}

/// Runs the solver
///
/// # Arguments
/// * `mesh` - The mesh to solve on
/// * `constraints` - The prescribed DOFs
/// * `config` - Material, integration and solver settings
///
/// # Returns
/// The displacement vector, reaction forces and solve statistics
pub fn run(
    mesh: &Mesh,
    constraints: &[DirichletConstraint],
    config: &ProblemConfig,
) -> Result<SolverOutput> {
    if !(config.thickness > 0.0 && config.thickness.is_finite()) {
        return Err(TensileError::InvalidMaterial(format!(
            "thickness must be positive and finite, got {}",
            config.thickness
        )));
    }
    let stress_strain_mat =
        compute_stress_strain_matrix(config.poisson_ratio, config.youngs_modulus)?;

    let constraint_set = ConstraintSet::from_constraints(constraints)?;
    check_rigid_body_modes(mesh, &constraint_set)?;
    if config.quadrature == QuadratureRule::Reduced {
        warn!("reduced integration admits hourglass modes; results on coarse or lightly constrained meshes may be unreliable");
    }

    info!("building total stiffness matrix...");
    let free_stiffness = build_total_stiffness_matrix(
        mesh,
        &stress_strain_mat,
        config.thickness,
        config.quadrature,
        &config.solver,
    )?;

    let mut stiffness = free_stiffness.clone();
    let mut loads = DVector::zeros(mesh.dof_count());
    enforce_constraints(&mut stiffness, &mut loads, &constraint_set)?;
    info!("enforced {} constraints", constraint_set.len());

    let (displacements, stats) = solve_linear_system(&stiffness, &loads, &config.solver)?;

    let reactions = compute_reactions(&free_stiffness, &displacements, &constraint_set);

    info!("solve complete");

    Ok(SolverOutput {
        stress_strain_mat,
        displacements,
        reactions,
        stats,
    })
}
