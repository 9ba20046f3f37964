use nalgebra::{DMatrix, DVector};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

/// A bilinear quadrilateral. Corner node ids run counter-clockwise starting
/// from the lower-left corner of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub nodes: [usize; 4],
}

/// Structured quadrilateral mesh over `[0, length_x] x [0, length_y]`.
///
/// Node `(i, j)` (column `i`, row `j`) has id `j * (elements_x + 1) + i`.
/// Built once by [`crate::mesher::generate_mesh`] and never mutated.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub(crate) length_x: f64,
    pub(crate) length_y: f64,
    pub(crate) elements_x: usize,
    pub(crate) elements_y: usize,
    pub(crate) vertices: Vec<Vertex>,
    pub(crate) elements: Vec<Element>,
}

impl Mesh {
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn elements_x(&self) -> usize {
        self.elements_x
    }

    pub fn elements_y(&self) -> usize {
        self.elements_y
    }

    pub fn length_x(&self) -> f64 {
        self.length_x
    }

    pub fn length_y(&self) -> f64 {
        self.length_y
    }

    pub fn node_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    /// Two displacement unknowns per node.
    pub fn dof_count(&self) -> usize {
        2 * self.vertices.len()
    }

    /// Node id of grid column `i`, row `j`.
    pub fn node_id(&self, i: usize, j: usize) -> usize {
        j * (self.elements_x + 1) + i
    }

    /// Node ids on `x = 0`, bottom to top.
    pub fn left_edge_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..=self.elements_y).map(move |j| self.node_id(0, j))
    }

    /// Node ids on `x = length_x`, bottom to top.
    pub fn right_edge_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..=self.elements_y).map(move |j| self.node_id(self.elements_x, j))
    }

    /// Corner coordinates of an element, in connectivity order.
    pub fn element_vertices(&self, element: &Element) -> [Vertex; 4] {
        element.nodes.map(|n| self.vertices[n])
    }

    /// Node x-coordinates of one grid row.
    pub fn x_coords(&self) -> Vec<f64> {
        (0..=self.elements_x)
            .map(|i| self.vertices[self.node_id(i, 0)].x)
            .collect()
    }

    /// Node y-coordinates of one grid column.
    pub fn y_coords(&self) -> Vec<f64> {
        (0..=self.elements_y)
            .map(|j| self.vertices[self.node_id(0, j)].y)
            .collect()
    }
}

/// What happens to the y-displacement of the nodes on the pulled edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RightEdgePolicy {
    /// Only the x-displacement is prescribed.
    #[default]
    FreeY,
    /// The x-displacement is prescribed and the y-displacement is held at 0.
    FixedY,
}

/// Integration rule for the bilinear quadrilateral.
///
/// `Full` (2x2 Gauss) integrates the stiffness of an undistorted element
/// exactly and is the default. `Reduced` (single centre point) is softer and
/// each element admits zero-energy hourglass modes. Clamped and pulled
/// plates still solve, but the displacement field can show hourglassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuadratureRule {
    #[default]
    Full,
    Reduced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverMethod {
    /// Sparse Cholesky factorization.
    #[default]
    Direct,
    ConjugateGradient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub method: SolverMethod,
    /// Relative residual `|K u - f| / |f|` a solution must reach.
    pub tolerance: f64,
    /// Iteration budget for the conjugate gradient method.
    pub max_iters: u64,
    pub parallel_assembly: bool,
    pub show_progress: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            method: SolverMethod::Direct,
            tolerance: 1e-10,
            max_iters: 10_000,
            parallel_assembly: true,
            show_progress: false,
        }
    }
}

/// A plate problem: geometry, material and edge loading.
#[derive(Debug, Clone, PartialEq)]
pub struct ProblemConfig {
    pub length_x: f64,
    pub length_y: f64,
    pub elements_x: usize,
    pub elements_y: usize,
    pub youngs_modulus: f64,
    pub poisson_ratio: f64,
    pub thickness: f64,
    /// Clamp both displacement components on `x = 0`.
    pub fix_left: bool,
    /// Prescribed x-displacement on `x = length_x`.
    pub ux_right: f64,
    pub right_edge: RightEdgePolicy,
    pub quadrature: QuadratureRule,
    pub solver: SolverSettings,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        ProblemConfig {
            length_x: 1.0,
            length_y: 1.0,
            elements_x: 50,
            elements_y: 50,
            youngs_modulus: 1e9,
            poisson_ratio: 0.3,
            thickness: 1.0,
            fix_left: true,
            ux_right: 0.1,
            right_edge: RightEdgePolicy::FreeY,
            quadrature: QuadratureRule::Full,
            solver: SolverSettings::default(),
        }
    }
}

/// A prescribed value for one global degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirichletConstraint {
    pub dof: usize,
    pub value: f64,
}

/// Per-axis displacement grids shaped `(elements_y + 1) x (elements_x + 1)`.
/// Entry `(j, i)` belongs to the node in row `j`, column `i`.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    pub ux: DMatrix<f64>,
    pub uy: DMatrix<f64>,
    /// Node x-coordinates, same shape as `ux`.
    pub x_grid: DMatrix<f64>,
    /// Node y-coordinates, same shape as `ux`.
    pub y_grid: DMatrix<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementStress {
    pub sigma_xx: f64,
    pub sigma_yy: f64,
    pub tau_xy: f64,
    pub von_mises: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reaction {
    pub dof: usize,
    pub force: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveStats {
    pub method: SolverMethod,
    pub iterations: u64,
    pub relative_residual: f64,
    pub elapsed_secs: f32,
}

/// Everything a downstream consumer needs from one solve.
#[derive(Debug, Clone)]
pub struct PlateSolution {
    pub mesh: Mesh,
    pub field: DisplacementField,
    pub displacements: DVector<f64>,
    pub reactions: Vec<Reaction>,
    pub stresses: Vec<ElementStress>,
    pub stats: SolveStats,
}
