//! Plane-stress finite element analysis of a rectangular plate clamped on
//! one edge and pulled on the opposite edge.
//!
//! The pipeline runs [`mesher`] → [`solver`] → [`post_processor`]; [`run`]
//! chains the three for a [`ProblemConfig`].

pub mod datatypes;
pub mod error;
pub mod mesher;
pub mod post_processor;
pub mod solver;

pub use datatypes::{
    DirichletConstraint, DisplacementField, Element, ElementStress, Mesh, PlateSolution,
    ProblemConfig, QuadratureRule, Reaction, RightEdgePolicy, SolveStats, SolverMethod,
    SolverSettings, Vertex,
};
pub use error::{Result, TensileError};
pub use post_processor::ExportFormat;

use tracing::info;

/// Meshes, solves and post-processes one plate problem
///
/// # Arguments
/// * `config` - Geometry, material, edge loading and solver settings
///
/// # Returns
/// The solved plate, or the first error raised along the pipeline
pub fn run(config: &ProblemConfig) -> Result<PlateSolution> {
    let (mesh, constraints) = mesher::run(config)?;

    let output = solver::run(&mesh, &constraints, config)?;

    let (field, stresses) =
        post_processor::run(&mesh, &output.displacements, &output.stress_strain_mat)?;

    info!(
        nodes = mesh.node_count(),
        elements = mesh.element_count(),
        "analysis complete"
    );

    Ok(PlateSolution {
        mesh,
        field,
        displacements: output.displacements,
        reactions: output.reactions,
        stresses,
        stats: output.stats,
    })
}
