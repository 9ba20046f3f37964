use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{
    datatypes::{DisplacementField, ElementStress, Mesh, PlateSolution, SolverMethod},
    error::{Result, TensileError},
    solver::{compute_strain_displacement_matrix, element_dofs},
};
use json::JsonValue;
use nalgebra::{DMatrix, DVector, Matrix3, SVector};
use tracing::info;

/// Output format for solver results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    /// `nodes.csv`, `elements.csv`, `ux.csv` and `uy.csv`
    #[default]
    Csv,
    /// A single `displacement.json`
    Json,
}

/// Splits an interleaved displacement vector into per-axis grids
///
/// # Arguments
/// * `displacements` - `[ux0, uy0, ux1, uy1, ...]` in node order
/// * `elements_x` - Number of element columns
/// * `elements_y` - Number of element rows
///
/// # Returns
/// `(ux, uy)`, each `(elements_y + 1) x (elements_x + 1)`, with entry
/// `(j, i)` holding node `j * (elements_x + 1) + i`
pub fn reshape_displacements(
    displacements: &DVector<f64>,
    elements_x: usize,
    elements_y: usize,
) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
    let columns = elements_x + 1;
    let rows = elements_y + 1;
    let expected = 2 * rows * columns;
    if displacements.len() != expected {
        return Err(TensileError::ShapeMismatch {
            expected,
            actual: displacements.len(),
        });
    }

    let ux = DMatrix::from_fn(rows, columns, |j, i| displacements[2 * (j * columns + i)]);
    let uy = DMatrix::from_fn(rows, columns, |j, i| {
        displacements[2 * (j * columns + i) + 1]
    });

    Ok((ux, uy))
}

/// Reshapes the solution and attaches node coordinate grids
pub fn build_displacement_field(
    mesh: &Mesh,
    displacements: &DVector<f64>,
) -> Result<DisplacementField> {
    let (ux, uy) = reshape_displacements(displacements, mesh.elements_x(), mesh.elements_y())?;

    let x_coords = mesh.x_coords();
    let y_coords = mesh.y_coords();
    let x_grid = DMatrix::from_fn(ux.nrows(), ux.ncols(), |_, i| x_coords[i]);
    let y_grid = DMatrix::from_fn(ux.nrows(), ux.ncols(), |j, _| y_coords[j]);

    Ok(DisplacementField {
        ux,
        uy,
        x_grid,
        y_grid,
    })
}

/// Computes the stress at the centroid of each element
///
/// # Arguments
/// * `mesh` - The solved mesh
/// * `displacements` - The displacement vector
/// * `stress_strain_mat` - The plane-stress material matrix
///
/// # Returns
/// One stress state per element, in element order
pub fn compute_element_stresses(
    mesh: &Mesh,
    displacements: &DVector<f64>,
    stress_strain_mat: &Matrix3<f64>,
) -> Result<Vec<ElementStress>> {
    if displacements.len() != mesh.dof_count() {
        return Err(TensileError::ShapeMismatch {
            expected: mesh.dof_count(),
            actual: displacements.len(),
        });
    }

    mesh.elements()
        .iter()
        .enumerate()
        .map(|(id, element)| {
            let vertices = mesh.element_vertices(element);
            let (strain_displacement_mat, _) =
                compute_strain_displacement_matrix(id, &vertices, 0.0, 0.0)?;

            let element_displacements =
                SVector::<f64, 8>::from_iterator(element_dofs(element).map(|dof| displacements[dof]));
            let stress = stress_strain_mat * strain_displacement_mat * element_displacements;

            let (sigma_xx, sigma_yy, tau_xy) = (stress[0], stress[1], stress[2]);
            let von_mises = f64::sqrt(
                sigma_xx.powi(2) - sigma_xx * sigma_yy + sigma_yy.powi(2) + 3.0 * tau_xy.powi(2),
            );

            Ok(ElementStress {
                sigma_xx,
                sigma_yy,
                tau_xy,
                von_mises,
            })
        })
        .collect()
}

/// Runs the post processor
///
/// # Arguments
/// * `mesh` - The solved mesh
/// * `displacements` - The displacement vector
/// * `stress_strain_mat` - The plane-stress material matrix
///
/// # Returns
/// The displacement grids and the element stresses
pub fn run(
    mesh: &Mesh,
    displacements: &DVector<f64>,
    stress_strain_mat: &Matrix3<f64>,
) -> Result<(DisplacementField, Vec<ElementStress>)> {
    let field = build_displacement_field(mesh, displacements)?;
    let stresses = compute_element_stresses(mesh, displacements, stress_strain_mat)?;

    let peak = stresses.iter().map(|s| s.von_mises).fold(0.0, f64::max);
    info!(peak_von_mises = peak, "post processing complete");

    Ok((field, stresses))
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    match File::create(path) {
        Ok(f) => Ok(BufWriter::new(f)),
        Err(err) => Err(TensileError::PostProcessor(format!(
            "Failed to create {}: {err}",
            path.display()
        ))),
    }
}

fn write_grid(path: &Path, grid: &DMatrix<f64>) -> Result<()> {
    let mut file = create_output(path)?;
    for row in grid.row_iter() {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(file, "{}", line.join(","))?;
    }
    file.flush()?;
    Ok(())
}

/// Writes simulation results to CSV files
///
/// # Arguments
/// * `solution` - The solved plate
/// * `output_dir` - Directory receiving `nodes.csv`, `elements.csv`,
///   `ux.csv` and `uy.csv`
///
/// # Returns
/// The paths written
pub fn csv_output(solution: &PlateSolution, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let nodes_output = output_dir.join("nodes.csv");
    let elements_output = output_dir.join("elements.csv");
    let ux_output = output_dir.join("ux.csv");
    let uy_output = output_dir.join("uy.csv");

    // Write nodes
    let mut nodes_file = create_output(&nodes_output)?;
    writeln!(nodes_file, "x,y,ux,uy")?;
    for (node, vertex) in solution.mesh.vertices().iter().enumerate() {
        writeln!(
            nodes_file,
            "{x},{y},{ux},{uy}",
            x = vertex.x,
            y = vertex.y,
            ux = solution.displacements[2 * node],
            uy = solution.displacements[2 * node + 1],
        )?;
    }
    nodes_file.flush()?;

    // Write elements
    let mut elements_file = create_output(&elements_output)?;
    writeln!(elements_file, "n0,n1,n2,n3,sxx,syy,sxy,von_mises")?;
    for (element, stress) in solution.mesh.elements().iter().zip(&solution.stresses) {
        writeln!(
            elements_file,
            "{n0},{n1},{n2},{n3},{sxx},{syy},{sxy},{vm}",
            n0 = element.nodes[0],
            n1 = element.nodes[1],
            n2 = element.nodes[2],
            n3 = element.nodes[3],
            sxx = stress.sigma_xx,
            syy = stress.sigma_yy,
            sxy = stress.tau_xy,
            vm = stress.von_mises,
        )?;
    }
    elements_file.flush()?;

    write_grid(&ux_output, &solution.field.ux)?;
    write_grid(&uy_output, &solution.field.uy)?;

    info!(
        "wrote output to {}, {}, {} and {}",
        nodes_output.display(),
        elements_output.display(),
        ux_output.display(),
        uy_output.display()
    );

    Ok(vec![nodes_output, elements_output, ux_output, uy_output])
}

fn grid_to_json(grid: &DMatrix<f64>) -> JsonValue {
    let rows: Vec<Vec<f64>> = grid
        .row_iter()
        .map(|row| row.iter().copied().collect())
        .collect();
    JsonValue::from(rows)
}

fn insert(object: &mut JsonValue, key: &str, value: JsonValue) -> Result<()> {
    match object.insert(key, value) {
        Ok(()) => Ok(()),
        Err(err) => Err(TensileError::PostProcessor(format!(
            "Failed to serialize '{key}': {err}"
        ))),
    }
}

/// Builds the JSON document written by [`json_output`]
pub fn solution_to_json(solution: &PlateSolution) -> Result<JsonValue> {
    let mut reactions = JsonValue::new_array();
    for reaction in &solution.reactions {
        let mut entry = JsonValue::new_object();
        insert(&mut entry, "dof", reaction.dof.into())?;
        insert(&mut entry, "force", reaction.force.into())?;
        if let Err(err) = reactions.push(entry) {
            return Err(TensileError::PostProcessor(format!(
                "Failed to serialize reactions: {err}"
            )));
        }
    }

    let stats = &solution.stats;
    let mut solve = JsonValue::new_object();
    let method = match stats.method {
        SolverMethod::Direct => "direct",
        SolverMethod::ConjugateGradient => "cg",
    };
    insert(&mut solve, "method", method.into())?;
    insert(&mut solve, "iterations", stats.iterations.into())?;
    insert(&mut solve, "relative_residual", stats.relative_residual.into())?;
    insert(&mut solve, "elapsed_secs", stats.elapsed_secs.into())?;

    let mut root = JsonValue::new_object();
    insert(&mut root, "x", solution.mesh.x_coords().into())?;
    insert(&mut root, "y", solution.mesh.y_coords().into())?;
    insert(&mut root, "ux", grid_to_json(&solution.field.ux))?;
    insert(&mut root, "uy", grid_to_json(&solution.field.uy))?;
    insert(&mut root, "reactions", reactions)?;
    insert(&mut root, "solve", solve)?;

    Ok(root)
}

/// Writes simulation results to `displacement.json`
///
/// # Arguments
/// * `solution` - The solved plate
/// * `output_dir` - Directory receiving the file
///
/// # Returns
/// The path written
pub fn json_output(solution: &PlateSolution, output_dir: &Path) -> Result<PathBuf> {
    let output = output_dir.join("displacement.json");
    let document = solution_to_json(solution)?;

    let mut file = create_output(&output)?;
    file.write_all(document.pretty(2).as_bytes())?;
    file.flush()?;

    info!("wrote output to {}", output.display());

    Ok(output)
}

/// Writes results in the requested format
pub fn export(
    solution: &PlateSolution,
    output_dir: &Path,
    format: ExportFormat,
) -> Result<Vec<PathBuf>> {
    if let Err(err) = std::fs::create_dir_all(output_dir) {
        return Err(TensileError::PostProcessor(format!(
            "Failed to create output directory {}: {err}",
            output_dir.display()
        )));
    }

    match format {
        ExportFormat::Csv => csv_output(solution, output_dir),
        ExportFormat::Json => Ok(vec![json_output(solution, output_dir)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesher::generate_mesh;
    use crate::solver::compute_stress_strain_matrix;
    use matrixcompare::{assert_matrix_eq, assert_scalar_eq};

    #[test]
    fn reshape_follows_row_major_node_order() {
        // node n carries ux = n, uy = -n
        let displacements = DVector::from_fn(12, |k, _| {
            let node = (k / 2) as f64;
            if k % 2 == 0 {
                node
            } else {
                -node
            }
        });
        let (ux, uy) = reshape_displacements(&displacements, 2, 1).unwrap();

        assert_eq!(ux.shape(), (2, 3));
        assert_matrix_eq!(ux, DMatrix::from_row_slice(2, 3, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        assert_matrix_eq!(
            uy,
            DMatrix::from_row_slice(2, 3, &[0.0, -1.0, -2.0, -3.0, -4.0, -5.0])
        );
    }

    #[test]
    fn reshape_rejects_wrong_length() {
        let err = reshape_displacements(&DVector::zeros(10), 2, 1).unwrap_err();
        assert!(matches!(
            err,
            TensileError::ShapeMismatch {
                expected: 12,
                actual: 10
            }
        ));
    }

    #[test]
    fn coordinate_grids_match_node_positions() {
        let mesh = generate_mesh(2.0, 1.0, 4, 2).unwrap();
        let field = build_displacement_field(&mesh, &DVector::zeros(mesh.dof_count())).unwrap();

        assert_eq!(field.x_grid.shape(), (3, 5));
        for j in 0..3 {
            for i in 0..5 {
                let vertex = mesh.vertices()[mesh.node_id(i, j)];
                assert_eq!(field.x_grid[(j, i)], vertex.x);
                assert_eq!(field.y_grid[(j, i)], vertex.y);
            }
        }
    }

    #[test]
    fn uniform_stretch_gives_uniform_stress() {
        // u = 0.001 x, v = 0 on every node
        let mesh = generate_mesh(2.0, 1.0, 2, 2).unwrap();
        let c = compute_stress_strain_matrix(0.25, 2e9).unwrap();
        let mut displacements = DVector::zeros(mesh.dof_count());
        for (node, vertex) in mesh.vertices().iter().enumerate() {
            displacements[2 * node] = 0.001 * vertex.x;
        }

        let stresses = compute_element_stresses(&mesh, &displacements, &c).unwrap();
        assert_eq!(stresses.len(), 4);
        for stress in stresses {
            assert_scalar_eq!(stress.sigma_xx, c[(0, 0)] * 0.001, comp = abs, tol = 1e-3);
            assert_scalar_eq!(stress.sigma_yy, c[(1, 0)] * 0.001, comp = abs, tol = 1e-3);
            assert_scalar_eq!(stress.tau_xy, 0.0, comp = abs, tol = 1e-3);
            assert!(stress.von_mises > 0.0);
        }
    }

    #[test]
    fn pure_shear_von_mises() {
        // u = 0.5 g y, v = 0.5 g x
        let mesh = generate_mesh(1.0, 1.0, 1, 1).unwrap();
        let c = compute_stress_strain_matrix(0.3, 1e9).unwrap();
        let gamma = 1e-3;
        let mut displacements = DVector::zeros(mesh.dof_count());
        for (node, vertex) in mesh.vertices().iter().enumerate() {
            displacements[2 * node] = 0.5 * gamma * vertex.y;
            displacements[2 * node + 1] = 0.5 * gamma * vertex.x;
        }

        let stress = compute_element_stresses(&mesh, &displacements, &c).unwrap()[0];
        let tau = c[(2, 2)] * gamma;
        assert_scalar_eq!(stress.tau_xy, tau, comp = abs, tol = 1e-3);
        assert_scalar_eq!(stress.von_mises, 3f64.sqrt() * tau, comp = abs, tol = 1e-3);
    }
}
