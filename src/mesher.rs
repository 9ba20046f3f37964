use json::JsonValue;
use tracing::{info, warn};

use crate::{
    datatypes::{
        DirichletConstraint, Element, Mesh, ProblemConfig, QuadratureRule, RightEdgePolicy,
        SolverMethod, Vertex,
    },
    error::{Result, TensileError},
};

/// Position of grid line `index` out of `divisions` along a side of `length`.
/// The last line is pinned to `length` so the far edge carries no round-off.
fn grid_coordinate(length: f64, index: usize, divisions: usize) -> f64 {
    if index == divisions {
        length
    } else {
        length * index as f64 / divisions as f64
    }
}

/// Builds a structured grid of bilinear quadrilaterals over a rectangle
///
/// # Arguments
/// * `length_x` - Plate length along x
/// * `length_y` - Plate length along y
/// * `elements_x` - Number of element columns
/// * `elements_y` - Number of element rows
///
/// # Returns
/// A mesh with `(elements_x + 1) * (elements_y + 1)` nodes and
/// `elements_x * elements_y` counter-clockwise elements
pub fn generate_mesh(
    length_x: f64,
    length_y: f64,
    elements_x: usize,
    elements_y: usize,
) -> Result<Mesh> {
    if elements_x < 1 || elements_y < 1 {
        return Err(TensileError::InvalidMesh(format!(
            "element counts must be at least 1, got {elements_x} x {elements_y}"
        )));
    }
    if !(length_x > 0.0 && length_x.is_finite()) || !(length_y > 0.0 && length_y.is_finite()) {
        return Err(TensileError::InvalidMesh(format!(
            "domain lengths must be positive and finite, got {length_x} x {length_y}"
        )));
    }

    let nodes_per_row = elements_x + 1;

    let mut vertices: Vec<Vertex> = Vec::with_capacity(nodes_per_row * (elements_y + 1));
    for j in 0..=elements_y {
        let y = grid_coordinate(length_y, j, elements_y);
        for i in 0..=elements_x {
            let x = grid_coordinate(length_x, i, elements_x);
            vertices.push(Vertex { x, y });
        }
    }

    let mut elements: Vec<Element> = Vec::with_capacity(elements_x * elements_y);
    for j in 0..elements_y {
        for i in 0..elements_x {
            let n0 = j * nodes_per_row + i;
            let n1 = n0 + 1;
            let n2 = n1 + nodes_per_row;
            let n3 = n0 + nodes_per_row;
            elements.push(Element {
                nodes: [n0, n1, n2, n3],
            });
        }
    }

    info!(
        nodes = vertices.len(),
        elements = elements.len(),
        "generated {elements_x}x{elements_y} mesh"
    );

    Ok(Mesh {
        length_x,
        length_y,
        elements_x,
        elements_y,
        vertices,
        elements,
    })
}

/// Translates the edge loading of a problem into a flat list of prescribed
/// degrees of freedom
///
/// # Arguments
/// * `mesh` - The mesh the constraints refer to
/// * `config` - The problem whose edge rules are applied
///
/// # Returns
/// Left-edge constraints (if clamped) followed by right-edge constraints
pub fn build_edge_constraints(mesh: &Mesh, config: &ProblemConfig) -> Vec<DirichletConstraint> {
    let mut constraints: Vec<DirichletConstraint> = Vec::new();

    if config.fix_left {
        for node in mesh.left_edge_nodes() {
            constraints.push(DirichletConstraint {
                dof: 2 * node,
                value: 0.0,
            });
            constraints.push(DirichletConstraint {
                dof: 2 * node + 1,
                value: 0.0,
            });
        }
    } else {
        warn!("left edge is not clamped; the system will only be solvable if other constraints remove all rigid-body modes");
    }

    for node in mesh.right_edge_nodes() {
        constraints.push(DirichletConstraint {
            dof: 2 * node,
            value: config.ux_right,
        });
        if config.right_edge == RightEdgePolicy::FixedY {
            constraints.push(DirichletConstraint {
                dof: 2 * node + 1,
                value: 0.0,
            });
        }
    }

    info!("built {} edge constraints", constraints.len());

    constraints
}

/// Parses the input json into a JsonValue object
///
/// # Arguments
/// * `input_file` - The path to the input file
///
/// # Returns
/// A JsonValue object with at least the `geometry` and `metadata` sections
pub fn load_input_file(input_file: &str) -> Result<JsonValue> {
    let file_string = match std::fs::read_to_string(input_file) {
        Ok(f) => f,
        Err(err) => {
            return Err(TensileError::Input(format!(
                "Unable to open input file {input_file}: {err}"
            )))
        }
    };

    parse_input(&file_string)
}

/// Parses input json text, checking that the required sections exist
pub fn parse_input(contents: &str) -> Result<JsonValue> {
    let input_json = match json::parse(contents) {
        Ok(f) => f,
        Err(err) => return Err(TensileError::Input(format!("Error in input file json: {err}"))),
    };

    for section in ["geometry", "metadata"] {
        if !input_json.has_key(section) {
            return Err(TensileError::Input(format!(
                "Input json missing {section} section"
            )));
        }
    }

    Ok(input_json)
}

fn required_f64(input_json: &JsonValue, section: &str, key: &str) -> Result<f64> {
    match optional_f64(input_json, section, key)? {
        Some(v) => Ok(v),
        None => Err(TensileError::Input(format!(
            "Input json missing {key} field in {section} section"
        ))),
    }
}

fn optional_f64(input_json: &JsonValue, section: &str, key: &str) -> Result<Option<f64>> {
    let value = &input_json[section][key];
    if value.is_null() {
        return Ok(None);
    }
    match value.as_f64() {
        Some(v) => Ok(Some(v)),
        None => Err(TensileError::Input(format!(
            "Bad value for {key} in {section} section: expected a number"
        ))),
    }
}

fn required_usize(input_json: &JsonValue, section: &str, key: &str) -> Result<usize> {
    let value = &input_json[section][key];
    if value.is_null() {
        return Err(TensileError::Input(format!(
            "Input json missing {key} field in {section} section"
        )));
    }
    match value.as_usize() {
        Some(v) => Ok(v),
        None => Err(TensileError::Input(format!(
            "Bad value for {key} in {section} section: expected a non-negative integer"
        ))),
    }
}

fn optional_bool(input_json: &JsonValue, section: &str, key: &str) -> Result<Option<bool>> {
    let value = &input_json[section][key];
    if value.is_null() {
        return Ok(None);
    }
    match value.as_bool() {
        Some(v) => Ok(Some(v)),
        None => Err(TensileError::Input(format!(
            "Bad value for {key} in {section} section: expected true or false"
        ))),
    }
}

fn optional_str<'a>(input_json: &'a JsonValue, section: &str, key: &str) -> Result<Option<&'a str>> {
    let value = &input_json[section][key];
    if value.is_null() {
        return Ok(None);
    }
    match value.as_str() {
        Some(v) => Ok(Some(v)),
        None => Err(TensileError::Input(format!(
            "Bad value for {key} in {section} section: expected a string"
        ))),
    }
}

/// Parses a ProblemConfig from the input json
///
/// Missing optional fields keep their [`ProblemConfig::default`] value.
///
/// # Arguments
/// * `input_json`: The input file as a JsonValue object
///
/// # Returns
/// A ProblemConfig instance
pub fn parse_problem_config(input_json: &JsonValue) -> Result<ProblemConfig> {
    let mut config = ProblemConfig {
        length_x: required_f64(input_json, "geometry", "length_x")?,
        length_y: required_f64(input_json, "geometry", "length_y")?,
        elements_x: required_usize(input_json, "geometry", "elements_x")?,
        elements_y: required_usize(input_json, "geometry", "elements_y")?,
        youngs_modulus: required_f64(input_json, "metadata", "material_elasticity")?,
        poisson_ratio: required_f64(input_json, "metadata", "poisson_ratio")?,
        ..ProblemConfig::default()
    };

    if let Some(thickness) = optional_f64(input_json, "metadata", "part_thickness")? {
        config.thickness = thickness;
    }

    if let Some(fix_left) = optional_bool(input_json, "boundary_conditions", "fix_left")? {
        config.fix_left = fix_left;
    }
    if let Some(ux_right) = optional_f64(input_json, "boundary_conditions", "ux_right")? {
        if !ux_right.is_finite() {
            return Err(TensileError::Input(format!(
                "ux_right must be finite, got {ux_right}"
            )));
        }
        config.ux_right = ux_right;
    }
    if let Some(policy) = optional_str(input_json, "boundary_conditions", "right_edge_y")? {
        config.right_edge = match policy.trim() {
            "free" => RightEdgePolicy::FreeY,
            "fixed" => RightEdgePolicy::FixedY,
            other => {
                return Err(TensileError::Input(format!(
                    "Unrecognized right_edge_y policy '{other}', expected 'free' or 'fixed'"
                )))
            }
        };
    }

    if let Some(method) = optional_str(input_json, "solver", "method")? {
        config.solver.method = match method.trim() {
            "direct" => SolverMethod::Direct,
            "cg" => SolverMethod::ConjugateGradient,
            other => {
                return Err(TensileError::Input(format!(
                    "Unrecognized solver method '{other}', expected 'direct' or 'cg'"
                )))
            }
        };
    }
    if let Some(quadrature) = optional_str(input_json, "solver", "quadrature")? {
        config.quadrature = match quadrature.trim() {
            "full" => QuadratureRule::Full,
            "reduced" => QuadratureRule::Reduced,
            other => {
                return Err(TensileError::Input(format!(
                    "Unrecognized quadrature '{other}', expected 'full' or 'reduced'"
                )))
            }
        };
    }
    if let Some(tolerance) = optional_f64(input_json, "solver", "tolerance")? {
        if !(tolerance > 0.0) {
            return Err(TensileError::Input(format!(
                "Solver tolerance must be positive, got {tolerance}"
            )));
        }
        config.solver.tolerance = tolerance;
    }
    if !input_json["solver"]["max_iters"].is_null() {
        config.solver.max_iters = required_usize(input_json, "solver", "max_iters")? as u64;
    }
    if let Some(parallel) = optional_bool(input_json, "solver", "parallel")? {
        config.solver.parallel_assembly = parallel;
    }

    Ok(config)
}

/// Loads a problem description from an input file
///
/// # Arguments
/// * `input_file` - The path to the json input file
///
/// # Returns
/// The parsed problem configuration
pub fn load_problem(input_file: &str) -> Result<ProblemConfig> {
    let input_json = load_input_file(input_file)?;
    let config = parse_problem_config(&input_json)?;
    info!("loaded problem from {input_file}");
    Ok(config)
}

/// Runs the mesher
///
/// # Arguments
/// * `config` - The problem to mesh
///
/// # Returns
/// The mesh and the edge constraints that apply to it, in that order
pub fn run(config: &ProblemConfig) -> Result<(Mesh, Vec<DirichletConstraint>)> {
    let mesh = generate_mesh(
        config.length_x,
        config.length_y,
        config.elements_x,
        config.elements_y,
    )?;
    let constraints = build_edge_constraints(&mesh, config);

    Ok((mesh, constraints))
}
