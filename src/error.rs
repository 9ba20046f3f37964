use thiserror::Error;

pub type Result<T> = std::result::Result<T, TensileError>;

#[derive(Error, Debug)]
pub enum TensileError {
    #[error("input error: {0}")]
    Input(String),

    #[error("invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("invalid material: {0}")]
    InvalidMaterial(String),

    #[error("degenerate element {element}: jacobian determinant {det_j:e} is not positive")]
    DegenerateElement { element: usize, det_j: f64 },

    #[error("conflicting constraint on dof {dof}: {existing} already prescribed, got {requested}")]
    ConflictingConstraint {
        dof: usize,
        existing: f64,
        requested: f64,
    },

    #[error("singular system: {0}")]
    SingularSystem(String),

    #[error("shape mismatch: expected {expected} solution entries, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("post processor error: {0}")]
    PostProcessor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TensileError {
    /// Pipeline stage that raised the error.
    pub fn stage(&self) -> &'static str {
        match self {
            TensileError::Input(_) => "input",
            TensileError::InvalidMesh(_) => "mesher",
            TensileError::InvalidMaterial(_) => "material",
            TensileError::DegenerateElement { .. } => "element",
            TensileError::ConflictingConstraint { .. } => "boundary",
            TensileError::SingularSystem(_) => "solver",
            TensileError::ShapeMismatch { .. } => "post-processor",
            TensileError::PostProcessor(_) => "post-processor",
            TensileError::Io(_) => "post-processor",
        }
    }
}
