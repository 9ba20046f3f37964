use matrixcompare::{assert_matrix_eq, assert_scalar_eq};
use tensile::{
    post_processor, ExportFormat, ProblemConfig, QuadratureRule, RightEdgePolicy, SolverMethod,
    SolverSettings, TensileError,
};

fn plate(elements_x: usize, elements_y: usize) -> ProblemConfig {
    ProblemConfig {
        elements_x,
        elements_y,
        ..ProblemConfig::default()
    }
}

#[test]
fn pulled_plate_on_coarse_mesh() {
    let solution = tensile::run(&plate(2, 2)).unwrap();
    let ux = &solution.field.ux;
    let uy = &solution.field.uy;

    assert_eq!(ux.shape(), (3, 3));
    assert_eq!(uy.shape(), (3, 3));

    for j in 0..3 {
        assert_eq!(ux[(j, 0)], 0.0);
        assert_eq!(uy[(j, 0)], 0.0);
        assert_scalar_eq!(ux[(j, 2)], 0.1, comp = abs, tol = 1e-12);
        assert!(ux[(j, 0)] < ux[(j, 1)] && ux[(j, 1)] < ux[(j, 2)]);
    }

    // the centre lags the free top and bottom edges
    assert_scalar_eq!(ux[(1, 1)], 0.047051, comp = abs, tol = 1e-5);
    assert_scalar_eq!(ux[(0, 1)], ux[(2, 1)], comp = abs, tol = 1e-12);

    // Poisson contraction pulls the free corners toward the centreline
    assert!(uy[(0, 2)] > 0.0);
    assert!(uy[(2, 2)] < 0.0);
    assert_scalar_eq!(uy[(0, 2)], -uy[(2, 2)], comp = abs, tol = 1e-12);
    assert_scalar_eq!(uy[(1, 1)], 0.0, comp = abs, tol = 1e-12);
}

#[test]
fn ux_increases_along_every_row() {
    let solution = tensile::run(&plate(6, 4)).unwrap();
    let ux = &solution.field.ux;

    for j in 0..ux.nrows() {
        for i in 1..ux.ncols() {
            assert!(ux[(j, i)] > ux[(j, i - 1)], "row {j} column {i}");
        }
    }
}

#[test]
fn zero_pull_gives_zero_field() {
    let config = ProblemConfig {
        ux_right: 0.0,
        ..plate(5, 3)
    };
    let solution = tensile::run(&config).unwrap();

    assert!(solution.field.ux.iter().all(|u| u.abs() < 1e-10));
    assert!(solution.field.uy.iter().all(|u| u.abs() < 1e-10));
    assert!(solution.stresses.iter().all(|s| s.von_mises.abs() < 1e-10));
}

#[test]
fn refinement_converges() {
    let coarse = tensile::run(&plate(2, 2)).unwrap();
    let fine = tensile::run(&plate(10, 10)).unwrap();

    for field in [&coarse.field, &fine.field] {
        let last = field.ux.ncols() - 1;
        for j in 0..field.ux.nrows() {
            assert_eq!(field.ux[(j, 0)], 0.0);
            assert_scalar_eq!(field.ux[(j, last)], 0.1, comp = abs, tol = 1e-12);
        }
    }

    let coarse_centre = coarse.field.ux[(1, 1)];
    let fine_centre = fine.field.ux[(5, 5)];
    assert!((coarse_centre - fine_centre).abs() < 5e-3);
    assert!(fine_centre > coarse_centre);
}

#[test]
fn coordinate_grids_span_the_plate() {
    let config = ProblemConfig {
        length_x: 3.0,
        length_y: 2.0,
        ..plate(3, 4)
    };
    let solution = tensile::run(&config).unwrap();
    let field = &solution.field;

    assert_eq!(field.x_grid.shape(), (5, 4));
    assert_eq!(field.x_grid[(0, 0)], 0.0);
    assert_eq!(field.x_grid[(4, 3)], 3.0);
    assert_eq!(field.y_grid[(4, 3)], 2.0);
    assert_scalar_eq!(field.y_grid[(2, 0)], 1.0, comp = abs, tol = 1e-15);
}

#[test]
fn invalid_inputs_are_named() {
    let err = tensile::run(&plate(0, 4)).unwrap_err();
    assert!(matches!(err, TensileError::InvalidMesh(_)), "{err}");
    assert_eq!(err.stage(), "mesher");

    let config = ProblemConfig {
        youngs_modulus: -1.0,
        ..plate(2, 2)
    };
    let err = tensile::run(&config).unwrap_err();
    assert!(matches!(err, TensileError::InvalidMaterial(_)), "{err}");

    let config = ProblemConfig {
        poisson_ratio: 0.5,
        ..plate(2, 2)
    };
    assert!(matches!(
        tensile::run(&config),
        Err(TensileError::InvalidMaterial(_))
    ));

    let config = ProblemConfig {
        length_y: 0.0,
        ..plate(2, 2)
    };
    assert!(matches!(
        tensile::run(&config),
        Err(TensileError::InvalidMesh(_))
    ));
}

#[test]
fn free_left_edge_is_singular() {
    let config = ProblemConfig {
        fix_left: false,
        ..plate(3, 3)
    };
    let err = tensile::run(&config).unwrap_err();
    assert!(matches!(err, TensileError::SingularSystem(_)), "{err}");
    assert_eq!(err.stage(), "solver");
}

#[test]
fn conjugate_gradient_matches_direct_solve() {
    let direct = tensile::run(&plate(4, 4)).unwrap();
    let config = ProblemConfig {
        solver: SolverSettings {
            method: SolverMethod::ConjugateGradient,
            tolerance: 1e-12,
            ..SolverSettings::default()
        },
        ..plate(4, 4)
    };
    let iterative = tensile::run(&config).unwrap();

    assert_eq!(iterative.stats.method, SolverMethod::ConjugateGradient);
    assert_matrix_eq!(direct.field.ux, iterative.field.ux, comp = abs, tol = 1e-9);
    assert_matrix_eq!(direct.field.uy, iterative.field.uy, comp = abs, tol = 1e-9);
}

#[test]
fn sequential_and_parallel_assembly_agree() {
    let parallel = tensile::run(&plate(12, 9)).unwrap();
    let config = ProblemConfig {
        solver: SolverSettings {
            parallel_assembly: false,
            ..SolverSettings::default()
        },
        ..plate(12, 9)
    };
    let sequential = tensile::run(&config).unwrap();

    assert_matrix_eq!(parallel.field.ux, sequential.field.ux, comp = abs, tol = 1e-12);
    assert_matrix_eq!(parallel.field.uy, sequential.field.uy, comp = abs, tol = 1e-12);
}

#[test]
fn fixed_right_edge_holds_y() {
    let config = ProblemConfig {
        right_edge: RightEdgePolicy::FixedY,
        ..plate(4, 4)
    };
    let solution = tensile::run(&config).unwrap();
    let uy = &solution.field.uy;
    let last = uy.ncols() - 1;

    for j in 0..uy.nrows() {
        assert_eq!(uy[(j, last)], 0.0);
        assert_scalar_eq!(solution.field.ux[(j, last)], 0.1, comp = abs, tol = 1e-12);
    }
    // the free plate contracts, the held one cannot
    let free = tensile::run(&plate(4, 4)).unwrap();
    assert!(free.field.uy[(0, last)] > 0.0);
}

#[test]
fn reactions_balance() {
    let solution = tensile::run(&plate(6, 6)).unwrap();
    let mesh = &solution.mesh;
    let right: Vec<usize> = mesh.right_edge_nodes().collect();

    let (mut pull, mut hold) = (0.0, 0.0);
    for reaction in solution.reactions.iter().filter(|r| r.dof % 2 == 0) {
        if right.contains(&(reaction.dof / 2)) {
            pull += reaction.force;
        } else {
            hold += reaction.force;
        }
    }

    assert!(pull > 0.0);
    assert_scalar_eq!(pull + hold, 0.0, comp = abs, tol = 1e-6 * pull);
    // left edge carries both components, right edge only x
    assert_eq!(solution.reactions.len(), 2 * 7 + 7);
}

#[test]
fn stresses_reflect_the_pull() {
    let solution = tensile::run(&plate(4, 4)).unwrap();

    assert_eq!(solution.stresses.len(), 16);
    for stress in &solution.stresses {
        assert!(stress.sigma_xx > 0.0);
        assert!(stress.von_mises > 0.0);
    }
}

#[test]
fn reduced_integration_solves_clamped_plate() {
    let config = ProblemConfig {
        quadrature: QuadratureRule::Reduced,
        ..plate(1, 1)
    };
    // one clamped element leaves no hourglass freedom
    let solution = tensile::run(&config).unwrap();
    assert_scalar_eq!(solution.field.ux[(0, 1)], 0.1, comp = abs, tol = 1e-12);

    let config = ProblemConfig {
        quadrature: QuadratureRule::Reduced,
        ..plate(4, 4)
    };
    let solution = tensile::run(&config).unwrap();
    assert!(solution.stats.relative_residual < 1e-10);
    for j in 0..5 {
        assert_eq!(solution.field.ux[(j, 0)], 0.0);
        assert_scalar_eq!(solution.field.ux[(j, 4)], 0.1, comp = abs, tol = 1e-12);
    }
}

#[test]
fn exports_results() {
    let dir = std::env::temp_dir().join(format!("tensile-export-{}", std::process::id()));
    let solution = tensile::run(&plate(2, 3)).unwrap();

    let written = post_processor::export(&solution, &dir, ExportFormat::Csv).unwrap();
    assert_eq!(written.len(), 4);

    let nodes = std::fs::read_to_string(dir.join("nodes.csv")).unwrap();
    let mut lines = nodes.lines();
    assert_eq!(lines.next(), Some("x,y,ux,uy"));
    assert_eq!(lines.count(), 12);

    let ux = std::fs::read_to_string(dir.join("ux.csv")).unwrap();
    assert_eq!(ux.lines().count(), 4);
    assert!(ux.lines().all(|line| line.split(',').count() == 3));

    let elements = std::fs::read_to_string(dir.join("elements.csv")).unwrap();
    assert_eq!(elements.lines().count(), 7);

    let written = post_processor::export(&solution, &dir, ExportFormat::Json).unwrap();
    let document = json::parse(&std::fs::read_to_string(&written[0]).unwrap()).unwrap();
    assert_eq!(document["ux"].len(), 4);
    assert_eq!(document["ux"][0].len(), 3);
    assert_eq!(document["x"].len(), 3);
    assert_eq!(document["solve"]["method"].as_str(), Some("direct"));
    assert_eq!(document["reactions"].len(), solution.reactions.len());

    std::fs::remove_dir_all(&dir).unwrap();
}
