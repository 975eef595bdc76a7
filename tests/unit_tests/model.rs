use nalgebra::Point2;
use trellis::element::{BarElement, BeamElement, DesignParameter, ElementKind, QuadElement};
use trellis::error::AnalysisError;
use trellis::mesh::procedural::{bar_chain, cantilever_beam, rectangular_quad_grid};
use trellis::mesh::Mesh;
use trellis::model::Model;
use trellis::solid::materials::UniaxialMaterial;

use crate::{cantilever_model, plane_stress_material, uniform_design};

fn steel() -> UniaxialMaterial<f64> {
    UniaxialMaterial::linear(210e3, 7.8e-6)
}

#[test]
fn evaluator_count_must_match_mesh() {
    let mesh = bar_chain(3, 1.0);
    let elements = vec![ElementKind::from(BarElement::new(steel(), DesignParameter::Fixed(1.0))); 2];
    assert!(matches!(Model::new(mesh, elements), Err(AnalysisError::InvalidModel(_))));
}

#[test]
fn evaluator_node_count_must_match_cells() {
    let mesh = rectangular_quad_grid(2, 1, 1.0, 1.0);
    let result = Model::from_mesh(mesh, |_, _| {
        ElementKind::from(BarElement::new(steel(), DesignParameter::Fixed(1.0)))
    });
    assert!(matches!(result, Err(AnalysisError::InvalidModel(_))));
}

#[test]
fn evaluators_must_agree_on_variables_per_node() {
    let mesh = cantilever_beam(2, 1.0);
    let result = Model::from_mesh(mesh, |e, _| -> ElementKind<f64> {
        if e == 0 {
            BeamElement::new(steel(), 1.0, DesignParameter::Fixed(0.1)).into()
        } else {
            BarElement::new(steel(), DesignParameter::Fixed(0.1)).into()
        }
    });
    assert!(matches!(result, Err(AnalysisError::InvalidModel(_))));
}

#[test]
fn design_variable_count_follows_elements() {
    let mesh = rectangular_quad_grid(3, 1, 3.0, 1.0);
    let material = plane_stress_material();
    let model: Model<f64> = Model::from_mesh(mesh, |e, _| {
        let thickness = if e == 1 {
            DesignParameter::Fixed(0.1)
        } else {
            DesignParameter::Variable(2 * e)
        };
        QuadElement::new(material, thickness).into()
    })
    .unwrap();
    assert_eq!(model.num_design_variables(), 5);
    assert!(model.check_design(&[0.1; 5]).is_ok());
    assert!(matches!(model.check_design(&[0.1; 4]), Err(AnalysisError::InvalidModel(_))));
}

#[test]
fn boundary_conditions_and_loads() {
    let mut model = cantilever_model(3);
    assert_eq!(model.num_dofs(), 12);
    assert_eq!(model.constrained_dofs(), vec![0, 1, 2]);

    model.prescribe(11, 0.25).unwrap();
    model.prescribe(11, 0.5).unwrap();
    model.add_load(10, 2.0).unwrap();
    let conditions: Vec<_> = model.boundary_conditions().collect();
    assert_eq!(conditions, vec![(0, 0.0), (1, 0.0), (2, 0.0), (11, 0.5)]);
    let loads: Vec<_> = model.loads().collect();
    assert_eq!(loads, vec![(10, 3.0)]);

    assert!(matches!(model.prescribe(12, 0.0), Err(AnalysisError::InvalidModel(_))));
    assert!(matches!(model.add_load(40, 1.0), Err(AnalysisError::InvalidModel(_))));
}

#[test]
fn coordinate_updates_invalidate_the_design() {
    let mut model = cantilever_model(2);
    let mut context = uniform_design(2, 0.1);
    let version = context.version();
    model.update_coordinates(&mut context, |_, x| x.y += 1.0);
    assert!(context.version() > version);
    assert!(model.mesh().vertices().iter().all(|x| x.y == 1.0));
}

#[test]
fn node_queries() {
    let mesh: Mesh<f64> = rectangular_quad_grid(2, 2, 2.0, 1.0);
    assert_eq!(mesh.num_nodes(), 9);
    assert_eq!(mesh.num_elements(), 4);
    assert_eq!(mesh.find_nodes(|x| x.x == 2.0), vec![2, 5, 8]);
    assert_eq!(mesh.element_nodes(3), &[4, 5, 8, 7]);
    assert_eq!(mesh.vertices()[5], Point2::new(2.0, 0.5));
}
