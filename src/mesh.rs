use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use nalgebra::Vector3;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    config::{ContinueFrom, RunConfig},
    datatypes::{Domain, DomainState, Element, ElementKind, Model, Node, StateMap},
    error::BesoError,
    post_processor,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshNode {
    pub id: u64,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshElement {
    pub id: u64,
    #[serde(rename = "type")]
    pub element_type: String,
    pub nodes: Vec<u64>,
}

/// Mesh as handed over by the pre-processor
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshData {
    pub nodes: Vec<MeshNode>,
    pub elements: Vec<MeshElement>,
    #[serde(default)]
    pub element_sets: BTreeMap<String, Vec<u64>>,
    #[serde(default)]
    pub node_sets: BTreeMap<String, Vec<u64>>,
}

/// Geometric kind and number of corner nodes of a mesh element type
fn classify(element_type: &str) -> Option<(ElementKind, usize)> {
    match element_type.to_lowercase().as_str() {
        "tria3" | "tria6" => Some((ElementKind::Shell, 3)),
        "quad4" | "quad8" => Some((ElementKind::Shell, 4)),
        "tetra4" | "tetra10" => Some((ElementKind::Solid, 4)),
        "hexa8" | "hexa20" => Some((ElementKind::Solid, 8)),
        "penta6" | "penta15" => Some((ElementKind::Solid, 6)),
        _ => None,
    }
}

fn tetra_volume(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>, d: &Vector3<f64>) -> f64 {
    ((b - a).cross(&(c - a)).dot(&(d - a)) / 6.0).abs()
}

fn triangle_area(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    0.5 * (b - a).cross(&(c - a)).norm()
}

/// Calculates the area (shells) or volume (solids) of an element
///
/// # Arguments
/// * `kind` - The geometric kind of the element
/// * `corners` - The corner node positions in mesh order
///
/// # Returns
/// The element measure
pub fn compute_measure(kind: ElementKind, corners: &[Vector3<f64>]) -> f64 {
    let p = corners;
    match (kind, p.len()) {
        (ElementKind::Shell, 3) => triangle_area(&p[0], &p[1], &p[2]),
        (ElementKind::Shell, 4) => {
            triangle_area(&p[0], &p[1], &p[2]) + triangle_area(&p[0], &p[2], &p[3])
        }
        (ElementKind::Solid, 4) => tetra_volume(&p[0], &p[1], &p[2], &p[3]),
        (ElementKind::Solid, 6) => {
            tetra_volume(&p[0], &p[1], &p[2], &p[3])
                + tetra_volume(&p[1], &p[2], &p[3], &p[4])
                + tetra_volume(&p[2], &p[3], &p[4], &p[5])
        }
        (ElementKind::Solid, 8) => {
            // hexahedron split into five tetrahedra
            tetra_volume(&p[0], &p[1], &p[3], &p[4])
                + tetra_volume(&p[1], &p[2], &p[3], &p[6])
                + tetra_volume(&p[4], &p[5], &p[6], &p[1])
                + tetra_volume(&p[4], &p[6], &p[7], &p[3])
                + tetra_volume(&p[1], &p[3], &p[4], &p[6])
        }
        _ => 0.0,
    }
}

pub fn compute_centroid(corners: &[Vector3<f64>]) -> Vector3<f64> {
    corners.iter().sum::<Vector3<f64>>() / corners.len() as f64
}

/// Largest distance between two corner nodes
pub fn compute_size(corners: &[Vector3<f64>]) -> f64 {
    let mut size: f64 = 0.0;
    for (i, a) in corners.iter().enumerate() {
        for b in &corners[i + 1..] {
            size = size.max((a - b).norm());
        }
    }
    size
}

/// Parses the JSON mesh description
pub fn load_mesh(mesh_file: &Path) -> Result<MeshData, BesoError> {
    let contents = match std::fs::read_to_string(mesh_file) {
        Ok(c) => c,
        Err(err) => {
            return Err(BesoError::Configuration(format!(
                "Unable to open mesh file {}: {err}",
                mesh_file.display()
            )))
        }
    };
    let mesh: MeshData = serde_json::from_str(&contents)?;
    info!(
        "loaded {} nodes and {} elements",
        mesh.nodes.len(),
        mesh.elements.len()
    );
    Ok(mesh)
}

/// Builds the domain/mesh model from the imported mesh and the declared domains
///
/// # Arguments
/// * `mesh` - The imported mesh
/// * `config` - The run configuration
///
/// # Returns
/// A Model containing only the elements of declared domains
pub fn build_model(mesh: &MeshData, config: &RunConfig) -> Result<Model, BesoError> {
    let mut nodes: Vec<Node> = Vec::with_capacity(mesh.nodes.len());
    let mut node_index: HashMap<u64, usize> = HashMap::with_capacity(mesh.nodes.len());
    for node in &mesh.nodes {
        node_index.insert(node.id, nodes.len());
        nodes.push(Node {
            label: node.id,
            position: Vector3::new(node.x, node.y, node.z),
        });
    }

    let mesh_elements: HashMap<u64, &MeshElement> =
        mesh.elements.iter().map(|e| (e.id, e)).collect();

    let mut elements: Vec<Element> = Vec::new();
    let mut element_owner: HashMap<u64, usize> = HashMap::new();
    let mut domains: Vec<Domain> = Vec::with_capacity(config.domains.len());

    for (domain_idx, domain_config) in config.domains.iter().enumerate() {
        let name = &domain_config.name;
        let members = match mesh.element_sets.get(name) {
            Some(m) => m,
            None => {
                return Err(BesoError::Configuration(format!(
                    "Domain {name} has no element set in the mesh"
                )))
            }
        };

        let mut domain_elements: Vec<usize> = Vec::with_capacity(members.len());
        let mut skipped: usize = 0;
        for label in members {
            let mesh_element = match mesh_elements.get(label) {
                Some(e) => *e,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            if let Some(owner) = element_owner.get(label) {
                return Err(BesoError::Configuration(format!(
                    "Element {label} belongs to domains {} and {name}",
                    config.domains[*owner].name
                )));
            }
            let (kind, num_corners) = match classify(&mesh_element.element_type) {
                Some(c) => c,
                None => {
                    return Err(BesoError::Configuration(format!(
                        "Unsupported element type {} of element {label}",
                        mesh_element.element_type
                    )))
                }
            };
            if mesh_element.nodes.len() < num_corners {
                return Err(BesoError::Configuration(format!(
                    "Element {label} of type {} has only {} nodes",
                    mesh_element.element_type,
                    mesh_element.nodes.len()
                )));
            }

            let mut element_nodes: Vec<usize> = Vec::with_capacity(mesh_element.nodes.len());
            for node_label in &mesh_element.nodes {
                match node_index.get(node_label) {
                    Some(i) => element_nodes.push(*i),
                    None => {
                        return Err(BesoError::Configuration(format!(
                            "Element {label} references unknown node {node_label}"
                        )))
                    }
                }
            }

            let corners: Vec<Vector3<f64>> = element_nodes[..num_corners]
                .iter()
                .map(|&n| nodes[n].position)
                .collect();

            element_owner.insert(*label, domain_idx);
            domain_elements.push(elements.len());
            elements.push(Element {
                label: *label,
                mesh_type: mesh_element.element_type.to_lowercase(),
                kind,
                measure: compute_measure(kind, &corners),
                centroid: compute_centroid(&corners),
                size: compute_size(&corners),
                domain: domain_idx,
                nodes: element_nodes,
            });
        }
        if skipped > 0 {
            warn!("skipped {skipped} elements of set {name} missing in the mesh");
        }

        let has_shells = domain_elements
            .iter()
            .any(|&e| elements[e].kind == ElementKind::Shell);
        if has_shells && domain_config.thickness.is_empty() {
            return Err(BesoError::Configuration(format!(
                "Domain {name} contains shell elements but declares no thickness"
            )));
        }

        let states = domain_config
            .density
            .iter()
            .enumerate()
            .map(|(s, &density)| DomainState {
                density,
                thickness: domain_config.thickness.get(s).copied(),
            })
            .collect();

        domains.push(Domain {
            name: name.clone(),
            optimized: domain_config.optimized,
            states,
            failure_limits: domain_config.failure_limits.clone(),
            materials: domain_config.material.clone(),
            offset: domain_config.offset,
            orientation: domain_config.orientation.clone(),
            same_state: domain_config.same_state,
            elements: domain_elements,
        });
    }

    let mut node_sets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for tracked in &config.displacement_graph {
        let members = match mesh.node_sets.get(&tracked.node_set) {
            Some(m) => m,
            None => {
                return Err(BesoError::Configuration(format!(
                    "Tracked node set {} is not in the mesh",
                    tracked.node_set
                )))
            }
        };
        let indices = members
            .iter()
            .filter_map(|label| node_index.get(label).copied())
            .collect();
        node_sets.insert(tracked.node_set.clone(), indices);
    }

    for domain in &domains {
        let shells = domain
            .elements
            .iter()
            .filter(|&&e| elements[e].kind == ElementKind::Shell)
            .count();
        info!(
            "domain {}: {} elements ({} shells, {} solids), {} states",
            domain.name,
            domain.elements.len(),
            shells,
            domain.elements.len() - shells,
            domain.states.len()
        );
    }

    Ok(Model {
        nodes,
        elements,
        domains,
        node_sets,
    })
}

/// Creates the starting element states
///
/// # Arguments
/// * `model` - The model
/// * `continue_from` - The configured continuation source, if any
/// * `base_dir` - Directory relative state files are resolved against
pub fn initial_states(
    model: &Model,
    continue_from: Option<&ContinueFrom>,
    base_dir: &Path,
) -> Result<StateMap, BesoError> {
    match continue_from {
        None => Ok(StateMap::solid(model)),
        Some(ContinueFrom::State(state)) => {
            let mut states = StateMap::solid(model);
            for domain in &model.domains {
                let s = if *state > domain.highest_state() {
                    info!(
                        "elements from the domain {} were set to the highest state",
                        domain.name
                    );
                    domain.highest_state()
                } else {
                    *state
                };
                for &e in &domain.elements {
                    states.set(e, s);
                }
            }
            Ok(states)
        }
        Some(ContinueFrom::File(file)) => {
            let file = base_dir.join(file);
            let labelled = post_processor::read_state_file(&file)?;
            let mut states = StateMap::solid(model);
            let mut found: usize = 0;
            for (e, element) in model.elements.iter().enumerate() {
                if let Some(&s) = labelled.get(&element.label) {
                    let highest = model.domains[element.domain].highest_state();
                    states.set(e, s.min(highest));
                    found += 1;
                }
            }
            if found < model.elements.len() {
                warn!(
                    "{} elements are not in {} and start at the highest state",
                    model.elements.len() - found,
                    file.display()
                );
            }
            Ok(states)
        }
    }
}
