use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::config::FailureLimit;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub label: u64,
    pub position: Vector3<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Shell,
    Solid,
}

#[derive(Debug, Clone)]
pub struct Element {
    /// Element id in the mesh
    pub label: u64,
    /// Mesh element type, e.g. `tetra4` or `quad8`
    pub mesh_type: String,
    pub kind: ElementKind,
    /// Area for shells, volume for solids
    pub measure: f64,
    pub centroid: Vector3<f64>,
    /// Largest distance between two corner nodes
    pub size: f64,
    pub domain: usize,
    /// Indices into `Model::nodes`
    pub nodes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainState {
    pub density: f64,
    pub thickness: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub optimized: bool,
    /// Ordered from void (0) to solid
    pub states: Vec<DomainState>,
    /// Failure criteria per state, empty when the state has none
    pub failure_limits: Vec<Vec<FailureLimit>>,
    pub materials: Vec<String>,
    pub offset: f64,
    pub orientation: Vec<String>,
    pub same_state: bool,
    /// Indices into `Model::elements`
    pub elements: Vec<usize>,
}

impl Domain {
    pub fn highest_state(&self) -> usize {
        self.states.len() - 1
    }

    /// Mass of `element` when it holds `state`
    pub fn element_mass(&self, element: &Element, state: usize) -> f64 {
        let domain_state = &self.states[state];
        match element.kind {
            ElementKind::Solid => domain_state.density * element.measure,
            ElementKind::Shell => {
                domain_state.density * element.measure * domain_state.thickness.unwrap_or(0.0)
            }
        }
    }

    /// Volume-like measure of `element` at `state` (area times thickness for shells)
    pub fn element_volume(&self, element: &Element, state: usize) -> f64 {
        match element.kind {
            ElementKind::Solid => element.measure,
            ElementKind::Shell => element.measure * self.states[state].thickness.unwrap_or(0.0),
        }
    }

    pub fn limits_for(&self, state: usize) -> &[FailureLimit] {
        match self.failure_limits.get(state) {
            Some(limits) => limits,
            None => &[],
        }
    }

    pub fn has_failure_limits(&self) -> bool {
        self.failure_limits.iter().any(|l| !l.is_empty())
    }

    pub fn material(&self, state: usize) -> Option<&str> {
        self.materials.get(state).map(|m| m.as_str())
    }
}

/// Immutable description of the optimized model
#[derive(Debug, Clone)]
pub struct Model {
    pub nodes: Vec<Node>,
    pub elements: Vec<Element>,
    pub domains: Vec<Domain>,
    /// Node set name to node indices
    pub node_sets: BTreeMap<String, Vec<usize>>,
}

impl Model {
    /// Indices of elements in optimized domains, in domain declaration order
    pub fn optimized_elements(&self) -> Vec<usize> {
        self.domains
            .iter()
            .filter(|d| d.optimized)
            .flat_map(|d| d.elements.iter().copied())
            .collect()
    }

    pub fn optimized_domains(&self) -> Vec<usize> {
        (0..self.domains.len())
            .filter(|&d| self.domains[d].optimized)
            .collect()
    }

    pub fn element_mass(&self, element: usize, state: usize) -> f64 {
        let element = &self.elements[element];
        self.domains[element.domain].element_mass(element, state)
    }

    /// Total mass of the optimized domains for the given states
    pub fn mass(&self, states: &StateMap) -> f64 {
        self.domains
            .iter()
            .filter(|d| d.optimized)
            .flat_map(|d| d.elements.iter())
            .map(|&e| self.element_mass(e, states.get(e)))
            .sum()
    }

    /// Mass of the optimized domains with every element at its highest state
    pub fn full_mass(&self) -> f64 {
        self.mass_at(|d| d.highest_state())
    }

    /// Mass of the optimized domains with every element void
    pub fn void_mass(&self) -> f64 {
        self.mass_at(|_| 0)
    }

    fn mass_at(&self, state_of: impl Fn(&Domain) -> usize) -> f64 {
        self.domains
            .iter()
            .filter(|d| d.optimized)
            .map(|d| {
                let state = state_of(d);
                d.elements
                    .iter()
                    .map(|&e| d.element_mass(&self.elements[e], state))
                    .sum::<f64>()
            })
            .sum()
    }

    pub fn domain_of(&self, element: usize) -> &Domain {
        &self.domains[self.elements[element].domain]
    }

    pub fn has_failure_limits(&self) -> bool {
        self.domains.iter().any(|d| d.has_failure_limits())
    }
}

/// State index of every model element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMap {
    states: Vec<usize>,
}

impl StateMap {
    pub fn new(states: Vec<usize>) -> StateMap {
        StateMap { states }
    }

    /// Every element at the highest state of its domain
    pub fn solid(model: &Model) -> StateMap {
        StateMap {
            states: model
                .elements
                .iter()
                .map(|e| model.domains[e.domain].highest_state())
                .collect(),
        }
    }

    pub fn get(&self, element: usize) -> usize {
        self.states[element]
    }

    pub fn set(&mut self, element: usize, state: usize) {
        self.states[element] = state;
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.states
    }

    /// Checks that every element holds a state its domain declares
    pub fn is_valid_for(&self, model: &Model) -> bool {
        self.states.len() == model.elements.len()
            && model
                .elements
                .iter()
                .zip(&self.states)
                .all(|(e, s)| *s < model.domains[e.domain].states.len())
    }
}

/// Optimized-domain mass after every iteration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MassLedger {
    entries: Vec<f64>,
}

impl MassLedger {
    pub fn new(initial: f64) -> MassLedger {
        MassLedger {
            entries: vec![initial],
        }
    }

    pub fn push(&mut self, mass: f64) {
        self.entries.push(mass);
    }

    /// Applies a mass correction to the current entry
    pub fn correct_last(&mut self, delta: f64) {
        if let Some(last) = self.entries.last_mut() {
            *last += delta;
        }
    }

    pub fn last(&self) -> f64 {
        self.entries.last().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[f64] {
        &self.entries
    }
}

/// Sensitivity number of every model element
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityField {
    pub values: Vec<f64>,
}

impl SensitivityField {
    pub fn zeros(len: usize) -> SensitivityField {
        SensitivityField {
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Values recorded for one iteration, used by the log table and termination checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub mass: f64,
    pub energy_density_mean: Option<f64>,
    pub heat_flux_mean: Option<f64>,
    pub fi_mean: Option<f64>,
    pub fi_mean_without_void: Option<f64>,
    /// Per domain, None when the domain has no failure criteria
    pub fi_max: Vec<Option<f64>>,
    /// Elements with failure index >= 1, per domain
    pub fi_violated: Vec<usize>,
    pub displacements: Vec<f64>,
    pub buckling_factors: Vec<f64>,
}

impl IterationRecord {
    pub fn total_violated(&self) -> usize {
        self.fi_violated.iter().sum()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A row of unit cubes along x in one domain with the given densities
    pub fn bar_model(num_elements: usize, densities: &[f64], optimized: bool) -> Model {
        let nodes: Vec<Node> = (0..num_elements)
            .map(|i| Node {
                label: i as u64 + 1,
                position: Vector3::new(i as f64 + 0.5, 0.5, 0.5),
            })
            .collect();
        let elements: Vec<Element> = (0..num_elements)
            .map(|i| Element {
                label: i as u64 + 1,
                mesh_type: "hexa8".to_owned(),
                kind: ElementKind::Solid,
                measure: 1.0,
                centroid: Vector3::new(i as f64 + 0.5, 0.5, 0.5),
                size: 3f64.sqrt(),
                domain: 0,
                nodes: vec![i],
            })
            .collect();
        let domain = Domain {
            name: "design".to_owned(),
            optimized,
            states: densities
                .iter()
                .map(|&density| DomainState {
                    density,
                    thickness: None,
                })
                .collect(),
            failure_limits: Vec::new(),
            materials: Vec::new(),
            offset: 0.0,
            orientation: Vec::new(),
            same_state: false,
            elements: (0..num_elements).collect(),
        };
        Model {
            nodes,
            elements,
            domains: vec![domain],
            node_sets: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::bar_model;
    use super::*;

    #[test]
    fn mass_follows_states() {
        let model = bar_model(4, &[0.001, 1.0], true);
        let mut states = StateMap::solid(&model);
        assert!((model.mass(&states) - 4.0).abs() < 1e-12);
        states.set(2, 0);
        assert!((model.mass(&states) - 3.001).abs() < 1e-12);
        assert!((model.full_mass() - 4.0).abs() < 1e-12);
        assert!((model.void_mass() - 0.004).abs() < 1e-12);
    }

    #[test]
    fn non_optimized_domains_do_not_count() {
        let model = bar_model(4, &[0.001, 1.0], false);
        assert_eq!(model.mass(&StateMap::solid(&model)), 0.0);
        assert!(model.optimized_elements().is_empty());
    }

    #[test]
    fn shell_mass_uses_state_thickness() {
        let mut model = bar_model(1, &[0.5, 1.0], true);
        model.elements[0].kind = ElementKind::Shell;
        model.elements[0].measure = 2.0;
        model.domains[0].states[0].thickness = Some(0.1);
        model.domains[0].states[1].thickness = Some(0.3);
        assert!((model.element_mass(0, 0) - 0.1).abs() < 1e-12);
        assert!((model.element_mass(0, 1) - 0.6).abs() < 1e-12);
    }

    #[test]
    fn state_validity() {
        let model = bar_model(3, &[0.001, 0.5, 1.0], true);
        assert!(StateMap::new(vec![0, 1, 2]).is_valid_for(&model));
        assert!(!StateMap::new(vec![0, 3, 2]).is_valid_for(&model));
        assert!(!StateMap::new(vec![0, 1]).is_valid_for(&model));
    }

    #[test]
    fn ledger_correction_touches_only_current_entry() {
        let mut ledger = MassLedger::new(10.0);
        ledger.push(9.0);
        ledger.correct_last(0.25);
        assert_eq!(ledger.entries(), &[10.0, 9.25]);
    }
}
