use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::{
    datatypes::{Model, SensitivityField, StateMap},
    error::BesoError,
    sensitivity::SensitivityOutcome,
};

/// Everything the switching step reads
#[derive(Debug, Clone, Copy)]
pub struct SwitchingInput<'a> {
    pub model: &'a Model,
    pub states: &'a StateMap,
    pub field: &'a SensitivityField,
    pub outcome: &'a SensitivityOutcome,
    /// Ledger entry of the previous iteration
    pub mass_previous: f64,
    /// Full mass for absolute ratios, previous mass for relative ones
    pub mass_reference: f64,
    pub mass_goal: f64,
    pub addition_ratio: f64,
    pub removal_ratio: f64,
    /// Budget multiplier, 1 until the goal is first reached
    pub decay: f64,
    /// Carried mass excess to compensate, 0 when compensation is off
    pub mass_excess: f64,
}

#[derive(Debug)]
pub struct SwitchingOutcome {
    pub states: StateMap,
    /// Mass of the optimized domains for the new states
    pub mass: f64,
    pub added: f64,
    pub removed: f64,
    /// Realised minus intended mass change
    pub discrepancy: f64,
    /// Sensitivity of the last unit switched down
    pub removal_threshold: Option<f64>,
    /// Sensitivity of the last unit switched up by ranking
    pub addition_threshold: Option<f64>,
    pub warnings: Vec<BesoError>,
}

/// Elements that switch together, one per element or one per same-state domain
#[derive(Debug, Clone)]
struct Unit {
    elements: Vec<usize>,
    state: usize,
    highest: usize,
    sensitivity: f64,
    failing: bool,
}

impl Unit {
    /// Mass change of moving every element from `from` to `to`
    fn delta(&self, model: &Model, from: usize, to: usize) -> f64 {
        self.elements
            .iter()
            .map(|&e| model.element_mass(e, to) - model.element_mass(e, from))
            .sum()
    }
}

fn build_units(input: &SwitchingInput) -> Vec<Unit> {
    let model = input.model;
    let mut units = Vec::new();
    for domain in model.domains.iter().filter(|d| d.optimized) {
        if domain.elements.is_empty() {
            continue;
        }
        let highest = domain.highest_state();
        if domain.same_state {
            let state = domain
                .elements
                .iter()
                .map(|&e| input.states.get(e))
                .max()
                .unwrap_or(0);
            let mut weighted = 0.0;
            let mut total = 0.0;
            for &e in &domain.elements {
                let m = model.element_mass(e, input.states.get(e));
                weighted += input.field.values[e] * m;
                total += m;
            }
            let sensitivity = if total > 0.0 { weighted / total } else { 0.0 };
            units.push(Unit {
                elements: domain.elements.clone(),
                state,
                highest,
                sensitivity,
                failing: domain.elements.iter().any(|&e| input.outcome.is_failing(e)),
            });
        } else {
            for &e in &domain.elements {
                units.push(Unit {
                    elements: vec![e],
                    state: input.states.get(e),
                    highest,
                    sensitivity: input.field.values[e],
                    failing: input.outcome.is_failing(e),
                });
            }
        }
    }
    units
}

fn by_sensitivity(units: &[Unit], a: usize, b: usize) -> Ordering {
    units[a]
        .sensitivity
        .partial_cmp(&units[b].sensitivity)
        .unwrap_or(Ordering::Equal)
        .then(a.cmp(&b))
}

/// Switches element states one step toward void or solid by sensitivity ranking
///
/// Failing elements are raised first. The remaining budget is spent removing the
/// lowest ranked units and adding the highest ranked ones, with a unit switched
/// while doing so brings the moved mass closer to its budget.
///
/// # Arguments
/// * `input` - The current design and mass targets
///
/// # Returns
/// The new states with the realised mass bookkeeping
pub fn switch_states(input: &SwitchingInput) -> SwitchingOutcome {
    let model = input.model;
    let mut warnings = Vec::new();

    let void_mass = model.void_mass();
    let full_mass = model.full_mass();
    if input.mass_goal < void_mass || input.mass_goal > full_mass {
        let err = BesoError::Configuration(format!(
            "Mass goal {:.6} is outside the reachable range [{void_mass:.6}, {full_mass:.6}]",
            input.mass_goal
        ));
        warn!("{err}");
        warnings.push(err);
    }

    let mut units = build_units(input);
    let mut moved = vec![false; units.len()];
    let mut fail_added = 0.0;

    for (u, unit) in units.iter_mut().enumerate() {
        if unit.failing && unit.state < unit.highest {
            fail_added += unit.delta(model, unit.state, unit.state + 1);
            unit.state += 1;
            moved[u] = true;
        }
    }
    if fail_added > 0.0 {
        debug!("Failing elements added {fail_added:.6} mass");
    }

    let mut add_budget = input.addition_ratio * input.mass_reference * input.decay;
    let mut remove_budget = input.removal_ratio * input.mass_reference * input.decay;

    let cap = add_budget.max(remove_budget);
    let excess = input.mass_excess.clamp(-cap, cap);
    if excess > 0.0 {
        remove_budget += excess;
    } else {
        add_budget -= excess;
    }

    let net_removing = input.removal_ratio > input.addition_ratio;
    let expected = input.mass_previous + fail_added + add_budget - remove_budget;
    if net_removing && expected < input.mass_goal {
        remove_budget = (input.mass_previous + fail_added + add_budget - input.mass_goal).max(0.0);
    } else if !net_removing && expected > input.mass_goal {
        add_budget = (input.mass_goal - input.mass_previous - fail_added + remove_budget).max(0.0);
    }

    // removal, lowest sensitivity first
    let mut order: Vec<usize> = (0..units.len())
        .filter(|&u| !moved[u] && !units[u].failing && units[u].state > 0)
        .collect();
    order.sort_by(|&a, &b| by_sensitivity(&units, a, b));

    let mut removed = 0.0;
    let mut removal_threshold = None;
    for u in order {
        let delta = -units[u].delta(model, units[u].state, units[u].state - 1);
        if removed + delta / 2.0 >= remove_budget {
            break;
        }
        removed += delta;
        units[u].state -= 1;
        moved[u] = true;
        removal_threshold = Some(units[u].sensitivity);
    }

    // addition, highest sensitivity first
    let mut order: Vec<usize> = (0..units.len())
        .filter(|&u| !moved[u] && units[u].state < units[u].highest)
        .collect();
    order.sort_by(|&a, &b| by_sensitivity(&units, b, a));

    let mut added = 0.0;
    let mut addition_threshold = None;
    for u in order {
        let delta = units[u].delta(model, units[u].state, units[u].state + 1);
        if added + delta / 2.0 >= add_budget {
            break;
        }
        added += delta;
        units[u].state += 1;
        moved[u] = true;
        addition_threshold = Some(units[u].sensitivity);
    }

    let mut states = input.states.clone();
    for unit in &units {
        for &e in &unit.elements {
            states.set(e, unit.state);
        }
    }

    let mass = model.mass(&states);
    let intended = fail_added + add_budget - remove_budget;
    let discrepancy = (mass - input.mass_previous) - intended;
    debug!(
        "Switching removed {removed:.6}, added {:.6}, discrepancy {discrepancy:.6}",
        added + fail_added
    );

    SwitchingOutcome {
        states,
        mass,
        added: added + fail_added,
        removed,
        discrepancy,
        removal_threshold,
        addition_threshold,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::fixtures::bar_model;

    fn no_failures(n: usize) -> SensitivityOutcome {
        SensitivityOutcome {
            field: SensitivityField::zeros(n),
            fi_step_max: vec![None; n],
            fi_max: vec![None],
            fi_violated: vec![0],
            energy_density: None,
            heat_flux: None,
        }
    }

    fn ramp(n: usize) -> SensitivityField {
        SensitivityField {
            values: (0..n).map(|i| i as f64).collect(),
        }
    }

    fn input<'a>(
        model: &'a Model,
        states: &'a StateMap,
        field: &'a SensitivityField,
        outcome: &'a SensitivityOutcome,
        mass_goal: f64,
    ) -> SwitchingInput<'a> {
        let mass = model.mass(states);
        SwitchingInput {
            model,
            states,
            field,
            outcome,
            mass_previous: mass,
            mass_reference: mass,
            mass_goal,
            addition_ratio: 0.0,
            removal_ratio: 0.2,
            decay: 1.0,
            mass_excess: 0.0,
        }
    }

    #[test]
    fn removes_lowest_ranked_elements() {
        let model = bar_model(10, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let field = ramp(10);
        let outcome = no_failures(10);
        let result = switch_states(&input(&model, &states, &field, &outcome, 4.0));

        assert_eq!(&result.states.as_slice()[..3], &[0, 0, 1]);
        assert!((result.mass - model.mass(&result.states)).abs() < 1e-12);
        assert!((result.mass - (8.0 + 2e-6)).abs() < 1e-9);
        assert_eq!(result.removal_threshold, Some(1.0));
        assert!(result.warnings.is_empty());
        assert!(result.states.is_valid_for(&model));
    }

    #[test]
    fn removal_stops_at_goal() {
        let model = bar_model(10, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let field = ramp(10);
        let outcome = no_failures(10);
        let mut switching = input(&model, &states, &field, &outcome, 9.0);
        switching.removal_ratio = 0.5;
        let result = switch_states(&switching);
        assert_eq!(result.states.as_slice().iter().filter(|&&s| s == 0).count(), 1);
    }

    #[test]
    fn addition_takes_highest_ranked_voids() {
        let model = bar_model(6, &[1e-6, 1.0], true);
        let states = StateMap::new(vec![0, 0, 0, 0, 1, 1]);
        let field = ramp(6);
        let outcome = no_failures(6);
        let mut switching = input(&model, &states, &field, &outcome, 4.0);
        switching.mass_reference = 6.0;
        switching.removal_ratio = 0.0;
        switching.addition_ratio = 0.2;
        let result = switch_states(&switching);
        // budget 1.2 adds the best void element
        assert_eq!(result.states.as_slice(), &[0, 0, 0, 1, 1, 1]);
        assert_eq!(result.addition_threshold, Some(3.0));
    }

    #[test]
    fn failing_elements_are_raised_and_kept() {
        let model = bar_model(4, &[1e-6, 0.5, 1.0], true);
        let states = StateMap::new(vec![1, 2, 2, 2]);
        let field = ramp(4);
        let mut outcome = no_failures(4);
        outcome.fi_step_max[0] = Some(1.4);
        let result = switch_states(&input(&model, &states, &field, &outcome, 1.0));
        assert_eq!(result.states.get(0), 2);
        assert!(result.states.as_slice()[1..].iter().any(|&s| s < 2));
    }

    #[test]
    fn same_state_domain_switches_as_a_unit() {
        let mut model = bar_model(6, &[1e-6, 1.0], true);
        let mut web = model.domains[0].clone();
        web.name = "web".to_owned();
        web.same_state = true;
        web.elements = vec![0, 1];
        model.domains[0].elements = vec![2, 3, 4, 5];
        model.elements[0].domain = 1;
        model.elements[1].domain = 1;
        model.domains.push(web);

        let states = StateMap::solid(&model);
        let field = SensitivityField {
            values: vec![0.0, 0.2, 5.0, 6.0, 7.0, 8.0],
        };
        let outcome = no_failures(6);
        let mut switching = input(&model, &states, &field, &outcome, 1.0);
        switching.removal_ratio = 0.34;
        let result = switch_states(&switching);
        assert_eq!(result.states.as_slice(), &[0, 0, 1, 1, 1, 1]);
        assert!((result.removed - 2.0 * (1.0 - 1e-6)).abs() < 1e-12);
    }

    #[test]
    fn unreachable_goal_is_a_warning() {
        let model = bar_model(3, &[0.1, 1.0], true);
        let states = StateMap::solid(&model);
        let field = ramp(3);
        let outcome = no_failures(3);
        let result = switch_states(&input(&model, &states, &field, &outcome, 0.2));
        assert_eq!(result.warnings.len(), 1);
        assert!(!result.warnings[0].is_fatal());
    }

    #[test]
    fn positive_excess_removes_more() {
        let model = bar_model(10, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let field = ramp(10);
        let outcome = no_failures(10);
        let mut switching = input(&model, &states, &field, &outcome, 4.0);
        switching.mass_excess = 1.0;
        let result = switch_states(&switching);
        assert_eq!(result.states.as_slice().iter().filter(|&&s| s == 0).count(), 3);
    }
}
