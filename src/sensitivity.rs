use crate::{
    config::OptimizationBase,
    datatypes::{Model, SensitivityField, StateMap},
    error::BesoError,
    solver::StepResults,
};

/// Eigenvalue distance from the lowest buckling factor within which a mode contributes
pub const BUCKLING_INFLUENCE_TOLERANCE: f64 = 0.2;

/// Per-iteration output of the sensitivity engine
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivityOutcome {
    pub field: SensitivityField,
    /// Worst failure index over steps and criteria, per element
    pub fi_step_max: Vec<Option<f64>>,
    /// Worst failure index per domain, None when the domain has no criteria
    pub fi_max: Vec<Option<f64>>,
    /// Elements with failure index >= 1, per domain
    pub fi_violated: Vec<usize>,
    /// Maximum energy density over steps, per element
    pub energy_density: Option<Vec<f64>>,
    /// Maximum absolute heat flux over steps, per element
    pub heat_flux: Option<Vec<f64>>,
}

impl SensitivityOutcome {
    /// Whether the element currently exceeds a failure limit
    pub fn is_failing(&self, element: usize) -> bool {
        self.fi_step_max[element].map_or(false, |fi| fi >= 1.0)
    }
}

fn max_over_steps(
    results: &StepResults,
    num_elements: usize,
    pick: impl Fn(&crate::solver::StepData) -> Option<&Vec<f64>>,
    magnitude: bool,
) -> Option<Vec<f64>> {
    let mut max: Option<Vec<f64>> = None;
    for step in &results.steps {
        let values = pick(step)?;
        let acc = max.get_or_insert_with(|| vec![f64::MIN; num_elements]);
        for (a, v) in acc.iter_mut().zip(values) {
            let v = if magnitude { v.abs() } else { *v };
            *a = a.max(v);
        }
    }
    max
}

/// Reduces the imported results to one sensitivity number per element
///
/// # Arguments
/// * `model` - The model
/// * `states` - The element states the solver ran with
/// * `results` - The imported solver results
/// * `objective` - The active optimization base
///
/// # Returns
/// The sensitivity field together with the failure bookkeeping
pub fn compute(
    model: &Model,
    states: &StateMap,
    results: &StepResults,
    objective: OptimizationBase,
) -> Result<SensitivityOutcome, BesoError> {
    let num_elements = model.elements.len();

    let mut fi_step_max: Vec<Option<f64>> = vec![None; num_elements];
    for step in &results.steps {
        if let Some(indices) = &step.failure_indices {
            for (worst, element_fi) in fi_step_max.iter_mut().zip(indices) {
                for fi in element_fi {
                    *worst = Some(worst.map_or(*fi, |w| w.max(*fi)));
                }
            }
        }
    }

    let mut fi_max: Vec<Option<f64>> = vec![None; model.domains.len()];
    let mut fi_violated: Vec<usize> = vec![0; model.domains.len()];
    for (d, domain) in model.domains.iter().enumerate() {
        for &e in &domain.elements {
            if let Some(fi) = fi_step_max[e] {
                fi_max[d] = Some(fi_max[d].map_or(fi, |m| m.max(fi)));
                if fi >= 1.0 {
                    fi_violated[d] += 1;
                }
            }
        }
    }

    let energy_density =
        max_over_steps(results, num_elements, |s| s.energy_density.as_ref(), false);
    let heat_flux = max_over_steps(results, num_elements, |s| s.heat_flux.as_ref(), true);

    let values: Vec<f64> = match objective {
        OptimizationBase::Stiffness => match &energy_density {
            Some(ed) => ed.clone(),
            None => {
                return Err(BesoError::DataMissing(
                    "no energy density for stiffness sensitivities".to_owned(),
                ))
            }
        },
        OptimizationBase::Heat => {
            let flux = match &heat_flux {
                Some(f) => f,
                None => {
                    return Err(BesoError::DataMissing(
                        "no heat flux for heat sensitivities".to_owned(),
                    ))
                }
            };
            model
                .elements
                .iter()
                .enumerate()
                .map(|(e, element)| {
                    let volume =
                        model.domains[element.domain].element_volume(element, states.get(e));
                    if volume > 0.0 {
                        flux[e] / volume
                    } else {
                        0.0
                    }
                })
                .collect()
        }
        OptimizationBase::FailureIndex => model
            .elements
            .iter()
            .enumerate()
            .map(|(e, element)| {
                let density = model.domains[element.domain].states[states.get(e)].density;
                fi_step_max[e].unwrap_or(0.0) / density
            })
            .collect(),
        OptimizationBase::Buckling => buckling_sensitivity(results, num_elements)?,
    };

    Ok(SensitivityOutcome {
        field: SensitivityField { values },
        fi_step_max,
        fi_max,
        fi_violated,
        energy_density,
        heat_flux,
    })
}

/// Combines eigenmode energy densities of near-simultaneous buckling modes
fn buckling_sensitivity(results: &StepResults, num_elements: usize) -> Result<Vec<f64>, BesoError> {
    let factors = &results.buckling_factors;
    let modes = factors.len().min(results.eigen_energy_density.len());
    if modes == 0 {
        return Err(BesoError::DataMissing(
            "no buckling factors or eigenmode energy densities".to_owned(),
        ));
    }

    let denominators: Vec<f64> = results.eigen_energy_density[..modes]
        .iter()
        .map(|energies| {
            let max = energies.iter().copied().fold(0.0, f64::max);
            if max > 0.0 {
                max
            } else {
                1.0
            }
        })
        .collect();

    let mut weights: Vec<(usize, f64)> = Vec::new();
    for k in 1..modes {
        let difference = factors[k] - factors[0];
        if difference < BUCKLING_INFLUENCE_TOLERANCE {
            weights.push((k, difference / BUCKLING_INFLUENCE_TOLERANCE));
        }
    }

    let values = (0..num_elements)
        .map(|e| {
            let mut s = results.eigen_energy_density[0][e] / denominators[0];
            for &(k, w) in &weights {
                s += results.eigen_energy_density[k][e] / denominators[k] * w;
            }
            s
        })
        .collect();
    Ok(values)
}

/// Averages the sensitivities of optimized elements with the previous iteration
///
/// # Arguments
/// * `field` - The filtered field of this iteration, averaged in place
/// * `previous` - The field kept from the previous iteration, replaced by this one
/// * `elements` - The optimized elements
pub fn average_with_previous(
    field: &mut SensitivityField,
    previous: &mut Option<SensitivityField>,
    elements: &[usize],
) {
    if let Some(old) = previous.as_ref() {
        for &e in elements {
            field.values[e] = (field.values[e] + old.values[e]) / 2.0;
        }
    }
    *previous = Some(field.clone());
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObjectiveMeans {
    pub energy_density_mean: Option<f64>,
    pub heat_flux_mean: Option<f64>,
    pub fi_mean: Option<f64>,
    pub fi_mean_without_void: Option<f64>,
}

/// Mass weighted means over the optimized domains
///
/// # Arguments
/// * `model` - The model
/// * `states` - The element states the solver ran with
/// * `outcome` - The sensitivity outcome of this iteration
/// * `mass` - The ledger entry of this iteration
pub fn objective_means(
    model: &Model,
    states: &StateMap,
    outcome: &SensitivityOutcome,
    mass: f64,
) -> ObjectiveMeans {
    let failure = model.has_failure_limits();
    let mut fi_sum = 0.0;
    let mut fi_sum_without_void = 0.0;
    let mut mass_without_void = 0.0;
    let mut energy_sum = 0.0;
    let mut heat_sum = 0.0;

    for e in model.optimized_elements() {
        let state = states.get(e);
        let element_mass = model.element_mass(e, state);
        if failure {
            let fi = outcome.fi_step_max[e].unwrap_or(0.0);
            fi_sum += fi * element_mass;
            if state != 0 {
                fi_sum_without_void += fi * element_mass;
                mass_without_void += element_mass;
            }
        }
        if let Some(ed) = &outcome.energy_density {
            energy_sum += ed[e] * element_mass;
        }
        if let Some(flux) = &outcome.heat_flux {
            heat_sum += flux[e] * element_mass;
        }
    }

    let mean = |sum: f64| if mass > 0.0 { Some(sum / mass) } else { None };
    ObjectiveMeans {
        energy_density_mean: outcome.energy_density.as_ref().and_then(|_| mean(energy_sum)),
        heat_flux_mean: outcome.heat_flux.as_ref().and_then(|_| mean(heat_sum)),
        fi_mean: if failure { mean(fi_sum) } else { None },
        fi_mean_without_void: if failure && mass_without_void > 0.0 {
            Some(fi_sum_without_void / mass_without_void)
        } else {
            None
        },
    }
}
