use std::fmt::Display;

use tracing::{info, warn};

use crate::{
    config::{IterationsLimit, RatioType, RunConfig},
    datatypes::StateMap,
};

/// Iterations added on top of the expected number of mass steps
pub const AUTO_ITERATIONS_MARGIN: usize = 25;

/// Number of previous iterations compared in the convergence check
pub const CONVERGENCE_WINDOW: usize = 5;

/// Target mass of one iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MassGoal {
    pub goal: f64,
    /// Whether the goal is held because failure limits are violated
    pub healing: bool,
}

/// Plans the per-iteration mass goal and tracks when decay starts
#[derive(Debug, Clone)]
pub struct MassGoalPlanner {
    /// `mass_goal_ratio` times the full mass
    target: f64,
    full_mass: f64,
    net_removing: bool,
    net_ratio: f64,
    ratio_type: RatioType,
    violated_tolerance: usize,
    decay_coefficient: f64,
    previous_goal: Option<f64>,
    i_violated: usize,
    warned: bool,
}

impl MassGoalPlanner {
    pub fn new(config: &RunConfig, full_mass: f64) -> MassGoalPlanner {
        MassGoalPlanner {
            target: config.mass_goal_ratio * full_mass,
            full_mass,
            net_removing: config.is_net_removing(),
            net_ratio: (config.mass_removal_ratio - config.mass_addition_ratio).abs(),
            ratio_type: config.ratio_type,
            violated_tolerance: config.fi_violated_tolerance,
            decay_coefficient: config.decay_coefficient,
            previous_goal: None,
            i_violated: 0,
            warned: false,
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Iteration at which the goal was first reached or violations began, 0 if never
    pub fn i_violated(&self) -> usize {
        self.i_violated
    }

    /// Full mass for absolute ratios, previous mass for relative ones
    pub fn reference_mass(&self, previous_mass: f64) -> f64 {
        match self.ratio_type {
            RatioType::Absolute => self.full_mass,
            RatioType::Relative => previous_mass,
        }
    }

    /// Budget multiplier for the given iteration
    pub fn decay(&self, iteration: usize) -> f64 {
        if self.i_violated == 0 {
            return 1.0;
        }
        (self.decay_coefficient * iteration.saturating_sub(self.i_violated) as f64).exp()
    }

    fn mark_violated(&mut self, iteration: usize) {
        if self.i_violated == 0 {
            self.i_violated = iteration;
            info!("Switching budgets decay from iteration {iteration}");
        }
    }

    /// Computes the mass goal of `iteration`
    ///
    /// # Arguments
    /// * `iteration` - The iteration being planned, at least 1
    /// * `previous_mass` - The ledger entry of the previous iteration
    /// * `violations_initial` - Total failure violations of iteration 0
    /// * `violations_previous` - Total failure violations of the previous iteration
    pub fn plan(
        &mut self,
        iteration: usize,
        previous_mass: f64,
        violations_initial: usize,
        violations_previous: usize,
    ) -> MassGoal {
        let step = self.net_ratio * self.reference_mass(previous_mass);
        let mut healing = false;

        let goal = if self.net_removing {
            if violations_previous > violations_initial + self.violated_tolerance {
                healing = true;
                self.mark_violated(iteration);
                previous_mass.max(self.target)
            } else if previous_mass <= self.target {
                if self.previous_goal.is_none() && !self.warned {
                    warn!("Initial mass is already at or below the mass goal. Check mass_goal_ratio");
                    self.warned = true;
                }
                self.mark_violated(iteration);
                self.target
            } else {
                let advanced = previous_mass - step;
                let capped = match self.previous_goal {
                    Some(g) => advanced.min(g),
                    None => advanced,
                };
                capped.max(self.target)
            }
        } else if previous_mass < self.target {
            let advanced = previous_mass + step;
            let capped = match self.previous_goal {
                Some(g) => advanced.max(g),
                None => advanced,
            };
            capped.min(self.target)
        } else {
            if self.previous_goal.is_none() && !self.warned {
                warn!("Initial mass is already at or above the mass goal. Check mass_goal_ratio");
                self.warned = true;
            }
            self.mark_violated(iteration);
            self.target
        };

        self.previous_goal = Some(goal);
        MassGoal { goal, healing }
    }
}

/// Expected number of iterations to reach the goal plus a safety margin
///
/// # Arguments
/// * `initial_fraction` - Initial mass divided by the full mass
/// * `config` - The run configuration
pub fn auto_iterations_limit(initial_fraction: f64, config: &RunConfig) -> usize {
    let goal = config.mass_goal_ratio;
    let net = (config.mass_removal_ratio - config.mass_addition_ratio).abs();
    let removing = config.is_net_removing();

    let steps = match config.ratio_type {
        RatioType::Absolute => {
            let distance = if removing {
                initial_fraction - goal
            } else {
                goal - initial_fraction
            };
            (distance / net).max(0.0) as usize
        }
        RatioType::Relative => {
            let mut m = initial_fraction;
            let mut steps = 0;
            if removing {
                while m > goal {
                    m -= m * net;
                    steps += 1;
                }
            } else if m > 0.0 {
                while m < goal {
                    m += m * net;
                    steps += 1;
                }
            }
            steps
        }
    };
    steps + AUTO_ITERATIONS_MARGIN
}

/// Resolves the configured iteration limit
pub fn resolve_iterations_limit(initial_fraction: f64, config: &RunConfig) -> usize {
    match config.iterations_limit {
        IterationsLimit::Fixed(n) => n,
        IterationsLimit::Auto(_) => {
            let limit = auto_iterations_limit(initial_fraction, config);
            info!("iterations_limit set automatically to {limit}");
            limit
        }
    }
}

/// Terminal states of the iteration loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Converged,
    IterationLimit,
    Oscillating,
}

impl Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Converged => write!(f, "converged"),
            Termination::IterationLimit => write!(f, "iteration limit reached"),
            Termination::Oscillating => write!(f, "oscillating"),
        }
    }
}

/// Largest relative change of the last value against the previous window
pub fn relative_change(series: &[f64]) -> Option<f64> {
    if series.len() <= CONVERGENCE_WINDOW {
        return None;
    }
    let i = series.len() - 1;
    let last = series[i];
    (1..=CONVERGENCE_WINDOW)
        .map(|k| (last - series[i - k]).abs() / last.abs())
        .reduce(f64::max)
}

fn is_stalled(series: &[f64]) -> bool {
    match series {
        [.., a, b, c] => a == b && b == c,
        _ => false,
    }
}

/// Watches the tracked means and state history for termination
#[derive(Debug, Clone)]
pub struct ConvergenceController {
    tolerance: f64,
    iterations_limit: usize,
    fi_means: Vec<f64>,
    objective_means: Vec<f64>,
    states_last: Option<StateMap>,
    states_before_last: Option<StateMap>,
}

impl ConvergenceController {
    pub fn new(tolerance: f64, iterations_limit: usize) -> ConvergenceController {
        ConvergenceController {
            tolerance,
            iterations_limit,
            fi_means: Vec::new(),
            objective_means: Vec::new(),
            states_last: None,
            states_before_last: None,
        }
    }

    pub fn iterations_limit(&self) -> usize {
        self.iterations_limit
    }

    /// Records the tracked means of one iteration
    ///
    /// # Arguments
    /// * `fi_mean` - Failure index mean, when failure limits exist
    /// * `objective_mean` - Energy density mean or heat flux mean
    pub fn record(&mut self, fi_mean: Option<f64>, objective_mean: Option<f64>) {
        if let Some(v) = fi_mean {
            self.fi_means.push(v);
        }
        if let Some(v) = objective_mean {
            self.objective_means.push(v);
        }
    }

    fn series_converged(&self, series: &[f64], name: &str) -> bool {
        let change = match relative_change(series) {
            Some(c) => c,
            None => return false,
        };
        if change < self.tolerance {
            info!("Maximum relative change of {name} over the last {CONVERGENCE_WINDOW} iterations is {change:e}");
            return true;
        }
        if is_stalled(series) {
            info!("{name} is equal for the last three iterations");
            return true;
        }
        false
    }

    /// Checks the convergence and iteration limit after iteration `iteration`
    pub fn check(&self, iteration: usize) -> Option<Termination> {
        if self.series_converged(&self.fi_means, "FI mean")
            || self.series_converged(&self.objective_means, "objective mean")
        {
            return Some(Termination::Converged);
        }
        if iteration >= self.iterations_limit {
            return Some(Termination::IterationLimit);
        }
        None
    }

    /// Stores the starting design as the first entry of the state history
    pub fn seed(&mut self, initial: &StateMap) {
        self.states_before_last = None;
        self.states_last = Some(initial.clone());
    }

    /// Records the states after switching and reports a return to those of two iterations ago
    pub fn check_states(&mut self, states: &StateMap) -> Option<Termination> {
        if self.states_before_last.as_ref() == Some(states) {
            return Some(Termination::Oscillating);
        }
        self.states_before_last = self.states_last.take();
        self.states_last = Some(states.clone());
        None
    }
}
