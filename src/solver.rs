use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    config::{
        ArtifactKind, DisplacementComponent, OptimizationBase, ReferencePoints, ReferenceValue,
        RunConfig, SuperpositionGroup, TrackedDisplacement,
    },
    datatypes::{ElementKind, Model, StateMap},
    error::BesoError,
};

/// Environment variable carrying the worker thread count to the solver
pub const WORKER_THREADS_ENV: &str = "OMP_NUM_THREADS";
/// Fixed stem of the per-iteration solver files
pub const JOB_STEM: &str = "file";

/// Outcome of the solver process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    MalformedInput,
    MissingBinary,
    Unknown(Option<i32>),
}

impl ExitClass {
    /// Maps a process exit code onto the known solver diagnostics
    ///
    /// # Arguments
    /// * `code` - The exit code, None when the process was killed by a signal
    pub fn from_code(code: Option<i32>) -> ExitClass {
        match code {
            Some(0) => ExitClass::Success,
            Some(201) => ExitClass::MalformedInput,
            Some(1) => ExitClass::MissingBinary,
            other => ExitClass::Unknown(other),
        }
    }

    pub fn diagnostic(&self) -> String {
        match self {
            ExitClass::Success => "solver finished".to_owned(),
            ExitClass::MalformedInput => {
                "solver exit status 201. It cannot open the job file".to_owned()
            }
            ExitClass::MissingBinary => {
                "solver exit status 1. There might be an invalid solver_path".to_owned()
            }
            ExitClass::Unknown(Some(code)) => format!("solver exit status {code}"),
            ExitClass::Unknown(None) => "solver terminated by a signal".to_owned(),
        }
    }
}

impl Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExitClass::Success => "success",
            ExitClass::MalformedInput => "malformed input",
            ExitClass::MissingBinary => "missing binary",
            ExitClass::Unknown(_) => "unknown failure",
        };
        write!(f, "{}", name)
    }
}

/// Handle of one finished solver run
#[derive(Debug, Clone, PartialEq)]
pub struct SolverRun {
    pub iteration: usize,
    /// Path of the job files without extension, e.g. `run/file007`
    pub stem: PathBuf,
}

impl SolverRun {
    pub fn new(run_dir: &Path, iteration: usize) -> SolverRun {
        SolverRun {
            iteration,
            stem: run_dir.join(format!("{JOB_STEM}{iteration:03}")),
        }
    }

    pub fn artifact(&self, kind: ArtifactKind) -> PathBuf {
        let suffix = match kind {
            ArtifactKind::Job => ".job.json",
            ArtifactKind::Results => ".results.json",
            ArtifactKind::Output => ".out",
        };
        let mut path: OsString = self.stem.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Path of an export next to the solver files, e.g. `file007.csv`
    pub fn export_path(&self, suffix: &str) -> PathBuf {
        let mut path: OsString = self.stem.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    }
}

/// What the sensitivity engine needs from the solver results
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRequest {
    pub objective: OptimizationBase,
    pub reference_points: ReferencePoints,
    pub reference_value: ReferenceValue,
    pub steps_superposition: Vec<SuperpositionGroup>,
    pub displacement_graph: Vec<TrackedDisplacement>,
    pub failure_limits: bool,
    pub shells_as_composite: bool,
}

impl ResultRequest {
    pub fn from_config(config: &RunConfig) -> ResultRequest {
        ResultRequest {
            objective: config.optimization_base,
            reference_points: config.reference_points,
            reference_value: config.reference_value,
            steps_superposition: config.steps_superposition.clone(),
            displacement_graph: config.displacement_graph.clone(),
            failure_limits: config.has_failure_limits(),
            shells_as_composite: config.shells_as_composite,
        }
    }
}

/// Results of one load step, as written by the solver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawStep {
    /// Element label to integration point (or node) values
    pub energy_density: BTreeMap<u64, Vec<f64>>,
    pub heat_flux: BTreeMap<u64, Vec<f64>>,
    /// Element label to criterion name to point values
    pub failure_measures: BTreeMap<u64, BTreeMap<String, Vec<f64>>>,
    /// Node label to `[ux, uy, uz]`
    pub displacements: BTreeMap<u64, [f64; 3]>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawResults {
    pub steps: Vec<RawStep>,
    pub buckling_factors: Vec<f64>,
    /// Per eigenmode, element label to energy density
    pub eigen_energy_density: Vec<BTreeMap<u64, f64>>,
}

/// Quantities of one (possibly superposed) step, indexed by model element
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepData {
    pub energy_density: Option<Vec<f64>>,
    pub heat_flux: Option<Vec<f64>>,
    /// Failure indices of every criterion of the element's current state
    pub failure_indices: Option<Vec<Vec<f64>>>,
    /// Node index to displacement
    pub displacements: BTreeMap<usize, [f64; 3]>,
}

/// Imported solver results for one iteration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResults {
    pub steps: Vec<StepData>,
    pub buckling_factors: Vec<f64>,
    /// Per eigenmode, energy density per model element
    pub eigen_energy_density: Vec<Vec<f64>>,
    /// One value per tracked displacement entry
    pub tracked_displacements: Vec<f64>,
}

fn reduce(values: &[f64], reference_value: ReferenceValue) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match reference_value {
        ReferenceValue::Max => Some(values.iter().copied().fold(f64::MIN, f64::max)),
        ReferenceValue::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
    }
}

fn combine_values(
    group: &SuperpositionGroup,
    steps: &[RawStep],
    pick: impl Fn(&RawStep) -> &BTreeMap<u64, Vec<f64>>,
) -> BTreeMap<u64, Vec<f64>> {
    let mut combined: BTreeMap<u64, Vec<f64>> = BTreeMap::new();
    let first = pick(&steps[group[0].1 - 1]);
    for label in first.keys() {
        let mut values: Option<Vec<f64>> = None;
        for (factor, step) in group {
            let step_values = match pick(&steps[step - 1]).get(label) {
                Some(v) => v,
                None => {
                    values = None;
                    break;
                }
            };
            let acc = values.get_or_insert_with(|| vec![0.0; step_values.len()]);
            acc.truncate(step_values.len());
            for (a, v) in acc.iter_mut().zip(step_values) {
                *a += factor * v;
            }
        }
        if let Some(values) = values {
            combined.insert(*label, values);
        }
    }
    combined
}

/// Builds the superposed load cases, which replace the raw steps
fn superpose(
    steps: Vec<RawStep>,
    groups: &[SuperpositionGroup],
) -> Result<Vec<RawStep>, BesoError> {
    if groups.is_empty() {
        return Ok(steps);
    }
    let mut combined_steps: Vec<RawStep> = Vec::with_capacity(groups.len());
    for group in groups {
        if let Some((_, step)) = group.iter().find(|(_, step)| *step > steps.len()) {
            return Err(BesoError::DataMissing(format!(
                "steps_superposition refers to step {step} but the solver returned {} steps",
                steps.len()
            )));
        }

        let mut failure_measures: BTreeMap<u64, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
        for (label, criteria) in &steps[group[0].1 - 1].failure_measures {
            let mut per_criterion: BTreeMap<String, Vec<f64>> = BTreeMap::new();
            for criterion in criteria.keys() {
                let mut acc: Option<Vec<f64>> = None;
                for (factor, step) in group {
                    let values = steps[step - 1]
                        .failure_measures
                        .get(label)
                        .and_then(|c| c.get(criterion));
                    match values {
                        Some(values) => {
                            let a = acc.get_or_insert_with(|| vec![0.0; values.len()]);
                            a.truncate(values.len());
                            for (a, v) in a.iter_mut().zip(values) {
                                *a += factor * v;
                            }
                        }
                        None => {
                            acc = None;
                            break;
                        }
                    }
                }
                if let Some(values) = acc {
                    per_criterion.insert(criterion.clone(), values);
                }
            }
            failure_measures.insert(*label, per_criterion);
        }

        let mut displacements: BTreeMap<u64, [f64; 3]> = BTreeMap::new();
        for label in steps[group[0].1 - 1].displacements.keys() {
            let mut u = [0.0; 3];
            for (factor, step) in group {
                if let Some(d) = steps[step - 1].displacements.get(label) {
                    for k in 0..3 {
                        u[k] += factor * d[k];
                    }
                }
            }
            displacements.insert(*label, u);
        }

        combined_steps.push(RawStep {
            energy_density: combine_values(group, &steps, |s| &s.energy_density),
            heat_flux: combine_values(group, &steps, |s| &s.heat_flux),
            failure_measures,
            displacements,
        });
    }
    Ok(combined_steps)
}

/// Looks up and reduces one quantity for every model element
fn per_element(
    values: &BTreeMap<u64, Vec<f64>>,
    model: &Model,
    reference_value: ReferenceValue,
    quantity: &str,
) -> Result<Option<Vec<f64>>, BesoError> {
    if values.is_empty() {
        return Ok(None);
    }
    let mut reduced: Vec<f64> = Vec::with_capacity(model.elements.len());
    for element in &model.elements {
        match values.get(&element.label).and_then(|v| reduce(v, reference_value)) {
            Some(v) => reduced.push(v),
            None => {
                return Err(BesoError::DataMissing(format!(
                    "{quantity} of element {} is missing in solver results",
                    element.label
                )))
            }
        }
    }
    Ok(Some(reduced))
}

impl StepResults {
    /// Converts raw solver output into per-element quantities
    ///
    /// # Arguments
    /// * `raw` - The parsed results file
    /// * `model` - The model
    /// * `states` - The element states the solver ran with
    /// * `request` - What the objective needs
    ///
    /// # Returns
    /// The per-step, per-element quantities
    pub fn from_raw(
        raw: RawResults,
        model: &Model,
        states: &StateMap,
        request: &ResultRequest,
    ) -> Result<StepResults, BesoError> {
        let steps = superpose(raw.steps, &request.steps_superposition)?;
        let node_index: BTreeMap<u64, usize> = model
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.label, i))
            .collect();

        let mut step_data: Vec<StepData> = Vec::with_capacity(steps.len());
        for step in &steps {
            let energy_density = per_element(
                &step.energy_density,
                model,
                request.reference_value,
                "energy density",
            )?;
            let heat_flux =
                per_element(&step.heat_flux, model, request.reference_value, "heat flux")?;

            let failure_indices = if step.failure_measures.is_empty() {
                None
            } else {
                let mut indices: Vec<Vec<f64>> = Vec::with_capacity(model.elements.len());
                for (e, element) in model.elements.iter().enumerate() {
                    let domain = &model.domains[element.domain];
                    let measures = step.failure_measures.get(&element.label);
                    let limits = domain.limits_for(states.get(e));
                    let mut fi: Vec<f64> = Vec::with_capacity(limits.len());
                    for limit in limits {
                        let value = measures
                            .and_then(|m| m.get(&limit.criterion))
                            .and_then(|v| reduce(v, request.reference_value));
                        match value {
                            Some(v) => fi.push(v / limit.limit),
                            None => {
                                return Err(BesoError::DataMissing(format!(
                                    "failure measure {} of element {} is missing",
                                    limit.criterion, element.label
                                )))
                            }
                        }
                    }
                    indices.push(fi);
                }
                Some(indices)
            };

            let displacements = step
                .displacements
                .iter()
                .filter_map(|(label, u)| node_index.get(label).map(|&n| (n, *u)))
                .collect();

            step_data.push(StepData {
                energy_density,
                heat_flux,
                failure_indices,
                displacements,
            });
        }

        let mut eigen_energy_density: Vec<Vec<f64>> =
            Vec::with_capacity(raw.eigen_energy_density.len());
        for (mode, energies) in raw.eigen_energy_density.iter().enumerate() {
            let mut per_mode: Vec<f64> = Vec::with_capacity(model.elements.len());
            for element in &model.elements {
                match energies.get(&element.label) {
                    Some(v) => per_mode.push(*v),
                    None => {
                        return Err(BesoError::DataMissing(format!(
                            "eigenmode {} energy density of element {} is missing",
                            mode + 1,
                            element.label
                        )))
                    }
                }
            }
            eigen_energy_density.push(per_mode);
        }

        let tracked_displacements = request
            .displacement_graph
            .iter()
            .map(|tracked| tracked_displacement(tracked, model, &step_data))
            .collect();

        let results = StepResults {
            steps: step_data,
            buckling_factors: raw.buckling_factors,
            eigen_energy_density,
            tracked_displacements,
        };
        results.check_complete(request)?;
        Ok(results)
    }

    /// Fails when the results lack what the objective needs
    pub fn check_complete(&self, request: &ResultRequest) -> Result<(), BesoError> {
        let missing = match request.objective {
            OptimizationBase::Stiffness => {
                self.steps.is_empty() || self.steps.iter().any(|s| s.energy_density.is_none())
            }
            OptimizationBase::Heat => {
                self.steps.is_empty() || self.steps.iter().any(|s| s.heat_flux.is_none())
            }
            OptimizationBase::Buckling => {
                self.buckling_factors.is_empty() || self.eigen_energy_density.is_empty()
            }
            OptimizationBase::FailureIndex => false,
        };
        let missing_fi = request.failure_limits
            && (self.steps.is_empty() || self.steps.iter().any(|s| s.failure_indices.is_none()));
        if missing || missing_fi {
            return Err(BesoError::DataMissing(
                "solver results not found, check the solver for errors".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Largest displacement of a node set over all steps
fn tracked_displacement(tracked: &TrackedDisplacement, model: &Model, steps: &[StepData]) -> f64 {
    let nodes = match model.node_sets.get(&tracked.node_set) {
        Some(n) => n,
        None => return f64::NAN,
    };
    let mut max: Option<f64> = None;
    for step in steps {
        for node in nodes {
            if let Some(u) = step.displacements.get(node) {
                let value = match tracked.component {
                    DisplacementComponent::Ux => u[0].abs(),
                    DisplacementComponent::Uy => u[1].abs(),
                    DisplacementComponent::Uz => u[2].abs(),
                    DisplacementComponent::Total => {
                        (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt()
                    }
                };
                max = Some(max.map_or(value, |m| m.max(value)));
            }
        }
    }
    max.unwrap_or(f64::NAN)
}

/// Narrow contract to the external physics solver
pub trait SolverAdapter {
    /// Runs the solver for the given element states, blocking until it exits
    fn run(
        &mut self,
        model: &Model,
        states: &StateMap,
        iteration: usize,
    ) -> Result<SolverRun, BesoError>;

    /// Imports the physical quantities of a finished run
    fn import_results(
        &self,
        run: &SolverRun,
        model: &Model,
        states: &StateMap,
        request: &ResultRequest,
    ) -> Result<StepResults, BesoError>;

    /// Removes the transient files of a run except the retained kinds
    fn cleanup(&self, run: &SolverRun, retain: &[ArtifactKind]) -> Result<(), BesoError>;
}

#[derive(Debug, Serialize)]
struct JobElement<'a> {
    label: u64,
    #[serde(rename = "type")]
    mesh_type: &'a str,
    shell: bool,
    nodes: Vec<u64>,
    domain: &'a str,
    state: usize,
    density: f64,
    thickness: Option<f64>,
    offset: f64,
    orientation: Option<&'a str>,
    material: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    objective: OptimizationBase,
    reference_points: ReferencePoints,
    shells_as_composite: bool,
    node_sets: Vec<&'a str>,
    criteria: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct JobFile<'a> {
    iteration: usize,
    elements: Vec<JobElement<'a>>,
    request: JobRequest<'a>,
}

/// Runs an external solver binary through job and results files
#[derive(Debug, Clone)]
pub struct ExternalSolver {
    solver_path: PathBuf,
    run_dir: PathBuf,
    worker_count: usize,
    request: ResultRequest,
    /// Failure criteria the solver must evaluate
    criteria: Vec<String>,
}

impl ExternalSolver {
    pub fn new(config: &RunConfig) -> ExternalSolver {
        let worker_count = config.worker_count();
        info!("solver runs with {WORKER_THREADS_ENV}={worker_count}");
        ExternalSolver {
            solver_path: config.solver_path.clone(),
            run_dir: config.path.clone(),
            worker_count,
            request: ResultRequest::from_config(config),
            criteria: config.criteria(),
        }
    }

    /// Serializes the element states and domain tables into the job file
    ///
    /// # Arguments
    /// * `model` - The model
    /// * `states` - The current element states
    /// * `run` - The run the job belongs to
    pub fn write_job(
        &self,
        model: &Model,
        states: &StateMap,
        run: &SolverRun,
    ) -> Result<PathBuf, BesoError> {
        let elements = model
            .elements
            .iter()
            .enumerate()
            .map(|(e, element)| {
                let domain = &model.domains[element.domain];
                let state = states.get(e);
                JobElement {
                    label: element.label,
                    mesh_type: &element.mesh_type,
                    shell: element.kind == ElementKind::Shell,
                    nodes: element.nodes.iter().map(|&n| model.nodes[n].label).collect(),
                    domain: &domain.name,
                    state,
                    density: domain.states[state].density,
                    thickness: domain.states[state].thickness,
                    offset: domain.offset,
                    orientation: domain.orientation.get(state).map(|o| o.as_str()),
                    material: domain.material(state),
                }
            })
            .collect();

        let job = JobFile {
            iteration: run.iteration,
            elements,
            request: JobRequest {
                objective: self.request.objective,
                reference_points: self.request.reference_points,
                shells_as_composite: self.request.shells_as_composite,
                node_sets: model.node_sets.keys().map(|k| k.as_str()).collect(),
                criteria: self.criteria.iter().map(|c| c.as_str()).collect(),
            },
        };

        let path = run.artifact(ArtifactKind::Job);
        let file = File::create(&path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &job)?;
        Ok(path)
    }
}

impl SolverAdapter for ExternalSolver {
    fn run(
        &mut self,
        model: &Model,
        states: &StateMap,
        iteration: usize,
    ) -> Result<SolverRun, BesoError> {
        let run = SolverRun::new(&self.run_dir, iteration);
        self.write_job(model, states, &run)?;

        let output = File::create(run.artifact(ArtifactKind::Output))?;
        let job_name = run
            .stem
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_default();

        let spinner = ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner.set_message(format!("solving iteration {iteration}..."));

        let status = std::process::Command::new(&self.solver_path)
            .arg(job_name)
            .current_dir(&self.run_dir)
            .env(WORKER_THREADS_ENV, self.worker_count.to_string())
            .stdout(output.try_clone()?)
            .stderr(output)
            .status();
        spinner.finish_and_clear();

        let class = match status {
            Ok(status) => ExitClass::from_code(status.code()),
            Err(err) => {
                let class = if err.kind() == std::io::ErrorKind::NotFound {
                    ExitClass::MissingBinary
                } else {
                    ExitClass::Unknown(None)
                };
                error!("failed to start solver {}: {err}", self.solver_path.display());
                return Err(BesoError::Solver {
                    class,
                    message: format!("failed to start {}: {err}", self.solver_path.display()),
                });
            }
        };

        if class != ExitClass::Success {
            error!("{}", class.diagnostic());
            return Err(BesoError::Solver {
                class,
                message: class.diagnostic(),
            });
        }
        debug!("solver finished iteration {iteration}");
        Ok(run)
    }

    fn import_results(
        &self,
        run: &SolverRun,
        model: &Model,
        states: &StateMap,
        request: &ResultRequest,
    ) -> Result<StepResults, BesoError> {
        let path = run.artifact(ArtifactKind::Results);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(err) => {
                return Err(BesoError::DataMissing(format!(
                    "Unable to open solver results {}: {err}",
                    path.display()
                )))
            }
        };
        let raw: RawResults = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(err) => {
                return Err(BesoError::DataMissing(format!(
                    "Unreadable solver results {}: {err}",
                    path.display()
                )))
            }
        };
        StepResults::from_raw(raw, model, states, request)
    }

    fn cleanup(&self, run: &SolverRun, retain: &[ArtifactKind]) -> Result<(), BesoError> {
        for kind in [ArtifactKind::Job, ArtifactKind::Results, ArtifactKind::Output] {
            if retain.contains(&kind) {
                continue;
            }
            match std::fs::remove_file(run.artifact(kind)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("unable to remove {}: {err}", run.artifact(kind).display());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailureLimit;
    use crate::datatypes::fixtures::bar_model;

    fn request(objective: OptimizationBase) -> ResultRequest {
        ResultRequest {
            objective,
            reference_points: ReferencePoints::IntegrationPoints,
            reference_value: ReferenceValue::Max,
            steps_superposition: Vec::new(),
            displacement_graph: Vec::new(),
            failure_limits: false,
            shells_as_composite: false,
        }
    }

    fn energy_step(values: &[(u64, Vec<f64>)]) -> RawStep {
        RawStep {
            energy_density: values.iter().cloned().collect(),
            ..RawStep::default()
        }
    }

    #[test]
    fn exit_codes_are_classified() {
        assert_eq!(ExitClass::from_code(Some(0)), ExitClass::Success);
        assert_eq!(ExitClass::from_code(Some(201)), ExitClass::MalformedInput);
        assert_eq!(ExitClass::from_code(Some(1)), ExitClass::MissingBinary);
        assert_eq!(ExitClass::from_code(Some(7)), ExitClass::Unknown(Some(7)));
        assert_eq!(ExitClass::from_code(None), ExitClass::Unknown(None));
        assert!(ExitClass::Unknown(Some(7)).diagnostic().contains('7'));
    }

    #[test]
    fn artifacts_use_zero_padded_stem() {
        let run = SolverRun::new(Path::new("run"), 7);
        assert_eq!(run.artifact(ArtifactKind::Job), PathBuf::from("run/file007.job.json"));
        assert_eq!(run.export_path(".csv"), PathBuf::from("run/file007.csv"));
    }

    #[test]
    fn point_values_are_reduced() {
        let model = bar_model(2, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let raw = RawResults {
            steps: vec![energy_step(&[(1, vec![1.0, 3.0]), (2, vec![2.0, 2.0])])],
            ..RawResults::default()
        };

        let max = StepResults::from_raw(
            raw.clone(),
            &model,
            &states,
            &request(OptimizationBase::Stiffness),
        )
        .unwrap();
        assert_eq!(max.steps[0].energy_density, Some(vec![3.0, 2.0]));

        let mut average_request = request(OptimizationBase::Stiffness);
        average_request.reference_value = ReferenceValue::Average;
        let average = StepResults::from_raw(raw, &model, &states, &average_request).unwrap();
        assert_eq!(average.steps[0].energy_density, Some(vec![2.0, 2.0]));
    }

    #[test]
    fn missing_objective_data_is_fatal() {
        let model = bar_model(2, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let raw = RawResults {
            steps: vec![RawStep::default()],
            ..RawResults::default()
        };
        let err = StepResults::from_raw(raw, &model, &states, &request(OptimizationBase::Stiffness))
            .unwrap_err();
        assert!(matches!(err, BesoError::DataMissing(_)));

        let partial = RawResults {
            steps: vec![energy_step(&[(1, vec![1.0])])],
            ..RawResults::default()
        };
        let err =
            StepResults::from_raw(partial, &model, &states, &request(OptimizationBase::Stiffness))
                .unwrap_err();
        assert!(err.to_string().contains("element 2"));
    }

    #[test]
    fn superposed_steps_replace_raw_steps() {
        let model = bar_model(1, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let raw = RawResults {
            steps: vec![
                energy_step(&[(1, vec![1.0, 2.0])]),
                energy_step(&[(1, vec![10.0, 20.0])]),
            ],
            ..RawResults::default()
        };
        let mut req = request(OptimizationBase::Stiffness);
        req.steps_superposition = vec![vec![(1.0, 1), (0.5, 2)]];
        let results = StepResults::from_raw(raw.clone(), &model, &states, &req).unwrap();
        assert_eq!(results.steps.len(), 1);
        assert_eq!(results.steps[0].energy_density, Some(vec![12.0]));

        req.steps_superposition = vec![vec![(1.0, 3)]];
        assert!(StepResults::from_raw(raw, &model, &states, &req).is_err());
    }

    #[test]
    fn failure_indices_use_current_state_limits() {
        let mut model = bar_model(2, &[1e-6, 1.0], true);
        model.domains[0].failure_limits = vec![
            vec![],
            vec![FailureLimit {
                criterion: "von_mises".to_owned(),
                limit: 200.0,
            }],
        ];
        let states = StateMap::new(vec![1, 0]);
        let mut step = energy_step(&[(1, vec![1.0]), (2, vec![1.0])]);
        for label in [1, 2] {
            let mut criteria = BTreeMap::new();
            criteria.insert("von_mises".to_owned(), vec![100.0, 300.0]);
            step.failure_measures.insert(label, criteria);
        }
        let raw = RawResults {
            steps: vec![step],
            ..RawResults::default()
        };
        let mut req = request(OptimizationBase::Stiffness);
        req.failure_limits = true;
        let results = StepResults::from_raw(raw, &model, &states, &req).unwrap();
        let fi = results.steps[0].failure_indices.as_ref().unwrap();
        assert_eq!(fi[0], vec![1.5]);
        assert!(fi[1].is_empty());
    }

    #[test]
    fn missing_failure_measure_is_an_error() {
        let mut model = bar_model(2, &[1e-6, 1.0], true);
        model.domains[0].failure_limits = vec![
            vec![],
            vec![FailureLimit {
                criterion: "von_mises".to_owned(),
                limit: 200.0,
            }],
        ];
        let states = StateMap::new(vec![1, 1]);
        let mut step = energy_step(&[(1, vec![1.0]), (2, vec![1.0])]);
        let mut criteria = BTreeMap::new();
        criteria.insert("von_mises".to_owned(), vec![300.0]);
        step.failure_measures.insert(1, criteria);
        let raw = RawResults {
            steps: vec![step],
            ..RawResults::default()
        };
        let mut req = request(OptimizationBase::Stiffness);
        req.failure_limits = true;

        let err = StepResults::from_raw(raw, &model, &states, &req).unwrap_err();
        assert!(matches!(err, BesoError::DataMissing(_)));
        assert!(err.to_string().contains("von_mises of element 2"));
    }

    #[test]
    fn job_lists_configured_criteria() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{
            "domains": [
                { "name": "design", "optimized": true, "density": [1e-6, 1.0],
                  "failure_limits": [[], [{ "criterion": "von_mises", "limit": 250.0 }]] }
            ],
            "optimization_base": "failure_index"
        }"#;
        let mut config = RunConfig::from_json(json).unwrap();
        config.path = dir.path().to_path_buf();
        let solver = ExternalSolver::new(&config);

        let model = bar_model(2, &[1e-6, 1.0], true);
        let run = SolverRun::new(dir.path(), 0);
        let path = solver
            .write_job(&model, &StateMap::new(vec![1, 0]), &run)
            .unwrap();

        let job: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(job["request"]["criteria"], serde_json::json!(["von_mises"]));
        assert_eq!(job["elements"][1]["state"], 0);
    }

    #[test]
    fn cleanup_keeps_retained_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let run = SolverRun::new(dir.path(), 2);
        std::fs::write(run.artifact(ArtifactKind::Job), "{}").unwrap();
        std::fs::write(run.artifact(ArtifactKind::Results), "{}").unwrap();

        let mut config = RunConfig::default();
        config.path = dir.path().to_path_buf();
        let solver = ExternalSolver::new(&config);
        solver.cleanup(&run, &[ArtifactKind::Results]).unwrap();

        assert!(!run.artifact(ArtifactKind::Job).exists());
        assert!(run.artifact(ArtifactKind::Results).exists());
    }
}
