use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use tracing::{info, warn};

use crate::{
    config::{OptimizationBase, ResultFormat, RunConfig},
    convergence::{resolve_iterations_limit, ConvergenceController, MassGoalPlanner, Termination},
    datatypes::{IterationRecord, MassLedger, Model, SensitivityField, StateMap},
    error::BesoError,
    filters::{FilterHints, FilterPipeline},
    mesh,
    post_processor::{self, ResultingStates},
    sensitivity::{self, SensitivityOutcome},
    solver::{ResultRequest, SolverAdapter, SolverRun},
    switching::{switch_states, SwitchingInput},
    timing::{self, RunContext, RunLog},
};

/// How an optimization run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Converged,
    IterationLimit,
    Oscillating,
    Cancelled,
}

impl From<Termination> for RunOutcome {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Converged => RunOutcome::Converged,
            Termination::IterationLimit => RunOutcome::IterationLimit,
            Termination::Oscillating => RunOutcome::Oscillating,
        }
    }
}

/// Requests a stop between iterations from another thread
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> StopHandle {
        StopHandle::default()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// States and sensitivities of the latest solved iteration, kept for exports
struct Snapshot {
    states: StateMap,
    field: SensitivityField,
    outcome: SensitivityOutcome,
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.6e}"),
        None => "-".to_owned(),
    }
}

/// Drives the BESO loop over one model
pub struct Optimizer<S: SolverAdapter> {
    config: RunConfig,
    model: Model,
    solver: S,
    request: ResultRequest,
    states: StateMap,
    ledger: MassLedger,
    records: Vec<IterationRecord>,
    stop: StopHandle,
}

impl<S: SolverAdapter> Optimizer<S> {
    /// Sets up an optimizer with the configured starting states
    ///
    /// # Arguments
    /// * `config` - The validated run configuration
    /// * `model` - The model built from the mesh
    /// * `solver` - The solver the loop runs every iteration
    pub fn new(config: RunConfig, model: Model, solver: S) -> Result<Optimizer<S>, BesoError> {
        let states = mesh::initial_states(&model, config.continue_from.as_ref(), &config.path)?;
        let ledger = MassLedger::new(model.mass(&states));
        Ok(Optimizer {
            request: ResultRequest::from_config(&config),
            config,
            model,
            solver,
            states,
            ledger,
            records: Vec::new(),
            stop: StopHandle::new(),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn states(&self) -> &StateMap {
        &self.states
    }

    pub fn ledger(&self) -> &MassLedger {
        &self.ledger
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Runs iterations until convergence, the iteration limit, oscillation or a stop request
    pub fn run(&mut self) -> Result<RunOutcome, BesoError> {
        std::fs::create_dir_all(&self.config.path)?;
        let log = RunLog::create(&self.config.log_path())?;
        let mut ctx = RunContext::new(log, self.config.debug_mode);

        match self.iterate(&mut ctx) {
            Ok(outcome) => {
                let msg = format!(
                    "\nFinished: {outcome:?} after {} iterations\n",
                    self.records.len()
                );
                info!("{}", msg.trim());
                ctx.log(&msg)?;
                ctx.finish()?;
                Ok(outcome)
            }
            Err(err) => {
                if let Err(log_err) = ctx.log(&format!("\nERROR: {err}\n")) {
                    warn!("unable to write the error to the run log: {log_err}");
                }
                Err(err)
            }
        }
    }

    fn write_header(
        &self,
        ctx: &mut RunContext,
        planner: &MassGoalPlanner,
        controller: &ConvergenceController,
    ) -> Result<(), BesoError> {
        let mut msg = format!(
            "mesh_file               = {}\n",
            self.config.mesh_path().display()
        );
        msg += &format!(
            "solver_path             = {}\n",
            self.config.solver_path.display()
        );
        msg += &self.config.summary();
        msg += &format!(
            "\niterations_limit        = {}\n",
            controller.iterations_limit()
        );
        msg += &format!("mass_goal               = {:.6e}\n", planner.target());

        msg += "\ndomain order:\n";
        for (d, domain) in self.model.domains.iter().enumerate() {
            msg += &format!(
                "{d}) {}: {} elements, optimized {}\n",
                domain.name,
                domain.elements.len(),
                domain.optimized
            );
        }
        msg += &format!(
            "\ninitial optimization domains mass {:.6e}\n",
            self.ledger.last()
        );
        msg += "\n   i              mass  FI_violated          FI_mean  FI_mean_wo_void     objective_mean  FI_max per domain  displacements  buckling_factors\n";
        ctx.log(&msg)
    }

    fn log_record(&self, ctx: &mut RunContext, record: &IterationRecord) -> Result<(), BesoError> {
        let objective_mean = match self.config.optimization_base {
            OptimizationBase::Heat => record.heat_flux_mean,
            _ => record.energy_density_mean,
        };
        let fi_max: Vec<String> = record.fi_max.iter().map(|m| fmt_opt(*m)).collect();
        let row = format!(
            "{:4} {:17.6e} {:12} {:>16} {:>16} {:>18}  {:?}  {:?}  {:?}\n",
            record.iteration,
            record.mass,
            record.total_violated(),
            fmt_opt(record.fi_mean),
            fmt_opt(record.fi_mean_without_void),
            fmt_opt(objective_mean),
            fi_max,
            record.displacements,
            record.buckling_factors,
        );
        info!(
            "iteration {}: mass {:.6e}, objective mean {}",
            record.iteration,
            record.mass,
            fmt_opt(objective_mean)
        );
        ctx.log(&row)
    }

    /// Writes the configured result formats for the solved `iteration`
    fn export(
        &self,
        ctx: &mut RunContext,
        iteration: usize,
        snapshot: &Snapshot,
    ) -> Result<(), BesoError> {
        let start = Instant::now();
        let base = SolverRun::new(&self.config.path, iteration);
        for format in &self.config.save_resulting_format {
            match format {
                ResultFormat::Csv => post_processor::write_csv(
                    &base.export_path(".csv"),
                    &self.model,
                    &snapshot.states,
                    &snapshot.field,
                    &snapshot.outcome,
                )?,
                ResultFormat::Vtk => post_processor::write_vtk(
                    &base.export_path(".vtk"),
                    &self.model,
                    &snapshot.states,
                    &snapshot.field,
                    &snapshot.outcome,
                )?,
                ResultFormat::State => post_processor::write_state_file(
                    &base.export_path(".state.csv"),
                    &self.model,
                    &snapshot.states,
                )?,
            }
        }
        ctx.record_stage(timing::STAGE_EXPORT, start)
    }

    fn iterate(&mut self, ctx: &mut RunContext) -> Result<RunOutcome, BesoError> {
        let setup_start = Instant::now();
        let full_mass = self.model.full_mass();
        let initial_fraction = if full_mass > 0.0 {
            self.ledger.last() / full_mass
        } else {
            0.0
        };
        let iterations_limit = resolve_iterations_limit(initial_fraction, &self.config);
        let mut planner = MassGoalPlanner::new(&self.config, full_mass);
        let mut controller = ConvergenceController::new(self.config.tolerance, iterations_limit);
        controller.seed(&self.states);
        self.write_header(ctx, &planner, &controller)?;

        if self.model.has_failure_limits() {
            for domain in self.model.domains.iter().filter(|d| d.optimized) {
                if !domain.has_failure_limits() {
                    let msg = format!(
                        "domain {} has no failure criteria, its FI max is not reported",
                        domain.name
                    );
                    info!("{msg}");
                    ctx.log(&format!("{msg}\n"))?;
                }
            }
        }

        let pipeline = FilterPipeline::prepare(
            &self.model,
            &self.config.filter_list,
            FilterHints::from_config(&self.config),
        )?;
        let resulting = ResultingStates::create(&self.config.path, &self.model)?;
        resulting.append(0, &self.states)?;

        ctx.record_stage("Setup", setup_start)?;

        let mut previous_field: Option<SensitivityField> = None;
        let mut mass_excess = 0.0;
        let mut iteration: usize = 0;

        let (outcome, last_run, snapshot) = loop {
            ctx.set_iteration(iteration);

            let start = Instant::now();
            let run = self.solver.run(&self.model, &self.states, iteration)?;
            ctx.record_stage(timing::STAGE_SOLVER, start)?;

            let start = Instant::now();
            let results = self
                .solver
                .import_results(&run, &self.model, &self.states, &self.request)?;
            ctx.record_stage(timing::STAGE_IMPORT, start)?;

            let start = Instant::now();
            let outcome = sensitivity::compute(
                &self.model,
                &self.states,
                &results,
                self.config.optimization_base,
            )?;
            ctx.record_stage(timing::STAGE_SENSITIVITY, start)?;

            let start = Instant::now();
            let mut field = outcome.field.clone();
            pipeline.apply_sensitivity(&self.model, &mut field, &self.states)?;
            if self.config.sensitivity_averaging {
                sensitivity::average_with_previous(
                    &mut field,
                    &mut previous_field,
                    &self.model.optimized_elements(),
                );
            }
            ctx.record_stage(timing::STAGE_FILTERING, start)?;

            let means = sensitivity::objective_means(
                &self.model,
                &self.states,
                &outcome,
                self.ledger.last(),
            );
            let record = IterationRecord {
                iteration,
                mass: self.ledger.last(),
                energy_density_mean: means.energy_density_mean,
                heat_flux_mean: means.heat_flux_mean,
                fi_mean: means.fi_mean,
                fi_mean_without_void: means.fi_mean_without_void,
                fi_max: outcome.fi_max.clone(),
                fi_violated: outcome.fi_violated.clone(),
                displacements: results.tracked_displacements.clone(),
                buckling_factors: results.buckling_factors.clone(),
            };
            self.log_record(ctx, &record)?;
            self.records.push(record);

            let snapshot = Snapshot {
                states: self.states.clone(),
                field,
                outcome,
            };
            if self.config.is_export_iteration(iteration) {
                self.export(ctx, iteration, &snapshot)?;
            }

            let objective_mean = match self.config.optimization_base {
                OptimizationBase::Stiffness => means.energy_density_mean,
                OptimizationBase::Heat => means.heat_flux_mean,
                _ => None,
            };
            controller.record(means.fi_mean, objective_mean);
            if let Some(termination) = controller.check(iteration) {
                break (RunOutcome::from(termination), run, snapshot);
            }

            // next design
            iteration += 1;
            ctx.set_iteration(iteration);

            let first_violations = self.records[0].total_violated();
            let previous_violations = self.records[iteration - 1].total_violated();
            let goal = planner.plan(
                iteration,
                self.ledger.last(),
                first_violations,
                previous_violations,
            );
            if goal.healing {
                ctx.log(&format!(
                    "iteration {iteration}: failure limits violated, mass goal held at {:.6e}\n",
                    goal.goal
                ))?;
            }
            if planner.i_violated() == iteration {
                ctx.log(&format!(
                    "iteration {iteration}: switching budgets decay from here on\n"
                ))?;
            }

            let start = Instant::now();
            let switched = switch_states(&SwitchingInput {
                model: &self.model,
                states: &self.states,
                field: &snapshot.field,
                outcome: &snapshot.outcome,
                mass_previous: self.ledger.last(),
                mass_reference: planner.reference_mass(self.ledger.last()),
                mass_goal: goal.goal,
                addition_ratio: self.config.mass_addition_ratio,
                removal_ratio: self.config.mass_removal_ratio,
                decay: planner.decay(iteration),
                mass_excess,
            });
            for warning in &switched.warnings {
                ctx.log(&format!("WARNING: {warning}\n"))?;
            }
            info!(
                "iteration {iteration}: removed {:.6e} below sensitivity {}, added {:.6e} above {}",
                switched.removed,
                fmt_opt(switched.removal_threshold),
                switched.added,
                fmt_opt(switched.addition_threshold)
            );
            self.ledger.push(switched.mass);
            let discrepancy = switched.discrepancy;
            self.states = switched.states;
            ctx.record_stage(timing::STAGE_SWITCHING, start)?;

            let mut filter_delta = 0.0;
            if pipeline.has_state_filters() {
                let start = Instant::now();
                let filtered =
                    pipeline.apply_states(&self.model, &self.states, &snapshot.outcome);
                for e in self.model.optimized_elements() {
                    let (old, new) = (self.states.get(e), filtered.get(e));
                    if old != new {
                        filter_delta +=
                            self.model.element_mass(e, new) - self.model.element_mass(e, old);
                    }
                }
                self.ledger.correct_last(filter_delta);
                self.states = filtered;
                ctx.record_stage(timing::STAGE_STATE_FILTERING, start)?;
            }
            mass_excess = if self.config.compensate_state_filter {
                filter_delta + discrepancy
            } else {
                0.0
            };

            resulting.append(iteration, &self.states)?;

            if let Some(termination) = controller.check_states(&self.states) {
                let msg = format!(
                    "\nOSCILLATION: model turns back to iteration {}\n",
                    iteration.saturating_sub(2)
                );
                warn!("{}", msg.trim());
                ctx.log(&msg)?;
                break (RunOutcome::from(termination), run, snapshot);
            }

            if self.stop.is_stopped() {
                ctx.log("\nStopped on request\n")?;
                break (RunOutcome::Cancelled, run, snapshot);
            }

            let start = Instant::now();
            let retain: &[_] = if self.config.is_export_iteration(run.iteration) {
                self.config.save_solver_files.as_slice()
            } else {
                &[]
            };
            self.solver.cleanup(&run, retain)?;
            ctx.record_stage(timing::STAGE_CLEANUP, start)?;
            ctx.iteration_summary(iteration - 1)?;
        };

        // the last export pairs the solved states with their own sensitivities
        if !self.config.is_export_iteration(last_run.iteration) {
            self.export(ctx, last_run.iteration, &snapshot)?;
        }
        let start = Instant::now();
        self.solver.cleanup(&last_run, &self.config.save_solver_files)?;
        ctx.record_stage(timing::STAGE_CLEANUP, start)?;
        ctx.iteration_summary(last_run.iteration)?;

        Ok(outcome)
    }
}
