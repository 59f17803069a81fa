use std::{
    collections::BTreeMap,
    fs::File,
    io::Write,
    path::Path,
    time::{Duration, Instant},
};

use tracing::info;

use crate::error::BesoError;

pub const STAGE_SOLVER: &str = "Solver Execution";
pub const STAGE_IMPORT: &str = "Result Import";
pub const STAGE_SENSITIVITY: &str = "Sensitivity";
pub const STAGE_FILTERING: &str = "Sensitivity Filtering";
pub const STAGE_SWITCHING: &str = "Element Switching";
pub const STAGE_STATE_FILTERING: &str = "State Filtering";
pub const STAGE_EXPORT: &str = "Result Export";
pub const STAGE_CLEANUP: &str = "Cleanup";

/// Share of the run above which a stage is flagged in the performance summary
const SIGNIFICANT_SHARE: f64 = 10.0;

/// Plain-text log of a run, appended as the run progresses
#[derive(Debug)]
pub struct RunLog {
    file: File,
}

impl RunLog {
    /// Starts a fresh log, truncating any previous one
    pub fn create(path: &Path) -> Result<RunLog, BesoError> {
        Ok(RunLog {
            file: File::create(path)?,
        })
    }

    pub fn write(&mut self, msg: &str) -> Result<(), BesoError> {
        self.file.write_all(msg.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

/// Stage durations per iteration and over the whole run
#[derive(Debug, Clone, Default)]
pub struct StageTimer {
    per_iteration: BTreeMap<usize, BTreeMap<String, Duration>>,
    totals: BTreeMap<String, Duration>,
}

impl StageTimer {
    pub fn record(&mut self, stage: &str, iteration: Option<usize>, duration: Duration) {
        if let Some(i) = iteration {
            *self
                .per_iteration
                .entry(i)
                .or_default()
                .entry(stage.to_owned())
                .or_default() += duration;
        }
        *self.totals.entry(stage.to_owned()).or_default() += duration;
    }

    pub fn iteration(&self, iteration: usize) -> Option<&BTreeMap<String, Duration>> {
        self.per_iteration.get(&iteration)
    }

    pub fn total(&self, stage: &str) -> Option<Duration> {
        self.totals.get(stage).copied()
    }

    pub fn iterations_timed(&self) -> usize {
        self.per_iteration.len()
    }

    /// Run-wide totals, longest first
    fn sorted_totals(&self) -> Vec<(&str, Duration)> {
        let mut sorted: Vec<(&str, Duration)> =
            self.totals.iter().map(|(s, d)| (s.as_str(), *d)).collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        sorted
    }
}

/// Formats seconds as `h min s`
pub fn format_hms(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    let h = (seconds / 3600.0) as u64;
    let min = ((seconds % 3600.0) / 60.0) as u64;
    let s = (seconds % 60.0).round() as u64;
    format!("{h} h {min} min {s} s")
}

fn percent(part: Duration, whole: Duration) -> f64 {
    if whole.is_zero() {
        return 0.0;
    }
    part.as_secs_f64() / whole.as_secs_f64() * 100.0
}

/// Log, timing and iteration marker shared by every stage of a run
#[derive(Debug)]
pub struct RunContext {
    log: RunLog,
    timer: StageTimer,
    debug: bool,
    iteration: Option<usize>,
    started: Instant,
}

impl RunContext {
    pub fn new(log: RunLog, debug: bool) -> RunContext {
        RunContext {
            log,
            timer: StageTimer::default(),
            debug,
            iteration: None,
            started: Instant::now(),
        }
    }

    pub fn set_iteration(&mut self, iteration: usize) {
        self.iteration = Some(iteration);
    }

    /// Appends a message to the run log
    pub fn log(&mut self, msg: &str) -> Result<(), BesoError> {
        self.log.write(msg)
    }

    /// Records the time elapsed since `start` for `stage`
    pub fn record_stage(&mut self, stage: &str, start: Instant) -> Result<(), BesoError> {
        self.record_duration(stage, start.elapsed())
    }

    pub fn record_duration(&mut self, stage: &str, duration: Duration) -> Result<(), BesoError> {
        self.timer.record(stage, self.iteration, duration);
        if !self.debug {
            return Ok(());
        }
        let prefix = match self.iteration {
            Some(i) => format!("[DEBUG][Iter {i}]"),
            None => "[DEBUG]".to_owned(),
        };
        let msg = format!(
            "{prefix} Step '{stage}' took: {:.4} sec",
            duration.as_secs_f64()
        );
        info!("{msg}");
        self.log.write(&format!("{msg}\n"))
    }

    /// Writes the stage breakdown of one iteration
    pub fn iteration_summary(&mut self, iteration: usize) -> Result<(), BesoError> {
        if !self.debug {
            return Ok(());
        }
        let stages = match self.timer.iteration(iteration) {
            Some(s) => s,
            None => return Ok(()),
        };
        let total: Duration = stages.values().sum();

        let mut msg = format!("\n[DEBUG] === Iteration {iteration} Time Summary ===\n");
        for (stage, duration) in stages {
            msg += &format!(
                "[DEBUG] - {stage}: {:.4} sec ({:.1}%)\n",
                duration.as_secs_f64(),
                percent(*duration, total)
            );
        }
        msg += &format!(
            "[DEBUG] Total iteration time: {:.4} sec\n",
            total.as_secs_f64()
        );
        info!("{}", msg.trim_end());
        self.log.write(&msg)
    }

    /// Writes the run-wide breakdown with tuning hints
    pub fn performance_summary(&mut self) -> Result<(), BesoError> {
        if !self.debug {
            return Ok(());
        }
        let sorted = self.timer.sorted_totals();
        let total: Duration = sorted.iter().map(|(_, d)| *d).sum();
        if total.is_zero() {
            return Ok(());
        }

        let mut msg = "\n[DEBUG] ====== Performance Summary ======\n".to_owned();
        msg += &format!(
            "[DEBUG] Total Iterations: {}\n",
            self.timer.iterations_timed()
        );
        for (stage, duration) in &sorted {
            let share = percent(*duration, total);
            let flag = if share > SIGNIFICANT_SHARE {
                " [SIGNIFICANT]"
            } else {
                ""
            };
            msg += &format!(
                "[DEBUG] - {stage}: {:.4} sec ({share:.1}%){flag}\n",
                duration.as_secs_f64()
            );
        }

        msg += "[DEBUG] Performance Optimization Hints:\n";
        for (stage, duration) in sorted.iter().take(3) {
            if stage.contains("Filtering") && duration.as_secs_f64() > 10.0 {
                msg += "[DEBUG] - Consider enabling use_vectorized_filters and use_kdtree for faster filtering\n";
            } else if *stage == STAGE_SOLVER && duration.as_secs_f64() > 60.0 {
                msg += "[DEBUG] - Consider increasing cpu_cores for faster solver runs\n";
            }
        }
        let iterations = self.timer.iterations_timed();
        if iterations > 50 {
            msg += &format!(
                "[DEBUG] - Large number of iterations ({iterations}). Consider adjusting mass_addition_ratio and mass_removal_ratio for faster convergence\n"
            );
        }

        info!("{}", msg.trim_end());
        self.log.write(&msg)
    }

    /// Writes the closing lines with the solver and total run times
    pub fn finish(&mut self) -> Result<(), BesoError> {
        self.performance_summary()?;
        let total = format_hms(self.started.elapsed());
        let solver = format_hms(self.timer.total(STAGE_SOLVER).unwrap_or_default());
        info!("Total time: {total}, solver time: {solver}");
        self.log.write(&format!("\nSolver time  {solver}\nTotal time   {total}\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_per_iteration_and_total() {
        let mut timer = StageTimer::default();
        timer.record(STAGE_SOLVER, Some(1), Duration::from_millis(300));
        timer.record(STAGE_SOLVER, Some(2), Duration::from_millis(200));
        timer.record(STAGE_FILTERING, Some(2), Duration::from_millis(50));
        timer.record("Setup", None, Duration::from_millis(10));

        assert_eq!(timer.total(STAGE_SOLVER), Some(Duration::from_millis(500)));
        assert_eq!(timer.iterations_timed(), 2);
        assert_eq!(timer.iteration(2).map(|s| s.len()), Some(2));
        assert_eq!(timer.sorted_totals()[0].0, STAGE_SOLVER);
    }

    #[test]
    fn finish_reports_solver_and_total_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut ctx = RunContext::new(RunLog::create(&path).unwrap(), false);
        ctx.set_iteration(0);
        ctx.record_duration(STAGE_SOLVER, Duration::from_secs(61)).unwrap();
        ctx.finish().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Solver time  0 h 1 min 1 s"));
        assert!(text.contains("Total time   0 h 0 min 0 s"));
    }

    #[test]
    fn hms_format() {
        assert_eq!(format_hms(Duration::from_secs(3725)), "1 h 2 min 5 s");
        assert_eq!(format_hms(Duration::from_secs(59)), "0 h 0 min 59 s");
    }

    #[test]
    fn debug_output_goes_to_the_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut quiet = RunContext::new(RunLog::create(&path).unwrap(), false);
        quiet.set_iteration(1);
        quiet
            .record_duration(STAGE_SOLVER, Duration::from_secs(2))
            .unwrap();
        quiet.iteration_summary(1).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert_eq!(quiet.timer.total(STAGE_SOLVER), Some(Duration::from_secs(2)));

        let path = dir.path().join("debug.log");
        let mut verbose = RunContext::new(RunLog::create(&path).unwrap(), true);
        verbose.set_iteration(1);
        verbose
            .record_duration(STAGE_SOLVER, Duration::from_secs(3))
            .unwrap();
        verbose
            .record_duration(STAGE_FILTERING, Duration::from_secs(1))
            .unwrap();
        verbose.iteration_summary(1).unwrap();
        verbose.performance_summary().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("[DEBUG][Iter 1] Step 'Solver Execution' took: 3.0000 sec"));
        assert!(text.contains("Iteration 1 Time Summary"));
        assert!(text.contains("Solver Execution: 3.0000 sec (75.0%) [SIGNIFICANT]"));
    }
}
