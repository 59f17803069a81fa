use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BesoError;

/// Marker for the `"auto"` keyword accepted by some numeric parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Auto {
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationBase {
    Stiffness,
    Heat,
    Buckling,
    FailureIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoints {
    IntegrationPoints,
    Nodes,
}

/// Reduction applied to the integration point values of one element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceValue {
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioType {
    Relative,
    Absolute,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IterationsLimit {
    Auto(Auto),
    Fixed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterRange {
    Auto(Auto),
    Distance(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphologyOperator {
    Erode,
    Dilate,
    Open,
    Close,
    OpenClose,
    CloseOpen,
    Combine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphologyTarget {
    Sensitivity,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum FilterKind {
    None,
    Simple,
    Casting {
        direction: [f64; 3],
    },
    OverNodes,
    OverPoints,
    Morphology {
        operator: MorphologyOperator,
        target: MorphologyTarget,
    },
}

/// One entry of the ordered filter list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub range: FilterRange,
    /// Names of the targeted domains. Empty targets every optimized domain.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl FilterSpec {
    /// Whether the filter does anything at all
    pub fn is_active(&self) -> bool {
        if self.kind == FilterKind::None {
            return false;
        }
        !matches!(self.range, FilterRange::Distance(d) if d <= 0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureLimit {
    pub criterion: String,
    pub limit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainConfig {
    /// Element set name in the mesh
    pub name: String,
    pub optimized: bool,
    /// Density per state, ordered from void to solid
    pub density: Vec<f64>,
    #[serde(default)]
    pub thickness: Vec<f64>,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub orientation: Vec<String>,
    #[serde(default)]
    pub failure_limits: Vec<Vec<FailureLimit>>,
    #[serde(default)]
    pub material: Vec<String>,
    #[serde(default)]
    pub same_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplacementComponent {
    Ux,
    Uy,
    Uz,
    Total,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackedDisplacement {
    pub node_set: String,
    pub component: DisplacementComponent,
}

/// Load steps combined into one: `(factor, 1-based step number)` pairs
pub type SuperpositionGroup = Vec<(f64, usize)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Job,
    Results,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultFormat {
    Csv,
    Vtk,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ContinueFrom {
    /// Every element starts at this state index, clamped per domain
    State(usize),
    /// Element states are read from a state file written by a previous run
    File(PathBuf),
}

/// All parameters of an optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub path: PathBuf,
    pub mesh_file: PathBuf,
    pub solver_path: PathBuf,
    pub domains: Vec<DomainConfig>,
    pub mass_goal_ratio: f64,
    pub filter_list: Vec<FilterSpec>,
    pub optimization_base: OptimizationBase,
    pub cpu_cores: usize,
    pub fi_violated_tolerance: usize,
    pub decay_coefficient: f64,
    pub shells_as_composite: bool,
    pub reference_points: ReferencePoints,
    pub reference_value: ReferenceValue,
    pub sensitivity_averaging: bool,
    pub mass_addition_ratio: f64,
    pub mass_removal_ratio: f64,
    pub ratio_type: RatioType,
    pub compensate_state_filter: bool,
    pub steps_superposition: Vec<SuperpositionGroup>,
    pub iterations_limit: IterationsLimit,
    pub tolerance: f64,
    pub displacement_graph: Vec<TrackedDisplacement>,
    pub save_iteration_results: usize,
    pub save_solver_files: Vec<ArtifactKind>,
    pub save_resulting_format: Vec<ResultFormat>,
    pub continue_from: Option<ContinueFrom>,
    pub debug_mode: bool,
    pub use_vectorized_filters: bool,
    pub use_kdtree: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            path: PathBuf::from("."),
            mesh_file: PathBuf::from("mesh.json"),
            solver_path: PathBuf::from("ccx"),
            domains: Vec::new(),
            mass_goal_ratio: 0.4,
            filter_list: vec![FilterSpec {
                kind: FilterKind::Simple,
                range: FilterRange::Auto(Auto::Auto),
                domains: Vec::new(),
            }],
            optimization_base: OptimizationBase::Stiffness,
            cpu_cores: 0,
            fi_violated_tolerance: 1,
            decay_coefficient: -0.2,
            shells_as_composite: false,
            reference_points: ReferencePoints::IntegrationPoints,
            reference_value: ReferenceValue::Max,
            sensitivity_averaging: false,
            mass_addition_ratio: 0.01,
            mass_removal_ratio: 0.03,
            ratio_type: RatioType::Relative,
            compensate_state_filter: false,
            steps_superposition: Vec::new(),
            iterations_limit: IterationsLimit::Auto(Auto::Auto),
            tolerance: 1e-3,
            displacement_graph: Vec::new(),
            save_iteration_results: 1,
            save_solver_files: Vec::new(),
            save_resulting_format: vec![ResultFormat::Csv, ResultFormat::Vtk],
            continue_from: None,
            debug_mode: false,
            use_vectorized_filters: false,
            use_kdtree: false,
        }
    }
}

impl RunConfig {
    /// Reads and validates a JSON run configuration
    ///
    /// # Arguments
    /// * `config_file` - The path to the configuration file
    ///
    /// # Returns
    /// A validated RunConfig
    pub fn load(config_file: &Path) -> Result<RunConfig, BesoError> {
        let contents = match std::fs::read_to_string(config_file) {
            Ok(c) => c,
            Err(err) => {
                return Err(BesoError::Configuration(format!(
                    "Unable to open configuration file {}: {err}",
                    config_file.display()
                )))
            }
        };
        RunConfig::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<RunConfig, BesoError> {
        let config: RunConfig = match serde_json::from_str(contents) {
            Ok(c) => c,
            Err(err) => {
                return Err(BesoError::Configuration(format!(
                    "Error in configuration json: {err}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and cross references between parameters
    pub fn validate(&self) -> Result<(), BesoError> {
        if self.domains.is_empty() {
            return Err(BesoError::Configuration(
                "No domains declared".to_owned(),
            ));
        }
        if !self.domains.iter().any(|d| d.optimized) {
            return Err(BesoError::Configuration(
                "No domain is marked as optimized".to_owned(),
            ));
        }
        if !(self.mass_goal_ratio > 0.0 && self.mass_goal_ratio <= 1.0) {
            return Err(BesoError::Configuration(format!(
                "mass_goal_ratio must be in (0, 1], got {}",
                self.mass_goal_ratio
            )));
        }
        for (name, ratio) in [
            ("mass_addition_ratio", self.mass_addition_ratio),
            ("mass_removal_ratio", self.mass_removal_ratio),
        ] {
            if !(0.0..1.0).contains(&ratio) {
                return Err(BesoError::Configuration(format!(
                    "{name} must be in [0, 1), got {ratio}"
                )));
            }
        }
        if self.mass_addition_ratio == self.mass_removal_ratio {
            return Err(BesoError::Configuration(
                "mass_addition_ratio and mass_removal_ratio must differ".to_owned(),
            ));
        }
        if self.tolerance <= 0.0 {
            return Err(BesoError::Configuration(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.decay_coefficient > 0.0 {
            return Err(BesoError::Configuration(format!(
                "decay_coefficient must not be positive, got {}",
                self.decay_coefficient
            )));
        }

        for (i, domain) in self.domains.iter().enumerate() {
            if self.domains[..i].iter().any(|d| d.name == domain.name) {
                return Err(BesoError::Configuration(format!(
                    "Domain {} is declared twice",
                    domain.name
                )));
            }
            self.validate_domain(domain)?;
        }

        for filter in &self.filter_list {
            for name in &filter.domains {
                if self.domain_index(name).is_none() {
                    return Err(BesoError::Configuration(format!(
                        "Filter {:?} targets undeclared domain {name}",
                        filter.kind
                    )));
                }
            }
            if let FilterRange::Distance(d) = filter.range {
                if d < 0.0 {
                    return Err(BesoError::Configuration(format!(
                        "Filter {:?} has negative range {d}",
                        filter.kind
                    )));
                }
            }
            if let FilterKind::Casting { direction } = filter.kind {
                if direction.iter().all(|c| *c == 0.0) {
                    return Err(BesoError::Configuration(
                        "Casting filter needs a non-zero direction".to_owned(),
                    ));
                }
            }
        }

        for group in &self.steps_superposition {
            if group.is_empty() {
                return Err(BesoError::Configuration(
                    "Empty group in steps_superposition".to_owned(),
                ));
            }
            if group.iter().any(|(_, step)| *step == 0) {
                return Err(BesoError::Configuration(
                    "Step numbers in steps_superposition start at 1".to_owned(),
                ));
            }
        }

        if let Some(ContinueFrom::File(file)) = &self.continue_from {
            if file.extension().and_then(|e| e.to_str()) != Some("csv") {
                return Err(BesoError::Configuration(format!(
                    "Unsupported continue_from file {}. Expected a .csv state file",
                    file.display()
                )));
            }
        }

        if self.optimization_base == OptimizationBase::FailureIndex && !self.has_failure_limits() {
            return Err(BesoError::Configuration(
                "optimization_base failure_index requires failure_limits on some domain".to_owned(),
            ));
        }

        Ok(())
    }

    fn validate_domain(&self, domain: &DomainConfig) -> Result<(), BesoError> {
        let name = &domain.name;
        let num_states = domain.density.len();

        if num_states == 0 {
            return Err(BesoError::Configuration(format!(
                "Domain {name} has no states"
            )));
        }
        if domain.density.iter().any(|d| *d <= 0.0) {
            return Err(BesoError::Configuration(format!(
                "Domain {name} has a non-positive density"
            )));
        }
        if !domain.thickness.is_empty() && domain.thickness.len() != num_states {
            return Err(BesoError::Configuration(format!(
                "Domain {name} declares {} thicknesses for {num_states} states",
                domain.thickness.len()
            )));
        }
        if domain.failure_limits.len() > num_states {
            return Err(BesoError::Configuration(format!(
                "Domain {name} declares failure limits for {} states but has {num_states}",
                domain.failure_limits.len()
            )));
        }
        if domain.material.len() > num_states {
            return Err(BesoError::Configuration(format!(
                "Domain {name} declares {} materials for {num_states} states",
                domain.material.len()
            )));
        }
        for limits in &domain.failure_limits {
            if let Some(bad) = limits.iter().find(|l| l.limit <= 0.0) {
                return Err(BesoError::Configuration(format!(
                    "Domain {name} has non-positive limit for criterion {}",
                    bad.criterion
                )));
            }
        }
        Ok(())
    }

    pub fn domain_index(&self, name: &str) -> Option<usize> {
        self.domains.iter().position(|d| d.name == name)
    }

    /// Whether any domain declares a failure criterion
    pub fn has_failure_limits(&self) -> bool {
        self.domains
            .iter()
            .any(|d| d.failure_limits.iter().any(|l| !l.is_empty()))
    }

    /// Distinct failure criterion names in declaration order
    pub fn criteria(&self) -> Vec<String> {
        let mut criteria: Vec<String> = Vec::new();
        for domain in &self.domains {
            for limits in &domain.failure_limits {
                for limit in limits {
                    if !criteria.contains(&limit.criterion) {
                        criteria.push(limit.criterion.clone());
                    }
                }
            }
        }
        criteria
    }

    /// Mesh file resolved against the run directory
    pub fn mesh_path(&self) -> PathBuf {
        self.path.join(&self.mesh_file)
    }

    /// Path of the running plain-text log next to the mesh file
    pub fn log_path(&self) -> PathBuf {
        self.mesh_path().with_extension("log")
    }

    /// Solver worker count, resolving 0 to the available hardware concurrency
    pub fn worker_count(&self) -> usize {
        if self.cpu_cores > 0 {
            return self.cpu_cores;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Whether the run removes mass on balance
    pub fn is_net_removing(&self) -> bool {
        self.mass_removal_ratio - self.mass_addition_ratio > 0.0
    }

    /// Iterations at which periodic exports happen
    pub fn is_export_iteration(&self, iteration: usize) -> bool {
        self.save_iteration_results > 0 && iteration % self.save_iteration_results == 0
    }

    /// Settings section written at the top of the run log
    pub fn summary(&self) -> String {
        let mut msg = String::new();
        for domain in &self.domains {
            msg += &format!("elset_name              = {}\n", domain.name);
            msg += &format!("domain_optimized        = {}\n", domain.optimized);
            msg += &format!("domain_density          = {:?}\n", domain.density);
            msg += &format!("domain_thickness        = {:?}\n", domain.thickness);
            msg += &format!("domain_offset           = {}\n", domain.offset);
            msg += &format!("domain_orientation      = {:?}\n", domain.orientation);
            msg += &format!("domain_FI               = {:?}\n", domain.failure_limits);
            msg += &format!("domain_material         = {:?}\n", domain.material);
            msg += &format!("domain_same_state       = {}\n\n", domain.same_state);
        }
        msg += &format!("mass_goal_ratio         = {}\n", self.mass_goal_ratio);
        msg += &format!("continue_from           = {:?}\n", self.continue_from);
        msg += &format!("filter_list             = {:?}\n", self.filter_list);
        msg += &format!("optimization_base       = {:?}\n", self.optimization_base);
        msg += &format!("cpu_cores               = {}\n", self.worker_count());
        msg += &format!("FI_violated_tolerance   = {}\n", self.fi_violated_tolerance);
        msg += &format!("decay_coefficient       = {}\n", self.decay_coefficient);
        msg += &format!("shells_as_composite     = {}\n", self.shells_as_composite);
        msg += &format!("reference_points        = {:?}\n", self.reference_points);
        msg += &format!("reference_value         = {:?}\n", self.reference_value);
        msg += &format!("mass_addition_ratio     = {}\n", self.mass_addition_ratio);
        msg += &format!("mass_removal_ratio      = {}\n", self.mass_removal_ratio);
        msg += &format!("ratio_type              = {:?}\n", self.ratio_type);
        msg += &format!("compensate_state_filter = {}\n", self.compensate_state_filter);
        msg += &format!("sensitivity_averaging   = {}\n", self.sensitivity_averaging);
        msg += &format!("steps_superposition     = {:?}\n", self.steps_superposition);
        msg += &format!("iterations_limit        = {:?}\n", self.iterations_limit);
        msg += &format!("tolerance               = {}\n", self.tolerance);
        msg += &format!("displacement_graph      = {:?}\n", self.displacement_graph);
        msg += &format!("save_iteration_results  = {}\n", self.save_iteration_results);
        msg += &format!("save_solver_files       = {:?}\n", self.save_solver_files);
        msg += &format!("save_resulting_format   = {:?}\n", self.save_resulting_format);
        msg += &format!("debug_mode              = {}\n", self.debug_mode);
        msg += &format!("use_vectorized_filters  = {}\n", self.use_vectorized_filters);
        msg += &format!("use_kdtree              = {}\n", self.use_kdtree);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "domains": [
            { "name": "design", "optimized": true, "density": [1e-6, 1.0] }
        ]
    }"#;

    #[test]
    fn minimal_config_takes_defaults() {
        let config = RunConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.mass_goal_ratio, 0.4);
        assert_eq!(config.optimization_base, OptimizationBase::Stiffness);
        assert_eq!(config.iterations_limit, IterationsLimit::Auto(Auto::Auto));
        assert_eq!(config.domains[0].thickness, Vec::<f64>::new());
        assert!(!config.domains[0].same_state);
        assert!(config.is_net_removing());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let json = r#"{
            "domains": [{ "name": "design", "optimized": true, "density": [1.0] }],
            "mass_goal": 0.3
        }"#;
        assert!(matches!(
            RunConfig::from_json(json),
            Err(BesoError::Configuration(_))
        ));

        let json = r#"{
            "domains": [{ "name": "design", "optimized": true, "density": [1.0], "colour": 1 }]
        }"#;
        assert!(RunConfig::from_json(json).is_err());
    }

    #[test]
    fn filter_list_parses_tagged_kinds() {
        let json = r#"{
            "domains": [{ "name": "design", "optimized": true, "density": [1e-6, 1.0] }],
            "filter_list": [
                { "kind": "none", "range": 0 },
                { "kind": "simple", "range": "auto" },
                { "kind": { "casting": { "direction": [0, 0, 1] } }, "range": 2.5, "domains": ["design"] },
                { "kind": { "morphology": { "operator": "open_close", "target": "state" } }, "range": "auto" }
            ],
            "iterations_limit": 40
        }"#;
        let config = RunConfig::from_json(json).unwrap();
        assert_eq!(config.filter_list.len(), 4);
        assert!(!config.filter_list[0].is_active());
        assert_eq!(config.filter_list[1].range, FilterRange::Auto(Auto::Auto));
        assert_eq!(
            config.filter_list[2].kind,
            FilterKind::Casting {
                direction: [0.0, 0.0, 1.0]
            }
        );
        assert_eq!(
            config.filter_list[3].kind,
            FilterKind::Morphology {
                operator: MorphologyOperator::OpenClose,
                target: MorphologyTarget::State
            }
        );
        assert_eq!(config.iterations_limit, IterationsLimit::Fixed(40));
    }

    #[test]
    fn filter_on_undeclared_domain_is_rejected() {
        let json = r#"{
            "domains": [{ "name": "design", "optimized": true, "density": [1e-6, 1.0] }],
            "filter_list": [{ "kind": "simple", "range": 1.0, "domains": ["web"] }]
        }"#;
        let err = RunConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("web"));
    }

    #[test]
    fn equal_ratios_are_rejected() {
        let json = r#"{
            "domains": [{ "name": "design", "optimized": true, "density": [1.0] }],
            "mass_addition_ratio": 0.02,
            "mass_removal_ratio": 0.02
        }"#;
        assert!(RunConfig::from_json(json).is_err());
    }

    #[test]
    fn criteria_are_collected_once() {
        let json = r#"{
            "domains": [
                { "name": "a", "optimized": true, "density": [1e-6, 1.0],
                  "failure_limits": [[], [{ "criterion": "von_mises", "limit": 250.0 }]] },
                { "name": "b", "optimized": false, "density": [1.0],
                  "failure_limits": [[{ "criterion": "von_mises", "limit": 300.0 },
                                      { "criterion": "tsai_hill", "limit": 1.0 }]] }
            ],
            "optimization_base": "failure_index"
        }"#;
        let config = RunConfig::from_json(json).unwrap();
        assert_eq!(config.criteria(), vec!["von_mises", "tsai_hill"]);
    }

    #[test]
    fn export_cadence() {
        let mut config = RunConfig::default();
        config.save_iteration_results = 3;
        assert!(config.is_export_iteration(0));
        assert!(!config.is_export_iteration(4));
        assert!(config.is_export_iteration(6));
        config.save_iteration_results = 0;
        assert!(!config.is_export_iteration(0));
    }
}
