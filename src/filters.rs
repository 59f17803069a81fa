use std::collections::HashMap;

use indicatif::ProgressBar;
use nalgebra::{DVector, Vector3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rstar::{PointDistance, RTree, RTreeObject, AABB};
use tracing::{debug, info, warn};

use crate::{
    config::{FilterKind, FilterRange, FilterSpec, MorphologyOperator, MorphologyTarget, RunConfig},
    datatypes::{Model, SensitivityField, StateMap},
    error::BesoError,
    sensitivity::SensitivityOutcome,
};

/// Multiple of the average element size used for `"auto"` filter ranges
pub const AUTO_RANGE_FACTOR: f64 = 2.0;

/// Performance switches that never change filter results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterHints {
    pub use_kdtree: bool,
    pub use_vectorized: bool,
}

impl FilterHints {
    pub fn from_config(config: &RunConfig) -> FilterHints {
        FilterHints {
            use_kdtree: config.use_kdtree,
            use_vectorized: config.use_vectorized_filters,
        }
    }
}

/// A point indexed in the neighbour search
#[derive(Debug, Clone)]
struct Site {
    position: [f64; 3],
    index: usize,
}

impl RTreeObject for Site {
    type Envelope = AABB<[f64; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for Site {
    fn distance_2(&self, point: &[f64; 3]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        let dz = self.position[2] - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

fn site(position: &Vector3<f64>, index: usize) -> Site {
    Site {
        position: [position.x, position.y, position.z],
        index,
    }
}

/// Finds the sites within `range` of every query point
///
/// # Arguments
/// * `queries` - The query points
/// * `sites` - The candidate sites
/// * `range` - The search radius, inclusive
/// * `use_kdtree` - Whether to search an R-tree instead of sweeping all sites
/// * `bar` - Progress bar advanced once per query
///
/// # Returns
/// `(site index, distance)` pairs per query, sorted by site index
fn sites_within(
    queries: &[Vector3<f64>],
    sites: Vec<Site>,
    range: f64,
    use_kdtree: bool,
    bar: &ProgressBar,
) -> Vec<Vec<(usize, f64)>> {
    let range_2 = range * range;
    let tree = if use_kdtree {
        Some(RTree::bulk_load(sites.clone()))
    } else {
        None
    };

    queries
        .iter()
        .map(|q| {
            let point = [q.x, q.y, q.z];
            let mut found: Vec<(usize, f64)> = match &tree {
                Some(tree) => tree
                    .locate_within_distance(point, range_2)
                    .map(|s| (s.index, s.distance_2(&point).sqrt()))
                    .collect(),
                None => sites
                    .iter()
                    .filter_map(|s| {
                        let d2 = s.distance_2(&point);
                        if d2 <= range_2 {
                            Some((s.index, d2.sqrt()))
                        } else {
                            None
                        }
                    })
                    .collect(),
            };
            found.sort_by_key(|(index, _)| *index);
            bar.inc(1);
            found
        })
        .collect()
}

/// Row-normalised weights mapping an input vector onto selected outputs
#[derive(Debug, Clone)]
struct WeightMatrix {
    /// Output index written by each row
    outputs: Vec<usize>,
    /// `(input index, weight)` per row, sorted by input index
    rows: Vec<Vec<(usize, f64)>>,
    csr: Option<CsrMatrix<f64>>,
}

impl WeightMatrix {
    /// Builds linear `range - distance` weights from neighbour lists.
    /// Rows without positive weight are dropped.
    fn from_neighbours(
        outputs: &[usize],
        neighbours: Vec<Vec<(usize, f64)>>,
        range: f64,
        num_inputs: usize,
        vectorized: bool,
    ) -> WeightMatrix {
        let mut kept_outputs = Vec::new();
        let mut rows = Vec::new();
        for (&output, found) in outputs.iter().zip(neighbours) {
            let weights: Vec<(usize, f64)> = found
                .into_iter()
                .map(|(i, d)| (i, range - d))
                .filter(|(_, w)| *w > 0.0)
                .collect();
            let total: f64 = weights.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                continue;
            }
            kept_outputs.push(output);
            rows.push(weights.into_iter().map(|(i, w)| (i, w / total)).collect());
        }

        let csr = if vectorized {
            let mut coo = CooMatrix::new(rows.len(), num_inputs);
            for (r, row) in rows.iter().enumerate() {
                for &(c, w) in row {
                    coo.push(r, c, w);
                }
            }
            Some(CsrMatrix::from(&coo))
        } else {
            None
        };

        WeightMatrix {
            outputs: kept_outputs,
            rows,
            csr,
        }
    }

    /// Writes the weighted average of `input` into the rows' outputs
    fn apply_into(&self, input: &[f64], output: &mut [f64]) {
        match &self.csr {
            Some(csr) => {
                let x = DVector::from_column_slice(input);
                let y = csr * &x;
                for (&o, v) in self.outputs.iter().zip(y.iter()) {
                    output[o] = *v;
                }
            }
            None => {
                for (&o, row) in self.outputs.iter().zip(&self.rows) {
                    let mut sum = 0.0;
                    for &(i, w) in row {
                        sum += w * input[i];
                    }
                    output[o] = sum;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Operation {
    /// Weighted average between element centroids
    Average(WeightMatrix),
    /// Element values averaged onto points, then back onto elements
    TwoStage {
        num_points: usize,
        to_points: WeightMatrix,
        to_elements: WeightMatrix,
    },
    /// Maximum over the element and every element downstream of it
    Casting { downstream: Vec<Vec<usize>> },
    Morphology {
        operator: MorphologyOperator,
        target: MorphologyTarget,
        /// Neighbourhood of every target, self included
        neighbours: Vec<Vec<usize>>,
    },
}

/// One filter with its neighbourhood data computed
#[derive(Debug, Clone)]
pub struct PreparedFilter {
    pub kind: FilterKind,
    pub range: f64,
    /// Filtered elements, ascending
    pub targets: Vec<usize>,
    /// Targeted domains that switch as a whole
    same_state_domains: Vec<usize>,
    operation: Operation,
}

impl PreparedFilter {
    fn is_state_filter(&self) -> bool {
        matches!(
            self.operation,
            Operation::Morphology {
                target: MorphologyTarget::State,
                ..
            }
        )
    }
}

/// Ordered filters ready to be applied every iteration
#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    pub filters: Vec<PreparedFilter>,
}

impl FilterPipeline {
    /// Computes neighbourhoods for every active filter
    ///
    /// # Arguments
    /// * `model` - The model
    /// * `filters` - The configured filter list, in application order
    /// * `hints` - Search and evaluation switches
    ///
    /// # Returns
    /// The prepared pipeline
    pub fn prepare(
        model: &Model,
        filters: &[FilterSpec],
        hints: FilterHints,
    ) -> Result<FilterPipeline, BesoError> {
        let mut auto_ranges: HashMap<Vec<usize>, f64> = HashMap::new();
        let mut prepared = Vec::new();

        for spec in filters {
            if !spec.is_active() {
                debug!("Skipping inactive filter {:?}", spec.kind);
                continue;
            }

            let domains = targeted_domains(model, spec)?;
            let targets: Vec<usize> = {
                let mut t: Vec<usize> = domains
                    .iter()
                    .flat_map(|&d| model.domains[d].elements.iter().copied())
                    .collect();
                t.sort_unstable();
                t
            };
            if targets.is_empty() {
                warn!("Filter {:?} targets no elements and is skipped", spec.kind);
                continue;
            }

            let range = match spec.range {
                FilterRange::Distance(d) => d,
                FilterRange::Auto(_) => match auto_ranges.get(&domains) {
                    Some(r) => *r,
                    None => {
                        let average = targets
                            .iter()
                            .map(|&e| model.elements[e].size)
                            .sum::<f64>()
                            / targets.len() as f64;
                        let r = average * AUTO_RANGE_FACTOR;
                        info!(
                            "Auto filter range for domains {:?} is {r:.6}",
                            domains
                                .iter()
                                .map(|&d| model.domains[d].name.as_str())
                                .collect::<Vec<&str>>()
                        );
                        auto_ranges.insert(domains.clone(), r);
                        r
                    }
                },
            };

            let same_state_domains: Vec<usize> = domains
                .iter()
                .copied()
                .filter(|&d| model.domains[d].same_state)
                .collect();
            let is_casting = matches!(spec.kind, FilterKind::Casting { .. });
            if !same_state_domains.is_empty() && !is_casting {
                warn!(
                    "Filter {:?} targets domains that switch as a whole",
                    spec.kind
                );
            }

            let operation = match spec.kind {
                FilterKind::None => continue,
                FilterKind::Simple => prepare_simple(model, &targets, range, hints),
                FilterKind::OverNodes => {
                    let mut nodes: Vec<usize> = targets
                        .iter()
                        .flat_map(|&e| model.elements[e].nodes.iter().copied())
                        .collect();
                    nodes.sort_unstable();
                    nodes.dedup();
                    let points: Vec<Vector3<f64>> =
                        nodes.iter().map(|&n| model.nodes[n].position).collect();
                    prepare_two_stage(model, &targets, points, range, hints)
                }
                FilterKind::OverPoints => {
                    let points = grid_points(model, &targets, range);
                    prepare_two_stage(model, &targets, points, range, hints)
                }
                FilterKind::Casting { direction } => {
                    prepare_casting(model, &targets, direction, range)?
                }
                FilterKind::Morphology { operator, target } => {
                    let targets: Vec<usize> = match target {
                        MorphologyTarget::Sensitivity => targets.clone(),
                        MorphologyTarget::State => targets
                            .iter()
                            .copied()
                            .filter(|&e| switches_alone(model, e))
                            .collect(),
                    };
                    Operation::Morphology {
                        operator,
                        target,
                        neighbours: neighbourhoods(model, &targets, range, hints.use_kdtree),
                    }
                }
            };

            let targets = match &operation {
                Operation::Morphology {
                    target: MorphologyTarget::State,
                    ..
                } => targets
                    .into_iter()
                    .filter(|&e| switches_alone(model, e))
                    .collect(),
                _ => targets,
            };

            prepared.push(PreparedFilter {
                kind: spec.kind,
                range,
                targets,
                same_state_domains,
                operation,
            });
        }

        Ok(FilterPipeline { filters: prepared })
    }

    pub fn has_state_filters(&self) -> bool {
        self.filters.iter().any(|f| f.is_state_filter())
    }

    /// Applies every sensitivity filter in order
    ///
    /// # Arguments
    /// * `model` - The model
    /// * `field` - The sensitivity field, filtered in place
    /// * `states` - The current element states
    pub fn apply_sensitivity(
        &self,
        model: &Model,
        field: &mut SensitivityField,
        states: &StateMap,
    ) -> Result<(), BesoError> {
        for filter in self.filters.iter().filter(|f| !f.is_state_filter()) {
            let before = field.values.clone();
            match &filter.operation {
                Operation::Average(weights) => {
                    weights.apply_into(&before, &mut field.values);
                }
                Operation::TwoStage {
                    num_points,
                    to_points,
                    to_elements,
                } => {
                    let mut points = vec![0.0; *num_points];
                    to_points.apply_into(&before, &mut points);
                    to_elements.apply_into(&points, &mut field.values);
                }
                Operation::Casting { downstream } => {
                    check_uniform_states(model, &filter.same_state_domains, states)?;
                    for (&e, below) in filter.targets.iter().zip(downstream) {
                        field.values[e] = below
                            .iter()
                            .map(|&f| before[f])
                            .fold(before[e], f64::max);
                    }
                }
                Operation::Morphology {
                    operator,
                    neighbours,
                    ..
                } => {
                    field.values = morphology(*operator, &before, &filter.targets, neighbours);
                }
            }

            if before == field.values {
                debug!("Filter {:?} changed no element", filter.kind);
            }
        }
        Ok(())
    }

    /// Applies every state morphology filter in order
    ///
    /// # Arguments
    /// * `model` - The model
    /// * `states` - The states after switching
    /// * `outcome` - The sensitivity outcome of this iteration
    ///
    /// # Returns
    /// The filtered states
    pub fn apply_states(
        &self,
        model: &Model,
        states: &StateMap,
        outcome: &SensitivityOutcome,
    ) -> StateMap {
        let mut current = states.clone();
        for filter in self.filters.iter().filter(|f| f.is_state_filter()) {
            let (operator, neighbours) = match &filter.operation {
                Operation::Morphology {
                    operator,
                    neighbours,
                    ..
                } => (*operator, neighbours),
                _ => continue,
            };

            let values: Vec<f64> = current.as_slice().iter().map(|&s| s as f64).collect();
            let filtered = morphology(operator, &values, &filter.targets, neighbours);

            let mut changed = 0;
            for &e in &filter.targets {
                let highest = model.domain_of(e).highest_state();
                let old = current.get(e);
                let mut new = ((filtered[e] + 0.5).floor().max(0.0) as usize).min(highest);
                if new < old && outcome.is_failing(e) {
                    new = old;
                }
                if new != old {
                    current.set(e, new);
                    changed += 1;
                }
            }
            if changed == 0 {
                debug!("State filter {:?} changed no element", filter.kind);
            } else {
                debug!("State filter {:?} changed {changed} elements", filter.kind);
            }
        }
        current
    }
}

/// Whether state filters may change the element on its own
fn switches_alone(model: &Model, element: usize) -> bool {
    let domain = model.domain_of(element);
    domain.optimized && !domain.same_state
}

/// Domain indices a filter acts on, every optimized domain when none are named
fn targeted_domains(model: &Model, spec: &FilterSpec) -> Result<Vec<usize>, BesoError> {
    if spec.domains.is_empty() {
        return Ok(model.optimized_domains());
    }
    let mut domains = Vec::new();
    for name in &spec.domains {
        match model.domains.iter().position(|d| &d.name == name) {
            Some(d) => domains.push(d),
            None => {
                return Err(BesoError::Configuration(format!(
                    "Filter {:?} targets unknown domain {name}",
                    spec.kind
                )))
            }
        }
    }
    domains.sort_unstable();
    domains.dedup();
    Ok(domains)
}

fn new_bar(len: usize) -> ProgressBar {
    ProgressBar::new(len as u64)
}

fn centroid_sites(model: &Model, targets: &[usize]) -> Vec<Site> {
    targets
        .iter()
        .map(|&e| site(&model.elements[e].centroid, e))
        .collect()
}

fn neighbourhoods(
    model: &Model,
    targets: &[usize],
    range: f64,
    use_kdtree: bool,
) -> Vec<Vec<usize>> {
    let queries: Vec<Vector3<f64>> = targets.iter().map(|&e| model.elements[e].centroid).collect();
    let bar = new_bar(queries.len());
    let found = sites_within(&queries, centroid_sites(model, targets), range, use_kdtree, &bar);
    bar.finish_and_clear();
    found
        .into_iter()
        .map(|f| f.into_iter().map(|(i, _)| i).collect())
        .collect()
}

fn prepare_simple(model: &Model, targets: &[usize], range: f64, hints: FilterHints) -> Operation {
    let queries: Vec<Vector3<f64>> = targets.iter().map(|&e| model.elements[e].centroid).collect();
    let bar = new_bar(queries.len());
    let found = sites_within(
        &queries,
        centroid_sites(model, targets),
        range,
        hints.use_kdtree,
        &bar,
    );
    bar.finish_and_clear();
    Operation::Average(WeightMatrix::from_neighbours(
        targets,
        found,
        range,
        model.elements.len(),
        hints.use_vectorized,
    ))
}

fn prepare_two_stage(
    model: &Model,
    targets: &[usize],
    points: Vec<Vector3<f64>>,
    range: f64,
    hints: FilterHints,
) -> Operation {
    let bar = new_bar(points.len() + targets.len());

    // element -> point
    let found = sites_within(
        &points,
        centroid_sites(model, targets),
        range,
        hints.use_kdtree,
        &bar,
    );
    let point_ids: Vec<usize> = (0..points.len()).collect();
    let to_points = WeightMatrix::from_neighbours(
        &point_ids,
        found,
        range,
        model.elements.len(),
        hints.use_vectorized,
    );

    // point -> element, over the points that received a value
    let kept: Vec<Site> = to_points
        .outputs
        .iter()
        .map(|&p| site(&points[p], p))
        .collect();
    let queries: Vec<Vector3<f64>> = targets.iter().map(|&e| model.elements[e].centroid).collect();
    let found = sites_within(&queries, kept, range, hints.use_kdtree, &bar);
    let to_elements =
        WeightMatrix::from_neighbours(targets, found, range, points.len(), hints.use_vectorized);
    bar.finish_and_clear();

    if to_elements.outputs.len() < targets.len() {
        debug!(
            "{} elements have no filter point in range and keep their value",
            targets.len() - to_elements.outputs.len()
        );
    }

    Operation::TwoStage {
        num_points: points.len(),
        to_points,
        to_elements,
    }
}

/// Regular grid with spacing `range / 2` covering the targeted centroids
fn grid_points(model: &Model, targets: &[usize], range: f64) -> Vec<Vector3<f64>> {
    let spacing = range / 2.0;
    let mut min = model.elements[targets[0]].centroid;
    let mut max = min;
    for &e in targets {
        let c = &model.elements[e].centroid;
        min = min.inf(c);
        max = max.sup(c);
    }
    let counts: Vec<usize> = (0..3)
        .map(|k| ((max[k] - min[k]) / spacing).floor() as usize + 1)
        .collect();

    let mut points = Vec::with_capacity(counts[0] * counts[1] * counts[2]);
    for i in 0..counts[0] {
        for j in 0..counts[1] {
            for k in 0..counts[2] {
                points.push(min + Vector3::new(i as f64, j as f64, k as f64) * spacing);
            }
        }
    }
    points
}

fn prepare_casting(
    model: &Model,
    targets: &[usize],
    direction: [f64; 3],
    range: f64,
) -> Result<Operation, BesoError> {
    let axis = Vector3::new(direction[0], direction[1], direction[2]);
    let norm = axis.norm();
    if norm == 0.0 {
        return Err(BesoError::Configuration(
            "Casting direction must not be zero".to_owned(),
        ));
    }
    let axis = axis / norm;

    let bar = new_bar(targets.len());
    let downstream = targets
        .iter()
        .map(|&e| {
            let origin = model.elements[e].centroid;
            let below: Vec<usize> = targets
                .iter()
                .copied()
                .filter(|&f| {
                    let offset = model.elements[f].centroid - origin;
                    let axial = offset.dot(&axis);
                    axial > 0.0 && (offset - axis * axial).norm() <= range
                })
                .collect();
            bar.inc(1);
            below
        })
        .collect();
    bar.finish_and_clear();

    Ok(Operation::Casting { downstream })
}

/// Fails when a domain that must switch as a whole holds mixed states
fn check_uniform_states(
    model: &Model,
    domains: &[usize],
    states: &StateMap,
) -> Result<(), BesoError> {
    for &d in domains {
        let domain = &model.domains[d];
        let mut domain_states = domain.elements.iter().map(|&e| states.get(e));
        if let Some(first) = domain_states.next() {
            if domain_states.any(|s| s != first) {
                return Err(BesoError::Filter(format!(
                    "Domain {} must hold a single state for the casting filter",
                    domain.name
                )));
            }
        }
    }
    Ok(())
}

fn neighbourhood_fold(
    values: &[f64],
    targets: &[usize],
    neighbours: &[Vec<usize>],
    pick: fn(f64, f64) -> f64,
) -> Vec<f64> {
    let mut out = values.to_vec();
    for (&e, around) in targets.iter().zip(neighbours) {
        out[e] = around.iter().map(|&n| values[n]).fold(values[e], pick);
    }
    out
}

/// Grey-scale morphology over the prepared neighbourhoods
fn morphology(
    operator: MorphologyOperator,
    values: &[f64],
    targets: &[usize],
    neighbours: &[Vec<usize>],
) -> Vec<f64> {
    let erode = |v: &[f64]| neighbourhood_fold(v, targets, neighbours, f64::min);
    let dilate = |v: &[f64]| neighbourhood_fold(v, targets, neighbours, f64::max);
    let open = |v: &[f64]| dilate(&erode(v));
    let close = |v: &[f64]| erode(&dilate(v));

    match operator {
        MorphologyOperator::Erode => erode(values),
        MorphologyOperator::Dilate => dilate(values),
        MorphologyOperator::Open => open(values),
        MorphologyOperator::Close => close(values),
        MorphologyOperator::OpenClose => close(&open(values)),
        MorphologyOperator::CloseOpen => open(&close(values)),
        MorphologyOperator::Combine => {
            let a = close(&open(values));
            let b = open(&close(values));
            let mut out = values.to_vec();
            for &e in targets {
                out[e] = (a[e] + b[e]) / 2.0;
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Auto;
    use crate::datatypes::fixtures::bar_model;

    fn spec(kind: FilterKind, range: f64) -> FilterSpec {
        FilterSpec {
            kind,
            range: FilterRange::Distance(range),
            domains: Vec::new(),
        }
    }

    fn field(values: &[f64]) -> SensitivityField {
        SensitivityField {
            values: values.to_vec(),
        }
    }

    fn outcome(fi: Vec<Option<f64>>) -> SensitivityOutcome {
        let n = fi.len();
        SensitivityOutcome {
            field: SensitivityField::zeros(n),
            fi_step_max: fi,
            fi_max: vec![None],
            fi_violated: vec![0],
            energy_density: None,
            heat_flux: None,
        }
    }

    /// Splits the last element of a bar into a second domain
    fn split_bar(num_elements: usize) -> Model {
        let mut model = bar_model(num_elements, &[1e-6, 1.0], true);
        let last = num_elements - 1;
        let mut web = model.domains[0].clone();
        web.name = "web".to_owned();
        web.elements = vec![last];
        model.domains[0].elements.retain(|&e| e != last);
        model.elements[last].domain = 1;
        model.domains.push(web);
        model
    }

    #[test]
    fn inactive_filters_leave_field_untouched() {
        let model = bar_model(4, &[1e-6, 1.0], true);
        let filters = vec![
            spec(FilterKind::None, 2.0),
            spec(FilterKind::Simple, 0.0),
        ];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        assert!(pipeline.filters.is_empty());

        let mut f = field(&[1.0, 5.0, 2.0, 0.5]);
        pipeline
            .apply_sensitivity(&model, &mut f, &StateMap::solid(&model))
            .unwrap();
        assert_eq!(f.values, vec![1.0, 5.0, 2.0, 0.5]);
    }

    #[test]
    fn simple_filter_weights_by_distance() {
        let model = bar_model(3, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let filters = vec![spec(FilterKind::Simple, 1.5)];

        let mut results = Vec::new();
        for (use_kdtree, use_vectorized) in [(false, false), (true, false), (true, true)] {
            let hints = FilterHints {
                use_kdtree,
                use_vectorized,
            };
            let pipeline = FilterPipeline::prepare(&model, &filters, hints).unwrap();
            let mut f = field(&[0.0, 4.0, 0.0]);
            pipeline.apply_sensitivity(&model, &mut f, &states).unwrap();
            results.push(f.values);
        }

        let expected = [1.0, 2.4, 1.0];
        for values in results {
            for (v, e) in values.iter().zip(expected) {
                assert!((v - e).abs() < 1e-12, "{v} != {e}");
            }
        }
    }

    #[test]
    fn untargeted_elements_pass_through() {
        let model = split_bar(3);
        let mut filters = vec![spec(FilterKind::Simple, 1.5)];
        filters[0].domains = vec!["design".to_owned()];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        assert_eq!(pipeline.filters[0].targets, vec![0, 1]);

        let mut f = field(&[0.0, 4.0, 9.0]);
        pipeline
            .apply_sensitivity(&model, &mut f, &StateMap::solid(&model))
            .unwrap();
        assert!((f.values[0] - 1.0).abs() < 1e-12);
        assert!((f.values[1] - 3.0).abs() < 1e-12);
        assert_eq!(f.values[2], 9.0);
    }

    #[test]
    fn auto_range_doubles_average_size() {
        let model = bar_model(3, &[1e-6, 1.0], true);
        let filters = vec![FilterSpec {
            kind: FilterKind::Simple,
            range: FilterRange::Auto(Auto::Auto),
            domains: Vec::new(),
        }];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        assert!((pipeline.filters[0].range - 2.0 * 3f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn point_filters_preserve_uniform_fields() {
        let model = bar_model(5, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        for kind in [FilterKind::OverNodes, FilterKind::OverPoints] {
            let pipeline =
                FilterPipeline::prepare(&model, &[spec(kind, 1.2)], FilterHints::default())
                    .unwrap();
            let mut f = field(&[3.0; 5]);
            pipeline.apply_sensitivity(&model, &mut f, &states).unwrap();
            for v in &f.values {
                assert!((v - 3.0).abs() < 1e-12, "{kind:?} gave {v}");
            }
        }
    }

    #[test]
    fn casting_takes_downstream_maximum() {
        let model = bar_model(3, &[1e-6, 1.0], true);
        let filters = vec![spec(
            FilterKind::Casting {
                direction: [2.0, 0.0, 0.0],
            },
            0.5,
        )];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        let mut f = field(&[3.0, 1.0, 2.0]);
        pipeline
            .apply_sensitivity(&model, &mut f, &StateMap::solid(&model))
            .unwrap();
        assert_eq!(f.values, vec![3.0, 2.0, 2.0]);
    }

    #[test]
    fn casting_rejects_mixed_same_state_domain() {
        let mut model = bar_model(3, &[1e-6, 1.0], true);
        model.domains[0].same_state = true;
        let filters = vec![spec(
            FilterKind::Casting {
                direction: [0.0, 0.0, 1.0],
            },
            1.0,
        )];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        let mut f = field(&[1.0, 1.0, 1.0]);
        let err = pipeline
            .apply_sensitivity(&model, &mut f, &StateMap::new(vec![1, 0, 1]))
            .unwrap_err();
        assert!(matches!(err, BesoError::Filter(_)));
    }

    #[test]
    fn sensitivity_morphology() {
        let model = bar_model(5, &[1e-6, 1.0], true);
        let states = StateMap::solid(&model);
        let morph = |operator| {
            spec(
                FilterKind::Morphology {
                    operator,
                    target: MorphologyTarget::Sensitivity,
                },
                1.5,
            )
        };

        let pipeline = FilterPipeline::prepare(
            &model,
            &[morph(MorphologyOperator::Erode)],
            FilterHints::default(),
        )
        .unwrap();
        let mut f = field(&[5.0, 5.0, 1.0, 5.0, 5.0]);
        pipeline.apply_sensitivity(&model, &mut f, &states).unwrap();
        assert_eq!(f.values, vec![5.0, 1.0, 1.0, 1.0, 5.0]);

        let pipeline = FilterPipeline::prepare(
            &model,
            &[morph(MorphologyOperator::Close)],
            FilterHints::default(),
        )
        .unwrap();
        let mut f = field(&[5.0, 5.0, 1.0, 5.0, 5.0]);
        pipeline.apply_sensitivity(&model, &mut f, &states).unwrap();
        assert_eq!(f.values, vec![5.0; 5]);
    }

    #[test]
    fn state_erosion_spares_failing_elements() {
        let model = bar_model(5, &[1e-6, 0.5, 1.0], true);
        let filters = vec![spec(
            FilterKind::Morphology {
                operator: MorphologyOperator::Erode,
                target: MorphologyTarget::State,
            },
            1.5,
        )];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        assert!(pipeline.has_state_filters());

        let states = StateMap::new(vec![2, 2, 0, 2, 2]);
        let fi = outcome(vec![None, Some(1.3), None, Some(0.2), None]);
        let filtered = pipeline.apply_states(&model, &states, &fi);
        assert_eq!(filtered.as_slice(), &[2, 2, 0, 0, 2]);

        // sensitivity filters ignore state morphology
        let mut f = field(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        pipeline.apply_sensitivity(&model, &mut f, &states).unwrap();
        assert_eq!(f.values, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn state_combine_rounds_half_up() {
        let model = bar_model(3, &[1e-6, 1.0], true);
        let filters = vec![spec(
            FilterKind::Morphology {
                operator: MorphologyOperator::Combine,
                target: MorphologyTarget::State,
            },
            1.5,
        )];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        let filtered = pipeline.apply_states(
            &model,
            &StateMap::new(vec![0, 1, 0]),
            &outcome(vec![None; 3]),
        );
        assert_eq!(filtered.as_slice(), &[1, 1, 1]);
    }

    #[test]
    fn state_morphology_skips_same_state_domains() {
        let mut model = split_bar(3);
        model.domains[1].same_state = true;
        let filters = vec![spec(
            FilterKind::Morphology {
                operator: MorphologyOperator::Dilate,
                target: MorphologyTarget::State,
            },
            1.5,
        )];
        let pipeline = FilterPipeline::prepare(&model, &filters, FilterHints::default()).unwrap();
        assert_eq!(pipeline.filters[0].targets, vec![0, 1]);
        let filtered = pipeline.apply_states(
            &model,
            &StateMap::new(vec![0, 0, 1]),
            &outcome(vec![None; 3]),
        );
        assert_eq!(filtered.as_slice(), &[0, 0, 1]);
    }
}
