use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::info;

use crate::{
    datatypes::{Element, Model, SensitivityField, StateMap},
    error::BesoError,
    sensitivity::SensitivityOutcome,
};

/// Name of the cumulative state file in the run directory
pub const RESULTING_STATES_FILE: &str = "resulting_states.vtk";

/// Legacy VTK cell type and the number of nodes written for an element
fn vtk_cell(element: &Element) -> (u8, usize) {
    let n = element.nodes.len();
    match element.mesh_type.as_str() {
        "tria6" if n >= 6 => (22, 6),
        "tria3" | "tria6" if n >= 3 => (5, 3),
        "quad8" if n >= 8 => (23, 8),
        "quad4" | "quad8" if n >= 4 => (9, 4),
        "tetra10" if n >= 10 => (24, 10),
        "tetra4" | "tetra10" if n >= 4 => (10, 4),
        "hexa20" if n >= 20 => (25, 20),
        "hexa8" | "hexa20" if n >= 8 => (12, 8),
        "penta15" if n >= 15 => (26, 15),
        "penta6" | "penta15" if n >= 6 => (13, 6),
        // poly vertex
        _ => (2, n),
    }
}

/// Writes the header, points and cells of a legacy VTK unstructured grid
fn write_vtk_geometry(out: &mut impl Write, model: &Model, title: &str) -> Result<(), BesoError> {
    writeln!(out, "# vtk DataFile Version 3.0")?;
    writeln!(out, "{title}")?;
    writeln!(out, "ASCII")?;
    writeln!(out, "DATASET UNSTRUCTURED_GRID")?;

    writeln!(out, "POINTS {} double", model.nodes.len())?;
    for node in &model.nodes {
        let p = &node.position;
        writeln!(out, "{} {} {}", p.x, p.y, p.z)?;
    }

    let cells: Vec<(u8, &[usize])> = model
        .elements
        .iter()
        .map(|e| {
            let (cell_type, count) = vtk_cell(e);
            (cell_type, &e.nodes[..count])
        })
        .collect();
    let size: usize = cells.iter().map(|(_, nodes)| nodes.len() + 1).sum();

    writeln!(out, "\nCELLS {} {size}", cells.len())?;
    for (_, nodes) in &cells {
        let ids: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        writeln!(out, "{} {}", nodes.len(), ids.join(" "))?;
    }

    writeln!(out, "\nCELL_TYPES {}", cells.len())?;
    for (cell_type, _) in &cells {
        writeln!(out, "{cell_type}")?;
    }

    writeln!(out, "\nCELL_DATA {}", cells.len())?;
    Ok(())
}

fn write_vtk_scalars<T: std::fmt::Display>(
    out: &mut impl Write,
    name: &str,
    data_type: &str,
    values: impl Iterator<Item = T>,
) -> Result<(), BesoError> {
    writeln!(out, "\nSCALARS {name} {data_type} 1")?;
    writeln!(out, "LOOKUP_TABLE default")?;
    for v in values {
        writeln!(out, "{v}")?;
    }
    Ok(())
}

/// Cumulative VTK file holding the states of every iteration
#[derive(Debug, Clone)]
pub struct ResultingStates {
    path: PathBuf,
}

impl ResultingStates {
    /// Writes the mesh geometry to a fresh file in `run_dir`
    pub fn create(run_dir: &Path, model: &Model) -> Result<ResultingStates, BesoError> {
        let path = run_dir.join(RESULTING_STATES_FILE);
        let mut out = BufWriter::new(File::create(&path)?);
        write_vtk_geometry(&mut out, model, "element states of every iteration")?;
        out.flush()?;
        Ok(ResultingStates { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends the states of one iteration as a cell scalar
    pub fn append(&self, iteration: usize, states: &StateMap) -> Result<(), BesoError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut out = BufWriter::new(file);
        write_vtk_scalars(
            &mut out,
            &format!("state_{iteration:03}"),
            "int",
            states.as_slice().iter(),
        )?;
        out.flush()?;
        Ok(())
    }
}

/// Writes the design of one iteration as a VTK file
///
/// # Arguments
/// * `path` - The output file
/// * `model` - The model
/// * `states` - The element states
/// * `field` - The filtered sensitivity field
/// * `outcome` - The sensitivity outcome, for failure indices
pub fn write_vtk(
    path: &Path,
    model: &Model,
    states: &StateMap,
    field: &SensitivityField,
    outcome: &SensitivityOutcome,
) -> Result<(), BesoError> {
    let mut out = BufWriter::new(File::create(path)?);
    write_vtk_geometry(&mut out, model, "element states and sensitivities")?;
    write_vtk_scalars(&mut out, "state", "int", states.as_slice().iter())?;
    write_vtk_scalars(&mut out, "sensitivity", "double", field.values.iter())?;
    if model.has_failure_limits() {
        write_vtk_scalars(
            &mut out,
            "fi_max",
            "double",
            outcome.fi_step_max.iter().map(|fi| fi.unwrap_or(0.0)),
        )?;
    }
    out.flush()?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Writes one row per element with its domain, state, centroid and results
pub fn write_csv(
    path: &Path,
    model: &Model,
    states: &StateMap,
    field: &SensitivityField,
    outcome: &SensitivityOutcome,
) -> Result<(), BesoError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "element,domain,state,x,y,z,sensitivity,fi_max")?;
    for (e, element) in model.elements.iter().enumerate() {
        let fi = match outcome.fi_step_max[e] {
            Some(fi) => fi.to_string(),
            None => String::new(),
        };
        writeln!(
            out,
            "{},{},{},{},{},{},{},{fi}",
            element.label,
            model.domains[element.domain].name,
            states.get(e),
            element.centroid.x,
            element.centroid.y,
            element.centroid.z,
            field.values[e],
        )?;
    }
    out.flush()?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Writes element labels with their states, readable by `read_state_file`
pub fn write_state_file(path: &Path, model: &Model, states: &StateMap) -> Result<(), BesoError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "element,state")?;
    for (e, element) in model.elements.iter().enumerate() {
        writeln!(out, "{},{}", element.label, states.get(e))?;
    }
    out.flush()?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Reads a state file written by a previous run
///
/// # Arguments
/// * `path` - The state file
///
/// # Returns
/// The state of every listed element label
pub fn read_state_file(path: &Path) -> Result<BTreeMap<u64, usize>, BesoError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            return Err(BesoError::Configuration(format!(
                "Unable to open state file {}: {err}",
                path.display()
            )))
        }
    };

    let mut states = BTreeMap::new();
    for (n, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (n == 0 && line.starts_with("element")) {
            continue;
        }
        let mut fields = line.split(',').map(|f| f.trim());
        let parsed = match (fields.next(), fields.next()) {
            (Some(label), Some(state)) => {
                label.parse::<u64>().ok().zip(state.parse::<usize>().ok())
            }
            _ => None,
        };
        match parsed {
            Some((label, state)) => {
                states.insert(label, state);
            }
            None => {
                return Err(BesoError::Configuration(format!(
                    "Malformed line {} in state file {}: {line}",
                    n + 1,
                    path.display()
                )))
            }
        }
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::fixtures::bar_model;

    fn outcome(n: usize) -> SensitivityOutcome {
        SensitivityOutcome {
            field: SensitivityField::zeros(n),
            fi_step_max: vec![None; n],
            fi_max: vec![None],
            fi_violated: vec![0],
            energy_density: None,
            heat_flux: None,
        }
    }

    #[test]
    fn state_file_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file004.state.csv");
        let model = bar_model(3, &[1e-6, 0.5, 1.0], true);
        let states = StateMap::new(vec![2, 0, 1]);
        write_state_file(&path, &model, &states).unwrap();

        let read = read_state_file(&path).unwrap();
        assert_eq!(read.get(&1), Some(&2));
        assert_eq!(read.get(&2), Some(&0));
        assert_eq!(read.get(&3), Some(&1));
    }

    #[test]
    fn malformed_state_file_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "element,state\n1,1\n2;0\n").unwrap();
        let err = read_state_file(&path).unwrap_err();
        assert!(err.to_string().contains("line 3"));
    }

    #[test]
    fn resulting_states_gain_one_scalar_per_iteration() {
        let dir = tempfile::tempdir().unwrap();
        let model = bar_model(2, &[1e-6, 1.0], true);
        let resulting = ResultingStates::create(dir.path(), &model).unwrap();
        resulting.append(0, &StateMap::new(vec![1, 1])).unwrap();
        resulting.append(1, &StateMap::new(vec![0, 1])).unwrap();

        let text = std::fs::read_to_string(resulting.path()).unwrap();
        assert!(text.contains("CELLS 2 4"));
        assert_eq!(text.matches("CELL_DATA 2").count(), 1);
        assert!(text.contains("SCALARS state_000 int 1"));
        assert!(text.contains("SCALARS state_001 int 1\nLOOKUP_TABLE default\n0\n1\n"));
    }

    #[test]
    fn csv_has_one_row_per_element() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file001.csv");
        let model = bar_model(3, &[1e-6, 1.0], true);
        let field = SensitivityField {
            values: vec![0.5, 1.5, 2.5],
        };
        write_csv(&path, &model, &StateMap::solid(&model), &field, &outcome(3)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2], "2,design,1,1.5,0.5,0.5,1.5,");
    }
}
