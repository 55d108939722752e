use std::{path::PathBuf, thread, time::Duration};

use simwrap_toolkit::{execute, read_xml_attribute, render_template, Bounds, TempWorkDir};
use tracing::debug;

use crate::{
    beam_config::BeamConfig,
    model::{Model, ModelError},
};

/// Inputs of both beam models, in order.
pub const BEAM_INPUTS: [&str; 4] = ["Load", "Young modulus", "Length", "Inertia"];
/// Output of both beam models.
pub const BEAM_OUTPUTS: [&str; 1] = ["deviation"];
/// Template tokens replaced by the inputs, in input order.
pub const BEAM_TOKENS: [&str; 4] = ["@F", "@E", "@L", "@I"];

const INPUT_FILE: &str = "beam.xml";

/// Default sampling bounds of the beam inputs.
#[must_use]
pub fn beam_bounds() -> Vec<Bounds> {
    [(2.0e4, 4.5e4), (2.5e7, 5.0e7), (250.0, 260.0), (310.0, 450.0)]
        .into_iter()
        .map(|(lower, upper)| Bounds { lower, upper })
        .collect()
}

fn describe(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| (*name).to_owned()).collect()
}

/// Closed-form cantilever deviation `F L^3 / (3 E I)`.
#[derive(Debug, Clone)]
pub struct AnalyticBeam {
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl AnalyticBeam {
    /// Registry name.
    pub const NAME: &'static str = "beam";

    /// Creates the model.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inputs: describe(&BEAM_INPUTS),
            outputs: describe(&BEAM_OUTPUTS),
        }
    }
}

impl Default for AnalyticBeam {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for AnalyticBeam {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_description(&self) -> &[String] {
        &self.inputs
    }

    fn output_description(&self) -> &[String] {
        &self.outputs
    }

    fn default_bounds(&self) -> Option<Vec<Bounds>> {
        Some(beam_bounds())
    }

    fn compute(&self, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        let &[load, young, length, inertia] = x else {
            return Err(ModelError::Dimension {
                model: Self::NAME.into(),
                expected: BEAM_INPUTS.len(),
                actual: x.len(),
            });
        };
        let stiffness = 3.0 * young * inertia;
        if stiffness == 0.0 {
            return Err(ModelError::Evaluation(
                "zero bending stiffness (E * I)".into(),
            ));
        }
        Ok(vec![load * length.powi(3) / stiffness])
    }
}

/// The external beam code, run once per point in its own work dir.
///
/// Each evaluation renders `beam.xml` from the template, runs the configured
/// command inside the work dir and reads `deviation` from the `<outputs>`
/// element of the output file. Work dirs are removed afterwards unless the
/// configuration keeps them.
#[derive(Debug, Clone)]
pub struct BeamCode {
    config: BeamConfig,
    work_root: PathBuf,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl BeamCode {
    /// Registry name.
    pub const NAME: &'static str = "beam-code";

    /// Creates the wrapper, placing work dirs on `site` when given.
    pub fn new(config: BeamConfig, site: Option<&str>) -> Result<Self, ModelError> {
        let work_root = config.work_root_for(site)?;
        Ok(Self {
            config,
            work_root,
            inputs: describe(&BEAM_INPUTS),
            outputs: describe(&BEAM_OUTPUTS),
        })
    }

    /// Directory receiving the work dirs.
    #[must_use]
    pub const fn work_root(&self) -> &PathBuf {
        &self.work_root
    }
}

impl Model for BeamCode {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_description(&self) -> &[String] {
        &self.inputs
    }

    fn output_description(&self) -> &[String] {
        &self.outputs
    }

    fn default_bounds(&self) -> Option<Vec<Bounds>> {
        Some(beam_bounds())
    }

    fn compute(&self, x: &[f64]) -> Result<Vec<f64>, ModelError> {
        if self.config.sleep_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.sleep_ms));
        }
        let workdir = TempWorkDir::new(
            &self.work_root,
            &self.config.prefix,
            !self.config.keep_workdirs,
        )?;
        render_template(&self.config.template, workdir.join(INPUT_FILE), &BEAM_TOKENS, x)?;
        let elapsed = execute(&self.config.command, workdir.path())?;
        let deviation =
            read_xml_attribute(workdir.join(&self.config.output_file), "outputs", "deviation")?;
        debug!(
            workdir = %workdir.path().display(),
            elapsed_ms = elapsed.as_millis(),
            deviation,
            "beam code evaluated"
        );
        Ok(vec![deviation])
    }
}
