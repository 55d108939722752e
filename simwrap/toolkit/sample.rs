use std::{fmt, str::FromStr};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::ToolkitError;

/// Closed interval for one input variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Lower bound (inclusive).
    pub lower: f64,
    /// Upper bound (inclusive).
    pub upper: f64,
}

impl Bounds {
    /// Creates finite bounds with `lower <= upper`.
    pub fn new(lower: f64, upper: f64) -> Result<Self, ToolkitError> {
        if !lower.is_finite() || !upper.is_finite() {
            return Err(ToolkitError::InvalidBounds(format!(
                "[{lower}, {upper}] is not finite"
            )));
        }
        if lower > upper {
            return Err(ToolkitError::InvalidBounds(format!(
                "lower {lower} exceeds upper {upper}"
            )));
        }
        Ok(Self { lower, upper })
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lower, self.upper)
    }
}

impl FromStr for Bounds {
    type Err = ToolkitError;

    /// Parses `lower:upper`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (lower, upper) = raw
            .split_once(':')
            .ok_or_else(|| ToolkitError::InvalidBounds(format!("`{raw}` is not lower:upper")))?;
        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| ToolkitError::InvalidBounds(format!("`{part}` is not a number")))
        };
        Self::new(parse(lower)?, parse(upper)?)
    }
}

/// Two-dimensional array of points: one row per point, one column per input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SampleSerde")]
pub struct Sample {
    description: Vec<String>,
    rows: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct SampleSerde {
    description: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl TryFrom<SampleSerde> for Sample {
    type Error = ToolkitError;

    fn try_from(raw: SampleSerde) -> Result<Self, Self::Error> {
        Self::new(raw.description, raw.rows)
    }
}

impl Sample {
    /// Creates a sample, checking every row against the description.
    pub fn new(description: Vec<String>, rows: Vec<Vec<f64>>) -> Result<Self, ToolkitError> {
        let dimension = description.len();
        if dimension == 0 {
            return Err(ToolkitError::InvalidSample("empty description".into()));
        }
        if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != dimension)
        {
            return Err(ToolkitError::InvalidSample(format!(
                "row {index} has {} values, expected {dimension}",
                row.len()
            )));
        }
        Ok(Self { description, rows })
    }

    /// Creates a sample with generated column names `X0..Xn`.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, ToolkitError> {
        let dimension = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| ToolkitError::InvalidSample("no rows to infer dimension".into()))?;
        Self::new(Self::generated_description(dimension), rows)
    }

    /// Creates an empty sample with the given description.
    pub fn empty(description: Vec<String>) -> Result<Self, ToolkitError> {
        Self::new(description, Vec::new())
    }

    /// Uniform Monte Carlo design of `size` points, reproducible per `seed`.
    pub fn uniform(
        description: Vec<String>,
        bounds: &[Bounds],
        size: usize,
        seed: u64,
    ) -> Result<Self, ToolkitError> {
        if bounds.len() != description.len() {
            return Err(ToolkitError::InvalidSample(format!(
                "{} bounds for {} inputs",
                bounds.len(),
                description.len()
            )));
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        let rows = (0..size)
            .map(|_| {
                bounds
                    .iter()
                    .map(|b| rng.gen_range(b.lower..=b.upper))
                    .collect()
            })
            .collect();
        Self::new(description, rows)
    }

    fn generated_description(dimension: usize) -> Vec<String> {
        (0..dimension).map(|i| format!("X{i}")).collect()
    }

    /// Column names.
    #[must_use]
    pub fn description(&self) -> &[String] {
        &self.description
    }

    /// Number of columns.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.description.len()
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the sample holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Point at `index`.
    #[must_use]
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// All points.
    #[must_use]
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Appends a point.
    pub fn push(&mut self, row: Vec<f64>) -> Result<(), ToolkitError> {
        if row.len() != self.dimension() {
            return Err(ToolkitError::InvalidSample(format!(
                "row has {} values, expected {}",
                row.len(),
                self.dimension()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Consumes the sample, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Vec<f64>> {
        self.rows
    }
}
