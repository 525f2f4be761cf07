//! Hyperparameter axes and their command-line rendering.
//!
//! An axis is one or more co-varying flags plus the value tuples they take.
//! Every value tuple of an axis renders to one argument fragment; a sweep is
//! the cartesian product of the fragments of all axes.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            // Debug keeps a trailing `.0` and switches to exponent notation
            // for very small/large magnitudes (1e-10 rather than 0.0000000001).
            ArgValue::Float(x) => write!(f, "{:?}", x),
            ArgValue::Str(s) => f.write_str(s),
        }
    }
}

/// Renders one `flag value` pair, or `None` when the pair contributes nothing.
///
/// `true` and the empty string render the bare flag, `false` suppresses the
/// flag and an empty flag name renders the bare value.
fn render_pair(flag: &str, value: &ArgValue) -> Option<String> {
    let bare = match value {
        ArgValue::Bool(false) => return None,
        ArgValue::Bool(true) => true,
        ArgValue::Str(s) => s.is_empty(),
        _ => false,
    };
    match (flag.is_empty(), bare) {
        (true, true) => None,
        (true, false) => Some(value.to_string()),
        (false, true) => Some(format!("--{}", flag)),
        (false, false) => Some(format!("--{} {}", flag, value)),
    }
}

/// Renders a single flag as a fragment with a leading space (` --flag value`).
pub fn render_flag(flag: &str, value: &ArgValue) -> String {
    render_pair(flag, value)
        .map(|s| format!(" {}", s))
        .unwrap_or_default()
}

/// Renders the fixed flags appended to every job, in declaration order.
pub fn render_fixed(fixed: &[(String, ArgValue)]) -> String {
    fixed
        .iter()
        .map(|(flag, value)| render_flag(flag, value))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    flags: Vec<String>,
    values: Vec<Vec<ArgValue>>,
}

impl Axis {
    pub fn single(flag: impl Into<String>, values: Vec<ArgValue>) -> Self {
        Self {
            flags: vec![flag.into()],
            values: values.into_iter().map(|v| vec![v]).collect(),
        }
    }

    pub fn multi(flags: Vec<String>, values: Vec<Vec<ArgValue>>) -> Result<Self> {
        if flags.is_empty() {
            return Err(anyhow!("axis must name at least one flag"));
        }
        for (i, tuple) in values.iter().enumerate() {
            if tuple.len() != flags.len() {
                return Err(anyhow!(
                    "axis ({}) value #{} has {} elements, expected {}",
                    flags.join(", "),
                    i,
                    tuple.len(),
                    flags.len()
                ));
            }
        }
        Ok(Self { flags, values })
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// One fragment per value tuple, each either empty or starting with a space.
    pub fn fragments(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|tuple| {
                let parts = self
                    .flags
                    .iter()
                    .zip(tuple)
                    .filter_map(|(flag, value)| render_pair(flag, value))
                    .collect::<Vec<_>>();
                if parts.is_empty() {
                    String::new()
                } else {
                    format!(" {}", parts.join(" "))
                }
            })
            .collect()
    }
}

/// Cartesian product of the axis fragments, last axis varying fastest.
///
/// No axes yield a single empty combination.
pub fn cartesian(axes: &[Axis]) -> Vec<Vec<String>> {
    let mut combos: Vec<Vec<String>> = vec![Vec::new()];
    for axis in axes {
        let fragments = axis.fragments();
        let mut next = Vec::with_capacity(combos.len() * fragments.len());
        for combo in &combos {
            for fragment in &fragments {
                let mut extended = combo.clone();
                extended.push(fragment.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AxisEntry {
    Tuple(Vec<ArgValue>),
    Scalar(ArgValue),
}

/// Axis as written in a sweep file: either `flag` with scalar values or
/// `flags` with one tuple per value.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AxisConfig {
    #[serde(default)]
    pub flag: Option<String>,
    #[serde(default)]
    pub flags: Option<Vec<String>>,
    pub values: Vec<AxisEntry>,
}

impl TryFrom<AxisConfig> for Axis {
    type Error = anyhow::Error;

    fn try_from(config: AxisConfig) -> Result<Self> {
        let flags = match (config.flag, config.flags) {
            (Some(flag), None) => vec![flag],
            (None, Some(flags)) => flags,
            (Some(_), Some(_)) => {
                return Err(anyhow!("axis sets both `flag` and `flags`"));
            }
            (None, None) => return Err(anyhow!("axis needs `flag` or `flags`")),
        };
        let values = config
            .values
            .into_iter()
            .map(|entry| match entry {
                AxisEntry::Tuple(tuple) => tuple,
                AxisEntry::Scalar(value) => vec![value],
            })
            .collect();
        Axis::multi(flags, values)
    }
}
