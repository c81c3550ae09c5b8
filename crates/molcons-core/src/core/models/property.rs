use crate::core::perturbation::Perturbation;
use crate::core::space::Space;
use std::collections::BTreeMap;
use std::fmt;

/// A value stored under a name on a system, a forcefield, or a molecule.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    Number(f64),
    Text(String),
    /// One value per atom, e.g. partial charges.
    Values(Vec<f64>),
    Space(Space),
    Perturbations(Vec<Perturbation>),
}

impl Property {
    /// Numeric interpretation of the property, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Property::Number(v) => Some(*v),
            Property::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_values(&self) -> Option<&[f64]> {
        match self {
            Property::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_space(&self) -> Option<&Space> {
        match self {
            Property::Space(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_perturbations(&self) -> Option<&[Perturbation]> {
        match self {
            Property::Perturbations(p) => Some(p),
            _ => None,
        }
    }
}

impl From<f64> for Property {
    fn from(value: f64) -> Self {
        Property::Number(value)
    }
}

impl From<Space> for Property {
    fn from(space: Space) -> Self {
        Property::Space(space)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Number(v) => write!(f, "{}", v),
            Property::Text(t) => write!(f, "'{}'", t),
            Property::Values(v) => write!(f, "{:?}", v),
            Property::Space(s) => write!(f, "{:?}", s),
            Property::Perturbations(p) => write!(f, "[{} perturbation(s)]", p.len()),
        }
    }
}

/// Maps the default name of a property to the name actually used in a system.
///
/// Constraints look up properties such as `space` or `charge` through a map so
/// that the same constraint can be pointed at differently named data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertyMap(BTreeMap<String, String>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, default_name: &str, actual_name: &str) -> Self {
        self.0
            .insert(default_name.to_string(), actual_name.to_string());
        self
    }

    pub fn get<'a>(&'a self, default_name: &'a str) -> &'a str {
        self.0
            .get(default_name)
            .map(String::as_str)
            .unwrap_or(default_name)
    }
}
