use crate::core::expression::{Expression, ExpressionError, Symbol};
use crate::core::models::group::MoleculeGroup;
use crate::core::models::ids::{FFId, FFIdx, MGNum, MolNum};
use crate::core::models::molecule::Molecule;
use crate::core::models::property::Property;
use crate::core::models::system::{ForceField, System, SystemError};
use crate::core::perturbation::{Perturbation, PerturbationError};
use crate::core::point::PointRef;
use crate::core::space::Space;
use nalgebra::Point3;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// The scenario format version this build reads.
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

/// Molecule property that receives the perturbations listed in a scenario.
const PERTURBATIONS_PROPERTY: &str = "perturbations";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Scenario format version {found} is not supported (this build reads version {supported})")]
    VersionMismatch { found: u32, supported: u32 },
    #[error("Invalid expression for {context}: {source}")]
    Expression {
        context: String,
        source: ExpressionError,
    },
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Perturbation(#[from] PerturbationError),
}

/// A constraint as described in a scenario, with expressions already parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintSpec {
    Property {
        property: String,
        forcefield: Option<FFId>,
        expression: Expression,
    },
    Component {
        symbol: Symbol,
        expression: Expression,
    },
    Windowed {
        symbol: Symbol,
        reference: Symbol,
        values: Vec<f64>,
        step: isize,
    },
    Distance {
        symbol: Symbol,
        point0: PointRef,
        point1: PointRef,
        expression: Expression,
    },
    Perturbation {
        group: MGNum,
        property: Option<String>,
    },
    SpaceWrapper {
        group: MGNum,
        point: PointRef,
    },
    Identity {
        group: MGNum,
        points: Vec<PointRef>,
        nbuffer: Option<usize>,
    },
    PolariseCharges {
        group: MGNum,
    },
}

/// Optional overrides of the iteration budgets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ApplySettings {
    pub max_passes: Option<usize>,
    pub max_molecule_passes: Option<usize>,
}

/// A system together with the constraints to apply to it.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub system: System,
    pub constraints: Vec<ConstraintSpec>,
    pub apply: ApplySettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct VersionHeader {
    format_version: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawScenario {
    #[allow(dead_code)]
    format_version: u32,
    system: RawSystem,
    #[serde(default)]
    forcefields: Vec<RawForceField>,
    #[serde(default)]
    groups: Vec<RawGroup>,
    #[serde(default)]
    constraints: Vec<RawConstraint>,
    #[serde(default)]
    apply: ApplySettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawSystem {
    name: String,
    #[serde(default)]
    space: Space,
    #[serde(default)]
    constants: BTreeMap<String, f64>,
    #[serde(default)]
    components: BTreeMap<String, String>,
    #[serde(default)]
    properties: BTreeMap<String, RawProperty>,
}

#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum RawProperty {
    Number(f64),
    Values(Vec<f64>),
    Text(String),
}

impl From<RawProperty> for Property {
    fn from(raw: RawProperty) -> Self {
        match raw {
            RawProperty::Number(v) => Property::Number(v),
            RawProperty::Values(v) => Property::Values(v),
            RawProperty::Text(t) => Property::Text(t),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawForceField {
    name: String,
    #[serde(default)]
    properties: BTreeMap<String, RawProperty>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGroup {
    number: MGNum,
    name: String,
    #[serde(default)]
    molecules: Vec<RawMolecule>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMolecule {
    number: MolNum,
    name: String,
    coordinates: Vec<[f64; 3]>,
    #[serde(default)]
    properties: BTreeMap<String, RawProperty>,
    #[serde(default)]
    perturbations: Vec<RawPerturbation>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPerturbation {
    property: String,
    initial: RawProperty,
    #[serde(rename = "final")]
    final_value: RawProperty,
    mapping: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Absolute { absolute: [f64; 3] },
    Atom { molecule: MolNum, atom: usize },
    Center { molecule: MolNum },
}

impl From<RawPoint> for PointRef {
    fn from(raw: RawPoint) -> Self {
        match raw {
            RawPoint::Absolute { absolute } => PointRef::Absolute(Point3::from(absolute)),
            RawPoint::Atom { molecule, atom } => PointRef::Atom {
                molecule,
                index: atom,
            },
            RawPoint::Center { molecule } => PointRef::Center { molecule },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawForceFieldId {
    Index(usize),
    Name(String),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
enum RawConstraint {
    Property {
        property: String,
        forcefield: Option<RawForceFieldId>,
        expression: String,
    },
    Component {
        symbol: String,
        expression: String,
    },
    Windowed {
        symbol: String,
        reference: String,
        values: Vec<f64>,
        step: isize,
    },
    Distance {
        symbol: String,
        point0: RawPoint,
        point1: RawPoint,
        #[serde(default = "distance_expression")]
        expression: String,
    },
    Perturbation {
        group: MGNum,
        property: Option<String>,
    },
    SpaceWrapper {
        group: MGNum,
        point: RawPoint,
    },
    Identity {
        group: MGNum,
        points: Vec<RawPoint>,
        nbuffer: Option<usize>,
    },
    PolariseCharges {
        group: MGNum,
    },
}

fn distance_expression() -> String {
    "r".to_string()
}

fn parse_expression(text: &str, context: impl FnOnce() -> String) -> Result<Expression, ScenarioError> {
    Expression::parse(text).map_err(|source| ScenarioError::Expression {
        context: context(),
        source,
    })
}

impl RawConstraint {
    fn into_spec(self, index: usize) -> Result<ConstraintSpec, ScenarioError> {
        let context = || format!("constraint {}", index);
        Ok(match self {
            RawConstraint::Property {
                property,
                forcefield,
                expression,
            } => ConstraintSpec::Property {
                property,
                forcefield: forcefield.map(|id| match id {
                    RawForceFieldId::Index(i) => FFId::Index(FFIdx(i)),
                    RawForceFieldId::Name(name) => FFId::Name(name),
                }),
                expression: parse_expression(&expression, context)?,
            },
            RawConstraint::Component { symbol, expression } => ConstraintSpec::Component {
                symbol: Symbol::new(symbol),
                expression: parse_expression(&expression, context)?,
            },
            RawConstraint::Windowed {
                symbol,
                reference,
                values,
                step,
            } => ConstraintSpec::Windowed {
                symbol: Symbol::new(symbol),
                reference: Symbol::new(reference),
                values,
                step,
            },
            RawConstraint::Distance {
                symbol,
                point0,
                point1,
                expression,
            } => ConstraintSpec::Distance {
                symbol: Symbol::new(symbol),
                point0: point0.into(),
                point1: point1.into(),
                expression: parse_expression(&expression, context)?,
            },
            RawConstraint::Perturbation { group, property } => {
                ConstraintSpec::Perturbation { group, property }
            }
            RawConstraint::SpaceWrapper { group, point } => ConstraintSpec::SpaceWrapper {
                group,
                point: point.into(),
            },
            RawConstraint::Identity {
                group,
                points,
                nbuffer,
            } => ConstraintSpec::Identity {
                group,
                points: points.into_iter().map(PointRef::from).collect(),
                nbuffer,
            },
            RawConstraint::PolariseCharges { group } => ConstraintSpec::PolariseCharges { group },
        })
    }
}

impl RawMolecule {
    fn into_molecule(self) -> Result<Molecule, ScenarioError> {
        let coordinates = self.coordinates.into_iter().map(Point3::from).collect();
        let mut molecule = Molecule::new(self.number, &self.name, coordinates);
        for (name, value) in self.properties {
            molecule = molecule.with_property(&name, Property::from(value));
        }
        if !self.perturbations.is_empty() {
            let number = self.number;
            let perturbations = self
                .perturbations
                .into_iter()
                .map(|raw| {
                    let perturbation =
                        Perturbation::new(&raw.property, raw.initial.into(), raw.final_value.into())?;
                    Ok(match raw.mapping {
                        Some(text) => perturbation.with_mapping(parse_expression(&text, || {
                            format!("perturbation of '{}' on {}", raw.property, number)
                        })?),
                        None => perturbation,
                    })
                })
                .collect::<Result<Vec<_>, ScenarioError>>()?;
            molecule = molecule.with_property(
                PERTURBATIONS_PROPERTY,
                Property::Perturbations(perturbations),
            );
        }
        Ok(molecule)
    }
}

impl RawScenario {
    fn into_scenario(self) -> Result<Scenario, ScenarioError> {
        let mut system = System::new(&self.system.name);
        system.set_space(self.system.space);
        for (name, value) in self.system.constants {
            system.set_constant(Symbol::new(name), value)?;
        }
        for (name, text) in self.system.components {
            let expression = parse_expression(&text, || format!("component '{}'", name))?;
            system.set_component_expression(Symbol::new(name), expression)?;
        }
        for (name, value) in self.system.properties {
            system.set_property(&name, value.into());
        }

        for raw in self.forcefields {
            let forcefield = raw
                .properties
                .into_iter()
                .fold(ForceField::new(&raw.name), |ff, (name, value)| {
                    ff.with_property(&name, Property::from(value))
                });
            system.add_forcefield(forcefield);
        }

        for raw in self.groups {
            let mut group = MoleculeGroup::new(raw.number, &raw.name);
            for molecule in raw.molecules {
                group = group.with_molecule(molecule.into_molecule()?);
            }
            system.add_group(group)?;
        }

        let constraints = self
            .constraints
            .into_iter()
            .enumerate()
            .map(|(i, raw)| raw.into_spec(i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Scenario {
            system,
            constraints,
            apply: self.apply,
        })
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let origin = path.to_string_lossy().to_string();
        let content = std::fs::read_to_string(path).map_err(|e| ScenarioError::Io {
            path: origin.clone(),
            source: e,
        })?;
        Self::parse(&content, &origin)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ScenarioError> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, origin: &str) -> Result<Self, ScenarioError> {
        let toml_error = |source| ScenarioError::Toml {
            path: origin.to_string(),
            source,
        };
        let header: VersionHeader = toml::from_str(content).map_err(toml_error)?;
        if header.format_version != SUPPORTED_FORMAT_VERSION {
            return Err(ScenarioError::VersionMismatch {
                found: header.format_version,
                supported: SUPPORTED_FORMAT_VERSION,
            });
        }
        let raw: RawScenario = toml::from_str(content).map_err(toml_error)?;
        raw.into_scenario()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
format-version = 1

[system]
name = "solvated ligand"
space = { type = "periodic-box", dimensions = [20.0, 20.0, 20.0] }
constants = { lambda = 0.25, x = 2 }
components = { half_lambda = "lambda / 2" }
properties = { note = "test", cutoff = 8.0 }

[[forcefields]]
name = "intra"
properties = { scale = 1.0 }

[[groups]]
number = 1
name = "ligand"

[[groups.molecules]]
number = 1
name = "LIG"
coordinates = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]
properties = { charge = [0.5, -0.5] }
perturbations = [{ property = "charge", initial = [0.5, -0.5], final = [0.0, 0.0] }]

[[groups]]
number = 2
name = "solvent"

[[groups.molecules]]
number = 2
name = "WAT"
coordinates = [[25.0, 0.0, 0.0]]

[[constraints]]
type = "component"
symbol = "y"
expression = "x * 2"

[[constraints]]
type = "property"
property = "scale"
forcefield = "intra"
expression = "1 - lambda"

[[constraints]]
type = "windowed"
symbol = "lambda"
reference = "x"
values = [0.0, 0.5, 1.0]
step = 1

[[constraints]]
type = "distance"
symbol = "d"
point0 = { molecule = 1, atom = 0 }
point1 = { molecule = 2 }

[[constraints]]
type = "perturbation"
group = 1

[[constraints]]
type = "space-wrapper"
group = 2
point = { absolute = [0.0, 0.0, 0.0] }

[[constraints]]
type = "identity"
group = 2
points = [{ molecule = 1 }]
nbuffer = 2

[[constraints]]
type = "polarise-charges"
group = 1

[apply]
max-passes = 5
"#;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_scenario_loads_from_file() {
        let file = write_temp(FULL);
        let scenario = Scenario::load(file.path()).unwrap();
        let system = &scenario.system;

        assert_eq!(system.name(), "solvated ligand");
        assert!(system.space().is_periodic());
        assert_eq!(system.constant(&Symbol::new("x")), Some(2.0));
        assert_eq!(system.component_value(&Symbol::new("half_lambda")).unwrap(), 0.125);
        assert_eq!(system.property("cutoff"), Some(&Property::Number(8.0)));
        assert_eq!(system.forcefields().len(), 1);
        assert_eq!(system.groups().count(), 2);

        let ligand = system.molecule(MolNum(1)).unwrap();
        assert_eq!(ligand.n_atoms(), 2);
        assert_eq!(
            ligand
                .property(PERTURBATIONS_PROPERTY)
                .and_then(Property::as_perturbations)
                .map(|p| p.len()),
            Some(1)
        );

        assert_eq!(scenario.constraints.len(), 8);
        assert_eq!(
            scenario.constraints[3],
            ConstraintSpec::Distance {
                symbol: Symbol::new("d"),
                point0: PointRef::Atom {
                    molecule: MolNum(1),
                    index: 0
                },
                point1: PointRef::Center { molecule: MolNum(2) },
                expression: Expression::symbol("r"),
            }
        );
        assert!(matches!(
            &scenario.constraints[1],
            ConstraintSpec::Property { forcefield: Some(FFId::Name(name)), .. } if name == "intra"
        ));
        assert_eq!(scenario.apply.max_passes, Some(5));
        assert_eq!(scenario.apply.max_molecule_passes, None);
    }

    #[test]
    fn unsupported_format_version_is_rejected_before_parsing_the_rest() {
        let err = Scenario::from_toml_str("format-version = 2\n[system]\nunknown = 1\n").unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::VersionMismatch {
                found: 2,
                supported: SUPPORTED_FORMAT_VERSION
            }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = Scenario::from_toml_str(
            "format-version = 1\n[system]\nname = \"s\"\ncolour = \"blue\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Toml { .. }));
    }

    #[test]
    fn bad_expressions_name_their_constraint() {
        let content = r#"
format-version = 1
[system]
name = "s"

[[constraints]]
type = "component"
symbol = "y"
expression = "x * * 2"
"#;
        let err = Scenario::from_toml_str(content).unwrap_err();
        match err {
            ScenarioError::Expression { context, .. } => assert_eq!(context, "constraint 0"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn incompatible_perturbation_is_reported() {
        let content = r#"
format-version = 1
[system]
name = "s"

[[groups]]
number = 1
name = "g"

[[groups.molecules]]
number = 1
name = "A"
coordinates = [[0.0, 0.0, 0.0]]
perturbations = [{ property = "charge", initial = 1.0, final = [0.0] }]
"#;
        let err = Scenario::from_toml_str(content).unwrap_err();
        assert!(matches!(err, ScenarioError::Perturbation(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scenario::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ScenarioError::Io { .. }));
    }
}
