use crate::core::expression::{Expression, Symbol, Values};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{MolNum, Version};
use crate::core::models::system::{SPACE_PROPERTY, System, SystemError};
use crate::core::point::PointRef;
use crate::core::space::Space;
use crate::engine::constraint::{Constraint, ConstraintState};
use crate::engine::error::ConstraintError;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use tracing::trace;

/// A geometric quantity measured on a system, exposed as expression symbols.
pub trait Geometry: fmt::Debug + fmt::Display + Clone + PartialEq + Send + Sync + 'static {
    /// Name of the constraint built on this geometry.
    const NAME: &'static str;

    /// Symbols this geometry provides values for.
    fn symbols(&self) -> BTreeSet<Symbol>;

    /// Molecules whose coordinates the measurement reads.
    fn molecules(&self) -> Vec<MolNum>;

    fn values(&self, system: &System, space: &Space) -> Result<Values, SystemError>;
}

/// The distance `r` between two points.
///
/// Points on the same molecule are measured directly; any other pair is
/// measured through the minimum image of the system space.
#[derive(Debug, Clone, PartialEq)]
pub struct Distance {
    point0: PointRef,
    point1: PointRef,
    intra_molecule: bool,
}

impl Distance {
    pub const SYMBOL: &'static str = "r";

    pub fn new(point0: PointRef, point1: PointRef) -> Self {
        let intra_molecule = point0.same_molecule(&point1);
        Self {
            point0,
            point1,
            intra_molecule,
        }
    }

    pub fn is_intra_molecule(&self) -> bool {
        self.intra_molecule
    }

    pub fn distance(&self, system: &System, space: &Space) -> Result<f64, SystemError> {
        let p0 = self.point0.position(system)?;
        let p1 = self.point1.position(system)?;
        if self.intra_molecule {
            Ok(Space::direct_distance(&p0, &p1))
        } else {
            Ok(space.calc_dist(&p0, &p1))
        }
    }
}

impl Geometry for Distance {
    const NAME: &'static str = "DistanceComponent";

    fn symbols(&self) -> BTreeSet<Symbol> {
        BTreeSet::from([Symbol::new(Self::SYMBOL)])
    }

    fn molecules(&self) -> Vec<MolNum> {
        [self.point0.molecule(), self.point1.molecule()]
            .into_iter()
            .flatten()
            .collect()
    }

    fn values(&self, system: &System, space: &Space) -> Result<Values, SystemError> {
        Ok(Values::new().with(Self::SYMBOL, self.distance(system, space)?))
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r = |{} - {}|", self.point0, self.point1)
    }
}

/// Holds a component equal to an expression over a measured geometry.
///
/// The measurement is cached together with the versions of the molecules it
/// read and the space it used, and is only repeated when one of them changes.
#[derive(Debug, Clone)]
pub struct GeometryComponent<G> {
    constrained: Symbol,
    expression: Expression,
    geometry: G,
    space_property: String,
    component_symbols: BTreeSet<Symbol>,

    dependencies: BTreeSet<Symbol>,
    sources: Vec<Option<Version>>,
    space: Space,
    geometry_values: Values,
    expected: f64,
    current: Option<f64>,
    state: ConstraintState,
}

pub type DistanceComponent = GeometryComponent<Distance>;

impl GeometryComponent<Distance> {
    /// Constrains `constrained` to `expression`, which may read the distance as `r`.
    pub fn new(
        constrained: Symbol,
        point0: PointRef,
        point1: PointRef,
        expression: Expression,
    ) -> Result<Self, ConstraintError> {
        Self::from_geometry(constrained, Distance::new(point0, point1), expression)
    }
}

impl<G: Geometry> GeometryComponent<G> {
    pub fn from_geometry(
        constrained: Symbol,
        geometry: G,
        expression: Expression,
    ) -> Result<Self, ConstraintError> {
        if expression.depends_on(&constrained) || geometry.symbols().contains(&constrained) {
            return Err(ConstraintError::Incompatible(format!(
                "geometry component '{}' cannot depend on itself",
                constrained
            )));
        }
        let provided = geometry.symbols();
        let component_symbols: BTreeSet<Symbol> = expression
            .symbols()
            .into_iter()
            .filter(|s| !provided.contains(s))
            .collect();
        Ok(Self {
            constrained,
            expression,
            geometry,
            space_property: SPACE_PROPERTY.to_string(),
            dependencies: component_symbols.clone(),
            component_symbols,
            sources: Vec::new(),
            space: Space::default(),
            geometry_values: Values::new(),
            expected: f64::NAN,
            current: None,
            state: ConstraintState::default(),
        })
    }

    /// Reads the space from a property other than `space`.
    pub fn with_space_property(mut self, name: &str) -> Self {
        self.space_property = name.to_string();
        self
    }

    pub fn constrained(&self) -> &Symbol {
        &self.constrained
    }

    pub fn geometry(&self) -> &G {
        &self.geometry
    }

    /// The value the constrained component should hold, as last evaluated.
    pub fn expected(&self) -> f64 {
        self.expected
    }

    fn source_versions(&self, system: &System) -> Vec<Option<Version>> {
        self.geometry
            .molecules()
            .into_iter()
            .map(|m| system.molecule(m).ok().map(|mol| mol.version()))
            .collect()
    }

    /// Returns `true` if measuring the geometry on `system` could give different values.
    pub fn would_change(&self, system: &System) -> bool {
        let same_structure = self.state.uid() == Some(system.uid())
            && self
                .state
                .version()
                .is_some_and(|v| v.major == system.version().major);
        !same_structure
            || self.source_versions(system) != self.sources
            || system.space_named(&self.space_property) != self.space
    }

    fn ensure_current(&mut self, system: &System) -> Result<(), ConstraintError> {
        if !self.state.was_last_system(system) {
            self.set_system(system)?;
        }
        Ok(())
    }
}

impl<G: Geometry> PartialEq for GeometryComponent<G> {
    fn eq(&self, other: &Self) -> bool {
        self.constrained == other.constrained
            && self.expression == other.expression
            && self.geometry == other.geometry
            && self.space_property == other.space_property
    }
}

impl<G: Geometry> Constraint for GeometryComponent<G> {
    fn kind(&self) -> &'static str {
        G::NAME
    }

    fn state(&self) -> &ConstraintState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConstraintState {
        &mut self.state
    }

    fn clone_box(&self) -> Box<dyn Constraint> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn Constraint) -> bool {
        other
            .as_any()
            .downcast_ref::<Self>()
            .is_some_and(|other| self == other)
    }

    fn set_system(&mut self, system: &System) -> Result<(), ConstraintError> {
        if self.would_change(system) {
            let space = system.space_named(&self.space_property);
            self.geometry_values = self.geometry.values(system, &space)?;
            self.sources = self.source_versions(system);
            self.space = space;
        }
        self.dependencies = system.component_dependencies(&self.component_symbols)?;
        let mut values = self.geometry_values.clone();
        values.extend_from(&system.component_values(&self.component_symbols)?);
        self.expected = self.expression.evaluate(&values)?;
        self.current = system.constant(&self.constrained);

        let satisfied = self.current == Some(self.expected);
        trace!(constraint = %self, satisfied, "Evaluated geometry component");
        self.state.set_satisfied(system, satisfied);
        Ok(())
    }

    fn apply(&mut self, system: &System) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if self.state.last_was_satisfied() {
            return Ok(Delta::empty());
        }
        Ok(Delta::component(
            self.constrained.clone(),
            self.current,
            self.expected,
        ))
    }

    fn apply_with(&mut self, system: &System, delta: &Delta) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if !self.would_be_affected_by(delta) {
            return Ok(delta.clone());
        }
        let mut after = system.clone();
        after.apply_delta(delta)?;
        let mut hypothetical = self.clone();
        hypothetical.set_system(&after)?;
        if hypothetical.state.last_was_satisfied() {
            return Ok(delta.clone());
        }
        Ok(delta
            .clone()
            .with_component(self.constrained.clone(), self.current, hypothetical.expected))
    }

    fn would_be_affected_by(&self, delta: &Delta) -> bool {
        delta.involves_component(&self.constrained)
            || delta.involves_any_component(&self.dependencies)
            || delta.involves_property(&self.space_property)
            || self
                .geometry
                .molecules()
                .into_iter()
                .any(|m| delta.involves_molecule(m))
    }

    /// Sets the constrained component directly on the system.
    fn commit(&mut self, system: &mut System) -> Result<Delta, ConstraintError> {
        self.ensure_current(system)?;
        if self.state.last_was_satisfied() {
            return Ok(Delta::empty());
        }
        let old = self.current;
        system.set_constant(self.constrained.clone(), self.expected)?;
        self.current = Some(self.expected);
        self.state.advance_to(system, true);
        Ok(Delta::component(self.constrained.clone(), old, self.expected))
    }
}

impl<G: Geometry> fmt::Display for GeometryComponent<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}( {} == {} ; {} )",
            G::NAME,
            self.constrained,
            self.expression,
            self.geometry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::group::MoleculeGroup;
    use crate::core::models::ids::MGNum;
    use crate::core::models::molecule::{Molecule, Molecules};
    use nalgebra::{Point3, Vector3};

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    fn system() -> System {
        let mut system = System::new("geometry");
        let a = Molecule::new(
            MolNum(1),
            "A",
            vec![Point3::new(0.5, 0.0, 0.0), Point3::new(9.5, 0.0, 0.0)],
        );
        let b = Molecule::new(MolNum(2), "B", vec![Point3::new(9.0, 0.0, 0.0)]);
        system
            .add_group(MoleculeGroup::new(MGNum(1), "all").with_molecule(a).with_molecule(b))
            .unwrap();
        system.set_space(Space::periodic_box(10.0, 10.0, 10.0));
        system.set_constant(sym("d"), 0.0).unwrap();
        system
    }

    fn atom(molecule: u32, index: usize) -> PointRef {
        PointRef::Atom {
            molecule: MolNum(molecule),
            index,
        }
    }

    #[test]
    fn intra_molecule_distance_is_never_wrapped() {
        let mut system = system();
        let mut c =
            DistanceComponent::new(sym("d"), atom(1, 0), atom(1, 1), Expression::symbol("r"))
                .unwrap();
        assert!(c.geometry().is_intra_molecule());
        c.commit(&mut system).unwrap();
        assert_eq!(system.constant(&sym("d")), Some(9.0));
    }

    #[test]
    fn inter_molecule_distance_uses_minimum_image() {
        let mut system = system();
        let mut c =
            DistanceComponent::new(sym("d"), atom(1, 0), atom(2, 0), Expression::symbol("r"))
                .unwrap();
        assert!(!c.geometry().is_intra_molecule());
        c.commit(&mut system).unwrap();
        assert_eq!(system.constant(&sym("d")), Some(1.5));
        assert!(c.apply(&system).unwrap().is_empty());
    }

    #[test]
    fn missing_constant_is_unsatisfied() {
        let mut system = System::new("empty");
        system
            .add_group(
                MoleculeGroup::new(MGNum(1), "g")
                    .with_molecule(Molecule::new(MolNum(1), "A", vec![Point3::origin()])),
            )
            .unwrap();
        let mut c = DistanceComponent::new(
            sym("d"),
            atom(1, 0),
            PointRef::Absolute(Point3::new(3.0, 4.0, 0.0)),
            Expression::symbol("r") * 2.0,
        )
        .unwrap();
        assert!(!c.is_satisfied(&system).unwrap());
        assert_eq!(c.expected(), 10.0);
        c.commit(&mut system).unwrap();
        assert_eq!(system.constant(&sym("d")), Some(10.0));
    }

    #[test]
    fn moving_a_molecule_is_noticed() {
        let mut system = system();
        let mut c =
            DistanceComponent::new(sym("d"), atom(1, 0), atom(2, 0), Expression::symbol("r"))
                .unwrap();
        c.commit(&mut system).unwrap();
        assert!(!c.would_change(&system));

        let mut moved = system.molecule(MolNum(2)).unwrap().clone();
        moved.translate(&Vector3::new(-1.0, 0.0, 0.0));
        let delta = Delta::molecules(&Molecules::new(), Molecules::from(moved));
        assert!(c.would_be_affected_by(&delta));

        let adjusted = c.apply_with(&system, &delta).unwrap();
        assert_eq!(adjusted.new_component(&sym("d")), Some(2.5));
        assert_eq!(system.constant(&sym("d")), Some(1.5));

        system.apply_delta(&adjusted).unwrap();
        assert!(c.is_satisfied(&system).unwrap());
    }

    #[test]
    fn replacing_a_molecule_with_a_fresh_one_is_noticed() {
        let mut system = System::new("fresh");
        let a = Molecule::new(MolNum(1), "A", vec![Point3::origin()]);
        let b = Molecule::new(MolNum(2), "B", vec![Point3::new(3.0, 0.0, 0.0)]);
        system
            .add_group(MoleculeGroup::new(MGNum(1), "all").with_molecule(a).with_molecule(b))
            .unwrap();
        system.set_constant(sym("d"), 0.0).unwrap();

        let mut c =
            DistanceComponent::new(sym("d"), atom(1, 0), atom(2, 0), Expression::symbol("r"))
                .unwrap();
        c.commit(&mut system).unwrap();
        assert_eq!(system.constant(&sym("d")), Some(3.0));

        let fresh = Molecule::new(MolNum(2), "B", vec![Point3::new(5.0, 0.0, 0.0)]);
        assert!(system.update(&Molecules::from(fresh)).unwrap());
        assert!(c.would_change(&system));
        assert!(!c.is_satisfied(&system).unwrap());

        assert!(!c.commit(&mut system).unwrap().is_empty());
        assert_eq!(system.constant(&sym("d")), Some(5.0));
    }

    #[test]
    fn constrained_symbol_may_not_be_the_distance() {
        let err = DistanceComponent::new(sym("r"), atom(1, 0), atom(2, 0), Expression::symbol("r"))
            .unwrap_err();
        assert!(matches!(err, ConstraintError::Incompatible(_)));
    }
}
