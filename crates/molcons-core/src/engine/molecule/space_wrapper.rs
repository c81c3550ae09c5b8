use super::{MoleculeConstraint, SyncState, molecule_constraint_boilerplate, molecule_constraint_impl};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{MGNum, MolNum};
use crate::core::models::molecule::{Molecule, Molecules};
use crate::core::models::property::PropertyMap;
use crate::core::models::system::{SPACE_PROPERTY, System};
use crate::core::point::PointRef;
use crate::core::space::Space;
use crate::engine::constraint::ConstraintState;
use crate::engine::error::ConstraintError;
use nalgebra::Point3;
use std::collections::BTreeSet;
use std::fmt;

/// Keeps every molecule of a group in the periodic image nearest a reference point.
///
/// Molecules are moved whole, by the lattice translation that brings their
/// geometric centre closest to the point. In a non-periodic space nothing moves.
#[derive(Debug, Clone)]
pub struct SpaceWrapper {
    point: PointRef,
    mgnum: MGNum,
    map: PropertyMap,

    sync: SyncState,
    members: BTreeSet<MolNum>,
    state: ConstraintState,
}

impl SpaceWrapper {
    pub fn new(point: PointRef, mgnum: MGNum) -> Self {
        Self::with_map(point, mgnum, PropertyMap::new())
    }

    /// Reads the space through `map` (key `space`).
    pub fn with_map(point: PointRef, mgnum: MGNum, map: PropertyMap) -> Self {
        Self {
            point,
            mgnum,
            map,
            sync: SyncState::default(),
            members: BTreeSet::new(),
            state: ConstraintState::default(),
        }
    }

    pub fn point(&self) -> &PointRef {
        &self.point
    }

    pub fn mgnum(&self) -> MGNum {
        self.mgnum
    }

    fn space_property(&self) -> &str {
        self.map.get(SPACE_PROPERTY)
    }

    fn wrapped(space: &Space, reference: &Point3<f64>, molecule: &Molecule) -> Option<Molecule> {
        let shift = space.translation_to_nearest_image(reference, &molecule.center());
        if shift.iter().all(|c| *c == 0.0) {
            return None;
        }
        let mut moved = molecule.clone();
        moved.translate(&shift);
        Some(moved)
    }

    fn wrap(
        &mut self,
        system: &System,
        only: Option<&BTreeSet<MolNum>>,
    ) -> Result<Molecules, ConstraintError> {
        let group = system.group(self.mgnum)?;
        self.members = group.molecules().numbers().collect();
        let space = system.space_named(self.space_property());
        let mut changes = Molecules::new();
        if space.is_periodic() {
            let reference = self.point.position(system)?;
            for molecule in group.molecules().iter() {
                if only.is_some_and(|only| !only.contains(&molecule.number())) {
                    continue;
                }
                if let Some(moved) = Self::wrapped(&space, &reference, molecule) {
                    changes.insert(moved);
                }
            }
        }
        self.sync.sync(system);
        Ok(changes)
    }

    /// A hint is only trusted if the previous sync was one content edit ago
    /// and the reference point itself did not move.
    fn can_use_hint(&self, system: &System, hinted: &BTreeSet<MolNum>) -> bool {
        !self.sync.structure_changed(system)
            && self
                .point
                .molecule()
                .is_none_or(|m| !hinted.contains(&m))
    }

    fn affected_by(&self, delta: &Delta) -> bool {
        delta.involves_property(self.space_property())
            || self.point.molecule().is_some_and(|m| delta.involves_molecule(m))
            || self.members.iter().any(|m| delta.involves_molecule(*m))
    }
}

impl PartialEq for SpaceWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point && self.mgnum == other.mgnum && self.map == other.map
    }
}

molecule_constraint_impl!(SpaceWrapper, "space-wrapper");

impl MoleculeConstraint for SpaceWrapper {
    molecule_constraint_boilerplate!();

    fn update(&mut self, system: &System) -> Result<Molecules, ConstraintError> {
        self.wrap(system, None)
    }

    fn update_for_molecule(
        &mut self,
        system: &System,
        molnum: MolNum,
    ) -> Result<Molecules, ConstraintError> {
        let hinted = BTreeSet::from([molnum]);
        if self.can_use_hint(system, &hinted) {
            self.wrap(system, Some(&hinted))
        } else {
            self.wrap(system, None)
        }
    }

    fn update_for_molecules(
        &mut self,
        system: &System,
        molecules: &Molecules,
    ) -> Result<Molecules, ConstraintError> {
        let hinted: BTreeSet<MolNum> = molecules.numbers().collect();
        if self.can_use_hint(system, &hinted) {
            self.wrap(system, Some(&hinted))
        } else {
            self.wrap(system, None)
        }
    }
}

impl fmt::Display for SpaceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceWrapper( {} around {} )", self.mgnum, self.point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::group::MoleculeGroup;
    use crate::engine::constraint::Constraint;

    fn system() -> System {
        let mut system = System::new("box");
        system.set_space(Space::periodic_box(10.0, 10.0, 10.0));
        let group = MoleculeGroup::new(MGNum(1), "solvent")
            .with_molecule(Molecule::new(
                MolNum(1),
                "WAT",
                vec![Point3::new(12.0, 1.0, 1.0), Point3::new(13.0, 1.0, 1.0)],
            ))
            .with_molecule(Molecule::new(MolNum(2), "WAT", vec![Point3::new(1.0, -7.0, 2.0)]))
            .with_molecule(Molecule::new(MolNum(3), "WAT", vec![Point3::new(1.0, 1.0, 1.0)]));
        system.add_group(group).unwrap();
        system
    }

    #[test]
    fn molecules_are_wrapped_whole_into_the_nearest_image() {
        let mut system = system();
        let mut c = SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1));
        let delta = c.commit(&mut system).unwrap();
        assert!(!delta.involves_molecule(MolNum(3)));

        let one = system.molecule(MolNum(1)).unwrap();
        assert_eq!(
            one.coordinates(),
            &[Point3::new(2.0, 1.0, 1.0), Point3::new(3.0, 1.0, 1.0)]
        );
        let two = system.molecule(MolNum(2)).unwrap();
        assert_eq!(two.coordinates(), &[Point3::new(1.0, 3.0, 2.0)]);
    }

    #[test]
    fn wrapping_is_idempotent() {
        let mut system = system();
        let mut c = SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1));
        c.commit(&mut system).unwrap();
        assert!(c.apply(&system).unwrap().is_empty());
        assert!(c.update(&system).unwrap().is_empty());
        assert!(c.is_satisfied(&system).unwrap());
    }

    #[test]
    fn cartesian_space_never_moves_anything() {
        let mut system = system();
        system.set_space(Space::Cartesian);
        let mut c = SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1));
        assert!(c.is_satisfied(&system).unwrap());
    }

    #[test]
    fn molecule_hint_limits_the_work() {
        let system = system();
        let mut c = SpaceWrapper::new(PointRef::Absolute(Point3::origin()), MGNum(1));
        c.update(&system).unwrap();
        let changes = c.update_for_molecule(&system, MolNum(2)).unwrap();
        assert_eq!(changes.numbers().collect::<Vec<_>>(), vec![MolNum(2)]);
    }

    #[test]
    fn reference_point_can_follow_a_molecule() {
        let mut system = system();
        let mut c = SpaceWrapper::new(PointRef::Center { molecule: MolNum(1) }, MGNum(1));
        c.commit(&mut system).unwrap();
        let three = system.molecule(MolNum(3)).unwrap();
        assert_eq!(three.coordinates(), &[Point3::new(11.0, 1.0, 1.0)]);
        assert_eq!(
            system.molecule(MolNum(1)).unwrap().coordinates()[0],
            Point3::new(12.0, 1.0, 1.0)
        );
    }
}
