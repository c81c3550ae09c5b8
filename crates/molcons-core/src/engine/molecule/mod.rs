//! Constraints that keep molecules themselves consistent.
//!
//! A molecule constraint answers one question: which molecules must be
//! replaced, and by what, for the constraint to hold? The answer feeds the
//! container's molecule resolution loop, which commits the replacements and
//! asks again until nobody wants to change anything.

pub mod charge;
pub mod identity;
pub mod perturbation;
pub mod space_wrapper;

use crate::core::models::delta::Delta;
use crate::core::models::ids::{MolNum, SystemUid, Version};
use crate::core::models::molecule::Molecules;
use crate::core::models::system::System;
use crate::engine::constraint::Constraint;
use crate::engine::error::ConstraintError;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

pub trait MoleculeConstraint: Constraint {
    fn clone_molecule_box(&self) -> Box<dyn MoleculeConstraint>;

    fn as_constraint(&self) -> &dyn Constraint;

    /// The molecules that must replace their current versions in `system`.
    fn update(&mut self, system: &System) -> Result<Molecules, ConstraintError>;

    /// Like [`update`](Self::update), hinted that only `molnum` changed since the last call.
    fn update_for_molecule(
        &mut self,
        system: &System,
        _molnum: MolNum,
    ) -> Result<Molecules, ConstraintError> {
        self.update(system)
    }

    /// Like [`update`](Self::update), hinted that only `molecules` changed since the last call.
    fn update_for_molecules(
        &mut self,
        system: &System,
        _molecules: &Molecules,
    ) -> Result<Molecules, ConstraintError> {
        self.update(system)
    }
}

/// The system identity and version a molecule constraint last synchronised with.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SyncState {
    uid: Option<SystemUid>,
    version: Option<Version>,
}

impl SyncState {
    pub fn is_synced(&self, system: &System) -> bool {
        self.uid == Some(system.uid()) && self.version == Some(system.version())
    }

    /// Returns `true` unless the last sync was against the same system with the same structure.
    pub fn structure_changed(&self, system: &System) -> bool {
        self.uid != Some(system.uid())
            || self.version.map(|v| v.major) != Some(system.version().major)
    }

    pub fn sync(&mut self, system: &System) {
        self.uid = Some(system.uid());
        self.version = Some(system.version());
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Delta replacing each molecule of `changes`, with old snapshots taken from `system`.
pub(crate) fn molecule_delta(system: &System, changes: Molecules) -> Result<Delta, ConstraintError> {
    changes
        .into_iter()
        .try_fold(Delta::empty(), |delta, molecule| {
            let old = system.molecule(molecule.number())?;
            Ok(delta.with_molecule(Some(old), molecule))
        })
}

/// Folds into `delta` the molecules `constraint` would change once `delta` is committed.
///
/// Works on a copy of both the system and the constraint, so neither is touched.
pub(crate) fn apply_with_hypothetical<C>(
    constraint: &C,
    system: &System,
    delta: &Delta,
) -> Result<Delta, ConstraintError>
where
    C: MoleculeConstraint + Clone,
{
    let mut after = system.clone();
    after.apply_delta(delta)?;
    let mut hypothetical = constraint.clone();
    let changes = hypothetical.update(&after)?;
    Ok(changes.into_iter().fold(delta.clone(), |delta, molecule| {
        let old = system.molecule(molecule.number()).ok();
        delta.with_molecule(old, molecule)
    }))
}

/// Implements [`Constraint`] for a molecule constraint in terms of its
/// [`MoleculeConstraint::update`]. The type needs a `state` field, `Clone`,
/// `PartialEq` and an inherent `affected_by(&self, &Delta) -> bool`.
macro_rules! molecule_constraint_impl {
    ($ty:ty, $kind:literal) => {
        impl $crate::engine::constraint::Constraint for $ty {
            $crate::engine::constraint::constraint_boilerplate!($kind);

            fn set_system(
                &mut self,
                system: &$crate::core::models::system::System,
            ) -> Result<(), $crate::engine::error::ConstraintError> {
                let changes =
                    $crate::engine::molecule::MoleculeConstraint::update(self, system)?;
                let satisfied = changes.is_empty();
                ::tracing::trace!(constraint = %self, satisfied, "Evaluated molecule constraint");
                self.state.set_satisfied(system, satisfied);
                Ok(())
            }

            fn apply(
                &mut self,
                system: &$crate::core::models::system::System,
            ) -> Result<
                $crate::core::models::delta::Delta,
                $crate::engine::error::ConstraintError,
            > {
                let changes =
                    $crate::engine::molecule::MoleculeConstraint::update(self, system)?;
                self.state.set_satisfied(system, changes.is_empty());
                $crate::engine::molecule::molecule_delta(system, changes)
            }

            fn apply_with(
                &mut self,
                system: &$crate::core::models::system::System,
                delta: &$crate::core::models::delta::Delta,
            ) -> Result<
                $crate::core::models::delta::Delta,
                $crate::engine::error::ConstraintError,
            > {
                $crate::engine::molecule::apply_with_hypothetical(self, system, delta)
            }

            fn would_be_affected_by(&self, delta: &$crate::core::models::delta::Delta) -> bool {
                self.affected_by(delta)
            }
        }
    };
}
pub(crate) use molecule_constraint_impl;

/// The upcasting methods of [`MoleculeConstraint`] for a `Clone` type.
macro_rules! molecule_constraint_boilerplate {
    () => {
        fn clone_molecule_box(&self) -> Box<dyn $crate::engine::molecule::MoleculeConstraint> {
            Box::new(self.clone())
        }

        fn as_constraint(&self) -> &dyn $crate::engine::constraint::Constraint {
            self
        }
    };
}
pub(crate) use molecule_constraint_boilerplate;

/// A shared, cheaply cloned, copy-on-write handle to a molecule constraint.
#[derive(Debug, Clone)]
pub struct MoleculeConstraintHandle(Arc<dyn MoleculeConstraint>);

impl MoleculeConstraintHandle {
    pub fn new(constraint: impl MoleculeConstraint + 'static) -> Self {
        Self(Arc::new(constraint))
    }

    pub fn ptr_eq(&self, other: &MoleculeConstraintHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Mutable access, cloning the constraint first if the handle is shared.
    pub fn make_mut(&mut self) -> &mut dyn MoleculeConstraint {
        if Arc::get_mut(&mut self.0).is_none() {
            self.0 = Arc::from(self.0.clone_molecule_box());
        }
        match Arc::get_mut(&mut self.0) {
            Some(constraint) => constraint,
            None => unreachable!("a freshly cloned constraint handle is unique"),
        }
    }
}

impl Deref for MoleculeConstraintHandle {
    type Target = dyn MoleculeConstraint;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for MoleculeConstraintHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.eq_dyn(other.0.as_constraint())
    }
}

impl fmt::Display for MoleculeConstraintHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0.as_ref(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::group::MoleculeGroup;
    use crate::core::models::ids::MGNum;
    use crate::core::models::molecule::Molecule;
    use nalgebra::Point3;

    #[test]
    fn sync_state_distinguishes_content_and_structure_changes() {
        let mut system = System::new("sync");
        system.add_group(MoleculeGroup::new(MGNum(1), "g")).unwrap();
        let mut sync = SyncState::default();
        assert!(sync.structure_changed(&system));

        sync.sync(&system);
        assert!(sync.is_synced(&system));
        assert!(!sync.structure_changed(&system));

        system.set_property("note", crate::core::models::property::Property::Text("x".into()));
        assert!(!sync.is_synced(&system));
        assert!(!sync.structure_changed(&system));

        system
            .add_molecule(MGNum(1), Molecule::new(MolNum(1), "A", vec![Point3::origin()]))
            .unwrap();
        assert!(sync.structure_changed(&system));

        sync.clear();
        assert!(!sync.is_synced(&system));
    }
}
