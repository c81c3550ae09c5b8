use super::error::{ConstraintError, Violation};
use crate::core::models::delta::Delta;
use crate::core::models::ids::{SystemUid, Version};
use crate::core::models::system::System;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Binding {
    uid: SystemUid,
    version: Version,
    satisfied: bool,
}

/// The cached `(uid, version, satisfied)` triple every constraint carries.
///
/// A state is either unbound (never evaluated) or bound to one exact system
/// version. The evaluation counter records how many full recomputations have
/// happened, which is how tests observe that the cache is doing its job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintState {
    binding: Option<Binding>,
    evaluations: u64,
}

impl ConstraintState {
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn uid(&self) -> Option<SystemUid> {
        self.binding.map(|b| b.uid)
    }

    pub fn version(&self) -> Option<Version> {
        self.binding.map(|b| b.version)
    }

    /// Returns `true` if the cache is valid for exactly this system version.
    pub fn was_last_system(&self, system: &System) -> bool {
        self.binding
            .is_some_and(|b| b.uid == system.uid() && b.version == system.version())
    }

    /// Returns `true` if the cache is one committed step behind `system`.
    pub fn precedes(&self, system: &System) -> bool {
        self.binding.is_some_and(|b| {
            b.uid == system.uid() && b.version.immediately_precedes(system.version())
        })
    }

    pub fn last_was_satisfied(&self) -> bool {
        self.binding.is_some_and(|b| b.satisfied)
    }

    /// Records the outcome of a full evaluation against `system`.
    pub fn set_satisfied(&mut self, system: &System, satisfied: bool) {
        self.evaluations += 1;
        self.binding = Some(Binding {
            uid: system.uid(),
            version: system.version(),
            satisfied,
        });
    }

    pub fn set_unsatisfied(&mut self, system: &System) {
        self.set_satisfied(system, false);
    }

    /// Moves the binding forward to `system` after an incremental update.
    pub fn advance_to(&mut self, system: &System, satisfied: bool) {
        self.binding = Some(Binding {
            uid: system.uid(),
            version: system.version(),
            satisfied,
        });
    }

    pub fn clear_last_system(&mut self) {
        self.binding = None;
    }

    /// Number of full evaluations performed so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }
}

/// A rule the system must satisfy, able to compute the change that satisfies it.
///
/// Implementors cache their last evaluation in a [`ConstraintState`]. Every
/// query takes the system it is asked about; the cache is reused only while
/// that system's identity and version match the binding.
pub trait Constraint: fmt::Debug + fmt::Display + Send + Sync {
    /// Short name of the constraint kind, used in logs.
    fn kind(&self) -> &'static str;

    fn state(&self) -> &ConstraintState;

    fn state_mut(&mut self) -> &mut ConstraintState;

    fn clone_box(&self) -> Box<dyn Constraint>;

    fn as_any(&self) -> &dyn Any;

    /// Structural equality with another constraint, ignoring cached state.
    fn eq_dyn(&self, other: &dyn Constraint) -> bool;

    /// Fully re-evaluates the constraint against `system` and binds the cache to it.
    fn set_system(&mut self, system: &System) -> Result<(), ConstraintError>;

    /// Computes the delta that makes `system` satisfy this constraint.
    ///
    /// Must be idempotent: once the returned delta is committed, applying
    /// again yields an empty delta.
    fn apply(&mut self, system: &System) -> Result<Delta, ConstraintError>;

    /// Adjusts a delta that is about to be committed so that this constraint
    /// stays satisfied afterwards. The system is not touched.
    fn apply_with(&mut self, system: &System, delta: &Delta) -> Result<Delta, ConstraintError>;

    /// Returns `true` if committing `delta` could change this constraint's verdict.
    fn would_be_affected_by(&self, delta: &Delta) -> bool;

    /// Refreshes the cache from a delta that was just committed to `system`.
    ///
    /// The default rebinds without work when the delta is irrelevant and
    /// otherwise falls back to a full evaluation. Implementors with cheap
    /// incremental updates override this.
    fn accept(&mut self, system: &System, delta: &Delta) -> Result<(), ConstraintError> {
        if self.state().precedes(system) && !self.would_be_affected_by(delta) {
            let satisfied = self.state().last_was_satisfied();
            self.state_mut().advance_to(system, satisfied);
            Ok(())
        } else {
            self.set_system(system)
        }
    }

    fn is_satisfied(&mut self, system: &System) -> Result<bool, ConstraintError> {
        if !self.state().was_last_system(system) {
            self.set_system(system)?;
        }
        Ok(self.state().last_was_satisfied())
    }

    fn assert_satisfied(&mut self, system: &System) -> Result<(), ConstraintError> {
        if self.is_satisfied(system)? {
            return Ok(());
        }
        Err(ConstraintError::Violation {
            system: system.name().to_string(),
            violations: vec![Violation {
                index: 0,
                description: self.to_string(),
            }],
        })
    }

    /// Applies the constraint directly to `system`, returning what was committed.
    fn commit(&mut self, system: &mut System) -> Result<Delta, ConstraintError> {
        let delta = self.apply(system)?;
        if delta.is_empty() {
            return Ok(delta);
        }
        system.apply_delta(&delta)?;
        self.accept(system, &delta)?;
        Ok(delta)
    }

    fn clear_last_system(&mut self) {
        self.state_mut().clear_last_system();
    }
}

/// Implements the bookkeeping methods of [`Constraint`] for a type with a
/// `state: ConstraintState` field that is `Clone + PartialEq`.
macro_rules! constraint_boilerplate {
    ($kind:literal) => {
        fn kind(&self) -> &'static str {
            $kind
        }

        fn state(&self) -> &$crate::engine::constraint::ConstraintState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut $crate::engine::constraint::ConstraintState {
            &mut self.state
        }

        fn clone_box(&self) -> Box<dyn $crate::engine::constraint::Constraint> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn ::std::any::Any {
            self
        }

        fn eq_dyn(&self, other: &dyn $crate::engine::constraint::Constraint) -> bool {
            other
                .as_any()
                .downcast_ref::<Self>()
                .is_some_and(|other| self == other)
        }
    };
}
pub(crate) use constraint_boilerplate;

/// Always satisfied, never affected, contributes nothing.
#[derive(Debug, Clone, Default)]
pub struct NullConstraint {
    state: ConstraintState,
}

impl PartialEq for NullConstraint {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl Constraint for NullConstraint {
    constraint_boilerplate!("null");

    fn set_system(&mut self, _system: &System) -> Result<(), ConstraintError> {
        Ok(())
    }

    fn is_satisfied(&mut self, _system: &System) -> Result<bool, ConstraintError> {
        Ok(true)
    }

    fn apply(&mut self, _system: &System) -> Result<Delta, ConstraintError> {
        Ok(Delta::empty())
    }

    fn apply_with(&mut self, _system: &System, delta: &Delta) -> Result<Delta, ConstraintError> {
        Ok(delta.clone())
    }

    fn would_be_affected_by(&self, _delta: &Delta) -> bool {
        false
    }

    fn accept(&mut self, _system: &System, _delta: &Delta) -> Result<(), ConstraintError> {
        Ok(())
    }

    fn clear_last_system(&mut self) {}
}

impl fmt::Display for NullConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NullConstraint")
    }
}

static NULL_CONSTRAINT: OnceLock<ConstraintHandle> = OnceLock::new();

/// A shared, cheaply cloned, copy-on-write handle to a constraint.
#[derive(Debug, Clone)]
pub struct ConstraintHandle(Arc<dyn Constraint>);

impl ConstraintHandle {
    pub fn new(constraint: impl Constraint + 'static) -> Self {
        Self(Arc::new(constraint))
    }

    /// The process-wide null constraint, created on first use.
    pub fn null() -> Self {
        NULL_CONSTRAINT
            .get_or_init(|| ConstraintHandle::new(NullConstraint::default()))
            .clone()
    }

    /// Returns `true` if both handles share the same allocation.
    pub fn ptr_eq(&self, other: &ConstraintHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Mutable access, cloning the constraint first if the handle is shared.
    pub fn make_mut(&mut self) -> &mut dyn Constraint {
        if Arc::get_mut(&mut self.0).is_none() {
            self.0 = Arc::from(self.0.clone_box());
        }
        match Arc::get_mut(&mut self.0) {
            Some(constraint) => constraint,
            None => unreachable!("a freshly cloned constraint handle is unique"),
        }
    }
}

impl Deref for ConstraintHandle {
    type Target = dyn Constraint;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ConstraintHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.eq_dyn(other.0.as_ref())
    }
}

impl fmt::Display for ConstraintHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0.as_ref(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::{Expression, Symbol};
    use crate::engine::kinds::component::ComponentConstraint;
    use std::thread;

    fn system() -> System {
        let mut system = System::new("state");
        system.set_constant(Symbol::new("x"), 1.0).unwrap();
        system
    }

    #[test]
    fn state_tracks_binding_and_precedence() {
        let mut system = system();
        let mut state = ConstraintState::default();
        assert!(!state.is_bound());
        assert!(!state.was_last_system(&system));

        state.set_satisfied(&system, true);
        assert!(state.was_last_system(&system));
        assert!(state.last_was_satisfied());
        assert_eq!(state.evaluations(), 1);

        system.set_constant(Symbol::new("x"), 2.0).unwrap();
        assert!(!state.was_last_system(&system));
        assert!(state.precedes(&system));

        state.advance_to(&system, false);
        assert!(state.was_last_system(&system));
        assert!(!state.last_was_satisfied());
        assert_eq!(state.evaluations(), 1);

        state.clear_last_system();
        assert!(!state.is_bound());
        assert!(!state.last_was_satisfied());
    }

    #[test]
    fn clones_of_a_system_from_elsewhere_do_not_match() {
        let system = system();
        let other = System::new("state");
        let mut state = ConstraintState::default();
        state.set_unsatisfied(&system);
        assert!(state.was_last_system(&system.clone()));
        assert!(!state.was_last_system(&other));
        assert!(!state.precedes(&other));
    }

    #[test]
    fn null_constraint_is_a_shared_satisfied_no_op() {
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(ConstraintHandle::null))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert!(handles.windows(2).all(|w| w[0].ptr_eq(&w[1])));

        let system = system();
        let mut null = ConstraintHandle::null();
        let constraint = null.make_mut();
        assert!(constraint.is_satisfied(&system).unwrap());
        assert!(constraint.apply(&system).unwrap().is_empty());
        let delta = Delta::component(Symbol::new("x"), Some(1.0), 5.0);
        assert_eq!(constraint.apply_with(&system, &delta).unwrap(), delta);
        assert!(!constraint.would_be_affected_by(&delta));
    }

    #[test]
    fn make_mut_clones_shared_handles_only() {
        let system = system();
        let constraint =
            ComponentConstraint::new(Symbol::new("y"), Expression::symbol("x") * 2.0).unwrap();
        let original = ConstraintHandle::new(constraint);
        let mut copy = original.clone();
        assert!(copy.ptr_eq(&original));

        copy.make_mut().set_system(&system).unwrap();
        assert!(!copy.ptr_eq(&original));
        assert!(copy.state().is_bound());
        assert!(!original.state().is_bound());
        assert_eq!(copy, original);

        let unique = copy.clone();
        drop(unique);
        copy.make_mut().clear_last_system();
        assert!(!copy.state().is_bound());
    }
}
