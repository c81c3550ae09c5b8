//! Constraints on system components and properties.

pub mod component;
pub mod geometry;
pub mod property;
pub mod windowed;

use crate::core::expression::{Symbol, Values};
use crate::core::models::delta::Delta;
use crate::core::models::system::System;
use crate::core::models::system::SystemError;
use std::collections::BTreeSet;

/// Updates cached symbol values after `delta` was committed to `system`.
///
/// Constants are taken straight from the delta; derived components are
/// re-read from the system since the delta only carries constants.
fn refresh_values(
    values: &mut Values,
    symbols: &BTreeSet<Symbol>,
    system: &System,
    delta: &Delta,
) -> Result<(), SystemError> {
    for symbol in symbols {
        match delta.new_component(symbol) {
            Some(value) => values.set(symbol.clone(), value),
            None if !system.has_constant(symbol) => {
                values.set(symbol.clone(), system.component_value(symbol)?)
            }
            None => {}
        }
    }
    Ok(())
}

/// Symbol values as they would be once `delta` is committed to `system`.
fn values_after(
    symbols: &BTreeSet<Symbol>,
    system: &System,
    delta: &Delta,
) -> Result<Values, SystemError> {
    system.component_values_with(symbols, &delta.component_values())
}
