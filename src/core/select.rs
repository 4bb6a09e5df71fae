//! Select predicates: the built-in match rule and the registry of named
//! user predicates.
//!
//! User predicates are registered once at startup under a name; the wire
//! protocol transports the name (plus library/class hints that only native
//! hosts interpret). A host that cannot resolve the name rejects station
//! creation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::constants::STATION_SELECT_INTS;
use crate::core::event::Event;
use crate::core::station::StationConfig;

/// A user predicate: does this station want this event?
pub type SelectFn = dyn Fn(&Event, &StationConfig) -> bool + Send + Sync;

/// The built-in match rule: at every position where the station's select
/// word is nonzero, the bitwise AND with the event's control word must be
/// nonzero too.
pub fn select_matches(
    select: &[i32; STATION_SELECT_INTS],
    control: &[i32; STATION_SELECT_INTS],
) -> bool {
    for i in 0..STATION_SELECT_INTS {
        if select[i] != 0 && (select[i] & control[i]) == 0 {
            return false;
        }
    }
    true
}

/// Named user predicates, resolved at station creation.
#[derive(Default)]
pub struct SelectRegistry {
    funcs: RwLock<HashMap<String, Arc<SelectFn>>>,
}

impl SelectRegistry {
    pub fn new() -> SelectRegistry {
        SelectRegistry::default()
    }

    pub fn register<F>(&self, name: &str, func: F)
    where
        F: Fn(&Event, &StationConfig) -> bool + Send + Sync + 'static,
    {
        self.funcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(func));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Run the named predicate. An unknown name accepts nothing.
    pub fn eval(&self, name: &str, event: &Event, config: &StationConfig) -> bool {
        let func = self
            .funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match func {
            Some(f) => f(event, config),
            None => false,
        }
    }
}

impl std::fmt::Debug for SelectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("SelectRegistry").field("funcs", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_requires_overlap_at_every_nonzero_word() {
        let mut select = [0; STATION_SELECT_INTS];
        select[0] = 0b0110;
        select[2] = 0b1000;

        let mut control = [0; STATION_SELECT_INTS];
        control[0] = 0b0010;
        control[2] = 0b1000;
        assert!(select_matches(&select, &control));

        control[2] = 0b0111;
        assert!(!select_matches(&select, &control));
    }

    #[test]
    fn test_zero_select_vector_matches_everything() {
        let select = [0; STATION_SELECT_INTS];
        let control = [i32::MIN; STATION_SELECT_INTS];
        assert!(select_matches(&select, &control));
    }

    #[test]
    fn test_registry_resolves_and_evaluates() {
        let registry = SelectRegistry::new();
        registry.register("odd_ids", |ev, _cfg| ev.id() % 2 == 1);
        assert!(registry.contains("odd_ids"));
        assert!(!registry.contains("even_ids"));

        let config = StationConfig::default();
        let ev1 = Event::new(1, 8, 1);
        let ev2 = Event::new(2, 8, 1);
        assert!(registry.eval("odd_ids", &ev1, &config));
        assert!(!registry.eval("odd_ids", &ev2, &config));
        assert!(!registry.eval("missing", &ev1, &config));
    }
}
