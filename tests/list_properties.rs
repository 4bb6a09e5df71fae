//! Property tests for the list-ordering invariants: every list is a run of
//! highs followed by a run of lows, `last_high` tracks the boundary, and
//! reads preserve order.

use proptest::prelude::*;

use railyard::{Attachment, Event, EventList, Priority, WaitMode};

fn event(id: i32, high: bool, group: i32) -> Event {
    let mut ev = Event::new(id, 8, group);
    if high {
        ev.set_priority(Priority::High);
    }
    ev
}

fn high_block_then_low_block(priorities: &[Priority]) -> bool {
    let first_low = priorities
        .iter()
        .position(|p| *p == Priority::Low)
        .unwrap_or(priorities.len());
    priorities[first_low..]
        .iter()
        .all(|p| *p == Priority::Low)
}

/// Batches as a user would hand them to `put`: priorities in any order.
fn put_batches() -> impl Strategy<Value = Vec<Vec<bool>>> {
    prop::collection::vec(prop::collection::vec(any::<bool>(), 0..8), 0..6)
}

proptest! {
    #[test]
    fn put_preserves_the_priority_block_invariant(batches in put_batches()) {
        let list = EventList::new();
        let mut id = 0;
        for batch in &batches {
            let events: Vec<Event> = batch
                .iter()
                .map(|high| {
                    id += 1;
                    event(id, *high, 1)
                })
                .collect();
            list.put(events);
            let priorities = list.priorities();
            prop_assert!(high_block_then_low_block(&priorities));
            let highs = priorities.iter().filter(|p| **p == Priority::High).count();
            prop_assert_eq!(list.stats().last_high, highs);
        }
    }

    #[test]
    fn put_then_drain_is_priority_order_with_fifo_classes(batch in prop::collection::vec(any::<bool>(), 0..32)) {
        let list = EventList::new();
        let events: Vec<Event> = batch
            .iter()
            .enumerate()
            .map(|(i, high)| event(i as i32, *high, 1))
            .collect();
        list.put(events);
        let drained = list.drain_all();

        let highs: Vec<i32> = drained
            .iter()
            .filter(|ev| ev.priority() == Priority::High)
            .map(|ev| ev.id())
            .collect();
        let lows: Vec<i32> = drained
            .iter()
            .filter(|ev| ev.priority() == Priority::Low)
            .map(|ev| ev.id())
            .collect();

        // each class keeps its arrival order, and all highs lead
        prop_assert!(highs.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(lows.windows(2).all(|w| w[0] < w[1]));
        let expected_highs: Vec<i32> = batch
            .iter()
            .enumerate()
            .filter(|(_, high)| **high)
            .map(|(i, _)| i as i32)
            .collect();
        prop_assert_eq!(highs.clone(), expected_highs);
        let boundary = drained
            .iter()
            .position(|ev| ev.priority() == Priority::Low)
            .unwrap_or(drained.len());
        prop_assert_eq!(boundary, highs.len());
    }

    #[test]
    fn put_all_batches_keep_the_invariant(batches in prop::collection::vec(prop::collection::vec(any::<bool>(), 0..8), 0..6)) {
        let list = EventList::new();
        let mut id = 0;
        for batch in &batches {
            // conductor batches arrive pre-sorted, highs first
            let mut sorted: Vec<bool> = batch.clone();
            sorted.sort_by_key(|high| !*high);
            let events: Vec<Event> = sorted
                .iter()
                .map(|high| {
                    id += 1;
                    event(id, *high, 1)
                })
                .collect();
            list.put_all(events);
            prop_assert!(high_block_then_low_block(&list.priorities()));
        }
    }

    #[test]
    fn get_by_group_filters_without_reordering(
        groups in prop::collection::vec(1i32..4, 1..24),
        wanted in 1i32..4,
        quantity in 1usize..10,
    ) {
        let list = EventList::new();
        let att = Attachment::new(1, 1, "test".into(), -1);
        let events: Vec<Event> = groups
            .iter()
            .enumerate()
            .map(|(i, g)| event(i as i32, false, *g))
            .collect();
        list.put_all(events);

        let expected: Vec<i32> = groups
            .iter()
            .enumerate()
            .filter(|(_, g)| **g == wanted)
            .map(|(i, _)| i as i32)
            .take(quantity)
            .collect();
        match list.get_by_group(&att, WaitMode::Async, quantity, wanted) {
            Ok(taken) => {
                let ids: Vec<i32> = taken.iter().map(|ev| ev.id()).collect();
                prop_assert_eq!(ids, expected.clone());
                prop_assert!(taken.iter().all(|ev| ev.group() == wanted));
            }
            Err(_) => prop_assert!(expected.is_empty()),
        }
        // whatever stayed behind is still every non-taken event, in order
        let rest = list.drain_all();
        prop_assert_eq!(rest.len(), groups.len() - expected.len());
    }
}
