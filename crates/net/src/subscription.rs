//! Topic subscription management.
//!
//! Keeps the subscribed topic set equal to the neighborhood of the local peer's
//! grid cell plus any pinned topics (scene ids, for example). Nothing is sent while
//! the peer stays inside one cell; each distinct cell produces at most one update.

use crate::CommsError;
use std::collections::BTreeSet;
use tracing::{debug, warn};
use worldcomms_core::{cell_of, neighborhood, GridCell, GridConfig, Position, Topic};

/// Anything that can announce a subscription set (normally a
/// [`Connection`](crate::Connection)).
pub trait SubscriptionSink {
    /// Replace the remote subscription set with `topics`.
    fn update_subscriptions(&self, topics: &BTreeSet<Topic>) -> Result<(), CommsError>;
}

/// Whether the announced set matches the wanted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Last announced set is current.
    Stable,
    /// The wanted set changed and has not been announced yet.
    Dirty,
}

/// Tracks the wanted and announced topic sets for one peer.
#[derive(Debug)]
pub struct SubscriptionManager {
    grid: GridConfig,
    state: SubscriptionState,
    current_cell: Option<GridCell>,
    pinned: BTreeSet<Topic>,
    wanted: BTreeSet<Topic>,
    subscribed: BTreeSet<Topic>,
}

impl SubscriptionManager {
    /// Manager with nothing subscribed yet.
    pub fn new(grid: GridConfig) -> Self {
        Self {
            grid,
            state: SubscriptionState::Stable,
            current_cell: None,
            pinned: BTreeSet::new(),
            wanted: BTreeSet::new(),
            subscribed: BTreeSet::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Cell of the last observed position.
    pub fn current_cell(&self) -> Option<GridCell> {
        self.current_cell
    }

    /// Topics last announced successfully.
    pub fn subscribed(&self) -> &BTreeSet<Topic> {
        &self.subscribed
    }

    /// Topics the next update will announce.
    pub fn wanted(&self) -> &BTreeSet<Topic> {
        &self.wanted
    }

    /// Keep `topic` subscribed regardless of position.
    pub fn pin(&mut self, topic: Topic) {
        if self.pinned.insert(topic) {
            self.recompute();
        }
    }

    /// Stop forcing `topic`.
    pub fn unpin(&mut self, topic: &Topic) {
        if self.pinned.remove(topic) {
            self.recompute();
        }
    }

    /// Record a new position sample without sending anything.
    ///
    /// Enters [`SubscriptionState::Dirty`] when the sample lands in a new cell whose
    /// neighborhood differs from what was last announced.
    pub fn observe(&mut self, position: &Position) -> SubscriptionState {
        let cell = cell_of(position, &self.grid);
        if self.current_cell != Some(cell) {
            debug!(%cell, "entered grid cell");
            self.current_cell = Some(cell);
            self.recompute();
        }
        self.state
    }

    /// Announce the wanted set if dirty. Returns whether an update was sent.
    ///
    /// On failure the manager stays dirty so the next call retries.
    pub fn flush<S>(&mut self, sink: &S) -> Result<bool, CommsError>
    where
        S: SubscriptionSink + ?Sized,
    {
        if self.state == SubscriptionState::Stable {
            return Ok(false);
        }
        if let Err(err) = sink.update_subscriptions(&self.wanted) {
            warn!("Failed to update subscriptions: {err}");
            return Err(err);
        }
        self.subscribed = self.wanted.clone();
        self.state = SubscriptionState::Stable;
        Ok(true)
    }

    /// [`observe`](Self::observe) followed by [`flush`](Self::flush).
    pub fn on_position<S>(&mut self, position: &Position, sink: &S) -> Result<bool, CommsError>
    where
        S: SubscriptionSink + ?Sized,
    {
        self.observe(position);
        self.flush(sink)
    }

    fn recompute(&mut self) {
        let mut wanted = self.pinned.clone();
        if let Some(cell) = self.current_cell {
            wanted.extend(
                neighborhood(cell, self.grid.neighbor_radius)
                    .into_iter()
                    .map(Topic::from),
            );
        }
        if wanted != self.subscribed {
            self.state = SubscriptionState::Dirty;
        } else {
            self.state = SubscriptionState::Stable;
        }
        self.wanted = wanted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use worldcomms_core::are_adjacent;

    /// One world unit per cell, no bias, so positions map straight onto cells.
    fn unit_grid() -> GridConfig {
        GridConfig {
            parcel_size: 1.0,
            parcel_bias_x: 0,
            parcel_bias_z: 0,
            block_shift: 0,
            neighbor_radius: 1,
        }
    }

    fn at(x: i32, z: i32) -> Position {
        Position::at(x as f32 + 0.5, 0.0, z as f32 + 0.5)
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: RefCell<Vec<BTreeSet<Topic>>>,
        fail: RefCell<bool>,
    }

    impl SubscriptionSink for RecordingSink {
        fn update_subscriptions(&self, topics: &BTreeSet<Topic>) -> Result<(), CommsError> {
            if *self.fail.borrow() {
                return Err(CommsError::ChannelUnavailable(
                    crate::ChannelKind::Reliable,
                ));
            }
            self.calls.borrow_mut().push(topics.clone());
            Ok(())
        }
    }

    fn closure_of(cell: GridCell) -> BTreeSet<Topic> {
        neighborhood(cell, 1).into_iter().map(Topic::from).collect()
    }

    #[test]
    fn first_position_subscribes_to_neighborhood() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        assert!(manager.on_position(&at(3, 3), &sink).unwrap());
        let calls = sink.calls.borrow();
        assert_eq!(calls.len(), 1);
        let expected: BTreeSet<Topic> = ["3:3", "2:3", "4:3", "3:2", "3:4"]
            .into_iter()
            .map(Topic::from)
            .collect();
        assert_eq!(calls[0], expected);
        assert_eq!(manager.state(), SubscriptionState::Stable);
    }

    #[test]
    fn far_move_goes_dirty_and_sends_once() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        manager.on_position(&at(0, 0), &sink).unwrap();
        assert_eq!(manager.state(), SubscriptionState::Stable);

        let target = GridCell::new(5, 5);
        assert!(!are_adjacent(GridCell::new(0, 0), target));
        assert_eq!(manager.observe(&at(5, 5)), SubscriptionState::Dirty);
        assert!(manager.flush(&sink).unwrap());
        assert_eq!(manager.state(), SubscriptionState::Stable);

        let calls = sink.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], closure_of(target));
        assert_eq!(manager.subscribed(), &closure_of(target));
    }

    #[test]
    fn samples_within_a_cell_send_nothing() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        for dx in [0.1, 0.4, 0.9, 0.2] {
            manager
                .on_position(&Position::at(7.0 + dx, 2.0, 7.5), &sink)
                .unwrap();
        }
        assert_eq!(sink.calls.borrow().len(), 1);
    }

    #[test]
    fn one_update_per_distinct_cell() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        // Several samples per cell across three cells.
        let path = [(2, 2), (2, 2), (3, 2), (3, 2), (3, 2), (4, 2), (4, 2)];
        for (x, z) in path {
            manager.on_position(&at(x, z), &sink).unwrap();
        }
        let calls = sink.calls.borrow();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], closure_of(GridCell::new(4, 2)));
    }

    #[test]
    fn failed_update_stays_dirty_and_retries() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        *sink.fail.borrow_mut() = true;
        assert!(manager.on_position(&at(1, 1), &sink).is_err());
        assert_eq!(manager.state(), SubscriptionState::Dirty);
        assert!(manager.subscribed().is_empty());

        *sink.fail.borrow_mut() = false;
        assert!(manager.on_position(&at(1, 1), &sink).unwrap());
        assert_eq!(manager.state(), SubscriptionState::Stable);
        assert_eq!(sink.calls.borrow().len(), 1);
    }

    #[test]
    fn pinned_topics_join_the_set() {
        let mut manager = SubscriptionManager::new(unit_grid());
        let sink = RecordingSink::default();
        manager.on_position(&at(2, 2), &sink).unwrap();

        manager.pin(Topic::from("scene-1"));
        assert_eq!(manager.state(), SubscriptionState::Dirty);
        assert!(manager.flush(&sink).unwrap());
        assert!(sink.calls.borrow()[1].contains(&Topic::from("scene-1")));

        manager.pin(Topic::from("scene-1"));
        assert_eq!(manager.state(), SubscriptionState::Stable);

        manager.unpin(&Topic::from("scene-1"));
        assert!(manager.flush(&sink).unwrap());
        assert_eq!(sink.calls.borrow()[2], closure_of(GridCell::new(2, 2)));
    }

    #[test]
    fn unvalidated_grid_still_subscribes() {
        let grid = GridConfig {
            block_shift: 32,
            ..GridConfig::default()
        };
        let mut manager = SubscriptionManager::new(grid);
        let sink = RecordingSink::default();
        assert!(manager
            .on_position(&Position::at(0.0, 0.0, 0.0), &sink)
            .unwrap());
        assert_eq!(manager.current_cell(), Some(GridCell::new(0, 0)));
    }

    #[test]
    fn radius_comes_from_config() {
        let grid = GridConfig {
            neighbor_radius: 2,
            ..unit_grid()
        };
        let mut manager = SubscriptionManager::new(grid);
        let sink = RecordingSink::default();
        manager.on_position(&at(10, 10), &sink).unwrap();
        assert_eq!(sink.calls.borrow()[0].len(), 13);
    }
}
