//! Non-replayable message tracking.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use crate::{error::MslError, tokens::MasterToken};

/// Accepts or rejects non-replayable ids.
pub trait ReplayGuard: Send + Sync {
    /// Record `non_replayable_id` for `master_token`'s serial number.
    ///
    /// # Errors
    ///
    /// - `Replay` if the id was already accepted or falls outside the window
    fn accept(&self, master_token: &MasterToken, non_replayable_id: u64) -> Result<(), MslError>;
}

/// Accepted ids of one master token serial number.
///
/// Keeps the highest accepted id and every accepted id within `window` of
/// it. Ids at or below `highest - window`, or more than `window` above
/// `highest`, are rejected.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    window: u64,
    highest: Option<u64>,
    accepted: BTreeSet<u64>,
}

impl ReplayWindow {
    /// Create an empty window of `window` ids.
    pub fn new(window: u64) -> Self {
        Self { window, highest: None, accepted: BTreeSet::new() }
    }

    /// Highest accepted id.
    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Accept `id` or explain why it is a replay.
    ///
    /// # Errors
    ///
    /// - `Replay` if `id` was already accepted or falls outside the window
    pub fn accept(&mut self, id: u64) -> Result<(), MslError> {
        let Some(highest) = self.highest else {
            self.highest = Some(id);
            self.accepted.insert(id);
            return Ok(());
        };

        if id > highest {
            if id - highest > self.window {
                return Err(MslError::replay(format!("non-replayable id {id} too far ahead of {highest}")));
            }
            self.highest = Some(id);
            self.accepted.insert(id);
            let floor = id.saturating_sub(self.window);
            self.accepted = self.accepted.split_off(&(floor + 1));
            return Ok(());
        }

        if id.saturating_add(self.window) <= highest {
            return Err(MslError::replay(format!("non-replayable id {id} older than window at {highest}")));
        }
        if !self.accepted.insert(id) {
            return Err(MslError::replay(format!("non-replayable id {id} already accepted")));
        }
        Ok(())
    }
}

/// Replay windows keyed by master token serial number.
#[derive(Debug)]
pub struct ReplayWindows {
    window: u64,
    windows: Mutex<HashMap<u64, ReplayWindow>>,
}

impl ReplayWindows {
    /// Create an empty set of windows, each `window` ids wide.
    pub fn new(window: u64) -> Self {
        Self { window, windows: Mutex::new(HashMap::new()) }
    }

    /// Drop the window of `serial_number`.
    #[allow(clippy::expect_used)]
    pub fn forget(&self, serial_number: u64) {
        self.windows.lock().expect("Mutex poisoned").remove(&serial_number);
    }
}

impl ReplayGuard for ReplayWindows {
    #[allow(clippy::expect_used)]
    fn accept(&self, master_token: &MasterToken, non_replayable_id: u64) -> Result<(), MslError> {
        let mut windows = self.windows.lock().expect("Mutex poisoned");
        windows
            .entry(master_token.serial_number())
            .or_insert_with(|| ReplayWindow::new(self.window))
            .accept(non_replayable_id)
            .map_err(|e| {
                tracing::warn!(
                    serial = master_token.serial_number(),
                    non_replayable_id,
                    "replayed message rejected"
                );
                e.with_master_token(master_token.serial_number(), master_token.sequence_number())
            })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn repeated_id_rejected() {
        let mut window = ReplayWindow::new(8);
        window.accept(5).unwrap();
        window.accept(3).unwrap();

        assert_eq!(window.accept(5).unwrap_err().kind(), ErrorKind::Replay);
        assert_eq!(window.accept(3).unwrap_err().kind(), ErrorKind::Replay);
        assert_eq!(window.highest(), Some(5));
    }

    #[test]
    fn window_edges() {
        let mut window = ReplayWindow::new(8);
        window.accept(100).unwrap();

        assert!(window.accept(92).is_err(), "at highest - window");
        assert!(window.accept(93).is_ok());
        assert!(window.accept(109).is_err(), "more than window ahead");
        assert!(window.accept(108).is_ok());
        assert!(window.accept(100).is_err());
        assert!(window.accept(99).is_err(), "now at highest - window");
    }

    proptest! {
        #[test]
        fn accepted_ids_are_never_accepted_twice(ids in prop::collection::vec(0u64..64, 1..64)) {
            let mut window = ReplayWindow::new(16);
            let mut seen = std::collections::HashSet::new();
            for id in ids {
                let accepted = window.accept(id).is_ok();
                if accepted {
                    prop_assert!(seen.insert(id), "id {} accepted twice", id);
                }
            }
        }
    }
}
