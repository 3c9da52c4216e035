use crate::classifier::TypeMask;

use bitflags::bitflags;
use mysql_common::constants::StatusFlags;

bitflags! {
    /// Explicit-transaction state bits. Autocommit is tracked separately
    /// by the protocol; these bits reflect BEGIN/COMMIT/ROLLBACK only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrxState: u8 {
        const ACTIVE    = 1 << 0;
        const READ_ONLY = 1 << 1;
        const ENDING    = 1 << 2;
        const STARTING  = 1 << 3;
    }
}

/// Tracks the explicit transaction state of one session from the type
/// masks of the statements flowing through it, with server-reported
/// status as the authoritative correction.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrxTracker {
    state: TrxState,
}

impl TrxTracker {
    pub fn new() -> Self {
        TrxTracker::default()
    }

    pub fn state(&self) -> TrxState {
        self.state
    }

    pub fn set_state(&mut self, state: TrxState) {
        self.state = state;
    }

    pub fn is_trx_active(&self) -> bool {
        self.state.contains(TrxState::ACTIVE)
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.state.contains(TrxState::ACTIVE | TrxState::READ_ONLY)
    }

    pub fn is_trx_ending(&self) -> bool {
        self.state.contains(TrxState::ENDING)
    }

    pub fn is_trx_starting(&self) -> bool {
        self.state.contains(TrxState::STARTING)
    }

    /// Advance the state for the statement about to be routed. Called once
    /// per statement boundary.
    pub fn track_transaction_state(&mut self, type_mask: TypeMask) {
        // a transaction that was ending finished with the previous
        // statement's reply
        if self.state.contains(TrxState::ENDING) {
            self.state = TrxState::empty();
        }
        self.state.remove(TrxState::STARTING);

        if type_mask.contains(TypeMask::BEGIN_TRX) {
            self.state = TrxState::ACTIVE | TrxState::STARTING;
            if type_mask.contains(TypeMask::READ) && !type_mask.contains(TypeMask::WRITE) {
                self.state |= TrxState::READ_ONLY;
            }
        } else if type_mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK)
            && self.state.contains(TrxState::ACTIVE)
        {
            self.state |= TrxState::ENDING;
        }
    }

    /// Servers report transaction transitions in OK packet status flags;
    /// trust them over our own book-keeping.
    pub fn fix_from_server(&mut self, status: StatusFlags) {
        if status.contains(StatusFlags::SERVER_STATUS_IN_TRANS) {
            self.state |= TrxState::ACTIVE;
            self.state.remove(TrxState::ENDING);
        } else {
            self.state = TrxState::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_update_commit_cycle() {
        let mut trx = TrxTracker::new();
        assert!(!trx.is_trx_active());

        trx.track_transaction_state(TypeMask::BEGIN_TRX);
        assert!(trx.is_trx_active());
        assert!(trx.is_trx_starting());
        assert!(!trx.is_trx_read_only());

        trx.track_transaction_state(TypeMask::WRITE);
        assert!(trx.is_trx_active());
        assert!(!trx.is_trx_starting());

        trx.track_transaction_state(TypeMask::COMMIT);
        assert!(trx.is_trx_ending());

        trx.track_transaction_state(TypeMask::READ);
        assert!(!trx.is_trx_active());
    }

    #[test]
    fn read_only_transaction() {
        let mut trx = TrxTracker::new();
        trx.track_transaction_state(TypeMask::BEGIN_TRX | TypeMask::READ);
        assert!(trx.is_trx_read_only());
    }

    #[test]
    fn commit_outside_transaction_does_not_end() {
        let mut trx = TrxTracker::new();
        trx.track_transaction_state(TypeMask::COMMIT);
        assert!(!trx.is_trx_ending());
        assert!(!trx.is_trx_active());
    }

    #[test]
    fn server_report_wins() {
        let mut trx = TrxTracker::new();
        trx.track_transaction_state(TypeMask::BEGIN_TRX);
        trx.fix_from_server(StatusFlags::empty());
        assert!(!trx.is_trx_active());

        trx.fix_from_server(StatusFlags::SERVER_STATUS_IN_TRANS);
        assert!(trx.is_trx_active());
    }
}
