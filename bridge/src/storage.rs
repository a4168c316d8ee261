// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{BridgeError, BridgeResult};
use crate::types::{Direction, EventPosition, Transfer, TransferId, TransferState};
use crate::utils::now_ms;

const TRANSFERS_CF: &str = "transfers";
const TRANSFERS_BY_STATE_CF: &str = "transfers_by_state";
const CURSORS_CF: &str = "cursors";

const ALL_CFS: [&str; 3] = [TRANSFERS_CF, TRANSFERS_BY_STATE_CF, CURSORS_CF];

/// Durable ledger of every transfer the node has observed, plus the per
/// direction scan cursors.
///
/// Values are bcs encoded. `transfers_by_state` is keyed by
/// `state || direction || transfer_id` so listing the transfers of one state,
/// optionally of one direction, is a prefix scan.
pub struct BridgeLedgerTables {
    db: DB,
    // Serializes read-check-write sequences. Reads don't take it.
    write_lock: Mutex<()>,
}

impl BridgeLedgerTables {
    pub fn new(path: &Path) -> BridgeResult<Arc<Self>> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let descriptors = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&options, path, descriptors)?;
        Ok(Arc::new(Self {
            db,
            write_lock: Mutex::new(()),
        }))
    }

    fn cf(&self, name: &str) -> BridgeResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| BridgeError::StorageError(format!("Missing column family {name}")))
    }

    fn state_key(state: TransferState, direction: Direction, transfer_id: &TransferId) -> Vec<u8> {
        let mut key = Vec::with_capacity(2 + 32);
        key.push(state.as_key());
        key.push(direction.as_key());
        key.extend_from_slice(transfer_id.as_bytes());
        key
    }

    fn read_transfer(&self, transfer_id: &TransferId) -> BridgeResult<Option<Transfer>> {
        self.db
            .get_cf(self.cf(TRANSFERS_CF)?, transfer_id.as_bytes())?
            .map(|bytes| bcs::from_bytes::<Transfer>(&bytes).map_err(BridgeError::from))
            .transpose()
    }

    fn put_transfer(&self, batch: &mut WriteBatch, transfer: &Transfer) -> BridgeResult<()> {
        batch.put_cf(
            self.cf(TRANSFERS_CF)?,
            transfer.transfer_id.as_bytes(),
            bcs::to_bytes(transfer)?,
        );
        batch.put_cf(
            self.cf(TRANSFERS_BY_STATE_CF)?,
            Self::state_key(transfer.state, transfer.direction(), &transfer.transfer_id),
            b"",
        );
        Ok(())
    }

    /// Stores `transfer` unless one with the same id exists. Returns whether
    /// it was inserted.
    pub fn insert_if_absent(&self, transfer: &Transfer) -> BridgeResult<bool> {
        let _guard = self.write_lock.lock();
        if self.read_transfer(&transfer.transfer_id)?.is_some() {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        self.put_transfer(&mut batch, transfer)?;
        self.db.write(batch)?;
        Ok(true)
    }

    pub fn get_transfer(&self, transfer_id: &TransferId) -> BridgeResult<Option<Transfer>> {
        self.read_transfer(transfer_id)
    }

    /// Moves a transfer from `expected` to `next` and applies `mutate` to it,
    /// atomically. Fails with `StaleState` when the stored state is not
    /// `expected`, leaving the entry untouched.
    pub fn transition<F>(
        &self,
        transfer_id: &TransferId,
        expected: TransferState,
        next: TransferState,
        mutate: F,
    ) -> BridgeResult<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        if !expected.can_transition_to(next) {
            return Err(BridgeError::InvalidStateTransition {
                from: expected,
                to: next,
            });
        }
        self.apply(transfer_id, expected, next, mutate)
    }

    /// Updates bookkeeping fields of a transfer that must still be in `state`.
    pub fn update_in_state<F>(
        &self,
        transfer_id: &TransferId,
        state: TransferState,
        mutate: F,
    ) -> BridgeResult<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        self.apply(transfer_id, state, state, mutate)
    }

    fn apply<F>(
        &self,
        transfer_id: &TransferId,
        expected: TransferState,
        next: TransferState,
        mutate: F,
    ) -> BridgeResult<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        let _guard = self.write_lock.lock();
        let mut transfer = self
            .read_transfer(transfer_id)?
            .ok_or(BridgeError::TransferNotFound(*transfer_id))?;
        if transfer.state != expected {
            return Err(BridgeError::StaleState {
                transfer_id: *transfer_id,
                expected,
                actual: transfer.state,
            });
        }
        mutate(&mut transfer);
        transfer.transfer_id = *transfer_id;
        transfer.state = next;
        transfer.updated_at = now_ms();

        let mut batch = WriteBatch::default();
        batch.delete_cf(
            self.cf(TRANSFERS_BY_STATE_CF)?,
            Self::state_key(expected, transfer.direction(), transfer_id),
        );
        self.put_transfer(&mut batch, &transfer)?;
        self.db.write(batch)?;
        Ok(transfer)
    }

    /// Transfers currently in `state`, optionally restricted to one direction,
    /// ordered by transfer id.
    pub fn get_transfers_by_state(
        &self,
        state: TransferState,
        direction: Option<Direction>,
    ) -> BridgeResult<Vec<Transfer>> {
        let mut prefix = vec![state.as_key()];
        if let Some(direction) = direction {
            prefix.push(direction.as_key());
        }
        let mut transfers = vec![];
        let iter = self.db.iterator_cf(
            self.cf(TRANSFERS_BY_STATE_CF)?,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let transfer_id = TransferId::from_slice(&key[2..]);
            // Index and transfer are written in one batch, a miss means corruption.
            let transfer = self.read_transfer(&transfer_id)?.ok_or_else(|| {
                BridgeError::StorageError(format!("Dangling state index for {transfer_id:?}"))
            })?;
            transfers.push(transfer);
        }
        Ok(transfers)
    }

    pub fn count_by_state(
        &self,
        direction: Direction,
    ) -> BridgeResult<BTreeMap<TransferState, u64>> {
        let cf = self.cf(TRANSFERS_BY_STATE_CF)?;
        let mut counts = BTreeMap::new();
        for state in TransferState::ALL {
            let prefix = [state.as_key(), direction.as_key()];
            let mut count = 0;
            for item in self.db.iterator_cf(
                cf,
                IteratorMode::From(&prefix, rocksdb::Direction::Forward),
            ) {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                count += 1;
            }
            counts.insert(state, count);
        }
        Ok(counts)
    }

    pub fn get_cursor(&self, direction: Direction) -> BridgeResult<Option<EventPosition>> {
        self.db
            .get_cf(self.cf(CURSORS_CF)?, [direction.as_key()])?
            .map(|bytes| bcs::from_bytes::<EventPosition>(&bytes).map_err(BridgeError::from))
            .transpose()
    }

    /// Persists the cursor of `direction`. Moving it backwards is rejected.
    pub fn update_cursor(&self, direction: Direction, position: EventPosition) -> BridgeResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(stored) = self.get_cursor(direction)? {
            if position < stored {
                return Err(BridgeError::CursorRegression {
                    stored: stored.to_string(),
                    attempted: position.to_string(),
                });
            }
            if position == stored {
                return Ok(());
            }
        }
        self.db.put_cf(
            self.cf(CURSORS_CF)?,
            [direction.as_key()],
            bcs::to_bytes(&position)?,
        )?;
        Ok(())
    }

    /// Overwrites or removes the cursor of `direction` regardless of its
    /// current value. Used for operator supplied start blocks at startup.
    pub fn reset_cursor(
        &self,
        direction: Direction,
        position: Option<EventPosition>,
    ) -> BridgeResult<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf(CURSORS_CF)?;
        match position {
            Some(position) => self
                .db
                .put_cf(cf, [direction.as_key()], bcs::to_bytes(&position)?)?,
            None => self.db.delete_cf(cf, [direction.as_key()])?,
        }
        Ok(())
    }

    // Wipes every table. Only meant for test deployments.
    pub fn clear_for_testing(&self) -> BridgeResult<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        for name in ALL_CFS {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DepositEvent, NetworkId, NATIVE_TOKEN_ID};
    use ethers::types::{Address as EthAddress, H256, U256};

    fn observed(id: u8, source: NetworkId) -> Transfer {
        let event = DepositEvent {
            token_id: NATIVE_TOKEN_ID,
            transfer_id: H256::repeat_byte(id),
            account: EthAddress::repeat_byte(0xaa),
            amount: U256::from(100u64),
            block_number: 10,
            log_index: id as u64,
            tx_hash: H256::repeat_byte(0xee),
        };
        Transfer::new_observed(&event, source, 0)
    }

    #[test]
    fn test_insert_if_absent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let transfer = observed(1, NetworkId::A);
        assert!(store.insert_if_absent(&transfer).unwrap());
        assert!(!store.insert_if_absent(&transfer).unwrap());

        // A second insert never overwrites progress
        store
            .transition(
                &transfer.transfer_id,
                TransferState::Observed,
                TransferState::Authorized,
                |_| {},
            )
            .unwrap();
        assert!(!store.insert_if_absent(&transfer).unwrap());
        assert_eq!(
            store.get_transfer(&transfer.transfer_id).unwrap().unwrap().state,
            TransferState::Authorized
        );
        assert!(store.get_transfer(&H256::repeat_byte(9)).unwrap().is_none());
    }

    #[test]
    fn test_transition_and_indexes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let a = observed(1, NetworkId::A);
        let b = observed(2, NetworkId::B);
        store.insert_if_absent(&a).unwrap();
        store.insert_if_absent(&b).unwrap();

        let updated = store
            .transition(
                &a.transfer_id,
                TransferState::Observed,
                TransferState::Authorized,
                |t| t.signature = Some(vec![1u8; 65].into()),
            )
            .unwrap();
        assert_eq!(updated.state, TransferState::Authorized);
        assert!(updated.signature.is_some());

        let authorized = store
            .get_transfers_by_state(TransferState::Authorized, None)
            .unwrap();
        assert_eq!(authorized, vec![updated.clone()]);
        assert!(store
            .get_transfers_by_state(TransferState::Authorized, Some(Direction::BToA))
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .get_transfers_by_state(TransferState::Observed, Some(Direction::BToA))
                .unwrap(),
            vec![b.clone()]
        );

        let counts = store.count_by_state(Direction::AToB).unwrap();
        assert_eq!(counts[&TransferState::Authorized], 1);
        assert_eq!(counts[&TransferState::Observed], 0);

        // Stale expectation
        let err = store
            .transition(
                &a.transfer_id,
                TransferState::Observed,
                TransferState::Failed,
                |_| {},
            )
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::StaleState {
                transfer_id: a.transfer_id,
                expected: TransferState::Observed,
                actual: TransferState::Authorized,
            }
        );

        // Disallowed edge
        assert!(matches!(
            store.transition(
                &a.transfer_id,
                TransferState::Authorized,
                TransferState::Completed,
                |_| {}
            ),
            Err(BridgeError::InvalidStateTransition { .. })
        ));

        // Unknown id
        assert!(matches!(
            store.transition(
                &H256::repeat_byte(7),
                TransferState::Observed,
                TransferState::Authorized,
                |_| {}
            ),
            Err(BridgeError::TransferNotFound(_))
        ));

        // The mutation can't pick a different target state
        let forced = store
            .transition(
                &b.transfer_id,
                TransferState::Observed,
                TransferState::Failed,
                |t| t.state = TransferState::Completed,
            )
            .unwrap();
        assert_eq!(forced.state, TransferState::Failed);
    }

    #[test]
    fn test_concurrent_transition_single_winner() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let transfer = observed(3, NetworkId::A);
        store.insert_if_absent(&transfer).unwrap();
        store
            .transition(
                &transfer.transfer_id,
                TransferState::Observed,
                TransferState::Authorized,
                |_| {},
            )
            .unwrap();

        let handles = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = transfer.transfer_id;
                std::thread::spawn(move || {
                    store.transition(
                        &id,
                        TransferState::Authorized,
                        TransferState::Submitted,
                        |t| t.withdraw_tx_hash = Some(H256::from_low_u64_be(i)),
                    )
                })
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, BridgeError::StaleState { .. })));
        assert_eq!(
            store
                .get_transfers_by_state(TransferState::Submitted, None)
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .get_transfers_by_state(TransferState::Authorized, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        assert_eq!(store.get_cursor(Direction::AToB).unwrap(), None);
        store
            .update_cursor(Direction::AToB, EventPosition::new(10, 2))
            .unwrap();
        store
            .update_cursor(Direction::AToB, EventPosition::new(10, 2))
            .unwrap();
        store
            .update_cursor(Direction::AToB, EventPosition::end_of_block(10))
            .unwrap();
        assert!(matches!(
            store.update_cursor(Direction::AToB, EventPosition::new(10, 5)),
            Err(BridgeError::CursorRegression { .. })
        ));
        assert_eq!(
            store.get_cursor(Direction::AToB).unwrap(),
            Some(EventPosition::end_of_block(10))
        );
        assert_eq!(store.get_cursor(Direction::BToA).unwrap(), None);

        store.reset_cursor(Direction::AToB, None).unwrap();
        assert_eq!(store.get_cursor(Direction::AToB).unwrap(), None);
        store
            .update_cursor(Direction::AToB, EventPosition::new(2, 0))
            .unwrap();
        assert_eq!(
            store.get_cursor(Direction::AToB).unwrap(),
            Some(EventPosition::new(2, 0))
        );
    }

    #[test]
    fn test_update_in_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        let transfer = observed(5, NetworkId::A);
        store.insert_if_absent(&transfer).unwrap();
        let updated = store
            .update_in_state(&transfer.transfer_id, TransferState::Observed, |t| {
                t.retry_count = 2;
                t.next_retry_at = Some(42);
            })
            .unwrap();
        assert_eq!(updated.state, TransferState::Observed);
        assert_eq!(updated.retry_count, 2);
        assert_eq!(
            store
                .get_transfers_by_state(TransferState::Observed, Some(Direction::AToB))
                .unwrap(),
            vec![updated]
        );
        assert!(matches!(
            store.update_in_state(&transfer.transfer_id, TransferState::Failed, |_| {}),
            Err(BridgeError::StaleState { .. })
        ));
    }

    #[test]
    fn test_reopen_and_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let transfer = observed(4, NetworkId::B);
        {
            let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
            store.insert_if_absent(&transfer).unwrap();
            store
                .update_cursor(Direction::BToA, EventPosition::new(3, 0))
                .unwrap();
        }
        let store = BridgeLedgerTables::new(temp_dir.path()).unwrap();
        assert_eq!(
            store.get_transfer(&transfer.transfer_id).unwrap(),
            Some(transfer.clone())
        );
        assert_eq!(
            store.get_cursor(Direction::BToA).unwrap(),
            Some(EventPosition::new(3, 0))
        );

        store.clear_for_testing().unwrap();
        assert!(store.get_transfer(&transfer.transfer_id).unwrap().is_none());
        assert!(store.get_cursor(Direction::BToA).unwrap().is_none());
        assert!(store
            .get_transfers_by_state(TransferState::Observed, None)
            .unwrap()
            .is_empty());
    }
}
