// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decoding of `BridgeDeposited` events emitted by the bridge contract into
//! the `DepositEvent` the relay works with.

use crate::abi::BridgeDepositedFilter;
use crate::types::DepositEvent;
use ethers::contract::LogMeta;
use ethers::types::H256;

impl From<(BridgeDepositedFilter, LogMeta)> for DepositEvent {
    fn from((event, meta): (BridgeDepositedFilter, LogMeta)) -> Self {
        DepositEvent {
            token_id: H256(event.token_id),
            transfer_id: H256(event.deposit_id),
            account: event.account,
            amount: event.amount,
            block_number: meta.block_number.as_u64(),
            log_index: meta.log_index.low_u64(),
            tx_hash: meta.transaction_hash,
        }
    }
}
