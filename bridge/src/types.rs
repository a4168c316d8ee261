// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use ethers::types::{Address as EthAddress, Bytes, TxHash, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Opaque 32-byte identifier of a deposit, shared by the matching withdrawal.
pub type TransferId = H256;

// Registered asset identifier. The native coin uses the zero value.
pub type TokenId = H256;

pub const NATIVE_TOKEN_ID: TokenId = H256::zero();

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NetworkId {
    A,
    B,
}

impl NetworkId {
    pub fn opposite(&self) -> NetworkId {
        match self {
            NetworkId::A => NetworkId::B,
            NetworkId::B => NetworkId::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkId::A => "network_a",
            NetworkId::B => "network_b",
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// A relay direction is named after the network deposits are observed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::AToB, Direction::BToA];

    pub fn from_source(source: NetworkId) -> Self {
        match source {
            NetworkId::A => Direction::AToB,
            NetworkId::B => Direction::BToA,
        }
    }

    pub fn source(&self) -> NetworkId {
        match self {
            Direction::AToB => NetworkId::A,
            Direction::BToA => NetworkId::B,
        }
    }

    pub fn dest(&self) -> NetworkId {
        self.source().opposite()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::AToB => "a_to_b",
            Direction::BToA => "b_to_a",
        }
    }

    pub(crate) fn as_key(&self) -> u8 {
        match self {
            Direction::AToB => 0,
            Direction::BToA => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a_to_b" | "a-to-b" | "ab" => Ok(Direction::AToB),
            "b_to_a" | "b-to-a" | "ba" => Ok(Direction::BToA),
            other => Err(format!("Unknown direction: {other}")),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransferState {
    Observed,
    Authorized,
    Submitted,
    Completed,
    Failed,
}

impl TransferState {
    pub const ALL: [TransferState; 5] = [
        TransferState::Observed,
        TransferState::Authorized,
        TransferState::Submitted,
        TransferState::Completed,
        TransferState::Failed,
    ];

    // Forward-only lifecycle. The two backward edges are resubmission after a
    // reverted or dropped withdrawal and operator retry of a failed transfer.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Observed, Authorized)
                | (Observed, Failed)
                | (Authorized, Submitted)
                | (Authorized, Failed)
                | (Submitted, Completed)
                | (Submitted, Authorized)
                | (Submitted, Failed)
                | (Failed, Authorized)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Observed => "observed",
            TransferState::Authorized => "authorized",
            TransferState::Submitted => "submitted",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        }
    }

    pub(crate) fn as_key(&self) -> u8 {
        match self {
            TransferState::Observed => 0,
            TransferState::Authorized => 1,
            TransferState::Submitted => 2,
            TransferState::Completed => 3,
            TransferState::Failed => 4,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferState::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown transfer state: {s}"))
    }
}

// Position of an event on its source chain. `log_index == u64::MAX` marks a
// fully processed block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub block: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }

    pub fn end_of_block(block: u64) -> Self {
        Self {
            block,
            log_index: u64::MAX,
        }
    }

    pub fn is_end_of_block(&self) -> bool {
        self.log_index == u64::MAX
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_end_of_block() {
            write!(f, "{}:end", self.block)
        } else {
            write!(f, "{}:{}", self.block, self.log_index)
        }
    }
}

// `BridgeDeposited` event observed on a source chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub token_id: TokenId,
    pub transfer_id: TransferId,
    pub account: EthAddress,
    pub amount: U256,
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: TxHash,
}

impl DepositEvent {
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.log_index)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub token_id: TokenId,
    pub source_network: NetworkId,
    pub dest_network: NetworkId,
    // Beneficiary on the destination network.
    pub account: EthAddress,
    pub amount: U256,
    pub deposit_tx_hash: TxHash,
    pub deposit_block: u64,
    pub deposit_log_index: u64,
    pub state: TransferState,
    // Validator signature over the withdrawal authorization, kept so
    // resubmissions carry the exact same payload.
    pub signature: Option<Bytes>,
    pub withdraw_tx_hash: Option<TxHash>,
    pub last_error: Option<String>,
    pub retry_count: u32,
    // Unix millis before which a resubmission is not attempted.
    pub next_retry_at: Option<u64>,
    pub updated_at: u64,
}

impl Transfer {
    pub fn new_observed(event: &DepositEvent, source_network: NetworkId, now_ms: u64) -> Self {
        Self {
            transfer_id: event.transfer_id,
            token_id: event.token_id,
            source_network,
            dest_network: source_network.opposite(),
            account: event.account,
            amount: event.amount,
            deposit_tx_hash: event.tx_hash,
            deposit_block: event.block_number,
            deposit_log_index: event.log_index,
            state: TransferState::Observed,
            signature: None,
            withdraw_tx_hash: None,
            last_error: None,
            retry_count: 0,
            next_retry_at: None,
            updated_at: now_ms,
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_source(self.source_network)
    }

    pub fn authorization(&self) -> Option<SignedAuthorization> {
        self.signature.as_ref().map(|signature| SignedAuthorization {
            token_id: self.token_id,
            transfer_id: self.transfer_id,
            account: self.account,
            amount: self.amount,
            signature: signature.clone(),
        })
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now_ms)
    }
}

// Payload of `executeWithdrawal` on the destination bridge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAuthorization {
    pub token_id: TokenId,
    pub transfer_id: TransferId,
    pub account: EthAddress,
    pub amount: U256,
    pub signature: Bytes,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Pending,
    Executed,
}

// Fate of a submitted withdrawal transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    // Known to the node but not yet mined.
    Pending,
    Succeeded,
    Reverted,
    // Neither mined nor known to the node any more.
    Dropped,
}

pub struct Amount;

impl Amount {
    // `value` whole units expressed in the smallest unit of a token with `decimals`.
    pub fn make(value: u64, decimals: u32) -> U256 {
        U256::from(value) * U256::exp10(decimals as usize)
    }
}
