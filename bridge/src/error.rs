// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::types::{TransferId, TransferState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    // Node or network unavailability. Retried on the next tick without limit.
    #[error("RPC error: {0}")]
    RpcError(String),
    // Malformed deposit or unregistered token. Never retried automatically.
    #[error("Invalid deposit: {0}")]
    ValidationError(String),
    // The withdrawal transaction reverted or was dropped.
    #[error("Withdrawal submission failed: {0}")]
    SubmissionError(String),
    // The destination contract cannot pay out. Not retryable.
    #[error("Insufficient liquidity on destination bridge: {0}")]
    InsufficientLiquidity(String),
    // The destination contract already executed this transferId.
    #[error("Withdrawal already executed on destination bridge")]
    WithdrawalAlreadyExecuted,
    #[error("Stale state for transfer {transfer_id:?}: expected {expected:?}, found {actual:?}")]
    StaleState {
        transfer_id: TransferId,
        expected: TransferState,
        actual: TransferState,
    },
    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: TransferState,
        to: TransferState,
    },
    #[error("Transfer {0:?} not found")]
    TransferNotFound(TransferId),
    #[error("Cursor regression: stored {stored}, attempted {attempted}")]
    CursorRegression { stored: String, attempted: String },
    #[error("Signing error: {0}")]
    SigningError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    // Malformed request to the status server.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    // Errors that abort the current cycle and are expected to heal by the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::RpcError(_))
    }

    // Errors that stop the job that hit them. The persistent store being
    // unusable is the only case.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::StorageError(_))
    }

    // Short label used for metrics and alerts.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::RpcError(_) => "rpc",
            BridgeError::ValidationError(_) => "validation",
            BridgeError::SubmissionError(_) => "submission",
            BridgeError::InsufficientLiquidity(_) => "insufficient_liquidity",
            BridgeError::WithdrawalAlreadyExecuted => "already_executed",
            BridgeError::StaleState { .. } => "stale_state",
            BridgeError::InvalidStateTransition { .. } => "invalid_transition",
            BridgeError::TransferNotFound(_) => "not_found",
            BridgeError::CursorRegression { .. } => "cursor_regression",
            BridgeError::SigningError(_) => "signing",
            BridgeError::StorageError(_) => "storage",
            BridgeError::ConfigError(_) => "config",
            BridgeError::InvalidRequest(_) => "invalid_request",
            BridgeError::InternalError(_) => "internal",
        }
    }
}

impl From<rocksdb::Error> for BridgeError {
    fn from(e: rocksdb::Error) -> Self {
        BridgeError::StorageError(e.to_string())
    }
}

impl From<bcs::Error> for BridgeError {
    fn from(e: bcs::Error) -> Self {
        BridgeError::StorageError(format!("bcs: {e}"))
    }
}

impl From<ethers::providers::ProviderError> for BridgeError {
    fn from(e: ethers::providers::ProviderError) -> Self {
        BridgeError::RpcError(e.to_string())
    }
}

impl From<ethers::signers::WalletError> for BridgeError {
    fn from(e: ethers::signers::WalletError) -> Self {
        BridgeError::SigningError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BridgeError::RpcError("timeout".into()).is_transient());
        assert!(!BridgeError::RpcError("timeout".into()).is_fatal());
        assert!(BridgeError::StorageError("io".into()).is_fatal());
        assert!(!BridgeError::ValidationError("bad".into()).is_transient());
        assert!(!BridgeError::SubmissionError("reverted".into()).is_transient());
        assert_eq!(
            BridgeError::InsufficientLiquidity("x".into()).kind(),
            "insufficient_liquidity"
        );
    }
}
