// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Digests and validator signatures for withdrawal authorizations.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{SignedAuthorization, TokenId, TransferId};
use ethers::abi::{encode, Token};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address as EthAddress, Bytes, Signature, H256, U256};
use ethers::utils::{hash_message, keccak256};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

// keccak256(abi.encode(tokenId, transferId, account, amount))
pub fn authorization_digest(
    token_id: TokenId,
    transfer_id: TransferId,
    account: EthAddress,
    amount: U256,
) -> H256 {
    let encoded = encode(&[
        Token::FixedBytes(token_id.as_bytes().to_vec()),
        Token::FixedBytes(transfer_id.as_bytes().to_vec()),
        Token::Address(account),
        Token::Uint(amount),
    ]);
    H256(keccak256(encoded))
}

// keccak256(abi.encodePacked(account, salt)), the id a depositor supplies.
pub fn get_transfer_id(account: EthAddress, salt: [u8; 32]) -> TransferId {
    let mut packed = Vec::with_capacity(20 + 32);
    packed.extend_from_slice(account.as_bytes());
    packed.extend_from_slice(&salt);
    H256(keccak256(packed))
}

pub fn get_random_transfer_id(account: EthAddress) -> TransferId {
    let salt: [u8; 32] = rand::thread_rng().gen();
    get_transfer_id(account, salt)
}

// keccak256(abi.encode(name, symbol)) for fungible tokens.
pub fn get_token_id(name: &str, symbol: &str) -> TokenId {
    let encoded = encode(&[
        Token::String(name.to_string()),
        Token::String(symbol.to_string()),
    ]);
    H256(keccak256(encoded))
}

// Signing capability of the validator. Implementations that can be called
// concurrently serialize use of the key themselves.
pub trait BridgeSigner: Send + Sync {
    fn address(&self) -> EthAddress;

    // Signs `digest` as an EIP-191 personal message; returns r || s || v.
    fn sign_digest(&self, digest: H256) -> BridgeResult<Bytes>;
}

pub struct ValidatorKey {
    wallet: Mutex<LocalWallet>,
    address: EthAddress,
}

impl ValidatorKey {
    pub fn new(wallet: LocalWallet) -> Self {
        let address = wallet.address();
        Self {
            wallet: Mutex::new(wallet),
            address,
        }
    }

    pub fn from_hex(private_key_hex: &str) -> BridgeResult<Self> {
        let wallet = LocalWallet::from_str(private_key_hex.trim())
            .map_err(|e| BridgeError::SigningError(format!("Invalid validator key: {e}")))?;
        Ok(Self::new(wallet))
    }

    pub fn random() -> Self {
        Self::new(LocalWallet::new(&mut rand::thread_rng()))
    }

    // The wallet used to pay for withdrawal transactions, bound to `chain_id`.
    pub fn transaction_wallet(&self, chain_id: u64) -> LocalWallet {
        self.wallet.lock().clone().with_chain_id(chain_id)
    }
}

impl fmt::Debug for ValidatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BridgeSigner for ValidatorKey {
    fn address(&self) -> EthAddress {
        self.address
    }

    fn sign_digest(&self, digest: H256) -> BridgeResult<Bytes> {
        let hash = hash_message(digest.as_bytes());
        let signature = self.wallet.lock().sign_hash(hash)?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

pub fn sign_authorization(
    signer: &dyn BridgeSigner,
    token_id: TokenId,
    transfer_id: TransferId,
    account: EthAddress,
    amount: U256,
) -> BridgeResult<SignedAuthorization> {
    let digest = authorization_digest(token_id, transfer_id, account, amount);
    let signature = signer.sign_digest(digest)?;
    let auth = SignedAuthorization {
        token_id,
        transfer_id,
        account,
        amount,
        signature,
    };
    // The destination contract rejects anything not recovering to the validator.
    verify_authorization(&auth, signer.address())?;
    Ok(auth)
}

pub fn recover_authorization_signer(auth: &SignedAuthorization) -> BridgeResult<EthAddress> {
    let signature = Signature::try_from(auth.signature.as_ref())
        .map_err(|e| BridgeError::SigningError(format!("Malformed signature: {e}")))?;
    let digest = authorization_digest(auth.token_id, auth.transfer_id, auth.account, auth.amount);
    signature
        .recover(digest.as_bytes())
        .map_err(|e| BridgeError::SigningError(format!("Unrecoverable signature: {e}")))
}

pub fn verify_authorization(auth: &SignedAuthorization, expected: EthAddress) -> BridgeResult<()> {
    let recovered = recover_authorization_signer(auth)?;
    if recovered != expected {
        return Err(BridgeError::SigningError(format!(
            "Authorization signed by {recovered:?}, expected {expected:?}"
        )));
    }
    Ok(())
}
