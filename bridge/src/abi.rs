// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Typed bindings for the bridge contract methods the relay uses.

use ethers::contract::abigen;

abigen!(
    EthBridge,
    r#"[
        event BridgeDeposited(bytes32 tokenId, bytes32 depositId, address account, uint256 amount)
        function executeWithdrawal(bytes32 tokenId, bytes32 withdrawId, address account, uint256 amount, bytes signature) external
        function getWithdrawInfo(bytes32 withdrawId) external view returns (bytes32 tokenId, address account, uint256 amount, bool executed)
        function isRegisteredToken(bytes32 tokenId) external view returns (bool)
    ]"#,
);
