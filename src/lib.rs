// Copyright 2025 - See NOTICE file for copyright holders.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![no_std]
extern crate alloc;

use soroban_sdk::{
    contract, contracterror, contractimpl, contracttype, symbol_short, Address, Bytes, BytesN,
    Env, IntoVal, String,
};

pub mod auth;
pub mod channel;
pub mod collab;
pub mod host;
pub mod registry;
pub mod settlement;
pub mod store;

#[cfg(any(test, feature = "testutils"))]
pub mod memory;

mod ethsig;

use crate::auth::EthAddress;
use crate::channel::{ChannelStatus, Party, StateUpdate};
use crate::host::CHANNELS;

/// Highest fee rate the contract admin may configure (1 %).
pub const MAX_FEE_RATE_BPS: u32 = 100;

#[contracterror]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Error {
    InvalidChannelId = 1,
    ZeroDeposit = 2,
    SelfChannel = 3,
    InvalidParticipant = 4,
    NotMember = 5,
    InsufficientBalance = 6,
    ChannelAlreadyExists = 7,
    ChannelNotFound = 8,
    ChannelNotOpen = 9,
    NoPendingClose = 10,
    InvalidTransition = 11,
    Conflict = 12,
    StaleNonce = 13,
    NotParticipant = 14,
    InvalidSignatures = 15,
    ChallengeWindowOpen = 16,
    ChallengeWindowClosed = 17,
    BalanceExceedsDeposit = 18,
    InsufficientDeposit = 19,
    TransferFailed = 20,
    MathOverflow = 21,
    FeeRateTooHigh = 22,
    NotInitialized = 23,
    AlreadyInitialized = 24,
    EncodingError = 25,
    InvalidChallengeWindow = 26,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Validation,
    State,
    Ordering,
    Authorization,
    Authentication,
    Timing,
    Settlement,
    Collaborator,
}

impl Error {
    pub fn kind(self) -> ErrorKind {
        match self {
            Error::InvalidChannelId
            | Error::ZeroDeposit
            | Error::SelfChannel
            | Error::InvalidParticipant
            | Error::BalanceExceedsDeposit
            | Error::MathOverflow
            | Error::FeeRateTooHigh
            | Error::InvalidChallengeWindow => ErrorKind::Validation,
            Error::ChannelAlreadyExists
            | Error::ChannelNotFound
            | Error::ChannelNotOpen
            | Error::NoPendingClose
            | Error::InvalidTransition
            | Error::Conflict
            | Error::NotInitialized
            | Error::AlreadyInitialized
            | Error::EncodingError => ErrorKind::State,
            Error::StaleNonce => ErrorKind::Ordering,
            Error::NotParticipant | Error::NotMember => ErrorKind::Authorization,
            Error::InvalidSignatures => ErrorKind::Authentication,
            Error::ChallengeWindowOpen | Error::ChallengeWindowClosed => ErrorKind::Timing,
            Error::InsufficientDeposit | Error::InsufficientBalance => ErrorKind::Settlement,
            Error::TransferFailed => ErrorKind::Collaborator,
        }
    }
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Participant {
    /// Authenticates calls and holds token balances.
    pub addr: Address,
    /// Ethereum-style address the participant signs channel states with.
    pub signer: BytesN<20>,
}

impl Party for Participant {
    type Account = Address;

    fn account(&self) -> &Address {
        &self.addr
    }

    fn signer(&self) -> EthAddress {
        EthAddress::from(self.signer.to_array())
    }
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub participant_a: Participant,
    pub participant_b: Participant,
    pub balance_a: u64,
    pub balance_b: u64,
    pub total_deposited: u64,
    pub nonce: u64,
    pub status: ChannelStatus,
    pub challenge_deadline: u64,
    pub last_update: u64,
    pub revision: u64,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    pub admin: Address,
    pub token: Address,
    pub membership: Address,
    pub fee_rate_bps: u32,
    pub challenge_window: u64,
    pub chain_id: u64,
}

#[contracttype]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataKey {
    Config,
    Channel(String),
}

#[contract]
pub struct PaymentChannel;

#[contractimpl]
impl PaymentChannel {
    pub fn init(
        env: Env,
        admin: Address,
        token: Address,
        membership: Address,
        fee_rate_bps: u32,
        challenge_window: u64,
        chain_id: u64,
    ) -> Result<(), Error> {
        // checks
        if env.storage().instance().has(&DataKey::Config) {
            return Err(Error::AlreadyInitialized);
        }
        if fee_rate_bps > MAX_FEE_RATE_BPS {
            return Err(Error::FeeRateTooHigh);
        }
        if challenge_window == 0 {
            return Err(Error::InvalidChallengeWindow);
        }
        admin.require_auth();

        // effects
        let config = Config {
            admin,
            token,
            membership,
            fee_rate_bps,
            challenge_window,
            chain_id,
        };
        env.storage().instance().set(&DataKey::Config, &config);
        Ok(())
    }

    pub fn set_fee_rate(env: Env, fee_rate_bps: u32) -> Result<(), Error> {
        let mut config = load_config(&env)?;
        config.admin.require_auth();
        if fee_rate_bps > MAX_FEE_RATE_BPS {
            return Err(Error::FeeRateTooHigh);
        }
        config.fee_rate_bps = fee_rate_bps;
        env.storage().instance().set(&DataKey::Config, &config);
        env.events()
            .publish((CHANNELS, symbol_short!("fee_rate")), fee_rate_bps);
        Ok(())
    }

    pub fn config(env: Env) -> Result<Config, Error> {
        load_config(&env)
    }

    pub fn open(
        env: Env,
        caller: Participant,
        channel_id: String,
        counterparty: Participant,
        deposit: u64,
    ) -> Result<ChannelRecord, Error> {
        caller.addr.require_auth();
        // The counterparty vouches for the signing key recorded for it. A
        // channel with oneself is rejected below.
        if counterparty.addr != caller.addr {
            counterparty.addr.require_auth_for_args(
                (channel_id.clone(), counterparty.signer.clone()).into_val(&env),
            );
        }
        let config = load_config(&env)?;
        let id = host::to_rust_string(&channel_id)?;
        host::registry(&env, &config)?.open(caller, &id, counterparty, deposit)?;
        snapshot(&env, channel_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn initiate_close(
        env: Env,
        caller: Address,
        channel_id: String,
        balance_a: u64,
        balance_b: u64,
        nonce: u64,
        sig1: Bytes,
        sig2: Bytes,
    ) -> Result<ChannelRecord, Error> {
        caller.require_auth();
        let config = load_config(&env)?;
        let id = host::to_rust_string(&channel_id)?;
        let update = StateUpdate {
            balance_a,
            balance_b,
            nonce,
        };
        host::registry(&env, &config)?.initiate_close(
            &caller,
            &id,
            &update,
            &host::to_vec(&sig1),
            &host::to_vec(&sig2),
        )?;
        snapshot(&env, channel_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn challenge(
        env: Env,
        caller: Address,
        channel_id: String,
        balance_a: u64,
        balance_b: u64,
        nonce: u64,
        sig1: Bytes,
        sig2: Bytes,
    ) -> Result<ChannelRecord, Error> {
        caller.require_auth();
        let config = load_config(&env)?;
        let id = host::to_rust_string(&channel_id)?;
        let update = StateUpdate {
            balance_a,
            balance_b,
            nonce,
        };
        host::registry(&env, &config)?.challenge(
            &caller,
            &id,
            &update,
            &host::to_vec(&sig1),
            &host::to_vec(&sig2),
        )?;
        snapshot(&env, channel_id)
    }

    // finalize can be called by anyone once the challenge window has passed.
    pub fn finalize(env: Env, channel_id: String) -> Result<ChannelRecord, Error> {
        let config = load_config(&env)?;
        let id = host::to_rust_string(&channel_id)?;
        host::registry(&env, &config)?.finalize(&id)?;
        snapshot(&env, channel_id)
    }

    pub fn get_channel(env: Env, channel_id: String) -> Result<ChannelRecord, Error> {
        let config = load_config(&env)?;
        let id = host::to_rust_string(&channel_id)?;
        host::registry(&env, &config)?.get_channel(&id)?;
        snapshot(&env, channel_id)
    }
}

// load_config returns the contract configuration or an error if init was never called.
pub fn load_config(env: &Env) -> Result<Config, Error> {
    env.storage()
        .instance()
        .get(&DataKey::Config)
        .ok_or(Error::NotInitialized)
}

// snapshot returns the stored record of a channel, including its revision.
pub fn snapshot(env: &Env, channel_id: String) -> Result<ChannelRecord, Error> {
    env.storage()
        .persistent()
        .get(&DataKey::Channel(channel_id))
        .ok_or(Error::ChannelNotFound)
}
