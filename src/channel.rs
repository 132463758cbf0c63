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

//! The channel record and its state machine.
//!
//! Transitions are pure: they take the current record and return the next
//! one, leaving persistence and fund movement to the registry.

use alloc::string::String;
use core::fmt::Debug;
use soroban_sdk::contracttype;

use crate::auth::EthAddress;
use crate::Error;

/// A channel participant as seen by the protocol core.
pub trait Party: Clone + Debug + PartialEq {
    /// The identity a caller authenticates as.
    type Account: PartialEq;

    fn account(&self) -> &Self::Account;

    /// The address joint signatures recover to.
    fn signer(&self) -> EthAddress;
}

// Hosts whose accounts are the signing addresses themselves.
impl Party for EthAddress {
    type Account = EthAddress;

    fn account(&self) -> &EthAddress {
        self
    }

    fn signer(&self) -> EthAddress {
        *self
    }
}

#[contracttype]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelStatus {
    Open,
    ClosePending,
    Finalized,
}

impl ChannelStatus {
    fn rank(self) -> u8 {
        match self {
            ChannelStatus::Open => 0,
            ChannelStatus::ClosePending => 1,
            ChannelStatus::Finalized => 2,
        }
    }

    // may_become reports whether the lifecycle allows moving to next.
    pub fn may_become(self, next: ChannelStatus) -> bool {
        match (self, next) {
            (ChannelStatus::ClosePending, ChannelStatus::ClosePending) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// The jointly signed part of a channel state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateUpdate {
    pub balance_a: u64,
    pub balance_b: u64,
    pub nonce: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Channel<P> {
    pub channel_id: String,
    pub participant_a: P,
    pub participant_b: P,
    pub balance_a: u64,
    pub balance_b: u64,
    pub total_deposited: u64,
    pub nonce: u64,
    pub status: ChannelStatus,
    /// Zero while the channel is open.
    pub challenge_deadline: u64,
    pub last_update: u64,
}

impl<P: Party> Channel<P> {
    /// Creates a freshly opened channel in which `opener` holds the whole deposit.
    pub fn open(channel_id: &str, opener: P, counterparty: P, deposit: u64, now: u64) -> Self {
        Channel {
            channel_id: String::from(channel_id),
            participant_a: opener,
            participant_b: counterparty,
            balance_a: deposit,
            balance_b: 0,
            total_deposited: deposit,
            nonce: 0,
            status: ChannelStatus::Open,
            challenge_deadline: 0,
            last_update: now,
        }
    }

    pub fn is_participant(&self, account: &P::Account) -> bool {
        self.participant_a.account() == account || self.participant_b.account() == account
    }

    pub fn signers(&self) -> (EthAddress, EthAddress) {
        (self.participant_a.signer(), self.participant_b.signer())
    }

    /// Moves an open channel into its challenge window.
    ///
    /// The deadline is fixed here and never moves again.
    pub fn initiate_close(
        &self,
        caller: &P::Account,
        update: &StateUpdate,
        now: u64,
        challenge_window: u64,
    ) -> Result<Self, Error> {
        if self.status != ChannelStatus::Open {
            return Err(Error::ChannelNotOpen);
        }
        if !self.is_participant(caller) {
            return Err(Error::NotParticipant);
        }
        self.check_update(update)?;
        let deadline = now
            .checked_add(challenge_window)
            .ok_or(Error::MathOverflow)?;

        let mut next = self.adopt(update, now);
        next.status = ChannelStatus::ClosePending;
        next.challenge_deadline = deadline;
        Ok(next)
    }

    /// Replaces the pending close state with a strictly newer one.
    pub fn challenge(
        &self,
        caller: &P::Account,
        update: &StateUpdate,
        now: u64,
    ) -> Result<Self, Error> {
        if self.status != ChannelStatus::ClosePending {
            return Err(Error::NoPendingClose);
        }
        if now >= self.challenge_deadline {
            return Err(Error::ChallengeWindowClosed);
        }
        if !self.is_participant(caller) {
            return Err(Error::NotParticipant);
        }
        self.check_update(update)?;
        Ok(self.adopt(update, now))
    }

    /// Marks the channel as settled. Payout happens afterwards.
    pub fn finalize(&self, now: u64) -> Result<Self, Error> {
        if self.status != ChannelStatus::ClosePending {
            return Err(Error::NoPendingClose);
        }
        if now < self.challenge_deadline {
            return Err(Error::ChallengeWindowOpen);
        }
        let mut next = self.clone();
        next.status = ChannelStatus::Finalized;
        next.last_update = now;
        Ok(next)
    }

    // check_update enforces the ordering and conservation rules on a proposed state.
    fn check_update(&self, update: &StateUpdate) -> Result<(), Error> {
        if update.nonce <= self.nonce {
            return Err(Error::StaleNonce);
        }
        let total = update
            .balance_a
            .checked_add(update.balance_b)
            .ok_or(Error::MathOverflow)?;
        if total > self.total_deposited {
            return Err(Error::BalanceExceedsDeposit);
        }
        Ok(())
    }

    fn adopt(&self, update: &StateUpdate, now: u64) -> Self {
        let mut next = self.clone();
        next.balance_a = update.balance_a;
        next.balance_b = update.balance_b;
        next.nonce = update.nonce;
        next.last_update = now;
        next
    }

    /// Checks the record-level invariants that must hold after any transition.
    pub fn check_invariants(&self) -> Result<(), Error> {
        let total = self
            .balance_a
            .checked_add(self.balance_b)
            .ok_or(Error::MathOverflow)?;
        if total > self.total_deposited {
            return Err(Error::BalanceExceedsDeposit);
        }
        if self.status == ChannelStatus::Open && self.challenge_deadline != 0 {
            return Err(Error::EncodingError);
        }
        Ok(())
    }
}
