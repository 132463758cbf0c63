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

//! Narrow interfaces to the systems the channel core depends on but does not own.

use alloc::string::String;

/// The fungible balance ledger that actually moves value in and out of escrow.
pub trait BalanceLedger<P> {
    fn balance_of(&self, account: &P) -> u64;

    /// Moves `amount` from `from` into escrow.
    fn debit(&self, from: &P, amount: u64) -> bool;

    /// Moves `amount` out of escrow to `to`.
    fn credit(&self, to: &P, amount: u64) -> bool;
}

pub trait MembershipRegistry<P> {
    fn is_member(&self, account: &P) -> bool;
}

/// Source of the caller-visible current time, in seconds.
pub trait Clock {
    fn now(&self) -> u64;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent<P> {
    Opened {
        channel_id: String,
        participant_a: P,
        participant_b: P,
        deposit: u64,
    },
    CloseInitiated {
        channel_id: String,
        balance_a: u64,
        balance_b: u64,
        nonce: u64,
        deadline: u64,
    },
    Challenged {
        channel_id: String,
        balance_a: u64,
        balance_b: u64,
        nonce: u64,
    },
    Finalized {
        channel_id: String,
        payout_a: u64,
        payout_b: u64,
        fee: u64,
    },
}

pub trait EventSink<P> {
    fn emit(&self, event: ChannelEvent<P>);
}

impl<P, T: BalanceLedger<P>> BalanceLedger<P> for &T {
    fn balance_of(&self, account: &P) -> u64 {
        (**self).balance_of(account)
    }

    fn debit(&self, from: &P, amount: u64) -> bool {
        (**self).debit(from, amount)
    }

    fn credit(&self, to: &P, amount: u64) -> bool {
        (**self).credit(to, amount)
    }
}

impl<P, T: MembershipRegistry<P>> MembershipRegistry<P> for &T {
    fn is_member(&self, account: &P) -> bool {
        (**self).is_member(account)
    }
}

impl<T: Clock> Clock for &T {
    fn now(&self) -> u64 {
        (**self).now()
    }
}

impl<P, T: EventSink<P>> EventSink<P> for &T {
    fn emit(&self, event: ChannelEvent<P>) {
        (**self).emit(event)
    }
}
