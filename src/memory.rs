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

//! In-memory collaborators for exercising the core without a ledger.
//!
//! These are single-threaded (`RefCell`-based); a multi-threaded host
//! plugs its own transactional store in through `ChannelStore`.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use crate::channel::{Channel, Party};
use crate::collab::{BalanceLedger, ChannelEvent, Clock, EventSink, MembershipRegistry};
use crate::store::{next_revision, ChannelStore, Versioned};
use crate::Error;

pub struct MemoryStore<P> {
    records: RefCell<BTreeMap<String, Versioned<Channel<P>>>>,
}

impl<P> Default for MemoryStore<P> {
    fn default() -> Self {
        MemoryStore {
            records: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<P: Party> ChannelStore for MemoryStore<P> {
    type Party = P;

    fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<P>>>, Error> {
        Ok(self.records.borrow().get(channel_id).cloned())
    }

    fn exists(&self, channel_id: &str) -> Result<bool, Error> {
        Ok(self.records.borrow().contains_key(channel_id))
    }

    fn put(&self, record: Versioned<Channel<P>>) -> Result<(), Error> {
        self.records
            .borrow_mut()
            .insert(record.value.channel_id.clone(), record);
        Ok(())
    }

    fn remove(&self, channel_id: &str) -> Result<(), Error> {
        self.records.borrow_mut().remove(channel_id);
        Ok(())
    }

    fn compare_and_swap(&self, expected: Option<u64>, channel: Channel<P>) -> Result<u64, Error> {
        let mut records = self.records.borrow_mut();
        let current = records.get(&channel.channel_id).map(|r| r.revision);
        if current != expected {
            return Err(Error::Conflict);
        }
        let revision = next_revision(expected)?;
        records.insert(
            channel.channel_id.clone(),
            Versioned {
                revision,
                value: channel,
            },
        );
        Ok(revision)
    }
}

/// A token ledger with a single escrow pot.
pub struct MemoryLedger<P> {
    balances: RefCell<Vec<(P, u64)>>,
    escrow: Cell<u64>,
    refused: RefCell<Vec<P>>,
    credits: Cell<u32>,
}

impl<P> Default for MemoryLedger<P> {
    fn default() -> Self {
        MemoryLedger {
            balances: RefCell::new(Vec::new()),
            escrow: Cell::new(0),
            refused: RefCell::new(Vec::new()),
            credits: Cell::new(0),
        }
    }
}

impl<P: PartialEq + Clone> MemoryLedger<P> {
    pub fn mint(&self, account: &P, amount: u64) {
        let mut balances = self.balances.borrow_mut();
        match balances.iter_mut().find(|(owner, _)| owner == account) {
            Some((_, balance)) => *balance += amount,
            None => balances.push((account.clone(), amount)),
        }
    }

    pub fn fund_escrow(&self, amount: u64) {
        self.escrow.set(self.escrow.get() + amount);
    }

    pub fn escrow(&self) -> u64 {
        self.escrow.get()
    }

    /// Makes every later credit to `account` fail.
    pub fn refuse_credit(&self, account: &P) {
        self.refused.borrow_mut().push(account.clone());
    }

    pub fn accept_credit(&self, account: &P) {
        self.refused.borrow_mut().retain(|p| p != account);
    }

    /// Number of successful credits.
    pub fn credits(&self) -> u32 {
        self.credits.get()
    }
}

impl<P: PartialEq + Clone> BalanceLedger<P> for MemoryLedger<P> {
    fn balance_of(&self, account: &P) -> u64 {
        self.balances
            .borrow()
            .iter()
            .find(|(owner, _)| owner == account)
            .map_or(0, |(_, balance)| *balance)
    }

    fn debit(&self, from: &P, amount: u64) -> bool {
        let mut balances = self.balances.borrow_mut();
        match balances.iter_mut().find(|(owner, _)| owner == from) {
            Some((_, balance)) if *balance >= amount => {
                *balance -= amount;
                self.escrow.set(self.escrow.get() + amount);
                true
            }
            _ => false,
        }
    }

    fn credit(&self, to: &P, amount: u64) -> bool {
        if self.refused.borrow().contains(to) || self.escrow.get() < amount {
            return false;
        }
        self.escrow.set(self.escrow.get() - amount);
        self.credits.set(self.credits.get() + 1);
        self.mint(to, amount);
        true
    }
}

pub struct AllowList<P> {
    members: RefCell<Vec<P>>,
}

impl<P> Default for AllowList<P> {
    fn default() -> Self {
        AllowList {
            members: RefCell::new(Vec::new()),
        }
    }
}

impl<P: PartialEq + Clone> AllowList<P> {
    pub fn admit(&self, account: &P) {
        self.members.borrow_mut().push(account.clone());
    }

    pub fn revoke(&self, account: &P) {
        self.members.borrow_mut().retain(|p| p != account);
    }
}

impl<P: PartialEq> MembershipRegistry<P> for AllowList<P> {
    fn is_member(&self, account: &P) -> bool {
        self.members.borrow().contains(account)
    }
}

#[derive(Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub fn at(now: u64) -> Self {
        ManualClock {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.set(now);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.set(self.now.get() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}

pub struct EventLog<P> {
    events: RefCell<Vec<ChannelEvent<P>>>,
}

impl<P> Default for EventLog<P> {
    fn default() -> Self {
        EventLog {
            events: RefCell::new(Vec::new()),
        }
    }
}

impl<P: Clone> EventLog<P> {
    pub fn events(&self) -> Vec<ChannelEvent<P>> {
        self.events.borrow().clone()
    }
}

impl<P> EventSink<P> for EventLog<P> {
    fn emit(&self, event: ChannelEvent<P>) {
        self.events.borrow_mut().push(event);
    }
}
