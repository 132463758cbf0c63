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

//! The channel core wired to the Soroban host: persistent storage, a token
//! contract, a membership contract, the ledger clock and contract events.

use alloc::vec;
use alloc::vec::Vec;
use soroban_sdk::{
    contractclient, log, symbol_short, token, Address, Bytes, Env, IntoVal, String, Symbol,
};

use crate::channel::Channel;
use crate::collab::{BalanceLedger, ChannelEvent, Clock, EventSink, MembershipRegistry};
use crate::registry::{ChannelRegistry, Settings};
use crate::store::{ChannelStore, Versioned};
use crate::{ChannelRecord, Config, DataKey, Error, Participant};

pub const CHANNELS: Symbol = symbol_short!("CHANNELS");

// Channel entries are kept alive for about 30 days of 5 second ledgers and
// topped up whenever less than a week remains.
const CHANNEL_TTL_THRESHOLD: u32 = 120_960;
const CHANNEL_TTL: u32 = 518_400;

/// The interface expected from the membership registry contract.
#[contractclient(name = "MembershipClient")]
pub trait Membership {
    fn is_member(env: Env, account: Address) -> bool;
}

pub type SorobanRegistry<'a> = ChannelRegistry<
    SorobanStore<'a>,
    TokenLedger<'a>,
    MembershipGate<'a>,
    LedgerClock<'a>,
    EventPublisher<'a>,
>;

// registry builds the channel registry for one contract invocation.
pub fn registry<'a>(env: &'a Env, config: &Config) -> Result<SorobanRegistry<'a>, Error> {
    let settings = Settings {
        fee_rate_bps: config.fee_rate_bps,
        challenge_window: config.challenge_window,
        chain_id: config.chain_id,
    };
    ChannelRegistry::new(
        settings,
        SorobanStore { env },
        TokenLedger {
            env,
            token: config.token.clone(),
        },
        MembershipGate {
            env,
            registry: config.membership.clone(),
        },
        LedgerClock { env },
        EventPublisher { env },
    )
}

pub fn to_rust_string(s: &String) -> Result<alloc::string::String, Error> {
    let mut buf = vec![0u8; s.len() as usize];
    s.copy_into_slice(&mut buf);
    alloc::string::String::from_utf8(buf).map_err(|_| Error::EncodingError)
}

pub fn to_soroban_string(env: &Env, s: &str) -> String {
    s.into_val(env)
}

pub fn to_vec(bytes: &Bytes) -> Vec<u8> {
    let mut buf = vec![0u8; bytes.len() as usize];
    bytes.copy_into_slice(&mut buf);
    buf
}

impl ChannelRecord {
    pub fn from_channel(env: &Env, record: &Versioned<Channel<Participant>>) -> Self {
        let channel = &record.value;
        ChannelRecord {
            channel_id: to_soroban_string(env, &channel.channel_id),
            participant_a: channel.participant_a.clone(),
            participant_b: channel.participant_b.clone(),
            balance_a: channel.balance_a,
            balance_b: channel.balance_b,
            total_deposited: channel.total_deposited,
            nonce: channel.nonce,
            status: channel.status,
            challenge_deadline: channel.challenge_deadline,
            last_update: channel.last_update,
            revision: record.revision,
        }
    }

    pub fn to_channel(&self) -> Result<Versioned<Channel<Participant>>, Error> {
        let channel = Channel {
            channel_id: to_rust_string(&self.channel_id)?,
            participant_a: self.participant_a.clone(),
            participant_b: self.participant_b.clone(),
            balance_a: self.balance_a,
            balance_b: self.balance_b,
            total_deposited: self.total_deposited,
            nonce: self.nonce,
            status: self.status,
            challenge_deadline: self.challenge_deadline,
            last_update: self.last_update,
        };
        channel.check_invariants()?;
        Ok(Versioned {
            revision: self.revision,
            value: channel,
        })
    }
}

pub struct SorobanStore<'a> {
    env: &'a Env,
}

impl SorobanStore<'_> {
    fn key(&self, channel_id: &str) -> DataKey {
        DataKey::Channel(to_soroban_string(self.env, channel_id))
    }
}

impl ChannelStore for SorobanStore<'_> {
    type Party = Participant;

    fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<Participant>>>, Error> {
        let record: Option<ChannelRecord> =
            self.env.storage().persistent().get(&self.key(channel_id));
        record.map(|r| r.to_channel()).transpose()
    }

    fn exists(&self, channel_id: &str) -> Result<bool, Error> {
        Ok(self.env.storage().persistent().has(&self.key(channel_id)))
    }

    fn put(&self, record: Versioned<Channel<Participant>>) -> Result<(), Error> {
        let key = self.key(&record.value.channel_id);
        let persistent = self.env.storage().persistent();
        persistent.set(&key, &ChannelRecord::from_channel(self.env, &record));
        persistent.extend_ttl(&key, CHANNEL_TTL_THRESHOLD, CHANNEL_TTL);
        Ok(())
    }

    fn remove(&self, channel_id: &str) -> Result<(), Error> {
        self.env.storage().persistent().remove(&self.key(channel_id));
        Ok(())
    }
}

/// Escrow held by this contract in a Stellar token.
pub struct TokenLedger<'a> {
    env: &'a Env,
    token: Address,
}

impl BalanceLedger<Participant> for TokenLedger<'_> {
    fn balance_of(&self, account: &Participant) -> u64 {
        let balance = token::Client::new(self.env, &self.token).balance(&account.addr);
        u64::try_from(balance.max(0)).unwrap_or(u64::MAX)
    }

    fn debit(&self, from: &Participant, amount: u64) -> bool {
        let client = token::Client::new(self.env, &self.token);
        let contract = self.env.current_contract_address();
        matches!(
            client.try_transfer(&from.addr, &contract, &i128::from(amount)),
            Ok(Ok(()))
        )
    }

    fn credit(&self, to: &Participant, amount: u64) -> bool {
        let client = token::Client::new(self.env, &self.token);
        let contract = self.env.current_contract_address();
        matches!(
            client.try_transfer(&contract, &to.addr, &i128::from(amount)),
            Ok(Ok(()))
        )
    }
}

pub struct MembershipGate<'a> {
    env: &'a Env,
    registry: Address,
}

impl MembershipRegistry<Participant> for MembershipGate<'_> {
    fn is_member(&self, account: &Participant) -> bool {
        let client = MembershipClient::new(self.env, &self.registry);
        matches!(client.try_is_member(&account.addr), Ok(Ok(true)))
    }
}

pub struct LedgerClock<'a> {
    env: &'a Env,
}

impl Clock for LedgerClock<'_> {
    fn now(&self) -> u64 {
        self.env.ledger().timestamp()
    }
}

pub struct EventPublisher<'a> {
    env: &'a Env,
}

impl EventSink<Participant> for EventPublisher<'_> {
    fn emit(&self, event: ChannelEvent<Participant>) {
        let env = self.env;
        match event {
            ChannelEvent::Opened {
                channel_id,
                participant_a,
                participant_b,
                deposit,
            } => {
                let id = to_soroban_string(env, &channel_id);
                log!(env, "channel opened", id.clone(), deposit);
                env.events().publish(
                    (CHANNELS, symbol_short!("opened"), id),
                    (participant_a.addr, participant_b.addr, deposit),
                );
            }
            ChannelEvent::CloseInitiated {
                channel_id,
                balance_a,
                balance_b,
                nonce,
                deadline,
            } => {
                let id = to_soroban_string(env, &channel_id);
                log!(env, "close initiated", id.clone(), nonce, deadline);
                env.events().publish(
                    (CHANNELS, symbol_short!("closing"), id),
                    (balance_a, balance_b, nonce, deadline),
                );
            }
            ChannelEvent::Challenged {
                channel_id,
                balance_a,
                balance_b,
                nonce,
            } => {
                let id = to_soroban_string(env, &channel_id);
                log!(env, "close challenged", id.clone(), nonce);
                env.events().publish(
                    (CHANNELS, symbol_short!("challenge"), id),
                    (nonce, balance_a, balance_b),
                );
            }
            ChannelEvent::Finalized {
                channel_id,
                payout_a,
                payout_b,
                fee,
            } => {
                let id = to_soroban_string(env, &channel_id);
                log!(env, "channel finalized", id.clone(), payout_a, payout_b, fee);
                env.events().publish(
                    (CHANNELS, symbol_short!("finalized"), id),
                    (payout_a, payout_b, fee),
                );
            }
        }
    }
}
