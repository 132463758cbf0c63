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

//! The public channel operations.
//!
//! Every mutating operation follows checks, effects, interactions: the
//! record is validated and committed through a compare-and-swap before any
//! funds move. A lost race is retried from a fresh read, so whatever wins is
//! re-validated against the newest record.

use alloy_sol_types::Eip712Domain;

use crate::auth::{self, EthAddress};
use crate::channel::{Channel, Party, StateUpdate};
use crate::collab::{BalanceLedger, ChannelEvent, Clock, EventSink, MembershipRegistry};
use crate::settlement::{self, Payout, BPS_DENOMINATOR};
use crate::store::{ChannelStore, Versioned};
use crate::Error;

pub const DEFAULT_CHALLENGE_WINDOW: u64 = 24 * 60 * 60;

pub const MAX_CHANNEL_ID_LEN: usize = 96;

/// Attempts per operation before a contended channel gives up with `Conflict`.
pub const MAX_UPDATE_ATTEMPTS: usize = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Settings {
    pub fee_rate_bps: u32,
    /// Seconds between the first close request and the earliest finalize.
    pub challenge_window: u64,
    /// Signature domain separator.
    pub chain_id: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            fee_rate_bps: 0,
            challenge_window: DEFAULT_CHALLENGE_WINDOW,
            chain_id: 0,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.fee_rate_bps > BPS_DENOMINATOR {
            return Err(Error::FeeRateTooHigh);
        }
        if self.challenge_window == 0 {
            return Err(Error::InvalidChallengeWindow);
        }
        Ok(())
    }
}

pub struct ChannelRegistry<S, L, M, C, E> {
    settings: Settings,
    domain: Eip712Domain,
    store: S,
    ledger: L,
    membership: M,
    clock: C,
    events: E,
}

impl<S, L, M, C, E> ChannelRegistry<S, L, M, C, E>
where
    S: ChannelStore,
    L: BalanceLedger<S::Party>,
    M: MembershipRegistry<S::Party>,
    C: Clock,
    E: EventSink<S::Party>,
{
    pub fn new(
        settings: Settings,
        store: S,
        ledger: L,
        membership: M,
        clock: C,
        events: E,
    ) -> Result<Self, Error> {
        settings.validate()?;
        Ok(ChannelRegistry {
            settings,
            domain: auth::domain(settings.chain_id),
            store,
            ledger,
            membership,
            clock,
            events,
        })
    }

    pub fn domain(&self) -> &Eip712Domain {
        &self.domain
    }

    /// Opens a channel funded entirely by `caller`.
    pub fn open(
        &self,
        caller: S::Party,
        channel_id: &str,
        counterparty: S::Party,
        deposit: u64,
    ) -> Result<Channel<S::Party>, Error> {
        // checks
        check_channel_id(channel_id)?;
        if deposit == 0 {
            return Err(Error::ZeroDeposit);
        }
        if caller.signer() == EthAddress::ZERO || counterparty.signer() == EthAddress::ZERO {
            return Err(Error::InvalidParticipant);
        }
        if caller == counterparty
            || caller.account() == counterparty.account()
            || caller.signer() == counterparty.signer()
        {
            return Err(Error::SelfChannel);
        }
        if self.store.exists(channel_id)? {
            return Err(Error::ChannelAlreadyExists);
        }
        if !self.membership.is_member(&caller) || !self.membership.is_member(&counterparty) {
            return Err(Error::NotMember);
        }
        if self.ledger.balance_of(&caller) < deposit {
            return Err(Error::InsufficientBalance);
        }

        // effects
        let channel = Channel::open(channel_id, caller, counterparty, deposit, self.clock.now());
        channel.check_invariants()?;
        match self.store.compare_and_swap(None, channel.clone()) {
            Err(Error::Conflict) => return Err(Error::ChannelAlreadyExists),
            result => result?,
        };

        // interact
        if !self.ledger.debit(&channel.participant_a, deposit) {
            self.store.remove(channel_id)?;
            return Err(Error::TransferFailed);
        }

        self.events.emit(ChannelEvent::Opened {
            channel_id: channel.channel_id.clone(),
            participant_a: channel.participant_a.clone(),
            participant_b: channel.participant_b.clone(),
            deposit,
        });
        Ok(channel)
    }

    /// Starts the challenge window with a jointly signed state.
    pub fn initiate_close(
        &self,
        caller: &<S::Party as Party>::Account,
        channel_id: &str,
        update: &StateUpdate,
        sig1: &[u8],
        sig2: &[u8],
    ) -> Result<Channel<S::Party>, Error> {
        let window = self.settings.challenge_window;
        let channel = self.apply_update(channel_id, update, sig1, sig2, |current, now| {
            current.initiate_close(caller, update, now, window)
        })?;
        self.events.emit(ChannelEvent::CloseInitiated {
            channel_id: channel.channel_id.clone(),
            balance_a: channel.balance_a,
            balance_b: channel.balance_b,
            nonce: channel.nonce,
            deadline: channel.challenge_deadline,
        });
        Ok(channel)
    }

    /// Supersedes a pending close with a newer jointly signed state.
    pub fn challenge(
        &self,
        caller: &<S::Party as Party>::Account,
        channel_id: &str,
        update: &StateUpdate,
        sig1: &[u8],
        sig2: &[u8],
    ) -> Result<Channel<S::Party>, Error> {
        let channel = self.apply_update(channel_id, update, sig1, sig2, |current, now| {
            current.challenge(caller, update, now)
        })?;
        self.events.emit(ChannelEvent::Challenged {
            channel_id: channel.channel_id.clone(),
            balance_a: channel.balance_a,
            balance_b: channel.balance_b,
            nonce: channel.nonce,
        });
        Ok(channel)
    }

    /// Settles a channel whose challenge window has passed. Anyone may call it.
    pub fn finalize(&self, channel_id: &str) -> Result<Payout, Error> {
        check_channel_id(channel_id)?;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            // checks
            let record = self.load(channel_id)?;
            let next = record.value.finalize(self.clock.now())?;
            let payout = settlement::plan(&next, self.settings.fee_rate_bps)?;

            // effects
            let revision = match self.commit(&record, next.clone()) {
                Err(Error::Conflict) => continue,
                result => result?,
            };

            // interact
            if let Err(unpaid) = settlement::pay_out(&self.ledger, &next, &payout) {
                // Back to pending, owing only what was not paid. Undoing our
                // own commit is the one way Finalized steps back.
                let mut restored = record.value;
                restored.balance_a = unpaid.amount_a;
                restored.balance_b = unpaid.amount_b;
                restored.check_invariants()?;
                self.store
                    .compare_and_swap(Some(revision), restored)
                    .map_err(|_| Error::TransferFailed)?;
                return Err(Error::TransferFailed);
            }

            self.events.emit(ChannelEvent::Finalized {
                channel_id: next.channel_id,
                payout_a: payout.amount_a,
                payout_b: payout.amount_b,
                fee: payout.fee,
            });
            return Ok(payout);
        }
        Err(Error::Conflict)
    }

    pub fn get_channel(&self, channel_id: &str) -> Result<Channel<S::Party>, Error> {
        check_channel_id(channel_id)?;
        Ok(self.load(channel_id)?.value)
    }

    // apply_update runs a signed transition until it commits or fails validation.
    fn apply_update<F>(
        &self,
        channel_id: &str,
        update: &StateUpdate,
        sig1: &[u8],
        sig2: &[u8],
        transition: F,
    ) -> Result<Channel<S::Party>, Error>
    where
        F: Fn(&Channel<S::Party>, u64) -> Result<Channel<S::Party>, Error>,
    {
        check_channel_id(channel_id)?;
        let digest = auth::state_digest(&self.domain, channel_id, update);
        let mut authenticated = false;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let record = self.load(channel_id)?;
            let next = transition(&record.value, self.clock.now())?;
            // Participants never change, so one successful check covers every retry.
            if !authenticated {
                if !auth::verify_joint_signature(&digest, sig1, sig2, record.value.signers()) {
                    return Err(Error::InvalidSignatures);
                }
                authenticated = true;
            }
            match self.commit(&record, next.clone()) {
                Ok(_) => return Ok(next),
                Err(Error::Conflict) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::Conflict)
    }

    fn load(&self, channel_id: &str) -> Result<Versioned<Channel<S::Party>>, Error> {
        self.store.get(channel_id)?.ok_or(Error::ChannelNotFound)
    }

    fn commit(
        &self,
        current: &Versioned<Channel<S::Party>>,
        next: Channel<S::Party>,
    ) -> Result<u64, Error> {
        if !current.value.status.may_become(next.status) {
            return Err(Error::InvalidTransition);
        }
        next.check_invariants()?;
        self.store.compare_and_swap(Some(current.revision), next)
    }
}

pub fn check_channel_id(channel_id: &str) -> Result<(), Error> {
    if channel_id.is_empty() || channel_id.len() > MAX_CHANNEL_ID_LEN {
        return Err(Error::InvalidChannelId);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SIGNATURE_LEN;
    use crate::channel::ChannelStatus;
    use crate::ethsig::ethsig::EthSigner;
    use crate::memory::{AllowList, EventLog, ManualClock, MemoryLedger, MemoryStore};
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    const WINDOW: u64 = 3_600;
    const CHAIN: u64 = 31337;
    const START: u64 = 1_000;

    type Registry<'a, S, L> = ChannelRegistry<
        S,
        L,
        &'a AllowList<EthAddress>,
        &'a ManualClock,
        &'a EventLog<EthAddress>,
    >;

    struct Fixture {
        alice: EthSigner,
        bob: EthSigner,
        store: MemoryStore<EthAddress>,
        ledger: MemoryLedger<EthAddress>,
        members: AllowList<EthAddress>,
        clock: ManualClock,
        events: EventLog<EthAddress>,
    }

    impl Fixture {
        fn new() -> Self {
            let fixture = Fixture {
                alice: EthSigner::from_seed(11),
                bob: EthSigner::from_seed(12),
                store: MemoryStore::default(),
                ledger: MemoryLedger::default(),
                members: AllowList::default(),
                clock: ManualClock::at(START),
                events: EventLog::default(),
            };
            for party in [fixture.a(), fixture.b()] {
                fixture.ledger.mint(&party, 5_000);
                fixture.members.admit(&party);
            }
            fixture
        }

        fn a(&self) -> EthAddress {
            self.alice.address()
        }

        fn b(&self) -> EthAddress {
            self.bob.address()
        }

        fn settings(fee_rate_bps: u32) -> Settings {
            Settings {
                fee_rate_bps,
                challenge_window: WINDOW,
                chain_id: CHAIN,
            }
        }

        fn registry(
            &self,
            fee_rate_bps: u32,
        ) -> Registry<'_, &MemoryStore<EthAddress>, &MemoryLedger<EthAddress>> {
            self.registry_with(&self.store, &self.ledger, fee_rate_bps)
        }

        fn registry_with<'a, S, L>(
            &'a self,
            store: S,
            ledger: L,
            fee_rate_bps: u32,
        ) -> Registry<'a, S, L>
        where
            S: ChannelStore<Party = EthAddress>,
            L: BalanceLedger<EthAddress>,
        {
            ChannelRegistry::new(
                Self::settings(fee_rate_bps),
                store,
                ledger,
                &self.members,
                &self.clock,
                &self.events,
            )
            .unwrap()
        }

        fn sign(&self, channel_id: &str, update: &StateUpdate) -> ([u8; 65], [u8; 65]) {
            let digest = auth::state_digest(&auth::domain(CHAIN), channel_id, update);
            (self.alice.sign_digest(&digest), self.bob.sign_digest(&digest))
        }
    }

    fn update(balance_a: u64, balance_b: u64, nonce: u64) -> StateUpdate {
        StateUpdate {
            balance_a,
            balance_b,
            nonce,
        }
    }

    #[test]
    fn full_lifecycle() {
        let f = Fixture::new();
        let registry = f.registry(5);

        // 1. open
        let channel = registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        assert_eq!(
            (channel.balance_a, channel.balance_b, channel.nonce),
            (1000, 0, 0)
        );
        assert_eq!(channel.status, ChannelStatus::Open);
        assert_eq!(f.ledger.balance_of(&f.a()), 4_000);
        assert_eq!(f.ledger.escrow(), 1000);

        // 2. initiate close
        let first = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &first);
        let closing = registry
            .initiate_close(&f.a(), "c1", &first, &sig_a, &sig_b)
            .unwrap();
        assert_eq!(closing.status, ChannelStatus::ClosePending);
        assert_eq!(closing.challenge_deadline, START + WINDOW);

        // 3. challenge with a newer state
        f.clock.advance(WINDOW - 1);
        let newer = update(500, 500, 2);
        let (sig_a, sig_b) = f.sign("c1", &newer);
        let challenged = registry
            .challenge(&f.b(), "c1", &newer, &sig_a, &sig_b)
            .unwrap();
        assert_eq!(
            (challenged.balance_a, challenged.balance_b, challenged.nonce),
            (500, 500, 2)
        );
        assert_eq!(challenged.challenge_deadline, START + WINDOW);

        // 4. same nonce is rejected
        let replay = update(900, 0, 2);
        let (sig_a, sig_b) = f.sign("c1", &replay);
        assert_eq!(
            registry.challenge(&f.a(), "c1", &replay, &sig_a, &sig_b),
            Err(Error::StaleNonce)
        );
        assert_eq!(registry.get_channel("c1").unwrap(), challenged);

        // 5. finalize too early
        assert_eq!(registry.finalize("c1"), Err(Error::ChallengeWindowOpen));

        // 6. finalize after the deadline
        f.clock.advance(1);
        let payout = registry.finalize("c1").unwrap();
        assert_eq!(
            payout,
            Payout {
                amount_a: 500,
                amount_b: 500,
                fee: 0
            }
        );
        assert_eq!(f.ledger.balance_of(&f.a()), 4_500);
        assert_eq!(f.ledger.balance_of(&f.b()), 5_500);
        assert_eq!(
            registry.get_channel("c1").unwrap().status,
            ChannelStatus::Finalized
        );
        assert_eq!(registry.finalize("c1"), Err(Error::NoPendingClose));
        assert_eq!(Error::NoPendingClose.kind(), crate::ErrorKind::State);

        let events = f.events.events();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[3],
            ChannelEvent::Finalized {
                channel_id: "c1".into(),
                payout_a: 500,
                payout_b: 500,
                fee: 0
            }
        );
    }

    #[test]
    fn open_validation() {
        let f = Fixture::new();
        let registry = f.registry(0);
        let outsider = EthSigner::from_seed(99).address();
        f.ledger.mint(&outsider, 5_000);

        assert_eq!(
            registry.open(f.a(), "", f.b(), 10),
            Err(Error::InvalidChannelId)
        );
        let long_id: alloc::string::String = core::iter::repeat('x').take(MAX_CHANNEL_ID_LEN + 1).collect();
        assert_eq!(
            registry.open(f.a(), &long_id, f.b(), 10),
            Err(Error::InvalidChannelId)
        );
        assert_eq!(registry.open(f.a(), "c1", f.b(), 0), Err(Error::ZeroDeposit));
        assert_eq!(registry.open(f.a(), "c1", f.a(), 10), Err(Error::SelfChannel));
        assert_eq!(
            registry.open(f.a(), "c1", EthAddress::ZERO, 10),
            Err(Error::InvalidParticipant)
        );
        assert_eq!(
            registry.open(f.a(), "c1", outsider, 10),
            Err(Error::NotMember)
        );
        assert_eq!(
            registry.open(outsider, "c1", f.a(), 10),
            Err(Error::NotMember)
        );
        assert_eq!(
            registry.open(f.a(), "c1", f.b(), 5_001),
            Err(Error::InsufficientBalance)
        );
        assert_eq!(f.store.exists("c1"), Ok(false));

        registry.open(f.a(), "c1", f.b(), 10).unwrap();
        assert_eq!(
            registry.open(f.b(), "c1", f.a(), 10),
            Err(Error::ChannelAlreadyExists)
        );
        assert_eq!(f.ledger.balance_of(&f.b()), 5_000);
        assert_eq!(f.events.events().len(), 1);
    }

    #[test]
    fn revoked_member_cannot_open() {
        let f = Fixture::new();
        let registry = f.registry(0);
        f.members.revoke(&f.b());
        assert_eq!(registry.open(f.a(), "c1", f.b(), 10), Err(Error::NotMember));
    }

    #[test]
    fn unknown_channel() {
        let f = Fixture::new();
        let registry = f.registry(0);
        let (sig_a, sig_b) = f.sign("nope", &update(1, 1, 1));
        assert_eq!(
            registry.initiate_close(&f.a(), "nope", &update(1, 1, 1), &sig_a, &sig_b),
            Err(Error::ChannelNotFound)
        );
        assert_eq!(registry.finalize("nope"), Err(Error::ChannelNotFound));
        assert_eq!(registry.get_channel("nope"), Err(Error::ChannelNotFound));
        assert_eq!(registry.get_channel(""), Err(Error::InvalidChannelId));
    }

    #[test]
    fn close_requires_both_signatures() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();

        let proposed = update(0, 1000, 1);
        let digest = auth::state_digest(registry.domain(), "c1", &proposed);
        let sig_b = f.bob.sign_digest(&digest);
        let forged = EthSigner::from_seed(66).sign_digest(&digest);

        assert_eq!(
            registry.initiate_close(&f.b(), "c1", &proposed, &sig_b, &sig_b),
            Err(Error::InvalidSignatures)
        );
        assert_eq!(
            registry.initiate_close(&f.b(), "c1", &proposed, &forged, &sig_b),
            Err(Error::InvalidSignatures)
        );
        assert_eq!(
            registry.initiate_close(&f.b(), "c1", &proposed, &sig_b[..64], &sig_b),
            Err(Error::InvalidSignatures)
        );
        assert_eq!(
            registry.initiate_close(&f.b(), "c1", &proposed, &[0u8; SIGNATURE_LEN], &sig_b),
            Err(Error::InvalidSignatures)
        );
        let channel = registry.get_channel("c1").unwrap();
        assert_eq!(channel.status, ChannelStatus::Open);
        assert_eq!(channel.nonce, 0);
    }

    #[test]
    fn signature_order_does_not_matter() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        registry.open(f.a(), "c2", f.b(), 1000).unwrap();

        let proposed = update(300, 700, 4);
        let (sig_a, sig_b) = f.sign("c1", &proposed);
        let straight = registry.initiate_close(&f.a(), "c1", &proposed, &sig_a, &sig_b);
        let (sig_a, sig_b) = f.sign("c2", &proposed);
        let swapped = registry.initiate_close(&f.a(), "c2", &proposed, &sig_b, &sig_a);
        assert!(straight.is_ok());
        assert!(swapped.is_ok());
    }

    #[test]
    fn signatures_for_other_channel_are_rejected() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        registry.open(f.a(), "c2", f.b(), 1000).unwrap();

        let proposed = update(0, 1000, 1);
        let (sig_a, sig_b) = f.sign("c2", &proposed);
        assert_eq!(
            registry.initiate_close(&f.a(), "c1", &proposed, &sig_a, &sig_b),
            Err(Error::InvalidSignatures)
        );
    }

    #[test]
    fn outsider_cannot_submit() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let proposed = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &proposed);
        let relayer = EthAddress::repeat_byte(0x77);
        assert_eq!(
            registry.initiate_close(&relayer, "c1", &proposed, &sig_a, &sig_b),
            Err(Error::NotParticipant)
        );
    }

    #[test]
    fn balances_cannot_exceed_deposit() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let greedy = update(600, 401, 1);
        let (sig_a, sig_b) = f.sign("c1", &greedy);
        assert_eq!(
            registry.initiate_close(&f.a(), "c1", &greedy, &sig_a, &sig_b),
            Err(Error::BalanceExceedsDeposit)
        );
    }

    #[test]
    fn challenge_window_closes() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let first = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &first);
        registry
            .initiate_close(&f.a(), "c1", &first, &sig_a, &sig_b)
            .unwrap();

        f.clock.set(START + WINDOW);
        let late = update(400, 600, 2);
        let (sig_a, sig_b) = f.sign("c1", &late);
        assert_eq!(
            registry.challenge(&f.b(), "c1", &late, &sig_a, &sig_b),
            Err(Error::ChallengeWindowClosed)
        );
    }

    #[test]
    fn challenge_needs_pending_close() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let proposed = update(400, 600, 1);
        let (sig_a, sig_b) = f.sign("c1", &proposed);
        assert_eq!(
            registry.challenge(&f.b(), "c1", &proposed, &sig_a, &sig_b),
            Err(Error::NoPendingClose)
        );
        assert_eq!(registry.finalize("c1"), Err(Error::NoPendingClose));
    }

    #[test]
    fn repeated_challenges_do_not_extend_deadline() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();

        let mut last_nonce = 0;
        for (step, nonce) in [1u64, 2, 5, 9].into_iter().enumerate() {
            let proposed = update(1000 - nonce * 10, nonce * 10, nonce);
            let (sig_a, sig_b) = f.sign("c1", &proposed);
            let channel = if step == 0 {
                registry.initiate_close(&f.a(), "c1", &proposed, &sig_a, &sig_b)
            } else {
                registry.challenge(&f.b(), "c1", &proposed, &sig_a, &sig_b)
            }
            .unwrap();
            assert!(channel.nonce > last_nonce);
            assert_eq!(channel.challenge_deadline, START + WINDOW);
            last_nonce = channel.nonce;
            f.clock.advance(WINDOW / 8);
        }
    }

    #[test]
    fn fee_must_fit_in_deposit() {
        let f = Fixture::new();
        let registry = f.registry(100);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let full = update(500, 500, 1);
        let (sig_a, sig_b) = f.sign("c1", &full);
        registry
            .initiate_close(&f.a(), "c1", &full, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);

        assert_eq!(registry.finalize("c1"), Err(Error::InsufficientDeposit));
        assert_eq!(
            registry.get_channel("c1").unwrap().status,
            ChannelStatus::ClosePending
        );

        // Retry once the fee is lowered.
        let cheaper = f.registry(0);
        assert!(cheaper.finalize("c1").is_ok());
    }

    #[test]
    fn fee_stays_in_escrow() {
        let f = Fixture::new();
        let registry = f.registry(100);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let split = update(490, 500, 1);
        let (sig_a, sig_b) = f.sign("c1", &split);
        registry
            .initiate_close(&f.a(), "c1", &split, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);
        let payout = registry.finalize("c1").unwrap();
        assert_eq!(payout.fee, 10);
        assert_eq!(f.ledger.escrow(), 10);
    }

    #[test]
    fn zero_payouts_are_skipped() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let all_to_b = update(0, 1000, 1);
        let (sig_a, sig_b) = f.sign("c1", &all_to_b);
        registry
            .initiate_close(&f.a(), "c1", &all_to_b, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);
        registry.finalize("c1").unwrap();
        assert_eq!(f.ledger.credits(), 1);
        assert_eq!(f.ledger.balance_of(&f.b()), 6_000);
    }

    #[test]
    fn failed_deposit_leaves_no_channel() {
        let f = Fixture::new();
        let ledger = RefusingDebits(&f.ledger);
        let registry = f.registry_with(&f.store, &ledger, 0);
        assert_eq!(
            registry.open(f.a(), "c1", f.b(), 100),
            Err(Error::TransferFailed)
        );
        assert_eq!(f.store.exists("c1"), Ok(false));
        assert!(f.events.events().is_empty());
    }

    #[test]
    fn failed_payout_is_retryable_without_double_pay() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let split = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &split);
        registry
            .initiate_close(&f.a(), "c1", &split, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);

        f.ledger.refuse_credit(&f.b());
        assert_eq!(registry.finalize("c1"), Err(Error::TransferFailed));
        let pending = registry.get_channel("c1").unwrap();
        assert_eq!(pending.status, ChannelStatus::ClosePending);
        assert_eq!((pending.balance_a, pending.balance_b), (0, 400));
        assert_eq!(f.ledger.balance_of(&f.a()), 4_600);

        f.ledger.accept_credit(&f.b());
        registry.finalize("c1").unwrap();
        assert_eq!(f.ledger.balance_of(&f.a()), 4_600);
        assert_eq!(f.ledger.balance_of(&f.b()), 5_400);
        assert_eq!(f.ledger.escrow(), 0);
    }

    #[test]
    fn channel_is_finalized_before_payout() {
        let f = Fixture::new();
        let ledger = Observing {
            inner: &f.ledger,
            store: &f.store,
            seen: RefCell::new(Vec::new()),
        };
        let registry = f.registry_with(&f.store, &ledger, 0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let split = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &split);
        registry
            .initiate_close(&f.a(), "c1", &split, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);
        registry.finalize("c1").unwrap();

        assert_eq!(
            *ledger.seen.borrow(),
            [ChannelStatus::Finalized, ChannelStatus::Finalized]
        );
    }

    #[test]
    fn lower_nonce_loses_race() {
        let f = Fixture::new();
        let racing = Racing::new(&f.store);
        let registry = f.registry_with(&racing, &f.ledger, 0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let first = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &first);
        let closing = registry
            .initiate_close(&f.a(), "c1", &first, &sig_a, &sig_b)
            .unwrap();

        // Nonce 3 lands between our read and our write.
        let mut rival = closing.clone();
        rival.balance_a = 100;
        rival.balance_b = 900;
        rival.nonce = 3;
        racing.queue(rival.clone());

        let mine = update(200, 800, 2);
        let (sig_a, sig_b) = f.sign("c1", &mine);
        assert_eq!(
            registry.challenge(&f.a(), "c1", &mine, &sig_a, &sig_b),
            Err(Error::StaleNonce)
        );
        assert_eq!(registry.get_channel("c1").unwrap(), rival);
    }

    #[test]
    fn higher_nonce_survives_race() {
        let f = Fixture::new();
        let racing = Racing::new(&f.store);
        let registry = f.registry_with(&racing, &f.ledger, 0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let first = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &first);
        let closing = registry
            .initiate_close(&f.a(), "c1", &first, &sig_a, &sig_b)
            .unwrap();

        let mut rival = closing;
        rival.nonce = 2;
        racing.queue(rival);

        let mine = update(200, 800, 3);
        let (sig_a, sig_b) = f.sign("c1", &mine);
        let channel = registry
            .challenge(&f.b(), "c1", &mine, &sig_a, &sig_b)
            .unwrap();
        assert_eq!(channel.nonce, 3);
        assert_eq!(registry.get_channel("c1").unwrap().nonce, 3);
    }

    #[test]
    fn finalize_races_once() {
        let f = Fixture::new();
        let racing = Racing::new(&f.store);
        let registry = f.registry_with(&racing, &f.ledger, 0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let split = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &split);
        let closing = registry
            .initiate_close(&f.a(), "c1", &split, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);

        // Someone else finalizes first.
        let mut rival = closing;
        rival.status = ChannelStatus::Finalized;
        racing.queue(rival);

        assert_eq!(registry.finalize("c1"), Err(Error::NoPendingClose));
        assert_eq!(f.ledger.credits(), 0);
    }

    #[test]
    fn endless_contention_gives_up() {
        let f = Fixture::new();
        let racing = Racing::new(&f.store);
        let registry = f.registry_with(&racing, &f.ledger, 0);
        let opened = registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            racing.queue(opened.clone());
        }
        let first = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &first);
        assert_eq!(
            registry.initiate_close(&f.a(), "c1", &first, &sig_a, &sig_b),
            Err(Error::Conflict)
        );
        assert_eq!(
            registry.get_channel("c1").unwrap().status,
            ChannelStatus::Open
        );
    }

    #[test]
    fn reads_are_stable() {
        let f = Fixture::new();
        let registry = f.registry(0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let first = registry.get_channel("c1").unwrap();
        f.clock.advance(10_000);
        assert_eq!(registry.get_channel("c1").unwrap(), first);
        assert_eq!(registry.get_channel("c1").unwrap(), first);
    }

    #[test]
    fn rejects_fee_rate_above_whole() {
        let f = Fixture::new();
        let result = ChannelRegistry::new(
            Settings {
                fee_rate_bps: BPS_DENOMINATOR + 1,
                ..Settings::default()
            },
            &f.store,
            &f.ledger,
            &f.members,
            &f.clock,
            &f.events,
        );
        assert!(matches!(result, Err(Error::FeeRateTooHigh)));
    }

    #[test]
    fn rejects_zero_challenge_window() {
        let f = Fixture::new();
        let settings = Settings {
            challenge_window: 0,
            ..Fixture::settings(0)
        };
        assert_eq!(settings.validate(), Err(Error::InvalidChallengeWindow));
        let result = ChannelRegistry::new(
            settings,
            &f.store,
            &f.ledger,
            &f.members,
            &f.clock,
            &f.events,
        );
        assert!(matches!(result, Err(Error::InvalidChallengeWindow)));
        assert_eq!(Settings::default().validate(), Ok(()));
    }

    #[test]
    fn failed_restore_still_reports_transfer_failure() {
        let f = Fixture::new();
        // open, close and the finalize commit go through; the restore does not.
        let store = Stalling {
            inner: &f.store,
            swaps_left: Cell::new(3),
        };
        let registry = f.registry_with(&store, &f.ledger, 0);
        registry.open(f.a(), "c1", f.b(), 1000).unwrap();
        let split = update(600, 400, 1);
        let (sig_a, sig_b) = f.sign("c1", &split);
        registry
            .initiate_close(&f.a(), "c1", &split, &sig_a, &sig_b)
            .unwrap();
        f.clock.advance(WINDOW);

        f.ledger.refuse_credit(&f.b());
        assert_eq!(registry.finalize("c1"), Err(Error::TransferFailed));
        assert_eq!(f.ledger.balance_of(&f.a()), 4_600);
        assert_eq!(f.ledger.escrow(), 400);
    }

    struct RefusingDebits<'a>(&'a MemoryLedger<EthAddress>);

    impl BalanceLedger<EthAddress> for RefusingDebits<'_> {
        fn balance_of(&self, account: &EthAddress) -> u64 {
            self.0.balance_of(account)
        }

        fn debit(&self, _from: &EthAddress, _amount: u64) -> bool {
            false
        }

        fn credit(&self, to: &EthAddress, amount: u64) -> bool {
            self.0.credit(to, amount)
        }
    }

    // Records the stored status every time funds leave escrow.
    struct Observing<'a> {
        inner: &'a MemoryLedger<EthAddress>,
        store: &'a MemoryStore<EthAddress>,
        seen: RefCell<Vec<ChannelStatus>>,
    }

    impl BalanceLedger<EthAddress> for Observing<'_> {
        fn balance_of(&self, account: &EthAddress) -> u64 {
            self.inner.balance_of(account)
        }

        fn debit(&self, from: &EthAddress, amount: u64) -> bool {
            self.inner.debit(from, amount)
        }

        fn credit(&self, to: &EthAddress, amount: u64) -> bool {
            let status = self.store.get("c1").unwrap().unwrap().value.status;
            self.seen.borrow_mut().push(status);
            self.inner.credit(to, amount)
        }
    }

    // Commits a queued rival write right before each compare-and-swap.
    struct Racing<'a> {
        inner: &'a MemoryStore<EthAddress>,
        rivals: RefCell<Vec<Channel<EthAddress>>>,
    }

    impl<'a> Racing<'a> {
        fn new(inner: &'a MemoryStore<EthAddress>) -> Self {
            Racing {
                inner,
                rivals: RefCell::new(Vec::new()),
            }
        }

        fn queue(&self, rival: Channel<EthAddress>) {
            self.rivals.borrow_mut().insert(0, rival);
        }
    }

    impl ChannelStore for Racing<'_> {
        type Party = EthAddress;

        fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<EthAddress>>>, Error> {
            self.inner.get(channel_id)
        }

        fn put(&self, record: Versioned<Channel<EthAddress>>) -> Result<(), Error> {
            self.inner.put(record)
        }

        fn remove(&self, channel_id: &str) -> Result<(), Error> {
            self.inner.remove(channel_id)
        }

        fn compare_and_swap(
            &self,
            expected: Option<u64>,
            channel: Channel<EthAddress>,
        ) -> Result<u64, Error> {
            let rival = self.rivals.borrow_mut().pop();
            if let Some(rival) = rival {
                let current = self.inner.get(&rival.channel_id)?.map(|r| r.revision);
                self.inner.compare_and_swap(current, rival)?;
            }
            self.inner.compare_and_swap(expected, channel)
        }
    }

    // Lets a fixed number of compare-and-swaps through, then reports conflicts.
    struct Stalling<'a> {
        inner: &'a MemoryStore<EthAddress>,
        swaps_left: Cell<u32>,
    }

    impl ChannelStore for Stalling<'_> {
        type Party = EthAddress;

        fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<EthAddress>>>, Error> {
            self.inner.get(channel_id)
        }

        fn put(&self, record: Versioned<Channel<EthAddress>>) -> Result<(), Error> {
            self.inner.put(record)
        }

        fn remove(&self, channel_id: &str) -> Result<(), Error> {
            self.inner.remove(channel_id)
        }

        fn compare_and_swap(
            &self,
            expected: Option<u64>,
            channel: Channel<EthAddress>,
        ) -> Result<u64, Error> {
            match self.swaps_left.get() {
                0 => Err(Error::Conflict),
                n => {
                    self.swaps_left.set(n - 1);
                    self.inner.compare_and_swap(expected, channel)
                }
            }
        }
    }
}
