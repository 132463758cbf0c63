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

//! Turning a closed channel into fund movements.

use crate::channel::Channel;
use crate::collab::BalanceLedger;
use crate::Error;

pub const BPS_DENOMINATOR: u32 = 10_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Payout {
    pub amount_a: u64,
    pub amount_b: u64,
    /// Retained in escrow.
    pub fee: u64,
}

/// What a failed payout still owes each participant.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Unpaid {
    pub amount_a: u64,
    pub amount_b: u64,
}

// protocol_fee computes floor(total_deposited * fee_rate_bps / 10000).
pub fn protocol_fee(total_deposited: u64, fee_rate_bps: u32) -> Result<u64, Error> {
    let fee = u128::from(total_deposited) * u128::from(fee_rate_bps)
        / u128::from(BPS_DENOMINATOR);
    u64::try_from(fee).map_err(|_| Error::MathOverflow)
}

/// Works out the payout of a channel, failing if the deposit cannot cover
/// both balances plus the fee.
pub fn plan<P>(channel: &Channel<P>, fee_rate_bps: u32) -> Result<Payout, Error> {
    let fee = protocol_fee(channel.total_deposited, fee_rate_bps)?;
    let owed = channel
        .balance_a
        .checked_add(channel.balance_b)
        .and_then(|sum| sum.checked_add(fee))
        .ok_or(Error::MathOverflow)?;
    if owed > channel.total_deposited {
        return Err(Error::InsufficientDeposit);
    }
    Ok(Payout {
        amount_a: channel.balance_a,
        amount_b: channel.balance_b,
        fee,
    })
}

/// Credits both participants, skipping zero amounts. Stops at the first
/// failed transfer and reports what is still owed.
pub fn pay_out<P, L: BalanceLedger<P>>(
    ledger: &L,
    channel: &Channel<P>,
    payout: &Payout,
) -> Result<(), Unpaid> {
    let mut unpaid = Unpaid {
        amount_a: payout.amount_a,
        amount_b: payout.amount_b,
    };
    if payout.amount_a > 0 {
        if !ledger.credit(&channel.participant_a, payout.amount_a) {
            return Err(unpaid);
        }
        unpaid.amount_a = 0;
    }
    if payout.amount_b > 0 && !ledger.credit(&channel.participant_b, payout.amount_b) {
        return Err(unpaid);
    }
    Ok(())
}
