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

use crate::channel::{Channel, Party};
use crate::Error;

/// A stored record together with its optimistic-concurrency token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Versioned<T> {
    pub revision: u64,
    pub value: T,
}

/// Persistence for channel records, keyed by channel id.
///
/// The store holds no business rules. Callers serialize updates to one
/// channel through `compare_and_swap`.
pub trait ChannelStore {
    type Party: Party;

    fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<Self::Party>>>, Error>;

    fn exists(&self, channel_id: &str) -> Result<bool, Error> {
        Ok(self.get(channel_id)?.is_some())
    }

    /// Unconditionally writes a record.
    fn put(&self, record: Versioned<Channel<Self::Party>>) -> Result<(), Error>;

    fn remove(&self, channel_id: &str) -> Result<(), Error>;

    /// Writes `channel` only if the stored revision still equals `expected`
    /// (`None`: no record may exist yet) and returns the new revision.
    ///
    /// The provided implementation is only atomic on hosts that run one
    /// invocation at a time.
    fn compare_and_swap(
        &self,
        expected: Option<u64>,
        channel: Channel<Self::Party>,
    ) -> Result<u64, Error> {
        let current = self.get(&channel.channel_id)?.map(|record| record.revision);
        if current != expected {
            return Err(Error::Conflict);
        }
        let revision = next_revision(expected)?;
        self.put(Versioned {
            revision,
            value: channel,
        })?;
        Ok(revision)
    }
}

pub fn next_revision(current: Option<u64>) -> Result<u64, Error> {
    match current {
        None => Ok(0),
        Some(revision) => revision.checked_add(1).ok_or(Error::MathOverflow),
    }
}

impl<T: ChannelStore> ChannelStore for &T {
    type Party = T::Party;

    fn get(&self, channel_id: &str) -> Result<Option<Versioned<Channel<Self::Party>>>, Error> {
        (**self).get(channel_id)
    }

    fn exists(&self, channel_id: &str) -> Result<bool, Error> {
        (**self).exists(channel_id)
    }

    fn put(&self, record: Versioned<Channel<Self::Party>>) -> Result<(), Error> {
        (**self).put(record)
    }

    fn remove(&self, channel_id: &str) -> Result<(), Error> {
        (**self).remove(channel_id)
    }

    fn compare_and_swap(
        &self,
        expected: Option<u64>,
        channel: Channel<Self::Party>,
    ) -> Result<u64, Error> {
        (**self).compare_and_swap(expected, channel)
    }
}
