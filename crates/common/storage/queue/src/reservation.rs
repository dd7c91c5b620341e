// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Items handed to a client but not yet confirmed.

use std::{collections::HashMap, fmt};

use crate::item::Item;

/// Identifies the connection holding a reservation, so every reservation of
/// a client can be returned when it disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Owner of reservations rebuilt from the journal. Their clients are gone.
    pub(crate) const RECOVERED: Self = Self(u64::MAX);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::RECOVERED {
            f.write_str("recovered")
        } else {
            write!(f, "client-{}", self.0)
        }
    }
}

/// An item reserved by a client under transaction id `xid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub xid:  u64,
    pub item: Item,
}

#[derive(Debug)]
struct Open {
    item:   Item,
    client: ClientId,
}

#[derive(Debug, Default)]
pub struct ReservationTable {
    open:       HashMap<u64, Open>,
    per_client: HashMap<ClientId, usize>,
    bytes:      u64,
}

impl ReservationTable {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.open.len() }

    pub fn is_empty(&self) -> bool { self.open.is_empty() }

    pub const fn bytes(&self) -> u64 { self.bytes }

    pub fn contains(&self, xid: u64) -> bool { self.open.contains_key(&xid) }

    pub fn count_for(&self, client: ClientId) -> usize {
        self.per_client.get(&client).copied().unwrap_or(0)
    }

    /// Whether `client` may take another reservation under `limit`.
    pub fn can_reserve(&self, client: ClientId, limit: Option<usize>) -> bool {
        limit.is_none_or(|limit| self.count_for(client) < limit)
    }

    pub fn insert(&mut self, xid: u64, item: Item, client: ClientId) {
        self.bytes += item.size();
        *self.per_client.entry(client).or_default() += 1;
        if let Some(previous) = self.open.insert(xid, Open { item, client }) {
            self.forget(&previous);
        }
    }

    /// Removes reservation `xid`, for both confirm and abort.
    pub fn remove(&mut self, xid: u64) -> Option<Item> {
        let open = self.open.remove(&xid)?;
        self.forget(&open);
        Some(open.item)
    }

    /// Reservations held by `client`, oldest first.
    pub fn xids_for(&self, client: ClientId) -> Vec<u64> {
        let mut xids: Vec<u64> = self
            .open
            .iter()
            .filter(|(_, open)| open.client == client)
            .map(|(xid, _)| *xid)
            .collect();
        xids.sort_unstable();
        xids
    }

    /// Every open reservation ordered by xid.
    pub fn sorted(&self) -> Vec<(u64, &Item)> {
        let mut all: Vec<(u64, &Item)> =
            self.open.iter().map(|(xid, open)| (*xid, &open.item)).collect();
        all.sort_unstable_by_key(|(xid, _)| *xid);
        all
    }

    fn forget(&mut self, open: &Open) {
        self.bytes -= open.item.size();
        if let Some(count) = self.per_client.get_mut(&open.client) {
            *count -= 1;
            if *count == 0 {
                self.per_client.remove(&open.client);
            }
        }
    }
}
