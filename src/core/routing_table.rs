//! The bucket partition of the identifier space.

use std::{
    io::{Read, Write},
    net::{IpAddr, SocketAddr},
};

use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    bencode::{self, dict, Value},
    core::{
        bucket::Bucket,
        contact::Contact,
        id::{Boundary, NodeId},
    },
    error::DhtError,
};

/// Directions `find_nearest` may still descend in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Search {
    pub left: bool,
    pub right: bool,
}

impl Search {
    pub const BOTH: Search = Search {
        left: true,
        right: true,
    };
}

/// Outcome of loading a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Restored {
    pub inserted: usize,
    pub skipped: usize,
}

/// The core routing table data structure.
///
/// Buckets are kept sorted by range and tile the table's space without gaps or overlaps. A full
/// bucket is replaced in place by its two halves when an insert targets it, so the bucket count
/// never decreases.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    // The node's local identifier.
    local_id: NodeId,
    range_min: Boundary,
    range_max: Boundary,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    /// Creates a table covering the whole identifier space.
    pub fn new(local_id: NodeId, bucket_capacity: usize) -> Result<Self, DhtError> {
        Self::with_space(local_id, Boundary::ZERO, Boundary::END, bucket_capacity)
    }

    /// Creates a table covering `[range_min, range_max)`.
    pub fn with_space(
        local_id: NodeId,
        range_min: Boundary,
        range_max: Boundary,
        bucket_capacity: usize,
    ) -> Result<Self, DhtError> {
        Ok(Self {
            local_id,
            range_min,
            range_max,
            buckets: vec![Bucket::new(range_min, range_max, bucket_capacity)?],
        })
    }

    /// Returns this table's local identifier.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub(crate) fn buckets_mut(&mut self) -> &mut [Bucket] {
        &mut self.buckets
    }

    /// Iterates over every contact, bucket by bucket.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|bucket| bucket.contacts())
    }

    /// Returns the total number of contacts.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns the index of the bucket covering the identifier.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let position = Boundary::from(*id);
        if position < self.range_min || position >= self.range_max {
            return None;
        }

        // Buckets are sorted and contiguous: the first one ending past the position covers it.
        let index = self
            .buckets
            .partition_point(|bucket| bucket.range_max() <= position);
        debug_assert!(self.buckets[index].fits(id));

        Some(index)
    }

    /// Inserts a contact, splitting the target bucket as often as needed.
    pub fn insert(&mut self, contact: Contact) -> Result<(), DhtError> {
        if self.get(&contact.id).is_some() {
            return Err(DhtError::DuplicateNode);
        }

        let mut index = self.bucket_index(&contact.id).ok_or(DhtError::OutOfRange)?;

        // Every split at least halves the range so this terminates after at most 160 rounds.
        while !self.buckets[index].has_space() {
            if !self.buckets[index].can_split() {
                return Err(DhtError::NoSpaceFound);
            }

            let (left, right) = self.buckets[index].split()?;
            let goes_right = right.fits(&contact.id);
            self.buckets.splice(index..=index, [left, right]);

            if goes_right {
                index += 1;
            }
        }

        self.buckets[index].insert(contact)
    }

    /// Returns the first contact matching the predicate.
    pub fn find<P: FnMut(&Contact) -> bool>(&self, mut predicate: P) -> Option<&Contact> {
        self.buckets
            .iter()
            .find_map(|bucket| bucket.find(&mut predicate))
    }

    /// Returns the contact with the identifier.
    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let index = self.bucket_index(id)?;
        self.buckets[index].find(|c| c.id == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        let index = self.bucket_index(id)?;
        self.buckets[index].find_mut(|c| c.id == *id)
    }

    /// Records a liveness confirmation, returns `false` if the contact isn't in the table.
    pub fn touch(&mut self, id: &NodeId, now: OffsetDateTime) -> bool {
        let Some(index) = self.bucket_index(id) else {
            return false;
        };

        let bucket = &mut self.buckets[index];
        match bucket.find_mut(|c| c.id == *id) {
            Some(contact) => {
                contact.touch(now);
                bucket.mark_refreshed(now);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the first contact matching the predicate. Buckets are never merged.
    pub fn delete<P: FnMut(&Contact) -> bool>(&mut self, mut predicate: P) -> Option<Contact> {
        self.buckets
            .iter_mut()
            .find_map(|bucket| bucket.delete(&mut predicate))
    }

    /// Returns up to `quantity` contacts sorted by XOR distance to the target, closest first.
    pub fn find_nearest(&self, target: &NodeId, quantity: usize) -> Vec<Contact> {
        self.find_nearest_directed(target, quantity, Search::BOTH)
    }

    /// Like [`RoutingTable::find_nearest`], restricting which neighbouring buckets may be
    /// searched when the target's own bucket doesn't hold enough contacts.
    pub fn find_nearest_directed(
        &self,
        target: &NodeId,
        quantity: usize,
        search: Search,
    ) -> Vec<Contact> {
        let Some(index) = self.bucket_index(target) else {
            return Vec::new();
        };

        let mut nearest = collect_nearest(&self.buckets, index, target, quantity, search);
        nearest.sort_by_key(|contact| contact.id.distance(target));
        nearest.truncate(quantity);

        nearest
    }

    /// Writes every contact as a bencoded list of `{id, ip, port}` dictionaries.
    pub fn persist<W: Write>(&self, mut sink: W) -> Result<(), DhtError> {
        let entries = self
            .contacts()
            .map(|contact| {
                dict([
                    ("id", Value::bytes(contact.id.as_bytes())),
                    ("ip", Value::string(&contact.addr.ip().to_string())),
                    ("port", Value::Integer(contact.addr.port().into())),
                ])
            })
            .collect();

        sink.write_all(&bencode::encode(&Value::List(entries)))?;
        sink.flush()?;

        Ok(())
    }

    /// Re-inserts the contacts of a snapshot written by [`RoutingTable::persist`].
    ///
    /// An empty source restores nothing. Malformed entries and entries the table rejects are
    /// skipped with a warning, only an undecodable snapshot is an error.
    pub fn restore<R: Read>(&mut self, mut source: R) -> Result<Restored, DhtError> {
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;

        let mut restored = Restored::default();
        if raw.is_empty() {
            return Ok(restored);
        }

        let snapshot = bencode::decode(&raw)?;
        let entries = snapshot.as_list().ok_or_else(|| {
            DhtError::MalformedResponse("routing table snapshot is not a list".into())
        })?;

        for entry in entries {
            let Some(contact) = snapshot_entry(entry) else {
                warn!("skipping malformed routing table entry");
                restored.skipped += 1;
                continue;
            };

            match self.insert(contact) {
                Ok(()) => restored.inserted += 1,
                Err(e) => {
                    warn!("skipping routing table entry {}: {e}", contact.id);
                    restored.skipped += 1;
                }
            }
        }

        debug!(
            "restored {} contacts, skipped {}",
            restored.inserted, restored.skipped
        );

        Ok(restored)
    }
}

// Takes the target bucket's closest contacts, then pulls from the neighbours in the directions
// still allowed. Each direction walks outwards on its own until it has made up the shortfall.
fn collect_nearest(
    buckets: &[Bucket],
    index: usize,
    target: &NodeId,
    quantity: usize,
    search: Search,
) -> Vec<Contact> {
    let mut found = buckets[index].ranked(target);
    found.truncate(quantity);

    let remaining = quantity - found.len();
    if remaining == 0 {
        return found;
    }

    if search.left {
        found.extend(walk(buckets[..index].iter().rev(), target, remaining));
    }

    if search.right {
        found.extend(walk(buckets[index + 1..].iter(), target, remaining));
    }

    found
}

// Takes each bucket's closest contacts in turn until `quantity` are collected.
fn walk<'a>(
    buckets: impl Iterator<Item = &'a Bucket>,
    target: &NodeId,
    quantity: usize,
) -> Vec<Contact> {
    let mut found = Vec::new();

    for bucket in buckets {
        let remaining = quantity - found.len();
        if remaining == 0 {
            break;
        }

        let mut ranked = bucket.ranked(target);
        ranked.truncate(remaining);
        found.extend(ranked);
    }

    found
}

fn snapshot_entry(entry: &Value) -> Option<Contact> {
    let id = NodeId::from_slice(entry.get(b"id")?.as_bytes()?)?;
    let ip: IpAddr = entry.get(b"ip")?.as_str()?.parse().ok()?;
    let port = u16::try_from(entry.get(b"port")?.as_integer()?).ok()?;

    Some(Contact::new(id, SocketAddr::new(ip, port)))
}
