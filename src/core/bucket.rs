//! Capacity-bounded contact lists covering a contiguous range of the identifier space.

use rand::Rng;
use time::OffsetDateTime;

use crate::{
    core::{
        contact::Contact,
        id::{Boundary, NodeId},
    },
    error::DhtError,
};

/// The default number of contacts a bucket can hold (k).
pub const DEFAULT_BUCKET_CAPACITY: usize = 8;

/// A k-bucket holding the contacts whose identifiers fall in `[range_min, range_max)`.
#[derive(Debug, Clone)]
pub struct Bucket {
    range_min: Boundary,
    range_max: Boundary,
    capacity: usize,
    contacts: Vec<Contact>,
    // `None` until the bucket first sees activity.
    last_refreshed: Option<OffsetDateTime>,
}

impl Bucket {
    /// Creates an empty bucket, the range must be non-empty and the capacity non-zero.
    pub fn new(range_min: Boundary, range_max: Boundary, capacity: usize) -> Result<Self, DhtError> {
        if range_max <= range_min {
            return Err(DhtError::InvalidBucket("range_max must exceed range_min"));
        }
        if capacity == 0 {
            return Err(DhtError::InvalidBucket("capacity must be at least 1"));
        }

        Ok(Self {
            range_min,
            range_max,
            capacity,
            contacts: Vec::with_capacity(capacity),
            last_refreshed: None,
        })
    }

    pub fn range_min(&self) -> Boundary {
        self.range_min
    }

    /// The exclusive upper bound of the range.
    pub fn range_max(&self) -> Boundary {
        self.range_max
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Time of the last activity in the bucket, `None` if there hasn't been any.
    pub fn last_refreshed(&self) -> Option<OffsetDateTime> {
        self.last_refreshed
    }

    pub fn mark_refreshed(&mut self, now: OffsetDateTime) {
        self.last_refreshed = Some(now);
    }

    /// Returns `true` if the identifier lies within the bucket's range.
    pub fn fits(&self, id: &NodeId) -> bool {
        let position = Boundary::from(*id);
        self.range_min <= position && position < self.range_max
    }

    pub fn has_space(&self) -> bool {
        self.contacts.len() < self.capacity
    }

    /// Returns `true` if splitting would yield two non-empty ranges.
    pub fn can_split(&self) -> bool {
        // The right child starts after the midpoint, which leaves it empty for ranges of width 2
        // or less.
        self.range_min.midpoint(self.range_max).next() < self.range_max
    }

    /// Appends a contact. Duplicates aren't checked, that is the routing table's job.
    ///
    /// A contact that was seen alive counts as activity at its `last_seen` time.
    pub fn insert(&mut self, contact: Contact) -> Result<(), DhtError> {
        if !self.has_space() {
            return Err(DhtError::CapacityExceeded);
        }
        if !self.fits(&contact.id) {
            return Err(DhtError::OutOfRange);
        }

        self.contacts.push(contact);
        if contact.last_seen > self.last_refreshed {
            self.last_refreshed = contact.last_seen;
        }

        Ok(())
    }

    /// Returns the first contact matching the predicate.
    pub fn find<P: FnMut(&Contact) -> bool>(&self, mut predicate: P) -> Option<&Contact> {
        self.contacts.iter().find(|contact| predicate(contact))
    }

    pub(crate) fn find_mut<P: FnMut(&Contact) -> bool>(
        &mut self,
        mut predicate: P,
    ) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|contact| predicate(contact))
    }

    /// Removes and returns the first contact matching the predicate.
    pub fn delete<P: FnMut(&Contact) -> bool>(&mut self, predicate: P) -> Option<Contact> {
        let index = self.contacts.iter().position(predicate)?;
        Some(self.contacts.remove(index))
    }

    /// Splits a full bucket into `[range_min, mid]` and `[mid + 1, range_max)` where `mid` is the
    /// floor of the range's mean, redistributing the contacts.
    pub fn split(&self) -> Result<(Bucket, Bucket), DhtError> {
        if self.has_space() {
            return Err(DhtError::BucketNotFull);
        }
        if !self.can_split() {
            return Err(DhtError::NoSpaceFound);
        }

        // The left child includes `mid`, as a half-open range it ends at `mid + 1`.
        let boundary = self.range_min.midpoint(self.range_max).next();
        let mut left = Bucket::new(self.range_min, boundary, self.capacity)?;
        let mut right = Bucket::new(boundary, self.range_max, self.capacity)?;

        for contact in &self.contacts {
            // The children tile the parent so one of them always fits.
            if left.fits(&contact.id) {
                left.contacts.push(*contact);
            } else {
                debug_assert!(right.fits(&contact.id));
                right.contacts.push(*contact);
            }
        }

        left.last_refreshed = self.last_refreshed;
        right.last_refreshed = self.last_refreshed;

        Ok((left, right))
    }

    /// Returns the contacts ranked by XOR distance to the target, closest first. Ties keep
    /// insertion order.
    pub fn ranked(&self, target: &NodeId) -> Vec<Contact> {
        let mut ranked = self.contacts.clone();
        ranked.sort_by_key(|contact| contact.id.distance(target));

        ranked
    }

    /// Picks a random identifier within the bucket's range.
    pub fn random_id<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        self.range_min
            .random_below(self.range_max, rng)
            .and_then(Boundary::to_node_id)
            // Ranges are non-empty and never extend past the end of the space.
            .unwrap_or_else(|| NodeId::new([0u8; NodeId::BYTES]))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use rand::thread_rng;

    use super::*;

    fn contact(raw: u16) -> Contact {
        let addr: SocketAddr = format!("127.0.0.1:{}", 1000 + raw).parse().unwrap();
        Contact::new(NodeId::from_u16(raw), addr)
    }

    fn bucket(min: u128, max: u128, capacity: usize) -> Bucket {
        Bucket::new(Boundary::from_u128(min), Boundary::from_u128(max), capacity).unwrap()
    }

    #[test]
    fn new_rejects_invalid() {
        assert!(matches!(
            Bucket::new(Boundary::from_u128(4), Boundary::from_u128(4), 8),
            Err(DhtError::InvalidBucket(_))
        ));
        assert!(matches!(
            Bucket::new(Boundary::ZERO, Boundary::END, 0),
            Err(DhtError::InvalidBucket(_))
        ));
    }

    #[test]
    fn fits() {
        let bucket = bucket(4, 8, 8);

        assert!(!bucket.fits(&NodeId::from_u16(3)));
        assert!(bucket.fits(&NodeId::from_u16(4)));
        assert!(bucket.fits(&NodeId::from_u16(7)));
        assert!(!bucket.fits(&NodeId::from_u16(8)));
    }

    #[test]
    fn insert_checks_capacity_then_range() {
        let mut bucket = bucket(0, 16, 2);

        assert!(matches!(
            bucket.insert(contact(20)),
            Err(DhtError::OutOfRange)
        ));
        assert!(bucket.insert(contact(1)).is_ok());
        assert!(bucket.insert(contact(2)).is_ok());
        assert!(!bucket.has_space());
        assert!(matches!(
            bucket.insert(contact(3)),
            Err(DhtError::CapacityExceeded)
        ));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn find_and_delete() {
        let mut bucket = bucket(0, 16, 4);
        for raw in 1..=3 {
            bucket.insert(contact(raw)).unwrap();
        }

        let id = NodeId::from_u16(2);
        assert_eq!(bucket.find(|c| c.id == id), Some(&contact(2)));
        assert_eq!(bucket.delete(|c| c.id == id), Some(contact(2)));
        assert!(bucket.find(|c| c.id == id).is_none());
        assert!(bucket.delete(|c| c.id == id).is_none());
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn insert_refreshes_at_last_seen() {
        let mut bucket = bucket(0, 16, 4);
        let seen = OffsetDateTime::UNIX_EPOCH + time::Duration::days(1);

        bucket.insert(contact(1)).unwrap();
        assert_eq!(bucket.last_refreshed(), None);

        let mut confirmed = contact(2);
        confirmed.touch(seen);
        bucket.insert(confirmed).unwrap();
        assert_eq!(bucket.last_refreshed(), Some(seen));

        // Older sightings don't move the clock back.
        let mut older = contact(3);
        older.touch(OffsetDateTime::UNIX_EPOCH);
        bucket.insert(older).unwrap();
        assert_eq!(bucket.last_refreshed(), Some(seen));

        let (left, right) = {
            bucket.insert(contact(12)).unwrap();
            bucket.split().unwrap()
        };
        assert_eq!(left.last_refreshed(), Some(seen));
        assert_eq!(right.last_refreshed(), Some(seen));
    }

    #[test]
    fn split_not_full() {
        let bucket = bucket(0, 16, 2);
        assert!(matches!(bucket.split(), Err(DhtError::BucketNotFull)));
    }

    #[test]
    fn split_boundaries() {
        let mut parent = bucket(0, 16, 2);
        parent.insert(contact(1)).unwrap();
        parent.insert(contact(12)).unwrap();

        let (left, right) = parent.split().unwrap();

        // [0, 8] and [9, 16)
        assert_eq!(left.range_min(), Boundary::from_u128(0));
        assert_eq!(left.range_max(), Boundary::from_u128(9));
        assert_eq!(right.range_min(), Boundary::from_u128(9));
        assert_eq!(right.range_max(), Boundary::from_u128(16));

        assert_eq!(left.contacts(), &[contact(1)]);
        assert_eq!(right.contacts(), &[contact(12)]);
    }

    #[test]
    fn split_redistributes_every_contact() {
        let mut rng = thread_rng();

        for _ in 0..100 {
            let min: u16 = rng.gen_range(0..1000);
            let max: u16 = rng.gen_range(min + 3..2000);
            let capacity = rng.gen_range(1..=8).min((max - min) as usize);

            let mut parent = bucket(min as u128, max as u128, capacity);
            while parent.has_space() {
                let raw = rng.gen_range(min..max);
                if parent.find(|c| c.id == NodeId::from_u16(raw)).is_none() {
                    parent.insert(contact(raw)).unwrap();
                }
            }

            let (left, right) = parent.split().unwrap();

            // Disjoint and jointly exhaustive.
            assert_eq!(left.range_min(), parent.range_min());
            assert_eq!(left.range_max(), right.range_min());
            assert_eq!(right.range_max(), parent.range_max());
            assert!(left.range_min() < left.range_max());
            assert!(right.range_min() < right.range_max());

            assert_eq!(left.len() + right.len(), parent.len());
            for c in parent.contacts() {
                assert!(left.fits(&c.id) != right.fits(&c.id));
                let child = if left.fits(&c.id) { &left } else { &right };
                assert!(child.find(|other| other.id == c.id).is_some());
            }
        }
    }

    #[test]
    fn narrow_ranges_cannot_split() {
        let mut narrow = bucket(6, 8, 1);
        narrow.insert(contact(6)).unwrap();

        assert!(!narrow.can_split());
        assert!(matches!(narrow.split(), Err(DhtError::NoSpaceFound)));
        assert!(bucket(6, 9, 1).can_split());
    }

    #[test]
    fn ranked_by_distance() {
        let mut bucket = bucket(0, 16, 8);
        for raw in [9, 2, 5, 1] {
            bucket.insert(contact(raw)).unwrap();
        }

        let ranked: Vec<u16> = bucket
            .ranked(&NodeId::from_u16(0))
            .iter()
            .map(|c| c.id.bytes()[19] as u16)
            .collect();

        assert_eq!(ranked, vec![1, 2, 5, 9]);
    }

    #[test]
    fn random_id_in_range() {
        let mut rng = thread_rng();
        let bucket = bucket(100, 104, 8);

        for _ in 0..100 {
            assert!(bucket.fits(&bucket.random_id(&mut rng)));
        }
    }
}
