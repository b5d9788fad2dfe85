use std::sync::atomic::Ordering;

use crossbeam::epoch::{self, Atomic, Guard, Owned};

use crate::segment::Segment;

const DEFAULT_BUCKETS: usize = 1 << 10;

struct Node {
    segment: Segment,
    next: Atomic<Node>,
}

// Segment-id -> segment table. Lookups run concurrently from every
// transaction; inserts and removals happen only while the region is
// quiescent (region creation and the epoch commit step). Removed nodes
// are retired through the epoch collector so a lookup that pinned before
// the removal can never observe freed memory.
pub(crate) struct SegMap {
    buckets: Box<[Atomic<Node>]>,
    mask: usize,
}

impl SegMap {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    pub fn with_buckets(bucket_count: usize) -> Self {
        let buckets = bucket_count.next_power_of_two().max(1);
        let mut v = Vec::with_capacity(buckets);
        for _ in 0..buckets {
            v.push(Atomic::null());
        }

        Self {
            buckets: v.into_boxed_slice(),
            mask: buckets - 1,
        }
    }

    #[inline]
    fn bucket(&self, id: u32) -> &Atomic<Node> {
        &self.buckets[id as usize & self.mask]
    }

    pub fn insert(&self, segment: Segment) {
        let guard = &epoch::pin();
        let bucket = self.bucket(segment.id());
        let mut node = Owned::new(Node {
            segment,
            next: Atomic::null(),
        });

        loop {
            let head = bucket.load(Ordering::Acquire, guard);
            node.next.store(head, Ordering::Relaxed);
            match bucket.compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => return,
                Err(err) => node = err.new,
            }
        }
    }

    pub fn get<'g>(&self, id: u32, guard: &'g Guard) -> Option<&'g Segment> {
        let mut current = self.bucket(id).load(Ordering::Acquire, guard);
        loop {
            let node = unsafe { current.as_ref() }?;
            if node.segment.id() == id {
                return Some(&node.segment);
            }
            current = node.next.load(Ordering::Acquire, guard);
        }
    }

    // Unlink `id` and retire its node. Caller must hold the quiescence
    // guarantee (epoch commit step): no concurrent insert or remove.
    pub fn remove(&self, id: u32, guard: &Guard) -> bool {
        let bucket = self.bucket(id);
        loop {
            let head = bucket.load(Ordering::Acquire, guard);

            let mut prev: Option<&Node> = None;
            let mut current = head;
            let target = loop {
                let Some(node) = (unsafe { current.as_ref() }) else {
                    return false;
                };
                if node.segment.id() == id {
                    break node;
                }
                prev = Some(node);
                current = node.next.load(Ordering::Acquire, guard);
            };

            let next = target.next.load(Ordering::Acquire, guard);
            let link = match prev {
                Some(node) => &node.next,
                None => bucket,
            };
            if link
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                // SAFETY:
                // The node is unlinked; pinned lookups may still hold it,
                // so destruction is deferred to the collector.
                unsafe {
                    guard.defer_destroy(current);
                }
                return true;
            }
        }
    }

    pub fn for_each<'g>(&self, guard: &'g Guard, mut f: impl FnMut(&'g Segment)) {
        for bucket in self.buckets.iter() {
            let mut current = bucket.load(Ordering::Acquire, guard);
            while let Some(node) = unsafe { current.as_ref() } {
                f(&node.segment);
                current = node.next.load(Ordering::Acquire, guard);
            }
        }
    }

    pub fn len(&self, guard: &Guard) -> usize {
        let mut count = 0;
        self.for_each(guard, |_| count += 1);
        count
    }
}

impl Drop for SegMap {
    fn drop(&mut self) {
        // SAFETY:
        // The map is being dropped; no thread can pin it anymore.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in self.buckets.iter() {
                let mut current = bucket.load(Ordering::Relaxed, guard);
                while let Some(node) = current.as_ref() {
                    let next = node.next.load(Ordering::Relaxed, guard);
                    drop(Box::from_raw(current.as_raw() as *mut Node));
                    current = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SegMap;
    use crate::segment::{Segment, SegmentState};
    use crate::txn::TX_NONE;
    use crossbeam::epoch;

    fn segment(id: u32) -> Segment {
        Segment::new(id, 16, 8, SegmentState::Live, TX_NONE).expect("allocation")
    }

    #[test]
    fn insert_then_get_finds_the_segment() {
        let map = SegMap::with_buckets(4);
        map.insert(segment(1));
        map.insert(segment(2));
        map.insert(segment(5)); // collides with 1 in a 4-bucket table

        let guard = epoch::pin();
        assert_eq!(map.get(1, &guard).expect("id 1").id(), 1);
        assert_eq!(map.get(5, &guard).expect("id 5").id(), 5);
        assert!(map.get(3, &guard).is_none());
        assert_eq!(map.len(&guard), 3);
    }

    #[test]
    fn remove_unlinks_only_the_requested_id() {
        let map = SegMap::with_buckets(2);
        for id in 1..=4 {
            map.insert(segment(id));
        }

        let guard = epoch::pin();
        assert!(map.remove(3, &guard));
        assert!(!map.remove(3, &guard));
        assert!(map.get(3, &guard).is_none());
        for id in [1, 2, 4] {
            assert_eq!(map.get(id, &guard).expect("survivor").id(), id);
        }
        assert_eq!(map.len(&guard), 3);
    }

    #[test]
    fn for_each_visits_every_bucket_chain() {
        let map = SegMap::with_buckets(2);
        for id in 1..=8 {
            map.insert(segment(id));
        }

        let guard = epoch::pin();
        let mut seen: Vec<u32> = Vec::new();
        map.for_each(&guard, |seg| seen.push(seg.id()));
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }
}
