// A general-purpose LRU cache with a lifetime for each element
//
// Slots are scanned linearly; the table is small enough that a
// hash map would not pay for itself. A cached hash short-circuits
// most of the name comparisons.
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::{Arc, Mutex};

struct Slot<T> {
    name: String,
    hash: u64,
    /// 0 if the slot is free
    life: u32,
    elem: Option<Arc<T>>,
}

pub struct Cache<T> {
    slots: Mutex<Vec<Slot<T>>>,
    init: u32,
    boost: u32,
    decrease: u32,
}

fn hash_name(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write(name.as_bytes());
    hasher.finish()
}

impl<T> Cache<T> {
    pub fn new(size: usize, init: u32, boost: u32, decrease: u32) -> Self {
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(Slot {
                name: String::new(),
                hash: 0,
                life: 0,
                elem: None,
            });
        }
        Self {
            slots: Mutex::new(slots),
            init: init,
            boost: boost,
            decrease: decrease,
        }
    }

    /// Look up `name`, constructing the element on a miss.
    ///
    /// A hit refreshes the slot's lifetime. A miss evicts the slot
    /// with the smallest remaining lifetime.
    pub fn get_with<F: FnOnce() -> T>(&self, name: &str, ctor: F) -> Arc<T> {
        let hash = hash_name(name);
        let mut slots = self.slots.lock().unwrap();
        let mut min_life = u32::MAX;
        let mut min_index = 0;
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.life != 0 && slot.hash == hash && slot.name == name {
                slot.life = std::cmp::min(self.init, slot.life + self.boost);
                return slot.elem.as_ref().unwrap().clone();
            }
            if slot.life < min_life {
                min_life = slot.life;
                min_index = i;
            }
        }
        let slot = &mut slots[min_index];
        slot.name = name.to_string();
        slot.hash = hash;
        slot.life = self.init;
        let elem = Arc::new(ctor());
        slot.elem = Some(elem.clone());
        return elem;
    }

    /// Age every slot, dropping elements whose lifetime ran out
    pub fn reduce_lifetime(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.life > self.decrease {
                slot.life -= self.decrease;
            } else {
                slot.life = 0;
                slot.elem = None;
            }
        }
    }

    /// Remaining lifetime of a cached name, 0 if not resident
    pub fn lifetime(&self, name: &str) -> u32 {
        let hash = hash_name(name);
        let slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            if slot.life != 0 && slot.hash == hash && slot.name == name {
                return slot.life;
            }
        }
        return 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_returns_same_element() {
        let cache: Cache<u32> = Cache::new(4, 10, 2, 1);
        let a = cache.get_with("a", || 1);
        let b = cache.get_with("a", || 2);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 1);
    }

    #[test]
    fn lifetime_decays_and_expires() {
        let cache: Cache<u32> = Cache::new(2, 3, 1, 1);
        cache.get_with("a", || 1);
        assert_eq!(cache.lifetime("a"), 3);
        cache.reduce_lifetime();
        cache.reduce_lifetime();
        assert_eq!(cache.lifetime("a"), 1);
        cache.reduce_lifetime();
        // life hit zero, the element was dropped
        assert_eq!(cache.lifetime("a"), 0);
    }

    #[test]
    fn get_boosts_lifetime_up_to_init() {
        let cache: Cache<u32> = Cache::new(2, 10, 4, 1);
        cache.get_with("a", || 1);
        for _ in 0..5 {
            cache.reduce_lifetime();
        }
        assert_eq!(cache.lifetime("a"), 5);
        cache.get_with("a", || 1);
        assert_eq!(cache.lifetime("a"), 9);
        cache.get_with("a", || 1);
        // boost saturates at the initial lifetime
        assert_eq!(cache.lifetime("a"), 10);
    }

    #[test]
    fn miss_evicts_least_lively_slot() {
        let cache: Cache<u32> = Cache::new(2, 10, 1, 1);
        cache.get_with("a", || 1);
        cache.reduce_lifetime();
        cache.get_with("b", || 2);
        // "a" has less life than "b", so "c" takes its slot
        cache.get_with("c", || 3);
        assert_eq!(cache.lifetime("a"), 0);
        assert_eq!(cache.lifetime("b"), 10);
        assert_eq!(cache.lifetime("c"), 10);
    }
}
