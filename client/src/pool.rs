//! Free lists for objects the sync layer creates and destroys every frame

/// Returns an object to its freshly-constructed state before reuse.
pub trait Reset {
    fn reset(&mut self);
}

#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    max_free: usize,
    created: u64,
    reused: u64,
}

impl<T: Reset> Pool<T> {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            max_free,
            created: 0,
            reused: 0,
        }
    }

    /// Takes a pooled object, or builds one with `make` when the pool is empty.
    pub fn acquire(&mut self, make: impl FnOnce() -> T) -> T {
        match self.free.pop() {
            Some(item) => {
                self.reused += 1;
                item
            }
            None => {
                self.created += 1;
                make()
            }
        }
    }

    /// Resets `item` and keeps it for reuse, unless the pool is full.
    pub fn release(&mut self, mut item: T) {
        item.reset();
        if self.free.len() < self.max_free {
            self.free.push(item);
        }
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn reused(&self) -> u64 {
        self.reused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Thing {
        value: u32,
    }

    impl Reset for Thing {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    /// Tests pooled objects are reset and reused
    #[test]
    fn test_acquire_reuses_released_objects() {
        let mut pool = Pool::new(8);
        let mut thing = pool.acquire(Thing::default);
        thing.value = 42;
        pool.release(thing);
        assert_eq!(pool.free_len(), 1);

        let again = pool.acquire(|| panic!("should reuse"));
        assert_eq!(again, Thing { value: 0 });
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.reused(), 1);
    }

    /// Tests the pool capacity
    #[test]
    fn test_release_beyond_capacity_drops() {
        let mut pool = Pool::new(1);
        pool.release(Thing { value: 1 });
        pool.release(Thing { value: 2 });
        assert_eq!(pool.free_len(), 1);
    }
}
