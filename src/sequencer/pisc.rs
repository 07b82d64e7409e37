/// Reserved line addresses for asynchronous atomic updates. Each in-flight update borrows one
/// so that back-to-back updates to the same vertex never alias in the write table.
#[derive(Debug, Clone)]
pub struct PseudoAddressPool {
    base: u64,
    limit: usize,
    free: Vec<u64>,
}

impl PseudoAddressPool {
    pub fn new(base: u64, limit: usize) -> Self {
        Self {
            base,
            limit,
            free: (0..limit as u64).map(|i| base + i).collect(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn in_use(&self) -> usize {
        self.limit - self.free.len()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.limit as u64
    }

    pub fn acquire(&mut self) -> u64 {
        let Some(addr) = self.free.pop() else {
            panic!("async atomic pool exhausted ({} in flight)", self.limit);
        };
        assert!(addr >= self.base);
        addr
    }

    pub fn release(&mut self, addr: u64) {
        assert!(self.contains(addr), "{:#x} is not a pooled address", addr);
        assert!(self.free.len() < self.limit, "pseudo address {:#x} released twice", addr);
        self.free.push(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::PseudoAddressPool;

    #[test]
    fn acquire_and_release_are_lifo() {
        let mut pool = PseudoAddressPool::new(0xFFFF_FFFF_FFFF_0000, 4);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(0xFFFF_FFFF_FFFF_0003, a);
        assert_eq!(0xFFFF_FFFF_FFFF_0002, b);
        assert_eq!(2, pool.in_use());
        pool.release(a);
        assert_eq!(a, pool.acquire());
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhausting_the_pool_panics() {
        let mut pool = PseudoAddressPool::new(0x1000, 1);
        pool.acquire();
        pool.acquire();
    }
}
