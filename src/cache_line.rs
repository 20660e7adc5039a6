// Pads hot atomics to their own cache line so that two pages (or the
// registry head and the revision counter) never share one.
// x86_64 prefetches pairs of 64 bytes lines, hence the 128.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
#[derive(Debug, Default)]
pub struct CacheAligned<T: Sized>(T);

impl<T> CacheAligned<T> {
    pub const fn new(v: T) -> CacheAligned<T> {
        CacheAligned(v)
    }
}

impl<T: Sized> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T: Sized> std::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::CacheAligned;
    use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

    #[test]
    fn aligned_to_cache_line() {
        assert!(std::mem::align_of::<CacheAligned<AtomicU64>>() >= 64);
        assert!(std::mem::size_of::<[CacheAligned<AtomicU64>; 2]>() >= 128);

        let value = CacheAligned::new(AtomicU64::new(7));
        value.fetch_add(1, Relaxed);
        assert_eq!(value.load(Relaxed), 8);
    }
}
