//! Fault-injecting in-memory backing store
//!
//! [`SimBacking`] models a disk with a volatile write cache over a stable
//! image: writes land in the cache, `flush` moves the cache to stable
//! storage. A flush limit turns the store into a crash simulator — once the
//! limit is spent, flushes (and with them every later write) silently stop
//! reaching stable storage, exactly like power loss with a lying cache.
//! `crash()` discards the cache and hands back the stable image so a test
//! can reopen it and check what recovery observes.

use std::io;

use parking_lot::Mutex;
use std::sync::Arc;

use super::backing::BackingStore;

#[derive(Default)]
struct SimState {
    /// Bytes that survived the last successful flush.
    stable: Vec<u8>,
    /// Unflushed write extents in arrival order.
    cache: Vec<(u64, Vec<u8>)>,
    /// Logical file length (applies immediately, like file metadata).
    len: u64,
    /// Remaining flushes that still reach stable storage. `None` means
    /// unlimited.
    flushes_remaining: Option<u64>,
    /// Set once the flush limit is exhausted; nothing reaches stable
    /// storage any more.
    frozen: bool,
}

/// In-memory [`BackingStore`] with crash fault points.
///
/// Clones share the same underlying state, so a test can keep one handle
/// for fault control while the engine owns another.
#[derive(Clone, Default)]
pub struct SimBacking {
    state: Arc<Mutex<SimState>>,
}

impl SimBacking {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose stable image starts as `initial`.
    pub fn with_image(initial: Vec<u8>) -> Self {
        let len = initial.len() as u64;
        Self {
            state: Arc::new(Mutex::new(SimState {
                stable: initial,
                len,
                ..SimState::default()
            })),
        }
    }

    /// Allow exactly `n` more flushes to reach stable storage; after that
    /// the store behaves as if the power failed with writes in the cache.
    pub fn set_flush_limit(&self, n: u64) {
        self.state.lock().flushes_remaining = Some(n);
    }

    /// Simulate power loss: the volatile cache is discarded. Returns the
    /// stable image for reopening.
    pub fn crash(&self) -> Vec<u8> {
        let mut st = self.state.lock();
        st.cache.clear();
        st.frozen = true;
        st.stable.clone()
    }

    /// Number of write extents still sitting in the volatile cache.
    pub fn cached_extents(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Copy of the stable image, without disturbing the store.
    pub fn image(&self) -> Vec<u8> {
        self.state.lock().stable.clone()
    }
}

impl BackingStore for SimBacking {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let st = self.state.lock();
        let end = offset + buf.len() as u64;
        if end > st.len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of simulated store",
            ));
        }

        // Start from the stable image (zero beyond its length), then apply
        // cached extents in arrival order.
        buf.fill(0);
        let stable_len = st.stable.len() as u64;
        if offset < stable_len {
            let avail = (stable_len - offset).min(buf.len() as u64) as usize;
            buf[..avail].copy_from_slice(&st.stable[offset as usize..offset as usize + avail]);
        }
        for (ext_off, ext) in &st.cache {
            let ext_end = ext_off + ext.len() as u64;
            if *ext_off >= end || ext_end <= offset {
                continue;
            }
            let from = offset.max(*ext_off);
            let to = end.min(ext_end);
            let dst = (from - offset) as usize;
            let src = (from - ext_off) as usize;
            let n = (to - from) as usize;
            buf[dst..dst + n].copy_from_slice(&ext[src..src + n]);
        }
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        st.cache.push((offset, buf.to_vec()));
        st.len = st.len.max(offset + buf.len() as u64);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.frozen {
            return Ok(());
        }
        if let Some(n) = st.flushes_remaining {
            if n == 0 {
                st.frozen = true;
                return Ok(());
            }
            st.flushes_remaining = Some(n - 1);
        }
        let len = st.len as usize;
        if st.stable.len() < len {
            st.stable.resize(len, 0);
        } else {
            st.stable.truncate(len);
        }
        let cache = std::mem::take(&mut st.cache);
        for (off, ext) in cache {
            let off = off as usize;
            st.stable[off..off + ext.len()].copy_from_slice(&ext);
        }
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.state.lock().len)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        let mut st = self.state.lock();
        if st.frozen {
            return Ok(());
        }
        st.len = len;
        st.cache.retain(|(off, ext)| *off + ext.len() as u64 <= len);
        if st.stable.len() as u64 > len {
            st.stable.truncate(len as usize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_overlays_stable() {
        let sim = SimBacking::with_image(vec![0x11; 64]);
        sim.write_at(&[0x22; 16], 8).unwrap();

        let mut buf = [0u8; 32];
        sim.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..8], &[0x11; 8]);
        assert_eq!(&buf[8..24], &[0x22; 16]);
        assert_eq!(&buf[24..], &[0x11; 8]);
    }

    #[test]
    fn test_crash_discards_unflushed() {
        let sim = SimBacking::with_image(vec![0u8; 32]);
        sim.write_at(&[0xAA; 8], 0).unwrap();
        sim.flush().unwrap();
        sim.write_at(&[0xBB; 8], 8).unwrap();

        let image = sim.crash();
        assert_eq!(&image[..8], &[0xAA; 8]);
        assert_eq!(&image[8..16], &[0u8; 8]);
    }

    #[test]
    fn test_flush_limit_freezes_store() {
        let sim = SimBacking::new();
        sim.set_flush_limit(1);

        sim.write_at(&[1u8; 4], 0).unwrap();
        sim.flush().unwrap(); // reaches stable
        sim.write_at(&[2u8; 4], 4).unwrap();
        sim.flush().unwrap(); // dropped
        sim.write_at(&[3u8; 4], 8).unwrap();
        sim.flush().unwrap(); // dropped

        let image = sim.crash();
        assert_eq!(image, vec![1u8; 4]);
    }
}
