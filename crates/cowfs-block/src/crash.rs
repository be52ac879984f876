//! Crash-injection byte device.
//!
//! Models the durability contract the engine relies on: writes land in a
//! volatile buffer and only become durable when `sync()` succeeds. Tests
//! schedule failures at a given write or sync ordinal, then "power off" the
//! device and reopen the engine on the durable image.

use crate::ByteDevice;
use cowfs_error::{EngineError, Result};
use parking_lot::Mutex;

/// Failure schedule for a [`CrashDevice`].
///
/// Ordinals are zero-based: `fail_at_sync = Some(0)` fails the first sync.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailurePlan {
    /// Fail the Nth `write_all_at` call (and every later one).
    pub fail_at_write: Option<u64>,
    /// Fail the Nth `sync` call (and every later one).
    pub fail_at_sync: Option<u64>,
}

#[derive(Debug)]
struct CrashState {
    /// Image as of the last successful sync.
    durable: Vec<u8>,
    /// Image including unsynced writes.
    volatile: Vec<u8>,
    writes_seen: u64,
    syncs_seen: u64,
    plan: FailurePlan,
}

/// In-memory byte device with an explicit volatile/durable split.
#[derive(Debug)]
pub struct CrashDevice {
    state: Mutex<CrashState>,
}

impl CrashDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_image(vec![0_u8; len])
    }

    /// Build a device whose durable and volatile contents start at `image`.
    #[must_use]
    pub fn from_image(image: Vec<u8>) -> Self {
        Self {
            state: Mutex::new(CrashState {
                durable: image.clone(),
                volatile: image,
                writes_seen: 0,
                syncs_seen: 0,
                plan: FailurePlan::default(),
            }),
        }
    }

    /// Install a failure schedule. Counters are not reset.
    pub fn set_plan(&self, plan: FailurePlan) {
        self.state.lock().plan = plan;
    }

    /// What would survive a power loss right now.
    #[must_use]
    pub fn durable_image(&self) -> Vec<u8> {
        self.state.lock().durable.clone()
    }

    /// Simulate power loss: discard everything not yet synced and clear the
    /// failure plan so the "reopened" device behaves normally.
    pub fn power_cycle(&self) {
        let mut guard = self.state.lock();
        guard.volatile = guard.durable.clone();
        guard.plan = FailurePlan::default();
    }

    /// Number of successful sync calls so far.
    #[must_use]
    pub fn syncs_seen(&self) -> u64 {
        self.state.lock().syncs_seen
    }

    /// Number of write calls observed so far, failed ones included.
    #[must_use]
    pub fn writes_seen(&self) -> u64 {
        self.state.lock().writes_seen
    }
}

impl ByteDevice for CrashDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.state.lock().volatile.len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let guard = self.state.lock();
        let offset =
            usize::try_from(offset).map_err(|_| EngineError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| EngineError::Format("range overflow".into()))?;
        if end > guard.volatile.len() {
            return Err(EngineError::Format("read out of bounds".into()));
        }
        buf.copy_from_slice(&guard.volatile[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut guard = self.state.lock();
        let ordinal = guard.writes_seen;
        guard.writes_seen = guard.writes_seen.saturating_add(1);
        if guard.plan.fail_at_write.is_some_and(|n| ordinal >= n) {
            return Err(EngineError::Io(std::io::Error::other(format!(
                "injected write failure at ordinal {ordinal}"
            ))));
        }

        let offset =
            usize::try_from(offset).map_err(|_| EngineError::Format("offset overflow".into()))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| EngineError::Format("range overflow".into()))?;
        if end > guard.volatile.len() {
            return Err(EngineError::Format("write out of bounds".into()));
        }
        guard.volatile[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let ordinal = guard.syncs_seen;
        if guard.plan.fail_at_sync.is_some_and(|n| ordinal >= n) {
            guard.syncs_seen = guard.syncs_seen.saturating_add(1);
            return Err(EngineError::Io(std::io::Error::other(format!(
                "injected sync failure at ordinal {ordinal}"
            ))));
        }
        guard.syncs_seen = guard.syncs_seen.saturating_add(1);
        let volatile = guard.volatile.clone();
        guard.durable = volatile;
        Ok(())
    }
}
