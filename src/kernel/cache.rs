//! Process-wide cache of loaded kernel sets, keyed by (platform, device).
//!
//! The map lock is held only long enough to find or insert a device slot;
//! loading then happens under the slot's own lock, so two unrelated devices
//! never serialize each other's kernel loads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::DeviceResult;
use crate::kernel::KernelSetHandle;

/// Identity of one physical device within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub platform_id: u32,
    pub device_id: u32,
}

#[derive(Default)]
struct Slot {
    programs: Mutex<HashMap<String, KernelSetHandle>>,
}

static CACHE: Lazy<Mutex<HashMap<DeviceKey, Arc<Slot>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn slot_for(key: DeviceKey) -> Arc<Slot> {
    let mut map = CACHE.lock().unwrap();
    map.entry(key).or_default().clone()
}

/// Fetch the kernel set for `program_key` on `key`, invoking `load` on miss.
///
/// Concurrent callers for the same device serialize on the slot; callers for
/// different devices do not. A failed load is not cached so it can be
/// retried after the underlying cause (such as a missing artifact) is fixed.
pub fn get_or_load<F>(key: DeviceKey, program_key: &str, load: F) -> DeviceResult<KernelSetHandle>
where
    F: FnOnce() -> DeviceResult<KernelSetHandle>,
{
    let slot = slot_for(key);
    let mut programs = slot.programs.lock().unwrap();
    if let Some(handle) = programs.get(program_key) {
        return Ok(*handle);
    }
    let handle = load()?;
    programs.insert(program_key.to_string(), handle);
    Ok(handle)
}

/// Drop all cached kernel sets for one device (context teardown).
pub fn evict_device(key: DeviceKey) {
    let mut map = CACHE.lock().unwrap();
    map.remove(&key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loads_once_per_program_key() {
        let key = DeviceKey {
            platform_id: 900,
            device_id: 1,
        };
        let calls = AtomicUsize::new(0);

        let first = get_or_load(key, "mb0", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(KernelSetHandle(7))
        })
        .unwrap();
        let second = get_or_load(key, "mb0", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(KernelSetHandle(8))
        })
        .unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        evict_device(key);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let key = DeviceKey {
            platform_id: 901,
            device_id: 0,
        };
        let result = get_or_load(key, "mb1", || {
            Err(DeviceError::kernel_load("artifact missing"))
        });
        assert!(result.is_err());

        let retry = get_or_load(key, "mb1", || Ok(KernelSetHandle(3))).unwrap();
        assert_eq!(retry, KernelSetHandle(3));
        evict_device(key);
    }
}
