//! Work Store: a named POSIX shared-memory segment holding call records.
//!
//! Layout:
//!
//! ```text
//! [preamble 64B][directory: slots x 32B][heap ...............]
//! ```
//!
//! The preamble carries a magic number, the layout version, a lock word and
//! the segment geometry. Each directory entry maps an address (call id) to an
//! extent in the heap plus an FNV-1a checksum of the bytes. Writers fill a
//! fresh extent before publishing the entry, so a process killed mid-write
//! leaves the previous value readable.

use crate::{IpcError, Result, STORE_SCHEMA_VERSION};
use mediator_core::{Call, CallId, HEADER_ADDRESS};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::signal::kill;
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::ffi::{c_void, CString};
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAGIC: u64 = u64::from_le_bytes(*b"MEDIATOR");
const LAYOUT_VERSION: u32 = 1;

const PREAMBLE_SIZE: usize = 64;
const ENTRY_SIZE: usize = 32;
const OFF_MAGIC: usize = 0;
const OFF_LAYOUT: usize = 8;
const OFF_LOCK: usize = 12;
const OFF_CAPACITY: usize = 16;
const OFF_SLOTS: usize = 24;

const MIN_CAPACITY: usize = 64 * 1024;
const MIN_DIR_SLOTS: usize = 64;
const MAX_DIR_SLOTS: usize = 4096;
const BYTES_PER_SLOT: usize = 2048;

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Addresses used by the canary probe, far above any call id
const CANARY_ADDRESSES: std::ops::Range<u64> = (1 << 40)..(1 << 41);

/// Contents of the reserved header slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub version: u32,
    pub memory_allocation: u64,
}

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreUsage {
    pub records: usize,
    pub used_bytes: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: u64,
    offset: usize,
    len: usize,
    checksum: u32,
}

impl Entry {
    fn end(&self) -> usize {
        self.offset + align8(self.len.max(1))
    }
}

struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
}

impl Mapping {
    fn base(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    fn check(&self, off: usize, len: usize) -> Result<()> {
        match off.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(IpcError::BadSegment),
        }
    }

    fn read(&self, off: usize, buf: &mut [u8]) -> Result<()> {
        self.check(off, buf.len())?;
        // SAFETY: bounds checked above; the mapping lives as long as self.
        unsafe { std::ptr::copy_nonoverlapping(self.base().add(off), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn write(&self, off: usize, data: &[u8]) -> Result<()> {
        self.check(off, data.len())?;
        // SAFETY: bounds checked above; the mapping is PROT_WRITE.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(off), data.len()) };
        Ok(())
    }

    fn read_u64(&self, off: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(off, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u64(&self, off: usize, value: u64) -> Result<()> {
        self.write(off, &value.to_le_bytes())
    }

    fn read_u32(&self, off: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(off, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, off: usize, value: u32) -> Result<()> {
        self.write(off, &value.to_le_bytes())
    }

    fn lock_word(&self) -> &AtomicU32 {
        // SAFETY: mmap returns page-aligned memory, OFF_LOCK is 4-byte aligned
        // and inside the preamble.
        unsafe { &*(self.base().add(OFF_LOCK) as *const AtomicU32) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!(error = %e, "munmap failed");
        }
    }
}

struct StoreLock<'a> {
    word: &'a AtomicU32,
    owner: u32,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let _ = self
            .word
            .compare_exchange(self.owner, 0, Ordering::Release, Ordering::Relaxed);
    }
}

/// Shared keyed store for call records
pub struct WorkStore {
    name: String,
    capacity: usize,
    slots: usize,
    map: Option<Mapping>,
}

impl WorkStore {
    /// Open (creating if needed) the named segment without touching the header slot.
    pub fn open(name: &str, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(MIN_CAPACITY);
        let (map, slots) = map_segment(name, capacity)?;
        let capacity = map.len;

        Ok(WorkStore {
            name: name.to_string(),
            capacity,
            slots,
            map: Some(map),
        })
    }

    /// Open the segment and verify or initialize the header slot.
    ///
    /// Refuses to attach to a segment written with another schema version.
    pub fn attach(name: &str, memory_allocation: usize) -> Result<Self> {
        let store = Self::open(name, memory_allocation)?;
        store.init_header(memory_allocation)?;
        Ok(store)
    }

    fn init_header(&self, memory_allocation: usize) -> Result<()> {
        match self.read_header()? {
            None => self.write_header(&StoreHeader {
                version: STORE_SCHEMA_VERSION,
                memory_allocation: memory_allocation as u64,
            }),
            Some(header) if header.version != STORE_SCHEMA_VERSION => {
                Err(IpcError::VersionMismatch {
                    found: header.version,
                    expected: STORE_SCHEMA_VERSION,
                })
            }
            Some(header) => {
                if header.memory_allocation != memory_allocation as u64 {
                    warn!(
                        segment = %self.name,
                        existing = header.memory_allocation,
                        requested = memory_allocation,
                        "Work Store was created with a different memory allocation; restart without recovery to apply the change"
                    );
                }
                Ok(())
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn mapping(&self) -> Result<&Mapping> {
        self.map.as_ref().ok_or(IpcError::BadSegment)
    }

    fn heap_start(&self) -> usize {
        PREAMBLE_SIZE + self.slots * ENTRY_SIZE
    }

    fn lock(&self) -> Result<StoreLock<'_>> {
        let word = self.mapping()?.lock_word();
        let me = std::process::id();
        let started = Instant::now();
        let mut spins = 0u32;

        loop {
            match word.compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Ok(StoreLock { word, owner: me }),
                Err(owner) if owner == me => return Ok(StoreLock { word, owner: me }),
                Err(owner) => {
                    if !process_alive(owner)
                        && word
                            .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                    {
                        warn!(segment = %self.name, owner, "Reclaimed Work Store lock from a dead process");
                        return Ok(StoreLock { word, owner: me });
                    }

                    if started.elapsed() > LOCK_TIMEOUT {
                        return Err(IpcError::LockTimeout { owner });
                    }

                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::sleep(Duration::from_micros(200));
                    }
                }
            }
        }
    }

    fn read_entry(&self, map: &Mapping, index: usize) -> Result<Entry> {
        let base = PREAMBLE_SIZE + index * ENTRY_SIZE;
        Ok(Entry {
            key: map.read_u64(base)?,
            offset: map.read_u64(base + 8)? as usize,
            len: map.read_u64(base + 16)? as usize,
            checksum: map.read_u32(base + 24)?,
        })
    }

    fn write_entry(&self, map: &Mapping, index: usize, entry: &Entry) -> Result<()> {
        let base = PREAMBLE_SIZE + index * ENTRY_SIZE;
        map.write_u64(base + 8, entry.offset as u64)?;
        map.write_u64(base + 16, entry.len as u64)?;
        map.write_u32(base + 24, entry.checksum)?;
        map.write_u64(base, entry.key)
    }

    fn clear_entry(&self, map: &Mapping, index: usize) -> Result<()> {
        let base = PREAMBLE_SIZE + index * ENTRY_SIZE;
        map.write_u64(base, 0)?;
        map.write(base + 8, &[0u8; ENTRY_SIZE - 8])
    }

    /// Used entries plus the first free directory index
    fn scan(&self, map: &Mapping) -> Result<(Vec<(usize, Entry)>, Option<usize>)> {
        let heap_start = self.heap_start();
        let mut used = Vec::new();
        let mut free = None;

        for index in 0..self.slots {
            let entry = self.read_entry(map, index)?;
            if entry.key == 0 {
                free.get_or_insert(index);
                continue;
            }
            let in_bounds = entry.offset >= heap_start
                && entry
                    .offset
                    .checked_add(entry.len)
                    .is_some_and(|end| end <= self.capacity);
            if !in_bounds {
                return Err(IpcError::Corrupt {
                    address: entry.key,
                    reason: format!("extent {}+{} out of bounds", entry.offset, entry.len),
                });
            }
            used.push((index, entry));
        }

        Ok((used, free))
    }

    /// First-fit allocation over the gaps between live extents
    fn allocate(&self, used: &[(usize, Entry)], needed: usize) -> Option<usize> {
        let needed = align8(needed.max(1));
        let mut extents: Vec<(usize, usize)> =
            used.iter().map(|(_, e)| (e.offset, e.end())).collect();
        extents.sort_unstable();

        let mut cursor = self.heap_start();
        for (start, end) in extents {
            if start >= cursor && start - cursor >= needed {
                return Some(cursor);
            }
            cursor = cursor.max(end);
        }

        (self.capacity.saturating_sub(cursor) >= needed).then_some(cursor)
    }

    /// Write or overwrite the slot at `address`
    pub fn put(&self, address: u64, data: &[u8]) -> Result<()> {
        if address == 0 {
            return Err(IpcError::Corrupt {
                address,
                reason: "address 0 is reserved".to_string(),
            });
        }

        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, free) = self.scan(map)?;

        let index = match used.iter().find(|(_, e)| e.key == address) {
            Some((index, _)) => *index,
            None => free.ok_or(IpcError::DirectoryFull { slots: self.slots })?,
        };

        let offset = self
            .allocate(&used, data.len())
            .ok_or(IpcError::Exhausted { needed: data.len() })?;

        map.write(offset, data)?;
        self.write_entry(
            map,
            index,
            &Entry {
                key: address,
                offset,
                len: data.len(),
                checksum: fnv1a(data),
            },
        )
    }

    pub fn get(&self, address: u64) -> Result<Option<Vec<u8>>> {
        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, _) = self.scan(map)?;

        let Some((_, entry)) = used.into_iter().find(|(_, e)| e.key == address) else {
            return Ok(None);
        };

        let mut data = vec![0u8; entry.len];
        map.read(entry.offset, &mut data)?;
        if fnv1a(&data) != entry.checksum {
            return Err(IpcError::Corrupt {
                address,
                reason: "checksum mismatch".to_string(),
            });
        }
        Ok(Some(data))
    }

    pub fn has(&self, address: u64) -> Result<bool> {
        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, _) = self.scan(map)?;
        Ok(used.iter().any(|(_, e)| e.key == address))
    }

    /// Remove the slot, returning whether it existed
    pub fn remove(&self, address: u64) -> Result<bool> {
        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, _) = self.scan(map)?;

        match used.iter().find(|(_, e)| e.key == address) {
            Some((index, _)) => {
                self.clear_entry(map, *index)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All occupied addresses, ascending
    pub fn addresses(&self) -> Result<Vec<u64>> {
        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, _) = self.scan(map)?;
        let mut keys: Vec<u64> = used.into_iter().map(|(_, e)| e.key).collect();
        keys.sort_unstable();
        Ok(keys)
    }

    pub fn usage(&self) -> Result<StoreUsage> {
        let map = self.mapping()?;
        let _guard = self.lock()?;
        let (used, _) = self.scan(map)?;
        Ok(StoreUsage {
            records: used.len(),
            used_bytes: used.iter().map(|(_, e)| align8(e.len.max(1))).sum(),
            capacity: self.capacity - self.heap_start(),
        })
    }

    pub fn read_header(&self) -> Result<Option<StoreHeader>> {
        match self.get(HEADER_ADDRESS)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_header(&self, header: &StoreHeader) -> Result<()> {
        let bytes = bincode::serialize(header)?;
        self.put(HEADER_ADDRESS, &bytes)
    }

    /// Serialize `call` into its slot, returning the record size
    pub fn put_call(&self, call: &Call) -> Result<usize> {
        let bytes = call.to_bytes()?;
        self.put(call.id, &bytes)?;
        Ok(bytes.len())
    }

    pub fn get_call(&self, id: CallId) -> Result<Option<Call>> {
        match self.get(id)? {
            Some(bytes) => Ok(Some(Call::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write, read back and remove a random canary record
    pub fn canary(&self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let address = rng.gen_range(CANARY_ADDRESSES);
        let sample: Vec<u8> = (0..rng.gen_range(64..4096)).map(|_| rng.gen()).collect();

        self.put(address, &sample)?;
        let read_back = self.get(address)?;
        self.remove(address)?;

        if read_back.as_deref() != Some(sample.as_slice()) {
            return Err(IpcError::Corrupt {
                address,
                reason: "canary read back differs".to_string(),
            });
        }
        Ok(())
    }

    /// Drop the mapping and map the named segment again
    pub fn reattach(&mut self) -> Result<()> {
        self.map = None;
        let (map, slots) = map_segment(&self.name, self.capacity)?;
        self.capacity = map.len;
        self.slots = slots;
        self.map = Some(map);
        debug!(segment = %self.name, "Reattached Work Store");
        Ok(())
    }

    /// Unmap and unlink the segment. Further operations fail until `recreate`.
    pub fn destroy(&mut self) -> Result<()> {
        self.map = None;
        unlink(&self.name)
    }

    /// Destroy the segment and provision a fresh one of the same capacity
    pub fn recreate(&mut self, memory_allocation: usize) -> Result<()> {
        self.destroy()?;
        let (map, slots) = map_segment(&self.name, memory_allocation.max(MIN_CAPACITY))?;
        self.capacity = map.len;
        self.slots = slots;
        self.map = Some(map);
        self.init_header(memory_allocation)
    }

    /// Remove the named segment if it exists
    pub fn unlink(name: &str) -> Result<()> {
        unlink(name)
    }

    #[cfg(test)]
    fn scribble(&self, address: u64) -> Result<()> {
        let map = self.mapping()?;
        let (used, _) = self.scan(map)?;
        let (_, entry) = used
            .into_iter()
            .find(|(_, e)| e.key == address)
            .ok_or(IpcError::BadSegment)?;
        map.write(entry.offset, &[0xFF])
    }
}

fn unlink(name: &str) -> Result<()> {
    let c_name = segment_name(name)?;
    match shm_unlink(c_name.as_c_str()) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(errno) => Err(IpcError::Os {
            op: "shm_unlink",
            errno,
        }),
    }
}

fn map_segment(name: &str, capacity: usize) -> Result<(Mapping, usize)> {
    let c_name = segment_name(name)?;
    let fd = shm_open(
        c_name.as_c_str(),
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(IpcError::os("shm_open"))?;
    let file = File::from(fd);

    let existing = file
        .metadata()
        .map_err(|e| IpcError::io("fstat", e))?
        .len() as usize;
    let fresh = existing == 0;
    let len = if fresh {
        file.set_len(capacity as u64)
            .map_err(|e| IpcError::io("ftruncate", e))?;
        capacity
    } else {
        existing
    };

    let length = NonZeroUsize::new(len).ok_or(IpcError::BadSegment)?;
    // SAFETY: fresh shared mapping of a file we own; no address hint.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            &file,
            0,
        )
    }
    .map_err(IpcError::os("mmap"))?;
    let map = Mapping { ptr, len };

    if fresh {
        let slots = dir_slots(len);
        map.write_u64(OFF_CAPACITY, len as u64)?;
        map.write_u32(OFF_SLOTS, slots as u32)?;
        map.write_u32(OFF_LAYOUT, LAYOUT_VERSION)?;
        map.lock_word().store(0, Ordering::Release);
        map.write_u64(OFF_MAGIC, MAGIC)?;
        debug!(segment = name, capacity = len, slots, "Created Work Store");
        return Ok((map, slots));
    }

    if map.read_u64(OFF_MAGIC)? != MAGIC {
        return Err(IpcError::BadSegment);
    }
    let layout = map.read_u32(OFF_LAYOUT)?;
    if layout != LAYOUT_VERSION {
        return Err(IpcError::VersionMismatch {
            found: layout,
            expected: LAYOUT_VERSION,
        });
    }
    let slots = map.read_u32(OFF_SLOTS)? as usize;
    if map.read_u64(OFF_CAPACITY)? as usize != len
        || PREAMBLE_SIZE + slots * ENTRY_SIZE >= len
    {
        return Err(IpcError::BadSegment);
    }

    Ok((map, slots))
}

fn segment_name(name: &str) -> Result<CString> {
    let valid = name.starts_with('/')
        && name.len() > 1
        && name.len() <= 250
        && !name[1..].contains('/');
    if !valid {
        return Err(IpcError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| IpcError::InvalidName(name.to_string()))
}

fn dir_slots(capacity: usize) -> usize {
    (capacity / BYTES_PER_SLOT).clamp(MIN_DIR_SLOTS, MAX_DIR_SLOTS)
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn process_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_core::CallStatus;
    use serde_json::json;

    struct Segment(WorkStore);

    impl Drop for Segment {
        fn drop(&mut self) {
            let _ = self.0.destroy();
        }
    }

    fn unique_name() -> String {
        format!("/mediator-test-{}", uuid::Uuid::new_v4().simple())
    }

    fn store(capacity: usize) -> Segment {
        Segment(WorkStore::attach(&unique_name(), capacity).unwrap())
    }

    #[test]
    fn test_put_get_remove() {
        let s = store(256 * 1024);
        let store = &s.0;

        store.put(7, b"hello").unwrap();
        assert_eq!(store.get(7).unwrap().as_deref(), Some(&b"hello"[..]));
        assert!(store.has(7).unwrap());

        store.put(7, b"hello again").unwrap();
        assert_eq!(store.get(7).unwrap().as_deref(), Some(&b"hello again"[..]));

        assert!(store.remove(7).unwrap());
        assert!(!store.remove(7).unwrap());
        assert_eq!(store.get(7).unwrap(), None);
    }

    #[test]
    fn test_header_written_on_attach() {
        let s = store(256 * 1024);
        let header = s.0.read_header().unwrap().unwrap();

        assert_eq!(header.version, STORE_SCHEMA_VERSION);
        assert_eq!(header.memory_allocation, 256 * 1024);
        assert_eq!(s.0.addresses().unwrap(), vec![HEADER_ADDRESS]);
    }

    #[test]
    fn test_refuses_schema_mismatch() {
        let s = store(256 * 1024);
        s.0.write_header(&StoreHeader {
            version: STORE_SCHEMA_VERSION + 1,
            memory_allocation: 256 * 1024,
        })
        .unwrap();

        let result = WorkStore::attach(s.0.name(), 256 * 1024);
        assert!(matches!(result, Err(IpcError::VersionMismatch { .. })));
    }

    #[test]
    fn test_call_records() {
        let s = store(256 * 1024);
        let mut call = Call::new(2, "square", vec![json!(7)]);
        call.advance(CallStatus::Called).unwrap();

        let size = s.0.put_call(&call).unwrap();
        assert!(size > 0);

        let stored = s.0.get_call(2).unwrap().unwrap();
        assert_eq!(stored, call);
        assert!(s.0.get_call(3).unwrap().is_none());
    }

    #[test]
    fn test_exhaustion() {
        let s = store(MIN_CAPACITY);
        let big = vec![1u8; MIN_CAPACITY / 2];

        s.0.put(10, &big).unwrap();
        assert!(matches!(
            s.0.put(11, &big),
            Err(IpcError::Exhausted { .. })
        ));

        // Space is reusable after removal
        s.0.remove(10).unwrap();
        s.0.put(11, &big).unwrap();
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let s = store(256 * 1024);
        s.0.put(5, b"some record").unwrap();
        s.0.scribble(5).unwrap();

        let err = s.0.get(5).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_canary() {
        let s = store(256 * 1024);
        s.0.canary().unwrap();
        assert_eq!(s.0.addresses().unwrap(), vec![HEADER_ADDRESS]);
    }

    #[test]
    fn test_reattach_preserves_records() {
        let mut s = store(256 * 1024);
        s.0.put(9, b"persist").unwrap();
        s.0.reattach().unwrap();

        assert_eq!(s.0.get(9).unwrap().as_deref(), Some(&b"persist"[..]));
    }

    #[test]
    fn test_recreate_wipes_records() {
        let mut s = store(256 * 1024);
        s.0.put(9, b"gone").unwrap();
        s.0.recreate(256 * 1024).unwrap();

        assert!(s.0.get(9).unwrap().is_none());
        assert!(s.0.read_header().unwrap().is_some());
    }

    #[test]
    fn test_reclaims_lock_from_dead_process() {
        let s = store(256 * 1024);
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        s.0.mapping().unwrap().lock_word().store(dead_pid, Ordering::SeqCst);
        s.0.put(3, b"after steal").unwrap();

        assert_eq!(s.0.mapping().unwrap().lock_word().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            WorkStore::open("no-slash", MIN_CAPACITY),
            Err(IpcError::InvalidName(_))
        ));
        assert!(matches!(
            WorkStore::open("/a/b", MIN_CAPACITY),
            Err(IpcError::InvalidName(_))
        ));
    }

    #[test]
    fn test_first_fit_reuses_gaps() {
        let s = store(256 * 1024);
        s.0.put(20, &[1u8; 100]).unwrap();
        s.0.put(21, &[2u8; 100]).unwrap();
        s.0.remove(20).unwrap();
        s.0.put(22, &[3u8; 50]).unwrap();

        let usage = s.0.usage().unwrap();
        assert_eq!(usage.records, 3);
        assert_eq!(s.0.get(21).unwrap().unwrap(), vec![2u8; 100]);
        assert_eq!(s.0.get(22).unwrap().unwrap(), vec![3u8; 50]);
    }
}
