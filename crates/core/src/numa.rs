//! NUMA Topology and Page Allocation
//!
//! [`NumaProvider`] is the backing store of every segment: it reports which
//! nodes exist and hands out page-granular, node-pinned memory.
//! [`SystemNuma`] implements it on top of sysfs, `mmap` and `mbind`.

use crate::error::{NumaError, NumaResult};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Memory obtained from a [`NumaProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Start of the extent
    pub ptr: NonNull<u8>,
    /// Length in bytes, a multiple of the page size
    pub size: usize,
    /// Node the first page actually resides on
    pub node: usize,
    /// Released with `munmap` rather than the global allocator
    pub uses_numa_free: bool,
}

// SAFETY: an Allocation is a plain description of an extent; ownership is
// tracked by NumaExtent.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

/// Host topology and node-pinned page allocation
pub trait NumaProvider: Send + Sync + fmt::Debug {
    /// Page size in bytes
    fn page_size(&self) -> usize;

    /// Sorted ids of nodes with CPUs
    fn host_nodes(&self) -> &[usize];

    /// Sorted ids of memory-only nodes
    fn device_nodes(&self) -> &[usize];

    /// Sorted ids of nodes this process may allocate on
    fn allowed_nodes(&self) -> &[usize];

    /// Node preferred by the memory policy
    fn preferred_node(&self) -> usize;

    /// Node of the CPU the calling thread runs on
    fn local_node(&self) -> usize;

    /// Whether `node` is in the allowed set
    fn can_allocate_on(&self, node: usize) -> bool {
        self.allowed_nodes().binary_search(&node).is_ok()
    }

    /// Allocate `num_pages` zeroed pages on `node`
    ///
    /// # Errors
    ///
    /// Returns error if the node is not allowed or the OS refuses the allocation.
    fn allocate(&self, num_pages: usize, node: usize) -> NumaResult<Allocation>;

    /// Release an allocation
    ///
    /// # Safety
    ///
    /// `allocation` must come from `self.allocate` and must not be released twice.
    unsafe fn free(&self, allocation: &Allocation);
}

/// Owned [`Allocation`] released through its provider on drop
pub struct NumaExtent {
    provider: Arc<dyn NumaProvider>,
    allocation: Allocation,
}

impl NumaExtent {
    /// Allocate at least `size` bytes on `node`, rounded up to whole pages
    ///
    /// # Errors
    ///
    /// Returns error if `size` is zero or the provider fails.
    pub fn allocate(provider: Arc<dyn NumaProvider>, size: usize, node: usize) -> NumaResult<Self> {
        if size == 0 {
            return Err(NumaError::InvalidSize { size });
        }
        let num_pages = size.div_ceil(provider.page_size());
        let allocation = provider.allocate(num_pages, node)?;
        Ok(Self {
            provider,
            allocation,
        })
    }

    /// The underlying allocation
    #[must_use]
    pub const fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Start of the extent
    #[must_use]
    pub const fn ptr(&self) -> NonNull<u8> {
        self.allocation.ptr
    }

    /// Node the extent resides on
    #[must_use]
    pub const fn node(&self) -> usize {
        self.allocation.node
    }
}

impl fmt::Debug for NumaExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NumaExtent")
            .field("allocation", &self.allocation)
            .finish_non_exhaustive()
    }
}

impl Drop for NumaExtent {
    fn drop(&mut self) {
        // SAFETY: the allocation came from this provider and is released once.
        unsafe { self.provider.free(&self.allocation) };
    }
}

/// NUMA provider backed by the running system
#[derive(Debug, Clone)]
pub struct SystemNuma {
    page_size: usize,
    host_nodes: Vec<usize>,
    device_nodes: Vec<usize>,
    allowed_nodes: Vec<usize>,
    /// Node of each CPU, indexed by CPU id
    cpu_nodes: Vec<Option<usize>>,
    preferred_node: usize,
}

impl SystemNuma {
    /// Detect the topology of the running system
    ///
    /// Falls back to a single node 0 when the topology cannot be read.
    #[must_use]
    pub fn new() -> Self {
        let page_size = Self::detect_page_size();
        let (host_nodes, device_nodes, cpu_nodes) = Self::detect_nodes();
        let mut allowed_nodes = Self::detect_allowed_nodes().unwrap_or_else(|| {
            let mut all = host_nodes.clone();
            all.extend_from_slice(&device_nodes);
            all
        });
        allowed_nodes.sort_unstable();
        allowed_nodes.dedup();

        let preferred_node = host_nodes
            .iter()
            .copied()
            .find(|node| allowed_nodes.binary_search(node).is_ok())
            .unwrap_or(0);

        tracing::debug!(
            page_size,
            ?host_nodes,
            ?device_nodes,
            ?allowed_nodes,
            "detected NUMA topology"
        );

        Self {
            page_size,
            host_nodes,
            device_nodes,
            allowed_nodes,
            cpu_nodes,
            preferred_node,
        }
    }

    fn detect_page_size() -> usize {
        #[cfg(unix)]
        {
            // SAFETY: sysconf has no memory-safety preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            usize::try_from(size)
                .ok()
                .filter(|size| size.is_power_of_two())
                .unwrap_or(FALLBACK_PAGE_SIZE)
        }

        #[cfg(not(unix))]
        {
            FALLBACK_PAGE_SIZE
        }
    }

    #[cfg(target_os = "linux")]
    fn detect_nodes() -> (Vec<usize>, Vec<usize>, Vec<Option<usize>>) {
        let mut host_nodes = Vec::new();
        let mut device_nodes = Vec::new();
        let mut cpu_nodes = Vec::new();

        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(node) = name
                    .to_str()
                    .and_then(|name| name.strip_prefix("node"))
                    .and_then(|id| id.parse::<usize>().ok())
                else {
                    continue;
                };

                let cpus = std::fs::read_to_string(entry.path().join("cpulist"))
                    .map(|list| parse_id_list(&list))
                    .unwrap_or_default();
                if cpus.is_empty() {
                    device_nodes.push(node);
                    continue;
                }
                host_nodes.push(node);
                for cpu in cpus {
                    if cpu_nodes.len() <= cpu {
                        cpu_nodes.resize(cpu + 1, None);
                    }
                    if let Some(slot) = cpu_nodes.get_mut(cpu) {
                        *slot = Some(node);
                    }
                }
            }
        }

        if host_nodes.is_empty() {
            host_nodes.push(0);
        }
        host_nodes.sort_unstable();
        device_nodes.sort_unstable();
        (host_nodes, device_nodes, cpu_nodes)
    }

    #[cfg(not(target_os = "linux"))]
    fn detect_nodes() -> (Vec<usize>, Vec<usize>, Vec<Option<usize>>) {
        (vec![0], Vec::new(), Vec::new())
    }

    #[cfg(target_os = "linux")]
    fn detect_allowed_nodes() -> Option<Vec<usize>> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Mems_allowed_list:"))
            .map(parse_id_list)
            .filter(|nodes| !nodes.is_empty())
    }

    #[cfg(not(target_os = "linux"))]
    fn detect_allowed_nodes() -> Option<Vec<usize>> {
        None
    }

    fn is_single_node(&self) -> bool {
        self.host_nodes.len() + self.device_nodes.len() <= 1
    }

    fn heap_allocate(&self, size: usize, node: usize) -> NumaResult<NonNull<u8>> {
        let layout = Layout::from_size_align(size, self.page_size)
            .map_err(|_| NumaError::InvalidSize { size })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| NumaError::AllocationFailed {
            size,
            node,
            reason: "global allocator returned null".to_string(),
        })
    }

    #[cfg(target_os = "linux")]
    fn mmap_allocate(&self, size: usize, node: usize) -> NumaResult<NonNull<u8>> {
        // SAFETY: anonymous private mapping with no fixed address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(NumaError::AllocationFailed {
                size,
                node,
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        const MPOL_BIND: libc::c_int = 2;
        const MPOL_MF_MOVE: libc::c_uint = 2;
        const MASK_BITS: usize = 64 * 16;
        let mut nodemask = [0u64; MASK_BITS / 64];
        if let Some(word) = nodemask.get_mut(node / 64) {
            *word = 1u64 << (node % 64);
        }

        // SAFETY: ptr..ptr+size is the mapping created above and nodemask holds
        // MASK_BITS bits.
        let result = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr,
                size,
                MPOL_BIND,
                nodemask.as_ptr(),
                MASK_BITS,
                MPOL_MF_MOVE,
            )
        };
        if result < 0 {
            tracing::warn!(
                node,
                error = %std::io::Error::last_os_error(),
                "mbind failed, pages follow the default policy"
            );
        }

        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| NumaError::AllocationFailed {
            size,
            node,
            reason: "mmap returned null".to_string(),
        })
    }

    #[cfg(not(target_os = "linux"))]
    fn mmap_allocate(&self, size: usize, node: usize) -> NumaResult<NonNull<u8>> {
        self.heap_allocate(size, node)
    }

    /// Touch every page so it is faulted in under the current policy
    fn prefault(&self, ptr: NonNull<u8>, size: usize) {
        let mut offset = 0;
        while offset < size {
            // SAFETY: offset < size and the extent is writable.
            unsafe { std::ptr::write_volatile(ptr.as_ptr().add(offset), 0) };
            offset += self.page_size;
        }
    }

    #[cfg(target_os = "linux")]
    fn resident_node(&self, ptr: NonNull<u8>) -> Option<usize> {
        let mut page = ptr.as_ptr().cast::<libc::c_void>();
        let mut status: libc::c_int = -1;
        // SAFETY: one page address in, one status out; a null node array only queries.
        let result = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0usize,
                1usize,
                &raw mut page,
                std::ptr::null::<libc::c_int>(),
                &raw mut status,
                0usize,
            )
        };
        if result < 0 {
            return None;
        }
        usize::try_from(status).ok()
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_node(&self, _ptr: NonNull<u8>) -> Option<usize> {
        None
    }
}

impl Default for SystemNuma {
    fn default() -> Self {
        Self::new()
    }
}

impl NumaProvider for SystemNuma {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn host_nodes(&self) -> &[usize] {
        &self.host_nodes
    }

    fn device_nodes(&self) -> &[usize] {
        &self.device_nodes
    }

    fn allowed_nodes(&self) -> &[usize] {
        &self.allowed_nodes
    }

    fn preferred_node(&self) -> usize {
        self.preferred_node
    }

    fn local_node(&self) -> usize {
        #[cfg(target_os = "linux")]
        {
            // SAFETY: sched_getcpu has no preconditions.
            let cpu = unsafe { libc::sched_getcpu() };
            usize::try_from(cpu)
                .ok()
                .and_then(|cpu| self.cpu_nodes.get(cpu).copied().flatten())
                .unwrap_or(self.preferred_node)
        }

        #[cfg(not(target_os = "linux"))]
        {
            self.preferred_node
        }
    }

    fn allocate(&self, num_pages: usize, node: usize) -> NumaResult<Allocation> {
        let size = num_pages
            .checked_mul(self.page_size)
            .filter(|size| *size > 0)
            .ok_or(NumaError::InvalidSize { size: num_pages })?;
        if !self.can_allocate_on(node) {
            return Err(NumaError::NodeNotAvailable { node });
        }

        let uses_numa_free = !(self.is_single_node() || node == self.local_node());
        let ptr = if uses_numa_free {
            self.mmap_allocate(size, node)?
        } else {
            self.heap_allocate(size, node)?
        };
        self.prefault(ptr, size);

        let resident = if self.is_single_node() {
            node
        } else {
            self.resident_node(ptr).unwrap_or(node)
        };

        tracing::trace!(size, node, resident, uses_numa_free, "allocated pages");
        Ok(Allocation {
            ptr,
            size,
            node: resident,
            uses_numa_free,
        })
    }

    unsafe fn free(&self, allocation: &Allocation) {
        #[cfg(target_os = "linux")]
        if allocation.uses_numa_free {
            // SAFETY: the extent was mapped by mmap_allocate with this size.
            unsafe { libc::munmap(allocation.ptr.as_ptr().cast(), allocation.size) };
            return;
        }

        // SAFETY: the extent came from heap_allocate with this size and page alignment.
        unsafe {
            dealloc(
                allocation.ptr.as_ptr(),
                Layout::from_size_align_unchecked(allocation.size, self.page_size),
            );
        }
    }
}

/// Parse a kernel id list such as `0-3,8,10-11`
fn parse_id_list(list: &str) -> Vec<usize> {
    let mut ids = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    ids.extend(start..=end);
                }
            }
            None => {
                if let Ok(id) = part.parse() {
                    ids.push(id);
                }
            }
        }
    }
    ids
}

static SYSTEM_NUMA: OnceLock<Arc<SystemNuma>> = OnceLock::new();

/// Process-wide [`SystemNuma`], detected on first use
#[must_use]
pub fn system() -> Arc<SystemNuma> {
    Arc::clone(SYSTEM_NUMA.get_or_init(|| Arc::new(SystemNuma::new())))
}
