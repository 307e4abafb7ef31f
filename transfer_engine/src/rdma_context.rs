//! # Device Context
//!
//! `RdmaContext` owns one reliable-connection queue pair bound to one device port,
//! together with the protection domain, completion channel and completion queue
//! that back it.
//!
//! # Lifecycle
//!
//! 1. `open()` discovers the device (falling back to the first one when the requested
//!    name is unknown), checks the port link layer, allocates verbs resources, moves the
//!    queue pair to INIT and builds the local [`ConnectionDescriptor`].
//! 2. The descriptor is exchanged with the peer out of band.
//! 3. `connect()` moves the queue pair through RTR and RTS, arms completion
//!    notifications and starts the completion poller thread.
//! 4. `post_read()` / `post_read_batch()` issue one-sided reads against registrations
//!    learned from the peer.
//! 5. `stop()` (or drop) wakes the poller with a sentinel request and joins it.
//!
//! ```text
//! Uninitialized -> Initialized -> Handshaking -> Connected -> Stopped
//! ```
//!
//! # Completion poller
//!
//! The poller blocks in `ibv_get_cq_event`, acknowledges the event, re-arms the
//! queue and drains it in batches. Signaled work requests carry an id from the
//! context's [`CompletionRegistry`]; the poller removes the record and runs its
//! callback with the work completion status.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use ibverbs::Gid;

use crate::completion::CompletionCallback;
use crate::completion::CompletionRegistry;
use crate::completion::CompletionStatus;
use crate::completion::SHUTDOWN_WR_ID;
use crate::completion::UNSIGNALED_WR_ID;
use crate::error::RdmaError;
use crate::error::Result;
use crate::exchange::RemoteMemoryRegion;
use crate::ibverbs_primitives::ConnectionDescriptor;
use crate::ibverbs_primitives::LinkType;
use crate::ibverbs_primitives::OpCode;
use crate::ibverbs_primitives::PortAddress;
use crate::ibverbs_primitives::get_link_layer_str;
use crate::ibverbs_primitives::gid_type;
use crate::ibverbs_primitives::is_ipv4_mapped_gid;
use crate::rdma_scheduler::TransferContext;

/// Configuration for a single device context.
///
/// # Fields
///
/// * `device_name` - Device to open, i.e. `mlx5_0`. Unknown or empty names fall back to the first device.
/// * `port_num` - 1-based physical port.
/// * `link_type` - Link layer the port must report.
/// * `gid_index` - GID table index for RoCE. When unset, the first RoCE v2 IPv4-mapped entry is used.
/// * `max_send_wr` / `max_recv_wr` - Queue pair capacities; the completion queue holds their sum.
/// * `max_send_sge` / `max_recv_sge` - Scatter/gather entries per work request.
/// * `retry_cnt` - Transport retries before a work request fails.
/// * `rnr_retry` - Receiver-not-ready retries (7 means infinite).
/// * `qp_timeout` - Local ACK timeout exponent.
/// * `min_rnr_timer` - Minimum RNR NAK timer.
/// * `max_dest_rd_atomic` - Incoming RDMA reads/atomics allowed in flight.
/// * `max_rd_atomic` - Outgoing RDMA reads/atomics allowed in flight.
/// * `pkey_index` - Partition key index.
/// * `poll_batch` - Work completions drained per `poll_cq` call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RdmaContextConfig {
    pub device_name: String,
    pub port_num: u8,
    pub link_type: LinkType,
    pub gid_index: Option<u8>,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
    pub qp_timeout: u8,
    pub min_rnr_timer: u8,
    pub max_dest_rd_atomic: u8,
    pub max_rd_atomic: u8,
    pub pkey_index: u16,
    pub poll_batch: usize,
}

impl Default for RdmaContextConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            port_num: 1,
            link_type: LinkType::Ethernet,
            gid_index: None,
            max_send_wr: 8192,
            max_recv_wr: 8192,
            max_send_sge: 1,
            max_recv_sge: 1,
            retry_cnt: 7,
            rnr_retry: 7,
            qp_timeout: 14, // 4.096 μs * 2^14 = ~67 ms
            min_rnr_timer: 12,
            max_dest_rd_atomic: 16,
            max_rd_atomic: 16,
            pkey_index: 0,
            poll_batch: 64,
        }
    }
}

impl RdmaContextConfig {
    /// Completion queue depth, the sum of both queue pair capacities.
    pub fn cq_entries(&self) -> Result<i32> {
        self.max_send_wr
            .checked_add(self.max_recv_wr)
            .and_then(|entries| i32::try_from(entries).ok())
            .ok_or_else(|| {
                RdmaError::InvalidConfig(format!(
                    "max_send_wr {} + max_recv_wr {} exceeds the completion queue limit",
                    self.max_send_wr, self.max_recv_wr
                ))
            })
    }
}

impl fmt::Display for RdmaContextConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RdmaContextConfig {{ device: {:?}, port: {}, link: {}, gid_index: {:?}, send_wr: {}, recv_wr: {}, retry: {}/{}, timeout: {}, rd_atomic: {}/{}, poll_batch: {} }}",
            self.device_name,
            self.port_num,
            self.link_type,
            self.gid_index,
            self.max_send_wr,
            self.max_recv_wr,
            self.retry_cnt,
            self.rnr_retry,
            self.qp_timeout,
            self.max_rd_atomic,
            self.max_dest_rd_atomic,
            self.poll_batch,
        )
    }
}

/// Connection-setup state of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Uninitialized,
    Initialized,
    Handshaking,
    Connected,
    Stopped,
}

impl ContextState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (self, next),
            (Uninitialized, Initialized)
                | (Initialized, Handshaking)
                | (Handshaking, Connected)
                | (Initialized | Handshaking | Connected, Stopped)
        )
    }

    /// Local registrations are accepted from `Initialized` until the context stops.
    pub fn accepts_registration(self) -> bool {
        matches!(
            self,
            ContextState::Initialized | ContextState::Handshaking | ContextState::Connected
        )
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextState::Uninitialized => "uninitialized",
            ContextState::Initialized => "initialized",
            ContextState::Handshaking => "handshaking",
            ContextState::Connected => "connected",
            ContextState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Raw verbs handles. Released in reverse allocation order on drop; null
/// handles (from a partially failed `open`) are skipped.
struct VerbsResources {
    context: *mut ffi::ibv_context,
    pd: *mut ffi::ibv_pd,
    channel: *mut ffi::ibv_comp_channel,
    cq: *mut ffi::ibv_cq,
    qp: *mut ffi::ibv_qp,
}

impl VerbsResources {
    fn empty() -> Self {
        Self {
            context: std::ptr::null_mut(),
            pd: std::ptr::null_mut(),
            channel: std::ptr::null_mut(),
            cq: std::ptr::null_mut(),
            qp: std::ptr::null_mut(),
        }
    }
}

impl Drop for VerbsResources {
    fn drop(&mut self) {
        // SAFETY: each handle was returned by the matching ibverbs allocator and is
        // released exactly once, after everything that depends on it.
        unsafe {
            if !self.qp.is_null() {
                ffi::ibv_destroy_qp(self.qp);
            }
            if !self.cq.is_null() {
                ffi::ibv_destroy_cq(self.cq);
            }
            if !self.channel.is_null() {
                ffi::ibv_destroy_comp_channel(self.channel);
            }
            if !self.pd.is_null() {
                ffi::ibv_dealloc_pd(self.pd);
            }
            if !self.context.is_null() {
                ffi::ibv_close_device(self.context);
            }
        }
    }
}

struct LocalRegion {
    mr: *mut ffi::ibv_mr,
    addr: usize,
    length: usize,
    lkey: u32,
    rkey: u32,
}

struct ContextInner {
    name: String,
    config: RdmaContextConfig,
    local: ConnectionDescriptor,
    state: Mutex<ContextState>,
    local_regions: RwLock<HashMap<String, LocalRegion>>,
    remote_regions: RwLock<HashMap<String, RemoteMemoryRegion>>,
    completions: CompletionRegistry,
    post_lock: Mutex<()>,
    stop: AtomicBool,
    resources: VerbsResources,
}

// SAFETY: the raw handles are only dereferenced through libibverbs, whose verbs are
// thread safe. The one non thread safe path, posting to the send queue, is
// serialized by `post_lock`.
unsafe impl Send for ContextInner {}
// SAFETY: see `Send` above; all mutable Rust state sits behind locks or atomics.
unsafe impl Sync for ContextInner {}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let regions = self
            .local_regions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for (key, region) in regions.drain() {
            // SAFETY: `mr` came from ibv_reg_mr on this context's protection domain.
            if unsafe { ffi::ibv_dereg_mr(region.mr) } != 0 {
                tracing::warn!("{}: failed to deregister {}", self.name, key);
            }
        }
    }
}

/// One queue pair on one device port, plus its completion poller.
///
/// Cloning is not supported; share it behind an `Arc` or let the scheduler own it.
pub struct RdmaContext {
    inner: Arc<ContextInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RdmaContext {
    /// Opens the device described by `config` and brings the queue pair to INIT.
    pub fn open(config: RdmaContextConfig) -> Result<Self> {
        let mut state = ContextState::Uninitialized;
        let mut resources = VerbsResources::empty();

        // SAFETY: FFI calls into libibverbs. Every returned handle is checked for null
        // and stored in `resources` right away, so an early return releases it.
        let (name, local) = unsafe {
            let (context, device_name) = open_device(&config.device_name)?;
            resources.context = context;

            let mut device_attr = ffi::ibv_device_attr::default();
            if ffi::ibv_query_device(context, &mut device_attr) != 0 {
                return Err(RdmaError::verbs("ibv_query_device"));
            }
            tracing::info!(
                "{}: max_mr {} max_mr_size {} max_qp_wr {}",
                device_name,
                device_attr.max_mr,
                device_attr.max_mr_size,
                device_attr.max_qp_wr
            );

            let port = config.port_num;
            let mut port_attr = ffi::ibv_port_attr::default();
            if ffi::ibv_query_port(
                context,
                port,
                &mut port_attr as *mut ffi::ibv_port_attr as *mut _,
            ) != 0
            {
                return Err(RdmaError::verbs("ibv_query_port"));
            }
            if !config.link_type.matches(port_attr.link_layer) {
                return Err(RdmaError::LinkTypeMismatch {
                    device: device_name,
                    port,
                    expected: config.link_type,
                    actual: get_link_layer_str(port_attr.link_layer),
                });
            }

            resources.pd = ffi::ibv_alloc_pd(context);
            if resources.pd.is_null() {
                return Err(RdmaError::verbs("ibv_alloc_pd"));
            }

            resources.channel = ffi::ibv_create_comp_channel(context);
            if resources.channel.is_null() {
                return Err(RdmaError::verbs("ibv_create_comp_channel"));
            }

            let cq_entries = config.cq_entries()?;
            resources.cq = ffi::ibv_create_cq(
                context,
                cq_entries,
                std::ptr::null_mut(),
                resources.channel,
                0,
            );
            if resources.cq.is_null() {
                return Err(RdmaError::verbs("ibv_create_cq"));
            }

            let mut qp_init_attr = ffi::ibv_qp_init_attr {
                qp_context: std::ptr::null_mut(),
                send_cq: resources.cq,
                recv_cq: resources.cq,
                srq: std::ptr::null_mut(),
                cap: ffi::ibv_qp_cap {
                    max_send_wr: config.max_send_wr,
                    max_recv_wr: config.max_recv_wr,
                    max_send_sge: config.max_send_sge,
                    max_recv_sge: config.max_recv_sge,
                    max_inline_data: 0,
                },
                qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
                sq_sig_all: 0,
            };
            resources.qp = ffi::ibv_create_qp(resources.pd, &mut qp_init_attr);
            if resources.qp.is_null() {
                return Err(RdmaError::verbs("ibv_create_qp"));
            }

            let access = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
                | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ
                | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
            let mut qp_attr = ffi::ibv_qp_attr {
                qp_state: ffi::ibv_qp_state::IBV_QPS_INIT,
                qp_access_flags: access.0,
                pkey_index: config.pkey_index,
                port_num: port,
                ..Default::default()
            };
            let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
                | ffi::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                | ffi::ibv_qp_attr_mask::IBV_QP_PORT
                | ffi::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
            if ffi::ibv_modify_qp(resources.qp, &mut qp_attr, mask.0 as i32) != 0 {
                return Err(RdmaError::verbs("ibv_modify_qp(INIT)"));
            }

            let (lid_or_gid, gidx) = match config.link_type {
                LinkType::InfiniBand => (PortAddress::Lid(port_attr.lid), None),
                LinkType::Ethernet => {
                    let index = match config.gid_index {
                        Some(index) => index,
                        None => find_roce_v2_gid_index(
                            context,
                            &device_name,
                            port,
                            port_attr.gid_tbl_len,
                        )?,
                    };
                    let mut gid = Gid::default();
                    if ffi::ibv_query_gid(context, port, i32::from(index), gid.as_mut()) != 0 {
                        return Err(RdmaError::verbs("ibv_query_gid"));
                    }
                    (PortAddress::Gid(gid), Some(index))
                }
            };

            let local = ConnectionDescriptor {
                qpn: (*resources.qp).qp_num,
                psn: rand::random::<u32>() & 0xffffff,
                lid_or_gid,
                mtu: port_attr.active_mtu,
                gidx,
            };
            (format!("{}:{}", device_name, port), local)
        };

        state = advance(&name, state, ContextState::Initialized, "initialize")?;
        tracing::info!("{}: initialized, {}", name, local);

        Ok(Self {
            inner: Arc::new(ContextInner {
                name,
                config,
                local,
                state: Mutex::new(state),
                local_regions: RwLock::new(HashMap::new()),
                remote_regions: RwLock::new(HashMap::new()),
                completions: CompletionRegistry::new(),
                post_lock: Mutex::new(()),
                stop: AtomicBool::new(false),
                resources,
            }),
            poller: Mutex::new(None),
        })
    }

    /// `device:port` label used in logs and errors.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RdmaContextConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ContextState {
        *self.inner.lock_state()
    }

    /// Descriptor to hand to the peer.
    pub fn local_descriptor(&self) -> ConnectionDescriptor {
        self.inner.local
    }

    /// Drives the queue pair to RTS against `remote` and starts the completion poller.
    ///
    /// A context can be connected once; later calls fail with `AlreadyConnected`.
    pub fn connect(&self, remote: &ConnectionDescriptor) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            match *state {
                ContextState::Handshaking | ContextState::Connected => {
                    return Err(RdmaError::AlreadyConnected(self.inner.name.clone()));
                }
                current => {
                    *state = advance(
                        &self.inner.name,
                        current,
                        ContextState::Handshaking,
                        "connect",
                    )?;
                }
            }
        }

        // SAFETY: the queue pair is alive for as long as `inner` is.
        unsafe {
            self.inner.modify_to_rtr(remote)?;
            self.inner.modify_to_rts()?;
            self.inner.arm_notifications()?;
        }

        {
            let mut state = self.inner.lock_state();
            *state = advance(
                &self.inner.name,
                *state,
                ContextState::Connected,
                "finish handshake",
            )?;
        }

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rdma-poller-{}", self.inner.name))
            .spawn(move || inner.poll_completions())
            .map_err(|source| RdmaError::Verbs {
                op: "spawn completion poller",
                source,
            })?;
        *self.poller.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        tracing::info!(
            "{}: connected to remote qpn {} psn 0x{:06x}",
            self.inner.name,
            remote.qpn,
            remote.psn
        );
        Ok(())
    }

    /// Registers `[addr, addr + length)` under `key` and returns what the peer needs to reach it.
    ///
    /// The memory must stay valid until the context is dropped.
    pub fn register_memory_region(
        &self,
        key: &str,
        addr: usize,
        length: usize,
    ) -> Result<RemoteMemoryRegion> {
        let state = self.state();
        if !state.accepts_registration() {
            return Err(RdmaError::InvalidState {
                context: self.inner.name.clone(),
                state,
                operation: "register memory",
            });
        }

        let mut regions = self
            .inner
            .local_regions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if regions.contains_key(key) {
            return Err(RdmaError::DuplicateMemoryRegion(key.to_string()));
        }

        let access = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;

        // SAFETY: the caller guarantees the range is valid memory that outlives the
        // registration; the protection domain is alive for as long as `inner` is.
        let mr = unsafe {
            ffi::ibv_reg_mr(
                self.inner.resources.pd,
                addr as *mut std::ffi::c_void,
                length,
                access.0 as i32,
            )
        };
        if mr.is_null() {
            return Err(RdmaError::verbs("ibv_reg_mr"));
        }

        // SAFETY: `mr` was just checked for null.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        regions.insert(
            key.to_string(),
            LocalRegion {
                mr,
                addr,
                length,
                lkey,
                rkey,
            },
        );
        tracing::debug!(
            "{}: registered {} at 0x{:x} ({} bytes)",
            self.inner.name,
            key,
            addr,
            length
        );

        Ok(RemoteMemoryRegion {
            addr: addr as u64,
            rkey,
        })
    }

    /// Deregisters the local memory region under `key`.
    pub fn deregister_memory_region(&self, key: &str) -> Result<()> {
        let region = self
            .inner
            .local_regions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .ok_or_else(|| RdmaError::UnknownMemoryRegion(key.to_string()))?;
        // SAFETY: `mr` came from ibv_reg_mr on this context's protection domain and was
        // just removed from the table, so nothing else can post against it.
        if unsafe { ffi::ibv_dereg_mr(region.mr) } != 0 {
            return Err(RdmaError::verbs("ibv_dereg_mr"));
        }
        tracing::debug!("{}: deregistered {}", self.inner.name, key);
        Ok(())
    }

    /// Records the peer's registration for `key`.
    pub fn register_remote_memory_region(
        &self,
        key: &str,
        remote: RemoteMemoryRegion,
    ) -> Result<()> {
        let mut regions = self
            .inner
            .remote_regions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if regions.contains_key(key) {
            return Err(RdmaError::DuplicateMemoryRegion(key.to_string()));
        }
        regions.insert(key.to_string(), remote);
        Ok(())
    }

    /// Local registrations as advertised to the peer.
    pub fn memory_regions(&self) -> BTreeMap<String, RemoteMemoryRegion> {
        self.inner
            .local_regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, region)| {
                (
                    key.clone(),
                    RemoteMemoryRegion {
                        addr: region.addr as u64,
                        rkey: region.rkey,
                    },
                )
            })
            .collect()
    }

    /// Reads `length` bytes at `target_offset` of the peer's `key` into `source_offset` of ours.
    pub fn post_read(
        &self,
        key: &str,
        source_offset: usize,
        target_offset: usize,
        length: usize,
        callback: CompletionCallback,
    ) -> Result<()> {
        self.post_read_batch(key, &[source_offset], &[target_offset], length, callback)
    }

    /// Posts one RDMA read per offset pair as a linked chain.
    ///
    /// Only the last work request is signaled, so `callback` runs once when the whole
    /// chain has completed (or with the failure status of the chain). When posting
    /// fails the callback is dropped without being called.
    pub fn post_read_batch(
        &self,
        key: &str,
        source_offsets: &[usize],
        target_offsets: &[usize],
        length: usize,
        callback: CompletionCallback,
    ) -> Result<()> {
        if source_offsets.len() != target_offsets.len() {
            return Err(RdmaError::BatchMismatch {
                sources: source_offsets.len(),
                targets: target_offsets.len(),
            });
        }
        let state = self.state();
        if state != ContextState::Connected {
            return Err(RdmaError::InvalidState {
                context: self.inner.name.clone(),
                state,
                operation: "post a read",
            });
        }
        if source_offsets.is_empty() {
            callback(CompletionStatus::Success);
            return Ok(());
        }

        let (local_addr, local_length, lkey) = {
            let regions = self
                .inner
                .local_regions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let region = regions
                .get(key)
                .ok_or_else(|| RdmaError::UnknownMemoryRegion(key.to_string()))?;
            (region.addr, region.length, region.lkey)
        };
        let remote = self
            .inner
            .remote_regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .ok_or_else(|| RdmaError::UnknownRemoteMemoryRegion(key.to_string()))?;

        let sge_length = check_read_range(key, source_offsets, length, local_length)?;
        let opcode = ffi::ibv_wr_opcode::Type::try_from(OpCode::Read)
            .map_err(RdmaError::UnsupportedOpcode)?;

        let mut sges: Vec<ffi::ibv_sge> = source_offsets
            .iter()
            .map(|offset| ffi::ibv_sge {
                addr: (local_addr + offset) as u64,
                length: sge_length,
                lkey,
            })
            .collect();

        let wr_id = self.inner.completions.insert(callback);
        let last = sges.len() - 1;

        // SAFETY: `ibv_send_wr` is a plain C struct for which all-zero is a valid value.
        // `sges` and `wrs` are fully built before any pointer into them is taken and are
        // not resized afterwards, so the chain stays valid until post_send returns.
        let mut wrs: Vec<ffi::ibv_send_wr> = (0..sges.len())
            .map(|_| unsafe { std::mem::zeroed() })
            .collect();
        unsafe {
            let sge_base = sges.as_mut_ptr();
            let wr_base = wrs.as_mut_ptr();
            for (i, target_offset) in target_offsets.iter().enumerate() {
                let wr = &mut *wr_base.add(i);
                wr.sg_list = sge_base.add(i);
                wr.num_sge = 1;
                wr.opcode = opcode;
                wr.wr.rdma.remote_addr = remote.addr.wrapping_add(*target_offset as u64);
                wr.wr.rdma.rkey = remote.rkey;
                if i == last {
                    wr.wr_id = wr_id;
                    wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;
                } else {
                    wr.wr_id = UNSIGNALED_WR_ID;
                    wr.next = wr_base.add(i + 1);
                }
            }
        }

        let posted = {
            let _guard = self
                .inner
                .post_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // SAFETY: see above; the queue pair outlives this call.
            unsafe { self.inner.post_send(wrs.as_mut_ptr()) }
        };
        if let Err(source) = posted {
            self.inner.completions.take(wr_id);
            tracing::warn!(
                "{}: failed to post {} reads on {}: {}",
                self.inner.name,
                wrs.len(),
                key,
                source
            );
            return Err(RdmaError::PostFailed {
                context: self.inner.name.clone(),
                source,
            });
        }

        tracing::debug!(
            "{}: posted {} reads of {} bytes on {} (wr_id {})",
            self.inner.name,
            wrs.len(),
            length,
            key,
            wr_id
        );
        Ok(())
    }

    /// Stops the completion poller and moves the context to `Stopped`.
    ///
    /// The queue pair is moved to the error state, which flushes outstanding work
    /// requests, and a signaled sentinel request wakes the poller so it can be joined.
    /// Callbacks of requests still in flight are dropped. Calling this twice is a no-op.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if *state == ContextState::Stopped {
                return Ok(());
            }
            *state = advance(&self.inner.name, *state, ContextState::Stopped, "stop")?;
        }
        self.inner.stop.store(true, Ordering::Release);

        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // SAFETY: the queue pair is alive for as long as `inner` is.
            if let Err(err) = unsafe { self.inner.post_shutdown_sentinel() } {
                // Joining would block forever; leave the poller detached.
                tracing::error!("{}: cannot wake completion poller: {}", self.inner.name, err);
                return Err(err);
            }
            if handle.join().is_err() {
                tracing::error!("{}: completion poller panicked", self.inner.name);
            }
        }

        let dropped = self.inner.completions.clear();
        if dropped > 0 {
            tracing::warn!(
                "{}: dropped {} in-flight completion records on stop",
                self.inner.name,
                dropped
            );
        }
        tracing::info!("{}: stopped", self.inner.name);
        Ok(())
    }
}

impl Drop for RdmaContext {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!("{}: stop on drop failed: {}", self.inner.name, err);
        }
    }
}

impl fmt::Debug for RdmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaContext")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("local", &self.inner.local)
            .finish()
    }
}

impl fmt::Display for RdmaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.inner.name, self.state(), self.inner.local)
    }
}

impl TransferContext for RdmaContext {
    fn name(&self) -> String {
        self.inner.name.clone()
    }

    fn local_descriptor(&self) -> ConnectionDescriptor {
        RdmaContext::local_descriptor(self)
    }

    fn connect(&self, remote: &ConnectionDescriptor) -> Result<()> {
        RdmaContext::connect(self, remote)
    }

    fn register_memory_region(
        &self,
        key: &str,
        addr: usize,
        length: usize,
    ) -> Result<RemoteMemoryRegion> {
        RdmaContext::register_memory_region(self, key, addr, length)
    }

    fn deregister_memory_region(&self, key: &str) -> Result<()> {
        RdmaContext::deregister_memory_region(self, key)
    }

    fn register_remote_memory_region(&self, key: &str, remote: RemoteMemoryRegion) -> Result<()> {
        RdmaContext::register_remote_memory_region(self, key, remote)
    }

    fn memory_regions(&self) -> BTreeMap<String, RemoteMemoryRegion> {
        RdmaContext::memory_regions(self)
    }

    fn post_read_batch(
        &self,
        key: &str,
        source_offsets: &[usize],
        target_offsets: &[usize],
        length: usize,
        callback: CompletionCallback,
    ) -> Result<()> {
        RdmaContext::post_read_batch(self, key, source_offsets, target_offsets, length, callback)
    }

    fn stop(&self) -> Result<()> {
        RdmaContext::stop(self)
    }
}

impl ContextInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    unsafe fn modify_to_rtr(&self, remote: &ConnectionDescriptor) -> Result<()> {
        let mut qp_attr = ffi::ibv_qp_attr {
            qp_state: ffi::ibv_qp_state::IBV_QPS_RTR,
            path_mtu: self.local.mtu.min(remote.mtu),
            dest_qp_num: remote.qpn,
            rq_psn: remote.psn,
            max_dest_rd_atomic: self.config.max_dest_rd_atomic,
            min_rnr_timer: self.config.min_rnr_timer,
            ah_attr: ffi::ibv_ah_attr {
                sl: 0,
                src_path_bits: 0,
                port_num: self.config.port_num,
                ..Default::default()
            },
            ..Default::default()
        };

        match remote.lid_or_gid {
            PortAddress::Lid(lid) => {
                qp_attr.ah_attr.dlid = lid;
                qp_attr.ah_attr.is_global = 0;
            }
            PortAddress::Gid(gid) => {
                qp_attr.ah_attr.is_global = 1;
                qp_attr.ah_attr.grh.dgid = gid.into();
                qp_attr.ah_attr.grh.hop_limit = 1;
                qp_attr.ah_attr.grh.sgid_index = self.local.gidx.unwrap_or(0);
            }
        }

        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
            | ffi::ibv_qp_attr_mask::IBV_QP_AV
            | ffi::ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ffi::ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ffi::ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ffi::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ffi::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;

        // SAFETY: the caller guarantees the queue pair is alive.
        if unsafe { ffi::ibv_modify_qp(self.resources.qp, &mut qp_attr, mask.0 as i32) } != 0 {
            return Err(RdmaError::verbs("ibv_modify_qp(RTR)"));
        }
        Ok(())
    }

    unsafe fn modify_to_rts(&self) -> Result<()> {
        let mut qp_attr = ffi::ibv_qp_attr {
            qp_state: ffi::ibv_qp_state::IBV_QPS_RTS,
            sq_psn: self.local.psn,
            timeout: self.config.qp_timeout,
            retry_cnt: self.config.retry_cnt,
            rnr_retry: self.config.rnr_retry,
            max_rd_atomic: self.config.max_rd_atomic,
            ..Default::default()
        };
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
            | ffi::ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ffi::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ffi::ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ffi::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ffi::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;

        // SAFETY: the caller guarantees the queue pair is alive.
        if unsafe { ffi::ibv_modify_qp(self.resources.qp, &mut qp_attr, mask.0 as i32) } != 0 {
            return Err(RdmaError::verbs("ibv_modify_qp(RTS)"));
        }
        Ok(())
    }

    unsafe fn arm_notifications(&self) -> Result<()> {
        // SAFETY: `context` and `cq` are alive; `req_notify_cq` is an inline verb.
        let rc = unsafe {
            let ops = &mut (*self.resources.context).ops;
            match ops.req_notify_cq.as_mut() {
                Some(req_notify_cq) => req_notify_cq(self.resources.cq, 0),
                None => -1,
            }
        };
        if rc != 0 {
            return Err(RdmaError::verbs("ibv_req_notify_cq"));
        }
        Ok(())
    }

    unsafe fn post_send(&self, wr: *mut ffi::ibv_send_wr) -> std::io::Result<()> {
        let mut bad_wr: *mut ffi::ibv_send_wr = std::ptr::null_mut();
        // SAFETY: `wr` points to a valid chain; the caller holds `post_lock`.
        let rc = unsafe {
            let ops = &mut (*self.resources.context).ops;
            match ops.post_send.as_mut() {
                Some(post_send) => post_send(self.resources.qp, wr, &mut bad_wr),
                None => return Err(std::io::Error::other("post_send verb not provided")),
            }
        };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Moves the queue pair to ERR and posts a signaled zero-length SEND carrying
    /// [`SHUTDOWN_WR_ID`]. The flushed completion wakes the poller.
    unsafe fn post_shutdown_sentinel(&self) -> Result<()> {
        let mut qp_attr = ffi::ibv_qp_attr {
            qp_state: ffi::ibv_qp_state::IBV_QPS_ERR,
            ..Default::default()
        };
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE;
        // SAFETY: the queue pair is alive.
        if unsafe { ffi::ibv_modify_qp(self.resources.qp, &mut qp_attr, mask.0 as i32) } != 0 {
            return Err(RdmaError::verbs("ibv_modify_qp(ERR)"));
        }

        // SAFETY: all-zero is a valid `ibv_send_wr`; no scatter/gather list is attached.
        let mut wr: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = SHUTDOWN_WR_ID;
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED.0;

        let _guard = self.post_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: `wr` lives until post_send returns.
        unsafe { self.post_send(&mut wr) }.map_err(|source| RdmaError::PostFailed {
            context: self.name.clone(),
            source,
        })
    }

    /// Body of the completion poller thread.
    fn poll_completions(self: Arc<Self>) {
        let batch = self.config.poll_batch.max(1);
        let mut wcs: Vec<ffi::ibv_wc> = (0..batch).map(|_| ffi::ibv_wc::default()).collect();
        tracing::debug!("{}: completion poller started", self.name);

        'events: loop {
            let mut event_cq: *mut ffi::ibv_cq = std::ptr::null_mut();
            let mut event_context: *mut std::ffi::c_void = std::ptr::null_mut();
            // SAFETY: the channel outlives this thread, which holds an `Arc` to it.
            let rc = unsafe {
                ffi::ibv_get_cq_event(self.resources.channel, &mut event_cq, &mut event_context)
            };
            if rc != 0 {
                if !self.stop.load(Ordering::Acquire) {
                    tracing::error!(
                        "{}: ibv_get_cq_event failed: {}",
                        self.name,
                        std::io::Error::last_os_error()
                    );
                }
                break;
            }
            // SAFETY: `event_cq` was returned by ibv_get_cq_event.
            unsafe { ffi::ibv_ack_cq_events(event_cq, 1) };

            // SAFETY: the queue is alive for as long as `self` is.
            if let Err(err) = unsafe { self.arm_notifications() } {
                tracing::error!("{}: {}", self.name, err);
                break;
            }

            let mut shutdown = false;
            loop {
                // SAFETY: `wcs` has room for `batch` entries.
                let polled = unsafe { self.poll_cq(&mut wcs) };
                if polled < 0 {
                    tracing::error!("{}: poll_cq failed with {}", self.name, polled);
                    break 'events;
                }
                if polled == 0 {
                    break;
                }
                for wc in &wcs[..polled as usize] {
                    if wc.wr_id() == SHUTDOWN_WR_ID {
                        shutdown = true;
                    } else {
                        self.dispatch(wc);
                    }
                }
            }

            if shutdown || self.stop.load(Ordering::Acquire) {
                break;
            }
        }

        tracing::debug!("{}: completion poller exiting", self.name);
    }

    unsafe fn poll_cq(&self, wcs: &mut [ffi::ibv_wc]) -> i32 {
        // SAFETY: `poll_cq` is an inline verb on a live context.
        unsafe {
            let ops = &mut (*self.resources.context).ops;
            match ops.poll_cq.as_mut() {
                Some(poll_cq) => poll_cq(self.resources.cq, wcs.len() as i32, wcs.as_mut_ptr()),
                None => -1,
            }
        }
    }

    fn dispatch(&self, wc: &ffi::ibv_wc) {
        let wr_id = wc.wr_id();
        let status = match wc.error() {
            Some((status, vendor_err)) => {
                tracing::error!(
                    "{}: work request {} failed: {} (vendor error 0x{:x})",
                    self.name,
                    wr_id,
                    wc_status_str(status),
                    vendor_err
                );
                CompletionStatus::Failed(status)
            }
            None => CompletionStatus::Success,
        };
        if wr_id == UNSIGNALED_WR_ID {
            return;
        }
        match self.completions.take(wr_id) {
            Some(callback) => callback(status),
            None => tracing::warn!(
                "{}: completion for unknown record {} ({})",
                self.name,
                wr_id,
                status
            ),
        }
    }
}

/// Validates a batch of local reads and returns the per-request SGE length.
fn check_read_range(key: &str, offsets: &[usize], length: usize, size: usize) -> Result<u32> {
    let out_of_range = |offset: usize| RdmaError::OutOfRange {
        key: key.to_string(),
        offset,
        length,
        size,
    };
    if let Some(&offset) = offsets
        .iter()
        .find(|offset| offset.checked_add(length).is_none_or(|end| end > size))
    {
        return Err(out_of_range(offset));
    }
    u32::try_from(length).map_err(|_| out_of_range(offsets.first().copied().unwrap_or_default()))
}

fn advance(
    name: &str,
    current: ContextState,
    next: ContextState,
    operation: &'static str,
) -> Result<ContextState> {
    if current.can_transition_to(next) {
        Ok(next)
    } else {
        Err(RdmaError::InvalidState {
            context: name.to_string(),
            state: current,
            operation,
        })
    }
}

fn wc_status_str(status: ffi::ibv_wc_status::Type) -> String {
    // SAFETY: ibv_wc_status_str returns a pointer to a static string.
    unsafe {
        let c_str = ffi::ibv_wc_status_str(status);
        if c_str.is_null() {
            return format!("status {}", status);
        }
        CStr::from_ptr(c_str).to_string_lossy().into_owned()
    }
}

/// Opens `requested`, or the first device when it does not exist.
unsafe fn open_device(requested: &str) -> Result<(*mut ffi::ibv_context, String)> {
    // SAFETY: the device list is freed on every path after the context is opened;
    // opened contexts stay valid after the list is freed.
    unsafe {
        let mut num_devices = 0i32;
        let list = ffi::ibv_get_device_list(&mut num_devices);
        if list.is_null() {
            return Err(RdmaError::NoDevices);
        }
        if num_devices <= 0 {
            ffi::ibv_free_device_list(list);
            return Err(RdmaError::NoDevices);
        }

        let devices = std::slice::from_raw_parts(list, num_devices as usize);
        let names: Vec<String> = devices
            .iter()
            .map(|device| {
                CStr::from_ptr(ffi::ibv_get_device_name(*device))
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        let index = match names.iter().position(|name| name == requested) {
            Some(index) => index,
            None => {
                if requested.is_empty() {
                    tracing::info!("no device requested, using {}", names[0]);
                } else {
                    tracing::info!("device {} not found, falling back to {}", requested, names[0]);
                }
                0
            }
        };

        let context = ffi::ibv_open_device(devices[index]);
        let open_error = std::io::Error::last_os_error();
        ffi::ibv_free_device_list(list);
        if context.is_null() {
            return Err(RdmaError::DeviceOpen {
                name: names[index].clone(),
                source: open_error,
            });
        }
        Ok((context, names[index].clone()))
    }
}

/// First RoCE v2 entry of the port's GID table that holds an IPv4-mapped address.
unsafe fn find_roce_v2_gid_index(
    context: *mut ffi::ibv_context,
    device: &str,
    port: u8,
    gid_tbl_len: i32,
) -> Result<u8> {
    for index in 0..gid_tbl_len.min(i32::from(u8::MAX)) {
        if gid_type(device, port, index).as_deref() != Some("RoCE v2") {
            continue;
        }
        let mut gid = ffi::ibv_gid::default();
        // SAFETY: `context` is an open device context.
        if unsafe { ffi::ibv_query_gid(context, port, index, &mut gid) } != 0 {
            continue;
        }
        // SAFETY: every bit pattern of the union is a valid byte array.
        let raw = unsafe { gid.raw };
        if is_ipv4_mapped_gid(&raw) {
            tracing::info!("{}:{}: using RoCE v2 gid index {}", device, port, index);
            return Ok(index as u8);
        }
    }
    Err(RdmaError::GidNotFound {
        device: device.to_string(),
        port,
    })
}
