//! # Transfer Scheduler
//!
//! `RdmaScheduler` owns a pool of device contexts (one per device port) and the
//! [`MemoryRegionMap`] that spreads logical buffers across them.
//!
//! Submitting an [`Assignment`] expressed in logical buffer offsets goes through
//! four steps:
//!
//! 1. **Split**: every batch element is resolved to the slice containing its source
//!    offset. Elements that cross a slice boundary are cut into one piece per slice,
//!    with offsets translated into slice-local coordinates.
//! 2. **Group**: pieces are grouped by the context owning their slice.
//! 3. **Merge**: consecutive pieces of a group with the same opcode, slice key and
//!    length are folded into one batched sub-request.
//! 4. **Aggregate**: each sub-request reports to a shared [`AggregateCompletion`],
//!    which invokes the caller's callback once, with success after all sub-requests
//!    succeeded or with the first failure.
//!
//! Contexts are reached through the [`TransferContext`] trait so that the scheduling
//! logic can run against in-process contexts in tests.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

#[cfg(test)]
use mockall::automock;

use crate::completion::AggregateCompletion;
use crate::completion::CompletionCallback;
use crate::completion::CompletionStatus;
use crate::control_channel::ControlChannel;
use crate::error::RdmaError;
use crate::error::Result;
use crate::exchange::EndpointInfo;
use crate::exchange::ExchangePayload;
use crate::exchange::RemoteMemoryRegion;
use crate::ibverbs_primitives::ConnectionDescriptor;
use crate::ibverbs_primitives::LinkType;
use crate::ibverbs_primitives::OpCode;
use crate::ibverbs_primitives::available_nics;
use crate::memory_region_map::MemoryRegionMap;
use crate::rdma_assignment::Assignment;
use crate::rdma_assignment::RdmaAssignment;
use crate::rdma_assignment::RdmaSchedulerAssignment;
use crate::rdma_context::RdmaContext;
use crate::rdma_context::RdmaContextConfig;

/// Largest single physical registration: 1 GiB.
pub const DEFAULT_MAX_REGION_SIZE: usize = 1 << 30;

/// One transport endpoint as seen by the scheduler.
///
/// [`RdmaContext`] is the hardware implementation.
#[cfg_attr(test, automock)]
pub trait TransferContext: Send + Sync + 'static {
    /// Label used in logs.
    fn name(&self) -> String;

    /// Descriptor to send to the peer.
    fn local_descriptor(&self) -> ConnectionDescriptor;

    /// Completes the handshake with the peer's descriptor.
    fn connect(&self, remote: &ConnectionDescriptor) -> Result<()>;

    /// Registers local memory under `key`.
    fn register_memory_region(
        &self,
        key: &str,
        addr: usize,
        length: usize,
    ) -> Result<RemoteMemoryRegion>;

    /// Releases the local registration under `key`.
    fn deregister_memory_region(&self, key: &str) -> Result<()>;

    /// Records the peer's registration for `key`.
    fn register_remote_memory_region(&self, key: &str, remote: RemoteMemoryRegion) -> Result<()>;

    /// Local registrations, as advertised to the peer.
    fn memory_regions(&self) -> BTreeMap<String, RemoteMemoryRegion>;

    /// Reads `length` bytes for every `(source, target)` offset pair of `key`.
    ///
    /// `callback` runs once for the whole batch. On `Err` it has been dropped without
    /// being called.
    fn post_read_batch(
        &self,
        key: &str,
        source_offsets: &[usize],
        target_offsets: &[usize],
        length: usize,
        callback: CompletionCallback,
    ) -> Result<()>;

    /// Stops the context; no further reads can be posted on it.
    fn stop(&self) -> Result<()>;
}

/// Configuration for [`RdmaScheduler::new`].
///
/// # Fields
///
/// * `devices` - Device names to open; every device on the host when empty.
/// * `ports_per_device` - Ports used on each device, starting at `context.port_num`.
/// * `link_type` - Link layer every port must report.
/// * `max_region_size` - Cap on a single physical registration.
/// * `context` - Template for each context; device, port and link type are filled in per context.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub devices: Vec<String>,
    pub ports_per_device: u8,
    pub link_type: LinkType,
    pub max_region_size: usize,
    pub context: RdmaContextConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            ports_per_device: 1,
            link_type: LinkType::Ethernet,
            max_region_size: DEFAULT_MAX_REGION_SIZE,
            context: RdmaContextConfig::default(),
        }
    }
}

impl fmt::Display for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SchedulerConfig {{ devices: {:?}, ports_per_device: {}, link: {}, max_region_size: {} }}",
            self.devices, self.ports_per_device, self.link_type, self.max_region_size
        )
    }
}

pub struct RdmaScheduler<C: TransferContext = RdmaContext> {
    contexts: Vec<C>,
    regions: MemoryRegionMap,
    next_context: AtomicUsize,
}

impl RdmaScheduler<RdmaContext> {
    /// Opens one context per device port named by `config`.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let devices = if config.devices.is_empty() {
            available_nics()
        } else {
            config.devices.clone()
        };
        if devices.is_empty() {
            return Err(RdmaError::NoDevices);
        }

        let first_port = config.context.port_num;
        let mut contexts = Vec::new();
        for device in &devices {
            for port_num in first_port..first_port.saturating_add(config.ports_per_device.max(1)) {
                contexts.push(RdmaContext::open(RdmaContextConfig {
                    device_name: device.clone(),
                    port_num,
                    link_type: config.link_type,
                    ..config.context.clone()
                })?);
            }
        }
        tracing::info!("scheduler opened {} contexts: {}", contexts.len(), config);

        Ok(Self::with_contexts(contexts, config.max_region_size))
    }
}

impl<C: TransferContext> RdmaScheduler<C> {
    pub fn with_contexts(contexts: Vec<C>, max_region_size: usize) -> Self {
        Self {
            contexts,
            regions: MemoryRegionMap::new(max_region_size),
            next_context: AtomicUsize::new(0),
        }
    }

    pub fn contexts(&self) -> &[C] {
        &self.contexts
    }

    pub fn memory_regions(&self) -> &MemoryRegionMap {
        &self.regions
    }

    /// Next context in round-robin order, starting at 0.
    pub fn select_device(&self) -> usize {
        round_robin(&self.next_context, self.contexts.len())
    }

    /// Registers a logical buffer, spreading its slices across contexts round robin.
    ///
    /// Returns the number of slices. When any slice fails to register, the slices
    /// already placed are deregistered and the buffer is left unregistered.
    pub fn register_memory_region(
        &mut self,
        key: &str,
        addr: usize,
        length: usize,
    ) -> Result<usize> {
        if self.contexts.is_empty() {
            return Err(RdmaError::NoDevices);
        }
        let contexts = &self.contexts;
        let next_context = &self.next_context;
        let mut placed: Vec<(usize, String)> = Vec::new();
        let result =
            self.regions
                .register(key, addr, length, |slice_key, start, slice_length| {
                    let index = round_robin(next_context, contexts.len());
                    contexts[index].register_memory_region(slice_key, start, slice_length)?;
                    placed.push((index, slice_key.to_string()));
                    Ok(index)
                });
        if let Err(err) = &result {
            tracing::warn!(
                "registering {} failed: {}; releasing {} slices",
                key,
                err,
                placed.len()
            );
            for (index, slice_key) in placed {
                if let Err(err) = contexts[index].deregister_memory_region(&slice_key) {
                    tracing::error!(
                        "{}: failed to deregister {}: {}",
                        contexts[index].name(),
                        slice_key,
                        err
                    );
                }
            }
        }
        result
    }

    /// Per-context handshake payload, in context order.
    pub fn exchange_info(&self) -> ExchangePayload {
        ExchangePayload(
            self.contexts
                .iter()
                .map(|context| EndpointInfo {
                    rdma_info: context.local_descriptor(),
                    mr_info: context.memory_regions(),
                })
                .collect(),
        )
    }

    /// Connects context `i` to entry `i` of the peer's payload and learns its registrations.
    pub fn connect(&mut self, remote: &ExchangePayload) -> Result<()> {
        if remote.len() != self.contexts.len() {
            return Err(RdmaError::ContextCountMismatch {
                local: self.contexts.len(),
                remote: remote.len(),
            });
        }
        for (context, endpoint) in self.contexts.iter().zip(remote.endpoints()) {
            context.connect(&endpoint.rdma_info)?;
            for (key, region) in &endpoint.mr_info {
                context.register_remote_memory_region(key, *region)?;
            }
            tracing::info!(
                "{}: learned {} remote regions",
                context.name(),
                endpoint.mr_info.len()
            );
        }
        Ok(())
    }

    /// Swaps payloads with the peer over `channel` and connects.
    pub fn connect_remote_node(&mut self, channel: &mut dyn ControlChannel) -> Result<()> {
        channel.send(&self.exchange_info().to_bytes()?)?;
        let remote = ExchangePayload::from_bytes(&channel.receive()?)?;
        self.connect(&remote)
    }

    /// Splits, merges and posts `assignment`; `callback` fires once for the whole transfer.
    ///
    /// On `Err` the transfer is abandoned: sub-requests posted before the failure still
    /// complete, but `callback` is never invoked.
    pub fn submit(
        &self,
        assignment: Assignment,
        callback: CompletionCallback,
    ) -> Result<RdmaSchedulerAssignment> {
        if assignment.opcode != OpCode::Read {
            return Err(RdmaError::UnsupportedOpcode(assignment.opcode));
        }
        let plan = self.plan(&assignment)?;
        let total: usize = plan.values().map(Vec::len).sum();
        if total == 0 {
            callback(CompletionStatus::Success);
            return Ok(RdmaSchedulerAssignment::default());
        }
        tracing::debug!(
            "{} on {} split into {} sub-requests over {} contexts",
            assignment.total_bytes(),
            assignment.mr_key,
            total,
            plan.len()
        );

        let aggregate = Arc::new(AggregateCompletion::new(total, callback));
        let mut handles = Vec::with_capacity(total);
        for (context_index, sub_requests) in plan {
            let context = &self.contexts[context_index];
            for sub_request in sub_requests {
                let handle = RdmaAssignment::new(context_index, sub_request);
                handles.push(handle.clone());

                let on_complete: CompletionCallback = {
                    let aggregate = aggregate.clone();
                    let handle = handle.clone();
                    Box::new(move |status: CompletionStatus| {
                        aggregate.on_completion(status);
                        handle.complete(status);
                    })
                };
                let sub_request = handle.assignment();
                if let Err(err) = context.post_read_batch(
                    &sub_request.mr_key,
                    &sub_request.source_offsets,
                    &sub_request.target_offsets,
                    sub_request.length,
                    on_complete,
                ) {
                    tracing::error!(
                        "{}: failed to submit {}: {}",
                        context.name(),
                        sub_request,
                        err
                    );
                    aggregate.abandon();
                    handle.complete(CompletionStatus::Failed(CompletionStatus::POST_FAILURE));
                    return Err(err);
                }
            }
        }
        Ok(RdmaSchedulerAssignment::new(handles))
    }

    /// Resolves `assignment` into merged per-context sub-requests in slice-local offsets.
    pub fn plan(&self, assignment: &Assignment) -> Result<BTreeMap<usize, Vec<Assignment>>> {
        if assignment.source_offsets.len() != assignment.target_offsets.len() {
            return Err(RdmaError::BatchMismatch {
                sources: assignment.source_offsets.len(),
                targets: assignment.target_offsets.len(),
            });
        }
        let key = assignment.mr_key.as_str();
        let length = assignment.length;
        let buffer_len = self.regions.buffer_len(key)?;

        let mut pieces: BTreeMap<usize, Vec<Assignment>> = BTreeMap::new();
        for (&source, &target) in assignment
            .source_offsets
            .iter()
            .zip(&assignment.target_offsets)
        {
            for offset in [source, target] {
                if length == 0
                    || offset
                        .checked_add(length)
                        .is_none_or(|end| end > buffer_len)
                {
                    return Err(RdmaError::OutOfRange {
                        key: key.to_string(),
                        offset,
                        length,
                        size: buffer_len,
                    });
                }
            }

            let mut done = 0;
            for slice in self.regions.slices_from(key, source)? {
                if done == length {
                    break;
                }
                let local_source = source + done - slice.logical_offset();
                let chunk = (length - done).min(slice.length - local_source);
                let local_target = (target + done)
                    .checked_sub(slice.logical_offset())
                    .filter(|local_target| local_target + chunk <= slice.length)
                    .ok_or_else(|| RdmaError::MisalignedTarget {
                        key: key.to_string(),
                        offset: target,
                        slice: slice.key.clone(),
                    })?;
                pieces.entry(slice.context_index).or_default().push(Assignment::new(
                    assignment.opcode,
                    slice.key.clone(),
                    vec![local_source],
                    vec![local_target],
                    chunk,
                ));
                done += chunk;
            }
        }

        Ok(pieces
            .into_iter()
            .map(|(context_index, group)| (context_index, merge_consecutive(group)))
            .collect())
    }

    /// Stops every context, even after one fails. Returns the first error.
    pub fn stop(&self) -> Result<()> {
        let mut first_error = None;
        for context in &self.contexts {
            if let Err(err) = context.stop() {
                tracing::error!("{}: stop failed: {}", context.name(), err);
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<C: TransferContext> fmt::Debug for RdmaScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaScheduler")
            .field(
                "contexts",
                &self.contexts.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("regions", &self.regions)
            .finish()
    }
}

fn round_robin(next: &AtomicUsize, count: usize) -> usize {
    next.fetch_add(1, Ordering::Relaxed) % count.max(1)
}

/// Folds each run of mergeable neighbours into one assignment; never reorders.
fn merge_consecutive(group: Vec<Assignment>) -> Vec<Assignment> {
    let mut merged: Vec<Assignment> = Vec::with_capacity(group.len());
    for assignment in group {
        match merged.last_mut() {
            Some(last) if last.can_merge(&assignment) => last.merge(assignment),
            _ => merged.push(assignment),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ibverbs_primitives::PortAddress;

    /// Records registrations and posted batches; completions are driven by the test.
    #[derive(Default)]
    struct RecordingContext {
        index: usize,
        posted: Mutex<Vec<(Assignment, CompletionCallback)>>,
        registered: Mutex<Vec<(String, usize, usize)>>,
    }

    impl RecordingContext {
        fn new(index: usize) -> Self {
            Self {
                index,
                ..Default::default()
            }
        }

        fn posted(&self) -> Vec<Assignment> {
            self.posted
                .lock()
                .unwrap()
                .iter()
                .map(|(a, _)| a.clone())
                .collect()
        }

        fn complete_all(&self, status: CompletionStatus) {
            let posted: Vec<_> = self.posted.lock().unwrap().drain(..).collect();
            for (_, callback) in posted {
                callback(status);
            }
        }
    }

    impl TransferContext for RecordingContext {
        fn name(&self) -> String {
            format!("recording:{}", self.index)
        }

        fn local_descriptor(&self) -> ConnectionDescriptor {
            ConnectionDescriptor {
                qpn: self.index as u32,
                psn: 0,
                lid_or_gid: PortAddress::Lid(self.index as u16),
                mtu: 5,
                gidx: None,
            }
        }

        fn connect(&self, _remote: &ConnectionDescriptor) -> Result<()> {
            Ok(())
        }

        fn register_memory_region(
            &self,
            key: &str,
            addr: usize,
            length: usize,
        ) -> Result<RemoteMemoryRegion> {
            self.registered
                .lock()
                .unwrap()
                .push((key.to_string(), addr, length));
            Ok(RemoteMemoryRegion {
                addr: addr as u64,
                rkey: self.index as u32,
            })
        }

        fn deregister_memory_region(&self, key: &str) -> Result<()> {
            self.registered.lock().unwrap().retain(|(k, _, _)| k != key);
            Ok(())
        }

        fn register_remote_memory_region(
            &self,
            _key: &str,
            _remote: RemoteMemoryRegion,
        ) -> Result<()> {
            Ok(())
        }

        fn memory_regions(&self) -> BTreeMap<String, RemoteMemoryRegion> {
            self.registered
                .lock()
                .unwrap()
                .iter()
                .map(|(key, addr, _)| {
                    (
                        key.clone(),
                        RemoteMemoryRegion {
                            addr: *addr as u64,
                            rkey: self.index as u32,
                        },
                    )
                })
                .collect()
        }

        fn post_read_batch(
            &self,
            key: &str,
            source_offsets: &[usize],
            target_offsets: &[usize],
            length: usize,
            callback: CompletionCallback,
        ) -> Result<()> {
            self.posted.lock().unwrap().push((
                Assignment::read(key, source_offsets.to_vec(), target_offsets.to_vec(), length),
                callback,
            ));
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn scheduler(contexts: usize, max_region_size: usize) -> RdmaScheduler<RecordingContext> {
        RdmaScheduler::with_contexts(
            (0..contexts).map(RecordingContext::new).collect(),
            max_region_size,
        )
    }

    fn status_sink() -> (CompletionCallback, Arc<Mutex<Vec<CompletionStatus>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        let callback: CompletionCallback =
            Box::new(move |status: CompletionStatus| sink.lock().unwrap().push(status));
        (callback, fired)
    }

    #[test]
    fn test_round_robin_cycles_from_zero() {
        let scheduler = scheduler(3, 100);
        let picks: Vec<_> = (0..7).map(|_| scheduler.select_device()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_is_balanced() {
        for contexts in 1..6 {
            let scheduler = scheduler(contexts, 100);
            let mut visits = vec![0usize; contexts];
            let n = 23;
            for _ in 0..n {
                visits[scheduler.select_device()] += 1;
            }
            for count in visits {
                assert!(count == n / contexts || count == n.div_ceil(contexts));
            }
        }
    }

    #[test]
    fn test_registration_spreads_slices() {
        let mut scheduler = scheduler(2, 100);
        let count = scheduler.register_memory_region("kv", 0x1000, 350).unwrap();
        assert_eq!(count, 4);

        let on_0 = scheduler.contexts()[0].registered.lock().unwrap().clone();
        let on_1 = scheduler.contexts()[1].registered.lock().unwrap().clone();
        assert_eq!(
            on_0,
            vec![
                ("kv#0".to_string(), 0x1000, 100),
                ("kv#2".to_string(), 0x1000 + 200, 100),
            ]
        );
        assert_eq!(
            on_1,
            vec![
                ("kv#1".to_string(), 0x1000 + 100, 100),
                ("kv#3".to_string(), 0x1000 + 300, 50),
            ]
        );

        let payload = scheduler.exchange_info();
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.endpoints()[1].mr_info.len(), 2);
    }

    #[test]
    fn test_within_slice_emits_one_request() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 400).unwrap();

        let plan = scheduler
            .plan(&Assignment::read("kv", vec![110], vec![120], 50))
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(
            plan[&1],
            vec![Assignment::read("kv#1", vec![10], vec![20], 50)]
        );
    }

    #[test]
    fn test_straddling_one_boundary() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 400).unwrap();

        let plan = scheduler
            .plan(&Assignment::read("kv", vec![80], vec![80], 50))
            .unwrap();
        assert_eq!(
            plan[&0],
            vec![Assignment::read("kv#0", vec![80], vec![80], 20)]
        );
        assert_eq!(
            plan[&1],
            vec![Assignment::read("kv#1", vec![0], vec![0], 30)]
        );
    }

    #[test]
    fn test_span_of_many_slices() {
        // Slices of 10 bytes over 3 contexts; a 50 byte read from offset 5 touches
        // slices 0..=5, i.e. five boundaries and six pieces.
        let mut scheduler = scheduler(3, 10);
        scheduler.register_memory_region("kv", 0, 100).unwrap();

        let plan = scheduler
            .plan(&Assignment::read("kv", vec![5], vec![5], 50))
            .unwrap();
        let mut pieces: Vec<(usize, Assignment)> = plan
            .into_iter()
            .flat_map(|(index, group)| group.into_iter().map(move |a| (index, a)))
            .collect();
        pieces.sort_by_key(|(_, a)| a.mr_key.clone());

        let expected = [
            (0, "kv#0", 5, 5),
            (1, "kv#1", 0, 10),
            (2, "kv#2", 0, 10),
            (0, "kv#3", 0, 10),
            (1, "kv#4", 0, 10),
            (2, "kv#5", 0, 5),
        ];
        assert_eq!(pieces.len(), expected.len());
        for ((index, piece), (context, key, offset, length)) in pieces.iter().zip(expected) {
            assert_eq!(*index, context, "{piece}");
            assert_eq!(piece.mr_key, key);
            assert_eq!(piece.source_offsets, vec![offset]);
            assert_eq!(piece.target_offsets, vec![offset]);
            assert_eq!(piece.length, length);
        }
    }

    #[test]
    fn test_merge_groups_same_shape() {
        let mut scheduler = scheduler(1, 1000);
        scheduler.register_memory_region("kv", 0, 1000).unwrap();

        let plan = scheduler
            .plan(&Assignment::read(
                "kv",
                vec![0, 300, 100],
                vec![500, 200, 0],
                100,
            ))
            .unwrap();
        assert_eq!(
            plan[&0],
            vec![Assignment::read(
                "kv#0",
                vec![0, 300, 100],
                vec![500, 200, 0],
                100
            )]
        );
    }

    #[test]
    fn test_merge_does_not_reorder_across_boundary_pieces() {
        // One context, slices of 100: element 1 straddles and produces two pieces of
        // different length, which split the merge run.
        let mut scheduler = scheduler(1, 100);
        scheduler.register_memory_region("kv", 0, 300).unwrap();

        let plan = scheduler
            .plan(&Assignment::read("kv", vec![0, 80, 120], vec![0, 80, 120], 40))
            .unwrap();
        assert_eq!(
            plan[&0],
            vec![
                Assignment::read("kv#0", vec![0], vec![0], 40),
                Assignment::read("kv#0", vec![80], vec![80], 20),
                Assignment::read("kv#1", vec![0], vec![0], 20),
                Assignment::read("kv#1", vec![20], vec![20], 40),
            ]
        );
    }

    #[test]
    fn test_one_byte_tail_slice() {
        let mut scheduler = scheduler(2, 64);
        scheduler.register_memory_region("kv", 0, 3 * 64 + 1).unwrap();

        let plan = scheduler
            .plan(&Assignment::read("kv", vec![3 * 64 - 7], vec![3 * 64 - 7], 8))
            .unwrap();
        assert_eq!(
            plan[&0],
            vec![Assignment::read("kv#2", vec![57], vec![57], 7)]
        );
        assert_eq!(
            plan[&1],
            vec![Assignment::read("kv#3", vec![0], vec![0], 1)]
        );
    }

    #[test]
    fn test_plan_rejects_bad_requests() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 200).unwrap();

        assert!(matches!(
            scheduler.plan(&Assignment::read("missing", vec![0], vec![0], 1)),
            Err(RdmaError::UnknownBuffer(_))
        ));
        assert!(matches!(
            scheduler.plan(&Assignment::read("kv", vec![190], vec![0], 20)),
            Err(RdmaError::OutOfRange { .. })
        ));
        assert!(matches!(
            scheduler.plan(&Assignment::read("kv", vec![0, 1], vec![0], 20)),
            Err(RdmaError::BatchMismatch { .. })
        ));
        // Source in slice 0, target in slice 1.
        assert!(matches!(
            scheduler.plan(&Assignment::read("kv", vec![0], vec![150], 20)),
            Err(RdmaError::MisalignedTarget { .. })
        ));

        let (callback, _) = status_sink();
        assert!(matches!(
            scheduler.submit(
                Assignment::new(OpCode::Send, "kv", vec![0], vec![0], 1),
                callback
            ),
            Err(RdmaError::UnsupportedOpcode(OpCode::Send))
        ));
    }

    #[test]
    fn test_offsets_near_usize_max_are_out_of_range() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 200).unwrap();

        assert!(matches!(
            scheduler.plan(&Assignment::read("kv", vec![usize::MAX], vec![0], 1)),
            Err(RdmaError::OutOfRange {
                offset: usize::MAX,
                ..
            })
        ));
        assert!(matches!(
            scheduler.plan(&Assignment::read("kv", vec![0], vec![usize::MAX - 1], 2)),
            Err(RdmaError::OutOfRange { .. })
        ));

        let (callback, fired) = status_sink();
        assert!(matches!(
            scheduler.submit(Assignment::read("kv", vec![usize::MAX], vec![0], 1), callback),
            Err(RdmaError::OutOfRange { .. })
        ));
        assert!(fired.lock().unwrap().is_empty());
        assert!(scheduler.contexts().iter().all(|c| c.posted().is_empty()));
    }

    #[test]
    fn test_failed_registration_releases_placed_slices() {
        let mut first = MockTransferContext::new();
        first
            .expect_register_memory_region()
            .withf(|key, _, _| key == "kv#0")
            .times(2)
            .returning(|_, addr, _| {
                Ok(RemoteMemoryRegion {
                    addr: addr as u64,
                    rkey: 1,
                })
            });
        first
            .expect_deregister_memory_region()
            .withf(|key| key == "kv#0")
            .times(2)
            .returning(|_| Ok(()));

        let mut second = MockTransferContext::new();
        second
            .expect_register_memory_region()
            .times(2)
            .returning(|_, _, _| {
                Err(RdmaError::Verbs {
                    op: "ibv_reg_mr",
                    source: std::io::Error::from_raw_os_error(12),
                })
            });
        second.expect_deregister_memory_region().never();

        let mut scheduler = RdmaScheduler::with_contexts(vec![first, second], 100);
        for _ in 0..2 {
            assert!(matches!(
                scheduler.register_memory_region("kv", 0, 350),
                Err(RdmaError::Verbs { op: "ibv_reg_mr", .. })
            ));
            assert!(matches!(
                scheduler.memory_regions().buffer_len("kv"),
                Err(RdmaError::UnknownBuffer(_))
            ));
        }
    }

    #[test]
    fn test_stop_reaches_every_context_after_failure() {
        let mut failing = MockTransferContext::new();
        failing.expect_stop().times(1).returning(|| {
            Err(RdmaError::Verbs {
                op: "ibv_post_send",
                source: std::io::Error::from_raw_os_error(5),
            })
        });
        failing.expect_name().return_const("failing".to_string());

        let mut healthy = MockTransferContext::new();
        healthy.expect_stop().times(1).returning(|| Ok(()));

        let mut also_failing = MockTransferContext::new();
        also_failing.expect_stop().times(1).returning(|| {
            Err(RdmaError::Verbs {
                op: "ibv_get_cq_event",
                source: std::io::Error::from_raw_os_error(5),
            })
        });
        also_failing
            .expect_name()
            .return_const("also_failing".to_string());

        let scheduler = RdmaScheduler::with_contexts(vec![failing, healthy, also_failing], 100);
        assert!(matches!(
            scheduler.stop(),
            Err(RdmaError::Verbs {
                op: "ibv_post_send",
                ..
            })
        ));
    }

    #[test]
    fn test_submit_aggregates_success() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 400).unwrap();

        let (callback, fired) = status_sink();
        let handle = scheduler
            .submit(
                Assignment::read("kv", vec![0, 90, 250], vec![0, 90, 250], 20),
                callback,
            )
            .unwrap();
        // Context 0: kv#0 [0,20) + kv#0 [90,100) + kv#2 [50,70); context 1: kv#1 [0,10).
        assert_eq!(handle.len(), 4);
        assert_eq!(scheduler.contexts()[0].posted().len(), 3);
        assert_eq!(scheduler.contexts()[1].posted().len(), 1);

        scheduler.contexts()[0].complete_all(CompletionStatus::Success);
        assert!(fired.lock().unwrap().is_empty());
        assert!(!handle.is_finished());

        scheduler.contexts()[1].complete_all(CompletionStatus::Success);
        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Success]);
        assert_eq!(handle.wait(), CompletionStatus::Success);
    }

    #[test]
    fn test_submit_failure_fires_once() {
        let mut scheduler = scheduler(2, 100);
        scheduler.register_memory_region("kv", 0, 400).unwrap();

        let (callback, fired) = status_sink();
        let handle = scheduler
            .submit(
                Assignment::read("kv", vec![0, 100, 200, 300], vec![0, 100, 200, 300], 10),
                callback,
            )
            .unwrap();

        scheduler.contexts()[1].complete_all(CompletionStatus::Failed(12));
        scheduler.contexts()[0].complete_all(CompletionStatus::Success);

        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Failed(12)]);
        assert_eq!(handle.wait(), CompletionStatus::Failed(12));
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let mut scheduler = scheduler(1, 100);
        scheduler.register_memory_region("kv", 0, 100).unwrap();

        let (callback, fired) = status_sink();
        let handle = scheduler
            .submit(Assignment::read("kv", vec![], vec![], 10), callback)
            .unwrap();
        assert!(handle.is_empty());
        assert_eq!(*fired.lock().unwrap(), vec![CompletionStatus::Success]);
    }

    #[test]
    fn test_connect_checks_context_count() {
        let mut scheduler = scheduler(2, 100);
        let mut remote = scheduler.exchange_info();
        remote.0.pop();
        assert!(matches!(
            scheduler.connect(&remote),
            Err(RdmaError::ContextCountMismatch {
                local: 2,
                remote: 1
            })
        ));
    }

    #[test]
    fn test_post_failure_abandons_transfer() {
        let mut ok = MockTransferContext::new();
        ok.expect_register_memory_region().returning(|_, addr, _| {
            Ok(RemoteMemoryRegion {
                addr: addr as u64,
                rkey: 1,
            })
        });
        ok.expect_post_read_batch()
            .times(1)
            .returning(|_, _, _, _, callback| {
                callback(CompletionStatus::Success);
                Ok(())
            });

        let mut failing = MockTransferContext::new();
        failing.expect_register_memory_region().returning(|_, addr, _| {
            Ok(RemoteMemoryRegion {
                addr: addr as u64,
                rkey: 2,
            })
        });
        failing.expect_name().return_const("failing".to_string());
        failing
            .expect_post_read_batch()
            .times(1)
            .returning(|_, _, _, _, _| {
                Err(RdmaError::PostFailed {
                    context: "failing".to_string(),
                    source: std::io::Error::from_raw_os_error(12),
                })
            });

        let mut scheduler = RdmaScheduler::with_contexts(vec![ok, failing], 100);
        scheduler.register_memory_region("kv", 0, 200).unwrap();

        let (callback, fired) = status_sink();
        let result = scheduler.submit(
            Assignment::read("kv", vec![0, 100], vec![0, 100], 10),
            callback,
        );
        assert!(matches!(result, Err(RdmaError::PostFailed { .. })));
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn test_connect_registers_remote_regions() {
        let mut context = MockTransferContext::new();
        context.expect_connect().times(1).returning(|_| Ok(()));
        context
            .expect_register_remote_memory_region()
            .withf(|key, remote| key == "kv#0" && remote.rkey == 9)
            .times(1)
            .returning(|_, _| Ok(()));
        context.expect_name().return_const("mock".to_string());

        let mut scheduler = RdmaScheduler::with_contexts(vec![context], 100);
        let remote = ExchangePayload(vec![EndpointInfo {
            rdma_info: ConnectionDescriptor {
                qpn: 3,
                psn: 4,
                lid_or_gid: PortAddress::Lid(1),
                mtu: 5,
                gidx: None,
            },
            mr_info: BTreeMap::from([(
                "kv#0".to_string(),
                RemoteMemoryRegion { addr: 0, rkey: 9 },
            )]),
        }]);
        scheduler.connect(&remote).unwrap();
    }
}
