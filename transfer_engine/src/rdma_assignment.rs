//! Units of work and the handles callers block on.
use std::fmt;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use crate::completion::CompletionStatus;
use crate::ibverbs_primitives::OpCode;

/// A batch of equally sized transfers against one buffer.
///
/// Element `i` moves `length` bytes between `source_offsets[i]` of the local buffer
/// and `target_offsets[i]` of the peer's buffer registered under the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub opcode: OpCode,
    pub mr_key: String,
    pub source_offsets: Vec<usize>,
    pub target_offsets: Vec<usize>,
    pub length: usize,
}

impl Assignment {
    pub fn new(
        opcode: OpCode,
        mr_key: impl Into<String>,
        source_offsets: Vec<usize>,
        target_offsets: Vec<usize>,
        length: usize,
    ) -> Self {
        Self {
            opcode,
            mr_key: mr_key.into(),
            source_offsets,
            target_offsets,
            length,
        }
    }

    /// Convenience constructor for an RDMA read batch.
    pub fn read(
        mr_key: impl Into<String>,
        source_offsets: Vec<usize>,
        target_offsets: Vec<usize>,
        length: usize,
    ) -> Self {
        Self::new(OpCode::Read, mr_key, source_offsets, target_offsets, length)
    }

    pub fn batch_size(&self) -> usize {
        self.source_offsets.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.batch_size() * self.length
    }

    /// Two assignments can share one work request chain when they only differ in offsets.
    pub fn can_merge(&self, other: &Assignment) -> bool {
        self.opcode == other.opcode && self.mr_key == other.mr_key && self.length == other.length
    }

    /// Appends the offsets of `other`, which must satisfy [`Assignment::can_merge`].
    pub fn merge(&mut self, other: Assignment) {
        debug_assert!(self.can_merge(&other));
        self.source_offsets.extend(other.source_offsets);
        self.target_offsets.extend(other.target_offsets);
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Assignment {{ opcode: {}, mr_key: {}, length: {}, batch: [",
            self.opcode, self.mr_key, self.length
        )?;
        for (i, (source, target)) in self
            .source_offsets
            .iter()
            .zip(&self.target_offsets)
            .enumerate()
        {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{source}->{target}")?;
        }
        write!(f, "] }}")
    }
}

/// Handle for one physical sub-request posted to one device context.
///
/// The completion poller flips it to finished exactly once; `wait` blocks until then.
#[derive(Debug)]
pub struct RdmaAssignment {
    context_index: usize,
    assignment: Assignment,
    status: Mutex<Option<CompletionStatus>>,
    finished: Condvar,
}

impl RdmaAssignment {
    pub fn new(context_index: usize, assignment: Assignment) -> Arc<Self> {
        Arc::new(Self {
            context_index,
            assignment,
            status: Mutex::new(None),
            finished: Condvar::new(),
        })
    }

    pub fn context_index(&self) -> usize {
        self.context_index
    }

    pub fn assignment(&self) -> &Assignment {
        &self.assignment
    }

    /// Marks the handle finished. Only the first call has an effect.
    pub fn complete(&self, status: CompletionStatus) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_none() {
            *current = Some(status);
            self.finished.notify_all();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_some()
    }

    pub fn status(&self) -> Option<CompletionStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the sub-request completes.
    pub fn wait(&self) -> CompletionStatus {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(status) = *status {
                return status;
            }
            status = self
                .finished
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`RdmaAssignment::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletionStatus> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(status) = *status {
                return Some(status);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            status = self
                .finished
                .wait_timeout(status, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl fmt::Display for RdmaAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status() {
            Some(status) => status.to_string(),
            None => "pending".to_string(),
        };
        write!(f, "[context {}] {} ({})", self.context_index, self.assignment, status)
    }
}

/// Handle for a logical transfer: waits on every sub-request the scheduler emitted.
#[derive(Debug, Default)]
pub struct RdmaSchedulerAssignment {
    handles: Vec<Arc<RdmaAssignment>>,
}

impl RdmaSchedulerAssignment {
    pub fn new(handles: Vec<Arc<RdmaAssignment>>) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &[Arc<RdmaAssignment>] {
        &self.handles
    }

    /// Number of physical sub-requests behind this transfer.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_finished())
    }

    /// Blocks until every sub-request has completed. Returns the first failure, if any.
    pub fn wait(&self) -> CompletionStatus {
        self.handles
            .iter()
            .map(|handle| handle.wait())
            .fold(CompletionStatus::Success, |acc, status| {
                if acc.is_success() {
                    status
                } else {
                    acc
                }
            })
    }

    /// Like [`RdmaSchedulerAssignment::wait`] with an overall deadline; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletionStatus> {
        let deadline = Instant::now() + timeout;
        let mut result = CompletionStatus::Success;
        for handle in &self.handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let status = handle.wait_timeout(remaining)?;
            if result.is_success() {
                result = status;
            }
        }
        Some(result)
    }
}

impl fmt::Display for RdmaSchedulerAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RdmaSchedulerAssignment ({} sub-requests)", self.handles.len())?;
        for handle in &self.handles {
            writeln!(f, "  {handle}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_merge_rules() {
        let mut a = Assignment::read("kv#0", vec![0], vec![100], 64);
        let b = Assignment::read("kv#0", vec![64], vec![164], 64);
        let other_key = Assignment::read("kv#1", vec![0], vec![0], 64);
        let other_len = Assignment::read("kv#0", vec![0], vec![0], 32);
        let other_op = Assignment::new(OpCode::Send, "kv#0", vec![0], vec![0], 64);

        assert!(a.can_merge(&b));
        assert!(!a.can_merge(&other_key));
        assert!(!a.can_merge(&other_len));
        assert!(!a.can_merge(&other_op));

        a.merge(b);
        assert_eq!(a.source_offsets, vec![0, 64]);
        assert_eq!(a.target_offsets, vec![100, 164]);
        assert_eq!(a.total_bytes(), 128);
    }

    #[test]
    fn test_display() {
        let a = Assignment::read("kv", vec![0, 8], vec![16, 24], 8);
        assert_eq!(
            a.to_string(),
            "Assignment { opcode: READ, mr_key: kv, length: 8, batch: [0->16, 8->24] }"
        );
        let handle = RdmaAssignment::new(2, a);
        assert!(handle.to_string().contains("pending"));
        handle.complete(CompletionStatus::Success);
        assert!(handle.to_string().starts_with("[context 2]"));
    }

    #[test]
    fn test_wait_released_by_other_thread() {
        let handle = RdmaAssignment::new(0, Assignment::read("kv", vec![0], vec![0], 1));
        let completer = handle.clone();
        let thread = thread::spawn(move || completer.complete(CompletionStatus::Failed(5)));
        assert_eq!(handle.wait(), CompletionStatus::Failed(5));
        thread.join().unwrap();

        // Completion happens once.
        handle.complete(CompletionStatus::Success);
        assert_eq!(handle.status(), Some(CompletionStatus::Failed(5)));
    }

    #[test]
    fn test_wait_timeout() {
        let handle = RdmaAssignment::new(0, Assignment::read("kv", vec![0], vec![0], 1));
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)), None);
        handle.complete(CompletionStatus::Success);
        assert_eq!(
            handle.wait_timeout(Duration::from_millis(10)),
            Some(CompletionStatus::Success)
        );
    }

    #[test]
    fn test_scheduler_assignment_waits_for_all() {
        let handles: Vec<_> = (0..4)
            .map(|i| RdmaAssignment::new(i, Assignment::read("kv", vec![0], vec![0], 1)))
            .collect();
        let batch = RdmaSchedulerAssignment::new(handles.clone());
        assert!(!batch.is_finished());

        let threads: Vec<_> = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| {
                thread::spawn(move || {
                    let status = if i == 2 {
                        CompletionStatus::Failed(9)
                    } else {
                        CompletionStatus::Success
                    };
                    handle.complete(status);
                })
            })
            .collect();

        assert_eq!(batch.wait(), CompletionStatus::Failed(9));
        assert!(batch.is_finished());
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(batch.len(), 4);
    }
}
