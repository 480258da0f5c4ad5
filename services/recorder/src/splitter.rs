//! Branch splitter.
//!
//! Duplicates the post-overlay frame stream into named branches, each behind
//! its own bounded queue. Delivery never waits on a branch: a full queue drops
//! the frame on that branch only. Attach and detach take the branch list's
//! write lock, so a frame is delivered either to a fully attached branch or
//! not at all.

use crate::frame::Frame;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors raised by branch management.
#[derive(Debug, Error)]
pub enum SplitterError {
    #[error("Branch '{0}' is already attached")]
    AlreadyAttached(String),

    #[error("Branch '{0}' is not attached")]
    NotAttached(String),
}

/// Delivery counters for one branch.
#[derive(Debug, Default, Clone)]
pub struct BranchStats {
    pub delivered: u64,
    pub dropped: u64,
}

struct Branch {
    name: String,
    tx: mpsc::Sender<Frame>,
    stats: BranchStats,
}

/// Fans one frame stream out to independent branches.
#[derive(Clone, Default)]
pub struct BranchSplitter {
    branches: Arc<RwLock<Vec<Branch>>>,
    detached: Arc<RwLock<Vec<(String, BranchStats)>>>,
}

impl BranchSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a branch with a bounded queue of `capacity` frames.
    pub fn attach(&self, name: &str, capacity: usize) -> Result<mpsc::Receiver<Frame>, SplitterError> {
        let mut branches = self.branches.write();
        if branches.iter().any(|b| b.name == name) {
            return Err(SplitterError::AlreadyAttached(name.to_string()));
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        branches.push(Branch {
            name: name.to_string(),
            tx,
            stats: BranchStats::default(),
        });
        info!(branch = name, capacity, "Branch attached");
        Ok(rx)
    }

    /// Detach a branch. Frames already queued stay readable by its receiver.
    pub fn detach(&self, name: &str) -> Result<BranchStats, SplitterError> {
        let mut branches = self.branches.write();
        let index = branches
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| SplitterError::NotAttached(name.to_string()))?;

        let branch = branches.remove(index);
        info!(
            branch = name,
            delivered = branch.stats.delivered,
            dropped = branch.stats.dropped,
            "Branch detached"
        );
        self.detached.write().push((branch.name, branch.stats.clone()));
        Ok(branch.stats)
    }

    /// Deliver a frame to every attached branch. Returns the number of branches reached.
    pub fn deliver(&self, frame: Frame) -> usize {
        let mut branches = self.branches.write();
        let mut delivered = 0;
        let mut closed = Vec::new();

        let last = branches.len().saturating_sub(1);
        let mut frame = Some(frame);
        for (i, branch) in branches.iter_mut().enumerate() {
            let copy = if i == last {
                frame.take()
            } else {
                frame.clone()
            };
            let Some(copy) = copy else {
                break;
            };

            match branch.tx.try_send(copy) {
                Ok(()) => {
                    branch.stats.delivered += 1;
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    branch.stats.dropped += 1;
                    if branch.stats.dropped.is_power_of_two() {
                        warn!(
                            branch = %branch.name,
                            dropped = branch.stats.dropped,
                            "Branch queue full, dropping frames"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(i),
            }
        }

        for i in closed.into_iter().rev() {
            let branch = branches.remove(i);
            debug!(branch = %branch.name, "Branch receiver closed, detaching");
            self.detached.write().push((branch.name, branch.stats));
        }

        delivered
    }

    /// Names of the attached branches, in delivery order.
    pub fn branch_names(&self) -> Vec<String> {
        self.branches.read().iter().map(|b| b.name.clone()).collect()
    }

    /// Counters for every branch, attached or not.
    pub fn stats(&self) -> Vec<(String, BranchStats)> {
        let mut stats: Vec<_> = self.detached.read().clone();
        stats.extend(
            self.branches
                .read()
                .iter()
                .map(|b| (b.name.clone(), b.stats.clone())),
        );
        stats
    }

    /// Detach every branch, closing their queues.
    pub fn close(&self) {
        let mut branches = self.branches.write();
        let mut detached = self.detached.write();
        for branch in branches.drain(..) {
            detached.push((branch.name, branch.stats));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(i: u64) -> Frame {
        Frame::new(0, i, Duration::from_millis(i * 33), 2, 2, Bytes::from_static(&[1u8; 12]))
    }

    #[tokio::test]
    async fn test_stalled_branch_does_not_block_live() {
        let splitter = BranchSplitter::new();
        let mut live = splitter.attach("live", 100).unwrap();
        let _record = splitter.attach("record", 2).unwrap();

        for i in 0..50 {
            splitter.deliver(frame(i));
        }

        for i in 0..50 {
            assert_eq!(live.recv().await.unwrap().sequence, i);
        }

        let stats = splitter.stats();
        let record = &stats.iter().find(|(n, _)| n == "record").unwrap().1;
        assert_eq!(record.delivered, 2);
        assert_eq!(record.dropped, 48);
        let live_stats = &stats.iter().find(|(n, _)| n == "live").unwrap().1;
        assert_eq!(live_stats.dropped, 0);
    }

    #[tokio::test]
    async fn test_detach_keeps_live_order() {
        let splitter = BranchSplitter::new();
        let mut live = splitter.attach("live", 100).unwrap();
        let mut record = splitter.attach("record", 100).unwrap();

        for i in 0..10 {
            splitter.deliver(frame(i));
        }
        splitter.detach("record").unwrap();
        for i in 10..20 {
            assert_eq!(splitter.deliver(frame(i)), 1);
        }
        splitter.attach("record", 100).unwrap();
        splitter.deliver(frame(20));

        let mut seen = Vec::new();
        while let Ok(f) = live.try_recv() {
            seen.push(f.sequence);
        }
        assert_eq!(seen, (0..21).collect::<Vec<_>>());

        // Old record receiver got exactly the frames before the detach
        let mut old = Vec::new();
        while let Ok(f) = record.try_recv() {
            old.push(f.sequence);
        }
        assert_eq!(old, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_closed_branch_detached() {
        let splitter = BranchSplitter::new();
        let _live = splitter.attach("live", 10).unwrap();
        let record = splitter.attach("record", 10).unwrap();
        drop(record);

        assert_eq!(splitter.deliver(frame(0)), 1);
        assert_eq!(splitter.branch_names(), vec!["live".to_string()]);
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let splitter = BranchSplitter::new();
        let _rx = splitter.attach("live", 10).unwrap();
        assert!(matches!(
            splitter.attach("live", 10),
            Err(SplitterError::AlreadyAttached(_))
        ));
        assert!(matches!(
            splitter.detach("record"),
            Err(SplitterError::NotAttached(_))
        ));
    }

    #[test]
    fn test_payload_shared_between_branches() {
        let splitter = BranchSplitter::new();
        let mut a = splitter.attach("a", 1).unwrap();
        let mut b = splitter.attach("b", 1).unwrap();
        splitter.deliver(frame(0));

        let fa = a.try_recv().unwrap();
        let fb = b.try_recv().unwrap();
        assert_eq!(fa.payload.as_ptr(), fb.payload.as_ptr());
    }
}
