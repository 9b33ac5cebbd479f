// Licensed under the Apache-2.0 license

use crate::error::Result;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Lifecycle of a chain slot.
///
/// `Free → Building → Built → Running → Done → Processing → Free`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Free,
    /// Accepting descriptors.
    Building,
    /// Closed and waiting for the hardware.
    Built,
    /// Being walked by the hardware.
    Running,
    /// Hardware reported end of list; results not yet collected.
    Done,
    /// Results collected, callbacks in progress.
    Processing,
}

/// Result of one chained descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpmCompletion {
    pub pdu: usize,
    /// Raw status word written back by the hardware.
    pub status: u32,
    pub result: Result<()>,
}

/// Per-descriptor completion callback.
pub type ChainCallback = Arc<dyn Fn(MpmCompletion) + Send + Sync>;

/// Whole-chain completion callback; replaces per-descriptor callbacks.
pub type ChainDoneCallback = Arc<dyn Fn(&[MpmCompletion]) + Send + Sync>;

/// Where a descriptor's completion is reported.
pub(crate) enum SlotCompletion {
    Normal(Option<ChainCallback>),
    /// Tracked in the on-demand table; `generation` tells a stale entry from
    /// a reused slot.
    Demand { slot: usize, generation: u32 },
}

pub(crate) struct Link {
    pub(crate) pdu: usize,
    pub(crate) key: Option<usize>,
    pub(crate) completion: SlotCompletion,
}

pub(crate) struct Chain {
    pub(crate) links: Vec<Link>,
    pub(crate) aggregate: Option<ChainDoneCallback>,
    pub(crate) state: ChainState,
}

impl Chain {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            links: Vec::with_capacity(capacity),
            aggregate: None,
            state: ChainState::Free,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    pub(crate) fn first_pdu(&self) -> Option<usize> {
        self.links.first().map(|l| l.pdu)
    }

    pub(crate) fn last_pdu(&self) -> Option<usize> {
        self.links.last().map(|l| l.pdu)
    }
}
