//! Cross-thread hand-off between frame producers, user input and the
//! processing thread.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use kpt_core::{Point2f, Region};
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::collaborators::Frame;

#[derive(Debug, Default)]
struct SlotState {
    latest: Option<Frame>,
    closed: bool,
    published: u64,
    dropped: u64,
}

/// Single-slot, latest-wins frame buffer.
///
/// Producers move whole frames in; a frame that is replaced before the
/// consumer takes it is dropped and counted.
#[derive(Debug, Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `frame` as the latest one. Returns false once the slot is closed.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if let Some(stale) = state.latest.replace(frame) {
            state.dropped += 1;
            debug!("frame {} replaced before it was processed", stale.index);
        }
        state.published += 1;
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Most recent unconsumed frame, without blocking
    pub fn take_latest(&self) -> Option<Frame> {
        self.state.lock().latest.take()
    }

    /// Block until a frame is available. `None` once the slot is closed and drained.
    pub fn wait_latest(&self) -> Option<Frame> {
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.latest.take() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// End of the frame source. The pending frame, if any, can still be taken.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Frames overwritten before the consumer saw them
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

/// Sending half of the init-request channel
#[derive(Debug, Clone)]
pub struct InitRequester {
    tx: Sender<Region>,
}

impl InitRequester {
    /// Queue a re-initialization from `region`.
    ///
    /// Returns false for an empty region, while an earlier request is still
    /// pending, or once the processing side is gone.
    pub fn request(&self, region: Region) -> bool {
        if region.is_empty() {
            return false;
        }
        match self.tx.try_send(region) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("init request ignored, one is already pending");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Receiving half of the init-request channel, polled between frames
#[derive(Debug)]
pub struct InitSignal {
    rx: Receiver<Region>,
}

impl InitSignal {
    /// Take the pending request, if any. Each request is returned exactly once.
    pub fn poll(&self) -> Option<Region> {
        self.rx.try_recv().ok()
    }
}

/// Init-request channel holding at most one pending region
pub fn init_channel() -> (InitRequester, InitSignal) {
    let (tx, rx) = bounded(1);
    (InitRequester { tx }, InitSignal { rx })
}

/// Press/drag/release region selection for the input thread
#[derive(Debug)]
pub struct RegionSelector {
    requester: InitRequester,
    anchor: Option<Point2f>,
    cursor: Point2f,
}

impl RegionSelector {
    pub fn new(requester: InitRequester) -> Self {
        Self {
            requester,
            anchor: None,
            cursor: Point2f::origin(),
        }
    }

    pub fn press(&mut self, p: Point2f) {
        self.anchor = Some(p);
        self.cursor = p;
    }

    pub fn drag(&mut self, p: Point2f) {
        if self.anchor.is_some() {
            self.cursor = p;
        }
    }

    /// Finish the drag and send the selected region.
    ///
    /// Returns the region when the request was queued.
    pub fn release(&mut self, p: Point2f) -> Option<Region> {
        let anchor = self.anchor.take()?;
        let region = Region::from_corners(anchor, p);
        self.requester.request(region).then_some(region)
    }

    pub fn cancel(&mut self) {
        self.anchor = None;
    }

    pub fn is_dragging(&self) -> bool {
        self.anchor.is_some()
    }

    /// Region under the cursor while dragging, for drawing the rubber band
    pub fn preview(&self) -> Option<Region> {
        self.anchor.map(|a| Region::from_corners(a, self.cursor))
    }
}
