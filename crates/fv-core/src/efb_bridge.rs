//! EFB Bridge - Synchronous EFB peek/poke from the CPU thread
//!
//! The CPU emulation thread sometimes needs a value out of the embedded
//! framebuffer (games poll Z for collision or visibility tests). The read has
//! to run on the render thread, which owns the graphics context, so the CPU
//! thread records the request, raises a flag and blocks until the render
//! thread services it at a safe point.
//!
//! One access is in flight at a time. A second caller queues on the gate lock,
//! not on a second slot. Each access builds its own single-slot reply channel
//! and drops it once the value arrives, so nothing accumulates over a session.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::gpu_bridge::RenderWaker;

/// Value returned for accesses that could not be performed (bridge closed,
/// device lost, core not initialized)
pub const EFB_ACCESS_SENTINEL: u32 = 0;

/// Kind of EFB access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EfbAccessType {
    PeekZ,
    PokeZ,
    PeekColor,
    PokeColor,
}

impl EfbAccessType {
    pub fn is_write(self) -> bool {
        matches!(self, Self::PokeZ | Self::PokeColor)
    }
}

/// A single EFB access, in emulated (logical) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EfbAccessRequest {
    pub kind: EfbAccessType,
    pub x: u32,
    pub y: u32,
    /// Value to write for pokes (24-bit Z or 0xAARRGGBB color), ignored for peeks
    pub data: u32,
}

impl EfbAccessRequest {
    pub fn peek_z(x: u32, y: u32) -> Self {
        Self { kind: EfbAccessType::PeekZ, x, y, data: 0 }
    }

    pub fn poke_z(x: u32, y: u32, z: u32) -> Self {
        Self { kind: EfbAccessType::PokeZ, x, y, data: z }
    }

    pub fn peek_color(x: u32, y: u32) -> Self {
        Self { kind: EfbAccessType::PeekColor, x, y, data: 0 }
    }

    pub fn poke_color(x: u32, y: u32, argb: u32) -> Self {
        Self { kind: EfbAccessType::PokeColor, x, y, data: argb }
    }
}

/// Anything the CPU thread can issue EFB accesses against.
///
/// In dual-core mode that is an [`EfbBridgeSender`]; in single-core mode the
/// video core itself services the access inline.
pub trait EfbAccessPort {
    fn access_efb(&mut self, request: EfbAccessRequest) -> u32;
}

#[derive(Default)]
struct PendingAccess {
    request: Option<EfbAccessRequest>,
    reply: Option<Sender<u32>>,
}

struct EfbShared {
    /// Held by a caller for the whole access
    gate: Mutex<()>,
    /// Request fields, only touched under this lock
    pending: Mutex<PendingAccess>,
    /// Cheap check for the render thread's loop
    requested: AtomicBool,
    open: AtomicBool,
    serviced: AtomicU64,
    waker: Option<RenderWaker>,
}

impl EfbShared {
    /// Complete whatever is pending with the sentinel value
    fn flush_pending(&self, pending: &mut PendingAccess) -> bool {
        let had_request = pending.request.take().is_some();
        if let Some(reply) = pending.reply.take() {
            let _ = reply.send(EFB_ACCESS_SENTINEL);
        }
        self.requested.store(false, Ordering::Release);
        had_request
    }
}

/// The requesting side of the EFB bridge (CPU emulation thread)
#[derive(Clone)]
pub struct EfbBridgeSender {
    shared: Arc<EfbShared>,
}

impl EfbBridgeSender {
    /// Perform an access and block until the render thread has serviced it.
    ///
    /// There is no timeout. The call returns [`EFB_ACCESS_SENTINEL`] only if
    /// the bridge is closed, before or while waiting.
    pub fn access(&self, request: EfbAccessRequest) -> u32 {
        let _gate = self.shared.gate.lock();

        let (reply, response) = channel::bounded(1);
        {
            let mut pending = self.shared.pending.lock();
            if !self.shared.open.load(Ordering::Acquire) {
                tracing::trace!("EFB access {:?} on closed bridge", request.kind);
                return EFB_ACCESS_SENTINEL;
            }
            pending.request = Some(request);
            pending.reply = Some(reply);
            self.shared.requested.store(true, Ordering::Release);
        }

        if let Some(waker) = &self.shared.waker {
            waker.wake();
        }

        // A disconnected channel means the receiver was closed mid-wait
        let value = response.recv().unwrap_or(EFB_ACCESS_SENTINEL);
        drop(response);
        value
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Number of accesses the render thread has completed
    pub fn serviced_count(&self) -> u64 {
        self.shared.serviced.load(Ordering::Acquire)
    }
}

impl EfbAccessPort for EfbBridgeSender {
    fn access_efb(&mut self, request: EfbAccessRequest) -> u32 {
        self.access(request)
    }
}

/// The servicing side of the EFB bridge (render thread)
pub struct EfbBridgeReceiver {
    shared: Arc<EfbShared>,
}

impl EfbBridgeReceiver {
    /// Whether an access is waiting to be serviced
    pub fn is_access_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    /// Service the pending access, if any, with `perform`.
    ///
    /// `perform` runs with the request lock held and its return value is
    /// delivered to the blocked caller. Returns true if an access was serviced.
    pub fn service<F>(&self, perform: F) -> bool
    where
        F: FnOnce(&EfbAccessRequest) -> u32,
    {
        let mut pending = self.shared.pending.lock();
        let request = match pending.request.take() {
            Some(request) => request,
            None => {
                self.shared.requested.store(false, Ordering::Release);
                return false;
            }
        };

        let value = perform(&request);

        self.shared.requested.store(false, Ordering::Release);
        if let Some(reply) = pending.reply.take() {
            let _ = reply.send(value);
        }
        self.shared.serviced.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Complete a pending access with the sentinel without touching the EFB.
    ///
    /// Used when the graphics device is gone and the CPU thread must not hang.
    pub fn service_with_sentinel(&self) -> bool {
        let mut pending = self.shared.pending.lock();
        let serviced = self.shared.flush_pending(&mut pending);
        if serviced {
            self.shared.serviced.fetch_add(1, Ordering::AcqRel);
        }
        serviced
    }

    /// Stop accepting accesses. A caller blocked right now receives the sentinel.
    pub fn close(&self) {
        let mut pending = self.shared.pending.lock();
        if self.shared.open.swap(false, Ordering::AcqRel) {
            tracing::debug!("EFB bridge closed");
        }
        self.shared.flush_pending(&mut pending);
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn serviced_count(&self) -> u64 {
        self.shared.serviced.load(Ordering::Acquire)
    }
}

impl Drop for EfbBridgeReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a new EFB bridge pair (sender, receiver).
///
/// `waker` is poked after each request so an idle render thread notices it.
pub fn create_efb_bridge(waker: Option<RenderWaker>) -> (EfbBridgeSender, EfbBridgeReceiver) {
    let shared = Arc::new(EfbShared {
        gate: Mutex::new(()),
        pending: Mutex::new(PendingAccess::default()),
        requested: AtomicBool::new(false),
        open: AtomicBool::new(true),
        serviced: AtomicU64::new(0),
        waker,
    });

    let sender = EfbBridgeSender {
        shared: Arc::clone(&shared),
    };
    let receiver = EfbBridgeReceiver { shared };

    (sender, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn service_one(receiver: &EfbBridgeReceiver, value: u32) {
        while !receiver.is_access_requested() {
            thread::sleep(Duration::from_micros(50));
        }
        assert!(receiver.service(|_| value));
    }

    #[test]
    fn test_service_without_request() {
        let (_sender, receiver) = create_efb_bridge(None);
        assert!(!receiver.is_access_requested());
        assert!(!receiver.service(|_| 1));
        assert_eq!(receiver.serviced_count(), 0);
    }

    #[test]
    fn test_peek_round_trip() {
        let (sender, receiver) = create_efb_bridge(None);

        let cpu = thread::spawn(move || sender.access(EfbAccessRequest::peek_z(10, 20)));

        while !receiver.is_access_requested() {
            thread::sleep(Duration::from_micros(50));
        }
        let serviced = receiver.service(|request| {
            assert_eq!(request.kind, EfbAccessType::PeekZ);
            assert_eq!((request.x, request.y), (10, 20));
            0x00AB_CDEF
        });

        assert!(serviced);
        assert_eq!(cpu.join().unwrap(), 0x00AB_CDEF);
        assert!(!receiver.is_access_requested());
        assert_eq!(receiver.serviced_count(), 1);
    }

    #[test]
    fn test_close_releases_blocked_caller() {
        let (sender, receiver) = create_efb_bridge(None);

        let cpu = thread::spawn(move || sender.access(EfbAccessRequest::peek_z(1, 1)));
        while !receiver.is_access_requested() {
            thread::sleep(Duration::from_micros(50));
        }
        receiver.close();

        assert_eq!(cpu.join().unwrap(), EFB_ACCESS_SENTINEL);
    }

    #[test]
    fn test_access_after_close_returns_sentinel() {
        let (sender, receiver) = create_efb_bridge(None);
        drop(receiver);
        assert!(!sender.is_open());
        assert_eq!(sender.access(EfbAccessRequest::peek_color(0, 0)), EFB_ACCESS_SENTINEL);
    }

    #[test]
    fn test_sentinel_service() {
        let (sender, receiver) = create_efb_bridge(None);

        let cpu = thread::spawn(move || sender.access(EfbAccessRequest::poke_z(3, 4, 0x123456)));
        while !receiver.is_access_requested() {
            thread::sleep(Duration::from_micros(50));
        }
        assert!(receiver.service_with_sentinel());

        assert_eq!(cpu.join().unwrap(), EFB_ACCESS_SENTINEL);
        assert!(receiver.is_open());
    }

    #[test]
    fn test_sequential_accesses_are_serialized() {
        let (sender, receiver) = create_efb_bridge(None);
        let sender_b = sender.clone();

        let first = thread::spawn(move || sender.access(EfbAccessRequest::peek_z(0, 0)));
        service_one(&receiver, 1);
        assert_eq!(first.join().unwrap(), 1);

        let second = thread::spawn(move || sender_b.access(EfbAccessRequest::peek_z(0, 0)));
        service_one(&receiver, 2);
        assert_eq!(second.join().unwrap(), 2);

        assert_eq!(receiver.serviced_count(), 2);
    }

    #[test]
    fn test_access_type_is_write() {
        assert!(EfbAccessType::PokeZ.is_write());
        assert!(EfbAccessType::PokeColor.is_write());
        assert!(!EfbAccessType::PeekZ.is_write());
    }
}
