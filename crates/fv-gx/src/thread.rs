//! Render thread (dual-core mode)
//!
//! Owns the video core and with it the graphics context. Drains the GPU
//! bridge, executes commands and swaps, and services EFB requests between
//! command chunks.

use crate::backend::GraphicsBackend;
use crate::video_core::VideoCore;
use crossbeam::channel;
use fv_core::{
    BridgeMessage, Config, EfbBridgeReceiver, GpuBridgeReceiver, HostCallbacks, RenderWaker,
    Result, VideoError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long the idle loop sleeps before re-checking for work
const IDLE_WAIT: Duration = Duration::from_millis(5);

/// Render thread state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderThreadState {
    Running,
    Stopped,
}

/// What the render thread did over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub commands: u64,
    pub frames: u64,
    pub draws: u64,
    pub efb_accesses: u64,
    pub device_resets: u64,
}

struct RenderLoop<B: GraphicsBackend> {
    core: VideoCore<B>,
    gpu: GpuBridgeReceiver,
    efb: EfbBridgeReceiver,
    running: Arc<AtomicBool>,
    summary: RenderSummary,
    /// Device resets already accounted for at EFB safe points
    seen_resets: u64,
}

impl<B: GraphicsBackend> RenderLoop<B> {
    fn run(mut self) -> RenderSummary {
        self.gpu.connect();
        tracing::info!("Render thread running");

        'run: while self.running.load(Ordering::Acquire) {
            self.gpu.wait_for_work(IDLE_WAIT);
            self.service_efb();

            for message in self.gpu.drain() {
                // Nothing may draw on a lost device, not even later in a batch
                if !self.recover_device() {
                    break 'run;
                }
                match message {
                    BridgeMessage::Commands(data) => {
                        self.summary.commands += self.core.run_commands(&data) as u64;
                        // Safe point between chunks
                        self.service_efb();
                    }
                    BridgeMessage::Swap(swap) => {
                        if self.core.update_xfb(swap) {
                            self.summary.frames += 1;
                        }
                        self.gpu.signal_swap_complete();
                    }
                    BridgeMessage::Finish => {
                        self.gpu.signal_finish_complete();
                    }
                }
            }
            if !self.recover_device() {
                break;
            }
        }

        self.summary.draws = self.core.draw_count();
        self.summary.device_resets = self.core.device_reset_count();
        self.gpu.disconnect();
        self.efb.close();
        self.core.shutdown();
        tracing::info!("Render thread stopped");
        self.summary
    }

    fn service_efb(&mut self) {
        let resets = self.core.device_reset_count();
        if resets != self.seen_resets {
            // The core recovered mid-batch; a waiting access saw the old device go
            self.seen_resets = resets;
            if self.efb.service_with_sentinel() {
                self.summary.efb_accesses += 1;
            }
            return;
        }
        if self.core.service_efb(&self.efb) {
            self.summary.efb_accesses += 1;
        }
    }

    /// Returns false when the device is gone for good
    fn recover_device(&mut self) -> bool {
        if !self.core.backend().is_device_lost() {
            return true;
        }
        // Nothing can be read from a lost device
        if self.efb.service_with_sentinel() {
            self.summary.efb_accesses += 1;
        }
        match self.core.handle_device_loss() {
            Ok(_) => {
                self.seen_resets = self.core.device_reset_count();
                true
            }
            Err(e) => {
                tracing::error!("Render thread giving up: {}", e);
                false
            }
        }
    }
}

/// Handle to a running render thread
pub struct RenderThread {
    handle: Option<JoinHandle<RenderSummary>>,
    running: Arc<AtomicBool>,
    waker: RenderWaker,
}

impl RenderThread {
    /// Start the render thread and initialize the video core on it.
    ///
    /// The backend is created on the new thread by `make_backend`, so the
    /// context belongs to that thread. Returns the startup error if the
    /// core could not be initialized.
    pub fn spawn<B, F>(
        config: Config,
        host: Arc<dyn HostCallbacks>,
        make_backend: F,
        gpu: GpuBridgeReceiver,
        efb: EfbBridgeReceiver,
    ) -> Result<Self>
    where
        B: GraphicsBackend + 'static,
        F: FnOnce() -> B + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let waker = gpu.waker();
        let (started_tx, started_rx) = channel::bounded::<Result<()>>(1);

        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("gx-render".to_string())
            .spawn(move || {
                let mut core = VideoCore::new(config, make_backend(), host);
                if let Err(e) = core.init() {
                    efb.close();
                    let _ = started_tx.send(Err(e));
                    return RenderSummary::default();
                }
                let _ = started_tx.send(Ok(()));

                RenderLoop {
                    core,
                    gpu,
                    efb,
                    running: thread_running,
                    summary: RenderSummary::default(),
                    seen_resets: 0,
                }
                .run()
            })?;

        let started = started_rx.recv().unwrap_or(Err(VideoError::ThreadPanicked));
        if let Err(e) = started {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Self {
            handle: Some(handle),
            running,
            waker,
        })
    }

    pub fn state(&self) -> RenderThreadState {
        if self.handle.as_ref().is_some_and(|h| !h.is_finished()) {
            RenderThreadState::Running
        } else {
            RenderThreadState::Stopped
        }
    }

    /// Stop the loop, shut the core down and wait for the thread
    pub fn stop(mut self) -> Result<RenderSummary> {
        self.join()
    }

    fn join(&mut self) -> Result<RenderSummary> {
        self.running.store(false, Ordering::Release);
        self.waker.wake();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| VideoError::ThreadPanicked),
            None => Ok(RenderSummary::default()),
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.join() {
                tracing::error!("Render thread: {}", e);
            }
        }
    }
}
