//! Core types for the flipper-video GX backend
//!
//! This crate provides configuration, error handling, logging setup, the
//! host contract and the two bridges between the CPU emulation thread and
//! the render thread.

pub mod config;
pub mod efb_bridge;
pub mod error;
pub mod gpu_bridge;
pub mod host;
pub mod logging;

pub use config::Config;
pub use efb_bridge::{
    create_efb_bridge, EfbAccessPort, EfbAccessRequest, EfbAccessType, EfbBridgeReceiver,
    EfbBridgeSender, EFB_ACCESS_SENTINEL,
};
pub use error::{Result, StoreError, VideoError};
pub use gpu_bridge::{
    create_gpu_bridge, BridgeMessage, GpuBridgeReceiver, GpuBridgeSender, RenderWaker, XfbSwap,
};
pub use host::{HostCallbacks, TracingHost};
