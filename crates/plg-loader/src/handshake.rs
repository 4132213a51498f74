//! Loader/plugin event handshake
//!
//! Two words arbitrated through the kernel's address arbiter:
//!
//! - `event` (loader → plugin): `PLG_OK`, `PLG_ABOUT_TO_SWAP`, `PLG_ABOUT_TO_EXIT`
//! - `reply` (plugin → loader): `PLG_WAIT`, `PLG_OK`
//!
//! The plugin blocks on `event`; the loader blocks on `reply` with a bounded
//! timeout.

use core::sync::atomic::{AtomicI32, Ordering};

use plg_hal::{Hal, HalError};
use plg_ipc::handshake::{PLG_OK, PLG_WAIT};
use plg_kernel_core::Handle;

/// Outcome of waiting for the plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ack {
    Acknowledged,
    TimedOut,
}

pub struct Handshake {
    event: AtomicI32,
    reply: AtomicI32,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub const fn new() -> Self {
        Self {
            event: AtomicI32::new(PLG_OK),
            reply: AtomicI32::new(PLG_OK),
        }
    }

    pub fn event(&self) -> i32 {
        self.event.load(Ordering::Acquire)
    }

    pub fn reply(&self) -> i32 {
        self.reply.load(Ordering::Acquire)
    }

    /// Set the event word without waking anyone.
    pub fn set_event(&self, event: i32) {
        self.event.store(event, Ordering::Release);
    }

    /// Post `event` and wake the plugin.
    ///
    /// `reply` is armed to `PLG_WAIT` before the event becomes visible, so an
    /// acknowledgment can never be overwritten by the loader.
    pub fn notify<H: Hal + ?Sized>(&self, hal: &H, arbiter: Handle, event: i32) -> Result<(), HalError> {
        self.reply.store(PLG_WAIT, Ordering::Release);
        self.event.store(event, Ordering::Release);
        hal.arbiter_signal(arbiter, &self.event, -1)
    }

    /// Block until the plugin replies `PLG_OK` or `timeout_ns` elapses.
    pub fn wait_for_reply<H: Hal + ?Sized>(&self, hal: &H, arbiter: Handle, timeout_ns: u64) -> Result<Ack, HalError> {
        loop {
            if self.reply.load(Ordering::Acquire) >= PLG_OK {
                return Ok(Ack::Acknowledged);
            }
            match hal.arbiter_wait_if_less_than(arbiter, &self.reply, PLG_OK, timeout_ns) {
                Ok(()) => continue,
                Err(HalError::Timeout) => {
                    return Ok(if self.reply.load(Ordering::Acquire) >= PLG_OK {
                        Ack::Acknowledged
                    } else {
                        Ack::TimedOut
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    // === Plugin side ===

    /// Block until the loader posts an event other than `PLG_OK`.
    pub fn plugin_wait_event<H: Hal + ?Sized>(&self, hal: &H, arbiter: Handle, timeout_ns: u64) -> Result<i32, HalError> {
        loop {
            let event = self.event.load(Ordering::Acquire);
            if event != PLG_OK {
                return Ok(event);
            }
            // Events are all greater than PLG_OK; wait while the word is below 1.
            hal.arbiter_wait_if_less_than(arbiter, &self.event, PLG_OK + 1, timeout_ns)?;
        }
    }

    /// Acknowledge the current event.
    pub fn plugin_reply<H: Hal + ?Sized>(&self, hal: &H, arbiter: Handle) -> Result<(), HalError> {
        self.reply.store(PLG_OK, Ordering::Release);
        hal.arbiter_signal(arbiter, &self.reply, -1)
    }
}
