use std::fmt::Debug;
use std::time::Duration;

use anyhow::bail;

/// Flow control for bulk transfers. Devices differ in how much data they can absorb, so this is
///  a policy rather than a set of constants.
///
/// All methods have 'no flow control' defaults.
pub trait PacingPolicy: Debug + Send + Sync {
    /// Maximum number of uploaded bytes the device has not acknowledged yet. Uploads wait for
    ///  acknowledgements before exceeding it.
    fn upload_window(&self) -> Option<u64> {
        None
    }

    /// pause after each uploaded chunk
    fn chunk_interval(&self) -> Option<Duration> {
        None
    }

    /// Called after each downloaded chunk with the total number of bytes received so far and the
    ///  number of bytes acknowledged so far. Returns the new cumulative acknowledgement if one is
    ///  due.
    fn download_ack(&self, received_len: u64, acknowledged_len: u64) -> Option<u64> {
        let _ = (received_len, acknowledged_len);
        None
    }

    /// checked as part of [crate::config::LinkConfig::validate]
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Unpaced;
impl PacingPolicy for Unpaced {}

/// Sends upload chunks at a fixed rate, which is what devices without acknowledgement support
///  need. 100ms between chunks is a safe choice for a device that writes each chunk to flash.
#[derive(Clone, Copy, Debug)]
pub struct FixedInterval(pub Duration);
impl PacingPolicy for FixedInterval {
    fn chunk_interval(&self) -> Option<Duration> {
        Some(self.0)
    }
}

/// Window based flow control: uploads keep at most `window` unacknowledged bytes in flight, and
///  downloads acknowledge whenever half a window has arrived since the previous acknowledgement.
#[derive(Clone, Copy, Debug)]
pub struct AckWindow {
    pub window: u64,
}
impl PacingPolicy for AckWindow {
    fn upload_window(&self) -> Option<u64> {
        Some(self.window)
    }

    fn download_ack(&self, received_len: u64, acknowledged_len: u64) -> Option<u64> {
        if received_len.saturating_sub(acknowledged_len) >= (self.window / 2).max(1) {
            Some(received_len)
        }
        else {
            None
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            bail!("acknowledgement window must be positive");
        }
        Ok(())
    }
}
