use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::transfer::pacing::{PacingPolicy, Unpaced};
use crate::transfer::resource::{FrameScriptAddressing, TransferAddressing};

/// What to do when an operation needs a slot (the single pending request, or the single active
///  transfer) that is currently occupied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BusyPolicy {
    /// wait in FIFO order until the slot becomes free
    Queue,
    /// fail immediately with [crate::error::LinkError::Busy]
    Reject,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReconnectPolicy {
    /// A lost link stays lost; operations fail with a connection error until the application
    ///  connects again explicitly.
    Fail,
    /// Connection attempts (including the implicit reconnect when a lost link is used again) are
    ///  retried with exponential backoff.
    Retry {
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// used for calls that do not specify a timeout, and for transfer initiation
    pub default_timeout: Duration,

    /// Upper bound for a single reassembled message. Fragments exceeding it are discarded with a
    ///  protocol error, protecting the host against a device that never sends a 'last' fragment.
    pub max_message_len: usize,

    /// Upper bound for the total size of a download. A larger announced size fails the download
    ///  before any data is received.
    pub max_transfer_len: u64,

    pub request_busy_policy: BusyPolicy,
    pub transfer_busy_policy: BusyPolicy,

    /// A script sent with [crate::link::Link::fire_and_forget] may still answer. The request slot
    ///  stays occupied until the answer arrives or this window passes, so the answer is not taken
    ///  for the response to the next request. Zero releases the slot right after sending, for
    ///  devices that never answer such requests.
    pub fire_and_forget_reply_window: Duration,

    /// A transfer without progress for this long fails with a timeout.
    pub transfer_idle_timeout: Duration,

    pub pacing: Arc<dyn PacingPolicy>,
    pub addressing: Arc<dyn TransferAddressing>,

    /// Payload bytes per stream message when uploading. `None` fills a single fragment.
    pub upload_chunk_len: Option<usize>,

    pub reconnect: ReconnectPolicy,

    /// Plain text notifications without a fragment header are what the device's script engine
    ///  emits for `print()`. If set, they are routed as log lines, otherwise dropped as protocol
    ///  errors.
    pub accept_untagged_prints: bool,

    /// Sends a break signal right after connecting, stopping whatever script the device is
    ///  running so it is ready to accept requests.
    pub break_on_connect: bool,
}

impl LinkConfig {
    /// smallest link write length that leaves room for a header and a stream opcode
    pub const MIN_FRAGMENT_LEN: usize = 8;

    pub fn new() -> LinkConfig {
        LinkConfig {
            default_timeout: Duration::from_secs(10),
            max_message_len: 10 * 1024 * 1024,
            max_transfer_len: 64 * 1024 * 1024,
            request_busy_policy: BusyPolicy::Queue,
            transfer_busy_policy: BusyPolicy::Queue,
            fire_and_forget_reply_window: Duration::from_millis(500),
            transfer_idle_timeout: Duration::from_secs(10),
            pacing: Arc::new(Unpaced),
            addressing: Arc::new(FrameScriptAddressing),
            upload_chunk_len: None,
            reconnect: ReconnectPolicy::Fail,
            accept_untagged_prints: true,
            break_on_connect: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_timeout.is_zero() {
            bail!("default timeout must be positive");
        }
        if self.transfer_idle_timeout.is_zero() {
            bail!("transfer idle timeout must be positive");
        }
        if self.max_message_len == 0 {
            bail!("maximum message length must be positive");
        }
        if self.max_transfer_len == 0 {
            bail!("maximum transfer length must be positive");
        }
        if self.upload_chunk_len == Some(0) {
            bail!("upload chunk length must be positive");
        }
        self.pacing.validate()?;
        if let ReconnectPolicy::Retry { max_attempts, initial_delay, max_delay } = self.reconnect {
            if max_attempts == 0 {
                bail!("reconnect policy needs at least one attempt");
            }
            if initial_delay > max_delay {
                bail!("initial reconnect delay {:?} exceeds the maximum delay {:?}", initial_delay, max_delay);
            }
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LinkConfig::new().validate().is_ok());
    }

    #[rstest]
    #[case::zero_timeout(|c: &mut LinkConfig| c.default_timeout = Duration::ZERO)]
    #[case::zero_idle_timeout(|c: &mut LinkConfig| c.transfer_idle_timeout = Duration::ZERO)]
    #[case::zero_message_len(|c: &mut LinkConfig| c.max_message_len = 0)]
    #[case::zero_transfer_len(|c: &mut LinkConfig| c.max_transfer_len = 0)]
    #[case::zero_chunk_len(|c: &mut LinkConfig| c.upload_chunk_len = Some(0))]
    #[case::empty_ack_window(|c: &mut LinkConfig| c.pacing = Arc::new(crate::transfer::pacing::AckWindow { window: 0 }))]
    #[case::no_attempts(|c: &mut LinkConfig| c.reconnect = ReconnectPolicy::Retry { max_attempts: 0, initial_delay: Duration::from_millis(10), max_delay: Duration::from_secs(1) })]
    #[case::delays_inverted(|c: &mut LinkConfig| c.reconnect = ReconnectPolicy::Retry { max_attempts: 3, initial_delay: Duration::from_secs(2), max_delay: Duration::from_secs(1) })]
    fn test_validate_invalid(#[case] modify: fn(&mut LinkConfig)) {
        let mut config = LinkConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
