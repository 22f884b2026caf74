//! Core → host event link.
//!
//! The original observer web (VIC → host, CIA → VIC, drive → UI) is
//! flattened into one event enum pushed over a `crossbeam_channel`.  The
//! sender is optional: a core without a connected host simply drops
//! events.  Senders use `try_send` so a stalled host can never block the
//! emulation; overflow drops the oldest data the host didn't want anyway.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// Everything the core tells the host about.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A new frame is ready in the VIC's published buffer.
    FrameReady { frame: u64 },
    /// The border color changed; carries the new 0xAARRGGBB value.
    BorderColor(u32),
    /// A block of little-endian signed 16-bit mono PCM.
    AudioBlock(Vec<u8>),
    /// Drive motor / LED state, for a drive-activity indicator.
    DriveActivity { motor: bool, led: bool },
    /// A mounted image was written to and is being detached.
    DiskModified { label: String },
    /// A fatal emulation fault; the machine has stopped.
    Fault(String),
}

/// Event outlet owned by the core.  Cloneable so each chip can hold one.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<HostEvent>>,
}

impl EventSink {
    /// A sink that drops everything (headless / test operation).
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Create a connected sink plus the host-side receiver.
    pub fn channel(capacity: usize) -> (Self, Receiver<HostEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn is_connected(&self) -> bool {
        self.tx.is_some()
    }

    /// Best-effort send.  Never blocks; a full channel drops the event.
    pub fn emit(&self, ev: HostEvent) {
        if let Some(ref tx) = self.tx {
            match tx.try_send(ev) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }
}
