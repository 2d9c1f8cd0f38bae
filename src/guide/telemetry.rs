use crossbeam_channel::{Receiver, Sender, bounded};

/// One control cycle as seen by plotting/monitoring consumers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryFrame {
    pub cycle: u64,
    pub phase: Vec<f64>,
    pub scales: Vec<f64>,
    pub robot_position: Vec<f64>,
    pub vm_positions: Vec<Vec<f64>>,
}

/// Fire-and-forget publish target. Implementations must never block the control cycle.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, frame: TelemetryFrame);

    /// Frames are only assembled when this returns true.
    fn enabled(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _frame: TelemetryFrame) {}

    fn enabled(&self) -> bool {
        false
    }
}

/// Bounded channel sink; frames are dropped when the consumer lags.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<TelemetryFrame>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<TelemetryFrame>) {
        let (tx, rx) = bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl TelemetrySink for ChannelSink {
    fn publish(&self, frame: TelemetryFrame) {
        let _ = self.tx.try_send(frame);
    }
}
