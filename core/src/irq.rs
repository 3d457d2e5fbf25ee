//! Interrupt delivery seam between the SCSI controller and the machine's
//! interrupt controller.

/// Receiver for the controller's interrupt line.
///
/// `ack_int` is called on every 0→1 or 1→0 transition of the aggregate
/// interrupt condition, and only on transitions: downstream interrupt
/// controllers latch edges, so re-reporting an unchanged level would be
/// indistinguishable from a second interrupt.
pub trait InterruptSink {
    fn ack_int(&mut self, irq_id: u8, level: bool);
}

/// Sink for a chip that is not wired to an interrupt controller (yet)
#[derive(Debug, Default)]
pub struct NullInterruptSink;

impl InterruptSink for NullInterruptSink {
    fn ack_int(&mut self, _irq_id: u8, _level: bool) {}
}
