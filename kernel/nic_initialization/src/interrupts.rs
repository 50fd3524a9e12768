//! Interrupt vector registration for NIC drivers.
//!
//! A driver does not install raw handler functions. It implements [`InterruptHandlers`],
//! one method per class of vector it owns, and registers each of its vectors with the
//! platform's [`InterruptController`], which calls back into the driver through a weak reference.

use alloc::sync::Weak;

/// What a device interrupt vector is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorClass {
    /// Transmit completions for the given queue.
    Transmit(u8),
    /// Receive completions for the given queue.
    Receive(u8),
    /// Device events such as link changes and queue errors.
    Event,
}

/// The interrupt-handling capability a driver exposes to the platform.
pub trait InterruptHandlers: Send + Sync {
    fn on_transmit_interrupt(&self, queue: u8);
    fn on_receive_interrupt(&self, queue: u8);
    fn on_event_interrupt(&self);
}

/// The platform's interrupt routing facility.
pub trait InterruptController: Send + Sync {
    /// Routes the device's interrupt `vector` to `handlers`, treating it as a `class` vector.
    fn register_vector(&self, vector: u8, class: VectorClass, handlers: Weak<dyn InterruptHandlers>) -> Result<(), &'static str>;
}

/// Invokes the handler method for `class`, if the driver still exists.
///
/// Returns `false` if the driver has already been dropped.
pub fn dispatch_interrupt(class: VectorClass, handlers: &Weak<dyn InterruptHandlers>) -> bool {
    let Some(handlers) = handlers.upgrade() else {
        warn!("nic_initialization: interrupt for {:?} arrived after its driver was dropped", class);
        return false;
    };
    match class {
        VectorClass::Transmit(queue) => handlers.on_transmit_interrupt(queue),
        VectorClass::Receive(queue) => handlers.on_receive_interrupt(queue),
        VectorClass::Event => handlers.on_event_interrupt(),
    }
    true
}
