// Remapd Output Layer
// Virtual device for publishing translated events

pub mod uinput;

pub use uinput::{UInputError, VirtualDevice};
