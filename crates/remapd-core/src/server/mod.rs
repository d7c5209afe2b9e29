// Remapd Server Layer
// Control socket toward the front-end and button debouncing

pub mod debounce;
pub mod port;

pub use debounce::ButtonDebouncer;
pub use port::{ClientMessage, ControlPort, PortError};
