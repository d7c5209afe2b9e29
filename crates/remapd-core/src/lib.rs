// Remapd Core Library
// Translation stage, configuration and device plumbing for the daemon

pub mod config;
pub mod event;
pub mod input;
pub mod key;
pub mod matcher;
pub mod output;
pub mod server;
pub mod stage;

pub use config::{parse_config, Config, ConfigError};
pub use event::{
    duration_to_timeout, format_sequence, is_input_timeout_event, make_input_timeout_event,
    KeyEvent, KeySequence, KeyState,
};
pub use key::{key_from_name, Key};
pub use matcher::{MatchResult, NO_DEVICE};
pub use stage::Stage;
