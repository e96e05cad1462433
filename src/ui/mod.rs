pub mod progress;
pub mod prompt;


pub use progress::{format_duration, human_bytes, ConsoleSink};
pub use prompt::{confirmation_message, TerminalConfirmer};
