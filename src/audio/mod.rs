pub mod commands;
pub mod config;
pub mod error;
pub mod external;
pub mod local;
pub mod player;
pub mod progress;
pub mod state;
pub mod track;
pub mod traits;
