//! Remote control front-ends over the connection manager

mod console;
mod controller;
mod oneshot;

pub use console::{run_console, HELP};
pub use controller::RemoteController;
pub use oneshot::{send_once, OneShot};
