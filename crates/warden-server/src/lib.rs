pub mod dispatch;
pub mod handler;
pub mod queue;
pub mod server;

pub use dispatch::{Dispatcher, Handler};
pub use handler::FlightHandler;
pub use queue::{channel, Command, CommandReceiver, CommandSender, QueueError};
pub use server::{CommandServer, ServerConfig, ServerError};
