//! CLI commands module.

mod check;
mod publish;
mod serve;
mod subscribe;
mod util;

pub use check::CheckCommand;
pub use publish::PubCommand;
pub use serve::ServeCommand;
pub use subscribe::SubCommand;

pub(crate) use util::*;
