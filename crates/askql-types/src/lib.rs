mod data;
mod provider;
mod query;
mod session;
mod step;
mod tool;

pub use data::*;
pub use provider::*;
pub use query::*;
pub use session::*;
pub use step::*;
pub use tool::*;
