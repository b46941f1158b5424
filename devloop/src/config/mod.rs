mod devloop_toml;
mod error;
mod merged;

pub use devloop_toml::*;
pub use error::*;
pub use merged::*;
