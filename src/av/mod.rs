//! Program, stream and access unit types shared between the setup path and
//! the muxing stage.

mod packet;
mod stream;

pub use packet::*;
pub use stream::*;
