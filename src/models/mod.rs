mod client_key;
mod license;
mod rules;
mod sync;

pub use client_key::*;
pub use license::*;
pub use rules::*;
pub use sync::*;
