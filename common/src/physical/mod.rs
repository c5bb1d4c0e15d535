mod percentage;
mod scaled;

pub use percentage::*;
pub use scaled::*;
