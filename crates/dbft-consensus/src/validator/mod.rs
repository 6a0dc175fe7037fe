mod selection;
mod set;

pub use selection::{PrimarySelector, Role};
pub use set::ValidatorSet;
