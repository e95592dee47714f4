pub mod cts256;
pub mod sp0256;

pub use cts256::CtsBoard;
pub use sp0256::{RomPages, Sp0256};
