//! Proof-of-work targets, chain work and difficulty retargeting.

pub mod difficulty;
pub mod validation;

pub use difficulty::{block_proof, get_next_work_required, HeaderInfo};
pub use validation::{validate_pow_header, PowError};
