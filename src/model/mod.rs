//! Core data model types for chkmap

mod chk_key;
mod key;

pub use chk_key::{ChkKey, CHK_PREFIX};
pub use key::Key;
