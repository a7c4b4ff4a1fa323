pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{md5, md5_hex, seeded_bytes};
