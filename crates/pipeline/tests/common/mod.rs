pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{md5, seeded_bytes, test_upload_config, write_tree};
#[allow(unused_imports)]
pub use mocks::FlakyStore;
