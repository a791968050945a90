pub mod cfg;
pub mod crypto;
pub mod db;
pub mod encoding;
pub mod error;
pub mod group;
pub mod machine;
pub mod quorum;
pub mod retry;
pub mod rpc;
