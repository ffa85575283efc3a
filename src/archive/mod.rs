//! Archive ingestion: locate, fetch, validate, decode and present a project
//! archive as a file tree plus a path → content map.

pub mod decode;
pub mod loader;
pub mod locator;
pub mod transport;
pub mod tree;
pub mod validate;

pub use decode::{decode, decode_with_limits, DecodeLimits, DecodedArchive, FileContentMap};
pub use loader::{ArchiveLoader, LoadEvent, LoadPhase, LoadState, RetryState};
pub use locator::Locator;
pub use transport::{ArchivePayload, Strategy, TransportResolver};
pub use tree::{build_tree, FileTreeNode};
pub use validate::validate;
