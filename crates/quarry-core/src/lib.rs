#![deny(clippy::all, warnings)]

pub mod collector;
pub mod config;
pub mod error;
pub mod finder;
pub mod hashes;
pub mod preparer;
pub mod session;
pub mod transport;

pub use collector::{parse_json_page, JsonLinkCollector, LinkCollector};
pub use config::{Config, DEFAULT_INDEX_URL};
pub use error::UnpackError;
pub use finder::{BestMatch, PackageFinder, PackageFinderBuilder, ALL_NAMES};
pub use hashes::{validate_hashes, HashAlgorithm, HashCache, HashValidator};
pub use preparer::{unpack_archive, unpack_link, ArchiveUnpacker, Unpacker};
pub use session::{PyPISession, SessionOptions};
pub use transport::{Response, Transport, SIMPLE_JSON};
