pub mod codec;
pub(crate) mod format;
mod index;
pub mod path;
mod reader;
pub mod storage;
mod writer;

pub use codec::Digest;
pub use format::{
    ArchiveHeader, ChecksumAlgorithm, CompressionMethod, FLAG_CASE_INSENSITIVE,
    FORMAT_VERSION_MAJOR, FORMAT_VERSION_MINOR, HEADER_SIZE, MAGIC_NUMBER, MAX_PATH_LENGTH,
};
pub use index::{ContainerIndex, EntryDescriptor, ReplacePolicy, INDEX_RECORD_SIGNATURE};
pub use reader::{ArchiveReader, EntryStream, STREAM_CHUNK_SIZE};
pub use storage::ReadAt;
pub use writer::{ArchiveWriter, BuildState, CommitResult};
