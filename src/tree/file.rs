use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use tracing::debug;

use crate::config::TreeConfig;
use crate::error::{Error, Result};
use crate::tree::node::{Node, NO_NODE};

/// Fixed header record size; node block `i` starts at `HEADER_SIZE + i * block_size`.
pub const HEADER_SIZE: usize = 64;

/// ASCII "HST1"
const MAGIC: u32 = 0x48_53_54_31;

/// Gates on-disk layout changes.
pub const FORMAT_VERSION: u16 = 1;

/// Serialized header fields covered by the trailing checksum.
const CHECKSUMMED_LEN: usize = 48;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub format_version: u16,
    pub provider_version: u32,
    pub block_size: u32,
    pub max_children: u16,
    pub node_count: u32,
    pub root_seq: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub file_size: u64,
}

impl Header {
    fn new(config: &TreeConfig) -> Self {
        Header {
            format_version: FORMAT_VERSION,
            provider_version: config.provider_version,
            block_size: config.block_size,
            max_children: config.max_children,
            node_count: 0,
            root_seq: NO_NODE,
            start_time: config.start_time,
            end_time: config.start_time,
            file_size: HEADER_SIZE as u64,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u32::<BigEndian>(MAGIC)
            .map_err(|e| Error::Encode("magic", e))?;
        buf.write_u16::<BigEndian>(self.format_version)
            .map_err(|e| Error::Encode("format version", e))?;
        buf.write_u32::<BigEndian>(self.provider_version)
            .map_err(|e| Error::Encode("provider version", e))?;
        buf.write_u32::<BigEndian>(self.block_size)
            .map_err(|e| Error::Encode("block size", e))?;
        buf.write_u16::<BigEndian>(self.max_children)
            .map_err(|e| Error::Encode("max children", e))?;
        buf.write_u32::<BigEndian>(self.node_count)
            .map_err(|e| Error::Encode("node count", e))?;
        buf.write_u32::<BigEndian>(self.root_seq)
            .map_err(|e| Error::Encode("root seq", e))?;
        buf.write_i64::<BigEndian>(self.start_time)
            .map_err(|e| Error::Encode("start time", e))?;
        buf.write_i64::<BigEndian>(self.end_time)
            .map_err(|e| Error::Encode("end time", e))?;
        buf.write_u64::<BigEndian>(self.file_size)
            .map_err(|e| Error::Encode("file size", e))?;

        let checksum = CRC32.checksum(&buf[..CHECKSUMMED_LEN]);
        buf.write_u32::<BigEndian>(checksum)
            .map_err(|e| Error::Encode("checksum", e))?;
        buf.resize(HEADER_SIZE, 0);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidHeader("header truncated"));
        }

        let mut reader = &buf[..];
        let magic = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("magic", e))?;
        if magic != MAGIC {
            return Err(Error::InvalidHeader("magic number"));
        }
        let format_version = reader
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("format version", e))?;
        if format_version != FORMAT_VERSION {
            return Err(Error::InvalidHeader("unsupported format version"));
        }
        let provider_version = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("provider version", e))?;
        let block_size = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("block size", e))?;
        let max_children = reader
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("max children", e))?;
        let node_count = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("node count", e))?;
        let root_seq = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("root seq", e))?;
        let start_time = reader
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("start time", e))?;
        let end_time = reader
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("end time", e))?;
        let file_size = reader
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("file size", e))?;
        let stored_checksum = reader
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("checksum", e))?;

        let computed = CRC32.checksum(&buf[..CHECKSUMMED_LEN]);
        if stored_checksum != computed {
            return Err(Error::InvalidHeader("checksum mismatch"));
        }
        if block_size == 0 {
            return Err(Error::InvalidHeader("zero block size"));
        }

        Ok(Header {
            format_version,
            provider_version,
            block_size,
            max_children,
            node_count,
            root_seq,
            start_time,
            end_time,
            file_size,
        })
    }
}

/// The persisted byte layout: one fixed header plus `node_count` fixed-size
/// node blocks. Supports append during build and random access during query.
#[derive(Debug)]
pub struct TreeFile {
    file: File,
    header: Header,
    path: PathBuf,
}

impl TreeFile {
    /// Creates a fresh tree file, truncating any previous one, and writes a
    /// provisional header. The header is rewritten at close.
    pub fn create(path: &Path, config: &TreeConfig) -> Result<Self> {
        let mut file = File::options()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;

        let header = Header::new(config);
        file.write_all(&header.encode()?)?;
        debug!(path = %path.display(), block_size = config.block_size, "created tree file");

        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing tree file read-only and validates its header.
    /// Corrupt or truncated files fail closed; the caller is expected to
    /// discard the file and rebuild from source data.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buf)
            .map_err(|e| Error::Decode("header", e))?;
        let header = Header::decode(&buf)?;

        if header.root_seq == NO_NODE && header.node_count > 0 {
            return Err(Error::Corrupted(
                "header has nodes but no root".to_string(),
            ));
        }
        if header.root_seq != NO_NODE && header.root_seq >= header.node_count {
            return Err(Error::Corrupted(format!(
                "root seq {} out of range for {} nodes",
                header.root_seq, header.node_count
            )));
        }
        let expected_size =
            HEADER_SIZE as u64 + header.node_count as u64 * header.block_size as u64;
        let actual_size = file.metadata()?.len();
        if actual_size < expected_size || header.file_size != expected_size {
            return Err(Error::Corrupted(format!(
                "expected {} bytes for {} nodes, file has {}",
                expected_size, header.node_count, actual_size
            )));
        }

        debug!(path = %path.display(), nodes = header.node_count, "opened tree file");
        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn block_offset(&self, seq: u32) -> u64 {
        HEADER_SIZE as u64 + seq as u64 * self.header.block_size as u64
    }

    /// Reads and decodes the block at `seq`. The stored sequence number must
    /// match the block position.
    pub fn read_node(&self, seq: u32) -> Result<Node> {
        let mut block = vec![0u8; self.header.block_size as usize];
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(self.block_offset(seq)))?;
        reader
            .read_exact(&mut block)
            .map_err(|e| Error::Decode("node block", e))?;

        let node = Node::deserialize(&block)?;
        if node.seq() != seq {
            return Err(Error::Corrupted(format!(
                "block {} holds node {}",
                seq,
                node.seq()
            )));
        }
        Ok(node)
    }

    /// Writes a sealed node at the offset derived from its sequence number.
    pub fn write_node(&mut self, node: &Node) -> Result<()> {
        let block = node.serialize(self.header.block_size)?;
        self.file.seek(SeekFrom::Start(self.block_offset(node.seq())))?;
        self.file.write_all(&block)?;
        Ok(())
    }

    /// Writes the final header and flushes everything durably. After this
    /// the file is complete and read-only.
    pub fn finish(&mut self, root_seq: u32, node_count: u32, end_time: i64) -> Result<()> {
        self.header.root_seq = root_seq;
        self.header.node_count = node_count;
        self.header.end_time = end_time;
        self.header.file_size =
            HEADER_SIZE as u64 + node_count as u64 * self.header.block_size as u64;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.header.encode()?)?;
        self.file.sync_all()?;
        debug!(path = %self.path.display(), nodes = node_count, "finished tree file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::interval::{Interval, StateValue};
    use crate::tree::node::NodeKind;

    fn config() -> TreeConfig {
        TreeConfig::new(2, 0).block_size(1024).max_children(8)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = Header {
            format_version: FORMAT_VERSION,
            provider_version: 9,
            block_size: 4096,
            max_children: 50,
            node_count: 17,
            root_seq: 16,
            start_time: -5,
            end_time: 1_000_000,
            file_size: 64 + 17 * 4096,
        };
        let encoded = header.encode().expect("encode failed");
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = Header::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let header = Header::new(&config());
        let mut encoded = header.encode().expect("encode failed");
        encoded[0] = b'X';
        match Header::decode(&encoded) {
            Err(Error::InvalidHeader("magic number")) => {}
            other => panic!("Expected magic rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_header_rejects_corruption() {
        let header = Header::new(&config());
        let mut encoded = header.encode().expect("encode failed");
        // Flip a bit inside the checksummed region.
        encoded[20] ^= 0x01;
        match Header::decode(&encoded) {
            Err(Error::InvalidHeader("checksum mismatch")) => {}
            other => panic!("Expected checksum rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_write_and_read_node() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut tree_file = TreeFile::create(tmp.path(), &config()).expect("create failed");

        let mut node = Node::new(NodeKind::Leaf, 0, NO_NODE, 0);
        let interval =
            Interval::new(1, 0, 10, StateValue::Str("state".to_string())).expect("valid interval");
        assert!(node.try_add(&interval, 1024, 8));

        tree_file.write_node(&node).expect("write failed");
        tree_file.finish(0, 1, 10).expect("finish failed");

        let read_back = tree_file.read_node(0).expect("read failed");
        assert_eq!(read_back, node);
    }

    #[test]
    fn test_reopen_validates_sequence_numbers() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut tree_file = TreeFile::create(tmp.path(), &config()).expect("create failed");

        // Write a node whose stored seq disagrees with its position.
        let node = Node::new(NodeKind::Leaf, 3, NO_NODE, 0);
        let block = node.serialize(1024).expect("serialize failed");
        tree_file.file.seek(SeekFrom::Start(HEADER_SIZE as u64)).expect("seek");
        tree_file.file.write_all(&block).expect("write");
        tree_file.finish(0, 1, 0).expect("finish failed");

        let reopened = TreeFile::open(tmp.path()).expect("open failed");
        match reopened.read_node(0) {
            Err(Error::Corrupted(_)) => {}
            other => panic!("Expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let tmp = NamedTempFile::new().expect("temp file");
        let mut tree_file = TreeFile::create(tmp.path(), &config()).expect("create failed");
        let mut node = Node::new(NodeKind::Leaf, 0, NO_NODE, 0);
        assert!(node.try_add(
            &Interval::new(1, 0, 1, StateValue::Null).expect("valid interval"),
            1024,
            8
        ));
        tree_file.write_node(&node).expect("write failed");
        tree_file.finish(0, 1, 1).expect("finish failed");
        drop(tree_file);

        // Chop off the tail of the single node block.
        let full = std::fs::read(tmp.path()).expect("read file");
        std::fs::write(tmp.path(), &full[..full.len() - 100]).expect("write file");

        match TreeFile::open(tmp.path()) {
            Err(Error::Corrupted(_)) => {}
            other => panic!("Expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_open_rejects_garbage() {
        let tmp = NamedTempFile::new().expect("temp file");
        std::fs::write(tmp.path(), vec![0xab; 256]).expect("write file");
        assert!(TreeFile::open(tmp.path()).is_err());
    }
}
