// subzone-common — shared plumbing for the zone server and tools:
// tick arithmetic, CRC-32 helpers, wire buffers, conf documents, and the
// level-file model.

pub mod conf;
pub mod crc;
pub mod lvl;
pub mod sizebuf;
pub mod tick;
