/// Port servers listen on for client connections; server `i` uses `DEFAULT_CLIENT_PORT + i`.
pub const DEFAULT_CLIENT_PORT: u16 = 9495;

/// Port servers listen on for the server mesh; server `i` uses `DEFAULT_SERVER_PORT + i`.
pub const DEFAULT_SERVER_PORT: u16 = 6566;

/// Size of the block a keystream refills at once.
pub const DEFAULT_KEYSTREAM_BLOCK_SIZE: usize = 1024;

/// Bytes of big-endian payload length at the head of every slot.
pub const LENGTH_BYTES: usize = 4;

/// Bytes of zero-extended CRC32 following the length.
pub const CHECKSUM_BYTES: usize = 8;

/// Total slot header; payload starts at this offset.
pub const METADATA_BYTES: usize = LENGTH_BYTES + CHECKSUM_BYTES;

/// Default slot length, header included.
pub const DEFAULT_SLOT_LENGTH: usize = 512;

pub const DEFAULT_ELEMENTS_PER_ROUND: usize = 32;
pub const DEFAULT_FPR: f64 = 0.05;
pub const DEFAULT_ATTEMPTS_PER_SLOT: usize = 8;

/// How often (in slots) the coordinator reports progress.
pub const PROGRESS_INTERVAL: usize = 10;

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 50;
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 100;

/// Clients a deployment supports: a client id fills the low 16 bits of every shared secret.
pub const MAX_CLIENTS: usize = 1 << 16;
