pub const LOG_BYTES_IN_KBYTE: u8 = 10;
pub const BYTES_IN_KBYTE: u64 = 1 << LOG_BYTES_IN_KBYTE;

pub const LOG_BYTES_IN_MBYTE: u8 = 20;
pub const BYTES_IN_MBYTE: u64 = 1 << LOG_BYTES_IN_MBYTE;

/// Mark word at the start of every object
pub const BYTES_IN_MARK_WORD: u32 = 8;
pub const BYTES_IN_ARRAY_LENGTH: u32 = 4;

/// Arrays shorter than this are bucketed as small arrays
pub const ARRAY_SIZE_MAX_SMALL: u32 = 256;

/// Roots carried inline by a single ROOTS record
pub const MAX_ROOTS_PER_EVENT: usize = 3;

/// Sentinel for root payload fields the source format does not provide
pub const UNKNOWN_ID: u32 = u32::MAX;

pub const NATIVE_TRACE_MAGIC: [u8; 4] = *b"GCTR";
pub const NATIVE_SYMBOLS_MAGIC: [u8; 4] = *b"GCSY";
pub const NATIVE_FORMAT_VERSION: u8 = 1;

pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;
