//! Shared protocol constants for the filesync wire protocol

// Frame layout: u32 big-endian body length, then a UTF-8 JSON body.
pub const LEN_PREFIX: usize = 4;

// Maximum frame body size (256MB) - a MAKECACHE answer carries a whole tree
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

// Message type IDs (numeric values are part of the wire format)
pub mod msg {
    pub const TOKEN: u32 = 0;
    pub const MAKECACHE: u32 = 1;
    pub const SYNC: u32 = 2;
    pub const FILEPART: u32 = 3;

    pub fn name(t: u32) -> &'static str {
        match t {
            TOKEN => "TOKEN",
            MAKECACHE => "MAKECACHE",
            SYNC => "SYNC",
            FILEPART => "FILEPART",
            _ => "UNKNOWN",
        }
    }
}

// Result codes
pub mod res {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
}

// Machine-readable error codes carried next to the human-readable message
pub mod err_code {
    pub const NO_DST_DIR: &str = "NO_DST_DIR";
    pub const NO_SYNC_INFO: &str = "NO_SYNC_INFO";
    pub const OPEN_FAILED: &str = "OPEN_FAILED";
    pub const WRITE_FAILED: &str = "WRITE_FAILED";
}

pub mod timeouts {
    use std::time::Duration;

    // The first (TOKEN) command must arrive within this window
    pub const AUTH_READ: Duration = Duration::from_secs(10);

    // Client-side dial timeout
    pub const CONNECT: Duration = Duration::from_secs(10);
}
