use std::fmt;

/// CRC32C (Castagnoli) checksum, the algorithm Cloud Storage reports
/// for every object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Crc32c(pub u32);

impl Crc32c {
    /// Computes the checksum of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(crc32c::crc32c(data))
    }

    /// Returns the raw checksum value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Big-endian encoding, as transmitted by Cloud Storage.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Decodes a big-endian checksum. Returns `None` unless exactly 4 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 4] = bytes.try_into().ok()?;
        Some(Self(u32::from_be_bytes(arr)))
    }
}

impl fmt::Display for Crc32c {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Incremental CRC32C over a byte stream.
#[derive(Debug, Clone, Default)]
pub struct Crc32cHasher {
    state: u32,
    len: u64,
}

impl Crc32cHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `data` into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
        self.len += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the checksum of everything fed so far.
    pub fn finalize(&self) -> Crc32c {
        Crc32c(self.state)
    }
}
