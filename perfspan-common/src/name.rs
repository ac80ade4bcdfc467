//! Span names and active-span keys

use crate::MAX_NAME_SIZE;

/// Fixed-width, zero-padded span name used as the name filter key
///
/// Compared byte-exact over the full width.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanName(pub [u8; MAX_NAME_SIZE]);

impl SpanName {
    /// All-zero name
    #[inline(always)]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0u8; MAX_NAME_SIZE])
    }

    /// Build a name from raw bytes, truncating to [`MAX_NAME_SIZE`]
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut name = Self::zeroed();
        let len = bytes.len().min(MAX_NAME_SIZE);
        name.0[..len].copy_from_slice(&bytes[..len]);
        name
    }

    /// Whether `bytes` would be cut by [`SpanName::from_bytes`]
    #[must_use]
    pub fn truncates(bytes: &[u8]) -> bool {
        bytes.len() > MAX_NAME_SIZE
    }

    /// Name bytes up to the first NUL
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_SIZE);
        &self.0[..end]
    }
}

impl Default for SpanName {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for SpanName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => write!(f, "SpanName({s:?})"),
            Err(_) => write!(f, "SpanName({:?})", self.as_bytes()),
        }
    }
}

/// Key of the active span table
///
/// Span ids are only unique within a process, and enter/exit of one span
/// activation happen on the same thread, so the full `tgid << 32 | tid` is kept.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanKey {
    pub process_id: u64,
    pub span_id: u64,
}
