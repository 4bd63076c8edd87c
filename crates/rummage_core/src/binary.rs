//! Binary content detection.

/// Number of leading bytes to inspect for null bytes. Matches how git
/// classifies binary files; binary formats almost always have nulls in
/// their headers.
const BINARY_CHECK_BYTES: usize = 8000;

/// Magic prefixes of executable formats the engine can drop outright when
/// `force_skip_binaries` is set.
const EXECUTABLE_MAGIC: &[&[u8]] = &[
    b"\x7fELF",             // ELF
    b"MZ",                  // PE
    b"\xfe\xed\xfa\xce",    // Mach-O 32-bit
    b"\xfe\xed\xfa\xcf",    // Mach-O 64-bit
    b"\xcf\xfa\xed\xfe",    // Mach-O 64-bit little-endian
    b"\xca\xfe\xba\xbe",    // Mach-O universal / Java class
];

/// Returns `true` if the first [`BINARY_CHECK_BYTES`] contain a null byte.
#[must_use]
pub fn is_binary(bytes: &[u8]) -> bool {
    let check_len = bytes.len().min(BINARY_CHECK_BYTES);
    bytes[..check_len].contains(&0)
}

/// Returns `true` if the content starts with a known executable format
/// header.
#[must_use]
pub fn is_executable(bytes: &[u8]) -> bool {
    EXECUTABLE_MAGIC.iter().any(|magic| bytes.starts_with(magic))
}
