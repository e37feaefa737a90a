//! Custom assertions for cache tests.

/// Hex MD5 of `data`, the checksum format the memory store reports.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Assert that two byte slices are equal with helpful error messages.
///
/// On failure, shows sizes and first differing position rather than
/// dumping potentially huge byte arrays.
pub fn assert_bytes_equal(actual: &[u8], expected: &[u8], context: &str) {
    assert!(
        actual.len() == expected.len(),
        "{context}: size mismatch - expected {} bytes, got {} bytes",
        expected.len(),
        actual.len()
    );
    if let Some(i) = actual.iter().zip(expected).position(|(a, e)| a != e) {
        panic!(
            "{context}: content mismatch at byte {i} (block {}) - expected 0x{:02x}, got 0x{:02x}",
            i / crate::testing::BLOCK_SIZE,
            expected[i],
            actual[i]
        );
    }
}
