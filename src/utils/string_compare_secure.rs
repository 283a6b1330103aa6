// Utility to compare secrets in constant time

/// Compares 2 byte strings, constant time
/// Ensures timing attacks are not viable
///
/// # Arguments
///
/// * `a` - First byte string
/// * `b` - Second byte string
///
/// # Return value
///
/// Returns true if the 2 byte strings are equal, false otherwise
pub fn bytes_compare_constant_time(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff: u8 = 0;

    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}

/// Compares 2 strings, constant time
pub fn string_compare_constant_time(a: &str, b: &str) -> bool {
    bytes_compare_constant_time(a.as_bytes(), b.as_bytes())
}

// Tests
