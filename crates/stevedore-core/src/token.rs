//! Random token generation for auth keys, generated secrets and instance ids.

use rand::RngCore;

/// Returns `bytes` random bytes as a lowercase hex string (`2 * bytes`
/// characters).
pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
