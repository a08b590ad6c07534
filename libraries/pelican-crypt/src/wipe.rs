use std::hint::black_box;
use std::sync::atomic::{Ordering, compiler_fence};

/// Overwrite a buffer before its memory is released: zeros, then random
/// bytes, then zeros again, with a compiler fence after each pass so none of
/// them is elided.
pub fn wipe(buf: &mut [u8]) {
    use rand::RngCore;
    buf.fill(0);
    compiler_fence(Ordering::SeqCst);
    black_box(&mut *buf);
    rand::thread_rng().fill_bytes(buf);
    compiler_fence(Ordering::SeqCst);
    black_box(&mut *buf);
    buf.fill(0);
    compiler_fence(Ordering::SeqCst);
    black_box(&mut *buf);
}

#[cfg(test)]
mod tests {
    use super::wipe;

    #[test]
    fn buffer_is_zero_after_wipe() {
        let mut buf = *b"master key material.............";
        wipe(&mut buf);
        assert_eq!(buf, [0u8; 32]);
    }
}
