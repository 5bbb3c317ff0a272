/// Round `value` up to a multiple of `align`, which must be a power of two
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    (value + mask) & !mask
}

/// Object header size: mark word plus class pointer
pub fn object_header_size(word_size: u32) -> u32 {
    crate::constants::BYTES_IN_MARK_WORD + word_size
}

/// Array header size: object header plus the length field
pub fn array_header_size(word_size: u32) -> u32 {
    object_header_size(word_size) + crate::constants::BYTES_IN_ARRAY_LENGTH
}

pub fn human_bytes(bytes: u64) -> String {
    use crate::constants::{BYTES_IN_KBYTE, BYTES_IN_MBYTE};
    if bytes >= BYTES_IN_MBYTE {
        format!("{:.1}MB", bytes as f64 / BYTES_IN_MBYTE as f64)
    } else if bytes >= BYTES_IN_KBYTE {
        format!("{:.1}KB", bytes as f64 / BYTES_IN_KBYTE as f64)
    } else {
        format!("{}B", bytes)
    }
}
