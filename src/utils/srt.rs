/// UTF-8 byte order mark prepended to SRT downloads so desktop players pick
/// the right encoding.
pub const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
