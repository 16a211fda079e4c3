//! Wraparound-safe arithmetic for 32-bit sequence numbers and millisecond clocks.

/// Signed distance from `earlier` to `later` in circular u32 space.
#[inline]
pub fn diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

/// `a` comes strictly before `b`.
#[inline]
pub fn before(a: u32, b: u32) -> bool {
    diff(a, b) < 0
}

/// `a` comes strictly after `b`.
#[inline]
pub fn after(a: u32, b: u32) -> bool {
    diff(a, b) > 0
}

/// `a` is `b` or comes after it.
#[inline]
pub fn after_eq(a: u32, b: u32) -> bool {
    diff(a, b) >= 0
}

/// `start <= sn < end` on the circle.
#[inline]
pub fn in_window(sn: u32, start: u32, end: u32) -> bool {
    after_eq(sn, start) && before(sn, end)
}
