//! GiB arithmetic shared by the provider implementations and the
//! controller service.

/// One GiB in bytes.
pub const GIB: i64 = 1 << 30;

/// Rounds a byte count up to the next whole GiB.
pub fn round_up_bytes(bytes: i64) -> i64 {
  round_up_gib(bytes) * GIB
}

/// Rounds a byte count up to a GiB count. 1 GiB + 1 byte is 2 GiB.
pub fn round_up_gib(bytes: i64) -> i64 {
  if bytes <= 0 {
    return 0;
  }
  (bytes + GIB - 1) / GIB
}

/// Truncating conversion from bytes to GiB.
pub fn bytes_to_gib(bytes: i64) -> i64 {
  bytes / GIB
}

pub fn gib_to_bytes(gib: i64) -> i64 {
  gib * GIB
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  #[test_case(1, GIB; "one byte")]
  #[test_case(GIB, GIB; "exactly one gib")]
  #[test_case(GIB + 1, 2 * GIB; "one gib plus one byte")]
  #[test_case(5 * GIB, 5 * GIB; "exact multiple")]
  #[test_case(0, 0; "zero")]
  #[test_case(-5, 0; "negative")]
  fn round_up(bytes: i64, expected: i64) {
    assert_eq!(round_up_bytes(bytes), expected);
  }

  #[test]
  fn round_up_law() {
    // C mod 2^30 == 0 and C - 2^30 < B <= C for positive B.
    for bytes in [1, 4096, GIB - 1, GIB, GIB + 1, 10_000, 3 * GIB + 17] {
      let c = round_up_bytes(bytes);
      assert_eq!(c % GIB, 0);
      assert!(c - GIB < bytes && bytes <= c, "bytes={bytes} c={c}");
    }
  }

  #[test]
  fn gib_conversions() {
    assert_eq!(bytes_to_gib(GIB), 1);
    assert_eq!(bytes_to_gib(GIB + 1), 1);
    assert_eq!(gib_to_bytes(3), 3 * GIB);
  }
}
