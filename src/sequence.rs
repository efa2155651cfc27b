//! 24비트 순환 카운터
//!
//! 데이터그램 시퀀스 번호, reliable/sequence/order 인덱스는 모두 u24 필드.
//! 오버플로우 대신 필드 폭에서 순환하며, 비교는 직렬 번호 연산(RFC 1982)으로 수행

/// u24 공간 크기
pub const U24_MODULUS: u32 = 1 << 24;

/// u24 최댓값
pub const U24_MAX: u32 = U24_MODULUS - 1;

const HALF: u32 = U24_MODULUS / 2;

/// 다음 값 (순환)
#[inline]
pub fn next(value: u32) -> u32 {
    value.wrapping_add(1) & U24_MAX
}

/// 현재 값을 반환하고 카운터를 증가
#[inline]
pub fn take(counter: &mut u32) -> u32 {
    let value = *counter;
    *counter = next(value);
    value
}

/// `from`에서 `to`까지의 전방 거리
#[inline]
pub fn distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & U24_MAX
}

/// `a`가 `b`보다 엄격히 새로운지
#[inline]
pub fn is_newer(a: u32, b: u32) -> bool {
    let d = distance(b, a);
    d != 0 && d < HALF
}

/// `a >= b` (직렬 비교)
#[inline]
pub fn is_at_least(a: u32, b: u32) -> bool {
    a & U24_MAX == b & U24_MAX || is_newer(a, b)
}
