//! # Sieve — Small Primes and Word-Sized Modular Arithmetic
//!
//! Shared number-theoretic helpers for the admissibility filter and trial
//! factoring:
//!
//! 1. **Small-prime generation** with an odd-only sieve of Eratosthenes
//!    (one byte per odd number, index i ↔ 2i + 1).
//! 2. **Modular multiplication and exponentiation** on u64 with u128
//!    intermediates, valid for any modulus below 2^64.
//! 3. **GCD** for residue-class coprimality checks.

/// Generate all primes up to and including `limit`.
pub fn generate_primes(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return vec![];
    }
    let limit = limit as usize;
    // composite[i] describes the odd number 2i + 1
    let odd_count = (limit + 1) / 2;
    let mut composite = vec![false; odd_count];
    composite[0] = true; // 1

    let mut i = 1;
    while (2 * i + 1) * (2 * i + 1) <= limit {
        if !composite[i] {
            let p = 2 * i + 1;
            let mut j = p * p / 2;
            while j < odd_count {
                composite[j] = true;
                j += p;
            }
        }
        i += 1;
    }

    let mut primes = Vec::with_capacity(estimate_prime_count(limit));
    primes.push(2);
    primes.extend(
        composite
            .iter()
            .enumerate()
            .filter(|(_, &c)| !c)
            .map(|(i, _)| (2 * i + 1) as u64),
    );
    primes
}

fn estimate_prime_count(n: usize) -> usize {
    if n < 10 {
        return 4;
    }
    let nf = n as f64;
    (1.3 * nf / nf.ln()) as usize
}

/// a·b mod m without overflow.
#[inline]
pub fn mul_mod(a: u64, b: u64, m: u64) -> u64 {
    (a as u128 * b as u128 % m as u128) as u64
}

/// base^exp mod modulus by binary exponentiation.
pub fn pow_mod(mut base: u64, mut exp: u64, modulus: u64) -> u64 {
    if modulus == 1 {
        return 0;
    }
    let mut result: u64 = 1;
    base %= modulus;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, modulus);
        }
        exp >>= 1;
        base = mul_mod(base, base, modulus);
    }
    result
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_primes_small_limits() {
        assert_eq!(generate_primes(0), Vec::<u64>::new());
        assert_eq!(generate_primes(1), Vec::<u64>::new());
        assert_eq!(generate_primes(2), vec![2]);
        assert_eq!(generate_primes(3), vec![2, 3]);
        assert_eq!(generate_primes(4), vec![2, 3]);
        assert_eq!(generate_primes(9), vec![2, 3, 5, 7]);
        assert_eq!(generate_primes(11), vec![2, 3, 5, 7, 11]);
        assert_eq!(generate_primes(30), vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
    }

    /// π(x) from OEIS A000720.
    #[test]
    fn generate_primes_known_counts() {
        assert_eq!(generate_primes(100).len(), 25);
        assert_eq!(generate_primes(1000).len(), 168);
        assert_eq!(generate_primes(10_000).len(), 1229);
        assert_eq!(generate_primes(100_000).len(), 9592);
    }

    #[test]
    fn generate_primes_includes_square_limits() {
        // 49 = 7² must be crossed off, 47 kept
        let p = generate_primes(49);
        assert_eq!(p.last(), Some(&47));
        assert!(!p.contains(&49));
        assert_eq!(generate_primes(121).last(), Some(&113));
    }

    #[test]
    fn pow_mod_known_values() {
        assert_eq!(pow_mod(2, 10, 1000), 24);
        assert_eq!(pow_mod(3, 4, 100), 81);
        assert_eq!(pow_mod(5, 0, 7), 1);
        assert_eq!(pow_mod(7, 3, 1), 0);
        // 2^11 ≡ 1 (mod 23): 23 divides M11
        assert_eq!(pow_mod(2, 11, 23), 1);
    }

    #[test]
    fn mul_mod_near_u64_max() {
        let m = u64::MAX - 58; // largest prime below 2^64
        let a = m - 1;
        // (−1)·(−1) ≡ 1
        assert_eq!(mul_mod(a, a, m), 1);
    }

    #[test]
    fn gcd_basics() {
        assert_eq!(gcd(210, 11), 1);
        assert_eq!(gcd(210, 49), 7);
        assert_eq!(gcd(0, 5), 5);
        assert_eq!(gcd(12, 18), 6);
    }
}
