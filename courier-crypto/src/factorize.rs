//! Pollard's rho with Brent's cycle detection, for splitting the server's
//! `pq` challenge during key exchange. Inputs are 63-bit semiprimes, so all
//! intermediate products fit in `u128`.

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn mul_step(y: u128, c: u128, n: u128) -> u128 {
    (y * y % n + c) % n
}

fn diff(a: u128, b: u128) -> u128 {
    a.max(b) - a.min(b)
}

fn brent(n: u128, c: u128) -> u128 {
    const BATCH: u128 = 128;

    let mut y = 2u128;
    let mut r = 1u128;
    let mut q = 1u128;
    let mut g = 1u128;
    let mut x = 0u128;
    let mut ys = 0u128;

    while g == 1 {
        x = y;
        for _ in 0..r {
            y = mul_step(y, c, n);
        }
        let mut k = 0u128;
        while k < r && g == 1 {
            ys = y;
            for _ in 0..BATCH.min(r - k) {
                y = mul_step(y, c, n);
                q = q * diff(x, y) % n;
            }
            g = gcd(q, n);
            k += BATCH;
        }
        r *= 2;
    }

    if g == n {
        // The batched gcd collapsed; replay one step at a time.
        loop {
            ys = mul_step(ys, c, n);
            g = gcd(diff(x, ys), n);
            if g > 1 {
                break;
            }
        }
    }

    g
}

/// Split `pq` into its two prime factors `(p, q)` with `p <= q`.
pub fn factorize(pq: u64) -> (u64, u64) {
    let n = pq as u128;
    if n % 2 == 0 {
        return (2, (n / 2) as u64);
    }
    for c in 1..64u128 {
        let g = brent(n, c);
        if g != n && g != 1 {
            let p = g as u64;
            let q = (n / g) as u64;
            return (p.min(q), p.max(q));
        }
    }
    unreachable!("factorization exhausted all polynomial offsets");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_known_pq_values() {
        assert_eq!(factorize(1470626929934143021), (1206429347, 1218991343));
        assert_eq!(factorize(2363612107535801713), (1518968219, 1556064227));
    }

    #[test]
    fn orders_factors() {
        let (p, q) = factorize(0x17ED48941A08F981);
        assert!(p <= q);
        assert_eq!(p as u128 * q as u128, 0x17ED48941A08F981u128);
    }
}
