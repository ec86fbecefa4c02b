//! Distribution functions used by the significance tests.
//!
//! Log-gamma (Lanczos), regularized incomplete beta and gamma functions
//! (continued fractions), and the Student t, F, chi-square, normal and
//! studentized range distributions built on them.

use std::f64::consts::PI;

const EPS: f64 = 1e-14;
const FPMIN: f64 = 1e-300;
const MAX_ITER: usize = 500;

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_93,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_13,
    -176.615_029_162_140_59,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_571_6e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function.
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // Reflection formula
        (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut acc = LANCZOS_COEFFS[0];
        for (i, c) in LANCZOS_COEFFS.iter().enumerate().skip(1) {
            acc += c / (x + i as f64);
        }
        let t = x + LANCZOS_G + 0.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
    }
}

/// Regularized incomplete beta function I_x(a, b).
pub fn beta_inc(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();

    if x < (a + 1.0) / (a + b + 2.0) {
        ln_front.exp() * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - ln_front.exp() * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Modified Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;

        if (del - 1.0).abs() < EPS {
            break;
        }
    }

    h
}

/// Regularized lower incomplete gamma P(a, x).
pub fn gamma_inc_lower(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        gamma_series(a, x)
    } else {
        1.0 - gamma_continued_fraction(a, x)
    }
}

/// Regularized upper incomplete gamma Q(a, x) = 1 - P(a, x).
pub fn gamma_inc_upper(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    if x < a + 1.0 {
        1.0 - gamma_series(a, x)
    } else {
        gamma_continued_fraction(a, x)
    }
}

fn gamma_series(a: f64, x: f64) -> f64 {
    let mut ap = a;
    let mut sum = 1.0 / a;
    let mut del = sum;
    for _ in 0..MAX_ITER {
        ap += 1.0;
        del *= x / ap;
        sum += del;
        if del.abs() < sum.abs() * EPS {
            break;
        }
    }
    sum * (-x + a * x.ln() - ln_gamma(a)).exp()
}

fn gamma_continued_fraction(a: f64, x: f64) -> f64 {
    let mut b = x + 1.0 - a;
    let mut c = 1.0 / FPMIN;
    let mut d = 1.0 / b;
    let mut h = d;
    for i in 1..=MAX_ITER {
        let i = i as f64;
        let an = -i * (i - a);
        b += 2.0;
        d = an * d + b;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = b + an / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let del = d * c;
        h *= del;
        if (del - 1.0).abs() < EPS {
            break;
        }
    }
    (-x + a * x.ln() - ln_gamma(a)).exp() * h
}

/// Standard normal CDF.
pub fn normal_cdf(z: f64) -> f64 {
    let half_z2 = 0.5 * z * z;
    if z >= 0.0 {
        0.5 * (1.0 + gamma_inc_lower(0.5, half_z2))
    } else {
        0.5 * gamma_inc_upper(0.5, half_z2)
    }
}

/// Student t CDF with `df` degrees of freedom.
pub fn student_t_cdf(t: f64, df: f64) -> f64 {
    let x = df / (df + t * t);
    let tail = 0.5 * beta_inc(0.5 * df, 0.5, x);
    if t > 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Two-sided p-value for a t statistic.
pub fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    if t.is_infinite() {
        return 0.0;
    }
    beta_inc(0.5 * df, 0.5, df / (df + t * t)).clamp(0.0, 1.0)
}

/// Inverse Student t CDF: the `t` with `student_t_cdf(t, df) == p`.
pub fn student_t_quantile(p: f64, df: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p < 0.5 {
        return -student_t_quantile(1.0 - p, df);
    }
    if p == 0.5 {
        return 0.0;
    }
    bisect_increasing(|t| student_t_cdf(t, df), p, 0.0)
}

/// Upper tail of the chi-square distribution.
pub fn chi_square_sf(x: f64, df: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    gamma_inc_upper(0.5 * df, 0.5 * x).clamp(0.0, 1.0)
}

/// Upper tail of the F distribution.
pub fn f_sf(f: f64, d1: f64, d2: f64) -> f64 {
    if f <= 0.0 {
        return 1.0;
    }
    if f.is_infinite() {
        return 0.0;
    }
    beta_inc(0.5 * d2, 0.5 * d1, d2 / (d2 + d1 * f)).clamp(0.0, 1.0)
}

const RANGE_Z_LIMIT: f64 = 8.0;
const RANGE_INNER_STEPS: usize = 160;
const RANGE_OUTER_STEPS: usize = 120;

/// Density and CDF of the standard normal on the inner integration grid.
struct NormalGrid {
    points: Vec<(f64, f64, f64)>,
    h: f64,
}

impl NormalGrid {
    fn new() -> Self {
        let h = 2.0 * RANGE_Z_LIMIT / RANGE_INNER_STEPS as f64;
        let points = (0..=RANGE_INNER_STEPS)
            .map(|i| {
                let z = -RANGE_Z_LIMIT + h * i as f64;
                let density = (-0.5 * z * z).exp() / (2.0 * PI).sqrt();
                (z, density, normal_cdf(z))
            })
            .collect();
        Self { points, h }
    }

    /// CDF of the range of `k` independent standard normals (infinite df).
    fn range_cdf(&self, w: f64, k: f64) -> f64 {
        if w <= 0.0 {
            return 0.0;
        }
        let last = self.points.len() - 1;
        let mut sum = 0.0;
        for (i, &(z, density, phi)) in self.points.iter().enumerate() {
            let weight = if i == 0 || i == last {
                1.0
            } else if i % 2 == 1 {
                4.0
            } else {
                2.0
            };
            let inner = (phi - normal_cdf(z - w)).max(0.0);
            sum += weight * density * inner.powf(k - 1.0);
        }
        k * sum * self.h / 3.0
    }
}

/// CDF of the studentized range distribution with `k` groups and `df`
/// error degrees of freedom.
///
/// Integrates the normal range CDF against the density of `s = χ/√df`.
pub fn studentized_range_cdf(q: f64, k: f64, df: f64) -> f64 {
    if q <= 0.0 {
        return 0.0;
    }
    let grid = NormalGrid::new();
    if df > 25_000.0 {
        return grid.range_cdf(q, k).clamp(0.0, 1.0);
    }

    let half_df = 0.5 * df;
    let ln_norm = half_df * df.ln() - ln_gamma(half_df) - (half_df - 1.0) * 2f64.ln();
    // sd(s) is about 1/sqrt(2 df); integrate over eight of them each side.
    let spread = 8.0 / (2.0 * df).sqrt();
    let lower = (1.0 - spread).max(0.0);
    let upper = 1.0 + spread;
    let h = (upper - lower) / RANGE_OUTER_STEPS as f64;

    let integrand = |s: f64| {
        if s <= 0.0 {
            return 0.0;
        }
        let density = (ln_norm + (df - 1.0) * s.ln() - half_df * s * s).exp();
        density * grid.range_cdf(q * s, k)
    };

    simpson(integrand, lower, h, RANGE_OUTER_STEPS).clamp(0.0, 1.0)
}

/// Inverse of [`studentized_range_cdf`] in `q`.
pub fn studentized_range_quantile(p: f64, k: f64, df: f64) -> f64 {
    if p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    bisect_increasing(|q| studentized_range_cdf(q, k, df), p, 0.0)
}

/// Composite Simpson rule over `steps` (even) intervals of width `h`.
fn simpson<F: Fn(f64) -> f64>(f: F, start: f64, h: f64, steps: usize) -> f64 {
    let mut sum = f(start) + f(start + h * steps as f64);
    for i in 1..steps {
        let weight = if i % 2 == 1 { 4.0 } else { 2.0 };
        sum += weight * f(start + h * i as f64);
    }
    sum * h / 3.0
}

/// Solve `cdf(x) == p` for an increasing `cdf` on `[lower, ∞)`.
fn bisect_increasing<F: Fn(f64) -> f64>(cdf: F, p: f64, lower: f64) -> f64 {
    let mut lo = lower;
    let mut hi = lower + 1.0;
    while cdf(hi) < p && hi < 1e8 {
        lo = hi;
        hi *= 2.0;
    }
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-9 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_ln_gamma() {
        assert!(close(ln_gamma(1.0), 0.0, 1e-12));
        assert!(close(ln_gamma(5.0), 24f64.ln(), 1e-12));
        assert!(close(ln_gamma(0.5), PI.sqrt().ln(), 1e-12));
    }

    #[test]
    fn test_beta_inc_symmetry() {
        assert!(close(beta_inc(2.0, 2.0, 0.5), 0.5, 1e-12));
        let x = 0.3;
        assert!(close(beta_inc(2.5, 4.0, x), 1.0 - beta_inc(4.0, 2.5, 1.0 - x), 1e-12));
    }

    #[test]
    fn test_normal_cdf() {
        assert!(close(normal_cdf(0.0), 0.5, 1e-12));
        assert!(close(normal_cdf(1.959_964), 0.975, 1e-6));
        assert!(close(normal_cdf(-1.959_964), 0.025, 1e-6));
    }

    #[test]
    fn test_student_t() {
        assert!(close(student_t_cdf(0.0, 7.0), 0.5, 1e-12));
        assert!(close(student_t_quantile(0.975, 10.0), 2.228_139, 1e-5));
        assert!(close(student_t_quantile(0.025, 10.0), -2.228_139, 1e-5));
        assert!(close(student_t_two_sided_p(2.228_139, 10.0), 0.05, 1e-6));
    }

    #[test]
    fn test_chi_square_sf() {
        assert!(close(chi_square_sf(3.841_459, 1.0), 0.05, 1e-6));
        assert!(close(chi_square_sf(5.991_465, 2.0), 0.05, 1e-6));
        assert_eq!(chi_square_sf(0.0, 3.0), 1.0);
    }

    #[test]
    fn test_f_sf() {
        assert!(close(f_sf(4.102_821, 2.0, 10.0), 0.05, 1e-6));
        assert_eq!(f_sf(0.0, 2.0, 10.0), 1.0);
    }

    #[test]
    fn test_studentized_range_two_groups_matches_t() {
        // With k = 2 the studentized range is sqrt(2) * |t|.
        let df = 10.0;
        let q = 2f64.sqrt() * student_t_quantile(0.975, df);
        assert!(close(studentized_range_cdf(q, 2.0, df), 0.95, 2e-4));
    }

    #[test]
    fn test_studentized_range_quantile_table() {
        // Tabulated upper 5% points of the studentized range.
        assert!(close(studentized_range_quantile(0.95, 3.0, 60.0), 3.399, 0.01));
        assert!(close(studentized_range_quantile(0.95, 4.0, 20.0), 3.958, 0.01));
    }

    #[test]
    fn test_studentized_range_large_df() {
        // Approaches the infinite-df value 3.3145 for three groups.
        for df in [5_000.0, 10_000.0, 20_000.0, 24_000.0] {
            let q = studentized_range_quantile(0.95, 3.0, df);
            assert!(close(q, 3.3146, 0.002), "df {} gave {}", df, q);
        }
        assert!(close(studentized_range_cdf(3.3145, 3.0, 24_000.0), 0.95, 5e-4));

        let mut previous = f64::INFINITY;
        for df in [100.0, 1_000.0, 5_000.0, 20_000.0] {
            let q = studentized_range_quantile(0.95, 3.0, df);
            assert!(q <= previous + 1e-4, "df {} gave {} after {}", df, q, previous);
            previous = q;
        }
    }
}
