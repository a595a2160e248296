//! Integer helpers, filter coefficient synthesis and Hadamard construction.

/// Workgroup counts are ceilings of the floating point quotient, clamped so a
/// degenerate axis still dispatches one group.
pub fn ceil_div(a: u32, b: u32) -> u32 {
    or_one((a + b - 1) / b)
}

pub fn or_one(x: u32) -> u32 {
    if x == 0 {
        1
    } else {
        x
    }
}

/// Number of mip levels the MinMax reduction walks for a volume of the given
/// dimensions: enough to reduce the largest axis to a single texel.
pub fn mips_for_dim(dim: [i32; 3]) -> i32 {
    let max_dim = dim[0].max(dim[1]).max(dim[2]).max(1) as u32;
    max_dim.next_power_of_two().trailing_zeros() as i32 + 1
}

/// Zeroth-order modified Bessel function of the first kind, by power series.
/// Converges quickly for the β range used by Kaiser windows.
pub fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut sum = 1.0;
    let mut term = 1.0;
    let mut k = 1.0;
    loop {
        term *= (half / k) * (half / k);
        sum += term;
        if term < 1.0e-12 * sum {
            break;
        }
        k += 1.0;
    }
    sum
}

fn sinc(x: f64) -> f64 {
    if x == 0.0 {
        1.0
    } else {
        let px = std::f64::consts::PI * x;
        px.sin() / px
    }
}

/// Kaiser-windowed sinc low pass filter:
/// `h[n] = I0(β·sqrt(1 − ((2n/(L−1)) − 1)²))/I0(β) · sinc(2·fc/fs·(n − (L−1)/2))`
pub fn kaiser_low_pass_filter(
    cutoff_frequency: f32,
    sampling_frequency: f32,
    beta: f32,
    length: i32,
) -> Vec<f32> {
    let l = length.max(1) as f64;
    let beta = beta as f64;
    let i0_beta = bessel_i0(beta);
    let fc = 2.0 * cutoff_frequency as f64 / sampling_frequency as f64;

    (0..length.max(1))
        .map(|n| {
            let n = n as f64;
            let t = 2.0 * n / (l - 1.0).max(1.0) - 1.0;
            let window = bessel_i0(beta * (1.0 - t * t).max(0.0).sqrt()) / i0_beta;
            (window * sinc(fc * (n - (l - 1.0) / 2.0))) as f32
        })
        .collect()
}

const HADAMARD_12_TRANSPOSE: [i32; 144] = [
    1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,
    1, -1, -1,  1, -1, -1, -1,  1,  1,  1, -1,  1,
    1,  1, -1, -1,  1, -1, -1, -1,  1,  1,  1, -1,
    1, -1,  1, -1, -1,  1, -1, -1, -1,  1,  1,  1,
    1,  1, -1,  1, -1, -1,  1, -1, -1, -1,  1,  1,
    1,  1,  1, -1,  1, -1, -1,  1, -1, -1, -1,  1,
    1,  1,  1,  1, -1,  1, -1, -1,  1, -1, -1, -1,
    1, -1,  1,  1,  1, -1,  1, -1, -1,  1, -1, -1,
    1, -1, -1,  1,  1,  1, -1,  1, -1, -1,  1, -1,
    1, -1, -1, -1,  1,  1,  1, -1,  1, -1, -1,  1,
    1,  1, -1, -1, -1,  1,  1,  1, -1,  1, -1, -1,
    1, -1,  1, -1, -1, -1,  1,  1,  1, -1,  1, -1,
];

const HADAMARD_20_TRANSPOSE: [i32; 400] = [
    1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,  1,
    1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1,
    1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1,
    1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,
    1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,
    1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1,
    1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1,
    1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1,
    1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1,
    1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,
    1, -1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1,
    1,  1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,
    1, -1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1,
    1,  1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,
    1,  1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,
    1,  1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,
    1,  1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,
    1, -1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1,
    1, -1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1,
    1,  1, -1, -1,  1,  1, -1, -1, -1, -1,  1, -1,  1, -1,  1,  1,  1,  1, -1, -1,
];

/// Row major Kronecker product `a ⊗ b`.
fn kronecker_product(a: &[i32], a_dim: usize, b: &[i32], b_dim: usize) -> Vec<i32> {
    let out_dim = a_dim * b_dim;
    let mut out = vec![0i32; out_dim * out_dim];
    for ai in 0..a_dim {
        for aj in 0..a_dim {
            let scale = a[ai * a_dim + aj];
            for bi in 0..b_dim {
                for bj in 0..b_dim {
                    out[(ai * b_dim + bi) * out_dim + aj * b_dim + bj] =
                        scale * b[bi * b_dim + bj];
                }
            }
        }
    }
    out
}

fn sylvester_hadamard(dim: usize) -> Vec<i32> {
    let mut m = vec![0i32; dim * dim];
    m[0] = 1;
    let mut k = 1;
    while k < dim {
        for i in 0..k {
            for j in 0..k {
                let val = m[i * dim + j];
                m[(i + k) * dim + j] = val;
                m[i * dim + (j + k)] = val;
                m[(i + k) * dim + (j + k)] = -val;
            }
        }
        k *= 2;
    }
    m
}

/// Transposed Hadamard matrix of the given order, or `None` when no such
/// matrix is constructible here. Supported orders: powers of two, and
/// 12·2ⁿ / 20·2ⁿ through the Kronecker product with the fixed base matrices.
pub fn make_hadamard_transpose(order: u32) -> Option<Vec<i32>> {
    if order == 0 {
        return None;
    }
    let order = order as usize;

    if order.is_power_of_two() {
        // Sylvester matrices are symmetric, transpose is free
        return Some(sylvester_hadamard(order));
    }
    if order % 12 == 0 && (order / 12).is_power_of_two() {
        let pow = sylvester_hadamard(order / 12);
        return Some(kronecker_product(&pow, order / 12, &HADAMARD_12_TRANSPOSE, 12));
    }
    if order % 20 == 0 && (order / 20).is_power_of_two() {
        let pow = sylvester_hadamard(order / 20);
        return Some(kronecker_product(&pow, order / 20, &HADAMARD_20_TRANSPOSE, 20));
    }
    None
}

/// Column major 4x4 matrix, in the element order GL expects.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Mat4(pub [f32; 16]);

impl Mat4 {
    pub fn identity() -> Mat4 {
        let mut m = [0.0; 16];
        m[0] = 1.0;
        m[5] = 1.0;
        m[10] = 1.0;
        m[15] = 1.0;
        Mat4(m)
    }

    pub fn translation(t: [f32; 3]) -> Mat4 {
        let mut m = Mat4::identity();
        m.0[12] = t[0];
        m.0[13] = t[1];
        m.0[14] = t[2];
        m
    }

    pub fn scale(s: [f32; 3]) -> Mat4 {
        let mut m = Mat4::identity();
        m.0[0] = s[0];
        m.0[5] = s[1];
        m.0[10] = s[2];
        m
    }

    /// Rotation about Z, angle in turns.
    pub fn rotation_about_z(turns: f32) -> Mat4 {
        let angle = turns * std::f32::consts::TAU;
        let (s, c) = angle.sin_cos();
        let mut m = Mat4::identity();
        m.0[0] = c;
        m.0[1] = s;
        m.0[4] = -s;
        m.0[5] = c;
        m
    }

    pub fn mul(&self, rhs: &Mat4) -> Mat4 {
        let mut out = [0.0f32; 16];
        for col in 0..4 {
            for row in 0..4 {
                let mut acc = 0.0;
                for k in 0..4 {
                    acc += self.0[k * 4 + row] * rhs.0[col * 4 + k];
                }
                out[col * 4 + row] = acc;
            }
        }
        Mat4(out)
    }

    pub fn as_ptr(&self) -> *const f32 {
        self.0.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_hadamard(m: &[i32], dim: usize) -> bool {
        // rows pairwise orthogonal, entries ±1
        for v in m {
            if *v != 1 && *v != -1 {
                return false;
            }
        }
        for i in 0..dim {
            for j in 0..dim {
                let dot: i32 = (0..dim).map(|k| m[i * dim + k] * m[j * dim + k]).sum();
                let expect = if i == j { dim as i32 } else { 0 };
                if dot != expect {
                    return false;
                }
            }
        }
        true
    }

    #[test]
    fn hadamard_power_of_two() {
        for order in [1u32, 2, 4, 8, 16, 64] {
            let m = make_hadamard_transpose(order).unwrap();
            assert!(is_hadamard(&m, order as usize), "order {}", order);
        }
    }

    #[test]
    fn hadamard_composite_orders() {
        for order in [12u32, 20, 24, 40, 48] {
            let m = make_hadamard_transpose(order).unwrap();
            assert!(is_hadamard(&m, order as usize), "order {}", order);
        }
    }

    #[test]
    fn hadamard_unsupported_orders() {
        for order in [0u32, 3, 6, 10, 28, 36] {
            assert!(make_hadamard_transpose(order).is_none(), "order {}", order);
        }
    }

    #[test]
    fn bessel_i0_reference_values() {
        // Abramowitz & Stegun table values
        assert!((bessel_i0(0.0) - 1.0).abs() < 1e-9);
        assert!((bessel_i0(1.0) - 1.2660658).abs() < 1e-6);
        assert!((bessel_i0(2.0) - 2.2795853).abs() < 1e-6);
    }

    #[test]
    fn kaiser_filter_shape() {
        let h = kaiser_low_pass_filter(5.0e6, 40.0e6, 6.0, 65);
        assert_eq!(h.len(), 65);
        // peak at the center tap, symmetric, tapered ends
        let mid = h[32];
        for (i, v) in h.iter().enumerate() {
            assert!(*v <= mid + 1e-6, "tap {} above center", i);
            assert!((h[i] - h[64 - i]).abs() < 1e-6, "asymmetry at {}", i);
        }
        assert!(h[0].abs() < 0.05 * mid.abs());
    }

    #[test]
    fn mips_cover_largest_axis() {
        assert_eq!(mips_for_dim([256, 1, 1024]), 11);
        assert_eq!(mips_for_dim([1, 1, 1]), 1);
        assert_eq!(mips_for_dim([2, 2, 2]), 2);
    }

    #[test]
    fn ceil_div_clamps_to_one() {
        assert_eq!(ceil_div(0, 32), 1);
        assert_eq!(ceil_div(31, 32), 1);
        assert_eq!(ceil_div(33, 32), 2);
    }

    #[test]
    fn mat4_rotation_and_mul() {
        let r = Mat4::rotation_about_z(0.25);
        let t = Mat4::translation([1.0, 2.0, 3.0]);
        let m = r.mul(&t);
        // rotating the translated origin by a quarter turn maps +x to +y
        assert!((m.0[12] - -2.0).abs() < 1e-6);
        assert!((m.0[13] - 1.0).abs() < 1e-6);
        assert!((m.0[14] - 3.0).abs() < 1e-6);
    }
}
