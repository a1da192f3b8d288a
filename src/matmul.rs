//! Strided matrix-vector product shared by the dense kernels.
//!
//! `y = A x + beta * y` where `A` is `rows x cols`, addressed as
//! `a[r * row_stride + c * col_stride]`. The forward kernel passes a block of weight
//! rows with `beta = 1` (accumulate onto the bias-initialised outputs); backprop passes
//! a block of weight columns by swapping the strides, with `beta = 0`.
//!
//! Each output element is one sequential reduction over `cols`, so splitting `rows`
//! across threads never changes the result. The `matrixmultiply` feature routes the
//! product through `sgemm` instead.

#[allow(clippy::too_many_arguments)]
#[inline]
pub(crate) fn matvec_f32(
    rows: usize,
    cols: usize,
    a: &[f32],
    row_stride: usize,
    col_stride: usize,
    x: &[f32],
    beta: f32,
    y: &mut [f32],
) {
    debug_assert!(rows > 0 && cols > 0);
    debug_assert!(a.len() > (rows - 1) * row_stride + (cols - 1) * col_stride);
    debug_assert!(x.len() >= cols);
    debug_assert!(y.len() >= rows);

    #[cfg(feature = "matrixmultiply")]
    {
        // SAFETY: the assertions above hold for every caller in this crate, so each
        // addressed element lies inside the borrowed slices.
        unsafe {
            matrixmultiply::sgemm(
                rows,
                cols,
                1,
                1.0,
                a.as_ptr(),
                row_stride as isize,
                col_stride as isize,
                x.as_ptr(),
                1,
                1,
                beta,
                y.as_mut_ptr(),
                1,
                1,
            );
        }
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for (r, out) in y[..rows].iter_mut().enumerate() {
        let base = r * row_stride;
        let dot = x[..cols]
            .iter()
            .enumerate()
            .fold(0.0_f32, |acc, (c, &xv)| a[base + c * col_stride].mul_add(xv, acc));
        *out = dot + beta * *out;
    }
}
