use burn::{prelude::Backend, tensor::Tensor};

/// Rotate `[N, 3]` vectors by `[N, 4]` unit quaternions stored as (w, x, y, z).
///
/// Uses `v' = v + 2w (u x v) + 2 u x (u x v)` with `u` the vector part.
pub(crate) fn rotate_vectors<B: Backend>(
    quaternions: Tensor<B, 2>,
    vectors: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let num_points = quaternions.dims()[0];

    let w = quaternions.clone().slice([0..num_points, 0..1]);
    let u = quaternions.slice([0..num_points, 1..4]);

    let uv = cross(u.clone(), vectors.clone());
    let uuv = cross(u, uv.clone());

    vectors + (uv * w + uuv) * 2.0
}

fn cross<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let n = a.dims()[0];
    let col = |t: &Tensor<B, 2>, i: usize| t.clone().slice([0..n, i..i + 1]);
    let (ax, ay, az) = (col(&a, 0), col(&a, 1), col(&a, 2));
    let (bx, by, bz) = (col(&b, 0), col(&b, 1), col(&b, 2));

    Tensor::cat(
        vec![
            ay.clone() * bz.clone() - az.clone() * by.clone(),
            az * bx.clone() - ax.clone() * bz,
            ax * by - ay * bx,
        ],
        1,
    )
}
