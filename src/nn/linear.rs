//! Dense linear layer over a flat parameter buffer

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Error, Result};
use crate::nn::layout::ParamLayout;
use crate::trainer::amp::AmpPolicy;

/// Dense linear layer: output = input @ weight + bias
///
/// The layer owns no data; `weight` (`[in, out]`) and `bias` (`[out]`) are
/// indices into a [`ParamLayout`], so every rank can run the same layer
/// against its own replica of the parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: usize,
    bias: usize,
}

impl Linear {
    /// Bind a layer to the `weight`/`bias` entries of `layout`.
    pub fn new(layout: &ParamLayout, weight: usize, bias: usize) -> Result<Self> {
        let w = layout.entry(weight)?;
        let b = layout.entry(bias)?;
        let (in_features, out_features) = match w.shape() {
            [i, o] => (*i, *o),
            other => {
                return Err(Error::ModelError {
                    reason: format!("'{}' must be 2-D, got {other:?}", w.name()),
                });
            }
        };
        if b.shape() != [out_features] {
            return Err(Error::ModelError {
                reason: format!(
                    "'{}' shape {:?} does not match {out_features} outputs",
                    b.name(),
                    b.shape()
                ),
            });
        }
        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn weight_index(&self) -> usize {
        self.weight
    }

    pub fn bias_index(&self) -> usize {
        self.bias
    }

    fn compute_weight(&self, layout: &ParamLayout, params: &[f32], amp: AmpPolicy) -> Result<Array2<f32>> {
        let w = layout.slice(params, self.weight)?;
        let view = ArrayView2::from_shape((self.in_features, self.out_features), w)
            .map_err(|e| Error::ModelError {
                reason: format!("weight view: {e}"),
            })?;
        let mut w = view.to_owned();
        amp.cast_compute(&mut w);
        Ok(w)
    }

    fn compute_bias(&self, layout: &ParamLayout, params: &[f32], amp: AmpPolicy) -> Result<Array1<f32>> {
        let b = layout.slice(params, self.bias)?;
        let mut b = ArrayView1::from(b).to_owned();
        amp.cast_compute(&mut b);
        Ok(b)
    }

    /// Forward: input `[batch, in]` → output `[batch, out]`, cast to the compute dtype.
    pub fn forward(
        &self,
        layout: &ParamLayout,
        params: &[f32],
        input: &Array2<f32>,
        amp: AmpPolicy,
    ) -> Result<Array2<f32>> {
        if input.ncols() != self.in_features {
            return Err(Error::ModelError {
                reason: format!(
                    "linear expects {} input features, got {}",
                    self.in_features,
                    input.ncols()
                ),
            });
        }
        let w = self.compute_weight(layout, params, amp)?;
        let b = self.compute_bias(layout, params, amp)?;

        let mut out = input.dot(&w);
        out += &b;
        amp.cast_compute(&mut out);
        Ok(out)
    }

    /// Backward: writes dW and db into `grads` (overwriting) and returns dInput.
    ///
    /// `input` must be the tensor passed to `forward`; `grad_output` is
    /// `[batch, out]`.
    pub fn backward(
        &self,
        layout: &ParamLayout,
        params: &[f32],
        input: &Array2<f32>,
        grad_output: &Array2<f32>,
        grads: &mut [f32],
        amp: AmpPolicy,
    ) -> Result<Array2<f32>> {
        if grad_output.dim() != (input.nrows(), self.out_features) {
            return Err(Error::ModelError {
                reason: format!(
                    "grad_output shape {:?} does not match [{}, {}]",
                    grad_output.dim(),
                    input.nrows(),
                    self.out_features
                ),
            });
        }
        let w = self.compute_weight(layout, params, amp)?;

        let mut grad_w = input.t().dot(grad_output);
        amp.cast_compute(&mut grad_w);
        let mut grad_b = grad_output.sum_axis(Axis(0));
        amp.cast_compute(&mut grad_b);
        let mut grad_input = grad_output.dot(&w.t());
        amp.cast_compute(&mut grad_input);

        let dst = layout.slice_mut(grads, self.weight)?;
        for (d, s) in dst.iter_mut().zip(grad_w.iter()) {
            *d = *s;
        }
        let dst = layout.slice_mut(grads, self.bias)?;
        for (d, s) in dst.iter_mut().zip(grad_b.iter()) {
            *d = *s;
        }

        Ok(grad_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::config::PrecisionMode;
    use ndarray::array;

    fn setup() -> (ParamLayout, Linear, Vec<f32>) {
        let layout = ParamLayout::new([("l.weight", vec![2, 2]), ("l.bias", vec![2])]).unwrap();
        let linear = Linear::new(&layout, 0, 1).unwrap();
        // identity weight, bias [10, 20]
        let params = vec![1.0, 0.0, 0.0, 1.0, 10.0, 20.0];
        (layout, linear, params)
    }

    #[test]
    fn test_linear_output_shape_and_values() {
        let (layout, linear, params) = setup();
        let amp = AmpPolicy::new(PrecisionMode::Fp32);
        let input = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let out = linear.forward(&layout, &params, &input, amp).unwrap();
        assert_eq!(out.dim(), (3, 2));
        assert_eq!(out, array![[11.0, 22.0], [13.0, 24.0], [15.0, 26.0]]);
    }

    #[test]
    fn test_linear_backward_grads() {
        let (layout, linear, params) = setup();
        let amp = AmpPolicy::new(PrecisionMode::Fp32);
        let input = array![[1.0f32, 2.0], [3.0, 4.0]];
        let grad_out = array![[1.0f32, 0.0], [0.0, 1.0]];
        let mut grads = vec![0.0f32; layout.total_numel()];
        let grad_in = linear
            .backward(&layout, &params, &input, &grad_out, &mut grads, amp)
            .unwrap();

        // dW = x^T g = [[1,3],[2,4]]
        assert_eq!(&grads[0..4], &[1.0, 3.0, 2.0, 4.0]);
        // db = column sums
        assert_eq!(&grads[4..6], &[1.0, 1.0]);
        // identity weight passes the gradient straight through
        assert_eq!(grad_in, grad_out);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let (layout, linear, params) = setup();
        let amp = AmpPolicy::new(PrecisionMode::Fp32);
        let input = array![[1.0f32, 2.0, 3.0]];
        assert!(linear.forward(&layout, &params, &input, amp).is_err());
    }

    #[test]
    fn test_linear_rejects_mismatched_bias() {
        let layout = ParamLayout::new([("w", vec![2, 3]), ("b", vec![2])]).unwrap();
        assert!(Linear::new(&layout, 0, 1).is_err());
    }

    #[test]
    fn test_bf16_forward_rounds_output() {
        let layout = ParamLayout::new([("w", vec![1, 1]), ("b", vec![1])]).unwrap();
        let linear = Linear::new(&layout, 0, 1).unwrap();
        let params = vec![1.0f32, 0.0];
        let input = array![[1.0f32 + 2f32.powi(-10)]];

        let out = linear
            .forward(&layout, &params, &input, AmpPolicy::new(PrecisionMode::Bf16))
            .unwrap();
        assert_eq!(out[[0, 0]], 1.0);

        let out = linear
            .forward(&layout, &params, &input, AmpPolicy::new(PrecisionMode::Fp32))
            .unwrap();
        assert_eq!(out[[0, 0]], 1.0 + 2f32.powi(-10));
    }
}
