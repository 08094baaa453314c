//! Three-layer MLP used as the training workload
//!
//! `in → in → in → out`, no activation between the linears, ReLU on the
//! output and a mean-reduction loss over every output element.

use ndarray::Array2;

use crate::error::{Error, Result};
use crate::nn::layout::ParamLayout;
use crate::nn::linear::Linear;
use crate::trainer::amp::AmpPolicy;

/// MLP shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MlpConfig {
    pub in_features: usize,
    pub out_features: usize,
}

impl MlpConfig {
    pub fn new(in_features: usize) -> Self {
        Self {
            in_features,
            out_features: 10,
        }
    }

    /// `(name, shape)` of every parameter, in canonical order.
    pub fn param_specs(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.in_features;
        let o = self.out_features;
        vec![
            ("linear1.weight".to_string(), vec![d, d]),
            ("linear1.bias".to_string(), vec![d]),
            ("linear2.weight".to_string(), vec![d, d]),
            ("linear2.bias".to_string(), vec![d]),
            ("linear3.weight".to_string(), vec![d, o]),
            ("linear3.bias".to_string(), vec![o]),
        ]
    }
}

/// Activations saved by [`Mlp::forward`] for the backward pass
#[derive(Debug, Clone)]
pub struct ForwardPass {
    input: Array2<f32>,
    hidden1: Array2<f32>,
    hidden2: Array2<f32>,
    pre_activation: Array2<f32>,
    loss: f32,
}

impl ForwardPass {
    pub fn loss(&self) -> f32 {
        self.loss
    }

    pub fn batch_size(&self) -> usize {
        self.input.nrows()
    }
}

/// MLP bound to a parameter layout
#[derive(Debug, Clone)]
pub struct Mlp {
    layout: ParamLayout,
    linear1: Linear,
    linear2: Linear,
    linear3: Linear,
}

impl Mlp {
    pub fn new(config: MlpConfig) -> Result<Self> {
        Self::from_layout(ParamLayout::new(config.param_specs())?)
    }

    /// Bind to a layout that carries the `linear{1,2,3}.{weight,bias}` entries.
    pub fn from_layout(layout: ParamLayout) -> Result<Self> {
        let index = |name: &str| {
            layout.index_of(name).ok_or_else(|| Error::ModelError {
                reason: format!("missing parameter '{name}'"),
            })
        };
        let linear1 = Linear::new(&layout, index("linear1.weight")?, index("linear1.bias")?)?;
        let linear2 = Linear::new(&layout, index("linear2.weight")?, index("linear2.bias")?)?;
        let linear3 = Linear::new(&layout, index("linear3.weight")?, index("linear3.bias")?)?;

        if linear2.in_features() != linear1.out_features()
            || linear3.in_features() != linear2.out_features()
        {
            return Err(Error::ModelError {
                reason: "linear layer widths do not chain".to_string(),
            });
        }
        if layout.len() != 6 {
            return Err(Error::ModelError {
                reason: format!("expected 6 parameters, layout has {}", layout.len()),
            });
        }

        Ok(Self {
            layout,
            linear1,
            linear2,
            linear3,
        })
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn in_features(&self) -> usize {
        self.linear1.in_features()
    }

    /// Forward pass: returns the scalar loss with the activations needed
    /// for backward.
    pub fn forward(&self, params: &[f32], inputs: &Array2<f32>, amp: AmpPolicy) -> Result<ForwardPass> {
        self.layout.check_len(params.len())?;
        if inputs.is_empty() {
            return Err(Error::ModelError {
                reason: "empty batch".to_string(),
            });
        }

        let mut input = inputs.clone();
        amp.cast_compute(&mut input);

        let hidden1 = self.linear1.forward(&self.layout, params, &input, amp)?;
        let hidden2 = self.linear2.forward(&self.layout, params, &hidden1, amp)?;
        let pre_activation = self.linear3.forward(&self.layout, params, &hidden2, amp)?;

        // relu output is already in the compute dtype
        let mut sum = 0.0f32;
        for &z in pre_activation.iter() {
            sum += z.max(0.0);
        }
        let loss = amp.compute(sum / pre_activation.len() as f32);

        Ok(ForwardPass {
            input,
            hidden1,
            hidden2,
            pre_activation,
            loss,
        })
    }

    /// Backward pass from `d(loss) = loss_scale`, writing every parameter's
    /// gradient into `grads` (overwriting).
    pub fn backward(
        &self,
        params: &[f32],
        pass: &ForwardPass,
        loss_scale: f64,
        grads: &mut [f32],
        amp: AmpPolicy,
    ) -> Result<()> {
        self.layout.check_len(grads.len())?;

        let n = pass.pre_activation.len() as f64;
        let seed = amp.compute((loss_scale / n) as f32);
        let grad_out = pass
            .pre_activation
            .mapv(|z| if z > 0.0 { seed } else { 0.0 });

        let grad_h2 = self
            .linear3
            .backward(&self.layout, params, &pass.hidden2, &grad_out, grads, amp)?;
        let grad_h1 = self
            .linear2
            .backward(&self.layout, params, &pass.hidden1, &grad_h2, grads, amp)?;
        self.linear1
            .backward(&self.layout, params, &pass.input, &grad_h1, grads, amp)?;

        Ok(())
    }
}
