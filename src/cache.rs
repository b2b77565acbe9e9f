//! Decode-state cache for incremental decoding
//!
//! Owned by exactly one decode loop. Each decoder layer keeps its self-attention
//! K/V history (grows by one position per step) and the cross-attention K/V
//! projected from the encoder output (computed once, on the first step).

use candle_core::{Result, Tensor};

/// Cached attention state for a single decoder layer
#[derive(Clone, Default)]
pub struct LayerCache {
    /// Self-attention history, both [batch, num_kv_heads, cached_len, head_dim].
    /// Only rank-4 tensors are ever stored (checked in `update`).
    history: Option<(Tensor, Tensor)>,
    /// Cross-attention K/V over the encoder output
    cross: Option<(Tensor, Tensor)>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append this step's keys and values along the sequence axis and return
    /// the full history to attend over
    pub fn update(&mut self, step_k: &Tensor, step_v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, heads, _, head_dim) = step_k.dims4()?;
        if step_v.dims4()? != step_k.dims4()? {
            candle_core::bail!(
                "key/value shapes differ: {:?} vs {:?}",
                step_k.dims(),
                step_v.dims()
            );
        }

        let history = match &self.history {
            None => (step_k.clone(), step_v.clone()),
            Some((keys, values)) => {
                let (b, h, _, d) = keys.dims4()?;
                if (b, h, d) != (batch, heads, head_dim) {
                    candle_core::bail!(
                        "step shape {:?} does not extend cached {:?}",
                        step_k.dims(),
                        keys.dims()
                    );
                }
                (
                    Tensor::cat(&[keys, step_k], 2)?,
                    Tensor::cat(&[values, step_v], 2)?,
                )
            }
        };

        self.history = Some(history.clone());
        Ok(history)
    }

    /// Number of cached self-attention positions
    pub fn len(&self) -> usize {
        self.history.as_ref().map_or(0, |(keys, _)| keys.dims()[2])
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_none()
    }

    pub fn cross(&self) -> Option<&(Tensor, Tensor)> {
        self.cross.as_ref()
    }

    pub fn set_cross(&mut self, k: Tensor, v: Tensor) {
        self.cross = Some((k, v));
    }
}

/// Mutable state threaded through the steps of one batch's decode loop
pub struct DecodeState {
    layers: Vec<LayerCache>,
    /// Position of the token fed at the current step
    cur_len: usize,
}

impl DecodeState {
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| LayerCache::new()).collect(),
            cur_len: 0,
        }
    }

    /// Current decoded length marker
    pub fn cur_len(&self) -> usize {
        self.cur_len
    }

    /// Move the length marker forward after a step has been consumed
    pub fn advance(&mut self) {
        self.cur_len += 1;
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_mut(&mut self, layer: usize) -> Option<&mut LayerCache> {
        self.layers.get_mut(layer)
    }

    pub fn layer(&self, layer: usize) -> Option<&LayerCache> {
        self.layers.get(layer)
    }
}
