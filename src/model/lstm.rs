//! Bidirectional multi-layer LSTM over packed, length-sorted batches.
//!
//! Parameters use the standard LSTM layout so checkpoints exported from other
//! frameworks load by name: `weight_ih_l{k}`, `weight_hh_l{k}`, `bias_ih_l{k}`,
//! `bias_hh_l{k}`, with a `_reverse` suffix for the backward direction.
//! Gate rows are ordered input, forget, cell, output.

use tch::{nn, Kind, Tensor};

/// Weights of one direction of one layer.
#[derive(Debug)]
struct Direction {
    w_ih: Tensor,
    w_hh: Tensor,
    b_ih: Tensor,
    b_hh: Tensor,
}

impl Direction {
    fn new(p: &nn::Path, layer: i64, suffix: &str, input_dim: i64, hidden: i64) -> Self {
        let bound = 1.0 / (hidden as f64).sqrt();
        let init = nn::Init::Uniform {
            lo: -bound,
            up: bound,
        };
        Direction {
            w_ih: p.var(
                &format!("weight_ih_l{}{}", layer, suffix),
                &[4 * hidden, input_dim],
                init,
            ),
            w_hh: p.var(
                &format!("weight_hh_l{}{}", layer, suffix),
                &[4 * hidden, hidden],
                init,
            ),
            b_ih: p.var(&format!("bias_ih_l{}{}", layer, suffix), &[4 * hidden], init),
            b_hh: p.var(&format!("bias_hh_l{}{}", layer, suffix), &[4 * hidden], init),
        }
    }

    /// Run over a sorted batch `xs` of shape `[batch, steps, input]`.
    ///
    /// At step `t` only the first `active[t]` rows advance. Returns the
    /// per-step outputs `[batch, steps, hidden]` (zero where a row is
    /// exhausted) and the final hidden state of every row.
    fn run(&self, xs: &Tensor, active: &[usize], reverse: bool) -> (Tensor, Tensor) {
        let batch = xs.size()[0];
        let hidden = self.w_hh.size()[1];
        let options = (xs.kind(), xs.device());

        let mut h = Tensor::zeros([batch, hidden], options);
        let mut c = Tensor::zeros([batch, hidden], options);
        let mut outputs = Vec::with_capacity(active.len());

        let steps: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..active.len()).rev())
        } else {
            Box::new(0..active.len())
        };

        for step in steps {
            let k = active[step] as i64;
            let x_t = xs.narrow(0, 0, k).select(1, step as i64);
            let h_prev = h.narrow(0, 0, k);
            let c_prev = c.narrow(0, 0, k);

            let gates = x_t.linear(&self.w_ih, Some(&self.b_ih))
                + h_prev.linear(&self.w_hh, Some(&self.b_hh));
            let gates = gates.chunk(4, 1);
            let input_gate = gates[0].sigmoid();
            let forget_gate = gates[1].sigmoid();
            let cell_gate = gates[2].tanh();
            let output_gate = gates[3].sigmoid();

            let c_next = forget_gate * c_prev + input_gate * cell_gate;
            let h_next = output_gate * c_next.tanh();

            let idle = batch - k;
            let padding = Tensor::zeros([idle, hidden], options);
            outputs.push(Tensor::cat(&[&h_next, &padding], 0));

            // exhausted rows keep their last state
            h = Tensor::cat(&[&h_next, &h.narrow(0, k, idle)], 0);
            c = Tensor::cat(&[&c_next, &c.narrow(0, k, idle)], 0);
        }

        if reverse {
            outputs.reverse();
        }
        (Tensor::stack(&outputs, 1), h)
    }
}

/// Stacked bidirectional LSTM that consumes exactly `len` steps per row.
#[derive(Debug)]
pub struct PackedBiLstm {
    layers: Vec<(Direction, Direction)>,
    hidden: i64,
}

impl PackedBiLstm {
    pub fn new(p: &nn::Path, input_dim: i64, hidden: i64, num_layers: i64) -> Self {
        let layers = (0..num_layers)
            .map(|layer| {
                let layer_input = if layer == 0 { input_dim } else { 2 * hidden };
                (
                    Direction::new(p, layer, "", layer_input, hidden),
                    Direction::new(p, layer, "_reverse", layer_input, hidden),
                )
            })
            .collect();
        PackedBiLstm { layers, hidden }
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden
    }

    /// Encode a length-sorted batch `[batch, capacity, input]`.
    ///
    /// `active` comes from [`super::packing::LengthSort::active_counts`].
    /// Returns `[batch, 2 * hidden]`: the forward state at each row's last
    /// valid step followed by the backward state at step 0.
    pub fn forward(&self, xs: &Tensor, active: &[usize]) -> Tensor {
        let mut layer_input = xs.to_kind(Kind::Float);
        let mut last = None;

        for (forward, backward) in &self.layers {
            let (fwd_out, fwd_h) = forward.run(&layer_input, active, false);
            let (bwd_out, bwd_h) = backward.run(&layer_input, active, true);
            layer_input = Tensor::cat(&[fwd_out, bwd_out], 2);
            last = Some((fwd_h, bwd_h));
        }

        match last {
            Some((fwd_h, bwd_h)) => Tensor::cat(&[fwd_h, bwd_h], 1),
            None => layer_input.select(1, 0),
        }
    }
}
