/// Class-balanced binary cross-entropy for edge maps.
///
/// Edge pixels are rare, so each term weights positives by the negative
/// fraction beta = neg / (pos + neg) and negatives by 1 - beta, balanced
/// per batch sample. Gradients are taken with respect to the pre-sigmoid
/// logits, which keeps the backward pass numerically stable:
/// dL/dz = -beta * y * (1 - p) + (1 - beta) * (1 - y) * p.

const EPS: f32 = 1e-6;

/// Balanced BCE over one [n,1,h,w] probability map against labels in [0,1].
/// Pixels with label > 0.5 count as positive for the balancing ratio.
///
/// Returns (summed loss, gradient w.r.t. the logits).
pub fn balanced_bce_with_logits(
    probs: &[f32],
    labels: &[f32],
    n: usize,
    hw: usize,
) -> (f32, Vec<f32>) {
    debug_assert_eq!(probs.len(), n * hw);
    debug_assert_eq!(labels.len(), n * hw);

    let mut loss = 0.0f64;
    let mut d_logits = vec![0.0f32; n * hw];
    for b in 0..n {
        let base = b * hw;
        let mut pos = 0usize;
        for &y in &labels[base..base + hw] {
            if y > 0.5 {
                pos += 1;
            }
        }
        let neg = hw - pos;
        let beta = neg as f32 / hw as f32;
        let beta_c = 1.0 - beta;

        for i in base..base + hw {
            let y = labels[i];
            let p = probs[i];
            let pc = p.clamp(EPS, 1.0 - EPS);
            loss -= (beta * y * pc.ln() + beta_c * (1.0 - y) * (1.0 - pc).ln()) as f64;
            d_logits[i] = -beta * y * (1.0 - p) + beta_c * (1.0 - y) * p;
        }
    }
    (loss as f32, d_logits)
}

/// Six equally weighted balanced-BCE terms: the five auxiliary side outputs
/// plus the fused map, summed. Returns the total and the per-map logit
/// gradients in the same fixed order the forward pass emits.
pub fn multiscale_edge_loss(
    maps: &[Vec<f32>; 6],
    labels: &[f32],
    n: usize,
    h: usize,
    w: usize,
) -> (f32, [Vec<f32>; 6]) {
    let hw = h * w;
    let mut total = 0.0f32;
    let mut grads: [Vec<f32>; 6] = [
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
        Vec::new(),
    ];
    for (slot, map) in grads.iter_mut().zip(maps.iter()) {
        let (l, d) = balanced_bce_with_logits(map, labels, n, hw);
        total += l;
        *slot = d;
    }
    (total, grads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::sigmoid_f32;

    #[test]
    fn loss_positive_on_mixed_labels() {
        let logits = [0.3f32, -0.7, 1.2, -0.1];
        let probs = sigmoid_f32(&logits);
        let labels = [1.0f32, 0.0, 1.0, 0.0];
        let (loss, d) = balanced_bce_with_logits(&probs, &labels, 1, 4);
        assert!(loss > 0.0);
        assert_eq!(d.len(), 4);
        // Positive pixels pull logits up, negatives push down.
        assert!(d[0] < 0.0 && d[2] < 0.0);
        assert!(d[1] > 0.0 && d[3] > 0.0);
    }

    #[test]
    fn all_negative_labels_weight_positives_out() {
        // pos = 0 -> beta = 1 -> negative term weighted by zero.
        let probs = [0.2f32, 0.9];
        let labels = [0.0f32, 0.0];
        let (loss, d) = balanced_bce_with_logits(&probs, &labels, 1, 2);
        assert_eq!(loss, 0.0);
        assert_eq!(d, vec![0.0, 0.0]);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let logits = [0.5f32, -1.3, 0.2, 2.0, -0.4, 0.0];
        let labels = [1.0f32, 0.0, 0.0, 1.0, 1.0, 0.0];
        let (_, d) = balanced_bce_with_logits(&sigmoid_f32(&logits), &labels, 1, 6);
        let eps = 1e-3f32;
        for i in 0..logits.len() {
            let mut lp = logits;
            lp[i] += eps;
            let mut lm = logits;
            lm[i] -= eps;
            let (loss_p, _) = balanced_bce_with_logits(&sigmoid_f32(&lp), &labels, 1, 6);
            let (loss_m, _) = balanced_bce_with_logits(&sigmoid_f32(&lm), &labels, 1, 6);
            let fd = (loss_p - loss_m) / (2.0 * eps);
            assert!((fd - d[i]).abs() < 1e-3, "pixel {i}: fd {fd} vs analytic {}", d[i]);
        }
    }
}
