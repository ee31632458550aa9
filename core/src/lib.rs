//! Multiscale wavelet-fused edge detection, trained from scratch.
//!
//! A five-stage convolutional encoder emits a side output at every scale;
//! scales 2-5 fuse the previous scale's wavelet detail bands before their
//! side outputs are bilinearly upsampled, cropped to the input extent and
//! combined by a learned 1x1 fuse head. Every layer carries a hand-derived
//! backward pass, so the whole network is trainable with plain grouped SGD
//! and checkable against finite differences.
//!
//! Module map:
//! - [`tensor`]: flat-buffer conv / pool / activation kernels and backwards
//! - [`wavelet`]: periodized D4 decomposition and its exact adjoint
//! - [`bilinear`]: fixed bilinear upsampling and the alignment crop
//! - [`model`]: configuration, parameters, checkpoints, LR grouping
//! - [`forward`] / [`backward`]: the full network pass pair
//! - [`loss`]: class-balanced BCE over the six output maps
//! - [`optim`]: grouped SGD with momentum and step decay
//! - [`trainer`]: accumulation loop, visualization, epoch checkpoints

pub mod backward;
pub mod bilinear;
pub mod forward;
pub mod loss;
pub mod model;
pub mod optim;
pub mod tensor;
pub mod trainer;
pub mod wavelet;
