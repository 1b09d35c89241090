//! Flat graded storage for truncated tensor-algebra elements.
//!
//! An element of the algebra truncated at `depth` over `R^input_channels` is
//! one contiguous buffer whose channel axis has width
//! `signature_channels(input_channels, depth)`; grade `k` (1-based) occupies
//! the sub-range starting at `C + C^2 + ... + C^{k-1}` with width `C^k`. The
//! scalar grade is identically 1 and never stored. During computation the
//! grades travel as a `Vec<Tensor>` and are concatenated back into the flat
//! buffer on the way out.

use anyhow::Result;
use candle_core::Tensor;

/// Number of channels of a depth-`depth` signature over `input_channels`
/// channels: `C + C^2 + ... + C^D`.
pub fn signature_channels(input_channels: usize, depth: usize) -> usize {
    let mut total = 0usize;
    let mut power = 1usize;
    for _ in 0..depth {
        power *= input_channels;
        total += power;
    }
    total
}

/// `[1/2, 1/3, ..., 1/depth]`; empty when `depth == 1`.
///
/// Applied through `Tensor::affine`, which takes f64 scalars for every
/// floating dtype, so no tensor is materialised for these.
pub fn make_reciprocals(depth: usize) -> Vec<f64> {
    (2..=depth).map(|k| 1.0 / k as f64).collect()
}

/// Split the channel axis (the last axis) of `input` into its `depth` grades.
///
/// Works for both `(B, W)` signatures and `(S, B, W)` stream signatures. The
/// returned grades are contiguous copies; Candle tensors are immutable values,
/// so the grades are recombined with [`flatten_terms`] rather than written
/// through aliasing views.
pub fn slice_by_term(input: &Tensor, input_channels: usize, depth: usize) -> Result<Vec<Tensor>> {
    let channel_axis = input.rank() - 1;
    let mut terms = Vec::with_capacity(depth);
    let mut start = 0usize;
    let mut length = input_channels;
    for _ in 0..depth {
        terms.push(input.narrow(channel_axis, start, length)?.contiguous()?);
        start += length;
        length *= input_channels;
    }
    Ok(terms)
}

/// Fix the leading stream axis of every grade in `terms` at `stream_index`,
/// turning `(S, B, C^k)` grades into `(B, C^k)` grades.
pub fn slice_at_stream(terms: &[Tensor], stream_index: usize) -> Result<Vec<Tensor>> {
    terms
        .iter()
        .map(|term| Ok(term.narrow(0, stream_index, 1)?.squeeze(0)?))
        .collect()
}

/// Concatenate grades back into one flat buffer along the channel axis.
pub fn flatten_terms(terms: &[Tensor]) -> Result<Tensor> {
    let channel_axis = terms[0].rank() - 1;
    Ok(Tensor::cat(&terms.iter().collect::<Vec<_>>(), channel_axis)?)
}
