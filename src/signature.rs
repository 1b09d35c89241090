//! Streaming signature transform: path increments, the forward driver (serial
//! and chunked-parallel), the backward driver, and signature-combine.
//!
//! Layout conventions: a path is `(stream, batch, channel)`; a signature is
//! `(batch, signature_channels)` or `(stream, batch, signature_channels)`
//! when `stream == true`.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::layout::{
    flatten_terms, make_reciprocals, signature_channels, slice_at_stream, slice_by_term,
};
use crate::tensor_algebra;

/// Problem sizes (batch * output stream * signature channels) below this run
/// single-threaded. Chosen empirically as roughly the crossover point:
/// batch 32 * stream 128 * signature_channels(4, 4) = 1392640.
const PARALLELISM_THRESHOLD: usize = 1_392_640;

static MAX_PARALLELISM: AtomicUsize = AtomicUsize::new(0);

/// Ceiling on the number of threads used across the stream axis.
/// Defaults to the hardware thread count until [`set_max_parallelism`] is called.
pub fn max_parallelism() -> usize {
    match MAX_PARALLELISM.load(Ordering::Relaxed) {
        0 => hardware_threads(),
        limit => limit,
    }
}

/// Set the stream-axis thread ceiling. `0` restores the hardware default.
pub fn set_max_parallelism(limit: usize) {
    MAX_PARALLELISM.store(limit, Ordering::Relaxed);
}

fn hardware_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.get())
        .unwrap_or(1)
}

/// Validate the arguments of [`signature_forward`].
pub fn signature_checkargs(
    path: &Tensor,
    depth: usize,
    basepoint_value: Option<&Tensor>,
    initial_value: Option<&Tensor>,
) -> Result<()> {
    let dims = path.dims();
    if dims.len() == 2 {
        anyhow::bail!(
            "path must be a 3-dimensional tensor, with dimensions corresponding to \
             (stream, batch, channel) respectively. For the signature of a single \
             unbatched path, add a batch dimension with unsqueeze(1) and remove it \
             from the result with squeeze(0)."
        );
    }
    anyhow::ensure!(
        dims.len() == 3,
        "path must be a 3-dimensional tensor, with dimensions corresponding to \
         (stream, batch, channel) respectively"
    );
    anyhow::ensure!(
        dims.iter().all(|&size| size > 0),
        "path cannot have dimensions of size zero"
    );
    anyhow::ensure!(
        basepoint_value.is_some() || dims[0] >= 2,
        "path must have a stream dimension of size at least 2 when no basepoint is \
         given; at least this many points are needed to define a path"
    );
    anyhow::ensure!(depth >= 1, "depth must be an integer greater than or equal to one");
    anyhow::ensure!(
        matches!(path.dtype(), DType::F16 | DType::BF16 | DType::F32 | DType::F64),
        "path must be of floating point type"
    );

    if let Some(basepoint) = basepoint_value {
        let (basepoint_batch, basepoint_channels) = basepoint.dims2()?;
        anyhow::ensure!(
            basepoint_batch == dims[1] && basepoint_channels == dims[2],
            "basepoint must have shape (batch, channel) matching the path, got {:?}",
            basepoint.dims()
        );
        ensure_same_opts(path, basepoint, "basepoint")?;
    }
    if let Some(initial) = initial_value {
        let (initial_batch, initial_channels) = initial.dims2()?;
        anyhow::ensure!(
            initial_batch == dims[1] && initial_channels == signature_channels(dims[2], depth),
            "initial must have shape (batch, signature_channels) matching the path \
             and depth, got {:?}",
            initial.dims()
        );
        ensure_same_opts(path, initial, "initial")?;
    }
    Ok(())
}

fn ensure_same_opts(path: &Tensor, other: &Tensor, name: &str) -> Result<()> {
    anyhow::ensure!(
        other.dtype() == path.dtype(),
        "{name} does not have the same dtype as path"
    );
    anyhow::ensure!(
        other.device().location() == path.device().location(),
        "{name} does not have the same device as path"
    );
    Ok(())
}

/// Successive differences of the path along the stream axis, `(S, B, C)` with
/// `S = N - 1` (`S = N` with a basepoint prepended). The four
/// basepoint/inverse cases are built directly so no concatenated path is ever
/// allocated; `inverse` flips the sign of every increment.
fn compute_path_increments(
    path: &Tensor,
    basepoint_value: Option<&Tensor>,
    inverse: bool,
) -> Result<Tensor> {
    let (stream_size, _batch_size, _channels) = path.dims3()?;
    let num_increments = stream_size - 1;
    match basepoint_value {
        Some(basepoint) => {
            let first = if inverse {
                basepoint.unsqueeze(0)?.sub(&path.narrow(0, 0, 1)?)?
            } else {
                path.narrow(0, 0, 1)?.sub(&basepoint.unsqueeze(0)?)?
            };
            if num_increments == 0 {
                return Ok(first);
            }
            let rest = if inverse {
                path.narrow(0, 0, num_increments)?
                    .sub(&path.narrow(0, 1, num_increments)?)?
            } else {
                path.narrow(0, 1, num_increments)?
                    .sub(&path.narrow(0, 0, num_increments)?)?
            };
            Ok(Tensor::cat(&[&first, &rest], 0)?)
        }
        None => {
            if inverse {
                Ok(path
                    .narrow(0, 0, num_increments)?
                    .sub(&path.narrow(0, 1, num_increments)?)?)
            } else {
                Ok(path
                    .narrow(0, 1, num_increments)?
                    .sub(&path.narrow(0, 0, num_increments)?)?)
            }
        }
    }
}

/// Backward of [`compute_path_increments`]: turn `(S, B, C)` increment
/// gradients into the path gradient and (when a basepoint was used) the
/// basepoint gradient.
fn compute_path_increments_backward(
    grad_path_increments: &Tensor,
    basepoint: bool,
    inverse: bool,
) -> Result<(Tensor, Option<Tensor>)> {
    let (stream_size, batch_size, channels) = grad_path_increments.dims3()?;
    let zero_row = Tensor::zeros(
        (1, batch_size, channels),
        grad_path_increments.dtype(),
        grad_path_increments.device(),
    )?;
    if basepoint {
        // Each point s receives +-grad[s] for the increment it ends and the
        // opposite sign for the increment it starts; the last point starts none.
        let shifted = if stream_size > 1 {
            Tensor::cat(&[&grad_path_increments.narrow(0, 1, stream_size - 1)?, &zero_row], 0)?
        } else {
            zero_row
        };
        let grad_first = grad_path_increments.narrow(0, 0, 1)?.squeeze(0)?;
        if inverse {
            Ok((shifted.sub(grad_path_increments)?, Some(grad_first)))
        } else {
            Ok((grad_path_increments.sub(&shifted)?, Some(grad_first.neg()?)))
        }
    } else {
        let leading = Tensor::cat(&[&zero_row, grad_path_increments], 0)?;
        let trailing = Tensor::cat(&[grad_path_increments, &zero_row], 0)?;
        if inverse {
            Ok((trailing.sub(&leading)?, None))
        } else {
            Ok((leading.sub(&trailing)?, None))
        }
    }
}

fn increment_at(path_increments: &Tensor, stream_index: usize) -> Result<Tensor> {
    Ok(path_increments.narrow(0, stream_index, 1)?.squeeze(0)?)
}

/// Compute the depth-`depth` signature of `path`.
///
/// Returns the signature, `(B, W)` (or `(S, B, W)` of all prefix signatures
/// when `stream`), together with the path increments, which
/// [`signature_backward`] needs back. `basepoint_value` prepends a starting
/// point, `inverse` computes the signature of the time-reversed path, and
/// `initial_value` right-multiplies the new increments onto a previously
/// computed signature.
pub fn signature_forward(
    path: &Tensor,
    depth: usize,
    stream: bool,
    basepoint_value: Option<&Tensor>,
    inverse: bool,
    initial_value: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let dims = path.dims();
    let stream_threads = if dims.len() == 3 {
        plan_stream_threads(path, depth, stream, basepoint_value.is_some())
    } else {
        1 // let checkargs produce the diagnostic
    };
    signature_forward_with_parallelism(
        path,
        depth,
        stream,
        basepoint_value,
        inverse,
        initial_value,
        stream_threads,
    )
}

fn plan_stream_threads(
    path: &Tensor,
    depth: usize,
    stream: bool,
    basepoint: bool,
) -> usize {
    if stream || !matches!(path.device(), Device::Cpu) {
        // Prefix outputs make the stream axis inherently serial; on
        // accelerators the device's own concurrency is used instead.
        return 1;
    }
    let dims = path.dims();
    let (input_stream_size, batch_size, channels) = (dims[0], dims[1], dims[2]);
    if input_stream_size < 2 {
        return 1;
    }
    let output_stream_size = input_stream_size - usize::from(!basepoint);
    let work = batch_size * output_stream_size * signature_channels(channels, depth);
    if work < PARALLELISM_THRESHOLD {
        return 1;
    }
    // Batch parallelism inside the tensor backend is the more efficient axis,
    // so only the threads the batch cannot absorb go to the stream axis; the
    // chunks are also kept at three increments or more so the fused update
    // still amortises.
    let max_threads = hardware_threads();
    let stream_threads = (max_threads + batch_size - 1) / batch_size;
    stream_threads
        .min((input_stream_size + 2) / 3)
        .min(max_parallelism())
        .max(1)
}

/// [`signature_forward`] with an explicit stream-axis thread count. Exposed
/// for tests; `signature_forward` plans the count itself.
#[doc(hidden)]
#[allow(clippy::too_many_arguments)]
pub fn signature_forward_with_parallelism(
    path: &Tensor,
    depth: usize,
    stream: bool,
    basepoint_value: Option<&Tensor>,
    inverse: bool,
    initial_value: Option<&Tensor>,
    stream_threads: usize,
) -> Result<(Tensor, Tensor)> {
    signature_checkargs(path, depth, basepoint_value, initial_value)?;

    let (_, _, input_channels) = path.dims3()?;
    let reciprocals = make_reciprocals(depth);
    let path_increments = compute_path_increments(path, basepoint_value, inverse)?;
    let output_stream_size = path_increments.dims3()?.0;

    // First stream position: either the restricted exponential of the first
    // increment, or the supplied initial signature pushed along by it.
    let first_increment = increment_at(&path_increments, 0)?;
    let mut terms = match initial_value {
        Some(initial) => {
            let mut terms = slice_by_term(initial, input_channels, depth)?;
            tensor_algebra::mult_fused_restricted_exp(
                &first_increment,
                &mut terms,
                inverse,
                &reciprocals,
            )?;
            terms
        }
        None => tensor_algebra::restricted_exp(&first_increment, depth, &reciprocals)?,
    };

    let signature = if stream {
        let mut rows = Vec::with_capacity(output_stream_size);
        rows.push(flatten_terms(&terms)?);
        for stream_index in 1..output_stream_size {
            let next = increment_at(&path_increments, stream_index)?;
            tensor_algebra::mult_fused_restricted_exp(&next, &mut terms, inverse, &reciprocals)?;
            rows.push(flatten_terms(&terms)?);
        }
        Tensor::stack(&rows.iter().collect::<Vec<_>>(), 0)?
    } else if stream_threads > 1 && output_stream_size > 2 {
        signature_forward_chunked(
            &path_increments,
            &mut terms,
            depth,
            inverse,
            &reciprocals,
            stream_threads,
        )?;
        flatten_terms(&terms)?
    } else {
        for stream_index in 1..output_stream_size {
            let next = increment_at(&path_increments, stream_index)?;
            tensor_algebra::mult_fused_restricted_exp(&next, &mut terms, inverse, &reciprocals)?;
        }
        flatten_terms(&terms)?
    };

    Ok((signature, path_increments))
}

/// Chunked-parallel driver: partition stream indices `[1, S)` into
/// `stream_threads` contiguous chunks, compute each chunk's signature with a
/// private scratch, then fold the chunks into `terms` in ascending order.
/// Concatenating paths multiplies signatures, so the fold reproduces the
/// serial result exactly up to floating-point reduction order.
fn signature_forward_chunked(
    path_increments: &Tensor,
    terms: &mut [Tensor],
    depth: usize,
    inverse: bool,
    reciprocals: &[f64],
    stream_threads: usize,
) -> Result<()> {
    let output_stream_size = path_increments.dims3()?.0;
    let chunk_results: Vec<Result<Option<Vec<Tensor>>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..stream_threads)
            .map(|thread_index| {
                scope.spawn(move || -> Result<Option<Vec<Tensor>>> {
                    let start = 1 + (output_stream_size - 1) * thread_index / stream_threads;
                    let end = 1 + (output_stream_size - 1) * (thread_index + 1) / stream_threads;
                    if start >= end {
                        // The runtime may hand out more threads than there are
                        // chunks of useful size.
                        return Ok(None);
                    }
                    let first = increment_at(path_increments, start)?;
                    let mut chunk_terms =
                        tensor_algebra::restricted_exp(&first, depth, reciprocals)?;
                    for stream_index in start + 1..end {
                        let next = increment_at(path_increments, stream_index)?;
                        tensor_algebra::mult_fused_restricted_exp(
                            &next,
                            &mut chunk_terms,
                            inverse,
                            reciprocals,
                        )?;
                    }
                    Ok(Some(chunk_terms))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    });

    for chunk in chunk_results {
        if let Some(chunk_terms) = chunk? {
            // Under inverse every fused update multiplied on the left, so
            // chunk signatures also combine on the left.
            tensor_algebra::mult(terms, &chunk_terms, inverse)?;
        }
    }
    Ok(())
}

/// Backward of [`signature_forward`].
///
/// `signature` and `path_increments` are the forward's outputs; the flags
/// must match the forward call. Returns the path gradient together with the
/// basepoint and initial-value gradients when those inputs were supplied.
///
/// With `stream == true` the partial signatures are read straight out of the
/// saved output; otherwise they are reconstructed in reverse by pushing the
/// negated increment through the fused update, which inverts the restricted
/// exponential in the graded algebra.
#[allow(clippy::too_many_arguments)]
pub fn signature_backward(
    grad_signature: &Tensor,
    signature: &Tensor,
    path_increments: &Tensor,
    depth: usize,
    stream: bool,
    basepoint: bool,
    inverse: bool,
    initial: bool,
) -> Result<(Tensor, Option<Tensor>, Option<Tensor>)> {
    let (output_stream_size, _batch_size, input_channels) = path_increments.dims3()?;
    let reciprocals = make_reciprocals(depth);

    // Saved grades, stream-indexed, for the stream == true lookups.
    let (signature_by_term, grad_signature_by_term) = if stream {
        (
            slice_by_term(signature, input_channels, depth)?,
            slice_by_term(grad_signature, input_channels, depth)?,
        )
    } else {
        (Vec::new(), Vec::new())
    };

    // Gradient carried backwards along the stream axis.
    let mut grad_terms = if stream {
        slice_at_stream(&grad_signature_by_term, output_stream_size - 1)?
    } else {
        slice_by_term(grad_signature, input_channels, depth)?
    };

    // Signature rolled backwards in place of the missing history.
    let mut rolled_terms = if stream {
        Vec::new()
    } else {
        slice_by_term(signature, input_channels, depth)?
    };

    let mut grad_increment_rows = Vec::with_capacity(output_stream_size);
    for stream_index in (1..output_stream_size).rev() {
        let next = increment_at(path_increments, stream_index)?;
        let previous_terms = if stream {
            slice_at_stream(&signature_by_term, stream_index - 1)?
        } else {
            let negated = next.neg()?;
            tensor_algebra::mult_fused_restricted_exp(
                &negated,
                &mut rolled_terms,
                inverse,
                &reciprocals,
            )?;
            rolled_terms.clone()
        };
        let grad_next = tensor_algebra::mult_fused_restricted_exp_backward(
            &mut grad_terms,
            &next,
            &previous_terms,
            inverse,
            &reciprocals,
        )?;
        grad_increment_rows.push(grad_next);

        if stream {
            // Gradients supplied on the earlier prefix signatures join here.
            let grad_row = slice_at_stream(&grad_signature_by_term, stream_index - 1)?;
            for (accumulated, grad) in grad_terms.iter_mut().zip(&grad_row) {
                *accumulated = accumulated.add(grad)?;
            }
        }
    }

    // First increment: its backward goes through the restricted exponential,
    // unless an initial signature was supplied, in which case it was one more
    // fused update and rolls back the same way as the rest.
    let first_increment = increment_at(path_increments, 0)?;
    let first_terms = if stream {
        slice_at_stream(&signature_by_term, 0)?
    } else {
        rolled_terms
    };
    let grad_first = if initial {
        let mut initial_terms = first_terms;
        let negated = first_increment.neg()?;
        tensor_algebra::mult_fused_restricted_exp(
            &negated,
            &mut initial_terms,
            inverse,
            &reciprocals,
        )?;
        tensor_algebra::mult_fused_restricted_exp_backward(
            &mut grad_terms,
            &first_increment,
            &initial_terms,
            inverse,
            &reciprocals,
        )?
    } else {
        tensor_algebra::restricted_exp_backward(
            &grad_terms,
            &first_increment,
            &first_terms,
            &reciprocals,
        )?
    };
    grad_increment_rows.push(grad_first);
    grad_increment_rows.reverse();

    let grad_path_increments = Tensor::stack(&grad_increment_rows.iter().collect::<Vec<_>>(), 0)?;
    let (grad_path, grad_basepoint_value) =
        compute_path_increments_backward(&grad_path_increments, basepoint, inverse)?;
    let grad_initial_value = if initial {
        Some(flatten_terms(&grad_terms)?)
    } else {
        None
    };
    Ok((grad_path, grad_basepoint_value, grad_initial_value))
}

/// Multiply two depth-`depth` signatures over `input_channels` channels:
/// the signature of the concatenation of the underlying paths.
pub fn signature_combine_forward(
    sig1: &Tensor,
    sig2: &Tensor,
    input_channels: usize,
    depth: usize,
) -> Result<Tensor> {
    let expected_channels = signature_channels(input_channels, depth);
    let (batch1, channels1) = sig1.dims2()?;
    let (batch2, channels2) = sig2.dims2()?;
    anyhow::ensure!(
        batch1 == batch2,
        "signatures to combine must have the same number of batch elements, got {batch1} and {batch2}"
    );
    anyhow::ensure!(
        channels1 == expected_channels && channels2 == expected_channels,
        "signatures to combine must have signature_channels({input_channels}, {depth}) = \
         {expected_channels} channels, got {channels1} and {channels2}"
    );

    let mut arg1 = slice_by_term(sig1, input_channels, depth)?;
    let arg2 = slice_by_term(sig2, input_channels, depth)?;
    tensor_algebra::mult(&mut arg1, &arg2, false)?;
    flatten_terms(&arg1)
}

/// Backward of [`signature_combine_forward`].
pub fn signature_combine_backward(
    grad: &Tensor,
    sig1: &Tensor,
    sig2: &Tensor,
    input_channels: usize,
    depth: usize,
) -> Result<(Tensor, Tensor)> {
    anyhow::ensure!(
        grad.dims() == sig1.dims(),
        "grad has shape {:?} but the combined signature has shape {:?}",
        grad.dims(),
        sig1.dims()
    );
    let mut grad_arg1 = slice_by_term(grad, input_channels, depth)?;
    let mut grad_arg2 = slice_by_term(sig2, input_channels, depth)?
        .iter()
        .map(|term| Ok(term.zeros_like()?))
        .collect::<Result<Vec<_>>>()?;
    let arg1 = slice_by_term(sig1, input_channels, depth)?;
    let arg2 = slice_by_term(sig2, input_channels, depth)?;
    tensor_algebra::mult_backward(&mut grad_arg1, &mut grad_arg2, &arg1, &arg2)?;
    Ok((flatten_terms(&grad_arg1)?, flatten_terms(&grad_arg2)?))
}
