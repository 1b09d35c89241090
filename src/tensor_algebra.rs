//! Operations in the truncated tensor algebra.
//!
//! Every element is a `&[Tensor]` of grades, grade `k` flat as `[B, C^k]`,
//! with an implicit scalar grade of 1 (see [`crate::layout`]). Products are
//! graded convolutions: the grade-`d` part of `A ⊗ B` is
//! `A_d + B_d + sum_{j+k=d} A_j ⊗ B_k`. The outer product puts its left
//! factor on the slow axis of the flattened result, so `A ⊗ B` keeps the
//! earlier path segment on the slow axis throughout.

use anyhow::Result;
use candle_core::Tensor;
use sig_augment::TensorAlgebraExt;

/// `exp(next)` truncated at `depth`, for `next: [B, C]` in the lowest grade:
/// `out[0] = next`, `out[k] = out[k-1] ⊗ next / (k+1)`.
pub fn restricted_exp(next: &Tensor, depth: usize, reciprocals: &[f64]) -> Result<Vec<Tensor>> {
    let mut out = Vec::with_capacity(depth);
    out.push(next.clone());
    for i in 0..depth - 1 {
        let raised = out[i].outer(next)?.affine(reciprocals[i], 0.0)?;
        out.push(raised);
    }
    Ok(out)
}

/// Backward of [`restricted_exp`]: fold the grade gradients `grad_out` back
/// onto the input, given the forward's `out`. Returns `grad_next: [B, C]`.
pub fn restricted_exp_backward(
    grad_out: &[Tensor],
    next: &Tensor,
    out: &[Tensor],
    reciprocals: &[f64],
) -> Result<Tensor> {
    let depth = out.len();
    if depth == 1 {
        return Ok(grad_out[0].clone());
    }

    let mut grad_terms = grad_out.to_vec();

    // Top grade pulled out of the loop: it assigns grad_next rather than
    // accumulating into it, so nothing needs zero-initialising.
    let folded = grad_terms[depth - 1].affine(reciprocals[depth - 2], 0.0)?;
    let mut grad_next = folded.contract_left(&out[depth - 2])?;
    grad_terms[depth - 2] = grad_terms[depth - 2].add(&folded.contract_right(next)?)?;

    for i in (1..depth - 1).rev() {
        let folded = grad_terms[i].affine(reciprocals[i - 1], 0.0)?;
        grad_next = grad_next.add(&folded.contract_left(&out[i - 1])?)?;
        grad_terms[i - 1] = grad_terms[i - 1].add(&folded.contract_right(next)?)?;
    }
    Ok(grad_next.add(&grad_terms[0])?)
}

/// Fused update `prev <- prev ⊗ exp(next)` (or `exp(next) ⊗ prev` when
/// `inverse`), never materialising `exp(next)`.
///
/// The grade-`d` contribution of the product is assembled by a Horner
/// recurrence: starting from `prev[0] + next/d`, each inner step multiplies by
/// a divided copy of `next` (raising the grade by one) and adds the matching
/// grade of `prev`, so one scratch of width `C^d` replaces the full
/// exponential. `inverse` transposes every outer product, putting `next` on
/// the slow axis.
pub fn mult_fused_restricted_exp(
    next: &Tensor,
    prev: &mut [Tensor],
    inverse: bool,
    reciprocals: &[f64],
) -> Result<()> {
    let depth = prev.len();
    let next_divided = divide_by_reciprocals(next, reciprocals)?;

    for depth_index in (1..depth).rev() {
        let mut scratch = prev[0].add(&next_divided[depth_index - 1])?;
        for j in 1..depth_index {
            let k = depth_index - 1 - j;
            let raised = if inverse {
                next_divided[k].outer(&scratch)?
            } else {
                scratch.outer(&next_divided[k])?
            };
            scratch = prev[j].add(&raised)?;
        }
        let raised = if inverse {
            next.outer(&scratch)?
        } else {
            scratch.outer(next)?
        };
        prev[depth_index] = prev[depth_index].add(&raised)?;
    }
    prev[0] = prev[0].add(next)?;
    Ok(())
}

/// Backward of [`mult_fused_restricted_exp`].
///
/// `prev` must hold the grades as they were *before* the forward update (the
/// streaming backward rolls the signature back one increment to recover
/// them). The forward's scratches are replayed and then unwound grade by
/// grade; `grad_prev` is transformed in place from the gradient on the
/// updated element to the gradient on `prev`, and the gradient on `next` is
/// returned.
pub fn mult_fused_restricted_exp_backward(
    grad_prev: &mut [Tensor],
    next: &Tensor,
    prev: &[Tensor],
    inverse: bool,
    reciprocals: &[f64],
) -> Result<Tensor> {
    let depth = prev.len();
    let next_divided = divide_by_reciprocals(next, reciprocals)?;

    // Replay the forward's scratches. all_scratches[i] belongs to target
    // grade depth-1-i; its j-th entry is the scratch after j inner steps.
    let mut all_scratches: Vec<Vec<Tensor>> = Vec::with_capacity(depth.saturating_sub(1));
    for depth_index in (1..depth).rev() {
        let mut scratches = Vec::with_capacity(depth_index);
        let mut scratch = prev[0].add(&next_divided[depth_index - 1])?;
        scratches.push(scratch.clone());
        for j in 1..depth_index {
            let k = depth_index - 1 - j;
            let raised = if inverse {
                next_divided[k].outer(&scratch)?
            } else {
                scratch.outer(&next_divided[k])?
            };
            scratch = prev[j].add(&raised)?;
            scratches.push(scratch.clone());
        }
        all_scratches.push(scratches);
    }

    // The forward's last step was `prev[0] += next`, so the gradient on next
    // starts from the incoming lowest-grade gradient, captured before the
    // accumulations below touch it.
    let mut grad_next = grad_prev[0].clone();
    let mut grad_next_divided = next_divided
        .iter()
        .map(|divided| Ok(divided.zeros_like()?))
        .collect::<Result<Vec<_>>>()?;

    for depth_index in 1..depth {
        let scratches = &all_scratches[depth - 1 - depth_index];
        let scratch = &scratches[depth_index - 1];

        // Undo `prev[depth_index] += scratch ⊗ next`.
        let grad_at_depth = &grad_prev[depth_index];
        let (mut grad_scratch, grad_next_part) = if inverse {
            (
                grad_at_depth.contract_left(next)?,
                grad_at_depth.contract_right(scratch)?,
            )
        } else {
            (
                grad_at_depth.contract_right(next)?,
                grad_at_depth.contract_left(scratch)?,
            )
        };
        grad_next = grad_next.add(&grad_next_part)?;

        // Walk the inner chain backwards.
        for j in (1..depth_index).rev() {
            let k = depth_index - 1 - j;
            let old_scratch = &scratches[j - 1];
            grad_prev[j] = grad_prev[j].add(&grad_scratch)?;
            let (grad_old_scratch, grad_divided_part) = if inverse {
                (
                    grad_scratch.contract_left(&next_divided[k])?,
                    grad_scratch.contract_right(old_scratch)?,
                )
            } else {
                (
                    grad_scratch.contract_right(&next_divided[k])?,
                    grad_scratch.contract_left(old_scratch)?,
                )
            };
            grad_next_divided[k] = grad_next_divided[k].add(&grad_divided_part)?;
            grad_scratch = grad_old_scratch;
        }

        // Tail of the chain: scratch started as prev[0] + next_divided[d-1].
        grad_next_divided[depth_index - 1] = grad_next_divided[depth_index - 1].add(&grad_scratch)?;
        grad_prev[0] = grad_prev[0].add(&grad_scratch)?;
    }

    // Collapse the divided-copy gradients onto next.
    for (i, grad_divided) in grad_next_divided.iter().enumerate() {
        grad_next = grad_next.add(&grad_divided.affine(reciprocals[i], 0.0)?)?;
    }
    Ok(grad_next)
}

/// `arg1 <- arg1 ⊗ arg2` (or `arg2 ⊗ arg1` when `inverse`), both elements
/// carrying an implicit scalar grade of 1.
///
/// Grades are processed top-down so each target grade reads only
/// not-yet-updated lower grades of `arg1`.
pub fn mult(arg1: &mut [Tensor], arg2: &[Tensor], inverse: bool) -> Result<()> {
    let depth = arg1.len();
    for depth_index in (0..depth).rev() {
        let mut at_depth = arg1[depth_index].clone();
        for j in 0..depth_index {
            let k = depth_index - 1 - j;
            let raised = if inverse {
                arg2[j].outer(&arg1[k])?
            } else {
                arg1[j].outer(&arg2[k])?
            };
            at_depth = at_depth.add(&raised)?;
        }
        arg1[depth_index] = at_depth.add(&arg2[depth_index])?;
    }
    Ok(())
}

/// Backward of [`mult`] with `inverse == false`, as used by signature-combine.
///
/// `grad_arg1` arrives holding the gradient on the product and leaves holding
/// the gradient on `arg1`; the gradient on `arg2` accumulates into
/// `grad_arg2`. Grades ascend so each grade's product gradient is consumed
/// before lower grades receive their read contributions.
pub fn mult_backward(
    grad_arg1: &mut [Tensor],
    grad_arg2: &mut [Tensor],
    arg1: &[Tensor],
    arg2: &[Tensor],
) -> Result<()> {
    let depth = arg1.len();
    for depth_index in 0..depth {
        let grad_at_depth = grad_arg1[depth_index].clone();
        grad_arg2[depth_index] = grad_arg2[depth_index].add(&grad_at_depth)?;
        for j in (0..depth_index).rev() {
            let k = depth_index - 1 - j;
            grad_arg1[j] = grad_arg1[j].add(&grad_at_depth.contract_right(&arg2[k])?)?;
            grad_arg2[k] = grad_arg2[k].add(&grad_at_depth.contract_left(&arg1[j])?)?;
        }
    }
    Ok(())
}

/// Variant of [`mult`] for power-series evaluation: `arg2`'s scalar grade is
/// `scalar_term_value` instead of 1, `arg1`'s scalar grade is 0 (so every
/// target grade is rebuilt rather than accumulated), and the top
/// `top_terms_to_skip` grades are left untouched.
pub fn mult_partial(
    arg1: &mut [Tensor],
    arg2: &[Tensor],
    scalar_term_value: f64,
    top_terms_to_skip: usize,
) -> Result<()> {
    let depth = arg1.len();
    for depth_index in (0..depth - top_terms_to_skip).rev() {
        let mut at_depth = arg2[depth_index].affine(scalar_term_value, 0.0)?;
        for j in 0..depth_index {
            let k = depth_index - 1 - j;
            at_depth = at_depth.add(&arg1[j].outer(&arg2[k])?)?;
        }
        arg1[depth_index] = at_depth;
    }
    Ok(())
}

/// Backward of [`mult_partial`]. Mirrors [`mult_backward`] but scales the
/// scalar-grade contribution and zeroes each consumed grade gradient, since
/// the forward overwrote rather than accumulated.
pub fn mult_partial_backward(
    grad_arg1: &mut [Tensor],
    grad_arg2: &mut [Tensor],
    arg1: &[Tensor],
    arg2: &[Tensor],
    scalar_term_value: f64,
    top_terms_to_skip: usize,
) -> Result<()> {
    let depth = arg1.len();
    for depth_index in 0..depth - top_terms_to_skip {
        let grad_at_depth = grad_arg1[depth_index].clone();
        grad_arg2[depth_index] =
            grad_arg2[depth_index].add(&grad_at_depth.affine(scalar_term_value, 0.0)?)?;
        for j in (0..depth_index).rev() {
            let k = depth_index - 1 - j;
            grad_arg1[j] = grad_arg1[j].add(&grad_at_depth.contract_right(&arg2[k])?)?;
            grad_arg2[k] = grad_arg2[k].add(&grad_at_depth.contract_left(&arg1[j])?)?;
        }
        grad_arg1[depth_index] = grad_arg1[depth_index].zeros_like()?;
    }
    Ok(())
}

fn divide_by_reciprocals(next: &Tensor, reciprocals: &[f64]) -> Result<Vec<Tensor>> {
    reciprocals
        .iter()
        .map(|&reciprocal| Ok(next.affine(reciprocal, 0.0)?))
        .collect()
}
