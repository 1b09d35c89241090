//! Analytical tests for the signature transform: exact small-case values,
//! the channel-count formula, and the basepoint/inverse equivalences.

use anyhow::Result;
use candle_core::{Device, Tensor};
use sigrustcandle::{signature_channels, signature_forward};

fn path3(data: &[f64], shape: (usize, usize, usize), dev: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(data, shape, dev)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    Ok(a.sub(b)?.abs()?.max_all()?.to_scalar::<f64>()?)
}

fn reverse_stream(path: &Tensor) -> Result<Tensor> {
    let stream_size = path.dims3()?.0;
    let rows = (0..stream_size)
        .rev()
        .map(|index| path.narrow(0, index, 1))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rows.iter().collect::<Vec<_>>(), 0)?)
}

#[test]
fn channel_count_formula() {
    assert_eq!(signature_channels(2, 2), 6);
    assert_eq!(signature_channels(3, 4), 120);
    assert_eq!(signature_channels(5, 1), 5);
    // One channel degenerates to one term per depth.
    assert_eq!(signature_channels(1, 7), 7);
}

#[test]
fn l_shaped_path_depth_two() -> Result<()> {
    let dev = Device::Cpu;
    // Unit step right, then unit step up.
    let path = path3(&[0.0, 0.0, 1.0, 0.0, 1.0, 1.0], (3, 1, 2), &dev)?;
    let (sig, increments) = signature_forward(&path, 2, false, None, false, None)?;
    assert_eq!(sig.dims(), &[1, 6]);
    assert_eq!(
        increments.to_vec3::<f64>()?,
        vec![vec![vec![1.0, 0.0]], vec![vec![0.0, 1.0]]]
    );

    let expected = Tensor::from_slice(&[1.0f64, 1.0, 0.5, 1.0, 0.0, 0.5], (1, 6), &dev)?;
    assert!(max_abs_diff(&sig, &expected)? < 1e-10);
    Ok(())
}

#[test]
fn l_shaped_path_inverse() -> Result<()> {
    let dev = Device::Cpu;
    let path = path3(&[0.0, 0.0, 1.0, 0.0, 1.0, 1.0], (3, 1, 2), &dev)?;
    let (sig, _) = signature_forward(&path, 2, false, None, true, None)?;

    let expected = Tensor::from_slice(&[-1.0f64, -1.0, 0.5, 0.0, 1.0, 0.5], (1, 6), &dev)?;
    assert!(max_abs_diff(&sig, &expected)? < 1e-10);

    // The inverse flag computes the signature of the time-reversed path.
    let (reversed_sig, _) = signature_forward(&reverse_stream(&path)?, 2, false, None, false, None)?;
    assert!(max_abs_diff(&sig, &reversed_sig)? < 1e-10);
    Ok(())
}

#[test]
fn one_channel_matches_scalar_exponential() -> Result<()> {
    let dev = Device::Cpu;
    // A single increment of 2 in one channel: term k is 2^k / k!.
    let path = path3(&[0.0, 2.0], (2, 1, 1), &dev)?;
    let (sig, _) = signature_forward(&path, 3, false, None, false, None)?;
    let expected = Tensor::from_slice(&[2.0f64, 2.0, 4.0 / 3.0], (1, 3), &dev)?;
    assert!(max_abs_diff(&sig, &expected)? < 1e-10);
    Ok(())
}

#[test]
fn depth_one_is_total_displacement() -> Result<()> {
    let dev = Device::Cpu;
    let path = Tensor::rand(0.0f64, 1.0, (7, 3, 4), &dev)?;
    let (sig, _) = signature_forward(&path, 1, false, None, false, None)?;
    let displacement = path.narrow(0, 6, 1)?.sub(&path.narrow(0, 0, 1)?)?.squeeze(0)?;
    assert!(max_abs_diff(&sig, &displacement)? < 1e-12);
    Ok(())
}

#[test]
fn basepoint_equals_prepended_point() -> Result<()> {
    let dev = Device::Cpu;
    let path = Tensor::rand(0.0f64, 1.0, (6, 2, 3), &dev)?;
    let (full_sig, _) = signature_forward(&path, 3, false, None, false, None)?;

    let tail = path.narrow(0, 1, 5)?;
    let basepoint = path.narrow(0, 0, 1)?.squeeze(0)?;
    let (based_sig, _) = signature_forward(&tail, 3, false, Some(&basepoint), false, None)?;
    assert!(max_abs_diff(&full_sig, &based_sig)? < 1e-10);
    Ok(())
}

#[test]
fn basepoint_with_inverse() -> Result<()> {
    let dev = Device::Cpu;
    let path = Tensor::rand(0.0f64, 1.0, (5, 2, 2), &dev)?;
    let tail = path.narrow(0, 1, 4)?;
    let basepoint = path.narrow(0, 0, 1)?.squeeze(0)?;

    let (based_inverse, _) = signature_forward(&tail, 2, false, Some(&basepoint), true, None)?;
    let (reversed, _) = signature_forward(&reverse_stream(&path)?, 2, false, None, false, None)?;
    assert!(max_abs_diff(&based_inverse, &reversed)? < 1e-10);
    Ok(())
}
