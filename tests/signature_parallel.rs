//! Chunked-parallel driver tests: the output must agree with the serial run
//! up to floating-point reduction order, whatever the thread count.

use anyhow::Result;
use candle_core::{Device, Tensor};
use sigrustcandle::signature::signature_forward_with_parallelism;
use sigrustcandle::{max_parallelism, set_max_parallelism};

fn relative_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    let diff = a.sub(b)?.abs()?.max_all()?.to_scalar::<f64>()?;
    let scale = b.abs()?.max_all()?.to_scalar::<f64>()?;
    Ok(diff / (1.0 + scale))
}

#[test]
fn three_chunks_match_serial() -> Result<()> {
    let dev = Device::Cpu;
    let path = Tensor::rand(0.0f64, 1.0, (100, 4, 3), &dev)?;
    let (serial, _) = signature_forward_with_parallelism(&path, 4, false, None, false, None, 1)?;
    let (chunked, _) = signature_forward_with_parallelism(&path, 4, false, None, false, None, 3)?;
    assert_eq!(serial.dims(), chunked.dims());
    assert!(relative_diff(&chunked, &serial)? < 1e-10);
    Ok(())
}

#[test]
fn chunking_respects_inverse() -> Result<()> {
    let dev = Device::Cpu;
    let path = Tensor::rand(0.0f64, 1.0, (60, 2, 2), &dev)?;
    let (serial, _) = signature_forward_with_parallelism(&path, 3, false, None, true, None, 1)?;
    let (chunked, _) = signature_forward_with_parallelism(&path, 3, false, None, true, None, 4)?;
    assert!(relative_diff(&chunked, &serial)? < 1e-10);
    Ok(())
}

#[test]
fn more_threads_than_increments() -> Result<()> {
    let dev = Device::Cpu;
    // Four increments over eight requested threads leaves some chunks empty.
    let path = Tensor::rand(0.0f64, 1.0, (5, 1, 2), &dev)?;
    let (serial, _) = signature_forward_with_parallelism(&path, 2, false, None, false, None, 1)?;
    let (chunked, _) = signature_forward_with_parallelism(&path, 2, false, None, false, None, 8)?;
    assert!(relative_diff(&chunked, &serial)? < 1e-12);
    Ok(())
}

#[test]
fn chunking_composes_with_initial() -> Result<()> {
    let dev = Device::Cpu;
    let first = Tensor::rand(0.0f64, 1.0, (10, 2, 2), &dev)?;
    let (first_sig, _) = signature_forward_with_parallelism(&first, 3, false, None, false, None, 1)?;
    let path = Tensor::rand(0.0f64, 1.0, (40, 2, 2), &dev)?;
    let (serial, _) =
        signature_forward_with_parallelism(&path, 3, false, None, false, Some(&first_sig), 1)?;
    let (chunked, _) =
        signature_forward_with_parallelism(&path, 3, false, None, false, Some(&first_sig), 3)?;
    assert!(relative_diff(&chunked, &serial)? < 1e-10);
    Ok(())
}

#[test]
fn parallelism_ceiling_round_trips() {
    set_max_parallelism(2);
    assert_eq!(max_parallelism(), 2);
    // Zero restores the hardware default.
    set_max_parallelism(0);
    assert!(max_parallelism() >= 1);
}
