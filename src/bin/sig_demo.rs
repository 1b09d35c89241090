//! Minimal signature demo binary
//!
//! Purpose: provide an easy-to-build executable (CPU by default).
//! Build: cargo build --release --bin sig_demo

use anyhow::Result;
use candle_core::{Device, Tensor};
use sigrustcandle::{signature_channels, signature_forward};

fn main() -> Result<()> {
    let dev = Device::Cpu;

    // A unit step right then a unit step up: [N=3, B=1, C=2]
    let path = Tensor::from_slice(&[0.0f64, 0.0, 1.0, 0.0, 1.0, 1.0], (3, 1, 2), &dev)?;
    let depth = 2usize;

    let (sig, _) = signature_forward(&path, depth, false, None, false, None)?;
    let values = sig.squeeze(0)?.to_vec1::<f64>()?;
    println!(
        "signature of an L-shaped path, depth {depth} ({} channels):",
        signature_channels(2, depth)
    );
    for (i, value) in values.iter().enumerate() {
        println!("w={i}: {value:.4}");
    }

    // Stream mode exposes every prefix signature.
    let (stream_sig, _) = signature_forward(&path, depth, true, None, false, None)?;
    println!("prefix signatures have shape {:?}", stream_sig.dims());
    Ok(())
}
