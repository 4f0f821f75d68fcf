//! Checkpoint Byte Layout
//!
//! A checkpoint is the concatenation of every layer's parameter blocks in
//! network order. There is no header, no version and no length prefix, so a
//! reader must rebuild the exact same architecture before loading.
//!
//! Every value is an `f64` written in little-endian byte order:
//!
//! ```text
//! Conv2D:      out × (in·k·k) weights, out biases
//! LinearLayer: in·out weights, out biases
//! BatchNorm2D: C gamma, C beta, C running mean, C running variance
//! ReLU, MaxPool2D, Dropout: nothing
//! ```
//!
//! A stream that ends early surfaces as an `UnexpectedEof` I/O error.

use std::io::{self, Read, Write};

/// Write a block of values
pub fn write_f64_slice(writer: &mut dyn Write, values: &[f64]) -> io::Result<()> {
    for &val in values {
        writer.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Fill `values` from the stream
pub fn read_f64_slice(reader: &mut dyn Read, values: &mut [f64]) -> io::Result<()> {
    let mut bytes = [0u8; 8];
    for val in values.iter_mut() {
        reader.read_exact(&mut bytes)?;
        *val = f64::from_le_bytes(bytes);
    }
    Ok(())
}
