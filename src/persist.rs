//! Legacy binary model format.
//!
//! Layout, all little-endian:
//!
//! ```text
//! version:    i32            (= 1)
//! count:      i32            number of sizes, input included
//! sizes:      i32[count]
//! per non-input layer, in order:
//!   biases:   f32[neurons]
//!   weights:  f32[neurons * inputs]   row-major by neuron
//! ```
//!
//! There is no checksum and no record of activations or layer kinds; loaded
//! networks are deterministic sigmoid throughout.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::network::Network;

pub const FORMAT_VERSION: i32 = 1;

pub fn save<W: Write>(net: &Network, mut writer: W) -> Result<()> {
    let sizes = net.config().sizes();
    write_i32(&mut writer, FORMAT_VERSION)?;
    write_i32(&mut writer, to_i32(sizes.len())?)?;
    for &size in sizes {
        write_i32(&mut writer, to_i32(size)?)?;
    }
    for l in 0..net.num_layers() {
        for &v in net.biases(l).iter().chain(net.weights(l).iter()) {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn load<R: Read>(mut reader: R) -> Result<Network> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    let mut cursor = Cursor { bytes: &bytes, pos: 0 };

    let version = cursor.i32("version")?;
    if version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported version {version}; expected {FORMAT_VERSION}"
        )));
    }
    let count = cursor.i32("layer count")?;
    if count < 2 {
        return Err(Error::Format(format!(
            "layer count must be >= 2, got {count}"
        )));
    }
    let mut sizes = Vec::with_capacity((count as usize).min(cursor.remaining() / 4));
    for i in 0..count {
        let size = cursor.i32("layer size")?;
        if size <= 0 {
            return Err(Error::Format(format!("layer {i} has size {size}")));
        }
        sizes.push(size as usize);
    }

    let config = NetworkConfig::new(&sizes).map_err(|e| Error::Format(e.to_string()))?;
    let mut params = Vec::with_capacity(config.num_layers());
    for (neurons, inputs) in config.layer_shapes() {
        let biases = cursor.f32s(neurons, "biases")?;
        let weights = cursor.f32s(neurons * inputs, "weights")?;
        params.push((biases, weights));
    }
    if cursor.remaining() != 0 {
        return Err(Error::Format(format!(
            "{} trailing bytes after the last layer",
            cursor.remaining()
        )));
    }

    debug!(sizes = ?config.sizes(), "loaded binary model");
    Network::from_parameters(config, params).map_err(|e| Error::Format(e.to_string()))
}

pub fn save_file<P: AsRef<Path>>(net: &Network, path: P) -> Result<()> {
    let path = path.as_ref();
    save(net, BufWriter::new(File::create(path)?))?;
    debug!(path = %path.display(), "saved binary model");
    Ok(())
}

pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Network> {
    load(BufReader::new(File::open(path)?))
}

fn to_i32(v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::Format(format!("size {v} does not fit in i32")))
}

fn write_i32<W: Write>(writer: &mut W, v: i32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&[u8]> {
        if self.remaining() < len {
            return Err(Error::Format(format!(
                "truncated while reading {what}: need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, what)?);
        Ok(i32::from_le_bytes(buf))
    }

    fn f32s(&mut self, n: usize, what: &str) -> Result<Vec<f32>> {
        let len = n
            .checked_mul(4)
            .ok_or_else(|| Error::Format(format!("{what} length overflow")))?;
        let raw = self.take(len, what)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
