//! What a kernel body sees when a device runs it.

use super::NdRange;
use crate::error::{Error, Result};
use std::sync::Arc;

/// The compute function of a kernel, run by backends that execute on the host.
pub type KernelBody = Arc<dyn Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync>;

/// Wraps a closure as a [`KernelBody`], fixing its argument type.
pub fn body<F>(f: F) -> KernelBody
where
    F: Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug)]
pub enum InvocationArg<'a> {
    Buffer(&'a mut [u8]),
    Scalar(&'a [u8]),
}

/// One sub-kernel execution: the sub-range plus the bound replicas.
///
/// Buffers are whole replicas indexed by global offsets, so a body only
/// has to restrict itself to `range()`.
#[derive(Debug)]
pub struct KernelInvocation<'a> {
    range: &'a NdRange,
    args: Vec<InvocationArg<'a>>,
}

impl<'a> KernelInvocation<'a> {
    pub fn new(range: &'a NdRange, args: Vec<InvocationArg<'a>>) -> Self {
        Self { range, args }
    }

    pub fn range(&self) -> &NdRange {
        self.range
    }

    /// Range and arguments at once, for bodies that need several buffers.
    pub fn parts(&mut self) -> (&NdRange, &mut [InvocationArg<'a>]) {
        (self.range, &mut self.args)
    }

    pub fn buffer(&mut self, arg: usize) -> Result<&mut [u8]> {
        match self.args.get_mut(arg) {
            Some(InvocationArg::Buffer(bytes)) => Ok(&mut **bytes),
            Some(InvocationArg::Scalar(_)) => {
                Err(Error::invalid(format!("argument {} is a scalar", arg)))
            }
            None => Err(Error::invalid(format!("no argument {}", arg))),
        }
    }

    pub fn scalar(&self, arg: usize) -> Result<&[u8]> {
        match self.args.get(arg) {
            Some(InvocationArg::Scalar(bytes)) => Ok(*bytes),
            Some(InvocationArg::Buffer(_)) => {
                Err(Error::invalid(format!("argument {} is a buffer", arg)))
            }
            None => Err(Error::invalid(format!("no argument {}", arg))),
        }
    }

    pub fn scalar_u32(&self, arg: usize) -> Result<u32> {
        let bytes = self.scalar(arg)?;
        let raw: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::invalid(format!("argument {} is not 4 bytes", arg)))?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn scalar_f32(&self, arg: usize) -> Result<f32> {
        self.scalar_u32(arg).map(f32::from_bits)
    }
}

#[inline]
pub fn load_f32(bytes: &[u8], idx: usize) -> f32 {
    let at = idx * 4;
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
pub fn store_f32(bytes: &mut [u8], idx: usize, value: f32) {
    bytes[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn load_u32(bytes: &[u8], idx: usize) -> u32 {
    let at = idx * 4;
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[inline]
pub fn store_u32(bytes: &mut [u8], idx: usize, value: u32) {
    bytes[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
}
