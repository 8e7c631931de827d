//! Argument footprints of a kernel.
//!
//! The runtime never inspects kernel code. It asks a [`KernelAnalysis`] which
//! arguments are global buffers and which bytes of them a given sub-range
//! reads and writes.

use super::NdRange;
use crate::coherence::{CombineOp, ElemType, IntervalSet};
use crate::error::{Error, Result};
use std::fmt;

/// Byte regions one argument touches for one sub-range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgRegions {
    pub read: IntervalSet,
    pub written: IntervalSet,
    pub combine: Option<(CombineOp, ElemType, IntervalSet)>,
}

pub trait KernelAnalysis: Send + Sync + fmt::Debug {
    fn num_args(&self) -> usize;

    /// Whether argument `arg` is a buffer handle rather than a scalar.
    fn is_global(&self, arg: usize) -> bool;

    fn regions(&self, arg: usize, range: &NdRange, buffer_size: u64) -> ArgRegions;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgAccess {
    Read,
    Write,
    ReadWrite,
    Combine(CombineOp, ElemType),
}

/// How work-items along dimension 0 map onto bytes of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Footprint {
    /// Every item may touch the whole buffer.
    Whole,
    /// Row `i` covers elements `[i * per_item, (i + 1) * per_item)`.
    Linear { elem_size: u64, per_item: u64 },
    /// Like `Linear`, with reads extended by `halo` elements on both sides.
    Stencil {
        elem_size: u64,
        per_item: u64,
        halo: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgSpec {
    Scalar,
    Global { access: ArgAccess, footprint: Footprint },
}

/// Analysis built from per-argument affine descriptors.
#[derive(Debug, Clone, Default)]
pub struct AffineAnalysis {
    args: Vec<ArgSpec>,
}

impl AffineAnalysis {
    pub fn new(args: Vec<ArgSpec>) -> Self {
        Self { args }
    }

    pub fn builder() -> AffineAnalysisBuilder {
        AffineAnalysisBuilder { args: Vec::new() }
    }

    pub fn spec(&self, arg: usize) -> Option<&ArgSpec> {
        self.args.get(arg)
    }
}

#[derive(Debug)]
pub struct AffineAnalysisBuilder {
    args: Vec<ArgSpec>,
}

impl AffineAnalysisBuilder {
    pub fn scalar(mut self) -> Self {
        self.args.push(ArgSpec::Scalar);
        self
    }

    pub fn global(mut self, access: ArgAccess, footprint: Footprint) -> Self {
        self.args.push(ArgSpec::Global { access, footprint });
        self
    }

    pub fn build(self) -> AffineAnalysis {
        AffineAnalysis { args: self.args }
    }
}

fn footprint_bytes(footprint: Footprint, range: &NdRange, size: u64, widen: bool) -> IntervalSet {
    let rows = range.dim0();
    let (start, end) = match footprint {
        Footprint::Whole => (0, size),
        Footprint::Linear {
            elem_size,
            per_item,
        } => {
            let stride = elem_size.saturating_mul(per_item);
            (
                rows.start.saturating_mul(stride),
                rows.end.saturating_mul(stride),
            )
        }
        Footprint::Stencil {
            elem_size,
            per_item,
            halo,
        } => {
            let stride = elem_size.saturating_mul(per_item);
            let pad = if widen { halo.saturating_mul(elem_size) } else { 0 };
            (
                rows.start.saturating_mul(stride).saturating_sub(pad),
                rows.end.saturating_mul(stride).saturating_add(pad),
            )
        }
    };
    IntervalSet::from_range(start.min(size)..end.min(size))
}

impl KernelAnalysis for AffineAnalysis {
    fn num_args(&self) -> usize {
        self.args.len()
    }

    fn is_global(&self, arg: usize) -> bool {
        matches!(self.args.get(arg), Some(ArgSpec::Global { .. }))
    }

    fn regions(&self, arg: usize, range: &NdRange, buffer_size: u64) -> ArgRegions {
        let (access, footprint) = match self.args.get(arg) {
            Some(ArgSpec::Global { access, footprint }) => (*access, *footprint),
            _ => return ArgRegions::default(),
        };

        let reads = || footprint_bytes(footprint, range, buffer_size, true);
        let writes = || footprint_bytes(footprint, range, buffer_size, false);

        match access {
            ArgAccess::Read => ArgRegions {
                read: reads(),
                ..Default::default()
            },
            ArgAccess::Write => ArgRegions {
                written: writes(),
                ..Default::default()
            },
            ArgAccess::ReadWrite => ArgRegions {
                read: reads(),
                written: writes(),
                combine: None,
            },
            // atomics read-modify-write, so the device needs the current value too
            ArgAccess::Combine(op, elem) => {
                let region = writes();
                ArgRegions {
                    read: region.clone(),
                    written: IntervalSet::new(),
                    combine: Some((op, elem, region)),
                }
            }
        }
    }
}

pub(crate) fn check_arity(analysis: &dyn KernelAnalysis, bound: usize) -> Result<()> {
    if analysis.num_args() != bound {
        return Err(Error::invalid(format!(
            "kernel expects {} arguments, {} bound",
            analysis.num_args(),
            bound
        )));
    }
    Ok(())
}
