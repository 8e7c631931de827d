//! Logical kernels and their launch geometry.

pub mod analysis;
pub mod invocation;
pub mod ndrange;

pub use analysis::{AffineAnalysis, ArgAccess, ArgRegions, ArgSpec, Footprint, KernelAnalysis};
pub use invocation::{body, InvocationArg, KernelBody, KernelInvocation};
pub use ndrange::NdRange;

use crate::coherence::{AccessSet, Buffer, CombineWrite};
use crate::error::{Error, Result};
use crate::scheduler::SubKernelSchedInfo;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static KERNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity used to key scheduling state and cycle slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(u64);

impl KernelId {
    fn next() -> Self {
        KernelId(KERNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub enum KernelArg {
    Buffer(Buffer),
    Scalar(Vec<u8>),
}

impl KernelArg {
    pub fn scalar_u32(value: u32) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }

    pub fn scalar_f32(value: f32) -> Self {
        KernelArg::Scalar(value.to_le_bytes().to_vec())
    }
}

impl fmt::Debug for KernelArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelArg::Buffer(b) => write!(f, "Buffer({:?})", b.id()),
            KernelArg::Scalar(bytes) => write!(f, "Scalar({} bytes)", bytes.len()),
        }
    }
}

struct KernelInner {
    id: KernelId,
    name: String,
    analysis: Arc<dyn KernelAnalysis>,
    body: KernelBody,
    args: Mutex<Vec<Option<KernelArg>>>,
    sched: Mutex<SubKernelSchedInfo>,
}

/// A logical kernel: body, analysis descriptor, argument table and the
/// scheduling state that lives as long as the kernel does.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub fn new<S: Into<String>>(
        name: S,
        analysis: Arc<dyn KernelAnalysis>,
        body: KernelBody,
    ) -> Self {
        let num_args = analysis.num_args();
        Self {
            inner: Arc::new(KernelInner {
                id: KernelId::next(),
                name: name.into(),
                analysis,
                body,
                args: Mutex::new(vec![None; num_args]),
                sched: Mutex::new(SubKernelSchedInfo::default()),
            }),
        }
    }

    pub fn id(&self) -> KernelId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn analysis(&self) -> &dyn KernelAnalysis {
        self.inner.analysis.as_ref()
    }

    pub fn body(&self) -> &KernelBody {
        &self.inner.body
    }

    pub fn retain(&self) -> Kernel {
        self.clone()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn set_arg(&self, index: usize, arg: KernelArg) -> Result<()> {
        let analysis = self.analysis();
        if index >= analysis.num_args() {
            return Err(Error::invalid(format!(
                "kernel '{}' has {} arguments, got index {}",
                self.name(),
                analysis.num_args(),
                index
            )));
        }
        let global = analysis.is_global(index);
        match (&arg, global) {
            (KernelArg::Buffer(_), true) | (KernelArg::Scalar(_), false) => {}
            (KernelArg::Buffer(_), false) => {
                return Err(Error::invalid(format!("argument {} expects a scalar", index)))
            }
            (KernelArg::Scalar(_), true) => {
                return Err(Error::invalid(format!("argument {} expects a buffer", index)))
            }
        }
        self.inner.args.lock()[index] = Some(arg);
        Ok(())
    }

    /// Snapshot of the argument table; fails if any argument is unset.
    /// Every argument, once all are set. A buffer may back only one
    /// argument: each gets its own mutable replica during a launch.
    pub fn bound_args(&self) -> Result<Vec<KernelArg>> {
        let args = self.inner.args.lock();
        analysis::check_arity(self.analysis(), args.len())?;
        let bound = args
            .iter()
            .enumerate()
            .map(|(i, a)| {
                a.clone()
                    .ok_or_else(|| Error::invalid(format!("argument {} of '{}' not set", i, self.name())))
            })
            .collect::<Result<Vec<_>>>()?;

        let buffers: Vec<(usize, &Buffer)> = bound
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match a {
                KernelArg::Buffer(b) => Some((i, b)),
                KernelArg::Scalar(_) => None,
            })
            .collect();
        for (n, (i, a)) in buffers.iter().enumerate() {
            if let Some((j, _)) = buffers[n + 1..].iter().find(|(_, b)| a.same(b)) {
                return Err(Error::invalid(format!(
                    "arguments {} and {} of '{}' bind the same buffer",
                    i,
                    j,
                    self.name()
                )));
            }
        }
        Ok(bound)
    }

    /// Regions each buffer argument needs and produces when running `range`.
    pub fn access(&self, args: &[KernelArg], range: &NdRange) -> AccessSet {
        let mut set = AccessSet::default();
        for (index, arg) in args.iter().enumerate() {
            let buffer = match arg {
                KernelArg::Buffer(b) => b,
                KernelArg::Scalar(_) => continue,
            };
            let regions = self.analysis().regions(index, range, buffer.size());
            if !regions.read.is_empty() {
                set.require(buffer, regions.read);
            }
            if !regions.written.is_empty() {
                set.write(buffer, regions.written);
            }
            if let Some((op, elem, region)) = regions.combine {
                set.combine.push(CombineWrite {
                    buffer: buffer.clone(),
                    op,
                    elem,
                    region,
                });
            }
        }
        set
    }

    pub fn sched_info(&self) -> MutexGuard<'_, SubKernelSchedInfo> {
        self.inner.sched.lock()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
