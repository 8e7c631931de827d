use crate::error::{Error, Result};
use std::ops::Range;

/// An N-dimensional launch range (1 to 3 dimensions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdRange {
    work_dim: usize,
    offset: [u64; 3],
    global: [u64; 3],
    local: Option<[u64; 3]>,
}

impl NdRange {
    pub fn new(
        work_dim: usize,
        offset: &[u64],
        global: &[u64],
        local: Option<&[u64]>,
    ) -> Result<Self> {
        if !(1..=3).contains(&work_dim) {
            return Err(Error::invalid(format!("work_dim {} not in 1..=3", work_dim)));
        }
        if global.len() != work_dim || (!offset.is_empty() && offset.len() != work_dim) {
            return Err(Error::invalid("range arrays must have work_dim entries"));
        }

        let mut range = NdRange {
            work_dim,
            offset: [0; 3],
            global: [1; 3],
            local: None,
        };
        range.global[..work_dim].copy_from_slice(global);
        if !offset.is_empty() {
            range.offset[..work_dim].copy_from_slice(offset);
        }

        if let Some(local) = local {
            if local.len() != work_dim {
                return Err(Error::invalid("local size must have work_dim entries"));
            }
            let mut l = [1; 3];
            l[..work_dim].copy_from_slice(local);
            for d in 0..work_dim {
                if l[d] == 0 || range.global[d] % l[d] != 0 {
                    return Err(Error::invalid(format!(
                        "local size {} does not divide global size {} in dimension {}",
                        l[d], range.global[d], d
                    )));
                }
            }
            range.local = Some(l);
        }

        Ok(range)
    }

    /// One-dimensional range of `items` starting at zero.
    pub fn linear(items: u64) -> Self {
        NdRange {
            work_dim: 1,
            offset: [0; 3],
            global: [items, 1, 1],
            local: None,
        }
    }

    pub fn with_local(mut self, local0: u64) -> Result<Self> {
        if local0 == 0 || self.global[0] % local0 != 0 {
            return Err(Error::invalid(format!(
                "local size {} does not divide {}",
                local0, self.global[0]
            )));
        }
        let mut l = self.local.unwrap_or([1; 3]);
        l[0] = local0;
        self.local = Some(l);
        Ok(self)
    }

    pub fn work_dim(&self) -> usize {
        self.work_dim
    }

    pub fn offset(&self) -> &[u64] {
        &self.offset[..self.work_dim]
    }

    pub fn global(&self) -> &[u64] {
        &self.global[..self.work_dim]
    }

    pub fn local(&self) -> Option<&[u64]> {
        self.local.as_ref().map(|l| &l[..self.work_dim])
    }

    pub fn total_items(&self) -> u64 {
        self.global.iter().product()
    }

    /// Global indices covered along dimension 0.
    pub fn dim0(&self) -> Range<u64> {
        self.offset[0]..self.offset[0] + self.global[0]
    }

    fn group0(&self) -> u64 {
        self.local.map(|l| l[0]).unwrap_or(1)
    }

    /// Work-groups along dimension 0, the unit of splitting.
    pub fn groups0(&self) -> u64 {
        self.global[0] / self.group0()
    }

    fn slab(&self, first_group: u64, groups: u64) -> NdRange {
        let g = self.group0();
        let mut sub = self.clone();
        sub.offset[0] = self.offset[0] + first_group * g;
        sub.global[0] = groups * g;
        sub
    }

    /// Splits along dimension 0 at work-group boundaries.
    ///
    /// Each `(device, share)` entry gets `round(share * groups)` groups, the
    /// last device with a non-zero share takes whatever remains. Devices that
    /// end up with no groups are left out of the result.
    pub fn split(&self, shares: &[(usize, f64)]) -> Vec<(usize, NdRange)> {
        let groups = self.groups0();
        let last_active = shares.iter().rposition(|&(_, s)| s > 0.0);
        let last_active = match last_active {
            Some(idx) => idx,
            None => {
                return shares
                    .first()
                    .map(|&(d, _)| vec![(d, self.clone())])
                    .unwrap_or_default();
            }
        };

        let mut out = Vec::with_capacity(shares.len());
        let mut next = 0u64;
        for (idx, &(device, share)) in shares.iter().enumerate() {
            let remaining = groups - next;
            let n = if idx == last_active {
                remaining
            } else if idx > last_active {
                0
            } else {
                ((share.max(0.0) * groups as f64).round() as u64).min(remaining)
            };
            if n > 0 {
                out.push((device, self.slab(next, n)));
                next += n;
            }
        }
        out
    }
}
