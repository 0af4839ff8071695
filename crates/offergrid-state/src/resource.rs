//! The cpu/mem/disk value object shared by offers, versions and accounting.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};

use serde::{Deserialize, Serialize};

/// A bundle of schedulable resources. Memory and disk are in MB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
}

impl Resource {
    pub const ZERO: Resource = Resource {
        cpus: 0.0,
        mem: 0.0,
        disk: 0.0,
    };

    pub fn new(cpus: f64, mem: f64, disk: f64) -> Self {
        Self { cpus, mem, disk }
    }

    /// True when every dimension of `need` fits inside `self`.
    pub fn fits(&self, need: &Resource) -> bool {
        need.cpus <= self.cpus && need.mem <= self.mem && need.disk <= self.disk
    }

    pub fn is_zero(&self) -> bool {
        self.cpus == 0.0 && self.mem == 0.0 && self.disk == 0.0
    }

    /// Subtraction that floors every dimension at zero.
    pub fn saturating_sub(&self, other: &Resource) -> Resource {
        Resource {
            cpus: (self.cpus - other.cpus).max(0.0),
            mem: (self.mem - other.mem).max(0.0),
            disk: (self.disk - other.disk).max(0.0),
        }
    }
}

impl Add for Resource {
    type Output = Resource;

    fn add(self, rhs: Resource) -> Resource {
        Resource {
            cpus: self.cpus + rhs.cpus,
            mem: self.mem + rhs.mem,
            disk: self.disk + rhs.disk,
        }
    }
}

impl AddAssign for Resource {
    fn add_assign(&mut self, rhs: Resource) {
        self.cpus += rhs.cpus;
        self.mem += rhs.mem;
        self.disk += rhs.disk;
    }
}

impl Sub for Resource {
    type Output = Resource;

    fn sub(self, rhs: Resource) -> Resource {
        Resource {
            cpus: self.cpus - rhs.cpus,
            mem: self.mem - rhs.mem,
            disk: self.disk - rhs.disk,
        }
    }
}

impl Sum for Resource {
    fn sum<I: Iterator<Item = Resource>>(iter: I) -> Resource {
        iter.fold(Resource::ZERO, |acc, r| acc + r)
    }
}

impl<'a> Sum<&'a Resource> for Resource {
    fn sum<I: Iterator<Item = &'a Resource>>(iter: I) -> Resource {
        iter.fold(Resource::ZERO, |acc, r| acc + *r)
    }
}
