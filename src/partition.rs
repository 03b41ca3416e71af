//! Static division of the atom index range across devices.

use std::{num::NonZeroUsize, ops::Range};

/// A contiguous run of atoms owned by one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AtomRange {
    pub first: usize,
    pub count: usize,
}

impl AtomRange {
    pub fn end(&self) -> usize {
        self.first + self.count
    }

    pub fn as_range(&self) -> Range<usize> {
        self.first..self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Maps device ordinal → owned atom range. Computed once; immutable for the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    natoms: usize,
    ranges: Vec<AtomRange>,
}

impl Partition {
    /// `chunk = N / D`. Devices `0..D-1` own `chunk` atoms each; the last device owns the rest.
    pub fn new(natoms: usize, ndevices: NonZeroUsize) -> Self {
        let ndevices = ndevices.get();
        let chunk = natoms / ndevices;

        let mut ranges = Vec::with_capacity(ndevices);
        for i in 0..ndevices - 1 {
            ranges.push(AtomRange {
                first: i * chunk,
                count: chunk,
            });
        }
        let first = (ndevices - 1) * chunk;
        ranges.push(AtomRange {
            first,
            count: natoms - first,
        });

        Self { natoms, ranges }
    }

    pub fn natoms(&self) -> usize {
        self.natoms
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Panics if `ordinal` is out of range; ordinals come from the device arena.
    pub fn range(&self, ordinal: usize) -> AtomRange {
        self.ranges[ordinal]
    }

    pub fn ranges(&self) -> &[AtomRange] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn three_devices_ten_atoms() {
        let p = Partition::new(10, nz(3));
        let got: Vec<_> = p.ranges().iter().map(|r| r.as_range()).collect();
        assert_eq!(got, vec![0..3, 3..6, 6..10]);
    }

    #[test]
    fn single_device_owns_everything() {
        let p = Partition::new(108, nz(1));
        assert_eq!(p.range(0), AtomRange { first: 0, count: 108 });
    }

    #[test]
    fn more_devices_than_atoms() {
        let p = Partition::new(2, nz(4));
        assert!(p.range(0).is_empty());
        assert!(p.range(2).is_empty());
        assert_eq!(p.range(3).as_range(), 0..2);
    }

    #[test]
    fn ranges_tile_the_atom_range() {
        for natoms in 0..60 {
            for ndev in 1..9 {
                let p = Partition::new(natoms, nz(ndev));
                assert_eq!(p.len(), ndev);

                let mut next = 0;
                for r in p.ranges() {
                    assert_eq!(r.first, next, "gap or overlap at N={natoms} D={ndev}");
                    next = r.end();
                }
                assert_eq!(next, natoms);
            }
        }
    }
}
