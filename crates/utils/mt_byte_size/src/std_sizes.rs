//! Implement [`SizeBytes`] for things in the standard library.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::{SizeBytes, heap_of_items};

macro_rules! impl_size_bytes_pod {
    ($ty:ty) => {
        impl SizeBytes for $ty {
            #[inline]
            fn heap_size_bytes(&self) -> u64 {
                0
            }
        }
    };
    ($ty:ty, $($rest:ty),+) => {
        impl_size_bytes_pod!($ty); impl_size_bytes_pod!($($rest),+);
    };
}

impl_size_bytes_pod!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char, ()
);

impl SizeBytes for &'static str {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        0
    }
}

impl SizeBytes for String {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.capacity() as u64
    }
}

impl SizeBytes for std::path::PathBuf {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.capacity() as u64
    }
}

impl<T: SizeBytes> SizeBytes for Vec<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        heap_of_items(self.iter(), self.capacity())
    }
}

impl<T: SizeBytes> SizeBytes for VecDeque<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        heap_of_items(self.iter(), self.capacity())
    }
}

impl<T: SizeBytes> SizeBytes for Box<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        (**self).total_size_bytes()
    }
}

/// The whole pointee is counted, even if other clones of the [`Arc`] exist.
impl<T: SizeBytes> SizeBytes for Arc<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        (**self).total_size_bytes()
    }
}

impl<T: SizeBytes> SizeBytes for Option<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.as_ref().map_or(0, SizeBytes::heap_size_bytes)
    }
}

impl<T: SizeBytes, E: SizeBytes> SizeBytes for Result<T, E> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        match self {
            Ok(value) => value.heap_size_bytes(),
            Err(err) => err.heap_size_bytes(),
        }
    }
}

impl<T: SizeBytes, const N: usize> SizeBytes for [T; N] {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.iter().map(SizeBytes::heap_size_bytes).sum()
    }
}

impl<A: SizeBytes, B: SizeBytes> SizeBytes for (A, B) {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.0.heap_size_bytes() + self.1.heap_size_bytes()
    }
}

impl<A: SizeBytes, B: SizeBytes, C: SizeBytes> SizeBytes for (A, B, C) {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.0.heap_size_bytes() + self.1.heap_size_bytes() + self.2.heap_size_bytes()
    }
}

// Hash maps allocate roughly one slot per unit of capacity, plus a control byte.
impl<K: SizeBytes, V: SizeBytes, S> SizeBytes for HashMap<K, V, S> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        let slot = (std::mem::size_of::<(K, V)>() + 1) as u64;
        let items: u64 = self
            .iter()
            .map(|(k, v)| k.heap_size_bytes() + v.heap_size_bytes())
            .sum();
        self.capacity() as u64 * slot + items
    }
}

impl<T: SizeBytes, S> SizeBytes for HashSet<T, S> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        let slot = (std::mem::size_of::<T>() + 1) as u64;
        let items: u64 = self.iter().map(SizeBytes::heap_size_bytes).sum();
        self.capacity() as u64 * slot + items
    }
}

// B-trees don't expose capacity, so this only counts the entries themselves.
impl<K: SizeBytes, V: SizeBytes> SizeBytes for BTreeMap<K, V> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.iter()
            .map(|(k, v)| k.total_size_bytes() + v.total_size_bytes())
            .sum()
    }
}

impl<T: SizeBytes> SizeBytes for BTreeSet<T> {
    #[inline]
    fn heap_size_bytes(&self) -> u64 {
        self.iter().map(SizeBytes::total_size_bytes).sum()
    }
}
