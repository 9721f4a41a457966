//! Minimal mirrors of the libc++ containers the dynamic linker keeps its
//! namespace bookkeeping in.
//!
//! Layout contract: LP64 little-endian, libc++ v1 ABI as shipped in the
//! Android platform (12-14). Strings use the classic layout: a short
//! string stores `size << 1` in byte 0 with data following; a long string
//! is `{ capacity | 1, size, data }`. Vectors are three pointers. The
//! unordered map is walked through its intrusive node list only.

use nix::libc;
use std::ffi::c_void;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CxxString {
    repr: [usize; 3],
}

impl CxxString {
    const LONG_FLAG: usize = 1;

    /// Builds a long-form string whose buffer comes from `malloc`, the
    /// allocator the linker's own operator new bottoms out in.
    pub fn new_long(value: &str) -> Self {
        let len = value.len();
        let capacity = (len + 16) & !0xF;

        let data = unsafe {
            let data = libc::malloc(capacity) as *mut u8;
            std::ptr::copy_nonoverlapping(value.as_ptr(), data, len);
            *data.add(len) = 0;
            data
        };

        Self {
            repr: [capacity | Self::LONG_FLAG, len, data as usize],
        }
    }

    fn is_long(&self) -> bool {
        self.repr[0] & Self::LONG_FLAG != 0
    }

    pub fn as_str(&self) -> Option<&str> {
        let bytes = if self.is_long() {
            let data = self.repr[2] as *const u8;
            if data.is_null() {
                return None;
            }
            unsafe { std::slice::from_raw_parts(data, self.repr[1]) }
        } else {
            let raw: &[u8] = unsafe {
                std::slice::from_raw_parts(self.repr.as_ptr() as *const u8, 24)
            };
            let len = (raw[0] >> 1) as usize;
            if len > 22 {
                return None;
            }
            &raw[1..1 + len]
        };
        std::str::from_utf8(bytes).ok()
    }
}

#[repr(C)]
pub struct CxxVector<T> {
    begin: *mut T,
    end: *mut T,
    cap_end: *mut T,
}

impl<T> CxxVector<T> {
    pub fn as_slice(&self) -> &[T] {
        if self.begin.is_null() {
            return &[];
        }
        let len = unsafe { self.end.offset_from(self.begin) };
        if len <= 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.begin, len as usize) }
    }

    /// Points the vector at a fresh malloc'd buffer holding `items`. The
    /// previous buffer is deliberately leaked: it belongs to the linker's
    /// allocator and freeing it from here would be worse than the one-time
    /// leak.
    pub fn overwrite(&mut self, items: Vec<T>) {
        let len = items.len();
        let buffer = unsafe {
            let buffer = libc::malloc(len * std::mem::size_of::<T>()) as *mut T;
            for (index, item) in items.into_iter().enumerate() {
                std::ptr::write(buffer.add(index), item);
            }
            buffer
        };

        self.begin = buffer;
        self.end = unsafe { buffer.add(len) };
        self.cap_end = self.end;
    }
}

/// `std::unordered_map<uintptr_t, soinfo*>`, reduced to what iteration
/// needs: the head of the intrusive node list.
#[repr(C)]
pub struct CxxUnorderedMap {
    bucket_list: *mut usize,
    bucket_count: usize,
    first_node: *mut HashNode,
    size: usize,
    max_load_factor: f32,
}

#[repr(C)]
pub struct HashNode {
    next: *mut HashNode,
    hash: usize,
    key: usize,
    value: *mut c_void,
}

impl CxxUnorderedMap {
    pub fn iter(&self) -> impl Iterator<Item = (usize, *mut c_void)> + '_ {
        MapIter {
            node: self.first_node,
            _map: self,
        }
    }
}

struct MapIter<'a> {
    node: *mut HashNode,
    _map: &'a CxxUnorderedMap,
}

impl Iterator for MapIter<'_> {
    type Item = (usize, *mut c_void);

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }
        let node = unsafe { &*self.node };
        self.node = node.next;
        Some((node.key, node.value))
    }
}
