//! Shared byte storage standing in for CPU-visible GPU memory.
//!
//! One `Pages` instance backs each managed aperture (VRAM, the translated
//! AGP aperture, the private fixed pool); unmanaged system buffers get a
//! private instance sized to the object. Blit engines and memcpy moves both
//! address memory through `(Arc<Pages>, offset)` spans.

use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct Pages {
    bytes: Mutex<Vec<u8>>,
}

impl Pages {
    pub fn new(size: u64) -> Arc<Pages> {
        Arc::new(Pages {
            bytes: Mutex::new(vec![0; size as usize]),
        })
    }

    pub fn len(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    /// Copy `len` bytes between two spans, which may share the same
    /// underlying storage.
    pub fn copy(src: &Pages, src_offset: u64, dst: &Pages, dst_offset: u64, len: u64) {
        if std::ptr::eq(src, dst) {
            let mut bytes = src.bytes.lock().unwrap();
            bytes.copy_within(
                src_offset as usize..(src_offset + len) as usize,
                dst_offset as usize,
            );
            return;
        }
        let src_bytes = src.bytes.lock().unwrap();
        let mut dst_bytes = dst.bytes.lock().unwrap();
        let s = src_offset as usize;
        let d = dst_offset as usize;
        dst_bytes[d..d + len as usize].copy_from_slice(&src_bytes[s..s + len as usize]);
    }

    pub fn fill(&self, offset: u64, len: u64, value: u8) {
        let mut bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        bytes[start..start + len as usize].fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let pages = Pages::new(0x100);
        pages.write(0x10, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        pages.read(0x10, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn cross_instance_copy() {
        let a = Pages::new(0x40);
        let b = Pages::new(0x40);
        a.fill(0, 0x40, 0xaa);
        Pages::copy(&a, 0x10, &b, 0x20, 0x10);
        let mut buf = [0u8; 0x10];
        b.read(0x20, &mut buf);
        assert!(buf.iter().all(|&x| x == 0xaa));
    }

    #[test]
    fn same_instance_copy_handles_overlap() {
        let pages = Pages::new(0x20);
        pages.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        Pages::copy(&pages, 0, &pages, 2, 8);
        let mut buf = [0u8; 8];
        pages.read(2, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
