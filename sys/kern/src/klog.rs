// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel debug logging.
//!
//! `klog!` formats into a small stack buffer and hands the result to the
//! board's IRQ-safe log sink. It compiles to nothing unless the `klog`
//! feature is enabled, so liberally sprinkled log statements cost no text in
//! production images.

#[cfg(feature = "klog")]
macro_rules! klog {
    ($($x:tt)*) => {{
        use core::fmt::Write;
        let mut buf = $crate::klog::LineBuf::new();
        write!(buf, $($x)*).ok();
        $crate::fail::irq_error_log(buf.as_str());
    }};
}

#[cfg(not(feature = "klog"))]
macro_rules! klog {
    ($($x:tt)*) => {{
        // Evaluate nothing; keep the arguments syntactically checked.
        if false {
            let _ = format_args!($($x)*);
        }
    }};
}

/// Fixed-capacity line buffer used by `klog!`. Output past the capacity is
/// silently truncated; a partial log line beats a kernel that allocates
/// while logging.
#[cfg(feature = "klog")]
pub struct LineBuf {
    buf: [u8; 128],
    len: usize,
}

#[cfg(feature = "klog")]
impl LineBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; 128],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // Safety: we only ever append whole UTF-8 encoded strs below.
        unsafe { core::str::from_utf8_unchecked(&self.buf[..self.len]) }
    }
}

#[cfg(feature = "klog")]
impl core::fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        // Only copy whole characters so as_str stays valid UTF-8.
        let n = if n < s.len() {
            let mut n = n;
            while n > 0 && !s.is_char_boundary(n) {
                n -= 1;
            }
            n
        } else {
            n
        };
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}
