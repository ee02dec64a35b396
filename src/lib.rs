// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side protocol tester for V4L2 memory-to-memory deinterlacers.
//!
//! The crate drives the two buffer queues of an M2M device (OUTPUT, carrying frames into the
//! device, and CAPTURE, carrying frames out of it) through format negotiation, MMAP buffer
//! allocation, priming and streaming, and checks that the device honours the dequeue/requeue
//! cadence of the selected deinterlacing mode.
//!
//! The layers are, from the bottom up:
//!
//! * [`device`]: the ioctl boundary, as the [`device::M2mDevice`] trait, with a real V4L2 backend
//!   and a simulated one used for testing.
//! * [`buffer`]: memory-mapped buffers and the pools holding them.
//! * [`queue`]: one direction of the device, tracking buffer ownership and dequeue sequence.
//! * [`session`]: the device and its two queues, with format negotiation and mode control.
//! * [`scheduler`]: the per-mode frame cadence.
//! * [`suite`]: the test cases built on top of all the above.

pub mod buffer;
pub mod device;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod suite;

use std::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A V4L2 pixel encoding, stored the way the kernel stores it.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(u32);

impl Fourcc {
    pub const YUYV: Fourcc = Fourcc::from_bytes(b"YUYV");
    pub const UYVY: Fourcc = Fourcc::from_bytes(b"UYVY");
    pub const NV12M: Fourcc = Fourcc::from_bytes(b"NM12");
    pub const NV21M: Fourcc = Fourcc::from_bytes(b"NM21");
    pub const NV16M: Fourcc = Fourcc::from_bytes(b"NM16");
    pub const NV61M: Fourcc = Fourcc::from_bytes(b"NM61");
    pub const YUV420M: Fourcc = Fourcc::from_bytes(b"YM12");
    /// 32-bit ARGB. Deinterlacers usually only accept YUV encodings, which makes this a handy
    /// negative test case.
    pub const ARGB32: Fourcc = Fourcc::from_bytes(b"BA24");

    pub const fn from_bytes(code: &[u8; 4]) -> Self {
        Fourcc(u32::from_le_bytes(*code))
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(s: &[u8; 4]) -> Self {
        Self::from_bytes(s)
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.0.to_le_bytes();
        let s = [c[0] as char, c[1] as char, c[2] as char, c[3] as char];
        write!(f, "{}", String::from_iter(s.iter()))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x} ({})", self.0, self)
    }
}

/// Field layout of a V4L2 frame, with the kernel's numbering.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, enumn::N)]
#[repr(u32)]
pub enum FieldOrder {
    Any = 0,
    #[default]
    None = 1,
    Top = 2,
    Bottom = 3,
    Interlaced = 4,
    SeqTb = 5,
    SeqBt = 6,
    Alternate = 7,
    InterlacedTb = 8,
    InterlacedBt = 9,
}

impl FieldOrder {
    pub fn name(&self) -> &'static str {
        match self {
            FieldOrder::Any => "V4L2_FIELD_ANY",
            FieldOrder::None => "V4L2_FIELD_NONE",
            FieldOrder::Top => "V4L2_FIELD_TOP",
            FieldOrder::Bottom => "V4L2_FIELD_BOTTOM",
            FieldOrder::Interlaced => "V4L2_FIELD_INTERLACED",
            FieldOrder::SeqTb => "V4L2_FIELD_SEQ_TB",
            FieldOrder::SeqBt => "V4L2_FIELD_SEQ_BT",
            FieldOrder::Alternate => "V4L2_FIELD_ALTERNATE",
            FieldOrder::InterlacedTb => "V4L2_FIELD_INTERLACED_TB",
            FieldOrder::InterlacedBt => "V4L2_FIELD_INTERLACED_BT",
        }
    }

    /// Whether frames with this layout carry two fields.
    pub fn is_interlaced(&self) -> bool {
        !matches!(
            self,
            FieldOrder::Any | FieldOrder::None | FieldOrder::Top | FieldOrder::Bottom
        )
    }
}

impl fmt::Display for FieldOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(Fourcc::YUYV.to_string(), "YUYV");
        assert_eq!(Fourcc::NV12M.to_string(), "NM12");
        assert_eq!(Fourcc::from(0x5659_5559).to_string(), "YUYV");
        assert_eq!(u32::from(Fourcc::from(b"BA24")), Fourcc::ARGB32.to_u32());
    }

    #[test]
    fn field_order_from_raw() {
        assert_eq!(FieldOrder::n(1), Some(FieldOrder::None));
        assert_eq!(FieldOrder::n(4), Some(FieldOrder::Interlaced));
        assert_eq!(FieldOrder::n(10), None);
        assert_eq!(FieldOrder::Interlaced.to_string(), "V4L2_FIELD_INTERLACED");
        assert!(FieldOrder::Interlaced.is_interlaced());
        assert!(!FieldOrder::None.is_interlaced());
    }
}
