/* Copyright (C) 2017-2022 by Jacob Alexander
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to deal
 * in the Software without restriction, including without limitation the rights
 * to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
 * copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
 * OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
 * THE SOFTWARE.
 */

//! Very Long Payload (VLP) fragmentation
//!
//! A logical VLP message is a run of frames sharing one HID++ header,
//! each followed by a control byte:
//!
//! ```c
//! struct Vlp_Control {
//!    uint8_t begin:1;
//!    uint8_t end:1;
//!    uint8_t ack:1;
//!    uint8_t reserved:1;
//!    uint8_t sequence_number:4;
//! };
//! ```

// ----- Crates -----

use crate::{warn, Frame, Header, HidppParseError, HEADER_LEN, MAX_FRAME_LEN, VLP_HEADER_LEN};
use alloc::vec::Vec;

// ----- Enumerations -----

/// Result of feeding one fragment to the reassembler
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Reassembly {
    /// More fragments are needed
    Incomplete,
    /// Logical message payload
    Complete(Vec<u8>),
    /// Sequence broken, the partial message was discarded
    Gap { expected: u8, got: u8 },
    /// A begin frame discarded the partial message and started a new one
    ///
    /// `complete` holds the new message when the begin frame also ended it.
    Interrupted {
        expected: u8,
        got: u8,
        complete: Option<Vec<u8>>,
    },
    /// Fragment acknowledgement (ack set, no data)
    Ack { sequence_number: u8 },
}

// ----- Structs -----

/// VLP control byte
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct Control {
    pub begin: bool,
    pub end: bool,
    pub ack: bool,
    pub reserved: bool,
    pub sequence_number: u8,
}

impl Control {
    /// Control byte of a message that fits one frame
    pub const fn single() -> Control {
        Control {
            begin: true,
            end: true,
            ack: false,
            reserved: false,
            sequence_number: 0,
        }
    }
}

impl From<u8> for Control {
    fn from(byte: u8) -> Self {
        Control {
            begin: byte & 0x80 != 0,
            end: byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            reserved: byte & 0x10 != 0,
            sequence_number: byte & 0x0F,
        }
    }
}

impl From<Control> for u8 {
    fn from(control: Control) -> Self {
        (control.begin as u8) << 7
            | (control.end as u8) << 6
            | (control.ack as u8) << 5
            | (control.reserved as u8) << 4
            | (control.sequence_number & 0x0F)
    }
}

/// Per-stream reassembly state
///
/// # Remarks
/// One reassembler is kept per (device, feature, function, software id).
/// Payload concatenation is strict byte concatenation.
#[derive(Clone, Debug, Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

#[derive(Clone, Debug)]
struct Partial {
    next_seq: u8,
    data: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler {
            ..Default::default()
        }
    }

    /// True while a message is partially received
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Drops any partial message
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feeds a fragment (control byte + the data following it)
    pub fn push(&mut self, control: Control, data: &[u8]) -> Reassembly {
        if control.ack && !control.begin && !control.end && data.is_empty() {
            return Reassembly::Ack {
                sequence_number: control.sequence_number,
            };
        }

        if control.begin {
            let interrupted = self.partial.take().map(|partial| partial.next_seq);

            if control.sequence_number != 0 {
                warn!(
                    "VLP begin with sequence number {}",
                    control.sequence_number
                );
                return Reassembly::Gap {
                    expected: interrupted.unwrap_or(0),
                    got: control.sequence_number,
                };
            }

            let complete = if control.end {
                Some(data.to_vec())
            } else {
                self.partial = Some(Partial {
                    next_seq: 1,
                    data: data.to_vec(),
                });
                None
            };

            return match (interrupted, complete) {
                (Some(expected), complete) => {
                    warn!("VLP begin while expecting seq {}", expected);
                    Reassembly::Interrupted {
                        expected,
                        got: control.sequence_number,
                        complete,
                    }
                }
                (None, Some(payload)) => Reassembly::Complete(payload),
                (None, None) => Reassembly::Incomplete,
            };
        }

        let mut partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                warn!(
                    "VLP fragment seq {} without a begin frame",
                    control.sequence_number
                );
                return Reassembly::Gap {
                    expected: 0,
                    got: control.sequence_number,
                };
            }
        };

        if control.sequence_number != partial.next_seq {
            warn!(
                "VLP gap: expected seq {} got {}",
                partial.next_seq, control.sequence_number
            );
            return Reassembly::Gap {
                expected: partial.next_seq,
                got: control.sequence_number,
            };
        }

        partial.data.extend_from_slice(data);
        if control.end {
            return Reassembly::Complete(partial.data);
        }

        partial.next_seq = (partial.next_seq + 1) % 16;
        self.partial = Some(partial);
        Reassembly::Incomplete
    }
}

// ----- Functions -----

/// Determines the control byte of a VLP frame
pub fn control(frame: &[u8]) -> Result<Control, HidppParseError> {
    match frame.get(HEADER_LEN) {
        Some(byte) => Ok(Control::from(*byte)),
        None => Err(HidppParseError::MalformedFrame {
            report_id: frame.first().copied().unwrap_or(0),
            len: frame.len(),
            expected: VLP_HEADER_LEN,
        }),
    }
}

/// Splits a logical message into VLP frames
///
/// # Arguments
/// * `header` - HID++ header shared by every fragment
/// * `payload` - Logical message bytes
/// * `frame_len` - Largest frame the transport accepts (header included)
/// * `ack` - Ask the device to acknowledge each fragment
pub fn fragment(
    header: Header,
    payload: &[u8],
    frame_len: usize,
    ack: bool,
) -> Result<Vec<Frame>, HidppParseError> {
    if frame_len <= VLP_HEADER_LEN || frame_len > MAX_FRAME_LEN {
        return Err(HidppParseError::FrameTooLong(frame_len));
    }

    let chunk_len = frame_len - VLP_HEADER_LEN;
    let chunks: Vec<&[u8]> = if payload.is_empty() {
        alloc::vec![&payload[..]]
    } else {
        payload.chunks(chunk_len).collect()
    };
    let last = chunks.len() - 1;

    let mut frames = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.into_iter().enumerate() {
        let control = Control {
            begin: idx == 0,
            end: idx == last,
            ack,
            reserved: false,
            sequence_number: (idx % 16) as u8,
        };

        let mut frame = Frame::new();
        frame
            .resize_default(HEADER_LEN)
            .map_err(|_| HidppParseError::VecAddFailed)?;
        header.write(&mut frame);
        frame
            .push(control.into())
            .map_err(|_| HidppParseError::VecAddFailed)?;
        frame
            .extend_from_slice(chunk)
            .map_err(|_| HidppParseError::VecAddFailed)?;
        frames.push(frame);
    }

    Ok(frames)
}

// ----- Tests -----

#[cfg(test)]
mod test {
    use super::*;
    use crate::ReportId;

    fn ctl(begin: bool, end: bool, seq: u8) -> Control {
        Control {
            begin,
            end,
            ack: false,
            reserved: false,
            sequence_number: seq,
        }
    }

    #[test]
    fn control_byte_layout() {
        let control = Control {
            begin: true,
            end: false,
            ack: true,
            reserved: false,
            sequence_number: 0xA,
        };
        assert_eq!(u8::from(control), 0xAA);
        assert_eq!(Control::from(0xAA), control);
        assert_eq!(u8::from(Control::single()), 0xC0);
    }

    #[test]
    fn three_fragments() {
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.push(ctl(true, false, 0), &[0xAA]), Reassembly::Incomplete);
        assert_eq!(reassembler.push(ctl(false, false, 1), &[0xBB]), Reassembly::Incomplete);
        assert_eq!(
            reassembler.push(ctl(false, true, 2), &[0xCC]),
            Reassembly::Complete(alloc::vec![0xAA, 0xBB, 0xCC])
        );
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn dropped_middle_fragment() {
        let mut reassembler = Reassembler::new();
        reassembler.push(ctl(true, false, 0), &[0xAA]);
        assert_eq!(
            reassembler.push(ctl(false, true, 2), &[0xCC]),
            Reassembly::Gap {
                expected: 1,
                got: 2
            }
        );
        // Nothing left to complete, next continuation is rejected too
        assert!(!reassembler.in_progress());
        assert!(matches!(
            reassembler.push(ctl(false, true, 3), &[0xDD]),
            Reassembly::Gap { expected: 0, .. }
        ));

        // A fresh begin recovers
        assert_eq!(
            reassembler.push(ctl(true, true, 0), &[0x01]),
            Reassembly::Complete(alloc::vec![0x01])
        );
    }

    #[test]
    fn begin_interrupts_partial() {
        let mut reassembler = Reassembler::new();
        reassembler.push(ctl(true, false, 0), &[0x11]);
        reassembler.push(ctl(false, false, 1), &[0x22]);
        assert_eq!(
            reassembler.push(ctl(true, false, 0), &[0xAA]),
            Reassembly::Interrupted {
                expected: 2,
                got: 0,
                complete: None
            }
        );
        assert!(reassembler.in_progress());
        assert_eq!(reassembler.push(ctl(false, false, 1), &[0xBB]), Reassembly::Incomplete);
        assert_eq!(
            reassembler.push(ctl(false, true, 2), &[0xCC]),
            Reassembly::Complete(alloc::vec![0xAA, 0xBB, 0xCC])
        );
    }

    #[test]
    fn single_frame_interrupts_partial() {
        let mut reassembler = Reassembler::new();
        reassembler.push(ctl(true, false, 0), &[0x11]);
        assert_eq!(
            reassembler.push(ctl(true, true, 0), &[0xAA]),
            Reassembly::Interrupted {
                expected: 1,
                got: 0,
                complete: Some(alloc::vec![0xAA])
            }
        );
        assert!(!reassembler.in_progress());
    }

    #[test]
    fn sequence_wraps() {
        let mut reassembler = Reassembler::new();
        reassembler.push(ctl(true, false, 0), &[0]);
        for idx in 1..20u8 {
            assert_eq!(
                reassembler.push(ctl(false, false, idx % 16), &[idx]),
                Reassembly::Incomplete
            );
        }
        let expected: Vec<u8> = (0..21u8).collect();
        assert_eq!(
            reassembler.push(ctl(false, true, 20 % 16), &[20]),
            Reassembly::Complete(expected)
        );
    }

    #[test]
    fn fragment_then_reassemble() {
        let header = Header::new(ReportId::VlpNormal, 0x01, 0x03, 0x2, 0x5);
        let payload: Vec<u8> = (0..40u8).collect();
        let frames = fragment(header, &payload, 16, false).unwrap();
        // 11 data bytes per frame
        assert_eq!(frames.len(), 4);
        assert_eq!(&frames[0][..5], &[0x13, 0x01, 0x03, 0x25, 0x80]);
        assert_eq!(frames[3][4], 0x43);

        let mut reassembler = Reassembler::new();
        let mut result = Reassembly::Incomplete;
        for frame in &frames {
            result = reassembler.push(control(frame).unwrap(), &frame[VLP_HEADER_LEN..]);
        }
        assert_eq!(result, Reassembly::Complete(payload));
    }
}
