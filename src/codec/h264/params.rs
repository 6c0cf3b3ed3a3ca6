// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sequence-level parameters that size the DPB.

use enumn::N;

use crate::codec::h264::dpb::DpbError;

/// The maximum number of pictures in the DPB, as per A.3.1, clause h)
pub const DPB_MAX_SIZE: usize = 16;

/// The maximum number of reference pictures a sequence can declare.
pub const MAX_NUM_REF_FRAMES: usize = 16;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    #[default]
    L1 = 10,
    L1B = 9,
    L1_1 = 11,
    L1_2 = 12,
    L1_3 = 13,
    L2_0 = 20,
    L2_1 = 21,
    L2_2 = 22,
    L3 = 30,
    L3_1 = 31,
    L3_2 = 32,
    L4 = 40,
    L4_1 = 41,
    L4_2 = 42,
    L5 = 50,
    L5_1 = 51,
    L5_2 = 52,
    L6 = 60,
    L6_1 = 61,
    L6_2 = 62,
}

impl Level {
    /// MaxDpbMbs as per Table A-1.
    pub fn max_dpb_mbs(self) -> u32 {
        match self {
            Level::L1 => 396,
            Level::L1B => 396,
            Level::L1_1 => 900,
            Level::L1_2 => 2376,
            Level::L1_3 => 2376,
            Level::L2_0 => 2376,
            Level::L2_1 => 4752,
            Level::L2_2 => 8100,
            Level::L3 => 8100,
            Level::L3_1 => 18000,
            Level::L3_2 => 20480,
            Level::L4 => 32768,
            Level::L4_1 => 32768,
            Level::L4_2 => 34816,
            Level::L5 => 110400,
            Level::L5_1 => 184320,
            Level::L5_2 => 184320,
            Level::L6 => 696320,
            Level::L6_1 => 696320,
            Level::L6_2 => 696320,
        }
    }
}

/// The `bitstream_restriction_flag` part of the VUI.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitstreamRestriction {
    /// Indicates an upper bound for the number of frames that precede any
    /// frame in decoding order and follow it in output order.
    pub max_num_reorder_frames: u32,
    /// Specifies the required size of the HRD decoded picture buffer in units
    /// of frame buffers.
    pub max_dec_frame_buffering: u32,
}

/// The subset of a sequence parameter set the DPB depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SequenceParams {
    /// Profile to which the coded video sequence conforms
    pub profile_idc: u8,
    pub level_idc: Level,
    /// Retains the same meaning as in the specification. See 7.4.2.1.1
    pub constraint_set3_flag: bool,
    pub pic_width_in_mbs: u32,
    pub pic_height_in_mbs: u32,
    /// Maximum number of short-term and long-term reference frames.
    pub max_num_ref_frames: u32,
    /// `MaxFrameNum` is `2 ^ (log2_max_frame_num_minus4 + 4)`.
    pub log2_max_frame_num_minus4: u8,
    /// Whether gaps in `frame_num` are to be filled with "non-existing" frames.
    pub gaps_in_frame_num_value_allowed_flag: bool,
    /// Present when the VUI carries `bitstream_restriction_flag`.
    pub bitstream_restriction: Option<BitstreamRestriction>,
}

impl SequenceParams {
    /// Same as MaxFrameNum. See 7-10 in the specification. `None` if it does not fit in 32 bits.
    pub fn max_frame_num(&self) -> Option<u32> {
        1u32.checked_shl(u32::from(self.log2_max_frame_num_minus4) + 4)
    }

    /// `None` on overflow.
    pub fn pic_size_in_mbs(&self) -> Option<u32> {
        self.pic_width_in_mbs.checked_mul(self.pic_height_in_mbs)
    }

    /// The level used for the DPB limits, taking Level 1b into account.
    fn effective_level(&self) -> Level {
        // A.3.1 and A.3.2: Level 1b for Baseline, Constrained Baseline and Main
        // profile if level_idc == 11 and constraint_set3_flag == 1
        if matches!(self.level_idc, Level::L1_1)
            && (self.profile_idc == Profile::Baseline as u8
                || self.profile_idc == Profile::Main as u8)
            && self.constraint_set3_flag
        {
            Level::L1B
        } else {
            self.level_idc
        }
    }

    /// Number of frame buffers allowed by the level for this picture size.
    pub fn level_dpb_frames(&self) -> usize {
        let pic_size = match self.pic_size_in_mbs() {
            Some(pic_size) if pic_size > 0 => pic_size,
            _ => return 0,
        };

        std::cmp::min(self.effective_level().max_dpb_mbs() / pic_size, DPB_MAX_SIZE as u32) as usize
    }

    /// Returns the size of the DPB in frames.
    pub fn max_dpb_frames(&self) -> Result<usize, DpbError> {
        let level_dpb_frames = self.level_dpb_frames();
        let max_dpb_frames = std::cmp::max(level_dpb_frames, self.max_num_ref_frames as usize);

        match self.bitstream_restriction {
            Some(restriction) => {
                let max_dec_frame_buffering = restriction.max_dec_frame_buffering as usize;
                if max_dec_frame_buffering > max_dpb_frames {
                    return Err(DpbError::InvalidParameters(format!(
                        "max_dec_frame_buffering {} exceeds the level limit of {} frames",
                        max_dec_frame_buffering, max_dpb_frames
                    )));
                }

                Ok(std::cmp::max(1, max_dec_frame_buffering))
            }
            None => Ok(max_dpb_frames),
        }
    }

    /// Whether the stream declares that output order always equals decoding order.
    pub fn forbids_reordering(&self) -> bool {
        matches!(
            self.bitstream_restriction,
            Some(BitstreamRestriction {
                max_num_reorder_frames: 0,
                ..
            })
        )
    }
}

/// Run-time configuration of a [`Dpb`](crate::codec::h264::dpb::Dpb).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DpbParams {
    /// Size of one picture, in macroblocks.
    pub pic_size_in_mbs: u32,
    /// Number of pictures held for reference or reordering.
    pub dpb_size: usize,
    /// Maximum number of reference frames.
    pub max_ref_frames: usize,
    /// `MaxFrameNum`, the modulus of `frame_num`.
    pub max_frame_num: u32,
    /// Output pictures in decoding order, as soon as they are decoded.
    pub no_reordering: bool,
}

impl DpbParams {
    /// Derives the DPB configuration for `seq`. `no_reordering` forces decoding-order output
    /// even if the stream does not forbid reordering.
    pub fn from_sequence(seq: &SequenceParams, no_reordering: bool) -> Result<Self, DpbError> {
        let pic_size_in_mbs = seq.pic_size_in_mbs().ok_or_else(|| {
            DpbError::InvalidParameters(format!(
                "picture size {}x{} MBs is too large",
                seq.pic_width_in_mbs, seq.pic_height_in_mbs
            ))
        })?;
        let max_frame_num = seq.max_frame_num().ok_or_else(|| {
            DpbError::InvalidParameters(format!(
                "invalid log2_max_frame_num_minus4 {}",
                seq.log2_max_frame_num_minus4
            ))
        })?;

        let params = Self {
            pic_size_in_mbs,
            dpb_size: seq.max_dpb_frames()?,
            max_ref_frames: seq.max_num_ref_frames as usize,
            max_frame_num,
            no_reordering: no_reordering || seq.forbids_reordering(),
        };

        params.validate()?;

        Ok(params)
    }

    /// Effective maximum number of reference frames. At least one reference is always kept.
    pub fn effective_max_ref_frames(&self) -> usize {
        std::cmp::max(self.max_ref_frames, 1)
    }

    /// Effective DPB size. Without reordering nothing but references needs to be stored.
    pub fn effective_dpb_size(&self) -> usize {
        if self.no_reordering {
            self.effective_max_ref_frames()
        } else {
            self.dpb_size
        }
    }

    pub fn validate(&self) -> Result<(), DpbError> {
        let invalid = |msg: String| Err(DpbError::InvalidParameters(msg));

        if self.pic_size_in_mbs == 0 {
            return invalid("picture size is zero".into());
        }

        if self.dpb_size == 0 || self.dpb_size > DPB_MAX_SIZE {
            return invalid(format!("dpb_size {} not in 1..={}", self.dpb_size, DPB_MAX_SIZE));
        }

        if self.max_ref_frames > MAX_NUM_REF_FRAMES {
            return invalid(format!(
                "max_ref_frames {} exceeds {}",
                self.max_ref_frames, MAX_NUM_REF_FRAMES
            ));
        }

        if self.effective_max_ref_frames() > self.dpb_size {
            return invalid(format!(
                "max_ref_frames {} exceeds dpb_size {}",
                self.max_ref_frames, self.dpb_size
            ));
        }

        if !self.max_frame_num.is_power_of_two() || !(16..=65536).contains(&self.max_frame_num) {
            return invalid(format!("invalid max_frame_num {}", self.max_frame_num));
        }

        Ok(())
    }
}
