// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decodes short synthetic streams through the public API.

use cros_h264_dpb::codec::h264::dpb::DpbError;
use cros_h264_dpb::codec::h264::header::Mmco;
use cros_h264_dpb::codec::h264::header::RefPicMarking;
use cros_h264_dpb::codec::h264::params::BitstreamRestriction;
use cros_h264_dpb::codec::h264::params::Level;
use cros_h264_dpb::codec::h264::params::SequenceParams;
use cros_h264_dpb::codec::h264::picture::Reference;
use cros_h264_dpb::decoder::DecodeError;
use cros_h264_dpb::decoder::PictureDecoder;
use cros_h264_dpb::decoder::PictureParams;
use cros_h264_dpb::decoder::StreamDecoder;
use cros_h264_dpb::frame_pool::HeapFrame;
use cros_h264_dpb::frame_pool::HeapFrameAllocator;
use cros_h264_dpb::frame_pool::MB_SIZE_BYTES;

/// Stamps each picture with its external id and remembers the references it was given.
#[derive(Default)]
struct StampingBackend {
    refs: Vec<Vec<Option<u8>>>,
}

impl PictureDecoder<HeapFrame> for StampingBackend {
    fn decode_picture(
        &mut self,
        picture: &PictureParams,
        target: &HeapFrame,
        ref_pic_list0: &[Option<&HeapFrame>],
    ) -> anyhow::Result<u32> {
        self.refs.push(
            ref_pic_list0
                .iter()
                .map(|r| r.map(|frame| frame.data()[0]))
                .collect(),
        );
        target.data_mut()[0] = picture.external_id as u8;

        Ok(0)
    }
}

type Decoder = StreamDecoder<HeapFrameAllocator, StampingBackend>;

fn sequence() -> SequenceParams {
    SequenceParams {
        profile_idc: 100,
        level_idc: Level::L1,
        pic_width_in_mbs: 1,
        pic_height_in_mbs: 1,
        max_num_ref_frames: 2,
        gaps_in_frame_num_value_allowed_flag: true,
        bitstream_restriction: Some(BitstreamRestriction {
            max_num_reorder_frames: 2,
            max_dec_frame_buffering: 3,
        }),
        ..Default::default()
    }
}

fn picture(
    external_id: u32,
    marking: Option<RefPicMarking>,
    frame_num: u32,
    pic_order_cnt: i32,
) -> PictureParams {
    PictureParams {
        frame_num,
        pic_order_cnt,
        idr: external_id == 0,
        nal_ref_idc: if marking.is_some() { 1 } else { 0 },
        dec_ref_pic_marking: marking.unwrap_or_default(),
        external_id,
        ..Default::default()
    }
}

fn sliding() -> Option<RefPicMarking> {
    Some(RefPicMarking::sliding_window())
}

fn drain(decoder: &mut Decoder) -> Vec<u32> {
    std::iter::from_fn(|| decoder.next_output())
        .map(|o| o.external_id)
        .collect()
}

fn new_decoder() -> Decoder {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut decoder = StreamDecoder::new(HeapFrameAllocator::new(), Default::default(), false);
    decoder.activate_sequence(&sequence()).unwrap();
    decoder
}

#[test]
fn gap_recovery() {
    let mut decoder = new_decoder();
    let mut out = vec![];

    for p in [
        picture(0, sliding(), 0, 0),
        picture(1, sliding(), 1, 6),
        picture(2, None, 2, 2),
        picture(3, None, 2, 4),
        picture(4, sliding(), 2, 12),
        // frame_num 3 and 4 are lost.
        picture(5, sliding(), 5, 24),
    ] {
        decoder.decode(&p).unwrap();
        out.extend(drain(&mut decoder));

        let dpb = decoder.dpb();
        assert!(dpb.num_ref_frames() <= dpb.max_ref_frames());
        assert!(dpb.fullness() <= dpb.dpb_size());
    }

    let non_existing: Vec<_> = decoder
        .dpb()
        .pictures()
        .filter(|p| p.reference == Reference::NonExisting)
        .map(|p| p.frame_num)
        .collect();
    assert_eq!(non_existing, vec![4]);

    // Non-existing frames are never handed out as references.
    assert_eq!(decoder.backend().refs.last(), Some(&vec![None]));

    decoder.flush();
    out.extend(drain(&mut decoder));
    assert_eq!(out, vec![0, 2, 3, 1, 4, 5]);
}

#[test]
fn memory_management_reset() {
    let mut decoder = new_decoder();
    let mut out = vec![];

    decoder.decode(&picture(0, sliding(), 0, 0)).unwrap();
    decoder.decode(&picture(1, sliding(), 1, 4)).unwrap();
    out.extend(drain(&mut decoder));
    assert!(out.is_empty());

    let reset = Some(RefPicMarking::adaptive(vec![Mmco::MarkAllUnused]));
    decoder.decode(&picture(2, reset, 2, 8)).unwrap();
    out.extend(drain(&mut decoder));
    assert_eq!(out, vec![0, 1]);
    assert!(decoder.dpb().last_contains_mmco5());
    assert_eq!(decoder.dpb().num_ref_frames(), 1);
    assert_eq!(decoder.dpb().prev_ref_frame_num(), 0);

    // frame_num restarts after the reset.
    decoder.decode(&picture(3, sliding(), 1, 4)).unwrap();
    assert_eq!(decoder.backend().refs.last(), Some(&vec![Some(2)]));

    decoder.flush();
    out.extend(drain(&mut decoder));
    assert_eq!(out, vec![0, 1, 2, 3]);
}

#[test]
fn long_term_reference_survives_sliding_window() {
    let mut decoder = new_decoder();

    let long_term = Some(RefPicMarking {
        long_term_reference_flag: true,
        ..Default::default()
    });
    decoder.decode(&picture(0, long_term, 0, 0)).unwrap();
    for frame_num in 1..6 {
        decoder
            .decode(&picture(frame_num, sliding(), frame_num, 2 * frame_num as i32))
            .unwrap();
        assert_eq!(
            decoder.backend().refs.last().and_then(|r| r.first().copied()),
            Some(Some((frame_num - 1) as u8))
        );
    }

    let refs: Vec<_> = decoder
        .dpb()
        .pictures()
        .filter(|p| p.reference.is_ref())
        .map(|p| (p.frame_num, p.reference))
        .collect();
    assert_eq!(
        refs,
        vec![(5, Reference::ShortTerm), (0, Reference::LongTerm)]
    );
}

#[test]
fn allocation_failure() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Four frames are needed: three for the DPB and one to decode into.
    let allocator = HeapFrameAllocator::with_budget(3 * MB_SIZE_BYTES);
    let mut decoder = StreamDecoder::new(allocator, StampingBackend::default(), false);

    assert!(matches!(
        decoder.activate_sequence(&sequence()),
        Err(DecodeError::Dpb(DpbError::Allocation(_)))
    ));
    assert!(!decoder.dpb().is_initialized());
    assert!(matches!(
        decoder.decode(&picture(0, sliding(), 0, 0)),
        Err(DecodeError::NoActiveSequence)
    ));
}
