#![no_main]

use cros_h264_dpb::codec::h264::header::Mmco;
use cros_h264_dpb::codec::h264::header::ModificationOfPicNums;
use cros_h264_dpb::codec::h264::header::RefPicListModification;
use cros_h264_dpb::codec::h264::header::RefPicMarking;
use cros_h264_dpb::codec::h264::params::BitstreamRestriction;
use cros_h264_dpb::codec::h264::params::Level;
use cros_h264_dpb::codec::h264::params::SequenceParams;
use cros_h264_dpb::decoder::PictureDecoder;
use cros_h264_dpb::decoder::PictureParams;
use cros_h264_dpb::decoder::StreamDecoder;
use cros_h264_dpb::frame_pool::HeapFrame;
use cros_h264_dpb::frame_pool::HeapFrameAllocator;
use libfuzzer_sys::fuzz_target;

struct NullBackend;

impl PictureDecoder<HeapFrame> for NullBackend {
    fn decode_picture(
        &mut self,
        _: &PictureParams,
        _: &HeapFrame,
        _: &[Option<&HeapFrame>],
    ) -> anyhow::Result<u32> {
        Ok(0)
    }
}

fn picture(chunk: &[u8], external_id: u32) -> PictureParams {
    let kind = chunk[0] % 4;
    let mut picture = PictureParams {
        frame_num: u32::from(chunk[1] % 16),
        pic_order_cnt: i32::from(chunk[2] as i8),
        idr: kind == 0,
        nal_ref_idc: if kind == 3 { 0 } else { 1 },
        num_ref_idx_l0_active_minus1: chunk[5] % 16,
        external_id,
        ..Default::default()
    };

    if kind == 2 {
        let mmco = Mmco::from_syntax(
            u32::from(chunk[3] % 7),
            u32::from(chunk[4] % 16),
            u32::from(chunk[4] % 4),
            u32::from(chunk[4] % 4),
            u32::from(chunk[4] % 5),
        );
        if let Ok(mmco) = mmco {
            picture.dec_ref_pic_marking = RefPicMarking::adaptive(mmco.into_iter().collect());
        }
    }

    if let Ok(modification) =
        ModificationOfPicNums::from_syntax(u32::from(chunk[3] >> 6), u32::from(chunk[4]))
    {
        picture.ref_pic_list_modification = RefPicListModification::new(vec![modification]);
    }

    picture
}

fuzz_target!(|data: &[u8]| {
    let Some((header, pictures)) = data.split_first() else {
        return;
    };

    let seq = SequenceParams {
        profile_idc: 100,
        level_idc: Level::L1,
        pic_width_in_mbs: 1,
        pic_height_in_mbs: 1,
        max_num_ref_frames: u32::from(header % 4) + 1,
        gaps_in_frame_num_value_allowed_flag: header & 0x10 != 0,
        bitstream_restriction: Some(BitstreamRestriction {
            max_num_reorder_frames: u32::from(header >> 5),
            max_dec_frame_buffering: 4,
        }),
        ..Default::default()
    };

    let mut decoder = StreamDecoder::new(HeapFrameAllocator::new(), NullBackend, header & 0x08 != 0);
    if decoder.activate_sequence(&seq).is_err() {
        return;
    }

    for (external_id, chunk) in pictures.chunks_exact(6).enumerate() {
        let _ = decoder.decode(&picture(chunk, external_id as u32));

        let dpb = decoder.dpb();
        assert!(dpb.num_ref_frames() <= dpb.max_ref_frames());
        assert!(dpb.fullness() <= dpb.dpb_size());

        while decoder.next_output().is_some() {}
    }

    decoder.flush();
    while decoder.next_output().is_some() {}
});
